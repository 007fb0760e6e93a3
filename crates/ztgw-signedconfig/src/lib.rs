//! Signed configuration tokens handed to endpoints alongside their mTLS
//! credentials, so a compromised config document can't be silently edited
//! in transit.
//!
//! Grounded on the signing primitive in `sgxs-sign`: an `rsa` keypair,
//! `Pkcs1v15Sign` padding over a `sha2` digest. The enclave-signing use case
//! that crate serves is unrelated to ours, but the sign/verify pairing is
//! the same shape: a private key signs a payload hash, a holder of only the
//! public half verifies it.

use base64::prelude::*;
use chrono::{DateTime, Utc};
use rsa::pkcs1v15::Pkcs1v15Sign;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use ztgw_ca::CertificateAuthority;
use ztgw_core::model::Role;

/// Errors raised while signing or verifying a configuration token.
#[derive(Debug, Error)]
pub enum SignedConfigError {
    #[error("token is not well-formed (expected base64(payload).base64(signature))")]
    Corrupt,

    #[error("token has expired")]
    Expired,

    #[error("signature does not match payload")]
    SignatureMismatch,

    #[error("failed to (de)serialize payload: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("key material error: {0}")]
    Key(String),
}

pub type SignedConfigResult<T> = Result<T, SignedConfigError>;

/// The configuration an endpoint needs to locate and trust the gateway,
/// bundled alongside its mTLS credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigPayload {
    /// Gateway DNS-over-TLS resolver address, `host:port`.
    pub server: String,
    /// Gateway TLS transport proxy address, `host:port`.
    pub proxy: String,
    /// SNI/hostname the endpoint should present when dialing the proxy.
    pub server_name: String,
    pub kind: Role,
    pub domains: Vec<String>,
    pub expires: DateTime<Utc>,
}

/// A signed, base64-framed envelope: `base64(payload_json).base64(signature)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedToken(String);

impl SignedToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SignedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sign `payload` with the certificate authority's private key.
pub fn sign(payload: &ConfigPayload, ca: &CertificateAuthority) -> SignedConfigResult<SignedToken> {
    let payload_json = serde_json::to_vec(payload)?;

    let key_der = ca.ca_key_der();
    let private_key = RsaPrivateKey::from_pkcs8_der(&key_der)
        .map_err(|err| SignedConfigError::Key(err.to_string()))?;

    let digest = Sha256::digest(&payload_json);
    let signature = private_key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|err| SignedConfigError::Key(err.to_string()))?;

    let encoded_payload = BASE64_URL_SAFE_NO_PAD.encode(&payload_json);
    let encoded_signature = BASE64_URL_SAFE_NO_PAD.encode(&signature);
    Ok(SignedToken(format!("{encoded_payload}.{encoded_signature}")))
}

/// Verify `token` against the certificate authority's certificate, and
/// reject it if it has expired.
pub fn verify(token: &SignedToken, ca_cert_der: &[u8]) -> SignedConfigResult<ConfigPayload> {
    let (encoded_payload, encoded_signature) = token
        .0
        .split_once('.')
        .ok_or(SignedConfigError::Corrupt)?;

    let payload_json = BASE64_URL_SAFE_NO_PAD
        .decode(encoded_payload)
        .map_err(|_| SignedConfigError::Corrupt)?;
    let signature = BASE64_URL_SAFE_NO_PAD
        .decode(encoded_signature)
        .map_err(|_| SignedConfigError::Corrupt)?;

    let public_key = ca_public_key(ca_cert_der)?;
    let digest = Sha256::digest(&payload_json);
    public_key
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
        .map_err(|_| SignedConfigError::SignatureMismatch)?;

    let payload: ConfigPayload = serde_json::from_slice(&payload_json)?;
    if payload.expires < Utc::now() {
        return Err(SignedConfigError::Expired);
    }
    Ok(payload)
}

fn ca_public_key(ca_cert_der: &[u8]) -> SignedConfigResult<RsaPublicKey> {
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(ca_cert_der)
        .map_err(|err| SignedConfigError::Key(err.to_string()))?;
    let spki_der = cert.public_key().raw;
    RsaPublicKey::from_public_key_der(spki_der).map_err(|err| SignedConfigError::Key(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn payload(expires: DateTime<Utc>) -> ConfigPayload {
        ConfigPayload {
            server: "gateway.internal:853".to_string(),
            proxy: "gateway.internal:8443".to_string(),
            server_name: "gateway.internal".to_string(),
            kind: Role::Client,
            domains: vec!["db.internal.corp".to_string()],
            expires,
        }
    }

    #[test]
    fn round_trips_an_unexpired_payload() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::bootstrap(dir.path()).unwrap();

        let original = payload(Utc::now() + chrono::Duration::days(1));
        let token = sign(&original, &ca).unwrap();
        let verified = verify(&token, ca.ca_cert_der()).unwrap();

        assert_eq!(original, verified);
    }

    #[test]
    fn rejects_an_expired_payload() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::bootstrap(dir.path()).unwrap();

        let original = payload(Utc::now() - chrono::Duration::days(1));
        let token = sign(&original, &ca).unwrap();
        let err = verify(&token, ca.ca_cert_der()).unwrap_err();

        assert!(matches!(err, SignedConfigError::Expired));
    }

    #[test]
    fn rejects_a_corrupted_signature() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::bootstrap(dir.path()).unwrap();

        let original = payload(Utc::now() + chrono::Duration::days(1));
        let token = sign(&original, &ca).unwrap();
        let mut raw = token.as_str().to_string();
        raw.push('x');
        let tampered = SignedToken(raw);

        let err = verify(&tampered, ca.ca_cert_der()).unwrap_err();
        assert!(matches!(
            err,
            SignedConfigError::SignatureMismatch | SignedConfigError::Corrupt
        ));
    }

    #[test]
    fn rejects_a_tampered_payload() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::bootstrap(dir.path()).unwrap();

        let original = payload(Utc::now() + chrono::Duration::days(1));
        let token = sign(&original, &ca).unwrap();

        let (encoded_payload, encoded_signature) = token.as_str().split_once('.').unwrap();
        let mut payload_json = BASE64_URL_SAFE_NO_PAD.decode(encoded_payload).unwrap();
        // Flip a byte inside the JSON payload without touching the signature.
        let mid = payload_json.len() / 2;
        payload_json[mid] ^= 0xFF;
        let tampered = SignedToken(format!("{}.{}", BASE64_URL_SAFE_NO_PAD.encode(&payload_json), encoded_signature));

        let err = verify(&tampered, ca.ca_cert_der()).unwrap_err();
        assert!(matches!(
            err,
            SignedConfigError::SignatureMismatch | SignedConfigError::Serde(_)
        ));
    }
}
