//! Certificate authority for the zero-trust gateway.
//!
//! On first start this generates a self-signed CA and the gateway's own
//! server certificate. Per-endpoint credentials are issued on demand and
//! signed by the CA. The CA certificate is the sole trust anchor for both
//! mTLS listeners (DoT resolver, transport proxy).

use std::fs;
use std::io::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rsa::pkcs8::EncodePrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;
use tracing::{info, warn};
use ztgw_core::model::Role;

/// CA certificate validity, per spec §4.1.
const CA_VALIDITY_DAYS: i64 = 3650;
/// Server/endpoint leaf certificate validity, per spec §4.1.
const LEAF_VALIDITY_DAYS: i64 = 3650;
/// RSA key size used for the CA and every issued credential, per spec §4.1.
const RSA_KEY_BITS: usize = 4096;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("certificate generation failed: {0}")]
    Rcgen(#[from] rcgen::Error),
    #[error("RSA key generation failed: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("PKCS#8 encoding failed: {0}")]
    Pkcs8(#[from] rsa::pkcs8::Error),
    #[error("failed to build rustls server config: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("CA material missing or corrupt in {0}")]
    MaterialMissing(PathBuf),
}

/// Generate a fresh RSA key pair and hand it to `rcgen` as a signing key.
/// `ring` (rcgen's default backend) cannot generate RSA keys itself, so the
/// key material comes from the `RustCrypto` `rsa` crate and is imported via
/// its PKCS#8 PEM encoding, which `rcgen::KeyPair::from_pem` auto-detects.
fn generate_rsa_keypair() -> Result<KeyPair, CaError> {
    let mut rng = rand::thread_rng();
    let private_key = rsa::RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)?;
    let pem = private_key.to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)?;
    Ok(KeyPair::from_pem(&pem)?)
}

/// Credentials issued for a single endpoint: its leaf cert/key plus the CA
/// certificate needed to verify the gateway's own server cert.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub cn: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_cert_pem: String,
}

/// The gateway's certificate authority: CA material plus the current server
/// certificate bound to the gateway's external address.
pub struct CertificateAuthority {
    ca_cert: rcgen::Certificate,
    ca_keypair: KeyPair,
    ca_cert_pem: String,
    ca_cert_der: Vec<u8>,
    certs_dir: PathBuf,
}

impl CertificateAuthority {
    /// Load the CA from `certs_dir`, generating it on first start.
    pub fn bootstrap(certs_dir: &Path) -> Result<Self, CaError> {
        fs::create_dir_all(certs_dir)?;
        let ca_cert_path = certs_dir.join("ca.crt");
        let ca_key_path = certs_dir.join("ca.key");

        if ca_cert_path.exists() && ca_key_path.exists() {
            info!("loading existing CA from {}", certs_dir.display());
            Self::load(certs_dir, &ca_cert_path, &ca_key_path)
        } else {
            info!("generating new CA in {}", certs_dir.display());
            Self::create(certs_dir)
        }
    }

    fn create(certs_dir: &Path) -> Result<Self, CaError> {
        let ca_keypair = generate_rsa_keypair()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "ZeroTrust CA");
        params.distinguished_name = dn;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(CA_VALIDITY_DAYS);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca_cert = params.self_signed(&ca_keypair)?;
        let ca_cert_pem = ca_cert.pem();
        let ca_key_pem = ca_keypair.serialize_pem();

        write_restricted(&certs_dir.join("ca.crt"), ca_cert_pem.as_bytes())?;
        write_restricted(&certs_dir.join("ca.key"), ca_key_pem.as_bytes())?;

        info!("created new CA certificate in {}", certs_dir.display());

        Ok(Self {
            ca_cert_der: ca_cert.der().to_vec(),
            ca_cert,
            ca_keypair,
            ca_cert_pem,
            certs_dir: certs_dir.to_path_buf(),
        })
    }

    fn load(certs_dir: &Path, cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        let ca_cert_pem = fs::read_to_string(cert_path)
            .map_err(|_| CaError::MaterialMissing(cert_path.to_path_buf()))?;
        let ca_key_pem = fs::read_to_string(key_path)
            .map_err(|_| CaError::MaterialMissing(key_path.to_path_buf()))?;

        let ca_keypair = KeyPair::from_pem(&ca_key_pem)?;
        let ca_cert_params = CertificateParams::from_ca_cert_pem(&ca_cert_pem)?;
        let ca_cert = ca_cert_params.self_signed(&ca_keypair)?;

        Ok(Self {
            ca_cert_der: ca_cert.der().to_vec(),
            ca_cert,
            ca_keypair,
            ca_cert_pem,
            certs_dir: certs_dir.to_path_buf(),
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn ca_cert_der(&self) -> &[u8] {
        &self.ca_cert_der
    }

    /// Private-key DER of the CA, used by `ztgw-signedconfig` to sign
    /// configuration tokens.
    pub fn ca_key_der(&self) -> Vec<u8> {
        self.ca_keypair.serialize_der()
    }

    /// Regenerate the gateway's own server certificate if it is missing or
    /// its SANs don't cover `external_addr`.
    pub fn ensure_server_cert(&self, external_addr: IpAddr) -> Result<(), CaError> {
        let cert_path = self.certs_dir.join("server.crt");
        let key_path = self.certs_dir.join("server.key");

        if cert_path.exists() && key_path.exists() {
            if let Ok(pem) = fs::read_to_string(&cert_path) {
                if pem.contains(&external_addr.to_string()) {
                    return Ok(());
                }
            }
            warn!(
                "server certificate SANs stale for {}, regenerating",
                external_addr
            );
        }

        let keypair = generate_rsa_keypair()?;
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "ZeroTrust Gateway");
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::IpAddress(external_addr)];

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let cert = params.signed_by(&keypair, &self.ca_cert, &self.ca_keypair)?;

        write_restricted(&cert_path, cert.pem().as_bytes())?;
        write_restricted(&key_path, keypair.serialize_pem().as_bytes())?;
        info!("regenerated server certificate for {}", external_addr);

        Ok(())
    }

    /// Issue a fresh credential for a new endpoint. The caller (the
    /// administrative API) is responsible for making registration of the
    /// resulting CN in the data store atomic with persisting these files.
    pub fn issue_endpoint(&self, role: Role, friendly_name: &str) -> Result<IssuedCredential, CaError> {
        let cn = generate_cn(role);

        let keypair = generate_rsa_keypair()?;
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn.as_str());
        let role_str = match role {
            Role::Client => "client",
            Role::Service => "service",
        };
        dn.push(DnType::OrganizationName, format!("{role_str}-{friendly_name}"));
        params.distinguished_name = dn;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let cert = params.signed_by(&keypair, &self.ca_cert, &self.ca_keypair)?;

        let cert_path = self.certs_dir.join(format!("{cn}.crt"));
        let key_path = self.certs_dir.join(format!("{cn}.key"));
        write_restricted(&cert_path, cert.pem().as_bytes())?;
        write_restricted(&key_path, keypair.serialize_pem().as_bytes())?;

        info!(cn = %cn, role = role_str, "issued endpoint credential");

        Ok(IssuedCredential {
            cn,
            cert_pem: cert.pem(),
            key_pem: keypair.serialize_pem(),
            ca_cert_pem: self.ca_cert_pem.clone(),
        })
    }

    /// Load a previously-issued credential pair back from disk.
    pub fn load_endpoint(&self, cn: &str) -> Result<IssuedCredential, CaError> {
        let cert_path = self.certs_dir.join(format!("{cn}.crt"));
        let key_path = self.certs_dir.join(format!("{cn}.key"));
        let cert_pem = fs::read_to_string(&cert_path).map_err(|_| CaError::MaterialMissing(cert_path))?;
        let key_pem = fs::read_to_string(&key_path).map_err(|_| CaError::MaterialMissing(key_path))?;
        Ok(IssuedCredential {
            cn: cn.to_string(),
            cert_pem,
            key_pem,
            ca_cert_pem: self.ca_cert_pem.clone(),
        })
    }

    /// Build the shared rustls server config used by both the resolver and
    /// the proxy listener: server cert presented to peers, client certs
    /// required and verified against the CA pool.
    pub fn rustls_server_config(&self) -> Result<Arc<ServerConfig>, CaError> {
        let server_cert_pem = fs::read_to_string(self.certs_dir.join("server.crt"))
            .map_err(|_| CaError::MaterialMissing(self.certs_dir.join("server.crt")))?;
        let server_key_pem = fs::read_to_string(self.certs_dir.join("server.key"))
            .map_err(|_| CaError::MaterialMissing(self.certs_dir.join("server.key")))?;

        let mut cert_reader = std::io::Cursor::new(server_cert_pem.as_bytes());
        let cert_chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<_, _>>()
            .map_err(CaError::Io)?;

        let mut key_reader = std::io::Cursor::new(server_key_pem.as_bytes());
        let key: PrivateKeyDer<'static> = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
            .next()
            .ok_or_else(|| CaError::MaterialMissing(self.certs_dir.join("server.key")))?
            .map_err(CaError::Io)?
            .into();

        let mut roots = RootCertStore::empty();
        roots
            .add(CertificateDer::from(self.ca_cert_der.clone()))
            .map_err(|_| CaError::MaterialMissing(self.certs_dir.join("ca.crt")))?;
        let roots = Arc::new(roots);

        let client_verifier = WebPkiClientVerifier::builder(roots)
            .build()
            .map_err(|e| CaError::Rustls(rustls::Error::General(e.to_string())))?;

        let config = ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(cert_chain, key)?;

        Ok(Arc::new(config))
    }
}

/// Extract the Common Name from a DER-encoded peer certificate.
pub fn extract_cn(cert_der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(cert_der).ok()?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(|s| s.to_string())
}

fn generate_cn(role: Role) -> String {
    let mut suffix = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!("{}{}", role.cn_prefix(), hex::encode(suffix))
}

fn write_restricted(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bootstrap_creates_and_reloads_ca() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::bootstrap(dir.path()).unwrap();
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));

        let reloaded = CertificateAuthority::bootstrap(dir.path()).unwrap();
        assert_eq!(ca.ca_cert_pem(), reloaded.ca_cert_pem());
    }

    #[test]
    fn issued_cn_has_correct_prefix_and_length() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::bootstrap(dir.path()).unwrap();

        let client_cred = ca.issue_endpoint(Role::Client, "alice").unwrap();
        assert!(client_cred.cn.starts_with('c'));
        assert_eq!(client_cred.cn.len(), 13);

        let service_cred = ca.issue_endpoint(Role::Service, "pg-prod").unwrap();
        assert!(service_cred.cn.starts_with('s'));
    }

    #[test]
    fn ensure_server_cert_regenerates_on_address_change() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::bootstrap(dir.path()).unwrap();
        let addr: IpAddr = "203.0.113.5".parse().unwrap();
        ca.ensure_server_cert(addr).unwrap();

        let cert_pem_1 = fs::read_to_string(dir.path().join("server.crt")).unwrap();
        assert!(cert_pem_1.len() > 0);

        let other_addr: IpAddr = "203.0.113.9".parse().unwrap();
        ca.ensure_server_cert(other_addr).unwrap();
        let cert_pem_2 = fs::read_to_string(dir.path().join("server.crt")).unwrap();
        assert_ne!(cert_pem_1, cert_pem_2);
    }

    #[test]
    fn extract_cn_reads_subject_common_name() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::bootstrap(dir.path()).unwrap();
        let cred = ca.issue_endpoint(Role::Client, "alice").unwrap();

        let mut reader = std::io::Cursor::new(cred.cert_pem.as_bytes());
        let der = rustls_pemfile::certs(&mut reader)
            .next()
            .unwrap()
            .unwrap();

        let cn = extract_cn(&der).unwrap();
        assert_eq!(cn, cred.cn);
    }
}
