//! mTLS transport proxy: terminates the client's mTLS tunnel, figures out
//! which private zone the tunnel is destined for, checks the client is on
//! that zone's access list, and splices the connection through to the
//! zone's backend.
//!
//! Grounded on `oisp-redirector::proxy::TransparentProxy` for the
//! accept-loop/stats shape and `tls_mitm::TlsMitmHandler::handle_connection`
//! for the split-stream bidirectional copy.

pub mod sni;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use ztgw_ca::CertificateAuthority;
use ztgw_core::model::normalize_query_name;
use ztgw_store::DataStore;

const COPY_BUF_LEN: usize = 65536;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("tls handshake failed: {0}")]
    Handshake(#[from] std::io::Error),

    #[error("failed to peek at tunnel payload")]
    Peek,

    #[error("no hostname could be determined for this tunnel")]
    NoHostname,

    #[error("client '{0}' is not authorized for zone '{1}'")]
    Unauthorized(String, String),

    #[error("zone '{0}' has no route to a backend")]
    NoRoute(String),

    #[error("failed to dial backend {0}:{1}: {2}")]
    Dial(String, u16, std::io::Error),

    #[error("certificate authority error: {0}")]
    Ca(#[from] ztgw_ca::CaError),
}

/// mTLS transport proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub certs_dir: PathBuf,
    pub peek_len: usize,
    pub handshake_timeout: Duration,
    pub peek_timeout: Duration,
    pub dial_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: String::new(),
            certs_dir: PathBuf::new(),
            peek_len: 8192,
            handshake_timeout: Duration::from_secs(10),
            peek_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(5),
        }
    }
}

/// Connection counters, the same `AtomicU64` shape as the teacher's
/// `ProxyStats`.
#[derive(Default)]
pub struct ProxyStats {
    pub accepted: AtomicU64,
    pub active: AtomicU64,
    pub bytes_forwarded: AtomicU64,
    pub errors: AtomicU64,
    pub unauthorized: AtomicU64,
    pub no_route: AtomicU64,
}

pub struct ProxyServer {
    store: Arc<DataStore>,
    ca: Arc<CertificateAuthority>,
    cfg: ProxyConfig,
    stats: Arc<ProxyStats>,
}

impl ProxyServer {
    pub fn new(store: Arc<DataStore>, ca: Arc<CertificateAuthority>, cfg: ProxyConfig) -> Self {
        Self {
            store,
            ca,
            cfg,
            stats: Arc::new(ProxyStats::default()),
        }
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// Bind and accept connections until the listener errors out.
    pub async fn run(self: Arc<Self>) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(&self.cfg.listen_addr).await?;
        info!(addr = %self.cfg.listen_addr, "proxy listening");

        let tls_config = self.ca.rustls_server_config()?;
        let acceptor = TlsAcceptor::from(tls_config);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "proxy accept error");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            self.stats.accepted.fetch_add(1, Ordering::Relaxed);
            let server = self.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                server.stats.active.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = server.handle_connection(stream, peer_addr, acceptor).await {
                    debug!(%peer_addr, error = %err, "proxy connection error");
                    server.stats.errors.fetch_add(1, Ordering::Relaxed);
                }
                server.stats.active.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        acceptor: TlsAcceptor,
    ) -> Result<(), ProxyError> {
        let tls_stream = timeout(self.cfg.handshake_timeout, acceptor.accept(stream))
            .await
            .map_err(|_| ProxyError::Handshake(std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timeout")))??;

        let peer_cn = {
            let (_, session) = tls_stream.get_ref();
            session
                .peer_certificates()
                .and_then(|certs| certs.first())
                .and_then(|cert| ztgw_ca::extract_cn(cert.as_ref()))
        };

        let Some(cn) = peer_cn else {
            debug!(%peer_addr, "proxy connection with no extractable client CN");
            return Ok(());
        };

        if self.store.endpoint(&cn).await.is_none() {
            debug!(%peer_addr, %cn, "proxy connection from unknown endpoint");
            return Ok(());
        }

        let (mut client_read, mut client_write) = tokio::io::split(tls_stream);

        let mut peeked = vec![0u8; self.cfg.peek_len];
        let n = timeout(self.cfg.peek_timeout, client_read.read(&mut peeked))
            .await
            .map_err(|_| ProxyError::Peek)?
            .map_err(|_| ProxyError::Peek)?;
        peeked.truncate(n);

        let hostname = self.discover_hostname(&peeked).await;
        let Some(hostname) = hostname else {
            return Err(ProxyError::NoHostname);
        };
        let name = normalize_query_name(&hostname);

        let Some(zone) = self.store.find_zone_for_name(&name).await else {
            return Err(ProxyError::NoRoute(name));
        };

        if !zone.access_list.contains(&cn) {
            self.stats.unauthorized.fetch_add(1, Ordering::Relaxed);
            return Err(ProxyError::Unauthorized(cn, zone.name));
        }

        let Some(service_cn) = zone.service_cn.as_ref() else {
            self.stats.no_route.fetch_add(1, Ordering::Relaxed);
            return Err(ProxyError::NoRoute(zone.name));
        };

        let Some(route) = self.store.route(service_cn).await else {
            self.stats.no_route.fetch_add(1, Ordering::Relaxed);
            return Err(ProxyError::NoRoute(zone.name));
        };

        let backend = timeout(self.cfg.dial_timeout, TcpStream::connect((route.host.as_str(), route.port)))
            .await
            .map_err(|_| {
                ProxyError::Dial(route.host.clone(), route.port, std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timeout"))
            })?
            .map_err(|err| ProxyError::Dial(route.host.clone(), route.port, err))?;

        let (mut backend_read, mut backend_write) = backend.into_split();

        if !peeked.is_empty() {
            backend_write.write_all(&peeked).await?;
            self.stats.bytes_forwarded.fetch_add(peeked.len() as u64, Ordering::Relaxed);
        }

        let stats = self.stats.clone();
        let outbound = async move {
            let mut buf = vec![0u8; COPY_BUF_LEN];
            loop {
                match client_read.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        stats.bytes_forwarded.fetch_add(n as u64, Ordering::Relaxed);
                        if backend_write.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = backend_write.shutdown().await;
        };

        let stats = self.stats.clone();
        let inbound = async move {
            let mut buf = vec![0u8; COPY_BUF_LEN];
            loop {
                match backend_read.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        stats.bytes_forwarded.fetch_add(n as u64, Ordering::Relaxed);
                        if client_write.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = client_write.shutdown().await;
        };

        tokio::join!(outbound, inbound);
        debug!(%peer_addr, %cn, zone = %zone.name, "proxy tunnel closed");
        Ok(())
    }

    /// Try each hostname-discovery tier in order: an HTTP `Host:` header,
    /// then an inner TLS ClientHello's SNI, then a literal zone name the
    /// client may have sent as bare bytes anywhere in the buffer's printable
    /// prefix.
    async fn discover_hostname(&self, peeked: &[u8]) -> Option<String> {
        if let Some(host) = extract_host_header(peeked) {
            return Some(host);
        }
        if let Some(sni) = sni::extract_sni(peeked) {
            return Some(sni);
        }
        self.extract_literal_zone(peeked).await
    }

    /// Scan the buffer's printable prefix for any substring matching a known
    /// zone name, per spec §4.4 tier 3 -- the zone name need not be the
    /// entire line, just present somewhere in it.
    async fn extract_literal_zone(&self, peeked: &[u8]) -> Option<String> {
        let prefix_len = peeked.iter().take_while(|b| b.is_ascii_graphic() || **b == b' ').count();
        let text = std::str::from_utf8(&peeked[..prefix_len]).ok()?.to_ascii_lowercase();
        if text.is_empty() {
            return None;
        }

        self.store
            .list_zones()
            .await
            .into_iter()
            .map(|zone| zone.name)
            .find(|name| text.contains(name.as_str()))
    }
}

/// Parse an HTTP/1.x request line and headers out of `peeked` and return the
/// `Host:` header's value, if any.
fn extract_host_header(peeked: &[u8]) -> Option<String> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(peeked) {
        Ok(httparse::Status::Complete(_)) | Ok(httparse::Status::Partial) => req
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("host"))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .map(|v| v.trim().to_ascii_lowercase()),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::{HashMap, HashSet};
    use tokio::net::TcpListener as TestListener;
    use ztgw_core::model::{Endpoint, RecordType, Role, Route, Zone, ZoneRecord};

    async fn store_with_zone(client_cn: &str, authorize: bool, backend_addr: SocketAddr) -> Arc<DataStore> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DataStore::load(dir.path()).await.unwrap());

        store
            .create_endpoint(Endpoint {
                cn: "s1".to_string(),
                name: "svc".to_string(),
                role: Role::Service,
                platform: "linux".to_string(),
                created_at: Utc::now(),
                domains: vec!["db.internal.corp".to_string()],
            })
            .await
            .unwrap();
        store
            .create_route(Route {
                service_cn: "s1".to_string(),
                host: backend_addr.ip().to_string(),
                port: backend_addr.port(),
                domains: vec!["db.internal.corp".to_string()],
                name: "db".to_string(),
            })
            .await
            .unwrap();

        let mut records = HashMap::new();
        records.insert(
            "@".to_string(),
            vec![ZoneRecord {
                record_type: RecordType::A,
                value: backend_addr.ip().to_string(),
            }],
        );
        store
            .create_zone(Zone {
                name: "db.internal.corp".to_string(),
                records,
                service_cn: Some("s1".to_string()),
                access_list: HashSet::new(),
            })
            .await
            .unwrap();

        store
            .create_endpoint(Endpoint {
                cn: client_cn.to_string(),
                name: "client".to_string(),
                role: Role::Client,
                platform: "linux".to_string(),
                created_at: Utc::now(),
                domains: vec![],
            })
            .await
            .unwrap();

        if authorize {
            store.authorize("db.internal.corp", client_cn).await.unwrap();
        }

        store
    }

    fn test_server(store: Arc<DataStore>) -> ProxyServer {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(ztgw_ca::CertificateAuthority::bootstrap(dir.path()).unwrap());
        ProxyServer::new(
            store,
            ca,
            ProxyConfig {
                listen_addr: "127.0.0.1:0".to_string(),
                certs_dir: dir.path().to_path_buf(),
                ..ProxyConfig::default()
            },
        )
    }

    /// A `ProxyServer` with a loopback-valid server cert, a client
    /// `rustls::ClientConfig` presenting a credential issued by the same
    /// CA, and a data store with that client's endpoint already
    /// registered -- enough to drive a real mTLS handshake end-to-end.
    struct MtlsFixture {
        server: Arc<ProxyServer>,
        client_config: Arc<rustls::ClientConfig>,
        // Keeps the CA's cert/key files on disk alive for the fixture's
        // lifetime -- `rustls_server_config()` re-reads them from `certs_dir`.
        _ca_dir: tempfile::TempDir,
    }

    async fn mtls_fixture(authorize: bool, backend_addr: SocketAddr) -> MtlsFixture {
        let ca_dir = tempfile::tempdir().unwrap();
        let ca = ztgw_ca::CertificateAuthority::bootstrap(ca_dir.path()).unwrap();
        let loopback: std::net::IpAddr = "127.0.0.1".parse().unwrap();
        ca.ensure_server_cert(loopback).unwrap();
        let client_cred = ca.issue_endpoint(Role::Client, "alice").unwrap();

        let store = store_with_zone(&client_cred.cn, authorize, backend_addr).await;

        let server = Arc::new(ProxyServer::new(
            store,
            Arc::new(ca),
            ProxyConfig {
                listen_addr: "127.0.0.1:0".to_string(),
                certs_dir: ca_dir.path().to_path_buf(),
                ..ProxyConfig::default()
            },
        ));

        let mut roots = rustls::RootCertStore::empty();
        roots
            .add(rustls::pki_types::CertificateDer::from(server.ca.ca_cert_der().to_vec()))
            .unwrap();

        let mut cert_reader = std::io::Cursor::new(client_cred.cert_pem.as_bytes());
        let cert_chain: Vec<_> = rustls_pemfile::certs(&mut cert_reader).collect::<Result<_, _>>().unwrap();
        let mut key_reader = std::io::Cursor::new(client_cred.key_pem.as_bytes());
        let key: rustls::pki_types::PrivateKeyDer<'static> = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
            .next()
            .unwrap()
            .unwrap()
            .into();

        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(cert_chain, key)
            .unwrap();

        MtlsFixture {
            server,
            client_config: Arc::new(client_config),
            _ca_dir: ca_dir,
        }
    }

    async fn connect_tunnel(fixture: &MtlsFixture, addr: SocketAddr) -> tokio_rustls::client::TlsStream<TcpStream> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let connector = tokio_rustls::TlsConnector::from(fixture.client_config.clone());
        let server_name = rustls::pki_types::ServerName::IpAddress(std::net::Ipv4Addr::LOCALHOST.into());
        connector.connect(server_name, stream).await.unwrap()
    }

    #[tokio::test]
    async fn discovers_hostname_from_host_header() {
        let backend_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let store = store_with_zone("c1", true, backend_addr).await;
        let server = test_server(store);

        let req = b"GET / HTTP/1.1\r\nHost: db.internal.corp\r\n\r\n";
        assert_eq!(server.discover_hostname(req).await.as_deref(), Some("db.internal.corp"));
    }

    #[tokio::test]
    async fn discovers_hostname_from_literal_zone_fallback() {
        let backend_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let store = store_with_zone("c1", true, backend_addr).await;
        let server = test_server(store);

        assert_eq!(
            server.discover_hostname(b"HELLO db.internal.corp\n").await.as_deref(),
            Some("db.internal.corp")
        );
    }

    #[tokio::test]
    async fn full_tunnel_replays_peeked_bytes_and_relays_both_directions() {
        let backend = TestListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let backend_task = tokio::spawn(async move {
            let (mut sock, _) = backend.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = sock.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"GET / HTTP/1.1\r\nHost: db.internal.corp\r\n\r\n");
            sock.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
            sock.shutdown().await.unwrap();
        });

        let fixture = mtls_fixture(true, backend_addr).await;
        let listener = TestListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        let server = fixture.server.clone();
        let acceptor = TlsAcceptor::from(server.ca.rustls_server_config().unwrap());
        let accept_task = tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            server.handle_connection(stream, peer_addr, acceptor).await
        });

        let mut tunnel = connect_tunnel(&fixture, proxy_addr).await;
        tunnel
            .write_all(b"GET / HTTP/1.1\r\nHost: db.internal.corp\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        tunnel.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 200 OK\r\n\r\n");
        let _ = tunnel.shutdown().await;

        accept_task.await.unwrap().unwrap();
        backend_task.await.unwrap();
    }

    #[tokio::test]
    async fn unauthorized_client_never_reaches_the_backend() {
        let backend = TestListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let connected = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let connected_clone = connected.clone();
        let backend_task = tokio::spawn(async move {
            if backend.accept().await.is_ok() {
                connected_clone.store(true, Ordering::Relaxed);
            }
        });

        let fixture = mtls_fixture(false, backend_addr).await;
        let listener = TestListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        let server = fixture.server.clone();
        let acceptor = TlsAcceptor::from(server.ca.rustls_server_config().unwrap());
        let accept_task = tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            server.handle_connection(stream, peer_addr, acceptor).await
        });

        let mut tunnel = connect_tunnel(&fixture, proxy_addr).await;
        tunnel
            .write_all(b"GET / HTTP/1.1\r\nHost: db.internal.corp\r\n\r\n")
            .await
            .unwrap();

        let result = accept_task.await.unwrap();
        assert!(matches!(result, Err(ProxyError::Unauthorized(_, _))));

        backend_task.abort();
        assert!(!connected.load(Ordering::Relaxed));
    }
}
