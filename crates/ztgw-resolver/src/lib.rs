//! DNS-over-TLS resolver: terminates mTLS from authorized endpoints,
//! answers from the gateway's private zones, and forwards everything else
//! to an upstream resolver over UDP.
//!
//! Grounded on `oisp-redirector::proxy::TransparentProxy` for the
//! accept-loop/spawn-per-connection shape and its `AtomicU64` stats.

pub mod wire;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use ztgw_ca::CertificateAuthority;
use ztgw_core::model::{normalize_query_name, RecordType};
use ztgw_store::DataStore;
use wire::{Answer, Query, ResponseCode};

const MAX_MESSAGE_LEN: usize = 4096;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("tls handshake failed: {0}")]
    Handshake(#[from] std::io::Error),

    #[error("certificate authority error: {0}")]
    Ca(#[from] ztgw_ca::CaError),
}

/// DNS-over-TLS resolver configuration.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub listen_addr: String,
    pub certs_dir: PathBuf,
    pub upstream: SocketAddr,
    pub upstream_timeout: Duration,
    pub handshake_timeout: Duration,
    pub read_timeout: Duration,
}

/// Connection/query counters, the same `AtomicU64` shape as the teacher's
/// `ProxyStats`.
#[derive(Default)]
pub struct ResolverStats {
    pub connections: AtomicU64,
    pub queries: AtomicU64,
    pub refusals: AtomicU64,
    pub errors: AtomicU64,
}

pub struct ResolverServer {
    store: Arc<DataStore>,
    ca: Arc<CertificateAuthority>,
    cfg: ResolverConfig,
    stats: Arc<ResolverStats>,
}

impl ResolverServer {
    pub fn new(store: Arc<DataStore>, ca: Arc<CertificateAuthority>, cfg: ResolverConfig) -> Self {
        Self {
            store,
            ca,
            cfg,
            stats: Arc::new(ResolverStats::default()),
        }
    }

    pub fn stats(&self) -> &ResolverStats {
        &self.stats
    }

    /// Bind and accept connections until the listener errors out.
    pub async fn run(self: Arc<Self>) -> Result<(), ResolverError> {
        let listener = TcpListener::bind(&self.cfg.listen_addr).await?;
        info!(addr = %self.cfg.listen_addr, "resolver listening");

        let tls_config = self.ca.rustls_server_config()?;
        let acceptor = TlsAcceptor::from(tls_config);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "resolver accept error");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            self.stats.connections.fetch_add(1, Ordering::Relaxed);
            let server = self.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Err(err) = server.handle_connection(stream, peer_addr, acceptor).await {
                    debug!(%peer_addr, error = %err, "resolver connection error");
                    server.stats.errors.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    }

    async fn handle_connection(
        &self,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
        acceptor: TlsAcceptor,
    ) -> Result<(), std::io::Error> {
        let tls_stream = timeout(self.cfg.handshake_timeout, acceptor.accept(stream))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timeout"))??;

        let peer_cn = {
            let (_, session) = tls_stream.get_ref();
            session
                .peer_certificates()
                .and_then(|certs| certs.first())
                .and_then(|cert| ztgw_ca::extract_cn(cert.as_ref()))
        };

        let Some(cn) = peer_cn else {
            debug!(%peer_addr, "resolver connection with no extractable client CN");
            return Ok(());
        };

        if self.store.endpoint(&cn).await.is_none() {
            debug!(%peer_addr, %cn, "resolver connection from unknown endpoint");
            return Ok(());
        }

        let (mut reader, mut writer) = tokio::io::split(tls_stream);

        let mut len_buf = [0u8; 2];
        timeout(self.cfg.read_timeout, reader.read_exact(&mut len_buf)).await??;
        let msg_len = u16::from_be_bytes(len_buf) as usize;
        if msg_len == 0 || msg_len > MAX_MESSAGE_LEN {
            debug!(%peer_addr, %cn, msg_len, "resolver query exceeds maximum length");
            return Ok(());
        }

        let mut msg_buf = vec![0u8; msg_len];
        timeout(self.cfg.read_timeout, reader.read_exact(&mut msg_buf)).await??;

        self.stats.queries.fetch_add(1, Ordering::Relaxed);

        let response = match wire::parse_query(&msg_buf) {
            Ok(query) => self.resolve(&cn, query, &msg_buf).await,
            Err(_) => wire::build_header_only_error(&msg_buf, ResponseCode::FormErr),
        };

        let len = (response.len() as u16).to_be_bytes();
        writer.write_all(&len).await?;
        writer.write_all(&response).await?;
        writer.shutdown().await?;
        Ok(())
    }

    /// Resolve a single parsed query against the private zones, falling
    /// back to relaying `raw_query` to the upstream resolver verbatim when
    /// no private zone matches.
    async fn resolve(&self, cn: &str, query: Query, raw_query: &[u8]) -> Vec<u8> {
        let name = normalize_query_name(&query.name);

        let Some(zone) = self.store.find_zone_for_name(&name).await else {
            return match forward_upstream(&self.cfg.upstream, self.cfg.upstream_timeout, raw_query).await {
                Some(bytes) => bytes,
                None => wire::build_response(&query, ResponseCode::ServFail, &[]),
            };
        };

        if !zone.access_list.contains(cn) {
            self.stats.refusals.fetch_add(1, Ordering::Relaxed);
            return wire::build_response(&query, ResponseCode::Refused, &[]);
        }

        let records = match zone.lookup(&name) {
            Some(records) => records,
            None => return wire::build_response(&query, ResponseCode::NxDomain, &[]),
        };

        let answers: Vec<Answer> = records
            .iter()
            .filter_map(|record| match record.record_type {
                RecordType::A => record.value.parse().ok().map(Answer::A),
                RecordType::Cname => Some(Answer::Cname(record.value.clone())),
            })
            .collect();

        wire::build_response(&query, ResponseCode::NoError, &answers)
    }
}

/// Forward the raw (unparsed) query verbatim to the upstream resolver over
/// UDP and relay its raw response bytes back, per spec's fallback path.
async fn forward_upstream(upstream: &SocketAddr, timeout_dur: Duration, raw_query: &[u8]) -> Option<Vec<u8>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect(upstream).await.ok()?;

    timeout(timeout_dur, socket.send(raw_query)).await.ok()?.ok()?;

    let mut resp = [0u8; MAX_MESSAGE_LEN];
    let n = timeout(timeout_dur, socket.recv(&mut resp)).await.ok()?.ok()?;
    Some(resp[..n].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::{HashMap, HashSet};
    use ztgw_core::model::{Endpoint, Role, Route, Zone, ZoneRecord};

    async fn store_with_zone() -> (Arc<DataStore>, String) {
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
                host: "10.0.0.5".to_string(),
                port: 5432,
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
                value: "10.0.0.5".to_string(),
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
                cn: "c1".to_string(),
                name: "client".to_string(),
                role: Role::Client,
                platform: "linux".to_string(),
                created_at: Utc::now(),
                domains: vec![],
            })
            .await
            .unwrap();

        (store, "c1".to_string())
    }

    fn query_for(name: &str) -> (Query, Vec<u8>) {
        let mut raw = Vec::new();
        raw.extend_from_slice(&9u16.to_be_bytes());
        raw.extend_from_slice(&0x0100u16.to_be_bytes());
        raw.extend_from_slice(&1u16.to_be_bytes());
        raw.extend_from_slice(&0u16.to_be_bytes());
        raw.extend_from_slice(&0u16.to_be_bytes());
        raw.extend_from_slice(&0u16.to_be_bytes());
        for label in name.split('.') {
            raw.push(label.len() as u8);
            raw.extend_from_slice(label.as_bytes());
        }
        raw.push(0);
        raw.extend_from_slice(&1u16.to_be_bytes());
        raw.extend_from_slice(&1u16.to_be_bytes());

        let query = wire::parse_query(&raw).unwrap();
        (query, raw)
    }

    fn test_server(store: Arc<DataStore>) -> ResolverServer {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(ztgw_ca::CertificateAuthority::bootstrap(dir.path()).unwrap());
        ResolverServer::new(
            store,
            ca,
            ResolverConfig {
                listen_addr: "127.0.0.1:0".to_string(),
                certs_dir: dir.path().to_path_buf(),
                upstream: "127.0.0.1:1".parse().unwrap(),
                upstream_timeout: Duration::from_millis(50),
                handshake_timeout: Duration::from_secs(1),
                read_timeout: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test]
    async fn refuses_unauthorized_client() {
        let (store, cn) = store_with_zone().await;
        let server = test_server(store);

        let (query, raw) = query_for("db.internal.corp");
        let response = server.resolve(&cn, query, &raw).await;
        let flags = u16::from_be_bytes([response[2], response[3]]);
        assert_eq!(flags & 0x000F, 5); // REFUSED
    }

    #[tokio::test]
    async fn answers_authorized_client() {
        let (store, cn) = store_with_zone().await;
        store.authorize("db.internal.corp", &cn).await.unwrap();
        let server = test_server(store);

        let (query, raw) = query_for("db.internal.corp");
        let response = server.resolve(&cn, query, &raw).await;
        let ancount = u16::from_be_bytes([response[6], response[7]]);
        assert_eq!(ancount, 1);
    }

    #[tokio::test]
    async fn falls_back_to_upstream_for_unknown_name() {
        let (store, cn) = store_with_zone().await;
        let server = test_server(store);

        let (query, raw) = query_for("example.com");
        let response = server.resolve(&cn, query, &raw).await;
        let flags = u16::from_be_bytes([response[2], response[3]]);
        assert_eq!(flags & 0x000F, 2); // SERVFAIL, since the stub upstream never answers
    }
}
