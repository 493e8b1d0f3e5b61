//! The resolver decision pipeline and its UDP/TCP listeners.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::blocklist::{Blocklist, BlocklistSources};
use crate::cache::DnsCache;
use crate::DnsServerError;

const INTERCEPT_TTL: u32 = 60;
const UPSTREAM_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(3);
const BLOCKLIST_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const BLOCKLIST_RELOAD_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_MESSAGE_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct DnsResolverConfig {
    pub listen: SocketAddr,
    pub upstream: SocketAddr,
    pub intercept_hosts: Vec<String>,
    pub intercept_ip: Ipv4Addr,
    pub blocklist_paths: Vec<PathBuf>,
    pub blocklist_urls: Vec<String>,
    pub min_cache_ttl: Duration,
    pub max_cache_ttl: Duration,
}

/// The resolver: intercept set, blocklist snapshot, cache, and upstream.
///
/// The blocklist is an `Arc` snapshot behind a read-write lock: queries clone
/// the pointer under the read lock, the 24-hour reload builds a complete new
/// set off-lock and swaps it in under the write lock.
pub struct DnsResolver {
    listen: SocketAddr,
    upstream: SocketAddr,
    intercepts: HashSet<String>,
    intercept_ip: Ipv4Addr,
    blocklist: RwLock<Arc<Blocklist>>,
    sources: BlocklistSources,
    cache: DnsCache,
    http: reqwest::Client,
}

impl DnsResolver {
    /// Build the resolver and perform the initial blocklist load.
    pub async fn new(config: DnsResolverConfig) -> Result<Arc<Self>, DnsServerError> {
        let http = reqwest::Client::builder()
            .timeout(BLOCKLIST_FETCH_TIMEOUT)
            .build()?;

        let intercepts = config
            .intercept_hosts
            .iter()
            .map(|host| {
                let mut name = host.trim().to_ascii_lowercase();
                if !name.ends_with('.') {
                    name.push('.');
                }
                name
            })
            .collect();

        let sources = BlocklistSources {
            paths: config.blocklist_paths,
            urls: config.blocklist_urls,
        };

        let resolver = Arc::new(Self {
            listen: config.listen,
            upstream: config.upstream,
            intercepts,
            intercept_ip: config.intercept_ip,
            blocklist: RwLock::new(Arc::new(Blocklist::default())),
            sources,
            cache: DnsCache::new(config.min_cache_ttl, config.max_cache_ttl),
            http,
        });

        resolver.reload_blocklist().await;
        Ok(resolver)
    }

    /// Bind both listeners at the configured address and serve forever.
    pub async fn run(self: Arc<Self>) -> Result<(), DnsServerError> {
        let udp = UdpSocket::bind(self.listen)
            .await
            .map_err(|source| DnsServerError::Bind {
                addr: self.listen,
                source,
            })?;
        let tcp = TcpListener::bind(self.listen)
            .await
            .map_err(|source| DnsServerError::Bind {
                addr: self.listen,
                source,
            })?;
        self.serve_with(udp, tcp).await
    }

    /// Run until the shutdown channel flips; the listeners stop accepting.
    pub async fn run_until_shutdown(
        self: Arc<Self>,
        shutdown_rx: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), DnsServerError> {
        adtrim_support::serve_until_shutdown(self.run(), shutdown_rx).await
    }

    /// Serve on already-bound sockets. Split out so tests can bind port 0.
    pub async fn serve_with(
        self: Arc<Self>,
        udp: UdpSocket,
        tcp: TcpListener,
    ) -> Result<(), DnsServerError> {
        tracing::info!(
            listen = %self.listen,
            upstream = %self.upstream,
            intercepts = self.intercepts.len(),
            "dns resolver listening"
        );

        tokio::join!(
            Arc::clone(&self).udp_loop(Arc::new(udp)),
            Arc::clone(&self).tcp_loop(tcp),
            self.reload_loop(),
        );
        Ok(())
    }

    async fn udp_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0_u8; MAX_MESSAGE_BYTES];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(error) => {
                    tracing::warn!(%error, "udp receive failed");
                    continue;
                }
            };
            let query = buf[..len].to_vec();
            let resolver = Arc::clone(&self);
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                if let Some(reply) = resolver.answer_query(&query).await {
                    if let Err(error) = socket.send_to(&reply, peer).await {
                        tracing::debug!(%error, %peer, "udp reply send failed");
                    }
                }
            });
        }
    }

    async fn tcp_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!(%error, "tcp accept failed");
                    continue;
                }
            };
            let resolver = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(error) = resolver.serve_tcp_conn(stream).await {
                    tracing::debug!(%error, %peer, "tcp session ended with error");
                }
            });
        }
    }

    /// Rebuild the blocklist on a 24-hour ticker.
    async fn reload_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(BLOCKLIST_RELOAD_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.reload_blocklist().await;
        }
    }

    /// One length-prefixed request/response exchange per RFC 1035 §4.2.2,
    /// repeated until the client closes.
    async fn serve_tcp_conn(&self, mut stream: TcpStream) -> std::io::Result<()> {
        loop {
            let length = match stream.read_u16().await {
                Ok(length) => usize::from(length),
                Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(error) => return Err(error),
            };
            if length == 0 || length > MAX_MESSAGE_BYTES {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "tcp dns message length out of range",
                ));
            }

            let mut query = vec![0_u8; length];
            stream.read_exact(&mut query).await?;

            let Some(reply) = self.answer_query(&query).await else {
                return Ok(());
            };
            stream.write_u16(reply.len() as u16).await?;
            stream.write_all(&reply).await?;
        }
    }

    /// The per-query decision pipeline: intercept, block, cache, forward.
    pub async fn answer_query(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_vec(raw) {
            Ok(request) => request,
            Err(error) => {
                tracing::debug!(%error, "dropping unparseable dns message");
                return None;
            }
        };

        for query in request.queries() {
            let qtype = query.query_type();
            if qtype != RecordType::A && qtype != RecordType::AAAA {
                continue;
            }

            let name = fqdn_key(query.name());

            if self.intercepts.contains(&name) {
                let mut reply = reply_template(&request);
                if qtype == RecordType::A {
                    let mut answer = Record::from_rdata(
                        query.name().clone(),
                        INTERCEPT_TTL,
                        RData::A(A(self.intercept_ip)),
                    );
                    answer.set_dns_class(DNSClass::IN);
                    reply.add_answer(answer);
                }
                return encode(&reply);
            }

            let blocked = {
                let snapshot =
                    Arc::clone(&self.blocklist.read().expect("blocklist lock poisoned"));
                snapshot.is_blocked(&name)
            };
            if blocked {
                let mut reply = reply_template(&request);
                reply.set_response_code(ResponseCode::NXDomain);
                return encode(&reply);
            }
        }

        let cache_key: String = request
            .queries()
            .iter()
            .map(|query| format!("{} {} ", fqdn_key(query.name()), query.query_type()))
            .collect();

        if !cache_key.is_empty() {
            if let Some(mut cached) = self.cache.lookup(&cache_key) {
                cached.set_id(request.id());
                return encode(&cached);
            }
        }

        match self.exchange_upstream(raw).await {
            Ok(raw_response) => {
                if !cache_key.is_empty() {
                    if let Ok(response) = Message::from_vec(&raw_response) {
                        if !response.answers().is_empty() {
                            self.cache.store(cache_key, response);
                        }
                    }
                }
                Some(raw_response)
            }
            Err(error) => {
                tracing::warn!(%error, upstream = %self.upstream, "upstream dns exchange failed");
                let mut reply = reply_template(&request);
                reply.set_response_code(ResponseCode::ServFail);
                encode(&reply)
            }
        }
    }

    /// Forward the original message to the upstream resolver over UDP.
    async fn exchange_upstream(&self, query: &[u8]) -> std::io::Result<Vec<u8>> {
        let bind_addr: SocketAddr = if self.upstream.is_ipv4() {
            "0.0.0.0:0".parse().expect("ipv4 wildcard")
        } else {
            "[::]:0".parse().expect("ipv6 wildcard")
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.upstream).await?;
        socket.send(query).await?;

        let mut buf = vec![0_u8; MAX_MESSAGE_BYTES];
        let len = tokio::time::timeout(UPSTREAM_EXCHANGE_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "upstream dns exchange timed out",
                )
            })??;
        buf.truncate(len);
        Ok(buf)
    }

    /// Rebuild the blocklist from all sources and swap in the new snapshot.
    pub async fn reload_blocklist(&self) {
        let fresh = self.sources.load(&self.http).await;
        tracing::info!(domains = fresh.len(), "blocklist loaded");
        *self.blocklist.write().expect("blocklist lock poisoned") = Arc::new(fresh);
    }
}

/// Lowercased, dot-terminated map key for a query name.
fn fqdn_key(name: &Name) -> String {
    let mut key = name.to_ascii().to_ascii_lowercase();
    if !key.ends_with('.') {
        key.push('.');
    }
    key
}

/// Start a reply mirroring the request id, opcode, and question section.
fn reply_template(request: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .add_queries(request.queries().to_vec());
    response
}

fn encode(message: &Message) -> Option<Vec<u8>> {
    match message.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(error) => {
            tracing::warn!(%error, "failed to encode dns reply");
            None
        }
    }
}
