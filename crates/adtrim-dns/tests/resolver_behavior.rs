use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use adtrim_dns::{DnsResolver, DnsResolverConfig};
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

const UPSTREAM_ANSWER: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

struct TestStack {
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    upstream_hits: Arc<AtomicUsize>,
}

/// A fake upstream resolver that answers every query with one A record.
async fn spawn_fake_upstream(hits: Arc<AtomicUsize>) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = socket.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        let mut buf = vec![0_u8; 4096];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            hits.fetch_add(1, Ordering::SeqCst);
            let request = Message::from_vec(&buf[..len]).expect("parse upstream query");
            let mut response = Message::new();
            response
                .set_id(request.id())
                .set_message_type(MessageType::Response)
                .set_op_code(request.op_code())
                .set_recursion_desired(request.recursion_desired())
                .set_recursion_available(true)
                .add_queries(request.queries().to_vec());
            if let Some(query) = request.queries().first() {
                response.add_answer(Record::from_rdata(
                    query.name().clone(),
                    300,
                    RData::A(A(UPSTREAM_ANSWER)),
                ));
            }
            let bytes = response.to_vec().expect("encode upstream reply");
            let _ = socket.send_to(&bytes, peer).await;
        }
    });
    addr
}

async fn spawn_stack() -> TestStack {
    let upstream_hits = Arc::new(AtomicUsize::new(0));
    let upstream = spawn_fake_upstream(Arc::clone(&upstream_hits)).await;

    let dir = tempfile::tempdir().expect("temp dir");
    let blocklist_path = dir.path().join("ads.txt");
    std::fs::write(&blocklist_path, "ads.example.com\n").expect("write blocklist");

    let config = DnsResolverConfig {
        listen: "127.0.0.1:0".parse().expect("listen addr"),
        upstream,
        intercept_hosts: vec!["youtubei.googleapis.com".to_string()],
        intercept_ip: Ipv4Addr::new(10, 0, 0, 5),
        blocklist_paths: vec![blocklist_path],
        blocklist_urls: Vec::new(),
        min_cache_ttl: Duration::from_secs(120),
        max_cache_ttl: Duration::from_secs(900),
    };

    let resolver = DnsResolver::new(config).await.expect("build resolver");

    let udp = UdpSocket::bind("127.0.0.1:0").await.expect("bind udp");
    let tcp = TcpListener::bind("127.0.0.1:0").await.expect("bind tcp");
    let udp_addr = udp.local_addr().expect("udp addr");
    let tcp_addr = tcp.local_addr().expect("tcp addr");
    tokio::spawn(resolver.serve_with(udp, tcp));

    // The temp dir only needs to outlive the initial load, which already ran.
    drop(dir);

    TestStack {
        udp_addr,
        tcp_addr,
        upstream_hits,
    }
}

fn build_query(id: u16, name: &str, qtype: RecordType) -> Vec<u8> {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_str(name).expect("name"), qtype));
    message.to_vec().expect("encode query")
}

async fn ask_udp(server: SocketAddr, query: &[u8]) -> Message {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
    socket.send_to(query, server).await.expect("send query");
    let mut buf = vec![0_u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("reply within deadline")
        .expect("receive reply");
    Message::from_vec(&buf[..len]).expect("parse reply")
}

#[tokio::test]
async fn intercepted_a_query_answers_with_local_ip() {
    let stack = spawn_stack().await;

    let query = build_query(41, "youtubei.googleapis.com.", RecordType::A);
    let reply = ask_udp(stack.udp_addr, &query).await;

    assert_eq!(reply.id(), 41);
    assert_eq!(reply.response_code(), ResponseCode::NoError);
    assert_eq!(reply.answers().len(), 1);
    let answer = &reply.answers()[0];
    assert_eq!(answer.ttl(), 60);
    assert_eq!(answer.data(), Some(&RData::A(A(Ipv4Addr::new(10, 0, 0, 5)))));
    assert_eq!(stack.upstream_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn intercepted_aaaa_query_gets_empty_noerror() {
    let stack = spawn_stack().await;

    let query = build_query(42, "youtubei.googleapis.com.", RecordType::AAAA);
    let reply = ask_udp(stack.udp_addr, &query).await;

    assert_eq!(reply.response_code(), ResponseCode::NoError);
    assert!(reply.answers().is_empty());
    assert_eq!(stack.upstream_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn blocked_subdomain_gets_nxdomain_without_upstream_contact() {
    let stack = spawn_stack().await;

    let query = build_query(43, "banners.ads.example.com.", RecordType::A);
    let reply = ask_udp(stack.udp_addr, &query).await;

    assert_eq!(reply.response_code(), ResponseCode::NXDomain);
    assert!(reply.answers().is_empty());
    assert_eq!(stack.upstream_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn parent_of_blocked_name_is_forwarded() {
    let stack = spawn_stack().await;

    let query = build_query(44, "example.com.", RecordType::A);
    let reply = ask_udp(stack.udp_addr, &query).await;

    assert_eq!(reply.response_code(), ResponseCode::NoError);
    assert_eq!(reply.answers().len(), 1);
    assert_eq!(
        reply.answers()[0].data(),
        Some(&RData::A(A(UPSTREAM_ANSWER)))
    );
    assert_eq!(stack.upstream_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn repeated_query_is_served_from_cache_with_fresh_id() {
    let stack = spawn_stack().await;

    let first = ask_udp(stack.udp_addr, &build_query(45, "cacheme.example.net.", RecordType::A)).await;
    assert_eq!(first.id(), 45);
    assert_eq!(stack.upstream_hits.load(Ordering::SeqCst), 1);

    let second =
        ask_udp(stack.udp_addr, &build_query(46, "cacheme.example.net.", RecordType::A)).await;
    assert_eq!(second.id(), 46);
    assert_eq!(second.answers().len(), 1);
    assert_eq!(stack.upstream_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn tcp_transport_carries_the_same_pipeline() {
    let stack = spawn_stack().await;

    let query = build_query(47, "youtubei.googleapis.com.", RecordType::A);
    let mut stream = TcpStream::connect(stack.tcp_addr).await.expect("connect");
    stream
        .write_u16(query.len() as u16)
        .await
        .expect("write length");
    stream.write_all(&query).await.expect("write query");

    let length = stream.read_u16().await.expect("read length");
    let mut reply = vec![0_u8; usize::from(length)];
    stream.read_exact(&mut reply).await.expect("read reply");

    let message = Message::from_vec(&reply).expect("parse reply");
    assert_eq!(message.id(), 47);
    assert_eq!(message.answers().len(), 1);
    assert_eq!(
        message.answers()[0].data(),
        Some(&RData::A(A(Ipv4Addr::new(10, 0, 0, 5))))
    );
}
