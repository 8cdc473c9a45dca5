//! End-to-end scenarios over TCP: handshake outcomes, the five operation
//! families, ordered request streams, and multi-producer advise loops.
//!
//! The test server mirrors a typical embedding: it accepts one topic,
//! answers a handful of well-known items, and tracks per-producer
//! counters so ordering violations show up as wrong replies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::timeout;

use sockline::{
    make_connection, Connection, ConnectionHandler, Endpoint, Format, IpcError, Server,
    ServerHandler,
};

const TOPIC: &str = "IPC TEST";
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Server side of one accepted connection.
#[derive(Default)]
struct ServiceConnection {
    connection: StdMutex<Option<Arc<Connection>>>,
    last_execute: StdMutex<Option<(Bytes, Format)>>,
    thread_lastval: StdMutex<[i32; 3]>,
}

impl ServiceConnection {
    fn connection(&self) -> Arc<Connection> {
        self.connection
            .lock()
            .unwrap()
            .clone()
            .expect("connection not yet open")
    }

    /// Requests of the form `"MultiRequest thread <t> <n>"` must arrive
    /// with `n` strictly increasing per producer; anything else earns an
    /// error reply.
    fn handle_multi_request(&self, item: &str) -> String {
        let rest = item.strip_prefix("MultiRequest thread ").unwrap_or("");
        let mut parts = rest.split_whitespace();
        let thread: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let counter: i32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(-1);

        if !(1..=3).contains(&thread) {
            return format!("Error: bad thread number in {item:?}");
        }

        let mut lastval = self.thread_lastval.lock().unwrap();
        if lastval[thread - 1] + 1 != counter {
            return format!(
                "Error: misordered count in thread {thread} - expected {}, received {counter}",
                lastval[thread - 1] + 1
            );
        }
        lastval[thread - 1] = counter;
        format!("OK: {item}")
    }
}

#[async_trait]
impl ConnectionHandler for ServiceConnection {
    async fn on_open(&self, connection: Arc<Connection>) {
        *self.connection.lock().unwrap() = Some(connection);
    }

    async fn on_execute(&self, _topic: &str, data: Bytes, format: Format) {
        *self.last_execute.lock().unwrap() = Some((data, format));
    }

    async fn on_request(&self, _topic: &str, item: &str, format: Format) -> Option<Bytes> {
        let answer = match item {
            "ping" => {
                if format != Format::PRIVATE {
                    return None;
                }
                "pong\0".to_owned()
            }
            "last_execute" => {
                let held = self.last_execute.lock().unwrap();
                let (data, _) = held.as_ref()?;
                String::from_utf8_lossy(data).into_owned()
            }
            "get_thread1_request_counter" => self.thread_lastval.lock().unwrap()[0].to_string(),
            "get_thread2_request_counter" => self.thread_lastval.lock().unwrap()[1].to_string(),
            "get_thread3_request_counter" => self.thread_lastval.lock().unwrap()[2].to_string(),
            multi if multi.starts_with("MultiRequest thread ") => self.handle_multi_request(multi),
            _ => return None,
        };
        Some(Bytes::from(answer))
    }

    async fn on_start_advise(&self, _topic: &str, _item: &str) -> bool {
        true
    }

    async fn on_stop_advise(&self, _topic: &str, _item: &str) -> bool {
        true
    }
}

/// Accept-time policy: one topic, one live service connection handle.
#[derive(Default)]
struct Service {
    current: StdMutex<Option<Arc<ServiceConnection>>>,
}

#[async_trait]
impl ServerHandler for Service {
    async fn on_accept_connection(&self, topic: &str) -> Option<Arc<dyn ConnectionHandler>> {
        if topic != TOPIC {
            return None;
        }
        let conn = Arc::new(ServiceConnection::default());
        *self.current.lock().unwrap() = Some(conn.clone());
        Some(conn)
    }
}

/// A handler with nothing to serve.
struct Quiet;

#[async_trait]
impl ConnectionHandler for Quiet {}

async fn start_server() -> (Server, Arc<Service>, String) {
    let service = Arc::new(Service::default());
    let server = Server::bind(
        Endpoint::Tcp {
            host: Some("127.0.0.1".to_owned()),
            port: 0,
        },
        service.clone(),
    )
    .await
    .expect("bind test server");
    let port = server.local_addr().expect("tcp server has an address").port();
    (server, service, port.to_string())
}

async fn connect(service: &str) -> Result<Arc<Connection>, IpcError> {
    timeout(
        TEST_TIMEOUT,
        make_connection(Some("127.0.0.1"), service, TOPIC, Arc::new(Quiet)),
    )
    .await
    .expect("handshake within the timeout")
}

#[tokio::test]
async fn wrong_port_yields_no_connection() {
    let (_server, _service, port) = start_server().await;

    // A freshly freed ephemeral port: nothing listens there.
    let vacant = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    assert_ne!(port, vacant.to_string());

    let err = connect(&vacant.to_string())
        .await
        .expect_err("nothing listens on the vacant port");
    assert!(matches!(err, IpcError::Wire(_)), "got {err}");
}

#[tokio::test]
async fn wrong_topic_is_rejected_with_fail() {
    let (_server, _service, port) = start_server().await;

    let err = timeout(
        TEST_TIMEOUT,
        make_connection(Some("127.0.0.1"), &port, "VCP GRFG", Arc::new(Quiet)),
    )
    .await
    .unwrap()
    .expect_err("server refuses the topic");
    assert!(matches!(err, IpcError::HandshakeRejected(_)), "got {err}");
}

#[tokio::test]
async fn execute_reaches_the_server_verbatim() {
    let (_server, service, port) = start_server().await;
    let conn = connect(&port).await.expect("handshake succeeds");
    assert!(conn.is_open());

    // Trailing NUL included, as a text-format command would carry it.
    conn.execute(&b"Date\0"[..], Format::TEXT).await.unwrap();

    // The round-trip below orders us behind the execute dispatch.
    let echoed = timeout(TEST_TIMEOUT, conn.request("last_execute", Format::PRIVATE))
        .await
        .unwrap()
        .unwrap()
        .expect("server recorded the execute");
    assert_eq!(&echoed[..], b"Date\0");

    let handler = service.current.lock().unwrap().clone().unwrap();
    let (data, format) = handler.last_execute.lock().unwrap().clone().unwrap();
    assert_eq!(data.len(), 5);
    assert_eq!(&data[..], b"Date\0");
    assert_eq!(format, Format::TEXT);

    conn.disconnect().await;
}

#[tokio::test]
async fn request_ping_answers_pong() {
    let (_server, _service, port) = start_server().await;
    let conn = connect(&port).await.unwrap();

    let reply = timeout(TEST_TIMEOUT, conn.request("ping", Format::PRIVATE))
        .await
        .unwrap()
        .unwrap()
        .expect("ping is served");
    assert_eq!(reply.len(), 5);
    assert_eq!(&reply[..], b"pong\0");

    conn.disconnect().await;
}

#[tokio::test]
async fn twenty_ordered_requests_stay_ordered() {
    let (_server, _service, port) = start_server().await;
    let conn = connect(&port).await.unwrap();

    for n in 1..=20 {
        let item = format!("MultiRequest thread 1 {n}");
        let reply = timeout(TEST_TIMEOUT, conn.request(&item, Format::PRIVATE))
            .await
            .unwrap()
            .unwrap()
            .expect("request is served");
        assert_eq!(String::from_utf8_lossy(&reply), format!("OK: {item}"));
    }

    let probe = conn
        .request("get_thread1_request_counter", Format::PRIVATE)
        .await
        .unwrap()
        .expect("counter probe is served");
    assert_eq!(&probe[..], b"20");

    conn.disconnect().await;
}

/// Per-tag recorder for the multi-producer advise scenario.
#[derive(Default)]
struct AdviseRecorder {
    per_tag: StdMutex<HashMap<String, Vec<u32>>>,
}

#[async_trait]
impl ConnectionHandler for AdviseRecorder {
    async fn on_advise(&self, _topic: &str, _item: &str, data: Bytes, _format: Format) {
        let text = String::from_utf8(data.to_vec()).expect("advise payloads are text");
        let (tag, counter) = text.rsplit_once(' ').expect("payload is '<tag> <n>'");
        self.per_tag
            .lock()
            .unwrap()
            .entry(tag.to_owned())
            .or_default()
            .push(counter.parse().expect("counter is decimal"));
    }
}

#[tokio::test]
async fn interleaved_advises_keep_per_producer_order() {
    const ITEM: &str = "MultiAdvise MultiThread test";

    let (_server, service, port) = start_server().await;
    let recorder = Arc::new(AdviseRecorder::default());
    let conn = timeout(
        TEST_TIMEOUT,
        make_connection(Some("127.0.0.1"), &port, TOPIC, recorder.clone()),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(conn.start_advise(ITEM).await.unwrap());

    let server_conn = service.current.lock().unwrap().clone().unwrap().connection();
    let mut pushers = Vec::new();
    for tag in 1..=3u32 {
        let server_conn = server_conn.clone();
        pushers.push(tokio::spawn(async move {
            for counter in 1..=20u32 {
                let payload = format!("thread-{tag} {counter}");
                server_conn
                    .advise(ITEM, payload.into_bytes(), Format::TEXT)
                    .await
                    .expect("advise while subscribed");
                tokio::task::yield_now().await;
            }
        }));
    }
    for pusher in pushers {
        pusher.await.expect("pusher task");
    }

    // The StopAdvise echo trails every advise frame on the wire, so once
    // it is back every update has been dispatched.
    assert!(timeout(TEST_TIMEOUT, conn.stop_advise(ITEM))
        .await
        .unwrap()
        .unwrap());

    let per_tag = recorder.per_tag.lock().unwrap();
    assert_eq!(per_tag.len(), 3, "one series per producer");
    let expected: Vec<u32> = (1..=20).collect();
    for tag in 1..=3u32 {
        let series = per_tag
            .get(&format!("thread-{tag}"))
            .unwrap_or_else(|| panic!("missing series for producer {tag}"));
        assert_eq!(series, &expected, "producer {tag} out of order");
    }

    conn.disconnect().await;
}

#[tokio::test]
async fn server_shutdown_disconnects_clients() {
    let (server, _service, port) = start_server().await;
    let conn = connect(&port).await.unwrap();
    assert!(conn.is_open());

    timeout(TEST_TIMEOUT, server.shutdown()).await.unwrap();
    timeout(TEST_TIMEOUT, conn.closed()).await.unwrap();
    assert!(!conn.is_open());

    let err = conn.request("ping", Format::PRIVATE).await.unwrap_err();
    assert!(matches!(err, IpcError::NotConnected));
}
