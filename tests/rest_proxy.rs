use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tallyline::event_model::ManualClock;
use tallyline::observability::{JsonLineLogger, LogRotationPolicy, Logger};
use tallyline::runtime::RetryPolicy;
use tallyline::source::{
    Broker, ConnectError, FetchError, OffsetReset, RestProxyBroker, SecurityProtocol,
    SourceAdapter, SourceItem, SourceOptions, StartPosition, Subscription,
};

const V2_JSON: &str = "application/vnd.kafka.v2+json";
const V2_BINARY: &str = "application/vnd.kafka.binary.v2+json";

#[derive(Debug, Clone)]
struct StubRequest {
    method: String,
    path: String,
    content_type: Option<String>,
    accept: Option<String>,
    body: String,
}

impl StubRequest {
    fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or(Value::Null)
    }

    fn is(&self, method: &str, suffix: &str) -> bool {
        self.method == method && self.path.split('?').next().is_some_and(|p| p.ends_with(suffix))
    }
}

type Handler = Box<dyn Fn(&StubRequest, &str) -> (u16, String) + Send>;

/// Minimal HTTP/1.1 server standing in for the Kafka REST proxy.
struct ProxyStub {
    base_url: String,
    requests: Arc<Mutex<Vec<StubRequest>>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ProxyStub {
    fn start(handler: impl Fn(&StubRequest, &str) -> (u16, String) + Send + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind proxy stub");
        let base_url = format!("http://{}", listener.local_addr().expect("stub addr"));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let handler: Handler = Box::new(handler);
        let handle = {
            let base_url = base_url.clone();
            let requests = requests.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                for stream in listener.incoming() {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(mut stream) = stream else {
                        continue;
                    };
                    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
                    let Some(request) = read_request(&mut stream) else {
                        continue;
                    };
                    requests.lock().unwrap().push(request.clone());
                    let (status, body) = handler(&request, &base_url);
                    let response = format!(
                        "HTTP/1.1 {status} {}\r\nContent-Type: {V2_JSON}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        reason(status),
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes());
                }
            })
        };
        Self {
            base_url,
            requests,
            shutdown,
            handle: Some(handle),
        }
    }

    fn requests(&self) -> Vec<StubRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn find(&self, method: &str, suffix: &str) -> Vec<StubRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.is(method, suffix))
            .collect()
    }
}

impl Drop for ProxyStub {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = TcpStream::connect(self.base_url.trim_start_matches("http://"));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Option<StubRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    let header = |name: &str| {
        headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    };
    let length = header("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + length {
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let end = buf.len().min(header_end + length);
    Some(StubRequest {
        method,
        path,
        content_type: header("content-type"),
        accept: header("accept"),
        body: String::from_utf8_lossy(&buf[header_end..end]).to_string(),
    })
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        404 => "Not Found",
        409 => "Conflict",
        _ => "Internal Server Error",
    }
}

fn instance_path(n: u32) -> String {
    format!("/consumers/0/instances/tally-{n}")
}

fn created(base: &str, n: u32) -> (u16, String) {
    let body = json!({
        "instance_id": format!("tally-{n}"),
        "base_uri": format!("{base}{}", instance_path(n)),
    });
    (200, body.to_string())
}

fn wire_record(offset: u64, value: i64) -> Value {
    let payload = json!({"op": "c", "after": {"value": value}}).to_string();
    json!({
        "topic": "mongo.test.values",
        "partition": 0,
        "offset": offset,
        "key": null,
        "value": base64_encode(payload.as_bytes()),
    })
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Proxy with one healthy consumer instance serving `records` once.
fn healthy_proxy(records: Vec<Value>) -> ProxyStub {
    let served = AtomicBool::new(false);
    ProxyStub::start(move |request, base| {
        if request.is("POST", "/consumers/0") {
            created(base, 1)
        } else if request.is("GET", "/records") {
            if served.swap(true, Ordering::SeqCst) {
                (200, "[]".into())
            } else {
                (200, Value::Array(records.clone()).to_string())
            }
        } else {
            (204, String::new())
        }
    })
}

fn subscription() -> Subscription {
    Subscription {
        topic: "mongo.test.values".into(),
        group_id: "0".into(),
        session_timeout: Duration::from_millis(6_000),
        offset_reset: OffsetReset::Earliest,
    }
}

fn broker(urls: &[String]) -> RestProxyBroker {
    RestProxyBroker::new(urls, SecurityProtocol::Plaintext, Duration::from_secs(2)).unwrap()
}

fn dead_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

#[test]
fn session_lifecycle_speaks_rest_proxy_v2() {
    let proxy = healthy_proxy(vec![wire_record(5, 4), wire_record(6, -1)]);
    let mut broker = broker(&[proxy.base_url.clone()]);
    let mut session = broker.connect(&subscription()).expect("connect");

    let create = &proxy.find("POST", "/consumers/0")[0];
    assert_eq!(create.content_type.as_deref(), Some(V2_JSON));
    let body = create.json();
    let mut keys: Vec<&str> = body.as_object().unwrap().keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["auto.commit.enable", "auto.offset.reset", "format", "name"]);
    assert_eq!(body["format"], "binary");
    assert_eq!(body["auto.offset.reset"], "earliest");
    assert_eq!(body["auto.commit.enable"], "false");

    let assignment = &proxy.find("POST", "/assignments")[0];
    assert_eq!(assignment.path, format!("{}/assignments", instance_path(1)));
    assert_eq!(
        assignment.json(),
        json!({"partitions": [{"topic": "mongo.test.values", "partition": 0}]})
    );

    session.seek(StartPosition::After(4)).expect("seek");
    let seek = &proxy.find("POST", "/positions")[0];
    assert_eq!(seek.content_type.as_deref(), Some(V2_JSON));
    assert_eq!(
        seek.json(),
        json!({"offsets": [{"topic": "mongo.test.values", "partition": 0, "offset": 5}]})
    );

    let records = session.fetch(Duration::from_millis(100)).expect("fetch");
    let fetch = &proxy.find("GET", "/records")[0];
    assert_eq!(
        fetch.path,
        format!("{}/records?timeout=100&max_bytes=1048576", instance_path(1))
    );
    assert_eq!(fetch.accept.as_deref(), Some(V2_BINARY));
    assert_eq!(records.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![5, 6]);
    let payload: Value = serde_json::from_slice(records[0].value.as_deref().unwrap()).unwrap();
    assert_eq!(payload["after"]["value"], 4);

    session.commit(7).expect("commit");
    let commit = &proxy.find("POST", "/offsets")[0];
    assert_eq!(
        commit.json(),
        json!({"offsets": [{"topic": "mongo.test.values", "partition": 0, "offset": 7}]})
    );

    session.close();
    let delete = &proxy.find("DELETE", &instance_path(1))[0];
    assert_eq!(delete.path, instance_path(1));
}

#[test]
fn earliest_and_latest_seek_use_position_routes() {
    let proxy = healthy_proxy(Vec::new());
    let mut broker = broker(&[proxy.base_url.clone()]);
    let mut session = broker.connect(&subscription()).unwrap();
    session.seek(StartPosition::Earliest).unwrap();
    session.seek(StartPosition::Latest).unwrap();
    let beginning = &proxy.find("POST", "/positions/beginning")[0];
    let end = &proxy.find("POST", "/positions/end")[0];
    let partitions = json!({"partitions": [{"topic": "mongo.test.values", "partition": 0}]});
    assert_eq!(beginning.json(), partitions);
    assert_eq!(end.json(), partitions);
    session.close();
}

#[test]
fn endpoints_are_tried_in_order() {
    let proxy = healthy_proxy(Vec::new());
    let mut broker = broker(&[dead_endpoint(), proxy.base_url.clone()]);
    let session = broker.connect(&subscription()).expect("second endpoint answers");
    assert_eq!(proxy.find("POST", "/consumers/0").len(), 1);
    session.close();
}

#[test]
fn rejected_consumer_creation_stops_endpoint_fallback() {
    let rejecting = ProxyStub::start(|_, _| (409, r#"{"error_code":40902}"#.into()));
    let healthy = healthy_proxy(Vec::new());
    let mut broker = broker(&[rejecting.base_url.clone(), healthy.base_url.clone()]);
    let err = broker.connect(&subscription()).err().expect("409 rejects");
    assert!(matches!(err, ConnectError::Rejected { .. }), "{err:?}");
    assert!(healthy.requests().is_empty());
}

#[test]
fn missing_instance_and_server_errors_map_to_fetch_errors() {
    let lost = AtomicBool::new(false);
    let proxy = ProxyStub::start(move |request, base| {
        if request.is("POST", "/consumers/0") {
            created(base, 1)
        } else if request.is("GET", "/records") {
            if lost.swap(true, Ordering::SeqCst) {
                (404, r#"{"error_code":40403}"#.into())
            } else {
                (500, r#"{"error_code":50002}"#.into())
            }
        } else {
            (204, String::new())
        }
    });
    let mut broker = broker(&[proxy.base_url.clone()]);
    let mut session = broker.connect(&subscription()).unwrap();
    let first = session.fetch(Duration::from_millis(10)).expect_err("500");
    assert!(matches!(first, FetchError::Transport(_)), "{first:?}");
    let second = session.fetch(Duration::from_millis(10)).expect_err("404");
    assert!(matches!(second, FetchError::SessionLost(_)), "{second:?}");
}

#[test]
fn expired_instance_is_replaced_and_resumes_after_last_delivered() {
    let instances = AtomicU32::new(0);
    let fetches = AtomicU32::new(0);
    let proxy = ProxyStub::start(move |request, base| {
        if request.is("POST", "/consumers/0") {
            let n = instances.fetch_add(1, Ordering::SeqCst) + 1;
            created(base, n)
        } else if request.is("GET", "/records") {
            if request.path.starts_with(&instance_path(1)) {
                match fetches.fetch_add(1, Ordering::SeqCst) {
                    0 => (200, json!([wire_record(0, 5), wire_record(1, 3)]).to_string()),
                    _ => (404, r#"{"error_code":40403}"#.into()),
                }
            } else {
                // Replays offset 1; the adapter must not deliver it twice.
                (200, json!([wire_record(1, 3), wire_record(2, -2)]).to_string())
            }
        } else {
            (204, String::new())
        }
    });

    let clock = Arc::new(ManualClock::new(10));
    let options = SourceOptions {
        subscription: subscription(),
        resume_after: None,
        retry: RetryPolicy::immediate(2),
        clock: clock.clone(),
        cancel: Arc::new(AtomicBool::new(false)),
        logger: Logger::new(JsonLineLogger::memory(LogRotationPolicy::default()), clock),
    };
    let mut adapter =
        SourceAdapter::connect(Box::new(broker(&[proxy.base_url.clone()])), options).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut items = Vec::new();
    while items.len() < 3 {
        assert!(Instant::now() < deadline, "only received {items:?}");
        if let Some(item) = adapter.poll(Duration::from_millis(10)).unwrap() {
            items.push(item);
        }
    }
    let offsets: Vec<u64> = items.iter().map(SourceItem::offset).collect();
    assert_eq!(offsets, vec![0, 1, 2]);
    assert_eq!(adapter.reconnects(), 1);

    let resumed = proxy
        .find("POST", "/positions")
        .into_iter()
        .find(|request| request.path.starts_with(&instance_path(2)))
        .expect("second instance seeks");
    assert_eq!(resumed.json()["offsets"][0]["offset"], 2);
    assert!(!proxy.find("DELETE", &instance_path(1)).is_empty());
    adapter.close();
}
