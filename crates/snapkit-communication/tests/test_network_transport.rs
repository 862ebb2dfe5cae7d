use snapkit_communication::{MachineRequest, NetworkTransport, StatusPoll, Transport, TransportEvent};
use snapkit_core::{ConnectionError, Error, WorkflowStatus};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    body: String,
}

type Route = Arc<dyn Fn(&str, &str) -> (u16, String) + Send + Sync>;

/// Minimal HTTP/1.1 responder answering one request per connection
struct CannedMachine {
    port: u16,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl CannedMachine {
    async fn start(route: Route) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let route = route.clone();
                let recorded = recorded.clone();
                tokio::spawn(serve(stream, route, recorded));
            }
        });

        Self { port, requests }
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    fn transport(&self) -> NetworkTransport {
        NetworkTransport::new("127.0.0.1", self.port, Duration::from_secs(2)).unwrap()
    }
}

async fn serve(
    mut stream: TcpStream,
    route: Route,
    recorded: Arc<Mutex<Vec<Recorded>>>,
) -> Option<()> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    while raw.len() < header_end + content_length {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
    }

    let mut request_line = head.lines().next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let body = String::from_utf8_lossy(&raw[header_end..]).into_owned();

    let (status, reply) = route(&method, &path);
    recorded.lock().unwrap().push(Recorded { method, path, body });

    let response = format!(
        "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reply.len(),
        reply
    );
    stream.write_all(response.as_bytes()).await.ok()?;
    stream.shutdown().await.ok()
}

fn happy_machine() -> Route {
    Arc::new(|_method: &str, path: &str| {
        if path.starts_with("/api/v1/connect") {
            (200, r#"{"token":"abc123"}"#.to_string())
        } else if path.starts_with("/api/v1/status") {
            (200, r#"{"status":"RUNNING","x":12.5,"homed":true}"#.to_string())
        } else {
            (200, String::new())
        }
    })
}

#[tokio::test]
async fn test_connect_stores_token_and_commands_carry_it() {
    let machine = CannedMachine::start(happy_machine()).await;
    let transport = machine.transport();

    let result = transport.connect().await.unwrap();
    assert!(result.is_ok());
    assert_eq!(result.token.as_deref(), Some("abc123"));
    assert!(transport.is_connected());
    assert_eq!(transport.token().as_deref(), Some("abc123"));

    transport
        .send(MachineRequest::Gcode("G28\r\n\r\nG0 X1\n".into()))
        .await
        .unwrap();

    let requests = machine.requests();
    let execute = requests
        .iter()
        .find(|r| r.path == "/api/v1/execute_code")
        .expect("execute_code was not called");
    assert_eq!(execute.method, "POST");
    assert_eq!(execute.body, "token=abc123&code=G28%0AG0+X1");
}

#[tokio::test]
async fn test_status_poll_ready_and_awaiting_auth() {
    let machine = CannedMachine::start(happy_machine()).await;
    let transport = machine.transport();
    transport.connect().await.unwrap();

    match transport.query_status().await.unwrap() {
        StatusPoll::Ready(snapshot) => {
            assert_eq!(snapshot.workflow_status, WorkflowStatus::Running);
            assert_eq!(snapshot.state.work_position.x, 12.5);
            assert!(snapshot.state.is_homed);
        }
        other => panic!("unexpected poll result: {:?}", other),
    }
    assert!(machine
        .requests()
        .iter()
        .any(|r| r.method == "GET" && r.path == "/api/v1/status?token=abc123"));

    let pending = CannedMachine::start(Arc::new(|_: &str, _: &str| (204, String::new()))).await;
    assert_eq!(
        pending.transport().query_status().await.unwrap(),
        StatusPoll::AwaitingAuth
    );
}

#[tokio::test]
async fn test_revoked_token_is_unauthorized() {
    let machine = CannedMachine::start(Arc::new(|_: &str, path: &str| {
        if path.starts_with("/api/v1/connect") {
            (200, r#"{"token":"t"}"#.to_string())
        } else {
            (401, String::new())
        }
    }))
    .await;
    let transport = machine.transport();
    transport.connect().await.unwrap();

    let err = transport.query_status().await.unwrap_err();
    assert!(matches!(err, Error::Connection(ConnectionError::Unauthorized)));
    let err = transport.request(MachineRequest::PausePrint).await.unwrap_err();
    assert!(matches!(err, Error::Connection(ConnectionError::Unauthorized)));
}

#[tokio::test]
async fn test_connect_forbidden_and_not_found_fail() {
    let forbidden = CannedMachine::start(Arc::new(|_: &str, _: &str| (403, String::new()))).await;
    let err = forbidden.transport().connect().await.unwrap_err();
    assert_eq!(err.code(), Some("403"));

    let missing = CannedMachine::start(Arc::new(|_: &str, _: &str| (404, String::new()))).await;
    let err = missing.transport().connect().await.unwrap_err();
    assert_eq!(err.code(), Some("404"));
}

#[tokio::test]
async fn test_other_connect_refusals_are_reported_in_result() {
    let busy =
        CannedMachine::start(Arc::new(|_: &str, _: &str| (500, "machine busy".to_string()))).await;
    let transport = busy.transport();

    let result = transport.connect().await.unwrap();
    assert!(!result.is_ok());
    assert_eq!(result.code, 500);
    assert_eq!(result.msg, "machine busy");
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_rejected_command_fails_send() {
    let machine = CannedMachine::start(Arc::new(|_: &str, path: &str| {
        if path.starts_with("/api/v1/connect") {
            (200, r#"{"token":"t"}"#.to_string())
        } else {
            (500, "homing required".to_string())
        }
    }))
    .await;
    let transport = machine.transport();
    transport.connect().await.unwrap();

    let response = transport.request(MachineRequest::StartPrint).await.unwrap();
    assert_eq!(response.code, 500);
    assert_eq!(response.msg, "homing required");

    let err = transport.send(MachineRequest::StartPrint).await.unwrap_err();
    assert!(err.to_string().contains("homing required"));
}

#[tokio::test]
async fn test_disconnect_posts_and_clears_token() {
    let machine = CannedMachine::start(happy_machine()).await;
    let transport = machine.transport();
    transport.connect().await.unwrap();
    let mut rx = transport.subscribe();

    transport.disconnect(false).await.unwrap();
    assert!(!transport.is_connected());
    assert_eq!(transport.token(), None);
    assert!(matches!(rx.recv().await.unwrap(), TransportEvent::Closed { .. }));
    assert!(machine
        .requests()
        .iter()
        .any(|r| r.path == "/api/v1/disconnect" && r.body == "token=abc123"));
}

#[tokio::test]
async fn test_raw_packets_are_unsupported() {
    let machine = CannedMachine::start(happy_machine()).await;
    let transport = machine.transport();
    let packet = snapkit_communication::Packet::mount_storage();

    let err = transport
        .request(MachineRequest::Packet(packet))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not supported"));
}

#[tokio::test]
async fn test_unreachable_host_is_classified() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let transport = NetworkTransport::new("127.0.0.1", port, Duration::from_secs(2)).unwrap();
    let err = transport.connect().await.unwrap_err();
    assert!(err.is_connection_error());
    assert!(!transport.is_connected());
}
