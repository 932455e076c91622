use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::{Method, StatusCode};
use interlace::prelude::*;
use interlace::{DEFAULT_USER_AGENT, ModifyResponse, SetRequestHeader};
use serde::Deserialize;

#[derive(Clone, Copy)]
enum Reply {
    /// Read the request head, then drop the connection without answering.
    Hangup,
    Respond {
        status: u16,
        body: &'static str,
    },
}

/// Serves one request per connection, following `replies` in order.
struct ScriptedServer {
    address: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ScriptedServer {
    fn start(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind scripted server");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");
        let address = listener.local_addr().expect("read local address");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let join = {
            let requests = Arc::clone(&requests);
            let stop = Arc::clone(&stop);
            let mut replies = VecDeque::from(replies);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((mut stream, _)) => {
                            let Some(reply) = replies.pop_front() else {
                                break;
                            };
                            let _ = stream.set_nonblocking(false);
                            let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
                            if let Ok(head) = read_request_head(&mut stream) {
                                requests
                                    .lock()
                                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                                    .push(head);
                            }
                            let _ = answer(&mut stream, reply);
                        }
                        Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(5));
                        }
                        Err(_) => break,
                    }
                }
            })
        };

        Self {
            address,
            requests,
            stop,
            join: Some(join),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.address)
    }

    fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn read_request_head(stream: &mut TcpStream) -> io::Result<String> {
    let mut raw = Vec::new();
    let mut byte = [0_u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte)? == 0 {
            break;
        }
        raw.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&raw).to_ascii_lowercase())
}

fn answer(stream: &mut TcpStream, reply: Reply) -> io::Result<()> {
    match reply {
        Reply::Hangup => Ok(()),
        Reply::Respond { status, body } => {
            let head = format!(
                "HTTP/1.1 {status} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes())?;
            stream.write_all(body.as_bytes())?;
            stream.flush()
        }
    }
}

fn ok(body: &'static str) -> Reply {
    Reply::Respond { status: 200, body }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_is_resent_after_the_server_hangs_up() {
    let server = ScriptedServer::start(vec![Reply::Hangup, Reply::Hangup, ok("{}")]);
    let client = HttpClient::builder().build();

    let response = client
        .request(&Request::get(&server.url("/flaky")).expect("request"))
        .await
        .expect("third attempt succeeds");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(server.requests().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_retries_surface_the_last_socket_error() {
    let server = ScriptedServer::start(vec![Reply::Hangup; 3]);
    let client = HttpClient::builder().retry(2).build();

    let error = client
        .request(&Request::get(&server.url("/down")).expect("request"))
        .await
        .expect_err("every attempt hangs up");

    assert_eq!(error.code(), ErrorCode::Socket);
    assert!(error.transport_error_kind().is_some());
    assert_eq!(server.requests().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_is_not_resent_once_it_reached_the_server() {
    let server = ScriptedServer::start(vec![Reply::Hangup, ok("{}")]);
    let client = HttpClient::builder().retry(3).build();
    let request = Request::try_new(Method::POST, &server.url("/orders"))
        .expect("request")
        .with_body("{\"qty\":1}");

    let error = client
        .request(&request)
        .await
        .expect_err("post is not retried");

    assert_eq!(error.code(), ErrorCode::Socket);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_marked_idempotent_is_resent() {
    let server = ScriptedServer::start(vec![Reply::Hangup, ok("{}")]);
    let client = HttpClient::builder().retry(1).build();
    let mut request = Request::try_new(Method::POST, &server.url("/upsert"))
        .expect("request")
        .with_body("{}");
    request.set_idempotent(true);

    let response = client.request(&request).await.expect("second attempt");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(server.requests().len(), 2);
}

#[derive(Debug, Deserialize)]
struct Item {
    id: u32,
    name: String,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_head_and_json_body_round_trip_through_the_pipeline() {
    let server = ScriptedServer::start(vec![ok(r#"{"id":7,"name":"widget"}"#)]);
    let client = HttpClient::builder()
        .intercept_network(Arc::new(SetRequestHeader::new(
            HeaderName::from_static("x-request-id"),
            HeaderValue::from_static("abc-123"),
        )))
        .intercept(Arc::new(ModifyResponse::new(|response: &mut Response| {
            response
                .headers_mut()
                .insert("x-seen-by", HeaderValue::from_static("application"));
        })))
        .build();
    let request = Request::get(&server.url("/items?page=2")).expect("request");

    let response = client.request(&request).await.expect("response");
    assert_eq!(response.headers()["x-seen-by"], "application");
    let sent = response.request().expect("sent request");
    assert_eq!(sent.headers()["x-request-id"], "abc-123");
    assert!(request.headers().get("x-request-id").is_none());

    let item: Item = response.into_body().json().await.expect("json");
    assert_eq!(item.id, 7);
    assert_eq!(item.name, "widget");

    let heads = server.requests();
    let head = &heads[0];
    assert!(head.starts_with("get /items?page=2 http/1.1\r\n"), "{head}");
    assert!(head.contains(&format!("host: {}\r\n", server.address)));
    assert!(head.contains("x-request-id: abc-123\r\n"));
    assert!(head.contains(&format!(
        "user-agent: {}\r\n",
        DEFAULT_USER_AGENT.to_ascii_lowercase()
    )));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn caller_user_agent_wins_over_the_default() {
    let server = ScriptedServer::start(vec![ok("{}")]);
    let client = HttpClient::builder().build();
    let request = Request::get(&server.url("/"))
        .expect("request")
        .with_header(
            http::header::USER_AGENT,
            HeaderValue::from_static("custom-agent/1"),
        );

    client.request(&request).await.expect("response");
    let heads = server.requests();
    assert!(heads[0].contains("user-agent: custom-agent/1\r\n"));
    assert!(!heads[0].contains("interlace/"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_statuses_are_responses_not_errors() {
    let server = ScriptedServer::start(vec![Reply::Respond {
        status: 503,
        body: "{}",
    }]);
    let client = HttpClient::builder().build();

    let response = client
        .request(&Request::get(&server.url("/busy")).expect("request"))
        .await
        .expect("a 503 is still a response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn profile_budgets_reach_the_sent_request() {
    let server = ScriptedServer::start(vec![ok("{}")]);
    let client = HttpClient::builder()
        .profile(ClientProfile::LowLatency)
        .build();

    let response = client
        .request(&Request::get(&server.url("/fast")).expect("request"))
        .await
        .expect("response");
    let sent = response.request().expect("sent request");
    assert_eq!(sent.transfer_timeout(), Duration::from_secs(5));
    assert_eq!(sent.tcp_connect_timeout(), Duration::from_secs(2));
}
