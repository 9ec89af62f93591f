use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use outpost_agent_core::auth::{signed_payload, DirectiveVerifier};
use outpost_agent_core::exec::{CommandRunner, ExecError};
use outpost_agent_core::session::{Credentials, SessionEngine, DIAL_TIMEOUT, UPGRADE_NOTICE};
use outpost_agent_core::update::{SelfUpdate, UpdateError};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};
use url::Url;

const KEY_SEED: [u8; 32] = [9; 32];
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

enum Outgoing {
    Text(String),
    Close,
}

/// Server side of one agent connection accepted by the stub.
struct AgentLink {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl AgentLink {
    async fn recv_json(&mut self) -> Value {
        let frame = tokio::time::timeout(RECV_TIMEOUT, self.incoming.recv())
            .await
            .expect("frame from agent in time")
            .expect("agent link open");
        serde_json::from_str(&frame).expect("agent frames are JSON")
    }

    /// Skips heartbeats, which may interleave with anything else.
    async fn recv_reply(&mut self) -> Value {
        loop {
            let value = self.recv_json().await;
            if value["type"] != "heartbeat" {
                return value;
            }
        }
    }

    async fn assert_no_reply(&mut self) {
        let outcome = tokio::time::timeout(Duration::from_millis(300), self.incoming.recv()).await;
        assert!(outcome.is_err(), "unexpected frame from agent: {outcome:?}");
    }

    fn send(&self, value: Value) {
        self.outgoing
            .send(Outgoing::Text(value.to_string()))
            .expect("server socket task alive");
    }

    fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }
}

struct ControlServer {
    url: Url,
    links: mpsc::UnboundedReceiver<AgentLink>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl ControlServer {
    async fn start() -> Self {
        let (link_tx, links) = mpsc::unbounded_channel();
        let router = Router::new()
            .route("/api/v1/agent/connect", get(upgrade))
            .with_state(link_tx);
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind control server");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });
        let url = Url::parse(&format!("ws://{addr}/api/v1/agent/connect")).expect("server url");
        Self {
            url,
            links,
            shutdown: Some(shutdown_tx),
        }
    }

    async fn accept(&mut self) -> AgentLink {
        tokio::time::timeout(RECV_TIMEOUT, self.links.recv())
            .await
            .expect("agent connected in time")
            .expect("server running")
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn upgrade(
    State(links): State<mpsc::UnboundedSender<AgentLink>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_agent(socket, links))
}

async fn serve_agent(mut socket: WebSocket, links: mpsc::UnboundedSender<AgentLink>) {
    let (incoming_tx, incoming) = mpsc::unbounded_channel();
    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel();
    if links.send(AgentLink { incoming, outgoing }).is_err() {
        return;
    }
    loop {
        tokio::select! {
            frame = socket.recv() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if incoming_tx.send(text).is_err() {
                        return;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            },
            action = outgoing_rx.recv() => match action {
                Some(Outgoing::Text(text)) => {
                    if socket.send(WsMessage::Text(text)).await.is_err() {
                        return;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = socket.send(WsMessage::Close(None)).await;
                    return;
                }
            },
        }
    }
}

struct EchoRunner {
    commands: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandRunner for EchoRunner {
    async fn run(&self, command: &str) -> Result<String, ExecError> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(format!("ran: {command}\n"))
    }
}

struct UnreachableRelease;

#[async_trait]
impl SelfUpdate for UnreachableRelease {
    async fn update(&self, _current_version: &str) -> Result<(), UpdateError> {
        Err(UpdateError::BadStatus("404 Not Found".into()))
    }
}

struct Agent {
    runner: Arc<EchoRunner>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn start_agent(endpoint: Url) -> Agent {
    start_agent_with_dial_timeout(endpoint, DIAL_TIMEOUT)
}

fn start_agent_with_dial_timeout(endpoint: Url, dial_timeout: Duration) -> Agent {
    let signing = SigningKey::from_bytes(&KEY_SEED);
    let anchor = STANDARD.encode(signing.verifying_key().to_bytes());
    let runner = Arc::new(EchoRunner {
        commands: Mutex::default(),
    });
    let engine = Arc::new(
        SessionEngine::new(
            endpoint,
            Credentials {
                token: "secret-token".into(),
                server_id: "srv-42".into(),
                version: "0.9.1".into(),
            },
            Arc::new(DirectiveVerifier::from_base64(&anchor)),
            runner.clone(),
            Arc::new(UnreachableRelease),
        )
        .with_dial_timeout(dial_timeout),
    );
    let task = tokio::spawn(async move { engine.connect_forever().await });
    Agent { runner, task }
}

fn signed_command(content: &str, timestamp: i64) -> Value {
    let signing = SigningKey::from_bytes(&KEY_SEED);
    let signature = signing.sign(signed_payload(timestamp, content).as_bytes());
    json!({
        "type": "command",
        "content": content,
        "timestamp": timestamp,
        "signature": STANDARD.encode(signature.to_bytes()),
    })
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[test_timeout::timeout]
async fn authenticates_before_anything_else() {
    init_tracing();
    let mut server = ControlServer::start().await;
    let _agent = start_agent(server.url.clone());

    let mut link = server.accept().await;
    let hello = link.recv_json().await;
    assert_eq!(
        hello,
        json!({"token": "secret-token", "server_id": "srv-42", "version": "0.9.1"})
    );
}

#[test_timeout::timeout]
async fn signed_command_round_trip() {
    init_tracing();
    let mut server = ControlServer::start().await;
    let agent = start_agent(server.url.clone());
    let mut link = server.accept().await;
    link.recv_json().await;

    link.send(signed_command("uptime", now()));
    let reply = link.recv_reply().await;
    assert_eq!(
        reply,
        json!({"type": "command_result", "content": "ran: uptime\n"})
    );
    assert_eq!(*agent.runner.commands.lock().unwrap(), vec!["uptime".to_string()]);
}

#[test_timeout::timeout]
async fn stale_and_forged_commands_get_no_reply() {
    init_tracing();
    let mut server = ControlServer::start().await;
    let agent = start_agent(server.url.clone());
    let mut link = server.accept().await;
    link.recv_json().await;

    link.send(signed_command("uptime", now() - 3600));
    let mut forged = signed_command("uptime", now());
    forged["content"] = json!("cat /etc/shadow");
    link.send(forged);
    link.send(json!({"type": "pong"}));
    link.send(json!({"type": "status", "content": "welcome"}));
    link.send(json!({"no_type": true}));

    link.assert_no_reply().await;
    assert!(agent.runner.commands.lock().unwrap().is_empty());

    // The session survived all of the above.
    link.send(signed_command("hostname", now()));
    assert_eq!(link.recv_reply().await["content"], "ran: hostname\n");
}

#[test_timeout::timeout]
async fn failed_upgrade_reports_status_then_error() {
    init_tracing();
    let mut server = ControlServer::start().await;
    let _agent = start_agent(server.url.clone());
    let mut link = server.accept().await;
    link.recv_json().await;

    link.send(json!({"type": "upgrade"}));
    assert_eq!(
        link.recv_reply().await,
        json!({"type": "status", "content": UPGRADE_NOTICE})
    );
    assert_eq!(
        link.recv_reply().await,
        json!({"type": "error", "content": "Update failed: bad status: 404 Not Found"})
    );
}

#[test_timeout::timeout]
async fn redials_after_server_closes() {
    init_tracing();
    let mut server = ControlServer::start().await;
    let _agent = start_agent(server.url.clone());

    let first = {
        let mut link = server.accept().await;
        let hello = link.recv_json().await;
        link.close();
        hello
    };

    let mut second = server.accept().await;
    assert_eq!(second.recv_json().await, first);

    second.send(signed_command("whoami", now()));
    assert_eq!(second.recv_reply().await["content"], "ran: whoami\n");
}

#[test_timeout::timeout]
async fn keeps_dialing_until_server_appears() {
    init_tracing();
    // Reserve a port, then free it so the first dial is refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    let url = Url::parse(&format!("ws://{addr}/api/v1/agent/connect")).expect("url");
    let _agent = start_agent(url);

    tokio::time::sleep(Duration::from_millis(200)).await;

    let (link_tx, mut links) = mpsc::unbounded_channel();
    let router = Router::new()
        .route("/api/v1/agent/connect", get(upgrade))
        .with_state(link_tx);
    let listener = TcpListener::bind(addr).await.expect("rebind reserved port");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    // First retry fires after one second, the next after two.
    let mut link = tokio::time::timeout(Duration::from_secs(10), links.recv())
        .await
        .expect("agent redialed in time")
        .expect("server running");
    assert_eq!(link.recv_json().await["token"], "secret-token");
}

#[test_timeout::timeout]
async fn redials_when_handshake_never_completes() {
    init_tracing();
    // Accepts TCP but never answers the upgrade request.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let url = Url::parse(&format!("ws://{addr}/api/v1/agent/connect")).expect("url");
    let _agent = start_agent_with_dial_timeout(url, Duration::from_millis(500));

    let (_stalled, _) = listener.accept().await.expect("first dial");
    // Dial timeout plus the first one-second backoff.
    let (_retry, _) = tokio::time::timeout(Duration::from_secs(10), listener.accept())
        .await
        .expect("agent redialed after the stalled handshake")
        .expect("second dial");
}
