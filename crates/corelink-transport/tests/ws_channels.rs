//! End-to-end channel tests against the WebSocket router.

#![cfg(unix)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use corelink_core::{
    Frame,
    traits::{LogChunkStream, LogSource, LogSourceError},
};
use corelink_executor::{CommandPolicy, HostSpawner, PresetCatalog, SessionConfig};
use corelink_session::{ChannelRegistry, Collaborators, RegistryConfig, SampleHub};
use corelink_transport::{
    ChannelClient, ChannelEvent, ClientMessage, ReconnectPolicy, create_ws_router,
};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::AbortHandle,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Log source with no containers.
struct NoContainers;

#[async_trait]
impl LogSource for NoContainers {
    async fn follow(&self, container: &str, _tail: usize) -> Result<LogChunkStream, LogSourceError> {
        Err(LogSourceError::NotFound(container.to_string()))
    }
}

async fn serve(timeout: Duration) -> (String, Arc<ChannelRegistry>) {
    let registry = Arc::new(ChannelRegistry::new(
        Collaborators {
            spawner: Arc::new(HostSpawner::local()),
            log_source: Arc::new(NoContainers),
            hub: Arc::new(SampleHub::new()),
            policy: CommandPolicy::default(),
            presets: PresetCatalog::builtin(),
        },
        RegistryConfig {
            session: SessionConfig {
                timeout,
                kill_grace: Duration::from_millis(500),
            },
            ..RegistryConfig::default()
        },
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_ws_router(Arc::clone(&registry));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("ws://{addr}"), registry)
}

/// TCP relay in front of the server whose live connections can be cut.
struct Relay {
    base: String,
    links: Arc<Mutex<Vec<AbortHandle>>>,
}

impl Relay {
    async fn start(upstream: &str) -> Self {
        let upstream = upstream.trim_start_matches("ws://").to_owned();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let links = Arc::new(Mutex::new(Vec::new()));

        let accepted = Arc::clone(&links);
        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let upstream = upstream.clone();
                let link = tokio::spawn(async move {
                    let mut outbound = TcpStream::connect(upstream).await.unwrap();
                    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                });
                accepted.lock().unwrap().push(link.abort_handle());
            }
        });

        Self {
            base: format!("ws://{addr}"),
            links,
        }
    }

    /// Drop every connection relayed so far.
    fn sever(&self) {
        for link in self.links.lock().unwrap().drain(..) {
            link.abort();
        }
    }
}

async fn open(base: &str, path: &str) -> Socket {
    let (ws, _) = connect_async(format!("{base}{path}")).await.unwrap();
    ws
}

async fn submit(ws: &mut Socket, payload: &str) {
    ws.send(Message::Text(payload.to_owned().into())).await.unwrap();
}

async fn next_frame(ws: &mut Socket) -> Frame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return Frame::from_wire(text.as_str());
        }
    }
}

async fn next_event(events: &mut mpsc::Receiver<ChannelEvent>) -> ChannelEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended")
}

async fn wait_for_channels(registry: &ChannelRegistry, expected: usize) {
    for _ in 0..100 {
        if registry.channel_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("registry never reached {expected} channels");
}

#[tokio::test]
async fn test_echo_hello_over_websocket() {
    let (base, _registry) = serve(Duration::from_secs(10)).await;
    let mut ws = open(&base, "/api/commands/ws/exec").await;

    submit(&mut ws, r#"{"command":"echo hello"}"#).await;

    assert_eq!(
        next_frame(&mut ws).await,
        Frame::ExecStart {
            command: "echo hello".into()
        }
    );
    assert_eq!(
        next_frame(&mut ws).await,
        Frame::ExecOutput {
            data: "hello\n".into()
        }
    );
    assert_eq!(
        next_frame(&mut ws).await,
        Frame::ExecDone {
            command: "echo hello".into(),
            exit_code: Some(0)
        }
    );
}

#[tokio::test]
async fn test_busy_rejection_and_release_on_close() {
    let (base, registry) = serve(Duration::from_secs(10)).await;
    let mut ws = open(&base, "/api/commands/ws/exec").await;

    submit(&mut ws, r#"{"type":"exec","command":"echo first; sleep 30"}"#).await;
    assert!(matches!(next_frame(&mut ws).await, Frame::ExecStart { .. }));
    assert_eq!(
        next_frame(&mut ws).await,
        Frame::ExecOutput {
            data: "first\n".into()
        }
    );

    submit(&mut ws, r#"{"command":"echo second"}"#).await;
    assert_eq!(
        next_frame(&mut ws).await,
        Frame::exec_error("A command is already running")
    );
    assert_eq!(registry.channel_count().await, 1);

    ws.close(None).await.unwrap();
    wait_for_channels(&registry, 0).await;
}

#[tokio::test]
async fn test_timeout_reports_exec_error() {
    let (base, _registry) = serve(Duration::from_secs(1)).await;
    let mut ws = open(&base, "/api/commands/ws/exec").await;

    let started = std::time::Instant::now();
    submit(&mut ws, r#"{"command":"sleep 5"}"#).await;
    assert!(matches!(next_frame(&mut ws).await, Frame::ExecStart { .. }));

    let Frame::ExecError { data } = next_frame(&mut ws).await else {
        panic!("expected exec_error");
    };
    assert!(data.starts_with("[TIMEOUT]"), "{data}");
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_invalid_message_gets_error_frame() {
    let (base, _registry) = serve(Duration::from_secs(10)).await;
    let mut ws = open(&base, "/api/commands/ws/exec").await;

    submit(&mut ws, "not json").await;
    let Frame::Error { data } = next_frame(&mut ws).await else {
        panic!("expected error frame");
    };
    assert!(data.starts_with("Invalid message"));

    submit(&mut ws, r#"{"type":"ping"}"#).await;
    assert_eq!(next_frame(&mut ws).await, Frame::Pong);
}

#[tokio::test]
async fn test_non_utf8_binary_gets_error_frame() {
    let (base, _registry) = serve(Duration::from_secs(10)).await;
    let mut ws = open(&base, "/api/commands/ws/exec").await;

    ws.send(Message::Binary(vec![0xff, 0xfe, 0xfd].into()))
        .await
        .unwrap();
    let Frame::Error { data } = next_frame(&mut ws).await else {
        panic!("expected error frame");
    };
    assert!(data.starts_with("Invalid message"), "{data}");

    ws.send(Message::Binary(br#"{"type":"ping"}"#.to_vec().into()))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut ws).await, Frame::Pong);
}

#[tokio::test]
async fn test_missing_container_log_channel() {
    let (base, registry) = serve(Duration::from_secs(10)).await;
    let mut ws = open(&base, "/api/logs/ws/ghost").await;

    assert_eq!(
        next_frame(&mut ws).await,
        Frame::error("Container 'ghost' not found")
    );
    assert_eq!(registry.channel_count().await, 1);
}

#[tokio::test]
async fn test_client_channel_runs_command() {
    let (base, registry) = serve(Duration::from_secs(10)).await;
    let (client, mut events) = ChannelClient::connect(
        format!("{base}/api/commands/ws/exec"),
        ReconnectPolicy {
            base_delay: Duration::from_millis(20),
            ..ReconnectPolicy::default()
        },
    );

    assert_eq!(next_event(&mut events).await, ChannelEvent::Opened);
    client.send(&ClientMessage::exec("echo hi")).unwrap();

    let mut frames = Vec::new();
    loop {
        match next_event(&mut events).await {
            ChannelEvent::Frame(frame) => {
                let done = frame.is_terminal();
                frames.push(frame);
                if done {
                    break;
                }
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(
        frames,
        [
            Frame::ExecStart {
                command: "echo hi".into()
            },
            Frame::ExecOutput {
                data: "hi\n".into()
            },
            Frame::ExecDone {
                command: "echo hi".into(),
                exit_code: Some(0)
            },
        ]
    );

    client.close();
    assert_eq!(next_event(&mut events).await, ChannelEvent::Disconnected);
    wait_for_channels(&registry, 0).await;
}

#[tokio::test]
async fn test_client_reconnects_after_drop_mid_command() {
    let (base, registry) = serve(Duration::from_secs(60)).await;
    let relay = Relay::start(&base).await;
    let base_delay = Duration::from_millis(20);
    let (client, mut events) = ChannelClient::connect(
        format!("{}/api/commands/ws/exec", relay.base),
        ReconnectPolicy {
            base_delay,
            ..ReconnectPolicy::default()
        },
    );

    assert_eq!(next_event(&mut events).await, ChannelEvent::Opened);
    client.send(&ClientMessage::exec("sleep 30")).unwrap();
    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::Frame(Frame::ExecStart {
            command: "sleep 30".into()
        })
    );

    relay.sever();
    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::Reconnecting {
            attempt: 1,
            delay: base_delay
        }
    );
    assert_eq!(next_event(&mut events).await, ChannelEvent::Opened);

    // The old channel and its session are gone; the new one is idle.
    wait_for_channels(&registry, 1).await;
    client.send(&ClientMessage::exec("echo again")).unwrap();

    let mut frames = Vec::new();
    loop {
        match next_event(&mut events).await {
            ChannelEvent::Frame(frame) => {
                let done = frame.is_terminal();
                frames.push(frame);
                if done {
                    break;
                }
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(
        frames,
        [
            Frame::ExecStart {
                command: "echo again".into()
            },
            Frame::ExecOutput {
                data: "again\n".into()
            },
            Frame::ExecDone {
                command: "echo again".into(),
                exit_code: Some(0)
            },
        ]
    );

    client.close();
    assert_eq!(next_event(&mut events).await, ChannelEvent::Disconnected);
    wait_for_channels(&registry, 0).await;
}
