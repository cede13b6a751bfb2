use std::time::Duration;

use ahash::AHashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use sb_core::config::ClientConfig;
use sb_core::types::ControlMessage;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::protocol::{Connectivity, Effect, Protocol, ProtocolSettings, TimerId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Terminal stream endpoint (`ws://` or `wss://`).
    pub ws_url: String,
    /// Side-channel status endpoint polled during long outages.
    pub status_url: Option<String>,
    pub config: ClientConfig,
    pub connect_timeout: Duration,
}

impl ClientOptions {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            status_url: None,
            config: ClientConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Endpoints for one session on a daemon at `base_url` (`http://host:port`).
    pub fn for_session(base_url: &str, session_id: &str, config: ClientConfig) -> Self {
        let base = base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        Self {
            ws_url: format!("{ws_base}/ws/terminal/{session_id}"),
            status_url: Some(format!("{base}/api/sessions/{session_id}/status")),
            config,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Something for the terminal view to render. Snapshots replace whatever
/// state the view holds; they are not increments of the live stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Live(Vec<u8>),
    Snapshot(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    State(Connectivity),
    Delivery(Delivery),
    Exhausted(ClientError),
}

enum Command {
    Input(Vec<u8>),
    Control(ControlMessage),
    Reconnect,
    Shutdown,
}

/// Handle held by the terminal view. Dropping it tears the connection down.
pub struct ClientHandle {
    commands: flume::Sender<Command>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    /// Send keystrokes. Dropped (not queued) while disconnected.
    pub fn send_input(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.command(Command::Input(data.into()))
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.command(Command::Control(ControlMessage::Resize { rows, cols }))
    }

    pub fn set_prompt_watcher(&self, enabled: bool) -> Result<()> {
        self.command(Command::Control(ControlMessage::PromptWatcher { enabled }))
    }

    /// Reconnect now with a fresh attempt budget.
    pub fn reconnect(&self) -> Result<()> {
        self.command(Command::Reconnect)
    }

    /// Cancel all timers, close the transport and wait for the driver.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            warn!(error = %e, "client driver task failed");
        }
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

enum Internal {
    Opened {
        generation: u64,
        stream: Box<WsStream>,
    },
    OpenFailed {
        generation: u64,
        error: ClientError,
    },
    Frame {
        generation: u64,
        data: Vec<u8>,
    },
    Closed {
        generation: u64,
    },
    Timer(TimerId),
    Snapshot(serde_json::Value),
    PollFailed(ClientError),
}

/// Runs [`Protocol`] against a real WebSocket. All transitions happen on a
/// single task; connects, reads, timers and polls report back through one
/// channel.
pub struct ClientConnection {
    options: ClientOptions,
    protocol: Protocol,
    events: flume::Sender<ClientEvent>,
    internal: flume::Sender<Internal>,
    http: reqwest::Client,
    sink: Option<SplitSink<WsStream, Message>>,
    reader: Option<JoinHandle<()>>,
    connector: Option<JoinHandle<()>>,
    /// Bumped whenever the transport is replaced; events from older
    /// transports are ignored.
    generation: u64,
    timers: AHashMap<TimerId, JoinHandle<()>>,
}

impl ClientConnection {
    /// Start connecting in the background.
    pub fn spawn(options: ClientOptions) -> (ClientHandle, flume::Receiver<ClientEvent>) {
        let (events_tx, events_rx) = flume::unbounded();
        let (commands_tx, commands_rx) = flume::unbounded();
        let (internal_tx, internal_rx) = flume::unbounded();

        let settings =
            ProtocolSettings::from_config(&options.config, options.status_url.is_some());
        let connection = Self {
            protocol: Protocol::new(settings),
            options,
            events: events_tx,
            internal: internal_tx,
            http: reqwest::Client::new(),
            sink: None,
            reader: None,
            connector: None,
            generation: 0,
            timers: AHashMap::new(),
        };

        let task = tokio::spawn(connection.run(commands_rx, internal_rx));
        let handle = ClientHandle {
            commands: commands_tx,
            task,
        };
        (handle, events_rx)
    }

    async fn run(
        mut self,
        commands: flume::Receiver<Command>,
        internal: flume::Receiver<Internal>,
    ) {
        info!(url = %self.options.ws_url, "client connection starting");
        let effects = self.protocol.start();
        self.apply(effects).await;

        loop {
            tokio::select! {
                command = commands.recv_async() => match command {
                    Ok(Command::Input(data)) => self.send(Message::Binary(data.into())).await,
                    Ok(Command::Control(msg)) => match serde_json::to_string(&msg) {
                        Ok(text) => self.send(Message::Text(text.into())).await,
                        Err(e) => warn!(error = %e, "failed to encode control message"),
                    },
                    Ok(Command::Reconnect) => {
                        let effects = self.protocol.reconnect();
                        self.apply(effects).await;
                    }
                    Ok(Command::Shutdown) | Err(_) => break,
                },
                Ok(event) = internal.recv_async() => self.handle_internal(event).await,
            }
        }

        let effects = self.protocol.shutdown();
        self.apply(effects).await;
        self.drop_transport();
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        info!(url = %self.options.ws_url, "client connection stopped");
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Opened { generation, stream } => {
                if generation != self.generation {
                    debug!(generation, "discarding stale connection");
                    return;
                }
                self.connector = None;
                let (sink, stream) = (*stream).split();
                self.sink = Some(sink);
                self.reader = Some(tokio::spawn(read_frames(
                    stream,
                    generation,
                    self.internal.clone(),
                )));
                let effects = self.protocol.on_open();
                self.apply(effects).await;
            }
            Internal::OpenFailed { generation, error } => {
                if generation != self.generation {
                    return;
                }
                self.connector = None;
                warn!(%error, attempt = self.protocol.attempts(), "connect attempt failed");
                let effects = self.protocol.on_close();
                self.apply(effects).await;
            }
            Internal::Frame { generation, data } => {
                if generation == self.generation && self.protocol.is_connected() {
                    self.emit(ClientEvent::Delivery(Delivery::Live(data)));
                }
            }
            Internal::Closed { generation } => {
                if generation != self.generation {
                    return;
                }
                self.drop_transport();
                let effects = self.protocol.on_close();
                self.apply(effects).await;
            }
            Internal::Timer(timer) => {
                self.timers.remove(&timer);
                let effects = self.protocol.on_timer(timer);
                self.apply(effects).await;
            }
            Internal::Snapshot(snapshot) => {
                if self.protocol.accepts_snapshot() {
                    self.emit(ClientEvent::Delivery(Delivery::Snapshot(snapshot)));
                } else {
                    debug!("discarding status snapshot that arrived after reconnect");
                }
            }
            Internal::PollFailed(error) => warn!(%error, "status poll failed"),
        }
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Open => self.open(),
                Effect::Close => self.close_transport().await,
                Effect::Schedule { timer, after } => {
                    let internal = self.internal.clone();
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = internal.send(Internal::Timer(timer));
                    });
                    self.timers.insert(timer, task);
                }
                Effect::Cancel(timer) => {
                    if let Some(task) = self.timers.remove(&timer) {
                        task.abort();
                    }
                }
                Effect::FetchStatus => self.fetch_status(),
                Effect::Connectivity(state) => {
                    info!(%state, "connectivity changed");
                    self.emit(ClientEvent::State(state));
                }
                Effect::Exhausted { attempts } => {
                    self.emit(ClientEvent::Exhausted(ClientError::ReconnectExhausted {
                        attempts,
                    }));
                }
            }
        }
    }

    fn open(&mut self) {
        self.drop_transport();
        let generation = self.generation;
        let url = self.options.ws_url.clone();
        let timeout = self.options.connect_timeout;
        let internal = self.internal.clone();
        debug!(%url, generation, "opening connection");

        self.connector = Some(tokio::spawn(async move {
            let event = match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
                .await
            {
                Ok(Ok((stream, _response))) => Internal::Opened {
                    generation,
                    stream: Box::new(stream),
                },
                Ok(Err(e)) => Internal::OpenFailed {
                    generation,
                    error: ClientError::Connect(e.to_string()),
                },
                Err(_) => Internal::OpenFailed {
                    generation,
                    error: ClientError::Connect(format!("timed out after {timeout:?}")),
                },
            };
            let _ = internal.send(event);
        }));
    }

    async fn close_transport(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        self.drop_transport();
    }

    /// Forget the current transport and its tasks.
    fn drop_transport(&mut self) {
        self.generation += 1;
        self.sink = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(connector) = self.connector.take() {
            connector.abort();
        }
    }

    async fn send(&mut self, message: Message) {
        let sink = match self.sink.as_mut() {
            Some(sink) if self.protocol.is_connected() => sink,
            _ => {
                debug!("not connected, dropping outbound message");
                return;
            }
        };
        let result = sink.send(message).await;
        if let Err(e) = result {
            warn!(error = %e, "send failed, treating connection as lost");
            self.drop_transport();
            let effects = self.protocol.on_close();
            self.apply(effects).await;
        }
    }

    fn fetch_status(&self) {
        let Some(url) = self.options.status_url.clone() else {
            return;
        };
        let http = self.http.clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = async {
                http.get(&url)
                    .send()
                    .await?
                    .error_for_status()?
                    .json::<serde_json::Value>()
                    .await
            }
            .await;
            let event = match result {
                Ok(snapshot) => Internal::Snapshot(snapshot),
                Err(e) => Internal::PollFailed(ClientError::Poll(e.to_string())),
            };
            let _ = internal.send(event);
        });
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

async fn read_frames(
    mut stream: futures_util::stream::SplitStream<WsStream>,
    generation: u64,
    internal: flume::Sender<Internal>,
) {
    while let Some(message) = stream.next().await {
        let data = match message {
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Text(text)) => text.as_str().as_bytes().to_vec(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "websocket read error");
                break;
            }
        };
        if internal.send(Internal::Frame { generation, data }).is_err() {
            return;
        }
    }
    let _ = internal.send(Internal::Closed { generation });
}
