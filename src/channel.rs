//! Event channel to the Leon server
//!
//! A spawned task owns the socket: it connects, announces the node role,
//! relays queued hotword events and reconnects with backoff when the
//! transport drops. Callers only see `dispatch`, which never waits on the
//! network, and the coarse `ConnectionState`.

use crate::error::NodeError;
use crate::protocol::{self, HotwordPayload, Inbound, OpenHandshake};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Coarse connectivity as seen from outside the connection task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Destination for hotword events
pub trait EventSink: Send + Sync {
    /// Fire-and-forget: must return without waiting on the transport
    fn dispatch(&self, payload: HotwordPayload);

    fn state(&self) -> ConnectionState;
}

/// Connection tuning
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Events held while the transport is busy or down
    pub queue_capacity: usize,

    pub initial_backoff: Duration,

    pub max_backoff: Duration,

    /// Upper bound on the websocket upgrade plus both handshakes
    pub connect_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 8,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Socket.IO connection to the server
pub struct SocketChannel {
    outbound: mpsc::Sender<HotwordPayload>,
    state: watch::Receiver<ConnectionState>,
    dropped: AtomicU64,
    task: JoinHandle<()>,
}

impl SocketChannel {
    /// Start connecting in the background; returns immediately
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(url: Url, config: ChannelConfig) -> Self {
        let (outbound, queue) = mpsc::channel(config.queue_capacity.max(1));
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);

        info!(url = %url, "Opening server connection");
        let task = tokio::spawn(run_connection(url, queue, state_tx, config));

        Self {
            outbound,
            state,
            dropped: AtomicU64::new(0),
            task,
        }
    }

    /// Watch connectivity changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Events discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for SocketChannel {
    fn dispatch(&self, payload: HotwordPayload) {
        match self.outbound.try_send(payload) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(payload)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(hotword = %payload.hotword, dropped, "Event queue full, dropping hotword event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Connection task has stopped, hotword event not sent");
            }
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_connection(
    url: Url,
    mut queue: mpsc::Receiver<HotwordPayload>,
    state: watch::Sender<ConnectionState>,
    config: ChannelConfig,
) {
    let mut backoff = config.initial_backoff;

    loop {
        state.send_replace(ConnectionState::Connecting);

        let attempt = tokio::time::timeout(config.connect_timeout, connect(&url))
            .await
            .unwrap_or_else(|_| Err(NodeError::TransportFault("handshake timed out".to_string())));

        match attempt {
            Ok((socket, handshake)) => {
                backoff = config.initial_backoff;
                state.send_replace(ConnectionState::Connected);
                info!(sid = %handshake.sid, "Connected to the server");

                let outcome = serve(socket, &handshake, &mut queue).await;
                state.send_replace(ConnectionState::Disconnected);

                match outcome {
                    Ok(()) => {
                        debug!("Event queue closed, connection task exiting");
                        return;
                    }
                    Err(e) => warn!(error = %e, "Connection to the server lost"),
                }
            }
            Err(e) => {
                state.send_replace(ConnectionState::Disconnected);
                debug!(error = %e, retry_in = ?backoff, "Connection attempt failed");
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.max_backoff);
    }
}

/// Open the websocket and complete the Engine.IO and Socket.IO handshakes
async fn connect(url: &Url) -> Result<(Socket, OpenHandshake), NodeError> {
    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(transport)?;

    let handshake = match next_inbound(&mut socket).await? {
        Inbound::Open(handshake) => handshake,
        other => {
            return Err(NodeError::TransportFault(format!(
                "expected open packet, got {:?}",
                other
            )))
        }
    };

    socket
        .send(Message::Text(protocol::connect_packet()))
        .await
        .map_err(transport)?;

    loop {
        match next_inbound(&mut socket).await? {
            Inbound::Connected => break,
            Inbound::Ping => socket
                .send(Message::Text(protocol::pong_packet()))
                .await
                .map_err(transport)?,
            Inbound::ConnectError(message) => {
                return Err(NodeError::TransportFault(format!("connect refused: {message}")))
            }
            Inbound::Close | Inbound::Disconnected => {
                return Err(NodeError::TransportFault("closed during handshake".to_string()))
            }
            _ => {}
        }
    }

    socket
        .send(Message::Text(protocol::init_packet()))
        .await
        .map_err(transport)?;
    info!(role = protocol::NODE_ROLE, "Announced node to the server");

    Ok((socket, handshake))
}

/// Relay queued events until the transport fails or the queue closes
async fn serve(
    socket: Socket,
    handshake: &OpenHandshake,
    queue: &mut mpsc::Receiver<HotwordPayload>,
) -> Result<(), NodeError> {
    let (mut sink, mut stream) = socket.split();

    let liveness = Duration::from_millis(handshake.ping_interval + handshake.ping_timeout);
    let mut deadline = Instant::now() + liveness;

    // Events queued while disconnected: only the most recent is still worth sending
    let mut latest = None;
    let mut stale = 0usize;
    while let Ok(payload) = queue.try_recv() {
        if latest.replace(payload).is_some() {
            stale += 1;
        }
    }
    if stale > 0 {
        info!(stale, "Discarded stale hotword events queued while offline");
    }
    if let Some(payload) = latest {
        before(deadline, send_hotword(&mut sink, payload)).await?;
    }

    loop {
        tokio::select! {
            payload = queue.recv() => match payload {
                Some(payload) => before(deadline, send_hotword(&mut sink, payload)).await?,
                None => {
                    let _ = sink.close().await;
                    return Ok(());
                }
            },
            inbound = next_inbound(&mut stream) => {
                deadline = Instant::now() + liveness;
                match inbound? {
                    Inbound::Ping => {
                        let pong = async {
                            sink.send(Message::Text(protocol::pong_packet()))
                                .await
                                .map_err(transport)
                        };
                        before(deadline, pong).await?
                    }
                    Inbound::Close | Inbound::Disconnected => {
                        return Err(NodeError::TransportFault("server closed the session".to_string()))
                    }
                    Inbound::Event { name, .. } => debug!(event = %name, "Ignoring server event"),
                    _ => {}
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                return Err(NodeError::TransportFault("ping timeout".to_string()));
            }
        }
    }
}

async fn send_hotword(
    sink: &mut SplitSink<Socket, Message>,
    payload: HotwordPayload,
) -> Result<(), NodeError> {
    let hotword = payload.hotword.clone();
    let (header, attachment) = payload.into_packets();

    sink.send(Message::Text(header)).await.map_err(transport)?;
    sink.send(Message::Binary(attachment)).await.map_err(transport)?;

    debug!(hotword = %hotword, "Hotword event sent");
    Ok(())
}

/// Run a send, giving up once the session would be considered dead anyway
async fn before<T, F>(deadline: Instant, op: F) -> Result<T, NodeError>
where
    F: Future<Output = Result<T, NodeError>>,
{
    tokio::time::timeout_at(deadline, op)
        .await
        .map_err(|_| NodeError::TransportFault("send timed out".to_string()))?
}

/// Next decodable Socket.IO packet; undecodable frames are logged and skipped
async fn next_inbound<S>(stream: &mut S) -> Result<Inbound, NodeError>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message.map_err(transport)? {
            Message::Text(text) => match protocol::decode(&text) {
                Ok(inbound) => return Ok(inbound),
                Err(e) => warn!(error = %e, "Skipping undecodable packet"),
            },
            Message::Close(_) => {
                return Err(NodeError::TransportFault("websocket closed".to_string()))
            }
            _ => {}
        }
    }

    Err(NodeError::TransportFault("connection closed".to_string()))
}

fn transport(err: impl std::fmt::Display) -> NodeError {
    NodeError::TransportFault(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChannelConfig::default();
        assert_eq!(config.queue_capacity, 8);
        assert!(config.initial_backoff < config.max_backoff);
        assert!(config.connect_timeout > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_send_past_deadline_is_a_transport_fault() {
        let deadline = Instant::now() + Duration::from_millis(20);
        let stuck = std::future::pending::<Result<(), NodeError>>();

        let err = before(deadline, stuck).await.unwrap_err();
        assert!(matches!(err, NodeError::TransportFault(ref m) if m.contains("timed out")));

        let ok = before(deadline, async { Ok::<_, NodeError>(7) }).await.unwrap();
        assert_eq!(ok, 7);
    }

    #[tokio::test]
    async fn test_dispatch_never_waits_without_server() {
        // Nothing listens on port 9: the task keeps retrying in the background
        let url = protocol::socket_url("http://127.0.0.1:9").unwrap();
        let channel = SocketChannel::open(
            url,
            ChannelConfig {
                queue_capacity: 2,
                ..Default::default()
            },
        );

        for _ in 0..5 {
            channel.dispatch(HotwordPayload {
                hotword: "leon-en".to_string(),
                buffer: vec![0; 1024],
            });
        }

        assert_eq!(channel.dropped(), 3);
        assert_ne!(channel.state(), ConnectionState::Connected);
    }
}
