//! WebSocket transport for one room.
//!
//! The provider owns a background task that dials `<server>/ws/<room>`, pumps
//! queued frames out and incoming frames into its [`Channel`], and reconnects
//! with capped exponential backoff. Every successful (re)connect re-runs the
//! channel's handshake.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::protocol::Frame;
use super::{OutboxReceiver, SyncResult};
use crate::config::ClientConfig;
use crate::form::RoomKey;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A room participant driven by the transport.
///
/// Callbacks run on the transport task; implementations must not block.
pub trait Channel: Send + Sync + 'static {
    /// A connection opened; send any handshake frames
    fn on_connected(&self);

    /// The connection closed or was lost
    fn on_disconnected(&self);

    /// A frame arrived from another member of the room
    fn handle_frame(&self, frame: Frame);

    /// The configured sync timeout elapsed since the last connect
    fn on_sync_timeout(&self) {}

    /// A graceful disconnect is about to close the socket
    fn on_leave(&self) {}

    /// How often `tick` should run while connected
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    fn tick(&self) {}
}

/// Transport state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
struct Timing {
    sync_timeout: Duration,
    reconnect: ClientConfig,
}

enum Exit {
    Lost,
    Shutdown,
}

/// Handle to a running transport task
pub struct WebsocketProvider {
    room: RoomKey,
    status: watch::Receiver<ConnectionStatus>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WebsocketProvider {
    /// Start connecting `channel` to `room`; `outbox` carries the frames the
    /// channel wants sent.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(
        config: &ClientConfig,
        room: RoomKey,
        channel: Arc<dyn Channel>,
        outbox: OutboxReceiver,
    ) -> Self {
        let url = config.room_url(room.as_str());
        let (status_tx, status) = watch::channel(ConnectionStatus::Connecting);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let timing = Timing {
            sync_timeout: config.sync_timeout,
            reconnect: config.clone(),
        };

        info!(room = %room, "Connecting provider to {}", url);
        let task = tokio::spawn(run(
            url,
            room.clone(),
            channel,
            outbox,
            shutdown_rx,
            status_tx,
            timing,
        ));

        Self {
            room,
            status,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    pub fn room(&self) -> &RoomKey {
        &self.room
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Watch status transitions
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Leave the room gracefully and wait for the transport task to end
    pub async fn disconnect(mut self) -> SyncResult<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            task.await?;
        }
        info!(room = %self.room, "Provider disconnected");
        Ok(())
    }
}

impl Drop for WebsocketProvider {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for WebsocketProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebsocketProvider")
            .field("room", &self.room)
            .field("status", &self.status())
            .finish()
    }
}

async fn run(
    url: String,
    room: RoomKey,
    channel: Arc<dyn Channel>,
    mut outbox: OutboxReceiver,
    mut shutdown: oneshot::Receiver<()>,
    status: watch::Sender<ConnectionStatus>,
    timing: Timing,
) {
    let mut attempt: u32 = 0;

    loop {
        let _ = status.send(ConnectionStatus::Connecting);
        let connected = tokio::select! {
            result = connect_async(url.as_str()) => result,
            _ = &mut shutdown => break,
        };

        match connected {
            Ok((socket, _)) => {
                attempt = 0;
                info!(room = %room, "Connected to relay");

                // Frames queued while offline are superseded by the handshake
                while outbox.try_recv().is_ok() {}

                let _ = status.send(ConnectionStatus::Connected);
                channel.on_connected();
                let exit = pump(socket, &room, channel.as_ref(), &mut outbox, &mut shutdown, &timing).await;
                channel.on_disconnected();
                let _ = status.send(ConnectionStatus::Disconnected);

                if let Exit::Shutdown = exit {
                    return;
                }
                warn!(room = %room, "Connection to relay lost");
            }
            Err(e) => {
                debug!(room = %room, attempt, "Failed to connect: {}", e);
            }
        }

        let delay = timing.reconnect.reconnect_delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = sleep(delay) => {}
            _ = &mut shutdown => break,
        }
    }

    let _ = status.send(ConnectionStatus::Disconnected);
}

async fn pump(
    socket: Socket,
    room: &RoomKey,
    channel: &dyn Channel,
    outbox: &mut OutboxReceiver,
    shutdown: &mut oneshot::Receiver<()>,
    timing: &Timing,
) -> Exit {
    let (mut sink, mut stream) = socket.split();

    let sync_deadline = sleep(timing.sync_timeout);
    tokio::pin!(sync_deadline);
    let mut sync_pending = true;

    let mut ticker: Option<Interval> = channel.tick_interval().map(|period| {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        tokio::select! {
            _ = &mut *shutdown => {
                channel.on_leave();
                while let Ok(frame) = outbox.try_recv() {
                    if send_frame(&mut sink, room, frame).await.is_err() {
                        break;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                return Exit::Shutdown;
            }

            frame = outbox.recv() => match frame {
                Some(frame) => {
                    if send_frame(&mut sink, room, frame).await.is_err() {
                        return Exit::Lost;
                    }
                }
                None => {
                    debug!(room = %room, "Outbox dropped, closing connection");
                    let _ = sink.send(Message::Close(None)).await;
                    return Exit::Shutdown;
                }
            },

            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => match Frame::decode(&data) {
                    Ok(frame) => channel.handle_frame(frame),
                    Err(e) => warn!(room = %room, "Dropping malformed frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => return Exit::Lost,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(room = %room, "WebSocket error: {}", e);
                    return Exit::Lost;
                }
            },

            _ = &mut sync_deadline, if sync_pending => {
                sync_pending = false;
                channel.on_sync_timeout();
            }

            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => channel.tick(),
        }
    }
}

async fn send_frame<S>(sink: &mut S, room: &RoomKey, frame: Frame) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let kind = frame.kind;
    let bytes = match frame.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(room = %room, ?kind, "Failed to encode frame: {}", e);
            return Ok(());
        }
    };

    sink.send(Message::Binary(bytes.to_vec())).await.map_err(|e| {
        warn!(room = %room, ?kind, "Failed to send frame: {}", e);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::outbox;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<&'static str>>,
    }

    impl Channel for Recorder {
        fn on_connected(&self) {
            self.events.lock().push("connected");
        }

        fn on_disconnected(&self) {
            self.events.lock().push("disconnected");
        }

        fn handle_frame(&self, _frame: Frame) {
            self.events.lock().push("frame");
        }
    }

    #[tokio::test]
    async fn test_disconnect_while_server_unreachable() {
        // Port 9 on localhost is not expected to accept WebSocket upgrades
        let config = ClientConfig::new("ws://127.0.0.1:9")
            .with_reconnect(Duration::from_millis(5), Duration::from_millis(20));
        let (_tx, rx) = outbox();
        let recorder = Arc::new(Recorder::default());

        let provider = WebsocketProvider::connect(&config, RoomKey::form("x"), recorder.clone(), rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_ne!(provider.status(), ConnectionStatus::Connected);

        provider.disconnect().await.unwrap();
        assert!(recorder.events.lock().is_empty());
    }

    #[test]
    fn test_default_channel_hooks() {
        let recorder = Recorder::default();
        assert!(recorder.tick_interval().is_none());
        recorder.on_sync_timeout();
        recorder.on_leave();
        recorder.tick();
        assert!(recorder.events.lock().is_empty());
    }
}
