//! Duplex client connection.
//!
//! A [`DuplexConnection`] owns one upgraded socket and runs three loops over
//! it:
//!
//! - read loop: transport → inbound buffer
//! - write loop: outbound buffer → transport (owns the write half)
//! - heartbeat loop: periodic heartbeat frames plus liveness check
//!
//! Whichever loop fails first closes the connection; the close signal stops the
//! other two and the write loop releases the transport exactly once.

use crate::error::{GatewayError, Result};
use crate::protocol::ControlMessage;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Frames buffered per direction before `send` waits.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// Interval between heartbeat frames.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Heartbeats sent without inbound traffic before the connection is dropped.
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 10;

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub buffer_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

/// Read half of a frame transport.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next data frame; `None` at end of stream.
    async fn read_frame(&mut self) -> Result<Option<Bytes>>;
}

/// Write half of a frame transport.
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn write_frame(&mut self, frame: Bytes) -> Result<()>;

    /// Release the transport. Called once, by the write loop.
    async fn close(&mut self);
}

/// Read half of an axum WebSocket.
pub struct WsSource(SplitStream<WebSocket>);

/// Write half of an axum WebSocket.
pub struct WsSink(SplitSink<WebSocket, Message>);

/// Split an upgraded WebSocket into frame halves.
pub fn split_socket(socket: WebSocket) -> (WsSource, WsSink) {
    let (sink, stream) = socket.split();
    (WsSource(stream), WsSink(sink))
}

#[async_trait]
impl FrameSource for WsSource {
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        while let Some(msg) = self.0.next().await {
            match msg.map_err(|e| GatewayError::WebSocket(e.to_string()))? {
                Message::Text(text) => {
                    return Ok(Some(Bytes::copy_from_slice(text.as_str().as_bytes())))
                }
                Message::Binary(data) => return Ok(Some(data)),
                Message::Close(_) => return Ok(None),
                // Control frames are answered by the WebSocket layer.
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        let msg = match std::str::from_utf8(&frame) {
            Ok(text) => Message::Text(text.to_string().into()),
            Err(_) => Message::Binary(frame),
        };
        self.0
            .send(msg)
            .await
            .map_err(|e| GatewayError::WebSocket(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.send(Message::Close(None)).await;
        let _ = self.0.close().await;
    }
}

/// One live client connection.
pub struct DuplexConnection {
    id: String,
    outbound: mpsc::Sender<Bytes>,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    closed: AtomicBool,
    close_signal: CancellationToken,
    missed_heartbeats: AtomicU32,
}

impl DuplexConnection {
    /// Wrap a transport and start the read, write and heartbeat loops.
    pub fn spawn<R, W>(
        id: impl Into<String>,
        source: R,
        sink: W,
        config: ConnectionConfig,
    ) -> Arc<Self>
    where
        R: FrameSource,
        W: FrameSink,
    {
        let capacity = config.buffer_capacity.max(1);
        let (outbound, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound) = mpsc::channel(capacity);

        let conn = Arc::new(Self {
            id: id.into(),
            outbound,
            inbound: Mutex::new(inbound),
            closed: AtomicBool::new(false),
            close_signal: CancellationToken::new(),
            missed_heartbeats: AtomicU32::new(0),
        });

        tokio::spawn(conn.clone().read_loop(source, inbound_tx));
        tokio::spawn(conn.clone().write_loop(sink, outbound_rx));
        tokio::spawn(conn.clone().heartbeat_loop(config));
        conn
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a frame for the client, waiting while the outbound buffer is full.
    pub async fn send(&self, frame: impl Into<Bytes>) -> Result<()> {
        if self.is_closed() {
            return Err(GatewayError::ConnectionClosed);
        }
        tokio::select! {
            biased;
            _ = self.close_signal.cancelled() => Err(GatewayError::ConnectionClosed),
            sent = self.outbound.send(frame.into()) => {
                sent.map_err(|_| GatewayError::ConnectionClosed)
            }
        }
    }

    /// Next frame from the client. Any inbound frame counts as liveness.
    pub async fn receive(&self) -> Result<Bytes> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            _ = self.close_signal.cancelled() => Err(GatewayError::ConnectionClosed),
            frame = inbound.recv() => match frame {
                Some(frame) => {
                    self.missed_heartbeats.store(0, Ordering::SeqCst);
                    Ok(frame)
                }
                None => Err(GatewayError::ConnectionClosed),
            },
        }
    }

    /// Close the connection. Safe to call any number of times from anywhere.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_signal.cancel();
        debug!("Connection {} closing", self.id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.close_signal.cancelled().await
    }

    async fn read_loop<R: FrameSource>(
        self: Arc<Self>,
        mut source: R,
        inbound: mpsc::Sender<Bytes>,
    ) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.close_signal.cancelled() => break,
                frame = source.read_frame() => frame,
            };
            match frame {
                Ok(Some(frame)) => {
                    counter!("gateway_frames_received_total").increment(1);
                    tokio::select! {
                        biased;
                        _ = self.close_signal.cancelled() => break,
                        pushed = inbound.send(frame) => {
                            if pushed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Ok(None) => {
                    debug!("Connection {} reached end of stream", self.id);
                    break;
                }
                Err(e) => {
                    debug!("Connection {} read failed: {}", self.id, e);
                    break;
                }
            }
        }
        self.close();
    }

    async fn write_loop<W: FrameSink>(
        self: Arc<Self>,
        mut sink: W,
        mut outbound: mpsc::Receiver<Bytes>,
    ) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.close_signal.cancelled() => break,
                frame = outbound.recv() => frame,
            };
            let Some(frame) = frame else { break };
            let written = tokio::select! {
                biased;
                _ = self.close_signal.cancelled() => break,
                written = sink.write_frame(frame) => written,
            };
            if let Err(e) = written {
                debug!("Connection {} write failed: {}", self.id, e);
                break;
            }
            counter!("gateway_frames_sent_total").increment(1);
        }
        self.close();
        sink.close().await;
    }

    async fn heartbeat_loop(self: Arc<Self>, config: ConnectionConfig) {
        let period = config.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.close_signal.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let missed = self.missed_heartbeats.fetch_add(1, Ordering::SeqCst) + 1;
            if missed > config.max_missed_heartbeats {
                info!(
                    "Connection {} missed {} heartbeats; closing",
                    self.id, config.max_missed_heartbeats
                );
                counter!("gateway_heartbeat_evictions_total").increment(1);
                break;
            }

            let frame = match ControlMessage::heartbeat(missed).to_bytes() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Failed to encode heartbeat: {}", e);
                    continue;
                }
            };
            if self.send(frame).await.is_err() {
                break;
            }
        }
        self.close();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{pipe, Peer, PipeSource};
    use super::*;
    use std::sync::atomic::AtomicUsize;

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways_in_order() {
        let (conn, mut peer) = pipe("alice", ConnectionConfig::default());

        peer.send_json("one");
        peer.send_json("two");
        assert_eq!(conn.receive().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(conn.receive().await.unwrap(), Bytes::from_static(b"two"));

        conn.send("three").await.unwrap();
        conn.send("four").await.unwrap();
        assert_eq!(peer.next_frame().await.as_deref(), Some("three"));
        assert_eq!(peer.next_frame().await.as_deref(), Some("four"));
    }

    #[tokio::test]
    async fn test_concurrent_close_releases_transport_once() {
        let (conn, peer) = pipe("alice", ConnectionConfig::default());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move { conn.close() }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        conn.close();

        conn.closed().await;
        assert!(conn.is_closed());
        eventually(|| peer.closes.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(peer.closes.load(Ordering::SeqCst), 1);

        assert!(matches!(
            conn.send("late").await,
            Err(GatewayError::ConnectionClosed)
        ));
        assert!(matches!(
            conn.receive().await,
            Err(GatewayError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_end_of_stream_closes() {
        let (conn, peer) = pipe("alice", ConnectionConfig::default());
        let closes = peer.closes.clone();
        drop(peer);

        tokio::time::timeout(Duration::from_secs(2), conn.closed())
            .await
            .unwrap();
        eventually(|| closes.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_write_failure_closes() {
        let (conn, peer) = pipe("alice", ConnectionConfig::default());
        let Peer {
            to_server,
            from_server,
            closes,
        } = peer;
        drop(from_server);

        let _ = conn.send("lost").await;
        tokio::time::timeout(Duration::from_secs(2), conn.closed())
            .await
            .unwrap();
        eventually(|| closes.load(Ordering::SeqCst) == 1).await;
        drop(to_server);
    }

    /// Sink whose writes never complete.
    struct StalledSink {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FrameSink for StalledSink {
        async fn write_frame(&mut self, _frame: Bytes) -> Result<()> {
            std::future::pending().await
        }

        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_send_waits_while_outbound_full() {
        let config = ConnectionConfig {
            buffer_capacity: 2,
            ..ConnectionConfig::default()
        };
        let (_to_server, server_rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let conn = DuplexConnection::spawn(
            "alice",
            PipeSource(server_rx),
            StalledSink {
                closes: closes.clone(),
            },
            config,
        );

        // One frame is stuck in the sink, two more fill the buffer.
        for frame in ["1", "2", "3"] {
            tokio::time::timeout(Duration::from_secs(2), conn.send(frame))
                .await
                .unwrap()
                .unwrap();
        }

        let blocked = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send("4").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!blocked.is_finished());

        conn.close();
        let sent = tokio::time::timeout(Duration::from_secs(2), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(sent, Err(GatewayError::ConnectionClosed)));

        // The stuck write is abandoned and the transport still released.
        eventually(|| closes.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_close_interrupts_read_loop_on_full_inbound() {
        let config = ConnectionConfig {
            buffer_capacity: 1,
            ..ConnectionConfig::default()
        };
        let (conn, peer) = pipe("alice", config);

        // The first frame fills the buffer; the read loop then waits on the second.
        peer.send_json("one");
        peer.send_json("two");
        peer.send_json("three");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!peer.to_server.is_closed());
        assert!(!conn.is_closed());

        conn.close();
        // The read loop drops its source once it stops.
        eventually(|| peer.to_server.is_closed()).await;
        assert!(matches!(
            conn.receive().await,
            Err(GatewayError::ConnectionClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_eviction() {
        let config = ConnectionConfig {
            heartbeat_interval: Duration::from_secs(10),
            max_missed_heartbeats: 3,
            buffer_capacity: 16,
        };
        let (conn, mut peer) = pipe("alice", config);

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(!conn.is_closed());

        let mut beats = Vec::new();
        while let Ok(frame) = peer.from_server.try_recv() {
            beats.push(String::from_utf8(frame.to_vec()).unwrap());
        }
        assert_eq!(
            beats,
            vec![
                r#"{"action":"heartbeat","message":"1 times"}"#,
                r#"{"action":"heartbeat","message":"2 times"}"#,
                r#"{"action":"heartbeat","message":"3 times"}"#,
            ]
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_traffic_resets_heartbeat() {
        let config = ConnectionConfig {
            heartbeat_interval: Duration::from_secs(10),
            max_missed_heartbeats: 2,
            buffer_capacity: 16,
        };
        let (conn, peer) = pipe("alice", config);

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(15)).await;
            peer.send_json(r#"{"action":"heartbeat"}"#);
            conn.receive().await.unwrap();
        }
        assert!(!conn.is_closed());

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(conn.is_closed());
    }
}
