//! Link management
//!
//! A [`Connection`] owns one [`ByteStream`]: a background reader task pulls
//! bytes, reassembles frames with the [`FrameCodec`] and publishes them to the
//! [`Dispatcher`], while callers send frames through [`Connection::send_packet`].
//! The [`ConnectionManager`] holds the single current connection and replaces
//! it atomically on reconnect.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

mod stats;
mod stream;

pub use self::stats::{ConnectionStats, StatsSnapshot};
pub use self::stream::{
    list_serial_ports, AsyncStream, ByteStream, LinkConfig, StreamReader, StreamWriter, Target,
    DEFAULT_BAUD_RATE, DEFAULT_TCP_PORT,
};

use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::protocols::apl::Message;
use crate::protocols::lpl::{FrameCodec, MAX_FRAME_LEN};

struct TxState {
    stream: StreamWriter,
    codec: FrameCodec,
    tx_buffer: BytesMut,
}

pub struct Connection {
    name: String,
    tx: Mutex<TxState>,
    stats: Arc<ConnectionStats>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Takes ownership of `stream` and starts the reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(stream: ByteStream, dispatcher: Arc<Dispatcher>, config: &LinkConfig) -> Self {
        let (name, reader, writer) = stream.into_split();
        let stats = Arc::new(ConnectionStats::default());
        let cancel = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            name.clone(),
            reader,
            dispatcher,
            stats.clone(),
            cancel.clone(),
            config.read_size,
            config.read_timeout,
        ));

        Self {
            name,
            tx: Mutex::new(TxState {
                stream: writer,
                codec: FrameCodec::new(),
                tx_buffer: BytesMut::with_capacity(MAX_FRAME_LEN),
            }),
            stats,
            cancel,
            reader,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Frames `message` and writes it to the stream.
    pub async fn send_packet(&self, message: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotConnected);
        }

        let mut tx = self.tx.lock().await;
        let TxState {
            stream,
            codec,
            tx_buffer,
        } = &mut *tx;

        tx_buffer.clear();
        codec.encode(message, tx_buffer)?;

        match stream.write(&tx_buffer[..]).await {
            Ok(n) => {
                self.stats.record_tx_packet(n);
                Ok(())
            }
            Err(e) => {
                self.stats.record_tx_error();
                Err(e)
            }
        }
    }

    pub async fn send_message(&self, message: &Message) -> Result<()> {
        self.send_packet(&message.encode()).await
    }

    /// Stops the reader. Pending and future sends fail with
    /// [`Error::NotConnected`].
    pub fn invalidate(&self) {
        self.cancel.cancel();
    }

    pub async fn close(&self) -> Result<()> {
        self.invalidate();
        let mut tx = self.tx.lock().await;
        tx.stream.close().await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.reader.abort();
    }
}

async fn read_loop(
    name: String,
    mut reader: StreamReader,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<ConnectionStats>,
    cancel: CancellationToken,
    read_size: usize,
    read_timeout: Duration,
) {
    let mut codec = FrameCodec::new();
    let mut rx_buffer = BytesMut::with_capacity(MAX_FRAME_LEN);

    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => break,
            res = reader.read(read_size, read_timeout) => res,
        };

        match data {
            Ok(data) => {
                stats.record_rx_bytes(data.len());
                rx_buffer.extend_from_slice(&data);
            }
            Err(Error::Timeout) => continue,
            Err(e) => {
                warn!("{}: link closed: {}", name, e);
                break;
            }
        }

        loop {
            match codec.decode(&mut rx_buffer) {
                Ok(Some(Ok(frame))) => {
                    stats.record_rx_packet();
                    debug!("{}: received {} byte message", name, frame.len());
                    // unroutable frames are reported by the dispatcher
                    let _ = dispatcher.publish(frame);
                }
                Ok(Some(Err(e))) => {
                    stats.record_rx_error();
                    warn!("{}: dropped frame: {}", name, e);
                }
                Ok(None) => break,
                Err(e) => {
                    stats.record_rx_error();
                    warn!("{}: receive buffer reset: {}", name, e);
                    rx_buffer.clear();
                    break;
                }
            }
        }
    }

    cancel.cancel();
    debug!("{}: reader stopped", name);
}

/// Owner of the process-wide "current connection".
///
/// Components fetch the connection with [`ConnectionManager::current`] for the
/// duration of one operation and must not hold it across operations, since a
/// reconnect may replace it at any time.
pub struct ConnectionManager {
    dispatcher: Arc<Dispatcher>,
    config: LinkConfig,
    current: RwLock<Option<Arc<Connection>>>,
}

impl ConnectionManager {
    pub fn new(config: LinkConfig) -> Arc<Self> {
        Self::with_dispatcher(Dispatcher::new(), config)
    }

    pub fn with_dispatcher(dispatcher: Arc<Dispatcher>, config: LinkConfig) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            config,
            current: RwLock::new(None),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub async fn connect(&self, target: &Target) -> Result<Arc<Connection>> {
        let stream = ByteStream::open(target, &self.config).await?;
        Ok(self.attach(stream))
    }

    /// Makes `stream` the current connection, invalidating the previous one.
    pub fn attach(&self, stream: ByteStream) -> Arc<Connection> {
        let conn = Arc::new(Connection::start(
            stream,
            self.dispatcher.clone(),
            &self.config,
        ));

        let previous = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(conn.clone());

        if let Some(previous) = previous {
            info!("Replacing connection {}", previous.name());
            previous.invalidate();
        }

        info!("Connected to {}", conn.name());
        conn
    }

    pub fn current(&self) -> Result<Arc<Connection>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .filter(|conn| conn.is_open())
            .ok_or(Error::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_ok()
    }

    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|conn| conn.stats())
    }

    pub async fn disconnect(&self) -> Result<()> {
        let previous = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match previous {
            Some(conn) => {
                info!("Disconnecting {}", conn.name());
                conn.close().await
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::apl::MessageId;
    use crate::protocols::lpl::encode_packet;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_frames_reach_subscribers() {
        let manager = ConnectionManager::new(LinkConfig::default());
        let mut sub = manager.dispatcher().subscribe(MessageId::BootResponse);

        let (local, mut remote) = tokio::io::duplex(1024);
        manager.attach(ByteStream::from_stream("duplex", local, manager.config()));

        let mut wire = encode_packet(&[0x01, 0xB0, 0x01]).unwrap();
        wire.extend_from_slice(&[0x42, 0x42, 0x00]);
        wire.extend(encode_packet(&[0x01, 0xB0, 0x02]).unwrap());
        remote.write_all(&wire).await.unwrap();

        let first = sub.recv_timeout(Duration::from_secs(1)).await.unwrap();
        let second = sub.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.as_ref(), &[0x01, 0xB0, 0x01]);
        assert_eq!(second.as_ref(), &[0x01, 0xB0, 0x02]);

        let stats = manager.stats().unwrap();
        assert_eq!(stats.rx_packets, 2);
        assert_eq!(stats.rx_errors, 1);
        assert_eq!(stats.rx_bytes, wire.len() as u64);
    }

    #[tokio::test]
    async fn test_send_packet_counts_bytes() {
        let manager = ConnectionManager::new(LinkConfig::default());
        let (local, mut remote) = tokio::io::duplex(1024);
        let conn = manager.attach(ByteStream::from_stream("duplex", local, manager.config()));

        conn.send_message(&Message::BootExit).await.unwrap();

        let expected = encode_packet(&[0x0F, 0xB0]).unwrap();
        let mut buf = vec![0u8; expected.len()];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);

        let stats = conn.stats();
        assert_eq!(stats.tx_packets, 1);
        assert_eq!(stats.tx_bytes, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_reconnect_invalidates_previous() {
        let manager = ConnectionManager::new(LinkConfig::default());

        let (first, _first_remote) = tokio::io::duplex(64);
        let old = manager.attach(ByteStream::from_stream("first", first, manager.config()));
        old.send_packet(&[0x00, 0x00]).await.unwrap();

        let (second, _second_remote) = tokio::io::duplex(64);
        manager.attach(ByteStream::from_stream("second", second, manager.config()));

        assert!(!old.is_open());
        assert!(matches!(
            old.send_packet(&[0x00, 0x00]).await,
            Err(Error::NotConnected)
        ));

        let current = manager.current().unwrap();
        assert_eq!(current.name(), "second");
        assert_eq!(current.stats(), StatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_peer_close_disconnects() {
        let manager = ConnectionManager::new(LinkConfig::default());
        let (local, remote) = tokio::io::duplex(64);
        manager.attach(ByteStream::from_stream("duplex", local, manager.config()));

        drop(remote);
        for _ in 0..50 {
            if !manager.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(manager.current(), Err(Error::NotConnected)));
    }
}
