use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_serial::{FlowControl, SerialPortBuilderExt};

use crate::error::{Error, Result};

pub const DEFAULT_TCP_PORT: u16 = 2000;
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Where to find the device: a serial port or a TCP endpoint.
///
/// Parsed from `tcp://host[:port]`, `serial://device[@baud]` or a bare
/// device name such as `/dev/ttyUSB0` or `COM3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Serial { path: String, baud_rate: u32 },
    Tcp { host: String, port: u16 },
}

impl Target {
    pub fn serial(path: impl Into<String>) -> Self {
        Target::Serial {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }

    pub fn tcp(host: impl Into<String>) -> Self {
        Target::Tcp {
            host: host.into(),
            port: DEFAULT_TCP_PORT,
        }
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        if let Some(rest) = s.strip_prefix("tcp://") {
            let rest = rest.trim_end_matches('/');
            let (host, port) = match rest.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && !port.is_empty() => {
                    let port = port.parse::<u16>().map_err(|_| {
                        Error::Configuration(format!("invalid TCP port in \"{}\"", s))
                    })?;
                    (host.trim_start_matches('[').trim_end_matches(']'), port)
                }
                _ => (rest, DEFAULT_TCP_PORT),
            };

            if host.is_empty() {
                return Err(Error::Configuration(format!("missing host in \"{}\"", s)));
            }
            return Ok(Target::Tcp {
                host: host.to_string(),
                port,
            });
        }

        let rest = s.strip_prefix("serial://").unwrap_or(s);
        let (path, baud_rate) = match rest.rsplit_once('@') {
            Some((path, baud)) => {
                let baud = baud.parse::<u32>().map_err(|_| {
                    Error::Configuration(format!("invalid baud rate in \"{}\"", s))
                })?;
                (path, baud)
            }
            None => (rest, DEFAULT_BAUD_RATE),
        };

        if path.is_empty() {
            return Err(Error::Configuration("empty device name".into()));
        }
        Ok(Target::Serial {
            path: path.to_string(),
            baud_rate,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Serial { path, baud_rate } => write!(f, "serial://{}@{}", path, baud_rate),
            Target::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub connect_timeout: Duration,
    pub read_size: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
            read_size: 4096,
        }
    }
}

impl LinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_size(mut self, size: usize) -> Self {
        self.read_size = size;
        self
    }
}

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

/// Read side of a [`ByteStream`].
pub struct StreamReader {
    inner: ReadHalf<BoxedStream>,
}

impl StreamReader {
    /// Reads up to `max` bytes, giving up with [`Error::Timeout`] after
    /// `timeout` without data.
    pub async fn read(&mut self, max: usize, timeout: Duration) -> Result<Bytes> {
        let mut buf = vec![0u8; max];

        match tokio::time::timeout(timeout, self.inner.read(&mut buf)).await {
            Err(_) => Err(Error::Timeout),
            Ok(Ok(0)) => Err(Error::Connection("stream closed by peer".into())),
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
            Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => Err(Error::Timeout),
            Ok(Err(e)) => Err(e.into()),
        }
    }
}

/// Write side of a [`ByteStream`].
pub struct StreamWriter {
    inner: WriteHalf<BoxedStream>,
    timeout: Duration,
}

impl StreamWriter {
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let write = async {
            self.inner.write_all(data).await?;
            self.inner.flush().await
        };

        match tokio::time::timeout(self.timeout, write).await {
            Ok(Ok(())) => Ok(data.len()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::Timeout),
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// A serial port or TCP socket behind a uniform read/write/close contract.
pub struct ByteStream {
    name: String,
    reader: StreamReader,
    writer: StreamWriter,
}

impl ByteStream {
    pub async fn open(target: &Target, config: &LinkConfig) -> Result<Self> {
        info!("Opening {}", target);

        match target {
            Target::Serial { path, baud_rate } => {
                let port = tokio_serial::new(path.as_str(), *baud_rate)
                    .flow_control(FlowControl::Hardware)
                    .timeout(config.read_timeout)
                    .open_native_async()?;
                Ok(Self::from_stream(target.to_string(), port, config))
            }
            Target::Tcp { host, port } => {
                let stream = connect_tcp(host, *port, config.connect_timeout).await?;
                Ok(Self::from_stream(target.to_string(), stream, config))
            }
        }
    }

    /// Wraps an already established stream, e.g. one half of
    /// [`tokio::io::duplex`].
    pub fn from_stream<T>(name: impl Into<String>, stream: T, config: &LinkConfig) -> Self
    where
        T: AsyncStream + 'static,
    {
        let boxed: BoxedStream = Box::new(stream);
        let (reader, writer) = tokio::io::split(boxed);

        Self {
            name: name.into(),
            reader: StreamReader { inner: reader },
            writer: StreamWriter {
                inner: writer,
                timeout: config.write_timeout,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn read(&mut self, max: usize, timeout: Duration) -> Result<Bytes> {
        self.reader.read(max, timeout).await
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.writer.write(data).await
    }

    pub async fn close(mut self) -> Result<()> {
        self.writer.close().await
    }

    pub fn into_split(self) -> (String, StreamReader, StreamWriter) {
        (self.name, self.reader, self.writer)
    }
}

async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    let mut last_err = None;

    for addr in addrs {
        debug!("Connecting to {}", addr);

        match tokio::task::spawn_blocking(move || connect_socket(addr, timeout)).await {
            Ok(Ok(stream)) => return Ok(TcpStream::from_std(stream)?),
            Ok(Err(e)) => last_err = Some(e),
            Err(e) => last_err = Some(std::io::Error::other(e)),
        }
    }

    Err(match last_err {
        Some(e) if e.kind() == ErrorKind::TimedOut => Error::Timeout,
        Some(e) => Error::Io(e),
        None => Error::Connection(format!("no address found for {}", host)),
    })
}

fn connect_socket(addr: SocketAddr, timeout: Duration) -> std::io::Result<std::net::TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.connect_timeout(&addr.into(), timeout)?;
    socket.set_nodelay(true)?;
    socket.set_keepalive(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Names of the serial ports present on this machine.
pub fn list_serial_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_targets() {
        assert_eq!(
            "tcp://192.168.1.100".parse::<Target>().unwrap(),
            Target::Tcp {
                host: "192.168.1.100".into(),
                port: DEFAULT_TCP_PORT
            }
        );
        assert_eq!(
            "tcp://quad.local:5000/".parse::<Target>().unwrap(),
            Target::Tcp {
                host: "quad.local".into(),
                port: 5000
            }
        );
        assert_eq!(
            "/dev/ttyUSB0".parse::<Target>().unwrap(),
            Target::serial("/dev/ttyUSB0")
        );
        assert_eq!(
            "serial://COM3@57600".parse::<Target>().unwrap(),
            Target::Serial {
                path: "COM3".into(),
                baud_rate: 57600
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!("tcp://".parse::<Target>().is_err());
        assert!("tcp://host:notaport".parse::<Target>().is_err());
        assert!("serial://".parse::<Target>().is_err());
        assert!("COM3@fast".parse::<Target>().is_err());
    }

    #[test]
    fn test_display_roundtrips() {
        for s in ["tcp://10.0.0.2:2000", "serial:///dev/ttyACM0@115200"] {
            assert_eq!(s.parse::<Target>().unwrap().to_string(), s);
        }
    }

    #[tokio::test]
    async fn test_read_timeout_and_write() {
        let config = LinkConfig::default();
        let (local, mut remote) = tokio::io::duplex(64);
        let mut stream = ByteStream::from_stream("duplex", local, &config);

        assert!(matches!(
            stream.read(16, Duration::from_millis(10)).await,
            Err(Error::Timeout)
        ));

        assert_eq!(stream.write(b"ping").await.unwrap(), 4);
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote.write_all(b"pong").await.unwrap();
        let data = stream.read(16, Duration::from_secs(1)).await.unwrap();
        assert_eq!(data.as_ref(), b"pong");

        drop(remote);
        assert!(matches!(
            stream.read(16, Duration::from_secs(1)).await,
            Err(Error::Connection(_))
        ));
    }
}
