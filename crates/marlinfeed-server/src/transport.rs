//! Printer transports.
//!
//! The printer device named on the command line can be a TTY (the normal
//! case, USB serial), a Unix-domain stream socket (a simulator), or a
//! `host:port` TCP address. All three end up behind the [`Transport`]
//! enum, which the engine drives through its `Connect` abstraction so it
//! never cares which one it got.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_serial::{DataBits, FlowControl, Parity, SerialStream, StopBits};
use tracing::debug;

use marlinfeed_core::constants::BAUD_RATE;
use marlinfeed_engine::Connect;

/// How to reach the printer.
#[derive(Debug, Clone)]
pub enum PrinterAddr {
    Tty(PathBuf),
    Unix(PathBuf),
    Tcp(String),
}

impl PrinterAddr {
    /// Classifies a device argument. An existing socket inode selects the
    /// Unix transport, any other existing path is treated as a TTY, and a
    /// non-path containing a colon is taken as `host:port`.
    pub fn parse(device: &str) -> PrinterAddr {
        match std::fs::metadata(device) {
            Ok(meta) => {
                use std::os::unix::fs::FileTypeExt;
                if meta.file_type().is_socket() {
                    PrinterAddr::Unix(PathBuf::from(device))
                } else {
                    PrinterAddr::Tty(PathBuf::from(device))
                }
            }
            Err(_) if device.contains(':') => PrinterAddr::Tcp(device.to_string()),
            // let the open attempt produce the real error
            Err(_) => PrinterAddr::Tty(PathBuf::from(device)),
        }
    }
}

/// Reopenable printer connection; the engine's connector.
#[derive(Debug, Clone)]
pub struct PrinterPort {
    addr: PrinterAddr,
}

impl PrinterPort {
    pub fn new(device: &str) -> Self {
        PrinterPort {
            addr: PrinterAddr::parse(device),
        }
    }
}

impl Connect for PrinterPort {
    type Stream = Transport;

    async fn connect(&mut self) -> io::Result<Transport> {
        match &self.addr {
            PrinterAddr::Tty(path) => {
                debug!(device = %path.display(), "opening printer tty");
                let builder = tokio_serial::new(path.to_string_lossy(), BAUD_RATE)
                    .data_bits(DataBits::Eight)
                    .parity(Parity::None)
                    .stop_bits(StopBits::One)
                    .flow_control(FlowControl::None);
                let mut port = SerialStream::open(&builder).map_err(io::Error::from)?;
                // USB re-enumeration after a reset must be able to grab
                // the device again
                let _ = port.set_exclusive(false);
                Ok(Transport::Serial(port))
            }
            PrinterAddr::Unix(path) => {
                debug!(socket = %path.display(), "connecting to printer socket");
                Ok(Transport::Unix(UnixStream::connect(path).await?))
            }
            PrinterAddr::Tcp(addr) => {
                debug!(addr = %addr, "connecting to printer over tcp");
                Ok(Transport::Tcp(TcpStream::connect(addr).await?))
            }
        }
    }
}

/// One of the three printer byte streams.
#[derive(Debug)]
pub enum Transport {
    Serial(SerialStream),
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Serial(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Serial(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Serial(s) => Pin::new(s).poll_flush(cx),
            Transport::Unix(s) => Pin::new(s).poll_flush(cx),
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Serial(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Where the API listener binds: loopback when restricted, all
/// interfaces otherwise.
pub fn listen_addr(port: u16, localhost_only: bool) -> SocketAddr {
    let ip = if localhost_only {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    SocketAddr::new(ip, port)
}
