//! Raw SCPI socket transport
//!
//! LAN instruments accept SCPI over a plain TCP stream, conventionally
//! on port 5025, with messages terminated by `\n`. There is no out of
//! band status byte or service request on such a connection: the
//! status byte is read with `*STB?` and the event primitives are left
//! unsupported, so only the polling strategies apply.

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use log::{debug, info};

use crate::transport::{Connect, Transport, TransportError};

/// Default SCPI raw socket port
pub const SCPI_PORT: u16 = 5025;

/// Turn a VISA style socket resource (`TCPIP0::host::port::SOCKET`) or
/// a plain `host[:port]` string into host and port.
pub fn parse_address(address: &str) -> Result<(String, u16), TransportError> {
    let address = address.trim();
    let malformed = || TransportError::Malformed(format!("invalid socket address: {}", address));

    if address.is_empty() {
        return Err(malformed());
    }

    if address.to_uppercase().starts_with("TCPIP") {
        let parts: Vec<&str> = address.split("::").collect();
        return match parts.as_slice() {
            [_, host, port, kind] if kind.eq_ignore_ascii_case("SOCKET") => {
                let port = port.parse::<u16>().map_err(|_| malformed())?;
                Ok((host.to_string(), port))
            },
            [_, host, kind] if kind.eq_ignore_ascii_case("SOCKET") => {
                Ok((host.to_string(), SCPI_PORT))
            },
            _ => Err(malformed())
        };
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            let port = port.parse::<u16>().map_err(|_| malformed())?;
            Ok((host.to_string(), port))
        },
        Some(_) => Err(malformed()),
        None => Ok((address.to_string(), SCPI_PORT))
    }
}

fn io_error(err: std::io::Error) -> TransportError {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => TransportError::Timeout,
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset |
            ErrorKind::BrokenPipe => TransportError::Closed,
        _ => TransportError::Io(err)
    }
}

/// SCPI over a TCP stream
pub struct SocketTransport {
    reader: BufReader<TcpStream>,
    peer: SocketAddr,
}

impl SocketTransport {

    /// Wrap a connected stream, applying `timeout` to reads and writes
    pub fn from_stream(stream: TcpStream, timeout: Duration) -> Result<Self, TransportError> {
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Ok(SocketTransport { reader: BufReader::new(stream), peer })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for SocketTransport {

    fn write(&mut self, text: &str) -> Result<(), TransportError> {
        let stream = self.reader.get_mut();
        stream.write_all(text.as_bytes()).map_err(io_error)?;
        stream.write_all(b"\n").map_err(io_error)?;
        stream.flush().map_err(io_error)?;
        Ok(())
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.reader.get_mut();
        stream.write_all(data).map_err(io_error)?;
        stream.flush().map_err(io_error)?;
        Ok(())
    }

    fn read(&mut self) -> Result<String, TransportError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).map_err(io_error)?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        Ok(line.trim_end_matches(&['\r', '\n'][..]).to_string())
    }

    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; n];
        self.reader.read_exact(&mut buf).map_err(io_error)?;
        Ok(buf)
    }

    fn read_status_byte(&mut self) -> Result<u8, TransportError> {
        let response = self.query("*STB?")?;
        response.trim().trim_start_matches('+').parse::<u8>()
            .map_err(|_| TransportError::Malformed(response))
    }

    fn clear(&mut self) -> Result<(), TransportError> {
        // no device clear on a raw socket; drop whatever is buffered
        let pending = self.reader.buffer().len();
        self.reader.consume(pending);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        debug!("Shutting down socket to {}", self.peer);
        match self.reader.get_ref().shutdown(std::net::Shutdown::Both) {
            Ok(()) => Ok(()),
            // already gone
            Err(ref e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(TransportError::Io(e))
        }
    }
}

impl Connect for SocketTransport {
    fn connect(address: &str, timeout: Duration) -> Result<Self, TransportError> {
        let (host, port) = parse_address(address)?;

        let addr = (host.as_str(), port).to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::Malformed(format!("cannot resolve {}", host)))?;

        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(io_error)?;
        info!("Connected to {}", addr);

        SocketTransport::from_stream(stream, timeout)
    }
}
