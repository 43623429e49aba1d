//! The bus session consumed by the synchronisation layer
//!
//! A [`Transport`] is whatever moves bytes between the host and an
//! instrument: a VISA session, a raw socket or a simulation. It is
//! used as an opaque handle; the synchronisation layer only needs
//! the message primitives, the status byte and (optionally) events.

use std::time::Duration;
use thiserror::Error;

use crate::registers::{EventKind, EventMechanism};

#[derive(Error, Debug)]
pub enum TransportError {
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The bus did not produce data within its I/O timeout
    #[error("Bus I/O timed out")]
    Timeout,
    /// Primitive not provided by this bus
    #[error("Operation not supported by transport: {0}")]
    Unsupported(&'static str),
    /// Reply could not be interpreted
    #[error("Malformed reply: {0}")]
    Malformed(String),
    /// The connection was closed by the remote end
    #[error("Connection closed")]
    Closed,
}

/// Primitive message-based bus operations.
///
/// `write` and `read` exchange complete messages; implementors add and
/// strip the termination characters. The event primitives follow VISA
/// semantics and default to [`TransportError::Unsupported`] so that
/// buses without service requests (serial lines, raw sockets) need not
/// implement them.
pub trait Transport {

    /// Send one message
    fn write(&mut self, text: &str) -> Result<(), TransportError>;

    /// Send raw bytes as they are, without adding termination
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive one message, termination removed
    fn read(&mut self) -> Result<String, TransportError>;

    /// Receive exactly `n` raw bytes
    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError>;

    /// Read the instrument's status byte
    fn read_status_byte(&mut self) -> Result<u8, TransportError>;

    /// Send a message and read back the reply
    fn query(&mut self, text: &str) -> Result<String, TransportError> {
        self.write(text)?;
        self.read()
    }

    fn enable_event(&mut self, _kind: EventKind, _mechanism: EventMechanism)
        -> Result<(), TransportError> {
        Err(TransportError::Unsupported("enable_event"))
    }

    /// Block until an event of `kind` arrives. Returns `false` if
    /// `timeout` elapsed first.
    fn wait_on_event(&mut self, _kind: EventKind, _timeout: Duration)
        -> Result<bool, TransportError> {
        Err(TransportError::Unsupported("wait_on_event"))
    }

    fn disable_event(&mut self, _kind: EventKind, _mechanism: EventMechanism)
        -> Result<(), TransportError> {
        Err(TransportError::Unsupported("disable_event"))
    }

    fn discard_events(&mut self, _kind: EventKind, _mechanism: EventMechanism)
        -> Result<(), TransportError> {
        Err(TransportError::Unsupported("discard_events"))
    }

    /// Send a device clear. Buses without a device clear message treat
    /// this as a no-op.
    fn clear(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Release the underlying connection
    fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Transports that can be opened from an address string.
pub trait Connect: Transport + Sized {
    /// Open a connection to `address`, using `timeout` as the bus I/O
    /// timeout.
    fn connect(address: &str, timeout: Duration) -> Result<Self, TransportError>;
}
