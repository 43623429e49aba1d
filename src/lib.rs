//! Command synchronisation and error checking for SCPI instruments
//!
//! `libinstsync` sits between instrument drivers and the bus. Drivers
//! issue commands through a [`Session`] and pick, per command, how the
//! session should make sure the instrument has finished acting on it
//! (see [`SyncMode`]). After a transaction the instrument's error queue
//! can be drained with [`Session::check_errors`], which turns anything
//! the instrument complained about into a [`SessionError::InstrumentFault`].
//!
//! What each instrument model supports (status byte polling, an error
//! queue, which status bits signal completion) is described by a
//! [`SessionConfig`], usually loaded per model from a [`ModelTable`].
//!
//! The bus itself is abstracted by the [`Transport`] trait. A raw
//! socket implementation is provided in [`socket`] and a simulated
//! instrument, useful for testing drivers, in [`mock`].
//!
//! ```
//! use std::time::Duration;
//! use libinstsync::{Session, SessionConfig, SessionError};
//! use libinstsync::mock::MockTransport;
//!
//! let mut bus = MockTransport::new();
//! bus.delay("INIT", Duration::from_millis(20));
//! bus.push_error("-222,\"Data out of range\"");
//!
//! let mut session = Session::new(SessionConfig::default());
//! session.attach(bus).unwrap();
//!
//! session.write_with_stb_poll_sync("INIT", Duration::from_secs(1)).unwrap();
//! match session.check_errors() {
//!     Err(SessionError::InstrumentFault(errors)) => assert_eq!(errors.len(), 1),
//!     _ => unreachable!()
//! }
//! ```

#[macro_use]
mod macros;

pub mod config;
pub mod errorqueue;
pub mod mock;
pub mod polling;
pub mod registers;
pub mod session;
pub mod socket;
pub mod sync;
pub mod transport;

pub use config::{ConfigError, ModelTable, SessionConfig};
pub use errorqueue::ErrorRecord;
pub use polling::{Backoff, PollingState};
pub use registers::{EventKind, EventMechanism, EventStatus, StatusByte};
pub use session::{Command, Session, SessionError};
pub use sync::SyncMode;
pub use transport::{Connect, Transport, TransportError};
