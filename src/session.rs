use std::time::Duration;
use thiserror::Error;
use log::{debug, info, warn};

use crate::config::{ConfigError, SessionConfig};
use crate::errorqueue::{self, ErrorRecord};
use crate::registers::StatusByte;
use crate::sync::{Expect, Synchroniser, SyncMode};
use crate::transport::{Connect, Transport, TransportError};

#[derive(Error, Debug)]
pub enum SessionError {
    /// Completion was not observed within the timeout
    #[error("{mode} - Timeout occurred. Command: \"{command}\", timeout {}s", .timeout.as_secs_f64())]
    Timeout { mode: SyncMode, command: String, timeout: Duration },
    /// The instrument's error queue was not empty
    #[error("Instrument reported errors:\n{0}")]
    InstrumentFault(ErrorRecord),
    /// Bus level failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    /// A status query returned something unparseable
    #[error("Invalid response to \"{command}\": {response:?}")]
    InvalidResponse { command: String, response: String },
    /// No transport is attached
    #[error("Session is not open")]
    NotOpen,
    /// A transport is already attached
    #[error("Session is already open")]
    AlreadyOpen,
    /// Dummy mode query without a substitute value
    #[error("No dummy value supplied for \"{0}\"")]
    NoDummyValue(String),
    /// Invalid session configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Block data is written to the bus in chunks of this size
pub const BLOCK_CHUNK: usize = 1_000_000;

/// Header of an IEEE 488.2 definite length block carrying `len` bytes.
/// Lengths of ten or more digits use the `#(<length>)` form.
pub fn block_header(len: usize) -> String {
    let digits = len.to_string();
    if digits.len() < 10 {
        format!("#{}{}", digits.len(), digits)
    } else {
        format!("#({})", digits)
    }
}

/// A single command as issued by a driver
///
/// Bundles the payload with how it should be synchronised. Commands are
/// cheap, built per call and handed to [`Session::send`] or
/// [`Session::ask`].
///
/// ```
/// use std::time::Duration;
/// use libinstsync::{Command, SyncMode};
///
/// let cmd = Command::new("L=1310.001")
///     .mode(SyncMode::StatusPollWithHandshake)
///     .timeout(Duration::from_secs(5))
///     .checked();
/// assert_eq!(cmd.payload(), "L=1310.001");
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    payload: String,
    mode: SyncMode,
    timeout: Option<Duration>,
    dummy: Option<String>,
    check_errors: bool,
}

impl Command {

    pub fn new(payload: &str) -> Command {
        Command {
            payload: payload.to_string(),
            mode: SyncMode::Immediate,
            timeout: None,
            dummy: None,
            check_errors: false,
        }
    }

    /// Synchronisation strategy; [`SyncMode::Immediate`] if not set
    pub fn mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    /// Completion timeout; the session's default timeout if not set
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Value returned instead of a bus reply when the session is in
    /// dummy mode
    pub fn dummy(mut self, value: &str) -> Self {
        self.dummy = Some(value.to_string());
        self
    }

    /// Drain the error queue after the transaction
    pub fn checked(mut self) -> Self {
        self.check_errors = true;
        self
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.mode
    }

    pub fn dummy_value(&self) -> Option<&str> {
        self.dummy.as_deref()
    }
}


/// Instrument session
///
/// `Session` owns the transport to one instrument together with the
/// capability configuration of its model and exposes the `write`/`query`
/// family used by instrument drivers. The transport is acquired with
/// [`Session::open`] (or [`Session::attach`]) and released with
/// [`Session::close`] or when the session is dropped.
///
/// All operations take `&mut self`. A synchronised command is a
/// sequence of bus transactions (clear, write, poll, read, acknowledge)
/// and the exclusive borrow guarantees no other call on the same session
/// can interleave with it. To drive several instruments in parallel use
/// one session per instrument.
///
/// ```
/// use std::time::Duration;
/// use libinstsync::{Session, SessionConfig};
/// use libinstsync::mock::MockTransport;
///
/// let mut session = Session::new(SessionConfig::default());
/// let mut bus = MockTransport::new();
/// bus.respond("VOLT?", "1.250");
/// session.attach(bus).unwrap();
///
/// let volts = session.query_with_stb_poll_sync("VOLT?", Duration::from_secs(5)).unwrap();
/// assert_eq!(volts, "1.250");
/// session.check_errors().unwrap();
/// ```
pub struct Session<T: Transport> {
    config: SessionConfig,
    bus: Option<T>,
    address: Option<String>,
}

impl<T: Transport> Session<T> {

    /// Create a closed session for an instrument model described by
    /// `config`.
    pub fn new(config: SessionConfig) -> Session<T> {
        Session { config, bus: None, address: None }
    }

    /// Adopt an already connected transport.
    pub fn attach(&mut self, transport: T) -> Result<&mut Self, SessionError> {
        self.config.validate()?;
        if self.bus.is_some() {
            return Err(SessionError::AlreadyOpen);
        }
        self.bus = Some(transport);
        Ok(self)
    }

    /// Release the transport. Closing a closed session is a no-op.
    pub fn close(&mut self) -> Result<(), SessionError> {
        if let Some(mut bus) = self.bus.take() {
            info!("Closing session {}", self.address.as_deref().unwrap_or("<attached>"));
            self.address = None;
            bus.close()?;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.bus.is_some()
    }

    /// Address the session was opened with, if any
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> Option<&T> {
        self.bus.as_ref()
    }

    pub fn transport_mut(&mut self) -> Option<&mut T> {
        self.bus.as_mut()
    }

    fn bus(&mut self) -> Result<&mut T, SessionError> {
        self.bus.as_mut().ok_or(SessionError::NotOpen)
    }

    fn run(&mut self, mode: SyncMode, command: &str, timeout: Duration, expect: Expect)
        -> Result<Option<String>, SessionError> {

        let config = &self.config;
        let bus = self.bus.as_mut().ok_or(SessionError::NotOpen)?;
        Synchroniser::new(bus, config).run(mode, command, timeout, expect)
    }

    fn run_write(&mut self, mode: SyncMode, command: &str, timeout: Duration)
        -> Result<(), SessionError> {

        if self.config.dummy_mode {
            debug!("Dummy mode; dropping \"{}\"", command);
            return Ok(());
        }

        self.run(mode, command, timeout, Expect::Nothing)?;
        Ok(())
    }

    fn run_query(&mut self, mode: SyncMode, command: &str, timeout: Duration)
        -> Result<String, SessionError> {

        if self.config.dummy_mode {
            return Err(SessionError::NoDummyValue(command.to_string()));
        }

        // Expect::Response always yields a reply or an error
        Ok(self.run(mode, command, timeout, Expect::Response)?.unwrap_or_default())
    }

    /// Write a command without any synchronisation
    pub fn write(&mut self, command: &str) -> Result<(), SessionError> {
        self.run_write(SyncMode::Immediate, command, self.config.default_timeout)
    }

    /// Write a query and read back its response without any synchronisation
    pub fn query(&mut self, command: &str) -> Result<String, SessionError> {
        self.run_query(SyncMode::Immediate, command, self.config.default_timeout)
    }

    /// Write a command, then poll the status byte until the event bit is set
    pub fn write_with_stb_poll(&mut self, command: &str, timeout: Duration)
        -> Result<(), SessionError> {
        self.run_write(SyncMode::StatusPoll, command, timeout)
    }

    /// Write a query, poll the status byte until the event bit is set,
    /// then read the response
    pub fn query_with_stb_poll(&mut self, command: &str, timeout: Duration)
        -> Result<String, SessionError> {
        self.run_query(SyncMode::StatusPoll, command, timeout)
    }

    /// Write a command with `*OPC` appended, bracketed by `*ESR?` reads,
    /// and poll the status byte until it completes
    pub fn write_with_stb_poll_sync(&mut self, command: &str, timeout: Duration)
        -> Result<(), SessionError> {
        self.run_write(SyncMode::StatusPollWithHandshake, command, timeout)
    }

    /// Query variant of [`Session::write_with_stb_poll_sync`]
    pub fn query_with_stb_poll_sync(&mut self, command: &str, timeout: Duration)
        -> Result<String, SessionError> {
        self.run_query(SyncMode::StatusPollWithHandshake, command, timeout)
    }

    /// Write a command with `*OPC` appended, bracketed by `*ESR?` reads,
    /// and block on the service request event until it completes
    pub fn write_with_srq_sync(&mut self, command: &str, timeout: Duration)
        -> Result<(), SessionError> {
        self.run_write(SyncMode::EventWaitWithHandshake, command, timeout)
    }

    /// Query variant of [`Session::write_with_srq_sync`]
    pub fn query_with_srq_sync(&mut self, command: &str, timeout: Duration)
        -> Result<String, SessionError> {
        self.run_query(SyncMode::EventWaitWithHandshake, command, timeout)
    }

    /// Issue a write-only [`Command`]
    pub fn send(&mut self, command: &Command) -> Result<(), SessionError> {
        let timeout = command.timeout.unwrap_or(self.config.default_timeout);
        self.run_write(command.mode, &command.payload, timeout)?;

        if command.check_errors {
            self.check_errors()?;
        }

        Ok(())
    }

    /// Issue a [`Command`] expecting a response. In dummy mode the
    /// command's substitute is returned without touching the bus.
    pub fn ask(&mut self, command: &Command) -> Result<String, SessionError> {
        if self.config.dummy_mode {
            return command.dummy.clone()
                .ok_or_else(|| SessionError::NoDummyValue(command.payload.clone()));
        }

        let timeout = command.timeout.unwrap_or(self.config.default_timeout);
        let response = self.run_query(command.mode, &command.payload, timeout)?;

        if command.check_errors {
            self.check_errors()?;
        }

        Ok(response)
    }

    /// Read a pending response
    pub fn read(&mut self) -> Result<String, SessionError> {
        if self.config.dummy_mode {
            return Err(SessionError::NoDummyValue(String::from("<read>")));
        }
        let response = self.bus()?.read()?;
        busdbg!("<< {}", response);
        Ok(response)
    }

    /// Read `n` raw bytes
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, SessionError> {
        if self.config.dummy_mode {
            return Err(SessionError::NoDummyValue(format!("<read {} bytes>", n)));
        }
        let bytes = self.bus()?.read_bytes(n)?;
        busdbg!("<< {} bytes", bytes.len());
        Ok(bytes)
    }

    /// Query an IEEE 488.2 definite length block and return its data.
    ///
    /// Both the `#<n><length>` and the `#(<length>)` header forms are
    /// accepted. Blocks larger than the configured `max_block_len` are
    /// refused before any of their data is read.
    pub fn query_block(&mut self, command: &str) -> Result<Vec<u8>, SessionError> {
        if self.config.dummy_mode {
            return Err(SessionError::NoDummyValue(command.to_string()));
        }

        let invalid = |response: String| SessionError::InvalidResponse {
            command: command.to_string(),
            response
        };

        self.write(command)?;

        let header = self.read_bytes(2)?;
        let raw_len = match header.as_slice() {
            [b'#', b'('] => {
                let mut raw = Vec::new();
                loop {
                    match self.read_bytes(1)?.as_slice() {
                        [b')'] => break,
                        [c] if c.is_ascii_digit() && raw.len() < 20 => raw.push(*c),
                        other => {
                            raw.extend_from_slice(other);
                            return Err(invalid(String::from_utf8_lossy(&raw).into_owned()));
                        }
                    }
                }
                raw
            },
            [b'#', d @ b'1'..=b'9'] => {
                let digits = (d - b'0') as usize;
                self.read_bytes(digits)?
            },
            other => return Err(invalid(String::from_utf8_lossy(other).into_owned()))
        };

        let length = std::str::from_utf8(&raw_len).ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| invalid(String::from_utf8_lossy(&raw_len).into_owned()))?;

        if length > self.config.max_block_len {
            return Err(invalid(format!("block of {} bytes exceeds limit of {}",
                length, self.config.max_block_len)));
        }

        let data = self.read_bytes(length)?;
        if data.len() != length {
            return Err(invalid(format!("block truncated at {} of {} bytes",
                data.len(), length)));
        }

        // consume the message terminator following the block
        match self.read_bytes(1)?.as_slice() {
            [b'\n'] => Ok(data),
            [c] => Err(invalid(format!("block followed by 0x{:02x}", c))),
            _ => Err(invalid(String::from("missing block terminator")))
        }
    }

    /// Send `command` followed by `data` as an IEEE 488.2 definite length
    /// block, e.g. to upload a file to the instrument's mass memory.
    ///
    /// The data is written in chunks of [`BLOCK_CHUNK`] bytes. With
    /// `terminate` a line feed follows the block.
    pub fn write_block(&mut self, command: &str, data: &[u8], terminate: bool)
        -> Result<(), SessionError> {

        if self.config.dummy_mode {
            debug!("Dummy mode; dropping {} byte block for \"{}\"", data.len(), command);
            return Ok(());
        }

        let header = format!("{}{}", command, block_header(data.len()));
        busdbg!(">> {} + {} bytes", header, data.len());

        let bus = self.bus()?;
        bus.write_bytes(header.as_bytes())?;
        for chunk in data.chunks(BLOCK_CHUNK) {
            bus.write_bytes(chunk)?;
        }
        if terminate {
            bus.write_bytes(b"\n")?;
        }

        Ok(())
    }

    /// Drain the error queue and fail if the instrument reported any
    /// errors.
    ///
    /// Does nothing if the model has no error queue. If the model
    /// supports `*STB?` the status byte is checked first and the queue
    /// is only read when the error bit is set.
    pub fn check_errors(&mut self) -> Result<(), SessionError> {
        let record = self.error_queue()?;

        if record.is_empty() {
            Ok(())
        } else {
            Err(SessionError::InstrumentFault(record))
        }
    }

    /// Same as [`Session::check_errors`] but returns the collected
    /// errors instead of failing.
    pub fn error_queue(&mut self) -> Result<ErrorRecord, SessionError> {
        if !self.config.error_check_supported || self.config.dummy_mode {
            return Ok(ErrorRecord::new());
        }

        if self.config.stb_polling_supported {
            let stb = self.status_byte()?;
            if !stb.any_of(self.config.stb_error_mask) {
                return Ok(ErrorRecord::new());
            }
        }

        let cap = self.config.error_queue_cap;
        let query = self.config.error_query.clone();
        let bus = self.bus()?;

        let next = || -> Result<String, TransportError> {
            let response = bus.query(&query)?;
            busdbg!("<< {}", response);
            Ok(response)
        };

        let record = errorqueue::drain(next, cap)?;
        if !record.is_empty() {
            debug!("Error queue: {:?}", record.entries());
        }

        Ok(record)
    }

    /// Query the status byte with `*STB?`
    pub fn status_byte(&mut self) -> Result<StatusByte, SessionError> {
        let response = self.query("*STB?")?;
        response.trim().trim_start_matches('+').parse::<u8>()
            .map(StatusByte::from_raw)
            .map_err(|_| SessionError::InvalidResponse {
                command: String::from("*STB?"),
                response
            })
    }

    /// Device clear, then reset the status registers and wait for the
    /// instrument to settle
    pub fn clear_status(&mut self) -> Result<(), SessionError> {
        if self.config.dummy_mode {
            return Ok(());
        }
        self.bus()?.clear()?;
        self.query("*CLS;*OPC?")?;
        Ok(())
    }

    /// Block until all pending operations have finished (`*OPC?`)
    pub fn wait_for_opc(&mut self) -> Result<(), SessionError> {
        if self.config.dummy_mode {
            return Ok(());
        }
        self.query("*OPC?")?;
        Ok(())
    }

    /// Instrument identification string (`*IDN?`)
    pub fn identity(&mut self) -> Result<String, SessionError> {
        let response = self.query("*IDN?")?;
        Ok(response.trim().to_string())
    }

    /// Enable OPC reporting: OPC sets the event summary bit of the status
    /// byte and the event mask bits request service. Instruments power
    /// up with both registers cleared, which leaves the synchronised
    /// strategies waiting for a bit that is never raised.
    pub fn arm_opc_reporting(&mut self) -> Result<(), SessionError> {
        let sre = self.config.stb_event_mask.bits();
        self.write("*ESE 1")?;
        self.write(&format!("*SRE {}", sre))?;
        Ok(())
    }
}

impl<T: Connect> Session<T> {

    /// Connect to the instrument at `address`.
    pub fn open(&mut self, address: &str) -> Result<&mut Self, SessionError> {
        self.config.validate()?;
        if self.bus.is_some() {
            return Err(SessionError::AlreadyOpen);
        }

        let bus = T::connect(address, self.config.io_timeout)?;
        info!("Opened session {}", address);

        self.bus = Some(bus);
        self.address = Some(address.to_string());
        Ok(self)
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("Could not close session cleanly: {}", err);
        }
    }
}


#[cfg(test)]
mod tests {

    use std::time::Duration;
    use assert_matches::assert_matches;
    use super::{block_header, Command, Session, SessionError};
    use crate::config::SessionConfig;
    use crate::mock::MockTransport;
    use crate::sync::SyncMode;
    use crate::transport::{Transport, TransportError};

    // Hands out at most one byte per read
    struct Trickle(Vec<u8>);

    impl Transport for Trickle {
        fn write(&mut self, _text: &str) -> Result<(), TransportError> { Ok(()) }
        fn write_bytes(&mut self, _data: &[u8]) -> Result<(), TransportError> { Ok(()) }
        fn read(&mut self) -> Result<String, TransportError> { Err(TransportError::Timeout) }
        fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
            let take = n.min(1).min(self.0.len());
            Ok(self.0.drain(..take).collect())
        }
        fn read_status_byte(&mut self) -> Result<u8, TransportError> { Ok(0) }
    }

    #[test]
    fn block_headers() {
        assert_eq!(block_header(0), "#10");
        assert_eq!(block_header(4), "#14");
        assert_eq!(block_header(2_000_500), "#72000500");
        assert_eq!(block_header(999_999_999), "#9999999999");
        assert_eq!(block_header(1_000_000_000), "#(1000000000)");
    }

    #[test]
    fn short_reads_do_not_panic() {
        let mut session = Session::new(SessionConfig::default());
        session.attach(Trickle(b"#14abcd\n".to_vec())).unwrap();
        assert_matches!(session.query_block("CURV?"), Err(SessionError::InvalidResponse { .. }));

        let mut session = Session::new(SessionConfig::default());
        session.attach(Trickle(Vec::new())).unwrap();
        assert_matches!(session.query_block("CURV?"), Err(SessionError::InvalidResponse { .. }));
    }

    #[test]
    fn command_builder() {
        let cmd = Command::new("VOLT?");
        assert_eq!(cmd.sync_mode(), SyncMode::Immediate);
        assert_eq!(cmd.dummy_value(), None);

        let cmd = cmd.mode(SyncMode::StatusPoll).dummy("1.0").timeout(Duration::from_secs(2));
        assert_eq!(cmd.sync_mode(), SyncMode::StatusPoll);
        assert_eq!(cmd.dummy_value(), Some("1.0"));
    }

    #[test]
    fn closed_session() {
        let mut session: Session<MockTransport> = Session::new(SessionConfig::default());
        assert!(!session.is_open());
        assert_matches!(session.write("*RST"), Err(SessionError::NotOpen));
        assert_matches!(session.query("*IDN?"), Err(SessionError::NotOpen));
        assert_matches!(session.check_errors(), Err(SessionError::NotOpen));
        // closing twice is fine
        assert_matches!(session.close(), Ok(()));
    }

    #[test]
    fn open_twice() {
        let mut session: Session<MockTransport> = Session::new(SessionConfig::default());
        session.open("GPIB0::5::INSTR").unwrap();
        assert_eq!(session.address(), Some("GPIB0::5::INSTR"));
        // Session is not Debug; compare the outcome only
        assert_matches!(session.open("GPIB0::6::INSTR").map(|_| ()),
            Err(SessionError::AlreadyOpen));
        assert_matches!(session.attach(MockTransport::new()).map(|_| ()),
            Err(SessionError::AlreadyOpen));

        session.close().unwrap();
        assert!(!session.is_open());
        assert_eq!(session.address(), None);
    }

    #[test]
    fn invalid_config_refused() {
        let config = SessionConfig::default().with_error_queue_cap(0);
        let mut session: Session<MockTransport> = Session::new(config);
        assert_matches!(session.attach(MockTransport::new()).map(|_| ()),
            Err(SessionError::Config(_)));
    }

    #[test]
    fn timeout_message() {
        let err = SessionError::Timeout {
            mode: SyncMode::StatusPoll,
            command: String::from("AUTO_CAL"),
            timeout: Duration::from_secs(1)
        };
        let msg = err.to_string();
        assert!(msg.contains("\"AUTO_CAL\""));
        assert!(msg.contains("timeout 1s"));
    }

    #[test]
    fn dummy_mode_never_touches_bus() {
        let config = SessionConfig::default().with_dummy_mode(true);
        let mut session: Session<MockTransport> = Session::new(config);

        // no transport attached at all
        let cmd = Command::new("VOLT?").mode(SyncMode::StatusPollWithHandshake).dummy("3.3");
        assert_eq!(session.ask(&cmd).unwrap(), "3.3");
        assert_matches!(session.ask(&Command::new("CURR?")), Err(SessionError::NoDummyValue(_)));
        assert_matches!(session.send(&Command::new("OUTP ON").checked()), Ok(()));
        assert_matches!(session.check_errors(), Ok(()));
    }
}
