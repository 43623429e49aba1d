//! Simulated SCPI instrument
//!
//! [`MockTransport`] emulates the IEEE 488.2 status model closely enough
//! to exercise every synchronisation strategy without hardware: it keeps
//! an output queue, an error queue, the event status register with its
//! enable masks and a notion of operations that take time to complete.
//! Every bus primitive is recorded so tests can assert on exactly what
//! went over the wire.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::registers::{EventKind, EventMechanism, EventStatus, StatusByte};
use crate::session::block_header;
use crate::transport::{Connect, Transport, TransportError};

const UNDEFINED_HEADER: &str = "-113,\"Undefined header\"";
const NO_ERROR_REPLY: &str = "0,\"No error\"";

/// A bus primitive as seen by the simulated instrument
#[derive(Clone, Debug, PartialEq)]
pub enum BusOp {
    Write(String),
    WriteBytes(usize),
    Read,
    ReadBytes(usize),
    StatusByte,
    EnableEvent(EventKind, EventMechanism),
    WaitOnEvent(EventKind),
    DisableEvent(EventKind, EventMechanism),
    DiscardEvents(EventKind, EventMechanism),
    Clear,
    Close,
}

/// Scripted instrument behind a [`Transport`]
pub struct MockTransport {
    address: Option<String>,
    closed: bool,

    // scripted replies; one-shot replies are consumed before sticky ones
    replies: HashMap<String, Vec<u8>>,
    replies_once: HashMap<String, VecDeque<Vec<u8>>>,
    output: VecDeque<u8>,
    received: Vec<u8>,

    errors: VecDeque<String>,
    stuck_error: Option<String>,
    error_query: String,

    // status model
    esr: EventStatus,
    ese: u8,
    sre: u8,
    idle_bits: StatusByte,
    busy_until: Option<Instant>,
    opc_due: Option<Instant>,
    settle: Duration,
    delays: Vec<(String, Duration)>,

    events_supported: bool,
    srq_enabled: bool,

    log: Vec<BusOp>,
}

impl Default for MockTransport {
    fn default() -> Self {
        MockTransport::new()
    }
}

impl MockTransport {

    /// A fresh instrument: empty queues, all event status bits enabled
    /// (`*ESE 255`), service requests on the event summary bit
    /// (`*SRE 32`), operations completing instantly.
    pub fn new() -> MockTransport {
        MockTransport {
            address: None,
            closed: false,
            replies: HashMap::new(),
            replies_once: HashMap::new(),
            output: VecDeque::new(),
            received: Vec::new(),
            errors: VecDeque::new(),
            stuck_error: None,
            error_query: String::from("SYST:ERR?"),
            esr: EventStatus::empty(),
            ese: 0xFF,
            sre: StatusByte::EVENT_STATUS.bits(),
            idle_bits: StatusByte::empty(),
            busy_until: None,
            opc_due: None,
            settle: Duration::from_millis(0),
            delays: Vec::new(),
            events_supported: true,
            srq_enabled: false,
            log: Vec::new(),
        }
    }

    /// Reply `reply` every time `query` is received
    pub fn respond(&mut self, query: &str, reply: &str) -> &mut Self {
        self.replies.insert(query.to_string(), terminated(reply.as_bytes()));
        self
    }

    /// Reply `reply` the next time `query` is received; queued replies
    /// take precedence over [`MockTransport::respond`]
    pub fn respond_once(&mut self, query: &str, reply: &str) -> &mut Self {
        self.replies_once.entry(query.to_string())
            .or_insert_with(VecDeque::new)
            .push_back(terminated(reply.as_bytes()));
        self
    }

    /// Reply to `query` with `data` as an IEEE 488.2 definite length block
    pub fn respond_block(&mut self, query: &str, data: &[u8]) -> &mut Self {
        let mut block = block_header(data.len()).into_bytes();
        block.extend_from_slice(data);
        self.replies.insert(query.to_string(), terminated(&block));
        self
    }

    /// Operations started by writes beginning with `prefix` take `duration`
    pub fn delay(&mut self, prefix: &str, duration: Duration) -> &mut Self {
        self.delays.push((prefix.to_string(), duration));
        self
    }

    /// Duration of operations without a specific delay
    pub fn set_settle_time(&mut self, duration: Duration) -> &mut Self {
        self.settle = duration;
        self
    }

    /// Status bits asserted whenever no operation is in progress
    pub fn set_idle_bits(&mut self, bits: StatusByte) -> &mut Self {
        self.idle_bits = bits;
        self
    }

    /// Queue an error to be reported by the error query
    pub fn push_error(&mut self, error: &str) -> &mut Self {
        self.errors.push_back(error.to_string());
        self
    }

    /// Make the error query return `error` forever
    pub fn stick_error(&mut self, error: &str) -> &mut Self {
        self.stuck_error = Some(error.to_string());
        self
    }

    /// Query answered from the error queue
    pub fn set_error_query(&mut self, query: &str) -> &mut Self {
        self.error_query = query.to_string();
        self
    }

    /// Emulate a bus without service request events
    pub fn set_events_supported(&mut self, supported: bool) -> &mut Self {
        self.events_supported = supported;
        self
    }

    /// Address passed to [`Connect::connect`], if opened that way
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Every primitive issued so far
    pub fn log(&self) -> &[BusOp] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Messages written so far, in order
    pub fn writes(&self) -> Vec<&str> {
        self.log.iter().filter_map(|op| match op {
            BusOp::Write(text) => Some(text.as_str()),
            _ => None
        }).collect()
    }

    /// Number of writes exactly equal to `text`
    pub fn count_writes(&self, text: &str) -> usize {
        self.writes().iter().filter(|w| **w == text).count()
    }

    /// Raw bytes received through [`Transport::write_bytes`], concatenated
    pub fn received_bytes(&self) -> &[u8] {
        &self.received
    }

    /// Number of status byte reads (serial polls)
    pub fn status_reads(&self) -> usize {
        self.log.iter().filter(|op| **op == BusOp::StatusByte).count()
    }

    pub fn srq_enabled(&self) -> bool {
        self.srq_enabled
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed { Err(TransportError::Closed) } else { Ok(()) }
    }

    // Latch OPC once the operation it was issued behind has finished
    fn refresh(&mut self) {
        if let Some(due) = self.opc_due {
            if Instant::now() >= due {
                self.esr.insert(EventStatus::OPERATION_COMPLETE);
                self.opc_due = None;
            }
        }
    }

    fn busy(&self) -> bool {
        self.busy_until.map_or(false, |until| Instant::now() < until)
    }

    fn status(&mut self) -> StatusByte {
        self.refresh();

        let mut stb = StatusByte::empty();
        if !self.busy() {
            stb.insert(self.idle_bits);
        }
        if !self.errors.is_empty() || self.stuck_error.is_some() {
            stb.insert(StatusByte::ERROR_QUEUE);
        }
        if !self.output.is_empty() {
            stb.insert(StatusByte::MESSAGE_AVAILABLE);
        }
        if self.esr.bits() & self.ese != 0 {
            stb.insert(StatusByte::EVENT_STATUS);
        }
        if stb.bits() & self.sre & !StatusByte::SERVICE_REQUEST.bits() != 0 {
            stb.insert(StatusByte::SERVICE_REQUEST);
        }

        stb
    }

    fn operation_time(&self, segments: &[&str]) -> Duration {
        segments.iter()
            .map(|seg| {
                self.delays.iter()
                    .filter(|(prefix, _)| seg.starts_with(prefix.as_str()))
                    .map(|(_, d)| *d)
                    .max()
                    .unwrap_or(self.settle)
            })
            .max()
            .unwrap_or(self.settle)
    }

    fn enqueue(&mut self, reply: &[u8]) {
        self.output.extend(reply.iter());
    }

    fn answer(&mut self, query: &str) {
        if query == "*ESR?" {
            self.refresh();
            let esr = self.esr.bits();
            self.esr = EventStatus::empty();
            self.enqueue(&terminated(esr.to_string().as_bytes()));
        } else if query == "*STB?" {
            let stb = self.status().bits();
            self.enqueue(&terminated(stb.to_string().as_bytes()));
        } else if query == "*OPC?" {
            // blocks until pending operations finish
            if let Some(until) = self.busy_until {
                let now = Instant::now();
                if until > now {
                    std::thread::sleep(until - now);
                }
            }
            self.enqueue(&terminated(b"1"));
        } else if query == self.error_query {
            let reply = match &self.stuck_error {
                Some(err) => err.clone(),
                None => self.errors.pop_front().unwrap_or_else(|| NO_ERROR_REPLY.to_string())
            };
            self.enqueue(&terminated(reply.as_bytes()));
        } else if let Some(reply) = self.replies_once.get_mut(query).and_then(|q| q.pop_front()) {
            self.enqueue(&reply);
        } else if let Some(reply) = self.replies.get(query).cloned() {
            self.enqueue(&reply);
        } else {
            self.errors.push_back(UNDEFINED_HEADER.to_string());
        }
    }

    fn execute(&mut self, command: &str, opc_at: Instant) {
        if command == "*OPC" {
            self.opc_due = Some(opc_at);
        } else if command == "*CLS" {
            self.esr = EventStatus::empty();
            self.errors.clear();
            self.opc_due = None;
        } else if let Some(value) = command.strip_prefix("*ESE ") {
            self.ese = value.trim().parse().unwrap_or(self.ese);
        } else if let Some(value) = command.strip_prefix("*SRE ") {
            self.sre = value.trim().parse().unwrap_or(self.sre);
        } else if command.split_whitespace().next().map_or(false, |h| h.ends_with('?')) {
            self.answer(command);
        }
    }
}

fn terminated(data: &[u8]) -> Vec<u8> {
    let mut v = data.to_vec();
    v.push(b'\n');
    v
}

impl Transport for MockTransport {

    fn write(&mut self, text: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.log.push(BusOp::Write(text.to_string()));

        let segments: Vec<&str> = text.split(';')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();

        // a new operation never shortens one already in progress
        let started = Instant::now() + self.operation_time(&segments);
        let done = self.busy_until.map_or(started, |until| until.max(started));
        self.busy_until = Some(done);

        for segment in segments {
            self.execute(segment, done);
        }

        Ok(())
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.log.push(BusOp::WriteBytes(data.len()));
        self.received.extend_from_slice(data);
        Ok(())
    }

    fn read(&mut self) -> Result<String, TransportError> {
        self.ensure_open()?;
        self.log.push(BusOp::Read);

        let end = self.output.iter().position(|b| *b == b'\n')
            .ok_or(TransportError::Timeout)?;
        let line: Vec<u8> = self.output.drain(..=end).take(end).collect();

        String::from_utf8(line).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        self.ensure_open()?;
        self.log.push(BusOp::ReadBytes(n));

        if self.output.len() < n {
            return Err(TransportError::Timeout);
        }
        Ok(self.output.drain(..n).collect())
    }

    fn read_status_byte(&mut self) -> Result<u8, TransportError> {
        self.ensure_open()?;
        self.log.push(BusOp::StatusByte);
        Ok(self.status().bits())
    }

    fn enable_event(&mut self, kind: EventKind, mechanism: EventMechanism)
        -> Result<(), TransportError> {
        self.ensure_open()?;
        if !self.events_supported {
            return Err(TransportError::Unsupported("enable_event"));
        }
        self.log.push(BusOp::EnableEvent(kind, mechanism));
        if kind == EventKind::ServiceRequest {
            self.srq_enabled = true;
        }
        Ok(())
    }

    fn wait_on_event(&mut self, kind: EventKind, timeout: Duration)
        -> Result<bool, TransportError> {
        self.ensure_open()?;
        if !self.events_supported {
            return Err(TransportError::Unsupported("wait_on_event"));
        }
        self.log.push(BusOp::WaitOnEvent(kind));

        let deadline = Instant::now() + timeout;
        loop {
            let raised = self.srq_enabled && kind == EventKind::ServiceRequest &&
                self.status().contains(StatusByte::SERVICE_REQUEST);
            if raised {
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(std::cmp::min(deadline - now, Duration::from_millis(1)));
        }
    }

    fn disable_event(&mut self, kind: EventKind, mechanism: EventMechanism)
        -> Result<(), TransportError> {
        self.ensure_open()?;
        if !self.events_supported {
            return Err(TransportError::Unsupported("disable_event"));
        }
        self.log.push(BusOp::DisableEvent(kind, mechanism));
        if kind == EventKind::ServiceRequest {
            self.srq_enabled = false;
        }
        Ok(())
    }

    fn discard_events(&mut self, kind: EventKind, mechanism: EventMechanism)
        -> Result<(), TransportError> {
        self.ensure_open()?;
        if !self.events_supported {
            return Err(TransportError::Unsupported("discard_events"));
        }
        self.log.push(BusOp::DiscardEvents(kind, mechanism));
        Ok(())
    }

    fn clear(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.log.push(BusOp::Clear);
        self.output.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.log.push(BusOp::Close);
        self.closed = true;
        Ok(())
    }
}

impl Connect for MockTransport {
    fn connect(address: &str, _timeout: Duration) -> Result<Self, TransportError> {
        if address.trim().is_empty() {
            return Err(TransportError::Malformed(String::from("empty address")));
        }
        let mut mock = MockTransport::new();
        mock.address = Some(address.to_string());
        Ok(mock)
    }
}


#[cfg(test)]
mod tests {

    use std::time::Duration;
    use assert_matches::assert_matches;
    use super::{MockTransport, BusOp};
    use crate::transport::{Transport, TransportError};

    #[test]
    fn scripted_query() {
        let mut mock = MockTransport::new();
        mock.respond("*IDN?", "ACME,PSU1,0,1.0");
        assert_eq!(mock.query("*IDN?").unwrap(), "ACME,PSU1,0,1.0");
        assert_eq!(mock.query("*IDN?").unwrap(), "ACME,PSU1,0,1.0");
        assert_eq!(mock.log(), &[
            BusOp::Write(String::from("*IDN?")), BusOp::Read,
            BusOp::Write(String::from("*IDN?")), BusOp::Read
        ]);
    }

    #[test]
    fn unknown_query_queues_error() {
        let mut mock = MockTransport::new();
        mock.write("FOO?").unwrap();
        assert_matches!(mock.read(), Err(TransportError::Timeout));
        assert_eq!(mock.read_status_byte().unwrap() & 0x04, 0x04);
        assert_eq!(mock.query("SYST:ERR?").unwrap(), "-113,\"Undefined header\"");
        assert_eq!(mock.query("SYST:ERR?").unwrap(), "0,\"No error\"");
    }

    #[test]
    fn opc_latches_after_delay() {
        let mut mock = MockTransport::new();
        mock.delay("INIT", Duration::from_millis(20));
        mock.write("INIT;*OPC").unwrap();
        assert_eq!(mock.read_status_byte().unwrap() & 0x20, 0);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(mock.read_status_byte().unwrap() & 0x60, 0x60);
        assert_eq!(mock.query("*ESR?").unwrap(), "1");
        assert_eq!(mock.read_status_byte().unwrap() & 0x20, 0);
    }

    #[test]
    fn query_with_arguments() {
        let mut mock = MockTransport::new();
        mock.respond("MMEM:DATA? \"a.bin\"", "#13abc");
        assert_eq!(mock.query("MMEM:DATA? \"a.bin\"").unwrap(), "#13abc");

        mock.write_bytes(b"#13abc").unwrap();
        assert_eq!(mock.received_bytes(), b"#13abc");
        assert_eq!(mock.log().last(), Some(&BusOp::WriteBytes(6)));
    }

    #[test]
    fn closed_mock() {
        let mut mock = MockTransport::new();
        mock.close().unwrap();
        assert_matches!(mock.write("*RST"), Err(TransportError::Closed));
        assert!(mock.is_closed());
    }
}
