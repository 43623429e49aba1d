//! Command completion protocols
//!
//! Instruments finish sweeps, calibrations and acquisitions long after
//! the bus transaction that started them. The strategies in this module
//! decide when it is safe to proceed after a command:
//!
//! * [`SyncMode::Immediate`]: no synchronisation at all.
//! * [`SyncMode::StatusPoll`]: poll the status byte until the
//!   configured event bit is raised.
//! * [`SyncMode::StatusPollWithHandshake`]: bracket the command with
//!   `*ESR?` reads and append `*OPC` so that completion is attributed
//!   to this command and not to a stale flag from an earlier one.
//! * [`SyncMode::EventWaitWithHandshake`]: same bracketing, but block
//!   on a service request event instead of polling.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use log::debug;

use crate::config::SessionConfig;
use crate::polling::{self, PollError};
use crate::registers::{EventKind, EventMechanism, EventStatus};
use crate::session::SessionError;
use crate::transport::{Transport, TransportError};

/// Suffix asking the instrument to set OPC once the command finishes
pub const OPC_SUFFIX: &str = ";*OPC";
/// Query reading (and clearing) the standard event status register
pub const ESR_QUERY: &str = "*ESR?";

/// Synchronisation strategy of a single command
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum SyncMode {
    #[serde(rename = "basic")]
    Immediate,
    #[serde(rename = "stb_poll")]
    StatusPoll,
    #[serde(rename = "stb_poll_sync")]
    StatusPollWithHandshake,
    #[serde(rename = "srq_sync")]
    EventWaitWithHandshake,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Immediate
    }
}

impl SyncMode {

    /// Short tag used by driver command tables
    pub fn tag(&self) -> &'static str {
        match self {
            SyncMode::Immediate => "basic",
            SyncMode::StatusPoll => "stb_poll",
            SyncMode::StatusPollWithHandshake => "stb_poll_sync",
            SyncMode::EventWaitWithHandshake => "srq_sync",
        }
    }

    /// Whether the command is bracketed by `*ESR?` and tagged with `*OPC`
    pub fn is_handshake(&self) -> bool {
        match self {
            SyncMode::StatusPollWithHandshake | SyncMode::EventWaitWithHandshake => true,
            SyncMode::Immediate | SyncMode::StatusPoll => false,
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncMode::Immediate => "Immediate command",
            SyncMode::StatusPoll => "STB polling",
            SyncMode::StatusPollWithHandshake => "STB polling with OPC sync",
            SyncMode::EventWaitWithHandshake => "SRQ wait with OPC sync",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(SyncMode::Immediate),
            "stb_poll" => Ok(SyncMode::StatusPoll),
            "stb_poll_sync" => Ok(SyncMode::StatusPollWithHandshake),
            "srq_sync" => Ok(SyncMode::EventWaitWithHandshake),
            _ => Err(format!("Invalid synchronisation type: {}", s))
        }
    }
}

/// Whether a read follows the command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Expect {
    Nothing,
    Response,
}

/// Runs one command under a [`SyncMode`] against a borrowed transport.
///
/// The synchroniser holds the transport mutably for the whole
/// write → wait → acknowledge sequence, which is only correct if it
/// runs uninterrupted.
pub(crate) struct Synchroniser<'a, T: Transport> {
    bus: &'a mut T,
    config: &'a SessionConfig,
}

impl<'a, T: Transport> Synchroniser<'a, T> {

    pub(crate) fn new(bus: &'a mut T, config: &'a SessionConfig) -> Self {
        Synchroniser { bus, config }
    }

    /// Single dispatch point for all strategies. Returns the response
    /// if `expect` is [`Expect::Response`].
    pub(crate) fn run(&mut self, mode: SyncMode, command: &str, timeout: Duration,
        expect: Expect) -> Result<Option<String>, SessionError> {

        match mode {
            SyncMode::Immediate => {
                self.send(command)?;
            },
            SyncMode::StatusPoll => {
                self.send(command)?;
                self.await_status(mode, command, timeout)?;
            },
            SyncMode::StatusPollWithHandshake => {
                self.acknowledge()?;
                self.send(&with_opc(command))?;
                self.await_status(mode, command, timeout)?;
            },
            SyncMode::EventWaitWithHandshake => {
                self.acknowledge()?;
                self.arm_service_request()?;
                let waited = self.send(&with_opc(command))
                    .and_then(|_| self.await_service_request(mode, command, timeout));
                // never leave the session armed, even if the wait failed
                let disarmed = self.disarm_service_request();
                waited?;
                disarmed?;
            },
        }

        let response = match expect {
            Expect::Response => Some(self.receive()?),
            Expect::Nothing => None,
        };

        if mode.is_handshake() {
            self.acknowledge()?;
        }

        Ok(response)
    }

    fn send(&mut self, text: &str) -> Result<(), SessionError> {
        busdbg!(">> {}", text);
        self.bus.write(text)?;
        Ok(())
    }

    fn receive(&mut self) -> Result<String, SessionError> {
        let response = self.bus.read()?;
        busdbg!("<< {}", response);
        Ok(response)
    }

    /// Read the event status register, clearing it. Brackets every
    /// handshake command: before, to discard stale completion flags;
    /// after, to consume the flag raised by this command.
    pub(crate) fn acknowledge(&mut self) -> Result<EventStatus, SessionError> {
        self.send(ESR_QUERY)?;
        let response = self.receive()?;
        let esr = EventStatus::parse(&response)
            .ok_or_else(|| SessionError::InvalidResponse {
                command: ESR_QUERY.to_string(),
                response: response.clone()
            })?;

        if esr.has_errors() {
            debug!("Event status register reports errors: {:?}", esr);
        }

        Ok(esr)
    }

    fn await_status(&mut self, mode: SyncMode, command: &str, timeout: Duration)
        -> Result<(), SessionError> {

        let bus = &mut *self.bus;
        let sample = || -> Result<u8, TransportError> {
            let stb = bus.read_status_byte()?;
            busdbg!("<< STB 0x{:02x}", stb);
            Ok(stb)
        };

        match polling::poll(sample, self.config.stb_event_mask, timeout) {
            Ok(state) => {
                debug!("\"{}\" complete after {:?} ({} status reads)", command,
                    state.elapsed(), state.samples());
                Ok(())
            },
            Err(PollError::Expired(_)) => Err(SessionError::Timeout {
                mode,
                command: command.to_string(),
                timeout
            }),
            Err(PollError::Transport(err)) => Err(SessionError::Transport(err)),
        }
    }

    fn arm_service_request(&mut self) -> Result<(), SessionError> {
        self.bus.discard_events(EventKind::ServiceRequest, EventMechanism::All)?;
        self.bus.enable_event(EventKind::ServiceRequest, EventMechanism::Queue)?;
        Ok(())
    }

    fn disarm_service_request(&mut self) -> Result<(), SessionError> {
        self.bus.disable_event(EventKind::ServiceRequest, EventMechanism::Queue)?;
        Ok(())
    }

    fn await_service_request(&mut self, mode: SyncMode, command: &str, timeout: Duration)
        -> Result<(), SessionError> {

        if self.bus.wait_on_event(EventKind::ServiceRequest, timeout)? {
            debug!("\"{}\" complete (service request)", command);
            Ok(())
        } else {
            Err(SessionError::Timeout { mode, command: command.to_string(), timeout })
        }
    }
}

fn with_opc(command: &str) -> String {
    format!("{}{}", command, OPC_SUFFIX)
}


#[cfg(test)]
mod tests {

    use assert_matches::assert_matches;
    use super::{SyncMode, with_opc};

    #[test]
    fn mode_tags() {
        let modes = [SyncMode::Immediate, SyncMode::StatusPoll,
            SyncMode::StatusPollWithHandshake, SyncMode::EventWaitWithHandshake];

        for mode in modes.iter() {
            assert_eq!(mode.tag().parse::<SyncMode>(), Ok(*mode));
        }

        assert_matches!("stb_pol".parse::<SyncMode>(), Err(_));
        assert_eq!(SyncMode::default(), SyncMode::Immediate);
    }

    #[test]
    fn handshake_modes() {
        assert!(!SyncMode::Immediate.is_handshake());
        assert!(!SyncMode::StatusPoll.is_handshake());
        assert!(SyncMode::StatusPollWithHandshake.is_handshake());
        assert!(SyncMode::EventWaitWithHandshake.is_handshake());
    }

    #[test]
    fn opc_suffix() {
        assert_eq!(with_opc("L=1310.001"), "L=1310.001;*OPC");
    }
}
