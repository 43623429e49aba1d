//! IEEE 488.2 status registers and VISA event codes
//!
//! The status byte (STB) and the standard event status register (ESR)
//! are the two registers the synchronisation layer reads to decide
//! whether a command has completed or an error is pending. Both are
//! represented as bit flags so that masks can be combined and tested
//! without any shifting by hand.

use std::convert::TryFrom;
use bitflags::bitflags;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

bitflags! {
    /// Status byte as returned by a serial poll or `*STB?`.
    ///
    /// Bits 0 and 1 are device specific; the remaining bits follow the
    /// SCPI status reporting model. Every bit is named so that any mask
    /// an instrument model needs converts losslessly from a [`u8`].
    pub struct StatusByte: u8 {
        /// Device specific summary bit 0
        const DEVICE0 = 0x01;
        /// Device specific summary bit 1
        const DEVICE1 = 0x02;
        /// Error/event queue not empty (EAV)
        const ERROR_QUEUE = 0x04;
        /// Questionable status summary
        const QUESTIONABLE = 0x08;
        /// Message available in the output queue (MAV)
        const MESSAGE_AVAILABLE = 0x10;
        /// Standard event status summary (ESB)
        const EVENT_STATUS = 0x20;
        /// Request service / master summary (RQS/MSS)
        const SERVICE_REQUEST = 0x40;
        /// Operation status summary
        const OPERATION = 0x80;
    }
}

bitflags! {
    /// Standard event status register as returned by `*ESR?`.
    pub struct EventStatus: u8 {
        /// All pending operations finished after `*OPC`
        const OPERATION_COMPLETE = 0x01;
        /// Request control
        const REQUEST_CONTROL = 0x02;
        /// Query error
        const QUERY_ERROR = 0x04;
        /// Device dependent error
        const DEVICE_ERROR = 0x08;
        /// Execution error
        const EXECUTION_ERROR = 0x10;
        /// Command error
        const COMMAND_ERROR = 0x20;
        /// User request
        const USER_REQUEST = 0x40;
        /// Power on
        const POWER_ON = 0x80;
    }
}

impl StatusByte {
    /// Build a status byte from a raw register value.
    pub fn from_raw(raw: u8) -> StatusByte {
        StatusByte::from_bits_truncate(raw)
    }

    /// Returns `true` if any bit of `mask` is set in this status byte.
    pub fn any_of(&self, mask: StatusByte) -> bool {
        self.intersects(mask)
    }
}

impl EventStatus {
    /// Parse the textual answer of `*ESR?`. Instruments answer with a
    /// decimal integer, sometimes with a leading `+`.
    pub fn parse(response: &str) -> Option<EventStatus> {
        let trimmed = response.trim().trim_start_matches('+');
        trimmed.parse::<u8>().ok().map(EventStatus::from_bits_truncate)
    }

    /// Any of the four error bits (query, device, execution, command).
    pub fn has_errors(&self) -> bool {
        self.intersects(EventStatus::QUERY_ERROR | EventStatus::DEVICE_ERROR |
                        EventStatus::EXECUTION_ERROR | EventStatus::COMMAND_ERROR)
    }
}


/// VISA event types the synchronisation layer may arm
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum EventKind {
    /// Asynchronous I/O completion
    IoCompletion = 0x3FFF_2009,
    /// Hardware trigger
    Trigger = 0xBFFF_200A,
    /// Service request raised by the instrument
    ServiceRequest = 0x3FFF_200B,
    /// Device clear received
    Clear = 0x3FFF_200D,
}

/// VISA event handling mechanisms
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum EventMechanism {
    /// Events are queued and picked up by `wait_on_event`
    Queue = 1,
    /// Events invoke a callback handler
    Handler = 2,
    /// Handler mechanism, suspended
    SuspendHandler = 4,
    /// All of the above
    All = 0xFFFF,
}

impl EventKind {
    /// Raw VISA event type code
    pub fn code(&self) -> u32 {
        *self as u32
    }
}

impl EventMechanism {
    /// Raw VISA mechanism code
    pub fn code(&self) -> u32 {
        *self as u32
    }
}

impl TryFrom<u32> for EventKind {
    type Error = u32;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        EventKind::from_u32(code).ok_or(code)
    }
}

impl TryFrom<u32> for EventMechanism {
    type Error = u32;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        EventMechanism::from_u32(code).ok_or(code)
    }
}
