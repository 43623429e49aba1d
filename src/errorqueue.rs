//! Instrument error queue draining
//!
//! SCPI instruments queue faults (undefined headers, out of range
//! parameters, hardware errors) without interrupting command execution.
//! [`drain`] pops the queue until the instrument reports `"No error"`
//! and collects everything else into an [`ErrorRecord`].

use std::fmt;
use log::warn;

use crate::transport::TransportError;

/// Sentinel contained in the reply of an empty error queue. Matched
/// case-insensitively, quotes included, so that `0,"No error"` and
/// `+0,"no error"` are both recognised.
pub const NO_ERROR: &str = "\"no error\"";

/// Entry appended when the queue could not be emptied
pub const QUEUE_OVERFLOW: &str = "Cannot clear the error queue";

/// Default number of queue reads before giving up
pub const DEFAULT_CAP: usize = 50;

/// Returns `true` if `response` reports an empty error queue
pub fn is_no_error(response: &str) -> bool {
    response.to_lowercase().contains(NO_ERROR)
}

/// Ordered list of raw error strings collected by one drain
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorRecord {
    entries: Vec<String>,
    overflowed: bool,
}

impl ErrorRecord {

    pub fn new() -> ErrorRecord {
        ErrorRecord::default()
    }

    fn push(&mut self, entry: String) {
        self.entries.push(entry);
    }

    fn mark_overflow(&mut self) {
        self.entries.push(QUEUE_OVERFLOW.to_string());
        self.overflowed = true;
    }

    /// Number of entries, including the overflow marker if present
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `true` if the drain was stopped by the cap rather than by the
    /// instrument reporting an empty queue. The last entry is then
    /// [`QUEUE_OVERFLOW`].
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.entries.iter()
    }

    pub fn into_inner(self) -> Vec<String> {
        self.entries
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entries.join("\n"))
    }
}

impl<'a> IntoIterator for &'a ErrorRecord {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Pop the error queue through `next` until the no-error sentinel is
/// seen or `cap` entries have been collected.
///
/// `next` performs one error query on the bus. At most `cap` queries
/// are issued; if none of them returned the sentinel the record gets
/// a final [`QUEUE_OVERFLOW`] entry, for `cap + 1` entries in total.
pub fn drain<F>(mut next: F, cap: usize) -> Result<ErrorRecord, TransportError>
where
    F: FnMut() -> Result<String, TransportError>
{
    let mut record = ErrorRecord::new();

    loop {
        if record.len() >= cap {
            warn!("Error queue not empty after {} reads; giving up", cap);
            record.mark_overflow();
            break;
        }

        let response = next()?;
        if is_no_error(&response) {
            break;
        }
        record.push(response.trim_end().to_string());
    }

    Ok(record)
}


#[cfg(test)]
mod tests {

    use std::collections::VecDeque;
    use assert_matches::assert_matches;
    use super::{drain, is_no_error, QUEUE_OVERFLOW, DEFAULT_CAP};
    use crate::transport::TransportError;

    #[test]
    fn sentinel_matching() {
        assert!(is_no_error("0,\"No error\""));
        assert!(is_no_error("+0,\"NO ERROR\"\n"));
        assert!(!is_no_error("-113,\"Undefined header\""));
        // unquoted text is not the sentinel
        assert!(!is_no_error("0,no error"));
    }

    #[test]
    fn drain_clean_queue() {
        let mut reads = 0;
        let record = drain(|| { reads += 1; Ok("0,\"No error\"".to_string()) }, DEFAULT_CAP)
            .unwrap();
        assert!(record.is_empty());
        assert!(!record.overflowed());
        assert_eq!(reads, 1);
    }

    #[test]
    fn drain_keeps_order() {
        let mut queue: VecDeque<&str> = VecDeque::from(vec![
            "-113,\"Undefined header\"",
            "-222,\"Data out of range\"",
            "0,\"No error\"",
        ]);
        let record = drain(|| Ok(queue.pop_front().unwrap().to_string()), DEFAULT_CAP).unwrap();
        assert_eq!(record.entries(), &["-113,\"Undefined header\"", "-222,\"Data out of range\""]);
        assert_eq!(record.to_string(), "-113,\"Undefined header\"\n-222,\"Data out of range\"");
    }

    #[test]
    fn drain_runaway() {
        let mut reads = 0;
        let record = drain(|| { reads += 1; Ok("-350,\"Queue overflow\"".to_string()) },
            DEFAULT_CAP).unwrap();

        assert_eq!(reads, 50);
        assert_eq!(record.len(), 51);
        assert!(record.overflowed());
        assert_eq!(record.entries().last().unwrap(), QUEUE_OVERFLOW);
    }

    #[test]
    fn drain_custom_cap() {
        let mut reads = 0;
        let record = drain(|| { reads += 1; Ok("-100,\"Command error\"".to_string()) }, 3)
            .unwrap();
        assert_eq!(reads, 3);
        assert_eq!(record.len(), 4);
    }

    #[test]
    fn drain_transport_error() {
        let res = drain(|| Err(TransportError::Timeout), DEFAULT_CAP);
        assert_matches!(res, Err(TransportError::Timeout));
    }
}
