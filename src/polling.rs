//! Bounded status-byte polling with progressive backoff

use std::time::{Duration, Instant};
use thiserror::Error;
use log::debug;

use crate::registers::StatusByte;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum PollError {
    /// Target bit never observed within the deadline
    #[error("No completion after {0:?}")]
    Expired(Duration),
    /// Sampling the status byte failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Sleep tier of the polling loop
///
/// The tier is chosen from the time elapsed since polling started, not
/// from the number of samples taken. Tiers are ordered by their delay
/// so `Backoff::for_elapsed` is non-decreasing in elapsed time: fast
/// operations are picked up within a millisecond while slow ones are
/// sampled at most twice a second.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Backoff {
    /// ≤ 10 ms: sample back to back
    Tight,
    /// (10 ms, 100 ms]: 1 ms
    Fine,
    /// (100 ms, 1 s]: 10 ms
    Short,
    /// (1 s, 10 s]: 100 ms
    Medium,
    /// > 10 s: 500 ms
    Long,
}

impl Backoff {

    /// Tier for the given elapsed time
    pub fn for_elapsed(elapsed: Duration) -> Backoff {
        if elapsed > Duration::from_secs(10) {
            Backoff::Long
        } else if elapsed > Duration::from_secs(1) {
            Backoff::Medium
        } else if elapsed > Duration::from_millis(100) {
            Backoff::Short
        } else if elapsed > Duration::from_millis(10) {
            Backoff::Fine
        } else {
            Backoff::Tight
        }
    }

    /// Delay before the next sample
    pub fn delay(&self) -> Duration {
        match self {
            Backoff::Tight => Duration::from_millis(0),
            Backoff::Fine => Duration::from_millis(1),
            Backoff::Short => Duration::from_millis(10),
            Backoff::Medium => Duration::from_millis(100),
            Backoff::Long => Duration::from_millis(500),
        }
    }

    /// Longest delay any tier can introduce; also the worst-case
    /// overshoot of a poll past its timeout.
    pub const MAX_DELAY: Duration = Duration::from_millis(500);
}

/// Bookkeeping of a single poll
#[derive(Clone, Debug)]
pub struct PollingState {
    start: Instant,
    elapsed: Duration,
    tier: Backoff,
    samples: usize,
}

impl PollingState {

    fn new() -> PollingState {
        PollingState {
            start: Instant::now(),
            elapsed: Duration::from_millis(0),
            tier: Backoff::Tight,
            samples: 0,
        }
    }

    fn update(&mut self) {
        self.elapsed = self.start.elapsed();
        let tier = Backoff::for_elapsed(self.elapsed);
        if tier != self.tier {
            debug!("Polling backoff {:?} -> {:?} after {:?}", self.tier, tier, self.elapsed);
            self.tier = tier;
        }
    }

    /// Time between the start of the poll and the last sample
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Current backoff tier
    pub fn tier(&self) -> Backoff {
        self.tier
    }

    /// Number of status samples taken
    pub fn samples(&self) -> usize {
        self.samples
    }
}

/// Sample the status byte until any bit of `target` is set.
///
/// `sample` performs the actual bus read. The loop samples first and
/// checks the deadline second, so a target that is already set is
/// always picked up, and a poll that never succeeds fails no earlier
/// than `timeout` and no later than `timeout` plus one backoff delay.
pub fn poll<F>(mut sample: F, target: StatusByte, timeout: Duration)
    -> Result<PollingState, PollError>
where
    F: FnMut() -> Result<u8, TransportError>
{
    let mut state = PollingState::new();

    loop {
        let stb = StatusByte::from_raw(sample()?);
        state.samples += 1;

        if stb.any_of(target) {
            state.update();
            return Ok(state);
        }

        state.update();
        if state.elapsed > timeout {
            return Err(PollError::Expired(state.elapsed));
        }

        let delay = state.tier.delay();
        if delay > Duration::from_millis(0) {
            spin_sleep::sleep(delay);
        }
    }
}


#[cfg(test)]
mod tests {

    use std::time::{Duration, Instant};
    use assert_matches::assert_matches;
    use super::{poll, Backoff, PollError};
    use crate::registers::StatusByte;
    use crate::transport::TransportError;

    #[test]
    fn backoff_brackets() {
        assert_eq!(Backoff::for_elapsed(Duration::from_millis(0)), Backoff::Tight);
        assert_eq!(Backoff::for_elapsed(Duration::from_millis(10)), Backoff::Tight);
        assert_eq!(Backoff::for_elapsed(Duration::from_micros(10_001)), Backoff::Fine);
        assert_eq!(Backoff::for_elapsed(Duration::from_millis(100)), Backoff::Fine);
        assert_eq!(Backoff::for_elapsed(Duration::from_millis(101)), Backoff::Short);
        assert_eq!(Backoff::for_elapsed(Duration::from_secs(1)), Backoff::Short);
        assert_eq!(Backoff::for_elapsed(Duration::from_millis(1001)), Backoff::Medium);
        assert_eq!(Backoff::for_elapsed(Duration::from_secs(10)), Backoff::Medium);
        assert_eq!(Backoff::for_elapsed(Duration::from_millis(10_001)), Backoff::Long);
        assert_eq!(Backoff::for_elapsed(Duration::from_secs(3600)), Backoff::Long);
    }

    #[test]
    fn backoff_monotonic() {
        let mut last = Duration::from_millis(0);
        // sweep 0 -> 20 s in 250 us steps
        for step in 0u64..80_000 {
            let delay = Backoff::for_elapsed(Duration::from_micros(step * 250)).delay();
            assert!(delay >= last, "delay decreased at step {}", step);
            assert!(delay <= Backoff::MAX_DELAY);
            last = delay;
        }
        assert_eq!(last, Backoff::MAX_DELAY);
    }

    #[test]
    fn poll_immediate_hit() {
        let state = poll(|| Ok(0x20), StatusByte::EVENT_STATUS, Duration::from_secs(1)).unwrap();
        assert_eq!(state.samples(), 1);
        assert_eq!(state.tier(), Backoff::Tight);
    }

    #[test]
    fn poll_waits_for_bit() {
        let start = Instant::now();
        let sample = || {
            if start.elapsed() >= Duration::from_millis(30) { Ok(0x20) } else { Ok(0x00) }
        };
        let state = poll(sample, StatusByte::EVENT_STATUS, Duration::from_secs(1)).unwrap();
        assert!(state.elapsed() >= Duration::from_millis(29));
        assert!(state.elapsed() < Duration::from_millis(200));
        assert_eq!(state.tier(), Backoff::Fine);
    }

    #[test]
    fn poll_ignores_other_bits() {
        let timeout = Duration::from_millis(50);
        let res = poll(|| Ok(0xDF), StatusByte::EVENT_STATUS, timeout);
        assert_matches!(res, Err(PollError::Expired(e)) if e > timeout);
    }

    #[test]
    fn poll_timeout_bound() {
        let timeout = Duration::from_millis(150);
        let start = Instant::now();
        let res = poll(|| Ok(0x00), StatusByte::EVENT_STATUS, timeout);
        let total = start.elapsed();

        assert_matches!(res, Err(PollError::Expired(_)));
        assert!(total >= timeout);
        assert!(total < timeout + Backoff::MAX_DELAY);
    }

    #[test]
    fn poll_propagates_transport_error() {
        let res = poll(|| Err(TransportError::Closed), StatusByte::EVENT_STATUS,
            Duration::from_secs(1));
        assert_matches!(res, Err(PollError::Transport(TransportError::Closed)));
    }
}
