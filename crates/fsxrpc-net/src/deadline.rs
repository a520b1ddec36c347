//! Monotonic deadlines for bounded socket I/O.
//!
//! A single total timeout covers a whole transfer, however many partial
//! sends or receives it takes. Each blocking call gets the time still left,
//! recomputed from a monotonic clock before the call is issued.

use std::time::{Duration, Instant};

/// Smallest timeout handed to the kernel; a zero `SO_RCVTIMEO`/`SO_SNDTIMEO`
/// means "block forever".
pub const MIN_SOCKET_TIMEOUT: Duration = Duration::from_millis(1);

/// A total time budget started at construction.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    /// Starts a deadline of `budget` from now.
    pub fn new(budget: Duration) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    /// The total budget this deadline was created with.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time consumed since the deadline started.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// `budget - elapsed`, saturating at zero.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    /// Returns `true` once the whole budget has been consumed.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Remaining time as a socket option value, never zero.
    pub fn socket_timeout(&self) -> Duration {
        self.remaining().max(MIN_SOCKET_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_deadline_not_expired() {
        let d = Deadline::new(Duration::from_secs(10));
        assert!(!d.is_expired());
        assert!(d.remaining() <= Duration::from_secs(10));
        assert!(d.remaining() > Duration::from_secs(9));
    }

    #[test]
    fn test_zero_budget_is_expired() {
        let d = Deadline::new(Duration::ZERO);
        assert!(d.is_expired());
        assert_eq!(d.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_remaining_shrinks() {
        let d = Deadline::new(Duration::from_millis(200));
        let first = d.remaining();
        std::thread::sleep(Duration::from_millis(20));
        let second = d.remaining();
        assert!(second < first);
        assert!(d.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_socket_timeout_never_zero() {
        let d = Deadline::new(Duration::ZERO);
        assert_eq!(d.socket_timeout(), MIN_SOCKET_TIMEOUT);
    }

    #[test]
    fn test_expires_after_budget() {
        let d = Deadline::new(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(15));
        assert!(d.is_expired());
        assert_eq!(d.budget(), Duration::from_millis(5));
    }
}
