use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Wall-clock limit for a spin loop. `None` never expires.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub(crate) fn after(timeout: Option<Duration>) -> Self {
        Self {
            at: timeout.and_then(|timeout| Instant::now().checked_add(timeout)),
        }
    }

    pub(crate) fn expired(&self) -> bool {
        matches!(self.at, Some(at) if Instant::now() >= at)
    }

    /// Time left, `None` if unbounded.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Fails with [`Error::Timeout`] once expired.
    pub(crate) fn check(&self, what: &'static str) -> Result<()> {
        if self.expired() {
            Err(Error::Timeout(what))
        } else {
            Ok(())
        }
    }
}

/// Gives up the rest of the time slice between two polls.
pub(crate) fn relax() {
    std::thread::yield_now();
}

/// Converts an optional timeout into the millisecond argument of `epoll_wait`.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(timeout) => timeout
            .as_millis()
            .try_into()
            .unwrap_or(i32::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_deadline_never_expires() {
        let deadline = Deadline::after(None);
        assert!(!deadline.expired());
        assert_eq!(None, deadline.remaining());
        assert!(Deadline::after(None).check("waiting").is_ok());
    }

    #[test]
    fn bounded_deadline_expires() {
        let deadline = Deadline::after(Some(Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(10));
        assert!(deadline.expired());
        assert_eq!(Some(Duration::ZERO), deadline.remaining());
        assert!(matches!(deadline.check("waiting"), Err(Error::Timeout("waiting"))));
    }

    #[test]
    fn epoll_timeout_conversion() {
        assert_eq!(-1, timeout_millis(None));
        assert_eq!(250, timeout_millis(Some(Duration::from_millis(250))));
        assert_eq!(i32::MAX, timeout_millis(Some(Duration::from_secs(u64::MAX / 2))));
    }
}
