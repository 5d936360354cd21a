use crate::error::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Deadline and cancellation flag passed to every blocking operation.
///
/// Clones share the cancellation flag, so cancelling any of them stops all
/// operations that were handed a clone. Teardown paths never consult a `Ctx`.
#[derive(Debug, Clone, Default)]
pub struct Ctx {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Ctx {
    /// A context that never expires on its own.
    pub fn background() -> Self {
        Self::default()
    }

    /// A child context sharing this one's cancellation flag, expiring after
    /// `timeout` or at the parent deadline, whichever comes first.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };

        Self {
            deadline: Some(deadline),
            cancelled: Arc::clone(&self.cancelled),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_done(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Returns `Error::Cancelled` once the context is cancelled or expired.
    pub fn check(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(Error::Cancelled {
                reason: "context cancelled".into(),
            });
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Error::Cancelled {
                reason: "deadline exceeded".into(),
            });
        }
        Ok(())
    }

    /// Sleeps for `duration` in short slices, returning early with an error
    /// if the context is cancelled or expires meanwhile.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let until = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            thread::sleep(SLEEP_SLICE.min(until - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_context_is_never_done() {
        let ctx = Ctx::background();
        assert!(ctx.check().is_ok());
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let ctx = Ctx::background();
        let child = ctx.with_timeout(Duration::from_secs(60));

        ctx.cancel();

        assert!(child.is_done());
        assert!(child.check().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_child_deadline_never_exceeds_parent() {
        let parent = Ctx::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(60));

        assert_eq!(child.deadline(), parent.deadline());
    }

    #[test]
    fn test_sleep_stops_at_deadline() {
        let ctx = Ctx::background().with_timeout(Duration::from_millis(20));
        let start = Instant::now();

        let result = ctx.sleep(Duration::from_secs(5));

        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_sleep_completes_without_deadline() {
        let ctx = Ctx::background();
        assert!(ctx.sleep(Duration::from_millis(5)).is_ok());
    }
}
