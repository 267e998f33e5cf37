//! Cancellation and deadlines for long-running work (migration, checkpoint I/O).

use crate::error::{IndexError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared cancellation flag. Cloning yields another handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// A cancellation token paired with an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct WorkBudget {
    token: CancelToken,
    deadline: Option<(Instant, Duration)>,
}

impl WorkBudget {
    pub fn new(token: CancelToken, timeout: Option<Duration>) -> Self {
        Self {
            token,
            deadline: timeout.map(|t| (Instant::now() + t, t)),
        }
    }

    /// A budget that never expires and can only be cancelled through `token`.
    pub fn unbounded(token: CancelToken) -> Self {
        Self::new(token, None)
    }

    /// Returns `Err(Cancelled)` or `Err(Timeout)` once the work must stop.
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(IndexError::Cancelled);
        }
        if let Some((deadline, timeout)) = self.deadline {
            if Instant::now() >= deadline {
                return Err(IndexError::Timeout(timeout.as_millis() as u64));
            }
        }
        Ok(())
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}
