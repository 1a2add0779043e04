//! Post-restart grace period.
//!
//! For a fixed window after startup only reclaim requests (clients
//! re-asserting locks they held before the restart) are admitted. The window
//! ends only when its deadline passes; it is never cut short, because
//! clients whose registration never reached this instance must get the same
//! chance to reclaim.

use crate::error::{Result, WardenError};
use crate::observability;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Grace period configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraceConfig {
    /// Length of the window after startup.
    #[serde(with = "crate::config::humantime_serde")]
    pub duration: Duration,
}

impl Default for GraceConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(90),
        }
    }
}

/// Snapshot of the grace window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GracePeriodWindow {
    pub started_at: Instant,
    pub duration: Duration,
    pub active: bool,
}

/// The grace period controller.
///
/// Holds only immutable fields, so checks are plain clock comparisons with
/// no locking.
#[derive(Debug, Clone)]
pub struct GracePeriod {
    started_at: Instant,
    duration: Duration,
}

impl GracePeriod {
    /// Start a grace window now.
    pub fn start(duration: Duration) -> Self {
        let grace = Self {
            started_at: Instant::now(),
            duration,
        };
        if !duration.is_zero() {
            info!(duration_secs = duration.as_secs(), "Grace period started");
        }
        observability::set_grace_active(grace.is_active());
        grace
    }

    /// A controller whose window has already ended.
    pub fn inactive() -> Self {
        Self {
            started_at: Instant::now(),
            duration: Duration::ZERO,
        }
    }

    /// Whether the window is still open.
    pub fn is_active(&self) -> bool {
        self.started_at.elapsed() < self.duration
    }

    /// When the window closes.
    pub fn deadline(&self) -> Instant {
        self.started_at + self.duration
    }

    /// Time left in the window.
    pub fn remaining(&self) -> Duration {
        self.deadline().saturating_duration_since(Instant::now())
    }

    /// Decide whether a lock request may proceed.
    ///
    /// Reclaim requests are always admitted; new requests are refused with a
    /// retryable error while the window is open.
    pub fn admit(&self, reclaim: bool) -> Result<()> {
        if reclaim {
            return Ok(());
        }
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Ok(());
        }
        Err(WardenError::GracePeriod {
            remaining_ms: remaining.as_millis() as u64,
        })
    }

    /// Current window state.
    pub fn window(&self) -> GracePeriodWindow {
        GracePeriodWindow {
            started_at: self.started_at,
            duration: self.duration,
            active: self.is_active(),
        }
    }
}
