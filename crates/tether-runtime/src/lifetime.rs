//! Application lifetime signals
//!
//! A [`Lifetime`] exposes three one-way signals (started, stopping,
//! stopped) as cancellation tokens. The task registry links background
//! work to the `stopping` signal so that requesting shutdown cancels it.

use parking_lot::Mutex;
use std::fmt;
use std::time::Instant;
use tether_core::{CancelSource, CancelToken};

/// Source of application lifecycle signals
pub trait Lifetime: Send + Sync {
    /// Fires once the application has fully started
    fn started(&self) -> CancelToken;

    /// Fires when a graceful shutdown begins
    fn stopping(&self) -> CancelToken;

    /// Fires once shutdown is complete
    fn stopped(&self) -> CancelToken;

    /// Ask the application to begin shutting down
    fn request_stop(&self);
}

/// In-process lifetime driven by explicit notifications
pub struct AppLifetime {
    started: CancelSource,
    stopping: CancelSource,
    stopped: CancelSource,
    started_at: Mutex<Option<Instant>>,
}

impl AppLifetime {
    /// Create a lifetime with no signal fired yet
    pub fn new() -> Self {
        Self {
            started: CancelSource::new(),
            stopping: CancelSource::new(),
            stopped: CancelSource::new(),
            started_at: Mutex::new(None),
        }
    }

    /// Fire the started signal and record the start time
    pub fn notify_started(&self) {
        {
            let mut at = self.started_at.lock();
            if at.is_none() {
                *at = Some(Instant::now());
            }
        }
        tracing::debug!("application started");
        self.started.cancel();
    }

    /// Fire the stopped signal
    ///
    /// Implies stopping if that was never requested.
    pub fn notify_stopped(&self) {
        self.stopping.cancel();
        tracing::debug!("application stopped");
        self.stopped.cancel();
    }

    /// When [`AppLifetime::notify_started`] was first called
    pub fn started_at(&self) -> Option<Instant> {
        *self.started_at.lock()
    }

    /// Check whether shutdown has been requested
    pub fn is_stopping(&self) -> bool {
        self.stopping.is_cancelled()
    }
}

impl Default for AppLifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifetime for AppLifetime {
    fn started(&self) -> CancelToken {
        self.started.token()
    }

    fn stopping(&self) -> CancelToken {
        self.stopping.token()
    }

    fn stopped(&self) -> CancelToken {
        self.stopped.token()
    }

    fn request_stop(&self) {
        if !self.stopping.is_cancelled() {
            tracing::debug!("application stop requested");
        }
        self.stopping.cancel();
    }
}

impl fmt::Debug for AppLifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppLifetime")
            .field("started", &self.started.is_cancelled())
            .field("stopping", &self.stopping.is_cancelled())
            .field("stopped", &self.stopped.is_cancelled())
            .finish()
    }
}
