use std::time::Duration;

use tokio::time::{self, Instant};

/// Tracks the last read or write on one connection.
///
/// `expired` resolves once the connection has been idle for the configured
/// duration. A reaper without a timeout never expires.
#[derive(Debug)]
pub struct IdleReaper {
    timeout: Option<Duration>,
    last_activity: Instant,
}

impl IdleReaper {
    pub fn new(timeout: Option<Duration>) -> Self {
        IdleReaper {
            timeout,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| self.last_activity + timeout)
    }

    /// Waits until the deadline passes without a `touch` in between.
    ///
    /// Cancel safe: the future only reads the timestamp, callers recreate it
    /// after every activity so the deadline always follows the latest touch.
    pub async fn expired(&self) {
        match self.deadline() {
            Some(deadline) => time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
