use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Process-wide cooperative stop flag: a boolean behind a mutex with a
/// condvar so workers can sleep on it instead of polling. Setting the flag
/// wakes every waiter; it is never cleared.
pub struct StopFlag {
    state: Mutex<bool>,
    signal: Condvar,
}

impl StopFlag {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut stopped = self.state.lock().unwrap();
        *stopped = true;
        drop(stopped);
        self.signal.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    /// Sleeps until the flag is set or the timeout elapses. Returns whether
    /// the flag is set, immediately when it already was.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let stopped = self.state.lock().unwrap();
        let (stopped, _) = self
            .signal
            .wait_timeout_while(stopped, timeout, |stopped| !*stopped)
            .unwrap();
        *stopped
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}
