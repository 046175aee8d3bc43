//! Cancellable background loops.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{runtime::Handle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// A named loop that runs a tick once per period until stopped.
///
/// Starting a running task and stopping a stopped one are both no-ops.
#[derive(Debug)]
pub(crate) struct PeriodicTask {
    name: &'static str,
    token: Mutex<Option<CancellationToken>>,
}

impl PeriodicTask {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            token: Mutex::new(None),
        }
    }

    /// Spawns the loop, returns `false` if it is already running.
    ///
    /// The first tick fires after one period, the loop ends early if the tick returns `false`. A
    /// panicking tick is logged and the loop carries on with the next one.
    pub(crate) fn start<F>(&self, handle: &Handle, period: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let mut token_g = self.token.lock();

        if token_g.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return false;
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let name = self.name;
        *token_g = Some(token);

        handle.spawn(async move {
            debug!("{name} loop started");

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = sleep(period) => {
                        trace!("{name} tick");
                        match catch_unwind(AssertUnwindSafe(&mut tick)) {
                            Ok(true) => {}
                            Ok(false) => {
                                child.cancel();
                                break;
                            }
                            Err(_) => warn!("{name} tick panicked"),
                        }
                    }
                }
            }

            debug!("{name} loop stopped");
        });

        true
    }

    /// Interrupts the loop, returns `false` if it wasn't running.
    pub(crate) fn stop(&self) -> bool {
        match self.token.lock().take() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.token
            .lock()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
