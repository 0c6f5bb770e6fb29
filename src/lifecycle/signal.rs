//! One-shot broadcast signals.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A one-shot, broadcast, idempotent completion flag.
///
/// Any number of tasks may wait on a signal; firing it more than once has
/// no further effect. Clones share the same flag.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    name: &'static str,
    tx: watch::Sender<bool>,
}

impl Signal {
    /// Create an unfired signal.
    pub fn new(name: &'static str) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(SignalInner { name, tx }),
        }
    }

    /// Signal name, used in logs.
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Whether the signal has fired.
    pub fn is_fired(&self) -> bool {
        *self.inner.tx.borrow()
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub(crate) fn fire(&self) -> bool {
        self.inner.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    /// Wait until the signal fires.
    pub async fn wait(&self) {
        let mut rx = self.inner.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|fired| *fired).await;
    }

    /// Wait until the signal fires or `timeout` elapses.
    ///
    /// Returns whether the signal fired.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.inner.name)
            .field("fired", &self.is_fired())
            .finish()
    }
}
