use std::time::Duration;
use tokio::sync::watch;

/// One-way "a handshake has completed" flag.
///
/// Fired by the accept loop after every registered session. Only the first
/// transition matters to waiters; the flag is never reset.
pub struct StartupSignal {
    complete: watch::Sender<bool>,
}

impl Default for StartupSignal {
    fn default() -> Self {
        let (complete, _) = watch::channel(false);
        StartupSignal { complete }
    }
}

impl StartupSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.complete.send_replace(true);
    }

    pub fn is_complete(&self) -> bool {
        *self.complete.borrow()
    }

    /// Wait until the signal fires or `timeout` elapses. Returns whether the
    /// signal has fired.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut complete = self.complete.subscribe();
        let fired = async move {
            loop {
                if *complete.borrow_and_update() {
                    return true;
                }
                // the sender lives in `self`, so this only fails on teardown
                if complete.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, fired).await.unwrap_or(false)
    }
}
