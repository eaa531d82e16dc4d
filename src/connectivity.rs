//! Connectivity signal.
//!
//! Raw online/offline reports are debounced into logical transitions so a
//! flapping network does not trigger a reconciliation pass per flap.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Inner {
    raw: watch::Sender<bool>,
    stable: watch::Sender<bool>,
    debounced: bool,
}

/// Shared online/offline state. Cloning yields another handle to the same signal.
#[derive(Clone)]
pub struct ConnectivitySignal {
    inner: Arc<Inner>,
}

impl ConnectivitySignal {
    /// Create a signal. A non-zero `debounce` spawns a settling task on the
    /// current tokio runtime; without a runtime, reports apply immediately.
    pub fn new(initially_online: bool, debounce: Duration) -> Self {
        let (raw, raw_rx) = watch::channel(initially_online);
        let (stable, _) = watch::channel(initially_online);

        let handle = if debounce.is_zero() {
            None
        } else {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => Some(handle),
                Err(_) => {
                    tracing::warn!("No async runtime; connectivity reports will not be debounced");
                    None
                }
            }
        };

        let inner = Arc::new(Inner {
            raw,
            stable,
            debounced: handle.is_some(),
        });

        if let Some(handle) = handle {
            handle.spawn(settle(raw_rx, Arc::downgrade(&inner), debounce));
        }

        Self { inner }
    }

    /// Current logical state.
    pub fn is_online(&self) -> bool {
        *self.inner.stable.borrow()
    }

    /// Receiver that observes logical transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.stable.subscribe()
    }

    /// Feed a raw network event.
    pub fn report(&self, online: bool) {
        if self.inner.debounced {
            self.inner.raw.send_replace(online);
        } else {
            publish(&self.inner.stable, online);
        }
    }
}

fn publish(stable: &watch::Sender<bool>, online: bool) -> bool {
    let changed = stable.send_if_modified(|current| {
        if *current == online {
            false
        } else {
            *current = online;
            true
        }
    });
    if changed {
        tracing::info!(online, "Connectivity changed");
    }
    changed
}

/// Forward a raw value once it has held steady for `window`.
async fn settle(mut raw_rx: watch::Receiver<bool>, inner: Weak<Inner>, window: Duration) {
    loop {
        if raw_rx.changed().await.is_err() {
            return;
        }
        loop {
            match tokio::time::timeout(window, raw_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return,
                Err(_) => break,
            }
        }
        let value = *raw_rx.borrow_and_update();
        let Some(inner) = inner.upgrade() else {
            return;
        };
        publish(&inner.stable, value);
    }
}

/// Drives a signal from a periodic health check.
pub struct ConnectivityProbe {
    signal: ConnectivitySignal,
    interval: Duration,
}

impl ConnectivityProbe {
    pub fn new(signal: ConnectivitySignal, interval: Duration) -> Self {
        Self { signal, interval }
    }

    /// Run `check` every interval and report its result until the task is aborted.
    pub fn spawn<F, Fut>(self, check: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = check().await;
                tracing::trace!(online, "Health probe");
                self.signal.report(online);
            }
        })
    }
}
