//! Connectivity Monitor - boolean "online" signal
//!
//! The host platform usually knows best and calls [`ConnectivityMonitor::set_online`];
//! [`ConnectivityMonitor::spawn_probe`] is available for hosts that do not.
//! Every offline -> online transition is also queued on a broadcast channel,
//! so a flap that happens while the coordinator is busy is still seen as a
//! sync trigger once it looks again.

use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
    restored: broadcast::Sender<()>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        let (restored, _) = broadcast::channel(16);
        Self { state, restored }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Report the current reachability. Repeated values are not re-announced.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            log::info!("Connectivity changed: {}", if online { "online" } else { "offline" });
            if online {
                // No receivers is fine: nobody is waiting to sync
                let _ = self.restored.send(());
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// One message per offline -> online transition, buffered until read
    pub fn on_restored(&self) -> broadcast::Receiver<()> {
        self.restored.subscribe()
    }

    /// Poll `url` every `interval` and feed the result into the monitor.
    ///
    /// Any HTTP response counts as online; connection errors and timeouts
    /// count as offline.
    pub fn spawn_probe(
        self: Arc<Self>,
        url: String,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, reqwest::Error> {
        let client = Client::builder().timeout(interval.min(Duration::from_secs(10))).build()?;

        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let online = match client.head(&url).send().await {
                            Ok(_) => true,
                            Err(e) => {
                                log::debug!("Connectivity probe failed: {}", e);
                                false
                            }
                        };
                        self.set_online(online);
                    }
                }
            }
            log::info!("Connectivity probe stopped");
        }))
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
