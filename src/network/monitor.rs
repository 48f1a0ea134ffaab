//! Network availability monitors

use super::{NetworkCallback, NetworkError, NetworkHandle, NetworkMonitor, TransportKind};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

fn next_handle_id() -> u64 {
    NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Reports the configured interfaces as available as soon as they are requested
#[derive(Debug, Default, Clone)]
pub struct StaticMonitor {
    cellular: Option<String>,
    wifi: Option<String>,
}

impl StaticMonitor {
    pub fn new(cellular: Option<String>, wifi: Option<String>) -> Self {
        Self { cellular, wifi }
    }

    fn interface(&self, kind: TransportKind) -> Option<String> {
        match kind {
            TransportKind::Cellular => self.cellular.clone(),
            TransportKind::Wifi => self.wifi.clone(),
        }
    }
}

impl NetworkMonitor for StaticMonitor {
    fn request(&self, callback: NetworkCallback) -> Result<(), NetworkError> {
        let kind = callback.kind();
        callback.on_available(NetworkHandle::new(
            next_handle_id(),
            kind,
            self.interface(kind),
        ));
        Ok(())
    }

    fn release(&self, _kind: TransportKind) {}
}

#[cfg(target_os = "linux")]
pub use sysfs::SysfsMonitor;

#[cfg(target_os = "linux")]
mod sysfs {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tracing::debug;

    /// Polls `/sys/class/net/<if>/operstate`
    pub struct SysfsMonitor {
        cellular: Option<String>,
        wifi: Option<String>,
        poll_interval: Duration,
        root: PathBuf,
        watchers: Mutex<HashMap<TransportKind, CancellationToken>>,
    }

    impl SysfsMonitor {
        pub fn new(cellular: Option<String>, wifi: Option<String>, poll_interval: Duration) -> Self {
            Self {
                cellular,
                wifi,
                poll_interval,
                root: PathBuf::from("/sys/class/net"),
                watchers: Mutex::new(HashMap::new()),
            }
        }

        /// Read state from `root` instead of `/sys/class/net`
        pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
            self.root = root.into();
            self
        }

        fn interface(&self, kind: TransportKind) -> Option<&String> {
            match kind {
                TransportKind::Cellular => self.cellular.as_ref(),
                TransportKind::Wifi => self.wifi.as_ref(),
            }
        }
    }

    fn link_up(path: &std::path::Path) -> bool {
        std::fs::read_to_string(path)
            .map(|state| matches!(state.trim(), "up" | "unknown"))
            .unwrap_or(false)
    }

    impl NetworkMonitor for SysfsMonitor {
        fn request(&self, callback: NetworkCallback) -> Result<(), NetworkError> {
            let kind = callback.kind();
            let Some(interface) = self.interface(kind).cloned() else {
                // nothing to watch, system routing is always there
                callback.on_available(NetworkHandle::new(next_handle_id(), kind, None));
                return Ok(());
            };

            let runtime = tokio::runtime::Handle::try_current()
                .map_err(|e| NetworkError::Monitor(e.to_string()))?;

            let token = CancellationToken::new();
            if let Some(previous) = self.watchers.lock().insert(kind, token.clone()) {
                previous.cancel();
            }

            let path = self.root.join(&interface).join("operstate");
            let poll_interval = self.poll_interval;

            runtime.spawn(async move {
                let mut current: Option<u64> = None;
                let mut ticker = tokio::time::interval(poll_interval);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    if !callback.is_current() {
                        break;
                    }

                    match (link_up(&path), current) {
                        (true, None) => {
                            let id = next_handle_id();
                            callback.on_available(NetworkHandle::new(
                                id,
                                kind,
                                Some(interface.clone()),
                            ));
                            current = Some(id);
                        }
                        (false, Some(id)) => {
                            callback.on_lost(id);
                            current = None;
                        }
                        _ => {}
                    }
                }
                debug!("Stopped watching {} ({})", interface, kind);
            });

            Ok(())
        }

        fn release(&self, kind: TransportKind) {
            if let Some(token) = self.watchers.lock().remove(&kind) {
                token.cancel();
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::network::{DnsResolver, NetworkSelector};
        use std::sync::Arc;

        async fn wait_for(selector: &NetworkSelector, connected: bool) {
            let mut rx = selector.subscribe(TransportKind::Cellular);
            tokio::time::timeout(Duration::from_secs(5), async {
                while rx.borrow_and_update().is_connected() != connected {
                    rx.changed().await.unwrap();
                }
            })
            .await
            .unwrap();
        }

        #[tokio::test]
        async fn test_operstate_transitions() {
            let root = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(root.path().join("wwan0")).unwrap();
            let state = root.path().join("wwan0").join("operstate");
            std::fs::write(&state, "down\n").unwrap();

            let monitor = SysfsMonitor::new(
                Some("wwan0".to_string()),
                None,
                Duration::from_millis(20),
            )
            .with_root(root.path());
            let selector = NetworkSelector::new(
                Arc::new(monitor),
                DnsResolver::new(Vec::new(), Duration::from_secs(1)),
            );
            selector.acquire().unwrap();

            // wifi has no interface configured and is reported at once
            assert!(selector.wifi().is_some());
            assert!(selector.cellular().is_none());

            std::fs::write(&state, "up\n").unwrap();
            wait_for(&selector, true).await;
            assert_eq!(selector.cellular().unwrap().interface(), Some("wwan0"));

            std::fs::write(&state, "down\n").unwrap();
            wait_for(&selector, false).await;

            selector.release();
        }
    }
}
