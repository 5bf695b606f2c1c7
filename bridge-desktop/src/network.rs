//! Network Monitoring Implementation

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    network::{NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType},
};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

const PROBE_ADDR: &str = "8.8.8.8:53";

/// Desktop network monitor implementation
///
/// Detects connectivity with a TCP probe. Platform-specific APIs (netlink,
/// SystemConfiguration, WinAPI) would be more precise but need extra
/// dependencies.
pub struct DesktopNetworkMonitor {
    poll_interval: Duration,
}

impl DesktopNetworkMonitor {
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    async fn probe() -> NetworkStatus {
        match tokio::time::timeout(
            Duration::from_secs(5),
            tokio::net::TcpStream::connect(PROBE_ADDR),
        )
        .await
        {
            Ok(Ok(_)) => NetworkStatus::Connected,
            Ok(Err(_)) | Err(_) => NetworkStatus::Disconnected,
        }
    }

    async fn current() -> NetworkInfo {
        let status = Self::probe().await;
        debug!(status = ?status, "Network probe finished");
        NetworkInfo {
            status,
            network_type: (status == NetworkStatus::Connected).then_some(NetworkType::Other),
            is_metered: false,
        }
    }
}

impl Default for DesktopNetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkMonitor for DesktopNetworkMonitor {
    async fn get_network_info(&self) -> Result<NetworkInfo> {
        Ok(Self::current().await)
    }

    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>> {
        Ok(Box::new(PollingChangeStream {
            interval: self.poll_interval,
            last_status: None,
        }))
    }
}

/// Polls the probe and yields only transitions
struct PollingChangeStream {
    interval: Duration,
    last_status: Option<NetworkStatus>,
}

#[async_trait]
impl NetworkChangeStream for PollingChangeStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        loop {
            tokio::time::sleep(self.interval).await;
            let info = DesktopNetworkMonitor::current().await;
            if self.last_status != Some(info.status) {
                self.last_status = Some(info.status);
                return Some(info);
            }
        }
    }
}

/// Network monitor whose status is set by the host or a test
pub struct ManualNetworkMonitor {
    tx: watch::Sender<NetworkInfo>,
}

impl ManualNetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let info = NetworkInfo {
            status: initial,
            network_type: None,
            is_metered: false,
        };
        let (tx, _rx) = watch::channel(info);
        Self { tx }
    }

    /// Publish a new status; subscribers see only actual changes
    pub fn set_status(&self, status: NetworkStatus) {
        self.tx.send_if_modified(|info| {
            if info.status == status {
                false
            } else {
                info.status = status;
                true
            }
        });
    }

    pub fn set_online(&self) {
        self.set_status(NetworkStatus::Connected);
    }

    pub fn set_offline(&self) {
        self.set_status(NetworkStatus::Disconnected);
    }
}

#[async_trait]
impl NetworkMonitor for ManualNetworkMonitor {
    async fn get_network_info(&self) -> Result<NetworkInfo> {
        Ok(self.tx.borrow().clone())
    }

    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>> {
        Ok(Box::new(WatchChangeStream {
            rx: self.tx.subscribe(),
        }))
    }
}

struct WatchChangeStream {
    rx: watch::Receiver<NetworkInfo>,
}

#[async_trait]
impl NetworkChangeStream for WatchChangeStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_network_info() {
        let monitor = DesktopNetworkMonitor::new();
        let info = monitor.get_network_info().await.unwrap();

        assert!(matches!(
            info.status,
            NetworkStatus::Connected | NetworkStatus::Disconnected
        ));
    }

    #[tokio::test]
    async fn test_manual_monitor_emits_transitions() {
        let monitor = ManualNetworkMonitor::new(NetworkStatus::Disconnected);
        assert!(!monitor.is_connected().await);

        let mut changes = monitor.subscribe_changes().await.unwrap();
        // Same status is not a change
        monitor.set_offline();
        monitor.set_online();

        let info = changes.next().await.unwrap();
        assert_eq!(info.status, NetworkStatus::Connected);
        assert!(monitor.is_connected().await);
    }
}
