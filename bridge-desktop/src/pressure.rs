//! Host-driven memory pressure notifications

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    memory::{MemoryPressureLevel, MemoryPressureMonitor, MemoryPressureStream},
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Memory pressure monitor fed by explicit [`signal`](Self::signal) calls
///
/// Hosts wire their platform callback (or a test) to `signal`.
pub struct ManualMemoryPressureMonitor {
    tx: broadcast::Sender<MemoryPressureLevel>,
}

impl ManualMemoryPressureMonitor {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(16);
        Self { tx }
    }

    pub fn signal(&self, level: MemoryPressureLevel) {
        // No subscribers is fine
        let delivered = self.tx.send(level).unwrap_or(0);
        debug!(?level, delivered, "Memory pressure signalled");
    }
}

impl Default for ManualMemoryPressureMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryPressureMonitor for ManualMemoryPressureMonitor {
    async fn subscribe(&self) -> Result<Box<dyn MemoryPressureStream>> {
        Ok(Box::new(BroadcastPressureStream {
            rx: self.tx.subscribe(),
        }))
    }
}

struct BroadcastPressureStream {
    rx: broadcast::Receiver<MemoryPressureLevel>,
}

#[async_trait]
impl MemoryPressureStream for BroadcastPressureStream {
    async fn next(&mut self) -> Option<MemoryPressureLevel> {
        match self.rx.recv().await {
            Ok(level) => Some(level),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Bursts collapse into one trim downstream anyway
                warn!(skipped, "Memory pressure stream lagged");
                Some(MemoryPressureLevel::Critical)
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_reaches_subscriber() {
        let monitor = ManualMemoryPressureMonitor::new();
        let mut stream = monitor.subscribe().await.unwrap();

        monitor.signal(MemoryPressureLevel::Critical);
        assert_eq!(stream.next().await, Some(MemoryPressureLevel::Critical));
    }

    #[test]
    fn test_signal_without_subscribers_is_noop() {
        ManualMemoryPressureMonitor::new().signal(MemoryPressureLevel::Moderate);
    }
}
