//! Memory Pressure Signals
//!
//! Hosts forward low-memory notifications (`didReceiveMemoryWarning`,
//! `onTrimMemory`, cgroup pressure) through this trait so the cache can shed
//! inactive entries.

use async_trait::async_trait;

use crate::error::Result;

/// Severity reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressureLevel {
    /// The system is running low; shedding caches is advised
    Moderate,
    /// The process may be killed unless memory is released
    Critical,
}

#[async_trait]
pub trait MemoryPressureMonitor: Send + Sync {
    /// Subscribe to low-memory notifications
    async fn subscribe(&self) -> Result<Box<dyn MemoryPressureStream>>;
}

/// Stream of low-memory notifications
#[async_trait]
pub trait MemoryPressureStream: Send {
    /// Wait for the next signal
    ///
    /// Returns `None` when the host stops reporting.
    async fn next(&mut self) -> Option<MemoryPressureLevel>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(MemoryPressureLevel::Critical > MemoryPressureLevel::Moderate);
    }
}
