//! Network Monitoring Abstraction
//!
//! Connectivity information the sync engine reacts to: a reconnect forces an
//! immediate remote change check, a disconnect parks the service.

use async_trait::async_trait;

use crate::error::Result;

/// Network connection type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    /// Cellular/mobile data connection
    Cellular,
    /// WiFi connection
    WiFi,
    /// Ethernet connection
    Ethernet,
    /// Other or unknown connection type
    Other,
}

/// Network connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    /// Connected to network
    Connected,
    /// Not connected to any network
    Disconnected,
    /// Connection status unknown or indeterminate
    Indeterminate,
}

/// Snapshot of the current connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub status: NetworkStatus,
    pub network_type: Option<NetworkType>,
    /// Metered connections still sync; hosts may surface this to users
    pub is_metered: bool,
}

impl NetworkInfo {
    pub fn connected(network_type: NetworkType) -> Self {
        Self {
            status: NetworkStatus::Connected,
            network_type: Some(network_type),
            is_metered: false,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            status: NetworkStatus::Disconnected,
            network_type: None,
            is_metered: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == NetworkStatus::Connected
    }
}

/// Network monitor trait
///
/// The engine subscribes once and feeds every update into its service state:
/// - Disconnected moves the service to temporarily unavailable
/// - Connected schedules a remote change listing right away
///
/// # Example
///
/// ```ignore
/// use bridge_traits::network::NetworkMonitor;
///
/// async fn watch(monitor: &dyn NetworkMonitor) -> Result<()> {
///     let mut changes = monitor.subscribe_changes().await?;
///     while let Some(info) = changes.next().await {
///         tracing::info!(status = ?info.status, "network changed");
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    /// Get current network information
    async fn get_network_info(&self) -> Result<NetworkInfo>;

    /// Connected to any network; lookup failures count as offline
    async fn is_connected(&self) -> bool {
        self.get_network_info()
            .await
            .map(|info| info.is_connected())
            .unwrap_or(false)
    }

    /// Subscribe to network status changes
    ///
    /// Returns a stream of network info updates. Implementations should
    /// emit an event whenever network status changes.
    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>>;
}

/// Stream of network status changes
#[async_trait]
pub trait NetworkChangeStream: Send {
    /// Get the next network info update
    ///
    /// Returns `None` when the stream is closed.
    async fn next(&mut self) -> Option<NetworkInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_info() {
        let info = NetworkInfo::disconnected();
        assert_eq!(info.status, NetworkStatus::Disconnected);
        assert!(info.network_type.is_none());
    }

    #[test]
    fn test_connected_info() {
        let info = NetworkInfo::connected(NetworkType::Ethernet);
        assert!(info.is_connected());
        assert_eq!(info.network_type, Some(NetworkType::Ethernet));
        assert!(!info.is_metered);
    }
}
