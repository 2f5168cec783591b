//! Installed Application Registry
//!
//! Lets the engine reconcile registered app roots against what the host has
//! installed and enabled.

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait AppRegistry: Send + Sync {
    /// Ids of every installed application that uses synced storage
    async fn installed_app_ids(&self) -> Result<Vec<String>>;

    async fn is_installed(&self, app_id: &str) -> Result<bool> {
        Ok(self.installed_app_ids().await?.iter().any(|id| id == app_id))
    }

    async fn is_enabled(&self, app_id: &str) -> Result<bool>;
}
