//! Service-level configuration shared across Scribe services.

/// Service-level configuration for timeouts and channels.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ServiceConfig {
    /// Chain source RPC timeout in seconds.
    pub timeout: u32,
    /// Maximum channel size used between service tasks.
    pub channel_size: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            timeout: 30,
            channel_size: 32,
        }
    }
}
