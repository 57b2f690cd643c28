use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default = "ServerConfig::default_max_upload_mb")]
    pub max_upload_mb: u64,
}

impl ServerConfig {
    fn default_max_upload_mb() -> u64 {
        25
    }

    /// Upper bound applied to the request body layer; the provider enforces
    /// its own per-document limit independently.
    pub fn max_upload_bytes(&self) -> usize {
        (self.max_upload_mb as usize).saturating_mul(1024 * 1024)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            max_upload_mb: Self::default_max_upload_mb(),
        }
    }
}
