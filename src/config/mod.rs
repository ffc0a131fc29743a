use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Base URL of the remote analysis service (e.g., "https://analysis.example.com")
    pub api_base_url: String,

    /// Bearer token attached to every request. Acquired out of band.
    #[serde(default)]
    pub api_token: Option<String>,

    /// Redis connection string for the durable job cache
    pub redis_url: String,

    /// Dealer/user scope under which jobs are created and listed
    pub owner_id: String,

    /// Bind address for the Prometheus metrics exporter
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9095".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
