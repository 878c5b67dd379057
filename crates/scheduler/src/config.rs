use anyhow::{Context, Result};
use std::env;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval_seconds: u64,
    pub backend_url: String,
    pub api_key: Option<String>,
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            interval_seconds: env::var("TRIGGER_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .context("TRIGGER_INTERVAL_SECONDS must be a whole number of seconds")?,
            backend_url: env::var("BACKEND_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: env::var("BACKEND_API_KEY").ok().filter(|k| !k.is_empty()),
        };

        if config.interval_seconds == 0 {
            anyhow::bail!("TRIGGER_INTERVAL_SECONDS must be greater than zero");
        }
        Ok(config)
    }

    pub fn analysis_url(&self) -> String {
        format!("{}/api/analysis", self.backend_url)
    }
}
