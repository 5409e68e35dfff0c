#![forbid(unsafe_code)]

// Configuration - environment-driven settings, read once at startup

use tracing::{info, warn};

/// Deployment mode, from `DS_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployEnv {
    Dev,
    BuildFront,
    Prod,
}

impl DeployEnv {
    fn from_env() -> Self {
        match std::env::var("DS_ENV").unwrap_or_default().as_str() {
            "DEV" => Self::Dev,
            "BUILD_FRONT" => Self::BuildFront,
            _ => Self::Prod,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub env: DeployEnv,
    pub port: u16,
    /// Allowed websocket origins. In DEV mode any origin is accepted.
    pub origins: Vec<String>,
    /// Enable NVIDIA hardware H264 encoding in the pipeline.
    pub nvidia: bool,
    /// Force width/height/framerate caps on the encoder.
    pub force_encoding_size: bool,
}

impl Config {
    /// Reads configuration from environment variables.
    pub fn from_env() -> Self {
        let env = DeployEnv::from_env();

        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8000);

        let origins: Vec<String> = std::env::var("DS_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(String::from)
            .collect();

        if origins.is_empty() && env != DeployEnv::Dev {
            warn!("DS_ORIGINS not set — only originless clients will be accepted");
        }

        let nvidia = bool_env("DS_NVIDIA");
        let force_encoding_size = bool_env("DS_FORCE_ENCODING_SIZE");

        info!(
            "Config: env={:?} port={} origins={} nvidia={} force_encoding_size={}",
            env,
            port,
            origins.len(),
            nvidia,
            force_encoding_size
        );

        Self {
            env,
            port,
            origins,
            nvidia,
            force_encoding_size,
        }
    }

    /// Checks an Origin header value against the allow-list.
    /// A missing header (non-browser client) is accepted; DEV mode accepts anything.
    pub fn allows_origin(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(o) => self.env == DeployEnv::Dev || self.origins.iter().any(|a| a == o),
        }
    }
}

fn bool_env(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_origins(origins: &[&str], env: DeployEnv) -> Config {
        Config {
            env,
            port: 8000,
            origins: origins.iter().map(|s| s.to_string()).collect(),
            nvidia: false,
            force_encoding_size: false,
        }
    }

    #[test]
    fn test_origin_allow_list() {
        let config = config_with_origins(&["https://example.com"], DeployEnv::Prod);

        assert!(config.allows_origin(Some("https://example.com")));
        assert!(!config.allows_origin(Some("https://evil.example.org")));
        // Non-browser clients carry no Origin header
        assert!(config.allows_origin(None));
    }

    #[test]
    fn test_dev_mode_accepts_any_origin() {
        let config = config_with_origins(&[], DeployEnv::Dev);
        assert!(config.allows_origin(Some("http://localhost:3000")));
    }
}
