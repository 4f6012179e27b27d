use std::path::Path;

use antcode_common::config::MasterConfig;
use antcode_common::{AntCodeError, Result};

/// Load the master configuration from `{config_dir}/master.toml`.
///
/// A missing file yields the built-in defaults so a fresh checkout starts;
/// a present but invalid file refuses to start.
pub fn load_config(config_dir: &Path) -> Result<MasterConfig> {
    let path = config_dir.join("master.toml");

    if !path.exists() {
        tracing::warn!(path = %path.display(), "No master.toml found, using defaults");
        return Ok(MasterConfig::default());
    }

    let raw = std::fs::read_to_string(&path)
        .map_err(|e| AntCodeError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

    let mut config: MasterConfig = toml::from_str(&raw)
        .map_err(|e| AntCodeError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;

    // Environment overrides for deployment-specific values.
    if let Ok(url) = std::env::var("MASTER_URL") {
        config.server.master_url = url;
    }
    if let Some(port) = std::env::var("MASTER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
    {
        config.server.port = port;
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &MasterConfig) -> Result<()> {
    if config.scheduler.max_concurrent_tasks == 0 {
        return Err(AntCodeError::Config(
            "scheduler.max_concurrent_tasks must be at least 1".into(),
        ));
    }
    match config.queue.backend.as_str() {
        "memory" | "redis" => {}
        other => {
            return Err(AntCodeError::Config(format!(
                "queue.backend must be \"memory\" or \"redis\", got \"{}\"",
                other
            )));
        }
    }
    match config.cache.backend.as_str() {
        "memory" | "redis" => {}
        other => {
            return Err(AntCodeError::Config(format!(
                "cache.backend must be \"memory\" or \"redis\", got \"{}\"",
                other
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_config(Path::new("/nonexistent")).unwrap();
        assert_eq!(config.heartbeat.base_interval_seconds, 3);
        assert_eq!(config.heartbeat.max_failures, 5);
    }

    #[test]
    fn bad_backend_is_rejected() {
        let mut config = MasterConfig::default();
        config.queue.backend = "kafka".into();
        assert!(validate(&config).is_err());
    }
}
