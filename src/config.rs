use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub port: Option<u16>,
    pub portal_url: Option<String>,
    pub headless: Option<bool>,
    pub chrome_path: Option<String>,
    /// When set, attach to an already-running browser over CDP instead of
    /// launching our own process.
    pub remote_debugging_port: Option<u16>,
    pub screenshots: Option<bool>,
    pub screenshot_dir: Option<String>,
    pub idle_timeout_secs: Option<u64>,
    pub liveness_interval_secs: Option<u64>,
    pub harvest_timeout_secs: Option<u64>,
    /// Extra domains to drop from harvested addresses, merged with the
    /// built-in placeholder list.
    #[serde(default)]
    pub excluded_domains: Vec<String>,
    /// Extra local parts to drop, merged with the built-in noreply list.
    #[serde(default)]
    pub excluded_local_parts: Vec<String>,
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8700)
    }

    pub fn portal_url(&self) -> &str {
        self.portal_url
            .as_deref()
            .unwrap_or("https://outlook.office.com/mail/")
    }

    pub fn headless(&self) -> bool {
        self.headless.unwrap_or(true)
    }

    pub fn screenshots(&self) -> bool {
        self.screenshots.unwrap_or(false)
    }

    pub fn screenshot_dir(&self) -> &str {
        self.screenshot_dir.as_deref().unwrap_or("screenshots")
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(600))
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs.unwrap_or(30))
    }

    pub fn harvest_timeout(&self) -> Duration {
        Duration::from_secs(self.harvest_timeout_secs.unwrap_or(900))
    }
}

fn config_path() -> Result<PathBuf> {
    let config_dir =
        dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
    Ok(config_dir.join("owa-harvest").join("config.json"))
}

pub fn load_config() -> Result<Config> {
    let path = config_path()?;
    if path.exists() {
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(Config::default())
    }
}

pub fn save_config(config: &Config) -> Result<()> {
    let path = config_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.port(), 8700);
        assert!(cfg.headless());
        assert!(!cfg.screenshots());
        assert_eq!(cfg.idle_timeout(), Duration::from_secs(600));
        assert_eq!(cfg.harvest_timeout(), Duration::from_secs(900));
        assert!(cfg.portal_url().starts_with("https://outlook."));
    }

    #[test]
    fn json_round_trip() {
        let cfg = Config {
            port: Some(9000),
            headless: Some(false),
            excluded_domains: vec!["corp.example".into()],
            ..Config::default()
        };
        let json = serde_json::to_string(&cfg).expect("serialize");
        let back: Config = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.port(), 9000);
        assert!(!back.headless());
        assert_eq!(back.excluded_domains, vec!["corp.example".to_string()]);
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        let back: Config = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(back.port(), 8700);
        assert!(back.excluded_domains.is_empty());
    }
}
