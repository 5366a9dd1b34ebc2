//! Client and relay configuration.
//!
//! Defaults work for a relay on localhost. A TOML file named by `MESH_CONFIG`
//! overrides them, and `MESH_RELAY_URL` / `MESH_RELAY_BIND` override the file.

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::media::MediaConstraints;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WebSocket URL of the relay, for clients.
    pub relay_url: String,
    /// Listen address, for the relay server.
    pub relay_bind: String,
    /// STUN/TURN URLs handed to the media transport.
    pub ice_servers: Vec<String>,
    pub connect_timeout_ms: u64,
    pub media_timeout_ms: u64,
    /// Links not connected within this window fail.
    pub negotiation_timeout_ms: u64,
    /// Swap tracks on already connected links when the local source changes.
    pub live_source_replacement: bool,
    pub media: MediaConstraints,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080".to_string(),
            relay_bind: "0.0.0.0:8080".to_string(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            connect_timeout_ms: 10_000,
            media_timeout_ms: 30_000,
            negotiation_timeout_ms: 30_000,
            live_source_replacement: false,
            media: MediaConstraints::default(),
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_env() -> Result<Self> {
        let mut config = match env::var("MESH_CONFIG") {
            Ok(path) => Self::load(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        if let Ok(url) = env::var("MESH_RELAY_URL") {
            config.relay_url = url;
        }
        if let Ok(bind) = env::var("MESH_RELAY_BIND") {
            config.relay_bind = bind;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.relay_url.is_empty() {
            return Err(Error::Config("relay_url must not be empty".to_string()));
        }
        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("media_timeout_ms", self.media_timeout_ms),
            ("negotiation_timeout_ms", self.negotiation_timeout_ms),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn media_timeout(&self) -> Duration {
        Duration::from_millis(self.media_timeout_ms)
    }

    #[must_use]
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            relay_url = "wss://relay.example.org/socket"
            negotiation_timeout_ms = 5000

            [media]
            video = false
            "#,
        )
        .unwrap();

        assert_eq!(config.relay_url, "wss://relay.example.org/socket");
        assert_eq!(config.negotiation_timeout(), Duration::from_secs(5));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert!(!config.media.video);
        assert!(config.media.audio);
        assert!(!config.live_source_replacement);
    }

    #[test]
    fn test_default_media_matches_capture_request() {
        let media = Config::default().media;
        assert!(media.audio && media.video);
        assert_eq!((media.width.min, media.width.ideal, media.width.max), (160, 640, 1280));
        assert_eq!((media.height.min, media.height.ideal, media.height.max), (120, 360, 720));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = Config::from_toml("media_timeout_ms = 0").unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("media_timeout_ms")));
    }

    #[test]
    fn test_bad_toml_rejected() {
        assert!(matches!(Config::from_toml("relay_url = ["), Err(Error::Config(_))));
    }
}
