use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{ensure, Context, Result};
use sendrecv_lib::{
    negotiation::{EarlyCandidatePolicy, PeerConnectionFactory, DEFAULT_STUN_SERVER},
    transport::WebSocketConfig,
};
use serde::Deserialize;
use tokio::fs::read_to_string;
use tracing::debug;

use crate::cli::Args;

pub const DEFAULT_SERVER: &str = "wss://webrtc.nirbheek.in:8443";
pub const DEFAULT_CONFIG_PATH: &str = "sendrecv.toml";

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: String,
    pub stun_servers: Vec<String>,
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
    pub close_timeout_secs: u64,
    pub early_candidates: EarlyCandidatePolicy,
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_owned(),
            stun_servers: vec![DEFAULT_STUN_SERVER.to_owned()],
            ping_interval_secs: 10,
            ping_timeout_secs: 5,
            close_timeout_secs: 2,
            early_candidates: EarlyCandidatePolicy::default(),
            log_dir: None,
        }
    }
}

impl Config {
    /// Reads `path`, or `sendrecv.toml` in the working directory when no path
    /// is given. Only an explicitly given file has to exist.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path, true),
            None => (Path::new(DEFAULT_CONFIG_PATH), false),
        };
        let text = match read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound && !explicit => {
                debug!("no {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        Self::parse(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate().context("invalid timing")?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("ping_interval_secs", self.ping_interval_secs),
            ("ping_timeout_secs", self.ping_timeout_secs),
            ("close_timeout_secs", self.close_timeout_secs),
        ] {
            ensure!(value > 0, "{} must be at least 1", key);
        }
        Ok(())
    }

    pub fn apply_args(&mut self, args: &Args) {
        if let Some(server) = &args.server {
            self.server = server.clone();
        }
        if let Some(log_dir) = &args.log_dir {
            self.log_dir = Some(log_dir.clone());
        }
    }

    pub fn websocket(&self) -> WebSocketConfig {
        WebSocketConfig {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            ping_timeout: Duration::from_secs(self.ping_timeout_secs),
        }
    }

    pub fn peer_connection_factory(&self) -> PeerConnectionFactory {
        PeerConnectionFactory::new(self.stun_servers.clone())
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn file_overrides_only_what_it_names() {
        let config = Config::parse(
            r#"
            server = "ws://localhost:8443"
            ping_interval_secs = 30
            early_candidates = "forward"
            "#,
        )
        .unwrap();
        assert_eq!(config.server, "ws://localhost:8443");
        assert_eq!(config.websocket().ping_interval, Duration::from_secs(30));
        assert_eq!(config.websocket().ping_timeout, Duration::from_secs(5));
        assert_eq!(config.early_candidates, EarlyCandidatePolicy::Forward);
        assert_eq!(config.close_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        assert!(Config::parse("sever = \"typo\"").is_err());
        assert!(Config::parse("early_candidates = \"drop\"").is_err());
    }

    #[test]
    fn zero_durations_are_rejected() {
        for key in ["ping_interval_secs", "ping_timeout_secs", "close_timeout_secs"] {
            let err = Config::parse(&format!("{} = 0", key)).unwrap_err();
            assert!(format!("{:#}", err).contains(key), "{:#}", err);
        }
        assert!(Config::parse("ping_interval_secs = 1").is_ok());
    }

    #[test]
    fn args_win_over_the_file() {
        let mut config = Config::parse("server = \"ws://file:1\"").unwrap();
        let args = Args::parse_from(["sendrecv", "bob", "--server", "ws://cli:2"]);
        config.apply_args(&args);
        assert_eq!(config.server, "ws://cli:2");

        let args = Args::parse_from(["sendrecv", "bob", "--log-dir", "logs"]);
        config.apply_args(&args);
        assert_eq!(config.server, "ws://cli:2");
        assert_eq!(config.log_dir, Some(PathBuf::from("logs")));
    }

    #[tokio::test]
    async fn explicit_config_file_must_exist() {
        let missing = Path::new("definitely/not/here/sendrecv.toml");
        assert!(Config::load(Some(missing)).await.is_err());
    }
}
