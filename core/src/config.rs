//! Process configuration (spec §6.5).
//!
//! Mirrors the teacher's `runtime/config.rs` shape: a `Serialize +
//! Deserialize` struct with `#[serde(default = "fn")]` per optional field,
//! a matching `impl Default`, and `pub const` clamp bounds consumed through
//! `.clamp(...)`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_server_port() -> u16 {
    8787
}

fn default_quiet() -> bool {
    false
}

fn default_enable_auth() -> bool {
    true
}

fn default_token_expiration_hours() -> i64 {
    24
}

fn default_chunk_size() -> u64 {
    Config::DEFAULT_CHUNK_SIZE
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_quiet")]
    pub quiet_output: bool,
    #[serde(default = "default_enable_auth")]
    pub enable_auth: bool,
    #[serde(default = "default_token_expiration_hours")]
    pub token_expiration_hours: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub jwt_secret: Option<String>,
    #[serde(default)]
    pub enable_pipe_processing: bool,
    #[serde(default)]
    pub enable_chunked_all: bool,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: default_server_port(),
            quiet_output: default_quiet(),
            enable_auth: default_enable_auth(),
            token_expiration_hours: default_token_expiration_hours(),
            jwt_secret: None,
            enable_pipe_processing: false,
            enable_chunked_all: false,
            chunk_size: default_chunk_size(),
            download_dir: default_download_dir(),
        }
    }
}

impl Config {
    pub const MIN_CHUNK_SIZE: u64 = 1024 * 1024;
    pub const MAX_CHUNK_SIZE: u64 = 10 * 1024 * 1024;
    pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

    /// Clamp an arbitrary requested chunk size into `[MIN_CHUNK_SIZE,
    /// MAX_CHUNK_SIZE]`; a request of `0` maps to the default, per spec §8's
    /// boundary table ("request 0 -> 5 MiB").
    pub fn clamp_chunk_size(requested: u64) -> u64 {
        if requested == 0 {
            return Self::DEFAULT_CHUNK_SIZE;
        }
        requested.clamp(Self::MIN_CHUNK_SIZE, Self::MAX_CHUNK_SIZE)
    }

    /// Load from `path`, falling back to defaults if absent, then layer the
    /// recognized environment variables (§6.5) on top — env wins over file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            toml::from_str(&text)?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.chunk_size = Self::clamp_chunk_size(cfg.chunk_size);
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CONNECT_SERVER_PORT") {
            if let Ok(p) = v.parse() {
                self.server_port = p;
            }
        }
        if let Ok(v) = std::env::var("CONNECT_QUIET") {
            self.quiet_output = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("CONNECT_ENABLE_AUTH") {
            self.enable_auth = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("CONNECT_TOKEN_EXPIRATION_HOURS") {
            if let Ok(h) = v.parse() {
                self.token_expiration_hours = h;
            }
        }
        if let Ok(v) = std::env::var("CONNECT_JWT_SECRET") {
            self.jwt_secret = Some(v);
        }
        if let Ok(v) = std::env::var("CONNECT_ENABLE_PIPE_PROCESSING") {
            self.enable_pipe_processing = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("CONNECT_ENABLE_CHUNKED_ALL") {
            self.enable_chunked_all = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_clamps_zero_to_default() {
        assert_eq!(Config::clamp_chunk_size(0), Config::DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn chunk_size_clamps_below_minimum() {
        assert_eq!(
            Config::clamp_chunk_size(500 * 1024),
            Config::MIN_CHUNK_SIZE
        );
    }

    #[test]
    fn chunk_size_clamps_above_maximum() {
        assert_eq!(
            Config::clamp_chunk_size(100 * 1024 * 1024),
            Config::MAX_CHUNK_SIZE
        );
    }

    #[test]
    fn chunk_size_passes_through_in_range() {
        let v = 3 * 1024 * 1024;
        assert_eq!(Config::clamp_chunk_size(v), v);
    }

    #[test]
    fn default_config_has_sane_bounds() {
        let cfg = Config::default();
        assert!(cfg.enable_auth);
        assert_eq!(cfg.chunk_size, Config::DEFAULT_CHUNK_SIZE);
    }
}
