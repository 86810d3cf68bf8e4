//! Configuration file support
//!
//! The config file is a flat list of `key = value` lines. String values may
//! be quoted, booleans are `true`/`false`, and `#` starts a comment.
//!
//! ```text
//! port = 8585
//! data-path = "/var/lib/skein"
//! pid-path = "/var/run/skeind.pid"
//! nosync = false
//! max-dbs = 4096
//! max-readers = 126
//! ```

use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {0}: {1}")]
    Io(PathBuf, String),

    #[error("line {0}: expected key = value")]
    MalformedLine(usize),

    #[error("line {0}: invalid value for {1}: {2}")]
    InvalidValue(usize, String, String),

    #[error("line {0}: unknown key: {1}")]
    UnknownKey(usize, String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// HTTP listen port.
    pub port: u16,
    /// Root directory for shards and factors.
    pub data_path: PathBuf,
    /// PID file location.
    pub pid_path: PathBuf,
    /// Disable fsync on commit (faster, crash-unsafe).
    pub nosync: bool,
    /// Max sub-databases per environment.
    pub max_dbs: u32,
    /// Max concurrent read transactions per environment.
    pub max_readers: u32,
    /// Shard count for a fresh store; 0 means reuse what is on disk or
    /// default to the machine's parallelism.
    pub shard_count: usize,
    /// Log filter (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 8585,
            data_path: PathBuf::from("/var/lib/skein"),
            pid_path: PathBuf::from("/var/run/skeind.pid"),
            nosync: false,
            max_dbs: 4096,
            max_readers: 126,
            shard_count: 0,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e.to_string()))?;
        Config::decode(&content)
    }

    pub fn decode(content: &str) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        for (index, raw_line) in content.lines().enumerate() {
            let line_no = index + 1;
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or(ConfigError::MalformedLine(line_no))?;
            let key = key.trim();
            let value = unquote(value.trim());

            match key {
                "port" => config.port = parse(line_no, key, value)?,
                "data-path" => config.data_path = PathBuf::from(value),
                "pid-path" => config.pid_path = PathBuf::from(value),
                "nosync" => config.nosync = parse_bool(line_no, key, value)?,
                "max-dbs" => config.max_dbs = parse(line_no, key, value)?,
                "max-readers" => config.max_readers = parse(line_no, key, value)?,
                "shard-count" => config.shard_count = parse(line_no, key, value)?,
                "log-level" => config.log_level = value.to_string(),
                other => return Err(ConfigError::UnknownKey(line_no, other.to_string())),
            }
        }
        Ok(config)
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        for quote in [b'"', b'\''] {
            if bytes[0] == quote && bytes[bytes.len() - 1] == quote {
                return &value[1..value.len() - 1];
            }
        }
    }
    value
}

fn parse<T: std::str::FromStr>(line: usize, key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidValue(line, key.to_string(), value.to_string()))
}

fn parse_bool(line: usize, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ConfigError::InvalidValue(
            line,
            key.to_string(),
            other.to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode() {
        let config = Config::decode(
            r#"
port=9000
data-path="/home/data"
pid-path = "/home/pid"
nosync = true
max-dbs = 5
max-readers = 250
"#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.data_path, PathBuf::from("/home/data"));
        assert_eq!(config.pid_path, PathBuf::from("/home/pid"));
        assert!(config.nosync);
        assert_eq!(config.max_dbs, 5);
        assert_eq!(config.max_readers, 250);
    }

    #[test]
    fn test_defaults() {
        let config = Config::decode("").unwrap();
        assert_eq!(config.port, 8585);
        assert!(!config.nosync);
        assert_eq!(config.max_dbs, 4096);
        assert_eq!(config.max_readers, 126);
        assert_eq!(config.shard_count, 0);
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let config = Config::decode("# a comment\n\nport = 7000 # trailing\n").unwrap();
        assert_eq!(config.port, 7000);
    }

    #[test]
    fn test_single_quotes() {
        let config = Config::decode("data-path = '/srv/skein'\n").unwrap();
        assert_eq!(config.data_path, PathBuf::from("/srv/skein"));
    }

    #[test]
    fn test_bad_boolean() {
        assert!(matches!(
            Config::decode("nosync = yes\n"),
            Err(ConfigError::InvalidValue(1, _, _))
        ));
    }

    #[test]
    fn test_malformed_line() {
        assert!(matches!(
            Config::decode("port 9000\n"),
            Err(ConfigError::MalformedLine(1))
        ));
    }

    #[test]
    fn test_unknown_key() {
        assert!(matches!(
            Config::decode("warp-speed = 9\n"),
            Err(ConfigError::UnknownKey(1, _))
        ));
    }
}
