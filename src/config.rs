//! Server Configuration
//!
//! Settings come from three layers, later layers winning:
//!
//! 1. built-in defaults
//! 2. a redis.conf style file (`--config`)
//! 3. explicit command-line flags
//!
//! The file holds one `directive value` pair per line. `#` starts a
//! comment, blank lines are skipped and directive names are
//! case-insensitive:
//!
//! ```text
//! # tidekv.conf
//! bind 0.0.0.0
//! port 6380
//! maxclients 500
//! appendonly yes
//! appendfilename data.aof
//! requirepass s3cret
//! ```

use crate::db::{AofConfig, DbOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: unknown directive '{directive}'")]
    UnknownDirective { line: usize, directive: String },

    #[error("line {line}: '{directive}' expects exactly one value")]
    MissingValue { line: usize, directive: String },

    #[error("line {line}: invalid value '{value}' for '{directive}'")]
    InvalidValue {
        line: usize,
        directive: String,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address to listen on (default: 127.0.0.1)
    pub bind: String,
    /// Port to listen on (default: 6379)
    pub port: u16,
    /// Connected client limit, 0 for none (default: 10000)
    pub maxclients: usize,
    /// Whether the append-only log is on (default: no)
    pub appendonly: bool,
    /// Log file path (default: appendonly.aof)
    pub appendfilename: PathBuf,
    /// Password for `AUTH` (default: none)
    pub requirepass: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            maxclients: 10_000,
            appendonly: false,
            appendfilename: PathBuf::from("appendonly.aof"),
            requirepass: None,
        }
    }
}

/// Values given explicitly on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub maxclients: Option<usize>,
    pub appendonly: Option<bool>,
    pub appendfilename: Option<PathBuf>,
    pub requirepass: Option<String>,
}

impl Config {
    /// Reads `path` on top of the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parses config file text on top of the defaults.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_text(text)?;
        Ok(config)
    }

    fn apply_text(&mut self, text: &str) -> Result<(), ConfigError> {
        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = raw.trim();
            if content.is_empty() || content.starts_with('#') {
                continue;
            }

            let mut parts = content.split_whitespace();
            let directive = parts.next().unwrap_or_default().to_ascii_lowercase();
            let value = match (parts.next(), parts.next()) {
                (Some(value), None) => unquote(value),
                _ => {
                    return Err(ConfigError::MissingValue { line, directive });
                }
            };
            self.apply_directive(line, &directive, value)?;
        }
        Ok(())
    }

    fn apply_directive(&mut self, line: usize, directive: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            line,
            directive: directive.to_string(),
            value: value.to_string(),
        };

        match directive {
            "bind" => self.bind = value.to_string(),
            "port" => self.port = value.parse().map_err(|_| invalid())?,
            "maxclients" => self.maxclients = value.parse().map_err(|_| invalid())?,
            "appendonly" => self.appendonly = parse_bool(value).ok_or_else(invalid)?,
            "appendfilename" => self.appendfilename = PathBuf::from(value),
            "requirepass" => {
                self.requirepass = (!value.is_empty()).then(|| value.to_string());
            }
            _ => {
                return Err(ConfigError::UnknownDirective {
                    line,
                    directive: directive.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Applies command-line values over whatever the file set.
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(bind) = overrides.bind {
            self.bind = bind;
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(maxclients) = overrides.maxclients {
            self.maxclients = maxclients;
        }
        if let Some(appendonly) = overrides.appendonly {
            self.appendonly = appendonly;
        }
        if let Some(appendfilename) = overrides.appendfilename {
            self.appendfilename = appendfilename;
        }
        if let Some(requirepass) = overrides.requirepass {
            self.requirepass = Some(requirepass);
        }
        self
    }

    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Client limit, `None` when unlimited.
    pub fn client_limit(&self) -> Option<usize> {
        (self.maxclients > 0).then_some(self.maxclients)
    }

    /// Engine options for this configuration.
    pub fn db_options(&self) -> DbOptions {
        DbOptions {
            aof: self
                .appendonly
                .then(|| AofConfig::new(&self.appendfilename)),
            requirepass: self.requirepass.clone(),
            ..DbOptions::default()
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" => Some(true),
        "no" | "false" => Some(false),
        _ => None,
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind_address(), "127.0.0.1:6379");
        assert_eq!(config.client_limit(), Some(10_000));
        assert!(!config.appendonly);
        assert!(config.db_options().aof.is_none());
    }

    #[test]
    fn test_parse_file() {
        let text = "\
# comment
BIND 0.0.0.0

port 6380
maxclients 0
appendonly yes
appendfilename \"data.aof\"
requirepass s3cret
";
        let config = Config::parse(text).unwrap();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.port, 6380);
        assert_eq!(config.client_limit(), None);
        assert!(config.appendonly);
        assert_eq!(config.appendfilename, PathBuf::from("data.aof"));
        assert_eq!(config.requirepass.as_deref(), Some("s3cret"));

        let options = config.db_options();
        assert_eq!(options.aof.unwrap().path, PathBuf::from("data.aof"));
        assert_eq!(options.requirepass.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let err = Config::parse("port 1\nsave 900 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingValue { line: 2, .. }));

        let err = Config::parse("\ndatabases 16\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownDirective { line: 2, ref directive } if directive == "databases"
        ));

        let err = Config::parse("port nope").unwrap_err();
        assert_eq!(err.to_string(), "line 1: invalid value 'nope' for 'port'");

        assert!(Config::parse("appendonly maybe").is_err());
        assert!(Config::parse("port 70000").is_err());
    }

    #[test]
    fn test_overrides_win() {
        let config = Config::parse("port 7000\nappendonly yes\n")
            .unwrap()
            .with_overrides(Overrides {
                port: Some(7001),
                requirepass: Some("pw".to_string()),
                ..Overrides::default()
            });
        assert_eq!(config.port, 7001);
        assert!(config.appendonly);
        assert_eq!(config.requirepass.as_deref(), Some("pw"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("missing.conf")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
