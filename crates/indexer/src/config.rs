//! `novoindex.conf` parsing and runtime settings.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use novoindex_consensus::{coin_params, hash256_from_hex, CoinParams, Hash256, Network};
use novoindex_log::{Format, Level, LogConfig};

pub const DEFAULT_CACHE_MB: usize = 1200;
pub const DEFAULT_PREFETCH_CACHE_MB: usize = 10;
pub const DEFAULT_POLLING_DELAY_MS: u64 = 5000;
pub const DEFAULT_CACHE_CHECK_SECS: u64 = 30;

const MIB: usize = 1024 * 1024;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, message: String },
    UnknownKey(String),
    InvalidValue { key: &'static str, value: String },
    MissingGenesis(Network),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, message } => {
                write!(f, "failed to read {}: {message}", path.display())
            }
            ConfigError::UnknownKey(key) => write!(f, "unknown config key '{key}'"),
            ConfigError::InvalidValue { key, value } => write!(f, "invalid {key} '{value}'"),
            ConfigError::MissingGenesis(network) => {
                write!(f, "genesishash is required on {}", network.as_str())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone, Debug, PartialEq)]
pub struct IndexConfig {
    pub network: Network,
    pub genesis_hash: Option<Hash256>,
    pub cache_mb: usize,
    pub reorg_limit: Option<i32>,
    pub prefetch_cache_mb: usize,
    pub polling_delay_ms: u64,
    pub cache_check_secs: u64,
    pub log_level: Level,
    pub log_format: Format,
    pub log_timestamps: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        let log = LogConfig::default();
        Self {
            network: Network::Mainnet,
            genesis_hash: None,
            cache_mb: DEFAULT_CACHE_MB,
            reorg_limit: None,
            prefetch_cache_mb: DEFAULT_PREFETCH_CACHE_MB,
            polling_delay_ms: DEFAULT_POLLING_DELAY_MS,
            cache_check_secs: DEFAULT_CACHE_CHECK_SECS,
            log_level: log.level,
            log_format: log.format,
            log_timestamps: log.timestamps,
        }
    }
}

impl IndexConfig {
    /// Load `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match load_conf(path)? {
            Some(conf) => Self::from_conf(&conf),
            None => Ok(Self::default()),
        }
    }

    pub fn from_conf(conf: &HashMap<String, Vec<String>>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (key, values) in conf {
            let Some(value) = values.last() else {
                continue;
            };
            match key.as_str() {
                "network" => {
                    config.network = Network::parse(value).ok_or_else(|| invalid("network", value))?
                }
                "genesishash" => {
                    config.genesis_hash =
                        Some(hash256_from_hex(value).map_err(|_| invalid("genesishash", value))?)
                }
                "cache_mb" => config.cache_mb = parse_positive("cache_mb", value)?,
                "reorg_limit" => {
                    let limit: i32 = value.parse().map_err(|_| invalid("reorg_limit", value))?;
                    if limit < 1 {
                        return Err(invalid("reorg_limit", value));
                    }
                    config.reorg_limit = Some(limit);
                }
                "prefetch_cache_mb" => {
                    config.prefetch_cache_mb = parse_positive("prefetch_cache_mb", value)?
                }
                "polling_delay_ms" => {
                    config.polling_delay_ms =
                        value.parse().map_err(|_| invalid("polling_delay_ms", value))?
                }
                "cache_check_secs" => {
                    config.cache_check_secs =
                        value.parse().map_err(|_| invalid("cache_check_secs", value))?
                }
                "loglevel" => {
                    config.log_level = Level::parse(value).ok_or_else(|| invalid("loglevel", value))?
                }
                "logformat" => {
                    config.log_format =
                        Format::parse(value).ok_or_else(|| invalid("logformat", value))?
                }
                "logtimestamps" => {
                    config.log_timestamps =
                        parse_conf_bool(value).ok_or_else(|| invalid("logtimestamps", value))?
                }
                _ => return Err(ConfigError::UnknownKey(key.clone())),
            }
        }
        Ok(config)
    }

    /// Coin parameters with the configured overrides applied.
    pub fn coin_params(&self) -> Result<CoinParams, ConfigError> {
        let mut params = coin_params(self.network);
        match self.genesis_hash {
            Some(hash) => params.genesis_hash = hash,
            None if self.network == Network::Regtest => {
                return Err(ConfigError::MissingGenesis(self.network))
            }
            None => {}
        }
        if let Some(limit) = self.reorg_limit {
            params.reorg_limit = limit;
        }
        Ok(params)
    }

    pub fn cache_bytes(&self) -> usize {
        self.cache_mb.saturating_mul(1_000_000)
    }

    pub fn prefetch_cache_bytes(&self) -> usize {
        self.prefetch_cache_mb.saturating_mul(MIB)
    }

    pub fn polling_delay(&self) -> Duration {
        Duration::from_millis(self.polling_delay_ms)
    }

    pub fn cache_check_interval(&self) -> Duration {
        Duration::from_secs(self.cache_check_secs)
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            format: self.log_format,
            timestamps: self.log_timestamps,
        }
    }
}

/// Read a `key=value` file. `#` and `;` start comments, a bare key means
/// `1`, and keys are case-insensitive. Returns `None` if the file is absent.
pub fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            })
        }
    };
    Ok(Some(parse_conf(&contents)))
}

pub fn parse_conf(contents: &str) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(['#', ';']) {
            line = &line[..idx];
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    out
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_positive(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    match value.parse::<usize>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &'static str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comments_and_bare_keys() {
        let conf = parse_conf(
            "# leading comment\n\
             cache_mb = 800 ; trailing\n\
             LogTimestamps\n\
             cache_mb=900\n\
             \n",
        );
        assert_eq!(conf["cache_mb"], vec!["800".to_string(), "900".to_string()]);
        assert_eq!(conf["logtimestamps"], vec!["1".to_string()]);
    }

    #[test]
    fn last_value_wins_and_defaults_fill_the_rest() {
        let conf = parse_conf("cache_mb=800\ncache_mb=900\nloglevel=debug\n");
        let config = IndexConfig::from_conf(&conf).expect("config");
        assert_eq!(config.cache_mb, 900);
        assert_eq!(config.cache_bytes(), 900_000_000);
        assert_eq!(config.log_level, Level::Debug);
        assert_eq!(config.prefetch_cache_bytes(), 10 * MIB);
        assert_eq!(config.polling_delay(), Duration::from_secs(5));
        assert_eq!(config.cache_check_interval(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        let unknown = IndexConfig::from_conf(&parse_conf("rpcport=1\n"));
        assert!(matches!(unknown, Err(ConfigError::UnknownKey(key)) if key == "rpcport"));

        let bad = IndexConfig::from_conf(&parse_conf("cache_mb=0\n"));
        assert!(matches!(
            bad,
            Err(ConfigError::InvalidValue { key: "cache_mb", .. })
        ));

        let bad = IndexConfig::from_conf(&parse_conf("network=moon\n"));
        assert!(matches!(
            bad,
            Err(ConfigError::InvalidValue { key: "network", .. })
        ));
    }

    #[test]
    fn regtest_needs_a_genesis_hash() {
        let config = IndexConfig::from_conf(&parse_conf("network=regtest\nreorg_limit=5\n"))
            .expect("config");
        assert!(matches!(
            config.coin_params(),
            Err(ConfigError::MissingGenesis(Network::Regtest))
        ));

        let hex = "00".repeat(31) + "01";
        let config = IndexConfig::from_conf(&parse_conf(&format!(
            "network=regtest\nreorg_limit=5\ngenesishash={hex}\n"
        )))
        .expect("config");
        let params = config.coin_params().expect("params");
        assert_eq!(params.reorg_limit, 5);
        assert_eq!(params.genesis_hash, hash256_from_hex(&hex).expect("hex"));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = IndexConfig::load(&dir.path().join("novoindex.conf")).expect("load");
        assert_eq!(config, IndexConfig::default());
    }
}
