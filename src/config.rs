//! TOML configuration file support.
//!
//! Loads from (in order):
//! 1. An explicit `--config` path
//! 2. `provchain.toml` next to the executable
//! 3. `$HOME/.config/provchain/config.toml`
//! 4. Environment variable overrides (e.g. `PROV_DB`)
//!
//! CLI arguments always take precedence over config file values.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{ProvError, Result, ResultExt as _};

// ---------------------------------------------------------------------------
// Config structs (map 1-to-1 with the TOML sections)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProvConfig {
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
    pub chain: ChainConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub db: PathBuf,
    pub audit_out_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Path to a JSON-lines structured log file.  Empty means no file logging.
    pub json_log_file: String,
    /// Emit console logs as JSON lines (still on stderr).
    pub json_console: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainMode {
    /// No ledger: scan verdicts fall back to state-hash comparison.
    #[default]
    None,
    /// In-process contract, persisted next to the database.
    Simulated,
    /// External EVM registry contract (feature `evm`).
    Evm,
}

impl FromStr for ChainMode {
    type Err = ProvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "simulated" => Ok(Self::Simulated),
            "evm" => Ok(Self::Evm),
            other => Err(ProvError::Config(format!("unknown chain mode '{other}'"))),
        }
    }
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub mode: ChainMode,
    pub rpc_url: Option<String>,
    pub contract_address: Option<String>,
    pub private_key: Option<String>,
    /// Simulated contract state file; defaults to `<db>.chain.json`.
    pub sim_state_file: Option<PathBuf>,
}

impl fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainConfig")
            .field("mode", &self.mode)
            .field("rpc_url", &self.rpc_url)
            .field("contract_address", &self.contract_address)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("sim_state_file", &self.sim_state_file)
            .finish()
    }
}

impl ChainConfig {
    pub fn private_key(&self) -> Option<SecretString> {
        self.private_key
            .as_ref()
            .map(|k| SecretString::new(k.clone().into()))
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            db: PathBuf::from("provchain.db"),
            audit_out_dir: PathBuf::from("provchain-audit"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_log_file: String::new(),
            json_console: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl ProvConfig {
    /// Returns `Ok(default)` if the file does not exist; `Err` if it exists
    /// but is malformed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .ctx_config(&format!("read config file {}", path.display()))?;
        toml::from_str(&text).ctx_config("parse config TOML")
    }

    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load_from(p);
        }

        if let Ok(exe) = std::env::current_exe() {
            let candidate = exe.with_file_name("provchain.toml");
            if candidate.exists() {
                return Self::load_from(&candidate);
            }
        }

        if let Some(home) = std::env::var_os("HOME") {
            let candidate = PathBuf::from(home)
                .join(".config")
                .join("provchain")
                .join("config.toml");
            if candidate.exists() {
                return Self::load_from(&candidate);
            }
        }

        Ok(Self::default())
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(db) = std::env::var("PROV_DB") {
            self.paths.db = PathBuf::from(db);
        }
        if let Ok(level) = std::env::var("PROV_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(mode) = std::env::var("PROV_CHAIN_MODE") {
            self.chain.mode = mode.parse()?;
        }
        if let Ok(url) = std::env::var("PROV_RPC_URL") {
            self.chain.rpc_url = Some(url);
        }
        if let Ok(addr) = std::env::var("PROV_CONTRACT_ADDRESS") {
            self.chain.contract_address = Some(addr);
        }
        if let Ok(key) = std::env::var("PROV_CHAIN_KEY") {
            self.chain.private_key = Some(key);
        }
        Ok(())
    }

    /// Startup checks.  A ledger mode without its credentials must not
    /// degrade silently to ledger-less verdicts.
    pub fn validate(&self) -> Result<()> {
        if self.chain.mode == ChainMode::Evm {
            let missing: Vec<&str> = [
                ("chain.rpc_url", &self.chain.rpc_url),
                ("chain.contract_address", &self.chain.contract_address),
                ("chain.private_key", &self.chain.private_key),
            ]
            .into_iter()
            .filter(|(_, v)| v.as_deref().map(str::trim).unwrap_or("").is_empty())
            .map(|(k, _)| k)
            .collect();
            if !missing.is_empty() {
                return Err(ProvError::Config(format!(
                    "chain.mode = evm requires {}",
                    missing.join(", ")
                )));
            }
            if !cfg!(feature = "evm") {
                return Err(ProvError::Config(
                    "chain.mode = evm but this build lacks the `evm` feature".into(),
                ));
            }
        }
        if self.paths.db.as_os_str().is_empty() {
            return Err(ProvError::Config("paths.db is empty".into()));
        }
        Ok(())
    }

    /// Where the simulated contract keeps its state.
    pub fn sim_state_file(&self) -> PathBuf {
        self.chain.sim_state_file.clone().unwrap_or_else(|| {
            let mut name = self.paths.db.as_os_str().to_owned();
            name.push(".chain.json");
            PathBuf::from(name)
        })
    }
}
