//! Configuration for earlysign.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (EARLYSIGN_HOME, EARLYSIGN_STORE_TIMEOUT_MS)
//! 2. Config file (.earlysign/config.yaml)
//! 3. Defaults (~/.earlysign, JSONL backend, 5s store timeout)
//!
//! Config file discovery:
//! - Searches current directory and parents for .earlysign/config.yaml
//! - `paths.home` is relative to the .earlysign/ directory

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::component::SignalPolicy;
use crate::core::{JsonlStore, Ledger, LedgerStore, MemoryStore, PayloadRegistry, TimeoutStore};
use crate::reference::two_proportions;
use crate::runtime::{Orchestrator, RetryPolicy};

const HOME_ENV: &str = "EARLYSIGN_HOME";
const TIMEOUT_ENV: &str = "EARLYSIGN_STORE_TIMEOUT_MS";
const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub store: Option<StoreConfig>,
    #[serde(default)]
    pub runtime: Option<RuntimeConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Ledger state directory (relative to .earlysign/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub backend: Option<StoreBackend>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    pub record_continue: Option<bool>,
    pub retry: Option<RetryPolicy>,
}

/// Which store backs the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local, lost on exit
    Memory,
    /// `$EARLYSIGN_HOME/ledger.jsonl`
    #[default]
    Jsonl,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to earlysign home
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub backend: StoreBackend,
    pub store_timeout: Duration,
    pub signal_policy: SignalPolicy,
    pub retry: RetryPolicy,
}

impl ResolvedConfig {
    /// Path of the JSONL ledger ($EARLYSIGN_HOME/ledger.jsonl)
    pub fn ledger_path(&self) -> PathBuf {
        self.home.join("ledger.jsonl")
    }

    /// A registry with the runtime's and the reference scheme's payloads.
    pub fn registry(&self) -> Result<PayloadRegistry> {
        let registry = PayloadRegistry::with_builtins().context("Failed to register runtime payloads")?;
        two_proportions::register_payloads(&registry)
            .context("Failed to register two-proportion payloads")?;
        Ok(registry)
    }

    /// Open the configured store, bounded by the configured timeout.
    pub async fn open_ledger(&self) -> Result<Ledger> {
        let store: Arc<dyn LedgerStore> = match self.backend {
            StoreBackend::Memory => Arc::new(TimeoutStore::new(MemoryStore::new(), self.store_timeout)),
            StoreBackend::Jsonl => {
                let path = self.ledger_path();
                let jsonl = JsonlStore::open(&path)
                    .await
                    .with_context(|| format!("Failed to open ledger: {}", path.display()))?;
                Arc::new(TimeoutStore::new(jsonl, self.store_timeout))
            }
        };
        Ok(Ledger::new(store, Arc::new(self.registry()?)))
    }

    pub fn orchestrator(&self, ledger: Ledger) -> Orchestrator {
        Orchestrator::new(ledger)
            .with_signal_policy(self.signal_policy)
            .with_retry_policy(self.retry.clone())
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".earlysign").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Environment overrides, captured once so resolution stays pure
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<String>,
    timeout_ms: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            home: std::env::var(HOME_ENV).ok(),
            timeout_ms: std::env::var(TIMEOUT_ENV).ok(),
        }
    }
}

fn resolve(
    file: Option<(PathBuf, ConfigFile)>,
    env: EnvOverrides,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let (config_file, config) = match file {
        Some((path, config)) => (Some(path), Some(config)),
        None => (None, None),
    };

    let home = if let Some(env_home) = env.home {
        PathBuf::from(env_home)
    } else if let (Some(path), Some(home_path)) = (
        config_file.as_ref(),
        config.as_ref().and_then(|c| c.paths.home.as_ref()),
    ) {
        let earlysign_dir = path.parent().unwrap_or(Path::new("."));
        resolve_path(earlysign_dir, home_path)
    } else {
        default_home
    };

    let store = config.as_ref().and_then(|c| c.store.as_ref());
    let timeout_ms = match env.timeout_ms {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("{} must be a number of milliseconds, got '{}'", TIMEOUT_ENV, raw))?,
        None => store.and_then(|s| s.timeout_ms).unwrap_or(DEFAULT_TIMEOUT_MS),
    };

    let runtime = config.as_ref().and_then(|c| c.runtime.as_ref());

    Ok(ResolvedConfig {
        home,
        config_file,
        backend: store.and_then(|s| s.backend).unwrap_or_default(),
        store_timeout: Duration::from_millis(timeout_ms),
        signal_policy: SignalPolicy {
            record_continue: runtime.and_then(|r| r.record_continue).unwrap_or(false),
        },
        retry: runtime.and_then(|r| r.retry.clone()).unwrap_or_default(),
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    // Default home directory
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".earlysign");

    let file = match find_config_file() {
        Some(path) => {
            let config = load_config_file(&path)?;
            Some((path, config))
        }
        None => None,
    };

    resolve(file, EnvOverrides::from_env(), default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(temp: &TempDir, body: &str) -> PathBuf {
        let dir = temp.path().join(".earlysign");
        std::fs::create_dir_all(&dir).unwrap();
        let config_path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", body).unwrap();
        config_path
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(None, EnvOverrides::default(), PathBuf::from("/home/u/.earlysign")).unwrap();

        assert_eq!(config.home, PathBuf::from("/home/u/.earlysign"));
        assert_eq!(config.ledger_path(), PathBuf::from("/home/u/.earlysign/ledger.jsonl"));
        assert_eq!(config.backend, StoreBackend::Jsonl);
        assert_eq!(config.store_timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
        assert!(!config.signal_policy.record_continue);
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            &temp,
            r#"
version: "1.0"
paths:
  home: ./state
store:
  backend: memory
  timeout_ms: 250
runtime:
  record_continue: true
  retry:
    max_attempts: 5
"#,
        );

        let file = load_config_file(&config_path).unwrap();
        assert_eq!(file.version, "1.0");

        let config = resolve(
            Some((config_path.clone(), file)),
            EnvOverrides::default(),
            PathBuf::from("/unused"),
        )
        .unwrap();
        assert_eq!(config.home, config_path.parent().unwrap().join("state"));
        assert_eq!(config.backend, StoreBackend::Memory);
        assert_eq!(config.store_timeout, Duration::from_millis(250));
        assert!(config.signal_policy.record_continue);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(&temp, "version: \"1.0\"\nstore:\n  timeout_ms: 250\n");
        let file = load_config_file(&config_path).unwrap();

        let env = EnvOverrides {
            home: Some("/srv/ledger".to_string()),
            timeout_ms: Some("900".to_string()),
        };
        let config = resolve(Some((config_path, file)), env, PathBuf::from("/unused")).unwrap();
        assert_eq!(config.home, PathBuf::from("/srv/ledger"));
        assert_eq!(config.store_timeout, Duration::from_millis(900));
    }

    #[test]
    fn test_bad_timeout_env_is_rejected() {
        let env = EnvOverrides {
            home: None,
            timeout_ms: Some("soon".to_string()),
        };
        let err = resolve(None, env, PathBuf::from("/h")).unwrap_err();
        assert!(err.to_string().contains(TIMEOUT_ENV));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }

    #[tokio::test]
    async fn test_memory_ledger_opens_with_all_payloads() {
        let config = resolve(None, EnvOverrides::default(), PathBuf::from("/h"))
            .map(|mut c| {
                c.backend = StoreBackend::Memory;
                c
            })
            .unwrap();
        let ledger = config.open_ledger().await.unwrap();

        let registered = ledger.registry().payload_types();
        for name in ["Lifecycle", "ErrorRecord", "TwoPropObsBatch", "WaldZ", "GSTBoundary", "Signal"] {
            assert!(registered.iter().any(|r| r == name), "missing {}", name);
        }
    }
}
