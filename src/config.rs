use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Main configuration structure for the run control plane
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RunControlConfig {
    /// Admission limits and elevated identities
    pub policy: PolicyConfig,
    /// Per-run defaults and the expiry sweep
    pub runs: RunsConfig,
    /// Worker subprocess management
    pub worker: WorkerConfig,
    /// Principal to local account mapping
    pub users: UserMappingConfig,
    /// Credential validation and conveyance
    pub security: SecurityConfig,
    /// Interaction service endpoint pushed to every worker (optional)
    pub interaction: Option<InteractionConfig>,
    /// Usage record output
    pub usage: UsageConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Maximum number of runs in existence at once, per visible set
    pub max_runs: usize,
    /// Per-user cap; when absent only the global cap applies
    pub max_runs_per_user: Option<usize>,
    /// Maximum number of runs executing at once across all workers
    pub operating_limit: usize,
    /// Identities allowed to see, update and destroy every run
    pub admins: Vec<String>,
    /// Workflow references accepted for new runs; empty accepts any
    pub permitted_workflows: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_runs: 5,
            max_runs_per_user: None,
            operating_limit: 10,
            admins: Vec::new(),
            permitted_workflows: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunsConfig {
    /// Lifetime given to new runs; 0 means they never expire
    pub default_lifetime_minutes: u64,
    /// How often expired runs are swept
    pub sweep_interval_secs: u64,
    /// How long a start request waits for a worker before answering "still working"
    pub start_budget_secs: u64,
    /// Parent of each run's working directory on the worker side
    pub working_directory_root: PathBuf,
    /// Name used when a workflow reference is empty
    pub default_name: String,
    /// Run names are truncated to this many characters
    pub max_name_length: usize,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            default_lifetime_minutes: 24 * 60,
            sweep_interval_secs: 30,
            start_budget_secs: 10,
            working_directory_root: PathBuf::from("/tmp/run-control"),
            default_name: "Untitled workflow".to_string(),
            max_name_length: 48,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Long-lived process that spawns per-user workers
    pub forker_command: String,
    pub forker_args: Vec<String>,
    /// Engine executable each worker runs a workflow with
    pub engine_command: String,
    /// Environment passed to every run
    pub environment: BTreeMap<String, String>,
    /// Extra engine arguments passed to every run
    pub extra_args: Vec<String>,
    /// Prefix of the names workers register under
    pub registration_prefix: String,
    pub registry_poll_interval_ms: u64,
    pub registry_deadline_secs: u64,
    /// Creation attempts against a worker before giving up
    pub creation_attempts: u32,
    /// Attempts for each status/IO call against a connected run
    pub remote_call_attempts: u32,
    pub shutdown_grace_ms: u64,
    pub forker_exit_wait_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            forker_command: "run-control-forker".to_string(),
            forker_args: Vec::new(),
            engine_command: "executeworkflow".to_string(),
            environment: BTreeMap::new(),
            extra_args: Vec::new(),
            registration_prefix: "run-worker".to_string(),
            registry_poll_interval_ms: 1000,
            registry_deadline_secs: 40,
            creation_attempts: 3,
            remote_call_attempts: 2,
            shutdown_grace_ms: 1000,
            forker_exit_wait_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserMappingConfig {
    /// Run every worker as this account instead of one per principal
    pub default_local_user: Option<String>,
    /// Every local account name must match this pattern
    pub local_user_pattern: String,
}

impl Default for UserMappingConfig {
    fn default() -> Self {
        Self {
            default_local_user: None,
            local_user_pattern: "^[a-z_][a-z0-9_-]{0,31}$".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    pub keystore_password_length: usize,
    pub allowed_uri_schemes: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            keystore_password_length: 32,
            allowed_uri_schemes: vec!["http".to_string(), "https".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InteractionConfig {
    pub host: String,
    pub port: u16,
    pub webdav_path: String,
    pub feed_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct UsageConfig {
    /// Append usage records as JSON lines here
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON instead of human-readable lines
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
        }
    }
}

impl RunControlConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (run-control.toml, .run-control-rc)
    /// 3. Environment variables (RUN_CONTROL__SECTION__KEY)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    pub fn load_from(dir: &Path) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        let toml_file = dir.join("run-control.toml");
        if toml_file.exists() {
            builder = builder.add_source(File::from(toml_file));
        }

        let rc_file = dir.join(".run-control-rc");
        if rc_file.exists() {
            builder = builder.add_source(File::from(rc_file).format(config::FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("RUN_CONTROL")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<RunControlConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        // Load .env file first
        let _ = RunControlConfig::load_env_file();
        RunControlConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static RunControlConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (call this early in main)
pub fn init_config() -> Result<&'static RunControlConfig> {
    let config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load_without_any_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunControlConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.policy.max_runs, 5);
        assert_eq!(config.policy.max_runs_per_user, None);
        assert_eq!(config.runs.default_lifetime_minutes, 1440);
        assert_eq!(config.worker.creation_attempts, 3);
        assert!(config.interaction.is_none());
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("run-control.toml"),
            "[policy]\nmax_runs = 2\nmax_runs_per_user = 1\n\n[worker]\nregistry_deadline_secs = 5\n",
        )
        .unwrap();

        let config = RunControlConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.policy.max_runs, 2);
        assert_eq!(config.policy.max_runs_per_user, Some(1));
        assert_eq!(config.worker.registry_deadline_secs, 5);
        assert_eq!(config.policy.operating_limit, 10);
    }

    #[test]
    fn test_saved_config_round_trips_through_loader() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RunControlConfig::default();
        config.policy.admins = vec!["root-admin".to_string()];
        config.save_to_file(dir.path().join("run-control.toml")).unwrap();

        let loaded = RunControlConfig::load_from(dir.path()).unwrap();
        assert_eq!(loaded.policy.admins, vec!["root-admin".to_string()]);
    }
}
