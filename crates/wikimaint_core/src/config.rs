use std::env;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::row::Key;

pub const DEFAULT_CONFIG_FILENAME: &str = ".wikimaint.toml";
pub const DEFAULT_USER_AGENT: &str = "wikimaint/0.2";
pub const DEFAULT_BATCH_SIZE: i64 = 100;
pub const DEFAULT_MAX_LAG_SECS: f64 = 5.0;
pub const DEFAULT_LAG_TIMEOUT_SECS: f64 = 300.0;
pub const DEFAULT_LAG_POLL_MS: u64 = 1_000;
pub const DEFAULT_FETCH_ATTEMPTS: usize = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 10_000;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct MaintConfig {
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub replication: ReplicationSection,
    #[serde(default)]
    pub fetch: FetchSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct RunSection {
    pub batch_size: Option<i64>,
    pub sleep_secs: Option<f64>,
    pub fail_fast: Option<bool>,
    pub checkpoint: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct ReplicationSection {
    pub max_lag_secs: Option<f64>,
    pub timeout_secs: Option<f64>,
    pub poll_ms: Option<u64>,
    #[serde(default)]
    pub heartbeat_replicas: Vec<PathBuf>,
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct FetchSection {
    pub attempts: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
}

/// Load and parse a MaintConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MaintConfig> {
    if !config_path.exists() {
        return Ok(MaintConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MaintConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    File,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::File => "file",
            Self::Default => "default",
        }
    }
}

/// Values supplied on the command line. `None`/`false`/empty means "not given".
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub batch_size: Option<i64>,
    pub start: Option<Key>,
    pub dry_run: bool,
    pub sleep_secs: Option<f64>,
    pub fail_fast: bool,
    pub max_lag_secs: Option<f64>,
    pub lag_timeout_secs: Option<f64>,
    pub checkpoint: Option<PathBuf>,
    pub heartbeat_replicas: Vec<PathBuf>,
    pub lag_api_url: Option<String>,
}

/// Immutable settings handed to every component at construction.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub batch_size: i64,
    pub start: Option<Key>,
    pub dry_run: bool,
    pub sleep: Duration,
    pub fail_fast: bool,
    pub max_lag: Duration,
    pub lag_timeout: Duration,
    pub lag_poll_interval: Duration,
    pub retry: RetryPolicy,
    pub checkpoint: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            start: None,
            dry_run: false,
            sleep: Duration::ZERO,
            fail_fast: false,
            max_lag: Duration::from_secs_f64(DEFAULT_MAX_LAG_SECS),
            lag_timeout: Duration::from_secs_f64(DEFAULT_LAG_TIMEOUT_SECS),
            lag_poll_interval: Duration::from_millis(DEFAULT_LAG_POLL_MS),
            retry: RetryPolicy::new(
                DEFAULT_FETCH_ATTEMPTS,
                Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
                Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            ),
            checkpoint: None,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size <= 0 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LagSettings {
    pub heartbeat_replicas: Vec<PathBuf>,
    pub api_url: Option<String>,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub run: RunConfig,
    pub lag: LagSettings,
    pub sources: Vec<(&'static str, ValueSource)>,
}

impl ResolvedConfig {
    pub fn diagnostics(&self) -> String {
        let run = &self.run;
        let mut lines = vec![
            format!("batch_size={}", run.batch_size),
            format!(
                "start={}",
                run.start
                    .map(|key| key.to_string())
                    .unwrap_or_else(|| "<min key>".to_string())
            ),
            format!("dry_run={}", run.dry_run),
            format!("sleep={:?}", run.sleep),
            format!("fail_fast={}", run.fail_fast),
            format!("max_lag={:?}", run.max_lag),
            format!("lag_timeout={:?}", run.lag_timeout),
            format!("lag_poll_interval={:?}", run.lag_poll_interval),
            format!("fetch_attempts={}", run.retry.max_attempts),
            format!(
                "checkpoint={}",
                run.checkpoint
                    .as_deref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "<none>".to_string())
            ),
            format!("heartbeat_replicas={}", self.lag.heartbeat_replicas.len()),
            format!(
                "lag_api_url={}",
                self.lag.api_url.as_deref().unwrap_or("<none>")
            ),
        ];
        for (name, source) in &self.sources {
            lines.push(format!("source.{name}={}", source.as_str()));
        }
        lines.join("\n")
    }
}

/// Environment lookup used during resolution; tests pass a closure.
pub fn process_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

struct Resolver<'a> {
    env: &'a dyn Fn(&str) -> Option<String>,
    sources: Vec<(&'static str, ValueSource)>,
}

impl Resolver<'_> {
    /// flag > env > file
    fn pick_optional<T>(
        &mut self,
        name: &'static str,
        flag: Option<T>,
        env_key: &str,
        file: Option<T>,
    ) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(value) = flag {
            self.sources.push((name, ValueSource::Flag));
            return Ok(Some(value));
        }
        if let Some(raw) = (self.env)(env_key) {
            let value = raw
                .parse::<T>()
                .map_err(|error| ConfigError::invalid(env_key, &raw, error))?;
            self.sources.push((name, ValueSource::Env));
            return Ok(Some(value));
        }
        if let Some(value) = file {
            self.sources.push((name, ValueSource::File));
            return Ok(Some(value));
        }
        self.sources.push((name, ValueSource::Default));
        Ok(None)
    }

    fn pick<T>(
        &mut self,
        name: &'static str,
        flag: Option<T>,
        env_key: &str,
        file: Option<T>,
        default: T,
    ) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self
            .pick_optional(name, flag, env_key, file)?
            .unwrap_or(default))
    }

    fn pick_flag(
        &mut self,
        name: &'static str,
        flag: bool,
        env_key: &str,
        file: Option<bool>,
    ) -> Result<bool, ConfigError> {
        if flag {
            self.sources.push((name, ValueSource::Flag));
            return Ok(true);
        }
        if let Some(raw) = (self.env)(env_key) {
            let value = parse_bool(&raw)
                .ok_or_else(|| ConfigError::invalid(env_key, &raw, "expected true or false"))?;
            self.sources.push((name, ValueSource::Env));
            return Ok(value);
        }
        if let Some(value) = file {
            self.sources.push((name, ValueSource::File));
            return Ok(value);
        }
        self.sources.push((name, ValueSource::Default));
        Ok(false)
    }
}

pub fn resolve_config(
    file: &MaintConfig,
    overrides: &RunOverrides,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig, ConfigError> {
    let mut resolver = Resolver {
        env,
        sources: Vec::new(),
    };

    let batch_size = resolver.pick(
        "batch_size",
        overrides.batch_size,
        "WIKIMAINT_BATCH_SIZE",
        file.run.batch_size,
        DEFAULT_BATCH_SIZE,
    )?;
    let sleep_secs = resolver.pick(
        "sleep",
        overrides.sleep_secs,
        "WIKIMAINT_SLEEP",
        file.run.sleep_secs,
        0.0,
    )?;
    let dry_run = resolver.pick_flag("dry_run", overrides.dry_run, "WIKIMAINT_DRY_RUN", None)?;
    let fail_fast = resolver.pick_flag(
        "fail_fast",
        overrides.fail_fast,
        "WIKIMAINT_FAIL_FAST",
        file.run.fail_fast,
    )?;
    let max_lag_secs = resolver.pick(
        "max_lag",
        overrides.max_lag_secs,
        "WIKIMAINT_MAX_LAG",
        file.replication.max_lag_secs,
        DEFAULT_MAX_LAG_SECS,
    )?;
    let lag_timeout_secs = resolver.pick(
        "lag_timeout",
        overrides.lag_timeout_secs,
        "WIKIMAINT_LAG_TIMEOUT",
        file.replication.timeout_secs,
        DEFAULT_LAG_TIMEOUT_SECS,
    )?;
    let poll_ms = resolver.pick(
        "lag_poll_ms",
        None,
        "WIKIMAINT_LAG_POLL_MS",
        file.replication.poll_ms,
        DEFAULT_LAG_POLL_MS,
    )?;
    let attempts = resolver.pick(
        "fetch_attempts",
        None,
        "WIKIMAINT_FETCH_ATTEMPTS",
        file.fetch.attempts,
        DEFAULT_FETCH_ATTEMPTS,
    )?;
    let retry_delay_ms = resolver.pick(
        "retry_delay_ms",
        None,
        "WIKIMAINT_RETRY_DELAY_MS",
        file.fetch.retry_delay_ms,
        DEFAULT_RETRY_DELAY_MS,
    )?;
    let retry_max_delay_ms = resolver.pick(
        "retry_max_delay_ms",
        None,
        "WIKIMAINT_RETRY_MAX_DELAY_MS",
        file.fetch.retry_max_delay_ms,
        DEFAULT_RETRY_MAX_DELAY_MS,
    )?;
    let checkpoint = resolver.pick_optional(
        "checkpoint",
        overrides.checkpoint.clone(),
        "WIKIMAINT_CHECKPOINT",
        file.run.checkpoint.clone(),
    )?;
    let api_url = resolver.pick_optional(
        "lag_api_url",
        overrides.lag_api_url.clone(),
        "WIKIMAINT_LAG_API_URL",
        file.replication.api_url.clone(),
    )?;

    let heartbeat_replicas = if !overrides.heartbeat_replicas.is_empty() {
        resolver.sources.push(("heartbeat_replicas", ValueSource::Flag));
        overrides.heartbeat_replicas.clone()
    } else if let Some(raw) = (resolver.env)("WIKIMAINT_REPLICAS") {
        resolver.sources.push(("heartbeat_replicas", ValueSource::Env));
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(PathBuf::from)
            .collect()
    } else if !file.replication.heartbeat_replicas.is_empty() {
        resolver.sources.push(("heartbeat_replicas", ValueSource::File));
        file.replication.heartbeat_replicas.clone()
    } else {
        resolver.sources.push(("heartbeat_replicas", ValueSource::Default));
        Vec::new()
    };

    if !heartbeat_replicas.is_empty() && api_url.is_some() {
        return Err(ConfigError::invalid(
            "lag_api_url",
            api_url.as_deref().unwrap_or_default(),
            "choose either heartbeat replicas or an API lag endpoint, not both",
        ));
    }

    let user_agent = (resolver.env)("WIKIMAINT_USER_AGENT")
        .or_else(|| file.replication.user_agent.clone())
        .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

    if attempts == 0 {
        return Err(ConfigError::invalid(
            "fetch_attempts",
            attempts,
            "must be at least 1",
        ));
    }

    let run = RunConfig {
        batch_size,
        start: overrides.start,
        dry_run,
        sleep: seconds("sleep", sleep_secs)?,
        fail_fast,
        max_lag: seconds("max_lag", max_lag_secs)?,
        lag_timeout: seconds("lag_timeout", lag_timeout_secs)?,
        lag_poll_interval: Duration::from_millis(poll_ms),
        retry: RetryPolicy::new(
            attempts,
            Duration::from_millis(retry_delay_ms),
            Duration::from_millis(retry_max_delay_ms),
        ),
        checkpoint,
    };
    run.validate()?;

    Ok(ResolvedConfig {
        run,
        lag: LagSettings {
            heartbeat_replicas,
            api_url,
            user_agent,
        },
        sources: resolver.sources,
    })
}

fn seconds(name: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| ConfigError::invalid(name, value, "expected a non-negative number of seconds"))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
