//! Replica lag sources for the replication gate.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::Url;
use rusqlite::{Connection, OpenFlags};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::gate::{LagOracle, ReplicaLag};

/// Single-server setups: nothing to wait for.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReplicas;

impl LagOracle for NoReplicas {
    fn replica_lags(&mut self) -> Result<Vec<ReplicaLag>> {
        Ok(Vec::new())
    }
}

/// Reads the newest `heartbeat.ts` (unix seconds) from each replica file. The
/// primary writes one heartbeat row per tick, so the age of the newest row a
/// replica holds is how far it trails.
pub struct HeartbeatLagOracle {
    replicas: Vec<PathBuf>,
    clock: Box<dyn Fn() -> f64>,
}

impl HeartbeatLagOracle {
    pub fn new(replicas: Vec<PathBuf>) -> Self {
        Self::with_clock(replicas, Box::new(unix_now))
    }

    pub fn with_clock(replicas: Vec<PathBuf>, clock: Box<dyn Fn() -> f64>) -> Self {
        Self { replicas, clock }
    }

    pub fn replicas(&self) -> &[PathBuf] {
        &self.replicas
    }

    fn replica_name(path: &Path) -> String {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string())
    }

    fn newest_heartbeat(path: &Path) -> Result<Option<f64>> {
        let connection = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open replica {}", path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(1))
            .context("failed to set sqlite busy timeout")?;
        connection
            .query_row("SELECT MAX(ts) FROM heartbeat", [], |row| row.get(0))
            .with_context(|| format!("failed to read heartbeat from {}", path.display()))
    }
}

impl LagOracle for HeartbeatLagOracle {
    fn replica_lags(&mut self) -> Result<Vec<ReplicaLag>> {
        let now = (self.clock)();
        let mut lags = Vec::with_capacity(self.replicas.len());
        for path in &self.replicas {
            let seconds = match Self::newest_heartbeat(path)? {
                Some(ts) => (now - ts).max(0.0),
                None => f64::INFINITY,
            };
            lags.push(ReplicaLag {
                replica: Self::replica_name(path),
                seconds,
            });
        }
        debug!("heartbeat lag: {lags:?}");
        Ok(lags)
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Deserialize, Default)]
struct SiteInfoResponse {
    #[serde(default)]
    query: SiteInfoQuery,
}

#[derive(Debug, Deserialize, Default)]
struct SiteInfoQuery {
    #[serde(default)]
    dbrepllag: Vec<DbReplLag>,
}

#[derive(Debug, Deserialize)]
struct DbReplLag {
    host: String,
    lag: f64,
}

/// Asks a MediaWiki API for `siprop=dbrepllag` across all replica hosts.
pub struct ApiLagOracle {
    client: Client,
    api_url: Url,
    user_agent: String,
}

impl ApiLagOracle {
    pub fn new(api_url: &str, user_agent: &str, timeout: Duration) -> Result<Self> {
        let api_url =
            Url::parse(api_url).with_context(|| format!("invalid lag API URL: {api_url}"))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build lag API HTTP client")?;
        Ok(Self {
            client,
            api_url,
            user_agent: user_agent.to_string(),
        })
    }

    fn request(&self) -> Result<Value> {
        let pairs = [
            ("action", "query"),
            ("meta", "siteinfo"),
            ("siprop", "dbrepllag"),
            ("sishowalldb", "1"),
            ("format", "json"),
            ("formatversion", "2"),
        ];
        let response = self
            .client
            .get(self.api_url.clone())
            .header("User-Agent", self.user_agent.clone())
            .query(&pairs)
            .send()
            .context("failed to call lag API")?;
        let status = response.status();
        if !status.is_success() {
            bail!("lag API request failed with HTTP {status}");
        }
        response
            .json()
            .context("failed to decode lag API JSON response")
    }
}

/// Hosts that report a negative lag could not be measured and count as
/// infinitely behind.
fn parse_dbrepllag(payload: Value) -> Result<Vec<ReplicaLag>> {
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        bail!("MediaWiki API error [{code}]: {info}");
    }
    let response: SiteInfoResponse =
        serde_json::from_value(payload).context("unexpected dbrepllag payload")?;
    Ok(response
        .query
        .dbrepllag
        .into_iter()
        .map(|entry| ReplicaLag {
            replica: entry.host,
            seconds: if entry.lag < 0.0 {
                f64::INFINITY
            } else {
                entry.lag
            },
        })
        .collect())
}

impl LagOracle for ApiLagOracle {
    fn replica_lags(&mut self) -> Result<Vec<ReplicaLag>> {
        parse_dbrepllag(self.request()?)
    }
}
