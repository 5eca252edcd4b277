use std::fmt;
use std::time::{Duration, Instant};

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::interrupt::Interrupt;

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaLag {
    pub replica: String,
    /// Seconds behind the primary. Infinite when the replica cannot report.
    pub seconds: f64,
}

impl fmt::Display for ReplicaLag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:.2}s", self.replica, self.seconds)
    }
}

/// Reports how far each tracked replica trails the primary.
pub trait LagOracle {
    fn replica_lags(&mut self) -> Result<Vec<ReplicaLag>>;
}

impl<O: LagOracle + ?Sized> LagOracle for Box<O> {
    fn replica_lags(&mut self) -> Result<Vec<ReplicaLag>> {
        (**self).replica_lags()
    }
}

#[derive(Debug, Error)]
#[error("replicas still lagging after {waited:?}: {detail}")]
pub struct ReplicationTimeout {
    pub waited: Duration,
    pub detail: String,
}

/// Synchronous backpressure: blocks the calling thread between windows until
/// every replica is below the lag threshold.
pub struct ReplicationGate<O> {
    oracle: O,
    poll_interval: Duration,
    polls: usize,
    interrupt: Interrupt,
}

impl<O: LagOracle> ReplicationGate<O> {
    pub fn new(oracle: O, poll_interval: Duration) -> Self {
        Self {
            oracle,
            poll_interval,
            polls: 0,
            interrupt: Interrupt::new(),
        }
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn polls(&self) -> usize {
        self.polls
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Returns how long the call blocked. Oracle errors count as "not caught
    /// up" and are retried on the next poll until `timeout` elapses.
    ///
    /// An interrupt ends the wait early with `Ok`; the caller must check the
    /// interrupt before issuing another read.
    pub fn wait_until_caught(
        &mut self,
        threshold: Duration,
        timeout: Duration,
    ) -> Result<Duration, ReplicationTimeout> {
        let started = Instant::now();
        let limit = threshold.as_secs_f64();
        let mut announced = false;

        loop {
            self.polls += 1;
            let detail = match self.oracle.replica_lags() {
                Ok(lags) => {
                    let lagging = lags
                        .iter()
                        .filter(|lag| lag.seconds.is_nan() || lag.seconds >= limit)
                        .map(ToString::to_string)
                        .collect::<Vec<_>>();
                    if lagging.is_empty() {
                        let waited = started.elapsed();
                        if announced {
                            info!("replicas caught up after {waited:?}");
                        }
                        return Ok(waited);
                    }
                    lagging.join(", ")
                }
                Err(error) => {
                    warn!("replica lag check failed: {error:#}");
                    format!("lag check failed: {error:#}")
                }
            };

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(ReplicationTimeout { waited, detail });
            }
            if !announced {
                info!("waiting for replicas ({detail}); threshold {threshold:?}");
                announced = true;
            } else {
                debug!("still waiting for replicas ({detail})");
            }
            if self
                .interrupt
                .sleep(self.poll_interval.min(timeout.saturating_sub(waited)))
            {
                info!("interrupt received while waiting for replicas");
                return Ok(started.elapsed());
            }
        }
    }
}
