//! Consume a queue until it is observed empty
//!
//! Claims still held when the drain starts are returned to the queue first.
//! After attaching the handler the consumer sleeps for the poll interval, then probes
//! the queue. It returns on the first probe reporting empty. Consecutive probe failures
//! are tolerated up to a threshold; past it the consumer either waits one grace period
//! and assumes the queue drained, or fails, depending on [`ProbeExhaustion`].

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::{MessageHandler, QueueTransport};
use crate::error::{PipelineError, Result};
use crate::model::QueueName;

/// Default probe interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default number of consecutive probe failures tolerated
pub const DEFAULT_PROBE_FAILURE_TOLERANCE: u32 = 10;

/// Default wait before forced termination once the tolerance is exceeded
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// What to do once probe failures exceed the tolerance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeExhaustion {
    /// Wait one grace period, then return as if drained
    #[default]
    AssumeDrained,
    /// Stop consuming and return `TransportProbe`
    Fail,
}

impl FromStr for ProbeExhaustion {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "assume-drained" => Ok(ProbeExhaustion::AssumeDrained),
            "fail" => Ok(ProbeExhaustion::Fail),
            other => Err(PipelineError::config(format!(
                "Unknown probe exhaustion policy '{}'; expected assume-drained or fail",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainConfig {
    pub poll_interval: Duration,
    pub probe_failure_tolerance: u32,
    pub grace_period: Duration,
    pub on_exhaustion: ProbeExhaustion,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            probe_failure_tolerance: DEFAULT_PROBE_FAILURE_TOLERANCE,
            grace_period: DEFAULT_GRACE_PERIOD,
            on_exhaustion: ProbeExhaustion::AssumeDrained,
        }
    }
}

/// How a drain finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// A probe reported the queue empty
    Drained { probes: u32 },
    /// Probe failures exceeded the tolerance; completeness is unknown
    AssumedDrained { probe_failures: u32 },
}

impl DrainOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, DrainOutcome::Drained { .. })
    }
}

#[derive(Clone)]
pub struct DrainConsumer {
    transport: QueueTransport,
    config: DrainConfig,
}

impl DrainConsumer {
    pub fn new(transport: QueueTransport, config: DrainConfig) -> Self {
        Self { transport, config }
    }

    pub fn transport(&self) -> &QueueTransport {
        &self.transport
    }

    /// Run `handler` over `queue` and block until the queue is drained
    pub async fn process_messages(
        &self,
        queue: &QueueName,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<DrainOutcome> {
        // Only one drain runs per queue, so any claim present now belongs to a
        // listener that is gone and would keep the queue non-empty forever.
        let orphaned = self.transport.release_claims(queue, None).await?;
        if orphaned > 0 {
            warn!(
                queue = %queue,
                released = orphaned,
                "Returned messages claimed by an earlier listener to the queue"
            );
        }

        let consumer = self.transport.consume(queue, handler);
        let mut probes = 0u32;
        let mut consecutive_failures = 0u32;

        let outcome = loop {
            tokio::time::sleep(self.config.poll_interval).await;

            if consumer.has_stopped() {
                // Surfaces the handler failure that ended the listener
                consumer.stop().await?;
                return Err(PipelineError::transport(format!(
                    "Listener on {} stopped unexpectedly",
                    queue
                )));
            }

            probes += 1;
            match self.transport.has_messages(queue).await {
                Ok(true) => consecutive_failures = 0,
                Ok(false) => break DrainOutcome::Drained { probes },
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures <= self.config.probe_failure_tolerance {
                        warn!(
                            queue = %queue,
                            error = %e,
                            failures = consecutive_failures,
                            "Problem while checking queue for more messages, will retry"
                        );
                        continue;
                    }

                    error!(
                        queue = %queue,
                        error = %e,
                        failures = consecutive_failures,
                        "Repeated problems checking queue for messages. Verify this harvest \
                         for completeness or re-run the cycle"
                    );
                    match self.config.on_exhaustion {
                        ProbeExhaustion::Fail => {
                            consumer.stop().await?;
                            return Err(PipelineError::probe(format!(
                                "{} consecutive probe failures on {}: {}",
                                consecutive_failures, queue, e
                            )));
                        }
                        ProbeExhaustion::AssumeDrained => {
                            tokio::time::sleep(self.config.grace_period).await;
                            break DrainOutcome::AssumedDrained {
                                probe_failures: consecutive_failures,
                            };
                        }
                    }
                }
            }
        };

        consumer.stop().await?;
        info!(queue = %queue, outcome = ?outcome, "Finished processing messages");
        Ok(outcome)
    }
}
