use crate::concurrency::shutdown_requested;
use cloudstrap_runtime::RunError;
use serde::Deserialize;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error};

/// Outcome of a single readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult<T> {
    Ready(T),
    NotYet,
    /// Expected while the target boots; fatal once leniency runs out.
    TransientError(String),
    /// The target reported failure; never retried.
    FatalError(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("probe failed at attempt {attempts}: {cause}")]
    Fatal { attempts: u32, cause: String },
    #[error("still failing after {attempts} attempts (leniency {leniency}): {cause}")]
    LeniencyExhausted {
        attempts: u32,
        leniency: u32,
        cause: String,
    },
    #[error("not ready after {attempts} attempts in {elapsed:?}")]
    TimedOut { attempts: u32, elapsed: Duration },
    #[error("interrupted after {attempts} attempts")]
    Interrupted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Attempts (1-indexed, inclusive) during which transient errors are swallowed.
    pub leniency: u32,
    pub interval: Duration,
    pub timeout: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            leniency: 20,
            interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

/// Live state of one readiness wait; dropped when the wait ends.
#[derive(Debug, Clone, Copy)]
struct PollState {
    attempts: u32,
    lenient_until: u32,
}

impl PollState {
    fn lenient(&self) -> bool {
        self.attempts <= self.lenient_until
    }
}

/// Polls a probe until it reports ready or fails.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessPoller {
    config: PollConfig,
    interrupted: fn() -> bool,
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self::new(PollConfig::default())
    }
}

impl ReadinessPoller {
    pub fn new(config: PollConfig) -> Self {
        Self {
            config,
            interrupted: shutdown_requested,
        }
    }

    #[cfg(test)]
    #[must_use]
    fn with_interrupt(mut self, interrupted: fn() -> bool) -> Self {
        self.interrupted = interrupted;
        self
    }

    /// Run `probe` (called with the 1-indexed attempt number) until it is
    /// ready. Sleeps `interval` between attempts.
    pub fn wait<T, F>(&self, mut probe: F) -> Result<T, ReadinessError>
    where
        F: FnMut(u32) -> ProbeResult<T>,
    {
        let started = Instant::now();
        let mut state = PollState {
            attempts: 0,
            lenient_until: self.config.leniency,
        };
        loop {
            state.attempts += 1;
            match probe(state.attempts) {
                ProbeResult::Ready(value) => {
                    debug!("ready after {} attempt(s)", state.attempts);
                    return Ok(value);
                }
                ProbeResult::NotYet => debug!("attempt {}: not ready yet", state.attempts),
                ProbeResult::TransientError(cause) if state.lenient() => {
                    debug!("attempt {}: ignoring early error: {cause}", state.attempts);
                }
                ProbeResult::TransientError(cause) => {
                    error!("attempt {}: {cause}", state.attempts);
                    return Err(ReadinessError::LeniencyExhausted {
                        attempts: state.attempts,
                        leniency: state.lenient_until,
                        cause,
                    });
                }
                ProbeResult::FatalError(cause) => {
                    error!("attempt {}: {cause}", state.attempts);
                    return Err(ReadinessError::Fatal {
                        attempts: state.attempts,
                        cause,
                    });
                }
            }

            if (self.interrupted)() {
                return Err(ReadinessError::Interrupted {
                    attempts: state.attempts,
                });
            }
            if let Some(timeout) = self.config.timeout {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    return Err(ReadinessError::TimedOut {
                        attempts: state.attempts,
                        elapsed,
                    });
                }
            }
            thread::sleep(self.config.interval);
        }
    }
}

/// Command that prints cloud-init's final status inside the container.
pub const CLOUD_INIT_RESULT_COMMAND: &str = "sudo cat /run/cloud-init/result.json";

const SSH_FAILURE: i32 = 255;
const FILE_MISSING: i32 = 1;

#[derive(Debug, Deserialize)]
struct ResultDoc {
    v1: ResultV1,
}

#[derive(Debug, Deserialize)]
struct ResultV1 {
    #[serde(default)]
    datasource: Option<String>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

/// Successful cloud-init completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudInitResult {
    pub datasource: Option<String>,
}

/// Map the outcome of reading `result.json` to a probe result.
pub fn classify_cloud_init(output: Result<String, RunError>) -> ProbeResult<CloudInitResult> {
    let raw = match output {
        Ok(raw) => raw,
        Err(RunError::NoAddressYet(name)) => {
            return ProbeResult::TransientError(format!("container {name} has no address yet"));
        }
        Err(RunError::NonZeroExit {
            code: FILE_MISSING, ..
        }) => {
            debug!("waiting for cloud-init status result");
            return ProbeResult::NotYet;
        }
        Err(RunError::NonZeroExit {
            code: SSH_FAILURE,
            stderr,
        }) => {
            return ProbeResult::TransientError(format!("ssh into container failed: {stderr}"));
        }
        Err(e @ (RunError::NonZeroExit { .. } | RunError::Spawn(_))) => {
            return ProbeResult::FatalError(format!(
                "unexpected failure reading cloud-init status: {e}"
            ));
        }
    };

    if raw.trim().is_empty() {
        return ProbeResult::NotYet;
    }
    let doc: ResultDoc = match serde_json::from_str(&raw) {
        Ok(doc) => doc,
        Err(e) => return ProbeResult::TransientError(format!("partial cloud-init result: {e}")),
    };
    if doc.v1.errors.is_empty() {
        ProbeResult::Ready(CloudInitResult {
            datasource: doc.v1.datasource,
        })
    } else {
        let errors: Vec<String> = doc.v1.errors.iter().map(ToString::to_string).collect();
        ProbeResult::FatalError(format!(
            "container OS did not initialize correctly: {}",
            errors.join("; ")
        ))
    }
}
