//! Bounded, cancellable job polling.

use crate::config::PollingConfig;
use crate::remover::{BackgroundRemover, JobState, JobStatus};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Attempt budget and spacing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval: Duration::from_secs(10),
        }
    }
}

impl From<&PollingConfig> for PollPolicy {
    fn from(config: &PollingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            interval: config.interval(),
        }
    }
}

/// How a polling run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The provider handed back an output image
    Ready { output_url: String, attempts: u32 },
    /// The provider reported the job as failed
    Failed { attempts: u32 },
    /// Attempts exhausted without an output
    TimedOut { attempts: u32 },
    /// A status check could not be performed
    StatusCheckFailed { attempts: u32, cause: String },
    /// The token was cancelled
    Cancelled { attempts: u32 },
}

/// Poll `job_id` until it yields an output, fails, or the budget runs out.
///
/// `on_attempt` sees every successful status response before it is acted on.
/// Once `token` is cancelled no further calls are made and `on_attempt` is not
/// invoked again, even for a response that was already in flight.
pub async fn poll_job<F>(
    remover: &dyn BackgroundRemover,
    job_id: &str,
    policy: PollPolicy,
    token: &CancellationToken,
    mut on_attempt: F,
) -> PollOutcome
where
    F: FnMut(u32, &JobState),
{
    let mut attempts = 0;

    loop {
        if token.is_cancelled() {
            return PollOutcome::Cancelled { attempts };
        }

        attempts += 1;
        metrics::counter!("photo.poll.attempts").increment(1);

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return PollOutcome::Cancelled { attempts },
            result = remover.poll(job_id) => result,
        };

        if token.is_cancelled() {
            return PollOutcome::Cancelled { attempts };
        }

        let state = match result {
            Ok(state) => state,
            Err(e) => {
                warn!(job_id, attempts, error = %e, "Status check failed");
                return PollOutcome::StatusCheckFailed {
                    attempts,
                    cause: e.to_string(),
                };
            }
        };

        debug!(
            job_id,
            attempts,
            status = state.status.as_str(),
            has_output = state.output_url.is_some(),
            "Job status checked"
        );
        on_attempt(attempts, &state);

        // Output presence wins over whatever the status text says.
        if let Some(output_url) = state.output_url {
            info!(job_id, attempts, "Job produced output");
            return PollOutcome::Ready {
                output_url,
                attempts,
            };
        }

        if state.status == JobStatus::Failed {
            return PollOutcome::Failed { attempts };
        }

        if attempts >= policy.max_attempts {
            warn!(job_id, attempts, "Job polling timed out");
            return PollOutcome::TimedOut { attempts };
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => return PollOutcome::Cancelled { attempts },
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
}

/// Handle to a running polling task
#[derive(Debug)]
pub struct PollHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    /// A handle whose task has not been spawned yet
    pub fn pending(token: CancellationToken) -> Self {
        Self { token, task: None }
    }

    /// Spawn `fut` under this handle's token
    pub fn spawn<Fut>(&mut self, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.task = Some(tokio::spawn(fut));
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
