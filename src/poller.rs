// Job polling: turns a submitted job into a terminal status.
//
// The loop is an explicit state machine. Each attempt asks the server for
// the job's status; `Success` and `Failure` end the loop, `Processing` waits
// one interval and tries again, and running out of attempts yields the
// client-side `Timeout` verdict. Transient transport errors are retried a
// few times without consuming attempts; anything else stops immediately.

use crate::error::TransportError;
use crate::handle::{JobHandle, JobStatus};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
/// Consecutive transient errors tolerated before giving up.
pub const TRANSIENT_RETRY_LIMIT: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    pub transient_retries: u32,
}

impl PollPolicy {
    /// Spreads `timeout` over attempts spaced `interval` apart. The interval
    /// is at least one second and there is always at least one attempt.
    pub fn from_timeout(interval: Duration, timeout: Duration) -> Self {
        let interval = interval.max(Duration::from_secs(1));
        let attempts = (timeout.as_secs() / interval.as_secs()).max(1);
        PollPolicy {
            interval,
            max_attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            transient_retries: TRANSIENT_RETRY_LIMIT,
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy::from_timeout(DEFAULT_INTERVAL, DEFAULT_TIMEOUT)
    }
}

/// What one status query returned: the parsed status plus the full body,
/// which later stages read (failure detail, drawing URL, analysis result).
#[derive(Clone, Debug, PartialEq)]
pub struct StatusReport {
    pub status: JobStatus,
    pub body: Value,
}

impl StatusReport {
    pub fn from_body(body: Value) -> Result<Self, TransportError> {
        let raw = body
            .get("execStatus")
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::Decode("response has no execStatus".into()))?;
        let status = JobStatus::from_exec_status(raw)
            .ok_or_else(|| TransportError::Decode(format!("unknown execStatus {raw:?}")))?;
        Ok(StatusReport { status, body })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("polling was interrupted")]
    Interrupted,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Shared flag flipped by the Ctrl-C handler.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The wait between attempts.
pub trait Pause {
    fn pause(&self, interval: Duration);
}

/// Sleeps the calling thread, waking early once the token is cancelled.
pub struct ThreadPause {
    cancel: CancelToken,
}

impl ThreadPause {
    const SLICE: Duration = Duration::from_millis(100);

    pub fn new(cancel: CancelToken) -> Self {
        ThreadPause { cancel }
    }
}

impl Pause for ThreadPause {
    fn pause(&self, interval: Duration) {
        let deadline = Instant::now() + interval;
        while !self.cancel.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(Self::SLICE.min(deadline - now));
        }
    }
}

pub struct Poller {
    policy: PollPolicy,
    pause: Box<dyn Pause>,
    cancel: CancelToken,
}

impl Poller {
    pub fn new(policy: PollPolicy, pause: Box<dyn Pause>, cancel: CancelToken) -> Self {
        Poller {
            policy,
            pause,
            cancel,
        }
    }

    /// Poller that sleeps on the current thread and honours `cancel`.
    pub fn blocking(policy: PollPolicy, cancel: CancelToken) -> Self {
        let pause = Box::new(ThreadPause::new(cancel.clone()));
        Poller::new(policy, pause, cancel)
    }

    /// True once Ctrl-C has been pressed.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queries `status_fn` until the job settles or the attempt budget runs
    /// out. Never changes anything on the server.
    pub fn poll<F>(&self, handle: &JobHandle, mut status_fn: F) -> Result<StatusReport, PollError>
    where
        F: FnMut(&JobHandle) -> Result<StatusReport, TransportError>,
    {
        let mut attempts = 0;
        let mut transient_failures = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(PollError::Interrupted);
            }

            match status_fn(handle) {
                Ok(report) => {
                    attempts += 1;
                    transient_failures = 0;
                    debug!(%handle, attempt = attempts, status = %report.status, "polled job status");
                    if report.status.is_terminal() {
                        return Ok(report);
                    }
                    if attempts >= self.policy.max_attempts {
                        warn!(%handle, attempts, "giving up on job that is still processing");
                        return Ok(StatusReport {
                            status: JobStatus::Timeout,
                            body: report.body,
                        });
                    }
                }
                Err(e) if e.is_transient() && transient_failures < self.policy.transient_retries => {
                    transient_failures += 1;
                    warn!(%handle, error = %e, retry = transient_failures, "transient error while polling");
                }
                Err(e) => return Err(PollError::Transport(e)),
            }

            self.pause.pause(self.policy.interval);
        }
    }
}
