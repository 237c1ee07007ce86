//! Bounded retry for driver requests that may be interrupted.

use std::io;
use std::thread;
use std::time::Duration;

/// How often and how patiently a transient failure is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. `0` behaves like `1`.
    pub max_attempts: u32,
    /// Sleep between attempts.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Build a policy.
    #[must_use]
    pub const fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Single attempt, no retry.
    #[must_use]
    pub const fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_millis(10))
    }
}

/// Whether an error is worth another attempt (`EINTR` / `EAGAIN`).
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

/// Whether the call was cut short by a signal (`EINTR`).
pub fn is_interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}

/// Run `op` until it succeeds, fails permanently or runs out of attempts.
///
/// The last error is returned when all attempts fail.
pub fn retry<T, F>(policy: RetryPolicy, op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    retry_when(policy, is_transient, op)
}

/// Like [`retry`], but only errors accepted by `retryable` are repeated.
pub fn retry_when<T, F, P>(policy: RetryPolicy, retryable: P, mut op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
    P: Fn(&io::Error) -> bool,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if retryable(&err) && attempt < attempts => {
                log::trace!("transient failure (attempt {attempt}/{attempts}): {err}");
                attempt += 1;
                if !policy.backoff.is_zero() {
                    thread::sleep(policy.backoff);
                }
            }
            Err(err) => return Err(err),
        }
    }
}
