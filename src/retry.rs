//! Bounded retries with fixed backoff for transient dependency failures.

use log::warn;
use std::fmt::Display;
use std::thread;
use std::time::Duration;

/// How many times to re-attempt an operation and how long to pause between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Re-attempts allowed after the first failure.
    pub max_retries: u32,
    /// Fixed pause between attempts.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Policy for store reads and writes.
    pub const STORE: RetryPolicy = RetryPolicy {
        max_retries: 2,
        backoff: Duration::from_secs(2),
    };

    /// Policy for reaching the container runtime at startup.
    pub const RUNTIME_INIT: RetryPolicy = RetryPolicy {
        max_retries: 4,
        backoff: Duration::from_secs(10),
    };

    /// Run `op`, retrying while `is_transient` holds and the retry budget lasts.
    ///
    /// Non-transient errors propagate on the first failure: a bad key or a malformed
    /// response will not be fixed by waiting.
    pub fn retry<T, E: Display>(
        &self,
        is_transient: impl Fn(&E) -> bool,
        mut op: impl FnMut() -> Result<T, E>,
    ) -> Result<T, E> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries && is_transient(&err) => {
                    attempt += 1;
                    warn!(
                        "{} (retrying in {}s, attempt {}/{})",
                        err,
                        self.backoff.as_secs(),
                        attempt,
                        self.max_retries
                    );
                    thread::sleep(self.backoff);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let calls = Cell::new(0);
        let result: Result<i32, String> = fast().retry(
            |_| true,
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err("connection reset".to_string())
                } else {
                    Ok(42)
                }
            },
        );
        assert_eq!(result, Ok(42));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn the_retry_budget_is_bounded() {
        let calls = Cell::new(0);
        let result: Result<(), String> = fast().retry(
            |_| true,
            || {
                calls.set(calls.get() + 1);
                Err("timed out".to_string())
            },
        );
        assert!(result.is_err());
        // the initial attempt plus two retries
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn logical_errors_propagate_immediately() {
        let calls = Cell::new(0);
        let result: Result<(), String> = fast().retry(
            |_| false,
            || {
                calls.set(calls.get() + 1);
                Err("no such key".to_string())
            },
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
