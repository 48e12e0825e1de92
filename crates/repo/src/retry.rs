use std::io;
use std::thread;
use std::time::Duration;

use log::warn;

use super::Repo;

/// Retry policy for [`Retrying`].
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    /// Total attempts per operation, including the first.
    pub attempts: u32,
    /// Delay before the first retry; doubles after each failure.
    pub base_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl Backoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// A [`Repo`] decorator that retries transient transport failures.
///
/// The engine treats retry policy as the driver's business; wrapping a driver
/// in [`Retrying`] is how that policy is supplied. `NotFound` and
/// `InvalidInput` are never retried; they are answers, not failures.
#[derive(Clone, Debug)]
pub struct Retrying<R> {
    inner: R,
    policy: Backoff,
}

impl<R> Retrying<R> {
    pub fn new(inner: R, policy: Backoff) -> Self {
        Self { inner, policy }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn run<T>(&self, what: &str, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(e) if retryable(&e) && attempt + 1 < self.policy.attempts => {
                    let delay = self.policy.delay(attempt);
                    warn!("{what} failed (attempt {}): {e}; retrying in {delay:?}", attempt + 1);
                    thread::sleep(delay);
                    attempt += 1;
                }
                res => return res,
            }
        }
    }
}

fn retryable(e: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(
        e.kind(),
        TimedOut | Interrupted | WouldBlock | ConnectionReset | ConnectionAborted | BrokenPipe
    )
}

impl<R: Repo> Repo for Retrying<R> {
    type List = R::List;

    fn put(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        self.run("put", || self.inner.put(key, bytes))
    }

    fn get(&self, key: &str) -> io::Result<Vec<u8>> {
        self.run("get", || self.inner.get(key))
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        self.run("delete", || self.inner.delete(key))
    }

    fn list(&self, prefix: &str) -> io::Result<Self::List> {
        // Only opening the enumeration is retried; mid-iteration errors
        // surface to the caller.
        self.run("list", || self.inner.list(prefix))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::Memory;

    /// Fails every `get` with the given kind a fixed number of times.
    #[derive(Clone)]
    struct Flaky {
        inner: Memory,
        kind: io::ErrorKind,
        remaining: Arc<AtomicU32>,
    }

    impl Repo for Flaky {
        type List = <Memory as Repo>::List;

        fn put(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
            self.inner.put(key, bytes)
        }

        fn get(&self, key: &str) -> io::Result<Vec<u8>> {
            if self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(io::Error::new(self.kind, "injected"));
            }
            self.inner.get(key)
        }

        fn delete(&self, key: &str) -> io::Result<()> {
            self.inner.delete(key)
        }

        fn list(&self, prefix: &str) -> io::Result<Self::List> {
            self.inner.list(prefix)
        }
    }

    fn flaky(kind: io::ErrorKind, failures: u32) -> Flaky {
        let inner = Memory::new();
        inner.put("objects/aa", b"v").unwrap();
        Flaky {
            inner,
            kind,
            remaining: Arc::new(AtomicU32::new(failures)),
        }
    }

    fn quick() -> Backoff {
        Backoff {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn retries_transient_errors() {
        let repo = Retrying::new(flaky(io::ErrorKind::TimedOut, 2), quick());
        assert_eq!(repo.get("objects/aa").unwrap(), b"v");
    }

    #[test]
    fn gives_up_after_attempts() {
        let repo = Retrying::new(flaky(io::ErrorKind::TimedOut, 10), quick());
        assert_eq!(repo.get("objects/aa").unwrap_err().kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn not_found_is_an_answer() {
        let repo = Retrying::new(flaky(io::ErrorKind::NotFound, 1), quick());
        assert_eq!(repo.get("objects/aa").unwrap_err().kind(), io::ErrorKind::NotFound);
    }
}
