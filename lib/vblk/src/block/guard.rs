// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fan-in of many sub-requests into a single completion.

use std::io;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use super::{BlockError, BlockResult};

type DoneFn = Box<dyn FnOnce(BlockResult) + Send + 'static>;

struct GuardInner {
    first_err: Mutex<Option<BlockError>>,
    done: Mutex<Option<DoneFn>>,
}
impl Drop for GuardInner {
    fn drop(&mut self) {
        let res = match self.first_err.get_mut().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        if let Some(done) = self.done.get_mut().unwrap().take() {
            done(res);
        }
    }
}

/// Shared guard over a set of in-flight sub-requests.
///
/// Each sub-request holds a clone of the guard and [records](Self::record) its
/// outcome.  Once the last clone is dropped, the completion supplied at
/// construction is invoked, exactly once, with the first error recorded (if
/// any).
#[derive(Clone)]
pub struct IoGuard(Arc<GuardInner>);

impl IoGuard {
    pub fn new(done: impl FnOnce(BlockResult) + Send + 'static) -> Self {
        Self(Arc::new(GuardInner {
            first_err: Mutex::new(None),
            done: Mutex::new(Some(Box::new(done))),
        }))
    }

    /// Create a guard along with a future for its completion.
    pub fn with_completion() -> (Self, IoCompletion) {
        let (tx, rx) = oneshot::channel();
        let guard = Self::new(move |res| {
            // Receiver may have given up on the result
            let _ = tx.send(res);
        });
        (guard, IoCompletion(rx))
    }

    /// Record the outcome of one sub-request.  Only the first error is kept.
    pub fn record(&self, res: BlockResult) {
        if let Err(e) = res {
            let mut first = self.0.first_err.lock().unwrap();
            if first.is_none() {
                *first = Some(e);
            }
        }
    }

    /// Has an error been recorded by any sub-request?
    pub fn failed(&self) -> bool {
        self.0.first_err.lock().unwrap().is_some()
    }
}

/// Completion of the sub-requests covered by an [IoGuard]
pub struct IoCompletion(oneshot::Receiver<BlockResult>);
impl IoCompletion {
    pub async fn wait(self) -> BlockResult {
        self.0.await.unwrap_or_else(|_| {
            Err(BlockError::Io(io::Error::new(
                io::ErrorKind::Other,
                "I/O guard dropped without completion",
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn completes_once_after_last_clone() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = Arc::new(Mutex::new(None));

        let guard = {
            let calls = calls.clone();
            let result = result.clone();
            IoGuard::new(move |res| {
                calls.fetch_add(1, Ordering::SeqCst);
                *result.lock().unwrap() = Some(res.is_ok());
            })
        };
        let clones: Vec<_> = (0..4).map(|_| guard.clone()).collect();
        drop(guard);
        for g in clones.iter() {
            g.record(Ok(()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        drop(clones);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*result.lock().unwrap(), Some(true));
    }

    #[tokio::test]
    async fn keeps_first_error() {
        let (guard, done) = IoGuard::with_completion();
        let other = guard.clone();

        guard.record(Ok(()));
        other.record(Err(BlockError::ShortTransfer { expected: 8, done: 4 }));
        guard.record(Err(BlockError::NotSupported));
        assert!(guard.failed());
        drop(guard);
        drop(other);

        assert!(matches!(
            done.wait().await,
            Err(BlockError::ShortTransfer { expected: 8, done: 4 })
        ));
    }
}
