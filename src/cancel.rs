use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

/// Shared flag to stop the tasks of a pull.
///
/// Tokens form a tree: a token created with [`child`](Self::child) is
/// cancelled when its parent is cancelled, but cancelling the child does
/// not affect the parent.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    parent: Option<CancelToken>,
    lock: Mutex<()>,
    notifier: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new token that is cancelled with this one.
    pub fn child(&self) -> CancelToken {
        CancelToken {
            inner: Arc::new(Inner {
                parent: Some(self.clone()),
                ..Default::default()
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Relaxed);

        // Wake up any thread in `sleep`. Poisoned locks are ignored, since
        // the guarded data is empty.
        let _guard = self.inner.lock.lock();
        self.inner.notifier.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Relaxed)
            || self.inner.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Block the thread for `duration`, or until the token is cancelled.
    ///
    /// Return `false` if the token was cancelled.
    ///
    /// A parent cancellation is checked at least every 100 ms, since it
    /// does not notify the children.
    pub fn sleep(&self, duration: Duration) -> bool {
        const PARENT_CHECK: Duration = Duration::from_millis(100);

        let deadline = Instant::now() + duration;

        let Ok(mut guard) = self.inner.lock.lock() else {
            return !self.is_cancelled();
        };

        loop {
            if self.is_cancelled() {
                return false;
            }

            let now = Instant::now();
            if now >= deadline {
                return true;
            }

            let timeout = (deadline - now).min(PARENT_CHECK);
            guard = match self.inner.notifier.wait_timeout(guard, timeout) {
                Ok((g, _)) => g,
                Err(_) => return !self.is_cancelled(),
            };
        }
    }

    /// Cancel the token when the returned value is dropped (for example,
    /// after an early return or a `panic!`).
    pub fn drop_guard(&self) -> DropGuard<'_> {
        DropGuard(self)
    }
}

/// Cancel a [`CancelToken`] on drop.
pub struct DropGuard<'a>(&'a CancelToken);

impl Drop for DropGuard<'_> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

#[test]
fn child_follows_parent() {
    let parent = CancelToken::new();
    let child = parent.child();

    child.cancel();
    assert!(child.is_cancelled());
    assert!(!parent.is_cancelled());

    let child = parent.child();
    parent.cancel();
    assert!(child.is_cancelled());
}

#[test]
fn sleep_is_interrupted() {
    let token = CancelToken::new();

    let start = Instant::now();
    std::thread::scope(|scope| {
        scope.spawn(|| {
            std::thread::sleep(Duration::from_millis(50));
            token.cancel();
        });

        assert!(!token.sleep(Duration::from_secs(30)));
    });

    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(token.child().is_cancelled());

    let guarded = CancelToken::new();
    drop(guarded.drop_guard());
    assert!(guarded.is_cancelled());
}
