use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;

/// Why a context reached its terminal state. A child that unwinds because its parent did inherits
///  the parent's reason.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CancelReason {
    /// explicit cancellation, or parent cancelled
    Canceled,
    /// the context's own timeout elapsed
    Expired,
}

/// Hierarchical cancellation signal.
///
/// A context is Active until it is resolved exactly once, by whichever of {parent done, own
///  cancel, own timeout} fires first; resolution is terminal and propagates to all descendants.
///  Background loops race their work against `done()`, and every bounded wait in the crate
///  carries a context so that a closing session unwinds all of its loops and blocked callers.
///
/// Handles are cheap clones sharing one node; `cancel` is synchronous and idempotent.
#[derive(Clone)]
pub struct Context {
    state: Arc<watch::Sender<Option<CancelReason>>>,
}

impl Context {
    /// Root context: never completes on its own, but can still be cancelled explicitly.
    pub fn background() -> Context {
        let (tx, _) = watch::channel(None);
        Context { state: Arc::new(tx) }
    }

    /// Child that resolves when the parent resolves (inheriting its reason) or when its own
    ///  `cancel` is invoked.
    pub fn child(&self) -> Context {
        self.derive(None)
    }

    /// Like `child`, and additionally resolves with `Expired` after `timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Context {
        self.derive(Some(timeout))
    }

    fn derive(&self, timeout: Option<Duration>) -> Context {
        let child = Context::background();

        let parent = self.clone();
        let watcher = child.clone();
        tokio::spawn(async move {
            let timer = async {
                match timeout {
                    Some(d) => time::sleep(d).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = watcher.done() => {
                    // resolved on its own, nothing left to watch
                }
                reason = parent.done() => {
                    watcher.resolve(reason);
                }
                _ = timer => {
                    watcher.resolve(CancelReason::Expired);
                }
            }
        });

        child
    }

    /// Idempotent: only the first resolution wins.
    pub fn cancel(&self) {
        self.resolve(CancelReason::Canceled);
    }

    fn resolve(&self, reason: CancelReason) {
        self.state.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason);
                true
            }
            else {
                false
            }
        });
    }

    pub fn is_done(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub fn error(&self) -> Option<CancelReason> {
        *self.state.borrow()
    }

    /// Completes when the context resolves, yielding the terminal reason.
    pub async fn done(&self) -> CancelReason {
        let mut rx = self.state.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // all handles dropped without resolution - nobody can observe this
                return CancelReason::Canceled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::runtime::Builder;

    fn paused_rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap()
    }

    #[rstest]
    fn test_cancel_is_terminal_and_idempotent() {
        paused_rt().block_on(async {
            let ctx = Context::background();
            assert!(!ctx.is_done());
            assert_eq!(ctx.error(), None);

            ctx.cancel();
            ctx.cancel();
            assert!(ctx.is_done());
            assert_eq!(ctx.error(), Some(CancelReason::Canceled));
            assert_eq!(ctx.done().await, CancelReason::Canceled);
        });
    }

    #[rstest]
    fn test_parent_cancel_propagates() {
        paused_rt().block_on(async {
            let root = Context::background();
            let child = root.child();
            let grandchild = child.child();

            root.cancel();
            assert_eq!(grandchild.done().await, CancelReason::Canceled);
            assert_eq!(child.error(), Some(CancelReason::Canceled));
        });
    }

    #[rstest]
    fn test_child_cancel_leaves_parent_active() {
        paused_rt().block_on(async {
            let root = Context::background();
            let child = root.child();

            child.cancel();
            assert_eq!(child.done().await, CancelReason::Canceled);
            assert!(!root.is_done());
        });
    }

    #[rstest]
    fn test_timeout_expires() {
        paused_rt().block_on(async {
            let root = Context::background();
            let child = root.child_with_timeout(Duration::from_millis(50));

            assert_eq!(child.done().await, CancelReason::Expired);
            assert!(!root.is_done());
        });
    }

    #[rstest]
    fn test_cancel_beats_timeout() {
        paused_rt().block_on(async {
            let root = Context::background();
            let child = root.child_with_timeout(Duration::from_secs(3600));

            child.cancel();
            assert_eq!(child.done().await, CancelReason::Canceled);
        });
    }

    #[rstest]
    fn test_child_inherits_expired_reason() {
        paused_rt().block_on(async {
            let parent = Context::background().child_with_timeout(Duration::from_millis(10));
            let child = parent.child();

            assert_eq!(child.done().await, CancelReason::Expired);
        });
    }
}
