use crate::context::{CancelReason, Context};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time;

/// Single-slot wakeup: raising it while nobody waits leaves (at most) one stored wakeup, raising
///  it repeatedly coalesces. That makes wakeups level-triggered - a woken consumer must re-check
///  its real predicate, it must not count wakeups.
pub struct Wakeup {
    notify: Notify,
}

impl Wakeup {
    pub fn new() -> Wakeup {
        Wakeup { notify: Notify::new() }
    }

    pub fn raise(&self) {
        self.notify.notify_one();
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// One bounded, cancellable wait step: completes when the wakeup is raised *or* `step` elapses
///  (the caller re-checks its predicate either way), and fails with the terminal reason when the
///  context resolves first.
///
/// All waits in this crate are loops around this helper, so there is no unbounded blocking call
///  anywhere - "blocking" is polling with small bounded sleeps.
pub async fn bounded_wait(ctx: &Context, wakeup: &Wakeup, step: Duration) -> Result<(), CancelReason> {
    tokio::select! {
        _ = wakeup.wait() => Ok(()),
        _ = time::sleep(step) => Ok(()),
        reason = ctx.done() => Err(reason),
    }
}
