//! Periodic keepalive timer.
//!
//! One task per ready peer. The task fires `tick` every interval until the
//! handle is cancelled or dropped, or `tick` returns `false` (its peer is
//! gone). There is no liveness timeout: pings only keep NAT mappings and
//! idle connections warm.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Cancellation handle for a keepalive task.
#[derive(Debug)]
pub(crate) struct KeepaliveHandle {
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl KeepaliveHandle {
    /// Stop the timer. No tick runs after this returns.
    pub(crate) fn cancel(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.task.abort();
    }

    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for KeepaliveHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start a timer that calls `tick` every `interval`.
///
/// The first tick fires one full interval after the call. Intervals below
/// one millisecond are raised to one millisecond.
pub(crate) fn spawn<F>(interval: Duration, mut tick: F) -> KeepaliveHandle
where
    F: FnMut() -> bool + Send + 'static,
{
    let interval = interval.max(MIN_INTERVAL);
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut cancel_rx => break,
                _ = ticker.tick() => {
                    if !tick() {
                        break;
                    }
                }
            }
        }
    });

    KeepaliveHandle {
        cancel: Some(cancel_tx),
        task,
    }
}
