//! Timer service for expiring timed waits.

use std::time::Duration;
use tokio::{
    runtime::{Handle, TryCurrentError},
    time::sleep,
};


/// Callback run when a timer elapses
pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// One-shot timer service
///
/// An implementation must run each scheduled callback exactly once, no earlier than `delay` after
/// it was scheduled, and never from within `schedule_once` itself. Scheduled callbacks cannot be
/// cancelled; a callback that fires after it stopped mattering is expected to be a cheap no-op.
pub trait Timer: Send + Sync + 'static {
    /// Schedule `callback` to run once `delay` has elapsed
    fn schedule_once(&self, delay: Duration, callback: TimerCallback);
}

/// Timer backed by tasks on a tokio runtime
#[derive(Debug, Clone)]
pub struct TokioTimer(Handle);

impl TokioTimer {
    /// Construct with tasks spawned onto the given runtime
    pub fn new(handle: Handle) -> Self {
        TokioTimer(handle)
    }

    /// Construct with tasks spawned onto the runtime of the current context
    pub fn try_current() -> Result<Self, TryCurrentError> {
        Handle::try_current().map(TokioTimer)
    }
}

impl Timer for TokioTimer {
    fn schedule_once(&self, delay: Duration, callback: TimerCallback) {
        self.0.spawn(async move {
            sleep(delay).await;
            callback();
        });
    }
}




#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{sync::oneshot, time::Instant};

    #[tokio::test(start_paused = true)]
    async fn tokio_timer_delay_test() {
        let timer = TokioTimer::try_current().unwrap();
        let (send, recv) = oneshot::channel();
        let start = Instant::now();
        timer.schedule_once(Duration::from_millis(5), Box::new(move || {
            let _ = send.send(Instant::now());
        }));
        let fired_at = recv.await.unwrap();
        assert!(fired_at - start >= Duration::from_millis(5));
    }

    #[test]
    fn no_runtime_test() {
        assert!(TokioTimer::try_current().is_err());
    }
}
