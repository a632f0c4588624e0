// exposed API of condition variables

use self::future::*;
use super::core::{Handler, Registry, Waiter};
use crate::{
    session::{ClientId, DisconnectSlot},
    timer::Timer,
};
use std::{
    fmt::{self, Debug, Formatter},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use tokio::sync::oneshot;

pub use super::core::{WaiterId, WaiterState};


// ==== helper functions for adapting core API to exposed API ====


// condition variable shared state.
struct Shared {
    // waiter registry and queue. no callback ever runs while this is locked, so a poisoned lock
    // still guards a consistent registry.
    registry: Mutex<Registry>,
    // service for expiring timed waits.
    timer: Arc<dyn Timer>,
    // run once the last handle is dropped.
    on_release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(on_release) = self.on_release.take() {
            on_release();
        }
    }
}

fn lock(shared: &Shared) -> MutexGuard<'_, Registry> {
    shared.registry.lock().unwrap_or_else(PoisonError::into_inner)
}

// if the waiter is still pending, dequeue it and neutralize its disconnect action.
fn take(shared: &Shared, id: WaiterId) -> Option<Waiter> {
    let mut registry = lock(shared);
    let waiter = registry.remove(id)?;
    waiter.disarm();
    Some(waiter)
}

// action armed into a waiter's disconnect slot. the waiter's handler is dropped without running.
fn on_disconnect(shared: &Weak<Shared>, id: WaiterId) {
    let Some(shared) = shared.upgrade() else { return };
    match take(&shared, id) {
        Some(waiter) => trace!(owner = %waiter.owner, ?id, "waiter cancelled by disconnect"),
        None => trace!(?id, "disconnect for already resolved waiter, ignoring"),
    }
}

// callback scheduled for a timed wait. resolves the waiter to false if a notify did not get to it
// first.
fn on_timeout(shared: &Weak<Shared>, id: WaiterId) {
    let Some(shared) = shared.upgrade() else { return };
    match take(&shared, id) {
        Some(waiter) => {
            trace!(owner = %waiter.owner, ?id, "timed wait expired");
            waiter.handler.resolve(false);
        }
        None => trace!(?id, "timer elapsed for already resolved waiter, ignoring"),
    }
}


// ==== the exposed API ====


/// Condition variable whose waiters are remote clients
///
/// Every wait resolves at most once, through whichever of these happens first:
///
/// - A [`notify_one`](Self::notify_one) or [`notify_all`](Self::notify_all) reaches it.
/// - Its timeout expires, for timed waits.
/// - The waiting client's connection ends, firing the [`DisconnectSlot`] it was enrolled with.
///
/// Cloning produces another handle to the same condition variable.
#[derive(Clone)]
pub struct ConditionVariable(Arc<Shared>);

impl ConditionVariable {
    /// Construct with no waiters, expiring timed waits with the given timer
    pub fn new(timer: Arc<dyn Timer>) -> Self {
        ConditionVariable(Arc::new(Shared {
            registry: Mutex::new(Registry::new()),
            timer,
            on_release: None,
        }))
    }

    // construct with a callback run once the last handle is dropped. handles are held by the
    // futures of pending waits, but not by waiters enrolled with callbacks.
    pub(crate) fn with_on_release<F>(timer: Arc<dyn Timer>, on_release: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        ConditionVariable(Arc::new(Shared {
            registry: Mutex::new(Registry::new()),
            timer,
            on_release: Some(Box::new(on_release)),
        }))
    }

    // handle which does not keep the condition variable alive.
    pub(crate) fn downgrade(&self) -> WeakConditionVariable {
        WeakConditionVariable(Arc::downgrade(&self.0))
    }

    // enroll a waiter at the back of the queue and arm its disconnect slot.
    fn enroll(&self, owner: ClientId, slot: &DisconnectSlot, handler: Handler) -> WaiterId {
        let kind = handler.kind();
        let mut registry = lock(&self.0);
        let id = registry.push(Waiter { handler, owner, slot: slot.clone(), armed: None });
        let shared = Arc::downgrade(&self.0);
        let cancel = match slot.arm(Box::new(move || on_disconnect(&shared, id))) {
            Ok(token) => {
                if let Some(waiter) = registry.get_mut(id) {
                    waiter.armed = Some(token);
                }
                None
            }
            Err(cancel) => Some(cancel),
        };
        let queued = registry.len();
        drop(registry);

        trace!(%owner, ?id, ?kind, queued, "waiter enrolled");
        if let Some(cancel) = cancel {
            // the connection already ended
            cancel();
        }
        id
    }

    /// Enroll a waiter whose callback runs once it is notified
    ///
    /// The wait never times out. If the slot fires first, the waiter is cancelled and `handler` is
    /// dropped without running.
    pub fn wait_with<F>(&self, owner: ClientId, slot: &DisconnectSlot, handler: F) -> WaiterId
    where
        F: FnOnce() + Send + 'static,
    {
        self.enroll(owner, slot, Handler::Hold(Box::new(handler)))
    }

    /// Enroll a waiter whose callback runs once it is notified or `timeout` expires
    ///
    /// `handler` is called with `true` if a notify reached the waiter first, or `false` if the
    /// timeout expired first. A zero timeout still enrolls the waiter, which then expires on the
    /// next timer tick unless notified before that. If the slot fires first, the waiter is
    /// cancelled and `handler` is dropped without running.
    pub fn wait_for_with<F>(
        &self,
        timeout: Duration,
        owner: ClientId,
        slot: &DisconnectSlot,
        handler: F,
    ) -> WaiterId
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let id = self.enroll(owner, slot, Handler::Knock(Box::new(handler)));
        let shared = Arc::downgrade(&self.0);
        self.0.timer.schedule_once(timeout, Box::new(move || on_timeout(&shared, id)));
        id
    }

    /// Wait until notified
    ///
    /// See [`WaitFut`].
    pub fn wait(&self, owner: ClientId, slot: &DisconnectSlot) -> WaitFut {
        let (send, recv) = oneshot::channel();
        let id = self.wait_with(owner, slot, move || {
            let _ = send.send(());
        });
        WaitFut(Waiting::new(self.clone(), id, recv))
    }

    /// Wait until notified or `timeout` expires
    ///
    /// See [`WaitForFut`].
    pub fn wait_for(&self, timeout: Duration, owner: ClientId, slot: &DisconnectSlot) -> WaitForFut {
        let (send, recv) = oneshot::channel();
        let id = self.wait_for_with(timeout, owner, slot, move |notified| {
            let _ = send.send(notified);
        });
        WaitForFut(Waiting::new(self.clone(), id, recv))
    }

    /// Resolve the longest-waiting waiter, if there is one
    ///
    /// Returns whether a waiter was resolved. A timed waiter resolved this way reports `true`.
    pub fn notify_one(&self) -> bool {
        let mut registry = lock(&self.0);
        let Some((id, waiter)) = registry.pop_front() else {
            return false;
        };
        waiter.disarm();
        drop(registry);

        trace!(owner = %waiter.owner, ?id, "notifying waiter");
        waiter.handler.resolve(true);
        true
    }

    /// Resolve every waiter currently queued, in the order they were enrolled
    ///
    /// Every queued waiter is dequeued before any of their callbacks run, so waiters which those
    /// callbacks enroll stay queued. Returns the number of waiters resolved.
    pub fn notify_all(&self) -> usize {
        let mut registry = lock(&self.0);
        let waiters = registry.drain();
        for (_, waiter) in &waiters {
            waiter.disarm();
        }
        drop(registry);

        let count = waiters.len();
        if count > 0 {
            trace!(count, "notifying all waiters");
        }
        for (_, waiter) in waiters {
            waiter.handler.resolve(true);
        }
        count
    }

    /// Cancel a waiter without running its callback
    ///
    /// Returns `false` and does nothing if the waiter was already resolved or cancelled.
    pub fn cancel(&self, id: WaiterId) -> bool {
        match take(&self.0, id) {
            Some(waiter) => {
                trace!(owner = %waiter.owner, ?id, "waiter cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether a waiter is still pending
    pub fn state(&self, id: WaiterId) -> WaiterState {
        lock(&self.0).state(id)
    }

    /// Number of pending waiters
    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    /// Whether there are no pending waiters
    pub fn is_empty(&self) -> bool {
        lock(&self.0).is_empty()
    }
}

impl Debug for ConditionVariable {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("waiters", &self.len())
            .finish()
    }
}

// weak handle to a condition variable.
#[derive(Clone, Default)]
pub(crate) struct WeakConditionVariable(Weak<Shared>);

impl WeakConditionVariable {
    pub(crate) fn upgrade(&self) -> Option<ConditionVariable> {
        self.0.upgrade().map(ConditionVariable)
    }

    // whether every strong handle has been dropped.
    pub(crate) fn is_released(&self) -> bool {
        self.0.strong_count() == 0
    }
}


/// Future types
pub mod future {
    use super::*;
    use crate::error::WaitAbortedError;
    use std::{
        future::Future,
        pin::Pin,
        task::{ready, Context, Poll},
    };


    // state common to both wait futures.
    pub(super) struct Waiting<T> {
        cv: ConditionVariable,
        id: WaiterId,
        // None once resolved or aborted.
        recv: Option<oneshot::Receiver<T>>,
    }

    impl<T> Waiting<T> {
        pub(super) fn new(cv: ConditionVariable, id: WaiterId, recv: oneshot::Receiver<T>) -> Self {
            Waiting { cv, id, recv: Some(recv) }
        }

        fn poll(&mut self, cx: &mut Context) -> Poll<Result<T, WaitAbortedError>> {
            // for implementation of FusedFuture
            let Some(recv) = self.recv.as_mut() else {
                return Poll::Pending;
            };
            // the handler owns the sender, so it being dropped without sending means the waiter
            // was cancelled
            let result = ready!(Pin::new(recv).poll(cx)).map_err(|_| WaitAbortedError);
            self.recv = None;
            Poll::Ready(result)
        }

        fn abort(&mut self) -> bool {
            self.recv.take().is_some() && self.cv.cancel(self.id)
        }

        fn is_terminated(&self) -> bool {
            self.recv.is_none()
        }
    }

    impl<T> Drop for Waiting<T> {
        fn drop(&mut self) {
            // so that a notify is not spent on a waiter nobody is listening to
            self.abort();
        }
    }


    /// Future for waiting on a [`ConditionVariable`] until notified
    ///
    /// Resolves to `Ok(())` once notified, or to [`WaitAbortedError`] if the waiter is cancelled
    /// first, such as by the client's connection ending.
    ///
    /// Dropping this future before it resolves cancels the waiter.
    pub struct WaitFut(pub(super) Waiting<()>);

    impl Future for WaitFut {
        type Output = Result<(), WaitAbortedError>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
            self.get_mut().0.poll(cx)
        }
    }

    impl WaitFut {
        /// The id of the waiter this future waits on
        pub fn id(&self) -> WaiterId {
            self.0.id
        }

        /// Cancel the waiter if it has not yet been resolved
        ///
        /// Returns whether the waiter was cancelled. Afterwards this future never resolves.
        pub fn abort(&mut self) -> bool {
            self.0.abort()
        }

        /// Whether this future has already resolved or aborted
        pub fn is_terminated(&self) -> bool {
            self.0.is_terminated()
        }
    }

    #[cfg(feature = "futures")]
    impl futures::future::FusedFuture for WaitFut {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }

    impl Debug for WaitFut {
        fn fmt(&self, f: &mut Formatter) -> fmt::Result {
            f.debug_struct("WaitFut")
                .field("id", &self.0.id)
                .field("terminated", &self.is_terminated())
                .finish()
        }
    }


    /// Future for waiting on a [`ConditionVariable`] until notified or a timeout expires
    ///
    /// Resolves to `Ok(true)` if notified, `Ok(false)` if the timeout expired first, or to
    /// [`WaitAbortedError`] if the waiter is cancelled first, such as by the client's connection
    /// ending.
    ///
    /// Dropping this future before it resolves cancels the waiter.
    pub struct WaitForFut(pub(super) Waiting<bool>);

    impl Future for WaitForFut {
        type Output = Result<bool, WaitAbortedError>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
            self.get_mut().0.poll(cx)
        }
    }

    impl WaitForFut {
        /// The id of the waiter this future waits on
        pub fn id(&self) -> WaiterId {
            self.0.id
        }

        /// Cancel the waiter if it has not yet been resolved
        ///
        /// Returns whether the waiter was cancelled. Afterwards this future never resolves.
        pub fn abort(&mut self) -> bool {
            self.0.abort()
        }

        /// Whether this future has already resolved or aborted
        pub fn is_terminated(&self) -> bool {
            self.0.is_terminated()
        }
    }

    #[cfg(feature = "futures")]
    impl futures::future::FusedFuture for WaitForFut {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }

    impl Debug for WaitForFut {
        fn fmt(&self, f: &mut Formatter) -> fmt::Result {
            f.debug_struct("WaitForFut")
                .field("id", &self.0.id)
                .field("terminated", &self.is_terminated())
                .finish()
        }
    }
}


// ==== tests ====
