//! Client connection lifecycle.
//!
//! The transport layer creates one [`Session`] per client connection and disconnects it when the
//! connection ends. Every wait a client issues is given a [`DisconnectSlot`] from its session, into
//! which the condition variable writes an action that cancels the wait.

use std::{
    fmt::{self, Debug, Display, Formatter},
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};


/// Opaque handle to a client connection
///
/// Stable for the lifetime of the connection. The condition variable only uses it to attribute
/// waiters in diagnostics.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// Construct from a raw connection number
    pub const fn new(raw: u64) -> Self {
        ClientId(raw)
    }

    /// Get the raw connection number
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}


/// Action run when a connection ends
pub type DisconnectFn = Box<dyn FnOnce() + Send>;

/// Cell holding an action to run when a client connection ends
///
/// Cloning produces another handle to the same cell. A slot holds at most one action, and arming
/// it overwrites any action it already holds. Once a slot has fired it stays fired.
#[derive(Clone, Default)]
pub struct DisconnectSlot(Arc<Mutex<SlotCell>>);

/// Identifies one arming of a [`DisconnectSlot`]
///
/// Returned by [`DisconnectSlot::arm`], so that whoever armed the slot can later discard its own
/// action without discarding an action armed after it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ArmToken(u64);

#[derive(Default)]
struct SlotCell {
    state: SlotState,
    // number of times the slot has been armed.
    arms: u64,
}

#[derive(Default)]
enum SlotState {
    #[default]
    Idle,
    Armed(ArmToken, DisconnectFn),
    Fired,
}

impl DisconnectSlot {
    /// Construct an idle slot not tracked by any session
    pub fn new() -> Self {
        DisconnectSlot::default()
    }

    fn fired() -> Self {
        DisconnectSlot(Arc::new(Mutex::new(SlotCell {
            state: SlotState::Fired,
            arms: 0,
        })))
    }

    fn lock(&self) -> MutexGuard<'_, SlotCell> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an action to run when the connection ends
    ///
    /// Returns a token identifying this arming. If the slot has already fired, the action is not
    /// stored and is instead returned, and it is the caller's responsibility to run it.
    pub fn arm(&self, on_disconnect: DisconnectFn) -> Result<ArmToken, DisconnectFn> {
        let mut cell = self.lock();
        if let SlotState::Fired = cell.state {
            return Err(on_disconnect);
        }
        let token = ArmToken(cell.arms);
        cell.arms = cell.arms.wrapping_add(1);
        let replaced = mem::replace(&mut cell.state, SlotState::Armed(token, on_disconnect));
        drop(cell);
        drop(replaced);
        Ok(token)
    }

    /// Discard the stored action without running it, if it was stored by the arming `token`
    /// identifies
    ///
    /// Returns whether an action was discarded. An action armed after `token` is left in place.
    pub fn clear_if_current(&self, token: ArmToken) -> bool {
        let mut cell = self.lock();
        if !matches!(cell.state, SlotState::Armed(current, _) if current == token) {
            return false;
        }
        let cleared = mem::replace(&mut cell.state, SlotState::Idle);
        drop(cell);
        drop(cleared);
        true
    }

    /// Mark the slot as fired and run the stored action, if there is one
    ///
    /// Returns whether an action ran. Only the first call can run an action.
    pub fn fire(&self) -> bool {
        let state = mem::replace(&mut self.lock().state, SlotState::Fired);
        match state {
            SlotState::Armed(_, on_disconnect) => {
                on_disconnect();
                true
            }
            SlotState::Idle | SlotState::Fired => false,
        }
    }

    /// Whether the slot currently holds an action
    pub fn is_armed(&self) -> bool {
        matches!(self.lock().state, SlotState::Armed(..))
    }

    /// Whether the slot has fired
    pub fn is_fired(&self) -> bool {
        matches!(self.lock().state, SlotState::Fired)
    }
}

impl Debug for DisconnectSlot {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let state = match self.lock().state {
            SlotState::Idle => "idle",
            SlotState::Armed(..) => "armed",
            SlotState::Fired => "fired",
        };
        f.debug_tuple("DisconnectSlot").field(&state).finish()
    }
}


/// Server-side state of one client connection
///
/// Dropping a session disconnects it.
pub struct Session {
    id: ClientId,
    // slots handed out so far, or None once disconnected. slots are only tracked weakly, so a slot
    // that everyone else has let go of is simply never fired.
    slots: Mutex<Option<Vec<Weak<Mutex<SlotCell>>>>>,
}

impl Session {
    /// Construct a connected session
    pub fn new(id: ClientId) -> Self {
        Session {
            id,
            slots: Mutex::new(Some(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Vec<Weak<Mutex<SlotCell>>>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The client connection handle
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Allocate a new disconnect slot which fires when this session disconnects
    ///
    /// If the session is already disconnected, the returned slot has already fired.
    pub fn slot(&self) -> DisconnectSlot {
        let mut slots = self.lock();
        let Some(slots) = slots.as_mut() else {
            return DisconnectSlot::fired();
        };
        slots.retain(|slot| slot.strong_count() > 0);
        let slot = DisconnectSlot::new();
        slots.push(Arc::downgrade(&slot.0));
        slot
    }

    /// Whether this session has been disconnected
    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// Disconnect, firing every disconnect slot allocated from this session
    ///
    /// Returns the number of actions that ran. Calling this again is a no-op.
    pub fn disconnect(&self) -> usize {
        let Some(slots) = self.lock().take() else {
            return 0;
        };
        let fired = slots.iter()
            .filter_map(Weak::upgrade)
            .map(DisconnectSlot)
            .filter(|slot| slot.fire())
            .count();
        debug!(client = %self.id, fired, "session disconnected");
        fired
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> DisconnectFn) {
        let count = Arc::new(AtomicUsize::new(0));
        let make = {
            let count = count.clone();
            move || -> DisconnectFn {
                let count = count.clone();
                Box::new(move || { count.fetch_add(1, Relaxed); })
            }
        };
        (count, make)
    }

    #[test]
    fn slot_fires_once_test() {
        let (count, action) = counter();
        let slot = DisconnectSlot::new();
        slot.arm(action()).ok().unwrap();
        assert!(slot.is_armed());
        assert!(slot.fire());
        assert!(!slot.fire());
        assert!(slot.is_fired());
        assert_eq!(count.load(Relaxed), 1);
    }

    #[test]
    fn slot_overwrite_and_clear_test() {
        let (count, action) = counter();
        let slot = DisconnectSlot::new();
        slot.arm(action()).ok().unwrap();
        slot.arm(action()).ok().unwrap();
        assert!(slot.fire());
        // overwriting replaces rather than chains
        assert_eq!(count.load(Relaxed), 1);

        let slot = DisconnectSlot::new();
        let token = slot.arm(action()).ok().unwrap();
        assert!(slot.clear_if_current(token));
        assert!(!slot.is_armed());
        assert!(!slot.clear_if_current(token));
        assert!(!slot.fire());
        assert_eq!(count.load(Relaxed), 1);
    }

    #[test]
    fn stale_token_leaves_newer_action_test() {
        let (count, action) = counter();
        let slot = DisconnectSlot::new();
        let first = slot.arm(action()).ok().unwrap();
        let second = slot.arm(action()).ok().unwrap();
        assert_ne!(first, second);
        assert!(!slot.clear_if_current(first));
        assert!(slot.is_armed());
        assert!(slot.fire());
        assert_eq!(count.load(Relaxed), 1);
        assert!(!slot.clear_if_current(second));
    }

    #[test]
    fn arm_after_fire_returns_action_test() {
        let (count, action) = counter();
        let slot = DisconnectSlot::new();
        slot.fire();
        let returned = slot.arm(action()).err().unwrap();
        assert_eq!(count.load(Relaxed), 0);
        returned();
        assert_eq!(count.load(Relaxed), 1);
    }

    #[test]
    fn session_disconnect_test() {
        let (count, action) = counter();
        let session = Session::new(ClientId::new(7));
        let slots = (0..3).map(|_| session.slot()).collect::<Vec<_>>();
        slots[0].arm(action()).ok().unwrap();
        slots[2].arm(action()).ok().unwrap();
        assert!(!session.is_closed());
        assert_eq!(session.disconnect(), 2);
        assert_eq!(session.disconnect(), 0);
        assert!(session.is_closed());
        assert!(slots.iter().all(DisconnectSlot::is_fired));
        assert_eq!(count.load(Relaxed), 2);
        assert!(session.slot().is_fired());
    }

    #[test]
    fn released_slots_are_pruned_test() {
        let (count, action) = counter();
        let session = Session::new(ClientId::new(1));
        for _ in 0..10 {
            let slot = session.slot();
            slot.arm(action()).ok().unwrap();
        }
        let kept = session.slot();
        kept.arm(action()).ok().unwrap();
        assert_eq!(session.lock().as_ref().unwrap().len(), 1);
        drop(session);
        assert!(kept.is_fired());
        assert_eq!(count.load(Relaxed), 1);
    }
}
