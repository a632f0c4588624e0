// minimal safe API for the waiter registry. the exposed API is a wrapper around this.
//
// waiter records live in an arena of slots. a slot holding a pending waiter is also linked into an
// index-based doubly linked queue, which lets a cancelled waiter be unlinked from the middle of the
// queue in constant time. a WaiterId is a (slot index, slot generation) pair. the generation is
// bumped whenever a slot is vacated, so looking up an id after its waiter resolved finds either a
// vacant slot or a slot with a different generation, and never a different waiter.

use crate::session::{ArmToken, ClientId, DisconnectSlot};


/// Identifier for a waiter enrolled in a condition variable
///
/// An id is never reused for a different waiter of the same condition variable, so it is always
/// safe to act on an id after its waiter has been resolved.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct WaiterId {
    idx: usize,
    generation: u64,
}

/// Whether a waiter may still be resolved
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum WaiterState {
    /// Enrolled and queued, waiting for a notify, timeout, or disconnect
    Pending,
    /// Resolved by a notify, timeout, or disconnect, or cancelled
    Resolved,
}

// the two kinds of wait.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum WaitKind {
    // untimed wait.
    Hold,
    // timed wait.
    Knock,
}

// completion callback of a waiter. resolving consumes it, so it runs at most once.
pub(crate) enum Handler {
    Hold(Box<dyn FnOnce() + Send>),
    // called with true if notified, or false if the timeout expired first.
    Knock(Box<dyn FnOnce(bool) + Send>),
}

impl Handler {
    pub(crate) fn kind(&self) -> WaitKind {
        match self {
            Handler::Hold(_) => WaitKind::Hold,
            Handler::Knock(_) => WaitKind::Knock,
        }
    }

    // run the callback. `notified` is ignored for plain waits.
    pub(crate) fn resolve(self, notified: bool) {
        match self {
            Handler::Hold(f) => f(),
            Handler::Knock(f) => f(notified),
        }
    }
}

// a waiter record.
pub(crate) struct Waiter {
    pub(crate) handler: Handler,
    // client connection that enrolled this waiter. only used for diagnostics.
    pub(crate) owner: ClientId,
    // the disconnect slot armed with this waiter's cancellation.
    pub(crate) slot: DisconnectSlot,
    // identifies this waiter's arming of the slot. None if the slot had already fired, or before
    // it is armed.
    pub(crate) armed: Option<ArmToken>,
}

impl Waiter {
    // discard this waiter's disconnect action, unless the slot has since been re-armed by someone
    // else.
    pub(crate) fn disarm(&self) {
        if let Some(token) = self.armed {
            self.slot.clear_if_current(token);
        }
    }
}

// waiter arena plus FIFO queue of pending waiters.
//
// invariant: a waiter is stored in the arena if and only if it is linked into the queue.
#[derive(Default)]
pub(crate) struct Registry {
    slots: Vec<Slot>,
    // indices of slots with no waiter.
    vacant: Vec<usize>,
    // front and back of queue, unless queue is empty.
    front_back: Option<(usize, usize)>,
    len: usize,
}

struct Slot {
    generation: u64,
    node: Option<Node>,
}

struct Node {
    waiter: Waiter,
    // next node towards front.
    to_front: Option<usize>,
    // next node towards back.
    to_back: Option<usize>,
}

impl Registry {
    // construct empty.
    pub(crate) fn new() -> Self {
        Registry::default()
    }

    // number of pending waiters.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    // O(1) pending check.
    pub(crate) fn state(&self, id: WaiterId) -> WaiterState {
        match self.slots.get(id.idx) {
            Some(slot) if slot.generation == id.generation && slot.node.is_some() => {
                WaiterState::Pending
            }
            _ => WaiterState::Resolved,
        }
    }

    // enroll a waiter at the back of the queue.
    pub(crate) fn push(&mut self, waiter: Waiter) -> WaiterId {
        let idx = self.vacant.pop().unwrap_or_else(|| {
            self.slots.push(Slot { generation: 0, node: None });
            self.slots.len() - 1
        });

        let to_front = self.front_back.map(|(_, back)| back);
        if let Some(back) = to_front {
            // node becomes new back, and new to_back of previous back
            self.node_mut(back).to_back = Some(idx);
        }
        match &mut self.front_back {
            Some((_, back)) => *back = idx,
            // edge case: node becomes only node in queue
            None => self.front_back = Some((idx, idx)),
        }

        let slot = &mut self.slots[idx];
        debug_assert!(slot.node.is_none(), "vacant slot list contained occupied slot (internal bug)");
        slot.node = Some(Node { waiter, to_front, to_back: None });
        self.len += 1;
        WaiterId { idx, generation: slot.generation }
    }

    // the waiter, if it is still pending.
    pub(crate) fn get_mut(&mut self, id: WaiterId) -> Option<&mut Waiter> {
        if self.state(id) == WaiterState::Resolved {
            return None;
        }
        Some(&mut self.node_mut(id.idx).waiter)
    }

    // if the waiter is still pending, unlink it, vacate its slot, and return it.
    pub(crate) fn remove(&mut self, id: WaiterId) -> Option<Waiter> {
        if self.state(id) == WaiterState::Resolved {
            return None;
        }
        Some(self.unlink(id.idx))
    }

    // unlink and return the longest-waiting waiter.
    pub(crate) fn pop_front(&mut self) -> Option<(WaiterId, Waiter)> {
        let (front, _) = self.front_back?;
        let id = WaiterId { idx: front, generation: self.slots[front].generation };
        Some((id, self.unlink(front)))
    }

    // unlink and return every waiter, front to back. the ids are collected before anything is
    // unlinked.
    pub(crate) fn drain(&mut self) -> Vec<(WaiterId, Waiter)> {
        let ids = self.ids().collect::<Vec<_>>();
        ids.into_iter()
            .map(|id| (id, self.unlink(id.idx)))
            .collect()
    }

    // ids of pending waiters, front to back.
    pub(crate) fn ids(&self) -> impl Iterator<Item = WaiterId> + '_ {
        let mut next = self.front_back.map(|(front, _)| front);
        std::iter::from_fn(move || {
            let idx = next?;
            let slot = &self.slots[idx];
            next = slot.node.as_ref().and_then(|node| node.to_back);
            Some(WaiterId { idx, generation: slot.generation })
        })
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.slots[idx].node.as_mut().expect("queue linked to vacant slot (internal bug)")
    }

    // unlink the occupied slot at idx from the queue and vacate it.
    fn unlink(&mut self, idx: usize) -> Waiter {
        let slot = &mut self.slots[idx];
        let node = slot.node.take().expect("unlinking vacant slot (internal bug)");
        slot.generation = slot.generation.wrapping_add(1);

        match (node.to_front, node.to_back) {
            (Some(to_front), Some(to_back)) => {
                self.node_mut(to_front).to_back = Some(to_back);
                self.node_mut(to_back).to_front = Some(to_front);
            }
            (Some(to_front), None) => {
                // edge case: node was at the back of queue (but is not the front)
                self.node_mut(to_front).to_back = None;
                if let Some((_, back)) = &mut self.front_back {
                    *back = to_front;
                }
            }
            (None, Some(to_back)) => {
                // edge case: node was at the front of queue (but is not the back)
                self.node_mut(to_back).to_front = None;
                if let Some((front, _)) = &mut self.front_back {
                    *front = to_back;
                }
            }
            (None, None) => {
                // edge case: node was only node in queue
                debug_assert_eq!(self.front_back, Some((idx, idx)));
                self.front_back = None;
            }
        }

        self.vacant.push(idx);
        self.len -= 1;
        node.waiter
    }
}
