// implementation of the condition variable.
//
// the architecture is as such:
//
// condition variable handles wrap around Arc<shared state>
//                                           |
//          /--------------------------------/
//          v
//       shared state
//          |
//          |------ it contains a Mutex<core::Registry>. the registry is an arena of waiter records
//          |       addressed by generational WaiterIds, with the pending waiters threaded through
//          |       it as a FIFO queue. a waiter is in the arena if and only if it is pending, so
//          |       removing it from the arena is the check-and-clear of its pending bit. every
//          |       resolution path (notify, timeout, disconnect, cancel) goes through that removal
//          |       while holding the mutex, and whoever removes the waiter owns its callback.
//          |
//          |------ it contains the Timer used to expire timed waits.
//          |
//          \------ it may contain a hook run when the last handle is dropped, which the server
//                  uses to forget the name of a condition variable nobody uses any more.
//
// disconnect slots and timer callbacks capture only a Weak to the shared state and a WaiterId.
// when one of them fires after the waiter was resolved some other way, the id no longer matches
// the arena and the firing is a no-op. a waiter records the ArmToken of its arming of the slot,
// and resolving it only clears the slot while that arming is still current.
//
// callbacks always run after the mutex is released, so they may freely re-enter the condition
// variable.
//
// the organization of these modules is as such:
//
//      core: The registry. Not itself concurrent, fully safe, but panicky on internal bugs.
//       ^
//       |
//      api: A wrapper around core which adds locking, disconnect slots, timers, and futures. The
//           crate re-exports this API publicly.

pub(crate) mod api;

mod core;
