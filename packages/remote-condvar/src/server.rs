// named condition variables and the boundary remote calls go through.

use crate::{
    condvar::api::{future::*, ConditionVariable, WeakConditionVariable},
    error::Error,
    session::{ClientId, Session},
    timer::{Timer, TokioTimer},
};
use dashmap::DashMap;
use std::{
    fmt::{self, Debug, Formatter},
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
    },
    time::Duration,
};


/// Configuration for a [`Server`]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServerConfig {
    /// Longest timeout accepted for a timed wait
    ///
    /// Defaults to one hour.
    pub max_timeout: Duration,
    /// Longest condition variable name accepted, in bytes
    ///
    /// Defaults to 256.
    pub max_name_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_timeout: Duration::from_secs(60 * 60),
            max_name_len: 256,
        }
    }
}

impl ServerConfig {
    /// Ownership-chaining setter for [`max_timeout`](Self::max_timeout)
    pub fn with_max_timeout(mut self, max_timeout: Duration) -> Self {
        self.max_timeout = max_timeout;
        self
    }

    /// Ownership-chaining setter for [`max_name_len`](Self::max_name_len)
    pub fn with_max_name_len(mut self, max_name_len: usize) -> Self {
        self.max_name_len = max_name_len;
        self
    }
}


/// Server-side home of condition variables shared by remote clients
///
/// Condition variables are addressed by name and created the first time a name is used to wait. A
/// name is forgotten once nothing holds its condition variable any more, which happens when every
/// wait on it has resolved and their futures have been dropped.
/// The transport layer calls [`connect`](Self::connect) for each new client connection, relays the
/// client's remote calls to the corresponding methods, and drops or
/// [disconnects](Session::disconnect) the session when the connection ends.
pub struct Server {
    config: ServerConfig,
    timer: Arc<dyn Timer>,
    // the map only holds weak handles. each condition variable removes its own entry once its last
    // strong handle is dropped.
    condvars: Arc<DashMap<String, WeakConditionVariable>>,
    next_client_id: AtomicU64,
}

impl Server {
    /// Construct, expiring timed waits with tasks on the current tokio runtime
    ///
    /// Errors if not called from within a tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self, Error> {
        let timer = TokioTimer::try_current()?;
        Ok(Server::with_timer(config, Arc::new(timer)))
    }

    /// Construct, expiring timed waits with the given timer
    pub fn with_timer(config: ServerConfig, timer: Arc<dyn Timer>) -> Self {
        Server {
            config,
            timer,
            condvars: Arc::new(DashMap::new()),
            next_client_id: AtomicU64::new(0),
        }
    }

    /// The configuration this server was constructed with
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Create the session for a newly connected client
    pub fn connect(&self) -> Session {
        let id = ClientId::new(self.next_client_id.fetch_add(1, Relaxed));
        debug!(client = %id, "client connected");
        Session::new(id)
    }

    /// Get the condition variable with the given name, creating it if it does not exist
    pub fn condition_variable(&self, name: &str) -> Result<ConditionVariable, Error> {
        self.check_name(name)?;
        if let Some(cv) = self.get(name) {
            return Ok(cv);
        }
        let mut entry = self.condvars.entry(name.to_owned()).or_default();
        if let Some(cv) = entry.upgrade() {
            return Ok(cv);
        }
        // entry is new, or its condition variable was released and has yet to remove it
        debug!(condvar = name, "creating condition variable");
        let cv = self.create(name);
        *entry = cv.downgrade();
        Ok(cv)
    }

    // construct a condition variable which removes its name from the map when released.
    fn create(&self, name: &str) -> ConditionVariable {
        let condvars = Arc::downgrade(&self.condvars);
        let name = name.to_owned();
        ConditionVariable::with_on_release(self.timer.clone(), move || {
            let Some(condvars) = condvars.upgrade() else { return };
            // a newer condition variable may have taken the name in the meantime
            if condvars.remove_if(&name, |_, cv| cv.is_released()).is_some() {
                debug!(condvar = %name, "removed released condition variable");
            }
        })
    }

    /// Get the condition variable with the given name, if it exists
    pub fn get(&self, name: &str) -> Option<ConditionVariable> {
        self.condvars.get(name).and_then(|entry| entry.value().upgrade())
    }

    /// Wait on the named condition variable until notified
    ///
    /// The wait is aborted if `session` disconnects first.
    pub fn wait(&self, session: &Session, name: &str) -> Result<WaitFut, Error> {
        self.check_session(session)?;
        let cv = self.condition_variable(name)?;
        Ok(cv.wait(session.id(), &session.slot()))
    }

    /// Wait on the named condition variable until notified or `timeout_ms` milliseconds elapse
    ///
    /// The wait is aborted if `session` disconnects first. A timeout of 0 expires on the next
    /// timer tick unless notified before that.
    pub fn wait_for(
        &self,
        session: &Session,
        name: &str,
        timeout_ms: i64,
    ) -> Result<WaitForFut, Error> {
        let timeout = self.check_timeout(timeout_ms)?;
        self.check_session(session)?;
        let cv = self.condition_variable(name)?;
        Ok(cv.wait_for(timeout, session.id(), &session.slot()))
    }

    /// Notify the longest-waiting waiter of the named condition variable, if there is one
    ///
    /// Does not create the condition variable if it does not exist.
    pub fn notify_one(&self, name: &str) -> Result<bool, Error> {
        self.check_name(name)?;
        // not holding the map entry while callbacks run
        let cv = self.get(name);
        Ok(cv.is_some_and(|cv| cv.notify_one()))
    }

    /// Notify every current waiter of the named condition variable
    ///
    /// Returns the number of waiters notified. Does not create the condition variable if it does
    /// not exist.
    pub fn notify_all(&self, name: &str) -> Result<usize, Error> {
        self.check_name(name)?;
        let cv = self.get(name);
        Ok(cv.map_or(0, |cv| cv.notify_all()))
    }

    fn check_name(&self, name: &str) -> Result<(), Error> {
        if name.len() > self.config.max_name_len {
            return Err(Error::NameTooLong {
                len: name.len(),
                max: self.config.max_name_len,
            });
        }
        Ok(())
    }

    fn check_session(&self, session: &Session) -> Result<(), Error> {
        if session.is_closed() {
            return Err(Error::SessionClosed(session.id()));
        }
        Ok(())
    }

    fn check_timeout(&self, timeout_ms: i64) -> Result<Duration, Error> {
        let timeout = u64::try_from(timeout_ms)
            .map(Duration::from_millis)
            .map_err(|_| Error::NegativeTimeout(timeout_ms))?;
        if timeout > self.config.max_timeout {
            return Err(Error::TimeoutTooLong {
                requested: timeout,
                max: self.config.max_timeout,
            });
        }
        Ok(timeout)
    }
}

impl Debug for Server {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("condition_variables", &self.condvars.len())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::WaitAbortedError, timer::manual::ManualTimer};

    fn server() -> (Server, Arc<ManualTimer>) {
        let timer = Arc::new(ManualTimer::default());
        let config = ServerConfig::default()
            .with_max_timeout(Duration::from_secs(10))
            .with_max_name_len(8);
        (Server::with_timer(config, timer.clone()), timer)
    }

    #[test]
    fn rejects_invalid_calls_test() {
        let (server, timer) = server();
        let session = server.connect();

        assert!(matches!(
            server.wait_for(&session, "cv", -1),
            Err(Error::NegativeTimeout(-1)),
        ));
        assert!(matches!(
            server.wait_for(&session, "cv", 10_001),
            Err(Error::TimeoutTooLong { .. }),
        ));
        assert!(matches!(
            server.wait(&session, "much too long"),
            Err(Error::NameTooLong { len: 13, max: 8 }),
        ));
        assert!(matches!(
            server.notify_one("much too long"),
            Err(Error::NameTooLong { .. }),
        ));

        // nothing got enrolled or scheduled
        assert!(server.get("cv").is_none());
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn disconnected_session_rejected_test() {
        let (server, _) = server();
        let session = server.connect();
        let id = session.id();
        session.disconnect();
        assert!(matches!(server.wait(&session, "cv"), Err(Error::SessionClosed(closed)) if closed == id));
        assert!(matches!(server.wait_for(&session, "cv", 0), Err(Error::SessionClosed(_))));
    }

    #[test]
    fn notify_unknown_name_test() {
        let (server, _) = server();
        assert_eq!(server.notify_one("cv").unwrap(), false);
        assert_eq!(server.notify_all("cv").unwrap(), 0);
        assert!(server.get("cv").is_none());
    }

    #[test]
    fn names_share_queue_test() {
        let (server, timer) = server();
        let a = server.connect();
        let b = server.connect();
        assert_ne!(a.id(), b.id());

        let _wait_a = server.wait(&a, "cv").unwrap();
        let _wait_b = server.wait_for(&b, "cv", 0).unwrap();
        let _other = server.wait(&a, "other").unwrap();
        assert_eq!(timer.delays(), [Duration::ZERO]);

        let cv = server.condition_variable("cv").unwrap();
        assert_eq!(cv.len(), 2);
        assert_eq!(server.get("other").unwrap().len(), 1);
        assert_eq!(server.notify_all("cv").unwrap(), 2);
        assert!(cv.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_test() {
        let server = Server::new(ServerConfig::default()).unwrap();
        let alice = server.connect();
        let bob = server.connect();

        let alice_wait = server.wait(&alice, "cv").unwrap();
        let bob_wait = server.wait_for(&bob, "cv", 50).unwrap();

        // alice leaves, so bob is at the front of the queue
        drop(alice);
        assert_eq!(alice_wait.await, Err(WaitAbortedError));
        assert!(server.notify_one("cv").unwrap());
        assert_eq!(bob_wait.await, Ok(true));

        // timeouts are driven by the runtime
        assert_eq!(server.wait_for(&bob, "cv", 0).unwrap().await, Ok(false));
        assert_eq!(server.wait_for(&bob, "cv", 50).unwrap().await, Ok(false));
        // every wait resolved and its future dropped
        assert!(server.get("cv").is_none());
    }

    #[tokio::test]
    async fn released_names_are_removed_test() {
        let (server, timer) = server();
        let session = server.connect();

        // notified
        let wait = server.wait(&session, "cv").unwrap();
        assert!(server.get("cv").is_some());
        assert!(server.notify_one("cv").unwrap());
        assert_eq!(wait.await, Ok(()));
        assert!(server.get("cv").is_none());
        assert!(server.condvars.is_empty());

        // timed out
        let wait = server.wait_for(&session, "cv", 5).unwrap();
        timer.fire_all();
        assert_eq!(wait.await, Ok(false));
        assert!(server.get("cv").is_none());

        // future dropped before resolving
        drop(server.wait(&session, "dropped").unwrap());
        assert!(server.get("dropped").is_none());

        // disconnected
        let other = server.connect();
        let wait = server.wait(&other, "gone").unwrap();
        other.disconnect();
        assert_eq!(wait.await, Err(WaitAbortedError));
        assert!(server.condvars.is_empty());
    }

    #[test]
    fn name_kept_while_in_use_test() {
        let (server, _) = server();
        let a = server.connect();
        let b = server.connect();
        let wait_a = server.wait(&a, "cv").unwrap();
        let wait_b = server.wait(&b, "cv").unwrap();
        assert!(server.notify_one("cv").unwrap());
        drop(wait_a);
        // b still waits on the same queue
        assert_eq!(server.get("cv").unwrap().len(), 1);
        drop(wait_b);
        assert!(server.get("cv").is_none());

        // a handle held outside of any wait keeps the name alive, and reusing the name afterwards
        // starts a fresh queue
        let held = server.condition_variable("cv").unwrap();
        assert!(server.get("cv").is_some());
        drop(held);
        assert!(server.get("cv").is_none());
        let _wait = server.wait(&a, "cv").unwrap();
        assert_eq!(server.get("cv").unwrap().len(), 1);
        assert_eq!(server.condvars.len(), 1);
    }

    #[test]
    fn new_requires_runtime_test() {
        assert!(matches!(Server::new(ServerConfig::default()), Err(Error::NoRuntime(_))));
    }
}
