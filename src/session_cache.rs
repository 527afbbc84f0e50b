use std::any::Any;
use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::ThreadId;
use std::time::Instant;

use tracing::{debug, info};

use crate::config::DetectorConfig;
use crate::engine::{EngineFactory, InferenceEngine};
use crate::error::DetectorError;

/// Identity of a worker owning one engine session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerId {
    /// An OS thread.
    Thread(ThreadId),
    /// A slot in a caller-managed pool.
    Slot(usize),
}

impl WorkerId {
    pub fn current() -> Self {
        WorkerId::Thread(std::thread::current().id())
    }
}

/// Shared handle to one worker's engine.
///
/// The inner mutex is only ever taken by the owning worker, so it is uncontended.
pub struct SessionHandle<E> {
    engine: Arc<Mutex<E>>,
}

impl<E> Clone for SessionHandle<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<E: InferenceEngine> SessionHandle<E> {
    pub fn with<R>(&self, f: impl FnOnce(&mut E) -> R) -> Result<R, DetectorError> {
        let mut engine = self
            .engine
            .lock()
            .map_err(|_| DetectorError::Processing("session lock poisoned".into()))?;
        Ok(f(&mut engine))
    }

    /// True if both handles refer to the same loaded engine.
    pub fn same_session(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.engine, &other.engine)
    }
}

type SessionMap<E> = RwLock<HashMap<WorkerId, SessionHandle<E>>>;

thread_local! {
    static THREAD_EXIT_GUARDS: RefCell<Vec<Box<dyn Any>>> = const { RefCell::new(Vec::new()) };
}

/// Removes a thread's session from its cache when the thread's locals are destroyed.
struct EvictOnThreadExit<E> {
    sessions: Weak<SessionMap<E>>,
    worker: WorkerId,
}

impl<E> Drop for EvictOnThreadExit<E> {
    fn drop(&mut self) {
        if let Some(sessions) = self.sessions.upgrade() {
            if let Ok(mut sessions) = sessions.write() {
                sessions.remove(&self.worker);
            }
        }
    }
}

/// Lazily built engine sessions, one per worker.
///
/// The first call from a worker pays the model load; later calls from the same
/// worker get the same session back. Sessions are never handed to another worker.
///
/// A `WorkerId::Thread` session lives as long as its thread: when the thread
/// exits, its entry is evicted and the engine dropped. `WorkerId::Slot`
/// sessions stay until [`SessionCache::evict`] is called.
pub struct SessionCache<E> {
    config: Arc<DetectorConfig>,
    factory: EngineFactory<E>,
    sessions: Arc<SessionMap<E>>,
}

impl<E: InferenceEngine> SessionCache<E> {
    pub fn new(config: Arc<DetectorConfig>, factory: EngineFactory<E>) -> Self {
        Self {
            config,
            factory,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the worker's session, loading it on first use.
    ///
    /// # Errors
    ///
    /// Whatever the factory returns, typically `ModelLoad`. A failed load is not
    /// cached, so the next call from the worker tries again.
    pub fn get_session(&self, worker: WorkerId) -> Result<SessionHandle<E>, DetectorError> {
        if let Some(handle) = self.lookup(worker)? {
            return Ok(handle);
        }

        let start = Instant::now();
        let engine = (self.factory)(&self.config)?;
        info!(
            ?worker,
            input_name = engine.input_name(),
            load_ms = start.elapsed().as_secs_f64() * 1000.0,
            "created engine session"
        );

        let (handle, inserted) = {
            let mut sessions = self
                .sessions
                .write()
                .map_err(|_| DetectorError::Processing("session cache lock poisoned".into()))?;

            // A slot id shared across threads may have raced us here; first insert wins.
            let slot = match sessions.entry(worker) {
                Entry::Occupied(entry) => (entry.get().clone(), false),
                Entry::Vacant(entry) => {
                    let handle = SessionHandle {
                        engine: Arc::new(Mutex::new(engine)),
                    };
                    (entry.insert(handle).clone(), true)
                }
            };
            slot
        };

        if inserted {
            self.evict_on_thread_exit(worker);
        }

        Ok(handle)
    }

    fn evict_on_thread_exit(&self, worker: WorkerId) {
        // Only the calling thread can tie a session to its own lifetime
        if worker != WorkerId::current() {
            return;
        }

        let guard = EvictOnThreadExit {
            sessions: Arc::downgrade(&self.sessions),
            worker,
        };
        // Fails only while the thread is already tearing down its locals
        let _ = THREAD_EXIT_GUARDS.try_with(|guards| guards.borrow_mut().push(Box::new(guard)));
    }

    fn lookup(&self, worker: WorkerId) -> Result<Option<SessionHandle<E>>, DetectorError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| DetectorError::Processing("session cache lock poisoned".into()))?;
        Ok(sessions.get(&worker).cloned())
    }

    /// Drops a worker's session now, e.g. when a pool slot is retired.
    pub fn evict(&self, worker: WorkerId) -> bool {
        let removed = match self.sessions.write() {
            Ok(mut sessions) => sessions.remove(&worker).is_some(),
            Err(_) => false,
        };
        if removed {
            debug!(?worker, "evicted engine session");
        }
        removed
    }

    pub fn contains(&self, worker: WorkerId) -> bool {
        self.sessions
            .read()
            .map(|sessions| sessions.contains_key(&worker))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|sessions| sessions.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
