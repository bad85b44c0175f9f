//! Named mutual-exclusion locks with timeouts.
//!
//! Mutations on a tree serialize on a lock named by the tree id; ext_data
//! accesses additionally take a lock named by the leaf identity. The
//! registry is process-wide; tokio's mutex queues waiters in FIFO order.

use arbor_common::{ArborError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Default acquisition timeout.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Arc<AsyncMutex<()>>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A held named lock. Dropping it releases the lock.
pub struct NamedLock {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl NamedLock {
    /// The name this lock was acquired under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Releases the lock.
    pub fn release(self) {}
}

impl std::fmt::Debug for NamedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedLock").field("name", &self.name).finish()
    }
}

/// Acquires the lock registered under `name`, waiting at most `timeout`.
pub async fn lock(name: &str, timeout: Duration) -> Result<NamedLock> {
    let mutex = {
        let mut map = registry().lock();
        Arc::clone(
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    };

    match tokio::time::timeout(timeout, mutex.lock_owned()).await {
        Ok(guard) => Ok(NamedLock {
            name: name.to_string(),
            _guard: guard,
        }),
        Err(_) => Err(ArborError::LockTimeout {
            name: name.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Acquires the lock under the default timeout.
pub async fn lock_default(name: &str) -> Result<NamedLock> {
    lock(name, DEFAULT_LOCK_TIMEOUT).await
}

/// Drops the registry entry for `name`. Call when a tree is closed; a held
/// guard keeps the mutex alive until released.
pub fn forget(name: &str) {
    registry().lock().remove(name);
}
