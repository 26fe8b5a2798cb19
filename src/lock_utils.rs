//! Poison-tolerant lock helpers.
//!
//! Shared maps read from the TLS handshake callback are locked through
//! these: a poisoned lock is logged and its guard recovered. Only fully
//! constructed values are ever inserted into those maps.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::error;

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// `what` names the protected data in the log line.
pub fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        error!("mutex guarding {} was poisoned; recovering", what);
        poisoned.into_inner()
    })
}

/// Read-lock an `RwLock`, recovering from poisoning.
pub fn read_or_recover<'a, T>(lock: &'a RwLock<T>, what: &str) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|poisoned| {
        error!("rwlock guarding {} was poisoned (read); recovering", what);
        poisoned.into_inner()
    })
}

/// Write-lock an `RwLock`, recovering from poisoning.
pub fn write_or_recover<'a, T>(lock: &'a RwLock<T>, what: &str) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|poisoned| {
        error!("rwlock guarding {} was poisoned (write); recovering", what);
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_write_then_read() {
        let map = RwLock::new(HashMap::new());
        write_or_recover(&map, "patterns").insert("*.app.eth.localhost", 1);
        assert_eq!(read_or_recover(&map, "patterns").get("*.app.eth.localhost"), Some(&1));
    }

    #[test]
    fn test_poisoned_rwlock_still_serves_entries() {
        let map = Arc::new(RwLock::new(HashMap::from([("vitalik.eth", "bafy1")])));
        let clone = Arc::clone(&map);

        let handle = thread::spawn(move || {
            let _guard = clone.write().unwrap();
            panic!("handshake panicked while holding the cache");
        });
        let _ = handle.join();

        assert!(map.is_poisoned());
        let guard = read_or_recover(&map, "resolutions");
        assert_eq!(guard.get("vitalik.eth"), Some(&"bafy1"));
    }

    #[test]
    fn test_poisoned_mutex_recovers() {
        let mutex = Arc::new(Mutex::new(7u32));
        let clone = Arc::clone(&mutex);

        let _ = thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        *lock_or_recover(&mutex, "counter") += 1;
        assert_eq!(*lock_or_recover(&mutex, "counter"), 8);
    }
}
