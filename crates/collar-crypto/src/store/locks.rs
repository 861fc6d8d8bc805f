use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;

use super::record::RecordKey;

/// One mutex per record key, created on demand and dropped once unused.
///
/// Operations on the same key are mutually exclusive; operations on
/// different keys never wait on each other beyond a brief map shard lock.
#[derive(Default)]
pub struct RecordLocks {
    locks: DashMap<RecordKey, Arc<Mutex<()>>>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`. Not reentrant.
    pub fn with<R>(&self, key: &RecordKey, f: impl FnOnce() -> R) -> R {
        let lock = Arc::clone(&self.locks.entry(key.clone()).or_default());
        let result = {
            // The mutex guards no data, so a poisoned lock is still usable.
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        drop(lock);
        // Clones are only taken under the shard lock, so a count of one
        // means nobody is waiting on this mutex.
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn same_key_is_exclusive() {
        let locks = Arc::new(RecordLocks::new());
        let inside = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicU32::new(0));
        let key = RecordKey::PreKey(1);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let overlaps = Arc::clone(&overlaps);
                let key = key.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        locks.with(&key, || {
                            if inside.swap(true, Ordering::SeqCst) {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            thread::yield_now();
                            inside.store(false, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(locks.locks.len(), 0);
    }

    #[test]
    fn distinct_keys_do_not_block() {
        let locks = Arc::new(RecordLocks::new());
        let barrier = Arc::new(Barrier::new(2));

        // Both threads must be inside their critical sections at the same
        // time for the barrier to release; a shared lock would deadlock here.
        let handles: Vec<_> = [RecordKey::PreKey(1), RecordKey::SignedPreKey(1)]
            .into_iter()
            .map(|key| {
                let locks = Arc::clone(&locks);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    locks.with(&key, || {
                        barrier.wait();
                        thread::sleep(Duration::from_millis(5));
                    });
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn returns_closure_result() {
        let locks = RecordLocks::new();
        let value = locks.with(&RecordKey::RegistrationId, || 41 + 1);
        assert_eq!(value, 42);
        assert_eq!(locks.locks.len(), 0);
    }
}
