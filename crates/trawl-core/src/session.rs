//! Bounded pool of reusable fetcher sessions.
//!
//! Sessions are keyed by egress route: one per proxy, or one per round-robin lane when
//! fetching directly. At most `capacity` sessions are kept. When the pool is full the
//! least recently used idle session is evicted; if every session is busy, the new one
//! is handed out without being cached.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::AppError;
use crate::proxy::ProxyAddress;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    proxy: Option<String>,
    lane: usize,
}

struct SessionEntry<S> {
    session: S,
    last_used: u64,
    active: usize,
}

struct PoolState<S> {
    sessions: HashMap<SessionKey, SessionEntry<S>>,
    next_lane: usize,
    clock: u64,
}

pub struct SessionPool<S> {
    capacity: usize,
    state: Arc<Mutex<PoolState<S>>>,
}

impl<S: Clone> SessionPool<S> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Arc::new(Mutex::new(PoolState {
                sessions: HashMap::new(),
                next_lane: 0,
                clock: 0,
            })),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock_state().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquires the state lock, recovering from poison if necessary.
    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState<S>> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned session pool mutex");
            poisoned.into_inner()
        })
    }

    /// Borrow the session for `proxy`, opening one with `open` if none is cached.
    ///
    /// `open` runs without the pool lock held. If another caller cached a session for the
    /// same route meanwhile, that one is used and the new one dropped.
    pub fn checkout<O>(
        &self,
        proxy: Option<&ProxyAddress>,
        open: O,
    ) -> Result<SessionLease<S>, AppError>
    where
        O: FnOnce(Option<&ProxyAddress>) -> Result<S, AppError>,
    {
        let key = {
            let mut state = self.lock_state();
            let key = match proxy {
                Some(address) => SessionKey {
                    proxy: Some(address.url()),
                    lane: 0,
                },
                None => {
                    let lane = state.next_lane % self.capacity;
                    state.next_lane = state.next_lane.wrapping_add(1);
                    SessionKey { proxy: None, lane }
                }
            };
            if let Some(lease) = self.reuse(&mut state, &key) {
                return Ok(lease);
            }
            key
        };

        let session = open(proxy)?;

        let mut state = self.lock_state();
        if let Some(lease) = self.reuse(&mut state, &key) {
            return Ok(lease);
        }
        state.clock += 1;
        let now = state.clock;

        if state.sessions.len() >= self.capacity {
            let idle_lru = state
                .sessions
                .iter()
                .filter(|(_, e)| e.active == 0)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match idle_lru {
                Some(evict) => {
                    state.sessions.remove(&evict);
                    tracing::debug!(proxy = ?evict.proxy, lane = evict.lane, "Evicted idle session");
                }
                None => {
                    return Ok(SessionLease {
                        session,
                        key: None,
                        state: Arc::clone(&self.state),
                    });
                }
            }
        }

        state.sessions.insert(
            key.clone(),
            SessionEntry {
                session: session.clone(),
                last_used: now,
                active: 1,
            },
        );
        Ok(SessionLease {
            session,
            key: Some(key),
            state: Arc::clone(&self.state),
        })
    }

    fn reuse(&self, state: &mut PoolState<S>, key: &SessionKey) -> Option<SessionLease<S>> {
        state.clock += 1;
        let now = state.clock;
        let entry = state.sessions.get_mut(key)?;
        entry.last_used = now;
        entry.active += 1;
        Some(SessionLease {
            session: entry.session.clone(),
            key: Some(key.clone()),
            state: Arc::clone(&self.state),
        })
    }
}

/// A checked-out session. Dropping it marks the cached entry idle again.
pub struct SessionLease<S> {
    session: S,
    /// `None` for uncached overflow sessions.
    key: Option<SessionKey>,
    state: Arc<Mutex<PoolState<S>>>,
}

impl<S> SessionLease<S> {
    pub fn session(&self) -> &S {
        &self.session
    }
}

impl<S> Drop for SessionLease<S> {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entry) = state.sessions.get_mut(&key) {
            entry.active = entry.active.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn proxy(host: &str) -> ProxyAddress {
        ProxyAddress::parse(&format!("{host}:8080")).unwrap()
    }

    #[test]
    fn test_reuses_session_per_proxy() {
        let opened = AtomicUsize::new(0);
        let pool: SessionPool<usize> = SessionPool::new(4);
        let open = |_: Option<&ProxyAddress>| Ok::<_, AppError>(opened.fetch_add(1, Ordering::SeqCst));

        let a1 = *pool.checkout(Some(&proxy("a.test")), open).unwrap().session();
        let a2 = *pool.checkout(Some(&proxy("a.test")), open).unwrap().session();
        let b = *pool.checkout(Some(&proxy("b.test")), open).unwrap().session();

        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_direct_sessions_round_robin_lanes() {
        let opened = AtomicUsize::new(0);
        let pool: SessionPool<usize> = SessionPool::new(2);
        let open = |_: Option<&ProxyAddress>| Ok::<_, AppError>(opened.fetch_add(1, Ordering::SeqCst));

        let ids: Vec<usize> = (0..4)
            .map(|_| *pool.checkout(None, open).unwrap().session())
            .collect();
        assert_eq!(ids, vec![0, 1, 0, 1]);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_evicts_least_recently_used_idle() {
        let opened = AtomicUsize::new(0);
        let pool: SessionPool<usize> = SessionPool::new(2);
        let open = |_: Option<&ProxyAddress>| Ok::<_, AppError>(opened.fetch_add(1, Ordering::SeqCst));

        drop(pool.checkout(Some(&proxy("a.test")), open).unwrap());
        drop(pool.checkout(Some(&proxy("b.test")), open).unwrap());
        drop(pool.checkout(Some(&proxy("a.test")), open).unwrap());
        // b is now least recently used
        drop(pool.checkout(Some(&proxy("c.test")), open).unwrap());
        assert_eq!(pool.len(), 2);

        let a = *pool.checkout(Some(&proxy("a.test")), open).unwrap().session();
        assert_eq!(a, 0, "a should still be cached");
        let b = *pool.checkout(Some(&proxy("b.test")), open).unwrap().session();
        assert_eq!(b, 3, "b should have been reopened");
    }

    #[test]
    fn test_busy_pool_hands_out_uncached_session() {
        let opened = AtomicUsize::new(0);
        let pool: SessionPool<usize> = SessionPool::new(1);
        let open = |_: Option<&ProxyAddress>| Ok::<_, AppError>(opened.fetch_add(1, Ordering::SeqCst));

        let held = pool.checkout(Some(&proxy("a.test")), open).unwrap();
        let overflow = pool.checkout(Some(&proxy("b.test")), open).unwrap();
        assert_eq!(*overflow.session(), 1);
        assert_eq!(pool.len(), 1);
        drop(overflow);
        drop(held);
    }

    #[test]
    fn test_open_runs_without_pool_lock() {
        let pool: SessionPool<usize> = SessionPool::new(2);
        let a = proxy("a.test");

        // A concurrent caller caches a session for the same proxy while this one opens.
        let lease = pool
            .checkout(Some(&a), |p| {
                let inner = pool.checkout(p, |_| Ok(7)).unwrap();
                assert_eq!(pool.len(), 1);
                drop(inner);
                Ok(8)
            })
            .unwrap();

        assert_eq!(*lease.session(), 7, "the session cached first wins");
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_open_error_propagates() {
        let pool: SessionPool<usize> = SessionPool::new(1);
        let result = pool.checkout(None, |_| Err(AppError::HttpError("tls".into())));
        assert!(matches!(result, Err(AppError::HttpError(_))));
        assert!(pool.is_empty());
    }
}
