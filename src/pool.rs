//! Keyed single-flight handler pool
//!
//! Maps a key (account identity) to exactly one lazily constructed value.
//! Concurrent first-time callers for the same key await a single in-flight
//! construction instead of racing; different keys never wait on each other.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;

/// A constructed pool value and its creation time
#[derive(Debug, Clone)]
pub struct PoolEntry<H> {
    pub handler: H,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a pool lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    /// The value already existed and was returned as-is
    Reused,
    /// This call constructed the value
    Created,
}

type Slot<H> = Arc<OnceCell<PoolEntry<H>>>;

/// Get-or-create pool keyed by string
///
/// The map lock guards bookkeeping only and is never held across an
/// `.await`; construction runs inside the per-key `OnceCell`.
#[derive(Debug)]
pub struct KeyedPool<H> {
    slots: Mutex<BTreeMap<String, Slot<H>>>,
}

impl<H> Default for KeyedPool<H> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<H: Clone> KeyedPool<H> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Slot<H>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the pooled value for `key`, constructing it with `init` if absent
    ///
    /// When several callers miss at once, one runs `init` and the others
    /// await its result. A failed construction leaves the key empty, so the
    /// next caller retries.
    pub async fn get_or_try_init<F, Fut, E>(&self, key: &str, init: F) -> Result<(H, PoolEvent), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<H, E>>,
    {
        let slot = {
            let mut slots = self.lock();
            if let Some(entry) = slots.get(key).and_then(|slot| slot.get()) {
                return Ok((entry.handler.clone(), PoolEvent::Reused));
            }
            Arc::clone(slots.entry(key.to_owned()).or_default())
        };

        let created = AtomicBool::new(false);
        let created_flag = &created;
        let entry = slot
            .get_or_try_init(|| async move {
                created_flag.store(true, Ordering::Release);
                init().await.map(|handler| PoolEntry {
                    handler,
                    created_at: Utc::now(),
                })
            })
            .await?;

        let event = if created.load(Ordering::Acquire) {
            PoolEvent::Created
        } else {
            PoolEvent::Reused
        };
        Ok((entry.handler.clone(), event))
    }

    /// Pooled value for `key`, without constructing one
    pub fn get(&self, key: &str) -> Option<H> {
        self.lock()
            .get(key)
            .and_then(|slot| slot.get())
            .map(|entry| entry.handler.clone())
    }

    /// Number of constructed entries
    pub fn len(&self) -> usize {
        self.lock().values().filter(|slot| slot.initialized()).count()
    }

    /// Keys and creation times of constructed entries, in key order
    pub fn snapshot(&self) -> Vec<(String, DateTime<Utc>)> {
        self.lock()
            .iter()
            .filter_map(|(key, slot)| slot.get().map(|entry| (key.clone(), entry.created_at)))
            .collect()
    }

    /// Remove every entry in one step and return the constructed ones
    ///
    /// Slots whose construction is still in flight are awaited, so every
    /// value handed out before the drain is also returned by it. Slots left
    /// empty by a failed construction are dropped.
    pub async fn drain(&self) -> Vec<(String, H)> {
        let slots = std::mem::take(&mut *self.lock());
        let mut drained = Vec::with_capacity(slots.len());
        for (key, slot) in slots {
            // waits out a running init; an idle empty slot resolves to Err
            let settled = slot
                .get_or_try_init(|| std::future::ready(Err::<PoolEntry<H>, ()>(())))
                .await;
            if let Ok(entry) = settled {
                drained.push((key, entry.handler.clone()));
            }
        }
        drained
    }
}
