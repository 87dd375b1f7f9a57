//! Position book and cool-down records
//!
//! The book is the one piece of state shared across every source's polling
//! cycle, so each operation is a single critical section: add-if-absent,
//! take-on-close and the cool-down add/check cannot interleave between two
//! cycles racing on the same source pair.
//!
//! Source-pair matching is unordered everywhere, for uniqueness and for
//! cool-downs alike: (A, B) occupies the same slot as (B, A).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use tracing::debug;

use crate::engine::position::Position;
use crate::types::{Pair, Source};

#[derive(Debug, Clone)]
struct Cooldown {
    short_source: Source,
    long_source: Source,
    pair: Pair,
    until_ms: i64,
}

fn same_unordered(a1: Source, b1: Source, a2: Source, b2: Source) -> bool {
    (a1 == a2 && b1 == b2) || (a1 == b2 && b1 == a2)
}

#[derive(Default)]
struct BookInner {
    live: HashMap<u64, Position>,
    cooldowns: Vec<Cooldown>,
}

pub struct PositionBook {
    inner: Mutex<BookInner>,
    next_id: AtomicU64,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BookInner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Insert a position unless an equivalent one (same pair, same unordered
    /// source set) is already live. Assigns the id on success.
    pub fn try_add(&self, mut position: Position) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap();
        let (a, b) = position.sources();
        let duplicate = inner.live.values().any(|existing| {
            let (ea, eb) = existing.sources();
            existing.pair == position.pair && same_unordered(a, b, ea, eb)
        });
        if duplicate {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        position.id = id;
        inner.live.insert(id, position);
        Some(id)
    }

    /// True if an equivalent position is already live (cheap pre-check; the
    /// authoritative check is inside [`try_add`]).
    pub fn has_equivalent(&self, a: Source, b: Source, pair: &Pair) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.live.values().any(|existing| {
            let (ea, eb) = existing.sources();
            existing.pair == *pair && same_unordered(a, b, ea, eb)
        })
    }

    pub fn get(&self, id: u64) -> Option<Position> {
        self.inner.lock().unwrap().live.get(&id).cloned()
    }

    /// Ids of live positions with either leg on `source`
    pub fn positions_touching(&self, source: Source) -> Vec<u64> {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<u64> = inner
            .live
            .values()
            .filter(|p| p.touches(source))
            .map(|p| p.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// How many live positions reference each of the two sources, in either
    /// leg role. Used to cap parallel exposure per source.
    pub fn count_by_leg(&self, source_a: Source, source_b: Source) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        let count_a = inner.live.values().filter(|p| p.touches(source_a)).count();
        let count_b = inner.live.values().filter(|p| p.touches(source_b)).count();
        (count_a, count_b)
    }

    /// Remove and return a live position. `None` means it was already taken;
    /// the caller treats that as a logged no-op, not an error.
    pub fn take(&self, id: u64) -> Option<Position> {
        self.inner.lock().unwrap().live.remove(&id)
    }

    /// Apply a mutation to a live position, if it still exists.
    pub fn with_position_mut<F>(&self, id: u64, mutate: F) -> bool
    where
        F: FnOnce(&mut Position),
    {
        let mut inner = self.inner.lock().unwrap();
        match inner.live.get_mut(&id) {
            Some(position) => {
                mutate(position);
                true
            }
            None => false,
        }
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live_count() == 0
    }

    // ── Cool-downs ─────────────────────────────────────────────

    pub fn add_cooldown(&self, short_source: Source, long_source: Source, pair: &Pair, until_ms: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.cooldowns.push(Cooldown {
            short_source,
            long_source,
            pair: pair.clone(),
            until_ms,
        });
    }

    /// Check for an active cool-down on the unordered source pair, lazily
    /// evicting it once expired.
    pub fn has_cooldown(&self, source_a: Source, source_b: Source, pair: &Pair) -> bool {
        self.has_cooldown_at(source_a, source_b, pair, Utc::now().timestamp_millis())
    }

    pub(crate) fn has_cooldown_at(
        &self,
        source_a: Source,
        source_b: Source,
        pair: &Pair,
        now_ms: i64,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let mut active = false;
        inner.cooldowns.retain(|cd| {
            let matches = cd.pair == *pair
                && same_unordered(source_a, source_b, cd.short_source, cd.long_source);
            if !matches {
                return true;
            }
            if now_ms >= cd.until_ms {
                // Expired: evict on lookup
                return false;
            }
            active = true;
            true
        });
        if active {
            debug!(pair = %pair, source_a = %source_a, source_b = %source_b, "Source pair in cool-down");
        }
        active
    }

    pub fn cooldown_count(&self) -> usize {
        self.inner.lock().unwrap().cooldowns.len()
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}
