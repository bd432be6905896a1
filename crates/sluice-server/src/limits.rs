use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::store::TokenId;

/// Caps how many tunnels a single token may hold at once
pub struct ConcurrencyLimiter {
    active: Mutex<HashMap<TokenId, usize>>,
}

impl ConcurrencyLimiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Take a slot for `token_id` if fewer than `max_active` are held
    ///
    /// A `max_active` or `token_id` of zero or less means unlimited; the
    /// returned slot is then inert.
    pub fn try_acquire(self: &Arc<Self>, token_id: TokenId, max_active: i64) -> Option<TunnelSlot> {
        if max_active <= 0 || token_id <= 0 {
            return Some(TunnelSlot::unlimited());
        }

        let mut active = self.active.lock();
        let count = active.entry(token_id).or_insert(0);
        if *count as i64 >= max_active {
            return None;
        }
        *count += 1;

        Some(TunnelSlot {
            limiter: Some(self.clone()),
            token_id,
            released: AtomicBool::new(false),
        })
    }

    /// Number of slots currently held by `token_id`
    pub fn active(&self, token_id: TokenId) -> usize {
        self.active.lock().get(&token_id).copied().unwrap_or(0)
    }

    fn release(&self, token_id: TokenId) {
        let mut active = self.active.lock();
        match active.get_mut(&token_id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                active.remove(&token_id);
            }
            None => {}
        }
    }
}

/// A held concurrency slot; released on drop or by [`TunnelSlot::release`]
pub struct TunnelSlot {
    limiter: Option<Arc<ConcurrencyLimiter>>,
    token_id: TokenId,
    released: AtomicBool,
}

impl TunnelSlot {
    fn unlimited() -> Self {
        Self {
            limiter: None,
            token_id: 0,
            released: AtomicBool::new(false),
        }
    }

    /// Give the slot back; only the first call has any effect
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(limiter) = &self.limiter {
            limiter.release(self.token_id);
        }
    }
}

impl Drop for TunnelSlot {
    fn drop(&mut self) {
        self.release();
    }
}
