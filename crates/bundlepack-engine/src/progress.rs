use std::sync::atomic::{AtomicU64, Ordering};

/// Overall progress shared by the cache and execute threads. Caching is
/// measured in bytes, execution in steps; each contributes half of the
/// combined percentage when both have work.
#[derive(Debug, Default)]
pub struct ApplyProgress {
    cache_total: AtomicU64,
    cache_done: AtomicU64,
    execute_total: AtomicU64,
    execute_done: AtomicU64,
}

impl ApplyProgress {
    pub fn new(cache_total: u64, execute_total: u64) -> Self {
        Self {
            cache_total: AtomicU64::new(cache_total),
            cache_done: AtomicU64::new(0),
            execute_total: AtomicU64::new(execute_total),
            execute_done: AtomicU64::new(0),
        }
    }

    pub fn add_cache_bytes(&self, bytes: u64) {
        self.cache_done.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn complete_execute_step(&self) {
        self.execute_done.fetch_add(1, Ordering::SeqCst);
    }

    pub fn cache_done(&self) -> u64 {
        self.cache_done.load(Ordering::SeqCst)
    }

    pub fn execute_done(&self) -> u64 {
        self.execute_done.load(Ordering::SeqCst)
    }

    pub fn overall_percent(&self) -> u8 {
        let cache = fraction(
            self.cache_done.load(Ordering::SeqCst),
            self.cache_total.load(Ordering::SeqCst),
        );
        let execute = fraction(
            self.execute_done.load(Ordering::SeqCst),
            self.execute_total.load(Ordering::SeqCst),
        );
        let combined = match (cache, execute) {
            (Some(cache), Some(execute)) => (cache + execute) / 2.0,
            (Some(only), None) | (None, Some(only)) => only,
            (None, None) => 1.0,
        };
        (combined * 100.0).round().clamp(0.0, 100.0) as u8
    }
}

fn fraction(done: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some((done.min(total)) as f64 / total as f64)
}
