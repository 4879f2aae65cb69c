//! Fencing token generation.
//!
//! A worker draws one token at construction and keeps it for its whole
//! lifetime; every state-changing repository call is gated on it, so a
//! worker that lost its lease cannot mutate the row.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

static LAST_TOKEN: AtomicI64 = AtomicI64::new(0);

/// Generate a lock token: wall-clock millis × 1000 plus a random suffix
/// in `0..1000`, forced strictly monotonic within this process.
///
/// Monotonic within a process, unique across processes with overwhelming
/// probability. Collisions would require two processes to draw the same
/// millisecond and the same suffix for the same row's lease window.
pub fn next_lock_token() -> i64 {
    let candidate = Utc::now().timestamp_millis() * 1000 + fastrand::i64(0..1000);
    let mut last = LAST_TOKEN.load(Ordering::Relaxed);
    loop {
        let next = candidate.max(last + 1);
        match LAST_TOKEN.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}
