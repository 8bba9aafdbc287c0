use std::sync::atomic::{AtomicI32, Ordering};

static REQUEST_ID: AtomicI32 = AtomicI32::new(0);

/// Obtain a new, unique request ID.
pub(crate) fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}
