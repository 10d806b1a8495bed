mod header;
mod message;
#[cfg(test)]
mod test;

use std::sync::atomic::{AtomicI32, Ordering};

pub(crate) use self::message::{Message, MessageFlags, MessageSection};

/// The maximum message size accepted before the handshake has reported the
/// server's actual limit.
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Returns a new, process-unique request ID. IDs are monotone within the
/// process and wrap back to 1 on overflow.
pub(crate) fn next_request_id() -> i32 {
    REQUEST_ID
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
            Some(if id == i32::MAX { 1 } else { id + 1 })
        })
        .unwrap_or(1)
}
