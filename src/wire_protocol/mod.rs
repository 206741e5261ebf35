//! Request/reply framing: a 16-byte header carrying the message length, a
//! request id and the `response_to` id a reply correlates with.
pub mod flags;
pub mod header;
pub mod operations;

pub use self::flags::{OpQueryFlags, OpReplyFlags};
pub use self::header::{Header, OpCode};
pub use self::operations::Message;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Hands out request ids. Clones share the same sequence.
#[derive(Clone, Debug, Default)]
pub struct RequestIds {
    next: Arc<AtomicI32>,
}

impl RequestIds {
    pub fn new() -> RequestIds {
        RequestIds::default()
    }

    /// Returns a unique operational request id.
    pub fn next(&self) -> i32 {
        self.next.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }
}
