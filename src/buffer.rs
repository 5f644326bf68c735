//! Byte buffers shared with the script engine without copying.
//!
//! A binary HTTP body arrives as a reference-counted [`Bytes`]. When the engine
//! wraps it in a script-visible buffer it registers the bytes here and gets a
//! [`BufferId`] plus a stable pointer into the same allocation. The ledger
//! keeps the bytes alive until the engine reports that its buffer was
//! finalised. A second release of the same id is ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::warn;

/// Handle of a shared buffer. `0` is never issued.
pub type BufferId = u64;

/// A buffer lent to the engine.
#[derive(Debug, Clone)]
pub struct SharedBuffer {
    pub id: BufferId,
    pub ptr: *const u8,
    pub len: usize,
}

/// Owner of every buffer currently lent to the engine.
#[derive(Clone, Default)]
pub struct BufferLedger {
    inner: Arc<LedgerInner>,
}

#[derive(Default)]
struct LedgerInner {
    next_id: AtomicU64,
    live: Mutex<HashMap<BufferId, Bytes>>,
}

impl BufferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `bytes` alive until [`release`](Self::release) and expose its memory.
    pub fn share(&self, bytes: Bytes) -> SharedBuffer {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let buffer = SharedBuffer {
            id,
            ptr: bytes.as_ptr(),
            len: bytes.len(),
        };
        self.inner.live.lock().insert(id, bytes);
        buffer
    }

    /// Drop the ledger's reference. Returns false for unknown or released ids.
    pub fn release(&self, id: BufferId) -> bool {
        match self.inner.live.lock().remove(&id) {
            Some(_) => true,
            None => {
                warn!(target: "runtime", "release of unknown buffer {}", id);
                false
            }
        }
    }

    /// Number of buffers still held for the engine.
    pub fn outstanding(&self) -> usize {
        self.inner.live.lock().len()
    }
}
