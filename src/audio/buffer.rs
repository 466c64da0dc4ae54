//! Pooled byte buffers for outbound frame payloads.
//!
//! The pool is instance-owned (one per connection) rather than global;
//! buffers return themselves on drop.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

pub type SharedBytePool = Arc<BytePoolInner>;

pub struct BytePoolInner {
    pool: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_buffers: usize,
}

impl BytePoolInner {
    pub fn new(buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            pool: Mutex::new(Vec::with_capacity(16)),
            buffer_size,
            max_buffers: 64,
        })
    }

    pub fn acquire(self: &Arc<Self>) -> PooledBytes {
        let mut pool = self.pool.lock();

        let mut vec = pool
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_size));
        vec.clear();

        PooledBytes {
            vec,
            pool: Arc::clone(self),
        }
    }

    fn release(&self, mut vec: Vec<u8>) {
        let mut pool = self.pool.lock();

        if pool.len() < self.max_buffers {
            vec.clear();
            pool.push(vec);
        }
        // else: drop automatically
    }
}

pub struct PooledBytes {
    vec: Vec<u8>,
    pool: Arc<BytePoolInner>,
}

impl Deref for PooledBytes {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.vec
    }
}

impl DerefMut for PooledBytes {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.vec
    }
}

impl Drop for PooledBytes {
    fn drop(&mut self) {
        let vec = std::mem::take(&mut self.vec);
        self.pool.release(vec);
    }
}

impl std::fmt::Debug for PooledBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBytes")
            .field("len", &self.vec.len())
            .finish()
    }
}
