//! Bus-scoped object pool.
//!
//! The bus recycles [`Envelope`](crate::Envelope)s and router
//! [`Context`](crate::router::Context)s to avoid an allocation per message.
//! Pooled values carry no identity: [`Recycle::recycle`] runs on every value
//! returned to the pool and must clear all state, nested collections
//! included, so nothing leaks from one message into the next.

use std::sync::{Mutex, PoisonError};

/// Values that can be cleared for reuse.
pub trait Recycle {
    /// Clear every field back to its empty state, keeping allocations.
    fn recycle(&mut self);
}

/// A bounded pool of reusable values.
#[derive(Debug)]
pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T> Pool<T>
where
    T: Recycle + Default,
{
    /// Create a pool keeping at most `capacity` idle values.
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Take an idle value, or allocate a fresh one.
    pub fn get(&self) -> T {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default()
    }

    /// Recycle a value and keep it for reuse, unless the pool is full.
    pub fn put(&self, mut value: T) {
        value.recycle();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.capacity {
            idle.push(value);
        }
    }

    /// Number of idle values.
    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
