#![forbid(unsafe_code)]

//! Bounded pool of fixed-capacity reassembly buffers shared by every session of a gateway.
//!
//! Free buffers travel through a bounded `crossbeam-channel`, so `acquire` and `release` from
//! independent sessions never contend on a lock. A [`Slot`] returns its buffer to the pool when
//! released or dropped, whichever comes first.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{bounded, Receiver, Sender};
use relay_core::BufferConfig;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("no free reassembly slot for stream {stream_id}")]
    Exhausted { stream_id: u64 },
    #[error("slot overflow: capacity={capacity}, offset={offset}, requested={requested}")]
    Overflow { capacity: usize, offset: usize, requested: usize },
}

#[derive(Debug)]
struct PoolInner {
    free_tx: Sender<BytesMut>,
    free_rx: Receiver<BytesMut>,
    slot_capacity: usize,
    slot_count: usize,
    in_use: AtomicUsize,
}

/// Cloneable handle to the shared pool.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(slot_count: usize, slot_capacity: usize) -> Self {
        let (free_tx, free_rx) = bounded(slot_count);
        for _ in 0..slot_count {
            // Capacity of the channel equals the number of buffers pushed.
            let _ = free_tx.try_send(BytesMut::with_capacity(slot_capacity));
        }
        debug!("reassembly pool ready: {} slots of {} bytes", slot_count, slot_capacity);
        Self {
            inner: Arc::new(PoolInner {
                free_tx,
                free_rx,
                slot_capacity,
                slot_count,
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    pub fn from_config(config: &BufferConfig) -> Self {
        Self::new(config.slot_count, config.slot_capacity)
    }

    /// Lease a slot bound to `stream_id`.
    pub fn acquire(&self, stream_id: u64) -> Result<Slot, PoolError> {
        let buf = self.inner.free_rx.try_recv().map_err(|_| PoolError::Exhausted { stream_id })?;
        self.inner.in_use.fetch_add(1, Ordering::AcqRel);
        trace!("slot acquired for stream {}", stream_id);
        Ok(Slot {
            stream_id,
            capacity: self.inner.slot_capacity,
            buf: Some(buf),
            pool: self.inner.clone(),
        })
    }

    pub fn slot_capacity(&self) -> usize {
        self.inner.slot_capacity
    }

    pub fn slot_count(&self) -> usize {
        self.inner.slot_count
    }

    /// Slots currently leased.
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.inner.slot_count.saturating_sub(self.in_use())
    }
}

/// A leased buffer holding one partial protocol unit.
#[derive(Debug)]
pub struct Slot {
    stream_id: u64,
    capacity: usize,
    buf: Option<BytesMut>,
    pool: Arc<PoolInner>,
}

impl Slot {
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently held.
    pub fn offset(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    pub fn is_released(&self) -> bool {
        self.buf.is_none()
    }

    /// Append `data`, failing without writing anything if it would not fit.
    pub fn append(&mut self, data: &[u8]) -> Result<usize, PoolError> {
        let offset = self.offset();
        let buf = match self.buf.as_mut() {
            Some(buf) if offset + data.len() <= self.capacity => buf,
            _ => {
                return Err(PoolError::Overflow {
                    capacity: self.capacity,
                    offset,
                    requested: data.len(),
                });
            }
        };
        buf.extend_from_slice(data);
        Ok(buf.len())
    }

    /// Copy out the accumulated unit and empty the slot for reuse.
    pub fn take(&mut self) -> Bytes {
        match self.buf.as_mut() {
            Some(buf) => {
                let unit = Bytes::copy_from_slice(buf);
                buf.clear();
                unit
            }
            None => Bytes::new(),
        }
    }

    /// Return the buffer to the pool. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.clear();
            let _ = self.pool.free_tx.try_send(buf);
            self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
            trace!("slot released for stream {}", self.stream_id);
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = BufferPool::new(2, 16);
        let a = pool.acquire(1).unwrap();
        let _b = pool.acquire(3).unwrap();
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.acquire(5).unwrap_err(), PoolError::Exhausted { stream_id: 5 });
        drop(a);
        assert_eq!(pool.in_use(), 1);
        assert!(pool.acquire(5).is_ok());
    }

    #[test]
    fn test_append_overflow_leaves_slot_intact() {
        let pool = BufferPool::new(1, 8);
        let mut slot = pool.acquire(1).unwrap();
        assert_eq!(slot.append(b"abcde").unwrap(), 5);
        let err = slot.append(b"fghi").unwrap_err();
        assert_eq!(err, PoolError::Overflow { capacity: 8, offset: 5, requested: 4 });
        assert_eq!(slot.offset(), 5);
        assert_eq!(slot.append(b"fgh").unwrap(), 8);
        assert_eq!(&slot.take()[..], b"abcdefgh");
        assert_eq!(slot.offset(), 0);
    }

    #[test]
    fn test_release_idempotent() {
        let pool = BufferPool::new(1, 8);
        let mut slot = pool.acquire(1).unwrap();
        slot.append(b"xy").unwrap();
        slot.release();
        slot.release();
        assert!(slot.is_released());
        assert_eq!(pool.in_use(), 0);
        assert!(slot.append(b"z").is_err());
        drop(slot);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.available(), 1);
        // recycled buffer comes back empty
        let slot = pool.acquire(2).unwrap();
        assert_eq!(slot.offset(), 0);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = BufferPool::new(4, 32);
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Ok(mut slot) = pool.acquire(i) {
                            slot.append(&[i as u8; 8]).unwrap();
                            assert_eq!(slot.offset(), 8);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_from_config() {
        let pool = BufferPool::from_config(&BufferConfig { slot_capacity: 64, slot_count: 1 });
        assert_eq!(pool.slot_capacity(), 64);
        assert_eq!(pool.slot_count(), 1);
    }
}
