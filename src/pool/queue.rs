//! Bounded queue of idle workers with checkpoint-preferential dequeue.
//!
//! Entries live in a fixed-size ring buffer. A dequeue may ask for an
//! entry with a given affinity key; the first matching entry is removed out
//! of order and the entries in front of it are shifted back by one slot so
//! the remaining order is still FIFO.
//!
//! Waiting is done on a semaphore whose permit count always equals the
//! number of queued entries: a permit is added after an entry is pushed and
//! forgotten before one is removed. This makes `take` cancel-safe and lets
//! `poll_timeout` wrap it in `tokio::time::timeout`.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Semaphore, TryAcquireError};

/// An entry that may be preferred by a dequeue.
pub trait Affine {
    type Key: ?Sized;

    /// Whether the entry is already associated with `key`.
    fn has_affinity(&self, key: &Self::Key) -> bool;
}

struct Ring<T> {
    slots: Vec<Option<T>>,
    head: usize,
    count: usize,
    /// Consecutive out-of-order dequeues.
    streak: usize,
}

impl<T: Affine> Ring<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            count: 0,
            streak: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn physical(&self, offset: usize) -> usize {
        (self.head + offset) % self.capacity()
    }

    fn push(&mut self, item: T) -> Result<(), T> {
        if self.count == self.capacity() {
            return Err(item);
        }
        let tail = self.physical(self.count);
        self.slots[tail] = Some(item);
        self.count += 1;
        Ok(())
    }

    fn position(&self, key: &T::Key) -> Option<usize> {
        (0..self.count).find(|&offset| {
            self.slots[self.physical(offset)]
                .as_ref()
                .is_some_and(|item| item.has_affinity(key))
        })
    }

    fn select(&mut self, preferred: Option<&T::Key>, streak_limit: usize) -> Option<T> {
        if self.count == 0 {
            return None;
        }

        let capped = streak_limit > 0 && self.streak >= streak_limit;
        let offset = match preferred {
            Some(key) if !capped => self.position(key).unwrap_or(0),
            _ => 0,
        };

        if offset > 0 {
            self.streak += 1;
        } else {
            self.streak = 0;
        }

        self.remove_at(offset)
    }

    /// Removes the entry `offset` places behind the head, shifting the
    /// entries in front of it one slot towards the tail.
    fn remove_at(&mut self, offset: usize) -> Option<T> {
        let removed = self.physical(offset);
        let item = self.slots[removed].take();

        for i in (0..offset).rev() {
            let from = self.physical(i);
            let to = self.physical(i + 1);
            self.slots[to] = self.slots[from].take();
        }

        self.head = self.physical(1);
        self.count -= 1;
        item
    }
}

/// Bounded, lock-protected queue with affinity-aware dequeue.
pub struct AffinityQueue<T> {
    ring: Mutex<Ring<T>>,
    available: Semaphore,
    streak_limit: usize,
}

impl<T: Affine> AffinityQueue<T> {
    /// Creates a queue holding at most `capacity` entries.
    ///
    /// After `streak_limit` consecutive out-of-order dequeues the next one
    /// is served from the head regardless of preference; `0` disables the
    /// cap.
    pub fn new(capacity: usize, streak_limit: usize) -> Self {
        Self {
            ring: Mutex::new(Ring::with_capacity(capacity)),
            available: Semaphore::new(0),
            streak_limit,
        }
    }

    fn ring(&self) -> MutexGuard<'_, Ring<T>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `item` at the tail. Returns it back when the queue is full
    /// or closed.
    pub fn offer(&self, item: T) -> Result<(), T> {
        let mut ring = self.ring();
        if self.available.is_closed() {
            return Err(item);
        }
        ring.push(item)?;
        drop(ring);
        self.available.add_permits(1);
        Ok(())
    }

    /// Waits for an entry. Returns `None` once the queue is closed.
    pub async fn take(&self, preferred: Option<&T::Key>) -> Option<T> {
        let permit = self.available.acquire().await.ok()?;
        permit.forget();
        self.ring().select(preferred, self.streak_limit)
    }

    /// Like [`take`](Self::take), giving up after `timeout`.
    pub async fn poll_timeout(&self, preferred: Option<&T::Key>, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.take(preferred))
            .await
            .ok()
            .flatten()
    }

    /// Removes the head without waiting. Still drains a closed queue.
    pub fn poll(&self) -> Option<T> {
        match self.available.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(TryAcquireError::Closed) => {}
            Err(TryAcquireError::NoPermits) => return None,
        }
        self.ring().select(None, self.streak_limit)
    }

    /// Rejects further offers and wakes every waiter with `None`. Queued
    /// entries stay available to [`poll`](Self::poll).
    pub fn close(&self) {
        let _ring = self.ring();
        self.available.close();
    }

    pub fn is_closed(&self) -> bool {
        self.available.is_closed()
    }

    pub fn len(&self) -> usize {
        self.ring().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring().capacity()
    }
}
