//! Bounded control-message queue with latest-by-type coalescing.
//!
//! Settings traffic (resolution, scale, refresh rate, encoder settings) can
//! arrive in bursts while exactly one control message is dispatched at a
//! time. For those types only the newest value matters, so the queue keeps
//! a single slot per `(kind, stream)` and overwrites it in place. The slot
//! keeps its original queue position: dispatch order relative to
//! non-coalesced messages follows first arrival.

use std::collections::{HashMap, VecDeque};

use crate::messages::{Coalesce, CoalesceKey};

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 256;

enum Slot<M> {
    Direct(M),
    Coalesced(CoalesceKey),
}

pub struct ControlQueue<M> {
    entries: VecDeque<Slot<M>>,
    latest: HashMap<CoalesceKey, M>,
    capacity: usize,
}

impl<M: Coalesce> ControlQueue<M> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            latest: HashMap::new(),
            capacity,
        }
    }

    /// Enqueue a message. Returns the message back if the queue is full so
    /// the caller can log and drop it.
    pub fn push(&mut self, msg: M) -> Result<(), M> {
        match msg.coalesce_key() {
            Some(key) => {
                if self.latest.insert(key, msg).is_none() {
                    if self.entries.len() >= self.capacity {
                        // Undo the map insert; the queue itself is full.
                        let msg = self.latest.remove(&key).expect("just inserted");
                        return Err(msg);
                    }
                    self.entries.push_back(Slot::Coalesced(key));
                }
                Ok(())
            }
            None => {
                if self.entries.len() >= self.capacity {
                    return Err(msg);
                }
                self.entries.push_back(Slot::Direct(msg));
                Ok(())
            }
        }
    }

    /// Dequeue the next message in arrival order.
    pub fn pop(&mut self) -> Option<M> {
        match self.entries.pop_front()? {
            Slot::Direct(msg) => Some(msg),
            Slot::Coalesced(key) => Some(
                self.latest
                    .remove(&key)
                    .expect("coalesced slot always has a map entry"),
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<M: Coalesce> Default for ControlQueue<M> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
