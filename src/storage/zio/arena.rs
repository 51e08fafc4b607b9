//! Generation-checked storage for in-flight requests.
//!
//! Parent/child edges refer to requests by [`ZioId`] rather than by pointer.
//! A slot is reused only after its request has been destroyed, and reuse
//! bumps the generation, so a stale id can never reach the new occupant.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::request::ZioNode;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZioId {
    index: u32,
    generation: u32,
}

impl ZioId {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Debug for ZioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zio#{}.{}", self.index, self.generation)
    }
}

impl fmt::Display for ZioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct Slot {
    generation: u32,
    node: Option<Arc<ZioNode>>,
}

#[derive(Default)]
struct ArenaInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

#[derive(Default)]
pub(crate) struct ZioArena {
    inner: Mutex<ArenaInner>,
}

impl ZioArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reserves a slot and stores the node built for its id.
    pub(crate) fn insert(&self, build: impl FnOnce(ZioId) -> ZioNode) -> Arc<ZioNode> {
        let mut inner = self.inner.lock();
        let id = match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                ZioId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = inner.slots.len() as u32;
                inner.slots.push(Slot {
                    generation: 0,
                    node: None,
                });
                ZioId {
                    index,
                    generation: 0,
                }
            }
        };
        let node = Arc::new(build(id));
        inner.slots[id.index as usize].node = Some(Arc::clone(&node));
        inner.live += 1;
        node
    }

    pub(crate) fn get(&self, id: ZioId) -> Option<Arc<ZioNode>> {
        let inner = self.inner.lock();
        let slot = inner.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.clone()
    }

    /// Destroys a request. Returns `None` if it was already gone.
    pub(crate) fn remove(&self, id: ZioId) -> Option<Arc<ZioNode>> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        inner.free.push(id.index);
        inner.live -= 1;
        Some(node)
    }

    pub(crate) fn live(&self) -> usize {
        self.inner.lock().live
    }

    pub(crate) fn ids(&self) -> Vec<ZioId> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.node.is_some())
            .map(|(i, slot)| ZioId {
                index: i as u32,
                generation: slot.generation,
            })
            .collect()
    }
}
