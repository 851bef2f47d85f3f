//! Node Arena
//!
//! Nodes live in a slab addressed by generation-checked keys. Edges and
//! registrations refer to nodes only through [`NodeKey`], so a key that
//! outlives its node simply fails to resolve instead of dangling.

use std::sync::Arc;

use super::node::NodeCell;

/// Generation-checked handle to a slot in the arena.
///
/// The index orders lock acquisition when two nodes must be locked at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    index: u32,
    generation: u32,
}

impl NodeKey {
    /// Slot index of this key.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when this key was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    cell: Option<Arc<NodeCell>>,
}

/// Slab of node cells with a free list.
#[derive(Debug, Default)]
pub(crate) struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Arena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reserve a key for a node that is about to be built.
    ///
    /// The cell needs its own key at construction time, so insertion is split
    /// into `reserve` and `fill`.
    pub(crate) fn reserve(&mut self) -> NodeKey {
        match self.free.pop() {
            Some(index) => {
                let slot = &self.slots[index as usize];
                NodeKey {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    cell: None,
                });
                NodeKey {
                    index,
                    generation: 0,
                }
            }
        }
    }

    /// Place a cell into a previously reserved slot.
    pub(crate) fn fill(&mut self, key: NodeKey, cell: Arc<NodeCell>) {
        if let Some(slot) = self.slots.get_mut(key.index as usize) {
            if slot.generation == key.generation && slot.cell.is_none() {
                slot.cell = Some(cell);
                self.live += 1;
            }
        }
    }

    /// Resolve a key, failing if the slot was released since the key was issued.
    pub(crate) fn get(&self, key: NodeKey) -> Option<&Arc<NodeCell>> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.cell.as_ref())
    }

    /// Remove the cell behind `key` and bump the slot generation.
    ///
    /// The caller drops the returned cell after releasing the arena lock:
    /// dropping it may run rule closures that release further nodes.
    pub(crate) fn remove(&mut self, key: NodeKey) -> Option<Arc<NodeCell>> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let cell = slot.cell.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.live -= 1;
        Some(cell)
    }

    /// Number of live nodes.
    pub(crate) fn len(&self) -> usize {
        self.live
    }

    /// Iterate over live cells.
    pub(crate) fn cells(&self) -> impl Iterator<Item = &Arc<NodeCell>> {
        self.slots.iter().filter_map(|slot| slot.cell.as_ref())
    }
}
