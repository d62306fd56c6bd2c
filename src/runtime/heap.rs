//! Object heap.
//!
//! Objects live in a generational arena and are referred to by opaque
//! handles packed into an ordinary 64-bit value cell:
//!
//! ```text
//!  63  62  61 ........ 56  55 ............ 24  23 .......... 0
//!  0   1   0 .......... 0  generation (32)    slot index (24)
//! ```
//!
//! A value is a pointer only if it decodes to a live slot of the same
//! generation, so a freed handle (or an integer that happens to look like
//! one) is never mistaken for a live object.

const TAG: i64 = 1 << 62;
const INDEX_BITS: u32 = 24;
const INDEX_MASK: i64 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: i64 = 0xFFFF_FFFF << INDEX_BITS;
const HANDLE_BITS: i64 = TAG | GENERATION_MASK | INDEX_MASK;

/// Largest object, header included, in cells.
pub const MAX_OBJECT_CELLS: usize = 1 << 24;

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    cells: Option<Vec<i64>>,
}

#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<usize>,
    live: usize,
}

fn encode(index: usize, generation: u32) -> i64 {
    TAG | ((generation as i64) << INDEX_BITS) | index as i64
}

fn decode(value: i64) -> Option<(usize, u32)> {
    if value & TAG == 0 || value & !HANDLE_BITS != 0 {
        return None;
    }
    let index = (value & INDEX_MASK) as usize;
    let generation = ((value & GENERATION_MASK) >> INDEX_BITS) as u32;
    Some((index, generation))
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `cells` zeroed cells (at least one) with `class` in cell 0.
    /// Returns `None` once every slot index is in use, or when the block is
    /// larger than [`MAX_OBJECT_CELLS`] or cannot be reserved.
    pub fn allocate(&mut self, cells: usize, class: i64) -> Option<i64> {
        let cells = cells.max(1);
        if cells > MAX_OBJECT_CELLS {
            return None;
        }
        let mut block = Vec::new();
        block.try_reserve_exact(cells).ok()?;
        block.resize(cells, 0);
        block[0] = class;

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() > INDEX_MASK as usize {
                    return None;
                }
                self.slots.push(Slot {
                    generation: 1,
                    cells: None,
                });
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[index];
        slot.cells = Some(block);
        self.live += 1;
        Some(encode(index, slot.generation))
    }

    fn slot(&self, value: i64) -> Option<&Slot> {
        let (index, generation) = decode(value)?;
        self.slots
            .get(index)
            .filter(|slot| slot.generation == generation && slot.cells.is_some())
    }

    pub fn is_pointer(&self, value: i64) -> bool {
        self.slot(value).is_some()
    }

    pub fn get(&self, ptr: i64) -> Option<&[i64]> {
        self.slot(ptr).and_then(|slot| slot.cells.as_deref())
    }

    pub fn get_mut(&mut self, ptr: i64) -> Option<&mut [i64]> {
        let (index, generation) = decode(ptr)?;
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.cells.as_deref_mut()
    }

    /// Release the object behind `ptr`. Returns false if `ptr` is not live.
    pub fn free(&mut self, ptr: i64) -> bool {
        let Some((index, generation)) = decode(ptr) else {
            return false;
        };
        let Some(slot) = self.slots.get_mut(index) else {
            return false;
        };
        if slot.generation != generation || slot.cells.is_none() {
            return false;
        }

        slot.cells = None;
        slot.generation = slot.generation.checked_add(1).unwrap_or(1);
        self.free.push(index);
        self.live -= 1;
        true
    }

    /// Objects allocated and not yet freed.
    pub fn live(&self) -> usize {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_sets_class_header() {
        let mut heap = Heap::new();
        let ptr = heap.allocate(3, 5).unwrap();
        assert!(heap.is_pointer(ptr));
        assert_eq!(heap.get(ptr), Some(&[5, 0, 0][..]));
        assert_eq!(heap.live(), 1);
    }

    #[test]
    fn test_plain_integers_are_not_pointers() {
        let mut heap = Heap::new();
        heap.allocate(1, 0).unwrap();
        for value in [0, 1, -1, 42, i64::MAX, i64::MIN] {
            assert!(!heap.is_pointer(value), "{} mistaken for a pointer", value);
        }
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut heap = Heap::new();
        let first = heap.allocate(2, 0).unwrap();
        assert!(heap.free(first));
        let second = heap.allocate(2, 1).unwrap();

        assert_ne!(first, second);
        assert!(!heap.is_pointer(first));
        assert!(heap.get_mut(first).is_none());
        assert!(!heap.free(first));
        assert_eq!(heap.get(second).map(|cells| cells[0]), Some(1));
        assert_eq!(heap.live(), 1);
    }

    #[test]
    fn test_double_free_is_rejected() {
        let mut heap = Heap::new();
        let ptr = heap.allocate(1, 0).unwrap();
        assert!(heap.free(ptr));
        assert!(!heap.free(ptr));
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn test_oversized_block_is_refused() {
        let mut heap = Heap::new();
        assert_eq!(heap.allocate(MAX_OBJECT_CELLS + 1, 0), None);
        assert_eq!(heap.allocate(usize::MAX, 0), None);
        assert_eq!(heap.live(), 0);
        assert!(heap.allocate(4, 0).is_some());
    }

    #[test]
    fn test_zero_cells_still_holds_header() {
        let mut heap = Heap::new();
        let ptr = heap.allocate(0, 9).unwrap();
        assert_eq!(heap.get(ptr), Some(&[9][..]));
    }
}
