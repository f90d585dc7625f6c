//! Sliding compaction.
//!
//! Live blocks are slid towards the start of the arena in address order,
//! leaving one trailing free block. Handles stay valid because only the
//! table's stored header index changes, never the handle itself.

use log::info;

use crate::{Arena, HandleTable};

/// Compacts `arena` and rewrites `table` to match. Returns the number of
/// blocks that moved.
///
/// Both structures must be locked by the caller for the whole call; nothing
/// may observe the arena between the passes, when live footers hold
/// relocation records instead of tags.
pub fn compact(table: &mut HandleTable, arena: &mut Arena) -> usize {
    let before = arena.free_stats();

    // 1. offset pass
    arena.stage_relocations();

    // 2. table fix-up pass
    let moved = table.rebind_all(|word| arena.relocation(word));

    // 3. slide pass
    arena.slide();

    info!(
        "compact: moved {} blocks, merged {} free blocks into {} words",
        moved, before.blocks, before.total_words
    );
    moved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Shape, ValueType, arena::FIRST_BLOCK};

    const INT: Shape = Shape::Scalar(ValueType::Int);

    fn arr(width: usize) -> Shape {
        Shape::Array {
            ty: ValueType::Int,
            width,
        }
    }

    fn create(table: &mut HandleTable, arena: &mut Arena, shape: Shape) -> crate::Handle {
        let word = arena.reserve(shape.bytes().unwrap()).unwrap();
        table.alloc(word, 0, shape).unwrap()
    }

    fn free(table: &mut HandleTable, arena: &mut Arena, handle: crate::Handle) {
        let word = table.free(handle.index());
        arena.release(word);
    }

    #[test]
    fn compaction_scenario_136_bytes() {
        let mut arena = Arena::new(136);
        let mut table = HandleTable::new(16);

        let p1 = create(&mut table, &mut arena, INT);
        let p2 = create(&mut table, &mut arena, INT);
        let arr1 = create(&mut table, &mut arena, arr(10));
        let p3 = create(&mut table, &mut arena, INT);
        let p4 = create(&mut table, &mut arena, INT);
        let arr2 = create(&mut table, &mut arena, arr(10));
        // exactly full
        assert_eq!(arena.free_words(), 0);

        arena.payload_mut(table.resolve(p3).unwrap().word)[0] = 42;
        arena.payload_mut(table.resolve(arr2).unwrap().word)[9] = 99;

        free(&mut table, &mut arena, p1);
        free(&mut table, &mut arena, p2);
        free(&mut table, &mut arena, p4);
        assert_eq!(arena.free_blocks(), 2);

        let moved = compact(&mut table, &mut arena);
        assert_eq!(moved, 3);

        let a1 = table.resolve(arr1).unwrap().word;
        let w3 = table.resolve(p3).unwrap().word;
        let a2 = table.resolve(arr2).unwrap().word;
        assert_eq!(a1, FIRST_BLOCK);
        assert_eq!(w3, FIRST_BLOCK + 12);
        assert_eq!(a2, FIRST_BLOCK + 15);

        let blocks: Vec<_> = arena.blocks().collect();
        assert_eq!(blocks.len(), 4);
        assert!(blocks[..3].iter().all(|b| !b.free));
        assert!(blocks[3].free);
        assert_eq!(blocks[3].word, FIRST_BLOCK + 27);
        // three freed ints of 3 words each
        assert_eq!(blocks[3].words, 9);

        assert_eq!(arena.payload(w3)[0], 42);
        assert_eq!(arena.payload(a2)[9], 99);
        arena.verify().unwrap();
    }

    #[test]
    fn compacting_twice_is_a_no_op() {
        let mut arena = Arena::new(256);
        let mut table = HandleTable::new(16);
        let a = create(&mut table, &mut arena, INT);
        let b = create(&mut table, &mut arena, arr(4));
        free(&mut table, &mut arena, a);

        assert_eq!(compact(&mut table, &mut arena), 1);
        let word = table.resolve(b).unwrap().word;
        assert_eq!(compact(&mut table, &mut arena), 0);
        assert_eq!(table.resolve(b).unwrap().word, word);
        arena.verify().unwrap();
    }

    #[test]
    fn unmarked_values_move_too() {
        let mut arena = Arena::new(256);
        let mut table = HandleTable::new(16);
        let a = create(&mut table, &mut arena, INT);
        let b = create(&mut table, &mut arena, INT);
        table.unmark(b);
        free(&mut table, &mut arena, a);

        compact(&mut table, &mut arena);
        assert_eq!(table.slot_of(b).unwrap().word(), FIRST_BLOCK);
        arena.verify().unwrap();
    }
}
