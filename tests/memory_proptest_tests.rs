//! Property-based tests for the virtual memory laws
//!
//! These check the §allocation contract over randomized size/alignment
//! mixes: successful allocations dereference at their full size, pointers
//! respect alignment, live blocks never overlap, and free/allocate cycles
//! do not leak addresses.

use proptest::prelude::*;
use scatha::vm::memory::{VirtualMemory, VirtualPointer};

/// Valid (size, align) pairs: align is a power of two <= 32 dividing size
fn size_align() -> impl Strategy<Value = (u64, u64)> {
    (0u64..6)
        .prop_flat_map(|align_log| {
            let align = 1u64 << align_log;
            (1u64..200, Just(align)).prop_map(move |(units, align)| (units * align, align))
        })
        .prop_filter("sizes stay addressable", |(size, _)| *size < (1 << 20))
}

proptest! {
    #[test]
    fn allocation_is_dereferenceable_and_aligned((size, align) in size_align()) {
        let mut mem = VirtualMemory::new(0);
        let ptr = mem.allocate(size, align).unwrap();
        prop_assert!(mem.dereference(ptr, size).is_ok());
        prop_assert_eq!(ptr.offset % align, 0);
    }

    #[test]
    fn allocate_free_allocate_reuses_memory((size, align) in size_align()) {
        let mut mem = VirtualMemory::new(0);
        let first = mem.allocate(size, align).unwrap();
        mem.deallocate(first, size, align).unwrap();
        let second = mem.allocate(size, align).unwrap();
        // Freed memory is recycled rather than leaked
        prop_assert_eq!(first, second);
    }

    #[test]
    fn live_allocations_are_disjoint(sizes in prop::collection::vec(size_align(), 2..20)) {
        let mut mem = VirtualMemory::new(0);
        let mut live: Vec<(VirtualPointer, u64)> = Vec::new();
        for (size, align) in sizes {
            let ptr = mem.allocate(size, align).unwrap();
            for &(other, other_size) in &live {
                if other.slot != ptr.slot {
                    continue;
                }
                let disjoint = ptr.offset + size <= other.offset
                    || other.offset + other_size <= ptr.offset;
                prop_assert!(disjoint, "{ptr} overlaps {other}");
            }
            live.push((ptr, size));
        }
    }

    #[test]
    fn writes_are_isolated_per_allocation(count in 2usize..10) {
        let mut mem = VirtualMemory::new(0);
        let blocks: Vec<VirtualPointer> =
            (0..count).map(|_| mem.allocate(32, 8).unwrap()).collect();
        for (i, &ptr) in blocks.iter().enumerate() {
            mem.dereference(ptr, 32).unwrap().fill(i as u8);
        }
        for (i, &ptr) in blocks.iter().enumerate() {
            let bytes = mem.dereference_read(ptr, 32).unwrap();
            prop_assert!(bytes.iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn pointer_bits_round_trip(offset in 0u64..(1 << 48), slot in 0u16..u16::MAX) {
        let ptr = VirtualPointer { offset, slot };
        prop_assert_eq!(VirtualPointer::from_bits(ptr.to_bits()), ptr);
    }
}

#[test]
fn zero_size_allocation_has_the_reserved_sentinel() {
    let mut mem = VirtualMemory::new(0);
    let a = mem.allocate(0, 1).unwrap();
    let b = mem.allocate(0, 8).unwrap();
    assert_eq!(a, b);
    mem.deallocate(a, 0, 1).unwrap();
}
