//! Paged virtual memory
//!
//! Guest pointers are `(offset: 48 bits, slot: 16 bits)` pairs. Slot 0 is
//! reserved so the null pointer is trivially invalid; slot 1 holds static
//! data, bytecode and the stack; the following slots belong to pool
//! allocators for the common small sizes; everything after that is one
//! dedicated slot per large allocation.
//!
//! Pools carve their slot into equal blocks and thread the unused blocks
//! through an embedded free list: each free block stores the offset of the
//! next free block in its first eight bytes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AllocationReason, MemoryAccessReason, RuntimeException, VmResult};

/// Difference between two pool block sizes
const BLOCK_SIZE_DIFF: u64 = 16;
/// The maximum allocation size served from pools
const MAX_POOL_SIZE: u64 = 1024;
/// Static data, bytecode and stack memory live here
const STATIC_DATA_INDEX: u16 = 1;
/// Pools occupy slots 2..=LAST_POOL_INDEX
const FIRST_POOL_INDEX: u16 = 2;
const LAST_POOL_INDEX: u16 = (FIRST_POOL_INDEX as u64 + MAX_POOL_SIZE / BLOCK_SIZE_DIFF - 1) as u16;

/// A guest pointer: 48-bit offset plus 16-bit slot index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VirtualPointer {
    /// Byte offset within the slot
    pub offset: u64,
    /// Slot index
    pub slot: u16,
}

impl VirtualPointer {
    /// The null pointer
    pub const NULL: VirtualPointer = VirtualPointer { offset: 0, slot: 0 };

    /// Pack into the 64-bit register representation
    pub fn to_bits(self) -> u64 {
        (u64::from(self.slot) << 48) | (self.offset & ((1 << 48) - 1))
    }

    /// Unpack from the 64-bit register representation
    pub fn from_bits(bits: u64) -> Self {
        VirtualPointer {
            offset: bits & ((1 << 48) - 1),
            slot: (bits >> 48) as u16,
        }
    }

    /// Add a byte offset
    pub fn with_added_offset(self, bytes: u64) -> Self {
        VirtualPointer {
            offset: self.offset + bytes,
            slot: self.slot,
        }
    }
}

impl fmt::Display for VirtualPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.slot, self.offset)
    }
}

/// One region of guest memory
enum Slot {
    /// Buffer owned by the VM
    Owning(Vec<u8>),
    /// View over host memory handed to the guest via `map`
    View {
        /// Host base address
        ptr: *mut u8,
        /// View length
        len: usize,
    },
}

impl Slot {
    fn len(&self) -> usize {
        match self {
            Slot::Owning(buf) => buf.len(),
            Slot::View { len, .. } => *len,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Slot::Owning(buf) => buf.as_mut_slice(),
            // Safety: `map` callers guarantee the host buffer outlives the
            // mapping and is not aliased while the VM runs
            Slot::View { ptr, len } => unsafe { std::slice::from_raw_parts_mut(*ptr, *len) },
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Slot::Owning(buf) => buf.as_slice(),
            Slot::View { ptr, len } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
        }
    }

    fn grow(&mut self, min_size: usize) {
        match self {
            Slot::Owning(buf) => {
                let new_len = min_size.max(buf.len() * 2);
                buf.resize(new_len, 0);
            }
            Slot::View { .. } => panic!("cannot grow a mapped slot"),
        }
    }
}

/// Fixed-block-size allocator threading free blocks through a free list
struct PoolAllocator {
    block_size: u64,
    freelist_begin: u64,
}

impl PoolAllocator {
    fn new(block_size: u64) -> Self {
        debug_assert!(block_size >= 8, "the freelist needs 8 bytes per block");
        PoolAllocator {
            block_size,
            freelist_begin: 0,
        }
    }

    fn allocate(&mut self, slot: &mut Slot) -> u64 {
        if self.freelist_begin == slot.len() as u64 {
            let old_len = slot.len() as u64;
            slot.grow((old_len + 2 * self.block_size) as usize);
            // Thread a freelist through the newly grown region
            let bytes = slot.bytes_mut();
            let mut offset = old_len;
            while offset < bytes.len() as u64 {
                let next = offset + self.block_size;
                bytes[offset as usize..offset as usize + 8].copy_from_slice(&next.to_le_bytes());
                offset = next;
            }
        }
        let offset = self.freelist_begin;
        let bytes = slot.bytes();
        self.freelist_begin =
            u64::from_le_bytes(bytes[offset as usize..offset as usize + 8].try_into().unwrap());
        offset
    }

    fn deallocate(&mut self, slot: &mut Slot, offset: u64) -> bool {
        if offset % self.block_size != 0 || offset >= slot.len() as u64 {
            return false;
        }
        let next = self.freelist_begin;
        slot.bytes_mut()[offset as usize..offset as usize + 8]
            .copy_from_slice(&next.to_le_bytes());
        self.freelist_begin = offset;
        true
    }
}

/// The zero-size allocation result dereferences nowhere but is a valid
/// pointer value
const ZERO_SIZED_RESULT: VirtualPointer = VirtualPointer {
    offset: 0,
    slot: STATIC_DATA_INDEX,
};

/// An unbounded region of guest memory managed in slots
pub struct VirtualMemory {
    slots: Vec<Slot>,
    pools: Vec<PoolAllocator>,
    free_slots: Vec<u16>,
}

// Mapped views carry raw host pointers; the `map` contract requires them to
// stay valid and unaliased while the VM owns the mapping, which also covers
// moving the memory to the executor thread
unsafe impl Send for VirtualMemory {}

impl VirtualMemory {
    /// Create a memory with a static slot of `static_size` bytes
    pub fn new(static_size: usize) -> Self {
        let mut slots = Vec::with_capacity(2 + (MAX_POOL_SIZE / BLOCK_SIZE_DIFF) as usize);
        // Index 0 is unused so null pointers never resolve
        slots.push(Slot::Owning(Vec::new()));
        slots.push(Slot::Owning(vec![0; static_size]));
        let mut pools = Vec::new();
        let mut block_size = BLOCK_SIZE_DIFF;
        while block_size <= MAX_POOL_SIZE {
            slots.push(Slot::Owning(Vec::new()));
            pools.push(PoolAllocator::new(block_size));
            block_size += BLOCK_SIZE_DIFF;
        }
        VirtualMemory {
            slots,
            pools,
            free_slots: Vec::new(),
        }
    }

    /// Pointer to offset `offset` of the static data slot
    pub fn static_data_pointer(offset: u64) -> VirtualPointer {
        VirtualPointer {
            offset,
            slot: STATIC_DATA_INDEX,
        }
    }

    /// Resize the static slot (used while loading a program)
    pub fn resize_static_slot(&mut self, size: usize) {
        if let Slot::Owning(buf) = &mut self.slots[STATIC_DATA_INDEX as usize] {
            buf.resize(size, 0);
        }
    }

    /// Allocate `size` bytes with alignment `align` (a power of two <= 32)
    pub fn allocate(&mut self, size: u64, align: u64) -> VmResult<VirtualPointer> {
        if size == 0 {
            return Ok(ZERO_SIZED_RESULT);
        }
        if size >= 1 << 48 {
            return Err(RuntimeException::Allocation {
                reason: AllocationReason::InvalidSize,
                size,
                align,
            });
        }
        if !align.is_power_of_two() || align > 32 || size % align != 0 {
            return Err(RuntimeException::Allocation {
                reason: AllocationReason::InvalidAlign,
                size,
                align,
            });
        }
        if size <= MAX_POOL_SIZE {
            let (slot_index, pool_index) = Self::pool_for(size);
            let offset = self.pools[pool_index].allocate(&mut self.slots[slot_index as usize]);
            return Ok(VirtualPointer {
                offset,
                slot: slot_index,
            });
        }
        if let Some(slot_index) = self.free_slots.pop() {
            let slot = &mut self.slots[slot_index as usize];
            if (slot.len() as u64) < size {
                slot.grow(size as usize);
            }
            return Ok(VirtualPointer {
                offset: 0,
                slot: slot_index,
            });
        }
        let slot_index = self.slots.len();
        assert!(slot_index < 1 << 16, "maximum slot number exceeded");
        self.slots.push(Slot::Owning(vec![0; size as usize]));
        Ok(VirtualPointer {
            offset: 0,
            slot: slot_index as u16,
        })
    }

    /// Deallocate a block previously produced by `allocate(size, align)`
    pub fn deallocate(&mut self, ptr: VirtualPointer, size: u64, align: u64) -> VmResult<()> {
        let error = || RuntimeException::Deallocation {
            pointer: ptr,
            size,
            align,
        };
        if size == 0 {
            if ptr != ZERO_SIZED_RESULT {
                return Err(error());
            }
            return Ok(());
        }
        if !align.is_power_of_two() {
            return Err(error());
        }
        if size <= MAX_POOL_SIZE {
            let (slot_index, pool_index) = Self::pool_for(size);
            if slot_index != ptr.slot {
                return Err(error());
            }
            if !self.pools[pool_index].deallocate(&mut self.slots[slot_index as usize], ptr.offset)
            {
                return Err(error());
            }
            return Ok(());
        }
        if ptr.slot <= LAST_POOL_INDEX {
            return Err(error());
        }
        self.free_slots.push(ptr.slot);
        Ok(())
    }

    /// The pool (slot index, pool index) responsible for `size`
    fn pool_for(size: u64) -> (u16, usize) {
        debug_assert!(size > 0 && size <= MAX_POOL_SIZE);
        let index = size.div_ceil(BLOCK_SIZE_DIFF);
        let slot = FIRST_POOL_INDEX as u64 + index - 1;
        (slot as u16, (index - 1) as usize)
    }

    /// How many bytes `ptr` is dereferenceable for; `None` when invalid
    pub fn valid_range(&self, ptr: VirtualPointer) -> Option<u64> {
        if ptr.slot == 0 || ptr.slot as usize >= self.slots.len() {
            return None;
        }
        let len = self.slots[ptr.slot as usize].len() as u64;
        len.checked_sub(ptr.offset)
    }

    /// Resolve `ptr` for an access of `size` bytes
    pub fn dereference(&mut self, ptr: VirtualPointer, size: u64) -> VmResult<&mut [u8]> {
        if ptr.slot == 0 || ptr.slot as usize >= self.slots.len() {
            return Err(RuntimeException::MemoryAccess {
                reason: MemoryAccessReason::MemoryNotAllocated,
                pointer: ptr,
                size,
            });
        }
        let slot = &mut self.slots[ptr.slot as usize];
        if ptr.offset + size > slot.len() as u64 {
            return Err(RuntimeException::MemoryAccess {
                reason: MemoryAccessReason::DerefRangeTooBig,
                pointer: ptr,
                size,
            });
        }
        let start = ptr.offset as usize;
        Ok(&mut slot.bytes_mut()[start..start + size as usize])
    }

    /// Read-only resolution (state inspection)
    pub fn dereference_read(&self, ptr: VirtualPointer, size: u64) -> VmResult<&[u8]> {
        if ptr.slot == 0 || ptr.slot as usize >= self.slots.len() {
            return Err(RuntimeException::MemoryAccess {
                reason: MemoryAccessReason::MemoryNotAllocated,
                pointer: ptr,
                size,
            });
        }
        let slot = &self.slots[ptr.slot as usize];
        if ptr.offset + size > slot.len() as u64 {
            return Err(RuntimeException::MemoryAccess {
                reason: MemoryAccessReason::DerefRangeTooBig,
                pointer: ptr,
                size,
            });
        }
        let start = ptr.offset as usize;
        Ok(&slot.bytes()[start..start + size as usize])
    }

    /// Wrap a host buffer in a dedicated slot. The caller keeps ownership
    /// and must `unmap` before releasing the buffer.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `size` bytes for the
    /// whole lifetime of the mapping, and must not be accessed by the host
    /// while guest code runs.
    pub unsafe fn map(&mut self, ptr: *mut u8, size: usize) -> VirtualPointer {
        let slot = Slot::View { ptr, len: size };
        let slot_index = if let Some(index) = self.free_slots.pop() {
            self.slots[index as usize] = slot;
            index
        } else {
            let index = self.slots.len();
            assert!(index < 1 << 16, "maximum slot number exceeded");
            self.slots.push(slot);
            index as u16
        };
        VirtualPointer {
            offset: 0,
            slot: slot_index,
        }
    }

    /// Release a mapping created by `map`
    pub fn unmap(&mut self, slot_index: u16) {
        self.slots[slot_index as usize] = Slot::Owning(Vec::new());
        self.free_slots.push(slot_index);
    }
}
