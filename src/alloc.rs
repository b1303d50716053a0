//! Fixed-size node allocation with a single-node free list.
//!
//! Node-sized allocations dominate the containers' traffic, so single nodes
//! are served from an intrusive free list that is refilled from the segment
//! manager in chunks of 64 and never returns memory to it; freeing a node is
//! pure pointer threading with no segment-manager bookkeeping. Multi-node
//! requests delegate straight to the segment manager.
//!
//! The free-list head is a plain [`FreeList`] word that the owning container
//! keeps inside its segment-resident header, so recycled nodes survive
//! remapping like everything else.

use std::ptr::NonNull;

use crate::offset::SegPtr;
use crate::segment::{raw_alloc, raw_dealloc, DbConfig, FreeCell, SegmentError};

const CHUNK: usize = 64;

/// Persisted free-list head. Lives inside the owning container's header.
#[repr(C)]
pub struct FreeList {
    head: SegPtr<FreeCell>,
}

impl FreeList {
    pub const fn new() -> Self {
        FreeList { head: SegPtr::null() }
    }
}

/// Process-local handle serving `T`-sized allocations out of one segment.
pub struct NodeAllocator<T> {
    base: *mut u8,
    list: NonNull<FreeList>,
    _marker: std::marker::PhantomData<*mut T>,
}

impl<T> NodeAllocator<T> {
    /// # Safety
    /// `base` must be a live writable segment and `list` a free-list head
    /// inside it that is only ever used for `T`-sized cells.
    pub unsafe fn new(base: *mut u8, list: NonNull<FreeList>) -> Self {
        const { assert!(std::mem::size_of::<T>() >= std::mem::size_of::<FreeCell>()) };
        const { assert!(std::mem::size_of::<T>() % std::mem::align_of::<FreeCell>() == 0) };
        NodeAllocator { base, list, _marker: std::marker::PhantomData }
    }

    pub fn allocate(&self) -> Result<NonNull<T>, SegmentError> {
        let list = unsafe { &mut *self.list.as_ptr() };
        if list.head.is_null() {
            self.refill(list)?;
        }
        let cell = list.head.get_unchecked(self.base);
        list.head = unsafe { cell.as_ref().next };
        Ok(cell.cast())
    }

    pub fn deallocate(&self, p: NonNull<T>) {
        let list = unsafe { &mut *self.list.as_ptr() };
        let cell = p.cast::<FreeCell>();
        unsafe { (*cell.as_ptr()).next = list.head };
        list.head = SegPtr::from_raw(self.base, cell.as_ptr());
    }

    /// Contiguous storage for `n` nodes, straight from the segment manager.
    pub fn allocate_array(&self, n: usize) -> Result<NonNull<T>, SegmentError> {
        unsafe { raw_alloc(self.base, (n * std::mem::size_of::<T>()) as u64).map(NonNull::cast) }
    }

    pub fn deallocate_array(&self, p: NonNull<T>) {
        unsafe { raw_dealloc(self.base, p.cast()) }
    }

    fn refill(&self, list: &mut FreeList) -> Result<(), SegmentError> {
        let chunk =
            unsafe { raw_alloc(self.base, (CHUNK * std::mem::size_of::<T>()) as u64)?.as_ptr() };
        let stride = std::mem::size_of::<T>();
        for i in 0..CHUNK {
            let cell = unsafe { chunk.add(i * stride) } as *mut FreeCell;
            let next = if i + 1 == CHUNK {
                SegPtr::null()
            } else {
                SegPtr::from_raw(self.base, unsafe { chunk.add((i + 1) * stride) } as *mut FreeCell)
            };
            unsafe { (*cell).next = next };
        }
        list.head = SegPtr::from_raw(self.base, chunk as *mut FreeCell);
        Ok(())
    }
}

/// The allocator bundle handed to value constructors. Values that embed
/// nested shared containers (strings, shared objects) allocate them through
/// the `second`/`third` segments rather than the node segment, so a
/// database can route copy-on-write data into a separate writable file.
#[derive(Clone, Copy, Debug)]
pub struct SharedAlloc {
    first: u16,
    second: u16,
    third: u16,
}

impl SharedAlloc {
    pub fn new(first: u16, second: u16, third: u16) -> Self {
        SharedAlloc { first, second, third }
    }

    pub fn from_config(cfg: &DbConfig) -> Self {
        SharedAlloc {
            first: cfg.unique_segment_manager_id,
            second: cfg.writable_segment_manager_id,
            third: cfg.writable_segment_manager_id,
        }
    }

    pub fn first_id(&self) -> u16 {
        self.first
    }
    pub fn second_id(&self) -> u16 {
        self.second
    }
    pub fn third_id(&self) -> u16 {
        self.third
    }

    pub fn set_second(&mut self, id: u16) {
        self.second = id;
    }
    pub fn set_third(&mut self, id: u16) {
        self.third = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{Segment, SegmentOptions};

    #[repr(C, align(8))]
    struct FakeNode([u8; 40]);

    #[test]
    fn single_nodes_come_off_the_free_list_lifo() {
        let seg = Segment::anonymous(
            SegmentOptions::builder()
                .capacity(1 << 20)
                .unique_segment_manager_id(910)
                .build(),
        )
        .unwrap();
        let list = seg.alloc(std::mem::size_of::<FreeList>() as u64).unwrap().cast::<FreeList>();
        unsafe { list.as_ptr().write(FreeList::new()) };
        let alloc = unsafe { NodeAllocator::<FakeNode>::new(seg.base(), list) };

        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        // chunked refill hands out adjacent cells
        assert_eq!(
            b.as_ptr() as usize - a.as_ptr() as usize,
            std::mem::size_of::<FakeNode>()
        );
        alloc.deallocate(a);
        alloc.deallocate(b);
        assert_eq!(alloc.allocate().unwrap(), b);
        assert_eq!(alloc.allocate().unwrap(), a);

        // draining the rest of the 64-cell chunk costs no segment memory;
        // the next allocation after that triggers exactly one more request
        let free_before = seg.free_memory();
        let many: Vec<_> = (0..62).map(|_| alloc.allocate().unwrap()).collect();
        assert_eq!(seg.free_memory(), free_before);
        let _one_more = alloc.allocate().unwrap();
        assert!(seg.free_memory() < free_before);
        drop(many);
    }
}
