//! Memory segments and the in-segment allocator.
//!
//! A segment is a contiguous byte region, usually backed by a mapped file,
//! that owns every allocation the containers make. Its layout is fixed: a
//! [`SegmentHeader`] at offset zero (magic, capacity, allocator state),
//! immediately followed by the database-configure record, then arbitrary
//! allocations. All intra-segment pointers are offsets, so a reader may map
//! the file at any base address.
//!
//! The allocator is a bump cursor plus power-of-two size-class free lists.
//! Every allocation is prefixed by a 16-byte class tag so deallocation does
//! not need a size argument from the caller.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;
use std::rc::Rc;

use memmap2::MmapMut;
use nix::fcntl::{flock, FlockArg};
use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::offset::SegPtr;
use crate::registry;

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("system error: {0}")]
    System(#[from] nix::Error),
    #[error("{0}")]
    Init(String),
    #[error("segment registry: {0}")]
    Registry(String),
    #[error("segment exhausted allocating {0} bytes")]
    OutOfMemory(u64),
    #[error("segment is read-only")]
    ReadOnly,
}

const MAGIC: [u8; 16] = *b"statebase segv1\0";

// Size classes: total block sizes 2^5 ..= 2^40 bytes, tag included.
const BIN_MIN_SHIFT: u32 = 5;
const BIN_MAX_SHIFT: u32 = 40;
const NUM_BINS: usize = (BIN_MAX_SHIFT - BIN_MIN_SHIFT + 1) as usize;
const TAG_SIZE: u64 = 16;

/// A cell threaded through freed blocks. Also reused by the node allocator
/// for its single-node free lists.
#[repr(C)]
pub struct FreeCell {
    pub next: SegPtr<FreeCell>,
}

/// Identifies a logical database and the segment ids it is wired to.
/// Persisted right behind the segment header; validated on every open.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DbConfig {
    pub database_id: u64,
    pub instance_id: u64,
    pub unique_segment_manager_id: u16,
    pub writable_segment_manager_id: u16,
    _reserved: u32,
}

#[repr(C)]
struct SegmentHeader {
    magic: [u8; 16],
    capacity: u64,
    bump: u64,
    free_bins: [SegPtr<FreeCell>; NUM_BINS],
    config: DbConfig,
}

#[derive(TypedBuilder)]
pub struct SegmentOptions {
    #[builder(default = 64 << 20)]
    capacity: u64,
    #[builder(default = 0)]
    database_id: u64,
    #[builder(default = 0)]
    instance_id: u64,
    unique_segment_manager_id: u16,
    /// Segment that shared objects copied-on-write out of this one go to.
    /// Zero means "this segment".
    #[builder(default = 0)]
    writable_segment_manager_id: u16,
}

enum Mapping {
    Anon(MmapMut),
    File(MmapMut, std::fs::File),
    FileRo(memmap2::Mmap, std::fs::File),
}

/// A mounted segment. Creating or opening one registers its base address
/// under the configure record's `unique_segment_manager_id`.
pub struct Segment {
    map: Mapping,
    base: *mut u8,
    read_only: bool,
    registered_id: u16,
}

fn check_manager_id(id: u16) -> Result<(), SegmentError> {
    if id == 0 {
        return Err(SegmentError::Init("segment manager id 0 is reserved".into()));
    }
    Ok(())
}

impl Segment {
    /// An anonymous in-memory segment. Contents die with the mapping; used
    /// by tests and by hosts that handle persistence themselves.
    pub fn anonymous(opts: SegmentOptions) -> Result<Rc<Segment>, SegmentError> {
        let mut map = MmapMut::map_anon(opts.capacity as usize)?;
        let base = map.as_mut_ptr();
        let seg = Segment {
            map: Mapping::Anon(map),
            base,
            read_only: false,
            registered_id: opts.unique_segment_manager_id,
        };
        seg.init_header(&opts)?;
        registry::register_segment(seg.registered_id, base)?;
        Ok(Rc::new(seg))
    }

    /// Create a fresh file-backed segment, truncated to `capacity` and
    /// locked exclusively for this process.
    pub fn create<P: AsRef<Path>>(path: P, opts: SegmentOptions) -> Result<Rc<Segment>, SegmentError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        if flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).is_err() {
            return Err(SegmentError::Init("the segment file is busy".into()));
        }
        nix::unistd::ftruncate(file.as_raw_fd(), opts.capacity as nix::libc::off_t)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base = map.as_mut_ptr();
        let seg = Segment {
            map: Mapping::File(map, file),
            base,
            read_only: false,
            registered_id: opts.unique_segment_manager_id,
        };
        seg.init_header(&opts)?;
        registry::register_segment(seg.registered_id, base)?;
        Ok(Rc::new(seg))
    }

    /// Open an existing segment file. Writers take the exclusive lock;
    /// read-only opens take a shared lock and map the file read-only. The
    /// registration id comes from the persisted configure record.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Rc<Segment>, SegmentError> {
        let file = OpenOptions::new().read(true).write(!read_only).open(path.as_ref())?;
        let lock = if read_only {
            FlockArg::LockSharedNonblock
        } else {
            FlockArg::LockExclusiveNonblock
        };
        if flock(file.as_raw_fd(), lock).is_err() {
            return Err(SegmentError::Init("the segment file is busy".into()));
        }
        let (map, base) = if read_only {
            let map = unsafe { memmap2::Mmap::map(&file)? };
            let base = map.as_ptr() as *mut u8;
            (Mapping::FileRo(map, file), base)
        } else {
            let mut map = unsafe { MmapMut::map_mut(&file)? };
            let base = map.as_mut_ptr();
            (Mapping::File(map, file), base)
        };
        let mut seg = Segment { map, base, read_only, registered_id: 0 };
        let header = unsafe { &*(seg.base as *const SegmentHeader) };
        if header.magic != MAGIC {
            return Err(SegmentError::Init(
                "not a statebase segment (bad magic); refusing to mount".into(),
            ));
        }
        if header.capacity != seg.len() as u64 {
            return Err(SegmentError::Init(format!(
                "segment capacity mismatch: header says {}, file is {}",
                header.capacity,
                seg.len()
            )));
        }
        check_manager_id(header.config.unique_segment_manager_id)?;
        seg.registered_id = header.config.unique_segment_manager_id;
        registry::register_segment(seg.registered_id, seg.base)?;
        Ok(Rc::new(seg))
    }

    fn init_header(&self, opts: &SegmentOptions) -> Result<(), SegmentError> {
        check_manager_id(opts.unique_segment_manager_id)?;
        let writable = if opts.writable_segment_manager_id == 0 {
            opts.unique_segment_manager_id
        } else {
            opts.writable_segment_manager_id
        };
        let reserved = align_up(std::mem::size_of::<SegmentHeader>() as u64, 32);
        if opts.capacity <= reserved {
            return Err(SegmentError::Init("segment capacity is smaller than its header".into()));
        }
        let header = self.header_mut();
        header.magic = MAGIC;
        header.capacity = opts.capacity;
        header.bump = reserved;
        header.free_bins = [SegPtr::null(); NUM_BINS];
        header.config = DbConfig {
            database_id: opts.database_id,
            instance_id: opts.instance_id,
            unique_segment_manager_id: opts.unique_segment_manager_id,
            writable_segment_manager_id: writable,
            _reserved: 0,
        };
        Ok(())
    }

    fn header_mut(&self) -> &mut SegmentHeader {
        // Single-writer discipline: the segment hands out raw memory and the
        // caller guarantees one mutator at a time.
        unsafe { &mut *(self.base as *mut SegmentHeader) }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        match &self.map {
            Mapping::Anon(m) => m.len(),
            Mapping::File(m, _) => m.len(),
            Mapping::FileRo(m, _) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn manager_id(&self) -> u16 {
        self.registered_id
    }

    pub fn config(&self) -> DbConfig {
        unsafe { (*(self.base as *const SegmentHeader)).config }
    }

    pub fn free_memory(&self) -> u64 {
        let header = unsafe { &*(self.base as *const SegmentHeader) };
        header.capacity - header.bump
    }

    /// Allocate `size` bytes from this segment. The returned block is
    /// 16-byte aligned and stays valid until deallocated, across remaps.
    pub fn alloc(&self, size: u64) -> Result<NonNull<u8>, SegmentError> {
        if self.read_only {
            return Err(SegmentError::ReadOnly);
        }
        unsafe { raw_alloc(self.base, size) }
    }

    /// Return a block obtained from [`Segment::alloc`] on this segment.
    pub fn dealloc(&self, ptr: NonNull<u8>) {
        debug_assert!(!self.read_only);
        unsafe { raw_dealloc(self.base, ptr) }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        registry::unregister_segment(self.registered_id);
        match &self.map {
            Mapping::File(_, f) | Mapping::FileRo(_, f) => {
                flock(f.as_raw_fd(), FlockArg::UnlockNonblock).ok();
            }
            Mapping::Anon(_) => {}
        }
    }
}

fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}

fn bin_of(total: u64) -> usize {
    (total.trailing_zeros() - BIN_MIN_SHIFT) as usize
}

/// Allocate from the segment mapped at `base`. Exposed separately from
/// [`Segment`] so code holding only a registered base address (shared
/// objects resolving through the registry) can allocate too.
///
/// # Safety
/// `base` must point at a live, writable segment initialized by this crate.
pub(crate) unsafe fn raw_alloc(base: *mut u8, size: u64) -> Result<NonNull<u8>, SegmentError> {
    let header = &mut *(base as *mut SegmentHeader);
    let total = (size + TAG_SIZE).next_power_of_two().max(1 << BIN_MIN_SHIFT);
    if total > 1 << BIN_MAX_SHIFT {
        return Err(SegmentError::OutOfMemory(size));
    }
    let bin = bin_of(total);
    let block = match header.free_bins[bin].get(base) {
        Some(cell) => {
            header.free_bins[bin] = cell.as_ref().next;
            cell.as_ptr() as *mut u8
        }
        None => {
            if header.bump + total > header.capacity {
                return Err(SegmentError::OutOfMemory(size));
            }
            let off = header.bump;
            header.bump += total;
            base.add(off as usize)
        }
    };
    // class tag ahead of the user block
    *(block as *mut u64) = total.trailing_zeros() as u64;
    Ok(NonNull::new_unchecked(block.add(TAG_SIZE as usize)))
}

/// # Safety
/// `ptr` must come from [`raw_alloc`] on the segment mapped at `base` and
/// must not be freed twice.
pub(crate) unsafe fn raw_dealloc(base: *mut u8, ptr: NonNull<u8>) {
    let header = &mut *(base as *mut SegmentHeader);
    let block = ptr.as_ptr().sub(TAG_SIZE as usize);
    let shift = *(block as *const u64) as u32;
    assert!(
        (BIN_MIN_SHIFT..=BIN_MAX_SHIFT).contains(&shift),
        "segment allocator: corrupt block tag"
    );
    let bin = (shift - BIN_MIN_SHIFT) as usize;
    let cell = block as *mut FreeCell;
    (*cell).next = header.free_bins[bin];
    header.free_bins[bin] = SegPtr::from_raw(base, cell);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_recycles_freed_blocks() {
        let seg = Segment::anonymous(
            SegmentOptions::builder()
                .capacity(1 << 20)
                .unique_segment_manager_id(900)
                .build(),
        )
        .unwrap();
        let a = seg.alloc(24).unwrap();
        let b = seg.alloc(24).unwrap();
        assert_ne!(a, b);
        let before = seg.free_memory();
        seg.dealloc(a);
        let c = seg.alloc(20).unwrap(); // same class, reuses the freed block
        assert_eq!(a, c);
        assert_eq!(seg.free_memory(), before);
        seg.dealloc(b);
        seg.dealloc(c);
    }

    #[test]
    fn exhaustion_is_an_error_not_a_crash() {
        let seg = Segment::anonymous(
            SegmentOptions::builder()
                .capacity(1 << 16)
                .unique_segment_manager_id(901)
                .build(),
        )
        .unwrap();
        let mut held = Vec::new();
        loop {
            match seg.alloc(4096) {
                Ok(p) => held.push(p),
                Err(SegmentError::OutOfMemory(_)) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(!held.is_empty());
    }
}
