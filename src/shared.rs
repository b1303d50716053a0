//! Reference-counted byte strings in the writable segment.
//!
//! Values stored in an undo index often carry variable-length payloads
//! (contract code, serialized state). Those cannot hold heap pointers, so a
//! [`SharedString`] stores its data in the segment named by the value's
//! [`SharedAlloc::second_id`] and remembers only `{segment id, offset}`.
//! Dereferencing resolves the id through the process-wide registry, which
//! is what keeps the reference valid after a restart or in another process
//! that mapped the same segments.
//!
//! Copies share one buffer under a reference count; the undo machinery's
//! value snapshots therefore cost one count bump, not a byte copy.
//! `assign` swings the string to a fresh buffer, releasing the old one.

use std::cmp::Ordering;

use crate::alloc::SharedAlloc;
use crate::registry;
use crate::segment::{raw_alloc, raw_dealloc, SegmentError};
use crate::undo::IndexError;

#[repr(C)]
struct StrImpl {
    refs: u32,
    size: u32,
    // data bytes follow
}

/// A shared, segment-resident byte string.
#[repr(C)]
pub struct SharedString {
    seg: u16,
    off: u64,
}

impl SharedString {
    /// An empty string wired to the writable segment of `alloc`.
    pub fn new(alloc: &SharedAlloc) -> Self {
        SharedString { seg: alloc.second_id(), off: 0 }
    }

    pub fn from_bytes(alloc: &SharedAlloc, bytes: &[u8]) -> Result<Self, SegmentError> {
        let mut s = Self::new(alloc);
        s.assign(bytes)?;
        Ok(s)
    }

    fn imp(&self) -> Option<*mut StrImpl> {
        if self.off == 0 {
            return None;
        }
        let base = registry::segment_base(self.seg).expect("shared string segment not registered");
        Some(unsafe { base.add(self.off as usize) } as *mut StrImpl)
    }

    fn dec_refcount(&mut self) {
        if let Some(imp) = self.imp() {
            unsafe {
                (*imp).refs -= 1;
                if (*imp).refs == 0 {
                    let base = registry::segment_base(self.seg).unwrap();
                    raw_dealloc(base, std::ptr::NonNull::new_unchecked(imp as *mut u8));
                }
            }
        }
        self.off = 0;
    }

    /// Replace the contents, detaching from any shared buffer.
    pub fn assign(&mut self, bytes: &[u8]) -> Result<(), SegmentError> {
        let base = registry::segment_base(self.seg)?;
        self.dec_refcount();
        if bytes.is_empty() {
            return Ok(());
        }
        let total = std::mem::size_of::<StrImpl>() + bytes.len();
        let block = unsafe { raw_alloc(base, total as u64)? };
        unsafe {
            let imp = block.as_ptr() as *mut StrImpl;
            (*imp).refs = 1;
            (*imp).size = bytes.len() as u32;
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                block.as_ptr().add(std::mem::size_of::<StrImpl>()),
                bytes.len(),
            );
        }
        self.off = block.as_ptr() as u64 - base as u64;
        Ok(())
    }

    pub fn len(&self) -> usize {
        match self.imp() {
            Some(imp) => unsafe { (*imp).size as usize },
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self.imp() {
            Some(imp) => unsafe {
                let data = (imp as *const u8).add(std::mem::size_of::<StrImpl>());
                std::slice::from_raw_parts(data, (*imp).size as usize)
            },
            None => &[],
        }
    }

    /// How many other strings currently share this buffer.
    pub fn ref_count(&self) -> u32 {
        match self.imp() {
            Some(imp) => unsafe { (*imp).refs },
            None => 0,
        }
    }

    /// Three-way comparison of `self[start..start + count]` (clamped to the
    /// string's end) against `other`. A start past the end is an error.
    pub fn compare(&self, start: usize, count: usize, other: &[u8]) -> Result<Ordering, IndexError> {
        let len = self.len();
        if start > len {
            return Err(IndexError::OutOfRange(format!(
                "compare start {start} is past the string's length {len}"
            )));
        }
        let count = count.min(len - start);
        let slice = &self.as_bytes()[start..start + count];
        let shared = count.min(other.len());
        match slice[..shared].cmp(&other[..shared]) {
            Ordering::Equal => Ok(count.cmp(&other.len())),
            other => Ok(other),
        }
    }
}

impl Clone for SharedString {
    fn clone(&self) -> Self {
        if let Some(imp) = self.imp() {
            unsafe { (*imp).refs += 1 };
        }
        SharedString { seg: self.seg, off: self.off }
    }
}

impl Drop for SharedString {
    fn drop(&mut self) {
        self.dec_refcount();
    }
}

impl PartialEq for SharedString {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}
impl Eq for SharedString {}

impl std::fmt::Debug for SharedString {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "SharedString({} bytes in segment {})", self.len(), self.seg)
    }
}
