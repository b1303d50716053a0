//! Process-wide segment-manager registry.
//!
//! A segment records only 16-bit segment ids in its persisted state; this
//! table maps an id to wherever the current process happens to have that
//! segment mapped, so a saved `(id, offset)` pair can be turned back into a
//! live pointer after a restart or in a second process.
//!
//! Access discipline is single-writer, like the rest of the crate: the lock
//! exists to make the static sound, not to coordinate concurrent mutators.

use std::collections::HashMap;
use std::sync::LazyLock;

use parking_lot::RwLock;

use crate::segment::SegmentError;

/// Largest id a segment manager may be registered under. Id 0 is reserved.
pub const MAX_SEGMENT_MANAGER_ID: u16 = 0xFFFF;

const DEFAULT_TABLE_SIZE: usize = 64;

struct RegistryInner {
    // base addresses as usize so the static is Send + Sync; the registry
    // never dereferences them itself.
    by_id: Vec<usize>,
    by_base: HashMap<usize, u16>,
}

static REGISTRY: LazyLock<RwLock<RegistryInner>> = LazyLock::new(|| {
    RwLock::new(RegistryInner { by_id: Vec::new(), by_base: HashMap::new() })
});

fn check_id(id: u16) -> Result<(), SegmentError> {
    if id == 0 {
        return Err(SegmentError::Registry(format!("invalid segment manager id: {id}")));
    }
    Ok(())
}

/// Register (or replace) the base address for `id`.
pub fn register_segment(id: u16, base: *mut u8) -> Result<(), SegmentError> {
    check_id(id)?;
    let mut reg = REGISTRY.write();
    if reg.by_id.is_empty() {
        reg.by_id.resize(DEFAULT_TABLE_SIZE, 0);
    }
    if reg.by_id.len() <= id as usize {
        reg.by_id.resize(id as usize + 1, 0);
    }
    let old = reg.by_id[id as usize];
    if old != 0 {
        reg.by_base.remove(&old);
    }
    reg.by_id[id as usize] = base as usize;
    reg.by_base.insert(base as usize, id);
    Ok(())
}

/// Drop the entry for `id`, if any. Used when a segment is unmapped.
pub fn unregister_segment(id: u16) {
    let mut reg = REGISTRY.write();
    if let Some(slot) = reg.by_id.get_mut(id as usize) {
        let old = *slot;
        *slot = 0;
        reg.by_base.remove(&old);
    }
}

/// The base address currently registered for `id`.
pub fn segment_base(id: u16) -> Result<*mut u8, SegmentError> {
    check_id(id)?;
    let reg = REGISTRY.read();
    match reg.by_id.get(id as usize) {
        Some(&base) if base != 0 => Ok(base as *mut u8),
        _ => Err(SegmentError::Registry(format!("segment manager id {id} is not registered"))),
    }
}

/// Reverse lookup: the id a base address was registered under.
pub fn segment_id(base: *const u8) -> Result<u16, SegmentError> {
    let reg = REGISTRY.read();
    reg.by_base
        .get(&(base as usize))
        .copied()
        .ok_or_else(|| SegmentError::Registry("segment manager is not registered".into()))
}
