//! The undo index: a multi-index object container with a session stack.
//!
//! The undo stack is a deque of session records indexing into a pair of
//! singly linked lists. The primary key (id) is managed by the container:
//! ids are assigned sequentially in creation order and user code must never
//! modify them. Within the session at the top of the stack:
//!
//! - a key is *new* if it is at least `old_next_id`;
//! - a key is *removed* if its node sits on the removed-values list in
//!   front of the session's saved marker (such nodes carry the removed
//!   flag in their first hook);
//! - a key is *modified* if an old-value record for it sits in front of the
//!   session's saved marker.
//!
//! A key exists at most once in the union of the main table and the removed
//! list. Every old-value record aliases a node in one of the two. When a key
//! is both modified and removed, undo restores the old value. A key may
//! appear in old-values more than once after squashes; undo restores the
//! oldest.
//!
//! Operations on a key always follow CREATE MODIFY* REMOVE?, so when
//! undoing several operations the oldest one wins. That justifies the
//! compression applied by squash: new keys can be dropped from both side
//! lists, all but the oldest modification can be dropped, and a
//! modified-then-removed value can fold its old value into the removed
//! node.
//!
//! Nodes in the main table and on the removed list share one layout and
//! move between the two without copying, which is what lets undo restore a
//! removed node while giving out stable value addresses for the node's
//! whole life.
//!
//! Everything the container owns (nodes, records, tree headers, the session
//! stack itself) lives in its segment; the [`UndoIndex`] handle is a thin
//! process-local view and mutates through `&self` under the crate-wide
//! single-writer discipline, like a store handle in any mapped-memory
//! system.

use std::any::TypeId;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::rc::Rc;

use thiserror::Error;

use crate::alloc::{FreeList, NodeAllocator, SharedAlloc};
use crate::avl::{self, RawSet};
use crate::events;
use crate::multi::{
    hook_of, node_of_value, primary_is_id, ById, IndexList, KeySpec, Oid, RawNode, Row, RowRef,
    SetView,
};
use crate::offset::{Hook, SegPtr, ERASED_FLAG};
use crate::segment::{raw_alloc, raw_dealloc, Segment, SegmentError};

/// Ceilings for the two id generators. A database hosts at most
/// `MAX_DATABASE_COUNT` undo indexes, each entitled to `MAX_NEXT_ID` ids
/// past its base; the lower half of that range belongs to objects created
/// outside undo tracking, so a reader can tell the two kinds apart from the
/// id alone.
pub const MAX_DATABASE_COUNT: i64 = 1000;
pub const MAX_NEXT_ID: i64 = i64::MAX / MAX_DATABASE_COUNT;
pub const MAX_CREATE_WITHOUT_UNDO_NEXT_ID: i64 = MAX_NEXT_ID / 2;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("{0}")]
    Logic(String),
    #[error("uniqueness constraint violated: {0}")]
    Unique(String),
    #[error("out of range: {0}")]
    OutOfRange(String),
    #[error("id generator exhausted: {0}")]
    Overflow(String),
    #[error(transparent)]
    Segment(#[from] SegmentError),
}

/// One session record. The two end markers are the heads of the side lists
/// at the moment the session began; everything pushed since sits in front
/// of them.
#[repr(C)]
#[derive(Clone, Copy)]
struct UndoState {
    old_values_end: SegPtr<u8>,
    removed_values_end: SegPtr<u8>,
    old_next_id: i64,
    ctime: u64,
}

/// Segment-resident growable array for the session stack.
#[repr(C)]
struct SegVec<T> {
    data: SegPtr<T>,
    len: u32,
    cap: u32,
}

impl<T: Copy> SegVec<T> {
    const fn new() -> Self {
        SegVec { data: SegPtr::null(), len: 0, cap: 0 }
    }

    fn len(&self) -> usize {
        self.len as usize
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    unsafe fn slot(&self, base: *mut u8, i: usize) -> *mut T {
        debug_assert!(i < self.len as usize);
        self.data.get_unchecked(base).as_ptr().add(i)
    }

    unsafe fn get(&self, base: *mut u8, i: usize) -> T {
        *self.slot(base, i)
    }

    unsafe fn back(&self, base: *mut u8) -> Option<T> {
        if self.is_empty() {
            None
        } else {
            Some(self.get(base, self.len() - 1))
        }
    }

    unsafe fn push(&mut self, base: *mut u8, value: T) -> Result<(), SegmentError> {
        if self.len == self.cap {
            let new_cap = (self.cap * 2).max(8);
            let grown =
                raw_alloc(base, new_cap as u64 * std::mem::size_of::<T>() as u64)?.cast::<T>();
            if let Some(old) = self.data.get(base) {
                std::ptr::copy_nonoverlapping(old.as_ptr(), grown.as_ptr(), self.len as usize);
                raw_dealloc(base, old.cast());
            }
            self.data = SegPtr::from_raw(base, grown.as_ptr());
            self.cap = new_cap;
        }
        *self.data.get_unchecked(base).as_ptr().add(self.len as usize) = value;
        self.len += 1;
        Ok(())
    }

    unsafe fn pop(&mut self, base: *mut u8) -> Option<T> {
        let v = self.back(base)?;
        self.len -= 1;
        Some(v)
    }

    unsafe fn drain_front(&mut self, base: *mut u8, count: usize) {
        debug_assert!(count <= self.len as usize);
        if count == 0 {
            return;
        }
        let data = self.data.get_unchecked(base).as_ptr();
        std::ptr::copy(data.add(count), data, self.len as usize - count);
        self.len -= count as u32;
    }

    fn clear(&mut self) {
        self.len = 0;
    }
}

/// The saved prior state of a modified node: the value copy, the node's
/// mtime at snapshot time, and a stable pointer back to the live node.
/// The leading hook threads the old-values list.
#[repr(C)]
struct OldNode<V, H> {
    hook: Hook,
    mtime: u64,
    current: SegPtr<RawNode<V, H>>,
    value: V,
}

/// Tracks a value created inside an open session when the primary index is
/// not keyed by id (the primary index then cannot enumerate new ids). Keyed
/// by id in its own little tree.
#[repr(C)]
struct CreatedNode<V, H> {
    hook: Hook,
    id: i64,
    current: SegPtr<RawNode<V, H>>,
}

/// The container's entire persisted state.
#[repr(C)]
struct UndoHeader<V: Row, L: IndexList<V>> {
    sets: L::Sets,
    created: RawSet,
    old_head: SegPtr<OldNode<V, L::Hooks>>,
    removed_head: SegPtr<RawNode<V, L::Hooks>>,
    stack: SegVec<UndoState>,
    node_free: FreeList,
    old_free: FreeList,
    created_free: FreeList,
    next_id: i64,
    create_without_undo_next_id: i64,
    first_next_id: i64,
    revision: u64,
    monotonic_revision: u64,
    database_id: u64,
    instance_id: u64,
    size_of_node: u32,
    size_of_header: u32,
}

type NodeOf<V, L> = RawNode<V, <L as IndexList<V>>::Hooks>;
type OldOf<V, L> = OldNode<V, <L as IndexList<V>>::Hooks>;
type CreatedOf<V, L> = CreatedNode<V, <L as IndexList<V>>::Hooks>;

/// Handle to an undo index living in a segment. Cheap to reopen; all real
/// state is behind the header pointer.
pub struct UndoIndex<V: Row, L: IndexList<V> = (ById<V>,)> {
    seg: Rc<Segment>,
    hdr: NonNull<UndoHeader<V, L>>,
    _marker: PhantomData<fn() -> (V, L)>,
}

impl<V: Row, L: IndexList<V>> std::fmt::Debug for UndoIndex<V, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoIndex").field("hdr", &self.hdr).finish()
    }
}

impl<V: Row + Clone, L: IndexList<V>> UndoIndex<V, L> {
    /// Allocate a fresh container inside `seg`. The configure record's
    /// database and instance ids are stamped onto the container and its
    /// per-index headers for event reporting.
    pub fn create(seg: &Rc<Segment>) -> Result<Self, IndexError> {
        let ids = L::spec_ids();
        for (i, a) in ids.iter().enumerate() {
            if ids[..i].contains(a) {
                return Err(IndexError::Logic(format!(
                    "index {i} duplicates an earlier index on the same key"
                )));
            }
        }
        let mem = seg.alloc(std::mem::size_of::<UndoHeader<V, L>>() as u64)?;
        let hdr = mem.cast::<UndoHeader<V, L>>();
        let cfg = seg.config();
        unsafe {
            hdr.as_ptr().write(UndoHeader {
                sets: Default::default(),
                created: RawSet::new(),
                old_head: SegPtr::null(),
                removed_head: SegPtr::null(),
                stack: SegVec::new(),
                node_free: FreeList::new(),
                old_free: FreeList::new(),
                created_free: FreeList::new(),
                next_id: 0,
                create_without_undo_next_id: -1,
                first_next_id: 0,
                revision: 0,
                monotonic_revision: 0,
                database_id: cfg.database_id,
                instance_id: cfg.instance_id,
                size_of_node: std::mem::size_of::<NodeOf<V, L>>() as u32,
                size_of_header: std::mem::size_of::<UndoHeader<V, L>>() as u32,
            });
        }
        let idx = UndoIndex { seg: seg.clone(), hdr, _marker: PhantomData };
        idx.stamp_ids();
        Ok(idx)
    }

    /// Re-attach to a container previously created at `offset` (see
    /// [`UndoIndex::root_offset`]) in a remapped segment.
    pub fn open(seg: &Rc<Segment>, offset: u64) -> Result<Self, IndexError> {
        let hdr = SegPtr::<UndoHeader<V, L>>::from_offset(offset)
            .get(seg.base())
            .ok_or_else(|| IndexError::Logic("null undo index offset".into()))?;
        let idx = UndoIndex { seg: seg.clone(), hdr, _marker: PhantomData };
        idx.validate()?;
        Ok(idx)
    }

    /// Where this container's header sits inside its segment. Hosts persist
    /// this to find the container again after a restart.
    pub fn root_offset(&self) -> u64 {
        SegPtr::from_raw(self.seg.base(), self.hdr.as_ptr()).offset()
    }

    /// Check that the persisted layout matches this build of the code.
    pub fn validate(&self) -> Result<(), IndexError> {
        let hdr = self.h();
        if hdr.size_of_node != std::mem::size_of::<NodeOf<V, L>>() as u32
            || hdr.size_of_header != std::mem::size_of::<UndoHeader<V, L>>() as u32
        {
            return Err(IndexError::Logic(
                "content of memory does not match data expected by executable".into(),
            ));
        }
        Ok(())
    }

    // ---- plumbing ----------------------------------------------------

    #[allow(clippy::mut_from_ref)]
    fn h(&self) -> &mut UndoHeader<V, L> {
        // single-writer discipline; see the module docs
        unsafe { &mut *self.hdr.as_ptr() }
    }

    fn base(&self) -> *mut u8 {
        self.seg.base()
    }

    fn dup(&self) -> Self {
        UndoIndex { seg: self.seg.clone(), hdr: self.hdr, _marker: PhantomData }
    }

    fn node_alloc(&self) -> NodeAllocator<NodeOf<V, L>> {
        unsafe { NodeAllocator::new(self.base(), NonNull::from(&mut self.h().node_free)) }
    }

    fn old_alloc(&self) -> NodeAllocator<OldOf<V, L>> {
        unsafe { NodeAllocator::new(self.base(), NonNull::from(&mut self.h().old_free)) }
    }

    fn created_alloc(&self) -> NodeAllocator<CreatedOf<V, L>> {
        unsafe { NodeAllocator::new(self.base(), NonNull::from(&mut self.h().created_free)) }
    }

    fn shared_alloc(&self) -> SharedAlloc {
        SharedAlloc::from_config(&self.seg.config())
    }

    fn check_writable(&self) -> Result<(), IndexError> {
        if self.seg.is_read_only() {
            return Err(IndexError::Logic("attempting to mutate a read-only database".into()));
        }
        Ok(())
    }

    fn stamp_ids(&self) {
        let hdr = self.h();
        for set in hdr.sets.as_mut().iter_mut() {
            set.instance_id = hdr.instance_id;
            set.database_id = hdr.database_id;
        }
        hdr.created.instance_id = hdr.instance_id;
        hdr.created.database_id = hdr.database_id;
    }

    fn ids(&self) -> (u64, u64) {
        let hdr = self.h();
        (hdr.instance_id, hdr.database_id)
    }

    unsafe fn node_of(&self, row: RowRef<V>) -> NonNull<NodeOf<V, L>> {
        node_of_value::<V, L::Hooks>(row.as_nonnull())
    }

    unsafe fn value_ptr(&self, node: NonNull<NodeOf<V, L>>) -> NonNull<u8> {
        NonNull::from(&node.as_ref().value).cast()
    }

    fn removed_flag(node: NonNull<NodeOf<V, L>>) -> bool {
        unsafe { hook_of(node, 0).as_ref().balance() == ERASED_FLAG }
    }

    fn set_removed_flag(node: NonNull<NodeOf<V, L>>, on: bool) {
        unsafe { hook_of(node, 0).as_mut().set_balance(if on { ERASED_FLAG } else { 0 }) };
    }

    // ---- configuration ----------------------------------------------

    pub fn set_database_id(&self, id: u64) {
        self.h().database_id = id;
        self.stamp_ids();
    }

    pub fn database_id(&self) -> u64 {
        self.h().database_id
    }

    pub fn set_instance_id(&self, id: u64) {
        self.h().instance_id = id;
        self.stamp_ids();
    }

    pub fn instance_id(&self) -> u64 {
        self.h().instance_id
    }

    /// Initialize the split id generators from base `next_id`: objects
    /// created outside undo tracking draw from `[next_id, next_id + C)`,
    /// tracked objects from `next_id + C` upward, with
    /// `C = MAX_CREATE_WITHOUT_UNDO_NEXT_ID`.
    pub fn init_next_id(&self, next_id: i64) -> Result<(), IndexError> {
        let hdr = self.h();
        if hdr.next_id != 0 {
            return Err(IndexError::Logic("next_id already initialized".into()));
        }
        hdr.create_without_undo_next_id = next_id;
        hdr.next_id = next_id + MAX_CREATE_WITHOUT_UNDO_NEXT_ID;
        hdr.first_next_id = next_id;
        for set in hdr.sets.as_mut().iter_mut() {
            set.first_next_id = next_id;
        }
        Ok(())
    }

    pub fn first_next_id(&self) -> i64 {
        self.h().first_next_id
    }

    pub fn next_id(&self) -> i64 {
        self.h().next_id
    }

    pub fn create_without_undo_next_id(&self) -> i64 {
        self.h().create_without_undo_next_id
    }

    // ---- creation ----------------------------------------------------

    /// Construct a value in place and link it into every index.
    /// Exception safety: strong — any failure leaves the container as it
    /// was.
    pub fn emplace(
        &self,
        ctor: impl FnOnce(&SharedAlloc) -> V,
    ) -> Result<RowRef<'_, V>, IndexError> {
        self.check_writable()?;
        let new_id = self.h().next_id;
        let (inst, db) = self.ids();
        events::with_events(inst, |ev| ev.on_create_begin(inst, db, new_id));
        let result = self.emplace_at(Oid::new(new_id), ctor, true);
        events::with_events(inst, |ev| {
            ev.on_create_end(inst, db, new_id, result.as_ref().ok().map(|r| r.as_nonnull().cast()))
        });
        let row = result?;
        self.h().next_id += 1;
        Ok(row)
    }

    /// Bootstrap path: place a value under a caller-chosen id. Only legal
    /// while no id has ever been assigned.
    pub fn emplace_with_id(
        &self,
        id: Oid<V>,
        ctor: impl FnOnce(&SharedAlloc) -> V,
    ) -> Result<RowRef<'_, V>, IndexError> {
        self.check_writable()?;
        if self.h().next_id != 0 {
            return Err(IndexError::Logic(
                "emplace_with_id can only be used while next_id is zero".into(),
            ));
        }
        self.emplace_at(id, ctor, true)
    }

    /// Create an object that is invisible to the undo machinery until it is
    /// later modified or removed. Draws from the second id generator so the
    /// object is indistinguishable from one loaded outside any session.
    pub fn emplace_without_undo(
        &self,
        ctor: impl FnOnce(&SharedAlloc) -> V,
    ) -> Result<RowRef<'_, V>, IndexError> {
        self.check_writable()?;
        let hdr = self.h();
        if hdr.create_without_undo_next_id == -1 {
            if hdr.stack.is_empty() {
                return self.emplace(ctor);
            }
            return Err(IndexError::Logic(
                "cannot emplace_without_undo while create_without_undo_next_id is uninitialized"
                    .into(),
            ));
        }
        let new_id = hdr.create_without_undo_next_id;
        if new_id + 1 >= hdr.first_next_id + MAX_CREATE_WITHOUT_UNDO_NEXT_ID {
            return Err(IndexError::Overflow(
                "create_without_undo_next_id would overflow into the undo-tracked range".into(),
            ));
        }
        let row = self.emplace_at(Oid::new(new_id), ctor, false)?;
        self.h().create_without_undo_next_id += 1;
        Ok(row)
    }

    fn emplace_at(
        &self,
        id: Oid<V>,
        ctor: impl FnOnce(&SharedAlloc) -> V,
        track: bool,
    ) -> Result<RowRef<'_, V>, IndexError> {
        if track && id.raw() - self.h().first_next_id >= MAX_NEXT_ID {
            return Err(IndexError::Overflow(format!(
                "next_id {} reached the per-index ceiling",
                id.raw()
            )));
        }
        let node = self.node_alloc().allocate()?;
        let alloc = self.shared_alloc();
        let mut value = ctor(&alloc);
        value.set_id(id);
        unsafe {
            node.as_ptr().write(RawNode { hooks: Default::default(), mtime: 0, value });
        }
        let base = self.base();
        let hdr = self.h();
        let inserted = unsafe { L::insert_from(&mut hdr.sets, base, node, 0) };
        if !inserted {
            unsafe { std::ptr::drop_in_place(&mut node.as_ptr().as_mut().unwrap().value) };
            self.node_alloc().deallocate(node);
            return Err(IndexError::Unique(format!(
                "could not insert object with id {} into database {}",
                id.raw(),
                hdr.database_id
            )));
        }
        if track {
            if let Err(e) = self.on_create(node) {
                unsafe {
                    L::erase_from(&mut hdr.sets, base, node, 0);
                    std::ptr::drop_in_place(&mut node.as_ptr().as_mut().unwrap().value);
                }
                self.node_alloc().deallocate(node);
                return Err(e);
            }
        }
        Ok(unsafe { RowRef::new(NonNull::from(&node.as_ref().value)) })
    }

    fn on_create(&self, node: NonNull<NodeOf<V, L>>) -> Result<(), IndexError> {
        let hdr = self.h();
        if hdr.stack.is_empty() {
            return Ok(());
        }
        unsafe { node.as_ptr().as_mut().unwrap().mtime = hdr.monotonic_revision };
        self.insert_created_value(node)
    }

    fn insert_created_value(&self, node: NonNull<NodeOf<V, L>>) -> Result<(), IndexError> {
        if primary_is_id::<V, L>() {
            return Ok(());
        }
        let rec = self.created_alloc().allocate()?;
        let base = self.base();
        unsafe {
            rec.as_ptr().write(CreatedNode {
                hook: Hook::new(),
                id: node.as_ref().value.id().raw(),
                current: SegPtr::from_raw(base, node.as_ptr()),
            });
            let hook = NonNull::from(&rec.as_ref().hook);
            if avl::insert_unique(&mut self.h().created, base, hook, |a, b| unsafe {
                created_id::<V, L>(a).cmp(&created_id::<V, L>(b))
            })
            .is_err()
            {
                self.created_alloc().deallocate(rec);
                return Err(IndexError::Logic(
                    "on_create: a created-value record with this id already exists".into(),
                ));
            }
        }
        Ok(())
    }

    // ---- modification ------------------------------------------------

    /// Apply `mutator` to the live value, snapshotting it first when an
    /// open session will need the prior state. The id must not change.
    /// Exception safety: basic — if the mutated value conflicts with
    /// another object, the modification is reverted (or, when it cannot
    /// be, the object is removed) before the error returns.
    pub fn modify(
        &self,
        row: RowRef<'_, V>,
        mutator: impl FnOnce(&mut V),
    ) -> Result<(), IndexError> {
        self.check_writable()?;
        let node = unsafe { self.node_of(row) };
        let (inst, db) = self.ids();
        let obj = unsafe { self.value_ptr(node) };
        events::with_events(inst, |ev| ev.on_modify_begin(inst, db, obj));

        let backup = self.on_modify(node)?;
        let old_id = unsafe { node.as_ref().value.id() };
        unsafe { mutator(&mut node.as_ptr().as_mut().unwrap().value) };
        assert!(
            unsafe { node.as_ref().value.id() } == old_id,
            "the object id must not be modified"
        );

        let base = self.base();
        let from = if primary_is_id::<V, L>() { 1 } else { 0 };
        let hdr = self.h();
        let success = unsafe { L::post_modify(&mut hdr.sets, base, node, true, from) };
        if !success {
            match backup {
                Some(old) => unsafe {
                    // put the saved value (and its mtime) back and drop the
                    // snapshot, so a later modify snapshots afresh
                    let saved = std::ptr::read(&old.as_ref().value);
                    *(&mut node.as_ptr().as_mut().unwrap().value) = saved;
                    node.as_ptr().as_mut().unwrap().mtime = old.as_ref().mtime;
                    let ok = L::post_modify(&mut hdr.sets, base, node, true, from);
                    debug_assert!(ok, "restoring the old value cannot conflict");
                    let popped = self.pop_front_old();
                    debug_assert_eq!(popped, Some(old));
                    self.old_alloc().deallocate(old);
                },
                None => {
                    // no snapshot to restore; the object cannot stay
                    self.remove_with_events(node);
                }
            }
        }
        events::with_events(inst, |ev| ev.on_modify_end(inst, db, obj, success));
        if success {
            Ok(())
        } else {
            Err(IndexError::Unique("could not modify object".into()))
        }
    }

    fn on_modify(
        &self,
        node: NonNull<NodeOf<V, L>>,
    ) -> Result<Option<NonNull<OldOf<V, L>>>, IndexError> {
        let hdr = self.h();
        hdr.monotonic_revision += 1;
        let mtime = unsafe { node.as_ref().mtime };
        let snapshot = match unsafe { hdr.stack.back(self.base()) } {
            Some(top) if mtime < top.ctime => {
                let old = self.old_alloc().allocate()?;
                unsafe {
                    old.as_ptr().write(OldNode {
                        hook: Hook::new(),
                        mtime,
                        current: SegPtr::from_raw(self.base(), node.as_ptr()),
                        value: node.as_ref().value.clone(),
                    });
                }
                self.push_front_old(old);
                Some(old)
            }
            _ => None,
        };
        unsafe { node.as_ptr().as_mut().unwrap().mtime = hdr.monotonic_revision };
        Ok(snapshot)
    }

    // ---- removal -----------------------------------------------------

    /// Unlink the value from every index. Outside a session (or for a
    /// value created inside the innermost one) it is destroyed on the
    /// spot; otherwise it parks on the removed list until the session
    /// resolves.
    pub fn remove(&self, row: RowRef<'_, V>) -> Result<(), IndexError> {
        self.check_writable()?;
        let node = unsafe { self.node_of(row) };
        self.remove_with_events(node);
        Ok(())
    }

    fn remove_with_events(&self, node: NonNull<NodeOf<V, L>>) {
        let (inst, db) = self.ids();
        let obj = unsafe { self.value_ptr(node) };
        events::with_events(inst, |ev| ev.on_remove_begin(inst, db, obj));
        self.remove_inner(node);
        events::with_events(inst, |ev| ev.on_remove_end(inst, db));
    }

    fn remove_inner(&self, node: NonNull<NodeOf<V, L>>) {
        let base = self.base();
        let hdr = self.h();
        unsafe { L::erase_from(&mut hdr.sets, base, node, 0) };
        if self.on_remove(node) {
            self.dispose_node(node);
        }
    }

    /// Returns true when the node should be destroyed immediately.
    fn on_remove(&self, node: NonNull<NodeOf<V, L>>) -> bool {
        let base = self.base();
        let hdr = self.h();
        if hdr.stack.is_empty() {
            return true;
        }
        if !primary_is_id::<V, L>() {
            let id = unsafe { node.as_ref().value.id().raw() };
            if let Some(hook) = unsafe {
                avl::find(&hdr.created, base, |h| id.cmp(&unsafe { created_id::<V, L>(h) }))
            } {
                unsafe { avl::erase(&mut hdr.created, base, hook) };
                self.created_alloc().deallocate(unsafe { created_of_hook::<V, L>(hook) });
            }
        }
        let top = unsafe { hdr.stack.back(base) }.unwrap();
        if unsafe { node.as_ref().value.id().raw() } >= top.old_next_id {
            // created and removed within the same session: both steps vanish
            return true;
        }
        Self::set_removed_flag(node, true);
        self.push_front_removed(node);
        false
    }

    /// Destroy immediately, bypassing session bookkeeping. Only legal for
    /// mature objects (ones no open session tracks).
    pub fn remove_without_undo(&self, row: RowRef<'_, V>) -> Result<(), IndexError> {
        self.check_writable()?;
        if !self.is_mature_object(row) {
            return Err(IndexError::Logic(
                "cannot remove object directly while it is in the undo stack".into(),
            ));
        }
        let node = unsafe { self.node_of(row) };
        let base = self.base();
        let hdr = self.h();
        unsafe { L::erase_from(&mut hdr.sets, base, node, 0) };
        self.dispose_node(node);
        Ok(())
    }

    /// True iff the object predates every open session: destroying it needs
    /// no session bookkeeping.
    pub fn is_mature_object(&self, row: RowRef<'_, V>) -> bool {
        let hdr = self.h();
        if hdr.stack.is_empty() {
            return true;
        }
        let oldest = unsafe { hdr.stack.get(self.base(), 0) };
        let node = unsafe { self.node_of(row) };
        unsafe { node.as_ref().mtime < oldest.ctime && row.id().raw() < oldest.old_next_id }
    }

    // ---- reads -------------------------------------------------------

    /// The view over the index tagged by spec `S`.
    ///
    /// # Panics
    /// Panics if `S` is not one of this container's index specs.
    pub fn by<S: KeySpec<V>>(&self) -> SetView<'_, V, L, S> {
        let slot = L::slot_of(TypeId::of::<S>()).expect("no index with this key spec");
        SetView::new(&self.h().sets.as_ref()[slot], self.base(), slot)
    }

    fn primary(&self) -> SetView<'_, V, L, L::Primary> {
        SetView::new(&self.h().sets.as_ref()[0], self.base(), 0)
    }

    pub fn find(
        &self,
        key: &<L::Primary as KeySpec<V>>::Key,
    ) -> Option<RowRef<'_, V>> {
        self.primary().find(key)
    }

    pub fn get(
        &self,
        key: &<L::Primary as KeySpec<V>>::Key,
    ) -> Result<RowRef<'_, V>, IndexError> {
        self.find(key).ok_or_else(|| IndexError::OutOfRange(format!("key not found: {key:?}")))
    }

    pub fn iter(&self) -> crate::multi::Iter<'_, V, L> {
        self.primary().iter()
    }

    pub fn len(&self) -> usize {
        self.h().sets.as_ref()[0].len() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn indices_count(&self) -> usize {
        L::COUNT
    }

    /// Visit every object through every index, in index order. Handy for
    /// integrity sweeps.
    pub fn walk(&self, mut f: impl FnMut(usize, usize, &V)) {
        let base = self.base();
        for (slot, set) in self.h().sets.as_ref().iter().enumerate() {
            let mut pos = 0;
            let mut cur = unsafe { avl::first(set, base) };
            while let Some(h) = cur {
                let node = unsafe { crate::multi::node_of_hook::<V, L::Hooks>(h, slot) };
                f(slot, pos, unsafe { &node.as_ref().value });
                pos += 1;
                cur = unsafe { avl::next(h) };
            }
        }
    }

    // ---- sessions ----------------------------------------------------

    /// Push a session checkpoint. The returned handle undoes it on drop
    /// unless `push()` or `squash()` intervenes. With `enabled == false`
    /// the handle is inert.
    pub fn start_undo_session(&self, enabled: bool) -> Result<UndoSession<V, L>, IndexError> {
        self.check_writable()?;
        if enabled {
            self.add_session()?;
        }
        Ok(UndoSession { idx: self.dup(), apply: enabled })
    }

    fn add_session(&self) -> Result<u64, IndexError> {
        let base = self.base();
        let hdr = self.h();
        hdr.monotonic_revision += 1;
        let state = UndoState {
            old_values_end: hdr.old_head.cast(),
            removed_values_end: hdr.removed_head.cast(),
            old_next_id: hdr.next_id,
            ctime: hdr.monotonic_revision,
        };
        unsafe { hdr.stack.push(base, state)? };
        hdr.revision += 1;
        Ok(hdr.revision)
    }

    pub fn revision(&self) -> u64 {
        self.h().revision
    }

    /// Both ends of the currently undoable revision window.
    pub fn undo_stack_revision_range(&self) -> (u64, u64) {
        let hdr = self.h();
        (hdr.revision - hdr.stack.len() as u64, hdr.revision)
    }

    pub fn has_undo_session(&self) -> bool {
        !self.h().stack.is_empty()
    }

    /// Jump the revision counter forward. Only legal with no open
    /// sessions, and the counter never goes backwards.
    pub fn set_revision(&self, revision: u64) -> Result<(), IndexError> {
        let hdr = self.h();
        if !hdr.stack.is_empty() {
            return Err(IndexError::Logic(
                "cannot set revision while there is an existing undo stack".into(),
            ));
        }
        if revision < hdr.revision {
            return Err(IndexError::Logic("revision cannot decrease".into()));
        }
        hdr.revision = revision;
        Ok(())
    }

    /// Roll the container back to the state at the top checkpoint.
    pub fn undo(&self) {
        let base = self.base();
        let hdr = self.h();
        let Some(state) = (unsafe { hdr.stack.back(base) }) else { return };
        let (inst, db) = self.ids();

        // 1. drop everything created since the session began
        if primary_is_id::<V, L>() {
            let created: Vec<_> = self.collect_main_from(state.old_next_id);
            for node in created {
                events::with_events(inst, |ev| {
                    ev.on_undo_remove_value(inst, db, unsafe { self.value_ptr(node) })
                });
                unsafe { L::erase_from(&mut self.h().sets, base, node, 0) };
                self.dispose_node(node);
            }
        } else {
            let created: Vec<_> = self.collect_created_from(state.old_next_id);
            for rec in created {
                let node = unsafe { rec.as_ref().current.get_unchecked(base) };
                if !Self::removed_flag(node) {
                    events::with_events(inst, |ev| {
                        ev.on_undo_remove_value(inst, db, unsafe { self.value_ptr(node) })
                    });
                    unsafe { L::erase_from(&mut self.h().sets, base, node, 0) };
                    self.dispose_node(node);
                }
                let hook = unsafe { NonNull::from(&rec.as_ref().hook) };
                unsafe { avl::erase(&mut self.h().created, base, hook) };
                self.created_alloc().deallocate(rec);
            }
        }

        // 2. restore modified values, oldest snapshot last. Entries whose
        // saved mtime is not older than the session arise only from squash
        // and are superseded by an earlier snapshot further down the list.
        let old_end = state.old_values_end.cast::<OldOf<V, L>>().get(base);
        while self.h().old_head.get(base) != old_end {
            let old = self.pop_front_old().expect("old-values list shorter than its marker");
            let restored_mtime = unsafe { old.as_ref().mtime };
            if restored_mtime < state.ctime {
                let node = unsafe { old.as_ref().current.get_unchecked(base) };
                unsafe {
                    let saved = std::ptr::read(&old.as_ref().value);
                    *(&mut node.as_ptr().as_mut().unwrap().value) = saved;
                    node.as_ptr().as_mut().unwrap().mtime = restored_mtime;
                }
                if !Self::removed_flag(node) {
                    // transient duplicates against not-yet-restored removed
                    // values are resolved in step 3
                    let from = if primary_is_id::<V, L>() { 1 } else { 0 };
                    let ok =
                        unsafe { L::post_modify(&mut self.h().sets, base, node, false, from) };
                    debug_assert!(ok);
                }
                self.old_alloc().deallocate(old);
            } else {
                self.dispose_old(old);
            }
        }

        // 3. re-insert removed values that predate the session
        let removed_end = state.removed_values_end.cast::<NodeOf<V, L>>().get(base);
        while self.h().removed_head.get(base) != removed_end {
            let node = self.pop_front_removed().expect("removed list shorter than its marker");
            let id = unsafe { node.as_ref().value.id().raw() };
            if id < state.old_next_id {
                Self::set_removed_flag(node, false);
                let ok = unsafe { L::insert_from(&mut self.h().sets, base, node, 0) };
                debug_assert!(ok, "re-inserting a removed value cannot conflict");
                events::with_events(inst, |ev| {
                    ev.on_undo_add_value(inst, db, unsafe { self.value_ptr(node) })
                });
                if !primary_is_id::<V, L>() {
                    let oldest = unsafe { self.h().stack.get(base, 0) };
                    if id >= oldest.old_next_id {
                        self.insert_created_value(node)
                            .expect("created-value bookkeeping failed during undo");
                    }
                }
            } else {
                self.dispose_node(node);
            }
        }

        let hdr = self.h();
        hdr.next_id = state.old_next_id;
        unsafe { hdr.stack.pop(base) };
        hdr.revision -= 1;
    }

    pub fn undo_all(&self) {
        while self.has_undo_session() {
            self.undo();
        }
    }

    /// Merge the innermost session into the one beneath it.
    pub fn squash(&self) {
        let base = self.base();
        let hdr = self.h();
        if hdr.stack.len() >= 2 {
            let prev = unsafe { hdr.stack.get(base, hdr.stack.len() - 2) };
            self.compress_impl(&prev);
        }
        self.squash_fast();
    }

    fn squash_fast(&self) {
        let base = self.base();
        let hdr = self.h();
        if hdr.stack.is_empty() {
            return;
        }
        if hdr.stack.len() == 1 {
            self.dispose_undo();
        }
        unsafe { self.h().stack.pop(base) };
        self.h().revision -= 1;
    }

    /// Drop side-list entries of the innermost session that a squash into
    /// the previous session would make redundant.
    fn compress_impl(&self, prev: &UndoState) {
        let base = self.base();
        let top = unsafe { self.h().stack.back(base) }.unwrap();
        let old_end = top.old_values_end.cast::<OldOf<V, L>>().get(base);
        self.old_list_retain_until(old_end, |this, old| {
            let o = unsafe { old.as_ref() };
            if o.mtime >= prev.ctime {
                this.dispose_old(old);
                return false;
            }
            let node = unsafe { o.current.get_unchecked(base) };
            if Self::removed_flag(node) {
                // fold the saved value into the removed node so a later
                // undo restores it from there
                unsafe {
                    let saved = std::ptr::read(&old.as_ref().value);
                    *(&mut node.as_ptr().as_mut().unwrap().value) = saved;
                    node.as_ptr().as_mut().unwrap().mtime = o.mtime;
                }
                this.old_alloc().deallocate(old);
                return false;
            }
            true
        });
        let removed_end = top.removed_values_end.cast::<NodeOf<V, L>>().get(base);
        self.removed_list_retain_until(removed_end, |this, node| {
            if unsafe { node.as_ref().value.id().raw() } >= prev.old_next_id {
                this.dispose_node(node);
                return false;
            }
            true
        });
    }

    /// Compress the innermost session in place (without merging it away),
    /// minimizing its side-list footprint.
    pub fn compress_last_undo_session(&self) {
        let base = self.base();
        if let Some(top) = unsafe { self.h().stack.back(base) } {
            self.compress_impl(&top);
        }
    }

    /// Discard all checkpoints with revision at or below `revision`. Never
    /// touches the main index.
    pub fn commit(&self, revision: u64) {
        let base = self.base();
        let hdr = self.h();
        let revision = revision.min(hdr.revision);
        if revision == hdr.revision {
            self.dispose_undo();
            self.h().stack.clear();
        } else if hdr.revision - revision < hdr.stack.len() as u64 {
            let keep_from = hdr.stack.len() - (hdr.revision - revision) as usize;
            let survivor = unsafe { hdr.stack.get(base, keep_from) };
            if !primary_is_id::<V, L>() {
                let stale: Vec<_> = self.collect_created_below(survivor.old_next_id);
                for rec in stale {
                    let hook = unsafe { NonNull::from(&rec.as_ref().hook) };
                    unsafe { avl::erase(&mut self.h().created, base, hook) };
                    self.created_alloc().deallocate(rec);
                }
            }
            self.dispose_behind(&survivor);
            unsafe { self.h().stack.drain_front(base, keep_from) };
        }
    }

    /// The innermost session's delta, compressed first: values created,
    /// prior states of values modified, and values removed within it.
    pub fn last_undo_session(&self) -> Delta<'_, V> {
        let base = self.base();
        let Some(top) = (unsafe { self.h().stack.back(base) }) else {
            return Delta { new_values: vec![], old_values: vec![], removed_values: vec![] };
        };
        self.compress_last_undo_session();

        let mut new_values = Vec::new();
        if primary_is_id::<V, L>() {
            for node in self.collect_main_from(top.old_next_id) {
                new_values.push(unsafe { RowRef::new(NonNull::from(&node.as_ref().value)) });
            }
        } else {
            for rec in self.collect_created_from(top.old_next_id) {
                let node = unsafe { rec.as_ref().current.get_unchecked(base) };
                new_values.push(unsafe { RowRef::new(NonNull::from(&node.as_ref().value)) });
            }
        }

        let mut old_values = Vec::new();
        let old_end = top.old_values_end.cast::<OldOf<V, L>>().get(base);
        let mut cur = self.h().old_head.get(base);
        while cur != old_end {
            let old = cur.unwrap();
            old_values.push(unsafe { &(*old.as_ptr()).value });
            cur = unsafe { next_old::<V, L>(old) };
        }

        let mut removed_values = Vec::new();
        let removed_end = top.removed_values_end.cast::<NodeOf<V, L>>().get(base);
        let mut cur = self.h().removed_head.get(base);
        while cur != removed_end {
            let node = cur.unwrap();
            removed_values.push(unsafe { RowRef::new(NonNull::from(&node.as_ref().value)) });
            cur = unsafe { next_removed::<V, L>(node) };
        }

        Delta { new_values, old_values, removed_values }
    }

    /// Dispose every object and reset the container to empty. The undo
    /// stack must be resolved first.
    pub fn clear(&self) -> Result<(), IndexError> {
        self.check_writable()?;
        if self.has_undo_session() {
            return Err(IndexError::Logic("cannot clear with open undo sessions".into()));
        }
        self.dispose_undo();
        let nodes: Vec<_> = self.collect_main_from(i64::MIN);
        let hdr = self.h();
        for set in hdr.sets.as_mut().iter_mut() {
            set.reset_links();
        }
        for node in nodes {
            self.dispose_node(node);
        }
        Ok(())
    }

    // ---- side-list plumbing ------------------------------------------

    fn push_front_old(&self, old: NonNull<OldOf<V, L>>) {
        let base = self.base();
        let hdr = self.h();
        let next = hdr.old_head.get(base).map(|n| unsafe { NonNull::from(&n.as_ref().hook) });
        unsafe { (*old.as_ptr()).hook.set_next(next) };
        hdr.old_head = SegPtr::from_raw(base, old.as_ptr());
    }

    fn pop_front_old(&self) -> Option<NonNull<OldOf<V, L>>> {
        let base = self.base();
        let hdr = self.h();
        let head = hdr.old_head.get(base)?;
        hdr.old_head = SegPtr::from_nonnull(base, unsafe { next_old::<V, L>(head) });
        Some(head)
    }

    fn push_front_removed(&self, node: NonNull<NodeOf<V, L>>) {
        let base = self.base();
        let hdr = self.h();
        let next = hdr.removed_head.get(base).map(|n| unsafe { hook_of(n, 0) });
        unsafe { hook_of(node, 0).as_mut().set_next(next) };
        hdr.removed_head = SegPtr::from_raw(base, node.as_ptr());
    }

    fn pop_front_removed(&self) -> Option<NonNull<NodeOf<V, L>>> {
        let base = self.base();
        let hdr = self.h();
        let head = hdr.removed_head.get(base)?;
        hdr.removed_head = SegPtr::from_nonnull(base, unsafe { next_removed::<V, L>(head) });
        Some(head)
    }

    /// Walk old-values entries in front of `end`, dropping those the
    /// predicate disposes of (it returns false after disposing).
    fn old_list_retain_until(
        &self,
        end: Option<NonNull<OldOf<V, L>>>,
        mut keep: impl FnMut(&Self, NonNull<OldOf<V, L>>) -> bool,
    ) {
        let base = self.base();
        let mut prev: Option<NonNull<OldOf<V, L>>> = None;
        let mut cur = self.h().old_head.get(base);
        while cur != end {
            let old = cur.unwrap();
            let nxt = unsafe { next_old::<V, L>(old) };
            if !keep(self, old) {
                match prev {
                    None => self.h().old_head = SegPtr::from_nonnull(base, nxt),
                    Some(p) => unsafe {
                        (*p.as_ptr())
                            .hook
                            .set_next(nxt.map(|n| NonNull::from(&n.as_ref().hook)))
                    },
                }
            } else {
                prev = Some(old);
            }
            cur = nxt;
        }
    }

    fn removed_list_retain_until(
        &self,
        end: Option<NonNull<NodeOf<V, L>>>,
        mut keep: impl FnMut(&Self, NonNull<NodeOf<V, L>>) -> bool,
    ) {
        let base = self.base();
        let mut prev: Option<NonNull<NodeOf<V, L>>> = None;
        let mut cur = self.h().removed_head.get(base);
        while cur != end {
            let node = cur.unwrap();
            let nxt = unsafe { next_removed::<V, L>(node) };
            if !keep(self, node) {
                match prev {
                    None => self.h().removed_head = SegPtr::from_nonnull(base, nxt),
                    Some(p) => unsafe {
                        hook_of(p, 0).as_mut().set_next(nxt.map(|n| hook_of(n, 0)))
                    },
                }
            } else {
                prev = Some(node);
            }
            cur = nxt;
        }
    }

    /// Dispose side-list entries strictly behind the given session's
    /// markers (they belonged to sessions being committed away). Like the
    /// original, this leaves the marker entry itself for a later cleanup
    /// pass.
    fn dispose_behind(&self, survivor: &UndoState) {
        let base = self.base();
        if let Some(marker) = survivor.old_values_end.cast::<OldOf<V, L>>().get(base) {
            let mut cur = unsafe { next_old::<V, L>(marker) };
            unsafe { (*marker.as_ptr()).hook.set_next(None) };
            while let Some(old) = cur {
                cur = unsafe { next_old::<V, L>(old) };
                self.dispose_old(old);
            }
        }
        if let Some(marker) = survivor.removed_values_end.cast::<NodeOf<V, L>>().get(base) {
            let mut cur = unsafe { next_removed::<V, L>(marker) };
            unsafe { hook_of(marker, 0).as_mut().set_next(None) };
            while let Some(node) = cur {
                cur = unsafe { next_removed::<V, L>(node) };
                self.dispose_node(node);
            }
        }
    }

    fn dispose_undo(&self) {
        while let Some(old) = self.pop_front_old() {
            self.dispose_old(old);
        }
        while let Some(node) = self.pop_front_removed() {
            self.dispose_node(node);
        }
        let stale: Vec<_> = self.collect_created_below(i64::MAX);
        let base = self.base();
        for rec in stale {
            let hook = unsafe { NonNull::from(&rec.as_ref().hook) };
            unsafe { avl::erase(&mut self.h().created, base, hook) };
            self.created_alloc().deallocate(rec);
        }
    }

    fn dispose_node(&self, node: NonNull<NodeOf<V, L>>) {
        unsafe { std::ptr::drop_in_place(&mut node.as_ptr().as_mut().unwrap().value) };
        self.node_alloc().deallocate(node);
    }

    fn dispose_old(&self, old: NonNull<OldOf<V, L>>) {
        unsafe { std::ptr::drop_in_place(&mut old.as_ptr().as_mut().unwrap().value) };
        self.old_alloc().deallocate(old);
    }

    // ---- collection helpers ------------------------------------------

    fn collect_main_from(&self, from_id: i64) -> Vec<NonNull<NodeOf<V, L>>> {
        let base = self.base();
        let set = &self.h().sets.as_ref()[0];
        let mut out = Vec::new();
        let mut cur = unsafe {
            avl::lower_bound(set, base, |h| from_id.cmp(&unsafe { main_id::<V, L>(h) }))
        };
        while let Some(h) = cur {
            out.push(unsafe { crate::multi::node_of_hook::<V, L::Hooks>(h, 0) });
            cur = unsafe { avl::next(h) };
        }
        out
    }

    fn collect_created_from(&self, from_id: i64) -> Vec<NonNull<CreatedOf<V, L>>> {
        let base = self.base();
        let set = &self.h().created;
        let mut out = Vec::new();
        let mut cur = unsafe {
            avl::lower_bound(set, base, |h| from_id.cmp(&unsafe { created_id::<V, L>(h) }))
        };
        while let Some(h) = cur {
            out.push(unsafe { created_of_hook::<V, L>(h) });
            cur = unsafe { avl::next(h) };
        }
        out
    }

    fn collect_created_below(&self, below_id: i64) -> Vec<NonNull<CreatedOf<V, L>>> {
        let base = self.base();
        let set = &self.h().created;
        let mut out = Vec::new();
        let mut cur = unsafe { avl::first(set, base) };
        while let Some(h) = cur {
            if unsafe { created_id::<V, L>(h) } >= below_id {
                break;
            }
            out.push(unsafe { created_of_hook::<V, L>(h) });
            cur = unsafe { avl::next(h) };
        }
        out
    }

    pub fn created_value_count(&self) -> usize {
        self.h().created.len() as usize
    }
}

unsafe fn created_of_hook<V: Row, L: IndexList<V>>(h: NonNull<Hook>) -> NonNull<CreatedOf<V, L>> {
    h.cast()
}

unsafe fn created_id<V: Row, L: IndexList<V>>(h: NonNull<Hook>) -> i64 {
    created_of_hook::<V, L>(h).as_ref().id
}

unsafe fn main_id<V: Row, L: IndexList<V>>(h: NonNull<Hook>) -> i64 {
    crate::multi::node_of_hook::<V, L::Hooks>(h, 0).as_ref().value.id().raw()
}

unsafe fn next_old<V: Row, L: IndexList<V>>(
    old: NonNull<OldOf<V, L>>,
) -> Option<NonNull<OldOf<V, L>>> {
    old.as_ref().hook.next().map(|h| h.cast())
}

unsafe fn next_removed<V: Row, L: IndexList<V>>(
    node: NonNull<NodeOf<V, L>>,
) -> Option<NonNull<NodeOf<V, L>>> {
    hook_of(node, 0).as_ref().next().map(|h| crate::multi::node_of_hook::<V, L::Hooks>(h, 0))
}

/// What one session changed: values created within it, prior states of
/// values it modified, and values it removed.
pub struct Delta<'a, V> {
    pub new_values: Vec<RowRef<'a, V>>,
    pub old_values: Vec<&'a V>,
    pub removed_values: Vec<RowRef<'a, V>>,
}

/// Scoped session handle. Dropping it rolls the session back; `push`
/// retains the work permanently (until a later `undo`/`commit` resolves
/// it); `squash` folds it into the session beneath.
pub struct UndoSession<V: Row + Clone, L: IndexList<V>> {
    idx: UndoIndex<V, L>,
    apply: bool,
}

impl<V: Row + Clone, L: IndexList<V>> UndoSession<V, L> {
    /// Keep the session's work on the stack and disarm the handle.
    pub fn push(&mut self) {
        self.apply = false;
    }

    pub fn squash(&mut self) {
        if self.apply {
            self.idx.squash();
        }
        self.apply = false;
    }

    pub fn undo(&mut self) {
        if self.apply {
            self.idx.undo();
        }
        self.apply = false;
    }
}

impl<V: Row + Clone, L: IndexList<V>> Drop for UndoSession<V, L> {
    fn drop(&mut self) {
        if self.apply {
            self.idx.undo();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{Segment, SegmentOptions};

    #[derive(Clone)]
    struct Item {
        id: Oid<Item>,
        n: u64,
    }

    impl Row for Item {
        fn id(&self) -> Oid<Item> {
            self.id
        }
        fn set_id(&mut self, id: Oid<Item>) {
            self.id = id;
        }
    }

    fn fresh(capacity: u64, id: u16) -> Rc<Segment> {
        Segment::anonymous(
            SegmentOptions::builder().capacity(capacity).unique_segment_manager_id(id).build(),
        )
        .unwrap()
    }

    #[test]
    fn regular_generator_hits_its_ceiling() {
        let seg = fresh(1 << 20, 920);
        let idx = UndoIndex::<Item>::create(&seg).unwrap();
        // park the generator one shy of the ceiling
        idx.h().next_id = MAX_NEXT_ID - 1;
        let row = idx.emplace(|_| Item { id: Oid::default(), n: 7 }).unwrap();
        assert_eq!(row.id().raw(), MAX_NEXT_ID - 1);
        let err = idx.emplace(|_| Item { id: Oid::default(), n: 8 }).unwrap_err();
        assert!(matches!(err, IndexError::Overflow(_)));
    }

    #[test]
    fn without_undo_generator_cannot_cross_into_tracked_range() {
        let seg = fresh(1 << 20, 921);
        let idx = UndoIndex::<Item>::create(&seg).unwrap();
        idx.init_next_id(0).unwrap();
        idx.h().create_without_undo_next_id = MAX_CREATE_WITHOUT_UNDO_NEXT_ID - 2;
        idx.emplace_without_undo(|_| Item { id: Oid::default(), n: 1 }).unwrap();
        let err = idx.emplace_without_undo(|_| Item { id: Oid::default(), n: 2 }).unwrap_err();
        assert!(matches!(err, IndexError::Overflow(_)));
    }

    #[test]
    fn session_stack_survives_growth() {
        let seg = fresh(1 << 20, 922);
        let idx = UndoIndex::<Item>::create(&seg).unwrap();
        let mut sessions = Vec::new();
        for _ in 0..40 {
            sessions.push(idx.start_undo_session(true).unwrap());
        }
        assert_eq!(idx.undo_stack_revision_range(), (0, 40));
        for mut s in sessions.into_iter().rev() {
            s.undo();
        }
        assert_eq!(idx.revision(), 0);
        assert!(!idx.has_undo_session());
    }
}
