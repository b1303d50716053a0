//! Typed object ids, key projections and the multi-index composition.
//!
//! An index set is described at the type level as a tuple of zero-sized
//! [`KeySpec`] types, one per index, e.g. `(ById<Account>, ByName)`. The
//! tuple implements [`IndexList`], which pins the node layout (one hook per
//! index, in declaration order) and provides the per-index operations the
//! undo index composes: insert-with-rollback, erase, and the post-modify
//! reposition check. Arities 1 through 4 are unrolled by macro, so "for
//! each index do X" compiles to straight-line code.
//!
//! The same `KeySpec` types double as lookup tags: `index.by::<ByName>()`
//! selects the matching index by spec identity. A tuple naming the same
//! spec twice is a configuration error, rejected when the container is
//! created.

use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::avl::{self, RawSet};
use crate::events;
use crate::offset::Hook;

/// Object id, typed by the row it references and assignable from `i64`.
pub struct Oid<T> {
    raw: i64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Oid<T> {
    pub const fn new(raw: i64) -> Self {
        Oid { raw, _marker: PhantomData }
    }

    pub fn raw(&self) -> i64 {
        self.raw
    }
}

impl<T> Clone for Oid<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Oid<T> {}
impl<T> Default for Oid<T> {
    fn default() -> Self {
        Oid::new(0)
    }
}
impl<T> PartialEq for Oid<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl<T> Eq for Oid<T> {}
impl<T> PartialOrd for Oid<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Oid<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}
impl<T> std::hash::Hash for Oid<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state)
    }
}
impl<T> From<i64> for Oid<T> {
    fn from(raw: i64) -> Self {
        Oid::new(raw)
    }
}
impl<T> std::fmt::Debug for Oid<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "oid({})", self.raw)
    }
}
impl<T> std::fmt::Display for Oid<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "oid({})", self.raw)
    }
}

/// A value type storable in an undo index. The container owns the id: it is
/// assigned at creation and must never change afterwards.
pub trait Row: Sized + 'static {
    fn id(&self) -> Oid<Self>;
    fn set_id(&mut self, id: Oid<Self>);
}

/// A key projection over `V`, implemented by zero-sized marker types. The
/// marker also names the index for lookups. All indexes are ordered-unique;
/// there is no way to configure anything else.
pub trait KeySpec<V: Row>: 'static {
    type Key: Ord + Any + std::fmt::Debug;
    fn key(value: &V) -> Self::Key;
}

/// The canonical primary index: keyed by the object id.
pub struct ById<V>(PhantomData<fn() -> V>);

impl<V: Row> KeySpec<V> for ById<V> {
    type Key = Oid<V>;
    fn key(value: &V) -> Oid<V> {
        value.id()
    }
}

/// The fixed-layout record a value lives in: one hook per index (contiguous,
/// at offset zero, so hook slot `n` of a node is always `node + 16n`), the
/// last-mutation revision, then the value itself.
#[repr(C)]
pub struct RawNode<V, H> {
    pub(crate) hooks: H,
    pub(crate) mtime: u64,
    pub(crate) value: V,
}

pub(crate) unsafe fn hook_of<V, H>(node: NonNull<RawNode<V, H>>, slot: usize) -> NonNull<Hook> {
    NonNull::new_unchecked((node.as_ptr() as *mut Hook).add(slot))
}

pub(crate) unsafe fn node_of_hook<V, H>(h: NonNull<Hook>, slot: usize) -> NonNull<RawNode<V, H>> {
    NonNull::new_unchecked(h.as_ptr().sub(slot) as *mut RawNode<V, H>)
}

pub(crate) unsafe fn node_of_value<V, H>(v: NonNull<V>) -> NonNull<RawNode<V, H>> {
    let off = std::mem::offset_of!(RawNode<V, H>, value);
    NonNull::new_unchecked((v.as_ptr() as *mut u8).sub(off) as *mut RawNode<V, H>)
}

unsafe fn value_of_hook<'a, V, H: 'a>(h: NonNull<Hook>, slot: usize) -> &'a V {
    &node_of_hook::<V, H>(h, slot).as_ref().value
}

/// The tuple of index specs backing one container.
///
/// # Safety
/// Implementations must keep `Hooks`/`Sets`/`COUNT` consistent with each
/// other and with the per-slot operations; the undo index trusts the slot
/// arithmetic blindly. Implemented only by the tuple macro below.
pub unsafe trait IndexList<V: Row>: Sized + 'static {
    /// `[Hook; COUNT]`, the per-node header block.
    type Hooks: Default + 'static;
    /// `[RawSet; COUNT]`, the per-container tree headers.
    type Sets: Default + AsRef<[RawSet]> + AsMut<[RawSet]> + 'static;
    const COUNT: usize;
    type Primary: KeySpec<V>;

    /// The position of spec `S` in the tuple, first match winning.
    fn slot_of(spec: TypeId) -> Option<usize>;

    /// Spec identities in declaration order; used to reject a tuple that
    /// names the same key twice.
    fn spec_ids() -> Vec<TypeId>;

    /// Insert the node into index `slot`; on a key conflict returns the
    /// blocking node's hook and leaves the index unchanged.
    unsafe fn insert_slot(
        sets: &mut Self::Sets,
        base: *mut u8,
        node: NonNull<RawNode<V, Self::Hooks>>,
        slot: usize,
    ) -> Result<(), NonNull<Hook>>;

    unsafe fn erase_slot(
        sets: &mut Self::Sets,
        base: *mut u8,
        node: NonNull<RawNode<V, Self::Hooks>>,
        slot: usize,
    );

    /// Reposition the node in index `slot` if its mutated key violates the
    /// order there. With `unique`, a key conflict parks the node before the
    /// blocking entry and reports `false`; without, duplicates are linked
    /// in (they are transient while undo restores an older state).
    unsafe fn post_modify_slot(
        sets: &mut Self::Sets,
        base: *mut u8,
        node: NonNull<RawNode<V, Self::Hooks>>,
        slot: usize,
        unique: bool,
    ) -> bool;

    /// Insert into indexes `from..COUNT` in declaration order; on conflict
    /// the already-inserted indexes are unwound and `false` comes back.
    unsafe fn insert_from(
        sets: &mut Self::Sets,
        base: *mut u8,
        node: NonNull<RawNode<V, Self::Hooks>>,
        from: usize,
    ) -> bool {
        for slot in from..Self::COUNT {
            if Self::insert_slot(sets, base, node, slot).is_err() {
                for undo in from..slot {
                    Self::erase_slot(sets, base, node, undo);
                }
                return false;
            }
        }
        true
    }

    unsafe fn erase_from(
        sets: &mut Self::Sets,
        base: *mut u8,
        node: NonNull<RawNode<V, Self::Hooks>>,
        from: usize,
    ) {
        for slot in from..Self::COUNT {
            Self::erase_slot(sets, base, node, slot);
        }
    }

    /// Run the post-modify check over indexes `from..COUNT`. Stops at the
    /// first unique-key conflict, leaving the node parked there for the
    /// caller's rollback to resolve.
    unsafe fn post_modify(
        sets: &mut Self::Sets,
        base: *mut u8,
        node: NonNull<RawNode<V, Self::Hooks>>,
        unique: bool,
        from: usize,
    ) -> bool {
        for slot in from..Self::COUNT {
            if !Self::post_modify_slot(sets, base, node, slot, unique) {
                return false;
            }
        }
        true
    }
}

/// True when the primary index is keyed by the object id itself, which lets
/// the container enumerate session-created objects straight from the
/// primary index instead of a side table.
pub(crate) fn primary_is_id<V: Row, L: IndexList<V>>() -> bool {
    TypeId::of::<<L::Primary as KeySpec<V>>::Key>() == TypeId::of::<Oid<V>>()
}

macro_rules! impl_index_list {
    ($len:expr, $first:ident, $(($slot:tt, $I:ident)),+) => {
        unsafe impl<V: Row, $($I: KeySpec<V>),+> IndexList<V> for ($($I,)+) {
            type Hooks = [Hook; $len];
            type Sets = [RawSet; $len];
            const COUNT: usize = $len;
            type Primary = $first;

            fn slot_of(spec: TypeId) -> Option<usize> {
                $(if spec == TypeId::of::<$I>() {
                    return Some($slot);
                })+
                None
            }

            fn spec_ids() -> Vec<TypeId> {
                vec![$(TypeId::of::<$I>()),+]
            }

            unsafe fn insert_slot(
                sets: &mut Self::Sets,
                base: *mut u8,
                node: NonNull<RawNode<V, Self::Hooks>>,
                slot: usize,
            ) -> Result<(), NonNull<Hook>> {
                match slot {
                    $($slot => avl::insert_unique(
                        &mut sets[$slot],
                        base,
                        hook_of(node, $slot),
                        |a, b| unsafe {
                            $I::key(value_of_hook::<V, Self::Hooks>(a, $slot))
                                .cmp(&$I::key(value_of_hook::<V, Self::Hooks>(b, $slot)))
                        },
                    ),)+
                    _ => unreachable!("index slot out of range"),
                }
            }

            unsafe fn erase_slot(
                sets: &mut Self::Sets,
                base: *mut u8,
                node: NonNull<RawNode<V, Self::Hooks>>,
                slot: usize,
            ) {
                match slot {
                    $($slot => avl::erase(&mut sets[$slot], base, hook_of(node, $slot)),)+
                    _ => unreachable!("index slot out of range"),
                }
            }

            unsafe fn post_modify_slot(
                sets: &mut Self::Sets,
                base: *mut u8,
                node: NonNull<RawNode<V, Self::Hooks>>,
                slot: usize,
                unique: bool,
            ) -> bool {
                match slot {
                    $($slot => {
                        let h = hook_of(node, $slot);
                        let key = |x: NonNull<Hook>| unsafe {
                            $I::key(value_of_hook::<V, Self::Hooks>(x, $slot))
                        };
                        let mut fixup = false;
                        if let Some(before) = avl::prev(h) {
                            if key(before) >= key(h) {
                                fixup = true;
                            }
                        }
                        if !fixup {
                            if let Some(after) = avl::next(h) {
                                if key(h) >= key(after) {
                                    fixup = true;
                                }
                            }
                        }
                        if fixup {
                            let set = &mut sets[$slot];
                            avl::erase(set, base, h);
                            let cmp = |a: NonNull<Hook>, b: NonNull<Hook>| unsafe {
                                $I::key(value_of_hook::<V, Self::Hooks>(a, $slot))
                                    .cmp(&$I::key(value_of_hook::<V, Self::Hooks>(b, $slot)))
                            };
                            if unique {
                                if let Err(blocking) = avl::insert_unique(set, base, h, cmp) {
                                    avl::insert_before(set, base, Some(blocking), h);
                                    return false;
                                }
                            } else {
                                avl::insert_equal(set, base, h, cmp);
                            }
                        }
                        true
                    })+
                    _ => unreachable!("index slot out of range"),
                }
            }
        }

    };
}

impl_index_list!(1, I0, (0, I0));
impl_index_list!(2, I0, (0, I0), (1, I1));
impl_index_list!(3, I0, (0, I0), (1, I1), (2, I2));
impl_index_list!(4, I0, (0, I0), (1, I1), (2, I2), (3, I3));

/// A copyable token for a value living in the container. Dereferences to
/// the value; stays valid until the value is removed or undone out of
/// existence (single-writer discipline, like everything here).
pub struct RowRef<'a, V> {
    ptr: NonNull<V>,
    _marker: PhantomData<&'a V>,
}

impl<'a, V> std::fmt::Debug for RowRef<'a, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowRef").field("ptr", &self.ptr).finish()
    }
}

impl<'a, V> RowRef<'a, V> {
    pub(crate) unsafe fn new(ptr: NonNull<V>) -> Self {
        RowRef { ptr, _marker: PhantomData }
    }

    pub(crate) fn as_nonnull(&self) -> NonNull<V> {
        self.ptr
    }
}

impl<'a, V> Clone for RowRef<'a, V> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<'a, V> Copy for RowRef<'a, V> {}

impl<'a, V> std::ops::Deref for RowRef<'a, V> {
    type Target = V;
    fn deref(&self) -> &V {
        unsafe { self.ptr.as_ref() }
    }
}

/// Read-only view over one index of a container. All lookups bracket
/// themselves with the instance's event observer, and `find` may be served
/// from a cache-enabled observer without touching the tree.
pub struct SetView<'a, V: Row, L: IndexList<V>, S: KeySpec<V>> {
    set: &'a RawSet,
    base: *mut u8,
    slot: usize,
    _marker: PhantomData<(fn() -> V, fn() -> L, fn() -> S)>,
}

impl<'a, V: Row, L: IndexList<V>, S: KeySpec<V>> SetView<'a, V, L, S> {
    pub(crate) fn new(set: &'a RawSet, base: *mut u8, slot: usize) -> Self {
        SetView { set, base, slot, _marker: PhantomData }
    }

    pub fn len(&self) -> usize {
        self.set.len() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    fn ord_for<'k>(&self, key: &'k S::Key) -> impl Fn(NonNull<Hook>) -> Ordering + 'k {
        let slot = self.slot;
        move |h| key.cmp(&S::key(unsafe { value_of_hook::<V, L::Hooks>(h, slot) }))
    }

    fn row(&self, h: NonNull<Hook>) -> RowRef<'a, V> {
        unsafe { RowRef::new(NonNull::from(value_of_hook::<V, L::Hooks>(h, self.slot))) }
    }

    pub fn find(&self, key: &S::Key) -> Option<RowRef<'a, V>> {
        let (inst, db) = (self.set.instance_id, self.set.database_id);
        if events::undo_index_cache_enabled(inst) {
            let mut cached = false;
            let mut hit = None;
            events::with_events(inst, |ev| {
                hit = ev.find_in_cache(inst, db, key, &mut cached);
            });
            if cached {
                let obj = hit.map(|p| p.cast::<V>());
                events::with_events(inst, |ev| ev.on_find_end(inst, db, key, hit));
                return obj.map(|p| unsafe { RowRef::new(p) });
            }
        }
        events::with_events(inst, |ev| ev.on_find_begin(inst, db, key));
        let found = unsafe { avl::find(self.set, self.base, self.ord_for(key)) };
        events::with_events(inst, |ev| {
            ev.on_find_end(inst, db, key, found.map(|h| self.row(h).as_nonnull().cast()))
        });
        found.map(|h| self.row(h))
    }

    pub fn lower_bound(&self, key: &S::Key) -> Iter<'a, V, L> {
        let (inst, db) = (self.set.instance_id, self.set.database_id);
        events::with_events(inst, |ev| ev.on_lower_bound_begin(inst, db, key));
        let at = unsafe { avl::lower_bound(self.set, self.base, self.ord_for(key)) };
        events::with_events(inst, |ev| {
            ev.on_lower_bound_end(inst, db, key, at.map(|h| self.row(h).as_nonnull().cast()))
        });
        Iter { cur: at, end: None, slot: self.slot, _marker: PhantomData }
    }

    pub fn upper_bound(&self, key: &S::Key) -> Iter<'a, V, L> {
        let (inst, db) = (self.set.instance_id, self.set.database_id);
        events::with_events(inst, |ev| ev.on_upper_bound_begin(inst, db, key));
        let at = unsafe { avl::upper_bound(self.set, self.base, self.ord_for(key)) };
        events::with_events(inst, |ev| {
            ev.on_upper_bound_end(inst, db, key, at.map(|h| self.row(h).as_nonnull().cast()))
        });
        Iter { cur: at, end: None, slot: self.slot, _marker: PhantomData }
    }

    /// The (at most one, indexes being unique) range of values equal to
    /// `key`.
    pub fn equal_range(&self, key: &S::Key) -> Iter<'a, V, L> {
        let (inst, db) = (self.set.instance_id, self.set.database_id);
        events::with_events(inst, |ev| ev.on_equal_range_begin(inst, db, key));
        let lo = unsafe { avl::lower_bound(self.set, self.base, self.ord_for(key)) };
        let hi = unsafe { avl::upper_bound(self.set, self.base, self.ord_for(key)) };
        events::with_events(inst, |ev| ev.on_equal_range_end(inst, db, key));
        Iter { cur: lo, end: hi, slot: self.slot, _marker: PhantomData }
    }

    pub fn iter(&self) -> Iter<'a, V, L> {
        Iter {
            cur: unsafe { avl::first(self.set, self.base) },
            end: None,
            slot: self.slot,
            _marker: PhantomData,
        }
    }

    /// Map a value found through any index to this index's iteration
    /// position, in constant time.
    pub fn project(&self, row: RowRef<'a, V>) -> Iter<'a, V, L> {
        let node = unsafe { node_of_value::<V, L::Hooks>(row.as_nonnull()) };
        Iter {
            cur: Some(unsafe { hook_of(node, self.slot) }),
            end: None,
            slot: self.slot,
            _marker: PhantomData,
        }
    }
}

/// In-order cursor over one index, yielding row tokens.
pub struct Iter<'a, V: Row, L: IndexList<V>> {
    cur: Option<NonNull<Hook>>,
    end: Option<NonNull<Hook>>,
    slot: usize,
    _marker: PhantomData<(&'a V, fn() -> L)>,
}

impl<'a, V: Row, L: IndexList<V>> Iterator for Iter<'a, V, L> {
    type Item = RowRef<'a, V>;

    fn next(&mut self) -> Option<RowRef<'a, V>> {
        let h = self.cur?;
        if self.end == Some(h) {
            return None;
        }
        self.cur = unsafe { avl::next(h) };
        Some(unsafe { RowRef::new(NonNull::from(value_of_hook::<V, L::Hooks>(h, self.slot))) })
    }
}
