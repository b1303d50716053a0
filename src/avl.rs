//! Intrusive AVL sets over packed offset hooks.
//!
//! The algorithms here run directly against the [`Hook`] layout: every
//! participant node embeds one hook per index, links are self-relative
//! scaled offsets, and the balance factor lives in the hook's 2-bit color
//! field. A set's own state ([`RawSet`]) is plain old data referencing its
//! nodes through segment offsets, so a tree mapped at a different base
//! address is immediately usable.
//!
//! Key comparisons are supplied by the caller as closures over hook
//! pointers; the multi-index layer monomorphizes them from its zero-sized
//! key projections, so there is no runtime dispatch in the hot paths.
//!
//! Three insertion entry points exist on purpose: `insert_unique` refuses
//! duplicates and reports the blocking node, `insert_before` parks a node at
//! an exact position with no key check (used to keep a conflicting node
//! linked while a failed modification is rolled back), and `insert_equal`
//! tolerates transient duplicates while an undo restores an older state.

use std::cmp::Ordering;
use std::ptr::NonNull;

use crate::offset::{Hook, SegPtr};

/// Persisted per-index set state. `instance_id`/`database_id` identify the
/// owning container to event observers; `first_next_id` records the base
/// the parent index's id generator was initialized with.
#[repr(C)]
pub struct RawSet {
    root: SegPtr<Hook>,
    leftmost: SegPtr<Hook>,
    rightmost: SegPtr<Hook>,
    size: u64,
    pub instance_id: u64,
    pub database_id: u64,
    pub first_next_id: i64,
}

impl Default for RawSet {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSet {
    pub const fn new() -> Self {
        RawSet {
            root: SegPtr::null(),
            leftmost: SegPtr::null(),
            rightmost: SegPtr::null(),
            size: 0,
            instance_id: 0,
            database_id: 0,
            first_next_id: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Forget every node without touching them. The caller owns disposal.
    pub fn reset_links(&mut self) {
        self.root = SegPtr::null();
        self.leftmost = SegPtr::null();
        self.rightmost = SegPtr::null();
        self.size = 0;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Dir {
    Left,
    Right,
}

unsafe fn set_child(mut h: NonNull<Hook>, d: Dir, c: Option<NonNull<Hook>>) {
    match d {
        Dir::Left => h.as_mut().set_left(c),
        Dir::Right => h.as_mut().set_right(c),
    }
}

unsafe fn dir_of(parent: NonNull<Hook>, node: NonNull<Hook>) -> Dir {
    if parent.as_ref().left() == Some(node) {
        Dir::Left
    } else {
        debug_assert_eq!(parent.as_ref().right(), Some(node));
        Dir::Right
    }
}

unsafe fn replace_child(
    set: &mut RawSet,
    base: *mut u8,
    parent: Option<NonNull<Hook>>,
    old: NonNull<Hook>,
    new: Option<NonNull<Hook>>,
) {
    match parent {
        None => set.root = SegPtr::from_nonnull(base, new),
        Some(p) => set_child(p, dir_of(p, old), new),
    }
}

unsafe fn subtree_min(mut h: NonNull<Hook>) -> NonNull<Hook> {
    while let Some(l) = h.as_ref().left() {
        h = l;
    }
    h
}

unsafe fn subtree_max(mut h: NonNull<Hook>) -> NonNull<Hook> {
    while let Some(r) = h.as_ref().right() {
        h = r;
    }
    h
}

/// In-order successor, `None` past the rightmost node.
pub unsafe fn next(h: NonNull<Hook>) -> Option<NonNull<Hook>> {
    if let Some(r) = h.as_ref().right() {
        return Some(subtree_min(r));
    }
    let mut cur = h;
    while let Some(p) = cur.as_ref().parent() {
        if dir_of(p, cur) == Dir::Left {
            return Some(p);
        }
        cur = p;
    }
    None
}

/// In-order predecessor.
pub unsafe fn prev(h: NonNull<Hook>) -> Option<NonNull<Hook>> {
    if let Some(l) = h.as_ref().left() {
        return Some(subtree_max(l));
    }
    let mut cur = h;
    while let Some(p) = cur.as_ref().parent() {
        if dir_of(p, cur) == Dir::Right {
            return Some(p);
        }
        cur = p;
    }
    None
}

pub unsafe fn first(set: &RawSet, base: *mut u8) -> Option<NonNull<Hook>> {
    set.leftmost.get(base)
}

pub unsafe fn last(set: &RawSet, base: *mut u8) -> Option<NonNull<Hook>> {
    set.rightmost.get(base)
}

/// Exact-match search. `ord` reports how the search key compares to the
/// node it is given.
pub unsafe fn find(
    set: &RawSet,
    base: *mut u8,
    ord: impl Fn(NonNull<Hook>) -> Ordering,
) -> Option<NonNull<Hook>> {
    let mut cur = set.root.get(base);
    while let Some(h) = cur {
        match ord(h) {
            Ordering::Less => cur = h.as_ref().left(),
            Ordering::Greater => cur = h.as_ref().right(),
            Ordering::Equal => return Some(h),
        }
    }
    None
}

/// First node whose key is not less than the search key.
pub unsafe fn lower_bound(
    set: &RawSet,
    base: *mut u8,
    ord: impl Fn(NonNull<Hook>) -> Ordering,
) -> Option<NonNull<Hook>> {
    let mut cur = set.root.get(base);
    let mut candidate = None;
    while let Some(h) = cur {
        if ord(h) == Ordering::Greater {
            cur = h.as_ref().right();
        } else {
            candidate = Some(h);
            cur = h.as_ref().left();
        }
    }
    candidate
}

/// First node whose key is greater than the search key.
pub unsafe fn upper_bound(
    set: &RawSet,
    base: *mut u8,
    ord: impl Fn(NonNull<Hook>) -> Ordering,
) -> Option<NonNull<Hook>> {
    let mut cur = set.root.get(base);
    let mut candidate = None;
    while let Some(h) = cur {
        if ord(h) == Ordering::Less {
            candidate = Some(h);
            cur = h.as_ref().left();
        } else {
            cur = h.as_ref().right();
        }
    }
    candidate
}

unsafe fn link_fresh(
    set: &mut RawSet,
    base: *mut u8,
    mut node: NonNull<Hook>,
    parent: Option<(NonNull<Hook>, Dir)>,
) {
    {
        let n = node.as_mut();
        n.set_left(None);
        n.set_right(None);
        n.set_balance(0);
    }
    match parent {
        None => {
            node.as_mut().set_parent(None);
            set.root = SegPtr::from_raw(base, node.as_ptr());
            set.leftmost = set.root;
            set.rightmost = set.root;
        }
        Some((p, d)) => {
            node.as_mut().set_parent(Some(p));
            set_child(p, d, Some(node));
            if d == Dir::Left && set.leftmost.get(base) == Some(p) {
                set.leftmost = SegPtr::from_raw(base, node.as_ptr());
            }
            if d == Dir::Right && set.rightmost.get(base) == Some(p) {
                set.rightmost = SegPtr::from_raw(base, node.as_ptr());
            }
        }
    }
    set.size += 1;
    retrace_insert(set, base, node);
}

/// Insert refusing duplicate keys. On conflict the tree is untouched and the
/// blocking node is returned.
pub unsafe fn insert_unique(
    set: &mut RawSet,
    base: *mut u8,
    node: NonNull<Hook>,
    cmp: impl Fn(NonNull<Hook>, NonNull<Hook>) -> Ordering,
) -> Result<(), NonNull<Hook>> {
    let mut cur = set.root.get(base);
    let mut parent = None;
    while let Some(h) = cur {
        match cmp(node, h) {
            Ordering::Less => {
                parent = Some((h, Dir::Left));
                cur = h.as_ref().left();
            }
            Ordering::Greater => {
                parent = Some((h, Dir::Right));
                cur = h.as_ref().right();
            }
            Ordering::Equal => return Err(h),
        }
    }
    link_fresh(set, base, node, parent);
    Ok(())
}

/// Insert tolerating duplicates; equal keys land after existing ones.
pub unsafe fn insert_equal(
    set: &mut RawSet,
    base: *mut u8,
    node: NonNull<Hook>,
    cmp: impl Fn(NonNull<Hook>, NonNull<Hook>) -> Ordering,
) {
    let mut cur = set.root.get(base);
    let mut parent = None;
    while let Some(h) = cur {
        if cmp(node, h) == Ordering::Less {
            parent = Some((h, Dir::Left));
            cur = h.as_ref().left();
        } else {
            parent = Some((h, Dir::Right));
            cur = h.as_ref().right();
        }
    }
    link_fresh(set, base, node, parent);
}

/// Link `node` immediately before `pos` (`None` = end) with no key check.
/// The tree stays balanced but may transiently violate key order; callers
/// erase the node again before the next ordered lookup.
pub unsafe fn insert_before(
    set: &mut RawSet,
    base: *mut u8,
    pos: Option<NonNull<Hook>>,
    node: NonNull<Hook>,
) {
    let parent = match pos {
        None => match set.rightmost.get(base) {
            None => None,
            Some(r) => Some((r, Dir::Right)),
        },
        Some(p) => match p.as_ref().left() {
            None => Some((p, Dir::Left)),
            Some(l) => Some((subtree_max(l), Dir::Right)),
        },
    };
    link_fresh(set, base, node, parent);
}

unsafe fn rotate_left(set: &mut RawSet, base: *mut u8, mut p: NonNull<Hook>) -> NonNull<Hook> {
    let mut c = p.as_ref().right().expect("rotate_left without right child");
    let t = c.as_ref().left();
    p.as_mut().set_right(t);
    if let Some(mut t) = t {
        t.as_mut().set_parent(Some(p));
    }
    let g = p.as_ref().parent();
    c.as_mut().set_parent(g);
    replace_child(set, base, g, p, Some(c));
    c.as_mut().set_left(Some(p));
    p.as_mut().set_parent(Some(c));
    c
}

unsafe fn rotate_right(set: &mut RawSet, base: *mut u8, mut p: NonNull<Hook>) -> NonNull<Hook> {
    let mut c = p.as_ref().left().expect("rotate_right without left child");
    let t = c.as_ref().right();
    p.as_mut().set_left(t);
    if let Some(mut t) = t {
        t.as_mut().set_parent(Some(p));
    }
    let g = p.as_ref().parent();
    c.as_mut().set_parent(g);
    replace_child(set, base, g, p, Some(c));
    c.as_mut().set_right(Some(p));
    p.as_mut().set_parent(Some(c));
    c
}

/// Restore AVL balance after `node` was linked as a fresh leaf.
unsafe fn retrace_insert(set: &mut RawSet, base: *mut u8, node: NonNull<Hook>) {
    let mut child = node;
    while let Some(mut p) = child.as_ref().parent() {
        let delta = if dir_of(p, child) == Dir::Left { -1 } else { 1 };
        let bf = p.as_ref().balance() + delta;
        match bf {
            0 => {
                p.as_mut().set_balance(0);
                return;
            }
            -1 | 1 => {
                p.as_mut().set_balance(bf);
                child = p;
            }
            2 => {
                let c = p.as_ref().right().unwrap();
                rebalance_right_heavy(set, base, p, c);
                return;
            }
            _ => {
                let c = p.as_ref().left().unwrap();
                rebalance_left_heavy(set, base, p, c);
                return;
            }
        }
    }
}

/// `p` has become +2 with right child `c`. Returns the subtree's new root
/// and whether the subtree height shrank relative to before the violation.
unsafe fn rebalance_right_heavy(
    set: &mut RawSet,
    base: *mut u8,
    mut p: NonNull<Hook>,
    mut c: NonNull<Hook>,
) -> (NonNull<Hook>, bool) {
    match c.as_ref().balance() {
        0 => {
            // only reachable from erase
            rotate_left(set, base, p);
            p.as_mut().set_balance(1);
            c.as_mut().set_balance(-1);
            (c, false)
        }
        1 => {
            rotate_left(set, base, p);
            p.as_mut().set_balance(0);
            c.as_mut().set_balance(0);
            (c, true)
        }
        _ => {
            let mut g = c.as_ref().left().unwrap();
            let gb = g.as_ref().balance();
            rotate_right(set, base, c);
            rotate_left(set, base, p);
            p.as_mut().set_balance(if gb == 1 { -1 } else { 0 });
            c.as_mut().set_balance(if gb == -1 { 1 } else { 0 });
            g.as_mut().set_balance(0);
            (g, true)
        }
    }
}

unsafe fn rebalance_left_heavy(
    set: &mut RawSet,
    base: *mut u8,
    mut p: NonNull<Hook>,
    mut c: NonNull<Hook>,
) -> (NonNull<Hook>, bool) {
    match c.as_ref().balance() {
        0 => {
            rotate_right(set, base, p);
            p.as_mut().set_balance(-1);
            c.as_mut().set_balance(1);
            (c, false)
        }
        -1 => {
            rotate_right(set, base, p);
            p.as_mut().set_balance(0);
            c.as_mut().set_balance(0);
            (c, true)
        }
        _ => {
            let mut g = c.as_ref().right().unwrap();
            let gb = g.as_ref().balance();
            rotate_left(set, base, c);
            rotate_right(set, base, p);
            p.as_mut().set_balance(if gb == -1 { 1 } else { 0 });
            c.as_mut().set_balance(if gb == 1 { -1 } else { 0 });
            g.as_mut().set_balance(0);
            (g, true)
        }
    }
}

/// Restore AVL balance after a subtree hanging on side `d` of `p` lost one
/// level of height.
unsafe fn retrace_erase(set: &mut RawSet, base: *mut u8, mut p: NonNull<Hook>, mut d: Dir) {
    loop {
        let delta = if d == Dir::Left { 1 } else { -1 };
        let bf = p.as_ref().balance() + delta;
        let (sub_root, shrank) = match bf {
            0 => {
                p.as_mut().set_balance(0);
                (p, true)
            }
            -1 | 1 => {
                p.as_mut().set_balance(bf);
                return;
            }
            2 => {
                let c = p.as_ref().right().unwrap();
                rebalance_right_heavy(set, base, p, c)
            }
            _ => {
                let c = p.as_ref().left().unwrap();
                rebalance_left_heavy(set, base, p, c)
            }
        };
        if !shrank {
            return;
        }
        match sub_root.as_ref().parent() {
            None => return,
            Some(parent) => {
                d = dir_of(parent, sub_root);
                p = parent;
            }
        }
    }
}

/// Unlink `node` from the tree. The node's hook is left stale; whoever owns
/// the node next (free list, removed list, re-insert) overwrites it.
pub unsafe fn erase(set: &mut RawSet, base: *mut u8, mut node: NonNull<Hook>) {
    if set.leftmost.get(base) == Some(node) {
        set.leftmost = SegPtr::from_nonnull(base, next(node));
    }
    if set.rightmost.get(base) == Some(node) {
        set.rightmost = SegPtr::from_nonnull(base, prev(node));
    }
    set.size -= 1;

    let parent = node.as_ref().parent();
    let left = node.as_ref().left();
    let right = node.as_ref().right();

    match (left, right) {
        (None, sub) | (sub, None) => {
            let removed_side = parent.map(|p| dir_of(p, node));
            replace_child(set, base, parent, node, sub);
            if let Some(mut s) = sub {
                s.as_mut().set_parent(parent);
            }
            if let Some(p) = parent {
                retrace_erase(set, base, p, removed_side.unwrap());
            }
        }
        (Some(mut l), Some(r)) => {
            // splice the in-order successor into node's position
            let mut s = subtree_min(r);
            let (retrace_from, retrace_dir);
            if s == r {
                retrace_from = s;
                retrace_dir = Dir::Right;
            } else {
                let mut sp = s.as_ref().parent().unwrap();
                let sr = s.as_ref().right();
                sp.as_mut().set_left(sr);
                if let Some(mut sr) = sr {
                    sr.as_mut().set_parent(Some(sp));
                }
                s.as_mut().set_right(Some(r));
                let mut r = r;
                r.as_mut().set_parent(Some(s));
                retrace_from = sp;
                retrace_dir = Dir::Left;
            }
            s.as_mut().set_left(Some(l));
            l.as_mut().set_parent(Some(s));
            s.as_mut().set_parent(parent);
            replace_child(set, base, parent, node, Some(s));
            s.as_mut().set_balance(node.as_ref().balance());
            retrace_erase(set, base, retrace_from, retrace_dir);
        }
    }
    // make accidental reuse loud in debug builds
    node.as_mut().set_parent(None);
    node.as_mut().set_left(None);
    node.as_mut().set_right(None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct TestNode {
        hook: Hook,
        key: u64,
    }

    unsafe fn key_of(h: NonNull<Hook>) -> u64 {
        (*(h.as_ptr() as *const TestNode)).key
    }

    fn node_cmp(a: NonNull<Hook>, b: NonNull<Hook>) -> Ordering {
        unsafe { key_of(a).cmp(&key_of(b)) }
    }

    unsafe fn check_subtree(h: Option<NonNull<Hook>>, lo: Option<u64>, hi: Option<u64>) -> i64 {
        let Some(h) = h else { return 0 };
        let k = key_of(h);
        if let Some(lo) = lo {
            assert!(k > lo, "order violated");
        }
        if let Some(hi) = hi {
            assert!(k < hi, "order violated");
        }
        if let Some(l) = h.as_ref().left() {
            assert_eq!(l.as_ref().parent(), Some(h));
        }
        if let Some(r) = h.as_ref().right() {
            assert_eq!(r.as_ref().parent(), Some(h));
        }
        let lh = check_subtree(h.as_ref().left(), lo, Some(k));
        let rh = check_subtree(h.as_ref().right(), Some(k), hi);
        let bf = (rh - lh) as i8;
        assert!(bf.abs() <= 1, "AVL balance violated at {k}");
        assert_eq!(h.as_ref().balance(), bf, "stored balance wrong at {k}");
        1 + lh.max(rh)
    }

    unsafe fn check(set: &RawSet, base: *mut u8, expect: &[u64]) {
        check_subtree(set.root.get(base), None, None);
        let mut got = Vec::new();
        let mut cur = first(set, base);
        while let Some(h) = cur {
            got.push(key_of(h));
            cur = next(h);
        }
        assert_eq!(got, expect);
        assert_eq!(set.len() as usize, expect.len());
        if let Some(&k) = expect.last() {
            assert_eq!(key_of(last(set, base).unwrap()), k);
        }
    }

    #[test]
    fn randomized_against_btreeset() {
        use std::collections::BTreeSet;
        // deterministic LCG; keys collide often enough to exercise the
        // unique-rejection path
        let mut state = 0x243f_6a88_85a3_08d3u64;
        let mut rng = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            state >> 33
        };

        let mut arena: Vec<Box<TestNode>> = Vec::new();
        let mut by_key: std::collections::HashMap<u64, usize> = Default::default();
        let mut mirror = BTreeSet::new();
        let mut set = RawSet::new();
        let base = std::ptr::null_mut();

        unsafe {
            for _ in 0..4000 {
                let k = rng() % 256;
                if mirror.contains(&k) && rng() % 2 == 0 {
                    let slot = by_key.remove(&k).unwrap();
                    let h = NonNull::from(&arena[slot].hook);
                    erase(&mut set, base, h);
                    mirror.remove(&k);
                } else {
                    arena.push(Box::new(TestNode { hook: Hook::new(), key: k }));
                    let slot = arena.len() - 1;
                    let h = NonNull::from(&arena[slot].hook);
                    match insert_unique(&mut set, base, h, node_cmp) {
                        Ok(()) => {
                            assert!(mirror.insert(k));
                            by_key.insert(k, slot);
                        }
                        Err(existing) => {
                            assert!(mirror.contains(&k));
                            assert_eq!(key_of(existing), k);
                        }
                    }
                }
            }
            let expect: Vec<u64> = mirror.iter().copied().collect();
            check(&set, base, &expect);
        }
    }

    #[test]
    fn bounds_and_find() {
        let mut arena: Vec<Box<TestNode>> = Vec::new();
        let mut set = RawSet::new();
        let base = std::ptr::null_mut();
        unsafe {
            for k in [10u64, 20, 30, 40, 50] {
                arena.push(Box::new(TestNode { hook: Hook::new(), key: k }));
                let h = NonNull::from(&arena.last().unwrap().hook);
                insert_unique(&mut set, base, h, node_cmp).unwrap();
            }
            let ord = |key: u64| move |h: NonNull<Hook>| key.cmp(&unsafe { key_of(h) });
            assert_eq!(find(&set, base, ord(30)).map(|h| unsafe { key_of(h) }), Some(30));
            assert_eq!(find(&set, base, ord(31)), None);
            assert_eq!(lower_bound(&set, base, ord(30)).map(|h| unsafe { key_of(h) }), Some(30));
            assert_eq!(lower_bound(&set, base, ord(31)).map(|h| unsafe { key_of(h) }), Some(40));
            assert_eq!(upper_bound(&set, base, ord(30)).map(|h| unsafe { key_of(h) }), Some(40));
            assert_eq!(upper_bound(&set, base, ord(50)), None);
            assert_eq!(lower_bound(&set, base, ord(51)), None);
        }
    }

    #[test]
    fn insert_before_parks_a_duplicate() {
        let mut arena: Vec<Box<TestNode>> = Vec::new();
        let mut set = RawSet::new();
        let base = std::ptr::null_mut();
        unsafe {
            for k in [10u64, 20, 30] {
                arena.push(Box::new(TestNode { hook: Hook::new(), key: k }));
                let h = NonNull::from(&arena.last().unwrap().hook);
                insert_unique(&mut set, base, h, node_cmp).unwrap();
            }
            arena.push(Box::new(TestNode { hook: Hook::new(), key: 20 }));
            let dup = NonNull::from(&arena.last().unwrap().hook);
            let blocking = insert_unique(&mut set, base, dup, node_cmp).unwrap_err();
            assert_eq!(key_of(blocking), 20);
            insert_before(&mut set, base, Some(blocking), dup);
            assert_eq!(set.len(), 4);
            // in-order walk shows the parked duplicate right before its twin
            let mut got = Vec::new();
            let mut cur = first(&set, base);
            while let Some(h) = cur {
                got.push(key_of(h));
                cur = next(h);
            }
            assert_eq!(got, [10, 20, 20, 30]);
            erase(&mut set, base, dup);
            check_subtree(set.root.get(base), None, None);
        }
    }
}
