//! # Statebase: transactional multi-index object storage for blockchain state.
//!
//! Statebase is the storage kernel under a blockchain-state database: it
//! keeps authoritative, mutable, strongly-typed object collections with fast
//! primary- and secondary-key lookup, deterministic rollback of recent
//! changes, and cross-process read-only access to the same data. The whole
//! container — trees, nodes, undo bookkeeping — lives inside a memory
//! segment (usually a mapped file), so its contents persist across process
//! restarts and can be mapped by several processes at once.
//!
//! Statebase does not emulate tables over a generic KV store. Objects are
//! laid out once, in place, and every index is an intrusive balanced tree
//! threaded through the object's own node, so a lookup costs a tree walk
//! and nothing else, and removing an object from five indexes costs five
//! unlinks and zero allocations.
//!
//! # Design overview
//!
//! The crate is three layers, each oblivious to the ones above:
//!
//! - **Position-independent memory**: a segment ([`Segment`]) is a linear
//!   byte space with an allocator in its header. Everything persisted in it
//!   refers to other things by offset — either segment-base-relative
//!   ([`SegPtr`]) or self-relative packed into the 16-byte [`Hook`] node
//!   header. A different process maps the file wherever it likes and reads
//!   the same structure. The [`registry`] maps the 16-bit segment ids
//!   embedded in persisted references back to live base addresses.
//!
//! - **Intrusive indexes**: AVL sets written directly against the hook
//!   layout, composed into a multi-index by a tuple of zero-sized key
//!   projections ([`KeySpec`]). One node carries one hook per index; all
//!   indexes are ordered-unique by construction.
//!
//! - **The undo index**: [`UndoIndex`] adds the session stack. Every
//!   mutation first preserves whatever the innermost open session would
//!   need to restore — a value snapshot, a removed node, a created-id
//!   record — and [`UndoSession`] handles roll sessions back, retain them,
//!   or squash them into their parent. Sessions nest arbitrarily deep and
//!   a committed prefix of the stack can be dropped in one call.
//!
//! The container is single-writer: no internal locking, no suspension
//! points, every operation completes before returning. Readers in other
//! processes may observe the segment while the writer is quiescent.
//!
//! # A flavor of use
//!
//! ```
//! use statebase::{ById, KeySpec, Oid, Row, Segment, SegmentOptions, UndoIndex};
//!
//! #[derive(Clone)]
//! struct Account {
//!     id: Oid<Account>,
//!     balance: u64,
//! }
//!
//! impl Row for Account {
//!     fn id(&self) -> Oid<Account> {
//!         self.id
//!     }
//!     fn set_id(&mut self, id: Oid<Account>) {
//!         self.id = id;
//!     }
//! }
//!
//! struct ByBalance;
//! impl KeySpec<Account> for ByBalance {
//!     type Key = u64;
//!     fn key(a: &Account) -> u64 {
//!         a.balance
//!     }
//! }
//!
//! let seg = Segment::anonymous(
//!     SegmentOptions::builder().capacity(1 << 20).unique_segment_manager_id(1).build(),
//! )
//! .unwrap();
//! let accounts = UndoIndex::<Account, (ById<Account>, ByBalance)>::create(&seg).unwrap();
//!
//! let a = accounts.emplace(|_| Account { id: Oid::default(), balance: 10 }).unwrap();
//! {
//!     let session = accounts.start_undo_session(true).unwrap();
//!     accounts.modify(a, |acct| acct.balance = 25).unwrap();
//!     assert!(accounts.by::<ByBalance>().find(&25).is_some());
//!     // session dropped: the modification is rolled back
//! }
//! assert_eq!(accounts.get(&statebase::Oid::new(0)).unwrap().balance, 10);
//! ```

pub mod alloc;
pub mod avl;
pub mod events;
pub mod multi;
pub mod offset;
pub mod registry;
pub mod segment;
pub mod shared;
pub mod undo;

pub use alloc::{NodeAllocator, SharedAlloc};
pub use events::{
    add_undo_index_events, clear_undo_index_events, get_undo_index_events,
    undo_index_cache_enabled, LruReadCache, UndoIndexEvents,
};
pub use multi::{ById, IndexList, Iter, KeySpec, Oid, RawNode, Row, RowRef, SetView};
pub use offset::{Hook, SegPtr};
pub use registry::{register_segment, segment_base, segment_id, MAX_SEGMENT_MANAGER_ID};
pub use segment::{DbConfig, Segment, SegmentError, SegmentOptions};
pub use shared::SharedString;
pub use undo::{
    Delta, IndexError, UndoIndex, UndoSession, MAX_CREATE_WITHOUT_UNDO_NEXT_ID,
    MAX_DATABASE_COUNT, MAX_NEXT_ID,
};
