use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use statebase::{
    add_undo_index_events, clear_undo_index_events, ById, IndexError, KeySpec, LruReadCache, Oid,
    Row, Segment, SegmentError, SegmentOptions, SharedAlloc, SharedString, UndoIndex,
    UndoIndexEvents,
};

#[derive(Clone)]
struct Record {
    id: Oid<Record>,
    key: u64,
    payload: SharedString,
}

impl Row for Record {
    fn id(&self) -> Oid<Record> {
        self.id
    }
    fn set_id(&mut self, id: Oid<Record>) {
        self.id = id;
    }
}

struct ByKey;
impl KeySpec<Record> for ByKey {
    type Key = u64;
    fn key(r: &Record) -> u64 {
        r.key
    }
}

type RecordIndex = UndoIndex<Record, (ById<Record>, ByKey)>;

fn scratch_file(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("statebase_{}_{}", std::process::id(), name))
}

fn record(key: u64, text: &'static [u8]) -> impl FnOnce(&SharedAlloc) -> Record {
    move |alloc| Record {
        id: Oid::default(),
        key,
        payload: SharedString::from_bytes(alloc, text).unwrap(),
    }
}

#[test]
fn file_backed_reopen_preserves_contents() {
    let path = scratch_file("reopen");
    let root;
    {
        let seg = Segment::create(
            &path,
            SegmentOptions::builder()
                .capacity(4 << 20)
                .database_id(77)
                .unique_segment_manager_id(100)
                .build(),
        )
        .unwrap();
        let idx = RecordIndex::create(&seg).unwrap();
        root = idx.root_offset();
        idx.emplace(record(10, b"ten")).unwrap();
        idx.emplace(record(20, b"twenty")).unwrap();
        idx.emplace(record(30, b"thirty")).unwrap();
        idx.remove(idx.find(&Oid::new(1)).unwrap()).unwrap();
    }
    // the mapping is gone; open it fresh
    {
        let seg = Segment::open(&path, false).unwrap();
        assert_eq!(seg.config().database_id, 77);
        let idx = RecordIndex::open(&seg, root).unwrap();
        idx.validate().unwrap();
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.find(&Oid::new(0)).unwrap().payload.as_bytes(), b"ten");
        assert!(idx.find(&Oid::new(1)).is_none());
        assert_eq!(idx.by::<ByKey>().find(&30).unwrap().payload.as_bytes(), b"thirty");
        // freed node storage is reused on the next emplace
        idx.emplace(record(40, b"forty")).unwrap();
        assert_eq!(idx.by::<ByKey>().find(&40).unwrap().id().raw(), 3);
    }
    std::fs::remove_file(&path).ok();
}

#[test]
fn read_only_mount_rejects_mutation() {
    let path = scratch_file("readonly");
    let root;
    {
        let seg = Segment::create(
            &path,
            SegmentOptions::builder().capacity(1 << 20).unique_segment_manager_id(101).build(),
        )
        .unwrap();
        let idx = RecordIndex::create(&seg).unwrap();
        root = idx.root_offset();
        idx.emplace(record(5, b"five")).unwrap();
    }
    {
        let seg = Segment::open(&path, true).unwrap();
        assert!(seg.is_read_only());
        let idx = RecordIndex::open(&seg, root).unwrap();
        assert_eq!(idx.find(&Oid::new(0)).unwrap().key, 5);
        assert!(matches!(
            idx.emplace(record(6, b"six")),
            Err(IndexError::Logic(_))
        ));
        assert!(matches!(
            idx.modify(idx.find(&Oid::new(0)).unwrap(), |r| r.key = 9),
            Err(IndexError::Logic(_))
        ));
        assert!(matches!(idx.start_undo_session(true), Err(IndexError::Logic(_))));
        assert!(matches!(seg.alloc(64), Err(SegmentError::ReadOnly)));
    }
    std::fs::remove_file(&path).ok();
}

#[test]
fn segment_file_is_exclusively_locked() {
    let path = scratch_file("locked");
    let seg = Segment::create(
        &path,
        SegmentOptions::builder().capacity(1 << 20).unique_segment_manager_id(102).build(),
    )
    .unwrap();
    // a second writer cannot mount the same file
    match Segment::open(&path, false) {
        Err(SegmentError::Init(msg)) => assert!(msg.contains("busy")),
        other => panic!("expected busy error, got {:?}", other.err()),
    }
    drop(seg);
    // once released, a reopen succeeds
    Segment::open(&path, false).unwrap();
    std::fs::remove_file(&path).ok();
}

#[test]
fn bad_magic_is_refused() {
    let path = scratch_file("badmagic");
    std::fs::write(&path, vec![0u8; 4096]).unwrap();
    assert!(matches!(Segment::open(&path, false), Err(SegmentError::Init(_))));
    std::fs::remove_file(&path).ok();
}

#[test]
fn registry_rejects_reserved_and_unknown_ids() {
    assert!(statebase::segment_base(0).is_err());
    assert!(statebase::segment_base(65000).is_err());
    assert!(statebase::register_segment(0, std::ptr::null_mut()).is_err());
    assert!(matches!(
        Segment::anonymous(SegmentOptions::builder().unique_segment_manager_id(0).build()),
        Err(SegmentError::Init(_))
    ));
}

#[test]
fn registry_translates_saved_references_after_remap() {
    let seg = Segment::anonymous(
        SegmentOptions::builder().capacity(1 << 20).unique_segment_manager_id(103).build(),
    )
    .unwrap();
    assert_eq!(statebase::segment_base(103).unwrap(), seg.base());
    assert_eq!(statebase::segment_id(seg.base()).unwrap(), 103);

    // a shared string resolves through the registry, not through any live
    // pointer of its own
    let alloc = SharedAlloc::new(103, 103, 103);
    let s = SharedString::from_bytes(&alloc, b"still here").unwrap();
    assert_eq!(s.as_bytes(), b"still here");

    // re-registration replaces the entry wholesale
    statebase::register_segment(103, seg.base()).unwrap();
    assert_eq!(s.as_bytes(), b"still here");
    drop(s);
    drop(seg);
    assert!(statebase::segment_base(103).is_err());
}

#[test]
fn shared_strings_are_copy_on_write() {
    let seg = Segment::anonymous(
        SegmentOptions::builder().capacity(1 << 20).unique_segment_manager_id(104).build(),
    )
    .unwrap();
    let alloc = SharedAlloc::new(104, 104, 104);
    let a = SharedString::from_bytes(&alloc, b"shared payload").unwrap();
    let b = a.clone();
    assert_eq!(a.ref_count(), 2);
    assert_eq!(a, b);

    let mut c = b.clone();
    c.assign(b"diverged").unwrap();
    assert_eq!(a.ref_count(), 2);
    assert_eq!(c.ref_count(), 1);
    assert_ne!(a, c);

    assert_eq!(a.compare(0, 6, b"shared").unwrap(), std::cmp::Ordering::Equal);
    assert_eq!(a.compare(7, 7, b"payloae").unwrap(), std::cmp::Ordering::Less);
    assert_eq!(a.compare(0, 100, b"shared").unwrap(), std::cmp::Ordering::Greater);
    assert!(matches!(a.compare(200, 1, b"x"), Err(IndexError::OutOfRange(_))));

    drop(a);
    drop(b);
    drop(c);
    drop(seg);
}

#[derive(Default)]
struct CountingEvents {
    instance: u64,
    begins: AtomicU64,
    ends: AtomicU64,
}

impl UndoIndexEvents for CountingEvents {
    fn instance_id(&self) -> u64 {
        self.instance
    }
    fn on_find_begin(&self, _i: u64, _d: u64, _k: &dyn std::any::Any) {
        self.begins.fetch_add(1, Ordering::Relaxed);
    }
    fn on_find_end(
        &self,
        _i: u64,
        _d: u64,
        _k: &dyn std::any::Any,
        _obj: Option<std::ptr::NonNull<u8>>,
    ) {
        self.ends.fetch_add(1, Ordering::Relaxed);
    }
    fn on_modify_begin(&self, _i: u64, _d: u64, _obj: std::ptr::NonNull<u8>) {
        self.begins.fetch_add(1, Ordering::Relaxed);
    }
    fn on_modify_end(&self, _i: u64, _d: u64, _obj: std::ptr::NonNull<u8>, _success: bool) {
        self.ends.fetch_add(1, Ordering::Relaxed);
    }
    fn on_remove_begin(&self, _i: u64, _d: u64, _obj: std::ptr::NonNull<u8>) {
        self.begins.fetch_add(1, Ordering::Relaxed);
    }
    fn on_remove_end(&self, _i: u64, _d: u64) {
        self.ends.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn observers_see_balanced_begin_end_pairs() {
    let seg = Segment::anonymous(
        SegmentOptions::builder().capacity(1 << 20).unique_segment_manager_id(105).build(),
    )
    .unwrap();
    let idx = RecordIndex::create(&seg).unwrap();
    idx.set_instance_id(9105);
    let counter = Arc::new(CountingEvents { instance: 9105, ..Default::default() });
    add_undo_index_events(counter.clone());

    idx.emplace(record(1, b"one")).unwrap();
    let row = idx.find(&Oid::new(0)).unwrap();
    idx.modify(row, |r| r.key = 2).unwrap();
    idx.find(&Oid::new(0)).unwrap();
    idx.remove(idx.find(&Oid::new(0)).unwrap()).unwrap();

    clear_undo_index_events(9105);
    assert!(counter.begins.load(Ordering::Relaxed) > 0);
    assert_eq!(counter.begins.load(Ordering::Relaxed), counter.ends.load(Ordering::Relaxed));
}

#[test]
fn lru_read_cache_short_circuits_find() {
    let seg = Segment::anonymous(
        SegmentOptions::builder().capacity(1 << 20).unique_segment_manager_id(106).build(),
    )
    .unwrap();
    let idx = RecordIndex::create(&seg).unwrap();
    idx.set_instance_id(9106);
    let cache = Arc::new(LruReadCache::<Oid<Record>>::new(9106, 64));
    add_undo_index_events(cache.clone());

    idx.emplace(record(10, b"ten")).unwrap();
    let first = idx.find(&Oid::new(0)).unwrap();
    assert_eq!(cache.hits(), 0);
    let second = idx.find(&Oid::new(0)).unwrap();
    assert_eq!(cache.hits(), 1);
    // the cache hands back the same live object, not a copy
    assert_eq!(&*first as *const Record, &*second as *const Record);

    // mutation invalidates; the next find searches and re-primes
    idx.modify(first, |r| r.key = 11).unwrap();
    let third = idx.find(&Oid::new(0)).unwrap();
    assert_eq!(third.key, 11);
    assert_eq!(cache.hits(), 1);
    let fourth = idx.find(&Oid::new(0)).unwrap();
    assert_eq!(fourth.key, 11);
    assert_eq!(cache.hits(), 2);

    // a cached miss is also a hit
    assert!(idx.find(&Oid::new(55)).is_none());
    assert!(idx.find(&Oid::new(55)).is_none());
    assert_eq!(cache.hits(), 3);

    clear_undo_index_events(9106);
}

#[test]
fn undo_traffic_invalidates_the_cache() {
    let seg = Segment::anonymous(
        SegmentOptions::builder().capacity(1 << 20).unique_segment_manager_id(107).build(),
    )
    .unwrap();
    let idx = RecordIndex::create(&seg).unwrap();
    idx.set_instance_id(9107);
    let cache = Arc::new(LruReadCache::<Oid<Record>>::new(9107, 64));
    add_undo_index_events(cache.clone());

    idx.emplace(record(1, b"one")).unwrap();
    {
        let _session = idx.start_undo_session(true).unwrap();
        idx.modify(idx.find(&Oid::new(0)).unwrap(), |r| r.key = 2).unwrap();
        // prime the cache with the modified state
        assert_eq!(idx.find(&Oid::new(0)).unwrap().key, 2);
        assert_eq!(idx.find(&Oid::new(0)).unwrap().key, 2);
    }
    // the session's undo restored key = 1; the cache must not serve stale 2
    assert_eq!(idx.find(&Oid::new(0)).unwrap().key, 1);

    clear_undo_index_events(9107);
}
