//! Per-instance event observers.
//!
//! Every public container operation brackets itself with begin/end events
//! dispatched to whatever observer is registered for the container's
//! instance id. Observers see type-erased keys (`&dyn Any`) and values (raw
//! pointers into the segment); an observer is registered per instance, so it
//! knows which concrete types to expect and may downcast.
//!
//! Observers must not panic: they are called in the middle of container
//! mutations and have no way to report failure other than the `cached`
//! out-flag of the find probe.
//!
//! The registry is process-wide. Like the segment registry, its lock only
//! makes the static sound; the access discipline is single-writer.

use std::any::Any;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::{Mutex, RwLock};

/// Observer interface for one undo-index instance.
///
/// Default implementations make every event a no-op, so an observer only
/// overrides what it cares about. `obj` pointers reference the live value in
/// the segment and are valid only for the duration of the call, except for
/// the pointer returned from [`UndoIndexEvents::find_in_cache`], which must
/// be a value currently linked in the container (the container returns it to
/// the caller as if it had been found by search).
#[allow(unused_variables)]
pub trait UndoIndexEvents: Send + Sync + 'static {
    fn instance_id(&self) -> u64;

    /// When true, `find` consults [`UndoIndexEvents::find_in_cache`] before
    /// searching.
    fn cache_enabled(&self) -> bool {
        false
    }

    /// Answer a find from cache. Set `*cached = true` to short-circuit the
    /// lookup; the returned pointer (or `None` for a cached miss) is then
    /// used verbatim. Leaving `*cached = false` falls through to the tree.
    fn find_in_cache(
        &self,
        instance_id: u64,
        database_id: u64,
        key: &dyn Any,
        cached: &mut bool,
    ) -> Option<NonNull<u8>> {
        None
    }

    fn on_find_begin(&self, instance_id: u64, database_id: u64, key: &dyn Any) {}
    fn on_find_end(
        &self,
        instance_id: u64,
        database_id: u64,
        key: &dyn Any,
        obj: Option<NonNull<u8>>,
    ) {
    }
    fn on_lower_bound_begin(&self, instance_id: u64, database_id: u64, key: &dyn Any) {}
    fn on_lower_bound_end(
        &self,
        instance_id: u64,
        database_id: u64,
        key: &dyn Any,
        obj: Option<NonNull<u8>>,
    ) {
    }
    fn on_upper_bound_begin(&self, instance_id: u64, database_id: u64, key: &dyn Any) {}
    fn on_upper_bound_end(
        &self,
        instance_id: u64,
        database_id: u64,
        key: &dyn Any,
        obj: Option<NonNull<u8>>,
    ) {
    }
    fn on_equal_range_begin(&self, instance_id: u64, database_id: u64, key: &dyn Any) {}
    fn on_equal_range_end(&self, instance_id: u64, database_id: u64, key: &dyn Any) {}

    fn on_create_begin(&self, instance_id: u64, database_id: u64, id: i64) {}
    fn on_create_end(&self, instance_id: u64, database_id: u64, id: i64, obj: Option<NonNull<u8>>) {
    }
    fn on_modify_begin(&self, instance_id: u64, database_id: u64, obj: NonNull<u8>) {}
    fn on_modify_end(&self, instance_id: u64, database_id: u64, obj: NonNull<u8>, success: bool) {}
    fn on_remove_begin(&self, instance_id: u64, database_id: u64, obj: NonNull<u8>) {}
    fn on_remove_end(&self, instance_id: u64, database_id: u64) {}

    /// A value came back to life because an undo re-inserted it.
    fn on_undo_add_value(&self, instance_id: u64, database_id: u64, obj: NonNull<u8>) {}
    /// A value created within the undone session was dropped.
    fn on_undo_remove_value(&self, instance_id: u64, database_id: u64, obj: NonNull<u8>) {}
}

static OBSERVERS: LazyLock<RwLock<HashMap<u64, Arc<dyn UndoIndexEvents>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Register an observer under its own instance id, replacing any previous
/// observer for that instance.
pub fn add_undo_index_events(events: Arc<dyn UndoIndexEvents>) {
    OBSERVERS.write().insert(events.instance_id(), events);
}

pub fn clear_undo_index_events(instance_id: u64) {
    OBSERVERS.write().remove(&instance_id);
}

pub fn get_undo_index_events(instance_id: u64) -> Option<Arc<dyn UndoIndexEvents>> {
    OBSERVERS.read().get(&instance_id).cloned()
}

pub fn undo_index_cache_enabled(instance_id: u64) -> bool {
    get_undo_index_events(instance_id).is_some_and(|ev| ev.cache_enabled())
}

/// Run `f` against the observer for `instance_id`, if any.
pub(crate) fn with_events(instance_id: u64, f: impl FnOnce(&dyn UndoIndexEvents)) {
    if instance_id == 0 {
        return;
    }
    if let Some(ev) = get_undo_index_events(instance_id) {
        f(&*ev);
    }
}

/// A cache-enabled observer that short-circuits `find` with an LRU map from
/// lookup key to the live value's address. Any mutation or undo traffic
/// invalidates the whole cache.
pub struct LruReadCache<K: std::hash::Hash + Eq + Clone + Send + Sync + 'static> {
    instance_id: u64,
    map: Mutex<lru::LruCache<K, usize>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: std::hash::Hash + Eq + Clone + Send + Sync + 'static> LruReadCache<K> {
    pub fn new(instance_id: u64, capacity: usize) -> Self {
        LruReadCache {
            instance_id,
            map: Mutex::new(lru::LruCache::new(
                NonZeroUsize::new(capacity).expect("non-zero cache size"),
            )),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn invalidate(&self) {
        self.map.lock().clear();
    }
}

impl<K: std::hash::Hash + Eq + Clone + Send + Sync + 'static> UndoIndexEvents for LruReadCache<K> {
    fn instance_id(&self) -> u64 {
        self.instance_id
    }

    fn cache_enabled(&self) -> bool {
        true
    }

    fn find_in_cache(
        &self,
        _instance_id: u64,
        _database_id: u64,
        key: &dyn Any,
        cached: &mut bool,
    ) -> Option<NonNull<u8>> {
        let Some(key) = key.downcast_ref::<K>() else { return None };
        match self.map.lock().get(key) {
            Some(&addr) => {
                *cached = true;
                self.hits.fetch_add(1, Ordering::Relaxed);
                NonNull::new(addr as *mut u8)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn on_find_end(
        &self,
        _instance_id: u64,
        _database_id: u64,
        key: &dyn Any,
        obj: Option<NonNull<u8>>,
    ) {
        if let Some(key) = key.downcast_ref::<K>() {
            // a cached miss is represented by address zero
            let addr = obj.map_or(0, |p| p.as_ptr() as usize);
            self.map.lock().put(key.clone(), addr);
        }
    }

    fn on_create_end(
        &self,
        _instance_id: u64,
        _database_id: u64,
        _id: i64,
        _obj: Option<NonNull<u8>>,
    ) {
        self.invalidate();
    }

    fn on_modify_end(&self, _i: u64, _d: u64, _obj: NonNull<u8>, _success: bool) {
        self.invalidate();
    }

    fn on_remove_end(&self, _i: u64, _d: u64) {
        self.invalidate();
    }

    fn on_undo_add_value(&self, _i: u64, _d: u64, _obj: NonNull<u8>) {
        self.invalidate();
    }

    fn on_undo_remove_value(&self, _i: u64, _d: u64, _obj: NonNull<u8>) {
        self.invalidate();
    }
}
