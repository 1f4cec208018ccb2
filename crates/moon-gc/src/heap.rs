//! The heap: object arena, collector state and roots.
//!
//! A [`Heap`] owns every object of one VM instance. Objects live in a slab
//! addressed by [`GcRef`] handles; per-slot [`Header`]s are kept in a parallel
//! vector so the marker can read object bodies while it recolors headers.

#![allow(clippy::missing_errors_doc)]

use moon_alloc::{AllocError, Allocator, RawBlock, SystemAllocator};

use crate::config::{GcConfig, GcMode};
use crate::error::{CallError, FinalizerFault, GcError};
use crate::gc::{CollectorState, GcState, Marker, Roots};
use crate::metrics::GcStats;
use crate::object::{Age, Color, Header, LuaString, Object, ObjectKind, Thread};
use crate::string::StringTable;
use crate::table::Table;
use crate::value::{GcRef, Value};

/// Calls a non-native `__gc` value: `(heap, finalizer, object)`.
pub type FinalizerHook = Box<dyn FnMut(&mut Heap, Value, Value) -> Result<(), CallError>>;

/// Marks embedder-held roots. Invoked when a cycle starts and again during
/// the atomic phase.
pub type RootHook = Box<dyn FnMut(&mut Roots<'_, '_>)>;

/// Registry slot holding the main thread.
pub const REGISTRY_MAIN_THREAD: i64 = 1;
/// Registry slot holding the globals table.
pub const REGISTRY_GLOBALS: i64 = 2;

#[derive(Debug, Default)]
pub(crate) struct Arena {
    pub headers: Vec<Header>,
    pub objects: Vec<Option<Object>>,
    free: Vec<u32>,
}

impl Arena {
    /// Stores `object` in a free slot. `None` once every index is taken.
    fn insert(&mut self, object: Object) -> Option<u32> {
        if let Some(idx) = self.free.pop() {
            self.objects[idx as usize] = Some(object);
            return Some(idx);
        }
        let idx = u32::try_from(self.objects.len()).ok().filter(|&idx| idx < u32::MAX)?;
        self.objects.push(Some(object));
        self.headers.push(Header::vacant());
        Some(idx)
    }

    /// Vacates a slot, invalidating every handle to it.
    pub(crate) fn remove(&mut self, idx: u32) -> Option<Object> {
        let object = self.objects[idx as usize].take()?;
        let header = &mut self.headers[idx as usize];
        header.generation = header.generation.wrapping_add(1);
        header.next = None;
        header.gclist = None;
        self.free.push(idx);
        Some(object)
    }

    #[inline]
    pub(crate) fn gc_ref(&self, idx: u32) -> GcRef {
        GcRef::new(idx, self.headers[idx as usize].generation)
    }

    #[inline]
    pub(crate) fn is_live(&self, r: GcRef) -> bool {
        self.objects
            .get(r.slot())
            .is_some_and(|o| o.is_some() && self.headers[r.slot()].generation == r.generation())
    }

    pub(crate) fn get(&self, r: GcRef) -> Result<&Object, GcError> {
        if !self.is_live(r) {
            return Err(GcError::StaleHandle(r));
        }
        self.objects[r.slot()].as_ref().ok_or(GcError::StaleHandle(r))
    }

    pub(crate) fn get_mut(&mut self, r: GcRef) -> Result<&mut Object, GcError> {
        if !self.is_live(r) {
            return Err(GcError::StaleHandle(r));
        }
        self.objects[r.slot()].as_mut().ok_or(GcError::StaleHandle(r))
    }

    pub(crate) fn header(&self, r: GcRef) -> Result<&Header, GcError> {
        if self.is_live(r) {
            Ok(&self.headers[r.slot()])
        } else {
            Err(GcError::StaleHandle(r))
        }
    }

    pub(crate) fn live_count(&self) -> usize {
        self.objects.len() - self.free.len()
    }
}

/// A garbage-collected heap for one VM instance.
pub struct Heap {
    pub(crate) arena: Arena,
    pub(crate) gc: CollectorState,
    pub(crate) strings: StringTable,
    pub(crate) allocator: Box<dyn Allocator>,
    pub(crate) registry: GcRef,
    pub(crate) main_thread: GcRef,
    pub(crate) globals: GcRef,
    pub(crate) type_metatables: [Option<GcRef>; ObjectKind::COUNT],
    /// Interned `"__gc"`, fixed.
    pub(crate) tm_gc: GcRef,
    /// Interned `"__mode"`, fixed.
    pub(crate) tm_mode: GcRef,
    pub(crate) finalizer_hook: Option<FinalizerHook>,
    pub(crate) root_hook: Option<RootHook>,
    /// Values in flight inside a heap operation, marked as roots.
    pub(crate) anchors: Vec<Value>,
    pub(crate) faults: Vec<FinalizerFault>,
    pub(crate) stats: GcStats,
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("objects", &self.arena.live_count())
            .field("state", &self.gc.state)
            .field("mode", &self.gc.kind)
            .field("total_bytes", &self.gc.heap_bytes())
            .field("debt", &self.gc.debt)
            .finish_non_exhaustive()
    }
}

impl Heap {
    /// Creates an incremental heap backed by the system allocator.
    pub fn new() -> Result<Self, GcError> {
        Self::with_config(GcConfig::default())
    }

    pub fn with_config(config: GcConfig) -> Result<Self, GcError> {
        Self::with_allocator(config, SystemAllocator)
    }

    /// Creates a heap whose byte blocks come from `allocator`.
    pub fn with_allocator(
        config: GcConfig,
        allocator: impl Allocator + 'static,
    ) -> Result<Self, GcError> {
        let placeholder = GcRef::new(0, 0);
        let mut heap = Self {
            arena: Arena::default(),
            gc: CollectorState::new(config),
            strings: StringTable::default(),
            allocator: Box::new(allocator),
            registry: placeholder,
            main_thread: placeholder,
            globals: placeholder,
            type_metatables: [None; ObjectKind::COUNT],
            tm_gc: placeholder,
            tm_mode: placeholder,
            finalizer_hook: None,
            root_hook: None,
            anchors: Vec::new(),
            faults: Vec::new(),
            stats: GcStats::default(),
        };
        // No collection of any kind until the roots exist.
        heap.gc.stop_emergency = true;

        heap.tm_gc = heap.new_string("__gc")?;
        heap.fix(heap.tm_gc)?;
        heap.tm_mode = heap.new_string("__mode")?;
        heap.fix(heap.tm_mode)?;

        heap.main_thread = heap.allocate_object(Object::Thread(Thread::default()))?;
        heap.registry = heap.allocate_object(Object::Table(Table::default()))?;
        heap.globals = heap.allocate_object(Object::Table(Table::default()))?;
        heap.table_set(
            heap.registry,
            Value::Integer(REGISTRY_MAIN_THREAD),
            Value::Object(heap.main_thread),
        )?;
        heap.table_set(
            heap.registry,
            Value::Integer(REGISTRY_GLOBALS),
            Value::Object(heap.globals),
        )?;

        heap.gc.stop_emergency = false;
        heap.gc.stopped_internally = false;
        if config.mode == GcMode::Generational {
            heap.change_mode(GcMode::Generational);
        }
        Ok(heap)
    }

    /// Links a new object at the head of the all-objects list, colored with
    /// the current white, and charges its size to the pacer.
    ///
    /// The body is reserved with the backing store. A refusal runs one
    /// emergency collection, during which the new object and everything it
    /// references stay alive. If the retry fails too, the object is left
    /// behind as unreachable garbage of size zero.
    pub(crate) fn allocate_object(&mut self, object: Object) -> Result<GcRef, GcError> {
        let size = object.estimated_size();
        let body = size - object.block_bytes();
        let kind = object.kind();
        let idx = self
            .arena
            .insert(object)
            .ok_or(GcError::OutOfMemory { requested: size })?;
        let header = &mut self.arena.headers[idx as usize];
        header.color = self.gc.current_white;
        header.age = Age::New;
        header.finalizable = false;
        header.kind = kind;
        header.next = self.gc.allgc;
        header.gclist = None;
        header.size = 0;
        header.traversals = 0;
        self.gc.allgc = Some(idx);
        self.gc.last_allocated = Some(idx);
        let r = self.arena.gc_ref(idx);

        self.with_emergency(size, &[Value::Object(r)], |a| a.reserve(0, body))?;
        self.arena.headers[idx as usize].size = size;
        self.gc.charge(size);
        self.stats.objects_allocated += 1;
        self.stats.bytes_allocated += size as u64;
        Ok(r)
    }

    /// Obtains a raw block, running one emergency full collection and
    /// retrying if the backing store refuses.
    pub(crate) fn allocate_block(&mut self, size: usize) -> Result<RawBlock, GcError> {
        self.with_emergency(size, &[], |a| a.allocate(size))
    }

    /// Runs `request` against the backing store. On refusal, unless
    /// emergencies are stopped, runs a full collection with `anchors` kept
    /// alive and tries once more.
    fn with_emergency<T>(
        &mut self,
        size: usize,
        anchors: &[Value],
        mut request: impl FnMut(&mut dyn Allocator) -> Result<T, AllocError>,
    ) -> Result<T, GcError> {
        let out_of_memory = |e: AllocError| GcError::OutOfMemory {
            requested: e.requested,
        };
        match request(&mut *self.allocator) {
            Ok(value) => return Ok(value),
            Err(e) if self.gc.stop_emergency => return Err(out_of_memory(e)),
            Err(_) => {}
        }
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_emergency(size);
        #[cfg(not(feature = "tracing"))]
        let _ = size;
        let base = self.anchors.len();
        self.anchors.extend_from_slice(anchors);
        self.full_gc(true);
        self.anchors.truncate(base);
        request(&mut *self.allocator).map_err(out_of_memory)
    }

    /// Re-estimates the size of a grown or shrunk object and settles the
    /// difference with the pacer and the backing store.
    ///
    /// Growth may run an emergency collection; `r` and `anchors` survive it.
    /// If the backing store still refuses, the object keeps its old size and
    /// the caller undoes the growth.
    pub(crate) fn recharge(&mut self, r: GcRef, anchors: &[Value]) -> Result<(), GcError> {
        let Some(Some(object)) = self.arena.objects.get(r.slot()) else {
            return Ok(());
        };
        let new_size = object.estimated_size();
        let blocks = object.block_bytes();
        let old_size = self.arena.headers[r.slot()].size;
        let (old_body, new_body) = (old_size.saturating_sub(blocks), new_size - blocks);
        if new_size > old_size {
            let mut held = Vec::with_capacity(anchors.len() + 1);
            held.push(Value::Object(r));
            held.extend_from_slice(anchors);
            self.with_emergency(new_size, &held, |a| a.reserve(old_body, new_body))?;
            self.gc.charge(new_size - old_size);
            self.stats.bytes_allocated += (new_size - old_size) as u64;
        } else {
            self.shrink_reservation(old_body, new_body);
            self.gc.credit(old_size - new_size);
            self.stats.bytes_freed += (old_size - new_size) as u64;
        }
        self.arena.headers[r.slot()].size = new_size;
        Ok(())
    }

    /// Hands `old_body - new_body` reserved bytes back to the backing store.
    pub(crate) fn shrink_reservation(&mut self, old_body: usize, new_body: usize) {
        let shrunk = self.allocator.reserve(old_body, new_body);
        debug_assert!(shrunk.is_ok(), "backing store refused to shrink a reservation");
    }

    pub(crate) fn marker(&mut self) -> Marker<'_> {
        Marker {
            headers: &mut self.arena.headers,
            objects: &self.arena.objects,
            gc: &mut self.gc,
            tm_mode: self.tm_mode,
        }
    }

    /// Interns a string.
    ///
    /// A string that is dead but not yet swept is revived instead of
    /// allocating a duplicate.
    pub fn new_string(&mut self, s: impl AsRef<[u8]>) -> Result<GcRef, GcError> {
        let bytes = s.as_ref();
        let hash = StringTable::hash_bytes(bytes);
        if let Some(idx) = self.strings.find(&self.arena.objects, bytes, hash) {
            let header = &mut self.arena.headers[idx as usize];
            if self.gc.is_dead_color(header.color) {
                header.color = self.gc.current_white;
            }
            return Ok(self.arena.gc_ref(idx));
        }
        let mut block = self.allocate_block(bytes.len())?;
        block.as_mut_slice().copy_from_slice(bytes);
        let r = self.allocate_object(Object::String(LuaString { bytes: block, hash }))?;
        self.strings.insert(hash, r.index());
        Ok(r)
    }

    pub fn string_bytes(&self, s: GcRef) -> Result<&[u8], GcError> {
        match self.arena.get(s)? {
            Object::String(string) => Ok(string.bytes.as_slice()),
            other => Err(wrong_kind("string", other)),
        }
    }

    /// Number of interned strings.
    #[must_use]
    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    /// Moves string `r` to the never-collected list. Only the most recently
    /// allocated object can be fixed, and only once.
    ///
    /// Fixed objects are never traversed, which is why only strings qualify.
    pub fn fix(&mut self, r: GcRef) -> Result<(), GcError> {
        let header = self.arena.header(r)?;
        let idx = r.index();
        let gc = &self.gc;
        let segment_start = [gc.survival, gc.old1, gc.reallyold, gc.firstold1].contains(&Some(idx));
        if header.kind != ObjectKind::String
            || gc.last_allocated != Some(idx)
            || gc.allgc != Some(idx)
            || segment_start
        {
            return Err(GcError::NotFixable(r));
        }
        let header = &mut self.arena.headers[idx as usize];
        header.color = Color::Gray;
        header.age = Age::Old;
        self.gc.allgc = header.next;
        header.next = self.gc.fixedgc;
        self.gc.fixedgc = Some(idx);
        self.gc.last_allocated = None;
        Ok(())
    }

    /// The registry table. Slot 1 holds the main thread, slot 2 the globals.
    #[must_use]
    pub const fn registry(&self) -> GcRef {
        self.registry
    }

    #[must_use]
    pub const fn main_thread(&self) -> GcRef {
        self.main_thread
    }

    #[must_use]
    pub const fn globals(&self) -> GcRef {
        self.globals
    }

    /// Keeps `value` alive until [`Heap::unpin`] is called with the returned
    /// key.
    pub fn pin(&mut self, value: Value) -> Result<i64, GcError> {
        let len = self.table_len(self.registry)?;
        let key = i64::try_from(len + 1).unwrap_or(i64::MAX);
        self.table_set(self.registry, Value::Integer(key), value)?;
        Ok(key)
    }

    pub fn unpin(&mut self, key: i64) -> Result<(), GcError> {
        if key == REGISTRY_MAIN_THREAD || key == REGISTRY_GLOBALS {
            return Ok(());
        }
        self.table_set(self.registry, Value::Integer(key), Value::Nil)
    }

    /// Metatable shared by every object of `kind` that has no metatable of
    /// its own.
    pub fn set_type_metatable(&mut self, kind: ObjectKind, metatable: Option<GcRef>) -> Result<(), GcError> {
        if let Some(mt) = metatable {
            self.expect_table(mt)?;
        }
        // Remarked as a root by the atomic phase; no barrier needed.
        self.type_metatables[kind.ordinal()] = metatable;
        Ok(())
    }

    #[must_use]
    pub const fn type_metatable(&self, kind: ObjectKind) -> Option<GcRef> {
        self.type_metatables[kind.ordinal()]
    }

    /// Marks `value` as a root right away if a cycle is marking.
    ///
    /// Used by the embedder when it stores into a root slot outside of the
    /// heap (for example a native register file) while marking is underway.
    pub fn mark_root(&mut self, value: Value) {
        if let Value::Object(r) = value {
            if self.gc.state.keeps_invariant() && self.arena.is_live(r) {
                self.marker().mark_ref(r);
            }
        }
    }

    /// Installs the callback that marks embedder-held roots.
    pub fn set_root_hook(&mut self, hook: impl FnMut(&mut Roots<'_, '_>) + 'static) {
        self.root_hook = Some(Box::new(hook));
    }

    /// Installs the callback used for `__gc` values that are not native
    /// closures.
    pub fn set_finalizer_hook(
        &mut self,
        hook: impl FnMut(&mut Self, Value, Value) -> Result<(), CallError> + 'static,
    ) {
        self.finalizer_hook = Some(Box::new(hook));
    }

    /// Finalizer faults recorded since the last call.
    pub fn take_finalizer_faults(&mut self) -> Vec<FinalizerFault> {
        std::mem::take(&mut self.faults)
    }

    #[must_use]
    pub const fn stats(&self) -> &GcStats {
        &self.stats
    }

    #[must_use]
    pub const fn config(&self) -> &GcConfig {
        &self.gc.config
    }

    /// Replaces the tuning parameters. The mode field is applied with
    /// [`Heap::change_mode`].
    pub fn set_config(&mut self, config: GcConfig) {
        self.gc.config = config;
        self.change_mode(config.mode);
    }

    #[must_use]
    pub const fn state(&self) -> GcState {
        self.gc.state
    }

    /// Mode in effect.
    #[must_use]
    pub const fn mode(&self) -> GcMode {
        self.gc.kind
    }

    /// Bytes currently accounted to live and not-yet-swept objects.
    #[must_use]
    pub const fn total_bytes(&self) -> usize {
        self.gc.heap_bytes()
    }

    /// Allocation debt: a step is due when positive.
    #[must_use]
    pub const fn debt(&self) -> isize {
        self.gc.debt
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.arena.live_count()
    }

    #[must_use]
    pub fn is_live(&self, r: GcRef) -> bool {
        self.arena.is_live(r)
    }

    pub fn kind_of(&self, r: GcRef) -> Result<ObjectKind, GcError> {
        Ok(self.arena.header(r)?.kind)
    }

    pub fn color_of(&self, r: GcRef) -> Result<Color, GcError> {
        Ok(self.arena.header(r)?.color)
    }

    pub fn age_of(&self, r: GcRef) -> Result<Age, GcError> {
        Ok(self.arena.header(r)?.age)
    }

    /// How many times `r` has been traversed by the marker.
    pub fn traversal_count(&self, r: GcRef) -> Result<u64, GcError> {
        Ok(self.arena.header(r)?.traversals)
    }

    pub(crate) fn expect_table(&self, r: GcRef) -> Result<&Table, GcError> {
        match self.arena.get(r)? {
            Object::Table(t) => Ok(t),
            other => Err(wrong_kind("table", other)),
        }
    }

    pub(crate) fn expect_table_mut(&mut self, r: GcRef) -> Result<&mut Table, GcError> {
        match self.arena.get_mut(r)? {
            Object::Table(t) => Ok(t),
            other => Err(wrong_kind("table", other)),
        }
    }

    /// The `__gc` field of `mt`, or nil.
    pub(crate) fn gc_metamethod(&self, mt: Option<GcRef>) -> Value {
        mt.and_then(|mt| self.arena.get(mt).ok())
            .and_then(Object::as_table)
            .map_or(Value::Nil, |t| t.get_str(self.tm_gc))
    }

    /// Metatable of an arbitrary value's object, falling back to the
    /// per-kind metatable.
    pub(crate) fn metatable_of(&self, r: GcRef) -> Option<GcRef> {
        let object = self.arena.get(r).ok()?;
        object
            .metatable()
            .or_else(|| match object {
                Object::Table(_) | Object::UserData(_) => None,
                other => self.type_metatables[other.kind().ordinal()],
            })
    }
}

pub(crate) fn wrong_kind(expected: &'static str, found: &Object) -> GcError {
    GcError::WrongKind {
        expected,
        found: found.kind(),
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.gc.closing = true;
        self.gc.stop_emergency = true;
        self.change_mode(GcMode::Incremental);
        self.separate_to_be_finalized(true);
        self.call_all_pending_finalizers();
        self.gc.sweep_cursor = None;
        for list in [self.gc.allgc.take(), self.gc.finobj.take(), self.gc.fixedgc.take()] {
            let mut cursor = list;
            while let Some(idx) = cursor {
                cursor = self.arena.headers[idx as usize].next;
                self.free_object(idx);
            }
        }
    }
}
