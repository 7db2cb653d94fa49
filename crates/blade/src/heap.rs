//! The object arena, string interning, and the mark-sweep collector.
//!
//! Objects live in a slot arena indexed by [`ObjId`]; the intrusive object
//! chain of a pointer-based runtime becomes plain arena iteration here.
//! Collection is stop-the-world tri-color mark-sweep: the VM marks its
//! roots, [`Heap::trace`] drains the gray worklist, interned strings that
//! died are purged, and [`Heap::sweep`] frees the rest — running finalizers
//! (files close, pointers drop) and handing module unload hooks back to the
//! caller so they run against a coherent VM.
//!
//! Allocation only *schedules* collection; the VM performs it between
//! opcodes (the safe point). The compiler allocates strings and functions
//! but never collects, so objects under construction need no root chain.

use std::rc::Rc;

use fnv::FnvHashMap;
use log::debug;

use crate::object::{BString, Obj, UnloadFn, Upvalue};
use crate::value::{fnv1a, DictKey, ObjId, Value};

/// Default first-collection threshold: 1 MiB of allocated payload.
pub const DEFAULT_GC_THRESHOLD: usize = 1024 * 1024;

/// Heap growth factor applied to the live size after each collection.
const GROWTH_FACTOR: usize = 2;

/// One arena slot: the GC header plus the object payload.
pub struct GcBox {
    pub marked: bool,
    /// Collections this object has survived, saturating. The survival
    /// counter the C original kept per header.
    pub age: u8,
    pub obj: Obj,
}

pub struct Heap {
    slots: Vec<Option<GcBox>>,
    free: Vec<u32>,
    /// Canonical set of interned strings. Entries are weak in GC terms:
    /// they are purged after marking, before the sweep frees their keys.
    interned: FnvHashMap<Rc<str>, ObjId>,
    bytes_allocated: usize,
    next_gc: usize,
    threshold_floor: usize,
    /// Gray worklist for the current mark phase.
    gray: Vec<ObjId>,
    /// Temporary roots pinned by native code around multi-allocation
    /// sequences that may re-enter the VM.
    pins: Vec<ObjId>,
    pub(crate) collections: u64,
}

impl Heap {
    pub fn new(threshold: usize) -> Self {
        Heap {
            slots: Vec::with_capacity(256),
            free: Vec::new(),
            interned: FnvHashMap::default(),
            bytes_allocated: 0,
            next_gc: threshold,
            threshold_floor: threshold,
            gray: Vec::new(),
            pins: Vec::new(),
            collections: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Allocation and access
    // -----------------------------------------------------------------------

    pub fn alloc(&mut self, obj: Obj) -> ObjId {
        self.bytes_allocated += obj.footprint();
        let boxed = GcBox {
            marked: false,
            age: 0,
            obj,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(boxed);
                ObjId(index)
            }
            None => {
                self.slots.push(Some(boxed));
                ObjId((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn get(&self, id: ObjId) -> &Obj {
        &self.slots[id.0 as usize]
            .as_ref()
            .expect("access to freed object")
            .obj
    }

    pub fn get_mut(&mut self, id: ObjId) -> &mut Obj {
        &mut self.slots[id.0 as usize]
            .as_mut()
            .expect("access to freed object")
            .obj
    }

    /// Text of an interned string object.
    pub fn str_text(&self, id: ObjId) -> &str {
        match self.get(id) {
            Obj::Str(s) => &s.text,
            _ => panic!("expected string object"),
        }
    }

    /// Intern a string, returning the canonical object for its bytes.
    /// Every string creation goes through here: no two distinct string
    /// objects ever hold equal bytes, so id equality is value equality.
    pub fn intern(&mut self, text: &str) -> ObjId {
        if let Some(&id) = self.interned.get(text) {
            return id;
        }
        let rc: Rc<str> = Rc::from(text);
        let hash = fnv1a(text.as_bytes());
        let id = self.alloc(Obj::Str(BString {
            text: Rc::clone(&rc),
            hash,
        }));
        self.interned.insert(rc, id);
        id
    }

    pub fn intern_value(&mut self, text: &str) -> Value {
        Value::Obj(self.intern(text))
    }

    /// A dict key for an interned string, hash included.
    pub fn str_key(&mut self, text: &str) -> DictKey {
        let id = self.intern(text);
        match self.get(id) {
            Obj::Str(s) => DictKey::Str { id, hash: s.hash },
            _ => unreachable!(),
        }
    }

    // -----------------------------------------------------------------------
    // Temporary roots
    // -----------------------------------------------------------------------

    /// Pin an object as a GC root until the matching [`Heap::unpin`].
    /// Native code uses this around allocation sequences that can trigger
    /// a collection through reentrant calls.
    pub fn pin(&mut self, id: ObjId) {
        self.pins.push(id);
    }

    pub fn unpin(&mut self) {
        self.pins.pop();
    }

    // -----------------------------------------------------------------------
    // Collection
    // -----------------------------------------------------------------------

    /// Whether enough has been allocated to warrant a collection at the
    /// next safe point.
    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Mark the pin stack. Called by the VM alongside its own roots.
    pub fn mark_pins(&mut self) {
        let pins: Vec<ObjId> = self.pins.clone();
        for id in pins {
            self.mark_object(id);
        }
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(id) = value {
            self.mark_object(id);
        }
    }

    pub fn mark_object(&mut self, id: ObjId) {
        let slot = self.slots[id.0 as usize]
            .as_mut()
            .expect("marking freed object");
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(id);
    }

    /// Drain the gray worklist, blackening each object by marking its
    /// referents. Strings and other leaf objects contribute nothing.
    pub fn trace(&mut self) {
        while let Some(id) = self.gray.pop() {
            self.blacken(id);
        }
    }

    fn blacken(&mut self, id: ObjId) {
        let mut children: Vec<Value> = Vec::new();
        match self.get(id) {
            Obj::Str(_) | Obj::Bytes(_) | Obj::Range(_) | Obj::Native(_) | Obj::File(_)
            | Obj::Pointer(_) => {}
            Obj::List(items) => children.extend_from_slice(items),
            Obj::Dict(dict) => {
                for (key, value) in &dict.entries {
                    children.push(key.to_value());
                    children.push(*value);
                }
            }
            Obj::Function(f) => {
                children.extend_from_slice(&f.code.constants);
                children.push(Value::Obj(f.module));
                if let Some(class) = f.bound_class {
                    children.push(Value::Obj(class));
                }
            }
            Obj::Closure(c) => {
                children.push(Value::Obj(c.function));
                for &upvalue in &c.upvalues {
                    children.push(Value::Obj(upvalue));
                }
            }
            // Open upvalues point into the stack, which is itself a root.
            Obj::Upvalue(Upvalue::Open(_)) => {}
            Obj::Upvalue(Upvalue::Closed(value)) => children.push(*value),
            Obj::Class(c) => {
                children.push(Value::Obj(c.name));
                if let Some(superclass) = c.superclass {
                    children.push(Value::Obj(superclass));
                }
                for table in [&c.fields, &c.statics, &c.methods] {
                    for (key, value) in table {
                        children.push(Value::Obj(*key));
                        children.push(*value);
                    }
                }
            }
            Obj::Instance(i) => {
                children.push(Value::Obj(i.class));
                for (key, value) in &i.properties {
                    children.push(Value::Obj(*key));
                    children.push(*value);
                }
            }
            Obj::BoundMethod(b) => {
                children.push(b.receiver);
                children.push(Value::Obj(b.method));
            }
            Obj::BoundNative(b) => children.push(b.receiver),
            Obj::Module(m) => {
                for (key, value) in &m.values {
                    children.push(Value::Obj(*key));
                    children.push(*value);
                }
            }
        }
        for child in children {
            self.mark_value(child);
        }
    }

    /// Drop intern entries whose string died this cycle. Must run after
    /// marking and before [`Heap::sweep`], or the sweep would free strings
    /// the intern table still references.
    pub fn purge_interned(&mut self) {
        let slots = &self.slots;
        self.interned
            .retain(|_, id| slots[id.0 as usize].as_ref().is_some_and(|b| b.marked));
    }

    /// Free every unmarked object, clear the mark bits of survivors, and
    /// recompute the allocation counter from live footprints. Returns the
    /// unload hooks of swept native modules for the VM to run.
    pub fn sweep(&mut self) -> Vec<UnloadFn> {
        let before = self.bytes_allocated;
        let mut live_bytes = 0usize;
        let mut unloads = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(boxed) = slot else { continue };
            if boxed.marked {
                boxed.marked = false;
                boxed.age = boxed.age.saturating_add(1);
                live_bytes += boxed.obj.footprint();
                continue;
            }
            match &boxed.obj {
                Obj::File(file) => file.close(),
                Obj::Module(module) => {
                    if let Some(hook) = &module.unload {
                        unloads.push(Rc::clone(hook));
                    }
                }
                _ => {}
            }
            *slot = None;
            self.free.push(index as u32);
        }
        self.bytes_allocated = live_bytes;
        self.next_gc = (live_bytes * GROWTH_FACTOR).max(self.threshold_floor);
        self.collections += 1;
        debug!(
            "gc #{}: {} -> {} bytes, next at {}",
            self.collections, before, live_bytes, self.next_gc
        );
        unloads
    }

    /// Live object count; test and disassembler aid.
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Dict;

    #[test]
    fn interning_returns_identical_ids_for_equal_bytes() {
        let mut heap = Heap::new(DEFAULT_GC_THRESHOLD);
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn unreferenced_objects_are_swept() {
        let mut heap = Heap::new(DEFAULT_GC_THRESHOLD);
        let keep = heap.alloc(Obj::List(vec![Value::Number(1.0)]));
        let _drop = heap.alloc(Obj::List(vec![Value::Number(2.0)]));
        heap.mark_object(keep);
        heap.trace();
        heap.purge_interned();
        heap.sweep();
        assert_eq!(heap.object_count(), 1);
        assert!(matches!(heap.get(keep), Obj::List(_)));
    }

    #[test]
    fn dead_interned_strings_leave_the_intern_table() {
        let mut heap = Heap::new(DEFAULT_GC_THRESHOLD);
        heap.intern("transient");
        heap.trace();
        heap.purge_interned();
        heap.sweep();
        // Re-interning after the purge must produce a fresh object, not a
        // dangling id.
        let id = heap.intern("transient");
        assert_eq!(heap.str_text(id), "transient");
    }

    #[test]
    fn marking_reaches_dict_keys_and_values() {
        let mut heap = Heap::new(DEFAULT_GC_THRESHOLD);
        let key = heap.str_key("k");
        let value = heap.intern_value("v");
        let mut dict = Dict::new();
        dict.insert(key, value);
        let dict_id = heap.alloc(Obj::Dict(dict));
        heap.mark_object(dict_id);
        heap.trace();
        heap.purge_interned();
        heap.sweep();
        assert_eq!(heap.object_count(), 3);
    }

    #[test]
    fn slots_are_reused_after_a_sweep() {
        let mut heap = Heap::new(DEFAULT_GC_THRESHOLD);
        let dead = heap.alloc(Obj::List(Vec::new()));
        heap.trace();
        heap.purge_interned();
        heap.sweep();
        let reborn = heap.alloc(Obj::Bytes(vec![1, 2, 3]));
        assert_eq!(dead, reborn);
    }
}
