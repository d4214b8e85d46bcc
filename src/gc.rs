// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2025 Tobias Sarnowski <tobias@sarnowski.cloud>

//! Heap storage and the mark-sweep collector mechanics.
//!
//! `Heap` owns every object ever allocated (via an intrusive singly
//! linked list threaded through [`Obj::next`]) plus the string
//! interning table. It knows how to allocate, mark, and sweep, but it
//! has no notion of *roots* — the VM (which owns the operand stack,
//! call frames, globals, and open-upvalue list) drives collection by
//! marking its own roots through [`Heap::mark_value`] and
//! [`Heap::mark_object`] before calling [`Heap::trace_and_sweep`].
//! This split keeps the collector itself allocation-agnostic and
//! testable in isolation (see the unit tests below).

use std::ptr::NonNull;

use crate::object::{Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjKind, ObjNative, ObjRef, ObjString, ObjUpvalue, UpvalueState};
use crate::table::Table;
use crate::value::Value;

/// Growth factor applied to the allocation threshold after each
/// collection.
const HEAP_GROW_FACTOR: usize = 2;

/// Initial collection threshold, in bytes, before the heap has ever
/// run a collection. Small on purpose so tests exercise the collector
/// without needing thousands of allocations.
const INITIAL_NEXT_GC: usize = 1024 * 1024;

pub struct Heap {
    head: Option<NonNull<Obj>>,
    pub strings: Table,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    gray_stack: Vec<ObjRef>,
    /// Forces a collection on every allocation when set (`QUILL_GC_STRESS`).
    pub stress: bool,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: None,
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            gray_stack: Vec::new(),
            stress: false,
        }
    }

    /// Allocate a new object onto the heap list, returning a reference
    /// to it. This does not itself trigger a collection — see
    /// [`crate::vm::Vm::maybe_collect`] for the funnel every caller
    /// goes through before invoking this.
    fn push(&mut self, kind: ObjKind, size: usize) -> ObjRef {
        let boxed = Box::new(Obj {
            marked: false,
            next: self.head,
            kind,
        });
        let ptr = NonNull::from(Box::leak(boxed));
        self.head = Some(ptr);
        self.bytes_allocated += size;
        ObjRef(ptr)
    }

    pub fn alloc_string_raw(&mut self, s: ObjString) -> ObjRef {
        let size = std::mem::size_of::<ObjString>() + s.chars.len();
        self.push(ObjKind::String(s), size)
    }

    pub fn alloc_function(&mut self, f: ObjFunction) -> ObjRef {
        self.push(ObjKind::Function(f), std::mem::size_of::<ObjFunction>())
    }

    pub fn alloc_closure(&mut self, c: ObjClosure) -> ObjRef {
        let size = std::mem::size_of::<ObjClosure>() + c.upvalues.len() * 8;
        self.push(ObjKind::Closure(c), size)
    }

    pub fn alloc_upvalue(&mut self, u: ObjUpvalue) -> ObjRef {
        self.push(ObjKind::Upvalue(u), std::mem::size_of::<ObjUpvalue>())
    }

    pub fn alloc_class(&mut self, c: ObjClass) -> ObjRef {
        self.push(ObjKind::Class(c), std::mem::size_of::<ObjClass>())
    }

    pub fn alloc_instance(&mut self, i: ObjInstance) -> ObjRef {
        self.push(ObjKind::Instance(i), std::mem::size_of::<ObjInstance>())
    }

    pub fn alloc_bound_method(&mut self, b: ObjBoundMethod) -> ObjRef {
        self.push(ObjKind::BoundMethod(b), std::mem::size_of::<ObjBoundMethod>())
    }

    pub fn alloc_native(&mut self, n: ObjNative) -> ObjRef {
        self.push(ObjKind::Native(n), std::mem::size_of::<ObjNative>())
    }

    /// Mark an object reachable, pushing it onto the gray worklist the
    /// first time it is seen this collection.
    pub fn mark_object(&mut self, obj: ObjRef) {
        if obj.get().marked {
            return;
        }
        obj.get_mut().marked = true;
        self.gray_stack.push(obj);
    }

    /// Mark a value reachable, which is a no-op for immediates.
    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    fn mark_table(&mut self, table: &Table) {
        let pairs: Vec<_> = table.iter().collect();
        for (key, value) in pairs {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    /// Pop one gray object and mark everything it references,
    /// transitioning it conceptually from gray to black.
    fn blacken(&mut self, obj: ObjRef) {
        // SAFETY: `obj` is a live heap reference; we only ever read its
        // payload here, then mark its children through `self`.
        let kind_ptr: *const ObjKind = &obj.get().kind;
        match unsafe { &*kind_ptr } {
            ObjKind::String(_) | ObjKind::Native(_) => {}
            ObjKind::Function(f) => {
                if let Some(name) = f.name {
                    self.mark_object(name);
                }
                let constants = f.chunk.constants.clone();
                for c in constants {
                    self.mark_value(c);
                }
            }
            ObjKind::Closure(c) => {
                self.mark_object(c.function);
                let upvalues = c.upvalues.clone();
                for u in upvalues {
                    self.mark_object(u);
                }
            }
            ObjKind::Upvalue(u) => {
                if let UpvalueState::Closed(v) = u.state {
                    self.mark_value(v);
                }
            }
            ObjKind::Class(c) => {
                self.mark_object(c.name);
                self.mark_table(&c.methods);
            }
            ObjKind::Instance(i) => {
                self.mark_object(i.class);
                self.mark_table(&i.fields);
            }
            ObjKind::BoundMethod(b) => {
                self.mark_value(b.receiver);
                self.mark_object(b.method);
            }
        }
    }

    /// Drain the gray worklist, then remove weak string-table entries
    /// and free every unmarked object, clearing the mark bit on
    /// survivors. Returns the number of bytes freed.
    pub fn trace_and_sweep(&mut self) -> usize {
        while let Some(obj) = self.gray_stack.pop() {
            self.blacken(obj);
        }

        self.strings.remove_unmarked();

        let before = self.bytes_allocated;
        let mut current = self.head;
        let mut previous: Option<NonNull<Obj>> = None;
        while let Some(ptr) = current {
            // SAFETY: every pointer in the heap list was produced by
            // `push` and has not been freed yet.
            let obj_ref = unsafe { ptr.as_ref() };
            let next = obj_ref.next;
            if obj_ref.marked {
                // SAFETY: we only clear the mark bit, not alias a move.
                unsafe {
                    (*ptr.as_ptr()).marked = false;
                }
                previous = Some(ptr);
            } else {
                match previous {
                    Some(prev) => unsafe {
                        (*prev.as_ptr()).next = next;
                    },
                    None => self.head = next,
                }
                let freed = free_size(obj_ref);
                self.bytes_allocated = self.bytes_allocated.saturating_sub(freed);
                // SAFETY: unlinked from the heap list and unreachable
                // from any root (it was unmarked at the end of tracing).
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
            current = next;
        }

        self.next_gc = self.bytes_allocated.max(1) * HEAP_GROW_FACTOR;
        before.saturating_sub(self.bytes_allocated)
    }

    #[must_use]
    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    /// Intern `s`, returning the existing reference if content-equal
    /// string is already interned. Does not itself check the GC
    /// threshold; callers go through the VM's allocation funnel.
    pub fn intern(&mut self, s: &str) -> ObjRef {
        let hash = crate::object::fnv1a(s.as_bytes());
        if let Some(existing) = self.strings.find_string(s, hash) {
            return existing;
        }
        let obj = self.alloc_string_raw(ObjString::new(s));
        self.strings.set(obj, Value::Bool(false));
        obj
    }

    #[cfg(test)]
    fn object_count(&self) -> usize {
        let mut count = 0;
        let mut current = self.head;
        while let Some(ptr) = current {
            count += 1;
            current = unsafe { ptr.as_ref() }.next;
        }
        count
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut current = self.head;
        while let Some(ptr) = current {
            // SAFETY: the heap uniquely owns every object in its list;
            // dropping the heap drops them all exactly once.
            let next = unsafe { ptr.as_ref() }.next;
            unsafe {
                drop(Box::from_raw(ptr.as_ptr()));
            }
            current = next;
        }
    }
}

fn free_size(obj: &Obj) -> usize {
    match &obj.kind {
        ObjKind::String(s) => std::mem::size_of::<ObjString>() + s.chars.len(),
        ObjKind::Function(_) => std::mem::size_of::<ObjFunction>(),
        ObjKind::Closure(c) => std::mem::size_of::<ObjClosure>() + c.upvalues.len() * 8,
        ObjKind::Upvalue(_) => std::mem::size_of::<ObjUpvalue>(),
        ObjKind::Class(_) => std::mem::size_of::<ObjClass>(),
        ObjKind::Instance(_) => std::mem::size_of::<ObjInstance>(),
        ObjKind::BoundMethod(_) => std::mem::size_of::<ObjBoundMethod>(),
        ObjKind::Native(_) => std::mem::size_of::<ObjNative>(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_same_reference() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert!(a == b);
    }

    #[test]
    fn sweep_frees_unreached_objects_and_keeps_rooted_ones() {
        let mut heap = Heap::new();
        let rooted = heap.intern("rooted");
        let _unrooted = heap.intern("unrooted");
        assert_eq!(heap.object_count(), 2);

        heap.mark_object(rooted);
        heap.trace_and_sweep();

        assert_eq!(heap.object_count(), 1);
        assert!(heap.strings.find_string("unrooted", crate::object::fnv1a(b"unrooted")).is_none());
        assert!(heap.strings.find_string("rooted", crate::object::fnv1a(b"rooted")).is_some());
    }
}
