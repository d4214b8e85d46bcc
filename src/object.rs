// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2025 Tobias Sarnowski <tobias@sarnowski.cloud>

//! Heap object model for Quill values.
//!
//! Every heap-allocated value shares a common header (kind tag, mark bit)
//! and is reachable from exactly one slot in the VM's heap list. Objects
//! never move once allocated, so references between them are plain
//! pointers rather than indices into a relocatable arena.

use std::fmt;
use std::ptr::NonNull;

use crate::chunk::Chunk;
use crate::value::Value;

/// A non-owning reference to a heap object.
///
/// Dereferencing is only sound while the referenced object is reachable
/// from the VM's heap list, which the garbage collector guarantees for
/// anything still rooted. `ObjRef` is `Copy` because the language's
/// values themselves are copied freely; ownership lives in
/// [`crate::gc::Heap`]'s object list.
#[derive(Clone, Copy)]
pub struct ObjRef(pub(crate) NonNull<Obj>);

impl ObjRef {
    /// Borrow the object's shared header and payload.
    #[must_use]
    pub fn get(self) -> &'static Obj {
        // SAFETY: a live ObjRef was handed out by the heap and is kept
        // alive by the mark-sweep collector for as long as it is
        // reachable from a root; callers never hold one past a point
        // where it could have been collected without re-deriving it
        // from a root (stack slot, global, upvalue, etc.).
        unsafe { self.0.as_ref() }
    }

    /// Mutably borrow the object's payload.
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    pub fn get_mut(self) -> &'static mut Obj {
        // SAFETY: see `get`. The VM never aliases a mutable borrow of
        // one object with another live borrow of the same object.
        unsafe { &mut *self.0.as_ptr() }
    }

    pub(crate) fn as_ptr(self) -> NonNull<Obj> {
        self.0
    }

    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl PartialEq for ObjRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for ObjRef {}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:p})", self.0.as_ptr())
    }
}

/// The header and payload shared by every heap object.
///
/// `next` threads the object onto the heap's allocation list so the
/// sweep phase can walk every live object without a side table.
pub struct Obj {
    pub marked: bool,
    pub next: Option<NonNull<Obj>>,
    pub kind: ObjKind,
}

/// The discriminated payload of a heap object.
pub enum ObjKind {
    String(ObjString),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
    Native(ObjNative),
}

impl Obj {
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            ObjKind::String(_) => "string",
            ObjKind::Function(_) => "function",
            ObjKind::Closure(_) => "closure",
            ObjKind::Upvalue(_) => "upvalue",
            ObjKind::Class(_) => "class",
            ObjKind::Instance(_) => "instance",
            ObjKind::BoundMethod(_) => "bound method",
            ObjKind::Native(_) => "native function",
        }
    }

    pub fn as_string(&self) -> Option<&ObjString> {
        match &self.kind {
            ObjKind::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&ObjFunction> {
        match &self.kind {
            ObjKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_function_mut(&mut self) -> Option<&mut ObjFunction> {
        match &mut self.kind {
            ObjKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&ObjClosure> {
        match &self.kind {
            ObjKind::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_closure_mut(&mut self) -> Option<&mut ObjClosure> {
        match &mut self.kind {
            ObjKind::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_upvalue(&self) -> Option<&ObjUpvalue> {
        match &self.kind {
            ObjKind::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_upvalue_mut(&mut self) -> Option<&mut ObjUpvalue> {
        match &mut self.kind {
            ObjKind::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&ObjClass> {
        match &self.kind {
            ObjKind::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_class_mut(&mut self) -> Option<&mut ObjClass> {
        match &mut self.kind {
            ObjKind::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&ObjInstance> {
        match &self.kind {
            ObjKind::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_instance_mut(&mut self) -> Option<&mut ObjInstance> {
        match &mut self.kind {
            ObjKind::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_bound_method(&self) -> Option<&ObjBoundMethod> {
        match &self.kind {
            ObjKind::BoundMethod(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_native(&self) -> Option<&ObjNative> {
        match &self.kind {
            ObjKind::Native(n) => Some(n),
            _ => None,
        }
    }
}

/// An immutable, interned byte string with a cached FNV-1a hash.
pub struct ObjString {
    pub chars: Box<str>,
    pub hash: u32,
}

impl ObjString {
    #[must_use]
    pub fn new(s: &str) -> Self {
        Self {
            hash: fnv1a(s.as_bytes()),
            chars: s.into(),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.chars
    }
}

/// FNV-1a hash, used both for string caching and table probing.
#[must_use]
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// A compiled function: arity, upvalue count, and its own chunk.
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// `None` for the implicit top-level script function.
    pub name: Option<ObjRef>,
}

impl ObjFunction {
    #[must_use]
    pub fn new(name: Option<ObjRef>) -> Self {
        Self {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        match self.name {
            Some(name) => name
                .get()
                .as_string()
                .map_or_else(|| "<fn>".to_string(), |s| s.as_str().to_string()),
            None => "<script>".to_string(),
        }
    }
}

/// Describes how a closure's upvalue was captured at the point the
/// `OP_CLOSURE` instruction ran, so the VM knows whether to open a new
/// capture over a stack slot or to reuse the enclosing closure's.
#[derive(Clone, Copy, Debug)]
pub struct UpvalueDescriptor {
    pub is_local: bool,
    pub index: u8,
}

/// A function paired with the upvalues it captured when it was created.
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// Either a live pointer into the operand stack (open) or an owned
/// value copied out of it once the defining frame exits (closed).
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

pub struct ObjUpvalue {
    pub state: UpvalueState,
    /// Intrusive list of open upvalues, sorted by descending stack slot.
    pub next_open: Option<ObjRef>,
}

/// A class: its name and a method table mapping interned method names
/// to closures.
pub struct ObjClass {
    pub name: ObjRef,
    pub methods: crate::table::Table,
}

impl ObjClass {
    #[must_use]
    pub fn new(name: ObjRef) -> Self {
        Self {
            name,
            methods: crate::table::Table::new(),
        }
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.get().as_string().map_or("", ObjString::as_str)
    }
}

/// An instance of a class with its own field table.
pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: crate::table::Table,
}

impl ObjInstance {
    #[must_use]
    pub fn new(class: ObjRef) -> Self {
        Self {
            class,
            fields: crate::table::Table::new(),
        }
    }
}

/// A reified `(receiver, method)` pair produced by reading a method as
/// a property.
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

/// A host-provided native function.
pub type NativeFn = fn(args: &[Value]) -> Result<Value, &'static str>;

pub struct ObjNative {
    pub name: &'static str,
    pub arity: u8,
    pub function: NativeFn,
}
