// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2025 Tobias Sarnowski <tobias@sarnowski.cloud>

//! Native (host-provided) functions installed into every VM's globals.

use std::sync::OnceLock;
use std::time::Instant;

use crate::gc::Heap;
use crate::object::ObjNative;
use crate::table::Table;
use crate::value::Value;

static START: OnceLock<Instant> = OnceLock::new();

fn clock(_args: &[Value]) -> Result<Value, &'static str> {
    let start = START.get_or_init(Instant::now);
    Ok(Value::Number(start.elapsed().as_secs_f64()))
}

/// Define every native function as a global, interning its name through
/// `heap` and installing a closure-free function pointer.
pub fn define_all(heap: &mut Heap, globals: &mut Table) {
    define(heap, globals, "clock", 0, clock);
}

fn define(heap: &mut Heap, globals: &mut Table, name: &'static str, arity: u8, function: crate::object::NativeFn) {
    let interned = heap.intern(name);
    let native_ref = heap.alloc_native(ObjNative { name, arity, function });
    globals.set(interned, Value::Obj(native_ref));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_returns_a_non_negative_number() {
        let value = clock(&[]).expect("clock never fails");
        assert!(value.as_number().expect("clock returns a number") >= 0.0);
    }
}
