// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2025 Tobias Sarnowski <tobias@sarnowski.cloud>

//! Stack-based bytecode interpreter.
//!
//! `Vm` owns the operand stack, the call-frame stack, the globals
//! table, the open-upvalue list, and the [`Heap`]. Allocation is the
//! only suspension point: every site that creates a heap object first
//! roots everything the VM can currently see (stack, frames, open
//! upvalues, globals, the cached `init` string) and offers the heap a
//! chance to collect, mirroring the "allocation funnel" the object
//! model calls for.

use std::fmt;
use std::io::Write;

use crate::chunk::OpCode;
use crate::compiler::{self, CompileError};
use crate::config::{GcConfig, VmConfig};
use crate::gc::Heap;
use crate::natives;
use crate::object::{
    ObjBoundMethod, ObjClass, ObjClosure, ObjInstance, ObjKind, ObjNative, ObjRef, ObjUpvalue,
    UpvalueState,
};
use crate::value::Value;

/// A single runtime diagnostic, without the stack trace (that is
/// attached once execution has unwound, see [`RuntimeError`]).
#[derive(Debug, Clone)]
struct Fault(String);

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn fault(message: impl Into<String>) -> Fault {
    Fault(message.into())
}

/// One entry of a runtime error's stack trace: the line active in that
/// frame and the function's display name (`"script"` for top level).
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: u32,
    pub function_name: String,
}

/// A runtime error together with the call-stack trace captured at the
/// moment it unwound, formatted as `message` followed by one
/// `[line L] in <function>` entry per active frame, most recent first.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for (i, frame) in self.trace.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "[line {}] in {}", frame.line, frame.function_name)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Either domain of failure a Quill program can produce.
#[derive(Debug)]
pub enum InterpretError {
    Compile(Vec<CompileError>),
    Runtime(RuntimeError),
}

impl InterpretError {
    /// The process exit status the CLI should report for this error's domain.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Compile(_) => 65,
            Self::Runtime(_) => 70,
        }
    }
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile(errs) => {
                for (i, e) in errs.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{e}")?;
                }
                Ok(())
            }
            Self::Runtime(e) => write!(f, "{e}"),
        }
    }
}

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    base: usize,
}

/// The bytecode interpreter. Generic over its `print` destination so
/// tests can capture output in memory while the CLI binary wires it to
/// real standard output.
pub struct Vm<W: Write> {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: crate::table::Table,
    open_upvalues: Option<ObjRef>,
    init_string: ObjRef,
    config: VmConfig,
    gc_log_info: bool,
    stdout: W,
}

impl Vm<std::io::Stdout> {
    /// A VM that prints to the process's real standard output.
    #[must_use]
    pub fn new() -> Self {
        Self::with_writer(std::io::stdout(), VmConfig::from_env(), GcConfig::from_env())
    }
}

impl Default for Vm<std::io::Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write> Vm<W> {
    /// Build a VM that writes `print` output through `stdout`, with the
    /// given stack/frame capacities and GC policy.
    #[must_use]
    pub fn with_writer(stdout: W, config: VmConfig, gc: GcConfig) -> Self {
        let mut heap = Heap::new();
        heap.stress = gc.stress;
        let init_string = heap.intern("init");
        let mut globals = crate::table::Table::new();
        natives::define_all(&mut heap, &mut globals);
        Self {
            heap,
            stack: Vec::with_capacity(config.stack_max.min(1024)),
            frames: Vec::with_capacity(config.frames_max),
            globals,
            open_upvalues: None,
            init_string,
            config,
            gc_log_info: gc.log_info,
            stdout,
        }
    }

    /// Consume the VM and hand back whatever it wrote through `print`.
    /// Used by tests (in-crate and black-box) that run against an
    /// in-memory writer instead of real standard output.
    pub fn into_stdout(self) -> W {
        self.stdout
    }

    /// Compile and run `source` against this VM's persistent state
    /// (globals and interned strings survive across calls, matching
    /// the REPL's sharing of one `Vm` across lines).
    ///
    /// # Errors
    ///
    /// Returns the collected compile diagnostics if compilation failed,
    /// or the runtime error (with stack trace) if execution aborted.
    /// No bytecode from a failed compile ever reaches the VM.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function_ref = compiler::compile(source, &mut self.heap).map_err(InterpretError::Compile)?;
        let function = function_ref.get().as_function().expect("compile returns a function");
        tracing::debug!(
            name = %function.display_name(),
            arity = function.arity,
            constants = function.chunk.constants.len(),
            code_len = function.chunk.code.len(),
            "chunk compiled",
        );

        // Root the compiled function before any allocation can trigger
        // a collection, mirroring clox's push(OBJ_VAL(function)) ahead
        // of newClosure: nothing else reaches it yet.
        self.stack.push(Value::Obj(function_ref));
        self.maybe_collect();
        let closure_ref = self.heap.alloc_closure(ObjClosure { function: function_ref, upvalues: Vec::new() });
        self.stack.pop();
        self.stack.push(Value::Obj(closure_ref));
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, base: 0 });

        let result = self.run();
        if let Err(fault) = result {
            let trace = self.build_trace();
            self.stack.clear();
            self.frames.clear();
            self.open_upvalues = None;
            return Err(InterpretError::Runtime(RuntimeError { message: fault.0, trace }));
        }
        Ok(())
    }

    fn build_trace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let closure = frame.closure.get().as_closure().expect("frame closure");
                let function = closure.function.get().as_function().expect("closure function");
                let line = function.chunk.line_at(frame.ip.saturating_sub(1));
                let function_name = function.name.map_or_else(|| "script".to_string(), |_| function.display_name());
                TraceFrame { line, function_name }
            })
            .collect()
    }

    // -- stack helpers ----------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // -- allocation funnel --------------------------------------------------

    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let before = self.heap.bytes_allocated;
        for &v in &self.stack {
            self.heap.mark_value(v);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        let mut current = self.open_upvalues;
        while let Some(up) = current {
            self.heap.mark_object(up);
            current = up.get().as_upvalue().expect("open upvalue list entry").next_open;
        }
        let global_pairs: Vec<_> = self.globals.iter().collect();
        for (key, value) in global_pairs {
            self.heap.mark_object(key);
            self.heap.mark_value(value);
        }
        self.heap.mark_object(self.init_string);

        let freed = self.heap.trace_and_sweep();
        if self.gc_log_info {
            tracing::info!(
                bytes_before = before,
                bytes_after = self.heap.bytes_allocated,
                freed,
                next_gc = self.heap.next_gc,
                "gc cycle",
            );
        } else {
            tracing::trace!(
                bytes_before = before,
                bytes_after = self.heap.bytes_allocated,
                freed,
                next_gc = self.heap.next_gc,
                "gc cycle",
            );
        }
    }

    // -- bytecode readers ---------------------------------------------------

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("frame stack never empty while running");
        let closure = frame.closure.get().as_closure().expect("frame closure");
        let function = closure.function.get().as_function().expect("closure function");
        let byte = function.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        (u16::from(hi) << 8) | u16::from(lo)
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte();
        let frame = self.frames.last().expect("frame stack never empty while running");
        let closure = frame.closure.get().as_closure().expect("frame closure");
        let function = closure.function.get().as_function().expect("closure function");
        function.chunk.constants[idx as usize]
    }

    fn read_string(&mut self) -> ObjRef {
        self.read_constant().as_obj().expect("name operand must be an interned string")
    }

    fn current_closure(&self) -> ObjRef {
        self.frames.last().expect("frame stack never empty while running").closure
    }

    fn current_base(&self) -> usize {
        self.frames.last().expect("frame stack never empty while running").base
    }

    // -- the interpreter loop -------------------------------------------

    #[expect(clippy::too_many_lines, reason = "one dispatch arm per opcode reads better flat than split across helpers")]
    fn run(&mut self) -> Result<(), Fault> {
        loop {
            let op = OpCode::from_u8(self.read_byte());
            match op {
                OpCode::Constant => {
                    let v = self.read_constant();
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_base();
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_base();
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(name) {
                        Some(v) => self.push(v),
                        None => return Err(self.undefined_variable(name)),
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.pop();
                    self.globals.set(name, value);
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    if !self.globals.contains(name) {
                        return Err(self.undefined_variable(name));
                    }
                    self.globals.set(name, self.peek(0));
                }
                OpCode::GetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let closure = self.current_closure().get().as_closure().expect("closure");
                    let up = closure.upvalues[idx];
                    let value = match up.get().as_upvalue().expect("upvalue").state {
                        UpvalueState::Open(slot) => self.stack[slot],
                        UpvalueState::Closed(v) => v,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let value = self.peek(0);
                    let closure = self.current_closure().get().as_closure().expect("closure");
                    let up = closure.upvalues[idx];
                    match up.get_mut().as_upvalue_mut().expect("upvalue").state {
                        UpvalueState::Open(slot) => self.stack[slot] = value,
                        ref mut state @ UpvalueState::Closed(_) => *state = UpvalueState::Closed(value),
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    self.get_property(name)?;
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    self.set_property(name)?;
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop().as_obj().expect("super must be a class value");
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(Value::values_equal(a, b)));
                }
                OpCode::Greater => self.binary_compare(|a, b| a > b)?,
                OpCode::Less => self.binary_compare(|a, b| a < b)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.binary_arith(|a, b| a - b)?,
                OpCode::Multiply => self.binary_arith(|a, b| a * b)?,
                OpCode::Divide => self.binary_arith(|a, b| a / b)?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => {
                    let v = self.peek(0);
                    let Some(n) = v.as_number() else {
                        return Err(fault("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(-n));
                }
                OpCode::Print => {
                    let v = self.pop();
                    let _ = writeln!(self.stdout, "{v}");
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().expect("frame").ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().expect("frame").ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().expect("frame").ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    let superclass = self.pop().as_obj().expect("super must be a class value");
                    self.invoke_from_class(superclass, name, argc)?;
                }
                OpCode::Closure => self.make_closure(),
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let base = self.current_base();
                    self.close_upvalues(base);
                    self.frames.pop();
                    self.stack.truncate(base);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    self.maybe_collect();
                    let class_ref = self.heap.alloc_class(ObjClass::new(name));
                    self.push(Value::Obj(class_ref));
                }
                OpCode::Inherit => self.inherit()?,
                OpCode::Method => {
                    let name = self.read_string();
                    self.define_method(name);
                }
            }
        }
    }

    // -- arithmetic / comparisons -------------------------------------------

    fn binary_arith(&mut self, f: impl Fn(f64, f64) -> f64) -> Result<(), Fault> {
        let (Some(b), Some(a)) = (self.peek(0).as_number(), self.peek(1).as_number()) else {
            return Err(fault("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        self.push(Value::Number(f(a, b)));
        Ok(())
    }

    fn binary_compare(&mut self, f: impl Fn(f64, f64) -> bool) -> Result<(), Fault> {
        let (Some(b), Some(a)) = (self.peek(0).as_number(), self.peek(1).as_number()) else {
            return Err(fault("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        self.push(Value::Bool(f(a, b)));
        Ok(())
    }

    fn add(&mut self) -> Result<(), Fault> {
        let b = self.peek(0);
        let a = self.peek(1);
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            self.pop();
            self.pop();
            self.push(Value::Number(x + y));
            return Ok(());
        }
        if let (Some(x), Some(y)) = (a.as_string(), b.as_string()) {
            let mut combined = String::with_capacity(x.len() + y.len());
            combined.push_str(x);
            combined.push_str(y);
            self.maybe_collect();
            let interned = self.heap.intern(&combined);
            self.pop();
            self.pop();
            self.push(Value::Obj(interned));
            return Ok(());
        }
        Err(fault("Operands must be two numbers or two strings."))
    }

    // -- properties / methods -----------------------------------------------

    fn get_property(&mut self, name: ObjRef) -> Result<(), Fault> {
        let receiver = self.peek(0);
        let Some(instance) = receiver.as_obj().and_then(|r| r.get().as_instance()) else {
            return Err(fault("Only instances have properties."));
        };
        if let Some(value) = instance.fields.get(name) {
            self.pop();
            self.push(value);
            return Ok(());
        }
        self.bind_method(instance.class, name)
    }

    fn set_property(&mut self, name: ObjRef) -> Result<(), Fault> {
        let receiver = self.peek(1);
        let Some(obj) = receiver.as_obj() else {
            return Err(fault("Only instances have fields."));
        };
        let Some(instance) = obj.get_mut().as_instance_mut() else {
            return Err(fault("Only instances have fields."));
        };
        let value = self.peek(0);
        instance.fields.set(name, value);
        let value = self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), Fault> {
        let class_obj = class.get().as_class().expect("bind_method target must be a class");
        let Some(method) = class_obj.methods.get(name) else {
            return Err(self.undefined_property(name));
        };
        let method_closure = method.as_obj().expect("method table stores closures");
        self.maybe_collect();
        let bound = self.heap.alloc_bound_method(ObjBoundMethod { receiver: self.peek(0), method: method_closure });
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    fn invoke(&mut self, name: ObjRef, argc: u8) -> Result<(), Fault> {
        let receiver = self.peek(argc as usize);
        let Some(instance) = receiver.as_obj().and_then(|r| r.get().as_instance()) else {
            return Err(fault("Only instances have methods."));
        };
        if let Some(field) = instance.fields.get(name) {
            let slot = self.stack.len() - 1 - argc as usize;
            self.stack[slot] = field;
            return self.call_value(field, argc);
        }
        self.invoke_from_class(instance.class, name, argc)
    }

    fn invoke_from_class(&mut self, class: ObjRef, name: ObjRef, argc: u8) -> Result<(), Fault> {
        let class_obj = class.get().as_class().expect("invoke_from_class target must be a class");
        let Some(method) = class_obj.methods.get(name) else {
            return Err(self.undefined_property(name));
        };
        let closure = method.as_obj().expect("method table stores closures");
        self.call_closure(closure, argc)
    }

    fn inherit(&mut self) -> Result<(), Fault> {
        let superclass_val = self.peek(1);
        let Some(superclass) = superclass_val.as_obj().filter(|r| matches!(r.get().kind, ObjKind::Class(_))) else {
            return Err(fault("Superclass must be a class."));
        };
        let subclass = self.peek(0).as_obj().expect("OP_INHERIT subclass operand must be a class");
        let methods: Vec<_> = superclass.get().as_class().expect("checked above").methods.iter().collect();
        let subclass_obj = subclass.get_mut().as_class_mut().expect("OP_INHERIT subclass operand must be a class");
        for (name, closure) in methods {
            subclass_obj.methods.set(name, closure);
        }
        self.pop();
        Ok(())
    }

    fn define_method(&mut self, name: ObjRef) {
        let closure = self.pop();
        let class = self.peek(0).as_obj().expect("OP_METHOD target must be a class");
        class.get_mut().as_class_mut().expect("OP_METHOD target must be a class").methods.set(name, closure);
    }

    // -- closures / upvalues --------------------------------------------

    fn make_closure(&mut self) {
        let function_ref = self.read_constant().as_obj().expect("OP_CLOSURE operand must be a function");
        let upvalue_count = function_ref.get().as_function().expect("must be function").upvalue_count;
        let mut upvalues = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            if is_local {
                let slot = self.current_base() + index;
                upvalues.push(self.capture_upvalue(slot));
            } else {
                let enclosing = self.current_closure().get().as_closure().expect("closure");
                upvalues.push(enclosing.upvalues[index]);
            }
        }
        self.maybe_collect();
        let closure_ref = self.heap.alloc_closure(ObjClosure { function: function_ref, upvalues });
        self.push(Value::Obj(closure_ref));
    }

    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut current = self.open_upvalues;
        while let Some(up_ref) = current {
            let up = up_ref.get().as_upvalue().expect("open upvalue list entry");
            let UpvalueState::Open(up_slot) = up.state else {
                unreachable!("open-upvalue list only ever holds open upvalues")
            };
            if up_slot == slot {
                return up_ref;
            }
            if up_slot < slot {
                break;
            }
            prev = current;
            current = up.next_open;
        }

        self.maybe_collect();
        let new_up = self.heap.alloc_upvalue(ObjUpvalue { state: UpvalueState::Open(slot), next_open: current });
        match prev {
            Some(p) => p.get_mut().as_upvalue_mut().expect("upvalue").next_open = Some(new_up),
            None => self.open_upvalues = Some(new_up),
        }
        new_up
    }

    fn close_upvalues(&mut self, min_slot: usize) {
        while let Some(up_ref) = self.open_upvalues {
            let up = up_ref.get().as_upvalue().expect("open upvalue list entry");
            let UpvalueState::Open(slot) = up.state else {
                break;
            };
            if slot < min_slot {
                break;
            }
            let value = self.stack[slot];
            let next = up.next_open;
            let up_mut = up_ref.get_mut().as_upvalue_mut().expect("upvalue");
            up_mut.state = UpvalueState::Closed(value);
            up_mut.next_open = None;
            self.open_upvalues = next;
        }
    }

    // -- calls ------------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), Fault> {
        let Some(obj) = callee.as_obj() else {
            return Err(fault("Can only call functions and classes."));
        };
        match &obj.get().kind {
            ObjKind::Closure(_) => self.call_closure(obj, argc),
            ObjKind::Class(_) => self.call_class(obj, argc),
            ObjKind::BoundMethod(_) => {
                let bound = obj.get().as_bound_method().expect("checked above").clone_for_call();
                let slot = self.stack.len() - 1 - argc as usize;
                self.stack[slot] = bound.receiver;
                self.call_closure(bound.method, argc)
            }
            ObjKind::Native(_) => self.call_native(obj, argc),
            _ => Err(fault("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, argc: u8) -> Result<(), Fault> {
        let function = closure.get().as_closure().expect("call_closure target must be a closure").function;
        let arity = function.get().as_function().expect("closure function").arity;
        if argc != arity {
            return Err(fault(format!("Expected {arity} arguments but got {argc}.")));
        }
        if self.frames.len() >= self.config.frames_max {
            return Err(fault("Stack overflow."));
        }
        let base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame { closure, ip: 0, base });
        Ok(())
    }

    fn call_class(&mut self, class: ObjRef, argc: u8) -> Result<(), Fault> {
        self.maybe_collect();
        let instance = self.heap.alloc_instance(ObjInstance::new(class));
        let slot = self.stack.len() - 1 - argc as usize;
        self.stack[slot] = Value::Obj(instance);

        let init = class.get().as_class().expect("call_class target must be a class").methods.get(self.init_string);
        match init {
            Some(init_val) => {
                let init_closure = init_val.as_obj().expect("init method must be a closure");
                self.call_closure(init_closure, argc)
            }
            None if argc == 0 => Ok(()),
            None => Err(fault(format!("Expected 0 arguments but got {argc}."))),
        }
    }

    fn call_native(&mut self, native: ObjRef, argc: u8) -> Result<(), Fault> {
        let native_obj = native.get().as_native().expect("call_native target must be native");
        if argc != native_obj.arity {
            return Err(fault(format!("Expected {} arguments but got {argc}.", native_obj.arity)));
        }
        let slot = self.stack.len() - argc as usize;
        let result = (native_obj.function)(&self.stack[slot..]).map_err(fault)?;
        self.stack.truncate(slot - 1);
        self.push(result);
        Ok(())
    }

    // -- error helpers ----------------------------------------------------

    fn undefined_variable(&self, name: ObjRef) -> Fault {
        let s = name.get().as_string().map_or("", crate::object::ObjString::as_str);
        fault(format!("Undefined variable '{s}'."))
    }

    fn undefined_property(&self, name: ObjRef) -> Fault {
        let s = name.get().as_string().map_or("", crate::object::ObjString::as_str);
        fault(format!("Undefined property '{s}'."))
    }
}

impl ObjBoundMethod {
    /// `ObjBoundMethod` is behind a shared heap reference; this copies
    /// the two fields out (both `Copy`) so the call path can release
    /// the borrow on `obj` before mutating the stack.
    fn clone_for_call(&self) -> Self {
        Self { receiver: self.receiver, method: self.method }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ok(source: &str) -> String {
        let mut vm = Vm::with_writer(Vec::new(), VmConfig::default(), GcConfig::default());
        vm.interpret(source).unwrap_or_else(|e| panic!("expected success, got: {e}"));
        String::from_utf8(vm.stdout.clone()).expect("utf8 output")
    }

    fn run_err(source: &str) -> RuntimeError {
        let mut vm = Vm::with_writer(Vec::new(), VmConfig::default(), GcConfig::default());
        match vm.interpret(source) {
            Ok(()) => panic!("expected a runtime error"),
            Err(InterpretError::Runtime(e)) => e,
            Err(InterpretError::Compile(errs)) => panic!("expected runtime error, got compile errors: {errs:?}"),
        }
    }

    #[test]
    fn s1_arithmetic() {
        assert_eq!(run_ok("print 1 + 2;"), "3\n");
    }

    #[test]
    fn s2_string_concat() {
        assert_eq!(run_ok(r#"var a = "foo"; var b = "bar"; print a + b;"#), "foobar\n");
    }

    #[test]
    fn s3_closures_capture_by_reference() {
        assert_eq!(
            run_ok("fun make(x) { fun inner() { return x; } return inner; } var f = make(42); print f();"),
            "42\n"
        );
    }

    #[test]
    fn s4_method_call() {
        assert_eq!(run_ok(r#"class A { greet() { print "hi"; } } A().greet();"#), "hi\n");
    }

    #[test]
    fn s5_inheritance_and_super() {
        assert_eq!(
            run_ok(
                r#"class Base { m() { print "B"; } } class Derived < Base { m() { print "D"; super.m(); } } Derived().m();"#
            ),
            "D\nB\n"
        );
    }

    #[test]
    fn s6_init_binds_fields() {
        assert_eq!(run_ok(r#"class C { init(x) { this.x = x; } } print C(7).x;"#), "7\n");
    }

    #[test]
    fn error_add_number_and_string() {
        let err = run_err(r#"print 1 + "a";"#);
        assert_eq!(err.message, "Operands must be two numbers or two strings.");
    }

    #[test]
    fn error_superclass_must_be_class() {
        let err = run_err("class A < 1 {}");
        assert_eq!(err.message, "Superclass must be a class.");
    }

    #[test]
    fn error_arity_mismatch() {
        let err = run_err("fun f(a, b) { return a + b; } f(1);");
        assert_eq!(err.message, "Expected 2 arguments but got 1.");
    }

    #[test]
    fn error_undefined_variable() {
        let err = run_err("print nope;");
        assert_eq!(err.message, "Undefined variable 'nope'.");
    }

    #[test]
    fn stack_trace_has_one_entry_per_active_frame() {
        let err = run_err("fun f() { return 1 + \"a\"; } fun g() { return f(); } g();");
        assert_eq!(err.trace.len(), 3);
        assert_eq!(err.trace[0].function_name, "f");
        assert_eq!(err.trace[1].function_name, "g");
        assert_eq!(err.trace[2].function_name, "script");
    }

    #[test]
    fn closures_share_writes_through_the_same_upvalue() {
        assert_eq!(
            run_ok(
                "fun counter() { var n = 0; fun inc() { n = n + 1; return n; } return inc; }\n\
                 var c = counter(); print c(); print c(); print c();"
            ),
            "1\n2\n3\n"
        );
    }

    #[test]
    fn runtime_error_resets_vm_so_next_interpret_still_works() {
        let mut vm = Vm::with_writer(Vec::new(), VmConfig::default(), GcConfig::default());
        assert!(vm.interpret(r#"print 1 + "a";"#).is_err());
        assert!(vm.interpret("print 1 + 2;").is_ok());
        assert_eq!(String::from_utf8(vm.stdout.clone()).unwrap(), "3\n");
    }

    #[test]
    fn globals_and_interning_persist_across_interpret_calls() {
        let mut vm = Vm::with_writer(Vec::new(), VmConfig::default(), GcConfig::default());
        vm.interpret("var counter = 0;").expect("first line compiles and runs");
        vm.interpret("counter = counter + 1; print counter;").expect("second line sees the global");
        assert_eq!(String::from_utf8(vm.stdout.clone()).unwrap(), "1\n");
    }

    #[test]
    fn gc_stress_mode_still_produces_correct_results() {
        let mut vm = Vm::with_writer(Vec::new(), VmConfig::default(), GcConfig { stress: true, log_info: false });
        vm.interpret(
            "class Node { init(v) { this.v = v; } }\n\
             fun build(n) { if (n == 0) return nil; var node = Node(n); return node; }\n\
             var i = 0;\n\
             while (i < 50) { var n = build(i); print n.v; i = i + 1; }",
        )
        .unwrap_or_else(|e| panic!("expected success under GC stress, got: {e}"));
        let out = String::from_utf8(vm.stdout.clone()).unwrap();
        assert_eq!(out.lines().count(), 50);
    }

    #[test]
    fn native_clock_returns_a_number() {
        assert!(run_ok("print clock() >= 0;").trim() == "true");
    }

    #[test]
    fn textual_value_formats() {
        assert_eq!(run_ok("fun f() {} print f;"), "<fn f>\n");
        assert_eq!(run_ok("class C {} print C;"), "C\n");
        assert_eq!(run_ok("class C {} print C();"), "C instance\n");
        assert_eq!(run_ok("print clock;"), "<native fn>\n");
        assert_eq!(run_ok("print nil;"), "nil\n");
        assert_eq!(run_ok("print true;"), "true\n");
    }

    #[test]
    fn top_level_script_function_name_is_bare() {
        let err = run_err(r#"print 1 + "a";"#);
        assert_eq!(err.trace[0].function_name, "script");
    }
}
