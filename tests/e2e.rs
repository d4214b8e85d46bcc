// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2025 Tobias Sarnowski <tobias@sarnowski.cloud>

//! Black-box end-to-end tests: whole Quill programs run through the
//! public [`quill`] API, and the `quillvm` binary driven as a
//! subprocess for the argv/exit-code contract that only the CLI shell
//! (not the library) owns.

use std::io::Write as _;
use std::process::Command;

use quill::{run_source, GcConfig, InterpretError, Vm, VmConfig};

fn run(source: &str) -> (Result<(), InterpretError>, String) {
    let mut vm = Vm::with_writer(Vec::new(), VmConfig::default(), GcConfig::default());
    let result = vm.interpret(source);
    let stdout = String::from_utf8(vm.into_stdout()).expect("utf8 output");
    (result, stdout)
}

#[test]
fn s1_print_arithmetic() {
    let (result, out) = run("print 1 + 2;");
    assert!(result.is_ok());
    assert_eq!(out, "3\n");
}

#[test]
fn s2_string_concatenation() {
    let (result, out) = run(r#"var a = "foo"; var b = "bar"; print a + b;"#);
    assert!(result.is_ok());
    assert_eq!(out, "foobar\n");
}

#[test]
fn s3_closures_capture_enclosing_parameter() {
    let (result, out) = run("fun make(x) { fun inner() { return x; } return inner; } var f = make(42); print f();");
    assert!(result.is_ok());
    assert_eq!(out, "42\n");
}

#[test]
fn s4_method_dispatch() {
    let (result, out) = run(r#"class A { greet() { print "hi"; } } A().greet();"#);
    assert!(result.is_ok());
    assert_eq!(out, "hi\n");
}

#[test]
fn s5_single_inheritance_and_super() {
    let (result, out) = run(
        r#"class Base { m() { print "B"; } } class Derived < Base { m() { print "D"; super.m(); } } Derived().m();"#,
    );
    assert!(result.is_ok());
    assert_eq!(out, "D\nB\n");
}

#[test]
fn s6_initializer_sets_fields_and_returns_receiver() {
    let (result, out) = run(r#"class C { init(x) { this.x = x; } } print C(7).x;"#);
    assert!(result.is_ok());
    assert_eq!(out, "7\n");
}

#[test]
fn error_adding_number_and_string_is_a_runtime_error() {
    let (result, _) = run(r#"print 1 + "a";"#);
    match result {
        Err(InterpretError::Runtime(e)) => assert_eq!(e.message, "Operands must be two numbers or two strings."),
        other => panic!("expected runtime error, got {other:?}"),
    }
}

#[test]
fn error_non_class_superclass_is_a_runtime_error() {
    let (result, _) = run("class A < 1 {}");
    match result {
        Err(InterpretError::Runtime(e)) => assert_eq!(e.message, "Superclass must be a class."),
        other => panic!("expected runtime error, got {other:?}"),
    }
}

#[test]
fn error_wrong_arity_is_a_runtime_error() {
    let (result, _) = run("fun f(a, b) { return a + b; } f(1);");
    assert!(matches!(result, Err(InterpretError::Runtime(_))));
}

#[test]
fn error_reading_undefined_variable_is_a_runtime_error() {
    let (result, _) = run("print nope;");
    assert!(matches!(result, Err(InterpretError::Runtime(_))));
}

#[test]
fn run_source_entry_point_executes_a_whole_program() {
    assert!(run_source("print 1 + 2;").is_ok());
}

#[test]
fn compile_error_surfaces_as_compile_domain_not_runtime() {
    let (result, _) = run("var;");
    assert!(matches!(result, Err(InterpretError::Compile(_))));
}

#[test]
fn classes_and_closures_compose_across_many_instances() {
    let (result, out) = run(
        "class Counter {\n\
           init() { this.n = 0; }\n\
           next() { this.n = this.n + 1; return this.n; }\n\
         }\n\
         var a = Counter();\n\
         var b = Counter();\n\
         print a.next(); print a.next(); print b.next();",
    );
    assert!(result.is_ok());
    assert_eq!(out, "1\n2\n1\n");
}

#[test]
fn for_loop_and_while_loop_agree() {
    let (result, out) = run(
        "var sum = 0;\n\
         for (var i = 0; i < 5; i = i + 1) { sum = sum + i; }\n\
         print sum;\n\
         var total = 0; var j = 0;\n\
         while (j < 5) { total = total + j; j = j + 1; }\n\
         print total;",
    );
    assert!(result.is_ok());
    assert_eq!(out, "10\n10\n");
}

// -- CLI subprocess behaviour (argv/exit-code contract) ------------------

fn quillvm() -> Command {
    Command::new(env!("CARGO_BIN_EXE_quillvm"))
}

#[test]
fn cli_runs_a_script_file_and_exits_zero() {
    let mut file = tempfile::Builder::new().suffix(".quill").tempfile().expect("tempfile");
    writeln!(file, "print 1 + 2;").expect("write script");

    let output = quillvm().arg(file.path()).output().expect("spawn quillvm");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "3\n");
}

#[test]
fn cli_exits_65_on_compile_error() {
    let mut file = tempfile::Builder::new().suffix(".quill").tempfile().expect("tempfile");
    writeln!(file, "var;").expect("write script");

    let output = quillvm().arg(file.path()).output().expect("spawn quillvm");
    assert_eq!(output.status.code(), Some(65));
}

#[test]
fn cli_exits_70_on_runtime_error() {
    let mut file = tempfile::Builder::new().suffix(".quill").tempfile().expect("tempfile");
    writeln!(file, r#"print 1 + "a";"#).expect("write script");

    let output = quillvm().arg(file.path()).output().expect("spawn quillvm");
    assert_eq!(output.status.code(), Some(70));
}

#[test]
fn cli_exits_74_when_the_file_cannot_be_read() {
    let output = quillvm().arg("/nonexistent/path/does/not/exist.quill").output().expect("spawn quillvm");
    assert_eq!(output.status.code(), Some(74));
}

#[test]
fn cli_exits_64_on_too_many_arguments() {
    let output = quillvm().arg("one").arg("two").output().expect("spawn quillvm");
    assert_eq!(output.status.code(), Some(64));
}
