// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2025 Tobias Sarnowski <tobias@sarnowski.cloud>

//! `quillvm` — the command-line entry point for Quill.
//!
//! Zero arguments starts a REPL; one argument runs a source file; two
//! or more is a usage error. This binary is a thin shell around the
//! [`quill`] library: it owns the process (argv, exit codes, REPL line
//! editing) while the library owns compilation and execution.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use quill::{InterpretError, Vm};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("QUILL_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> ExitCode {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => run_repl(),
        [path] => run_file(path),
        _ => {
            eprintln!("Usage: quillvm [path]");
            ExitCode::from(64)
        }
    }
}

fn run_file(path: &str) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Can't open file \"{path}\": {err}");
            return ExitCode::from(74);
        }
    };

    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(70))
        }
    }
}

/// `$XDG_DATA_HOME/quill/history` (or the platform equivalent), created
/// on demand. Returns `None` if the platform has no data directory at
/// all; history is then kept in-memory for the session only.
fn history_path() -> Option<PathBuf> {
    let mut dir = dirs::data_dir()?;
    dir.push("quill");
    fs::create_dir_all(&dir).ok()?;
    dir.push("history");
    Some(dir)
}

fn run_repl() -> ExitCode {
    let mut vm = Vm::new();
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("Can't start line editor: {err}");
            return ExitCode::from(74);
        }
    };

    let history = history_path();
    if let Some(history) = &history {
        let _ignored = editor.load_history(history);
    }

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let _ignored = editor.add_history_entry(line.as_str());
                if let Err(err) = vm.interpret(&line) {
                    report(&err);
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Readline error: {err}");
                break;
            }
        }
    }

    if let Some(history) = &history {
        save_history(&mut editor, history);
    }

    ExitCode::SUCCESS
}

fn save_history(editor: &mut DefaultEditor, history: &Path) {
    if let Err(err) = editor.save_history(history) {
        tracing::warn!(%err, path = %history.display(), "failed to persist REPL history");
    }
}

fn report(err: &InterpretError) {
    match err {
        InterpretError::Compile(errors) => {
            for e in errors {
                eprintln!("{e}");
            }
        }
        InterpretError::Runtime(e) => {
            eprintln!("{e}");
        }
    }
    let _ignored = std::io::stderr().flush();
}
