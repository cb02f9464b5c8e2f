//! The interactive loop. Each line is parsed and executed against a shared
//! `Environment`; `quit` exits the process, `terminate` prints a notice and
//! keeps going, every other error is reported without killing the session.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::rc::Rc;

use colored::Colorize;

use crate::driver::diagnostics;
use crate::environment::Environment;
use crate::error::ControlSignal;
use crate::parser;

pub fn run(env: &Environment, prompt: &str, json: bool) {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("{prompt}");
        let _ = io::stdout().flush();
        let Some(Ok(line)) = lines.next() else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        run_one(env, &line, json);
    }
}

/// Parses and executes one REPL entry, reporting (rather than propagating)
/// every error except `quit`.
pub fn run_one(env: &Environment, source: &str, json: bool) {
    crate::environment::clear_terminate();
    let file = Rc::new(PathBuf::from("<repl>"));
    let tree = match parser::parse(env, source, file) {
        Ok(tree) => tree,
        Err(e) => {
            diagnostics::report(json, &e);
            return;
        }
    };
    match tree.execute(env) {
        Ok(_) => {}
        Err(e) if e.is_control(ControlSignal::Quit) => std::process::exit(0),
        Err(e) if e.is_control(ControlSignal::Terminate) => {
            println!("{}", "terminated".yellow());
        }
        Err(e) if e.is_control(ControlSignal::Break) || e.is_control(ControlSignal::Exit) => {}
        Err(e) => diagnostics::report(json, &e),
    }
}
