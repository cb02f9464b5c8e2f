use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;

use mempeek::driver::cli::Cli;
use mempeek::driver::{diagnostics, logging, repl, signals};
use mempeek::Environment;

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log.as_deref(), cli.json);
    signals::install();

    let mut include_paths = cli.include_paths.clone();
    if let Some(dir) = cli.script.as_ref().and_then(|p| p.parent()) {
        include_paths.push(dir.to_path_buf());
    }

    let env = Environment::new(include_paths);
    env.push_word_size(cli.word_size);
    if let Some(device) = &cli.device {
        env.set_default_device(device.clone());
    }

    match &cli.script {
        Some(path) => run_script(&env, path, cli.json),
        None => repl::run(&env, "mempeek> ", cli.json),
    }
}

fn run_script(env: &Environment, path: &PathBuf, json: bool) {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("mempeek: {}: {e}", path.display());
            std::process::exit(1);
        }
    };
    let file = Rc::new(path.clone());
    let tree = match mempeek::parser::parse(env, &source, file) {
        Ok(tree) => tree,
        Err(e) => {
            diagnostics::report(json, &e);
            std::process::exit(1);
        }
    };
    match tree.execute(env) {
        Ok(_) | Err(mempeek::MempeekError::Control(_)) => {}
        Err(e) => {
            diagnostics::report(json, &e);
            std::process::exit(1);
        }
    }
}
