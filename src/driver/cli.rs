//! Command-line surface: a `clap::Parser` struct in the same derive idiom the
//! teacher's own CLI crate uses.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "mempeek",
    author,
    version,
    about = "Interactive interpreter for physical-memory-mapped device registers",
    long_about = None
)]
pub struct Cli {
    /// Run this script non-interactively instead of entering the REPL.
    pub script: Option<PathBuf>,

    /// Device file opened by `map(...)` statements that don't name one.
    #[arg(long, value_name = "PATH")]
    pub device: Option<PathBuf>,

    /// Directory searched for `import "..."` targets (repeatable).
    #[arg(long = "include", value_name = "DIR")]
    pub include_paths: Vec<PathBuf>,

    /// Write logs to this file instead of stderr.
    #[arg(long, value_name = "FILE")]
    pub log: Option<PathBuf>,

    /// Default word size in bits for peek/poke/print when unspecified.
    #[arg(long, default_value_t = 64)]
    pub word_size: u32,

    /// Emit machine-readable JSON instead of human-formatted log lines.
    #[arg(long)]
    pub json: bool,

    /// Emit verbose (debug-level) logs.
    #[arg(short, long, env = "MEMPEEK_VERBOSE")]
    pub verbose: bool,
}
