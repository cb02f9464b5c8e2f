//! Structured logging, initialized once at startup. `RUST_LOG` overrides the
//! default filter derived from `-v`, same precedence as the teacher's stack.

use std::fs::OpenOptions;
use std::path::Path;

use tracing_subscriber::EnvFilter;

/// Initializes the global `tracing` subscriber.
///
/// `log_file`, if given, redirects output there instead of stderr; `json`
/// switches the formatter to newline-delimited JSON for scripting.
pub fn init(verbose: bool, log_file: Option<&Path>, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let writer: Box<dyn Fn() -> Box<dyn std::io::Write> + Send + Sync> = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|e| panic!("mempeek: cannot open log file {}: {e}", path.display()));
            let file: &'static std::fs::File = Box::leak(Box::new(file));
            Box::new(move || Box::new(file) as Box<dyn std::io::Write>)
        }
        None => Box::new(|| Box::new(std::io::stderr()) as Box<dyn std::io::Write>),
    };

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        subscriber.json().with_writer(writer).init();
    } else {
        subscriber.with_writer(writer).init();
    }
}
