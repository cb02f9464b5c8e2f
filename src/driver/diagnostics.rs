//! Renders a reported error either as colorized text (the default) or as one
//! newline-delimited JSON object per diagnostic (`--json`), per the external
//! interface.

use colored::Colorize;
use serde::Serialize;

use crate::error::MempeekError;

#[derive(Serialize)]
struct Diagnostic {
    severity: &'static str,
    message: String,
    location: String,
}

/// Writes `err` to stderr in the form selected by `json`.
pub fn report(json: bool, err: &MempeekError) {
    if json {
        let diag = Diagnostic {
            severity: "error",
            message: err.to_string(),
            location: err
                .location()
                .map(|l| l.to_string())
                .unwrap_or_else(|| "<control>".to_string()),
        };
        match serde_json::to_string(&diag) {
            Ok(line) => eprintln!("{line}"),
            Err(_) => eprintln!("{}", err),
        }
    } else {
        eprintln!("{}", err.to_string().red());
    }
}
