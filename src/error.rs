//! Typed diagnostics for the top of the command loop.
//!
//! Per spec.md §7, every one of these is recovered locally: the REPL prints
//! the diagnostic and reads the next line. Nothing here is fatal to the
//! shell process itself.

use thiserror::Error;

/// A syntax problem found while lexing or parsing a line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("syntax error near unexpected token `{0}'")]
    UnexpectedToken(String),
    #[error("syntax error: expected command after `{0}'")]
    ExpectedCommandAfter(String),
    #[error("syntax error: expected a word after `{op}'")]
    ExpectedWordAfter { op: String },
    #[error("syntax error: empty command")]
    EmptyCommand,
}

/// A problem resolving a redirection while building a process spec.
///
/// The two gap variants are deliberate: spec.md §7/§9 documents both as
/// open questions — "propagate as raw I/O errors today" — rather than
/// defects to paper over with invented recovery behavior.
#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("{path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bad file descriptor: {0}")]
    UnknownFd(i32),
}

/// Top-level shell error, surfaced as a single diagnostic line.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("jsh: {0}")]
    Parse(#[from] ParseError),
    #[error("jsh: {0}")]
    Redirect(#[from] RedirectError),
    #[error("jsh: {0}")]
    Io(#[from] std::io::Error),
}
