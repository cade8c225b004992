//! Parsed representation of one input line.
//!
//! A line lexes into a flat token stream (`crate::parser`), which is then
//! folded into the grammar spec.md §4.2 describes:
//!
//! ```text
//! job      := pipeline ('&')?
//! pipeline := command ('|' command)*
//! command  := arg (arg)*
//! arg      := redirect | quoted | bare
//! ```
//!
//! `;`, `&&`, and `||` sequence whole jobs above the pipeline grammar —
//! that layer is [`ChainEntry`]/[`Connector`], evaluated left to right by
//! the shell's REPL loop before any single job is handed to the evaluator.

/// One fragment of a word, tagged with the quoting that produced it.
/// Expansion rules depend on this: unquoted fragments get tilde, variable,
/// and glob expansion; double-quoted fragments get variable expansion only;
/// single-quoted fragments are taken verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum WordSegment {
    Unquoted(String),
    DoubleQuoted(String),
    SingleQuoted(String),
}

/// A word is a run of segments with no intervening whitespace — e.g.
/// `he"llo wor"ld` is one word made of three segments.
pub type Word = Vec<WordSegment>;

/// What a redirected descriptor should be connected to.
#[derive(Debug, Clone, PartialEq)]
pub enum RedirectTarget {
    /// `N<file` / `<file` — open for reading.
    ReadFile(Word),
    /// `N>file` / `>file` — open for writing (truncate).
    WriteFile(Word),
    /// `N>>file` — open for writing (append). Not in spec.md's core
    /// redirection-shape list; carried as an ambient convenience the
    /// teacher already implements (see SPEC_FULL.md §4.2).
    AppendFile(Word),
    /// `N<<<text` — feed a literal string as input. Distinct from a
    /// here-*document*, which spec.md's Non-goals exclude.
    HereString(Word),
    /// `N<&M` / `N>&M` — dup the descriptor currently bound to `M` into `N`.
    DupFd(i32),
}

/// One `arg` production: either a word to append to argv, or a redirection
/// that rewrites a descriptor slot instead of contributing to argv.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Word(Word),
    Redirect { fd: i32, target: RedirectTarget },
}

/// `command := arg (arg)*`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandExp {
    pub args: Vec<Arg>,
}

/// `pipeline := command ('|' command)*`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PipelineExp {
    pub commands: Vec<CommandExp>,
}

/// `job := pipeline ('&')?`
#[derive(Debug, Clone, PartialEq)]
pub struct JobExp {
    pub pipeline: PipelineExp,
    pub background: bool,
}

/// Controls whether a chained job runs based on the previous exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    /// `;` — run unconditionally regardless of the previous exit code.
    Sequence,
    /// `&&` — run only if the previous job succeeded (exit code 0).
    And,
    /// `||` — run only if the previous job failed (exit code != 0).
    Or,
}

/// One job's worth of tokens, annotated with the connector that decides
/// whether it runs given the previous exit code. The first entry in a
/// chain always uses [`Connector::Sequence`].
#[derive(Debug, Clone)]
pub struct ChainEntry {
    pub job: JobExp,
    pub connector: Connector,
    /// The original source text for this job, used for job-control
    /// messages (`[1]+ Stopped  <cmd_text>`).
    pub text: String,
}
