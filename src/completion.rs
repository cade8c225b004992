//! Completion-helper contract (spec.md §4.9).
//!
//! spec.md scopes an actual completion UI out of the core (no readline/
//! crossterm wiring lives here), but it still names the contract a future
//! front end would call: given the kind of thing being completed and the
//! partial word typed so far, return the sorted, deduplicated set of
//! candidates. This module has no caller inside the shell binary — it
//! exists so that contract has one place to live and be tested, the same
//! role `brace.rs` plays for brace expansion.

use std::path::Path;

/// What's being completed: the first word of a command, or an argument
/// (which completes as a path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    Command,
    Path,
}

/// `complete(context, stem) -> candidates`, sorted and deduplicated.
///
/// `Context::Path` lists directory entries (relative to `cwd`, or the
/// process cwd if `None`) whose name starts with `stem`. `Context::Command`
/// is that same filename completion *merged* with `$PATH`/builtin-name
/// completion (spec.md §4.9: in command position, PATH completion and
/// filename completion are unioned, not either/or — a bare word at the
/// start of a command can just as well name a relative or absolute path to
/// an executable as a `$PATH` entry).
pub fn complete(context: Context, stem: &str, cwd: Option<&Path>) -> Vec<String> {
    let mut candidates = match context {
        Context::Command => {
            let mut found = complete_command(stem);
            found.extend(complete_path(stem, cwd));
            found
        }
        Context::Path => complete_path(stem, cwd),
    };
    candidates.sort();
    candidates.dedup();
    candidates
}

fn complete_command(stem: &str) -> Vec<String> {
    let mut found = Vec::new();

    for name in crate::builtins::NAMES {
        if name.starts_with(stem) {
            found.push((*name).to_string());
        }
    }

    let Some(path_var) = std::env::var_os("PATH") else {
        return found;
    };

    for dir in std::env::split_paths(&path_var) {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(stem) && is_executable(&entry.path()) {
                found.push(name);
            }
        }
    }

    found
}

/// Filename completion. A `~`/`~user`-prefixed stem is expanded for the
/// directory lookup but every candidate is mapped back to tilde form before
/// it's returned (spec.md §4.9: "tilde-prefixed stems are expanded for
/// lookup but the completion is returned in tilde form").
fn complete_path(stem: &str, cwd: Option<&Path>) -> Vec<String> {
    if stem.starts_with('~') {
        return complete_tilde_path(stem);
    }

    let (dir_part, name_part) = split_stem(stem);
    let search_dir = if dir_part.is_empty() {
        cwd.map(Path::to_path_buf).unwrap_or_else(|| Path::new(".").to_path_buf())
    } else if let Some(cwd) = cwd {
        cwd.join(dir_part)
    } else {
        Path::new(dir_part).to_path_buf()
    };

    let prefix = if dir_part.is_empty() { String::new() } else { format!("{dir_part}/") };
    list_names(&search_dir, name_part)
        .into_iter()
        .map(|name| format!("{prefix}{name}"))
        .collect()
}

fn complete_tilde_path(stem: &str) -> Vec<String> {
    let (expanded, reverse) = crate::word::expand_tilde(stem);

    // No '/' after the `~`/`~user` head (e.g. "~" or "~alice"): the typed
    // stem has no partial filename yet, so list every entry of that home
    // directory rather than treating its last path segment as a name filter.
    if !stem[1..].contains('/') {
        return list_names(Path::new(&expanded), "")
            .into_iter()
            .map(|name| reverse(&format!("{expanded}/{name}")))
            .collect();
    }

    let (dir_part, name_part) = split_stem(&expanded);
    list_names(Path::new(dir_part), name_part)
        .into_iter()
        .map(|name| reverse(&format!("{dir_part}/{name}")))
        .collect()
}

fn split_stem(stem: &str) -> (&str, &str) {
    match stem.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", stem),
    }
}

/// Lists `dir`'s entries whose name starts with `name_part`, appending `/`
/// to directories (spec.md §4.9) so a completed directory name is
/// distinguishable from a file of the same name.
fn list_names(dir: &Path, name_part: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else { return Vec::new() };
    entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(name_part) {
                return None;
            }
            if entry.path().is_dir() { Some(format!("{name}/")) } else { Some(name) }
        })
        .collect()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_completion_includes_matching_builtins() {
        let candidates = complete_command("c");
        assert!(candidates.contains(&"cd".to_string()));
    }

    #[test]
    fn path_completion_lists_matching_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alpha.txt"), b"").unwrap();
        std::fs::write(dir.path().join("beta.txt"), b"").unwrap();
        let candidates = complete(Context::Path, "al", Some(dir.path()));
        assert_eq!(candidates, vec!["alpha.txt".to_string()]);
    }

    #[test]
    fn path_completion_with_no_matches_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let candidates = complete(Context::Path, "zzz", Some(dir.path()));
        assert!(candidates.is_empty());
    }

    #[test]
    fn tilde_stem_with_no_home_match_is_empty() {
        // No fixture under the real $HOME matches this stem; the important
        // behavior under test is that a `~`-stem takes the tilde branch at
        // all (no panic, no path-below-cwd leak) rather than falling through
        // to plain relative-path completion.
        let candidates = complete(Context::Path, "~/jsh_completion_definitely_missing_xyz", None);
        assert!(candidates.is_empty());
    }

    #[test]
    fn directory_entries_get_a_trailing_slash() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alpha.txt"), b"").unwrap();
        std::fs::create_dir(dir.path().join("albums")).unwrap();
        let candidates = complete(Context::Path, "al", Some(dir.path()));
        assert_eq!(candidates, vec!["albums/".to_string(), "alpha.txt".to_string()]);
    }

    #[test]
    fn command_position_merges_path_and_filename_completion() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cdtool"), b"").unwrap();
        let candidates = complete(Context::Command, "cd", Some(dir.path()));
        assert!(candidates.contains(&"cd".to_string()));
        assert!(candidates.contains(&"cdtool".to_string()));
    }
}
