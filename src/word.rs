//! Word expansion: tilde, `$VAR` substitution, and glob.
//!
//! Mirrors the teacher's `expander.rs` pipeline (tilde → variable →
//! glob-if-needed, with quoting deciding which steps a segment gets) but
//! rebuilt against [`crate::ast::WordSegment`] and extended per spec.md
//! §4.1: `~user` forms, a passwd-entry fallback when `$HOME` is unset, and
//! glob expansion relative to an explicit cwd handle rather than the
//! process's ambient working directory.

use std::path::{Path, PathBuf};

use crate::ast::{Word, WordSegment};

/// Expand a full argv's worth of words into final strings (`$?` substitution
/// plus any resulting glob fan-out), matching any `*`/`?` relative to `cwd`
/// (spec.md §4.1: glob is relative to the shell's cwd handle, not the
/// process-wide working directory).
pub fn expand_words(words: &[Word], last_exit_code: i32, cwd: Option<&Path>) -> Vec<String> {
    let mut result = Vec::new();
    for word in words {
        result.extend(expand_word(word, last_exit_code, cwd));
    }
    result
}

fn expand_word(segments: &[WordSegment], last_exit_code: i32, cwd: Option<&Path>) -> Vec<String> {
    let mut combined = String::new();
    let mut globbable = false;

    for segment in segments {
        match segment {
            WordSegment::SingleQuoted(text) => combined.push_str(text),
            WordSegment::DoubleQuoted(text) => {
                combined.push_str(&expand_variables(text, last_exit_code));
            }
            WordSegment::Unquoted(text) => {
                let (expanded, _reverse) = expand_tilde(text);
                let expanded = expand_variables(&expanded, last_exit_code);
                if has_glob_chars(&expanded) {
                    globbable = true;
                }
                combined.push_str(&expanded);
            }
        }
    }

    if globbable {
        glob(&combined, cwd)
    } else {
        vec![combined]
    }
}

/// `~`, `~/rest`, `~user`, `~user/rest`. Returns the expanded string plus a
/// `reverse` closure mapping an absolute path back to `~`-form when it sits
/// under the resolved home directory (identity otherwise), per spec.md §4.1.
pub fn expand_tilde(s: &str) -> (String, impl Fn(&str) -> String) {
    if !s.starts_with('~') {
        let original = s.to_string();
        return (s.to_string(), move |p: &str| {
            let _ = &original;
            p.to_string()
        });
    }

    let (user, rest) = match s[1..].find('/') {
        Some(slash) => (&s[1..1 + slash], &s[1 + slash..]),
        None => (&s[1..], ""),
    };

    let home = if user.is_empty() {
        home_dir_for_env()
    } else {
        home_dir_for_user(user)
    };

    match home {
        Some(home) => {
            let expanded = format!("{home}{rest}");
            let reverse_home = home;
            (expanded, move |p: &str| {
                if let Some(stripped) = p.strip_prefix(&reverse_home) {
                    if stripped.is_empty() {
                        "~".to_string()
                    } else if stripped.starts_with('/') {
                        format!("~{stripped}")
                    } else {
                        p.to_string()
                    }
                } else {
                    p.to_string()
                }
            })
        }
        // Unresolvable `~user` is left untouched, matching the teacher's
        // behavior for forms it doesn't recognize.
        None => {
            let original = s.to_string();
            (s.to_string(), move |p: &str| {
                let _ = &original;
                p.to_string()
            })
        }
    }
}

/// `$HOME`, falling back to the current uid's passwd entry when unset —
/// spec.md §4.1's "fall through to passwd lookup, not an error".
fn home_dir_for_env() -> Option<String> {
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return Some(home);
        }
    }
    passwd_home_dir(current_uid())
}

fn home_dir_for_user(name: &str) -> Option<String> {
    passwd_home_dir_by_name(name)
}

#[cfg(unix)]
fn current_uid() -> u32 {
    // SAFETY: getuid takes no arguments and cannot fail.
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

#[cfg(unix)]
fn passwd_home_dir(uid: u32) -> Option<String> {
    let mut buf = vec![0_i8; 1024];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    loop {
        // SAFETY: `buf` outlives the call and its size is passed exactly.
        let rc = unsafe {
            libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        break;
    }

    if result.is_null() {
        return None;
    }
    // SAFETY: `result` is non-null only when `pwd` was fully populated.
    let dir = unsafe { std::ffi::CStr::from_ptr(pwd.pw_dir) };
    Some(dir.to_string_lossy().into_owned())
}

#[cfg(not(unix))]
fn passwd_home_dir(_uid: u32) -> Option<String> {
    None
}

#[cfg(unix)]
fn passwd_home_dir_by_name(name: &str) -> Option<String> {
    let c_name = std::ffi::CString::new(name).ok()?;
    let mut buf = vec![0_i8; 1024];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    loop {
        // SAFETY: `buf` outlives the call and its size is passed exactly.
        let rc = unsafe {
            libc::getpwnam_r(c_name.as_ptr(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        break;
    }

    if result.is_null() {
        return None;
    }
    // SAFETY: `result` is non-null only when `pwd` was fully populated.
    let dir = unsafe { std::ffi::CStr::from_ptr(pwd.pw_dir) };
    Some(dir.to_string_lossy().into_owned())
}

#[cfg(not(unix))]
fn passwd_home_dir_by_name(_name: &str) -> Option<String> {
    None
}

// ── Variable expansion ──

/// `$VAR`, `${VAR}`, `$?` (last exit code), `$$` (pid), `$0` (shell name).
pub fn expand_variables(input: &str, last_exit_code: i32) -> String {
    let mut result = String::new();
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }

        match chars.peek() {
            None => result.push('$'),
            Some(&'?') => {
                chars.next();
                result.push_str(&last_exit_code.to_string());
            }
            Some(&'$') => {
                chars.next();
                result.push_str(&std::process::id().to_string());
            }
            Some(&'0') => {
                chars.next();
                result.push_str("jsh");
            }
            Some(&'{') => {
                chars.next();
                let name: String = chars.by_ref().take_while(|c| *c != '}').collect();
                if name.is_empty() {
                    result.push_str("${}");
                } else {
                    result.push_str(&std::env::var(&name).unwrap_or_default());
                }
            }
            Some(&c) if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                name.push(chars.next().unwrap());
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(chars.next().unwrap());
                    } else {
                        break;
                    }
                }
                result.push_str(&std::env::var(&name).unwrap_or_default());
            }
            Some(_) => result.push('$'),
        }
    }

    result
}

// ── Glob expansion ──

fn has_glob_chars(s: &str) -> bool {
    s.contains('*') || s.contains('?')
}

/// Expand `pattern` relative to `cwd`. Only triggers on `*`/`?` — bracket
/// classes are a documented gap (spec.md §4.1/§9). Zero matches returns the
/// pattern itself, matching an interactive shell's default. Results sort
/// lexicographically.
pub fn glob(pattern: &str, cwd: Option<&Path>) -> Vec<String> {
    if !has_glob_chars(pattern) {
        return vec![pattern.to_string()];
    }

    let full_pattern: PathBuf = match cwd {
        Some(dir) if !Path::new(pattern).is_absolute() => dir.join(pattern),
        _ => PathBuf::from(pattern),
    };

    let result = match glob::glob(&full_pattern.to_string_lossy()) {
        Ok(paths) => {
            let mut matches: Vec<String> = paths
                .filter_map(|entry| entry.ok())
                .map(|path| relative_to(&path, cwd))
                .collect();
            matches.sort();
            matches
        }
        Err(_) => Vec::new(),
    };

    if result.is_empty() {
        vec![pattern.to_string()]
    } else {
        result
    }
}

fn relative_to(path: &Path, cwd: Option<&Path>) -> String {
    match cwd {
        Some(dir) => path.strip_prefix(dir).unwrap_or(path).to_string_lossy().into_owned(),
        None => path.to_string_lossy().into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tilde_alone_expands_to_home() {
        let (expanded, _) = expand_tilde("~");
        assert!(!expanded.is_empty());
        assert_ne!(expanded, "~");
    }

    #[test]
    fn tilde_with_path() {
        let (expanded, _) = expand_tilde("~/projects");
        assert!(expanded.ends_with("/projects"));
    }

    #[test]
    fn tilde_in_middle_not_expanded() {
        let (expanded, _) = expand_tilde("foo~bar");
        assert_eq!(expanded, "foo~bar");
    }

    #[test]
    fn reverse_maps_home_prefixed_path() {
        let (home, reverse) = expand_tilde("~");
        assert_eq!(reverse(&format!("{home}/docs")), "~/docs");
        assert_eq!(reverse("/totally/unrelated"), "/totally/unrelated");
    }

    #[test]
    fn variable_exit_code() {
        assert_eq!(expand_variables("$?", 42), "42");
    }

    #[test]
    fn variable_braced() {
        unsafe { std::env::set_var("JSH_WORD_TEST", "world") };
        assert_eq!(expand_variables("${JSH_WORD_TEST}!", 0), "world!");
        unsafe { std::env::remove_var("JSH_WORD_TEST") };
    }

    #[test]
    fn variable_undefined_is_empty() {
        assert_eq!(expand_variables("$JSH_DEFINITELY_NOT_SET", 0), "");
    }

    #[test]
    fn trailing_dollar_is_literal() {
        assert_eq!(expand_variables("price$", 0), "price$");
    }

    #[test]
    fn no_glob_matches_keeps_literal() {
        let result = glob("*.definitely_not_a_real_extension_xyz", None);
        assert_eq!(result, vec!["*.definitely_not_a_real_extension_xyz"]);
    }

    #[test]
    fn glob_finds_matches_in_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"").unwrap();
        let mut matches = glob("*.txt", Some(dir.path()));
        matches.sort();
        assert_eq!(matches, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn single_quoted_segment_is_never_expanded() {
        let word = vec![WordSegment::SingleQuoted("$HOME".to_string())];
        assert_eq!(expand_word(&word, 0, None), vec!["$HOME"]);
    }

    #[test]
    fn double_quoted_segment_expands_variables_not_glob() {
        let word = vec![WordSegment::DoubleQuoted("*.rs".to_string())];
        assert_eq!(expand_word(&word, 0, None), vec!["*.rs"]);
    }
}
