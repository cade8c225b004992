//! Brace expansion — a syntactic, pre-evaluation rewrite of one input line.
//!
//! Unlike [`crate::word`], this never touches the filesystem or environment:
//! `{a,b,{c,d}}` and `{m..n}` are expanded purely from the text. Grounded in
//! `examples/original_source/brace_expansion.py`'s recursive grammar, reworked
//! here as a plain recursive-descent scan instead of a parser-combinator
//! grammar (no `pyparsing` equivalent is part of the teacher's stack, and
//! pulling one in for a single adjacent helper would not match it).

/// Expand every `{...}` group in `input`, left to right, depth first.
///
/// Returns `vec![input.to_string()]` unchanged when no (balanced) brace
/// group is present, which also covers deliberately malformed input like an
/// unmatched `{`.
pub fn expand_braces(input: &str) -> Vec<String> {
    match find_first_group(input) {
        None => vec![input.to_string()],
        Some((prefix, body, suffix)) => {
            let middles = expand_body(&body);
            let suffixes = expand_braces(&suffix);
            let mut out = Vec::with_capacity(middles.len() * suffixes.len());
            for m in &middles {
                for s in &suffixes {
                    out.push(format!("{prefix}{m}{s}"));
                }
            }
            out
        }
    }
}

/// Locate the first top-level `{...}` group, returning `(prefix, body, suffix)`
/// with the braces themselves stripped. `None` if there is no `{`, or it is
/// never closed.
fn find_first_group(input: &str) -> Option<(String, String, String)> {
    let chars: Vec<char> = input.chars().collect();
    let start = chars.iter().position(|&c| c == '{')?;

    let mut depth = 1;
    let mut end = start + 1;
    while end < chars.len() {
        match chars[end] {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            _ => {}
        }
        end += 1;
    }
    if depth != 0 {
        return None;
    }

    let prefix: String = chars[..start].iter().collect();
    let body: String = chars[start + 1..end].iter().collect();
    let suffix: String = chars[end + 1..].iter().collect();
    Some((prefix, body, suffix))
}

/// Expand the text between one pair of braces into its alternatives.
fn expand_body(body: &str) -> Vec<String> {
    if top_level_split(body, ',').len() == 1 {
        if let Some(range_values) = try_range(body) {
            return range_values;
        }
    }

    let parts = top_level_split(body, ',');
    if parts.len() == 1 {
        // No comma at this level: not multiple alternatives, just text that
        // may still hold a nested brace group of its own.
        return expand_braces(&parts[0]);
    }
    parts.iter().flat_map(|part| expand_braces(part)).collect()
}

/// `{m..n}` only counts as a range when there is exactly one top-level `..`
/// and both endpoints share the integer or single-character shape.
fn try_range(body: &str) -> Option<Vec<String>> {
    let idx = top_level_find(body, "..")?;
    let left = &body[..idx];
    let right = &body[idx + 2..];

    if let (Some(a), Some(b)) = (as_integer(left), as_integer(right)) {
        return Some(integer_range(a, b));
    }
    if let (Some(a), Some(b)) = (as_single_char(left), as_single_char(right)) {
        return Some(char_range(a, b));
    }
    None
}

fn as_integer(s: &str) -> Option<i64> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn as_single_char(s: &str) -> Option<char> {
    let mut chars = s.chars();
    let c = chars.next()?;
    if chars.next().is_some() || !c.is_ascii_alphabetic() {
        return None;
    }
    Some(c)
}

fn integer_range(start: i64, end: i64) -> Vec<String> {
    if end >= start {
        (start..=end).map(|n| n.to_string()).collect()
    } else {
        (end..=start).rev().map(|n| n.to_string()).collect()
    }
}

fn char_range(start: char, end: char) -> Vec<String> {
    let (s, e) = (start as u32, end as u32);
    if e >= s {
        (s..=e).filter_map(char::from_u32).map(String::from).collect()
    } else {
        (e..=s).rev().filter_map(char::from_u32).map(String::from).collect()
    }
}

/// Split `body` on `sep` at brace depth 0, ignoring separators that fall
/// inside a double-quoted run or a nested `{...}` group.
fn top_level_split(body: &str, sep: char) -> Vec<String> {
    let chars: Vec<char> = body.chars().collect();
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0;
    let mut in_quotes = false;

    for &c in &chars {
        if in_quotes {
            current.push(c);
            if c == '"' {
                in_quotes = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_quotes = true;
                current.push(c);
            }
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth -= 1;
                current.push(c);
            }
            c if c == sep && depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

/// Byte index of the first depth-0, out-of-quotes occurrence of `needle`.
fn top_level_find(body: &str, needle: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let needle_bytes = needle.as_bytes();
    let mut depth = 0;
    let mut in_quotes = false;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if in_quotes {
            if c == b'"' {
                in_quotes = false;
            }
            i += 1;
            continue;
        }
        match c {
            b'"' => in_quotes = true,
            b'{' => depth += 1,
            b'}' => depth -= 1,
            _ => {
                if depth == 0 && body[i..].as_bytes().starts_with(needle_bytes) {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_braces_is_identity() {
        assert_eq!(expand_braces("plain"), vec!["plain"]);
    }

    #[test]
    fn simple_alternatives() {
        assert_eq!(expand_braces("{a,b,c}"), vec!["a", "b", "c"]);
    }

    #[test]
    fn nested_alternatives() {
        assert_eq!(expand_braces("{a,b,{c,d}}"), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn two_groups_cartesian() {
        let got = expand_braces("A{1,2,3}B-C{4,5,6}D").join(" ");
        assert_eq!(got, "A1B-C4D A1B-C5D A1B-C6D A2B-C4D A2B-C5D A2B-C6D A3B-C4D A3B-C5D A3B-C6D");
    }

    #[test]
    fn descending_integer_range() {
        let got = expand_braces("{10..-10}").join(" ");
        assert_eq!(got, "10 9 8 7 6 5 4 3 2 1 0 -1 -2 -3 -4 -5 -6 -7 -8 -9 -10");
    }

    #[test]
    fn mismatched_range_is_literal() {
        assert_eq!(expand_braces("{1..10x}"), vec!["1..10x"]);
    }

    #[test]
    fn single_element_without_dotdot_is_not_a_range() {
        assert_eq!(expand_braces("{x}"), vec!["x"]);
    }

    #[test]
    fn character_range() {
        assert_eq!(expand_braces("{a..e}"), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn character_range_descending() {
        assert_eq!(expand_braces("{e..a}"), vec!["e", "d", "c", "b", "a"]);
    }

    #[test]
    fn unmatched_brace_is_literal() {
        assert_eq!(expand_braces("a{b"), vec!["a{b"]);
    }

    #[test]
    fn empty_alternative() {
        assert_eq!(expand_braces("{a,,b}"), vec!["a", "", "b"]);
    }
}
