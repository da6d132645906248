//! Shell-style glob matching with a compiled-pattern cache.
//!
//! Patterns support `*` (any run, shortest match), `?` (any one character),
//! `[...]`/`[!...]` character classes, and backslash escapes. A pattern with
//! no metacharacters compares literally.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

use regex::Regex;

static PATTERN_REGEXES: LazyLock<Mutex<HashMap<String, Regex>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("bad pattern: unterminated character class")]
    UnterminatedClass,
    #[error("bad pattern: trailing backslash")]
    TrailingBackslash,
    #[error("pattern compiled to erroneous regex: {0}")]
    BadRegex(String),
}

/// Whether `pattern` contains any glob metacharacters.
pub fn has_meta(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '\\'])
}

/// Validates `pattern`, compiling and caching its regex if it has
/// metacharacters.
pub fn validate_pattern(pattern: &str) -> Result<(), PatternError> {
    if !has_meta(pattern) {
        return Ok(());
    }
    if PATTERN_REGEXES.lock().unwrap().contains_key(pattern) {
        return Ok(());
    }

    let restr = pattern_to_regex(pattern)?;
    let re = Regex::new(&restr).map_err(|err| PatternError::BadRegex(err.to_string()))?;
    PATTERN_REGEXES
        .lock()
        .unwrap()
        .insert(pattern.to_string(), re);
    Ok(())
}

/// Returns true if `src` matches the shell-like glob `pattern`. Patterns
/// without metacharacters are compared literally.
pub fn pattern_match(src: &str, pattern: &str) -> bool {
    if !has_meta(pattern) {
        return src == pattern;
    }

    if validate_pattern(pattern).is_err() {
        return false;
    }
    let cache = PATTERN_REGEXES.lock().unwrap();
    let re = &cache[pattern];
    re.is_match(src)
}

/// Translates a glob into an anchored regex. `*` compiles to a lazy `.*?`
/// so matches are the shortest possible.
fn pattern_to_regex(pattern: &str) -> Result<String, PatternError> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("(?s)^");

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*?"),
            '?' => out.push('.'),
            '\\' => match chars.next() {
                Some(esc) => push_literal(&mut out, esc),
                None => return Err(PatternError::TrailingBackslash),
            },
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                // A leading ] is part of the class.
                if chars.peek() == Some(&']') {
                    chars.next();
                    out.push_str(r"\]");
                }
                let mut closed = false;
                for inner in chars.by_ref() {
                    match inner {
                        ']' => {
                            closed = true;
                            break;
                        }
                        '\\' => out.push_str(r"\\"),
                        other => out.push(other),
                    }
                }
                if !closed {
                    return Err(PatternError::UnterminatedClass);
                }
                out.push(']');
            }
            other => push_literal(&mut out, other),
        }
    }

    out.push('$');
    Ok(out)
}

fn push_literal(out: &mut String, c: char) {
    if c.is_ascii() && !c.is_ascii_alphanumeric() {
        out.push('\\');
    }
    out.push(c);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_patterns_compare_exactly() {
        assert!(pattern_match("offtopic", "offtopic"));
        assert!(!pattern_match("offtopic", "ontopic"));
        assert!(!pattern_match("Offtopic", "offtopic"));
    }

    #[test]
    fn star_matches_any_run() {
        assert!(pattern_match("offtopic", "off*"));
        assert!(pattern_match("offtopic", "*topic"));
        assert!(pattern_match("anything", "*"));
        assert!(!pattern_match("ontopic", "off*"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        assert!(pattern_match("cat", "c?t"));
        assert!(!pattern_match("cart", "c?t"));
    }

    #[test]
    fn character_classes() {
        assert!(pattern_match("general-3", "general-[0-9]"));
        assert!(!pattern_match("general-x", "general-[0-9]"));
        assert!(pattern_match("general-x", "general-[!0-9]"));
    }

    #[test]
    fn escaped_meta_is_literal() {
        assert!(pattern_match("a*b", r"a\*b"));
        assert!(!pattern_match("axb", r"a\*b"));
    }

    #[test]
    fn star_spans_newlines() {
        assert!(pattern_match("a\nb", "a*b"));
    }

    #[test]
    fn validate_rejects_bad_patterns() {
        assert_eq!(
            validate_pattern("[unterminated"),
            Err(PatternError::UnterminatedClass),
        );
        assert_eq!(
            validate_pattern("trailing\\"),
            Err(PatternError::TrailingBackslash),
        );
        assert!(validate_pattern("fine-*").is_ok());
        assert!(validate_pattern("no meta at all").is_ok());
    }

    #[test]
    fn bad_patterns_never_match() {
        assert!(!pattern_match("[unterminated", "[unterminated"));
    }

    #[test]
    fn validated_patterns_are_cached() {
        validate_pattern("cached-*").unwrap();
        assert!(PATTERN_REGEXES.lock().unwrap().contains_key("cached-*"));
        // Matching reuses the cache entry.
        assert!(pattern_match("cached-yes", "cached-*"));
    }
}
