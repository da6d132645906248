//! Prefix matchers for routing raw message text.
//!
//! A prefix function decides whether a message body activates a handler and
//! returns the rest of the body with the prefix stripped.

use crate::words::pop_first_word;

/// Returns `Some(rest)` when the message matches, with the prefix removed.
pub type PrefixFn = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Matches the phrase `"{name}, …"`, case-insensitively: e.g.
/// `"Discord, send …"`.
pub fn natural_prefix(name: &str) -> PrefixFn {
    let prefix = format!("{},", name.to_lowercase());
    Box::new(move |msg| {
        let (first, tail) = pop_first_word(msg).ok()?;
        (first.to_lowercase() == prefix).then(|| tail.to_string())
    })
}

/// Matches the phrase `"/{name} …"`, case-sensitively.
pub fn slash_prefix(name: &str) -> PrefixFn {
    let prefix = format!("/{name}");
    Box::new(move |msg| {
        let (first, tail) = pop_first_word(msg).ok()?;
        (first == prefix).then(|| tail.to_string())
    })
}

/// Matches a leading word, optionally case-sensitively.
pub fn word_prefix(word: &str, cased: bool) -> PrefixFn {
    let word = word.to_string();
    Box::new(move |msg| {
        let (first, tail) = pop_first_word(msg).ok()?;
        let matched = if cased {
            first == word
        } else {
            first.eq_ignore_ascii_case(&word)
        };
        matched.then(|| tail.to_string())
    })
}

/// Combines prefixes; the first match wins.
pub fn combine(prefixes: Vec<PrefixFn>) -> PrefixFn {
    Box::new(move |msg| prefixes.iter().find_map(|prefix| prefix(msg)))
}
