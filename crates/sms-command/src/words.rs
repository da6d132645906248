//! Shell-style word scanning.
//!
//! Message bodies are split into words with POSIX shell quoting rules:
//! whitespace separates words, single quotes preserve everything, double
//! quotes preserve whitespace while honoring backslash escapes, and a bare
//! backslash escapes the next character. Scanning returns the literal value
//! of each word (quotes removed, escapes applied) together with the
//! remaining unscanned text, so trailing arguments keep their internal
//! whitespace verbatim.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WordsError {
    #[error("unterminated quote")]
    UnterminatedQuote,
    #[error("expected {want} words, got {got}")]
    NotEnoughWords { want: usize, got: usize },
}

/// Pops exactly `n` words off the front of `s`, returning them with the
/// remaining text (trimmed of surrounding whitespace). Fewer than `n` words
/// is an error.
pub fn pop_words(s: &str, n: usize) -> Result<(Vec<String>, &str), WordsError> {
    let mut scanner = WordScanner::new(s);
    let mut words = Vec::with_capacity(n);
    for _ in 0..n {
        match scanner.next_word()? {
            Some(word) => words.push(word),
            None => {
                return Err(WordsError::NotEnoughWords {
                    want: n,
                    got: words.len(),
                });
            }
        }
    }
    Ok((words, scanner.tail()))
}

/// Scans every word in `s`. The tail is by definition empty.
pub fn pop_all_words(s: &str) -> Result<Vec<String>, WordsError> {
    let mut scanner = WordScanner::new(s);
    let mut words = Vec::new();
    while let Some(word) = scanner.next_word()? {
        words.push(word);
    }
    Ok(words)
}

/// Pops the first word, returning it with the remaining text.
pub fn pop_first_word(s: &str) -> Result<(String, &str), WordsError> {
    let (mut words, tail) = pop_words(s, 1)?;
    Ok((words.pop().unwrap(), tail))
}

struct WordScanner<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> WordScanner<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    /// The unscanned remainder, trimmed.
    fn tail(&self) -> &'a str {
        self.src[self.pos..].trim()
    }

    fn next_word(&mut self) -> Result<Option<String>, WordsError> {
        let mut chars = self.src[self.pos..].char_indices().peekable();

        // Skip leading whitespace.
        let start = loop {
            match chars.peek() {
                Some(&(i, c)) if !c.is_whitespace() => break self.pos + i,
                Some(_) => {
                    chars.next();
                }
                None => {
                    self.pos = self.src.len();
                    return Ok(None);
                }
            }
        };

        let mut word = String::new();
        let mut chars = self.src[start..].char_indices();
        let mut end = self.src.len();

        while let Some((i, c)) = chars.next() {
            match c {
                c if c.is_whitespace() => {
                    end = start + i;
                    break;
                }
                '\'' => loop {
                    match chars.next() {
                        Some((_, '\'')) => break,
                        Some((_, inner)) => word.push(inner),
                        None => return Err(WordsError::UnterminatedQuote),
                    }
                },
                '"' => loop {
                    match chars.next() {
                        Some((_, '"')) => break,
                        Some((_, '\\')) => match chars.next() {
                            // Inside double quotes a backslash only escapes
                            // these; otherwise it stays literal.
                            Some((_, esc @ ('"' | '\\' | '$' | '`'))) => word.push(esc),
                            Some((_, '\n')) => {} // line continuation
                            Some((_, other)) => {
                                word.push('\\');
                                word.push(other);
                            }
                            None => return Err(WordsError::UnterminatedQuote),
                        },
                        Some((_, inner)) => word.push(inner),
                        None => return Err(WordsError::UnterminatedQuote),
                    }
                },
                '\\' => match chars.next() {
                    Some((_, '\n')) => {} // line continuation
                    Some((_, esc)) => word.push(esc),
                    None => {} // trailing backslash, drop it
                },
                c => word.push(c),
            }
        }
        if end == self.src.len() {
            // Consumed to the end without hitting whitespace.
            self.pos = self.src.len();
        } else {
            self.pos = end;
        }

        Ok(Some(word))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_simple_words() {
        let (words, tail) = pop_words("/discord send DiscordGophers offtopic", 2).unwrap();
        assert_eq!(words, ["/discord", "send"]);
        assert_eq!(tail, "DiscordGophers offtopic");
    }

    #[test]
    fn tail_preserves_interior_whitespace() {
        let (words, tail) =
            pop_words("send DiscordGophers offtopic Hello,\n\n world!  ", 3).unwrap();
        assert_eq!(words, ["send", "DiscordGophers", "offtopic"]);
        assert_eq!(tail, "Hello,\n\n world!");
    }

    #[test]
    fn double_quotes_preserve_whitespace() {
        let (words, tail) = pop_words(r#""hello world" next"#, 1).unwrap();
        assert_eq!(words, ["hello world"]);
        assert_eq!(tail, "next");
    }

    #[test]
    fn single_quotes_are_literal() {
        let words = pop_all_words(r#"'a "b" \n c'"#).unwrap();
        assert_eq!(words, [r#"a "b" \n c"#]);
    }

    #[test]
    fn quotes_join_with_adjacent_text() {
        let words = pop_all_words(r#""chan"nel=offtopic"#).unwrap();
        assert_eq!(words, ["channel=offtopic"]);
    }

    #[test]
    fn double_quote_escapes() {
        let words = pop_all_words(r#""say \"hi\" \$HOME \x""#).unwrap();
        assert_eq!(words, [r#"say "hi" $HOME \x"#]);
    }

    #[test]
    fn bare_backslash_escapes_next_char() {
        let words = pop_all_words(r"hello\ world").unwrap();
        assert_eq!(words, ["hello world"]);
    }

    #[test]
    fn newlines_inside_quotes_survive() {
        let words = pop_all_words("message=\"Hello,\n\nworld!\"").unwrap();
        assert_eq!(words, ["message=Hello,\n\nworld!"]);
    }

    #[test]
    fn pop_all_words_consumes_everything() {
        let words = pop_all_words("  a b\tc\nd  ").unwrap();
        assert_eq!(words, ["a", "b", "c", "d"]);
    }

    #[test]
    fn not_enough_words() {
        assert_eq!(
            pop_words("only two", 3),
            Err(WordsError::NotEnoughWords { want: 3, got: 2 }),
        );
        assert_eq!(
            pop_words("   ", 1),
            Err(WordsError::NotEnoughWords { want: 1, got: 0 }),
        );
    }

    #[test]
    fn zero_words_returns_trimmed_input() {
        let (words, tail) = pop_words("  hello world  ", 0).unwrap();
        assert!(words.is_empty());
        assert_eq!(tail, "hello world");
    }

    #[test]
    fn unterminated_quotes_error() {
        assert_eq!(pop_all_words("\"open"), Err(WordsError::UnterminatedQuote));
        assert_eq!(pop_all_words("'open"), Err(WordsError::UnterminatedQuote));
    }

    #[test]
    fn pop_first_word() {
        let (first, tail) = super::pop_first_word("discord, send hello").unwrap();
        assert_eq!(first, "discord,");
        assert_eq!(tail, "send hello");
    }
}
