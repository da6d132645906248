//! Command parsing and dispatching for smsd.
//!
//! Free-text message bodies are turned into structured commands by a
//! [`CommandParser`] consulting the [`ServiceRegistry`], then executed
//! against a [`CommandService`], with the reply routed back over the
//! transport that carried the original message. The word lexer and glob
//! matcher underneath are exposed for service authors who parse their own
//! argument strings.

pub mod dispatch;
pub mod http;
pub mod pattern;
pub mod prefix;
pub mod registry;
pub mod slash;
pub mod words;

#[cfg(test)]
mod testutil;

pub use dispatch::Dispatcher;
pub use http::HttpService;
pub use pattern::{PatternError, has_meta, pattern_match, validate_pattern};
pub use prefix::{PrefixFn, combine, natural_prefix, slash_prefix, word_prefix};
pub use registry::{
    CommandService, DescriptionError, ResolvedService, ServiceRegistry, validate_description,
};
pub use slash::{CommandParser, SlashParser};
pub use words::{WordsError, pop_all_words, pop_first_word, pop_words};
