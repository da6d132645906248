//! The slash-command parser: `/service command args...`.

use std::collections::BTreeMap;

use async_trait::async_trait;

use sms_proto::{ArgumentHint, Command, CommandDescription, MessageBody};

use crate::registry::ServiceRegistry;
use crate::words::{pop_all_words, pop_words};

/// Turns a message body into a structured command using a registry.
///
/// A parser must be thread-safe. `Ok(None)` means the body is not this
/// parser's to handle; an error is a user-visible parse failure.
#[async_trait]
pub trait CommandParser: Send + Sync {
    /// The parser name, used internally only.
    fn name(&self) -> &str;

    async fn parse(
        &self,
        registry: &ServiceRegistry,
        body: &MessageBody,
    ) -> anyhow::Result<Option<Command>>;
}

/// Parses bodies of the form `/service command ...` against the registered
/// service's command description.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlashParser;

impl SlashParser {
    pub fn new() -> Self {
        SlashParser
    }
}

#[async_trait]
impl CommandParser for SlashParser {
    fn name(&self) -> &str {
        "slash"
    }

    async fn parse(
        &self,
        registry: &ServiceRegistry,
        body: &MessageBody,
    ) -> anyhow::Result<Option<Command>> {
        let Some(text) = body.as_text() else {
            return Ok(None);
        };
        if !text.trim_start().starts_with('/') {
            return Ok(None);
        }

        let (starting_words, rest) = pop_words(text, 2)
            .map_err(|err| anyhow::anyhow!("failed to parse command start: {err}"))?;
        let service_name = &starting_words[0][1..];
        let command_name = &starting_words[1];

        let resolved = registry
            .lookup(service_name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown service {service_name:?}"))?;
        let command = resolved.command(command_name).ok_or_else(|| {
            anyhow::anyhow!("unknown command {command_name:?} for service {service_name:?}")
        })?;

        let arguments = parse_arguments(command, rest)
            .map_err(|err| anyhow::anyhow!("failed to parse command {:?}: {err}", command.name))?;

        Ok(Some(Command {
            service: resolved.description.name.clone(),
            command: command.name.clone(),
            arguments,
        }))
    }
}

fn parse_arguments(
    command: &CommandDescription,
    args: &str,
) -> anyhow::Result<BTreeMap<String, String>> {
    let mut bound = BTreeMap::new();

    if !command.argument_positions.is_empty() {
        // Positional arguments are required up front; the trailing one, if
        // any, swallows the rest of the message verbatim.
        let mut positional = command.argument_positions.as_slice();
        if command.argument_trailing {
            positional = &positional[..positional.len() - 1];
        }

        let (words, rest) = pop_words(args, positional.len())
            .map_err(|err| anyhow::anyhow!("failed to split positional arguments: {err}"))?;

        for (name, value) in positional.iter().zip(words) {
            let hint = command.arguments[name].hint;
            assert_hinted_value(&value, hint)
                .map_err(|err| anyhow::anyhow!("invalid value {value:?} for argument {name:?}: {err}"))?;
            bound.insert(name.clone(), value);
        }

        if command.argument_trailing {
            let name = command.argument_positions.last().unwrap();
            let hint = command.arguments[name].hint;
            assert_hinted_value(rest, hint)
                .map_err(|err| anyhow::anyhow!("invalid value {rest:?} for argument {name:?}: {err}"))?;
            bound.insert(name.clone(), rest.to_string());
        }
    } else {
        // Named mode: every word is key=value.
        let words = pop_all_words(args)
            .map_err(|err| anyhow::anyhow!("failed to split named arguments: {err}"))?;

        for word in words {
            let Some((key, value)) = word.split_once('=') else {
                anyhow::bail!("invalid named argument {word:?}, expected x=y syntax");
            };
            if bound.contains_key(key) {
                anyhow::bail!("duplicate argument {key:?}");
            }
            let Some(desc) = command.arguments.get(key) else {
                anyhow::bail!("unknown argument {key:?} for command {:?}", command.name);
            };
            assert_hinted_value(value, desc.hint)
                .map_err(|err| anyhow::anyhow!("invalid value {value:?} for argument {key:?}: {err}"))?;
            bound.insert(key.to_string(), value.to_string());
        }
    }

    // Every required argument must have a non-empty binding.
    for (name, desc) in &command.arguments {
        if desc.required && bound.get(name).is_none_or(String::is_empty) {
            anyhow::bail!("missing required argument \"{name}\"");
        }
    }

    Ok(bound)
}

fn assert_hinted_value(value: &str, hint: ArgumentHint) -> anyhow::Result<()> {
    if hint != ArgumentHint::Unspecified && value.is_empty() {
        anyhow::bail!("value is required");
    }

    match hint {
        ArgumentHint::Unspecified => Ok(()),
        ArgumentHint::Integer => {
            value
                .parse::<i64>()
                .map_err(|err| anyhow::anyhow!("not an integer: {err}"))?;
            Ok(())
        }
        ArgumentHint::Number => {
            let number = value
                .parse::<f64>()
                .map_err(|err| anyhow::anyhow!("not a number: {err}"))?;
            if !number.is_finite() {
                anyhow::bail!("not a finite number");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::StaticService;
    use sms_proto::{ArgumentDescription, ServiceDescription};

    fn discord_send(positions: &[&str], trailing: bool) -> ServiceDescription {
        let arguments = ["guild", "channel", "message"]
            .into_iter()
            .map(|name| {
                (
                    name.to_string(),
                    ArgumentDescription {
                        required: true,
                        hint: ArgumentHint::Unspecified,
                    },
                )
            })
            .collect();
        ServiceDescription {
            name: "discord".to_string(),
            commands: vec![CommandDescription {
                name: "send".to_string(),
                arguments,
                argument_positions: positions.iter().map(|s| s.to_string()).collect(),
                argument_trailing: trailing,
            }],
        }
    }

    fn registry_with(desc: ServiceDescription) -> ServiceRegistry {
        let registry = ServiceRegistry::new();
        registry.register(StaticService::new(desc));
        registry
    }

    async fn parse(registry: &ServiceRegistry, body: &str) -> anyhow::Result<Option<Command>> {
        SlashParser::new()
            .parse(registry, &MessageBody::text(body))
            .await
    }

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn parses_positional_arguments() {
        let registry =
            registry_with(discord_send(&["guild", "channel", "message"], true));
        let command = parse(
            &registry,
            "/discord send DiscordGophers offtopic Hello, world!",
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(command.service, "discord");
        assert_eq!(command.command, "send");
        assert_eq!(
            command.arguments,
            args(&[
                ("guild", "DiscordGophers"),
                ("channel", "offtopic"),
                ("message", "Hello, world!"),
            ]),
        );
    }

    #[tokio::test]
    async fn trailing_argument_keeps_interior_whitespace() {
        let registry =
            registry_with(discord_send(&["guild", "channel", "message"], true));
        let command = parse(
            &registry,
            "/discord send DiscordGophers offtopic Hello,\n\n world!  ",
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(
            command.argument("message"),
            Some("Hello,\n\n world!"),
        );
    }

    #[tokio::test]
    async fn parses_named_arguments() {
        let registry = registry_with(discord_send(&[], false));
        let body = "/discord send guild=DiscordGophers \"chan\"nel=offtopic message=\"Hello,\n\nworld!\"";
        let command = parse(&registry, body).await.unwrap().unwrap();

        assert_eq!(
            command.arguments,
            args(&[
                ("guild", "DiscordGophers"),
                ("channel", "offtopic"),
                ("message", "Hello,\n\nworld!"),
            ]),
        );
    }

    #[tokio::test]
    async fn named_arguments_are_order_independent() {
        let registry = registry_with(discord_send(&[], false));
        let first = parse(
            &registry,
            "/discord send guild=G channel=C message=M",
        )
        .await
        .unwrap()
        .unwrap();
        let second = parse(
            &registry,
            "/discord send message=M guild=G channel=C",
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn missing_required_argument() {
        let registry = registry_with(discord_send(&[], false));
        let err = parse(&registry, "/discord send guild=G channel=C")
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("missing required argument \"message\""),
            "{err}",
        );
    }

    #[tokio::test]
    async fn duplicate_named_argument() {
        let registry = registry_with(discord_send(&[], false));
        let err = parse(&registry, "/discord send guild=G guild=H")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("duplicate argument"), "{err}");
    }

    #[tokio::test]
    async fn unknown_named_argument() {
        let registry = registry_with(discord_send(&[], false));
        let err = parse(&registry, "/discord send nope=G")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown argument"), "{err}");
    }

    #[tokio::test]
    async fn named_argument_requires_equals() {
        let registry = registry_with(discord_send(&[], false));
        let err = parse(&registry, "/discord send justaword")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected x=y syntax"), "{err}");
    }

    #[tokio::test]
    async fn unknown_service_and_command() {
        let registry = registry_with(discord_send(&[], false));

        let err = parse(&registry, "/matrix send a=b").await.unwrap_err();
        assert!(err.to_string().contains("unknown service"), "{err}");

        let err = parse(&registry, "/discord mute a=b").await.unwrap_err();
        assert!(err.to_string().contains("unknown command"), "{err}");
    }

    #[tokio::test]
    async fn non_slash_bodies_are_not_ours() {
        let registry = registry_with(discord_send(&[], false));
        assert!(parse(&registry, "hello there").await.unwrap().is_none());
        assert!(parse(&registry, "").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn integer_and_number_hints() {
        let arguments = [
            ("count", ArgumentHint::Integer),
            ("ratio", ArgumentHint::Number),
        ]
        .into_iter()
        .map(|(name, hint)| {
            (
                name.to_string(),
                ArgumentDescription {
                    required: false,
                    hint,
                },
            )
        })
        .collect();
        let registry = registry_with(ServiceDescription {
            name: "poll".to_string(),
            commands: vec![CommandDescription {
                name: "set".to_string(),
                arguments,
                ..Default::default()
            }],
        });

        parse(&registry, "/poll set count=42 ratio=0.5")
            .await
            .unwrap()
            .unwrap();
        parse(&registry, "/poll set count=-7").await.unwrap().unwrap();

        let err = parse(&registry, "/poll set count=4.2").await.unwrap_err();
        assert!(err.to_string().contains("invalid value"), "{err}");

        let err = parse(&registry, "/poll set ratio=abc").await.unwrap_err();
        assert!(err.to_string().contains("invalid value"), "{err}");

        let err = parse(&registry, "/poll set ratio=inf").await.unwrap_err();
        assert!(err.to_string().contains("invalid value"), "{err}");
    }
}
