//! Command services and the registry that looks them up.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use sms_proto::{CommandDescription, ExecuteRequest, ExecuteResponse, ServiceDescription};
use sms_transport::MessageSubscriber;

/// A pluggable command handler.
///
/// A service executes parsed commands that comply with its own description.
/// It is also a [`MessageSubscriber`]: services may emit messages of their
/// own, which the daemon forwards back out through the transport layer.
#[async_trait]
pub trait CommandService: MessageSubscriber + Send + Sync {
    /// The service name. Constant, and equal to the description's name.
    fn name(&self) -> &str;

    /// The service description. May be recomputed per call.
    async fn service(&self) -> anyhow::Result<ServiceDescription>;

    /// Executes a command and returns what to reply with.
    async fn execute(&self, req: ExecuteRequest) -> anyhow::Result<ExecuteResponse>;
}

/// Why a service description failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptionError {
    #[error("empty command name")]
    EmptyCommandName,
    #[error("command {command:?}: missing argument {argument:?}")]
    MissingArgument { command: String, argument: String },
    #[error("command {command:?}: trailing arguments are not supported")]
    TrailingWithoutPositions { command: String },
}

/// Checks the invariants of a service description: positional names must be
/// declared arguments, trailing requires at least one positional, and
/// command names are non-empty.
pub fn validate_description(desc: &ServiceDescription) -> Result<(), DescriptionError> {
    for cmd in &desc.commands {
        if cmd.name.is_empty() {
            return Err(DescriptionError::EmptyCommandName);
        }

        if !cmd.argument_positions.is_empty() {
            for name in &cmd.argument_positions {
                if !cmd.arguments.contains_key(name) {
                    return Err(DescriptionError::MissingArgument {
                        command: cmd.name.clone(),
                        argument: name.clone(),
                    });
                }
            }
        } else if cmd.argument_trailing {
            return Err(DescriptionError::TrailingWithoutPositions {
                command: cmd.name.clone(),
            });
        }
    }
    Ok(())
}

/// A service with its validated description.
#[derive(Clone)]
pub struct ResolvedService {
    pub service: Arc<dyn CommandService>,
    pub description: ServiceDescription,
}

impl std::fmt::Debug for ResolvedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedService")
            .field("description", &self.description)
            .finish()
    }
}

impl ResolvedService {
    /// Finds a command by name within the description.
    pub fn command(&self, name: &str) -> Option<&CommandDescription> {
        self.description.command(name)
    }
}

/// A concurrent name → service map. Services can be registered and replaced
/// at any time; lookups resolve and validate the current description.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn CommandService>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service, replacing any existing one with the same name.
    pub fn register(&self, service: Arc<dyn CommandService>) {
        self.services
            .write()
            .unwrap()
            .insert(service.name().to_string(), service);
    }

    /// The raw service handle, without resolving its description.
    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandService>> {
        self.services.read().unwrap().get(name).cloned()
    }

    /// Looks up a service and resolves + validates its description.
    /// Unknown names are `Ok(None)`; an invalid description is an error.
    pub async fn lookup(&self, name: &str) -> anyhow::Result<Option<ResolvedService>> {
        let Some(service) = self.get(name) else {
            return Ok(None);
        };
        let description = service.service().await?;
        validate_description(&description)
            .map_err(|err| anyhow::anyhow!("invalid service {name:?} definition: {err}"))?;
        Ok(Some(ResolvedService {
            service,
            description,
        }))
    }

    /// Resolves every registered service. The first resolution or
    /// validation error aborts the iteration.
    pub async fn all_services(&self) -> anyhow::Result<Vec<ResolvedService>> {
        let names: Vec<String> = self.services.read().unwrap().keys().cloned().collect();
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            if let Some(service) = self
                .lookup(&name)
                .await
                .map_err(|err| anyhow::anyhow!("failed to resolve service {name:?}: {err}"))?
            {
                resolved.push(service);
            }
        }
        Ok(resolved)
    }
}
