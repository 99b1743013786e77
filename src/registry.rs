//! Subscription registry: broker destinations derived from handler bindings.
//!
//! Destinations are reference counted by component. The registry returns the
//! session commands a change requires; the runtime forwards them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, info};

use crate::dispatch::Component;
use crate::event::{ChannelKey, Destination, DestinationKind};
use crate::rest::PlatformMetadata;
use crate::stomp::SessionCommand;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Component '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Function '{0}' is not defined on the platform")]
    UnknownFunction(String),

    #[error("Required {target} field '{name}' is not defined on the platform")]
    MissingField { target: FieldTarget, name: String },

    #[error("{target} field '{name}' has input type '{actual}', expected '{expected}'")]
    FieldType {
        target: FieldTarget,
        name: String,
        expected: String,
        actual: String,
    },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldTarget {
    Incident,
    ActionInvocation,
}

impl fmt::Display for FieldTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FieldTarget::Incident => "incident",
            FieldTarget::ActionInvocation => "action",
        })
    }
}

/// A field a component needs the platform to define.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRequirement {
    pub target: FieldTarget,
    pub name: String,
    pub input_type: Option<String>,
}

impl FieldRequirement {
    pub fn new(target: FieldTarget, name: &str, input_type: Option<&str>) -> Self {
        Self {
            target,
            name: name.to_string(),
            input_type: input_type.map(str::to_string),
        }
    }

    fn check(&self, metadata: &PlatformMetadata) -> Result<()> {
        let fields = match self.target {
            FieldTarget::Incident => &metadata.incident_fields,
            FieldTarget::ActionInvocation => &metadata.action_fields,
        };
        let field = fields.get(&self.name).ok_or_else(|| RegistryError::MissingField {
            target: self.target,
            name: self.name.clone(),
        })?;
        match &self.input_type {
            Some(expected) if *expected != field.input_type => Err(RegistryError::FieldType {
                target: self.target,
                name: self.name.clone(),
                expected: expected.clone(),
                actual: field.input_type.clone(),
            }),
            _ => Ok(()),
        }
    }
}

/// Broker destinations for one channel.
pub fn destinations_for(
    channel: &ChannelKey,
    org_id: i64,
    metadata: &PlatformMetadata,
) -> Result<Vec<String>> {
    Ok(match channel {
        ChannelKey::Actions(queue) => {
            vec![Destination::new(DestinationKind::Actions, org_id, queue.as_str()).to_string()]
        }
        ChannelKey::Functions(name) => {
            let queue = metadata
                .function_destinations
                .get(name)
                .ok_or_else(|| RegistryError::UnknownFunction(name.clone()))?;
            vec![Destination::new(DestinationKind::Actions, org_id, queue.as_str()).to_string()]
        }
        ChannelKey::Inbound(queue) => {
            vec![Destination::new(DestinationKind::Inbound, org_id, queue.as_str()).to_string()]
        }
        ChannelKey::LowCode => metadata.low_code_destinations.clone(),
    })
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    org_id: i64,
    /// Destination to the components that need it.
    subscribers: BTreeMap<String, BTreeSet<String>>,
    /// Channels per component, kept to re-derive destinations on reload.
    channels: BTreeMap<String, Vec<ChannelKey>>,
    /// Destinations subscribed on the current broker connection.
    active: BTreeSet<String>,
    connected: bool,
}

impl SubscriptionRegistry {
    pub fn new(org_id: i64) -> Self {
        Self {
            org_id,
            ..Default::default()
        }
    }

    pub fn org_id(&self) -> i64 {
        self.org_id
    }

    fn derive(
        &self,
        channels: &[ChannelKey],
        metadata: &PlatformMetadata,
    ) -> Result<BTreeSet<String>> {
        let mut out = BTreeSet::new();
        for channel in channels {
            out.extend(destinations_for(channel, self.org_id, metadata)?);
        }
        Ok(out)
    }

    fn subscribe(&mut self, destination: &str, commands: &mut Vec<SessionCommand>) {
        if !self.connected {
            return;
        }
        if self.active.insert(destination.to_string()) {
            commands.push(SessionCommand::Subscribe {
                destination: destination.to_string(),
            });
        } else {
            info!(destination = %destination, "Already subscribed");
        }
    }

    /// Add a component's bindings. Nothing changes if validation fails.
    /// Component names are unique; unregister first to replace one.
    pub fn register(
        &mut self,
        component: &Component,
        metadata: &PlatformMetadata,
    ) -> Result<Vec<SessionCommand>> {
        if self.channels.contains_key(component.name()) {
            return Err(RegistryError::AlreadyRegistered(component.name().to_string()));
        }
        for requirement in component.requirements() {
            requirement.check(metadata)?;
        }
        let channels: Vec<ChannelKey> = component.channels().cloned().collect();
        let destinations = self.derive(&channels, metadata)?;

        let name = component.name().to_string();
        self.channels.insert(name.clone(), channels);

        let mut commands = Vec::new();
        for destination in destinations {
            self.subscribers
                .entry(destination.clone())
                .or_default()
                .insert(name.clone());
            self.subscribe(&destination, &mut commands);
        }
        debug!(component = %name, commands = commands.len(), "Component registered");
        Ok(commands)
    }

    /// Remove a component; destinations nobody else needs are unsubscribed.
    pub fn unregister(&mut self, name: &str) -> Vec<SessionCommand> {
        if self.channels.remove(name).is_none() {
            debug!(component = %name, "Component not registered");
            return Vec::new();
        }
        let mut commands = Vec::new();
        self.subscribers.retain(|destination, components| {
            components.remove(name);
            if !components.is_empty() {
                return true;
            }
            if self.active.remove(destination) {
                commands.push(SessionCommand::Unsubscribe {
                    destination: destination.clone(),
                });
            }
            false
        });
        commands
    }

    /// Subscribe everything on a fresh connection.
    pub fn resubscribe_all(&mut self) -> Vec<SessionCommand> {
        self.active.clear();
        self.connected = true;
        let destinations: Vec<String> = self.subscribers.keys().cloned().collect();
        let mut commands = Vec::new();
        for destination in destinations {
            self.subscribe(&destination, &mut commands);
        }
        commands
    }

    pub fn on_disconnected(&mut self) {
        self.connected = false;
        self.active.clear();
    }

    /// Re-derive all destinations after a reload. The registry is left
    /// disconnected; the next connection resubscribes.
    pub fn rebuild(&mut self, org_id: i64, metadata: &PlatformMetadata) -> Result<()> {
        let mut subscribers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        self.org_id = org_id;
        for (name, channels) in &self.channels {
            for destination in self.derive(channels, metadata)? {
                subscribers.entry(destination).or_default().insert(name.clone());
            }
        }
        self.subscribers = subscribers;
        self.on_disconnected();
        Ok(())
    }

    pub fn destinations(&self) -> impl Iterator<Item = &str> {
        self.subscribers.keys().map(String::as_str)
    }

    pub fn is_subscribed(&self, destination: &str) -> bool {
        self.active.contains(destination)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}
