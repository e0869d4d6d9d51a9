mod manifest;

pub use manifest::{ManifestLoader, PluginManifest};

use crate::contracts::{Assistant, Checker, Input, Output, Provider};
use crate::error::Error;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Which capability contract a plugin implements.
///
/// `Checker` covers the checker/reporter pair: the reporting hook lives on
/// the check plugin itself, so the pair is a single capability tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Provider,
    Checker,
    Output,
    Assistant,
    Input,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Provider => "provider",
            Capability::Checker => "checker",
            Capability::Output => "output",
            Capability::Assistant => "assistant",
            Capability::Input => "input",
        };
        write!(f, "{}", name)
    }
}

/// Checker-specific metadata: the policy document and its description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyMeta {
    /// Path to the policy document this check evaluates.
    pub file: PathBuf,
    /// Textual description of the check, used for the finding record.
    #[serde(default)]
    pub description: String,
}

/// A concrete plugin instance, invoked only through its capability contract.
#[derive(Clone)]
pub enum PluginHandle {
    Provider(Arc<dyn Provider>),
    Checker(Arc<dyn Checker>),
    Output(Arc<dyn Output>),
    Assistant(Arc<dyn Assistant>),
    Input(Arc<dyn Input>),
}

impl PluginHandle {
    pub fn capability(&self) -> Capability {
        match self {
            PluginHandle::Provider(_) => Capability::Provider,
            PluginHandle::Checker(_) => Capability::Checker,
            PluginHandle::Output(_) => Capability::Output,
            PluginHandle::Assistant(_) => Capability::Assistant,
            PluginHandle::Input(_) => Capability::Input,
        }
    }

    pub fn as_provider(&self) -> Option<&Arc<dyn Provider>> {
        match self {
            PluginHandle::Provider(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_checker(&self) -> Option<&Arc<dyn Checker>> {
        match self {
            PluginHandle::Checker(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_output(&self) -> Option<&Arc<dyn Output>> {
        match self {
            PluginHandle::Output(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_assistant(&self) -> Option<&Arc<dyn Assistant>> {
        match self {
            PluginHandle::Assistant(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_input(&self) -> Option<&Arc<dyn Input>> {
        match self {
            PluginHandle::Input(i) => Some(i),
            _ => None,
        }
    }
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PluginHandle({})", self.capability())
    }
}

/// Metadata and instance for one loaded plugin.
///
/// Descriptors are constructed once at load time and never mutated during a
/// run.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub capability: Capability,
    /// Unique within a run.
    pub name: String,
    /// Names of provider plugins this plugin requires as data source.
    pub uses: BTreeSet<String>,
    /// Checker-specific metadata; `None` for other capabilities.
    pub policy: Option<PolicyMeta>,
    pub instance: PluginHandle,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, instance: PluginHandle) -> Self {
        Self {
            capability: instance.capability(),
            name: name.into(),
            uses: BTreeSet::new(),
            policy: None,
            instance,
        }
    }

    pub fn with_uses<I, S>(mut self, uses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.uses = uses.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_policy(mut self, policy: PolicyMeta) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// Name-addressable view of all plugins selected for the current run.
///
/// The registry is sealed at construction; no mutation is exposed after
/// load, which keeps the orchestrator's view of the plugin set stable for
/// the duration of one run. Order of `active` is load order, not execution
/// order.
#[derive(Debug)]
pub struct Registry {
    active: Vec<PluginDescriptor>,
    index: HashMap<String, usize>,
}

impl Registry {
    /// Build a registry from descriptors. Duplicate names are a load error.
    pub fn new(descriptors: Vec<PluginDescriptor>) -> Result<Self> {
        let mut index = HashMap::with_capacity(descriptors.len());
        for (pos, descriptor) in descriptors.iter().enumerate() {
            if index.insert(descriptor.name.clone(), pos).is_some() {
                return Err(Error::Configuration(format!(
                    "duplicate plugin name: {}",
                    descriptor.name
                )));
            }
        }
        debug!("Registry sealed with {} active plugins", descriptors.len());
        Ok(Self {
            active: descriptors,
            index,
        })
    }

    /// All active plugins of a capability, in load order.
    pub fn find(&self, capability: Capability) -> Vec<&PluginDescriptor> {
        self.active
            .iter()
            .filter(|d| d.capability == capability)
            .collect()
    }

    /// Look a plugin up by name.
    pub fn find_by_name(&self, name: &str) -> Result<&PluginDescriptor> {
        self.index
            .get(name)
            .map(|&pos| &self.active[pos])
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Active provider plugins whose name appears in `descriptor.uses`.
    pub fn providers_used_by(&self, descriptor: &PluginDescriptor) -> Vec<&PluginDescriptor> {
        self.active
            .iter()
            .filter(|d| d.capability == Capability::Provider && descriptor.uses.contains(&d.name))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.active.iter()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
