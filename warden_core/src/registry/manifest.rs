use super::{Capability, PluginDescriptor, PluginHandle, PolicyMeta};
use crate::error::Error;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Static plugin metadata, read from a TOML manifest at load time.
///
/// ```toml
/// name = "idle_instances"
/// capability = "checker"
/// description = "Finds idle EC2 instances"
/// uses = ["ec2"]
///
/// [policy]
/// file = "idle_instances.rego"
/// description = "Idle EC2 instances"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub capability: Capability,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub uses: Vec<String>,
    /// Required for checkers, ignored for other capabilities.
    pub policy: Option<PolicyMeta>,
}

impl PluginManifest {
    pub fn parse(content: &str) -> Result<Self> {
        let manifest: PluginManifest = toml::from_str(content)
            .map_err(|e| Error::Configuration(format!("failed to parse manifest: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Configuration(format!("failed to read manifest {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Configuration("plugin name cannot be empty".into()));
        }
        if self.capability == Capability::Checker && self.policy.is_none() {
            return Err(Error::Configuration(format!(
                "checker {} declares no policy document",
                self.name
            )));
        }
        Ok(())
    }

    /// Attach a concrete instance and resolve the policy path against the
    /// directory the manifest was read from.
    pub fn into_descriptor(self, instance: PluginHandle, base_dir: &Path) -> Result<PluginDescriptor> {
        if instance.capability() != self.capability {
            return Err(Error::Configuration(format!(
                "plugin {} declares capability {} but its instance implements {}",
                self.name,
                self.capability,
                instance.capability()
            )));
        }
        let policy = self.policy.map(|meta| PolicyMeta {
            file: resolve(base_dir, &meta.file),
            description: meta.description,
        });
        Ok(PluginDescriptor {
            capability: self.capability,
            name: self.name,
            uses: self.uses.into_iter().collect(),
            policy,
            instance,
        })
    }
}

fn resolve(base_dir: &Path, file: &Path) -> PathBuf {
    if file.is_absolute() {
        file.to_path_buf()
    } else {
        base_dir.join(file)
    }
}

/// Reads every `*.toml` manifest out of a plugin directory.
#[derive(Debug)]
pub struct ManifestLoader {
    manifest_dir: PathBuf,
}

impl ManifestLoader {
    pub fn new<P: AsRef<Path>>(manifest_dir: P) -> Self {
        Self {
            manifest_dir: manifest_dir.as_ref().to_path_buf(),
        }
    }

    pub fn manifest_dir(&self) -> &Path {
        &self.manifest_dir
    }

    /// Load all manifests, sorted by file name so load order is stable.
    pub async fn load(&self) -> Result<Vec<PluginManifest>> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.manifest_dir).await.map_err(|e| {
            Error::Configuration(format!(
                "failed to read manifest directory {}: {}",
                self.manifest_dir.display(),
                e
            ))
        })?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("toml") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut manifests = Vec::with_capacity(paths.len());
        for path in paths {
            debug!("Loading plugin manifest {:?}", path);
            manifests.push(PluginManifest::from_file(&path).await?);
        }
        Ok(manifests)
    }
}
