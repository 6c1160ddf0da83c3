//! Catalog of backend constructors keyed by backend-type tag.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::adapters::{
    composite::{self, ChildMap, CompositeAdapter},
    filesystem::{self, FilesystemAdapter},
    gdrive::{self, DriveAdapter},
    github::{self, GithubAdapter},
    AdapterError, KnowledgeAdapter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Filesystem,
    Github,
    GoogleDrive,
    Composite,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Filesystem,
        BackendKind::Github,
        BackendKind::GoogleDrive,
        BackendKind::Composite,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Self::Filesystem => filesystem::TAG,
            Self::Github => github::TAG,
            Self::GoogleDrive => gdrive::TAG,
            Self::Composite => composite::TAG,
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Filesystem => "Files under a local directory",
            Self::Github => "Code, issues and pull requests of a GitHub repository",
            Self::GoogleDrive => "Files in a Google Drive folder",
            Self::Composite => "Several backends searched together",
        }
    }

    fn required_keys(self) -> &'static [&'static str] {
        match self {
            Self::Filesystem => filesystem::REQUIRED_KEYS,
            Self::Github => github::REQUIRED_KEYS,
            Self::GoogleDrive => gdrive::REQUIRED_KEYS,
            Self::Composite => composite::REQUIRED_KEYS,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for BackendKind {
    type Err = ();

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.tag() == tag)
            .ok_or(())
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown backend type '{tag}'; registered types: {}", registered.join(", "))]
    UnknownBackend { tag: String, registered: Vec<String> },
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BackendTypeInfo {
    pub tag: &'static str,
    pub description: &'static str,
    pub required_config_keys: Vec<&'static str>,
}

type Constructor = fn(&AdapterRegistry, &Value) -> Result<Arc<dyn KnowledgeAdapter>, RegistryError>;

/// Populated once at startup and shared read-only afterwards.
pub struct AdapterRegistry {
    constructors: HashMap<BackendKind, Constructor>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("backends", &self.registered_tags())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn with_builtin_backends() -> Self {
        let mut registry = Self::empty();
        registry.register(BackendKind::Filesystem, build_filesystem);
        registry.register(BackendKind::Github, build_github);
        registry.register(BackendKind::GoogleDrive, build_gdrive);
        registry.register(BackendKind::Composite, build_composite);
        registry
    }

    pub fn register(&mut self, kind: BackendKind, constructor: Constructor) {
        self.constructors.insert(kind, constructor);
    }

    /// Sorted tags of every registered backend.
    pub fn registered_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .constructors
            .keys()
            .map(|kind| kind.tag().to_string())
            .collect();
        tags.sort();
        tags
    }

    fn lookup(&self, tag: &str) -> Result<(BackendKind, Constructor), RegistryError> {
        BackendKind::from_str(tag)
            .ok()
            .and_then(|kind| self.constructors.get(&kind).map(|ctor| (kind, *ctor)))
            .ok_or_else(|| RegistryError::UnknownBackend {
                tag: tag.to_string(),
                registered: self.registered_tags(),
            })
    }

    pub fn create(
        &self,
        tag: &str,
        config: &Value,
    ) -> Result<Arc<dyn KnowledgeAdapter>, RegistryError> {
        let (kind, constructor) = self.lookup(tag)?;
        if !config.is_object() {
            return Err(AdapterError::InvalidConfig(format!(
                "configuration for '{kind}' must be a JSON object"
            ))
            .into());
        }
        constructor(self, config)
    }

    pub fn supported_types(&self) -> Vec<BackendTypeInfo> {
        let mut kinds: Vec<BackendKind> = self.constructors.keys().copied().collect();
        kinds.sort_by_key(|kind| kind.tag());
        kinds
            .into_iter()
            .map(|kind| BackendTypeInfo {
                tag: kind.tag(),
                description: kind.description(),
                required_config_keys: kind.required_keys().to_vec(),
            })
            .collect()
    }

    pub fn required_config_keys(&self, tag: &str) -> Result<&'static [&'static str], RegistryError> {
        let (kind, _) = self.lookup(tag)?;
        Ok(kind.required_keys())
    }
}

fn build_filesystem(
    _: &AdapterRegistry,
    config: &Value,
) -> Result<Arc<dyn KnowledgeAdapter>, RegistryError> {
    Ok(Arc::new(FilesystemAdapter::from_config(config)?))
}

fn build_github(
    _: &AdapterRegistry,
    config: &Value,
) -> Result<Arc<dyn KnowledgeAdapter>, RegistryError> {
    Ok(Arc::new(GithubAdapter::from_config(config)?))
}

fn build_gdrive(
    _: &AdapterRegistry,
    config: &Value,
) -> Result<Arc<dyn KnowledgeAdapter>, RegistryError> {
    Ok(Arc::new(DriveAdapter::from_config(config)?))
}

/// Builds every child through the same registry, then wires them in.
fn build_composite(
    registry: &AdapterRegistry,
    config: &Value,
) -> Result<Arc<dyn KnowledgeAdapter>, RegistryError> {
    let mut children = ChildMap::new();
    for (id, backend, child_config) in composite::source_entries(config)? {
        if backend == composite::TAG {
            return Err(AdapterError::InvalidConfig(format!(
                "source '{id}' may not be another composite"
            ))
            .into());
        }
        if children.contains_key(&id) {
            return Err(AdapterError::InvalidConfig(format!("duplicate source id '{id}'")).into());
        }
        let child = registry.create(&backend, &child_config)?;
        children.insert(id, child);
    }

    let mut adapter = CompositeAdapter::new();
    adapter.initialize(children)?;
    Ok(Arc::new(adapter))
}
