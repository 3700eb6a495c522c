//! Dissector registry
//!
//! Dissector implementations are compiled into the agent and listed in a
//! `DissectorCatalog`. At startup the agent reads a directory of manifests,
//! each naming one catalog kind (and optionally overriding its priority),
//! validates every candidate against the dissector contract and builds an
//! immutable `Registry` ordered by ascending priority.
//!
//! Loading is all-or-nothing: one malformed candidate fails the whole load.
//! After construction the registry is shared by cloning (`Arc` inside) and
//! never changes, so pipeline workers read it without locking.

use super::{Confidence, Dissector, DissectorSession, ProtocolDescriptor, RegistrationContext};
use crate::capture::{CapturedConnection, Peer};
use log::{debug, info};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Constructor for a compiled-in dissector
pub type DissectorFactory = fn() -> Arc<dyn Dissector>;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("cannot read dissector directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not a dissector manifest (expected .yaml, .yml or .json)")]
    UnsupportedCandidate { path: PathBuf },

    #[error("invalid dissector manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("{path} names unknown dissector kind {kind:?} (available: {available:?})")]
    UnknownKind {
        path: PathBuf,
        kind: String,
        available: Vec<String>,
    },

    #[error("dissector {candidate} violates the registration contract: {reason}")]
    Contract { candidate: String, reason: String },

    #[error("protocol {name:?} is registered by more than one dissector")]
    Duplicate { name: String },
}

/// Lookup of a protocol no loaded dissector declared
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no dissector registered for protocol {0:?}")]
pub struct NotFound(pub String);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    kind: String,
    #[serde(default)]
    priority: Option<u32>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Compiled-in dissector implementations, keyed by kind
#[derive(Clone, Default)]
pub struct DissectorCatalog {
    factories: BTreeMap<String, DissectorFactory>,
}

impl DissectorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog of every dissector shipped with the agent
    pub fn builtin() -> Self {
        Self::new()
            .with("http", super::http::factory)
            .with("redis", super::redis::factory)
    }

    #[must_use]
    pub fn with(mut self, kind: impl Into<String>, factory: DissectorFactory) -> Self {
        self.factories.insert(kind.into(), factory);
        self
    }

    pub fn kinds(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    fn create(&self, kind: &str) -> Option<Arc<dyn Dissector>> {
        self.factories.get(kind).map(|factory| factory())
    }
}

/// A validated dissector together with its declared descriptor
#[derive(Clone)]
pub struct LoadedDissector {
    descriptor: ProtocolDescriptor,
    dissector: Arc<dyn Dissector>,
}

impl LoadedDissector {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn priority(&self) -> u32 {
        self.descriptor.priority
    }

    pub fn descriptor(&self) -> &ProtocolDescriptor {
        &self.descriptor
    }

    pub fn dissector(&self) -> &Arc<dyn Dissector> {
        &self.dissector
    }

    pub fn can_dissect(&self, peer: Peer, sample: &[u8]) -> Confidence {
        self.dissector.can_dissect(peer, sample)
    }

    pub fn session(&self, connection: &CapturedConnection) -> Box<dyn DissectorSession> {
        self.dissector.session(connection)
    }
}

impl fmt::Debug for LoadedDissector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedDissector")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// Immutable, priority-ordered set of dissectors
#[derive(Clone)]
pub struct Registry {
    ordered: Arc<[LoadedDissector]>,
    by_name: Arc<HashMap<String, usize>>,
}

impl Registry {
    /// Load every manifest in `dir` against `catalog`.
    ///
    /// Hidden files are skipped; any other entry must be a valid manifest.
    pub fn load(dir: &Path, catalog: &DissectorCatalog) -> Result<Self, LoadError> {
        info!("Loading dissectors from {}", dir.display());

        let read_dir = fs::read_dir(dir).map_err(|source| LoadError::Directory {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|source| LoadError::Directory {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(false);
            if !hidden {
                paths.push(path);
            }
        }
        paths.sort();

        let mut loaded = Vec::with_capacity(paths.len());
        for path in paths {
            let manifest = read_manifest(&path)?;

            if !manifest.enabled {
                info!("Skipping disabled dissector manifest {}", path.display());
                continue;
            }

            let dissector =
                catalog
                    .create(&manifest.kind)
                    .ok_or_else(|| LoadError::UnknownKind {
                        path: path.clone(),
                        kind: manifest.kind.clone(),
                        available: catalog.kinds(),
                    })?;

            debug!("Validating dissector {} from {}", manifest.kind, path.display());
            loaded.push(validate(&manifest.kind, dissector, manifest.priority)?);
        }

        Self::build(loaded)
    }

    /// Registry containing every built-in dissector at its declared priority
    pub fn builtin() -> Result<Self, LoadError> {
        let catalog = DissectorCatalog::builtin();
        Self::from_dissectors(
            catalog
                .kinds()
                .iter()
                .filter_map(|kind| catalog.create(kind)),
        )
    }

    /// Build a registry from already constructed dissectors
    pub fn from_dissectors(
        dissectors: impl IntoIterator<Item = Arc<dyn Dissector>>,
    ) -> Result<Self, LoadError> {
        let loaded = dissectors
            .into_iter()
            .enumerate()
            .map(|(i, d)| validate(&format!("#{}", i), d, None))
            .collect::<Result<Vec<_>, _>>()?;
        Self::build(loaded)
    }

    fn build(mut loaded: Vec<LoadedDissector>) -> Result<Self, LoadError> {
        loaded.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.name().cmp(b.name()))
        });

        let mut by_name = HashMap::with_capacity(loaded.len());
        for (index, dissector) in loaded.iter().enumerate() {
            if by_name.insert(dissector.name().to_string(), index).is_some() {
                return Err(LoadError::Duplicate {
                    name: dissector.name().to_string(),
                });
            }
        }

        for dissector in &loaded {
            info!(
                "Dissector loaded: {} ({}), priority {}",
                dissector.name(),
                dissector.descriptor().long_name,
                dissector.priority()
            );
        }

        Ok(Self {
            ordered: loaded.into(),
            by_name: Arc::new(by_name),
        })
    }

    /// Find the dissector declaring `protocol`
    pub fn lookup(&self, protocol: &str) -> Result<&LoadedDissector, NotFound> {
        self.by_name
            .get(protocol)
            .map(|&index| &self.ordered[index])
            .ok_or_else(|| NotFound(protocol.to_string()))
    }

    /// First dissector, in priority order, that accepts the sample
    pub fn classify(&self, peer: Peer, sample: &[u8]) -> Option<&LoadedDissector> {
        self.ordered
            .iter()
            .find(|d| d.can_dissect(peer, sample).accepts())
    }

    /// Dissectors in ascending priority order
    pub fn dissectors(&self) -> &[LoadedDissector] {
        &self.ordered
    }

    pub fn names(&self) -> Vec<&str> {
        self.ordered.iter().map(LoadedDissector::name).collect()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("dissectors", &self.names())
            .finish()
    }
}

fn read_manifest(path: &Path) -> Result<Manifest, LoadError> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    if path.is_dir() || !matches!(extension, "yaml" | "yml" | "json") {
        return Err(LoadError::UnsupportedCandidate {
            path: path.to_path_buf(),
        });
    }

    let contents = fs::read_to_string(path).map_err(|e| LoadError::Manifest {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let parsed = if extension == "json" {
        serde_json::from_str(&contents).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(&contents).map_err(|e| e.to_string())
    };

    parsed.map_err(|reason| LoadError::Manifest {
        path: path.to_path_buf(),
        reason,
    })
}

/// Run `register` once and check the declared descriptor
fn validate(
    candidate: &str,
    dissector: Arc<dyn Dissector>,
    priority_override: Option<u32>,
) -> Result<LoadedDissector, LoadError> {
    let mut ctx = RegistrationContext::new();
    dissector.register(&mut ctx);

    let mut declared = ctx.into_declared();
    let mut descriptor = match declared.len() {
        1 => declared.remove(0),
        0 => {
            return Err(LoadError::Contract {
                candidate: candidate.to_string(),
                reason: "register() declared no protocol".to_string(),
            })
        }
        n => {
            return Err(LoadError::Contract {
                candidate: candidate.to_string(),
                reason: format!("register() declared {} protocols, expected one", n),
            })
        }
    };

    if descriptor.name.trim().is_empty() || descriptor.name.chars().any(char::is_whitespace) {
        return Err(LoadError::Contract {
            candidate: candidate.to_string(),
            reason: format!("invalid protocol name {:?}", descriptor.name),
        });
    }

    if let Some(priority) = priority_override {
        descriptor.priority = priority;
    }

    Ok(LoadedDissector {
        descriptor,
        dissector,
    })
}
