//! The clip library: collections of weighted, pre-encoded clips, loaded once
//! at startup and shared read-only afterwards.

use std::{
    collections::{HashMap, HashSet},
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use rand::Rng;
use serde::Deserialize;

use crate::dca::{self, DcaError};

const DEFAULT_TEARDOWN_MS: u64 = 250;

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid catalog definition: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("collection {0} is declared twice")]
    DuplicateCollection(String),

    #[error("collection {collection} declares clip {clip} twice")]
    DuplicateClip { collection: String, clip: String },

    #[error("collection {0} has no clips")]
    EmptyCollection(String),

    #[error("clip {collection}/{clip} must have a positive weight")]
    ZeroWeight { collection: String, clip: String },

    #[error("collection {collection} chains with unknown collection {target}")]
    UnknownChain { collection: String, target: String },
}

#[derive(thiserror::Error, Debug)]
enum AssetError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Dca(#[from] DcaError),
}

#[derive(Debug, Deserialize)]
pub struct CatalogDefinition {
    #[serde(rename = "collection", default)]
    pub collections: Vec<CollectionDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct CollectionDefinition {
    pub id: String,
    #[serde(default)]
    pub chain_with: Option<String>,
    pub clips: Vec<ClipDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct ClipDefinition {
    pub name: String,
    pub weight: u32,
    #[serde(default = "default_teardown_ms")]
    pub teardown_ms: u64,
}

fn default_teardown_ms() -> u64 {
    DEFAULT_TEARDOWN_MS
}

impl CatalogDefinition {
    pub fn from_toml(text: &str) -> Result<Self, CatalogError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let text = fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }
}

pub struct Clip {
    pub collection: Arc<str>,
    pub name: String,
    pub weight: u32,
    /// How long to keep the connection open after this clip ends a session.
    pub teardown: Duration,
    pub frames: Vec<Bytes>,
}

impl Clip {
    /// `<collection>_<name>`, unique across the catalog. Also the asset file stem.
    pub fn key(&self) -> String {
        format!("{}_{}", self.collection, self.name)
    }

    pub fn is_silent(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Debug for Clip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clip")
            .field("collection", &self.collection)
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("teardown", &self.teardown)
            .field("frames", &self.frames.len())
            .finish()
    }
}

#[derive(Debug)]
pub struct Collection {
    pub id: Arc<str>,
    pub clips: Vec<Arc<Clip>>,
    pub chain_with: Option<Arc<str>>,
    total_weight: u64,
}

impl Collection {
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn clip(&self, name: &str) -> Option<&Arc<Clip>> {
        self.clips.iter().find(|clip| clip.name == name)
    }

    /// Picks a clip with probability `weight / total_weight`.
    pub fn pick_weighted<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Arc<Clip>> {
        if self.total_weight == 0 {
            return None;
        }
        self.select(rng.random_range(0..self.total_weight))
    }

    /// Returns the first clip whose cumulative weight exceeds `draw`.
    pub fn select(&self, draw: u64) -> Option<&Arc<Clip>> {
        let mut cumulative = 0u64;
        self.clips.iter().find(|clip| {
            cumulative += u64::from(clip.weight);
            draw < cumulative
        })
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    collections: Vec<Arc<Collection>>,
    index: HashMap<Arc<str>, usize>,
}

impl Catalog {
    /// Loads every clip's frames from `<audio_dir>/<collection>_<clip>.dca`.
    ///
    /// An unreadable asset leaves that clip silent; only an invalid definition
    /// fails the load.
    pub fn load(definition: CatalogDefinition, audio_dir: &Path) -> Result<Self, CatalogError> {
        Self::build(definition, |clip| {
            let path = audio_dir.join(format!("{}.dca", clip.key()));
            let frames = fs::read(&path)
                .map_err(AssetError::from)
                .and_then(|data| Ok(dca::decode(Bytes::from(data))?));
            match frames {
                Ok(frames) => frames,
                Err(err) => {
                    tracing::error!(
                        path = %path.display(),
                        error = %err,
                        "failed to load clip, it will play as silence"
                    );
                    Vec::new()
                }
            }
        })
    }

    /// Builds a catalog whose clips get their frames from `frames_for`.
    pub fn build(
        definition: CatalogDefinition,
        mut frames_for: impl FnMut(&Clip) -> Vec<Bytes>,
    ) -> Result<Self, CatalogError> {
        let mut catalog = Catalog::default();

        for def in definition.collections {
            if catalog.index.contains_key(def.id.as_str()) {
                return Err(CatalogError::DuplicateCollection(def.id));
            }
            if def.clips.is_empty() {
                return Err(CatalogError::EmptyCollection(def.id));
            }

            let id: Arc<str> = Arc::from(def.id.as_str());
            let mut names = HashSet::new();
            let mut clips = Vec::with_capacity(def.clips.len());
            let mut total_weight = 0u64;
            for clip_def in def.clips {
                if clip_def.weight == 0 {
                    return Err(CatalogError::ZeroWeight {
                        collection: def.id,
                        clip: clip_def.name,
                    });
                }
                if !names.insert(clip_def.name.clone()) {
                    return Err(CatalogError::DuplicateClip {
                        collection: def.id,
                        clip: clip_def.name,
                    });
                }

                let mut clip = Clip {
                    collection: id.clone(),
                    name: clip_def.name,
                    weight: clip_def.weight,
                    teardown: Duration::from_millis(clip_def.teardown_ms),
                    frames: Vec::new(),
                };
                clip.frames = frames_for(&clip);
                total_weight += u64::from(clip.weight);
                clips.push(Arc::new(clip));
            }

            catalog.index.insert(id.clone(), catalog.collections.len());
            catalog.collections.push(Arc::new(Collection {
                id,
                clips,
                chain_with: def.chain_with.map(|target| Arc::from(target.as_str())),
                total_weight,
            }));
        }

        for collection in &catalog.collections {
            if let Some(target) = &collection.chain_with {
                if !catalog.index.contains_key(target) {
                    return Err(CatalogError::UnknownChain {
                        collection: collection.id.to_string(),
                        target: target.to_string(),
                    });
                }
            }
        }

        Ok(catalog)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Collection>> {
        self.index.get(id).map(|&i| &self.collections[i])
    }

    pub fn chain_target(&self, collection: &Collection) -> Option<&Arc<Collection>> {
        collection
            .chain_with
            .as_deref()
            .and_then(|target| self.get(target))
    }

    pub fn collections(&self) -> impl Iterator<Item = &Arc<Collection>> {
        self.collections.iter()
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}
