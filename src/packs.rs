//! Pack registry
//!
//! Packs are loaded once at startup: size and SHA-256 are computed up
//! front, the bytes themselves stay on disk and are read one chunk at a
//! time while a client downloads.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{PackCategory, ProxyConfig};

/// Size of each slice sent to the client
pub const CHUNK_SIZE: u64 = 102_400;

/// Number of chunks needed for `size` bytes
pub fn chunk_count(size: u64) -> u32 {
    size.div_ceil(CHUNK_SIZE) as u32
}

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("Cannot read pack {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown pack {0}")]
    UnknownPack(String),

    #[error("Chunk {index} out of range for pack {id} ({count} chunks)")]
    ChunkOutOfRange { id: String, index: u32, count: u32 },
}

#[derive(Debug, Clone)]
pub enum PackSource {
    File(PathBuf),
    Memory(Bytes),
}

/// One pack as offered to clients.
#[derive(Debug, Clone)]
pub struct Pack {
    pub id: String,
    pub version: String,
    pub category: PackCategory,
    pub size: u64,
    pub sha256: [u8; 32],
    pub content_key: String,
    source: PackSource,
}

impl Pack {
    /// In-memory pack, mostly for tests and generated content
    pub fn from_bytes(id: &str, version: &str, category: PackCategory, data: Bytes) -> Self {
        Self {
            id: id.to_string(),
            version: version.to_string(),
            category,
            size: data.len() as u64,
            sha256: Sha256::digest(&data).into(),
            content_key: String::new(),
            source: PackSource::Memory(data),
        }
    }

    pub fn from_file(path: &Path, id: Option<&str>, version: &str, category: PackCategory) -> Result<Self, AssetError> {
        let io_err = |source| AssetError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut file = File::open(path).map_err(io_err)?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).map_err(io_err)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        let sha256: [u8; 32] = hasher.finalize().into();

        let id = match id {
            Some(id) => id.to_string(),
            None => {
                let mut seed = [0u8; 16];
                seed.copy_from_slice(&sha256[..16]);
                uuid::Builder::from_random_bytes(seed).into_uuid().to_string()
            }
        };

        Ok(Self {
            id,
            version: version.to_string(),
            category,
            size,
            sha256,
            content_key: String::new(),
            source: PackSource::File(path.to_path_buf()),
        })
    }

    pub fn chunk_count(&self) -> u32 {
        chunk_count(self.size)
    }

    /// `uuid_version` form used by the client in requests
    pub fn versioned_id(&self) -> String {
        format!("{}_{}", self.id, self.version)
    }

    /// Read chunk `index`. Length is `min(CHUNK_SIZE, size - offset)`.
    pub fn read_chunk(&self, index: u32) -> Result<Bytes, AssetError> {
        let offset = index as u64 * CHUNK_SIZE;
        if offset >= self.size {
            return Err(AssetError::ChunkOutOfRange {
                id: self.id.clone(),
                index,
                count: self.chunk_count(),
            });
        }
        let len = CHUNK_SIZE.min(self.size - offset) as usize;

        match &self.source {
            PackSource::Memory(data) => Ok(data.slice(offset as usize..offset as usize + len)),
            PackSource::File(path) => {
                let io_err = |source| AssetError::Io {
                    path: path.clone(),
                    source,
                };
                let mut file = File::open(path).map_err(io_err)?;
                file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf).map_err(io_err)?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// Strip a trailing `_version` from a requested pack id
pub fn base_pack_id(requested: &str) -> &str {
    requested.split_once('_').map(|(id, _)| id).unwrap_or(requested)
}

/// Packs chosen for one session, in offer order.
#[derive(Debug, Clone, Default)]
pub struct PackOffer {
    pub resource: Vec<Arc<Pack>>,
    pub behavior: Vec<Arc<Pack>>,
    pub optional: Vec<Arc<Pack>>,
}

impl PackOffer {
    pub fn is_empty(&self) -> bool {
        self.resource.is_empty() && self.behavior.is_empty() && self.optional.is_empty()
    }

    /// Resource, then behavior, then opted-in optional packs
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Pack>> {
        self.resource.iter().chain(self.behavior.iter()).chain(self.optional.iter())
    }

    pub fn find(&self, requested: &str) -> Option<Arc<Pack>> {
        let id = base_pack_id(requested);
        self.iter().find(|p| p.id == id).cloned()
    }
}

/// Every pack the proxy can offer.
#[derive(Debug, Default)]
pub struct PackRegistry {
    packs: Vec<Arc<Pack>>,
    optional: HashMap<u32, Arc<Pack>>,
}

impl PackRegistry {
    pub fn load(config: &ProxyConfig) -> Result<Self, AssetError> {
        let mut registry = Self::default();

        for entry in &config.packs {
            let pack = Pack::from_file(Path::new(&entry.path), entry.id.as_deref(), &entry.version, entry.category)?;
            tracing::info!(
                "[packs] [loaded] id={} version={} size={} category={:?} sha256={}",
                pack.id,
                pack.version,
                pack.size,
                pack.category,
                hex::encode(pack.sha256)
            );
            registry.packs.push(Arc::new(pack));
        }

        if config.optional_packs.enabled {
            for entry in &config.optional_packs.packs {
                let pack = Pack::from_file(Path::new(&entry.path), Some(&entry.id), &entry.version, PackCategory::Resource)?;
                tracing::info!("[packs] [loaded_optional] number={} id={}", entry.number, pack.id);
                registry.optional.insert(entry.number, Arc::new(pack));
            }
        }

        Ok(registry)
    }

    pub fn from_packs(packs: Vec<Pack>) -> Self {
        Self {
            packs: packs.into_iter().map(Arc::new).collect(),
            optional: HashMap::new(),
        }
    }

    pub fn add_optional(&mut self, number: u32, pack: Pack) {
        self.optional.insert(number, Arc::new(pack));
    }

    pub fn len(&self) -> usize {
        self.packs.len() + self.optional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build the per-session offer; unknown optional numbers are skipped.
    pub fn offer_for(&self, optional_numbers: &[u32]) -> PackOffer {
        let mut offer = PackOffer::default();
        for pack in &self.packs {
            match pack.category {
                PackCategory::Resource => offer.resource.push(Arc::clone(pack)),
                PackCategory::Behavior => offer.behavior.push(Arc::clone(pack)),
            }
        }
        for number in optional_numbers {
            match self.optional.get(number) {
                Some(pack) => offer.optional.push(Arc::clone(pack)),
                None => tracing::debug!("[packs] [optional_missing] number={}", number),
            }
        }
        offer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack_of(size: usize) -> Pack {
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        Pack::from_bytes("p1", "1.0.0", PackCategory::Resource, Bytes::from(data))
    }

    #[test]
    fn test_chunk_count_ceil() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE), 1);
        assert_eq!(chunk_count(CHUNK_SIZE + 1), 2);
        assert_eq!(chunk_count(3 * CHUNK_SIZE - 100), 3);
    }

    #[test]
    fn test_slice_lengths() {
        let size = (3 * CHUNK_SIZE - 100) as usize;
        let pack = pack_of(size);
        assert_eq!(pack.chunk_count(), 3);
        assert_eq!(pack.read_chunk(0).unwrap().len() as u64, CHUNK_SIZE);
        assert_eq!(pack.read_chunk(1).unwrap().len() as u64, CHUNK_SIZE);
        assert_eq!(pack.read_chunk(2).unwrap().len() as u64, CHUNK_SIZE - 100);
        assert!(matches!(
            pack.read_chunk(3),
            Err(AssetError::ChunkOutOfRange { index: 3, count: 3, .. })
        ));
    }

    #[test]
    fn test_chunk_content_matches_offset() {
        let pack = pack_of((CHUNK_SIZE + 10) as usize);
        let second = pack.read_chunk(1).unwrap();
        assert_eq!(second.len(), 10);
        assert_eq!(second[0], (CHUNK_SIZE % 251) as u8);
    }

    #[test]
    fn test_file_pack_hash_and_read() {
        let path = std::env::temp_dir().join("crossplay_test_pack.mcpack");
        std::fs::write(&path, vec![7u8; 1000]).unwrap();

        let pack = Pack::from_file(&path, None, "1.0.0", PackCategory::Behavior).unwrap();
        assert_eq!(pack.size, 1000);
        assert_eq!(pack.sha256, <[u8; 32]>::from(Sha256::digest(vec![7u8; 1000])));
        assert!(uuid::Uuid::parse_str(&pack.id).is_ok());
        assert_eq!(pack.read_chunk(0).unwrap().len(), 1000);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_missing_file_is_asset_error() {
        let result = Pack::from_file(Path::new("/nonexistent/pack.mcpack"), None, "1.0.0", PackCategory::Resource);
        assert!(matches!(result, Err(AssetError::Io { .. })));
    }

    #[test]
    fn test_offer_order_and_versioned_lookup() {
        let behavior = Pack::from_bytes("b", "1.0.0", PackCategory::Behavior, Bytes::from_static(b"b"));
        let resource = Pack::from_bytes("r", "2.0.0", PackCategory::Resource, Bytes::from_static(b"r"));
        let mut registry = PackRegistry::from_packs(vec![behavior, resource]);
        registry.add_optional(3, Pack::from_bytes("o", "1.0.0", PackCategory::Resource, Bytes::from_static(b"o")));

        let offer = registry.offer_for(&[3, 9]);
        let order: Vec<&str> = offer.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(order, vec!["r", "b", "o"]);
        assert_eq!(offer.find("r_2.0.0").unwrap().id, "r");
        assert!(offer.find("zzz").is_none());
        assert!(registry.offer_for(&[]).optional.is_empty());
    }
}
