//! Typed access to hash maps pinned on the bpf filesystem by the probes.

use std::{
    io,
    path::{Path, PathBuf},
};

use aya::{
    Pod,
    maps::{HashMap, Map, MapData, MapError as AyaMapError},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MapError {
    #[error("loading pinned map {path}")]
    Pin {
        #[source]
        source: AyaMapError,
        path: PathBuf,
    },
    #[error("map {name} has an unexpected type")]
    Type {
        #[source]
        source: AyaMapError,
        name: String,
    },
    #[error("{operation} on map {name} failed")]
    Operation {
        #[source]
        source: AyaMapError,
        name: String,
        operation: &'static str,
    },
}

/// Kind of the pinned map, needed to rebuild the aya handle from raw map data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Hash,
    LruHash,
}

/// A hash map shared with eBPF programs, keyed and valued by plain byte records.
pub struct PinnedHashMap<K: Pod, V: Pod> {
    name: String,
    map: HashMap<MapData, K, V>,
}

impl<K: Pod, V: Pod> PinnedHashMap<K, V> {
    /// Open the map pinned at `<dir>/<name>`.
    pub fn from_pin(dir: &Path, name: &str, kind: MapKind) -> Result<Self, MapError> {
        let path = dir.join(name);
        let data = MapData::from_pin(&path).map_err(|source| MapError::Pin {
            source,
            path: path.clone(),
        })?;
        let map = match kind {
            MapKind::Hash => Map::HashMap(data),
            MapKind::LruHash => Map::LruHashMap(data),
        };
        let map = HashMap::try_from(map).map_err(|source| MapError::Type {
            source,
            name: name.to_owned(),
        })?;
        Ok(Self {
            name: name.to_owned(),
            map,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lookup a value. A missing key is not an error.
    pub fn lookup(&self, key: &K) -> Result<Option<V>, MapError> {
        match self.map.get(key, 0) {
            Ok(value) => Ok(Some(value)),
            Err(AyaMapError::KeyNotFound) => Ok(None),
            Err(source) => Err(self.operation_error("lookup", source)),
        }
    }

    pub fn insert(&mut self, key: K, value: V) -> Result<(), MapError> {
        self.map
            .insert(key, value, 0)
            .map_err(|source| self.operation_error("insert", source))
    }

    /// Remove a key. Removing a missing key is not an error.
    pub fn remove(&mut self, key: &K) -> Result<(), MapError> {
        match self.map.remove(key) {
            Ok(()) | Err(AyaMapError::KeyNotFound) => Ok(()),
            Err(AyaMapError::SyscallError(err)) if err.io_error.kind() == io::ErrorKind::NotFound => {
                Ok(())
            }
            Err(source) => Err(self.operation_error("remove", source)),
        }
    }

    fn operation_error(&self, operation: &'static str, source: AyaMapError) -> MapError {
        MapError::Operation {
            source,
            name: self.name.clone(),
            operation,
        }
    }
}
