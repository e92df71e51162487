use crate::error::DataError;
use anyhow::{Context, Result};
use serde::{
    de::Error as _, ser::SerializeMap, Deserialize, Deserializer, Serialize, Serializer,
};
use serde_json::ser::PrettyFormatter;
use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

/// Class name to index mapping, index being the position in the sorted class list.
///
/// Serialized as a flat JSON object `{"garbage": 0, "pothole": 1, ...}`, keys in index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    names: Vec<String>,
}

impl Labels {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    fn from_indices(map: HashMap<String, usize>) -> std::result::Result<Self, DataError> {
        let mut names = vec![None; map.len()];
        for (name, index) in map {
            match names.get_mut(index) {
                Some(slot @ None) => *slot = Some(name),
                Some(Some(other)) => {
                    return Err(DataError::InvalidLabels(format!(
                        "index {index} is used by both '{other}' and '{name}'"
                    )))
                }
                None => {
                    return Err(DataError::InvalidLabels(format!(
                        "index {index} of '{name}' is out of range"
                    )))
                }
            }
        }
        // n distinct in-range indices over n slots leave no gap
        Ok(Self {
            names: names.into_iter().flatten().collect(),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open label mapping {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse label mapping {}", path.display()))
    }

    /// Write the mapping with a 4-space indent, overwriting any previous file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = File::create(path)
            .with_context(|| format!("failed to create label mapping {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        let mut ser =
            serde_json::Serializer::with_formatter(&mut writer, PrettyFormatter::with_indent(b"    "));
        self.serialize(&mut ser)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

impl Serialize for Labels {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.names.len()))?;
        for (index, name) in self.names.iter().enumerate() {
            map.serialize_entry(name, &index)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Labels {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let map = HashMap::<String, usize>::deserialize(deserializer)?;
        Labels::from_indices(map).map_err(D::Error::custom)
    }
}
