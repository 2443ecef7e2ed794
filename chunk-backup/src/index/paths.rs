//! Lossless JSON encoding of paths.
//!
//! JSON strings must be UTF-8 but Unix paths are arbitrary bytes. A path
//! that is valid UTF-8 is written as itself; any other path is written as a
//! NUL followed by the hex of its raw bytes. NUL never occurs in a Unix path,
//! so the two forms cannot be confused.

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

const RAW_MARKER: char = '\0';

pub fn encode(path: &Path) -> String {
    match path.to_str() {
        Some(s) => s.to_string(),
        None => format!("{}{}", RAW_MARKER, hex::encode(path.as_os_str().as_bytes())),
    }
}

pub fn decode(encoded: &str) -> Result<PathBuf, hex::FromHexError> {
    match encoded.strip_prefix(RAW_MARKER) {
        Some(raw) => Ok(PathBuf::from(OsString::from_vec(hex::decode(raw)?))),
        None => Ok(PathBuf::from(encoded)),
    }
}

pub fn serialize<S: Serializer>(path: &Path, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&encode(path))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PathBuf, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    decode(&encoded).map_err(de::Error::custom)
}

/// For `Option<PathBuf>` fields
pub mod option {
    use super::*;

    pub fn serialize<S: Serializer>(path: &Option<PathBuf>, serializer: S) -> Result<S::Ok, S::Error> {
        match path {
            Some(path) => serializer.serialize_some(&encode(path)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<PathBuf>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => decode(&encoded).map(Some).map_err(de::Error::custom),
            None => Ok(None),
        }
    }
}

/// For maps keyed by path
pub mod keys {
    use super::*;

    pub fn serialize<S, V>(map: &BTreeMap<PathBuf, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Serialize,
    {
        serializer.collect_map(map.iter().map(|(path, value)| (encode(path), value)))
    }

    pub fn deserialize<'de, D, V>(deserializer: D) -> Result<BTreeMap<PathBuf, V>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de>,
    {
        BTreeMap::<String, V>::deserialize(deserializer)?
            .into_iter()
            .map(|(encoded, value)| {
                decode(&encoded)
                    .map(|path| (path, value))
                    .map_err(de::Error::custom)
            })
            .collect()
    }
}
