//! Immutable, versioned set of resource descriptors handed from one process to another.
//!
//! On disk a bundle is a pretty-printed JSON envelope:
//!
//! ```text
//! {"format": 1, "generation": 7, "checksum": 2846155342, "resources": {"server": {"id": "s1"}}}
//! ```
//!
//! A bare JSON object without the envelope keys is also accepted and read as the resource
//! map itself (generation 0), which is what older producers wrote.

use std::collections::BTreeMap;
use std::io::Write;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::Result;

pub const FORMAT_VERSION: u32 = 1;

/// A single resource as the producing side saw it (an object for most resources, a bare
/// string for key pair names).
pub type Descriptor = Value;

/// Bytes that do not decode into a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct MalformedBundle {
    reason: String,
}

impl MalformedBundle {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    generation: u64,
    resources: BTreeMap<String, Descriptor>,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    format: u32,
    generation: u64,
    checksum: u32,
    resources: &'a BTreeMap<String, Descriptor>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope {
    format: u32,
    generation: u64,
    checksum: u32,
    resources: BTreeMap<String, Descriptor>,
}

impl Bundle {
    pub fn new(generation: u64, resources: BTreeMap<String, Descriptor>) -> Self {
        Self {
            generation,
            resources,
        }
    }

    pub fn builder(generation: u64) -> BundleBuilder {
        BundleBuilder {
            generation,
            resources: BTreeMap::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, name: &str) -> Option<&Descriptor> {
        self.resources.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    pub fn resources(&self) -> &BTreeMap<String, Descriptor> {
        &self.resources
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// CRC-32 of the compact encoding of the resource map.
    ///
    /// The map is ordered, so the value depends only on the contents.
    pub fn checksum(&self) -> u32 {
        resources_checksum(&self.resources)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let envelope = EnvelopeRef {
            format: FORMAT_VERSION,
            generation: self.generation,
            checksum: self.checksum(),
            resources: &self.resources,
        };
        let mut data = serde_json::to_vec_pretty(&envelope)?;
        data.push(b'\n');
        Ok(data)
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, MalformedBundle> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|err| MalformedBundle::new(format!("invalid json: {err}")))?;
        let map = match value {
            Value::Object(map) => map,
            other => {
                return Err(MalformedBundle::new(format!(
                    "expected a JSON object, found {}",
                    json_kind(&other)
                )))
            }
        };

        if !(map.contains_key("format") && map.contains_key("resources")) {
            return Ok(Self {
                generation: 0,
                resources: map.into_iter().collect(),
            });
        }

        let envelope: Envelope = serde_json::from_value(Value::Object(map))
            .map_err(|err| MalformedBundle::new(format!("invalid envelope: {err}")))?;
        if envelope.format != FORMAT_VERSION {
            return Err(MalformedBundle::new(format!(
                "unsupported format version {}",
                envelope.format
            )));
        }
        let actual = resources_checksum(&envelope.resources);
        if actual != envelope.checksum {
            return Err(MalformedBundle::new(format!(
                "checksum mismatch: header {:#010x}, contents {actual:#010x}",
                envelope.checksum
            )));
        }
        Ok(Self {
            generation: envelope.generation,
            resources: envelope.resources,
        })
    }
}

pub struct BundleBuilder {
    generation: u64,
    resources: BTreeMap<String, Descriptor>,
}

impl BundleBuilder {
    pub fn resource(mut self, name: impl Into<String>, descriptor: impl Into<Descriptor>) -> Self {
        self.resources.insert(name.into(), descriptor.into());
        self
    }

    pub fn build(self) -> Bundle {
        Bundle::new(self.generation, self.resources)
    }
}

struct CrcWriter(crc32fast::Hasher);

impl Write for CrcWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn resources_checksum(resources: &BTreeMap<String, Descriptor>) -> u32 {
    let mut writer = CrcWriter(crc32fast::Hasher::new());
    // Decode hashes the parsed values, so floats must parse back to the same bits
    // (serde_json `float_roundtrip`).
    // Infallible: the writer never errors and every key is a string.
    let _ = serde_json::to_writer(&mut writer, resources);
    writer.0.finalize()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
