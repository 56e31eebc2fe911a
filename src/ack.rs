//! Durable receipts written by consumers, so the publishing process can count them.
//!
//! Each consumer owns `<name>.acks/<consumer>.ack`. A receipt names the generation and
//! checksum it was written for; receipts for any other bundle do not count.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::bundle::Bundle;
use crate::location::{is_valid_tag, ChannelLocation};
use crate::{Error, Result};

const ACK_EXT: &str = "ack";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerAck {
    pub consumer: String,
    pub generation: u64,
    pub checksum: u32,
    pub acked_at_ns: u64,
}

impl ConsumerAck {
    pub fn matches(&self, bundle: &Bundle) -> bool {
        self.generation == bundle.generation() && self.checksum == bundle.checksum()
    }
}

pub fn validate_consumer_name(consumer: &str) -> Result<()> {
    if !is_valid_tag(consumer) {
        return Err(Error::InvalidConsumer(consumer.to_string()));
    }
    Ok(())
}

/// Record that `consumer` retrieved `bundle`. Writing the same receipt again is harmless.
pub fn acknowledge(location: &ChannelLocation, consumer: &str, bundle: &Bundle) -> Result<PathBuf> {
    validate_consumer_name(consumer)?;
    let acks_dir = location.acks_dir();
    std::fs::create_dir_all(&acks_dir)?;

    let ack = ConsumerAck {
        consumer: consumer.to_string(),
        generation: bundle.generation(),
        checksum: bundle.checksum(),
        acked_at_ns: now_ns(),
    };
    let path = acks_dir.join(format!("{consumer}.{ACK_EXT}"));
    let tmp = acks_dir.join(format!(".{consumer}.{}.tmp", std::process::id()));
    let data = serde_json::to_vec(&ack)?;
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    std::fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Every readable receipt for `location`, in consumer order.
pub fn load_acks(location: &ChannelLocation) -> Result<Vec<ConsumerAck>> {
    let acks_dir = location.acks_dir();
    let entries = match std::fs::read_dir(&acks_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut acks = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(ACK_EXT) {
            continue;
        }
        match load_ack(&path) {
            Ok(ack) => acks.push(ack),
            Err(err) => warn!("ignoring unreadable ack {}: {err}", path.display()),
        }
    }
    acks.sort_by(|a, b| a.consumer.cmp(&b.consumer));
    Ok(acks)
}

/// Consumers whose receipt matches `bundle`.
pub fn consumers_of(location: &ChannelLocation, bundle: &Bundle) -> Result<BTreeSet<String>> {
    Ok(load_acks(location)?
        .into_iter()
        .filter(|ack| ack.matches(bundle))
        .map(|ack| ack.consumer)
        .collect())
}

fn load_ack(path: &Path) -> Result<ConsumerAck> {
    let data = std::fs::read(path)?;
    serde_json::from_slice(&data).map_err(|source| Error::CorruptReceipt {
        path: path.to_path_buf(),
        source,
    })
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
