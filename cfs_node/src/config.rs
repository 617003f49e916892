//! Node configuration.

use std::path::Path;

use anyhow::{Context, anyhow};
use cfs_core::{KEY_SIZE, SecretKey};
use serde::{Deserialize, Serialize};

/// Top-level node configuration, usually deserialized from a config
/// file next to which relative paths are resolved.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfsNodeConfig {
    #[serde(default)]
    pub identity: NodeConfigIdentity,
    #[serde(default)]
    pub listen: NodeConfigListen,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfigIdentity {
    /// Hex-encoded secret key, preferred over the file when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// Path to a file holding the secret key, hex or raw bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_file: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfigListen {
    #[serde(default = "default_addr")]
    pub addr: String,
}

impl Default for NodeConfigListen {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

fn default_addr() -> String {
    "127.0.0.1:5646".to_string()
}

/// Loads the node's secret key from the identity section, resolving a
/// relative key file against `config_dir`. Returns `None` when the
/// config carries no identity at all.
pub fn load_secret_key(
    identity: &NodeConfigIdentity,
    config_dir: &Path,
) -> anyhow::Result<Option<SecretKey>> {
    if let Some(hex_key) = &identity.secret_key {
        let bytes = hex::decode(hex_key.trim()).context("identity.secret_key is not valid hex")?;
        return Ok(Some(secret_from_bytes(&bytes)?));
    }

    let Some(file) = &identity.secret_key_file else {
        return Ok(None);
    };
    let path = config_dir.join(file);
    let raw = std::fs::read(&path)
        .with_context(|| format!("could not read secret key file {}", path.display()))?;

    // A key file holds either the raw 32 bytes or their hex encoding.
    if raw.len() == KEY_SIZE {
        return Ok(Some(secret_from_bytes(&raw)?));
    }
    let text = std::str::from_utf8(&raw)
        .map_err(|_| anyhow!("secret key file {} is neither raw nor hex", path.display()))?;
    let bytes = hex::decode(text.trim())
        .with_context(|| format!("secret key file {} is not valid hex", path.display()))?;
    Ok(Some(secret_from_bytes(&bytes)?))
}

fn secret_from_bytes(bytes: &[u8]) -> anyhow::Result<SecretKey> {
    let bytes: [u8; KEY_SIZE] = bytes
        .try_into()
        .map_err(|_| anyhow!("secret key must be {KEY_SIZE} bytes, got {}", bytes.len()))?;
    Ok(SecretKey::new(bytes))
}
