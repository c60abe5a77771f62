//! The `compressedNodes` encoding: `base64(gzip(json(nodes)))`.

use crate::core::Nodes;
use crate::errors::{NodeStateError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Encodes nodes into their compressed string form.
pub fn compress_nodes(nodes: &Nodes) -> Result<String> {
    let json = serde_json::to_vec(nodes)?;
    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
    encoder.write_all(&json)?;
    let gzipped = encoder.finish()?;
    Ok(STANDARD.encode(gzipped))
}

/// Decodes nodes from their compressed string form.
pub fn decompress_nodes(encoded: &str) -> Result<Nodes> {
    let gzipped = STANDARD
        .decode(encoded.trim())
        .map_err(|e| NodeStateError::validation(format!("compressed nodes are not base64: {e}")))?;
    let mut json = Vec::new();
    GzDecoder::new(gzipped.as_slice())
        .read_to_end(&mut json)
        .map_err(|e| NodeStateError::validation(format!("compressed nodes are not gzip: {e}")))?;
    Ok(serde_json::from_slice(&json)?)
}
