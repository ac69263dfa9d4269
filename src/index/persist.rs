/// On-disk layout of the corpus index.
///
/// `embeddings.bin`: magic `GRE1`, u32 row count, u32 dimension (little endian),
/// then rows * dimension little-endian f32 values.
/// `metadata.json`: `{ content_hash, chunks }`.
/// Both files are written to a temp sibling and renamed into place.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::errors::GroundrankError;
use crate::types::Chunk;

pub const EMBEDDINGS_FILE: &str = "embeddings.bin";
pub const METADATA_FILE: &str = "metadata.json";

const EMBEDDINGS_MAGIC: &[u8; 4] = b"GRE1";
const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub content_hash: String,
    pub chunks: Vec<Chunk>,
}

/// Everything read back from an index directory, before any gating.
#[derive(Debug)]
pub struct PersistedIndex {
    pub metadata: IndexMetadata,
    pub embeddings: Vec<Vec<f32>>,
}

/// Lowercase hex SHA-256 over the chunks sorted by (source_id, chunk_id).
///
/// Each chunk is rendered `source_id|chunk_id|content`, lines joined with `\n`,
/// so the same chunk set in any order hashes identically.
pub fn content_hash<'a>(chunks: impl IntoIterator<Item = &'a Chunk>) -> String {
    let mut sorted: Vec<&Chunk> = chunks.into_iter().collect();
    sorted.sort_by(|a, b| {
        a.source_id
            .cmp(&b.source_id)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });

    let mut hasher = Sha256::new();
    for (i, chunk) in sorted.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\n");
        }
        hasher.update(chunk.source_id.as_bytes());
        hasher.update(b"|");
        hasher.update(chunk.chunk_id.as_bytes());
        hasher.update(b"|");
        hasher.update(chunk.content.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

pub fn encode_embeddings(rows: &[Vec<f32>]) -> Result<Vec<u8>, GroundrankError> {
    let dim = rows.first().map(|r| r.len()).unwrap_or(0);
    if rows.iter().any(|r| r.len() != dim) {
        return Err(GroundrankError::Internal(
            "Embedding rows have inconsistent dimensions".to_string(),
        ));
    }
    let row_count = u32::try_from(rows.len())
        .map_err(|_| GroundrankError::Internal("Too many embedding rows".to_string()))?;
    let dim_u32 = u32::try_from(dim)
        .map_err(|_| GroundrankError::Internal("Embedding dimension too large".to_string()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + rows.len() * dim * 4);
    out.extend_from_slice(EMBEDDINGS_MAGIC);
    out.extend_from_slice(&row_count.to_le_bytes());
    out.extend_from_slice(&dim_u32.to_le_bytes());
    for row in rows {
        for v in row {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    Ok(out)
}

pub fn decode_embeddings(bytes: &[u8]) -> Result<Vec<Vec<f32>>, GroundrankError> {
    let invalid = |message: &str| GroundrankError::validation(EMBEDDINGS_FILE, message);

    if bytes.len() < HEADER_LEN || &bytes[0..4] != EMBEDDINGS_MAGIC {
        return Err(invalid("missing or unknown embeddings header"));
    }
    let rows = read_u32(&bytes[4..8]) as usize;
    let dim = read_u32(&bytes[8..12]) as usize;

    let expected = rows
        .checked_mul(dim)
        .and_then(|n| n.checked_mul(4))
        .and_then(|n| n.checked_add(HEADER_LEN));
    if expected != Some(bytes.len()) {
        return Err(invalid("embeddings file size does not match its header"));
    }

    let values = &bytes[HEADER_LEN..];
    let mut out = Vec::with_capacity(rows);
    for r in 0..rows {
        let row = (0..dim)
            .map(|c| {
                let start = (r * dim + c) * 4;
                f32::from_le_bytes([
                    values[start],
                    values[start + 1],
                    values[start + 2],
                    values[start + 3],
                ])
            })
            .collect();
        out.push(row);
    }
    Ok(out)
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Parse `metadata.json`. Anything but `{content_hash, chunks}` is a validation error.
pub fn decode_metadata(bytes: &[u8]) -> Result<IndexMetadata, GroundrankError> {
    serde_json::from_slice(bytes).map_err(|e| {
        GroundrankError::validation(METADATA_FILE, &format!("unrecognized index metadata: {}", e))
    })
}

/// Read both index files from `dir`. Absent files yield `IndexUnavailable`.
pub async fn load(dir: &Path) -> Result<PersistedIndex, GroundrankError> {
    let embeddings_path = dir.join(EMBEDDINGS_FILE);
    let metadata_path = dir.join(METADATA_FILE);

    if !tokio::fs::try_exists(&embeddings_path).await.unwrap_or(false)
        || !tokio::fs::try_exists(&metadata_path).await.unwrap_or(false)
    {
        return Err(GroundrankError::IndexUnavailable(format!(
            "no persisted index in {}",
            dir.display()
        )));
    }

    let embedding_bytes = tokio::fs::read(&embeddings_path).await?;
    let metadata_bytes = tokio::fs::read(&metadata_path).await?;

    Ok(PersistedIndex {
        metadata: decode_metadata(&metadata_bytes)?,
        embeddings: decode_embeddings(&embedding_bytes)?,
    })
}

/// Persist embeddings first, then metadata.
///
/// Metadata is the commit point: a crash between the two writes leaves a
/// metadata/embeddings pair that fails the length or hash gate on next load.
pub async fn save(
    dir: &Path,
    metadata: &IndexMetadata,
    embeddings: &[Vec<f32>],
) -> Result<(), GroundrankError> {
    tokio::fs::create_dir_all(dir).await?;

    let embedding_bytes = encode_embeddings(embeddings)?;
    write_atomic(&dir.join(EMBEDDINGS_FILE), &embedding_bytes).await?;

    let metadata_bytes = serde_json::to_vec_pretty(metadata)
        .map_err(|e| GroundrankError::Internal(format!("Failed to serialize metadata: {}", e)))?;
    write_atomic(&dir.join(METADATA_FILE), &metadata_bytes).await?;
    Ok(())
}

pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), GroundrankError> {
    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
