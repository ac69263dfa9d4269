/// Ingestion boundary: turning upstream document output into corpus chunks.
///
/// A `ChunkSource` exposes named units (documents or pages). Units are loaded
/// one at a time under a per-unit timeout; a unit that times out or fails is
/// skipped and reported, never fatal to the whole collection.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::GroundrankError;
use crate::types::{Chunk, SourceType};

#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Ids of every unit this source can load, in load order.
    async fn units(&self) -> Result<Vec<String>, GroundrankError>;

    /// Chunks produced by one unit.
    async fn load_unit(&self, unit: &str) -> Result<Vec<Chunk>, GroundrankError>;
}

/// Outcome of a collection pass.
#[derive(Debug, Default)]
pub struct IngestionReport {
    pub chunks: Vec<Chunk>,
    /// (unit, reason) for every unit that was skipped
    pub skipped: Vec<(String, String)>,
    /// Chunks dropped because their id was already collected
    pub duplicates: usize,
}

/// Load every unit of `source`, skipping units that fail or exceed `unit_timeout`.
///
/// Chunk ids are unique in the result; later duplicates are dropped.
pub async fn collect_chunks(
    source: &dyn ChunkSource,
    unit_timeout: Duration,
) -> Result<IngestionReport, GroundrankError> {
    let units = source.units().await?;
    let mut report = IngestionReport::default();
    let mut seen = HashSet::new();

    for unit in units {
        let loaded = match tokio::time::timeout(unit_timeout, source.load_unit(&unit)).await {
            Ok(result) => result,
            Err(_) => Err(GroundrankError::IngestionTimeout {
                unit: unit.clone(),
                seconds: unit_timeout.as_secs(),
            }),
        };

        match loaded {
            Ok(chunks) => {
                let count = chunks.len();
                for chunk in chunks {
                    if seen.insert(chunk.chunk_id.clone()) {
                        report.chunks.push(chunk);
                    } else {
                        report.duplicates += 1;
                    }
                }
                tracing::debug!(unit = %unit, chunk_count = count, "Unit loaded");
            }
            Err(e) => {
                tracing::warn!(unit = %unit, error = %e, kind = e.kind(), "Skipping unit");
                report.skipped.push((unit, e.to_string()));
            }
        }
    }

    if report.duplicates > 0 {
        tracing::warn!(duplicates = report.duplicates, "Dropped chunks with duplicate ids");
    }
    tracing::info!(
        chunk_count = report.chunks.len(),
        skipped = report.skipped.len(),
        "Chunk collection finished"
    );
    Ok(report)
}

/// Chunk record as written by the upstream chunker; `chunk_id` may be absent.
#[derive(Debug, Deserialize)]
struct ChunkRecord {
    #[serde(default)]
    chunk_id: Option<String>,
    source_type: SourceType,
    source_id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    headers: Vec<String>,
    #[serde(default)]
    page_ref: Option<String>,
    content: String,
    #[serde(default)]
    file_path: Option<String>,
}

impl From<ChunkRecord> for Chunk {
    fn from(record: ChunkRecord) -> Self {
        let chunk_id = record
            .chunk_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Chunk::derive_id(&record.source_id, &record.content));
        let mut chunk = Chunk {
            chunk_id,
            source_type: record.source_type,
            source_id: record.source_id,
            title: record.title,
            headers: record.headers,
            page_ref: record.page_ref,
            content: record.content,
            file_path: record.file_path,
        };
        chunk.clamp_headers();
        chunk
    }
}

/// Reads chunk files from a directory: `*.json` holds an array of chunks,
/// `*.jsonl` one chunk per line. Each file is one unit.
pub struct JsonChunkSource {
    dir: PathBuf,
}

impl JsonChunkSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JsonChunkSource { dir: dir.into() }
    }

    fn parse_error(path: &Path, detail: impl std::fmt::Display) -> GroundrankError {
        GroundrankError::validation("chunks", &format!("{}: {}", path.display(), detail))
    }
}

#[async_trait]
impl ChunkSource for JsonChunkSource {
    async fn units(&self) -> Result<Vec<String>, GroundrankError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            GroundrankError::Config(format!("Cannot read chunks dir {}: {}", self.dir.display(), e))
        })?;

        let mut units = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_chunk_file = matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("json") | Some("jsonl")
            );
            if is_chunk_file && entry.file_type().await?.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    units.push(name.to_string());
                }
            }
        }
        units.sort();
        Ok(units)
    }

    async fn load_unit(&self, unit: &str) -> Result<Vec<Chunk>, GroundrankError> {
        let path = self.dir.join(unit);
        let text = tokio::fs::read_to_string(&path).await?;

        let records: Vec<ChunkRecord> = if unit.ends_with(".jsonl") {
            text.lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(n, line)| {
                    serde_json::from_str(line)
                        .map_err(|e| Self::parse_error(&path, format!("line {}: {}", n + 1, e)))
                })
                .collect::<Result<_, _>>()?
        } else {
            serde_json::from_str(&text).map_err(|e| Self::parse_error(&path, e))?
        };

        Ok(records
            .into_iter()
            .map(|record| {
                let mut chunk = Chunk::from(record);
                if chunk.file_path.is_none() {
                    chunk.file_path = Some(path.display().to_string());
                }
                chunk
            })
            .collect())
    }
}
