use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use ragdb_core::types::ChunkRecord;
use ragdb_core::{Error, Result};

use crate::index::VectorIndex;
use crate::schema::{
    Sidecar, INDEX_FILE, INDEX_FORMAT_VERSION, INDEX_MAGIC, METADATA_FILE, METRIC_INNER_PRODUCT, SCHEMA_VERSION,
};

/// What the running process expects a stored collection to look like.
#[derive(Debug, Clone, Copy)]
pub struct LoadExpectations<'a> {
    pub collection: &'a str,
    pub model_name: &'a str,
    pub dimension: Option<usize>,
}

pub fn artifact_exists(dir: &Path) -> bool {
    dir.join(INDEX_FILE).is_file() && dir.join(METADATA_FILE).is_file()
}

/// Write to a uniquely named temp file next to `path`, then rename it over
/// `path`. Concurrent writers never share a temp file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut w = BufWriter::new(tmp.as_file_mut());
        w.write_all(bytes)?;
        w.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

pub fn save(
    dir: &Path,
    index: &VectorIndex,
    records: &[ChunkRecord],
    model_name: &str,
    created_at: DateTime<Utc>,
) -> Result<PathBuf> {
    if index.len() != records.len() {
        return Err(Error::CorruptArtifact(format!(
            "index holds {} vectors but the side table has {} rows",
            index.len(),
            records.len()
        )));
    }
    fs::create_dir_all(dir)?;

    let payload = bincode::serde::encode_to_vec(index, bincode::config::standard())
        .map_err(|e| Error::Serialization(e.to_string()))?;
    let mut bytes = Vec::with_capacity(payload.len() + 6);
    bytes.extend_from_slice(INDEX_MAGIC);
    bytes.extend_from_slice(&INDEX_FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&payload);
    write_atomic(&dir.join(INDEX_FILE), &bytes)?;

    let sidecar = Sidecar {
        schema_version: SCHEMA_VERSION,
        documents: records.to_vec(),
        total_documents: records.len(),
        embedding_dimension: index.dim(),
        model_name: model_name.to_string(),
        created_at,
        index_type: index.kind(),
        metric: METRIC_INNER_PRODUCT.to_string(),
        nlist: index.nlist(),
    };
    write_atomic(&dir.join(METADATA_FILE), &serde_json::to_vec_pretty(&sidecar)?)?;

    tracing::info!(dir = %dir.display(), vectors = records.len(), "collection persisted");
    Ok(dir.to_path_buf())
}

fn read_index(path: &Path) -> Result<VectorIndex> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    if bytes.len() < 6 || &bytes[..4] != INDEX_MAGIC {
        return Err(Error::CorruptArtifact(format!("{}: bad magic bytes", path.display())));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != INDEX_FORMAT_VERSION {
        return Err(Error::CorruptArtifact(format!(
            "{}: index format version {} (supported: {})",
            path.display(),
            version,
            INDEX_FORMAT_VERSION
        )));
    }
    let (index, _) = bincode::serde::decode_from_slice(&bytes[6..], bincode::config::standard())
        .map_err(|e| Error::CorruptArtifact(format!("{}: {}", path.display(), e)))?;
    Ok(index)
}

/// Load a collection artifact and check it against the running configuration.
pub fn load(dir: &Path, expect: LoadExpectations<'_>) -> Result<(VectorIndex, Sidecar)> {
    let sidecar: Sidecar = serde_json::from_slice(&fs::read(dir.join(METADATA_FILE))?)?;
    if sidecar.schema_version != SCHEMA_VERSION {
        return Err(Error::CorruptArtifact(format!(
            "sidecar schema version {} (supported: {})",
            sidecar.schema_version, SCHEMA_VERSION
        )));
    }
    if let Some(expected) = expect.dimension {
        if sidecar.embedding_dimension != expected {
            return Err(Error::DimensionMismatch {
                collection: expect.collection.to_string(),
                expected,
                actual: sidecar.embedding_dimension,
            });
        }
    }
    if sidecar.model_name != expect.model_name {
        return Err(Error::ModelMismatch {
            collection: expect.collection.to_string(),
            expected: expect.model_name.to_string(),
            actual: sidecar.model_name.clone(),
        });
    }

    let index = read_index(&dir.join(INDEX_FILE))?;
    if index.len() != sidecar.total_documents || sidecar.documents.len() != sidecar.total_documents {
        return Err(Error::CorruptArtifact(format!(
            "index holds {} vectors, sidecar lists {} documents (total_documents = {})",
            index.len(),
            sidecar.documents.len(),
            sidecar.total_documents
        )));
    }
    if index.dim() != sidecar.embedding_dimension {
        return Err(Error::CorruptArtifact(format!(
            "index dimension {} disagrees with sidecar dimension {}",
            index.dim(),
            sidecar.embedding_dimension
        )));
    }
    Ok((index, sidecar))
}
