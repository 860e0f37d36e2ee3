//! Cluster snapshots carry the durable store as one flat export per table.
//! Loading a snapshot replaces the tables and rebuilds the cache from them
//! before the engine serves again.
use crate::engine::{ConfigEngine, EngineError};
use crate::repository::{RepositoryError, TableSnapshot};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::sync::Arc;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("unsupported snapshot version: {0}")]
    UnsupportedVersion(u32),

    #[error("snapshot is missing table {0}")]
    MissingTable(String),

    #[error("rebuilding the cache failed: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct TableExport {
    name: String,
    rows: Vec<u8>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct SnapshotArchive {
    version: u32,
    tables: Vec<TableExport>,
}

/// Archives are bincode behind a zstd frame.
struct Codec {
    level: i32,
    config: bincode::config::Configuration,
}

impl Codec {
    fn new(level: i32) -> Self {
        Codec {
            level,
            config: bincode::config::standard(),
        }
    }

    fn write<W: Write>(&self, writer: &mut W, archive: &SnapshotArchive) -> Result<usize, SnapshotError> {
        let mut encoder = zstd::stream::write::Encoder::new(writer, self.level)?;
        let size = bincode::serde::encode_into_std_write(archive, &mut encoder, self.config)?;
        encoder.finish()?.flush()?;
        Ok(size)
    }

    fn read<R: Read>(&self, reader: R) -> Result<SnapshotArchive, SnapshotError> {
        let mut decoder = zstd::stream::read::Decoder::new(reader)?;
        Ok(bincode::serde::decode_from_std_read(&mut decoder, self.config)?)
    }
}

pub struct SnapshotBridge {
    store: Arc<dyn TableSnapshot>,
    engine: ConfigEngine,
    codec: Codec,
}

impl SnapshotBridge {
    pub fn new(store: Arc<dyn TableSnapshot>, engine: ConfigEngine) -> Self {
        SnapshotBridge {
            store,
            engine,
            codec: Codec::new(1),
        }
    }

    pub fn on_snapshot_save<W: Write>(&self, writer: &mut W) -> Result<(), SnapshotError> {
        let tables = self
            .store
            .table_names()
            .into_iter()
            .map(|name| {
                Ok(TableExport {
                    name: name.to_string(),
                    rows: self.store.export_table(name)?,
                })
            })
            .collect::<Result<Vec<_>, SnapshotError>>()?;

        let archive = SnapshotArchive {
            version: SNAPSHOT_VERSION,
            tables,
        };
        let size = self.codec.write(writer, &archive)?;
        tracing::info!(tables = archive.tables.len(), bytes = size, "Saved snapshot");
        Ok(())
    }

    /// The engine stops serving until the cache has been rebuilt from the
    /// loaded tables, retrying the rebuild if it fails. A rejected archive
    /// leaves the store and the engine as they were.
    pub async fn on_snapshot_load<R: Read>(&self, reader: R) -> Result<(), SnapshotError> {
        let archive = self.codec.read(reader)?;
        if archive.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(archive.version));
        }
        for name in self.store.table_names() {
            if !archive.tables.iter().any(|table| table.name == name) {
                return Err(SnapshotError::MissingTable(name.to_string()));
            }
        }

        self.store.import_tables(
            archive
                .tables
                .into_iter()
                .map(|table| (table.name, table.rows))
                .collect(),
        )?;

        let report = self.engine.rebuild().await?;
        tracing::info!(
            rows = report.rows,
            pruned = report.pruned,
            "Loaded snapshot and rebuilt the cache"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{test_config, wait_ready};
    use crate::gray_rule::rule_document;
    use crate::query_chain::ConfigQuery;
    use crate::repository::{HIS_CONFIG_INFO, MemoryRepository, RowDraft};
    use crate::testutils::test_key;
    use crate::types::QueryStatus;

    async fn engine_with(repo: Arc<MemoryRepository>) -> (tempfile::TempDir, ConfigEngine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = ConfigEngine::new(&test_config(dir.path()), repo).unwrap();
        wait_ready(&engine).await;
        (dir, engine)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let source = Arc::new(MemoryRepository::new());
        source.upsert(RowDraft::formal(test_key("a"), "va", 1));
        source.upsert(RowDraft::gray(
            test_key("a"),
            "canary",
            "va-gray",
            rule_document("label", "env=dev", 1),
            1,
        ));
        let (_dir, engine) = engine_with(source.clone()).await;
        let mut buf = Vec::new();
        engine.snapshot_bridge().on_snapshot_save(&mut buf).unwrap();
        engine.shutdown().await;

        let target = Arc::new(MemoryRepository::new());
        target.upsert(RowDraft::formal(test_key("stale"), "old", 1));
        let (_dir, engine) = engine_with(target.clone()).await;
        engine
            .snapshot_bridge()
            .on_snapshot_load(buf.as_slice())
            .await
            .unwrap();

        assert!(engine.is_ready());
        assert!(engine.table().get(&test_key("stale")).is_none());
        let result = engine
            .resolve(&ConfigQuery::new(test_key("a")).with_label("env", "dev"))
            .unwrap();
        assert_eq!(result.status, QueryStatus::Beta);
        assert_eq!(result.content.as_deref(), Some("va-gray"));
        assert_eq!(target.history_len(), source.history_len());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejects_unknown_version() {
        let repo = Arc::new(MemoryRepository::new());
        repo.upsert(RowDraft::formal(test_key("a"), "va", 1));
        let (_dir, engine) = engine_with(repo).await;
        let bridge = engine.snapshot_bridge();

        let archive = SnapshotArchive {
            version: 99,
            tables: Vec::new(),
        };
        let mut buf = Vec::new();
        bridge.codec.write(&mut buf, &archive).unwrap();

        let result = bridge.on_snapshot_load(buf.as_slice()).await;
        assert!(matches!(result, Err(SnapshotError::UnsupportedVersion(99))));
        assert!(engine.is_ready());
        assert!(engine.table().get(&test_key("a")).is_some());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejects_missing_table() {
        let repo = Arc::new(MemoryRepository::new());
        let (_dir, engine) = engine_with(repo.clone()).await;
        let bridge = engine.snapshot_bridge();

        let tables = repo
            .table_names()
            .into_iter()
            .filter(|name| *name != HIS_CONFIG_INFO)
            .map(|name| TableExport {
                name: name.to_string(),
                rows: repo.export_table(name).unwrap(),
            })
            .collect();
        let archive = SnapshotArchive {
            version: SNAPSHOT_VERSION,
            tables,
        };
        let mut buf = Vec::new();
        bridge.codec.write(&mut buf, &archive).unwrap();

        let result = bridge.on_snapshot_load(buf.as_slice()).await;
        assert!(matches!(result, Err(SnapshotError::MissingTable(name)) if name == HIS_CONFIG_INFO));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_corrupt_archive() {
        let (_dir, engine) = engine_with(Arc::new(MemoryRepository::new())).await;
        let result = engine
            .snapshot_bridge()
            .on_snapshot_load(&b"not a snapshot"[..])
            .await;
        assert!(result.is_err());
        engine.shutdown().await;
    }
}
