//! SQLite-backed store with migrations
//!
//! Raw document text above the compression threshold is stored
//! zstd-compressed; vectors are little-endian `f32` blobs.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};

use super::{DocumentInfo, DocumentStore, StoreError, StoreResult, StoreStats};
use crate::model::{
    Chunk, ChunkKind, ChunkMetadata, Document, Embedding, Symbol, SymbolKind, TextRange,
};

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

const ZSTD_LEVEL: i32 = 3;

pub struct SqliteStore {
    pool: DbPool,
    compression_threshold: usize,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run pending migrations
    pub fn new(db_path: &Path, compression_threshold: usize) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                source: e,
                context: format!("Failed to create database directory: {:?}", parent),
            })?;
        }

        // Pragmas are per connection, so every pooled connection runs them.
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA foreign_keys = ON;
                PRAGMA busy_timeout = 5000;
                ",
            )
        });

        let pool = Pool::builder().max_size(16).build(manager)?;

        let store = Self {
            pool,
            compression_threshold,
        };
        store.migrate()?;
        tracing::debug!("Opened store at {:?}", db_path);
        Ok(store)
    }

    fn conn(&self) -> StoreResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn migrate(&self) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let current_version: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )?;

        for (version, migration) in MIGRATIONS.iter().enumerate() {
            let version = version as i64 + 1;
            if version > current_version {
                tracing::info!("Applying store migration {}", version);
                conn.execute_batch(migration)?;
                conn.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                    params![version],
                )?;
            }
        }

        Ok(())
    }

    fn encode_text(&self, text: &str) -> StoreResult<(Vec<u8>, bool)> {
        let bytes = text.as_bytes();
        if bytes.len() >= self.compression_threshold {
            let compressed = zstd::encode_all(bytes, ZSTD_LEVEL).map_err(|e| StoreError::Io {
                source: e,
                context: "Failed to compress document text".to_string(),
            })?;
            Ok((compressed, true))
        } else {
            Ok((bytes.to_vec(), false))
        }
    }
}

fn decode_text(data: Vec<u8>, compressed: bool) -> StoreResult<String> {
    let bytes = if compressed {
        zstd::decode_all(&data[..]).map_err(|e| StoreError::Io {
            source: e,
            context: "Failed to decompress document text".to_string(),
        })?
    } else {
        data
    };
    String::from_utf8(bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn blob_to_vec(blob: &[u8]) -> StoreResult<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::Corrupt(format!(
            "Vector blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn parse_time(value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("Bad timestamp '{}': {}", value, e)))
}

struct ChunkRow {
    id: String,
    document_id: String,
    ordinal: i64,
    text: String,
    start_offset: i64,
    end_offset: i64,
    kind: String,
    overlap_with_prev: i64,
    symbol_refs: String,
    metadata: String,
}

const CHUNK_COLUMNS: &str = "id, document_id, ordinal, text, start_offset, end_offset, kind, \
                             overlap_with_prev, symbol_refs, metadata";

fn read_chunk_row(row: &Row<'_>) -> rusqlite::Result<ChunkRow> {
    Ok(ChunkRow {
        id: row.get(0)?,
        document_id: row.get(1)?,
        ordinal: row.get(2)?,
        text: row.get(3)?,
        start_offset: row.get(4)?,
        end_offset: row.get(5)?,
        kind: row.get(6)?,
        overlap_with_prev: row.get(7)?,
        symbol_refs: row.get(8)?,
        metadata: row.get(9)?,
    })
}

impl ChunkRow {
    fn into_chunk(self) -> StoreResult<Chunk> {
        let kind = ChunkKind::parse(&self.kind)
            .ok_or_else(|| StoreError::Corrupt(format!("Unknown chunk kind '{}'", self.kind)))?;
        let metadata: ChunkMetadata = serde_json::from_str(&self.metadata)?;
        Ok(Chunk {
            id: self.id,
            document_id: self.document_id,
            ordinal: self.ordinal as u32,
            text: self.text,
            start_offset: self.start_offset as usize,
            end_offset: self.end_offset as usize,
            symbol_refs: serde_json::from_str(&self.symbol_refs)?,
            kind,
            overlap_with_prev: self.overlap_with_prev as usize,
            metadata,
        })
    }
}

fn collect_chunks(rows: Vec<ChunkRow>) -> StoreResult<Vec<Chunk>> {
    rows.into_iter().map(ChunkRow::into_chunk).collect()
}

impl DocumentStore for SqliteStore {
    fn put_document(&self, document: &Document) -> StoreResult<()> {
        let (raw, compressed) = self.encode_text(&document.raw_text)?;
        let hash = blake3::hash(document.raw_text.as_bytes()).to_hex().to_string();
        let metadata = serde_json::to_string(&document.metadata)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO documents
                (id, version, source_uri, language, raw_text, compressed, content_hash, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                source_uri = excluded.source_uri,
                language = excluded.language,
                raw_text = excluded.raw_text,
                compressed = excluded.compressed,
                content_hash = excluded.content_hash,
                metadata = excluded.metadata,
                created_at = excluded.created_at",
            params![
                document.id,
                document.version,
                document.source_uri,
                document.language,
                raw,
                compressed,
                hash,
                metadata,
                document.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_document(&self, id: &str) -> StoreResult<Option<Document>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, version, source_uri, language, raw_text, compressed, metadata, created_at
                 FROM documents WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, version, source_uri, language, raw, compressed, metadata, created_at)) = row
        else {
            return Ok(None);
        };

        let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata)?;
        Ok(Some(Document {
            id,
            version,
            source_uri,
            language,
            raw_text: decode_text(raw, compressed)?,
            metadata,
            created_at: parse_time(&created_at)?,
        }))
    }

    fn latest_version(&self, id: &str) -> StoreResult<Option<u32>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT version FROM documents WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn list_documents(&self) -> StoreResult<Vec<DocumentInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT d.id, d.version, d.source_uri, d.language,
                    (SELECT COUNT(*) FROM chunks c WHERE c.document_id = d.id)
             FROM documents d ORDER BY d.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DocumentInfo {
                id: row.get(0)?,
                version: row.get(1)?,
                source_uri: row.get(2)?,
                language: row.get(3)?,
                chunk_count: row.get::<_, i64>(4)? as usize,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn delete_document(&self, id: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let chunk_ids = {
            let mut stmt =
                tx.prepare("SELECT id FROM chunks WHERE document_id = ?1 ORDER BY ordinal")?;
            let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        // Cascades to chunks, symbols and embeddings
        tx.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(chunk_ids)
    }

    fn put_chunks(&self, chunks: &[Chunk], symbols: &[Symbol]) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut insert_chunk = tx.prepare(
                "INSERT OR REPLACE INTO chunks
                    (id, document_id, ordinal, text, start_offset, end_offset, kind,
                     overlap_with_prev, symbol_refs, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for chunk in chunks {
                insert_chunk
                    .execute(params![
                        chunk.id,
                        chunk.document_id,
                        chunk.ordinal,
                        chunk.text,
                        chunk.start_offset as i64,
                        chunk.end_offset as i64,
                        chunk.kind.as_str(),
                        chunk.overlap_with_prev as i64,
                        serde_json::to_string(&chunk.symbol_refs)?,
                        serde_json::to_string(&chunk.metadata)?,
                    ])
                    .map_err(|e| match e {
                        rusqlite::Error::SqliteFailure(f, _)
                            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                        {
                            StoreError::MissingDocument(chunk.document_id.clone())
                        }
                        other => StoreError::Database(other),
                    })?;
            }

            let mut insert_symbol = tx.prepare(
                "INSERT OR REPLACE INTO symbols (id, document_id, kind, name, start_offset, end_offset)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for symbol in symbols {
                insert_symbol.execute(params![
                    symbol.id,
                    symbol.document_id,
                    symbol.kind.as_str(),
                    symbol.name,
                    symbol.range.start as i64,
                    symbol.range.end as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn get_chunks(&self, ids: &[String]) -> StoreResult<Vec<Chunk>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM chunks WHERE id = ?1", CHUNK_COLUMNS))?;
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = stmt.query_row(params![id], read_chunk_row).optional()? {
                rows.push(row);
            }
        }
        collect_chunks(rows)
    }

    fn chunks_for_document(&self, document_id: &str) -> StoreResult<Vec<Chunk>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM chunks WHERE document_id = ?1 ORDER BY ordinal",
            CHUNK_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![document_id], read_chunk_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        collect_chunks(rows)
    }

    fn all_chunks(&self) -> StoreResult<Vec<Chunk>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM chunks ORDER BY document_id, ordinal",
            CHUNK_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], read_chunk_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        collect_chunks(rows)
    }

    fn symbols_for_document(&self, document_id: &str) -> StoreResult<Vec<Symbol>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, document_id, kind, name, start_offset, end_offset
             FROM symbols WHERE document_id = ?1 ORDER BY start_offset",
        )?;
        let rows = stmt
            .query_map(params![document_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, document_id, kind, name, start, end)| {
                let kind = SymbolKind::parse(&kind)
                    .ok_or_else(|| StoreError::Corrupt(format!("Unknown symbol kind '{}'", kind)))?;
                Ok(Symbol {
                    id,
                    document_id,
                    kind,
                    name,
                    range: TextRange::new(start as usize, end as usize),
                })
            })
            .collect()
    }

    fn put_embedding(&self, embedding: &Embedding) -> StoreResult<()> {
        let conn = self.conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM chunks WHERE id = ?1)",
            params![embedding.chunk_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StoreError::MissingChunk(embedding.chunk_id.clone()));
        }

        conn.execute(
            "INSERT OR REPLACE INTO embeddings (chunk_id, model, dimension, vector, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                embedding.chunk_id,
                embedding.model,
                embedding.vector.len() as i64,
                vec_to_blob(&embedding.vector),
                embedding.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_embedding(&self, chunk_id: &str, model: &str) -> StoreResult<Option<Embedding>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT vector, created_at FROM embeddings WHERE chunk_id = ?1 AND model = ?2",
                params![chunk_id, model],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        match row {
            Some((blob, created_at)) => Ok(Some(Embedding {
                chunk_id: chunk_id.to_string(),
                model: model.to_string(),
                vector: blob_to_vec(&blob)?,
                created_at: parse_time(&created_at)?,
            })),
            None => Ok(None),
        }
    }

    fn embeddings_for_model(&self, model: &str) -> StoreResult<Vec<Embedding>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT chunk_id, vector, created_at FROM embeddings WHERE model = ?1 ORDER BY chunk_id",
        )?;
        let rows = stmt
            .query_map(params![model], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(chunk_id, blob, created_at)| {
                Ok(Embedding {
                    chunk_id,
                    model: model.to_string(),
                    vector: blob_to_vec(&blob)?,
                    created_at: parse_time(&created_at)?,
                })
            })
            .collect()
    }

    fn stats(&self) -> StoreResult<StoreStats> {
        let conn = self.conn()?;
        let count = |table: &str| -> StoreResult<usize> {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })?;
            Ok(n as usize)
        };

        Ok(StoreStats {
            document_count: count("documents")?,
            chunk_count: count("chunks")?,
            symbol_count: count("symbols")?,
            embedding_count: count("embeddings")?,
        })
    }
}

/// Database migrations (each string is one migration)
const MIGRATIONS: &[&str] = &[
    // Migration 1: Initial schema
    r#"
    CREATE TABLE documents (
        id TEXT PRIMARY KEY,
        version INTEGER NOT NULL,
        source_uri TEXT NOT NULL,
        language TEXT NOT NULL,
        raw_text BLOB NOT NULL,
        compressed BOOLEAN NOT NULL,
        content_hash TEXT NOT NULL,
        metadata TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE chunks (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        text TEXT NOT NULL,
        start_offset INTEGER NOT NULL,
        end_offset INTEGER NOT NULL,
        kind TEXT NOT NULL,
        overlap_with_prev INTEGER NOT NULL,
        symbol_refs TEXT NOT NULL,
        metadata TEXT NOT NULL,
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
    );

    CREATE INDEX idx_chunks_document ON chunks(document_id, ordinal);

    CREATE TABLE symbols (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        start_offset INTEGER NOT NULL,
        end_offset INTEGER NOT NULL,
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
    );

    CREATE INDEX idx_symbols_document ON symbols(document_id);
    CREATE INDEX idx_symbols_name ON symbols(name);

    CREATE TABLE embeddings (
        chunk_id TEXT NOT NULL,
        model TEXT NOT NULL,
        dimension INTEGER NOT NULL,
        vector BLOB NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (chunk_id, model),
        FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
    );

    CREATE INDEX idx_embeddings_model ON embeddings(model);
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkQuality, ChunkStrategy};
    use tempfile::TempDir;

    fn open(temp: &TempDir, threshold: usize) -> SqliteStore {
        SqliteStore::new(&temp.path().join("store.sqlite"), threshold).unwrap()
    }

    fn chunk(doc: &Document, ordinal: u32, start: usize, end: usize) -> Chunk {
        Chunk {
            id: doc.chunk_id(ordinal),
            document_id: doc.id.clone(),
            ordinal,
            text: doc.raw_text[start..end].to_string(),
            start_offset: start,
            end_offset: end,
            symbol_refs: vec![doc.symbol_id(0)],
            kind: ChunkKind::Function,
            overlap_with_prev: 0,
            metadata: ChunkMetadata {
                strategy: ChunkStrategy::Ast,
                quality: ChunkQuality::Full,
                language: "python".to_string(),
                name: Some("add".to_string()),
                start_line: 1,
                end_line: 1,
            },
        }
    }

    #[test]
    fn test_migrations() {
        let temp = TempDir::new().unwrap();
        let store = open(&temp, 1024);

        let conn = store.conn().unwrap();
        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM _migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);

        let fk_enabled: i32 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk_enabled, 1);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let temp = TempDir::new().unwrap();
        let doc = Document::new("d1", "math.py", "def add(a, b): return a + b");
        {
            let store = open(&temp, 1024);
            store.put_document(&doc).unwrap();
        }
        let store = open(&temp, 1024);
        assert_eq!(store.latest_version("d1").unwrap(), Some(0));
    }

    #[test]
    fn test_compressed_document_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = open(&temp, 16);

        let text = "def handler(event):\n    return event\n".repeat(50);
        let doc = Document::new("big", "big.py", text.clone()).with_metadata("team", "search");
        store.put_document(&doc).unwrap();

        let conn = store.conn().unwrap();
        let compressed: bool = conn
            .query_row("SELECT compressed FROM documents WHERE id = 'big'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert!(compressed);

        let loaded = store.get_document("big").unwrap().unwrap();
        assert_eq!(loaded.raw_text, text);
        assert_eq!(loaded.metadata.get("team").map(String::as_str), Some("search"));
    }

    #[test]
    fn test_chunks_symbols_and_embeddings() {
        let temp = TempDir::new().unwrap();
        let store = open(&temp, 1024);

        let doc = Document::new("d1", "math.py", "def add(a, b): return a + b");
        store.put_document(&doc).unwrap();
        let symbol = Symbol {
            id: doc.symbol_id(0),
            document_id: doc.id.clone(),
            kind: SymbolKind::Function,
            name: "add".to_string(),
            range: TextRange::new(0, doc.raw_text.len()),
        };
        store
            .put_chunks(&[chunk(&doc, 0, 0, doc.raw_text.len())], &[symbol.clone()])
            .unwrap();
        store
            .put_embedding(&Embedding::new(doc.chunk_id(0), "hash-384", vec![0.25, -0.5]))
            .unwrap();

        let chunks = store.chunks_for_document("d1").unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, ChunkKind::Function);
        assert_eq!(chunks[0].metadata.name.as_deref(), Some("add"));
        assert_eq!(store.symbols_for_document("d1").unwrap(), vec![symbol]);

        let embedding = store.get_embedding(&doc.chunk_id(0), "hash-384").unwrap().unwrap();
        assert_eq!(embedding.vector, vec![0.25, -0.5]);

        let removed = store.delete_document("d1").unwrap();
        assert_eq!(removed, vec![doc.chunk_id(0)]);
        assert_eq!(store.stats().unwrap(), StoreStats::default());
    }

    #[test]
    fn test_embedding_for_missing_chunk_rejected() {
        let temp = TempDir::new().unwrap();
        let store = open(&temp, 1024);
        let result = store.put_embedding(&Embedding::new("ghost", "m", vec![1.0]));
        assert!(matches!(result, Err(StoreError::MissingChunk(_))));
    }

    #[test]
    fn test_vector_blob_roundtrip() {
        let vector = vec![1.5f32, -0.0, f32::MIN_POSITIVE];
        assert_eq!(blob_to_vec(&vec_to_blob(&vector)).unwrap(), vector);
        assert!(blob_to_vec(&[0u8; 3]).is_err());
    }
}
