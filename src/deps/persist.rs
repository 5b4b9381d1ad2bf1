//! Saving and loading the dependency-edge table.
//!
//! Two formats: a binary blob (magic, format version, revision string,
//! edge count, edges, CRC-64 trailer) for fast full snapshots, and a
//! SQLite database (`deps` + `metadata` tables) for incremental tooling.
//! A table loaded from a saved state may not be saved again (the edges
//! that were in the region before the load are gone), so saving latches
//! on that state and callers must `update` instead.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_64_ECMA_182};

use crate::error::{Error, Result};
use crate::shmem::Arena;

const BLOB_MAGIC: u32 = 0x44_45_50_53; // "DEPS"
const BLOB_FORMAT: u16 = 1;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

fn check_revision(revision: &str) -> Result<()> {
    if revision.is_empty() {
        return Err(Error::RevisionLengthZero);
    }
    Ok(())
}

fn check_saveable(arena: &Arena, reset: bool) -> Result<()> {
    if reset {
        arena.set_dep_table_loaded_from_saved_state(false);
    }
    if arena.dep_table_loaded_from_saved_state() {
        return Err(Error::InvalidData(
            "dep table was loaded from a saved state; use update instead".into(),
        ));
    }
    Ok(())
}

fn edge_checksum(edges: &[u64]) -> u64 {
    let mut digest = CRC64.digest();
    for edge in edges {
        digest.update(&edge.to_be_bytes());
    }
    digest.finalize()
}

fn snapshot(arena: &Arena) -> Vec<u64> {
    let mut edges = Vec::with_capacity(arena.dep_used_slots() as usize);
    arena.dep_for_each(|edge| edges.push(edge));
    edges
}

/// Writes the full edge table to a blob file. Returns edges written.
pub fn save_dep_table_blob(
    arena: &Arena,
    path: &Path,
    revision: &str,
    reset: bool,
) -> Result<u64> {
    check_revision(revision)?;
    check_saveable(arena, reset)?;

    let edges = snapshot(arena);
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_u32::<BigEndian>(BLOB_MAGIC)?;
    writer.write_u16::<BigEndian>(BLOB_FORMAT)?;
    writer.write_u16::<BigEndian>(revision.len() as u16)?;
    writer.write_all(revision.as_bytes())?;
    writer.write_u64::<BigEndian>(edges.len() as u64)?;
    for edge in &edges {
        writer.write_u64::<BigEndian>(*edge)?;
    }
    writer.write_u64::<BigEndian>(edge_checksum(&edges))?;
    writer.flush()?;

    tracing::info!(path = %path.display(), edges = edges.len(), "saved dep table blob");
    Ok(edges.len() as u64)
}

/// Replaces the live edge table with a blob file's contents. Returns edges
/// read.
pub fn load_dep_table_blob(arena: &Arena, path: &Path, ignore_version: bool) -> Result<u64> {
    let mut reader = BufReader::new(File::open(path)?);
    if reader.read_u32::<BigEndian>()? != BLOB_MAGIC {
        return Err(Error::InvalidData(format!(
            "{} is not a dep table blob",
            path.display()
        )));
    }
    if reader.read_u16::<BigEndian>()? != BLOB_FORMAT {
        return Err(Error::InvalidData("unsupported dep table format".into()));
    }
    let revision_len = reader.read_u16::<BigEndian>()? as usize;
    let mut revision = vec![0u8; revision_len];
    reader.read_exact(&mut revision)?;
    let revision = String::from_utf8(revision)
        .map_err(|_| Error::InvalidData("revision is not utf-8".into()))?;
    if revision.is_empty() {
        return Err(Error::RevisionLengthZero);
    }
    if !ignore_version && revision != current_revision() {
        return Err(Error::InvalidData(format!(
            "dep table revision {revision:?} does not match this build"
        )));
    }

    let count = reader.read_u64::<BigEndian>()?;
    let mut edges = Vec::with_capacity(count as usize);
    for _ in 0..count {
        edges.push(reader.read_u64::<BigEndian>()?);
    }
    let stored = reader.read_u64::<BigEndian>()?;
    if stored != edge_checksum(&edges) {
        return Err(Error::InvalidData("dep table blob checksum mismatch".into()));
    }

    let loaded = arena.dep_replace_all(edges)?;
    arena.set_dep_table_loaded_from_saved_state(true);
    tracing::info!(path = %path.display(), edges = loaded, "loaded dep table blob");
    Ok(loaded)
}

/// Writes the full edge table to a fresh SQLite database. Refuses an
/// existing file unless `replace`. Returns edges written.
pub fn save_dep_table_sqlite(
    arena: &Arena,
    path: &Path,
    revision: &str,
    replace: bool,
) -> Result<u64> {
    check_revision(revision)?;
    check_saveable(arena, false)?;

    if path.exists() {
        if !replace {
            return Err(Error::IO(format!(
                "{} already exists; pass replace to overwrite",
                path.display()
            )));
        }
        std::fs::remove_file(path)?;
    }

    let mut conn = rusqlite::Connection::open(path)?;
    conn.execute_batch(
        "CREATE TABLE deps(edge INTEGER PRIMARY KEY) WITHOUT ROWID;
         CREATE TABLE metadata(key TEXT PRIMARY KEY, value TEXT NOT NULL);",
    )?;
    let written = write_edges(&mut conn, &snapshot(arena), revision, true)?;
    tracing::info!(path = %path.display(), edges = written, "saved dep table sqlite");
    Ok(written)
}

/// Merges the live edge table into an existing SQLite database. With
/// `replace`, the stored edges are dropped first. Returns edges written.
pub fn update_dep_table_sqlite(
    arena: &Arena,
    path: &Path,
    revision: &str,
    replace: bool,
) -> Result<u64> {
    check_revision(revision)?;

    let mut conn = rusqlite::Connection::open(path)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS deps(edge INTEGER PRIMARY KEY) WITHOUT ROWID;
         CREATE TABLE IF NOT EXISTS metadata(key TEXT PRIMARY KEY, value TEXT NOT NULL);",
    )?;
    if replace {
        conn.execute("DELETE FROM deps", [])?;
    }
    let written = write_edges(&mut conn, &snapshot(arena), revision, false)?;
    tracing::info!(path = %path.display(), edges = written, "updated dep table sqlite");
    Ok(written)
}

fn write_edges(
    conn: &mut rusqlite::Connection,
    edges: &[u64],
    revision: &str,
    fresh: bool,
) -> Result<u64> {
    let tx = conn.transaction()?;
    let mut written = 0u64;
    {
        let mut insert = tx.prepare(if fresh {
            "INSERT INTO deps(edge) VALUES (?1)"
        } else {
            "INSERT OR IGNORE INTO deps(edge) VALUES (?1)"
        })?;
        for edge in edges {
            written += insert.execute([*edge as i64])? as u64;
        }
    }
    tx.execute(
        "INSERT OR REPLACE INTO metadata(key, value) VALUES ('revision', ?1)",
        [revision],
    )?;
    tx.commit()?;
    Ok(written)
}

/// Replaces the live edge table with a SQLite database's contents.
/// Returns edges read.
pub fn load_dep_table_sqlite(arena: &Arena, path: &Path, ignore_version: bool) -> Result<u64> {
    if !path.exists() {
        return Err(Error::IO(format!("{} does not exist", path.display())));
    }
    let conn = rusqlite::Connection::open(path)?;
    let revision: String = conn.query_row(
        "SELECT value FROM metadata WHERE key = 'revision'",
        [],
        |row| row.get(0),
    )?;
    if revision.is_empty() {
        return Err(Error::RevisionLengthZero);
    }
    if !ignore_version && revision != current_revision() {
        return Err(Error::InvalidData(format!(
            "dep table revision {revision:?} does not match this build"
        )));
    }

    let mut stmt = conn.prepare("SELECT edge FROM deps")?;
    let edges = stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<std::result::Result<Vec<i64>, _>>()?;
    let loaded = arena.dep_replace_all(edges.into_iter().map(|e| e as u64))?;
    arena.set_dep_table_loaded_from_saved_state(true);
    tracing::info!(path = %path.display(), edges = loaded, "loaded dep table sqlite");
    Ok(loaded)
}

/// The revision persisted tables are checked against. Overridable for
/// tests; release builds derive it from the build id the host embeds.
pub fn current_revision() -> String {
    std::env::var("SHMSTORE_BUILD_REVISION").unwrap_or_else(|_| "dev".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShmConfig;
    use crate::tmpfs::NamedTempFile;

    fn arena_with_edges(edges: &[u64]) -> Arena {
        let arena = Arena::init(&ShmConfig::small()).unwrap();
        for edge in edges {
            arena.dep_add(*edge).unwrap();
        }
        arena
    }

    #[test]
    fn test_blob_roundtrip() {
        let saved = arena_with_edges(&[10, 20, 30]);
        let file = NamedTempFile::new().unwrap();
        let written = save_dep_table_blob(&saved, file.path(), "dev", false).unwrap();
        assert_eq!(written, 3);

        let loaded = arena_with_edges(&[99]);
        let read = load_dep_table_blob(&loaded, file.path(), false).unwrap();
        assert_eq!(read, 3);
        // The load replaced the live table.
        assert!(!loaded.dep_mem(99));
        for edge in [10u64, 20, 30] {
            assert!(loaded.dep_mem(edge));
        }
        assert!(loaded.dep_table_loaded_from_saved_state());
    }

    #[test]
    fn test_blob_revision_mismatch() {
        let saved = arena_with_edges(&[1]);
        let file = NamedTempFile::new().unwrap();
        save_dep_table_blob(&saved, file.path(), "other-revision", false).unwrap();

        let target = arena_with_edges(&[]);
        assert!(load_dep_table_blob(&target, file.path(), false).is_err());
        // ignore_version loads anyway.
        assert_eq!(load_dep_table_blob(&target, file.path(), true).unwrap(), 1);
    }

    #[test]
    fn test_blob_checksum_detects_corruption() {
        let saved = arena_with_edges(&[7, 8]);
        let file = NamedTempFile::new().unwrap();
        save_dep_table_blob(&saved, file.path(), "dev", false).unwrap();

        // Flip a byte in the edge payload.
        let mut bytes = std::fs::read(file.path()).unwrap();
        let mid = bytes.len() - 12;
        bytes[mid] ^= 0xff;
        std::fs::write(file.path(), bytes).unwrap();

        let target = arena_with_edges(&[]);
        assert!(load_dep_table_blob(&target, file.path(), true).is_err());
    }

    #[test]
    fn test_empty_revision_rejected() {
        let arena = arena_with_edges(&[1]);
        let file = NamedTempFile::new().unwrap();
        assert_eq!(
            save_dep_table_blob(&arena, file.path(), "", false).unwrap_err(),
            Error::RevisionLengthZero
        );
        assert_eq!(
            save_dep_table_sqlite(&arena, file.path(), "", false).unwrap_err(),
            Error::RevisionLengthZero
        );
    }

    #[test]
    fn test_save_after_load_rejected_unless_reset() {
        let arena = arena_with_edges(&[5]);
        let file = NamedTempFile::new().unwrap();
        save_dep_table_blob(&arena, file.path(), "dev", false).unwrap();
        load_dep_table_blob(&arena, file.path(), false).unwrap();

        let second = NamedTempFile::new().unwrap();
        assert!(save_dep_table_blob(&arena, second.path(), "dev", false).is_err());
        // The reset flag clears the latch and allows the save.
        assert_eq!(
            save_dep_table_blob(&arena, second.path(), "dev", true).unwrap(),
            1
        );
    }

    #[test]
    fn test_sqlite_roundtrip() {
        let saved = arena_with_edges(&[100, 200]);
        let file = NamedTempFile::new().unwrap();
        let written = save_dep_table_sqlite(&saved, file.path(), "dev", false).unwrap();
        assert_eq!(written, 2);

        let loaded = arena_with_edges(&[]);
        assert_eq!(
            load_dep_table_sqlite(&loaded, file.path(), false).unwrap(),
            2
        );
        assert!(loaded.dep_mem(100));
        assert!(loaded.dep_mem(200));
        assert!(loaded.dep_table_loaded_from_saved_state());
    }

    #[test]
    fn test_sqlite_save_refuses_existing_file() {
        let arena = arena_with_edges(&[1]);
        let file = NamedTempFile::new().unwrap();
        save_dep_table_sqlite(&arena, file.path(), "dev", false).unwrap();
        assert!(save_dep_table_sqlite(&arena, file.path(), "dev", false).is_err());
        // replace overwrites.
        assert_eq!(
            save_dep_table_sqlite(&arena, file.path(), "dev", true).unwrap(),
            1
        );
    }

    #[test]
    fn test_sqlite_update_merges() {
        let first = arena_with_edges(&[1, 2]);
        let file = NamedTempFile::new().unwrap();
        save_dep_table_sqlite(&first, file.path(), "dev", false).unwrap();

        let second = arena_with_edges(&[2, 3]);
        // Only the new edge lands; 2 is already stored.
        assert_eq!(
            update_dep_table_sqlite(&second, file.path(), "dev", false).unwrap(),
            1
        );

        let check = arena_with_edges(&[]);
        assert_eq!(load_dep_table_sqlite(&check, file.path(), false).unwrap(), 3);
    }

    #[test]
    fn test_sqlite_update_replace_drops_stored_edges() {
        let first = arena_with_edges(&[1, 2]);
        let file = NamedTempFile::new().unwrap();
        save_dep_table_sqlite(&first, file.path(), "dev", false).unwrap();

        let second = arena_with_edges(&[9]);
        assert_eq!(
            update_dep_table_sqlite(&second, file.path(), "dev", true).unwrap(),
            1
        );
        let check = arena_with_edges(&[]);
        assert_eq!(load_dep_table_sqlite(&check, file.path(), false).unwrap(), 1);
        assert!(check.dep_mem(9));
        assert!(!check.dep_mem(1));
    }
}
