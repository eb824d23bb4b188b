//! Single-file shard storage
//!
//! Every shard (and the control partition) is one append-only file: a small
//! header followed by checksummed frames, each holding a batch of operations
//! that is applied atomically. Opening a file replays its frames into memory.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::entity::{relation_of, stamp_links, BusinessKey, Entity, KeyPath, Row, RowId};
use crate::error::{Error, Result};

// Magic bytes to identify shard files
const SHARD_MAGIC: &[u8; 4] = b"RTSH";
const SHARD_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 8; // Magic(4) + Version(4)
const FRAME_HEADER_SIZE: u64 = 8; // Length(4) + Checksum(4)

/// Table declaration applied to a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    /// Entity kind stored in the table
    pub kind: String,
    /// Whether business keys must be unique
    pub unique: bool,
}

impl TableDef {
    /// Table definition for an entity type
    pub fn of<T: Entity>() -> Self {
        Self {
            kind: T::KIND.to_string(),
            unique: !T::BUSINESS_KEY.is_empty(),
        }
    }
}

/// Ordered set of tables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    tables: Vec<TableDef>,
}

impl Schema {
    pub fn new(tables: Vec<TableDef>) -> Self {
        Self { tables }
    }

    /// Look up a table by kind
    pub fn table(&self, kind: &str) -> Option<&TableDef> {
        self.tables.iter().find(|table| table.kind == kind)
    }

    pub fn tables(&self) -> &[TableDef] {
        &self.tables
    }
}

/// A persisted mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
enum LogOp {
    CreateTable {
        kind: String,
        unique: bool,
    },
    Put {
        kind: String,
        id: RowId,
        key: Option<BusinessKey>,
        payload: Vec<u8>,
    },
    Delete {
        kind: String,
        id: RowId,
    },
}

#[derive(Debug, Clone)]
struct StoredRow {
    key: Option<BusinessKey>,
    payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Table {
    unique: bool,
    next_id: RowId,
    rows: BTreeMap<RowId, StoredRow>,
    by_key: HashMap<BusinessKey, RowId>,
}

impl Table {
    fn new(unique: bool) -> Self {
        Self {
            unique,
            next_id: 1,
            rows: BTreeMap::new(),
            by_key: HashMap::new(),
        }
    }

    /// Insert or replace a row, returning what it replaced
    fn put(&mut self, id: RowId, row: StoredRow) -> Option<StoredRow> {
        let previous = self.remove(id);
        if self.unique {
            if let Some(key) = &row.key {
                self.by_key.insert(key.clone(), id);
            }
        }
        self.next_id = self.next_id.max(id + 1);
        self.rows.insert(id, row);
        previous
    }

    fn remove(&mut self, id: RowId) -> Option<StoredRow> {
        let row = self.rows.remove(&id)?;
        if let Some(key) = &row.key {
            if self.by_key.get(key) == Some(&id) {
                self.by_key.remove(key);
            }
        }
        Some(row)
    }
}

type Tables = HashMap<String, Table>;

/// Inverse of an applied operation
enum Undo {
    DropTable(String),
    Restore {
        kind: String,
        id: RowId,
        previous: Option<StoredRow>,
        next_id: RowId,
    },
}

fn rollback(tables: &mut Tables, undo: Vec<Undo>) {
    for step in undo.into_iter().rev() {
        match step {
            Undo::DropTable(kind) => {
                tables.remove(&kind);
            }
            Undo::Restore {
                kind,
                id,
                previous,
                next_id,
            } => {
                if let Some(table) = tables.get_mut(&kind) {
                    table.remove(id);
                    if let Some(row) = previous {
                        table.put(id, row);
                    }
                    table.next_id = next_id;
                }
            }
        }
    }
}

fn apply_op(tables: &mut Tables, op: &LogOp) -> Result<()> {
    match op {
        LogOp::CreateTable { kind, unique } => {
            tables
                .entry(kind.clone())
                .or_insert_with(|| Table::new(*unique));
        }
        LogOp::Put {
            kind,
            id,
            key,
            payload,
        } => {
            let table = tables
                .get_mut(kind)
                .ok_or_else(|| Error::corruption(format!("Write to unknown table {}", kind)))?;
            table.put(
                *id,
                StoredRow {
                    key: key.clone(),
                    payload: payload.clone(),
                },
            );
        }
        LogOp::Delete { kind, id } => {
            if let Some(table) = tables.get_mut(kind) {
                table.remove(*id);
            }
        }
    }
    Ok(())
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Result of replaying a shard file
struct Replay {
    tables: Tables,
    /// Offset just past the last complete frame
    valid_end: u64,
    /// Bytes of an incomplete trailing frame
    torn_bytes: u64,
}

fn replay(path: &Path, file: &mut File) -> Result<Replay> {
    let mut data = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut data)?;

    if (data.len() as u64) < HEADER_SIZE || &data[0..4] != SHARD_MAGIC {
        return Err(Error::corruption(format!(
            "{} is not a shard file",
            path.display()
        )));
    }

    let mut cursor = Cursor::new(&data[..]);
    cursor.set_position(4);
    let version = cursor.read_u32::<LittleEndian>()?;
    if version != SHARD_VERSION {
        return Err(Error::corruption(format!(
            "Unsupported shard file version {} in {}",
            version,
            path.display()
        )));
    }

    let total = data.len() as u64;
    let mut tables = Tables::new();
    let mut position = HEADER_SIZE;

    while position < total {
        // Step 1: a frame header must be complete
        if total - position < FRAME_HEADER_SIZE {
            break;
        }
        cursor.set_position(position);
        let len = cursor.read_u32::<LittleEndian>()? as u64;
        let expected = cursor.read_u32::<LittleEndian>()?;

        // Step 2: a short payload is a torn write
        let start = position + FRAME_HEADER_SIZE;
        if total - start < len {
            break;
        }

        // Step 3: a complete frame must verify
        let payload = &data[start as usize..(start + len) as usize];
        if checksum(payload) != expected {
            return Err(Error::corruption(format!(
                "Checksum mismatch at offset {} in {}",
                position,
                path.display()
            )));
        }

        let ops: Vec<LogOp> = bincode::deserialize(payload).map_err(|e| {
            Error::corruption(format!(
                "Undecodable frame at offset {} in {}: {}",
                position,
                path.display(),
                e
            ))
        })?;
        for op in &ops {
            apply_op(&mut tables, op)?;
        }

        position = start + len;
    }

    Ok(Replay {
        tables,
        valid_end: position,
        torn_bytes: total - position,
    })
}

struct Inner {
    file: File,
    /// Offset where the next frame is written
    position: u64,
    tables: Tables,
}

/// An open shard file
pub struct ShardStore {
    /// Logical name of the partition
    name: String,
    /// Location of the backing file
    path: PathBuf,
    /// Whether to sync each frame to disk
    sync_writes: bool,
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for ShardStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardStore")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

impl ShardStore {
    /// Create a new, empty shard file; fails if the file exists
    pub fn create<P: AsRef<Path>>(path: P, name: impl Into<String>, sync_writes: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Self::lock(&file, &path)?;

        file.write_all(SHARD_MAGIC)?;
        file.write_u32::<LittleEndian>(SHARD_VERSION)?;
        file.sync_all()?;

        debug!(path = %path.display(), "Created shard file");

        Ok(Self {
            name: name.into(),
            path,
            sync_writes,
            inner: RwLock::new(Inner {
                file,
                position: HEADER_SIZE,
                tables: Tables::new(),
            }),
        })
    }

    /// Open an existing shard file and replay its contents
    ///
    /// An incomplete trailing frame is discarded; a complete frame that fails
    /// its checksum is reported as corruption.
    pub fn open<P: AsRef<Path>>(path: P, name: impl Into<String>, sync_writes: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        Self::lock(&file, &path)?;

        let replay = replay(&path, &mut file)?;
        if replay.torn_bytes > 0 {
            warn!(
                path = %path.display(),
                bytes = replay.torn_bytes,
                "Discarding incomplete trailing frame"
            );
            file.set_len(replay.valid_end)?;
        }

        Ok(Self {
            name: name.into(),
            path,
            sync_writes,
            inner: RwLock::new(Inner {
                file,
                position: replay.valid_end,
                tables: replay.tables,
            }),
        })
    }

    /// Open a shard file, creating it when missing
    pub fn open_or_create<P: AsRef<Path>>(path: P, name: impl Into<String>, sync_writes: bool) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path, name, sync_writes)
        } else {
            Self::create(path, name, sync_writes)
        }
    }

    /// Verify a shard file without locking it; returns its row count
    pub fn inspect<P: AsRef<Path>>(path: P) -> Result<u64> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let replay = replay(path, &mut file)?;
        Ok(replay
            .tables
            .values()
            .map(|table| table.rows.len() as u64)
            .sum())
    }

    fn lock(file: &File, path: &Path) -> Result<()> {
        file.try_lock_exclusive().map_err(|e| {
            Error::storage(format!("Shard file {} is in use: {}", path.display(), e))
        })
    }

    /// Logical partition name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of committed data on disk
    pub fn size_bytes(&self) -> u64 {
        self.inner.read().position
    }

    /// Create every table in the schema that does not exist yet
    pub fn apply_schema(&self, schema: &Schema) -> Result<()> {
        self.commit(|batch| {
            for table in schema.tables() {
                batch.create_table(&table.kind, table.unique);
            }
            Ok(())
        })
    }

    /// Check whether a table exists
    pub fn has_table(&self, kind: &str) -> bool {
        self.inner.read().tables.contains_key(kind)
    }

    /// Insert a row and return it as stored
    pub fn insert<T: Entity>(&self, value: &T) -> Result<Row<T>> {
        let (id, key) = self.commit(|batch| {
            let id = batch.insert(value)?;
            Ok((id, batch.key_of(T::KIND, id)))
        })?;
        let mut data = value.clone();
        stamp_links(&mut data, &self.name);
        Ok(Row::new(id, self.name.clone(), key, data))
    }

    /// Replace an existing row
    pub fn update<T: Entity>(&self, id: RowId, value: &T) -> Result<Row<T>> {
        let key = self.commit(|batch| {
            batch.update(id, value)?;
            Ok(batch.key_of(T::KIND, id))
        })?;
        let mut data = value.clone();
        stamp_links(&mut data, &self.name);
        Ok(Row::new(id, self.name.clone(), key, data))
    }

    /// Delete a row
    pub fn delete(&self, kind: &str, id: RowId) -> Result<()> {
        self.commit(|batch| batch.delete(kind, id))
    }

    /// Fetch a row by id
    pub fn get<T: Entity>(&self, id: RowId) -> Result<Option<Row<T>>> {
        let inner = self.inner.read();
        let row = match inner.tables.get(T::KIND).and_then(|table| table.rows.get(&id)) {
            Some(row) => row,
            None => return Ok(None),
        };
        Ok(Some(self.decode(id, row)?))
    }

    /// Every row of a kind in id order; empty when the table does not exist
    pub fn scan<T: Entity>(&self) -> Result<Vec<Row<T>>> {
        let inner = self.inner.read();
        let table = match inner.tables.get(T::KIND) {
            Some(table) => table,
            None => return Ok(Vec::new()),
        };
        table
            .rows
            .iter()
            .map(|(id, row)| self.decode(*id, row))
            .collect()
    }

    /// Number of rows of a kind
    pub fn count(&self, kind: &str) -> u64 {
        self.inner
            .read()
            .tables
            .get(kind)
            .map(|table| table.rows.len() as u64)
            .unwrap_or(0)
    }

    /// Stored business key of a row
    pub fn key_of(&self, kind: &str, id: RowId) -> Option<BusinessKey> {
        self.inner
            .read()
            .tables
            .get(kind)
            .and_then(|table| table.rows.get(&id))
            .and_then(|row| row.key.clone())
    }

    /// Row id holding a business key
    pub fn find_by_key(&self, kind: &str, key: &BusinessKey) -> Option<RowId> {
        let inner = self.inner.read();
        let table = inner.tables.get(kind)?;
        if let Some(id) = table.by_key.get(key) {
            return Some(*id);
        }
        table
            .rows
            .iter()
            .find(|(_, row)| row.key.as_ref() == Some(key))
            .map(|(id, _)| *id)
    }

    /// Apply several mutations as one frame
    ///
    /// Either every mutation made by `f` becomes durable or none does.
    pub fn commit<R>(&self, f: impl FnOnce(&mut Batch<'_>) -> Result<R>) -> Result<R> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let mut batch = Batch {
            shard: &self.name,
            tables: &mut inner.tables,
            ops: Vec::new(),
            undo: Vec::new(),
        };
        let result = f(&mut batch);
        let Batch { ops, undo, .. } = batch;

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                rollback(&mut inner.tables, undo);
                return Err(e);
            }
        };

        if ops.is_empty() {
            return Ok(value);
        }

        if let Err(e) = Self::write_frame(&mut inner.file, &mut inner.position, &ops, self.sync_writes) {
            rollback(&mut inner.tables, undo);
            return Err(e);
        }

        Ok(value)
    }

    fn write_frame(file: &mut File, position: &mut u64, ops: &[LogOp], sync: bool) -> Result<()> {
        let payload = bincode::serialize(ops)?;
        let mut frame = Vec::with_capacity(payload.len() + FRAME_HEADER_SIZE as usize);
        frame.write_u32::<LittleEndian>(payload.len() as u32)?;
        frame.write_u32::<LittleEndian>(checksum(&payload))?;
        frame.extend_from_slice(&payload);

        let written = file
            .seek(SeekFrom::Start(*position))
            .and_then(|_| file.write_all(&frame))
            .and_then(|_| if sync { file.sync_data() } else { Ok(()) });

        if let Err(e) = written {
            // Drop whatever part of the frame reached the file
            let _ = file.set_len(*position);
            return Err(e.into());
        }

        *position += frame.len() as u64;
        Ok(())
    }

    fn decode<T: Entity>(&self, id: RowId, row: &StoredRow) -> Result<Row<T>> {
        let mut data: T = bincode::deserialize(&row.payload)?;
        stamp_links(&mut data, &self.name);
        Ok(Row::new(id, self.name.clone(), row.key.clone(), data))
    }
}

/// Staged mutations of one [`ShardStore::commit`]
pub struct Batch<'a> {
    shard: &'a str,
    tables: &'a mut Tables,
    ops: Vec<LogOp>,
    undo: Vec<Undo>,
}

impl<'a> Batch<'a> {
    fn create_table(&mut self, kind: &str, unique: bool) {
        if self.tables.contains_key(kind) {
            return;
        }
        self.tables.insert(kind.to_string(), Table::new(unique));
        self.ops.push(LogOp::CreateTable {
            kind: kind.to_string(),
            unique,
        });
        self.undo.push(Undo::DropTable(kind.to_string()));
    }

    fn table(&self, kind: &str) -> Result<&Table> {
        self.tables.get(kind).ok_or_else(|| {
            Error::storage(format!("Shard {} has no table {}", self.shard, kind))
        })
    }

    /// Stored business key of a row
    pub fn key_of(&self, kind: &str, id: RowId) -> Option<BusinessKey> {
        self.tables
            .get(kind)
            .and_then(|table| table.rows.get(&id))
            .and_then(|row| row.key.clone())
    }

    /// Row id holding a business key
    pub fn find_by_key(&self, kind: &str, key: &BusinessKey) -> Option<RowId> {
        let table = self.tables.get(kind)?;
        if let Some(id) = table.by_key.get(key) {
            return Some(*id);
        }
        table
            .rows
            .iter()
            .find(|(_, row)| row.key.as_ref() == Some(key))
            .map(|(id, _)| *id)
    }

    /// Compute the business key of a value against this shard
    fn business_key<T: Entity>(&self, value: &T) -> Result<Option<BusinessKey>> {
        if T::BUSINESS_KEY.is_empty() {
            return Ok(None);
        }

        let mut parts = Vec::new();
        for path in T::BUSINESS_KEY {
            match path {
                KeyPath::Field(field) => {
                    let part = value.key_field(field).ok_or_else(|| {
                        Error::validation(format!("{} has no key field {}", T::KIND, field))
                    })?;
                    parts.push(part);
                }
                KeyPath::Related(name) => {
                    let relation = relation_of::<T>(name).ok_or_else(|| {
                        Error::validation(format!("{} has no relation {}", T::KIND, name))
                    })?;
                    let link = value.link(name).ok_or_else(|| {
                        Error::validation(format!("{}.{} must be set", T::KIND, name))
                    })?;
                    let related = self.key_of(relation.target, link.id()).ok_or_else(|| {
                        Error::validation(format!(
                            "{}.{} points at {} row {} without a business key",
                            T::KIND,
                            name,
                            relation.target,
                            link.id()
                        ))
                    })?;
                    parts.extend(related.parts().iter().cloned());
                }
            }
        }

        Ok(Some(BusinessKey::new(parts)))
    }

    /// Every set link must point at a row of this shard
    fn check_links<T: Entity>(&self, value: &T) -> Result<()> {
        for relation in T::RELATIONS {
            if let Some(link) = value.link(relation.name) {
                let exists = self
                    .tables
                    .get(relation.target)
                    .map(|table| table.rows.contains_key(&link.id()))
                    .unwrap_or(false);
                if !exists {
                    return Err(Error::validation(format!(
                        "{}.{} points at missing {} row {} in shard {}",
                        T::KIND,
                        relation.name,
                        relation.target,
                        link.id(),
                        self.shard
                    )));
                }
            }
        }
        Ok(())
    }

    fn put<T: Entity>(&mut self, id: RowId, value: &T) -> Result<()> {
        self.check_links(value)?;
        let key = self.business_key(value)?;
        let table = self.table(T::KIND)?;

        if table.unique {
            if let Some(key) = &key {
                if let Some(existing) = table.by_key.get(key) {
                    if *existing != id {
                        return Err(Error::conflict(format!(
                            "{} with key {} already exists in shard {}",
                            T::KIND,
                            key,
                            self.shard
                        )));
                    }
                }
            }
        }

        let payload = bincode::serialize(value)?;
        let row = StoredRow {
            key: key.clone(),
            payload: payload.clone(),
        };

        let table = self
            .tables
            .get_mut(T::KIND)
            .ok_or_else(|| Error::storage(format!("Shard {} has no table {}", self.shard, T::KIND)))?;
        let next_id = table.next_id;
        let previous = table.put(id, row);

        self.undo.push(Undo::Restore {
            kind: T::KIND.to_string(),
            id,
            previous,
            next_id,
        });
        self.ops.push(LogOp::Put {
            kind: T::KIND.to_string(),
            id,
            key,
            payload,
        });
        Ok(())
    }

    /// Insert a row and return its id
    pub fn insert<T: Entity>(&mut self, value: &T) -> Result<RowId> {
        let id = self.table(T::KIND)?.next_id;
        self.put(id, value)?;
        Ok(id)
    }

    /// Replace an existing row
    pub fn update<T: Entity>(&mut self, id: RowId, value: &T) -> Result<()> {
        if !self.table(T::KIND)?.rows.contains_key(&id) {
            return Err(Error::not_found(format!(
                "{} row {} in shard {}",
                T::KIND,
                id,
                self.shard
            )));
        }
        self.put(id, value)
    }

    /// Delete an existing row
    pub fn delete(&mut self, kind: &str, id: RowId) -> Result<()> {
        let shard = self.shard;
        let table = self
            .tables
            .get_mut(kind)
            .ok_or_else(|| Error::storage(format!("Shard {} has no table {}", shard, kind)))?;
        let next_id = table.next_id;
        let previous = table
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("{} row {} in shard {}", kind, id, shard)))?;

        self.undo.push(Undo::Restore {
            kind: kind.to_string(),
            id,
            previous: Some(previous),
            next_id,
        });
        self.ops.push(LogOp::Delete {
            kind: kind.to_string(),
            id,
        });
        Ok(())
    }

    /// Every row of a kind as staged so far
    pub fn scan<T: Entity>(&self) -> Result<Vec<(RowId, T)>> {
        let table = match self.tables.get(T::KIND) {
            Some(table) => table,
            None => return Ok(Vec::new()),
        };
        table
            .rows
            .iter()
            .map(|(id, row)| Ok((*id, bincode::deserialize(&row.payload)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Link;
    use crate::telemetry::{self, Device, Sensor, SensorLog};
    use chrono::{TimeZone, Utc};
    use std::fs;
    use tempfile::tempdir;

    fn telemetry_store(path: &Path) -> Result<ShardStore> {
        let store = ShardStore::create(path, "default", false)?;
        store.apply_schema(&telemetry::catalog()?.schema())?;
        Ok(store)
    }

    #[test]
    fn test_insert_and_reopen() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("default.shard");

        {
            let store = telemetry_store(&path)?;
            let device = store.insert(&Device::new("dev-1", "Boiler"))?;
            assert_eq!(device.id(), 1);
            assert_eq!(device.shard(), "default");
            assert_eq!(device.business_key().unwrap().to_string(), "dev-1");

            let sensor = store.insert(&Sensor::new(Link::new(device.id()), "temp"))?;
            assert_eq!(sensor.business_key().unwrap().to_string(), "dev-1/temp");
            assert_eq!(sensor.device.origin(), Some("default"));
        }

        let store = ShardStore::open(&path, "default", false)?;
        assert_eq!(store.count("device"), 1);
        let sensors = store.scan::<Sensor>()?;
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].sensor_type, "temp");
        assert_eq!(sensors[0].device.origin(), Some("default"));
        assert_eq!(
            store.find_by_key("sensor", sensors[0].business_key().unwrap()),
            Some(sensors[0].id())
        );

        Ok(())
    }

    #[test]
    fn test_duplicate_business_key_conflicts() -> Result<()> {
        let temp_dir = tempdir()?;
        let store = telemetry_store(&temp_dir.path().join("a.shard"))?;

        store.insert(&Device::new("dev-1", "Boiler"))?;
        let size = store.size_bytes();
        let err = store.insert(&Device::new("dev-1", "Other")).unwrap_err();
        assert!(err.is_conflict());
        assert!(err.suggestion().unwrap().contains("key already exists"));
        assert_eq!(store.count("device"), 1);
        assert_eq!(store.size_bytes(), size);

        Ok(())
    }

    #[test]
    fn test_dangling_link_rejected() -> Result<()> {
        let temp_dir = tempdir()?;
        let store = telemetry_store(&temp_dir.path().join("a.shard"))?;

        let err = store.insert(&Sensor::new(Link::new(42), "temp")).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(store.count("sensor"), 0);

        Ok(())
    }

    #[test]
    fn test_batch_rolls_back_on_error() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("a.shard");
        let store = telemetry_store(&path)?;

        let result = store.commit(|batch| {
            batch.insert(&Device::new("dev-1", "A"))?;
            batch.insert(&Device::new("dev-2", "B"))?;
            batch.insert(&Device::new("dev-1", "C"))
        });
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(store.count("device"), 0);

        let id = store.insert(&Device::new("dev-1", "A"))?.id();
        assert_eq!(id, 1);
        drop(store);

        let store = ShardStore::open(&path, "a", false)?;
        assert_eq!(store.count("device"), 1);
        Ok(())
    }

    #[test]
    fn test_update_and_delete() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("a.shard");
        let store = telemetry_store(&path)?;

        let device = store.insert(&Device::new("dev-1", "Boiler"))?;
        let mut renamed = device.data().clone();
        renamed.name = "Chiller".to_string();
        store.update(device.id(), &renamed)?;
        store.delete("device", device.id())?;
        assert!(store.delete("device", device.id()).unwrap_err().is_not_found());

        let next = store.insert(&Device::new("dev-1", "Again"))?;
        assert_eq!(next.id(), 2);
        drop(store);

        let store = ShardStore::open(&path, "a", false)?;
        let devices = store.scan::<Device>()?;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id(), 2);
        assert_eq!(devices[0].name, "Again");
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_discarded() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("a.shard");

        let size = {
            let store = telemetry_store(&path)?;
            store.insert(&Device::new("dev-1", "Boiler"))?;
            store.size_bytes()
        };

        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(&[200, 0, 0, 0, 1, 2])?;
        drop(file);

        let store = ShardStore::open(&path, "a", false)?;
        assert_eq!(store.count("device"), 1);
        assert_eq!(store.size_bytes(), size);
        assert_eq!(fs::metadata(&path)?.len(), size);

        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let sensor = store.insert(&Sensor::new(Link::new(1), "temp"))?;
        store.insert(&SensorLog::new(Link::new(sensor.id()), 1.0, ts))?;
        assert_eq!(store.count("sensor_log"), 1);
        Ok(())
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("a.shard");
        {
            let store = telemetry_store(&path)?;
            store.insert(&Device::new("dev-1", "Boiler"))?;
        }

        let mut data = fs::read(&path)?;
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, data)?;

        assert!(ShardStore::open(&path, "a", false).unwrap_err().is_corruption_error());
        assert!(ShardStore::inspect(&path).unwrap_err().is_corruption_error());
        Ok(())
    }

    #[test]
    fn test_inspect_and_exclusive_lock() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("a.shard");
        let store = telemetry_store(&path)?;
        store.insert(&Device::new("dev-1", "Boiler"))?;
        store.insert(&Device::new("dev-2", "Pump"))?;

        assert_eq!(ShardStore::inspect(&path)?, 2);
        assert!(ShardStore::open(&path, "a", false).is_err());
        assert!(ShardStore::create(&path, "a", false).is_err());

        fs::write(temp_dir.path().join("junk.shard"), b"hello")?;
        assert!(ShardStore::inspect(temp_dir.path().join("junk.shard"))
            .unwrap_err()
            .is_corruption_error());
        Ok(())
    }

    #[test]
    fn test_scan_missing_table_is_empty() -> Result<()> {
        let temp_dir = tempdir()?;
        let store = ShardStore::create(temp_dir.path().join("bare.shard"), "bare", false)?;
        assert!(store.scan::<Device>()?.is_empty());
        assert_eq!(store.count("device"), 0);
        assert!(store.insert(&Device::new("dev-1", "x")).unwrap_err().to_string().contains("no table"));
        Ok(())
    }
}
