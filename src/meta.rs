use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::arena::Arena;
use crate::config::{ArenaId, Position};
use crate::error::{QueueError, QueueResult};
use crate::fs::METADATA_FILE_NAME;

/// On-disk format version this build reads and writes.
pub(crate) const FORMAT_VERSION: u64 = 1;

/// Fixed prefix of the metadata file, before the consumer directory.
pub(crate) const METADATA_FIXED_SIZE: u64 = 56;

/// Fixed part of one consumer record (name length + head aid + head offset).
pub(crate) const CONSUMER_RECORD_FIXED: u64 = 24;

const OFF_VERSION: u64 = 0;
const OFF_TAIL_AID: u64 = 8;
const OFF_TAIL_OFFSET: u64 = 16;
const OFF_HEAD_AID: u64 = 24;
const OFF_HEAD_OFFSET: u64 = 32;
const OFF_ARENA_SIZE: u64 = 40;
const OFF_NUM_CONSUMERS: u64 = 48;

/// The queue's mapped metadata file.
///
/// Layout (all fields little-endian u64):
///
/// ```text
///  0..8    version (= 1)
///  8..24   tail (aid, offset)        next byte to write
/// 24..40   queue head (aid, offset)  oldest byte still referenced
/// 40..48   arena size
/// 48..56   number of consumers
/// 56..     packed consumer records: name_len | head aid | head offset | name
/// ```
///
/// The file starts at 56 bytes and grows monotonically as consumers are
/// registered; growth truncates the file up and recreates the mapping. An
/// in-memory name to base-offset map mirrors the consumer directory.
pub(crate) struct Metadata {
    arena: Arena,
    path: PathBuf,
    size: u64,
    consumers: HashMap<String, u64>,
}

impl std::fmt::Debug for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metadata")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("consumers", &self.consumers)
            .finish()
    }
}

impl Metadata {
    /// Opens or creates `metadata.dat` inside `dir`.
    pub(crate) fn open(dir: &Path) -> QueueResult<Self> {
        let path = dir.join(METADATA_FILE_NAME);
        let existed = path.try_exists()?;
        let arena = Arena::open(&path, METADATA_FIXED_SIZE)?;
        let size = arena.len();

        let mut meta = Self {
            arena,
            path,
            size,
            consumers: HashMap::new(),
        };

        if existed {
            let found = meta.arena.read_u64_at(OFF_VERSION);
            if found != FORMAT_VERSION {
                return Err(QueueError::IncompatibleVersion {
                    found,
                    expected: FORMAT_VERSION,
                });
            }
            meta.load_consumers();
        } else {
            meta.arena.write_u64_at(OFF_VERSION, FORMAT_VERSION);
        }

        Ok(meta)
    }

    pub(crate) fn tail(&self) -> Position {
        Position::new(
            ArenaId::new(self.arena.read_u64_at(OFF_TAIL_AID)),
            self.arena.read_u64_at(OFF_TAIL_OFFSET),
        )
    }

    pub(crate) fn set_tail(&mut self, tail: Position) {
        self.arena.write_u64_at(OFF_TAIL_AID, tail.aid.as_u64());
        self.arena.write_u64_at(OFF_TAIL_OFFSET, tail.offset);
    }

    pub(crate) fn head(&self) -> Position {
        Position::new(
            ArenaId::new(self.arena.read_u64_at(OFF_HEAD_AID)),
            self.arena.read_u64_at(OFF_HEAD_OFFSET),
        )
    }

    pub(crate) fn set_head(&mut self, head: Position) {
        self.arena.write_u64_at(OFF_HEAD_AID, head.aid.as_u64());
        self.arena.write_u64_at(OFF_HEAD_OFFSET, head.offset);
    }

    pub(crate) fn arena_size(&self) -> u64 {
        self.arena.read_u64_at(OFF_ARENA_SIZE)
    }

    pub(crate) fn set_arena_size(&mut self, arena_size: u64) {
        self.arena.write_u64_at(OFF_ARENA_SIZE, arena_size);
    }

    pub(crate) fn num_consumers(&self) -> u64 {
        self.arena.read_u64_at(OFF_NUM_CONSUMERS)
    }

    fn set_num_consumers(&mut self, count: u64) {
        self.arena.write_u64_at(OFF_NUM_CONSUMERS, count);
    }

    pub(crate) fn consumer_head(&self, base: u64) -> Position {
        Position::new(
            ArenaId::new(self.arena.read_u64_at(base + 8)),
            self.arena.read_u64_at(base + 16),
        )
    }

    pub(crate) fn set_consumer_head(&mut self, base: u64, head: Position) {
        self.arena.write_u64_at(base + 8, head.aid.as_u64());
        self.arena.write_u64_at(base + 16, head.offset);
    }

    fn consumer_name_len(&self, base: u64) -> u64 {
        self.arena.read_u64_at(base)
    }

    fn consumer_name(&self, base: u64) -> String {
        let len = self.consumer_name_len(base) as usize;
        let mut buf = vec![0u8; len];
        let copied = self.arena.read_at(&mut buf, base + CONSUMER_RECORD_FIXED);
        assert_eq!(copied, len, "consumer name extends past the metadata file");
        String::from_utf8_lossy(&buf).into_owned()
    }

    pub(crate) fn has_consumer(&self, name: &str) -> bool {
        self.consumers.contains_key(name)
    }

    /// The minimum head over all registered consumers, or `None` before the
    /// first consumer exists.
    pub(crate) fn min_consumer_head(&self) -> Option<Position> {
        self.consumers
            .values()
            .map(|&base| self.consumer_head(base))
            .min()
    }

    /// Walks the persisted consumer directory into the in-memory map.
    fn load_consumers(&mut self) {
        let mut base = METADATA_FIXED_SIZE;
        for _ in 0..self.num_consumers() {
            assert!(
                base + CONSUMER_RECORD_FIXED <= self.size,
                "consumer directory exceeds the metadata file"
            );
            let name = self.consumer_name(base);
            let advance = CONSUMER_RECORD_FIXED + name.len() as u64;
            self.consumers.insert(name, base);
            base += advance;
        }
    }

    /// Returns the base offset of the consumer named `name`, registering it
    /// first when unknown. A new consumer starts at the current queue head.
    ///
    /// Registration grows the file: flush, durably truncate up by
    /// `24 + name.len()`, remap, then write the record at the old end. The
    /// caller holds the queue's write lock, so no readers observe the swap.
    pub(crate) fn get_or_create_consumer(&mut self, name: &str) -> QueueResult<u64> {
        if let Some(&base) = self.consumers.get(name) {
            return Ok(base);
        }

        self.arena.flush()?;
        let base = self.size;
        let new_size = base + CONSUMER_RECORD_FIXED + name.len() as u64;
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.set_len(new_size)?;
        file.sync_all()?;
        drop(file);
        self.arena = Arena::open(&self.path, new_size)?;
        self.size = new_size;

        self.arena.write_u64_at(base, name.len() as u64);
        let head = self.head();
        self.set_consumer_head(base, head);
        self.arena
            .write_at(name.as_bytes(), base + CONSUMER_RECORD_FIXED);
        let count = self.num_consumers() + 1;
        self.set_num_consumers(count);
        self.consumers.insert(name.to_owned(), base);

        Ok(base)
    }

    /// Msyncs the metadata mapping.
    pub(crate) fn flush(&self) -> QueueResult<()> {
        self.arena.flush()
    }
}
