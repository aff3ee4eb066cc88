use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::arena::Arena;
use crate::config::ArenaId;
use crate::error::QueueResult;
use crate::fs::arena_file_path;

/// Arenas that must never be evicted while an operation is in flight: the
/// arena holding the queue head (minimum consumer head) and the tail arena.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Pins {
    pub(crate) head: ArenaId,
    pub(crate) tail: ArenaId,
}

/// A mapped arena plus the manager's dirty flag for it.
///
/// Write accessors raise the flag; `flush` in the manager lowers it again
/// after msync. Read accessors leave it alone.
pub(crate) struct MappedArena {
    arena: Arena,
    dirty: bool,
}

impl MappedArena {
    #[inline]
    pub(crate) fn read_u64_at(&self, offset: u64) -> u64 {
        self.arena.read_u64_at(offset)
    }

    #[inline]
    pub(crate) fn write_u64_at(&mut self, offset: u64, value: u64) {
        self.arena.write_u64_at(offset, value);
        self.dirty = true;
    }

    #[inline]
    pub(crate) fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        self.arena.read_at(buf, offset)
    }

    #[inline]
    pub(crate) fn write_at(&mut self, buf: &[u8], offset: u64) -> usize {
        self.dirty = true;
        self.arena.write_at(buf, offset)
    }

    #[cfg(test)]
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Owns the set of live arenas for one queue.
///
/// Arenas are mapped on demand, evicted when a configured cap would be
/// exceeded, and their backing files are deleted once every consumer's head
/// has moved past them. All calls happen under the queue's write lock.
pub(crate) struct ArenaManager {
    dir: PathBuf,
    arena_size: u64,
    max_in_memory: usize,
    arenas: BTreeMap<u64, MappedArena>,
    /// Highest arena id ever requested; requests may extend it by one.
    top_aid: ArenaId,
    /// Every arena id below this has been unmapped and its file deleted.
    gc_floor: ArenaId,
}

impl ArenaManager {
    /// Creates the manager and eagerly maps the queue-head and tail arenas,
    /// the two extremes every workload keeps touching.
    pub(crate) fn new(
        dir: &Path,
        arena_size: u64,
        max_in_memory: usize,
        head: ArenaId,
        tail: ArenaId,
    ) -> QueueResult<Self> {
        let mut manager = Self {
            dir: dir.to_path_buf(),
            arena_size,
            max_in_memory,
            arenas: BTreeMap::new(),
            top_aid: tail,
            gc_floor: ArenaId::new(0),
        };
        let pins = Pins { head, tail };
        manager.get(head, pins)?;
        manager.get(tail, pins)?;
        Ok(manager)
    }

    /// Number of arenas currently mapped.
    pub(crate) fn in_memory(&self) -> usize {
        self.arenas.len()
    }

    #[inline]
    pub(crate) fn arena_size(&self) -> u64 {
        self.arena_size
    }

    /// Returns the arena for `aid`, mapping it in when absent.
    ///
    /// A miss first garbage-collects files behind the queue head, then makes
    /// room under the cap, then maps the file (creating it lazily).
    ///
    /// # Panics
    ///
    /// Requesting an id more than one past the highest id seen so far means
    /// a cursor escaped the tail; that is a bug, not a runtime condition.
    pub(crate) fn get(&mut self, aid: ArenaId, pins: Pins) -> QueueResult<&mut MappedArena> {
        assert!(
            aid <= self.top_aid.next(),
            "arena {aid} requested beyond the tail arena {}",
            self.top_aid,
        );
        if aid > self.top_aid {
            self.top_aid = aid;
        }

        if !self.arenas.contains_key(&aid.as_u64()) {
            self.gc(pins.head)?;
            self.make_room(pins)?;
            let arena = Arena::open(&arena_file_path(&self.dir, aid), self.arena_size)?;
            debug!(aid = aid.as_u64(), "mapped arena");
            self.arenas
                .insert(aid.as_u64(), MappedArena { arena, dirty: false });
        }

        Ok(self
            .arenas
            .get_mut(&aid.as_u64())
            .expect("arena mapped above"))
    }

    /// Unmaps and deletes every arena strictly behind the queue head.
    /// Deleting a file that is already gone is not an error.
    pub(crate) fn gc(&mut self, head: ArenaId) -> QueueResult<()> {
        while self.gc_floor < head {
            let aid = self.gc_floor;
            self.arenas.remove(&aid.as_u64());
            match fs::remove_file(arena_file_path(&self.dir, aid)) {
                Ok(()) => debug!(aid = aid.as_u64(), "deleted consumed arena file"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            self.gc_floor = aid.next();
        }
        Ok(())
    }

    /// Evicts mapped arenas, highest id first, until one more can be mapped
    /// without exceeding the cap. The pinned head and tail arenas are never
    /// victims. Dirty victims are flushed before they are unmapped.
    fn make_room(&mut self, pins: Pins) -> QueueResult<()> {
        if self.max_in_memory == 0 {
            return Ok(());
        }

        while self.arenas.len() + 1 > self.max_in_memory {
            let victim = self
                .arenas
                .keys()
                .rev()
                .copied()
                .find(|&aid| aid != pins.head.as_u64() && aid != pins.tail.as_u64())
                .unwrap_or_else(|| panic!("no evictable arena below the cap of {}", self.max_in_memory));
            let mapped = self.arenas.remove(&victim).expect("victim is mapped");
            if mapped.dirty {
                mapped.arena.flush()?;
            }
            debug!(aid = victim, "evicted arena");
        }

        Ok(())
    }

    /// Msyncs every dirty mapped arena and lowers its flag.
    pub(crate) fn flush(&mut self) -> QueueResult<()> {
        for mapped in self.arenas.values_mut() {
            if mapped.dirty {
                mapped.arena.flush()?;
                mapped.dirty = false;
            }
        }
        Ok(())
    }

    /// Unmaps every arena. Files stay on disk; the last flush error wins.
    pub(crate) fn close(&mut self) -> QueueResult<()> {
        let mut result = Ok(());
        for mapped in self.arenas.values() {
            if mapped.dirty {
                if let Err(err) = mapped.arena.flush() {
                    result = Err(err);
                }
            }
        }
        self.arenas.clear();
        result
    }

    #[cfg(test)]
    pub(crate) fn is_mapped(&self, aid: ArenaId) -> bool {
        self.arenas.contains_key(&aid.as_u64())
    }
}
