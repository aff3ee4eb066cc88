//! Length-prefixed records over the arena stream.
//!
//! A record is an 8-byte little-endian length followed by that many payload
//! bytes. The length prefix is never split across two arenas: when it does
//! not fit whole, the cursor skips to the start of the next arena and the
//! trailing bytes of the previous one become dead padding. The payload, in
//! contrast, may span any number of arenas.
//!
//! Every primitive takes and returns a normalized [`Position`]; each arena
//! access goes through the manager and may load or evict mappings.

use crate::config::Position;
use crate::error::QueueResult;
use crate::manager::{ArenaManager, Pins};

/// Size of the record length prefix.
pub(crate) const LENGTH_SIZE: u64 = 8;

/// Writes the length prefix at `pos`, skipping to the next arena when the
/// eight bytes would straddle the boundary.
pub(crate) fn write_length(
    am: &mut ArenaManager,
    pins: Pins,
    mut pos: Position,
    length: u64,
) -> QueueResult<Position> {
    let arena_size = am.arena_size();
    if pos.offset + LENGTH_SIZE > arena_size {
        pos = Position::new(pos.aid.next(), 0);
    }
    am.get(pos.aid, pins)?.write_u64_at(pos.offset, length);
    pos.offset += LENGTH_SIZE;
    Ok(pos.normalize(arena_size))
}

/// Reads the length prefix at `pos`, mirroring [`write_length`]'s skip over
/// boundary padding.
pub(crate) fn read_length(
    am: &mut ArenaManager,
    pins: Pins,
    mut pos: Position,
) -> QueueResult<(Position, u64)> {
    let arena_size = am.arena_size();
    if pos.offset + LENGTH_SIZE > arena_size {
        pos = Position::new(pos.aid.next(), 0);
    }
    let length = am.get(pos.aid, pins)?.read_u64_at(pos.offset);
    pos.offset += LENGTH_SIZE;
    Ok((pos.normalize(arena_size), length))
}

/// Writes `payload` starting at `pos`, spilling across arenas as needed.
/// An empty payload is legal and moves nothing.
pub(crate) fn write_bytes(
    am: &mut ArenaManager,
    pins: Pins,
    mut pos: Position,
    mut payload: &[u8],
) -> QueueResult<Position> {
    let arena_size = am.arena_size();
    while !payload.is_empty() {
        let moved = am.get(pos.aid, pins)?.write_at(payload, pos.offset);
        payload = &payload[moved..];
        pos.offset += moved as u64;
        pos = pos.normalize(arena_size);
    }
    Ok(pos)
}

/// Reads `length` bytes starting at `pos` into an owned buffer; the mapping
/// itself never escapes to callers.
pub(crate) fn read_bytes(
    am: &mut ArenaManager,
    pins: Pins,
    mut pos: Position,
    length: u64,
) -> QueueResult<(Position, Vec<u8>)> {
    let arena_size = am.arena_size();
    let mut payload = vec![0u8; length as usize];
    let mut copied = 0;
    while copied < payload.len() {
        let moved = am.get(pos.aid, pins)?.read_at(&mut payload[copied..], pos.offset);
        copied += moved;
        pos.offset += moved as u64;
        pos = pos.normalize(arena_size);
    }
    Ok((pos, payload))
}
