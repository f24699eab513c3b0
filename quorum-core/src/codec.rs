//! Block codec: fixed-size header and status-block (de)serialization plus
//! the `BlockDevice` abstraction sector I/O is performed through.
//!
//! Wire layout is fixed little-endian, always, regardless of host
//! endianness. `to_le_bytes`/`from_le_bytes` already do the conversion
//! without a runtime branch per field.

use crate::bitmap::{Bitmap, MASK_BYTES};
use crate::error::IoFault;
use crate::types::{Msg, MsgKind, NodeId, State};

/// Magic value stamped into sector 0. Any reader that does not see this
/// exact value refuses to treat the device as ours.
pub const HEADER_MAGIC: u64 = 0x5155_4f52_554d_3031; // "QUORUM01" truncated into 8 bytes, readable in a hex dump
pub const HEADER_VERSION: u32 = 1;

/// Default reported block size. Real sector size is read back from the
/// opened device and must match the header's recorded value.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

const HEADER_LEN: usize = 8 + 4 + 16 + 4;
const STATUS_BLOCK_LEN: usize = 4 + 1 + 3 + 8 + 8 + 4 + 1 + 3 + 4 + 4 + 4 + 4 + 4 + MASK_BYTES + 4;

const _: () = assert!(STATUS_BLOCK_LEN <= DEFAULT_SECTOR_SIZE as usize, "status block must fit in one sector");
const _: () = assert!(HEADER_LEN <= DEFAULT_SECTOR_SIZE as usize, "header must fit in one sector");

/// Sector-0 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub magic: u64,
    pub version: u32,
    pub creator: [u8; 16],
    pub sector_size: u32,
}

impl Header {
    pub fn new(creator_label: &str, sector_size: u32) -> Self {
        let mut creator = [0u8; 16];
        let bytes = creator_label.as_bytes();
        let n = bytes.len().min(creator.len());
        creator[..n].copy_from_slice(&bytes[..n]);
        Self { magic: HEADER_MAGIC, version: HEADER_VERSION, creator, sector_size }
    }

    pub fn encode(&self, sector: &mut [u8]) {
        assert!(sector.len() >= HEADER_LEN);
        sector[..HEADER_LEN].fill(0);
        let mut off = 0;
        write_u64(sector, &mut off, self.magic);
        write_u32(sector, &mut off, self.version);
        sector[off..off + 16].copy_from_slice(&self.creator);
        off += 16;
        write_u32(sector, &mut off, self.sector_size);
    }

    /// Validate and decode. Returns `Err(IoFault::Device(..))`-style fatal
    /// errors through [`crate::error::Error::BadHeader`] at the call site;
    /// this function itself only reports structural validity.
    pub fn decode(sector: &[u8]) -> Option<Self> {
        if sector.len() < HEADER_LEN {
            return None;
        }
        let mut off = 0;
        let magic = read_u64(sector, &mut off);
        let version = read_u32(sector, &mut off);
        let mut creator = [0u8; 16];
        creator.copy_from_slice(&sector[off..off + 16]);
        off += 16;
        let sector_size = read_u32(sector, &mut off);
        if magic != HEADER_MAGIC || version != HEADER_VERSION {
            return None;
        }
        Some(Self { magic, version, creator, sector_size })
    }
}

/// A status block. Exactly one writer per block under normal operation
/// (the owner), with the master as the sole exception: it may overwrite a
/// peer's block to record EVICT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusBlock {
    pub node_id: NodeId,
    pub state: State,
    pub timestamp: u64,
    pub incarnation: u64,
    pub updatenode: NodeId,
    pub msg: Msg,
    pub score: u32,
    pub score_req: u32,
    pub score_max: u32,
    pub master_mask: Bitmap,
}

impl StatusBlock {
    pub fn empty(node_id: NodeId) -> Self {
        Self {
            node_id,
            state: State::None,
            timestamp: 0,
            incarnation: 0,
            updatenode: node_id,
            msg: Msg::none(),
            score: 0,
            score_req: 0,
            score_max: 0,
            master_mask: Bitmap::new(),
        }
    }

    pub fn encode(&self, sector: &mut [u8]) {
        assert!(sector.len() >= STATUS_BLOCK_LEN);
        sector[..STATUS_BLOCK_LEN].fill(0);
        let mut off = 0;
        write_u32(sector, &mut off, self.node_id);
        sector[off] = self.state as u8;
        off += 1 + 3;
        write_u64(sector, &mut off, self.timestamp);
        write_u64(sector, &mut off, self.incarnation);
        write_u32(sector, &mut off, self.updatenode);
        sector[off] = self.msg.kind.to_u8();
        off += 1 + 3;
        write_u32(sector, &mut off, self.msg.arg);
        write_u32(sector, &mut off, self.msg.seq);
        write_u32(sector, &mut off, self.score);
        write_u32(sector, &mut off, self.score_req);
        write_u32(sector, &mut off, self.score_max);
        sector[off..off + MASK_BYTES].copy_from_slice(self.master_mask.as_bytes());
        off += MASK_BYTES;
        let crc = fnv1a(&sector[..off]);
        write_u32(sector, &mut off, crc);
        debug_assert_eq!(off, STATUS_BLOCK_LEN);
    }

    /// Decode and verify the trailing checksum. A checksum mismatch most
    /// often means a write was torn by a concurrent stall; callers treat
    /// this as transient, not fatal, folding it into the observing peer's
    /// miss count rather than aborting the cycle.
    pub fn decode(sector: &[u8]) -> Result<Self, IoFault> {
        if sector.len() < STATUS_BLOCK_LEN {
            return Err(IoFault::ShortTransfer { sector: 0, expected: STATUS_BLOCK_LEN, got: sector.len() });
        }
        let body_len = STATUS_BLOCK_LEN - 4;
        let expected_crc = fnv1a(&sector[..body_len]);
        let mut off = body_len;
        let stored_crc = read_u32(sector, &mut off);
        if stored_crc != expected_crc {
            return Err(IoFault::ShortTransfer { sector: 0, expected: STATUS_BLOCK_LEN, got: sector.len() });
        }

        let mut off = 0;
        let node_id = read_u32(sector, &mut off);
        let state_raw = sector[off];
        off += 1 + 3;
        let state = State::from_u8(state_raw)
            .ok_or_else(|| IoFault::Device(std::io::Error::new(std::io::ErrorKind::InvalidData, "unknown state byte")))?;
        let timestamp = read_u64(sector, &mut off);
        let incarnation = read_u64(sector, &mut off);
        let updatenode = read_u32(sector, &mut off);
        let msg_kind_raw = sector[off];
        off += 1 + 3;
        let msg_kind = MsgKind::from_u8(msg_kind_raw)
            .ok_or_else(|| IoFault::Device(std::io::Error::new(std::io::ErrorKind::InvalidData, "unknown message kind byte")))?;
        let msg_arg = read_u32(sector, &mut off);
        let msg_seq = read_u32(sector, &mut off);
        let score = read_u32(sector, &mut off);
        let score_req = read_u32(sector, &mut off);
        let score_max = read_u32(sector, &mut off);
        let mut mask_bytes = [0u8; MASK_BYTES];
        mask_bytes.copy_from_slice(&sector[off..off + MASK_BYTES]);

        Ok(Self {
            node_id,
            state,
            timestamp,
            incarnation,
            updatenode,
            msg: Msg { kind: msg_kind, arg: msg_arg, seq: msg_seq },
            score,
            score_req,
            score_max,
            master_mask: Bitmap::from_bytes(mask_bytes),
        })
    }
}

fn write_u32(buf: &mut [u8], off: &mut usize, v: u32) {
    buf[*off..*off + 4].copy_from_slice(&v.to_le_bytes());
    *off += 4;
}

fn write_u64(buf: &mut [u8], off: &mut usize, v: u64) {
    buf[*off..*off + 8].copy_from_slice(&v.to_le_bytes());
    *off += 8;
}

fn read_u32(buf: &[u8], off: &mut usize) -> u32 {
    let v = u32::from_le_bytes(buf[*off..*off + 4].try_into().unwrap());
    *off += 4;
    v
}

fn read_u64(buf: &[u8], off: &mut usize) -> u64 {
    let v = u64::from_le_bytes(buf[*off..*off + 8].try_into().unwrap());
    *off += 8;
    v
}

/// FNV-1a over the block body. Not cryptographic; only meant to catch torn
/// writes between our own read-write pair.
fn fnv1a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in data {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Abstraction over the shared block device so the loop, tracker and
/// election engine can be exercised against an in-memory device in tests.
pub trait BlockDevice: Send {
    fn sector_size(&self) -> u32;
    fn page_size(&self) -> u32;

    /// Total sectors on the device, including sector 0 (the header). The
    /// quorum loop scans sectors `1..sector_count()` (clamped to
    /// `MAX_NODES`) for peer status blocks each cycle.
    fn sector_count(&self) -> u64;

    /// Read exactly one sector. A short read is reported as
    /// [`IoFault::ShortTransfer`], which callers treat as transient.
    fn read_sector(&mut self, index: u64, buf: &mut [u8]) -> Result<(), IoFault>;

    /// Write exactly one sector, synchronized: the call does not return
    /// until the sector is durable.
    fn write_sector(&mut self, index: u64, buf: &[u8]) -> Result<(), IoFault>;
}

/// In-memory device for tests: a flat `Vec<u8>` of sectors with optional
/// per-sector fault injection, so peer-tracker and election-engine tests
/// can simulate a stalled disk without real I/O.
pub struct MemoryDevice {
    sector_size: u32,
    sectors: Vec<Vec<u8>>,
    stalled: std::collections::HashSet<u64>,
}

impl MemoryDevice {
    pub fn new(sector_size: u32, sector_count: u64) -> Self {
        Self {
            sector_size,
            sectors: vec![vec![0u8; sector_size as usize]; sector_count as usize],
            stalled: std::collections::HashSet::new(),
        }
    }

    /// Make the next read/write of `index` fail with a transient fault,
    /// simulating a timed-out or stalled disk.
    pub fn stall(&mut self, index: u64) {
        self.stalled.insert(index);
    }

    pub fn unstall(&mut self, index: u64) {
        self.stalled.remove(&index);
    }
}

impl BlockDevice for MemoryDevice {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn page_size(&self) -> u32 {
        4096
    }

    fn sector_count(&self) -> u64 {
        self.sectors.len() as u64
    }

    fn read_sector(&mut self, index: u64, buf: &mut [u8]) -> Result<(), IoFault> {
        if self.stalled.contains(&index) {
            return Err(IoFault::ReadTimeout { sector: index });
        }
        let sector = self.sectors.get(index as usize).ok_or(IoFault::ShortTransfer {
            sector: index,
            expected: buf.len(),
            got: 0,
        })?;
        buf.copy_from_slice(sector);
        Ok(())
    }

    fn write_sector(&mut self, index: u64, buf: &[u8]) -> Result<(), IoFault> {
        if self.stalled.contains(&index) {
            return Err(IoFault::WriteTimeout { sector: index });
        }
        let sector = self.sectors.get_mut(index as usize).ok_or(IoFault::ShortTransfer {
            sector: index,
            expected: buf.len(),
            got: 0,
        })?;
        sector.copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = Header::new("node-a", 512);
        let mut sector = vec![0u8; 512];
        h.encode(&mut sector);
        let decoded = Header::decode(&sector).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn header_with_bad_magic_is_rejected() {
        let mut sector = vec![0u8; 512];
        sector[0] = 0xff;
        assert!(Header::decode(&sector).is_none());
    }

    #[test]
    fn status_block_round_trips() {
        let mut block = StatusBlock::empty(3);
        block.state = State::Master;
        block.timestamp = 123456;
        block.incarnation = 99;
        block.updatenode = 3;
        block.msg = Msg::ack(1, 7);
        block.score = 10;
        block.score_req = 6;
        block.score_max = 12;
        block.master_mask = Bitmap::from_nodes([1, 2, 3]);

        let mut sector = vec![0u8; 512];
        block.encode(&mut sector);
        let decoded = StatusBlock::decode(&sector).unwrap();
        assert_eq!(block, decoded);
    }

    #[test]
    fn corrupted_checksum_is_reported_as_transient() {
        let block = StatusBlock::empty(1);
        let mut sector = vec![0u8; 512];
        block.encode(&mut sector);
        sector[10] ^= 0xff;
        let err = StatusBlock::decode(&sector).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn memory_device_stall_reports_transient_read_timeout() {
        let mut dev = MemoryDevice::new(512, 4);
        dev.stall(2);
        let mut buf = vec![0u8; 512];
        let err = dev.read_sector(2, &mut buf).unwrap_err();
        assert!(err.is_transient());
        dev.unstall(2);
        assert!(dev.read_sector(2, &mut buf).is_ok());
    }
}
