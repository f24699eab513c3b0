//! Real `BlockDevice` backed by a file or block special device.
//!
//! This lives in the binary crate, not `quorum-core`, since it is the
//! one piece of real process-level I/O the core deliberately stays free
//! of.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use quorum_core::{BlockDevice, IoFault};

/// Opens `path` for sector-addressed reads and writes, each write synced
/// before returning so writes are atomic at sector granularity.
pub struct FileBlockDevice {
    file: File,
    sector_size: u32,
    sector_count: u64,
}

impl FileBlockDevice {
    pub fn open(path: &str, sector_size: u32) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let sector_count = len / sector_size as u64;
        Ok(Self { file, sector_size, sector_count })
    }
}

impl BlockDevice for FileBlockDevice {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn page_size(&self) -> u32 {
        4096
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sector(&mut self, index: u64, buf: &mut [u8]) -> Result<(), IoFault> {
        if index >= self.sector_count {
            return Err(IoFault::ShortTransfer { sector: index, expected: buf.len(), got: 0 });
        }
        self.file.seek(SeekFrom::Start(index * self.sector_size as u64)).map_err(IoFault::Device)?;
        let n = self.file.read(buf).map_err(IoFault::Device)?;
        if n != buf.len() {
            return Err(IoFault::ShortTransfer { sector: index, expected: buf.len(), got: n });
        }
        Ok(())
    }

    fn write_sector(&mut self, index: u64, buf: &[u8]) -> Result<(), IoFault> {
        if index >= self.sector_count {
            return Err(IoFault::ShortTransfer { sector: index, expected: buf.len(), got: 0 });
        }
        self.file.seek(SeekFrom::Start(index * self.sector_size as u64)).map_err(IoFault::Device)?;
        self.file.write_all(buf).map_err(IoFault::Device)?;
        self.file.sync_data().map_err(IoFault::Device)?;
        Ok(())
    }
}
