//! Leaf devices: block storage plus the ops that drive it.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use log::{debug, error, trace};
use parking_lot::{Mutex, RwLock};

use crate::common::exception::ZioError;
use crate::storage::zio::{ActiveZio, IoctlCmd, ZioType};

use super::VdevOps;

/// Raw block storage behind a leaf.
pub trait BlockDevice: Send + Sync {
    fn size(&self) -> u64;

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;

    fn flush(&self) -> io::Result<()>;

    /// Discards a range. Later reads of it may return anything.
    fn trim(&self, offset: u64, len: u64) -> io::Result<()>;
}

fn check_bounds(size: u64, offset: u64, len: usize) -> io::Result<usize> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(offset as usize),
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("{} bytes at offset {} exceed device size {}", len, offset, size),
        )),
    }
}

/// A device held entirely in memory.
pub struct MemoryDisk {
    memory: RwLock<Vec<u8>>,
}

impl MemoryDisk {
    pub fn new(size: u64) -> Self {
        Self {
            memory: RwLock::new(vec![0; size as usize]),
        }
    }
}

impl BlockDevice for MemoryDisk {
    fn size(&self) -> u64 {
        self.memory.read().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let memory = self.memory.read();
        let start = check_bounds(memory.len() as u64, offset, buf.len())?;
        buf.copy_from_slice(&memory[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut memory = self.memory.write();
        let start = check_bounds(memory.len() as u64, offset, buf.len())?;
        memory[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn trim(&self, offset: u64, len: u64) -> io::Result<()> {
        let mut memory = self.memory.write();
        let start = check_bounds(memory.len() as u64, offset, len as usize)?;
        memory[start..start + len as usize].fill(0);
        Ok(())
    }
}

/// A device backed by a regular file, extended to `size` on open.
pub struct FileDisk {
    file: Mutex<File>,
    size: u64,
}

impl FileDisk {
    pub fn open(path: impl AsRef<Path>, size: u64) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < size {
            file.set_len(size)?;
        }
        debug!("Opened file device {} ({} bytes)", path.display(), size);
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

impl BlockDevice for FileDisk {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_bounds(self.size, offset, buf.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        check_bounds(self.size, offset, buf.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    fn flush(&self) -> io::Result<()> {
        let mut file = self.file.lock();
        file.flush()?;
        file.sync_data()
    }

    fn trim(&self, offset: u64, len: u64) -> io::Result<()> {
        check_bounds(self.size, offset, len as usize)?;
        Ok(())
    }
}

/// Ops for a leaf: performs the transfer on the calling thread and delivers
/// the completion through the device's fault injector.
pub struct DiskOps {
    device: Arc<dyn BlockDevice>,
}

impl DiskOps {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self { device }
    }

    fn transfer(&self, zio: &ActiveZio<'_>) -> Result<(), ZioError> {
        let Some(vd) = zio.vd() else {
            return Err(ZioError::NotSupported);
        };
        let faults = vd.faults();
        let offset = zio.offset();
        let len = zio.size() as usize;

        let result = match zio.io_type() {
            ZioType::Read => {
                if faults.take_read_failure() {
                    return Err(ZioError::Io);
                }
                let read = zio
                    .data()
                    .with_slice_mut(|s| self.device.read_at(offset, &mut s[..len]));
                if read.is_ok() && len > 0 && faults.take_corruption() {
                    trace!("corrupting read of vdev {} at {}", vd.id(), offset);
                    zio.data().with_slice_mut(|s| s[len / 2] ^= 0x40);
                }
                read
            }
            ZioType::Write => {
                if faults.take_write_failure() {
                    return Err(ZioError::Io);
                }
                zio.data()
                    .with_slice(|s| self.device.write_at(offset, &s[..len]))
            }
            ZioType::Trim => self.device.trim(offset, len as u64),
            ZioType::Ioctl => match zio.ioctl() {
                Some(IoctlCmd::FlushCache) => self.device.flush(),
                None => return Err(ZioError::NotSupported),
            },
            _ => return Err(ZioError::NotSupported),
        };

        result.map_err(|e| {
            error!("vdev {}: {:?} at offset {} failed: {}", vd.id(), zio.io_type(), offset, e);
            ZioError::Io
        })
    }
}

impl VdevOps for DiskOps {
    fn io_start(&self, zio: &mut ActiveZio<'_>) {
        let Some(vd) = zio.vd().cloned() else {
            return;
        };
        let done = zio.begin_device_io();
        let result = self.transfer(zio);
        if result.is_err() {
            vd.stats().record_error(zio.io_type());
        }
        vd.faults().deliver(done, result);
    }

    fn io_done(&self, _zio: &mut ActiveZio<'_>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn memory_disk_round_trip_and_bounds() {
        let disk = MemoryDisk::new(4096);
        disk.write_at(512, &[7u8; 512]).unwrap();
        let mut buf = [0u8; 512];
        disk.read_at(512, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 512]);
        assert!(disk.read_at(4000, &mut buf).is_err());
        disk.trim(512, 512).unwrap();
        disk.read_at(512, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 512]);
    }

    #[test]
    fn file_disk_persists_across_opens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk0");
        {
            let disk = FileDisk::open(&path, 1 << 16).unwrap();
            disk.write_at(4096, b"persisted").unwrap();
            disk.flush().unwrap();
        }
        let disk = FileDisk::open(&path, 1 << 16).unwrap();
        let mut buf = [0u8; 9];
        disk.read_at(4096, &mut buf).unwrap();
        assert_eq!(&buf, b"persisted");
        assert_eq!(disk.size(), 1 << 16);
    }
}
