//! Disk / CD-ROM / floppy over a host image file.
//!
//! The node itself is register-stateless: an optional `reg` window exposes
//! the image as flat bytes, and every access goes straight to the file.
//! Logical consumers use instances, which add a cursor and a partition
//! overlay parsed from the DOS label in sector 0 (`create_instance` args:
//! `""`/`"0"` for the whole medium, `"1".."4"` for a primary partition).
//!
//! A write to read-only media or a read-only instance fails without moving
//! the cursor. The `#blocks` method is a deliberately unimplemented
//! placeholder and reports unsupported.

use arbor_tree::{
    Access, AddressSpace, Device, HwModel, InstanceModel, Ioctl, Result, TreeError,
};
use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;
use tracing::{debug, warn};

const DOS_LABEL_MAGIC: [u8; 2] = [0x55, 0xAA];
const DOS_PARTITION_TABLE: usize = 446;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Media {
    Disk,
    Cdrom,
    Floppy,
}

impl Media {
    fn parse(text: &str) -> Option<Media> {
        Some(match text {
            "disk" => Media::Disk,
            "cdrom" => Media::Cdrom,
            "floppy" => Media::Floppy,
            _ => return None,
        })
    }

    fn default_block_size(self) -> u64 {
        match self {
            Media::Cdrom => 2048,
            Media::Disk | Media::Floppy => 512,
        }
    }
}

struct DiskState {
    media: Media,
    block_size: u64,
    read_only: bool,
    size: u64,
    file: Option<File>,
}

impl DiskState {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> usize {
        let Some(file) = self.file.as_mut() else {
            return 0;
        };
        if offset >= self.size {
            return 0;
        }
        let len = buf.len().min((self.size - offset) as usize);
        let take = &mut buf[..len];
        match file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.read(take))
        {
            Ok(n) => n,
            Err(err) => {
                warn!(%err, "disk image read failed");
                0
            }
        }
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> usize {
        if self.read_only {
            return 0;
        }
        let Some(file) = self.file.as_mut() else {
            return 0;
        };
        if offset >= self.size {
            return 0;
        }
        let len = buf.len().min((self.size - offset) as usize);
        match file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.write(&buf[..len]))
        {
            Ok(n) => n,
            Err(err) => {
                warn!(%err, "disk image write failed");
                0
            }
        }
    }

    /// Byte extent of a DOS-label primary partition (1-based index).
    fn partition(&mut self, index: u8) -> Option<(u64, u64)> {
        let mut sector = [0u8; 512];
        if self.read_at(0, &mut sector) != sector.len() {
            return None;
        }
        if sector[510..512] != DOS_LABEL_MAGIC {
            return None;
        }
        let entry = DOS_PARTITION_TABLE + usize::from(index - 1) * 16;
        let kind = sector[entry + 4];
        if kind == 0 {
            return None;
        }
        let lba = u32::from_le_bytes(sector[entry + 8..entry + 12].try_into().unwrap());
        let count = u32::from_le_bytes(sector[entry + 12..entry + 16].try_into().unwrap());
        Some((u64::from(lba) * 512, u64::from(count) * 512))
    }
}

pub struct HwDisk {
    state: Rc<RefCell<DiskState>>,
    base: u64,
}

impl HwDisk {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(DiskState {
                media: Media::Disk,
                block_size: 512,
                read_only: false,
                size: 0,
                file: None,
            })),
            base: 0,
        }
    }

    fn open(dev: &Device<'_>, path: &str, read_only: bool) -> Result<(File, u64)> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(|source| TreeError::HostIo {
                path: dev.path(),
                source,
            })?;
        let size = file
            .metadata()
            .map_err(|source| TreeError::HostIo {
                path: dev.path(),
                source,
            })?
            .len();
        Ok((file, size))
    }
}

impl Default for HwDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl HwModel for HwDisk {
    fn model_name(&self) -> &'static str {
        "disk"
    }

    fn init_address(&mut self, dev: Device<'_>) -> Result<()> {
        // The register window is optional; instance-only disks (e.g. behind
        // an IDE controller) have no reg.
        if dev.has_property("reg") {
            let ranges = dev.attach_reg_ranges(Access::RW, false)?;
            self.base = ranges[0].1;
        }
        Ok(())
    }

    fn init_data(&mut self, dev: Device<'_>) -> Result<()> {
        let media_text = dev.find_string_opt("media")?.unwrap_or_else(|| "disk".to_owned());
        let media = Media::parse(&media_text).ok_or_else(|| TreeError::Config {
            path: dev.path(),
            reason: format!("unknown media type \"{media_text}\""),
        })?;
        let read_only = media == Media::Cdrom || dev.find_integer_or("read-only", 0)? != 0;
        let block_size = dev.find_integer_or("block-size", media.default_block_size())?;
        let path = dev.find_string("file")?;
        let (file, size) = Self::open(&dev, &path, read_only)?;

        let mut state = self.state.borrow_mut();
        state.media = media;
        state.block_size = block_size;
        state.read_only = read_only;
        state.size = size;
        state.file = Some(file);
        Ok(())
    }

    fn io_read(&mut self, _dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        self.state.borrow_mut().read_at(addr - self.base, buf)
    }

    fn io_write(&mut self, dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &[u8]) -> usize {
        let mut state = self.state.borrow_mut();
        if state.read_only {
            debug!(dev = %dev.path(), "write to read-only medium dropped");
            return 0;
        }
        state.write_at(addr - self.base, buf)
    }

    fn create_instance(&mut self, dev: Device<'_>, args: &str) -> Result<Box<dyn InstanceModel>> {
        let mut state = self.state.borrow_mut();
        let (start, len, read_only) = match args {
            "" | "0" => (0, state.size, state.read_only),
            text => {
                let index: u8 = text.parse().ok().filter(|n| (1..=4).contains(n)).ok_or_else(
                    || TreeError::Config {
                        path: dev.path(),
                        reason: format!("invalid partition \"{text}\""),
                    },
                )?;
                // CD-ROM images carry no DOS label; the whole medium it is.
                if state.media == Media::Cdrom {
                    (0, state.size, true)
                } else {
                    let (start, len) =
                        state.partition(index).ok_or_else(|| TreeError::Config {
                            path: dev.path(),
                            reason: format!("no partition {index} in the disk label"),
                        })?;
                    (start, len, state.read_only)
                }
            }
        };
        drop(state);

        Ok(Box::new(DiskInstance {
            state: self.state.clone(),
            start,
            len,
            read_only,
            pos: 0,
        }))
    }

    fn ioctl(&mut self, dev: Device<'_>, request: Ioctl<'_>) -> Result<u64> {
        match request {
            Ioctl::ChangeMedia { path } => {
                let mut state = self.state.borrow_mut();
                match path {
                    Some(path) => {
                        let read_only = state.read_only;
                        let (file, size) = Self::open(&dev, path, read_only)?;
                        state.file = Some(file);
                        state.size = size;
                    }
                    None => {
                        state.file = None;
                        state.size = 0;
                    }
                }
                Ok(0)
            }
            _ => Err(TreeError::Unsupported {
                path: dev.path(),
                model: self.model_name(),
                capability: "ioctl",
            }),
        }
    }
}

struct DiskInstance {
    state: Rc<RefCell<DiskState>>,
    start: u64,
    len: u64,
    read_only: bool,
    pos: u64,
}

impl InstanceModel for DiskInstance {
    fn read(&mut self, _dev: Device<'_>, buf: &mut [u8]) -> Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let take = buf.len().min((self.len - self.pos) as usize);
        let n = self
            .state
            .borrow_mut()
            .read_at(self.start + self.pos, &mut buf[..take]);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, dev: Device<'_>, buf: &[u8]) -> Result<usize> {
        if self.read_only {
            // The cursor must not move on a refused write.
            return Err(TreeError::Config {
                path: dev.path(),
                reason: "write to a read-only medium or partition".to_owned(),
            });
        }
        if self.pos >= self.len {
            return Ok(0);
        }
        let take = buf.len().min((self.len - self.pos) as usize);
        let n = self
            .state
            .borrow_mut()
            .write_at(self.start + self.pos, &buf[..take]);
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, _dev: Device<'_>, pos: u64) -> Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn call_method(&mut self, dev: Device<'_>, method: &str, args: &[u64]) -> Result<Vec<u64>> {
        let _ = args;
        match method {
            "block-size" => Ok(vec![self.state.borrow().block_size]),
            "max-transfer" => Ok(vec![0x1_0000]),
            "size" => Ok(vec![self.len]),
            // Documented placeholder, kept unimplemented on purpose.
            "#blocks" => Err(TreeError::Unsupported {
                path: dev.path(),
                model: "disk",
                capability: "#blocks",
            }),
            other => Err(TreeError::Config {
                path: dev.path(),
                reason: format!("disk instance has no \"{other}\" method"),
            }),
        }
    }
}
