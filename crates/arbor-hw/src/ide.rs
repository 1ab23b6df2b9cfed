//! IDE controller.
//!
//! Channels are described by `reg` pairs: an 8-byte command block and an
//! 8-byte control block per channel. Drives are child `disk` nodes whose
//! unit address is `channel * 2 + drive`; the controller reaches them
//! through device instances, never through their registers.
//!
//! Transfers run the classic cycle: a command primes the sector FIFO
//! *immediately* (so the data register already yields the first block while
//! the busy delay is still pending), the `ready-delay` event then clears BSY
//! and raises the channel interrupt, and draining the FIFO loads the next
//! block, busy again, until the request is done.
//!
//! Command block (offsets from the command base): data, error/features,
//! sector count, LBA low/mid/high, device, status/command. Control block:
//! alternate status / device control at +0, DMA buffer address (u32) at +4.

use arbor_tree::{
    Access, AddressSpace, Device, EventHandle, HwModel, Instance, Result, TreeError,
};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

const STATUS_BSY: u8 = 0x80;
const STATUS_DRDY: u8 = 0x40;
const STATUS_DSC: u8 = 0x10;
const STATUS_DRQ: u8 = 0x08;
const STATUS_ERR: u8 = 0x01;

const ERROR_ABRT: u8 = 0x04;
const ERROR_IDNF: u8 = 0x10;

const CTRL_NIEN: u8 = 0x02;
const CTRL_SRST: u8 = 0x04;

const REG_DATA: u64 = 0;
const REG_ERROR_FEATURES: u64 = 1;
const REG_SECTOR_COUNT: u64 = 2;
const REG_LBA0: u64 = 3;
const REG_LBA1: u64 = 4;
const REG_LBA2: u64 = 5;
const REG_DEVICE: u64 = 6;
const REG_STATUS_COMMAND: u64 = 7;

const CTRL_REG_ALT_STATUS: u64 = 0;
const CTRL_REG_DMA_ADDR: u64 = 4;

const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;
const CMD_SEEK: u8 = 0x70;
const CMD_RECALIBRATE: u8 = 0x10;
const CMD_IDENTIFY: u8 = 0xEC;
const CMD_READ_DMA: u8 = 0xC8;
const CMD_WRITE_DMA: u8 = 0xCA;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    None,
    /// Drive to host through the data register.
    PioIn,
    /// Host to drive through the data register.
    PioOut,
}

struct Drive {
    instance: Instance,
    block_size: u64,
    total_blocks: u64,
}

#[derive(Default)]
struct Channel {
    cmd_base: u64,
    ctrl_base: u64,

    error: u8,
    features: u8,
    sector_count: u8,
    lba0: u8,
    lba1: u8,
    lba2: u8,
    device: u8,
    status: u8,
    devctl: u8,
    dma_addr: u32,

    fifo: Vec<u8>,
    fifo_pos: usize,
    /// Expected block length of a host-to-drive PIO transfer.
    pio_block: usize,
    transfer: Transfer,
    /// Sectors still to move after the one in the FIFO.
    remaining: u32,
    lba: u64,

    irq: bool,
    event: Option<EventHandle>,

    drives: [Option<Drive>; 2],
}

impl Default for Transfer {
    fn default() -> Self {
        Transfer::None
    }
}

impl Channel {
    fn selected(&self) -> usize {
        usize::from(self.device >> 4 & 1)
    }

    fn lba28(&self) -> u64 {
        u64::from(self.device & 0x0F) << 24
            | u64::from(self.lba2) << 16
            | u64::from(self.lba1) << 8
            | u64::from(self.lba0)
    }

    fn request_sectors(&self) -> u32 {
        match self.sector_count {
            0 => 256,
            n => u32::from(n),
        }
    }

    fn abort(&mut self, error: u8) {
        self.status = STATUS_DRDY | STATUS_ERR;
        self.error = error;
        self.transfer = Transfer::None;
        self.fifo.clear();
        self.fifo_pos = 0;
        self.irq = true;
    }

    fn srst(&mut self) {
        self.error = 0;
        self.status = STATUS_DRDY | STATUS_DSC;
        self.transfer = Transfer::None;
        self.fifo.clear();
        self.fifo_pos = 0;
        self.pio_block = 0;
        self.remaining = 0;
        self.irq = false;
    }

    fn irq_pin(&self) -> bool {
        self.irq && self.devctl & CTRL_NIEN == 0
    }
}

struct IdeState {
    ready_delay: u64,
    channels: Vec<Channel>,
}

pub struct HwIde {
    state: Rc<RefCell<IdeState>>,
}

impl HwIde {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(IdeState {
                ready_delay: 0,
                channels: Vec::new(),
            })),
        }
    }

    fn sync_irq(state_rc: &Rc<RefCell<IdeState>>, dev: &Device<'_>, channel: usize) {
        let level = state_rc.borrow().channels[channel].irq_pin();
        dev.set_interrupt(channel as u32, level);
    }

    /// Clears BSY after the ready delay and raises the channel interrupt.
    fn schedule_ready(state_rc: &Rc<RefCell<IdeState>>, dev: &Device<'_>, channel: usize) {
        let mut state = state_rc.borrow_mut();
        let delay = state.ready_delay;
        let ch = &mut state.channels[channel];
        if let Some(handle) = ch.event.take() {
            dev.deschedule(handle);
        }
        let rc = state_rc.clone();
        ch.event = Some(dev.schedule(delay, move |dev: Device<'_>| {
            {
                let mut state = rc.borrow_mut();
                let ch = &mut state.channels[channel];
                ch.event = None;
                ch.status &= !STATUS_BSY;
                ch.irq = true;
            }
            Self::sync_irq(&rc, &dev, channel);
        }));
    }

    fn identify_block(drive: &Drive) -> Vec<u8> {
        let mut words = [0u16; 256];
        words[0] = 0x0040; // fixed device
        let model = b"ARBOR IDE DRIVE                         ";
        for (i, pair) in model.chunks(2).take(20).enumerate() {
            // ATA strings swap bytes within each word.
            words[27 + i] = u16::from(pair[0]) << 8 | u16::from(pair[1]);
        }
        words[49] = 1 << 9; // LBA supported
        let sectors = drive.total_blocks.min(u64::from(u32::MAX)) as u32;
        words[60] = sectors as u16;
        words[61] = (sectors >> 16) as u16;
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn start_command(&mut self, dev: &Device<'_>, channel: usize, command: u8) {
        {
            let mut state = self.state.borrow_mut();
            let ch = &mut state.channels[channel];
            if ch.status & STATUS_BSY != 0 {
                debug!(dev = %dev.path(), command, "command while busy ignored");
                return;
            }
            ch.error = 0;
            ch.irq = false;
        }

        match command {
            CMD_READ_SECTORS => {
                let mut state = self.state.borrow_mut();
                let ch = &mut state.channels[channel];
                ch.lba = ch.lba28();
                ch.remaining = ch.request_sectors() - 1;
                ch.transfer = Transfer::PioIn;
                ch.status = STATUS_DRDY | STATUS_DSC | STATUS_BSY | STATUS_DRQ;
                let primed = Self::load_sector_inner(ch, dev);
                drop(state);
                if primed {
                    Self::schedule_ready(&self.state, dev, channel);
                }
            }
            CMD_WRITE_SECTORS => {
                let mut state = self.state.borrow_mut();
                let ch = &mut state.channels[channel];
                ch.lba = ch.lba28();
                ch.remaining = ch.request_sectors() - 1;
                ch.transfer = Transfer::PioOut;
                let block = match ch.drives[ch.selected()].as_ref() {
                    Some(drive) => drive.block_size as usize,
                    None => {
                        ch.abort(ERROR_ABRT);
                        return;
                    }
                };
                // The first DRQ block is accepted without an interrupt.
                ch.fifo = Vec::new();
                ch.pio_block = block;
                ch.status = STATUS_DRDY | STATUS_DSC | STATUS_DRQ;
            }
            CMD_IDENTIFY => {
                let mut state = self.state.borrow_mut();
                let ch = &mut state.channels[channel];
                let Some(drive) = ch.drives[ch.selected()].as_ref() else {
                    ch.abort(ERROR_ABRT);
                    return;
                };
                ch.fifo = Self::identify_block(drive);
                ch.fifo_pos = 0;
                ch.remaining = 0;
                ch.transfer = Transfer::PioIn;
                ch.status = STATUS_DRDY | STATUS_DSC | STATUS_BSY | STATUS_DRQ;
                drop(state);
                Self::schedule_ready(&self.state, dev, channel);
            }
            CMD_SEEK | CMD_RECALIBRATE => {
                let mut state = self.state.borrow_mut();
                let ch = &mut state.channels[channel];
                ch.status = STATUS_DRDY | STATUS_DSC | STATUS_BSY;
                drop(state);
                Self::schedule_ready(&self.state, dev, channel);
            }
            CMD_READ_DMA => {
                let mut state = self.state.borrow_mut();
                let ch = &mut state.channels[channel];
                ch.lba = ch.lba28();
                ch.status = STATUS_DRDY | STATUS_DSC | STATUS_BSY;
                let sectors = ch.request_sectors();
                let lba = ch.lba;
                let addr = u64::from(ch.dma_addr);
                drop(state);

                let rc = self.state.clone();
                let delay = rc.borrow().ready_delay;
                let handle = dev.schedule(delay, move |dev: Device<'_>| {
                    let done = {
                        let mut state = rc.borrow_mut();
                        Self::dma_read_sectors(&mut state, &dev, channel, lba, sectors, addr)
                    };
                    let mut state = rc.borrow_mut();
                    let ch = &mut state.channels[channel];
                    ch.event = None;
                    if done {
                        ch.status = STATUS_DRDY | STATUS_DSC;
                        ch.irq = true;
                    }
                    drop(state);
                    Self::sync_irq(&rc, &dev, channel);
                });
                self.state.borrow_mut().channels[channel].event = Some(handle);
            }
            CMD_WRITE_DMA => {
                let mut state = self.state.borrow_mut();
                let ch = &mut state.channels[channel];
                ch.lba = ch.lba28();
                ch.status = STATUS_DRDY | STATUS_DSC | STATUS_BSY;
                let sectors = ch.request_sectors();
                let lba = ch.lba;
                let addr = u64::from(ch.dma_addr);
                drop(state);

                let rc = self.state.clone();
                let delay = rc.borrow().ready_delay;
                let handle = dev.schedule(delay, move |dev: Device<'_>| {
                    let done = {
                        let mut state = rc.borrow_mut();
                        Self::dma_write_sectors(&mut state, &dev, channel, lba, sectors, addr)
                    };
                    let mut state = rc.borrow_mut();
                    let ch = &mut state.channels[channel];
                    ch.event = None;
                    if done {
                        ch.status = STATUS_DRDY | STATUS_DSC;
                        ch.irq = true;
                    }
                    drop(state);
                    Self::sync_irq(&rc, &dev, channel);
                });
                self.state.borrow_mut().channels[channel].event = Some(handle);
            }
            other => {
                debug!(dev = %dev.path(), command = other, "unknown ide command");
                self.state.borrow_mut().channels[channel].abort(ERROR_ABRT);
                Self::sync_irq(&self.state, dev, channel);
            }
        }
    }

    /// Drive-to-memory transfer of a whole DMA request.
    fn dma_read_sectors(
        state: &mut IdeState,
        dev: &Device<'_>,
        channel: usize,
        lba: u64,
        sectors: u32,
        mut addr: u64,
    ) -> bool {
        let ch = &mut state.channels[channel];
        for i in 0..u64::from(sectors) {
            ch.lba = lba + i;
            if !Self::load_sector_inner(ch, dev) {
                return false;
            }
            let fifo = std::mem::take(&mut ch.fifo);
            if dev.dma_write(0, addr, &fifo, false) != fifo.len() {
                ch.abort(ERROR_ABRT);
                return false;
            }
            addr += fifo.len() as u64;
        }
        true
    }

    /// Memory-to-drive transfer of a whole DMA request.
    fn dma_write_sectors(
        state: &mut IdeState,
        dev: &Device<'_>,
        channel: usize,
        lba: u64,
        sectors: u32,
        mut addr: u64,
    ) -> bool {
        let ch = &mut state.channels[channel];
        for i in 0..u64::from(sectors) {
            let block = match ch.drives[ch.selected()].as_ref() {
                Some(drive) => drive.block_size as usize,
                None => {
                    ch.abort(ERROR_ABRT);
                    return false;
                }
            };
            let mut buf = vec![0u8; block];
            if dev.dma_read(0, addr, &mut buf) != block {
                ch.abort(ERROR_ABRT);
                return false;
            }
            ch.fifo = buf;
            ch.lba = lba + i;
            if !Self::store_sector_inner(ch, dev) {
                return false;
            }
            addr += block as u64;
        }
        true
    }

    fn load_sector_inner(ch: &mut Channel, dev: &Device<'_>) -> bool {
        let drive_index = ch.selected();
        let lba = ch.lba;
        let Some(drive) = ch.drives[drive_index].as_mut() else {
            ch.abort(ERROR_ABRT);
            return false;
        };
        if lba >= drive.total_blocks {
            ch.abort(ERROR_IDNF);
            return false;
        }
        let block = drive.block_size as usize;
        let mut buf = vec![0u8; block];
        let tree = dev.tree();
        let ok = drive
            .instance
            .seek(tree, lba * drive.block_size)
            .and_then(|_| drive.instance.read(tree, &mut buf))
            .map(|n| n == block)
            .unwrap_or(false);
        if !ok {
            ch.abort(ERROR_IDNF);
            return false;
        }
        ch.fifo = buf;
        ch.fifo_pos = 0;
        true
    }

    fn store_sector_inner(ch: &mut Channel, dev: &Device<'_>) -> bool {
        let drive_index = ch.selected();
        let lba = ch.lba;
        let fifo = std::mem::take(&mut ch.fifo);
        ch.fifo_pos = 0;
        let Some(drive) = ch.drives[drive_index].as_mut() else {
            ch.abort(ERROR_ABRT);
            return false;
        };
        if lba >= drive.total_blocks {
            ch.abort(ERROR_IDNF);
            return false;
        }
        let tree = dev.tree();
        let ok = drive
            .instance
            .seek(tree, lba * drive.block_size)
            .and_then(|_| drive.instance.write(tree, &fifo))
            .map(|n| n == fifo.len())
            .unwrap_or(false);
        if !ok {
            ch.abort(ERROR_IDNF);
        }
        ok
    }

    /// Pops FIFO bytes toward the host; when the block drains, the next one
    /// is primed behind a fresh busy period.
    fn data_read(&mut self, dev: &Device<'_>, channel: usize, buf: &mut [u8]) -> usize {
        let drained = {
            let mut state = self.state.borrow_mut();
            let ch = &mut state.channels[channel];
            if ch.transfer != Transfer::PioIn {
                buf.fill(0);
                return buf.len();
            }
            let avail = ch.fifo.len() - ch.fifo_pos;
            let n = buf.len().min(avail);
            buf[..n].copy_from_slice(&ch.fifo[ch.fifo_pos..ch.fifo_pos + n]);
            ch.fifo_pos += n;
            buf[n..].fill(0);
            ch.fifo_pos == ch.fifo.len()
        };

        if drained {
            let mut state = self.state.borrow_mut();
            let ch = &mut state.channels[channel];
            if ch.remaining > 0 {
                ch.remaining -= 1;
                ch.lba += 1;
                ch.status |= STATUS_BSY;
                if Self::load_sector_inner(ch, dev) {
                    drop(state);
                    Self::schedule_ready(&self.state, dev, channel);
                }
            } else {
                ch.transfer = Transfer::None;
                ch.status = STATUS_DRDY | STATUS_DSC;
                ch.fifo.clear();
                ch.fifo_pos = 0;
            }
        }
        buf.len()
    }

    fn data_write(&mut self, dev: &Device<'_>, channel: usize, buf: &[u8]) -> usize {
        let full = {
            let mut state = self.state.borrow_mut();
            let ch = &mut state.channels[channel];
            if ch.transfer != Transfer::PioOut {
                return buf.len();
            }
            let n = buf.len().min(ch.pio_block - ch.fifo.len());
            ch.fifo.extend_from_slice(&buf[..n]);
            ch.fifo.len() == ch.pio_block
        };

        if full {
            let mut state = self.state.borrow_mut();
            let ch = &mut state.channels[channel];
            ch.status = (ch.status | STATUS_BSY) & !STATUS_DRQ;
            if Self::store_sector_inner(ch, dev) {
                let ch = &mut state.channels[channel];
                if ch.remaining > 0 {
                    ch.remaining -= 1;
                    ch.lba += 1;
                    ch.fifo = Vec::new();
                    ch.status |= STATUS_DRQ;
                } else {
                    ch.transfer = Transfer::None;
                    ch.pio_block = 0;
                }
                drop(state);
                Self::schedule_ready(&self.state, dev, channel);
            }
        }
        buf.len()
    }

    fn channel_of(&self, addr: u64) -> Option<(usize, bool, u64)> {
        let state = self.state.borrow();
        for (index, ch) in state.channels.iter().enumerate() {
            if (ch.cmd_base..ch.cmd_base + 8).contains(&addr) {
                return Some((index, false, addr - ch.cmd_base));
            }
            if (ch.ctrl_base..ch.ctrl_base + 8).contains(&addr) {
                return Some((index, true, addr - ch.ctrl_base));
            }
        }
        None
    }
}

impl Default for HwIde {
    fn default() -> Self {
        Self::new()
    }
}

impl HwModel for HwIde {
    fn model_name(&self) -> &'static str {
        "ide"
    }

    fn init_address(&mut self, dev: Device<'_>) -> Result<()> {
        let ranges = dev.attach_reg_ranges(Access::RW, false)?;
        if ranges.len() % 2 != 0 || ranges.is_empty() {
            return Err(TreeError::Config {
                path: dev.path(),
                reason: "ide expects (command, control) reg pairs".to_owned(),
            });
        }
        let mut state = self.state.borrow_mut();
        state.channels = ranges
            .chunks(2)
            .map(|pair| Channel {
                cmd_base: pair[0].1,
                ctrl_base: pair[1].1,
                ..Channel::default()
            })
            .collect();
        Ok(())
    }

    fn init_data(&mut self, dev: Device<'_>) -> Result<()> {
        let ready_delay = dev.find_integer_or("ready-delay", 100)?;
        let tree = dev.tree();

        let mut state = self.state.borrow_mut();
        state.ready_delay = ready_delay;
        for ch in &mut state.channels {
            let bases = (ch.cmd_base, ch.ctrl_base);
            *ch = Channel {
                cmd_base: bases.0,
                ctrl_base: bases.1,
                ..Channel::default()
            };
            ch.srst();
        }

        // Bind child disks: unit address = channel * 2 + drive.
        for child in tree.children(dev.id()) {
            let unit = tree
                .device(child)
                .unit()
                .as_u64()
                .ok_or_else(|| TreeError::Config {
                    path: tree.path(child),
                    reason: "drive unit address must be a single cell".to_owned(),
                })?;
            let channel = (unit / 2) as usize;
            let drive = (unit % 2) as usize;
            if channel >= state.channels.len() {
                return Err(TreeError::Config {
                    path: tree.path(child),
                    reason: format!("no ide channel {channel}"),
                });
            }
            let mut instance = tree.instantiate(child, "")?;
            let block_size = instance.call_method(tree, "block-size", &[])?[0];
            let size = instance.call_method(tree, "size", &[])?[0];
            state.channels[channel].drives[drive] = Some(Drive {
                instance,
                block_size,
                total_blocks: size / block_size,
            });
        }
        Ok(())
    }

    fn io_read(&mut self, dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        let Some((channel, ctrl, reg)) = self.channel_of(addr) else {
            return 0;
        };
        if buf.is_empty() {
            return 0;
        }

        if !ctrl && reg == REG_DATA {
            return self.data_read(&dev, channel, buf);
        }

        let value = {
            let mut state = self.state.borrow_mut();
            let ch = &mut state.channels[channel];
            match (ctrl, reg) {
                (false, REG_ERROR_FEATURES) => ch.error,
                (false, REG_SECTOR_COUNT) => ch.sector_count,
                (false, REG_LBA0) => ch.lba0,
                (false, REG_LBA1) => ch.lba1,
                (false, REG_LBA2) => ch.lba2,
                (false, REG_DEVICE) => ch.device,
                (false, REG_STATUS_COMMAND) => {
                    // Reading the status register acknowledges the interrupt.
                    ch.irq = false;
                    ch.status
                }
                (true, CTRL_REG_ALT_STATUS) => ch.status,
                (true, reg) if (CTRL_REG_DMA_ADDR..CTRL_REG_DMA_ADDR + 4).contains(&reg) => {
                    ch.dma_addr.to_le_bytes()[(reg - CTRL_REG_DMA_ADDR) as usize]
                }
                _ => 0,
            }
        };
        if !ctrl && reg == REG_STATUS_COMMAND {
            Self::sync_irq(&self.state, &dev, channel);
        }
        buf[0] = value;
        1
    }

    fn io_write(&mut self, dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &[u8]) -> usize {
        let Some((channel, ctrl, reg)) = self.channel_of(addr) else {
            return 0;
        };
        let Some(value) = buf.first().copied() else {
            return 0;
        };

        if !ctrl && reg == REG_DATA {
            return self.data_write(&dev, channel, buf);
        }

        {
            let mut state = self.state.borrow_mut();
            let ch = &mut state.channels[channel];
            match (ctrl, reg) {
                (false, REG_ERROR_FEATURES) => ch.features = value,
                (false, REG_SECTOR_COUNT) => ch.sector_count = value,
                (false, REG_LBA0) => ch.lba0 = value,
                (false, REG_LBA1) => ch.lba1 = value,
                (false, REG_LBA2) => ch.lba2 = value,
                (false, REG_DEVICE) => ch.device = value,
                (false, REG_STATUS_COMMAND) => {
                    drop(state);
                    self.start_command(&dev, channel, value);
                    Self::sync_irq(&self.state, &dev, channel);
                    return 1;
                }
                (true, CTRL_REG_ALT_STATUS) => {
                    let was_reset = ch.devctl & CTRL_SRST != 0;
                    ch.devctl = value;
                    if value & CTRL_SRST != 0 && !was_reset {
                        ch.srst();
                    }
                    drop(state);
                    Self::sync_irq(&self.state, &dev, channel);
                    return 1;
                }
                (true, reg) if (CTRL_REG_DMA_ADDR..CTRL_REG_DMA_ADDR + 4).contains(&reg) => {
                    let mut bytes = ch.dma_addr.to_le_bytes();
                    bytes[(reg - CTRL_REG_DMA_ADDR) as usize] = value;
                    ch.dma_addr = u32::from_le_bytes(bytes);
                }
                _ => return 0,
            }
        }
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::HwDisk;
    use crate::memory::HwMemory;
    use arbor_tree::{DeviceTree, PropertyValue, RegEntry, UnitAddress};

    const CMD: u64 = 0x1F0;
    const CTRL: u64 = 0x3F0;

    fn reg_pairs() -> PropertyValue {
        PropertyValue::Ranges(vec![
            RegEntry::new(UnitAddress::from_u64(CMD, 1), UnitAddress::from_u64(8, 1)),
            RegEntry::new(UnitAddress::from_u64(CTRL, 1), UnitAddress::from_u64(8, 1)),
        ])
    }

    /// 16 sectors; sector n is filled with byte n.
    fn build_image(path: &std::path::Path) {
        let mut image = vec![0u8; 16 * 512];
        for sector in 0..16 {
            image[sector * 512..(sector + 1) * 512].fill(sector as u8);
        }
        std::fs::write(path, &image).unwrap();
    }

    fn ide_tree(image: &std::path::Path) -> (DeviceTree, arbor_tree::DeviceId) {
        let mut tree = DeviceTree::new();
        let root = tree.root();
        let ide = tree.add(root, "ide@0x1f0", Box::new(HwIde::new())).unwrap();
        tree.set_property(ide, "reg", reg_pairs());
        tree.set_property(ide, "ready-delay", 100u64);
        let disk = tree.add(ide, "disk@0", Box::new(HwDisk::new())).unwrap();
        tree.set_property(disk, "file", PropertyValue::String(image.display().to_string()));

        let mem = tree.add(root, "memory@0x10000", Box::new(HwMemory::new())).unwrap();
        tree.set_property(
            mem,
            "reg",
            PropertyValue::Ranges(vec![RegEntry::new(
                UnitAddress::from_u64(0x1_0000, 1),
                UnitAddress::from_u64(0x1_0000, 1),
            )]),
        );
        tree.wire_to_cpu(ide, 0, 0);
        tree.init().unwrap();
        (tree, ide)
    }

    fn wr8(tree: &DeviceTree, addr: u64, value: u8) {
        assert_eq!(tree.io_write(0, addr, &[value]), 1);
    }

    fn rd8(tree: &DeviceTree, addr: u64) -> u8 {
        let mut buf = [0u8; 1];
        assert_eq!(tree.io_read(0, addr, &mut buf), 1);
        buf[0]
    }

    fn issue_read_sectors(tree: &DeviceTree, lba: u8, count: u8) {
        wr8(tree, CMD + 2, count);
        wr8(tree, CMD + 3, lba);
        wr8(tree, CMD + 4, 0);
        wr8(tree, CMD + 5, 0);
        wr8(tree, CMD + 6, 0xE0); // LBA mode, drive 0
        wr8(tree, CMD + 7, CMD_READ_SECTORS);
    }

    #[test]
    fn data_register_yields_the_primed_block_before_the_busy_delay() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        build_image(&image);
        let (tree, _ide) = ide_tree(&image);

        issue_read_sectors(&tree, 3, 1);

        // Still busy (the ready event has not fired), but the FIFO was primed
        // at command acceptance.
        assert_ne!(rd8(&tree, CTRL) & STATUS_BSY, 0);
        let mut word = [0u8; 2];
        assert_eq!(tree.io_read(0, CMD, &mut word), 2);
        assert_eq!(word, [3, 3]);
    }

    #[test]
    fn read_sectors_completes_with_an_interrupt_per_block() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        build_image(&image);
        let (tree, _ide) = ide_tree(&image);

        issue_read_sectors(&tree, 5, 2);
        tree.tick(100);
        assert!(tree.cpu_line(0));
        assert_eq!(rd8(&tree, CMD + 7) & STATUS_BSY, 0);
        assert!(!tree.cpu_line(0)); // status read acknowledged

        // Drain the first block; the second primes behind a new busy period.
        let mut sector = [0u8; 512];
        for chunk in sector.chunks_mut(2) {
            tree.io_read(0, CMD, chunk);
        }
        assert!(sector.iter().all(|b| *b == 5));
        assert_ne!(rd8(&tree, CTRL) & STATUS_BSY, 0);

        tree.tick(100);
        assert!(tree.cpu_line(0));
        for chunk in sector.chunks_mut(2) {
            tree.io_read(0, CMD, chunk);
        }
        assert!(sector.iter().all(|b| *b == 6));

        // Request complete.
        assert_eq!(rd8(&tree, CMD + 7), STATUS_DRDY | STATUS_DSC);
    }

    #[test]
    fn write_sectors_round_trips_through_the_drive() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        build_image(&image);
        let (tree, _ide) = ide_tree(&image);

        wr8(&tree, CMD + 2, 1);
        wr8(&tree, CMD + 3, 9);
        wr8(&tree, CMD + 4, 0);
        wr8(&tree, CMD + 5, 0);
        wr8(&tree, CMD + 6, 0xE0);
        wr8(&tree, CMD + 7, CMD_WRITE_SECTORS);

        assert_ne!(rd8(&tree, CTRL) & STATUS_DRQ, 0);
        for _ in 0..256 {
            tree.io_write(0, CMD, &[0xCD, 0xAB]);
        }
        tree.tick(100);
        assert!(tree.cpu_line(0));
        assert_eq!(rd8(&tree, CMD + 7), STATUS_DRDY | STATUS_DSC);

        issue_read_sectors(&tree, 9, 1);
        let mut word = [0u8; 2];
        tree.io_read(0, CMD, &mut word);
        assert_eq!(word, [0xCD, 0xAB]);
    }

    #[test]
    fn identify_reports_geometry_and_lba_support() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        build_image(&image);
        let (tree, _ide) = ide_tree(&image);

        wr8(&tree, CMD + 6, 0xE0);
        wr8(&tree, CMD + 7, CMD_IDENTIFY);
        tree.tick(100);

        let mut block = [0u8; 512];
        for chunk in block.chunks_mut(2) {
            tree.io_read(0, CMD, chunk);
        }
        let word = |i: usize| u16::from_le_bytes([block[2 * i], block[2 * i + 1]]);
        assert_eq!(word(0), 0x0040);
        assert_ne!(word(49) & 1 << 9, 0);
        assert_eq!(u32::from(word(60)) | u32::from(word(61)) << 16, 16);
    }

    #[test]
    fn dma_read_lands_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        build_image(&image);
        let (tree, _ide) = ide_tree(&image);

        // DMA buffer at 0x10000, read sectors 7..9.
        for (i, byte) in 0x0001_0000u32.to_le_bytes().iter().enumerate() {
            wr8(&tree, CTRL + 4 + i as u64, *byte);
        }
        wr8(&tree, CMD + 2, 2);
        wr8(&tree, CMD + 3, 7);
        wr8(&tree, CMD + 4, 0);
        wr8(&tree, CMD + 5, 0);
        wr8(&tree, CMD + 6, 0xE0);
        wr8(&tree, CMD + 7, CMD_READ_DMA);

        tree.tick(100);
        assert!(tree.cpu_line(0));

        let mut bytes = [0u8; 4];
        tree.io_read(0, 0x1_0000 + 10, &mut bytes);
        assert_eq!(bytes, [7, 7, 7, 7]);
        tree.io_read(0, 0x1_0000 + 512, &mut bytes);
        assert_eq!(bytes, [8, 8, 8, 8]);
    }

    #[test]
    fn commands_to_a_missing_drive_abort() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        build_image(&image);
        let (tree, _ide) = ide_tree(&image);

        wr8(&tree, CMD + 6, 0xF0); // drive 1: not configured
        wr8(&tree, CMD + 7, CMD_IDENTIFY);
        assert_ne!(rd8(&tree, CMD + 7) & STATUS_ERR, 0);
        assert_ne!(rd8(&tree, CMD + 1) & ERROR_ABRT, 0);
    }

    #[test]
    fn reads_past_the_end_of_the_medium_error_out() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        build_image(&image);
        let (tree, _ide) = ide_tree(&image);

        issue_read_sectors(&tree, 200, 1); // only 16 sectors exist
        assert_ne!(rd8(&tree, CMD + 7) & STATUS_ERR, 0);
        assert_ne!(rd8(&tree, CMD + 1) & ERROR_IDNF, 0);
    }
}
