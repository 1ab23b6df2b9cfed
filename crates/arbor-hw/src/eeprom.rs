//! JEDEC-style flash EEPROM.
//!
//! The command decoder follows the classic two-cycle unlock protocol
//! (`0xAA @ 0x5555`, `0x55 @ 0x2AAA`) with byte program, chip erase, sector
//! erase (with suspend/resume) and autoselect. Program and erase operations
//! commit their memory contents only once the event clock has moved past the
//! operation's finish time; until then, reads return a status byte whose
//! toggle bit flips on every read rather than data.

use arbor_tree::{Access, AddressSpace, Device, HwModel, Result, TreeError};
use std::collections::BTreeSet;
use tracing::debug;

const UNLOCK1_ADDR: u64 = 0x5555;
const UNLOCK2_ADDR: u64 = 0x2AAA;
const CMD_MASK: u64 = 0x7FFF;

const CMD_UNLOCK1: u8 = 0xAA;
const CMD_UNLOCK2: u8 = 0x55;
const CMD_PROGRAM: u8 = 0xA0;
const CMD_ERASE_SETUP: u8 = 0x80;
const CMD_AUTOSELECT: u8 = 0x90;
const CMD_READ_RESET: u8 = 0xF0;
const CMD_CHIP_ERASE: u8 = 0x10;
const CMD_SECTOR_ERASE: u8 = 0x30;
const CMD_ERASE_SUSPEND: u8 = 0xB0;

const DQ3_ERASE_STARTED: u8 = 0x08;
const DQ6_TOGGLE: u8 = 0x40;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    ReadReset,
    /// Unlock cycle 2 of the initial sequence.
    Unlock2,
    /// Cycle 3: the command byte.
    Command,
    /// Cycles 4/5: the second unlock sequence of an erase.
    EraseUnlock1,
    EraseUnlock2,
    /// Cycle 6: chip or sector erase selector.
    EraseCommand,
    /// The next write carries the program address and data.
    ProgramSetup,
    Programming {
        finish: u64,
        offset: usize,
        value: u8,
    },
    ChipErase {
        finish: u64,
    },
    SectorErase {
        window_end: u64,
        finish: u64,
        sectors: BTreeSet<usize>,
    },
    EraseSuspended {
        remaining: u64,
        sectors: BTreeSet<usize>,
    },
    Autoselect,
}

pub struct HwEeprom {
    base: u64,
    size: usize,
    sector_size: usize,
    byte_write_delay: u64,
    sector_start_delay: u64,
    erase_delay: u64,
    manufacture_code: u8,
    device_code: u8,
    mem: Vec<u8>,
    phase: Phase,
    toggle: bool,
}

impl HwEeprom {
    pub fn new() -> Self {
        Self {
            base: 0,
            size: 0,
            sector_size: 0,
            byte_write_delay: 0,
            sector_start_delay: 0,
            erase_delay: 0,
            manufacture_code: 0,
            device_code: 0,
            mem: Vec::new(),
            phase: Phase::ReadReset,
            toggle: false,
        }
    }

    /// Commits any timed operation whose finish time has passed.
    fn complete(&mut self, now: u64) {
        match &self.phase {
            Phase::Programming { finish, offset, value } if now > *finish => {
                // Flash programming can only clear bits.
                let (offset, value) = (*offset, *value);
                self.mem[offset] &= value;
                self.phase = Phase::ReadReset;
            }
            Phase::ChipErase { finish } if now > *finish => {
                self.mem.fill(0xFF);
                self.phase = Phase::ReadReset;
            }
            Phase::SectorErase { finish, sectors, .. } if now > *finish => {
                let sectors = sectors.clone();
                for sector in sectors {
                    let start = sector * self.sector_size;
                    self.mem[start..start + self.sector_size].fill(0xFF);
                }
                self.phase = Phase::ReadReset;
            }
            _ => {}
        }
    }

    /// Busy-status byte; the toggle bit flips on every read.
    fn status(&mut self, dq7: u8, dq3: u8) -> u8 {
        self.toggle = !self.toggle;
        let toggle = if self.toggle { DQ6_TOGGLE } else { 0 };
        dq7 | toggle | dq3
    }

    fn read_byte(&mut self, now: u64, offset: usize) -> u8 {
        // Split borrow: decide what to return before touching the toggle bit.
        enum Read {
            Data,
            Status { dq7: u8, dq3: u8 },
            Autoselect,
        }

        let read = match &self.phase {
            Phase::ReadReset
            | Phase::Unlock2
            | Phase::Command
            | Phase::EraseUnlock1
            | Phase::EraseUnlock2
            | Phase::EraseCommand
            | Phase::ProgramSetup => Read::Data,
            Phase::Programming { value, offset: program_offset, .. } => {
                let final_value = self.mem[*program_offset] & value;
                Read::Status {
                    dq7: !final_value & 0x80,
                    dq3: 0,
                }
            }
            Phase::ChipErase { .. } => Read::Status {
                dq7: 0,
                dq3: DQ3_ERASE_STARTED,
            },
            Phase::SectorErase { window_end, .. } => Read::Status {
                dq7: 0,
                dq3: if now > *window_end { DQ3_ERASE_STARTED } else { 0 },
            },
            Phase::EraseSuspended { sectors, .. } => {
                if sectors.contains(&(offset / self.sector_size)) {
                    Read::Status { dq7: 0, dq3: 0 }
                } else {
                    Read::Data
                }
            }
            Phase::Autoselect => Read::Autoselect,
        };

        match read {
            Read::Data => self.mem[offset],
            Read::Status { dq7, dq3 } => self.status(dq7, dq3),
            Read::Autoselect => match offset & 0xFF {
                0 => self.manufacture_code,
                1 => self.device_code,
                _ => 0,
            },
        }
    }

    fn write_byte(&mut self, dev: &Device<'_>, now: u64, offset: usize, value: u8) {
        let cmd_addr = offset as u64 & CMD_MASK;
        let next = match &mut self.phase {
            Phase::ReadReset => match (cmd_addr, value) {
                (UNLOCK1_ADDR, CMD_UNLOCK1) => Some(Phase::Unlock2),
                (_, CMD_READ_RESET) => None,
                _ => {
                    debug!(dev = %dev.path(), offset, value, "ignored write outside a command sequence");
                    None
                }
            },
            Phase::Unlock2 => match (cmd_addr, value) {
                (UNLOCK2_ADDR, CMD_UNLOCK2) => Some(Phase::Command),
                _ => {
                    debug!(dev = %dev.path(), offset, value, "broken unlock sequence");
                    Some(Phase::ReadReset)
                }
            },
            Phase::Command => match (cmd_addr, value) {
                (UNLOCK1_ADDR, CMD_PROGRAM) => Some(Phase::ProgramSetup),
                (UNLOCK1_ADDR, CMD_ERASE_SETUP) => Some(Phase::EraseUnlock1),
                (UNLOCK1_ADDR, CMD_AUTOSELECT) => Some(Phase::Autoselect),
                _ => {
                    debug!(dev = %dev.path(), offset, value, "unknown command byte");
                    Some(Phase::ReadReset)
                }
            },
            Phase::EraseUnlock1 => match (cmd_addr, value) {
                (UNLOCK1_ADDR, CMD_UNLOCK1) => Some(Phase::EraseUnlock2),
                _ => Some(Phase::ReadReset),
            },
            Phase::EraseUnlock2 => match (cmd_addr, value) {
                (UNLOCK2_ADDR, CMD_UNLOCK2) => Some(Phase::EraseCommand),
                _ => Some(Phase::ReadReset),
            },
            Phase::EraseCommand => match (cmd_addr, value) {
                (UNLOCK1_ADDR, CMD_CHIP_ERASE) => Some(Phase::ChipErase {
                    finish: now + self.erase_delay,
                }),
                (_, CMD_SECTOR_ERASE) => {
                    let mut sectors = BTreeSet::new();
                    sectors.insert(offset / self.sector_size);
                    let window_end = now + self.sector_start_delay;
                    Some(Phase::SectorErase {
                        window_end,
                        finish: window_end + self.erase_delay,
                        sectors,
                    })
                }
                _ => Some(Phase::ReadReset),
            },
            Phase::ProgramSetup => Some(Phase::Programming {
                finish: now + self.byte_write_delay,
                offset,
                value,
            }),
            Phase::Programming { .. } => {
                // The embedded algorithm ignores writes until it finishes.
                None
            }
            Phase::ChipErase { .. } => None,
            Phase::SectorErase { window_end, finish, sectors } => {
                if value == CMD_SECTOR_ERASE && now <= *window_end {
                    // Additional sectors restart the acceptance window.
                    sectors.insert(offset / self.sector_size);
                    *window_end = now + self.sector_start_delay;
                    *finish = *window_end + self.erase_delay;
                    None
                } else if value == CMD_ERASE_SUSPEND {
                    Some(Phase::EraseSuspended {
                        remaining: finish.saturating_sub(now),
                        sectors: sectors.clone(),
                    })
                } else {
                    None
                }
            }
            Phase::EraseSuspended { remaining, sectors } => {
                if value == CMD_SECTOR_ERASE {
                    Some(Phase::SectorErase {
                        window_end: now,
                        finish: now + *remaining,
                        sectors: sectors.clone(),
                    })
                } else {
                    None
                }
            }
            Phase::Autoselect => match value {
                CMD_READ_RESET => Some(Phase::ReadReset),
                _ => None,
            },
        };
        if let Some(phase) = next {
            self.phase = phase;
        }
    }
}

impl Default for HwEeprom {
    fn default() -> Self {
        Self::new()
    }
}

impl HwModel for HwEeprom {
    fn model_name(&self) -> &'static str {
        "eeprom"
    }

    fn init_address(&mut self, dev: Device<'_>) -> Result<()> {
        let ranges = dev.attach_reg_ranges(Access::RW, false)?;
        let (_, base, len) = ranges[0];
        self.base = base;
        self.size = usize::try_from(len).map_err(|_| TreeError::Config {
            path: dev.path(),
            reason: format!("eeprom of {len:#x} bytes does not fit host memory"),
        })?;
        Ok(())
    }

    fn init_data(&mut self, dev: Device<'_>) -> Result<()> {
        let sector_size = dev.find_integer_or("sector-size", 0x1_0000)? as usize;
        if sector_size == 0 || self.size % sector_size != 0 {
            return Err(TreeError::Config {
                path: dev.path(),
                reason: format!(
                    "sector size {sector_size:#x} does not divide the {:#x}-byte array",
                    self.size
                ),
            });
        }
        self.sector_size = sector_size;
        self.byte_write_delay = dev.find_integer_or("byte-write-delay", 10)?;
        self.sector_start_delay = dev.find_integer_or("sector-start-delay", 100)?;
        self.erase_delay = dev.find_integer_or("erase-delay", 1000)?;
        self.manufacture_code = dev.find_integer_or("manufacture-code", 0x01)? as u8;
        self.device_code = dev.find_integer_or("device-code", 0xA4)? as u8;

        // Reset drops any in-flight operation and rebuilds the array.
        self.phase = Phase::ReadReset;
        self.toggle = false;
        self.mem = vec![0; self.size];
        if let Some(path) = dev.find_string_opt("input-file")? {
            let data = std::fs::read(&path).map_err(|source| TreeError::HostIo {
                path: dev.path(),
                source,
            })?;
            if data.len() > self.size {
                return Err(TreeError::Config {
                    path: dev.path(),
                    reason: format!(
                        "image \"{path}\" is {:#x} bytes, larger than the {:#x}-byte array",
                        data.len(),
                        self.size
                    ),
                });
            }
            self.mem[..data.len()].copy_from_slice(&data);
        }
        Ok(())
    }

    fn io_read(&mut self, dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        let now = dev.now();
        self.complete(now);
        for (i, slot) in buf.iter_mut().enumerate() {
            let offset = (addr - self.base) as usize + i;
            if offset >= self.size {
                return i;
            }
            *slot = self.read_byte(now, offset);
        }
        buf.len()
    }

    fn io_write(&mut self, dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &[u8]) -> usize {
        let now = dev.now();
        self.complete(now);
        for (i, byte) in buf.iter().enumerate() {
            let offset = (addr - self.base) as usize + i;
            if offset >= self.size {
                return i;
            }
            self.write_byte(&dev, now, offset, *byte);
        }
        buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_tree::{DeviceTree, PropertyValue, RegEntry, UnitAddress};

    const BASE: u64 = 0xFFF0_0000;
    const SIZE: u64 = 0x8000;
    const SECTOR: u64 = 0x1000;

    fn eeprom_tree(props: &[(&str, PropertyValue)]) -> DeviceTree {
        let mut tree = DeviceTree::new();
        let root = tree.root();
        let id = tree
            .add(root, "eeprom@0xfff00000", Box::new(HwEeprom::new()))
            .unwrap();
        tree.set_property(
            id,
            "reg",
            PropertyValue::Ranges(vec![RegEntry::new(
                UnitAddress::from_u64(BASE, 1),
                UnitAddress::from_u64(SIZE, 1),
            )]),
        );
        tree.set_property(id, "sector-size", SECTOR);
        tree.set_property(id, "byte-write-delay", 10u64);
        tree.set_property(id, "sector-start-delay", 100u64);
        tree.set_property(id, "erase-delay", 1000u64);
        for (name, value) in props {
            tree.set_property(id, name, value.clone());
        }
        tree.init().unwrap();
        tree
    }

    fn wr(tree: &DeviceTree, offset: u64, value: u8) {
        assert_eq!(tree.io_write(0, BASE + offset, &[value]), 1);
    }

    fn rd(tree: &DeviceTree, offset: u64) -> u8 {
        let mut buf = [0u8; 1];
        assert_eq!(tree.io_read(0, BASE + offset, &mut buf), 1);
        buf[0]
    }

    fn unlock(tree: &DeviceTree) {
        wr(tree, 0x5555, 0xAA);
        wr(tree, 0x2AAA, 0x55);
    }

    fn program(tree: &DeviceTree, offset: u64, value: u8) {
        unlock(tree);
        wr(tree, 0x5555, 0xA0);
        wr(tree, offset, value);
    }

    #[test]
    fn sector_erase_command_sequence_erases_the_target_sector() {
        let tree = eeprom_tree(&[]);

        // The exact six-cycle sequence, aimed at sector 2.
        wr(&tree, 0x5555, 0xAA);
        wr(&tree, 0x2AAA, 0x55);
        wr(&tree, 0x5555, 0x80);
        wr(&tree, 0x5555, 0xAA);
        wr(&tree, 0x2AAA, 0x55);
        wr(&tree, 2 * SECTOR, 0x30);

        // Busy: status toggles rather than returning data.
        let a = rd(&tree, 2 * SECTOR);
        let b = rd(&tree, 2 * SECTOR);
        assert_ne!(a & DQ6_TOGGLE, b & DQ6_TOGGLE);

        tree.tick(100 + 1000 + 1);
        for probe in [0, 0x800, 0xFFF] {
            assert_eq!(rd(&tree, 2 * SECTOR + probe), 0xFF);
        }
        // Neighboring sectors keep their (zero-filled) contents.
        assert_eq!(rd(&tree, SECTOR), 0x00);
        assert_eq!(rd(&tree, 3 * SECTOR), 0x00);
    }

    #[test]
    fn additional_sectors_join_within_the_start_window() {
        let tree = eeprom_tree(&[]);

        unlock(&tree);
        wr(&tree, 0x5555, 0x80);
        unlock(&tree);
        wr(&tree, SECTOR, 0x30);
        // Second sector command inside the acceptance window.
        tree.tick(50);
        wr(&tree, 4 * SECTOR, 0x30);

        tree.tick(100 + 1000 + 1);
        assert_eq!(rd(&tree, SECTOR), 0xFF);
        assert_eq!(rd(&tree, 4 * SECTOR), 0xFF);
        assert_eq!(rd(&tree, 2 * SECTOR), 0x00);
    }

    #[test]
    fn erase_suspend_holds_commitment_until_resumed() {
        let tree = eeprom_tree(&[]);

        unlock(&tree);
        wr(&tree, 0x5555, 0x80);
        unlock(&tree);
        wr(&tree, SECTOR, 0x30);

        tree.tick(200);
        wr(&tree, SECTOR, 0xB0); // suspend

        // Long past the original finish time: still not committed.
        tree.tick(10_000);
        assert_eq!(rd(&tree, 0), 0x00); // non-pending sector reads data

        wr(&tree, SECTOR, 0x30); // resume
        tree.tick(901 + 1); // the remaining time, plus the strict boundary
        assert_eq!(rd(&tree, SECTOR), 0xFF);
    }

    #[test]
    fn chip_erase_fills_the_whole_array() {
        let tree = eeprom_tree(&[]);

        unlock(&tree);
        wr(&tree, 0x5555, 0x80);
        unlock(&tree);
        wr(&tree, 0x5555, 0x10);

        tree.tick(1001);
        assert_eq!(rd(&tree, 0), 0xFF);
        assert_eq!(rd(&tree, SIZE - 1), 0xFF);
    }

    #[test]
    fn byte_program_commits_after_the_write_delay() {
        let tree = eeprom_tree(&[]);

        // Start from an erased sector so programming has bits to clear.
        unlock(&tree);
        wr(&tree, 0x5555, 0x80);
        unlock(&tree);
        wr(&tree, 0, 0x30);
        tree.tick(1101);

        program(&tree, 0x123, 0x5A);

        // While busy, DQ7 is the complement of the final bit 7 and DQ6
        // toggles.
        let a = rd(&tree, 0x123);
        let b = rd(&tree, 0x123);
        assert_eq!(a & 0x80, 0x80); // final value 0x5A has bit7 clear
        assert_ne!(a & DQ6_TOGGLE, b & DQ6_TOGGLE);

        tree.tick(11);
        assert_eq!(rd(&tree, 0x123), 0x5A);
        // Programming only clears bits: 0xFF & 0x5A.
        program(&tree, 0x123, 0xA5);
        tree.tick(11);
        assert_eq!(rd(&tree, 0x123), 0x00);
    }

    #[test]
    fn autoselect_reports_manufacturer_and_device_codes() {
        let tree = eeprom_tree(&[
            ("manufacture-code", PropertyValue::Integer(0x01)),
            ("device-code", PropertyValue::Integer(0xA4)),
        ]);

        unlock(&tree);
        wr(&tree, 0x5555, 0x90);
        assert_eq!(rd(&tree, 0), 0x01);
        assert_eq!(rd(&tree, 1), 0xA4);
        wr(&tree, 0, 0xF0);
        assert_eq!(rd(&tree, 0), 0x00);
    }

    #[test]
    fn init_data_is_idempotent_for_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flash.img");
        let mut image = vec![0u8; 0x100];
        image[0..4].copy_from_slice(b"FW01");
        std::fs::write(&path, &image).unwrap();

        let tree = eeprom_tree(&[(
            "input-file",
            PropertyValue::String(path.display().to_string()),
        )]);

        let mut sig = [0u8; 4];
        tree.io_read(0, BASE, &mut sig);
        assert_eq!(&sig, b"FW01");

        // Wreck the array, then reset: the image is reloaded.
        unlock(&tree);
        wr(&tree, 0x5555, 0x80);
        unlock(&tree);
        wr(&tree, 0x5555, 0x10);
        tree.tick(1001);
        assert_eq!(rd(&tree, 0), 0xFF);

        tree.reset().unwrap();
        tree.io_read(0, BASE, &mut sig);
        assert_eq!(&sig, b"FW01");
    }

    #[test]
    fn without_an_image_the_array_resets_to_zero() {
        let tree = eeprom_tree(&[]);

        unlock(&tree);
        wr(&tree, 0x5555, 0x80);
        unlock(&tree);
        wr(&tree, 0x5555, 0x10);
        tree.tick(1001);
        assert_eq!(rd(&tree, 0x42), 0xFF);

        tree.reset().unwrap();
        assert_eq!(rd(&tree, 0x42), 0x00);
    }
}
