//! Battery-backed RAM with a real-time clock in its top eight bytes.
//!
//! The RTC window (highest 8 bytes of `reg`) reads as BCD calendar fields
//! derived from the `epoch` property plus the event clock scaled by
//! `clock-frequency` (ticks per second). Writes to the window are ignored;
//! everything below it is plain storage.
//!
//! | offset (from top) | field |
//! |---|---|
//! | -8 | control (reads 0) |
//! | -7 | seconds (BCD) |
//! | -6 | minutes (BCD) |
//! | -5 | hours (BCD) |
//! | -4 | day of week (1 = Sunday) |
//! | -3 | day of month (BCD) |
//! | -2 | month (BCD) |
//! | -1 | year within century (BCD) |

use arbor_tree::{Access, AddressSpace, Device, HwModel, Result, TreeError};
use std::cell::RefCell;
use std::rc::Rc;

const RTC_BYTES: u64 = 8;

#[derive(Debug, Default)]
struct NvramState {
    base: u64,
    size: u64,
    epoch: u64,
    ticks_per_second: u64,
    bytes: Vec<u8>,
}

fn to_bcd(value: u64) -> u8 {
    ((value / 10) << 4 | (value % 10)) as u8
}

/// Civil-calendar split of a day count since 1970-01-01 (proleptic
/// Gregorian).
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { year + 1 } else { year };
    (year, month, day)
}

impl NvramState {
    fn rtc_byte(&self, index: u64, now: u64) -> u8 {
        let seconds = self.epoch + now / self.ticks_per_second.max(1);
        let days = seconds / 86_400;
        let tod = seconds % 86_400;
        let (year, month, day) = civil_from_days(days);
        match index {
            0 => 0,
            1 => to_bcd(tod % 60),
            2 => to_bcd(tod / 60 % 60),
            3 => to_bcd(tod / 3600),
            4 => ((days + 4) % 7 + 1) as u8,
            5 => to_bcd(day),
            6 => to_bcd(month),
            7 => to_bcd(year % 100),
            _ => 0,
        }
    }
}

pub struct HwNvram {
    state: Rc<RefCell<NvramState>>,
}

impl HwNvram {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(NvramState::default())),
        }
    }
}

impl Default for HwNvram {
    fn default() -> Self {
        Self::new()
    }
}

impl HwModel for HwNvram {
    fn model_name(&self) -> &'static str {
        "nvram"
    }

    fn init_address(&mut self, dev: Device<'_>) -> Result<()> {
        let ranges = dev.attach_reg_ranges(Access::RW, false)?;
        let (_, base, len) = ranges[0];
        if len <= RTC_BYTES {
            return Err(TreeError::Config {
                path: dev.path(),
                reason: format!("nvram of {len:#x} bytes leaves no room below the clock"),
            });
        }
        let mut state = self.state.borrow_mut();
        state.base = base;
        state.size = len;
        Ok(())
    }

    fn init_data(&mut self, dev: Device<'_>) -> Result<()> {
        let epoch = dev.find_integer_or("epoch", 0)?;
        let ticks_per_second = dev.find_integer_or("clock-frequency", 1_000_000)?;
        let image = dev.find_string_opt("file")?;

        let mut state = self.state.borrow_mut();
        let size = state.size as usize;
        state.epoch = epoch;
        state.ticks_per_second = ticks_per_second;
        state.bytes = vec![0; size];

        if let Some(path) = image {
            let data = std::fs::read(&path).map_err(|source| TreeError::HostIo {
                path: dev.path(),
                source,
            })?;
            if data.len() > size {
                return Err(TreeError::Config {
                    path: dev.path(),
                    reason: format!(
                        "image \"{path}\" is {:#x} bytes, larger than the {size:#x}-byte nvram",
                        data.len()
                    ),
                });
            }
            state.bytes[..data.len()].copy_from_slice(&data);
        }
        Ok(())
    }

    fn io_read(&mut self, dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        let state = self.state.borrow();
        let now = dev.now();
        let rtc_start = state.size - RTC_BYTES;
        for (i, slot) in buf.iter_mut().enumerate() {
            let offset = addr - state.base + i as u64;
            if offset >= state.size {
                return i;
            }
            *slot = if offset >= rtc_start {
                state.rtc_byte(offset - rtc_start, now)
            } else {
                state.bytes[offset as usize]
            };
        }
        buf.len()
    }

    fn io_write(&mut self, _dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &[u8]) -> usize {
        let mut state = self.state.borrow_mut();
        let rtc_start = state.size - RTC_BYTES;
        let base = state.base;
        for (i, byte) in buf.iter().enumerate() {
            let offset = addr - base + i as u64;
            if offset >= state.size {
                return i;
            }
            // Clock bytes swallow writes.
            if offset < rtc_start {
                state.bytes[offset as usize] = *byte;
            }
        }
        buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_tree::{DeviceTree, PropertyValue, RegEntry, UnitAddress};

    const BASE: u64 = 0x7000;
    const SIZE: u64 = 0x100;

    fn nvram_tree(props: &[(&str, PropertyValue)]) -> DeviceTree {
        let mut tree = DeviceTree::new();
        let root = tree.root();
        let id = tree.add(root, "nvram@0x7000", Box::new(HwNvram::new())).unwrap();
        tree.set_property(
            id,
            "reg",
            PropertyValue::Ranges(vec![RegEntry::new(
                UnitAddress::from_u64(BASE, 1),
                UnitAddress::from_u64(SIZE, 1),
            )]),
        );
        for (name, value) in props {
            tree.set_property(id, name, value.clone());
        }
        tree.init().unwrap();
        tree
    }

    #[test]
    fn plain_bytes_store_and_load() {
        let tree = nvram_tree(&[]);
        assert_eq!(tree.io_write(0, BASE + 0x10, b"boot"), 4);
        let mut out = [0u8; 4];
        assert_eq!(tree.io_read(0, BASE + 0x10, &mut out), 4);
        assert_eq!(&out, b"boot");
    }

    #[test]
    fn clock_window_tracks_epoch_and_virtual_time() {
        // 2001-09-09T01:46:40Z, a nice round billion.
        let tree = nvram_tree(&[
            ("epoch", PropertyValue::Integer(1_000_000_000)),
            ("clock-frequency", PropertyValue::Integer(100)),
        ]);

        let rtc = BASE + SIZE - 8;
        let mut bytes = [0u8; 8];
        assert_eq!(tree.io_read(0, rtc, &mut bytes), 8);
        // 01:46:40 on 2001-09-09, a Sunday.
        assert_eq!(bytes[1], 0x40);
        assert_eq!(bytes[2], 0x46);
        assert_eq!(bytes[3], 0x01);
        assert_eq!(bytes[4], 1);
        assert_eq!(bytes[5], 0x09);
        assert_eq!(bytes[6], 0x09);
        assert_eq!(bytes[7], 0x01);

        // 80 seconds of virtual time at 100 ticks per second.
        tree.tick(8000);
        assert_eq!(tree.io_read(0, rtc, &mut bytes), 8);
        assert_eq!(bytes[1], 0x00);
        assert_eq!(bytes[2], 0x48);
    }

    #[test]
    fn clock_bytes_ignore_writes() {
        let tree = nvram_tree(&[("epoch", PropertyValue::Integer(60))]);
        let rtc = BASE + SIZE - 8;

        assert_eq!(tree.io_write(0, rtc + 1, &[0x99]), 1);
        let mut byte = [0u8; 1];
        tree.io_read(0, rtc + 1, &mut byte);
        assert_eq!(byte[0], 0x00); // still computed: 60s → 1 minute, 0 seconds
    }

    #[test]
    fn image_file_loads_and_reloads_on_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nvram.img");
        std::fs::write(&path, b"env").unwrap();

        let tree = nvram_tree(&[(
            "file",
            PropertyValue::String(path.display().to_string()),
        )]);

        let mut out = [0u8; 3];
        tree.io_read(0, BASE, &mut out);
        assert_eq!(&out, b"env");

        // Scribble, reset, and the image contents are back.
        tree.io_write(0, BASE, b"xxx");
        tree.reset().unwrap();
        tree.io_read(0, BASE, &mut out);
        assert_eq!(&out, b"env");
    }
}
