//! Programmer's-aid device: a tiny console, cycle counter, interrupt
//! generator and halt latch behind one register window.
//!
//! Register map (byte offsets from `reg`):
//!
//! | offset | access | function |
//! |---|---|---|
//! | 0x00 | r | status: bit0 = input byte ready |
//! | 0x01 | r | console input (pops one byte) |
//! | 0x02 | w | console output |
//! | 0x04 | r | cycle count, u32 LE, latched low word of the event clock |
//! | 0x08 | w | interrupt generator: bits 6:0 output port, bit 7 level |
//! | 0x0c | w | halt |

use arbor_tree::{Access, AddressSpace, Device, HwModel, Ioctl, Result, TreeError};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

const REG_STATUS: u64 = 0x00;
const REG_INPUT: u64 = 0x01;
const REG_OUTPUT: u64 = 0x02;
const REG_CYCLES: u64 = 0x04;
const REG_INTERRUPT: u64 = 0x08;
const REG_HALT: u64 = 0x0C;

#[derive(Debug, Default)]
struct PalState {
    base: u64,
    input: VecDeque<u8>,
    output: Vec<u8>,
    halted: bool,
}

/// Shared handle for the host side of the console and the halt latch.
#[derive(Clone)]
pub struct PalHandle {
    state: Rc<RefCell<PalState>>,
}

impl PalHandle {
    pub fn push_input(&self, byte: u8) {
        self.state.borrow_mut().input.push_back(byte);
    }

    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.borrow_mut().output)
    }

    pub fn halted(&self) -> bool {
        self.state.borrow().halted
    }
}

pub struct HwPal {
    state: Rc<RefCell<PalState>>,
}

impl HwPal {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(PalState::default())),
        }
    }

    pub fn handle(&self) -> PalHandle {
        PalHandle {
            state: self.state.clone(),
        }
    }
}

impl Default for HwPal {
    fn default() -> Self {
        Self::new()
    }
}

impl HwModel for HwPal {
    fn model_name(&self) -> &'static str {
        "pal"
    }

    fn init_address(&mut self, dev: Device<'_>) -> Result<()> {
        let ranges = dev.attach_reg_ranges(Access::RW, false)?;
        self.state.borrow_mut().base = ranges[0].1;
        Ok(())
    }

    fn init_data(&mut self, _dev: Device<'_>) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.input.clear();
        state.output.clear();
        state.halted = false;
        Ok(())
    }

    fn io_read(&mut self, dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        let mut state = self.state.borrow_mut();
        let offset = addr - state.base;
        match offset {
            // Byte registers claim one byte of however wide the access is.
            REG_STATUS if !buf.is_empty() => {
                buf[0] = u8::from(!state.input.is_empty());
                1
            }
            REG_INPUT if !buf.is_empty() => {
                buf[0] = state.input.pop_front().unwrap_or(0);
                1
            }
            REG_CYCLES if buf.len() >= 4 => {
                buf[..4].copy_from_slice(&(dev.now() as u32).to_le_bytes());
                4
            }
            _ => 0,
        }
    }

    fn io_write(&mut self, dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &[u8]) -> usize {
        let offset = {
            let state = self.state.borrow();
            addr - state.base
        };
        match offset {
            REG_OUTPUT if !buf.is_empty() => {
                self.state.borrow_mut().output.push(buf[0]);
                1
            }
            REG_INTERRUPT if !buf.is_empty() => {
                let port = u32::from(buf[0] & 0x7F);
                let level = buf[0] & 0x80 != 0;
                dev.set_interrupt(port, level);
                1
            }
            REG_HALT if !buf.is_empty() => {
                self.state.borrow_mut().halted = true;
                1
            }
            _ => 0,
        }
    }

    fn ioctl(&mut self, dev: Device<'_>, request: Ioctl<'_>) -> Result<u64> {
        match request {
            // request 0: query the halt latch.
            Ioctl::Custom { request: 0, .. } => Ok(u64::from(self.state.borrow().halted)),
            _ => Err(TreeError::Unsupported {
                path: dev.path(),
                model: self.model_name(),
                capability: "ioctl",
            }),
        }
    }
}
