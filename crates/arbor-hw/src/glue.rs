//! Interrupt glue: a combinational gate wired between interrupt ports.
//!
//! Input ports are `0..nr-inputs`; the single output is port `nr-inputs`.
//! The register window mirrors the pin state for software: word 0 reads the
//! output level, word `1 + i` reads input `i`; writing word `1 + i` drives
//! input `i` directly (diagnostic path).

use arbor_tree::{Access, AddressSpace, Device, DeviceId, HwModel, Result, TreeError};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateKind {
    Buffer,
    And,
    Or,
    Xor,
    Nand,
    Nor,
    Not,
}

impl GateKind {
    fn parse(text: &str) -> Option<GateKind> {
        Some(match text {
            "buffer" => GateKind::Buffer,
            "and" => GateKind::And,
            "or" => GateKind::Or,
            "xor" => GateKind::Xor,
            "nand" => GateKind::Nand,
            "nor" => GateKind::Nor,
            "not" => GateKind::Not,
            _ => return None,
        })
    }

    fn eval(self, inputs: &[bool]) -> bool {
        let set = inputs.iter().filter(|level| **level).count();
        match self {
            GateKind::Buffer => set != 0,
            GateKind::And => set == inputs.len(),
            GateKind::Or => set != 0,
            GateKind::Xor => set % 2 == 1,
            GateKind::Nand => set != inputs.len(),
            GateKind::Nor => set == 0,
            GateKind::Not => set == 0,
        }
    }
}

#[derive(Debug)]
struct GlueState {
    base: u64,
    kind: GateKind,
    inputs: Vec<bool>,
    output: bool,
}

pub struct HwGlue {
    state: Rc<RefCell<GlueState>>,
}

impl HwGlue {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(GlueState {
                base: 0,
                kind: GateKind::Or,
                inputs: Vec::new(),
                output: false,
            })),
        }
    }

    /// Recomputes the gate; on an output edge, propagates it.
    fn update(&self, dev: &Device<'_>) {
        let (level, changed, port) = {
            let mut state = self.state.borrow_mut();
            let level = state.kind.eval(&state.inputs);
            let changed = level != state.output;
            state.output = level;
            (level, changed, state.inputs.len() as u32)
        };
        if changed {
            dev.set_interrupt(port, level);
        }
    }
}

impl Default for HwGlue {
    fn default() -> Self {
        Self::new()
    }
}

impl HwModel for HwGlue {
    fn model_name(&self) -> &'static str {
        "glue"
    }

    fn init_address(&mut self, dev: Device<'_>) -> Result<()> {
        let reg = dev.find_ranges("reg")?;
        if reg.len() != 1 {
            // Multi-range glue is a deliberately unimplemented placeholder.
            return Err(TreeError::Config {
                path: dev.path(),
                reason: "glue with multiple reg ranges is not implemented".to_owned(),
            });
        }
        let ranges = dev.attach_reg_ranges(Access::RW, false)?;
        self.state.borrow_mut().base = ranges[0].1;
        Ok(())
    }

    fn init_data(&mut self, dev: Device<'_>) -> Result<()> {
        let kind_text = dev.find_string_opt("type")?.unwrap_or_else(|| "or".to_owned());
        let kind = GateKind::parse(&kind_text).ok_or_else(|| TreeError::Config {
            path: dev.path(),
            reason: format!("unknown gate type \"{kind_text}\""),
        })?;
        let nr_inputs = dev.find_integer_or("nr-inputs", 2)? as usize;
        if nr_inputs == 0 || (kind == GateKind::Not && nr_inputs != 1) {
            return Err(TreeError::Config {
                path: dev.path(),
                reason: format!("gate \"{kind_text}\" cannot have {nr_inputs} inputs"),
            });
        }

        let mut state = self.state.borrow_mut();
        state.kind = kind;
        state.inputs = vec![false; nr_inputs];
        state.output = kind.eval(&state.inputs);
        Ok(())
    }

    fn io_read(&mut self, _dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        if buf.len() != 4 {
            return 0;
        }
        let state = self.state.borrow();
        let word = (addr - state.base) / 4;
        let level = match word {
            0 => state.output,
            n if (n as usize) <= state.inputs.len() => state.inputs[n as usize - 1],
            _ => return 0,
        };
        buf.copy_from_slice(&u32::from(level).to_le_bytes());
        4
    }

    fn io_write(&mut self, dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &[u8]) -> usize {
        if buf.len() != 4 {
            return 0;
        }
        let value = u32::from_le_bytes(buf.try_into().expect("length checked")) != 0;
        {
            let mut state = self.state.borrow_mut();
            let word = (addr - state.base) / 4;
            match word {
                0 => {
                    debug!(dev = %dev.path(), "write to read-only output register ignored");
                    return 4;
                }
                n if (n as usize) <= state.inputs.len() => {
                    state.inputs[n as usize - 1] = value;
                }
                _ => return 0,
            }
        }
        self.update(&dev);
        4
    }

    fn interrupt_event(
        &mut self,
        dev: Device<'_>,
        port: u32,
        _source: DeviceId,
        _source_port: u32,
        level: bool,
    ) {
        {
            let mut state = self.state.borrow_mut();
            let Some(slot) = state.inputs.get_mut(port as usize) else {
                debug!(dev = %dev.path(), port, "interrupt on unknown glue input ignored");
                return;
            };
            *slot = level;
        }
        self.update(&dev);
    }
}
