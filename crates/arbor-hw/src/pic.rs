//! Programmable interrupt controller.
//!
//! Sources carry a priority, vector, mask bit and a destination bitmask;
//! destinations carry a task-priority register and an in-service stack. A
//! source is deliverable to a destination only when its priority exceeds
//! both that destination's task priority and its current in-service
//! priority. A source eligible for several destinations goes to the
//! lowest-numbered one, a documented bias preserved because firmware may
//! depend on it rather than on any fairer distribution.
//!
//! Input ports are source numbers; output port `PORT_OUT_BASE + d` follows
//! destination `d`'s request line.
//!
//! Register window (u32 little-endian):
//!
//! | offset | register |
//! |---|---|
//! | `0x000` | feature: `nr_sources << 16 \| nr_dests` (ro) |
//! | `0x004` | spurious vector |
//! | `0x100 + i*0x10` | source `i` vector/priority: bit 31 mask, 19:16 priority, 7:0 vector |
//! | `0x104 + i*0x10` | source `i` destination bitmask |
//! | `0x2000 + d*0x100` | destination `d` task priority |
//! | `0x2004 + d*0x100` | destination `d` acknowledge (ro, acks on read) |
//! | `0x2008 + d*0x100` | destination `d` end-of-interrupt (wo) |

use arbor_tree::{Access, AddressSpace, Device, DeviceId, HwModel, Result, TreeError};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

pub const PORT_OUT_BASE: u32 = 0x100;

const REG_FEATURE: u64 = 0x000;
const REG_SPURIOUS: u64 = 0x004;
const SRC_BASE: u64 = 0x100;
const SRC_STRIDE: u64 = 0x10;
const DEST_BASE: u64 = 0x2000;
const DEST_STRIDE: u64 = 0x100;

const IVPR_MASK: u32 = 1 << 31;

#[derive(Debug, Clone)]
struct Source {
    vector: u8,
    priority: u8,
    masked: bool,
    dest_mask: u32,
    /// Level on the wired input.
    asserted: bool,
    /// Latched request awaiting acknowledge.
    pending: bool,
}

impl Source {
    fn reset() -> Self {
        Self {
            vector: 0,
            priority: 0,
            masked: true,
            dest_mask: 1,
            asserted: false,
            pending: false,
        }
    }

    fn ivpr(&self) -> u32 {
        let mask = if self.masked { IVPR_MASK } else { 0 };
        mask | u32::from(self.priority & 0xF) << 16 | u32::from(self.vector)
    }
}

#[derive(Debug, Clone)]
struct Dest {
    task_priority: u8,
    /// Acknowledged-but-not-completed interrupts, in acknowledge order.
    in_service: Vec<(u8, usize)>,
    line: bool,
}

impl Dest {
    fn reset() -> Self {
        Self {
            // Reset blocks everything until software lowers it.
            task_priority: 15,
            in_service: Vec::new(),
            line: false,
        }
    }

    fn in_service_priority(&self) -> Option<u8> {
        self.in_service.iter().map(|(priority, _)| *priority).max()
    }
}

#[derive(Debug)]
struct PicState {
    base: u64,
    spurious: u8,
    sources: Vec<Source>,
    dests: Vec<Dest>,
}

impl PicState {
    /// The destination a deliverable source is routed to, per the
    /// lowest-numbered-destination rule.
    fn route(&self, src: usize) -> Option<usize> {
        let source = &self.sources[src];
        if !source.pending || source.masked {
            return None;
        }
        (0..self.dests.len()).find(|d| {
            let dest = &self.dests[*d];
            source.dest_mask & (1 << d) != 0
                && source.priority > dest.task_priority
                && dest.in_service_priority().is_none_or(|isp| source.priority > isp)
        })
    }

    /// Highest-priority source currently routed to `d` (ties go to the
    /// lowest source number).
    fn best_for(&self, d: usize) -> Option<usize> {
        (0..self.sources.len())
            .filter(|src| self.route(*src) == Some(d))
            .max_by_key(|src| (self.sources[*src].priority, std::cmp::Reverse(*src)))
    }
}

pub struct HwPic {
    state: Rc<RefCell<PicState>>,
}

impl HwPic {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(PicState {
                base: 0,
                spurious: 0xFF,
                sources: Vec::new(),
                dests: Vec::new(),
            })),
        }
    }

    /// Recomputes every request line, propagating edges.
    fn update_lines(&self, dev: &Device<'_>) {
        let edges: Vec<(u32, bool)> = {
            let mut state = self.state.borrow_mut();
            (0..state.dests.len())
                .filter_map(|d| {
                    let level = state.best_for(d).is_some();
                    if level != state.dests[d].line {
                        state.dests[d].line = level;
                        Some((PORT_OUT_BASE + d as u32, level))
                    } else {
                        None
                    }
                })
                .collect()
        };
        for (port, level) in edges {
            dev.set_interrupt(port, level);
        }
    }

    fn acknowledge(&self, d: usize) -> u32 {
        let mut state = self.state.borrow_mut();
        match state.best_for(d) {
            Some(src) => {
                let priority = state.sources[src].priority;
                let vector = state.sources[src].vector;
                state.sources[src].pending = false;
                state.dests[d].in_service.push((priority, src));
                u32::from(vector)
            }
            None => u32::from(state.spurious),
        }
    }

    fn end_of_interrupt(&self, d: usize) {
        let mut state = self.state.borrow_mut();
        let Some(top) = state.dests[d]
            .in_service
            .iter()
            .enumerate()
            .max_by_key(|(idx, (priority, _))| (*priority, *idx))
            .map(|(idx, _)| idx)
        else {
            return;
        };
        let (_, src) = state.dests[d].in_service.remove(top);
        // Level-triggered: a still-asserted source re-pends immediately.
        if state.sources[src].asserted {
            state.sources[src].pending = true;
        }
    }
}

impl Default for HwPic {
    fn default() -> Self {
        Self::new()
    }
}

impl HwModel for HwPic {
    fn model_name(&self) -> &'static str {
        "pic"
    }

    fn init_address(&mut self, dev: Device<'_>) -> Result<()> {
        let ranges = dev.attach_reg_ranges(Access::RW, false)?;
        self.state.borrow_mut().base = ranges[0].1;
        Ok(())
    }

    fn init_data(&mut self, dev: Device<'_>) -> Result<()> {
        let nr_sources = dev.find_integer_or("nr-sources", 16)? as usize;
        let nr_dests = dev.find_integer_or("nr-dests", 1)? as usize;
        if nr_sources == 0 || nr_dests == 0 || nr_dests > 32 {
            return Err(TreeError::Config {
                path: dev.path(),
                reason: format!("unsupported geometry: {nr_sources} sources, {nr_dests} destinations"),
            });
        }
        let mut state = self.state.borrow_mut();
        state.spurious = 0xFF;
        state.sources = vec![Source::reset(); nr_sources];
        state.dests = vec![Dest::reset(); nr_dests];
        Ok(())
    }

    fn io_read(&mut self, dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        if buf.len() < 4 {
            return 0;
        }
        let offset = addr - self.state.borrow().base;
        let value: u32 = if offset == REG_FEATURE {
            let state = self.state.borrow();
            (state.sources.len() as u32) << 16 | state.dests.len() as u32
        } else if offset == REG_SPURIOUS {
            u32::from(self.state.borrow().spurious)
        } else if offset >= DEST_BASE {
            let d = ((offset - DEST_BASE) / DEST_STRIDE) as usize;
            let reg = (offset - DEST_BASE) % DEST_STRIDE;
            if d >= self.state.borrow().dests.len() {
                return 0;
            }
            match reg {
                0x0 => u32::from(self.state.borrow().dests[d].task_priority),
                0x4 => {
                    let vector = self.acknowledge(d);
                    self.update_lines(&dev);
                    vector
                }
                _ => return 0,
            }
        } else if offset >= SRC_BASE {
            let i = ((offset - SRC_BASE) / SRC_STRIDE) as usize;
            let reg = (offset - SRC_BASE) % SRC_STRIDE;
            let state = self.state.borrow();
            if i >= state.sources.len() {
                return 0;
            }
            match reg {
                0x0 => state.sources[i].ivpr(),
                0x4 => state.sources[i].dest_mask,
                _ => return 0,
            }
        } else {
            return 0;
        };
        buf[..4].copy_from_slice(&value.to_le_bytes());
        4
    }

    fn io_write(&mut self, dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &[u8]) -> usize {
        if buf.len() < 4 {
            return 0;
        }
        let value = u32::from_le_bytes(buf[..4].try_into().expect("length checked"));
        let offset = addr - self.state.borrow().base;

        if offset == REG_SPURIOUS {
            self.state.borrow_mut().spurious = value as u8;
        } else if offset >= DEST_BASE {
            let d = ((offset - DEST_BASE) / DEST_STRIDE) as usize;
            let reg = (offset - DEST_BASE) % DEST_STRIDE;
            if d >= self.state.borrow().dests.len() {
                return 0;
            }
            match reg {
                0x0 => self.state.borrow_mut().dests[d].task_priority = (value & 0xF) as u8,
                0x8 => self.end_of_interrupt(d),
                _ => return 0,
            }
        } else if offset >= SRC_BASE {
            let i = ((offset - SRC_BASE) / SRC_STRIDE) as usize;
            let reg = (offset - SRC_BASE) % SRC_STRIDE;
            let mut state = self.state.borrow_mut();
            if i >= state.sources.len() {
                return 0;
            }
            match reg {
                0x0 => {
                    let source = &mut state.sources[i];
                    source.masked = value & IVPR_MASK != 0;
                    source.priority = (value >> 16 & 0xF) as u8;
                    source.vector = value as u8;
                }
                0x4 => state.sources[i].dest_mask = value,
                _ => return 0,
            }
        } else {
            return 0;
        }

        self.update_lines(&dev);
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
            let Some(source) = state.sources.get_mut(port as usize) else {
                debug!(dev = %dev.path(), port, "interrupt on unknown pic source ignored");
                return;
            };
            source.asserted = level;
            source.pending = level;
        }
        self.update_lines(&dev);
    }
}
