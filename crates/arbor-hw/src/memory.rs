//! RAM node: attaches its `reg` ranges as raw storage and tracks
//! claim/release bookkeeping through the `available` property.
//!
//! Logical consumers (firmware) allocate from the node with the instance
//! methods `claim(size, align)` and `release(addr, size)`. An alignment of
//! zero means byte-aligned first fit from the lowest available address.

use arbor_tree::{
    Access, AddressSpace, Device, HwModel, InstanceModel, PropertyValue, RegEntry, Result,
    TreeError, UnitAddress,
};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Default)]
struct MemoryState {
    /// Attached (space, base, len) ranges, fixed at `init_address`.
    regions: Vec<(AddressSpace, u64, u64)>,
    /// Unclaimed (base, len) ranges, kept sorted by base.
    available: Vec<(u64, u64)>,
}

impl MemoryState {
    fn claim(&mut self, size: u64, align: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let align = align.max(1);
        for (idx, (base, len)) in self.available.iter().copied().enumerate() {
            let Some(start) = base.checked_add(align - 1).map(|a| a / align * align) else {
                continue;
            };
            let Some(end) = start.checked_add(size) else {
                continue;
            };
            if end > base + len {
                continue;
            }

            // Split the range around the claimed chunk.
            self.available.remove(idx);
            if end < base + len {
                self.available.insert(idx, (end, base + len - end));
            }
            if start > base {
                self.available.insert(idx, (base, start - base));
            }
            return Some(start);
        }
        None
    }

    fn release(&mut self, addr: u64, size: u64) {
        if size == 0 {
            return;
        }
        let idx = self.available.partition_point(|(base, _)| *base < addr);
        self.available.insert(idx, (addr, size));

        // Coalesce neighbors.
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.available.len());
        for (base, len) in self.available.drain(..) {
            match merged.last_mut() {
                Some((last_base, last_len)) if *last_base + *last_len == base => {
                    *last_len += len;
                }
                _ => merged.push((base, len)),
            }
        }
        self.available = merged;
    }
}

/// The `memory` device model.
pub struct HwMemory {
    state: Rc<RefCell<MemoryState>>,
}

impl HwMemory {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(MemoryState::default())),
        }
    }
}

impl Default for HwMemory {
    fn default() -> Self {
        Self::new()
    }
}

fn publish_available(dev: &Device<'_>, state: &MemoryState) {
    let parent = dev.parent().map(|p| dev.tree().device(p));
    let addr_cells = parent.as_ref().map_or(1, |p| p.address_cells());
    let size_cells = parent.as_ref().map_or(1, |p| p.size_cells());

    let entries: Vec<RegEntry> = state
        .available
        .iter()
        .map(|(base, len)| {
            RegEntry::new(
                UnitAddress::from_u64(*base, addr_cells),
                UnitAddress::from_u64(*len, size_cells),
            )
        })
        .collect();
    dev.set_property("available", PropertyValue::Ranges(entries));
}

impl HwModel for HwMemory {
    fn model_name(&self) -> &'static str {
        "memory"
    }

    fn init_address(&mut self, dev: Device<'_>) -> Result<()> {
        let regions = dev.attach_reg_ranges(Access::RWX, true)?;
        self.state.borrow_mut().regions = regions;
        Ok(())
    }

    fn init_data(&mut self, dev: Device<'_>) -> Result<()> {
        // Reset forgets every claim; the whole of `reg` becomes available.
        let mut state = self.state.borrow_mut();
        state.available = state
            .regions
            .iter()
            .map(|(_, base, len)| (*base, *len))
            .collect();
        state.available.sort_unstable();
        publish_available(&dev, &state);
        Ok(())
    }

    fn create_instance(&mut self, _dev: Device<'_>, _args: &str) -> Result<Box<dyn InstanceModel>> {
        Ok(Box::new(MemoryInstance {
            state: self.state.clone(),
        }))
    }
}

struct MemoryInstance {
    state: Rc<RefCell<MemoryState>>,
}

impl InstanceModel for MemoryInstance {
    fn call_method(&mut self, dev: Device<'_>, method: &str, args: &[u64]) -> Result<Vec<u64>> {
        match method {
            "claim" => {
                let &[size, align] = args else {
                    return Err(TreeError::Config {
                        path: dev.path(),
                        reason: "claim expects (size, align)".to_owned(),
                    });
                };
                let mut state = self.state.borrow_mut();
                let addr = state.claim(size, align).ok_or_else(|| TreeError::Config {
                    path: dev.path(),
                    reason: format!("cannot claim {size:#x} bytes (align {align:#x})"),
                })?;
                publish_available(&dev, &state);
                Ok(vec![addr])
            }
            "release" => {
                let &[addr, size] = args else {
                    return Err(TreeError::Config {
                        path: dev.path(),
                        reason: "release expects (addr, size)".to_owned(),
                    });
                };
                let mut state = self.state.borrow_mut();
                state.release(addr, size);
                publish_available(&dev, &state);
                Ok(vec![])
            }
            other => Err(TreeError::Config {
                path: dev.path(),
                reason: format!("memory instance has no \"{other}\" method"),
            }),
        }
    }
}
