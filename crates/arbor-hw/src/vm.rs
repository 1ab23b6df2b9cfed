//! Process-memory fallback device.
//!
//! Attaches its `reg` window subtractively: any access no normal attachment
//! claims lands here. Accesses inside the configured stack region (or below
//! the heap break) fault in zeroed pages on demand; anything else is the
//! simulated equivalent of a segmentation fault: traced and answered with a
//! bus error, for the external core to turn into a signal.

use arbor_tree::{
    Access, AddressSpace, DecodeKind, Device, HwModel, Ioctl, Result, TreeError,
};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use tracing::warn;

const PAGE: u64 = 0x1000;

#[derive(Debug, Default)]
struct VmState {
    window: (AddressSpace, u64, u64),
    stack_base: u64,
    stack_size: u64,
    heap_base: u64,
    brk: u64,
    /// Page-aligned bases already backed by RAM.
    pages: BTreeSet<u64>,
}

impl VmState {
    fn in_stack(&self, addr: u64) -> bool {
        addr >= self.stack_base && addr < self.stack_base + self.stack_size
    }

    fn in_heap(&self, addr: u64) -> bool {
        addr >= self.heap_base && addr < self.brk
    }
}

pub struct HwVm {
    state: Rc<RefCell<VmState>>,
}

impl HwVm {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(VmState::default())),
        }
    }

    /// Backs the page containing `addr` with zeroed RAM, if the access is
    /// within growth policy. Returns whether the access may be retried.
    fn fault_in(&self, dev: &Device<'_>, addr: u64) -> bool {
        let (space, page, allowed) = {
            let state = self.state.borrow();
            let page = addr & !(PAGE - 1);
            let allowed = state.in_stack(addr) || state.in_heap(addr);
            (state.window.0, page, allowed && !state.pages.contains(&page))
        };
        if !allowed {
            return false;
        }
        match dev.attach_ram_to_parent(space, page, PAGE, Access::RWX) {
            Ok(()) => {
                self.state.borrow_mut().pages.insert(page);
                true
            }
            Err(err) => {
                warn!(dev = %dev.path(), %err, "demand page attach failed");
                false
            }
        }
    }
}

impl Default for HwVm {
    fn default() -> Self {
        Self::new()
    }
}

impl HwModel for HwVm {
    fn model_name(&self) -> &'static str {
        "vm"
    }

    fn init_address(&mut self, dev: Device<'_>) -> Result<()> {
        let reg = dev.find_ranges("reg")?;
        let [entry] = reg.as_slice() else {
            return Err(TreeError::Config {
                path: dev.path(),
                reason: "vm expects exactly one reg range".to_owned(),
            });
        };
        let parent = dev.parent().expect("vm is never the root");
        let (space, base) = dev.tree().address_to_attach(parent, &entry.addr, dev.id())?;
        let len = dev.tree().size_to_attach(parent, &entry.size, dev.id())?;
        dev.attach_to_parent(DecodeKind::Subtractive, space, base, len, Access::RWX)?;

        let mut state = self.state.borrow_mut();
        state.window = (space, base, len);
        // A full re-initialization dropped every demand-attached page.
        state.pages.clear();
        Ok(())
    }

    fn init_data(&mut self, dev: Device<'_>) -> Result<()> {
        let stack_base = dev.find_integer("stack-base")?;
        let stack_size = dev.find_integer("stack-size")?;
        let heap_base = dev.find_integer_or("heap-base", 0)?;

        let mut state = self.state.borrow_mut();
        let (_, base, len) = state.window;
        if stack_base < base || stack_base + stack_size > base + len {
            return Err(TreeError::Config {
                path: dev.path(),
                reason: format!(
                    "stack {stack_base:#x}+{stack_size:#x} lies outside the vm window {base:#x}+{len:#x}"
                ),
            });
        }
        state.stack_base = stack_base;
        state.stack_size = stack_size;
        state.heap_base = heap_base;
        state.brk = heap_base;
        Ok(())
    }

    fn io_read(&mut self, dev: Device<'_>, space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        if self.fault_in(&dev, addr) {
            return dev.tree().io_read(space, addr, buf);
        }
        warn!(dev = %dev.path(), addr = format_args!("{addr:#x}"), "read outside mapped process memory");
        0
    }

    fn io_write(&mut self, dev: Device<'_>, space: AddressSpace, addr: u64, buf: &[u8]) -> usize {
        if self.fault_in(&dev, addr) {
            return dev.tree().io_write(space, addr, buf);
        }
        warn!(dev = %dev.path(), addr = format_args!("{addr:#x}"), "write outside mapped process memory");
        0
    }

    fn ioctl(&mut self, dev: Device<'_>, request: Ioctl<'_>) -> Result<u64> {
        match request {
            Ioctl::Brk { addr } => {
                let (space, old_brk) = {
                    let state = self.state.borrow();
                    let (space, base, len) = state.window;
                    if addr < state.heap_base || addr > base + len {
                        return Err(TreeError::Config {
                            path: dev.path(),
                            reason: format!("brk {addr:#x} outside the heap region"),
                        });
                    }
                    (space, state.brk)
                };

                // Back every page the break moved over; shrinking keeps the
                // pages (contents survive, as process memory does).
                let mut page = old_brk & !(PAGE - 1);
                while page < addr {
                    let fresh = !self.state.borrow().pages.contains(&page);
                    if fresh {
                        dev.attach_ram_to_parent(space, page, PAGE, Access::RWX)?;
                        self.state.borrow_mut().pages.insert(page);
                    }
                    page += PAGE;
                }
                self.state.borrow_mut().brk = addr;
                Ok(old_brk)
            }
            _ => Err(TreeError::Unsupported {
                path: dev.path(),
                model: self.model_name(),
                capability: "ioctl",
            }),
        }
    }
}
