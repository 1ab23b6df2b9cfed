//! Transparent I/O bus: owns a window of its parent's address space and
//! forwards child attachments after checking they fall inside it.
//!
//! The bus itself never decodes an access; children attached through it are
//! dispatched directly by the core map.

use arbor_tree::{AddressSpace, AttachRequest, Device, HwModel, Result, TreeError};
use std::cell::Cell;

pub struct HwIoBus {
    window: Cell<Option<(AddressSpace, u64, u64)>>,
}

impl HwIoBus {
    pub fn new() -> Self {
        Self {
            window: Cell::new(None),
        }
    }

    fn check(&self, dev: &Device<'_>, req: &AttachRequest) -> Result<()> {
        let Some((space, base, len)) = self.window.get() else {
            return Err(TreeError::Config {
                path: dev.path(),
                reason: "bus window not initialized before child attachment".to_owned(),
            });
        };
        let fits = req.space == space
            && req.addr >= base
            && req
                .addr
                .checked_add(req.len)
                .is_some_and(|end| end <= base + len);
        if fits {
            Ok(())
        } else {
            Err(TreeError::Config {
                path: dev.path(),
                reason: format!(
                    "child range {:#x}:{:#x}+{:#x} lies outside the bus window {space:#x}:{base:#x}+{len:#x}",
                    req.space, req.addr, req.len
                ),
            })
        }
    }
}

impl Default for HwIoBus {
    fn default() -> Self {
        Self::new()
    }
}

impl HwModel for HwIoBus {
    fn model_name(&self) -> &'static str {
        "iobus"
    }

    fn init_address(&mut self, dev: Device<'_>) -> Result<()> {
        let reg = dev.find_ranges("reg")?;
        let [entry] = reg.as_slice() else {
            return Err(TreeError::Config {
                path: dev.path(),
                reason: "iobus expects exactly one reg range".to_owned(),
            });
        };
        let parent = dev.parent().expect("iobus is never the root");
        let (space, base) = dev.tree().address_to_attach(parent, &entry.addr, dev.id())?;
        let len = dev.tree().size_to_attach(parent, &entry.size, dev.id())?;
        self.window.set(Some((space, base, len)));
        Ok(())
    }

    fn attach_address(&mut self, dev: Device<'_>, req: AttachRequest) -> Result<()> {
        self.check(&dev, &req)?;
        dev.forward_attach(req)
    }

    fn detach_address(&mut self, dev: Device<'_>, req: AttachRequest) -> Result<()> {
        self.check(&dev, &req)?;
        dev.forward_detach(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HwMemory;
    use arbor_tree::{DeviceTree, PropertyValue, RegEntry, UnitAddress};

    fn reg(addr: u64, size: u64) -> PropertyValue {
        PropertyValue::Ranges(vec![RegEntry::new(
            UnitAddress::from_u64(addr, 1),
            UnitAddress::from_u64(size, 1),
        )])
    }

    #[test]
    fn children_inside_the_window_attach_through_the_bus() {
        let mut tree = DeviceTree::new();
        let root = tree.root();
        let bus = tree.add(root, "iobus@0x80000000", Box::new(HwIoBus::new())).unwrap();
        tree.set_property(bus, "reg", reg(0x8000_0000, 0x1000));
        let mem = tree.add(bus, "memory@0x80000400", Box::new(HwMemory::new())).unwrap();
        tree.set_property(mem, "reg", reg(0x8000_0400, 0x100));
        tree.init().unwrap();

        assert_eq!(tree.io_write(0, 0x8000_0410, b"ok"), 2);
        let mut out = [0u8; 2];
        assert_eq!(tree.io_read(0, 0x8000_0410, &mut out), 2);
        assert_eq!(&out, b"ok");
    }

    #[test]
    fn children_outside_the_window_are_a_config_error() {
        let mut tree = DeviceTree::new();
        let root = tree.root();
        let bus = tree.add(root, "iobus@0x80000000", Box::new(HwIoBus::new())).unwrap();
        tree.set_property(bus, "reg", reg(0x8000_0000, 0x1000));
        let mem = tree.add(bus, "memory@0x1000", Box::new(HwMemory::new())).unwrap();
        tree.set_property(mem, "reg", reg(0x1000, 0x100));

        let err = tree.init().unwrap_err();
        assert!(matches!(err, TreeError::Config { .. }), "{err}");
    }
}
