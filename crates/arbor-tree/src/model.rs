//! The capability contract every peripheral model implements.
//!
//! Each trait method is one capability slot. Default bodies encode the
//! framework-wide policy for a model that does not supply the capability:
//!
//! - address attachment and DMA default to *pass-through to the parent*,
//!   which is the documented behavior for transparent bridges and for DMA
//!   writes;
//! - unit conversion defaults to the generic comma-separated cell grammar;
//! - register I/O and interrupt delivery have no meaningful fallback, so the
//!   defaults abort: being invoked there means the tree wiring names a device
//!   that cannot satisfy the request, which is a configuration bug, never a
//!   runtime condition;
//! - instance creation and ioctls report [`TreeError::Unsupported`].

use crate::error::{Result, TreeError};
use crate::tree::{Device, DeviceId};
use crate::unit::{parse_units, UnitAddress};
use arbor_coremap::{Access, AddressSpace, DecodeKind};

/// A child's request to map one of its address ranges into an ancestor's
/// address space.
#[derive(Debug, Clone, Copy)]
pub struct AttachRequest {
    pub kind: DecodeKind,
    pub space: AddressSpace,
    pub addr: u64,
    pub len: u64,
    pub access: Access,
    /// The range is backed by raw storage allocated in the core map rather
    /// than dispatched back to `who`.
    pub ram: bool,
    /// Originating device; dispatch target for non-`ram` attachments.
    pub who: DeviceId,
}

/// Out-of-contract operations a model may accept.
#[derive(Debug, Clone, Copy)]
pub enum Ioctl<'a> {
    /// Swap the backing medium of a removable device.
    ChangeMedia { path: Option<&'a str> },
    /// Move a process-memory device's heap break.
    Brk { addr: u64 },
    /// Model-specific escape hatch.
    Custom { request: u32, args: &'a [u64] },
}

pub(crate) fn missing_capability(dev: &Device<'_>, model: &str, capability: &str) -> ! {
    panic!(
        "{}: capability \"{capability}\" invoked on the {model} model, which does not provide it",
        dev.path()
    );
}

fn unsupported(dev: &Device<'_>, model: &'static str, capability: &'static str) -> TreeError {
    TreeError::Unsupported {
        path: dev.path(),
        model,
        capability,
    }
}

/// The polymorphic device surface. See the module docs for the default
/// policy of each slot.
pub trait HwModel: 'static {
    /// Model name for diagnostics (`"eeprom"`, `"phb"`, ...).
    fn model_name(&self) -> &'static str;

    /// First init phase: attach the node's declared ranges to its parent.
    fn init_address(&mut self, dev: Device<'_>) -> Result<()> {
        let _ = dev;
        Ok(())
    }

    /// Second init phase: allocate and reset internal state. Re-invoked on
    /// simulated reset, so implementations free prior state first.
    fn init_data(&mut self, dev: Device<'_>) -> Result<()> {
        let _ = dev;
        Ok(())
    }

    /// A descendant wants `req` mapped into this node's address space.
    fn attach_address(&mut self, dev: Device<'_>, req: AttachRequest) -> Result<()> {
        dev.forward_attach(req)
    }

    fn detach_address(&mut self, dev: Device<'_>, req: AttachRequest) -> Result<()> {
        dev.forward_detach(req)
    }

    /// Synchronous register read. Returns bytes transferred; a short count
    /// is a bus error.
    fn io_read(&mut self, dev: Device<'_>, space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        let _ = (space, addr, buf);
        missing_capability(&dev, self.model_name(), "io-read")
    }

    /// Synchronous register write. Returns bytes transferred.
    fn io_write(&mut self, dev: Device<'_>, space: AddressSpace, addr: u64, buf: &[u8]) -> usize {
        let _ = (space, addr, buf);
        missing_capability(&dev, self.model_name(), "io-write")
    }

    /// Device-initiated read routed through this node's address space.
    fn dma_read(&mut self, dev: Device<'_>, space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        dev.forward_dma_read(space, addr, buf)
    }

    /// Device-initiated write routed through this node's address space.
    /// `violate_read_only` resolves through the readable view, the loader
    /// path for write-protected regions.
    fn dma_write(
        &mut self,
        dev: Device<'_>,
        space: AddressSpace,
        addr: u64,
        buf: &[u8],
        violate_read_only: bool,
    ) -> usize {
        dev.forward_dma_write(space, addr, buf, violate_read_only)
    }

    /// A wired input port changed level.
    fn interrupt_event(
        &mut self,
        dev: Device<'_>,
        port: u32,
        source: DeviceId,
        source_port: u32,
        level: bool,
    ) {
        let _ = (port, source, source_port, level);
        missing_capability(&dev, self.model_name(), "interrupt-event");
    }

    /// Parses the textual unit address of a child of this node.
    fn unit_decode(&self, dev: Device<'_>, text: &str) -> Result<UnitAddress> {
        let n_cells = dev.address_cells();
        parse_units(text, n_cells).ok_or_else(|| TreeError::UnitAddress {
            path: dev.path(),
            unit: text.to_owned(),
            reason: format!("expected up to {n_cells} comma-separated cells"),
        })
    }

    /// Formats a child unit address in this node's grammar.
    fn unit_encode(&self, dev: Device<'_>, unit: &UnitAddress) -> Result<String> {
        let _ = dev;
        Ok(unit.to_string())
    }

    /// Flattens a child address into the (space, address) pair used by the
    /// core map. `who` is the requesting child; bus-specific grammars may
    /// consult its properties (e.g. base-register assignments).
    fn address_to_attach(
        &self,
        dev: Device<'_>,
        unit: &UnitAddress,
        who: DeviceId,
    ) -> Result<(AddressSpace, u64)> {
        let _ = who;
        match unit.as_u64() {
            Some(addr) => Ok((0, addr)),
            None => Err(TreeError::UnitAddress {
                path: dev.path(),
                unit: unit.to_string(),
                reason: "address does not fit the default flat address space".to_owned(),
            }),
        }
    }

    fn size_to_attach(&self, dev: Device<'_>, unit: &UnitAddress, who: DeviceId) -> Result<u64> {
        let _ = who;
        match unit.as_u64() {
            Some(size) => Ok(size),
            None => Err(TreeError::UnitAddress {
                path: dev.path(),
                unit: unit.to_string(),
                reason: "size does not fit 64 bits".to_owned(),
            }),
        }
    }

    /// Produces a logical handle bound to this node.
    fn create_instance(&mut self, dev: Device<'_>, args: &str) -> Result<Box<dyn InstanceModel>> {
        let _ = args;
        Err(unsupported(&dev, self.model_name(), "create-instance"))
    }

    fn ioctl(&mut self, dev: Device<'_>, request: Ioctl<'_>) -> Result<u64> {
        let _ = request;
        Err(unsupported(&dev, self.model_name(), "ioctl"))
    }
}

/// The narrow read/write/seek/method surface of a logical (firmware-level)
/// handle. Distinct from the node's register interface; each instance owns
/// its own cursor state.
pub trait InstanceModel: 'static {
    fn read(&mut self, dev: Device<'_>, buf: &mut [u8]) -> Result<usize> {
        let _ = buf;
        Err(unsupported(&dev, "instance", "read"))
    }

    fn write(&mut self, dev: Device<'_>, buf: &[u8]) -> Result<usize> {
        let _ = buf;
        Err(unsupported(&dev, "instance", "write"))
    }

    fn seek(&mut self, dev: Device<'_>, pos: u64) -> Result<()> {
        let _ = pos;
        Err(unsupported(&dev, "instance", "seek"))
    }

    fn call_method(&mut self, dev: Device<'_>, method: &str, args: &[u64]) -> Result<Vec<u64>> {
        let _ = args;
        Err(TreeError::Config {
            path: dev.path(),
            reason: format!("instance has no \"{method}\" method"),
        })
    }
}
