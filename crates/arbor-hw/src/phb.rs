//! PCI host bridge.
//!
//! The bridge owns one window per PCI address space (configuration, I/O,
//! 32/64-bit memory, special), each mapping a slice of the parent's flat
//! space onto the corresponding PCI space. CPU accesses inside a window are
//! re-dispatched into the PCI space; child attachments are validated against
//! the windows; bus-master DMA translates out through the separate
//! `dma-window` mapping.
//!
//! Child addresses use the three-cell form `(phys.hi, phys.mid, phys.lo)`
//! with `phys.hi = npt000ss bbbbbbbb dddddfff rrrrrrrr`, and the textual
//! grammar
//!
//! ```text
//! [n][i|m|x][t][p]<device-hex>[,<function-dec>[,<register-hex>,<value-hex>]]
//! ```
//!
//! (`n` non-relocatable, `i`/`m`/`x` I/O / 32-bit / 64-bit memory space,
//! configuration space without a letter; `t` aliased, `p` prefetchable,
//! memory only). A non-relocatable address resolves directly; a relocatable
//! one resolves through the requesting child's `assigned-addresses`.

use arbor_tree::{
    AddressSpace, AttachRequest, Device, DeviceId, HwModel, Result, TreeError, UnitAddress,
};
use std::cell::RefCell;

/// PCI address spaces as core-map space ids.
pub const SPACE_CONFIG: AddressSpace = 1;
pub const SPACE_IO: AddressSpace = 2;
pub const SPACE_MEM: AddressSpace = 3;
pub const SPACE_MEM64: AddressSpace = 4;
pub const SPACE_SPECIAL: AddressSpace = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciSpace {
    Config,
    Io,
    Mem32,
    Mem64,
}

impl PciSpace {
    fn code(self) -> u32 {
        match self {
            PciSpace::Config => 0b00,
            PciSpace::Io => 0b01,
            PciSpace::Mem32 => 0b10,
            PciSpace::Mem64 => 0b11,
        }
    }

    fn from_code(code: u32) -> PciSpace {
        match code & 0b11 {
            0b00 => PciSpace::Config,
            0b01 => PciSpace::Io,
            0b10 => PciSpace::Mem32,
            _ => PciSpace::Mem64,
        }
    }

    fn address_space(self) -> AddressSpace {
        match self {
            PciSpace::Config => SPACE_CONFIG,
            PciSpace::Io => SPACE_IO,
            PciSpace::Mem32 => SPACE_MEM,
            PciSpace::Mem64 => SPACE_MEM64,
        }
    }
}

/// A decoded PCI unit address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub non_relocatable: bool,
    pub aliased: bool,
    pub prefetchable: bool,
    pub space: PciSpace,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub register: u8,
    pub offset: u64,
}

impl PciAddress {
    pub fn to_cells(&self) -> UnitAddress {
        let hi = u32::from(self.non_relocatable) << 31
            | u32::from(self.prefetchable) << 30
            | u32::from(self.aliased) << 29
            | self.space.code() << 24
            | u32::from(self.bus) << 16
            | u32::from(self.device) << 11
            | u32::from(self.function) << 8
            | u32::from(self.register);
        UnitAddress::new(&[hi, (self.offset >> 32) as u32, self.offset as u32])
    }

    pub fn from_cells(unit: &UnitAddress) -> Option<PciAddress> {
        let &[hi, mid, lo] = unit.cells() else {
            return None;
        };
        Some(PciAddress {
            non_relocatable: hi >> 31 & 1 != 0,
            prefetchable: hi >> 30 & 1 != 0,
            aliased: hi >> 29 & 1 != 0,
            space: PciSpace::from_code(hi >> 24),
            bus: (hi >> 16) as u8,
            device: (hi >> 11 & 0x1F) as u8,
            function: (hi >> 8 & 0x7) as u8,
            register: hi as u8,
            offset: u64::from(mid) << 32 | u64::from(lo),
        })
    }

    /// Parses the textual grammar. `bus` is the bridge's bus number (the
    /// grammar does not carry one).
    pub fn parse(text: &str, bus: u8) -> Option<PciAddress> {
        let mut rest = text;
        let mut take = |flag: char| -> bool {
            if let Some(stripped) = rest.strip_prefix(flag) {
                rest = stripped;
                true
            } else {
                false
            }
        };

        let non_relocatable = take('n');
        let space = if take('i') {
            PciSpace::Io
        } else if take('m') {
            PciSpace::Mem32
        } else if take('x') {
            PciSpace::Mem64
        } else {
            PciSpace::Config
        };
        let aliased = take('t');
        let prefetchable = take('p');
        if prefetchable && !matches!(space, PciSpace::Mem32 | PciSpace::Mem64) {
            return None;
        }

        let mut fields = rest.split(',');
        let device = u8::from_str_radix(fields.next()?, 16).ok()?;
        if device > 0x1F {
            return None;
        }
        let function = match fields.next() {
            Some(text) => {
                let function: u8 = text.parse().ok()?;
                if function > 7 {
                    return None;
                }
                function
            }
            None => 0,
        };
        let (register, offset) = match fields.next() {
            Some(register_text) => {
                let register = u8::from_str_radix(register_text, 16).ok()?;
                let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
                (register, offset)
            }
            None => (0, 0),
        };
        if fields.next().is_some() {
            return None;
        }

        Some(PciAddress {
            non_relocatable,
            aliased,
            prefetchable,
            space,
            bus,
            device,
            function,
            register,
            offset,
        })
    }

    pub fn to_text(&self) -> String {
        let mut text = String::new();
        if self.non_relocatable {
            text.push('n');
        }
        match self.space {
            PciSpace::Config => {}
            PciSpace::Io => text.push('i'),
            PciSpace::Mem32 => text.push('m'),
            PciSpace::Mem64 => text.push('x'),
        }
        if self.aliased {
            text.push('t');
        }
        if self.prefetchable {
            text.push('p');
        }
        text.push_str(&format!(
            "{:x},{},{:x},{:x}",
            self.device, self.function, self.register, self.offset
        ));
        text
    }

    /// Flat offset of a configuration-space access.
    fn config_offset(&self) -> u64 {
        u64::from(self.bus) << 16
            | u64::from(self.device) << 11
            | u64::from(self.function) << 8
            | u64::from(self.register)
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    space: AddressSpace,
    child_base: u64,
    parent_base: u64,
    size: u64,
}

pub struct HwPhb {
    windows: RefCell<Vec<Window>>,
    dma_windows: RefCell<Vec<Window>>,
    bus: std::cell::Cell<u8>,
}

impl HwPhb {
    pub fn new() -> Self {
        Self {
            windows: RefCell::new(Vec::new()),
            dma_windows: RefCell::new(Vec::new()),
            bus: std::cell::Cell::new(0),
        }
    }

    fn window_for_space(&self, space: AddressSpace, addr: u64, len: u64) -> Option<Window> {
        self.windows
            .borrow()
            .iter()
            .copied()
            .find(|w| {
                w.space == space
                    && addr >= w.child_base
                    && addr.checked_add(len).is_some_and(|end| end <= w.child_base + w.size)
            })
    }

    fn window_for_parent(&self, addr: u64) -> Option<Window> {
        self.windows
            .borrow()
            .iter()
            .copied()
            .find(|w| addr >= w.parent_base && addr < w.parent_base + w.size)
    }

    /// The bus-master translation window (PCI memory space into the
    /// parent's space); distinct from the CPU-visible windows.
    fn dma_window(&self, space: AddressSpace, addr: u64, len: u64) -> Option<Window> {
        self.dma_windows
            .borrow()
            .iter()
            .copied()
            .find(|w| {
                w.space == space
                    && addr >= w.child_base
                    && addr.checked_add(len).is_some_and(|end| end <= w.child_base + w.size)
            })
    }

    /// Resolves a relocatable address through `who`'s `assigned-addresses`.
    fn resolve_relocatable(
        &self,
        dev: &Device<'_>,
        pci: &PciAddress,
        who: DeviceId,
    ) -> Result<u64> {
        let who_dev = dev.tree().device(who);
        let assigned = who_dev.find_ranges("assigned-addresses").map_err(|_| {
            TreeError::Config {
                path: dev.tree().path(who),
                reason: format!(
                    "relocatable address for register {:#x} needs an \"assigned-addresses\" property",
                    pci.register
                ),
            }
        })?;
        for entry in &assigned {
            let Some(candidate) = PciAddress::from_cells(&entry.addr) else {
                continue;
            };
            if candidate.non_relocatable
                && candidate.space == pci.space
                && candidate.register == pci.register
            {
                return Ok(candidate.offset);
            }
        }
        Err(TreeError::Config {
            path: dev.tree().path(who),
            reason: format!(
                "no assigned address for register {:#x} in {:?} space",
                pci.register, pci.space
            ),
        })
    }
}

impl Default for HwPhb {
    fn default() -> Self {
        Self::new()
    }
}

const WINDOW_PROPS: &[(AddressSpace, &str, &str)] = &[
    (SPACE_CONFIG, "config-window", "config-parent-base"),
    (SPACE_IO, "io-window", "io-parent-base"),
    (SPACE_MEM, "mem-window", "mem-parent-base"),
    (SPACE_MEM64, "mem64-window", "mem64-parent-base"),
    (SPACE_SPECIAL, "special-window", "special-parent-base"),
];

impl HwModel for HwPhb {
    fn model_name(&self) -> &'static str {
        "phb"
    }

    fn init_address(&mut self, dev: Device<'_>) -> Result<()> {
        self.bus.set(dev.find_integer_or("bus-number", 0)? as u8);

        let read_window = |window_prop: &'static str, parent_prop: &'static str, space: AddressSpace| -> Result<Window> {
            let entries = dev.find_ranges(window_prop)?;
            let [entry] = entries.as_slice() else {
                return Err(TreeError::Config {
                    path: dev.path(),
                    reason: format!("\"{window_prop}\" must contain exactly one range"),
                });
            };
            let child_base = entry.addr.as_u64().ok_or_else(|| TreeError::Config {
                path: dev.path(),
                reason: format!("\"{window_prop}\" base does not fit 64 bits"),
            })?;
            let size = entry.size.as_u64().ok_or_else(|| TreeError::Config {
                path: dev.path(),
                reason: format!("\"{window_prop}\" size does not fit 64 bits"),
            })?;
            let parent_base = if dev.has_property(parent_prop) {
                dev.find_integer(parent_prop)?
            } else {
                child_base
            };
            Ok(Window {
                space,
                child_base,
                parent_base,
                size,
            })
        };

        let mut windows = Vec::new();
        for (space, window_prop, parent_prop) in WINDOW_PROPS {
            if dev.has_property(window_prop) {
                windows.push(read_window(window_prop, parent_prop, *space)?);
            }
        }
        if windows.is_empty() {
            return Err(TreeError::Config {
                path: dev.path(),
                reason: "a host bridge needs at least one address-space window".to_owned(),
            });
        }

        let mut dma_windows = Vec::new();
        if dev.has_property("dma-window") {
            dma_windows.push(read_window("dma-window", "dma-parent-base", SPACE_MEM)?);
        }

        // Claim the parent-side windows so CPU accesses reach the bridge.
        for window in windows.iter() {
            dev.attach_to_parent(
                arbor_tree::DecodeKind::Normal,
                0,
                window.parent_base,
                window.size,
                arbor_tree::Access::RW,
            )?;
        }

        *self.windows.borrow_mut() = windows;
        *self.dma_windows.borrow_mut() = dma_windows;
        Ok(())
    }

    fn attach_address(&mut self, dev: Device<'_>, req: AttachRequest) -> Result<()> {
        if self.window_for_space(req.space, req.addr, req.len).is_none() {
            return Err(TreeError::Config {
                path: dev.path(),
                reason: format!(
                    "child range {:#x}:{:#x}+{:#x} lies outside every bridge window",
                    req.space, req.addr, req.len
                ),
            });
        }
        dev.forward_attach(req)
    }

    fn detach_address(&mut self, dev: Device<'_>, req: AttachRequest) -> Result<()> {
        dev.forward_detach(req)
    }

    fn io_read(&mut self, dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        let Some(window) = self.window_for_parent(addr) else {
            return 0;
        };
        let child_addr = window.child_base + (addr - window.parent_base);
        dev.tree().io_read(window.space, child_addr, buf)
    }

    fn io_write(&mut self, dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &[u8]) -> usize {
        let Some(window) = self.window_for_parent(addr) else {
            return 0;
        };
        let child_addr = window.child_base + (addr - window.parent_base);
        dev.tree().io_write(window.space, child_addr, buf)
    }

    fn dma_read(&mut self, dev: Device<'_>, space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        let Some(window) = self.dma_window(space, addr, buf.len() as u64) else {
            return 0;
        };
        let parent_addr = window.parent_base + (addr - window.child_base);
        dev.forward_dma_read(0, parent_addr, buf)
    }

    fn dma_write(
        &mut self,
        dev: Device<'_>,
        space: AddressSpace,
        addr: u64,
        buf: &[u8],
        violate_read_only: bool,
    ) -> usize {
        let Some(window) = self.dma_window(space, addr, buf.len() as u64) else {
            return 0;
        };
        let parent_addr = window.parent_base + (addr - window.child_base);
        dev.forward_dma_write(0, parent_addr, buf, violate_read_only)
    }

    fn unit_decode(&self, dev: Device<'_>, text: &str) -> Result<UnitAddress> {
        PciAddress::parse(text, self.bus.get())
            .map(|pci| pci.to_cells())
            .ok_or_else(|| TreeError::UnitAddress {
                path: dev.path(),
                unit: text.to_owned(),
                reason: "not a valid PCI unit address".to_owned(),
            })
    }

    fn unit_encode(&self, dev: Device<'_>, unit: &UnitAddress) -> Result<String> {
        let pci = PciAddress::from_cells(unit).ok_or_else(|| TreeError::UnitAddress {
            path: dev.path(),
            unit: unit.to_string(),
            reason: "a PCI unit address has three cells".to_owned(),
        })?;
        Ok(pci.to_text())
    }

    fn address_to_attach(
        &self,
        dev: Device<'_>,
        unit: &UnitAddress,
        who: DeviceId,
    ) -> Result<(AddressSpace, u64)> {
        let pci = PciAddress::from_cells(unit).ok_or_else(|| TreeError::UnitAddress {
            path: dev.path(),
            unit: unit.to_string(),
            reason: "a PCI unit address has three cells".to_owned(),
        })?;

        match pci.space {
            PciSpace::Config => Ok((SPACE_CONFIG, pci.config_offset())),
            _ if pci.non_relocatable => Ok((pci.space.address_space(), pci.offset)),
            _ => {
                let offset = self.resolve_relocatable(&dev, &pci, who)?;
                Ok((pci.space.address_space(), offset))
            }
        }
    }
}
