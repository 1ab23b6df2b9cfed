//! The device tree: node arena, bus dispatch, DMA routing, interrupt wiring
//! and instance creation.
//!
//! # Ownership
//!
//! Nodes live in an arena indexed by [`DeviceId`]; parent links are plain
//! indices, never owning references, so teardown is a straight drop of the
//! arena. Each node's model state sits behind its own `RefCell` and is only
//! ever reached through the capability surface; the single logical thread
//! makes borrows nest (a device asking its parent to DMA) but never alias.
//!
//! # Dispatch
//!
//! Topology changes (`add`, `wire`) need `&mut self`. Everything that runs
//! during simulation (bus access, DMA, interrupts, events, property
//! updates) takes `&self`, so device callbacks holding the shared borrow can call
//! back into the tree.

use crate::error::{Result, TreeError};
use crate::model::{AttachRequest, HwModel, InstanceModel, Ioctl};
use crate::props::{PropertyBag, PropertyValue, RegEntry};
use crate::unit::UnitAddress;
use arbor_coremap::{Access, AddressSpace, CoreMap, DecodeKind, Target};
use arbor_events::{EventHandle, EventQueue};
use std::cell::{RefCell, RefMut};
use tracing::debug;

/// Arena index of a device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u32);

impl DeviceId {
    fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Sink of an interrupt wire, fixed at tree-build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireDest {
    /// Input port on another device.
    Port { dev: DeviceId, port: u32 },
    /// An interrupt line of the external CPU core.
    CpuLine(u32),
}

#[derive(Debug, Clone, Copy)]
struct Wire {
    source_port: u32,
    dest: WireDest,
}

struct Node {
    name: String,
    unit: UnitAddress,
    unit_text: Option<String>,
    parent: Option<DeviceId>,
    children: Vec<DeviceId>,
    props: RefCell<PropertyBag>,
    model: RefCell<Box<dyn HwModel>>,
    wires: Vec<Wire>,
}

/// The rooted tree of simulated devices plus the fabric they share: the core
/// memory map and the event queue.
pub struct DeviceTree {
    nodes: Vec<Node>,
    core: RefCell<CoreMap<DeviceId>>,
    events: EventQueue<DeviceTree>,
    cpu_lines: RefCell<Vec<bool>>,
}

impl DeviceTree {
    /// Creates a tree containing only the root node. The root's model
    /// terminates address attachment and DMA in the core map.
    pub fn new() -> Self {
        let root = Node {
            name: String::new(),
            unit: UnitAddress::EMPTY,
            unit_text: None,
            parent: None,
            children: Vec::new(),
            props: RefCell::new(PropertyBag::new()),
            model: RefCell::new(Box::new(RootModel)),
            wires: Vec::new(),
        };
        Self {
            nodes: vec![root],
            core: RefCell::new(CoreMap::new()),
            events: EventQueue::new(),
            cpu_lines: RefCell::new(Vec::new()),
        }
    }

    pub fn root(&self) -> DeviceId {
        DeviceId(0)
    }

    fn node(&self, id: DeviceId) -> &Node {
        &self.nodes[id.idx()]
    }

    /// Borrows the context handle for `id`.
    pub fn device(&self, id: DeviceId) -> Device<'_> {
        Device { tree: self, id }
    }

    pub fn events(&self) -> &EventQueue<DeviceTree> {
        &self.events
    }

    /// Advances virtual time and fires everything that came due.
    pub fn tick(&self, ticks: u64) -> usize {
        self.events.advance(ticks);
        self.events.dispatch(self)
    }

    // ---------------------------------------------------------------------
    // Construction
    // ---------------------------------------------------------------------

    /// Adds a child of `parent`. `name` may carry a unit address
    /// (`"eeprom@0xfff00000"`), decoded by the parent's unit grammar; set the
    /// parent's `#address-cells` before adding children that use one.
    pub fn add(&mut self, parent: DeviceId, name: &str, model: Box<dyn HwModel>) -> Result<DeviceId> {
        let (base, unit_text) = match name.split_once('@') {
            Some((base, unit)) => (base, Some(unit.to_owned())),
            None => (name, None),
        };
        if base.is_empty() || base.contains('/') {
            return Err(TreeError::Config {
                path: self.path(parent),
                reason: format!("invalid device name \"{name}\""),
            });
        }

        let unit = match &unit_text {
            Some(text) => {
                let parent_model = self.node(parent).model.borrow();
                parent_model.unit_decode(self.device(parent), text)?
            }
            None => UnitAddress::EMPTY,
        };

        let id = DeviceId(u32::try_from(self.nodes.len()).expect("node count fits u32"));
        self.nodes.push(Node {
            name: base.to_owned(),
            unit,
            unit_text,
            parent: Some(parent),
            children: Vec::new(),
            props: RefCell::new(PropertyBag::new()),
            model: RefCell::new(model),
            wires: Vec::new(),
        });
        self.nodes[parent.idx()].children.push(id);
        Ok(id)
    }

    /// Sets a property on `id`. Usable both at build time and from device
    /// callbacks (e.g. a memory node maintaining `available`).
    pub fn set_property(&self, id: DeviceId, name: &str, value: impl Into<PropertyValue>) {
        self.node(id).props.borrow_mut().set(name, value.into());
    }

    pub fn property(&self, id: DeviceId, name: &str) -> Option<PropertyValue> {
        self.node(id).props.borrow().get(name).cloned()
    }

    /// Wires `source`'s output port to an input port on `dest`.
    pub fn wire(&mut self, source: DeviceId, source_port: u32, dest: DeviceId, dest_port: u32) {
        self.nodes[source.idx()].wires.push(Wire {
            source_port,
            dest: WireDest::Port {
                dev: dest,
                port: dest_port,
            },
        });
    }

    /// Wires `source`'s output port to a CPU interrupt line.
    pub fn wire_to_cpu(&mut self, source: DeviceId, source_port: u32, line: u32) {
        let mut lines = self.cpu_lines.borrow_mut();
        if lines.len() <= line as usize {
            lines.resize(line as usize + 1, false);
        }
        drop(lines);
        self.nodes[source.idx()].wires.push(Wire {
            source_port,
            dest: WireDest::CpuLine(line),
        });
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    fn walk_order(&self) -> Vec<DeviceId> {
        // Parents strictly before children.
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            order.push(id);
            // Reverse keeps sibling order in the output.
            stack.extend(self.node(id).children.iter().rev().copied());
        }
        order
    }

    /// Runs both initialization phases. `init_address` walks parents-first
    /// (a bus must know its window before its children attach through it);
    /// `init_data` walks leaves-first, so a controller can bind instances of
    /// children whose state already exists. Any previous attachments are
    /// dropped first, so a full re-init is equivalent to a fresh bring-up.
    pub fn init(&self) -> Result<()> {
        self.core.borrow_mut().clear();
        for id in self.walk_order() {
            self.node(id).model.borrow_mut().init_address(self.device(id))?;
        }
        for id in self.walk_order().into_iter().rev() {
            self.node(id).model.borrow_mut().init_data(self.device(id))?;
        }
        Ok(())
    }

    /// Simulated reset: re-runs the data-initialization phase only. Address
    /// attachments survive a reset.
    pub fn reset(&self) -> Result<()> {
        for id in self.walk_order().into_iter().rev() {
            self.node(id).model.borrow_mut().init_data(self.device(id))?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Paths and lookup
    // ---------------------------------------------------------------------

    pub fn path(&self, id: DeviceId) -> String {
        if self.node(id).parent.is_none() {
            return "/".to_owned();
        }
        let mut segments = Vec::new();
        let mut cur = Some(id);
        while let Some(this) = cur {
            let node = self.node(this);
            if node.parent.is_none() {
                break;
            }
            match &node.unit_text {
                Some(unit) => segments.push(format!("{}@{}", node.name, unit)),
                None => segments.push(node.name.clone()),
            }
            cur = node.parent;
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }

    /// Resolves an absolute path (`"/iobus@0x80000000/eeprom@0x0"`). A
    /// component without a unit address matches the first child with that
    /// name.
    pub fn find(&self, path: &str) -> Result<DeviceId> {
        let Some(rest) = path.strip_prefix('/') else {
            return Err(TreeError::NoSuchDevice {
                path: path.to_owned(),
            });
        };

        let mut cur = self.root();
        for component in rest.split('/').filter(|c| !c.is_empty()) {
            let (base, unit_text) = match component.split_once('@') {
                Some((base, unit)) => (base, Some(unit)),
                None => (component, None),
            };
            let unit = match unit_text {
                Some(text) => {
                    let model = self.node(cur).model.borrow();
                    Some(model.unit_decode(self.device(cur), text)?)
                }
                None => None,
            };

            let next = self.node(cur).children.iter().copied().find(|child| {
                let node = self.node(*child);
                node.name == base && unit.map_or(true, |u| node.unit == u)
            });
            cur = next.ok_or_else(|| TreeError::NoSuchDevice {
                path: path.to_owned(),
            })?;
        }
        Ok(cur)
    }

    pub fn parent(&self, id: DeviceId) -> Option<DeviceId> {
        self.node(id).parent
    }

    pub fn children(&self, id: DeviceId) -> Vec<DeviceId> {
        self.node(id).children.clone()
    }

    fn model_mut(&self, id: DeviceId) -> RefMut<'_, Box<dyn HwModel>> {
        self.node(id).model.borrow_mut()
    }

    // ---------------------------------------------------------------------
    // Bus access (CPU-core boundary)
    // ---------------------------------------------------------------------

    /// Synchronous bus read. Returns bytes transferred; short = bus error.
    pub fn io_read(&self, space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        self.core_read(Access::READ, space, addr, buf)
    }

    pub fn io_write(&self, space: AddressSpace, addr: u64, buf: &[u8]) -> usize {
        self.core_write(Access::WRITE, space, addr, buf)
    }

    /// Instruction fetch: resolves through the executable view.
    pub fn fetch(&self, space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        self.core_read(Access::EXEC, space, addr, buf)
    }

    /// Loader-style store: resolves through the readable view, bypassing
    /// write protection.
    pub fn write_privileged(&self, space: AddressSpace, addr: u64, buf: &[u8]) -> usize {
        self.core_write(Access::READ, space, addr, buf)
    }

    fn core_read(&self, view: Access, space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        let mut done = 0;
        while done < buf.len() {
            let Some(cur) = addr.checked_add(done as u64) else {
                break;
            };
            // The borrow must not outlive the lookup: a dispatched device may
            // re-enter the map (DMA, nested attach).
            let hit = self.core.borrow().resolve(view, space, cur);
            let Some(hit) = hit else {
                debug!(space, addr = format_args!("{cur:#x}"), "read master abort");
                break;
            };
            let avail = (hit.base + hit.len - cur) as usize;
            let take = avail.min(buf.len() - done);
            let chunk = &mut buf[done..done + take];
            let n = match hit.target {
                Target::Block(block) => {
                    let core = self.core.borrow();
                    let offset = (cur - hit.base) as usize;
                    chunk.copy_from_slice(&core.block(block)[offset..offset + take]);
                    take
                }
                Target::Device(dev) => {
                    self.model_mut(dev).io_read(self.device(dev), space, cur, chunk)
                }
            };
            done += n;
            if n < take {
                break;
            }
        }
        done
    }

    fn core_write(&self, view: Access, space: AddressSpace, addr: u64, buf: &[u8]) -> usize {
        let mut done = 0;
        while done < buf.len() {
            let Some(cur) = addr.checked_add(done as u64) else {
                break;
            };
            let hit = self.core.borrow().resolve(view, space, cur);
            let Some(hit) = hit else {
                debug!(space, addr = format_args!("{cur:#x}"), "write master abort");
                break;
            };
            let avail = (hit.base + hit.len - cur) as usize;
            let take = avail.min(buf.len() - done);
            let chunk = &buf[done..done + take];
            let n = match hit.target {
                Target::Block(block) => {
                    let mut core = self.core.borrow_mut();
                    let offset = (cur - hit.base) as usize;
                    core.block_mut(block)[offset..offset + take].copy_from_slice(chunk);
                    take
                }
                Target::Device(dev) => {
                    self.model_mut(dev).io_write(self.device(dev), space, cur, chunk)
                }
            };
            done += n;
            if n < take {
                break;
            }
        }
        done
    }

    // ---------------------------------------------------------------------
    // Interrupts
    // ---------------------------------------------------------------------

    /// Propagates a level change on `source`'s output port along its wiring.
    ///
    /// Wiring is fixed at build time; propagation is synchronous and must
    /// not loop back into `source_port` during a single assertion (no
    /// combinational-oscillation handling is provided).
    pub fn set_interrupt(&self, source: DeviceId, source_port: u32, level: bool) {
        let wires: Vec<Wire> = self
            .node(source)
            .wires
            .iter()
            .filter(|w| w.source_port == source_port)
            .copied()
            .collect();
        if wires.is_empty() {
            // A polled device with no interrupt wiring is a legal
            // configuration; the edge just goes nowhere.
            debug!(
                dev = %self.path(source),
                port = source_port,
                "interrupt on unwired output port dropped"
            );
            return;
        }
        for wire in wires {
            match wire.dest {
                WireDest::Port { dev, port } => {
                    self.model_mut(dev).interrupt_event(
                        self.device(dev),
                        port,
                        source,
                        source_port,
                        level,
                    );
                }
                WireDest::CpuLine(line) => {
                    self.cpu_lines.borrow_mut()[line as usize] = level;
                }
            }
        }
    }

    /// Current level of a CPU interrupt line (false if never wired).
    pub fn cpu_line(&self, line: u32) -> bool {
        self.cpu_lines
            .borrow()
            .get(line as usize)
            .copied()
            .unwrap_or(false)
    }

    // ---------------------------------------------------------------------
    // DMA plumbing
    // ---------------------------------------------------------------------

    fn dma_read_from(&self, child: DeviceId, space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        match self.node(child).parent {
            Some(p) => self.model_mut(p).dma_read(self.device(p), space, addr, buf),
            None => self.core_read(Access::READ, space, addr, buf),
        }
    }

    fn dma_write_from(
        &self,
        child: DeviceId,
        space: AddressSpace,
        addr: u64,
        buf: &[u8],
        violate_read_only: bool,
    ) -> usize {
        match self.node(child).parent {
            Some(p) => {
                self.model_mut(p)
                    .dma_write(self.device(p), space, addr, buf, violate_read_only)
            }
            None => {
                let view = if violate_read_only {
                    Access::READ
                } else {
                    Access::WRITE
                };
                self.core_write(view, space, addr, buf)
            }
        }
    }

    fn attach_from(&self, child: DeviceId, req: AttachRequest) -> Result<()> {
        match self.node(child).parent {
            Some(p) => self.model_mut(p).attach_address(self.device(p), req),
            None => RootModel.attach_address(self.device(child), req),
        }
    }

    fn detach_from(&self, child: DeviceId, req: AttachRequest) -> Result<()> {
        match self.node(child).parent {
            Some(p) => self.model_mut(p).detach_address(self.device(p), req),
            None => RootModel.detach_address(self.device(child), req),
        }
    }

    // ---------------------------------------------------------------------
    // Instances and ioctls
    // ---------------------------------------------------------------------

    /// Creates a logical handle from `"path[:args]"`, e.g. `"/disk@0:1"` for
    /// partition 1.
    pub fn create_instance(&self, spec: &str) -> Result<Instance> {
        let (path, args) = split_instance_spec(spec);
        let id = self.find(path)?;
        self.instantiate(id, args.unwrap_or(""))
    }

    /// Creates a logical handle for an already-resolved node (the route used
    /// by controllers instantiating their own children).
    pub fn instantiate(&self, id: DeviceId, args: &str) -> Result<Instance> {
        let model = self.model_mut(id).create_instance(self.device(id), args)?;
        Ok(Instance { id, model })
    }

    pub fn ioctl(&self, id: DeviceId, request: Ioctl<'_>) -> Result<u64> {
        self.model_mut(id).ioctl(self.device(id), request)
    }

    /// Decodes `text` in `decoder`'s unit grammar.
    pub fn unit_decode(&self, decoder: DeviceId, text: &str) -> Result<UnitAddress> {
        self.node(decoder)
            .model
            .borrow()
            .unit_decode(self.device(decoder), text)
    }

    /// Formats `unit` in `decoder`'s unit grammar.
    pub fn unit_encode(&self, decoder: DeviceId, unit: &UnitAddress) -> Result<String> {
        self.node(decoder)
            .model
            .borrow()
            .unit_encode(self.device(decoder), unit)
    }

    /// Flattens a child address through `decoder`'s conversion capability.
    pub fn address_to_attach(
        &self,
        decoder: DeviceId,
        unit: &UnitAddress,
        who: DeviceId,
    ) -> Result<(AddressSpace, u64)> {
        self.node(decoder)
            .model
            .borrow()
            .address_to_attach(self.device(decoder), unit, who)
    }

    /// Flattens a child size through `decoder`'s conversion capability.
    pub fn size_to_attach(&self, decoder: DeviceId, unit: &UnitAddress, who: DeviceId) -> Result<u64> {
        self.node(decoder)
            .model
            .borrow()
            .size_to_attach(self.device(decoder), unit, who)
    }
}

impl Default for DeviceTree {
    fn default() -> Self {
        Self::new()
    }
}

fn split_instance_spec(spec: &str) -> (&str, Option<&str>) {
    let last_component = spec.rfind('/').map(|i| i + 1).unwrap_or(0);
    match spec[last_component..].find(':') {
        Some(colon) => (
            &spec[..last_component + colon],
            Some(&spec[last_component + colon + 1..]),
        ),
        None => (spec, None),
    }
}

// -------------------------------------------------------------------------
// Device: the per-callback context handle
// -------------------------------------------------------------------------

/// A node's view of the tree, handed to every capability callback.
#[derive(Clone, Copy)]
pub struct Device<'t> {
    tree: &'t DeviceTree,
    id: DeviceId,
}

impl<'t> Device<'t> {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn tree(&self) -> &'t DeviceTree {
        self.tree
    }

    pub fn path(&self) -> String {
        self.tree.path(self.id)
    }

    pub fn parent(&self) -> Option<DeviceId> {
        self.tree.node(self.id).parent
    }

    pub fn unit(&self) -> UnitAddress {
        self.tree.node(self.id).unit
    }

    /// `#address-cells` of this node (how many cells its children's
    /// addresses carry). Defaults to 1.
    pub fn address_cells(&self) -> usize {
        match self.tree.node(self.id).props.borrow().get("#address-cells") {
            Some(PropertyValue::Integer(n)) => *n as usize,
            _ => 1,
        }
    }

    /// `#size-cells` of this node. Defaults to 1.
    pub fn size_cells(&self) -> usize {
        match self.tree.node(self.id).props.borrow().get("#size-cells") {
            Some(PropertyValue::Integer(n)) => *n as usize,
            _ => 1,
        }
    }

    // --- typed property access -------------------------------------------

    pub fn has_property(&self, name: &str) -> bool {
        self.tree.node(self.id).props.borrow().contains(name)
    }

    pub fn find_integer(&self, name: &'static str) -> Result<u64> {
        match self.tree.node(self.id).props.borrow().get(name) {
            Some(PropertyValue::Integer(v)) => Ok(*v),
            Some(_) => Err(self.property_type_error(name, "integer")),
            None => Err(self.missing_property(name)),
        }
    }

    /// Missing property yields `default`; a property of the wrong type is
    /// still a configuration error.
    pub fn find_integer_or(&self, name: &'static str, default: u64) -> Result<u64> {
        match self.tree.node(self.id).props.borrow().get(name) {
            Some(PropertyValue::Integer(v)) => Ok(*v),
            Some(_) => Err(self.property_type_error(name, "integer")),
            None => Ok(default),
        }
    }

    pub fn find_string(&self, name: &'static str) -> Result<String> {
        match self.tree.node(self.id).props.borrow().get(name) {
            Some(PropertyValue::String(v)) => Ok(v.clone()),
            Some(_) => Err(self.property_type_error(name, "string")),
            None => Err(self.missing_property(name)),
        }
    }

    pub fn find_string_opt(&self, name: &'static str) -> Result<Option<String>> {
        match self.tree.node(self.id).props.borrow().get(name) {
            Some(PropertyValue::String(v)) => Ok(Some(v.clone())),
            Some(_) => Err(self.property_type_error(name, "string")),
            None => Ok(None),
        }
    }

    pub fn find_bytes(&self, name: &'static str) -> Result<Vec<u8>> {
        match self.tree.node(self.id).props.borrow().get(name) {
            Some(PropertyValue::Bytes(v)) => Ok(v.clone()),
            Some(_) => Err(self.property_type_error(name, "byte array")),
            None => Err(self.missing_property(name)),
        }
    }

    pub fn find_ranges(&self, name: &'static str) -> Result<Vec<RegEntry>> {
        match self.tree.node(self.id).props.borrow().get(name) {
            Some(PropertyValue::Ranges(v)) => Ok(v.clone()),
            Some(_) => Err(self.property_type_error(name, "address/size tuple array")),
            None => Err(self.missing_property(name)),
        }
    }

    pub fn set_property(&self, name: &str, value: impl Into<PropertyValue>) {
        self.tree.set_property(self.id, name, value);
    }

    fn missing_property(&self, name: &'static str) -> TreeError {
        TreeError::MissingProperty {
            path: self.path(),
            name,
        }
    }

    fn property_type_error(&self, name: &'static str, expected: &'static str) -> TreeError {
        TreeError::PropertyType {
            path: self.path(),
            name,
            expected,
        }
    }

    // --- address attachment ----------------------------------------------

    /// Asks the parent to map `[addr, addr+len)` of `space` to this device.
    pub fn attach_to_parent(
        &self,
        kind: DecodeKind,
        space: AddressSpace,
        addr: u64,
        len: u64,
        access: Access,
    ) -> Result<()> {
        self.tree.attach_from(
            self.id,
            AttachRequest {
                kind,
                space,
                addr,
                len,
                access,
                ram: false,
                who: self.id,
            },
        )
    }

    /// Like [`Device::attach_to_parent`] but backed by raw storage in the
    /// core map (memory devices).
    pub fn attach_ram_to_parent(
        &self,
        space: AddressSpace,
        addr: u64,
        len: u64,
        access: Access,
    ) -> Result<()> {
        self.tree.attach_from(
            self.id,
            AttachRequest {
                kind: DecodeKind::Normal,
                space,
                addr,
                len,
                access,
                ram: true,
                who: self.id,
            },
        )
    }

    pub fn detach_from_parent(
        &self,
        kind: DecodeKind,
        space: AddressSpace,
        addr: u64,
        len: u64,
        access: Access,
    ) -> Result<()> {
        self.tree.detach_from(
            self.id,
            AttachRequest {
                kind,
                space,
                addr,
                len,
                access,
                ram: false,
                who: self.id,
            },
        )
    }

    /// Reads the node's `reg` property and attaches every range to the
    /// parent: the generic `init_address` body. Returns the flattened
    /// ranges for the model's own bookkeeping.
    pub fn attach_reg_ranges(
        &self,
        access: Access,
        ram: bool,
    ) -> Result<Vec<(AddressSpace, u64, u64)>> {
        let reg = self.find_ranges("reg")?;
        let parent = self.parent().ok_or_else(|| TreeError::Config {
            path: self.path(),
            reason: "the root node cannot attach a \"reg\" range".to_owned(),
        })?;

        let mut flat = Vec::with_capacity(reg.len());
        for entry in &reg {
            let (space, addr) = self.tree.address_to_attach(parent, &entry.addr, self.id)?;
            let len = self.tree.size_to_attach(parent, &entry.size, self.id)?;

            self.tree.attach_from(
                self.id,
                AttachRequest {
                    kind: DecodeKind::Normal,
                    space,
                    addr,
                    len,
                    access,
                    ram,
                    who: self.id,
                },
            )?;
            flat.push((space, addr, len));
        }
        Ok(flat)
    }

    /// Forwards an attach request from a descendant to this node's parent
    /// (transparent-bridge policy).
    pub fn forward_attach(&self, req: AttachRequest) -> Result<()> {
        self.tree.attach_from(self.id, req)
    }

    pub fn forward_detach(&self, req: AttachRequest) -> Result<()> {
        self.tree.detach_from(self.id, req)
    }

    // --- DMA --------------------------------------------------------------

    /// DMA read in the parent's address space.
    pub fn dma_read(&self, space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        self.tree.dma_read_from(self.id, space, addr, buf)
    }

    /// DMA write in the parent's address space.
    pub fn dma_write(
        &self,
        space: AddressSpace,
        addr: u64,
        buf: &[u8],
        violate_read_only: bool,
    ) -> usize {
        self.tree
            .dma_write_from(self.id, space, addr, buf, violate_read_only)
    }

    /// Forwarding helpers for bridge models passing a child's DMA upward.
    pub fn forward_dma_read(&self, space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        self.tree.dma_read_from(self.id, space, addr, buf)
    }

    pub fn forward_dma_write(
        &self,
        space: AddressSpace,
        addr: u64,
        buf: &[u8],
        violate_read_only: bool,
    ) -> usize {
        self.tree
            .dma_write_from(self.id, space, addr, buf, violate_read_only)
    }

    // --- interrupts and time ----------------------------------------------

    /// Drives this device's output port.
    pub fn set_interrupt(&self, port: u32, level: bool) {
        self.tree.set_interrupt(self.id, port, level);
    }

    pub fn now(&self) -> u64 {
        self.tree.events.now()
    }

    /// Schedules a callback `delay` ticks out; it receives a fresh context
    /// for this device. One pending event per logical busy state: deschedule
    /// before rescheduling.
    pub fn schedule(
        &self,
        delay: u64,
        f: impl for<'a> FnOnce(Device<'a>) + 'static,
    ) -> EventHandle {
        let id = self.id;
        self.tree
            .events
            .schedule(delay, move |tree: &DeviceTree| f(tree.device(id)))
    }

    pub fn deschedule(&self, handle: EventHandle) -> bool {
        self.tree.events.deschedule(handle)
    }
}

// -------------------------------------------------------------------------
// Root model
// -------------------------------------------------------------------------

/// The built-in model of the root node: attach requests reaching the top of
/// the tree land in the core map, and DMA terminates there.
struct RootModel;

impl HwModel for RootModel {
    fn model_name(&self) -> &'static str {
        "root"
    }

    fn attach_address(&mut self, dev: Device<'_>, req: AttachRequest) -> Result<()> {
        let mut core = dev.tree().core.borrow_mut();
        let result = if req.ram {
            core.attach_ram(req.space, req.addr, req.len, req.access).map(|_| ())
        } else {
            core.attach(
                req.kind,
                req.space,
                req.addr,
                req.len,
                req.access,
                Target::Device(req.who),
            )
        };
        drop(core);
        result.map_err(|source| TreeError::Attach {
            path: dev.tree().path(req.who),
            source,
        })
    }

    fn detach_address(&mut self, dev: Device<'_>, req: AttachRequest) -> Result<()> {
        dev.tree()
            .core
            .borrow_mut()
            .detach(req.kind, req.space, req.addr, req.len, req.access)
            .map_err(|source| TreeError::Attach {
                path: dev.tree().path(req.who),
                source,
            })
    }

    fn dma_read(&mut self, dev: Device<'_>, space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        dev.tree().core_read(Access::READ, space, addr, buf)
    }

    fn dma_write(
        &mut self,
        dev: Device<'_>,
        space: AddressSpace,
        addr: u64,
        buf: &[u8],
        violate_read_only: bool,
    ) -> usize {
        let view = if violate_read_only {
            Access::READ
        } else {
            Access::WRITE
        };
        dev.tree().core_write(view, space, addr, buf)
    }
}

// -------------------------------------------------------------------------
// Instances
// -------------------------------------------------------------------------

/// A logical handle onto a device node, with its own cursor state. Created
/// and destroyed independently of the node.
pub struct Instance {
    id: DeviceId,
    model: Box<dyn InstanceModel>,
}

impl Instance {
    pub fn device(&self) -> DeviceId {
        self.id
    }

    pub fn read(&mut self, tree: &DeviceTree, buf: &mut [u8]) -> Result<usize> {
        self.model.read(tree.device(self.id), buf)
    }

    pub fn write(&mut self, tree: &DeviceTree, buf: &[u8]) -> Result<usize> {
        self.model.write(tree.device(self.id), buf)
    }

    pub fn seek(&mut self, tree: &DeviceTree, pos: u64) -> Result<()> {
        self.model.seek(tree.device(self.id), pos)
    }

    pub fn call_method(&mut self, tree: &DeviceTree, method: &str, args: &[u64]) -> Result<Vec<u64>> {
        self.model.call_method(tree.device(self.id), method, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Test model: a byte register file attached from its `reg` property.
    struct Regs {
        base: Cell<u64>,
        bytes: RefCell<Vec<u8>>,
    }

    impl Regs {
        fn new(len: usize) -> Self {
            Self {
                base: Cell::new(0),
                bytes: RefCell::new(vec![0; len]),
            }
        }
    }

    impl HwModel for Regs {
        fn model_name(&self) -> &'static str {
            "regs"
        }

        fn init_address(&mut self, dev: Device<'_>) -> Result<()> {
            let ranges = dev.attach_reg_ranges(Access::RW, false)?;
            self.base.set(ranges[0].1);
            Ok(())
        }

        fn io_read(&mut self, _dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
            let bytes = self.bytes.borrow();
            let offset = (addr - self.base.get()) as usize;
            let n = buf.len().min(bytes.len().saturating_sub(offset));
            buf[..n].copy_from_slice(&bytes[offset..offset + n]);
            n
        }

        fn io_write(&mut self, _dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &[u8]) -> usize {
            let mut bytes = self.bytes.borrow_mut();
            let offset = (addr - self.base.get()) as usize;
            let n = buf.len().min(bytes.len().saturating_sub(offset));
            bytes[offset..offset + n].copy_from_slice(&buf[..n]);
            n
        }
    }

    fn reg_prop(addr: u64, size: u64) -> PropertyValue {
        PropertyValue::Ranges(vec![RegEntry::new(
            UnitAddress::from_u64(addr, 1),
            UnitAddress::from_u64(size, 1),
        )])
    }

    #[test]
    fn reg_attachment_routes_bus_accesses_to_the_model() {
        let mut tree = DeviceTree::new();
        let root = tree.root();
        let dev = tree.add(root, "regs@0x1000", Box::new(Regs::new(16))).unwrap();
        tree.set_property(dev, "reg", reg_prop(0x1000, 16));
        tree.init().unwrap();

        assert_eq!(tree.io_write(0, 0x1004, &[0xAB, 0xCD]), 2);
        let mut out = [0u8; 2];
        assert_eq!(tree.io_read(0, 0x1004, &mut out), 2);
        assert_eq!(out, [0xAB, 0xCD]);

        // Outside the attachment: master abort, zero transferred.
        assert_eq!(tree.io_read(0, 0x2000, &mut out), 0);
    }

    #[test]
    fn transparent_bridge_forwards_child_attachments() {
        struct Bridge;
        impl HwModel for Bridge {
            fn model_name(&self) -> &'static str {
                "bridge"
            }
        }

        let mut tree = DeviceTree::new();
        let root = tree.root();
        let bus = tree.add(root, "bus", Box::new(Bridge)).unwrap();
        let dev = tree.add(bus, "regs@0x40", Box::new(Regs::new(8))).unwrap();
        tree.set_property(dev, "reg", reg_prop(0x40, 8));
        tree.init().unwrap();

        assert_eq!(tree.io_write(0, 0x42, &[1]), 1);
        let mut out = [0u8; 1];
        assert_eq!(tree.io_read(0, 0x42, &mut out), 1);
        assert_eq!(out, [1]);
    }

    #[test]
    fn overlapping_reg_ranges_fail_initialization() {
        let mut tree = DeviceTree::new();
        let root = tree.root();
        let a = tree.add(root, "a@0x1000", Box::new(Regs::new(32))).unwrap();
        tree.set_property(a, "reg", reg_prop(0x1000, 32));
        let b = tree.add(root, "b@0x1010", Box::new(Regs::new(32))).unwrap();
        tree.set_property(b, "reg", reg_prop(0x1010, 32));

        let err = tree.init().unwrap_err();
        assert!(matches!(err, TreeError::Attach { .. }), "{err}");
    }

    #[test]
    #[should_panic(expected = "io-read")]
    fn invoking_an_absent_capability_aborts() {
        struct NoIo;
        impl HwModel for NoIo {
            fn model_name(&self) -> &'static str {
                "noio"
            }

            fn init_address(&mut self, dev: Device<'_>) -> Result<()> {
                dev.attach_reg_ranges(Access::RW, false).map(|_| ())
            }
        }

        let mut tree = DeviceTree::new();
        let root = tree.root();
        let dev = tree.add(root, "noio@0", Box::new(NoIo)).unwrap();
        tree.set_property(dev, "reg", reg_prop(0, 4));
        tree.init().unwrap();

        let mut out = [0u8; 1];
        let _ = tree.io_read(0, 0, &mut out);
    }

    #[test]
    fn interrupts_route_to_wired_ports_and_cpu_lines() {
        struct Latch {
            seen: Rc<Cell<(u32, bool)>>,
        }
        impl HwModel for Latch {
            fn model_name(&self) -> &'static str {
                "latch"
            }

            fn interrupt_event(
                &mut self,
                _dev: Device<'_>,
                port: u32,
                _source: DeviceId,
                _source_port: u32,
                level: bool,
            ) {
                self.seen.set((port, level));
            }
        }

        struct Source;
        impl HwModel for Source {
            fn model_name(&self) -> &'static str {
                "source"
            }
        }

        let seen = Rc::new(Cell::new((u32::MAX, false)));
        let mut tree = DeviceTree::new();
        let root = tree.root();
        let latch = tree
            .add(root, "latch", Box::new(Latch { seen: seen.clone() }))
            .unwrap();
        let source = tree.add(root, "source", Box::new(Source)).unwrap();
        tree.wire(source, 0, latch, 3);
        tree.wire_to_cpu(source, 1, 0);

        tree.set_interrupt(source, 0, true);
        assert_eq!(seen.get(), (3, true));

        assert!(!tree.cpu_line(0));
        tree.set_interrupt(source, 1, true);
        assert!(tree.cpu_line(0));
        tree.set_interrupt(source, 1, false);
        assert!(!tree.cpu_line(0));
    }

    #[test]
    fn dma_from_a_leaf_reaches_ram_attached_at_the_root() {
        struct Pusher;
        impl HwModel for Pusher {
            fn model_name(&self) -> &'static str {
                "pusher"
            }
        }

        struct Ram;
        impl HwModel for Ram {
            fn model_name(&self) -> &'static str {
                "ram"
            }

            fn init_address(&mut self, dev: Device<'_>) -> Result<()> {
                dev.attach_reg_ranges(Access::RW, true).map(|_| ())
            }
        }

        let mut tree = DeviceTree::new();
        let root = tree.root();
        let ram = tree.add(root, "ram@0", Box::new(Ram)).unwrap();
        tree.set_property(ram, "reg", reg_prop(0, 0x100));
        let leaf = tree.add(root, "pusher", Box::new(Pusher)).unwrap();
        tree.init().unwrap();

        // A device-initiated write lands in RAM and is visible to the bus.
        assert_eq!(tree.device(leaf).dma_write(0, 0x20, b"dma", false), 3);
        let mut out = [0u8; 3];
        assert_eq!(tree.io_read(0, 0x20, &mut out), 3);
        assert_eq!(&out, b"dma");
    }

    #[test]
    fn privileged_writes_bypass_write_protection() {
        struct Rom;
        impl HwModel for Rom {
            fn model_name(&self) -> &'static str {
                "rom"
            }

            fn init_address(&mut self, dev: Device<'_>) -> Result<()> {
                dev.attach_reg_ranges(Access::READ.union(Access::EXEC), true)
                    .map(|_| ())
            }
        }

        let mut tree = DeviceTree::new();
        let root = tree.root();
        let rom = tree.add(root, "rom@0", Box::new(Rom)).unwrap();
        tree.set_property(rom, "reg", reg_prop(0, 0x100));
        tree.init().unwrap();

        // Ordinary writes miss (read-only region)...
        assert_eq!(tree.io_write(0, 0x10, b"x"), 0);
        // ...while the loader path stores through the readable view.
        assert_eq!(tree.write_privileged(0, 0x10, b"x"), 1);

        let mut out = [0u8; 1];
        assert_eq!(tree.io_read(0, 0x10, &mut out), 1);
        assert_eq!(&out, b"x");
        // The same bytes back the executable view.
        assert_eq!(tree.fetch(0, 0x10, &mut out), 1);
        assert_eq!(&out, b"x");
    }

    #[test]
    fn find_resolves_paths_with_and_without_units() {
        struct Nop;
        impl HwModel for Nop {
            fn model_name(&self) -> &'static str {
                "nop"
            }
        }

        let mut tree = DeviceTree::new();
        let root = tree.root();
        let bus = tree.add(root, "bus@0x80000000", Box::new(Nop)).unwrap();
        let child = tree.add(bus, "uart@0x3f8", Box::new(Nop)).unwrap();

        assert_eq!(tree.find("/").unwrap(), root);
        assert_eq!(tree.find("/bus@0x80000000/uart@0x3f8").unwrap(), child);
        assert_eq!(tree.find("/bus/uart").unwrap(), child);
        assert!(tree.find("/bus/modem").is_err());

        assert_eq!(tree.path(child), "/bus@0x80000000/uart@0x3f8");
    }

    #[test]
    fn device_events_fire_with_a_fresh_context() {
        struct Timer {
            fired_at: Rc<Cell<u64>>,
        }
        impl HwModel for Timer {
            fn model_name(&self) -> &'static str {
                "timer"
            }

            fn init_data(&mut self, dev: Device<'_>) -> Result<()> {
                let fired_at = self.fired_at.clone();
                dev.schedule(100, move |dev: Device<'_>| fired_at.set(dev.now()));
                Ok(())
            }
        }

        let fired_at = Rc::new(Cell::new(0));
        let mut tree = DeviceTree::new();
        let root = tree.root();
        tree.add(root, "timer", Box::new(Timer { fired_at: fired_at.clone() }))
            .unwrap();
        tree.init().unwrap();

        tree.tick(99);
        assert_eq!(fired_at.get(), 0);
        tree.tick(1);
        assert_eq!(fired_at.get(), 100);
    }

    #[test]
    fn missing_and_mistyped_properties_are_config_errors() {
        struct Nop;
        impl HwModel for Nop {
            fn model_name(&self) -> &'static str {
                "nop"
            }
        }

        let mut tree = DeviceTree::new();
        let root = tree.root();
        let dev = tree.add(root, "nop", Box::new(Nop)).unwrap();
        tree.set_property(dev, "file", "image.bin");

        let ctx = tree.device(dev);
        assert!(matches!(
            ctx.find_integer("block-size"),
            Err(TreeError::MissingProperty { .. })
        ));
        assert_eq!(ctx.find_integer_or("block-size", 512).unwrap(), 512);
        assert!(matches!(
            ctx.find_integer("file"),
            Err(TreeError::PropertyType { .. })
        ));
        assert_eq!(ctx.find_string("file").unwrap(), "image.bin");
    }

    #[test]
    fn instance_spec_splits_on_the_last_component_colon() {
        assert_eq!(split_instance_spec("/disk@0:1"), ("/disk@0", Some("1")));
        assert_eq!(
            split_instance_spec("/bus/disk@0:1,img"),
            ("/bus/disk@0", Some("1,img"))
        );
        assert_eq!(split_instance_spec("/bus/disk@0"), ("/bus/disk@0", None));
    }
}
