//! arbor: a device-tree hardware-simulation framework.
//!
//! Simulated peripherals are composed into a rooted tree; memory-mapped
//! I/O, DMA and interrupts are routed between them through a flat,
//! priority-decoded core map and build-time interrupt wiring; device logic
//! is driven by a discrete-event queue over virtual time.
//!
//! This crate is the facade: it re-exports the framework core
//! ([`tree`], [`coremap`], [`events`]) and the peripheral model library
//! ([`hw`]). The external collaborators (the instruction-set CPU core that
//! issues accesses and observes interrupt lines, and the configuration
//! front end that builds trees from property text) talk to the types
//! exported here.

pub use arbor_coremap as coremap;
pub use arbor_events as events;
pub use arbor_hw as hw;
pub use arbor_tree as tree;

pub use arbor_tree::{
    Access, AddressSpace, AttachRequest, DecodeKind, Device, DeviceId, DeviceTree, EventHandle,
    EventQueue, HwModel, Instance, InstanceModel, Ioctl, PropertyBag, PropertyValue, RegEntry,
    Result, TreeError, UnitAddress, WireDest,
};
