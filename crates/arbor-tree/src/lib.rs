//! Device-tree core: the polymorphic node contract, property bags, unit
//! addresses, bus/DMA dispatch, interrupt wiring and logical instances.
//!
//! Peripheral models implement [`HwModel`] and are composed into a
//! [`DeviceTree`]; the external CPU core drives the tree through
//! [`DeviceTree::io_read`] / [`DeviceTree::io_write`] / [`DeviceTree::tick`]
//! and observes interrupt lines via [`DeviceTree::cpu_line`].

mod error;
mod model;
mod props;
mod tree;
pub mod unit;

pub use arbor_coremap::{Access, AddressSpace, DecodeKind};
pub use arbor_events::{EventHandle, EventQueue};
pub use error::{Result, TreeError};
pub use model::{AttachRequest, HwModel, InstanceModel, Ioctl};
pub use props::{PropertyBag, PropertyValue, RegEntry};
pub use tree::{Device, DeviceId, DeviceTree, Instance, WireDest};
pub use unit::UnitAddress;
