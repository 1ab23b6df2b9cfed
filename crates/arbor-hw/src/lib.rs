//! The peripheral model library.
//!
//! Every model here implements [`arbor_tree::HwModel`] and is wired into a
//! [`arbor_tree::DeviceTree`] by whatever builds the machine: tests, a
//! configuration front end, or embedding code. [`create_model`] maps the
//! model names such a front end would use onto constructors.

pub mod com;
pub mod disk;
pub mod eeprom;
pub mod glue;
pub mod htab;
pub mod ide;
pub mod iobus;
pub mod memory;
pub mod nvram;
pub mod pal;
pub mod phb;
pub mod pic;
pub mod vm;

pub use com::HwCom;
pub use disk::HwDisk;
pub use eeprom::HwEeprom;
pub use glue::HwGlue;
pub use htab::{HwHtab, HwPte};
pub use ide::HwIde;
pub use iobus::HwIoBus;
pub use memory::HwMemory;
pub use nvram::HwNvram;
pub use pal::HwPal;
pub use phb::HwPhb;
pub use pic::HwPic;
pub use vm::HwVm;

use arbor_tree::HwModel;

/// Constructs a model by name, or `None` for an unknown name.
pub fn create_model(name: &str) -> Option<Box<dyn HwModel>> {
    Some(match name {
        "com" => Box::new(HwCom::new()),
        "disk" => Box::new(HwDisk::new()),
        "eeprom" => Box::new(HwEeprom::new()),
        "glue" => Box::new(HwGlue::new()),
        "htab" => Box::new(HwHtab::new()),
        "pte" => Box::new(HwPte),
        "ide" => Box::new(HwIde::new()),
        "iobus" => Box::new(HwIoBus::new()),
        "memory" => Box::new(HwMemory::new()),
        "nvram" => Box::new(HwNvram::new()),
        "pal" => Box::new(HwPal::new()),
        "phb" => Box::new(HwPhb::new()),
        "pic" => Box::new(HwPic::new()),
        "vm" => Box::new(HwVm::new()),
        _ => return None,
    })
}
