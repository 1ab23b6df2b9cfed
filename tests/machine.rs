//! End-to-end scenarios over a composed machine: bus bridging, interrupt
//! routing from a peripheral through the interrupt controller to a CPU
//! line, firmware-level memory claims, and whole-machine reset.

use arbor::hw::{com, pic, HwCom, HwEeprom, HwIoBus, HwMemory, HwPal, HwPic};
use arbor::{DeviceTree, PropertyValue, RegEntry, UnitAddress};
use std::sync::Once;

fn init_logging() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn reg(addr: u64, size: u64) -> PropertyValue {
    PropertyValue::Ranges(vec![RegEntry::new(
        UnitAddress::from_u64(addr, 1),
        UnitAddress::from_u64(size, 1),
    )])
}

#[test]
fn memory_claim_shrinks_the_available_property() {
    init_logging();

    let mut tree = DeviceTree::new();
    let root = tree.root();
    let mem = tree.add(root, "memory", Box::new(HwMemory::new())).unwrap();
    tree.set_property(mem, "reg", reg(0x1000, 0x1000));
    tree.init().unwrap();

    let mut inst = tree.create_instance("/memory").unwrap();
    let claimed = inst.call_method(&tree, "claim", &[0x100, 0]).unwrap();
    assert_eq!(claimed, vec![0x1000]);

    match tree.property(mem, "available") {
        Some(PropertyValue::Ranges(entries)) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].addr.as_u64(), Some(0x1100));
            assert_eq!(entries[0].size.as_u64(), Some(0xF00));
        }
        other => panic!("unexpected available property: {other:?}"),
    }
}

const BUS_BASE: u64 = 0x8000_0000;
const COM_BASE: u64 = 0x803F_8000;
const PIC_BASE: u64 = 0x80F0_0000;
const PAL_BASE: u64 = 0x8000_0100;
const EEPROM_BASE: u64 = 0x8080_0000;

/// An I/O bus with a UART, an interrupt controller, a PAL and an EEPROM,
/// with the UART's interrupt routed through the controller to CPU line 0.
struct Machine {
    tree: DeviceTree,
    com: com::ComHandle,
    pal: arbor::hw::pal::PalHandle,
}

impl Machine {
    fn build() -> Machine {
        init_logging();

        let mut tree = DeviceTree::new();
        let root = tree.root();

        let bus = tree.add(root, "iobus@0x80000000", Box::new(HwIoBus::new())).unwrap();
        tree.set_property(bus, "reg", reg(BUS_BASE, 0x0100_0000));

        let uart = HwCom::new();
        let com_handle = uart.handle();
        let com_id = tree.add(bus, "com@0x803f8000", Box::new(uart)).unwrap();
        tree.set_property(com_id, "reg", reg(COM_BASE, 8));
        tree.set_property(com_id, "input-delay", 5u64);

        let pic_id = tree.add(bus, "pic@0x80f00000", Box::new(HwPic::new())).unwrap();
        tree.set_property(pic_id, "reg", reg(PIC_BASE, 0x4000));
        tree.set_property(pic_id, "nr-sources", 4u64);

        let pal = HwPal::new();
        let pal_handle = pal.handle();
        let pal_id = tree.add(bus, "pal@0x80000100", Box::new(pal)).unwrap();
        tree.set_property(pal_id, "reg", reg(PAL_BASE, 0x10));

        let eeprom_id = tree.add(bus, "eeprom@0x80800000", Box::new(HwEeprom::new())).unwrap();
        tree.set_property(eeprom_id, "reg", reg(EEPROM_BASE, 0x8000));
        tree.set_property(eeprom_id, "sector-size", 0x1000u64);
        tree.set_property(eeprom_id, "erase-delay", 1000u64);
        tree.set_property(eeprom_id, "byte-write-delay", 10u64);

        tree.wire(com_id, com::PORT_IRQ, pic_id, 0);
        tree.wire_to_cpu(pic_id, pic::PORT_OUT_BASE, 0);

        tree.init().unwrap();
        Machine {
            tree,
            com: com_handle,
            pal: pal_handle,
        }
    }

    fn read8(&self, addr: u64) -> u8 {
        let mut buf = [0u8; 1];
        assert_eq!(self.tree.io_read(0, addr, &mut buf), 1);
        buf[0]
    }

    fn write8(&self, addr: u64, value: u8) {
        assert_eq!(self.tree.io_write(0, addr, &[value]), 1);
    }

    fn read32(&self, addr: u64) -> u32 {
        let mut buf = [0u8; 4];
        assert_eq!(self.tree.io_read(0, addr, &mut buf), 4);
        u32::from_le_bytes(buf)
    }

    fn write32(&self, addr: u64, value: u32) {
        assert_eq!(self.tree.io_write(0, addr, &value.to_le_bytes()), 4);
    }
}

#[test]
fn uart_interrupt_travels_through_the_pic_to_the_cpu_line() {
    let m = Machine::build();

    // Program the controller: destination wide open, source 0 at priority 5
    // with vector 0x21.
    m.write32(PIC_BASE + 0x2000, 0); // task priority
    m.write32(PIC_BASE + 0x100, 5 << 16 | 0x21); // unmasked, priority, vector
    m.write32(PIC_BASE + 0x104, 1); // destination 0

    // Enable the UART receive interrupt (IER bit 0) and OUT2.
    m.write8(COM_BASE + 1, 0x01);
    m.write8(COM_BASE + 4, 0x08);

    // A byte arrives; polling the line-status register starts the arrival
    // timer.
    m.com.push_rx(b'!');
    assert_eq!(m.read8(COM_BASE + 5) & 0x01, 0);
    assert!(!m.tree.cpu_line(0));

    m.tree.tick(5);
    assert!(m.tree.cpu_line(0));

    // Acknowledge at the controller, then service the device.
    assert_eq!(m.read32(PIC_BASE + 0x2004), 0x21);
    assert_eq!(m.read8(COM_BASE), b'!');

    // End of interrupt: the line stays down (source deasserted on read).
    m.write32(PIC_BASE + 0x2008, 0);
    assert!(!m.tree.cpu_line(0));
}

#[test]
fn eeprom_programs_over_the_bridged_bus() {
    let m = Machine::build();

    // Erase sector 2, then program one byte in it.
    m.write8(EEPROM_BASE + 0x5555, 0xAA);
    m.write8(EEPROM_BASE + 0x2AAA, 0x55);
    m.write8(EEPROM_BASE + 0x5555, 0x80);
    m.write8(EEPROM_BASE + 0x5555, 0xAA);
    m.write8(EEPROM_BASE + 0x2AAA, 0x55);
    m.write8(EEPROM_BASE + 0x2000, 0x30);
    m.tree.tick(100 + 1000 + 1);
    assert_eq!(m.read8(EEPROM_BASE + 0x2010), 0xFF);

    m.write8(EEPROM_BASE + 0x5555, 0xAA);
    m.write8(EEPROM_BASE + 0x2AAA, 0x55);
    m.write8(EEPROM_BASE + 0x5555, 0xA0);
    m.write8(EEPROM_BASE + 0x2010, 0x42);
    m.tree.tick(11);
    assert_eq!(m.read8(EEPROM_BASE + 0x2010), 0x42);
}

#[test]
fn pal_console_and_cycle_counter_work_behind_the_bridge() {
    let m = Machine::build();

    m.pal.push_input(b'y');
    assert_eq!(m.read8(PAL_BASE), 1);
    assert_eq!(m.read8(PAL_BASE + 1), b'y');

    m.tree.tick(42);
    assert_eq!(m.read32(PAL_BASE + 4), 42);

    m.write8(PAL_BASE + 2, b'o');
    m.write8(PAL_BASE + 2, b'k');
    assert_eq!(m.pal.take_output(), b"ok");
}

#[test]
fn machine_reset_restores_data_state_but_keeps_attachments() {
    let m = Machine::build();

    // Dirty some state: halt the machine, erase an EEPROM sector.
    m.write8(PAL_BASE + 0x0C, 1);
    assert!(m.pal.halted());
    m.write8(EEPROM_BASE + 0x5555, 0xAA);
    m.write8(EEPROM_BASE + 0x2AAA, 0x55);
    m.write8(EEPROM_BASE + 0x5555, 0x80);
    m.write8(EEPROM_BASE + 0x5555, 0xAA);
    m.write8(EEPROM_BASE + 0x2AAA, 0x55);
    m.write8(EEPROM_BASE + 0x2000, 0x30);
    m.tree.tick(2000);

    m.tree.reset().unwrap();

    // Data state is back to power-on; the bus windows still decode.
    assert!(!m.pal.halted());
    assert_eq!(m.read8(EEPROM_BASE + 0x2010), 0x00);
    assert_eq!(m.read8(PAL_BASE), 0);
}
