//! ns16550-flavored serial port.
//!
//! Register-level behavior follows the common 16550 layout (RBR/THR, IER,
//! IIR/FCR, LCR, MCR, LSR, MSR, SCR, with DLAB-switched divisor latches).
//! Optional `input-delay` / `output-delay` properties (in ticks) model the
//! character pacing of a real wire: each direction owns at most one
//! in-flight event, descheduled before any reschedule.
//!
//! Host backing: `input-file` preloads the receive stream; `output-file`
//! mirrors transmitted bytes. Without files, both ends are reachable through
//! [`ComHandle`].

use arbor_tree::{
    Access, AddressSpace, Device, EventHandle, HwModel, Result, TreeError,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};
use std::rc::Rc;
use tracing::warn;

const LSR_DR: u8 = 0x01;
const LSR_THRE: u8 = 0x20;
const LSR_TEMT: u8 = 0x40;

const IIR_NONE: u8 = 0x01;
const IIR_THRE: u8 = 0x02;
const IIR_RX: u8 = 0x04;

/// Interrupt output port.
pub const PORT_IRQ: u32 = 0;

#[derive(Default)]
struct ComState {
    base: u64,

    ier: u8,
    fcr: u8,
    lcr: u8,
    mcr: u8,
    msr: u8,
    scr: u8,
    dll: u8,
    dlm: u8,

    input_delay: u64,
    output_delay: u64,

    /// Bytes queued on the host side, not yet visible to the guest.
    pending_rx: VecDeque<u8>,
    /// The byte currently in the receive buffer register.
    rbr: Option<u8>,
    rx_event: Option<EventHandle>,

    /// Transmit holding register (byte waiting behind the shifter).
    thr: Option<u8>,
    /// Byte currently on the wire.
    tx_shift: Option<u8>,
    tx_event: Option<EventHandle>,

    tx_log: Vec<u8>,
    tx_file: Option<File>,

    irq_level: bool,
}

impl ComState {
    fn dlab(&self) -> bool {
        self.lcr & 0x80 != 0
    }

    fn lsr(&self) -> u8 {
        let mut lsr = 0;
        if self.rbr.is_some() {
            lsr |= LSR_DR;
        }
        if self.thr.is_none() {
            lsr |= LSR_THRE;
        }
        if self.thr.is_none() && self.tx_shift.is_none() {
            lsr |= LSR_TEMT;
        }
        lsr
    }

    fn iir(&self) -> u8 {
        let fifo_bits = if self.fcr & 0x01 != 0 { 0xC0 } else { 0x00 };
        if self.ier & 0x01 != 0 && self.rbr.is_some() {
            fifo_bits | IIR_RX
        } else if self.ier & 0x02 != 0 && self.thr.is_none() {
            fifo_bits | IIR_THRE
        } else {
            fifo_bits | IIR_NONE
        }
    }

    /// The INTR pin, gated by MCR OUT2 as wired on common hardware.
    fn irq_pin(&self) -> bool {
        self.iir() & IIR_NONE == 0 && self.mcr & 0x08 != 0
    }

    fn emit(&mut self, byte: u8) {
        self.tx_log.push(byte);
        if let Some(file) = self.tx_file.as_mut() {
            if let Err(err) = file.write_all(&[byte]) {
                warn!(%err, "serial output file write failed");
            }
        }
    }
}

/// Host-side handle: feed the receive line, collect transmitted bytes.
#[derive(Clone)]
pub struct ComHandle {
    state: Rc<RefCell<ComState>>,
}

impl ComHandle {
    pub fn push_rx(&self, byte: u8) {
        self.state.borrow_mut().pending_rx.push_back(byte);
    }

    pub fn take_tx(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.borrow_mut().tx_log)
    }
}

pub struct HwCom {
    state: Rc<RefCell<ComState>>,
}

impl HwCom {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(ComState::default())),
        }
    }

    pub fn handle(&self) -> ComHandle {
        ComHandle {
            state: self.state.clone(),
        }
    }

    /// Moves pending host bytes toward the receive buffer register,
    /// scheduling the arrival event when a delay is configured.
    fn pump_rx(state_rc: &Rc<RefCell<ComState>>, dev: &Device<'_>) {
        let mut state = state_rc.borrow_mut();
        if state.rbr.is_some() || state.pending_rx.is_empty() || state.rx_event.is_some() {
            return;
        }
        if state.input_delay == 0 {
            let byte = state.pending_rx.pop_front();
            state.rbr = byte;
            return;
        }
        let rc = state_rc.clone();
        let handle = dev.schedule(state.input_delay, move |dev: Device<'_>| {
            {
                let mut state = rc.borrow_mut();
                state.rx_event = None;
                let byte = state.pending_rx.pop_front();
                state.rbr = byte;
            }
            Self::sync(&rc, &dev);
        });
        state.rx_event = Some(handle);
    }

    /// Starts the transmit shifter when a byte is waiting.
    fn pump_tx(state_rc: &Rc<RefCell<ComState>>, dev: &Device<'_>) {
        let mut state = state_rc.borrow_mut();
        if state.tx_shift.is_some() || state.thr.is_none() {
            return;
        }
        let byte = state.thr.take().expect("checked above");
        if state.output_delay == 0 {
            state.emit(byte);
            return;
        }
        state.tx_shift = Some(byte);
        let rc = state_rc.clone();
        let handle = dev.schedule(state.output_delay, move |dev: Device<'_>| {
            {
                let mut state = rc.borrow_mut();
                state.tx_event = None;
                if let Some(byte) = state.tx_shift.take() {
                    state.emit(byte);
                }
            }
            // The holding register may have been refilled while shifting.
            Self::sync(&rc, &dev);
        });
        state.tx_event = Some(handle);
    }

    /// Runs both pumps and propagates the interrupt pin on change.
    fn sync(state_rc: &Rc<RefCell<ComState>>, dev: &Device<'_>) {
        Self::pump_rx(state_rc, dev);
        Self::pump_tx(state_rc, dev);
        let (level, changed) = {
            let mut state = state_rc.borrow_mut();
            let level = state.irq_pin();
            let changed = level != state.irq_level;
            state.irq_level = level;
            (level, changed)
        };
        if changed {
            dev.set_interrupt(PORT_IRQ, level);
        }
    }
}

impl Default for HwCom {
    fn default() -> Self {
        Self::new()
    }
}

impl HwModel for HwCom {
    fn model_name(&self) -> &'static str {
        "com"
    }

    fn init_address(&mut self, dev: Device<'_>) -> Result<()> {
        let ranges = dev.attach_reg_ranges(Access::RW, false)?;
        self.state.borrow_mut().base = ranges[0].1;
        Ok(())
    }

    fn init_data(&mut self, dev: Device<'_>) -> Result<()> {
        let input_delay = dev.find_integer_or("input-delay", 0)?;
        let output_delay = dev.find_integer_or("output-delay", 0)?;
        let input_file = dev.find_string_opt("input-file")?;
        let output_file = dev.find_string_opt("output-file")?;

        let mut state = self.state.borrow_mut();

        // Cancel in-flight activity from before the reset.
        if let Some(handle) = state.rx_event.take() {
            dev.deschedule(handle);
        }
        if let Some(handle) = state.tx_event.take() {
            dev.deschedule(handle);
        }

        let base = state.base;
        *state = ComState {
            base,
            lcr: 0x03,
            dll: 1,
            input_delay,
            output_delay,
            ..ComState::default()
        };

        if let Some(path) = input_file {
            let mut bytes = Vec::new();
            File::open(&path)
                .and_then(|mut f| f.read_to_end(&mut bytes))
                .map_err(|source| TreeError::HostIo {
                    path: dev.path(),
                    source,
                })?;
            state.pending_rx = bytes.into();
        }
        if let Some(path) = output_file {
            let file = File::create(&path).map_err(|source| TreeError::HostIo {
                path: dev.path(),
                source,
            })?;
            state.tx_file = Some(file);
        }
        Ok(())
    }

    fn io_read(&mut self, dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        // Register accesses are byte-wide; wider accesses claim one byte.
        Self::sync(&self.state, &dev);
        let value = {
            let mut state = self.state.borrow_mut();
            let offset = addr - state.base;
            match offset {
                0 if state.dlab() => state.dll,
                0 => state.rbr.take().unwrap_or(0),
                1 if state.dlab() => state.dlm,
                1 => state.ier,
                2 => state.iir(),
                3 => state.lcr,
                4 => state.mcr,
                5 => state.lsr(),
                6 => state.msr,
                7 => state.scr,
                _ => return 0,
            }
        };
        buf[0] = value;
        Self::sync(&self.state, &dev);
        1
    }

    fn io_write(&mut self, dev: Device<'_>, _space: AddressSpace, addr: u64, buf: &[u8]) -> usize {
        let Some(value) = buf.first().copied() else {
            return 0;
        };
        {
            let mut state = self.state.borrow_mut();
            let offset = addr - state.base;
            match offset {
                0 if state.dlab() => state.dll = value,
                0 => {
                    // Writing THR while it is full overwrites the held byte,
                    // as on real hardware.
                    state.thr = Some(value);
                }
                1 if state.dlab() => state.dlm = value,
                1 => state.ier = value,
                2 => {
                    state.fcr = value;
                    if value & 0x02 != 0 {
                        state.rbr = None;
                        state.pending_rx.clear();
                    }
                }
                3 => state.lcr = value,
                4 => state.mcr = value,
                7 => state.scr = value,
                5 | 6 => {}
                _ => return 0,
            }
        }
        Self::sync(&self.state, &dev);
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_tree::{DeviceTree, PropertyValue, RegEntry, UnitAddress};
    use std::io::Write as _;

    const BASE: u64 = 0x3F8;

    fn com_tree(props: &[(&str, PropertyValue)]) -> (DeviceTree, ComHandle, arbor_tree::DeviceId) {
        let mut tree = DeviceTree::new();
        let root = tree.root();
        let com = HwCom::new();
        let handle = com.handle();
        let id = tree.add(root, "com@0x3f8", Box::new(com)).unwrap();
        tree.set_property(
            id,
            "reg",
            PropertyValue::Ranges(vec![RegEntry::new(
                UnitAddress::from_u64(BASE, 1),
                UnitAddress::from_u64(8, 1),
            )]),
        );
        for (name, value) in props {
            tree.set_property(id, name, value.clone());
        }
        tree.wire_to_cpu(id, PORT_IRQ, 0);
        tree.init().unwrap();
        (tree, handle, id)
    }

    fn read_reg(tree: &DeviceTree, offset: u64) -> u8 {
        let mut buf = [0u8; 1];
        assert_eq!(tree.io_read(0, BASE + offset, &mut buf), 1);
        buf[0]
    }

    fn write_reg(tree: &DeviceTree, offset: u64, value: u8) {
        assert_eq!(tree.io_write(0, BASE + offset, &[value]), 1);
    }

    #[test]
    fn immediate_transmit_with_no_delay() {
        let (tree, handle, _id) = com_tree(&[]);

        assert_ne!(read_reg(&tree, 5) & LSR_THRE, 0);
        write_reg(&tree, 0, b'A');
        write_reg(&tree, 0, b'B');
        assert_eq!(handle.take_tx(), b"AB");
        assert_ne!(read_reg(&tree, 5) & LSR_TEMT, 0);
    }

    #[test]
    fn output_delay_drains_one_character_per_event() {
        let (tree, handle, _id) =
            com_tree(&[("output-delay", PropertyValue::Integer(100))]);

        write_reg(&tree, 0, b'A');
        // The byte moved to the shifter; the holding register is free again,
        // but nothing has reached the wire yet.
        assert_ne!(read_reg(&tree, 5) & LSR_THRE, 0);
        assert_eq!(read_reg(&tree, 5) & LSR_TEMT, 0);
        assert_eq!(handle.take_tx(), b"");

        write_reg(&tree, 0, b'B');
        tree.tick(100);
        assert_eq!(handle.take_tx(), b"A");

        tree.tick(100);
        assert_eq!(handle.take_tx(), b"B");
        assert_ne!(read_reg(&tree, 5) & LSR_TEMT, 0);
    }

    #[test]
    fn receive_path_latches_data_ready_and_raises_the_interrupt() {
        let (tree, handle, _id) =
            com_tree(&[("input-delay", PropertyValue::Integer(50))]);

        // Enable RX interrupts and OUT2.
        write_reg(&tree, 1, 0x01);
        write_reg(&tree, 4, 0x08);

        handle.push_rx(b'z');
        // Polling LSR starts the arrival timer; the byte is not there yet.
        assert_eq!(read_reg(&tree, 5) & LSR_DR, 0);
        assert!(!tree.cpu_line(0));

        tree.tick(50);
        assert_ne!(read_reg(&tree, 5) & LSR_DR, 0);
        assert!(tree.cpu_line(0));

        assert_eq!(read_reg(&tree, 0), b'z');
        assert!(!tree.cpu_line(0));
    }

    #[test]
    fn zero_delay_receive_is_immediately_visible() {
        let (tree, handle, _id) = com_tree(&[]);
        handle.push_rx(0xAB);
        assert_ne!(read_reg(&tree, 5) & LSR_DR, 0);
        assert_eq!(read_reg(&tree, 0), 0xAB);
        assert_eq!(read_reg(&tree, 0), 0);
    }

    #[test]
    fn dlab_switches_divisor_latches() {
        let (tree, _handle, _id) = com_tree(&[]);

        write_reg(&tree, 3, 0x83);
        write_reg(&tree, 0, 0x45);
        write_reg(&tree, 1, 0x01);
        assert_eq!(read_reg(&tree, 0), 0x45);
        assert_eq!(read_reg(&tree, 1), 0x01);

        write_reg(&tree, 3, 0x03);
        assert_eq!(read_reg(&tree, 0), 0); // empty RBR, not DLL
    }

    #[test]
    fn files_back_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let in_path = dir.path().join("in.bin");
        let out_path = dir.path().join("out.bin");
        std::fs::File::create(&in_path)
            .and_then(|mut f| f.write_all(b"hi"))
            .unwrap();

        let (tree, _handle, _id) = com_tree(&[
            ("input-file", PropertyValue::String(in_path.display().to_string())),
            ("output-file", PropertyValue::String(out_path.display().to_string())),
        ]);

        assert_eq!(read_reg(&tree, 0), b'h');
        assert_eq!(read_reg(&tree, 0), b'i');

        write_reg(&tree, 0, b'!');
        assert_eq!(std::fs::read(&out_path).unwrap(), b"!");
    }

    #[test]
    fn reset_reloads_the_input_stream() {
        let dir = tempfile::tempdir().unwrap();
        let in_path = dir.path().join("in.bin");
        std::fs::File::create(&in_path)
            .and_then(|mut f| f.write_all(b"x"))
            .unwrap();

        let (tree, _handle, _id) = com_tree(&[(
            "input-file",
            PropertyValue::String(in_path.display().to_string()),
        )]);

        assert_eq!(read_reg(&tree, 0), b'x');
        assert_eq!(read_reg(&tree, 0), 0);

        tree.reset().unwrap();
        assert_eq!(read_reg(&tree, 0), b'x');
    }
}
