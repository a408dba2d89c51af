//! The shared instruction/data memory: two read ports, one write port
//! (spec.md §3, §4.3), grounded verbatim in `original_source/pyv/mem.py`'s
//! `Memory`/`ReadPort`/`WritePort`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{CoreError, CoreResult};
use crate::kernel::{Callback, Clocked, Kernel};
use crate::port::Port;

/// One of the memory's two independent read ports: read-enable, width and
/// address inputs, a data output. The write port reuses read port 0's
/// address and width (spec.md §4.3), so it isn't modeled as a full
/// `ReadPort`.
///
/// `Clone`, like [`Port`] itself, shares the underlying cell: handing a
/// clone to a stage lets it drive (or read) the same signal the memory
/// module owns.
#[derive(Clone)]
pub struct ReadPort {
    pub re: Port<bool>,
    pub width: Port<u32>,
    pub addr: Port<u32>,
    pub rdata: Port<u32>,
}

#[derive(Clone)]
pub struct WritePort {
    pub we: Port<bool>,
    pub wdata: Port<u32>,
}

/// A flat byte array backing instructions and data alike. Reads during
/// propagation never fail — an address that hasn't settled yet reads as 0,
/// matching the Python source's "might stabilize" comment — but a write at
/// tick time with an out-of-range address or a width outside `{1,2,4}` is
/// fatal.
pub struct Memory {
    bytes: RefCell<Vec<u8>>,
    pub read_port0: ReadPort,
    pub read_port1: ReadPort,
    pub write_port: WritePort,
}

impl Memory {
    pub fn new(kernel: &Kernel, size: usize) -> Rc<Self> {
        let q = kernel.queue();
        let mem = Rc::new(Memory {
            bytes: RefCell::new(vec![0u8; size]),
            read_port0: ReadPort {
                re: Port::new(q.clone(), false),
                width: Port::new(q.clone(), 0),
                addr: Port::new(q.clone(), 0),
                rdata: Port::new(q.clone(), 0),
            },
            read_port1: ReadPort {
                re: Port::new(q.clone(), false),
                width: Port::new(q.clone(), 0),
                addr: Port::new(q.clone(), 0),
                rdata: Port::new(q.clone(), 0),
            },
            write_port: WritePort {
                we: Port::new(q.clone(), false),
                wdata: Port::new(q, 0),
            },
        });
        kernel.register_clocked(Rc::clone(&mem) as Rc<dyn Clocked>);

        // Each read port's combinational output is re-evaluated whenever
        // any of its three driving inputs changes.
        let m0 = Rc::clone(&mem);
        let cb0: Callback = Rc::new(RefCell::new(move || m0.process_read0()));
        mem.read_port0.re.subscribe(Rc::clone(&cb0));
        mem.read_port0.width.subscribe(Rc::clone(&cb0));
        mem.read_port0.addr.subscribe(cb0);

        let m1 = Rc::clone(&mem);
        let cb1: Callback = Rc::new(RefCell::new(move || m1.process_read1()));
        mem.read_port1.re.subscribe(Rc::clone(&cb1));
        mem.read_port1.width.subscribe(Rc::clone(&cb1));
        mem.read_port1.addr.subscribe(cb1);

        mem
    }

    /// Loads a raw program image at address 0, overwriting the reset
    /// contents. Used by [`crate::program::load_image`].
    pub fn load_image(&self, image: &[u8]) {
        let mut bytes = self.bytes.borrow_mut();
        let n = image.len().min(bytes.len());
        bytes[..n].copy_from_slice(&image[..n]);
    }

    /// Directly peeks at `width` bytes starting at `addr`, bypassing the
    /// port mechanism entirely. Used for the CLI's post-run memory dump
    /// and for test assertions.
    pub fn peek(&self, addr: u32, width: u32) -> CoreResult<u32> {
        read_bytes(&self.bytes.borrow(), addr, width)
    }

    /// Re-evaluates read port 0's combinational output from its current
    /// `re`/`addr`/`width` inputs. Subscribed to each of those three ports.
    pub fn process_read0(&self) {
        self.process_read(&self.read_port0);
    }

    /// Re-evaluates read port 1's combinational output.
    pub fn process_read1(&self) {
        self.process_read(&self.read_port1);
    }

    fn process_read(&self, port: &ReadPort) {
        let val = if port.re.read() {
            let addr = port.addr.read();
            let width = port.width.read();
            read_bytes(&self.bytes.borrow(), addr, width).unwrap_or(0)
        } else {
            0
        };
        port.rdata.write(val);
    }
}

fn read_bytes(bytes: &[u8], addr: u32, width: u32) -> CoreResult<u32> {
    let addr = addr as usize;
    let n = width as usize;
    if !matches!(width, 1 | 2 | 4) {
        return Err(CoreError::InvalidWidth { width });
    }
    if addr.checked_add(n).map_or(true, |end| end > bytes.len()) {
        // Transient: the caller (combinational read) treats this as 0;
        // the fatal case is only at tick time (`commit_write`).
        return Ok(0);
    }
    let mut val: u32 = 0;
    for (i, b) in bytes[addr..addr + n].iter().enumerate() {
        val |= (*b as u32) << (8 * i);
    }
    Ok(val)
}

impl Clocked for Memory {
    fn tick(&self) -> CoreResult<()> {
        if !self.write_port.we.read() {
            return Ok(());
        }
        let addr = self.read_port0.addr.read();
        let width = self.read_port0.width.read();
        let wdata = self.write_port.wdata.read();

        if !matches!(width, 1 | 2 | 4) {
            // A write with a bogus width at tick time is a genuine fault,
            // not a transient propagation artifact (those are caught
            // earlier, at the owning stage's stable hook).
            return Err(CoreError::InvalidWidth { width });
        }

        let mut bytes = self.bytes.borrow_mut();
        let addr_usize = addr as usize;
        let n = width as usize;
        if addr_usize.checked_add(n).map_or(true, |end| end > bytes.len()) {
            // Surfaced as SegmentationFault through the owning stage's
            // stable hook, which re-checks bounds before committing here.
            return Err(CoreError::SegmentationFault { addr });
        }
        for i in 0..n {
            bytes[addr_usize + i] = ((wdata >> (8 * i)) & 0xFF) as u8;
        }
        Ok(())
    }

    fn reset(&self) {
        // Matches `original_source/pyv/mem.py`'s `_reset`: intentionally a
        // no-op, since a program image is loaded before the first reset
        // and resetting would discard it.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_and_peek_round_trip() {
        let kernel = Kernel::new();
        let mem = Memory::new(&kernel, 64);
        mem.load_image(&[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(mem.peek(0, 4).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn transient_out_of_range_read_is_zero() {
        let kernel = Kernel::new();
        let mem = Memory::new(&kernel, 16);
        assert_eq!(mem.peek(1000, 4).unwrap(), 0);
    }

    #[test]
    fn invalid_width_peek_errors() {
        let kernel = Kernel::new();
        let mem = Memory::new(&kernel, 16);
        assert!(matches!(
            mem.peek(0, 3),
            Err(CoreError::InvalidWidth { width: 3 })
        ));
    }

    #[test]
    fn write_commits_on_tick() {
        let kernel = Kernel::new();
        let mem = Memory::new(&kernel, 16);
        mem.read_port0.addr.write(4);
        mem.read_port0.width.write(4);
        mem.write_port.wdata.write(0x1234_5678);
        mem.write_port.we.write(true);
        mem.tick().unwrap();
        assert_eq!(mem.peek(4, 4).unwrap(), 0x1234_5678);
    }
}
