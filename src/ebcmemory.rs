// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

//! Data accesses performed by EBC instructions.
//!
//! EBC code may perform misaligned accesses, which are split into naturally aligned pieces of
//! half the size, ordered by memory fences, so that the guest memory bus only ever observes the
//! access sizes a strict-alignment CPU could perform.

use crate::ebcvm::*;

use core::sync::atomic::{fence, Ordering};
use log::debug;

fn aligned(addr: u64, size: u64) -> bool {
    addr & (size - 1) == 0
}

impl VmContext<'_> {
    /// The stack gap between the top of the VM stack and the stack magic is never used by EBC
    /// code, so addresses pass through unchanged. Accesses into the gap are logged.
    fn convert_stack_addr(&self, addr: u64) -> u64 {
        if addr > self.state.low_stack_top && addr <= self.state.high_stack_bottom {
            debug!(
                "EBC access to {:#x} in stack gap {:#x}..{:#x}\n",
                addr, self.state.low_stack_top, self.state.high_stack_bottom
            );
        }
        addr
    }

    fn load(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), VmExit> {
        self.host
            .memory()
            .load(addr, buf)
            .map_err(|f| self.bus_fault(f))
    }

    fn store(&mut self, addr: u64, data: &[u8]) -> Result<(), VmExit> {
        self.host
            .memory()
            .store(addr, data)
            .map_err(|f| self.bus_fault(f))
    }

    pub(crate) fn read_mem8(&mut self, addr: u64) -> Result<u8, VmExit> {
        let addr = self.convert_stack_addr(addr);
        let mut b = [0u8; 1];
        self.load(addr, &mut b)?;
        Ok(b[0])
    }

    pub(crate) fn read_mem16(&mut self, addr: u64) -> Result<u16, VmExit> {
        let addr = self.convert_stack_addr(addr);
        if aligned(addr, 2) {
            let mut b = [0u8; 2];
            self.load(addr, &mut b)?;
            return Ok(u16::from_le_bytes(b));
        }
        let lo = self.read_mem8(addr)? as u16;
        let hi = self.read_mem8(addr + 1)? as u16;
        Ok(lo | hi << 8)
    }

    pub(crate) fn read_mem32(&mut self, addr: u64) -> Result<u32, VmExit> {
        let addr = self.convert_stack_addr(addr);
        if aligned(addr, 4) {
            let mut b = [0u8; 4];
            self.load(addr, &mut b)?;
            return Ok(u32::from_le_bytes(b));
        }
        let lo = self.read_mem16(addr)? as u32;
        let hi = self.read_mem16(addr + 2)? as u32;
        Ok(lo | hi << 16)
    }

    pub(crate) fn read_mem64(&mut self, addr: u64) -> Result<u64, VmExit> {
        let addr = self.convert_stack_addr(addr);
        if aligned(addr, 8) {
            let mut b = [0u8; 8];
            self.load(addr, &mut b)?;
            return Ok(u64::from_le_bytes(b));
        }
        let lo = self.read_mem32(addr)? as u64;
        let hi = self.read_mem32(addr + 4)? as u64;
        Ok(lo | hi << 32)
    }

    /// Reads a natural word, zero extended to 64 bits
    pub(crate) fn read_memn(&mut self, addr: u64) -> Result<u64, VmExit> {
        let addr = self.convert_stack_addr(addr);
        let n = self.natural;
        let mut b = [0u8; 8];
        if aligned(addr, n as u64) {
            self.load(addr, &mut b[..n])?;
        } else {
            for (i, byte) in b[..n].iter_mut().enumerate() {
                *byte = self.read_mem8(addr + i as u64)?;
            }
        }
        Ok(u64::from_le_bytes(b))
    }

    pub(crate) fn write_mem8(&mut self, addr: u64, data: u8) -> Result<(), VmExit> {
        let addr = self.convert_stack_addr(addr);
        self.store(addr, &[data])
    }

    pub(crate) fn write_mem16(&mut self, addr: u64, data: u16) -> Result<(), VmExit> {
        let addr = self.convert_stack_addr(addr);
        if aligned(addr, 2) {
            return self.store(addr, &data.to_le_bytes());
        }
        fence(Ordering::SeqCst);
        self.write_mem8(addr, data as u8)?;
        fence(Ordering::SeqCst);
        self.write_mem8(addr + 1, (data >> 8) as u8)?;
        fence(Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn write_mem32(&mut self, addr: u64, data: u32) -> Result<(), VmExit> {
        let addr = self.convert_stack_addr(addr);
        if aligned(addr, 4) {
            return self.store(addr, &data.to_le_bytes());
        }
        fence(Ordering::SeqCst);
        self.write_mem16(addr, data as u16)?;
        fence(Ordering::SeqCst);
        self.write_mem16(addr + 2, (data >> 16) as u16)?;
        fence(Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn write_mem64(&mut self, addr: u64, data: u64) -> Result<(), VmExit> {
        let addr = self.convert_stack_addr(addr);
        if aligned(addr, 8) {
            return self.store(addr, &data.to_le_bytes());
        }
        fence(Ordering::SeqCst);
        self.write_mem32(addr, data as u32)?;
        fence(Ordering::SeqCst);
        self.write_mem32(addr + 4, (data >> 32) as u32)?;
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Writes the low natural word of `data`
    pub(crate) fn write_memn(&mut self, addr: u64, data: u64) -> Result<(), VmExit> {
        let addr = self.convert_stack_addr(addr);
        let n = self.natural;
        if aligned(addr, n as u64) {
            return self.store(addr, &data.to_le_bytes()[..n]);
        }
        fence(Ordering::SeqCst);
        for i in 0..n / 4 {
            self.write_mem32(addr + 4 * i as u64, (data >> (32 * i)) as u32)?;
            fence(Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebcvm::tests::FlatHost;
    use crate::memmap::{MemoryBus, MemoryFault};
    use crate::memorytype::EfiMemoryType;
    use crate::status::Status;
    use alloc::rc::Rc;
    use core::cell::{Cell, RefCell};

    /// Records the size and address of every store that reaches the bus
    struct RecordingHost {
        inner: FlatHost,
        stores: RefCell<Vec<(u64, usize)>>,
    }

    impl MemoryBus for RecordingHost {
        fn load(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryFault> {
            self.inner.load(addr, buf)
        }

        fn store(&self, addr: u64, data: &[u8]) -> Result<(), MemoryFault> {
            self.stores.borrow_mut().push((addr, data.len()));
            self.inner.store(addr, data)
        }
    }

    impl EbcHost for RecordingHost {
        fn memory(&self) -> &dyn MemoryBus {
            self
        }

        fn allocate(&self, memtype: EfiMemoryType, size: usize) -> Option<u64> {
            self.inner.allocate(memtype, size)
        }

        fn free(&self, addr: u64) {
            self.inner.free(addr)
        }

        fn call_native(&self, target: u64, args: &NativeArgs) -> Result<u64, VmExit> {
            self.inner.call_native(target, args)
        }
    }

    fn host() -> RecordingHost {
        RecordingHost {
            inner: FlatHost::new(0x1000, 0x2000),
            stores: RefCell::new(Vec::new()),
        }
    }

    #[test]
    fn misaligned_writes_are_split() {
        let host = host();
        let interp = EbcInterpreter::new(EbcConfig::default()).unwrap();
        let mut vm = VmContext::new(&host, &interp, 0x1000, 0x2000..0x3000).unwrap();
        host.stores.borrow_mut().clear();

        vm.write_mem64(0x1100, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(host.stores.borrow().as_slice(), &[(0x1100, 8)]);
        host.stores.borrow_mut().clear();

        vm.write_mem64(0x1204, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(host.stores.borrow().as_slice(), &[(0x1204, 4), (0x1208, 4)]);
        host.stores.borrow_mut().clear();

        vm.write_mem32(0x1301, 0xaabb_ccdd).unwrap();
        assert_eq!(
            host.stores.borrow().as_slice(),
            &[(0x1301, 1), (0x1302, 1), (0x1303, 1), (0x1304, 1)]
        );
        assert_eq!(vm.read_mem32(0x1301).unwrap(), 0xaabb_ccdd);
        assert_eq!(vm.read_mem64(0x1204).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(vm.read_mem16(0x1302).unwrap(), 0xbbcc);
    }

    #[test]
    fn natural_accesses() {
        let host = host();
        let interp = EbcInterpreter::new(EbcConfig {
            natural: 4,
            ..Default::default()
        })
        .unwrap();
        let mut vm = VmContext::new(&host, &interp, 0x1000, 0x2000..0x3000).unwrap();
        host.stores.borrow_mut().clear();
        vm.write_memn(0x1102, 0xffff_ffff_1234_5678).unwrap();
        assert_eq!(host.stores.borrow().as_slice(), &[(0x1102, 2), (0x1104, 2)]);
        assert_eq!(vm.read_memn(0x1102).unwrap(), 0x1234_5678);
        assert_eq!(vm.read_mem8(0x1106).unwrap(), 0);
    }

    #[test]
    fn unmapped_access_is_fatal() {
        let host = host();
        let interp = EbcInterpreter::new(EbcConfig::default()).unwrap();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        interp
            .register_exception_callback(
                ExceptionType::Undefined as u32,
                Some(Rc::new(move |_, _| h.set(h.get() + 1))),
            )
            .unwrap();
        let mut vm = VmContext::new(&host, &interp, 0x1000, 0x2000..0x3000).unwrap();
        assert_eq!(
            vm.read_mem32(0x8000),
            Err(VmExit::Fault(Status::EFI_UNSUPPORTED))
        );
        assert_eq!(hits.get(), 1);
    }
}
