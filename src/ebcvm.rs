// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

//! The EFI Byte Code virtual machine: register state, the host interface through which the VM
//! reaches guest memory and native services, the exception model and the interpreter object
//! that owns thunks and debug callbacks.

use crate::memmap::MemoryBus;
use crate::memorytype::EfiMemoryType;
use crate::status::Status;
use crate::Handle;

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;
use log::{debug, warn};

pub const VM_MAJOR_VERSION: u64 = 1;
pub const VM_MINOR_VERSION: u64 = 0;

pub(crate) const VM_STACK_KEY_VALUE: u64 = 0xDEAD_BEEF;

/// Space at the bottom of a VM stack that must never be used
const STACK_REMAIN_SIZE: u64 = 0x1000;

pub(crate) const VMFLAGS_CC: u64 = 0x0001;
pub(crate) const VMFLAGS_STEP: u64 = 0x0002;
pub(crate) const VMFLAGS_ALL_VALID: u64 = VMFLAGS_CC | VMFLAGS_STEP;

pub(crate) const STOPFLAG_APP_DONE: u32 = 0x0001;
pub(crate) const STOPFLAG_BREAKPOINT: u32 = 0x0002;

/// EBC exception types, as passed to exception callbacks
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ExceptionType {
    Undefined = 0,
    DivideError = 1,
    Debug = 2,
    Breakpoint = 3,
    Overflow = 4,
    InvalidOpcode = 5,
    StackFault = 6,
    AlignmentCheck = 7,
    InstructionEncoding = 8,
    BadBreak = 9,
    Step = 10,
}

pub const MAX_EBC_EXCEPTION: u32 = ExceptionType::Step as u32;

impl ExceptionType {
    pub fn from_u32(t: u32) -> Option<Self> {
        use ExceptionType::*;
        Some(match t {
            0 => Undefined,
            1 => DivideError,
            2 => Debug,
            3 => Breakpoint,
            4 => Overflow,
            5 => InvalidOpcode,
            6 => StackFault,
            7 => AlignmentCheck,
            8 => InstructionEncoding,
            9 => BadBreak,
            10 => Step,
            _ => return None,
        })
    }
}

pub const EXCEPTION_FLAG_NONE: u32 = 0x0000_0000;
pub const EXCEPTION_FLAG_WARNING: u32 = 0x0000_0001;
pub const EXCEPTION_FLAG_ERROR: u32 = 0x0000_0002;
pub const EXCEPTION_FLAG_FATAL: u32 = 0x8000_0000;

/// Configuration of the EBC interpreter
#[derive(Clone, Copy, Debug)]
pub struct EbcConfig {
    /// The size of a natural word (4 or 8 bytes)
    pub natural: usize,
    /// The size of the VM stack allocated for each invocation of EBC code by native code
    pub stack_size: usize,
}

impl Default for EbcConfig {
    fn default() -> Self {
        EbcConfig {
            natural: core::mem::size_of::<usize>(),
            stack_size: 128 * 1024,
        }
    }
}

/// A request by guest code to terminate the running image, see `Exit()`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitRequest {
    pub handle: Handle,
    pub status: Status,
    pub exit_data: Option<Vec<u16>>,
}

/// The reason EBC execution stopped before running to completion
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VmExit {
    /// A fatal exception occurred, or a native service failed in a way the VM cannot recover
    /// from
    Fault(Status),
    /// The current image called `Exit()`, and control must return to its `StartImage()` call
    Exit(ExitRequest),
}

impl From<VmExit> for Status {
    fn from(e: VmExit) -> Status {
        match e {
            VmExit::Fault(s) => s,
            VmExit::Exit(req) => req.status,
        }
    }
}

/// The arguments of a call from EBC into native code: natural word sized slots on the VM stack
pub struct NativeArgs<'a> {
    bus: &'a dyn MemoryBus,
    sp: u64,
    width: usize,
}

impl<'a> NativeArgs<'a> {
    pub fn new(bus: &'a dyn MemoryBus, sp: u64, width: usize) -> Self {
        NativeArgs { bus, sp, width }
    }

    /// Returns argument `index`, zero extended to 64 bits
    pub fn get(&self, index: usize) -> Result<u64, Status> {
        self.bus
            .load_natural(self.sp + (index * self.width) as u64, self.width)
            .or(Err(Status::EFI_INVALID_PARAMETER))
    }

    pub fn width(&self) -> usize {
        self.width
    }
}

/// The environment the VM executes in: guest memory, memory for VM stacks and thunks, and
/// native code reachable via CALLEX.
pub trait EbcHost {
    fn memory(&self) -> &dyn MemoryBus;

    /// Allocates `size` bytes of guest memory of type `memtype`
    fn allocate(&self, memtype: EfiMemoryType, size: usize) -> Option<u64>;

    /// Frees memory obtained via [`allocate`](Self::allocate)
    fn free(&self, addr: u64);

    /// Calls the native function at `target`. Returns the value to be placed in R7.
    fn call_native(&self, target: u64, args: &NativeArgs) -> Result<u64, VmExit>;
}

/// The architectural state of the VM
#[derive(Clone, Debug, Default)]
pub struct VmState {
    pub r: [u64; 8],
    pub flags: u64,
    pub ip: u64,
    pub frame_ptr: u64,
    pub entry_point: u64,

    pub(crate) stack_ret_addr: u64,
    pub(crate) stack_magic_ptr: u64,
    pub(crate) stack_top: u64,
    pub(crate) low_stack_top: u64,
    pub(crate) high_stack_bottom: u64,
    pub(crate) stop_flags: u32,

    pub image_handle: Handle,
    pub compiler_version: u32,
}

pub type ExceptionCallback = Rc<dyn Fn(ExceptionType, &mut VmState)>;
pub type ICacheFlush = Rc<dyn Fn(u64, u64) -> Status>;

const EBC_THUNK_SIGNATURE: u64 = 0xCA11_3BC0_CA11_3BC0;
const EBC_THUNK_SIZE: usize = 32;

#[derive(Clone, Copy, Debug)]
struct Thunk {
    image_handle: Handle,
    ebc_entry: u64,
    entry_point: bool,
}

/// The EBC interpreter: the per platform state shared by all VM invocations
pub struct EbcInterpreter {
    config: EbcConfig,
    thunks: RefCell<BTreeMap<u64, Thunk>>,
    callbacks: RefCell<BTreeMap<u32, ExceptionCallback>>,
    icache_flush: RefCell<Option<ICacheFlush>>,
}

/// A VM stack allocated for the duration of one invocation
struct VmStack<'a> {
    host: &'a dyn EbcHost,
    base: u64,
}

impl Drop for VmStack<'_> {
    fn drop(&mut self) {
        self.host.free(self.base);
    }
}

/// One running instance of the VM
pub struct VmContext<'a> {
    pub state: VmState,
    pub(crate) host: &'a dyn EbcHost,
    pub(crate) interp: &'a EbcInterpreter,
    pub(crate) natural: usize,
}

impl EbcInterpreter {
    /// Creates an interpreter for guest code with a natural word size of 4 or 8 bytes
    pub fn new(config: EbcConfig) -> Result<Self, Status> {
        if config.natural != 4 && config.natural != 8 {
            warn!("Unsupported EBC natural word size {}\n", config.natural);
            return Err(Status::EFI_INVALID_PARAMETER);
        }
        Ok(EbcInterpreter {
            config,
            thunks: RefCell::new(BTreeMap::new()),
            callbacks: RefCell::new(BTreeMap::new()),
            icache_flush: RefCell::new(None),
        })
    }

    pub fn config(&self) -> &EbcConfig {
        &self.config
    }

    /// Returns the VM version: bits 31:16 carry the major and bits 15:0 the minor version
    pub fn get_vm_version(&self) -> u64 {
        ((VM_MAJOR_VERSION & 0xFFFF) << 16) | (VM_MINOR_VERSION & 0xFFFF)
    }

    /// Creates a thunk that native code can call to invoke the EBC function at `ebc_entry` on
    /// behalf of `image_handle`. If `entry_point` is set, the thunk represents the entry point
    /// of the image. Returns the guest address of the thunk.
    pub fn create_thunk(
        &self,
        host: &dyn EbcHost,
        image_handle: Handle,
        ebc_entry: u64,
        entry_point: bool,
    ) -> Result<u64, Status> {
        if ebc_entry & 1 != 0 {
            return Err(Status::EFI_INVALID_PARAMETER);
        }

        let addr = host
            .allocate(EfiMemoryType::EfiBootServicesCode, EBC_THUNK_SIZE)
            .ok_or(Status::EFI_OUT_OF_RESOURCES)?;

        let mut body = [0u8; EBC_THUNK_SIZE];
        body[..8].copy_from_slice(&EBC_THUNK_SIGNATURE.to_le_bytes());
        body[8..16].copy_from_slice(&ebc_entry.to_le_bytes());
        body[16..24].copy_from_slice(&(image_handle as u64).to_le_bytes());
        if let Err(e) = host.memory().store(addr, &body) {
            host.free(addr);
            warn!("Failed to populate EBC thunk at {:#x}\n", e.address);
            return Err(Status::EFI_DEVICE_ERROR);
        }

        self.thunks.borrow_mut().insert(
            addr,
            Thunk {
                image_handle,
                ebc_entry,
                entry_point,
            },
        );
        self.flush_icache(addr, EBC_THUNK_SIZE as u64);
        debug!("Created EBC thunk at {addr:#x} for entry point {ebc_entry:#x}\n");
        Ok(addr)
    }

    /// Returns the EBC entry point that the thunk at `addr` invokes, if it is one
    pub fn thunk_target(&self, addr: u64) -> Option<u64> {
        self.thunks.borrow().get(&addr).map(|t| t.ebc_entry)
    }

    /// Releases all thunks created on behalf of `image_handle`
    pub fn unload_image(&self, host: &dyn EbcHost, image_handle: Handle) -> Result<(), Status> {
        let addrs: Vec<u64> = self
            .thunks
            .borrow()
            .iter()
            .filter(|(_, t)| t.image_handle == image_handle)
            .map(|(a, _)| *a)
            .collect();
        if addrs.is_empty() {
            return Err(Status::EFI_INVALID_PARAMETER);
        }
        let mut thunks = self.thunks.borrow_mut();
        for a in addrs {
            thunks.remove(&a);
            host.free(a);
        }
        Ok(())
    }

    /// Registers a function that will be called to flush the instruction cache after a thunk
    /// has been created.
    pub fn register_icache_flush(&self, flush: ICacheFlush) {
        *self.icache_flush.borrow_mut() = Some(flush);
    }

    fn flush_icache(&self, start: u64, len: u64) {
        let f = self.icache_flush.borrow().clone();
        if let Some(f) = f {
            f(start, len);
        }
    }

    /// Registers or unregisters (if `callback` is `None`) a callback for exceptions of type
    /// `exception`.
    pub fn register_exception_callback(
        &self,
        exception: u32,
        callback: Option<ExceptionCallback>,
    ) -> Result<(), Status> {
        if exception > MAX_EBC_EXCEPTION {
            return Err(Status::EFI_INVALID_PARAMETER);
        }
        let mut cbs = self.callbacks.borrow_mut();
        match callback {
            Some(cb) => {
                if cbs.contains_key(&exception) {
                    return Err(Status::EFI_ALREADY_STARTED);
                }
                cbs.insert(exception, cb);
            }
            None => {
                cbs.remove(&exception).ok_or(Status::EFI_INVALID_PARAMETER)?;
            }
        }
        Ok(())
    }

    fn callback(&self, exception: ExceptionType) -> Option<ExceptionCallback> {
        self.callbacks.borrow().get(&(exception as u32)).cloned()
    }

    /// Invokes the thunk at `thunk` with the natural word sized arguments in `args`, and returns
    /// the value the EBC code left in R7.
    pub fn call_thunk(
        &self,
        host: &dyn EbcHost,
        thunk: u64,
        args: &[u64],
    ) -> Result<u64, VmExit> {
        let t = *self
            .thunks
            .borrow()
            .get(&thunk)
            .ok_or(VmExit::Fault(Status::EFI_INVALID_PARAMETER))?;
        if t.entry_point {
            debug!("Executing EBC image entry point {:#x}\n", t.ebc_entry);
        }
        self.execute(host, t.image_handle, t.ebc_entry, args)
    }

    /// Runs the EBC function at `entry` on a fresh VM stack, passing the natural word sized
    /// arguments in `args`. Returns the value left in R7 when the function returns.
    pub fn execute(
        &self,
        host: &dyn EbcHost,
        image_handle: Handle,
        entry: u64,
        args: &[u64],
    ) -> Result<u64, VmExit> {
        let size = self.config.stack_size as u64;
        let base = host
            .allocate(EfiMemoryType::EfiBootServicesData, size as usize)
            .ok_or(VmExit::Fault(Status::EFI_OUT_OF_RESOURCES))?;
        let _stack = VmStack { host, base };

        let mut vm = VmContext {
            state: VmState {
                ip: entry,
                image_handle,
                ..Default::default()
            },
            host,
            interp: self,
            natural: self.config.natural,
        };

        let w = self.config.natural as u64;
        let st = &mut vm.state;
        st.stack_top = base + STACK_REMAIN_SIZE;
        st.r[0] = base + size;
        st.high_stack_bottom = st.r[0];
        st.r[0] -= w;
        st.r[0] &= !7;
        st.stack_magic_ptr = st.r[0];
        st.r[0] -= w;
        st.low_stack_top = st.r[0];

        let bus = host.memory();
        let fault = |_| VmExit::Fault(Status::EFI_OUT_OF_RESOURCES);
        bus.store_natural(st.stack_magic_ptr, self.config.natural, VM_STACK_KEY_VALUE)
            .map_err(fault)?;

        // Arguments go on the stack last to first, followed by a dummy return record so that
        // the EBC code finds them where a CALL would have put them.
        for a in args.iter().rev() {
            st.r[0] -= w;
            bus.store_natural(st.r[0], self.config.natural, *a)
                .map_err(fault)?;
        }
        st.r[0] -= 8;
        bus.store_u64(st.r[0], 0).map_err(fault)?;
        st.r[0] -= 8;
        bus.store_u64(st.r[0], 0xDEAD_DEAD_DEAD_DEAD)
            .map_err(fault)?;
        st.stack_ret_addr = st.r[0];

        vm.execute()?;
        Ok(vm.state.r[7])
    }
}

impl<'a> VmContext<'a> {
    /// Creates a VM context for running code on a caller provided stack. The stack top marker
    /// is placed at `sp`, the magic value right above it.
    pub fn new(
        host: &'a dyn EbcHost,
        interp: &'a EbcInterpreter,
        ip: u64,
        stack: core::ops::Range<u64>,
    ) -> Result<Self, VmExit> {
        let natural = interp.config.natural;
        let mut state = VmState {
            ip,
            ..Default::default()
        };
        state.stack_top = stack.start;
        state.high_stack_bottom = stack.end;
        state.stack_magic_ptr = (stack.end - natural as u64) & !7;
        state.low_stack_top = state.stack_magic_ptr - natural as u64;
        state.r[0] = state.low_stack_top - 16;
        state.stack_ret_addr = state.r[0];
        host.memory()
            .store_natural(state.stack_magic_ptr, natural, VM_STACK_KEY_VALUE)
            .or(Err(VmExit::Fault(Status::EFI_INVALID_PARAMETER)))?;
        Ok(VmContext {
            state,
            host,
            interp,
            natural,
        })
    }

    pub fn natural(&self) -> usize {
        self.natural
    }

    /// Notifies registered callbacks of an exception. Fatal exceptions stop execution, and are
    /// reported to the caller as `EFI_UNSUPPORTED`.
    pub(crate) fn signal_exception(
        &mut self,
        exception: ExceptionType,
        flags: u32,
    ) -> Result<(), VmExit> {
        if flags & EXCEPTION_FLAG_FATAL != 0 {
            warn!(
                "Fatal EBC exception {:?} at IP {:#x} (entry point {:#x})\n",
                exception, self.state.ip, self.state.entry_point
            );
        } else {
            debug!("EBC exception {:?} at IP {:#x}\n", exception, self.state.ip);
        }

        if let Some(cb) = self.interp.callback(exception) {
            cb(exception, &mut self.state);
        }

        if flags & EXCEPTION_FLAG_FATAL != 0 {
            Err(VmExit::Fault(Status::EFI_UNSUPPORTED))
        } else {
            Ok(())
        }
    }

    pub(crate) fn read_stack_magic(&self) -> Option<u64> {
        self.host
            .memory()
            .load_natural(self.state.stack_magic_ptr, self.natural)
            .ok()
    }

    pub(crate) fn natural_mask(&self) -> u64 {
        u64::MAX >> (64 - 8 * self.natural)
    }

    /// Sign extends a natural word to 64 bits
    pub(crate) fn sext_natural(&self, v: u64) -> u64 {
        if self.natural == 4 {
            v as u32 as i32 as i64 as u64
        } else {
            v
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memmap::MemoryFault;
    use core::cell::Cell;

    /// A flat chunk of guest memory at a fixed base address, with a bump allocator
    pub(crate) struct FlatHost {
        pub base: u64,
        pub mem: RefCell<Vec<u8>>,
        next: Cell<u64>,
        pub freed: RefCell<Vec<u64>>,
        pub native_calls: RefCell<Vec<(u64, Vec<u64>)>>,
    }

    impl FlatHost {
        pub fn new(base: u64, size: usize) -> Self {
            FlatHost {
                base,
                mem: RefCell::new(vec![0u8; size]),
                next: Cell::new(base + size as u64 / 2),
                freed: RefCell::new(Vec::new()),
                native_calls: RefCell::new(Vec::new()),
            }
        }

        pub fn write(&self, addr: u64, bytes: &[u8]) {
            self.store(addr, bytes).unwrap();
        }
    }

    impl MemoryBus for FlatHost {
        fn load(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryFault> {
            let mem = self.mem.borrow();
            let o = addr
                .checked_sub(self.base)
                .filter(|o| (*o as usize) + buf.len() <= mem.len())
                .ok_or(MemoryFault { address: addr })? as usize;
            buf.copy_from_slice(&mem[o..o + buf.len()]);
            Ok(())
        }

        fn store(&self, addr: u64, data: &[u8]) -> Result<(), MemoryFault> {
            let mut mem = self.mem.borrow_mut();
            let o = addr
                .checked_sub(self.base)
                .filter(|o| (*o as usize) + data.len() <= mem.len())
                .ok_or(MemoryFault { address: addr })? as usize;
            mem[o..o + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    impl EbcHost for FlatHost {
        fn memory(&self) -> &dyn MemoryBus {
            self
        }

        fn allocate(&self, _memtype: EfiMemoryType, size: usize) -> Option<u64> {
            let a = self.next.get();
            let end = a + ((size as u64 + 15) & !15);
            if end > self.base + self.mem.borrow().len() as u64 {
                return None;
            }
            self.next.set(end);
            Some(a)
        }

        fn free(&self, addr: u64) {
            self.freed.borrow_mut().push(addr);
        }

        fn call_native(&self, target: u64, args: &NativeArgs) -> Result<u64, VmExit> {
            if target != 0x5000 {
                return Err(VmExit::Fault(Status::EFI_UNSUPPORTED));
            }
            let a = vec![args.get(0).unwrap(), args.get(1).unwrap()];
            self.native_calls.borrow_mut().push((target, a));
            Ok(0x77)
        }
    }

    #[test]
    fn version_and_callback_registration() {
        let interp = EbcInterpreter::new(EbcConfig::default()).unwrap();
        assert_eq!(interp.get_vm_version(), 0x1_0000);

        for natural in [0, 2, 16] {
            let config = EbcConfig {
                natural,
                ..Default::default()
            };
            assert!(matches!(
                EbcInterpreter::new(config),
                Err(Status::EFI_INVALID_PARAMETER)
            ));
        }

        let cb: ExceptionCallback = Rc::new(|_, _| {});
        assert_eq!(
            interp.register_exception_callback(11, Some(cb.clone())),
            Err(Status::EFI_INVALID_PARAMETER)
        );
        interp.register_exception_callback(3, Some(cb.clone())).unwrap();
        assert_eq!(
            interp.register_exception_callback(3, Some(cb)),
            Err(Status::EFI_ALREADY_STARTED)
        );
        interp.register_exception_callback(3, None).unwrap();
        assert_eq!(
            interp.register_exception_callback(3, None),
            Err(Status::EFI_INVALID_PARAMETER)
        );
    }

    #[test]
    fn thunks_are_tracked_per_image() {
        let host = FlatHost::new(0x1_0000, 0x4_0000);
        let interp = EbcInterpreter::new(EbcConfig::default()).unwrap();
        let flushed = Rc::new(Cell::new(0u64));
        let f = flushed.clone();
        interp.register_icache_flush(Rc::new(move |start, _| {
            f.set(start);
            Status::EFI_SUCCESS
        }));

        assert_eq!(
            interp.create_thunk(&host, 7, 0x2001, false),
            Err(Status::EFI_INVALID_PARAMETER)
        );
        let t = interp.create_thunk(&host, 7, 0x2000, true).unwrap();
        assert_eq!(flushed.get(), t);
        assert_eq!(interp.thunk_target(t), Some(0x2000));
        assert_eq!(host.load_u64(t).unwrap(), EBC_THUNK_SIGNATURE);

        assert_eq!(
            interp.unload_image(&host, 8),
            Err(Status::EFI_INVALID_PARAMETER)
        );
        interp.unload_image(&host, 7).unwrap();
        assert_eq!(interp.thunk_target(t), None);
        assert_eq!(host.freed.borrow().as_slice(), &[t]);
    }

    #[test]
    fn entry_arguments_and_stack_release() {
        let host = FlatHost::new(0x1_0000, 0x8_0000);
        let interp = EbcInterpreter::new(EbcConfig::default()).unwrap();
        // MOVqw R7, @R0(+0, +16) ; RET
        host.write(0x1_0000, &[0x60, 0x87, 0x10, 0x00, 0x04, 0x00]);
        let r = interp.execute(&host, 1, 0x1_0000, &[0xabcd, 0x1234]).unwrap();
        assert_eq!(r, 0xabcd);
        assert_eq!(host.freed.borrow().len(), 1);
    }
}
