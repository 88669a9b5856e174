// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

//! Calls from EBC code out of the VM. The boot and runtime services implemented by this crate are
//! reached through trampoline addresses stored in the guest system tables; any other target is
//! handed to the embedder's [`NativeDispatch`](crate::NativeDispatch) implementation.

use crate::bootservices::{self, BootService};
use crate::ebcvm::{EbcHost, NativeArgs, VmExit};
use crate::memmap::MemoryBus;
use crate::memorytype::EfiMemoryType;
use crate::runtimeservices::{self, RuntimeService};
use crate::status::Status;
use crate::{EfiContext, Guid};

use alloc::vec;
use alloc::vec::Vec;
use log::{debug, warn};
use widestring::U16CString;

const TRAMPOLINE_SIZE: usize = 16;

/// The most arguments passed to a native function
const MAX_NATIVE_ARGS: usize = 16;

/// The longest variable or file name accepted from guest code, in characters
pub(crate) const MAX_NAME_CHARS: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NativeService {
    Boot(BootService),
    Runtime(RuntimeService),
    Unsupported(&'static str),
}

/// Allocates one trampoline address per entry of `slots` in guest pool memory of type
/// `memtype`, and returns the addresses in slot order.
pub(crate) fn install_trampolines(
    ctx: &EfiContext,
    memtype: EfiMemoryType,
    slots: &[NativeService],
) -> Result<Vec<u64>, Status> {
    let size = slots.len() * TRAMPOLINE_SIZE;
    let base = ctx.allocate_pool(memtype, size)?;
    // all zeroes decodes as BREAK 0, so jumping to a trampoline from EBC code faults
    ctx.memmap.store(base, &vec![0u8; size])?;

    let mut services = ctx.services.borrow_mut();
    Ok(slots
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let addr = base + (i * TRAMPOLINE_SIZE) as u64;
            services.insert(addr, *s);
            addr
        })
        .collect())
}

/// Copies `len` bytes from guest memory at `addr`
pub(crate) fn read_bytes(bus: &dyn MemoryBus, addr: u64, len: usize) -> Result<Vec<u8>, Status> {
    // in chunks, so that a bogus length cannot make us allocate more than the guest has
    const CHUNK: usize = 0x1000;
    let mut v = Vec::new();
    while v.len() < len {
        let n = (len - v.len()).min(CHUNK);
        let start = v.len();
        v.resize(start + n, 0);
        bus.load(addr + start as u64, &mut v[start..])?;
    }
    Ok(v)
}

pub(crate) fn read_guid(bus: &dyn MemoryBus, addr: u64) -> Result<Guid, Status> {
    let mut b = [0u8; 16];
    bus.load(addr, &mut b)?;
    Guid::from_bytes(&b).ok_or(Status::EFI_INVALID_PARAMETER)
}

/// Reads a NUL terminated UCS-2 string of at most `max` characters from guest memory
pub(crate) fn read_ucs2(bus: &dyn MemoryBus, addr: u64, max: usize) -> Result<U16CString, Status> {
    let mut v = Vec::new();
    loop {
        let c = bus.load_u16(addr + 2 * v.len() as u64)?;
        if c == 0 {
            break;
        }
        if v.len() == max {
            return Err(Status::EFI_INVALID_PARAMETER);
        }
        v.push(c);
    }
    Ok(U16CString::from_vec_truncate(v))
}

/// Writes a UCS-2 string and its NUL terminator to guest memory
pub(crate) fn write_ucs2(bus: &dyn MemoryBus, addr: u64, s: &[u16]) -> Result<(), Status> {
    let b: Vec<u8> = s
        .iter()
        .chain(core::iter::once(&0))
        .flat_map(|c| c.to_le_bytes())
        .collect();
    Ok(bus.store(addr, &b)?)
}

impl EbcHost for EfiContext {
    fn memory(&self) -> &dyn MemoryBus {
        &self.memmap
    }

    fn allocate(&self, memtype: EfiMemoryType, size: usize) -> Option<u64> {
        self.allocate_pool(memtype, size).ok()
    }

    fn free(&self, addr: u64) {
        if self.free_pool(addr).is_err() {
            warn!("Failed to free VM memory at {addr:#x}\n");
        }
    }

    fn call_native(&self, target: u64, args: &NativeArgs) -> Result<u64, VmExit> {
        let service = self.services.borrow().get(&target).copied();
        match service {
            Some(NativeService::Boot(s)) => bootservices::dispatch(self, s, args),
            Some(NativeService::Runtime(s)) => runtimeservices::dispatch(self, s, args),
            Some(NativeService::Unsupported(name)) => {
                debug!("{name}() is not supported\n");
                Ok(Status::EFI_UNSUPPORTED.to_guest(args.width()))
            }
            None => {
                let native = self
                    .native
                    .as_ref()
                    .ok_or(VmExit::Fault(Status::EFI_UNSUPPORTED))?;
                let argv: Vec<u64> = (0..MAX_NATIVE_ARGS)
                    .map_while(|i| args.get(i).ok())
                    .collect();
                native.call(target, &argv).map_err(VmExit::Fault)
            }
        }
    }
}
