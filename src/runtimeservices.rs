// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

use crate::ebcvm::{NativeArgs, VmExit};
use crate::memmap::MemoryBus;
use crate::memorytype::EfiMemoryType;
use crate::nativecall::*;
use crate::status::Status;
use crate::tableheader::{TableHeader, TABLE_HEADER_SIZE};
use crate::{EfiContext, UEFI_REVISION};

use alloc::vec::Vec;
use log::trace;

pub const EFI_RUNTIME_SERVICES_SIGNATURE: u64 = 0x5652_4553_544e_5552; // "RUNTSERV"

/// The largest data buffer accepted by SetVariable()
const MAX_SET_VARIABLE_DATA: usize = 0x10_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RuntimeService {
    GetVariable,
    GetNextVariableName,
    SetVariable,
    QueryVariableInfo,
}

use RuntimeService::*;

/// The function slots of EFI_RUNTIME_SERVICES, in table order
const SLOTS: [(&str, Option<RuntimeService>); 14] = [
    ("GetTime", None),
    ("SetTime", None),
    ("GetWakeupTime", None),
    ("SetWakeupTime", None),
    ("SetVirtualAddressMap", None),
    ("ConvertPointer", None),
    ("GetVariable", Some(GetVariable)),
    ("GetNextVariableName", Some(GetNextVariableName)),
    ("SetVariable", Some(SetVariable)),
    ("GetNextHighMonotonicCount", None),
    ("ResetSystem", None),
    ("UpdateCapsule", None),
    ("QueryCapsuleCapabilities", None),
    ("QueryVariableInfo", Some(QueryVariableInfo)),
];

/// Builds the runtime services table in guest memory and returns its address
pub(crate) fn install(ctx: &EfiContext) -> Result<u64, Status> {
    let natural = ctx.ebc.config().natural;
    let services: Vec<NativeService> = SLOTS
        .iter()
        .map(|&(name, s)| s.map_or(NativeService::Unsupported(name), NativeService::Runtime))
        .collect();
    let slots = install_trampolines(ctx, EfiMemoryType::EfiRuntimeServicesCode, &services)?;

    let body: Vec<u8> = slots
        .iter()
        .flat_map(|s| s.to_le_bytes()[..natural].to_vec())
        .collect();
    let table = ctx.allocate_pool(
        EfiMemoryType::EfiRuntimeServicesData,
        TABLE_HEADER_SIZE + body.len(),
    )?;
    let hdr = TableHeader {
        signature: EFI_RUNTIME_SERVICES_SIGNATURE,
        revision: UEFI_REVISION,
    };
    hdr.write(&ctx.memmap, table, &body)?;
    Ok(table)
}

pub(crate) fn dispatch(
    ctx: &EfiContext,
    service: RuntimeService,
    args: &NativeArgs,
) -> Result<u64, VmExit> {
    let ret = match service {
        GetVariable => get_variable(ctx, args),
        GetNextVariableName => get_next_variable_name(ctx, args),
        SetVariable => set_variable(ctx, args),
        QueryVariableInfo => query_variable_info(ctx, args),
    };
    let status = Status::from(ret);
    trace!("{service:?}() -> {status:?}\n");
    Ok(status.to_guest(args.width()))
}

fn get_variable(ctx: &EfiContext, args: &NativeArgs) -> Result<(), Status> {
    let bus = &ctx.memmap;
    let w = args.width();
    let (name, guid, attributes, data_size, data) = (
        args.get(0)?,
        args.get(1)?,
        args.get(2)?,
        args.get(3)?,
        args.get(4)?,
    );
    if name == 0 || guid == 0 || data_size == 0 {
        return Err(Status::EFI_INVALID_PARAMETER);
    }
    let name = read_ucs2(bus, name, MAX_NAME_CHARS)?;
    let guid = read_guid(bus, guid)?;
    let size = bus.load_natural(data_size, w)? as usize;

    let (attr, value) = ctx.variables.get_variable(&name, &guid)?;
    bus.store_natural(data_size, w, value.len() as u64)?;
    if size < value.len() {
        return Err(Status::EFI_BUFFER_TOO_SMALL);
    }
    if data == 0 {
        return Err(Status::EFI_INVALID_PARAMETER);
    }
    bus.store(data, &value)?;
    if attributes != 0 {
        bus.store_u32(attributes, attr)?;
    }
    Ok(())
}

fn get_next_variable_name(ctx: &EfiContext, args: &NativeArgs) -> Result<(), Status> {
    let bus = &ctx.memmap;
    let w = args.width();
    let (name_size, name, guid) = (args.get(0)?, args.get(1)?, args.get(2)?);
    if name_size == 0 || name == 0 || guid == 0 {
        return Err(Status::EFI_INVALID_PARAMETER);
    }
    let size = bus.load_natural(name_size, w)? as usize;
    let current = read_ucs2(bus, name, size / 2)?;
    let vendor = read_guid(bus, guid)?;

    let (next, next_guid) = ctx.variables.get_next_variable_name(&current, &vendor)?;
    let needed = (next.len() + 1) * 2;
    bus.store_natural(name_size, w, needed as u64)?;
    if size < needed {
        return Err(Status::EFI_BUFFER_TOO_SMALL);
    }
    write_ucs2(bus, name, next.as_slice())?;
    bus.store(guid, &next_guid.to_bytes())?;
    Ok(())
}

fn set_variable(ctx: &EfiContext, args: &NativeArgs) -> Result<(), Status> {
    let bus = &ctx.memmap;
    let (name, guid, attributes, size, data) = (
        args.get(0)?,
        args.get(1)?,
        args.get(2)? as u32,
        args.get(3)? as usize,
        args.get(4)?,
    );
    if name == 0 || guid == 0 || (size != 0 && data == 0) || size > MAX_SET_VARIABLE_DATA {
        return Err(Status::EFI_INVALID_PARAMETER);
    }
    let name = read_ucs2(bus, name, MAX_NAME_CHARS)?;
    let guid = read_guid(bus, guid)?;
    let data = read_bytes(bus, data, size)?;
    ctx.variables.set_variable(&name, &guid, attributes, &data)
}

fn query_variable_info(ctx: &EfiContext, args: &NativeArgs) -> Result<(), Status> {
    let bus = &ctx.memmap;
    let (attributes, max_storage, remaining, max_size) = (
        args.get(0)? as u32,
        args.get(1)?,
        args.get(2)?,
        args.get(3)?,
    );
    if max_storage == 0 || remaining == 0 || max_size == 0 {
        return Err(Status::EFI_INVALID_PARAMETER);
    }
    let info = ctx.variables.query_variable_info(attributes)?;
    bus.store_u64(max_storage, info.maximum_variable_storage_size)?;
    bus.store_u64(remaining, info.remaining_variable_storage_size)?;
    bus.store_u64(max_size, info.maximum_variable_size)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebcvm::EbcHost;
    use crate::varformat::*;
    use crate::variable::EFI_GLOBAL_VARIABLE_GUID;

    const NV_BS_RT: u64 = (EFI_VARIABLE_NON_VOLATILE
        | EFI_VARIABLE_BOOTSERVICE_ACCESS
        | EFI_VARIABLE_RUNTIME_ACCESS) as u64;

    /// Guest scratch memory for arguments and buffers
    struct Frame<'a> {
        efi: &'a EfiContext,
        base: u64,
    }

    impl Frame<'_> {
        fn at(&self, off: u64) -> u64 {
            self.base + off
        }

        /// Calls the runtime service in `slot` with arguments placed at offset 0
        fn call(&self, slot: usize, args: &[u64]) -> Status {
            let st = self.efi.system_table().unwrap();
            let rt = self.efi.memmap.load_u64(st + 88).unwrap();
            let target = self
                .efi
                .memmap
                .load_u64(rt + (TABLE_HEADER_SIZE + slot * 8) as u64)
                .unwrap();
            for (i, a) in args.iter().enumerate() {
                self.efi.memmap.store_u64(self.base + 8 * i as u64, *a).unwrap();
            }
            let nargs = NativeArgs::new(&self.efi.memmap, self.base, 8);
            Status::from_guest(self.efi.call_native(target, &nargs).unwrap(), 8)
        }
    }

    fn frame(efi: &EfiContext) -> Frame {
        let base = efi
            .allocate_pool(EfiMemoryType::EfiBootServicesData, 0x1000)
            .unwrap();
        efi.memmap.store(base, &[0u8; 0x1000]).unwrap();
        Frame { efi, base }
    }

    #[test]
    fn variable_services_from_guest() {
        let efi = crate::tests::context(None);
        let f = frame(&efi);
        let bus = &efi.memmap;

        let (name, guid, data) = (f.at(0x100), f.at(0x200), f.at(0x300));
        let (size, attr) = (f.at(0x400), f.at(0x408));
        write_ucs2(bus, name, widestring::u16str!("Timeout").as_slice()).unwrap();
        bus.store(guid, &EFI_GLOBAL_VARIABLE_GUID.to_bytes()).unwrap();
        bus.store(data, &[5, 0]).unwrap();
        assert_eq!(f.call(8, &[name, guid, NV_BS_RT, 2, data]), Status::EFI_SUCCESS);

        bus.store_u64(size, 1).unwrap();
        assert_eq!(
            f.call(6, &[name, guid, attr, size, data + 0x10]),
            Status::EFI_BUFFER_TOO_SMALL
        );
        assert_eq!(bus.load_u64(size).unwrap(), 2);
        assert_eq!(f.call(6, &[name, guid, attr, size, data + 0x10]), Status::EFI_SUCCESS);
        assert_eq!(bus.load_u16(data + 0x10).unwrap(), 5);
        assert_eq!(bus.load_u32(attr).unwrap() as u64, NV_BS_RT);
        assert_eq!(f.call(6, &[0, guid, attr, size, data]), Status::EFI_INVALID_PARAMETER);

        // volatile variables are enumerated first, so Timeout comes last
        let (nsize, nbuf, nguid) = (f.at(0x500), f.at(0x600), f.at(0x700));
        bus.store_u64(nsize, 0x100).unwrap();
        let mut names = Vec::new();
        loop {
            bus.store_u64(nsize, 0x100).unwrap();
            match f.call(7, &[nsize, nbuf, nguid]) {
                Status::EFI_SUCCESS => {
                    names.push(read_ucs2(bus, nbuf, MAX_NAME_CHARS).unwrap().to_string_lossy())
                }
                Status::EFI_NOT_FOUND => break,
                s => panic!("unexpected status {s:?}"),
            }
        }
        assert_eq!(names.last().map(|s| s.as_str()), Some("Timeout"));
        assert!(names.iter().any(|n| n == "SetupMode"));

        bus.store_u64(nsize, 2).unwrap();
        write_ucs2(bus, nbuf, &[]).unwrap();
        assert_eq!(f.call(7, &[nsize, nbuf, nguid]), Status::EFI_BUFFER_TOO_SMALL);
        assert!(bus.load_u64(nsize).unwrap() > 2);

        let (a, b, c) = (f.at(0x800), f.at(0x808), f.at(0x810));
        assert_eq!(f.call(13, &[NV_BS_RT, a, b, c]), Status::EFI_SUCCESS);
        assert!(bus.load_u64(b).unwrap() < bus.load_u64(a).unwrap());
        assert_eq!(bus.load_u64(c).unwrap(), 0x400 - VARIABLE_HEADER_SIZE as u64);

        // deleting via the guest interface
        assert_eq!(f.call(8, &[name, guid, NV_BS_RT, 0, 0]), Status::EFI_SUCCESS);
        assert_eq!(f.call(6, &[name, guid, attr, size, data]), Status::EFI_NOT_FOUND);
    }

    #[test]
    fn other_slots_are_unsupported() {
        let efi = crate::tests::context(None);
        let f = frame(&efi);
        assert_eq!(f.call(0, &[0, 0]), Status::EFI_UNSUPPORTED);
        assert_eq!(f.call(10, &[0, 0, 0, 0]), Status::EFI_UNSUPPORTED);
    }
}
