// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

use crate::ebcvm::{NativeArgs, VmExit};
use crate::memmap::{MemoryBus, Placement};
use crate::memorytype::*;
use crate::nativecall::*;
use crate::status::Status;
use crate::tableheader::{crc32, TableHeader, TABLE_HEADER_SIZE};
use crate::{EfiContext, Handle, UEFI_REVISION};

use alloc::vec;
use alloc::vec::Vec;
use log::{trace, warn};

pub const EFI_BOOT_SERVICES_SIGNATURE: u64 = 0x5652_4553_544f_4f42; // "BOOTSERV"

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BootService {
    AllocatePages,
    FreePages,
    AllocatePool,
    FreePool,
    LoadImage,
    StartImage,
    Exit,
    UnloadImage,
    ExitBootServices,
    CalculateCrc32,
    CopyMem,
    SetMem,
}

use BootService::*;

/// The function slots of EFI_BOOT_SERVICES, in table order
const SLOTS: [(&str, Option<BootService>); 44] = [
    ("RaiseTPL", None),
    ("RestoreTPL", None),
    ("AllocatePages", Some(AllocatePages)),
    ("FreePages", Some(FreePages)),
    ("GetMemoryMap", None),
    ("AllocatePool", Some(AllocatePool)),
    ("FreePool", Some(FreePool)),
    ("CreateEvent", None),
    ("SetTimer", None),
    ("WaitForEvent", None),
    ("SignalEvent", None),
    ("CloseEvent", None),
    ("CheckEvent", None),
    ("InstallProtocolInterface", None),
    ("ReinstallProtocolInterface", None),
    ("UninstallProtocolInterface", None),
    ("HandleProtocol", None),
    ("Reserved", None),
    ("RegisterProtocolNotify", None),
    ("LocateHandle", None),
    ("LocateDevicePath", None),
    ("InstallConfigurationTable", None),
    ("LoadImage", Some(LoadImage)),
    ("StartImage", Some(StartImage)),
    ("Exit", Some(Exit)),
    ("UnloadImage", Some(UnloadImage)),
    ("ExitBootServices", Some(ExitBootServices)),
    ("GetNextMonotonicCount", None),
    ("Stall", None),
    ("SetWatchdogTimer", None),
    ("ConnectController", None),
    ("DisconnectController", None),
    ("OpenProtocol", None),
    ("CloseProtocol", None),
    ("OpenProtocolInformation", None),
    ("ProtocolsPerHandle", None),
    ("LocateHandleBuffer", None),
    ("LocateProtocol", None),
    ("InstallMultipleProtocolInterfaces", None),
    ("UninstallMultipleProtocolInterfaces", None),
    ("CalculateCrc32", Some(CalculateCrc32)),
    ("CopyMem", Some(CopyMem)),
    ("SetMem", Some(SetMem)),
    ("CreateEventEx", None),
];

/// Builds the boot services table in guest memory and returns its address
pub(crate) fn install(ctx: &EfiContext) -> Result<u64, Status> {
    let natural = ctx.ebc.config().natural;
    let services: Vec<NativeService> = SLOTS
        .iter()
        .map(|&(name, s)| s.map_or(NativeService::Unsupported(name), NativeService::Boot))
        .collect();
    let slots = install_trampolines(ctx, EfiMemoryType::EfiBootServicesCode, &services)?;

    let body: Vec<u8> = slots
        .iter()
        .flat_map(|s| s.to_le_bytes()[..natural].to_vec())
        .collect();
    let table = ctx.allocate_pool(
        EfiMemoryType::EfiBootServicesData,
        TABLE_HEADER_SIZE + body.len(),
    )?;
    let hdr = TableHeader {
        signature: EFI_BOOT_SERVICES_SIGNATURE,
        revision: UEFI_REVISION,
    };
    hdr.write(&ctx.memmap, table, &body)?;
    Ok(table)
}

pub(crate) fn dispatch(
    ctx: &EfiContext,
    service: BootService,
    args: &NativeArgs,
) -> Result<u64, VmExit> {
    let w = args.width();
    let status = match service {
        AllocatePages => Status::from(allocate_pages(ctx, args)),
        FreePages => Status::from(free_pages(ctx, args)),
        AllocatePool => Status::from(allocate_pool(ctx, args)),
        FreePool => Status::from(args.get(0).and_then(|b| ctx.free_pool(b))),
        LoadImage => Status::from(load_image(ctx, args)),
        StartImage => start_image(ctx, args),
        Exit => exit(ctx, args)?,
        UnloadImage => Status::from(args.get(0).and_then(|h| ctx.unload_image(h as Handle))),
        ExitBootServices => Status::from(exit_boot_services(ctx, args)),
        CalculateCrc32 => Status::from(calculate_crc32(ctx, args)),

        // these return the destination buffer rather than a status
        CopyMem | SetMem => {
            let r = if service == CopyMem {
                copy_mem(ctx, args)
            } else {
                set_mem(ctx, args)
            };
            return r.map_err(VmExit::Fault);
        }
    };
    trace!("{service:?}() -> {status:?}\n");
    Ok(status.to_guest(w))
}

fn allocate_pages(ctx: &EfiContext, args: &NativeArgs) -> Result<(), Status> {
    let bus = &ctx.memmap;
    let (alloc_type, memtype, pages, memory) =
        (args.get(0)?, args.get(1)?, args.get(2)? as usize, args.get(3)?);
    let memtype = EfiMemoryType::from_guest(memtype).ok_or(Status::EFI_INVALID_PARAMETER)?;
    if memory == 0 {
        return Err(Status::EFI_INVALID_PARAMETER);
    }
    let placement = match alloc_type {
        0 => Placement::Anywhere,
        1 => Placement::Max(bus.load_u64(memory)?),
        2 => Placement::Fixed(bus.load_u64(memory)?),
        _ => return Err(Status::EFI_INVALID_PARAMETER),
    };
    let base = ctx
        .allocate_pages(pages, memtype, placement)
        .ok_or(Status::EFI_OUT_OF_RESOURCES)?;
    trace!("AllocatePages() {pages} {memtype:?} -> {base:#x}\n");
    Ok(bus.store_u64(memory, base)?)
}

fn free_pages(ctx: &EfiContext, args: &NativeArgs) -> Result<(), Status> {
    let (memory, pages) = (args.get(0)?, args.get(1)? as usize);
    if memory as usize & EFI_PAGE_MASK != 0 {
        return Err(Status::EFI_INVALID_PARAMETER);
    }
    ctx.free_pages(memory, pages)
        .or(Err(Status::EFI_NOT_FOUND))
}

fn allocate_pool(ctx: &EfiContext, args: &NativeArgs) -> Result<(), Status> {
    let (pool_type, size, buffer) = (args.get(0)?, args.get(1)? as usize, args.get(2)?);
    let pool_type = EfiMemoryType::from_guest(pool_type).ok_or(Status::EFI_INVALID_PARAMETER)?;
    if buffer == 0 {
        return Err(Status::EFI_INVALID_PARAMETER);
    }
    let p = ctx.allocate_pool(pool_type, size)?;
    Ok(ctx.memmap.store_natural(buffer, args.width(), p)?)
}

fn load_image(ctx: &EfiContext, args: &NativeArgs) -> Result<(), Status> {
    let (parent, source, size, handle) = (
        args.get(1)? as Handle,
        args.get(3)?,
        args.get(4)? as usize,
        args.get(5)?,
    );
    // loading from a device path is not supported
    if source == 0 || size == 0 {
        return Err(Status::EFI_UNSUPPORTED);
    }
    if handle == 0 {
        return Err(Status::EFI_INVALID_PARAMETER);
    }
    let image = read_bytes(&ctx.memmap, source, size)?;
    let h = ctx.load_image(parent, &image)?;
    Ok(ctx.memmap.store_natural(handle, args.width(), h as u64)?)
}

fn start_image(ctx: &EfiContext, args: &NativeArgs) -> Status {
    let (handle, exit_data_size, exit_data) = match (args.get(0), args.get(1), args.get(2)) {
        (Ok(h), Ok(s), Ok(d)) => (h as Handle, s, d),
        _ => return Status::EFI_INVALID_PARAMETER,
    };
    let (status, data) = ctx.start_image(handle);
    if let Some(data) = data.filter(|_| exit_data_size != 0 && exit_data != 0) {
        let bytes: Vec<u8> = data.iter().flat_map(|c| c.to_le_bytes()).collect();
        let returned = ctx
            .allocate_pool(EfiMemoryType::EfiBootServicesData, bytes.len())
            .and_then(|p| {
                ctx.memmap.store(p, &bytes)?;
                ctx.memmap.store_natural(exit_data, args.width(), p)?;
                ctx.memmap
                    .store_natural(exit_data_size, args.width(), bytes.len() as u64)?;
                Ok(())
            });
        if let Err(e) = returned {
            warn!("Failed to return exit data: {e:?}\n");
        }
    }
    status
}

fn exit(ctx: &EfiContext, args: &NativeArgs) -> Result<Status, VmExit> {
    let get = |i| args.get(i).map_err(VmExit::Fault);
    let (handle, status, size, data) = (get(0)? as Handle, get(1)?, get(2)? as usize, get(3)?);
    let status = Status::from_guest(status, args.width());
    let exit_data = if size >= 2 && data != 0 {
        let b = read_bytes(&ctx.memmap, data, size & !1).map_err(VmExit::Fault)?;
        Some(
            b.chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
        )
    } else {
        None
    };
    ctx.exit(handle, status, exit_data)
}

fn exit_boot_services(ctx: &EfiContext, args: &NativeArgs) -> Result<(), Status> {
    if args.get(1)? as usize != ctx.memmap.key() {
        return Err(Status::EFI_INVALID_PARAMETER);
    }
    trace!("ExitBootServices()\n");
    ctx.exit_boot_services();
    Ok(())
}

fn calculate_crc32(ctx: &EfiContext, args: &NativeArgs) -> Result<(), Status> {
    let (data, size, crc) = (args.get(0)?, args.get(1)? as usize, args.get(2)?);
    if data == 0 || size == 0 || crc == 0 {
        return Err(Status::EFI_INVALID_PARAMETER);
    }
    let bytes = read_bytes(&ctx.memmap, data, size)?;
    Ok(ctx.memmap.store_u32(crc, crc32(&bytes))?)
}

fn copy_mem(ctx: &EfiContext, args: &NativeArgs) -> Result<u64, Status> {
    let (dst, src, len) = (args.get(0)?, args.get(1)?, args.get(2)? as usize);
    let bytes = read_bytes(&ctx.memmap, src, len)?;
    ctx.memmap.store(dst, &bytes)?;
    Ok(dst)
}

fn set_mem(ctx: &EfiContext, args: &NativeArgs) -> Result<u64, Status> {
    let (buf, size, value) = (args.get(0)?, args.get(1)? as usize, args.get(2)? as u8);
    // a bogus size faults here rather than in the allocation below
    read_bytes(&ctx.memmap, buf, size)?;
    ctx.memmap.store(buf, &vec![value; size])?;
    Ok(buf)
}
