// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

use crate::memmap::MemoryBus;
use crate::memorytype::EfiMemoryType;
use crate::status::Status;
use crate::tableheader::{TableHeader, TABLE_HEADER_SIZE};
use crate::{bootservices, runtimeservices, EfiContext, UEFI_REVISION};

use alloc::vec::Vec;
use const_utf16::encode_null_terminated;
use log::debug;

pub const EFI_SYSTEM_TABLE_SIGNATURE: u64 = 0x5453_5953_2049_4249; // "IBI SYST"

const FIRMWARE_VENDOR: &[u16] = encode_null_terminated!("Google");

/// Builds the EFI system table and the service tables it refers to in guest memory, and returns
/// the guest address of the system table.
///
/// The console handles and protocols are left NULL, and the configuration table is empty.
pub(crate) fn install(ctx: &EfiContext) -> Result<u64, Status> {
    let w = ctx.ebc.config().natural;

    let vendor_bytes: Vec<u8> = FIRMWARE_VENDOR.iter().flat_map(|c| c.to_le_bytes()).collect();
    let vendor = ctx.allocate_pool(EfiMemoryType::EfiRuntimeServicesData, vendor_bytes.len())?;
    ctx.memmap.store(vendor, &vendor_bytes)?;

    let rt = runtimeservices::install(ctx)?;
    let bs = bootservices::install(ctx)?;

    let mut body = Vec::new();
    let mut push = |v: u64| body.extend_from_slice(&v.to_le_bytes()[..w]);
    push(vendor);
    // FirmwareRevision is a UINT32 padded to the natural alignment
    push(UEFI_REVISION as u64);
    for _ in 0..6 {
        push(0);
    }
    push(rt);
    push(bs);
    push(0);
    push(0);

    let st = ctx.allocate_pool(
        EfiMemoryType::EfiRuntimeServicesData,
        TABLE_HEADER_SIZE + body.len(),
    )?;
    let hdr = TableHeader {
        signature: EFI_SYSTEM_TABLE_SIGNATURE,
        revision: UEFI_REVISION,
    };
    hdr.write(&ctx.memmap, st, &body)?;
    debug!("EFI system table installed at {st:#x} (BS {bs:#x} RT {rt:#x})\n");
    Ok(st)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nativecall::{read_ucs2, MAX_NAME_CHARS};
    use crate::tableheader::verify;

    #[test]
    fn tables_are_checksummed() {
        let efi = crate::tests::context(None);
        let st = efi.system_table().unwrap();
        assert_eq!(efi.system_table(), Ok(st));

        let bus = &efi.memmap;
        assert!(verify(bus, st, EFI_SYSTEM_TABLE_SIGNATURE));
        assert_eq!(bus.load_u32(st + 12).unwrap(), 120);
        assert_eq!(bus.load_u32(st + 32).unwrap(), UEFI_REVISION);

        let vendor = bus.load_u64(st + 24).unwrap();
        let vendor = read_ucs2(bus, vendor, MAX_NAME_CHARS).unwrap();
        assert_eq!(vendor.to_string_lossy(), "Google");

        let rt = bus.load_u64(st + 88).unwrap();
        let bs = bus.load_u64(st + 96).unwrap();
        assert!(verify(bus, rt, runtimeservices::EFI_RUNTIME_SERVICES_SIGNATURE));
        assert!(verify(bus, bs, bootservices::EFI_BOOT_SERVICES_SIGNATURE));
        assert_eq!(bus.load_u32(rt + 12).unwrap(), 24 + 14 * 8);
        assert_eq!(bus.load_u32(bs + 12).unwrap(), 24 + 44 * 8);
        assert_eq!(bus.load_u64(st + 104).unwrap(), 0);

        assert_eq!(bus.pool_type(rt), Some(EfiMemoryType::EfiRuntimeServicesData));
        assert_eq!(bus.pool_type(bs), Some(EfiMemoryType::EfiBootServicesData));
    }
}
