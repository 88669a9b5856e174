// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

use crate::PhysicalAddress;

pub const EFI_PAGE_SHIFT: usize = 12;
pub const EFI_PAGE_SIZE: usize = 1 << EFI_PAGE_SHIFT;
pub const EFI_PAGE_MASK: usize = EFI_PAGE_SIZE - 1;

pub const EFI_MEMORY_WB: u64 = 0x8;
pub const EFI_MEMORY_XP: u64 = 0x4000;
pub const EFI_MEMORY_RUNTIME: u64 = 0x8000_0000_0000_0000;

/// EFI memory types - refer to the UEFI specification for details.
#[allow(dead_code)]
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Debug)]
#[repr(u32)]
pub enum EfiMemoryType {
    EfiReservedEfiMemoryType,
    EfiLoaderCode,
    EfiLoaderData,
    EfiBootServicesCode,
    EfiBootServicesData,
    EfiRuntimeServicesCode,
    EfiRuntimeServicesData,
    EfiConventionalMemory,
    EfiUnusableMemory,
    EfiACPIReclaimMemory,
    EfiACPIMemoryNVS,
    EfiMemoryMappedIO,
    EfiMemoryMappedIOPortSpace,
    EfiPalCode,
    EfiPersistentMemory,
    EfiUnacceptedMemory,
}

impl EfiMemoryType {
    /// Decodes a memory type passed in by guest code.
    pub fn from_guest(value: u64) -> Option<Self> {
        use EfiMemoryType::*;
        Some(match value {
            1 => EfiLoaderCode,
            2 => EfiLoaderData,
            3 => EfiBootServicesCode,
            4 => EfiBootServicesData,
            5 => EfiRuntimeServicesCode,
            6 => EfiRuntimeServicesData,
            9 => EfiACPIReclaimMemory,
            10 => EfiACPIMemoryNVS,
            _ => return None,
        })
    }

    pub fn is_runtime(&self) -> bool {
        matches!(
            self,
            EfiMemoryType::EfiRuntimeServicesCode | EfiMemoryType::EfiRuntimeServicesData
        )
    }
}

/// EFI_MEMORY_DESCRIPTOR - refer to the UEFI specification for details
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct EfiMemoryDescriptor {
    pub r#type: EfiMemoryType,
    pub physical_start: PhysicalAddress,
    pub number_of_pages: u64,
    pub attribute: u64,
}

impl EfiMemoryDescriptor {
    pub(crate) fn end(&self) -> u64 {
        self.physical_start + (self.number_of_pages << EFI_PAGE_SHIFT)
    }

    /// Returns whether the descriptor covers part of the range described by `phys`
    /// and `num_pages`
    pub(crate) fn intersects(&self, phys: u64, num_pages: u64) -> bool {
        let end2 = phys + (num_pages << EFI_PAGE_SHIFT);

        phys < self.end() && self.physical_start < end2
    }
}
