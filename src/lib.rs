// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

//! This crate implements the parts of a EFI firmware that can run EFI Byte Code (EBC) drivers and
//! applications and persist their configuration, on top of a simulated guest address space.
//!
//! It implements the following features/APIs:
//! - a guest memory map with page and pool allocation routines, exposed to guest code via a byte
//! addressed memory bus;
//! - an EBC interpreter covering the complete EBC instruction set, including calls from EBC into
//! native firmware services and back via thunks;
//! - a fault tolerant, log structured EFI variable store on top of a firmware volume block
//! device, with garbage collection and crash consistent update ordering;
//! - authenticated variables (counter and time based) and the Secure Boot platform mode
//! state machine;
//! - an image loader implementing the LoadImage/StartImage/Exit/UnloadImage life cycle;
//! - guest resident system, boot services and runtime services tables whose variable and
//! memory services are bridged to the implementations above.
//!
//! The following EFI features are NOT supported:
//! - the UEFI driver model and the protocol database
//! - asynchronous events and notifications
//! - execution of native (non-EBC) code, which is delegated to the embedder
//!
//! # Example
//!
//! ```
//! use efivm::fvb::{MemoryFlash, MemoryFtw};
//! use efivm::memmap::MemoryMap;
//! use efivm::variable::{VariableConfig, VariableStore};
//! use efivm::authservice::{AuthVariableService, NullVerifier};
//!
//! let memmap = MemoryMap::new();
//! memmap.declare_memory_region(&(0x10_0000..0x100_0000)).unwrap();
//!
//! let flash = MemoryFlash::new_variable_volume(0x1000, 16);
//! let store = VariableStore::new(
//!     VariableConfig::default(),
//!     Box::new(flash),
//!     Box::new(MemoryFtw::new()),
//! )
//! .unwrap();
//! let vars = AuthVariableService::new(store, Box::new(NullVerifier), false).unwrap();
//!
//! let efi = efivm::EfiContext::new(memmap, vars, None).unwrap();
//! assert!(efi.system_table().is_ok());
//! ```

#![cfg_attr(not(test), no_std)]

macro_rules! align_up {
    ($value:expr, $alignment:expr) => {
        (($value - 1) | ($alignment - 1)) + 1
    };
}

use crate::{
    authservice::AuthVariableService, ebcvm::EbcInterpreter, loadedimage::ImageDb, memmap::*,
    memorytype::*, nativecall::NativeService, peloader::*, status::*,
};

use core::cell::RefCell;
use core::sync::atomic::{AtomicUsize, Ordering};

extern crate alloc;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use once_cell::unsync::OnceCell;

const UEFI_REVISION: u32 = (2 << 16) | 100; // 2.10

pub mod authservice;
pub mod bootservices;
pub mod ebcdecode;
mod ebcexecute;
pub mod ebcmemory;
pub mod ebcvm;
pub mod fvb;
pub mod loadedimage;
pub mod memmap;
pub mod memorytype;
mod nativecall;
pub mod peloader;
mod poolalloc;
pub mod runtimeservices;
pub mod status;
mod systemtable;
mod tableheader;
pub mod variable;
mod varlang;
pub mod varformat;

pub type Char16 = u16;
pub type PhysicalAddress = u64;
pub type Handle = usize;
pub type Lba = u64;

pub(crate) fn new_handle() -> usize {
    static COUNTER: AtomicUsize = AtomicUsize::new(1);
    COUNTER.fetch_add(1, Ordering::AcqRel)
}

#[derive(PartialEq, PartialOrd, Eq, Ord, Clone, Copy, Debug, Default, Hash)]
#[repr(C)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

#[macro_export]
macro_rules! guid {
    ($a:literal, $b:literal, $c: literal, $d:expr) => {
        $crate::Guid {
            data1: $a,
            data2: $b,
            data3: $c,
            data4: $d,
        }
    };
    ($s:literal) => {
        $crate::Guid::from_str($s)
    };
}

const fn hex_digit(c: u8) -> u64 {
    match c {
        b'0'..=b'9' => (c - b'0') as u64,
        b'a'..=b'f' => (c - b'a' + 10) as u64,
        b'A'..=b'F' => (c - b'A' + 10) as u64,
        _ => panic!("invalid GUID string"),
    }
}

const fn hex_field(s: &[u8], start: usize, len: usize) -> u64 {
    let mut v = 0;
    let mut i = 0;
    while i < len {
        v = (v << 4) | hex_digit(s[start + i]);
        i += 1;
    }
    v
}

impl Guid {
    /// Parses a GUID in its canonical 8-4-4-4-12 string form at compile time.
    pub const fn from_str(s: &str) -> Guid {
        let s = s.as_bytes();
        if s.len() != 36 || s[8] != b'-' || s[13] != b'-' || s[18] != b'-' || s[23] != b'-' {
            panic!("invalid GUID string");
        }
        let mut data4 = [0u8; 8];
        data4[0] = hex_field(s, 19, 2) as u8;
        data4[1] = hex_field(s, 21, 2) as u8;
        let mut i = 0;
        while i < 6 {
            data4[2 + i] = hex_field(s, 24 + 2 * i, 2) as u8;
            i += 1;
        }
        Guid {
            data1: hex_field(s, 0, 8) as u32,
            data2: hex_field(s, 9, 4) as u16,
            data3: hex_field(s, 14, 4) as u16,
            data4,
        }
    }

    /// The in-memory byte representation of the GUID
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[..4].copy_from_slice(&self.data1.to_le_bytes());
        b[4..6].copy_from_slice(&self.data2.to_le_bytes());
        b[6..8].copy_from_slice(&self.data3.to_le_bytes());
        b[8..].copy_from_slice(&self.data4);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Option<Guid> {
        let b: &[u8; 16] = b.get(..16)?.try_into().ok()?;
        Some(Guid {
            data1: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            data2: u16::from_le_bytes([b[4], b[5]]),
            data3: u16::from_le_bytes([b[6], b[7]]),
            data4: [b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]],
        })
    }
}

/// Implementations of this trait should be provided for loading images and potentially other
/// assets that are needed to boot.
pub trait FileLoader {
    /// Returns the size of the file
    fn get_size(&self) -> usize;

    /// Copies `loadbuffer.len()` bytes from the file starting at `offset` into `loadbuffer`.
    fn load_range(&self, loadbuffer: &mut [u8], offset: usize) -> Result<(), &str>;
}

impl<T: AsRef<[u8]>> FileLoader for T {
    fn get_size(&self) -> usize {
        self.as_ref().len()
    }

    fn load_range(&self, loadbuffer: &mut [u8], offset: usize) -> Result<(), &str> {
        let src = offset
            .checked_add(loadbuffer.len())
            .and_then(|end| self.as_ref().get(offset..end))
            .ok_or("Read beyond end of file")?;
        loadbuffer.copy_from_slice(src);
        Ok(())
    }
}

/// An implementation of this trait may be provided to the EFI context at construction time so
/// that native code can be invoked on behalf of guest code: images that are not EBC, and call
/// targets that are neither thunks nor services implemented by this crate.
pub trait NativeDispatch {
    /// Calls the native function at `target` with the natural word sized arguments `args`.
    fn call(&self, target: u64, args: &[u64]) -> Result<u64, Status>;
}

pub struct EfiContext {
    pub(crate) memmap: MemoryMap,
    pub(crate) ebc: EbcInterpreter,
    pub(crate) variables: AuthVariableService,
    pub(crate) images: ImageDb,
    pub(crate) pe_loader: Box<dyn PeCoffLoader>,
    pub(crate) native: Option<Box<dyn NativeDispatch>>,

    pub(crate) services: RefCell<BTreeMap<u64, NativeService>>,
    st: OnceCell<u64>,
}

impl EfiContext {
    /// Creates a new EFI context using the guest memory described by `memmap` and the variable
    /// services in `variables`. An optional [`NativeDispatch`] implementation may be provided to
    /// execute native code.
    pub fn new(
        memmap: MemoryMap,
        variables: AuthVariableService,
        native: Option<Box<dyn NativeDispatch>>,
    ) -> Result<Self, Status> {
        Self::with_loader(memmap, variables, native, Box::new(PeLoader))
    }

    /// Like [`new`](Self::new), but with a different PE/COFF loader implementation.
    pub fn with_loader(
        memmap: MemoryMap,
        variables: AuthVariableService,
        native: Option<Box<dyn NativeDispatch>>,
        pe_loader: Box<dyn PeCoffLoader>,
    ) -> Result<Self, Status> {
        Ok(EfiContext {
            memmap,
            ebc: EbcInterpreter::new(Default::default())?,
            variables,
            images: ImageDb::new(),
            pe_loader,
            native,
            services: RefCell::new(BTreeMap::new()),
            st: OnceCell::new(),
        })
    }

    /// The guest memory map
    pub fn memmap(&self) -> &MemoryMap {
        &self.memmap
    }

    /// The EBC interpreter
    pub fn ebc(&self) -> &EbcInterpreter {
        &self.ebc
    }

    /// The (authenticated) variable services
    pub fn variables(&self) -> &AuthVariableService {
        &self.variables
    }

    /// Returns the guest address of the EFI system table, creating it on first use.
    pub fn system_table(&self) -> Result<u64, Status> {
        self.st
            .get_or_try_init(|| systemtable::install(self))
            .copied()
    }

    /// Allocate `size` bytes of EFI pool memory of type `pool_type` in guest memory.
    pub fn allocate_pool(&self, pool_type: EfiMemoryType, size: usize) -> Result<u64, Status> {
        self.memmap.allocate_pool(pool_type, size).map_err(|e| {
            log::debug!("Allocate pool failed {e}");
            Status::EFI_OUT_OF_RESOURCES
        })
    }

    /// Free pool memory at `buffer` that was allocated via [`allocate_pool`](Self::allocate_pool).
    pub fn free_pool(&self, buffer: u64) -> Result<(), Status> {
        self.memmap
            .free_pool(buffer)
            .or(Err(Status::EFI_INVALID_PARAMETER))
    }

    /// Allocate `pages` 4KiB pages of guest memory of type `_type`, placed according to
    /// `placement`. Returns the guest address of the allocation.
    pub fn allocate_pages(
        &self,
        pages: usize,
        _type: EfiMemoryType,
        placement: Placement,
    ) -> Option<u64> {
        self.memmap.allocate_pages(pages, _type, placement)
    }

    /// Deallocate `pages` 4KiB pages of guest memory at address `base`.
    pub fn free_pages(&self, base: u64, pages: usize) -> Result<(), ()> {
        self.memmap.free_pages(base, pages)
    }

    /// Signals that the OS loader has taken control of the platform: the variable services switch
    /// to their runtime behavior.
    pub fn exit_boot_services(&self) {
        self.variables.store().exit_boot_services();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::authservice::NullVerifier;
    use crate::fvb::{MemoryFlash, MemoryFtw};
    use crate::variable::{VariableConfig, VariableStore};

    /// A guest address space with 63 MiB of memory at 1 MiB
    pub(crate) fn memmap() -> MemoryMap {
        let mm = MemoryMap::new();
        mm.declare_memory_region(&(0x10_0000..0x400_0000)).unwrap();
        mm
    }

    /// A EFI context backed by an empty in-memory variable volume
    pub(crate) fn context(native: Option<Box<dyn NativeDispatch>>) -> EfiContext {
        let store = VariableStore::new(
            VariableConfig::default(),
            Box::new(MemoryFlash::new_variable_volume(0x1000, 8)),
            Box::new(MemoryFtw::new()),
        )
        .unwrap();
        let vars = AuthVariableService::new(store, Box::new(NullVerifier), false).unwrap();
        EfiContext::new(memmap(), vars, native).unwrap()
    }

    #[test]
    fn guid_string_form() {
        const G: Guid = guid!("aaf32c78-947b-439a-a180-2e144ec37792");
        assert_eq!(
            G,
            guid!(
                0xaaf32c78,
                0x947b,
                0x439a,
                [0xa1, 0x80, 0x2e, 0x14, 0x4e, 0xc3, 0x77, 0x92]
            )
        );
        assert_eq!(Guid::from_bytes(&G.to_bytes()), Some(G));
        assert_eq!(G.to_bytes()[0], 0x78);
    }

    #[test]
    fn slice_file_loader() {
        let file = [1u8, 2, 3, 4, 5];
        let mut buf = [0u8; 2];
        file.load_range(&mut buf, 3).unwrap();
        assert_eq!(buf, [4, 5]);
        assert!(file.load_range(&mut buf, 4).is_err());
        assert_eq!(file.get_size(), 5);
    }
}
