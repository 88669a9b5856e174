// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

//! The image services: loading PE/COFF images into guest memory, and the StartImage/Exit/
//! UnloadImage life cycle. `Exit()` does not return to its caller; it produces a
//! [`VmExit::Exit`] that unwinds the VM to the `start_image()` call of the exiting image.

use crate::ebcvm::{ExitRequest, VmExit};
use crate::memmap::{size_to_pages, Placement};
use crate::memorytype::*;
use crate::peloader::*;
use crate::status::Status;
use crate::{new_handle, EfiContext, FileLoader, Handle};

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::RefCell;
use log::{debug, warn};

/// The loaded image information of an image handle
#[derive(Clone, Debug)]
pub struct LoadedImage {
    pub parent: Handle,
    pub system_table: u64,
    pub image_base: u64,
    pub image_size: u64,
    pub code_type: EfiMemoryType,
    pub data_type: EfiMemoryType,
    pub machine: u16,
    pub subsystem: u16,
    /// The address StartImage() calls: the entry point thunk for EBC images
    pub entry_point: u64,
    pub started: bool,

    pages: usize,
    // None for the firmware's own image
    info: Option<ImageInfo>,
}

pub(crate) struct ImageDb {
    images: RefCell<BTreeMap<Handle, LoadedImage>>,
    runtime: RefCell<BTreeMap<Handle, (u64, u64)>>,
    // the started images, innermost last
    current: RefCell<Vec<Handle>>,
    firmware: Handle,
}

impl ImageDb {
    pub(crate) fn new() -> Self {
        let firmware = new_handle();
        let image = LoadedImage {
            parent: 0,
            system_table: 0,
            image_base: 0,
            image_size: 0,
            code_type: EfiMemoryType::EfiBootServicesCode,
            data_type: EfiMemoryType::EfiBootServicesData,
            machine: 0,
            subsystem: EFI_IMAGE_SUBSYSTEM_EFI_BOOT_SERVICE_DRIVER,
            entry_point: 0,
            started: true,
            pages: 0,
            info: None,
        };
        ImageDb {
            images: RefCell::new(BTreeMap::from([(firmware, image)])),
            runtime: RefCell::new(BTreeMap::new()),
            current: RefCell::new(Vec::new()),
            firmware,
        }
    }
}

fn memory_types(subsystem: u16) -> Option<(EfiMemoryType, EfiMemoryType)> {
    use EfiMemoryType::*;
    match subsystem {
        EFI_IMAGE_SUBSYSTEM_EFI_APPLICATION => Some((EfiLoaderCode, EfiLoaderData)),
        EFI_IMAGE_SUBSYSTEM_EFI_BOOT_SERVICE_DRIVER => {
            Some((EfiBootServicesCode, EfiBootServicesData))
        }
        EFI_IMAGE_SUBSYSTEM_EFI_RUNTIME_DRIVER => {
            Some((EfiRuntimeServicesCode, EfiRuntimeServicesData))
        }
        _ => None,
    }
}

impl EfiContext {
    /// The handle representing the firmware itself, which may be used as the parent of images
    /// loaded by the embedder.
    pub fn firmware_handle(&self) -> Handle {
        self.images.firmware
    }

    /// Returns a copy of the loaded image information of `handle`
    pub fn loaded_image(&self, handle: Handle) -> Option<LoadedImage> {
        self.images.images.borrow().get(&handle).cloned()
    }

    /// Returns the handle, base and size of each loaded runtime driver. These are the images
    /// that need to be relocated again when the OS switches to a virtual memory map.
    pub fn runtime_images(&self) -> Vec<(Handle, u64, u64)> {
        self.images
            .runtime
            .borrow()
            .iter()
            .map(|(h, (base, size))| (*h, *base, *size))
            .collect()
    }

    /// Loads the PE/COFF image in `file` into guest memory, on behalf of the image `parent`.
    /// Returns the handle of the new image.
    pub fn load_image(&self, parent: Handle, file: &dyn FileLoader) -> Result<Handle, Status> {
        if !self.images.images.borrow().contains_key(&parent) {
            debug!("LoadImage: parent handle {parent} is not an image handle\n");
            return Err(Status::EFI_INVALID_PARAMETER);
        }

        let info = self.pe_loader.get_image_info(file)?;
        let (code_type, data_type) = memory_types(info.subsystem).ok_or_else(|| {
            debug!("Unsupported image subsystem {}\n", info.subsystem);
            Status::EFI_UNSUPPORTED
        })?;
        let system_table = self.system_table()?;

        let pages = size_to_pages(info.size_of_image as usize);
        let placement = if info.relocations_stripped {
            Placement::Fixed(info.image_base)
        } else if info.section_alignment as usize > EFI_PAGE_SIZE {
            Placement::Aligned(info.section_alignment as u64)
        } else {
            Placement::Anywhere
        };
        let base = self
            .allocate_pages(pages, code_type, placement)
            .ok_or(Status::EFI_OUT_OF_RESOURCES)?;

        let handle = new_handle();
        let entry_point = match self.map_image(handle, file, &info, base) {
            Ok(e) => e,
            Err(e) => {
                self.pe_loader.unload_image(&info).ok();
                if self.free_pages(base, pages).is_err() {
                    warn!("Failed to free image pages at {base:#x}\n");
                }
                return Err(e);
            }
        };
        debug!(
            "Loading image at {base:#x} EntryPoint={:#x}\n",
            base + info.entry_point as u64
        );

        if info.subsystem == EFI_IMAGE_SUBSYSTEM_EFI_RUNTIME_DRIVER {
            self.images
                .runtime
                .borrow_mut()
                .insert(handle, (base, info.size_of_image));
        }
        let image = LoadedImage {
            parent,
            system_table,
            image_base: base,
            image_size: info.size_of_image,
            code_type,
            data_type,
            machine: info.machine,
            subsystem: info.subsystem,
            entry_point,
            started: false,
            pages,
            info: Some(info),
        };
        self.images.images.borrow_mut().insert(handle, image);
        Ok(handle)
    }

    /// Loads and relocates the image at `base`, and returns its entry point
    fn map_image(
        &self,
        handle: Handle,
        file: &dyn FileLoader,
        info: &ImageInfo,
        base: u64,
    ) -> Result<u64, Status> {
        self.pe_loader.load_image(file, info, &self.memmap, base)?;
        self.pe_loader.relocate_image(info, &self.memmap, base)?;

        let entry = base + info.entry_point as u64;
        if info.is_ebc() {
            self.ebc.create_thunk(self, handle, entry, true)
        } else {
            Ok(entry)
        }
    }

    /// Transfers control to the entry point of the image `handle`, and returns its exit status
    /// and exit data once it returns or calls `Exit()`. Applications, and images that exit with
    /// an error, are unloaded afterwards.
    pub fn start_image(&self, handle: Handle) -> (Status, Option<Vec<u16>>) {
        let image = match self.images.images.borrow().get(&handle) {
            Some(i) if !i.started && i.info.is_some() => i.clone(),
            _ => return (Status::EFI_INVALID_PARAMETER, None),
        };
        let ebc = image.machine == IMAGE_FILE_MACHINE_EBC;
        if !ebc && self.native.is_none() {
            debug!("No native dispatcher for machine type {:#x}\n", image.machine);
            return (Status::EFI_UNSUPPORTED, None);
        }

        if let Some(i) = self.images.images.borrow_mut().get_mut(&handle) {
            i.started = true;
        }
        self.images.current.borrow_mut().push(handle);

        let args = [handle as u64, image.system_table];
        let ret = match &self.native {
            Some(native) if !ebc => native.call(image.entry_point, &args).map_err(VmExit::Fault),
            _ => self.ebc.call_thunk(self, image.entry_point, &args),
        };
        self.images.current.borrow_mut().pop();

        let (status, exit_data) = match ret {
            Ok(word) => (Status::from_guest(word, self.ebc.config().natural), None),
            Err(VmExit::Exit(ExitRequest {
                status, exit_data, ..
            })) => (status, exit_data),
            Err(VmExit::Fault(status)) => (status, None),
        };
        if status.is_error() {
            warn!(
                "Image at {:#x} start failed: {status:?}\n",
                image.image_base
            );
        }
        if status.is_error() || image.subsystem == EFI_IMAGE_SUBSYSTEM_EFI_APPLICATION {
            self.unload_and_close(handle);
        }
        (status, exit_data)
    }

    /// Terminates the image `handle`. An image that has not been started yet is unloaded, and
    /// the status to return to the caller is produced. A started image must be the one that is
    /// currently executing, and exiting it produces a [`VmExit::Exit`] which must be propagated
    /// to its `start_image()`.
    pub fn exit(
        &self,
        handle: Handle,
        status: Status,
        exit_data: Option<Vec<u16>>,
    ) -> Result<Status, VmExit> {
        let started = match self.images.images.borrow().get(&handle) {
            Some(i) => i.started,
            None => return Ok(Status::EFI_INVALID_PARAMETER),
        };
        if !started {
            self.unload_and_close(handle);
            return Ok(Status::EFI_SUCCESS);
        }
        if self.images.current.borrow().last() != Some(&handle) {
            debug!("Exit: Image is not exitable image\n");
            return Ok(Status::EFI_INVALID_PARAMETER);
        }
        Err(VmExit::Exit(ExitRequest {
            handle,
            status,
            exit_data,
        }))
    }

    /// Unloads an image that has not been started yet. Started images have no unload hook in
    /// this implementation and cannot be unloaded.
    pub fn unload_image(&self, handle: Handle) -> Result<(), Status> {
        match self.images.images.borrow().get(&handle) {
            Some(i) if i.info.is_none() => return Err(Status::EFI_INVALID_PARAMETER),
            Some(i) if i.started => return Err(Status::EFI_UNSUPPORTED),
            Some(_) => {}
            None => return Err(Status::EFI_INVALID_PARAMETER),
        }
        self.unload_and_close(handle);
        Ok(())
    }

    /// Releases everything held on behalf of the image: its EBC thunks, the loader's state,
    /// its runtime registration and its pages.
    pub(crate) fn unload_and_close(&self, handle: Handle) {
        let Some(image) = self.images.images.borrow_mut().remove(&handle) else {
            return;
        };
        let Some(info) = image.info else {
            return;
        };
        if info.is_ebc() && self.ebc.unload_image(self, handle).is_err() {
            debug!("No EBC thunks to release for image {handle}\n");
        }
        self.pe_loader.unload_image(&info).ok();
        self.images.runtime.borrow_mut().remove(&handle);
        if self.free_pages(image.image_base, image.pages).is_err() {
            warn!("Failed to free image pages at {:#x}\n", image.image_base);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::peloader::tests::pe_image;
    use crate::NativeDispatch;
    use alloc::boxed::Box;
    use alloc::rc::Rc;
    use alloc::vec;
    use core::cell::Cell;

    /// EBC code that returns `status` from the entry point
    pub(crate) fn return_code(status: Status) -> Vec<u8> {
        let mut c = vec![0xF7, 0x37]; // MOVIqq R7, status
        c.extend_from_slice(&status.to_guest(8).to_le_bytes());
        c.extend_from_slice(&[0x04, 0x00]); // RET
        c
    }

    /// EBC code that calls BS->Exit(ImageHandle, status, size, data) with `data` as a NUL
    /// terminated UCS-2 string
    pub(crate) fn exit_code(status: Status, data: &str) -> Vec<u8> {
        let mut c = vec![
            0x60, 0x81, 0x18, 0x00, // MOVqw R1, @R0(+0,+24): system table
            0x60, 0x91, 0x60, 0x00, // MOVqw R1, @R1(+0,+96): boot services
            0x60, 0x91, 0xD8, 0x00, // MOVqw R1, @R1(+0,+216): Exit()
            0x60, 0x82, 0x10, 0x00, // MOVqw R2, @R0(+0,+16): image handle
            0x79, 0x05, 0x2C, 0x00, // MOVRELw R5, 44: exit data at offset 64
            0xF7, 0x34, // MOVIqq R4, status
        ];
        c.extend_from_slice(&status.to_guest(8).to_le_bytes());
        let size = if data.is_empty() { 0 } else { 2 * (data.len() + 1) };
        c.extend_from_slice(&[
            0x77, 0x36, size as u8, 0x00, // MOVIqw R6, size
            0x35, 0x05, 0x35, 0x06, 0x35, 0x04, 0x35, 0x02, // PUSHn R5, R6, R4, R2
            0x03, 0x21, // CALLEX32 R1
            0x00, 0x00, // BREAK 0
        ]);
        c.resize(64, 0);
        for ch in data.encode_utf16().chain([0]) {
            c.extend_from_slice(&ch.to_le_bytes());
        }
        c
    }

    fn ebc(subsystem: u16, code: &[u8]) -> Vec<u8> {
        pe_image(IMAGE_FILE_MACHINE_EBC, subsystem, code)
    }

    const APP: u16 = EFI_IMAGE_SUBSYSTEM_EFI_APPLICATION;
    const DRIVER: u16 = EFI_IMAGE_SUBSYSTEM_EFI_BOOT_SERVICE_DRIVER;
    const RT_DRIVER: u16 = EFI_IMAGE_SUBSYSTEM_EFI_RUNTIME_DRIVER;

    #[test]
    fn application_returns() {
        let efi = crate::tests::context(None);
        let fw = efi.firmware_handle();
        let h = efi
            .load_image(fw, &ebc(APP, &return_code(Status::EFI_WARN_DELETE_FAILURE)))
            .unwrap();
        let image = efi.loaded_image(h).unwrap();
        assert_eq!(image.parent, fw);
        assert_eq!(image.code_type, EfiMemoryType::EfiLoaderCode);
        assert_eq!(image.system_table, efi.system_table().unwrap());
        assert_eq!(efi.ebc.thunk_target(image.entry_point), Some(image.image_base + 0x1000));
        assert!(!image.started);

        assert_eq!(efi.start_image(h), (Status::EFI_WARN_DELETE_FAILURE, None));
        assert!(efi.loaded_image(h).is_none());
        assert_eq!(efi.ebc.thunk_target(image.entry_point), None);
        assert!(efi
            .memmap
            .descriptors()
            .iter()
            .all(|d| d.r#type != EfiMemoryType::EfiLoaderCode));
    }

    #[test]
    fn driver_stays_resident() {
        let efi = crate::tests::context(None);
        let h = efi
            .load_image(efi.firmware_handle(), &ebc(DRIVER, &return_code(Status::EFI_SUCCESS)))
            .unwrap();
        assert_eq!(efi.start_image(h), (Status::EFI_SUCCESS, None));
        assert!(efi.loaded_image(h).unwrap().started);
        assert_eq!(efi.start_image(h).0, Status::EFI_INVALID_PARAMETER);
        assert_eq!(efi.unload_image(h), Err(Status::EFI_UNSUPPORTED));

        // not the current image
        assert_eq!(efi.exit(h, Status::EFI_SUCCESS, None), Ok(Status::EFI_INVALID_PARAMETER));
        assert_eq!(efi.exit(0xdead, Status::EFI_SUCCESS, None), Ok(Status::EFI_INVALID_PARAMETER));
        assert_eq!(
            efi.unload_image(efi.firmware_handle()),
            Err(Status::EFI_INVALID_PARAMETER)
        );
    }

    #[test]
    fn driver_failure_unloads() {
        let efi = crate::tests::context(None);
        let h = efi
            .load_image(efi.firmware_handle(), &ebc(DRIVER, &return_code(Status::EFI_NOT_FOUND)))
            .unwrap();
        assert_eq!(efi.start_image(h), (Status::EFI_NOT_FOUND, None));
        assert!(efi.loaded_image(h).is_none());
    }

    #[test]
    fn exit_unwinds_to_start_image() {
        let efi = crate::tests::context(None);
        let code = exit_code(Status::EFI_ABORTED, "Bye");
        let h = efi.load_image(efi.firmware_handle(), &ebc(DRIVER, &code)).unwrap();
        let (status, data) = efi.start_image(h);
        assert_eq!(status, Status::EFI_ABORTED);
        assert_eq!(data, Some("Bye\0".encode_utf16().collect()));
        assert!(efi.loaded_image(h).is_none());

        let code = exit_code(Status::EFI_SUCCESS, "");
        let h = efi.load_image(efi.firmware_handle(), &ebc(DRIVER, &code)).unwrap();
        assert_eq!(efi.start_image(h), (Status::EFI_SUCCESS, None));
        assert!(efi.loaded_image(h).is_some());
    }

    #[test]
    fn exit_before_start_unloads() {
        let efi = crate::tests::context(None);
        let h = efi
            .load_image(efi.firmware_handle(), &ebc(RT_DRIVER, &return_code(Status::EFI_SUCCESS)))
            .unwrap();
        let image = efi.loaded_image(h).unwrap();
        assert_eq!(image.code_type, EfiMemoryType::EfiRuntimeServicesCode);
        assert_eq!(efi.runtime_images(), [(h, image.image_base, 0x3000)]);

        assert_eq!(efi.exit(h, Status::EFI_SUCCESS, None), Ok(Status::EFI_SUCCESS));
        assert!(efi.loaded_image(h).is_none());
        assert!(efi.runtime_images().is_empty());
        assert_eq!(efi.start_image(h).0, Status::EFI_INVALID_PARAMETER);
    }

    #[test]
    fn load_failures() {
        let efi = crate::tests::context(None);
        let good = ebc(APP, &return_code(Status::EFI_SUCCESS));
        assert_eq!(efi.load_image(0xdead, &good), Err(Status::EFI_INVALID_PARAMETER));

        let bad = ebc(0x42, &[]);
        assert_eq!(
            efi.load_image(efi.firmware_handle(), &bad),
            Err(Status::EFI_UNSUPPORTED)
        );

        // an unsupported relocation type fails after the pages have been allocated
        let mut bad = good;
        bad[0x40a..0x40c].copy_from_slice(&0x5000u16.to_le_bytes());
        assert_eq!(
            efi.load_image(efi.firmware_handle(), &bad),
            Err(Status::EFI_UNSUPPORTED)
        );
        assert!(efi
            .memmap
            .descriptors()
            .iter()
            .all(|d| d.r#type != EfiMemoryType::EfiLoaderCode));
    }

    struct Entry(Rc<Cell<Option<(u64, u64, u64)>>>);

    impl NativeDispatch for Entry {
        fn call(&self, target: u64, args: &[u64]) -> Result<u64, Status> {
            self.0.set(Some((target, args[0], args[1])));
            Ok(Status::EFI_SUCCESS.to_guest(8))
        }
    }

    #[test]
    fn native_images() {
        let image = pe_image(IMAGE_FILE_MACHINE_X64, APP, &[0xc3]);

        let efi = crate::tests::context(None);
        let h = efi.load_image(efi.firmware_handle(), &image).unwrap();
        assert_eq!(efi.start_image(h).0, Status::EFI_UNSUPPORTED);
        assert!(!efi.loaded_image(h).unwrap().started);

        let called = Rc::new(Cell::new(None));
        let efi = crate::tests::context(Some(Box::new(Entry(called.clone()))));
        let h = efi.load_image(efi.firmware_handle(), &image).unwrap();
        let li = efi.loaded_image(h).unwrap();
        assert_eq!(li.entry_point, li.image_base + 0x1000);
        assert_eq!(efi.start_image(h), (Status::EFI_SUCCESS, None));
        assert_eq!(
            called.get(),
            Some((li.entry_point, h as u64, efi.system_table().unwrap()))
        );
    }
}
