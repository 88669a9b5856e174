// SPDX-License-Identifier: GPL-2.0
// Copyright 2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

use crate::memmap::{MemoryBus, MemoryFault};
use crate::status::Status;
use crate::FileLoader;

use alloc::vec;
use alloc::vec::Vec;
use log::{debug, trace};

pub const IMAGE_FILE_MACHINE_X64: u16 = 0x8664;
pub const IMAGE_FILE_MACHINE_ARM64: u16 = 0xaa64;
pub const IMAGE_FILE_MACHINE_EBC: u16 = 0x0ebc;

pub const EFI_IMAGE_SUBSYSTEM_EFI_APPLICATION: u16 = 10;
pub const EFI_IMAGE_SUBSYSTEM_EFI_BOOT_SERVICE_DRIVER: u16 = 11;
pub const EFI_IMAGE_SUBSYSTEM_EFI_RUNTIME_DRIVER: u16 = 12;

const IMAGE_FILE_RELOCS_STRIPPED: u16 = 0x1;

const PE32_MAGIC: u16 = 0x10b;
const PE32PLUS_MAGIC: u16 = 0x20b;

const DOS_HEADER_SIZE: usize = 64;
const COFF_HEADER_SIZE: usize = 24;
const SECTION_HEADER_SIZE: usize = 40;

const BASE_RELOC_TABLE_IDX: usize = 5;

const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
const IMAGE_REL_BASED_DIR64: u16 = 10;

/// A section of a PE/COFF image, as described by its section header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageSection {
    pub name: [u8; 8],
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub raw_offset: u32,
    pub raw_size: u32,
}

impl ImageSection {
    /// The number of bytes that are copied from the file into the image
    fn load_size(&self) -> u32 {
        match self.virtual_size {
            0 => self.raw_size,
            vs => vs.min(self.raw_size),
        }
    }
}

/// The properties of a PE/COFF image that are needed to load and relocate it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    pub machine: u16,
    pub subsystem: u16,
    /// The preferred load address
    pub image_base: u64,
    pub size_of_image: u64,
    pub size_of_headers: u32,
    pub section_alignment: u32,
    /// The RVA of the entry point
    pub entry_point: u32,
    pub relocations_stripped: bool,
    pub sections: Vec<ImageSection>,
    /// RVA and size of the base relocation table
    pub reloc_dir: Option<(u32, u32)>,
}

impl ImageInfo {
    pub fn is_ebc(&self) -> bool {
        self.machine == IMAGE_FILE_MACHINE_EBC
    }
}

/// The PE/COFF loader used by the image services. Images are loaded from a [`FileLoader`] into
/// guest memory.
pub trait PeCoffLoader {
    /// Parses and validates the headers of the image in `file`
    fn get_image_info(&self, file: &dyn FileLoader) -> Result<ImageInfo, Status>;

    /// Copies the headers and sections of the image to guest memory at `dest`, which must cover
    /// `info.size_of_image` bytes.
    fn load_image(
        &self,
        file: &dyn FileLoader,
        info: &ImageInfo,
        bus: &dyn MemoryBus,
        dest: u64,
    ) -> Result<(), Status>;

    /// Applies the base relocations of the image loaded at `dest`
    fn relocate_image(&self, info: &ImageInfo, bus: &dyn MemoryBus, dest: u64)
        -> Result<(), Status>;

    /// Releases any resources the loader holds for the image
    fn unload_image(&self, _info: &ImageInfo) -> Result<(), Status> {
        Ok(())
    }
}

/// A PE32/PE32+ loader supporting the x64, AArch64 and EBC machine types
pub struct PeLoader;

fn load_error(e: MemoryFault) -> Status {
    debug!("Image access outside of guest memory at {:#x}\n", e.address);
    Status::EFI_LOAD_ERROR
}

fn read(file: &dyn FileLoader, offset: usize, len: usize) -> Result<Vec<u8>, Status> {
    let mut v = vec![0u8; len];
    file.load_range(&mut v, offset).map_err(|e| {
        debug!("Failed to read image: {e}\n");
        Status::EFI_LOAD_ERROR
    })?;
    Ok(v)
}

fn field<const N: usize>(b: &[u8], offset: usize) -> Result<[u8; N], Status> {
    b.get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(Status::EFI_LOAD_ERROR)
}

fn u16_at(b: &[u8], offset: usize) -> Result<u16, Status> {
    field(b, offset).map(u16::from_le_bytes)
}

fn u32_at(b: &[u8], offset: usize) -> Result<u32, Status> {
    field(b, offset).map(u32::from_le_bytes)
}

fn u64_at(b: &[u8], offset: usize) -> Result<u64, Status> {
    field(b, offset).map(u64::from_le_bytes)
}

/// Copies `len` bytes at `offset` in `file` to guest memory at `dest`
fn copy_to_guest(
    file: &dyn FileLoader,
    offset: usize,
    len: usize,
    bus: &dyn MemoryBus,
    dest: u64,
) -> Result<(), Status> {
    const CHUNK: usize = 0x1000;
    let mut done = 0;
    while done < len {
        let n = (len - done).min(CHUNK);
        let b = read(file, offset + done, n)?;
        bus.store(dest + done as u64, &b).map_err(load_error)?;
        done += n;
    }
    Ok(())
}

impl PeCoffLoader for PeLoader {
    fn get_image_info(&self, file: &dyn FileLoader) -> Result<ImageInfo, Status> {
        let size = file.get_size();
        let dos = read(file, 0, DOS_HEADER_SIZE.min(size))?;
        if dos.get(..2) != Some(&b"MZ"[..]) {
            debug!("Invalid DOS magic\n");
            return Err(Status::EFI_LOAD_ERROR);
        }
        let pe_offset = u32_at(&dos, 0x3c)? as usize;
        if pe_offset < DOS_HEADER_SIZE || pe_offset + COFF_HEADER_SIZE > size {
            debug!("Invalid PE header offset {pe_offset:#x}\n");
            return Err(Status::EFI_LOAD_ERROR);
        }

        let coff = read(file, pe_offset, COFF_HEADER_SIZE)?;
        if coff[..4] != *b"PE\0\0" {
            debug!("Invalid PE magic {:x?}\n", &coff[..4]);
            return Err(Status::EFI_LOAD_ERROR);
        }
        let machine = u16_at(&coff, 4)?;
        match machine {
            IMAGE_FILE_MACHINE_X64 | IMAGE_FILE_MACHINE_ARM64 | IMAGE_FILE_MACHINE_EBC => {}
            _ => {
                debug!("Unsupported machine type {machine:#x}\n");
                return Err(Status::EFI_UNSUPPORTED);
            }
        }
        let section_count = u16_at(&coff, 6)? as usize;
        let opt_size = u16_at(&coff, 20)? as usize;
        let characteristics = u16_at(&coff, 22)?;

        let opt_offset = pe_offset + COFF_HEADER_SIZE;
        if opt_offset + opt_size > size {
            debug!("Optional header runs past the end of the image\n");
            return Err(Status::EFI_LOAD_ERROR);
        }
        let opt = read(file, opt_offset, opt_size)?;
        let (image_base, dir_count, dirs) = match u16_at(&opt, 0)? {
            PE32_MAGIC => (u32_at(&opt, 28)? as u64, u32_at(&opt, 92)?, 96),
            PE32PLUS_MAGIC => (u64_at(&opt, 24)?, u32_at(&opt, 108)?, 112),
            magic => {
                debug!("Unsupported optional header magic {magic:#x}\n");
                return Err(Status::EFI_UNSUPPORTED);
            }
        };
        let entry_point = u32_at(&opt, 16)?;
        let section_alignment = u32_at(&opt, 32)?;
        let file_alignment = u32_at(&opt, 36)?;
        let size_of_image = u32_at(&opt, 56)?;
        let size_of_headers = u32_at(&opt, 60)?;
        let subsystem = u16_at(&opt, 68)?;

        if !section_alignment.is_power_of_two() || !file_alignment.is_power_of_two() {
            debug!("Invalid alignment {section_alignment:#x}/{file_alignment:#x}\n");
            return Err(Status::EFI_LOAD_ERROR);
        }
        if entry_point >= size_of_image || size_of_headers > size_of_image {
            debug!("Entry point or headers outside of image\n");
            return Err(Status::EFI_LOAD_ERROR);
        }

        let reloc_dir = if dir_count as usize > BASE_RELOC_TABLE_IDX {
            let at = dirs + 8 * BASE_RELOC_TABLE_IDX;
            Some((u32_at(&opt, at)?, u32_at(&opt, at + 4)?)).filter(|&(_, size)| size != 0)
        } else {
            None
        };
        if let Some((rva, len)) = reloc_dir {
            if rva as u64 + len as u64 > size_of_image as u64 {
                debug!("Relocation table exceeds image size\n");
                return Err(Status::EFI_LOAD_ERROR);
            }
        }

        let section_offset = opt_offset + opt_size;
        let sections_size = SECTION_HEADER_SIZE * section_count;
        if section_offset + sections_size > size {
            debug!("Section array runs past the end of the image\n");
            return Err(Status::EFI_LOAD_ERROR);
        }
        let headers = read(file, section_offset, sections_size)?;
        let sections = headers
            .chunks_exact(SECTION_HEADER_SIZE)
            .map(|h| {
                Ok(ImageSection {
                    name: field(h, 0)?,
                    virtual_size: u32_at(h, 8)?,
                    virtual_address: u32_at(h, 12)?,
                    raw_size: u32_at(h, 16)?,
                    raw_offset: u32_at(h, 20)?,
                })
            })
            .collect::<Result<Vec<_>, Status>>()?;
        trace!("Section headers: {sections:x?}\n");

        for s in sections.iter() {
            let name = core::str::from_utf8(&s.name).unwrap_or("?");
            if s.virtual_address & (section_alignment - 1) != 0 {
                debug!("Section {name} violates section alignment {section_alignment:#x}\n");
                return Err(Status::EFI_LOAD_ERROR);
            }
            let end = s.virtual_address as u64 + s.virtual_size.max(s.load_size()) as u64;
            if end > size_of_image as u64 {
                debug!("Section {name} exceeds image size {size_of_image:#x}\n");
                return Err(Status::EFI_LOAD_ERROR);
            }
            if s.raw_offset as usize + s.load_size() as usize > size {
                debug!("Section {name} runs past the end of the file\n");
                return Err(Status::EFI_LOAD_ERROR);
            }
        }

        Ok(ImageInfo {
            machine,
            subsystem,
            image_base,
            size_of_image: size_of_image as u64,
            size_of_headers,
            section_alignment,
            entry_point,
            relocations_stripped: characteristics & IMAGE_FILE_RELOCS_STRIPPED != 0,
            sections,
            reloc_dir,
        })
    }

    fn load_image(
        &self,
        file: &dyn FileLoader,
        info: &ImageInfo,
        bus: &dyn MemoryBus,
        dest: u64,
    ) -> Result<(), Status> {
        bus.store(dest, &vec![0u8; info.size_of_image as usize])
            .map_err(load_error)?;

        // Load the PE header too, as some programs rely on it
        let hdr = (info.size_of_headers as usize).min(file.get_size());
        copy_to_guest(file, 0, hdr, bus, dest)?;

        for s in info.sections.iter() {
            copy_to_guest(
                file,
                s.raw_offset as usize,
                s.load_size() as usize,
                bus,
                dest + s.virtual_address as u64,
            )?;
        }
        Ok(())
    }

    fn relocate_image(
        &self,
        info: &ImageInfo,
        bus: &dyn MemoryBus,
        dest: u64,
    ) -> Result<(), Status> {
        let delta = dest.wrapping_sub(info.image_base);
        if delta == 0 {
            return Ok(());
        }
        let Some((rva, size)) = info.reloc_dir else {
            if info.relocations_stripped {
                debug!("Image cannot be loaded at {dest:#x}: relocations stripped\n");
                return Err(Status::EFI_LOAD_ERROR);
            }
            return Ok(());
        };
        trace!("Applying PE relocations, delta {delta:#x}\n");

        let mut reloc = rva as u64;
        let end = reloc + size as u64;
        while reloc + 8 <= end {
            let block_rva = bus.load_u32(dest + reloc).map_err(load_error)? as u64;
            let block_size = bus.load_u32(dest + reloc + 4).map_err(load_error)? as u64;
            if block_size < 8 || reloc + block_size > end {
                debug!("Corrupt relocation block at RVA {reloc:#x}\n");
                return Err(Status::EFI_LOAD_ERROR);
            }
            for e in (reloc + 8..reloc + block_size).step_by(2) {
                let entry = bus.load_u16(dest + e).map_err(load_error)?;
                let at = block_rva + (entry & 0xfff) as u64;
                let width = match entry >> 12 {
                    IMAGE_REL_BASED_ABSOLUTE => continue,
                    IMAGE_REL_BASED_HIGHLOW => 4,
                    IMAGE_REL_BASED_DIR64 => 8,
                    t => {
                        debug!("Unsupported relocation type {t}\n");
                        return Err(Status::EFI_UNSUPPORTED);
                    }
                };
                if at + width > info.size_of_image {
                    return Err(Status::EFI_LOAD_ERROR);
                }
                let p = dest + at;
                if width == 4 {
                    let v = bus.load_u32(p).map_err(load_error)?;
                    bus.store_u32(p, v.wrapping_add(delta as u32))
                        .map_err(load_error)?;
                } else {
                    let v = bus.load_u64(p).map_err(load_error)?;
                    bus.store_u64(p, v.wrapping_add(delta)).map_err(load_error)?;
                }
            }
            reloc += block_size;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memmap::Placement;
    use crate::memorytype::EfiMemoryType;

    pub(crate) const TEST_IMAGE_BASE: u64 = 0x4000_0000;

    /// Builds a PE32+ image with `code` at RVA 0x1000, which is also the entry point. The
    /// quadword at RVA 0x1100 holds the preferred address of RVA 0x1180 and is covered by a DIR64
    /// relocation.
    pub(crate) fn pe_image(machine: u16, subsystem: u16, code: &[u8]) -> Vec<u8> {
        assert!(code.len() <= 0x100);
        let mut f = vec![0u8; 0x600];
        f[..2].copy_from_slice(b"MZ");
        f[0x3c..0x40].copy_from_slice(&0x40u32.to_le_bytes());

        let put16 = |f: &mut Vec<u8>, o: usize, v: u16| f[o..o + 2].copy_from_slice(&v.to_le_bytes());
        let put32 = |f: &mut Vec<u8>, o: usize, v: u32| f[o..o + 4].copy_from_slice(&v.to_le_bytes());

        f[0x40..0x44].copy_from_slice(b"PE\0\0");
        put16(&mut f, 0x44, machine);
        put16(&mut f, 0x46, 2);
        put16(&mut f, 0x54, 240);
        put16(&mut f, 0x56, 0x22);

        let opt = 0x58;
        put16(&mut f, opt, PE32PLUS_MAGIC);
        put32(&mut f, opt + 16, 0x1000);
        f[opt + 24..opt + 32].copy_from_slice(&TEST_IMAGE_BASE.to_le_bytes());
        put32(&mut f, opt + 32, 0x1000);
        put32(&mut f, opt + 36, 0x200);
        put32(&mut f, opt + 56, 0x3000);
        put32(&mut f, opt + 60, 0x200);
        put16(&mut f, opt + 68, subsystem);
        put32(&mut f, opt + 108, 16);
        put32(&mut f, opt + 112 + 40, 0x2000);
        put32(&mut f, opt + 112 + 44, 12);

        let sec = opt + 240;
        for (i, (name, rva, raw)) in [(b".text\0\0\0", 0x1000, 0x200), (b".reloc\0\0", 0x2000, 0x400)]
            .iter()
            .enumerate()
        {
            let h = sec + i * SECTION_HEADER_SIZE;
            f[h..h + 8].copy_from_slice(*name);
            put32(&mut f, h + 8, 0x200);
            put32(&mut f, h + 12, *rva);
            put32(&mut f, h + 16, 0x200);
            put32(&mut f, h + 20, *raw);
        }

        f[0x200..0x200 + code.len()].copy_from_slice(code);
        f[0x300..0x308].copy_from_slice(&(TEST_IMAGE_BASE + 0x1180).to_le_bytes());

        put32(&mut f, 0x400, 0x1000);
        put32(&mut f, 0x404, 12);
        put16(&mut f, 0x408, (IMAGE_REL_BASED_DIR64 << 12) | 0x100);
        put16(&mut f, 0x40a, IMAGE_REL_BASED_ABSOLUTE);
        f
    }

    #[test]
    fn image_info() {
        let f = pe_image(IMAGE_FILE_MACHINE_EBC, EFI_IMAGE_SUBSYSTEM_EFI_APPLICATION, &[4, 0]);
        let info = PeLoader.get_image_info(&f).unwrap();
        assert!(info.is_ebc());
        assert_eq!(info.subsystem, EFI_IMAGE_SUBSYSTEM_EFI_APPLICATION);
        assert_eq!(info.image_base, TEST_IMAGE_BASE);
        assert_eq!(info.size_of_image, 0x3000);
        assert_eq!(info.entry_point, 0x1000);
        assert_eq!(info.sections.len(), 2);
        assert_eq!(&info.sections[1].name[..6], b".reloc");
        assert_eq!(info.reloc_dir, Some((0x2000, 12)));
        assert!(!info.relocations_stripped);
    }

    #[test]
    fn load_and_relocate() {
        let mm = crate::tests::memmap();
        let code = [0x77, 0x37, 0x2a, 0x00, 0x04, 0x00];
        let f = pe_image(IMAGE_FILE_MACHINE_X64, EFI_IMAGE_SUBSYSTEM_EFI_BOOT_SERVICE_DRIVER, &code);
        let info = PeLoader.get_image_info(&f).unwrap();
        let dest = mm
            .allocate_pages(3, EfiMemoryType::EfiBootServicesCode, Placement::Anywhere)
            .unwrap();
        PeLoader.load_image(&f, &info, &mm, dest).unwrap();
        PeLoader.relocate_image(&info, &mm, dest).unwrap();

        let mut b = [0u8; 6];
        mm.load(dest + 0x1000, &mut b).unwrap();
        assert_eq!(b, code);
        assert_eq!(mm.load_u16(dest).unwrap(), u16::from_le_bytes(*b"MZ"));
        assert_eq!(mm.load_u64(dest + 0x1100).unwrap(), dest + 0x1180);

        // a second pass relocates relative to the preferred base again
        PeLoader.relocate_image(&info, &mm, dest).unwrap();
        assert_eq!(
            mm.load_u64(dest + 0x1100).unwrap(),
            (2 * dest + 0x1180).wrapping_sub(TEST_IMAGE_BASE)
        );
    }

    #[test]
    fn invalid_images() {
        let good = pe_image(IMAGE_FILE_MACHINE_ARM64, 10, &[]);
        assert!(PeLoader.get_image_info(&good).is_ok());

        let mut f = good.clone();
        f[0] = b'X';
        assert_eq!(PeLoader.get_image_info(&f), Err(Status::EFI_LOAD_ERROR));

        let mut f = good.clone();
        f[0x44..0x46].copy_from_slice(&0x14cu16.to_le_bytes());
        assert_eq!(PeLoader.get_image_info(&f), Err(Status::EFI_UNSUPPORTED));

        assert_eq!(
            PeLoader.get_image_info(&good[..0x300].to_vec()),
            Err(Status::EFI_LOAD_ERROR)
        );

        // misaligned section
        let mut f = good.clone();
        f[0x148 + 12..0x148 + 16].copy_from_slice(&0x1010u32.to_le_bytes());
        assert_eq!(PeLoader.get_image_info(&f), Err(Status::EFI_LOAD_ERROR));

        // unsupported relocation type
        let mm = crate::tests::memmap();
        let mut f = good;
        f[0x40a..0x40c].copy_from_slice(&0x5000u16.to_le_bytes());
        let info = PeLoader.get_image_info(&f).unwrap();
        let dest = mm
            .allocate_pages(3, EfiMemoryType::EfiLoaderCode, Placement::Anywhere)
            .unwrap();
        PeLoader.load_image(&f, &info, &mm, dest).unwrap();
        assert_eq!(
            PeLoader.relocate_image(&info, &mm, dest),
            Err(Status::EFI_UNSUPPORTED)
        );
    }
}
