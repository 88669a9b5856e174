// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

//! Flash access for the non-volatile variable store.
//!
//! The variable store is kept in a firmware volume on flash, accessed through an implementation
//! of [`FirmwareVolumeBlock`]. Rewriting the store as a whole (which requires erasing blocks) is
//! done through an implementation of [`FaultTolerantWrite`], which either completes such a write
//! or rolls it back, even in the presence of power failures.
//!
//! In-memory implementations of both are provided, which can be used for emulation and testing.

use crate::status::*;
use crate::varformat::{FirmwareVolumeHeader, VariableStoreHeader};
use crate::Lba;

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

/// A firmware volume on a block based flash device, with NOR write semantics: writes can only
/// clear bits, and only erasing a block sets them again.
pub trait FirmwareVolumeBlock {
    /// Returns the size of block `lba` and the number of consecutive blocks of that size
    /// starting at `lba`.
    fn get_block_size(&self, lba: Lba) -> Result<(usize, usize), Status>;

    /// Reads `buf.len()` bytes at `offset` into block `lba`. The read may not cross into the next
    /// block.
    fn read(&self, lba: Lba, offset: usize, buf: &mut [u8]) -> Result<(), Status>;

    /// Programs `data` at `offset` into block `lba`. The write may not cross into the next block.
    fn write(&self, lba: Lba, offset: usize, data: &[u8]) -> Result<(), Status>;

    /// Erases `count` blocks starting at `lba`.
    fn erase_blocks(&self, lba: Lba, count: usize) -> Result<(), Status>;
}

/// Fault tolerant write: `data` is written at `offset` into block `lba` of `fvb`, and may span
/// multiple blocks. After a power failure, an interrupted write is either completed or rolled
/// back by [`complete_pending`](Self::complete_pending).
pub trait FaultTolerantWrite {
    fn write(
        &self,
        fvb: &dyn FirmwareVolumeBlock,
        lba: Lba,
        offset: usize,
        data: &[u8],
    ) -> Result<(), Status>;

    /// Completes any write that was interrupted. Called before the variable store is parsed.
    fn complete_pending(&self, _fvb: &dyn FirmwareVolumeBlock) -> Result<(), Status> {
        Ok(())
    }
}

struct FlashState {
    bytes: Vec<u8>,
    block_size: usize,
    // number of program/erase operations that may still succeed
    budget: Option<usize>,
    writes: usize,
    erases: usize,
}

/// A RAM backed flash device. Clones refer to the same device, so that a test can keep a handle
/// to a device owned by the variable store.
#[derive(Clone)]
pub struct MemoryFlash {
    state: Rc<RefCell<FlashState>>,
}

impl MemoryFlash {
    /// Creates a device holding `image`, which must be a whole number of blocks.
    pub fn from_image(image: Vec<u8>, block_size: usize) -> Result<Self, Status> {
        if block_size == 0 || image.len() % block_size != 0 {
            return Err(Status::EFI_INVALID_PARAMETER);
        }
        Ok(MemoryFlash {
            state: Rc::new(RefCell::new(FlashState {
                bytes: image,
                block_size,
                budget: None,
                writes: 0,
                erases: 0,
            })),
        })
    }

    /// An erased device with only the firmware volume header in place. The variable store
    /// behind it is raw, and gets formatted on first use.
    pub fn new_blank_volume(block_size: usize, num_blocks: usize) -> Self {
        let fvh = FirmwareVolumeHeader::new(block_size as u32, num_blocks as u32).to_bytes();
        let mut image = alloc::vec![0xffu8; block_size * num_blocks];
        image[..fvh.len()].copy_from_slice(&fvh);
        MemoryFlash {
            state: Rc::new(RefCell::new(FlashState {
                bytes: image,
                block_size,
                budget: None,
                writes: 0,
                erases: 0,
            })),
        }
    }

    /// A device holding a firmware volume with an empty, formatted variable store that covers
    /// the remainder of the volume.
    pub fn new_variable_volume(block_size: usize, num_blocks: usize) -> Self {
        let flash = Self::new_blank_volume(block_size, num_blocks);
        {
            let mut s = flash.state.borrow_mut();
            let fvh_len = FirmwareVolumeHeader::new(block_size as u32, num_blocks as u32)
                .header_length as usize;
            let size = (s.bytes.len() - fvh_len) as u32;
            let hdr = VariableStoreHeader::new(size).to_bytes();
            s.bytes[fvh_len..fvh_len + hdr.len()].copy_from_slice(&hdr);
        }
        flash
    }

    /// A copy of the current flash contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.borrow().bytes.clone()
    }

    /// Emulates a power failure after `ops` more program or erase operations: every operation
    /// after that fails with EFI_DEVICE_ERROR without touching the flash. `None` restores
    /// power.
    pub fn fail_after(&self, ops: Option<usize>) {
        self.state.borrow_mut().budget = ops;
    }

    /// The number of program and erase operations performed so far
    pub fn op_counts(&self) -> (usize, usize) {
        let s = self.state.borrow();
        (s.writes, s.erases)
    }

    fn range(s: &FlashState, lba: Lba, offset: usize, len: usize) -> Result<usize, Status> {
        let start = (lba as usize)
            .checked_mul(s.block_size)
            .and_then(|b| b.checked_add(offset))
            .ok_or(Status::EFI_INVALID_PARAMETER)?;
        if offset + len > s.block_size || start + len > s.bytes.len() {
            return Err(Status::EFI_BAD_BUFFER_SIZE);
        }
        Ok(start)
    }

    fn consume(s: &mut FlashState) -> Result<(), Status> {
        match s.budget {
            Some(0) => Err(Status::EFI_DEVICE_ERROR),
            Some(n) => {
                s.budget = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl FirmwareVolumeBlock for MemoryFlash {
    fn get_block_size(&self, lba: Lba) -> Result<(usize, usize), Status> {
        let s = self.state.borrow();
        let blocks = s.bytes.len() / s.block_size;
        if lba as usize >= blocks {
            return Err(Status::EFI_INVALID_PARAMETER);
        }
        Ok((s.block_size, blocks - lba as usize))
    }

    fn read(&self, lba: Lba, offset: usize, buf: &mut [u8]) -> Result<(), Status> {
        let s = self.state.borrow();
        let start = Self::range(&s, lba, offset, buf.len())?;
        buf.copy_from_slice(&s.bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, lba: Lba, offset: usize, data: &[u8]) -> Result<(), Status> {
        let mut s = self.state.borrow_mut();
        let start = Self::range(&s, lba, offset, data.len())?;
        Self::consume(&mut s)?;
        s.writes += 1;
        for (b, d) in s.bytes[start..start + data.len()].iter_mut().zip(data) {
            *b &= *d;
        }
        Ok(())
    }

    fn erase_blocks(&self, lba: Lba, count: usize) -> Result<(), Status> {
        let mut s = self.state.borrow_mut();
        let bs = s.block_size;
        let start = Self::range(&s, lba, 0, 0)?;
        let end = start + count * bs;
        if end > s.bytes.len() {
            return Err(Status::EFI_INVALID_PARAMETER);
        }
        for i in 0..count {
            Self::consume(&mut s)?;
            s.erases += 1;
            s.bytes[start + i * bs..start + (i + 1) * bs].fill(0xff);
        }
        Ok(())
    }
}

/// Full contents of the blocks touched by a write, staged before any of them is erased
struct PendingWrite {
    lba: Lba,
    blocks: Vec<Vec<u8>>,
}

/// A fault tolerant write implementation that keeps its spare copy in RAM. Clones share the
/// same spare area, which plays the part of the spare block that survives a reset.
#[derive(Clone, Default)]
pub struct MemoryFtw {
    spare: Rc<RefCell<Option<PendingWrite>>>,
    completed: Rc<Cell<usize>>,
}

impl MemoryFtw {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a write was interrupted and is awaiting completion
    pub fn has_pending(&self) -> bool {
        self.spare.borrow().is_some()
    }

    /// The number of writes that ran to completion
    pub fn completed_writes(&self) -> usize {
        self.completed.get()
    }

    fn stage(
        fvb: &dyn FirmwareVolumeBlock,
        mut lba: Lba,
        mut offset: usize,
        mut data: &[u8],
    ) -> Result<PendingWrite, Status> {
        loop {
            let (bs, _) = fvb.get_block_size(lba)?;
            if offset < bs {
                break;
            }
            offset -= bs;
            lba += 1;
        }
        let first = lba;
        let mut blocks = Vec::new();
        while !data.is_empty() {
            let (bs, _) = fvb.get_block_size(lba)?;
            let n = data.len().min(bs - offset);
            let mut block = alloc::vec![0u8; bs];
            fvb.read(lba, 0, &mut block)?;
            block[offset..offset + n].copy_from_slice(&data[..n]);
            blocks.push(block);
            data = &data[n..];
            offset = 0;
            lba += 1;
        }
        Ok(PendingWrite { lba: first, blocks })
    }

    fn apply(fvb: &dyn FirmwareVolumeBlock, w: &PendingWrite) -> Result<(), Status> {
        for (lba, block) in (w.lba..).zip(&w.blocks) {
            fvb.erase_blocks(lba, 1)?;
            fvb.write(lba, 0, block)?;
        }
        Ok(())
    }
}

impl FaultTolerantWrite for MemoryFtw {
    fn write(
        &self,
        fvb: &dyn FirmwareVolumeBlock,
        lba: Lba,
        offset: usize,
        data: &[u8],
    ) -> Result<(), Status> {
        if self.has_pending() {
            return Err(Status::EFI_NOT_READY);
        }
        let w = Self::stage(fvb, lba, offset, data)?;
        *self.spare.borrow_mut() = Some(w);
        self.complete_pending(fvb)
    }

    fn complete_pending(&self, fvb: &dyn FirmwareVolumeBlock) -> Result<(), Status> {
        let Some(w) = self.spare.borrow_mut().take() else {
            return Ok(());
        };
        if let Err(e) = Self::apply(fvb, &w) {
            log::warn!("Fault tolerant write to LBA {} interrupted: {:?}\n", w.lba, e);
            *self.spare.borrow_mut() = Some(w);
            return Err(e);
        }
        self.completed.set(self.completed.get() + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nor_semantics() {
        let f = MemoryFlash::from_image(alloc::vec![0xff; 0x400], 0x100).unwrap();
        f.write(1, 0x10, &[0xf0, 0x0f]).unwrap();
        f.write(1, 0x10, &[0x3c, 0xff]).unwrap();
        let mut b = [0u8; 2];
        f.read(1, 0x10, &mut b).unwrap();
        assert_eq!(b, [0x30, 0x0f]);

        assert_eq!(f.write(1, 0xff, &[0, 0]), Err(Status::EFI_BAD_BUFFER_SIZE));
        assert_eq!(f.get_block_size(1), Ok((0x100, 3)));

        f.erase_blocks(1, 1).unwrap();
        f.read(1, 0x10, &mut b).unwrap();
        assert_eq!(b, [0xff, 0xff]);
    }

    #[test]
    fn power_failure() {
        let f = MemoryFlash::from_image(alloc::vec![0xff; 0x200], 0x100).unwrap();
        f.fail_after(Some(1));
        f.write(0, 0, &[0]).unwrap();
        assert_eq!(f.write(0, 1, &[0]), Err(Status::EFI_DEVICE_ERROR));
        assert_eq!(&f.snapshot()[..2], &[0, 0xff]);
    }

    #[test]
    fn variable_volume() {
        let f = MemoryFlash::new_variable_volume(0x1000, 4);
        let image = f.snapshot();
        let fvh = FirmwareVolumeHeader::parse(&image).unwrap();
        assert_eq!(fvh.fv_length, 0x4000);
        let hdr = VariableStoreHeader::parse(&image[fvh.header_length as usize..]).unwrap();
        assert_eq!(hdr.size as usize, 0x4000 - 72);
    }

    #[test]
    fn ftw_spans_blocks_and_recovers() {
        let f = MemoryFlash::from_image(alloc::vec![0x00; 0x300], 0x100).unwrap();
        let ftw = MemoryFtw::new();
        let data = alloc::vec![0x5a; 0x180];

        // the second block erase fails
        f.fail_after(Some(3));
        assert!(ftw.write(&f, 0, 0xc0, &data).is_err());
        assert!(ftw.has_pending());

        f.fail_after(None);
        ftw.complete_pending(&f).unwrap();
        assert!(!ftw.has_pending());
        let image = f.snapshot();
        assert!(image[..0xc0].iter().all(|&b| b == 0));
        assert!(image[0xc0..0x240].iter().all(|&b| b == 0x5a));
        assert!(image[0x240..].iter().all(|&b| b == 0));
        assert_eq!(ftw.completed_writes(), 1);
    }
}
