// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

use crate::memorytype::*;
use crate::poolalloc::PoolAllocator;
use crate::EfiMemoryType::*;
use crate::PhysicalAddress;
use crate::Placement::*;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use core::alloc::Layout;
use core::cell::RefCell;
use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Requested placement for page allocations. The variants `Max`, `Fixed` and `Anywhere` are 1:1
/// equivalents of the EFI AllocatePages() boot service's `Type` argument.
#[derive(Clone, Copy, Debug)]
pub enum Placement {
    /// Placement below a certain address
    Max(u64),
    /// Placement at a fixed address
    Fixed(u64),
    /// Unrestricted placement
    Anywhere,

    /// Arbitrary placement with alignment
    Aligned(u64),
    /// Placement with upper limit and alignment
    MaxAlignMask(u64, u64),
}

pub fn size_to_pages(size: usize) -> usize {
    (size + EFI_PAGE_MASK) >> EFI_PAGE_SHIFT
}

/// An access to guest memory that is not backed by an allocation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryFault {
    pub address: u64,
}

impl From<MemoryFault> for crate::status::Status {
    fn from(_: MemoryFault) -> Self {
        crate::status::Status::EFI_INVALID_PARAMETER
    }
}

/// The byte addressed view of guest memory that EBC code and the guest visible firmware tables
/// use. Multi-byte quantities are little endian.
pub trait MemoryBus {
    fn load(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryFault>;
    fn store(&self, addr: u64, data: &[u8]) -> Result<(), MemoryFault>;

    fn load_u16(&self, addr: u64) -> Result<u16, MemoryFault> {
        let mut b = [0u8; 2];
        self.load(addr, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn load_u32(&self, addr: u64) -> Result<u32, MemoryFault> {
        let mut b = [0u8; 4];
        self.load(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn load_u64(&self, addr: u64) -> Result<u64, MemoryFault> {
        let mut b = [0u8; 8];
        self.load(addr, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    /// Loads a natural word of `width` bytes, zero extended to 64 bits.
    fn load_natural(&self, addr: u64, width: usize) -> Result<u64, MemoryFault> {
        let mut b = [0u8; 8];
        self.load(addr, &mut b[..width])?;
        Ok(u64::from_le_bytes(b))
    }

    fn store_u32(&self, addr: u64, value: u32) -> Result<(), MemoryFault> {
        self.store(addr, &value.to_le_bytes())
    }

    fn store_u64(&self, addr: u64, value: u64) -> Result<(), MemoryFault> {
        self.store(addr, &value.to_le_bytes())
    }

    /// Stores the low `width` bytes of `value`.
    fn store_natural(&self, addr: u64, width: usize, value: u64) -> Result<(), MemoryFault> {
        self.store(addr, &value.to_le_bytes()[..width])
    }
}

#[derive(Clone, Copy)]
#[repr(C, align(4096))]
pub(crate) struct Page([u8; EFI_PAGE_SIZE]);

type MemMap = BTreeMap<PhysicalAddress, EfiMemoryDescriptor>;

struct PoolAllocDb {
    allocators: BTreeMap<EfiMemoryType, PoolAllocator>,
    allocations: BTreeMap<u64, (EfiMemoryType, Layout)>,
}

/// The guest address space: a EFI memory map describing which guest physical ranges exist and
/// how they are used, plus the host memory backing each allocated range.
pub struct MemoryMap {
    memmap: RefCell<MemMap>,
    backing: RefCell<BTreeMap<PhysicalAddress, Box<[Page]>>>,
    pool_alloc_db: RefCell<PoolAllocDb>,
    mapkey: AtomicUsize,
}

impl MemoryMap {
    /// Create a new empty MemoryMap object
    pub fn new() -> Self {
        let alloc_db = PoolAllocDb {
            allocators: BTreeMap::new(),
            allocations: BTreeMap::new(),
        };
        MemoryMap {
            memmap: RefCell::new(BTreeMap::new()),
            backing: RefCell::new(BTreeMap::new()),
            pool_alloc_db: RefCell::new(alloc_db),
            mapkey: AtomicUsize::new(1),
        }
    }

    pub(crate) fn allocate_pool(
        &self,
        pool_type: EfiMemoryType,
        size: usize,
    ) -> Result<u64, &'static str> {
        let layout = Layout::from_size_align(size.max(1), 16).or(Err("Layout error"))?;
        let mut db = self.pool_alloc_db.borrow_mut();
        let alloc = &mut db.allocators;
        if !alloc.contains_key(&pool_type) {
            alloc.insert(
                pool_type,
                PoolAllocator::new(pool_type, self)
                    .or(Err("Failed to insert new pool allocator"))?,
            );
        }
        let p = alloc
            .get_mut(&pool_type)
            .ok_or("Missing pool allocator")?
            .allocate(layout)
            .or(Err("Failed to allocate from pool"))?;
        db.allocations.insert(p, (pool_type, layout));
        Ok(p)
    }

    pub(crate) fn free_pool(&self, buffer: u64) -> Result<(), ()> {
        let mut db = self.pool_alloc_db.borrow_mut();

        let (pool_type, layout) = db.allocations.remove(&buffer).ok_or(())?;
        db.allocators
            .get_mut(&pool_type)
            .ok_or(())?
            .deallocate(buffer, layout);
        Ok(())
    }

    /// Returns the memory type of the pool allocation at `buffer`, if there is one.
    pub fn pool_type(&self, buffer: u64) -> Option<EfiMemoryType> {
        let db = self.pool_alloc_db.borrow();
        db.allocations.get(&buffer).map(|(t, _)| *t)
    }

    fn inc_map_key(&self) {
        self.mapkey.fetch_add(1, Ordering::Release);
    }

    fn insert_region(&self, mm: &mut MemMap, desc: &EfiMemoryDescriptor) {
        debug_assert!(desc.physical_start as usize & EFI_PAGE_MASK == 0);

        // If insert() returns an existing item, something went really wrong and the memory
        // map will be in an inconsistent state.
        if mm.insert(desc.physical_start, *desc).is_some() {
            panic!("Conflicting entries in memory map!\n");
        }
    }

    fn declare_region(
        &self,
        mm: &mut MemMap,
        phys: u64,
        num_pages: u64,
        _type: EfiMemoryType,
        attr: u64,
    ) -> Result<(), ()> {
        if phys & EFI_PAGE_MASK as u64 != 0 {
            return Err(());
        }

        // Check for overlap
        mm.values()
            .find(|&d| d.intersects(phys, num_pages))
            .map_or(Ok(()), |_| Err(()))?;

        // Check whether the created/updated entry ends right where an
        // entry of the same type starts. If so, remove it and add its
        // page count to the new entry.
        let num_pages = {
            let mut l = num_pages;
            mm.retain(|p, d| {
                if *p == phys + (num_pages << EFI_PAGE_SHIFT)
                    && d.r#type == _type
                    && d.attribute == attr
                {
                    l += d.number_of_pages;
                    false
                } else {
                    true
                }
            });
            l
        };

        // Check if an entry exists with the same type and attributes
        // that ends right where this one starts. If so, update it to
        // cover the newly declared region instead of creating a new
        // entry.
        if let Some(desc) = mm
            .values_mut()
            .find(|d| d.end() == phys && d.r#type == _type && d.attribute == attr)
        {
            desc.number_of_pages += num_pages;
        } else {
            let d = EfiMemoryDescriptor {
                r#type: _type,
                physical_start: phys,
                number_of_pages: num_pages,
                attribute: attr,
            };
            self.insert_region(mm, &d);
        }
        self.inc_map_key();
        Ok(())
    }

    /// Declare `range` as a region of available guest memory in the EFI memory map. Page and
    /// pool allocations may be served from memory declared in this manner. The region must not
    /// exist yet in the memory map.
    pub fn declare_memory_region(&self, range: &Range<u64>) -> Result<(), ()> {
        let mut mm = self.memmap.borrow_mut();
        let pages = (range.end - range.start) >> EFI_PAGE_SHIFT;
        self.declare_region(
            &mut mm,
            range.start,
            pages,
            EfiConventionalMemory,
            EFI_MEMORY_WB,
        )
    }

    fn split_region(
        &self,
        mm: &mut MemMap,
        phys: PhysicalAddress,
        size: usize,
        _type: Option<EfiMemoryType>,
    ) -> Result<(), ()> {
        let desc = mm
            .values_mut()
            .find(|d| {
                d.r#type == _type.unwrap_or(d.r#type)
                    && d.physical_start < phys
                    && d.end() >= phys + size as u64
            })
            .ok_or(())?;
        let num_pages = (phys - desc.physical_start) >> EFI_PAGE_SHIFT;
        let d = EfiMemoryDescriptor {
            r#type: desc.r#type,
            physical_start: phys,
            number_of_pages: desc.number_of_pages - num_pages,
            attribute: desc.attribute,
        };
        desc.number_of_pages = num_pages;
        self.insert_region(mm, &d);
        self.inc_map_key();
        Ok(())
    }

    fn convert_region(
        &self,
        phys: PhysicalAddress,
        size: usize,
        from: Option<EfiMemoryType>,
        to: EfiMemoryType,
    ) -> Result<(), ()> {
        let pages = size as u64 >> EFI_PAGE_SHIFT;
        let attr = if to.is_runtime() {
            EFI_MEMORY_RUNTIME | EFI_MEMORY_WB
        } else {
            EFI_MEMORY_WB
        };

        if phys & EFI_PAGE_MASK as u64 != 0 {
            return Err(());
        }

        let mut mm = self.memmap.borrow_mut();

        // If the start address does not appear in the map yet, find the
        // entry that covers the range and split it in two.
        if !mm.contains_key(&phys) {
            self.split_region(&mut mm, phys, size, from)?;
        }

        // Take the entry that starts at the right address, which split_region() will have
        // created if it did not exist before
        let mut desc = mm.remove(&phys).ok_or(())?;

        // If such an entry exists, check whether it is of the
        // expected size and type. If not, put it back into the
        // map and return an error.
        if desc.r#type != from.unwrap_or(desc.r#type) || pages > desc.number_of_pages {
            self.insert_region(&mut mm, &desc);
            return Err(());
        }

        // Shrink the entry and increase its start address
        // accordingly. If it ends up empty, drop it.
        desc.number_of_pages -= pages;
        desc.physical_start += size as u64;
        if desc.number_of_pages > 0 {
            self.insert_region(&mut mm, &desc);
        }

        // Create a new entry for the converted region
        self.declare_region(&mut mm, phys, pages, to, attr)
    }

    /// Free `pages` pages at guest address `base`, which must describe an allocation made via
    /// [`allocate_pages`](Self::allocate_pages) in its entirety.
    pub fn free_pages(&self, base: u64, pages: usize) -> Result<(), ()> {
        let mut backing = self.backing.borrow_mut();
        match backing.get(&base) {
            Some(b) if b.len() == pages => {}
            _ => return Err(()),
        }
        let size = pages << EFI_PAGE_SHIFT;
        self.convert_region(base, size, None, EfiConventionalMemory)?;
        backing.remove(&base);
        Ok(())
    }

    /// Allocate `pages` pages of guest memory of type `_type`, placed according to `placement`.
    /// The allocated memory is zero initialized.
    pub fn allocate_pages(
        &self,
        pages: usize,
        _type: EfiMemoryType,
        placement: Placement,
    ) -> Option<u64> {
        if pages == 0 {
            return None;
        }

        let mm = self.memmap.borrow();
        let p = pages as u64;

        // Narrow down the placement
        let placement = match placement {
            Max(max) => MaxAlignMask(max, EFI_PAGE_MASK as u64),
            Anywhere => MaxAlignMask(u64::MAX, EFI_PAGE_MASK as u64),
            Aligned(align) => MaxAlignMask(u64::MAX, align.max(EFI_PAGE_SIZE as u64) - 1),
            pl => pl,
        };

        let base = match placement {
            // Look for the descriptor that is the highest up in memory
            // that covers a sufficient number of pages below 'max' from
            // its start address aligned up to the requested alignment
            MaxAlignMask(max, mask) => {
                let desc = mm
                    .values()
                    .take_while(|d| {
                        ((d.physical_start.wrapping_sub(1)) | mask)
                            .wrapping_add(p << EFI_PAGE_SHIFT)
                            <= max
                    })
                    .filter(|d| {
                        let num_pages = p
                            + ((mask - (d.physical_start.wrapping_sub(1) & mask))
                                >> EFI_PAGE_SHIFT);
                        d.r#type == EfiConventionalMemory && d.number_of_pages >= num_pages
                    })
                    .last()?;

                // Find the highest possible base resulting from the limit in 'max'
                let highest_base = max - (p << EFI_PAGE_SHIFT) + 1;

                // Allocate from the top down
                let offset = (desc.number_of_pages - p) << EFI_PAGE_SHIFT;
                highest_base.min(desc.physical_start + offset) & !mask
            }

            Fixed(base) => base,

            _ => return None,
        };
        drop(mm);

        let size = pages << EFI_PAGE_SHIFT;
        self.convert_region(base, size, Some(EfiConventionalMemory), _type)
            .ok()?;

        let zero = Page([0; EFI_PAGE_SIZE]);
        self.backing
            .borrow_mut()
            .insert(base, vec![zero; pages].into_boxed_slice());
        Some(base)
    }

    /// Returns the host pointer backing guest address `addr`, and the number of bytes that are
    /// contiguously accessible from there.
    pub(crate) fn host_ptr(&self, addr: u64) -> Option<(*mut u8, usize)> {
        let mut backing = self.backing.borrow_mut();
        let (base, pages) = backing.range_mut(..=addr).next_back()?;
        let offset = (addr - base) as usize;
        let len = pages.len() << EFI_PAGE_SHIFT;
        if offset >= len {
            return None;
        }
        let ptr = pages.as_mut_ptr() as *mut u8;
        // SAFETY: offset is within the backing allocation
        Some((unsafe { ptr.add(offset) }, len - offset))
    }

    fn access(&self, addr: u64, len: usize, mut f: impl FnMut(&mut [u8], usize)) -> Result<(), MemoryFault> {
        let mut done = 0;
        while done < len {
            let a = addr.wrapping_add(done as u64);
            let mut backing = self.backing.borrow_mut();
            let (base, pages) = backing
                .range_mut(..=a)
                .next_back()
                .ok_or(MemoryFault { address: a })?;
            let offset = (a - base) as usize;
            let bytes = pages.len() << EFI_PAGE_SHIFT;
            if offset >= bytes {
                return Err(MemoryFault { address: a });
            }
            let chunk = (len - done).min(bytes - offset);
            let page = offset >> EFI_PAGE_SHIFT;
            let mut o = offset & EFI_PAGE_MASK;
            let mut n = 0;
            let mut p = page;
            while n < chunk {
                let c = (chunk - n).min(EFI_PAGE_SIZE - o);
                f(&mut pages[p].0[o..o + c], done + n);
                n += c;
                o = 0;
                p += 1;
            }
            done += chunk;
        }
        Ok(())
    }

    /// Returns a snapshot of the memory map
    pub fn descriptors(&self) -> alloc::vec::Vec<EfiMemoryDescriptor> {
        self.memmap.borrow().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.memmap.borrow().len()
    }

    pub fn key(&self) -> usize {
        self.mapkey.load(Ordering::Relaxed)
    }
}

impl MemoryBus for MemoryMap {
    fn load(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryFault> {
        let len = buf.len();
        self.access(addr, len, |mem, at| {
            buf[at..at + mem.len()].copy_from_slice(mem)
        })
    }

    fn store(&self, addr: u64, data: &[u8]) -> Result<(), MemoryFault> {
        self.access(addr, data.len(), |mem, at| {
            let l = mem.len();
            mem.copy_from_slice(&data[at..at + l])
        })
    }
}
