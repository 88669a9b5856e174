// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

use crate::memmap;
use crate::EfiMemoryType;
use crate::MemoryMap;
use crate::Placement;

use core::alloc::Layout;
use core::ptr::NonNull;
use linked_list_allocator::Heap;

pub(crate) struct PoolAllocator {
    heap: Heap,
    granularity: usize,
    allocated: usize,

    // guest address and host mapping of the arena
    base: u64,
    host: *mut u8,
}

/// The size of the region reserved by a pool allocator
const ARENA_SIZE: usize = 0x10_0000; // 1 MiB

impl PoolAllocator {
    fn extend(&mut self, bytes: usize) -> Result<(), ()> {
        let grow = align_up!(bytes, self.granularity);
        if self.allocated + grow > ARENA_SIZE {
            return Err(());
        }
        self.allocated += grow;
        // SAFETY: the arena backing covers ARENA_SIZE bytes from the heap bottom
        unsafe { self.heap.extend(grow) };
        Ok(())
    }

    pub(crate) fn new(memtype: EfiMemoryType, mm: &MemoryMap) -> Result<Self, ()> {
        let granularity = match memtype {
            EfiMemoryType::EfiLoaderData | EfiMemoryType::EfiBootServicesData => 0x4_0000,
            EfiMemoryType::EfiLoaderCode | EfiMemoryType::EfiBootServicesCode => 0x1_0000,
            EfiMemoryType::EfiRuntimeServicesCode | EfiMemoryType::EfiRuntimeServicesData => {
                0x1_0000
            }
            EfiMemoryType::EfiACPIReclaimMemory | EfiMemoryType::EfiACPIMemoryNVS => 0x1000,
            _ => {
                return Err(());
            }
        };

        let base = mm
            .allocate_pages(memmap::size_to_pages(ARENA_SIZE), memtype, Placement::Anywhere)
            .ok_or(())?;
        let (host, len) = mm.host_ptr(base).ok_or(())?;
        debug_assert!(len >= ARENA_SIZE);

        Ok(PoolAllocator {
            // SAFETY: the arena is backed by host memory that lives as long as the memory map
            heap: unsafe { Heap::new(host, granularity) },
            granularity,
            allocated: granularity,
            base,
            host,
        })
    }

    fn to_guest(&self, p: NonNull<u8>) -> u64 {
        self.base + (p.as_ptr() as usize - self.host as usize) as u64
    }

    pub(crate) fn allocate(&mut self, layout: Layout) -> Result<u64, ()> {
        let p = self.heap.allocate_first_fit(layout).or_else(|_| {
            self.extend(layout.size())?;
            self.heap.allocate_first_fit(layout)
        })?;
        Ok(self.to_guest(p))
    }

    pub(crate) fn deallocate(&mut self, buffer: u64, layout: Layout) {
        let offset = (buffer - self.base) as usize;
        // SAFETY: `buffer` was handed out by allocate() with the same layout
        unsafe {
            self.heap
                .deallocate(NonNull::new_unchecked(self.host.add(offset)), layout)
        }
    }
}
