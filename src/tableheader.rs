// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

use crate::memmap::MemoryBus;
use crate::status::Status;

use alloc::vec::Vec;
use crc::{Crc, CRC_32_ISO_HDLC};

pub(crate) const TABLE_HEADER_SIZE: usize = 24;

pub(crate) fn crc32(data: &[u8]) -> u32 {
    Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(data)
}

/// EFI_TABLE_HEADER
pub(crate) struct TableHeader {
    pub signature: u64,
    pub revision: u32,
}

impl TableHeader {
    /// Writes the header followed by `body` to guest memory at `addr`. The header's CRC32 covers
    /// the entire table.
    pub(crate) fn write(&self, bus: &dyn MemoryBus, addr: u64, body: &[u8]) -> Result<(), Status> {
        let size = TABLE_HEADER_SIZE + body.len();
        let mut t = Vec::with_capacity(size);
        t.extend_from_slice(&self.signature.to_le_bytes());
        t.extend_from_slice(&self.revision.to_le_bytes());
        t.extend_from_slice(&(size as u32).to_le_bytes());
        t.extend_from_slice(&0u32.to_le_bytes());
        t.extend_from_slice(&0u32.to_le_bytes());
        t.extend_from_slice(body);

        let crc = crc32(&t);
        t[16..20].copy_from_slice(&crc.to_le_bytes());
        Ok(bus.store(addr, &t)?)
    }
}

/// Checks the signature and CRC32 of the table at `addr` in guest memory
#[cfg(test)]
pub(crate) fn verify(bus: &dyn MemoryBus, addr: u64, signature: u64) -> bool {
    let mut hdr = [0u8; TABLE_HEADER_SIZE];
    if bus.load(addr, &mut hdr).is_err() {
        return false;
    }
    let size = u32::from_le_bytes([hdr[12], hdr[13], hdr[14], hdr[15]]) as usize;
    let mut t = alloc::vec![0u8; size.max(TABLE_HEADER_SIZE)];
    if bus.load(addr, &mut t).is_err() {
        return false;
    }
    let crc = u32::from_le_bytes([t[16], t[17], t[18], t[19]]);
    t[16..20].fill(0);
    t[..8] == signature.to_le_bytes() && crc32(&t) == crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebcvm::tests::FlatHost;

    #[test]
    fn crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn header_covers_body() {
        let host = FlatHost::new(0x1000, 0x1000);
        let hdr = TableHeader {
            signature: 0x5652_4553_544e_5552,
            revision: 0x2_0064,
        };
        hdr.write(&host, 0x1100, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert!(verify(&host, 0x1100, 0x5652_4553_544e_5552));
        assert_eq!(host.load_u32(0x110c).unwrap(), 32);

        host.write(0x1100 + 30, &[0xff]);
        assert!(!verify(&host, 0x1100, 0x5652_4553_544e_5552));
        assert!(hdr.write(&host, 0x1ff0, &[0; 8]).is_err());
    }
}
