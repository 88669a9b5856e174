// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

//! On-flash layout of the EFI variable store.
//!
//! A variable store is a 28 byte store header followed by a log of variable records. Each record
//! is a 60 byte header (the authenticated variant, which carries a monotonic count, a timestamp
//! and a public key index), followed by the UCS-2 name including its terminator and the data, each
//! padded to a multiple of [`ALIGNMENT`].
//!
//! Records are never rewritten in place, except for their state byte, which only ever transitions
//! by clearing bits, so that it can be updated on NOR flash without an erase cycle:
//!
//! ```text
//!   0xFF  erased
//!   0x7F  VAR_HEADER_VALID_ONLY
//!   0x3F  VAR_ADDED
//!   0x3E  VAR_ADDED & VAR_IN_DELETED_TRANSITION
//!   0x3C  VAR_ADDED & VAR_IN_DELETED_TRANSITION & VAR_DELETED
//! ```
//!
//! Erased flash reads as all ones, and so all size fields in a record that reads as `!0` are
//! treated as zero, so that a traversal never runs off into erased flash.

use crate::{guid, Guid};

use alloc::vec::Vec;

pub const EFI_VARIABLE_NON_VOLATILE: u32 = 0x0000_0001;
pub const EFI_VARIABLE_BOOTSERVICE_ACCESS: u32 = 0x0000_0002;
pub const EFI_VARIABLE_RUNTIME_ACCESS: u32 = 0x0000_0004;
pub const EFI_VARIABLE_HARDWARE_ERROR_RECORD: u32 = 0x0000_0008;
pub const EFI_VARIABLE_AUTHENTICATED_WRITE_ACCESS: u32 = 0x0000_0010;
pub const EFI_VARIABLE_TIME_BASED_AUTHENTICATED_WRITE_ACCESS: u32 = 0x0000_0020;
pub const EFI_VARIABLE_APPEND_WRITE: u32 = 0x0000_0040;

pub const EFI_VARIABLE_ATTRIBUTES_MASK: u32 = EFI_VARIABLE_NON_VOLATILE
    | EFI_VARIABLE_BOOTSERVICE_ACCESS
    | EFI_VARIABLE_RUNTIME_ACCESS
    | EFI_VARIABLE_HARDWARE_ERROR_RECORD
    | EFI_VARIABLE_AUTHENTICATED_WRITE_ACCESS
    | EFI_VARIABLE_TIME_BASED_AUTHENTICATED_WRITE_ACCESS
    | EFI_VARIABLE_APPEND_WRITE;

pub const VARIABLE_DATA: u16 = 0x55AA;

pub const VAR_IN_DELETED_TRANSITION: u8 = 0xFE;
pub const VAR_DELETED: u8 = 0xFD;
pub const VAR_HEADER_VALID_ONLY: u8 = 0x7F;
pub const VAR_ADDED: u8 = 0x3F;

pub const VARIABLE_STORE_FORMATTED: u8 = 0x5A;
pub const VARIABLE_STORE_HEALTHY: u8 = 0xFE;

/// Signature of a variable store using the authenticated record format
pub const EFI_AUTHENTICATED_VARIABLE_GUID: Guid = guid!("aaf32c78-947b-439a-a180-2e144ec37792");

/// File system GUID of a firmware volume holding non-volatile variables
pub const EFI_SYSTEM_NV_DATA_FV_GUID: Guid = guid!("fff12b8d-7696-4c8b-a985-2747075b4f50");

/// Name and data alignment within a record
pub const ALIGNMENT: usize = 4;

pub const STORE_HEADER_SIZE: usize = 28;
pub const VARIABLE_HEADER_SIZE: usize = 60;

pub const fn pad_size(size: usize) -> usize {
    (!size).wrapping_add(1) & (ALIGNMENT - 1)
}

pub const fn header_align(offset: usize) -> usize {
    (offset + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

fn rd16(b: &[u8], o: usize) -> u16 {
    u16::from_le_bytes([b[o], b[o + 1]])
}

fn rd32(b: &[u8], o: usize) -> u32 {
    u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]])
}

fn rd64(b: &[u8], o: usize) -> u64 {
    (rd32(b, o) as u64) | (rd32(b, o + 4) as u64) << 32
}

/// EFI_TIME, as used in time based authenticated variables
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EfiTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub nanosecond: u32,
    pub timezone: i16,
    pub daylight: u8,
}

impl EfiTime {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..2].copy_from_slice(&self.year.to_le_bytes());
        b[2] = self.month;
        b[3] = self.day;
        b[4] = self.hour;
        b[5] = self.minute;
        b[6] = self.second;
        b[8..12].copy_from_slice(&self.nanosecond.to_le_bytes());
        b[12..14].copy_from_slice(&self.timezone.to_le_bytes());
        b[14] = self.daylight;
        b
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        let b = b.get(..Self::SIZE)?;
        Some(EfiTime {
            year: rd16(b, 0),
            month: b[2],
            day: b[3],
            hour: b[4],
            minute: b[5],
            second: b[6],
            nanosecond: rd32(b, 8),
            timezone: rd16(b, 12) as i16,
            daylight: b[14],
        })
    }

    /// Whether `self` is strictly later than `other`, with one second granularity
    pub fn is_later_than(&self, other: &EfiTime) -> bool {
        let key = |t: &EfiTime| (t.year, t.month, t.day, t.hour, t.minute, t.second);
        key(self) > key(other)
    }

    /// Whether all fields are zero, which is what records without a timestamp carry
    pub fn is_zero(&self) -> bool {
        *self == EfiTime::default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreStatus {
    /// Fully erased: the store header needs to be written before use
    Raw,
    Valid,
    Invalid,
}

/// VARIABLE_STORE_HEADER
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VariableStoreHeader {
    pub signature: Guid,
    pub size: u32,
    pub format: u8,
    pub state: u8,
}

impl VariableStoreHeader {
    /// A formatted, healthy store header describing a store of `size` bytes
    pub fn new(size: u32) -> Self {
        VariableStoreHeader {
            signature: EFI_AUTHENTICATED_VARIABLE_GUID,
            size,
            format: VARIABLE_STORE_FORMATTED,
            state: VARIABLE_STORE_HEALTHY,
        }
    }

    pub fn parse(b: &[u8]) -> Option<Self> {
        let b = b.get(..STORE_HEADER_SIZE)?;
        Some(VariableStoreHeader {
            signature: Guid::from_bytes(b)?,
            size: rd32(b, 16),
            format: b[20],
            state: b[21],
        })
    }

    pub fn to_bytes(&self) -> [u8; STORE_HEADER_SIZE] {
        let mut b = [0u8; STORE_HEADER_SIZE];
        b[..16].copy_from_slice(&self.signature.to_bytes());
        b[16..20].copy_from_slice(&self.size.to_le_bytes());
        b[20] = self.format;
        b[21] = self.state;
        b
    }

    pub fn status(b: &[u8]) -> StoreStatus {
        let Some(h) = Self::parse(b) else {
            return StoreStatus::Invalid;
        };
        if h.signature == EFI_AUTHENTICATED_VARIABLE_GUID
            && h.format == VARIABLE_STORE_FORMATTED
            && h.state == VARIABLE_STORE_HEALTHY
        {
            StoreStatus::Valid
        } else if b[..16].iter().all(|&c| c == 0xff)
            && h.size == u32::MAX
            && h.format == 0xff
            && h.state == 0xff
        {
            StoreStatus::Raw
        } else {
            StoreStatus::Invalid
        }
    }
}

/// Offset of the first record in a store
pub const fn start_offset() -> usize {
    header_align(STORE_HEADER_SIZE)
}

/// Offset just past the last byte that may hold records, bounded by the length of the store
/// image `store`
pub fn end_offset(store: &[u8]) -> usize {
    let size = match VariableStoreHeader::parse(store) {
        Some(h) if h.size != u32::MAX => h.size as usize,
        _ => store.len(),
    };
    header_align(size).min(store.len())
}

/// A cursor designating a variable record at a given offset in a store image.
///
/// All accessors take the store image as an argument, and must only be used on records for
/// which [`is_valid`](Self::is_valid) returned true.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VariableRecord {
    pub offset: usize,
}

impl VariableRecord {
    pub fn first() -> Self {
        VariableRecord {
            offset: start_offset(),
        }
    }

    /// A record is valid if it carries the start marker, and if the header and the name and data
    /// it declares fit inside the store.
    pub fn is_valid(&self, store: &[u8]) -> bool {
        let end = end_offset(store);
        if self.offset + VARIABLE_HEADER_SIZE > end || rd16(store, self.offset) != VARIABLE_DATA {
            return false;
        }
        self.data_offset(store)
            .checked_add(self.data_size(store))
            .map_or(false, |e| e <= end)
    }

    fn field32(&self, store: &[u8], o: usize) -> Option<u32> {
        if self.state(store) == 0xff {
            return None;
        }
        match rd32(store, self.offset + o) {
            u32::MAX => None,
            v => Some(v),
        }
    }

    pub fn state(&self, store: &[u8]) -> u8 {
        store[self.offset + 2]
    }

    /// Offset of the state byte in the store image
    pub fn state_offset(&self) -> usize {
        self.offset + 2
    }

    pub fn attributes(&self, store: &[u8]) -> u32 {
        self.field32(store, 4).unwrap_or(0)
    }

    pub fn monotonic_count(&self, store: &[u8]) -> u64 {
        rd64(store, self.offset + 8)
    }

    pub fn timestamp(&self, store: &[u8]) -> EfiTime {
        EfiTime::from_bytes(&store[self.offset + 16..]).unwrap_or_default()
    }

    pub fn pubkey_index(&self, store: &[u8]) -> u32 {
        rd32(store, self.offset + 32)
    }

    pub fn name_size(&self, store: &[u8]) -> usize {
        self.field32(store, 36).unwrap_or(0) as usize
    }

    pub fn data_size(&self, store: &[u8]) -> usize {
        self.field32(store, 40).unwrap_or(0) as usize
    }

    pub fn guid(&self, store: &[u8]) -> Guid {
        Guid::from_bytes(&store[self.offset + 44..]).unwrap_or_default()
    }

    pub fn name_offset(&self) -> usize {
        self.offset + VARIABLE_HEADER_SIZE
    }

    pub fn data_offset(&self, store: &[u8]) -> usize {
        let n = self.name_size(store);
        self.name_offset() + n + pad_size(n)
    }

    /// The name as stored, including the terminating NUL character
    pub fn name<'a>(&self, store: &'a [u8]) -> &'a [u8] {
        let o = self.name_offset();
        &store[o..o + self.name_size(store)]
    }

    pub fn data<'a>(&self, store: &'a [u8]) -> &'a [u8] {
        let o = self.data_offset(store);
        &store[o..o + self.data_size(store)]
    }

    /// The name as UCS-2 characters, without the terminator
    pub fn name_ucs2(&self, store: &[u8]) -> Vec<u16> {
        self.name(store)
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&c| c != 0)
            .collect()
    }

    /// Whether this record carries `guid` and the encoded name `name`
    pub fn matches(&self, store: &[u8], guid: &Guid, name: &[u8]) -> bool {
        self.guid(store) == *guid && self.name(store) == name
    }

    /// The record following this one, or None if this record is not valid, which is how
    /// traversals terminate.
    pub fn next(&self, store: &[u8]) -> Option<VariableRecord> {
        if !self.is_valid(store) {
            return None;
        }
        let d = self.data_size(store);
        Some(VariableRecord {
            offset: header_align(self.data_offset(store) + d + pad_size(d)),
        })
    }

    /// Size of the record including padding
    pub fn total_size(&self, store: &[u8]) -> usize {
        self.next(store).map_or(0, |n| n.offset - self.offset)
    }
}

/// Iterates over the valid records of a store image, starting at the first record.
pub fn records(store: &[u8]) -> impl Iterator<Item = VariableRecord> + '_ {
    let end = end_offset(store);
    core::iter::successors(Some(VariableRecord::first()), move |r| r.next(store))
        .take_while(move |r| r.offset < end && r.is_valid(store))
}

/// Offset just past the last valid record of a store image
pub fn last_offset(store: &[u8]) -> usize {
    records(store)
        .last()
        .and_then(|r| r.next(store))
        .map_or(start_offset(), |r| r.offset)
}

/// The authentication related fields of a variable record
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuthFields {
    pub monotonic_count: u64,
    pub timestamp: EfiTime,
    pub pubkey_index: u32,
}

/// Serializes a variable record, padded to its full size. `name` is the encoded name including
/// its terminator.
pub fn encode_record(
    state: u8,
    attributes: u32,
    auth: &AuthFields,
    guid: &Guid,
    name: &[u8],
    data: &[u8],
) -> Vec<u8> {
    let data_offset = VARIABLE_HEADER_SIZE + name.len() + pad_size(name.len());
    let size = header_align(data_offset + data.len() + pad_size(data.len()));
    let mut b = alloc::vec![0xffu8; size];

    b[0..2].copy_from_slice(&VARIABLE_DATA.to_le_bytes());
    b[2] = state;
    b[3] = 0;
    b[4..8].copy_from_slice(&attributes.to_le_bytes());
    b[8..16].copy_from_slice(&auth.monotonic_count.to_le_bytes());
    b[16..32].copy_from_slice(&auth.timestamp.to_bytes());
    b[32..36].copy_from_slice(&auth.pubkey_index.to_le_bytes());
    b[36..40].copy_from_slice(&(name.len() as u32).to_le_bytes());
    b[40..44].copy_from_slice(&(data.len() as u32).to_le_bytes());
    b[44..60].copy_from_slice(&guid.to_bytes());
    b[VARIABLE_HEADER_SIZE..VARIABLE_HEADER_SIZE + name.len()].copy_from_slice(name);
    b[data_offset..data_offset + data.len()].copy_from_slice(data);
    b
}

/// Encodes a UCS-2 name as stored in a record, including the terminator
pub fn encode_name(name: &[u16]) -> Vec<u8> {
    name.iter()
        .copied()
        .chain(core::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}

const FVH_SIGNATURE: u32 = u32::from_le_bytes(*b"_FVH");
const FVH_REVISION: u8 = 2;

/// Read/write attributes of a writable firmware volume
pub const EFI_FVB2_READ_WRITE: u32 = 0x0004_0e4f;

/// EFI_FIRMWARE_VOLUME_HEADER, as found at the start of the volume holding the non-volatile
/// variable store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirmwareVolumeHeader {
    pub file_system_guid: Guid,
    pub fv_length: u64,
    pub attributes: u32,
    pub header_length: u16,
    /// (number of blocks, block length) pairs
    pub block_map: Vec<(u32, u32)>,
}

impl FirmwareVolumeHeader {
    /// A header for a variable volume of `num_blocks` blocks of `block_size` bytes
    pub fn new(block_size: u32, num_blocks: u32) -> Self {
        FirmwareVolumeHeader {
            file_system_guid: EFI_SYSTEM_NV_DATA_FV_GUID,
            fv_length: block_size as u64 * num_blocks as u64,
            attributes: EFI_FVB2_READ_WRITE,
            header_length: (56 + 2 * 8) as u16,
            block_map: alloc::vec![(num_blocks, block_size)],
        }
    }

    fn checksum(b: &[u8]) -> u16 {
        b.chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .fold(0u16, u16::wrapping_add)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = alloc::vec![0u8; self.header_length as usize];
        b[16..32].copy_from_slice(&self.file_system_guid.to_bytes());
        b[32..40].copy_from_slice(&self.fv_length.to_le_bytes());
        b[40..44].copy_from_slice(&FVH_SIGNATURE.to_le_bytes());
        b[44..48].copy_from_slice(&self.attributes.to_le_bytes());
        b[48..50].copy_from_slice(&self.header_length.to_le_bytes());
        b[55] = FVH_REVISION;
        for (i, (n, l)) in self.block_map.iter().enumerate() {
            let o = 56 + 8 * i;
            b[o..o + 4].copy_from_slice(&n.to_le_bytes());
            b[o + 4..o + 8].copy_from_slice(&l.to_le_bytes());
        }
        let sum = Self::checksum(&b);
        b[50..52].copy_from_slice(&sum.wrapping_neg().to_le_bytes());
        b
    }

    /// Parses and validates a firmware volume header: signature, revision, checksum and a block
    /// map that covers the volume exactly.
    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < 56 + 8 || rd32(b, 40) != FVH_SIGNATURE || b[55] != FVH_REVISION {
            return None;
        }
        let header_length = rd16(b, 48);
        let hdr = b.get(..header_length as usize)?;
        if header_length % 2 != 0 || Self::checksum(hdr) != 0 {
            return None;
        }
        let block_map: Vec<(u32, u32)> = hdr[56..]
            .chunks_exact(8)
            .map(|c| (rd32(c, 0), rd32(c, 4)))
            .take_while(|&(n, l)| n != 0 || l != 0)
            .collect();
        let fv_length = rd64(b, 32);
        let covered: u64 = block_map.iter().map(|&(n, l)| n as u64 * l as u64).sum();
        if covered != fv_length {
            return None;
        }
        Some(FirmwareVolumeHeader {
            file_system_guid: Guid::from_bytes(&b[16..])?,
            fv_length,
            attributes: rd32(b, 44),
            header_length,
            block_map,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: Guid = guid!("8be4df61-93ca-11d2-aa0d-00e098032b8c");

    fn store_with(records: &[Vec<u8>], size: usize) -> Vec<u8> {
        let mut s = alloc::vec![0xffu8; size];
        s[..STORE_HEADER_SIZE].copy_from_slice(&VariableStoreHeader::new(size as u32).to_bytes());
        let mut o = start_offset();
        for r in records {
            s[o..o + r.len()].copy_from_slice(r);
            o += r.len();
        }
        s
    }

    #[test]
    fn padding() {
        assert_eq!(pad_size(0), 0);
        assert_eq!(pad_size(6), 2);
        assert_eq!(pad_size(7), 1);
        assert_eq!(header_align(61), 64);
        assert_eq!(start_offset(), 28);
    }

    #[test]
    fn record_layout() {
        let name = encode_name(&[b'F' as u16, b'o' as u16, b'o' as u16]);
        assert_eq!(name.len(), 8);
        let r = encode_record(VAR_ADDED, 7, &AuthFields::default(), &G, &name, &[1, 2, 3]);
        assert_eq!(r.len(), 60 + 8 + 4);

        let store = store_with(&[r.clone(), r], 0x200);
        let recs: Vec<_> = records(&store).collect();
        assert_eq!(recs.len(), 2);
        let v = recs[0];
        assert_eq!(v.attributes(&store), 7);
        assert_eq!(v.guid(&store), G);
        assert_eq!(v.data(&store), &[1, 2, 3]);
        assert_eq!(v.name_ucs2(&store), [b'F' as u16, b'o' as u16, b'o' as u16]);
        assert!(v.matches(&store, &G, &name));
        assert_eq!(v.next(&store), Some(recs[1]));
        assert_eq!(last_offset(&store), 28 + 2 * 72);
    }

    #[test]
    fn erased_fields_read_as_zero() {
        let name = encode_name(&[b'A' as u16]);
        let mut r = encode_record(VAR_ADDED, 7, &AuthFields::default(), &G, &name, &[1]);
        // a torn header: sizes never made it to flash
        r[36..44].fill(0xff);
        let store = store_with(&[r], 0x100);
        let v = VariableRecord::first();
        assert!(v.is_valid(&store));
        assert_eq!(v.name_size(&store), 0);
        assert_eq!(v.data_size(&store), 0);

        let mut erased = store_with(&[], 0x100);
        erased[28..30].copy_from_slice(&VARIABLE_DATA.to_le_bytes());
        assert_eq!(v.attributes(&erased), 0);
        assert_eq!(v.data_size(&erased), 0);
    }

    #[test]
    fn oversized_record_is_invalid() {
        let name = encode_name(&[b'A' as u16]);
        let mut r = encode_record(VAR_ADDED, 7, &AuthFields::default(), &G, &name, &[1]);
        r[40..44].copy_from_slice(&0x1000u32.to_le_bytes());
        let store = store_with(&[r], 0x100);
        assert!(!VariableRecord::first().is_valid(&store));
        assert_eq!(records(&store).count(), 0);
        assert_eq!(last_offset(&store), start_offset());
    }

    #[test]
    fn store_status() {
        let valid = VariableStoreHeader::new(0x1000).to_bytes();
        assert_eq!(VariableStoreHeader::status(&valid), StoreStatus::Valid);
        assert_eq!(VariableStoreHeader::status(&[0xff; 28]), StoreStatus::Raw);
        let mut bad = valid;
        bad[21] = 0xfc;
        assert_eq!(VariableStoreHeader::status(&bad), StoreStatus::Invalid);
        assert_eq!(VariableStoreHeader::status(&valid[..10]), StoreStatus::Invalid);
    }

    #[test]
    fn timestamps() {
        let t1 = EfiTime {
            year: 2023,
            month: 5,
            day: 1,
            hour: 10,
            minute: 59,
            second: 30,
            ..Default::default()
        };
        let t2 = EfiTime { minute: 58, second: 59, hour: 11, ..t1 };
        assert!(t2.is_later_than(&t1));
        assert!(!t1.is_later_than(&t1));
        assert!(!t1.is_later_than(&t2));
        assert_eq!(EfiTime::from_bytes(&t2.to_bytes()), Some(t2));
    }

    #[test]
    fn fv_header() {
        let h = FirmwareVolumeHeader::new(0x1000, 16);
        let b = h.to_bytes();
        assert_eq!(b.len(), 72);
        assert_eq!(FirmwareVolumeHeader::parse(&b), Some(h));

        let mut corrupt = b.clone();
        corrupt[33] ^= 1;
        assert_eq!(FirmwareVolumeHeader::parse(&corrupt), None);
    }
}
