// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

//! Fetching of immediate data and natural indexes from the EBC instruction stream.
//!
//! A natural index encodes an offset as `sign * (constant + natural_units * sizeof(UINTN))`, so
//! that the same code can address stack slots on hosts with 32-bit and 64-bit natural words:
//!
//! ```text
//!   bit N-1           sign
//!   bits N-2:N-4      number of bits assigned to natural units, in units of N/8
//!   middle bits       constant units
//!   low bits          natural units
//! ```

use crate::ebcvm::*;
use crate::memmap::MemoryFault;

/// Decodes a 16-bit natural index into a byte offset.
pub fn decode_index16(index: u16, natural: usize) -> i16 {
    let nbits = ((index & 0x7000) >> 12) * 2;
    let mask = !0u16 << nbits;
    let n = (index & !mask) as i16;
    let c = (((index & !0xF000) & mask) >> nbits) as i16;
    let offset = n.wrapping_mul(natural as i16).wrapping_add(c);
    if index & 0x8000 != 0 {
        offset.wrapping_neg()
    } else {
        offset
    }
}

/// Decodes a 32-bit natural index into a byte offset.
pub fn decode_index32(index: u32, natural: usize) -> i32 {
    let nbits = ((index & 0x7000_0000) >> 28) * 4;
    let mask = !0u32 << nbits;
    let n = (index & !mask) as i32;
    let c = (((index & !0xF000_0000) & mask) >> nbits) as i32;
    let offset = n.wrapping_mul(natural as i32).wrapping_add(c);
    if index & 0x8000_0000 != 0 {
        offset.wrapping_neg()
    } else {
        offset
    }
}

/// Decodes a 64-bit natural index into a byte offset.
pub fn decode_index64(index: u64, natural: usize) -> i64 {
    let nbits = ((index & 0x7000_0000_0000_0000) >> 60) * 8;
    let mask = !0u64 << nbits;
    let n = (index & !mask) as i64;
    let c = (((index & !0xF000_0000_0000_0000) & mask) >> nbits) as i64;
    let offset = n.wrapping_mul(natural as i64).wrapping_add(c);
    if index & 0x8000_0000_0000_0000 != 0 {
        offset.wrapping_neg()
    } else {
        offset
    }
}

/// Picks the smallest natural unit field that fits both `constant` and `natural_units` in
/// `payload` bits, where the field width is a multiple of `step`.
fn encode(
    bits: u32,
    step: u32,
    negative: bool,
    constant: u64,
    natural_units: u64,
) -> Option<u64> {
    let payload = bits - 4;
    (0..8u32)
        .map(|k| (k, k * step))
        .take_while(|(_, nbits)| *nbits <= payload)
        .find(|(_, nbits)| {
            natural_units >> nbits == 0 && constant >> (payload - nbits) == 0
        })
        .map(|(k, nbits)| {
            (negative as u64) << (bits - 1)
                | (k as u64) << (bits - 4)
                | constant << nbits
                | natural_units
        })
}

/// Encodes `sign * (constant + natural_units * sizeof(UINTN))` as a 16-bit natural index.
pub fn encode_index16(negative: bool, constant: u16, natural_units: u16) -> Option<u16> {
    encode(16, 2, negative, constant as u64, natural_units as u64).map(|i| i as u16)
}

/// Encodes `sign * (constant + natural_units * sizeof(UINTN))` as a 32-bit natural index.
pub fn encode_index32(negative: bool, constant: u32, natural_units: u32) -> Option<u32> {
    encode(32, 4, negative, constant as u64, natural_units as u64).map(|i| i as u32)
}

/// Encodes `sign * (constant + natural_units * sizeof(UINTN))` as a 64-bit natural index.
pub fn encode_index64(negative: bool, constant: u64, natural_units: u64) -> Option<u64> {
    encode(64, 8, negative, constant, natural_units)
}

impl VmContext<'_> {
    /// Reports an access to unmapped guest memory, which is fatal to the running image.
    pub(crate) fn bus_fault(&mut self, f: MemoryFault) -> VmExit {
        log::warn!("EBC access to unmapped address {:#x}\n", f.address);
        match self.signal_exception(ExceptionType::Undefined, EXCEPTION_FLAG_FATAL) {
            Err(e) => e,
            Ok(()) => VmExit::Fault(crate::status::Status::EFI_UNSUPPORTED),
        }
    }

    fn code_load(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), VmExit> {
        let addr = self.state.ip.wrapping_add(offset);
        self.host
            .memory()
            .load(addr, buf)
            .map_err(|f| self.bus_fault(f))
    }

    fn code_aligned(&self, offset: u64, size: u64) -> bool {
        self.state.ip.wrapping_add(offset) & (size - 1) == 0
    }

    pub(crate) fn read_code8(&mut self, offset: u64) -> Result<u8, VmExit> {
        let mut b = [0u8; 1];
        self.code_load(offset, &mut b)?;
        Ok(b[0])
    }

    /// Code words are expected to be aligned. A misaligned one is reported with a warning, and
    /// read a byte at a time.
    pub(crate) fn read_code16(&mut self, offset: u64) -> Result<u16, VmExit> {
        let mut b = [0u8; 2];
        if self.code_aligned(offset, 2) {
            self.code_load(offset, &mut b)?;
        } else {
            self.signal_exception(ExceptionType::AlignmentCheck, EXCEPTION_FLAG_WARNING)?;
            b[0] = self.read_code8(offset)?;
            b[1] = self.read_code8(offset + 1)?;
        }
        Ok(u16::from_le_bytes(b))
    }

    pub(crate) fn read_code32(&mut self, offset: u64) -> Result<u32, VmExit> {
        if self.code_aligned(offset, 4) {
            let mut b = [0u8; 4];
            self.code_load(offset, &mut b)?;
            return Ok(u32::from_le_bytes(b));
        }
        let lo = self.read_code16(offset)? as u32;
        let hi = self.read_code16(offset + 2)? as u32;
        Ok(lo | hi << 16)
    }

    pub(crate) fn read_code64(&mut self, offset: u64) -> Result<u64, VmExit> {
        if self.code_aligned(offset, 8) {
            let mut b = [0u8; 8];
            self.code_load(offset, &mut b)?;
            return Ok(u64::from_le_bytes(b));
        }
        let lo = self.read_code32(offset)? as u64;
        let hi = self.read_code32(offset + 4)? as u64;
        Ok(lo | hi << 32)
    }

    pub(crate) fn read_immed8(&mut self, offset: u64) -> Result<i8, VmExit> {
        Ok(self.read_code8(offset)? as i8)
    }

    pub(crate) fn read_immed16(&mut self, offset: u64) -> Result<i16, VmExit> {
        Ok(self.read_code16(offset)? as i16)
    }

    pub(crate) fn read_immed32(&mut self, offset: u64) -> Result<i32, VmExit> {
        Ok(self.read_code32(offset)? as i32)
    }

    pub(crate) fn read_immed64(&mut self, offset: u64) -> Result<i64, VmExit> {
        Ok(self.read_code64(offset)? as i64)
    }

    pub(crate) fn read_index16(&mut self, offset: u64) -> Result<i16, VmExit> {
        let index = self.read_code16(offset)?;
        Ok(decode_index16(index, self.natural))
    }

    pub(crate) fn read_index32(&mut self, offset: u64) -> Result<i32, VmExit> {
        let index = self.read_code32(offset)?;
        Ok(decode_index32(index, self.natural))
    }

    pub(crate) fn read_index64(&mut self, offset: u64) -> Result<i64, VmExit> {
        let index = self.read_code64(offset)?;
        Ok(decode_index64(index, self.natural))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebcvm::tests::FlatHost;
    use alloc::rc::Rc;
    use core::cell::Cell;
    use rand::Rng;

    #[test]
    fn known_index16_values() {
        // +8: one natural unit on a 64-bit host, NBits field = 1 (2 bits)
        assert_eq!(decode_index16(0x1001, 8), 8);
        assert_eq!(decode_index16(0x1001, 4), 4);
        // constant only
        assert_eq!(decode_index16(0x0010, 8), 16);
        // sign bit
        assert_eq!(decode_index16(0x9001, 8), -8);
        // 3 natural units + 2 constant units with 4 bits of natural units
        assert_eq!(decode_index16(0x2023, 8), 26);
        assert_eq!(decode_index16(0x7fff, 8), 0x7fff_i16.wrapping_sub(0x7000) * 8);
    }

    #[test]
    fn natural_index16_round_trip() {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let nbits = 2 * rng.gen_range(0..=6u32);
            let n = rng.gen_range(0..(1u16 << nbits));
            let c = rng.gen_range(0..(1u32 << (12 - nbits))) as u16;
            let neg = rng.gen::<bool>();
            let idx = encode_index16(neg, c, n).unwrap();
            for natural in [4usize, 8] {
                let magnitude = c as i16 + n as i16 * natural as i16;
                let expected = if neg { -magnitude } else { magnitude };
                assert_eq!(decode_index16(idx, natural), expected, "{idx:#x}");
            }
        }
    }

    #[test]
    fn natural_index32_and_64_round_trip() {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let n = rng.gen_range(0..0x0100_0000u32);
            let c = rng.gen_range(0..0x10_0000u32);
            let neg = rng.gen::<bool>();
            let idx = encode_index32(neg, c, n).unwrap();
            let magnitude = c as i32 + n as i32 * 8;
            assert_eq!(
                decode_index32(idx, 8),
                if neg { -magnitude } else { magnitude }
            );

            let n = rng.gen::<u32>() as u64;
            let c = rng.gen::<u32>() as u64;
            let idx = encode_index64(neg, c, n).unwrap();
            let magnitude = c as i64 + n as i64 * 4;
            assert_eq!(
                decode_index64(idx, 4),
                if neg { -magnitude } else { magnitude }
            );
        }
    }

    #[test]
    fn unencodable_index() {
        assert_eq!(encode_index16(false, 0x1000, 0), None);
        assert_eq!(encode_index16(false, 1, 0x1000), None);
        assert_eq!(encode_index16(false, 0xfff, 0), Some(0x0fff));
    }

    #[test]
    fn misaligned_code_reads_warn_and_succeed() {
        let host = FlatHost::new(0x1000, 0x1000);
        let interp = EbcInterpreter::new(EbcConfig::default()).unwrap();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        interp
            .register_exception_callback(
                ExceptionType::AlignmentCheck as u32,
                Some(Rc::new(move |_, _| h.set(h.get() + 1))),
            )
            .unwrap();
        host.write(0x1101, &[0x34, 0x12, 0x78, 0x56]);
        let mut vm = VmContext::new(&host, &interp, 0x1100, 0x1800..0x2000).unwrap();
        assert_eq!(vm.read_code16(1).unwrap(), 0x1234);
        assert_eq!(hits.get(), 1);
        assert_eq!(vm.read_code32(1).unwrap(), 0x5678_1234);
        assert_eq!(hits.get(), 3);
        assert_eq!(vm.read_immed16(2).unwrap(), 0x7812);
    }
}
