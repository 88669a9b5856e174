// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

use crate::ebcvm::*;
use crate::status::Status;

use core::sync::atomic::{fence, Ordering};
use log::{trace, warn};

const OPCODE_M_OPCODE: u8 = 0x3F;
const OPCODE_M_IMMDATA: u8 = 0x80;
const OPCODE_M_IMMDATA64: u8 = 0x40;
const OPCODE_M_64BIT: u8 = 0x40;
const OPCODE_M_IMMED_OP1: u8 = 0x80;
const OPCODE_M_IMMED_OP2: u8 = 0x40;
const OPCODE_M_CMPI64: u8 = 0x40;
const OPCODE_M_CMPI32_DATA: u8 = 0x80;

const PUSHPOP_M_IMMDATA: u8 = 0x80;
const PUSHPOP_M_64: u8 = 0x40;
const DATAMANIP_M_IMMDATA: u8 = 0x80;
const DATAMANIP_M_64: u8 = 0x40;

const CONDITION_M_CONDITIONAL: u8 = 0x80;
const JMP_M_CS: u8 = 0x40;
const JMP_M_RELATIVE: u8 = 0x10;

const OPERAND_M_RELATIVE_ADDR: u8 = 0x10;
const OPERAND_M_NATIVE_CALL: u8 = 0x20;
const OPERAND_M_CMPI_INDEX: u8 = 0x10;

const MOVI_M_IMMDATA: u8 = 0x40;
const MOVI_M_DATAWIDTH: u8 = 0xC0;
const MOVI_DATAWIDTH16: u8 = 0x40;
const MOVI_DATAWIDTH32: u8 = 0x80;
const MOVI_DATAWIDTH64: u8 = 0xC0;
const MOVI_M_MOVEWIDTH: u8 = 0x30;
const MOVI_MOVEWIDTH8: u8 = 0x00;
const MOVI_MOVEWIDTH16: u8 = 0x10;
const MOVI_MOVEWIDTH32: u8 = 0x20;

/// Instruction lengths of JMP, indexed by the immediate data bits of the opcode byte
const JMP_LEN: [u64; 4] = [2, 2, 6, 10];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Opcode {
    Break = 0x00,
    Jmp = 0x01,
    Jmp8 = 0x02,
    Call = 0x03,
    Ret = 0x04,
    CmpEq = 0x05,
    CmpLte = 0x06,
    CmpGte = 0x07,
    CmpUlte = 0x08,
    CmpUgte = 0x09,
    Not = 0x0A,
    Neg = 0x0B,
    Add = 0x0C,
    Sub = 0x0D,
    Mul = 0x0E,
    Mulu = 0x0F,
    Div = 0x10,
    Divu = 0x11,
    Mod = 0x12,
    Modu = 0x13,
    And = 0x14,
    Or = 0x15,
    Xor = 0x16,
    Shl = 0x17,
    Shr = 0x18,
    Ashr = 0x19,
    Extndb = 0x1A,
    Extndw = 0x1B,
    Extndd = 0x1C,
    Movbw = 0x1D,
    Movww = 0x1E,
    Movdw = 0x1F,
    Movqw = 0x20,
    Movbd = 0x21,
    Movwd = 0x22,
    Movdd = 0x23,
    Movqd = 0x24,
    Movsnw = 0x25,
    Movsnd = 0x26,
    Movqq = 0x28,
    Loadsp = 0x29,
    Storesp = 0x2A,
    Push = 0x2B,
    Pop = 0x2C,
    CmpiEq = 0x2D,
    CmpiLte = 0x2E,
    CmpiGte = 0x2F,
    CmpiUlte = 0x30,
    CmpiUgte = 0x31,
    Movnw = 0x32,
    Movnd = 0x33,
    Pushn = 0x35,
    Popn = 0x36,
    Movi = 0x37,
    Movin = 0x38,
    Movrel = 0x39,
}

impl Opcode {
    fn decode(opcode: u8) -> Option<Opcode> {
        use Opcode::*;
        Some(match opcode & OPCODE_M_OPCODE {
            0x00 => Break,
            0x01 => Jmp,
            0x02 => Jmp8,
            0x03 => Call,
            0x04 => Ret,
            0x05 => CmpEq,
            0x06 => CmpLte,
            0x07 => CmpGte,
            0x08 => CmpUlte,
            0x09 => CmpUgte,
            0x0A => Not,
            0x0B => Neg,
            0x0C => Add,
            0x0D => Sub,
            0x0E => Mul,
            0x0F => Mulu,
            0x10 => Div,
            0x11 => Divu,
            0x12 => Mod,
            0x13 => Modu,
            0x14 => And,
            0x15 => Or,
            0x16 => Xor,
            0x17 => Shl,
            0x18 => Shr,
            0x19 => Ashr,
            0x1A => Extndb,
            0x1B => Extndw,
            0x1C => Extndd,
            0x1D => Movbw,
            0x1E => Movww,
            0x1F => Movdw,
            0x20 => Movqw,
            0x21 => Movbd,
            0x22 => Movwd,
            0x23 => Movdd,
            0x24 => Movqd,
            0x25 => Movsnw,
            0x26 => Movsnd,
            0x28 => Movqq,
            0x29 => Loadsp,
            0x2A => Storesp,
            0x2B => Push,
            0x2C => Pop,
            0x2D => CmpiEq,
            0x2E => CmpiLte,
            0x2F => CmpiGte,
            0x30 => CmpiUlte,
            0x31 => CmpiUgte,
            0x32 => Movnw,
            0x33 => Movnd,
            0x35 => Pushn,
            0x36 => Popn,
            0x37 => Movi,
            0x38 => Movin,
            0x39 => Movrel,
            _ => return None,
        })
    }

    /// Whether the data manipulation instruction sign extends 32-bit operands
    fn is_signed(self) -> bool {
        use Opcode::*;
        matches!(self, Neg | Add | Sub | Mul | Div | Mod | Ashr)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MoveSize {
    Byte,
    Word,
    Dword,
    Qword,
    Natural,
}

fn op1_reg(operands: u8) -> usize {
    (operands & 0x07) as usize
}

fn op1_indirect(operands: u8) -> bool {
    operands & 0x08 != 0
}

fn op2_reg(operands: u8) -> usize {
    ((operands >> 4) & 0x07) as usize
}

fn op2_indirect(operands: u8) -> bool {
    operands & 0x80 != 0
}

fn offset(base: u64, index: i64) -> u64 {
    base.wrapping_add(index as u64)
}

fn ext32(v: u64, signed: bool) -> u64 {
    if signed {
        v as u32 as i32 as i64 as u64
    } else {
        v as u32 as u64
    }
}

impl VmContext<'_> {
    /// Runs the VM until the code returns to its caller, or a fatal exception occurs.
    pub fn execute(&mut self) -> Result<(), VmExit> {
        let mut stack_corrupted = self.read_stack_magic() != Some(VM_STACK_KEY_VALUE);

        self.state.frame_ptr = self.state.r[0].wrapping_add(8);
        self.state.entry_point = self.state.ip;
        self.state.stop_flags = 0;

        while self.state.stop_flags & STOPFLAG_APP_DONE == 0 {
            let opcode = self.read_code8(0)?;
            let Some(op) = Opcode::decode(opcode) else {
                return self.fault(ExceptionType::InvalidOpcode);
            };
            trace!("{:#x}: {:?} ({:#04x})\n", self.state.ip, op, opcode);

            fence(Ordering::SeqCst);
            self.dispatch(op)?;
            fence(Ordering::SeqCst);

            if self.state.flags & VMFLAGS_STEP != 0 {
                self.signal_exception(ExceptionType::Step, EXCEPTION_FLAG_NONE)?;
            }

            // A corrupted stack is reported once, but does not stop execution
            if !stack_corrupted
                && (self.read_stack_magic() != Some(VM_STACK_KEY_VALUE)
                    || self.state.r[0] <= self.state.stack_top)
            {
                stack_corrupted = true;
                if self
                    .signal_exception(ExceptionType::StackFault, EXCEPTION_FLAG_FATAL)
                    .is_err()
                {
                    warn!("EBC stack corrupted, R0 == {:#x}\n", self.state.r[0]);
                }
            }
        }
        Ok(())
    }

    fn fault<T>(&mut self, exception: ExceptionType) -> Result<T, VmExit> {
        self.signal_exception(exception, EXCEPTION_FLAG_FATAL)?;
        Err(VmExit::Fault(Status::EFI_UNSUPPORTED))
    }

    fn dispatch(&mut self, op: Opcode) -> Result<(), VmExit> {
        use Opcode::*;
        match op {
            Break => self.exec_break(),
            Jmp => self.exec_jmp(),
            Jmp8 => self.exec_jmp8(),
            Call => self.exec_call(),
            Ret => self.exec_ret(),
            CmpEq | CmpLte | CmpGte | CmpUlte | CmpUgte => self.exec_cmp(op),
            Not | Neg | Add | Sub | Mul | Mulu | Div | Divu | Mod | Modu | And | Or | Xor
            | Shl | Shr | Ashr | Extndb | Extndw | Extndd => self.exec_data_manip(op),
            Movbw | Movww | Movdw | Movqw | Movbd | Movwd | Movdd | Movqd | Movqq | Movnw
            | Movnd => self.exec_movxx(op),
            Movsnw => self.exec_movsn(false),
            Movsnd => self.exec_movsn(true),
            Loadsp => self.exec_loadsp(),
            Storesp => self.exec_storesp(),
            Push => self.exec_push(),
            Pop => self.exec_pop(),
            CmpiEq | CmpiLte | CmpiGte | CmpiUlte | CmpiUgte => self.exec_cmpi(op),
            Pushn => self.exec_pushn(),
            Popn => self.exec_popn(),
            Movi => self.exec_movi(),
            Movin => self.exec_movin(),
            Movrel => self.exec_movrel(),
        }
    }

    fn operands(&mut self) -> Result<(u8, u8), VmExit> {
        Ok((self.read_code8(0)?, self.read_code8(1)?))
    }

    fn read_sized(&mut self, addr: u64, size: MoveSize) -> Result<u64, VmExit> {
        Ok(match size {
            MoveSize::Byte => self.read_mem8(addr)? as u64,
            MoveSize::Word => self.read_mem16(addr)? as u64,
            MoveSize::Dword => self.read_mem32(addr)? as u64,
            MoveSize::Qword => self.read_mem64(addr)?,
            MoveSize::Natural => self.read_memn(addr)?,
        })
    }

    fn write_sized(&mut self, addr: u64, size: MoveSize, data: u64) -> Result<(), VmExit> {
        match size {
            MoveSize::Byte => self.write_mem8(addr, data as u8),
            MoveSize::Word => self.write_mem16(addr, data as u16),
            MoveSize::Dword => self.write_mem32(addr, data as u32),
            MoveSize::Qword => self.write_mem64(addr, data),
            MoveSize::Natural => self.write_memn(addr, data),
        }
    }

    /// MOV[b|w|d|q|n]{w|d} {@}R1 {Index16|32}, {@}R2 {Index16|32}
    /// MOVqq {@}R1 {Index64}, {@}R2 {Index64}
    fn exec_movxx(&mut self, op: Opcode) -> Result<(), VmExit> {
        use Opcode::*;
        let (opcode, operands) = self.operands()?;
        let mut index1 = 0i64;
        let mut index2 = 0i64;
        let mut size = 2u64;

        if opcode & (OPCODE_M_IMMED_OP1 | OPCODE_M_IMMED_OP2) != 0 {
            if op <= Movqw || op == Movnw {
                if opcode & OPCODE_M_IMMED_OP1 != 0 {
                    index1 = self.read_index16(2)? as i64;
                    size += 2;
                }
                if opcode & OPCODE_M_IMMED_OP2 != 0 {
                    index2 = self.read_index16(size)? as i64;
                    size += 2;
                }
            } else if op <= Movqd || op == Movnd {
                if opcode & OPCODE_M_IMMED_OP1 != 0 {
                    index1 = self.read_index32(2)? as i64;
                    size += 4;
                }
                if opcode & OPCODE_M_IMMED_OP2 != 0 {
                    index2 = self.read_index32(size)? as i64;
                    size += 4;
                }
            } else {
                if opcode & OPCODE_M_IMMED_OP1 != 0 {
                    index1 = self.read_index64(2)?;
                    size += 8;
                }
                if opcode & OPCODE_M_IMMED_OP2 != 0 {
                    index2 = self.read_index64(size)?;
                    size += 8;
                }
            }
        }

        let (move_size, mask) = match op {
            Movbw | Movbd => (MoveSize::Byte, 0xFF),
            Movww | Movwd => (MoveSize::Word, 0xFFFF),
            Movdw | Movdd => (MoveSize::Dword, 0xFFFF_FFFF),
            Movqw | Movqd | Movqq => (MoveSize::Qword, u64::MAX),
            _ => (MoveSize::Natural, self.natural_mask()),
        };

        let src = offset(self.state.r[op2_reg(operands)], index2);
        let data = if op2_indirect(operands) {
            self.read_sized(src, move_size)?
        } else {
            src
        };

        if op1_indirect(operands) {
            let dst = offset(self.state.r[op1_reg(operands)], index1);
            self.write_sized(dst, move_size, data)?;
        } else {
            if opcode & OPCODE_M_IMMED_OP1 != 0 {
                return self.fault(ExceptionType::InstructionEncoding);
            }
            self.state.r[op1_reg(operands)] = data & mask;
        }
        self.state.ip += size;
        Ok(())
    }

    /// MOVsn{w|d} {@}R1 {Index16|32}, {@}R2 {Index16|32|Immed16|32}
    ///
    /// Moves a signed natural value, sign extending it when the destination is a register.
    fn exec_movsn(&mut self, dword: bool) -> Result<(), VmExit> {
        let (opcode, operands) = self.operands()?;
        let width = if dword { 4 } else { 2 };
        let mut index1 = 0i64;
        let mut index2 = 0i64;
        let mut size = 2u64;

        if opcode & OPCODE_M_IMMED_OP1 != 0 {
            if !op1_indirect(operands) {
                return self.fault(ExceptionType::InstructionEncoding);
            }
            index1 = if dword {
                self.read_index32(2)? as i64
            } else {
                self.read_index16(2)? as i64
            };
            size += width;
        }
        if opcode & OPCODE_M_IMMED_OP2 != 0 {
            index2 = match (dword, op2_indirect(operands)) {
                (false, true) => self.read_index16(size)? as i64,
                (false, false) => self.read_immed16(size)? as i64,
                (true, true) => self.read_index32(size)? as i64,
                (true, false) => self.read_immed32(size)? as i64,
            };
            size += width;
        }

        let mut data = self.sext_natural(offset(self.state.r[op2_reg(operands)], index2));
        if op2_indirect(operands) {
            let v = self.read_memn(data)?;
            data = self.sext_natural(v);
        }

        if op1_indirect(operands) {
            let dst = offset(self.state.r[op1_reg(operands)], index1);
            self.write_memn(dst, data)?;
        } else {
            self.state.r[op1_reg(operands)] = data;
        }
        self.state.ip += size;
        Ok(())
    }

    /// Decodes the optional index and the immediate data shared by MOVI, MOVIn and MOVREL.
    /// Returns the operand 1 index, the location and width of the immediate data.
    fn movi_layout(&mut self, opcode: u8, operands: u8) -> Result<(i64, u64, u64), VmExit> {
        let (index, at) = if operands & MOVI_M_IMMDATA != 0 {
            (self.read_index16(2)? as i64, 4)
        } else {
            (0, 2)
        };
        let width = match opcode & MOVI_M_DATAWIDTH {
            MOVI_DATAWIDTH16 => 2,
            MOVI_DATAWIDTH32 => 4,
            MOVI_DATAWIDTH64 => 8,
            _ => return self.fault(ExceptionType::InstructionEncoding),
        };
        if !op1_indirect(operands) && operands & MOVI_M_IMMDATA != 0 {
            return self.fault(ExceptionType::InstructionEncoding);
        }
        Ok((index, at, width))
    }

    fn read_immed_sext(&mut self, at: u64, width: u64) -> Result<i64, VmExit> {
        Ok(match width {
            2 => self.read_immed16(at)? as i64,
            4 => self.read_immed32(at)? as i64,
            _ => self.read_immed64(at)?,
        })
    }

    /// MOVI[b|w|d|q][w|d|q] {@}R1 {Index16}, ImmData16|32|64
    fn exec_movi(&mut self) -> Result<(), VmExit> {
        let (opcode, operands) = self.operands()?;
        let (index, at, width) = self.movi_layout(opcode, operands)?;
        let data = self.read_immed_sext(at, width)? as u64;

        let move_size = match operands & MOVI_M_MOVEWIDTH {
            MOVI_MOVEWIDTH8 => MoveSize::Byte,
            MOVI_MOVEWIDTH16 => MoveSize::Word,
            MOVI_MOVEWIDTH32 => MoveSize::Dword,
            _ => MoveSize::Qword,
        };
        if op1_indirect(operands) {
            let dst = offset(self.state.r[op1_reg(operands)], index);
            self.write_sized(dst, move_size, data)?;
        } else {
            let mask = match move_size {
                MoveSize::Byte => 0xFF,
                MoveSize::Word => 0xFFFF,
                MoveSize::Dword => 0xFFFF_FFFF,
                _ => u64::MAX,
            };
            self.state.r[op1_reg(operands)] = data & mask;
        }
        self.state.ip += at + width;
        Ok(())
    }

    /// MOVIn[w|d|q] {@}R1 {Index16}, Index16|32|64
    fn exec_movin(&mut self) -> Result<(), VmExit> {
        let (opcode, operands) = self.operands()?;
        let (index, at, width) = self.movi_layout(opcode, operands)?;
        let data = match width {
            2 => self.read_index16(at)? as i64,
            4 => self.read_index32(at)? as i64,
            _ => self.read_index64(at)?,
        } as u64;

        if op1_indirect(operands) {
            let dst = offset(self.state.r[op1_reg(operands)], index);
            self.write_memn(dst, data)?;
        } else {
            self.state.r[op1_reg(operands)] = data;
        }
        self.state.ip += at + width;
        Ok(())
    }

    /// MOVREL[w|d|q] {@}R1 {Index16}, ImmData16|32|64
    ///
    /// Loads the address of the IP relative location `ImmData` bytes past the end of the
    /// instruction.
    fn exec_movrel(&mut self) -> Result<(), VmExit> {
        let (opcode, operands) = self.operands()?;
        let (index, at, width) = self.movi_layout(opcode, operands)?;
        let imm = self.read_immed_sext(at, width)?;
        let size = at + width;
        let data = offset(self.state.ip, imm).wrapping_add(size);

        if op1_indirect(operands) {
            let dst = offset(self.state.r[op1_reg(operands)], index);
            self.write_memn(dst, data)?;
        } else {
            self.state.r[op1_reg(operands)] = data;
        }
        self.state.ip += size;
        Ok(())
    }

    /// Reads the optional 16-bit index or immediate of PUSH/POP style instructions, and
    /// advances IP past the instruction.
    fn pushpop_index(&mut self, opcode: u8, operands: u8) -> Result<i64, VmExit> {
        if opcode & PUSHPOP_M_IMMDATA != 0 {
            let index = if op1_indirect(operands) {
                self.read_index16(2)?
            } else {
                self.read_immed16(2)?
            };
            self.state.ip += 4;
            Ok(index as i64)
        } else {
            self.state.ip += 2;
            Ok(0)
        }
    }

    /// PUSHn {@}R1 {Index16|Immed16}
    fn exec_pushn(&mut self) -> Result<(), VmExit> {
        let (opcode, operands) = self.operands()?;
        let index = self.pushpop_index(opcode, operands)?;
        let addr = offset(self.state.r[op1_reg(operands)], index);
        let data = if op1_indirect(operands) {
            self.read_memn(addr)?
        } else {
            addr & self.natural_mask()
        };
        self.state.r[0] = self.state.r[0].wrapping_sub(self.natural as u64);
        self.write_memn(self.state.r[0], data)
    }

    /// PUSH[32|64] {@}R1 {Index16|Immed16}
    fn exec_push(&mut self) -> Result<(), VmExit> {
        let (opcode, operands) = self.operands()?;
        let index = self.pushpop_index(opcode, operands)?;
        let addr = offset(self.state.r[op1_reg(operands)], index);
        if opcode & PUSHPOP_M_64 != 0 {
            let data = if op1_indirect(operands) {
                self.read_mem64(addr)?
            } else {
                addr
            };
            self.state.r[0] = self.state.r[0].wrapping_sub(8);
            self.write_mem64(self.state.r[0], data)
        } else {
            let data = if op1_indirect(operands) {
                self.read_mem32(addr)?
            } else {
                addr as u32
            };
            self.state.r[0] = self.state.r[0].wrapping_sub(4);
            self.write_mem32(self.state.r[0], data)
        }
    }

    /// POPn {@}R1 {Index16|Immed16}
    fn exec_popn(&mut self) -> Result<(), VmExit> {
        let (opcode, operands) = self.operands()?;
        let index = self.pushpop_index(opcode, operands)?;
        let data = self.read_memn(self.state.r[0])?;
        self.state.r[0] = self.state.r[0].wrapping_add(self.natural as u64);
        if op1_indirect(operands) {
            let dst = offset(self.state.r[op1_reg(operands)], index);
            self.write_memn(dst, data)
        } else {
            self.state.r[op1_reg(operands)] = offset(data, index) & self.natural_mask();
            Ok(())
        }
    }

    /// POP[32|64] {@}R1 {Index16|Immed16}
    fn exec_pop(&mut self) -> Result<(), VmExit> {
        let (opcode, operands) = self.operands()?;
        let index = self.pushpop_index(opcode, operands)?;
        let dst = offset(self.state.r[op1_reg(operands)], index);
        if opcode & PUSHPOP_M_64 != 0 {
            let data = self.read_mem64(self.state.r[0])?;
            self.state.r[0] = self.state.r[0].wrapping_add(8);
            if op1_indirect(operands) {
                return self.write_mem64(dst, data);
            }
            self.state.r[op1_reg(operands)] = offset(data, index);
        } else {
            let data = self.read_mem32(self.state.r[0])?;
            self.state.r[0] = self.state.r[0].wrapping_add(4);
            if op1_indirect(operands) {
                return self.write_mem32(dst, data);
            }
            self.state.r[op1_reg(operands)] = offset(data as i32 as i64 as u64, index);
        }
        Ok(())
    }

    /// CALL64 Immed64
    /// CALL32 {@}R1 {Immed32|Index32}
    /// CALLEX64 Immed64
    /// CALLEX32 {@}R1 {Immed32}
    fn exec_call(&mut self) -> Result<(), VmExit> {
        let (opcode, operands) = self.operands()?;
        let frame_ptr = self.state.frame_ptr;
        let native = operands & OPERAND_M_NATIVE_CALL != 0;
        let mut immed64 = 0u64;
        let mut immed32 = 0i32;
        let size = if opcode & OPCODE_M_IMMDATA != 0 {
            if opcode & OPCODE_M_IMMDATA64 != 0 {
                immed64 = self.read_immed64(2)? as u64;
                10
            } else {
                immed32 = if op1_indirect(operands) {
                    self.read_index32(2)?
                } else {
                    self.read_immed32(2)?
                };
                6
            }
        } else {
            2
        };

        if !native {
            self.push_call_record(frame_ptr, self.state.ip + size)?;
        }

        if opcode & OPCODE_M_IMMDATA64 != 0 {
            if !native {
                self.state.ip = immed64;
                return Ok(());
            }
            return self.call_ex(immed64, size, frame_ptr);
        }

        if op1_reg(operands) != 0 {
            immed64 = self.state.r[op1_reg(operands)];
        }
        let target = if op1_indirect(operands) {
            self.read_memn(offset(immed64, immed32 as i64))?
        } else {
            offset(immed64, immed32 as i64)
        };

        match (native, operands & OPERAND_M_RELATIVE_ADDR != 0) {
            (false, true) => {
                self.state.ip = self.state.ip.wrapping_add(target).wrapping_add(size);
                Ok(())
            }
            (false, false) => {
                self.state.ip = target;
                Ok(())
            }
            (true, true) => {
                let target = target.wrapping_add(self.state.ip).wrapping_add(size);
                self.call_ex(target, size, frame_ptr)
            }
            (true, false) => self.call_ex(target, size, frame_ptr),
        }
    }

    fn push_call_record(&mut self, frame_ptr: u64, ret: u64) -> Result<(), VmExit> {
        self.state.r[0] = self.state.r[0].wrapping_sub(8);
        self.write_memn(self.state.r[0], frame_ptr)?;
        self.state.frame_ptr = self.state.r[0];
        self.state.r[0] = self.state.r[0].wrapping_sub(8);
        self.write_mem64(self.state.r[0], ret)
    }

    /// Calls out of the VM. Calls into thunks are turned into EBC-to-EBC calls on the current VM
    /// stack; anything else is handed to the host, which finds the arguments on the VM stack.
    fn call_ex(&mut self, target: u64, size: u64, frame_ptr: u64) -> Result<(), VmExit> {
        if let Some(entry) = self.interp.thunk_target(target) {
            self.push_call_record(frame_ptr, self.state.ip + size)?;
            self.state.ip = entry;
            return Ok(());
        }

        let host = self.host;
        let args = NativeArgs::new(host.memory(), self.state.r[0], self.natural);
        match host.call_native(target, &args) {
            Ok(ret) => {
                self.state.r[7] = ret;
                self.state.ip += size;
                Ok(())
            }
            Err(VmExit::Fault(status)) => {
                warn!("Native call to {target:#x} failed: {status:?}\n");
                self.fault(ExceptionType::Undefined)
            }
            Err(exit) => Err(exit),
        }
    }

    fn exec_ret(&mut self) -> Result<(), VmExit> {
        if self.state.r[0] == self.state.stack_ret_addr {
            self.state.stop_flags |= STOPFLAG_APP_DONE;
            return Ok(());
        }
        if self.state.r[0] & 1 != 0 {
            return self.fault(ExceptionType::AlignmentCheck);
        }
        self.state.ip = self.read_mem64(self.state.r[0])?;
        self.state.r[0] = self.state.r[0].wrapping_add(8);
        self.state.frame_ptr = self.read_memn(self.state.r[0])?;
        self.state.r[0] = self.state.r[0].wrapping_add(8);
        Ok(())
    }

    fn set_cc(&mut self, flag: bool) {
        if flag {
            self.state.flags |= VMFLAGS_CC;
        } else {
            self.state.flags &= !VMFLAGS_CC;
        }
    }

    /// CMP[32|64][eq|lte|gte|ulte|ugte] R1, {@}R2 {Index16|Immed16}
    fn exec_cmp(&mut self, op: Opcode) -> Result<(), VmExit> {
        let (opcode, operands) = self.operands()?;
        let (index, size) = if opcode & OPCODE_M_IMMDATA != 0 {
            let index = if op2_indirect(operands) {
                self.read_index16(2)?
            } else {
                self.read_immed16(2)?
            };
            (index as i64, 4)
        } else {
            (0, 2)
        };

        let op1 = self.state.r[op1_reg(operands)];
        let addr = offset(self.state.r[op2_reg(operands)], index);
        let op2 = if !op2_indirect(operands) {
            addr
        } else if opcode & OPCODE_M_64BIT != 0 {
            self.read_mem64(addr)?
        } else {
            self.read_mem32(addr)? as u64
        };

        let flag = if opcode & OPCODE_M_64BIT != 0 {
            match op {
                Opcode::CmpEq => op1 == op2,
                Opcode::CmpLte => (op1 as i64) <= (op2 as i64),
                Opcode::CmpGte => (op1 as i64) >= (op2 as i64),
                Opcode::CmpUlte => op1 <= op2,
                _ => op1 >= op2,
            }
        } else {
            match op {
                Opcode::CmpEq => op1 as u32 == op2 as u32,
                Opcode::CmpLte => (op1 as i32) <= (op2 as i32),
                Opcode::CmpGte => (op1 as i32) >= (op2 as i32),
                Opcode::CmpUlte => op1 as u32 <= op2 as u32,
                _ => op1 as u32 >= op2 as u32,
            }
        };
        self.set_cc(flag);
        self.state.ip += size;
        Ok(())
    }

    /// CMPI[32|64]{w|d}[eq|lte|gte|ulte|ugte] {@}R1 {Index16}, Immed16|Immed32
    fn exec_cmpi(&mut self, op: Opcode) -> Result<(), VmExit> {
        let (opcode, operands) = self.operands()?;
        let mut size = 2;
        let index = if operands & OPERAND_M_CMPI_INDEX != 0 {
            size += 2;
            self.read_index16(2)? as i64
        } else {
            0
        };

        let mut op1 = self.state.r[op1_reg(operands)];
        if op1_indirect(operands) {
            let addr = offset(op1, index);
            op1 = if opcode & OPCODE_M_CMPI64 != 0 {
                self.read_mem64(addr)?
            } else {
                self.read_mem32(addr)? as u64
            };
        } else if operands & OPERAND_M_CMPI_INDEX != 0 {
            // an index on a register operand is an encoding error, but not a fatal one
            self.signal_exception(ExceptionType::InstructionEncoding, EXCEPTION_FLAG_ERROR)?;
            self.state.ip += size;
            return Ok(());
        }

        let op2 = if opcode & OPCODE_M_CMPI32_DATA != 0 {
            let v = self.read_immed32(size)? as i64;
            size += 4;
            v
        } else {
            let v = self.read_immed16(size)? as i64;
            size += 2;
            v
        };

        let flag = if opcode & OPCODE_M_CMPI64 != 0 {
            let op1 = op1 as i64;
            match op {
                Opcode::CmpiEq => op1 == op2,
                Opcode::CmpiLte => op1 <= op2,
                Opcode::CmpiGte => op1 >= op2,
                Opcode::CmpiUlte => op1 as u64 <= op2 as u32 as u64,
                _ => op1 as u64 >= op2 as u32 as u64,
            }
        } else {
            match op {
                Opcode::CmpiEq => op1 as i32 as i64 == op2,
                Opcode::CmpiLte => (op1 as i32 as i64) <= op2,
                Opcode::CmpiGte => (op1 as i32 as i64) >= op2,
                Opcode::CmpiUlte => op1 as u32 <= op2 as u32,
                _ => op1 as u32 >= op2 as u32,
            }
        };
        self.set_cc(flag);
        self.state.ip += size;
        Ok(())
    }

    /// Data manipulation instructions: `OP[32|64] {@}R1, {@}R2 {Index16|Immed16}`
    fn exec_data_manip(&mut self, op: Opcode) -> Result<(), VmExit> {
        let (opcode, operands) = self.operands()?;
        let signed = op.is_signed();
        let is64 = opcode & DATAMANIP_M_64 != 0;
        let (index, size) = if opcode & DATAMANIP_M_IMMDATA != 0 {
            let index = if op2_indirect(operands) {
                self.read_index16(2)?
            } else {
                self.read_immed16(2)?
            };
            (index as i64, 4)
        } else {
            (0, 2)
        };

        let mut op2 = offset(self.state.r[op2_reg(operands)], index);
        if op2_indirect(operands) {
            op2 = if is64 {
                self.read_mem64(op2)?
            } else {
                ext32(self.read_mem32(op2)? as u64, signed)
            };
        } else if !is64 {
            op2 = ext32(op2, signed);
        }

        let mut op1 = self.state.r[op1_reg(operands)];
        if op1_indirect(operands) {
            op1 = if is64 {
                self.read_mem64(op1)?
            } else {
                ext32(self.read_mem32(op1)? as u64, signed)
            };
        } else if !is64 {
            op1 = ext32(op1, signed);
        }

        let result = match self.alu(op, is64, op1, op2) {
            Some(v) => v,
            None => return self.fault(ExceptionType::DivideError),
        };

        if op1_indirect(operands) {
            let dst = self.state.r[op1_reg(operands)];
            if is64 {
                self.write_mem64(dst, result)?;
            } else {
                self.write_mem32(dst, result as u32)?;
            }
        } else {
            self.state.r[op1_reg(operands)] = if is64 {
                result
            } else {
                result & 0xFFFF_FFFF
            };
        }
        self.state.ip += size;
        Ok(())
    }

    /// Returns `None` on division by zero
    fn alu(&self, op: Opcode, is64: bool, op1: u64, op2: u64) -> Option<u64> {
        use Opcode::*;
        if matches!(op, Div | Divu | Mod | Modu) && op2 == 0 {
            return None;
        }
        Some(match op {
            Not => !op2,
            Neg => (!op2).wrapping_add(1),
            Add => op1.wrapping_add(op2),
            Sub if is64 => op1.wrapping_sub(op2),
            Sub => (op1 as i32).wrapping_sub(op2 as i32) as i64 as u64,
            Mul if is64 => (op1 as i64).wrapping_mul(op2 as i64) as u64,
            Mul => (op1 as i32).wrapping_mul(op2 as i32) as i64 as u64,
            Mulu if is64 => op1.wrapping_mul(op2),
            Mulu => (op1 as u32).wrapping_mul(op2 as u32) as u64,
            Div if is64 => (op1 as i64).wrapping_div(op2 as i64) as u64,
            Div => (op1 as i32).wrapping_div(op2 as i32) as i64 as u64,
            Divu if is64 => op1 / op2,
            Divu => (op1 as u32 / op2 as u32) as u64,
            Mod => (op1 as i64).wrapping_rem(op2 as i64) as u64,
            Modu => op1 % op2,
            And => op1 & op2,
            Or => op1 | op2,
            Xor => op1 ^ op2,
            Shl if is64 => op1.wrapping_shl(op2 as u32),
            Shl => (op1 as u32).wrapping_shl(op2 as u32) as u64,
            Shr if is64 => op1.wrapping_shr(op2 as u32),
            Shr => (op1 as u32).wrapping_shr(op2 as u32) as u64,
            Ashr if is64 => (op1 as i64).wrapping_shr(op2 as u32) as u64,
            Ashr => (op1 as i32).wrapping_shr(op2 as u32) as i64 as u64,
            Extndb => op2 as i8 as i64 as u64,
            Extndw => op2 as i16 as i64 as u64,
            Extndd => op2 as i32 as i64 as u64,
            _ => return None,
        })
    }

    /// LOADSP [Flags], R2
    fn exec_loadsp(&mut self) -> Result<(), VmExit> {
        let (_, operands) = self.operands()?;
        if op1_reg(operands) == 0 {
            let v = self.state.r[op2_reg(operands)];
            self.state.flags = (self.state.flags & !VMFLAGS_ALL_VALID) | (v & VMFLAGS_ALL_VALID);
        } else {
            self.signal_exception(ExceptionType::InstructionEncoding, EXCEPTION_FLAG_WARNING)?;
        }
        self.state.ip += 2;
        Ok(())
    }

    /// STORESP R1, [IP|Flags]
    fn exec_storesp(&mut self) -> Result<(), VmExit> {
        let (_, operands) = self.operands()?;
        match op2_reg(operands) {
            0 => self.state.r[op1_reg(operands)] = self.state.flags & VMFLAGS_ALL_VALID,
            1 => self.state.r[op1_reg(operands)] = self.state.ip + 2,
            _ => {
                self.signal_exception(
                    ExceptionType::InstructionEncoding,
                    EXCEPTION_FLAG_WARNING,
                )?;
            }
        }
        self.state.ip += 2;
        Ok(())
    }

    fn exec_break(&mut self) -> Result<(), VmExit> {
        let (_, operands) = self.operands()?;
        match operands {
            // get the VM version
            1 => self.state.r[7] = self.interp.get_vm_version(),
            // debug breakpoint
            3 => {
                self.state.stop_flags |= STOPFLAG_BREAKPOINT;
                self.signal_exception(ExceptionType::Breakpoint, EXCEPTION_FLAG_NONE)?;
            }
            // system call, which is a nop here
            4 => {}
            // create a thunk for the EBC function whose relative offset R7 points to, and
            // replace the offset with the address of the thunk
            5 => {
                let at = self.state.r[7];
                let offset = self.read_mem32(at)? as i32 as i64;
                let entry = at.wrapping_add(offset as u64).wrapping_add(4);
                let thunk = self
                    .interp
                    .create_thunk(self.host, self.state.image_handle, entry, false)
                    .map_err(VmExit::Fault)?;
                self.write_mem64(at, thunk)?;
            }
            // compiler version
            6 => self.state.compiler_version = self.state.r[7] as u32,
            _ => return self.fault(ExceptionType::BadBreak),
        }
        self.state.ip += 2;
        Ok(())
    }

    fn condition_met(&self, conditional: bool, cs: bool) -> bool {
        !conditional || cs == (self.state.flags & VMFLAGS_CC != 0)
    }

    /// JMP64{cs|cc} Immed64
    /// JMP32{cs|cc} {@}R1 {Immed32|Index32}
    fn exec_jmp(&mut self) -> Result<(), VmExit> {
        let (opcode, operands) = self.operands()?;
        let size = JMP_LEN[(opcode >> 6) as usize & 3];

        if !self.condition_met(
            operands & CONDITION_M_CONDITIONAL != 0,
            operands & JMP_M_CS != 0,
        ) {
            self.state.ip += size;
            return Ok(());
        }

        if opcode & OPCODE_M_IMMDATA64 != 0 {
            if opcode & OPCODE_M_IMMDATA == 0 {
                self.signal_exception(ExceptionType::InstructionEncoding, EXCEPTION_FLAG_ERROR)?;
                return Err(VmExit::Fault(Status::EFI_UNSUPPORTED));
            }
            let target = self.read_immed64(2)? as u64;
            return self.jump_to(target, operands & JMP_M_RELATIVE != 0, size);
        }

        let index = if opcode & OPCODE_M_IMMDATA != 0 {
            if op1_indirect(operands) {
                self.read_index32(2)?
            } else {
                self.read_immed32(2)?
            }
        } else {
            0
        };

        let reg = match op1_reg(operands) {
            0 => 0,
            r => self.state.r[r],
        };
        let mut target = offset(reg, index as i64);
        if op1_indirect(operands) {
            target = self.read_memn(target)?;
        }
        self.jump_to(target, operands & JMP_M_RELATIVE != 0, size)
    }

    fn jump_to(&mut self, target: u64, relative: bool, size: u64) -> Result<(), VmExit> {
        if target & 1 != 0 {
            return self.fault(ExceptionType::AlignmentCheck);
        }
        self.state.ip = if relative {
            self.state.ip.wrapping_add(target).wrapping_add(size)
        } else {
            target
        };
        Ok(())
    }

    /// JMP8{cs|cc} Offset/2
    fn exec_jmp8(&mut self) -> Result<(), VmExit> {
        let (opcode, _) = self.operands()?;
        if !self.condition_met(
            opcode & CONDITION_M_CONDITIONAL != 0,
            opcode & JMP_M_CS != 0,
        ) {
            self.state.ip += 2;
            return Ok(());
        }
        let offset = self.read_immed8(1)? as i64;
        self.state.ip = self.state.ip.wrapping_add((offset * 2 + 2) as u64);
        Ok(())
    }
}
