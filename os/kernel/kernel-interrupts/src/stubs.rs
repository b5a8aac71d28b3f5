//! Interrupt entry stubs.
//!
//! Every vector gets a 16-byte stub that brings the stack into
//! [`IsrState`](crate::IsrState) shape and jumps to the common entry:
//!
//! ```text
//!   6A 00            push 0           ; only where the CPU pushes no error code
//!   68 vv 00 00 00   push vector
//!   EB rr / E9 rrrr  jmp  common      ; relative, encoded by distance
//!   CC ...           int3 padding
//! ```
//!
//! The table is built as plain bytes and copied to executable memory by
//! the kernel; the jump displacement depends on where both end up.

use crate::{JumpEncodeError, KnownExceptionVector, VECTOR_COUNT};

/// Bytes per stub; IDT gate `n` points at `base + n * STUB_SIZE`.
pub const STUB_SIZE: usize = 16;

const OP_NOP: u8 = 0x90;
const OP_JMP_REL8: u8 = 0xEB;
const OP_JMP_REL32: u8 = 0xE9;
const OP_PUSH_IMM8: u8 = 0x6A;
const OP_PUSH_IMM32: u8 = 0x68;
const OP_INT3: u8 = 0xCC;

/// How a jump from one location to another is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpEncoding {
    /// Source and target coincide.
    Nothing,
    /// The target lies within the next few bytes; filled with `nop`s.
    NoOps(u8),
    /// `EB rel8`.
    Short(i8),
    /// `E9 rel32`.
    Near(i32),
}

impl JumpEncoding {
    /// Number of bytes the encoding occupies at the source.
    #[must_use]
    pub const fn len(self) -> usize {
        match self {
            Self::Nothing => 0,
            Self::NoOps(n) => n as usize,
            Self::Short(_) => 2,
            Self::Near(_) => 5,
        }
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Writes the encoding to the start of `code`.
    ///
    /// # Errors
    /// [`JumpEncodeError::NoRoom`] if `code` is shorter than the encoding.
    pub fn write(self, code: &mut [u8]) -> Result<usize, JumpEncodeError> {
        let (needed, available) = (self.len(), code.len());
        let code = code
            .get_mut(..needed)
            .ok_or(JumpEncodeError::NoRoom { needed, available })?;
        match self {
            Self::Nothing => {}
            Self::NoOps(_) => code.fill(OP_NOP),
            Self::Short(rel) => {
                code[0] = OP_JMP_REL8;
                code[1] = rel.to_le_bytes()[0];
            }
            Self::Near(rel) => {
                code[0] = OP_JMP_REL32;
                code[1..5].copy_from_slice(&rel.to_le_bytes());
            }
        }
        Ok(needed)
    }
}

/// Picks the jump encoding for a jump placed at `location` to `target`.
///
/// Relative jumps count from the end of the instruction, so the reachable
/// distances are shifted by the instruction length: `-126..=129` for the
/// two-byte form, `-2^31 + 5..=2^31 + 4` for the five-byte form. Targets
/// less than ten bytes ahead are reached by falling through `nop`s.
///
/// # Errors
/// [`JumpEncodeError::Unencodable`] beyond the 32-bit range.
#[allow(clippy::cast_possible_truncation)]
pub const fn encode_jump(location: i64, target: i64) -> Result<JumpEncoding, JumpEncodeError> {
    let Some(diff) = target.checked_sub(location) else {
        return Err(JumpEncodeError::Unencodable(i64::MAX));
    };
    Ok(match diff {
        0 => JumpEncoding::Nothing,
        1..=9 => JumpEncoding::NoOps(diff as u8),
        -126..=129 => JumpEncoding::Short((diff - 2) as i8),
        -2_147_483_643..=2_147_483_652 => JumpEncoding::Near((diff - 5) as i32),
        _ => return Err(JumpEncodeError::Unencodable(diff)),
    })
}

/// Whether the CPU pushes an error code for `vector`.
#[must_use]
pub const fn pushes_error_code(vector: u8) -> bool {
    match KnownExceptionVector::from_vector(vector) {
        Some(known) => known.has_error_code(),
        // Control protection, VMM communication and security exceptions.
        None => matches!(vector, 21 | 29 | 30),
    }
}

/// 256 entry stubs, as bytes.
#[repr(C, align(16))]
pub struct StubTable {
    code: [[u8; STUB_SIZE]; VECTOR_COUNT],
}

impl StubTable {
    /// Builds all stubs for a table that will live at `base` and jump to
    /// the common entry at `common`.
    ///
    /// # Errors
    /// When `common` is out of reach of some stub.
    #[allow(clippy::cast_possible_wrap)]
    pub fn build(base: u64, common: u64) -> Result<Self, JumpEncodeError> {
        let mut table = Self {
            code: [[OP_INT3; STUB_SIZE]; VECTOR_COUNT],
        };
        for vector in 0..=u8::MAX {
            let stub = &mut table.code[usize::from(vector)];
            let mut at = 0;
            if !pushes_error_code(vector) {
                stub[..2].copy_from_slice(&[OP_PUSH_IMM8, 0]);
                at = 2;
            }
            stub[at] = OP_PUSH_IMM32;
            stub[at + 1..at + 5].copy_from_slice(&u32::from(vector).to_le_bytes());
            at += 5;

            let location = base + (usize::from(vector) * STUB_SIZE + at) as u64;
            encode_jump(location as i64, common as i64)?.write(&mut stub[at..])?;
        }
        log::trace!("built interrupt stubs at {base:#x} -> {common:#x}");
        Ok(table)
    }

    #[must_use]
    pub const fn stub(&self, vector: u8) -> &[u8; STUB_SIZE] {
        &self.code[vector as usize]
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.code.as_flattened()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_boundaries() {
        assert_eq!(encode_jump(100, 100), Ok(JumpEncoding::Nothing));
        assert_eq!(encode_jump(100, 109), Ok(JumpEncoding::NoOps(9)));
        assert_eq!(encode_jump(100, 110), Ok(JumpEncoding::Short(8)));
        assert_eq!(encode_jump(0, 129), Ok(JumpEncoding::Short(127)));
        assert_eq!(encode_jump(0, -126), Ok(JumpEncoding::Short(-128)));
        assert_eq!(encode_jump(0, 130), Ok(JumpEncoding::Near(125)));
        assert_eq!(encode_jump(0, -127), Ok(JumpEncoding::Near(-132)));
        assert_eq!(
            encode_jump(0, 2_147_483_652),
            Ok(JumpEncoding::Near(i32::MAX))
        );
        assert_eq!(
            encode_jump(0, -2_147_483_643),
            Ok(JumpEncoding::Near(i32::MIN))
        );
        assert_eq!(
            encode_jump(0, 2_147_483_653),
            Err(JumpEncodeError::Unencodable(2_147_483_653))
        );
        assert_eq!(
            encode_jump(2_147_483_644, 0),
            Err(JumpEncodeError::Unencodable(-2_147_483_644))
        );
    }

    #[test]
    fn encodings_write_their_bytes() {
        let mut code = [0u8; 8];
        assert_eq!(JumpEncoding::Short(-3).write(&mut code), Ok(2));
        assert_eq!(code[..2], [0xEB, 0xFD]);
        assert_eq!(JumpEncoding::Near(0x0102_0304).write(&mut code), Ok(5));
        assert_eq!(code[..5], [0xE9, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(JumpEncoding::NoOps(3).write(&mut code), Ok(3));
        assert_eq!(code[..3], [0x90; 3]);
        assert_eq!(
            JumpEncoding::Near(0).write(&mut code[..4]),
            Err(JumpEncodeError::NoRoom {
                needed: 5,
                available: 4
            })
        );
    }

    #[test]
    fn stubs_push_a_uniform_frame() {
        let base = 0xffff_ffff_8000_0000;
        let common = base + 0x2000;
        let table = StubTable::build(base, common).unwrap();

        // #BP: dummy error code, vector, rel32 jump.
        let bp = table.stub(3);
        assert_eq!(bp[..7], [0x6A, 0x00, 0x68, 3, 0, 0, 0]);
        assert_eq!(bp[7], 0xE9);
        let rel = i32::from_le_bytes(bp[8..12].try_into().unwrap());
        assert_eq!(i64::from(rel), 0x2000 - (3 * 16 + 12));
        assert!(bp[12..].iter().all(|&b| b == 0xCC));

        // #PF: the CPU supplies the error code.
        let pf = table.stub(14);
        assert_eq!(pf[..5], [0x68, 14, 0, 0, 0]);
        assert_eq!(pf[5], 0xE9);

        let last = table.stub(0xff);
        assert_eq!(last[2..7], [0x68, 0xff, 0, 0, 0]);
        assert_eq!(table.as_bytes().len(), 4096);
    }

    #[test]
    fn nearby_entry_uses_short_jumps() {
        // Common entry right behind the first stubs.
        let table = StubTable::build(0x1000, 0x1000 + 3 * 16).unwrap();
        let de = table.stub(0);
        assert_eq!(de[7], 0xEB);
        assert_eq!(i64::from(de[8].cast_signed()), 48 - 9);
        let far = table.stub(0x80);
        assert_eq!(far[7], 0xE9);
    }

    #[test]
    fn unreachable_entry_is_rejected() {
        assert!(matches!(
            StubTable::build(0, 1 << 40),
            Err(JumpEncodeError::Unencodable(_))
        ));
    }
}
