//! Recovery of compiler generated switch tables of the shape
//!
//! ```text
//! cmp   ecx, N-1
//! ja    default
//! lea   r8, [image_base]
//! mov   ecx, [r8 + rcx*4 + table_rva]
//! add   rcx, r8
//! jmp   rcx
//! ```

use crate::decoder::is_jump;
use crate::image::Image;
use crate::walker::RegionPath;
use iced_x86::{Instruction, Mnemonic, OpKind, Register};
use tracing::trace;

const SLOT_SIZE: u32 = 4;
const MAX_CASES: u64 = 0x10000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpTable {
    /// Function whose walk found the table.
    pub function: u64,
    pub address: u64,
    /// The indirect jump that dispatches through the table.
    pub jump: u64,
    pub stride: u32,
    pub slots: Vec<i32>,
    pub targets: Vec<u64>,
}

impl JumpTable {
    /// Exclusive end of the table's bytes.
    pub fn end(&self) -> u64 {
        self.address + self.slots.len() as u64 * self.stride as u64
    }
}

/// Try to reconstruct the table used by the indirect jump ending `path`'s root region.
pub fn recover(image: &Image, function: u64, path: &RegionPath) -> Option<JumpTable> {
    let root = path.root();
    let jump = root.last()?;

    let mov_index = last_mov(root)?;
    let mov = &root[mov_index];

    let Some(base) = memory_base(path, mov_index, mov.memory_base()) else {
        trace!(target: "fnbound::jump_table", jump = format!("0x{:x}", jump.ip()), "No table base");
        return None;
    };

    let Some(cases) = case_count(root, mov_index) else {
        trace!(target: "fnbound::jump_table", jump = format!("0x{:x}", jump.ip()), "No case bound");
        return None;
    };

    if mov.memory_index_scale() != SLOT_SIZE || cases == 0 || cases > MAX_CASES {
        return None;
    }

    if !is_base_add(root, mov_index, mov) {
        return None;
    }

    let address = image.base().wrapping_add(mov.memory_displacement64());
    let slots = read_slots(image, address, cases)?;
    let targets = slots
        .iter()
        .map(|&slot| base.wrapping_add_signed(slot as i64))
        .collect();

    Some(JumpTable {
        function,
        address,
        jump: jump.ip(),
        stride: SLOT_SIZE,
        slots,
        targets,
    })
}

/// Read `cases` slots at `address`. A table running off the image, or off the
/// address space for a negative displacement, is no table.
fn read_slots(image: &Image, address: u64, cases: u64) -> Option<Vec<i32>> {
    (0..cases)
        .map(|i| {
            let slot = i.checked_mul(SLOT_SIZE as u64)?;
            image.read_i32(address.checked_add(slot)?)
        })
        .collect()
}

/// The table fetch: the last `mov` before the jump, which must use an index register.
fn last_mov(root: &[Instruction]) -> Option<usize> {
    let before_jump = root.len().checked_sub(1)?;
    let index = root[..before_jump]
        .iter()
        .rposition(|i| i.mnemonic() == Mnemonic::Mov)?;
    (root[index].memory_index() != Register::None).then_some(index)
}

/// Find the `lea` that loaded `register`, searching back through the root
/// region and then the regions that jumped to it.
fn memory_base(path: &RegionPath, mov_index: usize, register: Register) -> Option<u64> {
    let root = std::iter::once((path.root(), mov_index));
    for (instructions, end) in root.chain(path.ancestors()) {
        for instruction in instructions[..end].iter().rev() {
            if instruction.op_count() > 1
                && instruction.op0_kind() == OpKind::Register
                && instruction.op0_register() == register
            {
                return (instruction.mnemonic() == Mnemonic::Lea
                    && instruction.op1_kind() == OpKind::Memory)
                    .then(|| instruction.memory_displacement64());
            }
        }
    }
    None
}

/// The bound check guarding the table: `cmp reg, imm` followed by `ja`.
fn case_count(root: &[Instruction], mov_index: usize) -> Option<u64> {
    let ja = (1..mov_index).rev().find(|&i| is_jump(&root[i]))?;
    if root[ja].mnemonic() != Mnemonic::Ja {
        return None;
    }
    let cmp = &root[ja - 1];
    if cmp.mnemonic() != Mnemonic::Cmp || cmp.op0_kind() != OpKind::Register {
        return None;
    }
    match cmp.op1_kind() {
        OpKind::Immediate8
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate32to64 => Some(cmp.immediate(1).wrapping_add(1)),
        _ => None,
    }
}

/// Only `add <loaded>, <base>` may sit between the fetch and the jump.
fn is_base_add(root: &[Instruction], mov_index: usize, mov: &Instruction) -> bool {
    if root.len() - 2 - mov_index != 1 {
        return false;
    }
    let add = &root[mov_index + 1];
    add.mnemonic() == Mnemonic::Add
        && add.op0_kind() == OpKind::Register
        && add.op0_register() == mov.op0_register().full_register()
        && add.op1_kind() == OpKind::Register
        && add.op1_register() == mov.memory_base()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_linear;
    use crate::image::testing::image_with;

    // cmp ecx, 2; ja 0x1040; lea r8, [0x1000]; mov ecx, [r8+rcx*4+0x8000]; add rcx, r8; jmp rcx
    const SWITCH: &[u8] = &[
        0x83, 0xf9, 0x02, 0x77, 0x3b, 0x4c, 0x8d, 0x05, 0xf4, 0xff, 0xff, 0xff, 0x41, 0x8b, 0x8c,
        0x88, 0x00, 0x80, 0x00, 0x00, 0x4c, 0x01, 0xc1, 0xff, 0xe1,
    ];

    fn slots(values: &[i32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_targets_are_slot_plus_base() {
        let raw = [0x20, 0x28, 0x30];
        let table = slots(&raw);
        let image = image_with(&[(0x1000, SWITCH)], &[(0x8000, &table[..])]);
        let root = decode_linear(&image, 0x1000, SWITCH.len());
        let path = RegionPath::new(0x1000, &root, &[]);

        let recovered = recover(&image, 0x1000, &path).expect("jump table");
        assert_eq!(recovered.address, 0x8000);
        assert_eq!(recovered.jump, 0x1017);
        assert_eq!(recovered.slots, raw);
        for (slot, target) in raw.iter().zip(&recovered.targets) {
            assert_eq!(*target, 0x1000 + *slot as u64);
        }
        assert_eq!(recovered.end(), 0x800c);
    }

    #[test]
    fn test_negative_slots() {
        let table = slots(&[-0x10, 0x8, 0x10]);
        let image = image_with(&[(0x1000, SWITCH)], &[(0x8000, &table[..])]);
        let root = decode_linear(&image, 0x1000, SWITCH.len());
        let path = RegionPath::new(0x1000, &root, &[]);
        let recovered = recover(&image, 0x1000, &path).expect("jump table");
        assert_eq!(recovered.targets, [0xff0, 0x1008, 0x1010]);
    }

    #[test]
    fn test_table_wrapping_address_space_is_rejected() {
        // Eight mapped bytes at the very top of the address space.
        let image = Image::new(u64::MAX - 7, vec![0x10; 8], 0, Vec::new());
        assert_eq!(read_slots(&image, u64::MAX - 7, 2), Some(vec![0x1010_1010; 2]));
        assert_eq!(read_slots(&image, u64::MAX - 7, 3), None);
    }

    #[test]
    fn test_extra_arithmetic_is_unsupported() {
        // Same as SWITCH with an extra `add rcx, r8` before the jump.
        let mut code = SWITCH[..SWITCH.len() - 2].to_vec();
        code.extend_from_slice(&[0x4c, 0x01, 0xc1, 0xff, 0xe1]);
        let table = slots(&[0x20, 0x28, 0x30]);
        let image = image_with(&[(0x1000, &code[..])], &[(0x8000, &table[..])]);
        let root = decode_linear(&image, 0x1000, code.len());
        let path = RegionPath::new(0x1000, &root, &[]);
        assert!(recover(&image, 0x1000, &path).is_none());
    }

    #[test]
    fn test_missing_bound_check() {
        let code = &SWITCH[5..];
        let image = image_with(&[(0x1000, code)], &[]);
        let root = decode_linear(&image, 0x1000, code.len());
        let path = RegionPath::new(0x1000, &root, &[]);
        assert!(recover(&image, 0x1000, &path).is_none());
    }
}
