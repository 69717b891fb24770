//! Thin helpers over iced-x86 for decoding at image addresses.

use crate::image::Image;
use iced_x86::{Code, Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind, Register};

/// Decode one instruction at `address`. Returns `None` only when there are no
/// bytes left in the image; undecodable bytes come back as an invalid instruction.
pub fn decode_at(image: &Image, address: u64) -> Option<Instruction> {
    let bytes = image.bytes_from(address);
    if bytes.is_empty() {
        return None;
    }
    let mut decoder = Decoder::with_ip(64, bytes, address, DecoderOptions::NONE);
    let mut instruction = Instruction::default();
    decoder.decode_out(&mut instruction);
    Some(instruction)
}

/// Decode instructions linearly starting at `address`, stopping at the first
/// invalid instruction or the end of `len` bytes.
pub fn decode_linear(image: &Image, address: u64, len: usize) -> Vec<Instruction> {
    let Some(bytes) = image.read(address, len) else {
        return Vec::new();
    };
    let mut decoder = Decoder::with_ip(64, bytes, address, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    while decoder.can_decode() {
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            break;
        }
        instructions.push(instruction);
    }
    instructions
}

pub fn branch_target(instruction: &Instruction) -> Option<u64> {
    match instruction.op0_kind() {
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            Some(instruction.near_branch_target())
        }
        _ => None,
    }
}

/// The address a call or jump refers to: a direct target, or the pointer slot
/// of a RIP-relative memory operand.
pub fn operand_address(instruction: &Instruction) -> Option<u64> {
    match instruction.op0_kind() {
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            Some(instruction.near_branch_target())
        }
        OpKind::Memory if instruction.memory_base() == Register::RIP => {
            Some(instruction.memory_displacement64())
        }
        _ => None,
    }
}

/// Every address-sized value an instruction mentions: immediates, branch
/// targets and memory displacements.
pub fn referenced_values(instruction: &Instruction) -> Vec<u64> {
    let mut values = Vec::new();
    for operand in 0..instruction.op_count() {
        match instruction.op_kind(operand) {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                values.push(instruction.near_branch_target())
            }
            OpKind::FarBranch16 | OpKind::FarBranch32 => {
                values.push(instruction.far_branch32() as u64)
            }
            OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => values.push(instruction.immediate(operand)),
            OpKind::Memory => values.push(instruction.memory_displacement64()),
            _ => {}
        }
    }
    values
}

pub fn is_call(instruction: &Instruction) -> bool {
    instruction.mnemonic() == Mnemonic::Call
}

pub fn is_jump(instruction: &Instruction) -> bool {
    matches!(
        instruction.flow_control(),
        FlowControl::ConditionalBranch | FlowControl::UnconditionalBranch | FlowControl::IndirectBranch
    )
}

pub fn is_flow(instruction: &Instruction) -> bool {
    is_jump(instruction)
        || matches!(
            instruction.flow_control(),
            FlowControl::Call | FlowControl::IndirectCall
        )
}

pub fn is_int3(instruction: &Instruction) -> bool {
    instruction.code() == Code::Int3
}

pub fn is_nop(instruction: &Instruction) -> bool {
    instruction.mnemonic() == Mnemonic::Nop
}

/// Ends a straight-line run of code.
pub fn is_terminator(instruction: &Instruction) -> bool {
    matches!(
        instruction.flow_control(),
        FlowControl::UnconditionalBranch | FlowControl::IndirectBranch | FlowControl::Return
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::testing::image_with;

    #[test]
    fn test_decode_call_target() {
        let image = image_with(&[(0x1000, &[0xe8, 0xfb, 0x0f, 0x00, 0x00])], &[]);
        let call = decode_at(&image, 0x1000).unwrap();
        assert!(is_call(&call));
        assert_eq!(branch_target(&call), Some(0x2000));
        assert_eq!(operand_address(&call), Some(0x2000));
    }

    #[test]
    fn test_rip_relative_operand() {
        // call qword ptr [rip+0x6ffa]
        let image = image_with(&[(0x1000, &[0xff, 0x15, 0xfa, 0x6f, 0x00, 0x00])], &[]);
        let call = decode_at(&image, 0x1000).unwrap();
        assert_eq!(branch_target(&call), None);
        assert_eq!(operand_address(&call), Some(0x8000));
    }

    #[test]
    fn test_invalid_and_end_of_image() {
        let image = image_with(&[(0x1000, &[0x06])], &[]);
        assert!(decode_at(&image, 0x1000).unwrap().is_invalid());
        assert!(decode_at(&image, 0x9000).is_none());
    }

    #[test]
    fn test_referenced_values() {
        // mov eax, 0x8010; lea rcx, [rip+0x10]
        let image = image_with(
            &[(0x1000, &[0xb8, 0x10, 0x80, 0x00, 0x00, 0x48, 0x8d, 0x0d, 0x10, 0x00, 0x00, 0x00])],
            &[],
        );
        let instructions = decode_linear(&image, 0x1000, 12);
        assert_eq!(instructions.len(), 2);
        assert_eq!(referenced_values(&instructions[0]), [0x8010]);
        assert_eq!(referenced_values(&instructions[1]), [0x101c]);
    }
}
