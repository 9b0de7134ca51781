mod decoder;
mod instruction;
mod op;

pub use decoder::{decode, DecodeError, InstructionReader};
pub use instruction::Instruction;
pub use op::{
    BinaryOp, Opcode, Special, UnaryOp, FALSE_CONST, NIL_CONST, TRUE_CONST,
};

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Instruction> {
        InstructionReader::new(bytes)
            .collect::<Result<Vec<_>, _>>()
            .expect("well-formed bytecode")
    }

    #[test]
    fn nibble_split() {
        let (instr, next) = decode(&[0x21], 0).unwrap();
        assert_eq!(instr, Instruction::PushArgument { index: 1 });
        assert_eq!(next, 1);

        let (instr, _) = decode(&[0x4F], 0).unwrap();
        assert_eq!(instr, Instruction::PushLiteral { index: 15 });
    }

    #[test]
    fn extended_form_promotes_operand() {
        // 0x03 = extended prefix selecting PushTemporary, operand byte 200.
        let (instr, next) = decode(&[0x03, 200], 0).unwrap();
        assert_eq!(instr, Instruction::PushTemporary { index: 200 });
        assert_eq!(next, 2);
    }

    #[test]
    fn extended_extended_is_invalid() {
        assert_eq!(
            decode(&[0x00, 0x05], 0),
            Err(DecodeError::BadOpcode { offset: 0, nibble: 0 })
        );
    }

    #[test]
    fn push_block_carries_target_and_body_start() {
        // PushBlock with one argument slot, jumping over a 3-byte body.
        let bytes = [0xC1, 0x07, 0x00, 0x33, 0x51, 0xF2, 0xF2];
        let (instr, next) = decode(&bytes, 0).unwrap();
        assert_eq!(
            instr,
            Instruction::PushBlock {
                argument_location: 1,
                target: 7
            }
        );
        // The body starts right after the target bytes.
        assert_eq!(next, 3);
    }

    #[test]
    fn primitive_number_follows_opcode() {
        let (instr, next) = decode(&[0xD2, 8], 0).unwrap();
        assert_eq!(
            instr,
            Instruction::DoPrimitive {
                argument_count: 2,
                number: 8
            }
        );
        assert_eq!(next, 2);
    }

    #[test]
    fn specials_decode() {
        assert_eq!(decode(&[0xF1], 0).unwrap().0, Instruction::SelfReturn);
        assert_eq!(decode(&[0xF2], 0).unwrap().0, Instruction::StackReturn);
        assert_eq!(decode(&[0xF3], 0).unwrap().0, Instruction::BlockReturn);
        assert_eq!(decode(&[0xF4], 0).unwrap().0, Instruction::Duplicate);
        assert_eq!(decode(&[0xF5], 0).unwrap().0, Instruction::PopTop);
        assert_eq!(decode(&[0xFC], 0).unwrap().0, Instruction::Breakpoint);
    }

    #[test]
    fn branch_targets_are_little_endian() {
        let (instr, next) = decode(&[0xF6, 0x34, 0x12], 0).unwrap();
        assert_eq!(instr, Instruction::Branch { target: 0x1234 });
        assert_eq!(next, 3);

        let (instr, _) = decode(&[0xF7, 0x06, 0x00], 0).unwrap();
        assert_eq!(instr, Instruction::BranchIfTrue { target: 6 });

        let (instr, _) = decode(&[0xF8, 0x06, 0x00], 0).unwrap();
        assert_eq!(instr, Instruction::BranchIfFalse { target: 6 });
    }

    #[test]
    fn send_to_super_reads_selector_literal() {
        let (instr, next) = decode(&[0xFB, 3], 0).unwrap();
        assert_eq!(instr, Instruction::SendToSuper { selector_literal: 3 });
        assert_eq!(next, 2);
    }

    #[test]
    fn unknown_special_rejected() {
        assert_eq!(
            decode(&[0xF9], 0),
            Err(DecodeError::BadSpecial { offset: 0, code: 9 })
        );
        assert_eq!(
            decode(&[0xF0], 0),
            Err(DecodeError::BadSpecial { offset: 0, code: 0 })
        );
    }

    #[test]
    fn inline_selector_indices_are_checked() {
        assert_eq!(
            decode(&[0xA2], 0),
            Err(DecodeError::BadOperand { offset: 0, operand: 2 })
        );
        assert_eq!(
            decode(&[0xB3], 0),
            Err(DecodeError::BadOperand { offset: 0, operand: 3 })
        );
    }

    #[test]
    fn truncation_is_reported() {
        assert_eq!(
            decode(&[], 0),
            Err(DecodeError::Truncated { offset: 0 })
        );
        assert_eq!(
            decode(&[0xF6, 0x01], 0),
            Err(DecodeError::Truncated { offset: 2 })
        );
        assert_eq!(
            decode(&[0xD1], 0),
            Err(DecodeError::Truncated { offset: 1 })
        );
    }

    #[test]
    fn reader_walks_a_method() {
        // push 0, push 1, sendBinary +, stackReturn
        let listing = decode_all(&[0x50, 0x51, 0xB2, 0xF2]);
        assert_eq!(
            listing,
            vec![
                Instruction::PushConstant { constant: 0 },
                Instruction::PushConstant { constant: 1 },
                Instruction::SendBinary { op: BinaryOp::Add },
                Instruction::StackReturn,
            ]
        );
    }

    #[test]
    fn reader_stops_after_error() {
        let mut reader = InstructionReader::new(&[0x51, 0xF9, 0x51]);
        assert!(matches!(reader.next(), Some(Ok(_))));
        assert!(matches!(reader.next(), Some(Err(_))));
        assert!(reader.next().is_none());
    }
}
