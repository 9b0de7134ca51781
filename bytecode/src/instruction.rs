use core::fmt;

use crate::op::{BinaryOp, UnaryOp};

/// A decoded instruction with operands widened past the nibble encoding.
///
/// Branch and block targets are absolute bytecode offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    PushInstance { index: u8 },
    PushArgument { index: u8 },
    PushTemporary { index: u8 },
    PushLiteral { index: u8 },
    PushConstant { constant: u8 },
    AssignInstance { index: u8 },
    AssignTemporary { index: u8 },
    MarkArguments { count: u8 },
    SendMessage { selector_literal: u8 },
    SendUnary { op: UnaryOp },
    SendBinary { op: BinaryOp },
    /// Pushes a closure over the current context. The block body sits
    /// between this instruction and `target`; the enclosing method jumps
    /// over it.
    PushBlock { argument_location: u8, target: u16 },
    DoPrimitive { argument_count: u8, number: u8 },
    SelfReturn,
    StackReturn,
    BlockReturn,
    Duplicate,
    PopTop,
    Branch { target: u16 },
    BranchIfTrue { target: u16 },
    BranchIfFalse { target: u16 },
    SendToSuper { selector_literal: u8 },
    Breakpoint,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PushInstance { index } => write!(f, "PushInstance {index}"),
            Self::PushArgument { index } => write!(f, "PushArgument {index}"),
            Self::PushTemporary { index } => write!(f, "PushTemporary {index}"),
            Self::PushLiteral { index } => write!(f, "PushLiteral #{index}"),
            Self::PushConstant { constant } => {
                write!(f, "PushConstant {constant}")
            }
            Self::AssignInstance { index } => {
                write!(f, "AssignInstance {index}")
            }
            Self::AssignTemporary { index } => {
                write!(f, "AssignTemporary {index}")
            }
            Self::MarkArguments { count } => write!(f, "MarkArguments {count}"),
            Self::SendMessage { selector_literal } => {
                write!(f, "SendMessage #{selector_literal}")
            }
            Self::SendUnary { op } => write!(f, "SendUnary {op:?}"),
            Self::SendBinary { op } => write!(f, "SendBinary {op:?}"),
            Self::PushBlock {
                argument_location,
                target,
            } => {
                write!(f, "PushBlock {argument_location} ->{target}")
            }
            Self::DoPrimitive {
                argument_count,
                number,
            } => {
                write!(f, "DoPrimitive <{number}> {argument_count}")
            }
            Self::SelfReturn => write!(f, "SelfReturn"),
            Self::StackReturn => write!(f, "StackReturn"),
            Self::BlockReturn => write!(f, "BlockReturn"),
            Self::Duplicate => write!(f, "Duplicate"),
            Self::PopTop => write!(f, "PopTop"),
            Self::Branch { target } => write!(f, "Branch ->{target}"),
            Self::BranchIfTrue { target } => {
                write!(f, "BranchIfTrue ->{target}")
            }
            Self::BranchIfFalse { target } => {
                write!(f, "BranchIfFalse ->{target}")
            }
            Self::SendToSuper { selector_literal } => {
                write!(f, "SendToSuper #{selector_literal}")
            }
            Self::Breakpoint => write!(f, "Breakpoint"),
        }
    }
}
