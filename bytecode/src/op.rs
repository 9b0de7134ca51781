/// Major opcodes, stored in the high nibble of each instruction byte.
///
/// The low nibble is the immediate operand. [`Extended`](Opcode::Extended)
/// promotes the operand to a full byte: the low nibble becomes the opcode
/// and the next byte the operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Extended = 0,
    PushInstance,
    PushArgument,
    PushTemporary,
    PushLiteral,
    PushConstant,
    AssignInstance,
    AssignTemporary,
    MarkArguments,
    SendMessage,
    SendUnary,
    SendBinary,
    PushBlock,
    DoPrimitive,
    DoSpecial,
}

impl Opcode {
    pub const COUNT: usize = Opcode::DoSpecial as usize + 1;
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(nibble: u8) -> Result<Self, u8> {
        if nibble < Self::COUNT as u8 {
            // SAFETY: Opcode is repr(u8) with contiguous variants from 0.
            Ok(unsafe { core::mem::transmute::<u8, Opcode>(nibble) })
        } else {
            Err(nibble)
        }
    }
}

/// Sub-opcodes of [`Opcode::DoSpecial`], carried in the operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Special {
    SelfReturn = 1,
    StackReturn,
    BlockReturn,
    Duplicate,
    PopTop,
    Branch,
    BranchIfTrue,
    BranchIfFalse,
    SendToSuper = 11,
    Breakpoint = 12,
}

impl TryFrom<u8> for Special {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, u8> {
        match code {
            1 => Ok(Special::SelfReturn),
            2 => Ok(Special::StackReturn),
            3 => Ok(Special::BlockReturn),
            4 => Ok(Special::Duplicate),
            5 => Ok(Special::PopTop),
            6 => Ok(Special::Branch),
            7 => Ok(Special::BranchIfTrue),
            8 => Ok(Special::BranchIfFalse),
            11 => Ok(Special::SendToSuper),
            12 => Ok(Special::Breakpoint),
            other => Err(other),
        }
    }
}

/// Operands of [`Opcode::PushConstant`] above the inline integers 0‥9.
pub const NIL_CONST: u8 = 10;
pub const TRUE_CONST: u8 = 11;
pub const FALSE_CONST: u8 = 12;

/// The inlined unary selectors of [`Opcode::SendUnary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnaryOp {
    IsNil = 0,
    NotNil,
}

impl TryFrom<u8> for UnaryOp {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, u8> {
        match code {
            0 => Ok(UnaryOp::IsNil),
            1 => Ok(UnaryOp::NotNil),
            other => Err(other),
        }
    }
}

/// The inlined binary selectors of [`Opcode::SendBinary`], in the same
/// order as the globals' fallback selector table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BinaryOp {
    Less = 0,
    LessOrEqual,
    Add,
}

impl TryFrom<u8> for BinaryOp {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, u8> {
        match code {
            0 => Ok(BinaryOp::Less),
            1 => Ok(BinaryOp::LessOrEqual),
            2 => Ok(BinaryOp::Add),
            other => Err(other),
        }
    }
}
