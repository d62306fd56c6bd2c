use serde::{Deserialize, Serialize};

// =============================================================================
// OPCODE - one byte, grouped by high nibble
// =============================================================================

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // debug / error
    Trap = 0x00,
    /// Stop and return TOS as the program result.
    Exit = 0x01,
    Breakpoint = 0x02,
    PrintLong = 0x03,
    PrintChar = 0x04,

    // binary arithmetic, all ( tos1 tos -- tos1 OP tos )
    Nop = 0x10,
    AddLong = 0x11,
    SubLong = 0x12,
    MulLong = 0x13,
    IDivLong = 0x14,
    ModuloLong = 0x15,
    LeftShiftLong = 0x16,
    RightShiftLogicalLong = 0x17,
    RightShiftArithmeticLong = 0x18,
    LogicalAndLong = 0x19,
    LogicalOrLong = 0x1A,
    AddFloat = 0x1B,
    SubFloat = 0x1C,
    MulFloat = 0x1D,
    DivFloat = 0x1E,

    // unary arithmetic
    LogicalNeg = 0x20,
    BinaryNeg = 0x21,
    ArithmeticNeg = 0x22,

    // loading / storing
    /// Push the sign-extended parameter.
    ImmByte = 0x40,
    /// Push `constants[window + param]`.
    Constant = 0x41,
    BiasConstantWindow = 0x42,
    LoadGlobal = 0x43,
    StoreGlobal = 0x44,
    BiasGlobalWindow = 0x45,
    StoreAuxiliary = 0x46,
    LoadAuxiliary = 0x47,
    /// Push the slot and zero it.
    MoveAuxiliary = 0x48,

    // stack manipulation
    Dup = 0x60,
    Dup2 = 0x61,
    Rot2 = 0x62,
    Rot3 = 0x63,
    Drop = 0x64,

    // control flow
    /// `pc += param`
    Jump = 0x70,
    /// Pop; `pc += param` iff the value is non-zero.
    TestAndJump = 0x71,
    /// Call chunk `param`.
    Call = 0x72,
    Return = 0x73,

    // objects
    /// ( class size -- ptr )
    Allocate = 0x80,
    /// ( class -- ptr ), size in bytes from the parameter.
    AllocateImm = 0x81,
    Deallocate = 0x82,
    LoadClassConstructor = 0x83,
    LoadClassDestructor = 0x84,
    /// ( ptr -- field )
    LoadObjectField = 0x85,
    /// ( ptr value -- )
    StoreObjectField = 0x86,
    /// ( ptr -- ptr dtor )
    LoadObjectDestructor = 0x87,
    /// ( ptr -- field ), zeroing the field.
    MoveOutObjectField = 0x88,
    /// ( value -- ), runs the destructor when `value` is a pointer.
    Destroy = 0x89,
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Trap => "TRAP",
            Opcode::Exit => "EXIT",
            Opcode::Breakpoint => "BREAKPOINT",
            Opcode::PrintLong => "PRINT_LONG",
            Opcode::PrintChar => "PRINT_CHAR",
            Opcode::Nop => "NOP",
            Opcode::AddLong => "ADD_LONG",
            Opcode::SubLong => "SUB_LONG",
            Opcode::MulLong => "MUL_LONG",
            Opcode::IDivLong => "IDIV_LONG",
            Opcode::ModuloLong => "MOD_LONG",
            Opcode::LeftShiftLong => "SLL_LONG",
            Opcode::RightShiftLogicalLong => "SRL_LONG",
            Opcode::RightShiftArithmeticLong => "SRA_LONG",
            Opcode::LogicalAndLong => "AND_LONG",
            Opcode::LogicalOrLong => "OR_LONG",
            Opcode::AddFloat => "ADD_FLOAT",
            Opcode::SubFloat => "SUB_FLOAT",
            Opcode::MulFloat => "MUL_FLOAT",
            Opcode::DivFloat => "DIV_FLOAT",
            Opcode::LogicalNeg => "LNEG",
            Opcode::BinaryNeg => "BNEG",
            Opcode::ArithmeticNeg => "ANEG",
            Opcode::ImmByte => "IMM_BYTE",
            Opcode::Constant => "CONSTANT",
            Opcode::BiasConstantWindow => "BIAS_CONST",
            Opcode::LoadGlobal => "LOAD_GLOBAL",
            Opcode::StoreGlobal => "STORE_GLOBAL",
            Opcode::BiasGlobalWindow => "BIAS_GLOBAL",
            Opcode::StoreAuxiliary => "STORE_AUX",
            Opcode::LoadAuxiliary => "LOAD_AUX",
            Opcode::MoveAuxiliary => "MOVE_AUX",
            Opcode::Dup => "DUP",
            Opcode::Dup2 => "DUP2",
            Opcode::Rot2 => "ROT2",
            Opcode::Rot3 => "ROT3",
            Opcode::Drop => "DROP",
            Opcode::Jump => "JUMP",
            Opcode::TestAndJump => "TEST_JUMP",
            Opcode::Call => "CALL",
            Opcode::Return => "RETURN",
            Opcode::Allocate => "ALLOCATE",
            Opcode::AllocateImm => "ALLOCATE_IMM",
            Opcode::Deallocate => "DEALLOCATE",
            Opcode::LoadClassConstructor => "LOAD_CTOR",
            Opcode::LoadClassDestructor => "LOAD_DTOR",
            Opcode::LoadObjectField => "LOAD_FIELD",
            Opcode::StoreObjectField => "STORE_FIELD",
            Opcode::LoadObjectDestructor => "LOAD_OBJ_DTOR",
            Opcode::MoveOutObjectField => "MOVE_FIELD",
            Opcode::Destroy => "DESTROY",
        }
    }

    /// Whether the parameter is a relative jump displacement.
    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Jump | Opcode::TestAndJump)
    }

    /// Whether the parameter byte means anything for this opcode.
    pub fn uses_param(self) -> bool {
        matches!(
            self,
            Opcode::ImmByte
                | Opcode::Constant
                | Opcode::BiasConstantWindow
                | Opcode::LoadGlobal
                | Opcode::StoreGlobal
                | Opcode::BiasGlobalWindow
                | Opcode::StoreAuxiliary
                | Opcode::LoadAuxiliary
                | Opcode::MoveAuxiliary
                | Opcode::Jump
                | Opcode::TestAndJump
                | Opcode::Call
                | Opcode::AllocateImm
                | Opcode::LoadClassConstructor
                | Opcode::LoadClassDestructor
                | Opcode::LoadObjectField
                | Opcode::StoreObjectField
                | Opcode::MoveOutObjectField
        )
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        use Opcode::*;
        Ok(match byte {
            0x00 => Trap,
            0x01 => Exit,
            0x02 => Breakpoint,
            0x03 => PrintLong,
            0x04 => PrintChar,
            0x10 => Nop,
            0x11 => AddLong,
            0x12 => SubLong,
            0x13 => MulLong,
            0x14 => IDivLong,
            0x15 => ModuloLong,
            0x16 => LeftShiftLong,
            0x17 => RightShiftLogicalLong,
            0x18 => RightShiftArithmeticLong,
            0x19 => LogicalAndLong,
            0x1A => LogicalOrLong,
            0x1B => AddFloat,
            0x1C => SubFloat,
            0x1D => MulFloat,
            0x1E => DivFloat,
            0x20 => LogicalNeg,
            0x21 => BinaryNeg,
            0x22 => ArithmeticNeg,
            0x40 => ImmByte,
            0x41 => Constant,
            0x42 => BiasConstantWindow,
            0x43 => LoadGlobal,
            0x44 => StoreGlobal,
            0x45 => BiasGlobalWindow,
            0x46 => StoreAuxiliary,
            0x47 => LoadAuxiliary,
            0x48 => MoveAuxiliary,
            0x60 => Dup,
            0x61 => Dup2,
            0x62 => Rot2,
            0x63 => Rot3,
            0x64 => Drop,
            0x70 => Jump,
            0x71 => TestAndJump,
            0x72 => Call,
            0x73 => Return,
            0x80 => Allocate,
            0x81 => AllocateImm,
            0x82 => Deallocate,
            0x83 => LoadClassConstructor,
            0x84 => LoadClassDestructor,
            0x85 => LoadObjectField,
            0x86 => StoreObjectField,
            0x87 => LoadObjectDestructor,
            0x88 => MoveOutObjectField,
            0x89 => Destroy,
            other => return Err(other),
        })
    }
}

// =============================================================================
// INSTRUCTION - opcode byte + signed parameter byte
// =============================================================================

/// A single 2-byte instruction.
///
/// The opcode is kept as a raw byte so that an executable carrying an
/// unknown opcode still decodes; the interpreter faults when it reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instruction {
    pub op: u8,
    pub param: i8,
}

impl Instruction {
    pub fn new(opcode: Opcode, param: i8) -> Self {
        Self {
            op: opcode as u8,
            param,
        }
    }

    pub fn bare(opcode: Opcode) -> Self {
        Self::new(opcode, 0)
    }

    pub fn opcode(&self) -> Result<Opcode, u8> {
        Opcode::try_from(self.op)
    }

    pub fn to_bytes(self) -> [u8; 2] {
        [self.op, self.param as u8]
    }

    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        Self {
            op: bytes[0],
            param: bytes[1] as i8,
        }
    }
}

impl From<Opcode> for Instruction {
    fn from(opcode: Opcode) -> Self {
        Instruction::bare(opcode)
    }
}
