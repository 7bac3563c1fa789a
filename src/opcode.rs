//! The instruction set of the target virtual machine.
//!
//! Numbering, operand classes and stack effects follow the CPython 3.10 instruction set.
//! Every instruction is a single code unit of two bytes: the opcode and an 8-bit operand.
//! Wider operands are built up by a chain of [`Opcode::EXTENDED_ARG`] prefixes, each of which
//! shifts its byte into the high bits of the operand of the instruction that follows.

use num_derive::FromPrimitive;

/// Size (in bytes) of a single code unit.
pub const CODE_UNIT: usize = 2;

/// Opcodes at or above this value consume their operand byte.
pub const HAVE_ARGUMENT: u8 = 90;

/// The comparison operators accepted by [`Opcode::COMPARE_OP`], in operand order.
pub const CMP_OPS: &[&str] = &["<", "<=", "==", "!=", ">", ">="];

/// Bit layout of the flags field of a [`CodeUnit`](crate::bytecode::CodeUnit).
pub mod flags {
    pub const OPTIMIZED: u32 = 0x0001;
    pub const NEWLOCALS: u32 = 0x0002;
    pub const VARARGS: u32 = 0x0004;
    pub const VARKEYWORDS: u32 = 0x0008;
    pub const NESTED: u32 = 0x0010;
    pub const GENERATOR: u32 = 0x0020;
    pub const NOFREE: u32 = 0x0040;
    pub const COROUTINE: u32 = 0x0080;
    pub const ITERABLE_COROUTINE: u32 = 0x0100;
    pub const ASYNC_GENERATOR: u32 = 0x0200;

    /// Flags which describe the declaration rather than the instruction stream.
    pub const INHERITED: u32 = VARARGS | VARKEYWORDS | NESTED | COROUTINE;

    /// Names of each flag bit, in ascending bit order.
    pub const NAMES: &[(u32, &str)] = &[
        (OPTIMIZED, "OPTIMIZED"), (NEWLOCALS, "NEWLOCALS"), (VARARGS, "VARARGS"), (VARKEYWORDS, "VARKEYWORDS"),
        (NESTED, "NESTED"), (GENERATOR, "GENERATOR"), (NOFREE, "NOFREE"), (COROUTINE, "COROUTINE"),
        (ITERABLE_COROUTINE, "ITERABLE_COROUTINE"), (ASYNC_GENERATOR, "ASYNC_GENERATOR"),
    ];
}

/// How the operand of an instruction is interpreted by the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandClass {
    /// No operand; the operand byte is always zero.
    None,
    /// Index into the constants pool.
    Const,
    /// Index into the names pool (globals and namespace lookups).
    Name,
    /// Index into the local slot pool.
    Local,
    /// Index into the free slot pool.
    Free,
    /// Index into [`CMP_OPS`].
    Compare,
    /// Absolute code unit index of the jump target.
    AbsJump,
    /// Forward distance (in code units) from the next instruction to the jump target.
    RelJump,
    /// An integer used as-is.
    Raw,
}
impl OperandClass {
    pub fn is_jump(self) -> bool {
        matches!(self, OperandClass::AbsJump | OperandClass::RelJump)
    }
}

macro_rules! opcodes {
    ($($name:ident = $code:literal : $class:ident,)*) => {
        /// A single virtual machine operation.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, FromPrimitive)]
        #[allow(non_camel_case_types)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $code,)*
        }
        impl Opcode {
            /// Every opcode in the table, in ascending numeric order.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            /// The mnemonic used for this opcode in listings.
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name),)*
                }
            }
            /// The operand class declared for this opcode.
            pub fn operand_class(self) -> OperandClass {
                match self {
                    $(Opcode::$name => OperandClass::$class,)*
                }
            }
        }
    };
}

opcodes! {
    POP_TOP = 1 : None,
    ROT_TWO = 2 : None,
    ROT_THREE = 3 : None,
    DUP_TOP = 4 : None,
    DUP_TOP_TWO = 5 : None,
    ROT_FOUR = 6 : None,
    NOP = 9 : None,
    UNARY_POSITIVE = 10 : None,
    UNARY_NEGATIVE = 11 : None,
    UNARY_NOT = 12 : None,
    UNARY_INVERT = 15 : None,
    BINARY_POWER = 19 : None,
    BINARY_MULTIPLY = 20 : None,
    BINARY_MODULO = 22 : None,
    BINARY_ADD = 23 : None,
    BINARY_SUBTRACT = 24 : None,
    BINARY_SUBSCR = 25 : None,
    BINARY_FLOOR_DIVIDE = 26 : None,
    BINARY_TRUE_DIVIDE = 27 : None,
    INPLACE_FLOOR_DIVIDE = 28 : None,
    INPLACE_TRUE_DIVIDE = 29 : None,
    INPLACE_ADD = 55 : None,
    INPLACE_SUBTRACT = 56 : None,
    INPLACE_MULTIPLY = 57 : None,
    INPLACE_MODULO = 59 : None,
    BINARY_LSHIFT = 62 : None,
    BINARY_RSHIFT = 63 : None,
    BINARY_AND = 64 : None,
    BINARY_XOR = 65 : None,
    BINARY_OR = 66 : None,
    INPLACE_POWER = 67 : None,
    GET_ITER = 68 : None,
    YIELD_FROM = 72 : None,
    INPLACE_LSHIFT = 75 : None,
    INPLACE_RSHIFT = 76 : None,
    INPLACE_AND = 77 : None,
    INPLACE_XOR = 78 : None,
    INPLACE_OR = 79 : None,
    RETURN_VALUE = 83 : None,
    YIELD_VALUE = 86 : None,

    STORE_NAME = 90 : Name,
    DELETE_NAME = 91 : Name,
    UNPACK_SEQUENCE = 92 : Raw,
    FOR_ITER = 93 : RelJump,
    STORE_GLOBAL = 97 : Name,
    DELETE_GLOBAL = 98 : Name,
    ROT_N = 99 : Raw,
    LOAD_CONST = 100 : Const,
    LOAD_NAME = 101 : Name,
    BUILD_TUPLE = 102 : Raw,
    BUILD_LIST = 103 : Raw,
    COMPARE_OP = 107 : Compare,
    JUMP_FORWARD = 110 : RelJump,
    JUMP_IF_FALSE_OR_POP = 111 : AbsJump,
    JUMP_IF_TRUE_OR_POP = 112 : AbsJump,
    JUMP_ABSOLUTE = 113 : AbsJump,
    POP_JUMP_IF_FALSE = 114 : AbsJump,
    POP_JUMP_IF_TRUE = 115 : AbsJump,
    LOAD_GLOBAL = 116 : Name,
    IS_OP = 117 : Raw,
    CONTAINS_OP = 118 : Raw,
    LOAD_FAST = 124 : Local,
    STORE_FAST = 125 : Local,
    DELETE_FAST = 126 : Local,
    CALL_FUNCTION = 131 : Raw,
    LOAD_CLOSURE = 135 : Free,
    LOAD_DEREF = 136 : Free,
    STORE_DEREF = 137 : Free,
    DELETE_DEREF = 138 : Free,
    EXTENDED_ARG = 144 : Raw,
}

impl Opcode {
    /// Looks up an opcode by its mnemonic.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|x| x.name() == name)
    }
    /// Checks if this opcode consumes its operand byte.
    pub fn has_argument(self) -> bool {
        self as u8 >= HAVE_ARGUMENT
    }
    pub fn is_jump(self) -> bool {
        self.operand_class().is_jump()
    }
    pub fn is_yield(self) -> bool {
        matches!(self, Opcode::YIELD_VALUE | Opcode::YIELD_FROM)
    }
    /// Net change in stack depth caused by executing this instruction with operand `arg`.
    ///
    /// For conditional jumps this is the larger of the effects along the taken and fall-through edges.
    /// The operand is ignored by opcodes which do not take one.
    pub fn stack_effect(self, arg: u32) -> i32 {
        let arg = arg.min(i32::MAX as u32) as i32;
        match self {
            Opcode::NOP | Opcode::EXTENDED_ARG => 0,
            Opcode::ROT_TWO | Opcode::ROT_THREE | Opcode::ROT_FOUR | Opcode::ROT_N => 0,
            Opcode::POP_TOP => -1,
            Opcode::DUP_TOP => 1,
            Opcode::DUP_TOP_TWO => 2,

            Opcode::UNARY_POSITIVE | Opcode::UNARY_NEGATIVE | Opcode::UNARY_NOT | Opcode::UNARY_INVERT => 0,

            Opcode::BINARY_POWER | Opcode::BINARY_MULTIPLY | Opcode::BINARY_MODULO | Opcode::BINARY_ADD
            | Opcode::BINARY_SUBTRACT | Opcode::BINARY_SUBSCR | Opcode::BINARY_FLOOR_DIVIDE | Opcode::BINARY_TRUE_DIVIDE
            | Opcode::BINARY_LSHIFT | Opcode::BINARY_RSHIFT | Opcode::BINARY_AND | Opcode::BINARY_XOR | Opcode::BINARY_OR => -1,

            Opcode::INPLACE_FLOOR_DIVIDE | Opcode::INPLACE_TRUE_DIVIDE | Opcode::INPLACE_ADD | Opcode::INPLACE_SUBTRACT
            | Opcode::INPLACE_MULTIPLY | Opcode::INPLACE_MODULO | Opcode::INPLACE_POWER | Opcode::INPLACE_LSHIFT
            | Opcode::INPLACE_RSHIFT | Opcode::INPLACE_AND | Opcode::INPLACE_XOR | Opcode::INPLACE_OR => -1,

            Opcode::GET_ITER => 0,
            Opcode::FOR_ITER => 1,
            Opcode::YIELD_VALUE => 0,
            Opcode::YIELD_FROM => -1,
            Opcode::RETURN_VALUE => -1,

            Opcode::STORE_NAME | Opcode::STORE_GLOBAL | Opcode::STORE_FAST | Opcode::STORE_DEREF => -1,
            Opcode::DELETE_NAME | Opcode::DELETE_GLOBAL | Opcode::DELETE_FAST | Opcode::DELETE_DEREF => 0,
            Opcode::LOAD_CONST | Opcode::LOAD_NAME | Opcode::LOAD_GLOBAL | Opcode::LOAD_FAST
            | Opcode::LOAD_CLOSURE | Opcode::LOAD_DEREF => 1,

            Opcode::UNPACK_SEQUENCE => arg - 1,
            Opcode::BUILD_TUPLE | Opcode::BUILD_LIST => 1 - arg,
            Opcode::CALL_FUNCTION => -arg,

            Opcode::COMPARE_OP | Opcode::IS_OP | Opcode::CONTAINS_OP => -1,

            Opcode::JUMP_FORWARD | Opcode::JUMP_ABSOLUTE => 0,
            Opcode::JUMP_IF_FALSE_OR_POP | Opcode::JUMP_IF_TRUE_OR_POP => 0,
            Opcode::POP_JUMP_IF_FALSE | Opcode::POP_JUMP_IF_TRUE => -1,
        }
    }
}

/// Number of code units needed to encode `arg`, counting the [`Opcode::EXTENDED_ARG`] prefixes.
pub fn units_for_arg(arg: u32) -> usize {
    match arg {
        0..=0xff => 1,
        0x100..=0xffff => 2,
        0x10000..=0xffffff => 3,
        _ => 4,
    }
}

#[test]
fn test_opcode_names_round_trip() {
    use num_traits::FromPrimitive;

    for &op in Opcode::ALL {
        assert_eq!(Opcode::from_name(op.name()), Some(op));
        assert_eq!(Opcode::from_u8(op as u8), Some(op));
        assert_eq!(op.has_argument(), op.operand_class() != OperandClass::None, "{op:?}");
    }
    assert_eq!(Opcode::from_name("LOAD_CONSTANT"), None);
    assert_eq!(Opcode::from_u8(0), None);
}

#[test]
fn test_units_for_arg() {
    assert_eq!(units_for_arg(0), 1);
    assert_eq!(units_for_arg(255), 1);
    assert_eq!(units_for_arg(256), 2);
    assert_eq!(units_for_arg(0xffff), 2);
    assert_eq!(units_for_arg(0x10000), 3);
    assert_eq!(units_for_arg(u32::MAX), 4);
}
