//! Opcode tables.
//!
//! `WasmOp`/`WasmPrefixedOp` mirror the raw wasm binary encoding one-to-one
//! (same discriminant values as the opcode tables in the wasm spec) and are
//! consumed only by the decoder. `Op` is the decoder's *output*: control
//! flow already flattened to absolute program counters, width already baked
//! into the variant, ready for the interpreter's dispatch loop to index
//! directly.

/// Raw one-byte wasm opcodes, values fixed by the wasm binary format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WasmOp {
    Unreachable = 0x00,
    Nop = 0x01,
    Block = 0x02,
    Loop = 0x03,
    If = 0x04,
    Else = 0x05,
    End = 0x0B,
    Br = 0x0C,
    BrIf = 0x0D,
    BrTable = 0x0E,
    Return = 0x0F,
    Call = 0x10,
    CallIndirect = 0x11,
    Drop = 0x1A,
    Select = 0x1B,
    LocalGet = 0x20,
    LocalSet = 0x21,
    LocalTee = 0x22,
    GlobalGet = 0x23,
    GlobalSet = 0x24,
    I32Load = 0x28,
    I64Load = 0x29,
    F32Load = 0x2A,
    F64Load = 0x2B,
    I32Load8S = 0x2C,
    I32Load8U = 0x2D,
    I32Load16S = 0x2E,
    I32Load16U = 0x2F,
    I64Load8S = 0x30,
    I64Load8U = 0x31,
    I64Load16S = 0x32,
    I64Load16U = 0x33,
    I64Load32S = 0x34,
    I64Load32U = 0x35,
    I32Store = 0x36,
    I64Store = 0x37,
    F32Store = 0x38,
    F64Store = 0x39,
    I32Store8 = 0x3A,
    I32Store16 = 0x3B,
    I64Store8 = 0x3C,
    I64Store16 = 0x3D,
    I64Store32 = 0x3E,
    MemorySize = 0x3F,
    MemoryGrow = 0x40,
    I32Const = 0x41,
    I64Const = 0x42,
    F32Const = 0x43,
    F64Const = 0x44,
    I32Eqz = 0x45,
    I32Eq = 0x46,
    I32Ne = 0x47,
    I32LtS = 0x48,
    I32LtU = 0x49,
    I32GtS = 0x4A,
    I32GtU = 0x4B,
    I32LeS = 0x4C,
    I32LeU = 0x4D,
    I32GeS = 0x4E,
    I32GeU = 0x4F,
    I64Eqz = 0x50,
    I64Eq = 0x51,
    I64Ne = 0x52,
    I64LtS = 0x53,
    I64LtU = 0x54,
    I64GtS = 0x55,
    I64GtU = 0x56,
    I64LeS = 0x57,
    I64LeU = 0x58,
    I64GeS = 0x59,
    I64GeU = 0x5A,
    F32Eq = 0x5B,
    F32Ne = 0x5C,
    F32Lt = 0x5D,
    F32Gt = 0x5E,
    F32Le = 0x5F,
    F32Ge = 0x60,
    F64Eq = 0x61,
    F64Ne = 0x62,
    F64Lt = 0x63,
    F64Gt = 0x64,
    F64Le = 0x65,
    F64Ge = 0x66,
    I32Clz = 0x67,
    I32Ctz = 0x68,
    I32Popcnt = 0x69,
    I32Add = 0x6A,
    I32Sub = 0x6B,
    I32Mul = 0x6C,
    I32DivS = 0x6D,
    I32DivU = 0x6E,
    I32RemS = 0x6F,
    I32RemU = 0x70,
    I32And = 0x71,
    I32Or = 0x72,
    I32Xor = 0x73,
    I32Shl = 0x74,
    I32ShrS = 0x75,
    I32ShrU = 0x76,
    I32Rotl = 0x77,
    I32Rotr = 0x78,
    I64Clz = 0x79,
    I64Ctz = 0x7A,
    I64Popcnt = 0x7B,
    I64Add = 0x7C,
    I64Sub = 0x7D,
    I64Mul = 0x7E,
    I64DivS = 0x7F,
    I64DivU = 0x80,
    I64RemS = 0x81,
    I64RemU = 0x82,
    I64And = 0x83,
    I64Or = 0x84,
    I64Xor = 0x85,
    I64Shl = 0x86,
    I64ShrS = 0x87,
    I64ShrU = 0x88,
    I64Rotl = 0x89,
    I64Rotr = 0x8A,
    F32Abs = 0x8B,
    F32Neg = 0x8C,
    F32Ceil = 0x8D,
    F32Floor = 0x8E,
    F32Trunc = 0x8F,
    F32Nearest = 0x90,
    F32Sqrt = 0x91,
    F32Add = 0x92,
    F32Sub = 0x93,
    F32Mul = 0x94,
    F32Div = 0x95,
    F32Min = 0x96,
    F32Max = 0x97,
    F32Copysign = 0x98,
    F64Abs = 0x99,
    F64Neg = 0x9A,
    F64Ceil = 0x9B,
    F64Floor = 0x9C,
    F64Trunc = 0x9D,
    F64Nearest = 0x9E,
    F64Sqrt = 0x9F,
    F64Add = 0xA0,
    F64Sub = 0xA1,
    F64Mul = 0xA2,
    F64Div = 0xA3,
    F64Min = 0xA4,
    F64Max = 0xA5,
    F64Copysign = 0xA6,
    I32WrapI64 = 0xA7,
    I32TruncF32S = 0xA8,
    I32TruncF32U = 0xA9,
    I32TruncF64S = 0xAA,
    I32TruncF64U = 0xAB,
    I64ExtendI32S = 0xAC,
    I64ExtendI32U = 0xAD,
    I64TruncF32S = 0xAE,
    I64TruncF32U = 0xAF,
    I64TruncF64S = 0xB0,
    I64TruncF64U = 0xB1,
    F32ConvertI32S = 0xB2,
    F32ConvertI32U = 0xB3,
    F32ConvertI64S = 0xB4,
    F32ConvertI64U = 0xB5,
    F32DemoteF64 = 0xB6,
    F64ConvertI32S = 0xB7,
    F64ConvertI32U = 0xB8,
    F64ConvertI64S = 0xB9,
    F64ConvertI64U = 0xBA,
    F64PromoteF32 = 0xBB,
    I32ReinterpretF32 = 0xBC,
    I64ReinterpretF64 = 0xBD,
    F32ReinterpretI32 = 0xBE,
    F64ReinterpretI64 = 0xBF,
    I32Extend8S = 0xC0,
    I32Extend16S = 0xC1,
    I64Extend8S = 0xC2,
    I64Extend16S = 0xC3,
    I64Extend32S = 0xC4,
    Prefixed = 0xFC,
}

impl WasmOp {
    pub fn from_u8(b: u8) -> Option<Self> {
        use WasmOp::*;
        Some(match b {
            0x00 => Unreachable,
            0x01 => Nop,
            0x02 => Block,
            0x03 => Loop,
            0x04 => If,
            0x05 => Else,
            0x0B => End,
            0x0C => Br,
            0x0D => BrIf,
            0x0E => BrTable,
            0x0F => Return,
            0x10 => Call,
            0x11 => CallIndirect,
            0x1A => Drop,
            0x1B => Select,
            0x20 => LocalGet,
            0x21 => LocalSet,
            0x22 => LocalTee,
            0x23 => GlobalGet,
            0x24 => GlobalSet,
            0x28 => I32Load,
            0x29 => I64Load,
            0x2A => F32Load,
            0x2B => F64Load,
            0x2C => I32Load8S,
            0x2D => I32Load8U,
            0x2E => I32Load16S,
            0x2F => I32Load16U,
            0x30 => I64Load8S,
            0x31 => I64Load8U,
            0x32 => I64Load16S,
            0x33 => I64Load16U,
            0x34 => I64Load32S,
            0x35 => I64Load32U,
            0x36 => I32Store,
            0x37 => I64Store,
            0x38 => F32Store,
            0x39 => F64Store,
            0x3A => I32Store8,
            0x3B => I32Store16,
            0x3C => I64Store8,
            0x3D => I64Store16,
            0x3E => I64Store32,
            0x3F => MemorySize,
            0x40 => MemoryGrow,
            0x41 => I32Const,
            0x42 => I64Const,
            0x43 => F32Const,
            0x44 => F64Const,
            0x45 => I32Eqz,
            0x46 => I32Eq,
            0x47 => I32Ne,
            0x48 => I32LtS,
            0x49 => I32LtU,
            0x4A => I32GtS,
            0x4B => I32GtU,
            0x4C => I32LeS,
            0x4D => I32LeU,
            0x4E => I32GeS,
            0x4F => I32GeU,
            0x50 => I64Eqz,
            0x51 => I64Eq,
            0x52 => I64Ne,
            0x53 => I64LtS,
            0x54 => I64LtU,
            0x55 => I64GtS,
            0x56 => I64GtU,
            0x57 => I64LeS,
            0x58 => I64LeU,
            0x59 => I64GeS,
            0x5A => I64GeU,
            0x5B => F32Eq,
            0x5C => F32Ne,
            0x5D => F32Lt,
            0x5E => F32Gt,
            0x5F => F32Le,
            0x60 => F32Ge,
            0x61 => F64Eq,
            0x62 => F64Ne,
            0x63 => F64Lt,
            0x64 => F64Gt,
            0x65 => F64Le,
            0x66 => F64Ge,
            0x67 => I32Clz,
            0x68 => I32Ctz,
            0x69 => I32Popcnt,
            0x6A => I32Add,
            0x6B => I32Sub,
            0x6C => I32Mul,
            0x6D => I32DivS,
            0x6E => I32DivU,
            0x6F => I32RemS,
            0x70 => I32RemU,
            0x71 => I32And,
            0x72 => I32Or,
            0x73 => I32Xor,
            0x74 => I32Shl,
            0x75 => I32ShrS,
            0x76 => I32ShrU,
            0x77 => I32Rotl,
            0x78 => I32Rotr,
            0x79 => I64Clz,
            0x7A => I64Ctz,
            0x7B => I64Popcnt,
            0x7C => I64Add,
            0x7D => I64Sub,
            0x7E => I64Mul,
            0x7F => I64DivS,
            0x80 => I64DivU,
            0x81 => I64RemS,
            0x82 => I64RemU,
            0x83 => I64And,
            0x84 => I64Or,
            0x85 => I64Xor,
            0x86 => I64Shl,
            0x87 => I64ShrS,
            0x88 => I64ShrU,
            0x89 => I64Rotl,
            0x8A => I64Rotr,
            0x8B => F32Abs,
            0x8C => F32Neg,
            0x8D => F32Ceil,
            0x8E => F32Floor,
            0x8F => F32Trunc,
            0x90 => F32Nearest,
            0x91 => F32Sqrt,
            0x92 => F32Add,
            0x93 => F32Sub,
            0x94 => F32Mul,
            0x95 => F32Div,
            0x96 => F32Min,
            0x97 => F32Max,
            0x98 => F32Copysign,
            0x99 => F64Abs,
            0x9A => F64Neg,
            0x9B => F64Ceil,
            0x9C => F64Floor,
            0x9D => F64Trunc,
            0x9E => F64Nearest,
            0x9F => F64Sqrt,
            0xA0 => F64Add,
            0xA1 => F64Sub,
            0xA2 => F64Mul,
            0xA3 => F64Div,
            0xA4 => F64Min,
            0xA5 => F64Max,
            0xA6 => F64Copysign,
            0xA7 => I32WrapI64,
            0xA8 => I32TruncF32S,
            0xA9 => I32TruncF32U,
            0xAA => I32TruncF64S,
            0xAB => I32TruncF64U,
            0xAC => I64ExtendI32S,
            0xAD => I64ExtendI32U,
            0xAE => I64TruncF32S,
            0xAF => I64TruncF32U,
            0xB0 => I64TruncF64S,
            0xB1 => I64TruncF64U,
            0xB2 => F32ConvertI32S,
            0xB3 => F32ConvertI32U,
            0xB4 => F32ConvertI64S,
            0xB5 => F32ConvertI64U,
            0xB6 => F32DemoteF64,
            0xB7 => F64ConvertI32S,
            0xB8 => F64ConvertI32U,
            0xB9 => F64ConvertI64S,
            0xBA => F64ConvertI64U,
            0xBB => F64PromoteF32,
            0xBC => I32ReinterpretF32,
            0xBD => I64ReinterpretF64,
            0xBE => F32ReinterpretI32,
            0xBF => F64ReinterpretI64,
            0xC0 => I32Extend8S,
            0xC1 => I32Extend16S,
            0xC2 => I64Extend8S,
            0xC3 => I64Extend16S,
            0xC4 => I64Extend32S,
            0xFC => Prefixed,
            _ => return None,
        })
    }

    /// True for opcodes whose result (if any) is a 64-bit value, used by the
    /// decoder to pick the right `Op::Wasm` stack-depth delta.
    pub fn pushes_64(self) -> bool {
        use WasmOp::*;
        matches!(
            self,
            I64Load
                | I64Load8S
                | I64Load8U
                | I64Load16S
                | I64Load16U
                | I64Load32S
                | I64Load32U
                | F64Load
                | I64Const
                | F64Const
                | I64Clz
                | I64Ctz
                | I64Popcnt
                | I64Add
                | I64Sub
                | I64Mul
                | I64DivS
                | I64DivU
                | I64RemS
                | I64RemU
                | I64And
                | I64Or
                | I64Xor
                | I64Shl
                | I64ShrS
                | I64ShrU
                | I64Rotl
                | I64Rotr
                | F64Abs
                | F64Neg
                | F64Ceil
                | F64Floor
                | F64Trunc
                | F64Nearest
                | F64Sqrt
                | F64Add
                | F64Sub
                | F64Mul
                | F64Div
                | F64Min
                | F64Max
                | F64Copysign
                | I64ExtendI32S
                | I64ExtendI32U
                | I64TruncF32S
                | I64TruncF32U
                | I64TruncF64S
                | I64TruncF64U
                | F64ConvertI32S
                | F64ConvertI32U
                | F64ConvertI64S
                | F64ConvertI64U
                | F64PromoteF32
                | I64ReinterpretF64
                | F64ReinterpretI64
                | I64Extend8S
                | I64Extend16S
                | I64Extend32S
        )
    }
}

/// Opcodes behind the `0xFC` prefix byte (saturating truncation, bulk memory/table ops).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WasmPrefixedOp {
    I32TruncSatF32S = 0x00,
    I32TruncSatF32U = 0x01,
    I32TruncSatF64S = 0x02,
    I32TruncSatF64U = 0x03,
    I64TruncSatF32S = 0x04,
    I64TruncSatF32U = 0x05,
    I64TruncSatF64S = 0x06,
    I64TruncSatF64U = 0x07,
    MemoryInit = 0x08,
    DataDrop = 0x09,
    MemoryCopy = 0x0A,
    MemoryFill = 0x0B,
    TableInit = 0x0C,
    ElemDrop = 0x0D,
    TableCopy = 0x0E,
    TableGrow = 0x0F,
    TableSize = 0x10,
    TableFill = 0x11,
}

impl WasmPrefixedOp {
    pub fn from_u32(v: u32) -> Option<Self> {
        use WasmPrefixedOp::*;
        Some(match v {
            0x00 => I32TruncSatF32S,
            0x01 => I32TruncSatF32U,
            0x02 => I32TruncSatF64S,
            0x03 => I32TruncSatF64U,
            0x04 => I64TruncSatF32S,
            0x05 => I64TruncSatF32U,
            0x06 => I64TruncSatF64S,
            0x07 => I64TruncSatF64U,
            0x08 => MemoryInit,
            0x09 => DataDrop,
            0x0A => MemoryCopy,
            0x0B => MemoryFill,
            0x0C => TableInit,
            0x0D => ElemDrop,
            0x0E => TableCopy,
            0x0F => TableGrow,
            0x10 => TableSize,
            0x11 => TableFill,
            _ => return None,
        })
    }
}

/// A branch target: how far to shrink the stack by before jumping, and
/// where to jump to, both resolved to concrete values by the time the
/// decoder finishes with the enclosing block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrTarget {
    pub stack_adjust: u32,
    pub target: usize,
}

/// The decoder's flattened output instruction set.
///
/// Branch/return/local/global variants are split into `Void`/`32`/`64`
/// forms so the interpreter never has to consult a bitmap at dispatch time;
/// width is already baked into the opcode. Every branch target is an
/// absolute index into the enclosing function's instruction vector,
/// resolved by the label-stack back-patching pass in `decode`.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Unreachable,
    BrVoid(BrTarget),
    Br32(BrTarget),
    Br64(BrTarget),
    BrIfNezVoid(BrTarget),
    BrIfNez32(BrTarget),
    BrIfNez64(BrTarget),
    BrIfEqzVoid(BrTarget),
    BrIfEqz32(BrTarget),
    BrIfEqz64(BrTarget),
    BrTableVoid(std::sync::Arc<[BrTarget]>),
    BrTable32(std::sync::Arc<[BrTarget]>),
    BrTable64(std::sync::Arc<[BrTarget]>),
    /// `stack_adjust` shrinks the value stack back down to the frame's base
    /// (past locals and params); the return address itself lives on a
    /// separate native call stack, not on this one.
    ReturnVoid { stack_adjust: u32 },
    Return32 { stack_adjust: u32 },
    Return64 { stack_adjust: u32 },
    Call(u32),
    CallIndirect { type_idx: u32 },
    Drop32,
    Drop64,
    Select32,
    Select64,
    /// Offset back from the current stack top to the local's slot.
    LocalGet32(u32),
    LocalGet64(u32),
    LocalSet32(u32),
    LocalSet64(u32),
    LocalTee32(u32),
    LocalTee64(u32),
    GlobalGet0_32,
    GlobalGet32(u32),
    GlobalSet0_32,
    GlobalSet32(u32),
    Const32(i32),
    Const64(i64),
    /// Pass-through for everything decoded 1:1 (loads, stores, arithmetic,
    /// comparisons, conversions). `offset` is only meaningful for loads/stores.
    Wasm(WasmOp, u32),
    WasmPrefixed(WasmPrefixedOp),
}
