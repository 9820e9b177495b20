//! Error types for every fatal condition the interpreter can hit.
//!
//! Every category in the core is fatal by design: the interpreter assumes
//! a validated module emitted by a trusted producer and aborts rather than
//! attempting recovery. See the crate's top-level documentation for the
//! rationale.

use std::fmt;

/// A fault found while reading or decoding a module.
///
/// These are raised before the VM ever starts running and always identify
/// the specific structural condition that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    BadMagic,
    BadVersion(u32),
    UnknownSectionId(u8),
    BadTypeTag(u8),
    BadBlockType(i64),
    MultipleMemories,
    MultipleTables,
    NonMutableGlobal,
    NonI32GlobalInit,
    NonConstantOffset,
    UnknownImportModule(String),
    UnknownImportName(String),
    UnexpectedMemoryIndex,
    UnexpectedTableIndex,
    UnexpectedOpcode(u8),
    UnexpectedPrefixedOpcode(u32),
    MissingStartExport,
    LebOverflow,
    UnexpectedEof,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "bad magic number, expected `\\0asm`"),
            Self::BadVersion(v) => write!(f, "unsupported wasm version {v}, expected 1"),
            Self::UnknownSectionId(id) => write!(f, "unknown section id {id}"),
            Self::BadTypeTag(b) => write!(f, "bad type section tag 0x{b:02x}, expected 0x60"),
            Self::BadBlockType(b) => write!(f, "unexpected block type {b}"),
            Self::MultipleMemories => write!(f, "module declares more than one memory"),
            Self::MultipleTables => write!(f, "module declares more than one table"),
            Self::NonMutableGlobal => write!(f, "only mutable i32 globals are supported"),
            Self::NonI32GlobalInit => write!(f, "global initializer is not an i32.const"),
            Self::NonConstantOffset => write!(f, "offset expression is not an i32.const"),
            Self::UnknownImportModule(m) => write!(f, "unknown import module `{m}`"),
            Self::UnknownImportName(n) => write!(f, "unknown import name `{n}`"),
            Self::UnexpectedMemoryIndex => write!(f, "expected memory index 0"),
            Self::UnexpectedTableIndex => write!(f, "expected table index 0"),
            Self::UnexpectedOpcode(op) => write!(f, "unexpected opcode 0x{op:02x}"),
            Self::UnexpectedPrefixedOpcode(op) => {
                write!(f, "unexpected prefixed opcode 0x{op:02x}")
            }
            Self::MissingStartExport => write!(f, "module does not export a function named `_start`"),
            Self::LebOverflow => write!(f, "LEB128 integer overflowed its target width"),
            Self::UnexpectedEof => write!(f, "unexpected end of module bytes"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A trap raised while executing decoded bytecode.
///
/// Mirrors the WebAssembly spec's trap conditions that this interpreter
/// actually reaches (see spec.md §7); there is no resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCode {
    Unreachable,
    MemoryAccessOutOfBounds,
    TableAccessOutOfBounds,
    UninitializedElement,
    DivisionByZero,
    IntegerOverflow,
    InvalidConversionToInt,
    IndirectCallTypeMismatch,
    MemoryCopyOverlap,
}

impl TrapCode {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Unreachable => "unreachable executed",
            Self::MemoryAccessOutOfBounds => "out of bounds memory access",
            Self::TableAccessOutOfBounds => "undefined element",
            Self::UninitializedElement => "uninitialized element",
            Self::DivisionByZero => "integer divide by zero",
            Self::IntegerOverflow => "integer overflow",
            Self::InvalidConversionToInt => "invalid conversion to integer",
            Self::IndirectCallTypeMismatch => "indirect call type mismatch",
            Self::MemoryCopyOverlap => "memory.copy source and destination overlap",
        }
    }
}

impl fmt::Display for TrapCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for TrapCode {}

/// Top-level error returned by any fallible crate entry point.
#[derive(Debug)]
pub enum WaziError {
    Decode(DecodeError),
    Trap(TrapCode),
    Io(std::io::Error),
}

impl fmt::Display for WaziError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::Trap(e) => write!(f, "trap: {e}"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for WaziError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            Self::Trap(e) => Some(e),
            Self::Io(e) => Some(e),
        }
    }
}

impl From<DecodeError> for WaziError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<TrapCode> for WaziError {
    fn from(e: TrapCode) -> Self {
        Self::Trap(e)
    }
}

impl From<std::io::Error> for WaziError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
