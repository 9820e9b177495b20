//! Turns one function body's wasm bytecode into a flat `Vec<isa::Op>`.
//!
//! Single pass: structured control flow (`block`/`loop`/`if`/`else`/`end`)
//! is flattened into absolute jumps as it's read, using a label stack where
//! each open block keeps a list of instructions whose branch target isn't
//! known yet ("forward" fixups). When the block's `end` (or `if`'s `else`)
//! is reached, every fixup on its list is patched to the now-known target.
//! `loop` targets are known immediately (the top of the loop), so branches
//! to a loop label never need a fixup.
//!
//! A parallel `stack_depth` counter (not emitted, only used during decode)
//! predicts the runtime value-stack depth at every point in the body. It
//! drives two things: selecting the right width (`32`/`64`) for opcodes
//! whose runtime behavior depends on it (`drop`, `select`, `local.get`, a
//! block's exit branches), and computing the relative offset from a local
//! variable's slot to the stack pointer at each point it's accessed.

use std::sync::Arc;

use crate::bitset::{self, SmallBitset};
use crate::error::DecodeError;
use crate::isa::{BrTarget, Op, WasmOp, WasmPrefixedOp};
use crate::leb::Cursor;
use crate::module::{Module, TypeInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Block,
    Loop { entry: usize },
    If { cond_branch: usize },
    Else,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fixup {
    Simple(usize),
    Table(usize, usize),
}

struct Label {
    kind: BlockKind,
    param_count: u32,
    param_types: SmallBitset,
    result_count: u32,
    result_types: SmallBitset,
    /// Stack depth immediately before this block's params were pushed.
    base_depth: u32,
    ref_list: Vec<Fixup>,
}

impl Label {
    /// Number of values live across a branch that targets this label:
    /// a `loop`'s params (branching re-enters it), everything else's results.
    fn operand_count(&self) -> u32 {
        match self.kind {
            BlockKind::Loop { .. } => self.param_count,
            _ => self.result_count,
        }
    }

    fn operand_is_64(&self, index: u32) -> bool {
        match self.kind {
            BlockKind::Loop { .. } => self.param_types.is_set(index),
            _ => self.result_types.is_set(index),
        }
    }
}

#[derive(Debug)]
pub struct DecodedFunction {
    pub code: Vec<Op>,
    pub local_types: Vec<u32>,
    pub locals_count: u32,
}

/// Decodes every function body in the module's code section, in
/// function-index-space order (starting right after the imports).
pub fn decode_module_code(module: &Module, bytes: &[u8]) -> Result<Vec<DecodedFunction>, DecodeError> {
    let mut c = Cursor::new(bytes);
    c.set_pos(module.code_section_start);
    let count = c.read_u32_leb()?;
    if count as usize != module.func_type_idxs.len() {
        return Err(DecodeError::UnexpectedEof);
    }
    let mut out = Vec::with_capacity(count as usize);
    for &type_idx in &module.func_type_idxs {
        let body_len = c.read_u32_leb()? as usize;
        let body_end = c.pos() + body_len;
        let type_info = module
            .types
            .get(type_idx as usize)
            .ok_or(DecodeError::BadBlockType(type_idx as i64))?;
        out.push(decode_function(module, &mut c, type_info)?);
        c.set_pos(body_end);
    }
    Ok(out)
}

/// Decodes one function body, starting right after its `size` varuint.
fn decode_function(
    module: &Module,
    c: &mut Cursor,
    type_info: &TypeInfo,
) -> Result<DecodedFunction, DecodeError> {
    let mut local_types = vec![0u32; bitset::words_for_bits(type_info.param_count.max(1))];
    for i in 0..type_info.param_count {
        bitset::set_value(&mut local_types, i, type_info.param_types.is_set(i));
    }
    let mut locals_count = 0u32;

    let local_sets_count = c.read_u32_leb()?;
    for _ in 0..local_sets_count {
        let set_count = c.read_u32_leb()?;
        let local_type = c.read_i64_leb()?;
        let bit = match local_type {
            -1 | -3 => false,
            -2 | -4 => true,
            other => return Err(DecodeError::BadBlockType(other)),
        };
        let start = type_info.param_count + locals_count;
        locals_count += set_count;
        let needed_words = bitset::words_for_bits(type_info.param_count + locals_count);
        if needed_words > local_types.len() {
            local_types.resize(needed_words, 0);
        }
        for i in start..(type_info.param_count + locals_count) {
            bitset::set_value(&mut local_types, i, bit);
        }
    }

    let mut d = Decoder {
        module,
        c,
        local_types: &local_types,
        code: Vec::new(),
        stack_types: vec![0u32; 64],
        stack_depth: type_info.param_count + locals_count,
        unreachable_depth: 0,
        labels: Vec::new(),
    };
    d.labels.push(Label {
        kind: BlockKind::Block,
        param_count: 0,
        param_types: SmallBitset::default(),
        result_count: type_info.result_count,
        result_types: type_info.result_types,
        base_depth: d.stack_depth,
        ref_list: Vec::new(),
    });

    d.run()?;

    Ok(DecodedFunction {
        code: d.code,
        local_types,
        locals_count,
    })
}

struct Decoder<'m, 'c, 'b, 't> {
    module: &'m Module,
    c: &'c mut Cursor<'b>,
    local_types: &'t [u32],
    code: Vec<Op>,
    stack_types: Vec<u32>,
    stack_depth: u32,
    unreachable_depth: u32,
    labels: Vec<Label>,
}

impl<'m, 'c, 'b, 't> Decoder<'m, 'c, 'b, 't> {
    fn grow_stack_types(&mut self, index: u32) {
        let words = bitset::words_for_bits(index + 1);
        if words > self.stack_types.len() {
            self.stack_types.resize(words, 0);
        }
    }

    fn set_stack_type(&mut self, index: u32, is_64: bool) {
        self.grow_stack_types(index);
        bitset::set_value(&mut self.stack_types, index, is_64);
    }

    fn stack_type(&self, index: u32) -> bool {
        bitset::is_set(&self.stack_types, index)
    }

    fn func_type(&self, type_idx: u32) -> Result<&TypeInfo, DecodeError> {
        self.module
            .types
            .get(type_idx as usize)
            .ok_or(DecodeError::BadBlockType(type_idx as i64))
    }

    fn callee_type(&self, fn_id: u32) -> Result<&TypeInfo, DecodeError> {
        let type_idx = if (fn_id as usize) < self.module.imports.len() {
            self.module.imports[fn_id as usize].type_idx
        } else {
            self.module.func_type_idxs[fn_id as usize - self.module.imports.len()]
        };
        self.func_type(type_idx)
    }

    fn push(&mut self, op: Op) -> usize {
        self.code.push(op);
        self.code.len() - 1
    }

    fn label(&self, depth_from_top: u32) -> &Label {
        &self.labels[self.labels.len() - 1 - depth_from_top as usize]
    }

    fn patch_target(&mut self, fixup: Fixup, target: usize) {
        match fixup {
            Fixup::Simple(idx) => {
                let t = match &mut self.code[idx] {
                    Op::BrVoid(t) | Op::Br32(t) | Op::Br64(t) => t,
                    Op::BrIfNezVoid(t) | Op::BrIfNez32(t) | Op::BrIfNez64(t) => t,
                    Op::BrIfEqzVoid(t) | Op::BrIfEqz32(t) | Op::BrIfEqz64(t) => t,
                    _ => unreachable!("fixup on non-branch op"),
                };
                t.target = target;
            }
            Fixup::Table(idx, slot) => {
                let arr = match &mut self.code[idx] {
                    Op::BrTableVoid(a) | Op::BrTable32(a) | Op::BrTable64(a) => a,
                    _ => unreachable!("table fixup on non-br_table op"),
                };
                Arc::get_mut(arr).expect("br_table array has a single owner during decode")[slot]
                    .target = target;
            }
        }
    }

    /// Emits the branch op for a plain (non-table) branch to `label`, whose
    /// target isn't known yet; registers a fixup on that label.
    fn emit_forward_branch(
        &mut self,
        label_depth: u32,
        conditional: Option<bool>,
    ) -> Result<(), DecodeError> {
        let operand_count = self.label(label_depth).operand_count();
        let is_64 = operand_count == 1 && self.label(label_depth).operand_is_64(0);
        let stack_adjust = self.stack_depth - operand_count - self.label(label_depth).base_depth;

        let placeholder = BrTarget { stack_adjust, target: 0 };
        let idx = match (conditional, operand_count, is_64) {
            (None, 0, _) => self.push(Op::BrVoid(placeholder)),
            (None, _, false) => self.push(Op::Br32(placeholder)),
            (None, _, true) => self.push(Op::Br64(placeholder)),
            (Some(true), 0, _) => self.push(Op::BrIfNezVoid(placeholder)),
            (Some(true), _, false) => self.push(Op::BrIfNez32(placeholder)),
            (Some(true), _, true) => self.push(Op::BrIfNez64(placeholder)),
            (Some(false), 0, _) => self.push(Op::BrIfEqzVoid(placeholder)),
            (Some(false), _, false) => self.push(Op::BrIfEqz32(placeholder)),
            (Some(false), _, true) => self.push(Op::BrIfEqz64(placeholder)),
        };
        let label_i = self.labels.len() - 1 - label_depth as usize;
        self.labels[label_i].ref_list.push(Fixup::Simple(idx));
        Ok(())
    }

    fn run(&mut self) -> Result<(), DecodeError> {
        loop {
            let opcode_byte = self.c.read_u8()?;
            let opcode = WasmOp::from_u8(opcode_byte)
                .ok_or(DecodeError::UnexpectedOpcode(opcode_byte))?;
            let prefixed = if opcode == WasmOp::Prefixed {
                Some(
                    WasmPrefixedOp::from_u32(self.c.read_u32_leb()?)
                        .ok_or(DecodeError::UnexpectedPrefixedOpcode(0))?,
                )
            } else {
                None
            };

            let initial_stack_depth = self.stack_depth;
            if self.unreachable_depth == 0 {
                self.apply_stack_effect(opcode, prefixed)?;
            }

            let done = self.emit(opcode, prefixed, initial_stack_depth)?;

            if matches!(
                opcode,
                WasmOp::Unreachable | WasmOp::Return | WasmOp::Br | WasmOp::BrTable
            ) && self.unreachable_depth == 0
            {
                self.unreachable_depth = 1;
            }

            if done {
                return Ok(());
            }
        }
    }

    /// Mirrors the original decoder's stack-depth-delta switch, run only
    /// while reachable; also threads 32/64 width through the simulated
    /// stack so `drop`/`select`/`local.get` can pick the right variant.
    fn apply_stack_effect(
        &mut self,
        opcode: WasmOp,
        prefixed: Option<WasmPrefixedOp>,
    ) -> Result<(), DecodeError> {
        use WasmOp::*;
        match opcode {
            Unreachable | Nop | Block | Loop | Else | End | Br | Call | Return => {}
            If | BrIf | BrTable | CallIndirect | Drop | LocalSet | GlobalSet => {
                self.stack_depth -= 1;
            }
            Select => self.stack_depth -= 2,
            LocalGet => {
                // Width is set explicitly in `emit`'s `LocalGet` arm, once
                // the local's declared type has been looked up.
                self.stack_depth += 1;
            }
            GlobalGet | MemorySize | I32Const | F32Const => {
                self.stack_depth += 1;
                self.set_stack_type(self.stack_depth - 1, false);
            }
            I64Const | F64Const => {
                self.stack_depth += 1;
                self.set_stack_type(self.stack_depth - 1, true);
            }
            I32Store | I64Store | F32Store | F64Store | I32Store8 | I32Store16 | I64Store8
            | I64Store16 | I64Store32 => {
                self.stack_depth -= 2;
            }
            Prefixed => {
                use WasmPrefixedOp::*;
                match prefixed.unwrap() {
                    MemoryInit | MemoryCopy | MemoryFill | TableInit | TableCopy | TableFill
                    | DataDrop | ElemDrop => {}
                    I32TruncSatF32S | I32TruncSatF32U | I32TruncSatF64S | I32TruncSatF64U
                    | TableGrow | TableSize => {
                        self.set_stack_type(self.stack_depth - 1, false);
                    }
                    I64TruncSatF32S | I64TruncSatF32U | I64TruncSatF64S | I64TruncSatF64U => {
                        self.set_stack_type(self.stack_depth - 1, true);
                    }
                }
                return Ok(());
            }
            _ if opcode.pushes_64() => self.set_stack_type(self.stack_depth - 1, true),
            _ => self.set_stack_type(self.stack_depth - 1, false),
        }
        Ok(())
    }

    /// Reads any trailing immediate bytes and emits the flattened op(s);
    /// returns `true` once the function body (the outermost block) ends.
    fn emit(
        &mut self,
        opcode: WasmOp,
        prefixed: Option<WasmPrefixedOp>,
        initial_stack_depth: u32,
    ) -> Result<bool, DecodeError> {
        use WasmOp::*;
        match opcode {
            Unreachable => {
                if self.unreachable_depth == 0 {
                    self.push(Op::Unreachable);
                }
            }
            Nop => {}
            Block | Loop | If => self.emit_block_open(opcode)?,
            Else => self.emit_else()?,
            End => return self.emit_end(),
            Br | BrIf => {
                let label_idx = self.c.read_u32_leb()?;
                if self.unreachable_depth == 0 {
                    self.emit_forward_branch(label_idx, (opcode == BrIf).then_some(true))?;
                }
            }
            BrTable => self.emit_br_table()?,
            Call => {
                let fn_id = self.c.read_u32_leb()?;
                if self.unreachable_depth == 0 {
                    self.push(Op::Call(fn_id));
                    let type_info = *self.callee_type(fn_id)?;
                    self.stack_depth -= type_info.param_count;
                    for i in 0..type_info.result_count {
                        self.set_stack_type(self.stack_depth + i, type_info.result_types.is_set(i));
                    }
                    self.stack_depth += type_info.result_count;
                }
            }
            CallIndirect => {
                let type_idx = self.c.read_u32_leb()?;
                if self.c.read_u32_leb()? != 0 {
                    return Err(DecodeError::UnexpectedTableIndex);
                }
                if self.unreachable_depth == 0 {
                    self.push(Op::CallIndirect { type_idx });
                    let type_info = *self.func_type(type_idx)?;
                    self.stack_depth -= type_info.param_count;
                    for i in 0..type_info.result_count {
                        self.set_stack_type(self.stack_depth + i, type_info.result_types.is_set(i));
                    }
                    self.stack_depth += type_info.result_count;
                }
            }
            Return => {
                let label0 = &self.labels[0];
                let operand_count = label0.result_count;
                let is_64 = operand_count == 1 && label0.result_types.is_set(0);
                self.stack_depth -= operand_count;
                let stack_adjust = self.stack_depth;
                match (operand_count, is_64) {
                    (0, _) => self.push(Op::ReturnVoid { stack_adjust }),
                    (_, false) => self.push(Op::Return32 { stack_adjust }),
                    (_, true) => self.push(Op::Return64 { stack_adjust }),
                };
            }
            LocalGet | LocalSet | LocalTee => {
                let local_idx = self.c.read_u32_leb()?;
                if self.unreachable_depth == 0 {
                    let is_64 = self.local_is_64(local_idx)?;
                    let offset = initial_stack_depth - local_idx;
                    match (opcode, is_64) {
                        (LocalGet, false) => {
                            self.push(Op::LocalGet32(offset));
                            self.set_stack_type(self.stack_depth - 1, false);
                        }
                        (LocalGet, true) => {
                            self.push(Op::LocalGet64(offset));
                            self.set_stack_type(self.stack_depth - 1, true);
                        }
                        (LocalSet, false) => {
                            self.push(Op::LocalSet32(offset));
                        }
                        (LocalSet, true) => {
                            self.push(Op::LocalSet64(offset));
                        }
                        (LocalTee, false) => {
                            self.push(Op::LocalTee32(offset));
                            self.set_stack_type(self.stack_depth - 1, false);
                        }
                        (LocalTee, true) => {
                            self.push(Op::LocalTee64(offset));
                            self.set_stack_type(self.stack_depth - 1, true);
                        }
                        _ => unreachable!(),
                    };
                }
            }
            GlobalGet | GlobalSet => {
                let global_idx = self.c.read_u32_leb()?;
                if self.unreachable_depth == 0 {
                    match (opcode, global_idx) {
                        (GlobalGet, 0) => self.push(Op::GlobalGet0_32),
                        (GlobalGet, _) => self.push(Op::GlobalGet32(global_idx)),
                        (GlobalSet, 0) => self.push(Op::GlobalSet0_32),
                        (GlobalSet, _) => self.push(Op::GlobalSet32(global_idx)),
                        _ => unreachable!(),
                    };
                }
            }
            I32Load | I64Load | F32Load | F64Load | I32Load8S | I32Load8U | I32Load16S
            | I32Load16U | I64Load8S | I64Load8U | I64Load16S | I64Load16U | I64Load32S
            | I64Load32U | I32Store | I64Store | F32Store | F64Store | I32Store8 | I32Store16
            | I64Store8 | I64Store16 | I64Store32 => {
                let _alignment = self.c.read_u32_leb()?;
                let offset = self.c.read_u32_leb()?;
                if self.unreachable_depth == 0 {
                    self.push(Op::Wasm(opcode, offset));
                }
            }
            MemorySize | MemoryGrow => {
                if self.c.read_u8()? != 0 {
                    return Err(DecodeError::UnexpectedMemoryIndex);
                }
                if self.unreachable_depth == 0 {
                    self.push(Op::Wasm(opcode, 0));
                }
            }
            I32Const => {
                let x = self.c.read_i32_leb()?;
                if self.unreachable_depth == 0 {
                    self.push(Op::Const32(x));
                }
            }
            I64Const => {
                let x = self.c.read_i64_leb()?;
                if self.unreachable_depth == 0 {
                    self.push(Op::Const64(x));
                }
            }
            F32Const => {
                let bytes: [u8; 4] = self.c.read_bytes(4)?.try_into().unwrap();
                if self.unreachable_depth == 0 {
                    self.push(Op::Const32(i32::from_le_bytes(bytes)));
                }
            }
            F64Const => {
                let bytes: [u8; 8] = self.c.read_bytes(8)?.try_into().unwrap();
                if self.unreachable_depth == 0 {
                    self.push(Op::Const64(i64::from_le_bytes(bytes)));
                }
            }
            Drop | Select => {
                if self.unreachable_depth == 0 {
                    let is_64 = self.stack_type(self.stack_depth);
                    match (opcode, is_64) {
                        (Drop, false) => self.push(Op::Drop32),
                        (Drop, true) => self.push(Op::Drop64),
                        (Select, false) => self.push(Op::Select32),
                        (Select, true) => self.push(Op::Select64),
                        _ => unreachable!(),
                    };
                }
            }
            Prefixed => {
                let prefixed = prefixed.unwrap();
                match prefixed {
                    WasmPrefixedOp::MemoryCopy => {
                        if self.c.read_u8()? != 0 || self.c.read_u8()? != 0 {
                            return Err(DecodeError::UnexpectedMemoryIndex);
                        }
                    }
                    WasmPrefixedOp::MemoryFill => {
                        if self.c.read_u8()? != 0 {
                            return Err(DecodeError::UnexpectedMemoryIndex);
                        }
                    }
                    WasmPrefixedOp::I32TruncSatF32S
                    | WasmPrefixedOp::I32TruncSatF32U
                    | WasmPrefixedOp::I32TruncSatF64S
                    | WasmPrefixedOp::I32TruncSatF64U
                    | WasmPrefixedOp::I64TruncSatF32S
                    | WasmPrefixedOp::I64TruncSatF32U
                    | WasmPrefixedOp::I64TruncSatF64S
                    | WasmPrefixedOp::I64TruncSatF64U => {}
                    // No data/elem segments beyond active ones and no dynamic
                    // table growth are in scope; a producer emitting these
                    // opcodes is outside the narrow surface this decodes.
                    other => return Err(DecodeError::UnexpectedPrefixedOpcode(other as u32)),
                }
                if self.unreachable_depth == 0 {
                    self.push(Op::WasmPrefixed(prefixed));
                }
            }
            _ => {
                if self.unreachable_depth == 0 {
                    self.push(Op::Wasm(opcode, 0));
                }
            }
        }
        Ok(false)
    }

    fn local_is_64(&self, local_idx: u32) -> Result<bool, DecodeError> {
        Ok(bitset::is_set(self.local_types, local_idx))
    }

    fn emit_block_open(&mut self, opcode: WasmOp) -> Result<(), DecodeError> {
        let block_type = self.c.read_i64_leb()?;
        if self.unreachable_depth != 0 {
            self.unreachable_depth += 1;
            return Ok(());
        }
        let (param_count, param_types, result_count, result_types) = if block_type < 0 {
            match block_type {
                -0x40 => (0, SmallBitset::default(), 0, SmallBitset::default()),
                -1 | -3 => (0, SmallBitset::default(), 1, SmallBitset(0)),
                -2 | -4 => (0, SmallBitset::default(), 1, SmallBitset(1)),
                other => return Err(DecodeError::BadBlockType(other)),
            }
        } else {
            let t = self.func_type(block_type as u32)?;
            (t.param_count, t.param_types, t.result_count, t.result_types)
        };
        let base_depth = self.stack_depth - param_count;
        let kind = match opcode {
            WasmOp::Loop => BlockKind::Loop { entry: self.code.len() },
            WasmOp::If => {
                let idx = self.push(Op::BrIfEqzVoid(BrTarget { stack_adjust: 0, target: 0 }));
                BlockKind::If { cond_branch: idx }
            }
            _ => BlockKind::Block,
        };
        self.labels.push(Label {
            kind,
            param_count,
            param_types,
            result_count,
            result_types,
            base_depth,
            ref_list: Vec::new(),
        });
        Ok(())
    }

    fn emit_else(&mut self) -> Result<(), DecodeError> {
        if self.unreachable_depth > 1 {
            // This `if` was itself opened while already dead, so no label
            // was pushed for it; leave depth untouched for its own `end`
            // to unwind, the same as any other ghost block/loop.
            return Ok(());
        }
        let label = self.labels.last_mut().expect("else without open block");
        let cond_branch = match label.kind {
            BlockKind::If { cond_branch } => cond_branch,
            _ => panic!("else without matching if"),
        };
        label.kind = BlockKind::Else;

        if self.unreachable_depth == 0 {
            self.emit_forward_branch(0, None)?;
        } else {
            self.unreachable_depth = 0;
        }

        let after_jump = self.code.len();
        self.patch_target(Fixup::Simple(cond_branch), after_jump);

        let label = self.labels.last().unwrap();
        self.stack_depth = label.base_depth + label.param_count;
        Ok(())
    }

    fn emit_end(&mut self) -> Result<bool, DecodeError> {
        if self.unreachable_depth > 1 {
            self.unreachable_depth -= 1;
            return Ok(false);
        }
        self.unreachable_depth = 0;

        let label = self.labels.pop().expect("end without open block");
        let target = match label.kind {
            BlockKind::Loop { entry } => entry,
            BlockKind::If { cond_branch } => {
                self.patch_target(Fixup::Simple(cond_branch), self.code.len());
                self.code.len()
            }
            _ => self.code.len(),
        };
        for fixup in &label.ref_list {
            self.patch_target(*fixup, target);
        }
        self.stack_depth = label.base_depth + label.result_count;

        if self.labels.is_empty() {
            let operand_count = label.result_count;
            let is_64 = operand_count == 1 && label.result_types.is_set(0);
            self.stack_depth -= operand_count;
            let stack_adjust = self.stack_depth;
            match (operand_count, is_64) {
                (0, _) => self.push(Op::ReturnVoid { stack_adjust }),
                (_, false) => self.push(Op::Return32 { stack_adjust }),
                (_, true) => self.push(Op::Return64 { stack_adjust }),
            };
            return Ok(true);
        }
        Ok(false)
    }

    fn emit_br_table(&mut self) -> Result<(), DecodeError> {
        let labels_len = self.c.read_u32_leb()?;
        let mut label_idxs = Vec::with_capacity(labels_len as usize + 1);
        for _ in 0..=labels_len {
            label_idxs.push(self.c.read_u32_leb()?);
        }
        if self.unreachable_depth != 0 {
            return Ok(());
        }

        let first = self.label(label_idxs[0]);
        let operand_count = first.operand_count();
        let is_64 = operand_count == 1 && first.operand_is_64(0);
        let targets: Arc<[BrTarget]> =
            Arc::from(vec![BrTarget::default(); label_idxs.len()].into_boxed_slice());
        let idx = match (operand_count, is_64) {
            (0, _) => self.push(Op::BrTableVoid(targets)),
            (_, false) => self.push(Op::BrTable32(targets)),
            (_, true) => self.push(Op::BrTable64(targets)),
        };

        for (slot, label_idx) in label_idxs.into_iter().enumerate() {
            let operand_count = self.label(label_idx).operand_count();
            let stack_adjust = self.stack_depth - operand_count - self.label(label_idx).base_depth;
            self.patch_target_table_adjust(idx, slot, stack_adjust);
            let label_i = self.labels.len() - 1 - label_idx as usize;
            self.labels[label_i].ref_list.push(Fixup::Table(idx, slot));
        }
        Ok(())
    }

    fn patch_target_table_adjust(&mut self, idx: usize, slot: usize, stack_adjust: u32) {
        let arr = match &mut self.code[idx] {
            Op::BrTableVoid(a) | Op::BrTable32(a) | Op::BrTable64(a) => a,
            _ => unreachable!(),
        };
        Arc::get_mut(arr).unwrap()[slot].stack_adjust = stack_adjust;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::module::Module;

    fn decode_wat(wat: &str) -> Result<Vec<DecodedFunction>, DecodeError> {
        let wasm = wat::parse_str(wat).unwrap();
        let module = Module::parse(&wasm).unwrap();
        decode_module_code(&module, &wasm)
    }

    #[test]
    fn bulk_table_ops_are_out_of_scope() {
        let err = decode_wat(
            r#"
            (module
              (table 1 1 funcref)
              (func $_start
                i32.const 0
                i32.const 0
                i32.const 0
                table.fill)
              (export "_start" (func $_start)))
            "#,
        )
        .unwrap_err();
        assert_matches!(err, DecodeError::UnexpectedPrefixedOpcode(_));
    }

    #[test]
    fn trunc_sat_and_bulk_memory_ops_decode() {
        let functions = decode_wat(
            r#"
            (module
              (memory 1)
              (func $_start
                f32.const 1
                i32.trunc_sat_f32_s
                drop
                i32.const 0
                i32.const 0
                i32.const 0
                memory.fill)
              (export "_start" (func $_start)))
            "#,
        )
        .unwrap();
        assert_eq!(functions.len(), 1);
    }
}
