//! The dispatch loop: walks a function's flattened [`isa::Op`] stream against
//! a unified 64-bit value stack, routing `call` to either another decoded
//! function or the WASI host.
//!
//! Grounded on `original_source/src/main.c`'s `vm_run` switch (the per-op
//! pop/push sequences, the `br_table` clamp-not-trap rule, the `memory.copy`
//! non-overlap assertion) with one structural departure: the original saves
//! a callee's return PC as two words inline on the same stack the operands
//! live on. Here the return address lives on a separate native `Vec<Frame>`,
//! since Rust already gives a call stack shape for free and splitting it out
//! keeps `decode`'s stack-depth bookkeeping free of an ever-present "+2".

use std::path::Path;

use crate::decode::DecodedFunction;
use crate::error::{TrapCode, WaziError};
use crate::isa::{BrTarget, Op, WasmOp, WasmPrefixedOp};
use crate::memory::Memory;
use crate::module::Module;
use crate::wasi;

struct Frame {
    return_fn: u32,
    return_pc: usize,
}

pub struct Vm {
    module: Module,
    functions: Vec<DecodedFunction>,
    memory: Memory,
    globals: Vec<u32>,
    table: Vec<u32>,
    stack: Vec<u64>,
    call_stack: Vec<Frame>,
    host: wasi::Host,
}

impl Vm {
    pub fn new(
        wasm_bytes: &[u8],
        module: Module,
        functions: Vec<DecodedFunction>,
        zig_lib_dir: &Path,
        zig_cache_dir: &Path,
        args: Vec<String>,
    ) -> Result<Self, WaziError> {
        let mut memory = Memory::new(module.memory_pages)?;
        for segment in &module.data_segments {
            let bytes = &wasm_bytes[segment.range.0..segment.range.1];
            memory.write_data_segment(segment.offset, bytes);
        }
        let globals = module.globals_init.iter().map(|&g| g as u32).collect();
        let table = module.table_init.clone();
        let host = wasi::Host::new(zig_lib_dir, zig_cache_dir, args)?;
        Ok(Self {
            module,
            functions,
            memory,
            globals,
            table,
            stack: Vec::new(),
            call_stack: Vec::new(),
            host,
        })
    }

    fn push_u32(&mut self, v: u32) {
        self.stack.push(v as u64);
    }

    fn push_u64(&mut self, v: u64) {
        self.stack.push(v);
    }

    fn pop_u32(&mut self) -> u32 {
        self.stack.pop().expect("decoder guarantees stack is non-empty") as u32
    }

    fn pop_u64(&mut self) -> u64 {
        self.stack.pop().expect("decoder guarantees stack is non-empty")
    }

    fn push_f32(&mut self, v: f32) {
        self.push_u32(v.to_bits());
    }

    fn pop_f32(&mut self) -> f32 {
        f32::from_bits(self.pop_u32())
    }

    fn push_f64(&mut self, v: f64) {
        self.push_u64(v.to_bits());
    }

    fn pop_f64(&mut self) -> f64 {
        f64::from_bits(self.pop_u64())
    }

    fn local_slot(&self, offset: u32) -> usize {
        self.stack.len() - offset as usize
    }

    fn mem_range(&self, addr: u32, len: u32) -> Result<std::ops::Range<usize>, WaziError> {
        let start = addr as usize;
        let end = start
            .checked_add(len as usize)
            .ok_or(WaziError::from(TrapCode::MemoryAccessOutOfBounds))?;
        if end > self.memory.len() {
            return Err(TrapCode::MemoryAccessOutOfBounds.into());
        }
        Ok(start..end)
    }

    /// Runs `_start` to completion, returning the process exit code.
    pub fn run(&mut self) -> Result<i32, WaziError> {
        let start_fn_idx = self.module.start_fn_idx;
        let mut current_fn = start_fn_idx - self.module.imports.len() as u32;
        let locals_count = self.functions[current_fn as usize].locals_count;
        self.stack.resize(locals_count as usize, 0);
        let mut pc = 0usize;

        loop {
            let op = self.functions[current_fn as usize].code[pc].clone();
            match op {
                Op::Unreachable => return Err(TrapCode::Unreachable.into()),

                Op::BrVoid(t) => {
                    self.branch_void(t);
                    pc = t.target;
                    continue;
                }
                Op::Br32(t) => {
                    self.branch_32(t);
                    pc = t.target;
                    continue;
                }
                Op::Br64(t) => {
                    self.branch_64(t);
                    pc = t.target;
                    continue;
                }
                Op::BrIfNezVoid(t) => {
                    if self.pop_u32() != 0 {
                        self.branch_void(t);
                        pc = t.target;
                        continue;
                    }
                }
                Op::BrIfNez32(t) => {
                    if self.pop_u32() != 0 {
                        self.branch_32(t);
                        pc = t.target;
                        continue;
                    }
                }
                Op::BrIfNez64(t) => {
                    if self.pop_u32() != 0 {
                        self.branch_64(t);
                        pc = t.target;
                        continue;
                    }
                }
                Op::BrIfEqzVoid(t) => {
                    if self.pop_u32() == 0 {
                        self.branch_void(t);
                        pc = t.target;
                        continue;
                    }
                }
                Op::BrIfEqz32(t) => {
                    if self.pop_u32() == 0 {
                        self.branch_32(t);
                        pc = t.target;
                        continue;
                    }
                }
                Op::BrIfEqz64(t) => {
                    if self.pop_u32() == 0 {
                        self.branch_64(t);
                        pc = t.target;
                        continue;
                    }
                }
                Op::BrTableVoid(ref targets) => {
                    let t = Self::clamp_br_table(targets, self.pop_u32());
                    self.branch_void(t);
                    pc = t.target;
                    continue;
                }
                Op::BrTable32(ref targets) => {
                    let t = Self::clamp_br_table(targets, self.pop_u32());
                    self.branch_32(t);
                    pc = t.target;
                    continue;
                }
                Op::BrTable64(ref targets) => {
                    let t = Self::clamp_br_table(targets, self.pop_u32());
                    self.branch_64(t);
                    pc = t.target;
                    continue;
                }

                Op::ReturnVoid { stack_adjust } => {
                    self.stack.truncate(self.stack.len() - stack_adjust as usize);
                    match self.call_stack.pop() {
                        Some(frame) => {
                            current_fn = frame.return_fn;
                            pc = frame.return_pc;
                            continue;
                        }
                        None => return Ok(0),
                    }
                }
                Op::Return32 { stack_adjust } => {
                    let v = self.pop_u32();
                    self.stack.truncate(self.stack.len() - stack_adjust as usize);
                    self.push_u32(v);
                    match self.call_stack.pop() {
                        Some(frame) => {
                            current_fn = frame.return_fn;
                            pc = frame.return_pc;
                            continue;
                        }
                        None => return Ok(0),
                    }
                }
                Op::Return64 { stack_adjust } => {
                    let v = self.pop_u64();
                    self.stack.truncate(self.stack.len() - stack_adjust as usize);
                    self.push_u64(v);
                    match self.call_stack.pop() {
                        Some(frame) => {
                            current_fn = frame.return_fn;
                            pc = frame.return_pc;
                            continue;
                        }
                        None => return Ok(0),
                    }
                }

                Op::Call(fn_id) => {
                    if let Some(exit_code) = self.call(fn_id, current_fn, pc + 1)? {
                        return Ok(exit_code);
                    }
                    if (fn_id as usize) < self.module.imports.len() {
                        pc += 1;
                        continue;
                    }
                    current_fn = fn_id - self.module.imports.len() as u32;
                    pc = 0;
                    continue;
                }
                Op::CallIndirect { type_idx } => {
                    let idx = self.pop_u32() as usize;
                    let fn_id = *self
                        .table
                        .get(idx)
                        .ok_or(TrapCode::TableAccessOutOfBounds)?;
                    let callee_type = self.callee_type_info(fn_id);
                    let wanted_type = self.module.types[type_idx as usize];
                    if !types_match(&callee_type, &wanted_type) {
                        return Err(TrapCode::IndirectCallTypeMismatch.into());
                    }
                    if let Some(exit_code) = self.call(fn_id, current_fn, pc + 1)? {
                        return Ok(exit_code);
                    }
                    if (fn_id as usize) < self.module.imports.len() {
                        pc += 1;
                        continue;
                    }
                    current_fn = fn_id - self.module.imports.len() as u32;
                    pc = 0;
                    continue;
                }

                Op::Drop32 | Op::Drop64 => {
                    self.stack.pop();
                }
                Op::Select32 => {
                    let cond = self.pop_u32();
                    let b = self.pop_u32();
                    let a = self.pop_u32();
                    self.push_u32(if cond != 0 { a } else { b });
                }
                Op::Select64 => {
                    let cond = self.pop_u32();
                    let b = self.pop_u64();
                    let a = self.pop_u64();
                    self.push_u64(if cond != 0 { a } else { b });
                }

                Op::LocalGet32(offset) => {
                    let v = self.stack[self.local_slot(offset)] as u32;
                    self.push_u32(v);
                }
                Op::LocalGet64(offset) => {
                    let v = self.stack[self.local_slot(offset)];
                    self.push_u64(v);
                }
                Op::LocalSet32(offset) => {
                    let v = self.pop_u32();
                    let idx = self.local_slot(offset);
                    self.stack[idx] = v as u64;
                }
                Op::LocalSet64(offset) => {
                    let v = self.pop_u64();
                    let idx = self.local_slot(offset);
                    self.stack[idx] = v;
                }
                Op::LocalTee32(offset) | Op::LocalTee64(offset) => {
                    let v = *self.stack.last().expect("decoder guarantees stack is non-empty");
                    let idx = self.local_slot(offset);
                    self.stack[idx] = v;
                }

                Op::GlobalGet0_32 => self.push_u32(self.globals[0]),
                Op::GlobalGet32(idx) => self.push_u32(self.globals[idx as usize]),
                Op::GlobalSet0_32 => {
                    let v = self.pop_u32();
                    self.globals[0] = v;
                }
                Op::GlobalSet32(idx) => {
                    let v = self.pop_u32();
                    self.globals[idx as usize] = v;
                }

                Op::Const32(x) => self.push_u32(x as u32),
                Op::Const64(x) => self.push_u64(x as u64),

                Op::Wasm(op, offset) => self.exec_wasm(op, offset)?,
                Op::WasmPrefixed(op) => self.exec_prefixed(op)?,
            }
            pc += 1;
        }
    }

    fn branch_void(&mut self, t: BrTarget) {
        self.stack.truncate(self.stack.len() - t.stack_adjust as usize);
    }

    fn branch_32(&mut self, t: BrTarget) {
        let v = self.pop_u32();
        self.stack.truncate(self.stack.len() - t.stack_adjust as usize);
        self.push_u32(v);
    }

    fn branch_64(&mut self, t: BrTarget) {
        let v = self.pop_u64();
        self.stack.truncate(self.stack.len() - t.stack_adjust as usize);
        self.push_u64(v);
    }

    /// `br_table` clamps an out-of-range index to the default (last) entry
    /// rather than trapping.
    fn clamp_br_table(targets: &[BrTarget], index: u32) -> BrTarget {
        let clamped = (index as usize).min(targets.len() - 1);
        targets[clamped]
    }

    fn callee_type_idx(&self, fn_id: u32) -> u32 {
        if (fn_id as usize) < self.module.imports.len() {
            self.module.imports[fn_id as usize].type_idx
        } else {
            self.module.func_type_idxs[fn_id as usize - self.module.imports.len()]
        }
    }

    fn callee_type_info(&self, fn_id: u32) -> crate::module::TypeInfo {
        self.module.types[self.callee_type_idx(fn_id) as usize]
    }

    /// Dispatches `call`/`call_indirect` to either the WASI host (returning
    /// `Some(exit_code)` only for `proc_exit`) or a regular function (pushes
    /// a return frame and leaves the caller to jump).
    fn call(&mut self, fn_id: u32, current_fn: u32, return_pc: usize) -> Result<Option<i32>, WaziError> {
        if (fn_id as usize) < self.module.imports.len() {
            return self.call_import(fn_id);
        }
        let callee = fn_id - self.module.imports.len() as u32;
        self.call_stack.push(Frame { return_fn: current_fn, return_pc });
        let locals_count = self.functions[callee as usize].locals_count;
        self.stack.resize(self.stack.len() + locals_count as usize, 0);
        Ok(None)
    }

    fn call_import(&mut self, fn_id: u32) -> Result<Option<i32>, WaziError> {
        let import_name = self.module.imports[fn_id as usize].name;
        let type_idx = self.module.imports[fn_id as usize].type_idx;
        let type_info = self.module.types[type_idx as usize];
        let mut args = vec![0u64; type_info.param_count as usize];
        for i in (0..type_info.param_count).rev() {
            args[i as usize] = if type_info.param_types.is_set(i) {
                self.pop_u64()
            } else {
                self.pop_u32() as u64
            };
        }
        match self.host.call(import_name, &args, &mut self.memory)? {
            wasi::Outcome::Exit(code) => Ok(Some(code)),
            wasi::Outcome::Results(results) => {
                for (i, r) in results.into_iter().enumerate() {
                    if type_info.result_types.is_set(i as u32) {
                        self.push_u64(r);
                    } else {
                        self.push_u32(r as u32);
                    }
                }
                Ok(None)
            }
        }
    }

    fn exec_wasm(&mut self, op: WasmOp, offset: u32) -> Result<(), WaziError> {
        use WasmOp::*;
        match op {
            I32Load => {
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 4)?;
                self.push_u32(u32::from_le_bytes(self.memory.data()[range].try_into().unwrap()));
            }
            I64Load => {
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 8)?;
                self.push_u64(u64::from_le_bytes(self.memory.data()[range].try_into().unwrap()));
            }
            F32Load => {
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 4)?;
                self.push_u32(u32::from_le_bytes(self.memory.data()[range].try_into().unwrap()));
            }
            F64Load => {
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 8)?;
                self.push_u64(u64::from_le_bytes(self.memory.data()[range].try_into().unwrap()));
            }
            I32Load8S => {
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 1)?;
                self.push_u32(self.memory.data()[range][0] as i8 as i32 as u32);
            }
            I32Load8U => {
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 1)?;
                self.push_u32(self.memory.data()[range][0] as u32);
            }
            I32Load16S => {
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 2)?;
                let v = u16::from_le_bytes(self.memory.data()[range].try_into().unwrap());
                self.push_u32(v as i16 as i32 as u32);
            }
            I32Load16U => {
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 2)?;
                let v = u16::from_le_bytes(self.memory.data()[range].try_into().unwrap());
                self.push_u32(v as u32);
            }
            I64Load8S => {
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 1)?;
                self.push_u64(self.memory.data()[range][0] as i8 as i64 as u64);
            }
            I64Load8U => {
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 1)?;
                self.push_u64(self.memory.data()[range][0] as u64);
            }
            I64Load16S => {
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 2)?;
                let v = u16::from_le_bytes(self.memory.data()[range].try_into().unwrap());
                self.push_u64(v as i16 as i64 as u64);
            }
            I64Load16U => {
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 2)?;
                let v = u16::from_le_bytes(self.memory.data()[range].try_into().unwrap());
                self.push_u64(v as u64);
            }
            I64Load32S => {
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 4)?;
                let v = u32::from_le_bytes(self.memory.data()[range].try_into().unwrap());
                self.push_u64(v as i32 as i64 as u64);
            }
            I64Load32U => {
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 4)?;
                let v = u32::from_le_bytes(self.memory.data()[range].try_into().unwrap());
                self.push_u64(v as u64);
            }
            I32Store | F32Store => {
                let value = self.pop_u32();
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 4)?;
                self.memory.data_mut()[range].copy_from_slice(&value.to_le_bytes());
            }
            I64Store | F64Store => {
                let value = self.pop_u64();
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 8)?;
                self.memory.data_mut()[range].copy_from_slice(&value.to_le_bytes());
            }
            I32Store8 => {
                let value = self.pop_u32();
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 1)?;
                self.memory.data_mut()[range][0] = value as u8;
            }
            I32Store16 => {
                let value = self.pop_u32();
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 2)?;
                self.memory.data_mut()[range].copy_from_slice(&(value as u16).to_le_bytes());
            }
            I64Store8 => {
                let value = self.pop_u64();
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 1)?;
                self.memory.data_mut()[range][0] = value as u8;
            }
            I64Store16 => {
                let value = self.pop_u64();
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 2)?;
                self.memory.data_mut()[range].copy_from_slice(&(value as u16).to_le_bytes());
            }
            I64Store32 => {
                let value = self.pop_u64();
                let addr = offset + self.pop_u32();
                let range = self.mem_range(addr, 4)?;
                self.memory.data_mut()[range].copy_from_slice(&(value as u32).to_le_bytes());
            }
            MemorySize => self.push_u32(self.memory.pages()),
            MemoryGrow => {
                let delta = self.pop_u32();
                match self.memory.grow(delta) {
                    Some(old) => self.push_u32(old),
                    None => self.push_u32(u32::MAX),
                }
            }

            I32Eqz => {
                let a = self.pop_u32();
                self.push_u32((a == 0) as u32);
            }
            I32Eq => self.cmp_u32(|a, b| a == b),
            I32Ne => self.cmp_u32(|a, b| a != b),
            I32LtS => self.cmp_i32(|a, b| a < b),
            I32LtU => self.cmp_u32(|a, b| a < b),
            I32GtS => self.cmp_i32(|a, b| a > b),
            I32GtU => self.cmp_u32(|a, b| a > b),
            I32LeS => self.cmp_i32(|a, b| a <= b),
            I32LeU => self.cmp_u32(|a, b| a <= b),
            I32GeS => self.cmp_i32(|a, b| a >= b),
            I32GeU => self.cmp_u32(|a, b| a >= b),
            I64Eqz => {
                let a = self.pop_u64();
                self.push_u32((a == 0) as u32);
            }
            I64Eq => self.cmp_u64(|a, b| a == b),
            I64Ne => self.cmp_u64(|a, b| a != b),
            I64LtS => self.cmp_i64(|a, b| a < b),
            I64LtU => self.cmp_u64(|a, b| a < b),
            I64GtS => self.cmp_i64(|a, b| a > b),
            I64GtU => self.cmp_u64(|a, b| a > b),
            I64LeS => self.cmp_i64(|a, b| a <= b),
            I64LeU => self.cmp_u64(|a, b| a <= b),
            I64GeS => self.cmp_i64(|a, b| a >= b),
            I64GeU => self.cmp_u64(|a, b| a >= b),
            F32Eq => self.cmp_f32(|a, b| a == b),
            F32Ne => self.cmp_f32(|a, b| a != b),
            F32Lt => self.cmp_f32(|a, b| a < b),
            F32Gt => self.cmp_f32(|a, b| a > b),
            F32Le => self.cmp_f32(|a, b| a <= b),
            F32Ge => self.cmp_f32(|a, b| a >= b),
            // f64.lt must use strict `<`: NaN comparisons fall out correctly
            // since Rust's `<` on floats already returns false for NaN.
            F64Eq => self.cmp_f64(|a, b| a == b),
            F64Ne => self.cmp_f64(|a, b| a != b),
            F64Lt => self.cmp_f64(|a, b| a < b),
            F64Gt => self.cmp_f64(|a, b| a > b),
            F64Le => self.cmp_f64(|a, b| a <= b),
            F64Ge => self.cmp_f64(|a, b| a >= b),

            I32Clz => {
                let a = self.pop_u32();
                self.push_u32(a.leading_zeros());
            }
            I32Ctz => {
                let a = self.pop_u32();
                self.push_u32(a.trailing_zeros());
            }
            I32Popcnt => {
                let a = self.pop_u32();
                self.push_u32(a.count_ones());
            }
            I32Add => self.bin_u32(|a, b| a.wrapping_add(b)),
            I32Sub => self.bin_u32(|a, b| a.wrapping_sub(b)),
            I32Mul => self.bin_u32(|a, b| a.wrapping_mul(b)),
            I32DivS => {
                let b = self.pop_u32() as i32;
                let a = self.pop_u32() as i32;
                if b == 0 {
                    return Err(TrapCode::DivisionByZero.into());
                }
                if a == i32::MIN && b == -1 {
                    return Err(TrapCode::IntegerOverflow.into());
                }
                self.push_u32((a / b) as u32);
            }
            I32DivU => {
                let b = self.pop_u32();
                let a = self.pop_u32();
                if b == 0 {
                    return Err(TrapCode::DivisionByZero.into());
                }
                self.push_u32(a / b);
            }
            I32RemS => {
                let b = self.pop_u32() as i32;
                let a = self.pop_u32() as i32;
                if b == 0 {
                    return Err(TrapCode::DivisionByZero.into());
                }
                self.push_u32(a.wrapping_rem(b) as u32);
            }
            I32RemU => {
                let b = self.pop_u32();
                let a = self.pop_u32();
                if b == 0 {
                    return Err(TrapCode::DivisionByZero.into());
                }
                self.push_u32(a % b);
            }
            I32And => self.bin_u32(|a, b| a & b),
            I32Or => self.bin_u32(|a, b| a | b),
            I32Xor => self.bin_u32(|a, b| a ^ b),
            I32Shl => self.bin_u32(|a, b| a.wrapping_shl(b & 31)),
            I32ShrS => {
                let b = self.pop_u32();
                let a = self.pop_u32() as i32;
                self.push_u32(a.wrapping_shr(b & 31) as u32);
            }
            I32ShrU => self.bin_u32(|a, b| a.wrapping_shr(b & 31)),
            I32Rotl => self.bin_u32(|a, b| a.rotate_left(b & 31)),
            I32Rotr => self.bin_u32(|a, b| a.rotate_right(b & 31)),

            I64Clz => {
                let a = self.pop_u64();
                self.push_u64(a.leading_zeros() as u64);
            }
            I64Ctz => {
                let a = self.pop_u64();
                self.push_u64(a.trailing_zeros() as u64);
            }
            I64Popcnt => {
                let a = self.pop_u64();
                self.push_u64(a.count_ones() as u64);
            }
            I64Add => self.bin_u64(|a, b| a.wrapping_add(b)),
            I64Sub => self.bin_u64(|a, b| a.wrapping_sub(b)),
            I64Mul => self.bin_u64(|a, b| a.wrapping_mul(b)),
            I64DivS => {
                let b = self.pop_u64() as i64;
                let a = self.pop_u64() as i64;
                if b == 0 {
                    return Err(TrapCode::DivisionByZero.into());
                }
                if a == i64::MIN && b == -1 {
                    return Err(TrapCode::IntegerOverflow.into());
                }
                self.push_u64((a / b) as u64);
            }
            I64DivU => {
                let b = self.pop_u64();
                let a = self.pop_u64();
                if b == 0 {
                    return Err(TrapCode::DivisionByZero.into());
                }
                self.push_u64(a / b);
            }
            I64RemS => {
                let b = self.pop_u64() as i64;
                let a = self.pop_u64() as i64;
                if b == 0 {
                    return Err(TrapCode::DivisionByZero.into());
                }
                self.push_u64(a.wrapping_rem(b) as u64);
            }
            I64RemU => {
                let b = self.pop_u64();
                let a = self.pop_u64();
                if b == 0 {
                    return Err(TrapCode::DivisionByZero.into());
                }
                self.push_u64(a % b);
            }
            I64And => self.bin_u64(|a, b| a & b),
            I64Or => self.bin_u64(|a, b| a | b),
            I64Xor => self.bin_u64(|a, b| a ^ b),
            I64Shl => {
                let b = self.pop_u64() as u32;
                let a = self.pop_u64();
                self.push_u64(a.wrapping_shl(b & 63));
            }
            I64ShrS => {
                let b = self.pop_u64() as u32;
                let a = self.pop_u64() as i64;
                self.push_u64(a.wrapping_shr(b & 63) as u64);
            }
            I64ShrU => {
                let b = self.pop_u64() as u32;
                let a = self.pop_u64();
                self.push_u64(a.wrapping_shr(b & 63));
            }
            I64Rotl => {
                let b = self.pop_u64() as u32;
                let a = self.pop_u64();
                self.push_u64(a.rotate_left(b & 63));
            }
            I64Rotr => {
                let b = self.pop_u64() as u32;
                let a = self.pop_u64();
                self.push_u64(a.rotate_right(b & 63));
            }

            F32Abs => {
                let a = self.pop_f32();
                self.push_f32(a.abs());
            }
            F32Neg => {
                let a = self.pop_f32();
                self.push_f32(-a);
            }
            F32Ceil => {
                let a = self.pop_f32();
                self.push_f32(a.ceil());
            }
            F32Floor => {
                let a = self.pop_f32();
                self.push_f32(a.floor());
            }
            F32Trunc => {
                let a = self.pop_f32();
                self.push_f32(a.trunc());
            }
            F32Nearest => {
                let a = self.pop_f32();
                self.push_f32(a.round_ties_even());
            }
            F32Sqrt => {
                let a = self.pop_f32();
                self.push_f32(a.sqrt());
            }
            F32Add => self.bin_f32(|a, b| a + b),
            F32Sub => self.bin_f32(|a, b| a - b),
            F32Mul => self.bin_f32(|a, b| a * b),
            F32Div => self.bin_f32(|a, b| a / b),
            F32Min => self.bin_f32(|a, b| if a < b { a } else { b }),
            F32Max => self.bin_f32(|a, b| if a > b { a } else { b }),
            F32Copysign => self.bin_f32(|a, b| a.copysign(b)),

            F64Abs => {
                let a = self.pop_f64();
                self.push_f64(a.abs());
            }
            F64Neg => {
                let a = self.pop_f64();
                self.push_f64(-a);
            }
            F64Ceil => {
                let a = self.pop_f64();
                self.push_f64(a.ceil());
            }
            F64Floor => {
                let a = self.pop_f64();
                self.push_f64(a.floor());
            }
            F64Trunc => {
                let a = self.pop_f64();
                self.push_f64(a.trunc());
            }
            F64Nearest => {
                let a = self.pop_f64();
                self.push_f64(a.round_ties_even());
            }
            F64Sqrt => {
                let a = self.pop_f64();
                self.push_f64(a.sqrt());
            }
            F64Add => self.bin_f64(|a, b| a + b),
            F64Sub => self.bin_f64(|a, b| a - b),
            F64Mul => self.bin_f64(|a, b| a * b),
            F64Div => self.bin_f64(|a, b| a / b),
            F64Min => self.bin_f64(|a, b| if a < b { a } else { b }),
            F64Max => self.bin_f64(|a, b| if a > b { a } else { b }),
            F64Copysign => self.bin_f64(|a, b| a.copysign(b)),

            I32WrapI64 => {
                let a = self.pop_u64();
                self.push_u32(a as u32);
            }
            I32TruncF32S => {
                let a = self.pop_f32();
                self.push_u32(trunc_f32_to_i32(a)? as u32);
            }
            I32TruncF32U => {
                let a = self.pop_f32();
                self.push_u32(trunc_f32_to_u32(a)?);
            }
            I32TruncF64S => {
                let a = self.pop_f64();
                self.push_u32(trunc_f64_to_i32(a)? as u32);
            }
            I32TruncF64U => {
                let a = self.pop_f64();
                self.push_u32(trunc_f64_to_u32(a)?);
            }
            I64ExtendI32S => {
                let a = self.pop_u32() as i32;
                self.push_u64(a as i64 as u64);
            }
            I64ExtendI32U => {
                let a = self.pop_u32();
                self.push_u64(a as u64);
            }
            I64TruncF32S => {
                let a = self.pop_f32();
                self.push_u64(trunc_f32_to_i64(a)? as u64);
            }
            I64TruncF32U => {
                let a = self.pop_f32();
                self.push_u64(trunc_f32_to_u64(a)?);
            }
            I64TruncF64S => {
                let a = self.pop_f64();
                self.push_u64(trunc_f64_to_i64(a)? as u64);
            }
            I64TruncF64U => {
                let a = self.pop_f64();
                self.push_u64(trunc_f64_to_u64(a)?);
            }
            F32ConvertI32S => {
                let a = self.pop_u32() as i32;
                self.push_f32(a as f32);
            }
            F32ConvertI32U => {
                let a = self.pop_u32();
                self.push_f32(a as f32);
            }
            F32ConvertI64S => {
                let a = self.pop_u64() as i64;
                self.push_f32(a as f32);
            }
            F32ConvertI64U => {
                let a = self.pop_u64();
                self.push_f32(a as f32);
            }
            F32DemoteF64 => {
                let a = self.pop_f64();
                self.push_f32(a as f32);
            }
            F64ConvertI32S => {
                let a = self.pop_u32() as i32;
                self.push_f64(a as f64);
            }
            F64ConvertI32U => {
                let a = self.pop_u32();
                self.push_f64(a as f64);
            }
            F64ConvertI64S => {
                let a = self.pop_u64() as i64;
                self.push_f64(a as f64);
            }
            F64ConvertI64U => {
                let a = self.pop_u64();
                self.push_f64(a as f64);
            }
            F64PromoteF32 => {
                let a = self.pop_f32();
                self.push_f64(a as f64);
            }
            // Reinterprets are no-ops: the stack slot is already type-erased.
            I32ReinterpretF32 | I64ReinterpretF64 | F32ReinterpretI32 | F64ReinterpretI64 => {}
            I32Extend8S => {
                let a = self.pop_u32() as i8;
                self.push_u32(a as i32 as u32);
            }
            I32Extend16S => {
                let a = self.pop_u32() as i16;
                self.push_u32(a as i32 as u32);
            }
            I64Extend8S => {
                let a = self.pop_u64() as i8;
                self.push_u64(a as i64 as u64);
            }
            I64Extend16S => {
                let a = self.pop_u64() as i16;
                self.push_u64(a as i64 as u64);
            }
            I64Extend32S => {
                let a = self.pop_u64() as i32;
                self.push_u64(a as i64 as u64);
            }

            Unreachable | Nop | Block | Loop | If | Else | End | Br | BrIf | BrTable | Return
            | Call | CallIndirect | Drop | Select | LocalGet | LocalSet | LocalTee | GlobalGet
            | GlobalSet | I32Const | I64Const | F32Const | F64Const | Prefixed => {
                unreachable!("not produced by decode for Op::Wasm")
            }
        }
        Ok(())
    }

    fn cmp_u32(&mut self, f: impl Fn(u32, u32) -> bool) {
        let b = self.pop_u32();
        let a = self.pop_u32();
        self.push_u32(f(a, b) as u32);
    }

    fn cmp_i32(&mut self, f: impl Fn(i32, i32) -> bool) {
        let b = self.pop_u32() as i32;
        let a = self.pop_u32() as i32;
        self.push_u32(f(a, b) as u32);
    }

    fn cmp_u64(&mut self, f: impl Fn(u64, u64) -> bool) {
        let b = self.pop_u64();
        let a = self.pop_u64();
        self.push_u32(f(a, b) as u32);
    }

    fn cmp_i64(&mut self, f: impl Fn(i64, i64) -> bool) {
        let b = self.pop_u64() as i64;
        let a = self.pop_u64() as i64;
        self.push_u32(f(a, b) as u32);
    }

    fn cmp_f32(&mut self, f: impl Fn(f32, f32) -> bool) {
        let b = self.pop_f32();
        let a = self.pop_f32();
        self.push_u32(f(a, b) as u32);
    }

    fn cmp_f64(&mut self, f: impl Fn(f64, f64) -> bool) {
        let b = self.pop_f64();
        let a = self.pop_f64();
        self.push_u32(f(a, b) as u32);
    }

    fn bin_u32(&mut self, f: impl Fn(u32, u32) -> u32) {
        let b = self.pop_u32();
        let a = self.pop_u32();
        self.push_u32(f(a, b));
    }

    fn bin_u64(&mut self, f: impl Fn(u64, u64) -> u64) {
        let b = self.pop_u64();
        let a = self.pop_u64();
        self.push_u64(f(a, b));
    }

    fn bin_f32(&mut self, f: impl Fn(f32, f32) -> f32) {
        let b = self.pop_f32();
        let a = self.pop_f32();
        self.push_f32(f(a, b));
    }

    fn bin_f64(&mut self, f: impl Fn(f64, f64) -> f64) {
        let b = self.pop_f64();
        let a = self.pop_f64();
        self.push_f64(f(a, b));
    }

    fn exec_prefixed(&mut self, op: WasmPrefixedOp) -> Result<(), WaziError> {
        use WasmPrefixedOp::*;
        match op {
            I32TruncSatF32S => {
                let a = self.pop_f32();
                self.push_u32(sat_f32_to_i32(a) as u32);
            }
            I32TruncSatF32U => {
                let a = self.pop_f32();
                self.push_u32(sat_f32_to_u32(a));
            }
            I32TruncSatF64S => {
                let a = self.pop_f64();
                self.push_u32(sat_f64_to_i32(a) as u32);
            }
            I32TruncSatF64U => {
                let a = self.pop_f64();
                self.push_u32(sat_f64_to_u32(a));
            }
            I64TruncSatF32S => {
                let a = self.pop_f32();
                self.push_u64(sat_f32_to_i64(a) as u64);
            }
            I64TruncSatF32U => {
                let a = self.pop_f32();
                self.push_u64(sat_f32_to_u64(a));
            }
            I64TruncSatF64S => {
                let a = self.pop_f64();
                self.push_u64(sat_f64_to_i64(a) as u64);
            }
            I64TruncSatF64U => {
                let a = self.pop_f64();
                self.push_u64(sat_f64_to_u64(a));
            }
            MemoryCopy => {
                let n = self.pop_u32();
                let src = self.pop_u32();
                let dest = self.pop_u32();
                let src_range = self.mem_range(src, n)?;
                let dest_range = self.mem_range(dest, n)?;
                if ranges_overlap(&src_range, &dest_range) {
                    return Err(TrapCode::MemoryCopyOverlap.into());
                }
                let data = self.memory.data_mut();
                data.copy_within(src_range, dest_range.start);
            }
            MemoryFill => {
                let n = self.pop_u32();
                let value = self.pop_u32() as u8;
                let dest = self.pop_u32();
                let range = self.mem_range(dest, n)?;
                self.memory.data_mut()[range].fill(value);
            }
            MemoryInit | DataDrop | TableInit | ElemDrop | TableCopy | TableGrow | TableSize
            | TableFill => {
                unreachable!("rejected by decode: not part of this interpreter's scope")
            }
        }
        Ok(())
    }
}

fn types_match(a: &crate::module::TypeInfo, b: &crate::module::TypeInfo) -> bool {
    a.param_count == b.param_count
        && a.result_count == b.result_count
        && (0..a.param_count).all(|i| a.param_types.is_set(i) == b.param_types.is_set(i))
        && (0..a.result_count).all(|i| a.result_types.is_set(i) == b.result_types.is_set(i))
}

fn ranges_overlap(a: &std::ops::Range<usize>, b: &std::ops::Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

fn trunc_f32_to_i32(x: f32) -> Result<i32, WaziError> {
    if x.is_nan() || x < -2147483648.0 || x >= 2147483648.0 {
        return Err(TrapCode::InvalidConversionToInt.into());
    }
    Ok(x.trunc() as i32)
}

fn trunc_f32_to_u32(x: f32) -> Result<u32, WaziError> {
    if x.is_nan() || x <= -1.0 || x >= 4294967296.0 {
        return Err(TrapCode::InvalidConversionToInt.into());
    }
    Ok(x.trunc() as u32)
}

fn trunc_f64_to_i32(x: f64) -> Result<i32, WaziError> {
    if x.is_nan() || x < -2147483648.0 || x >= 2147483648.0 {
        return Err(TrapCode::InvalidConversionToInt.into());
    }
    Ok(x.trunc() as i32)
}

fn trunc_f64_to_u32(x: f64) -> Result<u32, WaziError> {
    if x.is_nan() || x <= -1.0 || x >= 4294967296.0 {
        return Err(TrapCode::InvalidConversionToInt.into());
    }
    Ok(x.trunc() as u32)
}

fn trunc_f32_to_i64(x: f32) -> Result<i64, WaziError> {
    if x.is_nan() || x < -9223372036854775808.0 || x >= 9223372036854775808.0 {
        return Err(TrapCode::InvalidConversionToInt.into());
    }
    Ok(x.trunc() as i64)
}

fn trunc_f32_to_u64(x: f32) -> Result<u64, WaziError> {
    if x.is_nan() || x <= -1.0 || x >= 18446744073709551616.0 {
        return Err(TrapCode::InvalidConversionToInt.into());
    }
    Ok(x.trunc() as u64)
}

fn trunc_f64_to_i64(x: f64) -> Result<i64, WaziError> {
    if x.is_nan() || x < -9223372036854775808.0 || x >= 9223372036854775808.0 {
        return Err(TrapCode::InvalidConversionToInt.into());
    }
    Ok(x.trunc() as i64)
}

fn trunc_f64_to_u64(x: f64) -> Result<u64, WaziError> {
    if x.is_nan() || x <= -1.0 || x >= 18446744073709551616.0 {
        return Err(TrapCode::InvalidConversionToInt.into());
    }
    Ok(x.trunc() as u64)
}

fn sat_f32_to_i32(x: f32) -> i32 {
    if x.is_nan() {
        0
    } else {
        x.trunc().clamp(i32::MIN as f32, i32::MAX as f32) as i32
    }
}

fn sat_f32_to_u32(x: f32) -> u32 {
    if x.is_nan() || x < 0.0 {
        0
    } else {
        x.trunc().clamp(0.0, u32::MAX as f32) as u32
    }
}

fn sat_f64_to_i32(x: f64) -> i32 {
    if x.is_nan() {
        0
    } else {
        x.trunc().clamp(i32::MIN as f64, i32::MAX as f64) as i32
    }
}

fn sat_f64_to_u32(x: f64) -> u32 {
    if x.is_nan() || x < 0.0 {
        0
    } else {
        x.trunc().clamp(0.0, u32::MAX as f64) as u32
    }
}

fn sat_f32_to_i64(x: f32) -> i64 {
    if x.is_nan() {
        0
    } else {
        x.trunc().clamp(i64::MIN as f32, i64::MAX as f32) as i64
    }
}

fn sat_f32_to_u64(x: f32) -> u64 {
    if x.is_nan() || x < 0.0 {
        0
    } else {
        x.trunc().clamp(0.0, u64::MAX as f32) as u64
    }
}

fn sat_f64_to_i64(x: f64) -> i64 {
    if x.is_nan() {
        0
    } else {
        x.trunc().clamp(i64::MIN as f64, i64::MAX as f64) as i64
    }
}

fn sat_f64_to_u64(x: f64) -> u64 {
    if x.is_nan() || x < 0.0 {
        0
    } else {
        x.trunc().clamp(0.0, u64::MAX as f64) as u64
    }
}
