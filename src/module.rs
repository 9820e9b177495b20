//! Reads everything in a wasm module except the code section: types,
//! imports, the function index space, globals, memory/table limits, data
//! and element segments, and the `_start` export. The code section itself
//! is handled by [`crate::decode`], since turning it into the internal
//! bytecode needs the tables built here.

use crate::bitset::SmallBitset;
use crate::error::DecodeError;
use crate::leb::Cursor;

pub const WASM_PAGE_SIZE: u32 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SectionId {
    Custom = 0,
    Type = 1,
    Import = 2,
    Function = 3,
    Table = 4,
    Memory = 5,
    Global = 6,
    Export = 7,
    Start = 8,
    Element = 9,
    Code = 10,
    Data = 11,
    DataCount = 12,
}

pub const SECTION_COUNT: usize = 13;

#[derive(Debug, Clone, Copy, Default)]
pub struct TypeInfo {
    pub param_count: u32,
    pub param_types: SmallBitset,
    pub result_count: u32,
    pub result_types: SmallBitset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImpName {
    ArgsGet,
    ArgsSizesGet,
    ClockTimeGet,
    Debug,
    DebugSlice,
    EnvironGet,
    EnvironSizesGet,
    FdClose,
    FdFdstatGet,
    FdFilestatGet,
    FdFilestatSetSize,
    FdFilestatSetTimes,
    FdPread,
    FdPrestatDirName,
    FdPrestatGet,
    FdPwrite,
    FdRead,
    FdReaddir,
    FdWrite,
    PathCreateDirectory,
    PathFilestatGet,
    PathOpen,
    PathRemoveDirectory,
    PathRename,
    PathUnlinkFile,
    ProcExit,
    RandomGet,
}

impl ImpName {
    fn from_str(s: &str) -> Option<Self> {
        use ImpName::*;
        Some(match s {
            "args_get" => ArgsGet,
            "args_sizes_get" => ArgsSizesGet,
            "clock_time_get" => ClockTimeGet,
            "debug" => Debug,
            "debug_slice" => DebugSlice,
            "environ_get" => EnvironGet,
            "environ_sizes_get" => EnvironSizesGet,
            "fd_close" => FdClose,
            "fd_fdstat_get" => FdFdstatGet,
            "fd_filestat_get" => FdFilestatGet,
            "fd_filestat_set_size" => FdFilestatSetSize,
            "fd_filestat_set_times" => FdFilestatSetTimes,
            "fd_pread" => FdPread,
            "fd_prestat_dir_name" => FdPrestatDirName,
            "fd_prestat_get" => FdPrestatGet,
            "fd_pwrite" => FdPwrite,
            "fd_read" => FdRead,
            "fd_readdir" => FdReaddir,
            "fd_write" => FdWrite,
            "path_create_directory" => PathCreateDirectory,
            "path_filestat_get" => PathFilestatGet,
            "path_open" => PathOpen,
            "path_remove_directory" => PathRemoveDirectory,
            "path_rename" => PathRename,
            "path_unlink_file" => PathUnlinkFile,
            "proc_exit" => ProcExit,
            "random_get" => RandomGet,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Import {
    pub name: ImpName,
    pub type_idx: u32,
}

/// An active data segment: copy `bytes` into memory at `offset` at load time.
#[derive(Debug, Clone, Copy)]
pub struct DataSegment {
    pub offset: u32,
    pub range: (usize, usize),
}

#[derive(Debug, Default)]
pub struct Module {
    pub types: Vec<TypeInfo>,
    pub imports: Vec<Import>,
    /// Type index for each non-imported function, in function-index-space order
    /// starting right after the imports.
    pub func_type_idxs: Vec<u32>,
    pub globals_init: Vec<i32>,
    pub memory_pages: u32,
    pub table_maximum: u32,
    pub table_init: Vec<u32>,
    pub data_segments: Vec<DataSegment>,
    pub start_fn_idx: u32,
    pub code_section_start: usize,
}

fn section_offsets(c: &mut Cursor) -> Result<[usize; SECTION_COUNT], DecodeError> {
    let mut offsets = [0usize; SECTION_COUNT];
    while !c.is_eof() {
        let id = c.read_u8()?;
        let len = c.read_u32_leb()? as usize;
        if (id as usize) < SECTION_COUNT {
            offsets[id as usize] = c.pos();
        }
        c.set_pos(c.pos() + len);
    }
    Ok(offsets)
}

impl Module {
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut c = Cursor::new(bytes);
        if c.read_bytes(4)? != b"\0asm" {
            return Err(DecodeError::BadMagic);
        }
        let version = u32::from_le_bytes(c.read_bytes(4)?.try_into().unwrap());
        if version != 1 {
            return Err(DecodeError::BadVersion(version));
        }

        let offsets = section_offsets(&mut c)?;
        let mut m = Module::default();

        m.types = parse_types(bytes, offsets[SectionId::Type as usize])?;
        m.imports = parse_imports(bytes, offsets[SectionId::Import as usize])?;
        m.start_fn_idx = parse_start_export(bytes, offsets[SectionId::Export as usize])?;
        m.func_type_idxs = parse_functions(bytes, offsets[SectionId::Function as usize])?;
        m.globals_init = parse_globals(bytes, offsets[SectionId::Global as usize])?;
        (m.memory_pages, m.data_segments) =
            parse_memory_and_data(bytes, offsets[SectionId::Memory as usize], offsets[SectionId::Data as usize])?;
        (m.table_maximum, m.table_init) =
            parse_table_and_elements(bytes, offsets[SectionId::Table as usize], offsets[SectionId::Element as usize])?;
        m.code_section_start = offsets[SectionId::Code as usize];

        Ok(m)
    }
}

fn wasm_type_bit(leb: i64) -> Result<bool, DecodeError> {
    match leb {
        -1 | -3 => Ok(false), // i32 / f32 (f32 packs into the 32-bit slot like i32)
        -2 | -4 => Ok(true),  // i64 / f64
        _ => Err(DecodeError::BadBlockType(leb)),
    }
}

fn parse_types(bytes: &[u8], start: usize) -> Result<Vec<TypeInfo>, DecodeError> {
    if start == 0 {
        return Ok(Vec::new());
    }
    let mut c = Cursor::new(bytes);
    c.set_pos(start);
    let count = c.read_u32_leb()?;
    let mut types = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let tag = c.read_u8()?;
        if tag != 0x60 {
            return Err(DecodeError::BadTypeTag(tag));
        }
        let mut info = TypeInfo::default();
        info.param_count = c.read_u32_leb()?;
        for i in 0..info.param_count {
            let bit = wasm_type_bit(c.read_i64_leb()?)?;
            info.param_types.set_value(i, bit);
        }
        info.result_count = c.read_u32_leb()?;
        for i in 0..info.result_count {
            let bit = wasm_type_bit(c.read_i64_leb()?)?;
            info.result_types.set_value(i, bit);
        }
        types.push(info);
    }
    Ok(types)
}

fn parse_imports(bytes: &[u8], start: usize) -> Result<Vec<Import>, DecodeError> {
    if start == 0 {
        return Ok(Vec::new());
    }
    let mut c = Cursor::new(bytes);
    c.set_pos(start);
    let count = c.read_u32_leb()?;
    let mut imports = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let module_name = c.read_name()?;
        if module_name != "wasi_snapshot_preview1" {
            return Err(DecodeError::UnknownImportModule(module_name.to_string()));
        }
        let sym_name = c.read_name()?;
        let name = ImpName::from_str(sym_name)
            .ok_or_else(|| DecodeError::UnknownImportName(sym_name.to_string()))?;
        let desc = c.read_u32_leb()?;
        if desc != 0 {
            return Err(DecodeError::UnexpectedOpcode(desc as u8));
        }
        let type_idx = c.read_u32_leb()?;
        imports.push(Import { name, type_idx });
    }
    Ok(imports)
}

fn parse_start_export(bytes: &[u8], start: usize) -> Result<u32, DecodeError> {
    if start == 0 {
        return Err(DecodeError::MissingStartExport);
    }
    let mut c = Cursor::new(bytes);
    c.set_pos(start);
    let mut count = c.read_u32_leb()?;
    while count > 0 {
        let name = c.read_name()?;
        let desc = c.read_u32_leb()?;
        let idx = c.read_u32_leb()?;
        if desc == 0 && name == "_start" {
            return Ok(idx);
        }
        count -= 1;
    }
    Err(DecodeError::MissingStartExport)
}

fn parse_functions(bytes: &[u8], start: usize) -> Result<Vec<u32>, DecodeError> {
    if start == 0 {
        return Ok(Vec::new());
    }
    let mut c = Cursor::new(bytes);
    c.set_pos(start);
    let count = c.read_u32_leb()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(c.read_u32_leb()?);
    }
    Ok(out)
}

fn parse_globals(bytes: &[u8], start: usize) -> Result<Vec<i32>, DecodeError> {
    if start == 0 {
        return Ok(Vec::new());
    }
    let mut c = Cursor::new(bytes);
    c.set_pos(start);
    let count = c.read_u32_leb()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let content_type = c.read_u32_leb()?;
        let mutability = c.read_u32_leb()?;
        if mutability != 1 {
            return Err(DecodeError::NonMutableGlobal);
        }
        if content_type != 0x7f {
            return Err(DecodeError::NonI32GlobalInit);
        }
        let opcode = c.read_u8()?;
        if opcode != crate::isa::WasmOp::I32Const as u8 {
            return Err(DecodeError::NonI32GlobalInit);
        }
        let init = c.read_i32_leb()?;
        let end = c.read_u8()?;
        if end != crate::isa::WasmOp::End as u8 {
            return Err(DecodeError::NonConstantOffset);
        }
        out.push(init);
    }
    Ok(out)
}

fn parse_memory_and_data(
    bytes: &[u8],
    mem_start: usize,
    data_start: usize,
) -> Result<(u32, Vec<DataSegment>), DecodeError> {
    let mut pages = 0u32;
    if mem_start != 0 {
        let mut c = Cursor::new(bytes);
        c.set_pos(mem_start);
        let memories_len = c.read_u32_leb()?;
        if memories_len != 1 {
            return Err(DecodeError::MultipleMemories);
        }
        let _flags = c.read_u32_leb()?;
        pages = c.read_u32_leb()?;
    }

    let mut segments = Vec::new();
    if data_start != 0 {
        let mut c = Cursor::new(bytes);
        c.set_pos(data_start);
        let count = c.read_u32_leb()?;
        for _ in 0..count {
            let mode = c.read_u32_leb()?;
            if mode != 0 {
                return Err(DecodeError::UnexpectedMemoryIndex);
            }
            let opcode = c.read_u8()?;
            if opcode != crate::isa::WasmOp::I32Const as u8 {
                return Err(DecodeError::NonConstantOffset);
            }
            let offset = c.read_u32_leb()?;
            let end = c.read_u8()?;
            if end != crate::isa::WasmOp::End as u8 {
                return Err(DecodeError::NonConstantOffset);
            }
            let len = c.read_u32_leb()? as usize;
            let range = (c.pos(), c.pos() + len);
            c.set_pos(range.1);
            segments.push(DataSegment { offset, range });
        }
    }

    Ok((pages, segments))
}

fn parse_table_and_elements(
    bytes: &[u8],
    table_start: usize,
    elem_start: usize,
) -> Result<(u32, Vec<u32>), DecodeError> {
    if table_start == 0 {
        return Ok((0, Vec::new()));
    }
    let mut c = Cursor::new(bytes);
    c.set_pos(table_start);
    let table_count = c.read_u32_leb()?;
    if table_count > 1 {
        return Err(DecodeError::MultipleTables);
    }
    if table_count == 0 {
        return Ok((0, Vec::new()));
    }
    let _element_type = c.read_u32_leb()?;
    let has_max = c.read_u32_leb()?;
    if has_max != 1 {
        return Err(DecodeError::UnexpectedTableIndex);
    }
    let _initial = c.read_u32_leb()?;
    let maximum = c.read_u32_leb()?;

    let mut table = vec![0u32; maximum as usize];
    if elem_start != 0 {
        let mut c = Cursor::new(bytes);
        c.set_pos(elem_start);
        let elem_section_count = c.read_u32_leb()?;
        if elem_section_count != 1 {
            return Err(DecodeError::UnexpectedTableIndex);
        }
        let _flags = c.read_u32_leb()?;
        let opcode = c.read_u8()?;
        if opcode != crate::isa::WasmOp::I32Const as u8 {
            return Err(DecodeError::NonConstantOffset);
        }
        let offset = c.read_u32_leb()?;
        let end = c.read_u8()?;
        if end != crate::isa::WasmOp::End as u8 {
            return Err(DecodeError::NonConstantOffset);
        }
        let elem_count = c.read_u32_leb()?;
        for i in 0..elem_count {
            let fn_idx = c.read_u32_leb()?;
            table[(offset + i) as usize] = fn_idx;
        }
    }

    Ok((maximum, table))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_types_imports_and_start_export() {
        let wasm = wat::parse_str(
            r#"
            (module
              (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
              (func $_start
                i32.const 0
                call $proc_exit)
              (export "_start" (func $_start)))
            "#,
        )
        .unwrap();
        let module = Module::parse(&wasm).unwrap();
        assert_eq!(module.imports.len(), 1);
        assert_eq!(module.imports[0].name, ImpName::ProcExit);
        assert_eq!(module.func_type_idxs.len(), 1);
        assert_eq!(module.start_fn_idx, 1);
    }

    #[test]
    fn unknown_import_module_is_rejected() {
        let wasm = wat::parse_str(
            r#"
            (module
              (import "env" "proc_exit" (func (param i32))))
            "#,
        )
        .unwrap();
        assert_eq!(
            Module::parse(&wasm).unwrap_err(),
            DecodeError::UnknownImportModule("env".to_string())
        );
    }

    #[test]
    fn element_segment_populates_table_at_offset() {
        let wasm = wat::parse_str(
            r#"
            (module
              (func $a (result i32) i32.const 1)
              (func $b (result i32) i32.const 2)
              (table 2 2 funcref)
              (elem (i32.const 1) $b)
              (export "_start" (func $a)))
            "#,
        )
        .unwrap();
        let module = Module::parse(&wasm).unwrap();
        assert_eq!(module.table_init, vec![0, 1]);
    }
}
