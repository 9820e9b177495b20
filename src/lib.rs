//! `wazi`: a standalone WebAssembly 1.0 interpreter with a narrow WASI
//! preview-1 host, built to run one self-hosted compiler toolchain's
//! `_start` module and nothing broader.
//!
//! The pipeline is decode-then-interpret: [`module`] reads every section but
//! the code section into typed tables, [`decode`] turns each function body
//! into a flat [`isa::Op`] stream with branches already resolved to absolute
//! indices, and [`interp`] walks that stream against a unified 64-bit value
//! stack, dispatching imports out to [`wasi`].

pub mod bitset;
pub mod decode;
pub mod error;
pub mod interp;
pub mod isa;
pub mod leb;
pub mod memory;
pub mod module;
pub mod wasi;

use std::path::Path;

pub use error::WaziError;

/// Loads and runs a module's `_start` export against the given preopens and
/// guest argv, returning the process exit code.
pub fn run(
    wasm_bytes: &[u8],
    zig_lib_dir: &Path,
    zig_cache_dir: &Path,
    args: Vec<String>,
) -> Result<i32, WaziError> {
    let module = module::Module::parse(wasm_bytes)?;
    let functions = decode::decode_module_code(&module, wasm_bytes)?;
    let mut vm = interp::Vm::new(wasm_bytes, module, functions, zig_lib_dir, zig_cache_dir, args)?;
    vm.run()
}
