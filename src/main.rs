use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

/// Runs a single WebAssembly module's `_start` export against a narrow
/// WASI preview-1 host modeled on one self-hosted toolchain's needs.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Host directory preopened at guest path `/lib`.
    #[clap(value_parser)]
    zig_lib_dir: PathBuf,

    /// Host directory preopened at guest path `/cache`, created if absent.
    #[clap(value_parser)]
    zig_cache_dir: PathBuf,

    /// The `.wasm` module to run.
    #[clap(value_parser)]
    wasm_file: PathBuf,

    /// Arguments passed through to the guest as `argv`, starting with the
    /// module path itself.
    #[clap(value_parser, trailing_var_arg = true, allow_hyphen_values = true)]
    guest_argv: Vec<String>,

    /// Print decode/trap diagnostics to stderr; repeat for more detail.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match preflight(&args) {
        Err(error) => {
            eprintln!("wazi: {error:#}");
            ExitCode::from(2)
        }
        Ok((wasm_bytes, guest_argv)) => {
            match wazi::run(&wasm_bytes, &args.zig_lib_dir, &args.zig_cache_dir, guest_argv) {
                Ok(code) => exit_code_for(code),
                Err(error) => {
                    eprintln!("wazi: {error}");
                    if args.verbose > 0 {
                        eprintln!("wazi: {error:?}");
                    }
                    ExitCode::from(1)
                }
            }
        }
    }
}

/// Reads the module and assembles the guest argv; any failure here is a
/// CLI/IO error (exit code 2), distinct from an in-VM trap (exit code 1).
fn preflight(args: &Args) -> Result<(Vec<u8>, Vec<String>)> {
    let wasm_bytes = std::fs::read(&args.wasm_file)
        .with_context(|| format!("failed to read Wasm file {}", args.wasm_file.display()))?;

    let guest_argv: Vec<String> = [args.wasm_file.display().to_string()]
        .into_iter()
        .chain(args.guest_argv.clone())
        .collect();

    if args.verbose > 0 {
        eprintln!(
            "wazi: loaded {} ({} bytes), lib={}, cache={}, argv={:?}",
            args.wasm_file.display(),
            wasm_bytes.len(),
            args.zig_lib_dir.display(),
            args.zig_cache_dir.display(),
            guest_argv,
        );
    }

    Ok((wasm_bytes, guest_argv))
}

fn exit_code_for(code: i32) -> ExitCode {
    ExitCode::from(code.rem_euclid(256) as u8)
}
