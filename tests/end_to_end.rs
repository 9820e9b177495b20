//! End-to-end tests: build a `.wasm` module from WAT, run it through
//! [`wazi::run`] against a real (temporary) preopen tree, and check the
//! process exit code the guest produced via `proc_exit`.

use assert_matches::assert_matches;
use std::path::PathBuf;

fn temp_dirs(name: &str) -> (PathBuf, PathBuf) {
    let base = std::env::temp_dir().join(format!("wazi-test-{name}-{}", std::process::id()));
    let lib = base.join("lib");
    let cache = base.join("cache");
    std::fs::create_dir_all(&lib).unwrap();
    (lib, cache)
}

fn run_wat(name: &str, wat: &str) -> i32 {
    let wasm = wat::parse_str(wat).expect("valid wat");
    let (lib, cache) = temp_dirs(name);
    wazi::run(&wasm, &lib, &cache, vec!["a.wasm".to_string()]).expect("module runs to completion")
}

#[test]
fn arithmetic_and_proc_exit() {
    let code = run_wat(
        "arith",
        r#"
        (module
          (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
          (func $_start
            i32.const 2
            i32.const 3
            i32.add
            call $proc_exit)
          (export "_start" (func $_start)))
        "#,
    );
    assert_eq!(code, 5);
}

#[test]
fn br_table_clamps_out_of_range_index_to_default() {
    let code = run_wat(
        "br-table",
        r#"
        (module
          (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
          (func $_start
            block $def
              block $b1
                i32.const 999999
                br_table $b1 $def
              end
              i32.const 111
              call $proc_exit
              unreachable
            end
            i32.const 222
            call $proc_exit)
          (export "_start" (func $_start)))
        "#,
    );
    assert_eq!(code, 222);
}

#[test]
fn memory_size_reports_initial_pages() {
    let code = run_wat(
        "mem-size",
        r#"
        (module
          (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
          (memory (export "memory") 3)
          (func $_start
            memory.size
            call $proc_exit)
          (export "_start" (func $_start)))
        "#,
    );
    assert_eq!(code, 3);
}

#[test]
fn memory_grow_returns_previous_page_count_then_fails_past_reservation() {
    let code = run_wat(
        "mem-grow",
        r#"
        (module
          (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
          (memory (export "memory") 1)
          (func $_start
            i32.const 4
            memory.grow
            call $proc_exit)
          (export "_start" (func $_start)))
        "#,
    );
    assert_eq!(code, 1);
}

#[test]
fn call_indirect_dispatches_through_table() {
    let code = run_wat(
        "call-indirect",
        r#"
        (module
          (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
          (type $ret_i32 (func (result i32)))
          (func $forty_two (result i32) i32.const 42)
          (func $seven (result i32) i32.const 7)
          (table 2 2 funcref)
          (elem (i32.const 0) $forty_two $seven)
          (func $_start
            i32.const 1
            call_indirect (type $ret_i32)
            call $proc_exit)
          (export "_start" (func $_start)))
        "#,
    );
    assert_eq!(code, 7);
}

#[test]
fn fd_write_reports_bytes_written_to_stdout() {
    let code = run_wat(
        "fd-write",
        r#"
        (module
          (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
          (memory (export "memory") 1)
          (data (i32.const 8) "hi\n")
          (func $_start
            i32.const 0
            i32.const 8
            i32.store
            i32.const 4
            i32.const 3
            i32.store
            i32.const 1
            i32.const 0
            i32.const 1
            i32.const 20
            call $fd_write
            drop
            i32.const 20
            i32.load
            call $proc_exit)
          (export "_start" (func $_start)))
        "#,
    );
    assert_eq!(code, 3);
}

#[test]
fn block_nested_inside_dead_code_does_not_mistarget_branch() {
    let code = run_wat(
        "dead-nested-block",
        r#"
        (module
          (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
          (func $_start
            block
              br 0
              block
              end
            end
            i32.const 42
            call $proc_exit)
          (export "_start" (func $_start)))
        "#,
    );
    assert_eq!(code, 42);
}

#[test]
fn if_opened_inside_dead_code_does_not_corrupt_ancestor_label() {
    let code = run_wat(
        "dead-nested-if",
        r#"
        (module
          (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
          (func $_start
            block
              br 0
              i32.const 0
              if
              else
              end
            end
            i32.const 7
            call $proc_exit)
          (export "_start" (func $_start)))
        "#,
    );
    assert_eq!(code, 7);
}

#[test]
fn select_preserves_64_bit_width_of_i64_operands() {
    let code = run_wat(
        "select-width",
        r#"
        (module
          (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
          (func $_start
            i64.const 0x100000002
            i64.const 99
            i32.const 1
            select
            i64.const 32
            i64.shr_u
            i32.wrap_i64
            call $proc_exit)
          (export "_start" (func $_start)))
        "#,
    );
    assert_eq!(code, 1);
}

#[test]
fn unreachable_traps_instead_of_returning() {
    let wasm = wat::parse_str(
        r#"
        (module
          (func $_start unreachable)
          (export "_start" (func $_start)))
        "#,
    )
    .unwrap();
    let (lib, cache) = temp_dirs("unreachable");
    let err = wazi::run(&wasm, &lib, &cache, vec!["a.wasm".to_string()]).unwrap_err();
    assert_matches!(err, wazi::WaziError::Trap(wazi::error::TrapCode::Unreachable));
}

#[test]
fn call_indirect_type_mismatch_traps() {
    let wasm = wat::parse_str(
        r#"
        (module
          (type $ret_i32 (func (result i32)))
          (func $takes_i32 (param i32))
          (table 1 1 funcref)
          (elem (i32.const 0) $takes_i32)
          (func $_start
            i32.const 0
            call_indirect (type $ret_i32)
            drop)
          (export "_start" (func $_start)))
        "#,
    )
    .unwrap();
    let (lib, cache) = temp_dirs("call-indirect-mismatch");
    let err = wazi::run(&wasm, &lib, &cache, vec!["a.wasm".to_string()]).unwrap_err();
    assert_matches!(
        err,
        wazi::WaziError::Trap(wazi::error::TrapCode::IndirectCallTypeMismatch)
    );
}
