//! In-process integration tests that contribute to coverage.
//!
//! These tests call the parser, compiler and simulator directly instead
//! of spawning the CLI.

use std::path::Path;

use thumbjit::jit::{disasm, thumb};
use thumbjit::{CompiledFunction, JitConfig, JitError, Module, compile_function, parse};

fn load_test_file(name: &str) -> Module {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("snapshots")
        .join(name);
    let source = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read {:?}: {}", path, e));
    parse(&source).unwrap_or_else(|e| panic!("{:?}: {}", path, e))
}

fn compile_module(module: &Module) -> Vec<CompiledFunction> {
    module
        .functions
        .iter()
        .map(|f| compile_function(f, &JitConfig::default()).unwrap())
        .collect()
}

#[cfg(feature = "sim")]
fn run_test_file(name: &str, function: &str, args: &[i32]) -> Vec<i32> {
    use thumbjit::sim::Machine;

    let module = load_test_file(name);
    let compiled = compile_module(&module);
    let index = module.find(function).unwrap();
    let args: Vec<u32> = args.iter().map(|&a| a as u32).collect();
    Machine::new(&compiled)
        .call(index, &args)
        .unwrap()
        .into_iter()
        .map(|v| v as i32)
        .collect()
}

// Run tests
#[cfg(feature = "sim")]
#[test]
fn test_run_sum_to() {
    assert_eq!(run_test_file("run/sum_to.tbc", "main", &[100]), vec![5050]);
    assert_eq!(run_test_file("run/sum_to.tbc", "main", &[0]), vec![0]);
}

#[cfg(feature = "sim")]
#[test]
fn test_run_fib() {
    assert_eq!(run_test_file("run/fib.tbc", "fib", &[1]), vec![1]);
    assert_eq!(run_test_file("run/fib.tbc", "fib", &[20]), vec![6765]);
}

#[cfg(feature = "sim")]
#[test]
fn test_run_divmod() {
    assert_eq!(run_test_file("run/divmod.tbc", "divmod", &[-17, 5]), vec![-3, -2]);
    assert_eq!(run_test_file("run/divmod.tbc", "divmod", &[17, -5]), vec![-3, 2]);
    assert_eq!(run_test_file("run/divmod.tbc", "divmod", &[i32::MIN, -1]), vec![i32::MIN, 0]);
}

#[cfg(feature = "sim")]
#[test]
fn test_run_wide() {
    let args: Vec<i32> = (1..=10).collect();
    assert_eq!(run_test_file("run/wide.tbc", "sum10", &args), vec![55]);
}

#[cfg(feature = "sim")]
#[test]
fn test_run_constants() {
    assert_eq!(run_test_file("run/constants.tbc", "consts", &[]), vec![0x12345678, -1, 1000]);
}

#[cfg(feature = "sim")]
#[test]
fn test_run_countdown() {
    assert_eq!(run_test_file("run/countdown.tbc", "count", &[5000, 0]), vec![10000]);
}

#[cfg(feature = "sim")]
#[test]
fn test_run_div_zero() {
    use thumbjit::sim::{Machine, SimError};

    let compiled = compile_module(&load_test_file("run/div_zero.tbc"));
    let err = Machine::new(&compiled).call(0, &[1, 0]).unwrap_err();
    assert!(matches!(err, SimError::DivideByZero { .. }));
}

// Compile tests
#[test]
fn test_compile_square_listing() {
    let compiled = compile_module(&load_test_file("compile/square.tbc"));
    let square = &compiled[0];
    assert_eq!(square.size(), 12);
    assert_eq!(square.code, vec![0x4670, 0x47c8, 0x1102, 0x4349, 0x47c8, 0x2001]);
    let listing = disasm::listing(&square.code, square.code_len);
    assert!(listing.contains(".vm enter args=1 frame=2"));
}

#[test]
fn test_compile_only_far_branch_relaxes() {
    let mut source = String::from(
        "
.func f args=1 returns=1
    pull 0
    imm 0
    bge positive
    neg
positive:
    pull 0
    imm 0
    beq skip
",
    );
    for _ in 0..150 {
        source.push_str("    imm 3\n    add\n");
    }
    source.push_str("skip:\n");

    let module = parse(&source).unwrap();
    let compiled = compile_module(&module);
    assert_eq!(compiled[0].relaxed, 1);

    #[cfg(feature = "sim")]
    {
        let mut machine = thumbjit::sim::Machine::new(&compiled);
        assert_eq!(machine.call(0, &[0]).unwrap(), vec![0]);
        assert_eq!(machine.call(0, &[-5i32 as u32]).unwrap(), vec![455]);
        assert_eq!(machine.call(0, &[7]).unwrap(), vec![457]);
    }
}

#[test]
fn test_compile_long_loop_relaxes_forward_branch_only() {
    let mut source = String::from(
        "
.func f args=1 returns=1
top:
    pull 0
    imm 0
    bge past
    pull 0
    imm 1
    add
    shove 0
    pull 0
    imm 0
    blt top
",
    );
    for _ in 0..900 {
        source.push_str("    imm 3\n    add\n");
    }
    source.push_str("past:\n");

    let module = parse(&source).unwrap();
    let compiled = compile_module(&module);
    let f = &compiled[0];
    assert_eq!(f.relaxed, 1);

    let code = &f.code[..f.code_len];
    let backward = code
        .iter()
        .filter(|&&hw| thumb::is_cond_branch(hw) && thumb::cond_branch_offset(hw) < 0)
        .count();
    assert_eq!(backward, 1);
    let far = code
        .iter()
        .filter(|&&hw| hw & 0xF800 == 0xE000 && thumb::branch_offset(hw) > 256)
        .count();
    assert_eq!(far, 1);

    #[cfg(feature = "sim")]
    {
        let mut machine = thumbjit::sim::Machine::new(&compiled);
        assert_eq!(machine.call(0, &[5]).unwrap(), vec![5]);
        assert_eq!(machine.call(0, &[-3i32 as u32]).unwrap(), vec![2700]);
    }
}

#[test]
fn test_compile_early_literal_in_long_function() {
    let mut source = String::from(".func f args=1 returns=1\n    imm 0x12345678\n    add\n");
    for _ in 0..560 {
        source.push_str("    imm 3\n    add\n");
    }

    let module = parse(&source).unwrap();
    let compiled = compile_module(&module);
    let f = &compiled[0];
    assert!(f.code_len > 560);
    let listing = disasm::listing(&f.code, f.code_len);
    assert!(!listing.contains("[pc"));

    #[cfg(feature = "sim")]
    {
        let mut machine = thumbjit::sim::Machine::new(&compiled);
        let expected = 1u32.wrapping_add(0x12345678).wrapping_add(1680);
        assert_eq!(machine.call(0, &[1]).unwrap(), vec![expected]);
    }
}

// Error tests
#[test]
fn test_errors_parse() {
    for (name, expected) in [
        ("errors/underflow.tbc", "stack underflow"),
        ("errors/undefined_label.tbc", "undefined label 'nowhere'"),
        ("errors/depth_mismatch.tbc", "label expects 2"),
    ] {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/snapshots").join(name);
        let source = std::fs::read_to_string(&path).unwrap();
        let err = parse(&source).unwrap_err();
        assert!(err.to_string().contains(expected), "{}: {}", name, err);
    }
}

#[test]
fn test_errors_compile() {
    let module = load_test_file("errors/too_many_args.tbc");
    let err = compile_function(&module.functions[0], &JitConfig::default()).unwrap_err();
    assert_eq!(err, JitError::TooManyArguments { count: 16 });
}
