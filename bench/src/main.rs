use serde::Serialize;
use std::path::Path;
use std::time::Instant;
use thumbjit::bytecode::{Module, parse};
use thumbjit::config::JitConfig;
use thumbjit::jit::{CompiledFunction, compile_function};
use thumbjit::sim::Machine;

/// Compilations per program when timing the compiler.
const COMPILE_ROUNDS: u32 = 2000;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    code_bytes: usize,
    compile_secs: f64,
    compiles_per_sec: f64,
    run_secs: f64,
    steps: u64,
    result: Vec<i32>,
    rust_time_secs: f64,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
}

// Rust reference implementations

fn rust_sum_loop(n: i32) -> i32 {
    (1..=n).fold(0i32, |acc, i| acc.wrapping_add(i))
}

fn rust_nested_loop(n: i32) -> i32 {
    let mut sum = 0i32;
    for i in 0..n {
        for j in 0..n {
            sum = sum.wrapping_add(i.wrapping_mul(j));
        }
    }
    sum
}

fn rust_fibonacci(n: i32) -> i32 {
    if n < 2 { n } else { rust_fibonacci(n - 1) + rust_fibonacci(n - 2) }
}

fn rust_gcd_grid(n: i32) -> i32 {
    fn gcd(a: i32, b: i32) -> i32 {
        if b == 0 { a } else { gcd(b, a % b) }
    }
    let mut total = 0;
    for a in 1..=n {
        for b in 1..=n {
            total += gcd(a, b);
        }
    }
    total
}

fn time_rust<F>(f: F) -> f64
where
    F: FnOnce() -> i32,
{
    let start = Instant::now();
    let result = f();
    let elapsed = start.elapsed().as_secs_f64();
    eprintln!("{}", result);
    elapsed
}

fn load(program: &str) -> Module {
    let path = format!("{}/programs/{}.tbc", env!("CARGO_MANIFEST_DIR"), program);
    let source = std::fs::read_to_string(Path::new(&path))
        .unwrap_or_else(|e| panic!("failed to read {}: {}", path, e));
    parse(&source).unwrap_or_else(|e| panic!("{}: {}", path, e))
}

fn compile_module(module: &Module, config: &JitConfig) -> Vec<CompiledFunction> {
    module
        .functions
        .iter()
        .map(|f| compile_function(f, config).unwrap_or_else(|e| panic!("{}: {}", f.name, e)))
        .collect()
}

fn run_benchmark(program: &str, arg: u32, rust_time_secs: f64) -> BenchmarkResult {
    let module = load(program);
    let config = JitConfig::default();

    let start = Instant::now();
    for _ in 0..COMPILE_ROUNDS {
        compile_module(&module, &config);
    }
    let compile_secs = start.elapsed().as_secs_f64();

    let compiled = compile_module(&module, &config);
    let main = module.find("main").expect("benchmark program needs a main function");
    let mut machine = Machine::new(&compiled);
    let start = Instant::now();
    let result = match machine.call(main, &[arg]) {
        Ok(values) => values.into_iter().map(|v| v as i32).collect(),
        Err(e) => {
            eprintln!("Benchmark {} failed: {}", program, e);
            Vec::new()
        }
    };
    let run_secs = start.elapsed().as_secs_f64();

    BenchmarkResult {
        name: program.to_string(),
        code_bytes: compiled.iter().map(|f| f.size()).sum(),
        compile_secs,
        compiles_per_sec: COMPILE_ROUNDS as f64 / compile_secs,
        run_secs,
        steps: machine.steps(),
        result,
        rust_time_secs,
    }
}

fn main() {
    let results = vec![
        run_benchmark("sum_loop", 100_000, time_rust(|| rust_sum_loop(100_000))),
        run_benchmark("nested_loop", 300, time_rust(|| rust_nested_loop(300))),
        run_benchmark("fibonacci", 20, time_rust(|| rust_fibonacci(20))),
        run_benchmark("gcd", 40, time_rust(|| rust_gcd_grid(40))),
    ];

    let output = BenchmarkOutput { results };
    println!("{}", serde_json::to_string_pretty(&output).unwrap());
}
