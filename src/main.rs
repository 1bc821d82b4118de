use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[cfg(feature = "sim")]
use thumbjit::bytecode::parser::parse_int;
use thumbjit::bytecode::{Module, parse};
use thumbjit::config::{JitConfig, OutputFormat};
use thumbjit::jit::disasm;
use thumbjit::jit::{CompiledFunction, compile_function};

// Wrapper type for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormatArg {
    #[default]
    Text,
    Json,
    Hex,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Text => OutputFormat::Text,
            OutputFormatArg::Json => OutputFormat::Json,
            OutputFormatArg::Hex => OutputFormat::Hex,
        }
    }
}

#[derive(Parser)]
#[command(name = "thumbjit")]
#[command(about = "A Thumb JIT for stack-machine bytecode", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a bytecode file and print the generated code
    Compile {
        /// The bytecode source file
        file: PathBuf,

        /// Only compile this function
        #[arg(short, long)]
        function: Option<String>,

        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Code buffer size per function in halfwords
        #[arg(long)]
        capacity: Option<usize>,

        /// Trace JIT compilation events
        #[arg(long)]
        trace_jit: bool,

        /// Output format (text, json, hex)
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormatArg,
    },
    /// Parse and validate a bytecode file without compiling it
    Check {
        /// The bytecode source file
        file: PathBuf,
    },
    /// Compile a bytecode file and execute one function on the simulator
    #[cfg(feature = "sim")]
    Run {
        /// The bytecode source file
        file: PathBuf,

        /// Function to call
        function: String,

        /// Arguments (decimal, negative or 0x-prefixed hex)
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,

        /// Trace JIT compilation events
        #[arg(long)]
        trace_jit: bool,

        /// Stop after this many simulated instructions
        #[arg(long, default_value = "50000000")]
        step_limit: u64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Compile { file, function, config, capacity, trace_jit, format } => {
            let config = match config {
                Some(path) => JitConfig::load(&path),
                None => Ok(JitConfig::default()),
            };
            config.and_then(|mut config| {
                if let Some(capacity) = capacity {
                    config.capacity = capacity;
                }
                config.trace_jit |= trace_jit;
                compile_file(&file, function.as_deref(), &config, format.into())
            })
        }
        Commands::Check { file } => load_module(&file).map(|module| {
            for function in &module.functions {
                let shape = &function.shape;
                println!(
                    "{}: args={} returns={} labels={} max_depth={}",
                    function.name, shape.args, shape.returns, shape.labels, shape.max_depth
                );
            }
            println!("Check passed.");
        }),
        #[cfg(feature = "sim")]
        Commands::Run { file, function, args, trace_jit, step_limit } => {
            let config = JitConfig { trace_jit, ..Default::default() };
            run_file(&file, &function, &args, &config, step_limit)
        }
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn load_module(path: &Path) -> Result<Module, String> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse(&source).map_err(|e| format!("{}: {}", path.display(), e))
}

fn compile_all(module: &Module, config: &JitConfig) -> Result<Vec<CompiledFunction>, String> {
    module
        .functions
        .iter()
        .map(|f| compile_function(f, config).map_err(|e| format!("{}: {}", f.name, e)))
        .collect()
}

fn compile_file(
    path: &Path,
    only: Option<&str>,
    config: &JitConfig,
    format: OutputFormat,
) -> Result<(), String> {
    let module = load_module(path)?;
    let mut compiled = compile_all(&module, config)?;
    if let Some(name) = only {
        compiled.retain(|f| f.name == name);
        if compiled.is_empty() {
            return Err(format!("no function named '{}'", name));
        }
    }

    match format {
        OutputFormat::Text => {
            for (i, function) in compiled.iter().enumerate() {
                if i > 0 {
                    println!();
                }
                let shape = &function.shape;
                println!(
                    "{}: args={} returns={} ({} bytes, {} literals, {} relaxed)",
                    function.name,
                    shape.args,
                    shape.returns,
                    function.size(),
                    function.literals,
                    function.relaxed
                );
                print!("{}", disasm::listing(&function.code, function.code_len));
            }
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&compiled).map_err(|e| e.to_string())?;
            println!("{}", json);
        }
        OutputFormat::Hex => {
            for function in &compiled {
                let words: Vec<String> = function.code.iter().map(|hw| format!("{:04x}", hw)).collect();
                println!("{}: {}", function.name, words.join(" "));
            }
        }
    }
    Ok(())
}

#[cfg(feature = "sim")]
fn parse_arg(text: &str) -> Result<u32, String> {
    match parse_int(text) {
        Some(value) if (i32::MIN as i64..=u32::MAX as i64).contains(&value) => Ok(value as u32),
        Some(_) => Err(format!("argument '{}' does not fit in 32 bits", text)),
        None => Err(format!("invalid argument '{}'", text)),
    }
}

#[cfg(feature = "sim")]
fn run_file(
    path: &Path,
    function: &str,
    args: &[String],
    config: &JitConfig,
    step_limit: u64,
) -> Result<(), String> {
    use thumbjit::sim::Machine;

    let module = load_module(path)?;
    let index = module.find(function).ok_or_else(|| format!("no function named '{}'", function))?;
    let args = args.iter().map(|a| parse_arg(a)).collect::<Result<Vec<u32>, String>>()?;
    let compiled = compile_all(&module, config)?;

    let mut machine = Machine::new(&compiled).with_step_limit(step_limit);
    let results = machine.call(index, &args).map_err(|e| e.to_string())?;
    for value in results {
        println!("{}", value as i32);
    }
    if config.trace_jit {
        eprintln!("[JIT] {} instructions executed", machine.steps());
    }
    Ok(())
}
