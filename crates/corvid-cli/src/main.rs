//! Corvid CLI - command-line interface for the corvid scripting engine

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use corvid_core::bytecode::{compile_chunk, disassemble_chunk, Chunk};
use corvid_core::{CompileOptions, Error, VmConfig, MULTRET, VM};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod repl;

/// File extension of serialized chunks
const BYTECODE_EXTENSION: &str = "cvb";

#[derive(Parser)]
#[command(name = "corvid")]
#[command(version = corvid_core::VERSION)]
#[command(about = "The corvid scripting engine", long_about = None)]
struct Cli {
    /// VM configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log engine diagnostics to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the interactive REPL
    Repl,

    /// Run a source file or a compiled chunk
    Run {
        /// Path to a `.luau` source file or a `.cvb` chunk
        file: PathBuf,

        /// Freeze the globals before running the script
        #[arg(long)]
        sandbox: bool,

        /// Arguments passed to the script as `...`
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },

    /// Evaluate an expression or statements and print the results
    Eval {
        /// Source to evaluate
        source: String,

        /// Print results as a JSON array
        #[arg(long)]
        json: bool,
    },

    /// Compile a source file to a bytecode chunk
    Compile {
        /// Path to the source file
        file: PathBuf,

        /// Output path (defaults to the input with a `.cvb` extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Debug information level (0-2)
        #[arg(short = 'g', long, default_value_t = 1)]
        debug_level: u8,

        /// Optimization level (0-2)
        #[arg(short = 'O', long, default_value_t = 1)]
        optimization_level: u8,
    },

    /// Print the bytecode listing of a source file or compiled chunk
    Disasm {
        /// Path to a source file or a `.cvb` chunk
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Run { file, sandbox, args }) => {
            run_file(&file, config, sandbox, &args)?;
        }

        Some(Commands::Eval { source, json }) => {
            eval_source(&source, config, json)?;
        }

        Some(Commands::Compile {
            file,
            output,
            debug_level,
            optimization_level,
        }) => {
            let options = CompileOptions {
                debug_level,
                optimization_level,
                ..CompileOptions::default()
            };
            compile_file(&file, output, &options)?;
        }

        Some(Commands::Disasm { file }) => {
            print!("{}", disassemble_file(&file)?);
        }

        Some(Commands::Repl) | None => {
            let mut repl = repl::Repl::new(config)?;
            repl.run()?;
        }
    }

    Ok(())
}

/// Send engine diagnostics to stderr, filtered by `RUST_LOG`
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<VmConfig> {
    match path {
        Some(path) => {
            let config = VmConfig::load(path).with_context(|| format!("loading config '{}'", path.display()))?;
            debug!(path = %path.display(), "config loaded");
            Ok(config)
        }
        None => Ok(VmConfig::default()),
    }
}

fn is_bytecode(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == BYTECODE_EXTENSION)
}

fn chunk_name(path: &Path) -> String {
    format!("@{}", path.display())
}

/// Render a VM error for the terminal, with a traceback for script errors
fn report(err: &Error) -> anyhow::Error {
    match err.as_runtime() {
        Some(runtime) => anyhow!("{}", runtime.report()),
        None => anyhow!("{err}"),
    }
}

/// Run a source file or compiled chunk
fn run_file(path: &Path, config: VmConfig, sandbox: bool, args: &[String]) -> Result<()> {
    let mut vm = VM::with_config(config);
    if sandbox {
        vm.sandbox();
    }

    let name = chunk_name(path);
    if is_bytecode(path) {
        let bytes = std::fs::read(path).with_context(|| format!("failed to read file '{}'", path.display()))?;
        vm.load(&name, &bytes).map_err(|e| report(&e))?;
    } else {
        let source =
            std::fs::read_to_string(path).with_context(|| format!("failed to read file '{}'", path.display()))?;
        vm.load_source(&name, &source).map_err(|e| report(&e))?;
    }

    for arg in args {
        vm.push_string(arg);
    }
    vm.protected_call(args.len(), 0).map_err(|e| report(&e))?;
    Ok(())
}

/// Evaluate `source`, trying it as an expression first
fn eval_source(source: &str, config: VmConfig, json: bool) -> Result<()> {
    let mut vm = VM::with_config(config);
    let results = repl::evaluate(&mut vm, "=eval", source).map_err(|e| report(&e))?;
    if json {
        let values: Vec<serde_json::Value> = (1..=results).map(|i| repl::to_json(&vm, i as i32)).collect();
        println!("{}", serde_json::to_string(&values)?);
    } else if results > 0 {
        let rendered: Vec<String> = (1..=results).map(|i| vm.display_value(vm.read(i as i32))).collect();
        println!("{}", rendered.join("\t"));
    }
    Ok(())
}

/// Compile a source file and write the chunk next to it
fn compile_file(path: &Path, output: Option<PathBuf>, options: &CompileOptions) -> Result<()> {
    let source =
        std::fs::read_to_string(path).with_context(|| format!("failed to read file '{}'", path.display()))?;
    let name = path.display().to_string();
    let chunk = compile_chunk(&source, &name, options).map_err(|e| anyhow!("{e}"))?;
    let bytes = chunk.to_bytes();

    let output_path = output.unwrap_or_else(|| path.with_extension(BYTECODE_EXTENSION));
    std::fs::write(&output_path, &bytes)
        .with_context(|| format!("failed to write '{}'", output_path.display()))?;
    println!(
        "Compiled {} ({} functions, {} bytes) -> {}",
        path.display(),
        chunk.protos.len(),
        bytes.len(),
        output_path.display()
    );
    Ok(())
}

fn disassemble_file(path: &Path) -> Result<String> {
    let name = path.display().to_string();
    let chunk = if is_bytecode(path) {
        let bytes = std::fs::read(path).with_context(|| format!("failed to read file '{name}'"))?;
        Chunk::from_bytes(&bytes).map_err(|e| anyhow!("{name}: {e}"))?
    } else {
        let source = std::fs::read_to_string(path).with_context(|| format!("failed to read file '{name}'"))?;
        compile_chunk(&source, &name, &CompileOptions::default()).map_err(|e| anyhow!("{e}"))?
    };
    Ok(disassemble_chunk(&chunk, &name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_then_disassemble_and_run() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("square.luau");
        std::fs::write(&source, "local function square(x) return x * x end\nresult = square(...)").unwrap();

        compile_file(&source, None, &CompileOptions::default()).unwrap();
        let chunk = dir.path().join("square.cvb");
        assert!(chunk.exists());

        let listing = disassemble_file(&chunk).unwrap();
        assert!(listing.contains("square"));
        assert_eq!(listing, disassemble_file(&source).unwrap().replace("square.luau", "square.cvb"));

        run_file(&chunk, VmConfig::default(), false, &["7".to_string()]).unwrap();
    }

    #[test]
    fn test_run_reports_script_errors_with_traceback() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("fail.luau");
        std::fs::write(&source, "local t = nil\nprint(t.field)").unwrap();

        let err = run_file(&source, VmConfig::default(), false, &[]).unwrap_err().to_string();
        assert!(err.contains("fail.luau:2: attempt to index a nil value"), "{err}");
        assert!(err.contains("stack traceback:"), "{err}");
    }

    #[test]
    fn test_sandboxed_run_cannot_replace_globals() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("evil.luau");
        std::fs::write(&source, "print = nil").unwrap();

        assert!(run_file(&source, VmConfig::default(), false, &[]).is_ok());
        let err = run_file(&source, VmConfig::default(), true, &[]).unwrap_err().to_string();
        assert!(err.contains("readonly"), "{err}");
    }

    #[test]
    fn test_config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corvid.toml");
        std::fs::write(&path, "open_libs = false\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert!(!config.open_libs);
        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = run_file(Path::new("/nonexistent/script.luau"), VmConfig::default(), false, &[])
            .unwrap_err()
            .to_string();
        assert!(err.contains("failed to read file"), "{err}");
    }
}
