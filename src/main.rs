/// Quark CLI
/// Parses, runs, disassembles and snapshots scripts.

use clap::Parser as ClapParser;
use miette::{miette, Result};
use std::path::PathBuf;
use std::process::ExitCode;

use quark::context::{Context, ContextOptions};
use quark::errors::EngineError;
use quark::parser::ParseFlags;
use quark::snapshot;

// 16 MB stack keeps deeply recursive scripts inside the interpreter's own
// call-depth limit instead of the host stack.
const STACK_SIZE: usize = 16 * 1024 * 1024;

const EXIT_OK: u8 = 0;
const EXIT_PARSE_ERROR: u8 = 1;
const EXIT_UNCAUGHT: u8 = 2;
const EXIT_OOM: u8 = 3;
const EXIT_IO: u8 = 4;

#[derive(ClapParser)]
#[command(
    name = "quark",
    version,
    about = "A compact ECMAScript engine",
    long_about = "quark — run ECMAScript sources on a fixed-size heap; \
                  inspect bytecode, heap statistics and snapshots."
)]
struct Cli {
    /// Script file to run (reads stdin when absent)
    file: Option<PathBuf>,

    /// Parse and compile only; do not execute
    #[arg(long)]
    parse_only: bool,

    /// Print the compiled bytecode listing
    #[arg(long)]
    show_opcodes: bool,

    /// Print heap and GC statistics after execution
    #[arg(long)]
    mem_stats: bool,

    /// Treat the source as strict-mode code
    #[arg(long)]
    strict: bool,

    /// Heap byte budget
    #[arg(long, default_value_t = 512 * 1024)]
    heap_size: usize,

    /// Write a snapshot of the compiled script and exit
    #[arg(long, value_name = "FILE")]
    snapshot_save: Option<PathBuf>,

    /// Execute a snapshot instead of source text
    #[arg(long, value_name = "FILE")]
    snapshot_load: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = std::thread::Builder::new()
        .name("quark-worker".into())
        .stack_size(STACK_SIZE)
        .spawn(move || run(cli))
        .expect("failed to spawn quark worker thread")
        .join();

    match result {
        Ok(code) => code,
        Err(payload) => {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unexpected panic in the engine".to_string()
            };
            eprintln!("quark crashed: internal error: {msg}");
            ExitCode::from(EXIT_IO)
        }
    }
}

fn run(cli: Cli) -> ExitCode {
    match run_inner(cli) {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report}");
            ExitCode::from(EXIT_IO)
        }
    }
}

fn run_inner(cli: Cli) -> Result<ExitCode> {
    let mut ctx = Context::new(ContextOptions {
        heap_size: cli.heap_size,
        ..ContextOptions::default()
    });

    // Snapshot execution path.
    if let Some(path) = &cli.snapshot_load {
        let bytes = std::fs::read(path)
            .map_err(|e| miette!("cannot read snapshot '{}': {e}", path.display()))?;
        let code = match snapshot::load(&mut ctx, &bytes) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("quark: {e}");
                return Ok(ExitCode::from(EXIT_IO));
            }
        };
        return Ok(finish(&mut ctx, code, &cli));
    }

    let source = match &cli.file {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| miette!("cannot read '{}': {e}", path.display()))?,
        None => {
            use std::io::Read;
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| miette!("cannot read stdin: {e}"))?;
            buf
        }
    };

    let flags = ParseFlags { strict: cli.strict, eval: false };
    let code = match ctx.parse(&source, flags) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e}");
            return Ok(ExitCode::from(EXIT_PARSE_ERROR));
        }
    };

    if cli.show_opcodes {
        print!("{}", disassemble_all(&ctx, code));
    }

    if let Some(path) = &cli.snapshot_save {
        let image = snapshot::save(&ctx, code);
        std::fs::write(path, image)
            .map_err(|e| miette!("cannot write snapshot '{}': {e}", path.display()))?;
        return Ok(ExitCode::from(EXIT_OK));
    }

    if cli.parse_only {
        return Ok(ExitCode::from(EXIT_OK));
    }

    Ok(finish(&mut ctx, code, &cli))
}

/// Execute a compiled script and map the outcome to an exit code.
fn finish(ctx: &mut Context, code: quark::Cp, cli: &Cli) -> ExitCode {
    let status = match ctx.run(code) {
        Ok(value) => {
            if let Ok(shown) = ctx.to_display_string(value) {
                if !value.is_undefined() {
                    println!("{shown}");
                }
            }
            EXIT_OK
        }
        Err(EngineError::Uncaught { class, message }) => {
            if message.is_empty() {
                eprintln!("Uncaught {class}");
            } else {
                eprintln!("Uncaught {class}: {message}");
            }
            EXIT_UNCAUGHT
        }
        Err(EngineError::OutOfMemory) => {
            eprintln!("quark: out of memory");
            EXIT_OOM
        }
        Err(other) => {
            eprintln!("quark: {other}");
            EXIT_IO
        }
    };
    if cli.mem_stats {
        ctx.heap_stats().print();
        ctx.gc_stats().print();
    }
    ExitCode::from(status)
}

fn disassemble_all(ctx: &Context, root: quark::Cp) -> String {
    let mut out = String::new();
    let mut queue = vec![(root, String::from("script"))];
    let mut seen = Vec::new();
    while let Some((cp, label)) = queue.pop() {
        if seen.contains(&cp) {
            continue;
        }
        seen.push(cp);
        let code = ctx.heap_view().code(cp);
        out.push_str(&format!("=== {label} ===\n"));
        out.push_str(&code.disassemble(Some(ctx.heap_view())));
        for (i, &inner) in code.inner.iter().enumerate() {
            queue.push((inner, format!("{label}.fn#{i}")));
        }
    }
    out
}
