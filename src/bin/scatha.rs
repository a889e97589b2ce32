//! The `scatha` command-line compiler
//!
//! `scatha <files>` compiles serialized IR (`.scir`) to a binary program,
//! `scatha run` executes a compiled program, `scatha inspect` prints
//! intermediate pipeline stages and `scatha graph` renders graphviz views
//! of the compiler's data structures.
//!
//! The language frontend (lexer, parser, semantic analysis) is an external
//! collaborator; `.sc` source files are diagnosed as unsupported by this
//! distribution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{anyhow, bail, Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::debug;

use scatha::asm::{self, ForeignLibraryDecl, LinkerOptions, MAGIC};
use scatha::ir;
use scatha::mir;
use scatha::opt::Pipeline;
use scatha::vm::VirtualMachine;

#[derive(Parser)]
#[command(name = "scatha", version, about = "Scatha compiler and virtual machine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    compile: CompileArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a compiled binary
    Run {
        /// The `.sbin` file or self-executing wrapper
        binary: PathBuf,
        /// Arguments passed to the guest program
        arguments: Vec<String>,
    },
    /// Print intermediate representations of the pipeline
    Inspect(InspectArgs),
    /// Render graphviz views of compiler data structures
    Graph(GraphArgs),
}

#[derive(clap::Args)]
struct CompileArgs {
    /// Input files: `.scir` serialized IR
    files: Vec<PathBuf>,

    /// Enable the default optimization pipeline
    #[arg(short = 'O', long)]
    optimize: bool,

    /// Emit a `.scdsym` debug-symbol file alongside the binary
    #[arg(short = 'd', long)]
    debug: bool,

    /// Colon-separated foreign-library search paths
    #[arg(short = 'L', long)]
    libsearchpaths: Option<String>,

    /// Output kind
    #[arg(short = 'T', long, value_enum, default_value_t = TargetType::Exec)]
    target_type: TargetType,

    /// Output path
    #[arg(short = 'o', long, default_value = "out")]
    output: PathBuf,

    /// Write a bare `.sbin` instead of a self-executing wrapper
    #[arg(short = 'b', long)]
    binary_only: bool,

    /// Print per-stage wall-clock times
    #[arg(short = 't', long)]
    time: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TargetType {
    /// A runnable program
    Exec,
    /// A linkable static library image
    Staticlib,
}

#[derive(clap::Args)]
struct InspectArgs {
    /// Input files
    files: Vec<PathBuf>,

    /// Print the abstract syntax tree (frontend collaborator)
    #[arg(long)]
    ast: bool,

    /// Print the symbol table (frontend collaborator)
    #[arg(long)]
    sym: bool,

    /// Print the IR after the pipeline ran
    #[arg(long)]
    emit_ir: bool,

    /// Print the MIR after register allocation
    #[arg(long)]
    codegen: bool,

    /// Print the MIR after instruction selection
    #[arg(long)]
    isel: bool,

    /// Print the assembly stream
    #[arg(long)]
    asm: bool,

    /// Pipeline specification to run before printing
    #[arg(long)]
    pipeline: Option<String>,
}

#[derive(clap::Args)]
struct GraphArgs {
    /// Input files
    files: Vec<PathBuf>,

    /// Control-flow graph per function
    #[arg(long)]
    cfg: bool,

    /// Call graph of the module
    #[arg(long)]
    calls: bool,

    /// Register interference graph per function
    #[arg(long)]
    interference: bool,

    /// Instruction selection DAG per block
    #[arg(long)]
    selection_dag: bool,

    /// Output directory
    #[arg(long, default_value = ".")]
    dest: PathBuf,

    /// Also render `.svg` files (requires graphviz)
    #[arg(long)]
    svg: bool,

    /// Open the rendered files
    #[arg(long)]
    open: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Command::Run { binary, arguments }) => run(&binary, &arguments),
        Some(Command::Inspect(args)) => inspect(&args),
        Some(Command::Graph(args)) => graph(&args),
        None => compile(&cli.compile),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("scatha: {err:#}");
            ExitCode::from(1)
        }
    }
}

/// Read and parse all inputs into one module
fn load_module(ctx: &mut ir::Context, files: &[PathBuf]) -> Result<ir::Module> {
    if files.is_empty() {
        // Invocation errors exit with a distinct code
        eprintln!("scatha: no input files");
        std::process::exit(-1);
    }
    let mut source = String::new();
    for file in files {
        match file.extension().and_then(|e| e.to_str()) {
            Some("scir") => {}
            Some("sc") => bail!(
                "{}: source-language input requires the frontend, which is not part of \
                 this distribution; compile to .scir first",
                file.display()
            ),
            _ => {
                eprintln!("scatha: {}: unrecognized input", file.display());
                std::process::exit(-1);
            }
        }
        source.push_str(
            &std::fs::read_to_string(file)
                .with_context(|| format!("reading {}", file.display()))?,
        );
        source.push('\n');
    }
    let module = ir::parse_module(ctx, &source).map_err(|e| anyhow!(e))?;
    for id in module.function_ids() {
        ir::validate(ctx, module.function(id)).map_err(|e| anyhow!("invalid IR: {e}"))?;
    }
    Ok(module)
}

fn resolve_libraries(search_paths: &Option<String>) -> Vec<ForeignLibraryDecl> {
    let Some(paths) = search_paths else {
        return Vec::new();
    };
    let mut libs = Vec::new();
    for dir in paths.split(':') {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_shared = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("so" | "dylib" | "dll")
            );
            if is_shared {
                libs.push(ForeignLibraryDecl {
                    name: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    resolved_path: Some(path),
                });
            }
        }
    }
    libs
}

struct StageTimer {
    enabled: bool,
    last: Instant,
}

impl StageTimer {
    fn new(enabled: bool) -> Self {
        StageTimer {
            enabled,
            last: Instant::now(),
        }
    }

    fn lap(&mut self, stage: &str) {
        if self.enabled {
            println!("{stage:<12} {:>10.3?}", self.last.elapsed());
        }
        self.last = Instant::now();
    }
}

fn compile(args: &CompileArgs) -> Result<ExitCode> {
    let mut timer = StageTimer::new(args.time);
    let mut ctx = ir::Context::new();
    let mut module = load_module(&mut ctx, &args.files)?;
    timer.lap("parse");

    if args.optimize {
        Pipeline::default_optimization().run(&mut ctx, &mut module);
        timer.lap("optimize");
    }

    let mut mir_module = mir::lower_module(&ctx, &module);
    timer.lap("isel");
    for function in &mut mir_module.functions {
        mir::allocate_registers(function);
    }
    timer.lap("regalloc");
    let stream = scatha::cg::generate(&ctx, &mir_module);
    timer.lap("codegen");
    let assembled = asm::assemble(&stream);
    timer.lap("assemble");

    let libs = resolve_libraries(&args.libsearchpaths);
    let mut binary = assembled.binary.clone();
    asm::link(
        LinkerOptions { search_host: true },
        &mut binary,
        &libs,
        &assembled.unresolved_symbols,
    )?;
    timer.lap("link");

    let output = &args.output;
    if args.binary_only || args.target_type == TargetType::Staticlib {
        let path = output.with_extension("sbin");
        std::fs::write(&path, &binary).with_context(|| format!("writing {}", path.display()))?;
        debug!(path = %path.display(), "wrote binary");
    } else {
        // Self-executing wrapper: a shell stub with the binary appended;
        // `scatha run` skips ahead to the magic bytes
        let mut wrapper = b"#!/bin/sh\nexec scatha run \"$0\" \"$@\"\n".to_vec();
        wrapper.extend_from_slice(&binary);
        std::fs::write(output, &wrapper)
            .with_context(|| format!("writing {}", output.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perm = std::fs::metadata(output)?.permissions();
            perm.set_mode(0o755);
            std::fs::set_permissions(output, perm)?;
        }
    }

    if args.debug {
        write_debug_symbols(output, &stream, &assembled)?;
    }
    timer.lap("emit");
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct DebugSymbol {
    name: String,
    offset: u64,
}

fn write_debug_symbols(
    output: &Path,
    stream: &asm::AssemblyStream,
    assembled: &asm::AssemblerResult,
) -> Result<()> {
    let symbols: Vec<DebugSymbol> = stream
        .blocks
        .iter()
        .filter_map(|block| {
            assembled.symbols.get(&block.id).map(|&offset| DebugSymbol {
                name: block.name.clone(),
                offset,
            })
        })
        .collect();
    let path = output.with_extension("scdsym");
    std::fs::write(&path, serde_json::to_string_pretty(&symbols)?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn run(path: &Path, arguments: &[String]) -> Result<ExitCode> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    // Accept both bare binaries and self-executing wrappers
    let magic = MAGIC.to_le_bytes();
    let start = bytes
        .windows(4)
        .position(|w| w == magic)
        .ok_or_else(|| anyhow!("{}: not a scatha binary", path.display()))?;
    let mut vm = VirtualMachine::new();
    vm.load_binary(&bytes[start..])
        .map_err(|e| anyhow!("load error: {e}"))?;
    let seed = scatha::vm::setup_arguments(&mut vm, arguments)
        .map_err(|e| anyhow!("argument setup failed: {e}"))?;
    let exit = vm
        .execute(&seed)
        .map_err(|e| anyhow!("runtime exception: {e}"))?;
    Ok(ExitCode::from(exit as u8))
}

fn inspect(args: &InspectArgs) -> Result<ExitCode> {
    if args.ast || args.sym {
        bail!("--ast and --sym require the frontend, which is not part of this distribution");
    }
    let mut ctx = ir::Context::new();
    let mut module = load_module(&mut ctx, &args.files)?;
    if let Some(spec) = &args.pipeline {
        let pipeline = Pipeline::parse(spec)?;
        pipeline.run(&mut ctx, &mut module);
    }
    if args.emit_ir {
        print!("{}", ir::print_module(&ctx, &module));
    }
    if args.isel || args.codegen || args.asm {
        let mut mir_module = mir::lower_module(&ctx, &module);
        if args.isel {
            print_mir(&mir_module);
        }
        for function in &mut mir_module.functions {
            mir::allocate_registers(function);
        }
        if args.codegen {
            print_mir(&mir_module);
        }
        if args.asm {
            let stream = scatha::cg::generate(&ctx, &mir_module);
            print!("{}", asm::print_stream(&stream));
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_mir(module: &mir::MirModule) {
    for function in &module.functions {
        println!("func {} ({} registers):", function.name, function.next_reg);
        for block in &function.blocks {
            println!("  {}:", block.name);
            for inst in &block.insts {
                println!("    {inst:?}");
            }
        }
        println!();
    }
}

fn graph(args: &GraphArgs) -> Result<ExitCode> {
    let mut ctx = ir::Context::new();
    let module = load_module(&mut ctx, &args.files)?;
    std::fs::create_dir_all(&args.dest)?;
    let mut written: Vec<PathBuf> = Vec::new();

    if args.cfg {
        for id in module.function_ids() {
            let function = module.function(id);
            let path = args.dest.join(format!("{}.cfg.dot", function.name));
            std::fs::write(&path, cfg_dot(function))?;
            written.push(path);
        }
    }
    if args.calls {
        let path = args.dest.join("calls.dot");
        std::fs::write(&path, call_graph_dot(&module))?;
        written.push(path);
    }
    if args.interference || args.selection_dag {
        let mir_module = mir::lower_module(&ctx, &module);
        for function in &mir_module.functions {
            if args.interference {
                let path = args.dest.join(format!("{}.interference.dot", function.name));
                std::fs::write(&path, interference_dot(function))?;
                written.push(path);
            }
            if args.selection_dag {
                let path = args.dest.join(format!("{}.dag.dot", function.name));
                std::fs::write(&path, selection_dag_dot(function))?;
                written.push(path);
            }
        }
    }

    if args.svg {
        for dot in &written.clone() {
            let svg = dot.with_extension("svg");
            let status = std::process::Command::new("dot")
                .arg("-Tsvg")
                .arg(dot)
                .arg("-o")
                .arg(&svg)
                .status()
                .context("running graphviz 'dot'")?;
            if status.success() {
                written.push(svg);
            }
        }
    }
    if args.open {
        for path in &written {
            let _ = std::process::Command::new(if cfg!(target_os = "macos") {
                "open"
            } else {
                "xdg-open"
            })
            .arg(path)
            .spawn();
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cfg_dot(function: &ir::Function) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    let _ = writeln!(out, "digraph \"{}\" {{", function.name);
    let _ = writeln!(out, "  node [shape=box fontname=monospace];");
    for block in function.block_ids() {
        let name = &function.block(block).name;
        let _ = writeln!(out, "  \"{name}\";");
        for succ in function.successors(block) {
            let _ = writeln!(out, "  \"{name}\" -> \"{}\";", function.block(succ).name);
        }
    }
    out.push_str("}\n");
    out
}

fn call_graph_dot(module: &ir::Module) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    let _ = writeln!(out, "digraph calls {{");
    for id in module.function_ids() {
        let function = module.function(id);
        let _ = writeln!(out, "  \"{}\";", function.name);
        let mut callees: Vec<String> = Vec::new();
        for block in function.block_ids() {
            for &inst in function.block(block).insts() {
                if !matches!(function.inst(inst).kind, ir::InstKind::Call) {
                    continue;
                }
                if let ir::Value::Function(callee) = function.inst(inst).operands()[0] {
                    callees.push(module.function(callee).name.clone());
                }
            }
        }
        callees.sort();
        callees.dedup();
        for callee in callees {
            let _ = writeln!(out, "  \"{}\" -> \"{callee}\";", function.name);
        }
    }
    out.push_str("}\n");
    out
}

fn interference_dot(function: &mir::MirFunction) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    let _ = writeln!(out, "graph \"{}\" {{", function.name);
    let _ = writeln!(out, "  node [shape=circle fontname=monospace];");
    for (a, b) in mir::interference_edges(function) {
        let _ = writeln!(out, "  R{a} -- R{b};");
    }
    out.push_str("}\n");
    out
}

fn selection_dag_dot(function: &mir::MirFunction) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    let _ = writeln!(out, "digraph \"{}\" {{", function.name);
    let _ = writeln!(out, "  node [shape=record fontname=monospace];");
    for (block_index, block) in function.blocks.iter().enumerate() {
        // Edges from defining instruction to using instruction per block
        let mut last_def: HashMap<u32, usize> = HashMap::new();
        for (i, inst) in block.insts.iter().enumerate() {
            let label = format!("{inst:?}").replace(['"', '{', '}'], "");
            let short = if label.len() > 40 { &label[..40] } else { label.as_str() };
            let _ = writeln!(out, "  n{block_index}_{i} [label=\"{short}\"];");
            inst.for_each_use(|r| {
                if let Some(&def) = last_def.get(&r.0) {
                    let _ = writeln!(out, "  n{block_index}_{def} -> n{block_index}_{i};");
                }
            });
            inst.for_each_def(|r| {
                last_def.insert(r.0, i);
            });
        }
    }
    out.push_str("}\n");
    out
}
