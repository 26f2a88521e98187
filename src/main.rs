//! Melee CLI and REPL
//!
//! Usage:
//!   melee run <file.mel> [--ticks N]   - Execute a file, optionally clocking `main`
//!   melee disasm <file.mel>            - Print the compiled bytecode
//!   melee repl                         - Start interactive REPL

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::{debug, error};
use tracing_subscriber::{fmt, EnvFilter};

use melee::{MeleeError, Runtime, Value, VmConfig, VERSION};

#[derive(Parser, Debug)]
#[command(name = "melee", version = VERSION)]
#[command(about = "Compile and run Melee sequencer programs")]
struct Cli {
    /// Operand stack capacity
    #[arg(long = "max-stack", global = true)]
    max_stack: Option<usize>,

    /// Call depth and sequence nesting limit
    #[arg(long = "max-frames", global = true)]
    max_frames: Option<usize>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a file
    Run {
        file: PathBuf,

        /// Start `main` and print the events of this many clock ticks
        #[arg(long)]
        ticks: Option<u64>,
    },
    /// Print the top-level listing and every compiled callable
    Disasm { file: PathBuf },
    /// Start an interactive session
    Repl,
}

impl Cli {
    fn config(&self) -> VmConfig {
        let mut config = VmConfig::default();
        if let Some(max_stack) = self.max_stack {
            config = config.with_max_stack(max_stack);
        }
        if let Some(max_frames) = self.max_frames {
            config = config.with_max_frames(max_frames);
        }
        config
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("melee=warn"));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn main() {
    init_logging();

    let cli = Cli::parse();
    let config = cli.config();
    debug!(?config, "starting");

    match cli.command {
        Some(Command::Run { file, ticks }) => run_file(&file, ticks, config),
        Some(Command::Disasm { file }) => disasm_file(&file, config),
        Some(Command::Repl) | None => run_repl(config),
    }
}

fn read_source(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("{}: cannot read file '{}': {}", "error".red(), path.display(), e);
            process::exit(1);
        }
    }
}

fn report(errors: &[MeleeError]) {
    for err in errors {
        eprintln!("{}", format!("{}", err).red());
    }
}

fn run_file(path: &Path, ticks: Option<u64>, config: VmConfig) {
    let source = read_source(path);
    let mut runtime = Runtime::with_config(config);

    if let Err(errors) = runtime.exec(&source) {
        report(&errors);
        process::exit(1);
    }

    let Some(ticks) = ticks else {
        return;
    };

    if let Err(e) = runtime.start(Vec::new()) {
        report(&[e]);
        process::exit(1);
    }
    for tick in 0..ticks {
        match runtime.clock() {
            Ok(events) => {
                let events: Vec<String> = events.iter().map(Value::to_string).collect();
                println!("{} {}", format!("{:>4}", tick).dimmed(), events.join(" "));
            }
            Err(e) => {
                error!(tick, "clock failed");
                report(&[e]);
                process::exit(1);
            }
        }
    }
}

fn disasm_file(path: &Path, config: VmConfig) {
    let source = read_source(path);
    let mut runtime = Runtime::with_config(config);
    match runtime.compile(&source) {
        Ok(bytecode) => print!("{}", bytecode.disassemble()),
        Err(errors) => {
            report(&errors);
            process::exit(1);
        }
    }
}

fn run_repl(config: VmConfig) {
    println!(
        "{} {} - {}",
        "Melee".cyan().bold(),
        VERSION.cyan(),
        "a sequencer language".dimmed()
    );
    println!("Type {} to exit, {} for help\n", "exit".yellow(), "help".yellow());

    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("{}: cannot start REPL: {}", "error".red(), e);
            process::exit(1);
        }
    };

    // one session, so globals survive between lines
    let mut runtime = Runtime::with_config(config);

    loop {
        match rl.readline(&format!("{} ", "mel>".green().bold())) {
            Ok(line) => {
                let line = line.trim();

                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                match line {
                    "exit" | "quit" => {
                        println!("{}", "Goodbye!".cyan());
                        break;
                    }
                    "help" => {
                        print_repl_help();
                        continue;
                    }
                    "clear" => {
                        runtime = Runtime::with_config(config);
                        println!("{}", "State cleared.".dimmed());
                        continue;
                    }
                    "start" => {
                        match runtime.start(Vec::new()) {
                            Ok(_) => println!("{}", "main started.".dimmed()),
                            Err(e) => report(&[e]),
                        }
                        continue;
                    }
                    "tick" => {
                        match runtime.clock() {
                            Ok(events) => {
                                let events: Vec<String> =
                                    events.iter().map(Value::to_string).collect();
                                println!("{} {}", "=>".dimmed(), events.join(" ").cyan());
                            }
                            Err(e) => report(&[e]),
                        }
                        continue;
                    }
                    _ => {}
                }

                match runtime.exec(line) {
                    Ok(value) => {
                        if !matches!(value, Value::Null) {
                            println!("{} {}", "=>".dimmed(), format!("{}", value).cyan());
                        }
                    }
                    Err(errors) => report(&errors),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("{}", "^C".dimmed());
            }
            Err(ReadlineError::Eof) => {
                println!("{}", "Goodbye!".cyan());
                break;
            }
            Err(err) => {
                eprintln!("{}: {:?}", "error".red(), err);
                break;
            }
        }
    }
}

fn print_repl_help() {
    println!("{}", "REPL Commands:".yellow());
    println!("  exit, quit   Exit the REPL");
    println!("  clear        Start a fresh session");
    println!("  start        Call the 'main' generator");
    println!("  tick         Advance 'main' by one clock tick");
    println!("  help         Show this help\n");
    println!("{}", "Language Examples:".yellow());
    println!("  x := 60");
    println!("  up := gen(p) {{ loop {{ yield note [p]; p += 2 }} }}");
    println!("  main := gen() {{ s := up(60); loop {{ yield next s }} }}");
    println!("  take(cycle([note [60], skip 1]), 4)");
}
