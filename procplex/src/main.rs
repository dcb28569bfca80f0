//! procplex - run one command through the stdio multiplexing engine
//!
//! Mirrors the child's stdout and stderr (or prints one JSON event per line),
//! forwards this process's stdin to the child, and exits with its status.

use anyhow::{bail, Context, Result};
use procplex::{
    init_logging, spawn_streaming, PoolConfig, ProcessBuilder, ProcessEvent, ProcessPool, StreamingProcess,
};
use std::io::{Read, Write};
use tracing::debug;

fn print_help() {
    println!("procplex - child process stdio multiplexer v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  procplex [OPTIONS] -- <PROGRAM> [ARGS...]");
    println!();
    println!("OPTIONS:");
    println!("  -h, --help         Print this help message");
    println!("  -v, --version      Print version information");
    println!("      --json         Print child events as JSON lines on stdout");
    println!("      --threads N    Number of event-processor threads");
    println!("      --stats        Print pool statistics to stderr on exit");
    println!();
    println!("ENVIRONMENT:");
    println!("  PROCPLEX_LOG                   Log filter (default: warn)");
    println!("  PROCPLEX_THREADS               Event-processor threads");
    println!("  PROCPLEX_THREADS_EQUAL_CORES   One processor per CPU");
    println!("  PROCPLEX_BUFFER_CAPACITY       Per-process buffer size in bytes");
}

#[derive(Debug, Default)]
struct Options {
    json: bool,
    stats: bool,
    threads: Option<usize>,
    command: Vec<String>,
}

enum Parsed {
    Run(Options),
    Exit,
}

fn parse_args(args: &[String]) -> Result<Parsed> {
    let mut options = Options::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(Parsed::Exit);
            }
            "-v" | "--version" => {
                println!("procplex {}", env!("CARGO_PKG_VERSION"));
                return Ok(Parsed::Exit);
            }
            "--json" => options.json = true,
            "--stats" => options.stats = true,
            "--threads" => {
                let value = iter.next().context("--threads requires a value")?;
                let n: usize = value
                    .parse()
                    .with_context(|| format!("invalid thread count '{value}'"))?;
                if n == 0 {
                    bail!("--threads must be at least 1");
                }
                options.threads = Some(n);
            }
            "--" => {
                options.command = iter.cloned().collect();
                break;
            }
            other if other.starts_with('-') => {
                bail!("unrecognized argument '{other}'\nRun 'procplex --help' for usage information.");
            }
            _ => {
                options.command = std::iter::once(arg.clone()).chain(iter.cloned()).collect();
                break;
            }
        }
    }

    if options.command.is_empty() {
        bail!("no command given\nRun 'procplex --help' for usage information.");
    }
    Ok(Parsed::Run(options))
}

/// Exit status of this process for a child exit code.
fn status_of(code: i32) -> i32 {
    if (0..=255).contains(&code) {
        code
    } else {
        1
    }
}

fn emit(event: &ProcessEvent, json: bool) -> Result<()> {
    if json {
        let mut out = std::io::stdout().lock();
        serde_json::to_writer(&mut out, event)?;
        out.write_all(b"\n")?;
        return Ok(());
    }
    match event {
        ProcessEvent::Stdout { data } => {
            let mut out = std::io::stdout().lock();
            out.write_all(data)?;
            out.flush()?;
        }
        ProcessEvent::Stderr { data } => {
            let mut err = std::io::stderr().lock();
            err.write_all(data)?;
            err.flush()?;
        }
        _ => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Ok(Parsed::Run(options)) => options,
        Ok(Parsed::Exit) => return Ok(()),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    };

    init_logging();

    let mut config = PoolConfig::from_env();
    if let Some(threads) = options.threads {
        config = config.with_threads(threads);
    }
    let pool = ProcessPool::new(config)?;

    let StreamingProcess {
        handle,
        mut events,
        stdin,
    } = spawn_streaming(ProcessBuilder::new(&options.command).pool(pool.clone()))
        .with_context(|| format!("failed to start '{}'", options.command[0]))?;
    debug!(pid = handle.pid(), "Child started");

    // A blocked read on our stdin must not keep the process alive, so the
    // forwarder runs detached and `main` ends with `process::exit`.
    std::thread::Builder::new()
        .name("procplex-stdin".into())
        .spawn(move || {
            let mut input = std::io::stdin().lock();
            let mut chunk = vec![0u8; 16 * 1024];
            loop {
                match input.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => stdin.write(chunk[..n].to_vec()),
                }
            }
            stdin.close();
        })
        .context("failed to start stdin forwarder")?;

    let mut code = procplex::EXIT_LAUNCH_FAILURE;
    while let Some(event) = events.recv().await {
        if let ProcessEvent::Exit { code: exit } = event {
            code = exit;
        }
        emit(&event, options.json)?;
    }

    if options.stats {
        let stats = pool.stats();
        if options.json {
            eprintln!("{}", serde_json::to_string(&stats)?);
        } else {
            eprintln!("{stats}");
        }
    }

    std::process::exit(status_of(code));
}
