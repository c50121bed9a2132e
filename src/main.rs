//! # Tonearm
//!
//! Runs the engine behind a minimal line-oriented front end: requests arrive on
//! stdin as JSON lines, responses and broadcast notifications leave on stdout.
//! A web front end can drive the binary as a child process or be linked against
//! the library directly.
//!
//! ## Usage
//!
//! ```bash
//! # Run against the MPD socket
//! tonearm run --host /run/mpd/socket
//!
//! # Show what was played recently
//! tonearm last-played --limit 20
//! ```

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use log::{debug, info, warn};

use tonearm::api::{Request, Response};
use tonearm::cli;
use tonearm::completion;
use tonearm::config::{self, EngineConfig, StateStore, Workdir};
use tonearm::daemon::mpd::MpdConnector;
use tonearm::engine::Engine;
use tonearm::job_queue::JobQueue;
use tonearm::last_played::LastPlayedList;

static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signal: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

fn open_workdir(workdir: Option<PathBuf>) -> Result<Workdir> {
    let root = match workdir {
        Some(path) => path,
        None => config::get_data_dir()?,
    };
    Workdir::prepare(&root)
}

/// Forward stdin lines to the engine until end of input
fn spawn_reader(inbound: Arc<JobQueue<Request>>, eof: Arc<AtomicBool>) -> Result<()> {
    thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Can not read request: {e}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match Request::from_json(&line) {
                    Ok(request) => inbound.push(request),
                    Err(e) => warn!("Dropping request: {e}"),
                }
            }
            debug!("End of input");
            eof.store(true, Ordering::SeqCst);
        })
        .context("Failed to spawn stdin reader")?;
    Ok(())
}

fn write_response(out: &mut impl Write, response: &Response) -> Result<()> {
    writeln!(out, "{}", response.payload).context("Failed to write response")?;
    out.flush().context("Failed to flush stdout")
}

fn run(workdir: Workdir, patch: Option<config::SettingsPatch>) -> Result<()> {
    let store = StateStore::new(workdir.state_dir());
    let mut engine_config = EngineConfig::load(&store).context("Failed to load settings")?;
    if let Some(patch) = patch {
        engine_config
            .apply(&store, &patch)
            .context("Invalid connection settings")?;
    }

    install_signal_handlers();
    let engine = Engine::start(engine_config, store, &workdir, Box::new(MpdConnector))?;
    let eof = Arc::new(AtomicBool::new(false));
    spawn_reader(engine.inbound(), Arc::clone(&eof))?;

    let outbound = engine.outbound();
    let mut stdout = io::stdout().lock();
    while !SIGNALLED.load(Ordering::SeqCst) && !eof.load(Ordering::SeqCst) {
        if let Some(response) = outbound.shift(Duration::from_millis(100)) {
            write_response(&mut stdout, &response)?;
        }
    }

    info!("Stopping engine");
    engine.stop()?;
    for response in outbound.drain() {
        write_response(&mut stdout, &response)?;
    }
    Ok(())
}

fn print_last_played(workdir: Workdir, offset: usize, limit: usize) -> Result<()> {
    let store = StateStore::new(workdir.state_dir());
    let engine_config = EngineConfig::load(&store)?;
    let list = LastPlayedList::new(workdir.last_played_file(), engine_config.last_played_count);
    let (entries, total) = list.read(offset, limit)?;
    for entry in &entries {
        println!("{}\t{}", entry.timestamp, entry.uri);
    }
    info!("Showing {} of {total} entries", entries.len());
    Ok(())
}

/// Main entry point for Tonearm.
///
/// Initializes logging, parses command-line arguments, and routes commands.
/// Logging is controlled via `RUST_LOG`, e.g. `RUST_LOG=tonearm=debug tonearm run`.
fn main() -> Result<()> {
    env_logger::init();

    let args = cli::Args::parse();

    match args.command {
        cli::Command::Run {
            host,
            port,
            password,
        } => {
            let workdir = open_workdir(args.workdir)?;
            info!("Working directory: {}", workdir.root().display());
            run(workdir, cli::connection_patch(host, port, password))?;
        }
        cli::Command::LastPlayed { offset, limit } => {
            print_last_played(open_workdir(args.workdir)?, offset, limit)?;
        }
        cli::Command::Completion { shell } => {
            let mut cmd = cli::Args::command();
            completion::generate_completions(
                completion::shell_to_completion_shell(shell),
                &mut cmd,
                &mut io::stdout(),
            );
        }
    }

    Ok(())
}
