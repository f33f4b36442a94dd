//! # pistep
//!
//! Host process for a Linux-driven 3D printer: reads G-code, plans motion,
//! and emits step pulses through a DMA-paced GPIO ring (or records them in
//! dry-run mode).
//!
//! The core runs as a single cooperative loop on the main thread; a reader
//! thread feeds it G-code lines over a bounded channel. See `state.rs` for
//! the loop and the `motion`/`sched`/`rpi-dma` crates for the machinery.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::bounded;
use tracing::{error, info, warn};

use pistep_host::config::PrinterConfig;
use pistep_host::machine::{self, Machine};
use pistep_host::state::MachineState;

/// Drive a 3D printer's steppers and heaters from G-code.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the printer configuration file.
    #[arg(short, long, default_value = "printer.cfg")]
    config_path: PathBuf,

    /// G-code input file; reads stdin when omitted.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Plan and record events without touching hardware.
    #[arg(long)]
    dry_run: bool,

    /// With --dry-run, write the captured event stream to this file as JSON.
    #[arg(long)]
    dump_events: Option<PathBuf>,
}

/// Route SIGINT/SIGTERM through `exit()` so the atexit chain halts the DMA
/// engine and restores pin states; the default signal action would leave it
/// streaming.
extern "C" fn terminate(_signal: libc::c_int) {
    unsafe { libc::exit(130) };
}

fn install_signal_handlers() {
    let handler = terminate as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    info!(config = ?cli.config_path, dry_run = cli.dry_run, "starting");
    let config = PrinterConfig::load(&cli.config_path)?;
    let machine = Machine::build(&config, cli.dry_run)?;
    install_signal_handlers();

    // Reader thread: lines in, replies out on the main loop's side.
    let (line_tx, line_rx) = bounded::<String>(100);
    let input = cli.input.clone();
    let reader = std::thread::spawn(move || -> Result<()> {
        let source: Box<dyn BufRead + Send> = match input {
            Some(path) => Box::new(BufReader::new(
                File::open(&path).with_context(|| format!("opening g-code file {path:?}"))?,
            )),
            None => Box::new(BufReader::new(std::io::stdin())),
        };
        for line in source.lines() {
            let line = line.context("reading g-code input")?;
            if line_tx.send(line).is_err() {
                break;
            }
        }
        Ok(())
    });

    let stdout = std::io::stdout();
    let mut state = MachineState::new(machine);
    let run_result = state.run(line_rx, |reply| {
        if !reply.is_empty() {
            let mut out = stdout.lock();
            let _ = writeln!(out, "{reply}");
            let _ = out.flush();
        }
    });

    match reader.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(%err, "input reader failed"),
        Err(_) => error!("input reader panicked"),
    }

    if let Some(path) = &cli.dump_events {
        match &state.machine.scheduler {
            machine::SchedulerBackend::Recorder(recorder) => {
                let json = serde_json::to_string_pretty(&recorder.events)?;
                std::fs::write(path, json)
                    .with_context(|| format!("writing event trace to {path:?}"))?;
                info!(?path, events = recorder.events.len(), "event trace written");
            }
            _ => warn!("--dump-events only captures in --dry-run mode"),
        }
    }

    run_result
}
