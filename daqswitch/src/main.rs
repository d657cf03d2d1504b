//! daqswitch: switch for DAQ fragment traffic
//!
//! Forwards by destination address and, with the voq_swq datapath, moves the data flows that
//! follow a fragment request onto dedicated queues. Runs an interactive shell on stdin unless
//! `--disable-cli` is given, in which case it prints statistics periodically.

mod bridge;
mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam::channel::{unbounded, RecvTimeoutError};
use daqswitchlib::{Backpressure, DaqSwitch, Datapath, StatsReport, SwitchConfig};
use std::{
    io::{self, BufRead, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use cli::{Command, Shell};

#[derive(Parser, Debug)]
#[command(name = "daqswitch", about = "Switch for DAQ fragment traffic", version)]
struct Args {
    /// Number of ports
    #[arg(short, long, default_value_t = 4)]
    ports: u16,

    /// Number of cores, core 0 is the management core
    #[arg(short, long, default_value_t = 4)]
    lcores: u32,

    /// NUMA socket of every port, comma separated (default: all on socket 0)
    #[arg(long, value_delimiter = ',')]
    port_sockets: Vec<u32>,

    /// Datapath variant: voq_swq, oq_hwq or voq_hwq
    #[arg(short, long, default_value = "voq_swq")]
    datapath: Datapath,

    /// Print statistics periodically instead of running the shell
    #[arg(long)]
    disable_cli: bool,

    /// Drop packets that do not fit into a full ring instead of retrying
    #[arg(long)]
    lossy: bool,

    /// Seconds between two statistics reports without the shell
    #[arg(long, default_value_t = 30)]
    stats_interval: u64,

    /// Seconds before an idle data flow is released, 0 keeps flows forever
    #[arg(long, default_value_t = 30)]
    flow_idle_timeout: u64,

    /// Host interfaces bridged to the ports, in port order, comma separated
    #[arg(long, value_delimiter = ',')]
    iface: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn switch_config(&self) -> Result<SwitchConfig> {
        let mut cfg = SwitchConfig::new(self.ports, self.lcores);
        if !self.port_sockets.is_empty() {
            if self.port_sockets.len() != self.ports as usize {
                bail!(
                    "{} port sockets given for {} ports",
                    self.port_sockets.len(),
                    self.ports
                );
            }
            cfg.port_sockets = self.port_sockets.clone();
        }
        if self.iface.len() > self.ports as usize {
            bail!("{} interfaces given for {} ports", self.iface.len(), self.ports);
        }
        cfg.datapath = self.datapath;
        if self.lossy {
            cfg.backpressure = Backpressure::Lossy;
        }
        cfg.stats_interval = Duration::from_secs(self.stats_interval);
        cfg.flow_idle_timeout = Duration::from_secs(self.flow_idle_timeout);
        cfg.cli_enabled = !self.disable_cli;
        cfg.validate().context("invalid configuration")?;
        Ok(cfg)
    }
}

/// Handle Ctrl+C
fn handle_signal(kr: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        kr.store(false, Ordering::SeqCst);
    })
    .context("setting Ctrl-C handler")
}

/// Sleep for `d` unless the switch stops first
fn sleep_while_running(d: Duration, keep_running: &AtomicBool) {
    let end = Instant::now() + d;
    while keep_running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= end {
            break;
        }
        thread::sleep((end - now).min(Duration::from_millis(100)));
    }
}

/// Report statistics every `interval` until the switch stops
fn print_stats(sw: &DaqSwitch, interval: Duration, keep_running: &AtomicBool) {
    let mut before = sw.stats_snapshot();
    let mut t0 = Instant::now();
    while keep_running.load(Ordering::SeqCst) {
        sleep_while_running(interval, keep_running);
        let after = sw.stats_snapshot();
        let now = Instant::now();
        println!("{}", StatsReport::between(&before, &after, now - t0));
        before = after;
        t0 = now;
    }
}

/// Read commands from stdin until `quit` or the switch stops
fn run_shell(sw: &mut DaqSwitch, keep_running: &Arc<AtomicBool>) -> Result<()> {
    let (tx, rx) = unbounded::<String>();
    // stdin blocks, so it is read on a thread of its own that dies with the process
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(l) => {
                        if tx.send(l).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        })
        .context("spawning stdin reader")?;

    let mut shell = Shell::new(sw);
    let mut out = io::stdout();
    shell.prompt(&mut out)?;
    while keep_running.load(Ordering::SeqCst) {
        let line = match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(l) => l,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match Command::parse(&line) {
            Ok(Command::Quit) => break,
            Ok(cmd) => {
                if let Err(e) = shell.execute(cmd, &mut out) {
                    writeln!(out, "error: {:#}", e)?;
                }
            }
            Err(e) => writeln!(out, "{}", e)?,
        }
        shell.prompt(&mut out)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .with_target(false)
        .init();

    let cfg = args.switch_config()?;
    log::info!("{:?}", cfg);
    let stats_interval = cfg.stats_interval;
    let cli_enabled = cfg.cli_enabled;

    let (mut sw, nic) = DaqSwitch::with_soft_nic(cfg).context("creating the switch")?;
    let keep_running = sw.keep_running();
    handle_signal(keep_running.clone())?;

    sw.init().context("initializing the switch")?;
    sw.configure().context("configuring the switch")?;
    sw.start().context("starting the switch")?;

    let bridges = bridge::spawn(&nic, &args.iface, keep_running.clone())
        .context("bridging host interfaces")?;

    if cli_enabled {
        run_shell(&mut sw, &keep_running)?;
    } else {
        print_stats(&sw, stats_interval, &keep_running);
    }

    log::info!("shutting down");
    sw.stop().context("stopping the switch")?;
    for b in bridges {
        if b.join().is_err() {
            log::error!("bridge thread panicked");
        }
    }
    Ok(())
}
