//! Interactive shell of the switch

use anyhow::{anyhow, bail, Context, Result};
use daqswitchlib::{DaqSwitch, StatsReport};
use std::{io::Write, net::Ipv4Addr, thread, time::Duration};

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    /// Rates measured over the given window
    StatsShow(Duration),
    StatsReset,
    Dump,
    DumpFdir,
    FlowAdd { ip: Ipv4Addr, depth: u8, port: u16 },
    FlowRelease { port: u16, slot: usize },
    FlowList,
    Help,
    Quit,
    Empty,
}

const HELP: &str = "\
stats show [ms]                   rates over a window, 200 ms by default
stats reset                       clear all counters
dump                              lcores, ports and data flows
dump fdir                         flow director counters
flow add <ip>[/<depth>] <port>    route a prefix to a port
flow release <port> <slot>        release a data flow
flow list                         rules added from the shell
help
quit";

impl Command {
    pub const STATS_WINDOW: Duration = Duration::from_millis(200);

    pub fn parse(line: &str) -> Result<Self> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let cmd = match words.as_slice() {
            [] => Command::Empty,
            ["stats", "show"] | ["stats"] => Command::StatsShow(Self::STATS_WINDOW),
            ["stats", "show", ms] => {
                let ms: u64 = ms.parse().with_context(|| format!("bad window {}", ms))?;
                Command::StatsShow(Duration::from_millis(ms))
            }
            ["stats", "reset"] => Command::StatsReset,
            ["dump"] => Command::Dump,
            ["dump", "fdir"] => Command::DumpFdir,
            ["flow", "add", prefix, port] => {
                let (ip, depth) = parse_prefix(prefix)?;
                let port: u16 = port.parse().with_context(|| format!("bad port {}", port))?;
                Command::FlowAdd { ip, depth, port }
            }
            ["flow", "release", port, slot] => Command::FlowRelease {
                port: port.parse().with_context(|| format!("bad port {}", port))?,
                slot: slot.parse().with_context(|| format!("bad slot {}", slot))?,
            },
            ["flow", "list"] => Command::FlowList,
            ["help"] | ["?"] => Command::Help,
            ["quit"] | ["exit"] => Command::Quit,
            _ => bail!("unknown command '{}', try help", line.trim()),
        };
        Ok(cmd)
    }
}

/// `a.b.c.d` or `a.b.c.d/depth`
fn parse_prefix(s: &str) -> Result<(Ipv4Addr, u8)> {
    let (ip, depth) = match s.split_once('/') {
        Some((ip, depth)) => (
            ip,
            depth.parse::<u8>().with_context(|| format!("bad depth {}", depth))?,
        ),
        None => (s, 32),
    };
    if depth == 0 || depth > 32 {
        return Err(anyhow!("depth {} out of range 1..=32", depth));
    }
    let ip: Ipv4Addr = ip.parse().with_context(|| format!("bad address {}", ip))?;
    Ok((ip, depth))
}

pub struct Shell<'a> {
    sw: &'a mut DaqSwitch,
}

impl<'a> Shell<'a> {
    pub const PROMPT: &'static str = "daqswitch> ";

    pub fn new(sw: &'a mut DaqSwitch) -> Self {
        Self { sw }
    }

    pub fn prompt<W: Write>(&self, out: &mut W) -> Result<()> {
        write!(out, "{}", Self::PROMPT)?;
        out.flush()?;
        Ok(())
    }

    pub fn execute<W: Write>(&mut self, cmd: Command, out: &mut W) -> Result<()> {
        match cmd {
            Command::StatsShow(window) => {
                let before = self.sw.stats_snapshot();
                thread::sleep(window);
                let after = self.sw.stats_snapshot();
                writeln!(out, "{}", StatsReport::between(&before, &after, window))?;
            }
            Command::StatsReset => {
                self.sw.stats_reset();
                writeln!(out, "counters cleared")?;
            }
            Command::Dump => write!(out, "{}", self.sw.dump())?,
            Command::DumpFdir => write!(out, "{}", self.sw.dump_fdir())?,
            Command::FlowAdd { ip, depth, port } => {
                self.sw.ipv4_flow_add(ip, depth, port)?;
                writeln!(out, "{}/{} -> port {}", ip, depth, port)?;
            }
            Command::FlowRelease { port, slot } => {
                self.sw.release_flow(port, slot)?;
                writeln!(out, "released port {} slot {}", port, slot)?;
            }
            Command::FlowList => write!(out, "{}", self.sw.ipv4_flow_dump())?,
            Command::Help => writeln!(out, "{}", HELP)?,
            Command::Quit | Command::Empty => {}
        }
        Ok(())
    }
}
