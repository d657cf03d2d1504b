//! Bridges host interfaces to the ports of the in-memory NIC
//!
//! Port `i` is bridged to the `i`-th interface given. Frames read from the interface are
//! injected into the port, frames the switch sends on any tx queue of the port are written
//! back to the interface.

use anyhow::{anyhow, bail, Context, Result};
use daqswitchlib::SoftNic;
use pnet::datalink::{self, Channel, Config, DataLinkReceiver, DataLinkSender};
use std::{
    io::ErrorKind,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const IDLE_SLEEP: Duration = Duration::from_micros(50);

/// Spawn an rx and a tx thread per interface
pub fn spawn(
    nic: &Arc<SoftNic>,
    ifaces: &[String],
    keep_running: Arc<AtomicBool>,
) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(ifaces.len() * 2);
    let all = datalink::interfaces();
    for (port, name) in ifaces.iter().enumerate() {
        let port = port as u16;
        let iface = all
            .iter()
            .find(|i| &i.name == name)
            .ok_or_else(|| anyhow!("no interface named {}", name))?;
        let config = Config {
            read_timeout: Some(READ_TIMEOUT),
            ..Default::default()
        };
        let (tx, rx) = match datalink::channel(iface, config)
            .with_context(|| format!("opening {}", name))?
        {
            Channel::Ethernet(tx, rx) => (tx, rx),
            _ => bail!("{} is not an ethernet interface", name),
        };
        log::info!("bridging port {} to {}", port, name);

        let (n, kr) = (nic.clone(), keep_running.clone());
        handles.push(
            thread::Builder::new()
                .name(format!("bridge-rx-{}", port))
                .spawn(move || rx_loop(n, port, rx, kr))
                .context("spawning bridge rx")?,
        );
        let (n, kr) = (nic.clone(), keep_running.clone());
        handles.push(
            thread::Builder::new()
                .name(format!("bridge-tx-{}", port))
                .spawn(move || tx_loop(n, port, tx, kr))
                .context("spawning bridge tx")?,
        );
    }
    Ok(handles)
}

fn rx_loop(nic: Arc<SoftNic>, port: u16, mut rx: Box<dyn DataLinkReceiver>, kr: Arc<AtomicBool>) {
    while kr.load(Ordering::SeqCst) {
        match rx.next() {
            Ok(frame) => {
                // a full rx queue drops the frame, like the wire would
                if let Err(e) = nic.inject(port, frame) {
                    log::debug!("port {}: frame dropped: {}", port, e);
                }
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                log::error!("port {}: read failed: {}", port, e);
                break;
            }
        }
    }
}

fn tx_loop(nic: Arc<SoftNic>, port: u16, mut tx: Box<dyn DataLinkSender>, kr: Arc<AtomicBool>) {
    while kr.load(Ordering::SeqCst) {
        let mut sent = 0;
        for queue in 0..nic.nb_tx_queues(port) {
            for m in nic.drain_tx(port, queue) {
                match tx.send_to(m.data(), None) {
                    Some(Ok(())) => sent += 1,
                    Some(Err(e)) => log::warn!("port {}: write failed: {}", port, e),
                    None => log::warn!("port {}: write failed", port),
                }
            }
        }
        if sent == 0 {
            thread::sleep(IDLE_SLEEP);
        }
    }
}
