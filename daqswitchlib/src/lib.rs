//! This is the library behind the DAQ switch
//!
//! It provides the packet buffers and the NIC abstraction, the LPM table, the pipelines, the
//! data flow table and the datapaths `voq_swq`, `oq_hwq` and `voq_hwq`. `DaqSwitch` wires them
//! into a running switch.
//!
//! Every datapath core runs a busy loop on its own thread. The cores share nothing but the
//! NIC, the software rings and the flow table, and talk to the control core through the
//! pipeline control channels.

pub mod apis;
pub mod config;
pub mod daqswitch;
pub mod dp;
pub mod flow;
pub mod lpm;
pub mod pipeline;
pub mod sched;
pub mod stats;

#[cfg(test)]
mod testutil;

pub use apis::*;
pub use config::*;
pub use daqswitch::*;
pub use stats::*;
