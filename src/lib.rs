//! Trace topology reconciliation for CoreSight debug sessions.
//!
//! A board's debug and trace components are described once as a [`topology::Topology`]. The
//! [`engine::Engine`] then keeps the hardware in line with the session options: which devices
//! are connected for the selected capture mode, which funnel ports are open, how the sink is
//! configured, which address ranges are traced, and how the cores of an SMP group are halted
//! and restarted together over CTI channels.
pub mod access;
pub mod config;
pub mod cti;
pub mod enablement;
pub mod engine;
pub mod error;
pub mod managed;
pub mod options;
pub mod range;
pub mod resolver;
pub mod sim;
pub mod sink;
pub mod sync;
pub mod topology;

pub use error::Error;
