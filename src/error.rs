use thiserror::Error;

use crate::access::AccessError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Access to the target failed")]
    Access(#[from] AccessError),
    #[error("Device '{0}' is not part of the topology")]
    UnknownDevice(String),
    #[error("Device '{0}' was registered twice")]
    DuplicateDevice(String),
    #[error("Invalid edge: {0}")]
    InvalidEdge(String),
    #[error("Sinks '{first}' and '{second}' share CTI output {line} on channel {channel}")]
    SharedSinkTrigger {
        first: String,
        second: String,
        line: u8,
        channel: u8,
    },
    #[error("No trace stream ids left in the block for {0:?}")]
    StreamIdsExhausted(crate::topology::SourceFamily),
    #[error("Trace stream id blocks of {first:?} and {second:?} overlap")]
    StreamBlocksOverlap {
        first: crate::topology::SourceFamily,
        second: crate::topology::SourceFamily,
    },
    #[error("CTI channel {channel} is claimed by both '{first}' and '{second}'")]
    ChannelConflict {
        channel: u8,
        first: String,
        second: String,
    },
    #[error("SMP group '{0}' has not been configured")]
    NotConfigured(String),
    #[error("Core '{core}' is not a member of SMP group '{group}'")]
    NotAMember { core: String, group: String },
    #[error("Trace source '{0}' does not support address range filtering")]
    RangeUnsupported(String),
    #[error("Invalid trace range {start:#X}..{end:#X}")]
    InvalidRange { start: u64, end: u64 },
    #[error("Option '{path}' should be {expected}")]
    OptionType { path: String, expected: &'static str },
    #[error("Port width {width} is not supported by {probe}")]
    UnsupportedPortWidth { width: u64, probe: &'static str },
    #[error("The engine is not connected")]
    NotConnected,
}
