//! Instrument Protocol Engine
//!
//! Serializes command/reply exchanges with measurement instruments over a
//! serial port or a serial-over-TCP bridge.
//!
//! Supports both line-oriented ASCII protocols (replies ended by a literal or
//! pattern terminator) and binary framed protocols with a checksum.

mod connection;
mod error;
pub mod events;
pub mod frame;
pub mod mock;
mod options;
pub mod raw;
mod request;
pub mod serial;
pub mod stream;
pub mod transport;

pub use connection::{BatchResult, Connection};
pub use error::{FramingError, ProtocolError};
pub use events::EventRegistry;
pub use frame::{Frame, FrameBuilder, FrameChecksum, FrameDecoder, SumChecksum, XorChecksum};
pub use mock::ScriptedTransport;
pub use options::{ConnectionOptions, DataBits, Parity, StopBits};
pub use raw::{ByteAccumulator, RawPort};
pub use request::{MatchGroups, Request, Response, Terminator};
pub use serial::{list_ports, PortInfo};
pub use transport::{StreamTransport, Transport};

/// Default baud rate for instrument lines
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default time a request waits for its terminator, in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;
