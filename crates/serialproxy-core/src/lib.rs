//! # SerialProxy Core Library
//!
//! Protocol engine for laboratory measurement instruments (meter test
//! systems, error calculators, reference meters, frequency generators, ZIF
//! test sockets).
//!
//! This library provides:
//! - A connection engine that serializes command/reply exchanges on one line
//! - Line-oriented replies ended by literal or pattern terminators
//! - Out-of-band handling for lines the device pushes on its own
//! - Raw binary exchanges with start/length/checksum/end framing
//! - Serial port and serial-over-TCP transports, plus a scripted mock
//! - Single-flight sharing of expensive queries
//!
//! ## Example
//!
//! ```rust,ignore
//! use serialproxy_core::protocol::{Connection, ConnectionOptions, Request};
//!
//! let conn = Connection::open_serial("/dev/ttyUSB0", ConnectionOptions::default())?;
//!
//! // Select the mode, then read the value; both go out back to back
//! let replies = conn
//!     .execute_all(vec![
//!         Request::exact("AMT1", "AMTOK"),
//!         Request::pattern("AVR", r"^AVR(\d+\.\d+)$")?,
//!     ])
//!     .await?;
//! println!("value: {:?}", replies[1].end_match);
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod protocol;
pub mod share;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{
        Connection, ConnectionOptions, Frame, FrameDecoder, MatchGroups, ProtocolError, Request,
        Response, ScriptedTransport, Terminator, Transport,
    };
    pub use crate::share::ResponseShare;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
