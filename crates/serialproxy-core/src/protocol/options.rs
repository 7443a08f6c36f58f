//! Connection options
//!
//! Line settings and timeouts for a single instrument connection. Every
//! field has a default, so a project file only needs to name what differs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};

/// Parity checking mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Number of data bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataBits {
    /// Five bits
    #[serde(rename = "5")]
    Five,
    /// Six bits
    #[serde(rename = "6")]
    Six,
    /// Seven bits
    #[serde(rename = "7")]
    Seven,
    /// Eight bits
    #[default]
    #[serde(rename = "8")]
    Eight,
}

/// Number of stop bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StopBits {
    /// One stop bit
    #[default]
    #[serde(rename = "1")]
    One,
    /// Two stop bits
    #[serde(rename = "2")]
    Two,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    /// Baud rate (serial transports only)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Parity
    #[serde(default)]
    pub parity: Parity,

    /// Data bits
    #[serde(default)]
    pub data_bits: DataBits,

    /// Stop bits
    #[serde(default)]
    pub stop_bits: StopBits,

    /// Marker that ends every line, in both directions
    #[serde(default = "default_newline")]
    pub newline: String,

    /// Default time a request may wait for its terminator
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Time a single write may block
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// How long the reader blocks on the transport before checking for
    /// shutdown or a pending raw exchange
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_newline() -> String {
    "\r".to_string()
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_write_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_poll_interval_ms() -> u64 {
    50
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            parity: Parity::default(),
            data_bits: DataBits::default(),
            stop_bits: StopBits::default(),
            newline: default_newline(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ConnectionOptions {
    /// Parse options from a JSON fragment, filling in defaults
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| ProtocolError::Configuration(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.newline.is_empty() {
            return Err(ProtocolError::Configuration(
                "newline marker must not be empty".to_string(),
            ));
        }
        if self.baud_rate == 0 {
            return Err(ProtocolError::Configuration(
                "baud rate must be positive".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ProtocolError::Configuration(
                "poll interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the default request timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the newline marker
    pub fn with_newline(mut self, newline: impl Into<String>) -> Self {
        self.newline = newline.into();
        self
    }

    /// Set the reader poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = (interval.as_millis() as u64).max(1);
        self
    }

    /// Default request timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Write timeout, also used to connect TCP bridges
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Reader poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
