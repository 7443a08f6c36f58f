//! Raw byte exchanges
//!
//! Binary protocols take the line for one exchange: the caller writes its
//! own framing and feeds the reply through a [`ByteAccumulator`] until it
//! declares the frame complete.

use std::time::Duration;

use tracing::trace;

use super::{FramingError, ProtocolError, Transport};

/// Decides when a byte-by-byte reply is complete
pub trait ByteAccumulator: Send {
    /// Feed one byte; `Ok(Some(payload))` once the frame is complete
    fn push(&mut self, byte: u8) -> Result<Option<Vec<u8>>, FramingError>;
}

impl<F> ByteAccumulator for F
where
    F: FnMut(u8) -> Result<Option<Vec<u8>>, FramingError> + Send,
{
    fn push(&mut self, byte: u8) -> Result<Option<Vec<u8>>, FramingError> {
        self(byte)
    }
}

/// Exclusive access to the transport for one raw exchange
pub struct RawPort<'a> {
    transport: &'a dyn Transport,
    timeout: Duration,
    last_written: Vec<u8>,
    failure: Option<ProtocolError>,
}

impl<'a> RawPort<'a> {
    pub(crate) fn new(transport: &'a dyn Transport, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            last_written: Vec::new(),
            failure: None,
        }
    }

    /// Transport failure seen during the exchange, if any
    pub(crate) fn take_failure(&mut self) -> Option<ProtocolError> {
        self.failure.take()
    }

    fn observe<T>(&mut self, result: Result<T, ProtocolError>) -> Result<T, ProtocolError> {
        if let Err(err @ ProtocolError::TransportFailure(_)) = &result {
            self.failure = Some(err.clone());
        }
        result
    }

    /// Default time to wait for each byte
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Write bytes unchanged
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        trace!(data = ?bytes, "raw write");
        let written = self.transport.write_raw(bytes);
        self.observe(written)?;
        self.last_written = bytes.to_vec();
        Ok(())
    }

    /// Read one byte, failing with `Timeout` if none arrives in time
    pub fn read_byte(&mut self) -> Result<u8, ProtocolError> {
        self.read_byte_timeout(self.timeout)
    }

    /// Read one byte with an explicit timeout
    pub fn read_byte_timeout(&mut self, timeout: Duration) -> Result<u8, ProtocolError> {
        let read = self.transport.read_raw_byte(timeout);
        self.observe(read)?
            .ok_or_else(|| self.timeout_error(timeout))
    }

    /// Feed bytes into `accumulator` until it reports a complete frame.
    ///
    /// Silence before the first byte is a `Timeout`; silence in the middle
    /// of a frame is a `PrematureEnd` framing error.
    pub fn read_frame<A>(&mut self, accumulator: &mut A) -> Result<Vec<u8>, ProtocolError>
    where
        A: ByteAccumulator + ?Sized,
    {
        let mut received = 0usize;
        loop {
            let read = self.transport.read_raw_byte(self.timeout);
            match self.observe(read)? {
                Some(byte) => {
                    received += 1;
                    if let Some(payload) = accumulator.push(byte)? {
                        trace!(bytes = received, "raw frame complete");
                        return Ok(payload);
                    }
                }
                None if received == 0 => return Err(self.timeout_error(self.timeout)),
                None => return Err(FramingError::PrematureEnd { received }.into()),
            }
        }
    }

    /// Write `request`, then read a frame through `accumulator`
    pub fn exchange<A>(&mut self, request: &[u8], accumulator: &mut A) -> Result<Vec<u8>, ProtocolError>
    where
        A: ByteAccumulator + ?Sized,
    {
        self.write(request)?;
        self.read_frame(accumulator)
    }

    fn timeout_error(&self, timeout: Duration) -> ProtocolError {
        ProtocolError::Timeout {
            command: format!("{:02x?}", self.last_written),
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{Frame, FrameDecoder};
    use crate::protocol::mock::ScriptedTransport;

    #[test]
    fn test_exchange_with_frame_decoder() {
        let request = Frame::new(vec![0x01, 0x02]).unwrap().encode();
        let reply = Frame::new(vec![0x81, 0x00]).unwrap().encode();
        let mock = ScriptedTransport::new();
        mock.reply_raw(&request, &reply);

        let mut port = RawPort::new(&mock, Duration::from_millis(100));
        let payload = port
            .exchange(&request, &mut FrameDecoder::new())
            .expect("exchange");
        assert_eq!(payload, vec![0x81, 0x00]);
        assert_eq!(mock.written_raw(), vec![request]);
    }

    #[test]
    fn test_closure_accumulator() {
        let mock = ScriptedTransport::new();
        mock.push_bytes(b"OK;");

        let mut collected = Vec::new();
        let mut until_semicolon = move |b: u8| -> Result<Option<Vec<u8>>, FramingError> {
            if b == b';' {
                Ok(Some(std::mem::take(&mut collected)))
            } else {
                collected.push(b);
                Ok(None)
            }
        };

        let mut port = RawPort::new(&mock, Duration::from_millis(100));
        let payload = port.read_frame(&mut until_semicolon).expect("frame");
        assert_eq!(payload, b"OK".to_vec());
    }

    #[test]
    fn test_silence_is_timeout() {
        let mock = ScriptedTransport::new();
        let mut port = RawPort::new(&mock, Duration::from_millis(20));
        port.write(&[0xA5]).expect("write");
        let err = port.read_frame(&mut FrameDecoder::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout { timeout_ms: 20, .. }));
    }

    #[test]
    fn test_truncated_frame_is_premature_end() {
        let mock = ScriptedTransport::new();
        mock.push_bytes(&[0xA5, 0x03, 0x01]);
        let mut port = RawPort::new(&mock, Duration::from_millis(20));
        let err = port.read_frame(&mut FrameDecoder::new()).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Framing(FramingError::PrematureEnd { received: 3 })
        );
    }

    #[test]
    fn test_transport_failure_is_remembered() {
        let mock = ScriptedTransport::new();
        mock.fail_reads("line dropped");
        let mut port = RawPort::new(&mock, Duration::from_millis(20));
        assert!(port.read_byte().is_err());
        assert_eq!(
            port.take_failure(),
            Some(ProtocolError::TransportFailure("line dropped".to_string()))
        );
        assert_eq!(port.take_failure(), None);
    }
}
