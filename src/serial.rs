//! Serial link abstraction consumed by the driver.
//!
//! The driver never owns a concrete UART; the application supplies one
//! implementation of [`SerialPort`] per attached module.  Every operation
//! is non-blocking.

use crate::Result;

/// Byte-level transport to one module.
///
/// Implementations must not block: a read with nothing pending returns 0,
/// a write with no transmit room returns [`crate::Error::Busy`].  The
/// driver checks [`SerialPort::tx_free`] before writing a frame, so a
/// conforming implementation only sees writes it can take whole.
pub trait SerialPort {
    /// Read pending bytes into `buf`, returning how many were copied.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Write bytes from `buf`, returning how many were accepted.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Free space in the transmit buffer, in bytes.
    fn tx_free(&self) -> usize;

    /// Discard anything buffered in both directions.
    fn flush(&mut self);

    /// Assert or release a break condition on the transmit line.
    fn set_break(&mut self, enabled: bool);

    /// Current state of the module's /CTS output.  Implementations
    /// without flow-control wiring should return `true`.
    fn cts(&self) -> bool;

    /// Drive the module's /RTS input.
    fn set_rts(&mut self, asserted: bool);

    /// Reconfigure the line rate.
    fn set_baud(&mut self, baud: u32) -> Result<()>;
}
