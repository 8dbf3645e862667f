//! Host-side driver for Digi XBee radio modules speaking the API-mode
//! framed serial protocol.
//!
//! Supports `no_std`.
//!
//! The driver multiplexes one serial link into a request/response and
//! event oriented API:
//!
//!  - [`frame`]: byte-level framing (start byte, length, checksum) and the
//!    wire layout of the frames the core understands
//!  - [`device`]: the [`Device`] facade owning the link, the receive
//!    parser, the frame dispatcher and the cooperative [`Device::tick`]
//!  - [`atcmd`]: AT command requests, the outstanding-request table and
//!    response correlation
//!  - [`cmdlist`]: declarative programs of AT commands executed in
//!    sequence against one module
//!  - [`query`]: the built-in command list that reads a module's identity
//!    (hardware/firmware version, addresses, join state) after init
//!
//! The application owns the event loop: nothing here blocks, and all
//! progress is made from [`Device::tick`].

#![no_std]

pub mod atcmd;
pub mod cmdlist;
pub mod commands;
pub mod device;
pub mod frame;
pub mod query;
pub mod serial;

pub use atcmd::{AtCmd, AtStatus, CmdDecision, CmdHandle, CmdResponse, ResponseFlags};
pub use cmdlist::{ListAction, ListEntry, ListHandle, ListStatus};
pub use device::{Counters, Device, DeviceFlags, Mode};
pub use frame::{FrameType, ModemStatus};
pub use serial::SerialPort;

/// Compile-time tuning knobs.
///
/// These bound every buffer and table in the driver; none of them are
/// consulted at run time by the application.
pub mod limits {
    /// Largest RF payload any supported module can produce.  ZigBee and
    /// Smart Energy firmware stops at 128 bytes, DigiMesh at 256.
    pub const MAX_RF_PAYLOAD: usize = 256;

    /// Header overhead of the largest received frame (0x91, receive
    /// explicit), excluding the payload itself.
    pub const FRAME_OVERHEAD: usize = 18;

    /// Largest frame payload (including the frame type byte, excluding
    /// the checksum) the receive parser will accept.
    pub const MAX_FRAME_LEN: usize = MAX_RF_PAYLOAD + FRAME_OVERHEAD;

    /// Frames dispatched per call to `tick`, so one busy module cannot
    /// starve the rest of the application's event loop.
    pub const MAX_DISPATCH_PER_TICK: usize = 5;

    /// Capacity of the frame-handler registration table.
    pub const MAX_FRAME_HANDLERS: usize = 8;

    /// Outstanding AT command requests per device.  Two is sufficient for
    /// typical workloads (one application request plus the self-query).
    pub const REQUEST_TABLE_SIZE: usize = 2;

    /// Largest AT command parameter.  ATNI takes a 20-byte string, ATZT
    /// is 48 bytes.
    pub const MAX_PARAM_LENGTH: usize = 48;

    /// Seconds to wait for a response from the local module.
    pub const LOCAL_TIMEOUT_SECS: u32 = 2;

    /// Seconds to wait for a response from a remote module.  High enough
    /// to cover a sleeping end device.
    pub const REMOTE_TIMEOUT_SECS: u32 = 180;

    /// Extension granted when a callback keeps its request alive.
    pub const REUSE_EXTENSION_SECS: u32 = 5;

    /// Seconds allowed to finish building a request and send it.
    pub const BUILD_TIMEOUT_SECS: u32 = 2;

    /// Command-list programs that may run concurrently on one device.
    pub const CMD_LIST_CONTEXTS: usize = 2;

    /// Largest base object a command list can read from and write into.
    pub const CMD_LIST_BASE_MAX: usize = 64;
}

/// Errors reported by the driver.
///
/// Transient conditions ([`Error::Busy`]) are cleared by retrying on a
/// later tick; the structural errors indicate a caller bug.  Wire
/// corruption is never an error: the receive parser resynchronizes and
/// counts the event in [`Counters`].
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A stale handle, out-of-range index or otherwise bad argument.
    InvalidArgument,
    /// The request table (or a registration table) is full.
    NoSpace,
    /// The transport cannot accept a frame right now, or `tick` was
    /// re-entered on the same device.
    Busy,
    /// A parameter or outgoing frame exceeds the configured ceiling.
    MessageTooBig,
    /// No matching registration or context.
    NotFound,
    /// The facility is not configured on this device.
    NotImplemented,
}

pub type Result<T> = core::result::Result<T, Error>;

/// 64-bit IEEE address in big-endian wire order.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IeeeAddr(pub [u8; 8]);

impl IeeeAddr {
    /// All-node broadcast address.
    pub const BROADCAST: IeeeAddr = IeeeAddr([0, 0, 0, 0, 0, 0, 0xFF, 0xFF]);

    /// Reserved address of the network coordinator.
    pub const COORDINATOR: IeeeAddr = IeeeAddr([0; 8]);
}

/// 16-bit network address meaning "not known / not applicable".
pub const NET_ADDR_UNDEFINED: u16 = 0xFFFE;

/// Target of a remote AT command, and source of a remote response.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub ieee: IeeeAddr,
    /// 16-bit network address, or [`NET_ADDR_UNDEFINED`].
    pub network: u16,
}
