//! Wire format of API-mode frames, providing encoding and decoding.
//!
//! Every frame on the link is:
//!
//! ```norust
//!  1    | 2         | length  | 1
//! 0x7E  | length BE | payload | checksum
//! ```
//!
//! The length covers the payload only (the frame type byte through the
//! last data byte); the checksum is chosen so that the payload bytes plus
//! the checksum sum to 0xFF in the low byte.  The first payload byte is
//! the frame type.

use crate::atcmd::AtCmd;
use crate::{Address, IeeeAddr};
use modular_bitfield::prelude::*;

/// Start-of-frame delimiter.
pub const START_BYTE: u8 = 0x7E;

/// Running checksum over `bytes`, continuing from `initial`.
///
/// Start a fresh frame with `initial == 0xFF`; the result after the last
/// payload byte is the value transmitted on the wire.
pub fn checksum(bytes: &[u8], initial: u8) -> u8 {
    bytes
        .iter()
        .fold(initial, |acc, &b| acc.wrapping_sub(b))
}

/// Verify a received payload followed by its checksum byte.
pub fn verify(payload_and_checksum: &[u8]) -> bool {
    let sum = payload_and_checksum
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    sum == 0xFF
}

/// Frame types sent to and received from the module.
///
/// Values with the upper bit set are frames the module originates; the
/// rest are frames the host sends.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// AT command to the attached module, applied immediately.
    LocalAtCmd = 0x08,
    /// AT command to the attached module, queued until ATAC.
    LocalAtCmdQueued = 0x09,
    /// Data to the default endpoint of a remote node.
    Transmit = 0x10,
    /// Data to a specific endpoint/cluster of a remote node.
    TransmitExplicit = 0x11,
    /// AT command to a remote node.
    RemoteAtCmd = 0x17,
    /// Response to [`FrameType::LocalAtCmd`] / [`FrameType::LocalAtCmdQueued`].
    LocalAtResponse = 0x88,
    /// Unsolicited link/network state notification.
    ModemStatus = 0x8A,
    /// Delivery report for a transmit request.
    TransmitStatus = 0x8B,
    /// Data received with ATAO == 0.
    Receive = 0x90,
    /// Data received with ATAO != 0.
    ReceiveExplicit = 0x91,
    /// Node identification indicator.
    NodeId = 0x95,
    /// Response to [`FrameType::RemoteAtCmd`].
    RemoteAtResponse = 0x97,
}

impl FrameType {
    pub const fn byte(self) -> u8 {
        self as u8
    }
}

/// AT response status byte.
///
/// The low nibble is the status code; DigiMesh firmware uses the upper
/// nibble for flags (bit 6 marks the RSSI field of an ATND response as
/// invalid).
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct RespStatusByte {
    pub status: B4,
    pub rfu: B2,
    pub rssi_invalid: bool,
    pub rfu2: B1,
}

impl RespStatusByte {
    pub fn from_byte(byte: u8) -> Self {
        Self::from_bytes([byte])
    }
}

/// Options byte of a remote AT command: queue the change until ATAC.
pub const REMOTE_AT_OPT_QUEUE: u8 = 0x00;
/// Options byte of a remote AT command: apply immediately.
pub const REMOTE_AT_OPT_IMMEDIATE: u8 = 0x02;

/// Header of an AT command for the serially-attached module.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct LocalAtRequest {
    /// Queue the change until ATAC instead of applying it immediately.
    pub queued: bool,
    /// 1 to 255, or 0 to suppress the response frame.
    pub frame_id: u8,
    pub command: AtCmd,
}

impl LocalAtRequest {
    pub fn header(&self) -> [u8; 4] {
        let ty = if self.queued {
            FrameType::LocalAtCmdQueued
        } else {
            FrameType::LocalAtCmd
        };
        [ty.byte(), self.frame_id, self.command.0[0], self.command.0[1]]
    }
}

/// Header of an AT command for a remote node on the network.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct RemoteAtRequest {
    /// 1 to 255, or 0 to suppress the response frame.
    pub frame_id: u8,
    pub target: Address,
    /// Queue the change on the remote until ATAC.
    pub queued: bool,
    pub command: AtCmd,
}

impl RemoteAtRequest {
    pub fn header(&self) -> [u8; 15] {
        let mut h = [0u8; 15];
        h[0] = FrameType::RemoteAtCmd.byte();
        h[1] = self.frame_id;
        h[2..10].copy_from_slice(&self.target.ieee.0);
        h[10..12].copy_from_slice(&self.target.network.to_be_bytes());
        h[12] = if self.queued {
            REMOTE_AT_OPT_QUEUE
        } else {
            REMOTE_AT_OPT_IMMEDIATE
        };
        h[13] = self.command.0[0];
        h[14] = self.command.0[1];
        h
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameParseError {
    WrongType { have: u8 },
    TooShort { have: usize, need: usize },
}

/// Borrowed view of a local AT response (0x88).
///
/// ```norust
///  1    | 1        | 2       | 1      | 0..N
/// 0x88  | frame id | command | status | value
/// ```
#[derive(Clone, Copy)]
pub struct LocalAtResponse<'a> {
    bytes: &'a [u8],
}

impl<'a> LocalAtResponse<'a> {
    pub const MIN_LEN: usize = 5;

    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, FrameParseError> {
        let have = bytes.len();
        if have < Self::MIN_LEN {
            return Err(FrameParseError::TooShort {
                have,
                need: Self::MIN_LEN,
            });
        }
        if bytes[0] != FrameType::LocalAtResponse.byte() {
            return Err(FrameParseError::WrongType { have: bytes[0] });
        }
        Ok(Self { bytes })
    }

    pub fn frame_id(&self) -> u8 {
        self.bytes[1]
    }

    pub fn command(&self) -> AtCmd {
        AtCmd([self.bytes[2], self.bytes[3]])
    }

    pub fn status_byte(&self) -> u8 {
        self.bytes[4]
    }

    pub fn value(&self) -> &'a [u8] {
        &self.bytes[Self::MIN_LEN..]
    }
}

impl core::fmt::Debug for LocalAtResponse<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LocalAtResponse")
            .field("frame_id", &self.frame_id())
            .field("command", &self.command())
            .field("status", &self.status_byte())
            .field("value", &self.value())
            .finish()
    }
}

/// Borrowed view of a remote AT response (0x97).
///
/// ```norust
///  1    | 1        | 8       | 2      | 2       | 1      | 0..N
/// 0x97  | frame id | ieee BE | net BE | command | status | value
/// ```
#[derive(Clone, Copy)]
pub struct RemoteAtResponse<'a> {
    bytes: &'a [u8],
}

impl<'a> RemoteAtResponse<'a> {
    pub const MIN_LEN: usize = 15;

    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, FrameParseError> {
        let have = bytes.len();
        if have < Self::MIN_LEN {
            return Err(FrameParseError::TooShort {
                have,
                need: Self::MIN_LEN,
            });
        }
        if bytes[0] != FrameType::RemoteAtResponse.byte() {
            return Err(FrameParseError::WrongType { have: bytes[0] });
        }
        Ok(Self { bytes })
    }

    pub fn frame_id(&self) -> u8 {
        self.bytes[1]
    }

    pub fn ieee(&self) -> IeeeAddr {
        let mut a = [0u8; 8];
        a.copy_from_slice(&self.bytes[2..10]);
        IeeeAddr(a)
    }

    pub fn network(&self) -> u16 {
        u16::from_be_bytes([self.bytes[10], self.bytes[11]])
    }

    pub fn source(&self) -> Address {
        Address {
            ieee: self.ieee(),
            network: self.network(),
        }
    }

    pub fn command(&self) -> AtCmd {
        AtCmd([self.bytes[12], self.bytes[13]])
    }

    pub fn status_byte(&self) -> u8 {
        self.bytes[14]
    }

    pub fn value(&self) -> &'a [u8] {
        &self.bytes[Self::MIN_LEN..]
    }
}

impl core::fmt::Debug for RemoteAtResponse<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RemoteAtResponse")
            .field("frame_id", &self.frame_id())
            .field("source", &self.source())
            .field("command", &self.command())
            .field("status", &self.status_byte())
            .field("value", &self.value())
            .finish()
    }
}

/// Unsolicited module state notification, carried in a 0x8A frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemStatus {
    /// Hardware reset.
    HardwareReset,
    /// Watchdog timer reset.
    WatchdogReset,
    /// Joined a network (routers and end devices).
    Joined,
    /// Left the network.
    Disassociated,
    /// Coordinator started.
    CoordinatorStarted,
    /// Network security key was updated.
    NetworkKeyUpdated,
    /// Network woke up (DigiMesh).
    WokeUp,
    /// Network went to sleep (DigiMesh).
    Sleeping,
    /// Supply voltage limit exceeded.
    Overvoltage,
    /// Key establishment complete (Smart Energy).
    KeyEstablished,
    /// Configuration changed while a join was in progress.
    ConfigChangeInJoin,
    /// Network stack error.
    StackError,
    Other(u8),
}

impl From<u8> for ModemStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => ModemStatus::HardwareReset,
            0x01 => ModemStatus::WatchdogReset,
            0x02 => ModemStatus::Joined,
            0x03 => ModemStatus::Disassociated,
            0x06 => ModemStatus::CoordinatorStarted,
            0x07 => ModemStatus::NetworkKeyUpdated,
            0x0B => ModemStatus::WokeUp,
            0x0C => ModemStatus::Sleeping,
            0x0D => ModemStatus::Overvoltage,
            0x10 => ModemStatus::KeyEstablished,
            0x11 => ModemStatus::ConfigChangeInJoin,
            0x80 => ModemStatus::StackError,
            v => ModemStatus::Other(v),
        }
    }
}

impl From<ModemStatus> for u8 {
    fn from(v: ModemStatus) -> Self {
        match v {
            ModemStatus::HardwareReset => 0x00,
            ModemStatus::WatchdogReset => 0x01,
            ModemStatus::Joined => 0x02,
            ModemStatus::Disassociated => 0x03,
            ModemStatus::CoordinatorStarted => 0x06,
            ModemStatus::NetworkKeyUpdated => 0x07,
            ModemStatus::WokeUp => 0x0B,
            ModemStatus::Sleeping => 0x0C,
            ModemStatus::Overvoltage => 0x0D,
            ModemStatus::KeyEstablished => 0x10,
            ModemStatus::ConfigChangeInJoin => 0x11,
            ModemStatus::StackError => 0x80,
            ModemStatus::Other(v) => v,
        }
    }
}

impl ModemStatus {
    /// Decode a 0x8A frame payload.
    pub fn from_frame(frame: &[u8]) -> Option<ModemStatus> {
        if frame.len() < 2 || frame[0] != FrameType::ModemStatus.byte() {
            return None;
        }
        Some(ModemStatus::from(frame[1]))
    }
}
