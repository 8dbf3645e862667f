//! AT command requests and responses.
//!
//! Requests live in a small per-device table while a response (or a
//! timeout) is outstanding.  A caller builds a request up through an
//! opaque [`CmdHandle`], sends it, and receives the module's answer in a
//! callback:
//!
//! ```norust
//! let h = device.cmd_create(commands::VR)?;
//! device.cmd_set_callback(h, Some(on_vr), 0)?;
//! device.cmd_send(h)?;
//! // on_vr runs from device.tick() when the 0x88 response arrives
//! ```
//!
//! Handles carry a generation byte, so a handle kept across its request's
//! release (or timeout) reliably fails instead of touching a recycled
//! slot.

use embedded_time::{Clock, Instant};

use crate::device::{Device, DeviceFlags};
use crate::frame::{
    FrameType, LocalAtRequest, LocalAtResponse, ModemStatus, RemoteAtRequest, RemoteAtResponse,
    RespStatusByte,
};
use crate::limits::{
    BUILD_TIMEOUT_SECS, LOCAL_TIMEOUT_SECS, MAX_PARAM_LENGTH, REMOTE_TIMEOUT_SECS,
    REQUEST_TABLE_SIZE, REUSE_EXTENSION_SECS,
};
use crate::serial::SerialPort;
use crate::{Address, Error, Result, NET_ADDR_UNDEFINED};

use bitflags::bitflags;

/// Two-letter AT command naming a module register or action.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AtCmd(pub [u8; 2]);

impl AtCmd {
    pub const fn new(cmd: &[u8; 2]) -> Self {
        Self(*cmd)
    }

    /// The all-zero command, used as a list terminator.
    pub const NONE: AtCmd = AtCmd([0, 0]);
}

impl core::fmt::Debug for AtCmd {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "AT{}{}", self.0[0] as char, self.0[1] as char)
    }
}

/// Status code from the low nibble of an AT response status byte.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtStatus {
    Success,
    Error,
    BadCommand,
    BadParameter,
    TxFailure,
    Other(u8),
}

impl AtStatus {
    pub fn from_nibble(value: u8) -> Self {
        match value & 0x0F {
            0 => AtStatus::Success,
            1 => AtStatus::Error,
            2 => AtStatus::BadCommand,
            3 => AtStatus::BadParameter,
            4 => AtStatus::TxFailure,
            v => AtStatus::Other(v),
        }
    }
}

bitflags! {
    /// Flag bits accompanying a response, beyond its status code.
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResponseFlags: u16 {
        /// No response arrived before the request's deadline; the status
        /// code carries no information.
        const TIMEOUT = 0x8000;
        /// The RSSI field of a DigiMesh ATND response is not valid.
        const RSSI_INVALID = 0x0040;
    }
}

bitflags! {
    /// User-settable request flags.
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CmdFlags: u16 {
        /// Queue the change until ATAC (or another request without this
        /// flag) instead of applying it immediately.
        const QUEUE_CHANGE = 0x0002;
        /// Keep the slot after sending a request that wants no response.
        const REUSE_HANDLE = 0x0004;
    }
}

/// What a callback wants done with its request slot.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdDecision {
    /// Release the slot.
    Done,
    /// Keep the slot alive: more responses are expected, or the handle
    /// will be resubmitted.  Extends the deadline by a few seconds.
    Reuse,
}

/// Token identifying an entry in the request table.
///
/// A handle stays valid until its request is released (explicitly, after
/// a terminal callback, or by timeout); afterwards every operation on it
/// fails with [`Error::InvalidArgument`].
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdHandle(u16);

impl CmdHandle {
    pub(crate) fn new(index: usize, sequence: u8) -> Self {
        Self(((index as u16) << 8) | sequence as u16)
    }

    pub(crate) fn index(self) -> usize {
        (self.0 >> 8) as usize
    }

    pub(crate) fn sequence(self) -> u8 {
        self.0 as u8
    }
}

/// Receiver for an AT command response.
///
/// Runs from [`Device::tick`]; it may operate freely on the device,
/// including resubmitting the handle it was called for.
pub type CmdCallbackFn<S, C> = fn(&mut Device<S, C>, &CmdResponse<'_>) -> CmdDecision;

pub(crate) enum Callback<S: SerialPort, C: Clock<T = u32>> {
    None,
    Fn(CmdCallbackFn<S, C>, u32),
    /// Internal receiver driving a command list slot.
    List(usize),
}

impl<S: SerialPort, C: Clock<T = u32>> Clone for Callback<S, C> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<S: SerialPort, C: Clock<T = u32>> Copy for Callback<S, C> {}

/// AT command response as passed to callbacks, for both local and remote
/// commands and for timeouts.
#[derive(Debug)]
pub struct CmdResponse<'a> {
    /// Handle of the request that produced this response, still valid
    /// while the callback runs.
    pub handle: CmdHandle,
    /// Context value registered with the callback.
    pub context: u32,
    /// Command from the original request.
    pub command: AtCmd,
    /// Decoded status code.  Meaningless when the TIMEOUT flag is set.
    pub status: AtStatus,
    pub flags: ResponseFlags,
    /// Raw value bytes from the response.
    pub value: &'a [u8],
    /// Responder address; `None` for local responses.
    pub source: Option<Address>,
}

impl CmdResponse<'_> {
    /// The value interpreted as a big-endian integer, when it is 1, 2 or
    /// 4 bytes long.  Empty values read as 0, any other length as the
    /// all-ones sentinel.
    pub fn value_u32(&self) -> u32 {
        match *self.value {
            [] => 0,
            [a] => a as u32,
            [a, b] => u16::from_be_bytes([a, b]) as u32,
            [a, b, c, d] => u32::from_be_bytes([a, b, c, d]),
            _ => u32::MAX,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.flags.contains(ResponseFlags::TIMEOUT)
    }
}

/// One slot of the outstanding-request table.
pub(crate) struct CmdRequest<S: SerialPort, C: Clock<T = u32>> {
    /// Rolling generation byte; makes stale handles miss.
    pub(crate) sequence: u8,
    pub(crate) in_use: bool,
    pub(crate) deadline: Option<Instant<C>>,
    pub(crate) flags: CmdFlags,
    pub(crate) param: [u8; MAX_PARAM_LENGTH],
    pub(crate) param_length: u8,
    pub(crate) command: AtCmd,
    pub(crate) callback: Callback<S, C>,
    /// Frame id of the last send, 0 before the first.
    pub(crate) frame_id: u8,
    /// Remote target; `None` for the attached module.
    pub(crate) target: Option<Address>,
}

impl<S: SerialPort, C: Clock<T = u32>> CmdRequest<S, C> {
    pub(crate) fn idle() -> Self {
        Self {
            sequence: 0,
            in_use: false,
            deadline: None,
            flags: CmdFlags::empty(),
            param: [0; MAX_PARAM_LENGTH],
            param_length: 0,
            command: AtCmd::NONE,
            callback: Callback::None,
            frame_id: 0,
            target: None,
        }
    }

    /// Reset everything except the generation byte.
    fn clear_keeping_sequence(&mut self) {
        let sequence = self.sequence;
        *self = Self::idle();
        self.sequence = sequence;
    }
}

fn encode_param(buf: &mut [u8; 4], value: u32) -> usize {
    if value & 0xFFFF_0000 != 0 {
        buf.copy_from_slice(&value.to_be_bytes());
        4
    } else if value & 0xFF00 != 0 {
        buf[..2].copy_from_slice(&(value as u16).to_be_bytes());
        2
    } else {
        buf[0] = value as u8;
        1
    }
}

impl<S: SerialPort, C: Clock<T = u32>> Device<S, C> {
    /// Initialize the command layer: register the response and modem
    /// status handlers and start the identity query.  Called implicitly
    /// by [`Device::cmd_create`].
    pub fn cmd_init_device(&mut self) -> Result<()> {
        if self.flags.contains(DeviceFlags::CMD_INIT) {
            return Ok(());
        }
        self.flags.insert(DeviceFlags::CMD_INIT);
        self.register_handler(
            FrameType::LocalAtResponse.byte(),
            0,
            handle_at_response::<S, C>,
            0,
        )?;
        self.register_handler(
            FrameType::RemoteAtResponse.byte(),
            0,
            handle_at_response::<S, C>,
            0,
        )?;
        self.register_handler(
            FrameType::ModemStatus.byte(),
            0,
            handle_modem_status::<S, C>,
            0,
        )?;
        if !self.flags.contains(DeviceFlags::QUERY_BEGIN) {
            self.query_device(false)?;
        }
        Ok(())
    }

    /// Allocate a request for `command` against this device.
    ///
    /// The slot must be sent (or released) within a couple of seconds or
    /// the timeout sweep reclaims it.
    pub fn cmd_create(&mut self, command: AtCmd) -> Result<CmdHandle> {
        self.cmd_init_device()?;
        self.cmd_create_raw(command)
    }

    /// Allocation without the lazy command-layer init; the identity
    /// query builds its own requests through this.
    pub(crate) fn cmd_create_raw(&mut self, command: AtCmd) -> Result<CmdHandle> {
        let mut index = self.requests.iter().position(|r| !r.in_use);
        if index.is_none() {
            // an expired request may be holding the slot we need
            self.cmd_tick(true)?;
            index = self.requests.iter().position(|r| !r.in_use);
        }
        let index = index.ok_or(Error::NoSpace)?;

        let deadline = self.deadline_in(BUILD_TIMEOUT_SECS)?;
        let slot = &mut self.requests[index];
        slot.clear_keeping_sequence();
        slot.in_use = true;
        slot.deadline = Some(deadline);
        slot.command = command;
        Ok(CmdHandle::new(index, slot.sequence))
    }

    fn request_at(&mut self, handle: CmdHandle) -> Result<&mut CmdRequest<S, C>> {
        let index = handle.index();
        if index >= REQUEST_TABLE_SIZE {
            return Err(Error::InvalidArgument);
        }
        let slot = &mut self.requests[index];
        if !slot.in_use || slot.sequence != handle.sequence() {
            return Err(Error::InvalidArgument);
        }
        Ok(slot)
    }

    pub(crate) fn release_request_at(&mut self, index: usize) {
        let slot = &mut self.requests[index];
        slot.in_use = false;
        slot.deadline = None;
        slot.sequence = slot.sequence.wrapping_add(1);
    }

    /// Release a request, cancelling any outstanding response delivery.
    /// A response that arrives later is a harmless no-op.
    pub fn cmd_release(&mut self, handle: CmdHandle) -> Result<()> {
        self.request_at(handle)?;
        self.release_request_at(handle.index());
        Ok(())
    }

    /// Replace the two-letter command on an existing request.
    pub fn cmd_set_command(&mut self, handle: CmdHandle, command: AtCmd) -> Result<()> {
        self.request_at(handle)?.command = command;
        Ok(())
    }

    /// Install (or clear) the response receiver and its context value.
    pub fn cmd_set_callback(
        &mut self,
        handle: CmdHandle,
        callback: Option<CmdCallbackFn<S, C>>,
        context: u32,
    ) -> Result<()> {
        self.request_at(handle)?.callback = match callback {
            Some(f) => Callback::Fn(f, context),
            None => Callback::None,
        };
        Ok(())
    }

    pub(crate) fn cmd_set_list_callback(&mut self, handle: CmdHandle, slot: usize) -> Result<()> {
        self.request_at(handle)?.callback = Callback::List(slot);
        Ok(())
    }

    /// Address the request to a remote node, or back to the attached
    /// module with `None`.
    pub fn cmd_set_target(&mut self, handle: CmdHandle, target: Option<&Address>) -> Result<()> {
        self.request_at(handle)?.target = target.copied();
        Ok(())
    }

    /// Set the parameter to the shortest big-endian encoding (1, 2 or 4
    /// bytes) of `value`.
    pub fn cmd_set_param(&mut self, handle: CmdHandle, value: u32) -> Result<()> {
        let mut buf = [0u8; 4];
        let n = encode_param(&mut buf, value);
        let slot = self.request_at(handle)?;
        slot.param[..n].copy_from_slice(&buf[..n]);
        slot.param_length = n as u8;
        Ok(())
    }

    /// Set the parameter to a raw byte sequence (MSB first).
    pub fn cmd_set_param_bytes(&mut self, handle: CmdHandle, data: &[u8]) -> Result<()> {
        if data.len() > MAX_PARAM_LENGTH {
            return Err(Error::MessageTooBig);
        }
        let slot = self.request_at(handle)?;
        slot.param[..data.len()].copy_from_slice(data);
        slot.param_length = data.len() as u8;
        Ok(())
    }

    /// Set a string parameter (e.g. for ATNI); no terminator is sent.
    pub fn cmd_set_param_str(&mut self, handle: CmdHandle, value: &str) -> Result<()> {
        self.cmd_set_param_bytes(handle, value.as_bytes())
    }

    pub fn cmd_set_flags(&mut self, handle: CmdHandle, flags: CmdFlags) -> Result<()> {
        self.request_at(handle)?.flags.insert(flags);
        Ok(())
    }

    pub fn cmd_clear_flags(&mut self, handle: CmdHandle, flags: CmdFlags) -> Result<()> {
        self.request_at(handle)?.flags.remove(flags);
        Ok(())
    }

    /// Send the request to its target.
    ///
    /// A request with no callback is sent with frame id 0 (the module
    /// suppresses the response) and, unless
    /// [`CmdFlags::REUSE_HANDLE`] is set, released immediately.  On
    /// [`Error::Busy`] nothing is consumed: the slot keeps its built
    /// state and no frame id is burned, so the same handle can be sent
    /// again on a later tick.
    pub fn cmd_send(&mut self, handle: CmdHandle) -> Result<()> {
        let index = handle.index();
        let slot = self.request_at(handle)?;
        let has_callback = !matches!(slot.callback, Callback::None);
        let queued = slot.flags.contains(CmdFlags::QUEUE_CHANGE);
        let reuse = slot.flags.contains(CmdFlags::REUSE_HANDLE);
        let command = slot.command;
        let target = slot.target;
        let param_length = slot.param_length as usize;
        let mut param = [0u8; MAX_PARAM_LENGTH];
        param[..param_length].copy_from_slice(&slot.param[..param_length]);

        let frame_id = if has_callback {
            self.frame_id_after_current()
        } else {
            0
        };

        match target {
            Some(address) => {
                let header = RemoteAtRequest {
                    frame_id,
                    target: address,
                    queued,
                    command,
                }
                .header();
                self.frame_write(&header, &param[..param_length])?;
            }
            None => {
                let header = LocalAtRequest {
                    queued,
                    frame_id,
                    command,
                }
                .header();
                self.frame_write(&header, &param[..param_length])?;
            }
        }

        if frame_id != 0 {
            self.commit_frame_id(frame_id);
            let secs = if target.is_some() {
                REMOTE_TIMEOUT_SECS
            } else {
                LOCAL_TIMEOUT_SECS
            };
            let deadline = self.deadline_in(secs)?;
            let slot = &mut self.requests[index];
            slot.frame_id = frame_id;
            slot.deadline = Some(deadline);
        } else if !reuse {
            self.release_request_at(index);
        } else {
            self.requests[index].frame_id = 0;
        }
        Ok(())
    }

    /// Fire-and-forget: send `command` with an integer parameter and
    /// frame id 0.  No table slot is used and no response will come.
    pub fn cmd_simple(&mut self, command: AtCmd, value: u32) -> Result<()> {
        let mut buf = [0u8; 4];
        let n = encode_param(&mut buf, value);
        let header = LocalAtRequest {
            queued: false,
            frame_id: 0,
            command,
        }
        .header();
        self.frame_write(&header, &buf[..n])
    }

    /// Send `command` with a raw parameter and a fresh frame id, without
    /// using a table slot.  Returns the frame id so the caller can match
    /// the response (e.g. with its own 0x88 handler for ATND).
    pub fn cmd_execute(&mut self, command: AtCmd, data: &[u8]) -> Result<u8> {
        let frame_id = self.frame_id_after_current();
        let header = LocalAtRequest {
            queued: false,
            frame_id,
            command,
        }
        .header();
        self.frame_write(&header, data)?;
        self.commit_frame_id(frame_id);
        Ok(frame_id)
    }

    /// Expire overdue requests, delivering a timeout response to each
    /// one's callback.  Gated to one pass per wall-clock second unless
    /// `force`.  Returns the number of requests that expired.
    pub(crate) fn cmd_tick(&mut self, force: bool) -> Result<usize> {
        if self.in_sweep {
            return Ok(0);
        }
        let now = self.now()?;
        if !force {
            if let Some(last) = self.last_sweep {
                if Self::whole_seconds(&last, &now) == 0 {
                    return Ok(0);
                }
            }
            self.last_sweep = Some(now);
        }

        self.in_sweep = true;
        let mut expired = 0;
        for index in 0..REQUEST_TABLE_SIZE {
            let slot = &self.requests[index];
            if !slot.in_use {
                continue;
            }
            let Some(deadline) = slot.deadline else {
                continue;
            };
            if !Self::expired(&now, &deadline) {
                continue;
            }
            expired += 1;

            let callback = slot.callback;
            let context = match callback {
                Callback::Fn(_, ctx) => ctx,
                _ => 0,
            };
            let response = CmdResponse {
                handle: CmdHandle::new(index, slot.sequence),
                context,
                command: slot.command,
                status: AtStatus::Success,
                flags: ResponseFlags::TIMEOUT,
                value: &[],
                source: None,
            };

            if self.invoke_callback(callback, &response) == CmdDecision::Reuse {
                if let Ok(deadline) = self.deadline_in(REUSE_EXTENSION_SECS) {
                    self.requests[index].deadline = Some(deadline);
                }
            } else {
                self.release_request_at(index);
                if self.flags.contains(DeviceFlags::QUERY_REFRESH) {
                    // the slot we just freed may be the one the pending
                    // refresh was waiting for
                    let _ = self.query_device(true);
                }
            }
        }
        self.in_sweep = false;
        Ok(expired)
    }

    pub(crate) fn invoke_callback(
        &mut self,
        callback: Callback<S, C>,
        response: &CmdResponse<'_>,
    ) -> CmdDecision {
        match callback {
            Callback::None => CmdDecision::Done,
            Callback::Fn(f, _) => f(self, response),
            Callback::List(slot) => self.list_advance(slot, response),
        }
    }
}

/// Frame handler matching 0x88 and 0x97 responses back to the request
/// table.  Registered by [`Device::cmd_init_device`].
fn handle_at_response<S: SerialPort, C: Clock<T = u32>>(
    device: &mut Device<S, C>,
    frame: &[u8],
    _context: u32,
) -> i32 {
    let local_type = FrameType::LocalAtResponse.byte();
    let remote_type = FrameType::RemoteAtResponse.byte();

    let (is_local, frame_id, command, status_byte, value, source) = if frame[0] == local_type {
        match LocalAtResponse::from_bytes(frame) {
            Ok(r) => (true, r.frame_id(), r.command(), r.status_byte(), r.value(), None),
            Err(_) => return -1,
        }
    } else if frame[0] == remote_type {
        match RemoteAtResponse::from_bytes(frame) {
            Ok(r) => (
                false,
                r.frame_id(),
                r.command(),
                r.status_byte(),
                r.value(),
                Some(r.source()),
            ),
            Err(_) => return -1,
        }
    } else {
        return -1;
    };

    // match on frame id, command and local-vs-remote
    let matched = device.requests.iter().enumerate().find(|(_, r)| {
        r.in_use && r.frame_id == frame_id && r.command == command && (r.target.is_none() == is_local)
    });
    let Some((index, slot)) = matched else {
        // response for a released or foreign request
        return 0;
    };

    let callback = slot.callback;
    let context = match callback {
        Callback::Fn(_, ctx) => ctx,
        _ => 0,
    };
    let handle = CmdHandle::new(index, slot.sequence);

    let status = RespStatusByte::from_byte(status_byte);
    let mut flags = ResponseFlags::empty();
    if status.rssi_invalid() {
        flags.insert(ResponseFlags::RSSI_INVALID);
    }
    let response = CmdResponse {
        handle,
        context,
        command,
        status: AtStatus::from_nibble(status.status()),
        flags,
        value,
        source,
    };

    if device.invoke_callback(callback, &response) == CmdDecision::Reuse {
        if let Ok(deadline) = device.deadline_in(REUSE_EXTENSION_SECS) {
            device.requests[index].deadline = Some(deadline);
        }
        return 0;
    }
    device.release_request_at(index);
    0
}

/// Frame handler for 0x8A modem status frames: tracks the join state and
/// refreshes the identity query on network changes.  Registered by
/// [`Device::cmd_init_device`].
fn handle_modem_status<S: SerialPort, C: Clock<T = u32>>(
    device: &mut Device<S, C>,
    frame: &[u8],
    _context: u32,
) -> i32 {
    let Some(status) = ModemStatus::from_frame(frame) else {
        return -1;
    };
    match status {
        ModemStatus::Joined | ModemStatus::CoordinatorStarted | ModemStatus::KeyEstablished => {
            device.flags.insert(DeviceFlags::JOINED);
            // our network address just changed; re-read the volatile set
            let _ = device.query_device(true);
        }
        ModemStatus::Disassociated | ModemStatus::HardwareReset | ModemStatus::WatchdogReset => {
            device
                .flags
                .remove(DeviceFlags::JOINED | DeviceFlags::AUTHENTICATED);
            device.network_address = NET_ADDR_UNDEFINED;
        }
        _ => {}
    }
    0
}
