//! Device abstraction: one attached module, its receive parser, the frame
//! dispatcher and the cooperative tick.
//!
//! A [`Device`] owns its serial link exclusively and makes all progress
//! from [`Device::tick`], which the application calls from its event
//! loop.  Frame handlers and command callbacks run inside that call; they
//! may operate freely on the device they were invoked for, except for
//! calling `tick` again on it.

use bitflags::bitflags;
use embedded_time::duration::{Generic, Seconds};
use embedded_time::{Clock, Instant};
use heapless::Vec;

use crate::atcmd::CmdRequest;
use crate::cmdlist::{ListHandle, ListState};
use crate::frame::{self, ModemStatus, START_BYTE};
use crate::limits::{MAX_DISPATCH_PER_TICK, MAX_FRAME_HANDLERS, MAX_FRAME_LEN};
use crate::serial::SerialPort;
use crate::{commands, Error, IeeeAddr, Result, NET_ADDR_UNDEFINED};

bitflags! {
    /// State and capability flags of one device.
    ///
    /// The query flags track the built-in identity query; the node-type
    /// and protocol flags are learned from the module's firmware version
    /// when that query completes.
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFlags: u32 {
        /// Command layer initialized for this device.
        const CMD_INIT          = 0x0000_0001;
        /// Identity query has been started at least once.
        const QUERY_BEGIN       = 0x0000_0002;
        /// Identity query completed.
        const QUERY_DONE        = 0x0000_0004;
        /// Identity query timed out or errored.
        const QUERY_ERROR       = 0x0000_0008;
        /// Volatile registers need to be re-read.
        const QUERY_REFRESH     = 0x0000_0010;
        /// Identity query currently running.
        const QUERY_IN_PROGRESS = 0x0000_0020;
        /// Inside `tick`; guards against re-entry.
        const IN_TICK           = 0x0000_0080;
        /// Node type is coordinator.
        const COORDINATOR       = 0x0000_0100;
        /// Node type is router.
        const ROUTER            = 0x0000_0200;
        /// Node type is end device.
        const END_DEVICE        = 0x0000_0400;
        /// Firmware is ZNet.
        const ZNET              = 0x0000_0800;
        /// Firmware is ZigBee.
        const ZIGBEE            = 0x0000_1000;
        /// Firmware is DigiMesh.
        const DIGIMESH          = 0x0000_2000;
        /// Check /CTS before sending.
        const USE_FLOW_CONTROL  = 0x0000_8000;
        /// Firmware is Smart Energy.
        const SMART_ENERGY      = 0x0001_0000;
        /// Module has joined a network.
        const JOINED            = 0x0002_0000;
        /// Module is authenticated on the network.
        const AUTHENTICATED     = 0x0004_0000;
        /// ATEO reports authentication in use.
        const AUTH_ENABLED      = 0x0008_0000;
    }
}

/// Communication mode of the module, as far as the host knows.
///
/// The core drives API mode only; the other values exist for
/// applications that move a module through the bootloader or AT command
/// mode themselves.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Haven't communicated with the module yet.
    #[default]
    Unknown,
    /// Module is in its bootloader.
    Bootloader,
    /// Module is running API firmware.
    Api,
    /// Module is in AT command mode.
    AtCommand,
}

/// Event counters, mostly for wire-corruption visibility.
///
/// Corrupt input is recovered by resynchronizing the parser and is never
/// reported as an error; these counters are the only trace it leaves.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Frames received with a valid checksum and dispatched.
    pub frames_rx: u32,
    /// Frames written to the link.
    pub frames_tx: u32,
    /// Completed frames dropped for a bad checksum.
    pub checksum_errors: u32,
    /// Frames dropped because the length field exceeded the buffer.
    pub oversized_frames: u32,
    /// Frames dropped for a zero length field.
    pub empty_frames: u32,
    /// Bytes discarded while hunting for a start byte.
    pub discarded_bytes: u32,
}

/// Handler registered for a frame type.
///
/// `frame` starts with the frame type byte; the start byte, length and
/// checksum are stripped before dispatch.  `context` is the value given
/// at registration; the dispatcher never interprets it, nor the return
/// value.
pub type FrameHandlerFn<S, C> = fn(&mut Device<S, C>, frame: &[u8], context: u32) -> i32;

/// Hook toggling the module's /RESET pin.
pub type ResetFn<S, C> = fn(&mut Device<S, C>, asserted: bool);

/// Hook sampling the module's ON/SLEEP pin.
pub type IsAwakeFn<S, C> = fn(&Device<S, C>) -> bool;

struct HandlerEntry<S: SerialPort, C: Clock<T = u32>> {
    frame_type: u8,
    frame_id: u8,
    handler: FrameHandlerFn<S, C>,
    context: u32,
}

impl<S: SerialPort, C: Clock<T = u32>> Clone for HandlerEntry<S, C> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<S: SerialPort, C: Clock<T = u32>> Copy for HandlerEntry<S, C> {}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RxPhase {
    /// Waiting for the initial 0x7E.
    WaitStart,
    /// Waiting for the MSB of the length.
    LengthMsb,
    /// Waiting for the LSB of the length.
    LengthLsb,
    /// Receiving the payload and trailing checksum.
    InFrame,
}

struct Rx {
    phase: RxPhase,
    /// Payload bytes in the frame being read; excludes the checksum.
    bytes_in_frame: u16,
    /// Bytes read so far, including the checksum once it arrives.
    bytes_read: u16,
    /// Payload starting with the frame type, +1 for the checksum.
    buf: [u8; MAX_FRAME_LEN + 1],
}

impl Rx {
    fn new() -> Self {
        Self {
            phase: RxPhase::WaitStart,
            bytes_in_frame: 0,
            bytes_read: 0,
            buf: [0; MAX_FRAME_LEN + 1],
        }
    }

    fn restart(&mut self) {
        self.phase = RxPhase::WaitStart;
        self.bytes_in_frame = 0;
        self.bytes_read = 0;
    }
}

/// One attached XBee module.
///
/// Exactly one owner; a device is deliberately neither `Clone` nor
/// `Copy`.  All public operations must run on the context that calls
/// [`Device::tick`] (callbacks included).
pub struct Device<S: SerialPort, C: Clock<T = u32>> {
    serial: S,
    clock: C,
    pub(crate) flags: DeviceFlags,
    mode: Mode,
    pub(crate) ieee: IeeeAddr,
    pub(crate) network_address: u16,
    pub(crate) hardware_version: u16,
    pub(crate) firmware_version: u32,
    pub(crate) max_payload: u16,
    pub(crate) guard_time: u16,
    pub(crate) idle_timeout: u16,
    pub(crate) escape_char: u8,
    /// Last frame id used for sending.
    frame_id: u8,
    rx: Rx,
    counters: Counters,
    handlers: Vec<HandlerEntry<S, C>, MAX_FRAME_HANDLERS>,
    pub(crate) requests: [CmdRequest<S, C>; crate::limits::REQUEST_TABLE_SIZE],
    pub(crate) lists: [ListState; crate::limits::CMD_LIST_CONTEXTS],
    pub(crate) query_list: Option<ListHandle>,
    pub(crate) last_sweep: Option<Instant<C>>,
    /// Guards the timeout sweep against re-entry from callbacks that
    /// allocate while their own expired slot is still being processed.
    pub(crate) in_sweep: bool,
    reset_fn: Option<ResetFn<S, C>>,
    is_awake_fn: Option<IsAwakeFn<S, C>>,
    identify_state: bool,
}

impl<S: SerialPort, C: Clock<T = u32>> Device<S, C> {
    pub fn new(serial: S, clock: C) -> Self {
        Self {
            serial,
            clock,
            flags: DeviceFlags::USE_FLOW_CONTROL,
            mode: Mode::Unknown,
            ieee: IeeeAddr([0; 8]),
            network_address: NET_ADDR_UNDEFINED,
            hardware_version: 0,
            firmware_version: 0,
            max_payload: 0,
            guard_time: 0,
            idle_timeout: 0,
            escape_char: 0,
            frame_id: 0,
            rx: Rx::new(),
            counters: Counters::default(),
            handlers: Vec::new(),
            requests: core::array::from_fn(|_| CmdRequest::idle()),
            lists: core::array::from_fn(|_| ListState::idle()),
            query_list: None,
            last_sweep: None,
            in_sweep: false,
            reset_fn: None,
            is_awake_fn: None,
            identify_state: false,
        }
    }

    pub fn serial(&self) -> &S {
        &self.serial
    }

    pub fn serial_mut(&mut self) -> &mut S {
        &mut self.serial
    }

    pub fn flags(&self) -> DeviceFlags {
        self.flags
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// 64-bit IEEE address learned from the identity query.
    pub fn ieee(&self) -> IeeeAddr {
        self.ieee
    }

    /// 16-bit network address, or [`NET_ADDR_UNDEFINED`].
    pub fn network_address(&self) -> u16 {
        self.network_address
    }

    /// Value of the module's HV register.
    pub fn hardware_version(&self) -> u16 {
        self.hardware_version
    }

    /// Value of the module's VR register.
    pub fn firmware_version(&self) -> u32 {
        self.firmware_version
    }

    /// Largest RF payload the module will accept (ATNP).
    pub fn max_payload(&self) -> u16 {
        self.max_payload
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Enable or disable checking /CTS before each frame write.
    pub fn set_flow_control(&mut self, enabled: bool) {
        self.flags.set(DeviceFlags::USE_FLOW_CONTROL, enabled);
    }

    pub fn set_reset_hook(&mut self, hook: Option<ResetFn<S, C>>) {
        self.reset_fn = hook;
    }

    pub fn set_awake_hook(&mut self, hook: Option<IsAwakeFn<S, C>>) {
        self.is_awake_fn = hook;
    }

    /// Sample the module's ON/SLEEP pin; `true` when no hook is set.
    pub fn is_awake(&self) -> bool {
        match self.is_awake_fn {
            Some(probe) => probe(self),
            None => true,
        }
    }

    /// Pulse the module's /RESET pin through the configured hook and
    /// forget the join state.  A modem status frame is not synthesized;
    /// the module announces its own reset.
    pub fn reset(&mut self) -> Result<()> {
        let hook = self.reset_fn.ok_or(Error::NotImplemented)?;
        hook(self, true);
        hook(self, false);
        self.flags
            .remove(DeviceFlags::JOINED | DeviceFlags::AUTHENTICATED);
        self.network_address = NET_ADDR_UNDEFINED;
        Ok(())
    }

    /// Next frame id for a frame that wants a response.  Wraps 255 to 1;
    /// 0 is reserved for frames that suppress the response.
    pub fn next_frame_id(&mut self) -> u8 {
        self.frame_id = self.frame_id_after_current();
        self.frame_id
    }

    /// The id `next_frame_id` would hand out, without consuming it.  The
    /// send path advances the counter only once the frame is on the
    /// wire, so a send that fails with `Busy` burns nothing.
    pub(crate) fn frame_id_after_current(&self) -> u8 {
        if self.frame_id == 0xFF {
            1
        } else {
            self.frame_id + 1
        }
    }

    pub(crate) fn commit_frame_id(&mut self, frame_id: u8) {
        self.frame_id = frame_id;
    }

    /// Flash the association LED fast (ATLT=10) while `enabled`.
    pub fn identify(&mut self, enabled: bool) -> Result<()> {
        if enabled == self.identify_state {
            return Ok(());
        }
        self.cmd_simple(commands::LT, if enabled { 10 } else { 0 })?;
        self.identify_state = enabled;
        Ok(())
    }

    pub(crate) fn now(&self) -> Result<Instant<C>> {
        // a clock that cannot be read behaves like transient backpressure
        self.clock.try_now().map_err(|_| Error::Busy)
    }

    pub(crate) fn deadline_in(&self, secs: u32) -> Result<Instant<C>> {
        let now = self.now()?;
        now.checked_add(Seconds(secs)).ok_or(Error::Busy)
    }

    pub(crate) fn expired(now: &Instant<C>, deadline: &Instant<C>) -> bool {
        now.checked_duration_since(deadline).is_some()
    }

    pub(crate) fn whole_seconds(from: &Instant<C>, to: &Instant<C>) -> u32 {
        to.checked_duration_since(from)
            .and_then(|d: Generic<u32>| Seconds::<u32>::try_from(d).ok())
            .map(|s| s.0)
            .unwrap_or(0)
    }

    // ---- frame handler table ----

    /// Register a handler for `frame_type`, called for every matching
    /// frame.  `frame_id == 0` matches any id; otherwise the byte at
    /// offset 1 of the frame must match.  Handlers run in registration
    /// order, and every matching handler runs.
    pub fn register_handler(
        &mut self,
        frame_type: u8,
        frame_id: u8,
        handler: FrameHandlerFn<S, C>,
        context: u32,
    ) -> Result<()> {
        if frame_type == 0 {
            return Err(Error::InvalidArgument);
        }
        if self.handlers.iter().any(|e| {
            e.frame_type == frame_type
                && e.frame_id == frame_id
                && e.handler == handler
                && e.context == context
        }) {
            return Err(Error::InvalidArgument);
        }
        self.handlers
            .push(HandlerEntry {
                frame_type,
                frame_id,
                handler,
                context,
            })
            .map_err(|_| Error::NoSpace)
    }

    /// Remove a previously registered handler.
    pub fn remove_handler(
        &mut self,
        frame_type: u8,
        frame_id: u8,
        handler: FrameHandlerFn<S, C>,
        context: u32,
    ) -> Result<()> {
        let pos = self
            .handlers
            .iter()
            .position(|e| {
                e.frame_type == frame_type
                    && e.frame_id == frame_id
                    && e.handler == handler
                    && e.context == context
            })
            .ok_or(Error::NotFound)?;
        for i in pos..self.handlers.len() - 1 {
            self.handlers[i] = self.handlers[i + 1];
        }
        self.handlers.pop();
        Ok(())
    }

    fn dispatch_frame(&mut self, payload: &[u8]) {
        let frame_type = payload[0];
        let frame_id = if payload.len() > 1 { payload[1] } else { 0 };

        // Snapshot the matches so handlers are free to mutate the device,
        // including the handler table itself.
        let mut matched: Vec<(FrameHandlerFn<S, C>, u32), MAX_FRAME_HANDLERS> = Vec::new();
        for entry in &self.handlers {
            if entry.frame_type != frame_type {
                continue;
            }
            if entry.frame_id != 0 && entry.frame_id != frame_id {
                continue;
            }
            let _ = matched.push((entry.handler, entry.context));
        }
        for (handler, context) in matched {
            // return value is opaque at this layer
            let _ = handler(self, payload, context);
        }
    }

    // ---- receive path ----

    /// Pull pending bytes through the receive state machine, dispatching
    /// completed frames.  Never blocks; returns the number of frames
    /// dispatched this call (bounded by the per-tick cap).
    fn frame_load(&mut self) -> usize {
        let mut dispatched = 0;
        let mut byte = [0u8; 1];

        while dispatched < MAX_DISPATCH_PER_TICK {
            match self.rx.phase {
                RxPhase::WaitStart => {
                    if self.serial.read(&mut byte) == 0 {
                        break;
                    }
                    if byte[0] == START_BYTE {
                        self.rx.phase = RxPhase::LengthMsb;
                    } else {
                        self.counters.discarded_bytes += 1;
                    }
                }
                RxPhase::LengthMsb => {
                    if self.serial.read(&mut byte) == 0 {
                        break;
                    }
                    if byte[0] != START_BYTE {
                        self.rx.bytes_in_frame = (byte[0] as u16) << 8;
                        self.rx.phase = RxPhase::LengthLsb;
                    }
                    // another 0x7E here restarts the header
                }
                RxPhase::LengthLsb => {
                    if self.serial.read(&mut byte) == 0 {
                        break;
                    }
                    if self.rx.bytes_in_frame == 0 && byte[0] == START_BYTE {
                        // stray start byte; the real length follows
                        self.rx.phase = RxPhase::LengthMsb;
                        continue;
                    }
                    let length = self.rx.bytes_in_frame | byte[0] as u16;
                    if length == 0 {
                        self.counters.empty_frames += 1;
                        self.rx.restart();
                    } else if length as usize > MAX_FRAME_LEN {
                        self.counters.oversized_frames += 1;
                        self.rx.restart();
                    } else {
                        self.rx.bytes_in_frame = length;
                        self.rx.bytes_read = 0;
                        self.rx.phase = RxPhase::InFrame;
                    }
                }
                RxPhase::InFrame => {
                    let total = self.rx.bytes_in_frame as usize + 1;
                    let read = self
                        .serial
                        .read(&mut self.rx.buf[self.rx.bytes_read as usize..total]);
                    if read == 0 {
                        break;
                    }
                    self.rx.bytes_read += read as u16;
                    if self.rx.bytes_read as usize == total {
                        let length = self.rx.bytes_in_frame as usize;
                        let valid = frame::verify(&self.rx.buf[..total]);

                        // handlers borrow the device mutably, so hand them
                        // a copy of the payload rather than the rx buffer
                        let mut payload = [0u8; MAX_FRAME_LEN];
                        payload[..length].copy_from_slice(&self.rx.buf[..length]);
                        self.rx.restart();

                        if valid {
                            self.counters.frames_rx += 1;
                            self.dispatch_frame(&payload[..length]);
                            dispatched += 1;
                        } else {
                            self.counters.checksum_errors += 1;
                        }
                    }
                }
            }
        }
        dispatched
    }

    // ---- send path ----

    /// Frame and send `header` followed by `payload`.  `header` must
    /// begin with the frame type byte.
    ///
    /// The frame is written whole or not at all: on backpressure (no
    /// transmit room, or /CTS deasserted under flow control) nothing is
    /// written and the call fails with [`Error::Busy`].
    pub fn frame_write(&mut self, header: &[u8], payload: &[u8]) -> Result<()> {
        if header.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let length = header.len() + payload.len();
        if length > MAX_FRAME_LEN {
            return Err(Error::MessageTooBig);
        }
        if self.flags.contains(DeviceFlags::USE_FLOW_CONTROL) && !self.serial.cts() {
            return Err(Error::Busy);
        }
        let total = length + 4;
        if self.serial.tx_free() < total {
            return Err(Error::Busy);
        }

        let mut buf = [0u8; MAX_FRAME_LEN + 4];
        buf[0] = START_BYTE;
        buf[1..3].copy_from_slice(&(length as u16).to_be_bytes());
        buf[3..3 + header.len()].copy_from_slice(header);
        buf[3 + header.len()..3 + length].copy_from_slice(payload);
        let cs = frame::checksum(payload, frame::checksum(header, 0xFF));
        buf[3 + length] = cs;

        let written = self.serial.write(&buf[..total])?;
        if written != total {
            // room was checked above; a short write means the port lied
            return Err(Error::Busy);
        }
        self.counters.frames_tx += 1;
        Ok(())
    }

    // ---- tick ----

    /// One non-blocking pass of the driver: advance the receive parser,
    /// dispatch up to the per-tick cap of frames, and expire timed out
    /// requests.  Returns the number of frames dispatched.
    ///
    /// Fails with [`Error::Busy`] when called from inside a handler
    /// running under this same device's tick.
    pub fn tick(&mut self) -> Result<usize> {
        if self.flags.contains(DeviceFlags::IN_TICK) {
            return Err(Error::Busy);
        }
        self.flags.insert(DeviceFlags::IN_TICK);
        let result = self.tick_inner();
        self.flags.remove(DeviceFlags::IN_TICK);
        result
    }

    fn tick_inner(&mut self) -> Result<usize> {
        let dispatched = self.frame_load();
        self.cmd_tick(false)?;
        Ok(dispatched)
    }
}

/// Ready-made frame handler for 0x8A frames: decodes the status and, with
/// the `defmt` feature, logs it.
pub fn modem_status_debug<S: SerialPort, C: Clock<T = u32>>(
    _device: &mut Device<S, C>,
    frame: &[u8],
    _context: u32,
) -> i32 {
    match ModemStatus::from_frame(frame) {
        Some(_status) => {
            #[cfg(feature = "defmt")]
            defmt::info!("modem status: {}", _status);
            0
        }
        None => -1,
    }
}
