//! Declarative programs of AT commands, executed in order against one
//! module.
//!
//! A program is a `'static` slice of [`ListEntry`] values terminated by a
//! sentinel.  Each entry names a command and what to do with it: seed the
//! parameter from a *base object*, or copy the response back into it.
//! The engine submits one entry at a time, reusing a single request
//! slot, and advances when the previous entry's response arrives.
//!
//! The base object travels as a byte image owned by the device; build
//! programs against a `#[repr(C)]` struct with `zerocopy` derives and
//! `core::mem::offset_of!` offsets, copy the struct in at
//! [`Device::cmd_list_execute`] and back out with
//! [`Device::cmd_list_result`] once the status leaves
//! [`ListStatus::Running`].

use embedded_time::Clock;

use crate::atcmd::{AtCmd, AtStatus, CmdDecision, CmdHandle, CmdResponse};
use crate::device::Device;
use crate::limits::{CMD_LIST_BASE_MAX, CMD_LIST_CONTEXTS};
use crate::serial::SerialPort;
use crate::{Address, Error, Result};

/// Processing rule of one list entry.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListAction {
    /// Issue the command only; often paired with a callback.
    None,
    /// Copy response bytes into the base image, zero-filling when the
    /// response is shorter than the field.
    CopyRaw,
    /// Store the response's numeric value (1, 2 or 4 bytes) into the
    /// base image in host byte order.
    CopyBe,
    /// Use raw bytes from the base image as the parameter.
    SetRaw,
    /// Use a NUL-terminated string in the base image as the parameter.
    SetStr,
    /// Re-encode a 1, 2 or 4 byte host-order integer from the base image
    /// as big-endian of the same width and use it as the parameter.
    SetBe,
    /// Use the byte held in the entry itself as the parameter.
    SetImmediate,
    /// Terminating command (typically ND or WR): send it, discard any
    /// response, and finish the list.
    Last,
}

/// Callback attached to a list entry or to the terminating sentinel.
///
/// Runs after the entry's default copy action with the response, the
/// entry (`None` on the command-mismatch error path) and the base image.
pub type ListCallbackFn = fn(&CmdResponse<'_>, Option<&ListEntry>, &mut [u8]);

/// One step of a command-list program.
#[derive(Debug, Clone, Copy)]
pub struct ListEntry {
    pub command: AtCmd,
    /// Free-form bits, meaningful only to this entry's callback.
    pub flags: u8,
    pub action: ListAction,
    pub callback: Option<ListCallbackFn>,
    /// Field width in the base image, or the value itself for
    /// [`ListAction::SetImmediate`].
    pub len: u8,
    /// Field offset in the base image.
    pub offset: u16,
}

impl ListEntry {
    const fn new(command: AtCmd, action: ListAction, offset: usize, len: usize) -> Self {
        Self {
            command,
            flags: 0,
            action,
            callback: None,
            len: len as u8,
            offset: offset as u16,
        }
    }

    /// Issue the command and ignore its response.
    pub const fn cmd(command: AtCmd) -> Self {
        Self::new(command, ListAction::None, 0, 0)
    }

    /// Copy `len` response bytes to `offset` in the base image.
    pub const fn copy(command: AtCmd, offset: usize, len: usize) -> Self {
        Self::new(command, ListAction::CopyRaw, offset, len)
    }

    /// Store the numeric response at `offset` in host order.
    pub const fn copy_be(command: AtCmd, offset: usize, len: usize) -> Self {
        Self::new(command, ListAction::CopyBe, offset, len)
    }

    /// Parameter = `len` raw bytes at `offset` in the base image.
    pub const fn set(command: AtCmd, offset: usize, len: usize) -> Self {
        Self::new(command, ListAction::SetRaw, offset, len)
    }

    /// Parameter = NUL-terminated string at `offset` in the base image.
    pub const fn set_str(command: AtCmd, offset: usize) -> Self {
        Self::new(command, ListAction::SetStr, offset, 0)
    }

    /// Parameter = big-endian re-encoding of the integer at `offset`.
    pub const fn set_be(command: AtCmd, offset: usize, len: usize) -> Self {
        Self::new(command, ListAction::SetBe, offset, len)
    }

    /// Parameter = the immediate byte `value`.
    pub const fn set_imm(command: AtCmd, value: u8) -> Self {
        Self::new(command, ListAction::SetImmediate, 0, value as usize)
    }

    pub const fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub const fn with_callback(mut self, callback: ListCallbackFn) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Terminating sentinel with no final callback.
    pub const fn end() -> Self {
        Self::new(AtCmd::NONE, ListAction::None, 0, 0)
    }

    /// Terminate by sending `command` and discarding its response.
    pub const fn end_cmd(command: AtCmd) -> Self {
        Self::new(command, ListAction::Last, 0, 0)
    }

    /// Terminating sentinel whose callback runs once when the list
    /// finishes (successfully or not).
    pub const fn end_cb(callback: ListCallbackFn) -> Self {
        Self {
            command: AtCmd::NONE,
            flags: 0,
            action: ListAction::None,
            callback: Some(callback),
            len: 0,
            offset: 0,
        }
    }

    /// Whether this entry is the all-zero-command sentinel.
    pub const fn is_end(&self) -> bool {
        self.command.0[0] == 0 && self.command.0[1] == 0
    }
}

/// Execution status of a command list.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListStatus {
    /// Commands are still being issued.
    Running,
    /// Reached the end of the program.
    Done,
    /// A step timed out.
    Timeout,
    /// A step produced a response for the wrong command.
    Error,
}

/// Token identifying one command-list context on a device.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListHandle(pub(crate) usize);

/// Device-owned execution state of one list.
pub(crate) struct ListState {
    pub(crate) program: Option<&'static [ListEntry]>,
    pub(crate) base: [u8; CMD_LIST_BASE_MAX],
    pub(crate) base_len: usize,
    /// Index of the entry most recently submitted.
    pub(crate) index: usize,
    pub(crate) status: ListStatus,
}

impl ListState {
    pub(crate) fn idle() -> Self {
        Self {
            program: None,
            base: [0; CMD_LIST_BASE_MAX],
            base_len: 0,
            index: 0,
            status: ListStatus::Done,
        }
    }
}

fn read_native(base: &[u8], offset: usize, len: usize) -> Result<u32> {
    if offset + len > base.len() {
        return Err(Error::InvalidArgument);
    }
    Ok(match len {
        1 => base[offset] as u32,
        2 => u16::from_ne_bytes([base[offset], base[offset + 1]]) as u32,
        4 => u32::from_ne_bytes([
            base[offset],
            base[offset + 1],
            base[offset + 2],
            base[offset + 3],
        ]),
        _ => return Err(Error::InvalidArgument),
    })
}

impl<S: SerialPort, C: Clock<T = u32>> Device<S, C> {
    /// Start executing `program` with the given base image, optionally
    /// against a remote target.
    ///
    /// The program must be terminated by [`ListEntry::end`],
    /// [`ListEntry::end_cb`] or [`ListEntry::end_cmd`], and `base` must
    /// fit the per-list image.  Fails with
    /// [`Error::NoSpace`] when every list context is occupied and
    /// [`Error::Busy`] when the first command cannot be sent; in both
    /// cases nothing keeps running.
    pub fn cmd_list_execute(
        &mut self,
        program: &'static [ListEntry],
        base: &[u8],
        target: Option<&Address>,
    ) -> Result<ListHandle> {
        let slot = self
            .lists
            .iter()
            .position(|l| l.program.is_none())
            .ok_or(Error::NoSpace)?;
        self.cmd_list_execute_in(slot, program, base, target)?;
        Ok(ListHandle(slot))
    }

    pub(crate) fn cmd_list_execute_in(
        &mut self,
        slot: usize,
        program: &'static [ListEntry],
        base: &[u8],
        target: Option<&Address>,
    ) -> Result<()> {
        if base.len() > CMD_LIST_BASE_MAX {
            return Err(Error::MessageTooBig);
        }
        let terminated = program
            .last()
            .map(|e| e.is_end() || matches!(e.action, ListAction::Last))
            .unwrap_or(false);
        if !terminated || program[0].is_end() {
            return Err(Error::InvalidArgument);
        }

        {
            let state = &mut self.lists[slot];
            state.program = Some(program);
            state.base = [0; CMD_LIST_BASE_MAX];
            state.base[..base.len()].copy_from_slice(base);
            state.base_len = base.len();
            state.index = 0;
            state.status = ListStatus::Running;
        }

        let request = match self.cmd_create_raw(program[0].command) {
            Ok(r) => r,
            Err(e) => {
                self.lists[slot].program = None;
                return Err(e);
            }
        };
        let mut result = self.list_issue(request, slot);
        if result.is_ok() {
            if let Some(address) = target {
                result = self.cmd_set_target(request, Some(address));
            }
        }
        if result.is_ok() {
            result = self.cmd_set_list_callback(request, slot);
        }
        if result.is_ok() {
            result = self.cmd_send(request);
        }
        if let Err(e) = result {
            let _ = self.cmd_release(request);
            self.lists[slot].program = None;
            return Err(e);
        }
        Ok(())
    }

    /// Current status of a list started with [`Device::cmd_list_execute`].
    pub fn cmd_list_status(&self, handle: ListHandle) -> Result<ListStatus> {
        let state = self.list_state(handle)?;
        Ok(state.status)
    }

    /// Copy the (possibly updated) base image back out.  `out` must be
    /// at least as long as the image passed to execute.
    pub fn cmd_list_result(&self, handle: ListHandle, out: &mut [u8]) -> Result<usize> {
        let state = self.list_state(handle)?;
        if out.len() < state.base_len {
            return Err(Error::InvalidArgument);
        }
        out[..state.base_len].copy_from_slice(&state.base[..state.base_len]);
        Ok(state.base_len)
    }

    /// Free the list context.  A list released while running simply
    /// stops: its outstanding request is dropped on the next response or
    /// timeout.
    pub fn cmd_list_release(&mut self, handle: ListHandle) -> Result<()> {
        self.list_state(handle)?;
        self.lists[handle.0].program = None;
        Ok(())
    }

    fn list_state(&self, handle: ListHandle) -> Result<&ListState> {
        if handle.0 >= CMD_LIST_CONTEXTS {
            return Err(Error::InvalidArgument);
        }
        let state = &self.lists[handle.0];
        if state.program.is_none() {
            return Err(Error::InvalidArgument);
        }
        Ok(state)
    }

    /// Point the request at the current entry: replace its command and
    /// seed the parameter according to the entry's action.
    fn list_issue(&mut self, request: CmdHandle, slot: usize) -> Result<()> {
        let state = &self.lists[slot];
        let program = state.program.ok_or(Error::InvalidArgument)?;
        let entry = program[state.index];
        let offset = entry.offset as usize;
        let len = entry.len as usize;

        self.cmd_set_command(request, entry.command)?;
        match entry.action {
            ListAction::SetImmediate => self.cmd_set_param(request, entry.len as u32),
            ListAction::SetRaw => {
                let state = &self.lists[slot];
                if offset + len > state.base_len {
                    return Err(Error::InvalidArgument);
                }
                let mut buf = [0u8; CMD_LIST_BASE_MAX];
                buf[..len].copy_from_slice(&state.base[offset..offset + len]);
                self.cmd_set_param_bytes(request, &buf[..len])
            }
            ListAction::SetStr => {
                let state = &self.lists[slot];
                if offset > state.base_len {
                    return Err(Error::InvalidArgument);
                }
                let tail = &state.base[offset..state.base_len];
                let n = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
                let mut buf = [0u8; CMD_LIST_BASE_MAX];
                buf[..n].copy_from_slice(&tail[..n]);
                self.cmd_set_param_bytes(request, &buf[..n])
            }
            ListAction::SetBe => {
                let state = &self.lists[slot];
                let value = read_native(&state.base[..state.base_len], offset, len)?;
                match len {
                    1 => self.cmd_set_param_bytes(request, &[value as u8]),
                    2 => self.cmd_set_param_bytes(request, &(value as u16).to_be_bytes()),
                    _ => self.cmd_set_param_bytes(request, &value.to_be_bytes()),
                }
            }
            _ => self.cmd_set_param_bytes(request, &[]),
        }
    }

    fn list_copy(&mut self, slot: usize, entry: &ListEntry, response: &CmdResponse<'_>) {
        let offset = entry.offset as usize;
        let len = entry.len as usize;
        let state = &mut self.lists[slot];
        if offset + len > state.base_len {
            return;
        }
        match entry.action {
            ListAction::CopyRaw => {
                let n = response.value.len().min(len);
                state.base[offset..offset + n].copy_from_slice(&response.value[..n]);
                for b in &mut state.base[offset + n..offset + len] {
                    *b = 0;
                }
            }
            ListAction::CopyBe => {
                let value = response.value_u32();
                match len {
                    1 => state.base[offset] = value as u8,
                    2 => state.base[offset..offset + 2]
                        .copy_from_slice(&(value as u16).to_ne_bytes()),
                    4 => state.base[offset..offset + 4].copy_from_slice(&value.to_ne_bytes()),
                    _ => {}
                }
            }
            _ => {}
        }
    }

    /// Run the terminating sentinel's callback, if the program has one.
    /// `pass_entry` is false on the command-mismatch error path.
    fn list_final_callback(&mut self, slot: usize, response: &CmdResponse<'_>, pass_entry: bool) {
        let Some(program) = self.lists[slot].program else {
            return;
        };
        let Some(sentinel) = program.iter().find(|e| e.is_end()) else {
            return;
        };
        if let Some(cb) = sentinel.callback {
            let entry = if pass_entry { Some(sentinel) } else { None };
            let state = &mut self.lists[slot];
            cb(response, entry, &mut state.base[..state.base_len]);
        }
    }

    /// Response receiver for the request slot a list is riding on.
    pub(crate) fn list_advance(&mut self, slot: usize, response: &CmdResponse<'_>) -> CmdDecision {
        let Some(program) = self.lists[slot].program else {
            // context released mid-flight; drop the request too
            return CmdDecision::Done;
        };
        let index = self.lists[slot].index;

        if response.timed_out() {
            self.lists[slot].status = ListStatus::Timeout;
            self.list_final_callback(slot, response, true);
            self.list_completed(slot);
            return CmdDecision::Done;
        }

        let entry = program[index];
        if response.command != entry.command {
            self.lists[slot].status = ListStatus::Error;
            self.list_final_callback(slot, response, false);
            self.list_completed(slot);
            return CmdDecision::Done;
        }

        if response.status == AtStatus::Success {
            self.list_copy(slot, &entry, response);
        }
        if let Some(cb) = entry.callback {
            let state = &mut self.lists[slot];
            cb(response, Some(&entry), &mut state.base[..state.base_len]);
        }

        let next_index = index + 1;
        self.lists[slot].index = next_index;
        let next = program[next_index];
        if next.is_end() {
            self.lists[slot].status = ListStatus::Done;
            if let Some(cb) = next.callback {
                let state = &mut self.lists[slot];
                cb(response, Some(&next), &mut state.base[..state.base_len]);
            }
            self.list_completed(slot);
            return CmdDecision::Done;
        }

        let request = response.handle;
        if self.list_issue(request, slot).is_ok() {
            // a failure here is surfaced by the timeout sweep
            let _ = self.cmd_send(request);
        }
        if next.action == ListAction::Last {
            // the terminator's response is discarded
            let _ = self.cmd_release(request);
            self.lists[slot].status = ListStatus::Done;
            if let Some(cb) = next.callback {
                let state = &mut self.lists[slot];
                cb(response, Some(&next), &mut state.base[..state.base_len]);
            }
            self.list_completed(slot);
            return CmdDecision::Done;
        }
        CmdDecision::Reuse
    }

    fn list_completed(&mut self, slot: usize) {
        if self.query_list == Some(ListHandle(slot)) {
            self.finish_query();
        }
    }
}
