//! Built-in identity query.
//!
//! On first contact the driver runs a command list against the module to
//! learn who it is talking to: hardware and firmware versions, serial
//! number, AT-mode guard registers, encryption options, association
//! state, payload ceiling and network address.  The results land in the
//! device itself; applications read them through the [`Device`]
//! accessors and [`Device::flags`].
//!
//! Network events re-run the *volatile* tail of the program (ATNP and
//! ATMY), since a join or rejoin changes the network address and payload
//! ceiling but not the module's identity.

use core::mem::offset_of;

use embedded_time::Clock;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::cmdlist::{ListEntry, ListStatus};
use crate::commands;
use crate::device::{Device, DeviceFlags};
use crate::serial::SerialPort;
use crate::{Error, IeeeAddr, Result, NET_ADDR_UNDEFINED};

/// ATEO bit: joining without a link key is allowed.
pub const EO_INSECURE_JOIN: u8 = 1 << 0;
/// ATEO bit: use a trust center.
pub const EO_USE_TRUST_CENTER: u8 = 1 << 1;
/// ATEO bit: use a hashed link key.
pub const EO_USE_HASH_LINK_KEY: u8 = 1 << 2;
/// ATEO bit: authentication is in use.
pub const EO_USE_AUTHENTICATION: u8 = 1 << 3;

/// Mask of the hardware series in the HV register.
pub const HARDWARE_MASK: u16 = 0xFF00;
pub const HARDWARE_S1: u16 = 0x1700;
pub const HARDWARE_S1_PRO: u16 = 0x1800;
pub const HARDWARE_S2: u16 = 0x1900;
pub const HARDWARE_S2_PRO: u16 = 0x1A00;
pub const HARDWARE_900_PRO: u16 = 0x1B00;
pub const HARDWARE_868_PRO: u16 = 0x1D00;
pub const HARDWARE_S2B_PRO: u16 = 0x1E00;
pub const HARDWARE_S2C_PRO: u16 = 0x2100;
pub const HARDWARE_S2C: u16 = 0x2200;
pub const HARDWARE_S3B: u16 = 0x2300;
pub const HARDWARE_S8: u16 = 0x2400;

/// Mask of the stack protocol in the VR register.
pub const PROTOCOL_MASK: u32 = 0xF000;
pub const PROTOCOL_ZNET: u32 = 0x1000;
pub const PROTOCOL_ZB: u32 = 0x2000;
pub const PROTOCOL_SMART_ENERGY: u32 = 0x3000;
pub const PROTOCOL_ZB_S2C: u32 = 0x4000;
pub const PROTOCOL_SE_S2C: u32 = 0x5000;
pub const PROTOCOL_DIGIMESH: u32 = 0x8000;

/// Mask of the node type in the VR register.
pub const NODETYPE_MASK: u32 = 0x0F00;
pub const NODETYPE_COORDINATOR: u32 = 0x0100;
pub const NODETYPE_ROUTER: u32 = 0x0300;
pub const NODETYPE_END_DEVICE: u32 = 0x0900;

/// Base image of the identity query.
///
/// Field order keeps the struct free of padding so it can round-trip
/// through the command-list byte image.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct DeviceIdentity {
    /// VR register.
    pub firmware_version: u32,
    /// HV register.
    pub hardware_version: u16,
    /// GT register: AT command mode guard time, ms.
    pub guard_time: u16,
    /// CT register: AT command mode timeout, units of 100 ms.
    pub idle_timeout: u16,
    /// NP register: maximum RF payload.
    pub max_payload: u16,
    /// MY register.
    pub network_address: u16,
    /// SH and SL registers, big-endian.
    pub ieee: [u8; 8],
    /// CC register: AT command mode escape character.
    pub escape_char: u8,
    /// EO register.
    pub encryption_options: u8,
    /// AI register: 0 when joined.
    pub assoc_indicator: u8,
    pub reserved: [u8; 3],
}

pub const IDENTITY_LEN: usize = core::mem::size_of::<DeviceIdentity>();

/// Registers queried to learn about the attached module.
pub static SELF_QUERY: &[ListEntry] = &[
    ListEntry::copy_be(
        commands::HV,
        offset_of!(DeviceIdentity, hardware_version),
        2,
    ),
    ListEntry::copy_be(
        commands::VR,
        offset_of!(DeviceIdentity, firmware_version),
        4,
    ),
    ListEntry::copy(commands::SH, offset_of!(DeviceIdentity, ieee), 4),
    ListEntry::copy(commands::SL, offset_of!(DeviceIdentity, ieee) + 4, 4),
    ListEntry::copy_be(commands::GT, offset_of!(DeviceIdentity, guard_time), 2),
    ListEntry::copy_be(commands::CT, offset_of!(DeviceIdentity, idle_timeout), 2),
    ListEntry::copy(commands::CC, offset_of!(DeviceIdentity, escape_char), 1),
    ListEntry::copy_be(
        commands::EO,
        offset_of!(DeviceIdentity, encryption_options),
        1,
    ),
    ListEntry::copy_be(
        commands::AI,
        offset_of!(DeviceIdentity, assoc_indicator),
        1,
    ),
    // refresh restarts here once the network tells us we (re)joined
    ListEntry::copy_be(commands::NP, offset_of!(DeviceIdentity, max_payload), 2),
    ListEntry::copy_be(
        commands::MY,
        offset_of!(DeviceIdentity, network_address),
        2,
    ),
    ListEntry::end(),
];

/// Offset into [`SELF_QUERY`] covering only the registers that change
/// with network state.
pub const REFRESH_INDEX: usize = 9;

impl<S: SerialPort, C: Clock<T = u32>> Device<S, C> {
    /// Start (or re-start) the identity query.  With `refresh`, only the
    /// volatile tail of the program runs.
    ///
    /// A query already in progress is not interrupted; the refresh
    /// request is remembered and honored when it completes.
    pub fn query_device(&mut self, refresh: bool) -> Result<()> {
        let mut start = 0;
        if refresh {
            self.flags.insert(DeviceFlags::QUERY_REFRESH);
            start = REFRESH_INDEX;
        }
        if self.flags.contains(DeviceFlags::QUERY_IN_PROGRESS) {
            return Ok(());
        }

        let identity = self.seed_identity();
        let program = &SELF_QUERY[start..];
        let result = match self.query_list {
            Some(handle) => {
                self.cmd_list_execute_in(handle.0, program, identity.as_bytes(), None)
            }
            None => match self.cmd_list_execute(program, identity.as_bytes(), None) {
                Ok(handle) => {
                    self.query_list = Some(handle);
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };
        if result.is_ok() {
            self.flags
                .insert(DeviceFlags::QUERY_BEGIN | DeviceFlags::QUERY_IN_PROGRESS);
            self.flags.remove(
                DeviceFlags::QUERY_DONE | DeviceFlags::QUERY_ERROR | DeviceFlags::QUERY_REFRESH,
            );
        }
        result
    }

    /// Progress of the identity query, after expiring overdue requests.
    ///
    /// [`Error::NotFound`] until the query has been started.
    pub fn query_status(&mut self) -> Result<ListStatus> {
        self.cmd_tick(false)?;
        match self.query_list {
            Some(handle) => self.cmd_list_status(handle),
            None => Err(Error::NotFound),
        }
    }

    /// Identity image seeded from what the device already knows, so a
    /// partial or refresh run keeps earlier answers.
    fn seed_identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            firmware_version: self.firmware_version,
            hardware_version: self.hardware_version,
            guard_time: self.guard_time,
            idle_timeout: self.idle_timeout,
            max_payload: self.max_payload,
            network_address: self.network_address,
            ieee: self.ieee.0,
            escape_char: self.escape_char,
            encryption_options: if self.flags.contains(DeviceFlags::AUTH_ENABLED) {
                EO_USE_AUTHENTICATION
            } else {
                0
            },
            assoc_indicator: if self.flags.contains(DeviceFlags::JOINED) {
                0
            } else {
                0xFF
            },
            reserved: [0; 3],
        }
    }

    /// Runs when the identity query's list stops, in any state.
    pub(crate) fn finish_query(&mut self) {
        let Some(handle) = self.query_list else {
            return;
        };
        let Ok(status) = self.cmd_list_status(handle) else {
            return;
        };
        if status == ListStatus::Running {
            return;
        }

        self.flags.remove(DeviceFlags::QUERY_IN_PROGRESS);

        // keep whatever the list gathered, even from a partial run
        let mut bytes = [0u8; IDENTITY_LEN];
        if self.cmd_list_result(handle, &mut bytes).is_ok() {
            if let Ok(identity) = DeviceIdentity::read_from_bytes(&bytes) {
                self.apply_identity(&identity);
            }
        }

        if status == ListStatus::Done {
            self.flags.insert(DeviceFlags::QUERY_DONE);
        } else {
            self.flags.insert(DeviceFlags::QUERY_ERROR);
        }

        if self.flags.contains(DeviceFlags::QUERY_ERROR)
            && self.flags.contains(DeviceFlags::JOINED)
            && self.network_address == NET_ADDR_UNDEFINED
        {
            // joined but the address never came through; try again
            self.flags.insert(DeviceFlags::QUERY_REFRESH);
        }
        if self.flags.contains(DeviceFlags::QUERY_REFRESH) {
            let _ = self.query_device(true);
        }
    }

    fn apply_identity(&mut self, identity: &DeviceIdentity) {
        self.hardware_version = identity.hardware_version;
        self.firmware_version = identity.firmware_version;
        self.ieee = IeeeAddr(identity.ieee);
        self.guard_time = identity.guard_time;
        self.idle_timeout = identity.idle_timeout;
        self.escape_char = identity.escape_char;
        self.max_payload = identity.max_payload;
        self.network_address = identity.network_address;

        self.flags.set(
            DeviceFlags::AUTH_ENABLED,
            identity.encryption_options & EO_USE_AUTHENTICATION != 0,
        );
        if identity.assoc_indicator == 0 {
            self.flags.insert(DeviceFlags::JOINED);
            if self.flags.contains(DeviceFlags::AUTH_ENABLED) {
                self.flags.insert(DeviceFlags::AUTHENTICATED);
            }
        }

        self.flags.remove(
            DeviceFlags::COORDINATOR
                | DeviceFlags::ROUTER
                | DeviceFlags::END_DEVICE
                | DeviceFlags::ZNET
                | DeviceFlags::ZIGBEE
                | DeviceFlags::SMART_ENERGY
                | DeviceFlags::DIGIMESH,
        );
        match identity.firmware_version & PROTOCOL_MASK {
            PROTOCOL_ZNET => self.flags.insert(DeviceFlags::ZNET),
            PROTOCOL_ZB | PROTOCOL_ZB_S2C => self.flags.insert(DeviceFlags::ZIGBEE),
            PROTOCOL_SMART_ENERGY | PROTOCOL_SE_S2C => {
                self.flags.insert(DeviceFlags::SMART_ENERGY)
            }
            PROTOCOL_DIGIMESH => self.flags.insert(DeviceFlags::DIGIMESH),
            _ => {}
        }
        match identity.firmware_version & NODETYPE_MASK {
            NODETYPE_COORDINATOR => self.flags.insert(DeviceFlags::COORDINATOR),
            NODETYPE_ROUTER => self.flags.insert(DeviceFlags::ROUTER),
            NODETYPE_END_DEVICE => self.flags.insert(DeviceFlags::END_DEVICE),
            _ => {}
        }
    }
}
