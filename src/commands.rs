//! Named AT commands for the registers and actions this driver and its
//! applications touch.
//!
//! The two letters are what travels on the wire; the constants exist so
//! call sites read as `commands::VR` instead of `AtCmd(*b"VR")`.  Which
//! registers a given module actually implements depends on its hardware
//! series and firmware; unknown commands come back with a bad-command
//! status.

use crate::atcmd::AtCmd;

// -- diagnostics --

/// Hardware version.
pub const HV: AtCmd = AtCmd::new(b"HV");
/// Firmware version.
pub const VR: AtCmd = AtCmd::new(b"VR");
/// Verbose firmware version string (DigiMesh 900).
pub const VL: AtCmd = AtCmd::new(b"VL");
/// Association indication; 0 when joined.
pub const AI: AtCmd = AtCmd::new(b"AI");
/// Received signal strength of the last hop, in -dBm.
pub const DB: AtCmd = AtCmd::new(b"DB");
/// Supply voltage, mV.
pub const PCT_V: AtCmd = AtCmd::new(b"%V");
/// Module temperature, degrees C.
pub const TP: AtCmd = AtCmd::new(b"TP");

// -- addressing --

/// Serial number high word.
pub const SH: AtCmd = AtCmd::new(b"SH");
/// Serial number low word.
pub const SL: AtCmd = AtCmd::new(b"SL");
/// Own 16-bit network address.
pub const MY: AtCmd = AtCmd::new(b"MY");
/// 16-bit network address of this end device's parent.
pub const MP: AtCmd = AtCmd::new(b"MP");
/// Maximum RF payload, bytes.
pub const NP: AtCmd = AtCmd::new(b"NP");
/// Destination address high word.
pub const DH: AtCmd = AtCmd::new(b"DH");
/// Destination address low word.
pub const DL: AtCmd = AtCmd::new(b"DL");
/// Node identifier string, up to 20 characters.
pub const NI: AtCmd = AtCmd::new(b"NI");

// -- network --

/// Extended PAN id (or network id on DigiMesh 900).
pub const ID: AtCmd = AtCmd::new(b"ID");
/// Operating extended PAN id.
pub const OP: AtCmd = AtCmd::new(b"OP");
/// Operating 16-bit PAN id.
pub const OI: AtCmd = AtCmd::new(b"OI");
/// Operating channel.
pub const CH: AtCmd = AtCmd::new(b"CH");
/// Channels to scan when joining or forming, bitmask.
pub const SC: AtCmd = AtCmd::new(b"SC");
/// Scan duration exponent.
pub const SD: AtCmd = AtCmd::new(b"SD");
/// Seconds a coordinator/router permits joining.
pub const NJ: AtCmd = AtCmd::new(b"NJ");
/// Verify the coordinator on the channel at join.
pub const JV: AtCmd = AtCmd::new(b"JV");
/// Node discovery timeout, units of 100 ms.
pub const NT: AtCmd = AtCmd::new(b"NT");
/// Discover nodes on the network.
pub const ND: AtCmd = AtCmd::new(b"ND");
/// Node discovery options.
pub const NO: AtCmd = AtCmd::new(b"NO");

// -- security --

/// Encryption enable.
pub const EE: AtCmd = AtCmd::new(b"EE");
/// Encryption options.
pub const EO: AtCmd = AtCmd::new(b"EO");
/// Network encryption key (write only).
pub const NK: AtCmd = AtCmd::new(b"NK");
/// Link encryption key (write only).
pub const KY: AtCmd = AtCmd::new(b"KY");

// -- serial interface and RF --

/// Interface data rate.
pub const BD: AtCmd = AtCmd::new(b"BD");
/// Serial parity.
pub const NB: AtCmd = AtCmd::new(b"NB");
/// API mode (0 transparent, 1 API, 2 API with escaping).
pub const AP: AtCmd = AtCmd::new(b"AP");
/// API options (raw vs. explicit receive frames).
pub const AO: AtCmd = AtCmd::new(b"AO");
/// Transmit power level.
pub const PL: AtCmd = AtCmd::new(b"PL");
/// Power boost mode.
pub const PM: AtCmd = AtCmd::new(b"PM");

// -- sleep --

/// Sleep mode.
pub const SM: AtCmd = AtCmd::new(b"SM");
/// Sleep period, units of 10 ms.
pub const SP: AtCmd = AtCmd::new(b"SP");
/// Wake time, ms.
pub const ST: AtCmd = AtCmd::new(b"ST");
/// Sleep options.
pub const SO: AtCmd = AtCmd::new(b"SO");
/// Number of sleep periods between ON/SLEEP assertions.
pub const SN: AtCmd = AtCmd::new(b"SN");
/// Wake host delay, ms.
pub const WH: AtCmd = AtCmd::new(b"WH");

// -- AT command mode --

/// Guard time before/after the escape sequence, ms.
pub const GT: AtCmd = AtCmd::new(b"GT");
/// Command mode timeout, units of 100 ms.
pub const CT: AtCmd = AtCmd::new(b"CT");
/// Command mode escape character (default '+').
pub const CC: AtCmd = AtCmd::new(b"CC");
/// Exit command mode.
pub const CN: AtCmd = AtCmd::new(b"CN");

// -- execution --

/// Apply queued changes.
pub const AC: AtCmd = AtCmd::new(b"AC");
/// Write settings to non-volatile memory.
pub const WR: AtCmd = AtCmd::new(b"WR");
/// Restore factory defaults.
pub const RE: AtCmd = AtCmd::new(b"RE");
/// Software reset.
pub const FR: AtCmd = AtCmd::new(b"FR");
/// Force a sample of all enabled I/O lines.
pub const IS: AtCmd = AtCmd::new(b"IS");
/// Commissioning button press.
pub const CB: AtCmd = AtCmd::new(b"CB");
/// Association LED blink time; 10 makes it flash fast for identify.
pub const LT: AtCmd = AtCmd::new(b"LT");
