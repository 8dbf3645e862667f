//! Shared test fixtures: a scripted serial port, a manual clock and wire
//! helpers.
#![allow(dead_code)]

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use embedded_time::clock;
use embedded_time::fraction::Fraction;
use embedded_time::Instant;
use xbee::{Device, DeviceFlags, Error, SerialPort};

/// In-memory serial port.  Bytes pushed into `rx` are what the device
/// reads; everything the device writes lands in `tx`.
pub struct FakeSerial {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    pub tx_capacity: usize,
    pub cts: bool,
    pub rts: bool,
    pub break_set: bool,
    pub baud: u32,
}

impl FakeSerial {
    pub fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            tx: Vec::new(),
            tx_capacity: 1024,
            cts: true,
            rts: false,
            break_set: false,
            baud: 115_200,
        }
    }
}

impl SerialPort for FakeSerial {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            match self.rx.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn write(&mut self, buf: &[u8]) -> xbee::Result<usize> {
        if self.tx_free() < buf.len() {
            return Err(Error::Busy);
        }
        self.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn tx_free(&self) -> usize {
        self.tx_capacity.saturating_sub(self.tx.len())
    }

    fn flush(&mut self) {
        self.rx.clear();
        self.tx.clear();
    }

    fn set_break(&mut self, enabled: bool) {
        self.break_set = enabled;
    }

    fn cts(&self) -> bool {
        self.cts
    }

    fn set_rts(&mut self, asserted: bool) {
        self.rts = asserted;
    }

    fn set_baud(&mut self, baud: u32) -> xbee::Result<()> {
        self.baud = baud;
        Ok(())
    }
}

/// Millisecond clock advanced by hand.
#[derive(Clone, Default)]
pub struct FakeClock {
    ticks: Rc<Cell<u32>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_ms(&self, ms: u32) {
        self.ticks.set(self.ticks.get().wrapping_add(ms));
    }

    pub fn advance_secs(&self, secs: u32) {
        self.advance_ms(secs * 1000);
    }
}

impl embedded_time::Clock for FakeClock {
    type T = u32;
    const SCALING_FACTOR: Fraction = Fraction::new(1, 1000);

    fn try_now(&self) -> Result<Instant<Self>, clock::Error> {
        Ok(Instant::new(self.ticks.get()))
    }
}

pub type TestDevice = Device<FakeSerial, FakeClock>;

pub fn make_device() -> (TestDevice, FakeClock) {
    let clock = FakeClock::new();
    (Device::new(FakeSerial::new(), clock.clone()), clock)
}

/// Wrap `payload` in start byte, big-endian length and checksum.
pub fn wire_frame(payload: &[u8]) -> Vec<u8> {
    let mut v = vec![0x7E];
    v.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    v.extend_from_slice(payload);
    let sum: u8 = payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    v.push(0xFFu8.wrapping_sub(sum));
    v
}

pub fn local_at_response(frame_id: u8, cmd: &[u8; 2], status: u8, value: &[u8]) -> Vec<u8> {
    let mut p = vec![0x88, frame_id, cmd[0], cmd[1], status];
    p.extend_from_slice(value);
    wire_frame(&p)
}

pub fn remote_at_response(
    frame_id: u8,
    ieee: [u8; 8],
    network: u16,
    cmd: &[u8; 2],
    status: u8,
    value: &[u8],
) -> Vec<u8> {
    let mut p = vec![0x97, frame_id];
    p.extend_from_slice(&ieee);
    p.extend_from_slice(&network.to_be_bytes());
    p.extend_from_slice(&[cmd[0], cmd[1], status]);
    p.extend_from_slice(value);
    wire_frame(&p)
}

pub fn modem_status_frame(status: u8) -> Vec<u8> {
    wire_frame(&[0x8A, status])
}

pub fn feed(dev: &mut TestDevice, bytes: &[u8]) {
    dev.serial_mut().rx.extend(bytes.iter().copied());
}

/// Split the raw transmit capture back into frame payloads, checking the
/// checksum identity of every frame on the way.
pub fn sent_frames(tx: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut i = 0;
    while i < tx.len() {
        assert_eq!(tx[i], 0x7E, "frame must start with 0x7E");
        let len = u16::from_be_bytes([tx[i + 1], tx[i + 2]]) as usize;
        let payload = tx[i + 3..i + 3 + len].to_vec();
        let checksum = tx[i + 3 + len];
        let sum = payload
            .iter()
            .fold(checksum, |acc, &b| acc.wrapping_add(b));
        assert_eq!(sum, 0xFF, "checksum identity must hold on the wire");
        frames.push(payload);
        i += 4 + len;
    }
    frames
}

pub enum Answer {
    Value(Vec<u8>),
    Status(u8),
    Ignore,
}

/// Keep answering the device's local AT requests with `lookup` until it
/// stops sending new ones.
pub fn pump(dev: &mut TestDevice, lookup: &mut dyn FnMut(&[u8; 2]) -> Answer) {
    let mut consumed = 0;
    for _ in 0..64 {
        dev.tick().expect("tick");
        let frames = sent_frames(&dev.serial().tx);
        let fresh: Vec<Vec<u8>> = frames[consumed..].to_vec();
        consumed = frames.len();

        let mut queued = false;
        for f in &fresh {
            if f[0] != 0x08 || f[1] == 0 {
                continue;
            }
            let frame_id = f[1];
            let cmd = [f[2], f[3]];
            match lookup(&cmd) {
                Answer::Value(v) => {
                    feed(dev, &local_at_response(frame_id, &cmd, 0, &v));
                    queued = true;
                }
                Answer::Status(s) => {
                    feed(dev, &local_at_response(frame_id, &cmd, s, &[]));
                    queued = true;
                }
                Answer::Ignore => {}
            }
        }
        if !queued {
            return;
        }
    }
    panic!("device never went quiet");
}

/// Register answers for the built-in identity query.
pub fn std_query_answers(cmd: &[u8; 2]) -> Answer {
    match cmd {
        b"HV" => Answer::Value(vec![0x22, 0x00]),
        b"VR" => Answer::Value(vec![0x40, 0x59]),
        b"SH" => Answer::Value(vec![0x00, 0x13, 0xA2, 0x00]),
        b"SL" => Answer::Value(vec![0x40, 0x52, 0x2B, 0xAA]),
        b"GT" => Answer::Value(vec![0x03, 0xE8]),
        b"CT" => Answer::Value(vec![0x00, 0x64]),
        b"CC" => Answer::Value(vec![0x2B]),
        b"EO" => Answer::Value(vec![0x00]),
        b"AI" => Answer::Value(vec![0xFF]),
        b"NP" => Answer::Value(vec![0x00, 0x54]),
        b"MY" => Answer::Value(vec![0xFF, 0xFE]),
        _ => Answer::Status(0x02),
    }
}

/// Like [`std_query_answers`], but the module reports a joined,
/// authenticated network with a real 16-bit address.
pub fn joined_query_answers(cmd: &[u8; 2]) -> Answer {
    match cmd {
        b"EO" => Answer::Value(vec![0x08]),
        b"AI" => Answer::Value(vec![0x00]),
        b"MY" => Answer::Value(vec![0x12, 0x34]),
        _ => std_query_answers(cmd),
    }
}

/// Bring a fresh device through its identity query so request-table
/// tests start from a quiet state.
pub fn init_device(dev: &mut TestDevice) {
    dev.cmd_init_device().expect("cmd init");
    pump(dev, &mut |cmd| std_query_answers(cmd));
    assert!(dev.flags().contains(DeviceFlags::QUERY_DONE));
}
