//! Device facade: reset and awake hooks, mode tracking.

mod common;

use std::sync::Mutex;

use common::*;
use xbee::{DeviceFlags, Error, Mode};

#[test]
fn reset_pulses_the_hook_and_clears_join_state() {
    static PULSES: Mutex<Vec<bool>> = Mutex::new(Vec::new());
    fn reset_hook(_dev: &mut TestDevice, asserted: bool) {
        PULSES.lock().unwrap().push(asserted);
    }

    let (mut dev, _clock) = make_device();
    assert_eq!(dev.reset(), Err(Error::NotImplemented));

    dev.cmd_init_device().unwrap();
    pump(&mut dev, &mut |cmd| joined_query_answers(cmd));
    assert!(dev.flags().contains(DeviceFlags::JOINED));
    assert_eq!(dev.network_address(), 0x1234);

    dev.set_reset_hook(Some(reset_hook));
    dev.reset().unwrap();

    assert_eq!(&PULSES.lock().unwrap()[..], &[true, false]);
    assert!(!dev.flags().contains(DeviceFlags::JOINED));
    assert_eq!(dev.network_address(), 0xFFFE);
}

#[test]
fn awake_probe_defaults_to_true() {
    fn asleep(_dev: &TestDevice) -> bool {
        false
    }

    let (mut dev, _clock) = make_device();
    assert!(dev.is_awake());
    dev.set_awake_hook(Some(asleep));
    assert!(!dev.is_awake());
    dev.set_awake_hook(None);
    assert!(dev.is_awake());
}

#[test]
fn mode_is_tracked_but_not_driven() {
    let (mut dev, _clock) = make_device();
    assert_eq!(dev.mode(), Mode::Unknown);
    dev.set_mode(Mode::Api);
    assert_eq!(dev.mode(), Mode::Api);
}

#[test]
fn frame_id_wraps_around_zero() {
    let (mut dev, _clock) = make_device();
    let mut last = 0;
    for _ in 0..300 {
        let id = dev.next_frame_id();
        assert_ne!(id, 0, "0 is reserved for no-reply frames");
        if last == 255 {
            assert_eq!(id, 1);
        }
        last = id;
    }
}
