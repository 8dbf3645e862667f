//! Identity query and command-list engine.

mod common;

use core::mem::offset_of;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::*;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use xbee::{commands, query, CmdResponse, DeviceFlags, Error, IeeeAddr, ListEntry, ListStatus};

#[test]
fn identity_query_populates_the_device() {
    let (mut dev, _clock) = make_device();
    dev.cmd_init_device().unwrap();
    assert!(dev.flags().contains(DeviceFlags::QUERY_IN_PROGRESS));

    pump(&mut dev, &mut |cmd| joined_query_answers(cmd));

    assert_eq!(dev.query_status().unwrap(), ListStatus::Done);
    let flags = dev.flags();
    assert!(flags.contains(DeviceFlags::QUERY_DONE));
    assert!(!flags.contains(DeviceFlags::QUERY_IN_PROGRESS));
    assert!(!flags.contains(DeviceFlags::QUERY_ERROR));

    assert_eq!(dev.hardware_version(), 0x2200);
    assert_eq!(
        dev.hardware_version() & query::HARDWARE_MASK,
        query::HARDWARE_S2C
    );
    assert_eq!(dev.firmware_version(), 0x4059);
    assert_eq!(
        dev.ieee(),
        IeeeAddr([0x00, 0x13, 0xA2, 0x00, 0x40, 0x52, 0x2B, 0xAA])
    );
    assert_eq!(dev.network_address(), 0x1234);
    assert_eq!(dev.max_payload(), 0x54);

    // ATAI == 0 and the EO authentication bit drive the join flags
    assert!(flags.contains(DeviceFlags::JOINED));
    assert!(flags.contains(DeviceFlags::AUTH_ENABLED));
    assert!(flags.contains(DeviceFlags::AUTHENTICATED));
    // VR 0x4059: S2C ZigBee stack
    assert!(flags.contains(DeviceFlags::ZIGBEE));
    assert!(!flags.contains(DeviceFlags::DIGIMESH));
}

#[test]
fn unjoined_module_reports_no_join_flags() {
    let (mut dev, _clock) = make_device();
    init_device(&mut dev);

    let flags = dev.flags();
    assert!(flags.contains(DeviceFlags::QUERY_DONE));
    assert!(!flags.contains(DeviceFlags::JOINED));
    assert!(!flags.contains(DeviceFlags::AUTHENTICATED));
    assert!(!flags.contains(DeviceFlags::AUTH_ENABLED));
    assert_eq!(dev.network_address(), 0xFFFE);
}

#[test]
fn query_status_before_init_is_not_found() {
    let (mut dev, _clock) = make_device();
    assert_eq!(dev.query_status(), Err(Error::NotFound));
}

#[test]
fn query_timeout_without_join_reports_error() {
    let (mut dev, clock) = make_device();
    dev.cmd_init_device().unwrap();

    // answer everything up to ATAI, then go silent
    pump(&mut dev, &mut |cmd| match cmd {
        b"AI" => Answer::Ignore,
        other => std_query_answers(other),
    });
    assert!(dev.flags().contains(DeviceFlags::QUERY_IN_PROGRESS));

    clock.advance_secs(3);
    dev.tick().unwrap();

    assert_eq!(dev.query_status().unwrap(), ListStatus::Timeout);
    let flags = dev.flags();
    assert!(flags.contains(DeviceFlags::QUERY_ERROR));
    assert!(!flags.contains(DeviceFlags::QUERY_IN_PROGRESS));
    assert!(!flags.contains(DeviceFlags::QUERY_REFRESH));

    // the partial run still captured the identity registers
    assert_eq!(dev.hardware_version(), 0x2200);
    assert_eq!(dev.firmware_version(), 0x4059);
}

#[test]
fn query_timeout_while_joined_relaunches_volatile_subset() {
    let (mut dev, clock) = make_device();
    dev.cmd_init_device().unwrap();

    // the network reports a join while the query is still running
    feed(&mut dev, &modem_status_frame(0x02));
    pump(&mut dev, &mut |cmd| match cmd {
        b"AI" => Answer::Ignore,
        other => std_query_answers(other),
    });
    assert!(dev.flags().contains(DeviceFlags::JOINED));
    assert!(dev.flags().contains(DeviceFlags::QUERY_REFRESH));

    // ATAI times out; joined with no network address forces a refresh
    clock.advance_secs(3);
    dev.tick().unwrap();
    assert!(dev.flags().contains(DeviceFlags::QUERY_IN_PROGRESS));
    let frame = sent_frames(&dev.serial().tx).pop().unwrap();
    assert_eq!(&frame[2..4], b"NP", "refresh starts at the volatile tail");

    pump(&mut dev, &mut |cmd| match cmd {
        b"NP" => Answer::Value(vec![0x00, 0x54]),
        b"MY" => Answer::Value(vec![0x12, 0x34]),
        _ => Answer::Ignore,
    });

    assert_eq!(dev.query_status().unwrap(), ListStatus::Done);
    assert!(dev.flags().contains(DeviceFlags::QUERY_DONE));
    assert_eq!(dev.network_address(), 0x1234);
}

#[test]
fn join_notification_refreshes_the_volatile_registers() {
    let (mut dev, _clock) = make_device();
    init_device(&mut dev);
    assert_eq!(dev.network_address(), 0xFFFE);

    feed(&mut dev, &modem_status_frame(0x02));
    dev.tick().unwrap();
    assert!(dev.flags().contains(DeviceFlags::JOINED));
    assert!(dev.flags().contains(DeviceFlags::QUERY_IN_PROGRESS));

    pump(&mut dev, &mut |cmd| match cmd {
        b"NP" => Answer::Value(vec![0x00, 0x54]),
        b"MY" => Answer::Value(vec![0x56, 0x78]),
        _ => Answer::Ignore,
    });
    assert_eq!(dev.network_address(), 0x5678);
    assert!(dev.flags().contains(DeviceFlags::QUERY_DONE));
}

#[test]
fn disassociation_clears_join_state() {
    let (mut dev, _clock) = make_device();
    dev.cmd_init_device().unwrap();
    pump(&mut dev, &mut |cmd| joined_query_answers(cmd));
    assert!(dev.flags().contains(DeviceFlags::JOINED));
    assert_eq!(dev.network_address(), 0x1234);

    feed(&mut dev, &modem_status_frame(0x03));
    dev.tick().unwrap();

    assert!(!dev.flags().contains(DeviceFlags::JOINED));
    assert!(!dev.flags().contains(DeviceFlags::AUTHENTICATED));
    assert_eq!(dev.network_address(), 0xFFFE);
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct Profile {
    pan_id: u16,
    power: u8,
    resv: u8,
}

#[test]
fn command_list_sets_and_copies_through_the_base_image() {
    static FINAL: AtomicUsize = AtomicUsize::new(0);
    static DB_SEEN: AtomicUsize = AtomicUsize::new(0);
    fn on_done(_resp: &CmdResponse<'_>, entry: Option<&ListEntry>, _base: &mut [u8]) {
        assert!(entry.is_some());
        FINAL.fetch_add(1, Ordering::SeqCst);
    }
    fn on_db(resp: &CmdResponse<'_>, entry: Option<&ListEntry>, base: &mut [u8]) {
        assert_eq!(entry.unwrap().flags, 1);
        assert!(!resp.timed_out());
        // the default copy runs before the entry callback
        assert_eq!(base[offset_of!(Profile, power)], 0x28);
        DB_SEEN.fetch_add(1, Ordering::SeqCst);
    }

    static PROGRAM: &[ListEntry] = &[
        ListEntry::set_be(commands::ID, offset_of!(Profile, pan_id), 2),
        ListEntry::set_imm(commands::PL, 4),
        ListEntry::copy_be(commands::DB, offset_of!(Profile, power), 1)
            .with_flags(1)
            .with_callback(on_db),
        ListEntry::end_cb(on_done),
    ];

    let (mut dev, _clock) = make_device();
    init_device(&mut dev);

    let profile = Profile {
        pan_id: 0x3332,
        power: 0,
        resv: 0,
    };
    let list = dev
        .cmd_list_execute(PROGRAM, profile.as_bytes(), None)
        .unwrap();
    assert_eq!(dev.cmd_list_status(list).unwrap(), ListStatus::Running);

    pump(&mut dev, &mut |cmd| match cmd {
        b"ID" | b"PL" => Answer::Value(vec![]),
        b"DB" => Answer::Value(vec![0x28]),
        _ => Answer::Ignore,
    });

    assert_eq!(dev.cmd_list_status(list).unwrap(), ListStatus::Done);
    assert_eq!(FINAL.load(Ordering::SeqCst), 1);
    assert_eq!(DB_SEEN.load(Ordering::SeqCst), 1);

    // set entries put the base fields on the wire
    let frames = sent_frames(&dev.serial().tx);
    let id_frame = frames.iter().find(|f| &f[2..4] == b"ID").unwrap();
    assert_eq!(&id_frame[4..], &[0x33, 0x32], "host order re-encoded BE");
    let pl_frame = frames.iter().find(|f| &f[2..4] == b"PL").unwrap();
    assert_eq!(&pl_frame[4..], &[4]);

    // copy entries land back in the image
    let mut bytes = [0u8; 4];
    let n = dev.cmd_list_result(list, &mut bytes).unwrap();
    let updated = Profile::read_from_bytes(&bytes[..n]).unwrap();
    assert_eq!(
        updated,
        Profile {
            pan_id: 0x3332,
            power: 0x28,
            resv: 0,
        }
    );

    dev.cmd_list_release(list).unwrap();
    assert_eq!(dev.cmd_list_status(list), Err(Error::InvalidArgument));
}

#[test]
fn command_list_contexts_are_limited() {
    static PROGRAM: &[ListEntry] = &[
        ListEntry::copy_be(commands::DB, offset_of!(Profile, power), 1),
        ListEntry::end(),
    ];

    let (mut dev, _clock) = make_device();
    init_device(&mut dev);
    let base = [0u8; 4];

    // the identity query keeps one of the two contexts
    let first = dev.cmd_list_execute(PROGRAM, &base, None).unwrap();
    assert_eq!(
        dev.cmd_list_execute(PROGRAM, &base, None),
        Err(Error::NoSpace)
    );

    dev.cmd_list_release(first).unwrap();
    dev.cmd_list_execute(PROGRAM, &base, None).unwrap();
}

#[test]
fn busy_execute_leaves_no_context_behind() {
    static PROGRAM: &[ListEntry] = &[
        ListEntry::copy_be(commands::DB, offset_of!(Profile, power), 1),
        ListEntry::end(),
    ];

    let (mut dev, _clock) = make_device();
    init_device(&mut dev);
    let base = [0u8; 4];

    dev.serial_mut().cts = false;
    assert_eq!(
        dev.cmd_list_execute(PROGRAM, &base, None),
        Err(Error::Busy)
    );

    dev.serial_mut().cts = true;
    let list = dev.cmd_list_execute(PROGRAM, &base, None).unwrap();
    assert_eq!(dev.cmd_list_status(list).unwrap(), ListStatus::Running);
}

#[test]
fn terminating_command_is_sent_and_its_response_discarded() {
    static PROGRAM: &[ListEntry] = &[
        ListEntry::copy_be(commands::DB, offset_of!(Profile, power), 1),
        ListEntry::end_cmd(commands::WR),
    ];

    let (mut dev, _clock) = make_device();
    init_device(&mut dev);
    let base = [0u8; 4];

    let list = dev.cmd_list_execute(PROGRAM, &base, None).unwrap();
    pump(&mut dev, &mut |cmd| match cmd {
        b"DB" => Answer::Value(vec![0x28]),
        _ => Answer::Ignore,
    });

    assert_eq!(dev.cmd_list_status(list).unwrap(), ListStatus::Done);
    let frames = sent_frames(&dev.serial().tx);
    let wr = frames.iter().find(|f| &f[2..4] == b"WR").unwrap();

    // a late answer to the terminator is a harmless no-op
    let frame_id = wr[1];
    feed(&mut dev, &local_at_response(frame_id, b"WR", 0, &[]));
    dev.tick().unwrap();
    assert_eq!(dev.cmd_list_status(list).unwrap(), ListStatus::Done);
}

#[test]
fn list_timeout_invokes_the_final_callback_once() {
    static FINAL: AtomicUsize = AtomicUsize::new(0);
    fn on_done(resp: &CmdResponse<'_>, entry: Option<&ListEntry>, _base: &mut [u8]) {
        assert!(resp.timed_out());
        assert!(entry.is_some());
        FINAL.fetch_add(1, Ordering::SeqCst);
    }

    static PROGRAM: &[ListEntry] = &[
        ListEntry::copy_be(commands::DB, offset_of!(Profile, power), 1),
        ListEntry::end_cb(on_done),
    ];

    let (mut dev, clock) = make_device();
    init_device(&mut dev);
    let base = [0u8; 4];

    let list = dev.cmd_list_execute(PROGRAM, &base, None).unwrap();
    clock.advance_secs(3);
    dev.tick().unwrap();

    assert_eq!(dev.cmd_list_status(list).unwrap(), ListStatus::Timeout);
    assert_eq!(FINAL.load(Ordering::SeqCst), 1);

    clock.advance_secs(3);
    dev.tick().unwrap();
    assert_eq!(FINAL.load(Ordering::SeqCst), 1);
}

#[test]
fn malformed_programs_are_rejected() {
    static UNTERMINATED: &[ListEntry] = &[ListEntry::set_imm(commands::PL, 4)];
    static EMPTY_FIRST: &[ListEntry] = &[ListEntry::end()];

    let (mut dev, _clock) = make_device();
    init_device(&mut dev);
    let base = [0u8; 4];

    assert_eq!(
        dev.cmd_list_execute(UNTERMINATED, &base, None),
        Err(Error::InvalidArgument)
    );
    assert_eq!(
        dev.cmd_list_execute(EMPTY_FIRST, &base, None),
        Err(Error::InvalidArgument)
    );

    let oversized = [0u8; 65];
    static PROGRAM: &[ListEntry] = &[
        ListEntry::set_imm(commands::PL, 4),
        ListEntry::end(),
    ];
    assert_eq!(
        dev.cmd_list_execute(PROGRAM, &oversized, None),
        Err(Error::MessageTooBig)
    );
}
