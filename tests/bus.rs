//! End to end exchanges between a Master and Slaves on a simulated bus

mod common;

use std::{cell::RefCell, rc::Rc};

use common::bus;
use embassy_time::Duration;
use susi_comms::{
    bidi::{header, BidiMessage},
    crc::crc16_ccitt,
    cv::BANK_WINDOW,
    framer::{self, clock_pulse, frame_bits},
    Command, Error, Packet, SusiHal,
};

const HALF_BIT: Duration = Duration::from_micros(10);

#[test]
fn set_speed() {
    let mut bus = bus(&[5]);
    assert_eq!(bus.master.set_speed(5, 100, false), Ok(()));
    assert_eq!(bus.slave(0).speed(), 100);
    assert!(!bus.slave(0).direction());

    assert_eq!(bus.master.set_speed(5, 12, true), Ok(()));
    assert_eq!(bus.slave(0).speed(), 12);
    assert!(bus.slave(0).direction());
}

#[test]
fn write_then_read_cv() {
    let mut bus = bus(&[10]);
    assert_eq!(bus.master.write_cv(10, 1024, 255), Ok(()));
    assert_eq!(bus.slave(0).read_cv(1024), 255);
    assert_eq!(bus.master.read_cv(10, 1024), Ok(255));

    bus.slave(0).write_cv(30, 0x5A);
    assert_eq!(bus.master.read_cv(10, 30), Ok(0x5A));
    // Never written
    assert_eq!(bus.master.read_cv(10, 31), Ok(0));
}

#[test]
fn banked_cv_access() {
    let mut bus = bus(&[10]);
    assert_eq!(bus.master.write_cv(10, 2000, 7), Ok(()));
    assert_eq!(bus.slave(0).read_cv(2000), 7);
    assert_eq!(bus.master.read_cv(10, 2000), Ok(7));
}

#[test]
fn identity_cvs() {
    let mut bus = bus(&[10]);
    assert_eq!(bus.master.read_cv(10, 897), Ok(10));
    assert_eq!(bus.master.read_cv(10, 900), Ok(0x97));
    assert_eq!(bus.master.read_cv(10, 901), Ok(0x02));

    // Select the hardware ID
    assert_eq!(bus.master.write_cv(10, 1021, 1), Ok(()));
    assert_eq!(bus.slave(0).bank_select(), 1);
    assert_eq!(bus.master.read_cv(10, 900), Ok(0x34));
}

#[test]
fn read_cv_bank() {
    let mut bus = bus(&[10]);
    {
        let mut slave = bus.slave(0);
        slave.write_cv(81, 0x11);
        slave.write_cv(100, 0x22);
        slave.write_cv(120, 0x33);
    }
    let window = bus.master.read_cv_bank(10, 2).unwrap();

    let mut expected = [0u8; BANK_WINDOW];
    expected[0] = 0x11;
    expected[19] = 0x22;
    expected[39] = 0x33;
    assert_eq!(window, expected);
    assert_ne!(crc16_ccitt(&window), crc16_ccitt(&[0u8; BANK_WINDOW]));
}

#[test]
fn bank_read_is_not_executed_by_other_slaves() {
    let mut bus = bus(&[10, 5]);
    {
        // Clocked out LSB first, these bytes contain a valid frame setting
        // slave 5 to speed 100
        let mut slave = bus.slave(0);
        for (cv, value) in [(1, 0x0A), (2, 0x04), (3, 0xC8), (4, 0x02)] {
            slave.write_cv(cv, value);
        }
    }
    let window = bus.master.read_cv_bank(10, 0).unwrap();
    assert_eq!(window[..4], [0x0A, 0x04, 0xC8, 0x02]);
    assert_eq!(bus.slave(1).speed(), 0);
    assert!(!bus.slave(1).available());

    assert_eq!(bus.master.set_speed(5, 7, true), Ok(()));
    assert_eq!(bus.slave(1).speed(), 7);
}

#[test]
fn cv_read_reply_is_not_executed_by_other_slaves() {
    let mut bus = bus(&[10, 5]);
    bus.slave(0).write_cv(8, 0x05);
    assert_eq!(bus.master.read_cv(10, 8), Ok(0x05));
    assert_eq!(bus.master.set_speed(5, 30, false), Ok(()));
    assert_eq!(bus.slave(1).speed(), 30);
    assert_eq!(bus.master.read_cv(10, 8), Ok(0x05));
}

#[test]
fn handshake_after_write_to_module_0() {
    let mut bus = bus(&[0]);
    // Only the first half of a CV write
    let first = Packet::new(0, Command::WRITE_CV, 0);
    assert_eq!(bus.master.send_packet(&first, true), Ok(()));

    assert_eq!(bus.master.perform_handshake(), Ok(()));
    assert_eq!(bus.master.bidi_slaves(), &[0]);
    assert!(bus.slave(0).is_bidi_enabled());
    assert!(bus.slave(0).cv_store().is_empty());
}

#[test]
fn function_callback() {
    let mut bus = bus(&[10]);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let cb: &'static mut dyn FnMut(u8, bool) =
        Box::leak(Box::new(move |f: u8, on: bool| sink.borrow_mut().push((f, on))));
    bus.slave(0).on_function_change(cb);

    assert_eq!(bus.master.set_function(10, 3, true), Ok(()));
    assert_eq!(bus.master.set_function(10, 20, true), Ok(()));
    assert_eq!(bus.master.set_function(10, 3, false), Ok(()));

    assert_eq!(*seen.borrow(), vec![(3, true), (20, true), (3, false)]);
    assert!(!bus.master.function(10, 3));
    assert!(bus.master.function(10, 20));
    assert!(bus.slave(0).function(20));
}

#[test]
fn absent_slave_times_out() {
    let mut bus = bus(&[5]);
    assert_eq!(bus.master.set_speed(6, 1, true), Err(Error::Timeout));
    assert_eq!(bus.master.write_cv(6, 1, 1), Err(Error::Timeout));
    assert!(!bus.master.function(6, 0));
    assert_eq!(bus.slave(0).speed(), 0);

    let mut empty = common::bus(&[]);
    assert_eq!(empty.master.set_function(1, 1, true), Err(Error::Timeout));
}

#[test]
fn handshake_registers_responders() {
    // Address 10 is not a module number, and never answers a host call
    let mut bus = bus(&[1, 10]);
    assert_eq!(bus.master.perform_handshake(), Ok(()));
    assert_eq!(bus.master.bidi_slaves(), &[1]);
    assert!(bus.slave(0).is_bidi_enabled());
    assert!(!bus.slave(1).is_bidi_enabled());

    assert_eq!(bus.master.perform_handshake(), Err(Error::SlaveAlreadyExists));
}

#[test]
fn handshake_with_two_modules() {
    let mut bus = bus(&[2, 1]);
    assert_eq!(bus.master.perform_handshake(), Ok(()));
    assert_eq!(bus.master.bidi_slaves(), &[1, 2]);

    // Both still receive normal commands after the reverse channel traffic
    assert_eq!(bus.master.set_speed(1, 10, true), Ok(()));
    assert_eq!(bus.master.set_speed(2, 20, true), Ok(()));
    assert_eq!(bus.slave(1).speed(), 10);
    assert_eq!(bus.slave(0).speed(), 20);
}

#[test]
fn poll_priority() {
    let mut bus = bus(&[3]);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let cb: &'static mut dyn FnMut(u8, [u8; 4]) = Box::leak(Box::new(
        move |module: u8, raw: [u8; 4]| sink.borrow_mut().push((module, raw)),
    ));
    bus.master.on_bidi_response(cb);

    bus.master.perform_handshake().unwrap();
    {
        let mut slave = bus.slave(0);
        slave.queue_message(BidiMessage::AutoSpeed(77));
        slave.raise_status(0x81);
    }
    for _ in 0..3 {
        assert_eq!(bus.master.poll_slaves(), 1);
    }

    let answers: Vec<(u8, BidiMessage)> = seen
        .borrow()
        .iter()
        .map(|(m, raw)| (*m, BidiMessage::from_bytes(*raw)))
        .collect();
    assert_eq!(
        answers,
        vec![
            (3, BidiMessage::AutoSpeed(77)),
            (3, BidiMessage::Status(0x81)),
            (3, BidiMessage::Idle),
        ]
    );
    assert_eq!(seen.borrow()[2].1, [header::IDLE, 0, header::IDLE, 0]);
}

#[test]
fn stale_partial_frame_then_good_frame() {
    let mut bus = bus(&[5]);
    let abandoned = Packet::new(5, 0x02, 0x7F);
    {
        let hal = bus.master.hal_mut();
        for level in frame_bits(&abandoned).take(12) {
            hal.set_data(level);
            clock_pulse(hal, HALF_BIT);
        }
        hal.set_data(susi_comms::Level::High);
        hal.delay_ms(9);
    }

    let good = Packet::new(5, 0x02, 0x80 | 42);
    framer::send_frame(bus.master.hal_mut(), HALF_BIT, &good);
    assert!(bus.slave(0).available());
    assert_eq!(bus.slave(0).poll(), Some(good));
    assert_eq!(bus.slave(0).speed(), 42);
}

#[test]
fn master_resyncs_after_partial_frame() {
    let mut bus = bus(&[5]);
    {
        let hal = bus.master.hal_mut();
        for level in frame_bits(&Packet::new(5, 0x60, 0x81)).take(7) {
            hal.set_data(level);
            clock_pulse(hal, HALF_BIT);
        }
        hal.set_data(susi_comms::Level::High);
    }
    assert_eq!(bus.master.set_speed(5, 99, false), Ok(()));
    assert_eq!(bus.slave(0).speed(), 99);
    assert!(!bus.slave(0).function(1));
}
