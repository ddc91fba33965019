//! Bit Framer
//!
//! This module contains both halves of the physical layer:
//!
//! * The Master side, which bit-bangs frames with [send_frame], and clocks in
//!   reverse channel bytes with [read_bytes]
//! * The Slave side, which assembles frames one falling clock edge at a time
//!   in an [Assembler], shared with the main loop through a [FrameReceiver]

use core::cell::RefCell;

use embassy_sync::blocking_mutex::{raw::RawMutex, Mutex};
use embassy_time::{Duration, Instant};
use heapless::Vec;

use crate::{Command, EdgeHandler, Level, Packet, SusiHal, BROADCAST_ADDRESS};

/// Number of bits in one frame, including start and stop bits
pub const FRAME_BITS: usize = 26;

/// Maximum time between two edges of the same frame
///
/// A partially received frame is dropped once this elapses.
pub const FRAME_TIMEOUT: Duration = Duration::from_millis(8);

/// Width of the ACK pulse a Slave sends
pub const ACK_PULSE: Duration = Duration::from_millis(1);

/// The largest reply a Slave can queue on the reverse channel
///
/// This is a full CV bank window plus its CRC.
pub const MAX_REPLY: usize = crate::cv::BANK_WINDOW + 2;

const STOP_POSITION: u8 = 25;

/// The levels of a full frame, in the order they are clocked out
pub fn frame_bits(packet: &Packet) -> impl Iterator<Item = Level> {
    let bytes = packet.to_bytes();
    let data = (0..24).map(move |i| Level::from((bytes[i / 8] >> (i % 8)) & 1 != 0));
    core::iter::once(Level::Low)
        .chain(data)
        .chain(core::iter::once(Level::High))
}

/// Transmit one frame
///
/// The data line is left HIGH (released) afterwards.
pub fn send_frame<H: SusiHal>(hal: &mut H, half_bit: Duration, packet: &Packet) {
    for level in frame_bits(packet) {
        hal.set_data(level);
        clock_pulse(hal, half_bit);
    }
}

/// One full clock cycle, LOW then HIGH
pub fn clock_pulse<H: SusiHal>(hal: &mut H, half_bit: Duration) {
    hal.set_clock(Level::Low);
    hal.delay(half_bit);
    hal.set_clock(Level::High);
    hal.delay(half_bit);
}

/// Clock in one bit of the reverse channel
///
/// The Slave drives the bit on the falling edge, we sample it half a bit later.
pub fn read_bit<H: SusiHal>(hal: &mut H, half_bit: Duration) -> Level {
    hal.set_clock(Level::Low);
    hal.delay(half_bit);
    let level = hal.read_data();
    hal.set_clock(Level::High);
    hal.delay(half_bit);
    level
}

/// Clock in one byte of the reverse channel, least significant bit first
pub fn read_byte<H: SusiHal>(hal: &mut H, half_bit: Duration) -> u8 {
    (0..8).fold(0u8, |acc, i| {
        if read_bit(hal, half_bit).is_high() {
            acc | (1 << i)
        } else {
            acc
        }
    })
}

/// Clock in a full reply, then send the trailing pulse that lets the Slave
/// release the data line.
pub fn read_bytes<H: SusiHal>(hal: &mut H, half_bit: Duration, out: &mut [u8]) {
    hal.set_data(Level::High);
    for b in out.iter_mut() {
        *b = read_byte(hal, half_bit);
    }
    clock_pulse(hal, half_bit);
}

/// Send an ACK pulse, as a Slave
pub fn send_ack<H: SusiHal>(hal: &mut H) {
    hal.set_data(Level::Low);
    hal.delay(ACK_PULSE);
    hal.set_data(Level::High);
}

/// Which destination addresses an [Assembler] accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum AddressFilter {
    /// Only this address
    Exact(u8),
    /// This address, and [BROADCAST_ADDRESS]
    ExactOrBroadcast(u8),
    /// Every address, e.g. for a bus monitor
    Any,
}

impl AddressFilter {
    /// Does this filter accept `address`?
    pub fn accepts(&self, address: u8) -> bool {
        match *self {
            AddressFilter::Exact(a) => a == address,
            AddressFilter::ExactOrBroadcast(a) => a == address || address == BROADCAST_ADDRESS,
            AddressFilter::Any => true,
        }
    }
}

/// Frame assembly state machine
///
/// Fed once per falling clock edge. `position` counts the bits of the
/// current frame:
///
/// * `0`: searching for a LOW start bit
/// * `1..=24`: data bits, least significant bit first
/// * `25`: the stop bit, which must be HIGH
///
/// A finished frame lands in a single "ready" slot, which the main loop
/// empties with [Assembler::take]. While a reply is loaded, edges shift the
/// reply out instead of assembling a frame.
///
/// Every frame is inspected before the address filter. After a frame that
/// makes some Slave answer on the reverse channel (a host call, a bank read,
/// or the second half of a CV read), the assembler is muted: the reply bits
/// of whichever Slave answers are not frames, so edges are ignored until the
/// next gap longer than [FRAME_TIMEOUT].
pub struct Assembler {
    filter: AddressFilter,
    position: u8,
    buf: [u8; 3],
    last_edge: Option<Instant>,
    ready: Option<Packet>,
    reply: Vec<u8, MAX_REPLY>,
    reply_bit: usize,
    muted: bool,
    /// Address and direction of a CV access waiting for its second packet
    pending_cv: Option<(u8, bool)>,
}

impl Assembler {
    /// Create a new assembler, searching for a start bit
    pub const fn new(filter: AddressFilter) -> Self {
        Self {
            filter,
            position: 0,
            buf: [0; 3],
            last_edge: None,
            ready: None,
            reply: Vec::new(),
            reply_bit: 0,
            muted: false,
            pending_cv: None,
        }
    }

    /// Change the address filter
    pub fn set_filter(&mut self, filter: AddressFilter) {
        self.filter = filter;
    }

    /// Feed one falling edge, returning the level to drive onto the data line
    pub fn on_falling_edge(&mut self, data: Level, now: Instant) -> Option<Level> {
        let stale = self
            .last_edge
            .map(|t| now.saturating_duration_since(t) > FRAME_TIMEOUT)
            .unwrap_or(false);
        self.last_edge = Some(now);

        if !self.reply.is_empty() {
            if !stale {
                return self.shift_reply();
            }
            susi_warn!("Dropping stale reply of {=usize} bytes", self.reply.len());
            self.clear_reply();
        }

        if stale {
            if self.position != 0 {
                susi_debug!("Dropping stale frame at bit {=u8}", self.position);
                self.restart();
            }
            self.muted = false;
        }
        if self.muted {
            return None;
        }

        match self.position {
            0 => {
                if data.is_low() {
                    self.buf = [0; 3];
                    self.position = 1;
                }
            }
            STOP_POSITION => {
                self.finish(data);
                self.restart();
            }
            pos => {
                let idx = usize::from(pos - 1);
                if data.is_high() {
                    self.buf[idx / 8] |= 1 << (idx % 8);
                }
                self.position += 1;
            }
        }
        None
    }

    fn finish(&mut self, stop: Level) {
        if stop.is_low() {
            susi_debug!("Bad stop bit, dropping frame");
            return;
        }
        let packet = Packet::from_bytes(self.buf);
        if self.opens_reply(&packet) {
            susi_trace!("Reverse channel follows, muted until sync gap");
            self.muted = true;
        }
        if !self.filter.accepts(packet.address) {
            return;
        }
        if self.ready.is_some() {
            susi_warn!("Overrun, dropping packet for {=u8}", packet.address);
            return;
        }
        self.ready = Some(packet);
    }

    /// Will some Slave answer `packet` on the reverse channel?
    ///
    /// Tracks two-packet CV accesses for every address, mirroring how a
    /// Slave pairs them: host calls never complete an access.
    fn opens_reply(&mut self, packet: &Packet) -> bool {
        if packet.command == Command::BIDI_HOST_CALL {
            return true;
        }
        if let Some((_, write)) = self.pending_cv.filter(|(a, _)| *a == packet.address) {
            self.pending_cv = None;
            return !write;
        }
        match packet.kind() {
            Ok(Command::ReadCv) => self.pending_cv = Some((packet.address, false)),
            Ok(Command::WriteCv) => self.pending_cv = Some((packet.address, true)),
            Ok(Command::CvAccessBanked) => {
                self.pending_cv = Some((packet.address, packet.data & 0x80 != 0))
            }
            Ok(Command::ReadCvBank(_)) => return true,
            _ => {}
        }
        false
    }

    fn restart(&mut self) {
        self.position = 0;
        self.buf = [0; 3];
    }

    fn shift_reply(&mut self) -> Option<Level> {
        if self.reply_bit >= self.reply.len() * 8 {
            // The trailing pulse: release the line and go back to listening
            self.clear_reply();
            return None;
        }
        let byte = self.reply[self.reply_bit / 8];
        let bit = (byte >> (self.reply_bit % 8)) & 1;
        self.reply_bit += 1;
        Some(Level::from(bit != 0))
    }

    fn clear_reply(&mut self) {
        self.reply.clear();
        self.reply_bit = 0;
    }

    /// Take the finished packet, if any
    pub fn take(&mut self) -> Option<Packet> {
        self.ready.take()
    }

    /// Is a finished packet waiting?
    pub fn is_ready(&self) -> bool {
        self.ready.is_some()
    }

    /// Load a reply to be shifted out on the next clock edges
    ///
    /// Replies longer than [MAX_REPLY] are dropped.
    pub fn load_reply(&mut self, bytes: &[u8], now: Instant) {
        self.clear_reply();
        if self.reply.extend_from_slice(bytes).is_err() {
            susi_error!("Reply of {=usize} bytes too long", bytes.len());
            self.clear_reply();
            return;
        }
        self.last_edge = Some(now);
    }

    /// Is a reply still waiting to be clocked out?
    pub fn reply_pending(&self) -> bool {
        !self.reply.is_empty()
    }
}

/// The handoff between the clock interrupt and the main loop
///
/// The interrupt handler is the only writer of the frame state, through
/// [EdgeHandler::on_clock_falling]. The main loop copies out finished packets
/// with [FrameReceiver::take]. Every access goes through a blocking mutex, with
/// a [`CriticalSectionRawMutex`][embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex]
/// this masks interrupts for the few instructions it takes.
///
/// Intended to be used as a static:
///
/// ```rust
/// use susi_comms::framer::{AddressFilter, FrameReceiver};
/// use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
///
/// static RECEIVER: FrameReceiver<CriticalSectionRawMutex> =
///     FrameReceiver::new(AddressFilter::Any);
/// ```
pub struct FrameReceiver<R: RawMutex + 'static> {
    inner: Mutex<R, RefCell<Assembler>>,
}

impl<R: RawMutex + 'static> FrameReceiver<R> {
    /// Create a new receiver
    pub const fn new(filter: AddressFilter) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Assembler::new(filter))),
        }
    }

    fn with<U>(&self, f: impl FnOnce(&mut Assembler) -> U) -> U {
        self.inner.lock(|a| f(&mut a.borrow_mut()))
    }

    /// Change the address filter
    pub fn set_filter(&self, filter: AddressFilter) {
        self.with(|a| a.set_filter(filter))
    }

    /// Take the finished packet, if any
    pub fn take(&self) -> Option<Packet> {
        self.with(|a| a.take())
    }

    /// Is a finished packet waiting?
    pub fn is_ready(&self) -> bool {
        self.with(|a| a.is_ready())
    }

    /// Load a reply for the reverse channel
    pub fn load_reply(&self, bytes: &[u8], now: Instant) {
        self.with(|a| a.load_reply(bytes, now))
    }

    /// Is a reply still waiting to be clocked out?
    pub fn reply_pending(&self) -> bool {
        self.with(|a| a.reply_pending())
    }
}

impl<R: RawMutex + 'static> EdgeHandler for FrameReceiver<R> {
    fn on_clock_falling(&self, data: Level, now: Instant) -> Option<Level> {
        self.with(|a| a.on_falling_edge(data, now))
    }
}
