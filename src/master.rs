//! Master Interface
//!
//! The Master drives the clock line, sends every packet, and decides when a
//! Slave may use the reverse channel. All operations are blocking: they
//! return once the exchange finished, or failed.

use core::marker::PhantomData;

use embassy_time::{Duration, Instant};
use heapless::Vec;

use crate::{
    bidi::{self, BidiMessage, BUS_IDLE},
    crc::crc16_ccitt,
    cv::BANK_WINDOW,
    framer,
    registry::{Registry, MAX_SLAVES},
    Command, CvBank, Error, Level, Packet, SusiHal,
};

/// Bus timing used by a [Master]
///
/// All items have defaults matching RCN-600, implement this trait on a marker
/// type to override some of them:
///
/// ```rust
/// use embassy_time::Duration;
/// use susi_comms::master::MasterCfg;
///
/// struct SlowBus;
///
/// impl MasterCfg for SlowBus {
///     const HALF_BIT: Duration = Duration::from_micros(20);
/// }
/// ```
pub trait MasterCfg {
    /// Half of one clock period
    const HALF_BIT: Duration = Duration::from_micros(10);

    /// Maximum gap between two packets before a Slave may have lost sync
    const INTER_BYTE_TIMEOUT: Duration = Duration::from_millis(7);

    /// Idle time inserted to resynchronize all Slaves
    const SYNC_GAP: Duration = Duration::from_millis(9);

    /// Packets sent back to back before a [MasterCfg::SYNC_GAP] is forced
    const PACKETS_PER_SYNC: u8 = 20;

    /// How long to wait for an ACK pulse to start
    const ACK_TIMEOUT: Duration = Duration::from_millis(20);

    /// Shortest accepted ACK pulse
    const ACK_MIN: Duration = Duration::from_micros(500);

    /// Longest accepted ACK pulse
    const ACK_MAX: Duration = Duration::from_millis(7);

    /// Sampling interval of the data line while waiting for an ACK
    const ACK_POLL: Duration = Duration::from_micros(10);
}

/// The default RCN-600 timing
pub struct DefaultTiming;

impl MasterCfg for DefaultTiming {}

/// A SUSI Master
///
/// The Master owns its [SusiHal]. Callbacks registered on it borrow for `'a`.
pub struct Master<'a, H: SusiHal, C: MasterCfg = DefaultTiming> {
    hal: H,
    last_packet: Option<Instant>,
    packets_since_sync: u8,
    registry: Registry,
    on_bidi: Option<&'a mut dyn FnMut(u8, [u8; 4])>,
    _cfg: PhantomData<C>,
}

/// Instantiation and configuration
impl<'a, H: SusiHal, C: MasterCfg> Master<'a, H, C> {
    /// Create a new Master
    ///
    /// Call [Master::begin()] before the first exchange.
    pub fn new(hal: H) -> Self {
        Self {
            hal,
            last_packet: None,
            packets_since_sync: 0,
            registry: Registry::new(),
            on_bidi: None,
            _cfg: PhantomData,
        }
    }

    /// Release both lines
    pub fn begin(&mut self) {
        self.hal.set_clock(Level::High);
        self.hal.set_data(Level::High);
    }

    /// Forget all known Slaves, and force a sync gap before the next packet
    pub fn reset(&mut self) {
        self.registry.reset();
        self.last_packet = None;
        self.packets_since_sync = 0;
    }

    /// Register the handler for BiDi answers gathered by [Master::poll_slaves()]
    ///
    /// The handler receives the module number and the raw four bytes.
    pub fn on_bidi_response(&mut self, cb: &'a mut dyn FnMut(u8, [u8; 4])) {
        self.on_bidi = Some(cb);
    }

    /// Borrow the HAL
    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// Mutably borrow the HAL
    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    /// Give back the HAL
    pub fn release(self) -> H {
        self.hal
    }
}

/// Low level bus access
impl<'a, H: SusiHal, C: MasterCfg> Master<'a, H, C> {
    /// Send one packet, optionally waiting for the ACK
    ///
    /// A sync gap is inserted first if the bus was idle for longer than
    /// [MasterCfg::INTER_BYTE_TIMEOUT], and after every
    /// [MasterCfg::PACKETS_PER_SYNC] packets.
    pub fn send_packet(&mut self, packet: &Packet, expect_ack: bool) -> Result<(), Error> {
        let now = self.hal.now();
        let idle = self
            .last_packet
            .map(|t| now.saturating_duration_since(t) > C::INTER_BYTE_TIMEOUT)
            .unwrap_or(true);
        if idle {
            self.hal.delay(C::SYNC_GAP);
        }
        if self.packets_since_sync >= C::PACKETS_PER_SYNC {
            self.hal.delay(C::SYNC_GAP);
            self.packets_since_sync = 0;
        }

        susi_trace!(
            "Sending {=u8} {=u8} {=u8}",
            packet.address,
            packet.command,
            packet.data
        );
        framer::send_frame(&mut self.hal, C::HALF_BIT, packet);
        self.last_packet = Some(self.hal.now());
        self.packets_since_sync = self.packets_since_sync.saturating_add(1);

        if !expect_ack {
            return Ok(());
        }
        let res = self.wait_for_ack();
        if res.is_err() {
            // A Slave may still be waiting to answer on the reverse channel,
            // the others stay muted until a sync gap.
            self.last_packet = None;
        }
        res
    }

    fn wait_for_ack(&mut self) -> Result<(), Error> {
        let start = self.hal.now();
        while self.hal.read_data().is_high() {
            if self.hal.now().saturating_duration_since(start) >= C::ACK_TIMEOUT {
                susi_debug!("No ACK");
                return Err(Error::Timeout);
            }
            self.hal.delay(C::ACK_POLL);
        }

        let fell = self.hal.now();
        let width = loop {
            self.hal.delay(C::ACK_POLL);
            let width = self.hal.now().saturating_duration_since(fell);
            if self.hal.read_data().is_high() || width >= C::ACK_TIMEOUT {
                break width;
            }
        };
        check_ack::<C>(width)
    }

    /// Clock in one reverse channel byte, after an acknowledged request
    pub fn read_byte_after_request(&mut self) -> u8 {
        let [b] = self.read_response::<1>();
        b
    }

    /// Clock in an `N` byte reverse channel reply, after an acknowledged request
    pub fn read_response<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        framer::read_bytes(&mut self.hal, C::HALF_BIT, &mut out);
        // Every Slave ignores the bus after a reply, until a sync gap.
        self.last_packet = None;
        out
    }
}

/// Slave control
impl<'a, H: SusiHal, C: MasterCfg> Master<'a, H, C> {
    /// Switch function `function` (`0..=31`) of `address` on or off
    ///
    /// The new state is cached once the Slave acknowledged it.
    pub fn set_function(&mut self, address: u8, function: u8, on: bool) -> Result<(), Error> {
        let mut data = function & 0x1F;
        if on {
            data |= 0x80;
        }
        self.send_packet(&Packet::new(address, Command::SET_FUNCTION, data), true)?;
        self.registry.record_function(address, function, on);
        Ok(())
    }

    /// The last acknowledged state of `function` on `address`
    pub fn function(&self, address: u8, function: u8) -> bool {
        self.registry.function(address, function)
    }

    /// Set the speed step (`0..=127`) and direction of `address`
    pub fn set_speed(&mut self, address: u8, speed: u8, forward: bool) -> Result<(), Error> {
        let mut data = speed & 0x7F;
        if forward {
            data |= 0x80;
        }
        self.send_packet(&Packet::new(address, Command::SET_SPEED, data), true)
    }

    /// Write `value` to CV number `cv` (1-based) of `address`
    pub fn write_cv(&mut self, address: u8, cv: u16, value: u8) -> Result<(), Error> {
        let (command, data, low) = cv_access(cv, true)?;
        self.send_packet(&Packet::new(address, command, data), true)?;
        self.send_packet(&Packet::new(address, low, value), true)
    }

    /// Read CV number `cv` (1-based) of `address`
    pub fn read_cv(&mut self, address: u8, cv: u16) -> Result<u8, Error> {
        let (command, data, low) = cv_access(cv, false)?;
        self.send_packet(&Packet::new(address, command, data), true)?;
        self.send_packet(&Packet::new(address, low, 0), true)?;
        match BidiMessage::from_bytes(self.read_response::<4>()) {
            BidiMessage::CvRead(value, _) => Ok(value),
            _other => {
                susi_warn!("Unexpected reply to CV read from {=u8}", address);
                Err(Error::InvalidResponse)
            }
        }
    }

    /// Read CV bank window `bank` (`0..=2`) of `address`
    ///
    /// The window is followed by its CRC-16/CCITT, high byte first.
    pub fn read_cv_bank(&mut self, address: u8, bank: u8) -> Result<[u8; BANK_WINDOW], Error> {
        let bank = CvBank::new(bank).ok_or(Error::OutOfRange)?;
        let command = u8::from(Command::ReadCvBank(bank));
        self.send_packet(&Packet::new(address, command, 0), true)?;

        let raw = self.read_response::<{ BANK_WINDOW + 2 }>();
        let (window, crc) = raw.split_at(BANK_WINDOW);
        if crc16_ccitt(window) != u16::from_be_bytes([crc[0], crc[1]]) {
            susi_warn!("CRC mismatch on bank {=u8} of {=u8}", bank.index(), address);
            return Err(Error::InvalidCrc);
        }
        let mut out = [0u8; BANK_WINDOW];
        out.copy_from_slice(window);
        Ok(out)
    }
}

/// BiDi
impl<'a, H: SusiHal, C: MasterCfg> Master<'a, H, C> {
    /// Find the BiDi capable modules on the bus
    ///
    /// Every module number is called with a forced host call. Modules that
    /// acknowledge and answer are added to the BiDi list. Absent modules are
    /// skipped, any other error stops the handshake.
    pub fn perform_handshake(&mut self) -> Result<(), Error> {
        for module in 0..bidi::MODULES {
            match self.send_packet(&bidi::host_call(module, true), true) {
                Ok(()) => {}
                Err(Error::Timeout) => {
                    susi_trace!("No module {=u8}", module);
                    continue;
                }
                Err(e) => return Err(e),
            }
            if self.read_response::<4>() == BUS_IDLE {
                susi_debug!("Module {=u8} acked, but sent nothing", module);
                continue;
            }
            self.registry.add_bidi(module)?;
            susi_info!("Found BiDi module {=u8}", module);
        }
        Ok(())
    }

    /// Poll every BiDi module once
    ///
    /// Each answer is passed to the [Master::on_bidi_response()] handler.
    /// Returns the number of modules that answered.
    pub fn poll_slaves(&mut self) -> usize {
        let modules: Vec<u8, MAX_SLAVES> = self.registry.bidi_slaves().iter().copied().collect();

        let mut answered = 0;
        for module in modules {
            if self.send_packet(&bidi::host_call(module, false), true).is_err() {
                susi_debug!("Module {=u8} did not answer", module);
                continue;
            }
            let raw = self.read_response::<4>();
            answered += 1;
            if let Some(cb) = self.on_bidi.as_deref_mut() {
                cb(module, raw);
            }
        }
        answered
    }

    /// The BiDi modules found by [Master::perform_handshake()]
    pub fn bidi_slaves(&self) -> &[u8] {
        self.registry.bidi_slaves()
    }
}

fn check_ack<C: MasterCfg>(width: Duration) -> Result<(), Error> {
    if (C::ACK_MIN..=C::ACK_MAX).contains(&width) {
        Ok(())
    } else {
        susi_debug!("ACK of {=u64}us out of range", width.as_micros());
        Err(Error::InvalidAck)
    }
}

/// Split a 1-based CV number into `(command, data, low address byte)`
fn cv_access(cv: u16, write: bool) -> Result<(u8, u8, u8), Error> {
    let wire = cv.checked_sub(1).ok_or(Error::OutOfRange)?;
    let [bank, low] = wire.to_be_bytes();
    match bank {
        0..=0x03 => {
            let command = if write {
                Command::WRITE_CV
            } else {
                Command::READ_CV
            };
            Ok((command, bank, low))
        }
        0x04..=0x7F => {
            let data = if write { bank | 0x80 } else { bank };
            Ok((Command::CV_ACCESS_BANKED, data, low))
        }
        _ => Err(Error::OutOfRange),
    }
}
