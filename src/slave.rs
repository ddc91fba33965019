//! Slave Interface
//!
//! A Slave is split in two halves:
//!
//! 1. A [FrameReceiver], registered with the clock interrupt, which assembles
//!    frames and shifts out replies
//! 2. The [Slave] itself, which owns the HAL and the CV table, and handles
//!    finished packets whenever [Slave::poll()] is called from the main loop

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::{
    bidi::{BidiMessage, HOST_CALL_FORCED, HOST_CALL_MODULE_MASK},
    crc::crc16_ccitt,
    cv::{CvPersistence, CvStore, BANK_WINDOW},
    framer::{self, AddressFilter, FrameReceiver},
    Command, Packet, SusiHal,
};

/// Identity of a Slave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlaveConfig {
    /// Bus address, and module number for BiDi (`0..=3`)
    pub address: u8,
    /// Manufacturer ID, the low byte is reported in CV 900
    pub manufacturer_id: u16,
    /// Hardware ID, reported in CV 900 instead when bank select is 1
    pub hardware_id: u16,
    /// Version, the high byte is reported in CV 901
    pub version: u16,
}

/// The first half of a two-packet CV access
#[derive(Debug, Clone, Copy, PartialEq)]
struct CvOp {
    bank: u8,
    write: bool,
}

/// A SUSI Slave
pub struct Slave<'a, H, R, P>
where
    H: SusiHal,
    R: RawMutex + 'static,
    P: CvPersistence,
{
    hal: H,
    rx: &'static FrameReceiver<R>,
    cvs: CvStore<P>,
    speed: u8,
    forward: bool,
    functions: u32,
    cv_op: Option<CvOp>,
    bidi: bool,
    message: Option<[u8; 4]>,
    on_function: Option<&'a mut dyn FnMut(u8, bool)>,
}

impl<'a, H, R, P> Slave<'a, H, R, P>
where
    H: SusiHal,
    R: RawMutex + 'static,
    P: CvPersistence,
{
    /// Create a new Slave
    ///
    /// `rx` is usually a static, see [FrameReceiver]. Call [Slave::begin()]
    /// before polling.
    pub fn new(hal: H, rx: &'static FrameReceiver<R>, config: SlaveConfig, persist: P) -> Self {
        Self {
            hal,
            rx,
            cvs: CvStore::new(persist, config),
            speed: 0,
            forward: false,
            functions: 0,
            cv_op: None,
            bidi: false,
            message: None,
            on_function: None,
        }
    }

    /// Load the CV table and start listening
    pub fn begin(&mut self) {
        self.cvs.load();
        self.rx.set_filter(AddressFilter::ExactOrBroadcast(self.address()));
        self.hal.attach_clock_falling(self.rx);
        susi_info!("Slave {=u8} listening", self.address());
    }

    /// Register the handler for function changes
    ///
    /// Called with the function number and the new state, before the change
    /// is acknowledged.
    pub fn on_function_change(&mut self, cb: &'a mut dyn FnMut(u8, bool)) {
        self.on_function = Some(cb);
    }

    /// Is a received packet waiting for [Slave::poll()]?
    pub fn available(&self) -> bool {
        self.rx.is_ready()
    }

    /// Handle the next received packet, if any
    ///
    /// Returns the handled packet.
    pub fn poll(&mut self) -> Option<Packet> {
        let packet = self.rx.take()?;
        self.dispatch(&packet);
        Some(packet)
    }

    fn dispatch(&mut self, packet: &Packet) {
        let mine = packet.address == self.address();

        // The second half of a CV access carries the low address byte
        // instead of a command. A host call is always a host call, so a
        // Slave at address 0 cannot complete an access with low byte 0x01.
        if mine && packet.command != Command::BIDI_HOST_CALL {
            if let Some(op) = self.cv_op.take() {
                self.finish_cv(op, packet);
                return;
            }
        }

        match packet.kind() {
            Ok(Command::BidiHostCall) => self.host_call(packet.data),
            Ok(_) if !mine => {}
            Ok(Command::SetSpeed) => {
                self.speed = packet.data & 0x7F;
                self.forward = packet.data & 0x80 != 0;
                self.ack();
            }
            Ok(Command::SetFunction) => {
                let function = packet.data & 0x1F;
                let on = packet.data & 0x80 != 0;
                self.set_function(function, on);
                self.ack();
            }
            Ok(Command::ReadCv) | Ok(Command::WriteCv) => {
                let write = packet.command == Command::WRITE_CV;
                self.start_cv(packet.data & 0x03, write);
            }
            Ok(Command::CvAccessBanked) => {
                self.start_cv(packet.data & 0x7F, packet.data & 0x80 != 0);
            }
            Ok(Command::ReadCvBank(bank)) => self.send_bank(bank.index()),
            Err(_) => {
                susi_trace!("Ignoring command {=u8}", packet.command);
            }
        }
    }

    fn start_cv(&mut self, bank: u8, write: bool) {
        self.cv_op = Some(CvOp { bank, write });
        self.ack();
    }

    fn finish_cv(&mut self, op: CvOp, packet: &Packet) {
        let key = u16::from_be_bytes([op.bank, packet.command]);
        if op.write {
            susi_debug!("CV {=u16} = {=u8}", key, packet.data);
            self.cvs.write(key, packet.data);
            self.ack();
        } else {
            let msg = BidiMessage::CvRead(self.cvs.read(key), self.cvs.read(key.wrapping_add(1)));
            self.respond(&msg.to_bytes());
        }
    }

    fn send_bank(&mut self, bank: u8) {
        let mut window = [0u8; BANK_WINDOW];
        self.cvs.read_bank(bank, &mut window);

        let mut reply = [0u8; BANK_WINDOW + 2];
        reply[..BANK_WINDOW].copy_from_slice(&window);
        reply[BANK_WINDOW..].copy_from_slice(&crc16_ccitt(&window).to_be_bytes());
        self.respond(&reply);
    }

    fn host_call(&mut self, data: u8) {
        if data & HOST_CALL_MODULE_MASK != self.address() {
            return;
        }

        if data & HOST_CALL_FORCED != 0 {
            if !self.bidi {
                susi_info!("BiDi enabled");
            }
            self.bidi = true;
            self.respond(&BidiMessage::Idle.to_bytes());
            return;
        }

        if !self.bidi {
            return;
        }
        let msg = if let Some(raw) = self.message.take() {
            raw
        } else if self.cvs.status() != 0 {
            BidiMessage::Status(self.cvs.take_status()).to_bytes()
        } else {
            BidiMessage::Idle.to_bytes()
        };
        self.respond(&msg);
    }

    fn set_function(&mut self, function: u8, on: bool) {
        let mask = 1u32 << function;
        if on {
            self.functions |= mask;
        } else {
            self.functions &= !mask;
        }
        if let Some(cb) = self.on_function.as_deref_mut() {
            cb(function, on);
        }
    }

    fn ack(&mut self) {
        framer::send_ack(&mut self.hal);
    }

    /// Queue `bytes` for the reverse channel, then acknowledge
    fn respond(&mut self, bytes: &[u8]) {
        let now = self.hal.now();
        self.rx.load_reply(bytes, now);
        self.ack();
    }
}

/// Accessors
impl<'a, H, R, P> Slave<'a, H, R, P>
where
    H: SusiHal,
    R: RawMutex + 'static,
    P: CvPersistence,
{
    /// Our bus address
    pub fn address(&self) -> u8 {
        self.cvs.config().address
    }

    /// The last received speed step
    pub fn speed(&self) -> u8 {
        self.speed
    }

    /// The last received direction, `true` is forward
    pub fn direction(&self) -> bool {
        self.forward
    }

    /// The state of function `function` (`0..=31`)
    pub fn function(&self, function: u8) -> bool {
        (self.functions >> (function & 0x1F)) & 1 != 0
    }

    /// Read CV number `cv` (1-based)
    pub fn read_cv(&self, cv: u16) -> u8 {
        cv.checked_sub(1).map(|key| self.cvs.read(key)).unwrap_or(0)
    }

    /// Write CV number `cv` (1-based)
    pub fn write_cv(&mut self, cv: u16, value: u8) {
        if let Some(key) = cv.checked_sub(1) {
            self.cvs.write(key, value);
        }
    }

    /// Queue a message for the next BiDi poll
    ///
    /// Replaces any message that was not picked up yet.
    pub fn queue_message(&mut self, msg: BidiMessage) {
        self.message = Some(msg.to_bytes());
    }

    /// Raise status bits, reported on a BiDi poll when no message is queued
    pub fn raise_status(&mut self, bits: u8) {
        self.cvs.raise_status(bits);
    }

    /// Did the Master complete a BiDi handshake with us?
    pub fn is_bidi_enabled(&self) -> bool {
        self.bidi
    }

    /// The CV bank select register
    pub fn bank_select(&self) -> u8 {
        self.cvs.bank_select()
    }

    /// Borrow the CV table
    pub fn cv_store(&self) -> &CvStore<P> {
        &self.cvs
    }

    /// The receiver registered with the clock interrupt
    pub fn receiver(&self) -> &'static FrameReceiver<R> {
        self.rx
    }

    /// Borrow the HAL
    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// Mutably borrow the HAL
    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }
}
