//! # SUSI Comms
//!
//! This is a protocol engine for SUSI, the two-wire "Serial User Standard
//! Interface" used to connect a locomotive decoder (the Master) to one or
//! more peripheral modules (Slaves), such as sound or function modules.
//! It covers RCN-600 (base protocol), RCN-601 (bidirectional extension) and
//! RCN-602 (CV banking and status), as far as they are described below.
//!
//! The crate is `no_std`, does no allocation, and does not touch hardware
//! itself. All pin and timer access goes through the [`SusiHal`] trait.
//!
//! ## Entities
//!
//! There are two roles on a SUSI bus:
//!
//! 1. The Master, which drives the clock line, sends every packet, and is
//!    the only one allowed to start an exchange
//! 2. The Slave, which samples the data line on each falling clock edge,
//!    and only ever answers the Master
//!
//! There must always be exactly one Master on any bus.
//!
//! ## Framing
//!
//! Every message on the bus is a [`Packet`] of three bytes: address, command,
//! and data. On the wire this is a 26-bit frame:
//!
//! 1. One start bit, which is always LOW
//! 2. 24 data bits: address, command, then data, each least significant bit first
//! 3. One stop bit, which is always HIGH
//!
//! The Master sets the data line, then pulses the clock LOW and HIGH again, holding
//! each half of the cycle for [`MasterCfg::HALF_BIT`][master::MasterCfg::HALF_BIT].
//! The Slave samples the data line on the falling clock edge.
//!
//! A frame that ends with a LOW stop bit is thrown away. A frame that stalls for
//! more than [`FRAME_TIMEOUT`][framer::FRAME_TIMEOUT] between two edges is also
//! thrown away, so one missed edge can never desynchronize a Slave for good.
//!
//! ## Acknowledgement
//!
//! There is no negative acknowledgement. After a command, the addressed Slave
//! pulls the data line LOW for about [`ACK_PULSE`][framer::ACK_PULSE]. The Master
//! accepts any LOW pulse between [`MasterCfg::ACK_MIN`][master::MasterCfg::ACK_MIN]
//! and [`MasterCfg::ACK_MAX`][master::MasterCfg::ACK_MAX]. No pulse at all is a
//! [`Error::Timeout`], a pulse of any other width is an [`Error::InvalidAck`].
//!
//! ## Reverse channel
//!
//! Some commands are answered with more than an ACK: CV reads, CV bank reads, and
//! BiDi host calls. For these, the Slave loads its reply into its
//! [`FrameReceiver`][framer::FrameReceiver] before sending the ACK. Once the Master
//! has seen the ACK, it keeps clocking, and on each falling edge the Slave shifts out
//! the next reply bit, least significant bit first. These bytes have no start or stop
//! bits. After the last byte, the Master sends one more clock pulse, on which the
//! Slave releases the data line.
//!
//! Every other Slave sees the same clock edges. Its receiver mutes itself after
//! any frame that starts a reply, and listens again after the next sync gap, which
//! the Master always sends after reading a reply.
//!
//! ## CV access
//!
//! Configuration Variables are 16-bit addressed bytes. One packet only has room for
//! eight address bits, so every CV access takes two packets:
//!
//! 1. A CV command, whose data byte selects the bank (the high address byte) and
//!    whether the access is a read or a write
//! 2. A second packet, whose command byte is the low address byte, and whose data
//!    byte is the value to write
//!
//! The Master speaks in 1-based CV numbers, and sends `cv - 1` on the wire.
//!
//! ## BiDi
//!
//! The bidirectional extension lets Slaves report back to the Master. The Master
//! first performs a handshake, calling each module number `0..4` with a "forced
//! response" host call. Modules that answer are registered, and are then polled
//! regularly. Each poll answer is a four byte [`BidiMessage`][bidi::BidiMessage].
//! Host calls are sent to [`BROADCAST_ADDRESS`], the module number travels in the
//! data byte.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod bidi;
pub mod crc;
pub mod cv;
pub mod framer;
pub mod master;
pub mod registry;
pub mod slave;

use embassy_time::{Duration, Instant};

pub use crate::master::Master;
pub use crate::slave::Slave;

/// The address used by host calls, which every Slave listens to.
pub const BROADCAST_ADDRESS: u8 = 0;

/// The level of a clock or data line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Level {
    /// Logic low
    Low,
    /// Logic high, also the idle/released state of both lines
    High,
}

impl Level {
    /// Is this [Level::High]?
    #[inline]
    pub fn is_high(self) -> bool {
        self == Level::High
    }

    /// Is this [Level::Low]?
    #[inline]
    pub fn is_low(self) -> bool {
        self == Level::Low
    }
}

impl From<bool> for Level {
    fn from(value: bool) -> Self {
        if value {
            Level::High
        } else {
            Level::Low
        }
    }
}

/// A single SUSI message
///
/// Packets are plain values, created fresh for every transmission or
/// reception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Packet {
    /// The addressed Slave, or [BROADCAST_ADDRESS] for host calls
    pub address: u8,
    /// The command, or the low CV address byte of a two-packet CV access
    pub command: u8,
    /// The operand
    pub data: u8,
}

impl Packet {
    /// Create a new packet
    pub const fn new(address: u8, command: u8, data: u8) -> Self {
        Self {
            address,
            command,
            data,
        }
    }

    /// The three bytes of this packet, in wire order
    pub const fn to_bytes(&self) -> [u8; 3] {
        [self.address, self.command, self.data]
    }

    /// Rebuild a packet from three bytes in wire order
    pub const fn from_bytes(bytes: [u8; 3]) -> Self {
        Self::new(bytes[0], bytes[1], bytes[2])
    }

    /// Decode the command byte
    ///
    /// Note that the second packet of a CV access carries an address
    /// byte here, which may or may not look like a command.
    pub fn kind(&self) -> Result<Command, CommandError> {
        Command::try_from(self.command)
    }
}

/// SUSI command byte
///
/// Commands not listed here are ignored by the [`Slave`] unless a
/// CV access is in progress.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Command {
    /// BiDi Host Call - `0x01`
    ///
    /// Data bits `0..=1` are the module number, bit 2 requests a forced
    /// response (handshake).
    BidiHostCall,
    /// Set Speed - `0x02`
    ///
    /// Data bits `0..=6` are the speed step, bit 7 is set for forward.
    SetSpeed,
    /// Read CV - `0x03`
    ///
    /// Data bits `0..=1` are the CV bank.
    ReadCv,
    /// Write CV - `0x04`
    ///
    /// Data bits `0..=1` are the CV bank.
    WriteCv,
    /// Set Function - `0x60`
    ///
    /// Data bits `0..=4` are the function number, bit 7 is set for on.
    SetFunction,
    /// Read CV Bank - `0x70..=0x72`
    ///
    /// Streams a 40 byte CV window plus its CRC.
    ReadCvBank(CvBank),
    /// Banked CV access - `0x7C`
    ///
    /// Data bits `0..=6` are the CV bank, bit 7 is set for a write.
    CvAccessBanked,
}

/// Index of a bank reachable with [Command::ReadCvBank], always `0..=2`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct CvBank(u8);

impl CvBank {
    /// Returns `None` unless `index < Command::CV_BANKS`
    pub const fn new(index: u8) -> Option<Self> {
        if index < Command::CV_BANKS {
            Some(Self(index))
        } else {
            None
        }
    }

    /// The bank index
    pub const fn index(self) -> u8 {
        self.0
    }
}

/// Command decoding error
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum CommandError {
    /// The byte is not a known command
    Unknown(u8),
}

impl Command {
    /// BiDi Host Call
    pub const BIDI_HOST_CALL: u8 = 0x01;
    /// Set Speed
    pub const SET_SPEED: u8 = 0x02;
    /// Read CV, legacy bank encoding
    pub const READ_CV: u8 = 0x03;
    /// Write CV, legacy bank encoding
    pub const WRITE_CV: u8 = 0x04;
    /// Set Function
    pub const SET_FUNCTION: u8 = 0x60;
    /// Read CV Bank 0, banks 1 and 2 follow directly
    pub const READ_CV_BANK_0: u8 = 0x70;
    /// Banked CV access
    pub const CV_ACCESS_BANKED: u8 = 0x7C;

    /// Number of banks reachable with [Command::ReadCvBank]
    pub const CV_BANKS: u8 = 3;
}

impl TryFrom<u8> for Command {
    type Error = CommandError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            Self::BIDI_HOST_CALL => Ok(Command::BidiHostCall),
            Self::SET_SPEED => Ok(Command::SetSpeed),
            Self::READ_CV => Ok(Command::ReadCv),
            Self::WRITE_CV => Ok(Command::WriteCv),
            Self::SET_FUNCTION => Ok(Command::SetFunction),
            Self::CV_ACCESS_BANKED => Ok(Command::CvAccessBanked),
            v if (Self::READ_CV_BANK_0..Self::READ_CV_BANK_0 + Self::CV_BANKS).contains(&v) => {
                Ok(Command::ReadCvBank(CvBank(v - Self::READ_CV_BANK_0)))
            }
            v => Err(CommandError::Unknown(v)),
        }
    }
}

impl From<Command> for u8 {
    fn from(val: Command) -> Self {
        match val {
            Command::BidiHostCall => Command::BIDI_HOST_CALL,
            Command::SetSpeed => Command::SET_SPEED,
            Command::ReadCv => Command::READ_CV,
            Command::WriteCv => Command::WRITE_CV,
            Command::SetFunction => Command::SET_FUNCTION,
            Command::ReadCvBank(bank) => Command::READ_CV_BANK_0 + bank.index(),
            Command::CvAccessBanked => Command::CV_ACCESS_BANKED,
        }
    }
}

/// An error returned by Master operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// No ACK pulse was seen
    Timeout,
    /// An ACK pulse was seen, but its width was out of range
    InvalidAck,
    /// A CV bank transfer failed its checksum
    InvalidCrc,
    /// The Slave is already in the BiDi list
    SlaveAlreadyExists,
    /// The BiDi list has no room left
    SlaveListFull,
    /// A reply was received, but was not the expected message
    InvalidResponse,
    /// A CV number or bank index that cannot be sent
    OutOfRange,
}

/// A handler called on every falling edge of the clock line
///
/// This is implemented by [`FrameReceiver`][framer::FrameReceiver], and
/// registered once with [`SusiHal::attach_clock_falling`].
pub trait EdgeHandler {
    /// Handle one falling clock edge.
    ///
    /// `data` is the level of the data line sampled at the edge, and `now`
    /// the time of the edge.
    ///
    /// The return value is the level this node wants to drive onto the data
    /// line until the next edge. `None` means the line must be released.
    fn on_clock_falling(&self, data: Level, now: Instant) -> Option<Level>;
}

/// Pin and timer access needed by the protocol
///
/// The Master and the Slave use the same trait. For testing, the lines
/// can be simulated, see the `tests/` directory of this crate.
///
/// Lines are open-drain: driving [Level::High] releases a line, and
/// reading returns the wired-AND of every node.
pub trait SusiHal {
    /// Drive the clock line
    fn set_clock(&mut self, level: Level);

    /// Drive the data line
    fn set_data(&mut self, level: Level);

    /// Read the clock line
    fn read_clock(&mut self) -> Level;

    /// Read the data line
    fn read_data(&mut self) -> Level;

    /// Register the handler for falling edges on the clock line
    ///
    /// The handler is called from interrupt context. Implementations call
    /// [EdgeHandler::on_clock_falling] with the sampled data level, and then
    /// drive the data line to the returned level, or release it for `None`.
    ///
    /// Only one handler is registered per clock line, for the lifetime of
    /// the program.
    fn attach_clock_falling(&mut self, handler: &'static dyn EdgeHandler);

    /// A monotonic microsecond clock
    fn micros(&mut self) -> u64;

    /// A monotonic millisecond clock
    fn millis(&mut self) -> u64 {
        self.micros() / 1_000
    }

    /// Block for `us` microseconds
    fn delay_us(&mut self, us: u32);

    /// Block for `ms` milliseconds
    fn delay_ms(&mut self, ms: u32) {
        self.delay_us(ms.saturating_mul(1_000))
    }

    /// The current time as an [Instant]
    fn now(&mut self) -> Instant {
        Instant::from_micros(self.micros())
    }

    /// Block for the given [Duration]
    fn delay(&mut self, dur: Duration) {
        let us = dur.as_micros();
        if us > u64::from(u32::MAX) {
            self.delay_ms((us / 1_000).min(u64::from(u32::MAX)) as u32);
        } else {
            self.delay_us(us as u32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_bytes() {
        let all = [
            Command::BidiHostCall,
            Command::SetSpeed,
            Command::ReadCv,
            Command::WriteCv,
            Command::SetFunction,
            Command::ReadCvBank(CvBank(0)),
            Command::ReadCvBank(CvBank(1)),
            Command::ReadCvBank(CvBank(2)),
            Command::CvAccessBanked,
        ];
        for cmd in all {
            let byte: u8 = cmd.into();
            assert_eq!(Command::try_from(byte), Ok(cmd));
        }
        assert_eq!(Command::try_from(0x71), Ok(Command::ReadCvBank(CvBank(1))));
    }

    #[test]
    fn bank_indexes() {
        for index in 0..Command::CV_BANKS {
            let bank = CvBank::new(index).unwrap();
            assert_eq!(bank.index(), index);
            assert_eq!(u8::from(Command::ReadCvBank(bank)), 0x70 + index);
        }
        assert_eq!(CvBank::new(3), None);
        assert_eq!(CvBank::new(0xFF), None);
    }

    #[test]
    fn unknown_commands() {
        assert_eq!(Command::try_from(0x00), Err(CommandError::Unknown(0x00)));
        assert_eq!(Command::try_from(0x73), Err(CommandError::Unknown(0x73)));
        assert_eq!(Command::try_from(0xFF), Err(CommandError::Unknown(0xFF)));
    }

    #[test]
    fn packet_bytes() {
        let p = Packet::new(5, Command::SET_SPEED, 100);
        assert_eq!(p.to_bytes(), [5, 0x02, 100]);
        assert_eq!(Packet::from_bytes(p.to_bytes()), p);
        assert_eq!(p.kind(), Ok(Command::SetSpeed));
    }
}
