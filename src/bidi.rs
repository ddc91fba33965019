//! BiDi messages
//!
//! Every answer a Slave gives to a BiDi host call is four bytes: two
//! `(header, data)` pairs. Most messages only use the first pair, and fill
//! the second with an idle pair.

/// Header bytes of the BiDi messages
pub mod header {
    /// Signal state
    pub const SIGNAL_STATE: u8 = 0x81;
    /// Direct function state
    pub const DIRECT_FUNCTION: u8 = 0x82;
    /// DCC function value
    pub const DCC_FUNCTION: u8 = 0x83;
    /// Short binary state
    pub const BINARY_STATE_SHORT: u8 = 0x84;
    /// Automatic speed
    pub const AUTO_SPEED: u8 = 0x85;
    /// Automatic operation
    pub const AUTO_OPERATION: u8 = 0x86;
    /// Analog value A
    pub const ANALOG_A: u8 = 0x87;
    /// Analog value B
    pub const ANALOG_B: u8 = 0x88;
    /// Error report
    pub const ERROR: u8 = 0x89;
    /// Nothing to report
    pub const IDLE: u8 = 0x8A;
    /// Position, high byte
    pub const POSITION_HIGH: u8 = 0x8B;
    /// Position, low byte
    pub const POSITION_LOW: u8 = 0x8C;
    /// Status bits
    pub const STATUS: u8 = 0x8D;
    /// CV read response
    pub const CV_RESPONSE: u8 = 0x8E;
}

use crate::{Command, Packet, BROADCAST_ADDRESS};

/// What the Master reads when no Slave drives the reverse channel
pub const BUS_IDLE: [u8; 4] = [0xFF; 4];

/// Host call data bits holding the module number
pub const HOST_CALL_MODULE_MASK: u8 = 0x03;

/// Host call data bit requesting a forced response (handshake)
pub const HOST_CALL_FORCED: u8 = 0x04;

/// Number of module numbers a host call can address
pub const MODULES: u8 = HOST_CALL_MODULE_MASK + 1;

/// Build a host call for `module`
pub fn host_call(module: u8, forced: bool) -> Packet {
    let mut data = module & HOST_CALL_MODULE_MASK;
    if forced {
        data |= HOST_CALL_FORCED;
    }
    Packet::new(BROADCAST_ADDRESS, Command::BIDI_HOST_CALL, data)
}

/// A single BiDi message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BidiMessage {
    /// Nothing to report
    Idle,
    /// Signal state
    SignalState(u8),
    /// Direct function state
    DirectFunction(u8),
    /// DCC function value
    DccFunction(u8),
    /// Short binary state
    BinaryStateShort(u8),
    /// Automatic speed
    AutoSpeed(u8),
    /// Automatic operation
    AutoOperation(u8),
    /// Analog values A and B
    Analog {
        /// Channel A
        a: u8,
        /// Channel B
        b: u8,
    },
    /// Error report
    Error(u8),
    /// Position, sent high byte first
    Position(u16),
    /// Status bits
    Status(u8),
    /// Two consecutive CV values, starting at the requested CV
    CvRead(u8, u8),
    /// Anything we don't know how to decode
    Unknown([u8; 4]),
}

impl BidiMessage {
    /// Encode as four bytes: `header1, data1, header2, data2`
    pub fn to_bytes(&self) -> [u8; 4] {
        use header::*;

        let single = |h: u8, d: u8| [h, d, IDLE, 0];
        match *self {
            BidiMessage::Idle => [IDLE, 0, IDLE, 0],
            BidiMessage::SignalState(v) => single(SIGNAL_STATE, v),
            BidiMessage::DirectFunction(v) => single(DIRECT_FUNCTION, v),
            BidiMessage::DccFunction(v) => single(DCC_FUNCTION, v),
            BidiMessage::BinaryStateShort(v) => single(BINARY_STATE_SHORT, v),
            BidiMessage::AutoSpeed(v) => single(AUTO_SPEED, v),
            BidiMessage::AutoOperation(v) => single(AUTO_OPERATION, v),
            BidiMessage::Analog { a, b } => [ANALOG_A, a, ANALOG_B, b],
            BidiMessage::Error(v) => single(ERROR, v),
            BidiMessage::Position(p) => {
                let [hi, lo] = p.to_be_bytes();
                [POSITION_HIGH, hi, POSITION_LOW, lo]
            }
            BidiMessage::Status(v) => single(STATUS, v),
            BidiMessage::CvRead(a, b) => [CV_RESPONSE, a, CV_RESPONSE, b],
            BidiMessage::Unknown(raw) => raw,
        }
    }

    /// Decode four bytes
    pub fn from_bytes(raw: [u8; 4]) -> Self {
        use header::*;

        let [h1, d1, h2, d2] = raw;
        let idle_tail = h2 == IDLE;
        match (h1, h2) {
            (IDLE, IDLE) => BidiMessage::Idle,
            (ANALOG_A, ANALOG_B) => BidiMessage::Analog { a: d1, b: d2 },
            (POSITION_HIGH, POSITION_LOW) => BidiMessage::Position(u16::from_be_bytes([d1, d2])),
            (CV_RESPONSE, CV_RESPONSE) => BidiMessage::CvRead(d1, d2),
            (SIGNAL_STATE, _) if idle_tail => BidiMessage::SignalState(d1),
            (DIRECT_FUNCTION, _) if idle_tail => BidiMessage::DirectFunction(d1),
            (DCC_FUNCTION, _) if idle_tail => BidiMessage::DccFunction(d1),
            (BINARY_STATE_SHORT, _) if idle_tail => BidiMessage::BinaryStateShort(d1),
            (AUTO_SPEED, _) if idle_tail => BidiMessage::AutoSpeed(d1),
            (AUTO_OPERATION, _) if idle_tail => BidiMessage::AutoOperation(d1),
            (ERROR, _) if idle_tail => BidiMessage::Error(d1),
            (STATUS, _) if idle_tail => BidiMessage::Status(d1),
            _ => BidiMessage::Unknown(raw),
        }
    }

    /// Is this [BidiMessage::Idle]?
    pub fn is_idle(&self) -> bool {
        matches!(self, BidiMessage::Idle)
    }
}

impl From<[u8; 4]> for BidiMessage {
    fn from(raw: [u8; 4]) -> Self {
        BidiMessage::from_bytes(raw)
    }
}

impl From<BidiMessage> for [u8; 4] {
    fn from(msg: BidiMessage) -> Self {
        msg.to_bytes()
    }
}
