//! DALI opcodes and bridge wire-protocol constants.
//!
//! Addressed commands are two-byte forward frames: an address byte (with the
//! command/arc-power selector in bit 0) followed by an opcode byte. Special
//! commands occupy the address-byte slot themselves and carry their operand
//! in the second byte.

/// Addressed command opcodes (second frame byte, address byte has bit 0 set).
pub mod opcode {
    pub const OFF: u8 = 0x00;
    pub const UP: u8 = 0x01;
    pub const DOWN: u8 = 0x02;
    pub const STEP_UP: u8 = 0x03;
    pub const STEP_DOWN: u8 = 0x04;
    pub const RECALL_MAX_LEVEL: u8 = 0x05;
    pub const RECALL_MIN_LEVEL: u8 = 0x06;

    // configuration commands, must be issued twice within 100 ms
    pub const RESET: u8 = 0x20;
    pub const STORE_ACTUAL_LEVEL_IN_DTR: u8 = 0x21;
    pub const STORE_DTR_AS_MAX_LEVEL: u8 = 0x2A;
    pub const STORE_DTR_AS_MIN_LEVEL: u8 = 0x2B;
    pub const STORE_DTR_AS_FAILURE_LEVEL: u8 = 0x2C;
    pub const STORE_DTR_AS_POWER_ON_LEVEL: u8 = 0x2D;
    pub const STORE_DTR_AS_FADE_TIME: u8 = 0x2E;
    pub const STORE_DTR_AS_FADE_RATE: u8 = 0x2F;
    pub const ADD_TO_GROUP: u8 = 0x60; // + group number 0..15
    pub const REMOVE_FROM_GROUP: u8 = 0x70; // + group number 0..15
    pub const STORE_DTR_AS_SHORT_ADDRESS: u8 = 0x80;

    // queries, answered by a single backward frame byte
    pub const QUERY_STATUS: u8 = 0x90;
    pub const QUERY_CONTROL_GEAR: u8 = 0x91;
    pub const QUERY_LAMP_FAILURE: u8 = 0x92;
    pub const QUERY_VERSION_NUMBER: u8 = 0x97;
    pub const QUERY_CONTENT_DTR: u8 = 0x98;
    pub const QUERY_DEVICE_TYPE: u8 = 0x99;
    pub const QUERY_PHYSICAL_MINIMUM: u8 = 0x9A;
    pub const QUERY_CONTENT_DTR1: u8 = 0x9C;
    pub const QUERY_ACTUAL_LEVEL: u8 = 0xA0;
    pub const QUERY_MAX_LEVEL: u8 = 0xA1;
    pub const QUERY_MIN_LEVEL: u8 = 0xA2;
    pub const QUERY_GROUPS_0_TO_7: u8 = 0xC0;
    pub const QUERY_GROUPS_8_TO_15: u8 = 0xC1;
    pub const READ_MEMORY_LOCATION: u8 = 0xC5;
    pub const QUERY_EXTENDED_VERSION: u8 = 0xFF;
}

/// Special commands. These bytes go into the address-byte slot of the frame;
/// the second byte carries the operand.
pub mod special {
    pub const TERMINATE: u8 = 0xA1;
    pub const SET_DTR: u8 = 0xA3;
    pub const INITIALISE: u8 = 0xA5;
    pub const RANDOMISE: u8 = 0xA7;
    pub const COMPARE: u8 = 0xA9;
    pub const WITHDRAW: u8 = 0xAB;
    pub const SEARCHADDRH: u8 = 0xB1;
    pub const SEARCHADDRM: u8 = 0xB3;
    pub const SEARCHADDRL: u8 = 0xB5;
    pub const PROGRAM_SHORT_ADDRESS: u8 = 0xB7;
    pub const VERIFY_SHORT_ADDRESS: u8 = 0xB9;
    pub const QUERY_SHORT_ADDRESS: u8 = 0xBB;
    pub const ENABLE_DEVICE_TYPE: u8 = 0xC1;
    pub const SET_DTR1: u8 = 0xC3;
}

/// Bridge adapter protocol. Every request is three bytes: a bridge command
/// byte followed by the two DALI forward-frame bytes (or adjustment values).
/// Acknowledged requests are answered with exactly two bytes: a response
/// discriminator and a payload byte.
pub mod bridge {
    /// Put the frame on the bus, no bridge response.
    pub const CMD_SEND: u8 = 0x30;
    /// Put the frame on the bus, answer with an acknowledge code.
    pub const CMD_SEND_ACK: u8 = 0x31;
    /// Put the frame on the bus and wait for a backward frame; answer with
    /// the backward frame byte or an acknowledge code.
    pub const CMD_QUERY: u8 = 0x32;
    /// Reset the bridge and clear an overload condition.
    pub const CMD_RESET: u8 = 0x33;
    /// Set send-edge and sample-point timing adjustments (passed through).
    pub const CMD_EDGE_ADJ: u8 = 0x34;

    /// First response byte: acknowledge follows.
    pub const RESP_ACK: u8 = 0x2A;
    /// First response byte: backward-frame data follows.
    pub const RESP_DATA: u8 = 0x2D;

    // acknowledge codes (second response byte after RESP_ACK)
    pub const ACK_OK: u8 = 0x30;
    /// No backward frame was observed within the bus timeout.
    pub const ACK_TIMEOUT: u8 = 0x31;
    /// A backward frame arrived but was unreadable (framing/parity anomaly,
    /// i.e. more than one device answered).
    pub const ACK_FRAME_ERROR: u8 = 0x32;
    pub const ACK_OVERLOAD: u8 = 0x33;
    pub const ACK_INVALID_COMMAND: u8 = 0x39;
}

/// Arc power value reserved as MASK; stops a running fade when sent as
/// direct arc power.
pub const ARC_POWER_MASK: u8 = 0xFF;

/// Maximum valid direct arc power value.
pub const ARC_POWER_MAX: u8 = 0xFE;

/// Number of short addresses on a DALI bus.
pub const SHORT_ADDRESS_COUNT: u8 = 64;

/// Number of group addresses on a DALI bus.
pub const GROUP_COUNT: u8 = 16;
