use enum_dispatch::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::FrameError;

/// Every request on the wire is 8 bytes: address, opcode, 5 body bytes,
/// trailing checksum.
pub const REQUEST_FRAME_LEN: usize = 8;
/// A telemetry read answers with the full 93-byte status block.
pub const TELEMETRY_FRAME_LEN: usize = 93;
/// All writes answer with an 8-byte acknowledgement frame.
pub const ACK_FRAME_LEN: usize = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    ReadTelemetry = 0xB1,
    SingleCode = 0xC0,
    ParamWrite = 0xD0,
    TimeSync = 0xDF,
}

/// Unsigned sum of all bytes, mod 256. The same algorithm covers every
/// frame type, request and response alike.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// How many body bytes a parameter value occupies, and where: one byte at
/// frame offset 6, or two bytes big-endian at frame offsets 5-6.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueWidth {
    One,
    Two,
}

#[enum_dispatch]
pub trait PacketCommon {
    fn address(&self) -> u8;
    fn opcode(&self) -> OpCode;
    fn body(&self) -> [u8; 5];
    fn reply_len(&self) -> usize;

    fn bytes(&self) -> Vec<u8> {
        let mut r = Vec::with_capacity(REQUEST_FRAME_LEN);
        r.push(self.address());
        r.push(self.opcode().into());
        r.extend_from_slice(&self.body());
        r.push(checksum(&r));
        r
    }
}

#[enum_dispatch(PacketCommon)]
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    ReadTelemetry(ReadTelemetry),
    SingleCode(SingleCode),
    ParamWrite(ParamWrite),
    TimeSync(TimeSync),
}

/////////////
//
// READ TELEMETRY (0xB1)
//
/////////////

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReadTelemetry {
    pub address: u8,
}

impl PacketCommon for ReadTelemetry {
    fn address(&self) -> u8 {
        self.address
    }

    fn opcode(&self) -> OpCode {
        OpCode::ReadTelemetry
    }

    fn body(&self) -> [u8; 5] {
        [0x01, 0x00, 0x00, 0x00, 0x00]
    }

    fn reply_len(&self) -> usize {
        TELEMETRY_FRAME_LEN
    }
}

/////////////
//
// SINGLE CODE WRITE (0xC0)
//
/////////////

/// Fire-and-ack control commands: charge on/off, load on/off, mute, backlight.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SingleCode {
    pub address: u8,
    pub code: u8,
}

impl PacketCommon for SingleCode {
    fn address(&self) -> u8 {
        self.address
    }

    fn opcode(&self) -> OpCode {
        OpCode::SingleCode
    }

    fn body(&self) -> [u8; 5] {
        [self.code, 0x00, 0x00, 0x00, 0x00]
    }

    fn reply_len(&self) -> usize {
        ACK_FRAME_LEN
    }
}

/////////////
//
// PARAMETER WRITE (0xD0)
//
/////////////

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParamWrite {
    pub address: u8,
    pub code: u8,
    pub value: f64,
    /// Multiplier applied when decoding; writes divide by it. A scale of
    /// 0.01 means 14.5V goes on the wire as 1450.
    pub scale: f64,
    pub width: ValueWidth,
}

impl PacketCommon for ParamWrite {
    fn address(&self) -> u8 {
        self.address
    }

    fn opcode(&self) -> OpCode {
        OpCode::ParamWrite
    }

    fn body(&self) -> [u8; 5] {
        let raw = (self.value / self.scale).round() as i64;
        // body[3] and body[4] are frame offsets 5 and 6
        let mut b = [self.code, 0x00, 0x00, 0x00, 0x00];
        match self.width {
            ValueWidth::One => b[4] = raw as u8,
            ValueWidth::Two => {
                b[3] = (raw >> 8) as u8;
                b[4] = raw as u8;
            }
        }
        b
    }

    fn reply_len(&self) -> usize {
        ACK_FRAME_LEN
    }
}

/////////////
//
// TIME SYNC (0xDF)
//
/////////////

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimeSync {
    pub address: u8,
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
}

impl TimeSync {
    pub fn for_datetime(address: u8, dt: &chrono::DateTime<chrono::Local>) -> Self {
        use chrono::{Datelike, Timelike};

        Self {
            address,
            year: (dt.year() % 100) as u8,
            month: dt.month() as u8,
            day: dt.day() as u8,
            hour: dt.hour() as u8,
            minute: dt.minute() as u8,
        }
    }
}

impl PacketCommon for TimeSync {
    fn address(&self) -> u8 {
        self.address
    }

    fn opcode(&self) -> OpCode {
        OpCode::TimeSync
    }

    fn body(&self) -> [u8; 5] {
        [self.year, self.month, self.day, self.hour, self.minute]
    }

    fn reply_len(&self) -> usize {
        ACK_FRAME_LEN
    }
}

/// Checks exact length and trailing checksum. Returns the frame untouched on
/// success; anything else is rejected whole.
pub fn validate_response(frame: &[u8], expected_len: usize) -> Result<&[u8], FrameError> {
    if frame.len() != expected_len {
        return Err(FrameError::Length {
            want: expected_len,
            got: frame.len(),
        });
    }

    let (data, tail) = frame.split_at(expected_len - 1);
    let computed = checksum(data);
    if computed != tail[0] {
        return Err(FrameError::Checksum {
            computed,
            found: tail[0],
        });
    }

    Ok(frame)
}
