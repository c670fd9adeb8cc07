// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Wire records for the Host/Client protocol.
//!
//! Both record types are fixed-size, so framing is given entirely by the
//! seqpacket datagram boundary — one record per message:
//!
//! ```text
//! FrameEvent   (host → client, 104 bytes)
//!   [i32 error][pad4][i64 serial][i64 timestamp][i64 duration][i64 pts]
//!   [i64 dts][i64 expires][i32 locked][u32 fourcc][i32 width][i32 height]
//!   [i64 paddr][u64 size][i64 offset][i32 stride][pad4]
//!
//! FrameControl (client → host, 16 bytes)
//!   [u32 op][pad4][i64 serial]      op: 0 = TryLock, 1 = Unlock
//! ```
//!
//! All integers are little-endian. An event with `serial != 0` is a frame
//! broadcast and carries exactly one file descriptor in the message's
//! `SCM_RIGHTS` ancillary data; an event with `serial == 0` is a control
//! response or keepalive and carries none. Both ends run on the same kernel,
//! so no cross-endian handling is attempted.

use crate::Error;

/// Encoded size of a [`FrameEvent`] record.
pub const EVENT_SIZE: usize = 104;

/// Encoded size of a [`FrameControl`] record.
pub const CONTROL_SIZE: usize = 16;

/// Error taxonomy carried in the `error` field of event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorKind {
    /// Success / plain broadcast / keepalive
    #[default]
    None,
    /// The targeted frame is not (or no longer) known to the host
    Expired,
    /// The client's lock table is full
    TooManyLocks,
    /// The host did not understand the control operation
    InvalidControl,
    /// The host rejected a malformed record
    BadMessage,
}

impl ErrorKind {
    pub fn as_wire(self) -> i32 {
        match self {
            ErrorKind::None => 0,
            ErrorKind::Expired => 1,
            ErrorKind::TooManyLocks => 2,
            ErrorKind::InvalidControl => 3,
            ErrorKind::BadMessage => 4,
        }
    }

    pub fn from_wire(val: i32) -> Result<Self, Error> {
        match val {
            0 => Ok(ErrorKind::None),
            1 => Ok(ErrorKind::Expired),
            2 => Ok(ErrorKind::TooManyLocks),
            3 => Ok(ErrorKind::InvalidControl),
            4 => Ok(ErrorKind::BadMessage),
            _ => Err(Error::BadMessage),
        }
    }
}

/// Control operations a client may issue against a broadcast frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    TryLock,
    Unlock,
}

impl ControlOp {
    pub fn as_wire(self) -> u32 {
        match self {
            ControlOp::TryLock => 0,
            ControlOp::Unlock => 1,
        }
    }

    pub fn from_wire(val: u32) -> Result<Self, Error> {
        match val {
            0 => Ok(ControlOp::TryLock),
            1 => Ok(ControlOp::Unlock),
            _ => Err(Error::InvalidControl),
        }
    }
}

/// Frame metadata as it travels on the wire.
///
/// `serial` is 0 for records that are not frame events. `expires` is an
/// absolute `CLOCK_MONOTONIC` deadline in nanoseconds, 0 for "never".
/// `locked` is the host-side hold count, echoed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub serial: i64,
    pub timestamp: i64,
    pub duration: i64,
    pub pts: i64,
    pub dts: i64,
    pub expires: i64,
    pub locked: i32,
    pub fourcc: u32,
    pub width: i32,
    pub height: i32,
    pub paddr: isize,
    pub size: usize,
    pub offset: isize,
    pub stride: i32,
}

/// Event record broadcast by the host and echoed as control responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameEvent {
    pub error: ErrorKind,
    pub info: FrameInfo,
}

impl FrameEvent {
    /// Build the broadcast record for a live frame.
    pub fn broadcast(info: FrameInfo) -> Self {
        FrameEvent {
            error: ErrorKind::None,
            info,
        }
    }

    /// Build a control response. Responses always carry `serial == 0` so
    /// clients can tell them apart from interleaved broadcasts; `locked`
    /// is 1 when a TryLock was newly granted.
    pub fn response(error: ErrorKind, locked: i32) -> Self {
        FrameEvent {
            error,
            info: FrameInfo {
                locked,
                ..FrameInfo::default()
            },
        }
    }

    /// A status record: no error, no frame, no fd.
    pub fn keepalive() -> Self {
        FrameEvent::default()
    }

    /// True for records that announce a frame (and therefore carry an fd).
    pub fn is_frame(&self) -> bool {
        self.info.serial != 0
    }

    pub fn encode(&self) -> [u8; EVENT_SIZE] {
        let mut buf = [0u8; EVENT_SIZE];
        let info = &self.info;
        buf[0..4].copy_from_slice(&self.error.as_wire().to_le_bytes());
        // bytes 4..8 pad
        buf[8..16].copy_from_slice(&info.serial.to_le_bytes());
        buf[16..24].copy_from_slice(&info.timestamp.to_le_bytes());
        buf[24..32].copy_from_slice(&info.duration.to_le_bytes());
        buf[32..40].copy_from_slice(&info.pts.to_le_bytes());
        buf[40..48].copy_from_slice(&info.dts.to_le_bytes());
        buf[48..56].copy_from_slice(&info.expires.to_le_bytes());
        buf[56..60].copy_from_slice(&info.locked.to_le_bytes());
        buf[60..64].copy_from_slice(&info.fourcc.to_le_bytes());
        buf[64..68].copy_from_slice(&info.width.to_le_bytes());
        buf[68..72].copy_from_slice(&info.height.to_le_bytes());
        buf[72..80].copy_from_slice(&(info.paddr as i64).to_le_bytes());
        buf[80..88].copy_from_slice(&(info.size as u64).to_le_bytes());
        buf[88..96].copy_from_slice(&(info.offset as i64).to_le_bytes());
        buf[96..100].copy_from_slice(&info.stride.to_le_bytes());
        // bytes 100..104 pad
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < EVENT_SIZE {
            return Err(Error::BadMessage);
        }
        let error = ErrorKind::from_wire(read_i32(buf, 0))?;
        let info = FrameInfo {
            serial: read_i64(buf, 8),
            timestamp: read_i64(buf, 16),
            duration: read_i64(buf, 24),
            pts: read_i64(buf, 32),
            dts: read_i64(buf, 40),
            expires: read_i64(buf, 48),
            locked: read_i32(buf, 56),
            fourcc: read_i32(buf, 60) as u32,
            width: read_i32(buf, 64),
            height: read_i32(buf, 68),
            paddr: read_i64(buf, 72) as isize,
            size: read_i64(buf, 80) as usize,
            offset: read_i64(buf, 88) as isize,
            stride: read_i32(buf, 96),
        };
        Ok(FrameEvent { error, info })
    }
}

/// Control record sent by a client against a broadcast serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameControl {
    pub op: ControlOp,
    pub serial: i64,
}

impl FrameControl {
    pub fn new(op: ControlOp, serial: i64) -> Self {
        FrameControl { op, serial }
    }

    pub fn encode(&self) -> [u8; CONTROL_SIZE] {
        let mut buf = [0u8; CONTROL_SIZE];
        buf[0..4].copy_from_slice(&self.op.as_wire().to_le_bytes());
        // bytes 4..8 pad
        buf[8..16].copy_from_slice(&self.serial.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < CONTROL_SIZE {
            return Err(Error::BadMessage);
        }
        let op = ControlOp::from_wire(read_i32(buf, 0) as u32)?;
        Ok(FrameControl {
            op,
            serial: read_i64(buf, 8),
        })
    }
}

fn read_i32(buf: &[u8], off: usize) -> i32 {
    i32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_i64(buf: &[u8], off: usize) -> i64 {
    i64::from_le_bytes([
        buf[off],
        buf[off + 1],
        buf[off + 2],
        buf[off + 3],
        buf[off + 4],
        buf[off + 5],
        buf[off + 6],
        buf[off + 7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_broadcast_encodes_all_fields() {
        let info = FrameInfo {
            serial: 7,
            timestamp: 123_456_789,
            duration: 33_333_333,
            pts: -1,
            dts: -1,
            expires: 987_654_321,
            locked: 2,
            fourcc: u32::from(crate::fourcc::FourCC(*b"YUYV")),
            width: 1920,
            height: 1080,
            paddr: 0x8000_0000,
            size: 4_147_200,
            offset: 64,
            stride: 3840,
        };
        let event = FrameEvent::broadcast(info);
        assert!(event.is_frame());

        let decoded = FrameEvent::decode(&event.encode()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn response_serial_is_zero() {
        let resp = FrameEvent::response(ErrorKind::TooManyLocks, 0);
        assert!(!resp.is_frame());
        let decoded = FrameEvent::decode(&resp.encode()).unwrap();
        assert_eq!(decoded.error, ErrorKind::TooManyLocks);
        assert_eq!(decoded.info.serial, 0);
    }

    #[test]
    fn keepalive_is_not_a_frame() {
        let event = FrameEvent::keepalive();
        assert!(!event.is_frame());
        assert_eq!(event.error, ErrorKind::None);
    }

    #[test]
    fn control_round_trip() {
        let ctl = FrameControl::new(ControlOp::TryLock, 42);
        let decoded = FrameControl::decode(&ctl.encode()).unwrap();
        assert_eq!(decoded, ctl);
        assert_eq!(ctl.encode().len(), CONTROL_SIZE);
    }

    #[test]
    fn short_event_rejected() {
        let event = FrameEvent::keepalive().encode();
        assert!(matches!(
            FrameEvent::decode(&event[..EVENT_SIZE - 1]),
            Err(Error::BadMessage)
        ));
    }

    #[test]
    fn short_control_rejected() {
        assert!(matches!(
            FrameControl::decode(&[0u8; CONTROL_SIZE - 1]),
            Err(Error::BadMessage)
        ));
    }

    #[test]
    fn unknown_control_op_rejected() {
        let mut buf = FrameControl::new(ControlOp::Unlock, 1).encode();
        buf[0] = 0x7f;
        assert!(matches!(
            FrameControl::decode(&buf),
            Err(Error::InvalidControl)
        ));
    }

    #[test]
    fn unknown_error_code_rejected() {
        let mut buf = FrameEvent::keepalive().encode();
        buf[0] = 0x7f;
        assert!(matches!(FrameEvent::decode(&buf), Err(Error::BadMessage)));
    }
}
