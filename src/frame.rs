//! APCI frame codec for IEC 60870-5-104.
//!
//! Wire layout (APDU):
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------+----------+
//! | 0x68   | Length | Control Field (4 bytes)           | payload  |
//! +--------+--------+--------+--------+--------+--------+----------+
//! ```
//!
//! The length byte covers everything after it (control field plus payload).
//! Sequence numbers are 15-bit values wrapping at 32768.

use crate::error::{ApciError, ApciResult};

/// Start character of every APDU
pub const START_BYTE: u8 = 0x68;

/// Start byte plus length byte
pub const HEADER_LEN: usize = 2;

/// Control field size
pub const CONTROL_FIELD_LEN: usize = 4;

/// Maximum payload carried by one I-frame (length byte tops out at 253)
pub const MAX_PAYLOAD_LEN: usize = 249;

/// Default IEC 60870-5-104 TCP port
pub const DEFAULT_PORT: u16 = 2404;

/// Sequence numbers are 15-bit and wrap at this modulus
pub const SEQ_MODULO: u16 = 1 << 15;

/// Control field codes for U-format frames
const START_DT_ACT: u8 = 0x07; // Start data transfer activation
const START_DT_CON: u8 = 0x0B; // Start data transfer confirmation
const STOP_DT_ACT: u8 = 0x13; // Stop data transfer activation
const STOP_DT_CON: u8 = 0x23; // Stop data transfer confirmation
const TEST_FR_ACT: u8 = 0x43; // Test frame activation
const TEST_FR_CON: u8 = 0x83; // Test frame confirmation

// Link-teardown functions. The standard defines no codes for these; they use
// reserved control-field patterns that still carry the U-format marker bits.
const ABORT_LINK: u8 = 0x0F;
const RELEASE_ACT: u8 = 0x33;
const RELEASE_CON: u8 = 0x3F;

/// Function carried by an unnumbered (U-format) control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFunction {
    /// Start data transfer activation
    StartAct,
    /// Start data transfer confirmation
    StartCon,
    /// Stop data transfer activation
    StopAct,
    /// Stop data transfer confirmation
    StopCon,
    /// Test frame activation
    TestAct,
    /// Test frame confirmation
    TestCon,
    /// Abort the link without a handshake
    Abort,
    /// Request a clean link release
    ReleaseAct,
    /// Confirm a clean link release
    ReleaseCon,
}

impl ControlFunction {
    /// Convert the function to its control-field byte
    pub fn to_byte(self) -> u8 {
        match self {
            ControlFunction::StartAct => START_DT_ACT,
            ControlFunction::StartCon => START_DT_CON,
            ControlFunction::StopAct => STOP_DT_ACT,
            ControlFunction::StopCon => STOP_DT_CON,
            ControlFunction::TestAct => TEST_FR_ACT,
            ControlFunction::TestCon => TEST_FR_CON,
            ControlFunction::Abort => ABORT_LINK,
            ControlFunction::ReleaseAct => RELEASE_ACT,
            ControlFunction::ReleaseCon => RELEASE_CON,
        }
    }

    /// Create a function from a control-field byte
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            START_DT_ACT => Some(Self::StartAct),
            START_DT_CON => Some(Self::StartCon),
            STOP_DT_ACT => Some(Self::StopAct),
            STOP_DT_CON => Some(Self::StopCon),
            TEST_FR_ACT => Some(Self::TestAct),
            TEST_FR_CON => Some(Self::TestCon),
            ABORT_LINK => Some(Self::Abort),
            RELEASE_ACT => Some(Self::ReleaseAct),
            RELEASE_CON => Some(Self::ReleaseCon),
            _ => None,
        }
    }
}

/// One APCI frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// U-format (unnumbered control format)
    Control(ControlFunction),
    /// S-format (supervisory format): acknowledgment only
    Ack { recv_seq: u16 },
    /// I-format (information transfer format): sequenced payload with
    /// piggy-backed acknowledgment
    Data {
        send_seq: u16,
        recv_seq: u16,
        payload: Vec<u8>,
    },
}

impl Frame {
    /// How many bytes one complete frame needs, given a prefix of buffered
    /// bytes. Callers read more only when the returned size exceeds what is
    /// buffered. The start byte is validated as soon as it is visible.
    pub fn next_frame_size(prefix: &[u8]) -> ApciResult<usize> {
        if let Some(&first) = prefix.first() {
            if first != START_BYTE {
                return Err(ApciError::MalformedFrame(format!(
                    "invalid start character: {first:02X}"
                )));
            }
        }
        if prefix.len() < HEADER_LEN {
            return Ok(HEADER_LEN);
        }
        Ok(HEADER_LEN + prefix[1] as usize)
    }

    /// Encode the frame to bytes
    pub fn encode(&self) -> ApciResult<Vec<u8>> {
        let mut buffer = Vec::with_capacity(HEADER_LEN + CONTROL_FIELD_LEN);

        buffer.push(START_BYTE);

        // Reserve space for length
        buffer.push(0);

        match self {
            Frame::Data {
                send_seq,
                recv_seq,
                payload,
            } => {
                if payload.len() > MAX_PAYLOAD_LEN {
                    return Err(ApciError::PayloadTooLarge { len: payload.len() });
                }
                buffer.push(((send_seq << 1) & 0xFE) as u8);
                buffer.push((send_seq >> 7) as u8);
                buffer.push(((recv_seq << 1) & 0xFE) as u8);
                buffer.push((recv_seq >> 7) as u8);
                buffer.extend_from_slice(payload);
            }
            Frame::Ack { recv_seq } => {
                buffer.push(0x01);
                buffer.push(0x00);
                buffer.push(((recv_seq << 1) & 0xFE) as u8);
                buffer.push((recv_seq >> 7) as u8);
            }
            Frame::Control(function) => {
                buffer.push(function.to_byte());
                buffer.push(0x00);
                buffer.push(0x00);
                buffer.push(0x00);
            }
        }

        // Update length (excluding start character and length byte)
        let length = buffer.len() - HEADER_LEN;
        buffer[1] = length as u8;

        Ok(buffer)
    }

    /// Decode a frame from bytes
    pub fn decode(data: &[u8]) -> ApciResult<Self> {
        if data.len() < HEADER_LEN + CONTROL_FIELD_LEN {
            return Err(ApciError::MalformedFrame("frame too short".to_string()));
        }

        if data[0] != START_BYTE {
            return Err(ApciError::MalformedFrame(format!(
                "invalid start character: {:02X}",
                data[0]
            )));
        }

        let length = data[1] as usize;
        if length < CONTROL_FIELD_LEN || data.len() != length + HEADER_LEN {
            return Err(ApciError::MalformedFrame(format!(
                "length field {} does not match frame of {} bytes",
                length,
                data.len()
            )));
        }

        let control1 = data[2];

        if (control1 & 0x01) == 0 {
            // I-format
            let send_seq = (((data[3] as u16) << 7) | ((control1 as u16) >> 1)) & 0x7FFF;
            let recv_seq = (((data[5] as u16) << 7) | ((data[4] as u16) >> 1)) & 0x7FFF;
            Ok(Frame::Data {
                send_seq,
                recv_seq,
                payload: data[HEADER_LEN + CONTROL_FIELD_LEN..].to_vec(),
            })
        } else if (control1 & 0x03) == 0x01 {
            // S-format
            let recv_seq = (((data[5] as u16) << 7) | ((data[4] as u16) >> 1)) & 0x7FFF;
            Ok(Frame::Ack { recv_seq })
        } else {
            // U-format
            match ControlFunction::from_byte(control1) {
                Some(function) => Ok(Frame::Control(function)),
                None => Err(ApciError::MalformedFrame(format!(
                    "invalid control field: {control1:02X}"
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn control_frame_roundtrip() {
        for function in [
            ControlFunction::StartAct,
            ControlFunction::StartCon,
            ControlFunction::StopAct,
            ControlFunction::StopCon,
            ControlFunction::TestAct,
            ControlFunction::TestCon,
            ControlFunction::Abort,
            ControlFunction::ReleaseAct,
            ControlFunction::ReleaseCon,
        ] {
            let bytes = Frame::Control(function).encode().unwrap();
            assert_eq!(bytes.len(), 6);
            assert_eq!(Frame::decode(&bytes).unwrap(), Frame::Control(function));
        }
    }

    #[test]
    fn data_frame_wire_layout() {
        let frame = Frame::Data {
            send_seq: 5,
            recv_seq: 3,
            payload: vec![0xAA, 0xBB],
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes, vec![0x68, 0x06, 0x0A, 0x00, 0x06, 0x00, 0xAA, 0xBB]);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn sequence_numbers_survive_the_wrap_boundary() {
        let frame = Frame::Data {
            send_seq: SEQ_MODULO - 1,
            recv_seq: SEQ_MODULO - 1,
            payload: Vec::new(),
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn ack_frame_roundtrip() {
        let frame = Frame::Ack { recv_seq: 12345 };
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes[2], 0x01);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn invalid_start_byte_is_rejected() {
        let err = Frame::decode(&[0x69, 0x04, 0x07, 0x00, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, ApciError::MalformedFrame(_)));
        let err = Frame::next_frame_size(&[0x69]).unwrap_err();
        assert!(matches!(err, ApciError::MalformedFrame(_)));
    }

    #[test]
    fn unknown_control_function_is_rejected() {
        let err = Frame::decode(&[0x68, 0x04, 0xC3, 0x00, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, ApciError::MalformedFrame(_)));
    }

    #[test]
    fn length_field_must_match() {
        let err = Frame::decode(&[0x68, 0x05, 0x01, 0x00, 0x02, 0x00]).unwrap_err();
        assert!(matches!(err, ApciError::MalformedFrame(_)));
    }

    #[test]
    fn next_frame_size_reports_remaining_need() {
        assert_eq!(Frame::next_frame_size(&[]).unwrap(), 2);
        assert_eq!(Frame::next_frame_size(&[0x68]).unwrap(), 2);
        assert_eq!(Frame::next_frame_size(&[0x68, 0x0A]).unwrap(), 12);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let frame = Frame::Data {
            send_seq: 0,
            recv_seq: 0,
            payload: vec![0; MAX_PAYLOAD_LEN + 1],
        };
        assert!(matches!(
            frame.encode().unwrap_err(),
            ApciError::PayloadTooLarge { .. }
        ));
    }
}
