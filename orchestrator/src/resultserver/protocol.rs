use serde::{Deserialize, Serialize};

use shared::{DetectorError, Result};

/// Largest frame body accepted from a guest.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Kind byte followed by a big-endian body length.
pub const FRAME_HEADER_LEN: usize = 5;

const KIND_OPEN: u8 = 0x01;
const KIND_PAYLOAD: u8 = 0x02;
const KIND_CLOSE: u8 = 0x03;

/// Stream format selected by the negotiation line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Framed process-log stream.
    Framed,
    /// Analyzer debug log, stored byte for byte.
    AnalysisLog,
}

impl Protocol {
    pub fn from_token(token: &str) -> Result<Self> {
        match token.trim() {
            "v1" | "BSON" => Ok(Protocol::Framed),
            "LOG" => Ok(Protocol::AnalysisLog),
            other => Err(DetectorError::Result(format!("unsupported protocol \"{}\"", other))),
        }
    }
}

/// Announces the process whose telemetry follows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenProcess {
    pub pid: u32,
    pub ppid: Option<u32>,
    pub process_name: String,
    #[serde(default)]
    pub track: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Open(OpenProcess),
    Payload(Vec<u8>),
    Close,
}

impl Frame {
    /// Body length announced by a frame header. Oversized frames are rejected.
    pub fn body_len(header: &[u8; FRAME_HEADER_LEN]) -> Result<usize> {
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(DetectorError::Result(format!(
                "frame of {} bytes exceeds the {} byte limit",
                len, MAX_FRAME_SIZE
            )));
        }
        Ok(len)
    }

    pub fn parse(kind: u8, body: Vec<u8>) -> Result<Self> {
        match kind {
            KIND_OPEN => serde_json::from_slice(&body)
                .map(Frame::Open)
                .map_err(|e| DetectorError::Result(format!("invalid open-process record: {}", e))),
            KIND_PAYLOAD => Ok(Frame::Payload(body)),
            KIND_CLOSE => Ok(Frame::Close),
            other => Err(DetectorError::Result(format!("unknown record kind 0x{:02x}", other))),
        }
    }

    /// Wire form of the frame, header included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (kind, body) = match self {
            Frame::Open(record) => (
                KIND_OPEN,
                serde_json::to_vec(record).map_err(|e| DetectorError::Result(e.to_string()))?,
            ),
            Frame::Payload(bytes) => (KIND_PAYLOAD, bytes.clone()),
            Frame::Close => (KIND_CLOSE, Vec::new()),
        };
        if body.len() > MAX_FRAME_SIZE {
            return Err(DetectorError::Result(format!("frame of {} bytes is too large", body.len())));
        }

        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        out.push(kind);
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_negotiation_tokens() {
        assert_eq!(Protocol::from_token("v1").unwrap(), Protocol::Framed);
        assert_eq!(Protocol::from_token("BSON").unwrap(), Protocol::Framed);
        assert_eq!(Protocol::from_token("LOG").unwrap(), Protocol::AnalysisLog);

        let err = Protocol::from_token("FILE").unwrap_err();
        assert!(matches!(err, DetectorError::Result(_)));
    }

    #[test]
    fn test_open_record_with_null_ppid() {
        let frame = Frame::parse(
            KIND_OPEN,
            br#"{"pid":100,"ppid":null,"process_name":"a.exe","track":true}"#.to_vec(),
        )
        .unwrap();
        assert_eq!(
            frame,
            Frame::Open(OpenProcess {
                pid: 100,
                ppid: None,
                process_name: "a.exe".to_string(),
                track: true,
            })
        );
    }

    #[test]
    fn test_undecodable_records_are_protocol_errors() {
        assert!(Frame::parse(KIND_OPEN, b"{\"pid\":\"x\"}".to_vec()).is_err());
        assert!(Frame::parse(0x7f, Vec::new()).is_err());
    }

    #[test]
    fn test_oversized_header_is_rejected() {
        let mut header = [KIND_PAYLOAD, 0, 0, 0, 0];
        header[1..].copy_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        assert!(Frame::body_len(&header).is_err());

        header[1..].copy_from_slice(&10u32.to_be_bytes());
        assert_eq!(Frame::body_len(&header).unwrap(), 10);
    }
}
