//! Wire format shared with the child.
//!
//! A frame is one code byte, a UTF-8 payload and a terminating NUL. The codes
//! are fixed so an unmodified child keeps working.

use crate::configs::Properties;
use color_eyre::eyre::bail;
use color_eyre::Result;
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::warn;

/// Longest frame accepted from the child, terminator included.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const LOG_BASE: u8 = 116;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug = 1,
    Info = 2,
    Status = 3,
    Warn = 4,
    Error = 5,
    Fatal = 6,
}

impl LogLevel {
    fn from_u8(level: u8) -> Option<Self> {
        Some(match level {
            1 => Self::Debug,
            2 => Self::Info,
            3 => Self::Status,
            4 => Self::Warn,
            5 => Self::Error,
            6 => Self::Fatal,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCode {
    Start,
    Stop,
    Restart,
    Ping,
    StopPending,
    StartPending,
    Started,
    Stopped,
    Key,
    BadKey,
    LowLogLevel,
    PingTimeout,
    ServiceControlCode,
    Properties,
    Log(LogLevel),
    Unknown(u8),
}

impl MessageCode {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Start => 100,
            Self::Stop => 101,
            Self::Restart => 102,
            Self::Ping => 103,
            Self::StopPending => 104,
            Self::StartPending => 105,
            Self::Started => 106,
            Self::Stopped => 107,
            Self::Key => 110,
            Self::BadKey => 111,
            Self::LowLogLevel => 112,
            Self::PingTimeout => 113,
            Self::ServiceControlCode => 114,
            Self::Properties => 115,
            Self::Log(level) => LOG_BASE + level as u8,
            Self::Unknown(code) => code,
        }
    }
}

impl From<u8> for MessageCode {
    fn from(code: u8) -> Self {
        match code {
            100 => Self::Start,
            101 => Self::Stop,
            102 => Self::Restart,
            103 => Self::Ping,
            104 => Self::StopPending,
            105 => Self::StartPending,
            106 => Self::Started,
            107 => Self::Stopped,
            110 => Self::Key,
            111 => Self::BadKey,
            112 => Self::LowLogLevel,
            113 => Self::PingTimeout,
            114 => Self::ServiceControlCode,
            115 => Self::Properties,
            c if c > LOG_BASE => match LogLevel::from_u8(c - LOG_BASE) {
                Some(level) => Self::Log(level),
                None => Self::Unknown(c),
            },
            c => Self::Unknown(c),
        }
    }
}

impl fmt::Display for MessageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Log(level) => write!(f, "LOG({level:?})"),
            Self::Unknown(code) => write!(f, "UNKNOWN({code})"),
            other => write!(f, "{}", format!("{other:?}").to_uppercase()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub code: MessageCode,
    pub payload: String,
}

impl ControlMessage {
    pub fn new(code: MessageCode, payload: impl Into<String>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.as_bytes().contains(&0) {
            bail!("{} payload contains a NUL byte", self.code);
        }
        let mut frame = Vec::with_capacity(self.payload.len() + 2);
        frame.push(self.code.to_u8());
        frame.extend_from_slice(self.payload.as_bytes());
        frame.push(0);
        Ok(frame)
    }

    /// Decodes one frame, with or without its terminator.
    pub fn decode(frame: &[u8]) -> Option<Self> {
        let frame = frame.strip_suffix(&[0]).unwrap_or(frame);
        let (&code, payload) = frame.split_first()?;
        Some(Self {
            code: MessageCode::from(code),
            payload: String::from_utf8_lossy(payload).into_owned(),
        })
    }

    /// Wait hint carried by START_PENDING and STOP_PENDING, in whole seconds,
    /// rounded up.
    pub fn wait_hint_secs(&self) -> Option<i32> {
        let millis: i64 = self.payload.trim().parse().ok()?;
        let millis = millis.max(0);
        Some(((millis + 999) / 1000).min(i32::MAX as i64) as i32)
    }
}

/// Reads the next frame. Returns `None` at end of stream. Oversized frames
/// are skipped up to their terminator.
pub async fn read_frame<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<ControlMessage>> {
    loop {
        let mut frame = Vec::new();
        let read = (&mut *reader)
            .take(MAX_FRAME_LEN as u64)
            .read_until(0, &mut frame)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if frame.last() == Some(&0) {
            match ControlMessage::decode(&frame) {
                Some(message) => return Ok(Some(message)),
                None => continue,
            }
        }
        if read < MAX_FRAME_LEN {
            // stream ended in the middle of a frame
            return Ok(None);
        }
        warn!("Discarding control frame longer than {MAX_FRAME_LEN} bytes");
        let mut skipped = Vec::new();
        loop {
            skipped.clear();
            let read = (&mut *reader)
                .take(MAX_FRAME_LEN as u64)
                .read_until(0, &mut skipped)
                .await?;
            if read == 0 {
                return Ok(None);
            }
            if skipped.last() == Some(&0) {
                break;
            }
        }
    }
}

/// Flattens properties into `key=value` pairs joined by `separator`. A
/// separator inside a key or value is written twice.
pub fn linearize_properties(properties: &Properties, separator: u8) -> String {
    let sep = char::from(separator);
    let doubled: String = [sep, sep].iter().collect();
    properties
        .iter()
        .map(|(key, value)| {
            format!("{key}={value}").replace(sep, &doubled)
        })
        .collect::<Vec<_>>()
        .join(&sep.to_string())
}
