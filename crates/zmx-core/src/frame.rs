//! Framed wire codec for client/daemon IPC.
//!
//! Every unit on the wire is one frame: a tag byte, a little-endian u32
//! payload length, then the payload. The decoder is pull-style and never
//! copies payloads; callers hold them as borrowed views into the read
//! buffer.

use crate::error::ZmxError;

/// Frame header size: tag byte plus LE u32 length.
pub const HEADER_LEN: usize = 5;

/// Declared payload lengths above this are rejected outright so a bad
/// peer cannot make the read buffer grow without bound.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Message kinds carried in the tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    /// client→daemon: raw keystroke bytes.
    Input = 0,
    /// daemon→client: raw PTY bytes, or a serialized snapshot on re-attach.
    Output = 1,
    /// client→daemon: initial window size.
    Init = 2,
    /// client→daemon: window size change.
    Resize = 3,
    /// client→daemon: detach this one client.
    Detach = 4,
    /// any→daemon: detach every client, session keeps running.
    DetachAll = 5,
    /// any→daemon: terminate the session.
    Kill = 6,
    /// Empty request; fixed-size reply described by [`InfoPayload`].
    Info = 7,
    /// One-byte format request; reply carries the serialized scrollback.
    History = 8,
    /// client→daemon: command bytes to inject into the PTY.
    Run = 9,
    /// daemon→client: acknowledges a `Run`.
    Ack = 10,
}

impl Tag {
    pub fn from_byte(b: u8) -> Option<Tag> {
        Some(match b {
            0 => Tag::Input,
            1 => Tag::Output,
            2 => Tag::Init,
            3 => Tag::Resize,
            4 => Tag::Detach,
            5 => Tag::DetachAll,
            6 => Tag::Kill,
            7 => Tag::Info,
            8 => Tag::History,
            9 => Tag::Run,
            10 => Tag::Ack,
            _ => return None,
        })
    }
}

/// Parsed frame header; the payload follows in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: Tag,
    pub payload_len: usize,
}

/// Encode one frame into a fresh vector.
pub fn encode(tag: Tag, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    encode_into(&mut out, tag, payload);
    out
}

/// Append one frame to an existing buffer.
pub fn encode_into(out: &mut Vec<u8>, tag: Tag, payload: &[u8]) {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    out.push(tag as u8);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Parse a frame header from the front of `buf`.
///
/// Returns `Ok(None)` while more bytes are needed to complete either the
/// header or the payload, `Ok(Some(header))` once the whole frame is
/// present, and `Err` for tags out of range or oversize lengths.
pub fn decode(buf: &[u8]) -> Result<Option<Header>, ZmxError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let tag = Tag::from_byte(buf[0])
        .ok_or_else(|| ZmxError::Malformed(format!("tag {} out of range", buf[0])))?;
    let payload_len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if payload_len > MAX_PAYLOAD {
        return Err(ZmxError::Malformed(format!(
            "declared payload of {} bytes exceeds the {} byte limit",
            payload_len, MAX_PAYLOAD
        )));
    }
    if buf.len() < HEADER_LEN + payload_len {
        return Ok(None);
    }
    Ok(Some(Header { tag, payload_len }))
}

/// `Init`/`Resize` payload: rows then cols, LE u16 each.
pub fn encode_winsize(rows: u16, cols: u16) -> [u8; 4] {
    let mut out = [0u8; 4];
    out[..2].copy_from_slice(&rows.to_le_bytes());
    out[2..].copy_from_slice(&cols.to_le_bytes());
    out
}

/// Parse an `Init`/`Resize` payload; `None` if the size is wrong.
pub fn decode_winsize(payload: &[u8]) -> Option<(u16, u16)> {
    if payload.len() != 4 {
        return None;
    }
    let rows = u16::from_le_bytes([payload[0], payload[1]]);
    let cols = u16::from_le_bytes([payload[2], payload[3]]);
    Some((rows, cols))
}

/// Serialization format byte carried by a `History` request and honored
/// by the terminal backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SerializeFormat {
    /// Trimmed UTF-8 text.
    #[default]
    Plain = 0,
    /// Self-contained escape stream reproducing the screen on a reset terminal.
    Vt = 1,
    /// Styled `<pre>` markup.
    Html = 2,
}

impl SerializeFormat {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => SerializeFormat::Plain,
            1 => SerializeFormat::Vt,
            2 => SerializeFormat::Html,
            _ => return None,
        })
    }
}

/// Fixed capacity of the command field in an `Info` reply.
pub const INFO_MAX_CMD: usize = 256;
/// Fixed capacity of the working-directory field in an `Info` reply.
pub const INFO_MAX_CWD: usize = 256;
/// Total size of an `Info` reply payload. Probes key on this.
pub const INFO_PAYLOAD_LEN: usize = 8 + 4 + 2 + 2 + INFO_MAX_CMD + INFO_MAX_CWD;

/// `Info` reply: session vitals in a fixed-size record so the probe can
/// validate a reply without negotiation.
///
/// The command vector is NUL-joined inside the `cmd` field; `fork` splits
/// it back apart, display code joins it with spaces. An empty vector
/// means the session runs the login shell.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfoPayload {
    pub clients: u64,
    pub pid: i32,
    pub cmd: Vec<String>,
    pub cwd: String,
}

impl InfoPayload {
    pub fn encode(&self) -> [u8; INFO_PAYLOAD_LEN] {
        let mut out = [0u8; INFO_PAYLOAD_LEN];
        out[..8].copy_from_slice(&self.clients.to_le_bytes());
        out[8..12].copy_from_slice(&self.pid.to_le_bytes());

        let joined = self.cmd.join("\0");
        let cmd_bytes = truncated(joined.as_bytes(), INFO_MAX_CMD);
        let cwd_bytes = truncated(self.cwd.as_bytes(), INFO_MAX_CWD);

        out[12..14].copy_from_slice(&(cmd_bytes.len() as u16).to_le_bytes());
        out[14..16].copy_from_slice(&(cwd_bytes.len() as u16).to_le_bytes());
        out[16..16 + cmd_bytes.len()].copy_from_slice(cmd_bytes);
        out[16 + INFO_MAX_CMD..16 + INFO_MAX_CMD + cwd_bytes.len()].copy_from_slice(cwd_bytes);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ZmxError> {
        if payload.len() != INFO_PAYLOAD_LEN {
            return Err(ZmxError::Malformed(format!(
                "info payload is {} bytes, expected {}",
                payload.len(),
                INFO_PAYLOAD_LEN
            )));
        }
        let clients = u64::from_le_bytes(payload[..8].try_into().unwrap());
        let pid = i32::from_le_bytes(payload[8..12].try_into().unwrap());
        let cmd_len = u16::from_le_bytes(payload[12..14].try_into().unwrap()) as usize;
        let cwd_len = u16::from_le_bytes(payload[14..16].try_into().unwrap()) as usize;
        if cmd_len > INFO_MAX_CMD || cwd_len > INFO_MAX_CWD {
            return Err(ZmxError::Malformed("info field length out of range".into()));
        }
        let cmd_raw = String::from_utf8_lossy(&payload[16..16 + cmd_len]);
        let cmd = if cmd_raw.is_empty() {
            Vec::new()
        } else {
            cmd_raw.split('\0').map(str::to_owned).collect()
        };
        let cwd =
            String::from_utf8_lossy(&payload[16 + INFO_MAX_CMD..16 + INFO_MAX_CMD + cwd_len])
                .into_owned();
        Ok(InfoPayload {
            clients,
            pid,
            cmd,
            cwd,
        })
    }
}

/// Clip to `max` bytes without splitting a UTF-8 sequence.
fn truncated(bytes: &[u8], max: usize) -> &[u8] {
    if bytes.len() <= max {
        return bytes;
    }
    let mut end = max;
    while end > 0 && bytes[end] & 0xC0 == 0x80 {
        end -= 1;
    }
    &bytes[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TAGS: [Tag; 11] = [
        Tag::Input,
        Tag::Output,
        Tag::Init,
        Tag::Resize,
        Tag::Detach,
        Tag::DetachAll,
        Tag::Kill,
        Tag::Info,
        Tag::History,
        Tag::Run,
        Tag::Ack,
    ];

    #[test]
    fn encode_decode_round_trip() {
        for tag in ALL_TAGS {
            for payload in [&b""[..], b"x", b"hello world", &[0u8; 300]] {
                let wire = encode(tag, payload);
                let header = decode(&wire).unwrap().expect("complete frame");
                assert_eq!(header.tag, tag);
                assert_eq!(header.payload_len, payload.len());
                assert_eq!(&wire[HEADER_LEN..HEADER_LEN + header.payload_len], payload);
            }
        }
    }

    #[test]
    fn tag_bytes_round_trip() {
        for tag in ALL_TAGS {
            assert_eq!(Tag::from_byte(tag as u8), Some(tag));
        }
        assert_eq!(Tag::from_byte(11), None);
        assert_eq!(Tag::from_byte(255), None);
    }

    #[test]
    fn incomplete_frames_need_more() {
        let wire = encode(Tag::Input, b"abcdef");
        for cut in 0..wire.len() {
            assert!(decode(&wire[..cut]).unwrap().is_none(), "cut at {cut}");
        }
        assert!(decode(&wire).unwrap().is_some());
    }

    #[test]
    fn rejects_bad_tag_and_oversize() {
        let mut wire = encode(Tag::Input, b"x");
        wire[0] = 42;
        assert!(matches!(decode(&wire), Err(ZmxError::Malformed(_))));

        let mut oversize = vec![Tag::Output as u8];
        oversize.extend_from_slice(&(MAX_PAYLOAD as u32 + 1).to_le_bytes());
        assert!(matches!(decode(&oversize), Err(ZmxError::Malformed(_))));
    }

    #[test]
    fn winsize_round_trip() {
        let payload = encode_winsize(52, 211);
        assert_eq!(decode_winsize(&payload), Some((52, 211)));
        assert_eq!(decode_winsize(b"abc"), None);
        assert_eq!(decode_winsize(b"abcde"), None);
    }

    #[test]
    fn info_round_trip() {
        let info = InfoPayload {
            clients: 3,
            pid: 4321,
            cmd: vec!["htop".into(), "-d".into(), "10".into()],
            cwd: "/home/user/project".into(),
        };
        let wire = info.encode();
        assert_eq!(wire.len(), INFO_PAYLOAD_LEN);
        assert_eq!(InfoPayload::decode(&wire).unwrap(), info);
    }

    #[test]
    fn info_empty_command_is_login_shell() {
        let info = InfoPayload {
            clients: 0,
            pid: 1,
            cmd: Vec::new(),
            cwd: "/".into(),
        };
        let decoded = InfoPayload::decode(&info.encode()).unwrap();
        assert!(decoded.cmd.is_empty());
    }

    #[test]
    fn info_truncates_long_fields() {
        let info = InfoPayload {
            clients: 1,
            pid: 2,
            cmd: vec!["x".repeat(400)],
            cwd: "y".repeat(400),
        };
        let decoded = InfoPayload::decode(&info.encode()).unwrap();
        assert_eq!(decoded.cmd[0].len(), INFO_MAX_CMD);
        assert_eq!(decoded.cwd.len(), INFO_MAX_CWD);
    }

    #[test]
    fn info_truncation_respects_utf8() {
        let info = InfoPayload {
            clients: 1,
            pid: 2,
            cmd: vec!["é".repeat(200)],
            cwd: String::new(),
        };
        // Must not split the two-byte sequence that straddles the limit.
        let decoded = InfoPayload::decode(&info.encode()).unwrap();
        assert!(decoded.cmd[0].chars().all(|c| c == 'é'));
    }

    #[test]
    fn info_wrong_size_is_malformed() {
        assert!(matches!(
            InfoPayload::decode(&[0u8; 10]),
            Err(ZmxError::Malformed(_))
        ));
    }

    #[test]
    fn history_format_bytes() {
        assert_eq!(SerializeFormat::from_byte(0), Some(SerializeFormat::Plain));
        assert_eq!(SerializeFormat::from_byte(1), Some(SerializeFormat::Vt));
        assert_eq!(SerializeFormat::from_byte(2), Some(SerializeFormat::Html));
        assert_eq!(SerializeFormat::from_byte(3), None);
    }
}
