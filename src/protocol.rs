//! Postgres Wire Protocol Primitives
//!
//! The narrow slice of the v3 frontend/backend protocol this proxy actually
//! inspects: StartupMessage (untagged, length-prefixed), AuthenticationRequest
//! ('R', only the MD5 and Ok subtypes matter here), and PasswordMessage ('p').
//! Everything else passes through the duplex pipe unexamined.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, BytesMut};

/// Postgres protocol version 3.0
const PROTOCOL_VERSION_30: i32 = 196608; // 0x00030000

/// Sanity bound on StartupMessage length — neither a real client nor this
/// proxy's own handshake ever needs more than this, and it bounds
/// attacker-controlled allocation before the length prefix has been
/// validated against anything else.
const MAX_STARTUP_LEN: i64 = 10 * 1024;

/// Backend message type bytes this proxy cares about.
pub mod backend {
    pub const AUTHENTICATION: u8 = b'R';
    pub const ERROR_RESPONSE: u8 = b'E';
}

/// Authentication subtypes carried in the 4-byte payload of an
/// AuthenticationRequest.
pub mod auth {
    pub const OK: i32 = 0;
    pub const MD5_PASSWORD: i32 = 5;
}

// ─── StartupParameters ──────────────────────────────────────────────────────

/// Ordered mapping from parameter name to parameter value, as carried in a
/// StartupMessage. Backed by a `Vec` (not a `HashMap`) because the data
/// model calls out ordering explicitly, even though re-encoding is not
/// required to reproduce the input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupParams(Vec<(String, String)>);

impl StartupParams {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set `key` to `value`, updating in place if already present (so
    /// overwriting `user`/`database` does not move them to the end).
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self.0.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.0.push((key.to_string(), value));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A fully parsed StartupMessage.
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub params: StartupParams,
}

// ─── StartupMessage parsing ─────────────────────────────────────────────────

/// Try to read a complete StartupMessage from `buf`.
///
/// StartupMessages have no type byte — they start with `Int32 length`.
/// Returns `Ok(None)` if `buf` doesn't yet hold a complete frame (the
/// caller must read more from the socket and call again — this is what
/// makes the decoder correct for a StartupMessage split across multiple
/// TCP segments). Consumes the message from `buf` on success.
pub fn try_read_startup(buf: &mut BytesMut) -> Result<Option<StartupMessage>, String> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let length = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as i64;
    if length < 8 {
        return Err(format!("malformed startup message: length {length} too small"));
    }
    if length > MAX_STARTUP_LEN {
        return Err(format!("startup message too large ({length} bytes)"));
    }
    let length = length as usize;
    if buf.len() < length {
        return Ok(None);
    }

    let msg = buf.split_to(length);
    let version = i32::from_be_bytes([msg[4], msg[5], msg[6], msg[7]]);
    if version != PROTOCOL_VERSION_30 {
        return Err(format!("unsupported protocol version {version}"));
    }

    let params = decode_params(&msg[8..])?;
    Ok(Some(StartupMessage { params }))
}

/// Decode the `repeated (CString key, CString value) | 0x00` tail of a
/// StartupMessage (everything after the Int32 length and Int32 version).
fn decode_params(body: &[u8]) -> Result<StartupParams, String> {
    let mut params = StartupParams::new();
    let mut offset = 0;

    loop {
        if offset >= body.len() {
            return Err("malformed startup message: missing terminator".into());
        }
        if body[offset] == 0 {
            offset += 1;
            break;
        }

        let key_end = find_nul(body, offset)
            .ok_or("malformed startup message: unterminated parameter key")?;
        let key = String::from_utf8_lossy(&body[offset..key_end]).into_owned();
        offset = key_end + 1;

        let val_end = find_nul(body, offset)
            .ok_or_else(|| format!("malformed startup message: parameter '{key}' has no value"))?;
        let value = String::from_utf8_lossy(&body[offset..val_end]).into_owned();
        offset = val_end + 1;

        params.set(&key, value);
    }

    if offset != body.len() {
        return Err("malformed startup message: trailing bytes after terminator".into());
    }

    Ok(params)
}

fn find_nul(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..].iter().position(|&b| b == 0).map(|p| from + p)
}

/// Encode a StartupMessage with the given parameters. It is the caller's
/// responsibility to have already substituted `user`/`database` with the
/// resolved backend credentials.
pub fn build_startup_message(params: &StartupParams) -> BytesMut {
    let mut data_len = 4; // protocol version
    for (key, value) in params.iter() {
        data_len += key.len() + 1 + value.len() + 1;
    }
    data_len += 1; // terminating zero byte

    let total_len = 4 + data_len;
    let mut buf = BytesMut::with_capacity(total_len);

    buf.put_i32(total_len as i32);
    buf.put_i32(PROTOCOL_VERSION_30);
    for (key, value) in params.iter() {
        buf.put_slice(key.as_bytes());
        buf.put_u8(0);
        buf.put_slice(value.as_bytes());
        buf.put_u8(0);
    }
    buf.put_u8(0);

    buf
}

// ─── AuthenticationRequest / PasswordMessage ────────────────────────────────

/// Returns the 4-byte salt iff `frame` is a well-formed
/// AuthenticationMD5Password message: `'R' | len=12 | type=5 | salt[4]`.
pub fn is_md5_auth_request(frame: &[u8]) -> Option<[u8; 4]> {
    if frame.len() < 13 || frame[0] != backend::AUTHENTICATION {
        return None;
    }
    let length = i32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
    if length != 12 {
        return None;
    }
    let auth_type = i32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]]);
    if auth_type != auth::MD5_PASSWORD {
        return None;
    }
    Some([frame[9], frame[10], frame[11], frame[12]])
}

/// Returns true iff `frame` is AuthenticationOk (`'R' | len=8 | type=0`).
pub fn is_auth_ok(frame: &[u8]) -> bool {
    if frame.len() < 9 || frame[0] != backend::AUTHENTICATION {
        return false;
    }
    let length = i32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
    let auth_type = i32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]]);
    length == 8 && auth_type == auth::OK
}

/// Build a PasswordMessage (`'p' | Int32 len | CString md5_hex`).
pub fn build_password_message(md5_hex: &str) -> BytesMut {
    let msg_len = 4 + md5_hex.len() + 1;
    let mut buf = BytesMut::with_capacity(1 + msg_len);
    buf.put_u8(b'p');
    buf.put_i32(msg_len as i32);
    buf.put_slice(md5_hex.as_bytes());
    buf.put_u8(0);
    buf
}

// ─── Generic backend frame reader (handshake window only) ──────────────────

/// A single tagged backend message: `u8 type | Int32 length | payload`.
/// `raw` retains the full frame (type byte included) for pass-through
/// forwarding to the client.
pub struct BackendMessage {
    pub msg_type: u8,
    pub raw: BytesMut,
    pub payload: BytesMut,
}

impl BackendMessage {
    pub fn is_error_response(&self) -> bool {
        self.msg_type == backend::ERROR_RESPONSE
    }

    /// Best-effort human-readable message extracted from an ErrorResponse,
    /// used only for diagnostics — never forwarded to the client verbatim.
    pub fn error_message(&self) -> String {
        if !self.is_error_response() {
            return String::from("not an error");
        }
        let mut message = None;
        let mut offset = 0;
        let data = &self.payload;

        while offset < data.len() {
            let field_type = data[offset];
            if field_type == 0 {
                break;
            }
            offset += 1;
            let str_end = data[offset..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| offset + p)
                .unwrap_or(data.len());
            let value = String::from_utf8_lossy(&data[offset..str_end]).into_owned();
            offset = str_end + 1;
            if field_type == b'M' {
                message = Some(value);
            }
        }

        message.unwrap_or_else(|| String::from("unknown error"))
    }
}

/// Try to read one complete backend message out of `buf`. Returns `None`
/// if `buf` doesn't yet hold a complete frame. Consumes the message from
/// `buf` on success.
pub fn try_read_backend_message(buf: &mut BytesMut) -> Option<BackendMessage> {
    if buf.len() < 5 {
        return None;
    }

    let msg_type = buf[0];
    let length = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    let total_length = 1 + length;

    if buf.len() < total_length {
        return None;
    }

    let raw = BytesMut::from(&buf[..total_length]);
    let payload = BytesMut::from(&buf[5..total_length]);
    buf.advance(total_length);

    Some(BackendMessage {
        msg_type,
        raw,
        payload,
    })
}
