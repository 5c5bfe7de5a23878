//! PostgreSQL wire-protocol framing
//!
//! Two envelope shapes exist on the wire: the startup packet (4-byte
//! length + body, no type byte) and the regular message (1-byte type +
//! 4-byte length + payload). The proxy re-emits both verbatim, so the
//! decoded form keeps the raw payload bytes around.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Magic request codes carried in the startup packet position.
pub const SSL_REQUEST_CODE: u32 = 80877103;
pub const GSSENC_REQUEST_CODE: u32 = 80877104;
pub const CANCEL_REQUEST_CODE: u32 = 80877102;

/// Client-to-server message types the proxy intercepts.
pub const QUERY: u8 = b'Q';
pub const PARSE: u8 = b'P';
pub const TERMINATE: u8 = b'X';

/// Server-to-client message types with special handling.
pub const CLOSE_COMPLETE: u8 = b'3';
pub const PARAMETER_STATUS: u8 = b'S';

/// Regular messages are bounded to keep a broken peer from forcing an
/// unbounded allocation.
const MAX_MESSAGE_LEN: usize = 1 << 30;

/// A startup packet: the 4-byte length has been consumed, `body` is the
/// rest (protocol version or magic code, then parameters).
#[derive(Debug, Clone)]
pub struct StartupPacket {
    pub body: Bytes,
}

impl StartupPacket {
    pub fn code(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.body.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn is_ssl_request(&self) -> bool {
        self.code() == Some(SSL_REQUEST_CODE)
    }

    pub fn is_gssenc_request(&self) -> bool {
        self.code() == Some(GSSENC_REQUEST_CODE)
    }

    /// Key/value parameters of a StartupMessage (`user`, `database`, ...).
    pub fn parameters(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        let mut rest = &self.body[4.min(self.body.len())..];
        loop {
            let Some((key, after_key)) = split_cstr(rest) else {
                break;
            };
            if key.is_empty() {
                break;
            }
            let Some((value, after_value)) = split_cstr(after_key) else {
                break;
            };
            params.push((key, value));
            rest = after_value;
        }
        params
    }

    /// The exact bytes this packet arrived as.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.body.len());
        buf.extend_from_slice(&((self.body.len() + 4) as u32).to_be_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// A regular protocol message. `payload` excludes the type byte and the
/// length field.
#[derive(Debug, Clone)]
pub struct Message {
    pub tag: u8,
    pub payload: Bytes,
}

impl Message {
    /// The exact bytes this message arrived as.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.payload.len());
        buf.push(self.tag);
        buf.extend_from_slice(&((self.payload.len() + 4) as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// SQL text of a Query message.
    pub fn query_text(&self) -> Option<String> {
        if self.tag != QUERY {
            return None;
        }
        split_cstr(&self.payload).map(|(sql, _)| sql)
    }

    /// `(statement_name, sql)` of a Parse message.
    pub fn parse_statement(&self) -> Option<(String, String)> {
        if self.tag != PARSE {
            return None;
        }
        let (name, rest) = split_cstr(&self.payload)?;
        let (sql, _) = split_cstr(rest)?;
        Some((name, sql))
    }
}

fn split_cstr(data: &[u8]) -> Option<(String, &[u8])> {
    let end = data.iter().position(|&b| b == 0)?;
    let s = String::from_utf8_lossy(&data[..end]).into_owned();
    Some((s, &data[end + 1..]))
}

/// Reads a startup packet. Length bounds follow the protocol: at least the
/// length+code, and small enough to be a plausible parameter list.
pub async fn read_startup<R>(reader: &mut R) -> Result<StartupPacket>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if !(8..=10_000).contains(&len) {
        return Err(Error::Protocol(format!("invalid startup length: {len}")));
    }
    let mut body = vec![0u8; len - 4];
    reader.read_exact(&mut body).await?;
    Ok(StartupPacket { body: body.into() })
}

/// Reads one regular message.
pub async fn read_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag).await?;
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len < 4 || len - 4 > MAX_MESSAGE_LEN {
        return Err(Error::Protocol(format!(
            "invalid message length: {len} (type {:?})",
            tag[0] as char
        )));
    }
    let mut payload = vec![0u8; len - 4];
    reader.read_exact(&mut payload).await?;
    Ok(Message {
        tag: tag[0],
        payload: payload.into(),
    })
}
