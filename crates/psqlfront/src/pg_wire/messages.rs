//! Server-to-client message builders
//!
//! The proxy injects only three message kinds of its own: NoticeResponse
//! (cache-hit and soft-timeout notices), ErrorResponse (handler failures),
//! and CloseComplete (clean termination). A Terminate builder covers the
//! upstream-side goodbye.

use crate::error::sqlstate;

/// NoticeResponse: 'N' + length + (S severity, C code, M message) + NUL.
pub fn notice_response(severity: &str, message: &str) -> Vec<u8> {
    with_fields(b'N', severity, sqlstate::SUCCESSFUL_COMPLETION, message)
}

/// ErrorResponse: 'E' + length + (S ERROR, C sqlstate, M message) + NUL.
pub fn error_response(code: &str, message: &str) -> Vec<u8> {
    with_fields(b'E', "ERROR", code, message)
}

fn with_fields(tag: u8, severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut buf = vec![tag];
    buf.extend_from_slice(&[0, 0, 0, 0]); // length placeholder

    buf.push(b'S');
    buf.extend_from_slice(severity.as_bytes());
    buf.push(0);

    buf.push(b'C');
    buf.extend_from_slice(code.as_bytes());
    buf.push(0);

    buf.push(b'M');
    buf.extend_from_slice(message.as_bytes());
    buf.push(0);

    buf.push(0);

    let len = (buf.len() - 1) as u32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());
    buf
}

pub fn close_complete() -> Vec<u8> {
    vec![b'3', 0, 0, 0, 4]
}

pub fn terminate() -> Vec<u8> {
    vec![b'X', 0, 0, 0, 4]
}
