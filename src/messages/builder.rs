//! Typed packet writers and small payload parsers.
//!
//! One function per protocol message, each returning the framed bytes.

use bytes::{BufMut, BytesMut};

use crate::errors::Error;

/// Create an AuthenticationOk message.
pub fn auth_ok() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(9);
    bytes.put_u8(b'R');
    bytes.put_i32(8);
    bytes.put_i32(0);
    bytes
}

/// Create an AuthenticationCleartextPassword request.
pub fn auth_request_cleartext() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(9);
    bytes.put_u8(b'R');
    bytes.put_i32(8);
    bytes.put_i32(3);
    bytes
}

/// Create an AuthenticationMD5Password request carrying `salt`.
pub fn auth_request_md5(salt: &[u8; 4]) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(13);
    bytes.put_u8(b'R');
    bytes.put_i32(12);
    bytes.put_i32(5);
    bytes.put_slice(salt);
    bytes
}

/// Create a ParameterStatus message.
pub fn parameter_status(key: &str, value: &str) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'S');
    bytes.put_i32(4 + key.len() as i32 + 1 + value.len() as i32 + 1);
    bytes.put_slice(key.as_bytes());
    bytes.put_u8(0);
    bytes.put_slice(value.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// Create a BackendKeyData message from an 8-byte cancel key.
pub fn backend_key_data(cancel_key: &[u8; 8]) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(13);
    bytes.put_u8(b'K');
    bytes.put_i32(12);
    bytes.put_slice(cancel_key);
    bytes
}

/// Create a ReadyForQuery message.
pub fn ready_for_query(in_transaction: bool) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(6);
    bytes.put_u8(b'Z');
    bytes.put_i32(5);
    if in_transaction {
        bytes.put_u8(b'T');
    } else {
        bytes.put_u8(b'I');
    }
    bytes
}

/// Create a simple Query message.
pub fn simple_query(query: &str) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'Q');
    bytes.put_i32(4 + query.len() as i32 + 1);
    bytes.put_slice(query.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// Create a PasswordMessage. `password` must not contain the trailing NUL.
pub fn password_message(password: &[u8]) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(password.len() + 6);
    bytes.put_u8(b'p');
    bytes.put_i32(4 + password.len() as i32 + 1);
    bytes.put_slice(password);
    bytes.put_u8(0);
    bytes
}

/// Create a StartupMessage for protocol 3.0.
///
/// `params` carries prebuilt NUL-terminated key/value pairs starting with
/// `database`; the `user` pair is written here.
pub fn startup_message(user: &str, params: &[u8]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i32(196608); // protocol 3.0
    body.put_slice(b"user\0");
    body.put_slice(user.as_bytes());
    body.put_u8(0);
    body.put_slice(params);
    body.put_u8(0);

    let mut bytes = BytesMut::with_capacity(body.len() + 4);
    bytes.put_i32(body.len() as i32 + 4);
    bytes.put(body);
    bytes
}

/// Create a legacy CancelRequest packet from an 8-byte backend key.
pub fn cancel_request(cancel_key: &[u8; 8]) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(16);
    bytes.put_i32(16);
    bytes.put_u32(super::header::PKT_CANCEL);
    bytes.put_slice(cancel_key);
    bytes
}

/// The one-byte refusal sent in answer to an SSL request.
pub fn ssl_deny() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(1);
    bytes.put_u8(b'N');
    bytes
}

/// Create an ErrorResponse with severity ERROR.
pub fn error_message(message: &str, code: &str) -> BytesMut {
    build_error("ERROR", message, code)
}

/// Create an ErrorResponse with severity FATAL, for login rejections.
pub fn fatal_message(message: &str, code: &str) -> BytesMut {
    build_error("FATAL", message, code)
}

fn build_error(severity: &str, message: &str, code: &str) -> BytesMut {
    let mut error = BytesMut::new();
    // Error level
    error.put_u8(b'S');
    error.put_slice(severity.as_bytes());
    error.put_u8(0);
    // Error level (non-translatable)
    error.put_u8(b'V');
    error.put_slice(severity.as_bytes());
    error.put_u8(0);
    // SQLSTATE
    error.put_u8(b'C');
    error.put_slice(code.as_bytes());
    error.put_u8(0);
    // The short error message.
    error.put_u8(b'M');
    error.put_slice(message.as_bytes());
    error.put_u8(0);
    // No more fields follow.
    error.put_u8(0);

    let mut bytes = BytesMut::with_capacity(error.len() + 5);
    bytes.put_u8(b'E');
    bytes.put_i32(error.len() as i32 + 4);
    bytes.put(error);
    bytes
}

/// Create the error the pooler sends on its own behalf, SQLSTATE `08P01`,
/// with a trailing ReadyForQuery when the client sits at an idle prompt.
pub fn pooler_error(message: &str, send_ready: bool) -> BytesMut {
    let mut bytes = error_message(message, "08P01");
    if send_ready {
        bytes.put(ready_for_query(false));
    }
    bytes
}

/// Create the authentication-failed error, SQLSTATE `28P01`.
pub fn wrong_password(user: &str) -> BytesMut {
    fatal_message(
        &format!("password authentication failed for user \"{user}\""),
        "28P01",
    )
}

/// Read a NUL-terminated string from the front of `buf`, returning it and
/// the rest.
pub fn get_cstr(buf: &[u8]) -> Option<(&str, &[u8])> {
    let nul = buf.iter().position(|&b| b == 0)?;
    let s = std::str::from_utf8(&buf[..nul]).ok()?;
    Some((s, &buf[nul + 1..]))
}

/// Parse a ParameterStatus payload into its key/value pair.
pub fn parse_parameter_status(payload: &[u8]) -> Option<(String, String)> {
    let (key, rest) = get_cstr(payload)?;
    let (value, _) = get_cstr(rest)?;
    Some((key.to_string(), value.to_string()))
}

/// Pull severity and message out of an ErrorResponse payload.
pub fn parse_error_fields(payload: &[u8]) -> (Option<String>, Option<String>) {
    let mut level = None;
    let mut msg = None;
    let mut rest = payload;
    while let Some((&kind, tail)) = rest.split_first() {
        if kind == 0 {
            break;
        }
        let Some((val, tail)) = get_cstr(tail) else {
            break;
        };
        match kind {
            b'S' => level = Some(val.to_string()),
            b'M' => msg = Some(val.to_string()),
            _ => {}
        }
        rest = tail;
    }
    (level, msg)
}

/// Parse a StartupMessage payload into its key/value pairs.
pub fn parse_startup_params(payload: &[u8]) -> Result<Vec<(String, String)>, Error> {
    let mut params = Vec::new();
    let mut rest = payload;
    loop {
        let Some((key, tail)) = get_cstr(rest) else {
            return Err(Error::Protocol("unterminated startup parameter".into()));
        };
        if key.is_empty() {
            break;
        }
        let Some((value, tail)) = get_cstr(tail) else {
            return Err(Error::Protocol(
                "startup parameter without a value".into(),
            ));
        };
        params.push((key.to_string(), value.to_string()));
        rest = tail;
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::header::{get_header, PktType};

    #[test]
    fn simple_query_frames_correctly() {
        let pkt = simple_query("SELECT 1;");
        let hdr = get_header(&pkt).unwrap().unwrap();
        assert_eq!(hdr.ptype, PktType::Typed(b'Q'));
        assert!(hdr.complete());
        assert_eq!(hdr.data, b"SELECT 1;\0");
    }

    #[test]
    fn parameter_status_round_trips() {
        let pkt = parameter_status("client_encoding", "UTF8");
        let hdr = get_header(&pkt).unwrap().unwrap();
        let (key, value) = parse_parameter_status(hdr.data).unwrap();
        assert_eq!(key, "client_encoding");
        assert_eq!(value, "UTF8");
    }

    #[test]
    fn pooler_error_appends_ready_when_idle() {
        let pkt = pooler_error("query_timeout", true);
        let hdr = get_header(&pkt).unwrap().unwrap();
        assert_eq!(hdr.ptype, PktType::Typed(b'E'));
        let (level, msg) = parse_error_fields(hdr.data);
        assert_eq!(level.as_deref(), Some("ERROR"));
        assert_eq!(msg.as_deref(), Some("query_timeout"));
        // SQLSTATE is in the payload.
        assert!(hdr
            .data
            .windows(6)
            .any(|w| w == b"08P01\0"));
        // Trailing ReadyForQuery.
        let tail = &pkt[hdr.len..];
        assert_eq!(tail, &ready_for_query(false)[..]);
    }

    #[test]
    fn startup_message_carries_user_then_params() {
        let pkt = startup_message("alice", b"database\0db1\0");
        // Length prefix covers the whole packet.
        let len = i32::from_be_bytes([pkt[0], pkt[1], pkt[2], pkt[3]]) as usize;
        assert_eq!(len, pkt.len());
        let code = i32::from_be_bytes([pkt[4], pkt[5], pkt[6], pkt[7]]);
        assert_eq!(code, 196608);
        let params = parse_startup_params(&pkt[8..]).unwrap();
        assert_eq!(
            params,
            vec![
                ("user".to_string(), "alice".to_string()),
                ("database".to_string(), "db1".to_string()),
            ]
        );
    }

    #[test]
    fn startup_params_reject_broken_pairs() {
        assert!(parse_startup_params(b"user\0alice\0dangling").is_err());
        assert!(parse_startup_params(b"user\0alice\0odd\0\0").is_err());
    }

    #[test]
    fn cancel_request_is_sixteen_bytes() {
        let pkt = cancel_request(&[9, 8, 7, 6, 5, 4, 3, 2]);
        assert_eq!(pkt.len(), 16);
        let hdr = get_header(&pkt).unwrap().unwrap();
        assert_eq!(hdr.ptype, PktType::Cancel);
        assert_eq!(hdr.data, &[9, 8, 7, 6, 5, 4, 3, 2]);
    }
}
