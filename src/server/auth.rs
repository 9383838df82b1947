//! Answering server authentication requests.

use bytes::BytesMut;
use md5::{Digest, Md5};

use crate::errors::{Error, ServerAuthError, ServerIdentifier};
use crate::messages::password_message;

/// What to do after an Authentication packet.
pub(crate) enum AuthAnswer {
    /// Authentication complete, nothing to send.
    Done,
    /// Send this packet and keep waiting.
    Send(BytesMut),
}

/// Answer one Authentication request from a server. The method code sits
/// in the first four payload bytes, followed by method-specific salt.
pub(crate) fn answer_auth_request(
    payload: &[u8],
    id: &ServerIdentifier,
    user: &str,
    passwd: &str,
) -> Result<AuthAnswer, Error> {
    if payload.len() < 4 {
        return Err(ServerAuthError::Truncated { id: id.clone() }.into());
    }
    let method = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);

    match method {
        // AuthenticationOk
        0 => Ok(AuthAnswer::Done),

        // Cleartext password
        3 => {
            if passwd.is_empty() {
                return Err(ServerAuthError::PasswordMissing { id: id.clone() }.into());
            }
            Ok(AuthAnswer::Send(password_message(passwd.as_bytes())))
        }

        // MD5 password: four salt bytes follow the method code.
        5 => {
            if payload.len() < 8 {
                return Err(ServerAuthError::Truncated { id: id.clone() }.into());
            }
            if passwd.is_empty() {
                return Err(ServerAuthError::PasswordMissing { id: id.clone() }.into());
            }
            let salt = &payload[4..8];
            let hashed = if is_md5(passwd) {
                md5_hash_second_pass(&passwd[3..], salt)
            } else {
                md5_hash_password(user, passwd, salt)
            };
            Ok(AuthAnswer::Send(password_message(hashed.as_bytes())))
        }

        // Kerberos, crypt, SCM credentials: nothing we can answer.
        2 | 4 | 6 => Err(ServerAuthError::UnsupportedMethod {
            id: id.clone(),
            method,
        }
        .into()),

        _ => Err(ServerAuthError::UnknownMethod {
            id: id.clone(),
            method,
        }
        .into()),
    }
}

/// A stored password that is already an md5 digest: `md5` + 32 hex chars.
pub(crate) fn is_md5(passwd: &str) -> bool {
    passwd.len() == 35 && passwd.starts_with("md5")
}

/// First pass: `md5(password ∥ user)`, then salt it.
pub(crate) fn md5_hash_password(user: &str, password: &str, salt: &[u8]) -> String {
    let mut md5 = Md5::new();
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());
    let inner = format!("{:x}", md5.finalize());
    md5_hash_second_pass(&inner, salt)
}

/// Second pass: `"md5" ∥ hex(md5(hash ∥ salt))`.
pub(crate) fn md5_hash_second_pass(hash: &str, salt: &[u8]) -> String {
    let mut md5 = Md5::new();
    md5.update(hash.as_bytes());
    md5.update(salt);
    format!("md5{:x}", md5.finalize())
}

/// Verify a client's md5 PasswordMessage against the stored credential.
pub(crate) fn check_md5_client(given: &str, stored: &str, user: &str, salt: &[u8; 4]) -> bool {
    let expected = if is_md5(stored) {
        md5_hash_second_pass(&stored[3..], salt)
    } else {
        md5_hash_password(user, stored, salt)
    };
    expected == given
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident() -> ServerIdentifier {
        ServerIdentifier::new("alice", "db1")
    }

    fn auth_payload(method: u32, salt: &[u8]) -> Vec<u8> {
        let mut payload = method.to_be_bytes().to_vec();
        payload.extend_from_slice(salt);
        payload
    }

    #[test]
    fn auth_ok_completes() {
        match answer_auth_request(&auth_payload(0, &[]), &ident(), "alice", "pw").unwrap() {
            AuthAnswer::Done => {}
            AuthAnswer::Send(_) => panic!("nothing should be sent"),
        }
    }

    #[test]
    fn cleartext_sends_the_password() {
        let answer =
            answer_auth_request(&auth_payload(3, &[]), &ident(), "alice", "sekret").unwrap();
        let AuthAnswer::Send(pkt) = answer else {
            panic!("expected a PasswordMessage");
        };
        assert_eq!(pkt[0], b'p');
        assert!(pkt.windows(7).any(|w| w == b"sekret\0"));
    }

    #[test]
    fn md5_answer_matches_the_two_pass_construction() {
        let salt = [1u8, 2, 3, 4];
        let answer =
            answer_auth_request(&auth_payload(5, &salt), &ident(), "alice", "sekret").unwrap();
        let AuthAnswer::Send(pkt) = answer else {
            panic!("expected a PasswordMessage");
        };

        let mut md5 = Md5::new();
        md5.update(b"sekret");
        md5.update(b"alice");
        let inner = format!("{:x}", md5.finalize());
        let expected = md5_hash_second_pass(&inner, &salt);

        assert!(expected.starts_with("md5"));
        assert_eq!(expected.len(), 35);
        let body = &pkt[5..5 + expected.len()];
        assert_eq!(body, expected.as_bytes());
    }

    #[test]
    fn stored_md5_digest_skips_the_first_pass() {
        let salt = [9u8, 9, 9, 9];
        let digest = format!("md5{}", "ab".repeat(16));
        let answer =
            answer_auth_request(&auth_payload(5, &salt), &ident(), "alice", &digest).unwrap();
        let AuthAnswer::Send(pkt) = answer else {
            panic!("expected a PasswordMessage");
        };
        let expected = md5_hash_second_pass(&digest[3..], &salt);
        assert_eq!(&pkt[5..5 + expected.len()], expected.as_bytes());
    }

    #[test]
    fn client_md5_check_round_trips() {
        let salt = [7u8, 6, 5, 4];
        let given = md5_hash_password("alice", "sekret", &salt);
        assert!(check_md5_client(&given, "sekret", "alice", &salt));
        assert!(!check_md5_client(&given, "other", "alice", &salt));

        // Stored digests verify the same response.
        let mut md5 = Md5::new();
        md5.update(b"sekret");
        md5.update(b"alice");
        let stored = format!("md5{:x}", md5.finalize());
        assert!(check_md5_client(&given, &stored, "alice", &salt));
    }

    #[test]
    fn unsupported_methods_are_refused() {
        for method in [2u32, 4, 6, 42] {
            assert!(
                answer_auth_request(&auth_payload(method, &[0; 4]), &ident(), "alice", "pw")
                    .is_err()
            );
        }
    }

    #[test]
    fn truncated_requests_are_refused() {
        assert!(answer_auth_request(&[0, 0], &ident(), "alice", "pw").is_err());
        // md5 without its salt
        assert!(answer_auth_request(&5u32.to_be_bytes(), &ident(), "alice", "pw").is_err());
    }
}
