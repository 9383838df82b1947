//! Auth file parsing.
//!
//! One record per line: `"username" "password"`. Backslash escapes any
//! character inside the quotes. A cached `stat` of the file decides whether
//! a reload is needed at all.

use std::fs;
use std::os::unix::fs::MetadataExt;

use log::error;

pub const MAX_USERNAME: usize = 128;
pub const MAX_PASSWORD: usize = 128;

/// The stat fields that participate in change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileInfo {
    dev: u64,
    ino: u64,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: i64,
    size: u64,
}

pub fn stat_file(path: &str) -> Option<FileInfo> {
    let meta = fs::metadata(path).ok()?;
    Some(FileInfo {
        dev: meta.dev(),
        ino: meta.ino(),
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        mtime: meta.mtime(),
        size: meta.size(),
    })
}

/// Parse the auth file text. Parsing stops at the first broken record, which
/// is logged; everything before it is returned.
pub fn parse_auth_file(text: &str) -> Vec<(String, String)> {
    let mut users = Vec::new();
    let bytes = text.as_bytes();
    let mut pos = 0;

    loop {
        // Skip whitespace and empty lines.
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }

        let Some((user, next)) = take_quoted(bytes, pos, MAX_USERNAME, "username") else {
            break;
        };
        pos = next;

        // Skip to the password field.
        while pos < bytes.len() && bytes[pos] != b'"' && bytes[pos] != b'\n' {
            pos += 1;
        }
        let Some((password, next)) = take_quoted(bytes, pos, MAX_PASSWORD, "password") else {
            break;
        };
        pos = next;

        users.push((user, password));

        // Skip rest of the line.
        while pos < bytes.len() && bytes[pos] != b'\n' {
            pos += 1;
        }
    }

    users
}

/// Read one quoted field starting at `pos`, unquoting backslash escapes.
/// Returns the field and the position after the closing quote.
fn take_quoted(
    bytes: &[u8],
    pos: usize,
    max: usize,
    what: &str,
) -> Option<(String, usize)> {
    if bytes.get(pos) != Some(&b'"') {
        error!("broken auth file: expected quoted {what}");
        return None;
    }
    let mut out = Vec::new();
    let mut i = pos + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                if out.len() >= max {
                    error!("{what} too long in auth file");
                    return None;
                }
                let s = String::from_utf8(out).ok()?;
                return Some((s, i + 1));
            }
            b'\\' if i + 1 < bytes.len() => {
                out.push(bytes[i + 1]);
                i += 2;
            }
            b'\n' => break,
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    error!("broken auth file: unterminated {what}");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_user_password_records() {
        let users = parse_auth_file("\"alice\" \"secret\"\n\"bob\" \"hunter2\"\n");
        assert_eq!(
            users,
            vec![
                ("alice".to_string(), "secret".to_string()),
                ("bob".to_string(), "hunter2".to_string()),
            ]
        );
    }

    #[test]
    fn backslash_escapes_any_character() {
        let users = parse_auth_file(r#""al\"ice" "pa\\ss""#);
        assert_eq!(
            users,
            vec![("al\"ice".to_string(), "pa\\ss".to_string())]
        );
    }

    #[test]
    fn empty_password_is_allowed() {
        let users = parse_auth_file("\"ghost\" \"\"\n");
        assert_eq!(users, vec![("ghost".to_string(), String::new())]);
    }

    #[test]
    fn broken_records_stop_parsing() {
        let users = parse_auth_file("\"ok\" \"pw\"\nunquoted junk\n\"never\" \"seen\"\n");
        assert_eq!(users.len(), 1);
        let users = parse_auth_file("\"dangling\n");
        assert!(users.is_empty());
    }

    #[test]
    fn oversized_fields_are_rejected() {
        let long = "x".repeat(MAX_USERNAME + 1);
        let users = parse_auth_file(&format!("\"{long}\" \"pw\"\n"));
        assert!(users.is_empty());
    }

    #[test]
    fn stat_cache_detects_changes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "\"u\" \"p\"").unwrap();
        file.flush().unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let first = stat_file(&path).unwrap();
        assert_eq!(stat_file(&path).unwrap(), first);

        // Growing the file changes at least st_size.
        writeln!(file, "\"v\" \"q\"").unwrap();
        file.flush().unwrap();
        assert_ne!(stat_file(&path).unwrap(), first);

        assert!(stat_file("/does/not/exist").is_none());
    }
}
