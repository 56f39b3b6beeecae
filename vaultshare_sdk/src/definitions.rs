use base64ct::{Base64, Encoding};
use core::fmt;
use std::fmt::Debug;
use zeroize::Zeroize;

/// Fixed chunk size for all chunked transfers.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Length of a correlation / transfer identifier on the wire
/// (a hyphenated UUID).
pub const CORRELATION_ID_LEN: usize = 36;

pub const WORKSPACE_KEY_SIZE: usize = 32;

pub const KEY_SALT_SIZE: usize = 16;

/// The symmetric key shared by all members of a workspace.
///
/// Never crosses the wire in this form; it only travels RSA-wrapped
/// inside a [WrappedKeyRecord].
#[derive(Clone, Zeroize, PartialEq, Eq)]
pub struct WorkspaceKey([u8; WORKSPACE_KEY_SIZE]);

/// The salt stored alongside a workspace key. Identical across all
/// members' wrapped records for one workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySalt([u8; KEY_SALT_SIZE]);

impl Debug for WorkspaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkspaceKey([redacted])")
    }
}

impl AsRef<[u8]> for WorkspaceKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for KeySalt {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; WORKSPACE_KEY_SIZE]> for WorkspaceKey {
    fn from(data: [u8; WORKSPACE_KEY_SIZE]) -> WorkspaceKey {
        WorkspaceKey(data)
    }
}

impl From<[u8; KEY_SALT_SIZE]> for KeySalt {
    fn from(data: [u8; KEY_SALT_SIZE]) -> KeySalt {
        KeySalt(data)
    }
}

/// A per-member wrapped workspace key: the RSA-OAEP ciphertext of the
/// AES key plus the (plaintext) salt. Textual form is
/// `<base64 wrapped key>:<base64 salt>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKeyRecord {
    pub wrapped_key: Vec<u8>,
    pub salt: KeySalt,
}

impl WrappedKeyRecord {
    pub fn to_text(&self) -> String {
        format!(
            "{}:{}",
            Base64::encode_string(&self.wrapped_key),
            Base64::encode_string(self.salt.as_ref())
        )
    }

    pub fn from_text(text: &str) -> Option<WrappedKeyRecord> {
        let (wrapped, salt) = text.trim_end().split_once(':')?;
        let wrapped_key = Base64::decode_vec(wrapped).ok()?;
        let salt: [u8; KEY_SALT_SIZE] = Base64::decode_vec(salt).ok()?.try_into().ok()?;

        Some(WrappedKeyRecord {
            wrapped_key,
            salt: salt.into(),
        })
    }
}

/// Name under which a member's wrapped key record is stored.
pub fn key_record_name(workspace: &str, member: &str) -> String {
    format!("{workspace}.key.{member}")
}

/// Name under which the detached signature for `file` by `signer` is
/// stored, next to the file itself.
pub fn signature_name(file: &str, signer: &str) -> String {
    format!("{file}.signed.{signer}")
}

/// Extract the signer identity embedded in a signature file name.
pub fn signer_of(signature_name: &str) -> Option<&str> {
    let (_, signer) = signature_name.rsplit_once(".signed.")?;
    (!signer.is_empty()).then_some(signer)
}

/// True for names that are safe to use as a single path component.
pub fn valid_target_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_record_text_round_trip() {
        let record = WrappedKeyRecord {
            wrapped_key: vec![0x17; 256],
            salt: [0x42; KEY_SALT_SIZE].into(),
        };

        let text = record.to_text();
        assert_eq!(WrappedKeyRecord::from_text(&text), Some(record));
    }

    #[test]
    fn wrapped_record_rejects_garbage() {
        assert_eq!(WrappedKeyRecord::from_text("no separator"), None);
        assert_eq!(WrappedKeyRecord::from_text("a:b:c"), None);
        assert_eq!(WrappedKeyRecord::from_text("!!!:!!!"), None);
    }

    #[test]
    fn signer_extraction() {
        assert_eq!(signer_of("report.txt.signed.alice"), Some("alice"));
        assert_eq!(signer_of("report.txt"), None);
        assert_eq!(signer_of("report.txt.signed."), None);
    }

    #[test]
    fn target_name_validation() {
        assert!(valid_target_name("report.txt"));
        assert!(valid_target_name("ws1.key.bob"));
        assert!(!valid_target_name(""));
        assert!(!valid_target_name(".."));
        assert!(!valid_target_name("../etc/passwd"));
        assert!(!valid_target_name("a/b"));
    }
}
