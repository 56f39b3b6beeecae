//! Flat-file credential store: one `id:salt:hash` line per user,
//! PBKDF2-HMAC-SHA256 hashes, base64 fields. Authenticating with an
//! unknown id creates the user (first come, first served).

use base64ct::{Base64, Encoding};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use super::error::StoreError;
use super::integrity;
use crate::crypto;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted,
    NewUser,
    WrongPassword,
}

struct Credential {
    salt: Vec<u8>,
    hash: Vec<u8>,
}

pub struct UserStore {
    path: PathBuf,
    mac_key: Vec<u8>,
    users: Mutex<HashMap<String, Credential>>,
}

pub fn valid_identity(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

impl UserStore {
    /// Load the store; the ledger's MAC must have been verified
    /// before this is called.
    pub fn open(path: PathBuf, mac_key: Vec<u8>) -> Result<UserStore, StoreError> {
        let mut users = HashMap::new();

        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        for (index, line) in contents.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let malformed = || StoreError::Malformed {
                file: path.display().to_string(),
                line: index + 1,
            };

            let mut parts = line.splitn(3, ':');
            let (Some(id), Some(salt), Some(hash)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(malformed());
            };
            if !valid_identity(id) {
                return Err(malformed());
            }
            let salt = Base64::decode_vec(salt).map_err(|_| malformed())?;
            let hash = Base64::decode_vec(hash).map_err(|_| malformed())?;

            users.insert(id.to_string(), Credential { salt, hash });
        }

        Ok(UserStore {
            path,
            mac_key,
            users: Mutex::new(users),
        })
    }

    /// Check a credential pair, creating the user when the id is new.
    pub fn authenticate(&self, id: &str, secret: &str) -> Result<AuthOutcome, StoreError> {
        if !valid_identity(id) {
            return Err(StoreError::InvalidName(id.to_string()));
        }

        let mut users = self.users.lock().expect("user store poisoned");
        if let Some(credential) = users.get(id) {
            return Ok(
                if crypto::verify_credential(secret, &credential.salt, &credential.hash) {
                    AuthOutcome::Accepted
                } else {
                    AuthOutcome::WrongPassword
                },
            );
        }

        let (salt, hash) = crypto::new_credential(secret);
        users.insert(
            id.to_string(),
            Credential {
                salt: salt.to_vec(),
                hash: hash.to_vec(),
            },
        );
        self.persist(&users)?;

        Ok(AuthOutcome::NewUser)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.users
            .lock()
            .expect("user store poisoned")
            .contains_key(id)
    }

    fn persist(&self, users: &HashMap<String, Credential>) -> Result<(), StoreError> {
        let mut out = String::new();
        for (id, credential) in users {
            out.push_str(id);
            out.push(':');
            out.push_str(&Base64::encode_string(&credential.salt));
            out.push(':');
            out.push_str(&Base64::encode_string(&credential.hash));
            out.push('\n');
        }
        std::fs::write(&self.path, out)?;
        integrity::stamp(&self.path, &self.mac_key)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> UserStore {
        UserStore::open(dir.path().join("users.txt"), vec![9u8; 32]).unwrap()
    }

    #[test]
    fn first_authentication_creates_the_user() {
        let dir = tempfile::tempdir().unwrap();
        let users = store(&dir);

        assert_eq!(
            users.authenticate("alice", "hunter2").unwrap(),
            AuthOutcome::NewUser
        );
        assert_eq!(
            users.authenticate("alice", "hunter2").unwrap(),
            AuthOutcome::Accepted
        );
        assert_eq!(
            users.authenticate("alice", "wrong").unwrap(),
            AuthOutcome::WrongPassword
        );
    }

    #[test]
    fn users_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        store(&dir).authenticate("alice", "hunter2").unwrap();

        let reloaded = store(&dir);
        assert!(reloaded.exists("alice"));
        assert_eq!(
            reloaded.authenticate("alice", "hunter2").unwrap(),
            AuthOutcome::Accepted
        );
    }

    #[test]
    fn rejects_hostile_identities() {
        let dir = tempfile::tempdir().unwrap();
        let users = store(&dir);

        for id in ["", "a:b", "../alice", "alice bob"] {
            assert!(matches!(
                users.authenticate(id, "pw"),
                Err(StoreError::InvalidName(_))
            ));
        }
    }
}
