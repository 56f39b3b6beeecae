//! Workspace membership ledger plus the on-disk file area.
//!
//! The ledger is one `workspace:owner:member,member,...` line per
//! workspace, MAC-protected like the user ledger. Files live under
//! `files/<workspace>/`, wrapped key records under `keys/`.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::error::StoreError;
use super::integrity;
use crate::definitions::{signature_name, valid_target_name};

struct WorkspaceRecord {
    owner: String,
    members: BTreeSet<String>,
}

pub struct WorkspaceStore {
    ledger: PathBuf,
    files_root: PathBuf,
    keys_root: PathBuf,
    mac_key: Vec<u8>,
    workspaces: Mutex<HashMap<String, WorkspaceRecord>>,
}

impl WorkspaceStore {
    pub fn open(
        ledger: PathBuf,
        files_root: PathBuf,
        keys_root: PathBuf,
        mac_key: Vec<u8>,
    ) -> Result<WorkspaceStore, StoreError> {
        let mut workspaces = HashMap::new();

        let contents = match std::fs::read_to_string(&ledger) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        for (index, line) in contents.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let malformed = || StoreError::Malformed {
                file: ledger.display().to_string(),
                line: index + 1,
            };

            let mut parts = line.splitn(3, ':');
            let (Some(name), Some(owner), Some(members)) =
                (parts.next(), parts.next(), parts.next())
            else {
                return Err(malformed());
            };
            let members: BTreeSet<String> = members
                .split(',')
                .filter(|m| !m.is_empty())
                .map(String::from)
                .collect();
            if name.is_empty() || owner.is_empty() || !members.contains(owner) {
                return Err(malformed());
            }

            workspaces.insert(
                name.to_string(),
                WorkspaceRecord {
                    owner: owner.to_string(),
                    members,
                },
            );
        }

        Ok(WorkspaceStore {
            ledger,
            files_root,
            keys_root,
            mac_key,
            workspaces: Mutex::new(workspaces),
        })
    }

    /// Create a workspace; the owner is always its first member.
    pub fn create(&self, workspace: &str, owner: &str) -> Result<(), StoreError> {
        if !valid_target_name(workspace) || workspace.contains([':', ',', '.']) {
            return Err(StoreError::InvalidName(workspace.to_string()));
        }

        let mut workspaces = self.workspaces.lock().expect("workspace store poisoned");
        if workspaces.contains_key(workspace) {
            return Err(StoreError::WorkspaceExists(workspace.to_string()));
        }

        std::fs::create_dir_all(self.files_root.join(workspace))?;
        workspaces.insert(
            workspace.to_string(),
            WorkspaceRecord {
                owner: owner.to_string(),
                members: BTreeSet::from([owner.to_string()]),
            },
        );
        self.persist(&workspaces)
    }

    pub fn exists(&self, workspace: &str) -> bool {
        self.workspaces
            .lock()
            .expect("workspace store poisoned")
            .contains_key(workspace)
    }

    pub fn is_member(&self, workspace: &str, identity: &str) -> bool {
        let workspaces = self.workspaces.lock().expect("workspace store poisoned");
        workspaces
            .get(workspace)
            .is_some_and(|record| record.members.contains(identity))
    }

    pub fn is_owner(&self, workspace: &str, identity: &str) -> bool {
        let workspaces = self.workspaces.lock().expect("workspace store poisoned");
        workspaces
            .get(workspace)
            .is_some_and(|record| record.owner == identity)
    }

    pub fn add_member(&self, workspace: &str, member: &str) -> Result<(), StoreError> {
        let mut workspaces = self.workspaces.lock().expect("workspace store poisoned");
        let record = workspaces
            .get_mut(workspace)
            .ok_or_else(|| StoreError::NoWorkspace(workspace.to_string()))?;

        record.members.insert(member.to_string());
        self.persist(&workspaces)
    }

    pub fn list_for(&self, identity: &str) -> Vec<String> {
        let workspaces = self.workspaces.lock().expect("workspace store poisoned");
        let mut names: Vec<String> = workspaces
            .iter()
            .filter(|(_, record)| record.members.contains(identity))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Resolve a file inside a workspace; rejects names that would
    /// escape the workspace directory.
    pub fn file_path(&self, workspace: &str, name: &str) -> Option<PathBuf> {
        (valid_target_name(name) && self.exists(workspace))
            .then(|| self.files_root.join(workspace).join(name))
    }

    pub fn list_files(&self, workspace: &str) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.files_root.join(workspace))? {
            if let Some(name) = entry?.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();

        Ok(names)
    }

    pub fn remove_file(&self, workspace: &str, name: &str) -> Result<(), StoreError> {
        let path = self
            .file_path(workspace, name)
            .ok_or_else(|| StoreError::InvalidName(name.to_string()))?;
        std::fs::remove_file(path)?;

        Ok(())
    }

    /// Find the stored detached signature for a file, if any.
    pub fn find_signature(&self, workspace: &str, file: &str) -> Option<String> {
        let prefix = signature_name(file, "");
        self.list_files(workspace)
            .ok()?
            .into_iter()
            .find(|name| name.starts_with(&prefix) && name.len() > prefix.len())
    }

    pub fn keys_root(&self) -> &Path {
        &self.keys_root
    }

    /// Resolve a wrapped key record by its conventional name.
    pub fn key_path(&self, record_name: &str) -> Option<PathBuf> {
        valid_target_name(record_name).then(|| self.keys_root.join(record_name))
    }

    fn persist(&self, workspaces: &HashMap<String, WorkspaceRecord>) -> Result<(), StoreError> {
        let mut out = String::new();
        for (name, record) in workspaces {
            out.push_str(name);
            out.push(':');
            out.push_str(&record.owner);
            out.push(':');
            let members: Vec<&str> = record.members.iter().map(String::as_str).collect();
            out.push_str(&members.join(","));
            out.push('\n');
        }
        std::fs::write(&self.ledger, out)?;
        integrity::stamp(&self.ledger, &self.mac_key)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> WorkspaceStore {
        let keys = dir.path().join("keys");
        std::fs::create_dir_all(&keys).unwrap();
        WorkspaceStore::open(
            dir.path().join("workspaces.txt"),
            dir.path().join("files"),
            keys,
            vec![9u8; 32],
        )
        .unwrap()
    }

    #[test]
    fn owner_is_always_a_member() {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = store(&dir);

        workspaces.create("ws1", "alice").unwrap();
        assert!(workspaces.is_owner("ws1", "alice"));
        assert!(workspaces.is_member("ws1", "alice"));
        assert!(!workspaces.is_member("ws1", "bob"));

        workspaces.add_member("ws1", "bob").unwrap();
        assert!(workspaces.is_member("ws1", "bob"));
        assert!(!workspaces.is_owner("ws1", "bob"));
    }

    #[test]
    fn duplicate_workspace_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = store(&dir);

        workspaces.create("ws1", "alice").unwrap();
        assert!(matches!(
            workspaces.create("ws1", "bob"),
            Err(StoreError::WorkspaceExists(_))
        ));
    }

    #[test]
    fn membership_survives_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let workspaces = store(&dir);
            workspaces.create("ws1", "alice").unwrap();
            workspaces.add_member("ws1", "bob").unwrap();
            workspaces.create("ws2", "bob").unwrap();
        }

        let workspaces = store(&dir);
        assert_eq!(workspaces.list_for("bob"), vec!["ws1", "ws2"]);
        assert_eq!(workspaces.list_for("alice"), vec!["ws1"]);
        assert_eq!(workspaces.list_for("eve"), Vec::<String>::new());
    }

    #[test]
    fn file_paths_cannot_escape_the_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = store(&dir);
        workspaces.create("ws1", "alice").unwrap();

        assert!(workspaces.file_path("ws1", "report.txt").is_some());
        assert!(workspaces.file_path("ws1", "../secrets").is_none());
        assert!(workspaces.file_path("ws1", "a/b").is_none());
        assert!(workspaces.file_path("nope", "report.txt").is_none());
    }

    #[test]
    fn signature_lookup_matches_by_convention() {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = store(&dir);
        workspaces.create("ws1", "alice").unwrap();

        let ws_dir = dir.path().join("files").join("ws1");
        std::fs::write(ws_dir.join("report.txt"), b"data").unwrap();
        std::fs::write(ws_dir.join("report.txt.signed.alice"), b"sig").unwrap();

        assert_eq!(
            workspaces.find_signature("ws1", "report.txt"),
            Some("report.txt.signed.alice".to_string())
        );
        assert_eq!(workspaces.find_signature("ws1", "other.txt"), None);
    }
}
