// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Multi-operation file transaction with two-phase commit and best-effort
//! rollback. Used by the undo manager (for atomic single-file reverts) and
//! directly by tools that need to stage several file operations as one unit.
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::warn;
use uuid::Uuid;

/// A single staged file operation.
#[derive(Debug, Clone)]
pub enum OpKind {
    /// Write `temp_file`'s contents to `path`, then chmod to `mode`.
    Write { temp_file: PathBuf, mode: u32 },
    /// Remove `path` (no-op if already absent).
    Delete,
    /// Rename `path` to `to`.
    Rename { to: PathBuf },
    /// chmod `path` to `mode`.
    Chmod { mode: u32 },
}

#[derive(Debug, Clone)]
struct Op {
    path: PathBuf,
    kind: OpKind,
    backup_file: Option<PathBuf>,
    applied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Committed,
    RolledBack,
}

/// Stages write/delete/rename/chmod operations and applies them as a unit.
///
/// On any failure during the apply phase, already-applied operations are
/// reverse-iterated and restored from backup on a best-effort basis. The
/// staging directory is removed on both commit and rollback.
pub struct FileTransaction {
    id: String,
    staging_dir: PathBuf,
    ops: Vec<Op>,
    state: State,
}

impl FileTransaction {
    /// Create a transaction staging its temp files under `staging_root`
    /// (typically `std::env::temp_dir()`).
    pub fn new(staging_root: &Path) -> Result<Self> {
        let id = Uuid::new_v4().to_string();
        let staging_dir = staging_root.join(format!("sven-txn-{id}"));
        std::fs::create_dir_all(&staging_dir)
            .with_context(|| format!("creating staging dir {}", staging_dir.display()))?;
        Ok(Self {
            id,
            staging_dir,
            ops: Vec::new(),
            state: State::Open,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            State::Open => Ok(()),
            State::Committed => bail!("transaction {} already committed", self.id),
            State::RolledBack => bail!("transaction {} already rolled back", self.id),
        }
    }

    /// Stage a write of `content` to `path` with file mode `mode` (e.g. 0o644).
    pub fn write(&mut self, path: impl Into<PathBuf>, content: &[u8], mode: u32) -> Result<()> {
        self.ensure_open()?;
        let path = path.into();
        let temp_file = self.staging_dir.join(format!("stage-{}", self.ops.len()));
        std::fs::write(&temp_file, content)
            .with_context(|| format!("staging write for {}", path.display()))?;
        self.ops.push(Op {
            path,
            kind: OpKind::Write { temp_file, mode },
            backup_file: None,
            applied: false,
        });
        Ok(())
    }

    pub fn delete(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.ensure_open()?;
        self.ops.push(Op {
            path: path.into(),
            kind: OpKind::Delete,
            backup_file: None,
            applied: false,
        });
        Ok(())
    }

    pub fn rename(&mut self, path: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Result<()> {
        self.ensure_open()?;
        self.ops.push(Op {
            path: path.into(),
            kind: OpKind::Rename { to: to.into() },
            backup_file: None,
            applied: false,
        });
        Ok(())
    }

    pub fn chmod(&mut self, path: impl Into<PathBuf>, mode: u32) -> Result<()> {
        self.ensure_open()?;
        self.ops.push(Op {
            path: path.into(),
            kind: OpKind::Chmod { mode },
            backup_file: None,
            applied: false,
        });
        Ok(())
    }

    /// Execute the staged operations. Empty transaction commit is a no-op
    /// success. On any apply failure, previously-applied ops are reversed
    /// best-effort and the transaction is marked rolled back.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.ops.is_empty() {
            self.state = State::Committed;
            let _ = std::fs::remove_dir_all(&self.staging_dir);
            return Ok(());
        }

        // Backup phase: copy any existing target into the staging dir.
        for (idx, op) in self.ops.iter_mut().enumerate() {
            if op.path.exists() {
                let backup = self.staging_dir.join(format!("backup-{idx}"));
                if let Err(e) = std::fs::copy(&op.path, &backup) {
                    warn!(path = %op.path.display(), error = %e, "backup copy failed");
                } else {
                    op.backup_file = Some(backup);
                }
            }
        }

        // Apply phase.
        let apply_result = self.apply_all();
        if let Err(e) = apply_result {
            self.rollback_applied();
            self.state = State::RolledBack;
            let _ = std::fs::remove_dir_all(&self.staging_dir);
            return Err(e);
        }

        self.state = State::Committed;
        let _ = std::fs::remove_dir_all(&self.staging_dir);
        Ok(())
    }

    fn apply_all(&mut self) -> Result<()> {
        for op in &mut self.ops {
            if let Some(parent) = op.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating parent dir for {}", op.path.display()))?;
                }
            }
            match &op.kind {
                OpKind::Write { temp_file, mode } => {
                    atomic_place(temp_file, &op.path)
                        .with_context(|| format!("placing {}", op.path.display()))?;
                    std::fs::set_permissions(&op.path, std::fs::Permissions::from_mode(*mode))
                        .with_context(|| format!("chmod {}", op.path.display()))?;
                }
                OpKind::Delete => {
                    if op.path.exists() {
                        std::fs::remove_file(&op.path)
                            .with_context(|| format!("deleting {}", op.path.display()))?;
                    }
                }
                OpKind::Rename { to } => {
                    std::fs::rename(&op.path, to)
                        .with_context(|| format!("renaming {}", op.path.display()))?;
                }
                OpKind::Chmod { mode } => {
                    std::fs::set_permissions(&op.path, std::fs::Permissions::from_mode(*mode))
                        .with_context(|| format!("chmod {}", op.path.display()))?;
                }
            }
            op.applied = true;
        }
        Ok(())
    }

    /// Best-effort reverse of every applied op, most-recent first.
    fn rollback_applied(&mut self) {
        for op in self.ops.iter_mut().rev().filter(|o| o.applied) {
            let result: std::io::Result<()> = match &op.kind {
                OpKind::Write { .. } => {
                    if let Some(backup) = &op.backup_file {
                        std::fs::copy(backup, &op.path).map(|_| ())
                    } else {
                        std::fs::remove_file(&op.path)
                    }
                }
                OpKind::Delete => {
                    if let Some(backup) = &op.backup_file {
                        std::fs::copy(backup, &op.path).map(|_| ())
                    } else {
                        Ok(())
                    }
                }
                OpKind::Rename { to } => std::fs::rename(to, &op.path),
                OpKind::Chmod { .. } => {
                    if let Some(backup) = &op.backup_file {
                        std::fs::metadata(backup).and_then(|m| {
                            std::fs::set_permissions(&op.path, m.permissions())
                        })
                    } else {
                        Ok(())
                    }
                }
            };
            if let Err(e) = result {
                warn!(path = %op.path.display(), error = %e, "rollback step failed, continuing best-effort");
            }
        }
    }

    /// Explicitly abandon the transaction without applying any op.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.state = State::RolledBack;
        let _ = std::fs::remove_dir_all(&self.staging_dir);
        Ok(())
    }
}

/// Atomically place `temp_file`'s content at `dest`. Tries a plain rename
/// first (works when both paths share a filesystem); falls back to
/// copy-then-remove when the rename fails due to crossing a device boundary
/// (`EXDEV`).
fn atomic_place(temp_file: &Path, dest: &Path) -> Result<()> {
    match std::fs::rename(temp_file, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            std::fs::copy(temp_file, dest)?;
            let _ = std::fs::remove_file(temp_file);
            Ok(())
        }
        Err(e) => Err(e).context("renaming staged file into place"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_commit_is_noop_success() {
        let mut txn = FileTransaction::new(&std::env::temp_dir()).unwrap();
        assert!(txn.commit().is_ok());
    }

    #[test]
    fn write_then_commit_creates_file_with_mode() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out.txt");
        let mut txn = FileTransaction::new(dir.path()).unwrap();
        txn.write(&target, b"hello", 0o644).unwrap();
        txn.commit().unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello");
    }

    #[test]
    fn delete_removes_existing_file() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("doomed.txt");
        std::fs::write(&target, "bye").unwrap();
        let mut txn = FileTransaction::new(dir.path()).unwrap();
        txn.delete(&target).unwrap();
        txn.commit().unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn delete_of_absent_file_is_noop() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("never-existed.txt");
        let mut txn = FileTransaction::new(dir.path()).unwrap();
        txn.delete(&target).unwrap();
        assert!(txn.commit().is_ok());
    }

    #[test]
    fn double_commit_fails() {
        let mut txn = FileTransaction::new(&std::env::temp_dir()).unwrap();
        txn.commit().unwrap();
        assert!(txn.commit().is_err());
    }

    #[test]
    fn commit_after_rollback_fails() {
        let mut txn = FileTransaction::new(&std::env::temp_dir()).unwrap();
        txn.rollback().unwrap();
        assert!(txn.commit().is_err());
    }

    #[test]
    fn ops_after_commit_fail() {
        let dir = tempdir().unwrap();
        let mut txn = FileTransaction::new(dir.path()).unwrap();
        txn.commit().unwrap();
        assert!(txn.write(dir.path().join("x"), b"x", 0o644).is_err());
    }

    #[test]
    fn write_failure_on_one_op_rolls_back_earlier_writes() {
        let dir = tempdir().unwrap();
        let ok_target = dir.path().join("ok.txt");
        std::fs::write(&ok_target, "original").unwrap();
        // Target a path whose parent cannot be created (a file, not a dir) to
        // force the second op to fail during apply.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "im a file").unwrap();
        let bad_target = blocker.join("cant-create-under-a-file.txt");

        let mut txn = FileTransaction::new(dir.path()).unwrap();
        txn.write(&ok_target, b"changed", 0o644).unwrap();
        txn.write(&bad_target, b"nope", 0o644).unwrap();
        assert!(txn.commit().is_err());
        assert_eq!(std::fs::read_to_string(&ok_target).unwrap(), "original");
    }
}
