//! 授权目录树后端
//!
//! 备份目录为授权树根下的 `Backup` 子目录。每次操作前都会重新检查授权，
//! 授权失效统一报告为 `StorageUnavailable`。

use chrono::{DateTime, Utc};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::document_tree::{DocumentMeta, DocumentRef, DocumentTreeProvider, TreeUri};
use super::{
    validate_child_name, BackendKind, NodeHandle, StorageBackend, StorageEntry, StorageRoot,
};
use crate::backup_common::PREVIOUS_POSTFIX;
use crate::error::{BackupError, Result};

pub struct ScopedTreeBackend {
    provider: Arc<dyn DocumentTreeProvider>,
    tree: TreeUri,
    backup_dir_name: String,
    marker_file_name: String,
}

impl ScopedTreeBackend {
    pub fn new(
        provider: Arc<dyn DocumentTreeProvider>,
        tree: TreeUri,
        backup_dir_name: impl Into<String>,
        marker_file_name: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            tree,
            backup_dir_name: backup_dir_name.into(),
            marker_file_name: marker_file_name.into(),
        }
    }

    pub fn tree(&self) -> &TreeUri {
        &self.tree
    }

    fn ensure_access(&self) -> Result<()> {
        let status = self.provider.check_grant(&self.tree);
        if !status.is_usable() {
            return Err(BackupError::StorageUnavailable(format!(
                "目录树授权已失效: {} (readable={}, writable={})",
                self.tree, status.readable, status.writable
            )));
        }
        Ok(())
    }

    fn tree_root(&self) -> DocumentRef {
        DocumentRef::root(self.tree.clone())
    }

    fn ensure_marker(&self, backup_dir: &DocumentRef) -> Result<()> {
        let marker = backup_dir.child(&self.marker_file_name);
        if self.provider.stat(&marker)?.is_none() {
            self.provider
                .create_document(backup_dir, &self.marker_file_name)?;
            debug!("[ScopedTree] 已创建标记文件 {}", marker.document_id);
        }
        Ok(())
    }

    /// 处理上次提升中断留下的 `<name>.previous`
    ///
    /// 最终文件缺失时暂存件是唯一的完整备份，改回原名；还原失败则原样保留并返回错误。
    /// 最终文件存在时暂存件已过期，直接删除。
    fn recover_aside(&self, parent: &DocumentRef, final_name: &str) -> Result<()> {
        let aside = parent.child(&format!("{}{}", final_name, PREVIOUS_POSTFIX));
        if self.provider.stat(&aside)?.is_none() {
            return Ok(());
        }
        if self.provider.stat(&parent.child(final_name))?.is_some() {
            if self.provider.delete(&aside)? {
                debug!("[ScopedTree] 已删除过期的暂存备份 {}", aside.document_id);
            }
            return Ok(());
        }
        warn!(
            "[ScopedTree] 发现中断提升留下的 {}，还原为 {}",
            aside.document_id, final_name
        );
        self.provider.rename(&aside, final_name)?;
        Ok(())
    }
}

fn document_of(handle: &NodeHandle) -> Result<&DocumentRef> {
    match handle {
        NodeHandle::Document(doc) => Ok(doc),
        NodeHandle::Path(path) => Err(BackupError::Configuration(format!(
            "目录树后端收到本地路径句柄: {:?}",
            path
        ))),
    }
}

fn entry_from_meta(meta: DocumentMeta) -> StorageEntry {
    StorageEntry::new(
        meta.name,
        meta.is_directory,
        meta.size,
        meta.last_modified,
        NodeHandle::Document(meta.document),
    )
}

impl StorageBackend for ScopedTreeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ScopedTree
    }

    fn check_access(&self) -> bool {
        self.provider.check_grant(&self.tree).is_usable()
    }

    fn resolve_root(&self, create_if_missing: bool) -> Result<Option<StorageRoot>> {
        self.ensure_access()?;
        let tree_root = self.tree_root();
        let backup_dir = tree_root.child(&self.backup_dir_name);

        match self.provider.stat(&backup_dir)? {
            Some(meta) if meta.is_directory => {}
            Some(_) if create_if_missing => {
                warn!("[ScopedTree] {} 被普通文件占用，替换为目录", backup_dir.document_id);
                self.provider.delete(&backup_dir)?;
                self.provider
                    .create_directory(&tree_root, &self.backup_dir_name)?;
            }
            None if create_if_missing => {
                self.provider
                    .create_directory(&tree_root, &self.backup_dir_name)?;
                info!("[ScopedTree] 已创建备份目录 {}", backup_dir.document_id);
            }
            _ => return Ok(None),
        }

        if create_if_missing {
            self.ensure_marker(&backup_dir)?;
        }
        Ok(Some(StorageRoot::new(NodeHandle::Document(backup_dir))))
    }

    fn list_children(&self, dir: &StorageRoot) -> Result<Vec<StorageEntry>> {
        self.ensure_access()?;
        let doc = document_of(dir.handle())?;
        Ok(self
            .provider
            .list_children(doc)?
            .into_iter()
            .map(entry_from_meta)
            .collect())
    }

    fn find_child(&self, dir: &StorageRoot, name: &str) -> Result<Option<StorageEntry>> {
        validate_child_name(name)?;
        self.ensure_access()?;
        let doc = document_of(dir.handle())?;
        Ok(self.provider.stat(&doc.child(name))?.map(entry_from_meta))
    }

    fn create_file(
        &self,
        dir: &StorageRoot,
        name: &str,
    ) -> Result<(StorageEntry, Box<dyn Write + Send>)> {
        validate_child_name(name)?;
        self.ensure_access()?;
        let parent = document_of(dir.handle())?;
        // 目录树不支持覆盖创建，先删除同名文档
        if self.provider.delete(&parent.child(name))? {
            debug!("[ScopedTree] 已删除同名旧文档 {}", name);
        }
        let doc = self.provider.create_document(parent, name)?;
        let writer = self.provider.open_write(&doc)?;
        let meta = self.provider.stat(&doc)?.ok_or_else(|| {
            BackupError::NotFound(format!("新建文档不可见: {}", doc.document_id))
        })?;
        Ok((entry_from_meta(meta), writer))
    }

    fn create_directory(&self, dir: &StorageRoot, name: &str) -> Result<StorageRoot> {
        validate_child_name(name)?;
        self.ensure_access()?;
        let parent = document_of(dir.handle())?;
        let doc = self.provider.create_directory(parent, name)?;
        Ok(StorageRoot::new(NodeHandle::Document(doc)))
    }

    fn open_for_read(&self, entry: &StorageEntry) -> Result<Box<dyn Read + Send>> {
        self.ensure_access()?;
        self.provider.open_read(document_of(entry.handle())?)
    }

    fn delete(&self, entry: &StorageEntry) -> bool {
        let result = self
            .ensure_access()
            .and_then(|_| document_of(entry.handle()))
            .and_then(|doc| self.provider.delete(doc));
        match result {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!("[ScopedTree] 删除 {} 失败: {}", entry.name, e);
                false
            }
        }
    }

    fn promote(&self, entry: &StorageEntry, final_name: &str) -> Result<StorageEntry> {
        validate_child_name(final_name)?;
        self.ensure_access()?;
        let doc = document_of(entry.handle())?;
        let parent = doc
            .parent()
            .ok_or_else(|| BackupError::InvalidName("无法提升目录树根".to_string()))?;

        // 目录树重命名不保证替换：旧备份先移到一旁，新文件就位后再删除
        let target = parent.child(final_name);
        let aside_name = format!("{}{}", final_name, PREVIOUS_POSTFIX);
        self.recover_aside(&parent, final_name)?;
        let aside = match self.provider.stat(&target)? {
            Some(_) => Some(self.provider.rename(&target, &aside_name)?),
            None => None,
        };

        let renamed = match self.provider.rename(doc, final_name) {
            Ok(renamed) => renamed,
            Err(e) => {
                if let Some(aside) = &aside {
                    if let Err(restore_err) = self.provider.rename(aside, final_name) {
                        warn!(
                            "[ScopedTree] 还原旧备份 {} 失败: {}",
                            aside.document_id, restore_err
                        );
                    }
                }
                return Err(e);
            }
        };
        if let Some(aside) = &aside {
            match self.provider.delete(aside) {
                Ok(_) => debug!("[ScopedTree] 已删除旧备份 {}", aside.document_id),
                Err(e) => warn!("[ScopedTree] 删除旧备份 {} 失败: {}", aside.document_id, e),
            }
        }
        let meta = self.provider.stat(&renamed)?.ok_or_else(|| {
            BackupError::NotFound(format!("提升后的文档不可见: {}", renamed.document_id))
        })?;
        Ok(entry_from_meta(meta))
    }

    fn available_bytes(&self) -> Result<u64> {
        self.ensure_access()?;
        self.provider.available_bytes(&self.tree)
    }

    fn display_path(&self, handle: &NodeHandle) -> String {
        match handle {
            NodeHandle::Document(doc) => self.provider.display_path(doc),
            NodeHandle::Path(path) => path.display().to_string(),
        }
    }

    fn base_display_path(&self) -> String {
        self.provider.display_path(&self.tree_root())
    }

    fn last_modified(&self, dir: &StorageRoot) -> Option<DateTime<Utc>> {
        let doc = document_of(dir.handle()).ok()?;
        self.provider
            .stat(doc)
            .ok()
            .flatten()
            .map(|meta| meta.last_modified)
    }

    fn delete_root(&self) -> Result<bool> {
        self.ensure_access()?;
        let deleted = self
            .provider
            .delete(&self.tree_root().child(&self.backup_dir_name))?;
        if deleted {
            info!("[ScopedTree] 已删除备份目录 {}", self.backup_dir_name);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalTreeProvider;
    use assert_matches::assert_matches;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<LocalTreeProvider>, ScopedTreeBackend) {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(LocalTreeProvider::new());
        let tree = provider.grant(dir.path(), true, true).unwrap();
        let backend = ScopedTreeBackend::new(provider.clone(), tree, "Backup", ".nomedia");
        (dir, provider, backend)
    }

    #[test]
    fn test_resolve_root_creates_backup_dir_and_marker() {
        let (dir, _provider, backend) = setup();
        assert!(backend.resolve_root(false).unwrap().is_none());

        let root = backend.resolve_root(true).unwrap().unwrap();
        assert!(dir.path().join("Backup").join(".nomedia").exists());
        assert_eq!(backend.list_children(&root).unwrap().len(), 1);
    }

    #[test]
    fn test_create_and_promote() {
        let (dir, _provider, backend) = setup();
        let root = backend.resolve_root(true).unwrap().unwrap();

        let (old, mut w) = backend.create_file(&root, "chat.db").unwrap();
        w.write_all(b"previous").unwrap();
        drop(w);
        assert_eq!(old.name, "chat.db");

        let (tmp, mut w) = backend.create_file(&root, "chat.db.backup").unwrap();
        w.write_all(b"fresh").unwrap();
        drop(w);

        let promoted = backend.promote(&tmp, "chat.db").unwrap();
        assert_eq!(promoted.size, 5);
        assert_eq!(fs::read(dir.path().join("Backup").join("chat.db")).unwrap(), b"fresh");
        assert!(backend.find_child(&root, "chat.db.backup").unwrap().is_none());
    }

    #[test]
    fn test_promote_recovers_aside_left_by_interrupted_promotion() {
        let (dir, _provider, backend) = setup();
        let root = backend.resolve_root(true).unwrap().unwrap();
        let backup_dir = dir.path().join("Backup");
        fs::write(backup_dir.join("chat.db.previous"), b"previous").unwrap();

        let (tmp, mut w) = backend.create_file(&root, "chat.db.backup").unwrap();
        w.write_all(b"fresh").unwrap();
        drop(w);
        backend.promote(&tmp, "chat.db").unwrap();

        assert_eq!(fs::read(backup_dir.join("chat.db")).unwrap(), b"fresh");
        assert!(!backup_dir.join("chat.db.previous").exists());
    }

    #[test]
    fn test_promote_drops_stale_aside_when_final_exists() {
        let (dir, _provider, backend) = setup();
        let root = backend.resolve_root(true).unwrap().unwrap();
        let backup_dir = dir.path().join("Backup");
        fs::write(backup_dir.join("chat.db"), b"current").unwrap();
        fs::write(backup_dir.join("chat.db.previous"), b"stale").unwrap();

        let (tmp, mut w) = backend.create_file(&root, "chat.db.backup").unwrap();
        w.write_all(b"fresh").unwrap();
        drop(w);
        backend.promote(&tmp, "chat.db").unwrap();

        assert_eq!(fs::read(backup_dir.join("chat.db")).unwrap(), b"fresh");
        assert!(!backup_dir.join("chat.db.previous").exists());
    }

    #[test]
    fn test_create_file_replaces_existing_document() {
        let (_dir, _provider, backend) = setup();
        let root = backend.resolve_root(true).unwrap().unwrap();
        let (_, mut w) = backend.create_file(&root, "a.bin").unwrap();
        w.write_all(b"0123456789").unwrap();
        drop(w);

        let (_, mut w) = backend.create_file(&root, "a.bin").unwrap();
        w.write_all(b"ab").unwrap();
        drop(w);

        assert_eq!(backend.find_child(&root, "a.bin").unwrap().unwrap().size, 2);
    }

    #[test]
    fn test_revoked_grant_surfaces_as_unavailable() {
        let (_dir, provider, backend) = setup();
        let root = backend.resolve_root(true).unwrap().unwrap();
        provider.revoke(backend.tree()).unwrap();

        assert!(!backend.check_access());
        assert_matches!(backend.resolve_root(false), Err(BackupError::StorageUnavailable(_)));
        assert_matches!(backend.list_children(&root), Err(BackupError::StorageUnavailable(_)));
        assert_matches!(backend.available_bytes(), Err(BackupError::StorageUnavailable(_)));
    }

    #[test]
    fn test_write_revoked_read_only_grant() {
        let (_dir, provider, backend) = setup();
        provider.set_grant_flags(backend.tree(), true, false).unwrap();
        assert!(!backend.check_access(), "缺少写权限时不可用于备份");
        assert_matches!(backend.resolve_root(true), Err(BackupError::StorageUnavailable(_)));
    }
}
