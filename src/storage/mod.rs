//! 备份存储层
//!
//! 提供统一的备份目录访问接口，两种实现：
//! - **DirectPath**: 直接读写本地文件系统路径
//! - **ScopedTree**: 通过宿主授权的目录树访问，每次操作都可能因授权失效而失败
//!
//! 使用哪种后端由用户偏好 `backup.directory_uri` 决定，每次操作重新选择。

mod direct_path;
mod document_tree;
mod local_tree;
mod scoped_tree;

pub use direct_path::DirectPathBackend;
pub use document_tree::{
    DocumentMeta, DocumentRef, DocumentTreeProvider, GrantStatus, TreeUri,
};
pub use local_tree::{LocalTreeProvider, LOCAL_TREE_AUTHORITY};
pub use scoped_tree::ScopedTreeBackend;

use chrono::{DateTime, Utc};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::backup_config::{backup_directory_uri, EngineConfig, PreferenceStore};
use crate::error::{BackupError, Result};

/// 后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    DirectPath,
    ScopedTree,
}

/// 后端内部的节点句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeHandle {
    Path(PathBuf),
    Document(DocumentRef),
}

/// 目录节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRoot {
    handle: NodeHandle,
}

impl StorageRoot {
    pub(crate) fn new(handle: NodeHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &NodeHandle {
        &self.handle
    }
}

/// 目录中的一个条目
#[derive(Debug, Clone)]
pub struct StorageEntry {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    handle: NodeHandle,
}

impl StorageEntry {
    pub(crate) fn new(
        name: String,
        is_directory: bool,
        size: u64,
        last_modified: DateTime<Utc>,
        handle: NodeHandle,
    ) -> Self {
        Self {
            name,
            is_directory,
            size,
            last_modified,
            handle,
        }
    }

    pub fn handle(&self) -> &NodeHandle {
        &self.handle
    }

    /// 目录条目可作为子树根继续遍历
    pub fn as_directory(&self) -> Option<StorageRoot> {
        self.is_directory.then(|| StorageRoot::new(self.handle.clone()))
    }
}

/// 备份存储后端
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// 当前是否可读写
    fn check_access(&self) -> bool;

    /// 定位备份目录
    ///
    /// `create_if_missing` 为真时按需创建目录和 `.nomedia` 标记；
    /// 为假时目录不存在返回 `Ok(None)`。
    fn resolve_root(&self, create_if_missing: bool) -> Result<Option<StorageRoot>>;

    fn list_children(&self, dir: &StorageRoot) -> Result<Vec<StorageEntry>>;

    fn find_child(&self, dir: &StorageRoot, name: &str) -> Result<Option<StorageEntry>> {
        Ok(self
            .list_children(dir)?
            .into_iter()
            .find(|entry| entry.name == name))
    }

    /// 创建（或截断重建）文件并返回写入流
    fn create_file(
        &self,
        dir: &StorageRoot,
        name: &str,
    ) -> Result<(StorageEntry, Box<dyn Write + Send>)>;

    fn create_directory(&self, dir: &StorageRoot, name: &str) -> Result<StorageRoot>;

    /// 查找子目录，不存在时创建；同名普通文件会被替换为目录
    fn find_or_create_directory(&self, dir: &StorageRoot, name: &str) -> Result<StorageRoot> {
        if let Some(existing) = self.find_child(dir, name)? {
            if let Some(child) = existing.as_directory() {
                return Ok(child);
            }
            self.delete(&existing);
        }
        self.create_directory(dir, name)
    }

    fn open_for_read(&self, entry: &StorageEntry) -> Result<Box<dyn Read + Send>>;

    /// 删除条目（目录递归），失败时记录日志并返回 false
    fn delete(&self, entry: &StorageEntry) -> bool;

    /// 将临时条目提升为最终名称，替换同名旧条目
    fn promote(&self, entry: &StorageEntry, final_name: &str) -> Result<StorageEntry>;

    /// 后端所在位置的可用空间
    ///
    /// 在备份目录创建之前即可调用，空间不足时不应改变目标位置。
    fn available_bytes(&self) -> Result<u64>;

    /// 目录在本地文件系统中的路径（仅直连后端）
    fn local_path(&self, _dir: &StorageRoot) -> Option<PathBuf> {
        None
    }

    fn display_path(&self, handle: &NodeHandle) -> String;

    /// 后端根位置（备份目录的上级）的展示路径
    fn base_display_path(&self) -> String;

    fn last_modified(&self, _dir: &StorageRoot) -> Option<DateTime<Utc>> {
        None
    }

    /// 递归统计目录下文件总大小
    fn folder_size(&self, dir: &StorageRoot) -> Result<u64> {
        let mut total = 0u64;
        let mut pending = vec![dir.clone()];
        while let Some(current) = pending.pop() {
            for entry in self.list_children(&current)? {
                match entry.as_directory() {
                    Some(child) => pending.push(child),
                    None => total += entry.size,
                }
            }
        }
        Ok(total)
    }

    /// 删除整个备份目录，目录不存在时返回 `Ok(false)`
    fn delete_root(&self) -> Result<bool>;
}

/// 校验单级文件名，拒绝空名、`.`、`..` 与路径分隔符
pub fn validate_child_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(BackupError::InvalidName(format!("非法文件名: {:?}", name)));
    }
    Ok(())
}

/// 根据偏好选择当前备份后端
///
/// - 已配置目录树 URI：使用授权目录树（需要宿主提供 `DocumentTreeProvider`）
/// - 未配置：使用直连路径 `<external>/<app>/Backup`
pub fn select_backend(
    config: &EngineConfig,
    prefs: &dyn PreferenceStore,
    tree_provider: Option<&Arc<dyn DocumentTreeProvider>>,
) -> Result<Arc<dyn StorageBackend>> {
    match backup_directory_uri(prefs)? {
        Some(uri) => {
            let provider = tree_provider.ok_or_else(|| {
                BackupError::StorageUnavailable(
                    "已配置授权目录，但宿主未提供目录树访问能力".to_string(),
                )
            })?;
            let tree = TreeUri::parse(&uri)?;
            Ok(Arc::new(ScopedTreeBackend::new(
                provider.clone(),
                tree,
                config.backup_dir_name.clone(),
                config.marker_file_name.clone(),
            )))
        }
        None => direct_backend(config).map(|backend| Arc::new(backend) as Arc<dyn StorageBackend>),
    }
}

/// 直连路径后端（不考虑偏好）
pub fn direct_backend(config: &EngineConfig) -> Result<DirectPathBackend> {
    let dir = config.direct_backup_dir().ok_or_else(|| {
        BackupError::StorageUnavailable("未配置外部存储目录".to_string())
    })?;
    Ok(DirectPathBackend::new(dir, config.marker_file_name.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_config::{MemoryPreferenceStore, PREF_BACKUP_DIRECTORY};
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn config_with_external(dir: &TempDir) -> EngineConfig {
        EngineConfig {
            external_storage_dir: Some(dir.path().to_path_buf()),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_validate_child_name() {
        assert!(validate_child_name("chat.db").is_ok());
        assert!(validate_child_name(".nomedia").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b"] {
            assert_matches!(validate_child_name(bad), Err(BackupError::InvalidName(_)));
        }
    }

    #[test]
    fn test_select_direct_backend_without_preference() {
        let dir = TempDir::new().unwrap();
        let config = config_with_external(&dir);
        let prefs = MemoryPreferenceStore::new();

        let backend = select_backend(&config, &prefs, None).unwrap();
        assert_eq!(backend.kind(), BackendKind::DirectPath);
    }

    #[test]
    fn test_select_scoped_backend_with_preference() {
        let dir = TempDir::new().unwrap();
        let config = config_with_external(&dir);
        let provider = Arc::new(LocalTreeProvider::new());
        let tree = provider.grant(dir.path(), true, true).unwrap();
        let prefs = MemoryPreferenceStore::new();
        prefs.put_string(PREF_BACKUP_DIRECTORY, tree.as_str()).unwrap();

        let provider: Arc<dyn DocumentTreeProvider> = provider;
        let backend = select_backend(&config, &prefs, Some(&provider)).unwrap();
        assert_eq!(backend.kind(), BackendKind::ScopedTree);
    }

    #[test]
    fn test_scoped_preference_without_provider_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let config = config_with_external(&dir);
        let prefs = MemoryPreferenceStore::new();
        prefs
            .put_string(PREF_BACKUP_DIRECTORY, "content://auth/tree/abc")
            .unwrap();

        assert_matches!(
            select_backend(&config, &prefs, None).err(),
            Some(BackupError::StorageUnavailable(_))
        );
    }

    #[test]
    fn test_no_external_storage_is_unavailable() {
        let config = EngineConfig {
            external_storage_dir: None,
            ..EngineConfig::default()
        };
        let prefs = MemoryPreferenceStore::new();
        assert_matches!(
            select_backend(&config, &prefs, None).err(),
            Some(BackupError::StorageUnavailable(_))
        );
    }
}
