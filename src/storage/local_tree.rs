//! 本地目录树提供者
//!
//! 在桌面/测试环境中以本地目录模拟授权目录树：用户通过 `grant` 把某个目录授权给应用，
//! 得到 `content://` 形式的树 URI；授权记录可持久化到 JSON 文件，并可随时撤销或降级。

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::document_tree::{DocumentMeta, DocumentRef, DocumentTreeProvider, GrantStatus, TreeUri};
use super::validate_child_name;
use crate::backup_common::{
    folder_size, get_available_disk_space, is_symlink, log_and_skip_entry_err, with_name_suffix,
};
use crate::error::{BackupError, Result};

pub const LOCAL_TREE_AUTHORITY: &str = "com.chatvault.localtree";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TreeGrant {
    root: PathBuf,
    readable: bool,
    writable: bool,
    granted_at: DateTime<Utc>,
}

pub struct LocalTreeProvider {
    grants: DashMap<String, TreeGrant>,
    grants_file: Option<PathBuf>,
    quota_bytes: Option<u64>,
}

impl Default for LocalTreeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTreeProvider {
    /// 仅内存授权表
    pub fn new() -> Self {
        Self {
            grants: DashMap::new(),
            grants_file: None,
            quota_bytes: None,
        }
    }

    /// 从 JSON 文件加载授权表，文件不存在时为空表
    pub fn open(grants_file: impl Into<PathBuf>) -> Result<Self> {
        let grants_file = grants_file.into();
        let grants = DashMap::new();
        if grants_file.exists() {
            let raw = fs::read_to_string(&grants_file)?;
            let stored: BTreeMap<String, TreeGrant> = serde_json::from_str(&raw)?;
            for (tree_id, grant) in stored {
                grants.insert(tree_id, grant);
            }
            debug!("[LocalTree] 已加载 {} 条目录授权", grants.len());
        }
        Ok(Self {
            grants,
            grants_file: Some(grants_file),
            quota_bytes: None,
        })
    }

    /// 为每棵树设置配额，可用空间 = 配额 - 已用
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    /// 授权目录，返回树 URI
    pub fn grant(&self, root: &Path, readable: bool, writable: bool) -> Result<TreeUri> {
        let root = fs::canonicalize(root)?;
        if !root.is_dir() {
            return Err(BackupError::StorageUnavailable(format!(
                "授权目标不是目录: {:?}",
                root
            )));
        }
        let tree_id = root.to_string_lossy().into_owned();
        let tree = TreeUri::new(LOCAL_TREE_AUTHORITY, &tree_id)?;
        self.grants.insert(
            tree_id,
            TreeGrant {
                root,
                readable,
                writable,
                granted_at: Utc::now(),
            },
        );
        self.persist()?;
        info!("[LocalTree] 已授权目录树: {}", tree);
        Ok(tree)
    }

    /// 撤销授权
    pub fn revoke(&self, tree: &TreeUri) -> Result<bool> {
        let removed = self.grants.remove(tree.tree_id()).is_some();
        if removed {
            self.persist()?;
            info!("[LocalTree] 已撤销目录树授权: {}", tree);
        }
        Ok(removed)
    }

    /// 调整授权读写标志
    pub fn set_grant_flags(&self, tree: &TreeUri, readable: bool, writable: bool) -> Result<()> {
        {
            let mut grant = self.grants.get_mut(tree.tree_id()).ok_or_else(|| {
                BackupError::StorageUnavailable(format!("目录树未授权: {}", tree))
            })?;
            grant.readable = readable;
            grant.writable = writable;
        }
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.grants_file else {
            return Ok(());
        };
        let snapshot: BTreeMap<String, TreeGrant> = self
            .grants
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = with_name_suffix(path, ".tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&snapshot)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn grant_root(&self, tree: &TreeUri) -> Result<PathBuf> {
        self.grants
            .get(tree.tree_id())
            .map(|grant| grant.root.clone())
            .ok_or_else(|| BackupError::StorageUnavailable(format!("目录树未授权: {}", tree)))
    }

    /// 将文档引用解析为本地路径，同时校验授权
    fn resolve(&self, document: &DocumentRef, write: bool) -> Result<PathBuf> {
        let status = self.check_grant(&document.tree);
        if !status.readable || (write && !status.writable) {
            return Err(BackupError::StorageUnavailable(format!(
                "目录树授权不足: {} (readable={}, writable={})",
                document.tree, status.readable, status.writable
            )));
        }
        let mut path = self.grant_root(&document.tree)?;
        if !document.is_root() {
            for component in document.document_id.split('/') {
                validate_child_name(component)?;
                path.push(component);
            }
        }
        Ok(path)
    }
}

fn meta_for(document: DocumentRef, path: &Path) -> Result<DocumentMeta> {
    let meta = fs::metadata(path)?;
    let last_modified = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok(DocumentMeta {
        name: document.name().to_string(),
        document,
        is_directory: meta.is_dir(),
        size: if meta.is_dir() { 0 } else { meta.len() },
        last_modified,
    })
}

impl DocumentTreeProvider for LocalTreeProvider {
    fn check_grant(&self, tree: &TreeUri) -> GrantStatus {
        match self.grants.get(tree.tree_id()) {
            Some(grant) if grant.root.is_dir() => GrantStatus {
                readable: grant.readable,
                writable: grant.writable,
            },
            _ => GrantStatus::default(),
        }
    }

    fn stat(&self, document: &DocumentRef) -> Result<Option<DocumentMeta>> {
        let path = self.resolve(document, false)?;
        if !path.exists() {
            return Ok(None);
        }
        meta_for(document.clone(), &path).map(Some)
    }

    fn list_children(&self, directory: &DocumentRef) -> Result<Vec<DocumentMeta>> {
        let path = self.resolve(directory, false)?;
        let mut children = Vec::new();
        for entry in fs::read_dir(&path)?.filter_map(log_and_skip_entry_err) {
            let child_path = entry.path();
            if is_symlink(&child_path) {
                debug!("[LocalTree] 跳过符号链接: {:?}", child_path);
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match meta_for(directory.child(&name), &child_path) {
                Ok(meta) => children.push(meta),
                Err(e) => warn!("[LocalTree] 读取元数据失败 {:?}: {}", child_path, e),
            }
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    fn create_directory(&self, parent: &DocumentRef, name: &str) -> Result<DocumentRef> {
        validate_child_name(name)?;
        let path = self.resolve(parent, true)?.join(name);
        fs::create_dir_all(&path)?;
        Ok(parent.child(name))
    }

    fn create_document(&self, parent: &DocumentRef, name: &str) -> Result<DocumentRef> {
        validate_child_name(name)?;
        let path = self.resolve(parent, true)?.join(name);
        OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok(parent.child(name))
    }

    fn open_read(&self, document: &DocumentRef) -> Result<Box<dyn Read + Send>> {
        let path = self.resolve(document, false)?;
        Ok(Box::new(File::open(path)?))
    }

    fn open_write(&self, document: &DocumentRef) -> Result<Box<dyn Write + Send>> {
        let path = self.resolve(document, true)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(file))
    }

    fn delete(&self, document: &DocumentRef) -> Result<bool> {
        let path = self.resolve(document, true)?;
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        Ok(true)
    }

    fn rename(&self, document: &DocumentRef, new_name: &str) -> Result<DocumentRef> {
        validate_child_name(new_name)?;
        let parent = document
            .parent()
            .ok_or_else(|| BackupError::InvalidName("无法重命名目录树根".to_string()))?;
        let path = self.resolve(document, true)?;
        fs::rename(&path, path.with_file_name(new_name))?;
        Ok(parent.child(new_name))
    }

    fn available_bytes(&self, tree: &TreeUri) -> Result<u64> {
        let root = self.resolve(&DocumentRef::root(tree.clone()), false)?;
        match self.quota_bytes {
            Some(quota) => Ok(quota.saturating_sub(folder_size(&root))),
            None => get_available_disk_space(&root),
        }
    }

    fn display_path(&self, document: &DocumentRef) -> String {
        match self.grant_root(&document.tree) {
            Ok(root) if document.is_root() => root.display().to_string(),
            Ok(root) => root.join(&document.document_id).display().to_string(),
            Err(_) => format!("{}/{}", document.tree, document.document_id),
        }
    }
}
