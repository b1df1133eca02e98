//! 直连路径后端
//!
//! 备份目录为本地文件系统上的固定路径，提升使用 `fs::rename` 原子替换。

use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{
    validate_child_name, BackendKind, NodeHandle, StorageBackend, StorageEntry, StorageRoot,
};
use crate::backup_common::{get_available_disk_space, is_symlink, log_and_skip_entry_err};
use crate::error::{BackupError, Result};

#[derive(Debug, Clone)]
pub struct DirectPathBackend {
    root: PathBuf,
    marker_file_name: String,
}

impl DirectPathBackend {
    pub fn new(root: impl Into<PathBuf>, marker_file_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            marker_file_name: marker_file_name.into(),
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    fn ensure_marker(&self) -> Result<()> {
        let marker = self.root.join(&self.marker_file_name);
        if !marker.exists() {
            File::create(&marker)?;
            debug!("[DirectPath] 已创建标记文件 {:?}", marker);
        }
        Ok(())
    }
}

fn path_of(handle: &NodeHandle) -> Result<&Path> {
    match handle {
        NodeHandle::Path(path) => Ok(path),
        NodeHandle::Document(doc) => Err(BackupError::Configuration(format!(
            "直连后端收到目录树句柄: {}",
            doc.document_id
        ))),
    }
}

fn entry_for(path: &Path) -> Result<StorageEntry> {
    let meta = fs::metadata(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let last_modified = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok(StorageEntry::new(
        name,
        meta.is_dir(),
        if meta.is_dir() { 0 } else { meta.len() },
        last_modified,
        NodeHandle::Path(path.to_path_buf()),
    ))
}

impl StorageBackend for DirectPathBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::DirectPath
    }

    fn check_access(&self) -> bool {
        // 目录尚未创建时检查最近的已存在祖先
        match self.root.ancestors().find(|p| p.exists()) {
            Some(existing) => fs::metadata(existing)
                .map(|meta| meta.is_dir() && !meta.permissions().readonly())
                .unwrap_or(false),
            None => false,
        }
    }

    fn resolve_root(&self, create_if_missing: bool) -> Result<Option<StorageRoot>> {
        if self.root.is_dir() {
            if create_if_missing {
                self.ensure_marker()?;
            }
            return Ok(Some(StorageRoot::new(NodeHandle::Path(self.root.clone()))));
        }
        if !create_if_missing {
            return Ok(None);
        }
        if self.root.exists() {
            warn!("[DirectPath] 备份路径被普通文件占用，替换为目录: {:?}", self.root);
            fs::remove_file(&self.root)?;
        }
        fs::create_dir_all(&self.root).map_err(|e| {
            BackupError::StorageUnavailable(format!("创建备份目录失败 {:?}: {}", self.root, e))
        })?;
        self.ensure_marker()?;
        info!("[DirectPath] 已创建备份目录 {:?}", self.root);
        Ok(Some(StorageRoot::new(NodeHandle::Path(self.root.clone()))))
    }

    fn list_children(&self, dir: &StorageRoot) -> Result<Vec<StorageEntry>> {
        let dir_path = path_of(dir.handle())?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir_path)?.filter_map(log_and_skip_entry_err) {
            let path = entry.path();
            if is_symlink(&path) {
                debug!("[DirectPath] 跳过符号链接: {:?}", path);
                continue;
            }
            match entry_for(&path) {
                Ok(e) => entries.push(e),
                Err(e) => warn!("[DirectPath] 读取元数据失败 {:?}: {}", path, e),
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn find_child(&self, dir: &StorageRoot, name: &str) -> Result<Option<StorageEntry>> {
        validate_child_name(name)?;
        let path = path_of(dir.handle())?.join(name);
        if !path.exists() || is_symlink(&path) {
            return Ok(None);
        }
        entry_for(&path).map(Some)
    }

    fn create_file(
        &self,
        dir: &StorageRoot,
        name: &str,
    ) -> Result<(StorageEntry, Box<dyn Write + Send>)> {
        validate_child_name(name)?;
        let path = path_of(dir.handle())?.join(name);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let entry = entry_for(&path)?;
        Ok((entry, Box::new(file)))
    }

    fn create_directory(&self, dir: &StorageRoot, name: &str) -> Result<StorageRoot> {
        validate_child_name(name)?;
        let path = path_of(dir.handle())?.join(name);
        fs::create_dir_all(&path)?;
        Ok(StorageRoot::new(NodeHandle::Path(path)))
    }

    fn open_for_read(&self, entry: &StorageEntry) -> Result<Box<dyn Read + Send>> {
        let path = path_of(entry.handle())?;
        Ok(Box::new(File::open(path)?))
    }

    fn delete(&self, entry: &StorageEntry) -> bool {
        let path = match path_of(entry.handle()) {
            Ok(path) => path,
            Err(e) => {
                warn!("[DirectPath] 删除失败: {}", e);
                return false;
            }
        };
        let result = if entry.is_directory {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("[DirectPath] 删除 {:?} 失败: {}", path, e);
                false
            }
        }
    }

    fn promote(&self, entry: &StorageEntry, final_name: &str) -> Result<StorageEntry> {
        validate_child_name(final_name)?;
        let source = path_of(entry.handle())?;
        let target = source.with_file_name(final_name);
        // 同一目录内 rename 原子替换旧文件
        fs::rename(source, &target)?;
        debug!("[DirectPath] 已提升 {:?} -> {:?}", source, target);
        entry_for(&target)
    }

    fn available_bytes(&self) -> Result<u64> {
        get_available_disk_space(&self.root)
    }

    fn local_path(&self, dir: &StorageRoot) -> Option<PathBuf> {
        path_of(dir.handle()).ok().map(Path::to_path_buf)
    }

    fn display_path(&self, handle: &NodeHandle) -> String {
        match handle {
            NodeHandle::Path(path) => path.display().to_string(),
            NodeHandle::Document(doc) => doc.document_id.clone(),
        }
    }

    fn base_display_path(&self) -> String {
        self.root.display().to_string()
    }

    fn last_modified(&self, dir: &StorageRoot) -> Option<DateTime<Utc>> {
        let path = path_of(dir.handle()).ok()?;
        fs::metadata(path)
            .and_then(|meta| meta.modified())
            .map(DateTime::<Utc>::from)
            .ok()
    }

    fn delete_root(&self) -> Result<bool> {
        if !self.root.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&self.root)?;
        info!("[DirectPath] 已删除备份目录 {:?}", self.root);
        Ok(true)
    }
}
