//! 备份定位
//!
//! 按优先级查找第一个可恢复的备份：
//! 1. 每个候选后端的备份目录下，依次尝试当前库名、提升中断留下的
//!    `<当前库名>.previous` 与各历史库名
//! 2. 旧格式目录中名为 `<app>.<platform>.<version>` 且版本在支持范围内的文件
//!
//! 候选后端的顺序由调用方决定（当前后端在前，直连旧位置在后）。
//! 定位只读，不修改任何文件，因此重复调用结果一致。

use regex::Regex;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use super::validator::BackupValidator;
use crate::backup_common::{is_symlink, log_and_skip_entry_err, PREVIOUS_POSTFIX};
use crate::backup_config::EngineConfig;
use crate::error::{BackupError, Result};
use crate::models::BackupInfo;
use crate::storage::{NodeHandle, StorageBackend, StorageEntry, StorageRoot};
use chrono::{DateTime, Utc};

/// 备份来源
pub enum BackupOrigin {
    Backend {
        backend: Arc<dyn StorageBackend>,
        root: StorageRoot,
        entry: StorageEntry,
    },
    OldFormat {
        path: PathBuf,
        version: u32,
    },
}

impl fmt::Debug for BackupOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupOrigin::Backend { backend, entry, .. } => f
                .debug_struct("Backend")
                .field("kind", &backend.kind())
                .field("entry", &entry.name)
                .finish(),
            BackupOrigin::OldFormat { path, version } => f
                .debug_struct("OldFormat")
                .field("path", path)
                .field("version", version)
                .finish(),
        }
    }
}

#[derive(Debug)]
pub struct LocatedBackup {
    pub info: BackupInfo,
    pub origin: BackupOrigin,
}

pub struct BackupLocator {
    validator: BackupValidator,
    database_names: Vec<String>,
    old_backup_dir: Option<PathBuf>,
    old_name_pattern: Regex,
}

impl BackupLocator {
    pub fn new(config: &EngineConfig, validator: BackupValidator) -> Result<Self> {
        let pattern = format!(
            r"^{}\.{}\.(\d+)$",
            regex::escape(&config.app_name),
            regex::escape(&config.platform)
        );
        let old_name_pattern = Regex::new(&pattern)
            .map_err(|e| BackupError::Configuration(format!("旧格式文件名模式无效: {}", e)))?;

        let mut database_names = vec![
            config.database_name.clone(),
            format!("{}{}", config.database_name, PREVIOUS_POSTFIX),
        ];
        database_names.extend(config.legacy_database_names.iter().cloned());

        Ok(Self {
            validator,
            database_names,
            old_backup_dir: config.old_backup_dir.clone(),
            old_name_pattern,
        })
    }

    /// 查找第一个可恢复的备份
    pub fn locate(&self, backends: &[Arc<dyn StorageBackend>]) -> Option<LocatedBackup> {
        backends
            .iter()
            .find_map(|backend| self.probe_backend(backend))
            .or_else(|| self.find_old_format())
    }

    fn probe_backend(&self, backend: &Arc<dyn StorageBackend>) -> Option<LocatedBackup> {
        let root = match backend.resolve_root(false) {
            Ok(Some(root)) => root,
            Ok(None) => {
                debug!("[Locator] {:?} 后端没有备份目录", backend.kind());
                return None;
            }
            Err(e) => {
                debug!("[Locator] {:?} 后端不可访问: {}", backend.kind(), e);
                return None;
            }
        };

        for name in &self.database_names {
            let entry = match backend.find_child(&root, name) {
                Ok(Some(entry)) if !entry.is_directory => entry,
                Ok(_) => continue,
                Err(e) => {
                    warn!("[Locator] 查询候选 {} 失败: {}", name, e);
                    continue;
                }
            };
            if !self.is_restorable(backend.as_ref(), &entry) {
                debug!("[Locator] 跳过不可恢复的候选 {}", name);
                continue;
            }
            return Some(LocatedBackup {
                info: BackupInfo {
                    last_modified_at: entry.last_modified,
                    size_bytes: entry.size,
                    display_path: backend.display_path(entry.handle()),
                },
                origin: BackupOrigin::Backend {
                    backend: backend.clone(),
                    root,
                    entry,
                },
            });
        }
        None
    }

    fn is_restorable(&self, backend: &dyn StorageBackend, entry: &StorageEntry) -> bool {
        match entry.handle() {
            NodeHandle::Path(path) => self.validator.is_restorable(path),
            NodeHandle::Document(_) => match backend.open_for_read(entry) {
                Ok(reader) => self.validator.is_restorable_stream(reader),
                Err(e) => {
                    debug!("[Locator] 无法读取候选 {}: {}", entry.name, e);
                    false
                }
            },
        }
    }

    /// 在旧格式目录中查找版本最高且受支持的备份
    pub fn find_old_format(&self) -> Option<LocatedBackup> {
        let dir = self.old_backup_dir.as_ref()?;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("[Locator] 旧格式目录不可读 {:?}: {}", dir, e);
                return None;
            }
        };

        let (path, version) = entries
            .filter_map(log_and_skip_entry_err)
            .filter_map(|entry| {
                let path = entry.path();
                if !path.is_file() || is_symlink(&path) {
                    return None;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                let version = self
                    .old_name_pattern
                    .captures(&name)?
                    .get(1)?
                    .as_str()
                    .parse::<u32>()
                    .ok()?;
                self.validator.accepts(version).then_some((path, version))
            })
            .max_by_key(|(_, version)| *version)?;

        let meta = fs::metadata(&path).ok()?;
        let last_modified_at = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH));
        Some(LocatedBackup {
            info: BackupInfo {
                last_modified_at,
                size_bytes: meta.len(),
                display_path: path.display().to_string(),
            },
            origin: BackupOrigin::OldFormat { path, version },
        })
    }
}
