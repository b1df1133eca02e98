//! 媒体目录复制
//!
//! 在本地目录与备份后端之间递归复制媒体文件（两个方向）：
//! - 使用显式栈做深度优先遍历，不依赖递归深度
//! - 目标已存在的文件一律跳过（先写入者胜出），重复执行只补齐缺失文件
//! - 单个条目失败只记录，不中断遍历
//! - 跳过符号链接
//! - 每个条目之间检查取消令牌

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backup_common::{is_symlink, log_and_skip_entry_err, remove_file_if_exists};
use crate::error::Result;
use crate::storage::{validate_child_name, StorageBackend, StorageEntry, StorageRoot};

/// 待处理的复制任务：源节点 + 目标父目录
struct CopyTask<S, D> {
    source: S,
    dest_root: D,
    is_directory: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedCopy {
    pub path: String,
    pub error: String,
}

/// 复制统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplicationReport {
    pub copied_files: usize,
    pub bytes_copied: u64,
    pub directories: usize,
    pub skipped_existing: usize,
    pub skipped_symlinks: usize,
    pub failed: Vec<FailedCopy>,
    pub cancelled: bool,
}

impl ReplicationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }

    fn record_failure(&mut self, path: impl Into<String>, error: impl std::fmt::Display) {
        let path = path.into();
        warn!("[MediaReplicator] 复制失败（已跳过）{}: {}", path, error);
        self.failed.push(FailedCopy {
            path,
            error: error.to_string(),
        });
    }
}

#[derive(Debug, Clone, Default)]
pub struct MediaReplicator {
    cancel: Option<CancellationToken>,
}

impl MediaReplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel: Some(cancel),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, CancellationToken::is_cancelled)
    }

    /// 备份方向：把本地 `source` 目录的内容复制到后端目录 `dest_root`
    pub fn copy_to_backend(
        &self,
        source: &Path,
        backend: &dyn StorageBackend,
        dest_root: &StorageRoot,
    ) -> ReplicationReport {
        let mut report = ReplicationReport::default();
        let mut stack: Vec<CopyTask<PathBuf, StorageRoot>> = Vec::new();
        push_local_children(source, dest_root, &mut stack, &mut report);

        while let Some(task) = stack.pop() {
            if self.is_cancelled() {
                report.cancelled = true;
                info!("[MediaReplicator] 已取消，剩余 {} 个条目未处理", stack.len() + 1);
                break;
            }
            if is_symlink(&task.source) {
                debug!("[MediaReplicator] 跳过符号链接: {:?}", task.source);
                report.skipped_symlinks += 1;
                continue;
            }
            let Some(name) = task.source.file_name().map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };

            if task.is_directory {
                match backend.find_or_create_directory(&task.dest_root, &name) {
                    Ok(child_root) => {
                        report.directories += 1;
                        push_local_children(&task.source, &child_root, &mut stack, &mut report);
                    }
                    Err(e) => report.record_failure(task.source.display().to_string(), e),
                }
                continue;
            }

            match upload_file(&task.source, backend, &task.dest_root, &name) {
                Ok(Some(bytes)) => {
                    report.copied_files += 1;
                    report.bytes_copied += bytes;
                }
                Ok(None) => report.skipped_existing += 1,
                Err(e) => report.record_failure(task.source.display().to_string(), e),
            }
        }

        info!(
            "[MediaReplicator] 媒体备份完成: copied={}, skipped={}, failed={}, cancelled={}",
            report.copied_files,
            report.skipped_existing,
            report.failed.len(),
            report.cancelled
        );
        report
    }

    /// 恢复方向：把后端目录 `source_root` 的内容复制到本地 `dest`
    pub fn copy_from_backend(
        &self,
        backend: &dyn StorageBackend,
        source_root: &StorageRoot,
        dest: &Path,
    ) -> ReplicationReport {
        let mut report = ReplicationReport::default();
        if let Err(e) = fs::create_dir_all(dest) {
            report.record_failure(dest.display().to_string(), e);
            return report;
        }

        let mut stack: Vec<CopyTask<StorageEntry, PathBuf>> = Vec::new();
        push_backend_children(backend, source_root, dest, &mut stack, &mut report);

        while let Some(task) = stack.pop() {
            if self.is_cancelled() {
                report.cancelled = true;
                info!("[MediaReplicator] 已取消，剩余 {} 个条目未处理", stack.len() + 1);
                break;
            }
            if let Err(e) = validate_child_name(&task.source.name) {
                report.record_failure(task.source.name.clone(), e);
                continue;
            }
            let target = task.dest_root.join(&task.source.name);

            if task.is_directory {
                if is_symlink_target(&target) {
                    report.skipped_symlinks += 1;
                    continue;
                }
                if let Err(e) = fs::create_dir_all(&target) {
                    report.record_failure(target.display().to_string(), e);
                    continue;
                }
                report.directories += 1;
                if let Some(child_root) = task.source.as_directory() {
                    push_backend_children(backend, &child_root, &target, &mut stack, &mut report);
                }
                continue;
            }

            if fs::symlink_metadata(&target).is_ok() {
                report.skipped_existing += 1;
                continue;
            }
            match download_file(backend, &task.source, &target) {
                Ok(bytes) => {
                    report.copied_files += 1;
                    report.bytes_copied += bytes;
                }
                Err(e) => report.record_failure(target.display().to_string(), e),
            }
        }

        info!(
            "[MediaReplicator] 媒体恢复完成: copied={}, skipped={}, failed={}, cancelled={}",
            report.copied_files,
            report.skipped_existing,
            report.failed.len(),
            report.cancelled
        );
        report
    }
}

fn is_symlink_target(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}

/// 子条目按名称倒序入栈，出栈顺序为字典序
fn push_local_children(
    dir: &Path,
    dest_root: &StorageRoot,
    stack: &mut Vec<CopyTask<PathBuf, StorageRoot>>,
    report: &mut ReplicationReport,
) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            report.record_failure(dir.display().to_string(), e);
            return;
        }
    };
    let mut children: Vec<(PathBuf, bool)> = entries
        .filter_map(log_and_skip_entry_err)
        .map(|entry| {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            (entry.path(), is_dir)
        })
        .collect();
    children.sort_by(|a, b| b.0.cmp(&a.0));
    stack.extend(children.into_iter().map(|(source, is_directory)| CopyTask {
        source,
        dest_root: dest_root.clone(),
        is_directory,
    }));
}

fn push_backend_children(
    backend: &dyn StorageBackend,
    dir: &StorageRoot,
    dest_root: &Path,
    stack: &mut Vec<CopyTask<StorageEntry, PathBuf>>,
    report: &mut ReplicationReport,
) {
    let mut children = match backend.list_children(dir) {
        Ok(children) => children,
        Err(e) => {
            report.record_failure(backend.display_path(dir.handle()), e);
            return;
        }
    };
    children.sort_by(|a, b| b.name.cmp(&a.name));
    stack.extend(children.into_iter().map(|entry| CopyTask {
        is_directory: entry.is_directory,
        source: entry,
        dest_root: dest_root.to_path_buf(),
    }));
}

/// 上传单个文件；目标已存在时返回 `Ok(None)`
fn upload_file(
    source: &Path,
    backend: &dyn StorageBackend,
    dest_root: &StorageRoot,
    name: &str,
) -> Result<Option<u64>> {
    if backend.find_child(dest_root, name)?.is_some() {
        return Ok(None);
    }
    // 先打开源文件，源不可读时不在目标留下空文件
    let mut reader = File::open(source)?;
    let (entry, mut writer) = backend.create_file(dest_root, name)?;
    let copied = io::copy(&mut reader, &mut writer).and_then(|n| writer.flush().map(|_| n));
    drop(writer);
    match copied {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) => {
            // 半成品会被后续执行当作已存在而跳过，必须删除
            backend.delete(&entry);
            Err(e.into())
        }
    }
}

fn download_file(backend: &dyn StorageBackend, entry: &StorageEntry, target: &Path) -> Result<u64> {
    let mut reader = backend.open_for_read(entry)?;
    let mut file = OpenOptions::new().write(true).create_new(true).open(target)?;
    let copied = io::copy(&mut reader, &mut file).and_then(|n| file.sync_all().map(|_| n));
    drop(file);
    match copied {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            if let Err(cleanup) = remove_file_if_exists(target) {
                warn!("[MediaReplicator] 清理半成品 {:?} 失败: {}", target, cleanup);
            }
            Err(e.into())
        }
    }
}
