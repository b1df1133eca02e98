//! 备份系统共享组件
//!
//! 提供各备份模块共用的工具函数
//! - 目录遍历: 记录并跳过单个条目错误、符号链接检测
//! - 磁盘空间: 系统 API 查询可用空间，严格比较（不留余量）
//! - SQLite 附属文件: `-wal` / `-shm` / `-journal` 清理
//! - 锁中毒恢复

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use walkdir::WalkDir;

use crate::error::{BackupError, Result};

/// 正在生成中的备份文件后缀，提升前最终文件名上不会出现半成品
pub const BACKUP_POSTFIX: &str = ".backup";

/// 目录树提升期间旧备份的暂存后缀，最终文件缺失时它就是唯一的完整备份
pub const PREVIOUS_POSTFIX: &str = ".previous";

/// SQLite 可能在数据库旁生成的附属文件后缀
pub const SQLITE_SIDE_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// 记录并跳过迭代中的错误，避免 `.flatten()` 静默丢弃
///
/// 适用于 `read_dir` / `WalkDir` 等迭代场景。
pub fn log_and_skip_entry_err<T, E: std::fmt::Display>(
    result: std::result::Result<T, E>,
) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("[BackupCommon] 目录条目读取失败（已跳过）: {}", e);
            None
        }
    }
}

/// 安全地获取 Mutex 锁，在中毒时恢复锁并返回 guard
pub fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                "[BackupCommon] Mutex poisoned! Attempting recovery for type: {:?}",
                std::any::type_name::<T>()
            );
            poisoned.into_inner()
        }
    }
}

// ============================================================================
// 符号链接检测
// ============================================================================

/// 检查路径是否为符号链接
///
/// 使用 symlink_metadata 而非 metadata，避免跟随符号链接。
/// 无法读取元数据时返回 `true`，调用方会跳过该路径。
pub fn is_symlink(path: &Path) -> bool {
    match fs::symlink_metadata(path) {
        Ok(meta) => meta.file_type().is_symlink(),
        Err(e) => {
            tracing::warn!(
                "[BackupCommon] 无法读取路径元数据 {:?}: {}，按符号链接处理并跳过",
                path,
                e
            );
            true
        }
    }
}

// ============================================================================
// 文件名 / 附属文件
// ============================================================================

/// 在文件名末尾追加后缀（不替换扩展名）
///
/// `chat.db` + `-wal` → `chat.db-wal`
pub fn with_name_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// 删除文件，不存在时返回 `Ok(false)`
pub fn remove_file_if_exists(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// 删除数据库文件及其 `-wal` / `-shm` / `-journal` 附属文件
pub fn remove_database_files(db_path: &Path) -> std::io::Result<()> {
    remove_file_if_exists(db_path)?;
    for suffix in SQLITE_SIDE_SUFFIXES {
        remove_file_if_exists(&with_name_suffix(db_path, suffix))?;
    }
    Ok(())
}

/// 统计目录下所有普通文件的总大小（不跟随符号链接）
pub fn folder_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(log_and_skip_entry_err)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

// ============================================================================
// 磁盘空间检查
// ============================================================================

/// 获取指定路径所在磁盘的可用空间（字节）
///
/// 路径不存在时向上查找最近的已存在祖先目录。优先使用 statvfs，
/// 失败时回退到解析 `df` 输出。
pub fn get_available_disk_space(path: &Path) -> Result<u64> {
    let check_path = nearest_existing_ancestor(path);

    #[cfg(unix)]
    {
        match get_disk_space_statvfs(&check_path) {
            Ok(bytes) => return Ok(bytes),
            Err(e) => {
                tracing::warn!("[BackupCommon] statvfs 调用失败，回退到 df 命令解析: {}", e);
            }
        }

        if let Some(bytes) = get_disk_space_df_fallback(&check_path) {
            return Ok(bytes);
        }
    }

    // 无法确定可用空间时拒绝写入，除非显式允许
    let allow_fallback = std::env::var("CHAT_VAULT_ALLOW_UNKNOWN_DISK_SPACE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_fallback {
        tracing::warn!("[BackupCommon] 无法获取磁盘可用空间，已按环境变量放行 {:?}", check_path);
        Ok(u64::MAX)
    } else {
        Err(BackupError::StorageUnavailable(format!(
            "无法获取磁盘可用空间: {:?}。可设置 CHAT_VAULT_ALLOW_UNKNOWN_DISK_SPACE=1 跳过检查",
            check_path
        )))
    }
}

fn nearest_existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|candidate| !candidate.as_os_str().is_empty() && candidate.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Unix: 使用 libc::statvfs 获取非特权进程可用的字节数
#[cfg(unix)]
fn get_disk_space_statvfs(path: &Path) -> Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| {
        BackupError::InvalidName(format!("路径包含空字节，无法传递给 statvfs: {}", e))
    })?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };

    if ret == 0 {
        // f_bavail * f_frsize = 非特权用户可用的字节数
        let available = stat.f_bavail as u64 * stat.f_frsize as u64;
        tracing::debug!(
            "[BackupCommon] statvfs 成功: path={:?}, available={} bytes",
            path,
            available
        );
        Ok(available)
    } else {
        Err(BackupError::Io(std::io::Error::last_os_error()))
    }
}

/// Unix 回退: 解析 `df -k` 第二行第四列（Available）
#[cfg(unix)]
fn get_disk_space_df_fallback(path: &Path) -> Option<u64> {
    use std::process::Command;

    let output = Command::new("df")
        .args(["-k", &path.to_string_lossy()])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.lines().nth(1)?;
    let available_kb = line.split_whitespace().nth(3)?.parse::<u64>().ok()?;
    tracing::debug!("[BackupCommon] df 回退成功: available={} KB", available_kb);
    Some(available_kb * 1024)
}

/// 检查可用空间是否足以容纳 `required_bytes`
///
/// 严格比较 `available < required`，不附加安全余量。
pub fn ensure_space(available: u64, required_bytes: u64) -> Result<()> {
    if available < required_bytes {
        return Err(BackupError::InsufficientSpace {
            required: required_bytes,
            available,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_is_symlink_regular_file() {
        let temp_file = NamedTempFile::new().unwrap();
        assert!(!is_symlink(temp_file.path()), "普通文件不应被识别为符号链接");
    }

    #[cfg(unix)]
    #[test]
    fn test_is_symlink_actual_symlink() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target.txt");
        fs::write(&target, b"target content").unwrap();

        let link = dir.path().join("link.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert!(is_symlink(&link), "符号链接应被正确识别");
        assert!(!is_symlink(&target), "目标文件不应被识别为符号链接");
    }

    #[test]
    fn test_with_name_suffix_keeps_extension() {
        let wal = with_name_suffix(Path::new("/data/chat.db"), "-wal");
        assert_eq!(wal, PathBuf::from("/data/chat.db-wal"));

        let tmp = with_name_suffix(Path::new("chat.db"), BACKUP_POSTFIX);
        assert_eq!(tmp, PathBuf::from("chat.db.backup"));
    }

    #[test]
    fn test_remove_database_files_clears_side_files() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("chat.db");
        fs::write(&db, b"db").unwrap();
        fs::write(with_name_suffix(&db, "-wal"), b"wal").unwrap();
        fs::write(with_name_suffix(&db, "-shm"), b"shm").unwrap();

        remove_database_files(&db).unwrap();

        assert!(!db.exists());
        assert!(!with_name_suffix(&db, "-wal").exists());
        assert!(!with_name_suffix(&db, "-shm").exists());
        // 再次删除不应报错
        remove_database_files(&db).unwrap();
    }

    #[test]
    fn test_folder_size_sums_nested_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.bin"), vec![0u8; 100]).unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("b.bin"), vec![0u8; 23]).unwrap();

        assert_eq!(folder_size(dir.path()), 123);
    }

    #[test]
    fn test_get_available_disk_space_missing_path_uses_ancestor() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("not").join("yet").join("created");
        let space = get_available_disk_space(&missing).unwrap();
        assert!(space > 0, "磁盘可用空间应该为正数，实际值: {}", space);
    }

    #[test]
    fn test_ensure_space_is_strict() {
        assert!(ensure_space(100, 100).is_ok(), "可用空间恰好相等时应放行");
        assert_matches!(
            ensure_space(99, 100),
            Err(BackupError::InsufficientSpace {
                required: 100,
                available: 99
            })
        );
    }

    #[test]
    fn test_log_and_skip_entry_err_values() {
        let ok: std::result::Result<i32, String> = Ok(42);
        assert_eq!(log_and_skip_entry_err(ok), Some(42), "Ok 值应该被正常传递");

        let err: std::result::Result<i32, String> = Err("some error".to_string());
        assert_eq!(log_and_skip_entry_err(err), None, "Err 值应该返回 None");
    }

    #[test]
    fn test_safe_lock_recovers_from_poison() {
        let mutex = std::sync::Arc::new(Mutex::new(5));
        let cloned = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(mutex.is_poisoned());
        assert_eq!(*safe_lock(&mutex), 5);
    }
}
