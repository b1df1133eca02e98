//! 备份可恢复性校验
//!
//! 以只读方式读取候选文件中的 schema 版本（`PRAGMA user_version`），
//! 仅接受 `[min_supported, current]` 区间内的版本。校验从不修改候选文件。

use rusqlite::{Connection, OpenFlags};
use std::io::Read;
use std::path::Path;
use tracing::debug;

use crate::backup_config::{EngineConfig, CURRENT_VERSION, MIN_SUPPORTED_VERSION};
use crate::error::{BackupError, Result};

/// SQLite 文件头魔数
const SQLITE_HEADER_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// 文件头长度
const SQLITE_HEADER_LEN: usize = 100;

/// 文件头中 user_version 的偏移（4 字节大端）
const USER_VERSION_OFFSET: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupValidator {
    min_supported: u32,
    current: u32,
}

impl Default for BackupValidator {
    fn default() -> Self {
        Self::new(MIN_SUPPORTED_VERSION, CURRENT_VERSION)
    }
}

impl BackupValidator {
    pub fn new(min_supported: u32, current: u32) -> Self {
        Self {
            min_supported,
            current,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.min_supported_version, config.current_version)
    }

    pub fn accepts(&self, version: u32) -> bool {
        (self.min_supported..=self.current).contains(&version)
    }

    /// 只读打开数据库读取 schema 版本
    pub fn read_schema_version(path: &Path) -> Result<u32> {
        if !path.is_file() {
            return Err(BackupError::NotFound(format!("候选备份不存在: {:?}", path)));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        u32::try_from(version)
            .map_err(|_| BackupError::VersionIncompatible(format!("非法 user_version: {}", version)))
    }

    /// 从数据流的文件头读取 schema 版本，只消耗前 100 字节
    pub fn read_header_version<R: Read>(mut reader: R) -> Result<u32> {
        let mut header = [0u8; SQLITE_HEADER_LEN];
        reader.read_exact(&mut header)?;
        if &header[..SQLITE_HEADER_MAGIC.len()] != SQLITE_HEADER_MAGIC {
            return Err(BackupError::Database("文件头不是 SQLite 数据库".to_string()));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&header[USER_VERSION_OFFSET..USER_VERSION_OFFSET + 4]);
        Ok(u32::from_be_bytes(version))
    }

    /// 校验本地文件，返回其 schema 版本
    pub fn check(&self, path: &Path) -> Result<u32> {
        let version = Self::read_schema_version(path)?;
        self.check_version(version)
    }

    fn check_version(&self, version: u32) -> Result<u32> {
        if self.accepts(version) {
            Ok(version)
        } else {
            Err(BackupError::VersionIncompatible(format!(
                "schema 版本 {} 不在支持范围 {}..={} 内",
                version, self.min_supported, self.current
            )))
        }
    }

    /// 本地文件是否可恢复，任何错误都视为不可恢复
    pub fn is_restorable(&self, path: &Path) -> bool {
        match self.check(path) {
            Ok(version) => {
                debug!("[Validator] {:?} 可恢复 (version={})", path, version);
                true
            }
            Err(e) => {
                debug!("[Validator] {:?} 不可恢复: {}", path, e);
                false
            }
        }
    }

    /// 数据流是否可恢复（仅检查文件头）
    pub fn is_restorable_stream<R: Read>(&self, reader: R) -> bool {
        match Self::read_header_version(reader).and_then(|v| self.check_version(v)) {
            Ok(_) => true,
            Err(e) => {
                debug!("[Validator] 数据流不可恢复: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::seed_chat_database;
    use assert_matches::assert_matches;
    use std::fs;
    use tempfile::TempDir;

    fn database_with_version(dir: &TempDir, name: &str, version: u32) -> std::path::PathBuf {
        let path = dir.path().join(name);
        drop(seed_chat_database(&path, version));
        path
    }

    #[test]
    fn test_version_gate_boundaries() {
        let dir = TempDir::new().unwrap();
        let validator = BackupValidator::new(15, 52);

        let too_old = database_with_version(&dir, "old.db", 14);
        let oldest = database_with_version(&dir, "min.db", 15);
        let current = database_with_version(&dir, "cur.db", 52);
        let too_new = database_with_version(&dir, "new.db", 53);

        assert!(!validator.is_restorable(&too_old));
        assert!(validator.is_restorable(&oldest));
        assert!(validator.is_restorable(&current));
        assert!(!validator.is_restorable(&too_new));
        assert_matches!(validator.check(&too_old), Err(BackupError::VersionIncompatible(_)));
    }

    #[test]
    fn test_garbage_and_missing_files_are_not_restorable() {
        let dir = TempDir::new().unwrap();
        let validator = BackupValidator::default();

        let garbage = dir.path().join("garbage.db");
        fs::write(&garbage, vec![7u8; 4096]).unwrap();
        assert!(!validator.is_restorable(&garbage));

        let missing = dir.path().join("missing.db");
        assert!(!validator.is_restorable(&missing));
        assert!(!missing.exists(), "只读校验不应创建文件");
    }

    #[test]
    fn test_validation_does_not_modify_candidate() {
        let dir = TempDir::new().unwrap();
        let path = database_with_version(&dir, "chat.db", 40);
        let before = fs::read(&path).unwrap();

        assert!(BackupValidator::default().is_restorable(&path));
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_header_version_matches_pragma() {
        let dir = TempDir::new().unwrap();
        let path = database_with_version(&dir, "chat.db", 33);

        let from_header = BackupValidator::read_header_version(fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(from_header, 33);
        assert_eq!(BackupValidator::read_schema_version(&path).unwrap(), 33);

        let validator = BackupValidator::new(15, 52);
        assert!(validator.is_restorable_stream(fs::File::open(&path).unwrap()));
        assert!(!BackupValidator::new(34, 52).is_restorable_stream(fs::File::open(&path).unwrap()));
    }

    #[test]
    fn test_short_stream_is_rejected() {
        let validator = BackupValidator::default();
        assert!(!validator.is_restorable_stream(&b"SQLite format 3\0"[..]));
    }
}
