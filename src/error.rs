//! 备份引擎错误类型
//!
//! 内部各组件统一返回 `BackupError`，会话在边界处将其折叠为
//! 对外可见的 [`BackupOutcome`]。

use crate::models::{BackupOutcome, OperationKind};

/// 备份/恢复过程中的错误
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// 存储位置不可用：未配置、授权被撤销或目录不可写
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Insufficient storage: required {required} bytes, available {available} bytes")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("Schema version incompatible: {0}")]
    VersionIncompatible(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),
}

impl From<rusqlite::Error> for BackupError {
    fn from(err: rusqlite::Error) -> Self {
        BackupError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

impl BackupError {
    /// 将错误映射为会话终态
    ///
    /// 同一种错误在备份与恢复方向上的含义不同：存储授权失效对备份而言是
    /// "没有可用存储"，对恢复而言是"找不到备份"。
    pub fn outcome_for(&self, operation: OperationKind) -> BackupOutcome {
        match (self, operation) {
            (BackupError::NotFound(_), _) => BackupOutcome::NotFound,
            (BackupError::InsufficientSpace { .. }, _) => BackupOutcome::NoAvailableStorage,
            (BackupError::StorageUnavailable(_), OperationKind::Backup) => {
                BackupOutcome::NoAvailableStorage
            }
            (BackupError::StorageUnavailable(_), OperationKind::Restore) => {
                BackupOutcome::NotFound
            }
            (BackupError::VersionIncompatible(_), OperationKind::Restore) => {
                BackupOutcome::NotFound
            }
            _ => BackupOutcome::Failure,
        }
    }
}
