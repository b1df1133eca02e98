// Chat Vault library entry
// 聊天库备份/恢复引擎，bin 目标只做命令行包装。

pub mod backup;
pub mod backup_common;
pub mod backup_config;
pub mod error;
pub mod live_store;
pub mod logging;
pub mod models;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_utils;

pub use backup::{BackupSession, BackupSessionBuilder};
pub use backup_config::{EngineConfig, MemoryPreferenceStore, PreferenceStore, SqlitePreferenceStore};
pub use error::{BackupError, Result};
pub use live_store::{LiveStore, SqliteLiveStore};
pub use models::{BackupInfo, BackupOutcome, OperationKind, SessionPhase};
pub use storage::{BackendKind, DocumentTreeProvider, LocalTreeProvider, StorageBackend, TreeUri};
