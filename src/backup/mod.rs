//! # 备份引擎
//!
//! 把在线聊天库与媒体目录备份到外部位置，并能从中恢复。
//!
//! ## 模块结构
//!
//! - `snapshot`: WAL 检查点 + SQLite Backup API，生成单文件一致快照
//! - `sanitize`: 清除快照中与本机/服务器会话相关的临时数据
//! - `validator`: schema 版本闸门（`min_supported_version..=current_version`）
//! - `locator`: 按优先级查找第一个可恢复的备份
//! - `media`: 媒体目录的递归复制（尽力而为，可续传）
//! - `session`: 串起以上步骤的备份/恢复状态机
//!
//! ## 原子性
//!
//! 新备份总是先写成 `<db>.backup`，校验通过后再提升为最终名称；
//! 任何一步失败时，之前的备份保持原样。

pub mod locator;
pub mod media;
pub mod sanitize;
pub mod session;
pub mod snapshot;
pub mod validator;

pub use locator::{BackupLocator, BackupOrigin, LocatedBackup};
pub use media::{FailedCopy, MediaReplicator, ReplicationReport};
pub use sanitize::{default_rules, DatabaseSanitizer, SanitizeReport, SanitizeRule};
pub use session::{BackupSession, BackupSessionBuilder};
pub use snapshot::{DatabaseSnapshotter, Snapshot};
pub use validator::BackupValidator;
