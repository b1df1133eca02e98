use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 备份/恢复会话的终态结果
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackupOutcome {
    Success,
    NotFound,
    NoAvailableStorage,
    Failure,
}

impl BackupOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BackupOutcome::Success)
    }
}

impl fmt::Display for BackupOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackupOutcome::Success => "success",
            BackupOutcome::NotFound => "not_found",
            BackupOutcome::NoAvailableStorage => "no_available_storage",
            BackupOutcome::Failure => "failure",
        };
        f.write_str(label)
    }
}

/// 会话操作方向
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Backup,
    Restore,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Backup => f.write_str("backup"),
            OperationKind::Restore => f.write_str("restore"),
        }
    }
}

/// 已发现备份的描述信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub last_modified_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub display_path: String,
}

/// 会话阶段
///
/// 备份：Idle → CheckingSpace → Snapshotting → Sanitizing → Promoting → [ReplicatingMedia] → Done
///
/// 恢复：Idle → Locating → Validating → CopyingDatabase → [ReplicatingMedia] → Done
///
/// 任意非终态阶段都可以直接进入 `Done`。
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "phase", content = "outcome")]
pub enum SessionPhase {
    Idle,
    CheckingSpace,
    Snapshotting,
    Sanitizing,
    Promoting,
    Locating,
    Validating,
    CopyingDatabase,
    ReplicatingMedia,
    Done(BackupOutcome),
}

impl SessionPhase {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Done(_))
    }

    /// 验证阶段转换是否合法
    pub fn can_transition_to(&self, target: SessionPhase) -> bool {
        if let SessionPhase::Done(_) = target {
            return !self.is_terminal() && *self != SessionPhase::Idle;
        }
        match self {
            SessionPhase::Idle => matches!(
                target,
                SessionPhase::CheckingSpace | SessionPhase::Locating
            ),
            SessionPhase::CheckingSpace => target == SessionPhase::Snapshotting,
            SessionPhase::Snapshotting => target == SessionPhase::Sanitizing,
            SessionPhase::Sanitizing => target == SessionPhase::Promoting,
            SessionPhase::Promoting => target == SessionPhase::ReplicatingMedia,
            SessionPhase::Locating => target == SessionPhase::Validating,
            SessionPhase::Validating => target == SessionPhase::CopyingDatabase,
            SessionPhase::CopyingDatabase => target == SessionPhase::ReplicatingMedia,
            SessionPhase::ReplicatingMedia => false,
            // 终态只能通过新会话重置为 Idle
            SessionPhase::Done(_) => target == SessionPhase::Idle,
        }
    }
}
