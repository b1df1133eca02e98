//! 快照清洗
//!
//! 在快照副本上清除设备相关的瞬态数据（待发送队列、同步游标等），
//! 避免恢复到其他设备后重放。每条规则独立执行，单条失败只记录日志。

use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use tracing::{debug, warn};

/// 清洗规则
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanitizeRule {
    /// 将某列全部置为 NULL
    ClearColumn { table: String, column: String },
    /// 清空整张表
    Truncate { table: String },
}

impl SanitizeRule {
    pub fn clear_column(table: &str, column: &str) -> Self {
        SanitizeRule::ClearColumn {
            table: table.to_string(),
            column: column.to_string(),
        }
    }

    pub fn truncate(table: &str) -> Self {
        SanitizeRule::Truncate {
            table: table.to_string(),
        }
    }

    fn sql(&self) -> String {
        match self {
            SanitizeRule::ClearColumn { table, column } => format!(
                "UPDATE {} SET {} = NULL",
                quote_identifier(table),
                quote_identifier(column)
            ),
            SanitizeRule::Truncate { table } => format!("DELETE FROM {}", quote_identifier(table)),
        }
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// 默认清洗规则
pub fn default_rules() -> Vec<SanitizeRule> {
    vec![
        SanitizeRule::clear_column("participant_session", "sent_to_server"),
        SanitizeRule::truncate("jobs"),
        SanitizeRule::truncate("flood_messages"),
        SanitizeRule::truncate("offsets"),
    ]
}

/// 清洗结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SanitizeReport {
    pub applied: usize,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DatabaseSanitizer {
    rules: Vec<SanitizeRule>,
}

impl Default for DatabaseSanitizer {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl DatabaseSanitizer {
    pub fn new(rules: Vec<SanitizeRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[SanitizeRule] {
        &self.rules
    }

    /// 在快照文件上执行清洗，从不返回错误
    pub fn sanitize(&self, snapshot: &Path) -> SanitizeReport {
        let mut report = SanitizeReport::default();

        let conn = match Connection::open_with_flags(
            snapshot,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        ) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("[Sanitize] 打开快照失败 {:?}: {}", snapshot, e);
                report.failed.push(format!("open: {}", e));
                return report;
            }
        };

        for rule in &self.rules {
            let sql = rule.sql();
            match conn.execute(&sql, []) {
                Ok(changed) => {
                    debug!("[Sanitize] {} -> {} 行", sql, changed);
                    report.applied += 1;
                }
                Err(e) => {
                    warn!("[Sanitize] 规则执行失败（已忽略）: {}: {}", sql, e);
                    report.failed.push(format!("{}: {}", sql, e));
                }
            }
        }

        report
    }
}
