//! 数据库快照
//!
//! 先请求在线库做 WAL 检查点，再用 SQLite Backup API 复制出一份一致的单文件快照。
//! 快照统一切换为 DELETE 日志模式，不依赖任何 `-wal`/`-shm` 附属文件。

use rusqlite::backup::{Backup, StepResult};
use rusqlite::{Connection, OpenFlags};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backup_common::remove_database_files;
use crate::error::{BackupError, Result};
use crate::live_store::LiveStore;

/// Backup API 每步复制的页数
const PAGES_PER_STEP: i32 = 256;

/// 源库忙时的重试间隔
const STEP_PAUSE: Duration = Duration::from_millis(50);

/// 生成完成的快照文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub path: PathBuf,
    pub size: u64,
}

pub struct DatabaseSnapshotter {
    live_store: Arc<dyn LiveStore>,
    busy_timeout: Duration,
}

impl DatabaseSnapshotter {
    pub fn new(live_store: Arc<dyn LiveStore>) -> Self {
        Self {
            live_store,
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    /// 将 `source` 的一致快照写入 `dest`
    ///
    /// `dest` 上的残留文件会先被清理；任何步骤失败都会删除半成品。
    pub fn snapshot_to(&self, source: &Path, dest: &Path) -> Result<Snapshot> {
        if !source.is_file() {
            return Err(BackupError::NotFound(format!("在线数据库不存在: {:?}", source)));
        }
        if dest.exists() {
            debug!("[Snapshot] 清理上次残留的半成品 {:?}", dest);
        }
        remove_database_files(dest)?;

        match self.copy_consistent(source, dest) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                Self::discard(dest);
                Err(e)
            }
        }
    }

    /// 删除快照及其附属文件，失败仅记录日志
    pub fn discard(dest: &Path) {
        if let Err(e) = remove_database_files(dest) {
            warn!("[Snapshot] 删除半成品 {:?} 失败: {}", dest, e);
        }
    }

    fn copy_consistent(&self, source: &Path, dest: &Path) -> Result<Snapshot> {
        // 1. 检查点，把 WAL 中已提交的数据合并进主文件
        self.live_store.checkpoint(source)?;

        // 2. 打开源库（不带 CREATE）
        let src_conn = Connection::open_with_flags(
            source,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        src_conn.busy_timeout(self.busy_timeout)?;

        let mut dest_conn = Connection::open(dest)?;

        // 3. Backup API 分批复制；复制期间源页面被修改时会自动重拷
        {
            let backup = Backup::new(&src_conn, &mut dest_conn)?;
            loop {
                let step_result = backup.step(PAGES_PER_STEP)?;
                let progress = backup.progress();
                debug!(
                    "[Snapshot] 已复制 {}/{} 页",
                    progress.pagecount - progress.remaining,
                    progress.pagecount
                );
                match step_result {
                    StepResult::Done => break,
                    StepResult::More => {}
                    _ => std::thread::sleep(STEP_PAUSE),
                }
            }
        }

        // 4. 快照改为独立的单文件格式
        let journal_mode: String =
            dest_conn.query_row("PRAGMA journal_mode=DELETE", [], |row| row.get(0))?;
        if !journal_mode.eq_ignore_ascii_case("delete") {
            return Err(BackupError::Database(format!(
                "快照日志模式切换失败: {}",
                journal_mode
            )));
        }

        drop(dest_conn);
        drop(src_conn);

        let size = fs::metadata(dest)?.len();
        debug!("[Snapshot] 快照完成: {:?}, size={}", dest, size);
        Ok(Snapshot {
            path: dest.to_path_buf(),
            size,
        })
    }
}
