//! 备份/恢复会话
//!
//! `BackupSession` 是引擎唯一的对外入口，负责：
//! - 每次操作开始时按偏好重新选择存储后端
//! - 串行化备份与恢复（会话内单许可信号量，第二个调用等待第一个结束）
//! - 推进 `SessionPhase` 状态机并通过 watch 通道广播
//! - 把内部错误折叠为 `BackupOutcome`
//!
//! 所有阻塞步骤在 `spawn_blocking` 中执行。

use chrono::Utc;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use super::locator::{BackupLocator, BackupOrigin, LocatedBackup};
use super::media::MediaReplicator;
use super::sanitize::DatabaseSanitizer;
use super::snapshot::DatabaseSnapshotter;
use super::validator::BackupValidator;
use crate::backup_common::{
    ensure_space, remove_database_files, remove_file_if_exists, safe_lock, with_name_suffix,
    BACKUP_POSTFIX,
};
use crate::backup_config::{record_last_backup_time, EngineConfig, PreferenceStore, SqlitePreferenceStore};
use crate::error::{BackupError, Result};
use crate::live_store::{LiveStore, SqliteLiveStore};
use crate::models::{BackupInfo, BackupOutcome, OperationKind, SessionPhase};
use crate::storage::{
    direct_backend, select_backend, BackendKind, DocumentTreeProvider, NodeHandle, StorageBackend,
    StorageEntry, StorageRoot,
};

/// 恢复时写入在线库之前使用的临时后缀
const RESTORE_POSTFIX: &str = ".restoring";

/// 会话构建器
pub struct BackupSessionBuilder {
    config: EngineConfig,
    live_store: Option<Arc<dyn LiveStore>>,
    preferences: Option<Arc<dyn PreferenceStore>>,
    tree_provider: Option<Arc<dyn DocumentTreeProvider>>,
    sanitizer: DatabaseSanitizer,
}

impl BackupSessionBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            live_store: None,
            preferences: None,
            tree_provider: None,
            sanitizer: DatabaseSanitizer::default(),
        }
    }

    pub fn live_store(mut self, live_store: Arc<dyn LiveStore>) -> Self {
        self.live_store = Some(live_store);
        self
    }

    pub fn preferences(mut self, preferences: Arc<dyn PreferenceStore>) -> Self {
        self.preferences = Some(preferences);
        self
    }

    /// 宿主提供的授权目录树访问能力；不提供时只能使用直连路径
    pub fn tree_provider(mut self, provider: Arc<dyn DocumentTreeProvider>) -> Self {
        self.tree_provider = Some(provider);
        self
    }

    pub fn sanitizer(mut self, sanitizer: DatabaseSanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    /// 未指定的协作者使用默认实现：
    /// 在线存储为 `SqliteLiveStore`，偏好为 `<data_dir>/preferences.db`
    pub fn build(self) -> Result<BackupSession> {
        self.config.validate()?;

        let live_store = match self.live_store {
            Some(store) => store,
            None => Arc::new(SqliteLiveStore::from_config(&self.config)),
        };
        let preferences = match self.preferences {
            Some(prefs) => prefs,
            None => Arc::new(SqlitePreferenceStore::open(
                self.config.data_dir.join("preferences.db"),
            )?),
        };
        let validator = BackupValidator::from_config(&self.config);
        let locator = BackupLocator::new(&self.config, validator.clone())?;
        let (phase, _) = watch::channel(SessionPhase::Idle);

        Ok(BackupSession {
            inner: Arc::new(SessionInner {
                config: self.config,
                live_store,
                preferences,
                tree_provider: self.tree_provider,
                sanitizer: self.sanitizer,
                validator,
                locator,
                limiter: Arc::new(Semaphore::new(1)),
                in_progress: AtomicBool::new(false),
                phase,
                current_cancel: Mutex::new(None),
                #[cfg(test)]
                transitions: Mutex::new(Vec::new()),
            }),
        })
    }
}

/// 备份/恢复会话
#[derive(Clone)]
pub struct BackupSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: EngineConfig,
    live_store: Arc<dyn LiveStore>,
    preferences: Arc<dyn PreferenceStore>,
    tree_provider: Option<Arc<dyn DocumentTreeProvider>>,
    sanitizer: DatabaseSanitizer,
    validator: BackupValidator,
    locator: BackupLocator,
    limiter: Arc<Semaphore>,
    in_progress: AtomicBool,
    phase: watch::Sender<SessionPhase>,
    current_cancel: Mutex<Option<CancellationToken>>,
    #[cfg(test)]
    transitions: Mutex<Vec<SessionPhase>>,
}

/// 持有期间标记会话忙碌，析构时（包括 panic 展开）复位
struct ActiveGuard<'a> {
    inner: &'a SessionInner,
}

impl<'a> ActiveGuard<'a> {
    fn enter(inner: &'a SessionInner, cancel: CancellationToken) -> Self {
        inner.in_progress.store(true, Ordering::SeqCst);
        *safe_lock(&inner.current_cancel) = Some(cancel);
        Self { inner }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        *safe_lock(&self.inner.current_cancel) = None;
        self.inner.in_progress.store(false, Ordering::SeqCst);
    }
}

impl BackupSession {
    pub fn builder(config: EngineConfig) -> BackupSessionBuilder {
        BackupSessionBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// 备份在线数据库，`include_media` 为真时随后复制媒体目录
    pub async fn backup(&self, include_media: bool) -> BackupOutcome {
        self.run_exclusive("backup", BackupOutcome::Failure, move |inner, cancel| {
            inner.run_backup(include_media, cancel)
        })
        .await
    }

    /// 从第一个可恢复的备份恢复在线数据库
    pub async fn restore(&self, include_media: bool) -> BackupOutcome {
        self.run_exclusive("restore", BackupOutcome::Failure, move |inner, cancel| {
            inner.run_restore(include_media, cancel)
        })
        .await
    }

    /// 后台执行备份，结束后调用 `on_complete`
    pub fn spawn_backup<F>(&self, include_media: bool, on_complete: F) -> JoinHandle<()>
    where
        F: FnOnce(BackupOutcome) + Send + 'static,
    {
        let session = self.clone();
        tokio::spawn(async move {
            let outcome = session.backup(include_media).await;
            on_complete(outcome);
        })
    }

    /// 后台执行恢复，结束后调用 `on_complete`
    pub fn spawn_restore<F>(&self, include_media: bool, on_complete: F) -> JoinHandle<()>
    where
        F: FnOnce(BackupOutcome) + Send + 'static,
    {
        let session = self.clone();
        tokio::spawn(async move {
            let outcome = session.restore(include_media).await;
            on_complete(outcome);
        })
    }

    /// 查找可恢复的备份，不修改任何文件
    pub async fn find_backup(&self) -> Option<BackupInfo> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.locate_backup().map(|located| located.info))
            .await
            .unwrap_or_else(|e| {
                error!("[BackupSession] 查找备份任务异常终止: {}", e);
                None
            })
    }

    /// 当前备份位置的概况
    pub async fn backup_status(&self) -> Option<BackupInfo> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.status())
            .await
            .unwrap_or_else(|e| {
                error!("[BackupSession] 查询备份状态任务异常终止: {}", e);
                None
            })
    }

    /// 删除当前备份位置下的整个备份目录
    pub async fn delete_backup(&self) -> bool {
        self.run_exclusive("delete", false, |inner, _| inner.delete_backup())
            .await
    }

    /// 当前备份位置是否可读写
    pub async fn can_access_backup_directory(&self) -> bool {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || match inner.select_backend() {
            Ok(backend) => backend.check_access(),
            Err(e) => {
                debug!("[BackupSession] 备份位置不可用: {}", e);
                false
            }
        })
        .await
        .unwrap_or(false)
    }

    pub fn is_in_progress(&self) -> bool {
        self.inner.in_progress.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> SessionPhase {
        *self.inner.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.inner.phase.subscribe()
    }

    /// 请求取消当前操作的媒体复制；数据库步骤不受影响
    pub fn cancel(&self) -> bool {
        match safe_lock(&self.inner.current_cancel).as_ref() {
            Some(token) => {
                info!("[BackupSession] 收到取消请求");
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_exclusive<T, F>(&self, operation: &'static str, fallback: T, work: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&SessionInner, &CancellationToken) -> T + Send + 'static,
    {
        let permit = match self.inner.limiter.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!("[BackupSession] 获取会话锁失败: {}", e);
                return fallback;
            }
        };

        let inner = self.inner.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let cancel = CancellationToken::new();
            let _active = ActiveGuard::enter(&inner, cancel.clone());
            let span = info_span!("backup_session", operation, session_id = %Uuid::new_v4());
            let _entered = span.enter();
            work(&inner, &cancel)
        })
        .await;

        match joined {
            Ok(value) => value,
            Err(e) => {
                error!("[BackupSession] {} 任务异常终止: {}", operation, e);
                let current = *self.inner.phase.borrow();
                if !current.is_terminal() && current != SessionPhase::Idle {
                    self.inner
                        .phase
                        .send_replace(SessionPhase::Done(BackupOutcome::Failure));
                }
                fallback
            }
        }
    }
}

impl SessionInner {
    fn enter(&self, next: SessionPhase) {
        let current = *self.phase.borrow();
        if !current.can_transition_to(next) {
            warn!("[BackupSession] 非预期的阶段切换: {:?} -> {:?}", current, next);
        }
        debug!("[BackupSession] 阶段: {:?}", next);
        #[cfg(test)]
        safe_lock(&self.transitions).push(next);
        self.phase.send_replace(next);
    }

    /// 新操作开始时回到 Idle
    fn reset_phase(&self) {
        #[cfg(test)]
        safe_lock(&self.transitions).clear();
        self.phase.send_replace(SessionPhase::Idle);
    }

    fn finish(&self, operation: OperationKind, result: Result<()>) -> BackupOutcome {
        let outcome = match result {
            Ok(()) => BackupOutcome::Success,
            Err(e) => {
                let outcome = e.outcome_for(operation);
                match outcome {
                    BackupOutcome::Failure => error!("[BackupSession] {} 失败: {}", operation, e),
                    _ => warn!("[BackupSession] {} 未完成 ({}): {}", operation, outcome, e),
                }
                outcome
            }
        };
        self.enter(SessionPhase::Done(outcome));
        info!("[BackupSession] {} 结束: {}", operation, outcome);
        outcome
    }

    fn select_backend(&self) -> Result<Arc<dyn StorageBackend>> {
        select_backend(
            &self.config,
            self.preferences.as_ref(),
            self.tree_provider.as_ref(),
        )
    }

    fn create_staging_dir(&self) -> Result<TempDir> {
        fs::create_dir_all(&self.config.staging_dir)?;
        Ok(tempfile::Builder::new()
            .prefix("session-")
            .tempdir_in(&self.config.staging_dir)?)
    }

    // ------------------------------------------------------------------
    // 备份
    // ------------------------------------------------------------------

    fn run_backup(&self, include_media: bool, cancel: &CancellationToken) -> BackupOutcome {
        self.reset_phase();
        info!("[BackupSession] 开始备份 (media={})", include_media);
        let result = self.backup_database(include_media, cancel);
        self.finish(OperationKind::Backup, result)
    }

    fn backup_database(&self, include_media: bool, cancel: &CancellationToken) -> Result<()> {
        self.enter(SessionPhase::CheckingSpace);
        let db_name = &self.config.database_name;
        let live_db = self.live_store.database_path(db_name);
        if !live_db.is_file() {
            return Err(BackupError::NotFound(format!("在线数据库不存在: {:?}", live_db)));
        }
        let required = database_footprint(&live_db)?;

        let backend = self.select_backend()?;
        // 空间检查先于创建目录，空间不足时目标位置保持原样
        let available = backend.available_bytes()?;
        ensure_space(available, required)?;
        let root = backend
            .resolve_root(true)?
            .ok_or_else(|| BackupError::StorageUnavailable("无法创建备份目录".to_string()))?;
        debug!(
            "[BackupSession] 备份目录: {}, 需要 {} bytes, 可用 {} bytes",
            backend.display_path(root.handle()),
            required,
            available
        );

        self.enter(SessionPhase::Snapshotting);
        let tmp_name = format!("{}{}", db_name, BACKUP_POSTFIX);
        if let Some(stale) = backend.find_child(&root, &tmp_name)? {
            warn!("[BackupSession] 清理上次中断留下的 {}", tmp_name);
            backend.delete(&stale);
        }
        let (snapshot_path, staging) = match backend.local_path(&root) {
            Some(dir) => (dir.join(&tmp_name), None),
            None => {
                let staging = self.create_staging_dir()?;
                (staging.path().join(&tmp_name), Some(staging))
            }
        };
        let snapshot = DatabaseSnapshotter::new(self.live_store.clone())
            .with_busy_timeout(self.config.busy_timeout())
            .snapshot_to(&live_db, &snapshot_path)?;
        debug!("[BackupSession] 快照完成: {} bytes", snapshot.size);

        self.enter(SessionPhase::Sanitizing);
        let report = self.sanitizer.sanitize(&snapshot.path);
        if !report.failed.is_empty() {
            warn!(
                "[BackupSession] 清洗部分失败: applied={}, failed={:?}",
                report.applied, report.failed
            );
        }

        self.enter(SessionPhase::Promoting);
        if let Err(e) = self.validator.check(&snapshot.path) {
            DatabaseSnapshotter::discard(&snapshot.path);
            return Err(e);
        }
        let tmp_entry = match &staging {
            Some(_) => upload_snapshot(backend.as_ref(), &root, &snapshot.path, &tmp_name)?,
            None => backend.find_child(&root, &tmp_name)?.ok_or_else(|| {
                BackupError::NotFound(format!("快照文件丢失: {}", tmp_name))
            })?,
        };
        drop(staging);

        let promoted = match backend.promote(&tmp_entry, db_name) {
            Ok(entry) => entry,
            Err(e) => {
                backend.delete(&tmp_entry);
                return Err(e);
            }
        };
        info!(
            "[BackupSession] 备份已写入 {} ({} bytes)",
            backend.display_path(promoted.handle()),
            promoted.size
        );

        self.cleanup_after_promotion(backend.as_ref(), &root);
        record_last_backup_time(self.preferences.as_ref(), Utc::now());

        if include_media {
            self.backup_media(backend.as_ref(), &root, cancel);
        }
        Ok(())
    }

    fn cleanup_after_promotion(&self, backend: &dyn StorageBackend, root: &StorageRoot) {
        for legacy in &self.config.legacy_database_names {
            match backend.find_child(root, legacy) {
                Ok(Some(entry)) => {
                    if backend.delete(&entry) {
                        info!("[BackupSession] 已删除历史命名的备份 {}", legacy);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("[BackupSession] 查询历史命名备份 {} 失败: {}", legacy, e),
            }
        }

        if backend.kind() != BackendKind::DirectPath {
            return;
        }
        let Some(old_dir) = &self.config.old_backup_dir else {
            return;
        };
        if !old_dir.exists() || backend.local_path(root).as_deref() == Some(old_dir.as_path()) {
            return;
        }
        match fs::remove_dir_all(old_dir) {
            Ok(()) => info!("[BackupSession] 已删除旧格式备份目录 {:?}", old_dir),
            Err(e) => warn!("[BackupSession] 删除旧格式备份目录 {:?} 失败: {}", old_dir, e),
        }
    }

    fn backup_media(&self, backend: &dyn StorageBackend, root: &StorageRoot, cancel: &CancellationToken) {
        let Some(media_src) = self.live_store.media_path() else {
            debug!("[BackupSession] 未配置媒体目录，跳过媒体备份");
            return;
        };
        if !media_src.is_dir() {
            debug!("[BackupSession] 媒体目录不存在 {:?}，跳过", media_src);
            return;
        }

        self.enter(SessionPhase::ReplicatingMedia);
        let media_root = match backend.find_or_create_directory(root, &self.config.media_dir_name) {
            Ok(dir) => dir,
            Err(e) => {
                warn!("[BackupSession] 创建媒体备份目录失败，跳过媒体: {}", e);
                return;
            }
        };
        let report = MediaReplicator::with_cancellation(cancel.clone())
            .copy_to_backend(&media_src, backend, &media_root);
        if !report.is_complete() {
            warn!(
                "[BackupSession] 媒体备份未全部完成: failed={}, cancelled={}",
                report.failed.len(),
                report.cancelled
            );
        }
    }

    // ------------------------------------------------------------------
    // 恢复
    // ------------------------------------------------------------------

    fn run_restore(&self, include_media: bool, cancel: &CancellationToken) -> BackupOutcome {
        self.reset_phase();
        info!("[BackupSession] 开始恢复 (media={})", include_media);
        let result = self.restore_database(include_media, cancel);
        self.finish(OperationKind::Restore, result)
    }

    fn restore_database(&self, include_media: bool, cancel: &CancellationToken) -> Result<()> {
        self.enter(SessionPhase::Locating);
        let located = self
            .locate_backup()
            .ok_or_else(|| BackupError::NotFound("未找到可恢复的备份".to_string()))?;
        info!(
            "[BackupSession] 使用备份 {} ({} bytes)",
            located.info.display_path, located.info.size_bytes
        );

        self.enter(SessionPhase::Validating);
        let (candidate, _staging) = self.stage_candidate(&located)?;
        let version = self.validator.check(&candidate)?;
        debug!("[BackupSession] 备份 schema 版本 {}", version);

        self.enter(SessionPhase::CopyingDatabase);
        let live_db = self.live_store.database_path(&self.config.database_name);
        install_database(&candidate, &live_db)?;
        info!("[BackupSession] 数据库已恢复到 {:?}", live_db);
        record_last_backup_time(self.preferences.as_ref(), Utc::now());

        if include_media {
            self.restore_media(&located, cancel);
        }
        Ok(())
    }

    /// 得到可直接打开的本地候选文件；授权目录树中的备份先下载到暂存目录
    fn stage_candidate(&self, located: &LocatedBackup) -> Result<(PathBuf, Option<TempDir>)> {
        match &located.origin {
            BackupOrigin::OldFormat { path, .. } => Ok((path.clone(), None)),
            BackupOrigin::Backend { backend, entry, .. } => match entry.handle() {
                NodeHandle::Path(path) => Ok((path.clone(), None)),
                NodeHandle::Document(_) => {
                    let staging = self.create_staging_dir()?;
                    let local = staging.path().join(&entry.name);
                    download_entry(backend.as_ref(), entry, &local)?;
                    Ok((local, Some(staging)))
                }
            },
        }
    }

    fn restore_media(&self, located: &LocatedBackup, cancel: &CancellationToken) {
        let BackupOrigin::Backend { backend, root, .. } = &located.origin else {
            debug!("[BackupSession] 旧格式备份不含媒体");
            return;
        };
        let Some(media_dest) = self.live_store.media_path() else {
            debug!("[BackupSession] 未配置媒体目录，跳过媒体恢复");
            return;
        };
        let media_root = match backend.find_child(root, &self.config.media_dir_name) {
            Ok(Some(entry)) => match entry.as_directory() {
                Some(dir) => dir,
                None => {
                    warn!("[BackupSession] 备份中的 {} 不是目录", entry.name);
                    return;
                }
            },
            Ok(None) => {
                debug!("[BackupSession] 备份中没有媒体目录");
                return;
            }
            Err(e) => {
                warn!("[BackupSession] 读取媒体备份目录失败: {}", e);
                return;
            }
        };

        self.enter(SessionPhase::ReplicatingMedia);
        let report = MediaReplicator::with_cancellation(cancel.clone())
            .copy_from_backend(backend.as_ref(), &media_root, &media_dest);
        if !report.is_complete() {
            warn!(
                "[BackupSession] 媒体恢复未全部完成: failed={}, cancelled={}",
                report.failed.len(),
                report.cancelled
            );
        }
    }

    // ------------------------------------------------------------------
    // 查询与维护
    // ------------------------------------------------------------------

    /// 当前后端在前；当前后端不是直连时，再查直连旧位置
    fn candidate_backends(&self) -> Vec<Arc<dyn StorageBackend>> {
        let mut backends: Vec<Arc<dyn StorageBackend>> = Vec::new();
        let current = match self.select_backend() {
            Ok(backend) => Some(backend),
            Err(e) => {
                debug!("[BackupSession] 当前备份位置不可用: {}", e);
                None
            }
        };
        let current_is_direct = current
            .as_ref()
            .map_or(false, |backend| backend.kind() == BackendKind::DirectPath);
        backends.extend(current);
        if !current_is_direct {
            if let Ok(direct) = direct_backend(&self.config) {
                backends.push(Arc::new(direct));
            }
        }
        backends
    }

    fn locate_backup(&self) -> Option<LocatedBackup> {
        self.locator.locate(&self.candidate_backends())
    }

    fn status(&self) -> Option<BackupInfo> {
        let backend = match self.select_backend() {
            Ok(backend) => backend,
            Err(e) => {
                debug!("[BackupSession] 备份位置不可用: {}", e);
                return None;
            }
        };
        if backend.kind() == BackendKind::DirectPath {
            return self.locate_backup().map(|located| located.info);
        }

        let root = match backend.resolve_root(false) {
            Ok(root) => root,
            Err(e) => {
                warn!("[BackupSession] 授权目录不可访问: {}", e);
                return None;
            }
        };
        let (size_bytes, last_modified) = match &root {
            Some(dir) => {
                let size = backend.folder_size(dir).unwrap_or_else(|e| {
                    warn!("[BackupSession] 统计备份目录大小失败: {}", e);
                    0
                });
                (size, backend.last_modified(dir))
            }
            None => (0, None),
        };
        Some(BackupInfo {
            last_modified_at: last_modified.unwrap_or_else(Utc::now),
            size_bytes,
            display_path: backend.base_display_path(),
        })
    }

    fn delete_backup(&self) -> bool {
        let backend = match self.select_backend() {
            Ok(backend) => backend,
            Err(e) => {
                warn!("[BackupSession] 备份位置不可用，无法删除: {}", e);
                return false;
            }
        };
        match backend.delete_root() {
            Ok(deleted) => {
                info!("[BackupSession] 删除备份目录: {}", deleted);
                deleted
            }
            Err(e) => {
                warn!("[BackupSession] 删除备份目录失败: {}", e);
                false
            }
        }
    }
}

/// 在线库主文件与 WAL 的总大小，快照不会超过这个值
fn database_footprint(live_db: &Path) -> Result<u64> {
    let main = fs::metadata(live_db)?.len();
    let wal = fs::metadata(with_name_suffix(live_db, "-wal"))
        .map(|meta| meta.len())
        .unwrap_or(0);
    Ok(main + wal)
}

/// 把本地快照上传为后端中的临时条目
fn upload_snapshot(
    backend: &dyn StorageBackend,
    root: &StorageRoot,
    snapshot: &Path,
    tmp_name: &str,
) -> Result<StorageEntry> {
    let mut reader = File::open(snapshot)?;
    let (entry, mut writer) = backend.create_file(root, tmp_name)?;
    let copied = io::copy(&mut reader, &mut writer).and_then(|bytes| writer.flush().map(|_| bytes));
    drop(writer);
    match copied {
        Ok(bytes) => debug!("[BackupSession] 已上传快照 {} bytes", bytes),
        Err(e) => {
            backend.delete(&entry);
            return Err(e.into());
        }
    }
    backend
        .find_child(root, tmp_name)?
        .ok_or_else(|| BackupError::NotFound(format!("上传后的快照不存在: {}", tmp_name)))
}

fn download_entry(backend: &dyn StorageBackend, entry: &StorageEntry, dest: &Path) -> Result<()> {
    let mut reader = backend.open_for_read(entry)?;
    let mut file = File::create(dest)?;
    let result = io::copy(&mut reader, &mut file).and_then(|_| file.sync_all());
    if let Err(e) = result {
        drop(file);
        let _ = remove_file_if_exists(dest);
        return Err(e.into());
    }
    Ok(())
}

/// 用备份替换在线库：先写临时名，再删除旧库及附属文件，最后重命名
fn install_database(source: &Path, live_db: &Path) -> Result<()> {
    if let Some(parent) = live_db.parent() {
        fs::create_dir_all(parent)?;
    }
    let incoming = with_name_suffix(live_db, RESTORE_POSTFIX);
    remove_file_if_exists(&incoming)?;

    let result = (|| -> Result<()> {
        fs::copy(source, &incoming)?;
        File::open(&incoming)?.sync_all()?;
        remove_database_files(live_db)?;
        fs::rename(&incoming, live_db)?;
        Ok(())
    })();

    if result.is_err() {
        if let Err(e) = remove_file_if_exists(&incoming) {
            warn!("[BackupSession] 清理恢复临时文件失败 {:?}: {}", incoming, e);
        }
    }
    result
}
