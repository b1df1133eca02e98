//! 备份配置模块
//!
//! 两类配置：
//! - `EngineConfig`: 部署期固定的路径与名称，来自环境变量 / `config/chat_vault.toml` / 默认值
//! - `PreferenceStore`: 运行期可变的用户偏好（外部备份目录授权 URI、上次备份时间）

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BackupError, Result};

/// 外部备份目录（授权目录树 URI）偏好键
pub const PREF_BACKUP_DIRECTORY: &str = "backup.directory_uri";

/// 上次备份/恢复时间偏好键（毫秒时间戳）
pub const PREF_BACKUP_LAST_TIME: &str = "backup.last_time";

/// 最低可恢复的 schema 版本
pub const MIN_SUPPORTED_VERSION: u32 = 15;

/// 当前 schema 版本
pub const CURRENT_VERSION: u32 = 52;

/// 备份引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 应用名，用于直连备份路径和旧格式文件名匹配
    pub app_name: String,
    /// 平台标识，旧格式备份文件名的第二段
    pub platform: String,
    /// 当前数据库文件名
    pub database_name: String,
    /// 历史数据库文件名，按优先级排列
    pub legacy_database_names: Vec<String>,
    /// 在线数据库所在目录
    pub data_dir: PathBuf,
    /// 在线媒体目录（None 表示不支持媒体备份）
    pub media_dir: Option<PathBuf>,
    /// 外部存储根目录，直连备份写入 `<external>/<app_name>/<backup_dir_name>`
    pub external_storage_dir: Option<PathBuf>,
    /// 旧格式备份目录（`<app>.<platform>.<version>` 文件）
    pub old_backup_dir: Option<PathBuf>,
    /// 授权目录树模式下的本地暂存目录
    pub staging_dir: PathBuf,
    pub backup_dir_name: String,
    pub media_dir_name: String,
    /// 阻止系统媒体扫描的标记文件
    pub marker_file_name: String,
    pub min_supported_version: u32,
    pub current_version: u32,
    /// 在线数据库忙等待超时（毫秒）
    pub busy_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let app_name = "ChatVault".to_string();
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chat-vault");
        let external_storage_dir = dirs::document_dir();
        let old_backup_dir = external_storage_dir
            .as_ref()
            .map(|dir| dir.join(&app_name).join("Legacy"));
        let staging_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("chat-vault")
            .join("staging");

        Self {
            app_name,
            platform: std::env::consts::OS.to_string(),
            database_name: "chat.db".to_string(),
            legacy_database_names: vec!["messenger.db".to_string()],
            media_dir: Some(data_dir.join("media")),
            data_dir,
            external_storage_dir,
            old_backup_dir,
            staging_dir,
            backup_dir_name: "Backup".to_string(),
            media_dir_name: "Media".to_string(),
            marker_file_name: ".nomedia".to_string(),
            min_supported_version: MIN_SUPPORTED_VERSION,
            current_version: CURRENT_VERSION,
            busy_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// 从 `.env`、环境变量（前缀 `CHAT_VAULT`，分隔符 `__`）与 `config/chat_vault.toml` 加载
    ///
    /// 未出现的字段回退到默认值。
    pub fn from_env_and_file() -> Result<Self> {
        dotenvy::dotenv().ok();
        let file = Path::new("config/chat_vault.toml");
        Self::load(None, file.exists().then_some(file))
    }

    /// `vars` 为 None 时读取进程环境
    fn load(vars: Option<config::Map<String, String>>, file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(
            config::Environment::with_prefix("CHAT_VAULT")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("legacy_database_names")
                .source(vars),
        );
        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file));
        }
        // 直接反序列化：纯数字的字符串字段由 config 转回 String
        let config = builder
            .build()
            .and_then(|loaded| loaded.try_deserialize::<EngineConfig>())
            .map_err(|e| BackupError::Configuration(format!("加载配置失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        validate_file_name(&self.database_name)?;
        for name in &self.legacy_database_names {
            validate_file_name(name)?;
            if name == &self.database_name {
                return Err(BackupError::Configuration(format!(
                    "历史数据库名不能与当前数据库名相同: {}",
                    name
                )));
            }
        }
        validate_file_name(&self.backup_dir_name)?;
        validate_file_name(&self.media_dir_name)?;
        validate_file_name(&self.marker_file_name)?;
        if self.min_supported_version > self.current_version {
            return Err(BackupError::Configuration(format!(
                "min_supported_version ({}) 大于 current_version ({})",
                self.min_supported_version, self.current_version
            )));
        }
        Ok(())
    }

    /// 直连模式的备份目录 `<external>/<app_name>/<backup_dir_name>`
    pub fn direct_backup_dir(&self) -> Option<PathBuf> {
        self.external_storage_dir
            .as_ref()
            .map(|dir| dir.join(&self.app_name).join(&self.backup_dir_name))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(BackupError::Configuration(format!("非法文件名: {:?}", name)));
    }
    Ok(())
}

// ============================================================================
// 用户偏好存储
// ============================================================================

/// 键值偏好存储
pub trait PreferenceStore: Send + Sync {
    fn get_string(&self, key: &str) -> Result<Option<String>>;
    fn put_string(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// 基于 SQLite `settings` 表的偏好存储
///
/// 每次调用打开短连接，不与在线数据库共享连接。
pub struct SqlitePreferenceStore {
    path: PathBuf,
}

impl SqlitePreferenceStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self { path };
        let conn = store.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }
}

impl PreferenceStore for SqlitePreferenceStore {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    fn put_string(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }
}

/// 内存偏好存储
#[derive(Default)]
pub struct MemoryPreferenceStore {
    values: DashMap<String, String>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    fn put_string(&self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }
}

/// 读取已配置的外部备份目录 URI（空白视为未配置）
pub fn backup_directory_uri(prefs: &dyn PreferenceStore) -> Result<Option<String>> {
    Ok(prefs
        .get_string(PREF_BACKUP_DIRECTORY)?
        .map(|uri| uri.trim().to_string())
        .filter(|uri| !uri.is_empty()))
}

/// 记录上次备份/恢复时间
pub fn record_last_backup_time(prefs: &dyn PreferenceStore, at: DateTime<Utc>) {
    if let Err(e) = prefs.put_string(PREF_BACKUP_LAST_TIME, &at.timestamp_millis().to_string()) {
        tracing::warn!("[BackupConfig] 写入上次备份时间失败: {}", e);
    }
}

/// 读取上次备份/恢复时间
pub fn last_backup_time(prefs: &dyn PreferenceStore) -> Option<DateTime<Utc>> {
    let raw = prefs.get_string(PREF_BACKUP_LAST_TIME).ok().flatten()?;
    let millis = raw.parse::<i64>().ok()?;
    DateTime::from_timestamp_millis(millis)
}
