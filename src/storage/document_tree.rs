//! 授权目录树接口
//!
//! 宿主通过 `DocumentTreeProvider` 暴露用户授权的目录树（`content://<authority>/tree/<id>`）。
//! 文档以"树 URI + 相对路径"标识，所有访问都可能因授权被撤销而失败。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use url::Url;

use crate::error::{BackupError, Result};

/// 授权目录树 URI
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeUri {
    url: Url,
    tree_id: String,
}

impl TreeUri {
    pub const SCHEME: &'static str = "content";

    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)
            .map_err(|e| BackupError::Configuration(format!("无效的目录树 URI {:?}: {}", raw, e)))?;
        if url.scheme() != Self::SCHEME {
            return Err(BackupError::Configuration(format!(
                "目录树 URI 必须使用 {}:// 协议: {}",
                Self::SCHEME,
                raw
            )));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(BackupError::Configuration(format!("目录树 URI 缺少 authority: {}", raw)));
        }

        let segments: Vec<&str> = url.path_segments().map(|s| s.collect()).unwrap_or_default();
        let encoded_id = match segments.as_slice() {
            ["tree", id] if !id.is_empty() => *id,
            _ => {
                return Err(BackupError::Configuration(format!(
                    "目录树 URI 路径必须为 /tree/<id>: {}",
                    raw
                )))
            }
        };
        let tree_id = urlencoding::decode(encoded_id)
            .map_err(|e| BackupError::Configuration(format!("目录树 id 解码失败: {}", e)))?
            .into_owned();

        Ok(Self { url, tree_id })
    }

    /// 由 authority 与树 id 构造
    pub fn new(authority: &str, tree_id: &str) -> Result<Self> {
        Self::parse(&format!(
            "{}://{}/tree/{}",
            Self::SCHEME,
            authority,
            urlencoding::encode(tree_id)
        ))
    }

    pub fn authority(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// 解码后的树 id
    pub fn tree_id(&self) -> &str {
        &self.tree_id
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl fmt::Display for TreeUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

impl FromStr for TreeUri {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// 树内文档引用，`document_id` 为以 `/` 分隔的相对路径，空串表示树根
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentRef {
    pub tree: TreeUri,
    pub document_id: String,
}

impl DocumentRef {
    pub fn root(tree: TreeUri) -> Self {
        Self {
            tree,
            document_id: String::new(),
        }
    }

    pub fn child(&self, name: &str) -> Self {
        let document_id = if self.document_id.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.document_id, name)
        };
        Self {
            tree: self.tree.clone(),
            document_id,
        }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.document_id.is_empty() {
            return None;
        }
        let parent_id = match self.document_id.rfind('/') {
            Some(idx) => self.document_id[..idx].to_string(),
            None => String::new(),
        };
        Some(Self {
            tree: self.tree.clone(),
            document_id: parent_id,
        })
    }

    /// 文档名（树根为空串）
    pub fn name(&self) -> &str {
        self.document_id
            .rsplit('/')
            .next()
            .unwrap_or(self.document_id.as_str())
    }

    pub fn is_root(&self) -> bool {
        self.document_id.is_empty()
    }
}

/// 文档元信息
#[derive(Debug, Clone)]
pub struct DocumentMeta {
    pub document: DocumentRef,
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// 授权状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantStatus {
    pub readable: bool,
    pub writable: bool,
}

impl GrantStatus {
    pub fn is_usable(&self) -> bool {
        self.readable && self.writable
    }
}

/// 宿主提供的授权目录树访问能力
pub trait DocumentTreeProvider: Send + Sync {
    /// 查询当前授权状态，授权不存在时返回全 false
    fn check_grant(&self, tree: &TreeUri) -> GrantStatus;

    /// 文档不存在时返回 `Ok(None)`
    fn stat(&self, document: &DocumentRef) -> Result<Option<DocumentMeta>>;

    fn list_children(&self, directory: &DocumentRef) -> Result<Vec<DocumentMeta>>;

    fn create_directory(&self, parent: &DocumentRef, name: &str) -> Result<DocumentRef>;

    /// 创建新的空文档，同名文档已存在时报错
    fn create_document(&self, parent: &DocumentRef, name: &str) -> Result<DocumentRef>;

    fn open_read(&self, document: &DocumentRef) -> Result<Box<dyn Read + Send>>;

    /// 以截断方式打开文档写入
    fn open_write(&self, document: &DocumentRef) -> Result<Box<dyn Write + Send>>;

    /// 删除文档（目录递归删除），不存在时返回 `Ok(false)`
    fn delete(&self, document: &DocumentRef) -> Result<bool>;

    /// 同目录内重命名
    fn rename(&self, document: &DocumentRef, new_name: &str) -> Result<DocumentRef>;

    fn available_bytes(&self, tree: &TreeUri) -> Result<u64>;

    /// 面向用户的展示路径
    fn display_path(&self, document: &DocumentRef) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_tree_uri_roundtrip_with_encoded_id() {
        let uri = TreeUri::new("com.example.documents", "primary:Documents/Chat Backups").unwrap();
        assert_eq!(uri.authority(), "com.example.documents");
        assert_eq!(uri.tree_id(), "primary:Documents/Chat Backups");

        let reparsed: TreeUri = uri.as_str().parse().unwrap();
        assert_eq!(reparsed, uri);
    }

    #[test]
    fn test_tree_uri_rejects_other_schemes_and_paths() {
        assert_matches!(
            TreeUri::parse("file:///tmp/backup"),
            Err(BackupError::Configuration(_))
        );
        assert_matches!(
            TreeUri::parse("content://authority/document/abc"),
            Err(BackupError::Configuration(_))
        );
        assert_matches!(TreeUri::parse("not a uri"), Err(BackupError::Configuration(_)));
    }

    #[test]
    fn test_document_ref_navigation() {
        let tree = TreeUri::new("auth", "root").unwrap();
        let root = DocumentRef::root(tree);
        assert!(root.is_root());
        assert_eq!(root.parent(), None);

        let db = root.child("Backup").child("chat.db");
        assert_eq!(db.document_id, "Backup/chat.db");
        assert_eq!(db.name(), "chat.db");
        assert_eq!(db.parent().unwrap().document_id, "Backup");
        assert!(db.parent().unwrap().parent().unwrap().is_root());
    }

    #[test]
    fn test_grant_status_requires_read_and_write() {
        assert!(GrantStatus { readable: true, writable: true }.is_usable());
        assert!(!GrantStatus { readable: true, writable: false }.is_usable());
        assert!(!GrantStatus::default().is_usable());
    }
}
