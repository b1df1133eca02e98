/// 故障注入目录树
/// 包装 LocalTreeProvider，可按文档名让写入/读取/重命名失败
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::backup_common::safe_lock;
use crate::error::{BackupError, Result};
use crate::storage::{
    DocumentMeta, DocumentRef, DocumentTreeProvider, GrantStatus, LocalTreeProvider, TreeUri,
};

/// 首次写入即失败的写入流
struct FailingWriter;

impl Write for FailingWriter {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "injected write failure"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FaultyTreeProvider {
    inner: LocalTreeProvider,
    failing_writes: Mutex<HashSet<String>>,
    failing_reads: Mutex<HashSet<String>>,
    fail_renames: AtomicBool,
}

impl FaultyTreeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            inner: LocalTreeProvider::new().with_quota(quota_bytes),
            ..Self::default()
        }
    }

    pub fn inner(&self) -> &LocalTreeProvider {
        &self.inner
    }

    pub fn fail_writes_of(&self, name: &str) {
        safe_lock(&self.failing_writes).insert(name.to_string());
    }

    pub fn fail_reads_of(&self, name: &str) {
        safe_lock(&self.failing_reads).insert(name.to_string());
    }

    pub fn fail_renames(&self, fail: bool) {
        self.fail_renames.store(fail, Ordering::SeqCst);
    }

    pub fn clear_faults(&self) {
        safe_lock(&self.failing_writes).clear();
        safe_lock(&self.failing_reads).clear();
        self.fail_renames.store(false, Ordering::SeqCst);
    }
}

impl DocumentTreeProvider for FaultyTreeProvider {
    fn check_grant(&self, tree: &TreeUri) -> GrantStatus {
        self.inner.check_grant(tree)
    }

    fn stat(&self, document: &DocumentRef) -> Result<Option<DocumentMeta>> {
        self.inner.stat(document)
    }

    fn list_children(&self, directory: &DocumentRef) -> Result<Vec<DocumentMeta>> {
        self.inner.list_children(directory)
    }

    fn create_directory(&self, parent: &DocumentRef, name: &str) -> Result<DocumentRef> {
        self.inner.create_directory(parent, name)
    }

    fn create_document(&self, parent: &DocumentRef, name: &str) -> Result<DocumentRef> {
        self.inner.create_document(parent, name)
    }

    fn open_read(&self, document: &DocumentRef) -> Result<Box<dyn Read + Send>> {
        if safe_lock(&self.failing_reads).contains(document.name()) {
            return Err(BackupError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "injected read failure",
            )));
        }
        self.inner.open_read(document)
    }

    fn open_write(&self, document: &DocumentRef) -> Result<Box<dyn Write + Send>> {
        if safe_lock(&self.failing_writes).contains(document.name()) {
            // 先真实打开（截断），模拟写到一半失败
            drop(self.inner.open_write(document)?);
            return Ok(Box::new(FailingWriter));
        }
        self.inner.open_write(document)
    }

    fn delete(&self, document: &DocumentRef) -> Result<bool> {
        self.inner.delete(document)
    }

    fn rename(&self, document: &DocumentRef, new_name: &str) -> Result<DocumentRef> {
        if self.fail_renames.load(Ordering::SeqCst) {
            return Err(BackupError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected rename failure",
            )));
        }
        self.inner.rename(document, new_name)
    }

    fn available_bytes(&self, tree: &TreeUri) -> Result<u64> {
        self.inner.available_bytes(tree)
    }

    fn display_path(&self, document: &DocumentRef) -> String {
        self.inner.display_path(document)
    }
}
