/// 测试数据库播种工具
/// 用于创建固定的聊天库与媒体目录，确保测试环境的可重复性
use rusqlite::Connection;
use std::fs;
use std::path::Path;

/// 创建 WAL 模式的聊天库并返回仍处于打开状态的连接
///
/// 固定数据：messages 3 行、participant_session 2 行（均已标记 sent_to_server）、
/// jobs 2 行、flood_messages 1 行、offsets 1 行。
pub fn seed_chat_database(path: &Path, user_version: u32) -> Connection {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let conn = Connection::open(path).unwrap();
    let mode: String = conn
        .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
        .unwrap();
    assert_eq!(mode.to_lowercase(), "wal");

    conn.execute_batch(&format!(
        "CREATE TABLE messages (id INTEGER PRIMARY KEY, body TEXT NOT NULL);
         CREATE TABLE participant_session (
             conversation_id TEXT NOT NULL,
             user_id TEXT NOT NULL,
             sent_to_server INTEGER
         );
         CREATE TABLE jobs (id INTEGER PRIMARY KEY, action TEXT NOT NULL);
         CREATE TABLE flood_messages (id INTEGER PRIMARY KEY, data BLOB);
         CREATE TABLE offsets (key TEXT PRIMARY KEY, timestamp TEXT NOT NULL);

         INSERT INTO messages (body) VALUES ('hello'), ('world'), ('again');
         INSERT INTO participant_session VALUES ('c1', 'u1', 1), ('c1', 'u2', 1);
         INSERT INTO jobs (action) VALUES ('SEND_ACK'), ('SEND_RECEIPT');
         INSERT INTO flood_messages (data) VALUES (x'00ff');
         INSERT INTO offsets VALUES ('messages_status', '2024-01-01T00:00:00Z');

         PRAGMA user_version = {};",
        user_version
    ))
    .unwrap();
    conn
}

/// 统计表行数
pub fn count_rows(path: &Path, table: &str) -> i64 {
    let conn = Connection::open(path).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |row| {
        row.get(0)
    })
    .unwrap()
}

/// 读取 schema 版本
pub fn schema_version(path: &Path) -> u32 {
    let conn = Connection::open(path).unwrap();
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap()
}

/// 创建固定的媒体目录结构：`a.jpg`、`sub/b.mp4`、`sub/deep/c.txt`
pub fn write_media_tree(root: &Path) {
    fs::create_dir_all(root.join("sub").join("deep")).unwrap();
    fs::write(root.join("a.jpg"), b"jpeg-a").unwrap();
    fs::write(root.join("sub").join("b.mp4"), b"video-b").unwrap();
    fs::write(root.join("sub").join("deep").join("c.txt"), b"text-c").unwrap();
}
