//! 单元测试共享工具

mod database_seed;
mod faulty_tree;

pub use database_seed::{count_rows, schema_version, seed_chat_database, write_media_tree};
pub use faulty_tree::FaultyTreeProvider;
