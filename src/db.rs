// ==========================================
// 数据迁移导入引擎 - SQLite 连接初始化
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为
// - 统一 busy_timeout，减少并发批次写入时的偶发 busy 错误
// ==========================================

use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 默认数据库文件名
pub const DEFAULT_DB_FILE: &str = "migration_engine.db";

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：
/// - foreign_keys 需要“每个连接”单独开启
/// - WAL 模式下读写可并行（内存库会忽略该设置）
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    // journal_mode 会返回一行结果
    conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    Ok(conn)
}

/// 打开共享连接（仓储层共用同一个 Arc<Mutex<Connection>>）
pub fn open_shared_connection(db_path: &str) -> rusqlite::Result<Arc<Mutex<Connection>>> {
    Ok(Arc::new(Mutex::new(open_sqlite_connection(db_path)?)))
}

/// 默认数据库路径: <数据目录>/data-migration-engine/migration_engine.db
///
/// 数据目录不可用时退回当前目录
pub fn default_db_path() -> PathBuf {
    match dirs::data_local_dir() {
        Some(dir) => dir.join("data-migration-engine").join(DEFAULT_DB_FILE),
        None => PathBuf::from(DEFAULT_DB_FILE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_open_sqlite_connection_enables_foreign_keys() {
        let temp = NamedTempFile::new().unwrap();
        let conn = open_sqlite_connection(temp.path().to_str().unwrap()).unwrap();
        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_default_db_path_has_file_name() {
        let path = default_db_path();
        assert!(path.ends_with(DEFAULT_DB_FILE));
    }
}
