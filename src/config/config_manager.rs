// ==========================================
// 数据迁移导入引擎 - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写管理
// 存储: config_kv 表 (key-value + scope)
// ==========================================

use crate::config::import_config_trait::{ImportConfigReader, ImportSettings};
use crate::repository::error::{RepositoryError, RepositoryResult};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> RepositoryResult<Self> {
        let conn = crate::db::open_shared_connection(db_path)?;
        Self::from_connection(conn)
    }

    /// 从已有连接创建 ConfigManager（确保 config_kv 表存在）
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> RepositoryResult<Self> {
        let manager = Self { conn };
        manager.ensure_table()?;
        Ok(manager)
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    fn ensure_table(&self) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS config_kv (
              scope_id TEXT NOT NULL,
              key TEXT NOT NULL,
              value TEXT NOT NULL,
              updated_at TEXT NOT NULL DEFAULT (datetime('now')),
              PRIMARY KEY (scope_id, key)
            );
            "#,
        )?;
        Ok(())
    }

    /// 从 config_kv 表读取配置值（scope_id='global'）
    ///
    /// # 返回
    /// - Some(String): 配置值
    /// - None: 配置不存在
    pub fn get_global_config_value(&self, key: &str) -> RepositoryResult<Option<String>> {
        let conn = self.get_conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// 写入 global 配置（UPSERT）
    pub fn set_global_config_value(&self, key: &str, value: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO config_kv (scope_id, key, value) VALUES ('global', ?1, ?2)
             ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, value],
        )?;
        Ok(())
    }

    /// 读取并解析配置值，缺失或格式错误时使用默认值
    fn get_parsed_or_default<T>(&self, key: &str, default: T) -> RepositoryResult<T>
    where
        T: FromStr + Copy + std::fmt::Display,
    {
        let raw = match self.get_global_config_value(key)? {
            Some(v) => v,
            None => return Ok(default),
        };
        match raw.trim().parse::<T>() {
            Ok(v) => Ok(v),
            Err(_) => {
                tracing::warn!(
                    config_key = key,
                    raw_value = %raw,
                    default = %default,
                    "配置值格式错误，使用默认值"
                );
                Ok(default)
            }
        }
    }

    /// 获取所有 global 配置的快照（JSON格式）
    ///
    /// # 用途
    /// - 作业报告中记录执行时生效的配置
    pub fn get_config_snapshot(&self) -> RepositoryResult<String> {
        let conn = self.get_conn()?;
        let mut stmt =
            conn.prepare("SELECT key, value FROM config_kv WHERE scope_id = 'global' ORDER BY key")?;

        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut config_map: BTreeMap<String, String> = BTreeMap::new();
        for row in rows {
            let (key, value) = row?;
            config_map.insert(key, value);
        }

        Ok(serde_json::to_string(&json!(config_map))?)
    }
}

// ==========================================
// ImportConfigReader 实现
// ==========================================
#[async_trait]
impl ImportConfigReader for ConfigManager {
    async fn get_batch_size(&self) -> RepositoryResult<usize> {
        let defaults = ImportSettings::default();
        let v = self.get_parsed_or_default(config_keys::IMPORT_BATCH_SIZE, defaults.batch_size)?;
        // 批次大小至少为 1
        Ok(v.max(1))
    }

    async fn get_worker_count(&self) -> RepositoryResult<usize> {
        let defaults = ImportSettings::default();
        let v = self.get_parsed_or_default(config_keys::IMPORT_WORKER_COUNT, defaults.worker_count)?;
        Ok(v.max(1))
    }

    async fn get_tenant_job_concurrency(&self) -> RepositoryResult<usize> {
        let defaults = ImportSettings::default();
        let v = self.get_parsed_or_default(
            config_keys::TENANT_JOB_CONCURRENCY,
            defaults.tenant_job_concurrency,
        )?;
        Ok(v.max(1))
    }

    async fn get_retry_max_attempts(&self) -> RepositoryResult<u32> {
        let defaults = ImportSettings::default();
        let v = self.get_parsed_or_default(
            config_keys::RETRY_MAX_ATTEMPTS,
            defaults.retry_max_attempts,
        )?;
        Ok(v.max(1))
    }

    async fn get_retry_backoff_ms(&self) -> RepositoryResult<u64> {
        let defaults = ImportSettings::default();
        self.get_parsed_or_default(config_keys::RETRY_BACKOFF_MS, defaults.retry_backoff_ms)
    }

    async fn get_io_timeout_ms(&self) -> RepositoryResult<u64> {
        let defaults = ImportSettings::default();
        let v = self.get_parsed_or_default(config_keys::IO_TIMEOUT_MS, defaults.io_timeout_ms)?;
        Ok(v.max(1))
    }

    async fn get_restore_retention_days(&self) -> RepositoryResult<i64> {
        let defaults = ImportSettings::default();
        self.get_parsed_or_default(
            config_keys::RESTORE_RETENTION_DAYS,
            defaults.restore_retention_days,
        )
    }

    async fn get_mapping_auto_accept_threshold(&self) -> RepositoryResult<f64> {
        let defaults = ImportSettings::default();
        self.get_parsed_or_default(
            config_keys::MAPPING_AUTO_ACCEPT_THRESHOLD,
            defaults.mapping_auto_accept_threshold,
        )
    }

    async fn get_mapping_propose_threshold(&self) -> RepositoryResult<f64> {
        let defaults = ImportSettings::default();
        self.get_parsed_or_default(
            config_keys::MAPPING_PROPOSE_THRESHOLD,
            defaults.mapping_propose_threshold,
        )
    }

    async fn get_source_detect_threshold(&self) -> RepositoryResult<f64> {
        let defaults = ImportSettings::default();
        self.get_parsed_or_default(
            config_keys::SOURCE_DETECT_THRESHOLD,
            defaults.source_detect_threshold,
        )
    }

    async fn get_profile_sample_size(&self) -> RepositoryResult<usize> {
        let defaults = ImportSettings::default();
        self.get_parsed_or_default(config_keys::PROFILE_SAMPLE_SIZE, defaults.profile_sample_size)
    }
}

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    // 执行
    pub const IMPORT_BATCH_SIZE: &str = "import_batch_size";
    pub const IMPORT_WORKER_COUNT: &str = "import_worker_count";
    pub const TENANT_JOB_CONCURRENCY: &str = "tenant_job_concurrency";
    pub const RETRY_MAX_ATTEMPTS: &str = "retry_max_attempts";
    pub const RETRY_BACKOFF_MS: &str = "retry_backoff_ms";
    pub const IO_TIMEOUT_MS: &str = "io_timeout_ms";

    // 回滚
    pub const RESTORE_RETENTION_DAYS: &str = "restore_retention_days";

    // 映射与分析
    pub const MAPPING_AUTO_ACCEPT_THRESHOLD: &str = "mapping_auto_accept_threshold";
    pub const MAPPING_PROPOSE_THRESHOLD: &str = "mapping_propose_threshold";
    pub const SOURCE_DETECT_THRESHOLD: &str = "source_detect_threshold";
    pub const PROFILE_SAMPLE_SIZE: &str = "profile_sample_size";
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn manager() -> (NamedTempFile, ConfigManager) {
        let temp = NamedTempFile::new().unwrap();
        let manager = ConfigManager::new(temp.path().to_str().unwrap()).unwrap();
        (temp, manager)
    }

    #[tokio::test]
    async fn test_defaults_when_table_empty() {
        let (_temp, manager) = manager();
        let settings = manager.load_settings().await.unwrap();
        assert_eq!(settings, ImportSettings::default());
    }

    #[tokio::test]
    async fn test_override_and_invalid_value() {
        let (_temp, manager) = manager();
        manager
            .set_global_config_value(config_keys::IMPORT_BATCH_SIZE, "250")
            .unwrap();
        manager
            .set_global_config_value(config_keys::RESTORE_RETENTION_DAYS, "abc")
            .unwrap();

        assert_eq!(manager.get_batch_size().await.unwrap(), 250);
        // 格式错误回退默认值
        assert_eq!(manager.get_restore_retention_days().await.unwrap(), 7);

        let snapshot = manager.get_config_snapshot().unwrap();
        assert!(snapshot.contains("import_batch_size"));
    }
}
