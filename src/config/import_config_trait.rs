// ==========================================
// 数据迁移导入引擎 - 导入配置读取 Trait
// ==========================================
// 职责: 定义流水线所需的配置读取接口（不包含实现）
// 红线: 不包含配置写入、不包含业务逻辑
// ==========================================

use crate::repository::error::RepositoryResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ==========================================
// ImportConfigReader Trait
// ==========================================
// 实现者: ConfigManager（从 config_kv 表读取）/ ImportSettings（固定值）
#[async_trait]
pub trait ImportConfigReader: Send + Sync {
    // ===== 执行配置 =====

    /// 每个执行/回滚事务的记录数
    ///
    /// # 默认值
    /// - 100
    async fn get_batch_size(&self) -> RepositoryResult<usize>;

    /// 并行批次 worker 数
    ///
    /// # 默认值
    /// - 4
    async fn get_worker_count(&self) -> RepositoryResult<usize>;

    /// 每个租户允许同时执行的作业数（超出排队）
    ///
    /// # 默认值
    /// - 2
    async fn get_tenant_job_concurrency(&self) -> RepositoryResult<usize>;

    /// RETRY_THEN_SKIP 单条记录最大尝试次数
    ///
    /// # 默认值
    /// - 3
    async fn get_retry_max_attempts(&self) -> RepositoryResult<u32>;

    /// 重试基础退避（毫秒，每次翻倍）
    ///
    /// # 默认值
    /// - 200
    async fn get_retry_backoff_ms(&self) -> RepositoryResult<u64>;

    /// 目标存储 / 文件存储 I/O 超时（毫秒）
    ///
    /// # 默认值
    /// - 30000
    async fn get_io_timeout_ms(&self) -> RepositoryResult<u64>;

    // ===== 回滚配置 =====

    /// 还原点保留天数
    ///
    /// # 默认值
    /// - 7
    async fn get_restore_retention_days(&self) -> RepositoryResult<i64>;

    // ===== 映射/分析配置 =====

    /// 自动接受阈值
    ///
    /// # 默认值
    /// - 0.85
    async fn get_mapping_auto_accept_threshold(&self) -> RepositoryResult<f64>;

    /// 建议确认阈值
    ///
    /// # 默认值
    /// - 0.60
    async fn get_mapping_propose_threshold(&self) -> RepositoryResult<f64>;

    /// 源系统识别 Jaccard 阈值
    ///
    /// # 默认值
    /// - 0.50
    async fn get_source_detect_threshold(&self) -> RepositoryResult<f64>;

    /// 每列保留的样本值数
    ///
    /// # 默认值
    /// - 5
    async fn get_profile_sample_size(&self) -> RepositoryResult<usize>;

    /// 一次读取全部配置
    async fn load_settings(&self) -> RepositoryResult<ImportSettings> {
        Ok(ImportSettings {
            batch_size: self.get_batch_size().await?,
            worker_count: self.get_worker_count().await?,
            tenant_job_concurrency: self.get_tenant_job_concurrency().await?,
            retry_max_attempts: self.get_retry_max_attempts().await?,
            retry_backoff_ms: self.get_retry_backoff_ms().await?,
            io_timeout_ms: self.get_io_timeout_ms().await?,
            restore_retention_days: self.get_restore_retention_days().await?,
            mapping_auto_accept_threshold: self.get_mapping_auto_accept_threshold().await?,
            mapping_propose_threshold: self.get_mapping_propose_threshold().await?,
            source_detect_threshold: self.get_source_detect_threshold().await?,
            profile_sample_size: self.get_profile_sample_size().await?,
        })
    }
}

// ==========================================
// ImportSettings - 配置快照
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSettings {
    pub batch_size: usize,
    pub worker_count: usize,
    pub tenant_job_concurrency: usize,
    pub retry_max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub io_timeout_ms: u64,
    pub restore_retention_days: i64,
    pub mapping_auto_accept_threshold: f64,
    pub mapping_propose_threshold: f64,
    pub source_detect_threshold: f64,
    pub profile_sample_size: usize,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            worker_count: 4,
            tenant_job_concurrency: 2,
            retry_max_attempts: 3,
            retry_backoff_ms: 200,
            io_timeout_ms: 30_000,
            restore_retention_days: 7,
            mapping_auto_accept_threshold: 0.85,
            mapping_propose_threshold: 0.60,
            source_detect_threshold: 0.50,
            profile_sample_size: 5,
        }
    }
}

// 固定值实现（测试 / 无数据库场景）
#[async_trait]
impl ImportConfigReader for ImportSettings {
    async fn get_batch_size(&self) -> RepositoryResult<usize> {
        Ok(self.batch_size)
    }

    async fn get_worker_count(&self) -> RepositoryResult<usize> {
        Ok(self.worker_count)
    }

    async fn get_tenant_job_concurrency(&self) -> RepositoryResult<usize> {
        Ok(self.tenant_job_concurrency)
    }

    async fn get_retry_max_attempts(&self) -> RepositoryResult<u32> {
        Ok(self.retry_max_attempts)
    }

    async fn get_retry_backoff_ms(&self) -> RepositoryResult<u64> {
        Ok(self.retry_backoff_ms)
    }

    async fn get_io_timeout_ms(&self) -> RepositoryResult<u64> {
        Ok(self.io_timeout_ms)
    }

    async fn get_restore_retention_days(&self) -> RepositoryResult<i64> {
        Ok(self.restore_retention_days)
    }

    async fn get_mapping_auto_accept_threshold(&self) -> RepositoryResult<f64> {
        Ok(self.mapping_auto_accept_threshold)
    }

    async fn get_mapping_propose_threshold(&self) -> RepositoryResult<f64> {
        Ok(self.mapping_propose_threshold)
    }

    async fn get_source_detect_threshold(&self) -> RepositoryResult<f64> {
        Ok(self.source_detect_threshold)
    }

    async fn get_profile_sample_size(&self) -> RepositoryResult<usize> {
        Ok(self.profile_sample_size)
    }

    async fn load_settings(&self) -> RepositoryResult<ImportSettings> {
        Ok(self.clone())
    }
}
