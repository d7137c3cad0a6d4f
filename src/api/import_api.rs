// ==========================================
// 数据迁移导入引擎 - 作业 API
// ==========================================
// 职责: 与传输层无关的作业接口，错误统一转换为 ApiError
// 说明: execute / resume / rollback 在后台任务中运行，返回可等待的句柄
// ==========================================

use crate::api::error::{ApiError, ApiResult};
use crate::config::ConfigManager;
use crate::db::open_shared_connection;
use crate::domain::job::{ExecuteOptions, ImportJob, ImportProgress, JobOptions, JobReport};
use crate::domain::mapping::{AnalysisResult, FieldMapping, MappingTemplate, ValueMap};
use crate::domain::record::{
    ModificationPolicy, PreviewRow, PreviewSelection, RollbackResult, RollbackScope,
};
use crate::domain::rule::TransformationRule;
use crate::domain::types::JobState;
use crate::domain::validation::{ValidationIssue, ValidationReport};
use crate::engine::{ExecutionOutcome, ImportOrchestrator, OptionalEventPublisher, OrchestratorDeps};
use crate::importer::error::ImportResult;
use crate::importer::field_mapper::HeuristicScorer;
use crate::importer::file_analyzer::SourceSystemRegistry;
use crate::importer::importer_trait::SystemClock;
use crate::repository::{
    BlobStore, ImportJobRepository, ImportedRecordRepository, MappingTemplateRepository,
    SqliteTargetStore, TargetSchemaProvider, ValidationIssueRepository,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// 后台任务句柄
pub struct TaskHandle<T> {
    job_id: String,
    handle: JoinHandle<ImportResult<T>>,
}

impl<T> TaskHandle<T> {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// 等待任务结束
    pub async fn wait(self) -> ApiResult<T> {
        match self.handle.await {
            Ok(result) => result.map_err(ApiError::from),
            Err(e) => Err(ApiError::InternalError(format!(
                "作业 {} 后台任务异常结束: {}",
                self.job_id, e
            ))),
        }
    }
}

pub type ExecutionHandle = TaskHandle<ExecutionOutcome>;
pub type RollbackHandle = TaskHandle<RollbackResult>;

/// 导入API
#[derive(Clone)]
pub struct ImportApi {
    orchestrator: Arc<ImportOrchestrator>,
}

impl ImportApi {
    pub fn new(orchestrator: Arc<ImportOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// 基于 SQLite 文件组装默认实现（目标存储与作业状态同库）
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    /// - schemas: 目标模式提供者
    /// - blobs: 上传文件存储
    pub async fn open(
        db_path: &str,
        schemas: Arc<dyn TargetSchemaProvider>,
        blobs: Arc<dyn BlobStore>,
        publisher: OptionalEventPublisher,
    ) -> ApiResult<Self> {
        let conn = open_shared_connection(db_path)
            .map_err(|e| ApiError::DatabaseConnectionError(format!("{}: {}", db_path, e)))?;
        let deps = OrchestratorDeps {
            jobs: Arc::new(ImportJobRepository::new(conn.clone())?),
            issues: Arc::new(ValidationIssueRepository::new(conn.clone())?),
            templates: Arc::new(MappingTemplateRepository::new(conn.clone())?),
            ledger: Arc::new(ImportedRecordRepository::new(conn.clone())?),
            store: Arc::new(SqliteTargetStore::new(conn.clone())?),
            blobs,
            schemas,
            config: Arc::new(ConfigManager::from_connection(conn)?),
            scorer: Arc::new(HeuristicScorer::new()),
            registry: Arc::new(SourceSystemRegistry::with_builtin()),
            clock: Arc::new(SystemClock),
            publisher,
            listeners: Vec::new(),
        };
        let orchestrator = ImportOrchestrator::new(deps).await?;
        info!(db_path, "导入 API 已就绪");
        Ok(Self::new(Arc::new(orchestrator)))
    }

    pub fn orchestrator(&self) -> &Arc<ImportOrchestrator> {
        &self.orchestrator
    }

    // ==========================================
    // 作业
    // ==========================================

    pub async fn create_job(
        &self,
        tenant_id: &str,
        source_system: &str,
        target_entity_type: &str,
        options: JobOptions,
    ) -> ApiResult<String> {
        Ok(self
            .orchestrator
            .create_job(tenant_id, source_system, target_entity_type, options)
            .await?)
    }

    pub fn get_job(&self, job_id: &str) -> ApiResult<ImportJob> {
        Ok(self.orchestrator.get_job(job_id)?)
    }

    pub fn list_jobs(&self, tenant_id: &str) -> ApiResult<Vec<ImportJob>> {
        Ok(self.orchestrator.list_jobs(tenant_id)?)
    }

    /// 提交文件（返回列画像、记录数与源系统识别结果）
    pub async fn submit_file(
        &self,
        job_id: &str,
        blob_key: &str,
        encoding_hint: Option<&str>,
    ) -> ApiResult<AnalysisResult> {
        Ok(self
            .orchestrator
            .submit_file(job_id, blob_key, encoding_hint)
            .await?)
    }

    // ==========================================
    // 映射
    // ==========================================

    pub async fn propose_mapping(&self, job_id: &str) -> ApiResult<FieldMapping> {
        Ok(self.orchestrator.propose_mapping(job_id).await?)
    }

    pub async fn confirm_mapping(&self, job_id: &str, mapping: FieldMapping) -> ApiResult<FieldMapping> {
        Ok(self.orchestrator.confirm_mapping(job_id, mapping).await?)
    }

    pub async fn propose_value_map(&self, job_id: &str, target_field: &str) -> ApiResult<ValueMap> {
        Ok(self.orchestrator.propose_value_map(job_id, target_field).await?)
    }

    pub async fn confirm_value_map(
        &self,
        job_id: &str,
        target_field: &str,
        map: ValueMap,
    ) -> ApiResult<ValueMap> {
        Ok(self
            .orchestrator
            .confirm_value_map(job_id, target_field, map)
            .await?)
    }

    pub async fn set_transformation_rule(
        &self,
        job_id: &str,
        target_field: &str,
        rule: TransformationRule,
    ) -> ApiResult<String> {
        Ok(self
            .orchestrator
            .set_transformation_rule(job_id, target_field, rule)
            .await?)
    }

    pub fn save_template(&self, job_id: &str, name: &str) -> ApiResult<MappingTemplate> {
        if name.trim().is_empty() {
            return Err(ApiError::InvalidInput("模板名称不能为空".to_string()));
        }
        Ok(self.orchestrator.save_template(job_id, name)?)
    }

    pub fn list_templates(&self, tenant_id: &str) -> ApiResult<Vec<MappingTemplate>> {
        Ok(self.orchestrator.list_templates(tenant_id)?)
    }

    // ==========================================
    // 校验 / 预览
    // ==========================================

    pub async fn validate(&self, job_id: &str) -> ApiResult<ValidationReport> {
        Ok(self.orchestrator.validate(job_id).await?)
    }

    pub fn list_issues(&self, job_id: &str) -> ApiResult<Vec<ValidationIssue>> {
        Ok(self.orchestrator.list_issues(job_id)?)
    }

    pub fn resolve_issue(&self, job_id: &str, issue_id: &str) -> ApiResult<()> {
        Ok(self.orchestrator.resolve_issue(job_id, issue_id)?)
    }

    pub async fn preview(&self, job_id: &str, selection: PreviewSelection) -> ApiResult<Vec<PreviewRow>> {
        if let PreviewSelection::Sample(0) = selection {
            return Err(ApiError::InvalidInput("预览行数必须大于 0".to_string()));
        }
        Ok(self.orchestrator.preview(job_id, selection).await?)
    }

    // ==========================================
    // 执行
    // ==========================================

    /// 执行（执行前检查同步完成，批次在后台运行）
    ///
    /// # 返回
    /// - Ok(ExecutionHandle): 通过 get_progress 轮询，wait 获取结果
    /// - Err(ValidationBlocked / JobBusy / InvalidStateTransition): 未启动任何批次
    pub async fn execute(&self, job_id: &str, options: ExecuteOptions) -> ApiResult<ExecutionHandle> {
        let prepared = self.orchestrator.prepare_execution(job_id, options).await?;
        let orchestrator = self.orchestrator.clone();
        Ok(TaskHandle {
            job_id: job_id.to_string(),
            handle: tokio::spawn(async move { orchestrator.run_execution(prepared).await }),
        })
    }

    pub fn pause(&self, job_id: &str) -> ApiResult<()> {
        Ok(self.orchestrator.pause(job_id)?)
    }

    pub async fn resume(&self, job_id: &str) -> ApiResult<ExecutionHandle> {
        let prepared = self.orchestrator.prepare_resume(job_id).await?;
        let orchestrator = self.orchestrator.clone();
        Ok(TaskHandle {
            job_id: job_id.to_string(),
            handle: tokio::spawn(async move { orchestrator.run_execution(prepared).await }),
        })
    }

    /// 取消（导入中时返回 IMPORTING，批次边界后转为 CANCELLED）
    pub fn cancel(&self, job_id: &str) -> ApiResult<JobState> {
        Ok(self.orchestrator.cancel(job_id)?)
    }

    pub fn get_progress(&self, job_id: &str) -> ApiResult<ImportProgress> {
        Ok(self.orchestrator.get_progress(job_id)?)
    }

    // ==========================================
    // 回滚 / 报告
    // ==========================================

    /// 回滚（scope 缺省为全部）
    pub fn rollback(
        &self,
        job_id: &str,
        scope: Option<RollbackScope>,
        policy: ModificationPolicy,
    ) -> ApiResult<RollbackHandle> {
        let scope = scope.unwrap_or_default();
        if let RollbackScope::RowRange { start, end } = &scope {
            if start > end {
                return Err(ApiError::InvalidInput(format!(
                    "行号区间无效: {} > {}",
                    start, end
                )));
            }
        }
        let orchestrator = self.orchestrator.clone();
        let owned_job_id = job_id.to_string();
        Ok(TaskHandle {
            job_id: job_id.to_string(),
            handle: tokio::spawn(async move {
                orchestrator.rollback(&owned_job_id, scope, policy).await
            }),
        })
    }

    pub fn get_report(&self, job_id: &str) -> ApiResult<JobReport> {
        Ok(self.orchestrator.get_report(job_id)?)
    }

    pub fn expire_restore_points(&self) -> ApiResult<usize> {
        Ok(self.orchestrator.expire_restore_points()?)
    }
}
