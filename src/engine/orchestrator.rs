// ==========================================
// 数据迁移导入引擎 - 作业编排器
// ==========================================
// 用途: 协调 分析 → 映射 → 校验 → 执行 → 回滚 各阶段
// 红线: 作业状态只经由状态机修改；执行与回滚互斥
// ==========================================

use crate::config::{ImportConfigReader, ImportSettings};
use crate::domain::job::{
    ErrorDigestEntry, ExecuteOptions, ImportJob, ImportProgress, JobCounts, JobOptions, JobReport,
};
use crate::domain::mapping::{AnalysisResult, FieldMapping, MappingStatus, MappingTemplate, ValueMap};
use crate::domain::record::{
    DryRunRecord, ImportErrorLog, ModificationPolicy, PreviewRow, PreviewSelection,
    RollbackResult, RollbackScope,
};
use crate::domain::rule::TransformationRule;
use crate::domain::schema::TargetSchema;
use crate::domain::types::{ErrorHandlingMode, JobState, RestorePointStatus};
use crate::domain::validation::ValidationReport;
use crate::engine::events::{JobEvent, JobEventType, OptionalEventPublisher};
use crate::engine::job_state::{is_allowed, JobStateMachine, JobTransitionListener};
use crate::engine::scheduler::{JobRuntime, JobScheduler};
use crate::importer::conflict_handler::ConflictHandler;
use crate::importer::dq_validator::{DqValidator, ReferenceCache};
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::executor::{
    ExecutionRequest, ExecutionStop, ExecutorSettings, ImportExecutor,
};
use crate::importer::field_mapper::FieldMapper;
use crate::importer::file_analyzer::{FileAnalyzer, SourceSystemRegistry};
use crate::importer::file_parser::UniversalFileParser;
use crate::importer::importer_trait::{Clock, MappingScorer, ParsedFile};
use crate::importer::rollback::RollbackManager;
use crate::importer::transformer::RecordTransformer;
use crate::importer::value_mapper::ValueMapper;
use crate::repository::error::RepositoryResult;
use crate::repository::{
    BlobStore, ImportJobRepository, ImportedRecordRepository, MappingTemplateRepository,
    StoredRule, TargetRecordStore, TargetSchemaProvider, ValidationIssueRepository,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// 值映射建议时收集的去重源值上限
const MAX_DISTINCT_VALUES: usize = 10_000;

/// 未指定源系统时由文件分析结果决定
const AUTO_SOURCE_SYSTEM: &str = "auto";

// ==========================================
// 编排器依赖
// ==========================================
pub struct OrchestratorDeps {
    pub jobs: Arc<ImportJobRepository>,
    pub issues: Arc<ValidationIssueRepository>,
    pub templates: Arc<MappingTemplateRepository>,
    pub ledger: Arc<ImportedRecordRepository>,
    pub store: Arc<dyn TargetRecordStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub schemas: Arc<dyn TargetSchemaProvider>,
    pub config: Arc<dyn ImportConfigReader>,
    pub scorer: Arc<dyn MappingScorer>,
    pub registry: Arc<SourceSystemRegistry>,
    pub clock: Arc<dyn Clock>,
    pub publisher: OptionalEventPublisher,
    pub listeners: Vec<Arc<dyn JobTransitionListener>>,
}

/// 已通过执行前检查、持有作业锁的执行
pub struct PreparedExecution {
    job: ImportJob,
    schema: TargetSchema,
    dry_run: bool,
    resume: bool,
    error_handling: ErrorHandlingMode,
    total_rows: usize,
    runtime: Arc<JobRuntime>,
    _guard: OwnedMutexGuard<()>,
}

impl PreparedExecution {
    pub fn job_id(&self) -> &str {
        &self.job.job_id
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

/// 一次执行的结果
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub job_id: String,
    pub dry_run: bool,
    pub state: JobState,
    pub counts: JobCounts,
    pub failures: Vec<ImportErrorLog>,
    pub dry_run_records: Vec<DryRunRecord>,
    pub failure_reason: Option<String>,
    pub rollback_available: bool,
}

// ==========================================
// ImportOrchestrator - 作业编排器
// ==========================================
pub struct ImportOrchestrator {
    jobs: Arc<ImportJobRepository>,
    issues: Arc<ValidationIssueRepository>,
    templates: Arc<MappingTemplateRepository>,
    ledger: Arc<ImportedRecordRepository>,
    store: Arc<dyn TargetRecordStore>,
    blobs: Arc<dyn BlobStore>,
    schemas: Arc<dyn TargetSchemaProvider>,
    scorer: Arc<dyn MappingScorer>,
    registry: Arc<SourceSystemRegistry>,
    clock: Arc<dyn Clock>,
    machine: JobStateMachine,
    scheduler: JobScheduler,
    settings: ImportSettings,
}

impl ImportOrchestrator {
    /// 创建编排器（加载一次全局配置）
    pub async fn new(deps: OrchestratorDeps) -> ImportResult<Self> {
        let settings = deps.config.load_settings().await?;
        let mut machine = JobStateMachine::new(deps.jobs.clone(), deps.publisher);
        for listener in deps.listeners {
            machine.add_listener(listener);
        }
        info!(
            batch_size = settings.batch_size,
            workers = settings.worker_count,
            tenant_concurrency = settings.tenant_job_concurrency,
            "导入编排器初始化"
        );
        Ok(Self {
            jobs: deps.jobs,
            issues: deps.issues,
            templates: deps.templates,
            ledger: deps.ledger,
            store: deps.store,
            blobs: deps.blobs,
            schemas: deps.schemas,
            scorer: deps.scorer,
            registry: deps.registry,
            clock: deps.clock,
            scheduler: JobScheduler::new(settings.tenant_job_concurrency),
            machine,
            settings,
        })
    }

    pub fn settings(&self) -> &ImportSettings {
        &self.settings
    }

    pub fn registry(&self) -> &SourceSystemRegistry {
        &self.registry
    }

    // ==========================================
    // 作业
    // ==========================================

    /// 创建作业
    ///
    /// # 返回
    /// - Err(UnknownEntityType): 目标实体类型未注册
    pub async fn create_job(
        &self,
        tenant_id: &str,
        source_system: &str,
        target_entity_type: &str,
        options: JobOptions,
    ) -> ImportResult<String> {
        if tenant_id.trim().is_empty() {
            return Err(ImportError::InvalidArgument("tenant_id 不能为空".to_string()));
        }
        if options.batch_size == Some(0) {
            return Err(ImportError::InvalidArgument("batch_size 必须大于 0".to_string()));
        }
        self.load_schema(target_entity_type).await?;

        let job = ImportJob::new(
            Uuid::new_v4().to_string(),
            tenant_id,
            source_system,
            target_entity_type,
            options,
            self.clock.now(),
        );
        self.jobs.insert(&job)?;
        info!(
            job_id = %job.job_id,
            tenant_id,
            source_system,
            target_entity_type,
            "导入作业已创建"
        );
        Ok(job.job_id)
    }

    pub fn get_job(&self, job_id: &str) -> ImportResult<ImportJob> {
        self.load_job(job_id)
    }

    pub fn list_jobs(&self, tenant_id: &str) -> ImportResult<Vec<ImportJob>> {
        Ok(self.jobs.list_by_tenant(tenant_id)?)
    }

    // ==========================================
    // 阶段 1: 文件分析
    // ==========================================

    /// 提交文件并分析
    ///
    /// # 参数
    /// - blob_key: 上传文件在 blob 存储中的 key（扩展名用于格式判断）
    /// - encoding_hint: 调用方声明的编码
    ///
    /// # 返回
    /// - Ok(AnalysisResult): 成功后作业进入 MAPPING
    /// - Err(UnsupportedFormat / EmptyInput / Timeout): 作业回到 CREATED
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn submit_file(
        &self,
        job_id: &str,
        blob_key: &str,
        encoding_hint: Option<&str>,
    ) -> ImportResult<AnalysisResult> {
        let mut job = self.load_job(job_id)?;
        self.machine
            .transition(&mut job, JobState::Analyzing, None, self.clock.now())?;

        job.blob_key = Some(blob_key.to_string());
        job.encoding_hint = encoding_hint.map(str::to_string);

        match self.analyze(&job).await {
            Ok(analysis) => {
                if job.source_system.trim().is_empty()
                    || job.source_system.eq_ignore_ascii_case(AUTO_SOURCE_SYSTEM)
                {
                    job.source_system = analysis.source_system.system.clone();
                }
                job.counts = JobCounts {
                    source: analysis.record_count + analysis.parse_error_count,
                    ..JobCounts::default()
                };
                job.analysis = Some(analysis.clone());
                job.updated_at = self.clock.now();
                self.jobs.update(&job)?;
                self.machine
                    .transition(&mut job, JobState::Mapping, None, self.clock.now())?;
                Ok(analysis)
            }
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "文件分析失败，作业回到 CREATED");
                job.analysis = None;
                job.updated_at = self.clock.now();
                self.jobs.update(&job)?;
                self.machine
                    .transition(&mut job, JobState::Created, Some(&e.to_string()), self.clock.now())?;
                Err(e)
            }
        }
    }

    async fn analyze(&self, job: &ImportJob) -> ImportResult<AnalysisResult> {
        let (name, bytes) = self.fetch_blob(job).await?;
        let analyzer = FileAnalyzer::new(
            self.settings.profile_sample_size,
            self.settings.source_detect_threshold,
        );
        analyzer.analyze(&name, bytes, job.encoding_hint.as_deref(), &self.registry)
    }

    // ==========================================
    // 阶段 2: 字段映射 / 值映射 / 规则 / 模板
    // ==========================================

    /// 生成字段映射建议（已确认的列保持不变）
    pub async fn propose_mapping(&self, job_id: &str) -> ImportResult<FieldMapping> {
        let mut job = self.load_job(job_id)?;
        self.ensure_editable(&mut job)?;
        let schema = self.load_schema(&job.target_entity_type).await?;
        let analysis = job.analysis.clone().ok_or_else(|| {
            ImportError::InvalidArgument(format!("作业 {} 尚未完成文件分析", job.job_id))
        })?;

        let template = self.resolve_template(&job)?;
        let existing = self.jobs.find_mapping(&job.job_id)?;
        let mapper = FieldMapper::new(
            self.scorer.clone(),
            self.settings.mapping_auto_accept_threshold,
            self.settings.mapping_propose_threshold,
        );
        let mapping = mapper.propose(&analysis.profiles, &schema, template.as_ref(), existing.as_ref());

        let now = self.clock.now();
        if let Some(template) = &template {
            // 模板值映射复制到作业（已确认的值映射不覆盖）
            for map in &template.value_maps {
                if !self.jobs.is_value_map_confirmed(&job.job_id, &map.target_field)? {
                    self.jobs.save_value_map(&job.job_id, map, false, now)?;
                }
            }
            job.template = Some(template.reference());
            job.updated_at = now;
            self.jobs.update(&job)?;
        }
        self.jobs.save_mapping(&job.job_id, &mapping, now)?;

        info!(
            job_id = %job.job_id,
            columns = mapping.columns.len(),
            mapped = mapping.columns.iter().filter(|c| c.effective_target().is_some()).count(),
            template = template.as_ref().map(|t| t.template_id.as_str()).unwrap_or("-"),
            "字段映射建议已生成"
        );
        Ok(mapping)
    }

    /// 确认字段映射（指定了目标字段的列全部标记为 Confirmed）
    ///
    /// # 返回
    /// - Err(InvalidArgument): 目标字段不存在 / 被多列占用 / 引用了未登记的规则
    pub async fn confirm_mapping(&self, job_id: &str, mapping: FieldMapping) -> ImportResult<FieldMapping> {
        let mut job = self.load_job(job_id)?;
        self.ensure_editable(&mut job)?;
        let schema = self.load_schema(&job.target_entity_type).await?;

        let mut mapping = mapping;
        for column in &mut mapping.columns {
            if column.target_field.is_some() {
                column.status = MappingStatus::Confirmed;
            } else {
                column.status = MappingStatus::Unmapped;
            }
        }
        FieldMapper::check_consistency(&mapping, &schema)?;

        let rule_ids: HashSet<String> = self
            .jobs
            .list_rules(&job.job_id)?
            .into_iter()
            .map(|r| r.rule_id)
            .collect();
        if let Some(unknown) = mapping
            .columns
            .iter()
            .filter_map(|c| c.rule_id.as_deref())
            .find(|id| !rule_ids.contains(*id))
        {
            return Err(ImportError::InvalidArgument(format!("转换规则 {} 未登记", unknown)));
        }

        self.jobs.save_mapping(&job.job_id, &mapping, self.clock.now())?;
        info!(job_id = %job.job_id, columns = mapping.columns.len(), "字段映射已确认");
        Ok(mapping)
    }

    /// 生成值映射建议（已确认的值映射原样返回）
    pub async fn propose_value_map(&self, job_id: &str, target_field: &str) -> ImportResult<ValueMap> {
        let mut job = self.load_job(job_id)?;
        self.ensure_editable(&mut job)?;
        let schema = self.load_schema(&job.target_entity_type).await?;
        let field = schema.field(target_field).cloned().ok_or_else(|| {
            ImportError::InvalidArgument(format!("目标字段 {} 不存在", target_field))
        })?;
        if field.enum_values.is_empty() && field.examples.is_empty() {
            return Err(ImportError::InvalidArgument(format!(
                "目标字段 {} 没有可映射的取值域",
                target_field
            )));
        }

        if self.jobs.is_value_map_confirmed(&job.job_id, target_field)? {
            if let Some(existing) = self
                .jobs
                .list_value_maps(&job.job_id)?
                .into_iter()
                .find(|m| m.target_field == target_field)
            {
                return Ok(existing);
            }
        }

        let mapping = self.jobs.find_mapping(&job.job_id)?.unwrap_or_default();
        let column = mapping
            .for_target(target_field)
            .and_then(|c| c.effective_target().map(|_| c.source_column.clone()))
            .ok_or_else(|| {
                ImportError::InvalidArgument(format!("目标字段 {} 尚未映射源列", target_field))
            })?;

        // 流式收集去重源值
        let parsed = self.open_file(&job).await?;
        let mut distinct: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for row in parsed.rows.flatten() {
            if let Some(value) = row.get(&column) {
                let value = value.trim();
                if !value.is_empty() && seen.insert(value.to_string()) {
                    distinct.push(value.to_string());
                    if distinct.len() >= MAX_DISTINCT_VALUES {
                        warn!(job_id = %job.job_id, column = %column, "去重源值达到上限，截断");
                        break;
                    }
                }
            }
        }

        let template_map = self
            .resolve_template(&job)?
            .and_then(|t| t.value_maps.into_iter().find(|m| m.target_field == target_field));
        let mapper = ValueMapper::new(self.scorer.clone(), self.settings.mapping_propose_threshold);
        let map = mapper.propose(&field, &distinct, template_map.as_ref());
        self.jobs.save_value_map(&job.job_id, &map, false, self.clock.now())?;

        info!(
            job_id = %job.job_id,
            field = target_field,
            source_values = distinct.len(),
            entries = map.entries.len(),
            "值映射建议已生成"
        );
        Ok(map)
    }

    /// 确认值映射
    pub async fn confirm_value_map(
        &self,
        job_id: &str,
        target_field: &str,
        map: ValueMap,
    ) -> ImportResult<ValueMap> {
        let mut job = self.load_job(job_id)?;
        self.ensure_editable(&mut job)?;
        let schema = self.load_schema(&job.target_entity_type).await?;
        if schema.field(target_field).is_none() {
            return Err(ImportError::InvalidArgument(format!("目标字段 {} 不存在", target_field)));
        }
        let mut map = map;
        map.target_field = target_field.to_string();
        self.jobs.save_value_map(&job.job_id, &map, true, self.clock.now())?;
        info!(job_id = %job.job_id, field = target_field, entries = map.entries.len(), "值映射已确认");
        Ok(map)
    }

    /// 登记转换规则
    ///
    /// # 返回
    /// - Ok(rule_id): 映射到该字段的列同时引用此规则
    /// - Err(InvalidArgument): 字段不存在或规则正则无效
    pub async fn set_transformation_rule(
        &self,
        job_id: &str,
        target_field: &str,
        rule: TransformationRule,
    ) -> ImportResult<String> {
        let mut job = self.load_job(job_id)?;
        self.ensure_editable(&mut job)?;
        let schema = self.load_schema(&job.target_entity_type).await?;
        if schema.field(target_field).is_none() {
            return Err(ImportError::InvalidArgument(format!("目标字段 {} 不存在", target_field)));
        }

        let stored = StoredRule {
            rule_id: Uuid::new_v4().to_string(),
            job_id: job.job_id.clone(),
            target_field: target_field.to_string(),
            rule,
        };
        // 预编译一次，拒绝无效正则
        RecordTransformer::new(
            schema,
            FieldMapping::default(),
            Vec::new(),
            vec![stored.clone()],
            self.clock.clone(),
        )?;

        let now = self.clock.now();
        self.jobs.insert_rule(&stored, now)?;
        if let Some(mut mapping) = self.jobs.find_mapping(&job.job_id)? {
            let mut touched = false;
            for column in &mut mapping.columns {
                if column.target_field.as_deref() == Some(target_field) {
                    column.rule_id = Some(stored.rule_id.clone());
                    touched = true;
                }
            }
            if touched {
                self.jobs.save_mapping(&job.job_id, &mapping, now)?;
            }
        }

        info!(
            job_id = %job.job_id,
            field = target_field,
            rule_id = %stored.rule_id,
            kind = stored.rule.kind(),
            "转换规则已登记"
        );
        Ok(stored.rule_id)
    }

    /// 将作业当前映射保存为模板新版本
    pub fn save_template(&self, job_id: &str, name: &str) -> ImportResult<MappingTemplate> {
        let mut job = self.load_job(job_id)?;
        let mapping = self.jobs.find_mapping(&job.job_id)?.ok_or_else(|| {
            ImportError::InvalidArgument(format!("作业 {} 尚无映射可保存", job.job_id))
        })?;

        let template_id = Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!(
                "template/{}/{}/{}",
                job.tenant_id, job.source_system, job.target_entity_type
            )
            .as_bytes(),
        )
        .to_string();
        let now = self.clock.now();
        let template = MappingTemplate {
            version: self.templates.latest_version(&template_id)? + 1,
            template_id,
            tenant_id: job.tenant_id.clone(),
            name: name.to_string(),
            source_system: job.source_system.clone(),
            target_entity_type: job.target_entity_type.clone(),
            entries: FieldMapper::template_entries(&mapping),
            value_maps: self.jobs.list_value_maps(&job.job_id)?,
            created_at: now,
        };
        self.templates.insert(&template)?;

        job.template = Some(template.reference());
        job.updated_at = now;
        self.jobs.update(&job)?;
        info!(
            job_id = %job.job_id,
            template_id = %template.template_id,
            version = template.version,
            entries = template.entries.len(),
            "映射模板已保存"
        );
        Ok(template)
    }

    pub fn list_templates(&self, tenant_id: &str) -> ImportResult<Vec<MappingTemplate>> {
        Ok(self.templates.list_by_tenant(tenant_id)?)
    }

    fn resolve_template(&self, job: &ImportJob) -> ImportResult<Option<MappingTemplate>> {
        if let Some(reference) = &job.template {
            if let Some(template) = self.templates.find(&reference.template_id, reference.version)? {
                return Ok(Some(template));
            }
            warn!(
                job_id = %job.job_id,
                template_id = %reference.template_id,
                version = reference.version,
                "作业引用的模板不存在，改用最新模板"
            );
        }
        Ok(self.templates.find_latest_for(
            &job.tenant_id,
            &job.source_system,
            &job.target_entity_type,
        )?)
    }

    // ==========================================
    // 阶段 3: 预览与校验
    // ==========================================

    /// 转换预览（不改变状态）
    pub async fn preview(&self, job_id: &str, selection: PreviewSelection) -> ImportResult<Vec<PreviewRow>> {
        let job = self.load_job(job_id)?;
        let schema = self.load_schema(&job.target_entity_type).await?;
        let transformer = self.build_transformer(&job, &schema)?;
        let parsed = self.open_file(&job).await?;

        let mut wanted: Option<BTreeSet<usize>> = match &selection {
            PreviewSelection::Sample(_) => None,
            PreviewSelection::Rows(rows) => Some(rows.iter().copied().collect()),
        };
        let limit = match &selection {
            PreviewSelection::Sample(n) => *n,
            PreviewSelection::Rows(rows) => rows.len(),
        };

        let mut preview = Vec::new();
        for row in parsed.rows.flatten() {
            if preview.len() >= limit {
                break;
            }
            if let Some(wanted) = wanted.as_mut() {
                if wanted.is_empty() {
                    break;
                }
                if !wanted.remove(&row.row_number) {
                    continue;
                }
            }
            let record = transformer.transform(&row);
            preview.push(PreviewRow {
                row_number: record.row_number,
                source: record.source,
                target: record.target,
                transformations_applied: record.applied,
            });
        }
        Ok(preview)
    }

    /// 校验（可重复执行，每次整体替换问题列表）
    ///
    /// # 状态
    /// - MAPPING / READY → VALIDATING → READY（无错误）或 MAPPING
    /// - 导入后状态下重新校验不改变状态
    ///
    /// # 返回
    /// - Err(MappingIncomplete): 必填字段未映射且无默认值
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn validate(&self, job_id: &str) -> ImportResult<ValidationReport> {
        let mut job = self.load_job(job_id)?;
        let schema = self.load_schema(&job.target_entity_type).await?;

        if job.state.has_committed_data() || job.state == JobState::RolledBack {
            return self.run_validation(&job, &schema).await.map(|(report, _)| report);
        }
        if !matches!(job.state, JobState::Mapping | JobState::Ready) {
            return Err(ImportError::InvalidStateTransition {
                from: job.state,
                to: JobState::Validating,
            });
        }

        self.machine
            .transition(&mut job, JobState::Validating, None, self.clock.now())?;
        match self.run_validation(&job, &schema).await {
            Ok((report, _)) => {
                let next = if report.can_execute() {
                    JobState::Ready
                } else {
                    JobState::Mapping
                };
                self.machine.transition(&mut job, next, None, self.clock.now())?;
                Ok(report)
            }
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "校验未完成，作业回到 MAPPING");
                self.machine
                    .transition(&mut job, JobState::Mapping, None, self.clock.now())?;
                Err(e)
            }
        }
    }

    /// 校验流程本体
    ///
    /// # 返回
    /// (校验报告, 源行总数含畸形行)
    async fn run_validation(
        &self,
        job: &ImportJob,
        schema: &TargetSchema,
    ) -> ImportResult<(ValidationReport, usize)> {
        let mapping = self.jobs.find_mapping(&job.job_id)?.unwrap_or_default();
        FieldMapper::check_complete(&mapping, schema)?;

        let transformer = self.build_transformer(job, schema)?;
        let validator = DqValidator::new(schema.clone(), self.io_timeout())?;
        let key_field = Self::key_field(job, schema);
        let parsed = self.open_file(job).await?;
        let now = self.clock.now();

        let mut issues = DqValidator::mapping_issues(&job.job_id, &mapping, now);
        let mut conflicts = ConflictHandler::new();
        let mut cache = ReferenceCache::new();
        let mut records = 0usize;
        let mut malformed = 0usize;

        for row in parsed.rows {
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    malformed += 1;
                    issues.push(DqValidator::malformed_row_issue(&job.job_id, &e, now));
                    continue;
                }
            };
            records += 1;
            let record = transformer.transform(&row);
            let source_record_id = ConflictHandler::source_record_id(&record, key_field.as_deref());
            if conflicts.observe(&source_record_id, row.row_number).is_some() {
                issues.push(DqValidator::duplicate_issue(
                    &job.job_id,
                    row.row_number,
                    &source_record_id,
                    job.options.incremental,
                    now,
                ));
            }
            issues.extend(
                validator
                    .validate_record(&job.job_id, &record, self.schemas.as_ref(), &mut cache, now)
                    .await?,
            );
        }

        let report = ValidationReport::from_issues(&job.job_id, records, issues);
        self.issues.replace_for_job(&report, now)?;

        info!(
            job_id = %job.job_id,
            records,
            malformed,
            errors = report.error_count,
            warnings = report.warning_count,
            infos = report.info_count,
            "校验完成"
        );
        self.machine.publisher().publish(JobEvent::notice(
            &job.job_id,
            &job.tenant_id,
            JobEventType::ValidationCompleted,
            Some(format!(
                "errors={} warnings={} infos={}",
                report.error_count, report.warning_count, report.info_count
            )),
            now,
        ));
        Ok((report, records + malformed))
    }

    /// 标记问题已处理
    pub fn resolve_issue(&self, job_id: &str, issue_id: &str) -> ImportResult<()> {
        self.load_job(job_id)?;
        self.issues.mark_resolved(job_id, issue_id)?;
        Ok(())
    }

    pub fn list_issues(&self, job_id: &str) -> ImportResult<Vec<crate::domain::validation::ValidationIssue>> {
        self.load_job(job_id)?;
        Ok(self.issues.list_by_job(job_id)?)
    }

    // ==========================================
    // 阶段 4: 执行
    // ==========================================

    /// 执行前检查（重新校验 + 作业锁 + 状态转换）
    ///
    /// MAPPING 状态下直接执行时，本次校验通过即经 VALIDATING → READY 进入导入
    ///
    /// # 返回
    /// - Err(ValidationBlocked): 存在错误级问题，未提交任何批次
    /// - Err(JobBusy): 作业正在执行或回滚
    /// - Err(InvalidStateTransition): 当前状态不允许执行
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn prepare_execution(
        &self,
        job_id: &str,
        options: ExecuteOptions,
    ) -> ImportResult<PreparedExecution> {
        let mut job = self.load_job(job_id)?;
        let dry_run = options.dry_run || job.options.dry_run;
        let error_handling = options.error_handling.unwrap_or(job.options.error_handling);

        let startable = if dry_run {
            matches!(
                job.state,
                JobState::Mapping
                    | JobState::Ready
                    | JobState::Completed
                    | JobState::CompletedWithErrors
                    | JobState::Failed
                    | JobState::RolledBack
            )
        } else {
            job.state == JobState::Mapping
                || (job.state != JobState::Paused && is_allowed(job.state, JobState::Importing))
        };
        if !startable {
            return Err(ImportError::InvalidStateTransition {
                from: job.state,
                to: JobState::Importing,
            });
        }

        let guard = self.scheduler.try_lock_job(&job.job_id)?;
        let schema = self.load_schema(&job.target_entity_type).await?;
        let (report, total_rows) = self.run_validation(&job, &schema).await?;
        if !report.can_execute() {
            if job.state == JobState::Ready {
                self.machine
                    .transition(&mut job, JobState::Mapping, None, self.clock.now())?;
            }
            warn!(job_id = %job.job_id, errors = report.error_count, "存在错误级问题，拒绝执行");
            return Err(ImportError::ValidationBlocked {
                error_count: report.error_count,
            });
        }

        let resume = !dry_run && job.state == JobState::Failed;
        if !dry_run && job.state == JobState::Mapping {
            // 执行前检查即本次校验
            self.machine
                .transition(&mut job, JobState::Validating, None, self.clock.now())?;
            self.machine
                .transition(&mut job, JobState::Ready, None, self.clock.now())?;
        }
        if !dry_run {
            self.machine
                .transition(&mut job, JobState::Importing, None, self.clock.now())?;
        }

        let runtime = self.scheduler.runtime(&job.job_id)?;
        runtime.control.clear_requests();
        runtime.set_running(true);

        Ok(PreparedExecution {
            total_rows: if resume { job.counts.source.max(total_rows) } else { total_rows },
            job,
            schema,
            dry_run,
            resume,
            error_handling,
            runtime,
            _guard: guard,
        })
    }

    /// 恢复已暂停的作业（从最后提交批次之后继续）
    pub async fn prepare_resume(&self, job_id: &str) -> ImportResult<PreparedExecution> {
        let mut job = self.load_job(job_id)?;
        if job.state != JobState::Paused {
            return Err(ImportError::InvalidStateTransition {
                from: job.state,
                to: JobState::Importing,
            });
        }
        let guard = self.scheduler.try_lock_job(&job.job_id)?;
        let schema = self.load_schema(&job.target_entity_type).await?;
        self.machine
            .transition(&mut job, JobState::Importing, None, self.clock.now())?;

        let runtime = self.scheduler.runtime(&job.job_id)?;
        runtime.control.clear_requests();
        runtime.set_running(true);

        Ok(PreparedExecution {
            total_rows: job.counts.source,
            error_handling: job.options.error_handling,
            job,
            schema,
            dry_run: false,
            resume: true,
            runtime,
            _guard: guard,
        })
    }

    /// 运行已准备好的执行（等待租户名额后开始）
    #[instrument(skip_all, fields(job_id = %prepared.job.job_id, dry_run = prepared.dry_run))]
    pub async fn run_execution(&self, prepared: PreparedExecution) -> ImportResult<ExecutionOutcome> {
        let mut prepared = prepared;
        let result = match self.scheduler.acquire_tenant_slot(&prepared.job.tenant_id).await {
            Ok(_permit) => self.run_executor(&prepared).await,
            Err(e) => Err(e),
        };
        prepared.runtime.set_running(false);

        let now = self.clock.now();
        let job = &mut prepared.job;

        if prepared.dry_run {
            let summary = result?;
            info!(
                job_id = %job.job_id,
                previews = summary.dry_run_records.len(),
                failed = summary.counts.failed,
                "试运行完成（未提交任何数据）"
            );
            self.machine.publisher().publish(JobEvent::notice(
                &job.job_id,
                &job.tenant_id,
                JobEventType::ExecutionFinished,
                Some("dry_run".to_string()),
                now,
            ));
            let failure_reason = match &summary.stop {
                ExecutionStop::Failed(reason) => Some(reason.clone()),
                _ => None,
            };
            return Ok(ExecutionOutcome {
                job_id: job.job_id.clone(),
                dry_run: true,
                state: job.state,
                counts: summary.counts,
                failures: summary.failures,
                dry_run_records: summary.dry_run_records,
                failure_reason,
                rollback_available: self.rollback_available(&job.job_id)?,
            });
        }

        let summary = match result {
            Ok(summary) => summary,
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "导入执行失败");
                self.machine
                    .transition(job, JobState::Failed, Some(&e.to_string()), now)?;
                return Err(e);
            }
        };

        job.counts = summary.counts;
        job.last_committed_batch = summary.last_committed_batch;
        self.jobs
            .update_progress(&job.job_id, &summary.counts, summary.last_committed_batch, now)?;

        let final_state = summary.final_state();
        let failure_reason = match &summary.stop {
            ExecutionStop::Failed(reason) => Some(reason.clone()),
            _ => None,
        };
        self.machine
            .transition(job, final_state, failure_reason.as_deref(), now)?;
        if final_state == JobState::Paused && prepared.runtime.control.is_cancel_requested() {
            self.machine
                .transition(job, JobState::Cancelled, Some("用户取消"), now)?;
            prepared.runtime.control.clear_requests();
        }

        info!(
            job_id = %job.job_id,
            state = %job.state,
            imported = summary.counts.imported,
            updated = summary.counts.updated,
            skipped = summary.counts.skipped,
            failed = summary.counts.failed,
            "导入执行结束"
        );
        self.machine.publisher().publish(JobEvent::notice(
            &job.job_id,
            &job.tenant_id,
            JobEventType::ExecutionFinished,
            Some(format!(
                "imported={} updated={} skipped={} failed={}",
                summary.counts.imported,
                summary.counts.updated,
                summary.counts.skipped,
                summary.counts.failed
            )),
            now,
        ));

        Ok(ExecutionOutcome {
            job_id: job.job_id.clone(),
            dry_run: false,
            state: job.state,
            counts: summary.counts,
            failures: summary.failures,
            dry_run_records: Vec::new(),
            failure_reason,
            rollback_available: self.rollback_available(&job.job_id)?,
        })
    }

    /// 执行（准备 + 运行，同步等待结束）
    pub async fn execute(&self, job_id: &str, options: ExecuteOptions) -> ImportResult<ExecutionOutcome> {
        let prepared = self.prepare_execution(job_id, options).await?;
        self.run_execution(prepared).await
    }

    /// 恢复（准备 + 运行，同步等待结束）
    pub async fn resume(&self, job_id: &str) -> ImportResult<ExecutionOutcome> {
        let prepared = self.prepare_resume(job_id).await?;
        self.run_execution(prepared).await
    }

    async fn run_executor(
        &self,
        prepared: &PreparedExecution,
    ) -> ImportResult<crate::importer::executor::ExecutionSummary> {
        let job = &prepared.job;
        let transformer = self.build_transformer(job, &prepared.schema)?;
        let parsed = self.open_file(job).await?;
        let executor = ImportExecutor::new(
            self.store.clone(),
            self.ledger.clone(),
            self.clock.clone(),
            self.executor_settings(),
        );
        let request = ExecutionRequest {
            job,
            key_field: Self::key_field(job, &prepared.schema),
            error_handling: prepared.error_handling,
            dry_run: prepared.dry_run,
            resume: prepared.resume,
            total_rows: prepared.total_rows,
        };
        executor
            .execute(request, parsed.rows, &transformer, &prepared.runtime.control)
            .await
    }

    // ==========================================
    // 暂停 / 取消
    // ==========================================

    /// 请求暂停（当前批次完成后生效）
    pub fn pause(&self, job_id: &str) -> ImportResult<()> {
        let job = self.load_job(job_id)?;
        if job.state != JobState::Importing {
            return Err(ImportError::InvalidStateTransition {
                from: job.state,
                to: JobState::Paused,
            });
        }
        self.scheduler.runtime(job_id)?.control.request_pause();
        info!(job_id, "已请求暂停");
        Ok(())
    }

    /// 取消作业
    ///
    /// # 返回
    /// - 导入前或已暂停: 立即 CANCELLED
    /// - 导入中: 返回 IMPORTING，执行在批次边界暂停后转为 CANCELLED
    pub fn cancel(&self, job_id: &str) -> ImportResult<JobState> {
        let mut job = self.load_job(job_id)?;
        match job.state {
            JobState::Importing => {
                self.scheduler.runtime(job_id)?.control.request_cancel();
                info!(job_id, "已请求取消，等待在途批次完成");
                Ok(JobState::Importing)
            }
            JobState::Paused => {
                let _guard = self.scheduler.try_lock_job(job_id)?;
                self.machine
                    .transition(&mut job, JobState::Cancelled, Some("用户取消"), self.clock.now())?;
                Ok(job.state)
            }
            _ => {
                self.machine
                    .transition(&mut job, JobState::Cancelled, Some("用户取消"), self.clock.now())?;
                Ok(job.state)
            }
        }
    }

    // ==========================================
    // 阶段 5: 回滚
    // ==========================================

    /// 回滚（持有作业独占锁）
    ///
    /// # 返回
    /// - Ok(RollbackResult): complete=true 时作业转为 ROLLED_BACK
    /// - Err(JobBusy): 作业正在执行
    /// - Err(RollbackBlocked): 还原点不可用或检测到独立修改（Block 策略）
    #[instrument(skip(self, scope), fields(job_id = %job_id))]
    pub async fn rollback(
        &self,
        job_id: &str,
        scope: RollbackScope,
        policy: ModificationPolicy,
    ) -> ImportResult<RollbackResult> {
        let _guard = self.scheduler.try_lock_job(job_id)?;
        let mut job = self.load_job(job_id)?;
        if !job.state.has_committed_data() && job.state != JobState::RolledBack {
            return Err(ImportError::InvalidStateTransition {
                from: job.state,
                to: JobState::RolledBack,
            });
        }

        let manager = RollbackManager::new(
            self.store.clone(),
            self.ledger.clone(),
            self.schemas.clone(),
            self.clock.clone(),
            job.options.batch_size.unwrap_or(self.settings.batch_size),
            self.io_timeout(),
        );
        let result = manager.rollback(&job.job_id, &scope, policy).await?;

        let now = self.clock.now();
        if result.complete && job.state != JobState::RolledBack {
            self.machine.transition(&mut job, JobState::RolledBack, None, now)?;
        }
        self.machine.publisher().publish(JobEvent::notice(
            &job.job_id,
            &job.tenant_id,
            JobEventType::RollbackCompleted,
            Some(format!(
                "deleted={} restored={} excluded={} complete={}",
                result.deleted,
                result.restored,
                result.excluded.len(),
                result.complete
            )),
            now,
        ));
        Ok(result)
    }

    /// 过期还原点清理
    pub fn expire_restore_points(&self) -> ImportResult<usize> {
        let expired = self.ledger.expire_restore_points(self.clock.now())?;
        if expired > 0 {
            info!(expired, "还原点已过期");
        }
        Ok(expired)
    }

    // ==========================================
    // 进度 / 报告
    // ==========================================

    pub fn get_progress(&self, job_id: &str) -> ImportResult<ImportProgress> {
        let job = self.load_job(job_id)?;
        if let Some(runtime) = self.scheduler.existing_runtime(job_id)? {
            return Ok(runtime.control.snapshot(job_id, Some(job.state)));
        }

        let counts = job.counts;
        let succeeded = counts.imported + counts.updated + counts.skipped;
        let batch_size = job.options.batch_size.unwrap_or(self.settings.batch_size).max(1);
        Ok(ImportProgress {
            job_id: job.job_id.clone(),
            state: Some(job.state),
            total: counts.source,
            processed: succeeded + counts.failed,
            succeeded,
            failed: counts.failed,
            batches_total: counts.source.div_ceil(batch_size),
            batches_committed: job.last_committed_batch.map(|b| b + 1).unwrap_or(0),
            eta_seconds: None,
        })
    }

    /// 作业报告（计数 + 使用的映射 + 错误摘要 + 回滚可用性）
    pub fn get_report(&self, job_id: &str) -> ImportResult<JobReport> {
        let job = self.load_job(job_id)?;
        let summary = self.issues.latest_run(job_id)?;

        let mut digest: BTreeMap<(String, Option<String>), ErrorDigestEntry> = BTreeMap::new();
        for issue in self.issues.list_by_job(job_id)? {
            let entry = digest
                .entry((issue.code.clone(), issue.field.clone()))
                .or_insert_with(|| ErrorDigestEntry {
                    code: issue.code.clone(),
                    field: issue.field.clone(),
                    count: 0,
                    first_row: None,
                    sample_message: issue.message.clone(),
                });
            entry.count += 1;
            entry.first_row = match (entry.first_row, issue.row_number) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        for log in self.ledger.list_error_logs(job_id)? {
            let entry = digest
                .entry((IMPORT_ERROR_CODE.to_string(), None))
                .or_insert_with(|| ErrorDigestEntry {
                    code: IMPORT_ERROR_CODE.to_string(),
                    field: None,
                    count: 0,
                    first_row: None,
                    sample_message: log.message.clone(),
                });
            entry.count += 1;
            entry.first_row = Some(entry.first_row.map_or(log.row_number, |r| r.min(log.row_number)));
        }
        let mut error_digest: Vec<ErrorDigestEntry> = digest.into_values().collect();
        error_digest.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.code.cmp(&b.code)));

        let restore_point = self.ledger.latest_restore_point(job_id)?;
        Ok(JobReport {
            mapping: self.jobs.find_mapping(job_id)?,
            value_maps: self.jobs.list_value_maps(job_id)?,
            validation_errors: summary.map(|s| s.error_count).unwrap_or(0),
            validation_warnings: summary.map(|s| s.warning_count).unwrap_or(0),
            validation_infos: summary.map(|s| s.info_count).unwrap_or(0),
            error_digest,
            rollback_available: self.rollback_available(job_id)?,
            restore_point,
            job,
        })
    }

    fn rollback_available(&self, job_id: &str) -> ImportResult<bool> {
        let now = self.clock.now();
        let active = self
            .ledger
            .latest_restore_point(job_id)?
            .map(|rp| rp.status == RestorePointStatus::Active && !rp.is_expired_at(now))
            .unwrap_or(false);
        Ok(active && self.ledger.count_active(job_id)? > 0)
    }

    // ==========================================
    // 内部工具
    // ==========================================

    fn load_job(&self, job_id: &str) -> ImportResult<ImportJob> {
        self.jobs
            .find_by_id(job_id)?
            .ok_or_else(|| ImportError::JobNotFound(job_id.to_string()))
    }

    async fn load_schema(&self, entity_type: &str) -> ImportResult<TargetSchema> {
        self.with_timeout("目标模式查询", self.schemas.schema(entity_type))
            .await?
            .ok_or_else(|| ImportError::UnknownEntityType(entity_type.to_string()))
    }

    /// 映射类操作只允许在 MAPPING / READY 进行（READY 回退到 MAPPING）
    fn ensure_editable(&self, job: &mut ImportJob) -> ImportResult<()> {
        match job.state {
            JobState::Mapping => Ok(()),
            JobState::Ready => self
                .machine
                .transition(job, JobState::Mapping, None, self.clock.now()),
            other => Err(ImportError::InvalidStateTransition {
                from: other,
                to: JobState::Mapping,
            }),
        }
    }

    async fn fetch_blob(&self, job: &ImportJob) -> ImportResult<(String, Arc<[u8]>)> {
        let key = job.blob_key.clone().ok_or_else(|| {
            ImportError::InvalidArgument(format!("作业 {} 尚未提交文件", job.job_id))
        })?;
        let bytes = self.with_timeout("读取上传文件", self.blobs.get(&key)).await?;
        Ok((key, bytes))
    }

    async fn open_file(&self, job: &ImportJob) -> ImportResult<ParsedFile> {
        let (name, bytes) = self.fetch_blob(job).await?;
        UniversalFileParser.open(&name, bytes, job.encoding_hint.as_deref())
    }

    fn build_transformer(&self, job: &ImportJob, schema: &TargetSchema) -> ImportResult<RecordTransformer> {
        RecordTransformer::new(
            schema.clone(),
            self.jobs.find_mapping(&job.job_id)?.unwrap_or_default(),
            self.jobs.list_value_maps(&job.job_id)?,
            self.jobs.list_rules(&job.job_id)?,
            self.clock.clone(),
        )
    }

    fn key_field(job: &ImportJob, schema: &TargetSchema) -> Option<String> {
        job.options
            .source_key_field
            .clone()
            .or_else(|| schema.key_field.clone())
    }

    fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.io_timeout_ms)
    }

    fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            batch_size: self.settings.batch_size,
            worker_count: self.settings.worker_count,
            retry_max_attempts: self.settings.retry_max_attempts,
            retry_backoff: Duration::from_millis(self.settings.retry_backoff_ms),
            io_timeout: self.io_timeout(),
            restore_retention_days: self.settings.restore_retention_days,
        }
    }

    async fn with_timeout<T, F>(&self, what: &str, fut: F) -> ImportResult<T>
    where
        F: Future<Output = RepositoryResult<T>>,
    {
        match tokio::time::timeout(self.io_timeout(), fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ImportError::Timeout(format!(
                "{} 超过 {} ms",
                what, self.settings.io_timeout_ms
            ))),
        }
    }
}

/// 执行期记录失败在错误摘要中的代码
pub const IMPORT_ERROR_CODE: &str = "import_error";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_shared_connection;
    use crate::domain::schema::{FieldType, TargetField};
    use crate::engine::events::RecordingEventPublisher;
    use crate::importer::field_mapper::HeuristicScorer;
    use crate::importer::importer_trait::FixedClock;
    use crate::repository::{MemoryBlobStore, SqliteTargetStore, StaticSchemaProvider};
    use chrono::{TimeZone, Utc};
    use tempfile::NamedTempFile;

    struct Fixture {
        _temp: NamedTempFile,
        orchestrator: ImportOrchestrator,
        blobs: Arc<MemoryBlobStore>,
        recorder: Arc<RecordingEventPublisher>,
    }

    fn schema() -> TargetSchema {
        TargetSchema {
            entity_type: "case".to_string(),
            fields: vec![
                TargetField::new("case_id", FieldType::Text).required(),
                TargetField::new("title", FieldType::Text).required(),
            ],
            key_field: Some("case_id".to_string()),
            business_rules: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    async fn fixture() -> Fixture {
        let temp = NamedTempFile::new().unwrap();
        let conn = open_shared_connection(temp.path().to_str().unwrap()).unwrap();
        let schemas = Arc::new(StaticSchemaProvider::new());
        schemas.register_schema(schema()).unwrap();
        let blobs = Arc::new(MemoryBlobStore::new());
        let recorder = Arc::new(RecordingEventPublisher::new());

        let deps = OrchestratorDeps {
            jobs: Arc::new(ImportJobRepository::new(conn.clone()).unwrap()),
            issues: Arc::new(ValidationIssueRepository::new(conn.clone()).unwrap()),
            templates: Arc::new(MappingTemplateRepository::new(conn.clone()).unwrap()),
            ledger: Arc::new(ImportedRecordRepository::new(conn.clone()).unwrap()),
            store: Arc::new(SqliteTargetStore::new(conn.clone()).unwrap()),
            blobs: blobs.clone(),
            schemas,
            config: Arc::new(ImportSettings::default()),
            scorer: Arc::new(HeuristicScorer::new()),
            registry: Arc::new(SourceSystemRegistry::with_builtin()),
            clock: Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap())),
            publisher: OptionalEventPublisher::with_publisher(recorder.clone()),
            listeners: Vec::new(),
        };
        Fixture {
            _temp: temp,
            orchestrator: ImportOrchestrator::new(deps).await.unwrap(),
            blobs,
            recorder,
        }
    }

    #[tokio::test]
    async fn test_create_job_rejects_unknown_entity() {
        let fx = fixture().await;
        let err = fx
            .orchestrator
            .create_job("T1", "auto", "invoice", JobOptions::default())
            .await;
        assert!(matches!(err, Err(ImportError::UnknownEntityType(_))));
    }

    #[tokio::test]
    async fn test_submit_file_failure_returns_to_created() {
        let fx = fixture().await;
        let job_id = fx
            .orchestrator
            .create_job("T1", "auto", "case", JobOptions::default())
            .await
            .unwrap();
        fx.blobs.put("empty.csv", b"case_id,title\n".to_vec()).unwrap();

        let err = fx.orchestrator.submit_file(&job_id, "empty.csv", None).await;
        assert!(matches!(err, Err(ImportError::EmptyInput(_))));
        let job = fx.orchestrator.get_job(&job_id).unwrap();
        assert_eq!(job.state, JobState::Created);
        assert!(job.failure_reason.is_some());
    }

    #[tokio::test]
    async fn test_full_pipeline_to_completed() {
        let fx = fixture().await;
        let job_id = fx
            .orchestrator
            .create_job("T1", "auto", "case", JobOptions::default())
            .await
            .unwrap();
        fx.blobs
            .put("cases.csv", b"case_id,title\nC1,Alpha\nC2,Beta\n".to_vec())
            .unwrap();

        let analysis = fx.orchestrator.submit_file(&job_id, "cases.csv", None).await.unwrap();
        assert_eq!(analysis.record_count, 2);

        let mapping = fx.orchestrator.propose_mapping(&job_id).await.unwrap();
        fx.orchestrator.confirm_mapping(&job_id, mapping).await.unwrap();
        let report = fx.orchestrator.validate(&job_id).await.unwrap();
        assert_eq!(report.error_count, 0);
        assert_eq!(fx.orchestrator.get_job(&job_id).unwrap().state, JobState::Ready);

        let outcome = fx
            .orchestrator
            .execute(&job_id, ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.state, JobState::Completed);
        assert_eq!(outcome.counts.imported, 2);
        assert!(outcome.rollback_available);

        let report = fx.orchestrator.get_report(&job_id).unwrap();
        assert!(report.rollback_available);
        assert!(report.mapping.is_some());

        let transitions: Vec<JobState> = fx
            .recorder
            .events()
            .into_iter()
            .filter_map(|e| e.to)
            .collect();
        assert_eq!(
            transitions,
            vec![
                JobState::Analyzing,
                JobState::Mapping,
                JobState::Validating,
                JobState::Ready,
                JobState::Importing,
                JobState::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_before_import() {
        let fx = fixture().await;
        let job_id = fx
            .orchestrator
            .create_job("T1", "auto", "case", JobOptions::default())
            .await
            .unwrap();
        assert_eq!(fx.orchestrator.cancel(&job_id).unwrap(), JobState::Cancelled);
        assert!(matches!(
            fx.orchestrator.pause(&job_id),
            Err(ImportError::InvalidStateTransition { .. })
        ));
    }
}
