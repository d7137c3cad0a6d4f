// ==========================================
// 数据迁移导入引擎 - 导入执行器
// ==========================================
// 职责: 流式转换 → 分批 → 并行事务化提交（按错误处理策略）
// 约束: 一个批次 = 一个事务；已提交批次不受兄弟批次失败影响
// 暂停/取消: 只在批次边界生效，游标为 job_batch 中的已提交批次集合
// 试运行: 走相同流水线，只读目标存储，不产生任何写入
// ==========================================

use crate::domain::job::{ImportJob, ImportProgress, JobCounts};
use crate::domain::record::{DryRunRecord, ImportErrorLog, RecordKey, RestorePoint};
use crate::domain::types::{ErrorHandlingMode, JobState, RecordAction, RestorePointStatus};
use crate::importer::conflict_handler::ConflictHandler;
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::importer_trait::{Clock, RowResult};
use crate::importer::transformer::RecordTransformer;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::imported_record_repo::ImportedRecordRepository;
use crate::repository::target_store::{
    BatchCommit, CommitGuard, RecordWrite, TargetRecordStore, WriteOutcome,
};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// 目标实体 ID: {tenant}/{source system}/{source record id}/{entity type} 的 UUID v5
pub fn target_entity_id(key: &RecordKey) -> String {
    let name = format!(
        "{}/{}/{}/{}",
        key.tenant_id, key.source_system, key.source_record_id, key.entity_type
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

// ==========================================
// ExecutorSettings - 执行参数
// ==========================================
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub batch_size: usize,
    pub worker_count: usize,
    pub retry_max_attempts: u32,
    pub retry_backoff: Duration,
    pub io_timeout: Duration,
    pub restore_retention_days: i64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            worker_count: 4,
            retry_max_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            io_timeout: Duration::from_secs(30),
            restore_retention_days: 7,
        }
    }
}

// ==========================================
// ExecutionControl - 运行期进度与控制标志
// ==========================================
// 由调度器注册表持有，执行器写入，API 轮询读取
#[derive(Debug, Default)]
pub struct ExecutionControl {
    total: AtomicUsize,
    processed: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    batches_total: AtomicUsize,
    batches_committed: AtomicUsize,
    pause_requested: AtomicBool,
    cancel_requested: AtomicBool,
    aborted: AtomicBool,
    started_at: Mutex<Option<Instant>>,
}

impl ExecutionControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新一轮执行开始（恢复执行时已提交批次由执行器补记为已处理）
    pub fn begin(&self, total: usize, batch_size: usize) {
        self.total.store(total, Ordering::SeqCst);
        self.processed.store(0, Ordering::SeqCst);
        self.succeeded.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        self.batches_total
            .store(total.div_ceil(batch_size.max(1)), Ordering::SeqCst);
        self.batches_committed.store(0, Ordering::SeqCst);
        self.aborted.store(false, Ordering::SeqCst);
        if let Ok(mut started) = self.started_at.lock() {
            *started = Some(Instant::now());
        }
    }

    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    /// 取消 = 批次边界暂停 + 取消标记
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    pub fn clear_requests(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
        self.cancel_requested.store(false, Ordering::SeqCst);
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn should_stop(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst) || self.aborted.load(Ordering::SeqCst)
    }

    fn add_processed(&self, n: usize) {
        self.processed.fetch_add(n, Ordering::SeqCst);
    }

    fn record_batch(&self, succeeded: usize, failed: usize) {
        self.succeeded.fetch_add(succeeded, Ordering::SeqCst);
        self.failed.fetch_add(failed, Ordering::SeqCst);
        self.processed.fetch_add(succeeded + failed, Ordering::SeqCst);
        self.batches_committed.fetch_add(1, Ordering::SeqCst);
    }

    /// 进度快照（ETA 按本轮平均速率估算）
    pub fn snapshot(&self, job_id: &str, state: Option<JobState>) -> ImportProgress {
        let total = self.total.load(Ordering::SeqCst);
        let processed = self.processed.load(Ordering::SeqCst).min(total);
        let this_run = self.succeeded.load(Ordering::SeqCst) + self.failed.load(Ordering::SeqCst);
        let elapsed = self
            .started_at
            .lock()
            .ok()
            .and_then(|s| *s)
            .map(|s| s.elapsed().as_secs_f64());

        let eta_seconds = match elapsed {
            Some(secs) if this_run > 0 && processed < total => {
                let rate = this_run as f64 / secs.max(0.001);
                Some(((total - processed) as f64 / rate).ceil() as u64)
            }
            _ if total > 0 && processed >= total => Some(0),
            _ => None,
        };

        ImportProgress {
            job_id: job_id.to_string(),
            state,
            total,
            processed,
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            batches_total: self.batches_total.load(Ordering::SeqCst),
            batches_committed: self.batches_committed.load(Ordering::SeqCst),
            eta_seconds,
        }
    }
}

// ==========================================
// 执行请求 / 结果
// ==========================================
pub struct ExecutionRequest<'a> {
    pub job: &'a ImportJob,
    pub key_field: Option<String>,
    pub error_handling: ErrorHandlingMode,
    pub dry_run: bool,
    pub resume: bool,    // true: 跳过已提交批次，计数由台账重建
    pub total_rows: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionStop {
    Finished,         // 数据流已全部处理
    Interrupted,      // 暂停/取消请求在批次边界生效
    Failed(String),   // 作业级失败（STOP_ON_ERROR / 超时 / 存储故障）
}

#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub counts: JobCounts,
    pub stop: ExecutionStop,
    pub last_committed_batch: Option<usize>,
    pub failures: Vec<ImportErrorLog>,
    pub dry_run_records: Vec<DryRunRecord>,
}

impl ExecutionSummary {
    /// 正常结束时的终态
    pub fn final_state(&self) -> JobState {
        match &self.stop {
            ExecutionStop::Failed(_) => JobState::Failed,
            ExecutionStop::Interrupted => JobState::Paused,
            ExecutionStop::Finished if self.counts.failed > 0 => JobState::CompletedWithErrors,
            ExecutionStop::Finished => JobState::Completed,
        }
    }
}

struct PreparedBatch {
    batch_index: usize,
    writes: Vec<RecordWrite>,
}

struct BatchOutcome {
    batch_index: usize,
    outcomes: Vec<WriteOutcome>,
    failures: Vec<ImportErrorLog>,
    dry_run: Vec<DryRunRecord>,
}

// 作业级上下文（各批次共享）
struct JobContext<'a> {
    job: &'a ImportJob,
    error_handling: ErrorHandlingMode,
    dry_run: bool,
    restore_point: RestorePoint,
}

// ==========================================
// BatchFeeder - 惰性批次生成（行 → 转换 → 分批）
// ==========================================
#[derive(Debug, Default)]
struct FeederStats {
    malformed: usize,
    duplicates: usize,
    exhausted: bool,
}

struct BatchFeeder<'a> {
    rows: Box<dyn Iterator<Item = RowResult> + Send>,
    transformer: &'a RecordTransformer,
    conflicts: ConflictHandler,
    job: &'a ImportJob,
    key_field: Option<String>,
    batch_size: usize,
    next_batch_index: usize,
    committed: BTreeSet<usize>,
    control: &'a ExecutionControl,
    stats: FeederStats,
}

impl<'a> Iterator for BatchFeeder<'a> {
    type Item = PreparedBatch;

    fn next(&mut self) -> Option<PreparedBatch> {
        loop {
            if self.control.should_stop() {
                return None;
            }

            let mut writes: Vec<RecordWrite> = Vec::with_capacity(self.batch_size);
            let mut malformed = 0;
            let mut duplicates = 0;
            while writes.len() < self.batch_size {
                let row = match self.rows.next() {
                    Some(Ok(row)) => row,
                    Some(Err(err)) => {
                        debug!(row = err.row_number, "畸形行跳过: {}", err.message);
                        malformed += 1;
                        continue;
                    }
                    None => {
                        self.stats.exhausted = true;
                        break;
                    }
                };

                let record = self.transformer.transform(&row);
                let source_record_id =
                    ConflictHandler::source_record_id(&record, self.key_field.as_deref());
                if let Some(first) = self.conflicts.observe(&source_record_id, row.row_number) {
                    debug!(row = row.row_number, first_row = first, id = %source_record_id, "文件内重复记录，保留首次出现");
                    duplicates += 1;
                    continue;
                }

                let key = RecordKey {
                    tenant_id: self.job.tenant_id.clone(),
                    source_system: self.job.source_system.clone(),
                    source_record_id,
                    entity_type: self.job.target_entity_type.clone(),
                };
                writes.push(RecordWrite {
                    index: writes.len(),
                    row_number: row.row_number,
                    entity_id: target_entity_id(&key),
                    key,
                    payload: Value::Object(record.target),
                });
            }

            if writes.is_empty() {
                self.stats.malformed += malformed;
                self.stats.duplicates += duplicates;
                self.control.add_processed(malformed + duplicates);
                return None;
            }

            let batch_index = self.next_batch_index;
            self.next_batch_index += 1;

            // 畸形行/重复行每轮重读文件重新统计，不从台账恢复
            self.stats.malformed += malformed;
            self.stats.duplicates += duplicates;

            if self.committed.contains(&batch_index) {
                // 恢复执行: 该批次写入结果已在台账中
                self.control.add_processed(writes.len() + malformed + duplicates);
                continue;
            }

            self.control.add_processed(malformed + duplicates);
            return Some(PreparedBatch { batch_index, writes });
        }
    }
}

// ==========================================
// ImportExecutor
// ==========================================
pub struct ImportExecutor {
    store: Arc<dyn TargetRecordStore>,
    ledger: Arc<ImportedRecordRepository>,
    clock: Arc<dyn Clock>,
    settings: ExecutorSettings,
}

impl ImportExecutor {
    pub fn new(
        store: Arc<dyn TargetRecordStore>,
        ledger: Arc<ImportedRecordRepository>,
        clock: Arc<dyn Clock>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// 执行导入
    ///
    /// # 参数
    /// - request: 作业与本次执行参数
    /// - rows: 源文件行流（与校验时同一文件）
    /// - transformer: 作业转换器
    /// - control: 进度与暂停/取消标志
    ///
    /// # 返回
    /// - Ok(ExecutionSummary): 含终止原因；作业级失败也以 Failed 形式返回
    /// - Err: 台账读写失败等无法继续的基础设施错误
    #[instrument(skip_all, fields(job_id = %request.job.job_id, dry_run = request.dry_run, resume = request.resume))]
    pub async fn execute(
        &self,
        request: ExecutionRequest<'_>,
        rows: Box<dyn Iterator<Item = RowResult> + Send>,
        transformer: &RecordTransformer,
        control: &ExecutionControl,
    ) -> ImportResult<ExecutionSummary> {
        let job = request.job;
        let batch_size = job
            .options
            .batch_size
            .unwrap_or(self.settings.batch_size)
            .max(1);

        let committed = if request.dry_run {
            BTreeSet::new()
        } else if request.resume {
            // 未提交批次会被重新派发，其失败日志作废
            let pruned = self.ledger.prune_uncommitted_error_logs(&job.job_id)?;
            if pruned > 0 {
                debug!(pruned, "已清除未提交批次的失败日志");
            }
            self.ledger.committed_batches(&job.job_id)?
        } else {
            self.ledger.clear_batches(&job.job_id)?;
            self.ledger.clear_error_logs(&job.job_id)?;
            BTreeSet::new()
        };

        let mut counts = if request.resume && !request.dry_run {
            JobCounts {
                source: request.total_rows,
                ..self.ledger.committed_counts(&job.job_id)?
            }
        } else {
            JobCounts {
                source: request.total_rows,
                ..JobCounts::default()
            }
        };
        let mut last_committed_batch = if request.resume {
            committed.iter().next_back().copied()
        } else {
            None
        };

        control.begin(request.total_rows, batch_size);

        let now = self.clock.now();
        let ctx = JobContext {
            job,
            error_handling: request.error_handling,
            dry_run: request.dry_run,
            restore_point: RestorePoint {
                restore_point_id: Uuid::new_v4().to_string(),
                job_id: job.job_id.clone(),
                tenant_id: job.tenant_id.clone(),
                created_at: now,
                expires_at: now + chrono::Duration::days(self.settings.restore_retention_days),
                entity_types: vec![job.target_entity_type.clone()],
                record_count: 0,
                status: RestorePointStatus::Active,
            },
        };

        info!(
            batch_size,
            workers = self.settings.worker_count,
            mode = %request.error_handling,
            skipped_batches = committed.len(),
            "开始执行导入"
        );

        let mut feeder = BatchFeeder {
            rows,
            transformer,
            conflicts: ConflictHandler::new(),
            job,
            key_field: request.key_field.clone(),
            batch_size,
            next_batch_index: 0,
            committed,
            control,
            stats: FeederStats::default(),
        };

        let mut fatal: Option<ImportError> = None;
        let mut failures = Vec::new();
        let mut dry_run_records = Vec::new();
        {
            let ctx = &ctx;
            let mut results = stream::iter(&mut feeder)
                .map(|batch| self.process_batch(ctx, batch))
                .buffer_unordered(self.settings.worker_count.max(1));

            while let Some(result) = results.next().await {
                match result {
                    Ok(outcome) => {
                        let failed = outcome.failures.len();
                        for write in &outcome.outcomes {
                            match write.action {
                                RecordAction::Created => counts.imported += 1,
                                RecordAction::Updated => counts.updated += 1,
                                RecordAction::Skipped => counts.skipped += 1,
                            }
                        }
                        counts.failed += failed;
                        control.record_batch(outcome.outcomes.len(), failed);
                        if !request.dry_run {
                            last_committed_batch = Some(
                                last_committed_batch.map_or(outcome.batch_index, |b| b.max(outcome.batch_index)),
                            );
                        }
                        debug!(
                            batch_index = outcome.batch_index,
                            written = outcome.outcomes.len(),
                            failed,
                            "批次完成"
                        );
                        failures.extend(outcome.failures);
                        dry_run_records.extend(outcome.dry_run);
                    }
                    Err(err) => {
                        error!(error = %err, "批次失败，停止派发新批次");
                        control.abort();
                        if fatal.is_none() {
                            fatal = Some(err);
                        }
                    }
                }
            }
        }

        counts.failed += feeder.stats.malformed;
        counts.skipped += feeder.stats.duplicates;
        dry_run_records.sort_by_key(|r| r.row_number);

        let stop = match fatal {
            Some(err) => ExecutionStop::Failed(err.to_string()),
            None if !feeder.stats.exhausted => ExecutionStop::Interrupted,
            None => ExecutionStop::Finished,
        };

        info!(
            imported = counts.imported,
            updated = counts.updated,
            skipped = counts.skipped,
            failed = counts.failed,
            stop = ?stop,
            "导入执行结束"
        );

        Ok(ExecutionSummary {
            counts,
            stop,
            last_committed_batch,
            failures,
            dry_run_records,
        })
    }

    async fn process_batch(&self, ctx: &JobContext<'_>, batch: PreparedBatch) -> ImportResult<BatchOutcome> {
        if ctx.dry_run {
            self.simulate_batch(ctx, batch).await
        } else {
            self.commit_with_policy(ctx, batch).await
        }
    }

    /// 按错误处理策略提交一个批次
    ///
    /// - 单条记录失败: STOP 终止作业 / SKIP 剔除后重提 / RETRY 退避重试 N 次后剔除
    /// - 存储故障: STOP 终止作业 / RETRY 整批重试 / 其余整批记为失败
    async fn commit_with_policy(&self, ctx: &JobContext<'_>, batch: PreparedBatch) -> ImportResult<BatchOutcome> {
        let PreparedBatch {
            batch_index,
            mut writes,
        } = batch;
        let mut failures: Vec<ImportErrorLog> = Vec::new();
        let mut record_attempts: HashMap<usize, u32> = HashMap::new();
        let mut batch_attempts: u32 = 0;

        loop {
            let commit = BatchCommit {
                job_id: ctx.job.job_id.clone(),
                batch_index,
                incremental: ctx.job.options.incremental,
                restore_point: ctx.restore_point.clone(),
                writes: writes.clone(),
                committed_at: self.clock.now(),
                guard: CommitGuard::new(),
            };

            match self.commit_with_timeout(commit).await? {
                Ok(outcomes) => {
                    return Ok(BatchOutcome {
                        batch_index,
                        outcomes,
                        failures,
                        dry_run: Vec::new(),
                    })
                }
                Err(RepositoryError::RecordWriteFailed { index, message }) => {
                    let Some(pos) = writes.iter().position(|w| w.index == index) else {
                        return Err(ImportError::BatchCommitFailed { batch_index, message });
                    };
                    match ctx.error_handling {
                        ErrorHandlingMode::StopOnError => {
                            return Err(ImportError::BatchCommitFailed {
                                batch_index,
                                message: format!("行 {}: {}", writes[pos].row_number, message),
                            });
                        }
                        ErrorHandlingMode::SkipAndContinue => {
                            let write = writes.remove(pos);
                            failures.push(self.log_failure(ctx, batch_index, &write, &message, 1)?);
                        }
                        ErrorHandlingMode::RetryThenSkip => {
                            let attempts = {
                                let entry = record_attempts.entry(index).or_insert(0);
                                *entry += 1;
                                *entry
                            };
                            if attempts < self.settings.retry_max_attempts {
                                self.backoff(attempts).await;
                            } else {
                                let write = writes.remove(pos);
                                failures.push(self.log_failure(ctx, batch_index, &write, &message, attempts)?);
                            }
                        }
                    }
                }
                Err(RepositoryError::Timeout(message)) => return Err(ImportError::Timeout(message)),
                Err(err) => {
                    batch_attempts += 1;
                    let message = err.to_string();
                    match ctx.error_handling {
                        ErrorHandlingMode::StopOnError => {
                            return Err(ImportError::BatchCommitFailed { batch_index, message });
                        }
                        ErrorHandlingMode::RetryThenSkip if batch_attempts < self.settings.retry_max_attempts => {
                            warn!(batch_index, attempt = batch_attempts, "批次提交失败，退避后重试: {}", message);
                            self.backoff(batch_attempts).await;
                        }
                        _ => {
                            warn!(batch_index, records = writes.len(), "批次提交失败，整批记为失败: {}", message);
                            for write in writes.drain(..) {
                                failures.push(self.log_failure(ctx, batch_index, &write, &message, batch_attempts)?);
                            }
                            return Ok(BatchOutcome {
                                batch_index,
                                outcomes: Vec::new(),
                                failures,
                                dry_run: Vec::new(),
                            });
                        }
                    }
                }
            }
        }
    }

    /// 带超时提交一个批次
    ///
    /// 超时后先放弃守卫: 放弃成功则存储端不会再提交，返回 Timeout；
    /// 放弃失败说明 COMMIT 已开始，等待真实结果，使计数与台账一致
    async fn commit_with_timeout(&self, commit: BatchCommit) -> ImportResult<RepositoryResult<Vec<WriteOutcome>>> {
        let batch_index = commit.batch_index;
        let guard = commit.guard.clone();
        let store = Arc::clone(&self.store);
        let mut handle = tokio::spawn(async move { store.commit_batch(commit).await });

        let joined = match tokio::time::timeout(self.settings.io_timeout, &mut handle).await {
            Ok(joined) => joined,
            Err(_) if guard.abandon() => {
                warn!(batch_index, "批次提交超时，已放弃");
                return Err(ImportError::Timeout(format!(
                    "批次 {} 提交超过 {} ms",
                    batch_index,
                    self.settings.io_timeout.as_millis()
                )));
            }
            Err(_) => {
                warn!(batch_index, "批次提交超时但已进入 COMMIT，等待结果");
                handle.await
            }
        };

        joined.map_err(|e| ImportError::BatchCommitFailed {
            batch_index,
            message: format!("提交任务异常终止: {}", e),
        })
    }

    /// 试运行: 逐条判断 新建/更新/跳过 并给出前后对比
    async fn simulate_batch(&self, ctx: &JobContext<'_>, batch: PreparedBatch) -> ImportResult<BatchOutcome> {
        let mut outcomes = Vec::with_capacity(batch.writes.len());
        let mut previews = Vec::with_capacity(batch.writes.len());

        for write in batch.writes {
            let existing = tokio::time::timeout(self.settings.io_timeout, self.store.find_by_key(&write.key))
                .await
                .map_err(|_| ImportError::Timeout(format!("目标记录查询超过 {} ms", self.settings.io_timeout.as_millis())))??;

            let (action, before) = match existing {
                None => (RecordAction::Created, None),
                Some(record) if ctx.job.options.incremental => (RecordAction::Updated, Some(record.payload)),
                Some(record) => (RecordAction::Skipped, Some(record.payload)),
            };

            outcomes.push(WriteOutcome {
                index: write.index,
                source_record_id: write.key.source_record_id.clone(),
                action,
                new_link: false,
            });
            previews.push(DryRunRecord {
                row_number: write.row_number,
                source_record_id: write.key.source_record_id,
                action,
                before,
                after: write.payload,
            });
        }

        Ok(BatchOutcome {
            batch_index: batch.batch_index,
            outcomes,
            failures: Vec::new(),
            dry_run: previews,
        })
    }

    fn log_failure(
        &self,
        ctx: &JobContext<'_>,
        batch_index: usize,
        write: &RecordWrite,
        message: &str,
        attempts: u32,
    ) -> ImportResult<ImportErrorLog> {
        warn!(
            batch_index,
            row = write.row_number,
            id = %write.key.source_record_id,
            attempts,
            "记录写入失败，已跳过: {}",
            message
        );
        let log = ImportErrorLog {
            error_id: Uuid::new_v4().to_string(),
            job_id: ctx.job.job_id.clone(),
            batch_index,
            row_number: write.row_number,
            source_record_id: write.key.source_record_id.clone(),
            message: message.to_string(),
            attempts,
            created_at: self.clock.now(),
        };
        self.ledger.insert_error_log(&log)?;
        Ok(log)
    }

    async fn backoff(&self, attempt: u32) {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        tokio::time::sleep(self.settings.retry_backoff.saturating_mul(factor)).await;
    }
}
