// ==========================================
// 数据迁移导入引擎 - 作业状态机
// ==========================================
// 职责: 合法转换表 + 比较并更新 + 类型化监听器 + 事件发布
// 红线: 作业状态只经由此处修改
// ==========================================

use crate::domain::job::ImportJob;
use crate::domain::types::JobState;
use crate::engine::events::{JobEvent, OptionalEventPublisher};
use crate::importer::error::{ImportError, ImportResult};
use crate::repository::job_repo::ImportJobRepository;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

/// 转换是否合法
///
/// # 说明
/// - CANCELLED 可由任意导入前状态或 PAUSED 到达
/// - COMPLETED / COMPLETED_WITH_ERRORS / ROLLED_BACK 可重新执行
/// - FAILED 重新执行时从已提交批次之后继续
pub fn is_allowed(from: JobState, to: JobState) -> bool {
    use JobState::*;
    match (from, to) {
        (_, Cancelled) => from.is_pre_import() || from == Paused,
        (Created, Analyzing) => true,
        (Analyzing, Mapping) | (Analyzing, Created) => true,
        (Mapping, Analyzing) | (Mapping, Validating) => true,
        (Validating, Ready) | (Validating, Mapping) => true,
        (Ready, Analyzing) | (Ready, Mapping) | (Ready, Validating) | (Ready, Importing) => true,
        (Importing, Paused)
        | (Importing, Completed)
        | (Importing, CompletedWithErrors)
        | (Importing, Failed) => true,
        (Paused, Importing) => true,
        (Completed, Importing) | (CompletedWithErrors, Importing) | (RolledBack, Importing) => true,
        (Failed, Importing) => true,
        (Completed, RolledBack)
        | (CompletedWithErrors, RolledBack)
        | (Failed, RolledBack)
        | (Cancelled, RolledBack) => true,
        _ => false,
    }
}

/// 一次已生效的状态转换
#[derive(Debug, Clone)]
pub struct JobTransition {
    pub job_id: String,
    pub tenant_id: String,
    pub from: JobState,
    pub to: JobState,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

// ==========================================
// JobTransitionListener Trait
// ==========================================
// 在事件发布之前同步调用；监听器不可修改作业
pub trait JobTransitionListener: Send + Sync {
    fn on_transition(&self, transition: &JobTransition);
}

// ==========================================
// JobStateMachine
// ==========================================
pub struct JobStateMachine {
    jobs: Arc<ImportJobRepository>,
    listeners: Vec<Arc<dyn JobTransitionListener>>,
    publisher: OptionalEventPublisher,
}

impl JobStateMachine {
    pub fn new(jobs: Arc<ImportJobRepository>, publisher: OptionalEventPublisher) -> Self {
        Self {
            jobs,
            listeners: Vec::new(),
            publisher,
        }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn JobTransitionListener>) {
        self.listeners.push(listener);
    }

    pub fn publisher(&self) -> &OptionalEventPublisher {
        &self.publisher
    }

    /// 执行状态转换
    ///
    /// # 返回
    /// - Err(InvalidStateTransition): 转换表不允许，或并发修改导致当前状态已不是 job.state
    ///
    /// 成功后同步更新 job.state / failure_reason / updated_at
    pub fn transition(
        &self,
        job: &mut ImportJob,
        to: JobState,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> ImportResult<()> {
        let from = job.state;
        if !is_allowed(from, to) {
            return Err(ImportError::InvalidStateTransition { from, to });
        }

        if !self
            .jobs
            .compare_and_set_state(&job.job_id, from, to, reason, now)?
        {
            let current = self.jobs.get(&job.job_id)?.state;
            return Err(ImportError::InvalidStateTransition { from: current, to });
        }

        job.state = to;
        job.updated_at = now;
        if let Some(reason) = reason {
            job.failure_reason = Some(reason.to_string());
        }
        info!(job_id = %job.job_id, from = %from, to = %to, "作业状态转换");

        let transition = JobTransition {
            job_id: job.job_id.clone(),
            tenant_id: job.tenant_id.clone(),
            from,
            to,
            reason: reason.map(str::to_string),
            at: now,
        };
        for listener in &self.listeners {
            listener.on_transition(&transition);
        }
        self.publisher.publish(JobEvent::transition(
            &transition.job_id,
            &transition.tenant_id,
            from,
            to,
            transition.reason.clone(),
            now,
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_shared_connection;
    use crate::domain::job::JobOptions;
    use crate::engine::events::RecordingEventPublisher;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    #[derive(Default)]
    struct CollectingListener {
        seen: Mutex<Vec<(JobState, JobState)>>,
    }

    impl JobTransitionListener for CollectingListener {
        fn on_transition(&self, transition: &JobTransition) {
            self.seen.lock().unwrap().push((transition.from, transition.to));
        }
    }

    #[test]
    fn test_transition_table() {
        assert!(is_allowed(JobState::Created, JobState::Analyzing));
        assert!(is_allowed(JobState::Ready, JobState::Importing));
        assert!(is_allowed(JobState::Importing, JobState::Paused));
        assert!(is_allowed(JobState::Paused, JobState::Cancelled));
        assert!(is_allowed(JobState::Mapping, JobState::Cancelled));
        assert!(is_allowed(JobState::Completed, JobState::RolledBack));

        assert!(!is_allowed(JobState::Importing, JobState::Cancelled));
        assert!(!is_allowed(JobState::Created, JobState::Importing));
        assert!(!is_allowed(JobState::RolledBack, JobState::RolledBack));
        assert!(!is_allowed(JobState::Completed, JobState::Cancelled));
    }

    #[test]
    fn test_transition_persists_and_notifies() {
        let temp = NamedTempFile::new().unwrap();
        let conn = open_shared_connection(temp.path().to_str().unwrap()).unwrap();
        let jobs = Arc::new(ImportJobRepository::new(conn).unwrap());
        let recorder = Arc::new(RecordingEventPublisher::new());
        let listener = Arc::new(CollectingListener::default());

        let mut machine =
            JobStateMachine::new(jobs.clone(), OptionalEventPublisher::with_publisher(recorder.clone()));
        machine.add_listener(listener.clone());

        let mut job = ImportJob::new("J1".to_string(), "T1", "legacy", "case", JobOptions::default(), Utc::now());
        jobs.insert(&job).unwrap();

        machine.transition(&mut job, JobState::Analyzing, None, Utc::now()).unwrap();
        assert_eq!(job.state, JobState::Analyzing);
        assert_eq!(jobs.get("J1").unwrap().state, JobState::Analyzing);
        assert_eq!(listener.seen.lock().unwrap().as_slice(), &[(JobState::Created, JobState::Analyzing)]);
        assert_eq!(recorder.events().len(), 1);

        let err = machine.transition(&mut job, JobState::Completed, None, Utc::now());
        assert!(matches!(err, Err(ImportError::InvalidStateTransition { .. })));
    }

    #[test]
    fn test_stale_job_is_rejected() {
        let temp = NamedTempFile::new().unwrap();
        let conn = open_shared_connection(temp.path().to_str().unwrap()).unwrap();
        let jobs = Arc::new(ImportJobRepository::new(conn).unwrap());
        let machine = JobStateMachine::new(jobs.clone(), OptionalEventPublisher::none());

        let mut job = ImportJob::new("J1".to_string(), "T1", "legacy", "case", JobOptions::default(), Utc::now());
        jobs.insert(&job).unwrap();
        let mut stale = job.clone();

        machine.transition(&mut job, JobState::Analyzing, None, Utc::now()).unwrap();
        let err = machine.transition(&mut stale, JobState::Cancelled, None, Utc::now());
        assert!(matches!(
            err,
            Err(ImportError::InvalidStateTransition { from: JobState::Analyzing, .. })
        ));
    }
}
