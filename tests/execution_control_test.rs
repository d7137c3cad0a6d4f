// ==========================================
// 执行控制测试
// ==========================================
// 测试目标:
// - 错误处理策略（SKIP 隔离 / STOP 终止 / 畸形行计为失败）
// - 暂停 / 恢复 / 取消
// - 试运行不写入
// - 租户并发与租户隔离
// - I/O 超时
// ==========================================


use data_migration_engine::api::ApiError;
use data_migration_engine::config::ImportSettings;
use data_migration_engine::domain::{
    ErrorHandlingMode, ExecuteOptions, JobOptions, JobState, RecordAction,
};
use data_migration_engine::engine::IMPORT_ERROR_CODE;
use data_migration_engine::importer::issue_codes;
use data_migration_engine::repository::TargetRecordStore;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{
    case_csv, create_test_env, create_test_env_with, create_test_env_with_slow_blobs,
    execute_and_wait, prepare_ready_job, slow_commits, FailingRecordStore, SLOW_COMMIT,
};

fn small_batches() -> ImportSettings {
    ImportSettings {
        batch_size: 2,
        retry_backoff_ms: 1,
        ..ImportSettings::default()
    }
}

fn short_timeout() -> ImportSettings {
    ImportSettings {
        io_timeout_ms: 50,
        ..small_batches()
    }
}

fn fail_c00003(inner: Arc<data_migration_engine::repository::SqliteTargetStore>) -> Arc<dyn TargetRecordStore> {
    Arc::new(FailingRecordStore::new(inner, &["C00003"]))
}

#[tokio::test]
async fn test_skip_and_continue_isolates_failing_record() {
    println!("\n=== 测试 SKIP 策略隔离失败记录 ===\n");
    let env = create_test_env_with(small_batches(), Some(fail_c00003)).await;
    let job_id = prepare_ready_job(
        &env,
        "T1",
        "crm",
        "cases.csv",
        &case_csv(6, "Case"),
        JobOptions::default(),
    )
    .await;

    let outcome = execute_and_wait(&env, &job_id).await;
    assert_eq!(outcome.state, JobState::CompletedWithErrors);
    assert_eq!(outcome.counts.imported, 5);
    assert_eq!(outcome.counts.failed, 1);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].source_record_id, "C00003");
    assert_eq!(outcome.failures[0].row_number, 3);
    println!("✓ 失败记录被隔离，同批次其他记录已提交");

    let stored = env.stored_cases("T1");
    assert_eq!(stored.len(), 5);
    assert!(stored.iter().all(|r| r.source_record_id != "C00003"));

    let report = env.api.get_report(&job_id).unwrap();
    let digest = report
        .error_digest
        .iter()
        .find(|d| d.code == IMPORT_ERROR_CODE)
        .expect("错误摘要应包含执行期失败");
    assert_eq!(digest.count, 1);
    assert_eq!(digest.first_row, Some(3));
}

#[tokio::test]
async fn test_stop_on_error_fails_job() {
    let env = create_test_env_with(small_batches(), Some(fail_c00003)).await;
    let options = JobOptions {
        error_handling: ErrorHandlingMode::StopOnError,
        ..JobOptions::default()
    };
    let job_id = prepare_ready_job(&env, "T1", "crm", "cases.csv", &case_csv(6, "Case"), options).await;

    let outcome = execute_and_wait(&env, &job_id).await;
    assert_eq!(outcome.state, JobState::Failed);
    assert!(outcome.failure_reason.is_some());

    // 失败批次整体未提交
    let stored = env.stored_cases("T1");
    assert!(stored.iter().all(|r| r.source_record_id != "C00003"));
    assert!(stored.iter().all(|r| r.source_record_id != "C00004"));
    let job = env.api.get_job(&job_id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.failure_reason.is_some());

    // 以 SKIP 策略重新执行，从已提交批次之后继续
    let handle = env
        .api
        .execute(
            &job_id,
            ExecuteOptions {
                dry_run: false,
                error_handling: Some(ErrorHandlingMode::SkipAndContinue),
            },
        )
        .await
        .unwrap();
    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.state, JobState::CompletedWithErrors);
    assert_eq!(env.stored_cases("T1").len(), 5);
}

#[tokio::test]
async fn test_malformed_rows_counted_as_failed() {
    let env = create_test_env().await;
    env.blobs
        .put(
            "ragged.csv",
            b"case_id,title\nC1,Alpha\nC2,Beta,unexpected\nC3,Gamma\n".to_vec(),
        )
        .unwrap();
    let job_id = env
        .api
        .create_job("T1", "crm", "case", JobOptions::default())
        .await
        .unwrap();
    let analysis = env.api.submit_file(&job_id, "ragged.csv", None).await.unwrap();
    assert_eq!(analysis.record_count, 2);
    assert_eq!(analysis.parse_error_count, 1);

    let mapping = env.api.propose_mapping(&job_id).await.unwrap();
    env.api.confirm_mapping(&job_id, mapping).await.unwrap();
    let report = env.api.validate(&job_id).await.unwrap();
    assert_eq!(report.error_count, 0);
    assert!(report
        .issues
        .iter()
        .any(|i| i.code == issue_codes::MALFORMED_ROW && i.row_number == Some(2)));

    let outcome = execute_and_wait(&env, &job_id).await;
    assert_eq!(outcome.state, JobState::CompletedWithErrors);
    assert_eq!(outcome.counts.imported, 2);
    assert_eq!(outcome.counts.failed, 1);
}

#[tokio::test]
async fn test_pause_then_resume_completes_without_duplicates() {
    println!("\n=== 测试暂停与恢复 ===\n");
    let env = create_test_env_with(small_batches(), None).await;
    let job_id = prepare_ready_job(
        &env,
        "T1",
        "crm",
        "cases.csv",
        &case_csv(10, "Case"),
        JobOptions::default(),
    )
    .await;

    let handle = env
        .api
        .execute(&job_id, ExecuteOptions::default())
        .await
        .unwrap();
    env.api.pause(&job_id).unwrap();
    let paused = handle.wait().await.unwrap();
    assert_eq!(paused.state, JobState::Paused);
    assert!(paused.counts.imported < 10);
    assert_eq!(env.api.get_progress(&job_id).unwrap().state, Some(JobState::Paused));
    println!("✓ 已暂停，已导入 {} 条", paused.counts.imported);

    // 暂停状态不可直接执行，只能恢复
    assert!(env.api.execute(&job_id, ExecuteOptions::default()).await.is_err());

    let resumed = env.api.resume(&job_id).await.unwrap().wait().await.unwrap();
    assert_eq!(resumed.state, JobState::Completed);
    assert_eq!(env.stored_cases("T1").len(), 10);
    assert_eq!(env.ledger.count_active(&job_id).unwrap(), 10);
    println!("✓ 恢复后完成，共 10 条");
}

#[tokio::test]
async fn test_cancel_during_import_stops_at_batch_boundary() {
    let env = create_test_env_with(small_batches(), None).await;
    let job_id = prepare_ready_job(
        &env,
        "T1",
        "crm",
        "cases.csv",
        &case_csv(10, "Case"),
        JobOptions::default(),
    )
    .await;

    let handle = env
        .api
        .execute(&job_id, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(env.api.cancel(&job_id).unwrap(), JobState::Importing);

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.state, JobState::Cancelled);
    assert!(env.stored_cases("T1").len() < 10);
    assert_eq!(env.api.get_job(&job_id).unwrap().state, JobState::Cancelled);
    assert!(env.api.resume(&job_id).await.is_err());
}

#[tokio::test]
async fn test_dry_run_previews_without_writing() {
    let env = create_test_env().await;
    let job_id = prepare_ready_job(
        &env,
        "T1",
        "crm",
        "cases.csv",
        &case_csv(4, "Case"),
        JobOptions::default(),
    )
    .await;

    let outcome = env
        .api
        .execute(
            &job_id,
            ExecuteOptions {
                dry_run: true,
                error_handling: None,
            },
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert!(outcome.dry_run);
    assert_eq!(outcome.dry_run_records.len(), 4);
    assert!(outcome
        .dry_run_records
        .iter()
        .all(|r| r.action == RecordAction::Created && r.before.is_none()));
    assert_eq!(outcome.dry_run_records[0].row_number, 1);
    assert!(env.stored_cases("T1").is_empty());
    assert_eq!(env.ledger.count_active(&job_id).unwrap(), 0);
    assert_eq!(env.api.get_job(&job_id).unwrap().state, JobState::Ready);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tenants_run_concurrently_and_stay_isolated() {
    let settings = ImportSettings {
        tenant_job_concurrency: 1,
        batch_size: 3,
        ..ImportSettings::default()
    };
    let env = create_test_env_with(settings, None).await;
    let csv = case_csv(12, "Case");

    let t1_a = prepare_ready_job(&env, "T1", "crm", "t1a.csv", &csv, JobOptions::default()).await;
    let t1_b = prepare_ready_job(&env, "T1", "erp", "t1b.csv", &csv, JobOptions::default()).await;
    let t2 = prepare_ready_job(&env, "T2", "crm", "t2.csv", &csv, JobOptions::default()).await;

    let mut handles = Vec::new();
    for job_id in [&t1_a, &t1_b, &t2] {
        handles.push(
            env.api
                .execute(job_id, ExecuteOptions::default())
                .await
                .unwrap(),
        );
    }
    let outcomes = futures::future::join_all(handles.into_iter().map(|h| h.wait())).await;
    for outcome in outcomes {
        let outcome = outcome.unwrap();
        assert_eq!(outcome.state, JobState::Completed);
        assert_eq!(outcome.counts.imported, 12);
    }

    // 同一源记录 ID 在不同租户/源系统下是不同实体
    let t1 = env.stored_cases("T1");
    let t2_records = env.stored_cases("T2");
    assert_eq!(t1.len(), 24);
    assert_eq!(t2_records.len(), 12);
    let t1_crm = t1
        .iter()
        .find(|r| r.source_record_id == "C00001" && r.source_system == "crm")
        .unwrap();
    assert_ne!(t1_crm.entity_id, t2_records[0].entity_id);
}

#[tokio::test]
async fn test_commit_timeout_fails_job_without_landing() {
    println!("\n=== 测试提交超时 ===\n");
    let env = create_test_env_with(short_timeout(), Some(slow_commits)).await;
    let job_id = prepare_ready_job(
        &env,
        "T1",
        "crm",
        "cases.csv",
        &case_csv(4, "Case"),
        JobOptions::default(),
    )
    .await;

    let outcome = execute_and_wait(&env, &job_id).await;
    assert_eq!(outcome.state, JobState::Failed);
    let reason = outcome.failure_reason.expect("超时应记录失败原因");
    assert!(reason.contains("超时"), "{}", reason);
    assert_eq!(outcome.counts.imported, 0);
    println!("✓ 提交超时使作业失败: {}", reason);

    let report = env.api.get_report(&job_id).unwrap();
    assert_eq!(report.job.state, JobState::Failed);
    assert!(report
        .job
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.contains("超时")));

    // 被放弃的提交在存储端醒来后不落库
    tokio::time::sleep(SLOW_COMMIT + Duration::from_millis(200)).await;
    assert!(env.stored_cases("T1").is_empty());
    assert!(env.ledger.committed_batches(&job_id).unwrap().is_empty());
    println!("✓ 超时批次未提交");
}

#[tokio::test]
async fn test_blob_read_timeout_returns_job_to_created() {
    let env = create_test_env_with_slow_blobs(short_timeout(), Duration::from_millis(300)).await;
    env.blobs
        .put("cases.csv", case_csv(2, "Case").into_bytes())
        .unwrap();
    let job_id = env
        .api
        .create_job("T1", "crm", "case", JobOptions::default())
        .await
        .unwrap();

    let result = env.api.submit_file(&job_id, "cases.csv", None).await;
    assert!(matches!(result, Err(ApiError::Timeout(_))), "{:?}", result);

    let job = env.api.get_job(&job_id).unwrap();
    assert_eq!(job.state, JobState::Created);
    assert!(job.analysis.is_none());
}
