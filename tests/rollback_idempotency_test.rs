// ==========================================
// 幂等性与回滚测试
// ==========================================
// 测试目标:
// - 同一作业重复执行不产生重复实体/链接
// - 导入 + 回滚 后目标数据与导入前逐字节一致
// - 过期还原点阻止回滚且数据不变
// - 导入后被独立修改的记录按策略处理
// ==========================================


use chrono::Duration;
use data_migration_engine::api::ApiError;
use data_migration_engine::domain::{
    JobOptions, JobState, ModificationPolicy, RestorePointStatus, RollbackScope,
};
use serde_json::json;
use test_helpers::{case_csv, create_test_env, execute_and_wait, prepare_ready_job};

#[tokio::test]
async fn test_rerun_is_idempotent() {
    println!("\n=== 测试重复执行幂等 ===\n");
    let env = create_test_env().await;
    let csv = case_csv(25, "Case");
    let job_id = prepare_ready_job(&env, "T1", "crm", "cases.csv", &csv, JobOptions::default()).await;

    let first = execute_and_wait(&env, &job_id).await;
    assert_eq!(first.counts.imported, 25);
    let snapshot = env.stored_cases("T1");
    println!("✓ 首次执行导入 {} 条", first.counts.imported);

    let second = execute_and_wait(&env, &job_id).await;
    assert_eq!(second.state, JobState::Completed);
    assert_eq!(second.counts.imported, 0);
    assert_eq!(second.counts.skipped, 25);
    assert_eq!(env.stored_cases("T1"), snapshot);
    assert_eq!(env.ledger.count_active(&job_id).unwrap(), 25);
    println!("✓ 重复执行全部跳过，无新增实体与链接");

    // 另一个作业导入相同源记录同样不产生重复实体
    let other = prepare_ready_job(&env, "T1", "crm", "again.csv", &csv, JobOptions::default()).await;
    let outcome = execute_and_wait(&env, &other).await;
    assert_eq!(outcome.counts.imported, 0);
    assert_eq!(env.stored_cases("T1").len(), 25);
}

#[tokio::test]
async fn test_incremental_import_then_rollback_restores_previous_state() {
    let env = create_test_env().await;
    let base = "case_id,title\nC1,Alpha\nC2,Beta\nC3,Gamma\n";
    let job_a = prepare_ready_job(&env, "T1", "crm", "base.csv", base, JobOptions::default()).await;
    execute_and_wait(&env, &job_a).await;
    let before = env.stored_cases("T1");
    assert_eq!(before.len(), 3);

    let delta = "case_id,title\nC1,Alpha (edited)\nC2,Beta\nC4,Delta\n";
    let options = JobOptions {
        incremental: true,
        ..JobOptions::default()
    };
    let job_b = prepare_ready_job(&env, "T1", "crm", "delta.csv", delta, options).await;
    let outcome = execute_and_wait(&env, &job_b).await;
    assert_eq!(outcome.counts.updated, 1);
    assert_eq!(outcome.counts.imported, 1);
    let after_import = env.stored_cases("T1");
    assert_eq!(after_import.len(), 4);
    assert_eq!(after_import[0].payload["title"], json!("Alpha (edited)"));

    let result = env
        .api
        .rollback(&job_b, None, ModificationPolicy::default())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(result.complete);
    assert_eq!(result.deleted, 1);
    assert_eq!(result.restored, 1);
    assert_eq!(result.restore_point_status, RestorePointStatus::Used);

    // 内容与哈希均与导入前一致
    assert_eq!(env.stored_cases("T1"), before);
    assert_eq!(env.api.get_job(&job_b).unwrap().state, JobState::RolledBack);
    assert!(!env.api.get_report(&job_b).unwrap().rollback_available);

    // 还原点已使用，不可再次回滚
    let again = env
        .api
        .rollback(&job_b, None, ModificationPolicy::default())
        .unwrap()
        .wait()
        .await;
    assert!(matches!(again, Err(ApiError::RollbackBlocked(_))));
}

#[tokio::test]
async fn test_expired_restore_point_blocks_rollback() {
    let env = create_test_env().await;
    let job_id = prepare_ready_job(
        &env,
        "T1",
        "crm",
        "cases.csv",
        &case_csv(3, "Case"),
        JobOptions::default(),
    )
    .await;
    execute_and_wait(&env, &job_id).await;
    let before = env.stored_cases("T1");

    // 默认保留 7 天
    env.clock.advance(Duration::days(8));
    assert!(!env.api.get_report(&job_id).unwrap().rollback_available);

    let err = env
        .api
        .rollback(&job_id, None, ModificationPolicy::default())
        .unwrap()
        .wait()
        .await
        .err()
        .expect("过期还原点应阻止回滚");
    assert!(matches!(err, ApiError::RollbackBlocked(_)));
    assert_eq!(err.detail().code, "ROLLBACK_BLOCKED");

    assert_eq!(env.stored_cases("T1"), before);
    assert_eq!(env.api.get_job(&job_id).unwrap().state, JobState::Completed);
}

#[tokio::test]
async fn test_expire_restore_points_sweep() {
    let env = create_test_env().await;
    let job_id = prepare_ready_job(
        &env,
        "T1",
        "crm",
        "cases.csv",
        &case_csv(2, "Case"),
        JobOptions::default(),
    )
    .await;
    execute_and_wait(&env, &job_id).await;

    assert_eq!(env.api.expire_restore_points().unwrap(), 0);
    env.clock.advance(Duration::days(30));
    assert_eq!(env.api.expire_restore_points().unwrap(), 1);
    let restore_point = env.api.get_report(&job_id).unwrap().restore_point.unwrap();
    assert_eq!(restore_point.status, RestorePointStatus::Expired);
}

#[tokio::test]
async fn test_modified_records_follow_policy() {
    let env = create_test_env().await;
    let job_id = prepare_ready_job(
        &env,
        "T1",
        "crm",
        "cases.csv",
        &case_csv(3, "Case"),
        JobOptions::default(),
    )
    .await;
    execute_and_wait(&env, &job_id).await;

    let modified = env
        .stored_cases("T1")
        .into_iter()
        .find(|r| r.source_record_id == "C00002")
        .unwrap();
    env.store
        .update_payload(
            &modified.entity_id,
            &json!({"case_id": "C00002", "title": "edited in target"}),
        )
        .unwrap();

    // Block: 整体拒绝，数据不变
    let blocked = env
        .api
        .rollback(&job_id, None, ModificationPolicy::Block)
        .unwrap()
        .wait()
        .await;
    assert!(matches!(blocked, Err(ApiError::RollbackBlocked(_))));
    assert_eq!(env.stored_cases("T1").len(), 3);

    // ExcludeAndWarn: 部分回滚，还原点保持可用
    let partial = env
        .api
        .rollback(&job_id, None, ModificationPolicy::ExcludeAndWarn)
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(!partial.complete);
    assert_eq!(partial.deleted, 2);
    assert_eq!(partial.excluded.len(), 1);
    assert_eq!(partial.excluded[0].source_record_id, "C00002");
    assert_eq!(partial.restore_point_status, RestorePointStatus::Active);
    let remaining = env.stored_cases("T1");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].payload["title"], json!("edited in target"));
    assert_eq!(env.api.get_job(&job_id).unwrap().state, JobState::Completed);

    // Override: 显式覆盖后完成回滚
    let rest = env
        .api
        .rollback(&job_id, None, ModificationPolicy::Override)
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(rest.complete);
    assert!(env.stored_cases("T1").is_empty());
    assert_eq!(env.api.get_job(&job_id).unwrap().state, JobState::RolledBack);
}

#[tokio::test]
async fn test_partial_rollback_by_row_range() {
    let env = create_test_env().await;
    let job_id = prepare_ready_job(
        &env,
        "T1",
        "crm",
        "cases.csv",
        &case_csv(6, "Case"),
        JobOptions::default(),
    )
    .await;
    execute_and_wait(&env, &job_id).await;

    assert!(matches!(
        env.api
            .rollback(&job_id, Some(RollbackScope::RowRange { start: 5, end: 2 }), ModificationPolicy::default()),
        Err(ApiError::InvalidInput(_))
    ));

    let result = env
        .api
        .rollback(
            &job_id,
            Some(RollbackScope::RowRange { start: 2, end: 4 }),
            ModificationPolicy::default(),
        )
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(!result.complete);
    assert_eq!(result.deleted, 3);

    let ids: Vec<String> = env
        .stored_cases("T1")
        .into_iter()
        .map(|r| r.source_record_id)
        .collect();
    assert_eq!(ids, vec!["C00001", "C00005", "C00006"]);
    assert!(env.api.get_report(&job_id).unwrap().rollback_available);
}
