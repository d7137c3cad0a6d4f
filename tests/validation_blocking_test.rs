// ==========================================
// 校验阻断测试
// ==========================================
// 测试目标: 错误级问题阻断执行，修正源文件后可重新校验放行
// ==========================================


use data_migration_engine::api::ApiError;
use data_migration_engine::domain::{ExecuteOptions, JobOptions, JobState, Severity};
use data_migration_engine::importer::issue_codes;
use std::collections::HashSet;
use test_helpers::{create_test_env, execute_and_wait};

const TOTAL_ROWS: usize = 10_000;

/// 生成 10000 行 CSV，指定行缺少必填 title
fn csv_with_missing_titles(missing_rows: &HashSet<usize>) -> String {
    let mut csv = String::from("case_id,title,category\n");
    for i in 1..=TOTAL_ROWS {
        let title = if missing_rows.contains(&i) {
            String::new()
        } else {
            format!("Case {}", i)
        };
        csv.push_str(&format!("C{:05},{},Theft\n", i, title));
    }
    csv
}

#[tokio::test]
async fn test_missing_required_blocks_execute_until_source_fixed() {
    println!("\n=== 测试必填缺失阻断执行 ===\n");
    let env = create_test_env().await;
    let missing: HashSet<usize> = (1..=12).map(|i| i * 700).collect();

    env.blobs
        .put("cases.csv", csv_with_missing_titles(&missing).into_bytes())
        .unwrap();
    let job_id = env
        .api
        .create_job("T1", "legacy_crm", "case", JobOptions::default())
        .await
        .unwrap();
    let analysis = env.api.submit_file(&job_id, "cases.csv", None).await.unwrap();
    assert_eq!(analysis.record_count, TOTAL_ROWS);

    let mapping = env.api.propose_mapping(&job_id).await.unwrap();
    env.api.confirm_mapping(&job_id, mapping).await.unwrap();

    // 步骤 1: 首次校验
    let report = env.api.validate(&job_id).await.unwrap();
    assert_eq!(report.error_count, 12);
    assert_eq!(report.records_checked, TOTAL_ROWS);
    let flagged: HashSet<usize> = report
        .issues
        .iter()
        .filter(|i| i.severity == Severity::Error)
        .inspect(|i| {
            assert_eq!(i.code, issue_codes::REQUIRED_MISSING);
            assert_eq!(i.field.as_deref(), Some("title"));
            assert!(i.suggested_fix.is_some());
        })
        .filter_map(|i| i.row_number)
        .collect();
    assert_eq!(flagged, missing);
    assert_eq!(env.api.get_job(&job_id).unwrap().state, JobState::Mapping);
    println!("✓ 步骤 1: 校验发现 {} 个错误", report.error_count);

    // 步骤 2: 执行被阻断，且未写入任何数据
    let err = env
        .api
        .execute(&job_id, ExecuteOptions::default())
        .await
        .err()
        .expect("存在错误时执行应被拒绝");
    match &err {
        ApiError::ValidationBlocked { error_count } => assert_eq!(*error_count, 12),
        other => panic!("Expected ValidationBlocked, got {:?}", other),
    }
    let detail = err.detail();
    assert_eq!(detail.code, "VALIDATION_BLOCKED");
    assert!(detail.suggested_fix.is_some());
    assert!(env.stored_cases("T1").is_empty());
    println!("✓ 步骤 2: 执行被阻断");

    // 步骤 3: 修正源文件后重新校验
    env.blobs
        .put("cases.csv", csv_with_missing_titles(&HashSet::new()).into_bytes())
        .unwrap();
    let report = env.api.validate(&job_id).await.unwrap();
    assert_eq!(report.error_count, 0);
    assert!(env.api.list_issues(&job_id).unwrap().iter().all(|i| i.severity != Severity::Error));
    assert_eq!(env.api.get_job(&job_id).unwrap().state, JobState::Ready);
    println!("✓ 步骤 3: 重新校验通过");

    let outcome = execute_and_wait(&env, &job_id).await;
    assert_eq!(outcome.state, JobState::Completed);
    assert_eq!(outcome.counts.imported, TOTAL_ROWS);
    assert_eq!(env.stored_cases("T1").len(), TOTAL_ROWS);
    println!("✓ 步骤 4: 导入 {} 条", outcome.counts.imported);
}

#[tokio::test]
async fn test_unmapped_required_field_is_mapping_incomplete() {
    let env = create_test_env().await;
    env.blobs
        .put("partial.csv", b"case_id,notes\nC1,hello\n".to_vec())
        .unwrap();
    let job_id = env
        .api
        .create_job("T1", "legacy_crm", "case", JobOptions::default())
        .await
        .unwrap();
    env.api.submit_file(&job_id, "partial.csv", None).await.unwrap();
    let mapping = env.api.propose_mapping(&job_id).await.unwrap();
    env.api.confirm_mapping(&job_id, mapping).await.unwrap();

    match env.api.validate(&job_id).await {
        Err(ApiError::MappingIncomplete { fields }) => assert_eq!(fields, vec!["title".to_string()]),
        other => panic!("Expected MappingIncomplete, got {:?}", other),
    }
    assert_eq!(env.api.get_job(&job_id).unwrap().state, JobState::Mapping);
}

#[tokio::test]
async fn test_in_file_duplicates_block_non_incremental_job() {
    let env = create_test_env().await;
    env.blobs
        .put(
            "dupes.csv",
            b"case_id,title\nC1,Alpha\nC2,Beta\nC1,Alpha again\n".to_vec(),
        )
        .unwrap();
    let job_id = env
        .api
        .create_job("T1", "legacy_crm", "case", JobOptions::default())
        .await
        .unwrap();
    env.api.submit_file(&job_id, "dupes.csv", None).await.unwrap();
    let mapping = env.api.propose_mapping(&job_id).await.unwrap();
    env.api.confirm_mapping(&job_id, mapping).await.unwrap();

    let report = env.api.validate(&job_id).await.unwrap();
    let duplicate = report
        .issues
        .iter()
        .find(|i| i.code == issue_codes::DUPLICATE_RECORD)
        .expect("应报告重复记录");
    assert_eq!(duplicate.severity, Severity::Error);
    assert_eq!(duplicate.row_number, Some(3));

    // 问题可标记为已处理，但不改变阻断结果
    env.api.resolve_issue(&job_id, &duplicate.issue_id).unwrap();
    let issues = env.api.list_issues(&job_id).unwrap();
    assert!(issues.iter().any(|i| i.issue_id == duplicate.issue_id && i.resolved));
    assert!(matches!(
        env.api.execute(&job_id, ExecuteOptions::default()).await,
        Err(ApiError::ValidationBlocked { .. })
    ));
}
