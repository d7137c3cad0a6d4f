// ==========================================
// 导入流水线端到端测试
// ==========================================
// 测试目标: 分析 → 映射 → 规则 → 校验 → 预览 → 执行 → 报告 完整链路
// ==========================================


use data_migration_engine::domain::{
    JobOptions, JobState, MappingStatus, PreviewSelection, Severity, TransformationRule,
};
use data_migration_engine::engine::JobEventType;
use data_migration_engine::importer::issue_codes;
use serde_json::json;
use test_helpers::{create_test_env, execute_and_wait, prepare_ready_job};

/// 日期规则: 合法值转为 ISO-8601，非法值置空并产生 transformation_failed 问题
#[tokio::test]
async fn test_date_rule_converts_and_flags_malformed_value() {
    println!("\n=== 测试日期转换规则 ===\n");
    let env = create_test_env().await;

    env.blobs
        .put(
            "reports.csv",
            b"case_id,title,Report_Date\nC1,Alpha,01/15/2024\nC2,Beta,13/40/2024\n".to_vec(),
        )
        .unwrap();
    let job_id = env
        .api
        .create_job("T1", "legacy_crm", "case", JobOptions::default())
        .await
        .unwrap();
    let analysis = env.api.submit_file(&job_id, "reports.csv", None).await.unwrap();
    assert_eq!(analysis.record_count, 2);
    println!("✓ 文件分析完成: {} 行", analysis.record_count);

    let mapping = env.api.propose_mapping(&job_id).await.unwrap();
    let date_column = mapping.for_column("Report_Date").expect("应包含 Report_Date 列");
    assert_eq!(date_column.target_field.as_deref(), Some("report_date"));
    env.api.confirm_mapping(&job_id, mapping).await.unwrap();

    let rule_id = env
        .api
        .set_transformation_rule(
            &job_id,
            "report_date",
            TransformationRule::DateFormat {
                input_pattern: "MM/DD/YYYY".to_string(),
                with_time: false,
            },
        )
        .await
        .unwrap();
    println!("✓ 规则已登记: {}", rule_id);

    let preview = env
        .api
        .preview(&job_id, PreviewSelection::Sample(2))
        .await
        .unwrap();
    assert_eq!(preview.len(), 2);
    assert_eq!(preview[0].target.get("report_date"), Some(&json!("2024-01-15")));
    assert!(preview[1]
        .target
        .get("report_date")
        .map_or(true, |v| v.is_null()));

    // 可选字段的转换失败为警告，不阻断执行
    let report = env.api.validate(&job_id).await.unwrap();
    assert_eq!(report.error_count, 0);
    let failure = report
        .issues
        .iter()
        .find(|i| i.code == issue_codes::TRANSFORMATION_FAILED)
        .expect("应产生 transformation_failed 问题");
    assert_eq!(failure.row_number, Some(2));
    assert_eq!(failure.field.as_deref(), Some("report_date"));
    assert_eq!(failure.severity, Severity::Warning);
    assert_eq!(failure.source_value.as_deref(), Some("13/40/2024"));
    assert_eq!(env.api.get_job(&job_id).unwrap().state, JobState::Ready);
    println!("✓ 校验通过，警告 {} 个", report.warning_count);

    let outcome = execute_and_wait(&env, &job_id).await;
    assert_eq!(outcome.state, JobState::Completed);
    assert_eq!(outcome.counts.imported, 2);

    let stored = env.stored_cases("T1");
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].source_record_id, "C1");
    assert_eq!(stored[0].payload["report_date"], json!("2024-01-15"));
    assert!(stored[1]
        .payload
        .get("report_date")
        .map_or(true, |v| v.is_null()));
    println!("✓ 目标数据已写入");
}

/// 枚举列: 值模式命中目标枚举即可自动接受，值映射建议归一到目标取值
#[tokio::test]
async fn test_enum_column_auto_accepted_and_value_map_proposed() {
    let env = create_test_env().await;
    env.blobs
        .put(
            "incidents.csv",
            b"case_id,title,Incident_Type\nC1,Alpha,Harassment\nC2,Beta,Theft\nC3,Gamma,Theft\n"
                .to_vec(),
        )
        .unwrap();
    let job_id = env
        .api
        .create_job("T1", "legacy_crm", "case", JobOptions::default())
        .await
        .unwrap();
    env.api.submit_file(&job_id, "incidents.csv", None).await.unwrap();

    let mapping = env.api.propose_mapping(&job_id).await.unwrap();
    let column = mapping.for_column("Incident_Type").unwrap();
    assert_eq!(column.target_field.as_deref(), Some("category"));
    assert!(column.confidence >= 0.85, "置信度过低: {}", column.confidence);
    assert_eq!(column.status, MappingStatus::AutoAccepted);
    env.api.confirm_mapping(&job_id, mapping).await.unwrap();

    let value_map = env.api.propose_value_map(&job_id, "category").await.unwrap();
    assert_eq!(value_map.lookup("Harassment"), Some(&json!("HARASSMENT")));
    assert_eq!(value_map.lookup("Theft"), Some(&json!("THEFT")));
    env.api
        .confirm_value_map(&job_id, "category", value_map.clone())
        .await
        .unwrap();

    // 已确认的值映射不被重新建议覆盖
    let again = env.api.propose_value_map(&job_id, "category").await.unwrap();
    assert_eq!(again, value_map);

    env.api.validate(&job_id).await.unwrap();
    let outcome = execute_and_wait(&env, &job_id).await;
    assert_eq!(outcome.counts.imported, 3);
    let stored = env.stored_cases("T1");
    assert_eq!(stored[0].payload["category"], json!("HARASSMENT"));
    assert_eq!(stored[2].payload["category"], json!("THEFT"));
}

/// 模板: 保存后同租户同源系统的新作业直接命中模板
#[tokio::test]
async fn test_saved_template_short_circuits_next_job() {
    let env = create_test_env().await;
    let csv = "case_id,title,category\nC1,Alpha,Theft\n";
    let first = prepare_ready_job(&env, "T1", "helpdesk", "a.csv", csv, JobOptions::default()).await;

    let template = env.api.save_template(&first, "helpdesk cases").unwrap();
    assert_eq!(template.version, 1);
    assert!(env.api.save_template(&first, "  ").is_err());

    env.blobs.put("b.csv", csv.as_bytes().to_vec()).unwrap();
    let second = env
        .api
        .create_job("T1", "helpdesk", "case", JobOptions::default())
        .await
        .unwrap();
    env.api.submit_file(&second, "b.csv", None).await.unwrap();
    let mapping = env.api.propose_mapping(&second).await.unwrap();

    for entry in &template.entries {
        let column = mapping.for_column(&entry.source_column).unwrap();
        assert_eq!(column.status, MappingStatus::FromTemplate);
        assert_eq!(column.target_field.as_deref(), Some(entry.target_field.as_str()));
    }
    let job = env.api.get_job(&second).unwrap();
    assert_eq!(job.template, Some(template.reference()));

    // 再次保存产生新版本，旧版本保持不变
    let v2 = env.api.save_template(&second, "helpdesk cases").unwrap();
    assert_eq!(v2.template_id, template.template_id);
    assert_eq!(v2.version, 2);
    assert_eq!(env.api.list_templates("T1").unwrap().len(), 2);
}

/// 报告与事件: 状态转换按顺序发布，报告包含映射与回滚可用性
#[tokio::test]
async fn test_report_and_events_after_completion() {
    let env = create_test_env().await;
    let csv = test_helpers::case_csv(5, "Case");
    let job_id = prepare_ready_job(&env, "T1", "auto", "cases.csv", &csv, JobOptions::default()).await;

    let outcome = execute_and_wait(&env, &job_id).await;
    assert_eq!(outcome.state, JobState::Completed);
    assert!(outcome.rollback_available);

    let report = env.api.get_report(&job_id).unwrap();
    assert_eq!(report.job.counts.imported, 5);
    assert!(report.mapping.is_some());
    assert!(report.rollback_available);
    assert!(report.restore_point.is_some());
    assert_eq!(report.validation_errors, 0);

    let progress = env.api.get_progress(&job_id).unwrap();
    assert_eq!(progress.processed, 5);
    assert_eq!(progress.state, Some(JobState::Completed));

    let events = env.recorder.events();
    let transitions: Vec<JobState> = events.iter().filter_map(|e| e.to).collect();
    assert_eq!(transitions.first(), Some(&JobState::Analyzing));
    assert_eq!(transitions.last(), Some(&JobState::Completed));
    assert!(events
        .iter()
        .any(|e| e.event_type == JobEventType::ExecutionFinished));

    // 源系统自动识别结果写回作业
    let job = env.api.get_job(&job_id).unwrap();
    assert_ne!(job.source_system, "auto");
    assert_eq!(env.api.list_jobs("T1").unwrap().len(), 1);
}
