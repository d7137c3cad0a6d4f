// ==========================================
// 数据迁移导入引擎 - 命令行入口
// ==========================================
// 用途: 本地执行一次完整流水线（分析 → 映射 → 校验 → 执行）
// 用法:
//   data-migration-engine <schemas.json> <数据文件> <tenant_id> <entity_type> [--dry-run] [--db <路径>] [--json-log]
// 说明: 映射建议直接确认，存在错误级问题时打印问题并退出
// ==========================================

use anyhow::{anyhow, bail, Context};
use data_migration_engine::api::ImportApi;
use data_migration_engine::db::default_db_path;
use data_migration_engine::domain::{ExecuteOptions, JobOptions, Severity};
use data_migration_engine::engine::OptionalEventPublisher;
use data_migration_engine::repository::{FsBlobStore, StaticSchemaProvider};
use std::path::Path;
use std::sync::Arc;

struct CliArgs {
    schema_path: String,
    file_path: String,
    tenant_id: String,
    entity_type: String,
    dry_run: bool,
    db_path: Option<String>,
    json_log: bool,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut positional = Vec::new();
    let mut dry_run = false;
    let mut json_log = false;
    let mut db_path = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            "--json-log" => json_log = true,
            "--db" => {
                db_path = Some(args.next().ok_or_else(|| anyhow!("--db 缺少路径参数"))?);
            }
            _ => positional.push(arg),
        }
    }

    if positional.len() != 4 {
        bail!(
            "用法: data-migration-engine <schemas.json> <数据文件> <tenant_id> <entity_type> [--dry-run] [--db <路径>] [--json-log]"
        );
    }
    let mut positional = positional.into_iter();
    let mut next = || positional.next().unwrap_or_default();
    Ok(CliArgs {
        schema_path: next(),
        file_path: next(),
        tenant_id: next(),
        entity_type: next(),
        dry_run,
        db_path,
        json_log,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    data_migration_engine::logging::init_with_format(args.json_log);

    tracing::info!("==================================================");
    tracing::info!("{} v{}", data_migration_engine::APP_NAME, data_migration_engine::VERSION);
    tracing::info!("==================================================");

    let db_path = match args.db_path {
        Some(path) => path,
        None => {
            let path = default_db_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("无法创建数据目录: {}", parent.display()))?;
            }
            path.to_string_lossy().to_string()
        }
    };
    tracing::info!("使用数据库: {}", db_path);

    let file_path = Path::new(&args.file_path);
    let blob_root = file_path.parent().unwrap_or_else(|| Path::new("."));
    let blob_key = file_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("无效的数据文件路径: {}", args.file_path))?;

    let schemas = StaticSchemaProvider::from_json_file(&args.schema_path)
        .with_context(|| format!("无法加载目标模式: {}", args.schema_path))?;
    let api = ImportApi::open(
        &db_path,
        Arc::new(schemas),
        Arc::new(FsBlobStore::new(blob_root)),
        OptionalEventPublisher::none(),
    )
    .await?;

    let job_id = api
        .create_job(&args.tenant_id, "auto", &args.entity_type, JobOptions::default())
        .await?;
    println!("作业: {}", job_id);

    let analysis = api.submit_file(&job_id, &blob_key, None).await?;
    println!(
        "分析完成: {} 行, {} 列, 源系统 {}",
        analysis.record_count,
        analysis.profiles.len(),
        analysis.source_system.system
    );

    let proposed = api.propose_mapping(&job_id).await?;
    for column in &proposed.columns {
        println!(
            "  {} -> {} ({:.2}, {:?})",
            column.source_column,
            column.target_field.as_deref().unwrap_or("-"),
            column.confidence,
            column.status
        );
    }
    api.confirm_mapping(&job_id, proposed).await?;

    let report = api.validate(&job_id).await?;
    println!(
        "校验: {} 错误, {} 警告, {} 提示",
        report.error_count, report.warning_count, report.info_count
    );
    if report.error_count > 0 {
        for issue in report.issues.iter().filter(|i| i.severity == Severity::Error) {
            println!(
                "  行 {:?} 字段 {}: {}",
                issue.row_number,
                issue.field.as_deref().unwrap_or("-"),
                issue.message
            );
        }
        return Err(anyhow!("存在错误级问题，已停止"));
    }

    let handle = api
        .execute(
            &job_id,
            ExecuteOptions {
                dry_run: args.dry_run,
                error_handling: None,
            },
        )
        .await?;
    let outcome = handle.wait().await?;
    println!(
        "执行结束: 状态 {}, 新建 {}, 更新 {}, 跳过 {}, 失败 {}",
        outcome.state,
        outcome.counts.imported,
        outcome.counts.updated,
        outcome.counts.skipped,
        outcome.counts.failed
    );

    if !outcome.dry_run {
        let job_report = api.get_report(&job_id)?;
        println!("{}", serde_json::to_string_pretty(&job_report)?);
    }
    Ok(())
}
