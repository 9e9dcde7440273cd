use anyhow::{anyhow, bail, Context};
use cardq_lib::{
    init_tracing, rows_to_csv, AppConfig, CardDataRequest, CardDataResponse, CardQueryService, FlatRow, SqliteStore,
};
use std::sync::Arc;

const DEFAULT_TENANT: &str = "default";

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        bail!("missing command");
    }

    let config = AppConfig::load()?;
    init_tracing(config.log_dir.as_deref(), &config.log_filter)?;

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("open card database {}", config.db_path.display()))?,
    );
    let service = CardQueryService::new(store.clone(), store, config.guard.clone())
        .with_empty_cell(config.empty_cell);

    match args[1].as_str() {
        "run" => cmd_run(&service, &args[2..]).await,
        "drill" => cmd_drill(&service, &args[2..]).await,
        other => {
            print_usage();
            Err(anyhow!("unknown command: {other}"))
        }
    }
}

async fn cmd_run(service: &CardQueryService, args: &[String]) -> anyhow::Result<()> {
    let card_id = parse_flag_value(args, "--card").ok_or_else(|| anyhow!("--card is required"))?;
    let tenant_id = parse_flag_value(args, "--tenant").unwrap_or_else(|| DEFAULT_TENANT.to_string());
    let filters = match parse_flag_value(args, "--filters") {
        Some(raw) => serde_json::from_str(&raw).context("parse --filters")?,
        None => serde_json::Value::Null,
    };

    let response = service
        .card_data(&tenant_id, &card_id, CardDataRequest { filters })
        .await?;

    if has_flag(args, "--csv") {
        let rows = match &response {
            CardDataResponse::Pivoted(pivoted) => &pivoted.data,
            CardDataResponse::Rows(rows) => rows,
        };
        println!("{}", rows_to_csv(rows));
    } else {
        println!("{}", serde_json::to_string_pretty(&response)?);
    }
    Ok(())
}

async fn cmd_drill(service: &CardQueryService, args: &[String]) -> anyhow::Result<()> {
    let card_id = parse_flag_value(args, "--card").ok_or_else(|| anyhow!("--card is required"))?;
    let tenant_id = parse_flag_value(args, "--tenant").unwrap_or_else(|| DEFAULT_TENANT.to_string());
    let raw_row = parse_flag_value(args, "--row").ok_or_else(|| anyhow!("--row is required"))?;
    let row: FlatRow = serde_json::from_str(&raw_row).context("parse --row (expected a JSON object)")?;

    let rows = service.drilldown_data(&tenant_id, &card_id, &row).await?;
    if has_flag(args, "--csv") {
        println!("{}", rows_to_csv(&rows));
    } else {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    }
    Ok(())
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|idx| args.get(idx + 1).cloned())
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|arg| arg == flag)
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  cardq run --card <id> [--tenant <id>] [--filters <json>] [--csv]");
    eprintln!("  cardq drill --card <id> --row <json> [--tenant <id>] [--csv]");
}
