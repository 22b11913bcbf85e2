use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

/// Hourglass: operator CLI for the hourly report ingestion ledger
#[derive(Parser, Debug)]
#[command(name = "hourglass")]
#[command(about = "Operator CLI for the hourly report ingestion ledger", long_about = None)]
struct Cli {
    /// Base URL of the hourglass server
    #[arg(long, global = true, default_value = "http://localhost:3000", env = "HOURGLASS_URL")]
    server_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show per-status counts and ingestion cursors for a namespace
    Summary(SummaryArgs),
    /// List ledger rows for a namespace
    Rows(RowsArgs),
    /// Trigger a repair/backfill run for a namespace
    Repair(RepairArgs),
}

#[derive(Parser, Debug)]
struct SummaryArgs {
    /// Namespace to summarize
    namespace: String,
}

#[derive(Parser, Debug)]
struct RowsArgs {
    /// Namespace to list
    namespace: String,

    /// Maximum number of rows to return
    #[arg(long, default_value_t = 168)]
    limit: usize,
}

#[derive(Parser, Debug)]
struct RepairArgs {
    /// Namespace to repair
    namespace: String,

    /// How many hours back to scan for missing ingestion
    #[arg(long, default_value_t = 720)]
    lookback_hours: i64,

    /// Maximum report requests this run may issue
    #[arg(long, default_value_t = 10)]
    max_reports: usize,

    /// Wall-clock budget for the run, in seconds
    #[arg(long, default_value_t = 600)]
    max_runtime_seconds: i64,

    /// Print the plan without requesting anything
    #[arg(long)]
    dry_run: bool,

    /// Request multiple contiguous hours per report
    #[arg(long)]
    burst: bool,

    /// Hours per burst report
    #[arg(long, default_value_t = 6)]
    burst_window_hours: usize,
}

async fn get_json(url: &str) -> Result<serde_json::Value> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("request to {url} failed"))?;

    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .with_context(|| format!("non-JSON response from {url}"))?;

    if !status.is_success() {
        return Err(anyhow!("server returned {status}: {body}"));
    }
    Ok(body)
}

async fn run_summary(server_url: &str, args: SummaryArgs) -> Result<()> {
    let url = format!("{server_url}/ledger/{}/summary", args.namespace);
    let body = get_json(&url).await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn run_rows(server_url: &str, args: RowsArgs) -> Result<()> {
    let url = format!(
        "{server_url}/ledger/{}?limit={}",
        args.namespace, args.limit
    );
    let body = get_json(&url).await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn run_repair(server_url: &str, args: RepairArgs) -> Result<()> {
    let url = format!("{server_url}/repair/{}", args.namespace);
    let payload = json!({
        "lookback_hours": args.lookback_hours,
        "max_reports": args.max_reports,
        "max_runtime_seconds": args.max_runtime_seconds,
        "dry_run": args.dry_run,
        "burst_enabled": args.burst,
        "burst_window_hours": args.burst_window_hours,
    });

    let client = reqwest::Client::new();
    let response = client
        .post(&url)
        .json(&payload)
        .send()
        .await
        .with_context(|| format!("request to {url} failed"))?;

    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .with_context(|| format!("non-JSON response from {url}"))?;

    if !status.is_success() {
        return Err(anyhow!("server returned {status}: {body}"));
    }

    println!("{}", serde_json::to_string_pretty(&body)?);

    if body["stopped_reason"] == "lock_busy" {
        eprintln!("note: another worker holds the namespace lock; try again later");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let server_url = cli.server_url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Summary(args) => run_summary(&server_url, args).await,
        Commands::Rows(args) => run_rows(&server_url, args).await,
        Commands::Repair(args) => run_repair(&server_url, args).await,
    }
}
