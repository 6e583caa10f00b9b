mod backend;
mod progress;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lfgrant_core::{
    effective_permissions, plan, BackendConfig, CancelToken, DeclarationSet, ExecutionPlan,
    Executor, ExecutorConfig, LogicalId, Principal, PrincipalKind, RetryConfig, RunReport,
};
use lfgrant_parser::{load_declarations, parse_principal_spec, parse_resource_spec};
use progress::ProgressPrinter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_REPORT: &str = ".lfgrant/last-run.json";

#[derive(Parser)]
#[command(name = "lfgrant", version)]
#[command(about = "Plan and apply Lake Formation tags, registrations and grants in dependency order")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Declaration file
    #[arg(short, long, global = true, env = "LFGRANT_FILE", default_value = "lakeformation.lf")]
    file: PathBuf,

    /// Catalog (account) id; overrides the CATALOG statement
    #[arg(long, global = true, env = "LFGRANT_CATALOG_ID")]
    catalog_id: Option<String>,

    #[arg(
        long,
        global = true,
        env = "LFGRANT_BACKEND",
        value_enum,
        default_value_t = BackendKind::Emulator
    )]
    backend: BackendKind,

    /// Emulator state file (optional)
    #[arg(long, global = true, env = "LFGRANT_STATE_FILE")]
    state_file: Option<String>,

    #[arg(long, global = true, env = "LFGRANT_REGION")]
    region: Option<String>,

    #[arg(long, global = true, env = "LFGRANT_PROFILE")]
    profile: Option<String>,

    /// Custom Lake Formation endpoint (LocalStack)
    #[arg(long, global = true, env = "LFGRANT_ENDPOINT")]
    endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Emulator,
    Aws,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the declarations and print the execution order
    Plan,
    /// Plan, then execute against the selected backend
    Apply {
        /// Maximum concurrent service calls
        #[arg(short, long, env = "LFGRANT_JOBS", default_value_t = 4)]
        jobs: usize,
        /// Attempts per operation, first call included
        #[arg(long, env = "LFGRANT_MAX_ATTEMPTS", default_value_t = 4)]
        max_attempts: u32,
        /// Where to write the JSON run report
        #[arg(long, env = "LFGRANT_REPORT", default_value = DEFAULT_REPORT)]
        report: PathBuf,
    },
    /// Show the last known state of one operation
    Describe {
        /// Logical id of the operation
        id: String,
        #[arg(long, env = "LFGRANT_REPORT", default_value = DEFAULT_REPORT)]
        report: PathBuf,
    },
    /// Effective permissions of a principal on a resource
    Effective {
        /// Principal, e.g. "USER:ds-1" or "ROLE 'arn:aws:iam::1:role/etl'"
        #[arg(short, long)]
        principal: String,
        /// Resource, e.g. "TABLE default.reviews"
        #[arg(short, long)]
        resource: String,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    fn backend_config(&self) -> BackendConfig {
        match self.backend {
            BackendKind::Emulator => BackendConfig::Emulator {
                state_file: self.state_file.clone(),
            },
            BackendKind::Aws => BackendConfig::Aws {
                region: self.region.clone(),
                profile: self.profile.clone(),
                endpoint: self.endpoint.clone(),
            },
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("❌ {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    match &cli.command {
        Commands::Plan => {
            let plan = load_plan(&cli).await?;
            println!("{plan}");
            Ok(0)
        }
        Commands::Apply {
            jobs,
            max_attempts,
            report,
        } => apply(&cli, *jobs, *max_attempts, report).await,
        Commands::Describe { id, report } => describe(&cli, id, report).await,
        Commands::Effective {
            principal,
            resource,
            json,
        } => effective(&cli, principal, resource, *json).await,
    }
}

async fn load_declarations_file(cli: &Cli) -> Result<DeclarationSet> {
    let source = tokio::fs::read_to_string(&cli.file)
        .await
        .with_context(|| format!("reading {}", cli.file.display()))?;
    let mut decls = load_declarations(&source)
        .with_context(|| format!("loading {}", cli.file.display()))?;
    if let Some(catalog_id) = &cli.catalog_id {
        decls.set_catalog_id(catalog_id.clone());
    }
    Ok(decls)
}

async fn load_plan(cli: &Cli) -> Result<ExecutionPlan> {
    let decls = load_declarations_file(cli).await?;
    Ok(plan(&decls)?)
}

async fn apply(cli: &Cli, jobs: usize, max_attempts: u32, report_path: &Path) -> Result<u8> {
    if jobs == 0 {
        bail!("--jobs must be at least 1");
    }
    if max_attempts == 0 {
        bail!("--max-attempts must be at least 1");
    }

    let plan = load_plan(cli).await?;
    println!("📋 {} operations in {} waves", plan.len(), plan.waves().len());

    let service = backend::create_service(&cli.backend_config()).await?;
    let config = ExecutorConfig {
        jobs,
        retry: RetryConfig::default().with_max_attempts(max_attempts),
        ..ExecutorConfig::default()
    };
    let executor = Executor::new(service, config).with_observer(Arc::new(ProgressPrinter));

    let cancel = CancelToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, finishing running calls");
                cancel.cancel();
            }
        })
    };

    let report = executor.run(&plan, &cancel).await;
    interrupt.abort();

    write_report(report_path, &report).await?;
    println!("\n{report}");
    if report.cancelled {
        println!("⚠️  run cancelled");
    }
    Ok(report.exit_code())
}

async fn describe(cli: &Cli, id: &str, report_path: &Path) -> Result<u8> {
    // a stale report can still be read when the file no longer loads
    let decls = load_declarations_file(cli).await;
    let id = LogicalId::from(id);
    let id = match &decls {
        Ok(decls) => decls.resolve(&id).cloned().unwrap_or(id),
        Err(_) => id,
    };

    if let Some(report) = read_report(report_path).await? {
        if let Some(node) = report.node(&id) {
            println!("id:       {}", node.id);
            println!("kind:     {}", node.kind);
            println!("subject:  {}", node.subject);
            println!("state:    {}", node.state);
            println!("attempts: {}", node.attempts);
            if let Some(outcome) = node.outcome {
                println!("outcome:  {outcome:?}");
            }
            if let Some(err) = &node.error {
                println!("error:    {}: {}", err.kind, err.message);
            }
            return Ok(0);
        }
    }

    let plan = plan(&decls?)?;
    let graph = plan.graph();
    let index = graph
        .index_of(&id)
        .ok_or_else(|| anyhow!("unknown logical id `{id}`"))?;
    let node = graph.node(index);
    println!("id:       {}", node.id);
    println!("kind:     {}", node.operation.kind());
    println!("subject:  {}", node.operation.subject());
    println!("state:    Pending");
    let deps: Vec<&str> = graph
        .dependencies_of(&id)
        .into_iter()
        .map(LogicalId::as_str)
        .collect();
    if !deps.is_empty() {
        println!("after:    {}", deps.join(", "));
    }
    Ok(0)
}

async fn effective(cli: &Cli, principal: &str, resource: &str, json: bool) -> Result<u8> {
    let principal = parse_principal_arg(principal)?;
    let resource = parse_resource_spec(resource)?;
    let decls = load_declarations_file(cli).await?;
    let effective = effective_permissions(&decls, &principal, &resource);

    if json {
        println!("{}", serde_json::to_string_pretty(&effective)?);
        return Ok(0);
    }

    println!("🔍 {principal} on {resource}");
    if effective.is_empty() {
        println!("no permissions");
        return Ok(0);
    }
    let join = |set: &std::collections::BTreeSet<lfgrant_core::Permission>| {
        set.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(", ")
    };
    println!("permissions: {}", join(&effective.permissions));
    if !effective.grantable_permissions.is_empty() {
        println!("grantable:   {}", join(&effective.grantable_permissions));
    }
    let sources: Vec<&str> = effective.sources.iter().map(LogicalId::as_str).collect();
    println!("via:         {}", sources.join(", "));
    Ok(0)
}

/// Accepts `KIND:ID` as well as the declaration form `KIND 'ID'`
fn parse_principal_arg(spec: &str) -> Result<Principal> {
    if let Some((kind, identifier)) = spec.split_once(':') {
        let kind = match kind.trim().to_ascii_uppercase().as_str() {
            "USER" => Some(PrincipalKind::User),
            "ROLE" => Some(PrincipalKind::Role),
            "GROUP" => Some(PrincipalKind::Group),
            _ => None,
        };
        if let Some(kind) = kind {
            return Ok(Principal::new(kind, identifier.trim())?);
        }
    }
    parse_principal_spec(spec)
}

async fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, report.to_json()?)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    tracing::debug!(path = %path.display(), "run report written");
    Ok(())
}

/// The last run report, if one was written
async fn read_report(path: &Path) -> Result<Option<RunReport>> {
    if !path.exists() {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let report =
        RunReport::from_json(&json).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(report))
}
