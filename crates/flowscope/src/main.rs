mod client;
mod http_api;
mod output;
mod protocol;
mod telemetry;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use flowscope_core::config::{BackendKind, Config};
use flowscope_core::model::flow::FlowGraph;
use flowscope_core::model::raw::RawTrace;
use flowscope_core::time::{SystemClock, parse_time_or_relative};
use flowscope_ingest::backend::{BackendConfig, build_backend};
use flowscope_ingest::{Analyzer, Collector, CollectorConfig, NormalizeConfig};
use flowscope_store::FlowStore;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::client::ApiClient;
use crate::http_api::ApiState;
use crate::output::{
    print_dependencies_human, print_flow_human, print_flows_human, print_operation_human,
    print_operations_human, print_status_human,
};
use crate::protocol::ApiResponse;
use crate::telemetry::{TelemetryConfig, init_cli_tracing, init_run_tracing, shutdown_tracing};

#[derive(Parser, Debug)]
#[command(name = "flowscope")]
#[command(about = "Service-call flow analysis over distributed traces")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true, help = "Query API address (host:port)")]
    addr: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run the collector and the query API")]
    Run(RunArgs),
    #[command(about = "Build a flow from a raw trace JSON document")]
    Analyze {
        #[arg(help = "Path to the trace JSON, or - for stdin")]
        input: PathBuf,
        #[arg(long, help = "Analyze in-process instead of posting to a server")]
        local: bool,
    },
    #[command(about = "List stored flows")]
    Flows {
        #[arg(long)]
        operation: Option<String>,
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long)]
        environment: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
        #[arg(long)]
        page: Option<usize>,
        #[arg(long)]
        page_size: Option<usize>,
    },
    #[command(about = "Show one flow graph")]
    Flow { flow_id: String },
    #[command(about = "Aggregated service dependency graph")]
    Deps {
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long)]
        operation: Option<String>,
        #[arg(long)]
        environment: Option<String>,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
        #[arg(long, help = "pod (default) or service")]
        group_by: Option<String>,
    },
    #[command(about = "List business operations")]
    Operations {
        #[command(flatten)]
        scope: ScopeArgs,
    },
    #[command(about = "Roll-up for one business operation")]
    Operation {
        name: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    Status,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long)]
    http_addr: Option<String>,
    #[arg(long, help = "jaeger or tempo")]
    backend_kind: Option<String>,
    #[arg(long)]
    backend_url: Option<String>,
    #[arg(long)]
    backend_service: Option<String>,
    #[arg(long)]
    poll_interval: Option<String>,
    #[arg(long)]
    store_capacity: Option<usize>,
    #[arg(long)]
    store_ttl: Option<String>,
    #[arg(long, help = "Serve the API without polling a trace backend")]
    no_collector: bool,
}

#[derive(clap::Args, Debug)]
struct ScopeArgs {
    #[arg(long)]
    namespace: Option<String>,
    #[arg(long)]
    environment: Option<String>,
    #[arg(long)]
    since: Option<String>,
    #[arg(long)]
    until: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_server(args, TelemetryConfig::from_env()).await,
        Commands::Analyze { input, local } => {
            init_cli_tracing();
            let raw = read_trace(&input).await?;
            if local {
                let cfg = Config::load().context("load config")?;
                let analyzer = Analyzer::new(
                    FlowStore::new(1),
                    NormalizeConfig {
                        operation_attribute: cfg.operation_attribute,
                    },
                );
                let outcome = analyzer.analyze(&raw)?;
                return print_response(ApiResponse::Flow(outcome.flow.as_ref().clone()), cli.json);
            }

            let client = ApiClient::new(cli.addr)?;
            let (flow, created): (FlowGraph, bool) = client.analyze(&raw).await?;
            print_response(ApiResponse::Flow(flow), cli.json)?;
            if !cli.json {
                println!("stored={}", if created { "new" } else { "existing" });
            }
            Ok(())
        }
        Commands::Flows {
            operation,
            namespace,
            environment,
            status,
            since,
            until,
            page,
            page_size,
        } => {
            init_cli_tracing();
            let client = ApiClient::new(cli.addr)?;
            let mut params = Vec::new();
            push_param(&mut params, "operation", operation);
            push_param(&mut params, "namespace", namespace);
            push_param(&mut params, "environment", environment);
            push_param(&mut params, "status", status);
            push_window(&mut params, since, until)?;
            push_param(&mut params, "page", page.map(|v| v.to_string()));
            push_param(&mut params, "pageSize", page_size.map(|v| v.to_string()));
            let page = client.get(&["api", "flows"], &params).await?;
            print_response(ApiResponse::Flows(page), cli.json)
        }
        Commands::Flow { flow_id } => {
            init_cli_tracing();
            let client = ApiClient::new(cli.addr)?;
            let flow = client.get(&["api", "flows", flow_id.as_str()], &[]).await?;
            print_response(ApiResponse::Flow(flow), cli.json)
        }
        Commands::Deps {
            namespace,
            operation,
            environment,
            since,
            until,
            group_by,
        } => {
            init_cli_tracing();
            let client = ApiClient::new(cli.addr)?;
            let mut params = Vec::new();
            push_param(&mut params, "namespace", namespace);
            push_param(&mut params, "operation", operation);
            push_param(&mut params, "environment", environment);
            push_window(&mut params, since, until)?;
            push_param(&mut params, "groupBy", group_by);
            let graph = client.get(&["api", "dependencies"], &params).await?;
            print_response(ApiResponse::Dependencies(graph), cli.json)
        }
        Commands::Operations { scope } => {
            init_cli_tracing();
            let client = ApiClient::new(cli.addr)?;
            let params = scope_params(scope)?;
            let list = client.get(&["api", "operations"], &params).await?;
            print_response(ApiResponse::Operations(list), cli.json)
        }
        Commands::Operation { name, scope } => {
            init_cli_tracing();
            let client = ApiClient::new(cli.addr)?;
            let params = scope_params(scope)?;
            let stats = client.get(&["api", "operations", name.as_str()], &params).await?;
            print_response(ApiResponse::Operation(stats), cli.json)
        }
        Commands::Status => {
            init_cli_tracing();
            let client = ApiClient::new(cli.addr)?;
            let status = client.get(&["api", "status"], &[]).await?;
            print_response(ApiResponse::Status(status), cli.json)
        }
    }
}

async fn run_server(args: RunArgs, telemetry_cfg: TelemetryConfig) -> anyhow::Result<()> {
    let mut cfg = Config::load().context("load config")?;
    apply_run_args(&mut cfg, &args)?;
    cfg.validate().context("validate config")?;

    init_run_tracing(&telemetry_cfg);

    let http_addr: SocketAddr = cfg
        .http_addr
        .parse()
        .with_context(|| format!("bad http_addr {}", cfg.http_addr))?;

    eprintln!("flowscope run");
    eprintln!("  query api: http://{http_addr}");
    if args.no_collector {
        eprintln!("  collector: disabled");
    } else {
        eprintln!(
            "  backend: {:?} {} every {}",
            cfg.backend_kind,
            cfg.backend_url,
            humantime::format_duration(cfg.poll_interval)
        );
    }
    eprintln!("  store capacity: {}", cfg.store_capacity);

    let store = FlowStore::new(cfg.store_capacity);
    let analyzer = Analyzer::new(
        store.clone(),
        NormalizeConfig {
            operation_attribute: cfg.operation_attribute.clone(),
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let collector = if args.no_collector {
        None
    } else {
        let backend = build_backend(&BackendConfig::from_config(&cfg))
            .context("build trace backend client")?;
        Some(Collector::new(
            backend,
            analyzer.clone(),
            Arc::new(SystemClock),
            CollectorConfig::from_config(&cfg),
        ))
    };
    let collector_task = collector
        .clone()
        .map(|collector| tokio::spawn(collector.run(shutdown_rx.clone())));

    let retention_task = tokio::spawn({
        let store = store.clone();
        let ttl = cfg.store_ttl;
        let every = cfg.retention_interval;
        let mut shutdown = shutdown_rx.clone();
        async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => match store.run_retention(ttl) {
                        Ok(0) => {}
                        Ok(pruned) => tracing::info!(pruned, "retention pass"),
                        Err(err) => tracing::warn!(error = ?err, "retention task failed"),
                    },
                    _ = shutdown.changed() => break,
                }
            }
        }
    });

    let mut http_task = tokio::spawn(http_api::serve(
        http_addr,
        ApiState {
            analyzer,
            collector,
        },
        shutdown_rx,
    ));

    let early_exit = tokio::select! {
        res = &mut http_task => Some(res),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
            None
        }
    };

    let _ = shutdown_tx.send(true);
    let served = match early_exit {
        Some(res) => res,
        None => http_task.await,
    };
    if let Some(task) = collector_task
        && let Err(err) = task.await
    {
        tracing::warn!(error = ?err, "collector task ended abnormally");
    }
    if let Err(err) = retention_task.await {
        tracing::warn!(error = ?err, "retention task ended abnormally");
    }

    shutdown_tracing();
    served.context("query HTTP task join failed")?
}

fn apply_run_args(cfg: &mut Config, args: &RunArgs) -> anyhow::Result<()> {
    if let Some(v) = &args.http_addr {
        cfg.http_addr = v.clone();
    }
    if let Some(v) = &args.backend_kind {
        cfg.backend_kind = BackendKind::from_str(v)?;
    }
    if let Some(v) = &args.backend_url {
        cfg.backend_url = v.clone();
    }
    if let Some(v) = &args.backend_service {
        cfg.backend_service = Some(v.clone());
    }
    if let Some(v) = &args.poll_interval {
        cfg.poll_interval = cli_duration("--poll-interval", v)?;
    }
    if let Some(v) = args.store_capacity {
        cfg.store_capacity = v;
    }
    if let Some(v) = &args.store_ttl {
        cfg.store_ttl = cli_duration("--store-ttl", v)?;
    }
    Ok(())
}

fn cli_duration(flag: &str, value: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("bad {flag} value {value}"))
}

async fn read_trace(input: &Path) -> anyhow::Result<RawTrace> {
    let raw = if input.as_os_str() == "-" {
        let mut buf = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buf)
            .await
            .context("read trace from stdin")?;
        buf
    } else {
        tokio::fs::read_to_string(input)
            .await
            .with_context(|| format!("read {}", input.display()))?
    };
    serde_json::from_str(&raw).context("parse trace JSON")
}

fn push_param(params: &mut Vec<(&'static str, String)>, key: &'static str, value: Option<String>) {
    if let Some(value) = value {
        params.push((key, value));
    }
}

/// Resolves relative times locally so the server sees absolute bounds.
fn push_window(
    params: &mut Vec<(&'static str, String)>,
    since: Option<String>,
    until: Option<String>,
) -> anyhow::Result<()> {
    for (key, value) in [("startTime", since), ("endTime", until)] {
        if let Some(value) = value {
            let ts = parse_time_or_relative(&value)
                .with_context(|| format!("bad time value {value}"))?;
            params.push((key, ts.to_rfc3339()));
        }
    }
    Ok(())
}

fn scope_params(scope: ScopeArgs) -> anyhow::Result<Vec<(&'static str, String)>> {
    let mut params = Vec::new();
    push_param(&mut params, "namespace", scope.namespace);
    push_param(&mut params, "environment", scope.environment);
    push_window(&mut params, scope.since, scope.until)?;
    Ok(params)
}

fn print_response(response: ApiResponse, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    match response {
        ApiResponse::Flows(v) => print_flows_human(&v),
        ApiResponse::Flow(v) => print_flow_human(&v),
        ApiResponse::Dependencies(v) => print_dependencies_human(&v),
        ApiResponse::Operations(v) => print_operations_human(&v),
        ApiResponse::Operation(v) => print_operation_human(&v),
        ApiResponse::Status(v) => print_status_human(&v),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_args_override_config() {
        let cli = Cli::try_parse_from([
            "flowscope",
            "run",
            "--backend-kind",
            "tempo",
            "--poll-interval",
            "15s",
            "--store-capacity",
            "42",
            "--no-collector",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let mut cfg = Config::default();
        apply_run_args(&mut cfg, &args).unwrap();
        assert_eq!(cfg.backend_kind, BackendKind::Tempo);
        assert_eq!(cfg.poll_interval, Duration::from_secs(15));
        assert_eq!(cfg.store_capacity, 42);
        assert!(args.no_collector);
    }

    #[test]
    fn bad_run_args_are_rejected() {
        let mut cfg = Config::default();
        let args = RunArgs {
            http_addr: None,
            backend_kind: Some("zipkin".to_string()),
            backend_url: None,
            backend_service: None,
            poll_interval: None,
            store_capacity: None,
            store_ttl: None,
            no_collector: false,
        };
        assert!(apply_run_args(&mut cfg, &args).is_err());
        assert!(cli_duration("--store-ttl", "soon").is_err());
    }

    #[test]
    fn window_params_are_absolute() {
        let mut params = Vec::new();
        push_window(
            &mut params,
            Some("2026-02-01T00:00:00Z".to_string()),
            Some("15m".to_string()),
        )
        .unwrap();
        assert_eq!(params[0], ("startTime", "2026-02-01T00:00:00+00:00".to_string()));
        assert_eq!(params[1].0, "endTime");
        assert!(push_window(&mut Vec::new(), Some("wat".to_string()), None).is_err());
    }

    #[test]
    fn analyze_accepts_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["flowscope", "analyze", "-", "--local", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Analyze { local: true, .. }));
    }
}
