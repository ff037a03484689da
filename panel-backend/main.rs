mod api;
mod config;
mod interchange;
mod orchestrator;
mod session;
mod tracker;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;
use crate::interchange::InterchangeDir;
use crate::orchestrator::{HttpOrchestratorClient, OrchestratorClient};
use crate::session::logs::LogKey;
use crate::session::{FileStorage, KeyValueStorage, SessionStore};
use crate::tracker::{DeploymentResolver, PollPolicy, RunTracker, StartOutcome};

#[derive(Parser)]
#[command(name = "flowrun-panel", about = "Start, follow and cancel orchestrated pipeline runs")]
enum Cli {
    /// Start the HTTP server (default when no subcommand is given)
    Serve,
    /// Start a run (or pick up the tracked one) and follow it in the terminal
    Run {
        /// Deployment name, defaults to DEPLOYMENT_NAME
        #[arg(long)]
        deployment: Option<String>,
        /// Run parameter as key=value; values that parse as JSON are passed as JSON
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, serde_json::Value)>,
    },
    /// Print the persisted run session
    Status,
    /// Clear the persisted run session
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    // Default to Serve when no subcommand is given, but keep --help and --version working.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 { Cli::Serve } else { Cli::parse() };

    let config = Config::from_env();
    init_tracing();
    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: false,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    match cli {
        Cli::Serve => run_server(config).await,
        Cli::Run { deployment, params } => run_in_terminal(config, deployment, params).await,
        Cli::Status => print_status(&config),
        Cli::Reset => reset_session(&config),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("flowrun_panel=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();
}

fn parse_param(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("missing key in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn open_storage(config: &Config) -> Result<Arc<FileStorage>> {
    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("failed to create state dir: {}", config.state_dir.display()))?;
    Ok(Arc::new(FileStorage::new(&config.state_dir)))
}

fn build_client(config: &Config) -> Result<Arc<dyn OrchestratorClient>> {
    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(config.request_timeout)
        .build()
        .context("failed to build HTTP client")?;
    Ok(Arc::new(HttpOrchestratorClient::new(
        http_client,
        config.orchestrator_url.clone(),
    )))
}

fn build_tracker(config: &Config) -> Result<RunTracker> {
    let client = build_client(config)?;
    let session = SessionStore::restore(open_storage(config)?);
    let policy = PollPolicy {
        auto_delete_runs: config.auto_delete_runs,
        ..PollPolicy::default()
    };
    Ok(RunTracker::new(client, Arc::new(session), policy))
}

async fn run_server(config: Config) -> Result<()> {
    let tracker = build_tracker(&config)?;
    if tracker.resume() {
        tracing::info!("resumed polling of persisted run");
    }

    if let Err(e) = std::fs::create_dir_all(&config.cache_dir) {
        tracing::warn!(dir = %config.cache_dir.display(), error = %e, "failed to create cache dir");
    }

    let deployments = Arc::new(DeploymentResolver::new(
        tracker.client().clone(),
        config.deployment_name.clone(),
    ));

    let app_state = api::AppState {
        tracker,
        deployments,
        interchange: InterchangeDir::new(config.cache_dir.clone()),
    };

    let app = api::create_app(app_state)
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        orchestrator = %config.orchestrator_url,
        deployment = %config.deployment_name,
        "listening on http://{addr}"
    );
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

async fn run_in_terminal(
    config: Config,
    deployment: Option<String>,
    params: Vec<(String, serde_json::Value)>,
) -> Result<()> {
    let tracker = build_tracker(&config)?;

    if tracker.resume() {
        println!("following tracked run {}", tracker.session().snapshot().run.run_id.unwrap_or_default());
    } else {
        let name = deployment.unwrap_or(config.deployment_name);
        let resolver = DeploymentResolver::new(tracker.client().clone(), name.clone());
        let Some(deployment_id) = resolver.resolve().await? else {
            bail!("deployment {name} not found");
        };

        let parameters = serde_json::Value::Object(params.into_iter().collect());
        match tracker.start(&deployment_id, parameters).await? {
            StartOutcome::Started(run_id) => println!("started run {run_id} of {name}"),
            StartOutcome::AlreadyActive => bail!("a run is already active"),
        }
    }

    follow(&tracker).await;

    let session = tracker.session().snapshot();
    println!("final status: {}", session.run.status);
    if let Some(error) = session.error {
        println!("error: {error}");
    }
    Ok(())
}

/// Print status changes and new log lines until polling ends. The first
/// Ctrl-C requests a stop, the second exits immediately.
async fn follow(tracker: &RunTracker) {
    let mut updates = WatchStream::new(tracker.session().subscribe());
    let mut printed: HashSet<LogKey> = HashSet::new();
    let mut last_status = None;
    let mut stop_requested = false;

    let idle = tracker.wait_idle();
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = &mut idle => break,
            update = updates.next() => {
                let Some(session) = update else { break };
                if last_status != Some(session.run.status) {
                    println!("[{}] runtime {}s", session.run.status, session.run.runtime);
                    last_status = Some(session.run.status);
                }
                for entry in session.logs.entries() {
                    if printed.insert(LogKey::of(entry)) {
                        println!(
                            "{} {:<8} {}",
                            entry.timestamp,
                            entry.level.as_deref().unwrap_or("-"),
                            entry.message
                        );
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if stop_requested {
                    break;
                }
                stop_requested = true;
                let Some(run_id) = tracker.session().snapshot().run.run_id else { break };
                println!("stopping run {run_id}, press Ctrl-C again to quit");
                if let Err(e) = tracker.stop(&run_id).await {
                    eprintln!("stop failed: {e}");
                }
            }
        }
    }
}

fn print_status(config: &Config) -> Result<()> {
    let session = SessionStore::restore(open_storage(config)?);
    let snapshot = serde_json::to_string_pretty(&session.snapshot()).context("failed to render session")?;
    println!("{snapshot}");
    Ok(())
}

fn reset_session(config: &Config) -> Result<()> {
    let storage = open_storage(config)?;
    for key in [
        session::RUN_ID_KEY,
        session::STATUS_KEY,
        session::LOGS_KEY,
        session::RUNTIME_KEY,
    ] {
        storage.remove(key)?;
    }
    println!("cleared run session in {}", config.state_dir.display());
    Ok(())
}
