use std::panic;
use std::sync::Arc;

use anyhow::Context;
use backtrace::Backtrace;
use ccq_auth::PolicyStore;
use ccq_gateway::config::Config;
use ccq_gateway::server;
use ccq_gateway::QueryDispatcher;
use clap::Parser;
use mimalloc::MiMalloc;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing::span;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Clone, Debug)]
struct Cli {
    /// Path to the configuration file.
    #[clap(short, long)]
    config: Option<String>,

    /// If set, output logs in JSON format.
    #[clap(short, long, action)]
    json: bool,
}

fn setup_logging(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    if json {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_env_filter(env_filter)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("Setting up logging failed");
    } else {
        let subscriber = tracing_subscriber::fmt()
            .pretty()
            .compact()
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_env_filter(env_filter)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("Setting up logging failed");
    };
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.json);

    panic::set_hook(Box::new(|panic_info| {
        let msg = match panic_info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => {
                match panic_info.payload().downcast_ref::<String>() {
                    Some(s) => &s[..],
                    None => "Box<dyn Any>",
                }
            },
        };
        let (file, lineno, col) = match panic_info.location() {
            Some(l) => (l.file(), l.line(), l.column()),
            None => ("<unknown>", 0, 0),
        };

        error!(
            msg,
            file,
            lineno,
            col,
            "Panic occurred: {:?}",
            Backtrace::new(),
        );
    }));

    if let Err(err) = run(cli).await {
        panic!("Gateway exited due to an error: {err:?}")
    } else {
        Ok(())
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    info!("Starting query gateway. version: {}", version);
    let config = Config::load(cli.config.clone());
    config.validate();
    debug!("Loaded configuration: {:?}", config);

    let span = span!(
        Level::INFO,
        "Starting gateway",
        "environment" = config.gateway.environment.to_string(),
        "version" = version,
    );
    let _guard = span.enter();

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.prometheus.port))
        .install()
        .context("setting up Prometheus")?;

    let policy = Arc::new(PolicyStore::new(
        config.policy_set().context("loading permissions")?,
    ));
    info!(
        "Loaded permissions. api_keys: {}",
        policy.snapshot().len()
    );

    let dispatcher = Arc::new(
        QueryDispatcher::from_config(&config, policy.clone())
            .context("creating query dispatcher")?,
    );

    tokio::spawn(reload_permissions_on_hangup(cli.config, policy));

    info!(
        "Listening for queries. listen_addr: {}",
        config.gateway.listen_addr
    );
    warp::serve(server::routes(dispatcher))
        .run(config.gateway.listen_addr)
        .await;

    Ok(())
}

/// Re-reads the `permissions` section on every SIGHUP. A configuration that
/// fails to load leaves the current permissions in place.
async fn reload_permissions_on_hangup(
    local_file: Option<String>,
    policy: Arc<PolicyStore>,
) {
    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(hangups) => hangups,
        Err(err) => {
            error!("Could not listen for SIGHUP, permissions will not reload. err: {}", err);
            return;
        },
    };

    while hangups.recv().await.is_some() {
        let reloaded = Config::try_load(local_file.clone()).and_then(|config| config.policy_set());
        match reloaded {
            Ok(policy_set) => policy.reload(policy_set),
            Err(err) => error!("Reloading permissions failed. err: {:?}", err),
        }
    }
}
