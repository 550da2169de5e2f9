//! Cluster Engine Operator
//!
//! Runs the ClusterEngine controller against the cluster the process is
//! configured for, with health and Prometheus endpoints alongside.

use clap::Parser;
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cluster_engine_operator::controller::{self, Context};
use cluster_engine_operator::{
    EnvImageResolver, Error, KubeStore, Metrics, ProcessEnvironment, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Cluster Engine Operator - converges a multicluster platform to its ClusterEngine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Delay for fixed-cadence requeues, in seconds
    #[arg(long, env = "REQUEUE_PERIOD", default_value = "15")]
    requeue_period_secs: u64,

    /// Upper bound on a single reconcile pass, in seconds
    #[arg(long, env = "RECONCILE_DEADLINE", default_value = "120")]
    deadline_secs: u64,

    /// Version the operator converges towards; falls back to OPERATOR_VERSION
    #[arg(long)]
    operator_version: Option<String>,

    /// Prefix of the environment variables carrying image references
    #[arg(long, env = "IMAGE_ENV_PREFIX", default_value = "OPERAND_IMAGE_")]
    image_prefix: String,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Cluster Engine Operator");
    info!("  Version: {}", cluster_engine_operator::VERSION);
    info!("  Requeue period: {}s", args.requeue_period_secs);
    info!("  Reconcile deadline: {}s", args.deadline_secs);

    let registry = Registry::new();
    let metrics = Metrics::register(&registry)?;

    let health_addr = parse_addr(&args.health_addr, "health")?;
    let metrics_addr = parse_addr(&args.metrics_addr, "metrics")?;

    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, registry).await {
            error!("Metrics server error: {}", e);
        }
    });

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let mut environment = ProcessEnvironment::default();
    if let Some(version) = &args.operator_version {
        environment = environment.with_operator_version(version.clone());
    }

    let ctx = Context::builder(Arc::new(KubeStore::new(client.clone())))
        .images(Arc::new(EnvImageResolver::new(args.image_prefix.clone())))
        .environment(Arc::new(environment))
        .metrics(metrics)
        .requeue_period(Duration::from_secs(args.requeue_period_secs))
        .deadline(Duration::from_secs(args.deadline_secs))
        .build()?;

    controller::run(client, Arc::new(ctx)).await;

    info!("Operator shutdown complete");
    Ok(())
}

fn parse_addr(addr: &str, server: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} server address: {}", server, e)))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: SocketAddr) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let (status, body) = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => (StatusCode::OK, "ok"),
                _ => (StatusCode::NOT_FOUND, "not found"),
            };
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, registry: Registry) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    if req.uri().path() != "/metrics" {
                        let mut response = Response::new(Body::from("not found"));
                        *response.status_mut() = StatusCode::NOT_FOUND;
                        return Ok::<_, std::convert::Infallible>(response);
                    }

                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    let response = match encoder.encode(&registry.gather(), &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => {
                            let mut response = Response::new(Body::from(e.to_string()));
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            response
                        }
                    };
                    Ok(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
