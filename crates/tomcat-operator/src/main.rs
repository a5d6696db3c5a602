//! Tomcat Kubernetes Operator
//!
//! This operator manages Tomcat custom resources in Kubernetes, deploying
//! Tomcat and keeping the live workload in line with each resource's spec.

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use std::net::SocketAddr;
use tomcat_operator::controller::{self, OperatorConfig};
use tomcat_operator::crd::{self, DEFAULT_WORKLOAD_SUFFIX};
use tomcat_operator::drift::DriftConfig;
use tomcat_operator::resources::RendererConfig;
use tomcat_operator::transformer::TransformConfig;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Tomcat Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "tomcat-operator")]
#[command(about = "Kubernetes operator for Tomcat application servers")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,

    /// CPU limit given to containers that declare none
    #[arg(long, env = "DEFAULT_CPU_LIMIT", default_value = "123m")]
    default_cpu_limit: String,

    /// Memory limit given to containers that declare none
    #[arg(long, env = "DEFAULT_MEMORY_LIMIT", default_value = "122Mi")]
    default_memory_limit: String,

    /// Weight of the preferred pod anti-affinity term (1-100)
    #[arg(long, env = "ANTI_AFFINITY_WEIGHT", default_value_t = 100)]
    anti_affinity_weight: i32,

    /// Topology key replicas are spread across
    #[arg(long, env = "TOPOLOGY_KEY", default_value = "kubernetes.io/hostname")]
    topology_key: String,

    /// Suffix of the Deployment and Service names
    #[arg(
        long,
        env = "WORKLOAD_SUFFIX",
        default_value = DEFAULT_WORKLOAD_SUFFIX,
        allow_hyphen_values = true
    )]
    workload_suffix: String,

    /// Re-fetch and retry this many times after a write conflict
    #[arg(long, env = "MAX_CONFLICT_RETRIES", default_value_t = 3)]
    max_conflict_retries: u32,

    /// Tomcat image repository; the resource's version is the tag
    #[arg(long, env = "IMAGE_REPOSITORY", default_value = "tomcat")]
    image_repository: String,
}

impl Args {
    /// Assemble and validate the operator configuration
    fn operator_config(&self) -> Result<OperatorConfig> {
        let transform = TransformConfig {
            default_cpu_limit: self.default_cpu_limit.clone(),
            default_memory_limit: self.default_memory_limit.clone(),
            anti_affinity_weight: self.anti_affinity_weight,
            topology_key: self.topology_key.clone(),
        };
        transform
            .validate()
            .context("Invalid manifest correction settings")?;

        if self.workload_suffix.is_empty() {
            anyhow::bail!("--workload-suffix must not be empty");
        }

        Ok(OperatorConfig {
            transform,
            drift: DriftConfig {
                workload_suffix: self.workload_suffix.clone(),
                max_conflict_retries: self.max_conflict_retries,
            },
            renderer: RendererConfig {
                image_repository: self.image_repository.clone(),
                workload_suffix: self.workload_suffix.clone(),
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle CRD printing
    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    // Initialize logging
    init_logging(&args)?;

    let config = args.operator_config()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        },
        "Starting Tomcat Kubernetes Operator"
    );

    // Initialize metrics
    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    // Start health server
    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    // Parse namespace (empty string means cluster-wide)
    let namespace = if args.namespace.is_empty() {
        None
    } else {
        Some(args.namespace)
    };

    controller::run_controller(client, namespace, config)
        .await
        .context("Controller failed")?;

    Ok(())
}

/// Initialize logging subsystem
///
/// `RUST_LOG` takes precedence over `--log-level` when set.
fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str().to_lowercase()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    // Keep the server running
    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

/// Print the CRD YAML for installation
fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;

    let crd = crd::Tomcat::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{}", yaml);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args_build_config() {
        let args = Args::parse_from(["tomcat-operator"]);
        let config = args.operator_config().unwrap();

        assert_eq!(config.transform, TransformConfig::default());
        assert_eq!(config.drift, DriftConfig::default());
        assert_eq!(config.renderer, RendererConfig::default());
    }

    #[test]
    fn test_invalid_limit_rejected() {
        let args = Args::parse_from(["tomcat-operator", "--default-cpu-limit", "fast"]);
        assert!(args.operator_config().is_err());
    }

    #[test]
    fn test_flags_reach_config() {
        let args = Args::parse_from([
            "tomcat-operator",
            "--workload-suffix",
            "-app",
            "--max-conflict-retries",
            "5",
            "--anti-affinity-weight",
            "50",
        ]);
        let config = args.operator_config().unwrap();

        assert_eq!(config.drift.workload_suffix, "-app");
        assert_eq!(config.renderer.workload_suffix, "-app");
        assert_eq!(config.drift.max_conflict_retries, 5);
        assert_eq!(config.transform.anti_affinity_weight, 50);
    }
}
