use clap::{Parser, Subcommand, ValueEnum};
use gpushare_core::SchedulerPolicy;
use gpushare_device::{DeviceConfig, DeviceRegistry};
use gpushare_extender::{ApiServer, AppState, Config as ExtenderConfig};
use gpushare_scheduler::{
    ApiClient, ClusterClient, Registrar, Scheduler, SchedulerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(Parser)]
#[command(name = "gpushare", about = "Kubernetes scheduler extender for shared accelerators")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "GPUSHARE_LOG_FORMAT", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// How to reach the Kubernetes API server
#[derive(clap::Args)]
struct ClusterArgs {
    /// Kubernetes API server URL
    #[arg(long, default_value = "https://kubernetes.default.svc", env = "GPUSHARE_API_SERVER")]
    api_server: String,
    /// Bearer token file, skipped when missing
    #[arg(long, default_value = SERVICE_ACCOUNT_TOKEN, env = "GPUSHARE_TOKEN_FILE")]
    token_file: String,
}

/// Device request defaults and enabled vendors
#[derive(clap::Args)]
struct DeviceArgs {
    /// Vendors to enable, all when empty
    #[arg(long, value_delimiter = ',', env = "GPUSHARE_VENDORS")]
    vendors: Vec<String>,
    /// Memory in MiB per device when a container sets none (0 = whole card)
    #[arg(long, default_value_t = 0, env = "GPUSHARE_DEFAULT_MEM")]
    default_mem: u64,
    /// Core percentage per device when a container sets none
    #[arg(long, default_value_t = 0, env = "GPUSHARE_DEFAULT_CORES")]
    default_cores: u32,
    /// Device count when a container sets only memory or cores
    #[arg(long, default_value_t = 1, env = "GPUSHARE_DEFAULT_COUNT")]
    default_count: u32,
    /// MiB per Cambricon memory unit
    #[arg(long, default_value_t = 256, env = "GPUSHARE_MLU_MEMORY_UNIT")]
    mlu_memory_unit: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler extender
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:8888", env = "GPUSHARE_BIND")]
        bind: String,
        /// Scheduler name reported on events
        #[arg(long, default_value = "gpushare-scheduler", env = "GPUSHARE_SCHEDULER_NAME")]
        scheduler_name: String,
        /// Default node policy (binpack or spread)
        #[arg(long, default_value = "binpack", env = "GPUSHARE_NODE_POLICY")]
        node_policy: SchedulerPolicy,
        /// Default device policy (binpack or spread)
        #[arg(long, default_value = "spread", env = "GPUSHARE_GPU_POLICY")]
        gpu_policy: SchedulerPolicy,
        /// Seconds between node registration passes
        #[arg(long, default_value_t = 15, env = "GPUSHARE_REGISTER_INTERVAL")]
        register_interval: u64,
        /// Seconds a device plugin may leave a handshake unanswered
        #[arg(long, default_value_t = 60, env = "GPUSHARE_HANDSHAKE_TIMEOUT")]
        handshake_timeout: u64,
        #[command(flatten)]
        cluster: ClusterArgs,
        #[command(flatten)]
        devices: DeviceArgs,
    },
    /// Hand out the next pending container grant of a pod, as a device plugin would
    Allocate {
        /// Vendor whose grant to hand out, e.g. NVIDIA
        #[arg(long)]
        vendor: String,
        /// Pod namespace
        #[arg(long, default_value = "default")]
        namespace: String,
        /// Pod name
        #[arg(long)]
        pod: String,
        #[command(flatten)]
        cluster: ClusterArgs,
        #[command(flatten)]
        devices: DeviceArgs,
    },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    match cli.command {
        Commands::Serve {
            bind,
            scheduler_name,
            node_policy,
            gpu_policy,
            register_interval,
            handshake_timeout,
            cluster,
            devices,
        } => {
            let config = SchedulerConfig {
                scheduler_name,
                node_policy,
                gpu_policy,
                register_interval: Duration::from_secs(register_interval.max(1)),
                handshake_timeout: Duration::from_secs(handshake_timeout),
                device: device_config(&devices),
                ..Default::default()
            };
            run_serve(&bind, config, &cluster, &devices).await
        }
        Commands::Allocate {
            vendor,
            namespace,
            pod,
            cluster,
            devices,
        } => run_allocate(&vendor, &namespace, &pod, &cluster, &devices).await,
    }
}

fn device_config(args: &DeviceArgs) -> DeviceConfig {
    DeviceConfig {
        default_memory: args.default_mem,
        default_cores: args.default_cores,
        default_count: args.default_count,
        mlu_memory_unit: args.mlu_memory_unit,
    }
}

fn create_registry(args: &DeviceArgs) -> miette::Result<DeviceRegistry> {
    let config = device_config(args);
    if args.vendors.is_empty() {
        return Ok(DeviceRegistry::with_defaults(&config));
    }
    Ok(DeviceRegistry::with_vendors(&config, &args.vendors)?)
}

/// Build the API client, authenticating with the token file when it exists
async fn create_api_client(args: &ClusterArgs, component: &str) -> ApiClient {
    let client = ApiClient::new(&args.api_server).with_component(component);
    match tokio::fs::read_to_string(&args.token_file).await {
        Ok(token) => client.with_token(token.trim()),
        Err(e) => {
            warn!(
                "No API token read from '{}' ({}), continuing unauthenticated",
                args.token_file, e
            );
            client
        }
    }
}

/// Run the extender: registrar, event forwarder and HTTP server
async fn run_serve(
    bind: &str,
    config: SchedulerConfig,
    cluster: &ClusterArgs,
    devices: &DeviceArgs,
) -> miette::Result<()> {
    info!("Starting gpushare scheduler extender");

    let listen_addr: std::net::SocketAddr = bind
        .parse()
        .map_err(|e| miette::miette!("Invalid bind address '{}': {}", bind, e))?;

    let registry = create_registry(devices)?;
    info!("Enabled vendors: {}", registry.vendors().join(", "));

    let client: Arc<dyn ClusterClient> =
        Arc::new(create_api_client(cluster, &config.scheduler_name).await);
    let scheduler = Arc::new(Scheduler::new(config, registry, client));
    let state = Arc::new(AppState::new(scheduler.clone()));
    let token = CancellationToken::new();

    // 1. Spawn event forwarder
    let events_scheduler = scheduler.clone();
    let events_token = token.clone();
    let events_handle = tokio::spawn(async move {
        events_scheduler.forward_events(events_token).await;
    });

    // 2. Register nodes, then keep them current
    let registrar = Registrar::new(scheduler.clone());
    registrar.sync().await;
    state.set_ready(true);
    let registrar_token = token.clone();
    let registrar_handle = tokio::spawn(async move {
        if let Err(e) = registrar.run(registrar_token).await {
            error!("Registrar error: {}", e);
        }
    });

    // 3. Spawn extender server
    let server = ApiServer::new(ExtenderConfig { listen_addr }, state);
    let server_token = token.clone();
    let server_handle = tokio::spawn(async move {
        tokio::select! {
            result = server.run() => {
                if let Err(e) = result {
                    error!("Extender server error: {}", e);
                }
            }
            _ = server_token.cancelled() => {
                info!("Extender server shutting down");
            }
        }
    });

    info!("All components started. Extender on {}", listen_addr);

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down gracefully...");
    token.cancel();

    // Wait for all tasks to finish with a timeout
    let shutdown_timeout = Duration::from_secs(5);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = tokio::join!(events_handle, registrar_handle, server_handle);
    })
    .await;

    info!("Shutdown complete");

    Ok(())
}

/// Hand out one container grant and print what the runtime should receive
async fn run_allocate(
    vendor: &str,
    namespace: &str,
    name: &str,
    cluster: &ClusterArgs,
    devices: &DeviceArgs,
) -> miette::Result<()> {
    let registry = create_registry(devices)?;
    let client = create_api_client(cluster, "gpushare-device-plugin").await;

    let pod = client.get_pod(namespace, name).await?;
    let allocation = gpushare_device::allocate(&registry, vendor, &pod)?;
    client
        .patch_pod_annotations(namespace, name, &allocation.annotations)
        .await?;

    let output = serde_json::to_string_pretty(&allocation)
        .map_err(|e| miette::miette!("Failed to render allocation: {}", e))?;
    println!("{}", output);
    Ok(())
}
