//! Command-line entry point.
//!
//! ```bash
//! # Run every collective on an in-process group of 4 ranks
//! inc-collectives demo --world-size 4 --elements 1024
//!
//! # Join a TCP group as rank 1 of 3
//! inc-collectives rank --rank 1 --peers 10.0.0.1:29500,10.0.0.2:29500,10.0.0.3:29500
//!
//! # Serve in-network all-reduce on the default port
//! inc-collectives switch --bind 0.0.0.0:30000
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use candle_core::{DType, Device, Tensor};
use clap::{Parser, Subcommand, ValueEnum};
use inc_collectives::distributed::{
    all_reduce_scalar, AggregationSwitch, CollectiveCommunicator, DeviceBuffer, OpCode, ProcessGroup, ReduceOp,
    StaticRendezvous,
};
use inc_collectives::utils::config::CollectiveConfig;
use inc_collectives::utils::error::{CollectiveError, Result};
use inc_collectives::utils::logging;
use inc_collectives::utils::metrics;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "inc-collectives")]
#[command(about = "Collective communication over in-process, TCP and in-network transports")]
#[command(version)]
struct Cli {
    /// JSON config file. `INC_*` environment variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every collective on an in-process group
    Demo {
        #[arg(short, long, default_value_t = 4)]
        world_size: usize,

        /// Elements per rank
        #[arg(short, long, default_value_t = 1024)]
        elements: usize,

        #[arg(long, value_enum, default_value_t = OpArg::Sum)]
        op: OpArg,
    },
    /// Join a TCP group and all-reduce the rank ids
    Rank {
        #[arg(short, long)]
        rank: usize,

        /// Listen address of every rank, in rank order
        #[arg(short, long, value_delimiter = ',', required = true)]
        peers: Vec<SocketAddr>,
    },
    /// Run an in-network aggregation switch
    Switch {
        #[arg(short, long, default_value = "0.0.0.0:30000")]
        bind: SocketAddr,

        /// Drop partial chunks that waited this long for their remaining ranks
        #[arg(long, default_value_t = 10_000)]
        expiry_ms: u64,

        /// Serve Prometheus metrics on this port
        #[cfg(feature = "metrics-server")]
        #[arg(long)]
        metrics_port: Option<u16>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OpArg {
    Sum,
    Product,
    Max,
    Min,
    Avg,
}

impl From<OpArg> for ReduceOp {
    fn from(op: OpArg) -> Self {
        match op {
            OpArg::Sum => ReduceOp::Sum,
            OpArg::Product => ReduceOp::Product,
            OpArg::Max => ReduceOp::Max,
            OpArg::Min => ReduceOp::Min,
            OpArg::Avg => ReduceOp::Avg,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<CollectiveConfig> {
    let config = match path {
        Some(p) => CollectiveConfig::from_file_with_env(p)?,
        None => CollectiveConfig::from_env(),
    };
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    logging::init_logging_with_format(config.log_format);

    match cli.command {
        Command::Demo { world_size, elements, op } => run_demo(config, world_size, elements, op.into()),
        Command::Rank { rank, peers } => run_rank(config, rank, peers),
        #[cfg(feature = "metrics-server")]
        Command::Switch { bind, expiry_ms, metrics_port } => run_switch(bind, expiry_ms, metrics_port),
        #[cfg(not(feature = "metrics-server"))]
        Command::Switch { bind, expiry_ms } => run_switch(bind, expiry_ms, None),
    }
}

fn run_demo(config: CollectiveConfig, world_size: usize, elements: usize, op: ReduceOp) -> Result<()> {
    info!(world_size, elements, %op, "Starting in-process demo");
    let groups = ProcessGroup::new_local_group(world_size, config)?;

    let handles: Vec<_> = groups
        .into_iter()
        .map(|group| thread::spawn(move || demo_rank(&group, elements, op)))
        .collect();

    for handle in handles {
        handle
            .join()
            .map_err(|_| CollectiveError::InvalidArgument("demo rank panicked".to_string()))??;
    }
    println!("{}", metrics::gather_metrics());
    Ok(())
}

fn demo_rank(group: &ProcessGroup, elements: usize, op: ReduceOp) -> Result<()> {
    let rank = group.rank();
    let device = Device::Cpu;
    let values: Vec<f32> = (0..elements).map(|i| (rank * elements + i) as f32).collect();
    let input = DeviceBuffer::from_vec(values, &device)?;
    let output = DeviceBuffer::zeros(DType::F32, elements, &device)?;

    let algorithm = group.algorithm_for(OpCode::AllReduce, &input, Some(op));
    group.all_reduce(&input, &output, op)?.wait(Some(group.config().default_timeout()))?;
    let head: Vec<f32> = output.to_vec::<f32>()?.into_iter().take(4).collect();
    println!("rank {rank}: all_reduce({op}) via {algorithm} -> {head:?}...");

    let gathered = CollectiveCommunicator::all_gather(group, &Tensor::new(&[rank as u32], &device)?)?;
    println!("rank {rank}: all_gather -> {:?}", gathered.to_vec1::<u32>()?);

    let root = group.world_size() - 1;
    let shared = CollectiveCommunicator::broadcast(group, &Tensor::new(&[rank as i64 * 7], &device)?, root)?;
    println!("rank {rank}: broadcast from {root} -> {:?}", shared.to_vec1::<i64>()?);

    CollectiveCommunicator::barrier(group)?;
    let mean_rank = all_reduce_scalar(rank as f64, ReduceOp::Avg, group)?;
    println!("rank {rank}: mean rank {mean_rank}, pool {:?}", group.pool_stats());
    Ok(())
}

fn run_rank(config: CollectiveConfig, rank: usize, peers: Vec<SocketAddr>) -> Result<()> {
    let world_size = peers.len();
    let rendezvous = StaticRendezvous::new(peers);
    let group = ProcessGroup::connect_tcp(rank, world_size, &rendezvous, config)?;

    let total = all_reduce_scalar(rank as f64, ReduceOp::Sum, &group)?;
    CollectiveCommunicator::barrier(&group)?;
    println!("rank {rank}/{world_size}: sum of ranks = {total}");
    info!(stats = ?group.transport_stats(), "Transport statistics");
    Ok(())
}

fn run_switch(bind: SocketAddr, expiry_ms: u64, metrics_port: Option<u16>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async move {
        spawn_metrics_server(metrics_port);
        let switch = AggregationSwitch::bind(bind).await?.with_expiry(Duration::from_millis(expiry_ms));
        switch.run().await
    })
}

#[cfg(feature = "metrics-server")]
fn spawn_metrics_server(port: Option<u16>) {
    if let Some(port) = port {
        tokio::spawn(metrics::start_metrics_server(port));
    }
}

#[cfg(not(feature = "metrics-server"))]
fn spawn_metrics_server(_port: Option<u16>) {}
