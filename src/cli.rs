use crate::cpu_topology::{self, MachineInfo};
use crate::errors::CoxswainError;
use crate::scheduler::inter_pod_affinity::{InterPodAffinity, DEFAULT_HARD_POD_AFFINITY_WEIGHT};
use crate::scheduler::plugins::Score;
use crate::ssh_client::run_on_hosts;
use crate::state::ClusterSnapshot;
use crate::tunnel::pool::TunnelPool;
use crate::tunnel::SshTunnelCreator;
use clap::{Args, Parser, Subcommand};
use itertools::Itertools;
use k8s_openapi::api::core::v1::Pod;
use std::path::Path;
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Debug, Parser)]
#[command(
    name = "coxswain",
    about = "Node scoring and tunnel plumbing for remote clusters.",
    version,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Rank nodes for a pod by inter-pod affinity")]
    Score(ScoreArgs),
    #[command(about = "Show the CPU topology of this or a described machine")]
    Topology(TopologyArgs),
    #[command(about = "Maintain ssh tunnels to a set of node addresses")]
    Tunnel(TunnelArgs),
    #[command(about = "Run a command on several hosts over ssh")]
    Exec(ExecArgs),
}

#[derive(Debug, Clone, Copy, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
enum OutputFormat {
    Table,
    Json,
}

fn parse_output_format(s: &str) -> Result<OutputFormat, strum::ParseError> {
    use std::str::FromStr;
    OutputFormat::from_str(s)
}

#[derive(Debug, Args)]
struct ScoreArgs {
    #[arg(long, short, help = "Pod manifest (yaml)")]
    pod: String,
    #[arg(long, short, help = "Cluster snapshot (yaml)")]
    state: String,
    #[arg(long, short, default_value = "table", value_parser = parse_output_format)]
    output: OutputFormat,
    #[arg(
        long,
        default_value_t = DEFAULT_HARD_POD_AFFINITY_WEIGHT,
        help = "Weight applied to resident pods' required affinity terms"
    )]
    hard_pod_affinity_weight: u32,
}

#[derive(Debug, Args)]
struct TopologyArgs {
    #[arg(
        long,
        short,
        help = "Machine description (json); defaults to reading sysfs"
    )]
    machine_info: Option<String>,
    #[arg(long, short, default_value = "table", value_parser = parse_output_format)]
    output: OutputFormat,
}

#[derive(Debug, Args)]
struct TunnelArgs {
    #[arg(long, short, default_value = "~/.coxswain/tunnel.yaml")]
    config: String,
    #[arg(required = true, help = "Node addresses as host:port")]
    addresses: Vec<String>,
}

#[derive(Debug, Args)]
struct ExecArgs {
    #[arg(long, short)]
    user: String,
    #[arg(long, short)]
    key_file: String,
    #[arg(long = "host", short = 'H', required = true)]
    hosts: Vec<String>,
    command: String,
}

pub async fn coxswain() -> Result<(), CoxswainError> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Score(args) => score(args),
        Commands::Topology(args) => topology(args),
        Commands::Tunnel(args) => tunnel(args).await,
        Commands::Exec(args) => exec(args).await,
    }
}

#[derive(Tabled)]
struct ScoreRow {
    node: String,
    score: u64,
}

fn score(args: ScoreArgs) -> Result<(), CoxswainError> {
    let pod = load_pod(&args.pod)?;
    let snapshot = ClusterSnapshot::load(&args.state)?;

    let scorer = InterPodAffinity::new(args.hard_pod_affinity_weight);
    let scores = scorer.score(&pod, &snapshot.nodes)?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&scores)?),
        OutputFormat::Table => {
            let rows = scores
                .into_iter()
                .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
                .map(|(node, score)| ScoreRow { node, score })
                .collect::<Vec<_>>();
            println!("{}", Table::new(rows).with(Style::sharp()));
        }
    }
    Ok(())
}

fn load_pod(path: &str) -> Result<Pod, CoxswainError> {
    let path = shellexpand::tilde(path).to_string();
    let file = std::fs::File::open(Path::new(&path))?;
    Ok(serde_yaml::from_reader(file)?)
}

#[derive(Tabled)]
struct CpuRow {
    cpu: usize,
    socket: usize,
    core: usize,
}

fn topology(args: TopologyArgs) -> Result<(), CoxswainError> {
    let machine = match &args.machine_info {
        Some(path) => {
            let path = shellexpand::tilde(path).to_string();
            let file = std::fs::File::open(Path::new(&path))?;
            serde_json::from_reader(file)?
        }
        None => read_local_machine_info()?,
    };
    let topo = cpu_topology::discover(&machine)?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&topo)?),
        OutputFormat::Table => {
            println!(
                "cpus: {}  cores: {}  sockets: {}  hyperthreading: {}",
                topo.num_cpus, topo.num_cores, topo.num_sockets, topo.hyper_threading
            );
            let rows = topo
                .details
                .cpus()
                .into_iter()
                .filter_map(|cpu| {
                    topo.details.get(cpu).map(|info| CpuRow {
                        cpu,
                        socket: info.socket_id,
                        core: info.core_id,
                    })
                })
                .collect::<Vec<_>>();
            println!("{}", Table::new(rows).with(Style::sharp()));
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn read_local_machine_info() -> Result<MachineInfo, CoxswainError> {
    Ok(MachineInfo::from_sysfs()?)
}

#[cfg(not(target_os = "linux"))]
fn read_local_machine_info() -> Result<MachineInfo, CoxswainError> {
    Err(CoxswainError::String(
        "reading the local topology is only supported on linux, pass --machine-info".to_string(),
    ))
}

async fn tunnel(args: TunnelArgs) -> Result<(), CoxswainError> {
    let config = crate::config::TunnelConfig::load(&args.config)?;
    let pool = TunnelPool::new(&config, Box::new(SshTunnelCreator {}))?;
    pool.update(&args.addresses);

    log::info!("maintaining tunnels to {} nodes, ctrl-c to stop", args.addresses.len());
    tokio::signal::ctrl_c().await?;

    pool.shutdown().await;
    Ok(())
}

async fn exec(args: ExecArgs) -> Result<(), CoxswainError> {
    let (outputs, failures) =
        run_on_hosts(&args.command, &args.user, &args.key_file, &args.hosts).await;

    for output in outputs {
        print!("{}: {}", output.host, output.stdout);
        if !output.stderr.is_empty() {
            eprint!("{}: {}", output.host, output.stderr);
        }
        if output.exit_code != 0 {
            eprintln!("{}: exited with status {}", output.host, output.exit_code);
        }
    }

    if !failures.is_empty() {
        let summary = failures
            .iter()
            .map(|(host, err)| format!("{}: {}", host, err))
            .join("\n");
        return Err(CoxswainError::String(summary));
    }
    Ok(())
}
