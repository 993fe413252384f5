//! Squall cluster control tool: store initialization and inspection, a
//! local-mode sample runner, and a sample traffic emitter.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rand::prelude::*;
use squall::{
    create_master_state, get_all_processor_states, get_committed_clock,
    get_master_state, init_store_roots, logger_init, pf_error, BoltRunner,
    MemSnapshotStore, MemSource, Negotiator, ProcessorId, SinkRunner,
    SnapshotStore, SpoutRunner, SquallError, StdoutSink, StoreService,
    StoreSession, Topology, TopologyBuilder, WordCountFormula,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the persistent store roots (idempotent).
    StoreInit {
        /// Address of the coordination store service.
        #[arg(short, long, default_value = "127.0.0.1:52700")]
        connect: SocketAddr,
    },

    /// Dump the master state, committed clock, and living processors.
    StoreShow {
        /// Address of the coordination store service.
        #[arg(short, long, default_value = "127.0.0.1:52700")]
        connect: SocketAddr,
    },

    /// Run a self-contained word-count sample topology in one process,
    /// with an in-process store service.
    RunSample {
        /// How many sample records to feed through.
        #[arg(short, long, default_value_t = 200)]
        records: usize,

        /// Flow time between snapshot cuts, in ms.
        #[arg(long, default_value_t = 3000)]
        snapshot_throttle_ms: u64,
    },

    /// Append sample traffic to a partition input file.
    SampleEmit {
        /// Input file of the partition to grow.
        #[arg(short, long)]
        file: PathBuf,

        /// How many records to append.
        #[arg(short, long, default_value_t = 100)]
        count: usize,
    },
}

async fn store_init(connect: SocketAddr) -> Result<(), SquallError> {
    let session = StoreSession::connect(connect).await?;
    init_store_roots(&session).await?;
    create_master_state(&session).await?;
    println!("store roots ready at {}", connect);
    Ok(())
}

async fn store_show(connect: SocketAddr) -> Result<(), SquallError> {
    let session = StoreSession::connect(connect).await?;
    println!("master state:    {}", get_master_state(&session).await?);
    println!(
        "committed clock: {}",
        get_committed_clock(&session).await?
    );
    let mut states: Vec<_> = get_all_processor_states(&session)
        .await?
        .into_iter()
        .collect();
    states.sort_by(|(a, _), (b, _)| a.cmp(b));
    println!("living processors ({}):", states.len());
    for (id, state) in states {
        println!("  {:<24} {}", id.to_string(), state);
    }
    Ok(())
}

/// Local-mode runner: store service, negotiator, one spout, one counting
/// bolt, and a stdout sink, all on this process's runtime.
async fn run_sample(
    records: usize,
    snapshot_throttle_ms: u64,
) -> Result<(), SquallError> {
    let service =
        StoreService::new_and_setup("127.0.0.1:0".parse()?).await?;
    let store_addr = service.local_addr();
    let ctl = StoreSession::connect(store_addr).await?;
    init_store_roots(&ctl).await?;
    create_master_state(&ctl).await?;

    let topo = TopologyBuilder::new()
        .spout("src", vec!["p0".into()], vec!["count".into()])
        .bolt(
            "count",
            vec!["127.0.0.1:47011".parse()?],
            vec!["out".into()],
        )
        .sink("out", vec!["127.0.0.1:47012".parse()?])
        .build()?;

    const WORDS: [&str; 6] =
        ["storm", "gale", "gust", "squall", "breeze", "zephyr"];
    let mut rng = rand::thread_rng();
    let sample: Vec<String> = (0..records)
        .map(|_| WORDS.choose(&mut rng).unwrap().to_string())
        .collect();

    let negotiator_config = format!(
        "snapshot_throttle_ms = {}\nstore_throttle_ms = 100",
        snapshot_throttle_ms
    );
    spawn_sample_cluster(topo, store_addr, sample, negotiator_config);

    // run until interrupted
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = tx_term.send(true);
    })
    .map_err(SquallError::msg)?;
    let _ = rx_term.changed().await;
    println!("sample run interrupted; final store state:");
    store_show(store_addr).await
}

fn spawn_sample_cluster(
    topo: Topology,
    store_addr: SocketAddr,
    sample: Vec<String>,
    negotiator_config: String,
) {
    let snapshots =
        Arc::new(MemSnapshotStore::new()) as Arc<dyn SnapshotStore>;

    let negotiator_topo = topo.clone();
    tokio::spawn(async move {
        let mut negotiator = Negotiator::new_and_setup(
            negotiator_topo,
            store_addr,
            Some(&negotiator_config),
        )
        .await?;
        // the sender lives as long as this task, so the negotiator never
        // reads its drop as a termination request
        let (tx_term, rx_term) = watch::channel(false);
        let _keep = tx_term;
        negotiator.run(rx_term).await
    });

    let spout_topo = topo.clone();
    tokio::spawn(async move {
        let mut spout = SpoutRunner::new_and_setup(
            ProcessorId::new("src", 0),
            spout_topo,
            store_addr,
            MemSource::new("p0", sample),
            None,
        )
        .await?;
        spout.run().await
    });

    let bolt_topo = topo.clone();
    tokio::spawn(async move {
        let mut bolt = BoltRunner::new_and_setup(
            ProcessorId::new("count", 0),
            bolt_topo,
            store_addr,
            snapshots,
            WordCountFormula,
            None,
        )
        .await?;
        bolt.run().await
    });

    tokio::spawn(async move {
        let mut sink = SinkRunner::new_and_setup(
            ProcessorId::new("out", 0),
            topo,
            store_addr,
            StdoutSink,
            None,
        )
        .await?;
        sink.run().await
    });
}

fn sample_emit(file: PathBuf, count: usize) -> Result<(), SquallError> {
    const WORDS: [&str; 6] =
        ["storm", "gale", "gust", "squall", "breeze", "zephyr"];
    let mut rng = rand::thread_rng();
    let mut out = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&file)?;
    for _ in 0..count {
        writeln!(out, "{}", WORDS.choose(&mut rng).unwrap())?;
    }
    println!("appended {} records to {}", count, file.display());
    Ok(())
}

/// Actual main function of the control tool.
fn ctl_main() -> Result<(), SquallError> {
    let args = CliArgs::parse();
    if args.threads < 2 {
        return Err(SquallError::msg(format!(
            "invalid number of threads {}",
            args.threads
        )));
    }

    // sample emission is pure file I/O; no runtime needed
    if let Command::SampleEmit { file, count } = &args.command {
        return sample_emit(file.clone(), *count);
    }

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-ctl")
        .build()?;

    runtime.block_on(async move {
        match args.command {
            Command::StoreInit { connect } => store_init(connect).await,
            Command::StoreShow { connect } => store_show(connect).await,
            Command::RunSample {
                records,
                snapshot_throttle_ms,
            } => run_sample(records, snapshot_throttle_ms).await,
            Command::SampleEmit { .. } => unreachable!(),
        }
    })
}

/// Main function of the control tool executable.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = ctl_main() {
        pf_error!("ctl"; "ctl_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
