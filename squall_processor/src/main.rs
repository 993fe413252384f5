//! Squall processor launcher: starts named processor instances of a
//! topology, each with its own coordination store session. The built-in
//! operator logic is a keyed word count over line-oriented file input;
//! other formulas link their own launcher against the library crate.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{self, LevelFilter};
use squall::{
    logger_init, pf_error, pf_info, pf_warn, BoltRunner, FileSnapshotStore,
    FileSource, Negotiator, OperatorKind, ProcessorId, SinkRunner,
    SnapshotStore, SpoutRunner, SquallError, StdoutSink, Topology,
    WordCountFormula,
};
use tokio::runtime::Builder;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Path to the topology TOML file (replicated verbatim to every
    /// processor).
    #[arg(short, long)]
    topology: PathBuf,

    /// Address of the coordination store service.
    #[arg(short, long, default_value = "127.0.0.1:52700")]
    connect: SocketAddr,

    /// Snapshot store directory (bolts only).
    #[arg(short, long, default_value = "/tmp/squall_snapshots")]
    store: PathBuf,

    /// Input directory holding one line-oriented file per partition
    /// (spouts only).
    #[arg(short, long, default_value = "/tmp/squall_input")]
    input: PathBuf,

    /// Optional TOML string overriding runner config fields.
    #[arg(long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Processor instances to start, as `{name}-{instance}`;
    /// `negotiator-0` starts the negotiator.
    #[arg(required = true)]
    processors: Vec<String>,
}

impl CliArgs {
    /// Sanitize command line arguments, returning the parsed processor
    /// identities.
    fn sanitize(&self) -> Result<Vec<ProcessorId>, SquallError> {
        if self.threads < 2 {
            return Err(SquallError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }
        self.processors
            .iter()
            .map(|p| ProcessorId::parse(p))
            .collect()
    }
}

/// Starts one processor instance and runs it to completion.
async fn run_processor(
    id: ProcessorId,
    topology: Topology,
    args: Arc<CliArgs>,
    rx_term: watch::Receiver<bool>,
) -> Result<(), SquallError> {
    let config_str = args.config.as_deref();

    if id.name == "negotiator" {
        let mut negotiator =
            Negotiator::new_and_setup(topology, args.connect, config_str)
                .await?;
        return negotiator.run(rx_term).await;
    }

    match topology.lookup(&id.name)?.kind {
        OperatorKind::Spout => {
            let partition = topology.partition_for(&id)?.clone();
            let path = args.input.join(&partition);
            let mut spout = SpoutRunner::new_and_setup(
                id,
                topology,
                args.connect,
                FileSource::new(partition, path),
                config_str,
            )
            .await?;
            spout.run().await
        }
        OperatorKind::Bolt => {
            let snapshots = Arc::new(FileSnapshotStore::new(&args.store))
                as Arc<dyn SnapshotStore>;
            let mut bolt = BoltRunner::new_and_setup(
                id,
                topology,
                args.connect,
                snapshots,
                WordCountFormula,
                config_str,
            )
            .await?;
            bolt.run().await
        }
        OperatorKind::Sink => {
            let mut sink = SinkRunner::new_and_setup(
                id,
                topology,
                args.connect,
                StdoutSink,
                config_str,
            )
            .await?;
            sink.run().await
        }
    }
}

/// Actual main function of the processor launcher.
fn processor_main() -> Result<(), SquallError> {
    // read in and parse command line arguments
    let args = Arc::new(CliArgs::parse());
    let ids = args.sanitize()?;

    let topology_doc = std::fs::read_to_string(&args.topology)?;
    let topology = Topology::from_toml(&topology_doc)?;

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("proc"; "error sending to term channel: {}", e);
        }
    })
    .map_err(SquallError::msg)?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-processor")
            .build()?;

        // enter tokio runtime and run every requested instance; the
        // first fatal error (or a termination signal) brings the whole
        // process down, so ephemerals vanish together
        runtime.block_on(async move {
            let mut instances = JoinSet::new();
            for id in ids {
                pf_info!("proc"; "starting {}", id);
                instances.spawn(run_processor(
                    id,
                    topology.clone(),
                    args.clone(),
                    rx_term.clone(),
                ));
            }

            let result = tokio::select! {
                joined = instances.join_next() => match joined {
                    Some(Ok(result)) => result,
                    Some(Err(e)) => Err(SquallError::msg(e)),
                    None => Ok(()),
                },
                _ = rx_term.changed() => {
                    pf_warn!("proc"; "caught termination signal");
                    Ok(())
                },
            };

            // suppress logging before dropping the runtime to avoid
            // spurious error messages
            log::set_max_level(LevelFilter::Off);
            result
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the processor launcher executable.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = processor_main() {
        pf_error!("proc"; "processor_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
