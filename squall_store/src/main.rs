//! Squall coordination store service.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use squall::{logger_init, pf_error, pf_warn, SquallError, StoreService};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening socket.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Coordination service port.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 52700)]
    port: u16,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments.
    fn sanitize(&self) -> Result<(), SquallError> {
        if self.port <= 1024 {
            Err(SquallError::msg(format!("invalid port {}", self.port)))
        } else if self.threads < 2 {
            Err(SquallError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of the store service.
fn store_main() -> Result<(), SquallError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    let bind_addr: SocketAddr = format!("{}:{}", args.bind_ip, args.port)
        .parse()
        .map_err(|e| {
            SquallError::msg(format!(
                "failed to parse bind_addr: bind_ip {} port {}: {}",
                args.bind_ip, args.port, e
            ))
        })?;

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("store"; "error sending to term channel: {}", e);
        }
    })
    .map_err(SquallError::msg)?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-store")
            .build()?;

        // enter tokio runtime, start the service, and park until told to
        // terminate
        runtime.block_on(async move {
            let _service = StoreService::new_and_setup(bind_addr).await?;

            let _ = rx_term.changed().await;
            pf_warn!("store"; "store service caught termination signal");

            // suppress logging before dropping the runtime to avoid
            // spurious error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), SquallError>(())
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the store service executable.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = store_main() {
        pf_error!("store"; "store_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    #[test]
    fn sanitize_valid() -> Result<(), SquallError> {
        let args = CliArgs {
            bind_ip: "127.0.0.1".parse()?,
            port: 52700,
            threads: 2,
        };
        args.sanitize()
    }

    #[test]
    fn sanitize_invalid_port() -> Result<(), SquallError> {
        let args = CliArgs {
            bind_ip: "127.0.0.1".parse()?,
            port: 1023,
            threads: 2,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_threads() -> Result<(), SquallError> {
        let args = CliArgs {
            bind_ip: "127.0.0.1".parse()?,
            port: 52700,
            threads: 1,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }
}
