//! Offline hotword node binary
//!
//! Listens for "Leon" on the default microphone and notifies the server.

use clap::Parser;
use hotword_node::{init_logging, Cli, NodeError, Orchestrator};
use tracing::info;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("Failed to initialize logging: {e:#}");
    }

    let check_only = cli.check;
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => fail(&e),
    };

    info!(
        version = hotword_node::VERSION,
        language = %config.model.language,
        server = %config.endpoint.base_url(),
        "Starting offline hotword node"
    );

    let orchestrator = match Orchestrator::system(config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => fail(&e),
    };

    if check_only {
        match orchestrator.preflight().await {
            Ok(()) => {
                println!("Offline hotword is ready");
                std::process::exit(0);
            }
            Err(e) => fail(&e),
        }
    }

    match orchestrator.run().await {
        // The microphone never ends on its own; reaching here means capture stopped
        Ok(_) => fail(&NodeError::DeviceUnavailable(
            "audio capture ended unexpectedly".to_string(),
        )),
        Err(e) => fail(&e),
    }
}

/// Print the diagnostic and remediation, then exit with status 1
fn fail(err: &NodeError) -> ! {
    eprintln!("{}", err.report());
    std::process::exit(1);
}
