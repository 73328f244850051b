use chainsim_node::{cli::Args, SimConfig, Simulation, SimulationDriver};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Audit file gets only the `consensus` EVENT lines; stdout gets the rest.
    let (audit_layer, _guard) = match &args.log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(std::path::Path::new("."));
            let file_name = path.file_name().ok_or("log file path has no file name")?;
            std::fs::create_dir_all(dir)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(tracing_subscriber::filter::filter_fn(|metadata| metadata.target() == "consensus"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chainsim_node=debug".into()),
        )
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| metadata.target() != "consensus"));

    tracing_subscriber::registry().with(audit_layer).with(stdout_layer).init();

    let base = match &args.config {
        Some(path) => {
            info!("Loading config from {}", path.display());
            SimConfig::load_from_file(path)?
        }
        None => SimConfig::default(),
    };
    let config = args.apply(base);

    let simulation = match Simulation::new(config) {
        Ok(sim) => sim,
        Err(e) => {
            error!("Failed to start simulation: {}", e);
            return Err(e.into());
        }
    };

    let driver = SimulationDriver::new(simulation);
    let shared = driver.simulation();
    let batch = if args.tx_every == 0 { args.ticks } else { args.tx_every };
    let mut done = 0;
    let mut sent = 0u64;

    while done < args.ticks {
        let ticks = batch.min(args.ticks - done);
        if args.realtime {
            driver.start(Some(ticks)).await;
            driver.join().await;
        } else {
            driver.run_ticks(ticks as usize).await;
        }
        done += ticks;

        if args.tx_every > 0 && done < args.ticks {
            let mut sim = shared.write().await;
            let wallets: Vec<String> = sim.wallets().map(|w| w.id.clone()).collect();
            if wallets.len() >= 2 {
                let from = &wallets[(sent as usize) % wallets.len()];
                let to = &wallets[(sent as usize + 1) % wallets.len()];
                if sim.send_transaction(from, to, 1 + sent % 10).is_some() {
                    sent += 1;
                }
            }
        }
    }

    let sim = shared.read().await;
    let snapshot = sim.snapshot();
    info!(
        "🏁 Done at t={}ms under {}: {} txs submitted, network {:?}",
        snapshot.now, snapshot.consensus, sent, snapshot.network
    );
    for node in &snapshot.nodes {
        info!(
            "  {} [{}] head={} finalized={} mempool={}",
            node.id, node.role, node.head_height, node.finalized_height, node.mempool_size
        );
    }
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
