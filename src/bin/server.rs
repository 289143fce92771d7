//! fhe-infer-server: evaluation server with HTTP API
//!
//! Loads a compiled server circuit and evaluates encrypted requests. The
//! server holds no private key and never sees plaintext.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use fhe_infer::api;
use fhe_infer::{Evaluator, ServerCircuit, SimulatedServer};

#[derive(Parser)]
#[command(name = "fhe-infer-server")]
#[command(about = "Encrypted inference server")]
#[command(version)]
struct Args {
    /// Compiled server circuit (server.json)
    #[arg(long, default_value = "fhe/server.json")]
    circuit: PathBuf,

    /// Server bind address
    #[arg(long, default_value = "0.0.0.0:3000")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    info!("fhe-infer server");
    info!("Circuit: {}", args.circuit.display());
    info!("Bind address: {}", args.bind);

    let load_start = Instant::now();
    let circuit = ServerCircuit::load(&args.circuit)
        .with_context(|| format!("Failed to load circuit: {}", args.circuit.display()))?;
    let engine = SimulatedServer::new(circuit).wrap_err("Invalid server circuit")?;
    let evaluator = Evaluator::new(Arc::new(engine));

    info!(
        "Circuit loaded: version={}, input_dim={} ({:.2?})",
        evaluator.circuit_version(),
        evaluator.input_dim(),
        load_start.elapsed()
    );

    let app = api::server::router(Arc::new(evaluator));

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;

    println!();
    println!("=== fhe-infer Server Running ===");
    println!("Listening on: http://{}", args.bind);
    println!();
    println!("Endpoints:");
    println!("  GET  /health   - Health check");
    println!("  GET  /params   - Active circuit version and input dimension");
    println!("  POST /evaluate - Evaluate a request envelope");
    println!();

    axum::serve(listener, app).await?;

    Ok(())
}
