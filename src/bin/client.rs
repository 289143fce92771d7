//! fhe-infer-client: key owner side of the inference protocol
//!
//! Generates and persists the session keys, prepares datasets, encrypts
//! feature files, submits them to the server and validates the results.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use eyre::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use fhe_infer::config::{ENC_TEST_DATA_DIR, TEST_DATA_DIR};
use fhe_infer::dataset::{
    list_chunk_files, read_features, read_labels, split_into_chunks, write_predictions,
};
use fhe_infer::validation::validate_directory;
use fhe_infer::wire::{load_batch, save_batch};
use fhe_infer::{
    api, CircuitSpecs, ClientConfig, HttpTransport, KeyManager, Orchestrator, Prediction,
    Session, SimulatedClient,
};

#[derive(Parser)]
#[command(name = "fhe-infer-client")]
#[command(about = "Encrypted inference client")]
#[command(version)]
struct Args {
    /// Client configuration (JSON); defaults apply when absent
    #[arg(long)]
    config: Option<PathBuf>,

    /// Client circuit specs (client.json), overrides the config file
    #[arg(long)]
    specs: Option<PathBuf>,

    /// Key directory, overrides the config file
    #[arg(long)]
    key_dir: Option<PathBuf>,

    /// Server base URL, overrides the config file
    #[arg(long)]
    server_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate (or load) the session keys and write the evaluation key
    Keygen {
        /// Replace existing keys with a fresh pair
        #[arg(long)]
        rotate: bool,
    },
    /// Split a labelled dataset into test_data/ and ground_truths/ chunks
    Split {
        #[arg(long)]
        features: PathBuf,
        #[arg(long)]
        labels: PathBuf,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        #[arg(long, default_value = "10")]
        chunk_size: usize,
    },
    /// Encrypt feature CSV files into ciphertext batches
    Encrypt {
        /// A CSV file, or a directory of chunk files
        #[arg(long, default_value = TEST_DATA_DIR)]
        input: PathBuf,
        #[arg(long, default_value = ENC_TEST_DATA_DIR)]
        out_dir: PathBuf,
    },
    /// Decrypt an evaluated ciphertext batch
    Decrypt {
        #[arg(long)]
        input: PathBuf,
        /// Write predictions as CSV instead of printing labels
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Encrypt, evaluate on the server and decrypt
    Predict {
        /// A feature CSV file or a ciphertext batch (.enc)
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
        /// Also keep the evaluated ciphertexts
        #[arg(long)]
        save_encrypted: Option<PathBuf>,
    },
    /// Run every test_data/ chunk through the server and compare with ground_truths/
    Validate {
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
    /// Serve the client-local HTTP API
    Serve {
        #[arg(long, default_value = "127.0.0.1:8000")]
        bind: SocketAddr,
    },
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(specs) = &args.specs {
        config.client_specs = specs.clone();
    }
    if let Some(dir) = &args.key_dir {
        config.key_dir = Some(dir.clone());
    }
    if let Some(url) = &args.server_url {
        config.server_url = url.clone();
    }
    config.validate().wrap_err("Invalid client configuration")?;
    Ok(config)
}

fn open_session(config: &ClientConfig) -> Result<Session> {
    let specs = CircuitSpecs::load(&config.client_specs).with_context(|| {
        format!(
            "Failed to load client specs: {}",
            config.client_specs.display()
        )
    })?;
    let engine = SimulatedClient::new(specs).wrap_err("Invalid client specs")?;
    Session::open(Arc::new(engine), config.key_dir.clone()).wrap_err(
        "Failed to initialize keys (keys for another circuit version need `keygen --rotate`)",
    )
}

fn orchestrator(config: &ClientConfig) -> Result<Orchestrator<HttpTransport>> {
    let transport = HttpTransport::new(&config.server_url, config.request_timeout())?;
    Ok(Orchestrator::new(
        Arc::new(transport),
        config.orchestrator.clone(),
    )?)
}

fn print_predictions(predictions: &[Prediction], output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            write_predictions(path, predictions)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote {} predictions to {}", predictions.len(), path.display());
        }
        None => {
            for p in predictions {
                println!("{}", p.label);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let config = load_config(&args)?;

    match args.command {
        Command::Keygen { rotate } => {
            let specs = CircuitSpecs::load(&config.client_specs).with_context(|| {
                format!(
                    "Failed to load client specs: {}",
                    config.client_specs.display()
                )
            })?;
            let engine = Arc::new(SimulatedClient::new(specs)?);
            let mut keys = match &config.key_dir {
                Some(dir) => KeyManager::with_key_dir(engine, dir),
                None => KeyManager::new(engine),
            };
            if rotate {
                keys.rotate()?;
            } else {
                keys.initialize().wrap_err(
                    "Failed to initialize keys (keys for another circuit version need `keygen --rotate`)",
                )?;
            }

            let key_id = keys.key_id().ok_or_else(|| eyre::eyre!("No keys after keygen"))?;
            println!();
            println!("=== Keys Ready ===");
            println!("Key id: {}", key_id);
            println!("Circuit version: {}", keys.evaluation_key_blob()?.circuit_version);
            match &config.key_dir {
                Some(dir) => println!("Key directory: {}", dir.display()),
                None => println!("Keys kept in memory only (no key_dir configured)"),
            }
        }

        Command::Split {
            features,
            labels,
            out_dir,
            chunk_size,
        } => {
            let rows = read_features(&features)
                .with_context(|| format!("Failed to read {}", features.display()))?;
            let truths = read_labels(&labels)
                .with_context(|| format!("Failed to read {}", labels.display()))?;
            let names = split_into_chunks(&rows, &truths, chunk_size, &out_dir)?;
            println!("Wrote {} chunks to {}", names.len(), out_dir.display());
        }

        Command::Encrypt { input, out_dir } => {
            let session = open_session(&config)?;
            let files = if input.is_dir() {
                list_chunk_files(&input)?
            } else {
                vec![input.clone()]
            };

            let start = Instant::now();
            let pb = ProgressBar::new(files.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
                    .progress_chars("#>-"),
            );

            let mut total = 0;
            for path in &files {
                let rows = read_features(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let ciphertexts = session.encrypt(&rows)?;
                let stem = path
                    .file_stem()
                    .ok_or_else(|| eyre::eyre!("Invalid file name: {}", path.display()))?;
                let target = out_dir.join(stem).with_extension("enc");
                save_batch(&target, &ciphertexts)
                    .with_context(|| format!("Failed to write {}", target.display()))?;
                total += ciphertexts.len();
                pb.inc(1);
            }
            pb.finish_with_message("Done");

            info!(
                "Encrypted {} vectors from {} files in {:.2?}",
                total,
                files.len(),
                start.elapsed()
            );
        }

        Command::Decrypt { input, output } => {
            let session = open_session(&config)?;
            let ciphertexts = load_batch(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let predictions = session.decrypt(&ciphertexts)?;
            print_predictions(&predictions, output.as_deref())?;
        }

        Command::Predict {
            input,
            output,
            save_encrypted,
        } => {
            let session = open_session(&config)?;
            let orchestrator = orchestrator(&config)?;

            let ciphertexts = if input.extension().is_some_and(|e| e == "enc") {
                load_batch(&input)?
            } else {
                session.encrypt(&read_features(&input)?)?
            };

            let start = Instant::now();
            let outcome = orchestrator
                .submit(session.evaluation_key()?, ciphertexts)
                .await?;
            if !outcome.is_complete() {
                for failure in &outcome.failures {
                    eprintln!("{}", failure);
                }
                eyre::bail!(
                    "{} of {} inputs were not evaluated",
                    outcome.failed_indices().len(),
                    outcome.outputs.len()
                );
            }
            let outputs = outcome.into_complete()?;
            info!("Evaluated {} ciphertexts in {:.2?}", outputs.len(), start.elapsed());

            if let Some(path) = &save_encrypted {
                save_batch(path, &outputs)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }
            let predictions = session.decrypt(&outputs)?;
            print_predictions(&predictions, output.as_deref())?;
        }

        Command::Validate { root } => {
            let session = open_session(&config)?;
            let orchestrator = orchestrator(&config)?;
            let report = validate_directory(&session, &orchestrator, &root).await?;

            println!();
            for file in &report.files {
                println!("{}", file);
            }
            println!(
                "Overall Success Percentage: {:.2}%",
                report.percentage()
            );
        }

        Command::Serve { bind } => {
            let session = open_session(&config)?;
            let app = api::client::router(Arc::new(session));
            let listener = tokio::net::TcpListener::bind(bind)
                .await
                .with_context(|| format!("Failed to bind {}", bind))?;

            println!();
            println!("=== fhe-infer Client API Running ===");
            println!("Listening on: http://{}", bind);
            println!();
            println!("Endpoints:");
            println!("  POST /encrypt - Encrypt feature rows into a request envelope");
            println!("  POST /decrypt - Decrypt a response envelope");
            println!("  POST /process - Multipart: function=encrypt|decrypt, input_file");
            println!();

            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}
