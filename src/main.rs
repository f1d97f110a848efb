use anyhow::Result;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sensorwarden::config::Config;
use sensorwarden::storage::{self, LabeledReading, Reading};

#[derive(Parser)]
#[command(
    name = "sensorwarden",
    about = "Sensor-stream anomaly detection and alerting service",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + detection pipeline)
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },

    /// Train a model from the labeled rows in the store
    Train,

    /// Score one sensor's current window on demand
    ScoreNow {
        /// Sensor id to score
        sensor_id: String,
    },

    /// Seed the store with a synthetic labeled sensor feed
    Simulate {
        /// Number of synthetic sensors
        #[arg(long, default_value = "3")]
        sensors: usize,

        /// Hours of history per sensor (one reading per hour)
        #[arg(long, default_value = "168")]
        hours: i64,

        /// Roughly one in this many readings becomes a labeled spike
        #[arg(long, default_value = "12")]
        spike_every: u32,

        /// RNG seed, fixed for reproducible corpora
        #[arg(long, default_value = "7")]
        seed: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default();

    match cli.command {
        Commands::Serve { bind } => {
            tracing::info!(%bind, "Starting SensorWarden daemon");
            sensorwarden::serve(&bind, config).await?;
        }
        Commands::Train => {
            let pool = storage::open_pool(&config.storage.db_path)?;
            let app = sensorwarden::build(config, pool);

            tracing::info!("Training from labeled corpus in store");
            let report = app.engine.train(None).await?;

            println!("\n=== SensorWarden Training Report ===");
            println!("Train sequences: {}", report.train_sequences);
            println!("Eval sequences:  {}", report.eval_sequences);
            println!("Epochs run:      {}", report.fit.epochs_run);
            println!("Accuracy:        {:.4}", report.metrics.accuracy);
            println!("Precision:       {:.4}", report.metrics.precision);
            println!("Recall:          {:.4}", report.metrics.recall);
            println!("F1:              {:.4}", report.metrics.f1);
            println!("====================================\n");
        }
        Commands::ScoreNow { sensor_id } => {
            let pool = storage::open_pool(&config.storage.db_path)?;
            let app = sensorwarden::build(config, pool);
            app.load_model();

            match app.engine.score_now(&sensor_id).await {
                Ok(verdict) => {
                    println!("{}", serde_json::to_string_pretty(&verdict)?);
                }
                Err(e) => {
                    eprintln!("scoring failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Simulate {
            sensors,
            hours,
            spike_every,
            seed,
        } => {
            let pool = storage::open_pool(&config.storage.db_path)?;
            let mut rng = StdRng::seed_from_u64(seed);
            let spike_every = spike_every.max(1);
            let start = chrono::Utc::now() - chrono::Duration::hours(hours);

            let mut total = 0u64;
            let mut spikes = 0u64;
            for s in 0..sensors {
                let sensor_id = format!("sensor-{:03}", s + 1);
                let baseline = 18.0 + s as f64 * 2.0;

                for h in 0..hours {
                    let daily = (h as f64 / 24.0 * std::f64::consts::TAU).sin() * 2.0;
                    let noise: f64 = rng.gen_range(-0.5..0.5);
                    let spike = rng.gen_ratio(1, spike_every);
                    let value = if spike {
                        baseline + rng.gen_range(40.0..80.0)
                    } else {
                        baseline + daily + noise
                    };

                    storage::save_labeled_reading(
                        &pool,
                        &LabeledReading {
                            reading: Reading {
                                sensor_id: sensor_id.clone(),
                                sensor_type: "temperature".to_string(),
                                timestamp: start + chrono::Duration::hours(h),
                                value,
                                unit: "C".to_string(),
                                location: Some("simulated".to_string()),
                            },
                            is_anomaly: spike,
                        },
                    )?;
                    total += 1;
                    if spike {
                        spikes += 1;
                    }
                }
            }

            println!(
                "Seeded {total} labeled readings across {sensors} sensors ({spikes} anomalous). \
                 Run 'sensorwarden train' next."
            );
        }
    }

    Ok(())
}
