use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context as _;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use hyper::{Request, Response, StatusCode};

use tapedeck::{config::Config, middleware, record, registry::Registry};

#[derive(Debug, Parser)]
#[command(name = "tapedeck")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the cassette admin API plus a playback-wrapped echo handler.
    Serve {
        /// Path to config TOML.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Default cassette mode; overrides the config file and PLAYBACK_MODE.
        #[arg(long)]
        mode: Option<String>,
        #[arg(long, default_value = "127.0.0.1:3400")]
        listen: SocketAddr,
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Summarize the records of a cassette file.
    Inspect {
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            mode,
            listen,
            log_level,
        } => {
            let mut config = match config {
                Some(path) => Config::from_path(path)?,
                None => Config::default(),
            };
            if mode.is_some() {
                config.playback.mode = mode;
            }
            tapedeck::logging::init(&config, log_level.as_deref())?;

            let registry = Registry::from_config(&config)?;
            let service = middleware::serve(registry, listen, echo_handler()).await?;
            eprintln!("listening on {}", service.listen_addr);
            tokio::signal::ctrl_c().await?;
            service.shutdown().await;
        }
        Command::Inspect { file } => {
            let dump = std::fs::read(&file)
                .with_context(|| format!("read cassette {}", file.display()))?;
            let records = record::unmarshal_records(&dump)
                .map_err(|err| anyhow::anyhow!("parse cassette {}: {err}", file.display()))?;
            print_summary(&records);
        }
    }

    Ok(())
}

fn echo_handler() -> middleware::Handler {
    Arc::new(|req: Request<Bytes>| {
        Box::pin(async move {
            Response::builder()
                .status(StatusCode::OK)
                .body(req.into_body())
                .expect("echo response parts are valid")
        })
    })
}

fn print_summary(records: &[record::Record]) {
    let mut tracks: BTreeMap<String, usize> = BTreeMap::new();
    for rec in records {
        let label = format!("{:?} {}", rec.kind, rec.key);
        *tracks.entry(label).or_default() += 1;
    }

    println!("{} records, {} tracks", records.len(), tracks.len());
    for (label, count) in tracks {
        println!("{count:>5}  {label}");
    }
}
