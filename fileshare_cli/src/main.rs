use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fileshare_core::transfer::utils::format_size;
use fileshare_core::{AppConfig, FileClient, FileServer, TransferEvent, TransferHooks};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Share files over a framed TCP protocol", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the file server
    Serve {
        /// Address to listen on
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Directory holding the shared files
        #[arg(short, long)]
        storage_dir: Option<PathBuf>,

        /// Refuse connections beyond this many
        #[arg(long)]
        max_connections: Option<usize>,
    },
    /// List the files on a server
    List {
        #[arg(short, long, default_value = "127.0.0.1:9000")]
        server: String,
    },
    /// Download a file from a server
    Download {
        filename: String,

        /// Where to save it (defaults to the download directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(short, long, default_value = "127.0.0.1:9000")]
        server: String,
    },
    /// Upload a file to a server
    Upload {
        file: PathBuf,

        /// Send the whole file in one frame instead of in chunks
        #[arg(long)]
        single_frame: bool,

        #[arg(short, long, default_value = "127.0.0.1:9000")]
        server: String,
    },
    /// Show the active configuration, optionally writing it to disk
    Config {
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load();

    match cli.command {
        Commands::Serve {
            host,
            port,
            storage_dir,
            max_connections,
        } => {
            let mut server_config = config.server;
            if let Some(host) = host {
                server_config.host = host;
            }
            if let Some(port) = port {
                server_config.port = port;
            }
            if let Some(dir) = storage_dir {
                server_config.storage_dir = dir;
            }
            if let Some(max) = max_connections {
                server_config.max_connections = max;
            }
            serve(server_config).await
        }
        Commands::List { server } => {
            let mut client = FileClient::connect(&server, config.client).await?;
            let files = client.list_files().await?;
            if files.is_empty() {
                println!("No files on server");
            }
            for file in &files {
                println!("{:<40} {:>12}", file.name, file.size_formatted);
            }
            client.disconnect().await;
            Ok(())
        }
        Commands::Download {
            filename,
            output,
            server,
        } => {
            let mut client = FileClient::connect(&server, config.client).await?;
            let (hooks, progress) = watch_transfer(&filename);
            let result = client.download_file(&filename, output.as_deref(), &hooks).await;
            drop(hooks);
            let _ = progress.await;

            let outcome = result.with_context(|| format!("Download of {} failed", filename))?;
            println!(
                "Saved {} ({}) to {}",
                filename,
                format_size(outcome.bytes),
                outcome.path.display()
            );
            client.disconnect().await;
            Ok(())
        }
        Commands::Upload {
            file,
            single_frame,
            server,
        } => {
            let mut client = FileClient::connect(&server, config.client).await?;
            let outcome = if single_frame {
                let name = file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .context("File path has no usable name")?
                    .to_string();
                let data = tokio::fs::read(&file)
                    .await
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                client.upload_bytes(&name, data).await?
            } else {
                let label = file.display().to_string();
                let (hooks, progress) = watch_transfer(&label);
                let result = client.upload_file(&file, &hooks).await;
                drop(hooks);
                let _ = progress.await;
                result.with_context(|| format!("Upload of {} failed", label))?
            };
            println!("{}", outcome.message);
            client.disconnect().await;
            Ok(())
        }
        Commands::Config { save } => {
            if save {
                let path = config.save().context("Failed to save config")?;
                println!("Saved config to {}", path.display());
            } else if let Some(path) = AppConfig::config_path() {
                println!("# {}", path.display());
            }
            println!("{:#?}", config);
            Ok(())
        }
    }
}

async fn serve(config: fileshare_core::ServerConfig) -> Result<()> {
    let server = FileServer::bind(config).await?;
    let handle = server.handle();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                handle.shutdown();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server.run().await
}

/// Hooks wired to a progress bar and to Ctrl-C
fn watch_transfer(label: &str) -> (TransferHooks, tokio::task::JoinHandle<()>) {
    let (event_tx, mut event_rx) = mpsc::channel::<TransferEvent>(1000);
    let cancel = CancellationToken::new();
    let hooks = TransferHooks::with_events(event_tx).cancel_on(cancel.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{prefix} [{bar:40.cyan/blue}] {pos}/{len} chunks {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.set_prefix(label.to_string());

    let progress = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                TransferEvent::Progress {
                    chunks_done,
                    total_chunks,
                    bytes_done,
                    speed,
                    ..
                } => {
                    bar.set_length(total_chunks);
                    bar.set_position(chunks_done);
                    bar.set_message(format!("{} @ {}", format_size(bytes_done), speed));
                }
                TransferEvent::Completed { .. } => bar.finish(),
                TransferEvent::Error(text) => bar.abandon_with_message(text),
            }
        }
    });

    (hooks, progress)
}
