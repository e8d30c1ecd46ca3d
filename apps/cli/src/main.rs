use anyhow::{anyhow, Context, Result};
use assembler::{
    CatalogSource, ConsoleReporter, DownloadConfig, DownloadOrchestrator, JsonCatalog, TaskOutcome, TaskRequest,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "assembler", about = "Assemble offline installer packages")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log engine internals
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a product and its dependencies into an installer directory
    Download {
        /// Catalog JSON file
        #[arg(short, long)]
        catalog: PathBuf,
        /// Product code, e.g. PHSP
        #[arg(short, long)]
        product: String,
        #[arg(long)]
        version: String,
        #[arg(short, long, default_value = "en_US")]
        language: String,
        /// Installer directory; defaults to "Install <code>_<version>-<language>-<platform>.app"
        #[arg(short, long)]
        dest: Option<PathBuf>,
        #[arg(long)]
        max_retries: Option<usize>,
    },
    /// List the products in a catalog
    Products {
        #[arg(short, long)]
        catalog: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::WARN })
        .with_target(false)
        .init();

    let mut config = DownloadConfig::from_env().context("invalid configuration")?;

    match cli.command {
        Commands::Products { catalog } => {
            let catalog = JsonCatalog::new(&catalog, &config).fetch_catalog().await?;
            for entry in &catalog.display_names {
                let versions: Vec<&str> = catalog
                    .product(&entry.code)
                    .map(|p| p.versions.iter().map(|v| v.version.as_str()).collect())
                    .unwrap_or_default();
                println!("{:<8} {:<40} {}", entry.code, entry.display_name, versions.join(", "));
            }
            Ok(())
        }
        Commands::Download { catalog, product, version, language, dest, max_retries } => {
            if let Some(attempts) = max_retries {
                config.max_retry_attempts = attempts;
            }
            let catalog = JsonCatalog::new(&catalog, &config).fetch_catalog().await?;
            let display_name = catalog
                .product(&product)
                .map(|p| p.display_name.clone())
                .unwrap_or_else(|| product.clone());
            let platform = catalog
                .resolve_main(&product, &version, &config)
                .map(|build| build.platform)
                .context("cannot resolve requested build")?;

            let orchestrator = DownloadOrchestrator::new(config, catalog)?;
            let mut request = TaskRequest::new(product, version, PathBuf::new())
                .with_language(language)
                .with_display_name(display_name);
            request.destination = dest.unwrap_or_else(|| PathBuf::from(request.installer_name(&platform)));
            let id = orchestrator.create_task(request).await?;

            let reporter = ConsoleReporter::new(cli.verbose).for_task(id).spawn(orchestrator.subscribe());
            let run = orchestrator.spawn(id);

            let interrupt = orchestrator.clone();
            let ctrl_c = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling task {}", id);
                    if let Err(e) = interrupt.cancel(id, false).await {
                        warn!("Failed to cancel task {}: {}", id, e);
                    }
                }
            });

            let outcome = run.await.context("download task panicked")?;
            ctrl_c.abort();
            let _ = ctrl_c.await;

            let result = match outcome {
                Ok(TaskOutcome::Completed) => orchestrator.installer_path(id).await.map_err(anyhow::Error::from),
                Ok(TaskOutcome::Cancelled) => Err(anyhow!("download cancelled")),
                Ok(TaskOutcome::Paused) => Err(anyhow!("download paused")),
                Err(e) => Err(anyhow::Error::from(e).context("download failed")),
            };

            // Events close with the last handle; the reporter prints what is queued first
            drop(orchestrator);
            let _ = reporter.await;

            let path = result?;
            info!("Installer ready at {}", path.display());
            println!("Installer ready at {}", path.display());
            Ok(())
        }
    }
}
