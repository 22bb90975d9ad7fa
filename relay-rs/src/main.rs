use anyhow::Context;
use clap::{Parser, Subcommand};
use relay_rs::config::Config;
use relay_rs::directory::{hash_password, Directory, MemoryDirectory, PASSWORD_SALT_SECRET};
use relay_rs::queue::{DurableQueue, MemoryQueue, SqliteQueue};
use relay_rs::security::tls::generate_self_signed_cert;
use relay_rs::security::TlsConfig;
use relay_rs::smtp::SmtpServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "relay-rs")]
#[command(about = "SMTP front end with a durable queue and MX relay", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override smtp.listen_addr
    #[arg(short, long)]
    listen: Option<String>,

    /// Debug logging, including the SMTP dialogue
    #[arg(long)]
    debug: bool,

    /// Keep the queue in memory instead of SQLite
    #[arg(long)]
    memory_queue: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print an argon2 hash for a directory file's `password_hash`
    HashPassword {
        password: String,
    },
    /// Write a self-signed certificate and key for testing STARTTLS
    GenerateCert {
        domain: String,
        #[arg(long, default_value = "cert.pem")]
        cert: PathBuf,
        #[arg(long, default_value = "key.pem")]
        key: PathBuf,
    },
}

fn init_logging(config: &Config, debug: bool) {
    let default_filter = if debug {
        "relay_rs=debug".to_string()
    } else {
        format!("relay_rs={}", config.logging.level)
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(listen) = cli.listen {
        config.smtp.listen_addr = listen;
    }

    let directory = match &config.directory.path {
        Some(path) => MemoryDirectory::from_file(path)
            .with_context(|| format!("Failed to load directory {}", path))?,
        None => MemoryDirectory::new(),
    };

    match cli.command {
        Some(Commands::HashPassword { password }) => {
            let secret = directory.config_secret(PASSWORD_SALT_SECRET);
            println!("{}", hash_password(secret.as_deref(), &password)?);
            return Ok(());
        }
        Some(Commands::GenerateCert { domain, cert, key }) => {
            generate_self_signed_cert(&domain, &cert, &key)?;
            println!("Wrote {} and {}", cert.display(), key.display());
            return Ok(());
        }
        None => {}
    }

    init_logging(&config, cli.debug);
    info!("Starting relay-rs v{}", env!("CARGO_PKG_VERSION"));
    info!("  SMTP listening on: {}", config.smtp.listen_addr);
    info!("  Hostname: {}", config.server.hostname);
    info!("  Local domains: {:?}", config.delivery.local_domains);
    if config.directory.path.is_none() {
        warn!("No directory configured: local recipients and AUTH will be rejected");
    }

    let queue: Arc<dyn DurableQueue> = if cli.memory_queue {
        warn!("Using in-memory queue, queued mail is lost on restart");
        Arc::new(MemoryQueue::new())
    } else {
        Arc::new(
            SqliteQueue::new(&config.queue.database_url)
                .await
                .context("Failed to open queue database")?,
        )
    };

    let tls = match (&config.smtp.tls_cert_path, &config.smtp.tls_key_path) {
        (Some(cert), Some(key)) => Some(TlsConfig::from_pem_files(cert, key)?),
        _ => {
            info!("No TLS certificate configured, STARTTLS disabled");
            None
        }
    };

    let mut server = SmtpServer::new(config, Arc::new(directory), queue);
    if let Some(tls) = tls {
        server = server.with_tls(tls);
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                signal.cancel();
            }
            Err(e) => error!("Failed to listen for ctrl-c: {}", e),
        }
    });

    server.run(shutdown).await?;
    info!("relay-rs stopped");
    Ok(())
}
