use anyhow::Result;
use clap::{Parser, Subcommand};
use s3xfer::{cli, config, core};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "s3xfer")]
#[command(version, about = "S3 multipart transfer client with SigV4 signing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (environment variables are used when omitted)
    #[arg(long, global = true, env = "S3XFER_CONFIG")]
    config: Option<String>,

    /// Profile to use from config
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Disable TLS certificate verification
    #[arg(long, global = true)]
    insecure: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy an object, possibly between two profiles
    Cp {
        /// Source object (s3://bucket/key)
        source: String,

        /// Destination (s3://bucket/key or s3://bucket/prefix/)
        destination: String,

        /// Profile of the source endpoint (default: --profile)
        #[arg(long)]
        from: Option<String>,

        /// Profile of the destination endpoint (default: --profile)
        #[arg(long)]
        to: Option<String>,
    },

    /// Upload a local file
    Put {
        /// Local file
        file: PathBuf,

        /// Destination (s3://bucket/key or s3://bucket/prefix/)
        destination: String,
    },

    /// List in-progress multipart uploads
    Uploads {
        /// Bucket and optional key prefix (s3://bucket/prefix)
        path: String,
    },

    /// Abort abandoned multipart uploads
    Gc {
        /// Bucket (s3://bucket), or object when aborting a single upload
        path: String,

        /// Abort only this upload (path must name the object key)
        #[arg(long)]
        upload_id: Option<String>,

        /// Only abort uploads initiated more than this many hours ago
        #[arg(long)]
        older_than_hours: Option<u64>,
    },

    /// Print the canonical request and signature for a request
    Sign {
        /// HTTP method
        method: String,

        /// Target (s3://bucket/key)
        path: String,

        /// Query parameter as key=value (repeatable)
        #[arg(long = "query")]
        query: Vec<String>,

        /// File whose SHA-256 is the payload hash
        #[arg(long, conflicts_with = "unsigned")]
        payload: Option<PathBuf>,

        /// Use UNSIGNED-PAYLOAD
        #[arg(long)]
        unsigned: bool,

        /// Signing time (RFC 3339), default now
        #[arg(long)]
        timestamp: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // current_thread is enough: parts are driven concurrently inside one task
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let mut config = config::load_config(cli.config.as_deref(), cli.profile.as_deref())?;
    if cli.insecure {
        config.insecure_tls = true;
    }

    let core = core::Core::new(config)?;

    // Ctrl-C cancels in-flight transfers, which abort their sessions
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling transfer");
            on_signal.cancel();
        }
    });

    let profile = cli.profile.as_deref();
    match cli.command {
        Commands::Cp {
            source,
            destination,
            from,
            to,
        } => {
            let from = from.as_deref().or(profile);
            let to = to.as_deref().or(profile);
            cli::commands::cmd_cp(&core, &source, &destination, from, to, &cancel).await?;
        }
        Commands::Put { file, destination } => {
            cli::commands::cmd_put(&core, &file, &destination, &cancel).await?;
        }
        Commands::Uploads { path } => {
            cli::commands::cmd_uploads(&core, &path).await?;
        }
        Commands::Gc {
            path,
            upload_id,
            older_than_hours,
        } => {
            cli::commands::cmd_gc(&core, &path, upload_id.as_deref(), older_than_hours).await?;
        }
        Commands::Sign {
            method,
            path,
            query,
            payload,
            unsigned,
            timestamp,
        } => {
            cli::commands::cmd_sign(
                &core,
                &method,
                &path,
                &query,
                payload.as_deref(),
                unsigned,
                timestamp.as_deref(),
            )
            .await?;
        }
    }

    Ok(())
}
