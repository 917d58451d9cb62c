//! docwire - command-line client for the legacy document-database wire protocol
//!
//! Runs one command per invocation and prints the result as JSON.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use docwire_client::{Client, Config, TopologyKind};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "docwire")]
#[command(about = "Command-line client for legacy wire-protocol document databases")]
#[command(version)]
struct Cli {
    /// Server host name, address, or Unix socket path
    #[arg(long, env = "DOCWIRE_HOST")]
    host: Option<String>,

    /// Server port
    #[arg(short, long, env = "DOCWIRE_PORT")]
    port: Option<u16>,

    /// YAML configuration file
    #[arg(short, long, env = "DOCWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Deployment kind: single, replica_set or routed
    #[arg(long, env = "DOCWIRE_TOPOLOGY")]
    topology: Option<String>,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long, env = "DOCWIRE_TLS_ENABLED")]
    tls: bool,

    /// Path to CA certificate for server verification
    #[arg(long, env = "DOCWIRE_TLS_CA")]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (for mTLS)
    #[arg(long, env = "DOCWIRE_TLS_CERT")]
    client_cert: Option<PathBuf>,

    /// Path to client private key (for mTLS)
    #[arg(long, env = "DOCWIRE_TLS_KEY")]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to the host)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask the server to describe itself
    Ping,

    /// Run an admin command
    Command {
        /// Database name
        db: String,

        /// Command document JSON (or @file.json to read from file)
        command: String,
    },

    /// Query a collection
    Find {
        /// Namespace (db.collection)
        ns: String,

        /// Filter JSON
        #[arg(short, long)]
        filter: Option<String>,

        /// Sort JSON, e.g. '{"age": -1}'
        #[arg(short, long)]
        sort: Option<String>,

        /// Maximum documents to return
        #[arg(short, long)]
        limit: Option<i32>,

        /// Documents to skip
        #[arg(long)]
        skip: Option<i32>,

        /// Documents per batch
        #[arg(short, long)]
        batch_size: Option<i32>,

        /// Print the query plan instead of the documents
        #[arg(long)]
        explain: bool,
    },

    /// Count documents in a collection
    Count {
        /// Namespace (db.collection)
        ns: String,

        /// Filter JSON
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Insert documents
    Insert {
        /// Namespace (db.collection)
        ns: String,

        /// JSON array of documents (or @file.json)
        documents: String,

        /// Keep going after a failed insert
        #[arg(long)]
        unordered: bool,

        /// Write concern w (number or tag)
        #[arg(short, long)]
        w: Option<String>,
    },

    /// Update documents
    Update {
        /// Namespace (db.collection)
        ns: String,

        /// Selector JSON
        query: String,

        /// Update JSON
        update: String,

        /// Insert when nothing matches
        #[arg(long)]
        upsert: bool,

        /// Update every match
        #[arg(long)]
        multi: bool,
    },

    /// Remove documents
    Remove {
        /// Namespace (db.collection)
        ns: String,

        /// Selector JSON
        query: String,

        /// Remove at most one document
        #[arg(long)]
        single: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Config file first, then environment, then flags
    let mut config = match cli.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env_overrides();

    if let Some(ref host) = cli.host {
        config.connection.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.connection.port = port;
    }
    if let Some(ref topology) = cli.topology {
        config.topology = topology.parse::<TopologyKind>()?;
    }

    if cli.tls || cli.ca_cert.is_some() || cli.client_cert.is_some() || cli.insecure {
        config.tls.enabled = true;

        if let Some(ref path) = cli.ca_cert {
            config.tls.ca_cert_path = Some(path.clone());
        }
        if let (Some(cert), Some(key)) = (&cli.client_cert, &cli.client_key) {
            config.tls.client_cert_path = Some(cert.clone());
            config.tls.client_key_path = Some(key.clone());
        } else if cli.client_cert.is_some() || cli.client_key.is_some() {
            eprintln!(
                "{}: --client-cert and --client-key must be used together",
                "Error".red()
            );
            std::process::exit(1);
        }
        if cli.insecure {
            config.tls.reject_unauthorized = false;
        }
        if cli.server_name.is_some() {
            config.tls.server_name = cli.server_name.clone();
        }
    }

    let client = Client::connect(&config).await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;
    tracing::info!(
        "connected to {}:{}",
        config.connection.host,
        config.connection.port
    );

    let result = commands::execute(&client, cli.command).await;
    client.close().await;

    match result {
        Ok(output) => {
            println!("{}", output);
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }

    Ok(())
}
