//! Tessera CLI: send and receive object graphs, manage accounts.

mod document;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tessera_core::{
    Account, AccountStore, ObjectId, ReceiveOptions, SendOptions, ServerTransport,
    SqliteTransport, Transport, receive, send,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(author = "Tessera Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Content-addressed object graph exchange", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage server accounts
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },

    /// Send a JSON document to a stream, printing the root hash
    Send {
        /// JSON document to send
        file: PathBuf,

        /// Target stream id
        #[arg(short, long)]
        stream: String,

        #[command(flatten)]
        server: ServerArgs,

        /// Skip the local cache, write to the server only
        #[arg(long)]
        no_cache: bool,
    },

    /// Receive a graph by root hash and render it as JSON
    Receive {
        /// Root object hash
        id: String,

        /// Source stream id
        #[arg(short, long)]
        stream: String,

        #[command(flatten)]
        server: ServerArgs,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Inspect the local object cache
    Local {
        #[command(subcommand)]
        command: LocalCommands,
    },
}

#[derive(Subcommand, Debug)]
enum AccountCommands {
    /// Add an account
    Add {
        name: String,
        #[arg(short, long)]
        server: String,
        #[arg(short, long)]
        token: Option<String>,
    },
    /// List accounts
    List,
    /// Remove an account
    Remove { name: String },
    /// Mark an account as the default
    Default { name: String },
}

#[derive(Subcommand, Debug)]
enum LocalCommands {
    /// Print one cached object document
    Get {
        /// Object hash
        id: String,
        /// Cache database (the standard cache when omitted)
        #[arg(long)]
        cache: Option<PathBuf>,
    },
}

/// Where to find the remote store: an explicit server URL, a named account,
/// or the default account.
#[derive(clap::Args, Debug)]
struct ServerArgs {
    /// Server URL (overrides any account)
    #[arg(long)]
    server: Option<String>,

    /// Bearer token, only meaningful with --server
    #[arg(long)]
    token: Option<String>,

    /// Account name (the default account when omitted)
    #[arg(short, long)]
    account: Option<String>,
}

impl ServerArgs {
    fn resolve(&self) -> Result<(String, Option<String>)> {
        if let Some(server) = &self.server {
            return Ok((server.clone(), self.token.clone()));
        }
        let store = AccountStore::open_default();
        let account = match &self.account {
            Some(name) => store.get(name)?,
            None => store
                .default_account()
                .context("no account configured; add one or pass --server")?,
        };
        Ok((account.server_url, account.token))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    match cli.command {
        Commands::Account { command } => run_account(command),
        Commands::Send {
            file,
            stream,
            server,
            no_cache,
        } => run_send(file, stream, server, no_cache).await,
        Commands::Receive {
            id,
            stream,
            server,
            out,
        } => run_receive(id, stream, server, out).await,
        Commands::Local { command } => run_local(command).await,
    }
}

fn run_account(command: AccountCommands) -> Result<()> {
    let store = AccountStore::open_default();
    match command {
        AccountCommands::Add {
            name,
            server,
            token,
        } => {
            store.add(Account::new(name.clone(), server, token))?;
            println!("added account {}", name);
        }
        AccountCommands::List => {
            let accounts = store.list()?;
            if accounts.is_empty() {
                println!("no accounts configured");
            }
            for account in accounts {
                let marker = if account.is_default { "*" } else { " " };
                println!("{} {:20} {}", marker, account.name, account.server_url);
            }
        }
        AccountCommands::Remove { name } => {
            store.remove(&name)?;
            println!("removed account {}", name);
        }
        AccountCommands::Default { name } => {
            store.set_default(&name)?;
            println!("default account is now {}", name);
        }
    }
    Ok(())
}

async fn run_send(
    file: PathBuf,
    stream: String,
    server: ServerArgs,
    no_cache: bool,
) -> Result<()> {
    let data = std::fs::read_to_string(&file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let doc: serde_json::Value =
        serde_json::from_str(&data).with_context(|| format!("{} is not JSON", file.display()))?;
    let root = document::json_to_base(&doc)?;

    let (server_url, token) = server.resolve()?;
    let remote: Arc<dyn Transport> = Arc::new(ServerTransport::new(&server_url, &stream, token)?);

    let options = SendOptions {
        use_default_cache: !no_cache,
        ..Default::default()
    };
    let result = send(&root, vec![remote], options).await?;

    eprintln!(
        "sent {} objects to {}/{}",
        result.object_count, server_url, stream
    );
    println!("{}", result.root_id);
    Ok(())
}

async fn run_receive(
    id: String,
    stream: String,
    server: ServerArgs,
    out: Option<PathBuf>,
) -> Result<()> {
    let id = ObjectId::from_hex(&id).map_err(|e| anyhow!("bad object hash {}: {}", id, e))?;
    let (server_url, token) = server.resolve()?;
    let remote: Arc<dyn Transport> = Arc::new(ServerTransport::new(&server_url, &stream, token)?);

    let options = ReceiveOptions {
        on_total_children: Some(Arc::new(|total| {
            eprintln!("expecting {} objects", total);
        })),
        ..Default::default()
    };
    let root = receive(id, Some(remote), None, options).await?;

    let rendered = serde_json::to_string_pretty(&document::base_to_json(&root)?)?;
    match out {
        Some(path) => {
            std::fs::write(&path, rendered)
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("wrote {}", path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

async fn run_local(command: LocalCommands) -> Result<()> {
    match command {
        LocalCommands::Get { id, cache } => {
            let id = ObjectId::from_hex(&id).map_err(|e| anyhow!("bad object hash: {}", e))?;
            let transport = match cache {
                Some(path) => SqliteTransport::open(&path)?,
                None => SqliteTransport::open_default()?,
            };
            match transport.get_object(id).await? {
                Some(json) => println!("{}", json),
                None => return Err(anyhow!("object {} not in the local cache", id)),
            }
        }
    }
    Ok(())
}
