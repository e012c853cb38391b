//! tandem-demo: a dapp and a wallet pairing over an in-process relay

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tandem_core::clock::SystemClock;
use tandem_core::jsonrpc::{JsonRpcResponse, RequestArguments};
use tandem_core::sequence::{
    Capabilities, ProposeParams, RespondParams, SequenceEngine, SequenceEvent, SequenceState, Signal,
};
use tandem_core::storage::{KeyValueStorage, MemoryStorage};
use tandem_core::{Client, ClientConfig, ClientDeps, Reason};
use tandem_crypto::KeyChain;
use tandem_transport::MemoryRelay;

#[derive(Debug, Parser)]
#[command(name = "tandem-demo", about = "Pair a dapp with a wallet and exchange requests")]
struct Cli {
    /// TOML configuration shared by both clients
    #[arg(short, long, env = "TANDEM_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `tandem_core=debug`
    #[arg(long)]
    log_level: Option<String>,

    /// Number of signing requests to send
    #[arg(long, default_value_t = 3)]
    requests: u32,

    /// Directory for SQLite databases, one per client
    #[cfg(feature = "sqlite")]
    #[arg(long)]
    db_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClientConfig::default(),
    };

    let level = cli.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let relay = MemoryRelay::new();
    let dapp = start_client(&cli, &relay, &config, "dapp", false).await?;
    let wallet = start_client(&cli, &relay, &config, "wallet", true).await?;

    let responder = tokio::spawn(run_wallet(wallet.session().clone()));

    let pairing = pair(&dapp, &wallet).await?;
    info!(topic = %pairing, "pairing settled");

    let session = connect(&dapp, &pairing).await?;
    info!(topic = %session, "session settled");

    for n in 0..cli.requests {
        let result = dapp
            .session()
            .request(
                &session,
                RequestArguments {
                    method: "personal_sign".into(),
                    params: json!([format!("message #{}", n), "0xabc"]),
                },
                Some("eip155:1".into()),
                None,
            )
            .await?;
        println!("personal_sign #{} -> {}", n, result);
    }

    wallet
        .session()
        .update(
            &session,
            SequenceState::new().with("accounts", json!(["eip155:1:0xabc"])),
        )
        .await?;
    dapp.session().ping(&session, None).await?;
    println!("session state: {}", json!(dapp.session().get(&session)?.state));

    dapp.session()
        .delete(&session, Reason::user_disconnected())
        .await?;
    dapp.pairing()
        .delete(&pairing, Reason::user_disconnected())
        .await?;

    responder.abort();
    dapp.shutdown().await?;
    wallet.shutdown().await?;
    info!("demo finished");
    Ok(())
}

async fn start_client(
    cli: &Cli,
    relay: &MemoryRelay,
    base: &ClientConfig,
    context: &str,
    controller: bool,
) -> Result<Client> {
    let config = ClientConfig {
        context: context.to_string(),
        controller,
        ..base.clone()
    };
    let client = Client::init(
        config,
        ClientDeps {
            crypto: Arc::new(KeyChain::new()),
            storage: open_storage(cli, context)?,
            transport: relay.client(),
            clock: Arc::new(SystemClock),
        },
    )
    .await?;
    Ok(client)
}

#[cfg(feature = "sqlite")]
fn open_storage(cli: &Cli, context: &str) -> Result<Arc<dyn KeyValueStorage>> {
    use tandem_core::sqlite_storage::SqliteStorage;

    match &cli.db_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(format!("{}.db", context));
            Ok(Arc::new(SqliteStorage::new(&path)?))
        }
        None => Ok(Arc::new(MemoryStorage::new())),
    }
}

#[cfg(not(feature = "sqlite"))]
fn open_storage(_cli: &Cli, _context: &str) -> Result<Arc<dyn KeyValueStorage>> {
    Ok(Arc::new(MemoryStorage::new()))
}

async fn pair(dapp: &Client, wallet: &Client) -> Result<String> {
    let mut events = dapp.pairing().subscribe();
    let pending = dapp.pairing().propose(ProposeParams::default()).await?;
    let Signal::Uri { uri } = &pending.proposal.signal else {
        bail!("pairing proposal without uri");
    };
    println!("pairing uri: {}", uri);

    let received = wallet.pair(uri).await?;
    wallet
        .pairing()
        .respond(RespondParams::approve(received.proposal))
        .await?;
    wait_settled(&mut events).await
}

async fn connect(dapp: &Client, pairing: &str) -> Result<String> {
    let mut events = dapp.session().subscribe();
    dapp.connect(
        pairing,
        ProposeParams {
            permissions: Capabilities::methods(["personal_sign"])
                .with_chains(["eip155:1"])
                .with_notifications(["accountsChanged"]),
            ..ProposeParams::default()
        },
    )
    .await?;
    wait_settled(&mut events).await
}

async fn wait_settled(
    events: &mut tokio::sync::broadcast::Receiver<SequenceEvent>,
) -> Result<String> {
    loop {
        match events.recv().await {
            Ok(SequenceEvent::Settled(settled)) => return Ok(settled.topic),
            Ok(SequenceEvent::Deleted { reason, .. }) => {
                bail!("proposal dropped: {}", reason.message)
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => bail!("event stream closed"),
        }
    }
}

/// Approve every session proposal and sign every request.
async fn run_wallet(session: Arc<SequenceEngine>) {
    let mut events = session.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };
        match event {
            SequenceEvent::Proposed(pending) => {
                if let Err(e) = session.respond(RespondParams::approve(pending.proposal)).await {
                    warn!(error = %e, "failed to approve session");
                }
            }
            SequenceEvent::Request { topic, request, .. } => {
                let signature = json!({ "signed": request.params, "by": "wallet" });
                let response = JsonRpcResponse::result(request.id, signature);
                if let Err(e) = session.reply(&topic, response).await {
                    warn!(error = %e, "failed to answer request");
                }
            }
            _ => {}
        }
    }
}
