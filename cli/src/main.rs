//! Terminal driver for a running Conduit gateway.
//!
//! Two workflows: `tail` keeps a subscription open and prints every frame
//! the server pushes (resubscribing automatically after reconnects), and
//! `items` runs one CRUD request and prints the reply.

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;

use client::{ClientConfig, ClientError};
use messages::{ClientMessage, CrudAction, ItemsRequest, Query, SubscribeRequest};

const CONNECT_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("client error: {0}")]
    Client(#[from] ClientError),
    #[error("invalid JSON for `{flag}`: {source}")]
    InvalidJson {
        flag: &'static str,
        source: serde_json::Error,
    },
    #[error("server replied with an unexpected frame: {0}")]
    UnexpectedReply(String),
}

#[derive(Parser, Debug)]
#[command(name = "conduit-cli", about = "Conduit gateway websocket CLI")]
struct Cli {
    /// Gateway websocket endpoint.
    #[arg(long, env = "GATEWAY_URL", default_value = "ws://127.0.0.1:3000/websocket")]
    url: String,

    /// Access token sent in the connection-open AUTH.
    #[arg(long, env = "GATEWAY_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a collection and print every pushed frame.
    Tail(TailArgs),
    /// Run one CRUD request over the socket.
    Items(ItemsArgs),
}

#[derive(Args, Debug)]
struct TailArgs {
    collection: String,

    /// Subscribe to a single item by primary key.
    #[arg(long)]
    item: Option<String>,

    /// Attach the presence/focus side channel.
    #[arg(long)]
    status: bool,

    /// Query as JSON, e.g. '{"fields":["id","title"],"limit":10}'.
    #[arg(long)]
    query: Option<String>,
}

#[derive(Args, Debug)]
struct ItemsArgs {
    #[arg(value_enum)]
    action: CliAction,
    collection: String,

    /// Item payload as JSON (create/update).
    #[arg(long)]
    data: Option<String>,

    /// Primary key (read/update/delete).
    #[arg(long)]
    id: Option<String>,

    /// Query as JSON (read).
    #[arg(long)]
    query: Option<String>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CliAction {
    Create,
    Read,
    Update,
    Delete,
}

impl From<CliAction> for CrudAction {
    fn from(value: CliAction) -> Self {
        match value {
            CliAction::Create => Self::Create,
            CliAction::Read => Self::Read,
            CliAction::Update => Self::Update,
            CliAction::Delete => Self::Delete,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let mut config = ClientConfig::new(cli.url);
    if let Some(token) = cli.token {
        config = config.with_access_token(token);
    }

    let handle = client::connect(config);
    handle.wait_connected(CONNECT_DEADLINE).await?;

    match cli.command {
        Command::Tail(args) => run_tail(&handle, args).await,
        Command::Items(args) => run_items(&handle, args).await,
    }
}

async fn run_tail(handle: &client::Handle, args: TailArgs) -> Result<(), CliError> {
    let request = SubscribeRequest {
        collection: args.collection,
        item: args.item.map(parse_key),
        query: parse_json_flag::<Query>(args.query.as_deref(), "--query")?,
        status: args.status,
        uid: None,
    };

    let mut stream = handle.client().subscribe(request)?;

    // Reconnects drop server-side state; re-send the same subscription
    // (same uid) whenever the supervisor re-authenticates.
    let resubscribe = stream.request().clone();
    handle.on_connect(move |client| {
        let _ = client.send(ClientMessage::Subscribe(resubscribe.clone()));
    });

    loop {
        tokio::select! {
            frame = stream.recv() => match frame {
                Some(frame) => print_json(&frame),
                None => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    stream.unsubscribe()?;
    Ok(())
}

async fn run_items(handle: &client::Handle, args: ItemsArgs) -> Result<(), CliError> {
    let request = ItemsRequest {
        collection: args.collection,
        action: args.action.into(),
        data: parse_json_flag::<Value>(args.data.as_deref(), "--data")?,
        id: args.id.map(parse_key),
        ids: None,
        query: parse_json_flag::<Query>(args.query.as_deref(), "--query")?,
        uid: None,
    };

    let reply = handle.client().request(ClientMessage::Items(request)).await?;
    match reply {
        messages::ServerMessage::Items { .. } | messages::ServerMessage::Error { .. } => {
            print_json(&reply);
            Ok(())
        }
        other => Err(CliError::UnexpectedReply(format!("{other:?}"))),
    }
}

fn parse_json_flag<T: serde::de::DeserializeOwned>(
    raw: Option<&str>,
    flag: &'static str,
) -> Result<Option<T>, CliError> {
    raw.map(|text| serde_json::from_str(text).map_err(|source| CliError::InvalidJson { flag, source }))
        .transpose()
}

/// Keys arrive as shell strings; keep numeric keys numeric.
fn parse_key(raw: String) -> Value {
    raw.parse::<i64>().map_or(Value::String(raw), Value::from)
}

fn print_json<T: serde::Serialize + std::fmt::Debug>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => println!("{rendered}"),
        Err(_) => println!("{value:?}"),
    }
}
