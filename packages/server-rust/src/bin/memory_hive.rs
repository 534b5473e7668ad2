//! Local demo: one memory chained item plus a long-running write operation
//! answered by an in-process loopback peer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use datahive_core::messages::FIELD_ID;
use datahive_core::{codes, Attributes, Message, Variant};
use datahive_server::chain::items::{ATTR_CHAIN_INPUT_ADD, SCALE_TAG};
use datahive_server::chain::ItemListener;
use datahive_server::network::{LongRunningError, LongRunningListener};
use datahive_server::telemetry::init_tracing;
use datahive_server::{
    ChainItemRegistry, ChainedItem, ChannelConnection, Connection, HiveConfig,
    LongRunningController, LongRunningState, MessageDispatcher,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "memory-hive", about = "Runs a memory chained item and a loopback long-running operation")]
struct Args {
    /// JSON configuration file; defaults apply when omitted.
    #[arg(long, env = "DATAHIVE_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter directive, overriding the configuration.
    #[arg(long, env = "DATAHIVE_LOG")]
    log_filter: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    /// Identifier of the demo item.
    #[arg(long, default_value = "memory.demo")]
    item_id: String,

    /// Delay before the loopback peer reports the operation result.
    #[arg(long, default_value_t = 200)]
    result_delay_ms: u64,
}

struct LoggingItemListener;

impl ItemListener for LoggingItemListener {
    fn data_changed(&self, item_id: &str, value: Option<&Variant>, attributes: &Attributes) {
        let value = value.map(ToString::to_string);
        info!(item = item_id, ?value, changed = attributes.len(), "item changed");
    }
}

struct LoggingOperationListener;

impl LongRunningListener for LoggingOperationListener {
    fn state_changed(
        &self,
        state: LongRunningState,
        reply: Option<&Message>,
        error: Option<&LongRunningError>,
    ) {
        match error {
            Some(error) => warn!(%state, %error, "operation state changed"),
            None => info!(%state, reply = ?reply.map(|r| r.command_code), "operation state changed"),
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<HiveConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            HiveConfig::from_json(&raw)?
        }
        None => HiveConfig::default(),
    };
    if let Some(filter) = &args.log_filter {
        config.logging.filter.clone_from(filter);
    }
    if args.json_logs {
        config.logging.json = true;
    }
    Ok(config)
}

fn run_chain(item_id: &str) -> anyhow::Result<Arc<ChainedItem>> {
    let registry = Arc::new(ChainItemRegistry::with_builtin());
    let item = ChainedItem::memory(item_id, registry)?;
    item.add_listener(Arc::new(LoggingItemListener));

    let mut reconfigure = Attributes::new();
    reconfigure.insert(ATTR_CHAIN_INPUT_ADD.to_string(), Variant::from(SCALE_TAG));
    item.set_attributes(&reconfigure);

    let mut scale = Attributes::new();
    scale.insert("scale.active".to_string(), Variant::Bool(true));
    scale.insert("scale.factor".to_string(), Variant::Double(2.0));
    let results = item.set_attributes(&scale);
    info!(?results, "configured scale stage");

    item.write_value(Variant::Long(21))?;
    info!(
        item = item.id(),
        value = %item.value(),
        chain = %item.attributes().get("chain.value").cloned().unwrap_or_default(),
        "chain ready"
    );
    Ok(item)
}

/// Answers every write request with a grant, then reports the result.
async fn loopback_peer(
    connection: Arc<ChannelConnection>,
    mut outbound: mpsc::Receiver<Message>,
    result_delay: Duration,
) {
    let mut next_id = 1_i64;
    while let Some(message) = outbound.recv().await {
        match message.command_code {
            codes::CC_WRITE_OPERATION => {
                let id = next_id;
                next_id += 1;
                info!(id, "peer granting write operation");
                connection.handle_incoming(
                    Message::reply_to(&message, codes::CC_ACK).with_value(FIELD_ID, id),
                );
                let connection = Arc::clone(&connection);
                tokio::spawn(async move {
                    tokio::time::sleep(result_delay).await;
                    connection.handle_incoming(
                        Message::new(codes::CC_WRITE_OPERATION_RESULT).with_value(FIELD_ID, id),
                    );
                });
            }
            codes::CC_CANCEL_OPERATION => {
                info!(id = ?message.get_long(FIELD_ID), "peer cancelling operation");
            }
            other => warn!(command_code = other, "peer ignoring message"),
        }
    }
}

fn write_request(item_id: &str, value: i64) -> Message {
    Message::new(codes::CC_WRITE_OPERATION)
        .with_value("item", item_id)
        .with_value("value", value)
}

async fn run_operation(
    config: &HiveConfig,
    item_id: &str,
    result_delay: Duration,
) -> anyhow::Result<()> {
    let dispatcher = Arc::new(MessageDispatcher::new());
    let (connection, outbound) = ChannelConnection::new(&config.connection, Arc::clone(&dispatcher));
    let peer = tokio::spawn(loopback_peer(Arc::clone(&connection), outbound, result_delay));

    let controller = Arc::new(LongRunningController::from_config(
        Arc::clone(&connection) as Arc<dyn Connection>,
        &config.long_running,
    ));
    controller.register(&dispatcher);

    let op = controller.start(write_request(item_id, 42), Some(Arc::new(LoggingOperationListener)));

    let wait = config.connection.reply_timeout + result_delay;
    let state = tokio::time::timeout(wait, op.wait_for_completion())
        .await
        .context("operation did not complete in time")?;
    info!(%state, id = ?op.id(), pending = controller.pending_count(), "operation finished");

    controller.unregister(&dispatcher);
    connection.close();
    peer.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.logging)?;
    info!(?config, "starting memory-hive");

    let _item = run_chain(&args.item_id)?;

    tokio::select! {
        result = run_operation(&config, &args.item_id, Duration::from_millis(args.result_delay_ms)) => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    info!("memory-hive done");
    Ok(())
}
