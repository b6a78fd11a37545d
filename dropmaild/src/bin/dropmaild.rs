use anyhow::Context as _;
use dropmail_lib::crypto::public_key_to_pem;
use dropmail_transport::{
    rts::{ChannelEstablished, IncomingRts},
    TransportManager, TransportMessage, Worker,
};
use dropmaild::{
    node::LocalNode,
    secret::Secret,
    storage::{Persister, Storage},
    Config,
};
use std::{path::PathBuf, sync::Arc};
use structopt::StructOpt;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(StructOpt, Debug)]
struct Args {
    /// set log levels
    ///
    /// useful for trying to debug some operations happening
    /// while executing some of the commands
    #[structopt(long = "log-level", default_value = "info", global = true)]
    log_level: Level,

    /// path of the configuration file of the server
    #[structopt(long = "config")]
    config: PathBuf,

    /// write the public key PEM at the given path
    ///
    /// to be given to the peers of this node
    #[structopt(long = "export-public-key")]
    export_public_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    if let Err(error) = main_run().await {
        eprintln!("{:?}", error);
        std::process::exit(1);
    }
}

async fn main_run() -> anyhow::Result<()> {
    let args = Args::from_args();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = Config::from_file(args.config).context("cannot load initial settings")?;

    let secret = Secret::new(config.secret).context("Cannot start the secret Key Manager")?;
    if let Some(path) = args.export_public_key {
        let pem = public_key_to_pem(secret.crypto().public_key())?;
        std::fs::write(&path, pem)
            .with_context(|| format!("Cannot write the public key in {}", path.display()))?;
    }

    let storage = Storage::new(config.storage.clone()).context("Cannot load storage")?;

    let node = LocalNode::new(storage.db()).context("Cannot load the local node")?;
    node.register_identity(&secret.account().identity, secret.crypto().public_key())?;
    node.register_peers(&config.peers)
        .context("Cannot register the peers")?;

    let transport = TransportManager::new(
        config.transport,
        secret.account().clone(),
        secret.crypto().clone(),
        Arc::new(node),
    )
    .context("Cannot load the transport")?;
    let transport = Arc::new(transport);

    transport.set_on_message_received(Arc::new(|message: &TransportMessage| {
        tracing::info!(
            channel = %message.channel_id,
            message = %message.id,
            sender = %message.sender,
            subject = %message.subject,
            "new message"
        )
    }));
    transport.set_on_rts_received(Arc::new(|incoming: &IncomingRts| {
        tracing::info!(
            channel = %incoming.payload.channel_id,
            sender = %incoming.payload.sender_identity,
            "new channel request"
        )
    }));
    transport.set_on_channel_established(Arc::new(|established: &ChannelEstablished| {
        tracing::info!(
            channel = %established.channel_id,
            remote = %established.remote_identity,
            "channel established"
        )
    }));

    storage
        .restore(&transport)
        .await
        .context("Cannot restore the transport state")?;

    let mut workers = transport.start();
    workers.push(Worker::spawn(
        Arc::new(Persister::new(storage.clone(), Arc::clone(&transport))),
        config.storage.persist_rate,
    ));

    println!("ctrl-c to stop the node...");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shuting down via CTRL-C instruction")
        }
    }

    workers.stop().await;

    storage
        .save(&transport)
        .context("Cannot save the transport state")?;

    Ok(())
}
