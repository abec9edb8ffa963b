#![deny(clippy::as_conversions)]
use opts::{Command, Opts, RunOpts};
use pollward::store::etcd::EtcdGatewayStore;
use pollward::supervisor::PollingSupervisor;
use pollward::{CoordinationStore, Parameters, StoreHandle};
use pollwardd::{JsonLinesSink, Node, TelegramSource};
use std::io;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod opts;

fn main() -> anyhow::Result<()> {
    init_logging();

    let opts = Opts::from_args();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match &opts.command {
            Command::Run(run_opts) => run(&opts, run_opts).await,
            Command::Status => status(&opts).await,
        }
    })
}

async fn run(opts: &Opts, run_opts: &RunOpts) -> anyhow::Result<()> {
    let Some(token) = opts.bot_token.as_deref() else {
        anyhow::bail!("--bot-token is required to run");
    };

    let params = Parameters::builder()
        .service(opts.service()?)
        .store_timeout(opts.store_timeout);
    let mut params = params.build();
    if let Some(tick) = run_opts.tick {
        params.tick_period = tick;
    }
    if let Some(lease_ttl) = run_opts.lease_ttl {
        params.lease_ttl = lease_ttl;
    }
    if let Some(health_interval) = run_opts.health_interval {
        params.health_interval = health_interval;
    }

    let source = TelegramSource::new(&run_opts.api_url, token, run_opts.poll_timeout)?;
    let sink = JsonLinesSink::open(&run_opts.queue).await?;
    let supervisor = Arc::new(PollingSupervisor::new(source, sink));

    let node = Node::new(params, connect(opts)?, supervisor).await?;
    node.get_ctrl().install_signal_handler()?;
    node.wait().await;

    Ok(())
}

async fn status(opts: &Opts) -> anyhow::Result<()> {
    let store = StoreHandle::new(connect(opts)?, opts.store_timeout);
    let keys = pollward::api::Keys::new(&opts.service()?);
    println!("{}", pollwardd::cluster_status_json(store, keys).await?);
    Ok(())
}

fn connect(opts: &Opts) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    Ok(Arc::new(EtcdGatewayStore::new(
        &opts.store_url,
        opts.store_timeout,
    )?))
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(atty::is(atty::Stream::Stderr))
                .with_writer(io::stderr),
        )
        .init();
}
