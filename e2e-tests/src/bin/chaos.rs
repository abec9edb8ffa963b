use derive_more::Display;
use error_stack::{Context, IntoReport, Report, ResultExt};
use pollward_e2e::{run_chaos, ChaosParams, Opts};
use rand::Rng;
use std::io;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Display)]
#[display(fmt = "application error")]
pub struct AppError;

impl Context for AppError {}

pub type AppResult<T> = error_stack::Result<T, AppError>;

#[tokio::main]
async fn main() -> AppResult<()> {
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

    let opts = Opts::from_args();
    let seed = opts.seed.unwrap_or_else(|| rand::thread_rng().gen());

    let report = run_chaos(
        ChaosParams::builder()
            .replicas(opts.replicas)
            .rounds(opts.rounds)
            .seed(seed)
            .tick(Duration::from_millis(opts.tick_ms))
            .build(),
    )
    .await
    .report()
    .change_context(AppError)
    .attach_printable_lazy(|| format!("seed {seed}"))?;

    info!(
        seed,
        faults = report.faults,
        elections = report.elections,
        max_checkpoint = report.max_checkpoint,
        "Chaos run finished"
    );

    if !report.is_clean() {
        let mut err = Report::new(AppError).attach_printable(format!("seed {seed}"));
        for violation in report.violations {
            err = err.attach_printable(violation);
        }
        return Err(err);
    }

    Ok(())
}
