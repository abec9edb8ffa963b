use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct Opts {
    #[clap(long, default_value = "3")]
    pub replicas: usize,

    /// Number of injected faults
    #[clap(long, default_value = "20")]
    pub rounds: u32,

    /// Random seed; picked from entropy if not set
    #[clap(long)]
    pub seed: Option<u64>,

    /// Tick period in milliseconds; every other timing scales with it
    #[clap(long = "tick-ms", default_value = "100")]
    pub tick_ms: u64,
}

impl Opts {
    pub fn from_args() -> Self {
        Opts::parse()
    }
}
