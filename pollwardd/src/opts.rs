use clap::{Args, Parser, Subcommand};
use pollward::api::Keys;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Opts {
    /// etcd v3 JSON gateway
    #[arg(
        long = "store-url",
        env = "POLLWARD_STORE_URL",
        default_value = "http://127.0.0.1:2379",
        global = true
    )]
    pub store_url: String,

    /// Key namespace; derived from the bot token if not set
    #[arg(long = "service", env = "POLLWARD_SERVICE", global = true)]
    pub service: Option<String>,

    #[arg(long = "bot-token", env = "POLLWARD_BOT_TOKEN", hide_env_values = true, global = true)]
    pub bot_token: Option<String>,

    /// Upper bound on every coordination store call
    #[arg(long = "store-timeout", value_parser = parse_duration, default_value = "2s", global = true)]
    pub store_timeout: Duration,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Join the replica set and poll while elected
    Run(RunOpts),
    /// Print the cluster status as JSON and exit
    Status,
}

#[derive(Args, Debug, Clone)]
pub struct RunOpts {
    /// Work records are appended here, one JSON document per line
    #[arg(long = "queue", env = "POLLWARD_QUEUE", default_value = "/var/lib/pollwardd/work.jsonl")]
    pub queue: PathBuf,

    #[arg(long = "tick", value_parser = parse_duration)]
    pub tick: Option<Duration>,

    #[arg(long = "lease-ttl", value_parser = parse_duration)]
    pub lease_ttl: Option<Duration>,

    #[arg(long = "health-interval", value_parser = parse_duration)]
    pub health_interval: Option<Duration>,

    /// Long poll timeout passed to `getUpdates`
    #[arg(long = "poll-timeout", value_parser = parse_duration, default_value = "30s")]
    pub poll_timeout: Duration,

    #[arg(long = "api-url", default_value = "https://api.telegram.org")]
    pub api_url: String,
}

impl Opts {
    pub fn from_args() -> Self {
        Opts::parse()
    }

    pub fn service(&self) -> anyhow::Result<String> {
        match (&self.service, &self.bot_token) {
            (Some(service), _) => Ok(service.clone()),
            (None, Some(token)) => Ok(Keys::service_for_token(token)),
            (None, None) => anyhow::bail!("either --service or --bot-token is required"),
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DurationParseError {
    #[error("invalid number: {0}")]
    Number(#[from] ParseIntError),
    #[error("missing unit (ms, s, m, h)")]
    Unit,
}

fn parse_duration(s: &str) -> std::result::Result<Duration, DurationParseError> {
    let s = s.trim().to_lowercase();

    Ok(if let Some(num) = s.strip_suffix("ms") {
        Duration::from_millis(u64::from_str(num)?)
    } else if let Some(num) = s.strip_suffix('s') {
        Duration::from_secs(u64::from_str(num)?)
    } else if let Some(num) = s.strip_suffix('m') {
        Duration::from_secs(u64::from_str(num)? * 60)
    } else if let Some(num) = s.strip_suffix('h') {
        Duration::from_secs(u64::from_str(num)? * 60 * 60)
    } else {
        return Err(DurationParseError::Unit);
    })
}

#[test]
fn parse_duration_test() {
    assert_eq!(parse_duration("0s"), Ok(Duration::ZERO));
    assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
    assert_eq!(parse_duration("15s"), Ok(Duration::from_secs(15)));
    assert_eq!(parse_duration(" 2M "), Ok(Duration::from_secs(120)));
    assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
    assert_eq!(parse_duration("15"), Err(DurationParseError::Unit));
    assert!(parse_duration("s").is_err());
    assert!(parse_duration("1.5s").is_err());
    assert!(parse_duration("1w").is_err());
}

#[test]
fn service_defaults_to_token_tail() {
    let opts = Opts::parse_from([
        "pollwardd",
        "--bot-token",
        "123456:ABCDEFGHIJKLMNOP",
        "status",
    ]);
    assert_eq!(opts.service().unwrap(), "telegram_bot_GHIJKLMNOP");

    let opts = Opts::parse_from(["pollwardd", "status", "--service", "svc"]);
    assert_eq!(opts.service().unwrap(), "svc");
}
