use pollward_api::{InstanceId, Keys};
use std::time::Duration;
use typed_builder::TypedBuilder;

use crate::error::{ElectionError, ElectionResult};

/// Timing and identity of one elector instance
#[derive(TypedBuilder, Debug, Clone)]
pub struct Parameters {
    /// Namespaces every key (`/bots/{service}/...`)
    #[builder(setter(into))]
    pub service: String,

    #[builder(default = InstanceId::generate())]
    pub instance_id: InstanceId,

    /// Period of the state machine tick
    #[builder(default = Parameters::DEFAULT_TICK_PERIOD)]
    pub tick_period: Duration,

    /// TTL of the lease the leader record is bound to
    #[builder(default = Parameters::DEFAULT_LEASE_TTL)]
    pub lease_ttl: Duration,

    /// How often the leader lease is refreshed; `lease_ttl / 3` if unset
    #[builder(default, setter(strip_option))]
    pub lease_refresh: Option<Duration>,

    /// How often the health record is rewritten
    #[builder(default = Parameters::DEFAULT_HEALTH_INTERVAL)]
    pub health_interval: Duration,

    /// TTL of the health record; `lease_ttl` if unset
    #[builder(default, setter(strip_option))]
    pub health_ttl: Option<Duration>,

    /// Upper bound on any single store call
    #[builder(default = Parameters::DEFAULT_STORE_TIMEOUT)]
    pub store_timeout: Duration,

    /// Cap of the retry backoff after contention or store faults
    #[builder(default = Parameters::DEFAULT_BACKOFF_MAX)]
    pub backoff_max: Duration,

    /// Connection attempts at startup before giving up for good
    #[builder(default = Parameters::DEFAULT_STARTUP_PROBE_ATTEMPTS)]
    pub startup_probe_attempts: u32,
}

impl Parameters {
    pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(1);
    pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15);
    pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);
    pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
    pub const DEFAULT_STARTUP_PROBE_ATTEMPTS: u32 = 3;

    pub fn keys(&self) -> Keys {
        Keys::new(&self.service)
    }

    pub fn refresh_period(&self) -> Duration {
        self.lease_refresh.unwrap_or(self.lease_ttl / 3)
    }

    pub fn health_record_ttl(&self) -> Duration {
        self.health_ttl.unwrap_or(self.lease_ttl)
    }

    /// Below this much remaining lease time a leader that could not
    /// refresh steps down on its own
    pub fn step_down_margin(&self) -> Duration {
        self.lease_ttl / 2
    }

    pub fn validate(&self) -> ElectionResult<()> {
        let invalid = |msg: String| Err(ElectionError::InvalidParameters(msg));

        if self.service.is_empty() {
            return invalid("service name must not be empty".into());
        }
        if self.tick_period.is_zero() || self.health_interval.is_zero() {
            return invalid("tick period and health interval must be non-zero".into());
        }
        if self.lease_ttl < self.tick_period * 3 {
            return invalid(format!(
                "lease ttl {:?} must be at least 3 tick periods ({:?})",
                self.lease_ttl, self.tick_period
            ));
        }
        if self.refresh_period().is_zero() || self.lease_ttl / 2 <= self.refresh_period() {
            return invalid(format!(
                "lease refresh {:?} must be non-zero and below half the lease ttl {:?}",
                self.refresh_period(),
                self.lease_ttl
            ));
        }
        if self.health_record_ttl() / 2 <= self.health_interval {
            return invalid(format!(
                "health interval {:?} must be below half the health ttl {:?}",
                self.health_interval,
                self.health_record_ttl()
            ));
        }
        // a partitioned leader must notice before its health record expires
        if self.health_record_ttl()
            <= self.health_interval + self.step_down_margin() + self.tick_period
        {
            return invalid(format!(
                "health ttl {:?} too short to outlive a partitioned leader's step-down",
                self.health_record_ttl()
            ));
        }
        if self.lease_ttl <= self.store_timeout {
            return invalid(format!(
                "store timeout {:?} must be below the lease ttl {:?}",
                self.store_timeout, self.lease_ttl
            ));
        }
        if self.startup_probe_attempts == 0 {
            return invalid("at least one startup probe attempt is required".into());
        }
        Ok(())
    }
}

#[test]
fn defaults_are_valid() {
    let params = Parameters::builder().service("svc").build();
    params.validate().unwrap();
    assert_eq!(params.refresh_period(), Duration::from_secs(5));
    assert_eq!(params.health_record_ttl(), Duration::from_secs(15));
}

#[test]
fn rejects_unsafe_timings() {
    let too_short_ttl = Parameters::builder()
        .service("svc")
        .lease_ttl(Duration::from_secs(2))
        .build();
    assert!(too_short_ttl.validate().is_err());

    let slow_refresh = Parameters::builder()
        .service("svc")
        .lease_refresh(Duration::from_secs(8))
        .build();
    assert!(slow_refresh.validate().is_err());

    let slow_store = Parameters::builder()
        .service("svc")
        .store_timeout(Duration::from_secs(15))
        .build();
    assert!(slow_store.validate().is_err());

    let short_health = Parameters::builder()
        .service("svc")
        .health_ttl(Duration::from_secs(12))
        .build();
    assert!(matches!(
        short_health.validate(),
        Err(ElectionError::InvalidParameters(_))
    ));
}
