use std::time::Duration;

/// Timeouts of a coordinated session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// How often the coordinator re-sends the initiate message.
    pub initiate_period: Duration,
    /// How long a participant waits for the coordinator to start the session.
    pub coordinator_timeout: Duration,
    /// Upper bound for one attempt of the session.
    pub tss_timeout: Duration,
    /// How many times a failed attempt is retried.
    pub max_retries: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            initiate_period: Duration::from_secs(15),
            coordinator_timeout: Duration::from_secs(3 * 60),
            tss_timeout: Duration::from_secs(15 * 60),
            max_retries: 3,
        }
    }
}

/// Timeouts of the bully election.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BullyConfig {
    /// How long to wait for higher-priority peers to answer pings.
    pub ping_wait_time: Duration,
    /// Pause before retrying after a failed round.
    pub ping_back_off: Duration,
    /// How often pings are re-sent within the wait time.
    pub ping_interval: Duration,
    /// How long to wait for the elected peer to confirm.
    pub election_wait_time: Duration,
    /// Upper bound for the whole election.
    pub bully_wait_time: Duration,
}

impl Default for BullyConfig {
    fn default() -> Self {
        Self {
            ping_wait_time: Duration::from_secs(1),
            ping_back_off: Duration::from_secs(1),
            ping_interval: Duration::from_secs(1),
            election_wait_time: Duration::from_secs(2),
            bully_wait_time: Duration::from_secs(25),
        }
    }
}
