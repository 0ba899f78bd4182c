use std::convert::TryFrom;
use tokio::time::Duration;

/// Tunable timing knobs. Every field defaults to the values the protocol was
/// designed around; override only what a test or deployment needs.
#[derive(Clone, Default)]
pub struct RaftOptions {
    pub heartbeat_interval: Option<Duration>,
    pub election_timeout_min: Option<Duration>,
    pub election_timeout_max: Option<Duration>,
    pub client_wait_timeout: Option<Duration>,
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidOptions {
    #[error("election timeout minimum must exceed the heartbeat interval")]
    ElectionTimeoutTooShort,
    #[error("election timeout minimum must be less than the maximum")]
    ElectionTimeoutRangeEmpty,
}

#[derive(Copy, Clone)]
pub(crate) struct RaftOptionsValidated {
    pub(crate) heartbeat_interval: Duration,
    pub(crate) election_timeout_min: Duration,
    pub(crate) election_timeout_max: Duration,
    pub(crate) client_wait_timeout: Duration,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), InvalidOptions> {
        if self.election_timeout_min <= self.heartbeat_interval {
            return Err(InvalidOptions::ElectionTimeoutTooShort);
        }
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(InvalidOptions::ElectionTimeoutRangeEmpty);
        }
        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = InvalidOptions;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let values = RaftOptionsValidated {
            heartbeat_interval: options.heartbeat_interval.unwrap_or(Duration::from_millis(100)),
            election_timeout_min: options.election_timeout_min.unwrap_or(Duration::from_millis(400)),
            election_timeout_max: options.election_timeout_max.unwrap_or(Duration::from_millis(600)),
            client_wait_timeout: options.client_wait_timeout.unwrap_or(Duration::from_millis(500)),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let validated = RaftOptionsValidated::try_from(RaftOptions::default()).unwrap();
        assert_eq!(validated.heartbeat_interval, Duration::from_millis(100));
        assert_eq!(validated.election_timeout_min, Duration::from_millis(400));
        assert_eq!(validated.election_timeout_max, Duration::from_millis(600));
        assert_eq!(validated.client_wait_timeout, Duration::from_millis(500));
    }

    #[test]
    fn rejects_heartbeat_slower_than_election() {
        let options = RaftOptions {
            heartbeat_interval: Some(Duration::from_millis(500)),
            ..Default::default()
        };
        assert!(RaftOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn rejects_empty_election_range() {
        let options = RaftOptions {
            election_timeout_min: Some(Duration::from_millis(600)),
            election_timeout_max: Some(Duration::from_millis(600)),
            ..Default::default()
        };
        assert!(RaftOptionsValidated::try_from(options).is_err());
    }
}
