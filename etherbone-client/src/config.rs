use std::time::Duration;

/// Retry and timeout policy of a [crate::session::Session].
///
/// The first attempt waits `base_timeout`, every retransmission doubles the
/// previous wait, up to `max_timeout`. After `max_retries` retransmissions
/// without a reply the transaction fails.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SessionConfig {
    pub base_timeout: Duration,
    pub max_timeout: Duration,
    pub max_retries: u32,
    /// Caps the frame size below what the transport allows.
    pub max_frame_len: Option<usize>,
}

impl SessionConfig {
    /// Defaults for direct Ethernet links
    pub fn udp() -> SessionConfig {
        SessionConfig {
            base_timeout: Duration::from_millis(50),
            max_timeout: Duration::from_secs(1),
            max_retries: 3,
            max_frame_len: None,
        }
    }

    /// Defaults for PCIe windows, where a device answers within microseconds
    pub fn pcie() -> SessionConfig {
        SessionConfig {
            base_timeout: Duration::from_micros(100),
            max_timeout: Duration::from_millis(10),
            max_retries: 3,
            max_frame_len: None,
        }
    }

    /// Defaults for UART links behind a relay
    pub fn proxy() -> SessionConfig {
        SessionConfig {
            base_timeout: Duration::from_millis(200),
            max_timeout: Duration::from_secs(5),
            max_retries: 3,
            max_frame_len: None,
        }
    }

    /// Time to wait for a reply after the given number of retransmissions.
    pub fn timeout_for_retry(&self, retries: u32) -> Duration {
        let factor = 1u32.checked_shl(retries).unwrap_or(u32::MAX);
        self.base_timeout
            .saturating_mul(factor)
            .min(self.max_timeout)
    }

    /// Total time a transaction waits before it is declared unreachable.
    pub fn total_wait(&self) -> Duration {
        (0..=self.max_retries)
            .map(|retries| self.timeout_for_retry(retries))
            .sum()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::udp()
    }
}

/// Builder for a [SessionConfig]
///
/// # Example
///
/// ```
/// use etherbone_client::config::Builder;
/// use std::time::Duration;
///
/// let config = Builder::pcie()
///     .base_timeout(Duration::from_micros(50))
///     .max_retries(5)
///     .build();
/// assert_eq!(config.max_retries, 5);
/// ```
#[derive(Default)]
pub struct Builder {
    config: SessionConfig,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    pub fn udp() -> Builder {
        Builder {
            config: SessionConfig::udp(),
        }
    }

    pub fn pcie() -> Builder {
        Builder {
            config: SessionConfig::pcie(),
        }
    }

    pub fn proxy() -> Builder {
        Builder {
            config: SessionConfig::proxy(),
        }
    }

    /// Set the time to wait for a reply to the first attempt.
    /// Raises the upper bound if it would cut this wait short.
    pub fn base_timeout(mut self, timeout: Duration) -> Self {
        self.config.base_timeout = timeout;
        self.config.max_timeout = self.config.max_timeout.max(timeout);
        self
    }

    /// Set the upper bound of the doubling timeout
    pub fn max_timeout(mut self, timeout: Duration) -> Self {
        self.config.max_timeout = timeout;
        self
    }

    /// Set the number of retransmissions before giving up
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Limit the frame size below the transport's own limit
    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.config.max_frame_len = Some(len);
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::Builder;

    #[test]
    fn timeout_doubles_up_to_bound() {
        let config = Builder::new()
            .base_timeout(Duration::from_millis(10))
            .max_timeout(Duration::from_millis(50))
            .build();
        assert_eq!(config.timeout_for_retry(0), Duration::from_millis(10));
        assert_eq!(config.timeout_for_retry(1), Duration::from_millis(20));
        assert_eq!(config.timeout_for_retry(2), Duration::from_millis(40));
        assert_eq!(config.timeout_for_retry(3), Duration::from_millis(50));
        assert_eq!(config.timeout_for_retry(40), Duration::from_millis(50));
    }

    #[test]
    fn long_base_timeout_is_not_capped_by_preset() {
        let config = Builder::pcie()
            .base_timeout(Duration::from_millis(500))
            .build();
        assert_eq!(config.timeout_for_retry(0), Duration::from_millis(500));
        assert_eq!(config.timeout_for_retry(3), Duration::from_millis(500));

        // an explicit bound set afterwards still applies
        let config = Builder::pcie()
            .base_timeout(Duration::from_millis(500))
            .max_timeout(Duration::from_secs(2))
            .build();
        assert_eq!(config.timeout_for_retry(1), Duration::from_secs(1));
        assert_eq!(config.timeout_for_retry(2), Duration::from_secs(2));
    }

    #[test]
    fn total_wait_sums_the_schedule() {
        let config = Builder::new()
            .base_timeout(Duration::from_millis(10))
            .max_timeout(Duration::from_secs(1))
            .max_retries(3)
            .build();
        assert_eq!(config.total_wait(), Duration::from_millis(150));
    }
}
