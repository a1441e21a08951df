use std::time::Duration;

/// Consumer settings, fixed for the consumer's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Carried for callers; every backend acknowledges on receipt
    pub auto_ack: bool,
    /// Number of workers; 0 is treated as 1
    pub concurrency: usize,
    /// Retries after the first failed attempt before the message is dropped
    pub max_retries: u32,
    /// Fixed wait between attempts
    pub retry_delay: Duration,
    /// Bound of each pop while idle; also the worst-case stop latency
    pub poll_interval: Duration,
    /// Budget for all `handle` calls on one message, retries included
    pub handler_timeout: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            auto_ack: true,
            concurrency: 1,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            handler_timeout: Duration::from_secs(30),
        }
    }
}

impl ConsumerOptions {
    pub(crate) fn normalized(mut self) -> Self {
        self.concurrency = self.concurrency.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_concurrency_becomes_one() {
        let options = ConsumerOptions {
            concurrency: 0,
            ..ConsumerOptions::default()
        }
        .normalized();
        assert_eq!(options.concurrency, 1);
    }
}
