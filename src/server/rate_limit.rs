use std::fmt::{Debug, Formatter};
use std::num::NonZeroU32;

use anyhow::anyhow;
use governor::{DefaultDirectRateLimiter, Quota};

use crate::server::config::RateLimit;
use crate::wire::command::CommandCode;

/// A byte budget shared by all connections of a server. The budget refills continuously at the
///  configured rate, and a full second's worth of bytes can pass in a burst.
pub struct ByteRateLimiter {
    limit: RateLimit,
    limiter: DefaultDirectRateLimiter,
}

impl Debug for ByteRateLimiter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ByteRateLimiter{{{} bytes/s, commands:{:?}}}", self.limit.bytes_per_second, self.limit.commands)
    }
}

impl ByteRateLimiter {
    pub fn new(limit: RateLimit) -> anyhow::Result<ByteRateLimiter> {
        let rate = NonZeroU32::new(limit.bytes_per_second)
            .ok_or_else(|| anyhow!("rate limit must be positive"))?;

        Ok(ByteRateLimiter {
            limiter: DefaultDirectRateLimiter::direct(Quota::per_second(rate)),
            limit,
        })
    }

    pub fn applies_to(&self, command: CommandCode) -> bool {
        self.limit.applies_to(command)
    }

    /// waits until `n` more bytes may pass
    pub async fn acquire(&self, n: usize) -> anyhow::Result<()> {
        let Some(n) = u32::try_from(n).ok().and_then(NonZeroU32::new) else {
            return Ok(());
        };

        self.limiter.until_n_ready(n)
            .await
            .map_err(|e| anyhow!("{} bytes do not fit into rate limit {:?}: {}", n, self.limit, e))
    }
}
