use std::num::NonZeroUsize;
use std::time::Duration;

use anyhow::Context;

use crate::hub::signalr::{default_reconnect_delays, SignalRConfig};

#[derive(Clone, Debug)]
pub struct Config {
    pub api_url: String,
    pub hub_url: String,
    pub cache_capacity: Option<NonZeroUsize>,
    pub hub_event_buffer: usize,
    pub hub_reconnect_delays: Vec<Duration>,
    pub hub_handshake_timeout: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let api_url = var("API_URL").unwrap_or_else(|| "https://localhost:5001/api/".into());
        let hub_url = var("HUB_URL").unwrap_or_else(|| "https://localhost:5001/hubs/".into());
        // 0 means unbounded.
        let cache_capacity = var("CACHE_CAPACITY")
            .unwrap_or_else(|| "256".into())
            .parse::<usize>()
            .context("CACHE_CAPACITY must be a number")
            .map(NonZeroUsize::new)?;
        let hub_event_buffer = var("HUB_EVENT_BUFFER")
            .unwrap_or_else(|| "64".into())
            .parse()
            .context("HUB_EVENT_BUFFER must be a number")?;
        let hub_reconnect_delays = match var("HUB_RECONNECT_DELAYS_MS") {
            Some(raw) => parse_delays(&raw)
                .context("HUB_RECONNECT_DELAYS_MS must be a comma separated list of numbers")?,
            None => default_reconnect_delays(),
        };
        let hub_handshake_timeout = var("HUB_HANDSHAKE_TIMEOUT_MS")
            .unwrap_or_else(|| "15000".into())
            .parse()
            .map(Duration::from_millis)
            .context("HUB_HANDSHAKE_TIMEOUT_MS must be a number")?;

        Ok(Self {
            api_url,
            hub_url,
            cache_capacity,
            hub_event_buffer,
            hub_reconnect_delays,
            hub_handshake_timeout,
        })
    }

    pub fn signalr(&self) -> SignalRConfig {
        SignalRConfig {
            reconnect_delays: self.hub_reconnect_delays.clone(),
            handshake_timeout: self.hub_handshake_timeout,
            event_buffer: self.hub_event_buffer,
            ..SignalRConfig::new(self.hub_url.clone())
        }
    }
}

fn parse_delays(raw: &str) -> Result<Vec<Duration>, std::num::ParseIntError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map(Duration::from_millis))
        .collect()
}
