//! Refreshable access credential.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};

/// Credential holder whose token can be rotated in place.
pub trait RefreshableToken: Send + Sync {
    fn refresh(&self, token: &str) -> Result<()>;
    fn token(&self) -> Result<String>;
}

#[derive(Debug, Clone)]
struct Stamped {
    token: String,
    refreshed_at: DateTime<Utc>,
}

/// Lock-free token cell. Readers always see a whole token.
#[derive(Debug, Default)]
pub struct SharedToken {
    current: ArcSwapOption<Stamped>,
}

impl SharedToken {
    pub fn new() -> Self { Self::default() }

    pub fn with_token(token: impl Into<String>) -> Self {
        let me = Self::new();
        me.current.store(Some(Arc::new(Stamped { token: token.into(), refreshed_at: Utc::now() })));
        me
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.current.load_full().map(|s| s.refreshed_at)
    }
}

impl RefreshableToken for SharedToken {
    fn refresh(&self, token: &str) -> Result<()> {
        if token.trim().is_empty() {
            return Err(anyhow!("empty access token"));
        }
        self.current.store(Some(Arc::new(Stamped { token: token.to_string(), refreshed_at: Utc::now() })));
        Ok(())
    }

    fn token(&self) -> Result<String> {
        self.current
            .load_full()
            .map(|s| s.token.clone())
            .ok_or_else(|| anyhow!("no access token available"))
    }
}
