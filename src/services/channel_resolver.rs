//! Channel lookup

use async_trait::async_trait;
use std::collections::HashMap;

use crate::config::ChannelConfig;
use crate::errors::RelayError;
use crate::models::relay::UpstreamCandidate;

/// Resolves a channel id to its upstream sources
#[async_trait]
pub trait ChannelResolver: Send + Sync {
    /// Candidates ordered by priority (lowest value first). Unknown channels
    /// are `ChannelNotFound`; a channel configured without sources is a
    /// `Configuration` error.
    async fn resolve_channel(&self, channel_id: &str) -> Result<Vec<UpstreamCandidate>, RelayError>;
}

/// In-memory resolver built from the `[[channels]]` configuration
#[derive(Debug, Clone, Default)]
pub struct StaticChannelResolver {
    channels: HashMap<String, Vec<UpstreamCandidate>>,
}

impl StaticChannelResolver {
    pub fn new(channels: &[ChannelConfig]) -> Self {
        let channels = channels
            .iter()
            .map(|channel| {
                let mut candidates: Vec<UpstreamCandidate> = channel
                    .sources
                    .iter()
                    .map(|source| UpstreamCandidate {
                        url: source.url.clone(),
                        priority: source.priority,
                    })
                    .collect();
                // stable: equal priorities keep configuration order
                candidates.sort_by_key(|c| c.priority);
                (channel.id.clone(), candidates)
            })
            .collect();
        Self { channels }
    }

    /// Add or replace a channel
    pub fn insert(&mut self, channel_id: impl Into<String>, mut candidates: Vec<UpstreamCandidate>) {
        candidates.sort_by_key(|c| c.priority);
        self.channels.insert(channel_id.into(), candidates);
    }
}

#[async_trait]
impl ChannelResolver for StaticChannelResolver {
    async fn resolve_channel(&self, channel_id: &str) -> Result<Vec<UpstreamCandidate>, RelayError> {
        match self.channels.get(channel_id) {
            Some(candidates) if candidates.is_empty() => Err(RelayError::Configuration {
                message: format!("channel '{channel_id}' has no upstream sources"),
            }),
            Some(candidates) => Ok(candidates.clone()),
            None => Err(RelayError::ChannelNotFound {
                channel_id: channel_id.to_string(),
            }),
        }
    }
}
