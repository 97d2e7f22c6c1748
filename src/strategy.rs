//! Strategy selection: streaming vs. batch, decided once per session.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::StrategyConfig;

/// How a session's audio is transcribed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Chunks transcribed as they arrive, assembled in order at the end.
    Streaming,
    /// The whole recording queued as one durable job.
    Batch,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming => write!(f, "streaming"),
            Self::Batch => write!(f, "batch"),
        }
    }
}

/// Facts about a session known at start time.
#[derive(Debug, Clone, Default)]
pub struct SessionParams {
    /// Expected recording length, if the caller knows it. Unknown duration
    /// selects batch.
    pub expected_duration: Option<Duration>,
    /// Whether capture delivers audio incrementally.
    pub chunked_capture: bool,
    /// Manual override; bypasses selection entirely.
    pub override_strategy: Option<Strategy>,
}

/// Pick the strategy for a session. Pure: same inputs, same answer.
///
/// Streaming requires both a known duration above the threshold and
/// chunked capture; everything else is batch.
pub fn select_strategy(params: &SessionParams, config: &StrategyConfig) -> Strategy {
    if let Some(forced) = params.override_strategy {
        return forced;
    }
    match params.expected_duration {
        Some(duration)
            if params.chunked_capture
                && duration.as_secs_f32() > config.streaming_threshold_s =>
        {
            Strategy::Streaming
        }
        _ => Strategy::Batch,
    }
}

/// A session with its strategy fixed. The strategy never changes after
/// construction, even if the session runs longer or shorter than expected.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub id: Uuid,
    pub strategy: Strategy,
    pub params: SessionParams,
    pub started_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(params: SessionParams, config: &StrategyConfig) -> Self {
        let strategy = select_strategy(&params, config);
        Self {
            id: Uuid::new_v4(),
            strategy,
            params,
            started_at: Utc::now(),
        }
    }
}
