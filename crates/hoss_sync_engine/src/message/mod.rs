//! Messages flowing from the notification queues to the workers.
//!
//! There are exactly two kinds: storage provider notifications about objects
//! ([`BucketEvent`]) and core service lifecycle notifications ([`ApiEvent`]).
//! Both share one capability set, exposed through [`Message`]:
//!
//! - [`Message::require_reload`]: one-shot request for fresh routing state.
//! - [`Message::matches`]: whether a core service node should handle it.
//! - [`Message::execute`]: perform the work on the matched node.

mod api;
mod bucket;

pub use api::{ApiEvent, ApiEventType};
pub use bucket::{
    BucketEntity, BucketEvent, BucketNotification, EventSource, ObjectEntity, S3Entity,
    BACKFILL_USER_AGENT,
};

use crate::error::SyncResult;
use crate::graph::CoreServiceConfig;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Result of matching a message against a core service node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchOutcome {
    /// The node is responsible for the message.
    pub matched: bool,
    /// The message is accepted but needs no work.
    pub ignore: bool,
}

impl MatchOutcome {
    /// Not responsible.
    pub const NONE: MatchOutcome = MatchOutcome {
        matched: false,
        ignore: false,
    };

    /// Responsible, with work to do.
    pub const MATCHED: MatchOutcome = MatchOutcome {
        matched: true,
        ignore: false,
    };

    /// Responsible, nothing to do.
    pub const IGNORED: MatchOutcome = MatchOutcome {
        matched: true,
        ignore: true,
    };

    pub(crate) fn matched_if(matched: bool) -> Self {
        if matched {
            Self::MATCHED
        } else {
            Self::NONE
        }
    }
}

/// Shared settings available to every execution.
#[derive(Debug, Clone)]
pub struct ExecuteContext {
    /// Delay before a backfill starts listing the source dataset.
    pub backfill_delay: Duration,
    /// Engine shutdown signal, observed by background tasks.
    pub cancel: CancellationToken,
}

impl ExecuteContext {
    /// Creates a context.
    pub fn new(backfill_delay: Duration, cancel: CancellationToken) -> Self {
        Self {
            backfill_delay,
            cancel,
        }
    }
}

/// A decoded notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Storage provider object notification.
    Bucket(BucketEvent),
    /// Core service lifecycle notification.
    Api(ApiEvent),
}

impl Message {
    /// Returns true at most once per message when it depends on routing
    /// state that the event itself just changed.
    pub fn require_reload(&mut self) -> bool {
        match self {
            Message::Bucket(_) => false,
            Message::Api(event) => event.require_reload(),
        }
    }

    /// Checks whether `node` is responsible for this message.
    pub fn matches(&self, node: &CoreServiceConfig) -> MatchOutcome {
        match self {
            Message::Bucket(event) => event.matches(node),
            Message::Api(event) => event.matches(node),
        }
    }

    /// Performs the work for this message on `node`.
    ///
    /// Per-target failures are logged and do not fail the message. An error
    /// means the message was abandoned before any target was touched.
    pub async fn execute(self, node: &Arc<CoreServiceConfig>, ctx: &ExecuteContext) -> SyncResult<()> {
        match self {
            Message::Bucket(event) => event.execute(node).await,
            Message::Api(event) => event.execute(node, ctx).await,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Bucket(event) => event.fmt(f),
            Message::Api(event) => event.fmt(f),
        }
    }
}

impl From<BucketEvent> for Message {
    fn from(event: BucketEvent) -> Self {
        Message::Bucket(event)
    }
}

impl From<ApiEvent> for Message {
    fn from(event: ApiEvent) -> Self {
        Message::Api(event)
    }
}
