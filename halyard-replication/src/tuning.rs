// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! Constants for tuning the performance of the replicator.
//!
//! These have synergistic effects with each other and with network
//! conditions; don't change them lightly.

use std::time::Duration;

/// Number of revisions per `changes` / `proposeChanges` message, and the
/// `batch` parameter of the puller's opening `subChanges`.
pub const CHANGES_BATCH_SIZE: usize = 200;

/// How many change lists may be awaiting a reply at once.
pub const MAX_CHANGE_LISTS_IN_FLIGHT: usize = 5;

/// Max desirable number of revs waiting to be sent. Past this the pusher
/// stops querying for more changes.
pub const MAX_REVS_QUEUED: usize = 600;

/// Max number of `rev` messages transmitting at once.
pub const MAX_REVS_IN_FLIGHT: usize = 10;

/// Max bytes of revisions sent but not yet replied to.
pub const MAX_REV_BYTES_AWAITING_REPLY: u64 = 2 * 1024 * 1024;

/// Minimum encoded body size considered for delta compression.
pub const MIN_BODY_SIZE_FOR_DELTA: usize = 200;

/// A delta larger than this ratio of the full body is not worth sending.
pub const MAX_DELTA_RATIO: f64 = 1.2;

/// Default number of ancestors sent in a `rev` message's `history`, unless
/// the peer's `maxHistory` lowers it.
pub const DEFAULT_MAX_HISTORY: usize = 20;

/// Upper bound on the ancestor list embedded per entry in a `changes` reply.
pub const MAX_POSSIBLE_ANCESTORS: usize = 10;

/// `changes` messages are sent urgent, so the pusher is not starved of revs
/// to send while bulk bodies queue.
pub const CHANGE_MESSAGES_ARE_URGENT: bool = true;

/// Number of accepted revisions to accumulate before inserting in one
/// transaction.
pub const INSERTION_BATCH_SIZE: usize = 100;

/// How long revisions may wait for the batch to fill before insertion is
/// triggered anyway.
pub const INSERTION_DELAY: Duration = Duration::from_millis(20);

/// Bodies above this size (or with possible blobs, encrypted properties, or
/// a pull filter) are processed off the puller's message loop.
pub const MAX_INLINE_REV_SIZE: usize = 32 * 1024;

/// Max number of incoming revisions being read/inserted at once.
pub const MAX_ACTIVE_INCOMING_REVS: usize = 100;

/// Max incoming revisions outstanding (active plus insertion-queued); past
/// this, `rev` messages are parked and `changes` replies deferred.
pub const MAX_INCOMING_REVS: usize = 200;

/// Minimum interval between delegate status notifications.
pub const MIN_DELEGATE_CALL_INTERVAL: Duration = Duration::from_millis(200);

/// Default debounce for checkpoint autosave.
pub const DEFAULT_CHECKPOINT_SAVE_DELAY: Duration = Duration::from_secs(5);

/// Transient-error retry backoff bounds.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);

/// Give up retrying a revision after this many transient failures.
pub const MAX_REV_RETRIES: u32 = 10;
