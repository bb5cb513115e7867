// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! Task and timer plumbing shared by the replication actors.

mod backoff;
pub use backoff::Backoff;

mod debounce;
pub use debounce::Debounce;

mod spawn;
pub use spawn::{JoinError, Spawner, Stats, Task};

mod time;
pub use time::{sleep, timeout, Elapsed};
