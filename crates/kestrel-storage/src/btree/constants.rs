//! B+Tree constants.

use std::time::Duration;

/// Fixed memory estimate of a page object, added to its keys and values.
pub const PAGE_MEMORY: usize = 128;

/// Memory estimate of one child slot of a node page (reference + position).
pub const CHILD_MEMORY: usize = 40;

/// Memory estimate of one column position held by a column mode leaf.
pub const COLUMN_POS_MEMORY: usize = 8;

/// First wait of an operation that found a page locked.
pub(crate) const LOCKED_WAIT_MIN: Duration = Duration::from_millis(1);

/// The locked wait doubles up to this bound. Wake-ups normally arrive
/// sooner through the page's waiter list; the bound only caps a lost one.
pub(crate) const LOCKED_WAIT_MAX: Duration = Duration::from_millis(32);

/// How long an idle pooled handler sleeps before rechecking for shutdown.
pub(crate) const HANDLER_IDLE_WAIT: Duration = Duration::from_millis(100);

/// Leaf flag stored next to each child position of a node page.
pub(crate) const CHILD_FLAG_LEAF: u8 = 1;
pub(crate) const CHILD_FLAG_NODE: u8 = 0;
