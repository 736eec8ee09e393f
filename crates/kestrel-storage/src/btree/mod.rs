//! Copy-on-write B+Tree maps over chunk storage.
//!
//! Every page of a tree sits behind a [`PageReference`], the only mutable
//! cell in the structure. Writers never modify a page: they copy it, apply
//! their change and install the copy with a version bump, under the
//! reference's own lock. Readers load whatever page a reference holds and
//! never lock anything.
//!
//! ```text
//!                    BTreeStore.root
//!                          │
//!                   ┌──────▼──────┐
//!                   │ PageRef v7  │──> Node [k20 | k40]
//!                   └─────────────┘      │     │     │
//!            ┌───────────────────────────┘     │     └──────────────┐
//!     ┌──────▼──────┐                   ┌──────▼──────┐      ┌──────▼──────┐
//!     │ PageRef v3  │──> Leaf           │ PageRef v9  │      │ PageRef v1  │
//!     │ pos 0x2c40  │   (cached)        │ pos 0 dirty │      │ pos 0x1a01  │
//!     └─────────────┘                   └─────────────┘      └─────────────┘
//! ```
//!
//! A reference with a saved position and no unsaved change is clean; its
//! page can be dropped and read back from its chunk. A dirty reference
//! keeps its page until a save writes it and everything above it.
//!
//! ## Execution
//!
//! Writes are [`PageOperation`]s returning `Succeeded`, `Retry` or
//! `Locked`. [`run_to_completion`] drives one on the calling thread; a
//! [`PageOperationHandlerFactory`] runs them on a pool of handler threads,
//! each with its own queue.

// Submodules
pub mod constants;
pub mod cursor;
pub(crate) mod format;
pub mod handler;
pub mod map;
pub mod operations;
pub mod page;
pub mod reference;
pub mod store;

// Re-exports for public API
pub use cursor::BTreeCursor;
pub use handler::{
    run_to_completion, with_local_handler, CompletionListener, HandlerId, OpStatus, PageOperation,
    PageOperationHandler, PageOperationHandlerFactory,
};
pub use map::{BTreeMap, MapStats};
pub use operations::{Callback, MapOperation, MapTask, WriteOp, WriteResult};
pub use store::BackgroundExceptionHandler;

pub(crate) use map::MapContext;
