//! Persistence for ContentMigrator.
//!
//! - [`StateStore`]: the JSON migration ledger (per-entry progress and
//!   checkpoints), with [`FileLedger`] and [`MemoryLedger`] backends
//! - [`SqlDestination`]: the libSQL destination database records are
//!   upserted into
//!
//! **Access rules:**
//! - Migration runs: read-write via [`SqlDestination::open`]
//! - Verify-only passes: read-only via [`SqlDestination::open_readonly`]

mod destination;
mod ledger;
mod migrations;

pub use destination::SqlDestination;
pub use ledger::{FileLedger, LedgerBackend, MemoryLedger, StateStore};
