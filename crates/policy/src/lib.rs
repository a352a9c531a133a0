//! Pure policy evaluation over [`DomainRecord`] trees.
//!
//! Nothing here performs I/O: callers load the record, hand it in, and
//! persist whatever comes back.

mod mutate;
mod resolve;

pub use mutate::{DeleteOutcome, apply_delete, apply_set};
pub use resolve::{evaluates_query_params, resolve};

pub use urlinfo_contracts::{BlockedError, DomainRecord, Verdict};
