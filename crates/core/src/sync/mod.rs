//! Remote/local reconciliation: domain models, store contracts, the full-scan
//! engine, its scheduler and the single-record change router.

mod change_router;
mod domain;
mod memory;
mod reconcile;
mod scheduler;
mod signature;
mod stores;

pub use change_router::*;
pub use domain::*;
pub use memory::*;
pub use reconcile::*;
pub use scheduler::*;
pub use signature::*;
pub use stores::*;
