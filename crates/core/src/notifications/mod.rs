//! Push notification dispatch: models, collaborator contracts, duplicate
//! suppression and the fan-out engine.

mod dedup;
mod dispatch;
mod memory;
mod model;
mod permit_notifier;
mod stores;

pub use dedup::*;
pub use dispatch::*;
pub use memory::*;
pub use model::*;
pub use permit_notifier::*;
pub use stores::*;
