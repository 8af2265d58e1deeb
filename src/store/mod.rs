//! Durable local state owned by the synchronizer.

mod overrides;
mod queue;

pub use overrides::LocalMutationStore;
pub use queue::{OpKind, OperationDraft, PendingOperation, PendingQueue};
