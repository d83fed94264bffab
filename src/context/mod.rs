//! Context replication: the shared record, its durable store, the local
//! fan-out bus, and the optional remote authority sync.

pub mod bus;
pub mod record;
pub mod store;
pub mod sync;

pub use bus::{BusHandle, LocalBus};
pub use record::{ContextRecord, Provenance};
pub use store::ContextStore;
pub use sync::RemoteSync;
