//! Testing utilities for courier.
//!
//! In-memory implementations of the outbox and inbox ports with the full
//! port semantics (claim eligibility, ordering, fencing, reaping,
//! redrive, pagination), plus a scripted publisher. They let relay
//! behavior be exercised without a database, and double as reference
//! implementations of the port contracts.

mod inbox;
mod publisher;
mod repository;

pub use inbox::InMemoryInboxStore;
pub use publisher::ScriptedPublisher;
pub use repository::InMemoryOutboxRepository;
