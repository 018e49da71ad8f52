//! Durable storage for workflow instances and their history log.

mod instance_store;

pub use instance_store::InstanceStore;
