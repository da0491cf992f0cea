//! Row types of the external configuration store. The kernel never
//! writes these outside of administrative DAO calls; it only reads
//! full snapshots.

pub mod resource_group;
pub mod selector;
