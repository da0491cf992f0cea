pub mod group;
pub mod reconciler;
pub mod scheduler;
pub mod selector;

pub use group::tree::{AdmissionVerdict, DenyReason, ResourceGroupInfo};
pub use reconciler::{ConfigurationSource, Reconciler};
pub use scheduler::{Scheduler, SchedulerConfig};
