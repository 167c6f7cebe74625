//! Value-driven eviction: thresholds, confirmation and the background cycle

pub mod confirmation;
pub mod retention;
pub mod scheduler;

pub use confirmation::{ConfirmationGate, ConfirmationOutcome, ConfirmationRequest};
pub use retention::{
    CapacityStatus, LoadAverageProbe, ProfileProvider, RetentionFactors,
    RetentionPolicyController, SharedProfile, StaticLoad, StaticProfile, SystemLoadProbe,
};
pub use scheduler::{
    CandidateResult, CycleReport, DeferredReason, EvictionOutcome, EvictionScheduler,
    KeptReason, SchedulerHandle, SchedulerPhase, TierCycleReport,
};
