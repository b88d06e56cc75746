pub mod entities;
pub mod repositories;
pub mod state_codec;
pub mod state_machine;

pub use entities::{
    DiagEvent, DiagStatus, DispatchItem, DispatchPolicySnapshot, JobMetadata, PtRecord, PtState,
    PtSummary, ScanNode, ScanTarget, Stage, StageCounters, StageOutcome, SubdomainProgress,
    STATE_FORMAT_VERSION,
};
pub use repositories::{
    ProductTypeStore, ScanNodeClient, StageExecutor, StickyAssignmentStore, TargetListStore,
};
pub use state_machine::PtEvent;
