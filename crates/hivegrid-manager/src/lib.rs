//! hivegrid-manager: the loops a group manager runs.
//!
//! - [`anomaly`]: periodic overload/underload detection per local controller
//! - [`resolver`]: relocation plans for detected anomalies
//! - [`consolidation`]: periodic reconfiguration onto fewer hosts
//! - [`liveness`]: refreshing the liveness of owned local controllers
//! - [`summary`]: capacity summaries reported to the group leader
//! - [`submission`]: dispatching and placing submitted VMs

pub mod anomaly;
pub mod consolidation;
pub mod error;
pub mod liveness;
pub mod resolver;
pub mod submission;
pub mod summary;

pub use anomaly::{
    AnomalyDetector, AnomalyDetectorRunner, AnomalyEvent, DETECTORS, NoopAnomalyDetector,
    ThresholdAnomalyDetector, detector_for,
};
pub use consolidation::ReconfigurationLoop;
pub use error::{ManagerError, ManagerResult};
pub use liveness::HostLivenessMonitor;
pub use resolver::AnomalyResolver;
pub use submission::SubmissionService;
pub use summary::SummaryProducer;
