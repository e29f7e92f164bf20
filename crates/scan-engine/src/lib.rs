//! Scan orchestration for laboratory instruments.
//!
//! A scan moves devices through a sequence of positions, counts with a set of
//! detectors at each one, samples environment devices and streams the points
//! to data sinks. This crate drives that sequence; device drivers only
//! implement the capability traits of `scan-core`.
//!
//! # Architecture
//!
//! - [`plan`]: validated, immutable scan descriptions and their builders
//! - [`positions`]: where the points come from (lists, repeats, an external
//!   decision service)
//! - [`controller`]: the state machine that runs a plan
//! - [`motion`]: coordinated moves and the failure policy
//! - [`acquisition`]: one counting cycle over the detectors
//! - [`environment`]: per-point environment sampling
//! - [`sink`]: dataset consumers
//! - [`control`]: cooperative stop and pause
//!
//! Sweeps, continuous and manual scans reuse the controller's steps through
//! [`hooks`], [`continuous`] and [`manual`].
//!
//! # Example
//!
//! ```rust,ignore
//! use scan_engine::{builders, EngineConfig, MemorySink, ScanContext, ScanController};
//!
//! let sink = Arc::new(MemorySink::new("mem"));
//! let ctx = ScanContext::new(EngineConfig::default())
//!     .with_detectors(vec![det])
//!     .with_sink(sink.clone());
//! let plan = builders::range_scan(vec![motor], &[0.0], &[0.1], 11)?.build(&ctx)?;
//! ScanController::new(plan).run().await?;
//! ```

pub mod acquisition;
pub mod config;
pub mod continuous;
pub mod control;
pub mod controller;
pub mod environment;
pub mod hooks;
pub mod logging;
pub mod manual;
pub mod motion;
pub mod plan;
pub mod positions;
pub mod sink;
pub mod sweep;

pub use acquisition::{Acquisition, AcquisitionFailure, CompletionCheck, CountLoop};
pub use config::EngineConfig;
pub use continuous::{ContinuousScan, ContinuousScanBuilder};
pub use control::{Checkpoint, ScanControl};
pub use controller::{ScanController, ScanPhase};
pub use environment::{EnvChannel, EnvironmentSampling, SampleWindow};
pub use hooks::{HookContext, NoHooks, PointFlow, ScanHooks};
pub use manual::{ManualScan, ManualScanBuilder, ManualScanSlot};
pub use motion::{
    DefaultFailurePolicy, ErrorHandler, FailureAction, FailurePolicy, MoveCoordinator,
    StrictFailurePolicy,
};
pub use plan::{
    builders, EnvironmentSelection, Multistep, ScanContext, ScanKind, ScanPlan, ScanPlanBuilder,
    SpeedOverride,
};
pub use positions::{
    AdaptiveSource, ChannelDecisionService, Decision, DecisionRequest, DecisionService,
    ListSource, MoveCost, MoveCostEstimator, PositionSource, RepeatSource, SourceLen, SourceStep,
    SpeedCostEstimator,
};
pub use sink::{DataSink, MemorySink, SinkEvent};
pub use sweep::SweepHooks;

pub use scan_core;
