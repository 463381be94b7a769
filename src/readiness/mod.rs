//! Model readiness
//!
//! The coordinator drives one acquisition workflow per process and publishes
//! its state; everything else reads readiness from here.

pub mod coordinator;
pub mod state;

pub use coordinator::{CoordinatorConfig, ReadinessCoordinator};
pub use state::{
    FailureClass, Outcome, ReadinessFailure, ReadinessSnapshot, ReadinessState, ReadyModel,
};
