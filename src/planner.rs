//! External path-planner seam.
//!
//! Collision-free path generation is delegated to an external solver
//! running in its own process. The supervisor hands it the current and
//! requested grid state and consumes a trajectory dictionary back. The
//! planner may fail outright or return a plan with deadlocked robots;
//! the supervisor decides whether deadlocks are acceptable.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::trajectory::TrajectoryData;

#[derive(Debug, Error)]
#[error("path planning failed: {0}")]
pub struct PlannerError(pub String);

/// One robot's entry in the grid handed to the planner.
#[derive(Debug, Clone, Copy)]
pub struct GridEntry {
    pub alpha: f64,
    pub beta: f64,
    pub dest_alpha: f64,
    pub dest_beta: f64,
    pub disabled: bool,
}

/// What the planner returns.
#[derive(Debug, Clone, Default)]
pub struct PlannedPaths {
    /// Trajectories from the current layout to the destinations.
    pub to_destination: TrajectoryData,
    /// The plan is unusable unless the caller forces it.
    pub did_fail: bool,
    /// Robots the solver could not route.
    pub deadlocks: Vec<u16>,
}

#[async_trait]
pub trait PathPlanner: Send + Sync {
    async fn plan_paths(
        &self,
        grid: HashMap<u16, GridEntry>,
    ) -> Result<PlannedPaths, PlannerError>;
}
