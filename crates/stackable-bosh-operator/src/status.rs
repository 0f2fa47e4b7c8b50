//! Derives the lifecycle state of a deployment from its jobs and workload sets.

use k8s_openapi::{
    api::{apps::v1::StatefulSet, batch::v1::Job},
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::{DateTime, Utc},
};

use crate::crd::{BoshDeploymentStatus, DeploymentState};

/// Ready and total counts of the children of a deployment.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Counts {
    pub total_jobs: i32,
    pub completed_jobs: i32,
    pub total_instance_groups: i32,
    pub deployed_instance_groups: i32,
}

fn saturating_count(count: usize) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

impl Counts {
    /// Counts completed jobs and deployed workload sets.
    ///
    /// A job is completed once one of its pods succeeded, a workload set is deployed once all of
    /// its replicas are ready.
    pub fn from_children(jobs: &[Job], stateful_sets: &[StatefulSet]) -> Self {
        let completed_jobs = jobs
            .iter()
            .filter(|job| {
                job.status
                    .as_ref()
                    .and_then(|status| status.succeeded)
                    .unwrap_or_default()
                    >= 1
            })
            .count();
        let deployed_instance_groups = stateful_sets
            .iter()
            .filter(|set| {
                let desired = set
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.replicas)
                    .unwrap_or(1);
                let ready = set
                    .status
                    .as_ref()
                    .and_then(|status| status.ready_replicas)
                    .unwrap_or_default();
                ready == desired
            })
            .count();

        Self {
            total_jobs: saturating_count(jobs.len()),
            completed_jobs: saturating_count(completed_jobs),
            total_instance_groups: saturating_count(stateful_sets.len()),
            deployed_instance_groups: saturating_count(deployed_instance_groups),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_jobs == 0 && self.total_instance_groups == 0
    }

    /// The state these counts stand for.
    pub fn state(&self) -> DeploymentState {
        state(
            self.total_jobs,
            self.completed_jobs,
            self.total_instance_groups,
            self.deployed_instance_groups,
        )
    }
}

/// All jobs completed and all groups deployed is [`DeploymentState::Deployed`], neither is
/// [`DeploymentState::Resolving`], exactly one of both is [`DeploymentState::Converting`].
pub fn state(
    total_jobs: i32,
    completed_jobs: i32,
    total_instance_groups: i32,
    deployed_instance_groups: i32,
) -> DeploymentState {
    let jobs_done = completed_jobs == total_jobs;
    let groups_done = deployed_instance_groups == total_instance_groups;
    match (jobs_done, groups_done) {
        (true, true) => DeploymentState::Deployed,
        (false, false) => DeploymentState::Resolving,
        _ => DeploymentState::Converting,
    }
}

/// The status to write, or [`None`] if `current` is already up to date.
///
/// Without any children the status is left alone. The state timestamp moves only when the state
/// changes.
pub fn next_status(
    current: Option<&BoshDeploymentStatus>,
    counts: Counts,
    now: DateTime<Utc>,
) -> Option<BoshDeploymentStatus> {
    if counts.is_empty() {
        return None;
    }

    let current = current.cloned().unwrap_or_default();
    let state = counts.state();
    let state_timestamp = if current.state == Some(state) {
        current.state_timestamp.clone()
    } else {
        Some(Time(now))
    };
    let next = BoshDeploymentStatus {
        state: Some(state),
        total_job_count: counts.total_jobs,
        completed_job_count: counts.completed_jobs,
        total_instance_groups: counts.total_instance_groups,
        deployed_instance_groups: counts.deployed_instance_groups,
        state_timestamp,
    };
    (next != current).then_some(next)
}
