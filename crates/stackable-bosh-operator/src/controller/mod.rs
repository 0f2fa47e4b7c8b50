//! The control loops of the operator and the runtime wiring them to watches.
//!
//! Every loop exposes `reconcile(object, context)`. The loops never call each other, they only
//! communicate through the objects they write: deployments lead to with-ops artifacts, those to
//! desired manifests, rendering jobs, BPM artifacts and finally workloads.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use futures::{StreamExt, future};
use k8s_openapi::api::{
    apps::v1::StatefulSet,
    batch::v1::Job,
    core::v1::{ConfigMap, ObjectReference, Secret},
};
use kube::{
    Resource, ResourceExt,
    core::DynamicObject,
    runtime::{
        Controller,
        controller::{self, Action},
        events::{Event, EventType, Recorder, Reporter},
        reflector::ObjectRef,
        watcher,
    },
};
use tracing::Instrument;

use crate::{
    artifact::ArtifactKind,
    cli::WatchNamespace,
    client::Client,
    crd::BoshDeployment,
    kvp::{ARTIFACT_TYPE_KEY, DEPLOYMENT_NAME_KEY, INSTANCE_GROUP_KEY},
    name_service::{ConfigMapNameService, NameService},
    reconcile::{ErrorClass, ReconcilerError, RequeuePolicy, error_chain},
    references::{self, ReferencedKind},
};

pub mod bpm;
pub mod desired_manifest;
pub mod instance_group;
pub mod restart;
pub mod status;
pub mod variables;
pub mod with_ops;

pub const OPERATOR_NAME: &str = "bosh.stackable.tech";
pub const FIELD_MANAGER: &str = "bosh-operator";

/// Settings shared by every control loop.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OperatorConfig {
    pub watch_namespace: WatchNamespace,
    pub cluster_domain: String,
    pub operator_image: String,
    pub meltdown_duration: Duration,
    pub reconcile_timeout: Duration,
    pub transient_backoff: Duration,
    pub max_workers: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: WatchNamespace::All,
            cluster_domain: "cluster.local".to_owned(),
            operator_image: crate::cli::DEFAULT_OPERATOR_IMAGE.to_owned(),
            meltdown_duration: Duration::from_secs(60),
            reconcile_timeout: Duration::from_secs(5 * 60),
            transient_backoff: Duration::from_secs(5),
            max_workers: 1,
        }
    }
}

impl From<crate::cli::RunArguments> for OperatorConfig {
    fn from(arguments: crate::cli::RunArguments) -> Self {
        Self {
            watch_namespace: arguments.watch_namespace,
            cluster_domain: arguments.cluster_domain,
            operator_image: arguments.operator_image,
            meltdown_duration: arguments.meltdown_duration,
            reconcile_timeout: arguments.reconcile_timeout,
            transient_backoff: arguments.transient_backoff,
            max_workers: arguments.max_workers,
        }
    }
}

/// Everything a reconcile needs besides the object itself.
pub struct Context {
    pub client: Client,
    pub config: OperatorConfig,
    pub policy: RequeuePolicy,
    pub name_service: Arc<dyn NameService>,
}

impl Context {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        let name_service = Arc::new(ConfigMapNameService::new(
            client.clone(),
            config.cluster_domain.clone(),
        ));
        let policy = RequeuePolicy {
            transient: config.transient_backoff,
            ..RequeuePolicy::default()
        };
        Self {
            client,
            config,
            policy,
            name_service,
        }
    }

    pub fn with_name_service(mut self, name_service: Arc<dyn NameService>) -> Self {
        self.name_service = name_service;
        self
    }
}

/// The error of a reconcile bounded by [`timed`].
#[derive(Debug)]
pub enum Timed<E> {
    Failed(E),
    TimedOut(Duration),
}

impl<E: fmt::Display> fmt::Display for Timed<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(error) => error.fmt(f),
            Self::TimedOut(timeout) => write!(
                f,
                "reconcile did not finish within {}",
                humantime::format_duration(*timeout)
            ),
        }
    }
}

impl<E: std::error::Error> std::error::Error for Timed<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Failed(error) => error.source(),
            Self::TimedOut(_) => None,
        }
    }
}

impl<E: ReconcilerError> ReconcilerError for Timed<E> {
    fn category(&self) -> &'static str {
        match self {
            Self::Failed(error) => error.category(),
            Self::TimedOut(_) => "ReconcileTimedOut",
        }
    }

    fn class(&self) -> ErrorClass {
        match self {
            Self::Failed(error) => error.class(),
            Self::TimedOut(_) => ErrorClass::Transient,
        }
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Self::Failed(error) => error.secondary_object(),
            Self::TimedOut(_) => None,
        }
    }
}

/// Aborts `reconcile` once `timeout` passed. Dropping the future cancels its pending store calls.
pub async fn timed<F, E>(timeout: Duration, reconcile: F) -> Result<Action, Timed<E>>
where
    F: Future<Output = Result<Action, E>>,
{
    match tokio::time::timeout(timeout, reconcile).await {
        Ok(result) => result.map_err(Timed::Failed),
        Err(_) => Err(Timed::TimedOut(timeout)),
    }
}

pub fn error_policy<K, E: ReconcilerError>(_object: Arc<K>, error: &E, ctx: Arc<Context>) -> Action {
    ctx.policy.action_for(error.class())
}

/// Reports the controller reconciliation result to all relevant targets
///
/// The result is logged, and errors relevant to the end user are published as Kubernetes
/// events on the reconciled object.
pub fn report_controller_reconciled<K, ReconcileErr, QueueErr>(
    client: &Client,
    controller_name: &str,
    result: &Result<(ObjectRef<K>, Action), controller::Error<ReconcileErr, QueueErr>>,
) where
    K: Resource,
    ReconcileErr: ReconcilerError,
    QueueErr: std::error::Error,
{
    match result {
        Ok((obj, _)) => {
            tracing::info!(
                controller.name = controller_name,
                object = %obj,
                "Reconciled object"
            );
        }
        Err(controller::Error::ReconcilerFailed(error, obj))
            if !RequeuePolicy::is_reported(error.class()) =>
        {
            tracing::debug!(
                controller.name = controller_name,
                object = %obj,
                error = %error_chain(error),
                "Reconcile will be retried"
            );
        }
        Err(error) => {
            tracing::error!(
                controller.name = controller_name,
                error = &*error as &dyn std::error::Error,
                "Failed to reconcile object",
            );
            publish_controller_error_as_k8s_event(client, controller_name, error);
        }
    }
}

/// Converts an [`Error`](std::error::Error) into a publishable Kubernetes [`Event`]
fn error_to_event<E: ReconcilerError>(err: &E) -> Event {
    let mut full_msg = error_chain(err);
    message::truncate_with_ellipsis(&mut full_msg, 1024);
    Event {
        type_: EventType::Warning,
        reason: err.category().to_string(),
        note: Some(full_msg),
        action: "Reconcile".to_string(),
        secondary: err.secondary_object().map(|secondary| secondary.into()),
    }
}

/// Reports an error coming from a controller to Kubernetes
///
/// Errors not linked to a specific object, and clients without an API server, are skipped.
fn publish_controller_error_as_k8s_event<ReconcileErr, QueueErr>(
    client: &Client,
    controller: &str,
    controller_error: &controller::Error<ReconcileErr, QueueErr>,
) where
    ReconcileErr: ReconcilerError,
    QueueErr: std::error::Error,
{
    let (error, obj) = match controller_error {
        controller::Error::ReconcilerFailed(err, obj) => (err, obj),
        _ => return,
    };
    let Some(kube_client) = client.as_kube_client() else {
        return;
    };
    let recorder = Recorder::new(
        kube_client,
        Reporter {
            controller: controller.to_string(),
            instance: None,
        },
    );
    let reference: ObjectReference = obj.clone().into();
    let event = error_to_event(error);
    // Run in the background
    tokio::spawn(
        async move {
            if let Err(err) = recorder.publish(&event, &reference).await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Failed to report error as K8s event"
                );
            }
        }
        .in_current_span(),
    );
}

mod message {
    /// Ensures that `msg` is at most `max_len` _bytes_ long
    ///
    /// If `msg` is longer than `max_len` then the extra text is replaced with an ellipsis.
    pub fn truncate_with_ellipsis(msg: &mut String, max_len: usize) {
        const ELLIPSIS: char = '…';
        const ELLIPSIS_LEN: usize = ELLIPSIS.len_utf8();
        if msg.len() > max_len {
            let start_of_trunc_char = find_start_of_char(msg, max_len.saturating_sub(ELLIPSIS_LEN));
            msg.truncate(start_of_trunc_char);
            if ELLIPSIS_LEN <= max_len {
                msg.push(ELLIPSIS);
            }
        }
        debug_assert!(msg.len() <= max_len);
    }

    fn find_start_of_char(s: &str, mut pos: usize) -> usize {
        while !s.is_char_boundary(pos) {
            pos -= 1;
        }
        pos
    }

}

/// Runs every control loop until a shutdown signal arrives.
pub async fn run(kube_client: kube::Client, config: OperatorConfig) {
    let client = Client::for_kubernetes(kube_client.clone(), Some(FIELD_MANAGER.to_owned()));
    let ctx = Arc::new(Context::new(client.clone(), config));
    let namespace = ctx.config.watch_namespace.clone();
    let controller_config = controller::Config::default().concurrency(ctx.config.max_workers);
    let timeout = ctx.config.reconcile_timeout;

    let artifacts_of = |kind: ArtifactKind| {
        watcher::Config::default().labels(&format!("{ARTIFACT_TYPE_KEY}={kind}"))
    };

    let with_ops_controller = Controller::new(
        namespace.get_api::<BoshDeployment>(&kube_client),
        watcher::Config::default(),
    )
    .with_config(controller_config.clone());
    let deployments = with_ops_controller.store();
    let with_ops = {
        let config_map_deployments = deployments.clone();
        let secret_deployments = deployments.clone();
        with_ops_controller
            .watches(
                namespace.get_api::<ConfigMap>(&kube_client),
                watcher::Config::default(),
                move |config_map| {
                    references::deployments_for_config_map(
                        &config_map_deployments.state(),
                        &config_map,
                    )
                },
            )
            .watches(
                namespace.get_api::<Secret>(&kube_client),
                watcher::Config::default(),
                move |secret| {
                    references::deployments_for_secret(&secret_deployments.state(), &secret)
                },
            )
            .shutdown_on_signal()
            .run(
                move |object, ctx| timed(timeout, with_ops::reconcile(object, ctx)),
                error_policy,
                ctx.clone(),
            )
            .for_each(|result| {
                report_controller_reconciled(&client, with_ops::CONTROLLER_NAME, &result);
                future::ready(())
            })
    };

    let variables = Controller::new(
        namespace.get_api::<Secret>(&kube_client),
        artifacts_of(ArtifactKind::WithOps),
    )
    .with_config(controller_config.clone())
    .shutdown_on_signal()
    .run(
        move |object, ctx| timed(timeout, variables::reconcile(object, ctx)),
        error_policy,
        ctx.clone(),
    )
    .for_each(|result| {
        report_controller_reconciled(&client, variables::CONTROLLER_NAME, &result);
        future::ready(())
    });

    let desired_manifest_controller = Controller::new(
        namespace.get_api::<Secret>(&kube_client),
        artifacts_of(ArtifactKind::WithOps),
    )
    .with_config(controller_config.clone());
    let with_ops_artifacts = desired_manifest_controller.store();
    let desired_manifest = {
        let deployments = deployments.clone();
        desired_manifest_controller
            .watches(
                namespace.get_api::<Secret>(&kube_client),
                watcher::Config::default(),
                move |secret| {
                    references::artifacts_for_variable_secret(
                        &with_ops_artifacts.state(),
                        &deployments.state(),
                        &secret,
                    )
                },
            )
            .shutdown_on_signal()
            .run(
                move |object, ctx| timed(timeout, desired_manifest::reconcile(object, ctx)),
                error_policy,
                ctx.clone(),
            )
            .for_each(|result| {
                report_controller_reconciled(&client, desired_manifest::CONTROLLER_NAME, &result);
                future::ready(())
            })
    };

    let instance_group = Controller::new(
        namespace.get_api::<Secret>(&kube_client),
        artifacts_of(ArtifactKind::Desired),
    )
    .with_config(controller_config.clone())
    .shutdown_on_signal()
    .run(
        move |object, ctx| timed(timeout, instance_group::reconcile(object, ctx)),
        error_policy,
        ctx.clone(),
    )
    .for_each(|result| {
        report_controller_reconciled(&client, instance_group::CONTROLLER_NAME, &result);
        future::ready(())
    });

    let bpm = Controller::new(
        namespace.get_api::<Secret>(&kube_client),
        watcher::Config::default().labels(INSTANCE_GROUP_KEY),
    )
    .with_config(controller_config.clone())
    .shutdown_on_signal()
    .run(
        move |object, ctx| timed(timeout, bpm::reconcile(object, ctx)),
        error_policy,
        ctx.clone(),
    )
    .for_each(|result| {
        report_controller_reconciled(&client, bpm::CONTROLLER_NAME, &result);
        future::ready(())
    });

    let status = Controller::new(
        namespace.get_api::<BoshDeployment>(&kube_client),
        watcher::Config::default(),
    )
    .with_config(controller_config.clone())
    .owns(
        namespace.get_api::<Job>(&kube_client),
        watcher::Config::default().labels(DEPLOYMENT_NAME_KEY),
    )
    .owns(
        namespace.get_api::<StatefulSet>(&kube_client),
        watcher::Config::default().labels(DEPLOYMENT_NAME_KEY),
    )
    .shutdown_on_signal()
    .run(
        move |object, ctx| timed(timeout, status::reconcile(object, ctx)),
        error_policy,
        ctx.clone(),
    )
    .for_each(|result| {
        report_controller_reconciled(&client, status::CONTROLLER_NAME, &result);
        future::ready(())
    });

    let restart_controller = Controller::new(
        namespace.get_api::<StatefulSet>(&kube_client),
        watcher::Config::default().labels(DEPLOYMENT_NAME_KEY),
    )
    .with_config(controller_config);
    let stateful_sets = restart_controller.store();
    let restart = {
        let config_map_sets = stateful_sets.clone();
        restart_controller
            .watches(
                namespace.get_api::<Secret>(&kube_client),
                watcher::Config::default(),
                move |secret| {
                    references::workload_sets_for_object(
                        &stateful_sets.state(),
                        ReferencedKind::Secret,
                        secret.namespace(),
                        &secret.name_any(),
                    )
                },
            )
            .watches(
                namespace.get_api::<ConfigMap>(&kube_client),
                watcher::Config::default(),
                move |config_map| {
                    references::workload_sets_for_object(
                        &config_map_sets.state(),
                        ReferencedKind::ConfigMap,
                        config_map.namespace(),
                        &config_map.name_any(),
                    )
                },
            )
            .shutdown_on_signal()
            .run(
                move |object, ctx| timed(timeout, restart::reconcile(object, ctx)),
                error_policy,
                ctx,
            )
            .for_each(|result| {
                report_controller_reconciled(&client, restart::CONTROLLER_NAME, &result);
                future::ready(())
            })
    };

    tracing::info!(operator = OPERATOR_NAME, "Starting control loops");
    tokio::join!(
        with_ops,
        variables,
        desired_manifest,
        instance_group,
        bpm,
        status,
        restart
    );
}
