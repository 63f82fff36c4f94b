//! Leader election using Kubernetes Leases.
//!
//! Only the controller replica holding the `coordination.k8s.io/v1` Lease runs
//! the watches and the connectivity monitor. Updates carry the lease's
//! resourceVersion, so a concurrent change fails with 409 Conflict instead of
//! producing two leaders. Every Lease call is bounded by the renew interval,
//! and a holder keeps retrying failed renewals until its lease would have
//! expired.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::k8s::with_deadline;

const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// What to do with the lease as last read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseAction {
    Create,
    Renew,
    /// Expired; take it over with the given transition count.
    TakeOver(i32),
    /// Held by someone else.
    Wait,
}

pub fn lease_action(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let Some(lease) = lease else {
        return LeaseAction::Create;
    };
    let spec = lease.spec.as_ref();
    if spec.and_then(|s| s.holder_identity.as_deref()) == Some(identity) {
        return LeaseAction::Renew;
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
        _ => true,
    };
    if expired {
        LeaseAction::TakeOver(spec.and_then(|s| s.lease_transitions).unwrap_or(0) + 1)
    } else {
        LeaseAction::Wait
    }
}

/// What a holder does after one renewal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed,
    /// The call failed but the lease has not expired yet.
    Retry,
    Lost,
}

/// `since_renewed` is measured from the start of the last successful renewal.
pub fn renew_outcome(
    result: &Result<bool>,
    since_renewed: Duration,
    lease_duration: Duration,
) -> RenewOutcome {
    match result {
        Ok(true) => RenewOutcome::Renewed,
        Ok(false) => RenewOutcome::Lost,
        Err(_) if since_renewed < lease_duration => RenewOutcome::Retry,
        Err(_) => RenewOutcome::Lost,
    }
}

pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
    /// Deadline for each Lease API call.
    api_timeout: Duration,
}

impl LeaderElector {
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
            api_timeout: RENEW_INTERVAL,
        }
    }

    /// Block until the lease is ours. Returns `false` if cancelled first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        info!(identity = %self.identity, lease = %self.lease_name, "Waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    return true;
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "Lease held by another replica");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Failed to acquire lease, retrying");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    /// Renew until cancelled. Losing the lease cancels `cancel`; returns whether it was lost.
    pub async fn hold(self, cancel: CancellationToken) -> bool {
        let mut last_renewed = Instant::now();
        let mut wait = self.renew_interval;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = self.release().await {
                        debug!(identity = %self.identity, error = %e, "Could not release lease");
                    }
                    return false;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            let attempt = Instant::now();
            let result = self.try_acquire_or_renew().await;
            match renew_outcome(&result, last_renewed.elapsed(), self.lease_duration) {
                RenewOutcome::Renewed => {
                    last_renewed = attempt;
                    wait = self.renew_interval;
                }
                RenewOutcome::Retry => {
                    if let Err(e) = &result {
                        warn!(identity = %self.identity, error = %e, "Failed to renew lease, retrying");
                    }
                    wait = self.retry_interval;
                }
                RenewOutcome::Lost => {
                    if let Err(e) = &result {
                        warn!(identity = %self.identity, error = %e, "Lease expired while renewal kept failing");
                    }
                    warn!(identity = %self.identity, "Leadership lost");
                    cancel.cancel();
                    return true;
                }
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();
        let existing =
            with_deadline("get lease", self.api_timeout, api.get_opt(&self.lease_name)).await?;

        let mut lease = match lease_action(existing.as_ref(), &self.identity, now) {
            LeaseAction::Wait => return Ok(false),
            LeaseAction::Create => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.lease_name.clone()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(self.spec(now, 0)),
                };
                let created = with_deadline(
                    "create lease",
                    self.api_timeout,
                    api.create(&PostParams::default(), &lease),
                )
                .await;
                return match created {
                    Ok(_) => Ok(true),
                    Err(e) if e.is_conflict() => Ok(false),
                    Err(e) => Err(e),
                };
            }
            LeaseAction::Renew => {
                let mut lease = existing.unwrap_or_default();
                if let Some(spec) = lease.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                lease
            }
            LeaseAction::TakeOver(transitions) => {
                let mut lease = existing.unwrap_or_default();
                lease.spec = Some(self.spec(now, transitions));
                info!(identity = %self.identity, transitions = transitions, "Taking over expired lease");
                lease
            }
        };

        // The resourceVersion from the read makes the replace a compare-and-swap.
        lease.metadata.managed_fields = None;
        let replaced = with_deadline(
            "replace lease",
            self.api_timeout,
            api.replace(&self.lease_name, &PostParams::default(), &lease),
        )
        .await;
        match replaced {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    /// Expire our lease so a successor does not have to wait it out.
    async fn release(&self) -> Result<()> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let existing =
            with_deadline("get lease", self.api_timeout, api.get_opt(&self.lease_name)).await?;
        let Some(mut lease) = existing else {
            return Ok(());
        };
        if lease_action(Some(&lease), &self.identity, Utc::now()) != LeaseAction::Renew {
            return Ok(());
        }
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.renew_time = Some(MicroTime(Utc::now() - chrono::Duration::seconds(60)));
        }
        lease.metadata.managed_fields = None;
        with_deadline(
            "replace lease",
            self.api_timeout,
            api.replace(&self.lease_name, &PostParams::default(), &lease),
        )
        .await?;
        info!(identity = %self.identity, "Lease released");
        Ok(())
    }
}
