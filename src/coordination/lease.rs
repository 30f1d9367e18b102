//! Kubernetes Lease Lock Manager
//!
//! One `coordination.k8s.io/v1` Lease per lock name. The holder identity
//! stored on the lease is unique per acquisition, so two tasks of the same
//! replica also exclude each other. Expired leases are taken over with an
//! optimistic `replace` guarded by the resource version.
//!
//! A held lease is renewed in the background at a third of its duration
//! until it is released, so a long critical section keeps it.

use crate::domain::ports::{DistributedLock, LockHandle};
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{DeleteParams, ObjectMeta, PostParams};
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Kubernetes object names are at most 253 characters
const MAX_NAME_LEN: usize = 253;

/// Outcome of one acquisition attempt
enum Attempt {
    Acquired,
    Contended,
}

/// Lease-backed distributed lock
#[derive(Clone)]
pub struct LeaseLockManager {
    api: Api<Lease>,
    /// Identity of this replica
    holder_identity: String,
    /// Validity of a lease without renewal
    lease_duration: Duration,
    /// Renewal loops by holder token
    renewals: Arc<DashMap<String, CancellationToken>>,
}

impl LeaseLockManager {
    pub fn new(
        client: Client,
        namespace: &str,
        holder_identity: impl Into<String>,
        lease_duration: Duration,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            holder_identity: holder_identity.into(),
            lease_duration,
            renewals: Arc::new(DashMap::new()),
        }
    }

    /// Keep renewing `lease_name` until the token's renewal is cancelled
    /// or the lease is lost
    fn start_renewal(&self, lease_name: String, token: String) {
        let cancel = CancellationToken::new();
        self.renewals.insert(token.clone(), cancel.clone());
        let api = self.api.clone();
        let renewals = self.renewals.clone();
        let period = renew_interval(self.lease_duration);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => match renew(&api, &lease_name, &token).await {
                        Ok(true) => debug!(lease = %lease_name, "Renewed lease"),
                        Ok(false) => {
                            warn!(lease = %lease_name, "Lease lost before release");
                            break;
                        }
                        Err(e) => warn!(lease = %lease_name, "Failed to renew lease: {}", e),
                    },
                }
            }
            renewals.remove(&token);
        });
    }

    fn stop_renewal(&self, token: &str) {
        if let Some((_, cancel)) = self.renewals.remove(token) {
            cancel.cancel();
        }
    }

    async fn try_acquire(&self, lease_name: &str, token: &str) -> Result<Attempt> {
        let now = Utc::now();

        match self.api.get_opt(lease_name).await? {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(lease_name.to_string()),
                        ..Default::default()
                    },
                    spec: Some(self.spec(token, now)),
                };
                match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(Attempt::Acquired),
                    Err(e) if is_conflict(&e) => Ok(Attempt::Contended),
                    Err(e) => Err(e.into()),
                }
            }
            Some(mut lease) => {
                if !is_lease_free(lease.spec.as_ref(), now) {
                    return Ok(Attempt::Contended);
                }
                lease.spec = Some(self.spec(token, now));
                match self
                    .api
                    .replace(lease_name, &PostParams::default(), &lease)
                    .await
                {
                    Ok(_) => {
                        debug!(lease = %lease_name, "Took over expired lease");
                        Ok(Attempt::Acquired)
                    }
                    Err(e) if is_conflict(&e) => Ok(Attempt::Contended),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn spec(&self, token: &str, now: DateTime<Utc>) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(token.to_string()),
            lease_duration_seconds: Some(self.lease_duration.as_secs().max(1) as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            ..Default::default()
        }
    }
}

#[async_trait]
impl DistributedLock for LeaseLockManager {
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockHandle> {
        let lease_name = sanitize_lease_name(name);
        let token = format!("{}/{}", self.holder_identity, Uuid::new_v4());
        let timed_out = || Error::LockTimeout {
            name: name.to_string(),
            timeout,
        };

        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            max_elapsed_time: Some(timeout),
            ..Default::default()
        };

        let (lease_ref, token_ref, timed_out) = (lease_name.as_str(), token.as_str(), &timed_out);
        let attempt = backoff::future::retry(policy, || async move {
            match self.try_acquire(lease_ref, token_ref).await {
                Ok(Attempt::Acquired) => Ok(()),
                Ok(Attempt::Contended) => Err(backoff::Error::transient(timed_out())),
                Err(e) if e.is_transient() => Err(backoff::Error::transient(e)),
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        });

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(())) => {
                debug!(lock = %name, lease = %lease_name, "Acquired lease lock");
                self.start_renewal(lease_name.clone(), token.clone());
                Ok(LockHandle {
                    name: lease_name,
                    token,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(timed_out()),
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<()> {
        self.stop_renewal(&handle.token);

        let holder = self
            .api
            .get_opt(&handle.name)
            .await?
            .and_then(|lease| lease.spec)
            .and_then(|spec| spec.holder_identity);

        if holder.as_deref() != Some(handle.token.as_str()) {
            warn!(lease = %handle.name, "Lease no longer held by this holder");
            return Err(Error::LockNotHeld { name: handle.name });
        }

        match self.api.delete(&handle.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Renew a third of the way into the lease, so two renewals can fail
/// before it expires
fn renew_interval(lease_duration: Duration) -> Duration {
    (lease_duration / 3).max(Duration::from_millis(100))
}

/// The spec after renewal by `token`, or `None` when another holder owns it
fn renewed_spec(spec: Option<&LeaseSpec>, token: &str, now: DateTime<Utc>) -> Option<LeaseSpec> {
    let spec = spec?;
    if spec.holder_identity.as_deref() != Some(token) {
        return None;
    }
    Some(LeaseSpec {
        renew_time: Some(MicroTime(now)),
        ..spec.clone()
    })
}

/// One renewal round trip; `false` once the lease is gone or taken over
async fn renew(api: &Api<Lease>, lease_name: &str, token: &str) -> Result<bool> {
    let Some(mut lease) = api.get_opt(lease_name).await? else {
        return Ok(false);
    };
    let Some(spec) = renewed_spec(lease.spec.as_ref(), token, Utc::now()) else {
        return Ok(false);
    };
    lease.spec = Some(spec);
    api.replace(lease_name, &PostParams::default(), &lease).await?;
    Ok(true)
}

/// A lease without holder, or whose last renewal is older than its
/// duration, may be taken
fn is_lease_free(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let Some(spec) = spec else {
        return true;
    };
    if spec.holder_identity.as_deref().map_or(true, str::is_empty) {
        return true;
    }
    let renewed = spec
        .renew_time
        .as_ref()
        .or(spec.acquire_time.as_ref())
        .map(|t| t.0);
    match (renewed, spec.lease_duration_seconds) {
        (Some(renewed), Some(secs)) => renewed + chrono::Duration::seconds(secs as i64) < now,
        _ => true,
    }
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 409)
}

/// Map a lock name onto a DNS-1123 subdomain
pub fn sanitize_lease_name(name: &str) -> String {
    let mapped: String = name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = mapped.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    let mut out: String = trimmed.chars().take(MAX_NAME_LEN).collect();
    while out.ends_with(|c: char| !c.is_ascii_alphanumeric()) {
        out.pop();
    }
    if out.is_empty() {
        "lock".to_string()
    } else {
        out
    }
}
