//! Leader election using Kubernetes Leases.
//!
//! Both controllers may run with multiple replicas. Correctness does not
//! require a single active instance (optimistic concurrency plus the
//! `being-created` annotation carry that), but leader election keeps replicas
//! from stepping on each other's retries. Split-brain is prevented by timing:
//! `lease_duration` (30s) > `renew_interval` (10s) means the old leader
//! notices loss and stops well before the new leader can acquire the expired
//! lease.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Error;

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Leader elector over a coordination.k8s.io/v1 Lease.
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create an elector with default timing (30s lease, 10s renew, 5s retry).
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Block until leadership is acquired, then return a guard holding the
    /// renewal task. Dropping the guard stops renewing.
    pub async fn acquire(self: Arc<Self>) -> Result<LeaderGuard, Error> {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Waiting for leadership..."
        );

        loop {
            match self.try_acquire_lease().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return Ok(self.spawn_renewal());
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "Lease held by another, waiting...");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Failed to acquire lease, retrying...");
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Whether this instance currently believes it is the leader.
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    async fn try_acquire_lease(&self) -> Result<bool, Error> {
        let leases: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        match leases.get_opt(&self.lease_name).await? {
            None => {
                let lease = self.lease_body(1);
                match leases.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            Some(existing) => {
                if self.lease_is_ours_or_expired(&existing) {
                    self.renew(&leases, existing).await.map(|_| true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn lease_is_ours_or_expired(&self, lease: &Lease) -> bool {
        let Some(spec) = &lease.spec else { return true };
        if spec.holder_identity.as_deref() == Some(self.identity.as_str()) {
            return true;
        }
        let Some(renewed) = &spec.renew_time else { return true };
        let duration = spec
            .lease_duration_seconds
            .map(|s| chrono::Duration::seconds(s.into()))
            .unwrap_or_else(|| chrono::Duration::seconds(LEASE_DURATION.as_secs() as i64));
        Utc::now() - renewed.0 > duration
    }

    async fn renew(&self, leases: &Api<Lease>, existing: Lease) -> Result<(), Error> {
        let transitions = existing
            .spec
            .as_ref()
            .and_then(|s| s.lease_transitions)
            .unwrap_or(0);
        let took_over = existing
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref())
            != Some(self.identity.as_str());

        let mut lease = self.lease_body(if took_over { transitions + 1 } else { transitions });
        lease.metadata.resource_version = existing.metadata.resource_version.clone();
        leases
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await?;
        Ok(())
    }

    fn lease_body(&self, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(MicroTime(Utc::now())),
                renew_time: Some(MicroTime(Utc::now())),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    fn spawn_renewal(self: &Arc<Self>) -> LeaderGuard {
        let elector = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let leases: Api<Lease> =
                Api::namespaced(elector.client.clone(), &elector.namespace);
            loop {
                tokio::time::sleep(RENEW_INTERVAL).await;
                let renewed = match leases.get_opt(&elector.lease_name).await {
                    Ok(Some(existing)) if elector.lease_is_ours_or_expired(&existing) => {
                        elector.renew(&leases, existing).await.is_ok()
                    }
                    Ok(_) => false,
                    Err(e) => {
                        warn!(error = %e, "Lease renewal read failed");
                        continue;
                    }
                };
                if !renewed {
                    warn!(identity = %elector.identity, "Leadership lost");
                    elector.is_leader.store(false, Ordering::SeqCst);
                    return;
                }
            }
        });
        LeaderGuard {
            is_leader: Arc::clone(&self.is_leader),
            renewal: handle,
        }
    }
}

/// Holds leadership while alive; dropping stops renewal.
pub struct LeaderGuard {
    is_leader: Arc<AtomicBool>,
    renewal: JoinHandle<()>,
}

impl LeaderGuard {
    /// Whether leadership is still held.
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal.abort();
        self.is_leader.store(false, Ordering::SeqCst);
    }
}
