use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use urlinfo_contracts::codec::{self, CodecError, DocumentError};
use urlinfo_contracts::{
    BlockedError, DeleteRequest, DomainRecord, EntryShapeError, SetPathRequest, Verdict,
};
use urlinfo_policy::{DeleteOutcome, apply_delete, apply_set, resolve};
use urlinfo_store::{RecordStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error(transparent)]
    Blocked(#[from] BlockedError),
    #[error("domain {0} not found")]
    NotFound(String),
    #[error("domain {0} already exists")]
    Conflict(String),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("domain {0} kept changing; gave up after retries")]
    Contended(String),
}

impl From<DocumentError> for PolicyError {
    fn from(value: DocumentError) -> Self {
        PolicyError::Malformed(value.to_string())
    }
}

impl From<EntryShapeError> for PolicyError {
    fn from(value: EntryShapeError) -> Self {
        PolicyError::Malformed(value.to_string())
    }
}

/// Front door to stored domain policy.
///
/// Reads and writes go through the codec; every store call is bounded by
/// `store_timeout`. Mutations are read-modify-write cycles guarded by the
/// version stamp of the bytes they read.
#[derive(Clone)]
pub struct PolicyService {
    store: Arc<dyn RecordStore>,
    store_timeout: Duration,
    retry_max_attempts: u32,
}

struct Snapshot {
    version: Option<String>,
    record: Option<DomainRecord>,
}

impl PolicyService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        store_timeout: Duration,
        retry_max_attempts: u32,
    ) -> Self {
        Self {
            store,
            store_timeout,
            retry_max_attempts: retry_max_attempts.max(1),
        }
    }

    pub async fn ping(&self) -> Result<(), PolicyError> {
        self.bounded(self.store.ping()).await
    }

    pub async fn get(&self, domain: &str) -> Result<Option<DomainRecord>, PolicyError> {
        Ok(self.read(domain).await?.record)
    }

    pub async fn resolve(
        &self,
        domain: &str,
        path: Option<&str>,
        query: &[(String, String)],
    ) -> Result<Verdict, PolicyError> {
        let record = self.get(domain).await?;
        Ok(resolve(record.as_ref(), path, query)?)
    }

    pub async fn set(&self, domain: &str, request: SetPathRequest) -> Result<bool, PolicyError> {
        let result = self.try_set(domain, request).await;
        crate::metrics::observe_mutation("set", mutation_outcome(&result));
        result
    }

    async fn try_set(&self, domain: &str, request: SetPathRequest) -> Result<bool, PolicyError> {
        request.validate()?;
        for attempt in 1..=self.retry_max_attempts {
            let snapshot = self.read(domain).await?;
            let next = apply_set(snapshot.record, request.clone(), unix_now());
            let bytes = codec::encode(&next)?;

            if self
                .bounded(
                    self.store
                        .compare_and_set(domain, snapshot.version.as_deref(), &bytes),
                )
                .await?
            {
                return Ok(true);
            }
            tracing::debug!(domain, attempt, "domain record changed during set; retrying");
        }

        Err(self.contended(domain))
    }

    pub async fn delete(&self, domain: &str, request: DeleteRequest) -> Result<bool, PolicyError> {
        let result = self.try_delete(domain, &request).await;
        crate::metrics::observe_mutation("delete", mutation_outcome(&result));
        result
    }

    async fn try_delete(&self, domain: &str, request: &DeleteRequest) -> Result<bool, PolicyError> {
        request.validate()?;
        for attempt in 1..=self.retry_max_attempts {
            let snapshot = self.read(domain).await?;
            let outcome = apply_delete(snapshot.record, request, unix_now());
            let written = match (outcome, snapshot.version) {
                (DeleteOutcome::Unchanged, _) | (_, None) => return Ok(false),
                (DeleteOutcome::Updated(next), Some(version)) => {
                    let bytes = codec::encode(&next)?;
                    self.bounded(self.store.compare_and_set(domain, Some(&version), &bytes))
                        .await?
                }
                (DeleteOutcome::RemoveDomain, Some(version)) => {
                    self.bounded(self.store.compare_and_delete(domain, &version))
                        .await?
                }
            };

            if written {
                return Ok(true);
            }
            tracing::debug!(domain, attempt, "domain record changed during delete; retrying");
        }

        Err(self.contended(domain))
    }

    pub async fn list_domains(&self) -> Result<Vec<String>, PolicyError> {
        self.bounded(self.store.keys()).await
    }

    /// Stores a complete `{"<domain>": <record>}` document for a new domain.
    pub async fn create_domain(&self, document: serde_json::Value) -> Result<String, PolicyError> {
        let (domain, record) = codec::decode_domain_document(document)?;
        let bytes = codec::encode(&record)?;

        let created = self
            .bounded(self.store.compare_and_set(&domain, None, &bytes))
            .await?;
        crate::metrics::observe_mutation("create", if created { "ok" } else { "conflict" });
        if !created {
            return Err(PolicyError::Conflict(domain));
        }
        Ok(domain)
    }

    pub async fn fetch_domain(&self, domain: &str) -> Result<DomainRecord, PolicyError> {
        self.get(domain)
            .await?
            .ok_or_else(|| PolicyError::NotFound(domain.to_string()))
    }

    pub async fn delete_domain(&self, domain: &str) -> Result<(), PolicyError> {
        let removed = self.bounded(self.store.delete(domain)).await?;
        crate::metrics::observe_mutation("remove", if removed { "ok" } else { "not_found" });
        if !removed {
            return Err(PolicyError::NotFound(domain.to_string()));
        }
        Ok(())
    }

    async fn read(&self, domain: &str) -> Result<Snapshot, PolicyError> {
        let Some(bytes) = self.bounded(self.store.get(domain)).await? else {
            return Ok(Snapshot {
                version: None,
                record: None,
            });
        };

        let record = codec::decode(&bytes).inspect_err(|err| {
            tracing::error!(domain, error = %err, "stored domain record failed to decode");
        })?;
        Ok(Snapshot {
            version: Some(codec::version_stamp(&bytes)),
            record: Some(record),
        })
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, PolicyError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let result = match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        };

        result.map_err(|err| {
            let kind = match &err {
                StoreError::Timeout => "timeout",
                StoreError::Sqlx(_) => "backend",
            };
            crate::metrics::inc_store_error(kind);
            tracing::warn!(error = %err, "record store call failed");
            PolicyError::Store(err)
        })
    }

    fn contended(&self, domain: &str) -> PolicyError {
        tracing::warn!(
            domain,
            attempts = self.retry_max_attempts,
            "domain record mutation contended"
        );
        PolicyError::Contended(domain.to_string())
    }
}

fn mutation_outcome(result: &Result<bool, PolicyError>) -> &'static str {
    match result {
        Ok(true) => "ok",
        Ok(false) => "noop",
        Err(PolicyError::Contended(_)) => "contended",
        Err(_) => "error",
    }
}

fn unix_now() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}
