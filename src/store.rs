/**
 * Identity store
 * Enrolled identities and their sealed templates, kept in enrollment order.
 * Scans work on a cloned snapshot taken under the read lock, so an enroll
 * running at the same time never touches a scan in progress.
 */

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::codec::EncryptedTemplate;
use crate::error::{FaceError, FaceResult};

const MAX_IDENTITY_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    Active,
    Revoked,
}

/// What to do when an already-active identity is enrolled again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReenrollPolicy {
    #[default]
    Reject,
    Overwrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollDisposition {
    Created,
    Replaced,
    Reactivated,
}

#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub id: String,
    pub display_name: String,
    pub attributes: BTreeMap<String, String>,
    pub template: EncryptedTemplate,
    pub status: IdentityStatus,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    records: Vec<IdentityRecord>,
    index: HashMap<String, usize>,
}

#[derive(Default)]
pub struct IdentityStore {
    inner: RwLock<Inner>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enroll(&self, record: IdentityRecord, policy: ReenrollPolicy) -> FaceResult<EnrollDisposition> {
        validate_identity(&record.id)?;

        let mut inner = self.inner.write();
        match inner.index.get(&record.id).copied() {
            Some(slot) => {
                let existing = &mut inner.records[slot];
                let disposition = match (existing.status, policy) {
                    (IdentityStatus::Active, ReenrollPolicy::Reject) => {
                        return Err(FaceError::AlreadyEnrolled(record.id));
                    }
                    (IdentityStatus::Active, ReenrollPolicy::Overwrite) => EnrollDisposition::Replaced,
                    (IdentityStatus::Revoked, _) => EnrollDisposition::Reactivated,
                };
                *existing = record;
                existing.status = IdentityStatus::Active;
                Ok(disposition)
            }
            None => {
                let slot = inner.records.len();
                inner.index.insert(record.id.clone(), slot);
                let mut record = record;
                record.status = IdentityStatus::Active;
                inner.records.push(record);
                Ok(EnrollDisposition::Created)
            }
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.get(id)
            .is_some_and(|record| record.status == IdentityStatus::Active)
    }

    pub fn get(&self, id: &str) -> Option<IdentityRecord> {
        let inner = self.inner.read();
        inner.index.get(id).map(|&slot| inner.records[slot].clone())
    }

    pub fn revoke(&self, id: &str) -> FaceResult<()> {
        let mut inner = self.inner.write();
        let slot = *inner
            .index
            .get(id)
            .ok_or_else(|| FaceError::IdentityNotFound(id.to_string()))?;
        inner.records[slot].status = IdentityStatus::Revoked;
        Ok(())
    }

    /// Active identities in enrollment order, as one consistent copy.
    pub fn active_snapshot(&self) -> Vec<IdentityRecord> {
        self.inner
            .read()
            .records
            .iter()
            .filter(|r| r.status == IdentityStatus::Active)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn validate_identity(id: &str) -> FaceResult<()> {
    if id.is_empty() || id.len() > MAX_IDENTITY_LEN {
        return Err(FaceError::Input(format!(
            "identity must be 1-{MAX_IDENTITY_LEN} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(FaceError::Input(format!(
            "identity '{id}' may only contain letters, digits, '-', '_' or '.'"
        )));
    }
    Ok(())
}
