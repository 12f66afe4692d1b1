//! In-memory record store.
//!
//! Used by tests and for local runs against fixture data. Records every
//! call so callers can assert exactly which writes were issued, and can
//! inject read delays, read failures and write rate limits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::types::{Claim, ClaimValue, Entity, Reference, Snak};
use super::RecordStore;
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Read(String),
    Create { property: String, value: ClaimValue },
    Update { guid: String, from: ClaimValue, to: ClaimValue },
    Remove(Vec<String>),
    SetQualifier { guid: String, property: String },
    SetLabel { language: String, value: String },
    SetDescription { language: String, value: String },
    AddAlias { language: String, value: String },
    AddReference(String),
}

impl StoreOp {
    pub fn is_write(&self) -> bool {
        !matches!(self, StoreOp::Read(_))
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    entities: Mutex<HashMap<String, Entity>>,
    ops: Mutex<Vec<StoreOp>>,
    next_guid: AtomicU64,
    read_delay: Mutex<Option<Duration>>,
    fail_reads: AtomicBool,
    rate_limited_writes: AtomicU32,
    rate_limited_reads: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entity: Entity) {
        self.entities.lock().insert(entity.id.clone(), entity);
    }

    /// Seed a record with claims of one property, in the given order.
    pub fn with_claims(self, entity_id: &str, property: &str, values: Vec<ClaimValue>) -> Self {
        let mut entity = self
            .entities
            .lock()
            .remove(entity_id)
            .unwrap_or_else(|| Entity::new(entity_id));
        let claims = entity.claims.entry(property.to_string()).or_default();
        for value in values {
            claims.push(Claim {
                guid: self.new_guid(entity_id),
                property: property.to_string(),
                value,
                qualifiers: Vec::new(),
                references: Vec::new(),
            });
        }
        self.insert(entity);
        self
    }

    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock() = Some(delay);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// The next `count` writes fail with `StoreError::TooManyRequests`.
    pub fn rate_limit_next_writes(&self, count: u32) {
        self.rate_limited_writes.store(count, Ordering::SeqCst);
    }

    /// The next `count` reads fail with `StoreError::TooManyRequests`.
    pub fn rate_limit_next_reads(&self, count: u32) {
        self.rate_limited_reads.store(count, Ordering::SeqCst);
    }

    pub fn entity(&self, id: &str) -> Option<Entity> {
        self.entities.lock().get(id).cloned()
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.ops.lock().clone()
    }

    pub fn writes(&self) -> Vec<StoreOp> {
        self.ops.lock().iter().filter(|op| op.is_write()).cloned().collect()
    }

    fn new_guid(&self, entity_id: &str) -> String {
        let n = self.next_guid.fetch_add(1, Ordering::SeqCst);
        format!("{}${:08}", entity_id, n)
    }

    fn check_write(&self) -> Result<(), StoreError> {
        Self::take_rate_limit(&self.rate_limited_writes)
    }

    fn take_rate_limit(budget: &AtomicU32) -> Result<(), StoreError> {
        let limited = budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if limited {
            return Err(StoreError::TooManyRequests("ratelimited".to_string()));
        }
        Ok(())
    }

    fn record(&self, op: StoreOp) {
        self.ops.lock().push(op);
    }

    fn with_entity<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Entity) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut entities = self.entities.lock();
        let entity = entities
            .get_mut(id)
            .ok_or_else(|| StoreError::EntityNotFound(id.to_string()))?;
        f(entity)
    }

    fn with_claim<T>(&self, guid: &str, f: impl FnOnce(&mut Claim) -> T) -> Result<T, StoreError> {
        self.with_entity(Self::entity_of_guid(guid), |entity| {
            let claim = entity
                .claims
                .values_mut()
                .flatten()
                .find(|c| c.guid == guid)
                .ok_or_else(|| StoreError::Api {
                    code: "invalid-guid".to_string(),
                    info: guid.to_string(),
                })?;
            Ok(f(claim))
        })
    }

    fn entity_of_guid(guid: &str) -> &str {
        guid.split('$').next().unwrap_or(guid)
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn get_entity(&self, id: &str) -> Result<Entity, StoreError> {
        self.record(StoreOp::Read(id.to_string()));
        let delay = *self.read_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Self::take_rate_limit(&self.rate_limited_reads)?;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Api {
                code: "internal_api_error".to_string(),
                info: "read failed".to_string(),
            });
        }
        self.entity(id)
            .ok_or_else(|| StoreError::EntityNotFound(id.to_string()))
    }

    async fn create_claim(
        &self,
        entity_id: &str,
        property: &str,
        value: &ClaimValue,
        _summary: &str,
    ) -> Result<String, StoreError> {
        self.check_write()?;
        let guid = self.new_guid(entity_id);
        self.with_entity(entity_id, |entity| {
            entity.claims.entry(property.to_string()).or_default().push(Claim {
                guid: guid.clone(),
                property: property.to_string(),
                value: value.clone(),
                qualifiers: Vec::new(),
                references: Vec::new(),
            });
            Ok(())
        })?;
        self.record(StoreOp::Create {
            property: property.to_string(),
            value: value.clone(),
        });
        Ok(guid)
    }

    async fn update_claim(
        &self,
        claim: &Claim,
        value: &ClaimValue,
        _summary: &str,
    ) -> Result<(), StoreError> {
        self.check_write()?;
        let from = self.with_claim(&claim.guid, |existing| std::mem::replace(&mut existing.value, value.clone()))?;
        self.record(StoreOp::Update {
            guid: claim.guid.clone(),
            from,
            to: value.clone(),
        });
        Ok(())
    }

    async fn set_qualifier(&self, guid: &str, qualifier: &Snak, _summary: &str) -> Result<(), StoreError> {
        self.check_write()?;
        self.with_claim(guid, |claim| {
            claim.qualifiers.retain(|q| q.property != qualifier.property);
            claim.qualifiers.push(qualifier.clone());
        })?;
        self.record(StoreOp::SetQualifier {
            guid: guid.to_string(),
            property: qualifier.property.clone(),
        });
        Ok(())
    }

    async fn remove_claims(&self, guids: &[String], _summary: &str) -> Result<(), StoreError> {
        self.check_write()?;
        {
            let mut entities = self.entities.lock();
            for entity in entities.values_mut() {
                for claims in entity.claims.values_mut() {
                    claims.retain(|c| !guids.contains(&c.guid));
                }
                entity.claims.retain(|_, claims| !claims.is_empty());
            }
        }
        self.record(StoreOp::Remove(guids.to_vec()));
        Ok(())
    }

    async fn set_label(
        &self,
        entity_id: &str,
        language: &str,
        value: &str,
        _summary: &str,
    ) -> Result<(), StoreError> {
        self.check_write()?;
        self.with_entity(entity_id, |entity| {
            entity.labels.insert(language.to_string(), value.to_string());
            Ok(())
        })?;
        self.record(StoreOp::SetLabel {
            language: language.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn set_description(
        &self,
        entity_id: &str,
        language: &str,
        value: &str,
        _summary: &str,
    ) -> Result<(), StoreError> {
        self.check_write()?;
        self.with_entity(entity_id, |entity| {
            entity.descriptions.insert(language.to_string(), value.to_string());
            Ok(())
        })?;
        self.record(StoreOp::SetDescription {
            language: language.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn add_alias(
        &self,
        entity_id: &str,
        language: &str,
        value: &str,
        _summary: &str,
    ) -> Result<(), StoreError> {
        self.check_write()?;
        self.with_entity(entity_id, |entity| {
            entity
                .aliases
                .entry(language.to_string())
                .or_default()
                .push(value.to_string());
            Ok(())
        })?;
        self.record(StoreOp::AddAlias {
            language: language.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn add_reference(
        &self,
        guid: &str,
        reference: &Reference,
        _summary: &str,
    ) -> Result<(), StoreError> {
        self.check_write()?;
        self.with_claim(guid, |claim| claim.references.push(reference.clone()))?;
        self.record(StoreOp::AddReference(guid.to_string()));
        Ok(())
    }
}
