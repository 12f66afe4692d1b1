//! Remote record store.
//!
//! The store is an external collaborator: the pipeline reads snapshots
//! and issues raw writes through `RecordStore`. None of these calls are
//! idempotent on their own; the claim engine is what makes repeated
//! passes safe.

pub mod memory;
pub mod types;
pub mod wikibase;

use async_trait::async_trait;

pub use memory::InMemoryStore;
pub use types::{Claim, ClaimValue, Entity, Reference, Snak};
pub use wikibase::WikibaseStore;

use crate::error::StoreError;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fresh snapshot of one record.
    async fn get_entity(&self, id: &str) -> Result<Entity, StoreError>;

    /// Create a claim holding only its main value and return its GUID.
    /// One API call, so a rate-limited attempt has written nothing.
    async fn create_claim(
        &self,
        entity_id: &str,
        property: &str,
        value: &ClaimValue,
        summary: &str,
    ) -> Result<String, StoreError>;

    /// Make `qualifier` the only qualifier of its property on the claim.
    /// Repeating the call after a partial failure converges on the same
    /// end state.
    async fn set_qualifier(&self, guid: &str, qualifier: &Snak, summary: &str) -> Result<(), StoreError>;

    /// Change the value of an existing claim in place, keeping its GUID.
    async fn update_claim(
        &self,
        claim: &Claim,
        value: &ClaimValue,
        summary: &str,
    ) -> Result<(), StoreError>;

    async fn remove_claims(&self, guids: &[String], summary: &str) -> Result<(), StoreError>;

    async fn set_label(
        &self,
        entity_id: &str,
        language: &str,
        value: &str,
        summary: &str,
    ) -> Result<(), StoreError>;

    async fn set_description(
        &self,
        entity_id: &str,
        language: &str,
        value: &str,
        summary: &str,
    ) -> Result<(), StoreError>;

    async fn add_alias(
        &self,
        entity_id: &str,
        language: &str,
        value: &str,
        summary: &str,
    ) -> Result<(), StoreError>;

    async fn add_reference(
        &self,
        guid: &str,
        reference: &Reference,
        summary: &str,
    ) -> Result<(), StoreError>;

    /// Remove every claim of `property` whose value matches `value`.
    /// Returns the number of claims removed.
    async fn remove_claims_with_value(
        &self,
        entity_id: &str,
        property: &str,
        value: &ClaimValue,
        summary: &str,
    ) -> Result<usize, StoreError> {
        let entity = self.get_entity(entity_id).await?;
        let guids: Vec<String> = entity
            .claims_for(property)
            .iter()
            .filter(|c| c.value.matches(value))
            .map(|c| c.guid.clone())
            .collect();
        if guids.is_empty() {
            return Ok(0);
        }
        self.remove_claims(&guids, summary).await?;
        Ok(guids.len())
    }
}
