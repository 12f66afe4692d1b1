//! Claim reconciliation engine.
//!
//! `ensure` converges one (record, property) pair onto exactly one claim
//! holding the desired value. The work runs as a job on the serial lane,
//! so no two reconciliations interleave their read-then-write sequences.
//! Every reconciliation starts from a fresh snapshot; a snapshot handed
//! down from earlier in the pipeline is never trusted.
//!
//! Decisions, given the claims currently on the property:
//! - none: create the desired claim
//! - at least one equal to the desired value: keep the first, remove
//!   every other claim on the property
//! - exactly one, different: update it in place (keeps its GUID)
//! - several, none equal: remove all, then create
//!
//! Creating or updating a claim also brings its qualifiers and references
//! in line with the intent. Each write is its own retried step, so a rate
//! limit part way through never repeats a step that already landed.

pub mod retry;
pub mod significance;

use std::sync::Arc;
use std::time::Duration;

use crate::error::JobError;
use crate::fetch::RATE_LIMIT_BACKOFF;
use crate::queue::JobQueue;
use crate::store::{Claim, ClaimValue, RecordStore, Reference, Snak};

use self::retry::retry_rate_limited;

/// A proposed (record, property, value) state to converge towards.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimIntent {
    pub target: String,
    pub property: String,
    pub value: ClaimValue,
    pub qualifiers: Vec<Snak>,
    pub references: Vec<Reference>,
}

impl ClaimIntent {
    pub fn new(target: impl Into<String>, property: impl Into<String>, value: ClaimValue) -> Self {
        Self {
            target: target.into(),
            property: property.into(),
            value,
            qualifiers: Vec::new(),
            references: Vec::new(),
        }
    }

    pub fn with_qualifier(mut self, qualifier: Snak) -> Self {
        self.qualifiers.push(qualifier);
        self
    }

    pub fn with_reference(mut self, reference: Reference) -> Self {
        self.references.push(reference);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermKind {
    Label,
    Description,
    Alias,
}

impl TermKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TermKind::Label => "label",
            TermKind::Description => "description",
            TermKind::Alias => "alias",
        }
    }
}

/// A label, description or alias for one language.
#[derive(Debug, Clone, PartialEq)]
pub struct TermIntent {
    pub target: String,
    pub kind: TermKind,
    pub language: String,
    pub value: String,
    /// Replace an existing label/description that differs. Aliases are
    /// only ever added.
    pub overwrite: bool,
}

impl TermIntent {
    fn new(kind: TermKind, target: &str, language: &str, value: &str) -> Self {
        Self {
            target: target.to_string(),
            kind,
            language: language.to_string(),
            value: value.to_string(),
            overwrite: false,
        }
    }

    pub fn label(target: &str, language: &str, value: &str) -> Self {
        Self::new(TermKind::Label, target, language, value)
    }

    pub fn description(target: &str, language: &str, value: &str) -> Self {
        Self::new(TermKind::Description, target, language, value)
    }

    pub fn alias(target: &str, language: &str, value: &str) -> Self {
        Self::new(TermKind::Alias, target, language, value)
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// What reconciliation will do, decided from one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Create,
    Unchanged,
    /// Keep `keep`, remove everything else on the property.
    Prune { keep: String, remove: Vec<String> },
    Update { guid: String },
    /// Remove every existing claim, then create.
    Replace { remove: Vec<String> },
}

/// Decide how to converge `existing` (claims of one property, in snapshot
/// order) onto `desired`. When several claims already match, the first in
/// snapshot order survives.
pub fn plan(existing: &[Claim], desired: &ClaimValue) -> Plan {
    if existing.is_empty() {
        return Plan::Create;
    }

    if let Some(keep) = existing.iter().find(|c| c.value.matches(desired)) {
        let remove: Vec<String> = existing
            .iter()
            .filter(|c| c.guid != keep.guid)
            .map(|c| c.guid.clone())
            .collect();
        if remove.is_empty() {
            return Plan::Unchanged;
        }
        return Plan::Prune {
            keep: keep.guid.clone(),
            remove,
        };
    }

    if let [only] = existing {
        return Plan::Update {
            guid: only.guid.clone(),
        };
    }

    Plan::Replace {
        remove: existing.iter().map(|c| c.guid.clone()).collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created,
    Unchanged,
    Deduplicated { removed: usize },
    Updated,
    Replaced { removed: usize },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sleep between retries of a rate-limited write.
    pub backoff: Duration,
    /// Prefix of every edit summary.
    pub summary_prefix: String,
    /// Log writes instead of issuing them.
    pub dry_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backoff: RATE_LIMIT_BACKOFF,
            summary_prefix: "worldsync".to_string(),
            dry_run: false,
        }
    }
}

/// Cloning shares the store and the serial lane.
#[derive(Clone)]
pub struct ClaimEngine {
    store: Arc<dyn RecordStore>,
    serial: JobQueue,
    config: EngineConfig,
}

impl ClaimEngine {
    pub fn new(store: Arc<dyn RecordStore>, serial: JobQueue, config: EngineConfig) -> Self {
        Self {
            store,
            serial,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Schedule reconciliation of `intent` on the serial lane.
    pub fn ensure(&self, intent: ClaimIntent) {
        let engine = self.clone();
        let name = format!("ensure {} {}", intent.target, intent.property);
        self.serial.add(name, async move {
            engine.reconcile(&intent).await?;
            Ok(())
        });
    }

    /// Schedule reconciliation of a term on the serial lane.
    pub fn ensure_term(&self, intent: TermIntent) {
        let engine = self.clone();
        let name = format!(
            "ensure {} {} {}",
            intent.target,
            intent.kind.as_str(),
            intent.language
        );
        self.serial.add(name, async move {
            engine.reconcile_term(&intent).await?;
            Ok(())
        });
    }

    fn summary(&self, action: &str) -> String {
        format!("{}: {}", self.config.summary_prefix, action)
    }

    /// True when the write should be skipped.
    fn dry_run(&self, action: &str) -> bool {
        if self.config.dry_run {
            log::info!("Engine: [dry-run] would {}", action);
        }
        self.config.dry_run
    }

    /// Converge one property now. Callers outside the serial lane must
    /// not call this concurrently for the same record; use `ensure`.
    pub async fn reconcile(&self, intent: &ClaimIntent) -> Result<ReconcileOutcome, JobError> {
        let store = self.store.as_ref();
        let backoff = self.config.backoff;
        let target = intent.target.as_str();
        let property = intent.property.as_str();
        let desired = &intent.value;

        let entity = match retry_rate_limited(backoff, "read", move || store.get_entity(target)).await
        {
            Ok(entity) => entity,
            Err(e) => {
                log::warn!("Engine: cannot read {}, leaving {} untouched: {}", target, property, e);
                return Err(e.into());
            }
        };
        let existing = entity.claims_for(property);

        match plan(existing, desired) {
            Plan::Unchanged => {
                log::debug!("Engine: {} {} already {}", target, property, desired);
                Ok(ReconcileOutcome::Unchanged)
            }
            Plan::Create => {
                self.create(intent).await?;
                Ok(ReconcileOutcome::Created)
            }
            Plan::Prune { keep, remove } => {
                log::info!(
                    "Engine: {} {} keeps {}, pruning {} other claim(s)",
                    target,
                    property,
                    keep,
                    remove.len()
                );
                self.remove_each(target, property, &remove).await?;
                Ok(ReconcileOutcome::Deduplicated {
                    removed: remove.len(),
                })
            }
            Plan::Update { guid } => {
                let action = format!("update {} {} from {} to {}", target, property, existing[0].value, desired);
                if !self.dry_run(&action) {
                    let claim = existing
                        .iter()
                        .find(|c| c.guid == guid)
                        .unwrap_or(&existing[0]);
                    let summary = self.summary(&format!("update {} to {}", property, desired));
                    let summary = summary.as_str();
                    retry_rate_limited(backoff, "update", move || {
                        store.update_claim(claim, desired, summary)
                    })
                    .await?;
                    log::info!("Engine: {}", action);
                    self.sync_details(&guid, Some(claim), intent).await?;
                }
                Ok(ReconcileOutcome::Updated)
            }
            Plan::Replace { remove } => {
                log::warn!(
                    "Engine: {} has {} conflicting {} claims, replacing with {}",
                    target,
                    remove.len(),
                    property,
                    desired
                );
                self.remove_each(target, property, &remove).await?;
                self.create(intent).await?;
                Ok(ReconcileOutcome::Replaced {
                    removed: remove.len(),
                })
            }
        }
    }

    async fn create(&self, intent: &ClaimIntent) -> Result<(), JobError> {
        let action = format!("create {} {} = {}", intent.target, intent.property, intent.value);
        if self.dry_run(&action) {
            return Ok(());
        }
        let store = self.store.as_ref();
        let summary = self.summary(&format!("set {} to {}", intent.property, intent.value));
        let summary = summary.as_str();
        let (target, property, value) = (intent.target.as_str(), intent.property.as_str(), &intent.value);
        let guid = retry_rate_limited(self.config.backoff, "create", move || {
            store.create_claim(target, property, value, summary)
        })
        .await?;
        log::info!("Engine: {} ({})", action, guid);
        self.sync_details(&guid, None, intent).await
    }

    /// Set each qualifier and add each reference the claim is missing.
    /// `current` is the claim as last read, or `None` for a new claim.
    async fn sync_details(&self, guid: &str, current: Option<&Claim>, intent: &ClaimIntent) -> Result<(), JobError> {
        let store = self.store.as_ref();
        let backoff = self.config.backoff;
        let summary = self.summary(&format!("sources for {}", intent.property));
        let summary = summary.as_str();

        for qualifier in &intent.qualifiers {
            let in_place = current.is_some_and(|claim| {
                let mut same_property = claim.qualifiers.iter().filter(|q| q.property == qualifier.property);
                matches!(
                    (same_property.next(), same_property.next()),
                    (Some(only), None) if only.value.matches(&qualifier.value)
                )
            });
            if in_place {
                continue;
            }
            retry_rate_limited(backoff, "qualifier", move || store.set_qualifier(guid, qualifier, summary)).await?;
            log::debug!("Engine: {} qualifier {} = {}", guid, qualifier.property, qualifier.value);
        }

        for reference in &intent.references {
            if current.is_some_and(|claim| claim.references.iter().any(|r| r.matches(reference))) {
                continue;
            }
            retry_rate_limited(backoff, "reference", move || store.add_reference(guid, reference, summary)).await?;
            log::debug!("Engine: {} gained a reference", guid);
        }
        Ok(())
    }

    /// One removal per claim, each retried on its own.
    async fn remove_each(&self, target: &str, property: &str, guids: &[String]) -> Result<(), JobError> {
        let store = self.store.as_ref();
        let summary = self.summary(&format!("remove superseded {}", property));
        let summary = summary.as_str();
        for guid in guids {
            if self.dry_run(&format!("remove {} from {}", guid, target)) {
                continue;
            }
            let one = std::slice::from_ref(guid);
            retry_rate_limited(self.config.backoff, "remove", move || store.remove_claims(one, summary))
                .await?;
        }
        Ok(())
    }

    /// Set a term when the fresh snapshot does not already carry it.
    pub async fn reconcile_term(&self, intent: &TermIntent) -> Result<ReconcileOutcome, JobError> {
        let store = self.store.as_ref();
        let backoff = self.config.backoff;
        let target = intent.target.as_str();
        let language = intent.language.as_str();
        let value = intent.value.as_str();

        let entity = match retry_rate_limited(backoff, "read", move || store.get_entity(target)).await
        {
            Ok(entity) => entity,
            Err(e) => {
                log::warn!("Engine: cannot read {}, leaving {} untouched: {}", target, intent.kind.as_str(), e);
                return Err(e.into());
            }
        };

        let current = match intent.kind {
            TermKind::Label => entity.labels.get(language),
            TermKind::Description => entity.descriptions.get(language),
            TermKind::Alias => None,
        };
        let outcome = match intent.kind {
            TermKind::Alias => {
                let known = entity.label(language) == Some(value)
                    || entity
                        .aliases
                        .get(language)
                        .is_some_and(|aliases| aliases.iter().any(|a| a == value));
                if known {
                    return Ok(ReconcileOutcome::Unchanged);
                }
                ReconcileOutcome::Created
            }
            _ => match current {
                Some(existing) if existing == value => return Ok(ReconcileOutcome::Unchanged),
                Some(existing) if !intent.overwrite => {
                    log::debug!(
                        "Engine: {} keeps {} {} '{}'",
                        target,
                        language,
                        intent.kind.as_str(),
                        existing
                    );
                    return Ok(ReconcileOutcome::Unchanged);
                }
                Some(_) => ReconcileOutcome::Updated,
                None => ReconcileOutcome::Created,
            },
        };

        let action = format!("set {} {} {} to '{}'", target, language, intent.kind.as_str(), value);
        if self.dry_run(&action) {
            return Ok(outcome);
        }
        let summary = self.summary(&format!("set {} {}", language, intent.kind.as_str()));
        let summary = summary.as_str();
        let kind = intent.kind;
        retry_rate_limited(backoff, kind.as_str(), move || async move {
            match kind {
                TermKind::Label => store.set_label(target, language, value, summary).await,
                TermKind::Description => store.set_description(target, language, value, summary).await,
                TermKind::Alias => store.add_alias(target, language, value, summary).await,
            }
        })
        .await?;
        log::info!("Engine: {}", action);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::queue::{wait_until_quiescent, Lane};
    use crate::store::memory::StoreOp;
    use crate::store::{Entity, InMemoryStore};

    fn claim(guid: &str, value: ClaimValue) -> Claim {
        Claim {
            guid: guid.to_string(),
            property: "P1".to_string(),
            value,
            qualifiers: Vec::new(),
            references: Vec::new(),
        }
    }

    fn s(v: &str) -> ClaimValue {
        ClaimValue::string(v)
    }

    fn engine(store: Arc<InMemoryStore>) -> ClaimEngine {
        ClaimEngine::new(store, JobQueue::new(Lane::Serial, 1), EngineConfig::default())
    }

    fn guids(store: &InMemoryStore) -> Vec<String> {
        store
            .entity("Q1")
            .map(|e| e.claims_for("P1").iter().map(|c| c.guid.clone()).collect())
            .unwrap_or_default()
    }

    fn values(store: &InMemoryStore) -> Vec<ClaimValue> {
        store
            .entity("Q1")
            .map(|e| e.claims_for("P1").iter().map(|c| c.value.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_plan_cases() {
        assert_eq!(plan(&[], &s("A")), Plan::Create);
        assert_eq!(plan(&[claim("g1", s("A"))], &s("A")), Plan::Unchanged);
        assert_eq!(
            plan(&[claim("g1", s("A")), claim("g2", s("A")), claim("g3", s("B"))], &s("A")),
            Plan::Prune {
                keep: "g1".to_string(),
                remove: vec!["g2".to_string(), "g3".to_string()],
            }
        );
        assert_eq!(
            plan(&[claim("g1", s("B"))], &s("A")),
            Plan::Update {
                guid: "g1".to_string()
            }
        );
        assert_eq!(
            plan(&[claim("g1", s("B")), claim("g2", s("C"))], &s("A")),
            Plan::Replace {
                remove: vec!["g1".to_string(), "g2".to_string()]
            }
        );
    }

    #[test]
    fn test_plan_keeps_first_match_even_after_a_differing_claim() {
        let existing = [claim("g1", s("B")), claim("g2", s("A")), claim("g3", s("A"))];
        assert_eq!(
            plan(&existing, &s("A")),
            Plan::Prune {
                keep: "g2".to_string(),
                remove: vec!["g1".to_string(), "g3".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let store = Arc::new(InMemoryStore::new().with_claims("Q1", "P1", vec![]));
        let engine = engine(store.clone());
        let intent = ClaimIntent::new("Q1", "P1", s("A"));

        assert_eq!(engine.reconcile(&intent).await.unwrap(), ReconcileOutcome::Created);
        let writes_after_first = store.writes().len();
        assert_eq!(engine.reconcile(&intent).await.unwrap(), ReconcileOutcome::Unchanged);

        assert_eq!(store.writes().len(), writes_after_first);
        assert_eq!(values(&store), vec![s("A")]);
    }

    #[tokio::test]
    async fn test_duplicates_converge_to_one_claim() {
        let store = Arc::new(InMemoryStore::new().with_claims("Q1", "P1", vec![s("A"), s("A"), s("B")]));
        let before = guids(&store);
        let engine = engine(store.clone());

        let outcome = engine.reconcile(&ClaimIntent::new("Q1", "P1", s("A"))).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Deduplicated { removed: 2 });
        assert_eq!(
            store.writes(),
            vec![
                StoreOp::Remove(vec![before[1].clone()]),
                StoreOp::Remove(vec![before[2].clone()]),
            ]
        );
        assert_eq!(guids(&store), vec![before[0].clone()]);
    }

    #[tokio::test]
    async fn test_single_differing_claim_is_updated_in_place() {
        let store = Arc::new(InMemoryStore::new().with_claims("Q1", "P1", vec![s("B")]));
        let before = guids(&store);
        let engine = engine(store.clone());

        let outcome = engine.reconcile(&ClaimIntent::new("Q1", "P1", s("A"))).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Updated);
        assert_eq!(
            store.writes(),
            vec![StoreOp::Update {
                guid: before[0].clone(),
                from: s("B"),
                to: s("A"),
            }]
        );
        assert_eq!(guids(&store), before);
    }

    #[tokio::test]
    async fn test_dirty_state_is_replaced() {
        let store = Arc::new(InMemoryStore::new().with_claims("Q1", "P1", vec![s("B"), s("C")]));
        let before = guids(&store);
        let engine = engine(store.clone());

        let outcome = engine.reconcile(&ClaimIntent::new("Q1", "P1", s("A"))).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Replaced { removed: 2 });
        assert_eq!(
            store.writes(),
            vec![
                StoreOp::Remove(vec![before[0].clone()]),
                StoreOp::Remove(vec![before[1].clone()]),
                StoreOp::Create {
                    property: "P1".to_string(),
                    value: s("A"),
                },
            ]
        );
        assert_eq!(values(&store), vec![s("A")]);
    }

    #[tokio::test]
    async fn test_signed_quantity_matches_plain_number() {
        let stored = ClaimValue::Quantity {
            amount: "+42".to_string(),
            unit: "1".to_string(),
        };
        let store = Arc::new(InMemoryStore::new().with_claims("Q1", "P1", vec![stored]));
        let engine = engine(store.clone());

        let outcome = engine
            .reconcile(&ClaimIntent::new("Q1", "P1", ClaimValue::quantity(42)))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_read_failure_aborts_without_writes() {
        let store = Arc::new(InMemoryStore::new().with_claims("Q1", "P1", vec![s("B")]));
        store.set_fail_reads(true);
        let engine = engine(store.clone());

        let result = engine.reconcile(&ClaimIntent::new("Q1", "P1", s("A"))).await;

        assert!(matches!(result, Err(JobError::Store(StoreError::Api { .. }))));
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_missing_record_aborts_without_writes() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine(store.clone());

        let result = engine.reconcile(&ClaimIntent::new("Q404", "P1", s("A"))).await;

        assert!(matches!(result, Err(JobError::Store(StoreError::EntityNotFound(_)))));
        assert!(store.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_write_is_retried() {
        let store = Arc::new(InMemoryStore::new().with_claims("Q1", "P1", vec![]));
        store.rate_limit_next_writes(2);
        let engine = engine(store.clone());

        let started = tokio::time::Instant::now();
        let outcome = engine.reconcile(&ClaimIntent::new("Q1", "P1", s("A"))).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Created);
        assert!(started.elapsed() >= RATE_LIMIT_BACKOFF * 2);
        assert_eq!(values(&store), vec![s("A")]);
    }

    #[tokio::test]
    async fn test_qualifiers_and_references_are_written_on_create() {
        let store = Arc::new(InMemoryStore::new().with_claims("Q1", "P1", vec![]));
        let engine = engine(store.clone());
        let intent = ClaimIntent::new("Q1", "P1", ClaimValue::quantity(10))
            .with_qualifier(Snak::new("P2", s("2024-05-01")))
            .with_reference(Reference::url("P3", "https://wiki.example/"));

        engine.reconcile(&intent).await.unwrap();

        let created = store.entity("Q1").unwrap().claims_for("P1")[0].clone();
        assert_eq!(created.qualifiers, intent.qualifiers);
        assert_eq!(created.references, intent.references);
    }

    #[tokio::test]
    async fn test_update_replaces_stale_qualifier() {
        let store = Arc::new(InMemoryStore::new().with_claims("Q1", "P1", vec![ClaimValue::quantity(5)]));
        let guid = guids(&store)[0].clone();
        let old = Snak::new("P5", s("2023-01-01"));
        let source = Reference::url("P3", "https://wiki.example/");
        store.set_qualifier(&guid, &old, "").await.unwrap();
        store.add_reference(&guid, &source, "").await.unwrap();
        let seeded = store.writes().len();
        let engine = engine(store.clone());

        let intent = ClaimIntent::new("Q1", "P1", ClaimValue::quantity(10))
            .with_qualifier(Snak::new("P5", s("2024-05-01")))
            .with_reference(source.clone());
        let outcome = engine.reconcile(&intent).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Updated);
        let updated = store.entity("Q1").unwrap().claims_for("P1")[0].clone();
        assert_eq!(updated.guid, guid);
        assert_eq!(updated.value, ClaimValue::quantity(10));
        assert_eq!(updated.qualifiers, intent.qualifiers);
        // the reference was already there
        assert_eq!(updated.references, vec![source]);
        assert_eq!(
            store.writes()[seeded..],
            [
                StoreOp::Update {
                    guid: guid.clone(),
                    from: ClaimValue::quantity(5),
                    to: ClaimValue::quantity(10),
                },
                StoreOp::SetQualifier {
                    guid: guid.clone(),
                    property: "P5".to_string(),
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_between_create_and_qualifier_creates_once() {
        use crate::fetch::test_support::ScriptedTransport;
        use crate::fetch::{FetchPolicy, Fetcher};
        use crate::store::WikibaseStore;

        const API: &str = "https://kb.example/w/api.php";
        let transport = Arc::new(
            ScriptedTransport::new()
                .on(
                    "https://kb.example/w/api.php?action=wbgetentities",
                    200,
                    r#"{"entities":{"Q7":{"id":"Q7","claims":[]}}}"#,
                )
                .on(
                    "https://kb.example/w/api.php?action=query",
                    200,
                    r#"{"query":{"tokens":{"csrftoken":"abc+\\"}}}"#,
                )
                .on(
                    "https://kb.example/w/api.php?action=wbgetclaims",
                    200,
                    r#"{"claims":{"P1":[{"id":"Q7$FIRST","mainsnak":{"snaktype":"value","property":"P1",
                        "datavalue":{"type":"quantity","value":{"amount":"+10","unit":"1"}}}}]}}"#,
                )
                .on(API, 200, r#"{"success":1,"claim":{"id":"Q7$FIRST"}}"#)
                .on(API, 200, r#"{"error":{"code":"maxlag","info":"lagged"}}"#)
                .on(API, 200, r#"{"success":1}"#),
        );
        let fetcher = Arc::new(Fetcher::new(transport.clone(), FetchPolicy::default()));
        let store = Arc::new(WikibaseStore::new(API, fetcher, Some("secret".to_string()), 5));
        let engine = ClaimEngine::new(store, JobQueue::new(Lane::Serial, 1), EngineConfig::default());

        let intent = ClaimIntent::new("Q7", "P1", ClaimValue::quantity(10))
            .with_qualifier(Snak::new("P5", s("2024-05-01")));
        let outcome = engine.reconcile(&intent).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Created);
        // create, rate-limited qualifier, retried qualifier
        let posts = transport.calls(API) - transport.calls(&format!("{}?", API));
        assert_eq!(posts, 3);
        assert_eq!(transport.calls("https://kb.example/w/api.php?action=wbgetclaims"), 2);
    }

    #[tokio::test]
    async fn test_dry_run_issues_no_writes() {
        let store = Arc::new(InMemoryStore::new().with_claims("Q1", "P1", vec![s("B"), s("C")]));
        let engine = ClaimEngine::new(
            store.clone(),
            JobQueue::new(Lane::Serial, 1),
            EngineConfig {
                dry_run: true,
                ..EngineConfig::default()
            },
        );

        let outcome = engine.reconcile(&ClaimIntent::new("Q1", "P1", s("A"))).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Replaced { removed: 2 });
        assert!(store.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_ensures_never_interleave() {
        let store = Arc::new(InMemoryStore::new().with_claims("Q1", "P1", vec![]));
        store.set_read_delay(Duration::from_millis(50));
        let serial = JobQueue::new(Lane::Serial, 1);
        let engine = ClaimEngine::new(store.clone(), serial.clone(), EngineConfig::default());

        engine.ensure(ClaimIntent::new("Q1", "P1", s("A")));
        engine.ensure(ClaimIntent::new("Q1", "P1", s("B")));
        wait_until_quiescent(|| serial.size(), Duration::from_millis(10), 3).await;

        let ops = store.ops();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0], StoreOp::Read("Q1".to_string()));
        assert_eq!(
            ops[1],
            StoreOp::Create {
                property: "P1".to_string(),
                value: s("A"),
            }
        );
        assert_eq!(ops[2], StoreOp::Read("Q1".to_string()));
        assert!(matches!(&ops[3], StoreOp::Update { from, to, .. } if *from == s("A") && *to == s("B")));
        assert_eq!(values(&store), vec![s("B")]);
    }

    #[tokio::test]
    async fn test_label_set_when_missing_and_kept_otherwise() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(Entity::new("Q1"));
        let engine = engine(store.clone());

        let first = engine
            .reconcile_term(&TermIntent::label("Q1", "en", "Example Wiki"))
            .await
            .unwrap();
        let second = engine
            .reconcile_term(&TermIntent::label("Q1", "en", "Renamed Wiki"))
            .await
            .unwrap();

        assert_eq!(first, ReconcileOutcome::Created);
        assert_eq!(second, ReconcileOutcome::Unchanged);
        assert_eq!(store.entity("Q1").unwrap().label("en"), Some("Example Wiki"));

        let forced = engine
            .reconcile_term(&TermIntent::label("Q1", "en", "Renamed Wiki").overwrite(true))
            .await
            .unwrap();
        assert_eq!(forced, ReconcileOutcome::Updated);
        assert_eq!(store.entity("Q1").unwrap().label("en"), Some("Renamed Wiki"));
    }

    #[tokio::test]
    async fn test_alias_skipped_when_it_is_the_label() {
        let store = Arc::new(InMemoryStore::new());
        let mut entity = Entity::new("Q1");
        entity.labels.insert("en".to_string(), "Example".to_string());
        store.insert(entity);
        let engine = engine(store.clone());

        assert_eq!(
            engine.reconcile_term(&TermIntent::alias("Q1", "en", "Example")).await.unwrap(),
            ReconcileOutcome::Unchanged
        );
        assert_eq!(
            engine.reconcile_term(&TermIntent::alias("Q1", "en", "ExWiki")).await.unwrap(),
            ReconcileOutcome::Created
        );
        assert_eq!(
            engine.reconcile_term(&TermIntent::alias("Q1", "en", "ExWiki")).await.unwrap(),
            ReconcileOutcome::Unchanged
        );
        assert_eq!(
            store.writes(),
            vec![StoreOp::AddAlias {
                language: "en".to_string(),
                value: "ExWiki".to_string(),
            }]
        );
    }
}
