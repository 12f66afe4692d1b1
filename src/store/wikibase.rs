//! Record store backed by a Wikibase action API.
//!
//! Reads use `wbgetentities` and always bypass the response cache. Writes
//! POST with a CSRF token that is fetched once and refreshed when the API
//! answers `badtoken`. Authentication is an OAuth 2 owner-only bearer
//! token.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::types::{Claim, ClaimValue, Entity, Reference, Snak};
use super::RecordStore;
use crate::error::{FetchError, StoreError};
use crate::fetch::{FetchOptions, Fetcher};

/// Error codes the write API uses to ask for a slower pace.
const RATE_LIMIT_CODES: [&str; 2] = ["ratelimited", "maxlag"];

pub struct WikibaseStore {
    api_url: String,
    fetcher: Arc<Fetcher>,
    access_token: Option<String>,
    maxlag: u32,
    csrf_token: Mutex<Option<String>>,
}

impl WikibaseStore {
    pub fn new(api_url: &str, fetcher: Arc<Fetcher>, access_token: Option<String>, maxlag: u32) -> Self {
        Self {
            api_url: api_url.to_string(),
            fetcher,
            access_token,
            maxlag,
            csrf_token: Mutex::new(None),
        }
    }

    fn options(&self, base: FetchOptions) -> FetchOptions {
        match &self.access_token {
            Some(token) => base.header("Authorization", &format!("Bearer {}", token)),
            None => base,
        }
    }

    async fn read(&self, params: &[(&str, &str)]) -> Result<Value, StoreError> {
        let mut all: Vec<(&str, &str)> = params.to_vec();
        all.push(("format", "json"));
        let url = url::Url::parse_with_params(&self.api_url, &all)
            .map_err(|_| FetchError::InvalidUrl(self.api_url.clone()))?;
        let response = self
            .fetcher
            .fetch(url.as_str(), &self.options(FetchOptions::get()))
            .await?;
        parse_api_response(response.status, &response.body, &self.api_url)
    }

    async fn csrf_token(&self) -> Result<String, StoreError> {
        let mut cached = self.csrf_token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let body = self
            .read(&[("action", "query"), ("meta", "tokens"), ("type", "csrf")])
            .await?;
        let token = body
            .pointer("/query/tokens/csrftoken")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Malformed("missing csrftoken".to_string()))?;
        // An anonymous session gets the placeholder token "+\\"
        if token == "+\\" {
            return Err(StoreError::Auth("not logged in".to_string()));
        }
        *cached = Some(token.to_string());
        Ok(token.to_string())
    }

    /// POST a write action. A stale CSRF token is refreshed and the write
    /// retried once.
    async fn write(&self, action: &str, params: Vec<(String, String)>) -> Result<Value, StoreError> {
        let mut refreshed = false;
        loop {
            let token = self.csrf_token().await?;
            let mut form = vec![
                ("action".to_string(), action.to_string()),
                ("format".to_string(), "json".to_string()),
                ("bot".to_string(), "1".to_string()),
                ("maxlag".to_string(), self.maxlag.to_string()),
            ];
            form.extend(params.iter().cloned());
            form.push(("token".to_string(), token));

            let response = self
                .fetcher
                .fetch(&self.api_url, &self.options(FetchOptions::post_form(form)))
                .await?;
            match parse_api_response(response.status, &response.body, &self.api_url) {
                Err(StoreError::Api { code, .. }) if code == "badtoken" && !refreshed => {
                    log::info!("Store: CSRF token expired, refreshing");
                    *self.csrf_token.lock().await = None;
                    refreshed = true;
                }
                other => return other,
            }
        }
    }
}

/// Turn an action API response into its JSON body or a classified error.
pub fn parse_api_response(status: u16, body: &str, url: &str) -> Result<Value, StoreError> {
    if status == 401 || status == 403 {
        return Err(StoreError::Auth(format!("HTTP {} from {}", status, url)));
    }
    if !(200..300).contains(&status) {
        return Err(StoreError::Fetch(FetchError::Status {
            status,
            url: url.to_string(),
        }));
    }
    let value: Value = serde_json::from_str(body).map_err(|e| {
        StoreError::Fetch(FetchError::Parse {
            url: url.to_string(),
            message: e.to_string(),
        })
    })?;

    if let Some(error) = value.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if RATE_LIMIT_CODES.contains(&code.as_str()) {
            return Err(StoreError::TooManyRequests(code));
        }
        if code == "mwoauth-invalid-authorization" || code == "permissiondenied" {
            return Err(StoreError::Auth(info));
        }
        return Err(StoreError::Api { code, info });
    }
    Ok(value)
}

/// `(hash, value)` of every qualifier of `property` on claim `guid`, from
/// a `wbgetclaims` response.
fn qualifier_snaks(body: &Value, guid: &str, property: &str) -> Result<Vec<(String, ClaimValue)>, StoreError> {
    let statement = body
        .get("claims")
        .and_then(Value::as_object)
        .and_then(|claims| {
            claims
                .values()
                .filter_map(Value::as_array)
                .flatten()
                .find(|st| st.get("id").and_then(Value::as_str) == Some(guid))
        })
        .ok_or_else(|| StoreError::Api {
            code: "invalid-guid".to_string(),
            info: guid.to_string(),
        })?;

    let snaks = statement
        .get("qualifiers")
        .and_then(|q| q.get(property))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    Ok(snaks
        .iter()
        .filter_map(|snak| {
            let hash = snak.get("hash")?.as_str()?.to_string();
            let value = match snak.get("datavalue") {
                Some(dv) => ClaimValue::from_datavalue(dv)?,
                None => ClaimValue::Other(snak.get("snaktype")?.as_str()?.to_string()),
            };
            Some((hash, value))
        })
        .collect())
}

fn wire_value(value: &ClaimValue) -> String {
    value.to_wire().to_string()
}

fn param(name: &str, value: impl Into<String>) -> (String, String) {
    (name.to_string(), value.into())
}

#[async_trait]
impl RecordStore for WikibaseStore {
    async fn get_entity(&self, id: &str) -> Result<Entity, StoreError> {
        let body = self
            .read(&[
                ("action", "wbgetentities"),
                ("ids", id),
                ("props", "labels|descriptions|aliases|claims"),
            ])
            .await?;
        Entity::from_wbgetentities(&body, id)
    }

    async fn create_claim(
        &self,
        entity_id: &str,
        property: &str,
        value: &ClaimValue,
        summary: &str,
    ) -> Result<String, StoreError> {
        let body = self
            .write(
                "wbcreateclaim",
                vec![
                    param("entity", entity_id),
                    param("property", property),
                    param("snaktype", "value"),
                    param("value", wire_value(value)),
                    param("summary", summary),
                ],
            )
            .await?;
        let guid = body
            .pointer("/claim/id")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Malformed("wbcreateclaim returned no claim id".to_string()))?;
        Ok(guid.to_string())
    }

    /// Reads the claim's current qualifiers first: an equal one is kept,
    /// otherwise the first of the property is overwritten by hash, and
    /// any others of the property are removed.
    async fn set_qualifier(&self, guid: &str, qualifier: &Snak, summary: &str) -> Result<(), StoreError> {
        let body = self.read(&[("action", "wbgetclaims"), ("claim", guid)]).await?;
        let existing = qualifier_snaks(&body, guid, &qualifier.property)?;

        let stale: Vec<String> = match existing.iter().position(|(_, v)| v.matches(&qualifier.value)) {
            Some(keep) => existing
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != keep)
                .map(|(_, (hash, _))| hash.clone())
                .collect(),
            None => {
                let mut hashes = existing.into_iter().map(|(hash, _)| hash);
                let mut params = vec![
                    param("claim", guid),
                    param("property", qualifier.property.as_str()),
                    param("snaktype", "value"),
                    param("value", wire_value(&qualifier.value)),
                    param("summary", summary),
                ];
                if let Some(hash) = hashes.next() {
                    params.push(param("snakhash", hash));
                }
                self.write("wbsetqualifier", params).await?;
                hashes.collect()
            }
        };

        if !stale.is_empty() {
            self.write(
                "wbremovequalifiers",
                vec![
                    param("claim", guid),
                    param("qualifiers", stale.join("|")),
                    param("summary", summary),
                ],
            )
            .await?;
        }
        Ok(())
    }

    async fn update_claim(
        &self,
        claim: &Claim,
        value: &ClaimValue,
        summary: &str,
    ) -> Result<(), StoreError> {
        self.write(
            "wbsetclaimvalue",
            vec![
                param("claim", claim.guid.as_str()),
                param("snaktype", "value"),
                param("value", wire_value(value)),
                param("summary", summary),
            ],
        )
        .await?;
        Ok(())
    }

    async fn remove_claims(&self, guids: &[String], summary: &str) -> Result<(), StoreError> {
        if guids.is_empty() {
            return Ok(());
        }
        self.write(
            "wbremoveclaims",
            vec![param("claim", guids.join("|")), param("summary", summary)],
        )
        .await?;
        Ok(())
    }

    async fn set_label(
        &self,
        entity_id: &str,
        language: &str,
        value: &str,
        summary: &str,
    ) -> Result<(), StoreError> {
        self.write(
            "wbsetlabel",
            vec![
                param("id", entity_id),
                param("language", language),
                param("value", value),
                param("summary", summary),
            ],
        )
        .await?;
        Ok(())
    }

    async fn set_description(
        &self,
        entity_id: &str,
        language: &str,
        value: &str,
        summary: &str,
    ) -> Result<(), StoreError> {
        self.write(
            "wbsetdescription",
            vec![
                param("id", entity_id),
                param("language", language),
                param("value", value),
                param("summary", summary),
            ],
        )
        .await?;
        Ok(())
    }

    async fn add_alias(
        &self,
        entity_id: &str,
        language: &str,
        value: &str,
        summary: &str,
    ) -> Result<(), StoreError> {
        self.write(
            "wbsetaliases",
            vec![
                param("id", entity_id),
                param("language", language),
                param("add", value),
                param("summary", summary),
            ],
        )
        .await?;
        Ok(())
    }

    async fn add_reference(
        &self,
        guid: &str,
        reference: &Reference,
        summary: &str,
    ) -> Result<(), StoreError> {
        self.write(
            "wbsetreference",
            vec![
                param("statement", guid),
                param("snaks", reference.snaks_wire().to_string()),
                param("summary", summary),
            ],
        )
        .await?;
        Ok(())
    }
}
