//! Record snapshots and claim values, plus conversion from and to the
//! Wikibase JSON shapes.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::StoreError;

/// Calendar model used for every time value we write (proleptic Gregorian).
pub const GREGORIAN_CALENDAR: &str = "http://www.wikidata.org/entity/Q1985727";

/// Time precision for a calendar day.
pub const PRECISION_DAY: u8 = 11;

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimValue {
    /// String, URL, external id and similar string-typed datatypes.
    String(String),
    /// Reference to another entity, e.g. `Q42`.
    Item(String),
    /// Signed decimal amount as the store encodes it (`+42`), and a unit
    /// (`1` for unitless, otherwise an entity URI).
    Quantity { amount: String, unit: String },
    Time { time: String, precision: u8 },
    MonolingualText { text: String, language: String },
    /// `somevalue` / `novalue` snaks and datatypes we do not model.
    Other(String),
}

impl ClaimValue {
    pub fn string(value: impl Into<String>) -> Self {
        ClaimValue::String(value.into())
    }

    pub fn item(id: impl Into<String>) -> Self {
        ClaimValue::Item(id.into())
    }

    /// Unitless quantity.
    pub fn quantity(amount: i64) -> Self {
        ClaimValue::Quantity {
            amount: format!("{:+}", amount),
            unit: "1".to_string(),
        }
    }

    /// Day-precision time, e.g. from `2024-05-01`.
    pub fn day(date: chrono::NaiveDate) -> Self {
        ClaimValue::Time {
            time: format!("+{}T00:00:00Z", date.format("%Y-%m-%d")),
            precision: PRECISION_DAY,
        }
    }

    /// Numeric value of a quantity, with any leading `+` stripped.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ClaimValue::Quantity { amount, .. } => parse_amount(amount),
            _ => None,
        }
    }

    /// Whether two values mean the same thing.
    ///
    /// Quantities compare numerically with normalised units, because the
    /// store does not encode amounts byte-identically across writers.
    /// Everything else compares by identity.
    pub fn matches(&self, other: &ClaimValue) -> bool {
        match (self, other) {
            (
                ClaimValue::Quantity { amount: a, unit: ua },
                ClaimValue::Quantity { amount: b, unit: ub },
            ) => {
                let same_amount = match (parse_amount(a), parse_amount(b)) {
                    (Some(x), Some(y)) => x == y,
                    _ => a == b,
                };
                same_amount && normalize_unit(ua) == normalize_unit(ub)
            }
            (ClaimValue::Item(a), ClaimValue::Item(b)) => a.eq_ignore_ascii_case(b),
            _ => self == other,
        }
    }

    /// Wikibase datavalue type name.
    pub fn wire_type(&self) -> &'static str {
        match self {
            ClaimValue::String(_) | ClaimValue::Other(_) => "string",
            ClaimValue::Item(_) => "wikibase-entityid",
            ClaimValue::Quantity { .. } => "quantity",
            ClaimValue::Time { .. } => "time",
            ClaimValue::MonolingualText { .. } => "monolingualtext",
        }
    }

    /// The `value` member of a Wikibase datavalue.
    pub fn to_wire(&self) -> Value {
        match self {
            ClaimValue::String(s) | ClaimValue::Other(s) => Value::String(s.clone()),
            ClaimValue::Item(id) => json!({ "entity-type": "item", "id": id }),
            ClaimValue::Quantity { amount, unit } => json!({
                "amount": signed_amount(amount),
                "unit": unit,
            }),
            ClaimValue::Time { time, precision } => json!({
                "time": time,
                "timezone": 0,
                "before": 0,
                "after": 0,
                "precision": precision,
                "calendarmodel": GREGORIAN_CALENDAR,
            }),
            ClaimValue::MonolingualText { text, language } => {
                json!({ "text": text, "language": language })
            }
        }
    }

    /// Parse a Wikibase datavalue (`{"type": ..., "value": ...}`).
    pub fn from_datavalue(datavalue: &Value) -> Option<ClaimValue> {
        let kind = datavalue.get("type")?.as_str()?;
        let value = datavalue.get("value")?;
        match kind {
            "string" => Some(ClaimValue::String(value.as_str()?.to_string())),
            "wikibase-entityid" => {
                if let Some(id) = value.get("id").and_then(Value::as_str) {
                    return Some(ClaimValue::Item(id.to_string()));
                }
                let numeric = value.get("numeric-id")?.as_u64()?;
                Some(ClaimValue::Item(format!("Q{}", numeric)))
            }
            "quantity" => Some(ClaimValue::Quantity {
                amount: value.get("amount")?.as_str()?.to_string(),
                unit: value
                    .get("unit")
                    .and_then(Value::as_str)
                    .unwrap_or("1")
                    .to_string(),
            }),
            "time" => Some(ClaimValue::Time {
                time: value.get("time")?.as_str()?.to_string(),
                precision: value
                    .get("precision")
                    .and_then(Value::as_u64)
                    .unwrap_or(PRECISION_DAY as u64) as u8,
            }),
            "monolingualtext" => Some(ClaimValue::MonolingualText {
                text: value.get("text")?.as_str()?.to_string(),
                language: value.get("language")?.as_str()?.to_string(),
            }),
            other => Some(ClaimValue::Other(other.to_string())),
        }
    }
}

impl std::fmt::Display for ClaimValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimValue::String(s) | ClaimValue::Other(s) => write!(f, "{}", s),
            ClaimValue::Item(id) => write!(f, "{}", id),
            ClaimValue::Quantity { amount, unit } if normalize_unit(unit).is_empty() => {
                write!(f, "{}", amount)
            }
            ClaimValue::Quantity { amount, unit } => write!(f, "{} {}", amount, normalize_unit(unit)),
            ClaimValue::Time { time, .. } => write!(f, "{}", time),
            ClaimValue::MonolingualText { text, language } => write!(f, "{}@{}", text, language),
        }
    }
}

fn parse_amount(amount: &str) -> Option<f64> {
    let trimmed = amount.trim();
    let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if let Ok(n) = unsigned.parse::<i128>() {
        return Some(n as f64);
    }
    unsigned.parse::<f64>().ok()
}

fn signed_amount(amount: &str) -> String {
    let trimmed = amount.trim();
    if trimmed.starts_with('+') || trimmed.starts_with('-') {
        trimmed.to_string()
    } else {
        format!("+{}", trimmed)
    }
}

/// `1` and the empty string both mean unitless; entity URIs reduce to
/// their id so `http://x/entity/Q11573` equals `Q11573`.
fn normalize_unit(unit: &str) -> &str {
    let unit = unit.trim();
    if unit.is_empty() || unit == "1" {
        return "";
    }
    unit.rsplit('/').next().unwrap_or(unit)
}

/// A property/value pair used as a qualifier or inside a reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Snak {
    pub property: String,
    pub value: ClaimValue,
}

impl Snak {
    pub fn new(property: impl Into<String>, value: ClaimValue) -> Self {
        Self {
            property: property.into(),
            value,
        }
    }

    pub fn to_wire(&self) -> Value {
        json!({
            "snaktype": "value",
            "property": self.property,
            "datavalue": { "type": self.value.wire_type(), "value": self.value.to_wire() },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reference {
    pub snaks: Vec<Snak>,
}

impl Reference {
    pub fn url(property: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            snaks: vec![Snak::new(property, ClaimValue::String(url.into()))],
        }
    }

    /// Same snaks, in any order, with values compared by meaning.
    pub fn matches(&self, other: &Reference) -> bool {
        self.snaks.len() == other.snaks.len()
            && self.snaks.iter().all(|snak| {
                other
                    .snaks
                    .iter()
                    .any(|o| o.property == snak.property && o.value.matches(&snak.value))
            })
    }

    /// The `snaks` object accepted by `wbsetreference`.
    pub fn snaks_wire(&self) -> Value {
        snaks_by_property(&self.snaks)
    }
}

fn snaks_by_property(snaks: &[Snak]) -> Value {
    let mut grouped: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
    for snak in snaks {
        grouped.entry(snak.property.as_str()).or_default().push(snak.to_wire());
    }
    json!(grouped)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub guid: String,
    pub property: String,
    pub value: ClaimValue,
    pub qualifiers: Vec<Snak>,
    pub references: Vec<Reference>,
}

/// Snapshot of one record. Only valid at the moment it was read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entity {
    pub id: String,
    pub labels: BTreeMap<String, String>,
    pub descriptions: BTreeMap<String, String>,
    pub aliases: BTreeMap<String, Vec<String>>,
    pub claims: BTreeMap<String, Vec<Claim>>,
}

impl Entity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Claims for a property, in store order.
    pub fn claims_for(&self, property: &str) -> &[Claim] {
        self.claims.get(property).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn label(&self, language: &str) -> Option<&str> {
        self.labels.get(language).map(String::as_str)
    }

    /// Parse one entity from a `wbgetentities` response body.
    pub fn from_wbgetentities(body: &Value, id: &str) -> Result<Entity, StoreError> {
        let entities = body
            .get("entities")
            .and_then(Value::as_object)
            .ok_or_else(|| StoreError::Malformed("missing 'entities' in response".to_string()))?;
        let raw = entities
            .get(id)
            .or_else(|| entities.values().next())
            .ok_or_else(|| StoreError::EntityNotFound(id.to_string()))?;
        if raw.get("missing").is_some() {
            return Err(StoreError::EntityNotFound(id.to_string()));
        }
        let wire: WireEntity = serde_json::from_value(raw.clone())
            .map_err(|e| StoreError::Malformed(format!("entity {}: {}", id, e)))?;
        Ok(wire.into_entity())
    }
}

// ---------------------------------------------------------------------------
// Wire shapes (wbgetentities)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct WireTerm {
    value: String,
}

#[derive(Deserialize)]
struct WireSnak {
    #[serde(default)]
    snaktype: String,
    property: String,
    #[serde(default)]
    datavalue: Option<Value>,
}

impl WireSnak {
    fn into_snak(self) -> Snak {
        let value = match (&self.datavalue, self.snaktype.as_str()) {
            (Some(dv), _) => ClaimValue::from_datavalue(dv)
                .unwrap_or_else(|| ClaimValue::Other("unparsed".to_string())),
            (None, kind) => ClaimValue::Other(kind.to_string()),
        };
        Snak {
            property: self.property,
            value,
        }
    }
}

#[derive(Deserialize)]
struct WireReference {
    #[serde(default)]
    snaks: BTreeMap<String, Vec<WireSnak>>,
}

#[derive(Deserialize)]
struct WireStatement {
    id: String,
    mainsnak: WireSnak,
    #[serde(default)]
    qualifiers: BTreeMap<String, Vec<WireSnak>>,
    #[serde(default)]
    references: Vec<WireReference>,
}

// Wikibase serializes empty term maps as `[]`, so terms and claims are
// read through `Value` and tolerated in either shape.
#[derive(Deserialize)]
struct WireEntity {
    id: String,
    #[serde(default)]
    labels: Value,
    #[serde(default)]
    descriptions: Value,
    #[serde(default)]
    aliases: Value,
    #[serde(default)]
    claims: Value,
}

impl WireEntity {
    fn into_entity(self) -> Entity {
        let terms = |v: Value| -> BTreeMap<String, String> {
            serde_json::from_value::<BTreeMap<String, WireTerm>>(v)
                .map(|m| m.into_iter().map(|(lang, t)| (lang, t.value)).collect())
                .unwrap_or_default()
        };

        let aliases = serde_json::from_value::<BTreeMap<String, Vec<WireTerm>>>(self.aliases)
            .map(|m| {
                m.into_iter()
                    .map(|(lang, ts)| (lang, ts.into_iter().map(|t| t.value).collect()))
                    .collect()
            })
            .unwrap_or_default();

        let statements =
            serde_json::from_value::<BTreeMap<String, Vec<WireStatement>>>(self.claims)
                .unwrap_or_default();

        let claims = statements
            .into_iter()
            .map(|(property, list)| {
                let claims = list
                    .into_iter()
                    .map(|st| Claim {
                        guid: st.id,
                        property: property.clone(),
                        value: st.mainsnak.into_snak().value,
                        qualifiers: st
                            .qualifiers
                            .into_values()
                            .flatten()
                            .map(WireSnak::into_snak)
                            .collect(),
                        references: st
                            .references
                            .into_iter()
                            .map(|r| Reference {
                                snaks: r.snaks.into_values().flatten().map(WireSnak::into_snak).collect(),
                            })
                            .collect(),
                    })
                    .collect();
                (property, claims)
            })
            .collect();

        Entity {
            id: self.id,
            labels: terms(self.labels),
            descriptions: terms(self.descriptions),
            aliases,
            claims,
        }
    }
}
