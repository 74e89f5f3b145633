// src/extraction/extractor.rs

use log::debug;
use serde_json::Value;

use crate::config::{FieldMap, SourceConfig};
use crate::extraction::normalize::{
    extract_unit, normalize_address, normalize_email, normalize_microchip, normalize_name,
    normalize_phone, normalize_unit,
};
use crate::models::{
    AlteredStatus, EntityDetails, EntityKind, Identifier, IdentifierKind, RelationshipKind,
    StagedRecord,
};

/// A field that was present but unusable. The rest of the record is still used.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionIssue {
    pub field: String,
    pub raw: String,
    pub message: String,
}

/// A linked entity described inside the same staged row.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRelated {
    pub relationship: RelationshipKind,
    pub role: Option<String>,
    pub create_if_missing: bool,
    pub record: ExtractedRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRecord {
    pub kind: EntityKind,
    /// Normalized, de-duplicated strong identifiers.
    pub identifiers: Vec<Identifier>,
    /// Display label as observed, whitespace collapsed.
    pub name: Option<String>,
    pub normalized_name: Option<String>,
    pub address: Option<String>,
    /// Canonical `unit <value>` form.
    pub unit: Option<String>,
    pub details: EntityDetails,
    pub related: Vec<ExtractedRelated>,
    pub issues: Vec<ExtractionIssue>,
}

impl ExtractedRecord {
    fn empty(kind: EntityKind) -> Self {
        Self {
            kind,
            identifiers: Vec::new(),
            name: None,
            normalized_name: None,
            address: None,
            unit: None,
            details: EntityDetails::empty(kind),
            related: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn identifiers_of(&self, kind: IdentifierKind) -> impl Iterator<Item = &Identifier> {
        self.identifiers.iter().filter(move |i| i.kind == kind)
    }

    pub fn has_identifiers(&self) -> bool {
        !self.identifiers.is_empty()
    }

    /// Issues from this record and every related block.
    pub fn issue_count(&self) -> usize {
        self.issues.len()
            + self
                .related
                .iter()
                .map(|r| r.record.issue_count())
                .sum::<usize>()
    }
}

/// Normalized comparison form of a label. Places compare as addresses.
pub fn normalize_label(kind: EntityKind, label: &str) -> String {
    match kind {
        EntityKind::Place => normalize_address(label),
        EntityKind::Person | EntityKind::Cat => normalize_name(label),
    }
}

/// Applies a source's field map to a staged record. Never fails: unusable
/// fields become issues and are skipped.
pub fn extract(record: &StagedRecord, source: &SourceConfig) -> ExtractedRecord {
    let mut extracted = extract_fields(&record.payload, source.entity_kind, &source.fields);
    for related in &source.related {
        let mut block = extract_fields(&record.payload, related.entity_kind, &related.fields);
        if block.identifiers.is_empty() && block.name.is_none() {
            // Block columns all empty; nothing to link.
            extracted.issues.append(&mut block.issues);
            continue;
        }
        extracted.related.push(ExtractedRelated {
            relationship: related.relationship,
            role: related.role.clone(),
            create_if_missing: related.create_if_missing,
            record: block,
        });
    }
    debug!(
        "Extracted {} identifier(s), {} related block(s), {} issue(s) from {}:{}",
        extracted.identifiers.len(),
        extracted.related.len(),
        extracted.issue_count(),
        record.source_system,
        record.source_row_id
    );
    extracted
}

pub fn extract_fields(payload: &Value, kind: EntityKind, fields: &FieldMap) -> ExtractedRecord {
    let mut out = ExtractedRecord::empty(kind);

    if let Some(raw) = read_field(payload, fields.email.as_deref(), &mut out.issues) {
        match normalize_email(&raw) {
            Some(email) => out.identifiers.push(Identifier::new(IdentifierKind::Email, email)),
            None => out.issue(fields.email.as_deref(), raw, "not a usable email address"),
        }
    }
    for key in &fields.phone {
        if let Some(raw) = read_field(payload, Some(key), &mut out.issues) {
            match normalize_phone(&raw) {
                Some(phone) => out.identifiers.push(Identifier::new(IdentifierKind::Phone, phone)),
                None => out.issue(Some(key), raw, "phone number has an invalid digit count"),
            }
        }
    }
    if let Some(raw) = read_field(payload, fields.microchip.as_deref(), &mut out.issues) {
        match normalize_microchip(&raw) {
            Some(chip) => out
                .identifiers
                .push(Identifier::new(IdentifierKind::Microchip, chip)),
            None => out.issue(fields.microchip.as_deref(), raw, "microchip must be 9, 10 or 15 digits"),
        }
    }
    if let Some(raw) = read_field(payload, fields.geocode_key.as_deref(), &mut out.issues) {
        let key = raw.trim().to_lowercase();
        out.identifiers
            .push(Identifier::new(IdentifierKind::ExternalGeocodeKey, key));
    }

    let first_name = read_field(payload, fields.first_name.as_deref(), &mut out.issues);
    let last_name = read_field(payload, fields.last_name.as_deref(), &mut out.issues);
    let address = read_field(payload, fields.address.as_deref(), &mut out.issues);
    let explicit_unit = read_field(payload, fields.unit.as_deref(), &mut out.issues);

    let mut name = read_field(payload, fields.name.as_deref(), &mut out.issues);
    if name.is_none() && (first_name.is_some() || last_name.is_some()) {
        let joined = [first_name.as_deref(), last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        name = Some(joined);
    }
    if kind == EntityKind::Place && name.is_none() {
        name = address.clone();
    }

    out.unit = match explicit_unit {
        Some(raw) => normalize_unit(&raw),
        None => address.as_deref().and_then(extract_unit),
    };

    out.details = match kind {
        EntityKind::Person => EntityDetails::Person {
            first_name: first_name.clone(),
            last_name: last_name.clone(),
        },
        EntityKind::Place => EntityDetails::Place {
            formatted_address: address.clone(),
            unit: out.unit.clone(),
            latitude: None,
            longitude: None,
        },
        EntityKind::Cat => {
            let altered_status = match read_field(payload, fields.altered_status.as_deref(), &mut out.issues) {
                Some(raw) => AlteredStatus::parse(&raw).unwrap_or_else(|| {
                    out.issue(fields.altered_status.as_deref(), raw, "unrecognized alteration status");
                    AlteredStatus::Unknown
                }),
                None => AlteredStatus::Unknown,
            };
            let sex = read_field(payload, fields.sex.as_deref(), &mut out.issues).map(|s| normalize_sex(&s));
            let primary_color = read_field(payload, fields.color.as_deref(), &mut out.issues)
                .map(|c| c.to_lowercase());
            EntityDetails::Cat {
                altered_status,
                sex,
                primary_color,
            }
        }
    };

    out.address = address;
    if let Some(label) = name {
        let normalized = normalize_label(kind, &label);
        if !normalized.is_empty() {
            out.normalized_name = Some(normalized);
            out.name = Some(label);
        }
    }

    out.identifiers.sort();
    out.identifiers.dedup();
    out
}

impl ExtractedRecord {
    fn issue(&mut self, field: Option<&str>, raw: String, message: &str) {
        self.issues.push(ExtractionIssue {
            field: field.unwrap_or_default().to_string(),
            raw,
            message: message.to_string(),
        });
    }
}

fn normalize_sex(raw: &str) -> String {
    match raw.trim().to_lowercase().as_str() {
        "m" | "male" | "neutered male" | "mn" => "male".to_string(),
        "f" | "female" | "spayed female" | "fs" => "female".to_string(),
        other => other.to_string(),
    }
}

/// Reads one payload field as text. Keys starting with `/` are JSON pointers
/// into nested payloads. Numbers are accepted (chip and phone columns are
/// often numeric); objects and arrays are issues.
fn read_field(payload: &Value, key: Option<&str>, issues: &mut Vec<ExtractionIssue>) -> Option<String> {
    let key = key?;
    let value = if key.starts_with('/') {
        payload.pointer(key)
    } else {
        payload.get(key)
    }?;
    match value {
        Value::Null => None,
        Value::String(s) => {
            let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
            if collapsed.is_empty() {
                None
            } else {
                Some(collapsed)
            }
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(_) | Value::Object(_) => {
            issues.push(ExtractionIssue {
                field: key.to_string(),
                raw: value.to_string(),
                message: "expected a scalar value".to_string(),
            });
            None
        }
    }
}
