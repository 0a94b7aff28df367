//! Participant registry: the authoritative roster scans refer to.
//!
//! The roster is bulk-imported once (JSON array exported from the ID-card
//! spreadsheet) and then only read. Capture resolves the scanned QR string to a
//! [`Subject`] here before any event is created.

use std::{collections::HashMap, path::Path};

use schema::{ContactInfo, MedicalInfo, Subject, qr_token_for_badge, subject_id_for_badge};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

const QR_TOKEN_PREFIX: &str = "PALITANA_YATRA_";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("subject not found for token '{0}'")]
    SubjectNotFound(String),
    #[error("duplicate badge number {0} in roster")]
    DuplicateBadge(u32),
    #[error("duplicate subject id {0} in roster")]
    DuplicateSubject(Uuid),
    #[error("roster io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("roster parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Lookup surface consumed by the capture path and the ingestion boundary.
pub trait SubjectRegistry: Send + Sync {
    fn resolve_subject_by_token(&self, token: &str) -> Result<Subject, RegistryError>;
    fn subject(&self, subject_id: &Uuid) -> Option<Subject>;
    fn contains(&self, subject_id: &Uuid) -> bool {
        self.subject(subject_id).is_some()
    }
}

/// Row shape of the participants roster export.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    #[serde(default)]
    pub uuid: Option<Uuid>,
    pub name: String,
    pub badge_number: u32,
    #[serde(default)]
    pub qr_token: Option<String>,
    #[serde(default)]
    pub mobile: Option<String>,
    #[serde(default)]
    pub emergency_contact: Option<String>,
    #[serde(default)]
    pub photo_uri: Option<String>,
    #[serde(default)]
    pub blood_group: Option<String>,
    #[serde(default)]
    pub age: Option<u16>,
}

impl RosterEntry {
    pub fn into_subject(self) -> Subject {
        let badge_number = self.badge_number;
        Subject {
            id: self
                .uuid
                .unwrap_or_else(|| subject_id_for_badge(badge_number)),
            display_name: self.name.trim().to_string(),
            badge_number,
            qr_token: self
                .qr_token
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty())
                .unwrap_or_else(|| qr_token_for_badge(badge_number)),
            contact_info: ContactInfo {
                mobile: non_blank(self.mobile),
                emergency_contact: non_blank(self.emergency_contact),
            },
            medical_info: MedicalInfo {
                blood_group: non_blank(self.blood_group),
                age: self.age,
            },
            photo_uri: non_blank(self.photo_uri),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    subjects: HashMap<Uuid, Subject>,
    by_token: HashMap<String, Uuid>,
    by_badge: HashMap<u32, Uuid>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_subjects(subjects: Vec<Subject>) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for subject in subjects {
            registry.insert(subject)?;
        }
        Ok(registry)
    }

    pub fn from_roster_json(raw: &str) -> Result<Self, RegistryError> {
        let entries: Vec<RosterEntry> = serde_json::from_str(raw)?;
        Self::from_subjects(entries.into_iter().map(RosterEntry::into_subject).collect())
    }

    pub fn load_roster_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let registry = Self::from_roster_json(&raw)?;
        debug!(
            path = %path.as_ref().display(),
            subjects = registry.len(),
            "loaded participant roster"
        );
        Ok(registry)
    }

    pub fn insert(&mut self, subject: Subject) -> Result<(), RegistryError> {
        if self.subjects.contains_key(&subject.id) {
            return Err(RegistryError::DuplicateSubject(subject.id));
        }
        if self.by_badge.contains_key(&subject.badge_number) {
            return Err(RegistryError::DuplicateBadge(subject.badge_number));
        }
        let token_key = normalize_token(&subject.qr_token);
        if let Some(previous) = self.by_token.insert(token_key, subject.id) {
            warn!(
                token = %subject.qr_token,
                previous = %previous,
                replacement = %subject.id,
                "qr token shared by two subjects; last import wins"
            );
        }
        self.by_badge.insert(subject.badge_number, subject.id);
        self.subjects.insert(subject.id, subject);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    pub fn subjects(&self) -> impl Iterator<Item = &Subject> {
        self.subjects.values()
    }

    pub fn by_badge(&self, badge_number: u32) -> Option<&Subject> {
        self.by_badge
            .get(&badge_number)
            .and_then(|id| self.subjects.get(id))
    }
}

impl SubjectRegistry for InMemoryRegistry {
    fn resolve_subject_by_token(&self, token: &str) -> Result<Subject, RegistryError> {
        let key = normalize_token(token);
        if let Some(subject) = self
            .by_token
            .get(&key)
            .and_then(|id| self.subjects.get(id))
        {
            return Ok(subject.clone());
        }
        // Hand-typed badge numbers: "17", "#17", or a QR prefix with a padded number.
        let badge = key
            .strip_prefix(QR_TOKEN_PREFIX)
            .or_else(|| key.strip_prefix('#'))
            .unwrap_or(&key);
        if let Ok(badge_number) = badge.parse::<u32>()
            && let Some(subject) = self.by_badge(badge_number)
        {
            return Ok(subject.clone());
        }
        if let Ok(subject_id) = Uuid::parse_str(&key)
            && let Some(subject) = self.subjects.get(&subject_id)
        {
            return Ok(subject.clone());
        }
        Err(RegistryError::SubjectNotFound(token.to_string()))
    }

    fn subject(&self, subject_id: &Uuid) -> Option<Subject> {
        self.subjects.get(subject_id).cloned()
    }

    fn contains(&self, subject_id: &Uuid) -> bool {
        self.subjects.contains_key(subject_id)
    }
}

fn normalize_token(token: &str) -> String {
    token.trim().to_ascii_uppercase()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ROSTER: &str = r#"[
      {
        "uuid": "6f9a3c1e-2b7d-4f7a-9a0e-3c2b1d4e5f60",
        "name": " Asha Shah ",
        "mobile": "9800000001",
        "qrToken": "PALITANA_YATRA_1",
        "emergencyContact": "9800000001",
        "photoUri": null,
        "bloodGroup": "B+",
        "age": 54,
        "badgeNumber": 1
      },
      {
        "name": "Mehul Doshi",
        "badgeNumber": 27,
        "bloodGroup": "  "
      }
    ]"#;

    #[test]
    fn imports_roster_and_resolves_qr_token() {
        let registry = InMemoryRegistry::from_roster_json(ROSTER).unwrap();
        assert_eq!(registry.len(), 2);

        let subject = registry
            .resolve_subject_by_token("PALITANA_YATRA_1")
            .unwrap();
        assert_eq!(subject.display_name, "Asha Shah");
        assert_eq!(subject.medical_info.blood_group.as_deref(), Some("B+"));
        assert_eq!(subject.medical_info.age, Some(54));
        assert_eq!(subject.photo_uri, None);
    }

    #[test]
    fn missing_uuid_and_token_fall_back_to_badge_derivation() {
        let registry = InMemoryRegistry::from_roster_json(ROSTER).unwrap();
        let subject = registry.by_badge(27).unwrap();
        assert_eq!(subject.id, subject_id_for_badge(27));
        assert_eq!(subject.qr_token, "PALITANA_YATRA_27");
        assert_eq!(subject.medical_info.blood_group, None);
    }

    #[test]
    fn resolves_hand_typed_badge_numbers() {
        let registry = InMemoryRegistry::from_roster_json(ROSTER).unwrap();
        for token in ["27", "#27", " palitana_yatra_27 ", "PALITANA_YATRA_027"] {
            let subject = registry.resolve_subject_by_token(token).unwrap();
            assert_eq!(subject.badge_number, 27, "token {token}");
        }
    }

    #[test]
    fn unknown_token_is_subject_not_found() {
        let registry = InMemoryRegistry::from_roster_json(ROSTER).unwrap();
        let err = registry
            .resolve_subject_by_token("PALITANA_YATRA_999")
            .unwrap_err();
        assert!(matches!(err, RegistryError::SubjectNotFound(token) if token == "PALITANA_YATRA_999"));
    }

    #[test]
    fn duplicate_badge_is_rejected() {
        let raw = r#"[{"name":"A","badgeNumber":5,"uuid":"6f9a3c1e-2b7d-4f7a-9a0e-3c2b1d4e5f61"},
                      {"name":"B","badgeNumber":5}]"#;
        let err = InMemoryRegistry::from_roster_json(raw).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateBadge(5)));
    }

    #[test]
    fn loads_roster_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ROSTER.as_bytes()).unwrap();
        let registry = InMemoryRegistry::load_roster_file(file.path()).unwrap();
        assert!(registry.contains(&subject_id_for_badge(27)));
    }
}
