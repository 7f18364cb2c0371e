//! Incident classification: a closed set of types grouped into taxonomies.

use serde_json::Value;

use super::{HarmonizationType, trimmed_str};
use crate::error::SanitizeError;

/// Every classification type with the taxonomy it belongs to.
const TYPES: &[(&str, &str)] = &[
    ("spam", "abusive-content"),
    ("harmful-speech", "abusive-content"),
    ("violence", "abusive-content"),
    ("infected-system", "malicious-code"),
    ("c2-server", "malicious-code"),
    ("malware-distribution", "malicious-code"),
    ("malware-configuration", "malicious-code"),
    ("scanner", "information-gathering"),
    ("sniffing", "information-gathering"),
    ("social-engineering", "information-gathering"),
    ("ids-alert", "intrusion-attempts"),
    ("brute-force", "intrusion-attempts"),
    ("exploit", "intrusion-attempts"),
    ("privileged-account-compromise", "intrusions"),
    ("unprivileged-account-compromise", "intrusions"),
    ("application-compromise", "intrusions"),
    ("system-compromise", "intrusions"),
    ("burglary", "intrusions"),
    ("ddos", "availability"),
    ("dos", "availability"),
    ("outage", "availability"),
    ("sabotage", "availability"),
    ("unauthorised-information-access", "information-content-security"),
    ("unauthorised-information-modification", "information-content-security"),
    ("data-loss", "information-content-security"),
    ("data-leak", "information-content-security"),
    ("unauthorized-use-of-resources", "fraud"),
    ("copyright", "fraud"),
    ("masquerade", "fraud"),
    ("phishing", "fraud"),
    ("weak-crypto", "vulnerable"),
    ("ddos-amplifier", "vulnerable"),
    ("potentially-unwanted-accessible", "vulnerable"),
    ("information-disclosure", "vulnerable"),
    ("vulnerable-system", "vulnerable"),
    ("blacklist", "other"),
    ("dga-domain", "other"),
    ("malware", "other"),
    ("tor", "other"),
    ("proxy", "other"),
    ("other", "other"),
    ("unknown", "other"),
    ("undetermined", "other"),
    ("test", "test"),
];

/// Names used by older feeds, mapped to their current type.
const LEGACY_TYPES: &[(&str, &str)] = &[
    ("botnet drone", "infected-system"),
    ("ransomware", "infected-system"),
    ("c&c", "c2-server"),
    ("malware configuration", "malware-configuration"),
    ("ids alert", "ids-alert"),
    ("compromised", "system-compromise"),
    ("backdoor", "system-compromise"),
    ("unauthorized-command", "system-compromise"),
    ("unauthorized-login", "system-compromise"),
    ("defacement", "unauthorised-information-modification"),
    ("leak", "data-leak"),
    ("dropzone", "other"),
    ("vulnerable service", "vulnerable-system"),
    ("vulnerable client", "vulnerable-system"),
];

const LEGACY_TAXONOMIES: &[(&str, &str)] = &[
    ("abusive content", "abusive-content"),
    ("malicious code", "malicious-code"),
    ("information gathering", "information-gathering"),
    ("intrusion attempts", "intrusion-attempts"),
    ("information content security", "information-content-security"),
    ("vulnerable service", "vulnerable"),
];

fn legacy(table: &[(&str, &'static str)], name: &str) -> Option<&'static str> {
    table.iter().find(|(old, _)| *old == name).map(|(_, new)| *new)
}

/// Incident types (`malware`, `phishing`, `c2-server`, ...).
pub struct ClassificationType;

impl ClassificationType {
    /// All accepted type names.
    pub fn allowed_values() -> impl Iterator<Item = &'static str> {
        TYPES.iter().map(|(ty, _)| *ty)
    }

    /// Taxonomy a classification type belongs to.
    pub fn taxonomy_for(type_name: &str) -> Option<&'static str> {
        TYPES
            .iter()
            .find(|(ty, _)| *ty == type_name)
            .map(|(_, taxonomy)| *taxonomy)
    }
}

impl HarmonizationType for ClassificationType {
    fn type_name(&self) -> &str {
        "ClassificationType"
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        let name = trimmed_str(value)
            .ok_or_else(|| SanitizeError::new(self.type_name(), value, "expected a string"))?
            .to_lowercase();
        if let Some((ty, _)) = TYPES.iter().find(|(ty, _)| *ty == name) {
            return Ok(Value::from(*ty));
        }
        legacy(LEGACY_TYPES, &name)
            .map(Value::from)
            .ok_or_else(|| SanitizeError::new(self.type_name(), value, "unknown classification type"))
    }
}

/// Taxonomies grouping the classification types.
pub struct ClassificationTaxonomy;

impl ClassificationTaxonomy {
    /// All accepted taxonomy names.
    pub fn allowed_values() -> Vec<&'static str> {
        let mut values: Vec<&str> = TYPES.iter().map(|(_, taxonomy)| *taxonomy).collect();
        values.dedup();
        values
    }
}

impl HarmonizationType for ClassificationTaxonomy {
    fn type_name(&self) -> &str {
        "ClassificationTaxonomy"
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        let name = trimmed_str(value)
            .ok_or_else(|| SanitizeError::new(self.type_name(), value, "expected a string"))?
            .to_lowercase();
        if let Some(taxonomy) = Self::allowed_values().into_iter().find(|t| *t == name) {
            return Ok(Value::from(taxonomy));
        }
        legacy(LEGACY_TAXONOMIES, &name)
            .map(Value::from)
            .ok_or_else(|| SanitizeError::new(self.type_name(), value, "unknown taxonomy"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn types_are_lowercased_and_checked() {
        assert_eq!(ClassificationType.sanitize(&json!(" Phishing ")).unwrap(), json!("phishing"));
        assert!(ClassificationType.sanitize(&json!("cute-kittens")).is_err());
        assert!(ClassificationType.is_valid(&json!("malware")));
        assert!(!ClassificationType.is_valid(&json!("Malware")));
    }

    #[test]
    fn legacy_names_are_mapped() {
        assert_eq!(ClassificationType.sanitize(&json!("C&C")).unwrap(), json!("c2-server"));
        assert_eq!(
            ClassificationType.sanitize(&json!("botnet drone")).unwrap(),
            json!("infected-system")
        );
        assert_eq!(
            ClassificationTaxonomy.sanitize(&json!("Malicious Code")).unwrap(),
            json!("malicious-code")
        );
    }

    #[test]
    fn every_type_has_a_known_taxonomy() {
        let taxonomies = ClassificationTaxonomy::allowed_values();
        for ty in ClassificationType::allowed_values() {
            let taxonomy = ClassificationType::taxonomy_for(ty).unwrap();
            assert!(taxonomies.contains(&taxonomy), "{ty} -> {taxonomy}");
        }
        assert_eq!(ClassificationType::taxonomy_for("c2-server"), Some("malicious-code"));
        assert_eq!(ClassificationType::taxonomy_for("nope"), None);
    }

    #[test]
    fn legacy_targets_are_current_types() {
        for (old, new) in LEGACY_TYPES {
            assert!(
                ClassificationType::taxonomy_for(new).is_some(),
                "{old} maps to unknown {new}"
            );
        }
    }
}
