//! Record fingerprinting.
//!
//! A fingerprint is the SHA-256 of a record's field values in field-name
//! order. Values are hashed in their JSON form, so a number that becomes a
//! string changes the hash. Binary fields are left out and reported.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{MirrorError, MirrorResult};
use crate::record::{value_text, FieldMap};

/// Separator between key field values in a composite record key.
pub const KEY_SEPARATOR: &str = "|";

/// Computes stable content hashes for remote records.
#[derive(Debug, Clone, Default)]
pub struct Fingerprinter {
    excluded: BTreeSet<String>,
}

impl Fingerprinter {
    /// Create a fingerprinter that ignores the given binary fields.
    #[must_use]
    pub fn new<I, S>(binary_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            excluded: binary_fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Fields left out of the hash, sorted.
    #[must_use]
    pub fn excluded_binary_fields(&self) -> Vec<String> {
        self.excluded.iter().cloned().collect()
    }

    /// Whether a field is excluded from hashing.
    #[must_use]
    pub fn is_excluded(&self, field: &str) -> bool {
        self.excluded.contains(field)
    }

    /// Compute the fingerprint of a record.
    #[must_use]
    pub fn fingerprint(&self, fields: &FieldMap) -> String {
        let ordered: BTreeMap<&str, &serde_json::Value> = fields
            .iter()
            .filter(|(name, _)| !self.excluded.contains(name.as_str()))
            .map(|(name, value)| (name.as_str(), value))
            .collect();

        let mut hasher = Sha256::new();
        for (name, value) in ordered {
            // Length-prefixed name, then the typed JSON encoding of the value.
            hasher.update((name.len() as u64).to_be_bytes());
            hasher.update(name.as_bytes());
            let encoded = value.to_string();
            hasher.update((encoded.len() as u64).to_be_bytes());
            hasher.update(encoded.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Build the record key from the table's key fields.
pub fn record_key(fields: &FieldMap, key_fields: &[String]) -> MirrorResult<String> {
    let mut parts = Vec::with_capacity(key_fields.len());
    for field in key_fields {
        let value = fields.get(field).ok_or_else(|| {
            MirrorError::row_transform(None, format!("missing key field '{field}'"))
        })?;
        if value.is_null() || value.is_object() || value.is_array() {
            return Err(MirrorError::row_transform(
                None,
                format!("key field '{field}' must be a scalar value"),
            ));
        }
        let part = value_text(value).trim().to_string();
        if part.is_empty() {
            return Err(MirrorError::row_transform(
                None,
                format!("key field '{field}' is empty"),
            ));
        }
        parts.push(part);
    }
    Ok(parts.join(KEY_SEPARATOR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> FieldMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let fp = Fingerprinter::default();
        let record = fields(json!({"A2_COD": "000001", "A2_NOME": "ACME", "A2_LOJA": "01"}));

        let first = fp.fingerprint(&record);
        let second = fp.fingerprint(&record);
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn test_fingerprint_detects_value_change() {
        let fp = Fingerprinter::default();
        let before = fields(json!({"A2_COD": "000001", "A2_NOME": "ACME"}));
        let after = fields(json!({"A2_COD": "000001", "A2_NOME": "ACME LTDA"}));
        assert_ne!(fp.fingerprint(&before), fp.fingerprint(&after));
    }

    #[test]
    fn test_fingerprint_detects_type_coercion() {
        let fp = Fingerprinter::default();
        let number = fields(json!({"A2_COD": "000001", "A2_SALDO": 10}));
        let text = fields(json!({"A2_COD": "000001", "A2_SALDO": "10"}));
        assert_ne!(fp.fingerprint(&number), fp.fingerprint(&text));
    }

    #[test]
    fn test_fingerprint_field_boundaries() {
        let fp = Fingerprinter::default();
        let a = fields(json!({"AB": "C"}));
        let b = fields(json!({"A": "BC"}));
        assert_ne!(fp.fingerprint(&a), fp.fingerprint(&b));
    }

    #[test]
    fn test_binary_fields_excluded() {
        let fp = Fingerprinter::new(["A2_FOTO"]);
        let one = fields(json!({"A2_COD": "000001", "A2_FOTO": "iVBORw0KGgo="}));
        let two = fields(json!({"A2_COD": "000001", "A2_FOTO": "R0lGODlhAQAB"}));

        assert_eq!(fp.fingerprint(&one), fp.fingerprint(&two));
        assert_eq!(fp.excluded_binary_fields(), vec!["A2_FOTO".to_string()]);
        assert!(fp.is_excluded("A2_FOTO"));
    }

    #[test]
    fn test_record_key_composite() {
        let record = fields(json!({"A1_FILIAL": "01  ", "A1_COD": "000123", "A1_LOJA": 1}));
        let key = record_key(
            &record,
            &["A1_FILIAL".to_string(), "A1_COD".to_string(), "A1_LOJA".to_string()],
        )
        .unwrap();
        assert_eq!(key, "01|000123|1");
    }

    #[test]
    fn test_record_key_missing_field() {
        let record = fields(json!({"A1_COD": "000123"}));
        let err = record_key(&record, &["R_E_C_N_O_".to_string()]).unwrap_err();
        assert!(err.is_row_level());

        let record = fields(json!({"R_E_C_N_O_": null}));
        assert!(record_key(&record, &["R_E_C_N_O_".to_string()]).is_err());

        let record = fields(json!({"R_E_C_N_O_": "   "}));
        assert!(record_key(&record, &["R_E_C_N_O_".to_string()]).is_err());
    }
}
