//! Record decoding.
//!
//! Two families share one contract:
//! - `binary`: fixed layouts with an offset-table or sequential sub-record
//!   index and an optional trailing modular checksum.
//! - `grammar`: ASCII lines matched against a compiled regular expression
//!   with named capture groups.
//!
//! Decoders are pure: they read one framed record and either return every
//! declared field or reject the record with a `DecodeError`. Byte positions
//! live in `layout`, bounded access in `reader`.
//!
//! Version française (résumé):
//! Deux familles de décodeurs (binaire et grammaire ASCII) partagent le même
//! contrat : un enregistrement entier est accepté ou rejeté, jamais réparé.

mod binary;
pub mod checksum;
pub mod error;
mod grammar;
pub mod layout;
pub mod reader;

pub use binary::BinaryDecoder;
pub use error::DecodeError;
pub use grammar::GrammarDecoder;

use serde::Serialize;

use crate::scanner::RawRecord;
use crate::schema::Family;
use crate::timestamp::Timestamp;

/// A decoded value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Text(String),
    Enum(String),
    Timestamp(Timestamp),
    /// Arrays are always numeric; missing samples are NaN.
    Array(Vec<f64>),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(value) => Some(*value as f64),
            FieldValue::Float(value) => Some(*value),
            FieldValue::Timestamp(ts) => Some(ts.ntp_seconds()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) | FieldValue::Enum(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[f64]> {
        match self {
            FieldValue::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Equality where NaN matches NaN, used to detect repeated records.
    pub fn same_as(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Float(a), FieldValue::Float(b)) => a.to_bits() == b.to_bits(),
            (FieldValue::Array(a), FieldValue::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            _ => self == other,
        }
    }
}

/// Fields of one record in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedFields(Vec<(String, FieldValue)>);

impl DecodedFields {
    pub(crate) fn push(&mut self, name: String, value: FieldValue) {
        self.0.push((name, value));
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn same_as(&self, other: &DecodedFields) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|((a_name, a), (b_name, b))| a_name == b_name && a.same_as(b))
    }
}

pub trait RecordDecoder {
    /// Decode one framed record.
    ///
    /// `Ok(None)` marks a recognised non-data record (e.g. a metadata line)
    /// that produces no particle and no error.
    ///
    /// # Errors
    /// Returns a `DecodeError` when the record fails validation.
    fn decode(&self, raw: &RawRecord<'_>) -> Result<Option<DecodedFields>, DecodeError>;
}

/// Build the decoder for an instrument's protocol family.
pub fn decoder_for(family: &Family) -> Box<dyn RecordDecoder + Send + Sync + '_> {
    match family {
        Family::Binary(layout) => Box::new(BinaryDecoder::new(layout)),
        Family::Grammar(grammar) => Box::new(GrammarDecoder::new(grammar)),
    }
}

#[cfg(test)]
mod tests {
    use super::{DecodedFields, FieldValue};

    #[test]
    fn same_as_treats_nan_as_equal() {
        let a = FieldValue::Array(vec![1.0, f64::NAN]);
        let b = FieldValue::Array(vec![1.0, f64::NAN]);
        assert_ne!(a, b);
        assert!(a.same_as(&b));
        assert!(!a.same_as(&FieldValue::Array(vec![1.0])));
    }

    #[test]
    fn lookup_by_name() {
        let mut fields = DecodedFields::default();
        fields.push("heading".to_string(), FieldValue::Float(12.5));
        fields.push("serial".to_string(), FieldValue::Text("A1".to_string()));
        assert_eq!(fields.get("heading").and_then(FieldValue::as_f64), Some(12.5));
        assert_eq!(fields.get("serial").and_then(FieldValue::as_str), Some("A1"));
        assert_eq!(fields.names().collect::<Vec<_>>(), vec!["heading", "serial"]);
        assert!(fields.get("missing").is_none());
    }
}
