use crate::scanner::RawRecord;
use crate::schema::{FieldType, Grammar, GrammarField};

use super::error::DecodeError;
use super::{DecodedFields, FieldValue, RecordDecoder};

/// Decoder for line-oriented ASCII records.
#[derive(Debug, Clone, Copy)]
pub struct GrammarDecoder<'s> {
    grammar: &'s Grammar,
}

impl<'s> GrammarDecoder<'s> {
    pub fn new(grammar: &'s Grammar) -> Self {
        Self { grammar }
    }
}

impl RecordDecoder for GrammarDecoder<'_> {
    fn decode(&self, raw: &RawRecord<'_>) -> Result<Option<DecodedFields>, DecodeError> {
        let unexpected = DecodeError::UnexpectedData { offset: raw.offset };
        let line = std::str::from_utf8(raw.bytes()).map_err(|_| unexpected.clone())?;

        let Some(caps) = self.grammar.pattern.captures(line) else {
            if self
                .grammar
                .metadata
                .as_ref()
                .is_some_and(|metadata| metadata.is_match(line))
            {
                return Ok(None);
            }
            return Err(unexpected);
        };

        let mut out = DecodedFields::default();
        for field in &self.grammar.fields {
            let text = caps.name(&field.group).map(|m| m.as_str());
            let value = text
                .and_then(|text| convert(field, text))
                .ok_or_else(|| DecodeError::FieldFormat {
                    offset: raw.offset,
                    field: field.name.clone(),
                })?;
            out.push(field.name.clone(), value);
        }
        Ok(Some(out))
    }
}

fn convert(field: &GrammarField, text: &str) -> Option<FieldValue> {
    let trimmed = text.trim();
    let scaled = |value: f64| value * field.scale.unwrap_or(1.0) + field.add.unwrap_or(0.0);
    let integer = |value: i64| {
        if field.scale.is_some() || field.add.is_some() {
            FieldValue::Float(scaled(value as f64))
        } else {
            FieldValue::Int(value)
        }
    };
    match field.ty {
        FieldType::Int => trimmed.parse::<i64>().ok().map(integer),
        FieldType::HexInt => {
            let digits = trimmed
                .strip_prefix("0x")
                .or_else(|| trimmed.strip_prefix("0X"))
                .unwrap_or(trimmed);
            i64::from_str_radix(digits, 16).ok().map(integer)
        }
        FieldType::Float => trimmed
            .parse::<f64>()
            .ok()
            .map(|value| FieldValue::Float(scaled(value))),
        FieldType::Text => Some(FieldValue::Text(text.to_string())),
        FieldType::Enum => field
            .labels
            .as_ref()?
            .iter()
            .find(|label| label.as_str() == trimmed)
            .map(|label| FieldValue::Enum(label.clone())),
        _ => None,
    }
}
