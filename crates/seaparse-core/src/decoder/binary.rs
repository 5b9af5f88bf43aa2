use std::collections::HashMap;

use tracing::debug;

use crate::scanner::RawRecord;
use crate::schema::{BinaryLayout, Count, FieldSpec, FieldType, SubRecordIndex};

use super::error::DecodeError;
use super::layout;
use super::reader::FieldReader;
use super::{DecodedFields, FieldValue, RecordDecoder};

/// Integer values decoded so far, used to resolve array counts.
type Counts<'s> = HashMap<&'s str, i64>;

/// Decoder for fixed binary layouts.
///
/// Header field offsets are relative to the record start. Block field
/// offsets are relative to the start of the sub-record (its type id for
/// offset tables, the first payload byte for sequential sub-records).
#[derive(Debug, Clone, Copy)]
pub struct BinaryDecoder<'s> {
    layout: &'s BinaryLayout,
}

impl<'s> BinaryDecoder<'s> {
    pub fn new(layout: &'s BinaryLayout) -> Self {
        Self { layout }
    }

    fn decode_blocks(
        &self,
        body: FieldReader<'_>,
        globals: &mut Counts<'s>,
        out: &mut DecodedFields,
    ) -> Result<(), DecodeError> {
        let mut occurrences: HashMap<u64, usize> = HashMap::new();
        match &self.layout.index {
            SubRecordIndex::OffsetTable {
                count_offset,
                count_width,
                table_offset,
                id_width,
            } => {
                let count = body.read_usize(*count_offset, *count_width)?;
                let mut offsets = Vec::with_capacity(count.min(body.len()));
                for idx in 0..count {
                    let entry = table_offset + idx * layout::OFFSET_ENTRY_WIDTH;
                    offsets.push(body.read_usize(entry, layout::OFFSET_ENTRY_WIDTH)?);
                }
                for (idx, &start) in offsets.iter().enumerate() {
                    let end = offsets
                        .iter()
                        .filter(|&&other| other > start)
                        .min()
                        .copied()
                        .unwrap_or(body.len());
                    let window = body.window(start..end.max(start))?;
                    let type_id = window.read_uint(0, *id_width)?;
                    debug!(index = idx, type_id, start, "sub-record");
                    self.decode_block(window, type_id, &mut occurrences, globals, out)?;
                }
            }
            SubRecordIndex::Sequential {
                start,
                count_field,
                id_width,
                length_width,
            } => {
                let count = globals.get(count_field.as_str()).copied().unwrap_or(0);
                let count = usize::try_from(count).map_err(|_| DecodeError::FieldFormat {
                    offset: body.record_offset(),
                    field: count_field.clone(),
                })?;
                let mut pos = *start;
                for _ in 0..count {
                    let type_id = body.read_uint(pos, *id_width)?;
                    let length = body.read_usize(pos + id_width, *length_width)?;
                    let payload = pos + id_width + length_width;
                    let end = payload.checked_add(length).ok_or(DecodeError::TruncatedRecord {
                        offset: body.record_offset(),
                        needed: usize::MAX,
                        actual: body.len(),
                    })?;
                    let window = body.window(payload..end)?;
                    self.decode_block(window, type_id, &mut occurrences, globals, out)?;
                    pos = end;
                }
            }
        }
        Ok(())
    }

    fn decode_block(
        &self,
        window: FieldReader<'_>,
        type_id: u64,
        occurrences: &mut HashMap<u64, usize>,
        globals: &mut Counts<'s>,
        out: &mut DecodedFields,
    ) -> Result<(), DecodeError> {
        let schema: &'s BinaryLayout = self.layout;
        let Some(block) = schema.blocks.get(&type_id) else {
            if schema.ignore_unknown {
                debug!(type_id, "skipping unknown sub-record type");
                return Ok(());
            }
            return Err(DecodeError::FieldFormat {
                offset: window.record_offset(),
                field: layout::SUB_RECORD_TYPE_FIELD.to_string(),
            });
        };
        let occurrence = occurrences.entry(type_id).or_insert(0);
        *occurrence += 1;
        let suffix = block.numbered.then(|| format!("_{occurrence}"));

        let mut locals: Counts<'s> = HashMap::new();
        for spec in &block.fields {
            let values = decode_field(window, spec, &locals, globals)?;
            record_count(spec, &values, &mut locals);
            if !block.numbered {
                record_count(spec, &values, globals);
            }
            push_values(out, values, suffix.as_deref());
        }
        Ok(())
    }
}

impl RecordDecoder for BinaryDecoder<'_> {
    fn decode(&self, raw: &RawRecord<'_>) -> Result<Option<DecodedFields>, DecodeError> {
        let layout = self.layout;
        let record = raw.bytes();
        let body_len = super::checksum::verify(&layout.checksum, record, raw.offset)?;
        let body = FieldReader::new(&record[..body_len], layout.endian, raw.offset);

        let mut out = DecodedFields::default();
        let mut globals: Counts<'_> = HashMap::new();
        for spec in &layout.header {
            let values = decode_field(body, spec, &HashMap::new(), &globals)?;
            record_count(spec, &values, &mut globals);
            push_values(&mut out, values, None);
        }
        self.decode_blocks(body, &mut globals, &mut out)?;
        Ok(Some(out))
    }
}

fn record_count<'s>(spec: &'s FieldSpec, values: &[(String, FieldValue)], counts: &mut Counts<'s>) {
    if let [(_, FieldValue::Int(value))] = values {
        counts.insert(spec.name.as_str(), *value);
    }
}

fn push_values(out: &mut DecodedFields, values: Vec<(String, FieldValue)>, suffix: Option<&str>) {
    for (name, value) in values {
        match suffix {
            Some(suffix) => out.push(format!("{name}{suffix}"), value),
            None => out.push(name, value),
        }
    }
}

fn decode_field(
    reader: FieldReader<'_>,
    spec: &FieldSpec,
    locals: &Counts<'_>,
    globals: &Counts<'_>,
) -> Result<Vec<(String, FieldValue)>, DecodeError> {
    let invalid = || DecodeError::FieldFormat {
        offset: reader.record_offset(),
        field: spec.name.clone(),
    };
    let width = spec.ty.byte_width().ok_or_else(invalid)?;

    let Some(count) = &spec.count else {
        let value = scalar_value(reader, spec, spec.offset, width)?.ok_or_else(invalid)?;
        return Ok(vec![(spec.name.clone(), value)]);
    };

    let len = match count {
        Count::Fixed(n) => *n,
        Count::Field { name, times } => {
            let value = locals
                .get(name.as_str())
                .or_else(|| globals.get(name.as_str()))
                .copied()
                .ok_or_else(invalid)?;
            usize::try_from(value)
                .ok()
                .and_then(|value| value.checked_mul(*times))
                .ok_or_else(invalid)?
        }
    };
    let needed = len
        .checked_mul(width)
        .and_then(|bytes| bytes.checked_add(spec.offset))
        .ok_or_else(invalid)?;
    reader.require_len(needed)?;

    let mut samples = Vec::with_capacity(len);
    for idx in 0..len {
        samples.push(array_sample(reader, spec, spec.offset + idx * width, width)?);
    }

    match spec.deinterleave {
        Some(beams) if beams > 1 => {
            let mut split = vec![Vec::with_capacity(len / beams + 1); beams];
            for (idx, sample) in samples.into_iter().enumerate() {
                split[idx % beams].push(sample);
            }
            Ok(split
                .into_iter()
                .enumerate()
                .map(|(beam, values)| {
                    (
                        format!("{}_beam{}", spec.name, beam + 1),
                        FieldValue::Array(values),
                    )
                })
                .collect())
        }
        Some(_) => Ok(vec![(
            format!("{}_beam1", spec.name),
            FieldValue::Array(samples),
        )]),
        None => Ok(vec![(spec.name.clone(), FieldValue::Array(samples))]),
    }
}

/// Raw integer of a field element with its mask applied.
enum Raw {
    Int(i64),
    Float(f64),
}

fn read_raw(
    reader: FieldReader<'_>,
    spec: &FieldSpec,
    offset: usize,
    width: usize,
) -> Result<Raw, DecodeError> {
    if spec.ty == FieldType::F32 {
        return reader.read_f32(offset).map(|v| Raw::Float(f64::from(v)));
    }
    let unsigned = reader.read_uint(offset, width)?;
    let value = match spec.mask {
        Some(mask) => masked(unsigned, mask, is_signed(spec.ty)),
        None if is_signed(spec.ty) => crate::bytes::sign_extend(unsigned, width),
        None => unsigned as i64,
    };
    Ok(Raw::Int(value))
}

/// Bits selected by `mask`, shifted down; signed fields take the top
/// selected bit as the sign.
fn masked(unsigned: u64, mask: u64, signed: bool) -> i64 {
    let shift = mask.trailing_zeros();
    let value = (unsigned & mask) >> shift;
    let bits = u64::BITS - (mask >> shift).leading_zeros();
    if signed && bits < u64::BITS {
        let unused = u64::BITS - bits;
        ((value << unused) as i64) >> unused
    } else {
        value as i64
    }
}

fn is_signed(ty: FieldType) -> bool {
    matches!(
        ty,
        FieldType::I8 | FieldType::I16 | FieldType::I32 | FieldType::I64
    )
}

fn scale(spec: &FieldSpec, value: f64) -> f64 {
    value * spec.scale.unwrap_or(1.0) + spec.add.unwrap_or(0.0)
}

fn scalar_value(
    reader: FieldReader<'_>,
    spec: &FieldSpec,
    offset: usize,
    width: usize,
) -> Result<Option<FieldValue>, DecodeError> {
    let value = match read_raw(reader, spec, offset, width)? {
        Raw::Float(value) => FieldValue::Float(scale(spec, value)),
        Raw::Int(value) if spec.missing == Some(value) => FieldValue::Float(f64::NAN),
        Raw::Int(value) => {
            if let Some(labels) = &spec.labels {
                let label = usize::try_from(value).ok().and_then(|idx| labels.get(idx));
                return Ok(label.map(|label| FieldValue::Enum(label.clone())));
            }
            if spec.scale.is_some() || spec.add.is_some() {
                FieldValue::Float(scale(spec, value as f64))
            } else {
                FieldValue::Int(value)
            }
        }
    };
    Ok(Some(value))
}

fn array_sample(
    reader: FieldReader<'_>,
    spec: &FieldSpec,
    offset: usize,
    width: usize,
) -> Result<f64, DecodeError> {
    Ok(match read_raw(reader, spec, offset, width)? {
        Raw::Int(value) if spec.missing == Some(value) => f64::NAN,
        Raw::Int(value) => scale(spec, value as f64),
        Raw::Float(value) => scale(spec, value),
    })
}

#[cfg(test)]
mod tests {
    use super::BinaryDecoder;
    use crate::decoder::{DecodeError, FieldValue, RecordDecoder};
    use crate::scanner::RawRecord;
    use crate::schema::{Family, InstrumentConfig, SchemaTable};

    const SEQUENTIAL: &str = r#"
id = "seq"
stream = "seq_sample"

[framing]
kind = "binary"
sync = [0xAB]
length = { offset = 1, width = 1 }
min_length = 4

[layout]
endian = "big"
index = { kind = "sequential", start = 3, count_field = "blocks" }

[[layout.header]]
name = "blocks"
type = "u8"
offset = 2

[[layout.blocks]]
type_id = 1
name = "channel"
numbered = true
fields = [
    { name = "bins", type = "u8", offset = 0 },
    { name = "amplitude", type = "u16", offset = 1, count = { field = "bins" }, scale = 0.5, missing = 65535 },
]
"#;

    fn decode(config: &str, record: &[u8]) -> Result<Option<crate::decoder::DecodedFields>, DecodeError> {
        let table = SchemaTable::compile(vec![InstrumentConfig::from_toml_str(config).unwrap()]).unwrap();
        let instrument = table.get("seq").unwrap();
        let Family::Binary(layout) = &instrument.family else {
            panic!("binary layout expected");
        };
        let raw = RawRecord {
            offset: 0,
            length: record.len(),
            source: record,
            port_timestamp: None,
        };
        BinaryDecoder::new(layout).decode(&raw)
    }

    #[test]
    fn sequential_blocks_are_numbered() {
        let record = [
            0xAB, 17, 2, // sync, length, block count
            1, 0x00, 0x05, 2, 0x00, 0x04, 0xFF, 0xFF, // channel 1: two bins, second missing
            1, 0x00, 0x03, 1, 0x00, 0x0A, // channel 2: one bin
        ];
        let fields = decode(SEQUENTIAL, &record).unwrap().unwrap();
        assert_eq!(fields.get("bins_1"), Some(&FieldValue::Int(2)));
        assert_eq!(fields.get("bins_2"), Some(&FieldValue::Int(1)));
        let first = fields.get("amplitude_1").and_then(FieldValue::as_array).unwrap();
        assert_eq!(first[0], 2.0);
        assert!(first[1].is_nan());
        assert_eq!(fields.get("amplitude_2"), Some(&FieldValue::Array(vec![5.0])));
    }

    #[test]
    fn short_sub_record_is_truncated() {
        // declared payload runs past the end of the record
        let record = [0xAB, 9, 1, 1, 0x00, 0x05, 3, 0x00, 0x04];
        assert!(matches!(
            decode(SEQUENTIAL, &record),
            Err(DecodeError::TruncatedRecord { offset: 0, .. })
        ));
    }

    #[test]
    fn unknown_sub_record_type_is_rejected() {
        let record = [0xAB, 7, 1, 9, 0x00, 0x00, 0x00];
        assert_eq!(
            decode(SEQUENTIAL, &record),
            Err(DecodeError::FieldFormat {
                offset: 0,
                field: "sub_record_type".to_string()
            })
        );
    }

    #[test]
    fn unknown_sub_record_type_can_be_ignored() {
        let config = SEQUENTIAL.replace(
            "index = { kind",
            "ignore_unknown = true\nindex = { kind",
        );
        let record = [0xAB, 7, 1, 9, 0x00, 0x00, 0x00];
        let fields = decode(&config, &record).unwrap().unwrap();
        assert_eq!(fields.names().collect::<Vec<_>>(), vec!["blocks"]);
    }

    #[test]
    fn masked_signed_fields_keep_their_sign() {
        let config = SEQUENTIAL.replace(
            "[[layout.blocks]]",
            r#"[[layout.header]]
name = "high"
type = "i8"
offset = 3
mask = 0xF0

[[layout.header]]
name = "low"
type = "i8"
offset = 3
mask = 0x0F

[[layout.header]]
name = "high_unsigned"
type = "u8"
offset = 3
mask = 0xF0

[[layout.blocks]]"#,
        );
        let record = [0xAB, 4, 0, 0xE5];
        let fields = decode(&config, &record).unwrap().unwrap();
        assert_eq!(fields.get("high"), Some(&FieldValue::Int(-2)));
        assert_eq!(fields.get("low"), Some(&FieldValue::Int(5)));
        assert_eq!(fields.get("high_unsigned"), Some(&FieldValue::Int(14)));
    }
}
