//! Particle construction.
//!
//! A particle is the canonical output record: decoded fields plus the port
//! and instrument timestamps, a quality flag and a provenance id. One record
//! feeds every stream whose fields it carries. Building never rejects a
//! record; clock problems drop the internal timestamp and out-of-range values
//! mark the particle suspect.

use serde::ser::{Serialize, SerializeMap, Serializer};
use time::PrimitiveDateTime;

use crate::decoder::{DecodedFields, FieldValue};
use crate::schema::{Clock, CompiledInstrument, RangeTable, StreamCondition, StreamSpec};
use crate::timestamp::Timestamp;

/// Keys the particle itself writes next to decoded fields.
pub const RESERVED_KEYS: [&str; 7] = [
    "stream",
    "port_timestamp",
    "internal_timestamp",
    "preferred_timestamp",
    "quality_flag",
    "range_warnings",
    "provenance_id",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    Ok,
    Suspect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    pub stream: String,
    pub fields: DecodedFields,
    pub port_timestamp: Option<Timestamp>,
    pub internal_timestamp: Option<Timestamp>,
    /// Internal timestamp when present, else the port timestamp.
    pub preferred_timestamp: Option<Timestamp>,
    pub quality_flag: QualityFlag,
    /// Fields whose values fell outside their configured range.
    pub range_warnings: Vec<String>,
    pub provenance_id: String,
}

/// Serialised as one flat object: decoded fields first, then the particle
/// keys.
impl Serialize for Particle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + RESERVED_KEYS.len()))?;
        for (name, value) in self.fields.iter() {
            map.serialize_entry(name, value)?;
        }
        map.serialize_entry("stream", &self.stream)?;
        map.serialize_entry("port_timestamp", &self.port_timestamp)?;
        map.serialize_entry("internal_timestamp", &self.internal_timestamp)?;
        map.serialize_entry("preferred_timestamp", &self.preferred_timestamp)?;
        map.serialize_entry("quality_flag", &self.quality_flag)?;
        map.serialize_entry("range_warnings", &self.range_warnings)?;
        map.serialize_entry("provenance_id", &self.provenance_id)?;
        map.end()
    }
}

/// Where a record came from.
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    pub source_name: &'a str,
    pub offset: usize,
    pub port_timestamp: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy)]
pub struct ParticleBuilder<'s> {
    instrument: &'s CompiledInstrument,
}

impl<'s> ParticleBuilder<'s> {
    pub fn new(instrument: &'s CompiledInstrument) -> Self {
        Self { instrument }
    }

    /// Build `stream`'s particle from a decoded record.
    ///
    /// Returns `None` when the record carries none of the stream's fields or
    /// fails its condition. The clock always reads the whole record.
    pub fn build(
        &self,
        stream: &StreamSpec,
        record: &DecodedFields,
        context: &BuildContext<'_>,
    ) -> Option<Particle> {
        let fields = select(stream, record)?;
        let internal_timestamp = self
            .instrument
            .clock
            .as_ref()
            .and_then(|clock| internal_timestamp(clock, record));
        let range_warnings = range_warnings(&self.instrument.ranges, &fields);
        let quality_flag = if range_warnings.is_empty() {
            QualityFlag::Ok
        } else {
            QualityFlag::Suspect
        };

        Some(Particle {
            stream: stream.name.clone(),
            fields,
            port_timestamp: context.port_timestamp,
            internal_timestamp,
            preferred_timestamp: internal_timestamp.or(context.port_timestamp),
            quality_flag,
            range_warnings,
            provenance_id: format!(
                "{}:{}@{}",
                self.instrument.id, context.source_name, context.offset
            ),
        })
    }
}

fn select(stream: &StreamSpec, record: &DecodedFields) -> Option<DecodedFields> {
    if let Some(when) = &stream.when {
        if !condition_holds(when, record) {
            return None;
        }
    }
    let mut anchored = !stream.needs_anchor();
    let mut fields = DecodedFields::default();
    for (name, value) in record.iter().filter(|(name, _)| stream.carries(name)) {
        anchored |= stream.anchored_by(name);
        fields.push(name.to_string(), value.clone());
    }
    (anchored && !fields.is_empty()).then_some(fields)
}

fn condition_holds(when: &StreamCondition, record: &DecodedFields) -> bool {
    let text = match record.get(&when.field) {
        Some(FieldValue::Int(value)) => value.to_string(),
        Some(other) => match other.as_str() {
            Some(text) => text.to_string(),
            None => return false,
        },
        None => return false,
    };
    when.one_of.iter().any(|candidate| *candidate == text)
}

fn int_field(fields: &DecodedFields, name: &str) -> Option<i64> {
    match fields.get(name)? {
        FieldValue::Int(value) => Some(*value),
        FieldValue::Float(value) if value.is_finite() && value.fract() == 0.0 => {
            Some(*value as i64)
        }
        _ => None,
    }
}

/// Convert the instrument clock into the canonical epoch.
///
/// Malformed components (month 13, hour 25, unparsable text) yield `None`.
pub fn internal_timestamp(clock: &Clock, fields: &DecodedFields) -> Option<Timestamp> {
    match clock {
        Clock::Calendar {
            year,
            month,
            day,
            hour,
            minute,
            second,
            hundredths,
            year_base,
        } => {
            let component = |name: &str| int_field(fields, name).and_then(|v| u8::try_from(v).ok());
            let year = i32::try_from(int_field(fields, year)?).ok()?.checked_add(*year_base)?;
            let nanos = match hundredths {
                Some(name) => {
                    let value = component(name)?;
                    if value > 99 {
                        return None;
                    }
                    u32::from(value) * 10_000_000
                }
                None => 0,
            };
            Timestamp::from_calendar(
                year,
                component(month)?,
                component(day)?,
                component(hour)?,
                component(minute)?,
                component(second)?,
                nanos,
            )
        }
        Clock::Counter { field, epoch } => {
            let seconds = fields.get(field)?.as_f64()?;
            seconds
                .is_finite()
                .then(|| Timestamp::from_epoch_seconds(seconds, *epoch))
        }
        Clock::Text { field, format } => {
            let text = fields.get(field)?.as_str()?;
            PrimitiveDateTime::parse(text.trim(), format)
                .ok()
                .map(Timestamp::from_datetime)
        }
    }
}

fn range_warnings(ranges: &RangeTable, fields: &DecodedFields) -> Vec<String> {
    if ranges.is_empty() {
        return Vec::new();
    }
    let outside = |value: f64, (min, max): (f64, f64)| !value.is_nan() && (value < min || value > max);
    fields
        .iter()
        .filter(|(name, value)| {
            let Some(range) = ranges.lookup(name) else {
                return false;
            };
            match value {
                FieldValue::Array(values) => values.iter().any(|&v| outside(v, range)),
                other => other.as_f64().is_some_and(|v| outside(v, range)),
            }
        })
        .map(|(name, _)| name.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{BuildContext, ParticleBuilder, QualityFlag};
    use crate::decoder::{DecodedFields, FieldValue};
    use crate::input::parse_controller_stamp;
    use crate::schema::{InstrumentConfig, SchemaTable, StreamSpec};
    use crate::timestamp::Timestamp;

    const CONFIG: &str = r#"
id = "ctdbp"
stream = "ctdbp_sample"

[framing]
kind = "lines"
wrapper = "controller"

[grammar]
pattern = '^\S+ \S+ # (?P<temp>[-\d.]+), (?P<cond>[-\d.]+), (?P<time>\d{2} \w{3} \d{4} \d{2}:\d{2}:\d{2})$'
fields = [
    { name = "temperature", type = "float", group = "temp", range = [-5.0, 35.0] },
    { name = "conductivity", type = "float", group = "cond" },
    { name = "sample_time", type = "text", group = "time" },
]

[clock]
kind = "text"
field = "sample_time"
format = "[day] [month repr:short] [year] [hour]:[minute]:[second]"
"#;

    fn fields(temp: f64, time: &str) -> DecodedFields {
        let mut fields = DecodedFields::default();
        fields.push("temperature".to_string(), FieldValue::Float(temp));
        fields.push("conductivity".to_string(), FieldValue::Float(4.2));
        fields.push("sample_time".to_string(), FieldValue::Text(time.to_string()));
        fields
    }

    fn table() -> SchemaTable {
        SchemaTable::compile(vec![InstrumentConfig::from_toml_str(CONFIG).unwrap()]).unwrap()
    }

    fn stream(table: &SchemaTable) -> &StreamSpec {
        &table.get("ctdbp").unwrap().streams[0]
    }

    #[test]
    fn internal_clock_is_preferred() {
        let table = table();
        let builder = ParticleBuilder::new(table.get("ctdbp").unwrap());
        let port = parse_controller_stamp("2014/08/17 00:57:10.648");
        let particle = builder
            .build(
                stream(&table),
                &fields(20.0, "17 Aug 2014 00:57:07"),
                &BuildContext {
                    source_name: "ctdbp.log",
                    offset: 0,
                    port_timestamp: port,
                },
            )
            .unwrap();
        let internal = Timestamp::from_calendar(2014, 8, 17, 0, 57, 7, 0);
        assert_eq!(particle.internal_timestamp, internal);
        assert_eq!(particle.preferred_timestamp, internal);
        assert_eq!(particle.port_timestamp, port);
        assert_eq!(particle.provenance_id, "ctdbp:ctdbp.log@0");
        assert_eq!(particle.quality_flag, QualityFlag::Ok);
    }

    #[test]
    fn malformed_clock_falls_back_to_port() {
        let table = table();
        let builder = ParticleBuilder::new(table.get("ctdbp").unwrap());
        let port = parse_controller_stamp("2014/08/17 00:57:10.648");
        let particle = builder
            .build(
                stream(&table),
                &fields(20.0, "31 Feb 2014 00:57:07"),
                &BuildContext {
                    source_name: "ctdbp.log",
                    offset: 40,
                    port_timestamp: port,
                },
            )
            .unwrap();
        assert_eq!(particle.internal_timestamp, None);
        assert_eq!(particle.preferred_timestamp, port);
    }

    #[test]
    fn out_of_range_marks_suspect() {
        let table = table();
        let builder = ParticleBuilder::new(table.get("ctdbp").unwrap());
        let particle = builder
            .build(
                stream(&table),
                &fields(99.0, "17 Aug 2014 00:57:07"),
                &BuildContext {
                    source_name: "ctdbp.log",
                    offset: 0,
                    port_timestamp: None,
                },
            )
            .unwrap();
        assert_eq!(particle.quality_flag, QualityFlag::Suspect);
        assert_eq!(particle.range_warnings, vec!["temperature".to_string()]);
    }

    #[test]
    fn serialises_flat() {
        let table = table();
        let builder = ParticleBuilder::new(table.get("ctdbp").unwrap());
        let particle = builder
            .build(
                stream(&table),
                &fields(20.0, "17 Aug 2014 00:57:07"),
                &BuildContext {
                    source_name: "ctdbp.log",
                    offset: 0,
                    port_timestamp: None,
                },
            )
            .unwrap();
        let json = serde_json::to_value(&particle).unwrap();
        assert_eq!(json["temperature"], 20.0);
        assert_eq!(json["stream"], "ctdbp_sample");
        assert_eq!(json["quality_flag"], "ok");
        assert!(json["port_timestamp"].is_null());
        assert!(json["internal_timestamp"].is_number());
    }

    const SPLIT: &str = r#"
id = "ctdbp"

[[streams]]
name = "ctdbp_temperature"
fields = ["temperature"]

[[streams]]
name = "ctdbp_conductivity"
fields = ["conductivity"]
when = { field = "sample_time", one_of = ["17 Aug 2014 00:57:07"] }

[framing]
kind = "lines"

[grammar]
pattern = '^(?P<temp>[-\d.]+), (?P<cond>[-\d.]+), (?P<time>.+)$'
fields = [
    { name = "temperature", type = "float", group = "temp", range = [-5.0, 35.0] },
    { name = "conductivity", type = "float", group = "cond" },
    { name = "sample_time", type = "text", group = "time" },
]

[clock]
kind = "text"
field = "sample_time"
format = "[day] [month repr:short] [year] [hour]:[minute]:[second]"
"#;

    #[test]
    fn streams_take_their_own_fields_and_share_the_clock() {
        let table =
            SchemaTable::compile(vec![InstrumentConfig::from_toml_str(SPLIT).unwrap()]).unwrap();
        let instrument = table.get("ctdbp").unwrap();
        let builder = ParticleBuilder::new(instrument);
        let context = BuildContext {
            source_name: "ctdbp.log",
            offset: 0,
            port_timestamp: None,
        };
        let record = fields(99.0, "17 Aug 2014 00:57:07");

        let temperature = builder.build(&instrument.streams[0], &record, &context).unwrap();
        assert_eq!(temperature.stream, "ctdbp_temperature");
        assert_eq!(temperature.fields.names().collect::<Vec<_>>(), ["temperature"]);
        assert_eq!(
            temperature.internal_timestamp,
            Timestamp::from_calendar(2014, 8, 17, 0, 57, 7, 0)
        );
        assert_eq!(temperature.quality_flag, QualityFlag::Suspect);

        let conductivity = builder.build(&instrument.streams[1], &record, &context).unwrap();
        assert_eq!(conductivity.fields.names().collect::<Vec<_>>(), ["conductivity"]);
        assert_eq!(conductivity.quality_flag, QualityFlag::Ok);

        let later = fields(20.0, "17 Aug 2014 01:00:00");
        assert!(builder.build(&instrument.streams[1], &later, &context).is_none());
    }
}
