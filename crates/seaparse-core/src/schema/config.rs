//! Serde model of a per-instrument TOML document.
//!
//! These types mirror the file format one-to-one and carry no validation;
//! [`super::SchemaTable::compile`] turns them into immutable layouts.

use serde::{Deserialize, Serialize};

use crate::timestamp::Epoch;

use super::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstrumentConfig {
    /// Instrument identifier used for lookups and provenance ids.
    pub id: String,
    /// Particle stream name for instruments emitting one stream per record.
    #[serde(default)]
    pub stream: Option<String>,
    /// Suppress particles whose fields repeat the previous particle.
    #[serde(default)]
    pub dedupe: bool,
    /// Named streams that split each record into several particles.
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
    pub framing: FramingConfig,
    #[serde(default)]
    pub checksum: ChecksumConfig,
    #[serde(default)]
    pub layout: Option<BinaryLayoutConfig>,
    #[serde(default)]
    pub grammar: Option<GrammarConfig>,
    #[serde(default)]
    pub clock: Option<ClockConfig>,
    #[serde(default)]
    pub echogram: Option<EchogramConfig>,
}

impl InstrumentConfig {
    /// Parse one instrument document.
    ///
    /// # Errors
    /// Returns `ConfigError::Toml` when the document is not valid TOML or
    /// does not match the configuration model.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|err| ConfigError::Toml {
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endian {
    #[default]
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapperKind {
    /// Records are stored bare.
    #[default]
    None,
    /// Every line starts with a controller clock (`YYYY/MM/DD HH:MM:SS.mmm`).
    Controller,
    /// Controller lines carrying hex-encoded binary payload.
    ControllerHex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum FramingConfig {
    Binary {
        sync: Vec<u8>,
        length: LengthFieldConfig,
        /// Smallest record length accepted as a real record.
        min_length: usize,
        /// Maximum number of bytes skipped while hunting for sync.
        #[serde(default = "default_max_resync")]
        max_resync: usize,
        #[serde(default)]
        wrapper: WrapperKind,
    },
    Lines {
        #[serde(default = "default_terminator")]
        terminator: String,
        #[serde(default)]
        wrapper: WrapperKind,
    },
}

fn default_max_resync() -> usize {
    64 * 1024
}

fn default_terminator() -> String {
    "\n".to_string()
}

/// Location of the record length field, relative to the sync pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LengthFieldConfig {
    pub offset: usize,
    pub width: usize,
    #[serde(default)]
    pub endian: Endian,
    /// Added to the stored value to obtain the full record length.
    #[serde(default)]
    pub add: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ChecksumConfig {
    #[default]
    None,
    /// Sum of every byte preceding the trailing checksum, modulo 2^(8*width).
    ModularSum {
        width: usize,
        #[serde(default)]
        endian: Endian,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BinaryLayoutConfig {
    #[serde(default)]
    pub endian: Endian,
    pub index: SubRecordIndexConfig,
    /// Skip sub-records whose type id has no declared block.
    #[serde(default)]
    pub ignore_unknown: bool,
    /// Fields read from the record header, offsets relative to record start.
    #[serde(default)]
    pub header: Vec<FieldConfig>,
    #[serde(default)]
    pub blocks: Vec<BlockConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum SubRecordIndexConfig {
    /// A sub-record count followed by a table of byte offsets.
    OffsetTable {
        count_offset: usize,
        #[serde(default = "one")]
        count_width: usize,
        table_offset: usize,
        #[serde(default = "two")]
        id_width: usize,
    },
    /// Sub-records laid end to end, each prefixed by a type id and length.
    Sequential {
        start: usize,
        count_field: String,
        #[serde(default = "one")]
        id_width: usize,
        #[serde(default = "two")]
        length_width: usize,
    },
}

fn one() -> usize {
    1
}

fn two() -> usize {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockConfig {
    pub type_id: u64,
    pub name: String,
    /// Suffix every field with the 1-based occurrence index of this block.
    #[serde(default)]
    pub numbered: bool,
    pub fields: Vec<FieldConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    Int,
    Float,
    HexInt,
    Text,
    Enum,
}

impl FieldType {
    pub fn byte_width(self) -> Option<usize> {
        match self {
            FieldType::U8 | FieldType::I8 => Some(1),
            FieldType::U16 | FieldType::I16 => Some(2),
            FieldType::U32 | FieldType::I32 | FieldType::F32 => Some(4),
            FieldType::U64 | FieldType::I64 => Some(8),
            _ => None,
        }
    }

    pub fn is_binary(self) -> bool {
        self.byte_width().is_some()
    }

    pub fn is_integer(self) -> bool {
        !matches!(
            self,
            FieldType::F32 | FieldType::Float | FieldType::Text | FieldType::Enum
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CountConfig {
    Fixed(usize),
    Field {
        field: String,
        #[serde(default = "one")]
        times: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    /// Byte offset (binary layouts).
    #[serde(default)]
    pub offset: Option<usize>,
    /// Named capture group (grammars).
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub count: Option<CountConfig>,
    #[serde(default)]
    pub mask: Option<u64>,
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub add: Option<f64>,
    #[serde(default)]
    pub missing: Option<i64>,
    #[serde(default)]
    pub deinterleave: Option<usize>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub range: Option<[f64; 2]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrammarConfig {
    pub pattern: String,
    /// Lines matching this pattern are known non-data records.
    #[serde(default)]
    pub metadata: Option<String>,
    pub fields: Vec<FieldConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ClockConfig {
    /// Calendar components spread over integer fields.
    Calendar {
        year: String,
        month: String,
        day: String,
        hour: String,
        minute: String,
        second: String,
        #[serde(default)]
        hundredths: Option<String>,
        /// Added to the stored year (e.g. 2000 for two-digit RTC years).
        #[serde(default)]
        year_base: i32,
    },
    /// Seconds counted from an explicit epoch.
    Counter { field: String, epoch: Epoch },
    /// A text field parsed with a `time` format description.
    Text { field: String, format: String },
}

/// One particle stream carved out of each record.
///
/// A stream carries the fields of the listed blocks plus the listed fields.
/// When blocks or `requires` are given, the stream emits only for records
/// that decode one of those fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default)]
    pub blocks: Vec<String>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    /// Suppress particles repeating this stream's previous particle.
    #[serde(default)]
    pub dedupe: bool,
    #[serde(default)]
    pub when: Option<StreamConditionConfig>,
}

/// Emit only when `field` decodes to one of `one_of` (label or integer text).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConditionConfig {
    pub field: String,
    pub one_of: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EchogramConfig {
    pub depth_bins: usize,
    /// Physical depth of the first and last bin, in metres.
    pub depth_range: [f64; 2],
    pub resolution_s: f64,
    #[serde(default = "default_bucket_s")]
    pub bucket_s: f64,
    #[serde(default = "default_percentiles")]
    pub percentiles: [f64; 2],
    /// Frequencies expected even when a bucket received no data.
    #[serde(default)]
    pub frequencies: Vec<u32>,
    pub channels: Vec<ChannelConfig>,
}

fn default_bucket_s() -> f64 {
    86_400.0
}

fn default_percentiles() -> [f64; 2] {
    [5.0, 95.0]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    #[serde(default)]
    pub frequency: Option<u32>,
    #[serde(default)]
    pub frequency_field: Option<String>,
    pub amplitude_field: String,
}
