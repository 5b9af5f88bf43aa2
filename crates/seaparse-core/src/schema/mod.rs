//! Instrument schemas.
//!
//! Per-instrument configuration is deserialised from TOML (`config`), then
//! validated and compiled exactly once into an immutable [`SchemaTable`].
//! Every engine borrows its [`CompiledInstrument`] from the table, so schema
//! drift (unknown groups, dangling count references, inverted ranges) is a
//! [`ConfigError`] at start-up instead of a per-record failure.

pub mod config;
pub mod error;

use std::collections::{BTreeMap, HashMap, HashSet};

use regex::Regex;
use time::format_description::OwnedFormatItem;

pub use config::{
    ChannelConfig, ChecksumConfig, ClockConfig, CountConfig, EchogramConfig, Endian, FieldConfig,
    FieldType, InstrumentConfig, LengthFieldConfig, StreamConfig, WrapperKind,
};
pub use error::ConfigError;

use config::{BinaryLayoutConfig, FramingConfig, GrammarConfig, SubRecordIndexConfig};

/// All compiled instruments, looked up by id.
#[derive(Debug, Default)]
pub struct SchemaTable {
    instruments: Vec<CompiledInstrument>,
    index: HashMap<String, usize>,
}

impl SchemaTable {
    /// Validate and compile a set of instrument documents.
    ///
    /// # Errors
    /// Returns the first `ConfigError` found; nothing is compiled on error.
    pub fn compile(configs: Vec<InstrumentConfig>) -> Result<Self, ConfigError> {
        let mut table = SchemaTable::default();
        for config in configs {
            if table.index.contains_key(&config.id) {
                return Err(ConfigError::DuplicateInstrument { id: config.id });
            }
            let compiled = CompiledInstrument::compile(config)?;
            table
                .index
                .insert(compiled.id.clone(), table.instruments.len());
            table.instruments.push(compiled);
        }
        Ok(table)
    }

    /// Look up a compiled instrument by id.
    ///
    /// # Errors
    /// Returns `ConfigError::UnknownInstrument` when the id was never compiled.
    pub fn get(&self, id: &str) -> Result<&CompiledInstrument, ConfigError> {
        self.index
            .get(id)
            .map(|&idx| &self.instruments[idx])
            .ok_or_else(|| ConfigError::UnknownInstrument { id: id.to_string() })
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.instruments.iter().map(|inst| inst.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

#[derive(Debug)]
pub struct CompiledInstrument {
    pub id: String,
    /// Streams fed by each record, in emission order.
    pub streams: Vec<StreamSpec>,
    pub framing: Framing,
    pub family: Family,
    pub clock: Option<Clock>,
    pub ranges: RangeTable,
    pub echogram: Option<EchogramSettings>,
}

impl CompiledInstrument {
    pub fn stream_names(&self) -> impl Iterator<Item = &str> {
        self.streams.iter().map(|stream| stream.name.as_str())
    }
}

/// One particle stream carved out of each decoded record.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub name: String,
    pub dedupe: bool,
    /// Declared base names carried; `None` carries every decoded field.
    members: Option<HashSet<String>>,
    /// Base names of which at least one must be decoded for the stream to
    /// emit: every field of the listed blocks plus `requires`.
    anchors: HashSet<String>,
    pub when: Option<StreamCondition>,
}

#[derive(Debug, Clone)]
pub struct StreamCondition {
    pub field: String,
    pub one_of: Vec<String>,
}

impl StreamSpec {
    /// A stream carrying every field of every record.
    fn catch_all(name: String, dedupe: bool) -> Self {
        StreamSpec {
            name,
            dedupe,
            members: None,
            anchors: HashSet::new(),
            when: None,
        }
    }

    /// Whether a decoded (possibly expanded) field name belongs to this stream.
    pub fn carries(&self, name: &str) -> bool {
        self.members
            .as_ref()
            .is_none_or(|members| declared_in(members, name))
    }

    /// Whether a decoded field name satisfies this stream's block anchor.
    pub fn anchored_by(&self, name: &str) -> bool {
        declared_in(&self.anchors, name)
    }

    pub fn needs_anchor(&self) -> bool {
        !self.anchors.is_empty()
    }
}

fn declared_in(set: &HashSet<String>, name: &str) -> bool {
    let mut current = name;
    loop {
        if set.contains(current) {
            return true;
        }
        match strip_expansion(current) {
            Some(base) => current = base,
            None => return false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Framing {
    Binary {
        sync: Vec<u8>,
        length: LengthFieldConfig,
        min_length: usize,
        max_resync: usize,
        wrapper: WrapperKind,
    },
    Lines {
        terminator: Vec<u8>,
        wrapper: WrapperKind,
    },
}

impl Framing {
    pub fn wrapper(&self) -> WrapperKind {
        match self {
            Framing::Binary { wrapper, .. } | Framing::Lines { wrapper, .. } => *wrapper,
        }
    }
}

#[derive(Debug)]
pub enum Family {
    Binary(BinaryLayout),
    Grammar(Grammar),
}

#[derive(Debug, Clone)]
pub struct BinaryLayout {
    pub endian: Endian,
    pub index: SubRecordIndex,
    pub ignore_unknown: bool,
    pub header: Vec<FieldSpec>,
    pub blocks: BTreeMap<u64, BlockSpec>,
    pub checksum: ChecksumConfig,
}

#[derive(Debug, Clone)]
pub enum SubRecordIndex {
    OffsetTable {
        count_offset: usize,
        count_width: usize,
        table_offset: usize,
        id_width: usize,
    },
    Sequential {
        start: usize,
        /// Header field holding the number of sub-records.
        count_field: String,
        id_width: usize,
        length_width: usize,
    },
}

#[derive(Debug, Clone)]
pub struct BlockSpec {
    pub type_id: u64,
    pub name: String,
    pub numbered: bool,
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
    pub offset: usize,
    pub count: Option<Count>,
    pub mask: Option<u64>,
    pub scale: Option<f64>,
    pub add: Option<f64>,
    pub missing: Option<i64>,
    pub deinterleave: Option<usize>,
    pub labels: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub enum Count {
    Fixed(usize),
    Field { name: String, times: usize },
}

#[derive(Debug)]
pub struct Grammar {
    pub pattern: Regex,
    pub metadata: Option<Regex>,
    pub fields: Vec<GrammarField>,
}

#[derive(Debug, Clone)]
pub struct GrammarField {
    pub name: String,
    pub ty: FieldType,
    pub group: String,
    pub scale: Option<f64>,
    pub add: Option<f64>,
    pub labels: Option<Vec<String>>,
}

#[derive(Debug)]
pub enum Clock {
    Calendar {
        year: String,
        month: String,
        day: String,
        hour: String,
        minute: String,
        second: String,
        hundredths: Option<String>,
        year_base: i32,
    },
    Counter {
        field: String,
        epoch: crate::timestamp::Epoch,
    },
    Text {
        field: String,
        format: OwnedFormatItem,
    },
}

/// Physical valid ranges keyed by declared field name.
///
/// Lookups fall back from expanded names (`echo_beam2`, `amplitude_3`) to
/// the declared base name.
#[derive(Debug, Clone, Default)]
pub struct RangeTable {
    ranges: HashMap<String, (f64, f64)>,
}

impl RangeTable {
    pub fn insert(&mut self, name: &str, min: f64, max: f64) {
        self.ranges.insert(name.to_string(), (min, max));
    }

    pub fn lookup(&self, name: &str) -> Option<(f64, f64)> {
        let mut current = name;
        loop {
            if let Some(range) = self.ranges.get(current) {
                return Some(*range);
            }
            current = strip_expansion(current)?;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Strip one `_beamN` or `_N` suffix added by de-interleaving or numbering.
fn strip_expansion(name: &str) -> Option<&str> {
    let (base, suffix) = name.rsplit_once('_')?;
    let digits = suffix.strip_prefix("beam").unwrap_or(suffix);
    (!digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())).then_some(base)
}

#[derive(Debug, Clone)]
pub struct EchogramSettings {
    pub depth_bins: usize,
    pub depth_range: (f64, f64),
    pub resolution_s: f64,
    pub bucket_s: f64,
    pub lower_percentile: f64,
    pub upper_percentile: f64,
    pub frequencies: Vec<u32>,
    pub channels: Vec<ChannelSpec>,
}

impl EchogramSettings {
    pub fn slots_per_bucket(&self) -> usize {
        (self.bucket_s / self.resolution_s).ceil() as usize
    }
}

#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub frequency: FrequencySource,
    pub amplitude_field: String,
}

#[derive(Debug, Clone)]
pub enum FrequencySource {
    Fixed(u32),
    Field(String),
}

/// Names a schema can emit, used to validate cross references.
#[derive(Default)]
struct DeclaredNames {
    exact: HashSet<String>,
    integer: HashSet<String>,
    numbered: HashSet<String>,
}

impl DeclaredNames {
    fn declare(&mut self, field: &FieldSpec, numbered: bool) {
        if numbered {
            self.numbered.insert(field.name.clone());
        }
        match field.deinterleave {
            Some(beams) => {
                for beam in 1..=beams {
                    self.exact.insert(format!("{}_beam{beam}", field.name));
                }
            }
            None => {
                self.exact.insert(field.name.clone());
            }
        }
        if field.ty.is_integer() && field.count.is_none() && field.scale.is_none() {
            self.integer.insert(field.name.clone());
        }
    }

    fn knows(&self, name: &str) -> bool {
        if self.exact.contains(name) && !self.numbered.contains(name) {
            return true;
        }
        match name.rsplit_once('_') {
            Some((base, suffix)) if suffix.bytes().all(|b| b.is_ascii_digit()) => {
                self.numbered.contains(base)
            }
            _ => false,
        }
    }
}

impl CompiledInstrument {
    fn compile(config: InstrumentConfig) -> Result<Self, ConfigError> {
        let id = config.id.clone();
        if id.trim().is_empty() {
            return Err(ConfigError::InvalidFraming {
                instrument: id,
                message: "id must not be empty".to_string(),
            });
        }

        let framing = compile_framing(&id, config.framing)?;
        let mut ranges = RangeTable::default();
        let mut names = DeclaredNames::default();

        let family = match (config.layout, config.grammar, &framing) {
            (Some(layout), None, Framing::Binary { .. }) => Family::Binary(compile_layout(
                &id,
                layout,
                config.checksum,
                &mut ranges,
                &mut names,
            )?),
            (None, Some(grammar), Framing::Lines { .. }) => {
                if !matches!(config.checksum, ChecksumConfig::None) {
                    return Err(ConfigError::InvalidFraming {
                        instrument: id,
                        message: "checksums apply to binary layouts only".to_string(),
                    });
                }
                Family::Grammar(compile_grammar(&id, grammar, &mut ranges, &mut names)?)
            }
            _ => return Err(ConfigError::MissingSchema { instrument: id }),
        };

        let streams = compile_streams(
            &id,
            config.stream,
            config.dedupe,
            config.streams,
            &family,
            &names,
        )?;
        let clock = config
            .clock
            .map(|clock| compile_clock(&id, clock, &names))
            .transpose()?;
        let echogram = config
            .echogram
            .map(|echogram| compile_echogram(&id, echogram, &names))
            .transpose()?;

        Ok(CompiledInstrument {
            id,
            streams,
            framing,
            family,
            clock,
            ranges,
            echogram,
        })
    }
}

fn compile_streams(
    id: &str,
    single: Option<String>,
    dedupe: bool,
    streams: Vec<StreamConfig>,
    family: &Family,
    names: &DeclaredNames,
) -> Result<Vec<StreamSpec>, ConfigError> {
    if streams.is_empty() {
        return match single {
            Some(name) if !name.trim().is_empty() => Ok(vec![StreamSpec::catch_all(name, dedupe)]),
            _ => Err(ConfigError::InvalidFraming {
                instrument: id.to_string(),
                message: "a stream name or a [[streams]] list is required".to_string(),
            }),
        };
    }
    if single.is_some() || dedupe {
        return Err(ConfigError::InvalidFraming {
            instrument: id.to_string(),
            message: "stream and dedupe are set per stream when [[streams]] is declared"
                .to_string(),
        });
    }

    let blocks: HashMap<&str, Vec<&str>> = match family {
        Family::Binary(layout) => layout
            .blocks
            .values()
            .map(|block| {
                let fields = block.fields.iter().map(|f| f.name.as_str()).collect();
                (block.name.as_str(), fields)
            })
            .collect(),
        Family::Grammar(_) => HashMap::new(),
    };
    let bases: HashSet<&str> = match family {
        Family::Binary(layout) => layout
            .header
            .iter()
            .chain(layout.blocks.values().flat_map(|block| &block.fields))
            .map(|f| f.name.as_str())
            .collect(),
        Family::Grammar(grammar) => grammar.fields.iter().map(|f| f.name.as_str()).collect(),
    };

    let mut seen = HashSet::new();
    let mut compiled = Vec::with_capacity(streams.len());
    for stream in streams {
        let invalid = |message: &str| ConfigError::InvalidStream {
            instrument: id.to_string(),
            stream: stream.name.clone(),
            message: message.to_string(),
        };
        let unknown = |reference: &str| ConfigError::UnknownReference {
            instrument: id.to_string(),
            field: format!("streams.{}", stream.name),
            reference: reference.to_string(),
        };
        if stream.name.trim().is_empty() {
            return Err(invalid("stream name must not be empty"));
        }
        if !seen.insert(stream.name.clone()) {
            return Err(invalid("stream declared twice"));
        }
        if stream.blocks.is_empty() && stream.fields.is_empty() {
            return Err(invalid("a stream needs at least one block or field"));
        }

        let mut anchors = HashSet::new();
        for block in &stream.blocks {
            let fields = blocks.get(block.as_str()).ok_or_else(|| unknown(block))?;
            anchors.extend(fields.iter().map(|name| name.to_string()));
        }
        for field in &stream.requires {
            if !bases.contains(field.as_str()) {
                return Err(unknown(field));
            }
            anchors.insert(field.clone());
        }
        let mut members = anchors.clone();
        for field in &stream.fields {
            if !bases.contains(field.as_str()) {
                return Err(unknown(field));
            }
            members.insert(field.clone());
        }

        let when = match stream.when {
            Some(when) => {
                if !names.knows(&when.field) {
                    return Err(unknown(&when.field));
                }
                if when.one_of.is_empty() {
                    return Err(invalid("when.one_of must not be empty"));
                }
                Some(StreamCondition {
                    field: when.field,
                    one_of: when.one_of,
                })
            }
            None => None,
        };

        compiled.push(StreamSpec {
            name: stream.name,
            dedupe: stream.dedupe,
            members: Some(members),
            anchors,
            when,
        });
    }
    Ok(compiled)
}

fn compile_framing(id: &str, framing: FramingConfig) -> Result<Framing, ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidFraming {
        instrument: id.to_string(),
        message: message.to_string(),
    };
    match framing {
        FramingConfig::Binary {
            sync,
            length,
            min_length,
            max_resync,
            wrapper,
        } => {
            if sync.is_empty() {
                return Err(invalid("sync pattern must not be empty"));
            }
            if !matches!(length.width, 1 | 2 | 4) {
                return Err(invalid("length field width must be 1, 2 or 4 bytes"));
            }
            if min_length < sync.len().max(length.offset + length.width) {
                return Err(invalid("min_length must cover the sync pattern and length field"));
            }
            if max_resync == 0 {
                return Err(invalid("max_resync must be positive"));
            }
            if wrapper == WrapperKind::Controller {
                return Err(invalid("binary framing supports the controller_hex wrapper only"));
            }
            Ok(Framing::Binary {
                sync,
                length,
                min_length,
                max_resync,
                wrapper,
            })
        }
        FramingConfig::Lines {
            terminator,
            wrapper,
        } => {
            if terminator.is_empty() {
                return Err(invalid("line terminator must not be empty"));
            }
            if wrapper == WrapperKind::ControllerHex {
                return Err(invalid("line framing does not carry hex payloads"));
            }
            Ok(Framing::Lines {
                terminator: terminator.into_bytes(),
                wrapper,
            })
        }
    }
}

fn compile_layout(
    id: &str,
    layout: BinaryLayoutConfig,
    checksum: ChecksumConfig,
    ranges: &mut RangeTable,
    names: &mut DeclaredNames,
) -> Result<BinaryLayout, ConfigError> {
    if let ChecksumConfig::ModularSum { width, .. } = &checksum {
        if !matches!(width, 1 | 2 | 4) {
            return Err(ConfigError::InvalidFraming {
                instrument: id.to_string(),
                message: "checksum width must be 1, 2 or 4 bytes".to_string(),
            });
        }
    }

    let mut seen = HashSet::new();
    let mut header = Vec::with_capacity(layout.header.len());
    for field in layout.header {
        let spec = compile_binary_field(id, field, ranges, &mut seen)?;
        check_count_reference(id, &spec, names)?;
        names.declare(&spec, false);
        header.push(spec);
    }

    let index = match layout.index {
        SubRecordIndexConfig::OffsetTable {
            count_offset,
            count_width,
            table_offset,
            id_width,
        } => {
            check_width(id, "sub-record count", count_width)?;
            check_width(id, "sub-record id", id_width)?;
            SubRecordIndex::OffsetTable {
                count_offset,
                count_width,
                table_offset,
                id_width,
            }
        }
        SubRecordIndexConfig::Sequential {
            start,
            count_field,
            id_width,
            length_width,
        } => {
            check_width(id, "sub-record id", id_width)?;
            check_width(id, "sub-record length", length_width)?;
            if !names.integer.contains(&count_field) {
                return Err(ConfigError::UnknownReference {
                    instrument: id.to_string(),
                    field: "index.count_field".to_string(),
                    reference: count_field,
                });
            }
            SubRecordIndex::Sequential {
                start,
                count_field,
                id_width,
                length_width,
            }
        }
    };

    let blocks = compile_blocks(id, layout.blocks, ranges, names, &mut seen)?;
    Ok(BinaryLayout {
        endian: layout.endian,
        index,
        ignore_unknown: layout.ignore_unknown,
        header,
        blocks,
        checksum,
    })
}

fn compile_blocks(
    id: &str,
    blocks: Vec<config::BlockConfig>,
    ranges: &mut RangeTable,
    names: &mut DeclaredNames,
    seen: &mut HashSet<String>,
) -> Result<BTreeMap<u64, BlockSpec>, ConfigError> {
    // Declare every block before checking counts; a count may name a field
    // of another block.
    let mut compiled = BTreeMap::new();
    for block in blocks {
        if compiled.contains_key(&block.type_id) {
            return Err(ConfigError::InvalidFraming {
                instrument: id.to_string(),
                message: format!("sub-record type {} declared twice", block.type_id),
            });
        }
        let mut fields = Vec::with_capacity(block.fields.len());
        for field in block.fields {
            let spec = compile_binary_field(id, field, ranges, seen)?;
            names.declare(&spec, block.numbered);
            fields.push(spec);
        }
        compiled.insert(
            block.type_id,
            BlockSpec {
                type_id: block.type_id,
                name: block.name,
                numbered: block.numbered,
                fields,
            },
        );
    }
    for block in compiled.values() {
        for spec in &block.fields {
            check_block_count_reference(id, spec, block, names)?;
        }
    }
    Ok(compiled)
}

fn check_width(id: &str, what: &str, width: usize) -> Result<(), ConfigError> {
    if matches!(width, 1 | 2 | 4 | 8) {
        Ok(())
    } else {
        Err(ConfigError::InvalidFraming {
            instrument: id.to_string(),
            message: format!("{what} width must be 1, 2, 4 or 8 bytes"),
        })
    }
}

fn compile_binary_field(
    id: &str,
    field: FieldConfig,
    ranges: &mut RangeTable,
    seen: &mut HashSet<String>,
) -> Result<FieldSpec, ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidField {
        instrument: id.to_string(),
        field: field.name.clone(),
        message: message.to_string(),
    };
    if !field.ty.is_binary() {
        return Err(invalid("binary layouts need a fixed-width type"));
    }
    let offset = field.offset.ok_or_else(|| invalid("missing byte offset"))?;
    if field.group.is_some() {
        return Err(invalid("capture groups apply to grammars only"));
    }
    if (field.mask.is_some() || field.labels.is_some()) && !field.ty.is_integer() {
        return Err(invalid("masks and labels need an integer type"));
    }
    if field.mask == Some(0) {
        return Err(invalid("mask must select at least one bit"));
    }
    if let Some(beams) = field.deinterleave {
        if beams == 0 || field.count.is_none() {
            return Err(invalid("deinterleave needs an array count and at least one beam"));
        }
    }
    if field.labels.is_some() && (field.scale.is_some() || field.count.is_some()) {
        return Err(invalid("labelled fields cannot be scaled or repeated"));
    }
    register_name(id, &field.name, seen)?;
    register_range(id, &field, ranges)?;

    let count = field.count.map(|count| match count {
        CountConfig::Fixed(n) => Count::Fixed(n),
        CountConfig::Field { field, times } => Count::Field { name: field, times },
    });

    Ok(FieldSpec {
        name: field.name,
        ty: field.ty,
        offset,
        count,
        mask: field.mask,
        scale: field.scale,
        add: field.add,
        missing: field.missing,
        deinterleave: field.deinterleave,
        labels: field.labels,
    })
}

fn check_count_reference(
    id: &str,
    spec: &FieldSpec,
    names: &DeclaredNames,
) -> Result<(), ConfigError> {
    match &spec.count {
        Some(Count::Field { name, .. }) if !names.integer.contains(name) => {
            Err(ConfigError::UnknownReference {
                instrument: id.to_string(),
                field: spec.name.clone(),
                reference: name.clone(),
            })
        }
        _ => Ok(()),
    }
}

fn check_block_count_reference(
    id: &str,
    spec: &FieldSpec,
    block: &BlockSpec,
    names: &DeclaredNames,
) -> Result<(), ConfigError> {
    if let Some(Count::Field { name, .. }) = &spec.count {
        let local = block
            .fields
            .iter()
            .any(|other| &other.name == name && other.ty.is_integer() && other.count.is_none());
        if !local && !names.integer.contains(name) {
            return Err(ConfigError::UnknownReference {
                instrument: id.to_string(),
                field: spec.name.clone(),
                reference: name.clone(),
            });
        }
    }
    Ok(())
}

fn register_name(id: &str, name: &str, seen: &mut HashSet<String>) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::InvalidField {
            instrument: id.to_string(),
            field: name.to_string(),
            message: "field name must not be empty".to_string(),
        });
    }
    if crate::particle::RESERVED_KEYS.contains(&name) {
        return Err(ConfigError::InvalidField {
            instrument: id.to_string(),
            field: name.to_string(),
            message: "name is reserved for particle metadata".to_string(),
        });
    }
    if !seen.insert(name.to_string()) {
        return Err(ConfigError::DuplicateField {
            instrument: id.to_string(),
            field: name.to_string(),
        });
    }
    Ok(())
}

fn register_range(id: &str, field: &FieldConfig, ranges: &mut RangeTable) -> Result<(), ConfigError> {
    if let Some([min, max]) = field.range {
        if !min.is_finite() || !max.is_finite() || min > max {
            return Err(ConfigError::InvalidField {
                instrument: id.to_string(),
                field: field.name.clone(),
                message: format!("invalid range [{min}, {max}]"),
            });
        }
        ranges.insert(&field.name, min, max);
    }
    Ok(())
}

fn compile_grammar(
    id: &str,
    grammar: GrammarConfig,
    ranges: &mut RangeTable,
    names: &mut DeclaredNames,
) -> Result<Grammar, ConfigError> {
    let invalid_pattern = |err: regex::Error| ConfigError::InvalidPattern {
        instrument: id.to_string(),
        message: err.to_string(),
    };
    let pattern = Regex::new(&grammar.pattern).map_err(invalid_pattern)?;
    let metadata = grammar
        .metadata
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(invalid_pattern)?;
    let groups: HashSet<&str> = pattern.capture_names().flatten().collect();

    let mut seen = HashSet::new();
    let mut fields = Vec::with_capacity(grammar.fields.len());
    for field in grammar.fields {
        let invalid = |message: &str| ConfigError::InvalidField {
            instrument: id.to_string(),
            field: field.name.clone(),
            message: message.to_string(),
        };
        if field.ty.is_binary() {
            return Err(invalid("grammar fields use int, float, hex_int, text or enum"));
        }
        if field.offset.is_some() || field.count.is_some() || field.deinterleave.is_some() {
            return Err(invalid("byte layout options apply to binary layouts only"));
        }
        if field.ty == FieldType::Enum && field.labels.as_ref().is_none_or(|l| l.is_empty()) {
            return Err(invalid("enum fields need a non-empty label list"));
        }
        let group = field.group.clone().unwrap_or_else(|| field.name.clone());
        if !groups.contains(group.as_str()) {
            return Err(ConfigError::UnknownReference {
                instrument: id.to_string(),
                field: field.name.clone(),
                reference: group,
            });
        }
        register_name(id, &field.name, &mut seen)?;
        register_range(id, &field, ranges)?;
        let spec = GrammarField {
            name: field.name,
            ty: field.ty,
            group,
            scale: field.scale,
            add: field.add,
            labels: field.labels,
        };
        names.exact.insert(spec.name.clone());
        if matches!(spec.ty, FieldType::Int | FieldType::HexInt) && spec.scale.is_none() {
            names.integer.insert(spec.name.clone());
        }
        fields.push(spec);
    }

    Ok(Grammar {
        pattern,
        metadata,
        fields,
    })
}

fn compile_clock(id: &str, clock: ClockConfig, names: &DeclaredNames) -> Result<Clock, ConfigError> {
    let require = |field: &str| {
        if names.knows(field) {
            Ok(())
        } else {
            Err(ConfigError::InvalidClock {
                instrument: id.to_string(),
                message: format!("unknown clock field '{field}'"),
            })
        }
    };
    match clock {
        ClockConfig::Calendar {
            year,
            month,
            day,
            hour,
            minute,
            second,
            hundredths,
            year_base,
        } => {
            for field in [&year, &month, &day, &hour, &minute, &second] {
                require(field)?;
            }
            if let Some(field) = &hundredths {
                require(field)?;
            }
            Ok(Clock::Calendar {
                year,
                month,
                day,
                hour,
                minute,
                second,
                hundredths,
                year_base,
            })
        }
        ClockConfig::Counter { field, epoch } => {
            require(&field)?;
            Ok(Clock::Counter { field, epoch })
        }
        ClockConfig::Text { field, format } => {
            require(&field)?;
            let format = time::format_description::parse_owned::<1>(&format).map_err(|err| {
                ConfigError::InvalidClock {
                    instrument: id.to_string(),
                    message: err.to_string(),
                }
            })?;
            Ok(Clock::Text { field, format })
        }
    }
}

fn compile_echogram(
    id: &str,
    echogram: EchogramConfig,
    names: &DeclaredNames,
) -> Result<EchogramSettings, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidEchogram {
        instrument: id.to_string(),
        message,
    };
    if echogram.depth_bins == 0 {
        return Err(invalid("depth_bins must be positive".to_string()));
    }
    if echogram.resolution_s.is_nan()
        || echogram.resolution_s <= 0.0
        || echogram.bucket_s < echogram.resolution_s
    {
        return Err(invalid(
            "resolution_s must be positive and no larger than bucket_s".to_string(),
        ));
    }
    let [lower, upper] = echogram.percentiles;
    if !(0.0..=100.0).contains(&lower) || !(0.0..=100.0).contains(&upper) || lower >= upper {
        return Err(invalid(format!("invalid percentile bounds [{lower}, {upper}]")));
    }
    if echogram.channels.is_empty() {
        return Err(invalid("at least one channel is required".to_string()));
    }

    let mut channels = Vec::with_capacity(echogram.channels.len());
    for channel in echogram.channels {
        if !names.knows(&channel.amplitude_field) {
            return Err(invalid(format!(
                "unknown amplitude field '{}'",
                channel.amplitude_field
            )));
        }
        let frequency = match (channel.frequency, channel.frequency_field) {
            (Some(freq), None) => FrequencySource::Fixed(freq),
            (None, Some(field)) if names.knows(&field) => FrequencySource::Field(field),
            (None, Some(field)) => {
                return Err(invalid(format!("unknown frequency field '{field}'")));
            }
            _ => {
                return Err(invalid(
                    "each channel needs exactly one of frequency or frequency_field".to_string(),
                ));
            }
        };
        channels.push(ChannelSpec {
            frequency,
            amplitude_field: channel.amplitude_field,
        });
    }

    let mut frequencies = echogram.frequencies;
    frequencies.extend(channels.iter().filter_map(|channel| match channel.frequency {
        FrequencySource::Fixed(freq) => Some(freq),
        FrequencySource::Field(_) => None,
    }));
    frequencies.sort_unstable();
    frequencies.dedup();

    Ok(EchogramSettings {
        depth_bins: echogram.depth_bins,
        depth_range: (echogram.depth_range[0], echogram.depth_range[1]),
        resolution_s: echogram.resolution_s,
        bucket_s: echogram.bucket_s,
        lower_percentile: lower,
        upper_percentile: upper,
        frequencies,
        channels,
    })
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::{ConfigError, Family, Framing, InstrumentConfig, SchemaTable, SubRecordIndex};

    fn instruments_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("instruments")
    }

    fn load(name: &str) -> InstrumentConfig {
        let path = instruments_dir().join(name);
        let text = std::fs::read_to_string(&path).expect("read instrument");
        InstrumentConfig::from_toml_str(&text).expect("parse instrument")
    }

    fn compile(config: &str) -> Result<SchemaTable, ConfigError> {
        SchemaTable::compile(vec![InstrumentConfig::from_toml_str(config)?])
    }

    const LINES: &str = r#"
id = "lines"
stream = "lines_sample"

[framing]
kind = "lines"

[grammar]
pattern = '^(?P<value>\d+)$'
fields = [{ name = "value", type = "int" }]
"#;

    #[test]
    fn bundled_instruments_compile() {
        let table = SchemaTable::compile(vec![
            load("adcp_pd0.toml"),
            load("zplsc_profile.toml"),
            load("ctdbp_dcl.toml"),
        ])
        .expect("compile");
        assert_eq!(table.len(), 3);

        let adcp = table.get("adcp_pd0").unwrap();
        let Family::Binary(layout) = &adcp.family else {
            panic!("binary layout expected");
        };
        assert!(matches!(layout.index, SubRecordIndex::OffsetTable { table_offset: 6, .. }));
        assert!(layout.blocks.contains_key(&0x0100));
        assert_eq!(adcp.ranges.lookup("velocity_beam3"), None);
        assert_eq!(adcp.ranges.lookup("temperature"), Some((-5.0, 40.0)));
        let earth = adcp
            .streams
            .iter()
            .find(|stream| stream.name == "adcp_velocity_earth")
            .expect("earth velocity stream");
        assert!(earth.carries("velocity_beam3"));
        assert!(earth.carries("ensemble_number"));
        assert!(!earth.carries("heading"));
        assert!(earth.anchored_by("echo_intensity_beam1"));
        assert!(!earth.anchored_by("ensemble_number"));
        assert!(adcp.stream_names().any(|name| name == "adcp_bottom_track_earth"));

        let zplsc = table.get("zplsc_profile").unwrap();
        let echogram = zplsc.echogram.as_ref().expect("echogram settings");
        assert_eq!(echogram.frequencies, vec![38, 125, 200, 455]);
        assert_eq!(echogram.slots_per_bucket(), 1440);

        let ctd = table.get("ctdbp_dcl").unwrap();
        assert_eq!(ctd.stream_names().collect::<Vec<_>>(), ["ctdbp_dcl_instrument"]);
        assert!(ctd.streams[0].dedupe);
        assert!(ctd.streams[0].carries("conductivity"));
        assert!(matches!(ctd.framing, Framing::Lines { .. }));
    }

    const SPLIT: &str = r#"
id = "lines"

[[streams]]
name = "lines_value"
fields = ["value"]
dedupe = true

[[streams]]
name = "lines_kind"
fields = ["kind"]
when = { field = "kind", one_of = ["a"] }

[framing]
kind = "lines"

[grammar]
pattern = '^(?P<value>\d+),(?P<kind>\w)$'
fields = [
    { name = "value", type = "int" },
    { name = "kind", type = "text" },
]
"#;

    #[test]
    fn streams_compile_in_declaration_order() {
        let table = compile(SPLIT).unwrap();
        let lines = table.get("lines").unwrap();
        assert_eq!(lines.stream_names().collect::<Vec<_>>(), ["lines_value", "lines_kind"]);
        assert!(lines.streams[0].dedupe);
        assert!(!lines.streams[0].carries("kind"));
        assert!(!lines.streams[0].needs_anchor());
        let when = lines.streams[1].when.as_ref().unwrap();
        assert_eq!(when.one_of, ["a"]);
    }

    #[test]
    fn stream_with_unknown_field_is_rejected() {
        let config = SPLIT.replace(r#"fields = ["kind"]"#, r#"fields = ["colour"]"#);
        assert!(matches!(
            compile(&config),
            Err(ConfigError::UnknownReference { reference, .. }) if reference == "colour"
        ));
    }

    #[test]
    fn stream_with_unknown_block_is_rejected() {
        let config = SPLIT.replace(r#"fields = ["kind"]"#, r#"blocks = ["velocity"]"#);
        assert!(matches!(
            compile(&config),
            Err(ConfigError::UnknownReference { reference, .. }) if reference == "velocity"
        ));
    }

    #[test]
    fn single_stream_and_stream_list_are_exclusive() {
        let config = format!("stream = \"lines_sample\"\n{SPLIT}");
        assert!(matches!(compile(&config), Err(ConfigError::InvalidFraming { .. })));

        let duplicate = SPLIT.replace("lines_kind", "lines_value");
        assert!(matches!(compile(&duplicate), Err(ConfigError::InvalidStream { .. })));

        let unnamed = LINES.replace("stream = \"lines_sample\"\n", "");
        assert!(matches!(compile(&unnamed), Err(ConfigError::InvalidFraming { .. })));
    }

    #[test]
    fn unknown_instrument_lookup_fails() {
        let table = compile(LINES).unwrap();
        assert_eq!(
            table.get("nope").unwrap_err(),
            ConfigError::UnknownInstrument { id: "nope".to_string() }
        );
    }

    #[test]
    fn duplicate_instrument_is_rejected() {
        let config = InstrumentConfig::from_toml_str(LINES).unwrap();
        let err = SchemaTable::compile(vec![config.clone(), config]).unwrap_err();
        assert_eq!(err, ConfigError::DuplicateInstrument { id: "lines".to_string() });
    }

    #[test]
    fn unknown_capture_group_is_rejected() {
        let config = LINES.replace(r#"type = "int" }"#, r#"type = "int", group = "missing" }"#);
        assert!(matches!(
            compile(&config),
            Err(ConfigError::UnknownReference { reference, .. }) if reference == "missing"
        ));
    }

    #[test]
    fn reserved_field_name_is_rejected() {
        let config = LINES.replace(
            r#"fields = [{ name = "value", type = "int" }]"#,
            r#"fields = [{ name = "quality_flag", type = "int", group = "value" }]"#,
        );
        assert!(matches!(compile(&config), Err(ConfigError::InvalidField { .. })));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let config = LINES.replace(r#"type = "int" }"#, r#"type = "int", range = [5.0, 1.0] }"#);
        assert!(matches!(compile(&config), Err(ConfigError::InvalidField { .. })));
    }

    #[test]
    fn grammar_on_binary_framing_is_missing_schema() {
        let config = LINES.replace(
            r#"kind = "lines""#,
            "kind = \"binary\"\nsync = [0xAA]\nlength = { offset = 1, width = 1 }\nmin_length = 2",
        );
        assert_eq!(
            compile(&config).unwrap_err(),
            ConfigError::MissingSchema { instrument: "lines".to_string() }
        );
    }

    #[test]
    fn dangling_count_reference_is_rejected() {
        let config = r#"
id = "bin"
stream = "bin_sample"

[framing]
kind = "binary"
sync = [0xAA]
length = { offset = 1, width = 1 }
min_length = 2

[layout]
index = { kind = "offset_table", count_offset = 2, table_offset = 3 }

[[layout.blocks]]
type_id = 1
name = "profile"
fields = [{ name = "bins", type = "u16", offset = 2, count = { field = "num_bins" } }]
"#;
        assert!(matches!(
            compile(config),
            Err(ConfigError::UnknownReference { reference, .. }) if reference == "num_bins"
        ));
    }

    #[test]
    fn bad_clock_format_is_rejected() {
        let config = format!(
            "{LINES}\n[clock]\nkind = \"text\"\nfield = \"value\"\nformat = \"[not_a_component]\"\n"
        );
        assert!(matches!(compile(&config), Err(ConfigError::InvalidClock { .. })));
    }

    #[test]
    fn malformed_toml_is_reported() {
        assert!(matches!(
            InstrumentConfig::from_toml_str("id = "),
            Err(ConfigError::Toml { .. })
        ));
    }
}
