/// Width of one entry in an offset-table sub-record index.
pub const OFFSET_ENTRY_WIDTH: usize = 2;

/// Field name reported when a sub-record type id has no declared block.
pub const SUB_RECORD_TYPE_FIELD: &str = "sub_record_type";
