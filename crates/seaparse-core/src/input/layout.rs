/// Width of the controller clock prefix `YYYY/MM/DD HH:MM:SS.mmm`.
pub const CONTROLLER_STAMP_LEN: usize = 23;

pub const HEX_LINE_PATTERN: &str = r"^(?P<stamp>\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}\.\d{3}) (?:\[[^\]]*\]:)?(?P<hex>[0-9A-Fa-f]*)\s*$";
