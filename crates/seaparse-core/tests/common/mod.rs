#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use seaparse_core::{CompiledInstrument, InputBuffer, InstrumentConfig, ParserEngine, SchemaTable};

pub const PD0_CELLS: usize = 4;
pub const PD0_LEN: usize = 172;

pub fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

pub fn instrument_text(name: &str) -> String {
    let path = repo_root().join("instruments").join(format!("{name}.toml"));
    fs::read_to_string(&path).expect("read instrument")
}

pub fn table_from(texts: &[String]) -> SchemaTable {
    let configs = texts
        .iter()
        .map(|text| InstrumentConfig::from_toml_str(text).expect("parse instrument"))
        .collect();
    SchemaTable::compile(configs).expect("compile instruments")
}

/// Every bundled instrument.
pub fn bundled() -> SchemaTable {
    table_from(&[
        instrument_text("adcp_pd0"),
        instrument_text("zplsc_profile"),
        instrument_text("ctdbp_dcl"),
    ])
}

pub fn engine<'s>(instrument: &'s CompiledInstrument, bytes: &[u8]) -> ParserEngine<'s> {
    let input = InputBuffer::from_bytes(bytes.to_vec(), instrument.framing.wrapper());
    ParserEngine::new(instrument, input, "test.dat")
}

fn sum16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

/// Coordinate transform byte selecting earth coordinates with tilts applied.
pub const PD0_EARTH: u8 = 0x1F;
/// Coordinate transform byte selecting beam coordinates.
pub const PD0_BEAM: u8 = 0x00;

/// One PD0 ensemble: fixed leader, variable leader and velocity, 172 bytes,
/// in earth coordinates.
///
/// Velocities run 100, 101, ... in cell-major order; the last beam of the
/// last cell is the bad-velocity sentinel.
pub fn pd0_ensemble(ensemble: u16, minute: u8) -> Vec<u8> {
    let out = pd0_build(ensemble, minute, PD0_EARTH, false);
    assert_eq!(out.len(), PD0_LEN);
    out
}

/// A PD0 ensemble that also carries a bottom-track block.
///
/// Ranges are 12.00, 12.10, 11.90 and 12.05 m; the fourth beam velocity is
/// the bad-velocity sentinel.
pub fn pd0_bottom_track_ensemble(ensemble: u16, minute: u8, transform: u8) -> Vec<u8> {
    pd0_build(ensemble, minute, transform, true)
}

fn pd0_build(ensemble: u16, minute: u8, transform: u8, bottom_track: bool) -> Vec<u8> {
    let mut fixed = vec![0u8; 59];
    fixed[2] = 51;
    fixed[3] = 40;
    // 300 kHz, convex, up-facing, 20 degree beams
    fixed[4..6].copy_from_slice(&0x018Au16.to_le_bytes());
    fixed[8] = 4;
    fixed[9] = PD0_CELLS as u8;
    fixed[10..12].copy_from_slice(&1u16.to_le_bytes());
    fixed[12..14].copy_from_slice(&400u16.to_le_bytes());
    fixed[14..16].copy_from_slice(&176u16.to_le_bytes());
    fixed[25] = transform;
    fixed[32..34].copy_from_slice(&600u16.to_le_bytes());

    let mut variable = vec![0u8; 65];
    variable[0..2].copy_from_slice(&0x0080u16.to_le_bytes());
    variable[2..4].copy_from_slice(&ensemble.to_le_bytes());
    variable[4..11].copy_from_slice(&[14, 8, 17, 0, minute, 7, 50]);
    variable[14..16].copy_from_slice(&1500u16.to_le_bytes());
    variable[18..20].copy_from_slice(&9000u16.to_le_bytes());
    variable[20..22].copy_from_slice(&(-150i16).to_le_bytes());
    variable[22..24].copy_from_slice(&200i16.to_le_bytes());
    variable[24..26].copy_from_slice(&35u16.to_le_bytes());
    variable[26..28].copy_from_slice(&1234i16.to_le_bytes());

    let mut velocity = 0x0100u16.to_le_bytes().to_vec();
    let samples = PD0_CELLS * 4;
    for idx in 0..samples {
        let value = if idx == samples - 1 {
            i16::MIN
        } else {
            100 + idx as i16
        };
        velocity.extend_from_slice(&value.to_le_bytes());
    }

    let mut blocks = vec![fixed, variable, velocity];
    if bottom_track {
        blocks.push(pd0_bottom_track());
    }

    let header_len = 6 + 2 * blocks.len();
    let mut out = vec![0x7F, 0x7F, 0, 0, 0, blocks.len() as u8];
    let mut offset = header_len;
    for block in &blocks {
        out.extend_from_slice(&(offset as u16).to_le_bytes());
        offset += block.len();
    }
    for block in &blocks {
        out.extend_from_slice(block);
    }
    let num_bytes = out.len() as u16;
    out[2..4].copy_from_slice(&num_bytes.to_le_bytes());
    let checksum = sum16(&out);
    out.extend_from_slice(&checksum.to_le_bytes());
    out
}

fn pd0_bottom_track() -> Vec<u8> {
    let mut block = vec![0u8; 85];
    block[0..2].copy_from_slice(&0x0600u16.to_le_bytes());
    block[2..4].copy_from_slice(&10u16.to_le_bytes());
    block[6] = 220;
    block[7] = 1;
    block[9] = 5;
    block[10..12].copy_from_slice(&1000u16.to_le_bytes());
    for (beam, range) in [1200u16, 1210, 1190, 1205].into_iter().enumerate() {
        block[16 + 2 * beam..18 + 2 * beam].copy_from_slice(&range.to_le_bytes());
    }
    for (beam, velocity) in [-12i16, 8, 3, i16::MIN].into_iter().enumerate() {
        block[24 + 2 * beam..26 + 2 * beam].copy_from_slice(&velocity.to_le_bytes());
    }
    block[32..36].fill(230);
    block[40..44].fill(100);
    block[70..72].copy_from_slice(&2000u16.to_le_bytes());
    block[76] = 1;
    block
}

pub fn pd0_file(ensembles: u16) -> Vec<u8> {
    (1..=ensembles)
        .flat_map(|n| pd0_ensemble(n, n as u8))
        .collect()
}

/// Calendar fields of a profiler record: year, month, day, hour, minute,
/// second, hundredths.
pub type ProfilerTime = [u16; 7];

/// One profiler burst; each channel is a frequency in kHz and raw
/// amplitudes in hundredths of a dB.
pub fn zplsc_record(burst: u16, time: ProfilerTime, channels: &[(u16, &[u16])]) -> Vec<u8> {
    let mut out = vec![0xFD, 0x02, 0, 0];
    out.extend_from_slice(&burst.to_be_bytes());
    out.extend_from_slice(&0x0123u16.to_be_bytes());
    for part in time {
        out.extend_from_slice(&part.to_be_bytes());
    }
    out.extend_from_slice(&0i16.to_be_bytes());
    out.extend_from_slice(&0i16.to_be_bytes());
    out.extend_from_slice(&1500i16.to_be_bytes());
    out.push(channels.len() as u8);
    out.push(0);
    for (frequency, amplitudes) in channels {
        out.push(1);
        let payload_len = 4 + 2 * amplitudes.len();
        out.extend_from_slice(&(payload_len as u16).to_be_bytes());
        out.extend_from_slice(&frequency.to_be_bytes());
        out.extend_from_slice(&(amplitudes.len() as u16).to_be_bytes());
        for amplitude in *amplitudes {
            out.extend_from_slice(&amplitude.to_be_bytes());
        }
    }
    let total = (out.len() + 2) as u16;
    out[2..4].copy_from_slice(&total.to_be_bytes());
    let checksum = sum16(&out);
    out.extend_from_slice(&checksum.to_be_bytes());
    out
}
