//! Echogram rendering contract and the bundled PNG renderer.

use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::EchogramMatrix;

/// Maps a finished matrix to pixels, one pixel per cell.
pub trait EchogramRenderer {
    fn render(&self, matrix: &EchogramMatrix) -> RgbImage;
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("echogram has no cells to render")]
    Empty,
    #[error("failed to write {path}: {message}")]
    Write { path: PathBuf, message: String },
}

/// Sidecar record written next to each image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchogramMetadata {
    pub instrument_id: String,
    pub frequency_id: u32,
    /// RFC 3339.
    pub start_time: String,
    /// RFC 3339.
    pub end_time: String,
    pub depth_range: [f64; 2],
    pub resolution_s: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contrast_window: Option<[f64; 2]>,
}

impl EchogramMetadata {
    pub fn for_matrix(instrument_id: &str, matrix: &EchogramMatrix) -> Self {
        Self {
            instrument_id: instrument_id.to_string(),
            frequency_id: matrix.frequency_id,
            start_time: matrix.range.start.to_rfc3339().unwrap_or_default(),
            end_time: matrix.range.end.to_rfc3339().unwrap_or_default(),
            depth_range: [matrix.depth_range.0, matrix.depth_range.1],
            resolution_s: matrix.resolution_s,
            contrast_window: matrix.window.map(|window| [window.low, window.high]),
        }
    }
}

/// Jet colour ramp with a flat colour for empty cells.
#[derive(Debug, Clone, Copy)]
pub struct PngRenderer {
    pub no_data: Rgb<u8>,
}

impl Default for PngRenderer {
    fn default() -> Self {
        Self {
            no_data: Rgb([255, 255, 255]),
        }
    }
}

impl PngRenderer {
    /// Render `matrix` and save it as PNG.
    ///
    /// # Errors
    /// `RenderError::Empty` for a zero-sized matrix, `RenderError::Write`
    /// when the image cannot be encoded or written.
    pub fn write_png(&self, matrix: &EchogramMatrix, path: &Path) -> Result<(), RenderError> {
        if matrix.rows() == 0 || matrix.columns() == 0 {
            return Err(RenderError::Empty);
        }
        self.render(matrix)
            .save_with_format(path, image::ImageFormat::Png)
            .map_err(|err| RenderError::Write {
                path: path.to_path_buf(),
                message: err.to_string(),
            })
    }
}

impl EchogramRenderer for PngRenderer {
    fn render(&self, matrix: &EchogramMatrix) -> RgbImage {
        let mut img = RgbImage::from_pixel(
            matrix.columns() as u32,
            matrix.rows() as u32,
            self.no_data,
        );
        for row in 0..matrix.rows() {
            for column in 0..matrix.columns() {
                if let Some(level) = matrix.normalized(row, column) {
                    img.put_pixel(column as u32, row as u32, jet(level));
                }
            }
        }
        img
    }
}

/// Jet ramp: dark blue, blue, cyan, yellow, red, dark red.
pub fn jet(level: f64) -> Rgb<u8> {
    let v = level.clamp(0.0, 1.0);
    let channel = |center: f64| {
        let intensity = (1.5 - (4.0 * v - center).abs()).clamp(0.0, 1.0);
        (intensity * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

#[cfg(test)]
mod tests {
    use super::jet;
    use image::Rgb;

    #[test]
    fn jet_endpoints() {
        assert_eq!(jet(0.0), Rgb([0, 0, 128]));
        assert_eq!(jet(0.5), Rgb([128, 255, 128]));
        assert_eq!(jet(1.0), Rgb([128, 0, 0]));
        assert_eq!(jet(-3.0), jet(0.0));
    }
}
