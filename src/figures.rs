//! Diagnosis figure rendering
//!
//! Renders slice mosaics, map overlays, grayplots and timecourse traces into
//! RGB pixel buffers and writes them out as PNG. Panels carry no text; row
//! order is documented on each panel function and kept stable so figures are
//! comparable across runs.

use std::path::Path;

use ndarray::Array2;

use crate::error::{DiagnosisError, Result};
use crate::nifti_io::VolumeGeometry;

/// Number of axial slices shown per mosaic row.
const MOSAIC_SLICES: usize = 6;
/// Fraction of the maximum absolute value below which overlay voxels are
/// left transparent.
const OVERLAY_THRESHOLD: f64 = 0.2;
/// Pixel height of one timecourse trace row.
const TRACE_HEIGHT: usize = 40;
/// Blank pixels between panel rows.
const ROW_GAP: usize = 2;

/// RGB8 drawing surface.
pub struct Canvas {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl Canvas {
    pub fn new(width: usize, height: usize) -> Canvas {
        Canvas {
            width,
            height,
            pixels: vec![0u8; width * height * 3],
        }
    }

    pub fn set_pixel(&mut self, x: usize, y: usize, rgb: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let offset = (y * self.width + x) * 3;
        self.pixels[offset..offset + 3].copy_from_slice(&rgb);
    }

    /// Bresenham line segment.
    pub fn draw_line(&mut self, x0: i64, y0: i64, x1: i64, y1: i64, rgb: [u8; 3]) {
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        let (mut x, mut y) = (x0, y0);
        loop {
            if x >= 0 && y >= 0 {
                self.set_pixel(x as usize, y as usize, rgb);
            }
            if x == x1 && y == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    /// Copy another canvas in at (x, y).
    pub fn blit(&mut self, src: &Canvas, x: usize, y: usize) {
        for row in 0..src.height {
            for col in 0..src.width {
                let offset = (row * src.width + col) * 3;
                let rgb = [
                    src.pixels[offset],
                    src.pixels[offset + 1],
                    src.pixels[offset + 2],
                ];
                self.set_pixel(x + col, y + row, rgb);
            }
        }
    }
}

/// Write a canvas as an 8-bit RGB PNG.
pub fn save_png(path: &Path, canvas: &Canvas) -> Result<()> {
    use std::fs::File;
    use std::io::BufWriter;

    let file = File::create(path).map_err(|e| {
        DiagnosisError::Figure(format!("failed to create '{}': {}", path.display(), e))
    })?;
    let writer = BufWriter::new(file);
    let mut encoder = png::Encoder::new(writer, canvas.width as u32, canvas.height as u32);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let mut png_writer = encoder
        .write_header()
        .map_err(|e| DiagnosisError::Figure(format!("failed to write PNG header: {}", e)))?;
    png_writer
        .write_image_data(&canvas.pixels)
        .map_err(|e| DiagnosisError::Figure(format!("failed to write PNG data: {}", e)))?;
    Ok(())
}

/// Scatter masked values back into a full-volume buffer (zeros elsewhere).
pub fn unmask(values: &[f64], indices: &[usize], n_voxels: usize) -> Vec<f64> {
    let mut out = vec![0.0; n_voxels];
    for (&i, &v) in indices.iter().zip(values.iter()) {
        out[i] = v;
    }
    out
}

/// A row-major 2-D grid of raw values cut from a volume.
pub struct SliceMosaic {
    pub width: usize,
    pub height: usize,
    pub values: Vec<f64>,
}

/// Cut evenly spaced axial slices out of a full-volume buffer and lay them
/// side by side.
pub fn slice_mosaic(data: &[f64], geom: &VolumeGeometry, n_slices: usize) -> SliceMosaic {
    let (nx, ny, nz) = geom.dims;
    let n_slices = n_slices.min(nz).max(1);
    let width = nx * n_slices;
    let height = ny;
    let mut values = vec![0.0; width * height];
    for s in 0..n_slices {
        // Interior slices: skip the extremes of the z range.
        let z = (s + 1) * nz / (n_slices + 1);
        for y in 0..ny {
            for x in 0..nx {
                values[y * width + s * nx + x] = data[geom.index(x, y, z)];
            }
        }
    }
    SliceMosaic {
        width,
        height,
        values,
    }
}

fn gray(v: f64) -> [u8; 3] {
    let g = (v.clamp(0.0, 1.0) * 255.0) as u8;
    [g, g, g]
}

/// Signed colormap: negative values cool (blue), positive warm (red-yellow),
/// `v` in [-1, 1].
fn signed_color(v: f64) -> [u8; 3] {
    let v = v.clamp(-1.0, 1.0);
    if v >= 0.0 {
        let r = 128.0 + 127.0 * v;
        let g = 255.0 * v * v;
        [r as u8, g as u8, 0]
    } else {
        let b = 128.0 - 127.0 * v;
        let g = 255.0 * v * v;
        [0, g as u8, b as u8]
    }
}

/// Render a map on top of a scaled background mosaic. Overlay voxels below
/// `OVERLAY_THRESHOLD` of the maximum absolute value stay transparent; NaNs
/// are transparent too.
fn render_overlay(background: &SliceMosaic, overlay: Option<&SliceMosaic>) -> Canvas {
    let mut canvas = Canvas::new(background.width, background.height);
    let max_abs = overlay
        .map(|o| {
            o.values
                .iter()
                .filter(|v| !v.is_nan())
                .fold(0.0f64, |a, &b| a.max(b.abs()))
        })
        .unwrap_or(0.0);

    for y in 0..background.height {
        for x in 0..background.width {
            let i = y * background.width + x;
            let mut rgb = gray(background.values[i]);
            if let Some(o) = overlay {
                let v = o.values[i];
                if max_abs > 0.0 && !v.is_nan() && v.abs() >= OVERLAY_THRESHOLD * max_abs {
                    rgb = signed_color(v / max_abs);
                }
            }
            canvas.set_pixel(x, y, rgb);
        }
    }
    canvas
}

/// Stack one background row plus one overlaid mosaic row per map into a
/// single panel. Used for the per-scan spatial panel, the cross-correlation
/// panel and the per-prior QC panels; row order follows the input order.
pub fn map_mosaic_panel(
    path: &Path,
    background_scaled: &[f64],
    geom: &VolumeGeometry,
    maps: &[Vec<f64>],
) -> Result<()> {
    let bg = slice_mosaic(background_scaled, geom, MOSAIC_SLICES);
    let mut rows = Vec::with_capacity(maps.len() + 1);
    rows.push(render_overlay(&bg, None));
    for map in maps {
        if map.len() != background_scaled.len() {
            return Err(DiagnosisError::shape(
                "figure overlay",
                background_scaled.len(),
                map.len(),
            ));
        }
        let mosaic = slice_mosaic(map, geom, MOSAIC_SLICES);
        rows.push(render_overlay(&bg, Some(&mosaic)));
    }

    let width = bg.width;
    let height = rows.iter().map(|r| r.height + ROW_GAP).sum::<usize>();
    let mut canvas = Canvas::new(width, height);
    let mut y = 0;
    for row in &rows {
        canvas.blit(row, 0, y);
        y += row.height + ROW_GAP;
    }
    save_png(path, &canvas)
}

/// Render a voxels-by-time matrix as a grayscale bitmap clipped at
/// mean +/- 2 std.
fn grayplot_bitmap(grayplot: &Array2<f64>) -> Canvas {
    let values: Vec<f64> = grayplot.iter().cloned().collect();
    let m = crate::stats::nan_mean(&values);
    let finite: Vec<f64> = values.iter().cloned().filter(|v| !v.is_nan()).collect();
    let sd = crate::stats::std(&finite);
    let (low, high) = if sd > 0.0 && !m.is_nan() {
        (m - 2.0 * sd, m + 2.0 * sd)
    } else {
        (0.0, 1.0)
    };

    let n_rows = grayplot.nrows();
    let n_cols = grayplot.ncols();
    let mut canvas = Canvas::new(n_cols, n_rows);
    for r in 0..n_rows {
        for c in 0..n_cols {
            let v = grayplot[[r, c]];
            let scaled = if v.is_nan() {
                0.0
            } else {
                (v - low) / (high - low)
            };
            canvas.set_pixel(c, r, gray(scaled));
        }
    }
    canvas
}

/// Polyline of one trace scaled to its own finite range, NaN points skipped.
fn trace_row(trace: &[f64], width: usize, rgb: [u8; 3]) -> Canvas {
    let mut canvas = Canvas::new(width, TRACE_HEIGHT);
    // Dark background with a faint midline
    for x in 0..width {
        canvas.set_pixel(x, TRACE_HEIGHT / 2, [40, 40, 40]);
    }

    let finite: Vec<f64> = trace.iter().cloned().filter(|v| !v.is_nan()).collect();
    if finite.is_empty() || trace.len() < 2 {
        return canvas;
    }
    let low = finite.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let high = finite.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let range = if high > low { high - low } else { 1.0 };

    let to_y = |v: f64| -> i64 {
        let frac = (v - low) / range;
        ((1.0 - frac) * (TRACE_HEIGHT - 1) as f64).round() as i64
    };
    let to_x = |t: usize| -> i64 {
        if trace.len() == 1 {
            0
        } else {
            (t as f64 / (trace.len() - 1) as f64 * (width - 1) as f64).round() as i64
        }
    };

    let mut prev: Option<(i64, i64)> = None;
    for (t, &v) in trace.iter().enumerate() {
        if v.is_nan() {
            prev = None;
            continue;
        }
        let point = (to_x(t), to_y(v));
        if let Some(p) = prev {
            canvas.draw_line(p.0, p.1, point.0, point.1, rgb);
        } else {
            canvas.set_pixel(point.0 as usize, point.1 as usize, rgb);
        }
        prev = Some(point);
    }
    canvas
}

/// Temporal diagnosis panel: the grayplot bitmap on top, then one trace row
/// per supplied (trace, color) pair, in input order.
pub fn temporal_panel(
    path: &Path,
    grayplot: &Array2<f64>,
    traces: &[(&[f64], [u8; 3])],
) -> Result<()> {
    let plot = grayplot_bitmap(grayplot);
    let width = plot.width.max(64);
    let height = plot.height + traces.len() * (TRACE_HEIGHT + ROW_GAP) + ROW_GAP;

    let mut canvas = Canvas::new(width, height);
    canvas.blit(&plot, 0, 0);
    let mut y = plot.height + ROW_GAP;
    for (trace, rgb) in traces {
        let row = trace_row(trace, width, *rgb);
        canvas.blit(&row, 0, y);
        y += TRACE_HEIGHT + ROW_GAP;
    }
    save_png(path, &canvas)
}
