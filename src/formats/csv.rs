//! Comma separated values.
//!
//! The first column is X: seconds, or hertz when its header names a
//! frequency. Every other column becomes one channel. A header row is
//! detected by the presence of anything other than numbers and separators.
//! Columns holding only `0` and `1` in their first ten rows import as
//! digital. Evenly spaced X values give uniform waveforms, anything else
//! sparse ones.

use std::io::{BufRead, Write};

use super::{FormatError, FormatResult, ImportedChannel};
use crate::types::Unit;
use crate::waveform::{
    advance_to_timestamp_scaled, analog_value, digital_value, get_offset_scaled, SparseWaveform, UniformWaveform,
    Waveform, WaveformBase, FS_PER_SECOND,
};

/// Rows inspected when classifying a column as digital.
const DIGITAL_PROBE_ROWS: usize = 10;

fn is_header(line: &str) -> bool {
    line.chars()
        .any(|c| !(c.is_ascii_digit() || c.is_whitespace() || ".,;+-eE".contains(c)))
}

fn delimiter(line: &str) -> char {
    [',', ';', '\t'].into_iter().find(|&d| line.contains(d)).unwrap_or(',')
}

fn is_frequency_axis(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("hz") || lower.contains("freq")
}

/// Read a CSV file.
pub fn read_csv(reader: impl BufRead) -> FormatResult<Vec<ImportedChannel>> {
    let mut names: Vec<String> = Vec::new();
    let mut x_unit = Unit::Femtoseconds;
    let mut delim = ',';
    let mut xs: Vec<i64> = Vec::new();
    let mut columns: Vec<Vec<f64>> = Vec::new();
    let mut digital: Vec<bool> = Vec::new();

    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if xs.is_empty() && columns.is_empty() {
            delim = delimiter(line);
            if names.is_empty() && is_header(line) {
                names = line.split(delim).map(|f| f.trim().trim_matches('"').to_string()).collect();
                if names.first().is_some_and(|x| is_frequency_axis(x)) {
                    x_unit = Unit::Hertz;
                }
                continue;
            }
        }

        let fields: Vec<&str> = line.split(delim).map(str::trim).collect();
        if fields.len() < 2 {
            return Err(FormatError::parse(n + 1, "need an X column and at least one Y column"));
        }
        if columns.is_empty() {
            columns = vec![Vec::new(); fields.len() - 1];
            digital = vec![true; fields.len() - 1];
        } else if fields.len() - 1 != columns.len() {
            return Err(FormatError::parse(
                n + 1,
                format!("expected {} columns, found {}", columns.len() + 1, fields.len()),
            ));
        }

        let x: f64 = fields[0]
            .parse()
            .map_err(|_| FormatError::parse(n + 1, format!("bad X value '{}'", fields[0])))?;
        xs.push(match x_unit {
            Unit::Hertz => x.round() as i64,
            _ => (x * FS_PER_SECOND as f64).round() as i64,
        });
        let row = xs.len();
        for (c, f) in fields[1..].iter().enumerate() {
            let v: f64 = f
                .parse()
                .map_err(|_| FormatError::parse(n + 1, format!("bad value '{f}' in column {}", c + 2)))?;
            if row <= DIGITAL_PROBE_ROWS && !matches!(*f, "0" | "1") {
                digital[c] = false;
            }
            columns[c].push(v);
        }
    }

    if xs.is_empty() {
        return Ok(Vec::new());
    }
    let uniform = uniform_step(&xs);
    let mut out = Vec::with_capacity(columns.len());
    for (c, samples) in columns.into_iter().enumerate() {
        let name = names.get(c + 1).cloned().unwrap_or_else(|| format!("CH{}", c + 1));
        let is_digital = digital[c];
        let waveform: Waveform = match (uniform, is_digital) {
            (Some(step), true) => {
                UniformWaveform::from_samples(samples.iter().map(|&v| v != 0.0).collect(), step, xs[0]).into()
            }
            (Some(step), false) => {
                UniformWaveform::from_samples(samples.iter().map(|&v| v as f32).collect(), step, xs[0]).into()
            }
            (None, true) => sparse(&xs, samples.iter().map(|&v| v != 0.0).collect()).into(),
            (None, false) => sparse(&xs, samples.iter().map(|&v| v as f32).collect()).into(),
        };
        let y_unit = if is_digital { Unit::Counts } else { Unit::Volts };
        out.push(ImportedChannel::new(name, y_unit, waveform).with_x_unit(x_unit));
    }
    tracing::info!("CSV: {} channels, {} rows, uniform: {}", out.len(), xs.len(), uniform.is_some());
    Ok(out)
}

/// Common spacing of `xs`, if they are evenly spaced.
fn uniform_step(xs: &[i64]) -> Option<i64> {
    if xs.len() < 2 {
        return None;
    }
    let span = xs[xs.len() - 1] - xs[0];
    let step = (span as f64 / (xs.len() - 1) as f64).round() as i64;
    if step <= 0 {
        return None;
    }
    // Allow rounding of the printed values
    let tolerance = (step / 1000).max(1);
    xs.iter()
        .enumerate()
        .all(|(i, &x)| (x - xs[0] - i as i64 * step).abs() <= tolerance)
        .then_some(step)
}

fn sparse<T: crate::accel::Element>(xs: &[i64], samples: Vec<T>) -> SparseWaveform<T> {
    let durations = xs
        .windows(2)
        .map(|w| (w[1] - w[0]).max(1))
        .chain(std::iter::once(if xs.len() > 1 { (xs[xs.len() - 1] - xs[xs.len() - 2]).max(1) } else { 1 }))
        .collect();
    SparseWaveform::from_parts(xs.to_vec(), durations, samples, 1)
}

fn format_value(w: &Waveform, i: usize) -> String {
    match digital_value(w, i) {
        Some(b) => u8::from(b).to_string(),
        None => analog_value(w, i).map_or_else(String::new, |v| v.to_string()),
    }
}

/// Write `channels` on the sample grid of the first one.
///
/// Other channels contribute their value at each grid time.
pub fn write_csv(out: impl Write, channels: &[(&str, &Waveform)], x_unit: Unit) -> FormatResult<()> {
    write_csv_rows(out, channels, x_unit, true)
}

/// [`write_csv`], optionally without the header row, for appending to an
/// existing file.
pub fn write_csv_rows(
    mut out: impl Write,
    channels: &[(&str, &Waveform)],
    x_unit: Unit,
    header: bool,
) -> FormatResult<()> {
    let Some((_, grid)) = channels.first() else {
        return Ok(());
    };
    if header {
        let x_name = match x_unit {
            Unit::Hertz => "Frequency (Hz)",
            _ => "Time (s)",
        };
        let names: Vec<String> = std::iter::once(x_name.to_string())
            .chain(channels.iter().map(|(n, _)| n.replace(',', "_")))
            .collect();
        writeln!(out, "{}", names.join(","))?;
    }

    let mut cursors = vec![0usize; channels.len()];
    for i in 0..grid.len() {
        let t = get_offset_scaled(*grid, i);
        let x = match x_unit {
            Unit::Hertz => t.to_string(),
            _ => (t as f64 / FS_PER_SECOND as f64).to_string(),
        };
        let mut row = vec![x];
        for (c, (_, w)) in channels.iter().enumerate() {
            let len = w.len();
            advance_to_timestamp_scaled(*w, &mut cursors[c], len, t);
            row.push(if len == 0 { String::new() } else { format_value(w, cursors[c]) });
        }
        writeln!(out, "{}", row.join(","))?;
    }
    out.flush()?;
    Ok(())
}
