//! Touchstone `.sNp` S-parameter files.
//!
//! Version 1 syntax: `!` starts a comment, `# <freq unit> S <format> R <z0>`
//! sets the options, and each record is a frequency followed by N² value
//! pairs, wrapped over as many lines as the writer liked. Two-port files list
//! S11 S21 S12 S22; every other port count is row-major.
//!
//! Imported S-parameters become two streams each, magnitude in dB and angle
//! in degrees, over a sparse frequency axis in Hz.

use std::io::{BufRead, Write};
use std::path::Path;

use rustfft::num_complex::Complex;

use super::{FormatError, FormatResult, ImportedChannel};
use crate::types::Unit;
use crate::waveform::SparseWaveform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrequencyUnit {
    Hz,
    KHz,
    MHz,
    #[default]
    GHz,
}

impl FrequencyUnit {
    pub fn scale(self) -> f64 {
        match self {
            FrequencyUnit::Hz => 1.0,
            FrequencyUnit::KHz => 1e3,
            FrequencyUnit::MHz => 1e6,
            FrequencyUnit::GHz => 1e9,
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            FrequencyUnit::Hz => "HZ",
            FrequencyUnit::KHz => "KHZ",
            FrequencyUnit::MHz => "MHZ",
            FrequencyUnit::GHz => "GHZ",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        [FrequencyUnit::Hz, FrequencyUnit::KHz, FrequencyUnit::MHz, FrequencyUnit::GHz]
            .into_iter()
            .find(|u| u.keyword().eq_ignore_ascii_case(s))
    }
}

/// How each complex value is written as a pair of numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataFormat {
    /// Linear magnitude, angle in degrees
    #[default]
    MagAngle,
    /// Magnitude in dB, angle in degrees
    DbAngle,
    /// Real and imaginary parts
    RealImag,
}

impl DataFormat {
    pub fn keyword(self) -> &'static str {
        match self {
            DataFormat::MagAngle => "MA",
            DataFormat::DbAngle => "DB",
            DataFormat::RealImag => "RI",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        [DataFormat::MagAngle, DataFormat::DbAngle, DataFormat::RealImag]
            .into_iter()
            .find(|f| f.keyword().eq_ignore_ascii_case(s))
    }

    fn decode(self, a: f64, b: f64) -> Complex<f64> {
        match self {
            DataFormat::MagAngle => Complex::from_polar(a, b.to_radians()),
            DataFormat::DbAngle => Complex::from_polar(10f64.powf(a / 20.0), b.to_radians()),
            DataFormat::RealImag => Complex::new(a, b),
        }
    }

    fn encode(self, v: Complex<f64>) -> (f64, f64) {
        match self {
            DataFormat::MagAngle => (v.norm(), v.arg().to_degrees()),
            DataFormat::DbAngle => (to_db(v.norm()), v.arg().to_degrees()),
            DataFormat::RealImag => (v.re, v.im),
        }
    }
}

fn to_db(mag: f64) -> f64 {
    if mag > 0.0 {
        20.0 * mag.log10()
    } else {
        -200.0
    }
}

/// S-parameter matrix at one frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct SPoint {
    /// Hz
    pub frequency: f64,
    /// Row-major, `ports × ports`
    pub values: Vec<Complex<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SParameters {
    pub ports: usize,
    pub reference_impedance: f64,
    pub points: Vec<SPoint>,
}

impl SParameters {
    pub fn new(ports: usize) -> Self {
        Self {
            ports,
            reference_impedance: 50.0,
            points: Vec::new(),
        }
    }

    /// S(to, from), 1-based like the parameter names.
    pub fn get(&self, point: usize, to: usize, from: usize) -> Complex<f64> {
        self.points[point].values[(to - 1) * self.ports + (from - 1)]
    }

    /// Position of value `k` of a record in the row-major matrix.
    fn matrix_index(&self, k: usize) -> usize {
        if self.ports == 2 {
            // S11 S21 S12 S22
            (k % 2) * 2 + k / 2
        } else {
            k
        }
    }

    /// Magnitude (dB) and angle (degrees) streams for every parameter.
    pub fn to_channels(&self) -> Vec<ImportedChannel> {
        let offsets: Vec<i64> = self.points.iter().map(|p| p.frequency.round() as i64).collect();
        let durations: Vec<i64> = offsets
            .windows(2)
            .map(|w| (w[1] - w[0]).max(1))
            .chain(std::iter::once(1))
            .take(offsets.len())
            .collect();

        let mut out = Vec::with_capacity(2 * self.ports * self.ports);
        for to in 1..=self.ports {
            for from in 1..=self.ports {
                let idx = (to - 1) * self.ports + (from - 1);
                let mag: Vec<f32> = self.points.iter().map(|p| to_db(p.values[idx].norm()) as f32).collect();
                let ang: Vec<f32> = self.points.iter().map(|p| p.values[idx].arg().to_degrees() as f32).collect();
                let name = format!("S{to}{from}");
                out.push(
                    ImportedChannel::new(
                        format!("{name}_mag"),
                        Unit::Decibels,
                        SparseWaveform::from_parts(offsets.clone(), durations.clone(), mag, 1),
                    )
                    .with_x_unit(Unit::Hertz),
                );
                out.push(
                    ImportedChannel::new(
                        format!("{name}_ang"),
                        Unit::Degrees,
                        SparseWaveform::from_parts(offsets.clone(), durations.clone(), ang, 1),
                    )
                    .with_x_unit(Unit::Hertz),
                );
            }
        }
        out
    }
}

/// Port count from an `.sNp` extension.
pub fn ports_from_path(path: &Path) -> Option<usize> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let n = ext.strip_prefix('s')?.strip_suffix('p')?.parse().ok()?;
    (n > 0).then_some(n)
}

/// Read an `ports`-port file.
pub fn read_touchstone(reader: impl BufRead, ports: usize) -> FormatResult<SParameters> {
    let mut params = SParameters::new(ports);
    let mut unit = FrequencyUnit::default();
    let mut format = DataFormat::default();
    let record_len = 1 + 2 * ports * ports;
    let mut pending: Vec<f64> = Vec::with_capacity(record_len);

    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let text = line.split('!').next().unwrap_or("").trim();
        if text.is_empty() {
            continue;
        }
        if let Some(options) = text.strip_prefix('#') {
            let mut words = options.split_whitespace();
            while let Some(word) = words.next() {
                if let Some(u) = FrequencyUnit::parse(word) {
                    unit = u;
                } else if let Some(f) = DataFormat::parse(word) {
                    format = f;
                } else if word.eq_ignore_ascii_case("R") {
                    let z0 = words.next().and_then(|z| z.parse().ok());
                    params.reference_impedance =
                        z0.ok_or_else(|| FormatError::parse(n + 1, "R needs a reference impedance"))?;
                } else if !word.eq_ignore_ascii_case("S") {
                    return Err(FormatError::Unsupported(format!("option '{word}'")));
                }
            }
            continue;
        }

        for tok in text.split_whitespace() {
            let v: f64 = tok
                .parse()
                .map_err(|_| FormatError::parse(n + 1, format!("bad number '{tok}'")))?;
            pending.push(v);
            if pending.len() == record_len {
                let mut values = vec![Complex::new(0.0, 0.0); ports * ports];
                for (k, pair) in pending[1..].chunks_exact(2).enumerate() {
                    values[params.matrix_index(k)] = format.decode(pair[0], pair[1]);
                }
                params.points.push(SPoint {
                    frequency: pending[0] * unit.scale(),
                    values,
                });
                pending.clear();
            }
        }
    }
    if !pending.is_empty() {
        return Err(FormatError::Truncated(format!(
            "last record has {} of {} numbers",
            pending.len(),
            record_len
        )));
    }
    tracing::info!(
        "Touchstone: {} ports, {} points, {} format",
        ports,
        params.points.len(),
        format.keyword()
    );
    Ok(params)
}

/// Write `params` using the given number format and frequency unit.
pub fn write_touchstone(
    mut out: impl Write,
    params: &SParameters,
    format: DataFormat,
    unit: FrequencyUnit,
) -> FormatResult<()> {
    writeln!(out, "! {}-port S-parameters", params.ports)?;
    writeln!(
        out,
        "# {} S {} R {}",
        unit.keyword(),
        format.keyword(),
        params.reference_impedance
    )?;
    let n = params.ports;
    for point in &params.points {
        let mut pairs = Vec::with_capacity(n * n);
        for k in 0..n * n {
            let (a, b) = format.encode(point.values[params.matrix_index(k)]);
            pairs.push(format!("{a:.9e} {b:.9e}"));
        }
        let freq = point.frequency / unit.scale();
        if n <= 2 {
            writeln!(out, "{freq} {}", pairs.join(" "))?;
        } else {
            // One matrix row per line, at most four pairs each
            for (row, chunk) in pairs.chunks(n).enumerate() {
                for (c, line) in chunk.chunks(4).enumerate() {
                    if row == 0 && c == 0 {
                        writeln!(out, "{freq} {}", line.join(" "))?;
                    } else {
                        writeln!(out, "  {}", line.join(" "))?;
                    }
                }
            }
        }
    }
    out.flush()?;
    Ok(())
}
