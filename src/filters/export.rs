//! File exporters.
//!
//! An exporter is a sink with any number of inputs (`in0`, `in1`, ...) and a
//! "File" parameter. Every refresh rewrites the file from the current input
//! waveforms. Loading a session that points an exporter at an existing file
//! raises a warning before anything is written.

use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::marker::PhantomData;
use std::path::Path;

use rustfft::num_complex::Complex;
use serde_json::{Map, Value};

use crate::formats::{csv, touchstone, vcd};
use crate::pipeline::{
    is_analog, is_digital, Filter, FilterCategory, FilterCore, FilterParameter, ParameterSet, PipelineError,
    PipelineResult, RefreshContext, Stream, StreamType,
};
use crate::types::{Color, Unit};
use crate::waveform::{advance_to_timestamp_scaled, analog_value, get_offset_scaled, Waveform, WaveformBase};

/// One bound input, ready to be written.
pub struct ExportChannel<'a> {
    /// Unique within one export
    pub name: String,
    pub stream: &'a Stream,
    pub waveform: &'a Waveform,
}

/// A file format an [`ExportFilter`] can write.
pub trait ExportFormat: 'static {
    const PROTOCOL: &'static str;
    const FILE_MASK: &'static str;

    /// Add format-specific parameters.
    fn init(_core: &mut FilterCore) {}

    fn accepts(stream: &Stream) -> bool;

    /// Whether loading `params` will replace an existing file's contents.
    fn overwrites(_params: &Map<String, Value>) -> bool {
        true
    }

    fn write(path: &Path, params: &ParameterSet, channels: &[ExportChannel<'_>]) -> PipelineResult<()>;
}

pub struct VcdExport;
pub struct CsvExport;
pub struct TouchstoneExport;

fn create(path: &Path) -> PipelineResult<BufWriter<File>> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| PipelineError::File(format!("{}: {e}", path.display())))
}

fn named<'a>(channels: &'a [ExportChannel<'a>]) -> Vec<(&'a str, &'a Waveform)> {
    channels.iter().map(|c| (c.name.as_str(), c.waveform)).collect()
}

impl ExportFormat for VcdExport {
    const PROTOCOL: &'static str = "VCD Export";
    const FILE_MASK: &'static str = "*.vcd";

    fn init(core: &mut FilterCore) {
        core.parameters
            .insert("Timescale", FilterParameter::int(1000, Unit::Femtoseconds));
    }

    fn accepts(stream: &Stream) -> bool {
        (is_analog(stream) || is_digital(stream)) && stream.x_unit == Unit::Femtoseconds
    }

    fn write(path: &Path, params: &ParameterSet, channels: &[ExportChannel<'_>]) -> PipelineResult<()> {
        let date = channels
            .iter()
            .map(|c| c.waveform.header())
            .find(|h| h.start_timestamp != 0)
            .and_then(|h| h.start_time())
            .unwrap_or_else(chrono::Utc::now);
        vcd::write_vcd(create(path)?, &named(channels), params.int("Timescale"), date)?;
        Ok(())
    }
}

const MODE_OVERWRITE: i64 = 0;
const MODE_APPEND: i64 = 1;

impl ExportFormat for CsvExport {
    const PROTOCOL: &'static str = "CSV Export";
    const FILE_MASK: &'static str = "*.csv";

    fn init(core: &mut FilterCore) {
        core.parameters.insert(
            "Mode",
            FilterParameter::enumeration(&[("Overwrite", MODE_OVERWRITE), ("Append", MODE_APPEND)]),
        );
    }

    fn accepts(stream: &Stream) -> bool {
        is_analog(stream) || is_digital(stream)
    }

    fn overwrites(params: &Map<String, Value>) -> bool {
        params.get("Mode").and_then(Value::as_str) != Some("Append")
    }

    fn write(path: &Path, params: &ParameterSet, channels: &[ExportChannel<'_>]) -> PipelineResult<()> {
        let x_unit = channels.first().map_or(Unit::Femtoseconds, |c| c.stream.x_unit);
        if let Some(other) = channels.iter().find(|c| c.stream.x_unit != x_unit) {
            return Err(PipelineError::invalid(
                &other.name,
                format!("X axis in {} but the first column is in {}", other.stream.x_unit, x_unit),
            ));
        }
        if params.int("Mode") == MODE_APPEND {
            let fresh = std::fs::metadata(path).map_or(true, |m| m.len() == 0);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| PipelineError::File(format!("{}: {e}", path.display())))?;
            csv::write_csv_rows(BufWriter::new(file), &named(channels), x_unit, fresh)?;
        } else {
            csv::write_csv(create(path)?, &named(channels), x_unit)?;
        }
        Ok(())
    }
}

/// `S<to><from>_mag` or `S<to><from>_ang`, as written by the Touchstone importer.
fn parse_sparam_name(name: &str) -> Option<(usize, usize, bool)> {
    let rest = name.strip_prefix('S')?;
    let (indices, kind) = rest.split_once('_')?;
    let mut digits = indices.chars().map(|c| c.to_digit(10));
    let to = digits.next()?? as usize;
    let from = digits.next()?? as usize;
    if digits.next().is_some() || to == 0 || from == 0 {
        return None;
    }
    match kind {
        "mag" => Some((to, from, true)),
        "ang" => Some((to, from, false)),
        _ => None,
    }
}

const FORMATS: [(&str, touchstone::DataFormat); 3] = [
    ("Magnitude/Angle", touchstone::DataFormat::MagAngle),
    ("dB/Angle", touchstone::DataFormat::DbAngle),
    ("Real/Imaginary", touchstone::DataFormat::RealImag),
];

const FREQUENCY_UNITS: [(&str, touchstone::FrequencyUnit); 4] = [
    ("GHz", touchstone::FrequencyUnit::GHz),
    ("MHz", touchstone::FrequencyUnit::MHz),
    ("kHz", touchstone::FrequencyUnit::KHz),
    ("Hz", touchstone::FrequencyUnit::Hz),
];

/// Value of `w` at frequency `f`, advancing `cursor`.
fn sample_at(w: &Waveform, cursor: &mut usize, f: i64) -> f64 {
    advance_to_timestamp_scaled(w, cursor, w.len(), f);
    analog_value(w, *cursor).map_or(0.0, f64::from)
}

impl ExportFormat for TouchstoneExport {
    const PROTOCOL: &'static str = "Touchstone Export";
    const FILE_MASK: &'static str = "*.s*p";

    fn init(core: &mut FilterCore) {
        let formats: Vec<(&str, i64)> = FORMATS.iter().enumerate().map(|(i, (n, _))| (*n, i as i64)).collect();
        core.parameters.insert("Format", FilterParameter::enumeration(&formats));
        let units: Vec<(&str, i64)> = FREQUENCY_UNITS
            .iter()
            .enumerate()
            .map(|(i, (n, _))| (*n, i as i64))
            .collect();
        core.parameters.insert("Frequency Unit", FilterParameter::enumeration(&units));
        // 0 takes the port count from the highest connected parameter
        core.parameters.insert("Ports", FilterParameter::int(0, Unit::Counts));
    }

    fn accepts(stream: &Stream) -> bool {
        stream.stream_type == StreamType::Analog
            && stream.x_unit == Unit::Hertz
            && parse_sparam_name(&stream.name).is_some()
    }

    fn write(path: &Path, params: &ParameterSet, channels: &[ExportChannel<'_>]) -> PipelineResult<()> {
        let parsed: Vec<(usize, usize, bool, &Waveform)> = channels
            .iter()
            .filter_map(|c| parse_sparam_name(&c.stream.name).map(|(t, f, m)| (t, f, m, c.waveform)))
            .collect();
        let inferred = parsed.iter().map(|&(t, f, _, _)| t.max(f)).max().unwrap_or(0);
        let ports = (params.int("Ports").max(0) as usize).max(inferred);
        let grid = parsed
            .iter()
            .find(|p| p.2)
            .map(|p| p.3)
            .ok_or_else(|| PipelineError::invalid("in0", "no S-parameter magnitude connected"))?;

        let format = usize::try_from(params.int("Format"))
            .ok()
            .and_then(|i| FORMATS.get(i))
            .map_or(touchstone::DataFormat::MagAngle, |f| f.1);
        let unit = usize::try_from(params.int("Frequency Unit"))
            .ok()
            .and_then(|i| FREQUENCY_UNITS.get(i))
            .map_or(touchstone::FrequencyUnit::GHz, |u| u.1);

        let mut out = touchstone::SParameters::new(ports);
        let mut cursors = vec![0usize; parsed.len()];
        for i in 0..grid.len() {
            let f = get_offset_scaled(grid, i);
            let mut values = vec![Complex::new(0.0, 0.0); ports * ports];
            for (to, from) in (1..=ports).flat_map(|t| (1..=ports).map(move |f| (t, f))) {
                let find = |mag: bool| parsed.iter().position(|p| p.0 == to && p.1 == from && p.2 == mag);
                // Parameters with no magnitude input stay zero
                let Some(m) = find(true) else {
                    continue;
                };
                let db = sample_at(parsed[m].3, &mut cursors[m], f);
                let deg = match find(false) {
                    Some(a) => sample_at(parsed[a].3, &mut cursors[a], f),
                    None => 0.0,
                };
                values[(to - 1) * ports + (from - 1)] = Complex::from_polar(10f64.powf(db / 20.0), deg.to_radians());
            }
            out.points.push(touchstone::SPoint {
                frequency: f as f64,
                values,
            });
        }
        if touchstone::ports_from_path(path).is_some_and(|n| n != ports) {
            tracing::warn!("{}: writing {} ports to {}", Self::PROTOCOL, ports, path.display());
        }
        touchstone::write_touchstone(create(path)?, &out, format, unit)?;
        Ok(())
    }
}

pub type VcdExportFilter = ExportFilter<VcdExport>;
pub type CsvExportFilter = ExportFilter<CsvExport>;
pub type TouchstoneExportFilter = ExportFilter<TouchstoneExport>;

pub struct ExportFilter<F: ExportFormat> {
    core: FilterCore,
    _format: PhantomData<F>,
}

impl<F: ExportFormat> ExportFilter<F> {
    pub const PROTOCOL: &'static str = F::PROTOCOL;

    pub fn new() -> Self {
        let mut core = FilterCore::new(F::PROTOCOL, FilterCategory::Export, Color::rgb(0xc0, 0xc0, 0xc0));
        core.add_input("in0");
        core.set_variadic_inputs("in");
        core.parameters.insert("File", FilterParameter::filename(F::FILE_MASK, true));
        F::init(&mut core);
        core.add_preloader(|_core, section, warnings| {
            let Some(params) = section.get("parameters").and_then(Value::as_object) else {
                return;
            };
            let path = params.get("File").and_then(Value::as_str).unwrap_or("");
            if !path.is_empty() && Path::new(path).exists() && F::overwrites(params) {
                warnings.push(format!("{}: '{}' exists and will be overwritten", F::PROTOCOL, path));
            }
        });
        Self {
            core,
            _format: PhantomData,
        }
    }
}

impl<F: ExportFormat> Default for ExportFilter<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ExportFormat> Filter for ExportFilter<F> {
    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn validate_channel(&self, _slot: usize, stream: &Stream) -> bool {
        F::accepts(stream)
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> PipelineResult<()> {
        let path = self.core.parameters.str("File").to_string();
        if path.is_empty() {
            return Ok(());
        }

        let mut channels: Vec<ExportChannel<'_>> = Vec::with_capacity(ctx.inputs.len());
        for slot in 0..ctx.inputs.len() {
            let stream = ctx.inputs.require_stream(slot)?;
            let waveform = ctx.inputs.require_waveform(slot)?;
            let mut name = stream.name.clone();
            let mut n = 2;
            while channels.iter().any(|c| c.name == name) {
                name = format!("{}_{n}", stream.name);
                n += 1;
            }
            channels.push(ExportChannel { name, stream, waveform });
        }

        F::write(Path::new(&path), &self.core.parameters, &channels)?;
        tracing::debug!("{}: wrote {} channels to {}", F::PROTOCOL, channels.len(), path);
        Ok(())
    }
}
