//! File importers.
//!
//! An importer is a root node with a single "File" parameter. Its streams
//! mirror the channels of the last file read: when a reload yields the same
//! names and types the streams are kept, so downstream bindings survive a
//! re-capture written to the same path.

use std::fs::File;
use std::io::BufReader;
use std::marker::PhantomData;
use std::path::Path;

use crate::formats::{agilent_bin, csv, siglent_bin, touchstone, vcd, wav, FormatError, FormatResult, ImportedChannel};
use crate::pipeline::{
    Filter, FilterCategory, FilterCore, FilterParameter, PipelineError, PipelineResult, RefreshContext, Stream,
    StreamType,
};
use crate::types::Color;

/// A file format an [`ImportFilter`] can read.
pub trait ImportFormat: 'static {
    const PROTOCOL: &'static str;
    /// Glob for file pickers.
    const FILE_MASK: &'static str;

    fn read(path: &Path) -> FormatResult<Vec<ImportedChannel>>;
}

pub struct VcdFile;
pub struct CsvFile;
pub struct WavFile;
pub struct AgilentBinFile;
pub struct SiglentBinFile;
pub struct TouchstoneFile;

impl ImportFormat for VcdFile {
    const PROTOCOL: &'static str = "VCD Import";
    const FILE_MASK: &'static str = "*.vcd";

    fn read(path: &Path) -> FormatResult<Vec<ImportedChannel>> {
        vcd::read_vcd(BufReader::new(File::open(path)?))
    }
}

impl ImportFormat for CsvFile {
    const PROTOCOL: &'static str = "CSV Import";
    const FILE_MASK: &'static str = "*.csv";

    fn read(path: &Path) -> FormatResult<Vec<ImportedChannel>> {
        csv::read_csv(BufReader::new(File::open(path)?))
    }
}

impl ImportFormat for WavFile {
    const PROTOCOL: &'static str = "WAV Import";
    const FILE_MASK: &'static str = "*.wav";

    fn read(path: &Path) -> FormatResult<Vec<ImportedChannel>> {
        wav::read_wav(BufReader::new(File::open(path)?))
    }
}

impl ImportFormat for AgilentBinFile {
    const PROTOCOL: &'static str = "BIN Import";
    const FILE_MASK: &'static str = "*.bin";

    fn read(path: &Path) -> FormatResult<Vec<ImportedChannel>> {
        agilent_bin::read_agilent_bin(&std::fs::read(path)?)
    }
}

impl ImportFormat for SiglentBinFile {
    const PROTOCOL: &'static str = "Siglent BIN Import";
    const FILE_MASK: &'static str = "*.bin";

    fn read(path: &Path) -> FormatResult<Vec<ImportedChannel>> {
        siglent_bin::read_siglent_bin(&std::fs::read(path)?)
    }
}

impl ImportFormat for TouchstoneFile {
    const PROTOCOL: &'static str = "Touchstone Import";
    const FILE_MASK: &'static str = "*.s*p";

    fn read(path: &Path) -> FormatResult<Vec<ImportedChannel>> {
        let ports = touchstone::ports_from_path(path)
            .ok_or_else(|| FormatError::Unsupported(format!("no port count in '{}'", path.display())))?;
        let params = touchstone::read_touchstone(BufReader::new(File::open(path)?), ports)?;
        Ok(params.to_channels())
    }
}

pub type VcdImportFilter = ImportFilter<VcdFile>;
pub type CsvImportFilter = ImportFilter<CsvFile>;
pub type WavImportFilter = ImportFilter<WavFile>;
pub type BinImportFilter = ImportFilter<AgilentBinFile>;
pub type SiglentBinImportFilter = ImportFilter<SiglentBinFile>;
pub type TouchstoneImportFilter = ImportFilter<TouchstoneFile>;

pub struct ImportFilter<F: ImportFormat> {
    core: FilterCore,
    /// Path of the file currently on the streams.
    loaded: Option<String>,
    _format: PhantomData<F>,
}

impl<F: ImportFormat> ImportFilter<F> {
    pub const PROTOCOL: &'static str = F::PROTOCOL;

    pub fn new() -> Self {
        let mut core = FilterCore::new(F::PROTOCOL, FilterCategory::Import, Color::rgb(0x80, 0x80, 0xff));
        core.parameters.insert("File", FilterParameter::filename(F::FILE_MASK, false));
        // Streams must exist before consumers are rebound from a session
        core.add_loader(|core, _section, _ids| {
            let path = core.parameters.str("File").to_string();
            if path.is_empty() {
                return Ok(());
            }
            match read_channels::<F>(&path) {
                Ok(channels) => install(core, channels),
                Err(e) => tracing::warn!("{}: {}", F::PROTOCOL, e),
            }
            Ok(())
        });
        Self {
            core,
            loaded: None,
            _format: PhantomData,
        }
    }

    /// Path of the file currently loaded.
    pub fn loaded_path(&self) -> Option<&str> {
        self.loaded.as_deref()
    }
}

impl<F: ImportFormat> Default for ImportFilter<F> {
    fn default() -> Self {
        Self::new()
    }
}

fn read_channels<F: ImportFormat>(path: &str) -> PipelineResult<Vec<ImportedChannel>> {
    F::read(Path::new(path)).map_err(|e| PipelineError::File(format!("{path}: {e}")))
}

fn stream_type(channel: &ImportedChannel) -> StreamType {
    if channel.is_digital() {
        StreamType::Digital
    } else {
        StreamType::Analog
    }
}

/// Put `channels` on the node's streams.
fn install(core: &mut FilterCore, channels: Vec<ImportedChannel>) {
    let same_layout = core.channel.streams.len() == channels.len()
        && core
            .channel
            .streams
            .iter()
            .zip(&channels)
            .all(|(s, c)| s.name == c.name && s.stream_type == stream_type(c));
    if !same_layout {
        core.channel.streams = channels
            .iter()
            .map(|c| Stream::new(&c.name, stream_type(c), c.x_unit, c.y_unit))
            .collect();
    }
    for (i, c) in channels.into_iter().enumerate() {
        core.set_output(i, c.waveform);
    }
}

impl<F: ImportFormat> Filter for ImportFilter<F> {
    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn validate_channel(&self, _slot: usize, _stream: &Stream) -> bool {
        false
    }

    fn refresh(&mut self, _ctx: &mut RefreshContext<'_>) -> PipelineResult<()> {
        let path = self.core.parameters.str("File").to_string();
        if path.is_empty() {
            self.loaded = None;
            self.core.channel.streams.clear();
            return Ok(());
        }
        if self.loaded.as_deref() == Some(path.as_str()) {
            return Ok(());
        }

        self.loaded = None;
        let channels = read_channels::<F>(&path)?;
        tracing::info!("{}: loaded {} streams from {}", F::PROTOCOL, channels.len(), path);
        install(&mut self.core, channels);
        self.loaded = Some(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ErrorKind, FilterGraph, StreamDescriptor};
    use crate::session::IdTable;
    use crate::types::Unit;
    use serde_json::json;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, text: &str) -> String {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_csv_import_streams() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "cap.csv", "Time,CH1,D0\n0,0.5,0\n1e-9,0.25,1\n2e-9,-0.5,1\n");
        let mut graph = FilterGraph::new();
        let id = graph.add_node(Box::new(CsvImportFilter::new()));
        graph.set_parameter(id, "File", path.as_str()).unwrap();
        graph.refresh().unwrap();

        assert!(graph.errors(id).is_empty(), "{:?}", graph.errors(id));
        let analog = graph.stream(StreamDescriptor::new(id, 0)).unwrap();
        assert_eq!(analog.name, "CH1");
        assert_eq!(analog.stream_type, StreamType::Analog);
        let digital = graph.stream(StreamDescriptor::new(id, 1)).unwrap();
        assert_eq!(digital.stream_type, StreamType::Digital);
        assert_eq!(digital.waveform().unwrap().digital_samples().unwrap(), &[false, true, true]);
        assert_eq!(graph.filter::<CsvImportFilter>(id).unwrap().loaded_path(), Some(path.as_str()));
    }

    #[test]
    fn test_missing_file_is_recorded() {
        let mut graph = FilterGraph::new();
        let id = graph.add_node(Box::new(VcdImportFilter::new()));
        graph.set_parameter(id, "File", "/nonexistent/capture.vcd").unwrap();
        graph.refresh().unwrap();
        let errors = graph.errors(id);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::File);
        assert!(errors[0].message.contains("capture.vcd"));
    }

    #[test]
    fn test_reload_keeps_layout_and_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_file(&dir, "a.csv", "Time,V\n0,1\n1e-9,2\n2e-9,3\n");
        let second = write_file(&dir, "b.csv", "Time,V\n0,4\n1e-9,5\n2e-9,6\n");

        let mut graph = FilterGraph::new();
        let id = graph.add_node(Box::new(CsvImportFilter::new()));
        graph.set_parameter(id, "File", first.as_str()).unwrap();
        graph.refresh().unwrap();
        let fft = graph.add_node(Box::new(crate::filters::FftFilter::new()));
        graph.connect(StreamDescriptor::new(id, 0), fft, 0).unwrap();

        graph.set_parameter(id, "File", second.as_str()).unwrap();
        graph.refresh().unwrap();
        let s = graph.stream(StreamDescriptor::new(id, 0)).unwrap();
        assert_eq!(s.waveform().unwrap().analog_samples().unwrap(), &[4.0, 5.0, 6.0]);
        assert_eq!(graph.node(fft).unwrap().core().inputs[0].descriptor, Some(StreamDescriptor::new(id, 0)));
    }

    #[test]
    fn test_touchstone_import() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "thru.s2p", "# MHZ S DB R 50\n100 -0.1 0 -3 -45 -3 -45 -0.2 0\n");
        let mut graph = FilterGraph::new();
        let id = graph.add_node(Box::new(TouchstoneImportFilter::new()));
        graph.set_parameter(id, "File", path.as_str()).unwrap();
        graph.refresh().unwrap();

        let node = graph.node(id).unwrap();
        assert_eq!(node.core().channel.stream_count(), 8);
        let s12 = node.core().channel.stream(2).unwrap();
        assert_eq!(s12.name, "S12_mag");
        assert_eq!(s12.x_unit, Unit::Hertz);
        let v = s12.waveform().unwrap().analog_samples().unwrap()[0];
        assert!((v + 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_session_load_creates_streams() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "cap.csv", "Time,A,B\n0,1,2\n1e-9,3,4\n");
        let mut filter = CsvImportFilter::new();
        let section = json!({ "parameters": { "File": path } });
        filter
            .core_mut()
            .load(section.as_object().unwrap(), &IdTable::new())
            .unwrap();
        assert_eq!(filter.core().channel.stream_count(), 2);
        assert_eq!(filter.core().channel.stream(1).unwrap().name, "B");
    }
}
