//! IEEE 1364 value change dump.
//!
//! Single-bit variables import as sparse digital waveforms, vectors as sparse
//! analog waveforms of their integer value and `real` variables as sparse
//! analog. Each sample lasts until the variable's next change, and the last
//! one until the final timestamp in the file.

use std::collections::HashMap;
use std::io::{BufRead, Write};

use super::{strip_common_prefix, FormatError, FormatResult, ImportedChannel};
use crate::types::Unit;
use crate::waveform::{get_duration_scaled, get_offset_scaled, SparseWaveform, Waveform, WaveformBase};

/// Parse a `$timescale` body such as `1 ps` or `10ns` into femtoseconds.
pub fn parse_timescale(text: &str) -> Option<i64> {
    let text: String = text.split_whitespace().collect();
    let split = text.find(|c: char| !c.is_ascii_digit())?;
    let (num, unit) = text.split_at(split);
    let num: i64 = num.parse().ok()?;
    let scale = match unit {
        "s" => 1_000_000_000_000_000,
        "ms" => 1_000_000_000_000,
        "us" => 1_000_000_000,
        "ns" => 1_000_000,
        "ps" => 1_000,
        "fs" => 1,
        _ => return None,
    };
    Some(num * scale)
}

#[derive(Debug)]
enum VarKind {
    Bit,
    Vector,
    Real,
}

#[derive(Debug)]
struct Var {
    name: String,
    kind: VarKind,
    /// (time in ticks, value)
    changes: Vec<(i64, f64)>,
}

impl Var {
    fn record(&mut self, t: i64, value: f64) {
        match self.changes.last_mut() {
            Some(last) if last.0 == t => last.1 = value,
            Some(last) if last.1 == value => {}
            _ => self.changes.push((t, value)),
        }
    }
}

fn scalar_value(c: char) -> f64 {
    match c {
        '1' | 'h' | 'H' => 1.0,
        _ => 0.0,
    }
}

fn vector_value(bits: &str) -> f64 {
    // x and z bits read as zero
    bits.chars().fold(0.0, |acc, c| acc * 2.0 + scalar_value(c))
}

/// Read every variable declared in a VCD file.
pub fn read_vcd(reader: impl BufRead) -> FormatResult<Vec<ImportedChannel>> {
    let mut timescale = 1_000; // 1 ps when the file does not say
    let mut scopes: Vec<String> = Vec::new();
    let mut vars: Vec<Var> = Vec::new();
    // Several variables may share one identifier
    let mut by_id: HashMap<String, Vec<usize>> = HashMap::new();
    let mut now = 0i64;
    let mut last_time = 0i64;

    // Commands can span lines, so walk a token stream
    let mut tokens = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        for tok in line?.split_whitespace() {
            tokens.push((n + 1, tok.to_string()));
        }
    }
    let mut it = tokens.into_iter().peekable();

    let body = |it: &mut std::iter::Peekable<std::vec::IntoIter<(usize, String)>>| -> Vec<String> {
        let mut out = Vec::new();
        for (_, tok) in it.by_ref() {
            if tok == "$end" {
                break;
            }
            out.push(tok);
        }
        out
    };

    while let Some((line, tok)) = it.next() {
        match tok.as_str() {
            "$timescale" => {
                let text = body(&mut it).join(" ");
                timescale =
                    parse_timescale(&text).ok_or_else(|| FormatError::parse(line, format!("timescale '{text}'")))?;
            }
            "$scope" => {
                let b = body(&mut it);
                scopes.push(b.get(1).cloned().unwrap_or_default());
            }
            "$upscope" => {
                body(&mut it);
                scopes.pop();
            }
            "$var" => {
                let b = body(&mut it);
                let [kind, width, id, name, ..] = b.as_slice() else {
                    return Err(FormatError::parse(line, "short $var"));
                };
                let width: u32 = width
                    .parse()
                    .map_err(|_| FormatError::parse(line, format!("bad width '{width}'")))?;
                let kind = match (kind.as_str(), width) {
                    ("real", _) => VarKind::Real,
                    (_, 1) => VarKind::Bit,
                    _ => VarKind::Vector,
                };
                let mut path = scopes.clone();
                path.push(name.clone());
                by_id.entry(id.clone()).or_default().push(vars.len());
                vars.push(Var {
                    name: path.join("."),
                    kind,
                    changes: Vec::new(),
                });
            }
            "$dumpvars" | "$dumpall" | "$dumpon" | "$dumpoff" | "$end" => {}
            t if t.starts_with('$') => {
                body(&mut it);
            }
            t if t.starts_with('#') => {
                now = t[1..]
                    .parse()
                    .map_err(|_| FormatError::parse(line, format!("bad timestamp '{t}'")))?;
                last_time = last_time.max(now);
            }
            t if t.starts_with(['b', 'B', 'r', 'R']) => {
                let (_, id) = it
                    .next()
                    .ok_or_else(|| FormatError::parse(line, "value without identifier"))?;
                let value = if t.starts_with(['r', 'R']) {
                    t[1..]
                        .parse()
                        .map_err(|_| FormatError::parse(line, format!("bad real '{t}'")))?
                } else {
                    vector_value(&t[1..])
                };
                for &v in by_id.get(&id).into_iter().flatten() {
                    vars[v].record(now, value);
                }
            }
            t => {
                let mut chars = t.chars();
                let Some(c) = chars.next() else { continue };
                if !"01xXzZhHlL".contains(c) {
                    return Err(FormatError::parse(line, format!("unexpected '{t}'")));
                }
                for &v in by_id.get(chars.as_str()).into_iter().flatten() {
                    vars[v].record(now, scalar_value(c));
                }
            }
        }
    }

    let mut names: Vec<String> = vars.iter().map(|v| v.name.clone()).collect();
    strip_common_prefix(&mut names, '.');

    let channels: Vec<ImportedChannel> = vars
        .into_iter()
        .zip(names)
        .map(|(var, name)| {
            let end = last_time.max(var.changes.last().map_or(0, |c| c.0) + 1);
            let durations = var
                .changes
                .iter()
                .enumerate()
                .map(|(i, c)| var.changes.get(i + 1).map_or(end, |n| n.0) - c.0)
                .map(|d| d.max(1));
            let offsets: Vec<i64> = var.changes.iter().map(|c| c.0).collect();
            let durations: Vec<i64> = durations.collect();
            match var.kind {
                VarKind::Bit => {
                    let samples = var.changes.iter().map(|c| c.1 != 0.0).collect();
                    let w = SparseWaveform::from_parts(offsets, durations, samples, timescale);
                    ImportedChannel::new(name, Unit::Counts, w)
                }
                VarKind::Vector => {
                    let samples = var.changes.iter().map(|c| c.1 as f32).collect();
                    let w = SparseWaveform::from_parts(offsets, durations, samples, timescale);
                    ImportedChannel::new(name, Unit::Counts, w)
                }
                VarKind::Real => {
                    let samples = var.changes.iter().map(|c| c.1 as f32).collect();
                    let w = SparseWaveform::from_parts(offsets, durations, samples, timescale);
                    ImportedChannel::new(name, Unit::Unitless, w)
                }
            }
        })
        .collect();

    tracing::info!("VCD: {} variables, timescale {} fs", channels.len(), timescale);
    Ok(channels)
}

/// Identifier for variable `n`: `a`..`z`, `A`..`Z`, then two letters and up.
pub fn vcd_id(mut n: usize) -> String {
    const ALPHABET: &[u8; 52] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut id = Vec::new();
    loop {
        id.push(ALPHABET[n % 52]);
        n /= 52;
        if n == 0 {
            break;
        }
        n -= 1;
    }
    id.reverse();
    String::from_utf8_lossy(&id).into_owned()
}

/// Replace every character that is not ASCII alphanumeric with `_`.
pub fn alphanumericize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn timescale_text(fs: i64) -> String {
    const UNITS: [(i64, &str); 6] = [
        (1_000_000_000_000_000, "s"),
        (1_000_000_000_000, "ms"),
        (1_000_000_000, "us"),
        (1_000_000, "ns"),
        (1_000, "ps"),
        (1, "fs"),
    ];
    UNITS
        .iter()
        .find(|(scale, _)| fs % scale == 0)
        .map_or_else(|| format!("{fs} fs"), |(scale, unit)| format!("{} {unit}", fs / scale))
}

fn value_line(w: &Waveform, i: usize, id: &str) -> Option<String> {
    if let Some(b) = crate::waveform::digital_value(w, i) {
        return Some(format!("{}{id}", u8::from(b)));
    }
    crate::waveform::analog_value(w, i).map(|v| format!("r{v} {id}"))
}

/// Write `channels` as one module named `top`.
///
/// Sample times are rounded to multiples of `timescale` fs.
pub fn write_vcd(
    mut out: impl Write,
    channels: &[(&str, &Waveform)],
    timescale: i64,
    date: chrono::DateTime<chrono::Utc>,
) -> FormatResult<()> {
    if timescale <= 0 {
        return Err(FormatError::Unsupported(format!("timescale {timescale} fs")));
    }
    writeln!(out, "$date\n    {}\n$end", date.format("%a %b %e %H:%M:%S %Y"))?;
    writeln!(out, "$version\n    scopeflow {}\n$end", env!("CARGO_PKG_VERSION"))?;
    writeln!(out, "$timescale {} $end", timescale_text(timescale))?;
    writeln!(out, "$scope module top $end")?;
    let ids: Vec<String> = (0..channels.len()).map(vcd_id).collect();
    for ((name, w), id) in channels.iter().zip(&ids) {
        if w.is_digital() {
            writeln!(out, "$var wire 1 {id} {} $end", alphanumericize(name))?;
        } else {
            writeln!(out, "$var real 64 {id} {} $end", alphanumericize(name))?;
        }
    }
    writeln!(out, "$upscope $end\n$enddefinitions $end")?;

    // (tick, channel, sample) for every sample, time ordered
    let to_tick = |fs: i64| (fs as f64 / timescale as f64).round() as i64;
    let mut events: Vec<(i64, usize, usize)> = channels
        .iter()
        .enumerate()
        .flat_map(|(c, (_, w))| (0..w.len()).map(move |i| (to_tick(get_offset_scaled(*w, i)), c, i)))
        .collect();
    events.sort_unstable();

    let end = channels
        .iter()
        .filter_map(|(_, w)| w.len().checked_sub(1).map(|i| get_offset_scaled(*w, i) + get_duration_scaled(*w, i)))
        .max()
        .map_or(0, to_tick);

    let mut current: Option<i64> = None;
    let mut in_dump = false;
    let mut last_value: Vec<Option<String>> = vec![None; channels.len()];
    for (tick, c, i) in events {
        let Some(line) = value_line(channels[c].1, i, &ids[c]) else {
            continue;
        };
        if last_value[c].as_deref() == Some(line.as_str()) {
            continue;
        }
        if current != Some(tick) {
            if in_dump {
                writeln!(out, "$end")?;
                in_dump = false;
            }
            writeln!(out, "#{tick}")?;
            if current.is_none() {
                writeln!(out, "$dumpvars")?;
                in_dump = true;
            }
            current = Some(tick);
        }
        writeln!(out, "{line}")?;
        last_value[c] = Some(line);
    }
    if in_dump {
        writeln!(out, "$end")?;
    }
    if current.is_some_and(|t| t < end) {
        writeln!(out, "#{end}")?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SAMPLE: &str = "$date Mon Jan 1 00:00:00 2024 $end
$version test $end
$timescale 1ns $end
$scope module tb $end
$scope module dut $end
$var wire 1 ! clk $end
$var wire 4 \" count [3:0] $end
$var real 64 # vref $end
$upscope $end
$upscope $end
$enddefinitions $end
#0
$dumpvars
0!
b0000 \"
r1.5 #
$end
#10
1!
#20
0!
b0011 \"
#30
1!
r2.25 #
#40
";

    #[test]
    fn test_parse_timescale() {
        assert_eq!(parse_timescale("1ns"), Some(1_000_000));
        assert_eq!(parse_timescale("10 ps"), Some(10_000));
        assert_eq!(parse_timescale("100 us"), Some(100_000_000_000));
        assert_eq!(parse_timescale("1 parsec"), None);
    }

    #[test]
    fn test_read_vcd() {
        let channels = read_vcd(Cursor::new(SAMPLE)).unwrap();
        assert_eq!(channels.len(), 3);
        assert_eq!(channels[0].name, "clk");
        assert_eq!(channels[1].name, "count");

        let clk = channels[0].waveform.as_sparse_digital().unwrap();
        assert_eq!(clk.header.timescale, 1_000_000);
        assert_eq!(clk.offsets.to_vec(), vec![0, 10, 20, 30]);
        assert_eq!(clk.durations.to_vec(), vec![10, 10, 10, 10]);
        assert_eq!(clk.samples.to_vec(), vec![false, true, false, true]);

        let count = channels[1].waveform.as_sparse_analog().unwrap();
        assert_eq!(count.samples.to_vec(), vec![0.0, 3.0]);
        assert_eq!(count.durations.to_vec(), vec![20, 20]);

        let vref = channels[2].waveform.as_sparse_analog().unwrap();
        assert_eq!(vref.samples.to_vec(), vec![1.5, 2.25]);
    }

    #[test]
    fn test_bad_token() {
        let err = read_vcd(Cursor::new("$enddefinitions $end\n#0\n?!\n")).unwrap_err();
        assert!(matches!(err, FormatError::Parse { line: 3, .. }));
    }

    #[test]
    fn test_vcd_ids() {
        assert_eq!(vcd_id(0), "a");
        assert_eq!(vcd_id(25), "z");
        assert_eq!(vcd_id(26), "A");
        assert_eq!(vcd_id(51), "Z");
        assert_eq!(vcd_id(52), "aa");
        assert_eq!(vcd_id(53), "ab");
    }

    #[test]
    fn test_alphanumericize() {
        assert_eq!(alphanumericize("CH1 - Data[0]"), "CH1___Data_0_");
    }

    #[test]
    fn test_write_then_read() {
        let a = Waveform::SparseDigital(SparseWaveform::from_parts(
            vec![0, 100, 250],
            vec![100, 150, 450],
            vec![false, true, false],
            1_000_000,
        ));
        let date = chrono::DateTime::from_timestamp(0, 0).unwrap();
        let mut buf = Vec::new();
        write_vcd(&mut buf, &[("sig a", &a)], 1_000_000, date).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.contains("$var wire 1 a sig_a $end"));
        assert!(text.contains("$timescale 1 ns $end"));

        let back = read_vcd(Cursor::new(buf)).unwrap();
        let w = back[0].waveform.as_sparse_digital().unwrap();
        assert_eq!(w.offsets.to_vec(), vec![0, 100, 250]);
        assert_eq!(w.samples.to_vec(), vec![false, true, false]);
        assert_eq!(w.duration(2), 450);
    }
}
