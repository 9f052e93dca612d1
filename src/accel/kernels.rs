//! Built-in compute programs.
//!
//! Each program is registered under the path a filter asks for when it builds
//! its [`ComputePipeline`](super::ComputePipeline). Push-constant blocks are
//! `#[repr(C)]` Pod structs shared with the filters that dispatch them.
//!
//! Every program has two forms: a host kernel and a WGSL source with the same
//! bindings. The WGSL side reads 64-bit timestamps as `vec2<u32>` pairs and
//! keeps 64-bit histogram bins as lo/hi `u32` words.

use super::device::{BindingLayout, ComputeDevice, ComputeProgram, KernelFn, KernelInvocation};
use bytemuck::{Pod, Zeroable};

pub const SUBTRACT: &str = "shaders/SubtractFilter.spv";
pub const REDUCE_SUM: &str = "shaders/ReduceSum.spv";
pub const HISTOGRAM: &str = "shaders/Histogram.spv";
pub const DDJ: &str = "shaders/DDJ.spv";
pub const IMAGE_SCALE: &str = "shaders/ImageScale.spv";

/// Invocations per workgroup for the 1-D programs.
pub const LOCAL_SIZE: u32 = 64;

/// Elements summed by one ReduceSum workgroup.
pub const REDUCE_BLOCK: u32 = 256;

/// Number of 8-bit data histories tracked by DDJ.
pub const DDJ_PATTERNS: usize = 256;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Zeroable, Pod)]
pub struct SubtractArgs {
    pub offset_a: u32,
    pub offset_b: u32,
    pub len: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Zeroable, Pod)]
pub struct ReduceArgs {
    pub len: u32,
    pub block: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Zeroable, Pod)]
pub struct HistogramArgs {
    pub len: u32,
    pub nbins: u32,
    pub vmin: f32,
    pub vrange: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Zeroable, Pod)]
pub struct DdjArgs {
    pub nbits: u32,
    pub ntie: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Zeroable, Pod)]
pub struct ImageScaleArgs {
    pub gain: f32,
}

const SUBTRACT_WGSL: &str = r#"
struct Args { offset_a: u32, offset_b: u32, len: u32 }

@group(0) @binding(0) var<storage, read_write> dst: array<f32>;
@group(0) @binding(1) var<storage, read_write> a: array<f32>;
@group(0) @binding(2) var<storage, read_write> b: array<f32>;
@group(0) @binding(3) var<uniform> args: Args;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= args.len) {
        return;
    }
    dst[i] = a[i + args.offset_a] - b[i + args.offset_b];
}
"#;

const REDUCE_SUM_WGSL: &str = r#"
struct Args { len: u32, block: u32 }

@group(0) @binding(0) var<storage, read_write> partials: array<f32>;
@group(0) @binding(1) var<storage, read_write> input: array<f32>;
@group(0) @binding(2) var<uniform> args: Args;

var<workgroup> scratch: array<f32, 64>;

@compute @workgroup_size(64)
fn main(@builtin(workgroup_id) group: vec3<u32>, @builtin(local_invocation_index) lane: u32) {
    let start = group.x * args.block;
    let end = min(start + args.block, args.len);
    var acc = 0.0;
    for (var i = start + lane; i < end; i = i + 64u) {
        acc = acc + input[i];
    }
    scratch[lane] = acc;
    workgroupBarrier();
    for (var stride = 32u; stride > 0u; stride = stride >> 1u) {
        if (lane < stride) {
            scratch[lane] = scratch[lane] + scratch[lane + stride];
        }
        workgroupBarrier();
    }
    if (lane == 0u) {
        partials[group.x] = scratch[0];
    }
}
"#;

const HISTOGRAM_WGSL: &str = r#"
struct Args { len: u32, nbins: u32, vmin: f32, vrange: f32 }

@group(0) @binding(0) var<storage, read_write> bins: array<atomic<u32>>;
@group(0) @binding(1) var<storage, read_write> input: array<f32>;
@group(0) @binding(2) var<uniform> args: Args;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= args.len) {
        return;
    }
    let scaled = (input[i] - args.vmin) / args.vrange * f32(args.nbins);
    let bin = min(u32(max(scaled, 0.0)), args.nbins - 1u);
    let lo = atomicAdd(&bins[2u * bin], 1u);
    if (lo == 0xffffffffu) {
        _ = atomicAdd(&bins[2u * bin + 1u], 1u);
    }
}
"#;

const DDJ_WGSL: &str = r#"
struct Args { nbits: u32, ntie: u32 }

@group(0) @binding(0) var<storage, read_write> table: array<f32>;
@group(0) @binding(1) var<storage, read_write> bits: array<u32>;
@group(0) @binding(2) var<storage, read_write> starts: array<vec2<u32>>;
@group(0) @binding(3) var<storage, read_write> ends: array<vec2<u32>>;
@group(0) @binding(4) var<storage, read_write> tie_times: array<vec2<u32>>;
@group(0) @binding(5) var<storage, read_write> tie_values: array<f32>;
@group(0) @binding(6) var<uniform> args: Args;

// Signed 64-bit a < b, words stored low first.
fn less(a: vec2<u32>, b: vec2<u32>) -> bool {
    let ah = bitcast<i32>(a.y);
    let bh = bitcast<i32>(b.y);
    return ah < bh || (ah == bh && a.x < b.x);
}

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let pattern = id.x;
    if (pattern >= 256u) {
        return;
    }
    var sum = 0.0;
    var count = 0u;
    for (var i = 7u; i < args.nbits; i = i + 1u) {
        var window = 0u;
        for (var k = 0u; k < 8u; k = k + 1u) {
            window = (window << 1u) | (bits[i - 7u + k] & 1u);
        }
        if (window != pattern) {
            continue;
        }
        let start = starts[i];
        let end = ends[i];
        var lo = 0u;
        var hi = args.ntie;
        while (lo < hi) {
            let mid = (lo + hi) / 2u;
            if (less(tie_times[mid], start)) {
                lo = mid + 1u;
            } else {
                hi = mid;
            }
        }
        for (var j = lo; j < args.ntie; j = j + 1u) {
            if (!less(tie_times[j], end)) {
                break;
            }
            sum = sum + tie_values[j];
            count = count + 1u;
        }
    }
    table[pattern] = sum;
    table[256u + pattern] = f32(count);
}
"#;

const IMAGE_SCALE_WGSL: &str = r#"
struct Args { gain: f32 }

@group(0) @binding(0) var dst: texture_storage_2d<r32float, write>;
@group(0) @binding(1) var src: texture_2d<f32>;
@group(0) @binding(2) var<uniform> args: Args;

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let dd = textureDimensions(dst);
    if (id.x >= dd.x || id.y >= dd.y) {
        return;
    }
    let sd = textureDimensions(src);
    let texel = vec2<u32>(id.x * sd.x / dd.x, id.y * sd.y / dd.y);
    let v = textureLoad(src, texel, 0).x;
    textureStore(dst, vec2<u32>(id.x, id.y), vec4<f32>(args.gain * v, 0.0, 0.0, 1.0));
}
"#;

/// Register every built-in program on `device`.
pub fn register_builtin_programs(device: &ComputeDevice) {
    let programs: [(&str, BindingLayout, KernelFn, &'static str); 5] = [
        (SUBTRACT, layout(3, 0, 0, std::mem::size_of::<SubtractArgs>()), subtract, SUBTRACT_WGSL),
        (REDUCE_SUM, layout(2, 0, 0, std::mem::size_of::<ReduceArgs>()), reduce_sum, REDUCE_SUM_WGSL),
        (HISTOGRAM, layout(2, 0, 0, std::mem::size_of::<HistogramArgs>()), histogram, HISTOGRAM_WGSL),
        (DDJ, layout(6, 0, 0, std::mem::size_of::<DdjArgs>()), ddj, DDJ_WGSL),
        (IMAGE_SCALE, layout(0, 1, 1, std::mem::size_of::<ImageScaleArgs>()), image_scale, IMAGE_SCALE_WGSL),
    ];
    for (path, layout, entry, wgsl) in programs {
        device.register_program(ComputeProgram::new(path, layout, LOCAL_SIZE, entry).with_wgsl(wgsl));
    }
    tracing::debug!("Registered {} built-in compute programs", programs.len());
}

fn layout(buffers: usize, storage_images: usize, sampled_images: usize, push: usize) -> BindingLayout {
    BindingLayout {
        buffers,
        storage_images,
        sampled_images,
        push_constant_size: push,
    }
}

/// Histogram bin of `v`, clamped into `[0, nbins)`. Shared with the CPU path.
#[inline]
pub fn histogram_bin(v: f32, vmin: f32, vrange: f32, nbins: usize) -> usize {
    let scaled = ((v - vmin) / vrange) * nbins as f32;
    (scaled.max(0.0) as usize).min(nbins - 1)
}

/// `out[i] = a[i + offset_a] - b[i + offset_b]`
fn subtract(inv: &mut KernelInvocation<'_>) -> Result<(), String> {
    let args: SubtractArgs = inv.push_constants()?;
    let (out, inputs) = inv.output_with_inputs::<f32>(0)?;
    let a = inputs.get::<f32>(1)?;
    let b = inputs.get::<f32>(2)?;
    let len = args.len as usize;
    let a = a
        .get(args.offset_a as usize..args.offset_a as usize + len)
        .ok_or("input A shorter than dispatch")?;
    let b = b
        .get(args.offset_b as usize..args.offset_b as usize + len)
        .ok_or("input B shorter than dispatch")?;
    let out = out.get_mut(..len).ok_or("output shorter than dispatch")?;
    for ((o, x), y) in out.iter_mut().zip(a).zip(b) {
        *o = x - y;
    }
    Ok(())
}

/// One partial sum per workgroup over consecutive blocks of the input.
fn reduce_sum(inv: &mut KernelInvocation<'_>) -> Result<(), String> {
    let args: ReduceArgs = inv.push_constants()?;
    let groups = inv.groups()[0] as usize;
    let (out, inputs) = inv.output_with_inputs::<f32>(0)?;
    let input = inputs.get::<f32>(1)?;
    let input = input.get(..args.len as usize).ok_or("input shorter than dispatch")?;
    let block = args.block.max(1) as usize;
    for (g, chunk) in input.chunks(block).enumerate().take(groups) {
        let slot = out.get_mut(g).ok_or("partial sum buffer too small")?;
        *slot = chunk.iter().map(|&v| v as f64).sum::<f64>() as f32;
    }
    Ok(())
}

/// 64-bit histogram of the input samples, added onto the existing bin counts.
fn histogram(inv: &mut KernelInvocation<'_>) -> Result<(), String> {
    let args: HistogramArgs = inv.push_constants()?;
    let nbins = args.nbins as usize;
    if nbins == 0 {
        return Err("zero bins".to_string());
    }
    let (out, inputs) = inv.output_with_inputs::<i64>(0)?;
    let input = inputs.get::<f32>(1)?;
    let out = out.get_mut(..nbins).ok_or("bin buffer too small")?;
    for &v in input.iter().take(args.len as usize) {
        out[histogram_bin(v, args.vmin, args.vrange, nbins)] += 1;
    }
    Ok(())
}

/// Per-history TIE sums and counts.
///
/// Bindings: 0 = out (`f32[2 * DDJ_PATTERNS]`, sums then counts), 1 = bits
/// (`u32`), 2 = bit start (fs), 3 = bit end (fs), 4 = TIE timestamp (fs),
/// 5 = TIE value (fs).
fn ddj(inv: &mut KernelInvocation<'_>) -> Result<(), String> {
    let args: DdjArgs = inv.push_constants()?;
    let (out, inputs) = inv.output_with_inputs::<f32>(0)?;
    let bits = inputs.get::<u32>(1)?;
    let starts = inputs.get::<i64>(2)?;
    let ends = inputs.get::<i64>(3)?;
    let tie_times = inputs.get::<i64>(4)?;
    let tie_values = inputs.get::<f32>(5)?;
    let out = out.get_mut(..2 * DDJ_PATTERNS).ok_or("output buffer too small")?;

    let nbits = (args.nbits as usize).min(bits.len()).min(starts.len()).min(ends.len());
    let ntie = (args.ntie as usize).min(tie_times.len()).min(tie_values.len());
    let tie_times = &tie_times[..ntie];

    let mut sums = [0.0f64; DDJ_PATTERNS];
    let mut counts = [0u32; DDJ_PATTERNS];
    // Bit i closes the window bits[i - 7..=i]; the first full window ends at bit 7.
    for i in 7..nbits {
        let window = bits[i - 7..=i].iter().fold(0usize, |w, &b| (w << 1) | (b & 1) as usize);
        let (start, end) = (starts[i], ends[i]);
        let first = tie_times.partition_point(|&t| t < start);
        for j in first..ntie {
            if tie_times[j] >= end {
                break;
            }
            sums[window] += tie_values[j] as f64;
            counts[window] += 1;
        }
    }
    let (out_sums, out_counts) = out.split_at_mut(DDJ_PATTERNS);
    for (o, s) in out_sums.iter_mut().zip(sums) {
        *o = s as f32;
    }
    for (o, n) in out_counts.iter_mut().zip(counts) {
        *o = n as f32;
    }
    Ok(())
}

/// `storage = gain * sampled`, nearest-neighbour resampled to the storage size.
fn image_scale(inv: &mut KernelInvocation<'_>) -> Result<(), String> {
    let args: ImageScaleArgs = inv.push_constants()?;
    let (dst, (dw, dh), src, (sw, sh)) = inv.image_pair(0, 0)?;
    if sw == 0 || sh == 0 {
        return Ok(());
    }
    for y in 0..dh as usize {
        let sy = y * sh as usize / dh.max(1) as usize;
        for x in 0..dw as usize {
            let sx = x * sw as usize / dw.max(1) as usize;
            dst[y * dw as usize + x] = args.gain * src[sy * sw as usize + sx];
        }
    }
    Ok(())
}
