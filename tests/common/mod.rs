//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use scopeflow::pipeline::{FilterGraph, NodeId, Stream, StreamDescriptor};
use scopeflow::waveform::WaveformBase;

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}

/// Samples of an analog output stream, empty if it has none
///
/// Pulls device-resident data back to the host first.
pub fn analog_output(graph: &mut FilterGraph, node: NodeId, stream: usize) -> Vec<f32> {
    let Some(w) = graph
        .stream_mut(StreamDescriptor::new(node, stream))
        .and_then(Stream::waveform_mut)
    else {
        return Vec::new();
    };
    w.prepare_for_cpu_access().unwrap();
    w.analog_samples().map(<[f32]>::to_vec).unwrap_or_default()
}

pub fn scalar_output(graph: &FilterGraph, node: NodeId, stream: usize) -> Option<f64> {
    graph
        .stream(StreamDescriptor::new(node, stream))
        .and_then(Stream::scalar_value)
}

/// Square wave alternating `[-1, +1]`
pub fn square(cycles: usize) -> Vec<f32> {
    (0..cycles).flat_map(|_| [-1.0f32, 1.0]).collect()
}

/// `[0, 1]` square wave, 20 samples per level, with deterministic uniform
/// noise in `±amplitude` clipped to the swing
pub fn noisy_square(cycles: usize, amplitude: f64) -> Vec<f32> {
    (0..cycles * 40)
        .map(|k| {
            let level = if k % 40 >= 20 { 1.0 } else { 0.0 };
            let noise = amplitude * (2.0 * (k as f64 * 0.618).fract() - 1.0);
            (level + noise).clamp(0.0, 1.0) as f32
        })
        .collect()
}
