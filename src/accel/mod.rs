//! Accelerator layer: dual-residency buffers and compute dispatch.
//!
//! # Architecture
//!
//! ```text
//! AcceleratorBuffer<T> ──bind──► ComputePipeline ──dispatch──► CommandBuffer
//!        ▲                                                        │
//!        └──────────── upload / download ◄── ComputeQueue::submit_and_block
//! ```
//!
//! - **Explicit residency**: every buffer tracks `{Clean, DirtyCpu, DirtyGpu}`
//!   and only copies across the host/device boundary when a consumer asks.
//! - **Single-threaded**: the device handle is `Rc`-based; one refresh pass
//!   owns one command buffer and one queue.
//! - **Program library**: compute programs are registered by path and checked
//!   against the binding layout a pipeline is created with.
//! - **Two backends**: a wgpu adapter runs the WGSL side of each program on
//!   storage buffers; without an adapter the same programs run as host
//!   kernels over emulated device memory.

pub mod buffer;
pub mod device;
pub mod error;
mod gpu;
pub mod kernels;
pub mod pipeline;

pub use buffer::{AcceleratorBuffer, AccessHint, Residency};
pub use device::{
    AllocId, BindingLayout, CommandBuffer, ComputeDevice, ComputeImage, ComputeProgram,
    ComputeQueue, DeviceBackend, DeviceCapabilities, ImageLayout, KernelFn, KernelInputs, KernelInvocation,
    Sampler,
};
pub use error::{AccelError, AccelResult};
pub use pipeline::ComputePipeline;

/// Element types an [`AcceleratorBuffer`] can hold.
///
/// Types with a plain-old-data layout expose their bytes so the wgpu backend
/// can place them in storage buffers. Everything else stays host-mirrored on
/// that backend and cannot be bound to a dispatch.
pub trait Element: Clone + Default + 'static {
    /// Device representation of `data`, if the type has one.
    fn device_bytes(_data: &[Self]) -> Option<&[u8]> {
        None
    }

    /// Fill `dst` from device bytes. Returns false if the type has no device
    /// layout or `bytes` is too short.
    fn read_device_bytes(_dst: &mut [Self], _bytes: &[u8]) -> bool {
        false
    }
}

macro_rules! device_elements {
    ($($t:ty),*) => {$(
        impl Element for $t {
            fn device_bytes(data: &[Self]) -> Option<&[u8]> {
                Some(bytemuck::cast_slice(data))
            }

            fn read_device_bytes(dst: &mut [Self], bytes: &[u8]) -> bool {
                let out: &mut [u8] = bytemuck::cast_slice_mut(dst);
                match bytes.get(..out.len()) {
                    Some(src) => {
                        out.copy_from_slice(src);
                        true
                    }
                    None => false,
                }
            }
        }
    )*};
}

macro_rules! host_elements {
    ($($t:ty),*) => {$(
        impl Element for $t {}
    )*};
}

device_elements!(f32, f64, i32, u32, i64, u64);
host_elements!(bool, u8, i8, u16, i16, usize, isize, char, String);
