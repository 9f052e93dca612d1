//! Compute pipeline: one program plus its bound resources.

use super::device::{Command, ImageBinding};
use super::error::{AccelError, AccelResult};
use super::{
    AcceleratorBuffer, AllocId, BindingLayout, CommandBuffer, ComputeDevice, ComputeImage,
    ComputeProgram, Element, ImageLayout, Sampler,
};

/// A compute program bound to N storage buffers, M storage images, K sampled
/// images and a fixed-size push-constant block.
///
/// Descriptor handling follows the device capabilities. With push descriptors
/// any number of dispatches may be recorded per recording. Without them the
/// pipeline owns a single descriptor set, so at most one `dispatch` per
/// recording is allowed; further dispatches need a fresh recording or
/// [`dispatch_no_rebind`](Self::dispatch_no_rebind).
///
/// On the wgpu backend the program is compiled when the pipeline is created
/// and each dispatch gets its own bind group.
pub struct ComputePipeline {
    device: ComputeDevice,
    program: ComputeProgram,
    buffers: Vec<Option<AllocId>>,
    storage_images: Vec<Option<ImageBinding>>,
    sampled_images: Vec<Option<ImageBinding>>,
    push_constant_size: usize,
    last_recording: Option<u64>,
    bindings_changed: bool,
}

impl ComputePipeline {
    pub fn new(
        device: &ComputeDevice,
        path: &str,
        buffers: usize,
        storage_images: usize,
        sampled_images: usize,
        push_constant_size: usize,
    ) -> AccelResult<Self> {
        let program = device.program(path)?;
        let requested = BindingLayout {
            buffers,
            storage_images,
            sampled_images,
            push_constant_size,
        };
        if program.layout != requested {
            return Err(AccelError::LayoutMismatch {
                program: path.to_string(),
                message: format!("program declares {:?}, pipeline requested {:?}", program.layout, requested),
            });
        }
        device.prepare_program(&program)?;
        Ok(Self {
            device: device.clone(),
            program,
            buffers: vec![None; buffers],
            storage_images: vec![None; storage_images],
            sampled_images: vec![None; sampled_images],
            push_constant_size,
            last_recording: None,
            bindings_changed: true,
        })
    }

    pub fn program_path(&self) -> &str {
        &self.program.path
    }

    pub fn layout(&self) -> BindingLayout {
        self.program.layout
    }

    /// Local workgroup size along X of the underlying program.
    pub fn local_size(&self) -> u32 {
        self.program.local_size
    }

    /// Workgroups needed to cover `n` invocations along X.
    pub fn groups_for(&self, n: usize) -> u32 {
        let local = self.program.local_size.max(1) as usize;
        n.div_ceil(local) as u32
    }

    /// Bind `buf` to storage slot `slot`, recording any upload it needs first.
    pub fn bind_buffer<T: Element>(
        &mut self,
        slot: usize,
        buf: &mut AcceleratorBuffer<T>,
        cmd: &mut CommandBuffer,
        output_only: bool,
    ) -> AccelResult<()> {
        if slot >= self.buffers.len() {
            return Err(AccelError::contract(format!(
                "{}: buffer slot {} out of range ({} slots)",
                self.program.path,
                slot,
                self.buffers.len()
            )));
        }
        match buf.device() {
            Some(d) if d.same_device(&self.device) => {}
            _ => {
                return Err(AccelError::contract(format!(
                    "{}: buffer bound to slot {} does not live on the pipeline's device",
                    self.program.path, slot
                )))
            }
        }
        buf.prepare_for_gpu_access_nonblocking(output_only, cmd)?;
        let alloc = buf.device_alloc();
        if self.buffers[slot] != alloc {
            self.bindings_changed = true;
        }
        self.buffers[slot] = alloc;
        Ok(())
    }

    pub fn bind_storage_image(
        &mut self,
        slot: usize,
        sampler: Sampler,
        image: &ComputeImage,
        layout: ImageLayout,
    ) -> AccelResult<()> {
        let binding = image.binding(sampler, layout);
        Self::bind_image(&self.program, &mut self.storage_images, &mut self.bindings_changed, slot, binding)
    }

    pub fn bind_sampled_image(
        &mut self,
        slot: usize,
        sampler: Sampler,
        image: &ComputeImage,
        layout: ImageLayout,
    ) -> AccelResult<()> {
        let binding = image.binding(sampler, layout);
        Self::bind_image(&self.program, &mut self.sampled_images, &mut self.bindings_changed, slot, binding)
    }

    fn bind_image(
        program: &ComputeProgram,
        slots: &mut [Option<ImageBinding>],
        changed: &mut bool,
        slot: usize,
        binding: ImageBinding,
    ) -> AccelResult<()> {
        let target = slots.get_mut(slot).ok_or_else(|| {
            AccelError::contract(format!("{}: image slot {} out of range", program.path, slot))
        })?;
        if *target != Some(binding) {
            *changed = true;
        }
        *target = Some(binding);
        Ok(())
    }

    /// Record a dispatch of `x * y * z` workgroups.
    pub fn dispatch<P: bytemuck::Pod>(
        &mut self,
        cmd: &mut CommandBuffer,
        push_constants: &P,
        x: u32,
        y: u32,
        z: u32,
    ) -> AccelResult<()> {
        self.check_recording(cmd)?;
        if !self.device.capabilities().push_descriptors
            && self.last_recording == Some(cmd.recording_id())
        {
            return Err(AccelError::contract(format!(
                "{}: second dispatch in one recording without push descriptors",
                self.program.path
            )));
        }
        self.record(cmd, push_constants, [x, y, z])
    }

    /// Record another dispatch reusing the bindings of the previous dispatch
    /// in the same recording.
    pub fn dispatch_no_rebind<P: bytemuck::Pod>(
        &mut self,
        cmd: &mut CommandBuffer,
        push_constants: &P,
        x: u32,
        y: u32,
        z: u32,
    ) -> AccelResult<()> {
        self.check_recording(cmd)?;
        if self.last_recording != Some(cmd.recording_id()) {
            return Err(AccelError::contract(format!(
                "{}: dispatch_no_rebind without an earlier dispatch in this recording",
                self.program.path
            )));
        }
        if self.bindings_changed {
            return Err(AccelError::contract(format!(
                "{}: dispatch_no_rebind after bindings changed",
                self.program.path
            )));
        }
        self.record(cmd, push_constants, [x, y, z])
    }

    /// Order shader writes of earlier dispatches before reads of later ones.
    pub fn add_compute_memory_barrier(&self, cmd: &mut CommandBuffer) {
        cmd.record(Command::Barrier);
    }

    fn check_recording(&self, cmd: &CommandBuffer) -> AccelResult<()> {
        if !cmd.device().same_device(&self.device) {
            return Err(AccelError::contract(format!(
                "{}: command buffer belongs to another device",
                self.program.path
            )));
        }
        Ok(())
    }

    fn record<P: bytemuck::Pod>(
        &mut self,
        cmd: &mut CommandBuffer,
        push_constants: &P,
        groups: [u32; 3],
    ) -> AccelResult<()> {
        let bytes = bytemuck::bytes_of(push_constants);
        if bytes.len() != self.push_constant_size {
            return Err(AccelError::contract(format!(
                "{}: push constant block is {} bytes, pipeline expects {}",
                self.program.path,
                bytes.len(),
                self.push_constant_size
            )));
        }
        let buffers = collect_bound(&self.buffers, &self.program, "buffer")?;
        let storage_images = collect_bound(&self.storage_images, &self.program, "storage image")?;
        let sampled_images = collect_bound(&self.sampled_images, &self.program, "sampled image")?;

        cmd.record(Command::Dispatch {
            program: self.program.clone(),
            buffers,
            storage_images,
            sampled_images,
            push_constants: bytes.to_vec(),
            groups,
        });
        self.last_recording = Some(cmd.recording_id());
        self.bindings_changed = false;
        Ok(())
    }
}

fn collect_bound<B: Copy>(slots: &[Option<B>], program: &ComputeProgram, kind: &str) -> AccelResult<Vec<B>> {
    slots
        .iter()
        .enumerate()
        .map(|(i, b)| {
            b.ok_or_else(|| AccelError::contract(format!("{}: {} slot {} is unbound", program.path, kind, i)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{DeviceCapabilities, KernelInvocation};
    use bytemuck::{Pod, Zeroable};

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    struct Scale {
        factor: f32,
    }

    fn scale_kernel(inv: &mut KernelInvocation<'_>) -> Result<(), String> {
        let push: Scale = inv.push_constants()?;
        let (out, inputs) = inv.output_with_inputs::<f32>(1)?;
        let input = inputs.get::<f32>(0)?;
        for (o, i) in out.iter_mut().zip(input) {
            *o = i * push.factor;
        }
        Ok(())
    }

    const SCALE_WGSL: &str = r#"
struct Args { factor: f32 }

@group(0) @binding(0) var<storage, read_write> input: array<f32>;
@group(0) @binding(1) var<storage, read_write> output: array<f32>;
@group(0) @binding(2) var<uniform> args: Args;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&output)) {
        output[id.x] = input[id.x] * args.factor;
    }
}
"#;

    fn scale_program() -> ComputeProgram {
        ComputeProgram::new(
            "shaders/Scale.spv",
            BindingLayout {
                buffers: 2,
                push_constant_size: 4,
                ..Default::default()
            },
            64,
            scale_kernel,
        )
    }

    fn device(push_descriptors: bool) -> ComputeDevice {
        let device = ComputeDevice::without_programs(DeviceCapabilities {
            push_descriptors,
            ..Default::default()
        });
        device.register_program(scale_program());
        device
    }

    fn buffers(dev: &ComputeDevice) -> (AcceleratorBuffer<f32>, AcceleratorBuffer<f32>) {
        let mut input = AcceleratorBuffer::with_device(dev);
        for v in [1.0, 2.0, 3.0] {
            input.push(v);
        }
        let mut output = AcceleratorBuffer::with_device(dev);
        output.resize(3).unwrap();
        (input, output)
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let dev = device(true);
        let err = ComputePipeline::new(&dev, "shaders/Scale.spv", 3, 0, 0, 4).err().unwrap();
        assert!(matches!(err, AccelError::LayoutMismatch { .. }));
        let err = ComputePipeline::new(&dev, "shaders/Missing.spv", 2, 0, 0, 4).err().unwrap();
        assert!(matches!(err, AccelError::ProgramNotFound(_)));
    }

    #[test]
    fn test_dispatch_runs_on_submit() {
        let dev = device(true);
        let queue = dev.queue();
        let mut cmd = dev.command_buffer();
        let (mut input, mut output) = buffers(&dev);

        let mut pipe = ComputePipeline::new(&dev, "shaders/Scale.spv", 2, 0, 0, 4).unwrap();
        pipe.bind_buffer(0, &mut input, &mut cmd, false).unwrap();
        pipe.bind_buffer(1, &mut output, &mut cmd, true).unwrap();
        let groups = pipe.groups_for(3);
        pipe.dispatch(&mut cmd, &Scale { factor: 2.0 }, groups, 1, 1).unwrap();
        output.mark_modified_from_gpu();

        queue.submit_and_block(&mut cmd).unwrap();
        output.prepare_for_cpu_access().unwrap();
        assert_eq!(output.as_slice(), &[2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_unbound_slot_is_contract_violation() {
        let dev = device(true);
        let mut cmd = dev.command_buffer();
        let (mut input, _) = buffers(&dev);
        let mut pipe = ComputePipeline::new(&dev, "shaders/Scale.spv", 2, 0, 0, 4).unwrap();
        pipe.bind_buffer(0, &mut input, &mut cmd, false).unwrap();
        let err = pipe.dispatch(&mut cmd, &Scale { factor: 1.0 }, 1, 1, 1).unwrap_err();
        assert!(matches!(err, AccelError::ContractViolation(_)));
    }

    #[test]
    fn test_push_constant_size_checked() {
        let dev = device(true);
        let mut cmd = dev.command_buffer();
        let (mut input, mut output) = buffers(&dev);
        let mut pipe = ComputePipeline::new(&dev, "shaders/Scale.spv", 2, 0, 0, 4).unwrap();
        pipe.bind_buffer(0, &mut input, &mut cmd, false).unwrap();
        pipe.bind_buffer(1, &mut output, &mut cmd, true).unwrap();
        assert!(pipe.dispatch(&mut cmd, &0u64, 1, 1, 1).is_err());
    }

    #[test]
    fn test_bound_set_mode_allows_one_dispatch_per_recording() {
        let dev = device(false);
        let queue = dev.queue();
        let mut cmd = dev.command_buffer();
        let (mut input, mut output) = buffers(&dev);
        let mut pipe = ComputePipeline::new(&dev, "shaders/Scale.spv", 2, 0, 0, 4).unwrap();
        pipe.bind_buffer(0, &mut input, &mut cmd, false).unwrap();
        pipe.bind_buffer(1, &mut output, &mut cmd, true).unwrap();
        pipe.dispatch(&mut cmd, &Scale { factor: 1.0 }, 1, 1, 1).unwrap();
        let err = pipe.dispatch(&mut cmd, &Scale { factor: 1.0 }, 1, 1, 1).unwrap_err();
        assert!(matches!(err, AccelError::ContractViolation(_)));

        // Reusing the same descriptor set is fine
        pipe.dispatch_no_rebind(&mut cmd, &Scale { factor: 1.0 }, 1, 1, 1).unwrap();

        // A fresh recording accepts a new dispatch
        queue.submit_and_block(&mut cmd).unwrap();
        pipe.dispatch(&mut cmd, &Scale { factor: 1.0 }, 1, 1, 1).unwrap();
    }

    #[test]
    fn test_push_descriptor_mode_allows_many_dispatches() {
        let dev = device(true);
        let mut cmd = dev.command_buffer();
        let (mut input, mut output) = buffers(&dev);
        let mut pipe = ComputePipeline::new(&dev, "shaders/Scale.spv", 2, 0, 0, 4).unwrap();
        pipe.bind_buffer(0, &mut input, &mut cmd, false).unwrap();
        pipe.bind_buffer(1, &mut output, &mut cmd, true).unwrap();
        pipe.dispatch(&mut cmd, &Scale { factor: 1.0 }, 1, 1, 1).unwrap();
        pipe.add_compute_memory_barrier(&mut cmd);
        pipe.dispatch(&mut cmd, &Scale { factor: 2.0 }, 1, 1, 1).unwrap();
        assert_eq!(cmd.dispatch_count(), 2);
        assert_eq!(cmd.barrier_count(), 1);
    }

    #[test]
    fn test_no_rebind_requires_prior_dispatch_and_stable_bindings() {
        let dev = device(true);
        let mut cmd = dev.command_buffer();
        let (mut input, mut output) = buffers(&dev);
        let mut other = AcceleratorBuffer::<f32>::with_device(&dev);
        other.resize(3).unwrap();

        let mut pipe = ComputePipeline::new(&dev, "shaders/Scale.spv", 2, 0, 0, 4).unwrap();
        pipe.bind_buffer(0, &mut input, &mut cmd, false).unwrap();
        pipe.bind_buffer(1, &mut output, &mut cmd, true).unwrap();
        assert!(pipe.dispatch_no_rebind(&mut cmd, &Scale { factor: 1.0 }, 1, 1, 1).is_err());

        pipe.dispatch(&mut cmd, &Scale { factor: 1.0 }, 1, 1, 1).unwrap();
        pipe.bind_buffer(1, &mut other, &mut cmd, true).unwrap();
        assert!(pipe.dispatch_no_rebind(&mut cmd, &Scale { factor: 1.0 }, 1, 1, 1).is_err());
    }

    #[test]
    fn test_wgpu_dispatch_runs_wgsl() {
        let Ok(dev) = ComputeDevice::wgpu(DeviceCapabilities::default()) else {
            return;
        };
        dev.register_program(scale_program().with_wgsl(SCALE_WGSL));
        let queue = dev.queue();
        let mut cmd = dev.command_buffer();
        let (mut input, mut output) = buffers(&dev);

        let mut pipe = ComputePipeline::new(&dev, "shaders/Scale.spv", 2, 0, 0, 4).unwrap();
        pipe.bind_buffer(0, &mut input, &mut cmd, false).unwrap();
        pipe.bind_buffer(1, &mut output, &mut cmd, true).unwrap();
        pipe.dispatch(&mut cmd, &Scale { factor: 3.0 }, pipe.groups_for(3), 1, 1)
            .unwrap();
        output.mark_modified_from_gpu();
        queue.submit_and_block(&mut cmd).unwrap();

        output.prepare_for_cpu_access().unwrap();
        assert_eq!(output.as_slice(), &[3.0, 6.0, 9.0]);
    }

    #[test]
    fn test_wgpu_rejects_program_without_wgsl() {
        let Ok(dev) = ComputeDevice::wgpu(DeviceCapabilities::default()) else {
            return;
        };
        dev.register_program(scale_program());
        let err = ComputePipeline::new(&dev, "shaders/Scale.spv", 2, 0, 0, 4).err().unwrap();
        assert!(matches!(err, AccelError::Kernel { .. }));
    }

    #[test]
    fn test_wgpu_rejects_host_only_binding() {
        let Ok(dev) = ComputeDevice::wgpu(DeviceCapabilities::default()) else {
            return;
        };
        dev.register_program(scale_program().with_wgsl(SCALE_WGSL));
        let queue = dev.queue();
        let mut cmd = dev.command_buffer();
        let (mut input, _) = buffers(&dev);
        let mut flags = AcceleratorBuffer::<bool>::with_device(&dev);
        flags.resize(3).unwrap();

        let mut pipe = ComputePipeline::new(&dev, "shaders/Scale.spv", 2, 0, 0, 4).unwrap();
        pipe.bind_buffer(0, &mut input, &mut cmd, false).unwrap();
        pipe.bind_buffer(1, &mut flags, &mut cmd, true).unwrap();
        pipe.dispatch(&mut cmd, &Scale { factor: 1.0 }, 1, 1, 1).unwrap();
        let err = queue.submit_and_block(&mut cmd).unwrap_err();
        assert!(matches!(err, AccelError::ContractViolation(_)));
    }
}
