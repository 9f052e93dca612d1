//! wgpu backend for [`ComputeDevice`](super::ComputeDevice).
//!
//! Device allocations are storage buffers and images are `R32Float`
//! textures. Programs are WGSL with a `main` entry point and their bindings
//! laid out in a fixed order on group 0:
//!
//! ```text
//! 0 .. B          storage buffers, declared read_write
//! B .. B+S        write-only storage images
//! B+S .. B+S+K    sampled images, read with textureLoad
//! B+S+K           uniform block holding the push constants
//! ```
//!
//! The push-constant block travels as a uniform buffer padded to 16 bytes, so
//! the `bytemuck` argument structs that drive the host kernels drive the WGSL
//! programs unchanged.

use super::device::{BindingLayout, ComputeProgram};
use super::error::{AccelError, AccelResult};
use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use wgpu::util::DeviceExt;

/// Texel format of every device image.
pub(crate) const IMAGE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Float;

/// Uniform blocks are padded to this many bytes.
const UNIFORM_ALIGN: usize = 16;

/// Size of the buffer backing `bytes` of data: at least 4, a multiple of 4.
pub(crate) fn padded_size(bytes: usize) -> u64 {
    (bytes.max(4).div_ceil(4) * 4) as u64
}

fn pad_to(bytes: &[u8], align: usize) -> Cow<'_, [u8]> {
    let len = bytes.len().max(align).div_ceil(align) * align;
    if len == bytes.len() {
        Cow::Borrowed(bytes)
    } else {
        let mut out = bytes.to_vec();
        out.resize(len, 0);
        Cow::Owned(out)
    }
}

fn storage_usage() -> wgpu::BufferUsages {
    wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST
}

/// Bind group layout entries for a program's [`BindingLayout`].
fn layout_entries(layout: &BindingLayout) -> Vec<wgpu::BindGroupLayoutEntry> {
    let buffer = wgpu::BindingType::Buffer {
        ty: wgpu::BufferBindingType::Storage { read_only: false },
        has_dynamic_offset: false,
        min_binding_size: None,
    };
    let storage_image = wgpu::BindingType::StorageTexture {
        access: wgpu::StorageTextureAccess::WriteOnly,
        format: IMAGE_FORMAT,
        view_dimension: wgpu::TextureViewDimension::D2,
    };
    let sampled_image = wgpu::BindingType::Texture {
        sample_type: wgpu::TextureSampleType::Float { filterable: false },
        view_dimension: wgpu::TextureViewDimension::D2,
        multisampled: false,
    };
    let uniform = wgpu::BindingType::Buffer {
        ty: wgpu::BufferBindingType::Uniform,
        has_dynamic_offset: false,
        min_binding_size: None,
    };

    std::iter::repeat(buffer)
        .take(layout.buffers)
        .chain(std::iter::repeat(storage_image).take(layout.storage_images))
        .chain(std::iter::repeat(sampled_image).take(layout.sampled_images))
        .chain((layout.push_constant_size > 0).then_some(uniform))
        .enumerate()
        .map(|(binding, ty)| wgpu::BindGroupLayoutEntry {
            binding: binding as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty,
            count: None,
        })
        .collect()
}

pub(crate) struct CompiledProgram {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

/// Resources of one dispatch, in binding order.
pub(crate) struct DispatchResources<'a> {
    pub buffers: Vec<&'a wgpu::Buffer>,
    pub storage_images: Vec<wgpu::TextureView>,
    pub sampled_images: Vec<wgpu::TextureView>,
    pub push_constants: &'a [u8],
    pub groups: [u32; 3],
}

pub(crate) struct WgpuBackend {
    runtime: tokio::runtime::Runtime,
    info: wgpu::AdapterInfo,
    limits: wgpu::Limits,
    device: wgpu::Device,
    queue: wgpu::Queue,
    programs: RefCell<HashMap<Rc<str>, Rc<CompiledProgram>>>,
}

impl WgpuBackend {
    /// Open the highest-performance adapter the platform offers.
    pub(crate) fn open() -> AccelResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(|e| AccelError::Backend(format!("async runtime: {}", e)))?;

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = runtime
            .block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            }))
            .ok_or(AccelError::NoAdapter)?;

        let info = adapter.get_info();
        let limits = adapter.limits();
        let (device, queue) = runtime
            .block_on(adapter.request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("scopeflow compute"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    ..Default::default()
                },
                None,
            ))
            .map_err(|e| AccelError::Backend(e.to_string()))?;
        device.on_uncaptured_error(Box::new(|e| tracing::error!("wgpu: {}", e)));

        tracing::debug!("Opened wgpu adapter {} ({:?})", info.name, info.backend);
        Ok(Self {
            runtime,
            info,
            limits,
            device,
            queue,
            programs: RefCell::new(HashMap::new()),
        })
    }

    pub(crate) fn adapter_name(&self) -> String {
        format!("{} ({:?})", self.info.name, self.info.backend)
    }

    fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    fn wait(&self) {
        let _ = self.device.poll(wgpu::Maintain::Wait);
    }

    pub(crate) fn push_validation_scope(&self) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
    }

    pub(crate) fn pop_error_scope(&self) -> AccelResult<()> {
        match self.runtime.block_on(self.device.pop_error_scope()) {
            Some(e) => Err(AccelError::Backend(e.to_string())),
            None => Ok(()),
        }
    }

    /// Zero-initialised storage buffer for `bytes` of data.
    pub(crate) fn create_buffer(&self, bytes: usize) -> AccelResult<wgpu::Buffer> {
        let size = padded_size(bytes);
        if size > self.limits.max_buffer_size
            || size > u64::from(self.limits.max_storage_buffer_binding_size)
        {
            return Err(AccelError::Backend(format!(
                "{} byte buffer exceeds the adapter limits",
                bytes
            )));
        }
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("scopeflow storage"),
            size,
            usage: storage_usage(),
            mapped_at_creation: false,
        });
        self.pop_error_scope()?;
        Ok(buffer)
    }

    pub(crate) fn create_image(&self, width: u32, height: u32) -> AccelResult<wgpu::Texture> {
        let max = self.limits.max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(AccelError::contract(format!(
                "{}x{} image outside 1..={} texels per side",
                width, height, max
            )));
        }
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("scopeflow image"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: IMAGE_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.pop_error_scope()?;
        Ok(texture)
    }

    /// Staging buffer holding `bytes`, ready to copy into a storage buffer.
    pub(crate) fn upload_staging(&self, bytes: &[u8]) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("scopeflow upload"),
                contents: &pad_to(bytes, 4),
                usage: wgpu::BufferUsages::COPY_SRC,
            })
    }

    /// Mappable buffer for reading back `bytes`.
    pub(crate) fn readback_staging(&self, bytes: usize) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("scopeflow readback"),
            size: padded_size(bytes),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Block until `staging` maps and return its first `bytes` bytes.
    pub(crate) fn map_read(&self, staging: &wgpu::Buffer, bytes: usize) -> AccelResult<Vec<u8>> {
        let slice = staging.slice(..);
        let (tx, rx) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.wait();
        rx.recv()
            .map_err(|_| AccelError::Backend("readback callback dropped".into()))?
            .map_err(|e| AccelError::Backend(format!("readback: {}", e)))?;

        let view = slice.get_mapped_range();
        let data = view.get(..bytes).map(<[u8]>::to_vec);
        drop(view);
        staging.unmap();
        data.ok_or_else(|| AccelError::contract("readback longer than its staging buffer"))
    }

    pub(crate) fn write_buffer(&self, buffer: &wgpu::Buffer, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.queue.write_buffer(buffer, 0, &pad_to(bytes, 4));
        self.queue.submit(std::iter::empty());
        self.wait();
    }

    pub(crate) fn read_buffer(&self, buffer: &wgpu::Buffer, bytes: usize) -> AccelResult<Vec<u8>> {
        let staging = self.readback_staging(bytes);
        let mut encoder = self.encoder("scopeflow download");
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, staging.size());
        self.queue.submit(Some(encoder.finish()));
        self.map_read(&staging, bytes)
    }

    /// Copy the common prefix of `src` into `dst`.
    pub(crate) fn copy_prefix(&self, src: &wgpu::Buffer, dst: &wgpu::Buffer) {
        let mut encoder = self.encoder("scopeflow resize");
        encoder.copy_buffer_to_buffer(src, 0, dst, 0, src.size().min(dst.size()));
        self.queue.submit(Some(encoder.finish()));
        self.wait();
    }

    fn texture_copy(texture: &wgpu::Texture) -> wgpu::ImageCopyTexture<'_> {
        wgpu::ImageCopyTexture {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        }
    }

    pub(crate) fn write_image(&self, texture: &wgpu::Texture, pixels: &[f32]) {
        let size = texture.size();
        self.queue.write_texture(
            Self::texture_copy(texture),
            bytemuck::cast_slice(pixels),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(size.width * 4),
                rows_per_image: Some(size.height),
            },
            size,
        );
        self.queue.submit(std::iter::empty());
        self.wait();
    }

    pub(crate) fn read_image(&self, texture: &wgpu::Texture) -> AccelResult<Vec<f32>> {
        let size = texture.size();
        let row = size.width as usize * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize;
        let padded_row = row.div_ceil(align) * align;
        let total = padded_row * size.height as usize;

        let staging = self.readback_staging(total);
        let mut encoder = self.encoder("scopeflow image download");
        encoder.copy_texture_to_buffer(
            Self::texture_copy(texture),
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row as u32),
                    rows_per_image: Some(size.height),
                },
            },
            size,
        );
        self.queue.submit(Some(encoder.finish()));
        let bytes = self.map_read(&staging, total)?;

        let mut pixels = vec![0.0f32; size.width as usize * size.height as usize];
        let out: &mut [u8] = bytemuck::cast_slice_mut(&mut pixels);
        for (dst, src) in out.chunks_exact_mut(row).zip(bytes.chunks(padded_row)) {
            dst.copy_from_slice(&src[..row]);
        }
        Ok(pixels)
    }

    /// Compile `program` on first use.
    pub(crate) fn compile(&self, program: &ComputeProgram) -> AccelResult<Rc<CompiledProgram>> {
        if let Some(compiled) = self.programs.borrow().get(&program.path) {
            return Ok(compiled.clone());
        }
        let source = program.wgsl.ok_or_else(|| AccelError::Kernel {
            program: program.path.to_string(),
            message: "no WGSL source for the GPU backend".into(),
        })?;
        let label = Some(&*program.path);

        self.push_validation_scope();
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label,
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
        });
        let bind_group_layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label,
                entries: &layout_entries(&program.layout),
            });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label,
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label,
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: "main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
        self.pop_error_scope().map_err(|e| AccelError::Kernel {
            program: program.path.to_string(),
            message: e.to_string(),
        })?;

        tracing::debug!("Compiled {} for {}", program.path, self.info.name);
        let compiled = Rc::new(CompiledProgram {
            pipeline,
            bind_group_layout,
        });
        self.programs
            .borrow_mut()
            .insert(program.path.clone(), compiled.clone());
        Ok(compiled)
    }

    /// Stage the push constants, bind `resources` and record one dispatch.
    pub(crate) fn encode_dispatch(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        program: &ComputeProgram,
        resources: DispatchResources<'_>,
    ) -> AccelResult<()> {
        let max = self.limits.max_compute_workgroups_per_dimension;
        if resources.groups.iter().any(|&g| g > max) {
            return Err(AccelError::contract(format!(
                "dispatch of {:?} workgroups exceeds {} per dimension",
                resources.groups, max
            )));
        }
        let compiled = self.compile(program)?;
        let label = Some(&*program.path);

        let uniform = (program.layout.push_constant_size > 0).then(|| {
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label,
                    contents: &pad_to(resources.push_constants, UNIFORM_ALIGN),
                    usage: wgpu::BufferUsages::UNIFORM,
                })
        });
        let entries: Vec<wgpu::BindGroupEntry<'_>> = resources
            .buffers
            .iter()
            .map(|b| b.as_entire_binding())
            .chain(resources.storage_images.iter().map(wgpu::BindingResource::TextureView))
            .chain(resources.sampled_images.iter().map(wgpu::BindingResource::TextureView))
            .chain(uniform.iter().map(wgpu::Buffer::as_entire_binding))
            .enumerate()
            .map(|(binding, resource)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource,
            })
            .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label,
            layout: &compiled.bind_group_layout,
            entries: &entries,
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label,
            timestamp_writes: None,
        });
        pass.set_pipeline(&compiled.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        let [x, y, z] = resources.groups;
        pass.dispatch_workgroups(x, y, z);
        Ok(())
    }

    pub(crate) fn command_encoder(&self) -> wgpu::CommandEncoder {
        self.encoder("scopeflow recording")
    }

    /// Submit a finished recording and wait for the queue to drain.
    pub(crate) fn submit(&self, commands: wgpu::CommandBuffer) {
        self.queue.submit(Some(commands));
        self.wait();
    }
}
