//! Compute device model.
//!
//! A [`ComputeDevice`] owns a device-side memory heap, a library of compute
//! programs keyed by path, and hands out [`CommandBuffer`]s and a
//! [`ComputeQueue`]. Device memory is kept apart from host memory: every byte
//! that crosses the boundary goes through an explicit upload or download,
//! either recorded into a command buffer or performed as a blocking transfer.
//!
//! The device is single-threaded (`Rc` + `RefCell`). A refresh pass owns one
//! command buffer and one queue; `submit_and_block` is the only point where
//! recorded work actually runs.
//!
//! Two backends sit behind the same API. [`DeviceBackend::Wgpu`] keeps
//! allocations in wgpu storage buffers and runs the WGSL form of each
//! program. [`DeviceBackend::Host`] emulates device memory on the host and
//! runs the host kernel form; it is used whenever no adapter can be opened.

use super::error::{AccelError, AccelResult};
use super::gpu::{padded_size, DispatchResources, WgpuBackend};
use super::kernels;
use super::Element;
use std::any::Any;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

/// Default device memory budget (1 GiB).
pub const DEFAULT_MEMORY_BUDGET: usize = 1 << 30;

/// Optional device features that select between filter code paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Descriptors can be pushed directly into a recording, allowing several
    /// dispatches of one pipeline per recording.
    pub push_descriptors: bool,
    /// 64-bit integer atomics are available to compute programs.
    pub int64_atomics: bool,
    /// 32-bit float atomics are available to compute programs.
    pub float_atomics: bool,
    /// Total bytes of device memory the heap may hand out.
    pub memory_budget: usize,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            push_descriptors: true,
            int64_atomics: true,
            float_atomics: true,
            memory_budget: DEFAULT_MEMORY_BUDGET,
        }
    }
}

/// Handle to a device memory allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocId(pub u32);

impl AllocId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for AllocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AllocId({})", self.0)
    }
}

/// Where the compute programs of a device run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceBackend {
    /// Device memory emulated on the host, host kernels.
    Host,
    /// wgpu storage buffers and WGSL programs.
    Wgpu,
}

enum SlotData {
    /// Typed host vector. Every slot of the host backend, and slots of
    /// element types without a device layout on the wgpu backend.
    Host(Box<dyn Any>),
    Buffer(wgpu::Buffer),
    Image(wgpu::Texture),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Host,
    Buffer,
    Image,
}

struct HeapSlot {
    data: SlotData,
    bytes: usize,
}

impl HeapSlot {
    fn kind(&self) -> SlotKind {
        match self.data {
            SlotData::Host(_) => SlotKind::Host,
            SlotData::Buffer(_) => SlotKind::Buffer,
            SlotData::Image(_) => SlotKind::Image,
        }
    }

    fn host(&self) -> AccelResult<&dyn Any> {
        match &self.data {
            SlotData::Host(data) => Ok(data.as_ref()),
            _ => Err(AccelError::contract("allocation is not host-resident")),
        }
    }
}

struct DeviceHeap {
    slots: Vec<Option<HeapSlot>>,
    free: Vec<u32>,
    in_use: usize,
    budget: usize,
}

impl DeviceHeap {
    fn new(budget: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            in_use: 0,
            budget,
        }
    }

    fn check_growth(&self, old: usize, new: usize) -> AccelResult<()> {
        if new > old && self.in_use + (new - old) > self.budget {
            return Err(AccelError::OutOfMemory {
                requested: new - old,
                in_use: self.in_use,
                budget: self.budget,
            });
        }
        Ok(())
    }

    fn slot(&self, id: AllocId) -> AccelResult<&HeapSlot> {
        self.slots
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| AccelError::contract(format!("{:?} is not a live allocation", id)))
    }

    fn slot_mut(&mut self, id: AllocId) -> AccelResult<&mut HeapSlot> {
        self.slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| AccelError::contract(format!("{:?} is not a live allocation", id)))
    }

    fn allocate(&mut self, data: SlotData, bytes: usize) -> AccelResult<AllocId> {
        self.check_growth(0, bytes)?;
        self.in_use += bytes;
        let slot = Some(HeapSlot { data, bytes });
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = slot;
            Ok(AllocId(idx))
        } else {
            self.slots.push(slot);
            Ok(AllocId(self.slots.len() as u32 - 1))
        }
    }

    fn replace(&mut self, id: AllocId, data: SlotData, bytes: usize) -> AccelResult<()> {
        let old = self.slot(id)?.bytes;
        self.check_growth(old, bytes)?;
        let slot = self.slot_mut(id)?;
        slot.data = data;
        slot.bytes = bytes;
        self.in_use = self.in_use - old + bytes;
        Ok(())
    }

    fn resize_host<T: Element>(&mut self, id: AllocId, len: usize) -> AccelResult<()> {
        let bytes = len * std::mem::size_of::<T>();
        let old = self.slot(id)?.bytes;
        self.check_growth(old, bytes)?;
        let slot = self.slot_mut(id)?;
        let vec = match &mut slot.data {
            SlotData::Host(data) => data.downcast_mut::<Vec<T>>(),
            _ => None,
        }
        .ok_or_else(|| AccelError::contract("allocation element type mismatch"))?;
        vec.resize(len, T::default());
        slot.bytes = bytes;
        self.in_use = self.in_use - old + bytes;
        Ok(())
    }

    fn take(&mut self, id: AllocId) -> AccelResult<HeapSlot> {
        self.slots
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or_else(|| {
                AccelError::contract(format!("{:?} is not live or is bound twice in one dispatch", id))
            })
    }

    fn restore(&mut self, id: AllocId, slot: HeapSlot) {
        self.slots[id.index()] = Some(slot);
    }

    fn release(&mut self, id: AllocId) {
        if let Some(slot) = self.slots.get_mut(id.index()).and_then(Option::take) {
            self.in_use -= slot.bytes;
            self.free.push(id.0);
        }
    }

    fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Entry point of a compute program.
pub type KernelFn = fn(&mut KernelInvocation<'_>) -> Result<(), String>;

/// Number and kind of resources a compute program binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BindingLayout {
    pub buffers: usize,
    pub storage_images: usize,
    pub sampled_images: usize,
    pub push_constant_size: usize,
}

/// A compute program: its binding layout, its host entry point and the WGSL
/// source the wgpu backend compiles.
#[derive(Clone)]
pub struct ComputeProgram {
    pub path: Rc<str>,
    pub layout: BindingLayout,
    /// Invocations per workgroup along X.
    pub local_size: u32,
    pub entry: KernelFn,
    pub wgsl: Option<&'static str>,
}

impl ComputeProgram {
    pub fn new(path: &str, layout: BindingLayout, local_size: u32, entry: KernelFn) -> Self {
        Self {
            path: Rc::from(path),
            layout,
            local_size,
            entry,
            wgsl: None,
        }
    }

    pub fn with_wgsl(mut self, source: &'static str) -> Self {
        self.wgsl = Some(source);
        self
    }
}

impl fmt::Debug for ComputeProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeProgram")
            .field("path", &self.path)
            .field("layout", &self.layout)
            .field("local_size", &self.local_size)
            .field("wgsl", &self.wgsl.is_some())
            .finish()
    }
}

/// Image layout a binding expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayout {
    General,
    ShaderReadOnly,
    TransferDst,
}

/// Sampler used for sampled-image reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampler {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ImageBinding {
    pub alloc: AllocId,
    pub width: u32,
    pub height: u32,
    pub sampler: Sampler,
    pub layout: ImageLayout,
}

/// A two-dimensional single-channel float image living in device memory.
pub struct ComputeImage {
    device: ComputeDevice,
    alloc: AllocId,
    width: u32,
    height: u32,
}

impl ComputeImage {
    pub fn new(device: &ComputeDevice, width: u32, height: u32) -> AccelResult<Self> {
        let alloc = device.allocate_image(width, height)?;
        Ok(Self {
            device: device.clone(),
            alloc,
            width,
            height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Blocking upload of a full frame of pixels (row-major).
    pub fn upload(&mut self, pixels: &[f32]) -> AccelResult<()> {
        if pixels.len() != self.width as usize * self.height as usize {
            return Err(AccelError::contract(format!(
                "image upload of {} pixels into {}x{} image",
                pixels.len(),
                self.width,
                self.height
            )));
        }
        self.device.write_image(self.alloc, pixels)
    }

    /// Blocking download of the full frame.
    pub fn download(&self) -> AccelResult<Vec<f32>> {
        self.device
            .read_image(self.alloc, self.width as usize * self.height as usize)
    }

    pub(crate) fn binding(&self, sampler: Sampler, layout: ImageLayout) -> ImageBinding {
        ImageBinding {
            alloc: self.alloc,
            width: self.width,
            height: self.height,
            sampler,
            layout,
        }
    }
}

impl Drop for ComputeImage {
    fn drop(&mut self) {
        self.device.release(self.alloc);
    }
}

type DownloadSink = Rc<RefCell<Option<Box<dyn Any>>>>;
type CloneFn = fn(&dyn Any, usize) -> Option<Box<dyn Any>>;
type BytesFn = fn(&dyn Any) -> Option<&[u8]>;
type DecodeFn = fn(&[u8], usize) -> Option<Box<dyn Any>>;

fn clone_prefix<T: Element>(data: &dyn Any, len: usize) -> Option<Box<dyn Any>> {
    let vec = data.downcast_ref::<Vec<T>>()?;
    Some(Box::new(vec.get(..len)?.to_vec()))
}

fn vec_bytes<T: Element>(data: &dyn Any) -> Option<&[u8]> {
    T::device_bytes(data.downcast_ref::<Vec<T>>()?)
}

fn decode_vec<T: Element>(bytes: &[u8], len: usize) -> Option<Box<dyn Any>> {
    let mut out = vec![T::default(); len];
    T::read_device_bytes(&mut out, bytes).then(|| Box::new(out) as Box<dyn Any>)
}

pub(crate) enum Command {
    Upload {
        alloc: AllocId,
        data: Box<dyn Any>,
        bytes: usize,
        raw: BytesFn,
    },
    Download {
        alloc: AllocId,
        len: usize,
        bytes: usize,
        sink: DownloadSink,
        clone: CloneFn,
        decode: DecodeFn,
    },
    Dispatch {
        program: ComputeProgram,
        buffers: Vec<AllocId>,
        storage_images: Vec<ImageBinding>,
        sampled_images: Vec<ImageBinding>,
        push_constants: Vec<u8>,
        groups: [u32; 3],
    },
    Barrier,
}

impl Command {
    pub(crate) fn upload<T: Element>(alloc: AllocId, data: Vec<T>) -> Self {
        let bytes = data.len() * std::mem::size_of::<T>();
        Command::Upload {
            alloc,
            data: Box::new(data),
            bytes,
            raw: vec_bytes::<T>,
        }
    }

    pub(crate) fn download<T: Element>(alloc: AllocId, len: usize, sink: DownloadSink) -> Self {
        Command::Download {
            alloc,
            len,
            bytes: len * std::mem::size_of::<T>(),
            sink,
            clone: clone_prefix::<T>,
            decode: decode_vec::<T>,
        }
    }

    fn transfer_target(&self) -> Option<AllocId> {
        match self {
            Command::Upload { alloc, .. } | Command::Download { alloc, .. } => Some(*alloc),
            _ => None,
        }
    }
}

/// An ordered recording of transfers, dispatches and barriers.
pub struct CommandBuffer {
    device: ComputeDevice,
    recording: u64,
    commands: Vec<Command>,
    dispatches: usize,
    barriers: usize,
}

impl CommandBuffer {
    /// Identifier of the current recording. Changes after every submission.
    pub fn recording_id(&self) -> u64 {
        self.recording
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatches
    }

    pub fn barrier_count(&self) -> usize {
        self.barriers
    }

    pub fn device(&self) -> &ComputeDevice {
        &self.device
    }

    pub(crate) fn record(&mut self, command: Command) {
        match command {
            Command::Dispatch { .. } => self.dispatches += 1,
            Command::Barrier => self.barriers += 1,
            _ => {}
        }
        self.commands.push(command);
    }

    fn restart(&mut self) -> Vec<Command> {
        self.recording = self.device.next_recording_id();
        self.dispatches = 0;
        self.barriers = 0;
        std::mem::take(&mut self.commands)
    }
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("recording", &self.recording)
            .field("commands", &self.commands.len())
            .finish()
    }
}

/// Submission queue. Executes recordings in submission order.
#[derive(Debug)]
pub struct ComputeQueue {
    device: ComputeDevice,
    submissions: Cell<u64>,
}

impl ComputeQueue {
    /// Execute everything recorded in `cmd`, wait for completion and start a
    /// fresh recording.
    pub fn submit_and_block(&self, cmd: &mut CommandBuffer) -> AccelResult<()> {
        if !cmd.device.same_device(&self.device) {
            return Err(AccelError::contract(
                "command buffer submitted to a queue of another device",
            ));
        }
        let recording = cmd.recording;
        let commands = cmd.restart();
        let count = commands.len();
        match &self.device.inner.gpu {
            Some(gpu) => self.device.submit_wgpu(gpu, commands)?,
            None => {
                for command in commands {
                    self.device.execute_host(command)?;
                }
            }
        }
        self.submissions.set(self.submissions.get() + 1);
        tracing::trace!("Submitted recording {} ({} commands)", recording, count);
        Ok(())
    }

    pub fn submission_count(&self) -> u64 {
        self.submissions.get()
    }
}

/// Resources visible to a running host kernel.
pub struct KernelInvocation<'a> {
    buffers: Vec<Box<dyn Any>>,
    storage_images: Vec<(ImageBinding, Box<dyn Any>)>,
    sampled_images: Vec<(ImageBinding, Box<dyn Any>)>,
    push_constants: &'a [u8],
    groups: [u32; 3],
    local_size: u32,
}

/// Read-only view of the buffers not selected as the output of a dispatch.
pub struct KernelInputs<'a> {
    before: &'a [Box<dyn Any>],
    after: &'a [Box<dyn Any>],
    output_slot: usize,
}

impl<'a> KernelInputs<'a> {
    pub fn get<T: Element>(&self, slot: usize) -> Result<&'a [T], String> {
        let data = if slot < self.output_slot {
            self.before.get(slot)
        } else if slot > self.output_slot {
            self.after.get(slot - self.output_slot - 1)
        } else {
            None
        };
        data.and_then(|b| b.downcast_ref::<Vec<T>>())
            .map(Vec::as_slice)
            .ok_or_else(|| format!("binding {} missing or of unexpected type", slot))
    }
}

impl<'a> KernelInvocation<'a> {
    /// Decode the push-constant block.
    pub fn push_constants<P: bytemuck::Pod>(&self) -> Result<P, String> {
        let size = std::mem::size_of::<P>();
        if self.push_constants.len() < size {
            return Err(format!(
                "push constant block is {} bytes, expected {}",
                self.push_constants.len(),
                size
            ));
        }
        Ok(bytemuck::pod_read_unaligned(&self.push_constants[..size]))
    }

    pub fn groups(&self) -> [u32; 3] {
        self.groups
    }

    /// Total invocations along X (`groups[0] * local_size`).
    pub fn global_size_x(&self) -> usize {
        self.groups[0] as usize * self.local_size as usize
    }

    pub fn input<T: Element>(&self, slot: usize) -> Result<&[T], String> {
        self.buffers
            .get(slot)
            .and_then(|b| b.downcast_ref::<Vec<T>>())
            .map(Vec::as_slice)
            .ok_or_else(|| format!("binding {} missing or of unexpected type", slot))
    }

    /// Split the bindings into one writable output and the remaining inputs.
    pub fn output_with_inputs<T: Element>(
        &mut self,
        slot: usize,
    ) -> Result<(&mut [T], KernelInputs<'_>), String> {
        if slot >= self.buffers.len() {
            return Err(format!("binding {} out of range", slot));
        }
        let (before, rest) = self.buffers.split_at_mut(slot);
        let (target, after) = rest
            .split_first_mut()
            .ok_or_else(|| format!("binding {} out of range", slot))?;
        let out = target
            .downcast_mut::<Vec<T>>()
            .ok_or_else(|| format!("binding {} is of unexpected type", slot))?;
        Ok((
            out.as_mut_slice(),
            KernelInputs {
                before,
                after,
                output_slot: slot,
            },
        ))
    }

    /// Writable storage image `storage` together with readable sampled image `sampled`.
    pub fn image_pair(
        &mut self,
        storage: usize,
        sampled: usize,
    ) -> Result<(&mut [f32], (u32, u32), &[f32], (u32, u32)), String> {
        let (dst_binding, dst) = self
            .storage_images
            .get_mut(storage)
            .ok_or_else(|| format!("storage image {} missing", storage))?;
        let (src_binding, src) = self
            .sampled_images
            .get(sampled)
            .ok_or_else(|| format!("sampled image {} missing", sampled))?;
        let dst_dims = (dst_binding.width, dst_binding.height);
        let src_dims = (src_binding.width, src_binding.height);
        let dst = dst
            .downcast_mut::<Vec<f32>>()
            .ok_or("storage image is not a float image")?;
        let src = src
            .downcast_ref::<Vec<f32>>()
            .ok_or("sampled image is not a float image")?;
        Ok((dst.as_mut_slice(), dst_dims, src.as_slice(), src_dims))
    }
}

/// A download whose staging copy is recorded but not yet mapped.
struct Readback {
    staging: wgpu::Buffer,
    bytes: usize,
    len: usize,
    sink: DownloadSink,
    decode: DecodeFn,
}

/// A recording translated into one wgpu command buffer.
struct EncodedRecording {
    commands: wgpu::CommandBuffer,
    readbacks: Vec<Readback>,
    /// Transfers on host-mirrored slots, run after the submission.
    host_commands: Vec<Command>,
    /// Upload sources, kept alive until the queue drains.
    staging: Vec<wgpu::Buffer>,
}

struct DeviceInner {
    name: String,
    caps: DeviceCapabilities,
    heap: RefCell<DeviceHeap>,
    programs: RefCell<HashMap<Rc<str>, ComputeProgram>>,
    next_recording: Cell<u64>,
    gpu: Option<WgpuBackend>,
}

/// Shared handle to the compute device.
#[derive(Clone)]
pub struct ComputeDevice {
    inner: Rc<DeviceInner>,
}

impl ComputeDevice {
    /// Create a device with the built-in program library on the first
    /// usable wgpu adapter, falling back to the host backend.
    pub fn new(caps: DeviceCapabilities) -> Self {
        match Self::wgpu(caps) {
            Ok(device) => device,
            Err(e) => {
                tracing::warn!("{}, compute programs run on the host", e);
                Self::host(caps)
            }
        }
    }

    /// Create a device on a wgpu adapter, failing if none can be opened.
    pub fn wgpu(caps: DeviceCapabilities) -> AccelResult<Self> {
        let gpu = WgpuBackend::open()?;
        let device = Self::with_backend(caps, gpu.adapter_name(), Some(gpu));
        kernels::register_builtin_programs(&device);
        device.log_ready();
        Ok(device)
    }

    /// Create a host-emulated device with the built-in program library.
    pub fn host(caps: DeviceCapabilities) -> Self {
        let device = Self::without_programs(caps);
        kernels::register_builtin_programs(&device);
        device.log_ready();
        device
    }

    /// Create a host-emulated device with an empty program library.
    pub fn without_programs(caps: DeviceCapabilities) -> Self {
        Self::with_backend(caps, "host-emulated compute device".to_string(), None)
    }

    fn with_backend(caps: DeviceCapabilities, name: String, gpu: Option<WgpuBackend>) -> Self {
        Self {
            inner: Rc::new(DeviceInner {
                name,
                caps,
                heap: RefCell::new(DeviceHeap::new(caps.memory_budget)),
                programs: RefCell::new(HashMap::new()),
                next_recording: Cell::new(1),
                gpu,
            }),
        }
    }

    fn log_ready(&self) {
        let caps = self.inner.caps;
        tracing::info!(
            "Compute device ready on {}: push_descriptors={} int64_atomics={} float_atomics={} budget={}",
            self.inner.name,
            caps.push_descriptors,
            caps.int64_atomics,
            caps.float_atomics,
            caps.memory_budget
        );
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn backend(&self) -> DeviceBackend {
        match self.inner.gpu {
            Some(_) => DeviceBackend::Wgpu,
            None => DeviceBackend::Host,
        }
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.inner.caps
    }

    pub fn register_program(&self, program: ComputeProgram) {
        self.inner
            .programs
            .borrow_mut()
            .insert(program.path.clone(), program);
    }

    pub fn program(&self, path: &str) -> AccelResult<ComputeProgram> {
        self.inner
            .programs
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| AccelError::ProgramNotFound(path.to_string()))
    }

    pub fn has_program(&self, path: &str) -> bool {
        self.inner.programs.borrow().contains_key(path)
    }

    /// Compile `program` for the active backend ahead of its first dispatch.
    pub(crate) fn prepare_program(&self, program: &ComputeProgram) -> AccelResult<()> {
        match &self.inner.gpu {
            Some(gpu) => gpu.compile(program).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Bytes of device memory currently allocated.
    pub fn memory_in_use(&self) -> usize {
        self.heap().in_use
    }

    /// Number of live device allocations.
    pub fn live_allocations(&self) -> usize {
        self.heap().live()
    }

    pub fn command_buffer(&self) -> CommandBuffer {
        CommandBuffer {
            device: self.clone(),
            recording: self.next_recording_id(),
            commands: Vec::new(),
            dispatches: 0,
            barriers: 0,
        }
    }

    pub fn queue(&self) -> ComputeQueue {
        ComputeQueue {
            device: self.clone(),
            submissions: Cell::new(0),
        }
    }

    pub fn same_device(&self, other: &ComputeDevice) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn heap(&self) -> Ref<'_, DeviceHeap> {
        self.inner.heap.borrow()
    }

    fn heap_mut(&self) -> RefMut<'_, DeviceHeap> {
        self.inner.heap.borrow_mut()
    }

    fn next_recording_id(&self) -> u64 {
        let id = self.inner.next_recording.get();
        self.inner.next_recording.set(id + 1);
        id
    }

    /// The wgpu backend, if `T` can live in one of its storage buffers.
    fn gpu_for<T: Element>(&self) -> Option<&WgpuBackend> {
        self.inner
            .gpu
            .as_ref()
            .filter(|_| T::device_bytes(&[]).is_some())
    }

    pub(crate) fn allocate<T: Element>(&self, len: usize) -> AccelResult<AllocId> {
        let bytes = len * std::mem::size_of::<T>();
        // Budget first so a failing allocation never touches host or adapter memory.
        self.heap().check_growth(0, bytes)?;
        if let Some(gpu) = self.gpu_for::<T>() {
            let buffer = gpu.create_buffer(bytes)?;
            return self.heap_mut().allocate(SlotData::Buffer(buffer), bytes);
        }
        let mut data: Vec<T> = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| AccelError::HostAllocation(len))?;
        data.resize(len, T::default());
        self.heap_mut().allocate(SlotData::Host(Box::new(data)), bytes)
    }

    pub(crate) fn resize_allocation<T: Element>(&self, id: AllocId, len: usize) -> AccelResult<()> {
        let bytes = len * std::mem::size_of::<T>();
        let mut heap = self.heap_mut();
        let slot = heap.slot(id)?;
        let (old, kind) = (slot.bytes, slot.kind());
        match (kind, &self.inner.gpu) {
            (SlotKind::Host, _) => heap.resize_host::<T>(id, len),
            (SlotKind::Buffer, Some(gpu)) => {
                if bytes == old {
                    return Ok(());
                }
                heap.check_growth(old, bytes)?;
                let resized = gpu.create_buffer(bytes)?;
                if let SlotData::Buffer(current) = &heap.slot(id)?.data {
                    gpu.copy_prefix(current, &resized);
                }
                heap.replace(id, SlotData::Buffer(resized), bytes)
            }
            _ => Err(AccelError::contract(format!("{:?} cannot be resized", id))),
        }
    }

    /// Blocking host-to-device copy replacing the allocation's contents.
    pub(crate) fn write<T: Element>(&self, id: AllocId, data: &[T]) -> AccelResult<()> {
        let bytes = std::mem::size_of_val(data);
        let mut heap = self.heap_mut();
        let slot = heap.slot(id)?;
        let (old, kind) = (slot.bytes, slot.kind());
        match (kind, &self.inner.gpu) {
            (SlotKind::Host, _) => heap.replace(id, SlotData::Host(Box::new(data.to_vec())), bytes),
            (SlotKind::Buffer, Some(gpu)) => {
                let raw = T::device_bytes(data)
                    .ok_or_else(|| AccelError::contract("allocation element type mismatch"))?;
                if bytes > old {
                    heap.check_growth(old, bytes)?;
                    heap.replace(id, SlotData::Buffer(gpu.create_buffer(bytes)?), bytes)?;
                }
                if let SlotData::Buffer(buffer) = &heap.slot(id)?.data {
                    gpu.write_buffer(buffer, raw);
                }
                Ok(())
            }
            _ => Err(AccelError::contract(format!("{:?} is an image", id))),
        }
    }

    /// Blocking device-to-host copy of the first `dst.len()` elements.
    pub(crate) fn read_into<T: Element>(&self, id: AllocId, dst: &mut [T]) -> AccelResult<()> {
        let heap = self.heap();
        let slot = heap.slot(id)?;
        match (&slot.data, &self.inner.gpu) {
            (SlotData::Host(data), _) => {
                let src = data
                    .downcast_ref::<Vec<T>>()
                    .ok_or_else(|| AccelError::contract("allocation element type mismatch"))?;
                let src = src.get(..dst.len()).ok_or_else(|| {
                    AccelError::contract(format!(
                        "download of {} elements from {} element allocation",
                        dst.len(),
                        src.len()
                    ))
                })?;
                dst.clone_from_slice(src);
                Ok(())
            }
            (SlotData::Buffer(buffer), Some(gpu)) => {
                let bytes = std::mem::size_of_val(dst);
                if bytes > slot.bytes {
                    return Err(AccelError::contract(format!(
                        "download of {} bytes from {} byte allocation",
                        bytes, slot.bytes
                    )));
                }
                if dst.is_empty() {
                    return Ok(());
                }
                let raw = gpu.read_buffer(buffer, bytes)?;
                if T::read_device_bytes(dst, &raw) {
                    Ok(())
                } else {
                    Err(AccelError::contract("allocation element type mismatch"))
                }
            }
            _ => Err(AccelError::contract(format!("{:?} is not a buffer", id))),
        }
    }

    pub(crate) fn allocate_image(&self, width: u32, height: u32) -> AccelResult<AllocId> {
        let Some(gpu) = &self.inner.gpu else {
            return self.allocate::<f32>(width as usize * height as usize);
        };
        let bytes = width as usize * height as usize * std::mem::size_of::<f32>();
        self.heap().check_growth(0, bytes)?;
        let texture = gpu.create_image(width, height)?;
        self.heap_mut().allocate(SlotData::Image(texture), bytes)
    }

    pub(crate) fn write_image(&self, id: AllocId, pixels: &[f32]) -> AccelResult<()> {
        {
            let heap = self.heap();
            if let (SlotData::Image(texture), Some(gpu)) = (&heap.slot(id)?.data, &self.inner.gpu) {
                gpu.write_image(texture, pixels);
                return Ok(());
            }
        }
        self.write(id, pixels)
    }

    pub(crate) fn read_image(&self, id: AllocId, len: usize) -> AccelResult<Vec<f32>> {
        {
            let heap = self.heap();
            if let (SlotData::Image(texture), Some(gpu)) = (&heap.slot(id)?.data, &self.inner.gpu) {
                return gpu.read_image(texture);
            }
        }
        let mut out = vec![0.0; len];
        self.read_into(id, &mut out)?;
        Ok(out)
    }

    pub(crate) fn release(&self, id: AllocId) {
        // A buffer may be dropped while another borrow is alive during unwinding.
        if let Ok(mut heap) = self.inner.heap.try_borrow_mut() {
            heap.release(id);
        }
    }

    fn execute_host(&self, command: Command) -> AccelResult<()> {
        match command {
            Command::Upload {
                alloc, data, bytes, ..
            } => self.heap_mut().replace(alloc, SlotData::Host(data), bytes),
            Command::Download {
                alloc,
                len,
                sink,
                clone,
                ..
            } => {
                let heap = self.heap();
                let copy = clone(heap.slot(alloc)?.host()?, len).ok_or_else(|| {
                    AccelError::contract("download type or length mismatch")
                })?;
                *sink.borrow_mut() = Some(copy);
                Ok(())
            }
            Command::Barrier => Ok(()),
            Command::Dispatch {
                program,
                buffers,
                storage_images,
                sampled_images,
                push_constants,
                groups,
            } => self.run_dispatch(
                &program,
                &buffers,
                &storage_images,
                &sampled_images,
                &push_constants,
                groups,
            ),
        }
    }

    fn run_dispatch(
        &self,
        program: &ComputeProgram,
        buffers: &[AllocId],
        storage_images: &[ImageBinding],
        sampled_images: &[ImageBinding],
        push_constants: &[u8],
        groups: [u32; 3],
    ) -> AccelResult<()> {
        let ids: Vec<AllocId> = buffers
            .iter()
            .copied()
            .chain(storage_images.iter().map(|b| b.alloc))
            .chain(sampled_images.iter().map(|b| b.alloc))
            .collect();

        let mut taken: Vec<(AllocId, Box<dyn Any>, usize)> = Vec::with_capacity(ids.len());
        {
            let mut heap = self.heap_mut();
            for &id in &ids {
                let slot = match heap.take(id) {
                    Ok(slot) => slot,
                    Err(e) => {
                        for (id, data, bytes) in taken {
                            heap.restore(id, HeapSlot { data: SlotData::Host(data), bytes });
                        }
                        return Err(e);
                    }
                };
                match slot.data {
                    SlotData::Host(data) => taken.push((id, data, slot.bytes)),
                    data => {
                        heap.restore(id, HeapSlot { data, bytes: slot.bytes });
                        for (id, data, bytes) in taken {
                            heap.restore(id, HeapSlot { data: SlotData::Host(data), bytes });
                        }
                        return Err(AccelError::contract(format!(
                            "{:?} is not host-resident",
                            id
                        )));
                    }
                }
            }
        }

        let sizes: Vec<usize> = taken.iter().map(|(_, _, bytes)| *bytes).collect();
        let mut data = taken.into_iter().map(|(_, data, _)| data);
        let mut invocation = KernelInvocation {
            buffers: data.by_ref().take(buffers.len()).collect(),
            storage_images: storage_images
                .iter()
                .copied()
                .zip(data.by_ref().take(storage_images.len()))
                .collect(),
            sampled_images: sampled_images.iter().copied().zip(data).collect(),
            push_constants,
            groups,
            local_size: program.local_size,
        };

        let result = (program.entry)(&mut invocation);

        let returned = invocation
            .buffers
            .into_iter()
            .chain(invocation.storage_images.into_iter().map(|(_, d)| d))
            .chain(invocation.sampled_images.into_iter().map(|(_, d)| d));
        let mut heap = self.heap_mut();
        for ((id, data), bytes) in ids.iter().zip(returned).zip(sizes) {
            heap.restore(
                *id,
                HeapSlot {
                    data: SlotData::Host(data),
                    bytes,
                },
            );
        }

        result.map_err(|message| AccelError::Kernel {
            program: program.path.to_string(),
            message,
        })
    }

    /// Run a recording on the wgpu backend.
    ///
    /// Transfers and dispatches go into one command encoder in recording
    /// order. Downloads are mapped once the queue drains. Transfers on
    /// host-mirrored slots never meet a dispatch, so they run afterwards.
    fn submit_wgpu(&self, gpu: &WgpuBackend, commands: Vec<Command>) -> AccelResult<()> {
        gpu.push_validation_scope();
        let submitted = self.encode_recording(gpu, commands).map(|recording| {
            gpu.submit(recording.commands);
            (recording.readbacks, recording.host_commands, recording.staging)
        });
        let validation = gpu.pop_error_scope();
        let (readbacks, host_commands, _staging) = submitted?;
        validation?;

        for readback in readbacks {
            let data = if readback.len == 0 {
                (readback.decode)(&[], 0)
            } else {
                let bytes = gpu.map_read(&readback.staging, readback.bytes)?;
                (readback.decode)(&bytes, readback.len)
            }
            .ok_or_else(|| AccelError::contract("download type or length mismatch"))?;
            *readback.sink.borrow_mut() = Some(data);
        }
        for command in host_commands {
            self.execute_host(command)?;
        }
        Ok(())
    }

    fn encode_recording(
        &self,
        gpu: &WgpuBackend,
        commands: Vec<Command>,
    ) -> AccelResult<EncodedRecording> {
        let heap = self.heap();
        let mut encoder = gpu.command_encoder();
        let mut readbacks = Vec::new();
        let mut host_commands = Vec::new();
        let mut staging = Vec::new();

        for command in commands {
            if let Some(alloc) = command.transfer_target() {
                if heap.slot(alloc)?.kind() == SlotKind::Host {
                    host_commands.push(command);
                    continue;
                }
            }
            match command {
                Command::Upload {
                    alloc, data, raw, ..
                } => {
                    let SlotData::Buffer(target) = &heap.slot(alloc)?.data else {
                        return Err(AccelError::contract(format!("{:?} is not a buffer", alloc)));
                    };
                    let src = raw(data.as_ref())
                        .ok_or_else(|| AccelError::contract("upload element type mismatch"))?;
                    if padded_size(src.len()) > target.size() {
                        return Err(AccelError::contract(format!(
                            "upload of {} bytes into {} byte allocation",
                            src.len(),
                            target.size()
                        )));
                    }
                    if !src.is_empty() {
                        let source = gpu.upload_staging(src);
                        encoder.copy_buffer_to_buffer(&source, 0, target, 0, source.size());
                        staging.push(source);
                    }
                }
                Command::Download {
                    alloc,
                    len,
                    bytes,
                    sink,
                    decode,
                    ..
                } => {
                    let SlotData::Buffer(source) = &heap.slot(alloc)?.data else {
                        return Err(AccelError::contract(format!("{:?} is not a buffer", alloc)));
                    };
                    if padded_size(bytes) > source.size() {
                        return Err(AccelError::contract("download type or length mismatch"));
                    }
                    let target = gpu.readback_staging(bytes);
                    if len > 0 {
                        encoder.copy_buffer_to_buffer(source, 0, &target, 0, target.size());
                    }
                    readbacks.push(Readback {
                        staging: target,
                        bytes,
                        len,
                        sink,
                        decode,
                    });
                }
                Command::Dispatch {
                    program,
                    buffers,
                    storage_images,
                    sampled_images,
                    push_constants,
                    groups,
                } => {
                    let resources = Self::gather_resources(
                        &heap,
                        &program,
                        &buffers,
                        &storage_images,
                        &sampled_images,
                        &push_constants,
                        groups,
                    )?;
                    gpu.encode_dispatch(&mut encoder, &program, resources)?;
                }
                // Passes are ordered by wgpu's own resource tracking.
                Command::Barrier => {}
            }
        }

        Ok(EncodedRecording {
            commands: encoder.finish(),
            readbacks,
            host_commands,
            staging,
        })
    }

    fn gather_resources<'h>(
        heap: &'h DeviceHeap,
        program: &ComputeProgram,
        buffers: &[AllocId],
        storage_images: &[ImageBinding],
        sampled_images: &[ImageBinding],
        push_constants: &'h [u8],
        groups: [u32; 3],
    ) -> AccelResult<DispatchResources<'h>> {
        let mut seen = HashSet::new();
        let all = buffers
            .iter()
            .chain(storage_images.iter().map(|b| &b.alloc))
            .chain(sampled_images.iter().map(|b| &b.alloc));
        for id in all {
            if !seen.insert(*id) {
                return Err(AccelError::contract(format!(
                    "{:?} is bound twice in one dispatch",
                    id
                )));
            }
        }

        let buffers = buffers
            .iter()
            .enumerate()
            .map(|(slot, &id)| match &heap.slot(id)?.data {
                SlotData::Buffer(buffer) => Ok(buffer),
                _ => Err(AccelError::contract(format!(
                    "binding {} of {} has no device layout",
                    slot, program.path
                ))),
            })
            .collect::<AccelResult<Vec<_>>>()?;
        let views = |bindings: &[ImageBinding]| {
            bindings
                .iter()
                .map(|b| match &heap.slot(b.alloc)?.data {
                    SlotData::Image(texture) => {
                        Ok(texture.create_view(&wgpu::TextureViewDescriptor::default()))
                    }
                    _ => Err(AccelError::contract(format!("{:?} is not an image", b.alloc))),
                })
                .collect::<AccelResult<Vec<_>>>()
        };

        Ok(DispatchResources {
            buffers,
            storage_images: views(storage_images)?,
            sampled_images: views(sampled_images)?,
            push_constants,
            groups,
        })
    }
}

impl fmt::Debug for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeDevice")
            .field("name", &self.inner.name)
            .field("backend", &self.backend())
            .field("caps", &self.inner.caps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// wgpu device, or `None` on machines without an adapter.
    fn wgpu_device() -> Option<ComputeDevice> {
        ComputeDevice::wgpu(DeviceCapabilities::default()).ok()
    }

    #[test]
    fn test_allocation_accounting() {
        let device = ComputeDevice::without_programs(DeviceCapabilities::default());
        let a = device.allocate::<f32>(16).unwrap();
        let b = device.allocate::<i64>(4).unwrap();
        assert_eq!(device.memory_in_use(), 16 * 4 + 4 * 8);
        assert_eq!(device.live_allocations(), 2);

        device.release(a);
        assert_eq!(device.memory_in_use(), 32);

        // Freed slot is reused
        let c = device.allocate::<u8>(3).unwrap();
        assert_eq!(c, a);
        device.release(b);
        device.release(c);
        assert_eq!(device.memory_in_use(), 0);
    }

    #[test]
    fn test_budget_exceeded() {
        let caps = DeviceCapabilities {
            memory_budget: 64,
            ..Default::default()
        };
        let device = ComputeDevice::without_programs(caps);
        let _a = device.allocate::<f32>(8).unwrap();
        let err = device.allocate::<f32>(16).unwrap_err();
        assert!(matches!(err, AccelError::OutOfMemory { requested: 64, .. }));
    }

    #[test]
    fn test_recorded_upload_and_download() {
        let device = ComputeDevice::without_programs(DeviceCapabilities::default());
        let queue = device.queue();
        let mut cmd = device.command_buffer();
        let first_recording = cmd.recording_id();
        let alloc = device.allocate::<f32>(3).unwrap();

        let sink: DownloadSink = Rc::new(RefCell::new(None));
        cmd.record(Command::upload(alloc, vec![1.0f32, 2.0, 3.0]));
        cmd.record(Command::download::<f32>(alloc, 3, sink.clone()));
        assert_eq!(cmd.len(), 2);
        assert!(sink.borrow().is_none());

        queue.submit_and_block(&mut cmd).unwrap();
        assert!(cmd.is_empty());
        assert_ne!(cmd.recording_id(), first_recording);

        let data = sink.borrow_mut().take().unwrap();
        assert_eq!(*data.downcast::<Vec<f32>>().unwrap(), vec![1.0, 2.0, 3.0]);
        device.release(alloc);
    }

    #[test]
    fn test_submit_to_foreign_queue_rejected() {
        let a = ComputeDevice::without_programs(DeviceCapabilities::default());
        let b = ComputeDevice::without_programs(DeviceCapabilities::default());
        let mut cmd = a.command_buffer();
        let err = b.queue().submit_and_block(&mut cmd).unwrap_err();
        assert!(matches!(err, AccelError::ContractViolation(_)));
    }

    #[test]
    fn test_host_backend_selected_without_adapter() {
        let host = ComputeDevice::host(DeviceCapabilities::default());
        assert_eq!(host.backend(), DeviceBackend::Host);
        assert!(host.has_program(kernels::SUBTRACT));

        let auto = ComputeDevice::new(DeviceCapabilities::default());
        match ComputeDevice::wgpu(DeviceCapabilities::default()) {
            Ok(_) => assert_eq!(auto.backend(), DeviceBackend::Wgpu),
            Err(_) => assert_eq!(auto.backend(), DeviceBackend::Host),
        }
        assert!(auto.has_program(kernels::SUBTRACT));
    }

    #[test]
    fn test_wgpu_buffer_transfers() {
        let Some(device) = wgpu_device() else {
            return;
        };
        let alloc = device.allocate::<f32>(3).unwrap();
        device.write(alloc, &[1.0f32, 2.0, 3.0]).unwrap();

        device.resize_allocation::<f32>(alloc, 5).unwrap();
        assert_eq!(device.memory_in_use(), 20);
        let mut back = [0.0f32; 5];
        device.read_into(alloc, &mut back).unwrap();
        assert_eq!(back, [1.0, 2.0, 3.0, 0.0, 0.0]);

        let queue = device.queue();
        let mut cmd = device.command_buffer();
        let sink: DownloadSink = Rc::new(RefCell::new(None));
        cmd.record(Command::upload(alloc, vec![5.0f32, 6.0, 7.0, 8.0, 9.0]));
        cmd.record(Command::download::<f32>(alloc, 2, sink.clone()));
        queue.submit_and_block(&mut cmd).unwrap();
        let data = sink.borrow_mut().take().unwrap();
        assert_eq!(*data.downcast::<Vec<f32>>().unwrap(), vec![5.0, 6.0]);

        device.release(alloc);
        assert_eq!(device.memory_in_use(), 0);
    }

    #[test]
    fn test_wgpu_keeps_host_only_types_on_host() {
        let Some(device) = wgpu_device() else {
            return;
        };
        let flags = device.allocate::<bool>(2).unwrap();
        device.write(flags, &[true, false]).unwrap();
        let mut back = [false; 2];
        device.read_into(flags, &mut back).unwrap();
        assert_eq!(back, [true, false]);
        assert_eq!(device.heap().slot(flags).unwrap().kind(), SlotKind::Host);
    }

    #[test]
    fn test_wgpu_image_round_trip() {
        let Some(device) = wgpu_device() else {
            return;
        };
        let mut image = ComputeImage::new(&device, 3, 2).unwrap();
        let pixels = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        image.upload(&pixels).unwrap();
        assert_eq!(image.download().unwrap(), pixels.to_vec());
        assert!(ComputeImage::new(&device, 0, 4).is_err());
    }

    #[test]
    fn test_image_round_trip() {
        let device = ComputeDevice::without_programs(DeviceCapabilities::default());
        let mut image = ComputeImage::new(&device, 2, 2).unwrap();
        image.upload(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(image.download().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(image.upload(&[1.0]).is_err());
        drop(image);
        assert_eq!(device.live_allocations(), 0);
    }
}
