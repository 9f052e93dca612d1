//! Dual-residency buffer.
//!
//! An [`AcceleratorBuffer`] owns an optional host copy and an optional device
//! allocation of the same logical length. Coherence is lazy: writes mark one
//! side dirty and the other side is refreshed only when a consumer prepares
//! for access there.
//!
//! Buffers created without a device behave as plain vectors: residency
//! transitions are no-ops and the host copy is always current.

use super::device::{Command, ComputeDevice};
use super::error::{AccelError, AccelResult};
use super::{AllocId, CommandBuffer, Element};
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::ops::{Index, IndexMut};
use std::rc::Rc;

/// Which side holds data the other side has not seen yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Residency {
    /// Both copies (where allocated) agree.
    #[default]
    Clean,
    /// The host copy was written after the last upload.
    DirtyCpu,
    /// The device copy was written after the last download.
    DirtyGpu,
}

/// Allocation placement hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessHint {
    Unlikely,
    #[default]
    Likely,
}

type PendingDownload = Rc<RefCell<Option<Box<dyn Any>>>>;

pub struct AcceleratorBuffer<T: Element> {
    len: usize,
    host: Vec<T>,
    host_allocated: bool,
    device: Option<ComputeDevice>,
    alloc: Option<AllocId>,
    device_len: usize,
    state: Residency,
    cpu_hint: AccessHint,
    gpu_hint: AccessHint,
    pending: Option<PendingDownload>,
}

impl<T: Element> AcceleratorBuffer<T> {
    /// Host-only buffer.
    pub fn new() -> Self {
        Self {
            len: 0,
            host: Vec::new(),
            host_allocated: true,
            device: None,
            alloc: None,
            device_len: 0,
            state: Residency::Clean,
            cpu_hint: AccessHint::Likely,
            gpu_hint: AccessHint::Unlikely,
            pending: None,
        }
    }

    /// Buffer that may also live on `device`.
    pub fn with_device(device: &ComputeDevice) -> Self {
        let mut buf = Self::new();
        buf.device = Some(device.clone());
        buf.gpu_hint = AccessHint::Likely;
        buf
    }

    /// Buffer on `device` if one is given, host-only otherwise.
    pub fn on(device: Option<&ComputeDevice>) -> Self {
        match device {
            Some(d) => Self::with_device(d),
            None => Self::new(),
        }
    }

    pub fn from_vec(data: Vec<T>) -> Self {
        let mut buf = Self::new();
        buf.len = data.len();
        buf.host = data;
        buf
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn residency(&self) -> Residency {
        self.state
    }

    pub fn device(&self) -> Option<&ComputeDevice> {
        self.device.as_ref()
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    pub fn is_host_allocated(&self) -> bool {
        self.host_allocated
    }

    pub fn is_device_allocated(&self) -> bool {
        self.alloc.is_some()
    }

    pub fn cpu_access_hint(&self) -> AccessHint {
        self.cpu_hint
    }

    pub fn gpu_access_hint(&self) -> AccessHint {
        self.gpu_hint
    }

    pub fn set_cpu_access_hint(&mut self, hint: AccessHint) {
        self.cpu_hint = hint;
    }

    pub fn set_gpu_access_hint(&mut self, hint: AccessHint) {
        self.gpu_hint = hint;
    }

    /// True when element access through the host copy is valid.
    pub fn is_host_current(&self) -> bool {
        self.host_allocated && self.state != Residency::DirtyGpu
    }

    pub(crate) fn device_alloc(&self) -> Option<AllocId> {
        self.alloc
    }

    /// Change the logical length.
    ///
    /// Elements below `min(old, new)` are preserved on whichever side holds
    /// current data. New elements are `T::default()`.
    pub fn resize(&mut self, len: usize) -> AccelResult<()> {
        if len == self.len {
            return Ok(());
        }

        // Device side first so a budget failure leaves the buffer untouched.
        if self.alloc.is_some() || (self.device.is_some() && self.gpu_hint == AccessHint::Likely) {
            self.ensure_device_alloc_len(len)?;
        }

        if self.host_allocated || self.device.is_none() || self.cpu_hint == AccessHint::Likely {
            Self::resize_host(&mut self.host, len)?;
            self.host_allocated = true;
        }

        self.len = len;
        Ok(())
    }

    /// Reserve host capacity for at least `additional` more elements.
    pub fn reserve(&mut self, additional: usize) -> AccelResult<()> {
        self.host
            .try_reserve(additional)
            .map_err(|_| AccelError::HostAllocation(self.len + additional))
    }

    /// Drop all elements and release the device allocation.
    pub fn clear(&mut self) {
        self.host.clear();
        self.len = 0;
        self.release_device();
        self.state = Residency::Clean;
        self.pending = None;
    }

    /// Append on the host side.
    pub fn push(&mut self, value: T) {
        debug_assert!(
            self.state != Residency::DirtyGpu,
            "push onto a buffer whose device copy is newer"
        );
        if !self.host_allocated {
            self.host.clear();
            self.host_allocated = true;
        }
        self.host.truncate(self.len);
        self.host.push(value);
        self.len += 1;
        if self.device.is_some() {
            self.state = Residency::DirtyCpu;
        }
    }

    /// Make the host copy current, blocking on a device read if needed.
    ///
    /// A download recorded earlier with
    /// [`prepare_for_cpu_access_nonblocking`](Self::prepare_for_cpu_access_nonblocking)
    /// and already submitted is consumed without another device round trip.
    pub fn prepare_for_cpu_access(&mut self) -> AccelResult<()> {
        if let Some(pending) = self.pending.take() {
            let ready = pending.borrow_mut().take();
            if let Some(data) = ready {
                let data = data
                    .downcast::<Vec<T>>()
                    .map_err(|_| AccelError::contract("download element type mismatch"))?;
                if data.len() == self.len {
                    self.host = *data;
                    self.host_allocated = true;
                    self.state = Residency::Clean;
                    return Ok(());
                }
            }
        }

        self.ensure_host()?;
        if self.state == Residency::DirtyGpu {
            let (device, alloc) = self.device_and_alloc()?;
            device.read_into(alloc, &mut self.host[..self.len])?;
            tracing::trace!("Blocking download of {} elements", self.len);
            self.state = Residency::Clean;
        }
        Ok(())
    }

    /// Record a device-to-host copy into `cmd`.
    ///
    /// The caller submits `cmd` and then calls
    /// [`prepare_for_cpu_access`](Self::prepare_for_cpu_access) before reading.
    pub fn prepare_for_cpu_access_nonblocking(&mut self, cmd: &mut CommandBuffer) -> AccelResult<()> {
        if self.state != Residency::DirtyGpu {
            return self.ensure_host();
        }
        let (device, alloc) = self.device_and_alloc()?;
        if !cmd.device().same_device(&device) {
            return Err(AccelError::contract("command buffer belongs to another device"));
        }
        let sink: PendingDownload = Rc::new(RefCell::new(None));
        cmd.record(Command::download::<T>(alloc, self.len, sink.clone()));
        self.pending = Some(sink);
        Ok(())
    }

    /// Make the device copy current, blocking on an upload if needed.
    ///
    /// With `output_only` the device allocation is ensured but no upload is
    /// performed: the consumer will overwrite every element.
    pub fn prepare_for_gpu_access(&mut self, output_only: bool) -> AccelResult<()> {
        self.ensure_device_alloc_len(self.len)?;
        if self.state == Residency::DirtyCpu && !output_only {
            let (device, alloc) = self.device_and_alloc()?;
            device.write(alloc, &self.host[..self.len])?;
            tracing::trace!("Blocking upload of {} elements", self.len);
            self.state = Residency::Clean;
        }
        Ok(())
    }

    /// Record a host-to-device copy into `cmd` if the host copy is newer.
    pub fn prepare_for_gpu_access_nonblocking(
        &mut self,
        output_only: bool,
        cmd: &mut CommandBuffer,
    ) -> AccelResult<()> {
        self.ensure_device_alloc_len(self.len)?;
        let (device, alloc) = self.device_and_alloc()?;
        if !cmd.device().same_device(&device) {
            return Err(AccelError::contract("command buffer belongs to another device"));
        }
        if self.state == Residency::DirtyCpu && !output_only {
            cmd.record(Command::upload(alloc, self.host[..self.len].to_vec()));
            self.state = Residency::Clean;
        }
        Ok(())
    }

    /// Prepare for a full host-side overwrite: any newer device data is discarded.
    pub fn prepare_for_cpu_access_ignoring_gpu_data(&mut self) -> AccelResult<()> {
        self.pending = None;
        self.ensure_host()?;
        if self.state == Residency::DirtyGpu {
            self.state = Residency::Clean;
        }
        Ok(())
    }

    pub fn mark_modified_from_cpu(&mut self) {
        self.pending = None;
        self.state = if self.device.is_some() {
            Residency::DirtyCpu
        } else {
            Residency::Clean
        };
    }

    pub fn mark_modified_from_gpu(&mut self) {
        debug_assert!(self.device.is_some(), "GPU write to a host-only buffer");
        if self.device.is_some() {
            self.pending = None;
            self.state = Residency::DirtyGpu;
        }
    }

    pub fn as_slice(&self) -> &[T] {
        debug_assert!(self.is_host_current(), "host read of a buffer whose device copy is newer");
        &self.host[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        debug_assert!(self.is_host_current(), "host write to a buffer whose device copy is newer");
        &mut self.host[..self.len]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Overwrite this buffer with the host contents of `other`.
    pub fn copy_from(&mut self, other: &AcceleratorBuffer<T>) -> AccelResult<()> {
        self.prepare_for_cpu_access_ignoring_gpu_data()?;
        self.resize(other.len())?;
        self.ensure_host()?;
        self.host[..self.len].clone_from_slice(other.as_slice());
        self.mark_modified_from_cpu();
        Ok(())
    }

    /// Host copy of the whole buffer, on the same device.
    pub fn try_clone(&self) -> AccelResult<Self> {
        let mut out = Self::on(self.device.as_ref());
        out.cpu_hint = self.cpu_hint;
        out.gpu_hint = self.gpu_hint;
        out.copy_from(self)?;
        Ok(out)
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.as_slice().to_vec()
    }

    fn resize_host(host: &mut Vec<T>, len: usize) -> AccelResult<()> {
        if len > host.len() {
            host.try_reserve(len - host.len())
                .map_err(|_| AccelError::HostAllocation(len))?;
        }
        host.resize(len, T::default());
        Ok(())
    }

    fn ensure_host(&mut self) -> AccelResult<()> {
        if !self.host_allocated || self.host.len() != self.len {
            Self::resize_host(&mut self.host, self.len)?;
            self.host_allocated = true;
        }
        Ok(())
    }

    fn ensure_device_alloc_len(&mut self, len: usize) -> AccelResult<()> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| AccelError::contract("device access on a host-only buffer"))?;
        match self.alloc {
            Some(alloc) if self.device_len != len => {
                device.resize_allocation::<T>(alloc, len)?;
            }
            Some(_) => {}
            None => {
                self.alloc = Some(device.allocate::<T>(len)?);
            }
        }
        self.device_len = len;
        Ok(())
    }

    fn device_and_alloc(&self) -> AccelResult<(ComputeDevice, AllocId)> {
        match (&self.device, self.alloc) {
            (Some(device), Some(alloc)) => Ok((device.clone(), alloc)),
            _ => Err(AccelError::contract("buffer has no device allocation")),
        }
    }

    fn release_device(&mut self) {
        if let (Some(device), Some(alloc)) = (&self.device, self.alloc.take()) {
            device.release(alloc);
        }
        self.device_len = 0;
    }
}

impl<T: Element> Default for AcceleratorBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Element> From<Vec<T>> for AcceleratorBuffer<T> {
    fn from(data: Vec<T>) -> Self {
        Self::from_vec(data)
    }
}

impl<T: Element> Drop for AcceleratorBuffer<T> {
    fn drop(&mut self) {
        self.release_device();
    }
}

impl<T: Element> Index<usize> for AcceleratorBuffer<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.as_slice()[index]
    }
}

impl<T: Element> IndexMut<usize> for AcceleratorBuffer<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.as_mut_slice()[index]
    }
}

impl<T: Element> fmt::Debug for AcceleratorBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceleratorBuffer")
            .field("len", &self.len)
            .field("state", &self.state)
            .field("host_allocated", &self.host_allocated)
            .field("alloc", &self.alloc)
            .finish()
    }
}
