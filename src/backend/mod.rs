//! The boundary to the GPU.

pub mod host;
pub mod wgpu;

pub use crate::{cache::PipelineKey, error::Error};
pub use ::wgpu::BufferUsages;
pub use host::{HostBuffer, HostDevice, HostLimits};
pub use self::wgpu::WgpuDevice;

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// The identity of a device.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DeviceId(u64);

/// The identity of a buffer.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BufferId(u64);

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(0);

impl DeviceId {
    pub fn new() -> Self {
        Self(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for DeviceId {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl BufferId {
    pub fn new() -> Self {
        Self(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for BufferId {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// A storage binding declared by a kernel.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct LayoutEntry {
    pub binding: u32,
    pub read_only: bool,
}

/// Everything needed to compile one compute pipeline.
#[derive(Clone, Debug)]
pub struct PipelineDescriptor<'a> {
    pub label: &'a str,
    /// The complete kernel source.
    pub source: &'a str,
    pub entry_point: &'a str,
    pub layout: &'a [LayoutEntry],
    /// The structural key the pipeline is cached under.
    pub key: &'a PipelineKey,
}

/// A buffer bound at `binding` of bind group 0.
#[derive(Debug)]
pub struct BindGroupEntry<'a, B> {
    pub binding: u32,
    pub buffer: &'a B,
}

/// One compute pass with a single dispatch of `(workgroup_count, 1, 1)`.
#[derive(Debug)]
pub struct ComputePass<'a, D: Device> {
    pub label: &'a str,
    pub pipeline: &'a D::Pipeline,
    pub bind_group: &'a D::BindGroup,
    pub workgroup_count: u32,
}

/// A GPU that can allocate buffers, compile compute pipelines, and record
/// and submit compute dispatches.
///
/// Implementors are cheap handles. Cloning a device yields another handle to
/// the same device.
pub trait Device: Clone + fmt::Debug {
    type Buffer: Clone + fmt::Debug;
    type Pipeline: Clone + fmt::Debug;
    type BindGroup: Clone + fmt::Debug;
    type Encoder;

    fn id(&self) -> DeviceId;

    /// The maximum invocations of one workgroup along x.
    fn max_workgroup_length(&self) -> u32;

    /// The maximum workgroup count of one dispatch along x.
    fn max_workgroup_count(&self) -> u32;

    fn create_buffer(
        &self,
        label: &str,
        size: u64,
        usage: BufferUsages,
    ) -> Result<Self::Buffer, Error>;

    fn create_buffer_init(
        &self,
        label: &str,
        contents: &[u8],
        usage: BufferUsages,
    ) -> Result<Self::Buffer, Error>;

    fn buffer_id(
        &self,
        buffer: &Self::Buffer,
    ) -> BufferId;

    /// The size of the buffer in bytes.
    fn buffer_size(
        &self,
        buffer: &Self::Buffer,
    ) -> u64;

    fn destroy_buffer(
        &self,
        buffer: &Self::Buffer,
    );

    fn create_compute_pipeline(
        &self,
        descriptor: &PipelineDescriptor,
    ) -> Result<Self::Pipeline, Error>;

    fn create_bind_group(
        &self,
        label: &str,
        pipeline: &Self::Pipeline,
        entries: &[BindGroupEntry<Self::Buffer>],
    ) -> Result<Self::BindGroup, Error>;

    fn create_encoder(
        &self,
        label: &str,
    ) -> Self::Encoder;

    fn encode_dispatch(
        &self,
        encoder: &mut Self::Encoder,
        pass: ComputePass<Self>,
    );

    fn submit(
        &self,
        encoder: Self::Encoder,
    );

    /// Reading the buffer back to the host, blocking until the GPU is done.
    fn read_buffer(
        &self,
        buffer: &Self::Buffer,
    ) -> Result<Vec<u8>, Error>;
}
