//! A device backed by `wgpu`.

pub use super::*;

use ::wgpu::util::DeviceExt;
use std::sync::{mpsc, Arc};

/// A `wgpu` device and its queue.
///
/// The host application may keep its own handles to them,
/// see [`WgpuDevice::from_parts`].
#[derive(Clone, Debug)]
pub struct WgpuDevice {
    id: DeviceId,
    device: Arc<::wgpu::Device>,
    queue: Arc<::wgpu::Queue>,
    limits: ::wgpu::Limits,
}

#[derive(Clone, Debug)]
pub struct WgpuBuffer {
    id: BufferId,
    size: u64,
    inner: Arc<::wgpu::Buffer>,
}

impl WgpuDevice {
    /// Requesting the default adapter and a device with its best limits.
    pub fn new() -> Result<Self, Error> {
        pollster::block_on(Self::request())
    }

    pub async fn request() -> Result<Self, Error> {
        let instance = ::wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&::wgpu::RequestAdapterOptions {
                power_preference: ::wgpu::PowerPreference::HighPerformance,
                ..Default::default()
            })
            .await
            .map_err(|error| Error::Device(error.to_string()))?;

        log::debug!(
            target: "gausplat::scan::wgpu",
            "adapter {:?}",
            adapter.get_info(),
        );

        let (device, queue) = adapter
            .request_device(&::wgpu::DeviceDescriptor {
                label: Some("gausplat-scan"),
                required_limits: adapter.limits(),
                ..Default::default()
            })
            .await
            .map_err(|error| Error::Device(error.to_string()))?;

        Ok(Self::from_parts(device, queue))
    }

    pub fn from_parts(
        device: ::wgpu::Device,
        queue: ::wgpu::Queue,
    ) -> Self {
        let limits = device.limits();
        Self {
            id: DeviceId::new(),
            device: Arc::new(device),
            queue: Arc::new(queue),
            limits,
        }
    }

    #[inline]
    pub fn device(&self) -> &::wgpu::Device {
        &self.device
    }

    #[inline]
    pub fn queue(&self) -> &::wgpu::Queue {
        &self.queue
    }

    fn buffer(
        &self,
        size: u64,
        inner: ::wgpu::Buffer,
    ) -> WgpuBuffer {
        WgpuBuffer {
            id: BufferId::new(),
            size,
            inner: Arc::new(inner),
        }
    }

    /// Running `f` in an error scope of `filter`.
    fn scoped<T>(
        &self,
        filter: ::wgpu::ErrorFilter,
        f: impl FnOnce(&::wgpu::Device) -> T,
    ) -> (T, Option<::wgpu::Error>) {
        self.device.push_error_scope(filter);
        let output = f(&self.device);
        let error = pollster::block_on(self.device.pop_error_scope());
        (output, error)
    }
}

impl Device for WgpuDevice {
    type BindGroup = Arc<::wgpu::BindGroup>;
    type Buffer = WgpuBuffer;
    type Encoder = ::wgpu::CommandEncoder;
    type Pipeline = Arc<::wgpu::ComputePipeline>;

    #[inline]
    fn id(&self) -> DeviceId {
        self.id
    }

    #[inline]
    fn max_workgroup_length(&self) -> u32 {
        self.limits
            .max_compute_invocations_per_workgroup
            .min(self.limits.max_compute_workgroup_size_x)
    }

    #[inline]
    fn max_workgroup_count(&self) -> u32 {
        self.limits.max_compute_workgroups_per_dimension
    }

    fn create_buffer(
        &self,
        label: &str,
        size: u64,
        usage: BufferUsages,
    ) -> Result<Self::Buffer, Error> {
        let (buffer, error) =
            self.scoped(::wgpu::ErrorFilter::OutOfMemory, |device| {
                device.create_buffer(&::wgpu::BufferDescriptor {
                    label: Some(label),
                    size,
                    usage,
                    mapped_at_creation: false,
                })
            });
        match error {
            Some(error) => Err(Error::Allocation(error.to_string())),
            None => Ok(self.buffer(size, buffer)),
        }
    }

    fn create_buffer_init(
        &self,
        label: &str,
        contents: &[u8],
        usage: BufferUsages,
    ) -> Result<Self::Buffer, Error> {
        let (buffer, error) =
            self.scoped(::wgpu::ErrorFilter::OutOfMemory, |device| {
                device.create_buffer_init(&::wgpu::util::BufferInitDescriptor {
                    label: Some(label),
                    contents,
                    usage,
                })
            });
        match error {
            Some(error) => Err(Error::Allocation(error.to_string())),
            None => Ok(self.buffer(contents.len() as u64, buffer)),
        }
    }

    #[inline]
    fn buffer_id(
        &self,
        buffer: &Self::Buffer,
    ) -> BufferId {
        buffer.id
    }

    #[inline]
    fn buffer_size(
        &self,
        buffer: &Self::Buffer,
    ) -> u64 {
        buffer.size
    }

    fn destroy_buffer(
        &self,
        buffer: &Self::Buffer,
    ) {
        buffer.inner.destroy();
    }

    fn create_compute_pipeline(
        &self,
        descriptor: &PipelineDescriptor,
    ) -> Result<Self::Pipeline, Error> {
        let layout_entries = descriptor
            .layout
            .iter()
            .map(|entry| ::wgpu::BindGroupLayoutEntry {
                binding: entry.binding,
                visibility: ::wgpu::ShaderStages::COMPUTE,
                ty: ::wgpu::BindingType::Buffer {
                    ty: ::wgpu::BufferBindingType::Storage {
                        read_only: entry.read_only,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect::<Vec<_>>();

        let (pipeline, error) =
            self.scoped(::wgpu::ErrorFilter::Validation, |device| {
                let module =
                    device.create_shader_module(::wgpu::ShaderModuleDescriptor {
                        label: Some(descriptor.label),
                        source: ::wgpu::ShaderSource::Wgsl(
                            descriptor.source.into(),
                        ),
                    });
                let bind_group_layout = device.create_bind_group_layout(
                    &::wgpu::BindGroupLayoutDescriptor {
                        label: Some(descriptor.label),
                        entries: &layout_entries,
                    },
                );
                let layout = device.create_pipeline_layout(
                    &::wgpu::PipelineLayoutDescriptor {
                        label: Some(descriptor.label),
                        bind_group_layouts: &[&bind_group_layout],
                        push_constant_ranges: &[],
                    },
                );
                device.create_compute_pipeline(
                    &::wgpu::ComputePipelineDescriptor {
                        label: Some(descriptor.label),
                        layout: Some(&layout),
                        module: &module,
                        entry_point: Some(descriptor.entry_point),
                        compilation_options: Default::default(),
                        cache: None,
                    },
                )
            });
        match error {
            Some(error) => Err(Error::Compilation(error.to_string())),
            None => Ok(Arc::new(pipeline)),
        }
    }

    fn create_bind_group(
        &self,
        label: &str,
        pipeline: &Self::Pipeline,
        entries: &[BindGroupEntry<Self::Buffer>],
    ) -> Result<Self::BindGroup, Error> {
        let entries = entries
            .iter()
            .map(|entry| ::wgpu::BindGroupEntry {
                binding: entry.binding,
                resource: entry.buffer.inner.as_entire_binding(),
            })
            .collect::<Vec<_>>();

        let (bind_group, error) =
            self.scoped(::wgpu::ErrorFilter::Validation, |device| {
                device.create_bind_group(&::wgpu::BindGroupDescriptor {
                    label: Some(label),
                    layout: &pipeline.get_bind_group_layout(0),
                    entries: &entries,
                })
            });
        match error {
            Some(error) => Err(Error::Validation(
                format!("Bind group \"{label}\""),
                format!("valid ({error})"),
            )),
            None => Ok(Arc::new(bind_group)),
        }
    }

    fn create_encoder(
        &self,
        label: &str,
    ) -> Self::Encoder {
        self.device
            .create_command_encoder(&::wgpu::CommandEncoderDescriptor {
                label: Some(label),
            })
    }

    fn encode_dispatch(
        &self,
        encoder: &mut Self::Encoder,
        pass: ComputePass<Self>,
    ) {
        let mut compute_pass =
            encoder.begin_compute_pass(&::wgpu::ComputePassDescriptor {
                label: Some(pass.label),
                timestamp_writes: None,
            });
        compute_pass.set_pipeline(pass.pipeline);
        compute_pass.set_bind_group(0, &**pass.bind_group, &[]);
        compute_pass.dispatch_workgroups(pass.workgroup_count, 1, 1);
    }

    fn submit(
        &self,
        encoder: Self::Encoder,
    ) {
        self.queue.submit(Some(encoder.finish()));
    }

    fn read_buffer(
        &self,
        buffer: &Self::Buffer,
    ) -> Result<Vec<u8>, Error> {
        let size = buffer.size;
        if size == 0 {
            return Ok(vec![]);
        }

        // Copying to a mappable buffer

        let size_aligned = size.next_multiple_of(::wgpu::COPY_BUFFER_ALIGNMENT);
        let staging = self.create_buffer(
            "gausplat-scan readback",
            size_aligned,
            BufferUsages::MAP_READ | BufferUsages::COPY_DST,
        )?;
        let mut encoder = self.create_encoder("gausplat-scan readback");
        encoder.copy_buffer_to_buffer(
            &buffer.inner,
            0,
            &staging.inner,
            0,
            size_aligned.min(buffer.inner.size()),
        );
        self.submit(encoder);

        // Mapping and waiting

        let slice = staging.inner.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(::wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(::wgpu::PollType::Wait)
            .map_err(|error| Error::Readback(error.to_string()))?;
        receiver
            .recv()
            .map_err(|error| Error::Readback(error.to_string()))?
            .map_err(|error| Error::Readback(error.to_string()))?;

        let mut data = slice.get_mapped_range().to_vec();
        staging.inner.unmap();
        self.destroy_buffer(&staging);

        data.truncate(size as usize);
        Ok(data)
    }
}

impl WgpuBuffer {
    #[inline]
    pub fn inner(&self) -> &::wgpu::Buffer {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_buffer_after_init() {
        let device = match WgpuDevice::new() {
            Ok(device) => device,
            Err(error) => {
                log::warn!("Skipping the test: {error}");
                return;
            },
        };
        let values = [7_u32, 1, 0, 3, 9];

        let buffer = device
            .create_buffer_init(
                "values",
                bytemuck::cast_slice(&values),
                BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            )
            .unwrap();
        let output = device.read_buffer(&buffer).unwrap();

        assert_eq!(bytemuck::pod_collect_to_vec::<u8, u32>(&output), values);
        assert!(device.max_workgroup_length() > 0);
    }
}
