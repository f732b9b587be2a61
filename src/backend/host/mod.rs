//! A device executing the scan kernels in host memory.
//!
//! It renders and checks kernel sources like a compiler would, records
//! dispatches into encoders, and runs them on submission in recorded order.
//! The workgroups of one dispatch run in parallel.
//!
//! It also tracks every allocation, compilation and dispatch, which makes it
//! the reference device for testing resource ownership.

pub use super::*;
pub use crate::{kernel::KernelKind, template::OperationTemplate};

use bytemuck::{cast_slice, cast_slice_mut};
use rayon::prelude::*;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

/// The capabilities of a [`HostDevice`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HostLimits {
    pub max_workgroup_length: u32,
    pub max_workgroup_count: u32,
    /// The largest buffer in bytes.
    pub max_buffer_size: u64,
}

impl Default for HostLimits {
    fn default() -> Self {
        Self {
            max_workgroup_length: 256,
            max_workgroup_count: 65535,
            max_buffer_size: 1 << 28,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HostDevice {
    id: DeviceId,
    limits: HostLimits,
    state: Arc<Mutex<HostState>>,
}

#[derive(Debug, Default)]
struct HostState {
    /// Sizes of the live buffers.
    buffers: HashMap<BufferId, u64>,
    compiled_pipelines: usize,
    dispatches: usize,
    failed_dispatches: usize,
    last_error: Option<String>,
    submissions: usize,
}

#[derive(Clone)]
pub struct HostBuffer {
    id: BufferId,
    label: Arc<str>,
    size: u64,
    /// `[(S + 3) / 4]`
    words: Arc<RwLock<Vec<u32>>>,
}

#[derive(Clone, Debug)]
pub struct HostPipeline {
    label: Arc<str>,
    kernel: KernelKind,
    layout: Arc<[LayoutEntry]>,
    template: OperationTemplate,
    workgroup_length: u32,
}

#[derive(Clone, Debug)]
pub struct HostBindGroup {
    label: Arc<str>,
    buffers: HashMap<u32, HostBuffer>,
}

#[derive(Debug)]
pub struct HostEncoder {
    label: String,
    commands: Vec<HostCommand>,
}

#[derive(Debug)]
struct HostCommand {
    label: String,
    pipeline: HostPipeline,
    bind_group: HostBindGroup,
    workgroup_count: u32,
}

impl HostDevice {
    pub fn new(limits: HostLimits) -> Self {
        Self {
            id: DeviceId::new(),
            limits,
            state: Default::default(),
        }
    }

    #[inline]
    pub fn limits(&self) -> &HostLimits {
        &self.limits
    }

    /// The count of buffers created and not destroyed yet.
    pub fn live_buffers(&self) -> usize {
        self.state().buffers.len()
    }

    /// The total size of buffers created and not destroyed yet.
    pub fn live_bytes(&self) -> u64 {
        self.state().buffers.values().sum()
    }

    pub fn compiled_pipelines(&self) -> usize {
        self.state().compiled_pipelines
    }

    /// The count of dispatches executed.
    pub fn dispatches(&self) -> usize {
        self.state().dispatches
    }

    /// The count of submitted dispatches failing to execute.
    pub fn failed_dispatches(&self) -> usize {
        self.state().failed_dispatches
    }

    /// The message of the latest failed dispatch.
    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.to_owned()
    }

    pub fn submissions(&self) -> usize {
        self.state().submissions
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn allocate(
        &self,
        label: &str,
        size: u64,
    ) -> Result<HostBuffer, Error> {
        if size > self.limits.max_buffer_size {
            return Err(Error::Allocation(format!(
                "Buffer \"{label}\" of {size} bytes exceeds the limit of {} bytes",
                self.limits.max_buffer_size
            )));
        }

        let buffer = HostBuffer {
            id: BufferId::new(),
            label: label.into(),
            size,
            words: Arc::new(RwLock::new(vec![0; size.div_ceil(4) as usize])),
        };
        self.state().buffers.insert(buffer.id, size);

        Ok(buffer)
    }

    fn execute(
        &self,
        command: HostCommand,
    ) -> Result<(), Error> {
        let HostCommand {
            label,
            pipeline,
            bind_group,
            workgroup_count,
        } = command;

        #[cfg(debug_assertions)]
        log::debug!(
            target: "gausplat::scan::host",
            "dispatch \"{label}\" ({workgroup_count}, 1, 1)",
        );

        for buffer in bind_group.buffers.values() {
            if !self.state().buffers.contains_key(&buffer.id) {
                return Err(Error::Validation(
                    format!("Buffer \"{}\" bound in \"{label}\"", buffer.label),
                    "alive at submission".into(),
                ));
            }
        }

        let binding = |binding: u32| {
            bind_group.buffers.get(&binding).ok_or_else(|| {
                Error::Validation(
                    format!("Binding {binding} of \"{label}\""),
                    "bound".into(),
                )
            })
        };

        match pipeline.kernel {
            KernelKind::WorkgroupScan => {
                let block_sums = match pipeline.layout.len() {
                    3 => Some(binding(3)?),
                    _ => None,
                };
                workgroup_scan(
                    &pipeline,
                    workgroup_count,
                    binding(1)?,
                    binding(2)?,
                    block_sums,
                );
            },
            KernelKind::ApplyBlockSums => {
                apply_block_sums(
                    &pipeline,
                    workgroup_count,
                    binding(2)?,
                    binding(3)?,
                    binding(4)?,
                );
            },
        }

        self.state().dispatches += 1;
        Ok(())
    }
}

impl Default for HostDevice {
    #[inline]
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl Device for HostDevice {
    type BindGroup = HostBindGroup;
    type Buffer = HostBuffer;
    type Encoder = HostEncoder;
    type Pipeline = HostPipeline;

    #[inline]
    fn id(&self) -> DeviceId {
        self.id
    }

    #[inline]
    fn max_workgroup_length(&self) -> u32 {
        self.limits.max_workgroup_length
    }

    #[inline]
    fn max_workgroup_count(&self) -> u32 {
        self.limits.max_workgroup_count
    }

    fn create_buffer(
        &self,
        label: &str,
        size: u64,
        _usage: BufferUsages,
    ) -> Result<Self::Buffer, Error> {
        self.allocate(label, size)
    }

    fn create_buffer_init(
        &self,
        label: &str,
        contents: &[u8],
        _usage: BufferUsages,
    ) -> Result<Self::Buffer, Error> {
        let buffer = self.allocate(label, contents.len() as u64)?;
        cast_slice_mut::<u32, u8>(&mut buffer.write())[..contents.len()]
            .copy_from_slice(contents);
        Ok(buffer)
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
        self.state().buffers.remove(&buffer.id);
    }

    fn create_compute_pipeline(
        &self,
        descriptor: &PipelineDescriptor,
    ) -> Result<Self::Pipeline, Error> {
        let key = descriptor.key;

        if let Some(start) = descriptor.source.find("{{") {
            return Err(Error::Compilation(format!(
                "Unresolved placeholder at byte {start} of \"{}\"",
                descriptor.label
            )));
        }
        if !descriptor
            .source
            .contains(&format!("fn {}(", descriptor.entry_point))
        {
            return Err(Error::Compilation(format!(
                "Entry point \"{}\" is missing in \"{}\"",
                descriptor.entry_point, descriptor.label
            )));
        }
        if key.workgroup_length == 0
            || key.workgroup_length > self.limits.max_workgroup_length
        {
            return Err(Error::Compilation(format!(
                "Workgroup size {} of \"{}\" is not within 1 ~ {}",
                key.workgroup_length,
                descriptor.label,
                self.limits.max_workgroup_length
            )));
        }

        self.state().compiled_pipelines += 1;

        Ok(HostPipeline {
            label: descriptor.label.into(),
            kernel: key.kernel,
            layout: descriptor.layout.into(),
            template: key.template,
            workgroup_length: key.workgroup_length,
        })
    }

    fn create_bind_group(
        &self,
        label: &str,
        pipeline: &Self::Pipeline,
        entries: &[BindGroupEntry<Self::Buffer>],
    ) -> Result<Self::BindGroup, Error> {
        let buffers = entries
            .iter()
            .map(|entry| (entry.binding, entry.buffer.to_owned()))
            .collect::<HashMap<_, _>>();

        let is_matched = buffers.len() == pipeline.layout.len()
            && pipeline
                .layout
                .iter()
                .all(|entry| buffers.contains_key(&entry.binding));
        if !is_matched {
            let mut bindings = buffers.keys().collect::<Vec<_>>();
            bindings.sort();
            return Err(Error::Validation(
                format!("Bindings {bindings:?} of \"{label}\""),
                format!("the layout of \"{}\"", pipeline.label),
            ));
        }

        Ok(HostBindGroup {
            label: label.into(),
            buffers,
        })
    }

    fn create_encoder(
        &self,
        label: &str,
    ) -> Self::Encoder {
        HostEncoder {
            label: label.into(),
            commands: vec![],
        }
    }

    fn encode_dispatch(
        &self,
        encoder: &mut Self::Encoder,
        pass: ComputePass<Self>,
    ) {
        encoder.commands.push(HostCommand {
            label: pass.label.into(),
            pipeline: pass.pipeline.to_owned(),
            bind_group: pass.bind_group.to_owned(),
            workgroup_count: pass.workgroup_count,
        });
    }

    fn submit(
        &self,
        encoder: Self::Encoder,
    ) {
        log::debug!(
            target: "gausplat::scan::host",
            "submit \"{}\" ({} dispatches)",
            encoder.label,
            encoder.commands.len(),
        );

        // Submission errors surface as device errors, not to the caller
        for command in encoder.commands {
            if let Err(error) = self.execute(command) {
                log::error!(target: "gausplat::scan::host", "{error}");

                let mut state = self.state();
                state.failed_dispatches += 1;
                state.last_error = Some(error.to_string());
            }
        }

        self.state().submissions += 1;
    }

    fn read_buffer(
        &self,
        buffer: &Self::Buffer,
    ) -> Result<Vec<u8>, Error> {
        if !self.state().buffers.contains_key(&buffer.id) {
            return Err(Error::Readback(format!(
                "Buffer \"{}\" is destroyed",
                buffer.label
            )));
        }

        Ok(cast_slice::<u32, u8>(&buffer.read())[..buffer.size as usize]
            .to_vec())
    }
}

impl HostBuffer {
    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The words visible to kernels, `[S / 4]`.
    fn elements(&self) -> Vec<u32> {
        let count = (self.size / 4) as usize;
        self.read()[..count].to_vec()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<u32>> {
        self.words.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<u32>> {
        self.words.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("size", &self.size)
            .finish()
    }
}

impl HostBindGroup {
    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Scanning each block of `G` source elements inclusively.
fn workgroup_scan(
    pipeline: &HostPipeline,
    workgroup_count: u32,
    source: &HostBuffer,
    prefix_scan: &HostBuffer,
    block_sums: Option<&HostBuffer>,
) {
    let template = &pipeline.template;
    // G
    let group_size = pipeline.workgroup_length as usize;
    // [N]
    let source = source.elements();

    // [N / G, G]
    let blocks = source
        .par_chunks(group_size)
        .take(workgroup_count as usize)
        .map(|block| {
            block
                .iter()
                .scan(template.host_identity, |state, &value| {
                    *state = template.combine_host(*state, value);
                    Some(*state)
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    // Out-of-bounds writes are discarded

    let count = (prefix_scan.size / 4) as usize;
    let mut prefix_scan = prefix_scan.write();
    blocks
        .iter()
        .flatten()
        .take(count)
        .zip(prefix_scan.iter_mut())
        .for_each(|(value, output)| *output = *value);

    if let Some(block_sums) = block_sums {
        let count = (block_sums.size / 4) as usize;
        let mut block_sums = block_sums.write();
        blocks
            .iter()
            .filter_map(|block| block.last())
            .take(count)
            .zip(block_sums.iter_mut())
            .for_each(|(value, output)| *output = *value);
    }
}

/// Combining each block of `G` partially scanned elements with the block sum
/// preceding it.
fn apply_block_sums(
    pipeline: &HostPipeline,
    workgroup_count: u32,
    partial_scan: &HostBuffer,
    block_sums: &HostBuffer,
    prefix_scan: &HostBuffer,
) {
    let template = &pipeline.template;
    // G
    let group_size = pipeline.workgroup_length as usize;
    // [N]
    let partial_scan = partial_scan.elements();
    // [N / G]
    let block_sums = block_sums.elements();

    let count = (prefix_scan.size / 4) as usize;
    let mut prefix_scan = prefix_scan.write();
    let prefix_scan = &mut prefix_scan[..count.min(partial_scan.len())];

    prefix_scan
        .par_chunks_mut(group_size)
        .zip(partial_scan.par_chunks(group_size))
        .take(workgroup_count as usize)
        .enumerate()
        .for_each(|(group_index, (outputs, values))| {
            let offset = group_index.checked_sub(1).map(|index| {
                block_sums
                    .get(index)
                    .copied()
                    .unwrap_or(template.host_identity)
            });

            outputs.iter_mut().zip(values).for_each(|(output, &value)| {
                *output = match offset {
                    Some(offset) => template.combine_host(offset, value),
                    None => value,
                };
            });
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::PipelineKey,
        template::{MAX_U32, SUM_U32},
    };
    use bytemuck::{cast_slice, pod_collect_to_vec};

    fn pipeline(
        device: &HostDevice,
        kernel: KernelKind,
        template: OperationTemplate,
        workgroup_length: u32,
        block_sums: bool,
    ) -> HostPipeline {
        let key = PipelineKey {
            device: device.id(),
            workgroup_length,
            template,
            block_sums,
            kernel,
        };
        let source = kernel
            .source(&template, workgroup_length, block_sums)
            .unwrap();

        device
            .create_compute_pipeline(&PipelineDescriptor {
                label: "test",
                source: &source,
                entry_point: "main",
                layout: kernel.layout(block_sums),
                key: &key,
            })
            .unwrap()
    }

    fn buffer(
        device: &HostDevice,
        values: &[u32],
    ) -> HostBuffer {
        device
            .create_buffer_init(
                "values",
                cast_slice(values),
                BufferUsages::STORAGE,
            )
            .unwrap()
    }

    fn read(
        device: &HostDevice,
        buffer: &HostBuffer,
    ) -> Vec<u32> {
        pod_collect_to_vec(&device.read_buffer(buffer).unwrap())
    }

    #[test]
    fn workgroup_scan_partial_block() {
        let device = HostDevice::default();
        let pipeline =
            pipeline(&device, KernelKind::WorkgroupScan, SUM_U32, 4, true);
        let source = buffer(&device, &[0, 1, 2, 3, 4, 5, 6]);
        let prefix_scan = buffer(&device, &[0; 7]);
        let block_sums = buffer(&device, &[0; 2]);
        let bind_group = device
            .create_bind_group(
                "test",
                &pipeline,
                &[
                    BindGroupEntry {
                        binding: 1,
                        buffer: &source,
                    },
                    BindGroupEntry {
                        binding: 2,
                        buffer: &prefix_scan,
                    },
                    BindGroupEntry {
                        binding: 3,
                        buffer: &block_sums,
                    },
                ],
            )
            .unwrap();

        let mut encoder = device.create_encoder("test");
        device.encode_dispatch(
            &mut encoder,
            ComputePass {
                label: "test",
                pipeline: &pipeline,
                bind_group: &bind_group,
                workgroup_count: 2,
            },
        );
        assert_eq!(device.dispatches(), 0);
        device.submit(encoder);

        assert_eq!(read(&device, &prefix_scan), [0, 1, 3, 6, 4, 9, 15]);
        assert_eq!(read(&device, &block_sums), [6, 15]);
        assert_eq!(device.dispatches(), 1);
        assert_eq!(device.submissions(), 1);
    }

    #[test]
    fn apply_block_sums_skips_first_block() {
        let device = HostDevice::default();
        let pipeline =
            pipeline(&device, KernelKind::ApplyBlockSums, MAX_U32, 2, false);
        let partial_scan = buffer(&device, &[1, 5, 2, 3, 9, 9]);
        let block_sums = buffer(&device, &[5, 5, 9]);
        let prefix_scan = buffer(&device, &[0; 6]);
        let bind_group = device
            .create_bind_group(
                "test",
                &pipeline,
                &[
                    BindGroupEntry {
                        binding: 2,
                        buffer: &partial_scan,
                    },
                    BindGroupEntry {
                        binding: 3,
                        buffer: &block_sums,
                    },
                    BindGroupEntry {
                        binding: 4,
                        buffer: &prefix_scan,
                    },
                ],
            )
            .unwrap();

        let mut encoder = device.create_encoder("test");
        device.encode_dispatch(
            &mut encoder,
            ComputePass {
                label: "test",
                pipeline: &pipeline,
                bind_group: &bind_group,
                workgroup_count: 3,
            },
        );
        device.submit(encoder);

        assert_eq!(read(&device, &prefix_scan), [1, 5, 5, 5, 9, 9]);
    }

    #[test]
    fn submit_records_failed_dispatches() {
        let device = HostDevice::default();
        let pipeline =
            pipeline(&device, KernelKind::WorkgroupScan, SUM_U32, 4, false);
        let source = buffer(&device, &[1, 2, 3]);
        let prefix_scan = buffer(&device, &[0; 3]);
        let bind_group = device
            .create_bind_group(
                "test",
                &pipeline,
                &[
                    BindGroupEntry {
                        binding: 1,
                        buffer: &source,
                    },
                    BindGroupEntry {
                        binding: 2,
                        buffer: &prefix_scan,
                    },
                ],
            )
            .unwrap();

        let mut encoder = device.create_encoder("test");
        device.encode_dispatch(
            &mut encoder,
            ComputePass {
                label: "test",
                pipeline: &pipeline,
                bind_group: &bind_group,
                workgroup_count: 1,
            },
        );
        device.destroy_buffer(&source);
        device.submit(encoder);

        assert_eq!(device.dispatches(), 0);
        assert_eq!(device.failed_dispatches(), 1);
        assert_eq!(device.submissions(), 1);
        let error = device.last_error().unwrap();
        assert!(error.contains("\"values\""), "error: {error}");
        assert_eq!(read(&device, &prefix_scan), [0; 3]);
    }

    #[test]
    fn create_bind_group_checks_layout() {
        let device = HostDevice::default();
        let pipeline =
            pipeline(&device, KernelKind::WorkgroupScan, SUM_U32, 4, true);
        let source = buffer(&device, &[1, 2]);

        let error = device
            .create_bind_group(
                "test",
                &pipeline,
                &[BindGroupEntry {
                    binding: 1,
                    buffer: &source,
                }],
            )
            .unwrap_err();

        assert!(matches!(error, Error::Validation(..)), "error: {error}");
    }

    #[test]
    fn create_buffer_checks_limit() {
        let device = HostDevice::new(HostLimits {
            max_buffer_size: 64,
            ..Default::default()
        });

        assert!(device
            .create_buffer("fit", 64, BufferUsages::STORAGE)
            .is_ok());
        let error = device
            .create_buffer("overflow", 68, BufferUsages::STORAGE)
            .unwrap_err();

        assert!(matches!(error, Error::Allocation(_)), "error: {error}");
        assert_eq!(device.live_buffers(), 1);
        assert_eq!(device.live_bytes(), 64);
    }

    #[test]
    fn read_buffer_fails_after_destroy() {
        let device = HostDevice::default();
        let values = buffer(&device, &[3, 2, 1]);

        assert_eq!(read(&device, &values), [3, 2, 1]);
        device.destroy_buffer(&values);

        assert!(matches!(
            device.read_buffer(&values),
            Err(Error::Readback(_))
        ));
        assert_eq!(device.live_buffers(), 0);
    }
}
