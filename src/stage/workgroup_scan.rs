pub use super::*;

use std::fmt;

/// The options of a [`WorkgroupScan`].
#[derive(Clone, Debug)]
pub struct WorkgroupScanConfig<D: Device> {
    pub device: D,
    /// `[N]`
    pub source: D::Buffer,
    pub template: OperationTemplate,
    /// The requested workgroup length `G`, where `0` is the device maximum.
    pub workgroup_length: u32,
    pub emit_block_sums: bool,
    pub label: String,
    pub pipeline_cache: PipelineCache<D>,
}

/// Scanning each workgroup-sized block of the source inclusively.
///
/// The derived buffers are allocated on first access and kept until
/// an input they depend on is set.
pub struct WorkgroupScan<D: Device> {
    device: D,
    source: D::Buffer,
    template: OperationTemplate,
    workgroup_length: u32,
    emit_block_sums: bool,
    label: String,
    pipeline_cache: PipelineCache<D>,
    resources: ResourceTable<Field, D>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Field {
    Source,
    Template,
    WorkgroupLength,
    EmitBlockSums,
    Label,
    /// `N`
    SourceLength,
    /// `G`
    GroupSize,
    /// `N / G`
    DispatchSize,
    Pipeline,
    /// `[N]`
    PrefixScan,
    /// `[N / G]`
    BlockSums,
    BindGroup,
}

impl Property for Field {
    const ALL: &'static [Self] = &[
        Field::Source,
        Field::Template,
        Field::WorkgroupLength,
        Field::EmitBlockSums,
        Field::Label,
        Field::SourceLength,
        Field::GroupSize,
        Field::DispatchSize,
        Field::Pipeline,
        Field::PrefixScan,
        Field::BlockSums,
        Field::BindGroup,
    ];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }

    fn dependencies(self) -> &'static [Self] {
        match self {
            Field::Source
            | Field::Template
            | Field::WorkgroupLength
            | Field::EmitBlockSums
            | Field::Label => &[],
            Field::SourceLength => &[Field::Source, Field::Template],
            Field::GroupSize => &[Field::WorkgroupLength],
            Field::DispatchSize => &[Field::SourceLength, Field::GroupSize],
            Field::Pipeline => {
                &[Field::GroupSize, Field::Template, Field::EmitBlockSums]
            },
            Field::PrefixScan => &[Field::SourceLength, Field::Label],
            Field::BlockSums => &[
                Field::DispatchSize,
                Field::Template,
                Field::EmitBlockSums,
                Field::Label,
            ],
            Field::BindGroup => &[
                Field::Pipeline,
                Field::Source,
                Field::PrefixScan,
                Field::BlockSums,
                Field::EmitBlockSums,
                Field::Label,
            ],
        }
    }
}

impl<D: Device> WorkgroupScanConfig<D> {
    pub fn new(
        device: D,
        source: D::Buffer,
    ) -> Self {
        Self {
            device,
            source,
            template: Default::default(),
            workgroup_length: 0,
            emit_block_sums: true,
            label: "workgroup scan".into(),
            pipeline_cache: Default::default(),
        }
    }

    pub fn with_template(
        mut self,
        template: OperationTemplate,
    ) -> Self {
        self.template = template;
        self
    }

    pub fn with_workgroup_length(
        mut self,
        workgroup_length: u32,
    ) -> Self {
        self.workgroup_length = workgroup_length;
        self
    }

    pub fn with_emit_block_sums(
        mut self,
        emit_block_sums: bool,
    ) -> Self {
        self.emit_block_sums = emit_block_sums;
        self
    }

    pub fn with_label(
        mut self,
        label: impl Into<String>,
    ) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_pipeline_cache(
        mut self,
        pipeline_cache: PipelineCache<D>,
    ) -> Self {
        self.pipeline_cache = pipeline_cache;
        self
    }
}

impl<D: Device> From<WorkgroupScanConfig<D>> for WorkgroupScan<D> {
    fn from(config: WorkgroupScanConfig<D>) -> Self {
        Self {
            resources: ResourceTable::new(config.device.to_owned()),
            device: config.device,
            source: config.source,
            template: config.template,
            workgroup_length: config.workgroup_length,
            emit_block_sums: config.emit_block_sums,
            label: config.label,
            pipeline_cache: config.pipeline_cache,
        }
    }
}

impl<D: Device> WorkgroupScan<D> {
    #[inline]
    pub fn source(&self) -> &D::Buffer {
        &self.source
    }

    #[inline]
    pub fn template(&self) -> &OperationTemplate {
        &self.template
    }

    #[inline]
    pub fn emit_block_sums(&self) -> bool {
        self.emit_block_sums
    }

    #[inline]
    pub fn pipeline_cache(&self) -> &PipelineCache<D> {
        &self.pipeline_cache
    }

    pub fn set_source(
        &mut self,
        source: D::Buffer,
    ) {
        if self.device.buffer_id(&source) == self.device.buffer_id(&self.source)
        {
            return;
        }
        self.source = source;
        self.resources.invalidate(Field::Source);
    }

    pub fn set_template(
        &mut self,
        template: OperationTemplate,
    ) {
        if template == self.template {
            return;
        }
        self.template = template;
        self.resources.invalidate(Field::Template);
    }

    /// Setting the requested workgroup length, where `0` is the device maximum.
    pub fn set_workgroup_length(
        &mut self,
        workgroup_length: u32,
    ) {
        if workgroup_length == self.workgroup_length {
            return;
        }
        self.workgroup_length = workgroup_length;
        self.resources.invalidate(Field::WorkgroupLength);
    }

    pub fn set_emit_block_sums(
        &mut self,
        emit_block_sums: bool,
    ) {
        if emit_block_sums == self.emit_block_sums {
            return;
        }
        self.emit_block_sums = emit_block_sums;
        self.resources.invalidate(Field::EmitBlockSums);
    }

    pub fn set_label(
        &mut self,
        label: impl Into<String>,
    ) {
        let label = label.into();
        if label == self.label {
            return;
        }
        self.label = label;
        self.resources.invalidate(Field::Label);
    }

    /// The element count of the source, `N`.
    pub fn source_length(&mut self) -> Result<u32, Error> {
        if let Some(length) = self.resources.count(Field::SourceLength) {
            return Ok(length);
        }

        let name = format!("the source of \"{}\"", self.label);
        let length =
            element_count(&self.device, &self.source, &self.template, &name)?;
        if length == 0 {
            return Err(Error::Validation(
                format!("The length of {name}"),
                "positive".into(),
            ));
        }

        self.resources
            .insert(Field::SourceLength, Resource::Count(length));
        Ok(length)
    }

    /// The effective workgroup length, `G`.
    pub fn workgroup_length(&mut self) -> u32 {
        if let Some(length) = self.resources.count(Field::GroupSize) {
            return length;
        }

        let length =
            resolve_workgroup_length(&self.device, self.workgroup_length);
        self.resources
            .insert(Field::GroupSize, Resource::Count(length));
        length
    }

    /// The count of workgroups dispatched, `N / G`.
    pub fn dispatch_size(&mut self) -> Result<u32, Error> {
        if let Some(size) = self.resources.count(Field::DispatchSize) {
            return Ok(size);
        }

        let length = self.source_length()?;
        let group_size = self.workgroup_length();
        let name = format!("\"{}\"", self.label);
        let size = dispatch_size(&self.device, length, group_size, &name)?;

        self.resources
            .insert(Field::DispatchSize, Resource::Count(size));
        Ok(size)
    }

    pub fn pipeline(&mut self) -> Result<D::Pipeline, Error> {
        if let Some(pipeline) = self.resources.pipeline(Field::Pipeline) {
            return Ok(pipeline);
        }

        let key = PipelineKey {
            device: self.device.id(),
            workgroup_length: self.workgroup_length(),
            template: self.template,
            block_sums: self.emit_block_sums,
            kernel: KernelKind::WorkgroupScan,
        };
        let pipeline = self.pipeline_cache.get(&self.device, &key)?;

        self.resources
            .insert(Field::Pipeline, Resource::Pipeline(pipeline.to_owned()));
        Ok(pipeline)
    }

    /// The blockwise inclusive scan of the source, `[N]`.
    pub fn prefix_scan(&mut self) -> Result<D::Buffer, Error> {
        if let Some(buffer) = self.resources.buffer(Field::PrefixScan) {
            return Ok(buffer);
        }

        let size = self.source_length()? as u64 * self.template.element.size();
        self.resources.create_buffer(
            Field::PrefixScan,
            &format!("{} prefix scan", self.label),
            size,
        )
    }

    /// The total of each block, `[N / G]`.
    ///
    /// It fails if the block sums are not emitted.
    pub fn block_sums(&mut self) -> Result<D::Buffer, Error> {
        if !self.emit_block_sums {
            return Err(Error::Validation(
                format!("The block sums of \"{}\"", self.label),
                "emitted".into(),
            ));
        }
        if let Some(buffer) = self.resources.buffer(Field::BlockSums) {
            return Ok(buffer);
        }

        let size = self.dispatch_size()? as u64 * self.template.element.size();
        self.resources.create_buffer(
            Field::BlockSums,
            &format!("{} block sums", self.label),
            size,
        )
    }

    pub fn bind_group(&mut self) -> Result<D::BindGroup, Error> {
        if let Some(bind_group) = self.resources.bind_group(Field::BindGroup) {
            return Ok(bind_group);
        }

        let pipeline = self.pipeline()?;
        let prefix_scan = self.prefix_scan()?;
        let block_sums = match self.emit_block_sums {
            true => Some(self.block_sums()?),
            false => None,
        };

        let mut entries = vec![
            BindGroupEntry {
                binding: 1,
                buffer: &self.source,
            },
            BindGroupEntry {
                binding: 2,
                buffer: &prefix_scan,
            },
        ];
        if let Some(block_sums) = &block_sums {
            entries.push(BindGroupEntry {
                binding: 3,
                buffer: block_sums,
            });
        }

        let bind_group =
            self.device
                .create_bind_group(&self.label, &pipeline, &entries)?;

        self.resources.insert(
            Field::BindGroup,
            Resource::BindGroup(bind_group.to_owned()),
        );
        Ok(bind_group)
    }

    /// The count of live buffers owned by the stage.
    #[inline]
    pub fn owned_buffers(&self) -> usize {
        self.resources.owned_buffers()
    }
}

impl<D: Device> ScanStage<D> for WorkgroupScan<D> {
    #[inline]
    fn label(&self) -> &str {
        &self.label
    }

    fn encode(
        &mut self,
        encoder: &mut D::Encoder,
    ) -> Result<u32, Error> {
        let workgroup_count = self.dispatch_size()?;
        let pipeline = self.pipeline()?;
        let bind_group = self.bind_group()?;

        #[cfg(debug_assertions)]
        {
            let group_size = self.workgroup_length();
            log::debug!(
                target: "gausplat::scan::stage",
                "encode \"{}\" ({workgroup_count} x {group_size})",
                self.label,
            );
        }

        self.device.encode_dispatch(
            encoder,
            ComputePass {
                label: &self.label,
                pipeline: &pipeline,
                bind_group: &bind_group,
                workgroup_count,
            },
        );

        Ok(1)
    }

    fn destroy(&mut self) {
        self.resources.destroy();
    }
}

impl<D: Device> Drop for WorkgroupScan<D> {
    fn drop(&mut self) {
        self.resources.destroy();
    }
}

impl<D: Device> fmt::Debug for WorkgroupScan<D> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        f.debug_struct("WorkgroupScan")
            .field("label", &self.label)
            .field("source", &self.source)
            .field("template", &self.template.name)
            .field("workgroup_length", &self.workgroup_length)
            .field("emit_block_sums", &self.emit_block_sums)
            .field("resources", &self.resources)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{BufferUsages, HostBuffer, HostDevice, HostLimits},
        template::{MAX_U32, SUM_U32},
    };
    use bytemuck::{cast_slice, pod_collect_to_vec};

    fn upload(
        device: &HostDevice,
        values: &[u32],
    ) -> HostBuffer {
        device
            .create_buffer_init(
                "source",
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

    fn run(
        device: &HostDevice,
        scan: &mut WorkgroupScan<HostDevice>,
    ) {
        StageGroup::new(device.to_owned(), "test")
            .with_stage(scan)
            .dispatch()
            .unwrap();

        assert_eq!(device.failed_dispatches(), 0, "{:?}", device.last_error());
    }

    #[test]
    fn encode_scans_each_block() {
        let device = HostDevice::default();
        let source = upload(&device, &[0, 1, 2, 3, 4, 5, 6]);
        let mut scan = WorkgroupScan::from(
            WorkgroupScanConfig::new(device.to_owned(), source)
                .with_template(SUM_U32)
                .with_workgroup_length(4),
        );

        run(&device, &mut scan);

        assert_eq!(scan.source_length().unwrap(), 7);
        assert_eq!(scan.dispatch_size().unwrap(), 2);
        assert_eq!(
            read(&device, &scan.prefix_scan().unwrap()),
            [0, 1, 3, 6, 4, 9, 15]
        );
        assert_eq!(read(&device, &scan.block_sums().unwrap()), [6, 15]);
    }

    #[test]
    fn encode_without_block_sums() {
        let device = HostDevice::default();
        let source = upload(&device, &[5, 1, 7, 2, 9]);
        let mut scan = WorkgroupScan::from(
            WorkgroupScanConfig::new(device.to_owned(), source)
                .with_template(MAX_U32)
                .with_workgroup_length(8)
                .with_emit_block_sums(false),
        );

        run(&device, &mut scan);

        assert_eq!(read(&device, &scan.prefix_scan().unwrap()), [5, 5, 7, 7, 9]);
        assert!(matches!(scan.block_sums(), Err(Error::Validation(..))));
        assert_eq!(scan.owned_buffers(), 1);
    }

    #[test]
    fn derived_buffers_are_reused_until_source_changes() {
        let device = HostDevice::default();
        let source_1 = upload(&device, &[1; 8]);
        let source_2 = upload(&device, &[2; 12]);
        let mut scan = WorkgroupScan::from(
            WorkgroupScanConfig::new(device.to_owned(), source_1.to_owned())
                .with_workgroup_length(4),
        );

        let prefix_scan_1 = scan.prefix_scan().unwrap();
        let block_sums_1 = scan.block_sums().unwrap();
        let bind_group_1 = scan.bind_group().unwrap();
        assert_eq!(
            device.buffer_id(&scan.prefix_scan().unwrap()),
            device.buffer_id(&prefix_scan_1),
        );
        assert_eq!(scan.bind_group().unwrap().label(), bind_group_1.label());
        assert_eq!(device.live_buffers(), 4);

        // Setting an equal source keeps everything
        scan.set_source(source_1);
        assert_eq!(
            device.buffer_id(&scan.block_sums().unwrap()),
            device.buffer_id(&block_sums_1),
        );

        scan.set_source(source_2);
        assert_eq!(device.live_buffers(), 2);

        let prefix_scan_2 = scan.prefix_scan().unwrap();
        let block_sums_2 = scan.block_sums().unwrap();
        assert_ne!(
            device.buffer_id(&prefix_scan_2),
            device.buffer_id(&prefix_scan_1),
        );
        assert_eq!(device.buffer_size(&prefix_scan_2), 48);
        assert_eq!(device.buffer_size(&block_sums_2), 12);
        assert_eq!(device.live_buffers(), 4);

        run(&device, &mut scan);
        assert_eq!(read(&device, &block_sums_2), [8, 8, 8]);
    }

    #[test]
    fn set_label_reallocates_buffers_only() {
        let device = HostDevice::default();
        let source = upload(&device, &[1; 8]);
        let mut scan = WorkgroupScan::from(WorkgroupScanConfig::new(
            device.to_owned(),
            source,
        ));

        scan.pipeline().unwrap();
        let prefix_scan_1 = scan.prefix_scan().unwrap();
        assert_eq!(device.compiled_pipelines(), 1);

        scan.set_label("renamed");
        let prefix_scan_2 = scan.prefix_scan().unwrap();
        scan.pipeline().unwrap();

        assert_eq!(ScanStage::label(&scan), "renamed");
        assert_ne!(
            device.buffer_id(&prefix_scan_1),
            device.buffer_id(&prefix_scan_2),
        );
        assert_eq!(device.compiled_pipelines(), 1);
    }

    #[test]
    fn set_template_recompiles_pipeline() {
        let device = HostDevice::default();
        let source = upload(&device, &[3, 1, 4, 1, 5]);
        let mut scan = WorkgroupScan::from(
            WorkgroupScanConfig::new(device.to_owned(), source)
                .with_workgroup_length(2),
        );

        run(&device, &mut scan);
        assert_eq!(read(&device, &scan.block_sums().unwrap()), [4, 5, 5]);

        scan.set_template(MAX_U32);
        run(&device, &mut scan);

        assert_eq!(
            read(&device, &scan.prefix_scan().unwrap()),
            [3, 3, 4, 4, 5]
        );
        assert_eq!(read(&device, &scan.block_sums().unwrap()), [3, 4, 5]);
        assert_eq!(device.compiled_pipelines(), 2);
        assert_eq!(scan.pipeline_cache().len(), 2);
    }

    #[test]
    fn workgroup_length_is_clamped() {
        let device = HostDevice::new(HostLimits {
            max_workgroup_length: 8,
            ..Default::default()
        });
        let source = upload(&device, &[1; 20]);
        let mut scan = WorkgroupScan::from(
            WorkgroupScanConfig::new(device.to_owned(), source)
                .with_workgroup_length(64),
        );

        assert_eq!(scan.workgroup_length(), 8);
        assert_eq!(scan.dispatch_size().unwrap(), 3);

        scan.set_workgroup_length(0);
        assert_eq!(scan.workgroup_length(), 8);

        scan.set_workgroup_length(4);
        assert_eq!(scan.workgroup_length(), 4);
        assert_eq!(scan.dispatch_size().unwrap(), 5);
    }

    #[test]
    fn source_length_is_validated() {
        let device = HostDevice::default();
        let empty = device
            .create_buffer("empty", 0, BufferUsages::STORAGE)
            .unwrap();
        let odd = device
            .create_buffer("odd", 6, BufferUsages::STORAGE)
            .unwrap();
        let mut scan = WorkgroupScan::from(WorkgroupScanConfig::new(
            device.to_owned(),
            empty,
        ));

        assert!(matches!(scan.source_length(), Err(Error::Validation(..))));
        assert!(matches!(scan.prefix_scan(), Err(Error::Validation(..))));

        scan.set_source(odd);
        assert!(matches!(scan.dispatch_size(), Err(Error::Validation(..))));
        assert_eq!(scan.owned_buffers(), 0);
    }

    #[test]
    fn dispatch_size_is_validated() {
        let device = HostDevice::new(HostLimits {
            max_workgroup_count: 2,
            ..Default::default()
        });
        let source = upload(&device, &[1; 9]);
        let mut scan = WorkgroupScan::from(
            WorkgroupScanConfig::new(device.to_owned(), source)
                .with_workgroup_length(4),
        );
        let mut encoder = device.create_encoder("test");

        let error = scan.encode(&mut encoder).unwrap_err();

        assert!(matches!(error, Error::Validation(..)), "error: {error}");
    }

    #[test]
    fn drop_destroys_owned_buffers() {
        let device = HostDevice::default();
        let source = upload(&device, &[1; 16]);
        let mut scan = WorkgroupScan::from(
            WorkgroupScanConfig::new(device.to_owned(), source)
                .with_workgroup_length(4),
        );

        run(&device, &mut scan);
        assert_eq!(device.live_buffers(), 3);

        scan.destroy();
        assert_eq!(device.live_buffers(), 1);

        // Destroyed stages can still be used
        scan.block_sums().unwrap();
        assert_eq!(device.live_buffers(), 2);

        drop(scan);
        assert_eq!(device.live_buffers(), 1);
    }
}
