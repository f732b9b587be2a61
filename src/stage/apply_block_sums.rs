pub use super::*;

use std::fmt;

/// The options of an [`ApplyBlockSums`].
#[derive(Clone, Debug)]
pub struct ApplyBlockSumsConfig<D: Device> {
    pub device: D,
    /// `[N]`
    pub partial_scan: D::Buffer,
    /// The inclusive scan of the block totals, `[N / G]`.
    pub block_sums: D::Buffer,
    pub template: OperationTemplate,
    /// The requested workgroup length `G`, where `0` is the device maximum.
    pub workgroup_length: u32,
    pub label: String,
    pub pipeline_cache: PipelineCache<D>,
}

/// Combining each block of a blockwise scan with the total of the blocks
/// preceding it.
pub struct ApplyBlockSums<D: Device> {
    device: D,
    partial_scan: D::Buffer,
    block_sums: D::Buffer,
    template: OperationTemplate,
    workgroup_length: u32,
    label: String,
    pipeline_cache: PipelineCache<D>,
    resources: ResourceTable<Field, D>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Field {
    PartialScan,
    BlockSums,
    Template,
    WorkgroupLength,
    Label,
    /// `N`
    PartialScanLength,
    /// `G`
    GroupSize,
    /// `N / G`
    DispatchSize,
    /// `N / G`
    BlockSumsLength,
    Pipeline,
    /// `[N]`
    PrefixScan,
    BindGroup,
}

impl Property for Field {
    const ALL: &'static [Self] = &[
        Field::PartialScan,
        Field::BlockSums,
        Field::Template,
        Field::WorkgroupLength,
        Field::Label,
        Field::PartialScanLength,
        Field::GroupSize,
        Field::DispatchSize,
        Field::BlockSumsLength,
        Field::Pipeline,
        Field::PrefixScan,
        Field::BindGroup,
    ];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }

    fn dependencies(self) -> &'static [Self] {
        match self {
            Field::PartialScan
            | Field::BlockSums
            | Field::Template
            | Field::WorkgroupLength
            | Field::Label => &[],
            Field::PartialScanLength => &[Field::PartialScan, Field::Template],
            Field::GroupSize => &[Field::WorkgroupLength],
            Field::DispatchSize => {
                &[Field::PartialScanLength, Field::GroupSize]
            },
            Field::BlockSumsLength => {
                &[Field::BlockSums, Field::Template, Field::DispatchSize]
            },
            Field::Pipeline => &[Field::GroupSize, Field::Template],
            Field::PrefixScan => &[Field::PartialScanLength, Field::Label],
            Field::BindGroup => &[
                Field::Pipeline,
                Field::PartialScan,
                Field::BlockSums,
                Field::BlockSumsLength,
                Field::PrefixScan,
                Field::Label,
            ],
        }
    }
}

impl<D: Device> ApplyBlockSumsConfig<D> {
    pub fn new(
        device: D,
        partial_scan: D::Buffer,
        block_sums: D::Buffer,
    ) -> Self {
        Self {
            device,
            partial_scan,
            block_sums,
            template: Default::default(),
            workgroup_length: 0,
            label: "apply block sums".into(),
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

impl<D: Device> From<ApplyBlockSumsConfig<D>> for ApplyBlockSums<D> {
    fn from(config: ApplyBlockSumsConfig<D>) -> Self {
        Self {
            resources: ResourceTable::new(config.device.to_owned()),
            device: config.device,
            partial_scan: config.partial_scan,
            block_sums: config.block_sums,
            template: config.template,
            workgroup_length: config.workgroup_length,
            label: config.label,
            pipeline_cache: config.pipeline_cache,
        }
    }
}

impl<D: Device> ApplyBlockSums<D> {
    #[inline]
    pub fn partial_scan(&self) -> &D::Buffer {
        &self.partial_scan
    }

    #[inline]
    pub fn block_sums(&self) -> &D::Buffer {
        &self.block_sums
    }

    #[inline]
    pub fn template(&self) -> &OperationTemplate {
        &self.template
    }

    pub fn set_partial_scan(
        &mut self,
        partial_scan: D::Buffer,
    ) {
        let id = self.device.buffer_id(&partial_scan);
        if id == self.device.buffer_id(&self.partial_scan) {
            return;
        }
        self.partial_scan = partial_scan;
        self.resources.invalidate(Field::PartialScan);
    }

    pub fn set_block_sums(
        &mut self,
        block_sums: D::Buffer,
    ) {
        let id = self.device.buffer_id(&block_sums);
        if id == self.device.buffer_id(&self.block_sums) {
            return;
        }
        self.block_sums = block_sums;
        self.resources.invalidate(Field::BlockSums);
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

    /// The element count of the partial scan, `N`.
    pub fn partial_scan_length(&mut self) -> Result<u32, Error> {
        if let Some(length) = self.resources.count(Field::PartialScanLength) {
            return Ok(length);
        }

        let name = format!("the partial scan of \"{}\"", self.label);
        let length = element_count(
            &self.device,
            &self.partial_scan,
            &self.template,
            &name,
        )?;
        if length == 0 {
            return Err(Error::Validation(
                format!("The length of {name}"),
                "positive".into(),
            ));
        }

        self.resources
            .insert(Field::PartialScanLength, Resource::Count(length));
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

        let length = self.partial_scan_length()?;
        let group_size = self.workgroup_length();
        let name = format!("\"{}\"", self.label);
        let size = dispatch_size(&self.device, length, group_size, &name)?;

        self.resources
            .insert(Field::DispatchSize, Resource::Count(size));
        Ok(size)
    }

    /// The element count of the block sums.
    ///
    /// It fails unless there is exactly one block sum per block.
    pub fn block_sums_length(&mut self) -> Result<u32, Error> {
        if let Some(length) = self.resources.count(Field::BlockSumsLength) {
            return Ok(length);
        }

        let name = format!("the block sums of \"{}\"", self.label);
        let length = element_count(
            &self.device,
            &self.block_sums,
            &self.template,
            &name,
        )?;
        let block_count = self.dispatch_size()?;
        if length != block_count {
            return Err(Error::Validation(
                format!("The length of {name} ({length})"),
                format!("the block count ({block_count})"),
            ));
        }

        self.resources
            .insert(Field::BlockSumsLength, Resource::Count(length));
        Ok(length)
    }

    pub fn pipeline(&mut self) -> Result<D::Pipeline, Error> {
        if let Some(pipeline) = self.resources.pipeline(Field::Pipeline) {
            return Ok(pipeline);
        }

        let key = PipelineKey {
            device: self.device.id(),
            workgroup_length: self.workgroup_length(),
            template: self.template,
            block_sums: false,
            kernel: KernelKind::ApplyBlockSums,
        };
        let pipeline = self.pipeline_cache.get(&self.device, &key)?;

        self.resources
            .insert(Field::Pipeline, Resource::Pipeline(pipeline.to_owned()));
        Ok(pipeline)
    }

    /// The complete scan, `[N]`.
    pub fn prefix_scan(&mut self) -> Result<D::Buffer, Error> {
        if let Some(buffer) = self.resources.buffer(Field::PrefixScan) {
            return Ok(buffer);
        }

        let size =
            self.partial_scan_length()? as u64 * self.template.element.size();
        self.resources.create_buffer(
            Field::PrefixScan,
            &format!("{} prefix scan", self.label),
            size,
        )
    }

    pub fn bind_group(&mut self) -> Result<D::BindGroup, Error> {
        if let Some(bind_group) = self.resources.bind_group(Field::BindGroup) {
            return Ok(bind_group);
        }

        self.block_sums_length()?;
        let pipeline = self.pipeline()?;
        let prefix_scan = self.prefix_scan()?;

        let bind_group = self.device.create_bind_group(
            &self.label,
            &pipeline,
            &[
                BindGroupEntry {
                    binding: 2,
                    buffer: &self.partial_scan,
                },
                BindGroupEntry {
                    binding: 3,
                    buffer: &self.block_sums,
                },
                BindGroupEntry {
                    binding: 4,
                    buffer: &prefix_scan,
                },
            ],
        )?;

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

impl<D: Device> ScanStage<D> for ApplyBlockSums<D> {
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

impl<D: Device> Drop for ApplyBlockSums<D> {
    fn drop(&mut self) {
        self.resources.destroy();
    }
}

impl<D: Device> fmt::Debug for ApplyBlockSums<D> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        f.debug_struct("ApplyBlockSums")
            .field("label", &self.label)
            .field("partial_scan", &self.partial_scan)
            .field("block_sums", &self.block_sums)
            .field("template", &self.template.name)
            .field("workgroup_length", &self.workgroup_length)
            .field("resources", &self.resources)
            .finish()
    }
}
