//! The prefix scan of arbitrary length.
//!
//! The source is scanned blockwise at level 0. The block sums of each level
//! are scanned blockwise again at the next level, until a level fits in one
//! block. The complete scans are then formed bottom-up, each level combining
//! its blockwise scan with the complete scan of its block sums.

pub use crate::{
    backend::Device,
    cache::PipelineCache,
    error::Error,
    reactive::{Graph, OwnedBuffers, Property},
    stage::{
        element_count, resolve_workgroup_length, ApplyBlockSums,
        ApplyBlockSumsConfig, ScanStage, WorkgroupScan, WorkgroupScanConfig,
    },
    template::OperationTemplate,
};

use std::fmt;

/// The options of a [`PrefixScan`].
#[derive(Clone, Debug)]
pub struct PrefixScanConfig<D: Device> {
    pub device: D,
    /// `[N]`
    pub source: D::Buffer,
    pub template: OperationTemplate,
    /// The requested workgroup length `G`, where `0` is the device maximum.
    pub workgroup_length: u32,
    pub label: String,
    /// It is shared by every stage of the scan.
    pub pipeline_cache: PipelineCache<D>,
}

/// The inclusive prefix scan of a buffer under an associative operation.
pub struct PrefixScan<D: Device> {
    device: D,
    source: D::Buffer,
    template: OperationTemplate,
    workgroup_length: u32,
    label: String,
    pipeline_cache: PipelineCache<D>,
    graph: Graph<Field>,
    /// The levels ordered from the source to the last block sums.
    levels: Vec<ScanLevel<D>>,
    buffers: OwnedBuffers<D>,
    /// The output of an empty source.
    empty: Option<D::Buffer>,
}

/// One level of a [`PrefixScan`].
///
/// It is read-only outside the scan, since the stages of every level are
/// bound to the buffers of the neighboring levels.
pub struct ScanLevel<D: Device> {
    scan: WorkgroupScan<D>,
    /// It is absent if the level fits in one block.
    apply: Option<ApplyBlockSums<D>>,
    /// The index of the level whose block sums are scanned here.
    parent: Option<usize>,
    /// The index of the level scanning the block sums of here.
    child: Option<usize>,
    /// N'
    length: u32,
    /// `[N']`
    partial_scan: D::Buffer,
    /// `[N' / G]`
    block_sums: Option<D::Buffer>,
    /// `[N']`
    output: D::Buffer,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Field {
    Source,
    Template,
    WorkgroupLength,
    Label,
    Levels,
}

impl Property for Field {
    const ALL: &'static [Self] = &[
        Field::Source,
        Field::Template,
        Field::WorkgroupLength,
        Field::Label,
        Field::Levels,
    ];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }

    fn dependencies(self) -> &'static [Self] {
        match self {
            Field::Levels => &[
                Field::Source,
                Field::Template,
                Field::WorkgroupLength,
                Field::Label,
            ],
            _ => &[],
        }
    }
}

impl<D: Device> PrefixScanConfig<D> {
    pub fn new(
        device: D,
        source: D::Buffer,
    ) -> Self {
        Self {
            device,
            source,
            template: Default::default(),
            workgroup_length: 0,
            label: "prefix scan".into(),
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

impl<D: Device> From<PrefixScanConfig<D>> for PrefixScan<D> {
    fn from(config: PrefixScanConfig<D>) -> Self {
        Self {
            buffers: OwnedBuffers::new(config.device.to_owned()),
            device: config.device,
            source: config.source,
            template: config.template,
            workgroup_length: config.workgroup_length,
            label: config.label,
            pipeline_cache: config.pipeline_cache,
            graph: Graph::new(),
            levels: vec![],
            empty: None,
        }
    }
}

impl<D: Device> PrefixScan<D> {
    #[inline]
    pub fn source(&self) -> &D::Buffer {
        &self.source
    }

    #[inline]
    pub fn template(&self) -> &OperationTemplate {
        &self.template
    }

    #[inline]
    pub fn pipeline_cache(&self) -> &PipelineCache<D> {
        &self.pipeline_cache
    }

    /// The effective workgroup length, `G`.
    #[inline]
    pub fn workgroup_length(&self) -> u32 {
        resolve_workgroup_length(&self.device, self.workgroup_length)
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
        self.invalidate(Field::Source);
    }

    pub fn set_template(
        &mut self,
        template: OperationTemplate,
    ) {
        if template == self.template {
            return;
        }
        self.template = template;
        self.invalidate(Field::Template);
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
        self.invalidate(Field::WorkgroupLength);
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
        self.invalidate(Field::Label);
    }

    /// The complete scan of the source, `[N]`.
    pub fn prefix_scan(&mut self) -> Result<D::Buffer, Error> {
        self.build()?;

        if let Some(empty) = &self.empty {
            return Ok(empty.to_owned());
        }
        match self.levels.first() {
            Some(level) => Ok(level.output.to_owned()),
            None => Err(Error::Validation(
                format!("The levels of \"{}\"", self.label),
                "built".into(),
            )),
        }
    }

    /// Every level, ordered from the source to the last block sums.
    ///
    /// It is empty if the source is empty.
    pub fn levels(&mut self) -> Result<&[ScanLevel<D>], Error> {
        self.build()?;
        Ok(&self.levels)
    }

    pub fn level(
        &mut self,
        index: usize,
    ) -> Result<&ScanLevel<D>, Error> {
        let count = self.levels()?.len();
        self.levels.get(index).ok_or_else(|| {
            Error::Validation(
                format!("The level index {index}"),
                format!("less than {count}"),
            )
        })
    }

    /// The count of levels scanning block sums.
    pub fn block_sum_depth(&mut self) -> Result<usize, Error> {
        Ok(self.levels()?.len().saturating_sub(1))
    }

    /// The level 0, scanning the source blockwise.
    pub fn source_scan(&mut self) -> Result<Option<&ScanLevel<D>>, Error> {
        Ok(self.levels()?.first())
    }

    /// The levels scanning the block sums, ordered by level.
    pub fn block_scans(&mut self) -> Result<&[ScanLevel<D>], Error> {
        Ok(self.levels()?.get(1..).unwrap_or(&[]))
    }

    /// Building the levels if any input has changed.
    fn build(&mut self) -> Result<(), Error> {
        if !self.graph.is_dirty(Field::Levels) {
            return Ok(());
        }
        self.release();

        // Specifying the parameters

        let name = format!("the source of \"{}\"", self.label);
        // N
        let length =
            element_count(&self.device, &self.source, &self.template, &name)?;
        // G
        let group_size = self.workgroup_length();

        if group_size < 2 && length > 1 {
            return Err(Error::Validation(
                format!(
                    "The workgroup length of \"{}\" ({group_size})",
                    self.label,
                ),
                format!("at least 2 to scan {length} elements"),
            ));
        }

        if length == 0 {
            self.empty = Some(
                self.buffers
                    .create(&format!("{} prefix scan", self.label), 0)?,
            );
            self.graph.mark_clean(Field::Levels);
            return Ok(());
        }

        // Scanning the blocks level by level

        let mut levels = Vec::<ScanLevel<D>>::new();
        let mut source = self.source.to_owned();
        // N'
        let mut count = length;
        loop {
            let index = levels.len();
            // N' / G
            let block_count = count.div_ceil(group_size);
            let mut scan = WorkgroupScan::from(
                WorkgroupScanConfig::new(self.device.to_owned(), source)
                    .with_template(self.template)
                    .with_workgroup_length(group_size)
                    .with_emit_block_sums(block_count > 1)
                    .with_label(format!("{} level {index}", self.label))
                    .with_pipeline_cache(self.pipeline_cache.to_owned()),
            );
            scan.dispatch_size()?;

            let partial_scan = scan.prefix_scan()?;
            let block_sums = match block_count > 1 {
                true => Some(scan.block_sums()?),
                false => None,
            };

            if let Some(parent) = index.checked_sub(1) {
                levels[parent].child = Some(index);
            }
            levels.push(ScanLevel {
                scan,
                apply: None,
                parent: index.checked_sub(1),
                child: None,
                length: count,
                output: partial_scan.to_owned(),
                partial_scan,
                block_sums: block_sums.to_owned(),
            });

            match block_sums {
                Some(block_sums) => {
                    source = block_sums;
                    count = block_count;
                },
                None => break,
            }
        }

        // Combining the block sums bottom-up

        for index in (0..levels.len()).rev() {
            let Some(child) = levels[index].child else {
                continue;
            };
            let block_sums = levels[child].output.to_owned();
            let partial_scan = levels[index].partial_scan.to_owned();
            let mut apply = ApplyBlockSums::from(
                ApplyBlockSumsConfig::new(
                    self.device.to_owned(),
                    partial_scan,
                    block_sums,
                )
                .with_template(self.template)
                .with_workgroup_length(group_size)
                .with_label(format!("{} level {index}", self.label))
                .with_pipeline_cache(self.pipeline_cache.to_owned()),
            );
            levels[index].output = apply.prefix_scan()?;
            levels[index].apply = Some(apply);
        }

        log::debug!(
            target: "gausplat::scan::scan",
            "build \"{}\" ({length} elements, {} levels, {group_size} x {})",
            self.label,
            levels.len(),
            self.template.name,
        );

        self.levels = levels;
        self.graph.mark_clean(Field::Levels);
        Ok(())
    }

    fn invalidate(
        &mut self,
        input: Field,
    ) {
        if !self.graph.invalidate(input).is_empty() {
            self.release();
        }
    }

    /// Releasing every level and the empty output.
    fn release(&mut self) {
        for mut level in self.levels.drain(..) {
            level.destroy();
        }
        self.empty = None;
        self.buffers.finish();
    }
}

impl<D: Device> ScanStage<D> for PrefixScan<D> {
    #[inline]
    fn label(&self) -> &str {
        &self.label
    }

    /// Recording the blockwise scans from the source, and then the
    /// combinations from the last block sums.
    fn encode(
        &mut self,
        encoder: &mut D::Encoder,
    ) -> Result<u32, Error> {
        self.build()?;

        let mut count = 0;
        for level in self.levels.iter_mut() {
            count += level.scan.encode(encoder)?;
        }
        for level in self.levels.iter_mut().rev() {
            if let Some(apply) = level.apply.as_mut() {
                count += apply.encode(encoder)?;
            }
        }

        Ok(count)
    }

    fn destroy(&mut self) {
        self.release();
        self.graph.invalidate_all();
    }
}

impl<D: Device> Drop for PrefixScan<D> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<D: Device> fmt::Debug for PrefixScan<D> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        f.debug_struct("PrefixScan")
            .field("label", &self.label)
            .field("source", &self.source)
            .field("template", &self.template.name)
            .field("workgroup_length", &self.workgroup_length)
            .field("levels", &self.levels)
            .finish()
    }
}

impl<D: Device> ScanLevel<D> {
    #[inline]
    pub fn scan(&self) -> &WorkgroupScan<D> {
        &self.scan
    }

    #[inline]
    pub fn apply(&self) -> Option<&ApplyBlockSums<D>> {
        self.apply.as_ref()
    }

    #[inline]
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    #[inline]
    pub fn child(&self) -> Option<usize> {
        self.child
    }

    /// The count of elements scanned at the level.
    #[inline]
    pub fn length(&self) -> u32 {
        self.length
    }

    /// The blockwise scan of the level.
    #[inline]
    pub fn partial_scan(&self) -> &D::Buffer {
        &self.partial_scan
    }

    /// It is absent if the level fits in one block.
    #[inline]
    pub fn block_sums(&self) -> Option<&D::Buffer> {
        self.block_sums.as_ref()
    }

    /// The complete scan of the level.
    #[inline]
    pub fn output(&self) -> &D::Buffer {
        &self.output
    }

    fn destroy(&mut self) {
        if let Some(apply) = self.apply.as_mut() {
            apply.destroy();
        }
        self.scan.destroy();
    }
}

impl<D: Device> fmt::Debug for ScanLevel<D> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        f.debug_struct("ScanLevel")
            .field("scan", &self.scan)
            .field("apply", &self.apply)
            .field("parent", &self.parent)
            .field("child", &self.child)
            .field("length", &self.length)
            .finish()
    }
}
