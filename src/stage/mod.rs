//! Single-dispatch scan stages and their composition.

pub mod apply_block_sums;
pub mod workgroup_scan;

pub use crate::{
    backend::{BindGroupEntry, ComputePass, Device},
    cache::{PipelineCache, PipelineKey},
    error::Error,
    kernel::KernelKind,
    reactive::{Property, Resource, ResourceTable},
    template::OperationTemplate,
};
pub use apply_block_sums::{ApplyBlockSums, ApplyBlockSumsConfig};
pub use workgroup_scan::{WorkgroupScan, WorkgroupScanConfig};

use std::fmt;

/// A component recording GPU commands into a shared encoder.
pub trait ScanStage<D: Device> {
    fn label(&self) -> &str;

    /// Recording the dispatches of the stage.
    ///
    /// It returns the count of recorded dispatches.
    fn encode(
        &mut self,
        encoder: &mut D::Encoder,
    ) -> Result<u32, Error>;

    /// Releasing every buffer owned by the stage.
    fn destroy(&mut self);
}

/// Stages recorded into one submission in the given order.
///
/// The group never reorders the stages, so producers should be added
/// before their consumers.
pub struct StageGroup<'a, D: Device> {
    device: D,
    label: String,
    stages: Vec<&'a mut dyn ScanStage<D>>,
}

impl<'a, D: Device> StageGroup<'a, D> {
    pub fn new(
        device: D,
        label: impl Into<String>,
    ) -> Self {
        Self {
            device,
            label: label.into(),
            stages: vec![],
        }
    }

    pub fn with_stage(
        mut self,
        stage: &'a mut dyn ScanStage<D>,
    ) -> Self {
        self.push(stage);
        self
    }

    pub fn push(
        &mut self,
        stage: &'a mut dyn ScanStage<D>,
    ) {
        self.stages.push(stage);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Encoding every stage and submitting them at once.
    ///
    /// It returns the count of submitted dispatches. Nothing is submitted
    /// if any stage fails to encode.
    pub fn dispatch(&mut self) -> Result<u32, Error> {
        let mut encoder = self.device.create_encoder(&self.label);
        let count = self.encode(&mut encoder)?;

        log::debug!(
            target: "gausplat::scan::stage",
            "submit \"{}\" ({} stages, {count} dispatches)",
            self.label,
            self.stages.len(),
        );

        self.device.submit(encoder);
        Ok(count)
    }
}

impl<D: Device> ScanStage<D> for StageGroup<'_, D> {
    #[inline]
    fn label(&self) -> &str {
        &self.label
    }

    fn encode(
        &mut self,
        encoder: &mut D::Encoder,
    ) -> Result<u32, Error> {
        self.stages.iter_mut().try_fold(0, |count, stage| {
            Ok(count + stage.encode(encoder)?)
        })
    }

    /// Destroying every stage in order.
    fn destroy(&mut self) {
        for stage in self.stages.iter_mut() {
            stage.destroy();
        }
    }
}

impl<D: Device> fmt::Debug for StageGroup<'_, D> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        f.debug_struct("StageGroup")
            .field("label", &self.label)
            .field(
                "stages",
                &self
                    .stages
                    .iter()
                    .map(|stage| stage.label())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Resolving the requested workgroup length against the device.
///
/// Zero requests the device maximum. Larger requests are clamped to it.
pub fn resolve_workgroup_length<D: Device>(
    device: &D,
    requested: u32,
) -> u32 {
    let max = device.max_workgroup_length();
    if requested == 0 {
        return max;
    }
    if requested > max {
        log::debug!(
            target: "gausplat::scan::stage",
            "clamp workgroup length {requested} to {max}",
        );
        return max;
    }
    requested
}

/// The count of `template` elements held by the buffer.
pub fn element_count<D: Device>(
    device: &D,
    buffer: &D::Buffer,
    template: &OperationTemplate,
    name: &str,
) -> Result<u32, Error> {
    let size = device.buffer_size(buffer);
    let element_size = template.element.size();

    if size % element_size != 0 {
        return Err(Error::Validation(
            format!("The size of {name} ({size} bytes)"),
            format!("a multiple of {element_size}"),
        ));
    }

    u32::try_from(size / element_size).map_err(|_| {
        Error::Validation(
            format!("The length of {name} ({})", size / element_size),
            format!("at most {}", u32::MAX),
        )
    })
}

/// The count of workgroups covering `length` elements.
pub fn dispatch_size<D: Device>(
    device: &D,
    length: u32,
    workgroup_length: u32,
    name: &str,
) -> Result<u32, Error> {
    let count = length.div_ceil(workgroup_length);
    let max = device.max_workgroup_count();

    if count > max {
        return Err(Error::Validation(
            format!("The dispatch size of {name} ({count})"),
            format!("at most {max}"),
        ));
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{BufferUsages, HostBuffer, HostDevice, HostLimits},
        template::{SUM_F32, SUM_U32},
    };
    use bytemuck::{cast_slice, pod_collect_to_vec};

    fn upload(
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
    fn dispatch_records_stages_in_order() {
        let device = HostDevice::default();
        let source = upload(&device, &[0, 1, 2, 3, 4, 5, 6]);

        let mut scan = WorkgroupScan::from(
            WorkgroupScanConfig::new(device.to_owned(), source)
                .with_workgroup_length(4),
        );
        let partial_scan = scan.prefix_scan().unwrap();
        let block_sums = upload(&device, &[6, 21]);
        let mut apply = ApplyBlockSums::from(
            ApplyBlockSumsConfig::new(
                device.to_owned(),
                partial_scan,
                block_sums,
            )
            .with_workgroup_length(4),
        );
        let prefix_scan = apply.prefix_scan().unwrap();

        let mut group = StageGroup::new(device.to_owned(), "group")
            .with_stage(&mut scan)
            .with_stage(&mut apply);
        assert_eq!(group.len(), 2);
        assert_eq!(group.dispatch().unwrap(), 2);

        assert_eq!(device.submissions(), 1);
        assert_eq!(device.dispatches(), 2);
        assert_eq!(read(&device, &prefix_scan), [0, 1, 3, 6, 10, 15, 21]);

        group.destroy();
        assert_eq!(device.live_buffers(), 2);
    }

    #[test]
    fn dispatch_submits_nothing_on_failure() {
        let device = HostDevice::default();
        let source = device
            .create_buffer("odd", 6, BufferUsages::STORAGE)
            .unwrap();
        let mut scan = WorkgroupScan::from(WorkgroupScanConfig::new(
            device.to_owned(),
            source,
        ));

        let mut group =
            StageGroup::new(device.to_owned(), "group").with_stage(&mut scan);
        let error = group.dispatch().unwrap_err();

        assert!(matches!(error, Error::Validation(..)), "error: {error}");
        assert_eq!(device.submissions(), 0);
    }

    #[test]
    fn resolve_workgroup_length_clamps_to_device() {
        let device = HostDevice::new(HostLimits {
            max_workgroup_length: 64,
            ..Default::default()
        });

        assert_eq!(resolve_workgroup_length(&device, 0), 64);
        assert_eq!(resolve_workgroup_length(&device, 16), 16);
        assert_eq!(resolve_workgroup_length(&device, 64), 64);
        assert_eq!(resolve_workgroup_length(&device, 1024), 64);
    }

    #[test]
    fn element_count_checks_size() {
        let device = HostDevice::default();
        let aligned = upload(&device, &[1, 2, 3]);
        let odd = device
            .create_buffer("odd", 10, BufferUsages::STORAGE)
            .unwrap();

        for template in [SUM_U32, SUM_F32] {
            assert_eq!(
                element_count(&device, &aligned, &template, "aligned").unwrap(),
                3
            );
        }
        assert!(matches!(
            element_count(&device, &odd, &SUM_U32, "odd"),
            Err(Error::Validation(..))
        ));
    }

    #[test]
    fn dispatch_size_checks_device_limit() {
        let device = HostDevice::new(HostLimits {
            max_workgroup_count: 2,
            ..Default::default()
        });

        assert_eq!(dispatch_size(&device, 1, 4, "test").unwrap(), 1);
        assert_eq!(dispatch_size(&device, 8, 4, "test").unwrap(), 2);
        assert!(matches!(
            dispatch_size(&device, 9, 4, "test"),
            Err(Error::Validation(..))
        ));
    }
}
