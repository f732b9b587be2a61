//! Compiled pipelines shared across scans.

pub use crate::{
    backend::{Device, DeviceId, PipelineDescriptor},
    error::Error,
    kernel::{KernelKind, ENTRY_POINT},
    template::OperationTemplate,
};

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

/// The structural identity of a compiled pipeline.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PipelineKey {
    pub device: DeviceId,
    pub workgroup_length: u32,
    pub template: OperationTemplate,
    pub block_sums: bool,
    pub kernel: KernelKind,
}

/// A memo of compiled pipelines.
///
/// Cloning the cache yields another handle to the same entries.
/// Entries are never evicted except by [`PipelineCache::clear`].
pub struct PipelineCache<D: Device> {
    entries: Arc<Mutex<HashMap<PipelineKey, D::Pipeline>>>,
}

impl<D: Device> PipelineCache<D> {
    /// Getting the pipeline for the key, compiling it on a miss.
    ///
    /// Compilation errors are returned as is and nothing is cached for them.
    pub fn get(
        &self,
        device: &D,
        key: &PipelineKey,
    ) -> Result<D::Pipeline, Error> {
        if let Some(pipeline) = self.lock().get(key) {
            #[cfg(debug_assertions)]
            log::debug!(
                target: "gausplat::scan::cache",
                "hit {:?} ({}, {})",
                key.kernel,
                key.template.name,
                key.workgroup_length,
            );

            return Ok(pipeline.to_owned());
        }

        // Compiling outside of the lock

        let source = key.kernel.source(
            &key.template,
            key.workgroup_length,
            key.block_sums,
        )?;
        let label = format!(
            "{:?} {} x{}",
            key.kernel, key.template.name, key.workgroup_length
        );
        let pipeline = device.create_compute_pipeline(&PipelineDescriptor {
            label: &label,
            source: &source,
            entry_point: ENTRY_POINT,
            layout: key.kernel.layout(key.block_sums),
            key,
        })?;

        log::debug!(
            target: "gausplat::scan::cache",
            "compile {label} (block_sums: {})",
            key.block_sums,
        );

        Ok(self.lock().entry(*key).or_insert(pipeline).to_owned())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PipelineKey, D::Pipeline>> {
        // Entries are inserted whole, so a poisoned map is still consistent
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<D: Device> Clone for PipelineCache<D> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.to_owned(),
        }
    }
}

impl<D: Device> Default for PipelineCache<D> {
    #[inline]
    fn default() -> Self {
        Self {
            entries: Default::default(),
        }
    }
}

impl<D: Device> fmt::Debug for PipelineCache<D> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        f.debug_struct("PipelineCache")
            .field("len()", &self.len())
            .finish()
    }
}
