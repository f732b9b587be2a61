pub use super::*;
pub use crate::{backend::Device, error::Error};

use std::fmt;

/// A derived resource of one component.
#[derive(Clone, Debug)]
pub enum Resource<D: Device> {
    Buffer(D::Buffer),
    Pipeline(D::Pipeline),
    BindGroup(D::BindGroup),
    Count(u32),
}

/// The derived resources of one component, keyed by property.
///
/// Buffers created through the table are owned by it. They are destroyed
/// as soon as the properties holding them are invalidated.
pub struct ResourceTable<P: Property, D: Device> {
    cells: Cells<P, Resource<D>>,
    buffers: OwnedBuffers<D>,
}

impl<P: Property, D: Device> ResourceTable<P, D> {
    pub fn new(device: D) -> Self {
        Self {
            cells: Cells::new(),
            buffers: OwnedBuffers::new(device),
        }
    }

    #[inline]
    pub fn is_fresh(
        &self,
        property: P,
    ) -> bool {
        self.cells.get(property).is_some()
    }

    pub fn count(
        &self,
        property: P,
    ) -> Option<u32> {
        match self.cells.get(property) {
            Some(Resource::Count(count)) => Some(*count),
            _ => None,
        }
    }

    pub fn buffer(
        &self,
        property: P,
    ) -> Option<D::Buffer> {
        match self.cells.get(property) {
            Some(Resource::Buffer(buffer)) => Some(buffer.to_owned()),
            _ => None,
        }
    }

    pub fn pipeline(
        &self,
        property: P,
    ) -> Option<D::Pipeline> {
        match self.cells.get(property) {
            Some(Resource::Pipeline(pipeline)) => Some(pipeline.to_owned()),
            _ => None,
        }
    }

    pub fn bind_group(
        &self,
        property: P,
    ) -> Option<D::BindGroup> {
        match self.cells.get(property) {
            Some(Resource::BindGroup(bind_group)) => Some(bind_group.to_owned()),
            _ => None,
        }
    }

    /// Caching the fresh resource of the property.
    pub fn insert(
        &mut self,
        property: P,
        resource: Resource<D>,
    ) {
        if let Some(stale) = self.cells.set(property, resource) {
            self.release(stale);
        }
    }

    /// Creating a storage buffer owned by the table as the property.
    pub fn create_buffer(
        &mut self,
        property: P,
        label: &str,
        size: u64,
    ) -> Result<D::Buffer, Error> {
        let buffer = self.buffers.create(label, size)?;
        self.insert(property, Resource::Buffer(buffer.to_owned()));
        Ok(buffer)
    }

    /// Invalidating the dependents of the input and releasing them.
    ///
    /// It returns the count of evicted resources.
    pub fn invalidate(
        &mut self,
        input: P,
    ) -> usize {
        let evicted = self.cells.invalidate(input);
        let count = evicted.len();

        #[cfg(debug_assertions)]
        log::debug!(
            target: "gausplat::scan::reactive",
            "invalidate {input:?} ({count} evicted)",
        );

        evicted.into_iter().for_each(|stale| self.release(stale));
        count
    }

    /// Releasing every resource.
    pub fn destroy(&mut self) {
        for stale in self.cells.clear() {
            self.release(stale);
        }
        self.buffers.finish();
    }

    /// The count of live buffers owned by the table.
    #[inline]
    pub fn owned_buffers(&self) -> usize {
        self.buffers.len()
    }

    fn release(
        &mut self,
        resource: Resource<D>,
    ) {
        if let Resource::Buffer(buffer) = resource {
            self.buffers.release(&buffer);
        }
    }
}

impl<P: Property, D: Device> fmt::Debug for ResourceTable<P, D> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        f.debug_struct("ResourceTable")
            .field("cells", &self.cells)
            .field("buffers", &self.buffers)
            .finish()
    }
}
