pub use crate::{
    backend::{BufferId, BufferUsages, Device},
    error::Error,
};

use humansize::{format_size, BINARY};
use std::{collections::BTreeMap, fmt};

/// Buffers created and owned by one component.
///
/// Each buffer is destroyed exactly once, either when it is released or
/// when the owner finishes.
pub struct OwnedBuffers<D: Device> {
    device: D,
    buffers: BTreeMap<BufferId, D::Buffer>,
}

impl<D: Device> OwnedBuffers<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            buffers: Default::default(),
        }
    }

    /// Creating a storage buffer owned by this context.
    pub fn create(
        &mut self,
        label: &str,
        size: u64,
    ) -> Result<D::Buffer, Error> {
        let buffer = self.device.create_buffer(
            label,
            size,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
        )?;
        let id = self.device.buffer_id(&buffer);

        log::debug!(
            target: "gausplat::scan::buffer",
            "create {id:?} \"{label}\" ({})",
            format_size(size, BINARY),
        );

        self.buffers.insert(id, buffer.to_owned());
        Ok(buffer)
    }

    /// Destroying the buffer if it is owned by this context.
    ///
    /// It returns `true` if the buffer was destroyed.
    pub fn release(
        &mut self,
        buffer: &D::Buffer,
    ) -> bool {
        let id = self.device.buffer_id(buffer);
        match self.buffers.remove(&id) {
            Some(buffer) => {
                self.destroy(id, &buffer);
                true
            },
            None => false,
        }
    }

    #[inline]
    pub fn is_owned(
        &self,
        buffer: &D::Buffer,
    ) -> bool {
        self.buffers.contains_key(&self.device.buffer_id(buffer))
    }

    /// Destroying every owned buffer.
    pub fn finish(&mut self) {
        for (id, buffer) in std::mem::take(&mut self.buffers) {
            self.destroy(id, &buffer);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn destroy(
        &self,
        id: BufferId,
        buffer: &D::Buffer,
    ) {
        log::debug!(
            target: "gausplat::scan::buffer",
            "destroy {id:?} ({})",
            format_size(self.device.buffer_size(buffer), BINARY),
        );

        self.device.destroy_buffer(buffer);
    }
}

impl<D: Device> fmt::Debug for OwnedBuffers<D> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        f.debug_struct("OwnedBuffers")
            .field("buffers", &self.buffers.keys())
            .finish()
    }
}
