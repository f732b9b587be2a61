pub use super::*;

/// `[partial_scan, block_sums, prefix_scan]`
pub const LAYOUT: &[LayoutEntry] = &[
    LayoutEntry {
        binding: 2,
        read_only: true,
    },
    LayoutEntry {
        binding: 3,
        read_only: true,
    },
    LayoutEntry {
        binding: 4,
        read_only: false,
    },
];

impl_kernel_source!(Kernel, "kernel.wgsl");

/// Rendering the kernel combining each block with its preceding offset.
pub fn source(
    template: &OperationTemplate,
    workgroup_length: u32,
) -> Result<String, Error> {
    Kernel
        .source()
        .register("element", template.element.wgsl())
        .register("combine", template.combine)
        .register("workgroup_size_x", workgroup_length)
        .complete()
}
