pub use super::*;

/// `[source, prefix_scan]`
pub const LAYOUT: &[LayoutEntry] = &[
    LayoutEntry {
        binding: 1,
        read_only: true,
    },
    LayoutEntry {
        binding: 2,
        read_only: false,
    },
];

/// `[source, prefix_scan, block_sums]`
pub const LAYOUT_BLOCK_SUMS: &[LayoutEntry] = &[
    LayoutEntry {
        binding: 1,
        read_only: true,
    },
    LayoutEntry {
        binding: 2,
        read_only: false,
    },
    LayoutEntry {
        binding: 3,
        read_only: false,
    },
];

const BLOCK_SUMS_DECLARATION: &str = "@group(0) @binding(3)
var<storage, read_write> block_sums: array<{{ element }}>;";

// The last valid lane of the block holds the block total.
const BLOCK_SUMS_STORE: &str = "let block_end =
        min(count, (group_id.x + 1u) * GROUP_SIZE) - 1u;
    if index == block_end {
        block_sums[group_id.x] = value;
    }";

impl_kernel_source!(Kernel, "kernel.wgsl");

/// Rendering the kernel scanning each workgroup-sized block inclusively.
pub fn source(
    template: &OperationTemplate,
    workgroup_length: u32,
    block_sums: bool,
) -> Result<String, Error> {
    let (declaration, store) = if block_sums {
        (BLOCK_SUMS_DECLARATION, BLOCK_SUMS_STORE)
    } else {
        ("", "")
    };

    // The snippets are registered first since they hold placeholders too
    Kernel
        .source()
        .register("block_sums_declaration", declaration)
        .register("block_sums_store", store)
        .register("element", template.element.wgsl())
        .register("identity", template.identity)
        .register("combine", template.combine)
        .register("workgroup_size_x", workgroup_length)
        .complete()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{MAX_U32, SUM_F32};

    #[test]
    fn source_with_block_sums() {
        let source = source(&MAX_U32, 64, true).unwrap();

        assert!(source.contains("const GROUP_SIZE: u32 = 64u;"));
        assert!(source.contains("return max(a, b);"));
        assert!(source.contains("var<storage, read_write> block_sums"));
        assert!(source.contains("block_sums[group_id.x] = value;"));
        assert!(!source.contains("{{"));
    }

    #[test]
    fn source_without_block_sums() {
        let source = source(&SUM_F32, 256, false).unwrap();

        assert!(source.contains("array<f32>"));
        assert!(source.contains("return 0.0f;"));
        assert!(!source.contains("block_sums"));
    }
}
