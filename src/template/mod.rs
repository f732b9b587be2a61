//! Associative operations substituted into the scan kernels.

use std::{fmt, hash};

/// The element type of scanned buffers.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ElementType {
    U32,
    I32,
    F32,
}

impl ElementType {
    /// The size of one element in bytes.
    #[inline]
    pub const fn size(&self) -> u64 {
        4
    }

    /// The type name in WGSL.
    #[inline]
    pub const fn wgsl(&self) -> &'static str {
        match self {
            ElementType::U32 => "u32",
            ElementType::I32 => "i32",
            ElementType::F32 => "f32",
        }
    }
}

/// An associative binary operation with an identity element.
///
/// `identity` and `combine` are WGSL expressions, where `combine` reads
/// the operands `a` and `b`. `host_identity` and `host_combine` are the same
/// operation on the raw element bits, used by the host executor.
///
/// Two templates are equal when their names, element types and WGSL
/// expressions are equal.
#[derive(Clone, Copy)]
pub struct OperationTemplate {
    pub name: &'static str,
    pub element: ElementType,
    pub identity: &'static str,
    pub combine: &'static str,
    pub host_identity: u32,
    pub host_combine: fn(u32, u32) -> u32,
}

impl OperationTemplate {
    /// Combining two elements on the host.
    #[inline]
    pub fn combine_host(
        &self,
        a: u32,
        b: u32,
    ) -> u32 {
        (self.host_combine)(a, b)
    }
}

impl Default for OperationTemplate {
    #[inline]
    fn default() -> Self {
        SUM_U32
    }
}

impl PartialEq for OperationTemplate {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.name == other.name
            && self.element == other.element
            && self.identity == other.identity
            && self.combine == other.combine
    }
}

impl Eq for OperationTemplate {}

impl hash::Hash for OperationTemplate {
    fn hash<H: hash::Hasher>(
        &self,
        state: &mut H,
    ) {
        self.name.hash(state);
        self.element.hash(state);
        self.identity.hash(state);
        self.combine.hash(state);
    }
}

impl fmt::Debug for OperationTemplate {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        f.debug_struct("OperationTemplate")
            .field("name", &self.name)
            .field("element", &self.element)
            .field("identity", &self.identity)
            .field("combine", &self.combine)
            .finish()
    }
}

/// `a + b` over `u32`, wrapping on overflow.
pub const SUM_U32: OperationTemplate = OperationTemplate {
    name: "sum_u32",
    element: ElementType::U32,
    identity: "0u",
    combine: "a + b",
    host_identity: 0,
    host_combine: |a, b| a.wrapping_add(b),
};

/// `a + b` over `i32`, wrapping on overflow.
pub const SUM_I32: OperationTemplate = OperationTemplate {
    name: "sum_i32",
    element: ElementType::I32,
    identity: "0i",
    combine: "a + b",
    host_identity: 0,
    host_combine: |a, b| (a as i32).wrapping_add(b as i32) as u32,
};

/// `a + b` over `f32`.
pub const SUM_F32: OperationTemplate = OperationTemplate {
    name: "sum_f32",
    element: ElementType::F32,
    identity: "0.0f",
    combine: "a + b",
    host_identity: 0,
    host_combine: |a, b| (f32::from_bits(a) + f32::from_bits(b)).to_bits(),
};

/// `max(a, b)` over `u32`.
pub const MAX_U32: OperationTemplate = OperationTemplate {
    name: "max_u32",
    element: ElementType::U32,
    identity: "0u",
    combine: "max(a, b)",
    host_identity: 0,
    host_combine: |a, b| a.max(b),
};

/// `min(a, b)` over `u32`.
pub const MIN_U32: OperationTemplate = OperationTemplate {
    name: "min_u32",
    element: ElementType::U32,
    identity: "0xffffffffu",
    combine: "min(a, b)",
    host_identity: u32::MAX,
    host_combine: |a, b| a.min(b),
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_structural() {
        let custom = OperationTemplate {
            host_combine: |a, b| b.wrapping_add(a),
            ..SUM_U32
        };

        assert_eq!(custom, SUM_U32);
        assert_ne!(SUM_U32, SUM_I32);
        assert_ne!(SUM_U32, MAX_U32);
    }

    #[test]
    fn identity_is_neutral_on_host() {
        let samples = [0, 1, 7, 1 << 20, u32::MAX - 1];

        for template in [SUM_U32, SUM_I32, MAX_U32, MIN_U32] {
            for sample in samples {
                assert_eq!(
                    template.combine_host(template.host_identity, sample),
                    sample,
                    "template: {}",
                    template.name,
                );
            }
        }

        let value = 2.5_f32.to_bits();
        assert_eq!(SUM_F32.combine_host(SUM_F32.host_identity, value), value);
    }
}
