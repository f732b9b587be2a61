//! WGSL kernels.

pub mod apply_block_sums;
pub mod workgroup_scan;

pub use crate::{
    backend::LayoutEntry, error::Error, template::OperationTemplate,
};

/// The entry point of every kernel.
pub const ENTRY_POINT: &str = "main";

/// The kernels a scan is built from.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum KernelKind {
    WorkgroupScan,
    ApplyBlockSums,
}

impl KernelKind {
    /// Rendering the complete kernel source.
    pub fn source(
        &self,
        template: &OperationTemplate,
        workgroup_length: u32,
        block_sums: bool,
    ) -> Result<String, Error> {
        match self {
            KernelKind::WorkgroupScan => {
                workgroup_scan::source(template, workgroup_length, block_sums)
            },
            KernelKind::ApplyBlockSums => {
                apply_block_sums::source(template, workgroup_length)
            },
        }
    }

    /// The storage bindings of the kernel.
    pub fn layout(
        &self,
        block_sums: bool,
    ) -> &'static [LayoutEntry] {
        match self {
            KernelKind::WorkgroupScan if block_sums => {
                workgroup_scan::LAYOUT_BLOCK_SUMS
            },
            KernelKind::WorkgroupScan => workgroup_scan::LAYOUT,
            KernelKind::ApplyBlockSums => apply_block_sums::LAYOUT,
        }
    }
}

/// Source text with `{{ name }}` placeholders.
#[derive(Clone, Debug)]
pub struct SourceTemplate {
    source: String,
    substitutions: Vec<(String, String)>,
}

impl SourceTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            substitutions: vec![],
        }
    }

    /// Registering the value substituted for `{{ name }}`.
    pub fn register(
        mut self,
        name: impl Into<String>,
        value: impl ToString,
    ) -> Self {
        self.substitutions.push((name.into(), value.to_string()));
        self
    }

    /// Substituting every registered placeholder.
    ///
    /// It fails if any placeholder is left unresolved.
    pub fn complete(&self) -> Result<String, Error> {
        let source = self.substitutions.iter().fold(
            self.source.to_owned(),
            |source, (name, value)| {
                source.replace(&format!("{{{{ {name} }}}}"), value)
            },
        );

        if let Some(start) = source.find("{{") {
            let end = source[start..]
                .find("}}")
                .map(|end| start + end + 2)
                .unwrap_or(source.len());
            return Err(Error::Compilation(format!(
                "Unresolved placeholder {}",
                &source[start..end]
            )));
        }

        Ok(source)
    }
}

/// A kernel with its source template.
pub trait KernelSource {
    fn source(&self) -> SourceTemplate;
}

macro_rules! impl_kernel_source {
    ($kernel: ident, $source_path: expr) => {
        #[derive(Clone, Copy, Debug, Default)]
        pub struct $kernel;

        impl KernelSource for $kernel {
            fn source(&self) -> SourceTemplate {
                SourceTemplate::new(include_str!($source_path))
            }
        }
    };
}

pub(crate) use impl_kernel_source;
