//! Generation context: stage templates, reference resources and the assembler.

pub mod assembler;
pub mod resources;
pub mod templates;

pub use assembler::{AssembledContext, AssemblerConfig, AssemblyInput, ContextAssembler, ManifestItem};
pub use resources::{DbResourceLibrary, ResourceDoc, ResourceLibrary};
pub use templates::{StageTemplate, StageTemplates};
