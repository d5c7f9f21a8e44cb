//! GLSL compiler backend built on [`naga`], hidden behind feature `naga`.
//!
//! Sources are parsed by naga's GLSL frontend, validated and written out as
//! SPIR-V for the requested entry point. Reflection parses the SPIR-V back, so
//! it works for any module, not only the ones compiled here.

use naga::{
    back::spv,
    front::{glsl, spv as spv_in},
    valid::{Capabilities, ValidationFlags, Validator},
    AddressSpace, ImageClass, ShaderStage, TypeInner,
};

use crate::{
    backend::{
        BindingKind, CompilerBackend, ConstantBuffer, Diagnostic, ReflectionInfo, ResourceBinding,
    },
    key::Stage,
};

/// Compiles GLSL with [`naga`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct NagaBackend {
    /// Capabilities modules are validated against.
    pub capabilities: Capabilities,
}

impl Default for NagaBackend {
    #[inline]
    fn default() -> Self {
        Self {
            capabilities: Capabilities::all(),
        }
    }
}

impl NagaBackend {
    /// Creates a backend validating against every capability.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates a parsed module.
    fn validate(
        &self,
        module: &naga::Module,
        source: &str,
    ) -> Result<naga::valid::ModuleInfo, Diagnostic> {
        Validator::new(ValidationFlags::all(), self.capabilities)
            .validate(module)
            .map_err(|err| Diagnostic(err.emit_to_string(source)))
    }
}

/// Maps a stage to the naga stage, if naga supports it.
const fn naga_stage(stage: Stage) -> Option<ShaderStage> {
    match stage {
        Stage::Vertex => Some(ShaderStage::Vertex),
        Stage::Fragment => Some(ShaderStage::Fragment),
        Stage::Compute => Some(ShaderStage::Compute),
        Stage::Geometry | Stage::TessControl | Stage::TessEval => None,
    }
}

impl CompilerBackend for NagaBackend {
    #[inline]
    fn identity(&self) -> &str {
        concat!("naga-23+shader-cache-", env!("CARGO_PKG_VERSION"))
    }

    #[inline]
    fn compile(&self, source: &str, stage: Stage, entry: &str) -> Result<Vec<u32>, Diagnostic> {
        let shader_stage = naga_stage(stage)
            .ok_or_else(|| Diagnostic(format!("naga cannot compile {stage} shaders")))?;
        let module = glsl::Frontend::default()
            .parse(&glsl::Options::from(shader_stage), source)
            .map_err(|errors| Diagnostic(errors.emit_to_string(source)))?;
        let info = self.validate(&module, source)?;
        let pipeline = spv::PipelineOptions {
            shader_stage,
            entry_point: entry.to_owned(),
        };
        let words = spv::write_vec(&module, &info, &spv::Options::default(), Some(&pipeline))
            .map_err(|err| Diagnostic(format!("could not write SPIR-V: {err}")))?;
        log::trace!("naga wrote {} SPIR-V words", words.len());
        Ok(words)
    }

    #[inline]
    fn reflect(&self, spirv: &[u32]) -> Result<ReflectionInfo, Diagnostic> {
        let bytes = spirv
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect::<Vec<_>>();
        let module = spv_in::parse_u8_slice(&bytes, &spv_in::Options::default())
            .map_err(|err| Diagnostic(format!("could not parse SPIR-V: {err}")))?;

        let mut bindings = Vec::new();
        let mut constant_buffers = Vec::new();
        let mut push_constant_size = 0;
        for (_, var) in module.global_variables.iter() {
            let inner = &module.types[var.ty].inner;
            if var.space == AddressSpace::PushConstant {
                push_constant_size += inner.size(module.to_ctx());
                continue;
            }
            let Some(slot) = &var.binding else {
                continue;
            };
            let kind = match var.space {
                AddressSpace::Uniform => {
                    constant_buffers.push(ConstantBuffer::new(
                        slot.group,
                        slot.binding,
                        var.name.clone(),
                        inner.size(module.to_ctx()),
                    ));
                    BindingKind::UniformBuffer
                }
                AddressSpace::Storage { .. } => BindingKind::StorageBuffer,
                AddressSpace::Handle => handle_kind(&module, inner),
                AddressSpace::Function
                | AddressSpace::Private
                | AddressSpace::WorkGroup
                | AddressSpace::PushConstant => continue,
            };
            bindings.push(ResourceBinding::new(
                slot.group,
                slot.binding,
                kind,
                var.name.clone(),
            ));
        }
        Ok(ReflectionInfo::new(
            bindings,
            constant_buffers,
            push_constant_size,
        ))
    }
}

/// Kind of an opaque handle, looking through binding arrays.
fn handle_kind(module: &naga::Module, inner: &TypeInner) -> BindingKind {
    match *inner {
        TypeInner::Sampler { .. } => BindingKind::Sampler,
        TypeInner::Image {
            class: ImageClass::Storage { .. },
            ..
        } => BindingKind::StorageTexture,
        TypeInner::BindingArray { base, .. } => handle_kind(module, &module.types[base].inner),
        _ => BindingKind::Texture,
    }
}
