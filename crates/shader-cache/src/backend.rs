//! The seam between the cache and an actual shader compiler.
//!
//! A [`CompilerBackend`] turns preprocessed source text into SPIR-V words and
//! extracts [`ReflectionInfo`] from them. The cache never looks inside either,
//! it only stores what the backend produced under the content hash of its input.

use crate::key::Stage;

/// A shader compiler the cache delegates to.
///
/// Implementations must be deterministic: the same text, stage and entry point
/// must produce equivalent output, since results are shared by content hash.
pub trait CompilerBackend: Send + Sync {
    /// Name and version of the compiler.
    ///
    /// Artifacts persisted by one identity are never served to another.
    fn identity(&self) -> &str;

    /// Compiles preprocessed source into SPIR-V words.
    ///
    /// # Errors
    ///
    /// Returns the diagnostic text of the compiler if the source is rejected.
    fn compile(&self, source: &str, stage: Stage, entry: &str) -> Result<Vec<u32>, Diagnostic>;

    /// Extracts resource layout information from compiled SPIR-V words.
    ///
    /// # Errors
    ///
    /// Returns a diagnostic if the words cannot be reflected.
    fn reflect(&self, spirv: &[u32]) -> Result<ReflectionInfo, Diagnostic>;
}

/// Diagnostic text reported by a backend or an execution context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct Diagnostic(pub String);

impl Diagnostic {
    /// Creates a diagnostic from any message.
    #[inline]
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for Diagnostic {
    #[inline]
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for Diagnostic {
    #[inline]
    fn from(message: &str) -> Self {
        Self(message.to_owned())
    }
}

/// Resource layout of a compiled shader.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub struct ReflectionInfo {
    /// Every bound resource, ordered by set then binding.
    pub bindings: Vec<ResourceBinding>,
    /// Uniform buffers together with their sizes.
    pub constant_buffers: Vec<ConstantBuffer>,
    /// Size of the push constant block in bytes, zero without one.
    pub push_constant_size: u32,
}

impl ReflectionInfo {
    /// Creates reflection info, sorting bindings and buffers by set then binding.
    #[inline]
    #[must_use]
    pub fn new(
        mut bindings: Vec<ResourceBinding>,
        mut constant_buffers: Vec<ConstantBuffer>,
        push_constant_size: u32,
    ) -> Self {
        bindings.sort_by_key(|binding| (binding.set, binding.binding));
        constant_buffers.sort_by_key(|buffer| (buffer.set, buffer.binding));
        Self {
            bindings,
            constant_buffers,
            push_constant_size,
        }
    }

    /// Looks up the resource bound at `set` and `binding`.
    #[inline]
    #[must_use]
    pub fn binding(&self, set: u32, binding: u32) -> Option<&ResourceBinding> {
        self.bindings
            .iter()
            .find(|resource| resource.set == set && resource.binding == binding)
    }
}

/// What kind of resource sits at a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum BindingKind {
    /// Uniform (constant) buffer.
    UniformBuffer,
    /// Read-write storage buffer.
    StorageBuffer,
    /// Sampled image.
    Texture,
    /// Standalone sampler.
    Sampler,
    /// Storage image.
    StorageTexture,
}

/// A resource bound at a descriptor set and binding.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub struct ResourceBinding {
    /// Descriptor set.
    pub set: u32,
    /// Binding within the set.
    pub binding: u32,
    /// Kind of resource.
    pub kind: BindingKind,
    /// Name in the source, if kept by the compiler.
    pub name: Option<String>,
}

impl ResourceBinding {
    /// Creates a binding description.
    #[inline]
    #[must_use]
    pub const fn new(set: u32, binding: u32, kind: BindingKind, name: Option<String>) -> Self {
        Self {
            set,
            binding,
            kind,
            name,
        }
    }
}

/// A uniform buffer and its size.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub struct ConstantBuffer {
    /// Descriptor set.
    pub set: u32,
    /// Binding within the set.
    pub binding: u32,
    /// Name in the source, if kept by the compiler.
    pub name: Option<String>,
    /// Size in bytes.
    pub size: u32,
}

impl ConstantBuffer {
    /// Creates a buffer description.
    #[inline]
    #[must_use]
    pub const fn new(set: u32, binding: u32, name: Option<String>, size: u32) -> Self {
        Self {
            set,
            binding,
            name,
            size,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test_log::test]
    fn reflection_is_sorted_by_set_and_binding() {
        let info = ReflectionInfo::new(
            vec![
                ResourceBinding::new(1, 0, BindingKind::Texture, None),
                ResourceBinding::new(0, 2, BindingKind::Sampler, None),
                ResourceBinding::new(0, 1, BindingKind::UniformBuffer, Some("Globals".into())),
            ],
            Vec::new(),
            16,
        );
        let order = info
            .bindings
            .iter()
            .map(|binding| (binding.set, binding.binding))
            .collect::<Vec<_>>();
        assert_eq!(order, [(0, 1), (0, 2), (1, 0)]);
        assert_eq!(
            info.binding(0, 2).map(|binding| binding.kind),
            Some(BindingKind::Sampler)
        );
        assert!(info.binding(2, 0).is_none());
    }

    #[test_log::test]
    fn reflection_serializes_kebab_case() {
        let info = ReflectionInfo::new(
            vec![ResourceBinding::new(0, 0, BindingKind::StorageTexture, None)],
            vec![ConstantBuffer::new(0, 1, None, 64)],
            0,
        );
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"storage-texture\""));
        assert!(json.contains("\"push-constant-size\":0"));
        let back: ReflectionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
