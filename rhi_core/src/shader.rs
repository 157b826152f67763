use std::sync::Arc;

use bitflags::bitflags;

use crate::backend::RawShaderModule;
use crate::deletion::DeletionEvent;
use crate::descriptor::BindingKind;
use crate::device::DeviceShared;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub const fn stages(self) -> ShaderStages {
        match self {
            Self::Vertex => ShaderStages::VERTEX,
            Self::Fragment => ShaderStages::FRAGMENT,
            Self::Compute => ShaderStages::COMPUTE,
        }
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

/// A binding a shader declares, as reported by shader reflection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderBinding {
    pub name: String,
    pub slot: u32,
    pub kind: BindingKind,
    /// Size of the bound data in bytes. `0` for textures and samplers.
    pub size: u64,
}

#[derive(Clone, Debug)]
pub struct ShaderDescriptor<'a> {
    pub stage: ShaderStage,
    /// Compiled shader binary in the format of the backend.
    pub code: &'a [u8],
    pub entry: &'a str,
    pub bindings: &'a [ShaderBinding],
    /// Size of the push constant block in bytes.
    pub push_constant_size: u32,
}

/// A compiled shader module.
#[derive(Clone, Debug)]
pub struct Shader {
    pub(crate) inner: Arc<ShaderInner>,
}

#[derive(Debug)]
pub(crate) struct ShaderInner {
    pub(crate) raw: RawShaderModule,
    pub(crate) stage: ShaderStage,
    pub(crate) code: Arc<[u8]>,
    pub(crate) entry: String,
    pub(crate) bindings: Vec<ShaderBinding>,
    pub(crate) push_constant_size: u32,
    pub(crate) shared: Arc<DeviceShared>,
}

impl Shader {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        raw: RawShaderModule,
        descriptor: &ShaderDescriptor<'_>,
    ) -> Self {
        Self {
            inner: Arc::new(ShaderInner {
                raw,
                stage: descriptor.stage,
                code: Arc::from(descriptor.code),
                entry: descriptor.entry.to_owned(),
                bindings: descriptor.bindings.to_vec(),
                push_constant_size: descriptor.push_constant_size,
                shared,
            }),
        }
    }

    pub fn stage(&self) -> ShaderStage {
        self.inner.stage
    }

    pub fn entry(&self) -> &str {
        &self.inner.entry
    }

    pub fn bindings(&self) -> &[ShaderBinding] {
        &self.inner.bindings
    }

    pub fn push_constant_size(&self) -> u32 {
        self.inner.push_constant_size
    }

    pub(crate) fn raw(&self) -> RawShaderModule {
        self.inner.raw
    }

    /// Returns the identity of the shader content used to key cached pipelines.
    pub(crate) fn key(&self) -> ShaderKey {
        ShaderKey {
            stage: self.inner.stage,
            code: self.inner.code.clone(),
            entry: self.inner.entry.clone(),
        }
    }
}

impl Drop for ShaderInner {
    fn drop(&mut self) {
        self.shared.defer(DeletionEvent::ShaderModule(self.raw));
    }
}

/// Content of a shader stage, compared by its binary.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ShaderKey {
    stage: ShaderStage,
    code: Arc<[u8]>,
    entry: String,
}
