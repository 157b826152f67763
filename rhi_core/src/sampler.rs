use std::sync::Arc;

use crate::backend::{RawObject, RawSampler};
use crate::deletion::DeletionEvent;
use crate::device::DeviceShared;
use crate::pipeline::CompareOp;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum FilterMode {
    #[default]
    Nearest,
    Linear,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum AddressMode {
    #[default]
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

/// Describes a [`Sampler`].
///
/// Samplers with equal descriptors are shared, see [`Device::create_sampler`].
///
/// [`Device::create_sampler`]: crate::Device::create_sampler
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SamplerDescriptor {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    pub address_mode_u: AddressMode,
    pub address_mode_v: AddressMode,
    pub address_mode_w: AddressMode,
    /// Maximum anisotropy. Values of `0` and `1` disable anisotropic filtering.
    pub max_anisotropy: u8,
    /// Turns the sampler into a comparison sampler.
    pub compare: Option<CompareOp>,
}

#[derive(Clone, Debug)]
pub struct Sampler {
    inner: Arc<SamplerInner>,
}

#[derive(Debug)]
struct SamplerInner {
    raw: RawSampler,
    descriptor: SamplerDescriptor,
    shared: Arc<DeviceShared>,
}

impl Sampler {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        raw: RawSampler,
        descriptor: SamplerDescriptor,
    ) -> Self {
        Self {
            inner: Arc::new(SamplerInner {
                raw,
                descriptor,
                shared,
            }),
        }
    }

    pub fn raw(&self) -> RawSampler {
        self.inner.raw
    }

    pub fn descriptor(&self) -> &SamplerDescriptor {
        &self.inner.descriptor
    }

    pub fn set_debug_name(&self, name: &str) {
        self.inner
            .shared
            .driver
            .set_debug_name(RawObject::Sampler(self.inner.raw), name);
    }
}

impl PartialEq for Sampler {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Sampler {}

impl Drop for SamplerInner {
    fn drop(&mut self) {
        self.shared.defer(DeletionEvent::Sampler(self.raw));
    }
}
