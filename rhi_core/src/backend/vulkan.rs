//! The Vulkan backend.
//!
//! Requires Vulkan 1.2 with timeline semaphores. Every queue family gets exactly one queue and
//! a timeline semaphore that is signaled with the submission index of every batch. Buffers and
//! images use concurrent sharing between all families, so no ownership transfers are needed
//! when a resource moves between queues.

mod convert;
mod descriptors;

use std::borrow::Cow;
use std::ffi::{c_void, CStr, CString};
use std::io::Cursor;
use std::num::NonZeroU64;
use std::ops::Range;
use std::ptr::{null_mut, NonNull};

use ash::vk::{self, Handle};
use ash::{ext, khr, Entry};
use glam::UVec3;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use rhi_tracing::trace_span;

use crate::descriptor::HeapKind;
use crate::resource::{BufferUsage, TextureDescriptor, TextureDimension, TextureUsage};
use crate::sampler::SamplerDescriptor;
use crate::shader::ShaderStage;
use crate::swapchain::SwapchainConfig;

use super::{
    AcquiredImage, AdapterInfo, AdapterKind, AdapterMemoryProperties, BackendError, ClearValue,
    Command, CommandBufferLevel, DeviceLimits, Driver, MemoryHeap, MemoryRequirements, MemoryType,
    MemoryTypeFlags, PipelineBindPoint, QueueCapabilities, QueueFamily, RawBindingResource,
    RawBuffer, RawCommandBuffer, RawCommandPool, RawComputePipelineDescriptor, RawDescriptorHeap,
    RawFramebuffer, RawFramebufferDescriptor, RawGraphicsPipelineDescriptor, RawMemory,
    RawObject, RawPipeline, RawPipelineLayout, RawQueue, RawRenderPass, RawSampler,
    RawShaderModule, RawSurface, RawSwapchain, RawTexture, RenderPassLayout, SubmitBatch,
    SurfaceError, TextureFormat,
};

use convert::{aspect, restrict_to_queue, state_access};
use descriptors::{DescriptorHeap, RetiredSet};

const API_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);
const MIN_API_VERSION: u32 = vk::API_VERSION_1_2;

const ENGINE_NAME: &CStr = c"rhi";
const ENGINE_VERSION: u32 = vk::make_api_version(0, 0, 1, 0);

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Returns the instance extensions needed to create surfaces on `display`.
fn surface_extensions(display: RawDisplayHandle) -> Result<Vec<&'static CStr>, BackendError> {
    let platform = match display {
        #[cfg(target_os = "linux")]
        RawDisplayHandle::Wayland(_) => khr::wayland_surface::NAME,
        #[cfg(target_os = "linux")]
        RawDisplayHandle::Xlib(_) => khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        RawDisplayHandle::Xcb(_) => khr::xcb_surface::NAME,
        #[cfg(target_os = "windows")]
        RawDisplayHandle::Windows(_) => khr::win32_surface::NAME,
        _ => return Err(BackendError::Unsupported("display platform")),
    };

    Ok(vec![khr::surface::NAME, platform])
}

struct Instance {
    entry: Entry,
    instance: ash::Instance,
    debug_utils: Option<(ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl Instance {
    fn new(validation: bool, display: Option<RawDisplayHandle>) -> Result<Self, BackendError> {
        let entry = unsafe { Entry::load() }
            .map_err(|err| BackendError::InitializationFailed(err.to_string()))?;

        let app = vk::ApplicationInfo::default()
            .engine_name(ENGINE_NAME)
            .engine_version(ENGINE_VERSION)
            .api_version(API_VERSION);

        let mut extensions = match display {
            Some(display) => surface_extensions(display)?,
            None => Vec::new(),
        };

        let mut layers = Vec::new();
        let mut debug_utils = false;
        if validation {
            let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
            if available_layers
                .iter()
                .any(|layer| layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER))
            {
                layers.push(VALIDATION_LAYER.as_ptr());
            } else {
                tracing::warn!(
                    "validation requested but {:?} is not available",
                    VALIDATION_LAYER
                );
            }

            let available_extensions =
                unsafe { entry.enumerate_instance_extension_properties(None)? };
            if available_extensions
                .iter()
                .any(|ext| ext.extension_name_as_c_str() == Ok(ext::debug_utils::NAME))
            {
                extensions.push(ext::debug_utils::NAME);
                debug_utils = true;
            }
        }

        let extensions: Vec<_> = extensions.iter().map(|ext| ext.as_ptr()).collect();

        let mut debug_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let mut info = vk::InstanceCreateInfo::default()
            .application_info(&app)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions);
        if debug_utils {
            info = info.push_next(&mut debug_info);
        }

        let instance = unsafe { entry.create_instance(&info, None)? };

        let debug_utils = if debug_utils {
            let fns = ext::debug_utils::Instance::new(&entry, &instance);
            match unsafe { fns.create_debug_utils_messenger(&debug_info, None) } {
                Ok(messenger) => Some((fns, messenger)),
                Err(err) => {
                    tracing::warn!("failed to create debug messenger: {:?}", err);
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            entry,
            instance,
            debug_utils,
        })
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if let Some((fns, messenger)) = self.debug_utils.take() {
            unsafe {
                fns.destroy_debug_utils_messenger(messenger, None);
            }
        }

        unsafe {
            self.instance.destroy_instance(None);
        }
    }
}

/// What the driver needs to know about the physical device it picked.
struct AdapterSelection {
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    max_allocation_size: u64,
    sampler_anisotropy: bool,
}

fn select_adapter(instance: &ash::Instance) -> Result<AdapterSelection, BackendError> {
    let physical_devices = unsafe { instance.enumerate_physical_devices()? };

    let mut best: Option<(u32, AdapterSelection)> = None;
    for physical_device in physical_devices {
        let mut maintenance3 = vk::PhysicalDeviceMaintenance3Properties::default();
        let properties = {
            let mut properties = vk::PhysicalDeviceProperties2::default().push_next(&mut maintenance3);
            unsafe { instance.get_physical_device_properties2(physical_device, &mut properties) };
            properties.properties
        };

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let features = {
            let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut features12);
            unsafe { instance.get_physical_device_features2(physical_device, &mut features) };
            features.features
        };

        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy())
            .unwrap_or(Cow::Borrowed("(unknown)"));

        if properties.api_version < MIN_API_VERSION || features12.timeline_semaphore != vk::TRUE {
            tracing::debug!("skipping adapter {}: requires Vulkan 1.2 timeline semaphores", name);
            continue;
        }

        let score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 4,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
            vk::PhysicalDeviceType::CPU => 1,
            _ => 0,
        };

        if best.as_ref().map_or(true, |(best, _)| score > *best) {
            best = Some((
                score,
                AdapterSelection {
                    physical_device,
                    properties,
                    max_allocation_size: maintenance3.max_memory_allocation_size,
                    sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
                },
            ));
        }
    }

    best.map(|(_, selection)| selection)
        .ok_or(BackendError::Unsupported("no adapter with Vulkan 1.2 timeline semaphores"))
}

#[derive(Debug)]
struct QueueSlot {
    family: u32,
    capabilities: QueueCapabilities,
    queue: vk::Queue,
    timeline: vk::Semaphore,
    /// The last signaled timeline value. The lock also synchronizes access to `queue`.
    submitted: Mutex<u64>,
}

#[derive(Copy, Clone, Debug)]
struct MappedPtr(NonNull<u8>);

// SAFETY: The mapping is owned by the memory block and only handed out as a raw pointer.
unsafe impl Send for MappedPtr {}

#[derive(Debug)]
struct MemoryBlock {
    memory_type: u32,
    size: u64,
    mapped: Option<MappedPtr>,
}

#[derive(Debug)]
struct TextureEntry {
    image: vk::Image,
    view: vk::ImageView,
    /// View of the first mip level with all aspects, if the texture is a render attachment.
    attachment_view: Option<vk::ImageView>,
    descriptor: TextureDescriptor,
    swapchain: bool,
}

impl TextureEntry {
    fn attachment_view(&self) -> vk::ImageView {
        self.attachment_view.unwrap_or(self.view)
    }
}

#[derive(Debug)]
struct PipelineLayoutEntry {
    layout: vk::PipelineLayout,
    sets: [vk::DescriptorSetLayout; 2],
    refs: usize,
}

#[derive(Debug)]
struct PipelineEntry {
    key: RawPipelineLayout,
    layout: vk::PipelineLayout,
    sets: [vk::DescriptorSetLayout; 2],
}

#[derive(Debug)]
struct PoolEntry {
    capabilities: QueueCapabilities,
    buffers: Vec<u64>,
}

#[derive(Copy, Clone, Debug)]
struct CommandBufferEntry {
    level: CommandBufferLevel,
    capabilities: QueueCapabilities,
}

#[derive(Debug)]
struct SwapchainEntry {
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    fence: vk::Fence,
    /// Signaled when rendering to the image at the same index completes.
    present_semaphores: Vec<vk::Semaphore>,
}

#[derive(Debug, Default)]
struct Tables {
    memories: HashMap<u64, MemoryBlock>,
    textures: HashMap<u64, TextureEntry>,
    heaps: HashMap<u64, DescriptorHeap>,
    layouts: HashMap<RawPipelineLayout, PipelineLayoutEntry>,
    pipelines: HashMap<u64, PipelineEntry>,
    pools: HashMap<u64, PoolEntry>,
    command_buffers: HashMap<u64, CommandBufferEntry>,
    surfaces: HashSet<u64>,
    swapchains: HashMap<u64, SwapchainEntry>,
    retired_sets: Vec<RetiredSet>,
}

/// A [`Driver`] for a Vulkan device.
pub struct VulkanDriver {
    instance: Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    surface_fns: Option<khr::surface::Instance>,
    swapchain_fns: Option<khr::swapchain::Device>,
    debug_utils: Option<ext::debug_utils::Device>,
    adapter: AdapterInfo,
    memory: AdapterMemoryProperties,
    families: Vec<QueueFamily>,
    limits: DeviceLimits,
    non_coherent_atom_size: u64,
    max_sampler_anisotropy: f32,
    sampler_anisotropy: bool,
    depth_stencil_format: vk::Format,
    queues: Vec<QueueSlot>,
    /// Families sharing every buffer and image.
    sharing: Vec<u32>,
    tables: Mutex<Tables>,
}

impl VulkanDriver {
    /// Creates a driver on the most capable adapter.
    ///
    /// Surfaces can only be created if `display` is given. `validation` enables the Khronos
    /// validation layer and debug names if they are installed.
    pub fn new(validation: bool, display: Option<RawDisplayHandle>) -> Result<Self, BackendError> {
        let _span = trace_span!("VulkanDriver::new").entered();

        let instance = Instance::new(validation, display)?;
        let selection = select_adapter(&instance.instance)?;
        let physical_device = selection.physical_device;
        let properties = selection.properties;

        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let kind = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => AdapterKind::DiscreteGpu,
            vk::PhysicalDeviceType::INTEGRATED_GPU => AdapterKind::IntegratedGpu,
            vk::PhysicalDeviceType::VIRTUAL_GPU => AdapterKind::VirtualGpu,
            vk::PhysicalDeviceType::CPU => AdapterKind::Cpu,
            _ => AdapterKind::Other,
        };
        let adapter = AdapterInfo {
            name,
            vendor_id: properties.vendor_id,
            kind,
        };

        let memory = memory_properties(&instance.instance, &selection);
        let families: Vec<_> = unsafe {
            instance
                .instance
                .get_physical_device_queue_family_properties(physical_device)
        }
        .into_iter()
        .enumerate()
        .map(|(id, family)| QueueFamily {
            id: id as u32,
            count: family.queue_count,
            capabilities: convert::queue_capabilities(family.queue_flags),
        })
        .filter(|family| family.count > 0 && !family.capabilities.is_empty())
        .collect();

        let queue_priorities = [1.0];
        let queue_infos: Vec<_> = families
            .iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family.id)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let mut extensions = Vec::new();
        if display.is_some() {
            extensions.push(khr::swapchain::NAME.as_ptr());
        }

        let features =
            vk::PhysicalDeviceFeatures::default().sampler_anisotropy(selection.sampler_anisotropy);
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);

        let info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features)
            .push_next(&mut features12);

        let device = unsafe {
            instance
                .instance
                .create_device(physical_device, &info, None)?
        };

        let mut queues = Vec::with_capacity(families.len());
        for family in &families {
            match create_timeline(&device) {
                Ok(timeline) => queues.push(QueueSlot {
                    family: family.id,
                    capabilities: family.capabilities,
                    queue: unsafe { device.get_device_queue(family.id, 0) },
                    timeline,
                    submitted: Mutex::new(0),
                }),
                Err(err) => {
                    unsafe {
                        for slot in &queues {
                            device.destroy_semaphore(slot.timeline, None);
                        }
                        device.destroy_device(None);
                    }
                    return Err(err.into());
                }
            }
        }

        let depth_stencil_format = {
            let props = unsafe {
                instance.instance.get_physical_device_format_properties(
                    physical_device,
                    vk::Format::D24_UNORM_S8_UINT,
                )
            };
            if props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            {
                vk::Format::D24_UNORM_S8_UINT
            } else {
                vk::Format::D32_SFLOAT_S8_UINT
            }
        };

        let surface_fns = display
            .map(|_| khr::surface::Instance::new(&instance.entry, &instance.instance));
        let swapchain_fns = display.map(|_| khr::swapchain::Device::new(&instance.instance, &device));
        let debug_utils = instance
            .debug_utils
            .as_ref()
            .map(|_| ext::debug_utils::Device::new(&instance.instance, &device));

        let limits = device_limits(&properties.limits, selection.max_allocation_size);
        let sharing = families.iter().map(|family| family.id).collect();

        tracing::info!(
            "created Vulkan device on {} ({:?}) with {} queue families",
            adapter.name,
            adapter.kind,
            families.len()
        );

        Ok(Self {
            instance,
            physical_device,
            device,
            surface_fns,
            swapchain_fns,
            debug_utils,
            adapter,
            memory,
            families,
            limits,
            non_coherent_atom_size: properties.limits.non_coherent_atom_size.max(1),
            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,
            sampler_anisotropy: selection.sampler_anisotropy,
            depth_stencil_format,
            queues,
            sharing,
            tables: Mutex::new(Tables::default()),
        })
    }

    /// Creates a surface for a window.
    ///
    /// # Safety
    ///
    /// `display` and `window` must be valid handles and the window must outlive the surface.
    pub unsafe fn create_surface(
        &self,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<RawSurface, BackendError> {
        if self.surface_fns.is_none() {
            return Err(BackendError::Unsupported("driver was created without a display"));
        }

        let entry = &self.instance.entry;
        let instance = &self.instance.instance;

        let surface = match (display, window) {
            #[cfg(target_os = "linux")]
            (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
                let info = vk::WaylandSurfaceCreateInfoKHR::default()
                    .display(display.display.as_ptr())
                    .surface(window.surface.as_ptr());

                let fns = khr::wayland_surface::Instance::new(entry, instance);
                unsafe { fns.create_wayland_surface(&info, None)? }
            }
            #[cfg(target_os = "linux")]
            (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
                let info = vk::XcbSurfaceCreateInfoKHR::default()
                    .connection(display.connection.map(|v| v.as_ptr()).unwrap_or(null_mut()))
                    .window(window.window.get());

                let fns = khr::xcb_surface::Instance::new(entry, instance);
                unsafe { fns.create_xcb_surface(&info, None)? }
            }
            #[cfg(target_os = "linux")]
            (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
                let info = vk::XlibSurfaceCreateInfoKHR::default()
                    .dpy(display.display.map(|v| v.as_ptr()).unwrap_or(null_mut()))
                    .window(window.window);

                let fns = khr::xlib_surface::Instance::new(entry, instance);
                unsafe { fns.create_xlib_surface(&info, None)? }
            }
            #[cfg(target_os = "windows")]
            (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(window)) => {
                let info = vk::Win32SurfaceCreateInfoKHR::default()
                    .hinstance(window.hinstance.map(|v| v.get()).unwrap_or_default())
                    .hwnd(window.hwnd.get());

                let fns = khr::win32_surface::Instance::new(entry, instance);
                unsafe { fns.create_win32_surface(&info, None)? }
            }
            _ => return Err(BackendError::Unsupported("window platform")),
        };

        self.tables.lock().surfaces.insert(surface.as_raw());
        Ok(RawSurface(surface.as_raw()))
    }

    /// # Safety
    ///
    /// No swapchain of the surface may still exist.
    pub unsafe fn destroy_surface(&self, surface: RawSurface) {
        self.tables.lock().surfaces.remove(&surface.0);

        if let Some(fns) = &self.surface_fns {
            unsafe {
                fns.destroy_surface(vk::SurfaceKHR::from_raw(surface.0), None);
            }
        }
    }

    fn queue_slot(&self, queue: RawQueue) -> Result<&QueueSlot, BackendError> {
        self.queues
            .iter()
            .find(|slot| u64::from(slot.family) == queue.0)
            .ok_or(BackendError::Unsupported("queue family without queue"))
    }

    fn sharing_mode(&self) -> vk::SharingMode {
        if self.sharing.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        }
    }

    fn format(&self, format: TextureFormat) -> vk::Format {
        convert::format(format, self.depth_stencil_format)
    }

    fn is_coherent(&self, memory_type: u32) -> bool {
        self.memory
            .types
            .get(memory_type as usize)
            .is_some_and(|ty| ty.flags.contains(MemoryTypeFlags::HOST_COHERENT))
    }

    /// Expands `range` to the non-coherent atom size.
    fn mapped_range(
        &self,
        memory: RawMemory,
        size: u64,
        range: Range<u64>,
    ) -> vk::MappedMemoryRange<'static> {
        let atom = self.non_coherent_atom_size;
        let start = range.start / atom * atom;
        let end = range.end.div_ceil(atom) * atom;
        let len = if end >= size {
            vk::WHOLE_SIZE
        } else {
            end - start
        };

        vk::MappedMemoryRange::default()
            .memory(vk::DeviceMemory::from_raw(memory.0))
            .offset(start)
            .size(len)
    }

    fn create_view(
        &self,
        image: vk::Image,
        descriptor: &TextureDescriptor,
        view_aspect: vk::ImageAspectFlags,
        mip_levels: u32,
    ) -> Result<vk::ImageView, vk::Result> {
        let subresource_range = vk::ImageSubresourceRange::default()
            .aspect_mask(view_aspect)
            .base_mip_level(0)
            .level_count(mip_levels)
            .base_array_layer(0)
            .layer_count(descriptor.array_layers);

        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(convert::view_type(
                descriptor.dimension,
                descriptor.array_layers,
            ))
            .format(self.format(descriptor.format))
            .subresource_range(subresource_range)
            .components(vk::ComponentMapping::default());

        unsafe { self.device.create_image_view(&info, None) }
    }

    /// Returns the layout for `key`, creating it on first use.
    fn acquire_layout(
        &self,
        tables: &mut Tables,
        key: &RawPipelineLayout,
    ) -> Result<(vk::PipelineLayout, [vk::DescriptorSetLayout; 2]), BackendError> {
        if let Some(entry) = tables.layouts.get_mut(key) {
            entry.refs += 1;
            return Ok((entry.layout, entry.sets));
        }

        let resources: Vec<_> = key
            .resource_table
            .iter()
            .enumerate()
            .map(|(binding, kind)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding as u32)
                    .descriptor_type(convert::descriptor_type(*kind))
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::ALL)
            })
            .collect();
        let samplers: Vec<_> = (0..key.sampler_table)
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::ALL)
            })
            .collect();

        let mut sets = [vk::DescriptorSetLayout::null(); 2];
        for (set, bindings) in sets.iter_mut().zip([&resources, &samplers]) {
            let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
            match unsafe { self.device.create_descriptor_set_layout(&info, None) } {
                Ok(layout) => *set = layout,
                Err(err) => {
                    unsafe { self.destroy_set_layouts(&sets) };
                    return Err(err.into());
                }
            }
        }

        let push_constants = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::ALL)
            .offset(0)
            .size(key.push_constant_size)];
        let push_constants: &[_] = if key.push_constant_size > 0 {
            &push_constants
        } else {
            &[]
        };

        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&sets)
            .push_constant_ranges(push_constants);
        let layout = match unsafe { self.device.create_pipeline_layout(&info, None) } {
            Ok(layout) => layout,
            Err(err) => {
                unsafe { self.destroy_set_layouts(&sets) };
                return Err(err.into());
            }
        };

        tables.layouts.insert(
            key.clone(),
            PipelineLayoutEntry {
                layout,
                sets,
                refs: 1,
            },
        );

        Ok((layout, sets))
    }

    /// # Safety
    ///
    /// No pipeline using the layout may be in use by the GPU.
    unsafe fn release_layout(&self, tables: &mut Tables, key: &RawPipelineLayout) {
        let Some(entry) = tables.layouts.get_mut(key) else {
            return;
        };

        entry.refs -= 1;
        if entry.refs != 0 {
            return;
        }

        let Some(entry) = tables.layouts.remove(key) else {
            return;
        };

        for heap in tables.heaps.values_mut() {
            for set_layout in entry.sets {
                let sets = heap.forget_layout(set_layout);
                if sets.is_empty() {
                    continue;
                }

                if let Err(err) = unsafe { self.device.free_descriptor_sets(heap.pool, &sets) } {
                    tracing::error!("failed to free descriptor sets: {:?}", err);
                }
            }
        }

        unsafe {
            self.device.destroy_pipeline_layout(entry.layout, None);
            self.destroy_set_layouts(&entry.sets);
        }
    }

    unsafe fn destroy_set_layouts(&self, sets: &[vk::DescriptorSetLayout]) {
        for set in sets {
            if *set != vk::DescriptorSetLayout::null() {
                unsafe {
                    self.device.destroy_descriptor_set_layout(*set, None);
                }
            }
        }
    }

    fn submitted_values(&self) -> Vec<u64> {
        self.queues.iter().map(|slot| *slot.submitted.lock()).collect()
    }

    /// Frees descriptor sets that every queue has finished using.
    fn free_retired_sets(&self, tables: &mut Tables) {
        if tables.retired_sets.is_empty() {
            return;
        }

        let completed: Vec<u64> = self
            .queues
            .iter()
            .map(|slot| unsafe { self.device.get_semaphore_counter_value(slot.timeline) }.unwrap_or(0))
            .collect();

        tables.retired_sets.retain(|retired| {
            let done = retired
                .after
                .iter()
                .zip(&completed)
                .all(|(after, completed)| completed >= after);
            if done {
                if let Err(err) =
                    unsafe { self.device.free_descriptor_sets(retired.pool, &[retired.set]) }
                {
                    tracing::error!("failed to free descriptor set: {:?}", err);
                }
            }

            !done
        });
    }

    fn record_barrier(
        &self,
        tables: &Tables,
        buffer: vk::CommandBuffer,
        capabilities: QueueCapabilities,
        buffers: &[super::BufferBarrier],
        textures: &[super::TextureBarrier],
    ) {
        let mut src_stages = vk::PipelineStageFlags::empty();
        let mut dst_stages = vk::PipelineStageFlags::empty();

        let access = |state| {
            let state = state_access(state);
            (state, restrict_to_queue(state.stages, state.access, capabilities))
        };

        let mut buffer_barriers = Vec::with_capacity(buffers.len());
        for barrier in buffers {
            let (_, src) = access(barrier.src);
            let (_, dst) = access(barrier.dst);
            let (src_stage, src_access) =
                src.unwrap_or((vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()));
            let (dst_stage, dst_access) =
                dst.unwrap_or((vk::PipelineStageFlags::BOTTOM_OF_PIPE, vk::AccessFlags::empty()));
            src_stages |= src_stage;
            dst_stages |= dst_stage;

            buffer_barriers.push(
                vk::BufferMemoryBarrier::default()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(vk::Buffer::from_raw(barrier.buffer.0))
                    .offset(0)
                    .size(vk::WHOLE_SIZE),
            );
        }

        let mut image_barriers = Vec::with_capacity(textures.len());
        for barrier in textures {
            let Some(entry) = tables.textures.get(&barrier.texture.0) else {
                tracing::error!("barrier on unknown texture {:?}", barrier.texture);
                continue;
            };

            let (src_state, src) = access(barrier.src);
            let (dst_state, dst) = access(barrier.dst);
            let (src_stage, src_access) =
                src.unwrap_or((vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()));
            let (dst_stage, dst_access) =
                dst.unwrap_or((vk::PipelineStageFlags::BOTTOM_OF_PIPE, vk::AccessFlags::empty()));
            src_stages |= src_stage;
            dst_stages |= dst_stage;

            let subresource_range = vk::ImageSubresourceRange::default()
                .aspect_mask(aspect(barrier.format))
                .base_mip_level(0)
                .level_count(vk::REMAINING_MIP_LEVELS)
                .base_array_layer(0)
                .layer_count(vk::REMAINING_ARRAY_LAYERS);

            image_barriers.push(
                vk::ImageMemoryBarrier::default()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .old_layout(src_state.layout)
                    .new_layout(dst_state.layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(entry.image)
                    .subresource_range(subresource_range),
            );
        }

        if src_stages.is_empty() {
            src_stages = vk::PipelineStageFlags::TOP_OF_PIPE;
        }
        if dst_stages.is_empty() {
            dst_stages = vk::PipelineStageFlags::BOTTOM_OF_PIPE;
        }

        unsafe {
            self.device.cmd_pipeline_barrier(
                buffer,
                src_stages,
                dst_stages,
                vk::DependencyFlags::empty(),
                &[],
                &buffer_barriers,
                &image_barriers,
            );
        }
    }

    fn name_object<T: Handle>(&self, handle: T, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };

        let Ok(name) = CString::new(name) else {
            return;
        };

        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(&name);
        if let Err(err) = unsafe { debug_utils.set_debug_utils_object_name(&info) } {
            tracing::debug!("failed to set debug name: {:?}", err);
        }
    }
}

fn create_timeline(device: &ash::Device) -> Result<vk::Semaphore, vk::Result> {
    let mut ty = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(0);
    let info = vk::SemaphoreCreateInfo::default().push_next(&mut ty);
    unsafe { device.create_semaphore(&info, None) }
}

fn memory_properties(
    instance: &ash::Instance,
    selection: &AdapterSelection,
) -> AdapterMemoryProperties {
    let props = unsafe { instance.get_physical_device_memory_properties(selection.physical_device) };

    let heaps = props
        .memory_heaps
        .iter()
        .take(props.memory_heap_count as usize)
        .enumerate()
        .map(|(id, heap)| MemoryHeap {
            id: id as u32,
            size: heap.size,
        })
        .collect();
    let types = props
        .memory_types
        .iter()
        .take(props.memory_type_count as usize)
        .enumerate()
        .map(|(id, ty)| MemoryType {
            id: id as u32,
            heap: ty.heap_index,
            flags: convert::memory_type_flags(ty.property_flags),
        })
        .collect();

    AdapterMemoryProperties {
        heaps,
        types,
        max_allocation_size: NonZeroU64::new(selection.max_allocation_size)
            .unwrap_or(NonZeroU64::MIN),
    }
}

fn device_limits(limits: &vk::PhysicalDeviceLimits, max_allocation_size: u64) -> DeviceLimits {
    DeviceLimits {
        max_buffer_size: max_allocation_size,
        max_texture_dimension_2d: limits.max_image_dimension2_d,
        max_texture_dimension_3d: limits.max_image_dimension3_d,
        max_array_layers: limits.max_image_array_layers,
        max_mip_levels: u32::BITS - limits.max_image_dimension2_d.leading_zeros(),
        max_color_attachments: limits.max_color_attachments,
        max_vertex_attributes: limits.max_vertex_input_attributes,
        max_bindings_per_table: limits.max_per_stage_resources,
        max_push_constant_size: limits.max_push_constants_size,
    }
}

fn requirements(req: vk::MemoryRequirements) -> MemoryRequirements {
    // Bit `i` is set iff the memory type at index `i` is
    // supported for this resource.
    let mut memory_types = Vec::new();
    let mut bits = req.memory_type_bits;
    while bits != 0 {
        let index = bits.trailing_zeros();
        memory_types.push(index);
        bits &= !(1 << index);
    }

    MemoryRequirements {
        size: NonZeroU64::new(req.size).unwrap_or(NonZeroU64::MIN),
        align: NonZeroU64::new(req.alignment).unwrap_or(NonZeroU64::MIN),
        memory_types,
    }
}

fn surface_error(res: vk::Result) -> SurfaceError {
    match res {
        vk::Result::ERROR_OUT_OF_DATE_KHR => SurfaceError::OutOfDate,
        vk::Result::ERROR_DEVICE_LOST => SurfaceError::DeviceLost,
        res => {
            tracing::warn!("surface error: {:?}", res);
            SurfaceError::Lost
        }
    }
}

fn bind_point(bind_point: PipelineBindPoint) -> vk::PipelineBindPoint {
    match bind_point {
        PipelineBindPoint::Graphics => vk::PipelineBindPoint::GRAPHICS,
        PipelineBindPoint::Compute => vk::PipelineBindPoint::COMPUTE,
    }
}

fn entry_point(name: &str) -> Result<CString, BackendError> {
    CString::new(name).map_err(|_| BackendError::Unexpected(format!("invalid entry point {:?}", name)))
}

impl Driver for VulkanDriver {
    fn adapter_info(&self) -> AdapterInfo {
        self.adapter.clone()
    }

    fn memory_properties(&self) -> AdapterMemoryProperties {
        self.memory.clone()
    }

    fn queue_families(&self) -> Vec<QueueFamily> {
        self.families.clone()
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn queue(&self, family: u32) -> Result<RawQueue, BackendError> {
        let queue = RawQueue(u64::from(family));
        self.queue_slot(queue)?;
        Ok(queue)
    }

    fn allocate_memory(
        &self,
        size: NonZeroU64,
        memory_type: u32,
    ) -> Result<RawMemory, BackendError> {
        let info = vk::MemoryAllocateInfo::default()
            // - `allocationSize` must be greater than 0.
            .allocation_size(size.get())
            .memory_type_index(memory_type);

        let memory = unsafe { self.device.allocate_memory(&info, None)? };
        self.tables.lock().memories.insert(
            memory.as_raw(),
            MemoryBlock {
                memory_type,
                size: size.get(),
                mapped: None,
            },
        );

        Ok(RawMemory(memory.as_raw()))
    }

    unsafe fn free_memory(&self, memory: RawMemory) {
        self.tables.lock().memories.remove(&memory.0);

        // Freeing a mapped block implicitly unmaps it.
        unsafe {
            self.device
                .free_memory(vk::DeviceMemory::from_raw(memory.0), None);
        }
    }

    fn map_memory(&self, memory: RawMemory) -> Result<NonNull<u8>, BackendError> {
        let mut tables = self.tables.lock();
        let Some(block) = tables.memories.get_mut(&memory.0) else {
            return Err(BackendError::MemoryMapFailed);
        };

        if let Some(ptr) = block.mapped {
            return Ok(ptr.0);
        }

        let host_visible = self
            .memory
            .types
            .get(block.memory_type as usize)
            .is_some_and(|ty| ty.flags.contains(MemoryTypeFlags::HOST_VISIBLE));
        if !host_visible {
            return Err(BackendError::MemoryMapFailed);
        }

        let ptr = unsafe {
            self.device.map_memory(
                vk::DeviceMemory::from_raw(memory.0),
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )?
        };

        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(BackendError::MemoryMapFailed)?;
        block.mapped = Some(MappedPtr(ptr));
        Ok(ptr)
    }

    fn flush_memory(&self, memory: RawMemory, range: Range<u64>) -> Result<(), BackendError> {
        let (memory_type, size) = match self.tables.lock().memories.get(&memory.0) {
            Some(block) => (block.memory_type, block.size),
            None => return Err(BackendError::MemoryMapFailed),
        };

        if self.is_coherent(memory_type) || range.is_empty() {
            return Ok(());
        }

        let range = self.mapped_range(memory, size, range);
        unsafe { self.device.flush_mapped_memory_ranges(&[range])? };
        Ok(())
    }

    fn invalidate_memory(&self, memory: RawMemory, range: Range<u64>) -> Result<(), BackendError> {
        let (memory_type, size) = match self.tables.lock().memories.get(&memory.0) {
            Some(block) => (block.memory_type, block.size),
            None => return Err(BackendError::MemoryMapFailed),
        };

        if self.is_coherent(memory_type) || range.is_empty() {
            return Ok(());
        }

        let range = self.mapped_range(memory, size, range);
        unsafe { self.device.invalidate_mapped_memory_ranges(&[range])? };
        Ok(())
    }

    fn create_buffer(&self, size: NonZeroU64, usage: BufferUsage) -> Result<RawBuffer, BackendError> {
        let usage = convert::buffer_usage(usage);
        if usage.is_empty() {
            return Err(BackendError::Unsupported("buffer without usage"));
        }

        let info = vk::BufferCreateInfo::default()
            // - `size` must be greater than 0.
            .size(size.get())
            // - `usage` must not be 0. Checked above.
            .usage(usage)
            .sharing_mode(self.sharing_mode())
            .queue_family_indices(&self.sharing);

        let buffer = unsafe { self.device.create_buffer(&info, None)? };
        Ok(RawBuffer(buffer.as_raw()))
    }

    fn buffer_memory_requirements(&self, buffer: RawBuffer) -> MemoryRequirements {
        let req = unsafe {
            self.device
                .get_buffer_memory_requirements(vk::Buffer::from_raw(buffer.0))
        };

        requirements(req)
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: RawBuffer,
        memory: RawMemory,
        offset: u64,
    ) -> Result<(), BackendError> {
        unsafe {
            self.device.bind_buffer_memory(
                vk::Buffer::from_raw(buffer.0),
                vk::DeviceMemory::from_raw(memory.0),
                offset,
            )?;
        }

        Ok(())
    }

    unsafe fn destroy_buffer(&self, buffer: RawBuffer) {
        unsafe {
            self.device
                .destroy_buffer(vk::Buffer::from_raw(buffer.0), None);
        }
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<RawTexture, BackendError> {
        let extent = match descriptor.dimension {
            TextureDimension::D1 => vk::Extent3D {
                width: descriptor.size.x,
                height: 1,
                depth: 1,
            },
            TextureDimension::D2 => vk::Extent3D {
                width: descriptor.size.x,
                height: descriptor.size.y,
                depth: 1,
            },
            TextureDimension::D3 => vk::Extent3D {
                width: descriptor.size.x,
                height: descriptor.size.y,
                depth: descriptor.size.z,
            },
        };

        let usage = convert::texture_usage(descriptor.usage, descriptor.format);
        if usage.is_empty() {
            return Err(BackendError::Unsupported("texture without usage"));
        }

        let info = vk::ImageCreateInfo::default()
            .image_type(convert::image_type(descriptor.dimension))
            .format(self.format(descriptor.format))
            .extent(extent)
            .mip_levels(descriptor.mip_levels)
            .array_layers(descriptor.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(self.sharing_mode())
            .queue_family_indices(&self.sharing)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&info, None)? };
        self.tables.lock().textures.insert(
            image.as_raw(),
            TextureEntry {
                image,
                view: vk::ImageView::null(),
                attachment_view: None,
                descriptor: *descriptor,
                swapchain: false,
            },
        );

        Ok(RawTexture(image.as_raw()))
    }

    fn texture_memory_requirements(&self, texture: RawTexture) -> MemoryRequirements {
        let req = unsafe {
            self.device
                .get_image_memory_requirements(vk::Image::from_raw(texture.0))
        };

        requirements(req)
    }

    unsafe fn bind_texture_memory(
        &self,
        texture: RawTexture,
        memory: RawMemory,
        offset: u64,
    ) -> Result<(), BackendError> {
        let image = vk::Image::from_raw(texture.0);
        unsafe {
            self.device
                .bind_image_memory(image, vk::DeviceMemory::from_raw(memory.0), offset)?;
        }

        let mut tables = self.tables.lock();
        let Some(entry) = tables.textures.get_mut(&texture.0) else {
            return Err(BackendError::Unexpected(format!("unknown texture {:?}", texture)));
        };

        // Views can only be created once memory is bound. Sampled views of depth-stencil
        // formats may only contain the depth aspect.
        let descriptor = entry.descriptor;
        let full = aspect(descriptor.format);
        let sampled = if full.contains(vk::ImageAspectFlags::DEPTH) {
            vk::ImageAspectFlags::DEPTH
        } else {
            full
        };

        entry.view = self.create_view(image, &descriptor, sampled, descriptor.mip_levels)?;
        if descriptor.usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            entry.attachment_view = Some(self.create_view(image, &descriptor, full, 1)?);
        }

        Ok(())
    }

    unsafe fn destroy_texture(&self, texture: RawTexture) {
        let Some(entry) = self.tables.lock().textures.remove(&texture.0) else {
            return;
        };

        assert!(
            !entry.swapchain,
            "swapchain images are destroyed with their swapchain"
        );

        unsafe {
            if let Some(view) = entry.attachment_view {
                self.device.destroy_image_view(view, None);
            }
            if entry.view != vk::ImageView::null() {
                self.device.destroy_image_view(entry.view, None);
            }
            self.device.destroy_image(entry.image, None);
        }
    }

    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> Result<RawSampler, BackendError> {
        let anisotropy = self.sampler_anisotropy && descriptor.max_anisotropy > 1;

        let mut info = vk::SamplerCreateInfo::default()
            .mag_filter(descriptor.mag_filter.into())
            .min_filter(descriptor.min_filter.into())
            .mipmap_mode(descriptor.mipmap_filter.into())
            .address_mode_u(descriptor.address_mode_u.into())
            .address_mode_v(descriptor.address_mode_v.into())
            .address_mode_w(descriptor.address_mode_w.into())
            .anisotropy_enable(anisotropy)
            .max_anisotropy(f32::from(descriptor.max_anisotropy).min(self.max_sampler_anisotropy))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);

        if let Some(compare) = descriptor.compare {
            info = info.compare_enable(true).compare_op(compare.into());
        }

        let sampler = unsafe { self.device.create_sampler(&info, None)? };
        Ok(RawSampler(sampler.as_raw()))
    }

    unsafe fn destroy_sampler(&self, sampler: RawSampler) {
        unsafe {
            self.device
                .destroy_sampler(vk::Sampler::from_raw(sampler.0), None);
        }
    }

    fn create_shader_module(
        &self,
        stage: ShaderStage,
        code: &[u8],
    ) -> Result<RawShaderModule, BackendError> {
        let code = ash::util::read_spv(&mut Cursor::new(code))
            .map_err(|err| BackendError::Unexpected(format!("invalid SPIR-V: {}", err)))?;

        // Code size must be greater than 0.
        if code.is_empty() {
            return Err(BackendError::Unexpected("empty SPIR-V module".to_owned()));
        }

        let info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe { self.device.create_shader_module(&info, None)? };

        tracing::trace!("created {:?} shader module ({} words)", stage, code.len());
        Ok(RawShaderModule(module.as_raw()))
    }

    unsafe fn destroy_shader_module(&self, module: RawShaderModule) {
        unsafe {
            self.device
                .destroy_shader_module(vk::ShaderModule::from_raw(module.0), None);
        }
    }

    fn create_descriptor_heap(
        &self,
        kind: HeapKind,
        capacity: u32,
    ) -> Result<RawDescriptorHeap, BackendError> {
        let heap = DescriptorHeap::new(&self.device, kind, capacity)?;
        let raw = heap.pool.as_raw();
        self.tables.lock().heaps.insert(raw, heap);
        Ok(RawDescriptorHeap(raw))
    }

    unsafe fn destroy_descriptor_heap(&self, heap: RawDescriptorHeap) {
        let mut tables = self.tables.lock();
        let Some(heap) = tables.heaps.remove(&heap.0) else {
            return;
        };

        // Destroying the pool frees all of its sets.
        tables.retired_sets.retain(|retired| retired.pool != heap.pool);

        unsafe {
            heap.destroy(&self.device);
        }
    }

    unsafe fn write_descriptor(
        &self,
        heap: RawDescriptorHeap,
        slot: u32,
        resource: RawBindingResource,
    ) {
        let mut tables = self.tables.lock();
        let Some(entry) = tables.heaps.get_mut(&heap.0) else {
            tracing::error!("write to unknown descriptor heap {:?}", heap);
            return;
        };

        debug_assert_eq!(entry.kind(), resource.kind().heap());

        let pool = entry.pool;
        let stale = entry.write(slot, resource);
        if stale.is_empty() {
            return;
        }

        // Sets that contained the slot may still be referenced by pending work.
        let after = self.submitted_values();
        tables
            .retired_sets
            .extend(stale.into_iter().map(|set| RetiredSet {
                pool,
                set,
                after: after.clone(),
            }));
    }

    fn create_render_pass(&self, layout: &RenderPassLayout) -> Result<RawRenderPass, BackendError> {
        let mut attachments = Vec::new();
        for color in &layout.colors {
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(self.format(color.format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(convert::load_op(color.load_op))
                    .store_op(convert::store_op(color.store_op))
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    // Attachments are transitioned before the render pass begins.
                    .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
            );
        }

        if let Some(depth) = &layout.depth_stencil {
            let (stencil_load, stencil_store) = if depth.format == TextureFormat::Depth24PlusStencil8
            {
                (
                    convert::load_op(depth.load_op),
                    convert::store_op(depth.store_op),
                )
            } else {
                (
                    vk::AttachmentLoadOp::DONT_CARE,
                    vk::AttachmentStoreOp::DONT_CARE,
                )
            };

            attachments.push(
                vk::AttachmentDescription::default()
                    .format(self.format(depth.format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(convert::load_op(depth.load_op))
                    .store_op(convert::store_op(depth.store_op))
                    .stencil_load_op(stencil_load)
                    .stencil_store_op(stencil_store)
                    .initial_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            );
        }

        let color_refs: Vec<_> = (0..layout.colors.len() as u32)
            .map(|attachment| {
                vk::AttachmentReference::default()
                    .attachment(attachment)
                    .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            })
            .collect();
        let depth_ref = vk::AttachmentReference::default()
            .attachment(layout.colors.len() as u32)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if layout.depth_stencil.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }

        let subpasses = [subpass];
        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses);

        let render_pass = unsafe { self.device.create_render_pass(&info, None)? };
        Ok(RawRenderPass(render_pass.as_raw()))
    }

    unsafe fn destroy_render_pass(&self, render_pass: RawRenderPass) {
        unsafe {
            self.device
                .destroy_render_pass(vk::RenderPass::from_raw(render_pass.0), None);
        }
    }

    fn create_framebuffer(
        &self,
        descriptor: &RawFramebufferDescriptor<'_>,
    ) -> Result<RawFramebuffer, BackendError> {
        let views = {
            let tables = self.tables.lock();
            descriptor
                .attachments
                .iter()
                .map(|texture| {
                    tables
                        .textures
                        .get(&texture.0)
                        .map(TextureEntry::attachment_view)
                        .filter(|view| *view != vk::ImageView::null())
                        .ok_or(BackendError::Unsupported("framebuffer attachment without view"))
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        let info = vk::FramebufferCreateInfo::default()
            .render_pass(vk::RenderPass::from_raw(descriptor.render_pass.0))
            .attachments(&views)
            .width(descriptor.width)
            .height(descriptor.height)
            .layers(descriptor.layers);

        let framebuffer = unsafe { self.device.create_framebuffer(&info, None)? };
        Ok(RawFramebuffer(framebuffer.as_raw()))
    }

    unsafe fn destroy_framebuffer(&self, framebuffer: RawFramebuffer) {
        unsafe {
            self.device
                .destroy_framebuffer(vk::Framebuffer::from_raw(framebuffer.0), None);
        }
    }

    fn create_graphics_pipeline(
        &self,
        descriptor: &RawGraphicsPipelineDescriptor<'_>,
    ) -> Result<RawPipeline, BackendError> {
        let _span = trace_span!("VulkanDriver::create_graphics_pipeline").entered();

        let vertex_entry = entry_point(descriptor.vertex.1)?;
        let fragment_entry = descriptor
            .fragment
            .map(|(_, name)| entry_point(name))
            .transpose()?;

        let mut stages = vec![vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vk::ShaderModule::from_raw(descriptor.vertex.0 .0))
            .name(&vertex_entry)];
        if let (Some((module, _)), Some(name)) = (descriptor.fragment, &fragment_entry) {
            stages.push(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::FRAGMENT)
                    .module(vk::ShaderModule::from_raw(module.0))
                    .name(name),
            );
        }

        let bindings: Vec<_> = descriptor
            .vertex_buffers
            .iter()
            .enumerate()
            .map(|(binding, layout)| {
                vk::VertexInputBindingDescription::default()
                    .binding(binding as u32)
                    .stride(layout.stride)
                    .input_rate(layout.step_mode.into())
            })
            .collect();
        let attributes: Vec<_> = descriptor
            .vertex_buffers
            .iter()
            .enumerate()
            .flat_map(|(binding, layout)| {
                layout.attributes.iter().map(move |attribute| {
                    vk::VertexInputAttributeDescription::default()
                        .location(attribute.location)
                        .binding(binding as u32)
                        .format(attribute.format.into())
                        .offset(attribute.offset)
                })
            })
            .collect();

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(descriptor.topology.into())
            .primitive_restart_enable(false);

        // Viewport and scissors are dynamic, only the counts matter.
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_bias_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(convert::cull_mode(descriptor.cull_mode))
            .front_face(descriptor.front_face.into());

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::from_raw(descriptor.sample_count.max(1)));

        let depth_stencil_state = descriptor.depth_stencil.map(|state| {
            vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(true)
                .depth_write_enable(state.depth_write_enabled)
                .depth_compare_op(state.depth_compare.into())
                .depth_bounds_test_enable(false)
                .stencil_test_enable(false)
        });

        let blend_attachments: Vec<_> = descriptor
            .color_targets
            .iter()
            .map(|target| {
                let attachment = vk::PipelineColorBlendAttachmentState::default()
                    .color_write_mask(vk::ColorComponentFlags::RGBA);
                match target.blend {
                    Some(blend) => attachment
                        .blend_enable(true)
                        .src_color_blend_factor(blend.color.src_factor.into())
                        .dst_color_blend_factor(blend.color.dst_factor.into())
                        .color_blend_op(blend.color.operation.into())
                        .src_alpha_blend_factor(blend.alpha.src_factor.into())
                        .dst_alpha_blend_factor(blend.alpha.dst_factor.into())
                        .alpha_blend_op(blend.alpha.operation.into()),
                    None => attachment.blend_enable(false),
                }
            })
            .collect();

        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&blend_attachments)
            .blend_constants([0.0, 0.0, 0.0, 0.0]);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut tables = self.tables.lock();
        let (layout, sets) = self.acquire_layout(&mut tables, descriptor.layout)?;

        let mut info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(vk::RenderPass::from_raw(descriptor.render_pass.0))
            .subpass(0);
        if let Some(state) = &depth_stencil_state {
            info = info.depth_stencil_state(state);
        }

        let pipeline = match unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        } {
            Ok(pipelines) => pipelines[0],
            Err((_, err)) => {
                unsafe { self.release_layout(&mut tables, descriptor.layout) };
                return Err(err.into());
            }
        };

        tables.pipelines.insert(
            pipeline.as_raw(),
            PipelineEntry {
                key: descriptor.layout.clone(),
                layout,
                sets,
            },
        );

        Ok(RawPipeline(pipeline.as_raw()))
    }

    fn create_compute_pipeline(
        &self,
        descriptor: &RawComputePipelineDescriptor<'_>,
    ) -> Result<RawPipeline, BackendError> {
        let _span = trace_span!("VulkanDriver::create_compute_pipeline").entered();

        let entry = entry_point(descriptor.shader.1)?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(vk::ShaderModule::from_raw(descriptor.shader.0 .0))
            .name(&entry);

        let mut tables = self.tables.lock();
        let (layout, sets) = self.acquire_layout(&mut tables, descriptor.layout)?;

        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let pipeline = match unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        } {
            Ok(pipelines) => pipelines[0],
            Err((_, err)) => {
                unsafe { self.release_layout(&mut tables, descriptor.layout) };
                return Err(err.into());
            }
        };

        tables.pipelines.insert(
            pipeline.as_raw(),
            PipelineEntry {
                key: descriptor.layout.clone(),
                layout,
                sets,
            },
        );

        Ok(RawPipeline(pipeline.as_raw()))
    }

    unsafe fn destroy_pipeline(&self, pipeline: RawPipeline) {
        let mut tables = self.tables.lock();

        unsafe {
            self.device
                .destroy_pipeline(vk::Pipeline::from_raw(pipeline.0), None);
        }

        if let Some(entry) = tables.pipelines.remove(&pipeline.0) {
            // SAFETY: The pipeline was not in use, so neither are sets bound with its layout.
            unsafe {
                self.release_layout(&mut tables, &entry.key);
            }
        }
    }

    fn create_command_pool(&self, family: u32) -> Result<RawCommandPool, BackendError> {
        let capabilities = self.queue_slot(RawQueue(u64::from(family)))?.capabilities;

        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(family);

        let pool = unsafe { self.device.create_command_pool(&info, None)? };
        self.tables.lock().pools.insert(
            pool.as_raw(),
            PoolEntry {
                capabilities,
                buffers: Vec::new(),
            },
        );

        Ok(RawCommandPool(pool.as_raw()))
    }

    unsafe fn destroy_command_pool(&self, pool: RawCommandPool) {
        let mut tables = self.tables.lock();
        if let Some(entry) = tables.pools.remove(&pool.0) {
            for buffer in entry.buffers {
                tables.command_buffers.remove(&buffer);
            }
        }

        // Destroying the pool frees all of its command buffers.
        unsafe {
            self.device
                .destroy_command_pool(vk::CommandPool::from_raw(pool.0), None);
        }
    }

    fn allocate_command_buffer(
        &self,
        pool: RawCommandPool,
        level: CommandBufferLevel,
    ) -> Result<RawCommandBuffer, BackendError> {
        let mut tables = self.tables.lock();
        let Some(entry) = tables.pools.get_mut(&pool.0) else {
            return Err(BackendError::Unexpected(format!("unknown command pool {:?}", pool)));
        };

        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(vk::CommandPool::from_raw(pool.0))
            .level(match level {
                CommandBufferLevel::Primary => vk::CommandBufferLevel::PRIMARY,
                CommandBufferLevel::Secondary => vk::CommandBufferLevel::SECONDARY,
            })
            .command_buffer_count(1);
        let buffer = unsafe { self.device.allocate_command_buffers(&info)?[0] };

        let raw = buffer.as_raw();
        entry.buffers.push(raw);
        let capabilities = entry.capabilities;
        tables.command_buffers.insert(
            raw,
            CommandBufferEntry {
                level,
                capabilities,
            },
        );

        Ok(RawCommandBuffer(raw))
    }

    unsafe fn reset_command_buffer(&self, buffer: RawCommandBuffer) -> Result<(), BackendError> {
        unsafe {
            self.device.reset_command_buffer(
                vk::CommandBuffer::from_raw(buffer.0),
                vk::CommandBufferResetFlags::empty(),
            )?;
        }

        Ok(())
    }

    unsafe fn begin_command_buffer(&self, buffer: RawCommandBuffer) -> Result<(), BackendError> {
        // Secondary buffers are only executed outside of render passes and
        // inherit nothing.
        let inheritance = vk::CommandBufferInheritanceInfo::default();
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .inheritance_info(&inheritance);

        unsafe {
            self.device
                .begin_command_buffer(vk::CommandBuffer::from_raw(buffer.0), &info)?;
        }

        Ok(())
    }

    unsafe fn end_command_buffer(&self, buffer: RawCommandBuffer) -> Result<(), BackendError> {
        unsafe {
            self.device
                .end_command_buffer(vk::CommandBuffer::from_raw(buffer.0))?;
        }

        Ok(())
    }

    unsafe fn record(&self, buffer: RawCommandBuffer, command: &Command) {
        let cmd = vk::CommandBuffer::from_raw(buffer.0);
        let mut tables = self.tables.lock();
        let Some(entry) = tables.command_buffers.get(&buffer.0).copied() else {
            tracing::error!("record into unknown command buffer {:?}", buffer);
            return;
        };

        match command {
            Command::PipelineBarrier { buffers, textures } => {
                self.record_barrier(&tables, cmd, entry.capabilities, buffers, textures);
            }
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let region = vk::BufferCopy {
                    src_offset: *src_offset,
                    dst_offset: *dst_offset,
                    size: *size,
                };

                unsafe {
                    self.device.cmd_copy_buffer(
                        cmd,
                        vk::Buffer::from_raw(src.0),
                        vk::Buffer::from_raw(dst.0),
                        &[region],
                    );
                }
            }
            Command::CopyBufferToTexture {
                src,
                src_offset,
                layout,
                dst,
                format,
                mip_level,
                array_layer,
                extent,
            } => {
                let Some(texture) = tables.textures.get(&dst.0) else {
                    tracing::error!("copy into unknown texture {:?}", dst);
                    return;
                };

                let aspect_mask = if format.is_depth() {
                    vk::ImageAspectFlags::DEPTH
                } else {
                    vk::ImageAspectFlags::COLOR
                };

                let region = vk::BufferImageCopy::default()
                    .buffer_offset(*src_offset)
                    .buffer_row_length(layout.bytes_per_row / format.bytes_per_texel())
                    .buffer_image_height(layout.rows_per_image)
                    .image_subresource(
                        vk::ImageSubresourceLayers::default()
                            .aspect_mask(aspect_mask)
                            .mip_level(*mip_level)
                            .base_array_layer(*array_layer)
                            .layer_count(1),
                    )
                    .image_offset(vk::Offset3D::default())
                    .image_extent(vk::Extent3D {
                        width: extent.x,
                        height: extent.y,
                        depth: extent.z,
                    });

                unsafe {
                    self.device.cmd_copy_buffer_to_image(
                        cmd,
                        vk::Buffer::from_raw(src.0),
                        texture.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
            }
            Command::ClearTexture {
                texture,
                format,
                value,
            } => {
                let Some(entry) = tables.textures.get(&texture.0) else {
                    tracing::error!("clear of unknown texture {:?}", texture);
                    return;
                };

                let range = vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect(*format))
                    .base_mip_level(0)
                    .level_count(vk::REMAINING_MIP_LEVELS)
                    .base_array_layer(0)
                    .layer_count(vk::REMAINING_ARRAY_LAYERS);

                match value {
                    ClearValue::Color(color) => unsafe {
                        self.device.cmd_clear_color_image(
                            cmd,
                            entry.image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &vk::ClearColorValue { float32: *color },
                            &[range],
                        );
                    },
                    ClearValue::DepthStencil { depth, stencil } => unsafe {
                        self.device.cmd_clear_depth_stencil_image(
                            cmd,
                            entry.image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &vk::ClearDepthStencilValue {
                                depth: *depth,
                                stencil: *stencil,
                            },
                            &[range],
                        );
                    },
                }
            }
            Command::BeginRenderPass {
                render_pass,
                framebuffer,
                width,
                height,
                clear_values,
            } => {
                let clear_values: Vec<_> = clear_values
                    .iter()
                    .map(|value| match value {
                        ClearValue::Color(color) => vk::ClearValue {
                            color: vk::ClearColorValue { float32: *color },
                        },
                        ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
                            depth_stencil: vk::ClearDepthStencilValue {
                                depth: *depth,
                                stencil: *stencil,
                            },
                        },
                    })
                    .collect();

                let area = vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: vk::Extent2D {
                        width: *width,
                        height: *height,
                    },
                };

                let info = vk::RenderPassBeginInfo::default()
                    .render_pass(vk::RenderPass::from_raw(render_pass.0))
                    .framebuffer(vk::Framebuffer::from_raw(framebuffer.0))
                    .render_area(area)
                    .clear_values(&clear_values);

                // Pipelines are created with dynamic viewport and scissors, so both
                // must be set before any draw.
                let viewport = vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: *width as f32,
                    height: *height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                };

                unsafe {
                    self.device
                        .cmd_begin_render_pass(cmd, &info, vk::SubpassContents::INLINE);
                    self.device.cmd_set_viewport(cmd, 0, &[viewport]);
                    self.device.cmd_set_scissor(cmd, 0, &[area]);
                }
            }
            Command::EndRenderPass => unsafe {
                self.device.cmd_end_render_pass(cmd);
            },
            Command::BindPipeline {
                pipeline,
                bind_point: point,
            } => unsafe {
                self.device.cmd_bind_pipeline(
                    cmd,
                    bind_point(*point),
                    vk::Pipeline::from_raw(pipeline.0),
                );
            },
            Command::BindDescriptorTable {
                pipeline,
                bind_point: point,
                kind,
                heap,
                offset,
            } => {
                let Tables {
                    heaps,
                    textures,
                    pipelines,
                    ..
                } = &mut *tables;

                let Some(pipeline) = pipelines.get(&pipeline.0) else {
                    tracing::error!("bind with unknown pipeline {:?}", pipeline);
                    return;
                };
                let Some(heap) = heaps.get_mut(&heap.0) else {
                    tracing::error!("bind of unknown descriptor heap {:?}", heap);
                    return;
                };

                let (set_index, len) = match kind {
                    HeapKind::Resource => (0, pipeline.key.resource_table.len() as u32),
                    HeapKind::Sampler => (1, pipeline.key.sampler_table),
                };

                let set = heap.set(
                    &self.device,
                    pipeline.sets[set_index as usize],
                    *offset,
                    len,
                    |texture| {
                        textures
                            .get(&texture.0)
                            .map_or(vk::ImageView::null(), |entry| entry.view)
                    },
                );

                match set {
                    Ok(set) => unsafe {
                        self.device.cmd_bind_descriptor_sets(
                            cmd,
                            bind_point(*point),
                            pipeline.layout,
                            set_index,
                            &[set],
                            &[],
                        );
                    },
                    Err(err) => {
                        tracing::error!("failed to allocate descriptor set: {:?}", err);
                    }
                }
            }
            Command::BindVertexBuffer {
                slot,
                buffer,
                offset,
            } => unsafe {
                self.device.cmd_bind_vertex_buffers(
                    cmd,
                    *slot,
                    &[vk::Buffer::from_raw(buffer.0)],
                    &[*offset],
                );
            },
            Command::BindIndexBuffer {
                buffer,
                offset,
                format,
            } => unsafe {
                self.device.cmd_bind_index_buffer(
                    cmd,
                    vk::Buffer::from_raw(buffer.0),
                    *offset,
                    (*format).into(),
                );
            },
            Command::PushConstants {
                pipeline,
                offset,
                data,
            } => {
                let Some(pipeline) = tables.pipelines.get(&pipeline.0) else {
                    tracing::error!("push constants with unknown pipeline {:?}", pipeline);
                    return;
                };

                unsafe {
                    self.device.cmd_push_constants(
                        cmd,
                        pipeline.layout,
                        vk::ShaderStageFlags::ALL,
                        *offset,
                        data,
                    );
                }
            }
            Command::Draw {
                vertices,
                instances,
            } => unsafe {
                self.device.cmd_draw(
                    cmd,
                    vertices.len() as u32,
                    instances.len() as u32,
                    vertices.start,
                    instances.start,
                );
            },
            Command::DrawIndexed {
                indices,
                base_vertex,
                instances,
            } => unsafe {
                self.device.cmd_draw_indexed(
                    cmd,
                    indices.len() as u32,
                    instances.len() as u32,
                    indices.start,
                    *base_vertex,
                    instances.start,
                );
            },
            Command::Dispatch { x, y, z } => unsafe {
                self.device.cmd_dispatch(cmd, *x, *y, *z);
            },
            Command::ExecuteSecondary { buffers } => {
                debug_assert_eq!(entry.level, CommandBufferLevel::Primary);

                let buffers: Vec<_> = buffers
                    .iter()
                    .map(|buffer| vk::CommandBuffer::from_raw(buffer.0))
                    .collect();
                unsafe {
                    self.device.cmd_execute_commands(cmd, &buffers);
                }
            }
            Command::BeginDebugMarker { name } => {
                if let (Some(debug_utils), Ok(name)) = (&self.debug_utils, CString::new(name.as_str()))
                {
                    let label = vk::DebugUtilsLabelEXT::default().label_name(&name);
                    unsafe {
                        debug_utils.cmd_begin_debug_utils_label(cmd, &label);
                    }
                }
            }
            Command::EndDebugMarker => {
                if let Some(debug_utils) = &self.debug_utils {
                    unsafe {
                        debug_utils.cmd_end_debug_utils_label(cmd);
                    }
                }
            }
        }
    }

    fn submit(&self, queue: RawQueue, batch: &SubmitBatch<'_>) -> Result<(), BackendError> {
        let _span = trace_span!("VulkanDriver::submit").entered();

        let slot = self.queue_slot(queue)?;

        let buffers: Vec<_> = batch
            .command_buffers
            .iter()
            .map(|buffer| vk::CommandBuffer::from_raw(buffer.0))
            .collect();

        let mut wait_semaphores = Vec::with_capacity(batch.waits.len());
        let mut wait_values = Vec::with_capacity(batch.waits.len());
        for (other, value) in batch.waits {
            let other = self.queue_slot(*other)?;
            // Work on the same queue is already ordered.
            if other.family == slot.family {
                continue;
            }

            wait_semaphores.push(other.timeline);
            wait_values.push(*value);
        }
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];

        let signal_semaphores = [slot.timeline];
        let signal_values = [batch.signal];

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        let mut submitted = slot.submitted.lock();
        debug_assert!(batch.signal > *submitted, "timeline values must increase");

        unsafe {
            self.device
                .queue_submit(slot.queue, &[info], vk::Fence::null())?;
        }

        *submitted = batch.signal;
        Ok(())
    }

    fn completed_value(&self, queue: RawQueue) -> Result<u64, BackendError> {
        let slot = self.queue_slot(queue)?;
        let value = unsafe { self.device.get_semaphore_counter_value(slot.timeline)? };

        self.free_retired_sets(&mut self.tables.lock());
        Ok(value)
    }

    fn wait(&self, queue: RawQueue, value: u64) -> Result<(), BackendError> {
        let slot = self.queue_slot(queue)?;

        let semaphores = [slot.timeline];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);

        unsafe { self.device.wait_semaphores(&info, u64::MAX)? };
        Ok(())
    }

    fn wait_idle(&self, queue: RawQueue) -> Result<(), BackendError> {
        let slot = self.queue_slot(queue)?;

        let _submitted = slot.submitted.lock();
        unsafe { self.device.queue_wait_idle(slot.queue)? };
        Ok(())
    }

    fn create_swapchain(
        &self,
        surface: RawSurface,
        config: &SwapchainConfig,
        old: Option<RawSwapchain>,
    ) -> Result<(RawSwapchain, Vec<RawTexture>), SurfaceError> {
        let _span = trace_span!("VulkanDriver::create_swapchain").entered();

        let (Some(surface_fns), Some(swapchain_fns)) = (&self.surface_fns, &self.swapchain_fns)
        else {
            return Err(SurfaceError::Lost);
        };
        let surface = vk::SurfaceKHR::from_raw(surface.0);

        let Some(graphics) = self
            .queues
            .iter()
            .find(|slot| slot.capabilities.contains(QueueCapabilities::GRAPHICS))
        else {
            return Err(SurfaceError::Lost);
        };

        let supported = unsafe {
            surface_fns
                .get_physical_device_surface_support(self.physical_device, graphics.family, surface)
                .map_err(surface_error)?
        };
        if !supported {
            return Err(SurfaceError::Lost);
        }

        let (caps, formats, present_modes) = unsafe {
            (
                surface_fns
                    .get_physical_device_surface_capabilities(self.physical_device, surface)
                    .map_err(surface_error)?,
                surface_fns
                    .get_physical_device_surface_formats(self.physical_device, surface)
                    .map_err(surface_error)?,
                surface_fns
                    .get_physical_device_surface_present_modes(self.physical_device, surface)
                    .map_err(surface_error)?,
            )
        };

        let format = self.format(config.format);
        let Some(surface_format) = formats.iter().find(|f| f.format == format) else {
            panic!("surface does not support {:?}", config.format);
        };

        let mut present_mode = config.effective_present_mode().into();
        if !present_modes.contains(&present_mode) {
            tracing::warn!(
                "surface does not support {:?}, falling back to FIFO",
                present_mode
            );
            present_mode = vk::PresentModeKHR::FIFO;
        }

        let extent = vk::Extent2D {
            width: config
                .extent
                .x
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: config
                .extent
                .y
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        };
        // A minimized window has no extent.
        if extent.width == 0 || extent.height == 0 {
            return Err(SurfaceError::OutOfDate);
        }
        if extent.width != config.extent.x || extent.height != config.extent.y {
            tracing::warn!(
                "swapchain extent {}x{} clamped to {}x{}",
                config.extent.x,
                config.extent.y,
                extent.width,
                extent.height
            );
        }

        let max_images = if caps.max_image_count == 0 {
            u32::MAX
        } else {
            caps.max_image_count
        };
        let image_count = config.image_count.clamp(caps.min_image_count, max_images);

        let composite_alpha = if caps
            .supported_composite_alpha
            .contains(vk::CompositeAlphaFlagsKHR::OPAQUE)
        {
            vk::CompositeAlphaFlagsKHR::OPAQUE
        } else {
            vk::CompositeAlphaFlagsKHR::from_raw(
                1 << caps.supported_composite_alpha.as_raw().trailing_zeros(),
            )
        };

        // `COLOR_ATTACHMENT` is always supported.
        let mut usage = vk::ImageUsageFlags::COLOR_ATTACHMENT;
        if caps
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::TRANSFER_DST)
        {
            usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }

        let old_swapchain = old
            .map(|old| vk::SwapchainKHR::from_raw(old.0))
            .unwrap_or_default();

        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            // Always valid since `maxImageArrayLayers` is at least one.
            .image_array_layers(1)
            .image_usage(usage)
            .image_sharing_mode(self.sharing_mode())
            .queue_family_indices(&self.sharing)
            .composite_alpha(composite_alpha)
            .pre_transform(caps.current_transform)
            .present_mode(present_mode)
            // Pixels that are not visible are never read back.
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe {
            swapchain_fns
                .create_swapchain(&info, None)
                .map_err(surface_error)?
        };
        let images = match unsafe { swapchain_fns.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(err) => {
                unsafe { swapchain_fns.destroy_swapchain(swapchain, None) };
                return Err(surface_error(err));
            }
        };

        let descriptor = TextureDescriptor {
            size: UVec3::new(extent.width, extent.height, 1),
            dimension: TextureDimension::D2,
            mip_levels: 1,
            array_layers: 1,
            format: config.format,
            usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TRANSFER_DST,
        };

        let mut entry = SwapchainEntry {
            swapchain,
            images: Vec::with_capacity(images.len()),
            fence: vk::Fence::null(),
            present_semaphores: Vec::with_capacity(images.len()),
        };
        let mut views = Vec::with_capacity(images.len());

        let res: Result<(), vk::Result> = (|| {
            entry.fence = unsafe {
                self.device
                    .create_fence(&vk::FenceCreateInfo::default(), None)?
            };

            for image in &images {
                views.push(self.create_view(
                    *image,
                    &descriptor,
                    vk::ImageAspectFlags::COLOR,
                    1,
                )?);
                entry.images.push(*image);
                entry.present_semaphores.push(unsafe {
                    self.device
                        .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
                });
            }

            Ok(())
        })();

        if let Err(err) = res {
            unsafe {
                for view in views {
                    self.device.destroy_image_view(view, None);
                }
                self.destroy_swapchain_entry(entry);
            }
            return Err(surface_error(err));
        }

        let mut tables = self.tables.lock();
        for (image, view) in images.iter().zip(views) {
            tables.textures.insert(
                image.as_raw(),
                TextureEntry {
                    image: *image,
                    view,
                    attachment_view: None,
                    descriptor,
                    swapchain: true,
                },
            );
        }
        tables.swapchains.insert(swapchain.as_raw(), entry);

        tracing::debug!(
            "created swapchain with {} images ({:?}, {:?})",
            images.len(),
            surface_format.format,
            present_mode
        );

        let textures = images
            .iter()
            .map(|image| RawTexture(image.as_raw()))
            .collect();
        Ok((RawSwapchain(swapchain.as_raw()), textures))
    }

    unsafe fn destroy_swapchain(&self, swapchain: RawSwapchain) {
        let mut tables = self.tables.lock();
        let Some(entry) = tables.swapchains.remove(&swapchain.0) else {
            return;
        };

        for image in &entry.images {
            if let Some(texture) = tables.textures.remove(&image.as_raw()) {
                unsafe {
                    self.device.destroy_image_view(texture.view, None);
                }
            }
        }

        unsafe {
            self.destroy_swapchain_entry(entry);
        }
    }

    fn acquire_next_image(&self, swapchain: RawSwapchain) -> Result<AcquiredImage, SurfaceError> {
        let _span = trace_span!("VulkanDriver::acquire_next_image").entered();

        let Some(swapchain_fns) = &self.swapchain_fns else {
            return Err(SurfaceError::Lost);
        };

        let fence = match self.tables.lock().swapchains.get(&swapchain.0) {
            Some(entry) => entry.fence,
            None => return Err(SurfaceError::Lost),
        };

        let (index, suboptimal) = unsafe {
            swapchain_fns
                .acquire_next_image(
                    vk::SwapchainKHR::from_raw(swapchain.0),
                    u64::MAX,
                    vk::Semaphore::null(),
                    fence,
                )
                .map_err(surface_error)?
        };

        // The image may still be read by the presentation engine until the fence is
        // signaled.
        unsafe {
            self.device
                .wait_for_fences(&[fence], true, u64::MAX)
                .map_err(surface_error)?;
            self.device.reset_fences(&[fence]).map_err(surface_error)?;
        }

        Ok(AcquiredImage { index, suboptimal })
    }

    fn present(
        &self,
        queue: RawQueue,
        swapchain: RawSwapchain,
        index: u32,
    ) -> Result<(), SurfaceError> {
        let _span = trace_span!("VulkanDriver::present").entered();

        let Some(swapchain_fns) = &self.swapchain_fns else {
            return Err(SurfaceError::Lost);
        };
        let slot = self.queue_slot(queue).map_err(|_| SurfaceError::Lost)?;

        let semaphore = match self.tables.lock().swapchains.get(&swapchain.0) {
            Some(entry) => match entry.present_semaphores.get(index as usize) {
                Some(semaphore) => *semaphore,
                None => return Err(SurfaceError::Lost),
            },
            None => return Err(SurfaceError::Lost),
        };

        let submitted = slot.submitted.lock();

        // Presentation only waits for binary semaphores. Bridge the last timeline value
        // of the queue into the semaphore of the image.
        let wait_semaphores = [slot.timeline];
        let wait_values = [*submitted];
        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let signal_semaphores = [semaphore];
        let signal_values = [0];

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.device
                .queue_submit(slot.queue, &[info], vk::Fence::null())
                .map_err(surface_error)?;
        }

        let swapchains = [vk::SwapchainKHR::from_raw(swapchain.0)];
        let image_indices = [index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        // A suboptimal swapchain is reported on the next acquire.
        unsafe {
            swapchain_fns
                .queue_present(slot.queue, &info)
                .map_err(surface_error)?;
        }

        Ok(())
    }

    fn set_debug_name(&self, object: RawObject, name: &str) {
        match object {
            RawObject::Buffer(buffer) => self.name_object(vk::Buffer::from_raw(buffer.0), name),
            RawObject::Texture(texture) => self.name_object(vk::Image::from_raw(texture.0), name),
            RawObject::Sampler(sampler) => {
                self.name_object(vk::Sampler::from_raw(sampler.0), name)
            }
            RawObject::Pipeline(pipeline) => {
                self.name_object(vk::Pipeline::from_raw(pipeline.0), name)
            }
        }
    }
}

impl VulkanDriver {
    /// # Safety
    ///
    /// The swapchain must not be in use and its image views must be destroyed.
    unsafe fn destroy_swapchain_entry(&self, entry: SwapchainEntry) {
        unsafe {
            for semaphore in entry.present_semaphores {
                self.device.destroy_semaphore(semaphore, None);
            }
            if entry.fence != vk::Fence::null() {
                self.device.destroy_fence(entry.fence, None);
            }
            if let Some(swapchain_fns) = &self.swapchain_fns {
                swapchain_fns.destroy_swapchain(entry.swapchain, None);
            }
        }
    }
}

impl std::fmt::Debug for VulkanDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDriver")
            .field("adapter", &self.adapter)
            .field("families", &self.families)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        if let Err(err) = unsafe { self.device.device_wait_idle() } {
            tracing::error!("failed to wait for device before destroying it: {:?}", err);
        }

        let tables = std::mem::take(self.tables.get_mut());

        if !tables.memories.is_empty() || !tables.textures.is_empty() {
            tracing::warn!(
                "destroying device with {} memory blocks and {} textures alive",
                tables.memories.len(),
                tables.textures.len()
            );
        }

        unsafe {
            for (_, entry) in tables.swapchains {
                for image in &entry.images {
                    if let Some(texture) = tables.textures.get(&image.as_raw()) {
                        self.device.destroy_image_view(texture.view, None);
                    }
                }
                self.destroy_swapchain_entry(entry);
            }

            for texture in tables.textures.values().filter(|texture| !texture.swapchain) {
                if let Some(view) = texture.attachment_view {
                    self.device.destroy_image_view(view, None);
                }
                if texture.view != vk::ImageView::null() {
                    self.device.destroy_image_view(texture.view, None);
                }
                self.device.destroy_image(texture.image, None);
            }

            for memory in tables.memories.keys() {
                self.device
                    .free_memory(vk::DeviceMemory::from_raw(*memory), None);
            }

            if let Some(surface_fns) = &self.surface_fns {
                for surface in tables.surfaces {
                    surface_fns.destroy_surface(vk::SurfaceKHR::from_raw(surface), None);
                }
            }

            for (_, heap) in tables.heaps {
                heap.destroy(&self.device);
            }

            for (_, entry) in tables.layouts {
                self.device.destroy_pipeline_layout(entry.layout, None);
                self.destroy_set_layouts(&entry.sets);
            }

            for pool in tables.pools.keys() {
                self.device
                    .destroy_command_pool(vk::CommandPool::from_raw(*pool), None);
            }

            for slot in &self.queues {
                self.device.destroy_semaphore(slot.timeline, None);
            }

            self.device.destroy_device(None);
        }
    }
}

extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    typ: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _: *mut c_void,
) -> vk::Bool32 {
    let data = unsafe { *data };
    let message = match unsafe { data.message_as_c_str() } {
        Some(msg) => msg.to_string_lossy(),
        None => Cow::Borrowed("(no message)"),
    };

    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!("{:?} {}", typ, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!("{:?} {}", typ, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::debug!("{:?} {}", typ, message);
        }
        _ => {
            tracing::trace!("{:?} {}", typ, message);
        }
    }

    // The application should always return `VK_FALSE`.
    vk::FALSE
}
