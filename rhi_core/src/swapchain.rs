//! Presentation to a surface.

use std::sync::Arc;

use glam::{UVec2, UVec3};
use rhi_tracing::trace_span;

use crate::backend::{RawSurface, RawSwapchain, RawTexture, SurfaceError, TextureFormat};
use crate::cache::FramebufferCache;
use crate::device::DeviceShared;
use crate::error::{Error, LimitError};
use crate::pool::CommandContext;
use crate::queue::QueueType;
use crate::resource::{Texture, TextureDescriptor, TextureDimension, TextureUsage};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PresentMode {
    /// Wait for the vertical blank, queueing frames.
    #[default]
    Fifo,
    /// Wait for the vertical blank, replacing the queued frame.
    Mailbox,
    /// Present immediately. May tear.
    Immediate,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SwapchainConfig {
    pub extent: UVec2,
    pub image_count: u32,
    pub format: TextureFormat,
    pub present_mode: PresentMode,
    /// Forces [`PresentMode::Fifo`].
    pub vsync: bool,
}

impl SwapchainConfig {
    /// Returns the present mode after applying `vsync`.
    pub fn effective_present_mode(&self) -> PresentMode {
        if self.vsync {
            PresentMode::Fifo
        } else {
            self.present_mode
        }
    }
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            extent: UVec2::new(1280, 720),
            image_count: 3,
            format: TextureFormat::Bgra8UnormSrgb,
            present_mode: PresentMode::Fifo,
            vsync: true,
        }
    }
}

/// An acquired swapchain image.
#[derive(Clone, Debug)]
pub struct SwapchainFrame {
    pub index: u32,
    /// The swapchain no longer matches the surface exactly. Presenting still works.
    pub suboptimal: bool,
    pub texture: Texture,
}

/// A swapchain on a surface.
///
/// An out of date or lost surface is recovered from by waiting for the device to become idle
/// and recreating the swapchain. Images of a previous swapchain must not be used after it was
/// recreated.
#[derive(Debug)]
pub struct Swapchain {
    surface: RawSurface,
    raw: RawSwapchain,
    config: SwapchainConfig,
    images: Vec<Texture>,
    framebuffers: Arc<FramebufferCache>,
    shared: Arc<DeviceShared>,
}

impl Swapchain {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        framebuffers: Arc<FramebufferCache>,
        surface: RawSurface,
        config: SwapchainConfig,
    ) -> Result<Self, Error> {
        validate(&config)?;

        let (raw, images) = shared
            .driver
            .create_swapchain(surface, &config, None)
            .map_err(surface_error)?;

        tracing::debug!(
            "created swapchain with {} images of {}x{} {:?}",
            images.len(),
            config.extent.x,
            config.extent.y,
            config.format
        );

        let images = wrap_images(&shared, &config, &images);
        Ok(Self {
            surface,
            raw,
            config,
            images,
            framebuffers,
            shared,
        })
    }

    pub fn config(&self) -> &SwapchainConfig {
        &self.config
    }

    pub fn extent(&self) -> UVec2 {
        self.config.extent
    }

    pub fn images(&self) -> &[Texture] {
        &self.images
    }

    /// Acquires the next image.
    ///
    /// If the surface is out of date or lost the swapchain is recreated and the acquisition
    /// retried once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Surface`] if the retry fails as well.
    pub fn acquire(&mut self) -> Result<SwapchainFrame, Error> {
        let _span = trace_span!("Swapchain::acquire").entered();

        let image = match self.shared.driver.acquire_next_image(self.raw) {
            Ok(image) => image,
            Err(SurfaceError::DeviceLost) => return Err(Error::DeviceLost),
            Err(err) => {
                tracing::warn!("failed to acquire swapchain image: {}", err);
                self.recreate()?;
                self.shared
                    .driver
                    .acquire_next_image(self.raw)
                    .map_err(surface_error)?
            }
        };

        let Some(texture) = self.images.get(image.index as usize) else {
            panic!("driver returned invalid swapchain image index {}", image.index);
        };

        Ok(SwapchainFrame {
            index: image.index,
            suboptimal: image.suboptimal,
            texture: texture.clone(),
        })
    }

    /// Transitions the image of `frame` for presentation, submits `ctx` and presents the
    /// image.
    ///
    /// An out of date or lost surface recreates the swapchain. The frame is dropped in that
    /// case.
    ///
    /// # Panics
    ///
    /// Panics if `ctx` does not record for the graphics queue.
    pub fn present(&mut self, ctx: &mut CommandContext, frame: SwapchainFrame) -> Result<(), Error> {
        let _span = trace_span!("Swapchain::present").entered();

        assert_eq!(
            ctx.queue().ty(),
            QueueType::Graphics,
            "swapchain images must be presented from the graphics queue"
        );

        ctx.primary()?.transition_for_present(&frame.texture);
        ctx.submit()?;

        match self
            .shared
            .driver
            .present(ctx.queue().raw(), self.raw, frame.index)
        {
            Ok(()) => Ok(()),
            Err(SurfaceError::DeviceLost) => Err(Error::DeviceLost),
            Err(err) => {
                tracing::warn!("failed to present swapchain image: {}", err);
                self.recreate()
            }
        }
    }

    /// Recreates the swapchain with a new extent.
    pub fn resize(&mut self, extent: UVec2) -> Result<(), Error> {
        let config = SwapchainConfig {
            extent,
            ..self.config
        };
        validate(&config)?;

        self.config = config;
        self.recreate()
    }

    fn recreate(&mut self) -> Result<(), Error> {
        let _span = trace_span!("Swapchain::recreate").entered();

        self.shared.queues.wait_idle()?;

        let invalidated: usize = self
            .images
            .iter()
            .map(|image| self.framebuffers.invalidate_texture(image.id()))
            .sum();

        let (raw, images) = self
            .shared
            .driver
            .create_swapchain(self.surface, &self.config, Some(self.raw))
            .map_err(surface_error)?;

        let old = std::mem::replace(&mut self.raw, raw);
        self.images = wrap_images(&self.shared, &self.config, &images);

        // SAFETY: The device is idle and the framebuffers using the old images are dropped.
        unsafe {
            self.shared.driver.destroy_swapchain(old);
        }

        tracing::info!(
            "recreated swapchain with {}x{} extent ({} framebuffers invalidated)",
            self.config.extent.x,
            self.config.extent.y,
            invalidated
        );

        Ok(())
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if let Err(err) = self.shared.queues.wait_idle() {
            tracing::error!("failed to wait for device before destroying swapchain: {}", err);
        }

        for image in self.images.drain(..) {
            self.framebuffers.invalidate_texture(image.id());
        }

        // SAFETY: The device is idle.
        unsafe {
            self.shared.driver.destroy_swapchain(self.raw);
        }
    }
}

fn validate(config: &SwapchainConfig) -> Result<(), Error> {
    if config.extent.x == 0 || config.extent.y == 0 || config.image_count == 0 {
        return Err(LimitError::ZeroSized.into());
    }

    Ok(())
}

fn surface_error(err: SurfaceError) -> Error {
    match err {
        SurfaceError::DeviceLost => Error::DeviceLost,
        err => Error::Surface(err),
    }
}

fn wrap_images(
    shared: &Arc<DeviceShared>,
    config: &SwapchainConfig,
    images: &[RawTexture],
) -> Vec<Texture> {
    let descriptor = TextureDescriptor {
        size: UVec3::new(config.extent.x, config.extent.y, 1),
        dimension: TextureDimension::D2,
        mip_levels: 1,
        array_layers: 1,
        format: config.format,
        usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TRANSFER_DST,
    };

    images
        .iter()
        .enumerate()
        .map(|(index, raw)| {
            let texture = Texture::new(shared.clone(), *raw, &descriptor, None, false);
            texture.set_debug_name(&format!("swapchain image {}", index));
            texture
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use glam::UVec2;

    use crate::backend::null::{NullAdapter, NullDriver};
    use crate::backend::{LoadOp, StoreOp, SurfaceError};
    use crate::error::Error;
    use crate::queue::QueueType;
    use crate::render_pass::{ColorAttachment, FramebufferDescriptor};
    use crate::state::ResourceState;
    use crate::{Device, DeviceConfig};

    use super::{PresentMode, SwapchainConfig};

    fn device() -> (Arc<NullDriver>, Device) {
        let driver = Arc::new(NullDriver::new(NullAdapter::default()));
        let device = Device::with_driver(driver.clone(), DeviceConfig::default()).unwrap();
        (driver, device)
    }

    #[test]
    fn vsync_forces_fifo() {
        let config = SwapchainConfig {
            present_mode: PresentMode::Mailbox,
            vsync: true,
            ..Default::default()
        };
        assert_eq!(config.effective_present_mode(), PresentMode::Fifo);

        let config = SwapchainConfig {
            vsync: false,
            ..config
        };
        assert_eq!(config.effective_present_mode(), PresentMode::Mailbox);
    }

    #[test]
    fn acquire_and_present() {
        let (driver, device) = device();
        let surface = driver.create_surface();
        let mut swapchain = device
            .create_swapchain(surface, SwapchainConfig::default())
            .unwrap();
        assert_eq!(swapchain.images().len(), 3);

        let frame = swapchain.acquire().unwrap();
        assert!(frame.texture.is_swapchain_image());
        assert_eq!(frame.texture.state(), ResourceState::Undefined);

        let mut ctx = device.create_command_context(QueueType::Graphics).unwrap();
        let texture = frame.texture.clone();
        swapchain.present(&mut ctx, frame).unwrap();
        assert_eq!(texture.state(), ResourceState::Present);
        assert_eq!(driver.presented(), 1);
    }

    #[test]
    fn out_of_date_recreates_once() {
        let (driver, device) = device();
        let surface = driver.create_surface();
        let mut swapchain = device
            .create_swapchain(surface, SwapchainConfig::default())
            .unwrap();

        let old = swapchain.images()[0].clone();
        let framebuffer = device
            .create_framebuffer(&FramebufferDescriptor {
                colors: &[ColorAttachment {
                    texture: &old,
                    load_op: LoadOp::Clear,
                    store_op: StoreOp::Store,
                }],
                depth_stencil: None,
                layers: 1,
            })
            .unwrap();
        assert_eq!(device.cached_framebuffers(), 1);

        driver.invalidate_surface(surface, SurfaceError::OutOfDate, 1);
        let frame = swapchain.acquire().unwrap();
        assert_ne!(frame.texture, old);
        assert_eq!(device.cached_framebuffers(), 0);
        drop(framebuffer);
    }

    #[test]
    fn persistent_surface_loss_is_reported() {
        let (driver, device) = device();
        let surface = driver.create_surface();
        let mut swapchain = device
            .create_swapchain(surface, SwapchainConfig::default())
            .unwrap();

        driver.invalidate_surface(surface, SurfaceError::Lost, u32::MAX);
        assert_eq!(
            swapchain.acquire().unwrap_err(),
            Error::Surface(SurfaceError::Lost)
        );
    }

    #[test]
    fn resize() {
        let (driver, device) = device();
        let surface = driver.create_surface();
        let mut swapchain = device
            .create_swapchain(surface, SwapchainConfig::default())
            .unwrap();

        swapchain.resize(UVec2::new(640, 480)).unwrap();
        assert_eq!(swapchain.images()[0].size().x, 640);
        assert!(swapchain.resize(UVec2::new(0, 480)).is_err());
    }

    #[test]
    fn rejected_resize_keeps_extent() {
        let (driver, device) = device();
        let surface = driver.create_surface();
        let mut swapchain = device
            .create_swapchain(surface, SwapchainConfig::default())
            .unwrap();
        let images = swapchain.images().to_vec();

        assert!(swapchain.resize(UVec2::new(0, 480)).is_err());
        assert_eq!(swapchain.extent(), UVec2::new(1280, 720));
        assert_eq!(swapchain.images(), &images[..]);

        // The swapchain is still usable at its old extent.
        let frame = swapchain.acquire().unwrap();
        assert_eq!(frame.texture.size().x, 1280);
    }
}
