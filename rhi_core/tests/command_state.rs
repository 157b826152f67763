use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rhi_core::backend::null::{Completion, NullAdapter, NullDriver};
use rhi_core::backend::{LoadOp, StoreOp, TextureFormat};
use rhi_core::command::CommandBufferEvent;
use rhi_core::render_pass::{ColorAttachment, FramebufferDescriptor};
use rhi_core::{
    Buffer, BufferDescriptor, BufferUsage, CommandBufferState, Device, DeviceAccess,
    DeviceConfig, Framebuffer, QueueType, Texture, TextureDescriptor, TextureUsage,
};

const STATES: [CommandBufferState; 6] = [
    CommandBufferState::Initial,
    CommandBufferState::Recording,
    CommandBufferState::Closed,
    CommandBufferState::Pending,
    CommandBufferState::Ready,
    CommandBufferState::NeedsReset,
];

const EVENTS: [CommandBufferEvent; 6] = [
    CommandBufferEvent::Begin,
    CommandBufferEvent::End,
    CommandBufferEvent::Submit,
    CommandBufferEvent::Complete,
    CommandBufferEvent::Discard,
    CommandBufferEvent::Reset,
];

/// Every allowed transition. Anything else is rejected.
const TRANSITIONS: &[(CommandBufferState, CommandBufferEvent, CommandBufferState)] = {
    use CommandBufferEvent as E;
    use CommandBufferState as S;

    &[
        (S::Initial, E::Begin, S::Recording),
        (S::Ready, E::Begin, S::Recording),
        (S::Closed, E::Begin, S::Recording),
        (S::Recording, E::End, S::Closed),
        (S::Closed, E::Submit, S::Pending),
        (S::Pending, E::Complete, S::Ready),
        (S::Recording, E::Discard, S::NeedsReset),
        (S::Closed, E::Discard, S::NeedsReset),
        (S::Initial, E::Reset, S::Initial),
        (S::Closed, E::Reset, S::Initial),
        (S::Ready, E::Reset, S::Initial),
        (S::NeedsReset, E::Reset, S::Initial),
    ]
};

fn expected(state: CommandBufferState, event: CommandBufferEvent) -> Option<CommandBufferState> {
    TRANSITIONS
        .iter()
        .find(|(from, on, _)| *from == state && *on == event)
        .map(|(_, _, to)| *to)
}

#[test]
fn transition_table() {
    for state in STATES {
        for event in EVENTS {
            assert_eq!(
                state.next(event),
                expected(state, event),
                "{:?} on {:?}",
                event,
                state
            );
        }
    }
}

#[test]
fn random_walk_never_leaves_the_table() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut visited = Vec::new();

    let mut state = CommandBufferState::Initial;
    for _ in 0..10_000 {
        let event = EVENTS[rng.gen_range(0..EVENTS.len())];
        if let Some(next) = state.next(event) {
            assert!(TRANSITIONS.contains(&(state, event, next)));
            state = next;
            if !visited.contains(&state) {
                visited.push(state);
            }
        }
    }

    // Every state is reachable from a freshly allocated buffer.
    for state in STATES {
        assert!(visited.contains(&state), "{:?} never reached", state);
    }
}

fn device() -> (Arc<NullDriver>, Device) {
    let driver = Arc::new(NullDriver::new(NullAdapter {
        completion: Completion::Manual,
        ..NullAdapter::discrete()
    }));
    let device = Device::with_driver(driver.clone(), DeviceConfig::default()).unwrap();
    (driver, device)
}

fn copy_buffers(device: &Device) -> (Buffer, Buffer) {
    let src = device
        .create_buffer(&BufferDescriptor {
            size: 1024,
            usage: BufferUsage::TRANSFER_SRC,
            access: DeviceAccess::GpuRead,
        })
        .unwrap();
    let dst = device
        .create_buffer(&BufferDescriptor {
            size: 1024,
            usage: BufferUsage::TRANSFER_DST,
            access: DeviceAccess::GpuRead,
        })
        .unwrap();
    (src, dst)
}

fn framebuffer(device: &Device) -> (Texture, Framebuffer) {
    let target = device
        .create_texture(&TextureDescriptor::new_2d(
            32,
            32,
            TextureFormat::Rgba8Unorm,
            TextureUsage::RENDER_ATTACHMENT,
        ))
        .unwrap();
    let framebuffer = device
        .create_framebuffer(&FramebufferDescriptor {
            colors: &[ColorAttachment {
                texture: &target,
                load_op: LoadOp::Load,
                store_op: StoreOp::Store,
            }],
            depth_stencil: None,
            layers: 1,
        })
        .unwrap();
    (target, framebuffer)
}

#[test]
fn context_reuses_buffers() {
    let (driver, device) = device();
    let (src, dst) = copy_buffers(&device);
    let mut ctx = device.create_command_context(QueueType::Graphics).unwrap();

    let mut rng = StdRng::seed_from_u64(42);
    let mut incomplete = 0;
    let mut max_incomplete = 0;

    for _ in 0..1000 {
        match rng.gen_range(0..5) {
            0 => {
                ctx.primary().unwrap().copy_buffer(&src, 0, &dst, 0, 256);
            }
            1 => {
                if ctx.submit().unwrap().is_some() {
                    incomplete += 1;
                    max_incomplete = max_incomplete.max(incomplete);
                }
            }
            2 => {
                driver.complete_all();
                incomplete = 0;
            }
            3 => ctx.discard(),
            _ => {
                ctx.reclaim();
                assert_eq!(ctx.count(CommandBufferState::Pending), incomplete);
            }
        }

        assert!(ctx.count(CommandBufferState::Recording) <= 1);
        assert!(ctx.buffer_count() <= max_incomplete + 1);
    }

    ctx.wait().unwrap();
    assert_eq!(ctx.count(CommandBufferState::Pending), 0);
}

#[test]
fn discarded_buffer_is_reset_before_reuse() {
    let (driver, device) = device();
    let (src, dst) = copy_buffers(&device);
    let mut ctx = device.create_command_context(QueueType::Graphics).unwrap();

    let cmd = ctx.primary().unwrap();
    let raw = cmd.raw();
    cmd.copy_buffer(&src, 0, &dst, 0, 64);
    ctx.discard();
    assert_eq!(ctx.count(CommandBufferState::NeedsReset), 1);

    let cmd = ctx.primary().unwrap();
    assert_eq!(cmd.raw(), raw);
    assert_eq!(cmd.state(), CommandBufferState::Recording);
    assert_eq!(cmd.command_count(), 0);

    cmd.copy_buffer(&src, 0, &dst, 0, 64);
    ctx.submit().unwrap();
    assert_eq!(driver.submissions(ctx.queue().raw()).len(), 1);
    assert_eq!(ctx.buffer_count(), 1);
}

#[test]
fn empty_submission_is_skipped() {
    let (driver, device) = device();
    let mut ctx = device.create_command_context(QueueType::Graphics).unwrap();

    ctx.primary().unwrap();
    assert_eq!(ctx.submit().unwrap(), None);
    assert!(driver.submissions(ctx.queue().raw()).is_empty());
}

#[test]
#[should_panic(expected = "draw outside of a render pass")]
fn draw_outside_render_pass() {
    let (_, device) = device();
    let mut ctx = device.create_command_context(QueueType::Graphics).unwrap();
    ctx.primary().unwrap().draw(0..3, 0..1);
}

#[test]
#[should_panic(expected = "no render pass is active")]
fn end_without_render_pass() {
    let (_, device) = device();
    let mut ctx = device.create_command_context(QueueType::Graphics).unwrap();
    ctx.primary().unwrap().end_render_pass();
}

#[test]
#[should_panic(expected = "render pass is already active")]
fn nested_render_pass() {
    let (_, device) = device();
    let (_target, framebuffer) = framebuffer(&device);
    let mut ctx = device.create_command_context(QueueType::Graphics).unwrap();

    let cmd = ctx.primary().unwrap();
    cmd.begin_render_pass(&framebuffer, &[]);
    cmd.begin_render_pass(&framebuffer, &[]);
}

#[test]
#[should_panic(expected = "command buffer ended with an active render pass")]
fn submit_with_open_render_pass() {
    let (_, device) = device();
    let (_target, framebuffer) = framebuffer(&device);
    let mut ctx = device.create_command_context(QueueType::Graphics).unwrap();

    ctx.primary().unwrap().begin_render_pass(&framebuffer, &[]);
    let _ = ctx.submit();
}
