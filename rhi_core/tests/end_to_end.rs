use std::sync::Arc;

use rhi_core::backend::null::{Completion, NullAdapter, NullDriver};
use rhi_core::backend::{ClearValue, Command, LoadOp, RawBuffer, StoreOp, TextureFormat};
use rhi_core::descriptor::BindingKind;
use rhi_core::pipeline::{
    ColorTargetState, FrontFace, GraphicsPipelineDescriptor, Pipeline, PrimitiveTopology,
};
use rhi_core::render_pass::{ColorAttachment, FramebufferDescriptor};
use rhi_core::shader::{ShaderBinding, ShaderDescriptor, ShaderStage};
use rhi_core::{
    BindingResource, BufferDescriptor, BufferUsage, Device, DeviceAccess, DeviceConfig,
    Framebuffer, QueueType, ResourceState, Texture, TextureDescriptor, TextureUsage,
};

fn device(adapter: NullAdapter) -> (Arc<NullDriver>, Device) {
    let driver = Arc::new(NullDriver::new(adapter));
    let device = Device::with_driver(driver.clone(), DeviceConfig::default()).unwrap();
    (driver, device)
}

fn buffer_transitions(commands: &[Command], buffer: RawBuffer, state: ResourceState) -> usize {
    commands
        .iter()
        .filter_map(|command| match command {
            Command::PipelineBarrier { buffers, .. } => Some(buffers),
            _ => None,
        })
        .flatten()
        .filter(|barrier| barrier.buffer == buffer && barrier.dst == state)
        .count()
}

/// Creates a pipeline whose vertex stage reads a single buffer of `kind` at slot 0.
fn single_buffer_pipeline(device: &Device, kind: BindingKind) -> Pipeline {
    let bindings = [ShaderBinding {
        name: String::from("data"),
        slot: 0,
        kind,
        size: 64,
    }];
    let vertex = device
        .create_shader(&ShaderDescriptor {
            stage: ShaderStage::Vertex,
            code: &[0; 16],
            entry: "main",
            bindings: &bindings,
            push_constant_size: 0,
        })
        .unwrap();
    let fragment = device
        .create_shader(&ShaderDescriptor {
            stage: ShaderStage::Fragment,
            code: &[1; 16],
            entry: "main",
            bindings: &[],
            push_constant_size: 0,
        })
        .unwrap();

    let targets = [ColorTargetState {
        format: TextureFormat::Rgba8Unorm,
        blend: None,
    }];
    device
        .create_graphics_pipeline(&GraphicsPipelineDescriptor {
            vertex: &vertex,
            fragment: Some(&fragment),
            vertex_buffers: &[],
            topology: PrimitiveTopology::TriangleList,
            cull_mode: None,
            front_face: FrontFace::Ccw,
            color_targets: &targets,
            depth_stencil: None,
            sample_count: 1,
        })
        .unwrap()
}

fn framebuffer(device: &Device) -> (Texture, Framebuffer) {
    let target = device
        .create_texture(&TextureDescriptor::new_2d(
            64,
            64,
            TextureFormat::Rgba8Unorm,
            TextureUsage::RENDER_ATTACHMENT,
        ))
        .unwrap();
    let framebuffer = device
        .create_framebuffer(&FramebufferDescriptor {
            colors: &[ColorAttachment {
                texture: &target,
                load_op: LoadOp::Clear,
                store_op: StoreOp::Store,
            }],
            depth_stencil: None,
            layers: 1,
        })
        .unwrap();
    (target, framebuffer)
}

#[test]
fn draw_with_uniform_buffer() {
    let (driver, device) = device(NullAdapter {
        completion: Completion::Manual,
        ..NullAdapter::discrete()
    });

    let uniforms = device
        .create_buffer(&BufferDescriptor {
            size: 256,
            usage: BufferUsage::UNIFORM | BufferUsage::TRANSFER_SRC,
            access: DeviceAccess::GpuReadCpuWrite,
        })
        .unwrap();

    let mut mapping = uniforms.map().unwrap();
    assert_eq!(mapping.len(), 256);
    for (i, byte) in mapping.iter_mut().enumerate() {
        *byte = i as u8;
    }
    mapping.unmap();

    let pipeline = single_buffer_pipeline(&device, BindingKind::UniformBuffer);

    let table = device.create_descriptor_table(&pipeline).unwrap();
    table.write(
        0,
        BindingResource::Buffer {
            buffer: &uniforms,
            offset: 0,
            size: None,
        },
    );

    let (target, framebuffer) = framebuffer(&device);

    let mut ctx = device.create_command_context(QueueType::Graphics).unwrap();
    let cmd = ctx.primary().unwrap();
    let raw = cmd.raw();
    cmd.bind_graphics_pipeline(&pipeline);
    cmd.bind_descriptor_table(&table);
    cmd.begin_render_pass(&framebuffer, &[ClearValue::Color([0.0, 0.0, 0.0, 1.0])]);
    cmd.draw(0..3, 0..1);
    cmd.end_render_pass();

    let index = ctx.submit().unwrap().unwrap();
    assert_eq!(index.queue(), device.queue(QueueType::Graphics).raw());

    let commands = driver.commands(raw);
    assert_eq!(
        buffer_transitions(&commands, uniforms.raw(), ResourceState::UniformRead),
        1
    );
    assert_eq!(uniforms.state(), ResourceState::UniformRead);
    assert_eq!(target.state(), ResourceState::RenderTarget);

    // The uniform barrier lands before the draw, the attachment barrier before the pass.
    let bind_table = commands
        .iter()
        .position(|c| matches!(c, Command::BindDescriptorTable { .. }))
        .unwrap();
    let begin = commands
        .iter()
        .position(|c| matches!(c, Command::BeginRenderPass { .. }))
        .unwrap();
    let draw = commands
        .iter()
        .position(|c| matches!(c, Command::Draw { .. }))
        .unwrap();
    assert!(bind_table < begin && begin < draw);
    assert!(matches!(commands[bind_table - 1], Command::PipelineBarrier { .. }));
    assert!(matches!(commands[begin - 1], Command::PipelineBarrier { .. }));

    // Binding the table again in the next frame needs no new barrier.
    driver.complete_all();
    let cmd = ctx.primary().unwrap();
    let raw = cmd.raw();
    cmd.bind_graphics_pipeline(&pipeline);
    cmd.bind_descriptor_table(&table);
    ctx.submit().unwrap();
    assert_eq!(
        buffer_transitions(&driver.commands(raw), uniforms.raw(), ResourceState::UniformRead),
        0
    );

    // Every byte written through the mapping reaches the device.
    let readback = device
        .create_buffer(&BufferDescriptor {
            size: 256,
            usage: BufferUsage::TRANSFER_DST,
            access: DeviceAccess::CpuRead,
        })
        .unwrap();
    ctx.primary()
        .unwrap()
        .copy_buffer(&uniforms, 0, &readback, 0, 256);
    ctx.submit().unwrap();

    let contents = readback.map().unwrap();
    for (i, byte) in contents.iter().enumerate() {
        assert_eq!(*byte, i as u8, "byte {}", i);
    }
    drop(contents);

    device.wait_idle().unwrap();
}

#[test]
fn storage_table_rebound_inside_render_pass() {
    let (driver, device) = device(NullAdapter::discrete());

    let particles = device
        .create_buffer(&BufferDescriptor {
            size: 1024,
            usage: BufferUsage::STORAGE,
            access: DeviceAccess::GpuReadWrite,
        })
        .unwrap();

    let pipeline = single_buffer_pipeline(&device, BindingKind::StorageBuffer);
    let table = device.create_descriptor_table(&pipeline).unwrap();
    table.write(
        0,
        BindingResource::Buffer {
            buffer: &particles,
            offset: 0,
            size: None,
        },
    );
    let (_target, framebuffer) = framebuffer(&device);

    let mut ctx = device.create_command_context(QueueType::Graphics).unwrap();
    let cmd = ctx.primary().unwrap();
    let raw = cmd.raw();
    cmd.bind_graphics_pipeline(&pipeline);
    cmd.bind_descriptor_table(&table);
    cmd.begin_render_pass(&framebuffer, &[ClearValue::Color([0.0; 4])]);
    cmd.draw(0..3, 0..1);
    cmd.bind_descriptor_table(&table);
    cmd.draw(0..3, 0..1);
    cmd.end_render_pass();
    ctx.submit().unwrap();

    let commands = driver.commands(raw);
    assert_eq!(
        buffer_transitions(&commands, particles.raw(), ResourceState::UnorderedAccess),
        1
    );
    assert_eq!(
        commands
            .iter()
            .filter(|c| matches!(c, Command::Draw { .. }))
            .count(),
        2
    );
    assert_eq!(particles.state(), ResourceState::UnorderedAccess);

    // Outside of a pass the hazard between two binds is still ordered.
    let cmd = ctx.primary().unwrap();
    let raw = cmd.raw();
    cmd.bind_graphics_pipeline(&pipeline);
    cmd.bind_descriptor_table(&table);
    cmd.bind_descriptor_table(&table);
    ctx.submit().unwrap();
    assert_eq!(
        buffer_transitions(
            &driver.commands(raw),
            particles.raw(),
            ResourceState::UnorderedAccess
        ),
        2
    );

    device.wait_idle().unwrap();
}

#[test]
#[should_panic(expected = "cannot transition buffer")]
fn first_storage_bind_inside_render_pass() {
    let (_, device) = device(NullAdapter::discrete());

    let particles = device
        .create_buffer(&BufferDescriptor {
            size: 1024,
            usage: BufferUsage::STORAGE,
            access: DeviceAccess::GpuReadWrite,
        })
        .unwrap();

    let pipeline = single_buffer_pipeline(&device, BindingKind::StorageBuffer);
    let table = device.create_descriptor_table(&pipeline).unwrap();
    table.write(
        0,
        BindingResource::Buffer {
            buffer: &particles,
            offset: 0,
            size: None,
        },
    );
    let (_target, framebuffer) = framebuffer(&device);

    let mut ctx = device.create_command_context(QueueType::Graphics).unwrap();
    let cmd = ctx.primary().unwrap();
    cmd.bind_graphics_pipeline(&pipeline);
    cmd.begin_render_pass(&framebuffer, &[ClearValue::Color([0.0; 4])]);
    cmd.bind_descriptor_table(&table);
}

#[test]
fn texture_upload_on_integrated_uses_graphics_queue() {
    let (driver, device) = device(NullAdapter::integrated());
    assert!(!device.capabilities().dedicated_transfer);

    let texture = device
        .create_texture(&TextureDescriptor::new_2d(
            128,
            128,
            TextureFormat::Rgba8Unorm,
            TextureUsage::TRANSFER_DST | TextureUsage::TEXTURE_BINDING,
        ))
        .unwrap();

    let upload = device.upload();
    let mut ctx = upload.context().unwrap();
    assert_eq!(ctx.queue_type(), QueueType::Graphics);

    let texels = vec![0xff; 128 * 128 * 4];
    upload.upload_texture(&mut ctx, &texture, 0, 0, &texels).unwrap();
    assert_eq!(ctx.pending(), 1);

    let index = ctx.flush().unwrap().unwrap();
    assert_eq!(index.queue(), device.queue(QueueType::Graphics).raw());
    assert_eq!(texture.state(), ResourceState::CopyDst);

    let batches = driver.submissions(index.queue());
    let batch = batches.last().unwrap();
    let copies: Vec<_> = batch
        .command_buffers
        .iter()
        .flat_map(|buffer| driver.commands(*buffer))
        .filter(|command| matches!(command, Command::CopyBufferToTexture { .. }))
        .collect();
    assert_eq!(copies.len(), 1);

    let Command::CopyBufferToTexture { dst, layout, .. } = &copies[0] else {
        unreachable!();
    };
    assert_eq!(*dst, texture.raw());
    assert_eq!(layout.bytes_per_row, 128 * 4);
    assert_eq!(layout.rows_per_image, 128);

    // Staging memory comes back once the copy completed.
    assert!(upload.used_memory() > 0);
    device.wait_idle().unwrap();
    upload.sweep();
    assert_eq!(upload.used_memory(), 0);
}
