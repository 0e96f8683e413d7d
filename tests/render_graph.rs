//! End-to-end render graph behavior: compilation, pruning, merging and the
//! data flow through a dispatched frame.

mod common;

use std::cell::Cell;

use frameforge::backend::{DeviceCommand, DummyBackend};
use frameforge::compiler::{compile_module, Hazard};
use frameforge::config::BackendSettings;
use frameforge::error::GraphicsError;
use frameforge::graph::{FrameInfo, PassType, RenderModule, RenderPass};
use frameforge::resource::{BufferInfo, ImageInfo, ResourceHandle, ResourceInfo, ResourceUsage};
use frameforge::types::{BufferUsage, ImageUsage, TextureFormat};
use rstest::rstest;

use common::{clear_module, clear_pass, orchestrator, Lcg};

const VERTICES: ResourceHandle = ResourceHandle::buffer("vertices");
const LIBRARY: ResourceHandle = ResourceHandle::buffer("library");
const SHADOW_MAP: ResourceHandle = ResourceHandle::image("shadow_map");

fn vertex_module<'a>(upload_usage: BufferUsage, draw_usage: BufferUsage) -> RenderModule<'a> {
    RenderModule::new()
        .with_pass(
            RenderPass::new("upload", PassType::Transfer).with_setup(move |builder| {
                builder.write(VERTICES, BufferInfo::new(1024).with_usage(upload_usage));
                true
            }),
        )
        .with_pass(clear_pass("draw").with_setup(move |builder| {
            let target = builder.swapchain_image();
            builder
                .read(VERTICES, BufferInfo::new(1024).with_usage(draw_usage))
                .add_color_attachment(target, Default::default())
                .set_is_root(true);
            true
        }))
}

#[test]
fn test_single_root_pass_targets_surface() {
    let compiled = compile_module(clear_module(), &FrameInfo::default()).unwrap();
    let plan = compiled.plan();
    assert_eq!(plan.pass_names(), ["clear"]);
    assert!(plan.targets_surface);
    assert!(plan.passes[0].is_root);
    assert!(plan.resource(ResourceHandle::SWAPCHAIN_IMAGE).is_some());
    assert_eq!(plan.barriers().count(), 0);
}

#[test]
fn test_transfer_then_draw_with_barrier() {
    let module = vertex_module(BufferUsage::TRANSFER_DST, BufferUsage::VERTEX_BUFFER);
    let compiled = compile_module(module, &FrameInfo::default()).unwrap();
    let plan = compiled.plan();
    assert_eq!(plan.pass_names(), ["upload", "draw"]);

    let barrier = plan.passes[1]
        .barriers
        .iter()
        .find(|b| b.resource == VERTICES)
        .expect("barrier on vertices");
    assert_eq!(barrier.hazard, Hazard::ReadAfterWrite);
    assert_eq!(barrier.producer, 0);
    assert_eq!(barrier.src.pass_type, PassType::Transfer);
    assert_eq!(barrier.dst.pass_type, PassType::Draw);
}

#[test]
fn test_unreachable_pass_is_never_executed() {
    let dead_setup = Cell::new(0);
    let dead_execute = Cell::new(0);
    let root_execute = Cell::new(0);

    let mut orchestrator = orchestrator(DummyBackend::new(), BackendSettings::default());
    let report = orchestrator
        .render(|_| {
            RenderModule::new()
                .with_pass(
                    RenderPass::new("library", PassType::Compute)
                        .with_setup(|builder| {
                            dead_setup.set(dead_setup.get() + 1);
                            builder.write(
                                LIBRARY,
                                BufferInfo::new(64).with_usage(BufferUsage::STORAGE_BUFFER),
                            );
                            true
                        })
                        .with_execute(|_| dead_execute.set(dead_execute.get() + 1)),
                )
                .with_pass(clear_pass("draw").with_execute(|_| {
                    root_execute.set(root_execute.get() + 1);
                }))
        })
        .unwrap();

    assert_eq!(report.executed, ["draw"]);
    assert_eq!(report.pruned, ["library"]);
    assert_eq!(dead_setup.get(), 1);
    assert_eq!(dead_execute.get(), 0);
    assert_eq!(root_execute.get(), 1);
}

#[test]
fn test_usage_flags_merge_across_passes() {
    let module = vertex_module(BufferUsage::TRANSFER_DST, BufferUsage::VERTEX_BUFFER);
    let compiled = compile_module(module, &FrameInfo::default()).unwrap();
    let merged = compiled.plan().resource(VERTICES).unwrap();
    assert_eq!(
        merged.info.usage(),
        ResourceUsage::Buffer(BufferUsage::TRANSFER_DST | BufferUsage::VERTEX_BUFFER)
    );
}

#[test]
fn test_withdrawn_pass_is_absent() {
    let module = RenderModule::new()
        .with_pass(
            RenderPass::new("optional", PassType::Transfer).with_setup(|builder| {
                builder.write(VERTICES, BufferInfo::new(16).with_usage(BufferUsage::TRANSFER_DST));
                false
            }),
        )
        .with_pass(clear_pass("draw"));
    let compiled = compile_module(module, &FrameInfo::default()).unwrap();
    assert_eq!(compiled.plan().pass_names(), ["draw"]);
    assert_eq!(compiled.plan().withdrawn, ["optional"]);
    assert!(compiled.plan().pruned.is_empty());
}

#[rstest]
#[case::none(0)]
#[case::two(2)]
fn test_root_count_must_be_one(#[case] roots: usize) {
    let mut module = RenderModule::new();
    for i in 0..roots.max(1) {
        let is_root = roots > 0;
        module.add_render_pass(RenderPass::new(format!("pass{i}"), PassType::Draw).with_setup(
            move |builder| {
                let target = builder.swapchain_image();
                builder
                    .add_color_attachment(target, Default::default())
                    .set_is_root(is_root);
                true
            },
        ));
    }
    let err = compile_module(module, &FrameInfo::default()).unwrap_err();
    match roots {
        0 => assert_eq!(err, GraphicsError::MissingRootPass),
        _ => assert!(matches!(err, GraphicsError::MultipleRootPasses(names) if names.len() == 2)),
    }
}

#[test]
fn test_incompatible_formats_fail_compilation() {
    let module = RenderModule::new()
        .with_pass(
            RenderPass::new("shadows", PassType::Draw).with_setup(|builder| {
                builder.write(
                    SHADOW_MAP,
                    ImageInfo::new()
                        .with_format(TextureFormat::Depth32Float)
                        .with_usage(ImageUsage::DEPTH_STENCIL_ATTACHMENT),
                );
                true
            }),
        )
        .with_pass(clear_pass("main").with_setup(|builder| {
            let target = builder.swapchain_image();
            builder
                .read(
                    SHADOW_MAP,
                    ImageInfo::new()
                        .with_format(TextureFormat::R32Float)
                        .with_usage(ImageUsage::SAMPLED),
                )
                .add_color_attachment(target, Default::default())
                .set_is_root(true);
            true
        }));
    let err = compile_module(module, &FrameInfo::default()).unwrap_err();
    assert!(matches!(
        err,
        GraphicsError::IncompatibleResourceInfo { handle, .. } if handle == SHADOW_MAP
    ));
}

#[test]
fn test_cycle_is_reported_and_frame_skipped() {
    const A: ResourceHandle = ResourceHandle::buffer("a");
    const B: ResourceHandle = ResourceHandle::buffer("b");
    let storage = || BufferInfo::new(64).with_usage(BufferUsage::STORAGE_BUFFER);

    let mut orchestrator = orchestrator(DummyBackend::new(), BackendSettings::default());
    let err = orchestrator
        .render(|_| {
            RenderModule::new()
                // Reads B before anything writes it, so it waits on "second".
                .with_pass(RenderPass::new("first", PassType::Compute).with_setup(move |builder| {
                    builder.read(B, storage()).write(A, storage());
                    true
                }))
                .with_pass(RenderPass::new("second", PassType::Compute).with_setup(move |builder| {
                    builder.read(A, storage()).write(B, storage());
                    true
                }))
                .with_pass(clear_pass("draw"))
        })
        .unwrap_err();

    assert!(matches!(err, GraphicsError::CyclicDependency { ref passes } if passes.len() == 3));
    assert_eq!(orchestrator.backend().submission_count(), 0);
    assert_eq!(orchestrator.frame_state(0), Some(frameforge::FrameState::Idle));

    // The next tick with a valid module goes through.
    assert!(orchestrator.render(|_| clear_module()).is_ok());
}

#[test]
fn test_uploaded_data_reaches_destination() {
    let payload: Vec<u8> = (0..=255).collect();
    let mut orchestrator = orchestrator(DummyBackend::new(), BackendSettings::default());
    orchestrator
        .render(|_| {
            RenderModule::new()
                .with_pass(
                    RenderPass::new("upload", PassType::Transfer)
                        .with_setup(|builder| {
                            builder.write(
                                VERTICES,
                                BufferInfo::new(256)
                                    .with_usage(BufferUsage::TRANSFER_DST)
                                    .persistent(),
                            );
                            true
                        })
                        .with_execute(|encoder| {
                            encoder.write_to_buffer(VERTICES, 0, &payload);
                        }),
                )
                .with_pass(clear_pass("draw").with_setup(|builder| {
                    let target = builder.swapchain_image();
                    builder
                        .read(VERTICES, BufferInfo::new(256).with_usage(BufferUsage::VERTEX_BUFFER))
                        .add_color_attachment(target, Default::default())
                        .set_is_root(true);
                    true
                }))
        })
        .unwrap();

    let submissions = orchestrator.backend().submissions();
    let commands = &submissions[0].commands;
    let (copy_index, destination) = commands
        .iter()
        .enumerate()
        .find_map(|(i, command)| match command {
            DeviceCommand::CopyBuffer { dst, size, .. } if *size == 256 => Some((i, *dst)),
            _ => None,
        })
        .expect("staging copy");
    let barrier_index = commands
        .iter()
        .position(|command| matches!(command, DeviceCommand::Barrier(_)))
        .expect("barrier before the draw pass");
    assert!(copy_index < barrier_index);
    assert_eq!(
        orchestrator.backend().buffer_contents(destination).unwrap(),
        payload
    );
}

#[test]
fn test_transients_with_disjoint_lifetimes_share_memory() {
    const FIRST: ResourceHandle = ResourceHandle::buffer("first");
    const SECOND: ResourceHandle = ResourceHandle::buffer("second");
    const RESULT: ResourceHandle = ResourceHandle::buffer("result");
    let storage = |size| BufferInfo::new(size).with_usage(BufferUsage::STORAGE_BUFFER);

    let module = RenderModule::new()
        .with_pass(RenderPass::new("a", PassType::Compute).with_setup(move |b| {
            b.write(FIRST, storage(128));
            true
        }))
        .with_pass(RenderPass::new("b", PassType::Compute).with_setup(move |b| {
            b.read(FIRST, storage(128)).write(RESULT, storage(16).persistent());
            true
        }))
        .with_pass(RenderPass::new("c", PassType::Compute).with_setup(move |b| {
            b.read(RESULT, storage(16).persistent()).write(SECOND, storage(512));
            true
        }))
        .with_pass(clear_pass("draw").with_setup(move |b| {
            let target = b.swapchain_image();
            b.read(SECOND, storage(512))
                .add_color_attachment(target, Default::default())
                .set_is_root(true);
            true
        }));

    let compiled = compile_module(module, &FrameInfo::default()).unwrap();
    let plan = compiled.plan();
    let first = plan.resource(FIRST).unwrap();
    let second = plan.resource(SECOND).unwrap();
    assert!(!first.lifetime.overlaps(&second.lifetime));
    assert_eq!(first.alias_slot, second.alias_slot);
    assert!(first.alias_slot.is_some());
    assert_eq!(plan.resource(RESULT).unwrap().alias_slot, None);

    let slot = &plan.alias_slots[first.alias_slot.unwrap()];
    assert_eq!(slot.info.as_buffer().unwrap().size, 512);
}

#[test]
fn test_aliased_transient_waits_for_previous_occupant() {
    const FIRST: ResourceHandle = ResourceHandle::buffer("first");
    const SECOND: ResourceHandle = ResourceHandle::buffer("second");
    const RESULT: ResourceHandle = ResourceHandle::buffer("result");
    let storage = |size| BufferInfo::new(size).with_usage(BufferUsage::STORAGE_BUFFER);

    let module = || {
        RenderModule::new()
            .with_pass(
                RenderPass::new("produce", PassType::Compute)
                    .with_setup(move |b| {
                        b.write(FIRST, storage(128));
                        true
                    })
                    .with_execute(|encoder| {
                        encoder.dispatch(1, 1, 1);
                    }),
            )
            .with_pass(
                RenderPass::new("consume", PassType::Compute)
                    .with_setup(move |b| {
                        b.read(FIRST, storage(128))
                            .write(RESULT, storage(16).persistent());
                        true
                    })
                    .with_execute(|encoder| {
                        encoder.dispatch(2, 1, 1);
                    }),
            )
            .with_pass(
                RenderPass::new("reuse", PassType::Compute)
                    .with_setup(move |b| {
                        b.write(SECOND, storage(512));
                        true
                    })
                    .with_execute(|encoder| {
                        encoder.dispatch(3, 1, 1);
                    }),
            )
            .with_pass(clear_pass("draw").with_setup(move |b| {
                let target = b.swapchain_image();
                b.read(SECOND, storage(512))
                    .read(RESULT, storage(16).persistent())
                    .add_color_attachment(target, Default::default())
                    .set_is_root(true);
                true
            }))
    };

    let compiled = compile_module(module(), &FrameInfo::default()).unwrap();
    let plan = compiled.plan();
    assert_eq!(plan.pass_names(), ["produce", "consume", "reuse", "draw"]);
    assert_eq!(
        plan.resource(FIRST).unwrap().alias_slot,
        plan.resource(SECOND).unwrap().alias_slot
    );
    let reuse = &plan.passes[2];
    let alias: Vec<_> = reuse
        .barriers
        .iter()
        .filter(|b| b.hazard == Hazard::Alias)
        .collect();
    assert_eq!(alias.len(), 1);
    assert_eq!(alias[0].resource, SECOND);
    assert_eq!(alias[0].producer, plan.position("consume").unwrap());

    let mut orchestrator = orchestrator(DummyBackend::new(), BackendSettings::default());
    orchestrator.render(|_| module()).unwrap();
    let commands = &orchestrator.backend().submissions()[0].commands;
    let dispatch = |x| {
        commands
            .iter()
            .position(|c| matches!(c, DeviceCommand::Dispatch { x: cx, .. } if *cx == x))
            .expect("dispatch")
    };
    let alias_barrier = commands
        .iter()
        .position(|c| matches!(c, DeviceCommand::Barrier(b) if b.hazard == Hazard::Alias))
        .expect("alias barrier");
    assert!(dispatch(1) < dispatch(2));
    assert!(dispatch(2) < alias_barrier);
    assert!(alias_barrier < dispatch(3));
}

/// Every pass reading a handle runs after every earlier-declared writer of it.
#[rstest]
fn test_writes_precede_dependent_reads(#[values(1, 2, 3, 5, 8, 13, 21, 34, 55, 89)] seed: u64) {
    const HANDLES: [ResourceHandle; 4] = [
        ResourceHandle::buffer("h0"),
        ResourceHandle::buffer("h1"),
        ResourceHandle::buffer("h2"),
        ResourceHandle::buffer("h3"),
    ];
    let mut rng = Lcg::new(seed);
    let pass_count = 3 + rng.below(6) as usize;
    // (reads, writes) per pass, as handle indices.
    let shapes: Vec<(Vec<usize>, Vec<usize>)> = (0..pass_count)
        .map(|_| {
            let reads = (0..4).filter(|_| rng.below(3) == 0).collect();
            let writes = (0..4).filter(|_| rng.below(3) == 0).collect();
            (reads, writes)
        })
        .collect();

    let storage = BufferInfo::new(64).with_usage(BufferUsage::STORAGE_BUFFER);
    let mut module = RenderModule::new();
    for (i, (reads, writes)) in shapes.iter().enumerate() {
        let reads = reads.clone();
        let writes = writes.clone();
        module.add_render_pass(RenderPass::new(format!("p{i}"), PassType::Compute).with_setup(
            move |builder| {
                for &r in &reads {
                    builder.read(HANDLES[r], storage);
                }
                for &w in &writes {
                    builder.write(HANDLES[w], storage);
                }
                true
            },
        ));
    }
    module.add_render_pass(clear_pass("root").with_setup(move |builder| {
        let target = builder.swapchain_image();
        for handle in HANDLES {
            builder.read(handle, storage);
        }
        builder
            .add_color_attachment(target, Default::default())
            .set_is_root(true);
        true
    }));

    let compiled = match compile_module(module, &FrameInfo::default()) {
        Ok(compiled) => compiled,
        Err(GraphicsError::CyclicDependency { .. }) => return,
        Err(err) => panic!("unexpected error: {err}"),
    };
    let plan = compiled.plan();
    for (reader_pos, reader) in plan.passes.iter().enumerate() {
        for declaration in reader.resources.iter().filter(|d| d.access.is_read()) {
            for (writer_pos, writer) in plan.passes.iter().enumerate() {
                let writes = writer
                    .resources
                    .iter()
                    .any(|d| d.handle == declaration.handle && d.access.is_write());
                if writes && writer.module_index < reader.module_index {
                    assert!(
                        writer_pos < reader_pos,
                        "seed {seed}: {} writes {} but runs after reader {}",
                        writer.name,
                        declaration.handle,
                        reader.name
                    );
                }
            }
        }
        for barrier in &reader.barriers {
            assert!(barrier.producer < reader_pos);
        }
    }
}

#[test]
fn test_merge_is_commutative_and_associative() {
    let infos: Vec<ResourceInfo> = vec![
        BufferInfo::new(64).with_usage(BufferUsage::TRANSFER_DST).into(),
        BufferInfo::new(256).with_usage(BufferUsage::VERTEX_BUFFER).into(),
        BufferInfo::new(128)
            .with_usage(BufferUsage::STORAGE_BUFFER)
            .persistent()
            .into(),
    ];
    for a in &infos {
        for b in &infos {
            assert_eq!(a.merge(b).unwrap(), b.merge(a).unwrap());
            for c in &infos {
                let left = a.merge(b).unwrap().merge(c).unwrap();
                let right = a.merge(&b.merge(c).unwrap()).unwrap();
                assert_eq!(left, right);
            }
        }
    }

    let sampled: ResourceInfo = ImageInfo::new().with_usage(ImageUsage::SAMPLED).into();
    let target: ResourceInfo = ImageInfo::new()
        .with_format(TextureFormat::Rgba16Float)
        .with_extent_2d(512, 256)
        .with_usage(ImageUsage::COLOR_ATTACHMENT)
        .into();
    let merged = sampled.merge(&target).unwrap();
    assert_eq!(merged, target.merge(&sampled).unwrap());
    let image = merged.as_image().unwrap();
    assert_eq!(image.format, Some(TextureFormat::Rgba16Float));
    assert_eq!(image.usage, ImageUsage::SAMPLED | ImageUsage::COLOR_ATTACHMENT);
}
