//! Render module compilation.
//!
//! [`compile_module`] turns a [`RenderModule`] into an [`ExecutionPlan`]:
//!
//! 1. **Setup** - every pass's setup callback runs exactly once, in module
//!    order, and records its resource declarations
//! 2. **Dependencies** - passes touching the same handle are ordered by
//!    read-after-write, write-after-write and write-after-read edges
//! 3. **Cycle detection** - a cycle anywhere in the module fails compilation
//! 4. **Pruning** - passes the root pass does not transitively depend on are
//!    removed
//! 5. **Ordering** - Kahn's algorithm, ties broken by declaration order
//! 6. **Merging** - declarations of one handle are merged across the surviving
//!    passes
//! 7. **Barriers, lifetimes and aliasing** - annotated on the plan
//!
//! # Example
//!
//! ```
//! use frameforge::compiler::compile_module;
//! use frameforge::graph::{ColorAttachment, FrameInfo, PassType, RenderModule, RenderPass};
//!
//! let module = RenderModule::new().with_pass(
//!     RenderPass::new("main", PassType::Draw).with_setup(|builder| {
//!         let target = builder.swapchain_image();
//!         builder
//!             .add_color_attachment(target, ColorAttachment::new())
//!             .set_is_root(true);
//!         true
//!     }),
//! );
//!
//! let compiled = compile_module(module, &FrameInfo::default()).unwrap();
//! assert_eq!(compiled.plan().pass_names(), ["main"]);
//! assert!(compiled.plan().targets_surface);
//! ```

mod aliasing;
mod barriers;
mod dependency;
mod plan;

use std::collections::HashMap;

pub use plan::{
    AccessScope, AliasSlot, Barrier, ExecutionPlan, Hazard, PlannedPass, PlannedResource,
    ResourceLifetime,
};

use crate::error::{GraphicsError, GraphicsResult};
use crate::graph::{
    Access, Attachment, ColorAttachment, FrameInfo, PassDeclaration, PassType, RenderModule,
    RenderPass, ResourceDeclaration,
};
use crate::resource::{FnvBuildHasher, ImageInfo, ResourceHandle, ResourceInfo};
use crate::types::ImageUsage;

use dependency::DependencyGraph;

/// A compiled module: the plan plus the surviving passes in plan order.
pub struct CompiledFrame<'a> {
    plan: ExecutionPlan,
    passes: Vec<RenderPass<'a>>,
}

impl<'a> CompiledFrame<'a> {
    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn into_plan(self) -> ExecutionPlan {
        self.plan
    }

    pub(crate) fn into_parts(self) -> (ExecutionPlan, Vec<RenderPass<'a>>) {
        (self.plan, self.passes)
    }
}

impl std::fmt::Debug for CompiledFrame<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFrame")
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

/// Compile `module` for the frame described by `frame`.
///
/// Runs every setup callback once. Configuration errors (cycles, missing or
/// duplicate roots, incompatible declarations) abort compilation; the frame
/// should then be skipped.
pub fn compile_module<'a>(
    module: RenderModule<'a>,
    frame: &FrameInfo,
) -> GraphicsResult<CompiledFrame<'a>> {
    let mut active: Vec<(RenderPass<'a>, usize, PassDeclaration)> = Vec::new();
    let mut withdrawn = Vec::new();

    for (module_index, mut pass) in module.into_passes().into_iter().enumerate() {
        match pass.run_setup(frame)? {
            Some(declaration) => active.push((pass, module_index, declaration)),
            None => {
                log::trace!("Pass '{}' withdrew from frame {}", pass.name(), frame.frame_number);
                withdrawn.push(pass.name().to_string());
            }
        }
    }

    let root = find_root(&active)?;
    add_implicit_surface_write(&mut active[root])?;

    let graph = {
        let declarations: Vec<&PassDeclaration> = active.iter().map(|(_, _, d)| d).collect();
        DependencyGraph::build(&declarations)
    };
    debug_assert_eq!(graph.len(), active.len());

    let order = graph.topological_order().map_err(|cycle| {
        let mut passes: Vec<String> = cycle
            .iter()
            .map(|&i| active[i].0.name().to_string())
            .collect();
        if let Some(first) = passes.first().cloned() {
            passes.push(first);
        }
        GraphicsError::CyclicDependency { passes }
    })?;

    let reachable = graph.reachable_from(root);
    let pruned: Vec<String> = active
        .iter()
        .enumerate()
        .filter(|(i, _)| !reachable[*i])
        .map(|(_, (pass, _, _))| pass.name().to_string())
        .collect();
    if !pruned.is_empty() {
        log::debug!("Pruned passes not reaching the root: {}", pruned.join(", "));
    }

    // Move surviving passes out in plan order.
    let mut slots: Vec<Option<(RenderPass<'a>, usize, PassDeclaration)>> =
        active.into_iter().map(Some).collect();
    let mut passes = Vec::new();
    let mut planned = Vec::new();
    for index in order.into_iter().filter(|&i| reachable[i]) {
        let Some((pass, module_index, declaration)) = slots[index].take() else {
            continue;
        };
        planned.push(PlannedPass {
            name: pass.name().to_string(),
            pass_type: pass.pass_type(),
            module_index,
            resources: declaration.resources,
            color_attachments: declaration.color_attachments,
            depth_attachment: declaration.depth_attachment,
            barriers: Vec::new(),
            is_root: declaration.is_root,
        });
        passes.push(pass);
    }

    let mut resources = merge_resources(&planned, frame)?;
    barriers::place_barriers(&mut planned);
    let alias_slots = aliasing::assign_alias_slots(&mut resources);
    barriers::place_alias_barriers(&mut planned, &resources, &alias_slots);
    let targets_surface = planned
        .iter()
        .any(|p| p.is_root && p.resources.iter().any(is_surface_write));

    log::trace!(
        "Compiled frame {}: {} passes, {} resources, {} alias slots",
        frame.frame_number,
        planned.len(),
        resources.len(),
        alias_slots.len()
    );

    Ok(CompiledFrame {
        plan: ExecutionPlan {
            passes: planned,
            resources,
            alias_slots,
            pruned,
            withdrawn,
            targets_surface,
        },
        passes,
    })
}

fn is_surface_write(declaration: &ResourceDeclaration) -> bool {
    declaration.handle == ResourceHandle::SWAPCHAIN_IMAGE && declaration.access.is_write()
}

fn find_root(active: &[(RenderPass<'_>, usize, PassDeclaration)]) -> GraphicsResult<usize> {
    let roots: Vec<usize> = active
        .iter()
        .enumerate()
        .filter(|(_, (_, _, d))| d.is_root)
        .map(|(i, _)| i)
        .collect();
    match roots.as_slice() {
        [] => Err(GraphicsError::MissingRootPass),
        [root] => Ok(*root),
        _ => Err(GraphicsError::MultipleRootPasses(
            roots.iter().map(|&i| active[i].0.name().to_string()).collect(),
        )),
    }
}

/// The root always writes the presentable image. A draw root without color
/// attachments clears it.
fn add_implicit_surface_write(
    root: &mut (RenderPass<'_>, usize, PassDeclaration),
) -> GraphicsResult<()> {
    let (pass, _, declaration) = root;
    if declaration.writes(ResourceHandle::SWAPCHAIN_IMAGE) {
        return Ok(());
    }
    if pass.pass_type() == PassType::Draw && declaration.color_attachments.is_empty() {
        let attachment = ColorAttachment::new();
        declaration.color_attachments.push(Attachment {
            handle: ResourceHandle::SWAPCHAIN_IMAGE,
            load_op: attachment.load_op,
            store_op: attachment.store_op,
        });
    }
    let usage = match pass.pass_type() {
        PassType::Draw => ImageUsage::COLOR_ATTACHMENT,
        PassType::Compute => ImageUsage::STORAGE,
        PassType::Transfer => ImageUsage::TRANSFER_DST,
    };
    let info = ResourceInfo::Image(ImageInfo::new().with_usage(usage));
    match declaration
        .resources
        .iter_mut()
        .find(|r| r.handle == ResourceHandle::SWAPCHAIN_IMAGE)
    {
        Some(existing) => {
            existing.info = existing.info.merge(&info).map_err(|conflict| {
                GraphicsError::IncompatibleResourceInfo {
                    handle: ResourceHandle::SWAPCHAIN_IMAGE,
                    reason: format!("root pass '{}': {conflict}", pass.name()),
                }
            })?;
            existing.access = existing.access.union(Access::Write);
        }
        None => declaration.resources.push(ResourceDeclaration {
            handle: ResourceHandle::SWAPCHAIN_IMAGE,
            info,
            access: Access::Write,
        }),
    }
    Ok(())
}

/// Merge declarations per handle and resolve frame-dependent fields.
fn merge_resources(
    passes: &[PlannedPass],
    frame: &FrameInfo,
) -> GraphicsResult<Vec<PlannedResource>> {
    let mut index_of: HashMap<ResourceHandle, usize, FnvBuildHasher> = HashMap::default();
    let mut resources: Vec<PlannedResource> = Vec::new();

    for (plan_index, pass) in passes.iter().enumerate() {
        for declaration in &pass.resources {
            match index_of.get(&declaration.handle) {
                Some(&i) => {
                    let resource = &mut resources[i];
                    resource.info = resource.info.merge(&declaration.info).map_err(|conflict| {
                        GraphicsError::IncompatibleResourceInfo {
                            handle: declaration.handle,
                            reason: format!("pass '{}': {conflict}", pass.name),
                        }
                    })?;
                    resource.lifetime.extend(plan_index);
                }
                None => {
                    index_of.insert(declaration.handle, resources.len());
                    resources.push(PlannedResource {
                        handle: declaration.handle,
                        info: declaration.info,
                        lifetime: ResourceLifetime::new(plan_index),
                        alias_slot: None,
                    });
                }
            }
        }
    }

    for resource in &mut resources {
        resource.info = resolve_info(resource.handle, resource.info, frame)?;
    }
    Ok(resources)
}

fn resolve_info(
    handle: ResourceHandle,
    info: ResourceInfo,
    frame: &FrameInfo,
) -> GraphicsResult<ResourceInfo> {
    match info {
        ResourceInfo::Buffer(buffer) => {
            if handle == ResourceHandle::SWAPCHAIN_IMAGE {
                return Err(GraphicsError::IncompatibleResourceInfo {
                    handle,
                    reason: "the swapchain image cannot be declared as a buffer".into(),
                });
            }
            if buffer.size == 0 {
                return Err(GraphicsError::InvalidResourceInfo {
                    handle,
                    reason: "buffer size is zero".into(),
                });
            }
            Ok(info)
        }
        ResourceInfo::Image(mut image) => {
            if handle == ResourceHandle::SWAPCHAIN_IMAGE {
                if let Some(format) = image.format.filter(|f| *f != frame.format) {
                    return Err(GraphicsError::IncompatibleResourceInfo {
                        handle,
                        reason: format!(
                            "declared format {format:?} but the swapchain uses {:?}",
                            frame.format
                        ),
                    });
                }
                image.format = Some(frame.format);
                image.extent = frame.extent;
                image.transient = false;
                return Ok(ResourceInfo::Image(image));
            }
            if image.format.is_none() {
                return Err(GraphicsError::InvalidResourceInfo {
                    handle,
                    reason: "image has no format".into(),
                });
            }
            if image.extent.is_empty() {
                image.extent = frame.extent;
            }
            Ok(ResourceInfo::Image(image))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ColorAttachment, DepthStencilAttachment};
    use crate::resource::BufferInfo;
    use crate::types::{BufferUsage, Extent3d, TextureFormat};

    const BUFFER_B: ResourceHandle = ResourceHandle::buffer("b");

    fn root_pass<'a>() -> RenderPass<'a> {
        RenderPass::new("root", PassType::Draw).with_setup(|b| {
            b.set_is_root(true);
            true
        })
    }

    #[test]
    fn test_single_root_pass() {
        let module = RenderModule::new().with_pass(root_pass());
        let compiled = compile_module(module, &FrameInfo::default()).unwrap();
        let plan = compiled.plan();
        assert_eq!(plan.len(), 1);
        assert!(plan.targets_surface);
        assert_eq!(plan.passes[0].color_attachments.len(), 1);
        let swapchain = plan.resource(ResourceHandle::SWAPCHAIN_IMAGE).unwrap();
        let info = swapchain.info.as_image().unwrap();
        assert_eq!(info.format, Some(FrameInfo::default().format));
        assert!(!info.transient);
        assert_eq!(swapchain.alias_slot, None);
    }

    #[test]
    fn test_missing_root() {
        let module = RenderModule::new().with_pass(RenderPass::new("a", PassType::Draw));
        assert!(matches!(
            compile_module(module, &FrameInfo::default()),
            Err(GraphicsError::MissingRootPass)
        ));
    }

    #[test]
    fn test_multiple_roots() {
        let module = RenderModule::new()
            .with_pass(root_pass())
            .with_pass(RenderPass::new("second", PassType::Compute).with_setup(|b| {
                b.set_is_root(true);
                true
            }));
        assert_eq!(
            compile_module(module, &FrameInfo::default()).unwrap_err(),
            GraphicsError::MultipleRootPasses(vec!["root".into(), "second".into()])
        );
    }

    #[test]
    fn test_withdrawn_root_is_missing() {
        let module = RenderModule::new().with_pass(
            RenderPass::new("root", PassType::Draw).with_setup(|b| {
                b.set_is_root(true);
                false
            }),
        );
        assert!(matches!(
            compile_module(module, &FrameInfo::default()),
            Err(GraphicsError::MissingRootPass)
        ));
    }

    #[test]
    fn test_cycle_lists_passes() {
        let x = ResourceHandle::buffer("x");
        let y = ResourceHandle::buffer("y");
        let module = RenderModule::new()
            .with_pass(RenderPass::new("a", PassType::Compute).with_setup(move |b| {
                b.write(x, BufferInfo::new(4)).read(y, BufferInfo::new(4));
                true
            }))
            .with_pass(RenderPass::new("b", PassType::Compute).with_setup(move |b| {
                b.read(x, BufferInfo::new(4)).write(y, BufferInfo::new(4)).set_is_root(true);
                true
            }));
        match compile_module(module, &FrameInfo::default()) {
            Err(GraphicsError::CyclicDependency { passes }) => {
                assert_eq!(passes.len(), 3);
                assert_eq!(passes.first(), passes.last());
                assert!(passes.contains(&"a".to_string()));
                assert!(passes.contains(&"b".to_string()));
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_incompatible_formats_across_passes() {
        let target = ResourceHandle::image("target");
        let module = RenderModule::new()
            .with_pass(RenderPass::new("a", PassType::Draw).with_setup(move |b| {
                b.add_color_attachment(
                    target,
                    ColorAttachment::new().with_format(TextureFormat::Rgba8Unorm),
                );
                true
            }))
            .with_pass(RenderPass::new("root", PassType::Draw).with_setup(move |b| {
                b.use_resource(
                    target,
                    ImageInfo::new()
                        .with_format(TextureFormat::Rgba16Float)
                        .with_usage(ImageUsage::SAMPLED),
                )
                .set_is_root(true);
                true
            }));
        assert!(matches!(
            compile_module(module, &FrameInfo::default()),
            Err(GraphicsError::IncompatibleResourceInfo { handle, .. }) if handle == target
        ));
    }

    #[rstest::rstest]
    #[case::read(Access::Read)]
    #[case::write(Access::Write)]
    fn test_swapchain_declared_as_buffer(#[case] access: Access) {
        let module = RenderModule::new().with_pass(
            RenderPass::new("root", PassType::Compute).with_setup(move |b| {
                let info = BufferInfo::new(64).with_usage(BufferUsage::STORAGE_BUFFER);
                match access {
                    Access::Write => b.write(ResourceHandle::SWAPCHAIN_IMAGE, info),
                    _ => b.read(ResourceHandle::SWAPCHAIN_IMAGE, info),
                };
                b.set_is_root(true);
                true
            }),
        );
        assert!(matches!(
            compile_module(module, &FrameInfo::default()),
            Err(GraphicsError::IncompatibleResourceInfo { handle, .. })
                if handle == ResourceHandle::SWAPCHAIN_IMAGE
        ));
    }

    #[test]
    fn test_alias_takeover_waits_for_previous_reader() {
        let a = ResourceHandle::buffer("a");
        let c = ResourceHandle::buffer("c");
        let storage = BufferInfo::new(256).with_usage(BufferUsage::STORAGE_BUFFER);
        let module = RenderModule::new()
            .with_pass(RenderPass::new("p0", PassType::Compute).with_setup(move |b| {
                b.write(a, storage);
                true
            }))
            .with_pass(RenderPass::new("p1", PassType::Compute).with_setup(move |b| {
                b.read(a, storage).write(c, storage.persistent());
                true
            }))
            .with_pass(RenderPass::new("p2", PassType::Compute).with_setup(move |b| {
                b.write(BUFFER_B, storage);
                true
            }))
            .with_pass(RenderPass::new("root", PassType::Draw).with_setup(move |b| {
                b.read(BUFFER_B, storage)
                    .read(c, storage.persistent())
                    .set_is_root(true);
                true
            }));
        let compiled = compile_module(module, &FrameInfo::default()).unwrap();
        let plan = compiled.plan();
        assert_eq!(plan.pass_names(), ["p0", "p1", "p2", "root"]);
        assert_eq!(plan.resource(a).unwrap().alias_slot, Some(0));
        assert_eq!(plan.resource(BUFFER_B).unwrap().alias_slot, Some(0));

        let barriers = &plan.passes[2].barriers;
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].hazard, Hazard::Alias);
        assert_eq!(barriers[0].resource, BUFFER_B);
        assert_eq!(barriers[0].producer, 1);
    }

    #[test]
    fn test_image_extent_defaults_to_frame() {
        let depth = ResourceHandle::image("depth");
        let module = RenderModule::new().with_pass(
            RenderPass::new("root", PassType::Draw).with_setup(move |b| {
                b.add_depth_stencil_attachment(depth, DepthStencilAttachment::new())
                    .set_is_root(true);
                true
            }),
        );
        let frame = FrameInfo::new(Extent3d::new_2d(320, 200), TextureFormat::Bgra8Unorm);
        let compiled = compile_module(module, &frame).unwrap();
        let info = compiled.plan().resource(depth).unwrap().info;
        assert_eq!(info.as_image().unwrap().extent, Extent3d::new_2d(320, 200));
        // The draw root still writes the surface.
        assert!(compiled.plan().targets_surface);
    }

    #[test]
    fn test_unformatted_image_is_invalid() {
        let scratch = ResourceHandle::image("scratch");
        let module = RenderModule::new().with_pass(
            RenderPass::new("root", PassType::Compute).with_setup(move |b| {
                b.write(scratch, ImageInfo::new().with_usage(ImageUsage::STORAGE))
                    .set_is_root(true);
                true
            }),
        );
        assert!(matches!(
            compile_module(module, &FrameInfo::default()),
            Err(GraphicsError::InvalidResourceInfo { handle, .. }) if handle == scratch
        ));
    }

    #[test]
    fn test_zero_sized_buffer_is_invalid() {
        let module = RenderModule::new().with_pass(
            RenderPass::new("root", PassType::Draw).with_setup(|b| {
                b.read(BUFFER_B, BufferInfo::new(0).with_usage(BufferUsage::VERTEX_BUFFER))
                    .set_is_root(true);
                true
            }),
        );
        assert!(matches!(
            compile_module(module, &FrameInfo::default()),
            Err(GraphicsError::InvalidResourceInfo { .. })
        ));
    }

    #[test]
    fn test_setup_runs_once_per_pass() {
        let mut calls = [0u32; 2];
        {
            let (first, second) = calls.split_at_mut(1);
            let module = RenderModule::new()
                .with_pass(RenderPass::new("lib", PassType::Compute).with_setup(|_| {
                    first[0] += 1;
                    true
                }))
                .with_pass(RenderPass::new("root", PassType::Draw).with_setup(|b| {
                    second[0] += 1;
                    b.set_is_root(true);
                    true
                }));
            let compiled = compile_module(module, &FrameInfo::default()).unwrap();
            assert_eq!(compiled.plan().pruned, ["lib"]);
        }
        assert_eq!(calls, [1, 1]);
    }

    #[test]
    fn test_lifetimes_follow_plan_order() {
        let module = RenderModule::new()
            .with_pass(RenderPass::new("upload", PassType::Transfer).with_setup(|b| {
                b.use_resource(BUFFER_B, BufferInfo::new(64).with_usage(BufferUsage::TRANSFER_DST));
                true
            }))
            .with_pass(RenderPass::new("draw", PassType::Draw).with_setup(|b| {
                b.use_resource(BUFFER_B, BufferInfo::new(64).with_usage(BufferUsage::VERTEX_BUFFER))
                    .set_is_root(true);
                true
            }));
        let compiled = compile_module(module, &FrameInfo::default()).unwrap();
        let b = compiled.plan().resource(BUFFER_B).unwrap();
        assert_eq!(b.lifetime, ResourceLifetime { first_use: 0, last_use: 1 });
        assert_eq!(b.alias_slot, Some(0));
    }
}
