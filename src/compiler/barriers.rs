//! Barrier placement between ordered passes.

use std::collections::HashMap;

use super::plan::{AccessScope, AliasSlot, Barrier, Hazard, PlannedPass, PlannedResource};
use crate::resource::{FnvBuildHasher, ResourceHandle};

#[derive(Default)]
struct HandleState {
    last_writer: Option<(usize, AccessScope)>,
    readers: Vec<(usize, AccessScope)>,
}

/// Fill in [`PlannedPass::barriers`] by walking the passes in plan order.
///
/// A read waits on the last writer. A write waits on every read since the last
/// write, or on the last writer when nothing read in between.
pub(crate) fn place_barriers(passes: &mut [PlannedPass]) {
    let mut states: HashMap<ResourceHandle, HandleState, FnvBuildHasher> = HashMap::default();

    for (index, pass) in passes.iter_mut().enumerate() {
        let mut barriers = Vec::new();

        for declaration in &pass.resources {
            let state = states.entry(declaration.handle).or_default();
            let scope = AccessScope {
                pass_type: pass.pass_type,
                usage: declaration.info.usage(),
            };

            if declaration.access.is_read() {
                if let Some((producer, src)) = state.last_writer {
                    barriers.push(Barrier {
                        resource: declaration.handle,
                        hazard: Hazard::ReadAfterWrite,
                        producer,
                        src,
                        dst: scope,
                    });
                }
            }

            if declaration.access.is_write() {
                let earlier_readers: Vec<_> = state
                    .readers
                    .iter()
                    .filter(|(reader, _)| *reader != index)
                    .copied()
                    .collect();
                if !earlier_readers.is_empty() {
                    barriers.extend(earlier_readers.into_iter().map(|(producer, src)| Barrier {
                        resource: declaration.handle,
                        hazard: Hazard::WriteAfterRead,
                        producer,
                        src,
                        dst: scope,
                    }));
                } else if let Some((producer, src)) = state.last_writer {
                    // A read-write pass already waits through its read barrier.
                    if !declaration.access.is_read() {
                        barriers.push(Barrier {
                            resource: declaration.handle,
                            hazard: Hazard::WriteAfterWrite,
                            producer,
                            src,
                            dst: scope,
                        });
                    }
                }
                state.last_writer = Some((index, scope));
                state.readers.clear();
            } else {
                state.readers.push((index, scope));
            }
        }

        pass.barriers = barriers;
    }
}

/// Order every takeover of an alias slot after the previous occupant.
///
/// The new occupant's first pass waits on the previous occupant's final
/// accesses: the reads since its last write, or that write when nothing read
/// it afterwards.
pub(crate) fn place_alias_barriers(
    passes: &mut [PlannedPass],
    resources: &[PlannedResource],
    slots: &[AliasSlot],
) {
    let planned = |handle: ResourceHandle| resources.iter().find(|r| r.handle == handle);

    for slot in slots {
        for pair in slot.resources.windows(2) {
            let (Some(previous), Some(next)) = (planned(pair[0]), planned(pair[1])) else {
                continue;
            };
            let last_accesses = final_accesses(passes, previous);
            let first = next.lifetime.first_use;
            let Some(dst) = access_scope(&passes[first], next.handle) else {
                continue;
            };
            passes[first]
                .barriers
                .extend(last_accesses.into_iter().map(|(producer, src)| Barrier {
                    resource: next.handle,
                    hazard: Hazard::Alias,
                    producer,
                    src,
                    dst,
                }));
        }
    }
}

fn access_scope(pass: &PlannedPass, handle: ResourceHandle) -> Option<AccessScope> {
    pass.resources
        .iter()
        .find(|d| d.handle == handle)
        .map(|declaration| AccessScope {
            pass_type: pass.pass_type,
            usage: declaration.info.usage(),
        })
}

fn final_accesses(passes: &[PlannedPass], resource: &PlannedResource) -> Vec<(usize, AccessScope)> {
    let mut state = HandleState::default();
    let lifetime = resource.lifetime;
    for (index, pass) in passes
        .iter()
        .enumerate()
        .take(lifetime.last_use + 1)
        .skip(lifetime.first_use)
    {
        for declaration in pass.resources.iter().filter(|d| d.handle == resource.handle) {
            let scope = AccessScope {
                pass_type: pass.pass_type,
                usage: declaration.info.usage(),
            };
            if declaration.access.is_write() {
                state.last_writer = Some((index, scope));
                state.readers.clear();
            } else {
                state.readers.push((index, scope));
            }
        }
    }
    if state.readers.is_empty() {
        state.last_writer.into_iter().collect()
    } else {
        state.readers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::plan::ResourceLifetime;
    use crate::graph::{Access, PassType, ResourceDeclaration};
    use crate::resource::{BufferInfo, ResourceInfo};
    use crate::types::BufferUsage;

    const DATA: ResourceHandle = ResourceHandle::buffer("data");

    fn pass(name: &str, pass_type: PassType, access: Access, usage: BufferUsage) -> PlannedPass {
        pass_on(DATA, name, pass_type, access, usage)
    }

    fn pass_on(
        handle: ResourceHandle,
        name: &str,
        pass_type: PassType,
        access: Access,
        usage: BufferUsage,
    ) -> PlannedPass {
        PlannedPass {
            name: name.into(),
            pass_type,
            module_index: 0,
            resources: vec![ResourceDeclaration {
                handle,
                info: ResourceInfo::Buffer(BufferInfo::new(64).with_usage(usage)),
                access,
            }],
            color_attachments: Vec::new(),
            depth_attachment: None,
            barriers: Vec::new(),
            is_root: false,
        }
    }

    #[test]
    fn test_write_then_read() {
        let mut passes = vec![
            pass("upload", PassType::Transfer, Access::Write, BufferUsage::TRANSFER_DST),
            pass("draw", PassType::Draw, Access::Read, BufferUsage::VERTEX_BUFFER),
        ];
        place_barriers(&mut passes);
        assert!(passes[0].barriers.is_empty());
        let barrier = passes[1].barriers[0];
        assert_eq!(barrier.hazard, Hazard::ReadAfterWrite);
        assert_eq!(barrier.producer, 0);
        assert_eq!(barrier.src.pass_type, PassType::Transfer);
        assert_eq!(barrier.dst.pass_type, PassType::Draw);
    }

    #[test]
    fn test_write_after_reads() {
        let mut passes = vec![
            pass("w0", PassType::Transfer, Access::Write, BufferUsage::TRANSFER_DST),
            pass("r1", PassType::Compute, Access::Read, BufferUsage::UNIFORM_BUFFER),
            pass("r2", PassType::Draw, Access::Read, BufferUsage::VERTEX_BUFFER),
            pass("w3", PassType::Transfer, Access::Write, BufferUsage::TRANSFER_DST),
        ];
        place_barriers(&mut passes);
        let hazards: Vec<_> = passes[3].barriers.iter().map(|b| (b.hazard, b.producer)).collect();
        assert_eq!(
            hazards,
            [(Hazard::WriteAfterRead, 1), (Hazard::WriteAfterRead, 2)]
        );
    }

    #[test]
    fn test_write_after_write() {
        let mut passes = vec![
            pass("a", PassType::Transfer, Access::Write, BufferUsage::TRANSFER_DST),
            pass("b", PassType::Transfer, Access::Write, BufferUsage::TRANSFER_DST),
        ];
        place_barriers(&mut passes);
        assert_eq!(passes[1].barriers.len(), 1);
        assert_eq!(passes[1].barriers[0].hazard, Hazard::WriteAfterWrite);
    }

    #[test]
    fn test_read_write_waits_once() {
        let mut passes = vec![
            pass("a", PassType::Compute, Access::Write, BufferUsage::STORAGE_BUFFER),
            pass("b", PassType::Compute, Access::ReadWrite, BufferUsage::STORAGE_BUFFER),
        ];
        place_barriers(&mut passes);
        assert_eq!(passes[1].barriers.len(), 1);
        assert_eq!(passes[1].barriers[0].hazard, Hazard::ReadAfterWrite);
    }

    #[test]
    fn test_alias_takeover_waits_for_last_writer() {
        const SCRATCH: ResourceHandle = ResourceHandle::buffer("scratch");
        let mut passes = vec![
            pass("fill", PassType::Compute, Access::Write, BufferUsage::STORAGE_BUFFER),
            pass("refill", PassType::Transfer, Access::Write, BufferUsage::TRANSFER_DST),
            pass_on(SCRATCH, "scratch", PassType::Compute, Access::Write, BufferUsage::STORAGE_BUFFER),
        ];
        let planned = |handle, first_use, last_use| PlannedResource {
            handle,
            info: ResourceInfo::Buffer(BufferInfo::new(64)),
            lifetime: ResourceLifetime { first_use, last_use },
            alias_slot: Some(0),
        };
        let resources = [planned(DATA, 0, 1), planned(SCRATCH, 2, 2)];
        let slots = [AliasSlot {
            info: ResourceInfo::Buffer(BufferInfo::new(64)),
            resources: vec![DATA, SCRATCH],
        }];

        place_barriers(&mut passes);
        place_alias_barriers(&mut passes, &resources, &slots);

        let barrier = passes[2].barriers[0];
        assert_eq!(passes[2].barriers.len(), 1);
        assert_eq!(barrier.hazard, Hazard::Alias);
        assert_eq!(barrier.resource, SCRATCH);
        assert_eq!(barrier.producer, 1);
        assert_eq!(barrier.src.pass_type, PassType::Transfer);
        assert_eq!(barrier.dst.pass_type, PassType::Compute);
    }
}
