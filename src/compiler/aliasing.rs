//! Greedy memory aliasing of transient resources.

use super::plan::{AliasSlot, PlannedResource};
use crate::resource::ResourceInfo;

/// Assign every transient resource to an alias slot.
///
/// Resources are visited by first use. A resource joins the first slot whose
/// current occupants are all dead before it starts and whose memory layout is
/// compatible: buffers always are (the slot grows to the largest size), images
/// only when format, extent, mips, layers and samples are identical.
pub(crate) fn assign_alias_slots(resources: &mut [PlannedResource]) -> Vec<AliasSlot> {
    let mut order: Vec<usize> = (0..resources.len())
        .filter(|&i| resources[i].info.is_transient())
        .collect();
    order.sort_by_key(|&i| (resources[i].lifetime.first_use, i));

    let mut slots: Vec<AliasSlot> = Vec::new();
    let mut busy_until: Vec<usize> = Vec::new();

    for index in order {
        let resource = &mut resources[index];
        let candidate = slots.iter().enumerate().position(|(slot, alias)| {
            busy_until[slot] < resource.lifetime.first_use
                && layout_compatible(&alias.info, &resource.info)
        });

        match candidate {
            Some(slot) => {
                // Compatible layouts always merge.
                if let Ok(merged) = slots[slot].info.merge(&resource.info) {
                    slots[slot].info = merged;
                }
                slots[slot].resources.push(resource.handle);
                busy_until[slot] = resource.lifetime.last_use;
                resource.alias_slot = Some(slot);
            }
            None => {
                resource.alias_slot = Some(slots.len());
                slots.push(AliasSlot {
                    info: resource.info,
                    resources: vec![resource.handle],
                });
                busy_until.push(resource.lifetime.last_use);
            }
        }
    }

    slots
}

fn layout_compatible(slot: &ResourceInfo, resource: &ResourceInfo) -> bool {
    match (slot, resource) {
        (ResourceInfo::Buffer(_), ResourceInfo::Buffer(_)) => true,
        (ResourceInfo::Image(a), ResourceInfo::Image(b)) => a.same_layout(b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::plan::ResourceLifetime;
    use crate::resource::{BufferInfo, ImageInfo, ResourceHandle};
    use crate::types::{BufferUsage, ImageUsage, TextureFormat};

    fn planned(name: &str, info: ResourceInfo, first_use: usize, last_use: usize) -> PlannedResource {
        let handle = if info.as_buffer().is_some() {
            ResourceHandle::buffer(name)
        } else {
            ResourceHandle::image(name)
        };
        PlannedResource {
            handle,
            info,
            lifetime: ResourceLifetime {
                first_use,
                last_use,
            },
            alias_slot: None,
        }
    }

    fn buffer(size: u64, usage: BufferUsage) -> ResourceInfo {
        BufferInfo::new(size).with_usage(usage).into()
    }

    fn image(format: TextureFormat) -> ResourceInfo {
        ImageInfo::new()
            .with_format(format)
            .with_extent_2d(256, 256)
            .with_usage(ImageUsage::COLOR_ATTACHMENT)
            .into()
    }

    #[test]
    fn test_disjoint_buffers_share_a_slot() {
        let mut resources = vec![
            planned("a", buffer(64, BufferUsage::STORAGE_BUFFER), 0, 1),
            planned("b", buffer(256, BufferUsage::UNIFORM_BUFFER), 2, 3),
        ];
        let slots = assign_alias_slots(&mut resources);
        assert_eq!(slots.len(), 1);
        assert_eq!(resources[0].alias_slot, Some(0));
        assert_eq!(resources[1].alias_slot, Some(0));
        let info = slots[0].info.as_buffer().unwrap();
        assert_eq!(info.size, 256);
        assert_eq!(
            info.usage,
            BufferUsage::STORAGE_BUFFER | BufferUsage::UNIFORM_BUFFER
        );
    }

    #[test]
    fn test_overlapping_lifetimes_never_alias() {
        let mut resources = vec![
            planned("a", buffer(64, BufferUsage::STORAGE_BUFFER), 0, 2),
            planned("b", buffer(64, BufferUsage::STORAGE_BUFFER), 2, 3),
        ];
        let slots = assign_alias_slots(&mut resources);
        assert_eq!(slots.len(), 2);
        assert_ne!(resources[0].alias_slot, resources[1].alias_slot);
    }

    #[test]
    fn test_images_alias_only_with_same_layout() {
        let mut resources = vec![
            planned("a", image(TextureFormat::Rgba8Unorm), 0, 0),
            planned("b", image(TextureFormat::Rgba16Float), 1, 1),
            planned("c", image(TextureFormat::Rgba8Unorm), 2, 2),
        ];
        let slots = assign_alias_slots(&mut resources);
        assert_eq!(slots.len(), 2);
        assert_eq!(resources[0].alias_slot, resources[2].alias_slot);
        assert_ne!(resources[0].alias_slot, resources[1].alias_slot);
    }

    #[test]
    fn test_persistent_resources_are_not_aliased() {
        let persistent: ResourceInfo = BufferInfo::new(64).persistent().into();
        let mut resources = vec![
            planned("a", persistent, 0, 0),
            planned("b", buffer(64, BufferUsage::STORAGE_BUFFER), 1, 1),
        ];
        let slots = assign_alias_slots(&mut resources);
        assert_eq!(slots.len(), 1);
        assert_eq!(resources[0].alias_slot, None);
        assert_eq!(slots[0].resources, vec![ResourceHandle::buffer("b")]);
    }
}
