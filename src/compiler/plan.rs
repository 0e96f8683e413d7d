//! Execution plan produced by the compiler.

use crate::graph::{Attachment, PassType, ResourceDeclaration};
use crate::resource::{ResourceHandle, ResourceInfo, ResourceUsage};

/// Kind of hazard a barrier resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hazard {
    /// A read of data written by an earlier pass.
    ReadAfterWrite,
    /// Two passes writing the same resource.
    WriteAfterWrite,
    /// A write that must wait until earlier reads are done.
    WriteAfterRead,
    /// First use of a transient whose memory a previous resource of the same
    /// alias slot occupied. The previous contents are discarded.
    Alias,
}

/// One side of a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessScope {
    pub pass_type: PassType,
    pub usage: ResourceUsage,
}

/// Synchronization required before a pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Barrier {
    pub resource: ResourceHandle,
    pub hazard: Hazard,
    /// Plan index of the pass whose access must complete first.
    pub producer: usize,
    pub src: AccessScope,
    pub dst: AccessScope,
}

/// Range of plan indices in which a resource is used, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceLifetime {
    pub first_use: usize,
    pub last_use: usize,
}

impl ResourceLifetime {
    pub fn new(index: usize) -> Self {
        Self {
            first_use: index,
            last_use: index,
        }
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.first_use <= other.last_use && other.first_use <= self.last_use
    }

    pub(crate) fn extend(&mut self, index: usize) {
        self.first_use = self.first_use.min(index);
        self.last_use = self.last_use.max(index);
    }
}

/// A resource in the plan with its merged description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedResource {
    pub handle: ResourceHandle,
    /// Merged info across all surviving passes.
    pub info: ResourceInfo,
    pub lifetime: ResourceLifetime,
    /// Index into [`ExecutionPlan::alias_slots`] for transient resources.
    pub alias_slot: Option<usize>,
}

/// Physical memory shared by transient resources with disjoint lifetimes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasSlot {
    /// Description large enough for every resource in the slot.
    pub info: ResourceInfo,
    /// Resources backed by this slot, in order of first use.
    pub resources: Vec<ResourceHandle>,
}

/// A pass scheduled for execution.
#[derive(Debug, Clone)]
pub struct PlannedPass {
    pub name: String,
    pub pass_type: PassType,
    /// Position of the pass in the render module.
    pub module_index: usize,
    pub resources: Vec<ResourceDeclaration>,
    pub color_attachments: Vec<Attachment>,
    pub depth_attachment: Option<Attachment>,
    /// Barriers to insert before the pass executes.
    pub barriers: Vec<Barrier>,
    pub is_root: bool,
}

/// Ordered, resolved description of one frame's work.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    pub passes: Vec<PlannedPass>,
    /// Resources in order of first use.
    pub resources: Vec<PlannedResource>,
    pub alias_slots: Vec<AliasSlot>,
    /// Names of passes removed because the root does not depend on them.
    pub pruned: Vec<String>,
    /// Names of passes whose setup declined to run this frame.
    pub withdrawn: Vec<String>,
    /// Whether the plan writes the presentable image.
    pub targets_surface: bool,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Pass names in execution order.
    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name.as_str()).collect()
    }

    /// Plan index of the pass called `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.passes.iter().position(|p| p.name == name)
    }

    pub fn resource(&self, handle: ResourceHandle) -> Option<&PlannedResource> {
        self.resources.iter().find(|r| r.handle == handle)
    }

    /// All barriers in the plan, in execution order.
    pub fn barriers(&self) -> impl Iterator<Item = &Barrier> {
        self.passes.iter().flat_map(|p| p.barriers.iter())
    }
}
