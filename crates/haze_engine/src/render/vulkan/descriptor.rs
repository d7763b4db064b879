//! Descriptor set layouts, pools and batched writes
//!
//! Builder pattern throughout: layout definition is decoupled from pool
//! allocation, and all writes for one set are applied in a single batched
//! `update_descriptor_sets` call. The pool keeps a CPU-side capacity
//! ledger so exhaustion surfaces as a typed error before the driver is
//! asked, never as undefined behavior.

use ash::{vk, Device};
use std::collections::HashMap;

use crate::render::vulkan::{VulkanError, VulkanResult};

/// Descriptor set layout builder
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Add a binding
    ///
    /// Panics if the index was already used; reusing a binding index is a
    /// programming error, not a recoverable condition.
    pub fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
        count: u32,
    ) -> Self {
        assert!(
            !self.bindings.iter().any(|b| b.binding == binding),
            "binding index {} already in use",
            binding
        );
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags)
                .build(),
        );
        self
    }

    /// Add a storage image binding with count 1
    pub fn add_storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::STORAGE_IMAGE, stage_flags, 1)
    }

    /// Add a combined image sampler binding with count 1
    pub fn add_combined_image_sampler(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stage_flags, 1)
    }

    /// Build the descriptor set layout
    pub fn build(self, device: &Device) -> VulkanResult<DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&self.bindings);

        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(VulkanError::Api)?;

        Ok(DescriptorSetLayout {
            layout,
            device: device.clone(),
            bindings: self.bindings,
        })
    }
}

impl Default for DescriptorSetLayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable mapping from binding index to type, stage visibility and count
pub struct DescriptorSetLayout {
    layout: vk::DescriptorSetLayout,
    device: Device,
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayout {
    /// Get the Vulkan layout handle
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// The bindings declared in this layout
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding] {
        &self.bindings
    }

    fn binding(&self, index: u32) -> Option<&vk::DescriptorSetLayoutBinding> {
        self.bindings.iter().find(|b| b.binding == index)
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// CPU-side mirror of a pool's declared capacities
///
/// Checked before every allocation so the (C+1)-th request for a type of
/// capacity C fails deterministically with `PoolExhausted`.
#[derive(Debug, Clone)]
struct PoolLedger {
    remaining_sets: u32,
    remaining: HashMap<vk::DescriptorType, u32>,
}

impl PoolLedger {
    fn new(max_sets: u32, pool_sizes: &[vk::DescriptorPoolSize]) -> Self {
        let mut remaining = HashMap::new();
        for size in pool_sizes {
            *remaining.entry(size.ty).or_insert(0) += size.descriptor_count;
        }
        Self {
            remaining_sets: max_sets,
            remaining,
        }
    }

    fn reserve(&mut self, bindings: &[vk::DescriptorSetLayoutBinding]) -> VulkanResult<()> {
        if self.remaining_sets == 0 {
            return Err(VulkanError::PoolExhausted {
                reason: "max sets reached".to_string(),
            });
        }

        // Validate everything before committing anything
        for binding in bindings {
            let available = self.remaining.get(&binding.descriptor_type).copied().unwrap_or(0);
            if available < binding.descriptor_count {
                return Err(VulkanError::PoolExhausted {
                    reason: format!(
                        "{:?}: {} requested, {} remaining",
                        binding.descriptor_type, binding.descriptor_count, available
                    ),
                });
            }
        }

        for binding in bindings {
            *self.remaining.get_mut(&binding.descriptor_type).unwrap() -= binding.descriptor_count;
        }
        self.remaining_sets -= 1;
        Ok(())
    }
}

/// Descriptor pool builder
pub struct DescriptorPoolBuilder {
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    max_sets: u32,
}

impl DescriptorPoolBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self {
            pool_sizes: Vec::new(),
            max_sets: 1,
        }
    }

    /// Declare capacity for a descriptor type
    pub fn add_pool_size(mut self, descriptor_type: vk::DescriptorType, count: u32) -> Self {
        self.pool_sizes.push(
            vk::DescriptorPoolSize::builder()
                .ty(descriptor_type)
                .descriptor_count(count)
                .build(),
        );
        self
    }

    /// Set the maximum number of sets the pool may allocate
    pub fn set_max_sets(mut self, max_sets: u32) -> Self {
        self.max_sets = max_sets;
        self
    }

    /// Build the descriptor pool
    pub fn build(self, device: &Device) -> VulkanResult<DescriptorPool> {
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(self.max_sets)
            .pool_sizes(&self.pool_sizes);

        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(VulkanError::Api)?;

        Ok(DescriptorPool {
            pool,
            device: device.clone(),
            ledger: PoolLedger::new(self.max_sets, &self.pool_sizes),
            initial: PoolLedger::new(self.max_sets, &self.pool_sizes),
        })
    }
}

impl Default for DescriptorPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-capacity allocator for descriptor sets
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    device: Device,
    ledger: PoolLedger,
    initial: PoolLedger,
}

impl DescriptorPool {
    /// Allocate one descriptor set conforming to a layout
    pub fn allocate(&mut self, layout: &DescriptorSetLayout) -> VulkanResult<vk::DescriptorSet> {
        self.ledger.reserve(layout.bindings())?;

        let layouts = [layout.handle()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(VulkanError::Api)?;

        Ok(sets[0])
    }

    /// Reset the pool, freeing all allocated sets and restoring capacity
    pub fn reset(&mut self) -> VulkanResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty())
                .map_err(VulkanError::Api)?;
        }
        self.ledger = self.initial.clone();
        Ok(())
    }

    /// Get the pool handle
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

/// Batched descriptor set writer
///
/// Queues buffer and image writes against one layout, then allocates the
/// set and applies everything in a single update call. Writing a binding
/// the layout does not declare, or one with a count other than 1, is a
/// caller contract violation and panics.
pub struct DescriptorWriter<'a> {
    layout: &'a DescriptorSetLayout,
    buffer_writes: Vec<(u32, vk::DescriptorType, vk::DescriptorBufferInfo)>,
    image_writes: Vec<(u32, vk::DescriptorType, vk::DescriptorImageInfo)>,
}

impl<'a> DescriptorWriter<'a> {
    /// Create a writer for a layout
    pub fn new(layout: &'a DescriptorSetLayout) -> Self {
        Self {
            layout,
            buffer_writes: Vec::new(),
            image_writes: Vec::new(),
        }
    }

    fn checked_binding(&self, binding: u32) -> vk::DescriptorType {
        let declared = self
            .layout
            .binding(binding)
            .unwrap_or_else(|| panic!("binding {} not declared in layout", binding));
        assert_eq!(
            declared.descriptor_count, 1,
            "binding {} has count {}, only single-descriptor bindings are supported",
            binding, declared.descriptor_count
        );
        declared.descriptor_type
    }

    /// Queue a buffer write
    pub fn write_buffer(mut self, binding: u32, info: vk::DescriptorBufferInfo) -> Self {
        let ty = self.checked_binding(binding);
        self.buffer_writes.push((binding, ty, info));
        self
    }

    /// Queue an image write
    pub fn write_image(mut self, binding: u32, info: vk::DescriptorImageInfo) -> Self {
        let ty = self.checked_binding(binding);
        self.image_writes.push((binding, ty, info));
        self
    }

    /// Allocate a set from the pool and apply all queued writes at once
    pub fn build(self, pool: &mut DescriptorPool) -> VulkanResult<vk::DescriptorSet> {
        let set = pool.allocate(self.layout)?;
        let device = self.layout.device.clone();

        // Infos must outlive the write structs that point into them
        let buffer_infos: Vec<[vk::DescriptorBufferInfo; 1]> =
            self.buffer_writes.iter().map(|&(_, _, info)| [info]).collect();
        let image_infos: Vec<[vk::DescriptorImageInfo; 1]> =
            self.image_writes.iter().map(|&(_, _, info)| [info]).collect();

        let mut writes = Vec::with_capacity(buffer_infos.len() + image_infos.len());
        for ((binding, ty, _), info) in self.buffer_writes.iter().zip(&buffer_infos) {
            writes.push(
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .dst_array_element(0)
                    .descriptor_type(*ty)
                    .buffer_info(info)
                    .build(),
            );
        }
        for ((binding, ty, _), info) in self.image_writes.iter().zip(&image_infos) {
            writes.push(
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .dst_array_element(0)
                    .descriptor_type(*ty)
                    .image_info(info)
                    .build(),
            );
        }

        unsafe {
            device.update_descriptor_sets(&writes, &[]);
        }

        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(
        index: u32,
        ty: vk::DescriptorType,
        count: u32,
    ) -> vk::DescriptorSetLayoutBinding {
        vk::DescriptorSetLayoutBinding::builder()
            .binding(index)
            .descriptor_type(ty)
            .descriptor_count(count)
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .build()
    }

    #[test]
    fn ledger_allows_exactly_declared_capacity() {
        let sizes = [vk::DescriptorPoolSize::builder()
            .ty(vk::DescriptorType::STORAGE_IMAGE)
            .descriptor_count(3)
            .build()];
        let mut ledger = PoolLedger::new(3, &sizes);
        let bindings = [binding(0, vk::DescriptorType::STORAGE_IMAGE, 1)];

        for _ in 0..3 {
            ledger.reserve(&bindings).unwrap();
        }
        let result = ledger.reserve(&bindings);
        assert!(matches!(result, Err(VulkanError::PoolExhausted { .. })));
    }

    #[test]
    fn ledger_tracks_max_sets_independently() {
        let sizes = [vk::DescriptorPoolSize::builder()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(10)
            .build()];
        let mut ledger = PoolLedger::new(1, &sizes);
        let bindings = [binding(0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1)];

        ledger.reserve(&bindings).unwrap();
        // Plenty of descriptors left, but no sets
        let result = ledger.reserve(&bindings);
        assert!(matches!(result, Err(VulkanError::PoolExhausted { .. })));
    }

    #[test]
    fn ledger_rejects_undeclared_type() {
        let sizes = [vk::DescriptorPoolSize::builder()
            .ty(vk::DescriptorType::STORAGE_IMAGE)
            .descriptor_count(4)
            .build()];
        let mut ledger = PoolLedger::new(4, &sizes);
        let bindings = [binding(0, vk::DescriptorType::UNIFORM_BUFFER, 1)];

        let result = ledger.reserve(&bindings);
        assert!(matches!(result, Err(VulkanError::PoolExhausted { .. })));
    }

    #[test]
    fn failed_reserve_commits_nothing() {
        let sizes = [
            vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(2)
                .build(),
            vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(1)
                .build(),
        ];
        let mut ledger = PoolLedger::new(4, &sizes);
        // Two storage images fit, but the second sampler does not
        let big = [
            binding(0, vk::DescriptorType::STORAGE_IMAGE, 2),
            binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 2),
        ];
        assert!(ledger.reserve(&big).is_err());

        // The storage-image capacity must be untouched by the failure
        let small = [binding(0, vk::DescriptorType::STORAGE_IMAGE, 2)];
        ledger.reserve(&small).unwrap();
    }

    #[test]
    #[should_panic(expected = "binding index 0 already in use")]
    fn duplicate_binding_index_panics() {
        let _ = DescriptorSetLayoutBuilder::new()
            .add_storage_image(0, vk::ShaderStageFlags::COMPUTE)
            .add_storage_image(0, vk::ShaderStageFlags::COMPUTE);
    }
}
