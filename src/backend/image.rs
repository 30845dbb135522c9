// Images: depth attachment, sampled texture, layout transitions
//
// The texture upload goes through a host-visible, linearly tiled staging
// image rather than a staging buffer:
//
//   staging (LINEAR, PREINITIALIZED) <- memcpy pixels row by row
//   staging  PREINITIALIZED      -> TRANSFER_SRC_OPTIMAL
//   texture  UNDEFINED           -> TRANSFER_DST_OPTIMAL
//   vkCmdCopyImage staging -> texture
//   texture  TRANSFER_DST_OPTIMAL -> SHADER_READ_ONLY_OPTIMAL
//
// All four commands go into a single one-time command buffer.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::command::CommandPool;
use super::device::report_free;
use super::VulkanDevice;
use crate::assets::TextureData;

/// Colour format of the uploaded texture (pixels are sRGB encoded)
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Depth formats in order of preference
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 5] = [
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM_S8_UINT,
    vk::Format::D16_UNORM,
];

/// Parameters for a single-mip, single-layer 2D image
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc<'a> {
    pub name: &'a str,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub initial_layout: vk::ImageLayout,
    pub location: MemoryLocation,
}

/// A VkImage with its own memory allocation
pub struct Image {
    pub image: vk::Image,
    pub extent: vk::Extent2D,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl Image {
    pub fn new(device: Arc<VulkanDevice>, desc: &ImageDesc) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(desc.tiling)
            .initial_layout(desc.initial_layout)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image '{}'", desc.name))?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = device.allocator().allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location: desc.location,
            linear: desc.tiling == vk::ImageTiling::LINEAR,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e)
                    .with_context(|| format!("Failed to allocate memory for '{}'", desc.name));
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            report_free("image", device.allocator().free(allocation));
            unsafe { device.device.destroy_image(image, None) };
            return Err(e).with_context(|| format!("Failed to bind memory for '{}'", desc.name));
        }

        Ok(Self {
            image,
            extent: desc.extent,
            allocation: Some(allocation),
            device,
        })
    }

    /// Copy tightly packed rows into a host-visible, linearly tiled image
    fn write_rows(&mut self, pixels: &[u8], row_bytes: usize) -> Result<()> {
        let layout = unsafe {
            self.device.device.get_image_subresource_layout(
                self.image,
                vk::ImageSubresource {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    array_layer: 0,
                },
            )
        };

        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .context("Staging image is not host visible")?;
        let start = layout.offset as usize;
        let dst = mapped
            .get_mut(start..)
            .context("Subresource offset lies outside the mapping")?;

        copy_rows(
            pixels,
            dst,
            row_bytes,
            layout.row_pitch as usize,
            self.extent.height as usize,
        )
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_image(self.image, None) };
        if let Some(allocation) = self.allocation.take() {
            report_free("image", self.device.allocator().free(allocation));
        }
    }
}

pub fn create_view(
    device: &VulkanDevice,
    image: vk::Image,
    format: vk::Format,
    aspect_mask: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(subresource_range(aspect_mask));

    unsafe { device.device.create_image_view(&view_info, None) }
        .context("Failed to create image view")
}

fn subresource_range(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

// =============================================================================
// LAYOUT TRANSITIONS
// =============================================================================

/// Access masks and pipeline stages on either side of a layout change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Barrier parameters for the layout changes this renderer performs
pub fn transition_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> Result<LayoutTransition> {
    use vk::{AccessFlags as A, ImageLayout as L, PipelineStageFlags as S};

    let (src_access, dst_access, src_stage, dst_stage) = match (old_layout, new_layout) {
        // Host wrote the pixels through the mapping
        (L::PREINITIALIZED, L::TRANSFER_SRC_OPTIMAL) => {
            (A::HOST_WRITE, A::TRANSFER_READ, S::HOST, S::TRANSFER)
        }
        (L::PREINITIALIZED, L::TRANSFER_DST_OPTIMAL) => {
            (A::HOST_WRITE, A::TRANSFER_WRITE, S::HOST, S::TRANSFER)
        }
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => {
            (A::empty(), A::TRANSFER_WRITE, S::TOP_OF_PIPE, S::TRANSFER)
        }
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::TRANSFER_WRITE, A::SHADER_READ, S::TRANSFER, S::FRAGMENT_SHADER)
        }
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
            A::empty(),
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            S::TOP_OF_PIPE,
            S::EARLY_FRAGMENT_TESTS,
        ),
        _ => anyhow::bail!(
            "Unsupported image layout transition: {:?} -> {:?}",
            old_layout,
            new_layout
        ),
    };

    Ok(LayoutTransition {
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    })
}

/// Record a pipeline barrier moving `image` from `old_layout` to `new_layout`
pub fn record_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspect_mask: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> Result<()> {
    let masks = transition_masks(old_layout, new_layout)?;

    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource_range(aspect_mask))
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
    Ok(())
}

/// Copy `rows` rows of `row_bytes` each from a packed source into a
/// destination whose rows start every `row_pitch` bytes.
pub fn copy_rows(
    src: &[u8],
    dst: &mut [u8],
    row_bytes: usize,
    row_pitch: usize,
    rows: usize,
) -> Result<()> {
    anyhow::ensure!(
        row_pitch >= row_bytes,
        "Row pitch {} is smaller than a row ({} bytes)",
        row_pitch,
        row_bytes
    );
    anyhow::ensure!(
        src.len() >= row_bytes * rows,
        "Source holds {} bytes, need {}",
        src.len(),
        row_bytes * rows
    );
    anyhow::ensure!(rows == 0 || row_bytes > 0, "Rows must be at least one byte wide");
    if rows == 0 {
        return Ok(());
    }
    let needed = row_pitch * (rows - 1) + row_bytes;
    anyhow::ensure!(
        dst.len() >= needed,
        "Destination holds {} bytes, need {}",
        dst.len(),
        needed
    );

    if row_pitch == row_bytes {
        dst[..row_bytes * rows].copy_from_slice(&src[..row_bytes * rows]);
        return Ok(());
    }

    for (row, chunk) in src.chunks_exact(row_bytes).take(rows).enumerate() {
        let start = row * row_pitch;
        dst[start..start + row_bytes].copy_from_slice(chunk);
    }
    Ok(())
}

// =============================================================================
// DEPTH BUFFER
// =============================================================================

/// First candidate usable as an optimally tiled depth attachment
pub fn find_depth_format(
    candidates: &[vk::Format],
    format_properties: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| {
        format_properties(format)
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
}

pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::S8_UINT
    )
}

pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    if has_stencil(format) {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::DEPTH
    }
}

/// Pick the depth format for this device
pub fn supported_depth_format(device: &VulkanDevice) -> Result<vk::Format> {
    find_depth_format(&DEPTH_FORMAT_CANDIDATES, |format| unsafe {
        device
            .instance
            .get_physical_device_format_properties(device.physical_device, format)
    })
    .context("No supported depth format")
}

pub struct DepthBuffer {
    pub view: vk::ImageView,
    // Backs the view; freed after it
    _image: Image,
    device: Arc<VulkanDevice>,
}

impl DepthBuffer {
    pub fn new(
        device: Arc<VulkanDevice>,
        pool: &CommandPool,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let image = Image::new(
            device.clone(),
            &ImageDesc {
                name: "depth",
                extent,
                format,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                initial_layout: vk::ImageLayout::UNDEFINED,
                location: MemoryLocation::GpuOnly,
            },
        )?;

        let aspect = depth_aspect(format);
        pool.one_time_submit(|dev, cmd| {
            record_transition(
                dev,
                cmd,
                image.image,
                aspect,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            )
        })?;

        // The view only exposes depth; stencil is never sampled
        let view = create_view(&device, image.image, format, vk::ImageAspectFlags::DEPTH)?;

        Ok(Self {
            view,
            _image: image,
            device,
        })
    }
}

impl Drop for DepthBuffer {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_image_view(self.view, None) };
    }
}

// =============================================================================
// TEXTURE
// =============================================================================

/// Device-local sampled texture
pub struct Texture {
    pub sampler: vk::Sampler,
    pub view: vk::ImageView,
    _image: Image,
    device: Arc<VulkanDevice>,
}

impl Texture {
    /// Upload decoded pixels into device-local memory through a staging image
    pub fn upload(device: Arc<VulkanDevice>, pool: &CommandPool, data: &TextureData) -> Result<Self> {
        anyhow::ensure!(data.width > 0 && data.height > 0, "Texture has no pixels");
        anyhow::ensure!(
            data.pixels.len() == data.byte_len(),
            "Texture holds {} bytes, expected {}",
            data.pixels.len(),
            data.byte_len()
        );

        let extent = vk::Extent2D {
            width: data.width,
            height: data.height,
        };

        // Host-visible source the CPU can write directly
        let mut staging = Image::new(
            device.clone(),
            &ImageDesc {
                name: "texture staging",
                extent,
                format: TEXTURE_FORMAT,
                tiling: vk::ImageTiling::LINEAR,
                usage: vk::ImageUsageFlags::TRANSFER_SRC,
                initial_layout: vk::ImageLayout::PREINITIALIZED,
                location: MemoryLocation::CpuToGpu,
            },
        )?;
        staging.write_rows(&data.pixels, data.row_bytes())?;

        let image = Image::new(
            device.clone(),
            &ImageDesc {
                name: "texture",
                extent,
                format: TEXTURE_FORMAT,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
                initial_layout: vk::ImageLayout::UNDEFINED,
                location: MemoryLocation::GpuOnly,
            },
        )?;

        pool.one_time_submit(|dev, cmd| {
            let color = vk::ImageAspectFlags::COLOR;
            record_transition(
                dev,
                cmd,
                staging.image,
                color,
                vk::ImageLayout::PREINITIALIZED,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            )?;
            record_transition(
                dev,
                cmd,
                image.image,
                color,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )?;

            let layers = vk::ImageSubresourceLayers {
                aspect_mask: color,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            };
            let region = vk::ImageCopy {
                src_subresource: layers,
                src_offset: vk::Offset3D::default(),
                dst_subresource: layers,
                dst_offset: vk::Offset3D::default(),
                extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
            };
            unsafe {
                dev.cmd_copy_image(
                    cmd,
                    staging.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }

            record_transition(
                dev,
                cmd,
                image.image,
                color,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
        })?;

        // The copy has completed (one_time_submit waits), staging can go
        drop(staging);

        let view = create_view(&device, image.image, TEXTURE_FORMAT, vk::ImageAspectFlags::COLOR)?;
        let sampler = match create_sampler(&device) {
            Ok(sampler) => sampler,
            Err(e) => {
                unsafe { device.device.destroy_image_view(view, None) };
                return Err(e);
            }
        };

        log::info!("Uploaded {}x{} texture", data.width, data.height);

        Ok(Self {
            sampler,
            view,
            _image: image,
            device,
        })
    }

    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }
}

fn create_sampler(device: &VulkanDevice) -> Result<vk::Sampler> {
    let max_anisotropy = device.properties.limits.max_sampler_anisotropy.min(16.0);

    let create_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(true)
        .max_anisotropy(max_anisotropy)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .min_lod(0.0)
        .max_lod(0.0);

    unsafe { device.device.create_sampler(&create_info, None) }.context("Failed to create sampler")
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_sampler(self.sampler, None);
            self.device.device.destroy_image_view(self.view, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_protocol_transitions_are_supported() {
        let staging = transition_masks(
            vk::ImageLayout::PREINITIALIZED,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )
        .unwrap();
        assert_eq!(staging.src_access, vk::AccessFlags::HOST_WRITE);
        assert_eq!(staging.dst_access, vk::AccessFlags::TRANSFER_READ);
        assert_eq!(staging.src_stage, vk::PipelineStageFlags::HOST);

        let dst = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert!(dst.src_access.is_empty());
        assert_eq!(dst.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let read = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(read.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(read.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(read.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn depth_transition_waits_for_fragment_tests() {
        let depth = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )
        .unwrap();
        assert_eq!(depth.dst_stage, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS);
        assert!(depth
            .dst_access
            .contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
    }

    #[test]
    fn unknown_transition_is_an_error() {
        let err = transition_masks(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::PREINITIALIZED,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unsupported image layout transition"));
    }

    #[test]
    fn depth_format_skips_unsupported_candidates() {
        let supported = |format: vk::Format| vk::FormatProperties {
            optimal_tiling_features: if format == vk::Format::D24_UNORM_S8_UINT
                || format == vk::Format::D16_UNORM
            {
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::FormatFeatureFlags::SAMPLED_IMAGE
            },
            ..Default::default()
        };
        assert_eq!(
            find_depth_format(&DEPTH_FORMAT_CANDIDATES, supported),
            Some(vk::Format::D24_UNORM_S8_UINT)
        );
        assert_eq!(
            find_depth_format(&DEPTH_FORMAT_CANDIDATES, |_| vk::FormatProperties::default()),
            None
        );
    }

    #[test]
    fn linear_tiling_support_is_not_enough_for_depth() {
        let linear_only = |_: vk::Format| vk::FormatProperties {
            linear_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            ..Default::default()
        };
        assert_eq!(find_depth_format(&DEPTH_FORMAT_CANDIDATES, linear_only), None);
    }

    #[test]
    fn stencil_formats_get_stencil_aspect() {
        assert_eq!(
            depth_aspect(vk::Format::D32_SFLOAT_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(depth_aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert!(!has_stencil(vk::Format::D16_UNORM));
    }

    #[test]
    fn copy_rows_honours_row_pitch() {
        // 2 rows of 3 bytes into rows 4 bytes apart
        let src = [1, 2, 3, 4, 5, 6];
        let mut dst = [0u8; 8];
        copy_rows(&src, &mut dst, 3, 4, 2).unwrap();
        assert_eq!(dst, [1, 2, 3, 0, 4, 5, 6, 0]);
    }

    #[test]
    fn copy_rows_packed_fast_path() {
        let src = [9u8; 12];
        let mut dst = [0u8; 12];
        copy_rows(&src, &mut dst, 4, 4, 3).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn copy_rows_rejects_short_buffers() {
        let mut dst = [0u8; 6];
        assert!(copy_rows(&[0; 6], &mut dst, 3, 4, 2).is_err());
        assert!(copy_rows(&[0; 5], &mut [0u8; 16], 3, 4, 2).is_err());
        assert!(copy_rows(&[0; 6], &mut [0u8; 16], 3, 2, 2).is_err());
        // the last row needs no padding after it
        assert!(copy_rows(&[0; 6], &mut [0u8; 7], 3, 4, 2).is_ok());
    }

    #[test]
    fn copy_rows_rejects_zero_width_rows() {
        let mut dst = [7u8; 16];
        assert!(copy_rows(&[], &mut dst, 0, 4, 2).is_err());
        assert!(copy_rows(&[], &mut dst, 0, 0, 2).is_err());
        assert_eq!(dst, [7u8; 16]);
        // nothing to copy is still fine
        assert!(copy_rows(&[], &mut dst, 0, 4, 0).is_ok());
    }
}
