use ash::vk;
use dare_streaming::format::{ImageLayout, PixelFormat};

pub fn vk_format(format: PixelFormat) -> vk::Format {
    match format {
        PixelFormat::R8Unorm => vk::Format::R8_UNORM,
        PixelFormat::Rg8Unorm => vk::Format::R8G8_UNORM,
        PixelFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        PixelFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        PixelFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        PixelFormat::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        PixelFormat::R16Float => vk::Format::R16_SFLOAT,
        PixelFormat::Rg16Float => vk::Format::R16G16_SFLOAT,
        PixelFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        PixelFormat::R32Float => vk::Format::R32_SFLOAT,
        PixelFormat::Rg32Float => vk::Format::R32G32_SFLOAT,
        PixelFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        PixelFormat::R32Uint => vk::Format::R32_UINT,
    }
}

pub fn vk_layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::CopyDestination => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }
}

/// Stage and access a layout is produced or consumed with on the copy queue
pub(crate) fn layout_scope(layout: ImageLayout) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    match layout {
        ImageLayout::Undefined => (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE),
        ImageLayout::CopyDestination => (
            vk::PipelineStageFlags2::COPY,
            vk::AccessFlags2::TRANSFER_WRITE,
        ),
        // readers live on other queues and synchronize through the timeline semaphore
        ImageLayout::ShaderReadOnly => {
            (vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::NONE)
        }
    }
}

/// Whole color subresource of a single level, single layer image
pub(crate) fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}
