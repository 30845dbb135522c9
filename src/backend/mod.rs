// Backend module - Vulkan abstraction layer
//
// Thin RAII wrappers around ash. Each wrapper holds an Arc<VulkanDevice>,
// so the device outlives everything created from it.

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use swapchain::Swapchain;
