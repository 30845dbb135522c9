// Presentation surface - platform window connection
//
// ash-window turns the raw window handles into a VkSurfaceKHR. The owning
// VulkanDevice destroys it, after the logical device and before the instance.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::{vk, Entry};
use rwh_05::{RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;

/// Instance extensions needed to create a surface for this display
pub fn required_extensions(display_handle: RawDisplayHandle) -> Result<Vec<&'static CStr>> {
    let names = ash_window::enumerate_required_extensions(display_handle)
        .with_context(|| format!("Unsupported display handle: {:?}", display_handle))?;
    // ash-window hands back pointers to ash's static extension names
    Ok(names.iter().map(|&name| unsafe { CStr::from_ptr(name) }).collect())
}

pub struct Surface {
    pub handle: vk::SurfaceKHR,
    pub loader: khr::Surface,
}

impl Surface {
    pub fn new(
        entry: &Entry,
        instance: &ash::Instance,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Self> {
        let handle = unsafe {
            ash_window::create_surface(entry, instance, display_handle, window_handle, None)
        }
        .context("Failed to create window surface")?;

        Ok(Self {
            handle,
            loader: khr::Surface::new(entry, instance),
        })
    }

    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, queue_family: u32) -> Result<bool> {
        let supported = unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, queue_family, self.handle)
        }?;
        Ok(supported)
    }

    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> Result<vk::SurfaceCapabilitiesKHR> {
        let caps = unsafe {
            self.loader
                .get_physical_device_surface_capabilities(physical_device, self.handle)
        }?;
        Ok(caps)
    }

    pub fn formats(&self, physical_device: vk::PhysicalDevice) -> Result<Vec<vk::SurfaceFormatKHR>> {
        let formats = unsafe {
            self.loader
                .get_physical_device_surface_formats(physical_device, self.handle)
        }?;
        Ok(formats)
    }

    pub fn present_modes(&self, physical_device: vk::PhysicalDevice) -> Result<Vec<vk::PresentModeKHR>> {
        let modes = unsafe {
            self.loader
                .get_physical_device_surface_present_modes(physical_device, self.handle)
        }?;
        Ok(modes)
    }

    /// # Safety
    /// Every swapchain created on this surface must already be destroyed.
    pub unsafe fn destroy(&self) {
        self.loader.destroy_surface(self.handle, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rwh_05::{
        WaylandDisplayHandle, WebDisplayHandle, WindowsDisplayHandle, XcbDisplayHandle,
        XlibDisplayHandle,
    };

    fn names(display: RawDisplayHandle) -> Vec<String> {
        required_extensions(display)
            .unwrap()
            .iter()
            .map(|name| name.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn every_platform_needs_khr_surface() {
        assert_eq!(
            names(RawDisplayHandle::Windows(WindowsDisplayHandle::empty())),
            vec!["VK_KHR_surface", "VK_KHR_win32_surface"]
        );
        assert_eq!(
            names(RawDisplayHandle::Xlib(XlibDisplayHandle::empty())),
            vec!["VK_KHR_surface", "VK_KHR_xlib_surface"]
        );
        assert_eq!(
            names(RawDisplayHandle::Xcb(XcbDisplayHandle::empty())),
            vec!["VK_KHR_surface", "VK_KHR_xcb_surface"]
        );
        assert_eq!(
            names(RawDisplayHandle::Wayland(WaylandDisplayHandle::empty())),
            vec!["VK_KHR_surface", "VK_KHR_wayland_surface"]
        );
    }

    #[test]
    fn web_display_is_rejected() {
        let err = required_extensions(RawDisplayHandle::Web(WebDisplayHandle::empty())).unwrap_err();
        assert!(format!("{:#}", err).contains("Unsupported display handle"));
    }
}
