// Renderer errors
//
// Every Vulkan call site checks its result and raises one of these.
// Nothing here is retried: the caller decides whether to exit.

use ash::vk;
use std::fmt;
use std::path::PathBuf;

/// Which step of a frame failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStep {
    Throttle,
    Acquire,
    Submit,
    Present,
}

impl fmt::Display for FrameStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameStep::Throttle => "throttle",
            FrameStep::Acquire => "acquire",
            FrameStep::Submit => "submit",
            FrameStep::Present => "present",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RendererError {
    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("instance does not support required extension {0}")]
    UnsupportedInstanceExtension(String),

    #[error("failed to create Vulkan instance: {0}")]
    InstanceCreation(#[source] vk::Result),

    #[error("failed to query {what}: {source}")]
    Query {
        what: &'static str,
        #[source]
        source: vk::Result,
    },

    #[error("no suitable physical device: {0}")]
    NoSuitableDevice(String),

    #[error("failed to create logical device: {0}")]
    DeviceCreation(#[source] vk::Result),

    #[error("failed to create window surface: {0}")]
    SurfaceCreation(#[source] vk::Result),

    #[error("failed to create swapchain: {0}")]
    SwapchainCreation(#[source] vk::Result),

    #[error("failed to create swapchain image view: {0}")]
    ImageViewCreation(#[source] vk::Result),

    #[error("failed to create {stage}: {source}")]
    PipelineCreation {
        stage: &'static str,
        #[source]
        source: vk::Result,
    },

    #[error("failed to load shader {path:?}: {source}")]
    ShaderLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create {what}: {source}")]
    ResourceCreation {
        what: &'static str,
        #[source]
        source: vk::Result,
    },

    #[error("frame {step} failed: {source}")]
    SubmissionOrPresent {
        step: FrameStep,
        #[source]
        source: vk::Result,
    },

    #[error("acquired swapchain image {index} but only {recorded} command buffers were recorded")]
    UnrecordedImage { index: u32, recorded: usize },

    #[error("device lost or hung during frame {step}: {source}")]
    DeviceLostOrHung {
        step: FrameStep,
        #[source]
        source: vk::Result,
    },
}

impl RendererError {
    /// Classify a failed frame-loop call
    pub fn frame(step: FrameStep, result: vk::Result) -> Self {
        match result {
            vk::Result::TIMEOUT | vk::Result::NOT_READY | vk::Result::ERROR_DEVICE_LOST => {
                RendererError::DeviceLostOrHung { step, source: result }
            }
            _ => RendererError::SubmissionOrPresent { step, source: result },
        }
    }
}

pub type Result<T, E = RendererError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_device_loss_are_hangs() {
        for result in [vk::Result::TIMEOUT, vk::Result::NOT_READY, vk::Result::ERROR_DEVICE_LOST] {
            assert!(matches!(
                RendererError::frame(FrameStep::Throttle, result),
                RendererError::DeviceLostOrHung { step: FrameStep::Throttle, .. }
            ));
        }
    }

    #[test]
    fn other_failures_are_submission_errors() {
        let err = RendererError::frame(FrameStep::Present, vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert!(matches!(
            err,
            RendererError::SubmissionOrPresent {
                step: FrameStep::Present,
                source: vk::Result::ERROR_OUT_OF_DATE_KHR,
            }
        ));
        assert!(err.to_string().starts_with("frame present failed"));
    }
}
