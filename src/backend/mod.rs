// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash, one module per object family.
// Creation is strictly top-down; every object is registered on a
// TeardownStack so destruction runs in exact reverse order.

pub mod commands;
pub mod device;
pub mod error;
pub mod instance;
pub mod pipeline;
pub mod probe;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod teardown;

pub use error::Result;
pub use shader::ShaderBinaries;
