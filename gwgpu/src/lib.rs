//! Thin RAII wrappers around the Vulkan objects a small 2D presenter
//! needs, built on [`ash`], plus the frame scheduler that drives them.
//!
//! > Extracted from a hobby game. Expect the API to move under you.
//!
//! # Object hierarchy
//!
//! ```text
//! Instance
//! ├── Surface<T>
//! │   └── Swapchain<T>
//! └── Device
//!     ├── RenderPass → Framebuffers
//!     ├── PipelineLayout / GraphicsPipeline (via ShaderModule → EntryPoint)
//!     ├── HostVisibleBuffer / DeviceLocalBuffer → GrowableVertexBuffer
//!     ├── ResettableCommandPool, one ResettableCommandBuffer per image
//!     ├── TransientCommandPool for one-shot uploads
//!     └── Fence / Semaphore → FrameScheduler
//! ```
//!
//! Children keep their parent alive through an `Arc`, so destruction
//! order follows ownership and never needs to be managed by hand.
//!
//! # Naming conventions
//!
//! | prefix  | meaning                                  |
//! |---------|------------------------------------------|
//! | `raw_*` | takes or hands out a bare `vk::*` handle |
//! | `ash_*` | hands out the owning `ash` object        |

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod buffer;
pub mod command;
pub mod device;
pub mod frame;
pub mod instance;
pub mod log;
pub mod pass;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod vertex;

pub use ash;
pub use raw_window_handle;
