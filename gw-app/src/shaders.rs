//! Build-time embedded SPIR-V for the triangle pipeline.
//!
//! The GLSL sources live in `shaders/` next to the compiled binaries; run
//! `cargo xtask compile-shaders` after editing them.

/// Vertex stage: position through to clip space at z=0, w=1; color through
/// to the fragment stage.
pub static TRIANGLE_VERT: &[u8] = include_bytes!("../shaders/triangle.vert.spv");

/// Fragment stage: interpolated color at full alpha.
pub static TRIANGLE_FRAG: &[u8] = include_bytes!("../shaders/triangle.frag.spv");
