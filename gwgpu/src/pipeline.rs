use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;
use crate::pass::{CreateFramebuffersError, CreateRenderPassError, Framebuffers, RenderPass};
use crate::shader::{CreateShaderModuleError, EntryPoint, ShaderModule, ShaderStage};

/// Owned `VkPipelineLayout`.
///
/// Pipelines with the same descriptor-set and push-constant signature can
/// share one behind `Arc<PipelineLayout>`.
pub struct PipelineLayout {
    device: Arc<Device>,
    raw: vk::PipelineLayout,
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("handle", &self.raw)
            .finish_non_exhaustive()
    }
}

impl PipelineLayout {
    /// A layout with no descriptor sets and no push constant ranges, for
    /// pipelines whose shaders read nothing but vertex input.
    pub fn new_empty(device: &Arc<Device>) -> Result<Self, vk::Result> {
        let info = vk::PipelineLayoutCreateInfo::default();
        // SAFETY: the default info names no sets and no ranges, so there is
        // nothing to get wrong.
        let raw = unsafe { device.create_raw_pipeline_layout(&info) }?;
        Ok(Self {
            device: Arc::clone(device),
            raw,
        })
    }

    pub fn raw_handle(&self) -> vk::PipelineLayout {
        self.raw
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline layout {:?}", self.raw);
        // SAFETY: the layout came from this device, and pipelines drop
        // their layout Arc last, so none still uses it.
        unsafe { self.device.destroy_raw_pipeline_layout(self.raw) };
    }
}

#[derive(Debug, Error)]
pub enum CreateGraphicsPipelineError {
    #[error("A pipeline needs at least one shader stage")]
    NoStages,

    #[error("Render pass handed to GraphicsPipeline::new belongs to another device")]
    MismatchedObjects,

    #[error("Empty pipeline layout creation failed: {0}")]
    LayoutCreation(vk::Result),

    #[error("Graphics pipeline creation failed: {0}")]
    PipelineCreation(vk::Result),
}

#[derive(Debug, Error)]
pub enum CreateRenderTargetsError {
    #[error("Shader module creation failed: {0}")]
    ShaderModule(#[from] CreateShaderModuleError),

    #[error("Shader entry point name has an interior NUL: {0}")]
    EntryPoint(#[from] std::ffi::NulError),

    #[error("Render pass creation failed: {0}")]
    RenderPass(#[from] CreateRenderPassError),

    #[error("Graphics pipeline creation failed: {0}")]
    Pipeline(#[from] CreateGraphicsPipelineError),

    #[error("Framebuffer creation failed: {0}")]
    Framebuffers(#[from] CreateFramebuffersError),
}

/// Description of a [`GraphicsPipeline`] to create.
///
/// `Default` fills every field with something inert. A usable pipeline
/// needs at least `stages` and `extent` overridden.
pub struct GraphicsPipelineDesc<'a> {
    /// Shader entry points forming the pipeline's stages. At least one.
    pub stages: &'a [EntryPoint<'a>],

    /// Vertex buffer bindings the vertex stage consumes.
    pub vertex_bindings: &'a [vk::VertexInputBindingDescription],

    /// Per-vertex attributes within those bindings.
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],

    /// Extent the static viewport and scissor are sized to.
    ///
    /// Baked into the pipeline, which is therefore rebuilt whenever the
    /// swapchain extent changes.
    pub extent: vk::Extent2D,

    /// Pipeline layout. `None` builds an empty one owned by the resulting
    /// pipeline alone; pass an `Arc` to share a layout across pipelines.
    pub layout: Option<Arc<PipelineLayout>>,

    /// Face culling mode. Defaults to `BACK`.
    pub cull_mode: vk::CullModeFlags,

    /// Winding order counted as front-facing. Defaults to `CLOCKWISE`.
    pub front_face: vk::FrontFace,
}

impl Default for GraphicsPipelineDesc<'_> {
    fn default() -> Self {
        Self {
            stages: &[],
            vertex_bindings: &[],
            vertex_attributes: &[],
            extent: vk::Extent2D::default(),
            layout: None,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::CLOCKWISE,
        }
    }
}

/// A graphics pipeline built against a classic render pass.
///
/// State fixed at construction: triangle-list assembly, a static viewport
/// and scissor sized to the description's extent, filled polygons with
/// line width 1.0, single-sample rasterization, no depth or stencil, no
/// blending with a full RGBA write mask on the one color attachment, and
/// no dynamic state.
pub struct GraphicsPipeline {
    device: Arc<Device>,
    raw: vk::Pipeline,
    layout: Arc<PipelineLayout>,
}

impl std::fmt::Debug for GraphicsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsPipeline")
            .field("handle", &self.raw)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl GraphicsPipeline {
    /// Build a pipeline from `desc` for subpass 0 of `render_pass`.
    ///
    /// `name` produces a debug label; the closure only runs when
    /// `VK_EXT_debug_utils` is enabled, and a labeling failure only warns.
    pub fn new<F>(
        device: &Arc<Device>,
        render_pass: &RenderPass,
        desc: &GraphicsPipelineDesc<'_>,
        name: Option<F>,
    ) -> Result<Self, CreateGraphicsPipelineError>
    where
        F: FnOnce() -> String,
    {
        use CreateGraphicsPipelineError as Error;

        if desc.stages.is_empty() {
            return Err(Error::NoStages);
        }
        if !Arc::ptr_eq(render_pass.get_parent(), device) {
            return Err(Error::MismatchedObjects);
        }

        let layout = match &desc.layout {
            Some(shared) => Arc::clone(shared),
            None => Arc::new(PipelineLayout::new_empty(device).map_err(Error::LayoutCreation)?),
        };

        let stage_infos: Vec<vk::PipelineShaderStageCreateInfo<'_>> = desc
            .stages
            .iter()
            .map(|entry| entry.as_pipeline_stage_create_info())
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(desc.vertex_bindings)
            .vertex_attribute_descriptions(desc.vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

        let viewports = [vk::Viewport::default()
            .width(desc.extent.width as f32)
            .height(desc.extent.height as f32)
            .max_depth(1.0)];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: desc.extent,
        }];
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let raster = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stage_infos)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&raster)
            .multisample_state(&multisample)
            .color_blend_state(&blend)
            .layout(layout.raw_handle())
            .render_pass(render_pass.raw_handle())
            .subpass(0);

        // SAFETY: the stages, layout, and render pass in info all came from
        // device and outlive the call.
        let raw = unsafe { device.create_raw_graphics_pipeline(&info) }
            .map_err(Error::PipelineCreation)?;

        // SAFETY: raw was just created from device.
        let named =
            unsafe { device.set_object_name_with(raw, || std::ffi::CString::new(name?()).ok()) };
        if let Err(e) = named {
            tracing::warn!("Could not name pipeline {raw:?}: {e}");
        }

        Ok(Self {
            device: Arc::clone(device),
            raw,
            layout,
        })
    }

    pub fn raw_handle(&self) -> vk::Pipeline {
        self.raw
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline {:?}", self.raw);
        // SAFETY: the pipeline came from this device and submitted work
        // referencing it has finished by teardown time.
        unsafe { self.device.destroy_raw_pipeline(self.raw) };
        // The layout Arc releases after this, so a shared layout outlives
        // every pipeline on it.
    }
}

/// Description of a [`RenderTargets`] bundle to create.
pub struct RenderTargetsDesc<'a> {
    /// Format of the swapchain images the render pass draws into.
    pub color_format: vk::Format,

    /// Swapchain extent. Sizes the framebuffers and the pipeline's static
    /// viewport and scissor.
    pub extent: vk::Extent2D,

    /// One image view per swapchain image, in image-index order.
    pub image_views: &'a [vk::ImageView],

    /// SPIR-V bytecode for the vertex stage.
    pub vertex_spirv: &'a [u8],

    /// SPIR-V bytecode for the fragment stage.
    pub fragment_spirv: &'a [u8],

    /// Vertex buffer bindings the vertex stage consumes.
    pub vertex_bindings: &'a [vk::VertexInputBindingDescription],

    /// Per-vertex attributes within those bindings.
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],
}

/// Everything the recorder needs to draw into a swapchain: render pass,
/// graphics pipeline, and one framebuffer per swapchain image.
///
/// Built and rebuilt as a unit on swapchain recreation, since the render
/// pass depends on the surface format while the pipeline and framebuffers
/// depend on the extent.
pub struct RenderTargets {
    // Field order is drop order: framebuffers and pipeline reference the
    // render pass, so it goes last.
    framebuffers: Framebuffers,
    pipeline: GraphicsPipeline,
    render_pass: RenderPass,
}

impl std::fmt::Debug for RenderTargets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTargets")
            .field("render_pass", &self.render_pass)
            .field("pipeline", &self.pipeline)
            .field("framebuffers", &self.framebuffers)
            .finish()
    }
}

impl RenderTargets {
    /// Build the render pass, compile both shader stages, create the
    /// pipeline, and raise one framebuffer per image view.
    ///
    /// The shader modules are transient: they drop as soon as pipeline
    /// creation finishes, success or not.
    ///
    /// # Safety
    /// Every view in `desc.image_views` must be a live image view of
    /// `device`, compatible with `desc.color_format`, and must stay live
    /// for the lifetime of the returned `RenderTargets`.
    pub unsafe fn new(
        device: &Arc<Device>,
        desc: &RenderTargetsDesc<'_>,
    ) -> Result<Self, CreateRenderTargetsError> {
        let render_pass = RenderPass::new(device, desc.color_format, Some("Main Render Pass"))?;

        let pipeline = {
            let vertex_shader =
                ShaderModule::new(device, desc.vertex_spirv, Some("Vertex Shader"))?;
            let fragment_shader =
                ShaderModule::new(device, desc.fragment_spirv, Some("Fragment Shader"))?;

            let stages = [
                vertex_shader.entry_point("main", ShaderStage::Vertex)?,
                fragment_shader.entry_point("main", ShaderStage::Fragment)?,
            ];

            GraphicsPipeline::new(
                device,
                &render_pass,
                &GraphicsPipelineDesc {
                    stages: &stages,
                    vertex_bindings: desc.vertex_bindings,
                    vertex_attributes: desc.vertex_attributes,
                    extent: desc.extent,
                    ..Default::default()
                },
                Some(|| String::from("Main Graphics Pipeline")),
            )?
            // Both shader modules drop here; the pipeline keeps no
            // reference to them.
        };

        // SAFETY: view liveness and format compatibility are the caller's
        // promise.
        let framebuffers =
            unsafe { Framebuffers::new(&render_pass, desc.image_views, desc.extent) }?;

        Ok(Self {
            framebuffers,
            pipeline,
            render_pass,
        })
    }

    pub fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }

    pub fn pipeline(&self) -> &GraphicsPipeline {
        &self.pipeline
    }

    pub fn framebuffers(&self) -> &Framebuffers {
        &self.framebuffers
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.framebuffers.extent()
    }
}
