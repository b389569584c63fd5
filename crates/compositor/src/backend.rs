use gpu_backend::{Backend, HeadlessBackend, SoftwareBackend, SoftwareConfig};

use crate::{BackendKind, CompositorConfig, CompositorError};

/// Builds the backend named by `config.backend`.
pub fn create_backend(config: &CompositorConfig) -> Result<Box<dyn Backend>, CompositorError> {
    let backend: Box<dyn Backend> = match config.backend {
        BackendKind::Headless => Box::new(HeadlessBackend::default()),
        BackendKind::Software => Box::new(SoftwareBackend::new(SoftwareConfig {
            width: config.canvas_width,
            height: config.canvas_height,
        })),
        BackendKind::Wgpu => wgpu_backend(config)?,
    };
    log::info!("compositor backend: {}", backend.name());
    Ok(backend)
}

#[cfg(feature = "wgpu")]
fn wgpu_backend(config: &CompositorConfig) -> Result<Box<dyn Backend>, CompositorError> {
    use gpu_backend::{WgpuBackend, WgpuBackendConfig, request_device};

    let (device, queue) = request_device()?;
    Ok(Box::new(WgpuBackend::new(
        device,
        queue,
        WgpuBackendConfig {
            canvas_width: config.canvas_width,
            canvas_height: config.canvas_height,
        },
    )))
}

#[cfg(not(feature = "wgpu"))]
fn wgpu_backend(_config: &CompositorConfig) -> Result<Box<dyn Backend>, CompositorError> {
    Err(CompositorError::Config(
        "built without the `wgpu` feature".to_owned(),
    ))
}
