use thiserror::Error;

#[derive(Debug, Error)]
pub enum WgpuError {
    #[error("no compatible GPU adapter")]
    NoAdapter,

    #[error("device request failed: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),
}
