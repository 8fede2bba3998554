//! Backend selection
//!
//! The head is trained on an autodiff backend while the frozen feature
//! extractor and inference run on the plain backend underneath it.

use burn::backend::Autodiff;
use burn::prelude::Backend;

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

#[cfg(all(not(feature = "cuda"), any(feature = "ndarray", feature = "cpu")))]
pub type DefaultBackend = burn_ndarray::NdArray;

#[cfg(all(not(feature = "cuda"), not(feature = "ndarray"), not(feature = "cpu")))]
compile_error!("enable one of the `ndarray`, `cpu` or `cuda` features");

/// Only the classification head ever sees gradients from this backend
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Backend used for evaluation, prediction and the frozen backbone
pub type InferenceBackend = DefaultBackend;

/// Device type shared by the training and inference backends
pub type DefaultDevice = <DefaultBackend as Backend>::Device;

/// First GPU under `cuda`, otherwise the CPU
pub fn default_device() -> DefaultDevice {
    DefaultDevice::default()
}

/// Human-readable name of the compiled-in backend
pub const fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }

    #[cfg(all(not(feature = "cuda"), any(feature = "ndarray", feature = "cpu")))]
    {
        "NdArray (CPU)"
    }
}
