//! MCU backend integration: the control/attach websocket protocol and the
//! pipelines that forward channel traffic over it.

mod manager;
mod pipeline;

pub use manager::{AttachedRecord, McuConnection, McuError, McuManager, MCU_SUBPROTOCOL};
pub use pipeline::{
    Pipeline, PipelineBackend, PipelineError, PipelineObserver, PipelineProvider,
    PIPELINE_MODE_MCU_FORWARD,
};
