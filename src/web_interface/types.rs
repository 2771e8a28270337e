use serde::{Deserialize, Serialize};

use crate::analysis::runner::RunnerStatus;
use crate::data_capture::types::EngineState;
use crate::storage::rotator::RotatorStatus;

/// The only ways a live-feed consumer may influence the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlCommand {
    Pause,
    Resume,
    Stop,
}

impl ControlCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::Pause => "pause",
            ControlCommand::Resume => "resume",
            ControlCommand::Stop => "stop",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ControlAck {
    pub accepted: ControlCommand,
}

#[derive(Debug, Default, Deserialize)]
pub struct PacketsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub interface: String,
    pub engine: EngineState,
    pub rotator: RotatorStatus,
    pub analysis: Option<RunnerStatus>,
}
