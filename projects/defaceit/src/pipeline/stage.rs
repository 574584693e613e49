use crate::pipeline::error::PipelineError;
use crate::pipeline::tool::{self, ToolCommand, ToolExit};
use crate::pipeline::types::{CancelHandle, EventSink, PipelineEvent, PipelineState, ProcessingState};
use crate::run_context::TempArtifacts;
use std::sync::Arc;
use std::time::Duration;

/// How a stage sequence ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Completed,
    Cancelled,
}

/// Everything a stage needs from the controller, owned by one job.
pub struct StageContext {
    pub artifacts: TempArtifacts,
    pub state: Arc<ProcessingState>,
    pub events: EventSink,
    pub cancel: CancelHandle,
    pub grace: Duration,
}

impl StageContext {
    pub fn step(&self) -> PipelineState {
        self.state.step()
    }

    /// Move to `next` and tell observers. Backward moves are refused.
    pub fn enter(&self, next: PipelineState) {
        let current = self.state.step();
        if current == next {
            return;
        }
        if !current.can_advance_to(next) {
            tracing::warn!("Ignoring transition {} -> {}", current, next);
            return;
        }
        if let Ok(mut step) = self.state.current_step.write() {
            *step = next;
        }
        tracing::info!("Pipeline state: {} -> {}", current, next);
        self.events.send(PipelineEvent::StateChanged(next));
    }

    pub async fn run_tool(&self, cmd: &ToolCommand) -> Result<ToolExit, PipelineError> {
        tool::run_tool(cmd, &self.cancel, &self.events, self.grace).await
    }
}
