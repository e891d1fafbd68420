//! Build pipeline event vocabulary.

use jobflow_workflow::EventType;

pub const BUILD_STARTED: EventType = EventType::from_static("BUILD_STARTED");
pub const BUILD_STATUS_CHECK: EventType = EventType::from_static("BUILD_STATUS_CHECK");
pub const BUILD_COMPLETED: EventType = EventType::from_static("BUILD_COMPLETED");
pub const BUILD_FAILED: EventType = EventType::from_static("BUILD_FAILED");
pub const MILESTONE_CREATION: EventType = EventType::from_static("MILESTONE_CREATION");
pub const MILESTONE_FAILED: EventType = EventType::from_static("MILESTONE_FAILED");
pub const CHANNEL_MAPPING: EventType = EventType::from_static("CHANNEL_MAPPING");
pub const CHANNEL_FAILED: EventType = EventType::from_static("CHANNEL_FAILED");
pub const NEXT_PRODUCT: EventType = EventType::from_static("NEXT_PRODUCT");
pub const RETRY_REQUESTED: EventType = EventType::from_static("RETRY_REQUESTED");
pub const WORKFLOW_COMPLETED: EventType = EventType::WORKFLOW_COMPLETED;
pub const WORKFLOW_FAILED: EventType = EventType::WORKFLOW_FAILED;

/// Step names. Failure steps share their event's name.
pub mod steps {
    pub const BUILD_INITIATION: &str = "BUILD_INITIATION";
    pub const BUILD_IN_PROGRESS: &str = "BUILD_IN_PROGRESS";
    pub const BUILD_COMPLETED: &str = "BUILD_COMPLETED";
    pub const BUILD_FAILED: &str = "BUILD_FAILED";
    pub const MILESTONE_CREATION: &str = "MILESTONE_CREATION";
    pub const MILESTONE_FAILED: &str = "MILESTONE_FAILED";
    pub const CHANNEL_MAPPING: &str = "CHANNEL_MAPPING";
    pub const CHANNEL_FAILED: &str = "CHANNEL_FAILED";
    pub const NEXT_PRODUCT: &str = "NEXT_PRODUCT";
    pub const WORKFLOW_COMPLETED: &str = "WORKFLOW_COMPLETED";
    pub const WORKFLOW_FAILED: &str = "WORKFLOW_FAILED";
}
