//! # Jobflow Build
//!
//! Multi-product build pipeline expressed as a Jobflow workflow.
//! Each product is built, polled to completion, released into a milestone
//! and mapped onto its channel before the next product starts.

pub mod api;
pub mod events;
pub mod notify;
pub mod products;
pub mod steps;
pub mod workflow;

pub use api::{BuildApi, BuildHandle, BuildStatus, HttpBuildApi};
pub use notify::{LogNotifier, Notifier, WebhookNotifier};
pub use products::{BuildRequest, Product, ProductStatus};
pub use workflow::{BUILD_WORKFLOW, build_workflow, from_config, start_build};
