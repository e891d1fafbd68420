//! Product queue carried in the instance context.
//!
//! The context holds `monitorId`, the `products` array and the product
//! currently being built (`productId` / `productName`). Steps only ever
//! touch the queue through these helpers.

use jobflow_core::{JobflowError, Result};
use jobflow_workflow::WorkflowInstance;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const MONITOR_ID: &str = "monitorId";
pub const PRODUCTS: &str = "products";
pub const PRODUCT_ID: &str = "productId";
pub const PRODUCT_NAME: &str = "productName";
pub const IS_PATCH_BUILD: &str = "isPatchBuild";
pub const BRANCH_NAME: &str = "branchName";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductStatus {
    Pending,
    BuildStarted,
    BuildSuccess,
    BuildFailed,
    MilestoneCreated,
    MilestoneFailed,
    ChannelMapped,
    ChannelFailed,
}

/// One product of a multi-product build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: u64,
    pub name: String,
    pub status: ProductStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Product {
    pub fn pending(id: u64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            status: ProductStatus::Pending,
            build_id: None,
            release_version: None,
            channel_url: None,
            error: None,
        }
    }
}

/// Input for one run of the build pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub monitor_id: u64,
    pub products: Vec<String>,
    #[serde(default)]
    pub is_patch_build: bool,
    #[serde(default)]
    pub branch_name: Option<String>,
}

impl BuildRequest {
    /// Initial instance context, positioned on the first product.
    pub fn into_context(self) -> Result<Value> {
        let Some(first) = self.products.first() else {
            return Err(JobflowError::Invalid("build request lists no products".into()));
        };
        if self.products.iter().any(|p| p.trim().is_empty()) {
            return Err(JobflowError::Invalid("product names must not be empty".into()));
        }
        let products: Vec<Product> = self
            .products
            .iter()
            .enumerate()
            .map(|(i, name)| Product::pending(i as u64 + 1, name))
            .collect();

        Ok(json!({
            MONITOR_ID: self.monitor_id,
            PRODUCTS: products,
            PRODUCT_ID: 1,
            PRODUCT_NAME: first,
            IS_PATCH_BUILD: self.is_patch_build,
            BRANCH_NAME: self.branch_name,
        }))
    }
}

/// The product queue. A missing array is an empty queue.
pub fn products(instance: &WorkflowInstance) -> Result<Vec<Product>> {
    match instance.context.get(PRODUCTS) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| JobflowError::step(format!("malformed product queue: {e}"))),
    }
}

pub fn save_products(instance: &mut WorkflowInstance, products: &[Product]) -> Result<()> {
    instance.set_context(PRODUCTS, serde_json::to_value(products)?);
    Ok(())
}

pub fn current_product_id(instance: &WorkflowInstance) -> Option<u64> {
    instance.context.get(PRODUCT_ID).and_then(Value::as_u64)
}

pub fn current_product(instance: &WorkflowInstance) -> Result<Product> {
    let id = current_product_id(instance)
        .ok_or_else(|| JobflowError::step("no current product in context"))?;
    products(instance)?
        .into_iter()
        .find(|p| p.id == id)
        .ok_or_else(|| JobflowError::step(format!("product {id} is not in the queue")))
}

/// Apply `f` to the current product and write the queue back.
pub fn update_current(
    instance: &mut WorkflowInstance,
    f: impl FnOnce(&mut Product),
) -> Result<Product> {
    let id = current_product_id(instance)
        .ok_or_else(|| JobflowError::step("no current product in context"))?;
    let mut queue = products(instance)?;
    let product = queue
        .iter_mut()
        .find(|p| p.id == id)
        .ok_or_else(|| JobflowError::step(format!("product {id} is not in the queue")))?;
    f(product);
    let updated = product.clone();
    save_products(instance, &queue)?;
    Ok(updated)
}

pub fn next_pending(instance: &WorkflowInstance) -> Result<Option<Product>> {
    Ok(products(instance)?
        .into_iter()
        .find(|p| p.status == ProductStatus::Pending))
}

/// Make `product` the one the next steps work on.
pub fn select(instance: &mut WorkflowInstance, product: &Product) {
    instance.set_context(PRODUCT_ID, product.id);
    instance.set_context(PRODUCT_NAME, product.name.clone());
}

pub fn monitor_id(instance: &WorkflowInstance) -> Option<&Value> {
    instance.context.get(MONITOR_ID).filter(|v| !v.is_null())
}

pub fn is_patch_build(instance: &WorkflowInstance) -> bool {
    instance
        .context
        .get(IS_PATCH_BUILD)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub fn branch_name(instance: &WorkflowInstance) -> Option<&str> {
    instance.context_str(BRANCH_NAME).filter(|b| !b.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> WorkflowInstance {
        let ctx = BuildRequest {
            monitor_id: 42,
            products: vec!["desk".into(), "mobile".into()],
            is_patch_build: true,
            branch_name: Some("release/9".into()),
        }
        .into_context()
        .unwrap();
        WorkflowInstance::new("build-pipeline", "b-1", "BUILD_INITIATION", ctx, "system")
    }

    #[test]
    fn test_request_context_shape() {
        let inst = instance();
        assert_eq!(inst.context[MONITOR_ID], 42);
        assert_eq!(inst.context[PRODUCT_ID], 1);
        assert_eq!(inst.context_str(PRODUCT_NAME), Some("desk"));
        assert_eq!(inst.context[PRODUCTS][1]["status"], "PENDING");
        assert!(inst.context[PRODUCTS][0].get("buildId").is_none());
        assert!(is_patch_build(&inst));
        assert_eq!(branch_name(&inst), Some("release/9"));
    }

    #[test]
    fn test_empty_request_rejected() {
        let req = BuildRequest {
            monitor_id: 1,
            products: vec![],
            is_patch_build: false,
            branch_name: None,
        };
        assert!(matches!(req.into_context(), Err(JobflowError::Invalid(_))));
    }

    #[test]
    fn test_update_and_next_pending() {
        let mut inst = instance();
        let updated = update_current(&mut inst, |p| {
            p.status = ProductStatus::BuildStarted;
            p.build_id = Some("77".into());
        })
        .unwrap();
        assert_eq!(updated.build_id.as_deref(), Some("77"));
        assert_eq!(current_product(&inst).unwrap().status, ProductStatus::BuildStarted);

        let next = next_pending(&inst).unwrap().unwrap();
        assert_eq!(next.name, "mobile");
        select(&mut inst, &next);
        assert_eq!(current_product_id(&inst), Some(2));
    }

    #[test]
    fn test_missing_queue_and_product() {
        let mut inst = WorkflowInstance::new("w", "r", "S", json!({}), "system");
        assert!(products(&inst).unwrap().is_empty());
        assert!(current_product(&inst).is_err());
        assert!(monitor_id(&inst).is_none());

        inst.set_context(PRODUCT_ID, 9);
        assert!(update_current(&mut inst, |_| {}).is_err());
    }
}
