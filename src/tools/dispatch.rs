//! Tool execution over HTTP
//!
//! Every finalized function call becomes one `POST` to the POS backend with a
//! `{ tool, parameters }` body. A static route table picks the endpoint and
//! maps the model-facing tool and parameter names to the backend's.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::config::ToolsConfig;
use crate::{Error, Result};

/// Executes a finalized function call
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Run `name` with `arguments` and return its JSON result
    ///
    /// # Errors
    ///
    /// Returns `Error::ToolDispatch` if the endpoint fails or returns
    /// something other than JSON
    async fn dispatch(&self, name: &str, arguments: Value) -> Result<Value>;
}

/// Where a tool is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolRoute {
    /// Endpoint path relative to the backend base URL
    pub path: &'static str,
    /// Tool name the backend expects
    pub tool: &'static str,
    /// `(model name, backend name)` parameter renames
    pub renames: &'static [(&'static str, &'static str)],
}

const DRINK_ID: &[(&str, &str)] = &[("drink_id", "drinkId")];

const ROUTES: &[(&str, ToolRoute)] = &[
    ("search_drinks", ToolRoute { path: "/api/ai/drinks", tool: "search", renames: &[] }),
    ("get_drink_details", ToolRoute { path: "/api/ai/drinks", tool: "details", renames: DRINK_ID }),
    ("list_drink_categories", ToolRoute { path: "/api/ai/drinks", tool: "categories", renames: &[] }),
    ("check_inventory", ToolRoute { path: "/api/ai/inventory", tool: "check", renames: DRINK_ID }),
    ("view_cart", ToolRoute { path: "/api/ai/cart", tool: "view", renames: &[] }),
    ("add_drink_to_cart", ToolRoute { path: "/api/ai/cart", tool: "add", renames: DRINK_ID }),
    ("remove_drink_from_cart", ToolRoute { path: "/api/ai/cart", tool: "remove", renames: DRINK_ID }),
    ("update_cart_quantity", ToolRoute { path: "/api/ai/cart", tool: "update", renames: DRINK_ID }),
    ("clear_cart", ToolRoute { path: "/api/ai/cart", tool: "clear", renames: &[] }),
    (
        "process_order",
        ToolRoute {
            path: "/api/ai/orders",
            tool: "process",
            renames: &[("payment_method", "paymentMethod"), ("customer_name", "customerName")],
        },
    ),
    ("list_event_packages", ToolRoute { path: "/api/ai/events", tool: "packages", renames: &[] }),
    ("get_order_status", ToolRoute { path: "/api/ai/orders", tool: "status", renames: &[("order_id", "orderId")] }),
];

/// Path for tools missing from the route table
const DEFAULT_PATH: &str = "/api/ai/tools";

/// Look up the route for a tool name
#[must_use]
pub fn route(name: &str) -> Option<&'static ToolRoute> {
    ROUTES.iter().find(|(n, _)| *n == name).map(|(_, r)| r)
}

/// Apply a route's parameter renames
fn remap_parameters(arguments: Value, renames: &[(&str, &str)]) -> Value {
    match arguments {
        Value::Object(mut map) => {
            for (from, to) in renames {
                if let Some(value) = map.remove(*from) {
                    map.insert((*to).to_string(), value);
                }
            }
            Value::Object(map)
        }
        // Non-object arguments are wrapped rather than dropped
        other => serde_json::json!({ "value": other }),
    }
}

#[derive(Serialize)]
struct ToolRequest<'a> {
    tool: &'a str,
    parameters: Value,
}

/// Dispatches tools to the POS backend
pub struct HttpToolDispatcher {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpToolDispatcher {
    /// Create a dispatcher from tool configuration
    #[must_use]
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.request_timeout,
        }
    }
}

#[async_trait]
impl ToolDispatcher for HttpToolDispatcher {
    async fn dispatch(&self, name: &str, arguments: Value) -> Result<Value> {
        let (path, tool, parameters) = match route(name) {
            Some(route) => (
                route.path,
                route.tool,
                remap_parameters(arguments, route.renames),
            ),
            None => {
                tracing::debug!(tool = name, "no route for tool, using default endpoint");
                (DEFAULT_PATH, name, remap_parameters(arguments, &[]))
            }
        };

        let url = format!("{}{path}", self.base_url);
        tracing::debug!(tool = name, %url, "dispatching tool");

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&ToolRequest { tool, parameters })
            .send()
            .await
            .map_err(|e| Error::ToolDispatch(format!("{name}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ToolDispatch(format!("{name} returned {status}: {body}")));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| Error::ToolDispatch(format!("{name} returned invalid JSON: {e}")))
    }
}
