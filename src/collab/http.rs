//! HTTP node adapter
//!
//! Talks to the load-test endpoint each node exposes:
//!
//! - `POST /loadtest/execute` with a JSON `WorkItem`
//! - `GET /loadtest/state` returning `{"fields": {<field>: <amount>}}`
//! - `POST /loadtest/reset`
//!
//! Every request carries the operator identity in the `x-loadtest-operator`
//! header. Errors come back as `{"error": "..."}` with a non-2xx status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::collab::{NodeConnector, NodeRpc};
use crate::error::CollabError;
use crate::fleet::Node;
use crate::model::Aggregate;
use crate::workload::WorkItem;

/// Header naming the operator on whose behalf the engine acts
pub const OPERATOR_HEADER: &str = "x-loadtest-operator";

/// Response for GET /loadtest/state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateResponse {
    pub fields: Aggregate,
}

/// Response for POST /loadtest/execute and /loadtest/reset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
}

/// Error body returned by a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Connects to nodes over HTTP. One shared client, one handle per node.
pub struct HttpConnector {
    http: reqwest::Client,
    operator: String,
}

impl HttpConnector {
    /// Create a connector whose requests time out after `request_timeout`
    pub fn new(request_timeout: Duration, operator: impl Into<String>) -> Result<Self, CollabError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(500))
            .timeout(request_timeout)
            .build()
            .map_err(|e| CollabError::ConnectionFailed(format!("failed to create HTTP client: {}", e)))?;

        Ok(HttpConnector {
            http,
            operator: operator.into(),
        })
    }
}

#[async_trait]
impl NodeConnector for HttpConnector {
    async fn connect(&self, node: &Node) -> Result<Arc<dyn NodeRpc>, CollabError> {
        Ok(Arc::new(HttpNode {
            http: self.http.clone(),
            base_url: format!("http://{}", node.address),
            operator: self.operator.clone(),
        }))
    }
}

/// RPC handle to one node's load-test endpoint
pub struct HttpNode {
    http: reqwest::Client,
    base_url: String,
    operator: String,
}

impl HttpNode {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Map a response to its JSON body, or to `Rejected` on a non-2xx status
    async fn read<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, CollabError> {
        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ErrorResponse>().await {
                Ok(body) => body.error,
                Err(_) => status.canonical_reason().unwrap_or("unknown").to_string(),
            };
            return Err(CollabError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json()
            .await
            .map_err(|e| CollabError::Protocol(e.to_string()))
    }

    async fn acknowledge(&self, request: reqwest::RequestBuilder) -> Result<(), CollabError> {
        let response = request
            .header(OPERATOR_HEADER, &self.operator)
            .send()
            .await
            .map_err(transport_error)?;
        let ack: AckResponse = Self::read(response).await?;
        if !ack.success {
            return Err(CollabError::Rejected {
                status: 200,
                message: "node reported failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NodeRpc for HttpNode {
    async fn execute(&self, item: &WorkItem) -> Result<(), CollabError> {
        self.acknowledge(self.http.post(self.url("/loadtest/execute")).json(item))
            .await
    }

    async fn snapshot(&self) -> Result<Aggregate, CollabError> {
        let response = self
            .http
            .get(self.url("/loadtest/state"))
            .header(OPERATOR_HEADER, &self.operator)
            .send()
            .await
            .map_err(transport_error)?;
        let state: StateResponse = Self::read(response).await?;
        Ok(state.fields)
    }

    async fn reset(&self) -> Result<(), CollabError> {
        self.acknowledge(self.http.post(self.url("/loadtest/reset")))
            .await
    }
}

fn transport_error(e: reqwest::Error) -> CollabError {
    if e.is_timeout() {
        CollabError::Timeout
    } else {
        CollabError::ConnectionFailed(e.to_string())
    }
}
