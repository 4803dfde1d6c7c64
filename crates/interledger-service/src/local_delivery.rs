//! The local-delivery handler contract: invoked when the routing table resolves a packet's
//! next hop to this node itself, rather than to a BTP peer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// `(destination, amount as decimal string, executionCondition base64, expiresAt ISO-8601,
/// data base64, sourcePeer)`, handed to an in-process handler or serialized as the body of
/// an HTTP POST to an external one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDeliveryRequest {
    pub destination: String,
    pub amount: String,
    #[serde(rename = "executionCondition")]
    pub execution_condition: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: String,
    pub data: String,
    #[serde(rename = "sourcePeer")]
    pub source_peer: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FulfillBody {
    pub fulfillment: String,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RejectBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub data: Option<String>,
}

/// The local-delivery handler's return shape: `{fulfill: {...}}` or `{reject: {...}}`. Any
/// other shape is treated as a decode failure and mapped to `T00` by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalDeliveryResponse {
    pub fulfill: Option<FulfillBody>,
    pub reject: Option<RejectBody>,
}

/// An in-process local-delivery handler.
#[async_trait]
pub trait LocalDeliveryHandler: Send + Sync {
    async fn handle(&self, request: LocalDeliveryRequest) -> LocalDeliveryResponse;
}

/// Either an in-process handler or an HTTP endpoint the same request view is POSTed to. When
/// neither is configured, the handler falls back to a stub fulfill (see
/// [`crate::handler::PacketHandler`]).
pub enum LocalDelivery {
    Handler(std::sync::Arc<dyn LocalDeliveryHandler>),
    Http { client: reqwest::Client, url: reqwest::Url },
}

impl LocalDelivery {
    /// Returns `None` on any transport/decode failure -- the caller maps that to `T00`.
    pub async fn deliver(&self, request: LocalDeliveryRequest) -> Option<LocalDeliveryResponse> {
        match self {
            LocalDelivery::Handler(handler) => Some(handler.handle(request).await),
            LocalDelivery::Http { client, url } => {
                let response = client.post(url.clone()).json(&request).send().await.ok()?;
                response.json::<LocalDeliveryResponse>().await.ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoFulfill;

    #[async_trait]
    impl LocalDeliveryHandler for EchoFulfill {
        async fn handle(&self, request: LocalDeliveryRequest) -> LocalDeliveryResponse {
            LocalDeliveryResponse {
                fulfill: Some(FulfillBody {
                    fulfillment: request.execution_condition,
                    data: None,
                }),
                reject: None,
            }
        }
    }

    #[tokio::test]
    async fn in_process_handler_round_trips_request_fields() {
        let delivery = LocalDelivery::Handler(std::sync::Arc::new(EchoFulfill));
        let request = LocalDeliveryRequest {
            destination: "g.connector.alice".to_owned(),
            amount: "1000".to_owned(),
            execution_condition: "qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqo".to_owned(),
            expires_at: "2030-01-01T00:00:00Z".to_owned(),
            data: "".to_owned(),
            source_peer: "peerA".to_owned(),
        };
        let response = delivery.deliver(request.clone()).await.unwrap();
        assert_eq!(response.fulfill.unwrap().fulfillment, request.execution_condition);
    }
}
