//! Operation Context
//!
//! Per-request metadata threaded from the middleware into handlers and
//! structured logs. Built once at authentication time; handlers receive it
//! as an immutable value, never through shared mutable state.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// Who is acting and under which trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationContext {
    /// Authenticated user (from the verified bearer token)
    pub user_id: Uuid,

    /// Correlation ID for request tracing; taken from the
    /// X-Correlation-Id header or generated at the edge
    pub correlation_id: Uuid,

    /// Client IP address, when the listener provides one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<IpAddr>,
}

impl OperationContext {
    /// Context for an authenticated user with a fresh correlation id.
    pub fn for_user(user_id: Uuid) -> Self {
        Self {
            user_id,
            correlation_id: Uuid::new_v4(),
            client_ip: None,
        }
    }

    /// Override the generated correlation id with the caller-supplied one.
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Attach the client address.
    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_user_generates_correlation_id() {
        let user_id = Uuid::new_v4();
        let a = OperationContext::for_user(user_id);
        let b = OperationContext::for_user(user_id);

        assert_eq!(a.user_id, user_id);
        assert_ne!(a.correlation_id, b.correlation_id);
        assert!(a.client_ip.is_none());
    }

    #[test]
    fn test_caller_correlation_id_wins() {
        let correlation_id = Uuid::new_v4();
        let context =
            OperationContext::for_user(Uuid::new_v4()).with_correlation_id(correlation_id);

        assert_eq!(context.correlation_id, correlation_id);
    }
}
