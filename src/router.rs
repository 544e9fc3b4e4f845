//! The request router (component H, spec §4.1): parses envelopes, dispatches
//! on `method` to the fixed routing table, and serializes results/errors/
//! events back onto the transport. `replay` is the one long-running method;
//! it is spawned onto the connection's local task set so that other
//! in-flight handlers on the same transport can keep interleaving between
//! its pacing sleeps (spec §5, §9 "fire-and-forget dispatch").

use std::cell::RefCell;
use std::rc::Rc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, warn};

use crate::error::{ErrorPayload, RouterError};
use crate::handlers;
use crate::protocol::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::protocol::params::ReplayParams;
use crate::replay;
use crate::session::ConnectionSession;

/// Parses a raw transport frame. On failure, the id is not recoverable, so
/// the resulting error carries no id (spec §4.1 Dispatch contract).
pub fn parse_envelope(text: &str) -> Result<RequestEnvelope, ResponseEnvelope> {
    serde_json::from_str(text).map_err(|e| {
        ResponseEnvelope::error(
            None,
            None,
            ErrorPayload::new(crate::error::ErrorCode::InvalidParams, format!("malformed envelope: {e}")),
        )
    })
}

const CONNECTION_SCOPED: &[&str] = &["init", "replay"];

/// Dispatches one parsed request. Connection-scoped methods ignore `cid`;
/// client-scoped methods with a missing or unknown `cid` fail with
/// `INVALID_CLIENT` before the handler ever runs.
pub async fn dispatch(
    conn: Rc<RefCell<ConnectionSession>>,
    req: RequestEnvelope,
    out: UnboundedSender<ResponseEnvelope>,
) {
    let method = req.method.as_str();
    let id = req.id;

    if method == "init" {
        dispatch_init(conn, req, out).await;
        return;
    }

    if method == "replay" {
        let params = match serde_json::from_value::<ReplayParams>(req.params.clone()) {
            Ok(p) => p,
            Err(e) => {
                let _ = out.send(ResponseEnvelope::error(
                    Some(id),
                    req.cid.clone(),
                    RouterError::InvalidParams(e.to_string()).into(),
                ));
                return;
            }
        };
        replay::spawn_replay(conn, id, params, out);
        return;
    }

    if !CONNECTION_SCOPED.contains(&method) && req.cid.is_none() {
        let _ = out.send(ResponseEnvelope::error(Some(id), None, RouterError::InvalidClient.into()));
        return;
    }

    let result = {
        let mut conn = conn.borrow_mut();
        route_sync(&mut conn, method, req.cid.as_deref(), &req.params)
    };

    match result {
        Ok((value, event)) => {
            let _ = out.send(ResponseEnvelope::result(id, req.cid.clone(), value));
            if let Some(event) = event {
                let _ = out.send(ResponseEnvelope::event(req.cid, event));
            }
        }
        Err(err) => {
            if matches!(err, RouterError::Internal(_)) {
                error!(method, "handler failed");
            } else {
                warn!(method, %err, "request rejected");
            }
            let _ = out.send(ResponseEnvelope::error(Some(id), req.cid, err.into()));
        }
    }
}

/// Every method except `init` and `replay` can be dispatched synchronously
/// against borrowed connection state. `init` is handled by the caller
/// because it needs to `.await` the data source.
fn route_sync(
    conn: &mut ConnectionSession,
    method: &str,
    cid: Option<&str>,
    params: &serde_json::Value,
) -> Result<(serde_json::Value, Option<crate::protocol::envelope::EventPayload>), RouterError> {
    match method {
        "login" => handlers::login(conn, cid.unwrap(), params).map(|v| (v, None)),
        "logout" => handlers::logout(conn, cid.unwrap()).map(|v| (v, None)),
        "subscribe" => handlers::subscribe(conn, cid.unwrap(), params).map(|v| (v, None)),
        "unsubscribe" => handlers::unsubscribe(conn, cid.unwrap(), params).map(|v| (v, None)),
        "getPosition" => handlers::get_position(conn, cid.unwrap()).map(|v| (v, None)),
        "getOpenOrders" => handlers::get_open_orders(conn, cid.unwrap()).map(|v| (v, None)),
        "submitOrders" => handlers::submit_orders(conn, cid.unwrap(), params),
        "amendOrders" => handlers::amend_orders(conn, cid.unwrap(), params),
        "cancelOrders" => handlers::cancel_orders(conn, cid.unwrap(), params),
        "cancelAllOrders" => handlers::cancel_all_orders(conn, cid.unwrap()).map(|(v, e)| (v, e)),
        _ => Err(RouterError::InvalidMethod),
    }
}

/// `init` is dispatched separately from [`dispatch`] by the transport
/// adapter because it is the one method that awaits the data source; the
/// `Arc` clone lets it do so without holding the connection's `RefCell`
/// borrow across the await point.
pub async fn dispatch_init(conn: Rc<RefCell<ConnectionSession>>, req: RequestEnvelope, out: UnboundedSender<ResponseEnvelope>) {
    let datasource = conn.borrow().datasource.clone();
    let result = handlers::init(&datasource).await;
    match result {
        Ok(value) => {
            let _ = out.send(ResponseEnvelope::result(req.id, None, value));
        }
        Err(err) => {
            let _ = out.send(ResponseEnvelope::error(Some(req.id), None, err.into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::testutil::InMemoryDataSource;
    use std::sync::Arc;
    use tokio::sync::mpsc::unbounded_channel;

    fn conn() -> Rc<RefCell<ConnectionSession>> {
        Rc::new(RefCell::new(ConnectionSession::new(Arc::new(InMemoryDataSource {
            tables: Vec::new(),
            batches: Vec::new(),
        }))))
    }

    #[test]
    fn malformed_envelope_has_no_recoverable_id() {
        let err = parse_envelope("{not json").unwrap_err();
        match err {
            ResponseEnvelope::Error { id, error, .. } => {
                assert!(id.is_none());
                assert_eq!(error.code, crate::error::ErrorCode::InvalidParams);
            }
            _ => panic!("expected an error envelope"),
        }
    }

    #[tokio::test]
    async fn unknown_method_yields_invalid_method() {
        let (tx, mut rx) = unbounded_channel();
        dispatch(
            conn(),
            RequestEnvelope { method: "bogus".to_string(), id: 7, cid: Some("c1".to_string()), params: serde_json::Value::Null },
            tx,
        )
        .await;
        match rx.recv().await.unwrap() {
            ResponseEnvelope::Error { id, error, .. } => {
                assert_eq!(id, Some(7));
                assert_eq!(error.code, crate::error::ErrorCode::InvalidMethod);
            }
            _ => panic!("expected an error envelope"),
        }
    }

    #[tokio::test]
    async fn client_scoped_method_without_cid_yields_invalid_client() {
        let (tx, mut rx) = unbounded_channel();
        dispatch(
            conn(),
            RequestEnvelope { method: "getPosition".to_string(), id: 3, cid: None, params: serde_json::Value::Null },
            tx,
        )
        .await;
        match rx.recv().await.unwrap() {
            ResponseEnvelope::Error { id, error, .. } => {
                assert_eq!(id, Some(3));
                assert_eq!(error.code, crate::error::ErrorCode::InvalidClient);
            }
            _ => panic!("expected an error envelope"),
        }
    }

    #[tokio::test]
    async fn client_scoped_method_with_unknown_cid_yields_invalid_client() {
        let (tx, mut rx) = unbounded_channel();
        dispatch(
            conn(),
            RequestEnvelope { method: "getPosition".to_string(), id: 4, cid: Some("ghost".to_string()), params: serde_json::Value::Null },
            tx,
        )
        .await;
        match rx.recv().await.unwrap() {
            ResponseEnvelope::Error { id, error, .. } => {
                assert_eq!(id, Some(4));
                assert_eq!(error.code, crate::error::ErrorCode::InvalidClient);
            }
            _ => panic!("expected an error envelope"),
        }
    }
}
