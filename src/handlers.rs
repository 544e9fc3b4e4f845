//! Handlers (component I, spec §4.1 Dispatch contract): thin glue that
//! validates params, calls into the session/broker, and returns the pair of
//! (RPC result, any events to emit alongside it). Handler errors are
//! structured `RouterError`s; order-domain rejections are never errors —
//! they are represented as `OrderState { status: Rejected }` inside a
//! successful response (spec §7).

use chrono::Utc;
use serde_json::{json, Value};

use crate::broker::order::{Order, PartialOrder};
use crate::error::RouterError;
use crate::protocol::envelope::EventPayload;
use crate::protocol::params::{InitResult, LoginParams, LoginResult, LogoutResult};
use crate::session::ConnectionSession;

fn decode<T: serde::de::DeserializeOwned>(params: &Value) -> Result<T, RouterError> {
    serde_json::from_value(params.clone()).map_err(|e| RouterError::InvalidParams(e.to_string()))
}

/// `init`: connection-scoped, no `cid`. Returns the advertised table list.
/// Takes the data source handle directly (rather than the whole
/// `ConnectionSession`) so the caller can `.await` it without holding a
/// `RefCell` borrow across the await point.
pub async fn init(datasource: &std::sync::Arc<dyn crate::datasource::DataSource>) -> Result<Value, RouterError> {
    let tables = datasource
        .enumerate_tables()
        .await
        .map_err(|e| RouterError::DataSourceError(e.to_string()))?;
    Ok(serde_json::to_value(InitResult { replay_tables: tables }).unwrap())
}

/// `login`: rejected with `REPLAY_ACTIVE` if a replay is in flight on this
/// connection (spec §4.4 preconditions — sessions must be prepared before
/// replay starts).
pub fn login(conn: &mut ConnectionSession, cid: &str, params: &Value) -> Result<Value, RouterError> {
    if conn.is_replay_active() {
        return Err(RouterError::ReplayActive);
    }
    let params: LoginParams = decode(params)?;
    let session = crate::session::ClientSession::new(cid.to_string(), params.config);
    conn.clients.insert(cid.to_string(), session);
    Ok(serde_json::to_value(LoginResult {
        connected: true,
        timestamp: Utc::now(),
    })
    .unwrap())
}

pub fn logout(conn: &mut ConnectionSession, cid: &str) -> Result<Value, RouterError> {
    conn.clients
        .shift_remove(cid)
        .ok_or(RouterError::InvalidClient)?;
    Ok(serde_json::to_value(LogoutResult {
        connected: false,
        timestamp: Utc::now(),
    })
    .unwrap())
}

pub fn subscribe(conn: &mut ConnectionSession, cid: &str, params: &Value) -> Result<Value, RouterError> {
    let symbols: Vec<String> = decode(params)?;
    let replay_active = conn.is_replay_active();
    let client = conn.client_mut(cid).ok_or(RouterError::InvalidClient)?;
    Ok(json!(client.add_subscriptions(&symbols, replay_active)))
}

pub fn unsubscribe(conn: &mut ConnectionSession, cid: &str, params: &Value) -> Result<Value, RouterError> {
    let symbols: Vec<String> = decode(params)?;
    let replay_active = conn.is_replay_active();
    let client = conn.client_mut(cid).ok_or(RouterError::InvalidClient)?;
    Ok(json!(client.remove_subscriptions(&symbols, replay_active)))
}

pub fn get_position(conn: &mut ConnectionSession, cid: &str) -> Result<Value, RouterError> {
    let client = conn.client(cid).ok_or(RouterError::InvalidClient)?;
    Ok(serde_json::to_value(client.broker().position()).unwrap())
}

pub fn get_open_orders(conn: &mut ConnectionSession, cid: &str) -> Result<Value, RouterError> {
    let client = conn.client(cid).ok_or(RouterError::InvalidClient)?;
    Ok(serde_json::to_value(client.broker().open_orders()).unwrap())
}

/// `submitOrders`/`amendOrders`/`cancelOrders`/`cancelAllOrders` all return
/// an integer count and additionally surface the affected `OrderState`s as
/// an `order` event (spec §4.1: order-domain rejections succeed with a
/// REJECTED state rather than erroring the request).
pub fn submit_orders(
    conn: &mut ConnectionSession,
    cid: &str,
    params: &Value,
) -> Result<(Value, Option<EventPayload>), RouterError> {
    let orders: Vec<Order> = decode(params)?;
    let client = conn.client_mut(cid).ok_or(RouterError::InvalidClient)?;
    let states = client.broker_mut().submit(&orders, Utc::now());
    let accepted = states.iter().filter(|s| s.status != crate::broker::order::OrderStatus::Rejected).count();
    let event = (!states.is_empty()).then(|| EventPayload::Order { updated: states, fill: Vec::new() });
    Ok((json!(accepted), event))
}

pub fn amend_orders(
    conn: &mut ConnectionSession,
    cid: &str,
    params: &Value,
) -> Result<(Value, Option<EventPayload>), RouterError> {
    let partials: Vec<PartialOrder> = decode(params)?;
    let client = conn.client_mut(cid).ok_or(RouterError::InvalidClient)?;
    let states = client.broker_mut().amend(&partials, Utc::now());
    let count = states.len();
    let event = (!states.is_empty()).then(|| EventPayload::Order { updated: states, fill: Vec::new() });
    Ok((json!(count), event))
}

pub fn cancel_orders(
    conn: &mut ConnectionSession,
    cid: &str,
    params: &Value,
) -> Result<(Value, Option<EventPayload>), RouterError> {
    let ids: Vec<String> = decode(params)?;
    let client = conn.client_mut(cid).ok_or(RouterError::InvalidClient)?;
    let states = client.broker_mut().cancel(&ids, Utc::now());
    let count = states.len();
    let event = (!states.is_empty()).then(|| EventPayload::Order { updated: states, fill: Vec::new() });
    Ok((json!(count), event))
}

pub fn cancel_all_orders(conn: &mut ConnectionSession, cid: &str) -> Result<(Value, Option<EventPayload>), RouterError> {
    let client = conn.client_mut(cid).ok_or(RouterError::InvalidClient)?;
    let states = client.broker_mut().cancel_all(Utc::now());
    let count = states.len();
    let event = (!states.is_empty()).then(|| EventPayload::Order { updated: states, fill: Vec::new() });
    Ok((json!(count), event))
}
