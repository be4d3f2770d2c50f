use std::future::Future;

use serde_json::Value;
use uuid::Uuid;

tokio::task_local! {
    static TRACE_ID: String;
}

pub async fn with_trace_id_scope<F>(trace_id: String, future: F) -> F::Output
where
    F: Future,
{
    TRACE_ID.scope(trace_id, future).await
}

pub fn current_trace_id() -> Option<String> {
    TRACE_ID.try_with(Clone::clone).ok()
}

/// Trace id for one call: `params.trace_id` when the client sent a
/// non-blank one, otherwise a fresh UUID.
pub fn trace_id_for_params(params: &Value) -> String {
    params
        .as_object()
        .and_then(|params| params.get("trace_id"))
        .and_then(Value::as_str)
        .filter(|trace_id| !trace_id.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(generate_trace_id)
}

fn generate_trace_id() -> String {
    Uuid::new_v4().to_string()
}
