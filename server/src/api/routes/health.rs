//! Health and stats endpoints

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::api::CoreContext;
use crate::data::streams::StreamName;

/// `GET /health`: liveness plus dependency probes
pub async fn health(State(ctx): State<Arc<CoreContext>>) -> impl IntoResponse {
    let store_ok = sqlx::query("SELECT 1")
        .execute(ctx.store.pool())
        .await
        .is_ok();
    let broker_ok = ctx.streams.health_check().await.is_ok();
    let cache_ok = ctx.cache.health_check().await.is_ok();

    let healthy = store_ok && broker_ok && cache_ok;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if healthy { "ok" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "checks": {
                "store": store_ok,
                "broker": broker_ok,
                "cache": cache_ok,
            }
        })),
    )
}

/// `GET /stats`: stream depths, consumer-group pending lists, worker
/// metrics, breaker state, DLQ backlog, live connections
pub async fn stats(State(ctx): State<Arc<CoreContext>>) -> impl IntoResponse {
    let streams: Vec<serde_json::Value> = ctx
        .stream_monitor
        .lengths()
        .await
        .into_iter()
        .map(|(stream, length, cap)| {
            serde_json::json!({ "stream": stream, "length": length, "cap": cap })
        })
        .collect();

    // Records delivered but not yet acked, per consumer group
    let mut pending = serde_json::Map::new();
    for (stream, group) in [
        (StreamName::RetryMessages, "retry"),
        (StreamName::FallbackMessages, "fallback"),
        (StreamName::EventsMessages, "dispatch"),
        (StreamName::EventsStatus, "status"),
    ] {
        let depth = ctx
            .streams
            .pending(stream, group)
            .await
            .map(|entries| entries.len())
            .unwrap_or(0);
        pending.insert(format!("{stream}/{group}"), depth.into());
    }

    let workers: serde_json::Map<String, serde_json::Value> = ctx
        .supervisor
        .metrics()
        .into_iter()
        .map(|(name, metrics)| {
            (
                name.to_string(),
                serde_json::to_value(metrics).unwrap_or_default(),
            )
        })
        .collect();

    let dead_letters: Vec<serde_json::Value> = ctx
        .dlq
        .recent(10)
        .await
        .into_iter()
        .map(|letter| {
            serde_json::json!({
                "entity": letter.action.entity_id(),
                "attempts": letter.attempts,
                "reason": letter.reason,
                "deadAt": letter.dead_at,
            })
        })
        .collect();

    let audit_tail: Vec<serde_json::Value> = ctx
        .gateway
        .recent_events(10)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|row| {
            serde_json::json!({
                "type": row.event_type,
                "entityId": row.entity_id,
                "at": row.created_at,
            })
        })
        .collect();

    Json(serde_json::json!({
        "broker": ctx.streams.backend_name(),
        "breaker": ctx.gateway.breaker().state().as_str(),
        "connections": ctx.hub.connection_count(),
        "identitiesConnected": ctx.hub.identity_count(),
        "presenceTracked": ctx.presence.tracked_count(),
        "files": {
            "enabled": ctx.files.is_enabled(),
            "backend": ctx.files.backend_name(),
        },
        "streams": streams,
        "pending": pending,
        "workers": workers,
        "dlq": {
            "length": ctx.dlq.len(),
            "alerting": ctx.dlq.is_alerting(),
            "recent": dead_letters,
        },
        "auditTail": audit_tail,
    }))
}
