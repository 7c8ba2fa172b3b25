//! Settings endpoints. Reads mask secret values; writes validate and then
//! invalidate nothing — the settings snapshot is rebuilt on worker restart,
//! and per-request consumers re-read the file.

use axum::extract::State;
use axum::Json;
use serde_json::{Map, Value};

use crate::config;
use crate::server::error::{ApiError, ApiResult};
use crate::server::AppState;

/// `GET /settings` — the flat map with API-key-like values masked.
pub async fn get_settings(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let map = config::load_settings_file(&state.settings_path).map_err(ApiError::Internal)?;

    let masked: Map<String, Value> = map
        .into_iter()
        .map(|(key, value)| {
            let value = match (&value, config::is_secret_key(&key)) {
                (Value::String(s), true) if !s.is_empty() => {
                    Value::String(config::mask_secret(s))
                }
                _ => value,
            };
            (key, value)
        })
        .collect();

    Ok(Json(Value::Object(masked)))
}

/// `PUT /settings` — validate, merge, persist. A masked echo of a secret
/// keeps the stored value instead of overwriting it with the mask.
pub async fn put_settings(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let updates = body
        .as_object()
        .cloned()
        .ok_or_else(|| ApiError::Validation("settings body must be a JSON object".into()))?;

    config::validate_settings_update(&updates).map_err(ApiError::Validation)?;

    let mut current =
        config::load_settings_file(&state.settings_path).map_err(ApiError::Internal)?;

    for (key, value) in updates {
        let keep_existing = config::is_secret_key(&key)
            && value
                .as_str()
                .is_some_and(config::is_masked_echo);
        if keep_existing {
            continue;
        }
        if value.is_null() {
            current.remove(&key);
        } else {
            current.insert(key, value);
        }
    }

    config::save_settings_file(&state.settings_path, &current).map_err(ApiError::Internal)?;
    tracing::info!("settings updated; restart applies provider changes to running sessions");

    Ok(Json(serde_json::json!({"status": "ok"})))
}
