use serde::Serialize;
use serde_json::{Map, Value};
use tether_sqlcore::decode_buffer;

pub(crate) fn with_pretty_json_debug<T, F>(value: &T, log_action: F)
where
    T: Serialize,
    F: FnOnce(&str),
{
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }

    let pretty_json = serde_json::to_string_pretty(value)
        .unwrap_or_else(|error| format!("<pretty serialize failed: {error}>"));
    log_action(pretty_json.as_str());
}

/// Copy of an inbound message that is safe to log: binary `args` become their length, the
/// `key` of each argument and every password or remote configuration key are masked.
pub(crate) fn redacted(message: &Value) -> Value {
    redact(None, message)
}

fn masked() -> Value {
    Value::String("****".to_string())
}

fn redact(key: Option<&str>, value: &Value) -> Value {
    match (key, value) {
        (Some("remoteConfigurationKey" | "password"), _) => masked(),
        (Some("args"), Value::Array(args)) => Value::Array(args.iter().map(redact_arg).collect()),
        (_, Value::Object(map)) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact(Some(k), v)))
                .collect::<Map<_, _>>(),
        ),
        (_, Value::Array(items)) => Value::Array(items.iter().map(|v| redact(None, v)).collect()),
        (_, other) => other.clone(),
    }
}

fn redact_arg(arg: &Value) -> Value {
    if let Some(bytes) = decode_buffer(arg) {
        return Value::String(format!("<Buffer length {}>", bytes.len()));
    }
    match arg {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| match k.as_str() {
                    "key" => (k.clone(), masked()),
                    _ => (k.clone(), redact(Some(k), v)),
                })
                .collect::<Map<_, _>>(),
        ),
        other => redact(None, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn buffers_and_keys_are_hidden() {
        let message = json!({
            "app": true,
            "cmd": "changeConfig",
            "args": [
                { "type": "buffer", "data": "AAEC" },
                { "remoteConfigurationKey": "secret", "name": "c1" },
                { "key": "dm-api-key", "cid": "c1" },
                {
                    "datamodels": [
                        { "name": "erp", "options": { "user": "sa", "password": "hunter2" } }
                    ]
                }
            ]
        });
        assert_eq!(
            redacted(&message),
            json!({
                "app": true,
                "cmd": "changeConfig",
                "args": [
                    "<Buffer length 3>",
                    { "remoteConfigurationKey": "****", "name": "c1" },
                    { "key": "****", "cid": "c1" },
                    {
                        "datamodels": [
                            { "name": "erp", "options": { "user": "sa", "password": "****" } }
                        ]
                    }
                ]
            })
        );

        // Only argument keys are masked; a nested `key` is ordinary data.
        let message = json!({ "args": [{ "sort": { "key": "name" } }] });
        assert_eq!(redacted(&message), message);
    }
}
