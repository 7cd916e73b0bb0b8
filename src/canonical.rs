use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

use crate::endpoints::EndpointRegistry;
use crate::errors::GateError;
use crate::types::{strip_envelope_fields, Params, UnixMillis};

pub const APPROVAL_HEADER: &str = "VIA WALLET APPROVAL REQUIRED";
pub const CONSENT_LINE: &str = "By signing this message, you approve this sensitive operation.";

const INDENT: &str = "  ";

pub fn build_message(
    registry: &EndpointRegistry,
    method: &str,
    path: &str,
    params: &Params,
    timestamp: UnixMillis,
) -> Result<String, GateError> {
    let clean = strip_envelope_fields(params);
    let action = registry.describe(path, &clean);
    let iso = iso_timestamp(timestamp)?;
    let rendered = to_pretty_sorted(&Value::Object(clean))?;

    Ok(format!(
        "{APPROVAL_HEADER}\n\nAction: {action}\nEndpoint: {} {path}\nTimestamp: {iso}\n\nParameters:\n{rendered}\n\n{CONSENT_LINE}",
        method.to_ascii_uppercase()
    ))
}

pub fn iso_timestamp(timestamp: UnixMillis) -> Result<String, GateError> {
    DateTime::<Utc>::from_timestamp_millis(timestamp)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| {
            GateError::MalformedSignedMessage(format!("timestamp {timestamp} out of range"))
        })
}

pub fn message_digest(message: &str) -> String {
    hex::encode(Sha256::digest(message.as_bytes()))
}

pub fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Params::new();
            for k in keys {
                out.insert(k.clone(), sort_keys(&map[k]));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

pub fn to_pretty_sorted(value: &Value) -> Result<String, GateError> {
    let mut out = String::new();
    write_value(&mut out, value, Some(0))?;
    Ok(out)
}

pub fn to_compact_sorted(value: &Value) -> Result<String, GateError> {
    let mut out = String::new();
    write_value(&mut out, value, None)?;
    Ok(out)
}

fn write_value(out: &mut String, value: &Value, depth: Option<usize>) -> Result<(), GateError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&js_number(n)),
        Value::String(s) => out.push_str(&quote(s)?),
        Value::Array(items) => {
            if items.is_empty() {
                out.push_str("[]");
                return Ok(());
            }
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                newline_indent(out, depth.map(|d| d + 1));
                write_value(out, item, depth.map(|d| d + 1))?;
            }
            newline_indent(out, depth);
            out.push(']');
        }
        Value::Object(map) => {
            if map.is_empty() {
                out.push_str("{}");
                return Ok(());
            }
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                newline_indent(out, depth.map(|d| d + 1));
                out.push_str(&quote(key)?);
                out.push(':');
                if depth.is_some() {
                    out.push(' ');
                }
                write_value(out, &map[key], depth.map(|d| d + 1))?;
            }
            newline_indent(out, depth);
            out.push('}');
        }
    }
    Ok(())
}

fn newline_indent(out: &mut String, depth: Option<usize>) {
    if let Some(depth) = depth {
        out.push('\n');
        for _ in 0..depth {
            out.push_str(INDENT);
        }
    }
}

fn quote(s: &str) -> Result<String, GateError> {
    serde_json::to_string(s).map_err(|e| GateError::MalformedSignedMessage(e.to_string()))
}

pub fn js_number(n: &Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    let Some(f) = n.as_f64() else {
        return n.to_string();
    };
    if f == 0.0 {
        return "0".to_string();
    }
    let abs = f.abs();
    if !(1e-6..1e21).contains(&abs) {
        let sci = format!("{f:e}");
        return match sci.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
            _ => sci,
        };
    }
    format!("{f}")
}

/// `None` renders as `undefined`.
pub fn js_template(value: Option<&Value>) -> String {
    match value {
        None => "undefined".to_string(),
        Some(Value::Null) => "null".to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => js_number(n),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => js_template(Some(other)),
            })
            .collect::<Vec<_>>()
            .join(","),
        Some(Value::Object(_)) => "[object Object]".to_string(),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureDebugInfo {
    pub method: String,
    pub endpoint: String,
    pub timestamp: UnixMillis,
    pub message_to_sign: String,
    pub message_digest: String,
    pub public_key_prefix: String,
}

pub fn debug_info(
    registry: &EndpointRegistry,
    method: &str,
    path: &str,
    body: &Params,
    timestamp: UnixMillis,
    public_key: &str,
) -> Result<SignatureDebugInfo, GateError> {
    let message = build_message(registry, method, path, body, timestamp)?;
    Ok(SignatureDebugInfo {
        method: method.to_ascii_uppercase(),
        endpoint: path.to_string(),
        timestamp,
        message_digest: message_digest(&message),
        message_to_sign: message,
        public_key_prefix: public_key.chars().take(20).collect(),
    })
}
