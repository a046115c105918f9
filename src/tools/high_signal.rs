use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use std::collections::HashMap;

const WILDCARD: &str = "[*].";

type PathTable = HashMap<(String, String), Vec<&'static str>>;

/// Curated telemetry fields per (provider, tool). Keys are lowercase.
pub static HIGH_SIGNAL_PATHS: Lazy<PathTable> = Lazy::new(|| {
    let mut table: PathTable = HashMap::new();

    table.insert(
        key("gmail", "gmail_fetch_emails"),
        vec![
            "messages[*].messageId",
            "messages[*].subject",
            "messages[*].sender",
            "resultSizeEstimate",
            "nextPageToken",
        ],
    );
    table.insert(key("gmail", "gmail_send_email"), vec!["id", "threadId", "labelIds"]);
    table.insert(
        key("slack", "slack_send_message"),
        vec!["ok", "channel", "ts", "message.text"],
    );
    table.insert(
        key("slack", "slack_list_conversations"),
        vec!["channels[*].id", "channels[*].name", "response_metadata.next_cursor"],
    );
    table.insert(
        key("hubspot", "hubspot_create_contact"),
        vec!["id", "properties.email", "createdAt"],
    );
    table.insert(
        key("hubspot", "hubspot_search_contacts"),
        vec!["total", "results[*].id", "paging.next.after"],
    );
    table.insert(
        key("stripe", "stripe_create_payment_intent"),
        vec!["id", "status", "amount", "currency"],
    );
    table.insert(
        key("stripe", "stripe_list_customers"),
        vec!["data[*].id", "data[*].email", "has_more"],
    );
    table.insert(
        key("github", "github_create_issue"),
        vec!["number", "html_url", "state"],
    );

    table
});

fn key(provider: &str, tool: &str) -> (String, String) {
    (provider.to_ascii_lowercase(), tool.to_ascii_lowercase())
}

pub fn paths_for(provider: &str, tool: &str) -> Option<&'static [&'static str]> {
    HIGH_SIGNAL_PATHS
        .get(&key(provider, tool))
        .map(|paths| paths.as_slice())
}

/// Pulls the configured high-signal fields for `(provider, tool)` out of unwrapped tool data.
pub fn extract(provider: &str, tool: &str, data: &Value) -> Map<String, Value> {
    match paths_for(provider, tool) {
        Some(paths) => extract_paths(paths, data),
        None => Map::new(),
    }
}

pub fn extract_paths(paths: &[&str], data: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    for path in paths {
        if let Some((base, field)) = path.split_once(WILDCARD) {
            let collected: Vec<Value> = match get_path(data, base, Value::Null) {
                Value::Array(items) => items
                    .iter()
                    .filter_map(|item| item.as_object().and_then(|m| m.get(field)).cloned())
                    .collect(),
                _ => Vec::new(),
            };
            if !collected.is_empty() {
                out.insert(path.to_string(), Value::Array(collected));
            }
        } else {
            let value = get_path(data, path, Value::Null);
            if !value.is_null() {
                out.insert(path.to_string(), value);
            }
        }
    }
    out
}

/// Dotted traversal over maps (by key) and arrays (by integer index).
pub fn get_path(data: &Value, path: &str, default: Value) -> Value {
    let mut current = data;
    for segment in path.split('.') {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return default,
        }
    }
    current.clone()
}
