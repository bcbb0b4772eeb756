//! ksqlDB REST Client
//!
//! Thin HTTP client for the two ksqlDB endpoints the gateway needs:
//! `/ksql` for statements and `/query` for pull queries.

use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

use super::ServiceError;

const KSQL_CONTENT_TYPE: &str = "application/vnd.ksql.v1+json";

/// ksqlDB REST API client
pub struct KsqlClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct KsqlRequest<'a> {
    ksql: &'a str,
    #[serde(rename = "streamsProperties")]
    streams_properties: HashMap<String, String>,
}

impl KsqlClient {
    /// Create a client for the server at `base_url`
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, ServiceError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        Ok(Self { client, base_url })
    }

    /// The server base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run a statement (DDL, INSERT) through `/ksql`
    pub async fn execute_statement(&self, sql: &str) -> Result<Value, ServiceError> {
        tracing::debug!(sql = %sql, "Executing ksqlDB statement");
        self.post("/ksql", sql).await
    }

    /// Run a pull query through `/query` and return one JSON object per row
    pub async fn query(&self, sql: &str) -> Result<Vec<Map<String, Value>>, ServiceError> {
        tracing::debug!(sql = %sql, "Running ksqlDB query");
        let body = self.post("/query", sql).await?;
        parse_query_response(body)
    }

    async fn post(&self, endpoint: &str, sql: &str) -> Result<Value, ServiceError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let body = KsqlRequest {
            ksql: sql,
            streams_properties: HashMap::new(),
        };

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::ACCEPT, KSQL_CONTENT_TYPE)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ServiceError::Timeout
                } else if e.is_connect() {
                    ServiceError::Unavailable
                } else {
                    ServiceError::Request(e)
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(response.json().await?)
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(ServiceError::Ksql {
                status: status.as_u16(),
                message: error_message(&text),
            })
        }
    }
}

/// ksqlDB error bodies carry a `message` field; fall back to the raw text.
fn error_message(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| text.to_string())
}

fn parse_query_response(body: Value) -> Result<Vec<Map<String, Value>>, ServiceError> {
    let entries = match body {
        Value::Array(entries) => entries,
        other => {
            return Err(ServiceError::InvalidResponse(format!(
                "expected an array, got {}",
                other
            )))
        }
    };

    let mut columns: Option<Vec<String>> = None;
    let mut rows = Vec::new();

    for entry in entries {
        if let Some(schema) = entry.pointer("/header/schema").and_then(Value::as_str) {
            columns = Some(parse_schema(schema));
            continue;
        }

        let Some(values) = entry.pointer("/row/columns").and_then(Value::as_array) else {
            continue;
        };
        let names = columns
            .as_ref()
            .ok_or_else(|| ServiceError::InvalidResponse("row before header".to_string()))?;

        let row: Map<String, Value> = names.iter().cloned().zip(values.iter().cloned()).collect();
        rows.push(row);
    }

    Ok(rows)
}

/// Column names from a header schema such as
/// `` `ID` STRING, `STATS` STRUCT<`A` INT, `B` INT> ``.
fn parse_schema(schema: &str) -> Vec<String> {
    let mut columns = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();

    for c in schema.chars() {
        match c {
            '<' | '(' => {
                depth += 1;
                current.push(c);
            }
            '>' | ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                columns.push(column_name(&current));
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        columns.push(column_name(&current));
    }

    columns
}

fn column_name(definition: &str) -> String {
    let definition = definition.trim();
    if let Some(rest) = definition.strip_prefix('`') {
        if let Some(end) = rest.find('`') {
            return rest[..end].to_string();
        }
    }
    definition
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Escape a value for use inside a single-quoted ksqlDB string literal
pub fn quote_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Reduce a value to characters valid in an unquoted ksqlDB identifier
pub fn sanitize_identifier(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}
