//! Device Directory
//!
//! Device listing, cached data items and the sidecar tables used to
//! enrich live updates, all read through ksqlDB pull queries.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::ksql::{quote_literal, sanitize_identifier, KsqlClient};
use super::{DeviceDirectory, ServiceError};
use crate::config::StatsTableConfig;

/// Sidecar lookup applied to a device's updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentKind {
    /// Attach `durations`: accumulated time per state of the updated item
    Durations,
    /// Attach `avg_value`: the moving average matching the update's timestamp
    MovingAverage,
}

/// ksqlDB-backed [`DeviceDirectory`]
pub struct KsqlDeviceDirectory {
    client: Arc<KsqlClient>,
    stats: StatsTableConfig,
    enrichment: HashMap<String, EnrichmentKind>,
}

impl KsqlDeviceDirectory {
    pub fn new(
        client: Arc<KsqlClient>,
        stats: StatsTableConfig,
        enrichment: HashMap<String, EnrichmentKind>,
    ) -> Self {
        Self {
            client,
            stats,
            enrichment,
        }
    }

    /// Durations keyed by state, for every stats row whose key starts with `prefix`
    async fn durations_for(&self, prefix: &str) -> Result<Map<String, Value>, ServiceError> {
        let sql = format!(
            "SELECT {key}, {value} FROM {table} WHERE {key} LIKE '{prefix}%';",
            key = self.stats.key_column,
            value = self.stats.value_column,
            table = self.stats.table,
            prefix = quote_literal(prefix),
        );

        let rows = self.client.query(&sql).await?;
        let mut durations = Map::new();
        for row in rows {
            let (Some(key), Some(value)) = (
                row.get(&self.stats.key_column).and_then(Value::as_str),
                row.get(&self.stats.value_column),
            ) else {
                continue;
            };
            let state: String = key.chars().skip(self.stats.key_offset).collect();
            if !state.is_empty() {
                durations.insert(state, value.clone());
            }
        }
        Ok(durations)
    }

    async fn moving_average(&self, data: &Map<String, Value>) -> Result<Value, ServiceError> {
        let id = data
            .get("ID")
            .and_then(Value::as_str)
            .ok_or(ServiceError::MissingField("ID"))?;
        let timestamp = data
            .get("TIMESTAMP")
            .and_then(Value::as_str)
            .ok_or(ServiceError::MissingField("TIMESTAMP"))?;

        // Match on the timestamp truncated to whole seconds.
        let keep = timestamp.chars().count().saturating_sub(10);
        let prefix: String = timestamp.chars().take(keep).collect();

        let sql = format!(
            "SELECT AVERAGE_VALUE, TIMESTAMP FROM {table}_moving_average WHERE timestamp LIKE '{prefix}%';",
            table = sanitize_identifier(id),
            prefix = quote_literal(&prefix),
        );

        let rows = self.client.query(&sql).await?;
        let average = rows.into_iter().next().and_then(|row| {
            match (row.get("AVERAGE_VALUE"), row.get("TIMESTAMP")) {
                (Some(value), Some(ts)) if !value.is_null() && !ts.is_null() => {
                    Some(json!({ "value": value, "timestamp": ts }))
                }
                _ => None,
            }
        });

        Ok(average.unwrap_or_else(|| json!({})))
    }
}

#[async_trait]
impl DeviceDirectory for KsqlDeviceDirectory {
    async fn list_devices(&self) -> Result<Vec<String>, ServiceError> {
        let rows = self
            .client
            .query("SELECT ASSET_UUID FROM assets_type WHERE TYPE LIKE 'Device';")
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                row.get("ASSET_UUID")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
            })
            .collect())
    }

    async fn data_items(&self, device_id: &str) -> Result<Map<String, Value>, ServiceError> {
        let sql = format!(
            "SELECT ID, VALUE FROM assets WHERE ASSET_UUID = '{}' \
             AND TYPE IN ('Events', 'Condition') AND VALUE != 'UNAVAILABLE';",
            quote_literal(device_id)
        );

        let rows = self.client.query(&sql).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.get("ID")?.as_str()?.to_string();
                let value = row.get("VALUE")?.clone();
                Some((id, value))
            })
            .collect())
    }

    async fn duration_stats(&self, device_id: &str) -> Result<Map<String, Value>, ServiceError> {
        self.durations_for(device_id).await
    }

    async fn enrich(&self, device_id: &str, data: &mut Map<String, Value>) -> Result<(), ServiceError> {
        match self.enrichment.get(device_id) {
            None => Ok(()),
            Some(EnrichmentKind::Durations) => {
                let id = data
                    .get("ID")
                    .and_then(Value::as_str)
                    .ok_or(ServiceError::MissingField("ID"))?
                    .to_string();
                let durations = self.durations_for(&id).await?;
                data.insert("durations".to_string(), Value::Object(durations));
                Ok(())
            }
            Some(EnrichmentKind::MovingAverage) => {
                let average = self.moving_average(data).await?;
                data.insert("avg_value".to_string(), average);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn directory(server: &MockServer) -> KsqlDeviceDirectory {
        let client = Arc::new(KsqlClient::new(server.uri(), Duration::from_secs(2)).unwrap());
        let enrichment = HashMap::from([
            ("IVAC".to_string(), EnrichmentKind::Durations),
            ("DUSTTRAK".to_string(), EnrichmentKind::MovingAverage),
        ]);
        KsqlDeviceDirectory::new(client, StatsTableConfig::default(), enrichment)
    }

    async fn mount_query(server: &MockServer, contains: &str, body: Value) {
        Mock::given(method("POST"))
            .and(path("/query"))
            .and(body_string_contains(contains))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_list_devices() {
        let server = MockServer::start().await;
        mount_query(
            &server,
            "FROM assets_type",
            json!([
                {"header": {"queryId": "q", "schema": "`ASSET_UUID` STRING"}},
                {"row": {"columns": ["IVAC"]}},
                {"row": {"columns": [null]}},
                {"row": {"columns": ["DUSTTRAK"]}}
            ]),
        )
        .await;

        let devices = directory(&server).list_devices().await.unwrap();
        assert_eq!(devices, vec!["IVAC", "DUSTTRAK"]);
    }

    #[tokio::test]
    async fn test_data_items() {
        let server = MockServer::start().await;
        mount_query(
            &server,
            "ASSET_UUID = 'IVAC'",
            json!([
                {"header": {"queryId": "q", "schema": "`ID` STRING, `VALUE` STRING"}},
                {"row": {"columns": ["A1ToolPlus", "ON"]}},
                {"row": {"columns": ["BlastGate", "OPEN"]}}
            ]),
        )
        .await;

        let items = directory(&server).data_items("IVAC").await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items["A1ToolPlus"], "ON");
    }

    #[tokio::test]
    async fn test_enrich_durations() {
        let server = MockServer::start().await;
        mount_query(
            &server,
            "LIKE 'A1ToolPlus%'",
            json!([
                {"header": {"queryId": "q", "schema": "`IVAC_POWER_KEY` STRING, `TOTAL_DURATION_SEC` DOUBLE"}},
                {"row": {"columns": ["A1ToolPlus_ON", 120.5]}},
                {"row": {"columns": ["A1ToolPlus_OFF", 30.0]}}
            ]),
        )
        .await;

        let mut data = Map::new();
        data.insert("ID".to_string(), json!("A1ToolPlus"));
        directory(&server).enrich("IVAC", &mut data).await.unwrap();

        assert_eq!(data["durations"]["ON"], 120.5);
        assert_eq!(data["durations"]["OFF"], 30.0);
    }

    #[tokio::test]
    async fn test_enrich_moving_average_empty() {
        let server = MockServer::start().await;
        mount_query(
            &server,
            "pm25_moving_average",
            json!([{"header": {"queryId": "q", "schema": "`AVERAGE_VALUE` DOUBLE, `TIMESTAMP` STRING"}}]),
        )
        .await;

        let mut data = Map::new();
        data.insert("ID".to_string(), json!("pm25"));
        data.insert("TIMESTAMP".to_string(), json!("2025-01-01T10:00:00.1234567"));
        directory(&server).enrich("DUSTTRAK", &mut data).await.unwrap();

        assert_eq!(data["avg_value"], json!({}));
    }

    #[tokio::test]
    async fn test_enrich_without_rule_is_noop() {
        let server = MockServer::start().await;
        let mut data = Map::new();
        directory(&server).enrich("CNC", &mut data).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_enrich_missing_id() {
        let server = MockServer::start().await;
        let mut data = Map::new();
        let err = directory(&server).enrich("IVAC", &mut data).await.unwrap_err();
        assert!(matches!(err, ServiceError::MissingField("ID")));
    }
}
