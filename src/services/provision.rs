//! Derived stream provisioning through ksqlDB.

use async_trait::async_trait;
use std::sync::Arc;

use super::ksql::{quote_literal, sanitize_identifier, KsqlClient};
use super::{ServiceError, StreamProvisioner};

/// Provisions `device_stream_<id>` streams filtered from the shared source stream
pub struct KsqlStreamProvisioner {
    client: Arc<KsqlClient>,
    source_stream: String,
    timestamp_zone: String,
}

impl KsqlStreamProvisioner {
    pub fn new(
        client: Arc<KsqlClient>,
        source_stream: impl Into<String>,
        timestamp_zone: impl Into<String>,
    ) -> Self {
        Self {
            client,
            source_stream: source_stream.into(),
            timestamp_zone: timestamp_zone.into(),
        }
    }

    /// ksqlDB stream name for a device
    pub fn stream_name(device_id: &str) -> String {
        format!("device_stream_{}", sanitize_identifier(device_id))
    }

    /// Backing topic of a device's derived stream
    pub fn topic_name(device_id: &str) -> String {
        format!("{}_monitoring", device_id)
    }

    fn create_statement(&self, device_id: &str) -> String {
        format!(
            "CREATE STREAM IF NOT EXISTS {stream} \
             WITH (KAFKA_TOPIC='{topic}', PARTITIONS=1) AS \
             SELECT ASSET_UUID AS KEY, ID, VALUE, \
             TIMESTAMPTOSTRING(ROWTIME, 'yyyy-MM-dd''T''HH:mm:ss[.nnnnnnn]', '{zone}') AS TIMESTAMP \
             FROM {source} WHERE ASSET_UUID = '{device}' \
             AND TYPE IN ('Events', 'Condition', 'Samples') AND VALUE != 'UNAVAILABLE' \
             EMIT CHANGES;",
            stream = Self::stream_name(device_id),
            topic = quote_literal(&Self::topic_name(device_id)),
            zone = quote_literal(&self.timestamp_zone),
            source = self.source_stream,
            device = quote_literal(device_id),
        )
    }
}

#[async_trait]
impl StreamProvisioner for KsqlStreamProvisioner {
    async fn provision(&self, device_id: &str) -> Result<String, ServiceError> {
        let statement = self.create_statement(device_id);
        self.client
            .execute_statement(&statement)
            .await
            .map_err(|e| ServiceError::Provision {
                device_id: device_id.to_string(),
                reason: e.to_string(),
            })?;

        let topic = Self::topic_name(device_id);
        tracing::info!(device_id = %device_id, topic = %topic, "Provisioned derived stream");
        Ok(topic)
    }

    async fn deprovision(&self, device_id: &str) -> Result<(), ServiceError> {
        let statement = format!("DROP STREAM IF EXISTS {};", Self::stream_name(device_id));
        self.client
            .execute_statement(&statement)
            .await
            .map_err(|e| ServiceError::Deprovision {
                device_id: device_id.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!(device_id = %device_id, "Dropped derived stream");
        Ok(())
    }
}
