//! Device command channel: commands are inserted into the command stream.

use async_trait::async_trait;
use std::sync::Arc;

use super::ksql::{quote_literal, KsqlClient};
use super::{CommandChannel, ServiceError};

/// Writes commands as rows of the ksqlDB command stream
pub struct KsqlCommandChannel {
    client: Arc<KsqlClient>,
    command_stream: String,
    asset_uuid: String,
}

impl KsqlCommandChannel {
    /// `asset_uuid` identifies the asset the commands are addressed to
    pub fn new(
        client: Arc<KsqlClient>,
        command_stream: impl Into<String>,
        asset_uuid: impl Into<String>,
    ) -> Self {
        Self {
            client,
            command_stream: command_stream.into(),
            asset_uuid: asset_uuid.into(),
        }
    }
}

#[async_trait]
impl CommandChannel for KsqlCommandChannel {
    async fn send(&self, name: &str, value: &str) -> Result<(), ServiceError> {
        let statement = format!(
            "INSERT INTO {} (ASSET_UUID, CMD, ARGS) VALUES ('{}', '{}', '{}');",
            self.command_stream,
            quote_literal(&self.asset_uuid),
            quote_literal(name),
            quote_literal(value),
        );

        self.client
            .execute_statement(&statement)
            .await
            .map_err(|e| ServiceError::Command {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!(asset_uuid = %self.asset_uuid, command = %name, value = %value, "Sent device command");
        Ok(())
    }
}
