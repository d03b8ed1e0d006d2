//! Driver adapter: thin synchronous wrappers over the three driver RPCs.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::debug;

use crate::proto;
use crate::proto::export_controller_client::ExportControllerClient;

/// Error from a driver call.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The driver answered with a gRPC status.
    #[error("rpc error: {0}")]
    Rpc(#[from] Status),

    /// The call never produced a gRPC status (transport setup, local
    /// timeout). The RPC may still be running server-side.
    #[error("driver connection error: {0}")]
    Connection(String),

    /// A well-formed response that cannot be used (e.g. empty list entry).
    #[error("{0}")]
    Other(String),
}

impl DriverError {
    /// Whether the error proves the RPC is no longer in flight.
    ///
    /// Only a gRPC status outside the retriable set is final. Anything else
    /// may mean the server is still processing the create; treating it as
    /// final would risk a second create that orphans the first export.
    pub fn is_final(&self) -> bool {
        match self {
            DriverError::Rpc(status) => is_final_status(status),
            DriverError::Connection(_) | DriverError::Other(_) => false,
        }
    }
}

/// Classify a gRPC status: final unless the server may still be working.
pub fn is_final_status(status: &Status) -> bool {
    !matches!(
        status.code(),
        // Client cancelled; server may still process the request.
        Code::Cancelled
        // Timeout before the server answered.
        | Code::DeadlineExceeded
        // Server shutting down or connection broken mid-call.
        | Code::Unavailable
        // Server temporarily out of resources.
        | Code::ResourceExhausted
        // Operation pending for this export.
        | Code::Aborted
    )
}

/// Result of a successful CreateExport.
#[derive(Clone, Debug, PartialEq)]
pub struct CreatedExport {
    /// Driver name, from the plugin info probe.
    pub driver_name: String,
    /// Backend export id.
    pub export_id: String,
    /// When the export was cut; `None` when the driver reported no time.
    pub creation_time: Option<DateTime<Utc>>,
    /// Export size in bytes.
    pub size_bytes: i64,
    /// Whether the export is already usable.
    pub ready_to_use: bool,
}

/// Result of a status probe.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportStatus {
    /// Whether the export is usable.
    pub ready_to_use: bool,
    /// When the export was cut; `None` when unknown.
    pub creation_time: Option<DateTime<Utc>>,
    /// Export size in bytes.
    pub size_bytes: i64,
}

/// CreateExport/DeleteExport/GetExportStatus against a storage driver.
#[async_trait]
pub trait ExportDriver: Send + Sync {
    /// Create an export of a volume. `name` is the driver-side idempotency
    /// key and must be stable across retries.
    async fn create_export(
        &self,
        name: &str,
        volume_handle: &str,
        parameters: &BTreeMap<String, String>,
        secrets: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<CreatedExport, DriverError>;

    /// Delete an export by id.
    async fn delete_export(
        &self,
        export_id: &str,
        secrets: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<(), DriverError>;

    /// Check readiness, creation time and size of an export. Drivers without
    /// the list capability are assumed ready.
    async fn export_status(
        &self,
        export_id: &str,
        list_secrets: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<ExportStatus, DriverError>;
}

/// gRPC implementation over a tonic channel.
pub struct GrpcExportDriver {
    client: ExportControllerClient<Channel>,
}

impl GrpcExportDriver {
    /// Connect to the driver endpoint (e.g. `http://127.0.0.1:9010`).
    pub async fn connect(endpoint: &str) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(endpoint.to_string())?
            .connect()
            .await?;
        Ok(Self {
            client: ExportControllerClient::new(channel),
        })
    }

    /// Wrap an already-built channel (tests, custom transports).
    pub fn from_channel(channel: Channel) -> Self {
        Self {
            client: ExportControllerClient::new(channel),
        }
    }

    async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, DriverError>
    where
        F: std::future::Future<Output = Result<T, Status>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result.map_err(DriverError::Rpc),
            Err(_) => Err(DriverError::Rpc(Status::deadline_exceeded(
                "driver call exceeded configured timeout",
            ))),
        }
    }

    async fn driver_name(&self, timeout: Duration) -> Result<String, DriverError> {
        let mut client = self.client.clone();
        let response = Self::with_timeout(timeout, async move {
            client
                .get_plugin_info(proto::GetPluginInfoRequest {})
                .await
                .map(|r| r.into_inner())
        })
        .await?;
        Ok(response.name)
    }

    async fn supports_list(&self, timeout: Duration) -> Result<bool, DriverError> {
        let mut client = self.client.clone();
        let response = Self::with_timeout(timeout, async move {
            client
                .controller_get_capabilities(proto::ControllerGetCapabilitiesRequest {})
                .await
                .map(|r| r.into_inner())
        })
        .await?;

        let list_type = proto::controller_capability::rpc::Type::ListExports as i32;
        Ok(response
            .capabilities
            .iter()
            .filter_map(|capability| capability.rpc.as_ref())
            .any(|rpc| rpc.r#type == list_type))
    }
}

#[async_trait]
impl ExportDriver for GrpcExportDriver {
    async fn create_export(
        &self,
        name: &str,
        volume_handle: &str,
        parameters: &BTreeMap<String, String>,
        secrets: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<CreatedExport, DriverError> {
        debug!(export = name, volume = volume_handle, "CreateExport");

        let driver_name = self.driver_name(timeout).await?;

        let request = proto::CreateExportRequest {
            name: name.to_string(),
            source_volume_id: volume_handle.to_string(),
            parameters: to_proto_map(parameters),
            secrets: to_proto_map(secrets),
        };
        let mut client = self.client.clone();
        let response = Self::with_timeout(timeout, async move {
            client.create_export(request).await.map(|r| r.into_inner())
        })
        .await?;

        let export = response
            .export
            .ok_or_else(|| DriverError::Other("CreateExport response carried no export".into()))?;

        Ok(CreatedExport {
            driver_name,
            export_id: export.export_id,
            creation_time: from_proto_timestamp(export.creation_time),
            size_bytes: export.size_bytes,
            ready_to_use: export.ready_to_use,
        })
    }

    async fn delete_export(
        &self,
        export_id: &str,
        secrets: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        debug!(export_id, "DeleteExport");

        let request = proto::DeleteExportRequest {
            export_id: export_id.to_string(),
            secrets: to_proto_map(secrets),
        };
        let mut client = self.client.clone();
        Self::with_timeout(timeout, async move {
            client.delete_export(request).await.map(|r| r.into_inner())
        })
        .await?;
        Ok(())
    }

    async fn export_status(
        &self,
        export_id: &str,
        list_secrets: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<ExportStatus, DriverError> {
        debug!(export_id, "GetExportStatus");

        // Drivers without list support cannot be probed; assume the export
        // id is valid and ready.
        if !self.supports_list(timeout).await? {
            return Ok(ExportStatus {
                ready_to_use: true,
                creation_time: None,
                size_bytes: 0,
            });
        }

        let request = proto::ListExportsRequest {
            export_id: export_id.to_string(),
            secrets: to_proto_map(list_secrets),
        };
        let mut client = self.client.clone();
        let response = Self::with_timeout(timeout, async move {
            client.list_exports(request).await.map(|r| r.into_inner())
        })
        .await?;

        let export = response
            .entries
            .into_iter()
            .next()
            .and_then(|entry| entry.export)
            .ok_or_else(|| {
                DriverError::Other(format!("can not find export for exportId {export_id}"))
            })?;

        Ok(ExportStatus {
            ready_to_use: export.ready_to_use,
            creation_time: from_proto_timestamp(export.creation_time),
            size_bytes: export.size_bytes,
        })
    }
}

fn to_proto_map(map: &BTreeMap<String, String>) -> HashMap<String, String> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Protobuf timestamp to UTC; zero and malformed timestamps become `None`.
fn from_proto_timestamp(ts: Option<prost_types::Timestamp>) -> Option<DateTime<Utc>> {
    let ts = ts?;
    if ts.seconds == 0 && ts.nanos == 0 {
        return None;
    }
    Utc.timestamp_opt(ts.seconds, ts.nanos as u32).single()
}
