//! Scripted driver double for sidecar tests.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::exporter::{CreatedExport, DriverError, ExportDriver, ExportStatus};

/// Recorded CreateExport call.
#[derive(Clone, Debug)]
pub struct CreateCall {
    pub name: String,
    pub volume_handle: String,
    pub parameters: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
}

/// Driver double that records calls and replays scripted responses.
///
/// With no scripted response a call succeeds with defaults: export id
/// `"exp-" + name`, ready, 1 GiB.
#[derive(Default)]
pub struct FakeDriver {
    create_responses: Mutex<VecDeque<Result<CreatedExport, DriverError>>>,
    delete_responses: Mutex<VecDeque<Result<(), DriverError>>>,
    status_responses: Mutex<VecDeque<Result<ExportStatus, DriverError>>>,
    create_calls: Mutex<Vec<CreateCall>>,
    delete_calls: Mutex<Vec<String>>,
    status_calls: Mutex<Vec<String>>,
}

impl FakeDriver {
    pub fn script_create(&self, response: Result<CreatedExport, DriverError>) {
        self.create_responses.lock().push_back(response);
    }

    pub fn script_delete(&self, response: Result<(), DriverError>) {
        self.delete_responses.lock().push_back(response);
    }

    pub fn script_status(&self, response: Result<ExportStatus, DriverError>) {
        self.status_responses.lock().push_back(response);
    }

    pub fn create_calls(&self) -> Vec<CreateCall> {
        self.create_calls.lock().clone()
    }

    pub fn delete_calls(&self) -> Vec<String> {
        self.delete_calls.lock().clone()
    }

    pub fn status_calls(&self) -> Vec<String> {
        self.status_calls.lock().clone()
    }
}

#[async_trait]
impl ExportDriver for FakeDriver {
    async fn create_export(
        &self,
        name: &str,
        volume_handle: &str,
        parameters: &BTreeMap<String, String>,
        secrets: &BTreeMap<String, String>,
        _timeout: Duration,
    ) -> Result<CreatedExport, DriverError> {
        self.create_calls.lock().push(CreateCall {
            name: name.to_string(),
            volume_handle: volume_handle.to_string(),
            parameters: parameters.clone(),
            secrets: secrets.clone(),
        });
        if let Some(scripted) = self.create_responses.lock().pop_front() {
            return scripted;
        }
        Ok(CreatedExport {
            driver_name: "nfs.example.com".into(),
            export_id: format!("exp-{name}"),
            creation_time: Some(chrono::Utc::now()),
            size_bytes: 1 << 30,
            ready_to_use: true,
        })
    }

    async fn delete_export(
        &self,
        export_id: &str,
        _secrets: &BTreeMap<String, String>,
        _timeout: Duration,
    ) -> Result<(), DriverError> {
        self.delete_calls.lock().push(export_id.to_string());
        if let Some(scripted) = self.delete_responses.lock().pop_front() {
            return scripted;
        }
        Ok(())
    }

    async fn export_status(
        &self,
        export_id: &str,
        _list_secrets: &BTreeMap<String, String>,
        _timeout: Duration,
    ) -> Result<ExportStatus, DriverError> {
        self.status_calls.lock().push(export_id.to_string());
        if let Some(scripted) = self.status_responses.lock().pop_front() {
            return scripted;
        }
        Ok(ExportStatus {
            ready_to_use: true,
            creation_time: None,
            size_bytes: 0,
        })
    }
}
