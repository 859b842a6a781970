// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    pub os_type: String,
    pub os_version: String,
    pub architecture: String,
}

impl OsInfo {
    pub fn current() -> Self {
        let info = os_info::get();
        Self {
            os_type: info.os_type().to_string(),
            os_version: info.version().to_string(),
            architecture: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Identity of the application, written at the top of every report.
/// Serialized once when the reporter is built, so the fault path only copies bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub app_identifier: String,
    pub app_version: String,
    pub reporter_version: String,
    pub process_name: String,
    pub process_id: u32,
    pub incident_id: Uuid,
    pub os: OsInfo,
}

impl AppMetadata {
    pub fn new(app_identifier: impl Into<String>, app_version: impl Into<String>) -> Self {
        let process_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();
        Self {
            app_identifier: app_identifier.into(),
            app_version: app_version.into(),
            reporter_version: env!("CARGO_PKG_VERSION").to_string(),
            process_name,
            process_id: std::process::id(),
            incident_id: Uuid::new_v4(),
            os: OsInfo::current(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_fills_process_fields() -> anyhow::Result<()> {
        let metadata = AppMetadata::new("com.example.app", "1.2.3");
        assert_eq!(metadata.process_id, std::process::id());
        assert_eq!(metadata.os.architecture, std::env::consts::ARCH);
        assert!(!metadata.process_name.is_empty());

        let other = AppMetadata::new("com.example.app", "1.2.3");
        assert_ne!(metadata.incident_id, other.incident_id);

        let json = serde_json::to_string(&metadata)?;
        let back: AppMetadata = serde_json::from_str(&json)?;
        assert_eq!(back, metadata);
        Ok(())
    }
}
