use std::fmt;
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

pub const EXPORT_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Role {
    Admin,
    #[default]
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::User => "User",
        }
    }

    /// Absent or blank roles fall back to `User`.
    pub fn parse_optional(value: Option<&str>) -> Result<Self, AppError> {
        match value.map(str::trim) {
            None | Some("") => Ok(Role::default()),
            Some(text) => text.parse(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Admin" => Ok(Role::Admin),
            "User" => Ok(Role::User),
            other => Err(AppError::InvalidInput(format!(
                "role must be 'Admin' or 'User', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: Role,
    pub template_base64: String,
    pub created_at: String,
}

impl IdentityRecord {
    pub fn reference(&self) -> IdentityRef {
        IdentityRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }

    pub fn name_matches(&self, name: &str) -> bool {
        self.name.to_lowercase() == name.trim().to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportEnvelope {
    pub version: String,
    pub exported_at: String,
    pub fingerprint: Option<ExportedFingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedFingerprint {
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    pub template_base64: String,
    #[serde(default)]
    pub original_created_at: Option<String>,
}

impl ExportEnvelope {
    pub fn from_record(record: &IdentityRecord) -> Self {
        Self {
            version: EXPORT_VERSION.to_string(),
            exported_at: timestamp_now(),
            fingerprint: Some(ExportedFingerprint {
                name: record.name.clone(),
                role: Some(record.role.to_string()),
                template_base64: record.template_base64.clone(),
                original_created_at: Some(record.created_at.clone()),
            }),
        }
    }
}

pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
