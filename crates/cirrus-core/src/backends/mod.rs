//! Backend adapters implementing [`DocumentService`](crate::DocumentService).

pub mod dynamodb;
pub mod embedded;
pub mod firestore;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Embedded,
    DynamoDb,
    Firestore,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Embedded => "embedded",
            BackendKind::DynamoDb => "dynamodb",
            BackendKind::Firestore => "firestore",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "embedded" | "bolt" | "local" => Ok(BackendKind::Embedded),
            "dynamodb" | "dynamo" | "aws" => Ok(BackendKind::DynamoDb),
            "firestore" | "gcp" => Ok(BackendKind::Firestore),
            _ => Err(ConfigError::Invalid {
                field: "backend",
                value: s.to_string(),
            }),
        }
    }
}
