//! Small configuration enums shared between settings and the server.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where a processed result is delivered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanOutMode {
    /// Every live session receives a copy.
    #[default]
    Broadcast,
    /// Only the session the envelope arrived on receives it.
    Targeted,
}

impl fmt::Display for FanOutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Broadcast => "broadcast",
            Self::Targeted => "targeted",
        })
    }
}

impl FromStr for FanOutMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "broadcast" => Ok(Self::Broadcast),
            "targeted" => Ok(Self::Targeted),
            other => Err(format!("unknown fan-out mode: {other}")),
        }
    }
}

/// Built-in processing transforms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    /// Pass every envelope through unchanged.
    #[default]
    Echo,
    /// Log and consume every envelope without producing output.
    Discard,
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Echo => "echo",
            Self::Discard => "discard",
        })
    }
}

impl FromStr for TransformKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "echo" => Ok(Self::Echo),
            "discard" => Ok(Self::Discard),
            other => Err(format!("unknown transform: {other}")),
        }
    }
}
