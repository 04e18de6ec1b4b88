//! The fixed roster of analysis engines and their routing facts.
//!
//! Class and specialization belong to the engine identity and cannot be
//! configured away; only endpoint, timeout and credentials vary per
//! deployment. That keeps event priority a pure function of the event.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_ENGINE_TOKEN;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EngineId {
    Huraii,
    Cloe,
    Horace,
    Thorius,
    Archer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineClass {
    Gpu,
    Cpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Specialization {
    GenerativeAnalysis,
    MarketAnalysis,
    ContentOptimization,
    UserGuidance,
    Orchestration,
}

impl EngineId {
    pub const ALL: [EngineId; 5] = [
        EngineId::Huraii,
        EngineId::Cloe,
        EngineId::Horace,
        EngineId::Thorius,
        EngineId::Archer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EngineId::Huraii => "HURAII",
            EngineId::Cloe => "CLOE",
            EngineId::Horace => "HORACE",
            EngineId::Thorius => "THORIUS",
            EngineId::Archer => "ARCHER",
        }
    }

    pub fn class(self) -> EngineClass {
        match self {
            EngineId::Huraii => EngineClass::Gpu,
            _ => EngineClass::Cpu,
        }
    }

    pub fn specialization(self) -> Specialization {
        match self {
            EngineId::Huraii => Specialization::GenerativeAnalysis,
            EngineId::Cloe => Specialization::MarketAnalysis,
            EngineId::Horace => Specialization::ContentOptimization,
            EngineId::Thorius => Specialization::UserGuidance,
            EngineId::Archer => Specialization::Orchestration,
        }
    }

    fn default_endpoint(self) -> &'static str {
        match self {
            EngineId::Huraii => "https://huraii-gpu.runpod.io",
            EngineId::Cloe => "https://cloe-cpu.runpod.io",
            EngineId::Horace => "https://horace-cpu.runpod.io",
            EngineId::Thorius => "https://thorius-cpu.runpod.io",
            EngineId::Archer => "https://archer-orchestrator.runpod.io",
        }
    }

    fn default_timeout(self) -> Duration {
        match self {
            EngineId::Huraii => Duration::from_secs(30),
            EngineId::Archer => Duration::from_secs(20),
            _ => Duration::from_secs(15),
        }
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EngineId::ALL
            .into_iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SyncError::Validation(format!("unknown engine '{s}'")))
    }
}

impl EngineClass {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineClass::Gpu => "gpu",
            EngineClass::Cpu => "cpu",
        }
    }
}

impl Specialization {
    /// Path segment appended to the engine endpoint for analysis calls.
    pub fn path(self) -> &'static str {
        match self {
            Specialization::GenerativeAnalysis => "analyze",
            Specialization::MarketAnalysis => "market-analysis",
            Specialization::ContentOptimization => "content-analysis",
            Specialization::UserGuidance => "guidance",
            Specialization::Orchestration => "orchestrate",
        }
    }
}

/// A resolved engine: identity plus deployment-specific endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSpec {
    pub id: EngineId,
    /// Base URL without a trailing slash.
    pub endpoint: String,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    #[serde(skip_serializing)]
    pub token: String,
}

impl EngineSpec {
    pub fn new(id: EngineId, endpoint: &str, timeout: Duration, token: &str) -> Self {
        Self {
            id,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout,
            token: token.to_string(),
        }
    }

    /// The built-in table for one engine.
    pub fn default_for(id: EngineId) -> Self {
        Self::new(
            id,
            id.default_endpoint(),
            id.default_timeout(),
            DEFAULT_ENGINE_TOKEN,
        )
    }

    /// The built-in table for every engine, in roster order.
    pub fn defaults() -> Vec<Self> {
        EngineId::ALL.into_iter().map(Self::default_for).collect()
    }

    pub fn class(&self) -> EngineClass {
        self.id.class()
    }

    pub fn specialization(&self) -> Specialization {
        self.id.specialization()
    }

    /// `{endpoint}/{specialization-path}`
    pub fn analysis_url(&self) -> String {
        format!("{}/{}", self.endpoint, self.specialization().path())
    }

    /// `{endpoint}/health`
    pub fn health_url(&self) -> String {
        format!("{}/health", self.endpoint)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_huraii_is_gpu() {
        let gpu: Vec<_> = EngineId::ALL
            .into_iter()
            .filter(|e| e.class() == EngineClass::Gpu)
            .collect();
        assert_eq!(gpu, vec![EngineId::Huraii]);
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("cloe".parse::<EngineId>().unwrap(), EngineId::Cloe);
        assert_eq!(" ARCHER ".parse::<EngineId>().unwrap(), EngineId::Archer);
        assert!("NOPE".parse::<EngineId>().is_err());
    }

    #[test]
    fn test_urls() {
        let spec = EngineSpec::new(
            EngineId::Cloe,
            "http://127.0.0.1:9000/",
            Duration::from_secs(1),
            "t",
        );
        assert_eq!(spec.analysis_url(), "http://127.0.0.1:9000/market-analysis");
        assert_eq!(spec.health_url(), "http://127.0.0.1:9000/health");
    }

    #[test]
    fn test_default_table() {
        let table = EngineSpec::defaults();
        assert_eq!(table.len(), 5);
        assert_eq!(table[0].id, EngineId::Huraii);
        assert_eq!(table[0].timeout, Duration::from_secs(30));
        assert_eq!(
            table[4].analysis_url(),
            "https://archer-orchestrator.runpod.io/orchestrate"
        );
        assert!(table.iter().all(|s| s.token == DEFAULT_ENGINE_TOKEN));
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&EngineId::Thorius).unwrap();
        assert_eq!(json, "\"THORIUS\"");
        let spec_json = serde_json::to_value(EngineSpec::default_for(EngineId::Horace)).unwrap();
        assert!(spec_json.get("token").is_none());
        assert_eq!(spec_json["timeout"], 15.0);
    }
}
