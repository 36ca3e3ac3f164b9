//! Source of candidate changes

use async_trait::async_trait;
use kgate_safety::ResourceChange;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum RecommenderError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed recommendations: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("recommender unavailable: {0}")]
    Unavailable(String),
}

/// Produces proposed resource changes. The gate never trusts them: every
/// batch still goes through assessment and confirmation.
#[async_trait]
pub trait Recommender: Send + Sync {
    async fn recommend(&self) -> Result<Vec<ResourceChange>, RecommenderError>;
}

/// Fixed list of changes, usually loaded from a JSON file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticRecommender {
    changes: Vec<ResourceChange>,
}

impl StaticRecommender {
    #[must_use]
    pub fn new(changes: Vec<ResourceChange>) -> Self {
        Self { changes }
    }

    /// Parse a JSON array of changes
    ///
    /// # Errors
    /// Returns `RecommenderError::Parse` for malformed JSON or quantities.
    pub fn from_json_str(json: &str) -> Result<Self, RecommenderError> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    /// # Errors
    /// Returns `RecommenderError` if the file cannot be read or parsed.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, RecommenderError> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| RecommenderError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let recommender = Self::from_json_str(&json)?;
        tracing::debug!(path = %path.display(), changes = recommender.changes.len(), "recommendations loaded");
        Ok(recommender)
    }

    #[must_use]
    pub fn changes(&self) -> &[ResourceChange] {
        &self.changes
    }
}

#[async_trait]
impl Recommender for StaticRecommender {
    async fn recommend(&self) -> Result<Vec<ResourceChange>, RecommenderError> {
        Ok(self.changes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgate_safety::{CpuQuantity, MemoryQuantity};
    use pretty_assertions::assert_eq;

    const BATCH: &str = r#"[
        {
            "target": {"cluster": "prod-east", "namespace": "checkout", "kind": "Deployment", "name": "web"},
            "current": {"cpu_request": "100m", "memory_request": "128Mi"},
            "proposed": {"cpu_request": "250m", "memory_request": "256Mi"}
        }
    ]"#;

    #[tokio::test]
    async fn parses_quantity_strings() {
        let recommender = StaticRecommender::from_json_str(BATCH).unwrap();
        let changes = recommender.recommend().await.unwrap();
        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.target().name, "web");
        assert_eq!(
            change.proposed().cpu_request,
            Some(CpuQuantity::from_millicores(250))
        );
        assert_eq!(
            change.current().memory_request,
            Some(MemoryQuantity::from_mebibytes(128))
        );
    }

    #[test]
    fn bad_quantity_is_a_parse_error() {
        let json = BATCH.replace("250m", "lots");
        let err = StaticRecommender::from_json_str(&json).unwrap_err();
        assert!(matches!(err, RecommenderError::Parse(_)));
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let err = StaticRecommender::load("/nonexistent/kgate/changes.json")
            .await
            .unwrap_err();
        assert!(matches!(err, RecommenderError::Io { .. }));
    }
}
