//! Error taxonomy for the triage pipeline.
//!
//! Only [`PipelineError::MalformedExport`] aborts a run. Every other variant
//! is degraded in place: the orchestrator stringifies it into
//! `RunSummary.errors` and keeps going.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The export has no parseable rows or is missing the mandatory
    /// object-description column. Fatal, raised before any AI cost.
    #[error("export malformado: {0}")]
    MalformedExport(String),

    /// A single document in the bundle could not be resolved to text.
    #[error("falha ao resolver documento {id}: {source}")]
    DocumentResolution {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// A triage batch call failed or came back unusable.
    #[error("falha na triagem: {0}")]
    Classification(String),

    /// Deep analysis failed for one record; it keeps its quick-triage result.
    #[error("falha na análise profunda de {id}: {source}")]
    DeepAnalysis {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Upsert failed for one record; other records and the run log proceed.
    #[error("falha ao persistir {id}: {source}")]
    Persistence {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// The digest could not be sent. Flagged on the summary, never fatal.
    #[error("falha no envio da notificação: {0}")]
    Notification(String),
}

impl PipelineError {
    /// Whether this error aborts the run instead of being collected.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::MalformedExport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_malformed_export_is_fatal() {
        assert!(PipelineError::MalformedExport("sem linhas".into()).is_fatal());
        assert!(!PipelineError::Classification("timeout".into()).is_fatal());
        assert!(!PipelineError::Notification("offline".into()).is_fatal());
    }
}
