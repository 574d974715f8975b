//! Persistence of triaged records and run logs to Supabase.
//!
//! Records are deduplicated by upsert on `numero_conlicitacao`: reprocessing
//! a bulletin replaces the stored row with the fresh triage and analysis
//! instead of skipping it. Records without an external identifier cannot be
//! deduplicated and are inserted as-is.

use anyhow::{anyhow, Result};
use reqwest::Client;
use serde_json::json;
use tracing::{debug, info};

use crate::model::{BiddingRecord, RunSummary};

#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist one record, replacing any existing row with the same
    /// external identifier. Returns the identifier used.
    async fn upsert(&self, record: &BiddingRecord) -> Result<String>;

    /// Append one run-log row. Returns the run id.
    async fn insert_run_log(&self, summary: &RunSummary) -> Result<String>;
}

/// Supabase (PostgREST) backed store.
#[derive(Clone)]
pub struct SupabaseStore {
    client: Client,
    base_url: String,
    service_role_key: String,
}

impl SupabaseStore {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        service_role_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            service_role_key: service_role_key.into(),
        }
    }

    fn record_body(record: &BiddingRecord) -> serde_json::Value {
        json!({
            "numero_conlicitacao": record.numero_conlicitacao,
            "numero_boletim": record.numero_boletim,
            "objeto": record.objeto,
            "orgao": record.orgao,
            "cidade": record.cidade,
            "uf": record.uf,
            "data_abertura": record.data_abertura,
            "valor": record.valor,
            "modalidade": record.modalidade,
            "status": record.status,
            "palavras_chave": record.palavras_chave,
            "edital": record.edital,
            "aderencia": record.tier(),
            "recomendacao": record.recommendation(),
            "triagem": record.triage,
            "analise": record.analysis,
            "edital_disponivel": record.edital_disponivel,
        })
    }

    async fn post_row(
        &self,
        path: &str,
        prefer: &str,
        body: &serde_json::Value,
    ) -> Result<()> {
        let url = format!("{}/rest/v1/{}", self.base_url, path);

        let resp = self
            .client
            .post(&url)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Content-Type", "application/json")
            .header("Prefer", prefer)
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Supabase POST {} failed: {} - {}", path, status, text));
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl RecordStore for SupabaseStore {
    async fn upsert(&self, record: &BiddingRecord) -> Result<String> {
        let body = Self::record_body(record);

        if record.numero_conlicitacao.trim().is_empty() {
            // No identifier to deduplicate on, plain insert
            self.post_row("licitacoes", "return=minimal", &body).await?;
            debug!("Inserted record without external id (row {})", record.row_index);
            return Ok(String::new());
        }

        self.post_row(
            "licitacoes?on_conflict=numero_conlicitacao",
            "resolution=merge-duplicates,return=minimal",
            &body,
        )
        .await?;

        debug!("Upserted record {}", record.numero_conlicitacao);
        Ok(record.numero_conlicitacao.clone())
    }

    async fn insert_run_log(&self, summary: &RunSummary) -> Result<String> {
        let body = serde_json::to_value(summary)?;
        self.post_row("execucoes", "return=minimal", &body).await?;
        info!("Run log {} persisted", summary.run_id);
        Ok(summary.run_id.clone())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory store keyed the same way the real table is.
    #[derive(Default)]
    pub struct MemoryStore {
        pub records: Mutex<HashMap<String, BiddingRecord>>,
        pub anonymous: Mutex<Vec<BiddingRecord>>,
        pub run_logs: Mutex<Vec<RunSummary>>,
        pub fail_ids: Vec<String>,
    }

    #[async_trait::async_trait]
    impl RecordStore for MemoryStore {
        async fn upsert(&self, record: &BiddingRecord) -> Result<String> {
            if self.fail_ids.contains(&record.numero_conlicitacao) {
                anyhow::bail!("conexão recusada");
            }
            if record.numero_conlicitacao.trim().is_empty() {
                self.anonymous.lock().unwrap().push(record.clone());
                return Ok(String::new());
            }
            self.records
                .lock()
                .unwrap()
                .insert(record.numero_conlicitacao.clone(), record.clone());
            Ok(record.numero_conlicitacao.clone())
        }

        async fn insert_run_log(&self, summary: &RunSummary) -> Result<String> {
            self.run_logs.lock().unwrap().push(summary.clone());
            Ok(summary.run_id.clone())
        }
    }
}
