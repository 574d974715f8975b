//! Deep analysis of high-tier records against their resolved edital text.
//!
//! One LLM call per qualifying record (documents vary too much in length to
//! batch), run with bounded fan-out and a join barrier: persistence never
//! sees a partially analyzed collection. A failed analysis degrades the
//! record to its quick-triage result and is final for the run.

use crate::bundle::DocumentBundle;
use crate::config::Catalog;
use crate::error::PipelineError;
use crate::llm::{parse_llm_json, truncate_for_context, Message, ModelKind, OpenRouterClient};
use crate::model::{BiddingRecord, DeepAnalysis, Tier};
use futures::stream::{self, StreamExt};
use tracing::{info, warn};

/// Concurrent deep-analysis calls per run.
pub const ANALYSIS_CONCURRENCY: usize = 4;

#[async_trait::async_trait]
pub trait DocumentAnalyst: Send + Sync {
    async fn analyze(
        &self,
        catalog: &Catalog,
        record: &BiddingRecord,
        document_text: &str,
    ) -> anyhow::Result<DeepAnalysis>;
}

/// Outcome of the analysis stage.
pub struct AnalysisOutcome {
    pub analyzed: usize,
    pub errors: Vec<PipelineError>,
}

/// Run deep analysis over every record with tier ALTA and a resolved
/// document, merging results back before returning.
pub async fn analyze_all(
    analyst: &dyn DocumentAnalyst,
    catalog: &Catalog,
    records: &mut [BiddingRecord],
    documents: &DocumentBundle,
) -> AnalysisOutcome {
    // Qualifying subset: ALTA tier with non-empty resolved text
    let mut jobs: Vec<(usize, String)> = Vec::new();
    for (idx, record) in records.iter_mut().enumerate() {
        if record.tier() != Some(Tier::Alta) {
            continue;
        }
        match documents.text_for(&record.numero_conlicitacao) {
            Some(text) if !text.trim().is_empty() => {
                record.edital_disponivel = Some(true);
                jobs.push((idx, text.to_string()));
            }
            _ => {
                record.edital_disponivel = Some(false);
            }
        }
    }

    if jobs.is_empty() {
        info!("Nenhum edital qualificado para análise profunda");
        return AnalysisOutcome {
            analyzed: 0,
            errors: Vec::new(),
        };
    }

    info!(
        "Analisando {} edital(is) com fan-out de {}",
        jobs.len(),
        ANALYSIS_CONCURRENCY
    );

    let outcomes: Vec<(usize, anyhow::Result<DeepAnalysis>)> =
        stream::iter(jobs.into_iter().map(|(idx, text)| {
            let record = records[idx].clone();
            async move {
                let result = analyst.analyze(catalog, &record, &text).await;
                (idx, result)
            }
        }))
        .buffer_unordered(ANALYSIS_CONCURRENCY)
        .collect()
        .await;

    // Join barrier passed: merge everything back into the owned collection
    let mut analyzed = 0;
    let mut errors = Vec::new();
    for (idx, result) in outcomes {
        let record = &mut records[idx];
        match result {
            Ok(analysis) => {
                // The analyzer may refine the tier of the record it inspected
                if let (Some(new_tier), Some(triage)) = (analysis.aderencia, record.triage.as_mut())
                {
                    triage.aderencia = new_tier;
                }
                record.analysis = Some(analysis);
                analyzed += 1;
            }
            Err(e) => {
                warn!(
                    "Análise profunda falhou para {}: {:#}",
                    record.numero_conlicitacao, e
                );
                errors.push(PipelineError::DeepAnalysis {
                    id: record.numero_conlicitacao.clone(),
                    source: e,
                });
            }
        }
    }

    info!(
        "Análise profunda concluída: {} analisado(s), {} falha(s)",
        analyzed,
        errors.len()
    );

    AnalysisOutcome { analyzed, errors }
}

// ── LLM-backed analyst ──────────────────────────────────────────────────────

pub struct LlmAnalyst {
    client: OpenRouterClient,
}

impl LlmAnalyst {
    pub fn new(client: OpenRouterClient) -> Self {
        Self { client }
    }
}

fn analysis_system_prompt(catalog: &Catalog) -> String {
    format!(
        "Você é um analista de licitações experiente trabalhando para a **{company}**, \
cujo portfólio é:\n{description}\n\n\
Analise o edital enviado e gere um relatório completo.\n\n\
Responda APENAS com um JSON válido:\n\
{{\n\
  \"resumo_executivo\": \"resumo do edital em até 200 palavras\",\n\
  \"objeto_detalhado\": \"descrição detalhada do que está sendo contratado\",\n\
  \"itens_relevantes\": [\"itens/lotes que a {company} pode atender\"],\n\
  \"exigencias_tecnicas\": [\"certificações, normas, especificações\"],\n\
  \"documentacao_necessaria\": [\"documentos exigidos para participação\"],\n\
  \"prazos\": {{\"abertura\": \"...\", \"proposta\": \"...\", \"execucao\": \"...\"}},\n\
  \"valor_estimado\": \"valor estimado se disponível\",\n\
  \"garantias\": \"garantias exigidas se houver\",\n\
  \"aderencia\": \"ALTA\" | \"MEDIA\" | \"BAIXA\",\n\
  \"recomendacao\": \"PARTICIPAR\" | \"ACOMPANHAR\" | \"DESCARTAR\",\n\
  \"alertas\": [\"pontos de atenção\"]\n\
}}",
        company = catalog.company,
        description = catalog.description,
    )
}

#[async_trait::async_trait]
impl DocumentAnalyst for LlmAnalyst {
    async fn analyze(
        &self,
        catalog: &Catalog,
        record: &BiddingRecord,
        document_text: &str,
    ) -> anyhow::Result<DeepAnalysis> {
        let user_prompt = format!(
            "OBJETO: {}\nÓRGÃO: {}\nCIDADE/UF: {}\n\nTEXTO DO EDITAL:\n{}",
            record.objeto,
            record.orgao,
            record.cidade_uf(),
            truncate_for_context(document_text, 150_000),
        );

        let messages = vec![
            Message::system(analysis_system_prompt(catalog)),
            Message::user(user_prompt),
        ];

        let response = self.client.chat(ModelKind::Analysis, messages).await?;
        let analysis: DeepAnalysis = parse_llm_json(&response)?;
        Ok(analysis)
    }
}
