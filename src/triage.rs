//! Quick triage: cheap batched classification of every bulletin record
//! against the buyer catalog.
//!
//! One LLM call per batch of [`TRIAGE_BATCH_SIZE`] records. Output always
//! matches input length and order: records the model skipped (or a whole
//! failed batch) degrade to deterministic defaults instead of failing the
//! run — a failed batch additionally falls back to catalog keyword
//! matching so obvious product hits are not lost.

use crate::config::Catalog;
use crate::error::PipelineError;
use crate::llm::{parse_llm_json, Message, ModelKind, OpenRouterClient};
use crate::model::{BiddingRecord, Recommendation, Tier, TriageResult};
use serde::Deserialize;
use tracing::{info, warn};

/// Records per classification call.
pub const TRIAGE_BATCH_SIZE: usize = 20;

/// Classification outcome: one result per input record, in input order,
/// plus the non-fatal errors accumulated along the way.
pub struct TriageOutcome {
    pub results: Vec<TriageResult>,
    pub errors: Vec<PipelineError>,
}

#[async_trait::async_trait]
pub trait TriageClassifier: Send + Sync {
    async fn classify(&self, catalog: &Catalog, records: &[BiddingRecord]) -> TriageOutcome;
}

/// LLM-backed classifier.
pub struct LlmTriage {
    client: OpenRouterClient,
}

impl LlmTriage {
    pub fn new(client: OpenRouterClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl TriageClassifier for LlmTriage {
    async fn classify(&self, catalog: &Catalog, records: &[BiddingRecord]) -> TriageOutcome {
        let mut results: Vec<TriageResult> = Vec::with_capacity(records.len());
        let mut errors = Vec::new();

        for batch in records.chunks(TRIAGE_BATCH_SIZE) {
            let messages = vec![
                Message::system(triage_system_prompt(catalog)),
                Message::user(triage_user_prompt(batch)),
            ];

            match self.client.chat(ModelKind::Triage, messages).await {
                Ok(response) => {
                    let (batch_results, missing) = apply_batch_response(&response, batch);
                    if missing > 0 {
                        errors.push(PipelineError::Classification(format!(
                            "resposta de triagem incompleta: {} de {} registros sem classificação",
                            missing,
                            batch.len()
                        )));
                    }
                    results.extend(batch_results);
                }
                Err(e) => {
                    warn!("Triagem em lote falhou, usando fallback por keywords: {:#}", e);
                    errors.push(PipelineError::Classification(format!(
                        "chamada de triagem falhou para lote de {}: {}",
                        batch.len(),
                        e
                    )));
                    results.extend(
                        batch
                            .iter()
                            .map(|r| keyword_triage(catalog, &r.objeto, &r.palavras_chave)),
                    );
                }
            }
        }

        info!(
            "Triagem concluída: {} registros, {} erro(s)",
            results.len(),
            errors.len()
        );

        TriageOutcome { results, errors }
    }
}

// ── Prompt construction ─────────────────────────────────────────────────────

fn triage_system_prompt(catalog: &Catalog) -> String {
    format!(
        "Você é um analista especializado em licitações públicas trabalhando para a \
**{company}**.\n\n\
## Catálogo de produtos da {company}:\n{description}\n\n\
## Sua tarefa:\n\
Para CADA licitação numerada da lista do usuário, classifique a aderência do OBJETO ao \
portfólio da {company}.\n\n\
Responda APENAS com um JSON válido no formato:\n\
{{\"resultados\": [{{\"indice\": 1, \"aderencia\": \"ALTA\" | \"MEDIA\" | \"BAIXA\", \
\"recomendacao\": \"PARTICIPAR\" | \"ACOMPANHAR\" | \"DESCARTAR\", \
\"motivo\": \"justificativa breve\", \"keywords_match\": [\"...\"]}}]}}\n\n\
### Critérios:\n\
- **ALTA**: objeto menciona diretamente produtos do catálogo ou instrumentação de medição\n\
- **MEDIA**: setor adjacente onde a {company} pode participar\n\
- **BAIXA**: sem relação com o portfólio\n\
A recomendação padrão é PARTICIPAR para ALTA, ACOMPANHAR para MEDIA e DESCARTAR para \
BAIXA; desvie apenas quando o motivo justificar.",
        company = catalog.company,
        description = catalog.description,
    )
}

fn triage_user_prompt(batch: &[BiddingRecord]) -> String {
    let mut lines = Vec::with_capacity(batch.len());
    for (i, record) in batch.iter().enumerate() {
        let mut line = format!("{}. OBJETO: {}", i + 1, record.objeto);
        if !record.palavras_chave.is_empty() {
            line.push_str(&format!(" | PALAVRAS-CHAVE: {}", record.palavras_chave));
        }
        if !record.orgao.is_empty() {
            line.push_str(&format!(" | ÓRGÃO: {}", record.orgao));
        }
        lines.push(line);
    }
    lines.join("\n")
}

// ── Response handling ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    resultados: Vec<RawTriage>,
}

#[derive(Debug, Deserialize)]
struct RawTriage {
    indice: usize,
    aderencia: Tier,
    #[serde(default)]
    recomendacao: Option<Recommendation>,
    #[serde(default)]
    motivo: String,
    #[serde(default)]
    keywords_match: Vec<String>,
}

/// Map a batch response onto the batch, in order. Returns the results plus
/// the number of records that had to fall back to the default.
fn apply_batch_response(response: &str, batch: &[BiddingRecord]) -> (Vec<TriageResult>, usize) {
    let parsed: BatchResponse = match parse_llm_json(response) {
        Ok(p) => p,
        Err(e) => {
            warn!("Resposta de triagem malformada: {:#}", e);
            return (vec![TriageResult::unavailable(); batch.len()], batch.len());
        }
    };

    let mut slots: Vec<Option<TriageResult>> = vec![None; batch.len()];
    for raw in parsed.resultados {
        if raw.indice == 0 || raw.indice > batch.len() {
            continue;
        }
        let tier = raw.aderencia;
        slots[raw.indice - 1] = Some(TriageResult {
            aderencia: tier,
            recomendacao: raw.recomendacao.unwrap_or_else(|| tier.default_recommendation()),
            motivo: raw.motivo,
            keywords_match: raw.keywords_match,
        });
    }

    let missing = slots.iter().filter(|s| s.is_none()).count();
    let results = slots
        .into_iter()
        .map(|s| s.unwrap_or_else(TriageResult::unavailable))
        .collect();
    (results, missing)
}

/// Keyword fallback when a whole batch call fails: direct catalog keyword
/// hits are ALTA, adjacent-sector hits MEDIA, everything else BAIXA.
pub fn keyword_triage(catalog: &Catalog, objeto: &str, palavras_chave: &str) -> TriageResult {
    let text = format!("{} {}", objeto, palavras_chave).to_lowercase();

    let matched_alta: Vec<String> = catalog
        .keywords_alta
        .iter()
        .filter(|kw| text.contains(&kw.to_lowercase()))
        .cloned()
        .collect();
    if !matched_alta.is_empty() {
        let tier = Tier::Alta;
        return TriageResult {
            aderencia: tier,
            recomendacao: tier.default_recommendation(),
            motivo: format!(
                "Match direto com o catálogo: {}",
                matched_alta[..matched_alta.len().min(3)].join(", ")
            ),
            keywords_match: matched_alta,
        };
    }

    let matched_media: Vec<String> = catalog
        .keywords_media
        .iter()
        .filter(|kw| text.contains(&kw.to_lowercase()))
        .cloned()
        .collect();
    if !matched_media.is_empty() {
        let tier = Tier::Media;
        return TriageResult {
            aderencia: tier,
            recomendacao: tier.default_recommendation(),
            motivo: format!(
                "Setor adjacente: {}",
                matched_media[..matched_media.len().min(3)].join(", ")
            ),
            keywords_match: matched_media,
        };
    }

    TriageResult {
        aderencia: Tier::Baixa,
        recomendacao: Recommendation::Descartar,
        motivo: "Sem match com produtos ou setores do catálogo".to_string(),
        keywords_match: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(n: usize) -> Vec<BiddingRecord> {
        (0..n)
            .map(|i| BiddingRecord::new(format!("objeto {}", i), i + 2))
            .collect()
    }

    #[test]
    fn complete_response_preserves_order() {
        let records = batch(3);
        let response = r#"{"resultados": [
            {"indice": 3, "aderencia": "BAIXA", "motivo": "c"},
            {"indice": 1, "aderencia": "ALTA", "motivo": "a"},
            {"indice": 2, "aderencia": "MEDIA", "motivo": "b"}
        ]}"#;
        let (results, missing) = apply_batch_response(response, &records);
        assert_eq!(missing, 0);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].aderencia, Tier::Alta);
        assert_eq!(results[1].aderencia, Tier::Media);
        assert_eq!(results[2].aderencia, Tier::Baixa);
    }

    #[test]
    fn missing_records_default_to_baixa_descartar() {
        let records = batch(3);
        let response = r#"{"resultados": [{"indice": 2, "aderencia": "ALTA", "motivo": "x"}]}"#;
        let (results, missing) = apply_batch_response(response, &records);
        assert_eq!(missing, 2);
        assert_eq!(results[0].aderencia, Tier::Baixa);
        assert_eq!(results[0].recomendacao, Recommendation::Descartar);
        assert_eq!(results[0].motivo, "classificação indisponível");
        assert_eq!(results[1].aderencia, Tier::Alta);
        assert_eq!(results[2].aderencia, Tier::Baixa);
    }

    #[test]
    fn malformed_response_defaults_everything() {
        let records = batch(2);
        let (results, missing) = apply_batch_response("no json here", &records);
        assert_eq!(missing, 2);
        assert!(results.iter().all(|r| r.aderencia == Tier::Baixa));
    }

    #[test]
    fn tier_default_recommendation_applies_when_absent() {
        let records = batch(1);
        let response = r#"{"resultados": [{"indice": 1, "aderencia": "MEDIA", "motivo": "m"}]}"#;
        let (results, _) = apply_batch_response(response, &records);
        assert_eq!(results[0].recomendacao, Recommendation::Acompanhar);
    }

    #[test]
    fn out_of_range_index_is_ignored() {
        let records = batch(1);
        let response = r#"{"resultados": [{"indice": 9, "aderencia": "ALTA", "motivo": "x"}]}"#;
        let (results, missing) = apply_batch_response(response, &records);
        assert_eq!(missing, 1);
        assert_eq!(results[0].aderencia, Tier::Baixa);
    }

    #[test]
    fn keyword_fallback_matches_catalog() {
        let catalog = Catalog::default_catalog();
        let alta = keyword_triage(&catalog, "Aquisição de medidor de vazão eletromagnético", "");
        assert_eq!(alta.aderencia, Tier::Alta);
        assert_eq!(alta.recomendacao, Recommendation::Participar);
        assert!(!alta.keywords_match.is_empty());

        let media = keyword_triage(&catalog, "Obras de saneamento básico", "");
        assert_eq!(media.aderencia, Tier::Media);

        let baixa = keyword_triage(&catalog, "Aquisição de merenda escolar", "");
        assert_eq!(baixa.aderencia, Tier::Baixa);
        assert_eq!(baixa.recomendacao, Recommendation::Descartar);
    }
}
