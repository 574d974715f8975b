//! Domain types for bulletin records, triage results, and run summaries.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Relevance tier assigned by quick triage (refined by deep analysis for
/// high-tier records).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "ALTA")]
    Alta,
    #[serde(rename = "MEDIA")]
    Media,
    #[serde(rename = "BAIXA")]
    Baixa,
}

impl Tier {
    /// Default recommendation for each tier. The classifier may override the
    /// recommendation within a tier, never the tier itself.
    pub fn default_recommendation(self) -> Recommendation {
        match self {
            Tier::Alta => Recommendation::Participar,
            Tier::Media => Recommendation::Acompanhar,
            Tier::Baixa => Recommendation::Descartar,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recommendation {
    #[serde(rename = "PARTICIPAR")]
    Participar,
    #[serde(rename = "ACOMPANHAR")]
    Acompanhar,
    #[serde(rename = "DESCARTAR")]
    Descartar,
}

/// Result of the quick triage pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageResult {
    pub aderencia: Tier,
    pub recomendacao: Recommendation,
    pub motivo: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords_match: Vec<String>,
}

impl TriageResult {
    /// Deterministic default used when the classification response is
    /// malformed or incomplete for a record.
    pub fn unavailable() -> Self {
        Self {
            aderencia: Tier::Baixa,
            recomendacao: Recommendation::Descartar,
            motivo: "classificação indisponível".to_string(),
            keywords_match: Vec::new(),
        }
    }
}

/// Structured deadlines extracted from an edital.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Prazos {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abertura: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execucao: Option<String>,
}

/// Document-grounded analysis produced for high-tier records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepAnalysis {
    pub resumo_executivo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objeto_detalhado: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub itens_relevantes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exigencias_tecnicas: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documentacao_necessaria: Vec<String>,
    #[serde(default)]
    pub prazos: Prazos,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valor_estimado: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub garantias: Option<String>,
    /// The analyzer may refine the tier of the record it inspected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aderencia: Option<Tier>,
    /// Optional recommendation override for the quick-triage result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recomendacao: Option<Recommendation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alertas: Vec<String>,
}

/// One row of the bulletin export, enriched in place as the run progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiddingRecord {
    /// External identifier on the bidding portal. Empty string disables
    /// dedup for this record (it is always inserted as new).
    #[serde(default)]
    pub numero_conlicitacao: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numero_boletim: Option<i64>,
    /// Object description. Always non-empty for extracted records.
    pub objeto: String,
    #[serde(default)]
    pub orgao: String,
    #[serde(default)]
    pub cidade: String,
    #[serde(default)]
    pub uf: String,
    #[serde(default)]
    pub data_abertura: String,
    #[serde(default)]
    pub valor: String,
    #[serde(default)]
    pub modalidade: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub palavras_chave: String,
    #[serde(default)]
    pub edital: String,
    /// 1-based row position in the export, for diagnostics.
    pub row_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triage: Option<TriageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<DeepAnalysis>,
    /// Some(true/false) once document resolution was attempted for this
    /// record; None when it never qualified for resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edital_disponivel: Option<bool>,
}

impl BiddingRecord {
    /// A record with only the mandatory object description set. The
    /// extractor fills the optional columns it finds.
    pub fn new(objeto: impl Into<String>, row_index: usize) -> Self {
        Self {
            numero_conlicitacao: String::new(),
            numero_boletim: None,
            objeto: objeto.into(),
            orgao: String::new(),
            cidade: String::new(),
            uf: String::new(),
            data_abertura: String::new(),
            valor: String::new(),
            modalidade: String::new(),
            status: String::new(),
            palavras_chave: String::new(),
            edital: String::new(),
            row_index,
            triage: None,
            analysis: None,
            edital_disponivel: None,
        }
    }

    pub fn tier(&self) -> Option<Tier> {
        self.triage.as_ref().map(|t| t.aderencia)
    }

    /// Final recommendation: deep-analysis override when present, otherwise
    /// the quick-triage recommendation.
    pub fn recommendation(&self) -> Option<Recommendation> {
        self.analysis
            .as_ref()
            .and_then(|a| a.recomendacao)
            .or_else(|| self.triage.as_ref().map(|t| t.recomendacao))
    }

    /// Cidade/UF rendering used by persistence and the digest.
    pub fn cidade_uf(&self) -> String {
        if self.uf.is_empty() {
            self.cidade.clone()
        } else if self.cidade.is_empty() {
            self.uf.clone()
        } else {
            format!("{}/{}", self.cidade, self.uf)
        }
    }
}

/// Pipeline stage, advanced by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStage {
    Extracting,
    Triaging,
    ResolvingDocuments,
    Analyzing,
    Persisting,
    Notifying,
    Done,
    Failed,
}

/// Per-tier counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TriageCounts {
    pub alta: usize,
    pub media: usize,
    pub baixa: usize,
}

impl TriageCounts {
    pub fn bump(&mut self, tier: Tier) {
        match tier {
            Tier::Alta => self.alta += 1,
            Tier::Media => self.media += 1,
            Tier::Baixa => self.baixa += 1,
        }
    }
}

/// Accumulated outcome of one pipeline run. Persisted exactly once at the
/// end, regardless of per-record failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub success: bool,
    pub stage: RunStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numero_boletim: Option<i64>,
    pub total_licitacoes: usize,
    pub triagem: TriageCounts,
    pub editais_resolvidos: usize,
    pub editais_analisados: usize,
    pub salvas_no_banco: usize,
    pub whatsapp_enviado: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub duracao_segundos: f64,
    pub iniciado_em: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_hash: Option<String>,
}

impl RunSummary {
    pub fn new(numero_boletim: Option<i64>) -> Self {
        Self {
            run_id: format!("run_{}", Uuid::new_v4().simple()),
            success: false,
            stage: RunStage::Extracting,
            numero_boletim,
            total_licitacoes: 0,
            triagem: TriageCounts::default(),
            editais_resolvidos: 0,
            editais_analisados: 0,
            salvas_no_banco: 0,
            whatsapp_enviado: false,
            errors: Vec::new(),
            duracao_segundos: 0.0,
            iniciado_em: Utc::now().to_rfc3339(),
            export_hash: None,
        }
    }

    pub fn record_error(&mut self, err: &crate::error::PipelineError) {
        self.errors.push(err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Tier::Alta).unwrap(), "\"ALTA\"");
        assert_eq!(
            serde_json::to_string(&Recommendation::Participar).unwrap(),
            "\"PARTICIPAR\""
        );
    }

    #[test]
    fn default_recommendation_mapping() {
        assert_eq!(Tier::Alta.default_recommendation(), Recommendation::Participar);
        assert_eq!(Tier::Media.default_recommendation(), Recommendation::Acompanhar);
        assert_eq!(Tier::Baixa.default_recommendation(), Recommendation::Descartar);
    }

    #[test]
    fn analysis_override_takes_precedence() {
        let mut record = BiddingRecord::new("medidor de vazão", 1);
        record.numero_conlicitacao = "123".into();
        record.triage = Some(TriageResult {
            aderencia: Tier::Alta,
            recomendacao: Recommendation::Participar,
            motivo: "match direto".into(),
            keywords_match: vec![],
        });
        assert_eq!(record.recommendation(), Some(Recommendation::Participar));

        record.analysis = Some(DeepAnalysis {
            resumo_executivo: "prazo inviável".into(),
            objeto_detalhado: None,
            itens_relevantes: vec![],
            exigencias_tecnicas: vec![],
            documentacao_necessaria: vec![],
            prazos: Prazos::default(),
            valor_estimado: None,
            garantias: None,
            aderencia: None,
            recomendacao: Some(Recommendation::Acompanhar),
            alertas: vec![],
        });
        assert_eq!(record.recommendation(), Some(Recommendation::Acompanhar));
    }

    #[test]
    fn cidade_uf_rendering() {
        let mut r = BiddingRecord::new("x", 1);
        r.cidade = "Campinas".into();
        r.uf = "SP".into();
        assert_eq!(r.cidade_uf(), "Campinas/SP");
        r.uf.clear();
        assert_eq!(r.cidade_uf(), "Campinas");
    }
}
