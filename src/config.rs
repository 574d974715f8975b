//! Runtime settings and the buyer catalog.
//!
//! The catalog is loaded from `configs/catalog.json` when present, with a
//! built-in default. It is an immutable value passed explicitly into the
//! triage and analysis prompts, never ambient state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Environment-driven settings for the worker.
#[derive(Debug, Clone)]
pub struct Settings {
    pub openrouter_api_key: String,
    pub triage_model: String,
    pub analysis_model: String,
    /// Optional. When absent, the OCR fallback for image-only documents is
    /// disabled and such documents stay unresolved.
    pub mistral_api_key: Option<String>,
    pub supabase_url: String,
    pub supabase_service_role_key: String,
    pub evolution_api_url: String,
    pub evolution_api_key: String,
    pub evolution_instance: String,
    pub whatsapp_recipient: String,
    pub bind_addr: String,
}

const DEFAULT_TRIAGE_MODEL: &str = "openai/gpt-4o-mini";
const DEFAULT_ANALYSIS_MODEL: &str = "openai/gpt-4o";

impl Settings {
    pub fn from_env() -> Result<Self> {
        let env = |key: &str| {
            std::env::var(key).with_context(|| format!("{} environment variable not set", key))
        };
        let env_or = |key: &str, default: &str| {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };

        Ok(Self {
            openrouter_api_key: env("OPENROUTER_API_KEY")?,
            triage_model: env_or("TRIAGE_MODEL", DEFAULT_TRIAGE_MODEL),
            analysis_model: env_or("ANALYSIS_MODEL", DEFAULT_ANALYSIS_MODEL),
            mistral_api_key: std::env::var("MISTRAL_API_KEY").ok(),
            supabase_url: env("SUPABASE_URL")?,
            supabase_service_role_key: env("SUPABASE_SERVICE_ROLE_KEY")?,
            evolution_api_url: env_or("EVOLUTION_API_URL", "http://localhost:8080"),
            evolution_api_key: env_or("EVOLUTION_API_KEY", ""),
            evolution_instance: env_or("EVOLUTION_INSTANCE", "licitacoes"),
            whatsapp_recipient: env_or("WHATSAPP_RECIPIENT", ""),
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:3000"),
        })
    }
}

/// The buyer's product/service scope, injected into both classification
/// prompts and used for the keyword fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub company: String,
    /// Prose description of the portfolio, written for the LLM prompts.
    pub description: String,
    /// Keywords whose presence in the object text indicates a direct
    /// product match (ALTA).
    #[serde(default)]
    pub keywords_alta: Vec<String>,
    /// Keywords for adjacent sectors where the buyer can still compete
    /// (MEDIA).
    #[serde(default)]
    pub keywords_media: Vec<String>,
}

impl Catalog {
    /// Load from a JSON file, falling back to the built-in default when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("Catalog file {:?} not found, using built-in default", path);
            return Ok(Self::default_catalog());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog: {:?}", path))?;
        let catalog: Catalog = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse catalog: {:?}", path))?;
        info!("Loaded catalog for {} from {:?}", catalog.company, path);
        Ok(catalog)
    }

    /// Built-in catalog: an industrial instrumentation manufacturer, the
    /// buyer profile this worker was originally deployed for.
    pub fn default_catalog() -> Self {
        Self {
            company: "IndFlow".to_string(),
            description: "\
- Medidores de Vazão: turbina (gases/líquidos), ultrassônico clamp-on, calha Parshall, \
eletromagnético, hidrômetros, rotâmetros, totalizadores de volume
- Transmissores de Nível: sondas hidrostáticas, radar, ultrassônico
- Indicadores/Controladores: dosadores (feeder) para painel, indicadores multiparâmetros, \
indicadores à prova de tempo
- Telemetria: dataloggers, aquisição e comunicação de dados
- Sensores: ultrassônicos"
                .to_string(),
            keywords_alta: [
                "medidor de vazão",
                "medidor de vazao",
                "medição de vazão",
                "medicao de vazao",
                "calha parshall",
                "hidrômetro",
                "hidrometro",
                "rotâmetro",
                "rotametro",
                "totalizador de volume",
                "transmissor de nível",
                "transmissor de nivel",
                "sonda hidrostática",
                "sonda hidrostatica",
                "sensor de nível",
                "sensor de nivel",
                "radar de nível",
                "radar de nivel",
                "medição de nível",
                "medicao de nivel",
                "datalogger",
                "telemetria",
                "aquisição de dados",
                "aquisicao de dados",
                "instrumentação industrial",
                "instrumentacao industrial",
                "instrumento de medição",
                "instrumento de medicao",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            keywords_media: [
                "automação industrial",
                "automacao industrial",
                "saneamento",
                "estação de tratamento",
                "estacao de tratamento",
                "monitoramento de água",
                "monitoramento de agua",
                "controle de processos",
                "tratamento de água",
                "tratamento de agua",
                "abastecimento de água",
                "abastecimento de agua",
                "processo industrial",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}
