//! WhatsApp digest of a finished run, delivered through the Evolution API.
//!
//! The digest is best effort: a delivery failure is recorded in the run
//! summary but never fails the run. Messages longer than the transport
//! limit are split on line boundaries and numbered.

use anyhow::{anyhow, Result};
use reqwest::Client;
use serde_json::json;
use tracing::{info, warn};

use crate::model::{BiddingRecord, Recommendation, RunSummary, Tier};

/// Evolution API caps message text well above this, but long digests render
/// poorly; split conservatively.
pub const MAX_MESSAGE_CHARS: usize = 4000;

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, text: &str) -> Result<()>;
}

pub struct WhatsAppNotifier {
    client: Client,
    base_url: String,
    api_key: String,
    instance: String,
}

impl WhatsAppNotifier {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            instance: instance.into(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for WhatsAppNotifier {
    async fn send(&self, recipient: &str, text: &str) -> Result<()> {
        let url = format!("{}/message/sendText/{}", self.base_url, self.instance);

        let body = json!({
            "number": recipient,
            "text": text,
        });

        let resp = self
            .client
            .post(&url)
            .header("apikey", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Evolution API error ({}): {}", status, text));
        }

        Ok(())
    }
}

/// Send the digest, splitting into numbered parts when needed. Returns the
/// number of messages delivered.
pub async fn send_digest(
    notifier: &dyn Notifier,
    recipient: &str,
    digest: &str,
) -> Result<usize> {
    let parts = split_message(digest, MAX_MESSAGE_CHARS);
    let total = parts.len();

    for (i, part) in parts.iter().enumerate() {
        let text = if total > 1 && i > 0 {
            format!("📄 *Continuação ({}/{})*\n\n{}", i + 1, total, part)
        } else {
            part.clone()
        };
        notifier.send(recipient, &text).await?;
        info!("Mensagem {}/{} enviada", i + 1, total);
    }

    Ok(total)
}

// ── Digest formatting ───────────────────────────────────────────────────────

fn recommendation_line(rec: Option<Recommendation>) -> &'static str {
    match rec {
        Some(Recommendation::Participar) => "✅ PARTICIPAR",
        Some(Recommendation::Acompanhar) => "👀 ACOMPANHAR",
        Some(Recommendation::Descartar) | None => "❌ DESCARTAR",
    }
}

/// Build the full digest text for a run: header with tier counts, detailed
/// ALTA entries, one-line MEDIA entries.
pub fn format_digest(summary: &RunSummary, records: &[BiddingRecord]) -> String {
    let mut out = String::new();

    match summary.numero_boletim {
        Some(n) => out.push_str(&format!("🔔 *Boletim de Licitações [{}]*\n", n)),
        None => out.push_str("🔔 *Boletim de Licitações*\n"),
    }
    out.push_str(&format!("📅 {}\n\n", &summary.iniciado_em[..10]));

    out.push_str(&format!(
        "📊 *Resumo da triagem* ({} licitações)\n\
         🟢 Alta aderência: {}\n\
         🟡 Média aderência: {}\n\
         🔴 Baixa aderência: {}\n",
        summary.total_licitacoes,
        summary.triagem.alta,
        summary.triagem.media,
        summary.triagem.baixa,
    ));

    let altas: Vec<&BiddingRecord> = records
        .iter()
        .filter(|r| r.tier() == Some(Tier::Alta))
        .collect();
    let medias: Vec<&BiddingRecord> = records
        .iter()
        .filter(|r| r.tier() == Some(Tier::Media))
        .collect();

    if !altas.is_empty() {
        out.push_str("\n━━━━━━━━━━━━━━━\n🟢 *ALTA ADERÊNCIA*\n");
        for r in &altas {
            out.push('\n');
            out.push_str(&format!("*{}* — {}\n", r.numero_conlicitacao, r.orgao));
            out.push_str(&format!("📍 {}\n", r.cidade_uf()));
            out.push_str(&format!("📋 {}\n", r.objeto));
            if !r.data_abertura.is_empty() {
                out.push_str(&format!("🗓 Abertura: {}\n", r.data_abertura));
            }
            if !r.valor.is_empty() {
                out.push_str(&format!("💰 {}\n", r.valor));
            }
            if let Some(analysis) = &r.analysis {
                out.push_str(&format!("🧠 {}\n", analysis.resumo_executivo));
                for alerta in &analysis.alertas {
                    out.push_str(&format!("⚠️ {}\n", alerta));
                }
            } else if let Some(triage) = &r.triage {
                out.push_str(&format!("💬 {}\n", triage.motivo));
            }
            out.push_str(&format!("{}\n", recommendation_line(r.recommendation())));
        }
    }

    if !medias.is_empty() {
        out.push_str("\n━━━━━━━━━━━━━━━\n🟡 *MÉDIA ADERÊNCIA*\n\n");
        for r in &medias {
            out.push_str(&format!(
                "• *{}* ({}) — {}\n",
                r.numero_conlicitacao,
                r.cidade_uf(),
                r.objeto
            ));
        }
    }

    if !summary.errors.is_empty() {
        out.push_str(&format!(
            "\n⚠️ {} erro(s) não fatais durante o processamento\n",
            summary.errors.len()
        ));
    }

    out
}

/// Split on line boundaries so no part exceeds `limit` chars. A single line
/// longer than the limit is hard-split at char boundaries.
fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0;

    for line in text.split_inclusive('\n') {
        let line_chars = line.chars().count();
        if current_chars + line_chars > limit && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        if line_chars > limit {
            for c in line.chars() {
                if current_chars == limit {
                    parts.push(std::mem::take(&mut current));
                    current_chars = 0;
                }
                current.push(c);
                current_chars += 1;
            }
            continue;
        }
        current.push_str(line);
        current_chars += line_chars;
    }
    if !current.is_empty() {
        parts.push(current);
    }

    parts
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every sent message; optionally fails all sends.
    #[derive(Default)]
    pub struct MemoryNotifier {
        pub sent: Mutex<Vec<(String, String)>>,
        pub fail: bool,
    }

    #[async_trait::async_trait]
    impl Notifier for MemoryNotifier {
        async fn send(&self, recipient: &str, text: &str) -> Result<()> {
            if self.fail {
                anyhow::bail!("instância desconectada");
            }
            self.sent
                .lock()
                .unwrap()
                .push((recipient.to_string(), text.to_string()));
            Ok(())
        }
    }
}
