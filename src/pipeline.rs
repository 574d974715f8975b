//! Run orchestration: extraction → triage → document resolution → deep
//! analysis → persistence → notification.
//!
//! Stages are strictly ordered; nothing is persisted or notified before the
//! analysis join barrier. Only a malformed export aborts a run — every other
//! failure is collected on the summary and the run keeps going. The run log
//! is appended exactly once per run, including aborted ones.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::analysis::{analyze_all, DocumentAnalyst};
use crate::bundle::{resolve_bundle, DocumentBundle};
use crate::config::Catalog;
use crate::error::PipelineError;
use crate::export::parse_export;
use crate::model::{RunStage, RunSummary, TriageCounts};
use crate::notify::{format_digest, send_digest, Notifier};
use crate::ocr::OcrProvider;
use crate::store::RecordStore;
use crate::triage::TriageClassifier;

/// One uploaded bulletin: the export plus an optional document bundle.
pub struct RunInput {
    pub export_filename: String,
    pub export_data: Vec<u8>,
    /// Archive of edital documents, matched to records by filename.
    pub documents: Option<(String, Vec<u8>)>,
    /// Bulletin e-mail subject, carries the bulletin number in brackets.
    pub subject: Option<String>,
    /// When false, the document bundle is ignored and every record stays
    /// quick-triage-only.
    pub resolve_documents: bool,
    /// When false, the digest is skipped for this run.
    pub send_notification: bool,
}

pub struct Pipeline {
    pub catalog: Catalog,
    pub classifier: Arc<dyn TriageClassifier>,
    pub analyst: Arc<dyn DocumentAnalyst>,
    pub store: Arc<dyn RecordStore>,
    pub notifier: Arc<dyn Notifier>,
    pub ocr: Option<Arc<dyn OcrProvider>>,
    /// Empty disables the digest.
    pub whatsapp_recipient: String,
}

/// Pull the bulletin number out of a subject like
/// `"Boletim ConLicitação [12345]"`.
pub fn extract_boletim_number(subject: &str) -> Option<i64> {
    static BOLETIM_RE: OnceLock<Regex> = OnceLock::new();
    let re = BOLETIM_RE.get_or_init(|| Regex::new(r"\[(\d+)\]").expect("literal pattern"));
    re.captures(subject)?.get(1)?.as_str().parse().ok()
}

fn export_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

impl Pipeline {
    /// Process one bulletin end to end. `Err` only for a malformed export;
    /// the aborted run is still logged.
    pub async fn run(&self, input: RunInput) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        let numero_boletim = input.subject.as_deref().and_then(extract_boletim_number);
        let mut summary = RunSummary::new(numero_boletim);
        summary.export_hash = Some(export_hash(&input.export_data));

        info!(
            run_id = %summary.run_id,
            boletim = ?numero_boletim,
            "Iniciando processamento de {}",
            input.export_filename
        );

        // ── Extraction ──────────────────────────────────────────────────
        let mut records = match parse_export(&input.export_filename, &input.export_data) {
            Ok(records) => records,
            Err(e) => {
                error!("Extração abortou o run: {}", e);
                summary.stage = RunStage::Failed;
                summary.record_error(&e);
                summary.duracao_segundos = started.elapsed().as_secs_f64();
                self.append_run_log(&summary).await;
                return Err(e);
            }
        };
        for record in &mut records {
            record.numero_boletim = numero_boletim;
        }
        summary.total_licitacoes = records.len();
        info!("{} licitações extraídas", records.len());

        // ── Quick triage ────────────────────────────────────────────────
        summary.stage = RunStage::Triaging;
        let outcome = self.classifier.classify(&self.catalog, &records).await;
        debug_assert_eq!(outcome.results.len(), records.len());
        for e in &outcome.errors {
            summary.record_error(e);
        }
        for (record, result) in records.iter_mut().zip(outcome.results) {
            record.triage = Some(result);
        }

        // ── Document resolution (ALTA subset only) ──────────────────────
        summary.stage = RunStage::ResolvingDocuments;
        let high_ids: Vec<String> = records
            .iter()
            .filter(|r| r.tier() == Some(crate::model::Tier::Alta))
            .map(|r| r.numero_conlicitacao.clone())
            .collect();

        let documents = match (&input.documents, high_ids.is_empty() || !input.resolve_documents) {
            (Some((name, data)), false) => {
                let bundle = resolve_bundle(name, data, &high_ids, self.ocr.as_deref()).await;
                for e in &bundle.errors {
                    summary.record_error(e);
                }
                summary.editais_resolvidos = bundle.texts.len();
                bundle
            }
            _ => DocumentBundle::default(),
        };

        // ── Deep analysis ───────────────────────────────────────────────
        summary.stage = RunStage::Analyzing;
        let analysis = analyze_all(&*self.analyst, &self.catalog, &mut records, &documents).await;
        summary.editais_analisados = analysis.analyzed;
        for e in &analysis.errors {
            summary.record_error(e);
        }

        // Counts reflect the final tiers, after any analysis refinement
        let mut counts = TriageCounts::default();
        for record in &records {
            if let Some(tier) = record.tier() {
                counts.bump(tier);
            }
        }
        summary.triagem = counts;

        // ── Persistence ─────────────────────────────────────────────────
        summary.stage = RunStage::Persisting;
        for record in &records {
            match self.store.upsert(record).await {
                Ok(_) => summary.salvas_no_banco += 1,
                Err(e) => {
                    let err = PipelineError::Persistence {
                        id: record.numero_conlicitacao.clone(),
                        source: e,
                    };
                    warn!("{}", err);
                    summary.record_error(&err);
                }
            }
        }
        info!(
            "{} de {} registros persistidos",
            summary.salvas_no_banco, summary.total_licitacoes
        );

        // ── Notification (best effort) ──────────────────────────────────
        summary.stage = RunStage::Notifying;
        if !input.send_notification {
            info!("Notificação desabilitada para este run");
        } else if self.whatsapp_recipient.is_empty() {
            info!("Destinatário WhatsApp não configurado, digest desabilitado");
        } else {
            let digest = format_digest(&summary, &records);
            match send_digest(&*self.notifier, &self.whatsapp_recipient, &digest).await {
                Ok(parts) => {
                    summary.whatsapp_enviado = true;
                    info!("Digest enviado em {} mensagem(ns)", parts);
                }
                Err(e) => {
                    let err = PipelineError::Notification(format!("{:#}", e));
                    warn!("{}", err);
                    summary.record_error(&err);
                }
            }
        }

        summary.stage = RunStage::Done;
        summary.success = true;
        summary.duracao_segundos = started.elapsed().as_secs_f64();

        self.append_run_log(&summary).await;

        info!(
            run_id = %summary.run_id,
            "Run concluído em {:.1}s: {} extraídas, {} analisadas, {} salvas, {} erro(s)",
            summary.duracao_segundos,
            summary.total_licitacoes,
            summary.editais_analisados,
            summary.salvas_no_banco,
            summary.errors.len()
        );

        Ok(summary)
    }

    /// Exactly one run-log row per run. A logging failure is itself only
    /// warned about.
    async fn append_run_log(&self, summary: &RunSummary) {
        if let Err(e) = self.store.insert_run_log(summary).await {
            warn!("Falha ao registrar run {}: {:#}", summary.run_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::testing::FakeAnalyst;
    use crate::config::Catalog;
    use crate::model::{BiddingRecord, Tier, TriageResult};
    use crate::notify::testing::MemoryNotifier;
    use crate::store::testing::MemoryStore;
    use crate::triage::TriageOutcome;
    use std::io::Write;

    /// Deterministic classifier: object text decides the tier, and indexes
    /// listed in `skip` come back unclassified (as a truncated LLM response
    /// would).
    struct RuleClassifier {
        skip: Vec<usize>,
    }

    #[async_trait::async_trait]
    impl TriageClassifier for RuleClassifier {
        async fn classify(&self, _catalog: &Catalog, records: &[BiddingRecord]) -> TriageOutcome {
            let mut results = Vec::with_capacity(records.len());
            let mut errors = Vec::new();
            for (i, record) in records.iter().enumerate() {
                if self.skip.contains(&i) {
                    results.push(TriageResult::unavailable());
                    errors.push(PipelineError::Classification(format!(
                        "registro {} sem classificação",
                        i + 1
                    )));
                    continue;
                }
                let tier = if record.objeto.contains("vazão") || record.objeto.contains("vazao") {
                    Tier::Alta
                } else if record.objeto.contains("saneamento") {
                    Tier::Media
                } else {
                    Tier::Baixa
                };
                results.push(TriageResult {
                    aderencia: tier,
                    recomendacao: tier.default_recommendation(),
                    motivo: "regra de teste".to_string(),
                    keywords_match: vec![],
                });
            }
            TriageOutcome { results, errors }
        }
    }

    fn csv_export(rows: &[(&str, &str)]) -> Vec<u8> {
        let mut out = String::from("Objeto,Nº Conlicitação\n");
        for (objeto, id) in rows {
            out.push_str(&format!("{},{}\n", objeto, id));
        }
        out.into_bytes()
    }

    fn doc_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::FileOptions::default();
            for (name, content) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    fn pipeline(
        classifier: RuleClassifier,
        store: Arc<MemoryStore>,
        notifier: Arc<MemoryNotifier>,
    ) -> Pipeline {
        Pipeline {
            catalog: Catalog::default_catalog(),
            classifier: Arc::new(classifier),
            analyst: Arc::new(FakeAnalyst::new()),
            store,
            notifier,
            ocr: None,
            whatsapp_recipient: "5511999999999".to_string(),
        }
    }

    fn run_input(export_data: Vec<u8>, documents: Option<(String, Vec<u8>)>) -> RunInput {
        RunInput {
            export_filename: "boletim.csv".to_string(),
            export_data,
            documents,
            subject: None,
            resolve_documents: true,
            send_notification: true,
        }
    }

    fn ten_row_export() -> Vec<u8> {
        csv_export(&[
            ("medidor de vazão eletromagnético", "101"),
            ("merenda escolar", "102"),
            ("medição de vazao em adutora", "103"),
            ("obras de saneamento", "104"),
            ("material de escritório", "105"),
            ("medidor de vazao ultrassônico", "106"),
            ("serviço de limpeza", "107"),
            ("pneus para frota", "108"),
            ("uniformes", "109"),
            ("combustível", "110"),
        ])
    }

    #[test]
    fn boletim_number_from_subject() {
        assert_eq!(
            extract_boletim_number("Boletim ConLicitação [12345] - 30/08"),
            Some(12345)
        );
        assert_eq!(extract_boletim_number("sem número"), None);
    }

    #[tokio::test]
    async fn full_run_analyzes_only_high_tier_with_documents() {
        let store = Arc::new(MemoryStore::default());
        let notifier = Arc::new(MemoryNotifier::default());
        let p = pipeline(RuleClassifier { skip: vec![] }, store.clone(), notifier.clone());

        let long_text = "Edital de pregão eletrônico para aquisição de medidores. ".repeat(10);
        let documents = doc_zip(&[
            ("editais/101_edital.txt", &long_text),
            ("editais/103_edital.txt", &long_text),
        ]);

        let mut input = run_input(ten_row_export(), Some(("editais.zip".to_string(), documents)));
        input.subject = Some("Boletim [777]".to_string());
        let summary = p.run(input).await.unwrap();

        assert!(summary.success);
        assert_eq!(summary.stage, RunStage::Done);
        assert_eq!(summary.numero_boletim, Some(777));
        assert_eq!(summary.total_licitacoes, 10);
        // 3 ALTA (101, 103, 106) but documents only for 2 of them
        assert_eq!(summary.triagem.alta, 3);
        assert_eq!(summary.triagem.media, 1);
        assert_eq!(summary.editais_resolvidos, 2);
        assert_eq!(summary.editais_analisados, 2);
        assert_eq!(summary.salvas_no_banco, 10);
        assert!(summary.whatsapp_enviado);
        assert!(summary.export_hash.is_some());

        let records = store.records.lock().unwrap();
        assert_eq!(records.len(), 10);
        assert!(records["101"].analysis.is_some());
        assert!(records["103"].analysis.is_some());
        assert_eq!(records["106"].edital_disponivel, Some(false));
        assert_eq!(records["101"].numero_boletim, Some(777));

        assert_eq!(store.run_logs.lock().unwrap().len(), 1);
        assert!(!notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn partial_classification_defaults_and_records_errors() {
        let store = Arc::new(MemoryStore::default());
        let notifier = Arc::new(MemoryNotifier::default());
        let p = pipeline(
            RuleClassifier { skip: vec![1, 4] },
            store.clone(),
            notifier,
        );

        let summary = p.run(run_input(ten_row_export(), None)).await.unwrap();

        assert!(summary.success);
        assert_eq!(summary.errors.len(), 2);
        // The two skipped records degraded to BAIXA and were still saved
        assert_eq!(summary.salvas_no_banco, 10);
        let records = store.records.lock().unwrap();
        assert_eq!(records["102"].tier(), Some(Tier::Baixa));
        assert_eq!(records["105"].tier(), Some(Tier::Baixa));
    }

    #[tokio::test]
    async fn persistence_failure_never_blocks_run_log_or_digest() {
        let store = Arc::new(MemoryStore {
            fail_ids: vec!["105".to_string()],
            ..Default::default()
        });
        let notifier = Arc::new(MemoryNotifier::default());
        let p = pipeline(RuleClassifier { skip: vec![] }, store.clone(), notifier.clone());

        let summary = p.run(run_input(ten_row_export(), None)).await.unwrap();

        assert!(summary.success);
        assert_eq!(summary.salvas_no_banco, 9);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].contains("105"));
        assert!(summary.whatsapp_enviado);
        assert_eq!(store.run_logs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_export_aborts_before_any_cost() {
        let store = Arc::new(MemoryStore::default());
        let notifier = Arc::new(MemoryNotifier::default());
        let p = pipeline(RuleClassifier { skip: vec![] }, store.clone(), notifier.clone());

        let result = p
            .run(run_input(b"Coluna Errada,Outra\nx,y\n".to_vec(), None))
            .await;

        assert!(matches!(result, Err(PipelineError::MalformedExport(_))));
        // Nothing persisted, nothing notified, but the aborted run is logged
        assert!(store.records.lock().unwrap().is_empty());
        assert!(notifier.sent.lock().unwrap().is_empty());
        let logs = store.run_logs.lock().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].stage, RunStage::Failed);
        assert!(!logs[0].success);
    }

    #[tokio::test]
    async fn disabled_flags_skip_resolution_and_digest() {
        let store = Arc::new(MemoryStore::default());
        let notifier = Arc::new(MemoryNotifier::default());
        let p = pipeline(RuleClassifier { skip: vec![] }, store.clone(), notifier.clone());

        let long_text = "Edital de pregão eletrônico para aquisição de medidores. ".repeat(10);
        let documents = doc_zip(&[("101_edital.txt", &long_text)]);

        let mut input = run_input(ten_row_export(), Some(("editais.zip".to_string(), documents)));
        input.resolve_documents = false;
        input.send_notification = false;
        let summary = p.run(input).await.unwrap();

        assert!(summary.success);
        assert_eq!(summary.editais_resolvidos, 0);
        assert_eq!(summary.editais_analisados, 0);
        assert!(!summary.whatsapp_enviado);
        assert!(notifier.sent.lock().unwrap().is_empty());
        assert_eq!(summary.salvas_no_banco, 10);
    }

    #[tokio::test]
    async fn notification_failure_is_non_fatal() {
        let store = Arc::new(MemoryStore::default());
        let notifier = Arc::new(MemoryNotifier {
            fail: true,
            ..Default::default()
        });
        let p = pipeline(RuleClassifier { skip: vec![] }, store.clone(), notifier);

        let summary = p.run(run_input(ten_row_export(), None)).await.unwrap();

        assert!(summary.success);
        assert!(!summary.whatsapp_enviado);
        assert!(summary.errors.iter().any(|e| e.contains("notificação")));
        assert_eq!(store.run_logs.lock().unwrap().len(), 1);
    }
}
