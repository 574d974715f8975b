//! Edital bundle resolution: archive expansion, text extraction, OCR fallback.
//!
//! The bundle is an uploaded archive holding one or more files per bidding
//! (PDFs, plain text, or scanned page images), possibly inside nested ZIPs.
//! Files are associated to records by filename: a file belongs to the
//! external identifier its basename contains. Identifiers with no usable
//! document are simply absent from the result; a single document's failure
//! never aborts resolution of the others.

use crate::error::PipelineError;
use crate::ocr::OcrProvider;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use tracing::{debug, info, warn};

/// A document counts as resolved once its trimmed text reaches this length.
/// Below it, the OCR fallback runs; still below it, the identifier stays
/// unresolved.
pub const MIN_RESOLVED_TEXT_CHARS: usize = 200;

/// Cap on text handed to the deep analyzer, to stay inside the model
/// context window.
pub const MAX_DOC_TEXT_CHARS: usize = 50_000;

const MAX_ARCHIVE_DEPTH: usize = 4;
const MAX_ARCHIVE_FILES: usize = 512;

/// One file pulled out of the bundle.
#[derive(Debug, Clone)]
pub struct BundleFile {
    pub name: String,
    pub data: Vec<u8>,
}

/// Ephemeral mapping external identifier → extracted document text.
/// Consumed by the deep analyzer, never persisted.
#[derive(Debug, Default)]
pub struct DocumentBundle {
    pub texts: HashMap<String, String>,
    pub errors: Vec<PipelineError>,
}

impl DocumentBundle {
    pub fn text_for(&self, id: &str) -> Option<&str> {
        self.texts.get(id).map(|s| s.as_str())
    }
}

/// Resolve an uploaded archive against the expected identifiers.
pub async fn resolve_bundle(
    filename: &str,
    data: &[u8],
    expected_ids: &[String],
    ocr: Option<&dyn OcrProvider>,
) -> DocumentBundle {
    let mut bundle = DocumentBundle::default();

    let files = match expand_archive(filename, data) {
        Ok(files) => files,
        Err(e) => {
            bundle.errors.push(PipelineError::DocumentResolution {
                id: filename.to_string(),
                source: e,
            });
            return bundle;
        }
    };

    info!("Bundle expandido: {} arquivo(s) de {}", files.len(), filename);

    for id in expected_ids {
        if id.is_empty() {
            continue;
        }

        let matched: Vec<&BundleFile> = {
            let mut m: Vec<&BundleFile> = files
                .iter()
                .filter(|f| file_matches_id(&f.name, id))
                .collect();
            // Page-image naming carries the page order in the filename
            m.sort_by(|a, b| a.name.cmp(&b.name));
            m
        };

        if matched.is_empty() {
            debug!("Nenhum documento no bundle para {}", id);
            continue;
        }

        match resolve_one(id, &matched, ocr).await {
            Ok(Some(text)) => {
                bundle.texts.insert(id.clone(), text);
            }
            Ok(None) => {
                debug!("Documento de {} abaixo do limiar de resolução", id);
            }
            Err(e) => {
                warn!("Falha ao resolver documento de {}: {:#}", id, e);
                bundle.errors.push(PipelineError::DocumentResolution {
                    id: id.clone(),
                    source: e,
                });
            }
        }
    }

    info!(
        "Bundle resolvido: {} de {} identificadores, {} erro(s)",
        bundle.texts.len(),
        expected_ids.iter().filter(|i| !i.is_empty()).count(),
        bundle.errors.len()
    );

    bundle
}

/// Extract the text for one identifier from its matched files.
/// Direct extraction first; OCR fallback when the result stays under the
/// resolvability threshold.
async fn resolve_one(
    id: &str,
    files: &[&BundleFile],
    ocr: Option<&dyn OcrProvider>,
) -> anyhow::Result<Option<String>> {
    let mut parts: Vec<String> = Vec::new();

    for file in files {
        if let Some(text) = extract_direct(file) {
            if !text.trim().is_empty() {
                parts.push(text);
            }
        }
    }

    let combined = parts.join("\n\n---\n\n");
    if combined.trim().chars().count() >= MIN_RESOLVED_TEXT_CHARS {
        return Ok(Some(truncate_doc(combined)));
    }

    // Near-empty direct extraction: likely scanned pages. OCR each file in
    // filename (page) order and concatenate.
    let Some(provider) = ocr else {
        return Ok(None);
    };

    let mut ocr_parts: Vec<String> = Vec::new();
    for file in files {
        let result = provider.process(&file.name, &file.data).await?;
        if !result.text.trim().is_empty() {
            ocr_parts.push(result.text);
        }
    }

    let combined = ocr_parts.join("\n\n");
    if combined.trim().chars().count() >= MIN_RESOLVED_TEXT_CHARS {
        debug!("OCR fallback resolveu documento de {}", id);
        Ok(Some(truncate_doc(combined)))
    } else {
        Ok(None)
    }
}

fn truncate_doc(mut text: String) -> String {
    if text.len() > MAX_DOC_TEXT_CHARS {
        let mut end = MAX_DOC_TEXT_CHARS;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        text.push_str("\n\n[... TEXTO TRUNCADO ...]");
    }
    text
}

/// Direct (non-OCR) text extraction by file type.
fn extract_direct(file: &BundleFile) -> Option<String> {
    let lower = file.name.to_lowercase();
    if lower.ends_with(".pdf") {
        match extract_pdf_text(&file.data) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Extração de texto falhou para {}: {:#}", file.name, e);
                None
            }
        }
    } else if lower.ends_with(".txt") || lower.ends_with(".md") || lower.ends_with(".html") {
        Some(String::from_utf8_lossy(&file.data).to_string())
    } else {
        // Image formats and anything else go through the OCR fallback
        None
    }
}

/// Extract text from a PDF using lopdf, page by page.
fn extract_pdf_text(data: &[u8]) -> anyhow::Result<String> {
    use lopdf::Document;

    let doc = Document::load_from(Cursor::new(data))
        .map_err(|e| anyhow::anyhow!("Failed to load PDF: {}", e))?;

    let mut text = String::new();
    let pages = doc.get_pages();

    for (page_num, _) in pages {
        if let Ok(content) = doc.extract_text(&[page_num]) {
            text.push_str(&content);
            text.push('\n');
        }
    }

    Ok(text)
}

/// Recursively expand an archive into leaf files. Non-ZIP input is returned
/// as a single file. Depth and file-count caps bound hostile inputs.
pub fn expand_archive(filename: &str, data: &[u8]) -> anyhow::Result<Vec<BundleFile>> {
    let mut files = Vec::new();
    expand_into(filename, data, 0, &mut files)?;
    Ok(files)
}

fn expand_into(
    name: &str,
    data: &[u8],
    depth: usize,
    out: &mut Vec<BundleFile>,
) -> anyhow::Result<()> {
    if out.len() >= MAX_ARCHIVE_FILES {
        anyhow::bail!("bundle excede {} arquivos", MAX_ARCHIVE_FILES);
    }

    let is_zip = name.to_lowercase().ends_with(".zip") || data.starts_with(b"PK\x03\x04");
    if !is_zip {
        out.push(BundleFile {
            name: name.to_string(),
            data: data.to_vec(),
        });
        return Ok(());
    }

    if depth >= MAX_ARCHIVE_DEPTH {
        anyhow::bail!("arquivos ZIP aninhados além da profundidade {}", MAX_ARCHIVE_DEPTH);
    }

    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| anyhow::anyhow!("ZIP ilegível ({}): {}", name, e))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let entry_name = entry.name().to_string();
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf)?;
        expand_into(&entry_name, &buf, depth + 1, out)?;
    }

    Ok(())
}

fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// A file belongs to an identifier when its basename is the id followed by
/// a separator or the extension. Plain containment would hand record 101
/// the documents of 1011.
fn file_matches_id(path: &str, id: &str) -> bool {
    match basename(path).strip_prefix(id) {
        Some(rest) => !rest.chars().next().is_some_and(|c| c.is_ascii_digit()),
        None => false,
    }
}
