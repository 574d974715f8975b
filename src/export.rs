//! Bulletin export parsing for CSV and Excel (.xlsx/.xlsm/.xlsb).
//!
//! One export row becomes one [`BiddingRecord`]. Header matching is
//! flexible: the portal renames columns between exports, so each field
//! accepts several Portuguese header variants. Missing optional columns
//! become empty strings; only a missing object column or zero parseable
//! rows fail the run.

use crate::error::PipelineError;
use crate::model::BiddingRecord;
use calamine::{open_workbook_from_rs, Data, Reader, Xlsx, Xlsb};
use std::io::Cursor;

/// Fields the extractor looks for, with accepted header variants.
/// A header matches when it contains any variant (case-insensitive).
const COLUMN_VARIANTS: &[(&str, &[&str])] = &[
    ("objeto", &["objeto", "descrição", "descricao", "description"]),
    ("orgao", &["órgão", "orgao"]),
    ("cidade", &["cidade", "município", "municipio", "city"]),
    ("uf", &["uf", "estado", "state"]),
    ("data_abertura", &["data abertura", "abertura", "datas", "data"]),
    ("edital", &["edital", "nº edital", "numero edital"]),
    ("status", &["status", "situação", "situacao"]),
    (
        "palavras_chave",
        &["palavras-chave", "palavras chave", "palavra-chave", "keywords"],
    ),
    ("valor", &["valor estimado", "valor", "preço", "preco"]),
    ("modalidade", &["modalidade", "tipo"]),
    (
        "numero_conlicitacao",
        &["nº conlicitação", "conlicitação", "conlicitacao", "nº licitação"],
    ),
];

/// Parse export bytes into an ordered sequence of records.
pub fn parse_export(filename: &str, data: &[u8]) -> Result<Vec<BiddingRecord>, PipelineError> {
    let ext = filename.rsplit('.').next().unwrap_or("").to_lowercase();

    let (headers, rows) = match ext.as_str() {
        "csv" => parse_csv(data)?,
        "xlsx" | "xlsm" => parse_excel::<Xlsx<_>>(data)?,
        "xlsb" => parse_excel::<Xlsb<_>>(data)?,
        _ => {
            return Err(PipelineError::MalformedExport(format!(
                "formato não suportado: .{} (esperado .csv, .xlsx, .xlsm ou .xlsb)",
                ext
            )))
        }
    };

    rows_to_records(&headers, rows)
}

fn parse_csv(data: &[u8]) -> Result<(Vec<String>, Vec<Vec<String>>), PipelineError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(true)
        .from_reader(data);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| PipelineError::MalformedExport(format!("cabeçalho CSV ilegível: {}", e)))?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result
            .map_err(|e| PipelineError::MalformedExport(format!("linha CSV ilegível: {}", e)))?;
        rows.push(record.iter().map(|f| f.to_string()).collect());
    }

    Ok((headers, rows))
}

/// Parse the first worksheet carrying data. Row 0 is the header.
fn parse_excel<'a, W>(data: &'a [u8]) -> Result<(Vec<String>, Vec<Vec<String>>), PipelineError>
where
    W: Reader<Cursor<&'a [u8]>>,
    W::Error: std::fmt::Display,
{
    let cursor = Cursor::new(data);
    let mut workbook: W = open_workbook_from_rs(cursor)
        .map_err(|e| PipelineError::MalformedExport(format!("planilha ilegível: {}", e)))?;

    let mut sheets = Vec::new();
    let sheet_names: Vec<String> = workbook.sheet_names().to_vec();
    for name in &sheet_names {
        let range = match workbook.worksheet_range(name) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Skipping sheet '{}': {}", name, e);
                continue;
            }
        };

        let mut row_iter = range.rows();
        let headers: Vec<String> = match row_iter.next() {
            Some(row) => row.iter().map(cell_to_string).collect(),
            None => continue,
        };

        let mut rows = Vec::new();
        for row in row_iter {
            let values: Vec<String> = row.iter().map(cell_to_string).collect();
            if values.iter().all(|v| v.is_empty()) {
                continue;
            }
            rows.push(values);
        }

        sheets.push((headers, rows));
    }

    select_sheet(sheets).ok_or_else(|| {
        PipelineError::MalformedExport(
            "nenhuma planilha com dados na pasta de trabalho".to_string(),
        )
    })
}

/// First sheet with a non-empty header and at least one data row. Cover
/// sheets (headers only) are skipped.
fn select_sheet(
    sheets: Vec<(Vec<String>, Vec<Vec<String>>)>,
) -> Option<(Vec<String>, Vec<Vec<String>>)> {
    sheets
        .into_iter()
        .find(|(headers, rows)| !headers.iter().all(|h| h.is_empty()) && !rows.is_empty())
}

/// Map raw rows into records using the flexible header matching.
fn rows_to_records(
    headers: &[String],
    rows: Vec<Vec<String>>,
) -> Result<Vec<BiddingRecord>, PipelineError> {
    let lowered: Vec<String> = headers.iter().map(|h| h.trim().to_lowercase()).collect();

    let mut column_map: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for (field, variants) in COLUMN_VARIANTS {
        for (i, header) in lowered.iter().enumerate() {
            if variants.iter().any(|v| header.contains(v)) {
                column_map.insert(field, i);
                break;
            }
        }
    }

    let objeto_col = *column_map.get("objeto").ok_or_else(|| {
        PipelineError::MalformedExport(
            "coluna obrigatória 'objeto' ausente no cabeçalho".to_string(),
        )
    })?;

    let get = |row: &[String], field: &str| -> String {
        column_map
            .get(field)
            .and_then(|&i| row.get(i))
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    };

    let mut records = Vec::new();
    for (idx, row) in rows.iter().enumerate() {
        let objeto = row
            .get(objeto_col)
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
        if objeto.is_empty() {
            continue;
        }

        let mut record = BiddingRecord::new(objeto, idx + 2); // +2: 1-based, after header
        record.orgao = get(row, "orgao");
        record.cidade = get(row, "cidade");
        record.uf = get(row, "uf");
        record.data_abertura = get(row, "data_abertura");
        record.edital = get(row, "edital");
        record.status = get(row, "status");
        record.palavras_chave = get(row, "palavras_chave");
        record.valor = get(row, "valor");
        record.modalidade = get(row, "modalidade");
        record.numero_conlicitacao = get(row, "numero_conlicitacao");
        records.push(record);
    }

    if records.is_empty() {
        return Err(PipelineError::MalformedExport(
            "nenhuma linha parseável no export".to_string(),
        ));
    }

    tracing::info!("Export parseado: {} licitações", records.len());
    Ok(records)
}

/// Convert a calamine cell to a string representation.
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            // Avoid trailing ".0" for whole numbers
            if *f == (*f as i64) as f64 && f.abs() < i64::MAX as f64 {
                format!("{}", *f as i64)
            } else {
                format!("{}", f)
            }
        }
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => excel_serial_to_string(dt.as_f64()),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("#ERR:{:?}", e),
    }
}

/// Convert an Excel serial date number to a human-readable string.
/// Excel epoch: 1899-12-30, with the 1900 leap year bug (serial 60 is the
/// nonexistent Feb 29, 1900).
fn excel_serial_to_string(serial: f64) -> String {
    let days = serial as i64;
    let frac = serial - days as f64;

    let adjusted_days = if days > 59 { days - 1 } else { days };

    let base = 25569i64; // days from 1899-12-30 to 1970-01-01
    let unix_days = adjusted_days - base;
    let total_secs = unix_days * 86400 + (frac * 86400.0) as i64;

    let days_since_epoch = total_secs / 86400;
    let time_of_day = (total_secs % 86400 + 86400) % 86400;

    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    let mut year = 1970i32;
    let mut remaining = days_since_epoch as i32;

    if remaining >= 0 {
        loop {
            let diy = if is_leap(year) { 366 } else { 365 };
            if remaining < diy {
                break;
            }
            remaining -= diy;
            year += 1;
        }
    } else {
        loop {
            year -= 1;
            let diy = if is_leap(year) { 366 } else { 365 };
            remaining += diy;
            if remaining >= 0 {
                break;
            }
        }
    }

    let dim: [i32; 12] = if is_leap(year) {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    };

    let mut month = 1;
    for d in dim {
        if remaining < d {
            break;
        }
        remaining -= d;
        month += 1;
    }
    let day = remaining + 1;

    if hours == 0 && minutes == 0 && seconds == 0 {
        format!("{:04}-{:02}-{:02}", year, month, day)
    } else {
        format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            year, month, day, hours, minutes, seconds
        )
    }
}

fn is_leap(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_rows_in_order() {
        let csv = b"Objeto,\xc3\x93rg\xc3\xa3o,Cidade,UF,N\xc2\xba Conlicita\xc3\xa7\xc3\xa3o\n\
aquisicao de hidrometros,Prefeitura A,Campinas,SP,111\n\
servico de limpeza,Prefeitura B,Niteroi,RJ,222\n\
datalogger para telemetria,SAAE,Bauru,SP,333\n";
        let records = parse_export("boletim.csv", csv).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].objeto, "aquisicao de hidrometros");
        assert_eq!(records[0].numero_conlicitacao, "111");
        assert_eq!(records[1].cidade, "Niteroi");
        assert_eq!(records[2].uf, "SP");
        assert_eq!(records[0].row_index, 2);
        assert_eq!(records[2].row_index, 4);
    }

    #[test]
    fn missing_optional_column_yields_empty_field() {
        // No "valor" column at all
        let csv = b"objeto,orgao\ncompra de sensores,DAEE\n";
        let records = parse_export("b.csv", csv).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].valor, "");
        assert_eq!(records[0].orgao, "DAEE");
    }

    #[test]
    fn missing_objeto_column_is_malformed() {
        let csv = b"orgao,cidade\nPrefeitura,Santos\n";
        let err = parse_export("b.csv", csv).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedExport(_)));
    }

    #[test]
    fn zero_rows_is_malformed() {
        let csv = b"objeto,orgao\n";
        let err = parse_export("b.csv", csv).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedExport(_)));
    }

    #[test]
    fn rows_without_objeto_are_skipped() {
        let csv = b"objeto,orgao\ncompra de rotametros,SAAE\n,Prefeitura\n";
        let records = parse_export("b.csv", csv).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn unsupported_extension_is_malformed() {
        let err = parse_export("boletim.txt", b"dados").unwrap_err();
        assert!(matches!(err, PipelineError::MalformedExport(_)));
    }

    #[test]
    fn header_variants_match_case_insensitively() {
        let csv = b"DESCRI\xc3\x87\xc3\x83O,Valor Estimado\ncalha parshall,R$ 10.000\n";
        let records = parse_export("b.csv", csv).unwrap();
        assert_eq!(records[0].objeto, "calha parshall");
        assert_eq!(records[0].valor, "R$ 10.000");
    }

    #[test]
    fn header_only_cover_sheet_is_skipped() {
        let cover = (vec!["Boletim ConLicitação".to_string()], vec![]);
        let data = (
            vec!["objeto".to_string(), "orgao".to_string()],
            vec![vec!["medidor de vazão".to_string(), "SAAE".to_string()]],
        );
        let picked = select_sheet(vec![cover, data.clone()]).unwrap();
        assert_eq!(picked, data);
    }

    #[test]
    fn workbook_without_data_rows_selects_nothing() {
        let cover = (vec!["capa".to_string()], vec![]);
        let blank = (vec![String::new()], vec![vec!["x".to_string()]]);
        assert!(select_sheet(vec![cover, blank]).is_none());
    }

    #[test]
    fn excel_serial_dates_render_iso() {
        assert_eq!(excel_serial_to_string(45000.0), "2023-03-15");
        assert_eq!(excel_serial_to_string(25569.0), "1970-01-01");
    }
}
