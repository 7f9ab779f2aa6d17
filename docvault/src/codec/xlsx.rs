//! Tabular dump codec.
//!
//! Writes a minimal SpreadsheetML workbook (zip container) with two sheets:
//! the collection data (one row per record, one column per field) and a
//! `metadata` sheet with the collection name, export time and record count.
//!
//! Nested values are flattened to their JSON text, so this format is for
//! humans. Decoding is supported for forced restores but does not recover
//! nested types.

use std::io::{Cursor, Read, Write};

use chrono::{DateTime, Utc};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{field_union, reject_reserved, Codec, ExportContext, FormatKind};
use crate::record::{
    format_timestamp, parse_timestamp, Document, Record, Value, ID_FIELD, UPDATED_AT_FIELD,
};
use crate::utils::errors::{Result, VaultError};

/// Excel's per-cell character limit.
pub const MAX_CELL_CHARS: usize = 32_767;

const MAX_SHEET_NAME: usize = 31;
const METADATA_SHEET: &str = "metadata";
const DATA_SHEET_PATH: &str = "xl/worksheets/sheet1.xml";
const METADATA_SHEET_PATH: &str = "xl/worksheets/sheet2.xml";

/// Largest integer a spreadsheet number cell holds exactly (2^53).
const MAX_EXACT_INT: u64 = 9_007_199_254_740_992;

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/><Override PartName="/xl/worksheets/sheet2.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>"#;

const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

const WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet2.xml"/></Relationships>"#;

pub struct XlsxCodec;

/// Contents of the metadata sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkbookMetadata {
    pub collection: String,
    pub exported_at: Option<DateTime<Utc>>,
    pub record_count: usize,
}

/// One parsed cell: its text and the `t` attribute, if any.
#[derive(Debug)]
struct Cell {
    column: usize,
    kind: Option<String>,
    text: String,
}

impl Codec for XlsxCodec {
    fn kind(&self) -> FormatKind {
        FormatKind::Xlsx
    }

    fn encode(&self, ctx: &ExportContext<'_>, records: &[Record]) -> Result<Vec<u8>> {
        for record in records {
            reject_reserved(FormatKind::Xlsx, record)?;
        }

        let mut header = vec![ID_FIELD.to_string(), UPDATED_AT_FIELD.to_string()];
        header.extend(field_union(records));

        let mut rows = Vec::with_capacity(records.len() + 1);
        rows.push(header.iter().map(|h| Value::String(h.clone())).collect::<Vec<_>>());
        for record in records {
            let mut row = vec![
                Value::String(record.id.clone()),
                Value::String(format_timestamp(&record.updated_at)),
            ];
            for name in &header[2..] {
                row.push(record.fields.get(name).cloned().unwrap_or(Value::Null));
            }
            rows.push(row);
        }
        let data_sheet = sheet_xml(&rows)?;

        let metadata_rows = vec![
            vec![Value::from("collection"), Value::from(ctx.collection)],
            vec![
                Value::from("exported_at"),
                Value::String(format_timestamp(&ctx.exported_at)),
            ],
            vec![Value::from("record_count"), Value::Int(records.len() as i64)],
        ];
        let metadata_sheet = sheet_xml(&metadata_rows)?;

        let workbook = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="{}" sheetId="1" r:id="rId1"/><sheet name="{}" sheetId="2" r:id="rId2"/></sheets></workbook>"#,
            escape_xml(&data_sheet_name(ctx.collection)),
            METADATA_SHEET
        );

        write_container(&[
            ("[Content_Types].xml", CONTENT_TYPES),
            ("_rels/.rels", ROOT_RELS),
            ("xl/workbook.xml", &workbook),
            ("xl/_rels/workbook.xml.rels", WORKBOOK_RELS),
            (DATA_SHEET_PATH, &data_sheet),
            (METADATA_SHEET_PATH, &metadata_sheet),
        ])
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Record>> {
        let sheet = read_part(bytes, DATA_SHEET_PATH)?;
        let rows = parse_rows(&sheet)?;
        let mut rows = rows.into_iter();

        let Some(header_row) = rows.next() else {
            return Ok(Vec::new());
        };
        let mut header: Vec<Option<String>> = Vec::new();
        for cell in header_row {
            if header.len() <= cell.column {
                header.resize(cell.column + 1, None);
            }
            header[cell.column] = Some(cell.text);
        }

        let mut records = Vec::new();
        for row in rows {
            let mut id = None;
            let mut updated_at = None;
            let mut fields = Document::new();
            for cell in row {
                let Some(Some(name)) = header.get(cell.column) else {
                    continue;
                };
                let value = cell_value(&cell)?;
                match name.as_str() {
                    ID_FIELD => id = Some(value.display_text()),
                    UPDATED_AT_FIELD => updated_at = parse_timestamp(&value.display_text()),
                    _ => {
                        fields.insert(name.clone(), value);
                    }
                }
            }
            let id = id.ok_or_else(|| VaultError::corrupt("spreadsheet row without '_id'"))?;
            records.push(Record {
                id,
                updated_at: updated_at.unwrap_or_else(Utc::now),
                fields,
            });
        }
        Ok(records)
    }
}

/// Read the metadata sheet of a tabular dump.
pub fn read_metadata(bytes: &[u8]) -> Result<WorkbookMetadata> {
    let sheet = read_part(bytes, METADATA_SHEET_PATH)?;
    let mut meta = WorkbookMetadata {
        collection: String::new(),
        exported_at: None,
        record_count: 0,
    };
    for row in parse_rows(&sheet)? {
        let mut cells = row.into_iter();
        let (Some(key), Some(value)) = (cells.next(), cells.next()) else {
            continue;
        };
        match key.text.as_str() {
            "collection" => meta.collection = value.text,
            "exported_at" => meta.exported_at = parse_timestamp(&value.text),
            "record_count" => {
                meta.record_count = value
                    .text
                    .parse()
                    .map_err(|_| VaultError::corrupt("record_count is not a number"))?
            }
            _ => {}
        }
    }
    Ok(meta)
}

fn write_container(parts: &[(&str, &str)]) -> Result<Vec<u8>> {
    let zip_err = |e: zip::result::ZipError| VaultError::format("xlsx", e.to_string());
    let io_err = |e: std::io::Error| VaultError::format("xlsx", e.to_string());

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, body) in parts {
        zip.start_file(*name, options).map_err(zip_err)?;
        zip.write_all(body.as_bytes()).map_err(io_err)?;
    }
    Ok(zip.finish().map_err(zip_err)?.into_inner())
}

fn read_part(bytes: &[u8], name: &str) -> Result<String> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| VaultError::corrupt(format!("not a spreadsheet container: {}", e)))?;
    let mut part = archive
        .by_name(name)
        .map_err(|e| VaultError::corrupt(format!("workbook part {} missing: {}", name, e)))?;
    let mut xml = String::new();
    part.read_to_string(&mut xml)
        .map_err(|e| VaultError::corrupt(format!("workbook part {} unreadable: {}", name, e)))?;
    Ok(xml)
}

fn data_sheet_name(collection: &str) -> String {
    let cleaned: String = collection
        .chars()
        .map(|c| match c {
            '[' | ']' | ':' | '*' | '?' | '/' | '\\' => '_',
            c => c,
        })
        .take(MAX_SHEET_NAME)
        .collect();
    if cleaned.trim().is_empty() {
        "data".to_string()
    } else if cleaned.eq_ignore_ascii_case(METADATA_SHEET) {
        "data_metadata".to_string()
    } else {
        cleaned
    }
}

fn sheet_xml(rows: &[Vec<Value>]) -> Result<String> {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );
    for (r, row) in rows.iter().enumerate() {
        let row_num = r + 1;
        xml.push_str(&format!(r#"<row r="{}">"#, row_num));
        for (c, value) in row.iter().enumerate() {
            let cell_ref = format!("{}{}", column_letters(c), row_num);
            push_cell(&mut xml, &cell_ref, value)?;
        }
        xml.push_str("</row>");
    }
    xml.push_str("</sheetData></worksheet>");
    Ok(xml)
}

fn push_cell(xml: &mut String, cell_ref: &str, value: &Value) -> Result<()> {
    match value {
        Value::Null => {}
        Value::Bool(b) => {
            xml.push_str(&format!(r#"<c r="{}" t="b"><v>{}</v></c>"#, cell_ref, u8::from(*b)));
        }
        Value::Int(i) if i.unsigned_abs() <= MAX_EXACT_INT => {
            xml.push_str(&format!(r#"<c r="{}"><v>{}</v></c>"#, cell_ref, i));
        }
        Value::Float(f) => {
            if !f.is_finite() {
                return Err(VaultError::format(
                    "xlsx",
                    format!("{} cannot be stored in a numeric cell", f),
                ));
            }
            xml.push_str(&format!(r#"<c r="{}"><v>{:?}</v></c>"#, cell_ref, f));
        }
        other => {
            let text = other.display_text();
            check_cell_text(&text)?;
            xml.push_str(&format!(
                r#"<c r="{}" t="inlineStr"><is><t xml:space="preserve">{}</t></is></c>"#,
                cell_ref,
                escape_xml(&text)
            ));
        }
    }
    Ok(())
}

fn check_cell_text(text: &str) -> Result<()> {
    if text.chars().count() > MAX_CELL_CHARS {
        return Err(VaultError::format(
            "xlsx",
            format!("cell text exceeds {} characters", MAX_CELL_CHARS),
        ));
    }
    if let Some(bad) = text
        .chars()
        .find(|c| (c.is_control() && !matches!(c, '\t' | '\n' | '\r')) || matches!(c, '\u{FFFE}' | '\u{FFFF}'))
    {
        return Err(VaultError::format(
            "xlsx",
            format!("character U+{:04X} is not allowed in a spreadsheet", bad as u32),
        ));
    }
    Ok(())
}

/// Zero-based column index to spreadsheet letters: 0 -> A, 25 -> Z, 26 -> AA.
fn column_letters(mut idx: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'A' + (idx % 26) as u8);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

/// Inverse of [`column_letters`] for a cell reference such as `AB12`.
fn column_index(cell_ref: &str) -> Option<usize> {
    let letters: Vec<u8> = cell_ref.bytes().take_while(u8::is_ascii_uppercase).collect();
    if letters.is_empty() {
        return None;
    }
    let mut idx = 0usize;
    for b in letters {
        idx = idx * 26 + (b - b'A' + 1) as usize;
    }
    Some(idx - 1)
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_xml(text: &str) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let semi = rest[amp..]
            .find(';')
            .ok_or_else(|| VaultError::corrupt("unterminated XML entity"))?;
        let entity = &rest[amp + 1..amp + semi];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ => {
                let code = entity
                    .strip_prefix("#x")
                    .map(|hex| u32::from_str_radix(hex, 16))
                    .or_else(|| entity.strip_prefix('#').map(str::parse::<u32>))
                    .and_then(|r| r.ok())
                    .and_then(char::from_u32)
                    .ok_or_else(|| VaultError::corrupt(format!("unknown XML entity &{};", entity)))?;
                out.push(code);
            }
        }
        rest = &rest[amp + semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Text between `<tag ...>` and `</tag>` inside `xml`, if present.
fn element_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = xml.find(&format!("<{}", tag))?;
    let after_open = &xml[open..];
    let gt = after_open.find('>')?;
    if after_open[..gt].ends_with('/') {
        return Some("");
    }
    let body = &after_open[gt + 1..];
    let close = body.find(&format!("</{}>", tag))?;
    Some(&body[..close])
}

fn attribute<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!(" {}=\"", name);
    let start = tag.find(&needle)? + needle.len();
    let end = tag[start..].find('"')?;
    Some(&tag[start..start + end])
}

fn parse_rows(sheet: &str) -> Result<Vec<Vec<Cell>>> {
    let mut rows = Vec::new();
    let mut rest = sheet;
    while let Some(start) = rest.find("<row") {
        let after = &rest[start..];
        let end = after
            .find("</row>")
            .ok_or_else(|| VaultError::corrupt("unterminated <row>"))?;
        rows.push(parse_cells(&after[..end])?);
        rest = &after[end + "</row>".len()..];
    }
    Ok(rows)
}

fn parse_cells(row: &str) -> Result<Vec<Cell>> {
    let mut cells = Vec::new();
    let mut rest = row;
    while let Some(start) = rest.find("<c ") {
        let after = &rest[start..];
        let gt = after
            .find('>')
            .ok_or_else(|| VaultError::corrupt("unterminated <c> tag"))?;
        let open_tag = &after[..gt];
        let cell_ref = attribute(open_tag, "r")
            .ok_or_else(|| VaultError::corrupt("cell without a reference"))?;
        let column = column_index(cell_ref)
            .ok_or_else(|| VaultError::corrupt(format!("bad cell reference '{}'", cell_ref)))?;
        let kind = attribute(open_tag, "t").map(str::to_string);

        if open_tag.ends_with('/') {
            rest = &after[gt + 1..];
            continue;
        }
        let close = after
            .find("</c>")
            .ok_or_else(|| VaultError::corrupt("unterminated <c> element"))?;
        let body = &after[gt + 1..close];
        let raw = if kind.as_deref() == Some("inlineStr") {
            element_text(body, "t").unwrap_or("")
        } else {
            element_text(body, "v").unwrap_or("")
        };
        cells.push(Cell {
            column,
            kind,
            text: unescape_xml(raw)?,
        });
        rest = &after[close + "</c>".len()..];
    }
    Ok(cells)
}

fn cell_value(cell: &Cell) -> Result<Value> {
    match cell.kind.as_deref() {
        Some("b") => Ok(Value::Bool(cell.text == "1")),
        Some("inlineStr") | Some("str") => Ok(Value::String(cell.text.clone())),
        _ => {
            let text = cell.text.trim();
            if !text.contains(['.', 'e', 'E']) {
                if let Ok(i) = text.parse::<i64>() {
                    return Ok(Value::Int(i));
                }
            }
            text.parse::<f64>()
                .map(Value::Float)
                .map_err(|_| VaultError::corrupt(format!("non-numeric number cell '{}'", text)))
        }
    }
}
