use anyhow::{Context, Result, anyhow};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;
use zip::ZipArchive;

pub const IMAGE_FILENAME_COLUMN: &str = "Image Filename";
pub const MAX_TEXT_LINES: usize = 4;

/// One caption row: the image it targets and its non-blank text lines, in
/// column order.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionRow {
    /// 1-based data row number (the header is not counted).
    pub row: usize,
    pub image_filename: String,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Csv,
    Xlsx,
}

impl TableKind {
    fn detect(path: &Path, bytes: &[u8]) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match ext.as_deref() {
            Some("csv") => return Ok(TableKind::Csv),
            Some("xlsx") => return Ok(TableKind::Xlsx),
            _ => {}
        }
        if infer::doc::is_xlsx(bytes) || infer::archive::is_zip(bytes) {
            return Ok(TableKind::Xlsx);
        }
        if std::str::from_utf8(bytes).is_ok() {
            return Ok(TableKind::Csv);
        }
        Err(anyhow!(
            "unsupported caption table: {} (expected .csv or .xlsx)",
            path.display()
        ))
    }
}

pub fn load_caption_table(path: &Path) -> Result<Vec<CaptionRow>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read caption table: {}", path.display()))?;
    let kind = TableKind::detect(path, &bytes)?;
    let grid = match kind {
        TableKind::Csv => read_csv_grid(&bytes),
        TableKind::Xlsx => read_xlsx_grid(&bytes),
    }
    .with_context(|| format!("failed to read caption table: {}", path.display()))?;
    rows_from_grid(grid)
}

/// Turns a header row plus data rows into caption rows. Missing cells count
/// as empty strings.
pub fn rows_from_grid(grid: Vec<Vec<String>>) -> Result<Vec<CaptionRow>> {
    let mut rows = grid.into_iter();
    let header = rows
        .next()
        .ok_or_else(|| anyhow!("caption table is empty"))?;
    let column = |name: &str| header.iter().position(|cell| cell.trim() == name);
    let filename_idx = column(IMAGE_FILENAME_COLUMN)
        .ok_or_else(|| anyhow!("missing column: '{}'", IMAGE_FILENAME_COLUMN))?;
    let line_indices: Vec<Option<usize>> = (1..=MAX_TEXT_LINES)
        .map(|n| column(&format!("Text Line {}", n)))
        .collect();

    let mut captions = Vec::new();
    for (idx, cells) in rows.enumerate() {
        if cells.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        let cell = |index: Option<usize>| {
            index
                .and_then(|index| cells.get(index))
                .map(|value| value.as_str())
                .unwrap_or("")
        };
        let lines = line_indices
            .iter()
            .map(|index| cell(*index))
            .filter(|value| !value.trim().is_empty())
            .map(|value| value.to_string())
            .collect();
        captions.push(CaptionRow {
            row: idx + 1,
            image_filename: cell(Some(filename_idx)).trim().to_string(),
            lines,
        });
    }
    Ok(captions)
}

fn read_csv_grid(bytes: &[u8]) -> Result<Vec<Vec<String>>> {
    let content = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(Cursor::new(content));
    let mut grid = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| "failed to parse CSV record")?;
        grid.push(record.iter().map(|value| value.to_string()).collect());
    }
    Ok(grid)
}

fn read_xlsx_grid(bytes: &[u8]) -> Result<Vec<Vec<String>>> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).with_context(|| "failed to read xlsx archive")?;
    let shared = match read_entry(&mut archive, "xl/sharedStrings.xml")? {
        Some(xml) => parse_shared_strings(&xml)?,
        None => Vec::new(),
    };
    let sheet_path = first_sheet_path(&mut archive)?;
    let sheet = read_entry(&mut archive, &sheet_path)?
        .ok_or_else(|| anyhow!("worksheet not found: {}", sheet_path))?;
    parse_sheet(&sheet, &shared)
}

fn read_entry(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<Option<Vec<u8>>> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(anyhow!("failed to read xlsx entry {}: {}", name, err)),
    };
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .with_context(|| format!("failed to read xlsx entry content: {}", name))?;
    Ok(Some(data))
}

/// Path of the first worksheet listed in the workbook, resolved through the
/// workbook relationships.
fn first_sheet_path(archive: &mut ZipArchive<Cursor<&[u8]>>) -> Result<String> {
    const DEFAULT_SHEET: &str = "xl/worksheets/sheet1.xml";
    let Some(workbook) = read_entry(archive, "xl/workbook.xml")? else {
        return Ok(DEFAULT_SHEET.to_string());
    };
    let Some(rel_id) = first_element_attr(&workbook, b"sheet", b"r:id")? else {
        return Ok(DEFAULT_SHEET.to_string());
    };
    let Some(rels) = read_entry(archive, "xl/_rels/workbook.xml.rels")? else {
        return Ok(DEFAULT_SHEET.to_string());
    };

    let mut reader = Reader::from_reader(Cursor::new(rels.as_slice()));
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if local_name(&e) == b"Relationship"
                    && attr(&e, b"Id")?.as_deref() == Some(rel_id.as_str())
                {
                    if let Some(target) = attr(&e, b"Target")? {
                        return Ok(resolve_target(&target));
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(anyhow!("failed to parse workbook relationships: {}", err)),
        }
        buf.clear();
    }
    Ok(DEFAULT_SHEET.to_string())
}

fn resolve_target(target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        absolute.to_string()
    } else {
        format!("xl/{}", target)
    }
}

fn first_element_attr(xml: &[u8], element: &[u8], key: &[u8]) -> Result<Option<String>> {
    let mut reader = Reader::from_reader(Cursor::new(xml));
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if local_name(&e) == element {
                    return attr(&e, key);
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Ok(_) => {}
            Err(err) => return Err(anyhow!("failed to parse workbook: {}", err)),
        }
        buf.clear();
    }
}

fn parse_shared_strings(xml: &[u8]) -> Result<Vec<String>> {
    let mut reader = Reader::from_reader(Cursor::new(xml));
    reader.trim_text(false);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_text = false;
    // Phonetic runs (<rPh>) repeat the text as a reading and are skipped.
    let mut in_phonetic = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match local_name(&e) {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"rPh" => in_phonetic = true,
                b"t" if in_si && !in_phonetic => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if local_name(&e) == b"si" {
                    strings.push(String::new());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                b"rPh" => in_phonetic = false,
                b"t" => in_text = false,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_text {
                    current.push_str(&e.unescape()?);
                }
            }
            Ok(Event::CData(e)) => {
                if in_text {
                    current.push_str(&String::from_utf8_lossy(e.into_inner().as_ref()));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(anyhow!("failed to parse shared strings: {}", err)),
        }
        buf.clear();
    }
    Ok(strings)
}

#[derive(Default)]
struct CellState {
    column: usize,
    kind: Option<String>,
    value: String,
}

fn parse_sheet(xml: &[u8], shared: &[String]) -> Result<Vec<Vec<String>>> {
    let mut reader = Reader::from_reader(Cursor::new(xml));
    reader.trim_text(false);
    let mut buf = Vec::new();
    let mut rows: Vec<(usize, HashMap<usize, String>)> = Vec::new();
    let mut current_row: Option<(usize, HashMap<usize, String>)> = None;
    let mut cell: Option<CellState> = None;
    let mut in_value = false;
    let mut next_row = 1usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match local_name(&e) {
                b"row" => {
                    let index = row_index(&e)?.unwrap_or(next_row);
                    next_row = index + 1;
                    current_row = Some((index, HashMap::new()));
                }
                b"c" => {
                    let column = match attr(&e, b"r")? {
                        Some(reference) => column_index(&reference)?,
                        None => current_row
                            .as_ref()
                            .map(|(_, cells)| cells.keys().max().map_or(0, |max| max + 1))
                            .unwrap_or(0),
                    };
                    cell = Some(CellState {
                        column,
                        kind: attr(&e, b"t")?,
                        value: String::new(),
                    });
                }
                b"v" | b"t" => in_value = cell.is_some(),
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if local_name(&e) == b"row" {
                    let index = row_index(&e)?.unwrap_or(next_row);
                    next_row = index + 1;
                    rows.push((index, HashMap::new()));
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"row" => {
                    if let Some(row) = current_row.take() {
                        rows.push(row);
                    }
                }
                b"c" => {
                    if let (Some(state), Some((_, cells))) = (cell.take(), current_row.as_mut()) {
                        let value = cell_value(&state, shared)?;
                        cells.insert(state.column, value);
                    }
                }
                b"v" | b"t" => in_value = false,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_value {
                    if let Some(state) = cell.as_mut() {
                        state.value.push_str(&e.unescape()?);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(anyhow!("failed to parse worksheet: {}", err)),
        }
        buf.clear();
    }

    rows.sort_by_key(|(index, _)| *index);
    let mut grid = Vec::new();
    let mut expected = 1usize;
    for (index, cells) in rows {
        // Rows absent from the sheet are blank.
        while expected < index {
            grid.push(Vec::new());
            expected += 1;
        }
        let width = cells.keys().max().map_or(0, |max| max + 1);
        let mut row = vec![String::new(); width];
        for (column, value) in cells {
            row[column] = value;
        }
        grid.push(row);
        expected = index + 1;
    }
    Ok(grid)
}

fn cell_value(state: &CellState, shared: &[String]) -> Result<String> {
    match state.kind.as_deref() {
        Some("s") => {
            let index: usize = state
                .value
                .trim()
                .parse()
                .map_err(|_| anyhow!("invalid shared string index '{}'", state.value))?;
            shared
                .get(index)
                .cloned()
                .ok_or_else(|| anyhow!("shared string index out of range: {}", index))
        }
        Some("b") => Ok(if state.value.trim() == "1" {
            "TRUE".to_string()
        } else {
            "FALSE".to_string()
        }),
        _ => Ok(state.value.clone()),
    }
}

fn row_index(e: &BytesStart<'_>) -> Result<Option<usize>> {
    match attr(e, b"r")? {
        Some(value) => value
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| anyhow!("invalid row number '{}'", value)),
        None => Ok(None),
    }
}

/// Zero-based column of an `A1` style reference.
fn column_index(reference: &str) -> Result<usize> {
    let mut column = 0usize;
    let mut seen = false;
    for ch in reference.chars() {
        if ch.is_ascii_alphabetic() {
            column = column * 26 + (ch.to_ascii_uppercase() as usize - 'A' as usize + 1);
            seen = true;
        } else {
            break;
        }
    }
    if !seen {
        return Err(anyhow!("invalid cell reference '{}'", reference));
    }
    Ok(column - 1)
}

fn local_name<'a>(e: &'a BytesStart<'_>) -> &'a [u8] {
    let name = e.name().into_inner();
    match name.iter().position(|byte| *byte == b':') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attribute in e.attributes() {
        let attribute = attribute.map_err(|err| anyhow!("invalid xml attribute: {}", err))?;
        if attribute.key.as_ref() == key {
            let value = attribute
                .unescape_value()
                .map_err(|err| anyhow!("invalid xml attribute value: {}", err))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}
