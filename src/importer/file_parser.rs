// ==========================================
// 数据迁移导入引擎 - 文件解析器实现
// ==========================================
// 支持: CSV/TSV（分隔符嗅探）/ Excel (.xlsx 首个工作表)
// 编码: BOM → 调用方提示 → UTF-8 → Windows-1252 回退
// ==========================================

use crate::domain::record::SourceRow;
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::importer_trait::{FileParser, ParsedFile, RowParseError, RowResult};
use calamine::{Reader, Xlsx};
use csv::ReaderBuilder;
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

/// 候选分隔符
const DELIMITER_CANDIDATES: [u8; 4] = [b',', b';', b'\t', b'|'];

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const CFB_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0];

// ==========================================
// 编码处理
// ==========================================

/// 解码为 UTF-8 文本
///
/// # 返回
/// - (文本, 实际编码名)
pub fn decode_bytes<'a>(bytes: &'a [u8], encoding_hint: Option<&str>) -> (Cow<'a, str>, &'static str) {
    // BOM 优先
    if let Some((encoding, _bom_len)) = Encoding::for_bom(bytes) {
        let (text, actual, _) = encoding.decode(bytes);
        return (text, actual.name());
    }

    if let Some(hint) = encoding_hint {
        match Encoding::for_label(hint.trim().as_bytes()) {
            Some(encoding) => {
                let (text, actual, had_errors) = encoding.decode(bytes);
                if had_errors {
                    tracing::warn!(encoding = actual.name(), "按声明编码解码时出现非法字节，已替换");
                }
                return (text, actual.name());
            }
            None => tracing::warn!(hint = hint, "未识别的编码声明，按自动检测处理"),
        }
    }

    match std::str::from_utf8(bytes) {
        Ok(text) => (Cow::Borrowed(text), UTF_8.name()),
        Err(_) => {
            let (text, actual, _) = WINDOWS_1252.decode(bytes);
            (text, actual.name())
        }
    }
}

/// 解码为可被行流持有的 UTF-8 缓冲区
///
/// 原始内容已是完整 UTF-8（无 BOM、无需转码）时直接共享原缓冲区，否则持有转码结果
pub fn decode_shared(bytes: Arc<[u8]>, encoding_hint: Option<&str>) -> (Arc<[u8]>, &'static str) {
    let (text, encoding) = decode_bytes(&bytes, encoding_hint);
    let shared = match text {
        Cow::Borrowed(t) if t.len() == bytes.len() => Arc::clone(&bytes),
        other => Arc::from(other.into_owned().into_bytes()),
    };
    (shared, encoding)
}

/// 表头规范化: trim、空列命名、重复列加序号后缀
fn normalize_headers(raw: Vec<String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    raw.into_iter()
        .enumerate()
        .map(|(idx, h)| {
            let trimmed = h.trim().trim_start_matches('\u{feff}').to_string();
            let base = if trimmed.is_empty() {
                format!("column_{}", idx + 1)
            } else {
                trimmed
            };
            let count = seen.entry(base.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                base
            } else {
                format!("{}_{}", base, count)
            }
        })
        .collect()
}

/// 组装源行；列数与表头不一致视为畸形行
fn build_row(
    headers: &[String],
    values: Vec<String>,
    row_number: usize,
) -> Option<RowResult> {
    // 跳过完全空白的行
    if values.iter().all(|v| v.trim().is_empty()) {
        return None;
    }
    if values.len() != headers.len() {
        return Some(Err(RowParseError {
            row_number,
            message: format!("列数不一致: 期望 {}，实际 {}", headers.len(), values.len()),
        }));
    }
    let fields = headers
        .iter()
        .cloned()
        .zip(values.into_iter().map(|v| v.trim().to_string()))
        .collect();
    Some(Ok(SourceRow { row_number, fields }))
}

// ==========================================
// CSV Parser 实现
// ==========================================
pub struct CsvParser;

impl CsvParser {
    /// 根据首行嗅探分隔符（出现次数最多者，默认逗号）
    pub fn sniff_delimiter(text: &str) -> u8 {
        let header_line = text.lines().next().unwrap_or("");
        DELIMITER_CANDIDATES
            .iter()
            .copied()
            .map(|d| (d, header_line.bytes().filter(|b| *b == d).count()))
            .filter(|(_, count)| *count > 0)
            .max_by_key(|(_, count)| *count)
            .map(|(d, _)| d)
            .unwrap_or(b',')
    }
}

impl FileParser for CsvParser {
    fn format(&self) -> &'static str {
        "csv"
    }

    fn open(&self, bytes: Arc<[u8]>, encoding_hint: Option<&str>) -> ImportResult<ParsedFile> {
        let (data, encoding) = decode_shared(bytes, encoding_hint);

        let delimiter = {
            let text = std::str::from_utf8(&data).map_err(|e| {
                ImportError::UnsupportedFormat(format!("解码结果不是合法 UTF-8: {}", e))
            })?;

            // 文本中出现 NUL 说明是二进制内容
            if text.contains('\u{0}') {
                return Err(ImportError::UnsupportedFormat(
                    "内容不是可识别的文本表格".to_string(),
                ));
            }
            if text.trim().is_empty() {
                return Err(ImportError::EmptyInput("文件为空".to_string()));
            }
            Self::sniff_delimiter(text)
        };

        // 行流直接读取共享缓冲区
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .delimiter(delimiter)
            .flexible(true) // 允许行长度不一致，由 build_row 判定畸形行
            .from_reader(Cursor::new(data));

        let headers = normalize_headers(reader.headers()?.iter().map(|h| h.to_string()).collect());
        tracing::debug!(
            delimiter = %(delimiter as char).escape_default(),
            columns = headers.len(),
            "CSV 表头解析完成"
        );

        let row_headers = headers.clone();
        let rows = reader
            .into_records()
            .enumerate()
            .filter_map(move |(idx, result)| {
                let row_number = idx + 1;
                match result {
                    Ok(record) => build_row(
                        &row_headers,
                        record.iter().map(|v| v.to_string()).collect(),
                        row_number,
                    ),
                    Err(e) => Some(Err(RowParseError {
                        row_number,
                        message: e.to_string(),
                    })),
                }
            });

        Ok(ParsedFile {
            format: self.format(),
            encoding: encoding.to_string(),
            headers,
            rows: Box::new(rows),
        })
    }
}

// ==========================================
// Excel Parser 实现
// ==========================================
pub struct ExcelParser;

impl FileParser for ExcelParser {
    fn format(&self) -> &'static str {
        "xlsx"
    }

    fn open(&self, bytes: Arc<[u8]>, _encoding_hint: Option<&str>) -> ImportResult<ParsedFile> {
        let mut workbook = Xlsx::new(Cursor::new(bytes))?;

        // 读取第一个 sheet
        let sheet_names = workbook.sheet_names();
        let sheet_name = sheet_names
            .first()
            .cloned()
            .ok_or_else(|| ImportError::UnsupportedFormat("Excel 文件无工作表".to_string()))?;
        let range = workbook.worksheet_range(&sheet_name)?;

        let mut rows = range.rows();
        let header_row = rows
            .next()
            .ok_or_else(|| ImportError::EmptyInput("Excel 工作表为空".to_string()))?;
        let headers = normalize_headers(header_row.iter().map(|cell| cell.to_string()).collect());

        // 工作表已整体载入内存，这里只做一次性字符串化
        let data: Vec<Vec<String>> = rows
            .map(|r| r.iter().map(|cell| cell.to_string()).collect())
            .collect();

        let row_headers = headers.clone();
        let iter = data
            .into_iter()
            .enumerate()
            .filter_map(move |(idx, mut values)| {
                // 尾部空单元格不计入列数
                while values.len() > row_headers.len()
                    && values.last().map(|v| v.trim().is_empty()).unwrap_or(false)
                {
                    values.pop();
                }
                values.resize(values.len().max(row_headers.len()), String::new());
                build_row(&row_headers, values, idx + 1)
            });

        Ok(ParsedFile {
            format: self.format(),
            encoding: "binary".to_string(),
            headers,
            rows: Box::new(iter),
        })
    }
}

// ==========================================
// 通用文件解析器（扩展名优先，其次魔数）
// ==========================================
pub struct UniversalFileParser;

impl UniversalFileParser {
    /// 打开文件
    ///
    /// # 参数
    /// - file_name: 原始文件名或 blob key（用于扩展名判断）
    pub fn open(
        &self,
        file_name: &str,
        bytes: Arc<[u8]>,
        encoding_hint: Option<&str>,
    ) -> ImportResult<ParsedFile> {
        let parser = Self::select(file_name, &bytes)?;
        parser.open(bytes, encoding_hint)
    }

    fn select(file_name: &str, bytes: &[u8]) -> ImportResult<Box<dyn FileParser>> {
        let ext = std::path::Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match ext.as_str() {
            "csv" | "tsv" | "txt" => return Ok(Box::new(CsvParser)),
            "xlsx" => return Ok(Box::new(ExcelParser)),
            "" => {}
            other => {
                // 未知扩展名: 仅当魔数可识别时继续
                if !bytes.starts_with(ZIP_MAGIC) {
                    return Err(ImportError::UnsupportedFormat(format!(
                        "{}（仅支持 .csv/.tsv/.xlsx）",
                        other
                    )));
                }
            }
        }

        if bytes.starts_with(ZIP_MAGIC) {
            Ok(Box::new(ExcelParser))
        } else if bytes.starts_with(CFB_MAGIC) {
            Err(ImportError::UnsupportedFormat(
                "旧版 .xls 二进制格式（请另存为 .xlsx 或 .csv）".to_string(),
            ))
        } else {
            Ok(Box::new(CsvParser))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(bytes: &[u8]) -> Arc<[u8]> {
        Arc::from(bytes)
    }
    fn collect(parsed: ParsedFile) -> (Vec<SourceRow>, Vec<RowParseError>) {
        let mut ok = Vec::new();
        let mut err = Vec::new();
        for r in parsed.rows {
            match r {
                Ok(row) => ok.push(row),
                Err(e) => err.push(e),
            }
        }
        (ok, err)
    }

    #[test]
    fn test_csv_parser_valid_file() {
        let parsed = CsvParser
            .open(shared(b"Case_ID,Title\n1,Alpha\n2,Beta\n"), None)
            .unwrap();
        assert_eq!(parsed.headers, vec!["Case_ID", "Title"]);
        let (rows, errors) = collect(parsed);
        assert_eq!(rows.len(), 2);
        assert!(errors.is_empty());
        assert_eq!(rows[1].get("Title"), Some("Beta"));
        assert_eq!(rows[1].row_number, 2);
    }

    #[test]
    fn test_csv_skips_malformed_rows() {
        let parsed = CsvParser
            .open(shared(b"a,b,c\n1,2,3\n4,5\n\n7,8,9\n"), None)
            .unwrap();
        let (rows, errors) = collect(parsed);
        assert_eq!(rows.len(), 2);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].row_number, 2);
    }

    #[test]
    fn test_sniff_semicolon_and_tab() {
        assert_eq!(CsvParser::sniff_delimiter("a;b;c\n1;2;3"), b';');
        assert_eq!(CsvParser::sniff_delimiter("a\tb\n1\t2"), b'\t');
        assert_eq!(CsvParser::sniff_delimiter("single"), b',');
    }

    #[test]
    fn test_decode_bom_and_latin1_fallback() {
        let mut with_bom = vec![0xEF, 0xBB, 0xBF];
        with_bom.extend_from_slice(b"id\n1\n");
        let (text, enc) = decode_bytes(&with_bom, None);
        assert_eq!(enc, "UTF-8");
        assert!(text.starts_with("id"));

        // 0xE9 = 'é' in Windows-1252，非法 UTF-8
        let (text, enc) = decode_bytes(&[b'n', 0xE9, b'\n'], None);
        assert_eq!(enc, "windows-1252");
        assert_eq!(text, "n\u{e9}\n");

        let (text, enc) = decode_bytes(&[0xC4, 0xE3], Some("gbk"));
        assert_eq!(enc, "GBK");
        assert_eq!(text, "你");
    }

    #[test]
    fn test_duplicate_and_blank_headers() {
        let headers = normalize_headers(vec!["Name".into(), "Name".into(), " ".into()]);
        assert_eq!(headers, vec!["Name", "Name_2", "column_3"]);
    }

    #[test]
    fn test_universal_parser_format_selection() {
        let parser = UniversalFileParser;
        assert!(matches!(
            parser.open("data.pdf", shared(b"%PDF-1.4"), None),
            Err(ImportError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            parser.open("legacy.bin", shared(CFB_MAGIC), None),
            Err(ImportError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            parser.open("broken.xlsx", shared(b"not a zip"), None),
            Err(ImportError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            parser.open("empty.csv", shared(b""), None),
            Err(ImportError::EmptyInput(_))
        ));
        assert!(parser.open("noext", shared(b"a,b\n1,2\n"), None).is_ok());
    }

    #[test]
    fn test_utf8_input_shares_buffer_without_copy() {
        let original = shared(b"id,name\n1,Alpha\n");
        let (data, enc) = decode_shared(Arc::clone(&original), None);
        assert_eq!(enc, "UTF-8");
        assert!(Arc::ptr_eq(&original, &data));

        // 需要转码时持有转码结果
        let latin = shared(&[b'n', 0xE9, b'\n']);
        let (data, enc) = decode_shared(Arc::clone(&latin), None);
        assert_eq!(enc, "windows-1252");
        assert!(!Arc::ptr_eq(&latin, &data));
        assert_eq!(std::str::from_utf8(&data).unwrap(), "n\u{e9}\n");
    }
}
