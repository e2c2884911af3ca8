//! Reference statement importer for CSV exports of Dutch banks.
//!
//! Expects a header row. Columns are found by name (English or Dutch), the
//! delimiter is `;` when the header contains one and `,` otherwise. Amounts
//! accept `1234.56`, `1.234,56` and `1,234.56`. Dates accept `YYYY-MM-DD`,
//! `DD-MM-YYYY` and `YYYYMMDD`. A line is a duplicate when an earlier import
//! of the same client already held it.

use crate::collaborators::{ImportFile, ImportReport, ImportRowError, ImportService, ImportedRow};
use crate::error::WorkflowError;
use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const DATE_HEADERS: &[&str] = &["date", "datum", "booking_date", "boekdatum"];
const AMOUNT_HEADERS: &[&str] = &["amount", "bedrag"];
const DESCRIPTION_HEADERS: &[&str] = &["description", "omschrijving", "mededelingen"];
const COUNTERPARTY_HEADERS: &[&str] = &[
    "counterparty",
    "naam",
    "tegenpartij",
    "naam tegenpartij",
    "naam / omschrijving",
];
const IBAN_HEADERS: &[&str] = &["iban", "counterparty_iban", "tegenrekening", "iban tegenrekening"];
const REFERENCE_HEADERS: &[&str] = &["reference", "referentie", "kenmerk", "betalingskenmerk"];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d-%m-%Y", "%Y%m%d", "%d/%m/%Y"];

#[derive(Debug, Default)]
pub struct CsvImportService {
    /// Fingerprints of lines already imported, per client.
    seen: DashMap<Uuid, HashSet<String>>,
}

struct Columns {
    date: usize,
    amount: usize,
    description: Option<usize>,
    counterparty: Option<usize>,
    iban: Option<usize>,
    reference: Option<usize>,
}

impl Columns {
    fn locate(headers: &csv::StringRecord) -> Result<Self, WorkflowError> {
        let find = |names: &[&str]| {
            headers
                .iter()
                .position(|h| names.iter().any(|n| h.trim().eq_ignore_ascii_case(n)))
        };

        Ok(Self {
            date: find(DATE_HEADERS).ok_or_else(|| {
                WorkflowError::InvalidRequest("statement has no date column".to_string())
            })?,
            amount: find(AMOUNT_HEADERS).ok_or_else(|| {
                WorkflowError::InvalidRequest("statement has no amount column".to_string())
            })?,
            description: find(DESCRIPTION_HEADERS),
            counterparty: find(COUNTERPARTY_HEADERS),
            iban: find(IBAN_HEADERS),
            reference: find(REFERENCE_HEADERS),
        })
    }
}

impl CsvImportService {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_row(
        record: &csv::StringRecord,
        columns: &Columns,
        account_iban: Option<&str>,
    ) -> Result<ImportedRow, String> {
        let field = |idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let raw_date = field(Some(columns.date)).ok_or("missing date")?;
        let booking_date = parse_date(&raw_date).ok_or_else(|| format!("unreadable date '{}'", raw_date))?;

        let raw_amount = field(Some(columns.amount)).ok_or("missing amount")?;
        let amount =
            parse_amount(&raw_amount).ok_or_else(|| format!("unreadable amount '{}'", raw_amount))?;

        Ok(ImportedRow {
            booking_date,
            amount,
            description: field(columns.description).unwrap_or_default(),
            counterparty_name: field(columns.counterparty),
            counterparty_iban: field(columns.iban).map(|iban| iban.replace(' ', "").to_uppercase()),
            reference: field(columns.reference),
            account_iban: account_iban.map(str::to_string),
        })
    }
}

/// Duplicate-detection key; identity is assigned separately on import.
pub fn fingerprint(row: &ImportedRow) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}|{}|{}|{}|{}|{}",
        row.booking_date,
        row.amount.normalize(),
        row.description.to_lowercase(),
        row.counterparty_iban.as_deref().unwrap_or_default(),
        row.reference.as_deref().unwrap_or_default(),
        row.account_iban.as_deref().unwrap_or_default(),
    ));
    format!("{:x}", hasher.finalize())
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw.trim(), format).ok())
}

/// Reads `1234.56`, `1.234,56` and `1,234.56`. With both separators present
/// the last one is the decimal mark. A separator that repeats groups
/// thousands. Anything else is unreadable.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches('€')
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cleaned.strip_prefix('+').unwrap_or(&cleaned)),
    };

    let (decimal_mark, group_mark) = separators(digits);
    let (whole, fraction) = match decimal_mark {
        Some(mark) => {
            let (whole, fraction) = digits.rsplit_once(mark)?;
            if whole.contains(mark) || !is_digits(fraction) {
                return None;
            }
            (whole, Some(fraction))
        }
        None => (digits, None),
    };
    let whole = match group_mark {
        Some(mark) => ungroup(whole, mark)?,
        None if is_digits(whole) => whole.to_string(),
        None => return None,
    };

    let mut normalized = String::with_capacity(digits.len() + 1);
    if negative {
        normalized.push('-');
    }
    normalized.push_str(&whole);
    if let Some(fraction) = fraction {
        normalized.push('.');
        normalized.push_str(fraction);
    }
    Decimal::from_str(&normalized).ok()
}

/// Decimal mark and thousands separator of an unsigned amount.
fn separators(digits: &str) -> (Option<char>, Option<char>) {
    let single = |mark: char| {
        if digits.matches(mark).count() == 1 {
            (Some(mark), None)
        } else {
            (None, Some(mark))
        }
    };
    match (digits.rfind('.'), digits.rfind(',')) {
        (Some(dot), Some(comma)) if dot > comma => (Some('.'), Some(',')),
        (Some(_), Some(_)) => (Some(','), Some('.')),
        (Some(_), None) => single('.'),
        (None, Some(_)) => single(','),
        (None, None) => (None, None),
    }
}

/// `1.234.567` -> `1234567`; groups after the first hold exactly three digits.
fn ungroup(whole: &str, mark: char) -> Option<String> {
    let mut groups = whole.split(mark);
    let first = groups.next()?;
    if first.len() > 3 || !is_digits(first) {
        return None;
    }
    let mut ungrouped = first.to_string();
    for group in groups {
        if group.len() != 3 || !is_digits(group) {
            return None;
        }
        ungrouped.push_str(group);
    }
    Some(ungrouped)
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

#[async_trait]
impl ImportService for CsvImportService {
    #[instrument(skip(self, file), fields(client_id = %client_id, file_name = %file.file_name))]
    async fn import_file(
        &self,
        client_id: Uuid,
        file: ImportFile,
        iban_hint: Option<String>,
        bank_name_hint: Option<String>,
    ) -> Result<ImportReport, WorkflowError> {
        let text = String::from_utf8(file.content)
            .map_err(|_| WorkflowError::InvalidRequest("statement is not valid UTF-8".to_string()))?;
        let text = text.trim_start_matches('\u{feff}');

        let header_line = text
            .lines()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| WorkflowError::InvalidRequest("statement is empty".to_string()))?;
        let delimiter = if header_line.contains(';') { b';' } else { b',' };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());

        let headers = reader
            .headers()
            .map_err(|e| WorkflowError::InvalidRequest(format!("unreadable header: {}", e)))?
            .clone();
        let columns = Columns::locate(&headers)?;
        let account_iban = iban_hint
            .as_deref()
            .map(|iban| iban.replace(' ', "").to_uppercase());

        let mut seen = self.seen.entry(client_id).or_default();
        // Identical lines within one file are separate bookings
        let mut fresh = Vec::new();
        let mut rows = Vec::new();
        let mut errors = Vec::new();
        let mut skipped = 0;

        for (idx, record) in reader.records().enumerate() {
            // Header is line 1
            let line = idx + 2;
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    errors.push(ImportRowError {
                        line,
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            if record.iter().all(|f| f.trim().is_empty()) {
                continue;
            }

            match Self::parse_row(&record, &columns, account_iban.as_deref()) {
                Ok(row) => {
                    let key = fingerprint(&row);
                    if seen.contains(&key) {
                        skipped += 1;
                    } else {
                        fresh.push(key);
                        rows.push(row);
                    }
                }
                Err(message) => errors.push(ImportRowError { line, message }),
            }
        }
        seen.extend(fresh);
        drop(seen);

        if !errors.is_empty() {
            warn!(error_count = errors.len(), "Statement lines rejected");
        }
        info!(
            bank = bank_name_hint.as_deref().unwrap_or("unknown"),
            imported = rows.len(),
            skipped_duplicates = skipped,
            "Statement parsed"
        );

        Ok(ImportReport {
            imported_count: rows.len(),
            skipped_duplicates_count: skipped,
            errors,
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(content: &str) -> ImportFile {
        ImportFile {
            file_name: "export.csv".to_string(),
            content: content.as_bytes().to_vec(),
        }
    }

    #[test]
    fn parses_dutch_amounts() {
        assert_eq!(parse_amount("-1.234,56"), Some(Decimal::new(-123456, 2)));
        assert_eq!(parse_amount("120.00"), Some(Decimal::new(12000, 2)));
        assert_eq!(parse_amount("€ 15,5"), Some(Decimal::new(155, 1)));
        assert_eq!(parse_amount("twaalf"), None);
    }

    #[test]
    fn last_separator_is_the_decimal_mark() {
        let expected = Some(Decimal::new(123456, 2));
        assert_eq!(parse_amount("1,234.56"), expected);
        assert_eq!(parse_amount("1.234,56"), expected);
        assert_eq!(parse_amount("+1 234,56"), expected);
        assert_eq!(parse_amount("1.234.567"), Some(Decimal::new(1234567, 0)));
        assert_eq!(parse_amount("1,234,567.5"), Some(Decimal::new(12345675, 1)));
        assert_eq!(parse_amount("-0,5"), Some(Decimal::new(-5, 1)));
    }

    #[test]
    fn ambiguous_amounts_are_unreadable() {
        for raw in ["1,23.4,5", "1,23.45", "12.34.56", "1.234,5,6", "1234,", ",50", "--5", "1e3"] {
            assert_eq!(parse_amount(raw), None, "{}", raw);
        }
    }

    #[test]
    fn parses_bank_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 15);
        assert_eq!(parse_date("2024-03-15"), expected);
        assert_eq!(parse_date("15-03-2024"), expected);
        assert_eq!(parse_date("20240315"), expected);
        assert_eq!(parse_date("March 15"), None);
    }

    #[tokio::test]
    async fn imports_semicolon_export_with_dutch_headers() {
        let service = CsvImportService::new();
        let report = service
            .import_file(
                Uuid::new_v4(),
                file("Datum;Bedrag;Omschrijving;Naam;Tegenrekening;Kenmerk\n\
                      2024-03-01;-120,00;Huur werkplek;Spaces BV;NL91 ABNA 0417 1643 00;R-77\n\
                      2024-03-02;605,00;Factuur 2024-017;Klant BV;;2024-017\n"),
                Some("nl02 rabo 0123 4567 89".to_string()),
                Some("Rabobank".to_string()),
            )
            .await
            .unwrap();

        assert_eq!(report.imported_count, 2);
        assert!(report.errors.is_empty());
        let first = &report.rows[0];
        assert_eq!(first.amount, Decimal::new(-12000, 2));
        assert_eq!(first.counterparty_name.as_deref(), Some("Spaces BV"));
        assert_eq!(first.counterparty_iban.as_deref(), Some("NL91ABNA0417164300"));
        assert_eq!(first.account_iban.as_deref(), Some("NL02RABO0123456789"));
        assert_eq!(report.rows[1].counterparty_iban, None);
    }

    #[tokio::test]
    async fn bad_lines_are_reported_not_imported() {
        let service = CsvImportService::new();
        let report = service
            .import_file(
                Uuid::new_v4(),
                file("date,amount,description\n2024-03-01,-5.00,ok\nnot-a-date,1.00,bad\n2024-03-02,,empty\n"),
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(report.imported_count, 1);
        let lines: Vec<usize> = report.errors.iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![3, 4]);
    }

    #[tokio::test]
    async fn imports_comma_export_with_thousands_separators() {
        let service = CsvImportService::new();
        let report = service
            .import_file(
                Uuid::new_v4(),
                file("date,amount,description\n\
                      2024-03-01,\"-1,234.56\",rent\n\
                      2024-03-02,\"1,23.4,5\",garbled\n"),
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(report.imported_count, 1);
        assert_eq!(report.rows[0].amount, Decimal::new(-123456, 2));
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].line, 3);
        assert!(report.errors[0].message.contains("1,23.4,5"));
    }

    #[tokio::test]
    async fn identical_lines_within_one_file_are_kept() {
        let service = CsvImportService::new();
        let client = Uuid::new_v4();
        let content = "date,amount,description\n\
                       2024-03-01,-2.50,parking\n\
                       2024-03-01,-2.50,parking\n";

        let first = service.import_file(client, file(content), None, None).await.unwrap();
        let again = service.import_file(client, file(content), None, None).await.unwrap();

        assert_eq!(first.imported_count, 2);
        assert_eq!(first.skipped_duplicates_count, 0);
        assert_eq!(again.imported_count, 0);
        assert_eq!(again.skipped_duplicates_count, 2);
    }

    #[tokio::test]
    async fn missing_amount_column_rejects_file() {
        let service = CsvImportService::new();
        let err = service
            .import_file(Uuid::new_v4(), file("date,description\n2024-03-01,x\n"), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }

    #[tokio::test]
    async fn duplicates_are_tracked_per_client() {
        let service = CsvImportService::new();
        let client = Uuid::new_v4();
        let content = "date,amount,description\n2024-03-01,-5.00,coffee\n";

        let first = service.import_file(client, file(content), None, None).await.unwrap();
        let again = service.import_file(client, file(content), None, None).await.unwrap();
        let other = service
            .import_file(Uuid::new_v4(), file(content), None, None)
            .await
            .unwrap();

        assert_eq!(first.imported_count, 1);
        assert_eq!(again.imported_count, 0);
        assert_eq!(again.skipped_duplicates_count, 1);
        assert_eq!(other.imported_count, 1);
    }
}
