use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};

use crate::types::{Currency, RateRecord};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Exchange rate table not found in document")]
    StructureNotFound,
}

// The site marks the bank rates table with a stable id/class pair; positions
// of the table on the page shift between layouts, the marker does not.
static ANCHOR_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("table#smTable, table.mfcur-table-sm-banks").expect("invalid anchor selector")
});
static TABLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table").expect("invalid table selector"));
static HEAD_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("thead").expect("invalid thead selector"));
static ROW_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("tbody tr").expect("invalid row selector"));
static CELL_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("td, th").expect("invalid cell selector"));

static RE_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d[\d\s.,']*").expect("invalid regex: number")
});

// Column offsets within a bank row: name, cash buy, (trend), cash sell,
// card buy, (trend), card sell, update time.
const COL_CASH_BUY: usize = 1;
const COL_CASH_SELL: usize = 3;
const COL_CARD_BUY: usize = 4;
const COL_CARD_SELL: usize = 6;

#[derive(Debug)]
pub struct ParsedTable {
    pub records: Vec<RateRecord>,
    /// Rows that looked like bank rows but failed numeric extraction.
    pub skipped_rows: usize,
}

/// Extract bank rate rows from a fetched page. Row-level problems are
/// absorbed and counted; only a missing table anchor is an error.
pub fn parse_rate_table(
    html: &str,
    currency: Currency,
    observed_at: NaiveDateTime,
) -> Result<ParsedTable, ParseError> {
    let document = Html::parse_document(html);
    let table = find_rate_table(&document).ok_or(ParseError::StructureNotFound)?;

    let mut records = Vec::new();
    let mut skipped_rows = 0usize;
    for row in table.select(&ROW_SEL) {
        let cells: Vec<String> = row
            .select(&CELL_SEL)
            .map(|cell| normalize_whitespace(&elem_text(cell)))
            .collect();
        // Filler rows (ads, separators) carry too few cells to be quotes.
        if cells.len() < 5 {
            continue;
        }
        match record_from_cells(&cells, currency, observed_at) {
            Some(record) => records.push(record),
            None => {
                skipped_rows += 1;
                log::warn!(
                    "Skipping unparseable {} row: {:?}",
                    currency,
                    cells.first().map(String::as_str).unwrap_or("")
                );
            }
        }
    }

    log::info!(
        "Extracted {} {} record(s), {} row(s) skipped",
        records.len(),
        currency,
        skipped_rows
    );
    Ok(ParsedTable {
        records,
        skipped_rows,
    })
}

fn find_rate_table<'a>(document: &'a Html) -> Option<ElementRef<'a>> {
    if let Some(table) = document.select(&ANCHOR_SEL).next() {
        return Some(table);
    }
    // Layout drift fallback: any table whose header names both sides of
    // a quote is accepted.
    document.select(&TABLE_SEL).find(|table| {
        let header = table
            .select(&HEAD_SEL)
            .next()
            .map(|h| elem_text(h).to_lowercase())
            .unwrap_or_default();
        header.contains("buy") && header.contains("sell")
    })
}

fn record_from_cells(
    cells: &[String],
    currency: Currency,
    observed_at: NaiveDateTime,
) -> Option<RateRecord> {
    let bank = cells.first()?.trim().to_string();
    if bank.is_empty() {
        return None;
    }

    let cash_buy = rate_cell(cells, COL_CASH_BUY)?;
    let cash_sell = rate_cell(cells, COL_CASH_SELL)?;
    let card_buy = rate_cell(cells, COL_CARD_BUY)?;
    let card_sell = rate_cell(cells, COL_CARD_SELL)?;

    // A bank row without a single usable number is noise, not a quote.
    if cash_buy.is_none() && cash_sell.is_none() && card_buy.is_none() && card_sell.is_none() {
        return None;
    }

    Some(RateRecord {
        bank,
        currency,
        cash_buy,
        cash_sell,
        card_buy,
        card_sell,
        observed_at,
    })
}

/// `Some(Some(rate))` for a parsed value, `Some(None)` for an absent cell
/// ("-" or empty), `None` when the cell holds unparseable garbage.
fn rate_cell(cells: &[String], idx: usize) -> Option<Option<Decimal>> {
    let Some(raw) = cells.get(idx) else {
        return Some(None);
    };
    let raw = raw.trim();
    if raw.is_empty() || raw == "-" || raw == "—" {
        return Some(None);
    }
    parse_rate(raw).map(Some)
}

/// Pull a decimal out of a rate cell, tolerating currency symbols, comma
/// decimal separators and thousands separators.
pub(crate) fn parse_rate(raw: &str) -> Option<Decimal> {
    let matched = RE_NUMBER.find(raw)?;
    let cleaned = normalize_number(matched.as_str());
    cleaned.parse::<Decimal>().ok()
}

fn normalize_number(s: &str) -> String {
    let s: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\'')
        .collect();
    match (s.rfind('.'), s.rfind(',')) {
        // Rightmost of the two is the decimal separator.
        (Some(dot), Some(comma)) if dot > comma => s.replace(',', ""),
        (Some(_), Some(_)) => s.replace('.', "").replace(',', "."),
        // A single comma is a locale decimal separator, several are
        // thousands separators.
        (None, Some(_)) if s.matches(',').count() == 1 => s.replace(',', "."),
        (None, Some(_)) => s.replace(',', ""),
        _ => s,
    }
}

fn elem_text(element: ElementRef) -> String {
    element.text().collect::<String>()
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 8, 24)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    fn bank_row(bank: &str, cells: [&str; 7]) -> String {
        let tds: String = cells.iter().map(|c| format!("<td>{c}</td>")).collect();
        format!("<tr><td>{bank}</td>{tds}</tr>")
    }

    fn rates_page(rows: &[String]) -> String {
        format!(
            r#"<html><body>
            <table><tbody><tr><td>unrelated sidebar table</td></tr></tbody></table>
            <table id="smTable" class="mfcur-table-sm-banks">
              <thead>
                <tr><th>Bank</th><th colspan="4">Cash</th><th colspan="3">Card</th></tr>
                <tr><th></th><th>Buy</th><th></th><th>Sell</th><th>Buy</th><th></th><th>Sell</th><th>Updated</th></tr>
              </thead>
              <tbody>{}</tbody>
            </table></body></html>"#,
            rows.concat()
        )
    }

    #[test]
    fn parses_anchored_table_rows() {
        let html = rates_page(&[
            bank_row("PrivatBank", ["27,10", "▲", "27,45", "27,15", "▼", "27,40", "14:02"]),
            bank_row("Oschadbank", ["27.05", "", "27.50", "-", "", "-", "13:55"]),
        ]);
        let parsed = parse_rate_table(&html, Currency::Usd, at()).expect("table should parse");

        assert_eq!(parsed.skipped_rows, 0);
        assert_eq!(parsed.records.len(), 2);

        let privat = &parsed.records[0];
        assert_eq!(privat.bank, "PrivatBank");
        assert_eq!(privat.currency, Currency::Usd);
        assert_eq!(privat.cash_buy, Some(dec!(27.10)));
        assert_eq!(privat.cash_sell, Some(dec!(27.45)));
        assert_eq!(privat.card_buy, Some(dec!(27.15)));
        assert_eq!(privat.card_sell, Some(dec!(27.40)));
        assert_eq!(privat.observed_at, at());

        let oschad = &parsed.records[1];
        assert_eq!(oschad.cash_buy, Some(dec!(27.05)));
        assert_eq!(oschad.card_buy, None);
        assert_eq!(oschad.card_sell, None);
    }

    #[test]
    fn malformed_row_is_skipped_and_counted() {
        let html = rates_page(&[
            bank_row("PrivatBank", ["27,10", "", "27,45", "", "", "", ""]),
            bank_row("Bank B", ["n/a", "", "garbage", "", "", "", ""]),
        ]);
        let parsed = parse_rate_table(&html, Currency::Usd, at()).expect("table should parse");

        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].bank, "PrivatBank");
        assert_eq!(parsed.skipped_rows, 1);
    }

    #[test]
    fn row_with_no_numbers_is_skipped() {
        let html = rates_page(&[bank_row("Empty Bank", ["-", "", "-", "-", "", "-", ""])]);
        let parsed = parse_rate_table(&html, Currency::Usd, at()).expect("table should parse");
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.skipped_rows, 1);
    }

    #[test]
    fn filler_rows_are_ignored_silently() {
        let html = rates_page(&[
            "<tr><td colspan=\"8\">advertisement</td></tr>".to_string(),
            bank_row("PrivatBank", ["27,10", "", "27,45", "", "", "", ""]),
        ]);
        let parsed = parse_rate_table(&html, Currency::Usd, at()).expect("table should parse");
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.skipped_rows, 0);
    }

    #[test]
    fn missing_anchor_is_structure_not_found() {
        let html = "<html><body><p>maintenance page</p></body></html>";
        let err = parse_rate_table(html, Currency::Usd, at()).unwrap_err();
        assert!(matches!(err, ParseError::StructureNotFound));
    }

    #[test]
    fn header_text_fallback_survives_anchor_drift() {
        // Same table, id and class renamed by a site redesign.
        let html = r#"<html><body><table class="rates-v2">
            <thead><tr><th>Bank</th><th>Buy</th><th></th><th>Sell</th><th>Buy</th><th></th><th>Sell</th></tr></thead>
            <tbody><tr><td>PrivatBank</td><td>41,10</td><td></td><td>41,60</td><td>-</td><td></td><td>-</td><td></td></tr></tbody>
            </table></body></html>"#;
        let parsed = parse_rate_table(html, Currency::Eur, at()).expect("fallback should find table");
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].cash_sell, Some(dec!(41.60)));
    }

    #[test]
    fn parse_rate_handles_locale_separators() {
        assert_eq!(parse_rate("27,35"), Some(dec!(27.35)));
        assert_eq!(parse_rate("27.35"), Some(dec!(27.35)));
        assert_eq!(parse_rate("1 027,35"), Some(dec!(1027.35)));
        assert_eq!(parse_rate("1,027.35"), Some(dec!(1027.35)));
        assert_eq!(parse_rate("1.027,35"), Some(dec!(1027.35)));
        assert_eq!(parse_rate("1'027.35"), Some(dec!(1027.35)));
        assert_eq!(parse_rate("1,234,567"), Some(dec!(1234567)));
    }

    #[test]
    fn parse_rate_strips_noise() {
        assert_eq!(parse_rate("27.35 ₴"), Some(dec!(27.35)));
        assert_eq!(parse_rate("UAH 27,35"), Some(dec!(27.35)));
        assert_eq!(parse_rate(" 27,35 "), Some(dec!(27.35)));
    }

    #[test]
    fn parse_rate_rejects_garbage() {
        assert_eq!(parse_rate("n/a"), None);
        assert_eq!(parse_rate("—"), None);
        assert_eq!(parse_rate(""), None);
    }
}
