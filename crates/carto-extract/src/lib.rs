//! Locates and extracts the data-bearing table from a ScanSante result page.

use carto_core::RawTable;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

pub const CRATE_NAME: &str = "carto-extract";

/// Result pages embed layout tables next to the data grid; the data grid is
/// the first table whose header row has more than this many columns. This is
/// a documented heuristic, not a guaranteed invariant: a page-layout change
/// that breaks it is a compatibility risk, not something to paper over.
pub const MIN_HEADER_COLUMNS: usize = 4;

/// Below this many body rows the table is kept but flagged low-confidence.
pub const MIN_CONFIDENT_ROWS: usize = 3;

const TABLE_SELECTOR: &str = "table.tableau";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("no qualifying data table found in document")]
    StructureNotRecognized,
}

/// Classification of a successfully parsed page. `Empty` and `Minimal` are
/// expected outcomes over inactive zones, distinct from extraction failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Populated(RawTable),
    Minimal(RawTable),
    Empty,
}

/// Scans every styled table in the document, takes the first one whose header
/// row qualifies, and classifies it by body-row count.
pub fn extract(html: &str) -> Result<Extraction, ExtractError> {
    let document = Html::parse_document(html);
    let table_selector = Selector::parse(TABLE_SELECTOR).expect("static selector");
    let row_selector = Selector::parse("tr").expect("static selector");
    let cell_selector = Selector::parse("th, td").expect("static selector");

    for table in document.select(&table_selector) {
        let mut rows = table.select(&row_selector);
        let Some(header_row) = rows.next() else {
            continue;
        };
        let headers: Vec<String> = header_row
            .select(&cell_selector)
            .map(cell_text)
            .collect();
        if headers.len() < MIN_HEADER_COLUMNS {
            continue;
        }

        let body: Vec<Vec<String>> = rows
            .map(|row| {
                let mut cells: Vec<String> =
                    row.select(&cell_selector).map(cell_text).collect();
                // Keep row arity equal to the header arity.
                cells.resize(headers.len(), String::new());
                cells
            })
            .collect();

        if body.is_empty() {
            return Ok(Extraction::Empty);
        }
        let table = RawTable {
            headers,
            rows: body,
        };
        if table.row_count() < MIN_CONFIDENT_ROWS {
            return Ok(Extraction::Minimal(table));
        }
        return Ok(Extraction::Populated(table));
    }

    Err(ExtractError::StructureNotRecognized)
}

/// Trims, collapses internal whitespace runs, and strips embedded line breaks
/// (including those introduced by `<br>` markup in headers).
fn cell_text(cell: ElementRef<'_>) -> String {
    let joined: String = cell.text().collect::<Vec<_>>().join(" ");
    joined.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(tables: &str) -> String {
        format!("<!doctype html><html><body><div id=\"contenu\">{tables}</div></body></html>")
    }

    fn data_table(body_rows: usize) -> String {
        let mut rows = String::new();
        for i in 0..body_rows {
            rows.push_str(&format!(
                "<tr><td>75000{i:04}</td><td>CH {i}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                i * 10,
                i * 3,
                i
            ));
        }
        format!(
            "<table class=\"tableau\"><tr>\
             <th>Finess</th><th>Raison sociale</th>\
             <th>Nombre de<br/>séjours/séances total</th>\
             <th>Nombre de séances</th><th>Part (%)</th></tr>{rows}</table>"
        )
    }

    #[test]
    fn populated_table_yields_all_headers_and_rows() {
        let extraction = extract(&page(&data_table(4))).expect("extraction");
        let Extraction::Populated(table) = extraction else {
            panic!("expected populated, got {extraction:?}");
        };
        assert_eq!(table.column_count(), 5);
        assert_eq!(table.row_count(), 4);
        assert_eq!(table.headers[0], "Finess");
        // <br/> markup collapses to a single space.
        assert_eq!(table.headers[2], "Nombre de séjours/séances total");
    }

    #[test]
    fn header_only_table_is_an_empty_zone() {
        let extraction = extract(&page(&data_table(0))).expect("extraction");
        assert_eq!(extraction, Extraction::Empty);
    }

    #[test]
    fn sparse_table_is_minimal_but_kept() {
        let extraction = extract(&page(&data_table(2))).expect("extraction");
        let Extraction::Minimal(table) = extraction else {
            panic!("expected minimal, got {extraction:?}");
        };
        assert_eq!(table.row_count(), 2);
    }

    #[test]
    fn narrow_layout_tables_are_skipped_in_favor_of_the_data_grid() {
        let layout = "<table class=\"tableau\"><tr><th>Menu</th><th>Aide</th></tr>\
                      <tr><td>a</td><td>b</td></tr></table>";
        let html = page(&format!("{layout}{}", data_table(4)));
        let Extraction::Populated(table) = extract(&html).expect("extraction") else {
            panic!("expected populated");
        };
        assert_eq!(table.column_count(), 5);
        assert_eq!(table.headers[0], "Finess");
    }

    #[test]
    fn unstyled_or_missing_tables_are_a_structural_failure() {
        let err = extract(&page("<p>Aucun résultat</p>")).unwrap_err();
        assert_eq!(err, ExtractError::StructureNotRecognized);

        let unstyled = "<table><tr><th>a</th><th>b</th><th>c</th><th>d</th><th>e</th></tr>\
                        <tr><td>1</td><td>2</td><td>3</td><td>4</td><td>5</td></tr></table>";
        let err = extract(&page(unstyled)).unwrap_err();
        assert_eq!(err, ExtractError::StructureNotRecognized);
    }

    #[test]
    fn cell_text_is_trimmed_and_whitespace_collapsed() {
        let html = page(
            "<table class=\"tableau\"><tr><th> A </th><th>B</th><th>C</th><th>D</th></tr>\
             <tr><td>  750 000 001 </td><td>CH\n de \n Test</td><td>1</td><td>2</td></tr>\
             <tr><td>x</td><td>y</td><td>z</td><td>w</td></tr>\
             <tr><td>x</td><td>y</td><td>z</td><td>w</td></tr></table>",
        );
        let Extraction::Populated(table) = extract(&html).expect("extraction") else {
            panic!("expected populated");
        };
        assert_eq!(table.headers[0], "A");
        assert_eq!(table.rows[0][0], "750 000 001");
        assert_eq!(table.rows[0][1], "CH de Test");
    }

    #[test]
    fn short_rows_are_padded_to_header_arity() {
        let html = page(
            "<table class=\"tableau\"><tr><th>A</th><th>B</th><th>C</th><th>D</th></tr>\
             <tr><td>1</td><td>2</td></tr>\
             <tr><td>1</td><td>2</td><td>3</td><td>4</td></tr>\
             <tr><td>1</td><td>2</td><td>3</td><td>4</td></tr></table>",
        );
        let Extraction::Populated(table) = extract(&html).expect("extraction") else {
            panic!("expected populated");
        };
        assert!(table.rows.iter().all(|r| r.len() == 4));
    }
}
