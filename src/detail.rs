//! Section detail pages: title, meeting times, and the seats-by-program table.
//!
//! Nothing in here fails. A page that does not look like we expect yields
//! blank strings, zero counts, or no seat rows.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::models::{
    department_of, is_all_departments, program_name_for_code, ProgramPolicy, SectionRecord,
    SCHEDULE_NOT_INFORMED,
};

static H1: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").unwrap());
static H2: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h2").unwrap());
static TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").unwrap());
static TABLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table").unwrap());
static ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static DATA_CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").unwrap());
static ANY_CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("th, td").unwrap());
static HEADING_OR_TABLE: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(
        "h1, h2, h3, h4, h5, h6, strong, b, legend, caption, .panel-heading, .card-header, table",
    )
    .unwrap()
});

const CODE: &str = r"[A-Z]{3}\d{4,6}";

static TITLE_LABEL_FIRST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^(?i:turma)\s+(?P<label>\S+)\s+(?i:de)\s+(?P<code>{CODE})\s*[-–]\s*(?P<name>.+)$"
    ))
    .unwrap()
});
static TITLE_LABEL_LAST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^(?P<code>{CODE})\s*[-–]\s*(?P<name>.+?)\s*[-–]\s*(?i:turma)\s+(?P<label>\S+)$"
    ))
    .unwrap()
});
static TITLE_LABEL_PAREN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^(?P<code>{CODE})\s*[-–]?\s*(?P<name>.+?)\s*\((?i:turma)\s+(?P<label>[^)\s]+)\)$"
    ))
    .unwrap()
});
static CODE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\b({CODE})\b")).unwrap());
static TURMA_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bturma\s+([A-Za-z0-9]+)").unwrap());

static PROGRAM_EXACT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{3})\s*-\s*(.+)$").unwrap());
static PROGRAM_CODE_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{3})\b").unwrap());
static INTEGER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]+").unwrap());

const WEEKDAYS: &[(&str, &str)] = &[
    ("segunda", "Seg"),
    ("terça", "Ter"),
    ("terca", "Ter"),
    ("quarta", "Qua"),
    ("quinta", "Qui"),
    ("sexta", "Sex"),
    ("sábado", "Sáb"),
    ("sabado", "Sáb"),
    ("domingo", "Dom"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TitleParts {
    pub section_label: String,
    pub discipline_code: String,
    pub discipline_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionInfo {
    pub discipline_code: String,
    pub discipline_name: String,
    pub section_label: String,
    pub department: String,
    pub shift: String,
    pub schedule: String,
}

/// One decoded line of the seats-by-program table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeatRow {
    pub program_code: String,
    pub program_label: String,
    pub regular_seats: u32,
    pub entrance_exam_seats: u32,
    pub regular_enrolled: u32,
    pub entrance_exam_enrolled: u32,
    pub overflow_count: u32,
    pub candidate_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DetailPage {
    pub section: SectionInfo,
    pub seat_rows: Vec<SeatRow>,
}

/// Caller-side facts a detail page's records are stamped with.
pub struct RecordContext<'a> {
    pub period: &'a str,
    pub source_program: &'a str,
    pub requested_department: Option<&'a str>,
    pub policy: &'a ProgramPolicy,
    pub detail_url: &'a str,
}

pub fn parse_detail_page(html: &str) -> DetailPage {
    let document = Html::parse_document(html);

    let heading = primary_heading(&document).unwrap_or_default();
    let title = parse_title(&heading);
    if title.discipline_code.is_empty() {
        debug!(heading = %heading, "no discipline code in heading");
    }

    let section = SectionInfo {
        department: department_of(&title.discipline_code),
        discipline_code: title.discipline_code,
        discipline_name: title.discipline_name,
        section_label: title.section_label,
        shift: extract_shift(&document).unwrap_or_default(),
        schedule: extract_schedule(&document),
    };

    DetailPage {
        section,
        seat_rows: extract_seat_rows(&document),
    }
}

fn primary_heading(document: &Html) -> Option<String> {
    [&*H1, &*H2, &*TITLE].into_iter().find_map(|selector| {
        document
            .select(selector)
            .map(|el| collapse_whitespace(&el.text().collect::<String>()))
            .find(|text| !text.is_empty())
    })
}

/// Splits a heading into section label, discipline code, and discipline name.
pub fn parse_title(heading: &str) -> TitleParts {
    let heading = collapse_whitespace(heading);
    [&*TITLE_LABEL_FIRST, &*TITLE_LABEL_LAST, &*TITLE_LABEL_PAREN]
        .into_iter()
        .find_map(|pattern| title_from_pattern(pattern, &heading))
        .unwrap_or_else(|| title_from_separators(&heading))
}

fn title_from_pattern(pattern: &Regex, heading: &str) -> Option<TitleParts> {
    let caps = pattern.captures(heading)?;
    Some(TitleParts {
        section_label: caps["label"].trim().to_string(),
        discipline_code: caps["code"].to_string(),
        discipline_name: caps["name"].trim().to_string(),
    })
}

fn title_from_separators(heading: &str) -> TitleParts {
    let section_label = TURMA_TOKEN
        .captures(heading)
        .map(|caps| caps[1].to_string())
        .unwrap_or_default();

    let parts: Vec<&str> = heading
        .split(" - ")
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();

    let mut discipline_code = String::new();
    let mut discipline_name = String::new();

    if let Some((index, code)) = parts
        .iter()
        .enumerate()
        .find_map(|(i, part)| CODE_TOKEN.captures(part).map(|caps| (i, caps[1].to_string())))
    {
        let rest_of_part = parts[index]
            .split_once(code.as_str())
            .map(|(_, rest)| rest.trim())
            .unwrap_or("");
        discipline_name = if !rest_of_part.is_empty() && !TURMA_TOKEN.is_match(rest_of_part) {
            rest_of_part.to_string()
        } else {
            parts[index + 1..]
                .iter()
                .find(|part| !TURMA_TOKEN.is_match(part))
                .map(|part| part.to_string())
                .unwrap_or_default()
        };
        discipline_code = code;
    } else if let Some(name) = parts.iter().find(|part| !TURMA_TOKEN.is_match(part)) {
        discipline_name = name.to_string();
    }

    TitleParts {
        section_label,
        discipline_code,
        discipline_name,
    }
}

/// Reads "Turno: X" from the page text, whether X shares the text node or follows it.
fn extract_shift(document: &Html) -> Option<String> {
    let pieces: Vec<&str> = document
        .root_element()
        .text()
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect();

    let index = pieces
        .iter()
        .position(|piece| piece.to_lowercase().starts_with("turno"))?;
    let inline = pieces[index]
        .split_once(':')
        .map(|(_, value)| value.trim())
        .unwrap_or("");
    let value = if inline.is_empty() {
        pieces.get(index + 1).copied().unwrap_or("")
    } else {
        inline
    };
    let value = value.trim_start_matches(':').trim();
    (!value.is_empty()).then(|| collapse_whitespace(value))
}

fn weekday_abbreviation(header: &str) -> Option<&'static str> {
    let header = header.trim().to_lowercase();
    WEEKDAYS
        .iter()
        .find(|(name, _)| header.starts_with(name))
        .map(|(_, abbr)| *abbr)
}

/// Summarizes the weekday/time-slot table as "Seg 08:00-10:00; Qua 08:00-10:00".
pub fn extract_schedule(document: &Html) -> String {
    for table in document.select(&TABLE) {
        let mut rows = table.select(&ROW);
        let Some(header) = rows.next() else {
            continue;
        };
        let days: Vec<Option<&'static str>> = header
            .select(&ANY_CELL)
            .map(|cell| weekday_abbreviation(&cell.text().collect::<String>()))
            .collect();
        if days.iter().all(Option::is_none) {
            continue;
        }

        let mut slots = Vec::new();
        for row in rows {
            for (cell, day) in row.select(&ANY_CELL).zip(days.iter()) {
                let Some(day) = day else { continue };
                let text = collapse_whitespace(&cell.text().collect::<String>());
                if text.chars().any(|c| c.is_ascii_digit()) {
                    slots.push(format!("{} {}", day, text));
                }
            }
        }
        if !slots.is_empty() {
            return slots.join("; ");
        }
    }
    SCHEDULE_NOT_INFORMED.to_string()
}

type TableLocator = for<'a> fn(&'a Html) -> Option<ElementRef<'a>>;

/// Seat-table locators, most specific first.
const SEAT_TABLE_LOCATORS: [TableLocator; 2] = [seat_table_after_heading, seat_table_by_content];

pub fn extract_seat_rows(document: &Html) -> Vec<SeatRow> {
    let Some(table) = SEAT_TABLE_LOCATORS
        .iter()
        .find_map(|locate| locate(document))
    else {
        debug!("no seat table found");
        return Vec::new();
    };

    table
        .select(&ROW)
        .filter_map(|row| {
            let cells: Vec<String> = row
                .select(&DATA_CELL)
                .map(|cell| collapse_whitespace(&cell.text().collect::<String>()))
                .collect();
            if cells.len() < 4 {
                return None;
            }
            decode_seat_row(&cells)
        })
        .collect()
}

/// First table after a heading mentioning allocated seats ("vagas alocadas").
fn seat_table_after_heading(document: &Html) -> Option<ElementRef<'_>> {
    let mut armed = false;
    for element in document.select(&HEADING_OR_TABLE) {
        let is_table = element.value().name() == "table";
        if is_table && armed {
            return Some(element);
        }
        if is_table {
            continue;
        }

        let text = element.text().collect::<String>().to_lowercase();
        if text.contains("vagas") && text.contains("alocad") {
            if element.value().name() == "caption" {
                if let Some(table) = element.parent().and_then(ElementRef::wrap) {
                    return Some(table);
                }
            }
            armed = true;
        }
    }
    None
}

/// Innermost table whose text talks about seats and a regular or exam track.
fn seat_table_by_content(document: &Html) -> Option<ElementRef<'_>> {
    document.select(&TABLE).find(|table| {
        if has_nested_table(*table) {
            return false;
        }
        let text = table.text().collect::<String>().to_lowercase();
        text.contains("vagas") && (text.contains("reg") || text.contains("vestibular"))
    })
}

fn has_nested_table(table: ElementRef) -> bool {
    table
        .descendants()
        .skip(1)
        .filter_map(ElementRef::wrap)
        .any(|el| el.value().name() == "table")
}

/// Decodes one table row; `None` when the row does not carry seat figures.
pub fn decode_seat_row(cells: &[String]) -> Option<SeatRow> {
    let (first, rest) = cells.split_first()?;
    let (program_code, program_label) = decode_program(first)?;

    let numbers: Vec<u32> = rest
        .iter()
        .flat_map(|cell| INTEGER.find_iter(cell))
        // ASCII digits only, so a parse error means the value is too large
        .map(|m| m.as_str().parse::<u32>().unwrap_or(u32::MAX))
        .collect();
    if numbers.len() < 4 {
        return None;
    }

    Some(SeatRow {
        program_code,
        program_label,
        regular_seats: numbers[0],
        entrance_exam_seats: numbers[1],
        regular_enrolled: numbers[2],
        entrance_exam_enrolled: numbers[3],
        overflow_count: numbers.get(4).copied().unwrap_or(0),
        candidate_count: numbers.get(5).copied().unwrap_or(0),
    })
}

/// Returns (3-digit code, "code - name") for a program cell.
pub fn decode_program(cell: &str) -> Option<(String, String)> {
    let cell = collapse_whitespace(cell);
    if let Some(caps) = PROGRAM_EXACT.captures(&cell) {
        let code = caps[1].to_string();
        let label = format!("{} - {}", code, caps[2].trim());
        return Some((code, label));
    }

    let token = PROGRAM_CODE_TOKEN.find(&cell)?;
    let code = token.as_str().to_string();
    let trim = |text: &str| {
        text.trim_matches(|c: char| c.is_whitespace() || c == '-' || c == '–')
            .to_string()
    };
    let after = trim(&cell[token.end()..]);
    let before = trim(&cell[..token.start()]);
    let name = if !after.is_empty() {
        after
    } else if !before.is_empty() {
        before
    } else {
        program_name_for_code(&code)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Program {}", code))
    };
    Some((code.clone(), format!("{} - {}", code, name)))
}

/// Turns a parsed detail page into output records for one search context.
pub fn build_records(page: &DetailPage, ctx: &RecordContext) -> Vec<SectionRecord> {
    let section = &page.section;

    if let Some(wanted) = ctx.requested_department {
        if !is_all_departments(wanted) && !section.department.eq_ignore_ascii_case(wanted.trim()) {
            debug!(
                url = %ctx.detail_url,
                department = %section.department,
                wanted = %wanted,
                "section outside requested department"
            );
            return Vec::new();
        }
    }

    let base = SectionRecord {
        period: ctx.period.to_string(),
        department: section.department.clone(),
        discipline_code: section.discipline_code.clone(),
        discipline_name: section.discipline_name.clone(),
        section_label: section.section_label.clone(),
        shift: section.shift.clone(),
        schedule: section.schedule.clone(),
        source_program: ctx.source_program.to_string(),
        detail_url: ctx.detail_url.to_string(),
        ..Default::default()
    };

    if page.seat_rows.is_empty() {
        if ctx.policy.is_restricted() {
            return Vec::new();
        }
        let mut placeholder = SectionRecord {
            program_label: ctx.source_program.to_string(),
            ..base
        };
        placeholder.recompute_derived();
        return vec![placeholder];
    }

    page.seat_rows
        .iter()
        .filter(|row| ctx.policy.includes(&row.program_code))
        .map(|row| {
            let mut record = SectionRecord {
                program_label: row.program_label.clone(),
                regular_seats: row.regular_seats,
                entrance_exam_seats: row.entrance_exam_seats,
                regular_enrolled: row.regular_enrolled,
                entrance_exam_enrolled: row.entrance_exam_enrolled,
                overflow_count: row.overflow_count,
                candidate_count: row.candidate_count,
                ..base.clone()
            };
            record.recompute_derived();
            record.backfill_overflow();
            record
        })
        .collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
