use crate::models::SectionRecord;
use anyhow::Result;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const CSV_FILE: &str = "vagas.csv";
pub const SUMMARY_FILE: &str = "resumo.txt";

/// Seat totals for one (period, source program) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub period: String,
    pub program: String,
    pub rows: usize,
    pub rows_with_available: usize,
    pub total_seats: u32,
    pub total_available: u32,
    pub occupancy_percent: f64,
}

/// "20252" -> "2025.2"; anything not shaped like a period is returned as is.
pub fn format_period(period: &str) -> String {
    if period.len() == 5 && period.chars().all(|c| c.is_ascii_digit()) {
        format!("{}.{}", &period[..4], &period[4..])
    } else {
        period.to_string()
    }
}

pub fn write_csv<W: Write>(records: &[SectionRecord], writer: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);

    writer.write_record([
        "Período",
        "Departamento",
        "Código",
        "Disciplina",
        "Turma",
        "Turno",
        "Horário",
        "Curso Pesquisado",
        "Curso",
        "Vagas Regulares",
        "Vagas Vestibular",
        "Inscritos Regulares",
        "Inscritos Vestibular",
        "Excedentes",
        "Candidatos",
        "Disponíveis Regulares",
        "Disponíveis Vestibular",
        "Vagas Totais",
        "Inscritos Totais",
        "Vagas Disponíveis",
        "Link",
    ])?;

    for record in records {
        writer.write_record([
            format_period(&record.period),
            record.department.clone(),
            record.discipline_code.clone(),
            record.discipline_name.clone(),
            record.section_label.clone(),
            record.shift.clone(),
            record.schedule.clone(),
            record.source_program.clone(),
            record.program_label.clone(),
            record.regular_seats.to_string(),
            record.entrance_exam_seats.to_string(),
            record.regular_enrolled.to_string(),
            record.entrance_exam_enrolled.to_string(),
            record.overflow_count.to_string(),
            record.candidate_count.to_string(),
            record.regular_available.to_string(),
            record.exam_available.to_string(),
            record.total_seats.to_string(),
            record.total_enrolled.to_string(),
            record.total_available.to_string(),
            record.detail_url.clone(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

pub fn summarize(records: &[SectionRecord]) -> Vec<SummaryRow> {
    let mut groups: BTreeMap<(&str, &str), Vec<&SectionRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry((record.period.as_str(), record.source_program.as_str()))
            .or_default()
            .push(record);
    }

    groups
        .into_iter()
        .map(|((period, program), group)| {
            let total_seats: u32 = group.iter().map(|r| r.total_seats).sum();
            let total_available: u32 = group.iter().map(|r| r.total_available).sum();
            let occupancy_percent = if total_seats > 0 {
                (1.0 - total_available as f64 / total_seats as f64) * 100.0
            } else {
                0.0
            };
            SummaryRow {
                period: period.to_string(),
                program: program.to_string(),
                rows: group.len(),
                rows_with_available: group.iter().filter(|r| r.total_available > 0).count(),
                total_seats,
                total_available,
                occupancy_percent,
            }
        })
        .collect()
}

pub fn render_summary(summary: &[SummaryRow]) -> String {
    let mut content = String::new();
    content.push_str("Seat Availability Summary\n");
    content.push_str("=========================\n\n");

    if summary.is_empty() {
        content.push_str("No sections found.\n");
        return content;
    }

    for row in summary {
        content.push_str(&format!(
            "Period: {}\n\
            Program: {}\n\
            Section rows: {}\n\
            Rows with available seats: {}\n\
            Total seats: {}\n\
            Available seats: {}\n\
            Occupancy: {:.1}%\n\n",
            format_period(&row.period),
            row.program,
            row.rows,
            row.rows_with_available,
            row.total_seats,
            row.total_available,
            row.occupancy_percent,
        ));
    }
    content
}

/// Writes the CSV export and the text summary; returns their paths.
pub fn write_reports(records: &[SectionRecord], output_dir: &str) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(output_dir)?;

    let csv_path = Path::new(output_dir).join(CSV_FILE);
    write_csv(records, fs::File::create(&csv_path)?)?;

    let summary_path = Path::new(output_dir).join(SUMMARY_FILE);
    fs::write(&summary_path, render_summary(&summarize(records)))?;

    Ok((csv_path, summary_path))
}
