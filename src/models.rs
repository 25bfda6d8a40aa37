use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const DEFAULT_BASE_URL: &str = "https://app.uff.br/graduacao/quadrodehorarios/";

/// Sentinel meaning "no department filter".
pub const ALL_DEPARTMENTS: &str = "ALL";

/// Value stored in `schedule` when the detail page has no meeting times.
pub const SCHEDULE_NOT_INFORMED: &str = "Não informado";

/// Programs that can originate a search: (name, search id).
/// The 3-digit program code used in seat tables is the id zero-padded.
pub const PROGRAM_CATALOG: &[(&str, &str)] = &[("Química", "28"), ("Química Industrial", "29")];

pub const KNOWN_DEPARTMENTS: &[&str] = &[
    "GQI", "GFI", "MAF", "GEC", "GEO", "GEA", "GFB", "GCN", "GCO", "GMN", "GPR", "FIS", "BIO",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub periods: Vec<String>,
    pub programs: Vec<String>,
    pub departments: Vec<String>,
    pub discipline_code: Option<String>,
    #[serde(default)]
    pub show_all_programs: bool,
    #[serde(default)]
    pub restrict_to_selected_programs: bool,
    pub base_url: Option<String>,
    pub output_directory: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            periods: vec!["20252".to_string()],
            programs: vec!["Química".to_string(), "Química Industrial".to_string()],
            departments: vec![ALL_DEPARTMENTS.to_string()],
            discipline_code: None,
            show_all_programs: false,
            restrict_to_selected_programs: false,
            base_url: Some(DEFAULT_BASE_URL.to_string()),
            output_directory: Some("output".to_string()),
        }
    }
}

impl Config {
    pub fn load_from_file(file_path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(file_path)
            .with_context(|| format!("Failed to read config: {}", file_path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid config: {}", file_path))?;
        Ok(config)
    }

    pub fn save_to_file(&self, file_path: &str) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(file_path, content)?;
        Ok(())
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    /// Normalizes periods ("2025.2" -> "20252") and departments (upper case,
    /// "TODOS" -> "ALL"), and rejects inputs a query cannot be built from.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        if self.periods.is_empty() {
            bail!("at least one period must be selected");
        }
        if self.programs.is_empty() {
            bail!("at least one program must be selected");
        }

        for period in self.periods.iter_mut() {
            let compact = period.trim().replace('.', "");
            if compact.len() != 5 || !compact.chars().all(|c| c.is_ascii_digit()) {
                bail!("invalid period '{}', expected YYYYS or YYYY.S", period);
            }
            *period = compact;
        }

        if self.departments.is_empty() {
            self.departments.push(ALL_DEPARTMENTS.to_string());
        }
        for department in self.departments.iter_mut() {
            let upper = department.trim().to_uppercase();
            if is_all_departments(&upper) {
                *department = ALL_DEPARTMENTS.to_string();
            } else if upper.len() == 3 && upper.chars().all(|c| c.is_ascii_alphabetic()) {
                *department = upper;
            } else {
                bail!("invalid department '{}', expected 3 letters or ALL", department);
            }
        }

        if let Some(code) = &self.discipline_code {
            let code = code.trim().to_uppercase();
            self.discipline_code = if code.is_empty() { None } else { Some(code) };
        }

        Ok(())
    }

    pub fn program_policy(&self) -> ProgramPolicy {
        ProgramPolicy::from_flags(
            self.show_all_programs,
            self.restrict_to_selected_programs,
            &self.programs,
        )
    }
}

/// Which seat-allocation rows of a detail page turn into records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramPolicy {
    /// Every row, overriding any restriction.
    ShowAll,
    /// Only rows whose 3-digit program code is in the set.
    RestrictToSelected(BTreeSet<String>),
    /// Every row; sections without a seat table still get a placeholder.
    Unfiltered,
}

impl ProgramPolicy {
    pub fn from_flags(show_all: bool, restrict: bool, programs: &[String]) -> Self {
        if show_all {
            ProgramPolicy::ShowAll
        } else if restrict {
            let codes = programs
                .iter()
                .filter_map(|name| program_id(name))
                .map(pad_program_code)
                .collect();
            ProgramPolicy::RestrictToSelected(codes)
        } else {
            ProgramPolicy::Unfiltered
        }
    }

    pub fn includes(&self, program_code: &str) -> bool {
        match self {
            ProgramPolicy::ShowAll => true,
            ProgramPolicy::RestrictToSelected(codes) => {
                codes.contains(&pad_program_code(program_code))
            }
            ProgramPolicy::Unfiltered => true,
        }
    }

    pub fn is_restricted(&self) -> bool {
        matches!(self, ProgramPolicy::RestrictToSelected(_))
    }
}

/// One output row: a section's seat block for one program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionRecord {
    pub period: String,
    pub department: String,
    pub discipline_code: String,
    pub discipline_name: String,
    pub section_label: String,
    pub shift: String,
    pub schedule: String,
    pub source_program: String,
    pub program_label: String,
    pub regular_seats: u32,
    pub entrance_exam_seats: u32,
    pub regular_enrolled: u32,
    pub entrance_exam_enrolled: u32,
    pub overflow_count: u32,
    pub candidate_count: u32,
    pub regular_available: u32,
    pub exam_available: u32,
    pub total_seats: u32,
    pub total_enrolled: u32,
    pub total_available: u32,
    pub detail_url: String,
}

impl SectionRecord {
    /// Recomputes the per-track and total figures from the four raw counts.
    pub fn recompute_derived(&mut self) {
        self.regular_available = self.regular_seats.saturating_sub(self.regular_enrolled);
        self.exam_available = self
            .entrance_exam_seats
            .saturating_sub(self.entrance_exam_enrolled);
        self.total_seats = self.regular_seats.saturating_add(self.entrance_exam_seats);
        self.total_enrolled = self
            .regular_enrolled
            .saturating_add(self.entrance_exam_enrolled);
        self.total_available = self.regular_available.saturating_add(self.exam_available);
    }

    /// Fills a missing overflow count from the candidate tally. Records that
    /// already carry an overflow count are left alone.
    pub fn backfill_overflow(&mut self) {
        if self.overflow_count == 0
            && self.candidate_count > 0
            && self.regular_seats > 0
            && self.candidate_count > self.regular_seats
        {
            self.overflow_count = self.candidate_count - self.regular_seats;
        }
    }

    /// Identity within one search combination.
    pub fn batch_key(&self) -> (String, String, String) {
        (
            self.discipline_code.clone(),
            self.section_label.clone(),
            self.program_label.clone(),
        )
    }

    /// Identity across the whole run.
    pub fn run_key(&self) -> (String, String, String, String) {
        (
            self.discipline_code.clone(),
            self.section_label.clone(),
            self.program_label.clone(),
            self.period.clone(),
        )
    }
}

pub fn is_all_departments(department: &str) -> bool {
    let department = department.trim();
    department.is_empty()
        || department.eq_ignore_ascii_case(ALL_DEPARTMENTS)
        || department.eq_ignore_ascii_case("TODOS")
}

/// First three characters of a discipline code, or empty when too short.
pub fn department_of(discipline_code: &str) -> String {
    if discipline_code.chars().count() >= 3 {
        discipline_code.chars().take(3).collect()
    } else {
        String::new()
    }
}

pub fn program_id(name: &str) -> Option<&'static str> {
    PROGRAM_CATALOG
        .iter()
        .find(|(known, _)| *known == name.trim())
        .map(|(_, id)| *id)
}

pub fn program_name_for_code(code: &str) -> Option<&'static str> {
    let code = pad_program_code(code);
    PROGRAM_CATALOG
        .iter()
        .find(|(_, id)| pad_program_code(id) == code)
        .map(|(name, _)| *name)
}

pub fn pad_program_code(code: &str) -> String {
    format!("{:0>3}", code.trim())
}
