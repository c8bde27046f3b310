//! Core domain model for the ouvidoria reconciliation pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "ouvi-core";

/// Canonical (already normalized) column names shared by source and sink.
pub mod columns {
    pub const PROTOCOL: &str = "protocolo";
    pub const CREATION_DATE: &str = "data_da_criacao";
    pub const CONCLUSION_DATE: &str = "data_da_conclusao";
    pub const STATUS: &str = "status_demanda";
    pub const DEADLINE: &str = "prazo_restante";
    pub const RESOLUTION_DAYS: &str = "tempo_de_resolucao_em_dias";
    pub const THEME: &str = "tema";
    pub const SUBJECT: &str = "assunto";
    pub const DEPARTMENTS: &str = "orgaos";
    pub const RESPONSIBLE: &str = "responsavel";
    pub const AGENT: &str = "servidor";
    pub const REGISTRATION_UNIT: &str = "unidade_cadastro";
    pub const HEALTH_UNIT: &str = "unidade_saude";
    pub const DESCRIPTION: &str = "descricao";

    /// Columns the sink accepts on append, in sink order.
    pub const SINK_COLUMNS: &[&str] = &[
        PROTOCOL,
        CREATION_DATE,
        STATUS,
        DEADLINE,
        CONCLUSION_DATE,
        RESOLUTION_DAYS,
        "prioridade",
        "tipo_de_manifestacao",
        THEME,
        SUBJECT,
        "canal",
        "endereco",
        REGISTRATION_UNIT,
        HEALTH_UNIT,
        "status",
        AGENT,
        RESPONSIBLE,
        DEPARTMENTS,
        "verificado",
    ];

    /// Columns that must never be targeted by a patch call.
    pub const PATCH_FORBIDDEN: &[&str] = &[REGISTRATION_UNIT];
}

/// Normalize a raw header into the canonical column-name form: ASCII
/// lower-case, every non-alphanumeric run collapsed to a single underscore.
///
/// All field rules address columns by this normalized name, so the function
/// is part of the pipeline contract and must stay idempotent.
pub fn normalize_column_name(raw: &str) -> String {
    let ascii: String = raw
        .nfkd()
        .filter(|c| c.is_ascii())
        .collect::<String>()
        .to_ascii_lowercase();

    let mut out = String::with_capacity(ascii.len());
    let mut last_underscore = true;
    for c in ascii.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    out.trim_matches('_').to_string()
}

/// A column-named tabular snapshot as returned by the record source or sink.
///
/// String representations are preserved verbatim; no implicit numeric or
/// date coercion happens before the field rules run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SheetTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl SheetTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Return the same table with canonicalized column names.
    pub fn with_normalized_columns(mut self) -> Self {
        self.columns = self
            .columns
            .iter()
            .map(|c| normalize_column_name(c))
            .collect();
        self
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx).map(String::as_str)
    }
}

/// One case record. Every field except `protocol` is optional; columns the
/// model does not govern ride along in `extras` so sink schema drift does
/// not drop data.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CaseRecord {
    pub protocol: String,
    pub creation_date: Option<String>,
    pub conclusion_date: Option<String>,
    pub status: Option<String>,
    pub remaining_deadline: Option<String>,
    pub resolution_time_days: Option<String>,
    pub theme: Option<String>,
    pub subject: Option<String>,
    pub departments: Option<String>,
    pub responsible_party: Option<String>,
    pub assigned_agent: Option<String>,
    pub registration_unit: Option<String>,
    pub health_unit: Option<String>,
    pub extras: BTreeMap<String, String>,
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl CaseRecord {
    /// Build a record from one row of a table with normalized column names.
    pub fn from_row(columns: &[String], row: &[String]) -> Self {
        let mut record = CaseRecord::default();
        for (idx, name) in columns.iter().enumerate() {
            let Some(value) = row.get(idx) else { continue };
            match name.as_str() {
                columns::PROTOCOL => record.protocol = value.trim().to_string(),
                columns::CREATION_DATE => record.creation_date = non_blank(value),
                columns::CONCLUSION_DATE => record.conclusion_date = non_blank(value),
                columns::STATUS => record.status = non_blank(value),
                columns::DEADLINE => record.remaining_deadline = non_blank(value),
                columns::RESOLUTION_DAYS => record.resolution_time_days = non_blank(value),
                columns::THEME => record.theme = non_blank(value),
                columns::SUBJECT => record.subject = non_blank(value),
                columns::DEPARTMENTS => record.departments = non_blank(value),
                columns::RESPONSIBLE => record.responsible_party = non_blank(value),
                columns::AGENT => record.assigned_agent = non_blank(value),
                columns::REGISTRATION_UNIT => record.registration_unit = non_blank(value),
                columns::HEALTH_UNIT => record.health_unit = non_blank(value),
                other => {
                    if !value.trim().is_empty() {
                        record.extras.insert(other.to_string(), value.clone());
                    }
                }
            }
        }
        record
    }

    /// Render the record as one row following the given sink column order.
    /// Columns the record does not carry come out as empty strings.
    pub fn to_row(&self, sink_columns: &[String]) -> Vec<String> {
        sink_columns
            .iter()
            .map(|name| self.column_value(name).unwrap_or_default())
            .collect()
    }

    fn column_value(&self, name: &str) -> Option<String> {
        let owned = |v: &Option<String>| v.clone();
        match name {
            columns::PROTOCOL => Some(self.protocol.clone()),
            columns::CREATION_DATE => owned(&self.creation_date),
            columns::CONCLUSION_DATE => owned(&self.conclusion_date),
            columns::STATUS => owned(&self.status),
            columns::DEADLINE => owned(&self.remaining_deadline),
            columns::RESOLUTION_DAYS => owned(&self.resolution_time_days),
            columns::THEME => owned(&self.theme),
            columns::SUBJECT => owned(&self.subject),
            columns::DEPARTMENTS => owned(&self.departments),
            columns::RESPONSIBLE => owned(&self.responsible_party),
            columns::AGENT => owned(&self.assigned_agent),
            columns::REGISTRATION_UNIT => owned(&self.registration_unit),
            columns::HEALTH_UNIT => owned(&self.health_unit),
            other => self.extras.get(other).cloned(),
        }
    }

    pub fn exception_value(&self, field: ExceptionField) -> Option<&str> {
        match field {
            ExceptionField::Status => self.status.as_deref(),
            ExceptionField::ConclusionDate => self.conclusion_date.as_deref(),
            ExceptionField::ResolutionDays => self.resolution_time_days.as_deref(),
            ExceptionField::RemainingDeadline => self.remaining_deadline.as_deref(),
        }
    }
}


/// The small set of mutable fields re-reconciled on every run after a record
/// was first ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExceptionField {
    Status,
    ConclusionDate,
    ResolutionDays,
    RemainingDeadline,
}

impl ExceptionField {
    pub const ALL: &'static [ExceptionField] = &[
        ExceptionField::Status,
        ExceptionField::ConclusionDate,
        ExceptionField::ResolutionDays,
        ExceptionField::RemainingDeadline,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            ExceptionField::Status => columns::STATUS,
            ExceptionField::ConclusionDate => columns::CONCLUSION_DATE,
            ExceptionField::ResolutionDays => columns::RESOLUTION_DAYS,
            ExceptionField::RemainingDeadline => columns::DEADLINE,
        }
    }
}

/// Protocol keys are compared trimmed and upper-cased on both sides.
pub fn normalize_protocol(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Structural validity check for protocol identifiers: non-empty, at least
/// one digit, and only characters seen in real protocol codes.
pub fn protocol_is_well_formed(raw: &str) -> bool {
    let trimmed = raw.trim();
    !trimmed.is_empty()
        && trimmed.chars().any(|c| c.is_ascii_digit())
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
}

/// Deterministic fallback key for rows whose protocol fails the structural
/// check. Hashing the content fields keeps the identity stable across runs;
/// an upstream edit to any of them makes the row look new, which is an
/// accepted limitation of the heuristic.
pub fn synthetic_protocol(creation_date: &str, subject: &str, description: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(creation_date.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(subject.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(description.trim().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("SYN-{}", &digest[..16].to_uppercase())
}
