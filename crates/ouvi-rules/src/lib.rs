//! Field canonicalization rules and the per-record transformer pipeline.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use ouvi_core::{CaseRecord, ExceptionField};
use serde::Deserialize;
use tracing::warn;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "ouvi-rules";

/// Canonical sentinel for a case without a conclusion date.
pub const NOT_CONCLUDED: &str = "Não concluído";
/// Canonical deadline text for a concluded case.
pub const DEADLINE_CONCLUDED: &str = "Demanda Concluída";
/// Controlled status vocabulary.
pub const STATUS_CONCLUDED: &str = "CONCLUÍDA";
pub const STATUS_IN_PROGRESS: &str = "EM ANDAMENTO";
/// Substitution for a health-unit cell carrying "no information".
pub const NOT_A_HEALTH_UNIT: &str = "Não é uma Unidade de Saúde";

/// Output pattern every successfully resolved date converges to.
pub const CANONICAL_DATE_FORMAT: &str = "%d/%m/%Y";

// ---------------------------------------------------------------------------
// Text canonicalizer
// ---------------------------------------------------------------------------

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn mojibake_markers(s: &str) -> usize {
    s.chars()
        .filter(|c| matches!(c, 'Ã' | 'Â' | '\u{FFFD}'))
        .count()
}

fn accented_chars(s: &str) -> usize {
    s.chars()
        .filter(|c| "áéíóúâêôãõàçÁÉÍÓÚÂÊÔÃÕÀÇ".contains(*c))
        .count()
}

fn encode_cp1252_byte(c: char) -> Option<u8> {
    // The 0x80..0x9F window where CP1252 departs from Latin-1.
    let b = match c {
        '\u{20AC}' => 0x80,
        '\u{201A}' => 0x82,
        '\u{0192}' => 0x83,
        '\u{201E}' => 0x84,
        '\u{2026}' => 0x85,
        '\u{2020}' => 0x86,
        '\u{2021}' => 0x87,
        '\u{02C6}' => 0x88,
        '\u{2030}' => 0x89,
        '\u{0160}' => 0x8A,
        '\u{2039}' => 0x8B,
        '\u{0152}' => 0x8C,
        '\u{017D}' => 0x8E,
        '\u{2018}' => 0x91,
        '\u{2019}' => 0x92,
        '\u{201C}' => 0x93,
        '\u{201D}' => 0x94,
        '\u{2022}' => 0x95,
        '\u{2013}' => 0x96,
        '\u{2014}' => 0x97,
        '\u{02DC}' => 0x98,
        '\u{2122}' => 0x99,
        '\u{0161}' => 0x9A,
        '\u{203A}' => 0x9B,
        '\u{0153}' => 0x9C,
        '\u{017E}' => 0x9E,
        '\u{0178}' => 0x9F,
        c if (c as u32) <= 0xFF => c as u8,
        _ => return None,
    };
    Some(b)
}

/// Undo one layer of "UTF-8 read as Latin-1/CP1252": re-encode each char as
/// the single byte it came from and decode the byte string as UTF-8 again.
fn redecode_as(s: &str, cp1252: bool) -> Option<String> {
    let mut bytes = Vec::with_capacity(s.len());
    for c in s.chars() {
        let b = if cp1252 {
            encode_cp1252_byte(c)?
        } else if (c as u32) <= 0xFF {
            c as u8
        } else {
            return None;
        };
        bytes.push(b);
    }
    String::from_utf8(bytes).ok()
}

fn best_mojibake_candidate(s: &str) -> String {
    let mut best = s.to_string();
    let mut best_key = (-(mojibake_markers(s) as i64), accented_chars(s) as i64);
    for candidate in [redecode_as(s, false), redecode_as(s, true)].into_iter().flatten() {
        let key = (
            -(mojibake_markers(&candidate) as i64),
            accented_chars(&candidate) as i64,
        );
        if key > best_key {
            best_key = key;
            best = candidate;
        }
    }
    best
}

/// ASCII-case-insensitive replacement of every occurrence of `needle`.
fn replace_ignore_case(haystack: &str, needle: &str, replacement: &str) -> String {
    let chars: Vec<char> = haystack.chars().collect();
    let pattern: Vec<char> = needle.chars().map(|c| c.to_ascii_lowercase()).collect();
    if pattern.is_empty() || chars.len() < pattern.len() {
        return haystack.to_string();
    }

    let mut out = String::with_capacity(haystack.len());
    let mut i = 0;
    while i < chars.len() {
        let window = chars.get(i..i + pattern.len());
        let matched = window.is_some_and(|w| {
            w.iter()
                .zip(&pattern)
                .all(|(a, b)| a.to_ascii_lowercase() == *b)
        });
        if matched {
            out.push_str(replacement);
            i += pattern.len();
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

/// Clean a scalar for storage: whitespace variants collapsed, zero-width
/// characters dropped, single-layer mis-decoding repaired, NFC-composed.
/// Degrades to a best-effort string, never fails, and only returns an empty
/// string for empty input.
pub fn canon_text(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let mut s: String = raw
        .replace("&nbsp;", " ")
        .chars()
        .filter(|c| !matches!(c, '\u{200B}'..='\u{200D}' | '\u{2060}' | '\u{FEFF}'))
        .map(|c| match c {
            '\u{00A0}' | '\u{2000}'..='\u{200A}' | '\u{202F}' | '\u{205F}' | '\u{3000}' => ' ',
            other => other,
        })
        .collect();

    if mojibake_markers(&s) > 0 {
        s = best_mojibake_candidate(&s);
    }

    // Recurrent corruption of the single most frequent accented word.
    s = replace_ignore_case(&s, "sa??de", "Saúde");
    s = replace_ignore_case(&s, "sa\u{FFFD}de", "Saúde");

    let composed: String = s.nfc().collect();
    collapse_whitespace(&composed)
}

/// Comparison-key form: accents stripped, lower-cased, whitespace collapsed.
/// Never used for stored values, only for matching.
pub fn compare_key(raw: &str) -> String {
    let stripped: String = raw.nfd().filter(|c| !is_combining_mark(*c)).collect();
    collapse_whitespace(&stripped.to_lowercase())
}

/// First letter upper-cased, everything after lower-cased.
pub fn capitalize_first(raw: &str) -> String {
    let lower = raw.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => lower,
    }
}

fn letters_only_key(raw: &str) -> String {
    let stripped: String = raw.nfd().filter(|c| !is_combining_mark(*c)).collect();
    let spaced: String = stripped
        .chars()
        .map(|c| if c.is_alphabetic() { c } else { ' ' })
        .collect();
    collapse_whitespace(&spaced.to_lowercase())
}

/// Status cell denotes completion, tolerant of accents and punctuation.
pub fn is_concluded_status(raw: &str) -> bool {
    letters_only_key(raw) == "concluida"
}

/// Deadline cell already says "Demanda Concluída", tolerant of replacement
/// characters standing in for the corrupted "í".
pub fn looks_like_deadline_concluded(raw: &str) -> bool {
    let stripped: String = raw
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| if c == '\u{FFFD}' || c == '?' { 'i' } else { c })
        .collect();

    let mut collapsed = String::with_capacity(stripped.len());
    let mut prev_i = false;
    for c in stripped.to_lowercase().chars() {
        if c == 'i' {
            if prev_i {
                continue;
            }
            prev_i = true;
        } else {
            prev_i = false;
        }
        collapsed.push(c);
    }

    letters_only_key(&collapsed) == "demanda concluida"
}

/// The "no data available" placeholder that must become a blank cell.
pub fn is_no_data(raw: &str) -> bool {
    compare_key(raw) == "nao ha dados"
}

// ---------------------------------------------------------------------------
// Date resolver
// ---------------------------------------------------------------------------

/// Result of one pass through the parser cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateOutcome {
    /// Null or blank input.
    Blank,
    /// A calendar day was resolved.
    Day(NaiveDate),
    /// Nothing matched; the original text is carried so loss stays visible.
    Unparsed(String),
}

const EXPLICIT_DATETIME_FORMATS: &[&str] = &[
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d/%m/%y %H:%M:%S",
    "%d/%m/%y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

const EXPLICIT_DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%d/%m/%y", "%Y-%m-%d"];

const DAY_FIRST_FALLBACK_FORMATS: &[&str] = &["%d-%m-%Y", "%d.%m.%Y", "%d-%m-%y", "%d.%m.%y"];

fn strip_time_decorations(raw: &str) -> String {
    let mut s = raw.trim().replace('T', " ");
    if s.ends_with('Z') {
        s.pop();
    }
    if let Some(stripped) = s.strip_suffix(" UTC") {
        s = stripped.to_string();
    }
    // Offsets are only stripped when a time component is present, so bare
    // ISO dates keep their day part intact.
    if s.contains(':') {
        for (pos, c) in s.char_indices().rev() {
            if c == '+' || c == '-' {
                let tail = &s[pos + 1..];
                let digits: String = tail.chars().filter(|c| *c != ':').collect();
                if !digits.is_empty()
                    && digits.len() <= 4
                    && digits.chars().all(|c| c.is_ascii_digit())
                {
                    s.truncate(pos);
                }
                break;
            }
            if !c.is_ascii_digit() && c != ':' {
                break;
            }
        }
    }
    s.trim().to_string()
}

fn is_iso_prefixed(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 10
        && b[..4].iter().all(u8::is_ascii_digit)
        && b[4] == b'-'
        && b[5..7].iter().all(u8::is_ascii_digit)
        && b[7] == b'-'
        && b[8..10].iter().all(u8::is_ascii_digit)
}

fn digits_with_optional_fraction(s: &str, digit_len: std::ops::RangeInclusive<usize>) -> bool {
    let (whole, fraction) = match s.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (s, None),
    };
    digit_len.contains(&whole.len())
        && whole.chars().all(|c| c.is_ascii_digit())
        && fraction.is_none_or(|f| !f.is_empty() && f.chars().all(|c| c.is_ascii_digit()))
}

fn spreadsheet_serial_to_date(s: &str) -> Option<NaiveDate> {
    let days = s.parse::<f64>().ok()?;
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    base.checked_add_signed(Duration::days(days.trunc() as i64))
}

fn epoch_millis_to_date(s: &str) -> Option<NaiveDate> {
    let millis = s.parse::<i64>().ok()?;
    chrono::DateTime::from_timestamp_millis(millis).map(|dt| dt.date_naive())
}

fn epoch_seconds_to_date(s: &str) -> Option<NaiveDate> {
    let secs = s.parse::<f64>().ok()?;
    chrono::DateTime::from_timestamp(secs.trunc() as i64, 0).map(|dt| dt.date_naive())
}

fn parse_with_formats(s: &str) -> Option<NaiveDate> {
    for fmt in EXPLICIT_DATETIME_FORMATS {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }
    for fmt in EXPLICIT_DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    None
}

fn parse_day_first_fallback(s: &str) -> Option<NaiveDate> {
    for fmt in DAY_FIRST_FALLBACK_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    None
}

/// Cascading resolver for dates of unknown provenance. Strategies are tried
/// in a fixed order and the first match wins; ambiguity between day and
/// month is always broken day-first.
pub fn resolve_date(raw: &str) -> DateOutcome {
    if raw.trim().is_empty() {
        return DateOutcome::Blank;
    }
    let s = strip_time_decorations(raw);
    if s.is_empty() {
        return DateOutcome::Blank;
    }

    if is_iso_prefixed(&s) {
        if let Ok(day) = NaiveDate::parse_from_str(&s[..10], "%Y-%m-%d") {
            return DateOutcome::Day(day);
        }
        return DateOutcome::Unparsed(raw.trim().to_string());
    }

    if digits_with_optional_fraction(&s, 5..=6) {
        if let Some(day) = spreadsheet_serial_to_date(&s) {
            return DateOutcome::Day(day);
        }
    }

    if s.len() == 13 && s.chars().all(|c| c.is_ascii_digit()) {
        if let Some(day) = epoch_millis_to_date(&s) {
            return DateOutcome::Day(day);
        }
    }

    if digits_with_optional_fraction(&s, 10..=10) {
        if let Some(day) = epoch_seconds_to_date(&s) {
            return DateOutcome::Day(day);
        }
    }

    if let Some(day) = parse_with_formats(&s) {
        return DateOutcome::Day(day);
    }
    if let Some(day) = parse_day_first_fallback(&s) {
        return DateOutcome::Day(day);
    }

    DateOutcome::Unparsed(raw.trim().to_string())
}

/// Canonical text for a date cell: blank stays `None`, resolved days become
/// `DD/MM/YYYY`, unparseable input passes through unchanged.
pub fn canonical_date(raw: &str) -> Option<String> {
    match resolve_date(raw) {
        DateOutcome::Blank => None,
        DateOutcome::Day(day) => Some(day.format(CANONICAL_DATE_FORMAT).to_string()),
        DateOutcome::Unparsed(original) => Some(original),
    }
}

const NOT_CONCLUDED_TOKENS: &[&str] = &[
    "nao informado",
    "na",
    "n/a",
    "n\\a",
    "nan",
    "null",
    "none",
    "",
    "-",
    "--",
    "outro",
    "outros",
    "nat",
    "sem informacao",
];

/// Strict conclusion-date canonicalization: a fixed token set means
/// "explicitly not concluded" and maps to the sentinel rather than being
/// fed to the parser cascade.
pub fn canon_conclusion_date(raw: &str) -> String {
    let key = compare_key(raw.trim());
    if NOT_CONCLUDED_TOKENS.contains(&key.as_str()) {
        return NOT_CONCLUDED.to_string();
    }
    match resolve_date(raw) {
        DateOutcome::Blank => NOT_CONCLUDED.to_string(),
        DateOutcome::Day(day) => day.format(CANONICAL_DATE_FORMAT).to_string(),
        DateOutcome::Unparsed(original) => original,
    }
}

// ---------------------------------------------------------------------------
// Exception-field canonicalizers (shared by pipeline and delta comparison)
// ---------------------------------------------------------------------------

/// Collapse a status cell into the controlled vocabulary.
pub fn canon_status(raw: &str) -> String {
    if is_concluded_status(raw) {
        STATUS_CONCLUDED.to_string()
    } else if raw.trim().is_empty() {
        String::new()
    } else {
        STATUS_IN_PROGRESS.to_string()
    }
}

/// Resolution time in days: the "no data" placeholder goes blank, a numeric
/// zero is floored to one day, anything else is kept as cleaned text.
pub fn canon_resolution_days(raw: &str) -> String {
    let cleaned = canon_text(raw);
    if cleaned.is_empty() || is_no_data(&cleaned) {
        return String::new();
    }
    if let Ok(value) = cleaned.parse::<f64>() {
        if value == 0.0 {
            return "1".to_string();
        }
    }
    cleaned
}

/// Remaining-deadline cell independent of status (the status override is a
/// pipeline rule, not a cell property).
pub fn canon_deadline(raw: &str) -> String {
    let cleaned = canon_text(raw);
    if cleaned.is_empty() {
        return cleaned;
    }
    if looks_like_deadline_concluded(&cleaned) {
        DEADLINE_CONCLUDED.to_string()
    } else {
        cleaned
    }
}

/// One canonicalizer per exception field; both sides of every delta
/// comparison go through this same function.
pub fn canon_exception(field: ExceptionField, raw: &str) -> String {
    match field {
        ExceptionField::Status => canon_status(raw),
        ExceptionField::ConclusionDate => canon_conclusion_date(raw),
        ExceptionField::ResolutionDays => canon_resolution_days(raw),
        ExceptionField::RemainingDeadline => canon_deadline(raw),
    }
}

// ---------------------------------------------------------------------------
// Rule tables (declarative YAML, versioned separately from the code)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct DepartmentsFile {
    #[allow(dead_code)]
    version: u32,
    default_department: String,
    #[serde(default)]
    themes: Vec<DepartmentEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct DepartmentEntry {
    theme: String,
    department: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AliasesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    aliases: Vec<AliasEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct AliasEntry {
    from: String,
    to: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OverridesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    overrides: Vec<OverrideEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct OverrideEntry {
    match_key: String,
    replace_with: String,
}

/// The static business-rule tables: theme → department, agent aliases, and
/// responsible-party overrides.
#[derive(Debug, Clone)]
pub struct RuleSet {
    departments: HashMap<String, String>,
    default_department: String,
    agent_aliases: HashMap<String, String>,
    responsible_overrides: HashMap<String, String>,
}

impl RuleSet {
    /// Load the three rule tables from `<root>/rules/`.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let rules_dir = root.join("rules");
        let departments: DepartmentsFile = read_yaml(&rules_dir.join("departments.yaml"))?;
        let aliases: AliasesFile = read_yaml(&rules_dir.join("agent_aliases.yaml"))?;
        let overrides: OverridesFile = read_yaml(&rules_dir.join("responsible_overrides.yaml"))?;
        Ok(Self::from_parts(departments, aliases, overrides))
    }

    /// The rule tables shipped with the repository, for runs without an
    /// external `rules/` directory.
    pub fn builtin() -> Result<Self> {
        let departments: DepartmentsFile =
            serde_yaml::from_str(include_str!("../../../rules/departments.yaml"))
                .context("parsing bundled departments.yaml")?;
        let aliases: AliasesFile =
            serde_yaml::from_str(include_str!("../../../rules/agent_aliases.yaml"))
                .context("parsing bundled agent_aliases.yaml")?;
        let overrides: OverridesFile =
            serde_yaml::from_str(include_str!("../../../rules/responsible_overrides.yaml"))
                .context("parsing bundled responsible_overrides.yaml")?;
        Ok(Self::from_parts(departments, aliases, overrides))
    }

    fn from_parts(
        departments: DepartmentsFile,
        aliases: AliasesFile,
        overrides: OverridesFile,
    ) -> Self {
        Self {
            departments: departments
                .themes
                .into_iter()
                .map(|e| (compare_key(&e.theme), canon_text(&e.department)))
                .collect(),
            default_department: departments.default_department,
            agent_aliases: aliases
                .aliases
                .into_iter()
                .map(|e| (e.from.trim().to_string(), e.to))
                .collect(),
            responsible_overrides: overrides
                .overrides
                .into_iter()
                .map(|e| (e.match_key, e.replace_with))
                .collect(),
        }
    }

    pub fn default_department(&self) -> &str {
        &self.default_department
    }

    /// Map a categorical theme cell (possibly multi-valued) to the owning
    /// departments: split on any separator, match each token on its
    /// comparison key, drop unmatched tokens, dedup keeping input order.
    pub fn map_departments(&self, theme_cell: &str) -> Option<String> {
        let mut seen = Vec::new();
        for token in theme_cell.split([',', ';', '|', '/']) {
            let key = compare_key(token.trim());
            if key.is_empty() {
                continue;
            }
            if let Some(department) = self.departments.get(&key) {
                if !seen.iter().any(|d| d == department) {
                    seen.push(department.clone());
                }
            }
        }
        if seen.is_empty() {
            None
        } else {
            Some(seen.join(" | "))
        }
    }

    pub fn correct_agent(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        self.agent_aliases
            .get(trimmed)
            .cloned()
            .unwrap_or_else(|| trimmed.to_string())
    }

    pub fn canon_responsible(&self, raw: &str) -> String {
        let cleaned = canon_text(raw);
        self.responsible_overrides
            .get(&compare_key(&cleaned))
            .cloned()
            .unwrap_or(cleaned)
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

// ---------------------------------------------------------------------------
// Field transformer pipeline
// ---------------------------------------------------------------------------

const SUBJECT_PLACEHOLDERS: &[&str] = &["outro", "outros", "na", "n/a", "n\\a", ""];
const THEME_NOT_APPLICABLE: &str = "nao se aplica";
const FORCED_CATEGORY: &str = "Assédio";

type FieldRule = fn(&RuleSet, &mut CaseRecord);

/// Applies one pure rule per governed column in a fixed order. Rules are
/// independent of row order and idempotent, so the pipeline can run per row
/// regardless of batch boundaries.
#[derive(Debug, Clone)]
pub struct TransformPipeline {
    rules: RuleSet,
}

impl TransformPipeline {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Run every rule over one record. A panicking rule is isolated: the
    /// affected field keeps its prior best-effort value and the remaining
    /// rules still run.
    pub fn transform(&self, record: &mut CaseRecord) {
        const NAMED_RULES: &[(&str, FieldRule)] = &[
            ("theme_subject_cross_fill", rule_theme_subject_cross_fill),
            ("conclusion_date", rule_conclusion_date),
            ("unit_names", rule_unit_names),
            ("departments", rule_departments),
            ("agent_alias", rule_agent_alias),
            ("responsible_party", rule_responsible_party),
            ("creation_date", rule_creation_date),
            ("status", rule_status),
            ("resolution_days", rule_resolution_days),
            ("deadline_override", rule_deadline_override),
        ];

        for (name, rule) in NAMED_RULES {
            let before = record.clone();
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                rule(&self.rules, record)
            }));
            if outcome.is_err() {
                warn!(
                    protocol = %before.protocol,
                    rule = name,
                    "field rule failed; keeping previous value"
                );
                *record = before;
            }
        }
    }
}

fn rule_theme_subject_cross_fill(_rules: &RuleSet, record: &mut CaseRecord) {
    let theme_is_na = record
        .theme
        .as_deref()
        .map(|t| compare_key(t) == THEME_NOT_APPLICABLE)
        .unwrap_or(false);
    if !theme_is_na {
        return;
    }
    let subject_token = record
        .subject
        .as_deref()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    if SUBJECT_PLACEHOLDERS.contains(&subject_token.as_str()) {
        record.subject = Some(FORCED_CATEGORY.to_string());
    }
    record.theme = Some(FORCED_CATEGORY.to_string());
}

fn rule_conclusion_date(_rules: &RuleSet, record: &mut CaseRecord) {
    let raw = record.conclusion_date.as_deref().unwrap_or("");
    record.conclusion_date = Some(canon_conclusion_date(raw));
}

fn rule_unit_names(_rules: &RuleSet, record: &mut CaseRecord) {
    if let Some(unit) = record.registration_unit.take() {
        record.registration_unit = Some(capitalize_first(&canon_text(&unit)));
    }
    if let Some(unit) = record.health_unit.take() {
        let cleaned = canon_text(&unit);
        record.health_unit = Some(if cleaned == NOT_A_HEALTH_UNIT {
            cleaned
        } else if compare_key(&cleaned) == "sem informacao" {
            NOT_A_HEALTH_UNIT.to_string()
        } else {
            capitalize_first(&cleaned)
        });
    }
}

fn rule_departments(rules: &RuleSet, record: &mut CaseRecord) {
    let mapped = record
        .theme
        .as_deref()
        .and_then(|theme| rules.map_departments(theme));
    // Never left empty: unmappable themes land on the catch-all department.
    record.departments =
        Some(mapped.unwrap_or_else(|| rules.default_department().to_string()));
}

fn rule_agent_alias(rules: &RuleSet, record: &mut CaseRecord) {
    if let Some(agent) = record.assigned_agent.take() {
        record.assigned_agent = Some(rules.correct_agent(&agent));
    }
}

fn rule_responsible_party(rules: &RuleSet, record: &mut CaseRecord) {
    if let Some(responsible) = record.responsible_party.take() {
        record.responsible_party = Some(rules.canon_responsible(&responsible));
    }
}

fn rule_creation_date(_rules: &RuleSet, record: &mut CaseRecord) {
    if let Some(raw) = record.creation_date.take() {
        record.creation_date = canonical_date(&raw);
    }
}

fn rule_status(_rules: &RuleSet, record: &mut CaseRecord) {
    if let Some(raw) = record.status.take() {
        let collapsed = canon_status(&raw);
        record.status = if collapsed.is_empty() { None } else { Some(collapsed) };
    }
}

fn rule_resolution_days(_rules: &RuleSet, record: &mut CaseRecord) {
    if let Some(raw) = record.resolution_time_days.take() {
        record.resolution_time_days = Some(canon_resolution_days(&raw));
    }
}

fn rule_deadline_override(_rules: &RuleSet, record: &mut CaseRecord) {
    let concluded = record
        .status
        .as_deref()
        .map(is_concluded_status)
        .unwrap_or(false);
    if concluded {
        // Hard override: wins over whatever the upstream cell carried.
        record.remaining_deadline = Some(DEADLINE_CONCLUDED.to_string());
        return;
    }
    if let Some(raw) = record.remaining_deadline.take() {
        record.remaining_deadline = Some(canon_deadline(&raw));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ouvi_core::columns;

    fn pipeline() -> TransformPipeline {
        TransformPipeline::new(RuleSet::builtin().expect("bundled rules parse"))
    }

    fn record_with(fields: &[(&str, &str)]) -> CaseRecord {
        let columns: Vec<String> = fields.iter().map(|(c, _)| c.to_string()).collect();
        let row: Vec<String> = fields.iter().map(|(_, v)| v.to_string()).collect();
        CaseRecord::from_row(&columns, &row)
    }

    #[test]
    fn canon_text_collapses_whitespace_variants() {
        assert_eq!(canon_text("  a\u{00A0}b\u{2003}c  "), "a b c");
        assert_eq!(canon_text("x&nbsp;y"), "x y");
        assert_eq!(canon_text("a\u{200B}b\u{FEFF}c"), "abc");
    }

    #[test]
    fn canon_text_repairs_latin1_mojibake() {
        // "Saúde" UTF-8 bytes read as Latin-1.
        assert_eq!(canon_text("SaÃºde"), "Saúde");
        assert_eq!(canon_text("EducaÃ§Ã£o"), "Educação");
    }

    #[test]
    fn canon_text_repairs_replacement_char_corruption() {
        assert_eq!(canon_text("Sa\u{FFFD}de"), "Saúde");
        assert_eq!(canon_text("sa??de da família"), "Saúde da família");
    }

    #[test]
    fn canon_text_keeps_clean_input_and_is_idempotent() {
        let clean = "Ouvidoria Setorial da Saúde";
        assert_eq!(canon_text(clean), clean);
        assert_eq!(canon_text(&canon_text("SaÃºde")), "Saúde");
        assert_eq!(canon_text(""), "");
    }

    #[test]
    fn compare_key_strips_accents_and_case() {
        assert_eq!(compare_key("  Não   se APLICA "), "nao se aplica");
        assert_eq!(compare_key("Saúde"), "saude");
    }

    #[test]
    fn date_cascade_resolves_every_documented_shape() {
        assert_eq!(resolve_date(""), DateOutcome::Blank);
        assert_eq!(
            canonical_date("2024-03-05T00:00:00Z"),
            Some("05/03/2024".to_string())
        );
        // Spreadsheet serial: 45357 days after 1899-12-30 = 2024-03-06.
        assert_eq!(canonical_date("45357"), Some("06/03/2024".to_string()));
        assert_eq!(canonical_date("45357.5"), Some("06/03/2024".to_string()));
        // Epoch milliseconds and seconds for 2024-03-05 12:00:00 UTC.
        assert_eq!(canonical_date("1709640000000"), Some("05/03/2024".to_string()));
        assert_eq!(canonical_date("1709640000"), Some("05/03/2024".to_string()));
        assert_eq!(canonical_date("05/03/2024 10:30"), Some("05/03/2024".to_string()));
        assert_eq!(canonical_date("05/03/24"), Some("05/03/2024".to_string()));
    }

    #[test]
    fn ambiguous_numeric_dates_break_day_first() {
        assert_eq!(canonical_date("04/03/2024"), Some("04/03/2024".to_string()));
        assert_eq!(canonical_date("04-03-2024"), Some("04/03/2024".to_string()));
    }

    #[test]
    fn unparseable_dates_pass_through_unchanged() {
        assert_eq!(
            canonical_date("pendente de análise"),
            Some("pendente de análise".to_string())
        );
    }

    #[test]
    fn canonical_dates_round_trip() {
        for text in ["05/03/2024", "29/02/2024", "31/12/1999"] {
            assert_eq!(canonical_date(text), Some(text.to_string()));
        }
    }

    #[test]
    fn strict_conclusion_maps_invalid_tokens_to_sentinel() {
        for token in ["n/a", "NULL", "-", "Outros", "sem informação", "", "nat"] {
            assert_eq!(canon_conclusion_date(token), NOT_CONCLUDED);
        }
        assert_eq!(canon_conclusion_date("2024-03-05T00:00:00Z"), "05/03/2024");
        // A parse failure is not the same as "not concluded".
        assert_eq!(canon_conclusion_date("aguardando parecer"), "aguardando parecer");
    }

    #[test]
    fn department_mapping_splits_dedups_and_joins() {
        let rules = RuleSet::builtin().expect("bundled rules parse");
        assert_eq!(
            rules.map_departments("Saúde"),
            Some("Secretaria de Saúde".to_string())
        );
        assert_eq!(
            rules.map_departments("Saúde; Vigilância Sanitária / Educação"),
            Some("Secretaria de Saúde | Secretaria de Educação".to_string())
        );
        assert_eq!(rules.map_departments("tema desconhecido"), None);
    }

    #[test]
    fn departments_never_empty_after_pipeline() {
        let pipeline = pipeline();
        for theme in ["", "tema desconhecido", "Saúde"] {
            let mut record = record_with(&[(columns::PROTOCOL, "P1"), (columns::THEME, theme)]);
            pipeline.transform(&mut record);
            let departments = record.departments.expect("departments always set");
            assert!(!departments.trim().is_empty());
        }
    }

    #[test]
    fn not_applicable_theme_forces_category() {
        let pipeline = pipeline();
        let mut record = record_with(&[
            (columns::PROTOCOL, "P1"),
            (columns::THEME, "Não se aplica"),
            (columns::SUBJECT, "outros"),
        ]);
        pipeline.transform(&mut record);
        assert_eq!(record.theme.as_deref(), Some("Assédio"));
        assert_eq!(record.subject.as_deref(), Some("Assédio"));
        assert_eq!(
            record.departments.as_deref(),
            Some("Secretaria de Comunicação Social e Relações Públicas")
        );
    }

    #[test]
    fn not_applicable_theme_keeps_real_subject() {
        let pipeline = pipeline();
        let mut record = record_with(&[
            (columns::PROTOCOL, "P1"),
            (columns::THEME, "não se aplica"),
            (columns::SUBJECT, "Conduta de servidor"),
        ]);
        pipeline.transform(&mut record);
        assert_eq!(record.theme.as_deref(), Some("Assédio"));
        assert_eq!(record.subject.as_deref(), Some("Conduta de servidor"));
    }

    #[test]
    fn concluded_status_overrides_deadline() {
        let pipeline = pipeline();
        let mut record = record_with(&[
            (columns::PROTOCOL, "P1"),
            (columns::STATUS, "Concluída"),
            (columns::DEADLINE, "12 dias restantes"),
        ]);
        pipeline.transform(&mut record);
        assert_eq!(record.status.as_deref(), Some(STATUS_CONCLUDED));
        assert_eq!(record.remaining_deadline.as_deref(), Some(DEADLINE_CONCLUDED));
    }

    #[test]
    fn deadline_spelling_variants_collapse() {
        assert!(looks_like_deadline_concluded("Demanda Conclu\u{FFFD}da"));
        assert!(looks_like_deadline_concluded("demanda concluida"));
        assert!(looks_like_deadline_concluded("Demanda Conclu??da"));
        assert!(!looks_like_deadline_concluded("5 dias"));
        assert_eq!(canon_deadline("demanda concluída"), DEADLINE_CONCLUDED);
    }

    #[test]
    fn zero_resolution_days_become_one() {
        assert_eq!(canon_resolution_days("0"), "1");
        assert_eq!(canon_resolution_days("0.0"), "1");
        assert_eq!(canon_resolution_days("14"), "14");
        assert_eq!(canon_resolution_days("Não há dados"), "");
    }

    #[test]
    fn status_collapses_to_controlled_vocabulary() {
        assert_eq!(canon_status("concluida"), STATUS_CONCLUDED);
        assert_eq!(canon_status("CONCLUÍDA"), STATUS_CONCLUDED);
        assert_eq!(canon_status("Em tratamento"), STATUS_IN_PROGRESS);
        assert_eq!(canon_status("   "), "");
    }

    #[test]
    fn agent_aliases_and_responsible_overrides_apply() {
        let rules = RuleSet::builtin().expect("bundled rules parse");
        assert_eq!(rules.correct_agent("Stephanie Santos"), "Stephanie dos Santos Silva");
        assert_eq!(rules.correct_agent("Nome Inédito"), "Nome Inédito");
        assert_eq!(
            rules.canon_responsible("ouvidoria setorial da saúde"),
            "Ouvidoria Setorial da Saúde"
        );
        assert_eq!(rules.canon_responsible("TRUE"), "Cidadão");
        assert_eq!(rules.canon_responsible("Maria Silva"), "Maria Silva");
    }

    #[test]
    fn health_unit_no_information_substitution() {
        let pipeline = pipeline();
        let mut record = record_with(&[
            (columns::PROTOCOL, "P1"),
            (columns::HEALTH_UNIT, "SEM INFORMAÇÃO"),
        ]);
        pipeline.transform(&mut record);
        assert_eq!(record.health_unit.as_deref(), Some(NOT_A_HEALTH_UNIT));

        let mut record = record_with(&[
            (columns::PROTOCOL, "P2"),
            (columns::HEALTH_UNIT, "UBS JARDIM PRIMAVERA"),
        ]);
        pipeline.transform(&mut record);
        assert_eq!(record.health_unit.as_deref(), Some("Ubs jardim primavera"));
    }

    #[test]
    fn transform_is_idempotent() {
        let pipeline = pipeline();
        let mut record = record_with(&[
            (columns::PROTOCOL, "2024-000123"),
            (columns::CREATION_DATE, "2024-03-05T00:00:00Z"),
            (columns::CONCLUSION_DATE, "n/a"),
            (columns::STATUS, "Concluída"),
            (columns::DEADLINE, "3 dias"),
            (columns::RESOLUTION_DAYS, "0"),
            (columns::THEME, "Saúde"),
            (columns::SUBJECT, "Atendimento"),
            (columns::HEALTH_UNIT, "sem informação"),
            (columns::AGENT, "Stéphanie Santos"),
            (columns::RESPONSIBLE, "cidadão"),
        ]);
        pipeline.transform(&mut record);
        let once = record.clone();
        pipeline.transform(&mut record);
        assert_eq!(record, once);
    }

    #[test]
    fn rules_load_from_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rules_dir = dir.path().join("rules");
        std::fs::create_dir_all(&rules_dir).expect("mkdir");
        std::fs::write(
            rules_dir.join("departments.yaml"),
            "version: 1\ndefault_department: \"Geral\"\nthemes:\n  - { theme: \"Saúde\", department: \"Secretaria de Saúde\" }\n",
        )
        .expect("write departments");
        std::fs::write(rules_dir.join("agent_aliases.yaml"), "version: 1\naliases: []\n")
            .expect("write aliases");
        std::fs::write(
            rules_dir.join("responsible_overrides.yaml"),
            "version: 1\noverrides: []\n",
        )
        .expect("write overrides");

        let rules = RuleSet::from_workspace_root(dir.path()).expect("rules load");
        assert_eq!(rules.default_department(), "Geral");
        assert_eq!(
            rules.map_departments("saude"),
            Some("Secretaria de Saúde".to_string())
        );
    }
}
