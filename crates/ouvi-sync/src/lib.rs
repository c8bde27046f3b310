//! Run orchestration: classify incoming cases, diff the mutable fields
//! against the curated sink, and write appends and patches in batches.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ouvi_adapters::{JsonFileSink, JsonFixtureSource, RecordSink, RecordSource};
use ouvi_core::{
    columns, normalize_protocol, protocol_is_well_formed, synthetic_protocol, CaseRecord,
    ExceptionField, SheetTable,
};
use ouvi_rules::{canon_exception, RuleSet, TransformPipeline};
use ouvi_storage::{FailureArtifact, FailureStage, FailureStore};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ouvi-sync";

/// Rows appended to the sink per call.
pub const DEFAULT_APPEND_BATCH: usize = 500;
/// Keys carried by one patch call.
pub const DEFAULT_PATCH_BATCH: usize = 400;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_path: PathBuf,
    pub sink_path: PathBuf,
    pub failures_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub append_batch: usize,
    pub patch_batch: usize,
    pub dry_run: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            source_path: std::env::var("OUVI_SOURCE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./fixtures/export.json")),
            sink_path: std::env::var("OUVI_SINK_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/curated.json")),
            failures_dir: std::env::var("OUVI_FAILURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./failures")),
            workspace_root: PathBuf::from("."),
            append_batch: std::env::var("OUVI_APPEND_BATCH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_APPEND_BATCH),
            patch_batch: std::env::var("OUVI_PATCH_BATCH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PATCH_BATCH),
            dry_run: std::env::var("OUVI_DRY_RUN")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }
}

/// Preconditions that abort a run before any write happens.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source export is empty")]
    EmptySource,
    #[error("source export has no {0:?} column")]
    SourceMissingKeyColumn(&'static str),
    #[error("sink table has rows but no {0:?} column")]
    SinkMissingKeyColumn(&'static str),
    #[error("patching column {0:?} is forbidden")]
    ForbiddenPatchColumn(&'static str),
}

/// One pending cell update: set `field` to `value` on the sink rows whose
/// key matches `keys`. Grouped so equal values travel in one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchGroup {
    pub field: ExceptionField,
    pub value: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub new_records: Vec<CaseRecord>,
    pub known_records: Vec<(String, CaseRecord)>,
    pub synthetic_keys: usize,
    pub duplicates_collapsed: usize,
    pub blank_rows_skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub source_rows: usize,
    pub blank_rows_skipped: usize,
    pub duplicates_collapsed: usize,
    pub synthetic_keys: usize,
    pub known_records: usize,
    pub appended: usize,
    pub patch_groups: usize,
    /// Keys with a pending update, counted per exception column.
    pub deltas_by_column: BTreeMap<String, usize>,
    pub patched_keys: usize,
    pub skipped_keys: usize,
    pub failed_batches: usize,
    pub failures_recorded: usize,
    pub reports_dir: String,
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Partition a source snapshot into appends and patch candidates.
///
/// Protocols are compared in normalized form on both sides. A structurally
/// invalid protocol is replaced with a content-derived synthetic key, and
/// later source occurrences of the same key win over earlier ones.
pub fn classify(
    source: &SheetTable,
    sink_keys: &HashMap<String, String>,
) -> Result<Classification, PipelineError> {
    if source.column_index(columns::PROTOCOL).is_none() {
        return Err(PipelineError::SourceMissingKeyColumn(columns::PROTOCOL));
    }

    let mut classification = Classification::default();
    let mut by_key: BTreeMap<String, CaseRecord> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();

    for row in &source.rows {
        if row.iter().all(|cell| cell.trim().is_empty()) {
            classification.blank_rows_skipped += 1;
            continue;
        }

        let mut record = CaseRecord::from_row(&source.columns, row);
        let normalized = normalize_protocol(&record.protocol);
        if protocol_is_well_formed(&normalized) {
            record.protocol = normalized;
        } else {
            record.protocol = synthetic_protocol(
                record.creation_date.as_deref().unwrap_or(""),
                record.subject.as_deref().unwrap_or(""),
                record.extras.get(columns::DESCRIPTION).map(String::as_str).unwrap_or(""),
            );
            classification.synthetic_keys += 1;
        }

        if by_key.insert(record.protocol.clone(), record.clone()).is_some() {
            classification.duplicates_collapsed += 1;
        } else {
            order.push(record.protocol.clone());
        }
    }

    for key in order {
        let record = by_key.remove(&key).expect("key inserted above");
        match sink_keys.get(&key) {
            Some(sink_key) => classification
                .known_records
                .push((sink_key.clone(), record)),
            None => classification.new_records.push(record),
        }
    }

    Ok(classification)
}

/// Map normalized sink protocol -> raw sink key cell. Raw keys are what the
/// sink matches on when patching.
pub fn sink_key_index(sink: &SheetTable) -> Result<HashMap<String, String>, PipelineError> {
    if sink.is_empty() {
        return Ok(HashMap::new());
    }
    let key_index = sink
        .column_index(columns::PROTOCOL)
        .ok_or(PipelineError::SinkMissingKeyColumn(columns::PROTOCOL))?;

    let mut index = HashMap::new();
    for row in &sink.rows {
        if let Some(raw) = row.get(key_index) {
            if !raw.trim().is_empty() {
                index.insert(normalize_protocol(raw), raw.clone());
            }
        }
    }
    Ok(index)
}

// ---------------------------------------------------------------------------
// Delta engine
// ---------------------------------------------------------------------------

/// Diff the mutable fields of known records against the sink's current
/// values. Both sides pass through the same canonicalizer, so formatting
/// drift alone never produces a patch.
pub fn compute_patches(
    known: &[(String, CaseRecord)],
    sink: &SheetTable,
) -> Result<Vec<PatchGroup>, PipelineError> {
    if known.is_empty() {
        return Ok(Vec::new());
    }
    let key_index = sink
        .column_index(columns::PROTOCOL)
        .ok_or(PipelineError::SinkMissingKeyColumn(columns::PROTOCOL))?;
    for field in ExceptionField::ALL {
        if columns::PATCH_FORBIDDEN.contains(&field.column()) {
            return Err(PipelineError::ForbiddenPatchColumn(field.column()));
        }
    }

    let mut sink_records: HashMap<String, CaseRecord> = HashMap::new();
    for row in &sink.rows {
        if let Some(raw) = row.get(key_index) {
            if !raw.trim().is_empty() {
                sink_records.insert(raw.clone(), CaseRecord::from_row(&sink.columns, row));
            }
        }
    }

    let mut groups: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
    for (sink_key, incoming) in known {
        let Some(current) = sink_records.get(sink_key) else {
            continue;
        };
        for field in ExceptionField::ALL {
            let wanted = canon_exception(*field, incoming.exception_value(*field).unwrap_or(""));
            let have = canon_exception(*field, current.exception_value(*field).unwrap_or(""));
            if wanted != have && !wanted.trim().is_empty() {
                groups
                    .entry((field.column().to_string(), wanted))
                    .or_default()
                    .push(sink_key.clone());
            }
        }
    }

    let mut patches = Vec::new();
    for ((column, value), keys) in groups {
        let field = *ExceptionField::ALL
            .iter()
            .find(|f| f.column() == column)
            .expect("group column came from ExceptionField");
        patches.push(PatchGroup { field, value, keys });
    }
    Ok(patches)
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct SyncPipeline {
    config: SyncConfig,
    transformer: TransformPipeline,
    failures: FailureStore,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, rules: RuleSet) -> Self {
        let failures = FailureStore::new(config.failures_dir.clone());
        Self {
            config,
            transformer: TransformPipeline::new(rules),
            failures,
        }
    }

    pub fn run_once(
        &self,
        source: &mut dyn RecordSource,
        sink: &mut dyn RecordSink,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let source_table = source
            .list_latest()
            .with_context(|| format!("listing latest export from {}", source.source_id()))?;
        if source_table.is_empty() {
            // A blank export means an upstream failure, never "no cases".
            return Err(PipelineError::EmptySource.into());
        }
        let sink_table = sink
            .read_all()
            .with_context(|| format!("reading sink {}", sink.sink_id()))?;

        let sink_keys = sink_key_index(&sink_table)?;
        let mut classification = classify(&source_table, &sink_keys)?;

        for record in classification
            .new_records
            .iter_mut()
            .chain(classification.known_records.iter_mut().map(|(_, r)| r))
        {
            self.transformer.transform(record);
        }

        let patches = compute_patches(&classification.known_records, &sink_table)?;

        let mut failures_recorded = 0usize;
        let mut failed_batches = 0usize;
        let mut appended = 0usize;
        if !self.config.dry_run {
            let outcome =
                self.append_new_records(run_id, sink, &sink_table, &classification.new_records)?;
            appended = outcome.0;
            failed_batches += outcome.1;
            failures_recorded += outcome.1;
        }

        let mut patched_keys = 0usize;
        let mut skipped_keys = 0usize;
        if !self.config.dry_run {
            for group in &patches {
                let chunk_count = group.keys.chunks(self.config.patch_batch.max(1)).count();
                for (idx, chunk) in group.keys.chunks(self.config.patch_batch.max(1)).enumerate() {
                    info!(
                        run_id = %run_id,
                        column = group.field.column(),
                        batch = idx + 1,
                        batches = chunk_count,
                        first_key = %chunk[0],
                        keys = chunk.len(),
                        "patching batch"
                    );
                    let outcome = match sink.patch_column(
                        columns::PROTOCOL,
                        chunk,
                        group.field.column(),
                        &group.value,
                    ) {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            // One bad batch must not sink the run.
                            warn!(
                                run_id = %run_id,
                                column = group.field.column(),
                                error = %err,
                                "patch batch failed; quarantining"
                            );
                            failed_batches += 1;
                            failures_recorded += 1;
                            self.failures.record(&FailureArtifact {
                                run_id,
                                stage: FailureStage::Patch,
                                reason: err.to_string(),
                                protocol: None,
                                payload: serde_json::json!({
                                    "column": group.field.column(),
                                    "value": group.value,
                                    "keys": chunk,
                                }),
                                recorded_at: Utc::now(),
                            })?;
                            continue;
                        }
                    };
                    patched_keys += outcome.matched;
                    for missing in outcome.missing_keys {
                        warn!(
                            run_id = %run_id,
                            key = %missing,
                            column = group.field.column(),
                            "patch key missing in sink; skipping"
                        );
                        skipped_keys += 1;
                        self.failures.record(&FailureArtifact {
                            run_id,
                            stage: FailureStage::Patch,
                            reason: "key missing in sink".to_string(),
                            protocol: Some(missing),
                            payload: serde_json::json!({
                                "column": group.field.column(),
                                "value": group.value,
                            }),
                            recorded_at: Utc::now(),
                        })?;
                        failures_recorded += 1;
                    }
                }
            }
        }

        let finished_at = Utc::now();
        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at,
            dry_run: self.config.dry_run,
            source_rows: source_table.rows.len(),
            blank_rows_skipped: classification.blank_rows_skipped,
            duplicates_collapsed: classification.duplicates_collapsed,
            synthetic_keys: classification.synthetic_keys,
            known_records: classification.known_records.len(),
            appended,
            patch_groups: patches.len(),
            deltas_by_column: {
                let mut counts = BTreeMap::new();
                for group in &patches {
                    *counts.entry(group.field.column().to_string()).or_insert(0) +=
                        group.keys.len();
                }
                counts
            },
            patched_keys,
            skipped_keys,
            failed_batches,
            failures_recorded,
            reports_dir: String::new(),
        };
        summary.reports_dir = self
            .write_reports(&summary, &patches)?
            .display()
            .to_string();

        info!(
            run_id = %summary.run_id,
            appended = summary.appended,
            patch_groups = summary.patch_groups,
            patched_keys = summary.patched_keys,
            skipped_keys = summary.skipped_keys,
            "run finished"
        );
        Ok(summary)
    }

    fn append_new_records(
        &self,
        run_id: Uuid,
        sink: &mut dyn RecordSink,
        sink_table: &SheetTable,
        new_records: &[CaseRecord],
    ) -> Result<(usize, usize)> {
        if new_records.is_empty() {
            return Ok((0, 0));
        }
        // An empty sink adopts the canonical column order on first append.
        let header: Vec<String> = if sink_table.columns.is_empty() {
            columns::SINK_COLUMNS.iter().map(|c| c.to_string()).collect()
        } else {
            sink_table.columns.clone()
        };

        let mut appended = 0usize;
        let mut failed = 0usize;
        let batch_size = self.config.append_batch.max(1);
        let batches = new_records.chunks(batch_size).count();
        for (idx, chunk) in new_records.chunks(batch_size).enumerate() {
            info!(
                run_id = %run_id,
                batch = idx + 1,
                batches,
                first_protocol = %chunk[0].protocol,
                rows = chunk.len(),
                "appending batch"
            );
            let rows: Vec<Vec<String>> = chunk.iter().map(|r| r.to_row(&header)).collect();
            match sink.append_rows(&header, &rows) {
                Ok(()) => appended += rows.len(),
                Err(err) => {
                    // One bad batch must not sink the run.
                    warn!(
                        run_id = %run_id,
                        batch = idx + 1,
                        error = %err,
                        "append batch failed; quarantining"
                    );
                    failed += 1;
                    let protocols: Vec<&str> =
                        chunk.iter().map(|r| r.protocol.as_str()).collect();
                    self.failures.record(&FailureArtifact {
                        run_id,
                        stage: FailureStage::Append,
                        reason: err.to_string(),
                        protocol: None,
                        payload: serde_json::json!({
                            "rows": rows.len(),
                            "protocols": protocols,
                        }),
                        recorded_at: Utc::now(),
                    })?;
                }
            }
        }
        Ok((appended, failed))
    }

    fn write_reports(&self, summary: &RunSummary, patches: &[PatchGroup]) -> Result<PathBuf> {
        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(summary.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let summary_json =
            serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("run_summary.json"), summary_json)
            .context("writing run_summary.json")?;

        let patches_json = serde_json::to_vec_pretty(patches).context("serializing patches")?;
        fs::write(reports_dir.join("patches.json"), patches_json)
            .context("writing patches.json")?;

        let brief = format!(
            "# Reconciliation Run\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Source rows: {}\n- Appended: {}\n- Patch groups: {}\n- Patched keys: {}\n- Skipped keys: {}\n- Failed batches: {}\n- Synthetic keys: {}\n",
            summary.run_id,
            summary.started_at,
            summary.finished_at,
            summary.source_rows,
            summary.appended,
            summary.patch_groups,
            summary.patched_keys,
            summary.skipped_keys,
            summary.failed_batches,
            summary.synthetic_keys,
        );
        fs::write(reports_dir.join("brief.md"), brief).context("writing brief.md")?;

        Ok(reports_dir)
    }
}

/// Convenience entry point wiring the file-backed source and sink from the
/// environment-derived config.
pub fn run_sync_once_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env();
    let rules = RuleSet::from_workspace_root(&config.workspace_root)
        .or_else(|_| RuleSet::builtin())
        .context("loading rule tables")?;
    let mut source = JsonFixtureSource::new(config.source_path.clone());
    let mut sink = JsonFileSink::new(config.sink_path.clone());
    SyncPipeline::new(config, rules).run_once(&mut source, &mut sink)
}
