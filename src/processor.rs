//! Per-message submission processing: decode, execute, persist, notify, clean up.
//!
//! One processor handles one message at a time. A submission carries several test-case
//! inputs; each is executed in isolation and a broken case is recorded in place without
//! taking the rest of the batch down. The finished report is persisted before the judge
//! is notified, so the judge always reads a complete record.

use crate::executor::{ARTIFACT_FILE, ExecutionEngine, INPUT_FILE, Outcome, Stage};
use crate::languages::Registry;
use crate::store::{StoreError, SubmissionStore};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

/// Status value marking a fully processed record.
pub const DONE_STATUS: &str = "done execution";
/// Result value recorded when the judge could not be notified.
pub const JUDGE_ERROR_RESULT: &str = "Judge Error";

const JUDGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Message payload delivered by the broker.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    /// Key of the submission record in the store.
    pub submission_id: String,
}

/// One pre-run textual substitution, base64 on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    /// Substring to replace, base64-encoded.
    pub from: String,
    /// Replacement text, base64-encoded.
    pub to: String,
}

/// Submission record as stored by the submitting service.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionRecord {
    /// Base64-encoded source text.
    pub code: String,
    /// Language tag, resolved through the profile registry.
    pub language: String,
    /// Base64 stdin payloads, one per test case.
    pub input: Vec<String>,
    /// Per-case substitution lists, parallel to `input`; a missing entry is a no-op.
    #[serde(default)]
    pub replace: Vec<Vec<Replacement>>,
    /// Opaque grading metadata, forwarded untouched.
    #[serde(default)]
    pub test_cases: serde_json::Value,
}

/// Record written back to the store once execution is done.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Base64 stdout per case, parallel to `stdin`.
    pub stdout: Vec<String>,
    /// Base64 stderr per case, parallel to `stdin`.
    pub stderr: Vec<String>,
    /// Grading metadata copied from the submission.
    pub test_cases: serde_json::Value,
    /// Substitutions copied from the submission.
    pub replace: Vec<Vec<Replacement>>,
    /// Key of the record.
    pub submission_id: String,
    /// Echo of the submitted stdin payloads.
    pub stdin: Vec<String>,
    /// Processing status, always [`DONE_STATUS`] once written.
    pub status: String,
    /// Set when the judge notification failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// Error aborting the handling of one queue message.
///
/// The consumer must not acknowledge a message whose processing returned this.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The message body is not a valid envelope.
    #[error("malformed submission envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
    /// The record could not be read from or written to the store.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Drives one submission from queue message to persisted report.
pub struct Processor<E, S> {
    engine: E,
    store: S,
    registry: Registry,
    work_dir: PathBuf,
    judge_url: String,
}

impl<E: ExecutionEngine, S: SubmissionStore> Processor<E, S> {
    /// Assemble a processor.
    pub fn new(
        engine: E,
        store: S,
        registry: Registry,
        work_dir: PathBuf,
        judge_url: String,
    ) -> Self {
        Processor {
            engine,
            store,
            registry,
            work_dir,
            judge_url,
        }
    }

    /// Handle one queue message.
    ///
    /// On `Ok` the report has been persisted (and the judge notified, or the failure to
    /// do so recorded) and the message can be acknowledged. On `Err` nothing was
    /// persisted and the message must stay unacknowledged.
    pub fn process(&mut self, body: &[u8]) -> Result<(), ProcessError> {
        let envelope: Envelope =
            serde_json::from_slice(body).map_err(ProcessError::MalformedEnvelope)?;
        let submission_id = envelope.submission_id;
        info!("processing submission {submission_id}");

        let record = self.store.fetch(&submission_id)?;

        let mut stdout = Vec::with_capacity(record.input.len());
        let mut stderr = Vec::with_capacity(record.input.len());
        for (index, raw_input) in record.input.iter().enumerate() {
            let (out, err) = match self.run_case(&record, index, raw_input) {
                Ok(streams) => streams,
                Err(message) => {
                    // One broken case must not take the rest of the batch with it.
                    warn!("submission {submission_id}, case {index}: {message}");
                    (String::new(), message)
                }
            };
            stdout.push(BASE64.encode(out));
            stderr.push(BASE64.encode(err));
        }

        let mut report = ExecutionReport {
            stdout,
            stderr,
            test_cases: record.test_cases.clone(),
            replace: record.replace.clone(),
            submission_id: submission_id.clone(),
            stdin: record.input.clone(),
            status: DONE_STATUS.to_string(),
            result: None,
        };
        self.store.persist(&submission_id, &report)?;

        if !self.notify_judge(&submission_id) {
            report.result = Some(JUDGE_ERROR_RESULT.to_string());
            self.store.persist(&submission_id, &report)?;
        }

        self.clean_scratch();
        info!("submission {submission_id} done");
        Ok(())
    }

    fn run_case(
        &self,
        record: &SubmissionRecord,
        index: usize,
        raw_input: &str,
    ) -> Result<(String, String), String> {
        let source = decode_text(&record.code)
            .map_err(|err| format!("invalid base64 in the submitted code: {err}"))?;
        let input = decode_text(raw_input)
            .map_err(|err| format!("invalid base64 in the case input: {err}"))?;
        let replacements = record.replace.get(index).map(Vec::as_slice).unwrap_or(&[]);
        let source = apply_replacements(source, replacements)?;
        let profile = self
            .registry
            .get(&record.language)
            .ok_or_else(|| format!("language {:?} is not supported", record.language))?;

        let outcome = self.engine.execute(profile, &source, &input);
        Ok(case_streams(outcome))
    }

    fn notify_judge(&self, submission_id: &str) -> bool {
        let body = serde_json::json!({ "submission_id": submission_id });
        let response = attohttpc::post(&self.judge_url)
            .connect_timeout(JUDGE_TIMEOUT)
            .read_timeout(JUDGE_TIMEOUT)
            .json(&body)
            .and_then(|request| request.send());
        match response {
            Ok(response) if response.status() == attohttpc::StatusCode::OK => true,
            Ok(response) => {
                warn!(
                    "the judge returned {} for submission {submission_id}",
                    response.status()
                );
                false
            }
            Err(err) => {
                warn!("failed to reach the judge for submission {submission_id}: {err}");
                false
            }
        }
    }

    /// Remove everything a run may have left in the scratch directory, so the next
    /// submission starts clean.
    fn clean_scratch(&self) {
        let code_dir = self.work_dir.join("code");
        let mut files = vec![code_dir.join(INPUT_FILE), code_dir.join(ARTIFACT_FILE)];
        files.extend(self.registry.source_names().map(|name| code_dir.join(name)));
        for file in files {
            if let Err(err) = std::fs::remove_file(&file) {
                if err.kind() != ErrorKind::NotFound {
                    warn!("failed to remove scratch file {}: {err}", file.display());
                }
            }
        }
    }
}

/// Map an outcome to the plain-text (stdout, stderr) pair recorded for the case.
fn case_streams(outcome: Outcome) -> (String, String) {
    match outcome {
        Outcome::Success { stdout, stderr } => (stdout, stderr),
        Outcome::Internal { detail } => (String::new(), detail),
        outcome => {
            let stage = outcome.stage().unwrap_or(Stage::Run);
            let detail = outcome.detail().unwrap_or_default();
            (String::new(), format!("{stage} Error\n{detail}"))
        }
    }
}

/// Apply the substitutions in order. Earlier replacements are visible to later ones.
fn apply_replacements(
    mut source: String,
    replacements: &[Replacement],
) -> Result<String, String> {
    for replacement in replacements {
        let from = decode_text(&replacement.from)
            .map_err(|err| format!("invalid base64 in a replacement: {err}"))?;
        let to = decode_text(&replacement.to)
            .map_err(|err| format!("invalid base64 in a replacement: {err}"))?;
        source = source.replace(&from, &to);
    }
    Ok(source)
}

fn decode_text(payload: &str) -> Result<String, String> {
    let bytes = BASE64.decode(payload.trim()).map_err(|err| err.to_string())?;
    String::from_utf8(bytes).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(text: &str) -> String {
        BASE64.encode(text)
    }

    fn replacement(from: &str, to: &str) -> Replacement {
        Replacement {
            from: b64(from),
            to: b64(to),
        }
    }

    #[test]
    fn replacements_apply_left_to_right() {
        let replaced = apply_replacements(
            "X+X".to_string(),
            &[replacement("X", "Y"), replacement("Y", "1")],
        )
        .unwrap();
        // the first substitution feeds the second
        assert_eq!(replaced, "1+1");
    }

    #[test]
    fn replacements_hit_every_occurrence() {
        let replaced =
            apply_replacements("a a a".to_string(), &[replacement("a", "b")]).unwrap();
        assert_eq!(replaced, "b b b");
    }

    #[test]
    fn malformed_replacements_are_reported() {
        let broken = Replacement {
            from: "%%%".to_string(),
            to: b64("1"),
        };
        let err = apply_replacements("X".to_string(), &[broken]).unwrap_err();
        assert!(err.contains("invalid base64"));
    }

    #[test]
    fn run_failures_get_the_run_stage_prefix() {
        let (stdout, stderr) = case_streams(Outcome::TimeLimit {
            stage: Stage::Run,
            limit: Duration::from_secs(2),
        });
        assert_eq!(stdout, "");
        assert_eq!(
            stderr,
            "Run Time Error\nRun Time Limit Exceeded\n\tRun Time Limit = 2s"
        );
    }

    #[test]
    fn compile_failures_get_the_compile_stage_prefix() {
        let (_, stderr) = case_streams(Outcome::CompileError {
            stderr: "code.c:1:1: error".to_string(),
        });
        assert_eq!(stderr, "Compile Time Error\ncode.c:1:1: error");
    }

    #[test]
    fn internal_failures_are_recorded_unprefixed() {
        let (stdout, stderr) = case_streams(Outcome::Internal {
            detail: "io error".to_string(),
        });
        assert_eq!(stdout, "");
        assert_eq!(stderr, "io error");
    }

    #[test]
    fn success_passes_both_streams_through() {
        let (stdout, stderr) = case_streams(Outcome::Success {
            stdout: "hi\n".to_string(),
            stderr: "note\n".to_string(),
        });
        assert_eq!((stdout.as_str(), stderr.as_str()), ("hi\n", "note\n"));
    }
}
