//! End-to-end tests of the submission pipeline, with the container runtime and the
//! store replaced by in-process fakes and the judge served by a local HTTP endpoint.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use cee_worker::config::ImageOverrides;
use cee_worker::executor::{ExecutionEngine, Outcome, Stage};
use cee_worker::languages::{LanguageProfile, Registry};
use cee_worker::processor::{ExecutionReport, Processor, SubmissionRecord};
use cee_worker::store::{StoreError, SubmissionStore};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::rc::Rc;
use std::time::Duration;

fn b64(text: &str) -> String {
    BASE64.encode(text)
}

fn decoded(payload: &str) -> String {
    String::from_utf8(BASE64.decode(payload).unwrap()).unwrap()
}

/// In-memory stand-in for the Redis store, recording every persisted report.
#[derive(Clone, Default)]
struct MemoryStore {
    inner: Rc<RefCell<MemoryStoreState>>,
}

#[derive(Default)]
struct MemoryStoreState {
    records: HashMap<String, String>,
    writes: Vec<ExecutionReport>,
}

impl MemoryStore {
    fn with_record(submission_id: &str, record: &serde_json::Value) -> Self {
        let store = MemoryStore::default();
        store
            .inner
            .borrow_mut()
            .records
            .insert(submission_id.to_string(), record.to_string());
        store
    }

    fn writes(&self) -> Vec<ExecutionReport> {
        self.inner.borrow().writes.clone()
    }
}

impl SubmissionStore for MemoryStore {
    fn fetch(&mut self, submission_id: &str) -> Result<SubmissionRecord, StoreError> {
        let inner = self.inner.borrow();
        let raw = inner
            .records
            .get(submission_id)
            .ok_or_else(|| StoreError::MissingSubmission(submission_id.to_string()))?;
        serde_json::from_str(raw).map_err(StoreError::MalformedRecord)
    }

    fn persist(
        &mut self,
        _submission_id: &str,
        report: &ExecutionReport,
    ) -> Result<(), StoreError> {
        // round-trip through JSON, as the real store does
        let raw = serde_json::to_string(report).map_err(StoreError::MalformedRecord)?;
        let report = serde_json::from_str(&raw).map_err(StoreError::MalformedRecord)?;
        self.inner.borrow_mut().writes.push(report);
        Ok(())
    }
}

struct EngineCall {
    language: String,
    source: String,
    stdin: String,
}

/// Engine with scripted outcomes, recording what it was asked to execute. When the
/// script runs dry it echoes the case stdin, like a trivially passing program.
#[derive(Clone, Default)]
struct ScriptedEngine {
    outcomes: Rc<RefCell<VecDeque<Outcome>>>,
    calls: Rc<RefCell<Vec<EngineCall>>>,
}

impl ScriptedEngine {
    fn with_outcomes(outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        let engine = ScriptedEngine::default();
        engine.outcomes.borrow_mut().extend(outcomes);
        engine
    }

    fn calls(&self) -> Rc<RefCell<Vec<EngineCall>>> {
        Rc::clone(&self.calls)
    }
}

impl ExecutionEngine for ScriptedEngine {
    fn execute(&self, profile: &LanguageProfile, source: &str, stdin: &str) -> Outcome {
        self.calls.borrow_mut().push(EngineCall {
            language: profile.language.to_string(),
            source: source.to_string(),
            stdin: stdin.to_string(),
        });
        self.outcomes
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Outcome::Success {
                stdout: stdin.to_string(),
                stderr: String::new(),
            })
    }
}

/// Serve exactly one judge request on a local port, answering with `status`.
fn spawn_judge(status: u16) -> (String, std::sync::mpsc::Receiver<String>) {
    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr().to_ip().unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        if let Ok(Some(mut request)) = server.recv_timeout(Duration::from_secs(10)) {
            let mut body = String::new();
            request.as_reader().read_to_string(&mut body).unwrap();
            let _ = tx.send(body);
            let _ = request.respond(tiny_http::Response::empty(tiny_http::StatusCode(status)));
        }
    });
    (format!("http://{addr}/judge"), rx)
}

/// URL of a port nothing listens on.
fn unreachable_judge() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/judge")
}

fn record(language: &str, code: &str, inputs: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "code": b64(code),
        "language": language,
        "input": inputs.iter().map(|input| b64(input)).collect::<Vec<_>>(),
        "replace": inputs.iter().map(|_| Vec::<serde_json::Value>::new()).collect::<Vec<_>>(),
        "test_cases": ["tc-1"],
    })
}

fn processor(
    engine: ScriptedEngine,
    store: MemoryStore,
    judge_url: String,
) -> (Processor<ScriptedEngine, MemoryStore>, tempfile::TempDir) {
    let work_dir = tempfile::tempdir().unwrap();
    let processor = Processor::new(
        engine,
        store,
        Registry::new(&ImageOverrides::default()),
        work_dir.path().to_path_buf(),
        judge_url,
    );
    (processor, work_dir)
}

fn envelope(submission_id: &str) -> Vec<u8> {
    serde_json::json!({ "submission_id": submission_id })
        .to_string()
        .into_bytes()
}

#[test]
fn a_passing_submission_is_persisted_and_judged() {
    let store = MemoryStore::with_record("sub-1", &record("c", "int main(){}", [""].as_slice()));
    let engine = ScriptedEngine::with_outcomes([Outcome::Success {
        stdout: "hi\n".to_string(),
        stderr: String::new(),
    }]);
    let (judge_url, judge_hits) = spawn_judge(200);
    let (mut processor, _work_dir) = processor(engine, store.clone(), judge_url);

    processor.process(&envelope("sub-1")).unwrap();

    let writes = store.writes();
    assert_eq!(writes.len(), 1);
    let report = &writes[0];
    assert_eq!(report.status, "done execution");
    assert_eq!(report.submission_id, "sub-1");
    assert_eq!(report.stdout, vec![b64("hi\n")]);
    assert_eq!(report.stderr, vec![String::new()]);
    assert_eq!(report.stdin, vec![b64("")]);
    assert_eq!(report.result, None);

    let hit = judge_hits.recv_timeout(Duration::from_secs(5)).unwrap();
    let posted: serde_json::Value = serde_json::from_str(&hit).unwrap();
    assert_eq!(posted["submission_id"], "sub-1");
}

#[test]
fn outputs_stay_parallel_to_inputs_and_decode_as_base64() {
    let store = MemoryStore::with_record("sub-2", &record("python", "print(1)", &["a", "b", "c"]));
    let engine = ScriptedEngine::with_outcomes([
        Outcome::Success {
            stdout: "one\n".to_string(),
            stderr: String::new(),
        },
        Outcome::RuntimeError {
            stderr: "boom".to_string(),
        },
        Outcome::Success {
            stdout: String::new(),
            stderr: "warning\n".to_string(),
        },
    ]);
    let (judge_url, _judge_hits) = spawn_judge(200);
    let (mut processor, _work_dir) = processor(engine, store.clone(), judge_url);

    processor.process(&envelope("sub-2")).unwrap();

    let report = &store.writes()[0];
    assert_eq!(report.stdout.len(), 3);
    assert_eq!(report.stderr.len(), 3);
    assert_eq!(report.stdin.len(), 3);
    for payload in report.stdout.iter().chain(report.stderr.iter()) {
        BASE64.decode(payload).unwrap();
    }
    assert_eq!(decoded(&report.stderr[1]), "Run Time Error\nboom");
    assert_eq!(report.stdout[1], "");
}

#[test]
fn substitutions_apply_in_order_and_per_case() {
    let record = serde_json::json!({
        "code": b64("X+X"),
        "language": "python",
        "input": [b64(""), b64("")],
        "replace": [
            [
                { "from": b64("X"), "to": b64("Y") },
                { "from": b64("Y"), "to": b64("1") },
            ],
            [],
        ],
        "test_cases": serde_json::Value::Null,
    });
    let store = MemoryStore::with_record("sub-3", &record);
    let engine = ScriptedEngine::default();
    let calls = engine.calls();
    let (judge_url, _judge_hits) = spawn_judge(200);
    let (mut processor, _work_dir) = processor(engine, store, judge_url);

    processor.process(&envelope("sub-3")).unwrap();

    let calls = calls.borrow();
    assert_eq!(calls.len(), 2);
    // the first pair feeds the second, and neither leaks into the next case
    assert_eq!(calls[0].source, "1+1");
    assert_eq!(calls[1].source, "X+X");
}

#[test]
fn compile_failures_use_the_compile_stage_prefix() {
    let store = MemoryStore::with_record("sub-4", &record("c", "int main({", [""].as_slice()));
    let engine = ScriptedEngine::with_outcomes([Outcome::CompileError {
        stderr: "code.c:1:10: error: expected declaration".to_string(),
    }]);
    let (judge_url, _judge_hits) = spawn_judge(200);
    let (mut processor, _work_dir) = processor(engine, store.clone(), judge_url);

    processor.process(&envelope("sub-4")).unwrap();

    let report = &store.writes()[0];
    assert_eq!(report.stdout[0], "");
    assert_eq!(
        decoded(&report.stderr[0]),
        "Compile Time Error\ncode.c:1:10: error: expected declaration"
    );
}

#[test]
fn limit_messages_name_the_violated_budget() {
    let store = MemoryStore::with_record("sub-5", &record("cpp", "while(1){}", &["", ""]));
    let engine = ScriptedEngine::with_outcomes([
        Outcome::TimeLimit {
            stage: Stage::Run,
            limit: Duration::from_secs(2),
        },
        Outcome::MemoryLimit {
            stage: Stage::Run,
            limit: "100m".to_string(),
        },
    ]);
    let (judge_url, _judge_hits) = spawn_judge(200);
    let (mut processor, _work_dir) = processor(engine, store.clone(), judge_url);

    processor.process(&envelope("sub-5")).unwrap();

    let report = &store.writes()[0];
    let tle = decoded(&report.stderr[0]);
    assert!(tle.contains("Run Time Limit Exceeded"), "{tle:?}");
    assert!(tle.contains("2s"), "{tle:?}");
    let mle = decoded(&report.stderr[1]);
    assert!(mle.contains("Memory Limit Exceeded"), "{mle:?}");
    assert!(mle.contains("100m"), "{mle:?}");
}

#[test]
fn a_broken_case_does_not_abort_the_batch() {
    let record = serde_json::json!({
        "code": b64("print(input())"),
        "language": "python",
        "input": ["%%%", b64("ok")],
        "replace": [[], []],
        "test_cases": serde_json::Value::Null,
    });
    let store = MemoryStore::with_record("sub-6", &record);
    let engine = ScriptedEngine::default();
    let calls = engine.calls();
    let (judge_url, _judge_hits) = spawn_judge(200);
    let (mut processor, _work_dir) = processor(engine, store.clone(), judge_url);

    processor.process(&envelope("sub-6")).unwrap();

    let report = &store.writes()[0];
    assert_eq!(report.stdout.len(), 2);
    assert_eq!(report.stdout[0], "");
    assert!(decoded(&report.stderr[0]).contains("invalid base64"));
    // the second case still reached the engine
    assert_eq!(calls.borrow().len(), 1);
    assert_eq!(calls.borrow()[0].stdin, "ok");
    assert_eq!(calls.borrow()[0].language, "python");
}

#[test]
fn a_judge_rejection_marks_the_record_and_still_succeeds() {
    let store = MemoryStore::with_record("sub-7", &record("c", "int main(){}", [""].as_slice()));
    let (judge_url, _judge_hits) = spawn_judge(503);
    let (mut processor, _work_dir) = processor(ScriptedEngine::default(), store.clone(), judge_url);

    // the message is still acknowledgeable
    processor.process(&envelope("sub-7")).unwrap();

    let writes = store.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].result, None);
    assert_eq!(writes[1].result.as_deref(), Some("Judge Error"));
    assert_eq!(writes[1].status, "done execution");
}

#[test]
fn an_unreachable_judge_marks_the_record_and_still_succeeds() {
    let store = MemoryStore::with_record("sub-8", &record("c", "int main(){}", [""].as_slice()));
    let (mut processor, _work_dir) =
        processor(ScriptedEngine::default(), store.clone(), unreachable_judge());

    processor.process(&envelope("sub-8")).unwrap();

    let writes = store.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].result.as_deref(), Some("Judge Error"));
}

#[test]
fn a_missing_record_fails_without_persisting() {
    let store = MemoryStore::default();
    let (mut processor, _work_dir) = processor(
        ScriptedEngine::default(),
        store.clone(),
        unreachable_judge(),
    );

    let err = processor.process(&envelope("ghost")).unwrap_err();
    assert!(err.to_string().contains("ghost"));
    assert!(store.writes().is_empty());
}

#[test]
fn a_malformed_envelope_fails_without_persisting() {
    let store = MemoryStore::default();
    let (mut processor, _work_dir) = processor(
        ScriptedEngine::default(),
        store.clone(),
        unreachable_judge(),
    );

    assert!(processor.process(b"not json").is_err());
    assert!(store.writes().is_empty());
}

#[test]
fn unsupported_languages_are_reported_per_case() {
    let store = MemoryStore::with_record("sub-9", &record("cobol", "DISPLAY 'HI'", &["", ""]));
    let engine = ScriptedEngine::default();
    let calls = engine.calls();
    let (judge_url, _judge_hits) = spawn_judge(200);
    let (mut processor, _work_dir) = processor(engine, store.clone(), judge_url);

    processor.process(&envelope("sub-9")).unwrap();

    let report = &store.writes()[0];
    assert_eq!(report.status, "done execution");
    assert_eq!(report.stderr.len(), 2);
    for payload in &report.stderr {
        assert!(decoded(payload).contains("not supported"));
    }
    assert!(calls.borrow().is_empty());
}

#[test]
fn scratch_files_are_removed_after_processing() {
    let store = MemoryStore::with_record("sub-10", &record("c", "int main(){}", [""].as_slice()));
    let (judge_url, _judge_hits) = spawn_judge(200);
    let (mut processor, work_dir) = processor(ScriptedEngine::default(), store, judge_url);

    let code_dir = work_dir.path().join("code");
    std::fs::create_dir_all(&code_dir).unwrap();
    for name in ["code.c", "input.txt", "code"] {
        std::fs::write(code_dir.join(name), "scratch").unwrap();
    }

    processor.process(&envelope("sub-10")).unwrap();

    for name in ["code.c", "input.txt", "code"] {
        assert!(!code_dir.join(name).exists(), "{name} should be gone");
    }
}
