use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use smartvision_contracts::events::RecordingSink;
use smartvision_contracts::{BatchRequest, CommitStrategy, FatalError};
use smartvision_engine::client::{ClientError, DescriptionClient, DescriptionRequest};
use smartvision_engine::iptc::{IptcContainer, CAPTION_ABSTRACT};
use smartvision_engine::lock::{HolderProbe, LockError, ProcessHandle};
use smartvision_engine::{BatchOrchestrator, BatchState, EngineConfig};

enum Reply {
    Describe(&'static str, &'static str, &'static [&'static str]),
    Text(&'static str),
    ServiceError(&'static str),
    Unreachable,
}

/// Answers description calls from a fixed script, in call order.
struct ScriptedClient {
    replies: Mutex<VecDeque<Reply>>,
    instructions: Mutex<Vec<String>>,
    credential_missing: bool,
}

impl ScriptedClient {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            instructions: Mutex::new(Vec::new()),
            credential_missing: false,
        })
    }

    fn without_credential() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            instructions: Mutex::new(Vec::new()),
            credential_missing: true,
        })
    }

    fn instructions(&self) -> Vec<String> {
        self.instructions
            .lock()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }
}

impl DescriptionClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    fn ensure_ready(&self) -> Result<(), FatalError> {
        if self.credential_missing {
            return Err(FatalError::CredentialUnavailable {
                reason: "no key in test".to_string(),
            });
        }
        Ok(())
    }

    fn describe(&self, request: &DescriptionRequest<'_>) -> Result<Value, ClientError> {
        if let Ok(mut rows) = self.instructions.lock() {
            rows.push(request.instruction());
        }
        let reply = self
            .replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.pop_front());
        match reply {
            Some(Reply::Describe(title, description, keywords)) => Ok(chat(
                &json!({"title": title, "description": description, "keywords": keywords})
                    .to_string(),
            )),
            Some(Reply::Text(text)) => Ok(chat(text)),
            Some(Reply::ServiceError(message)) => Err(ClientError::Service(message.to_string())),
            Some(Reply::Unreachable) => Err(ClientError::Fatal(FatalError::ServiceUnreachable {
                reason: "connection refused".to_string(),
            })),
            None => Err(ClientError::Service("script exhausted".to_string())),
        }
    }
}

struct NoHolders;

impl HolderProbe for NoHolders {
    fn name(&self) -> &'static str {
        "none"
    }

    fn enumerate_holders(&self, _path: &Path) -> Result<Vec<ProcessHandle>, LockError> {
        Ok(Vec::new())
    }
}

fn chat(content: &str) -> Value {
    json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
}

fn config() -> EngineConfig {
    EngineConfig {
        lock_settle: Duration::ZERO,
        exiftool: "smartvision-missing-exiftool".to_string(),
        ..EngineConfig::default()
    }
}

fn write_jpeg(path: &Path) -> anyhow::Result<()> {
    image::RgbImage::from_pixel(8, 8, image::Rgb([200, 120, 40])).save(path)?;
    Ok(())
}

fn orchestrator(
    request: BatchRequest,
    client: Arc<ScriptedClient>,
    sink: Arc<RecordingSink>,
) -> BatchOrchestrator {
    BatchOrchestrator::new(request, config(), client, sink).with_holder_probe(Box::new(NoHolders))
}

fn names_in(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        names.push(entry?.file_name().to_string_lossy().to_string());
    }
    names.sort();
    Ok(names)
}

fn source_with(names: &[&str]) -> anyhow::Result<(tempfile::TempDir, PathBuf, PathBuf)> {
    let temp = tempfile::tempdir()?;
    let src = temp.path().join("in");
    let dest = temp.path().join("out");
    fs::create_dir(&src)?;
    for name in names {
        write_jpeg(&src.join(name))?;
    }
    Ok((temp, src, dest))
}

#[test]
fn empty_discovery_aborts_without_calling_the_service() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    fs::write(temp.path().join("notes.txt"), b"not an image")?;
    let client = ScriptedClient::new(vec![Reply::Describe("t", "d", &[])]);
    let sink = Arc::new(RecordingSink::new());
    let mut batch = orchestrator(
        BatchRequest::new("Describe", temp.path(), CommitStrategy::Embed),
        client.clone(),
        sink.clone(),
    );

    let err = batch
        .run()
        .err()
        .ok_or_else(|| anyhow::anyhow!("batch should abort"))?;

    assert_eq!(err.kind(), "empty_discovery");
    assert_eq!(err.exit_code(), 2);
    assert_eq!(batch.state(), BatchState::FatalAbort);
    assert!(client.instructions().is_empty());
    assert!(sink.kinds().contains(&"batch_fatal".to_string()));
    Ok(())
}

#[test]
fn missing_credential_aborts_before_any_item() -> anyhow::Result<()> {
    let (_temp, src, dest) = source_with(&["a.jpg", "b.jpg"])?;
    let client = ScriptedClient::without_credential();
    let mut batch = orchestrator(
        BatchRequest::new("Describe", &src, CommitStrategy::Ledger).with_destination(&dest),
        client.clone(),
        Arc::new(RecordingSink::new()),
    );

    let err = batch.run().err().map(|err| err.kind());

    assert_eq!(err, Some("credential_unavailable"));
    assert!(client.instructions().is_empty());
    assert!(!dest.exists());
    assert_eq!(names_in(&src)?, vec!["a.jpg", "b.jpg"]);
    Ok(())
}

#[test]
fn existing_caption_enriches_prompt_and_is_replaced() -> anyhow::Result<()> {
    let (_temp, src, dest) = source_with(&["a.jpg"])?;
    let mut container = IptcContainer::empty();
    container.set(CAPTION_ABSTRACT, "sunset over hills");
    container.write_file(&src.join("a.jpg"))?;

    let client = ScriptedClient::new(vec![Reply::Describe(
        "Sunset Vista",
        "A glowing orange sky over rolling hills.",
        &["sunset", "hills", "sky"],
    )]);
    let mut batch = orchestrator(
        BatchRequest::new("Describe this photo", &src, CommitStrategy::Embed)
            .with_destination(&dest)
            .with_author("Ann Lee"),
        client.clone(),
        Arc::new(RecordingSink::new()),
    );

    let stats = batch.run()?;

    assert_eq!((stats.processed_count, stats.unprocessed_count), (1, 0));
    assert_eq!(
        client.instructions(),
        vec!["Describe this photo. Use the following context to enhance your response: sunset over hills"]
    );
    assert!(!src.join("a.jpg").exists());
    let written = IptcContainer::read_file(&dest.join("a.jpg"))?
        .ok_or_else(|| anyhow::anyhow!("destination has no IPTC block"))?;
    assert_eq!(written.object_name().as_deref(), Some("Sunset Vista"));
    assert_eq!(
        written.caption().as_deref(),
        Some("A glowing orange sky over rolling hills.")
    );
    assert_eq!(written.keywords(), vec!["sunset", "hills", "sky"]);
    assert_eq!(written.by_line().as_deref(), Some("Ann Lee"));
    assert!(image::open(dest.join("a.jpg")).is_ok());
    Ok(())
}

#[test]
fn unparsable_response_skips_only_that_image() -> anyhow::Result<()> {
    let (_temp, src, dest) = source_with(&["a.jpg", "b.jpg", "c.jpg"])?;
    let original_b = fs::read(src.join("b.jpg"))?;
    let client = ScriptedClient::new(vec![
        Reply::Describe("A", "First image.", &["one"]),
        Reply::Text("Sorry, I can't describe this picture."),
        Reply::Describe("C", "Third image.", &["three"]),
    ]);
    let sink = Arc::new(RecordingSink::new());
    let mut batch = orchestrator(
        BatchRequest::new("Describe", &src, CommitStrategy::Embed).with_destination(&dest),
        client,
        sink.clone(),
    );

    let stats = batch.run()?;

    assert_eq!(stats.total, 3);
    assert_eq!((stats.processed_count, stats.unprocessed_count), (2, 1));
    assert!(stats.is_balanced());
    assert_eq!(names_in(&src)?, vec!["b.jpg"]);
    assert_eq!(fs::read(src.join("b.jpg"))?, original_b);
    assert_eq!(names_in(&dest)?, vec!["a.jpg", "c.jpg"]);
    assert_eq!(batch.state(), BatchState::Done);

    let failures: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|event| event.kind == "item_failed")
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].fields.get("image"), Some(&json!("b.jpg")));
    assert_eq!(failures[0].fields.get("error_kind"), Some(&json!("parse")));
    Ok(())
}

#[test]
fn ledger_has_one_row_per_processed_image() -> anyhow::Result<()> {
    let (_temp, src, dest) = source_with(&["1.jpg", "2.jpg", "3.jpg", "4.jpg", "5.JPG"])?;
    fs::write(src.join("readme.txt"), b"skip me")?;
    let before = names_in(&src)?;
    let client = ScriptedClient::new(vec![
        Reply::Describe("One", "First.", &["a"]),
        Reply::Describe("Two", "Second, with a comma.", &["b", "c"]),
        Reply::Text("{\"title\": \"\", \"description\": \"blank title\"}"),
        Reply::Describe("Four", "Fourth.", &[]),
        Reply::Describe("Five", "Fifth.", &["e"]),
    ]);
    let mut batch = orchestrator(
        BatchRequest::new("Describe", &src, CommitStrategy::Ledger).with_destination(&dest),
        client,
        Arc::new(RecordingSink::new()),
    );

    let stats = batch.run()?;

    assert_eq!((stats.processed_count, stats.unprocessed_count), (4, 1));
    let ledgers = names_in(&dest)?;
    assert_eq!(ledgers.len(), 1);
    assert!(ledgers[0].ends_with(".csv"));
    let text = fs::read_to_string(dest.join(&ledgers[0]))?;
    let lines: Vec<&str> = text.split("\r\n").filter(|line| !line.is_empty()).collect();
    assert_eq!(lines[0], "image_name,title,description,keywords");
    assert_eq!(lines.len() as u64 - 1, stats.processed_count);
    assert_eq!(lines[2], "2.jpg,Two,\"Second, with a comma.\",\"b,c\"");
    assert!(!text.contains("3.jpg"));
    assert_eq!(names_in(&src)?, before);
    Ok(())
}

#[test]
fn service_errors_are_per_item() -> anyhow::Result<()> {
    let (_temp, src, _dest) = source_with(&["a.jpg", "b.jpg"])?;
    let client = ScriptedClient::new(vec![
        Reply::ServiceError("OpenAI request failed (429): rate limited"),
        Reply::Describe("B", "Second.", &["b"]),
    ]);
    let sink = Arc::new(RecordingSink::new());
    let mut batch = orchestrator(
        BatchRequest::new("Describe", &src, CommitStrategy::Embed),
        client,
        sink.clone(),
    );

    let stats = batch.run()?;

    assert_eq!((stats.processed_count, stats.unprocessed_count), (1, 1));
    assert!(sink.kinds().contains(&"in_place_rewrite".to_string()));
    assert_eq!(names_in(&src)?, vec!["a.jpg", "b.jpg"]);
    Ok(())
}

#[test]
fn unreachable_service_stops_the_batch() -> anyhow::Result<()> {
    let (_temp, src, dest) = source_with(&["a.jpg", "b.jpg", "c.jpg"])?;
    let client = ScriptedClient::new(vec![
        Reply::Describe("A", "First.", &["a"]),
        Reply::Unreachable,
        Reply::Describe("C", "Third.", &["c"]),
    ]);
    let sink = Arc::new(RecordingSink::new());
    let mut batch = orchestrator(
        BatchRequest::new("Describe", &src, CommitStrategy::Embed).with_destination(&dest),
        client.clone(),
        sink.clone(),
    );

    let err = batch.run().err().map(|err| err.kind());

    assert_eq!(err, Some("service_unreachable"));
    assert_eq!(client.instructions().len(), 2);
    assert_eq!(names_in(&src)?, vec!["b.jpg", "c.jpg"]);
    assert_eq!(names_in(&dest)?, vec!["a.jpg"]);
    assert!(!sink.kinds().contains(&"batch_finished".to_string()));
    Ok(())
}

#[test]
fn events_carry_the_batch_id_and_close_with_a_summary() -> anyhow::Result<()> {
    let (_temp, src, dest) = source_with(&["a.jpg"])?;
    let client = ScriptedClient::new(vec![Reply::Describe("A", "First.", &["a"])]);
    let sink = Arc::new(RecordingSink::new());
    let mut batch = orchestrator(
        BatchRequest::new("Describe", &src, CommitStrategy::Ledger).with_destination(&dest),
        client,
        sink.clone(),
    );

    batch.run()?;

    let events = sink.events();
    assert!(events.iter().all(|event| event.batch_id == batch.batch_id()));
    let last = events
        .iter()
        .rev()
        .find(|event| event.kind == "batch_finished")
        .ok_or_else(|| anyhow::anyhow!("no summary event"))?;
    assert!(last
        .message
        .starts_with("Images processed: 1, unprocessed: 0, processing time: "));
    Ok(())
}
