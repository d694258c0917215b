use oxide_fetch::bot::views;
use oxide_fetch::download::SessionRegistry;
use oxide_fetch::pipeline::{Pipeline, PipelineOutcome, RunOptions, Stage};
use oxide_fetch::testing::{
    write_zip, FakeEngine, FakeProber, RecordingNotifier, RecordingSink,
};
use oxide_fetch::upload::{DeliveryMode, ItemOutcome};
use oxide_fetch::workspace::Workspace;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn zip_bytes(dir: &Path, entries: &[(&str, &str)]) -> anyhow::Result<Vec<u8>> {
    let path = dir.join("fixture.zip");
    write_zip(&path, entries)?;
    Ok(std::fs::read(path)?)
}

#[tokio::test]
async fn archive_is_extracted_flattened_and_delivered_in_order() -> anyhow::Result<()> {
    tokio::time::pause();
    let dir = tempfile::tempdir()?;
    let content = zip_bytes(
        dir.path(),
        &[
            ("bundle/b.txt", "b"),
            ("bundle/sub/c.txt", "c"),
            ("bundle/a.txt", "a"),
        ],
    )?;
    let engine = Arc::new(FakeEngine::new("archive.zip").with_content(content));
    let workspace = Workspace::new(dir.path().join("downloads"), dir.path().join("extracts"));
    let pipeline = Pipeline::new(engine.clone(), workspace.clone(), Arc::new(FakeProber::new(1, 1)));
    let notifier = RecordingNotifier::new();
    let sink = RecordingSink::new();

    let prepared = pipeline.prepare(4, "https://example.com/archive.zip").await?;
    assert!(prepared.is_archive);
    let session_id = prepared.session_id;

    let handle = engine
        .last_handle()
        .ok_or_else(|| anyhow::anyhow!("engine opened no handle"))?;
    let finisher = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.set_progress(512, Some(1024));
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.finish();
    });

    let options = RunOptions {
        extract: true,
        mode: DeliveryMode::Document,
        ..RunOptions::default()
    };
    let outcome = pipeline.run(session_id, options, &notifier, &sink).await;
    finisher.await?;

    let nested = Path::new("sub").join("c.txt").to_string_lossy().into_owned();
    assert_eq!(
        sink.attempted_captions(),
        vec!["a.txt".to_string(), "b.txt".to_string(), nested.clone()]
    );

    let first = sink.attempt_times("a.txt")[0];
    let second = sink.attempt_times("b.txt")[0];
    let third = sink.attempt_times(&nested)[0];
    assert_eq!(second - first, Duration::from_secs(8));
    assert_eq!(third - second, Duration::from_secs(8));

    assert_eq!(
        notifier.stages(),
        vec![Stage::Extracting, Stage::Uploading { items: 3 }]
    );
    assert_eq!(notifier.finished_count(), 1);
    assert!(notifier
        .progress_texts()
        .iter()
        .any(|text| text.contains("(50.00%)")));

    let PipelineOutcome::Delivered { ref report } = outcome else {
        anyhow::bail!("unexpected outcome {outcome:?}");
    };
    assert!(report
        .items
        .iter()
        .all(|item| item.outcome == ItemOutcome::Delivered { attempts: 1 }));
    assert!(views::final_message(&outcome).starts_with("Upload complete."));

    assert!(!workspace.download_dir(4, session_id).exists());
    assert!(!workspace.extract_dir(4, session_id).exists());
    assert!(pipeline.registry().is_empty().await);
    Ok(())
}

#[tokio::test]
async fn extract_request_on_plain_file_delivers_it_unchanged() -> anyhow::Result<()> {
    tokio::time::pause();
    let dir = tempfile::tempdir()?;
    let engine = Arc::new(FakeEngine::new("notes.txt").with_content(b"hello".to_vec()));
    let workspace = Workspace::new(dir.path().join("d"), dir.path().join("e"));
    let pipeline = Pipeline::new(engine.clone(), workspace, Arc::new(FakeProber::new(1, 1)));
    let notifier = RecordingNotifier::new();
    let sink = RecordingSink::new();

    let prepared = pipeline.prepare(9, "https://example.com/notes.txt").await?;
    assert!(!prepared.is_archive);
    let handle = engine
        .last_handle()
        .ok_or_else(|| anyhow::anyhow!("engine opened no handle"))?;
    handle.finish();

    let options = RunOptions {
        extract: true,
        ..RunOptions::default()
    };
    pipeline
        .run(prepared.session_id, options, &notifier, &sink)
        .await;

    assert_eq!(sink.attempted_captions(), vec!["notes.txt".to_string()]);
    assert_eq!(notifier.stages(), vec![Stage::Uploading { items: 1 }]);
    Ok(())
}

#[tokio::test]
async fn cancelled_session_leaves_no_partial_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = Arc::new(FakeEngine::new("movie.mkv"));
    let registry = SessionRegistry::new(
        engine.clone(),
        Workspace::new(dir.path().join("d"), dir.path().join("e")),
    );

    let id = registry.create(7, "https://example.com/movie.mkv").await?;
    registry.start(id).await?;
    let handle = engine
        .last_handle()
        .ok_or_else(|| anyhow::anyhow!("engine opened no handle"))?;
    assert!(handle.path().exists());

    assert!(registry.cancel(id).await);
    assert!(!handle.path().exists());
    assert!(handle.was_cancelled());
    assert!(!registry.contains(id).await);
    assert!(!registry.cancel(id).await);
    Ok(())
}

#[tokio::test]
async fn same_owner_requests_do_not_clear_each_other() -> anyhow::Result<()> {
    tokio::time::pause();
    let dir = tempfile::tempdir()?;
    let archive = zip_bytes(
        dir.path(),
        &[("a.txt", "a"), ("b.txt", "b"), ("c.txt", "c")],
    )?;
    let engine = Arc::new(
        FakeEngine::new("unused.bin")
            .with_route("https://example.com/batch.zip", "batch.zip", archive)
            .with_route("https://example.com/single.txt", "single.txt", b"s".to_vec()),
    );
    let workspace = Workspace::new(dir.path().join("d"), dir.path().join("e"));
    let pipeline = Pipeline::new(engine.clone(), workspace.clone(), Arc::new(FakeProber::new(1, 1)));

    let batch = pipeline.prepare(4, "https://example.com/batch.zip").await?;
    let batch_handle = engine
        .last_handle()
        .ok_or_else(|| anyhow::anyhow!("engine opened no handle"))?;
    let single = pipeline.prepare(4, "https://example.com/single.txt").await?;
    let single_handle = engine
        .last_handle()
        .ok_or_else(|| anyhow::anyhow!("engine opened no handle"))?;

    // The single file finishes and is cleaned up while the batch is still uploading
    let finisher = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        batch_handle.finish();
        tokio::time::sleep(Duration::from_millis(4500)).await;
        single_handle.finish();
    });

    let (batch_notifier, batch_sink) = (RecordingNotifier::new(), RecordingSink::new());
    let (single_notifier, single_sink) = (RecordingNotifier::new(), RecordingSink::new());
    let batch_options = RunOptions {
        extract: true,
        ..RunOptions::default()
    };
    let (batch_outcome, single_outcome) = tokio::join!(
        pipeline.run(batch.session_id, batch_options, &batch_notifier, &batch_sink),
        pipeline.run(single.session_id, RunOptions::default(), &single_notifier, &single_sink),
    );
    finisher.await?;

    assert!(matches!(batch_outcome, PipelineOutcome::Delivered { .. }));
    assert!(matches!(single_outcome, PipelineOutcome::Delivered { .. }));

    // The single run ended between the first and the last batch item
    let single_sent = single_sink.attempt_times("single.txt")[0];
    assert!(batch_sink.attempt_times("a.txt")[0] < single_sent);
    assert!(single_sent < batch_sink.attempt_times("c.txt")[0]);

    assert_eq!(
        batch_sink.presence_at_send(),
        vec![
            ("a.txt".to_string(), true),
            ("b.txt".to_string(), true),
            ("c.txt".to_string(), true),
        ]
    );
    assert_eq!(
        single_sink.presence_at_send(),
        vec![("single.txt".to_string(), true)]
    );

    for id in [batch.session_id, single.session_id] {
        assert!(!workspace.download_dir(4, id).exists());
        assert!(!workspace.extract_dir(4, id).exists());
    }
    assert!(pipeline.registry().is_empty().await);
    Ok(())
}
