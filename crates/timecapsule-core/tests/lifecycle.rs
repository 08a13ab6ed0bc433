//! End-to-end capsule lifecycle: intake, durable timer, dispatch.

#![allow(clippy::unwrap_used)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use timecapsule_core::{
    CapsuleContext, CapsuleListing, CapsuleRequest, CapsuleStatus, CapsuleSummary, Config,
    DeliveryError, JobId, OutboundMessage, Transport,
};

#[derive(Clone, Default)]
struct StubTransport {
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
    fail: bool,
    delay: Duration,
}

impl Transport for StubTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(DeliveryError::Transport("connection refused".into()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

fn config(dir: &Path, secret: &str) -> Config {
    let mut config = Config {
        data_dir: dir.to_path_buf(),
        encryption_secret: Some(secret.into()),
        ..Config::default()
    };
    config.smtp.sender = Some("capsules@example.com".into());
    config.scheduler.poll_interval_secs = 1;
    config.scheduler.shutdown_timeout_secs = 5;
    config
}

async fn wait_for_terminal(ctx: &CapsuleContext, job_id: &JobId) -> CapsuleSummary {
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let summary = ctx.capsule_status(job_id).await.unwrap();
            if summary.status.is_terminal() {
                return summary;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_capsule_is_delivered_and_attachments_removed() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = CapsuleContext::open(config(dir.path(), "s3cret")).await.unwrap();
    let transport = StubTransport::default();
    let guard = ctx.start(transport.clone()).unwrap();

    let file = ctx.stage_upload("photo.png", b"\x89PNG").await.unwrap();
    let unlock_at = Utc::now() + chrono::Duration::seconds(2);
    let response = ctx
        .create_capsule(CapsuleRequest::with_unlock_at("a@b.com", "hello", unlock_at).attachments([file.clone()]))
        .await;
    assert!(response.accepted, "{}", response.message);
    let job_id = response.job_id.unwrap();

    let stored = ctx.store().get(&job_id).await.unwrap();
    assert_eq!(stored.status, CapsuleStatus::Scheduled);
    assert_eq!(stored.recipient, "a@b.com");
    assert_eq!(stored.message, "hello");
    assert_eq!(stored.unlock_at, unlock_at);
    assert_eq!(stored.attachments, vec![file.clone()]);

    let pending = ctx.list_pending_jobs().await.unwrap();
    assert!(pending.iter().any(|p| p.job_id == job_id));

    let summary = wait_for_terminal(&ctx, &job_id).await;
    assert_eq!(summary.status, CapsuleStatus::Sent);
    assert!(summary.sent_at.is_some());
    assert!(!file.exists());
    assert!(ctx.list_pending_jobs().await.unwrap().is_empty());

    {
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].from, "capsules@example.com");
        assert_eq!(sent[0].recipients, vec!["a@b.com"]);
        let text = String::from_utf8_lossy(&sent[0].bytes);
        assert!(text.contains("filename=\"photo.png\""));
    }

    guard.shutdown().await;
    ctx.close().await;
}

#[tokio::test]
async fn test_failed_delivery_keeps_attachments() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = CapsuleContext::open(config(dir.path(), "s3cret")).await.unwrap();
    let guard = ctx
        .start(StubTransport {
            fail: true,
            ..StubTransport::default()
        })
        .unwrap();

    let file = ctx.stage_upload("letter.pdf", b"%PDF-1.7").await.unwrap();
    let response = ctx
        .create_capsule(
            CapsuleRequest::with_unlock_at("a@b.com", "hello", Utc::now() + chrono::Duration::seconds(1))
                .attachments([file.clone()]),
        )
        .await;
    let job_id = response.job_id.unwrap();

    let summary = wait_for_terminal(&ctx, &job_id).await;
    assert_eq!(summary.status, CapsuleStatus::Failed);
    assert!(summary.sent_at.is_none());
    assert!(file.exists());

    guard.shutdown().await;
    ctx.close().await;
}

#[tokio::test]
async fn test_timer_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let job_id = {
        let ctx = CapsuleContext::open(config(dir.path(), "s3cret")).await.unwrap();
        let response = ctx
            .create_capsule(CapsuleRequest::with_unlock_at(
                "a@b.com",
                "written before the restart",
                Utc::now() + chrono::Duration::seconds(2),
            ))
            .await;
        ctx.close().await;
        response.job_id.unwrap()
    };

    let ctx = CapsuleContext::open(config(dir.path(), "s3cret")).await.unwrap();
    assert_eq!(ctx.list_pending_jobs().await.unwrap()[0].job_id, job_id);
    let transport = StubTransport::default();
    let guard = ctx.start(transport.clone()).unwrap();

    let summary = wait_for_terminal(&ctx, &job_id).await;
    assert_eq!(summary.status, CapsuleStatus::Sent);
    assert_eq!(transport.sent.lock().unwrap().len(), 1);

    guard.shutdown().await;
    ctx.close().await;
}

#[tokio::test]
async fn test_wrong_secret_reports_capsules_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let job_id = {
        let ctx = CapsuleContext::open(config(dir.path(), "first")).await.unwrap();
        let response = ctx
            .create_capsule(CapsuleRequest::new("a@b.com", "private", "2099-01-01", "10:00"))
            .await;
        ctx.close().await;
        response.job_id.unwrap()
    };

    let ctx = CapsuleContext::open(config(dir.path(), "second")).await.unwrap();
    let listing = ctx.list_capsules().await.unwrap();
    assert_eq!(
        listing,
        vec![CapsuleListing::Unavailable {
            object: job_id.object_name()
        }]
    );
    assert!(ctx.capsule_status(&job_id).await.is_err());
    ctx.close().await;
}

#[tokio::test]
async fn test_delivery_cut_short_by_shutdown_is_retried_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), "s3cret");
    cfg.scheduler.shutdown_timeout_secs = 1;

    let job_id = {
        let ctx = CapsuleContext::open(cfg.clone()).await.unwrap();
        let guard = ctx
            .start(StubTransport {
                delay: Duration::from_secs(20),
                ..StubTransport::default()
            })
            .unwrap();
        let response = ctx
            .create_capsule(CapsuleRequest::with_unlock_at(
                "a@b.com",
                "interrupted",
                Utc::now() + chrono::Duration::milliseconds(200),
            ))
            .await;
        let job_id = response.job_id.unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            while !ctx.list_pending_jobs().await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();
        guard.shutdown().await;
        ctx.close().await;
        job_id
    };

    let ctx = CapsuleContext::open(cfg).await.unwrap();
    let pending = ctx.list_pending_jobs().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job_id, job_id);
    assert_eq!(
        ctx.capsule_status(&job_id).await.unwrap().status,
        CapsuleStatus::Scheduled
    );

    let transport = StubTransport::default();
    let guard = ctx.start(transport.clone()).unwrap();
    let summary = wait_for_terminal(&ctx, &job_id).await;
    assert_eq!(summary.status, CapsuleStatus::Sent);
    assert_eq!(transport.sent.lock().unwrap().len(), 1);

    guard.shutdown().await;
    ctx.close().await;
}
