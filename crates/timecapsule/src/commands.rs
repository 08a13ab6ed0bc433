//! Subcommand implementations.

use std::future::Future;
use std::path::PathBuf;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;
use serde_json::{Value, json};
use timecapsule_core::{
    Capsule, CapsuleContext, CapsuleListing, CapsuleRequest, Config, JobId, PendingJob,
    SmtpTransport,
};

use crate::OutputFormat;

/// Arguments of `timecapsule schedule`.
#[derive(Args, Debug)]
pub struct ScheduleArgs {
    /// Recipient address.
    #[arg(long)]
    to: String,

    /// Message text.
    #[arg(long, conflicts_with = "message_file", required_unless_present = "message_file")]
    message: Option<String>,

    /// Read the message text from a file.
    #[arg(long)]
    message_file: Option<PathBuf>,

    /// Unlock date, `YYYY-MM-DD`, in the configured zone.
    #[arg(long, required_unless_present = "at")]
    date: Option<String>,

    /// Unlock time, `HH:MM`, in the configured zone.
    #[arg(long, required_unless_present = "at")]
    time: Option<String>,

    /// Unlock instant as RFC 3339, instead of `--date`/`--time`.
    #[arg(long, conflicts_with_all = ["date", "time"])]
    at: Option<DateTime<Utc>>,

    /// File to attach. Repeatable.
    #[arg(long = "attach")]
    attachments: Vec<PathBuf>,
}

/// Runs the delivery daemon until `shutdown` resolves.
pub async fn run(config: Config, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
    let transport = SmtpTransport::from_config(&config.smtp);
    let ctx = CapsuleContext::open(config).await?;
    let guard = ctx.start(transport)?;

    let pending = ctx.list_pending_jobs().await.map(|jobs| jobs.len()).unwrap_or_default();
    tracing::info!(pending, "delivery daemon running");

    shutdown.await;
    guard.shutdown().await;
    ctx.close().await;
    tracing::info!("Time Capsule stopped");
    Ok(())
}

/// Stages attachments and submits a capsule.
pub async fn schedule(
    config: Config,
    args: ScheduleArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let ctx = CapsuleContext::open(config).await?;

    let message = match (args.message, &args.message_file) {
        (Some(text), _) => text,
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
        (None, None) => String::new(),
    };

    let staged = stage_all(&ctx, &args.attachments).await?;

    let request = match args.at {
        Some(at) => CapsuleRequest::with_unlock_at(args.to, message, at),
        None => CapsuleRequest::new(
            args.to,
            message,
            args.date.unwrap_or_default(),
            args.time.unwrap_or_default(),
        ),
    }
    .attachments(staged);

    let response = ctx.create_capsule(request).await;
    ctx.close().await;

    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Text => {
            println!("{}", response.message);
            if let Some(job_id) = &response.job_id {
                println!("job id: {job_id}");
            }
        }
    }
    if !response.accepted {
        bail!("capsule rejected");
    }
    Ok(())
}

/// Lists pending timers.
pub async fn jobs(config: Config, format: OutputFormat) -> anyhow::Result<()> {
    let ctx = CapsuleContext::open(config).await?;
    let jobs = ctx.list_pending_jobs().await?;
    ctx.close().await;

    match format {
        OutputFormat::Json => print_json(&jobs_json(&jobs))?,
        OutputFormat::Text => {
            for job in &jobs {
                println!("{}  {}", job.fire_at.to_rfc3339(), job.job_id);
            }
            println!("{} pending", jobs.len());
        }
    }
    Ok(())
}

/// Lists capsule metadata.
pub async fn capsules(config: Config, format: OutputFormat) -> anyhow::Result<()> {
    let ctx = CapsuleContext::open(config).await?;
    let zone = ctx.intake().policy().zone;
    let capsules = ctx.list_capsules().await?;
    ctx.close().await;

    match format {
        OutputFormat::Json => print_json(&capsules_json(&capsules))?,
        OutputFormat::Text => {
            for listing in &capsules {
                match listing {
                    CapsuleListing::Available(s) => println!(
                        "{:<9}  {}  {}  files={}  {}",
                        s.status.as_str(),
                        s.unlock_at.with_timezone(&zone).format("%Y-%m-%d %H:%M"),
                        s.recipient,
                        s.attachment_count,
                        s.job_id
                    ),
                    CapsuleListing::Unavailable { object } => {
                        println!("unavailable  {object}");
                    }
                }
            }
            println!("{} capsules", capsules.len());
        }
    }
    Ok(())
}

/// Shows one capsule.
pub async fn status(config: Config, job_id: &str, format: OutputFormat) -> anyhow::Result<()> {
    let ctx = CapsuleContext::open(config).await?;
    let job_id = JobId::parse(job_id)?;
    let summary = ctx.capsule_status(&job_id).await;
    ctx.close().await;
    let summary = summary?;

    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Text => {
            println!("job id:      {}", summary.job_id);
            println!("recipient:   {}", summary.recipient);
            println!("status:      {}", summary.status);
            println!("unlock at:   {}", summary.unlock_at.to_rfc3339());
            println!("created at:  {}", summary.created_at.to_rfc3339());
            if let Some(sent_at) = summary.sent_at {
                println!("sent at:     {}", sent_at.to_rfc3339());
            }
            println!("attachments: {}", summary.attachment_count);
        }
    }
    Ok(())
}

/// Sends a throwaway capsule immediately through the configured relay.
pub async fn test_email(config: Config, to: &str, format: OutputFormat) -> anyhow::Result<()> {
    let transport = SmtpTransport::from_config(&config.smtp);
    let ctx = CapsuleContext::open(config).await?;
    let dispatcher = ctx.dispatcher(transport)?;
    let now = Utc::now();
    let capsule = Capsule::new(
        JobId::generate(to, now),
        to,
        "This is a test time capsule message!",
        now,
        ctx.intake().policy().zone,
        Vec::new(),
    );
    let result = dispatcher.deliver_now(&capsule).await;
    ctx.close().await;

    let (success, message) = match &result {
        Ok(_) => (true, "Email sent successfully".to_string()),
        Err(e) => (false, e.to_string()),
    };
    match format {
        OutputFormat::Json => print_json(&json!({ "success": success, "message": message }))?,
        OutputFormat::Text => println!("{message}"),
    }
    if !success {
        bail!("test email failed");
    }
    Ok(())
}

/// Copies each file into the upload folder. On the first failure the files
/// already staged are removed again.
async fn stage_all(ctx: &CapsuleContext, paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut staged = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = async {
            let bytes = tokio::fs::read(path).await?;
            let staged = ctx.stage_upload(&name, &bytes).await?;
            Ok::<_, anyhow::Error>(staged)
        };
        match staging.await {
            Ok(p) => staged.push(p),
            Err(e) => {
                timecapsule_core::uploads::remove_files(&staged).await;
                return Err(e.context(format!("staging {}", path.display())));
            }
        }
    }
    Ok(staged)
}

fn jobs_json(jobs: &[PendingJob]) -> Value {
    json!({ "scheduled_jobs": jobs, "count": jobs.len() })
}

fn capsules_json(capsules: &[CapsuleListing]) -> Value {
    json!({ "capsules": capsules, "count": capsules.len() })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use timecapsule_core::{CapsuleStatus, CapsuleSummary};

    async fn context(dir: &std::path::Path) -> CapsuleContext {
        CapsuleContext::open(Config {
            data_dir: dir.join("data"),
            encryption_secret: Some("cli-test".into()),
            ..Config::default()
        })
        .await
        .unwrap()
    }

    fn uploads(dir: &std::path::Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir.join("data").join("uploads"))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect()
    }

    #[tokio::test]
    async fn test_stage_all_copies_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        let a = dir.path().join("a.txt");
        let b = dir.path().join("photo one.png");
        std::fs::write(&a, b"alpha").unwrap();
        std::fs::write(&b, b"\x89PNG").unwrap();

        let staged = stage_all(&ctx, &[a, b]).await.unwrap();
        assert_eq!(staged.len(), 2);
        assert_eq!(std::fs::read(&staged[0]).unwrap(), b"alpha");
        assert_eq!(
            timecapsule_core::uploads::original_name(&staged[1]),
            "photo_one.png"
        );
        assert_eq!(uploads(dir.path()).len(), 2);
        ctx.close().await;
    }

    #[tokio::test]
    async fn test_stage_all_rolls_back_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        let present = dir.path().join("a.txt");
        std::fs::write(&present, b"alpha").unwrap();
        let missing = dir.path().join("missing.pdf");

        let err = stage_all(&ctx, &[present.clone(), missing]).await.unwrap_err();
        assert!(err.to_string().contains("missing.pdf"));
        assert!(uploads(dir.path()).is_empty());
        assert!(present.exists());
        ctx.close().await;
    }

    #[test]
    fn test_jobs_json_shape() {
        let fire_at = Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap();
        let jobs = vec![PendingJob {
            job_id: JobId::parse("capsule_1_0_a@b.com").unwrap(),
            fire_at,
        }];
        let value = jobs_json(&jobs);
        assert_eq!(value["count"], 1);
        assert_eq!(value["scheduled_jobs"][0]["job_id"], "capsule_1_0_a@b.com");
        assert_eq!(value["scheduled_jobs"][0]["fire_at"], "2030-01-02T03:04:05Z");
        assert_eq!(jobs_json(&[]), json!({ "scheduled_jobs": [], "count": 0 }));
    }

    #[test]
    fn test_capsules_json_tags_each_entry() {
        let at = Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap();
        let listing = vec![
            CapsuleListing::Available(CapsuleSummary {
                job_id: JobId::parse("capsule_1_0_a@b.com").unwrap(),
                recipient: "a@b.com".into(),
                unlock_at: at,
                created_at: at,
                status: CapsuleStatus::Scheduled,
                sent_at: None,
                attachment_count: 2,
            }),
            CapsuleListing::Unavailable {
                object: "capsule_broken.enc".into(),
            },
        ];
        let value = capsules_json(&listing);
        assert_eq!(value["count"], 2);
        assert_eq!(value["capsules"][0]["state"], "available");
        assert_eq!(value["capsules"][0]["status"], "scheduled");
        assert_eq!(value["capsules"][0]["attachment_count"], 2);
        assert!(value["capsules"][0].get("message").is_none());
        assert_eq!(
            value["capsules"][1],
            json!({ "state": "unavailable", "object": "capsule_broken.enc" })
        );
    }
}
