//! Transfer Orchestrator
//!
//! Sits between the triggers (idle poll timer, `ai_work` from the glasses,
//! backend commands, explicit requests) and the link. Frames pulled by the
//! idle poll are buffered until the next processing job consumes them; only
//! the newest `max_buffered_frames` are kept.
//!
//! `Busy` and `NotReady` from the link are treated as "skip this round" for
//! background work. The idle poll does not run while a job is in progress and
//! restarts its period once the job is done. Backend commands keep being
//! polled during a job.

use crate::application::collaborators::{
    AiAnalyzer, BackendCommand, BackendSync, ImageEnhancer, RegionSplitter,
};
use crate::domain::answer::{AnalysisResult, AnswerSubmission};
use crate::domain::models::{
    answer_destination, AppEvent, CapturedImage, DeviceStatus, MessageSeverity, StatusMessage,
};
use crate::domain::prompts::{self, PromptBook};
use crate::domain::settings::CompanionSettings;
use crate::infrastructure::bluetooth::acquisition::Acquired;
use crate::infrastructure::bluetooth::command::PendingCommand;
use crate::infrastructure::bluetooth::error::TransferError;
use crate::infrastructure::bluetooth::protocol::DeviceCommand;
use crate::infrastructure::bluetooth::LinkHandle;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct Collaborators {
    pub enhancer: Arc<dyn ImageEnhancer>,
    pub splitter: Arc<dyn RegionSplitter>,
    pub analyzer: Arc<dyn AiAnalyzer>,
    pub backend: Arc<dyn BackendSync>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// `None` disables the idle poll
    pub idle_poll: Option<Duration>,
    pub max_buffered_frames: usize,
    pub command_poll: Option<Duration>,
    pub client_id: String,
    pub default_subject: String,
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &CompanionSettings) -> Self {
        Self {
            idle_poll: (settings.idle_poll_enabled && settings.idle_poll_interval_ms > 0)
                .then(|| Duration::from_millis(settings.idle_poll_interval_ms)),
            max_buffered_frames: settings.max_buffered_frames.max(1),
            command_poll: (settings.command_poll_interval_ms > 0)
                .then(|| Duration::from_millis(settings.command_poll_interval_ms)),
            client_id: settings.client_id.clone(),
            default_subject: settings.default_subject.clone(),
        }
    }
}

/// Outcome of one processing job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    pub subject: String,
    pub images: usize,
    pub regions: usize,
    pub analyzed: usize,
    pub synced: usize,
    pub uploaded: usize,
}

/// Dispatcher command for a backend command, `None` when the type is unknown.
pub fn map_backend_command(command: &BackendCommand) -> Option<PendingCommand> {
    let mapped = match command.kind.as_str() {
        "display_novel" => PendingCommand::with_argument(
            DeviceCommand::DisplayTxt,
            format!("/novel/{}", command.file_name),
        ),
        "display_music" => PendingCommand::with_argument(
            DeviceCommand::DisplayJson,
            format!("/music/{}", command.file_name),
        ),
        "play_music" => PendingCommand::with_argument(
            DeviceCommand::PlayMp3,
            format!("/music/{}", command.file_name),
        ),
        "stop_music" => PendingCommand::new(DeviceCommand::StopMp3),
        _ => return None,
    };
    Some(mapped)
}

pub struct TransferOrchestrator {
    link: LinkHandle,
    collaborators: Collaborators,
    prompts: PromptBook,
    config: OrchestratorConfig,
    captured: Vec<CapturedImage>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl TransferOrchestrator {
    pub fn new(
        link: LinkHandle,
        collaborators: Collaborators,
        prompts: PromptBook,
        config: OrchestratorConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            link,
            collaborators,
            prompts,
            config,
            captured: Vec::new(),
            event_sender,
        }
    }

    pub fn buffered_images(&self) -> usize {
        self.captured.len()
    }

    /// Drive the background triggers until the link's event channel closes.
    ///
    /// Every link event is forwarded to this orchestrator's event sender.
    pub async fn run(mut self, mut link_events: mpsc::UnboundedReceiver<AppEvent>) {
        let mut idle = self.config.idle_poll.map(skipping_interval);
        let mut commands = self.config.command_poll.map(skipping_interval);
        info!(
            "Orchestrator started (idle poll {:?}, command poll {:?})",
            self.config.idle_poll, self.config.command_poll
        );

        loop {
            tokio::select! {
                event = link_events.recv() => match event {
                    Some(AppEvent::DeviceStatus(DeviceStatus::AiWork)) => {
                        self.forward(AppEvent::DeviceStatus(DeviceStatus::AiWork));
                        let subject = self.config.default_subject.clone();
                        self.run_device_job(&subject, &mut link_events, &mut commands).await;
                        if let Some(idle) = idle.as_mut() {
                            idle.reset();
                        }
                    }
                    Some(event) => self.forward(event),
                    None => break,
                },
                _ = tick(&mut idle) => self.idle_capture().await,
                _ = tick(&mut commands) => {
                    self.poll_backend_commands().await;
                }
            }
        }
        info!("Orchestrator stopped");
    }

    /// Pull one frame into the buffer. Skips silently when the link is busy
    /// or not ready.
    pub async fn idle_capture(&mut self) {
        match self.link.acquire_image().await {
            Ok(Acquired::Image(image)) => {
                debug!("Buffered frame of {} bytes", image.data.len());
                self.captured.push(image);
                let limit = self.config.max_buffered_frames.max(1);
                if self.captured.len() > limit {
                    let dropped = self.captured.len() - limit;
                    self.captured.drain(..dropped);
                    debug!("Frame buffer full, dropped {} old frame(s)", dropped);
                }
            }
            Ok(Acquired::Empty) => trace!("No frame on the glasses"),
            Err(TransferError::Busy) | Err(TransferError::NotReady) => {
                trace!("Idle poll skipped")
            }
            Err(e) => warn!("Idle capture failed: {}", e),
        }
    }

    /// Run a processing job for `subject` on the buffered frames, or on a
    /// freshly captured one when nothing is buffered.
    pub async fn process(&mut self, subject: &str) -> anyhow::Result<JobReport> {
        let images = std::mem::take(&mut self.captured);
        let report = process_job(
            &self.link,
            &self.collaborators,
            &self.prompts,
            images,
            subject,
        )
        .await?;
        self.send_log(
            format!(
                "Processed {} region(s) for {}: {} uploaded",
                report.regions, report.subject, report.uploaded
            ),
            MessageSeverity::Success,
        );
        Ok(report)
    }

    /// Fetch backend commands and hand them to the dispatcher. Returns how
    /// many were accepted by the link.
    pub async fn poll_backend_commands(&self) -> usize {
        let pending = match self
            .collaborators
            .backend
            .pending_commands(&self.config.client_id)
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Command poll failed: {:#}", e);
                return 0;
            }
        };

        let mut dispatched = 0;
        for command in &pending {
            let Some(mapped) = map_backend_command(command) else {
                warn!("Ignoring unknown backend command {:?}", command.kind);
                continue;
            };
            info!(
                "Backend command {} -> {} {:?}",
                command.kind, mapped.name, mapped.argument
            );
            match self.link.send_command(mapped).await {
                Ok(()) => dispatched += 1,
                Err(e) => warn!("Backend command {} not delivered: {}", command.kind, e),
            }
        }
        dispatched
    }

    /// A job requested by the glasses. Further `ai_work` requests that arrive
    /// meanwhile are dropped; other events and backend commands keep flowing.
    async fn run_device_job(
        &mut self,
        subject: &str,
        link_events: &mut mpsc::UnboundedReceiver<AppEvent>,
        commands: &mut Option<Interval>,
    ) {
        self.send_log(
            format!("Glasses requested processing ({})", subject),
            MessageSeverity::Info,
        );
        let images = std::mem::take(&mut self.captured);
        let job = process_job(
            &self.link,
            &self.collaborators,
            &self.prompts,
            images,
            subject,
        );
        tokio::pin!(job);

        let mut events_open = true;
        let outcome = loop {
            tokio::select! {
                outcome = &mut job => break outcome,
                event = link_events.recv(), if events_open => match event {
                    Some(AppEvent::DeviceStatus(DeviceStatus::AiWork)) => {
                        warn!("Already processing, ignoring ai_work");
                    }
                    Some(event) => self.forward(event),
                    None => events_open = false,
                },
                _ = tick(commands) => {
                    self.poll_backend_commands().await;
                }
            }
        };

        match outcome {
            Ok(report) => self.send_log(
                format!(
                    "Processed {} region(s) for {}: {} uploaded",
                    report.regions, report.subject, report.uploaded
                ),
                MessageSeverity::Success,
            ),
            Err(e) => {
                error!("Processing job failed: {:#}", e);
                self.send_log(format!("Processing failed: {:#}", e), MessageSeverity::Error);
            }
        }
    }

    fn forward(&self, event: AppEvent) {
        let _ = self.event_sender.send(event);
    }

    fn send_log(&self, message: String, severity: MessageSeverity) {
        self.forward(AppEvent::LogMessage(StatusMessage { message, severity }));
    }
}

/// enhance -> split -> analyze -> backend -> glasses.
async fn process_job(
    link: &LinkHandle,
    collaborators: &Collaborators,
    prompts: &PromptBook,
    mut images: Vec<CapturedImage>,
    subject: &str,
) -> anyhow::Result<JobReport> {
    if images.is_empty() {
        match link
            .acquire_image()
            .await
            .context("Image acquisition failed")?
        {
            Acquired::Image(image) => images.push(image),
            Acquired::Empty => anyhow::bail!("The glasses have no image to process"),
        }
    }
    info!("Processing {} image(s) as {}", images.len(), subject);

    let mut enhanced = Vec::with_capacity(images.len());
    for (i, image) in images.iter().enumerate() {
        let bytes = collaborators
            .enhancer
            .enhance(&image.data)
            .await
            .with_context(|| format!("Enhancement of image {} failed", i + 1))?;
        enhanced.push(bytes);
    }

    let regions = if prompts::splits_regions(subject) {
        let mut regions = Vec::new();
        for (i, page) in enhanced.into_iter().enumerate() {
            match collaborators.splitter.split(&page).await {
                Ok(parts) if !parts.is_empty() => regions.extend(parts),
                Ok(_) => {
                    warn!("Image {} could not be split, analyzing it whole", i + 1);
                    regions.push(page);
                }
                Err(e) => {
                    warn!("Splitting image {} failed: {:#}", i + 1, e);
                    regions.push(page);
                }
            }
        }
        regions
    } else {
        enhanced
    };

    let mut report = JobReport {
        subject: subject.to_string(),
        images: images.len(),
        regions: regions.len(),
        ..Default::default()
    };
    if !prompts::runs_analysis(subject) {
        info!("Subject {} skips analysis", subject);
        return Ok(report);
    }

    let device_id = link
        .snapshot()
        .await
        .device_id
        .unwrap_or_else(|| "unknown".to_string());
    let prompt = prompts.prompt_for(subject);
    let total = regions.len();

    for (i, region) in regions.iter().enumerate() {
        let index = i + 1;
        let analysis = match collaborators.analyzer.analyze(region, &prompt).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!("Analysis {}/{} failed: {:#}", index, total, e);
                continue;
            }
        };
        report.analyzed += 1;

        let result = AnalysisResult::new(subject, index, total, analysis);
        let answer_id = Uuid::new_v4().to_string();
        let submission = AnswerSubmission::new(&answer_id, &device_id, &result)?;

        match collaborators.backend.submit_answer(&submission).await {
            Ok(()) => report.synced += 1,
            Err(e) => warn!("Backend sync of answer {} failed: {:#}", answer_id, e),
        }

        let destination = answer_destination(&answer_id);
        match link
            .upload(&destination, submission.content.into_bytes())
            .await
        {
            Ok(upload) => {
                debug!("Answer {} on the glasses ({} bytes)", index, upload.bytes);
                report.uploaded += 1;
            }
            Err(e) => warn!("Answer {} not delivered to the glasses: {}", index, e),
        }
    }

    info!(
        "Job done: {}/{} analyzed, {} synced, {} uploaded",
        report.analyzed, total, report.synced, report.uploaded
    );
    Ok(report)
}

fn skipping_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
